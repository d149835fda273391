//! Host bridge and NAT plumbing.
//!
//! The shared bridge is process-wide state: created at most once per run,
//! with its on-disk existence (the host link table) authoritative over any
//! in-memory cache. A missing-bridge probe is not an error; it drives the
//! create path.

use std::net::Ipv4Addr;

use scorch_networking::Ipv4Subnet;
use tokio::process::Command;
use tracing::{debug, info};

use super::NetError;

/// Run an `ip` command, capturing stderr into the error.
pub(crate) async fn run_ip(args: &[&str]) -> Result<(), NetError> {
    run_tool("ip", args).await
}

/// Run an `iptables` command, capturing stderr into the error.
pub(crate) async fn run_iptables(args: &[&str]) -> Result<(), NetError> {
    run_tool("iptables", args).await
}

async fn run_tool(tool: &str, args: &[&str]) -> Result<(), NetError> {
    let output = Command::new(tool).args(args).output().await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            NetError::ToolUnavailable(tool.to_string())
        } else {
            NetError::Io(e)
        }
    })?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let command = format!("{} {}", tool, args.join(" "));
    if stderr.contains("Operation not permitted") || stderr.contains("Permission denied") {
        return Err(NetError::PermissionDenied { command });
    }
    Err(NetError::CommandFailed(format!(
        "{command}: {}",
        stderr.trim()
    )))
}

/// Probe the host link table for an interface. Probe failures (including a
/// missing `ip` tool) read as absent.
pub async fn link_exists(name: &str) -> bool {
    Command::new("ip")
        .args(["link", "show", "dev", name])
        .output()
        .await
        .map(|out| out.status.success())
        .unwrap_or(false)
}

/// Ensure the bridge exists, carries the gateway address, and is up.
pub async fn ensure_bridge(
    name: &str,
    gateway: Ipv4Addr,
    subnet: Ipv4Subnet,
) -> Result<(), NetError> {
    if link_exists(name).await {
        // Cache-hit path: just make sure it is up.
        run_ip(&["link", "set", "dev", name, "up"]).await?;
        debug!(bridge = %name, "Bridge already present");
        return Ok(());
    }

    if let Err(e) = run_ip(&["link", "add", name, "type", "bridge"]).await {
        // A concurrent creator may have won the race.
        if !link_exists(name).await {
            return Err(match e {
                NetError::PermissionDenied { .. } | NetError::ToolUnavailable(_) => e,
                other => NetError::BridgeCreateFailed(other.to_string()),
            });
        }
    }

    let cidr = format!("{}/{}", gateway, subnet.prefix_len());
    run_ip(&["addr", "add", &cidr, "dev", name])
        .await
        .map_err(|e| match e {
            NetError::PermissionDenied { .. } => e,
            other => NetError::BridgeCreateFailed(other.to_string()),
        })?;
    run_ip(&["link", "set", "dev", name, "up"])
        .await
        .map_err(|e| match e {
            NetError::PermissionDenied { .. } => e,
            other => NetError::BridgeCreateFailed(other.to_string()),
        })?;

    info!(bridge = %name, gateway = %cidr, "Bridge created");
    Ok(())
}

/// Masquerade rule for guest traffic leaving the subnet.
fn masquerade_rule(subnet: &Ipv4Subnet, bridge: &str) -> Vec<String> {
    vec![
        "-t".to_string(),
        "nat".to_string(),
        // -C / -A spliced in by the caller at index 2
        "POSTROUTING".to_string(),
        "-s".to_string(),
        subnet.to_string(),
        "!".to_string(),
        "-o".to_string(),
        bridge.to_string(),
        "-j".to_string(),
        "MASQUERADE".to_string(),
    ]
}

fn rule_args(op: &str, rule: &[String]) -> Vec<String> {
    let mut args: Vec<String> = rule[..2].to_vec();
    args.push(op.to_string());
    args.extend_from_slice(&rule[2..]);
    args
}

/// Enable IP forwarding and install the masquerade rule for the subnet.
/// Idempotent: the rule is checked before it is added.
pub async fn ensure_nat(subnet: &Ipv4Subnet, bridge: &str) -> Result<(), NetError> {
    tokio::fs::write("/proc/sys/net/ipv4/ip_forward", "1")
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                NetError::PermissionDenied {
                    command: "sysctl net.ipv4.ip_forward=1".to_string(),
                }
            } else {
                NetError::Io(e)
            }
        })?;

    let rule = masquerade_rule(subnet, bridge);
    let check = rule_args("-C", &rule);
    let check_refs: Vec<&str> = check.iter().map(String::as_str).collect();
    // -C exits non-zero when the rule is absent; that is the add path.
    if run_iptables(&check_refs).await.is_ok() {
        debug!(subnet = %subnet, bridge = %bridge, "Masquerade rule already installed");
        return Ok(());
    }

    let add = rule_args("-A", &rule);
    let add_refs: Vec<&str> = add.iter().map(String::as_str).collect();
    run_iptables(&add_refs).await?;

    info!(subnet = %subnet, bridge = %bridge, "Masquerade rule installed");
    Ok(())
}
