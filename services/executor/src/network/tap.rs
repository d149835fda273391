//! TAP device creation and attachment.
//!
//! Each task attachment gets a dedicated TAP device joined to the shared
//! bridge; the VMM presents its guest end as a virtio NIC.

use std::net::Ipv4Addr;
use std::path::Path;

use scorch_networking::Ipv4Subnet;
use tracing::{debug, info};

use super::bridge::run_ip;
use super::NetError;

/// Record of one live TAP device, keyed in the manager by
/// `(task_id, if_name)`.
#[derive(Debug, Clone)]
pub struct TapRecord {
    pub task_id: String,
    pub if_name: String,
    pub bridge: String,
    /// Attachment index within the task (eth<N>).
    pub iface_index: usize,
    /// Assigned guest address, when static IP mode is active.
    pub address: Option<Ipv4Addr>,
    pub prefix_len: u8,
    pub gateway: Option<Ipv4Addr>,
    pub subnet: Option<Ipv4Subnet>,
}

impl TapRecord {
    /// Guest-visible interface id for this attachment.
    pub fn iface_id(&self) -> String {
        format!("eth{}", self.iface_index)
    }
}

/// Probe sysfs for an interface.
pub fn tap_exists(name: &str) -> bool {
    Path::new("/sys/class/net").join(name).exists()
}

/// Create a TAP device and bring it up. Partial failures tear the device
/// back down.
pub async fn create_tap(name: &str) -> Result<(), NetError> {
    run_ip(&["tuntap", "add", "dev", name, "mode", "tap"])
        .await
        .map_err(|e| match e {
            NetError::PermissionDenied { .. } | NetError::ToolUnavailable(_) => e,
            other => NetError::TapCreateFailed(other.to_string()),
        })?;

    if let Err(e) = run_ip(&["link", "set", "dev", name, "up"]).await {
        let _ = run_ip(&["link", "delete", name]).await;
        return Err(NetError::TapCreateFailed(format!("bring up: {e}")));
    }

    debug!(tap = %name, "TAP device created");
    Ok(())
}

/// Attach a TAP device to a bridge. The device is deleted on failure so no
/// orphan interface is left behind.
pub async fn attach_to_bridge(name: &str, bridge: &str) -> Result<(), NetError> {
    if let Err(e) = run_ip(&["link", "set", "dev", name, "master", bridge]).await {
        let _ = run_ip(&["link", "delete", name]).await;
        return Err(match e {
            NetError::PermissionDenied { .. } => e,
            other => NetError::TapAttachFailed(other.to_string()),
        });
    }

    info!(tap = %name, bridge = %bridge, "TAP attached to bridge");
    Ok(())
}

/// Bring a TAP device down and delete it.
pub async fn delete_tap(name: &str) -> Result<(), NetError> {
    let _ = run_ip(&["link", "set", "dev", name, "down"]).await;
    run_ip(&["link", "delete", name]).await?;
    debug!(tap = %name, "TAP device deleted");
    Ok(())
}
