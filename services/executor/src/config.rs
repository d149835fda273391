//! Configuration for the executor daemon.
//!
//! All options are read from `SCORCH_*` environment variables with
//! conservative defaults; unparseable values fall back rather than abort,
//! except for the network policy where a bad subnet/gateway is a hard error.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use scorch_networking::Ipv4Subnet;

/// How guest addresses are assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpMode {
    /// Deterministic allocation from the configured subnet.
    Static,
    /// The guest runs its own DHCP client; no host-side allocation.
    Dhcp,
}

impl IpMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Dhcp => "dhcp",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "static" => Some(Self::Static),
            "dhcp" => Some(Self::Dhcp),
            _ => None,
        }
    }
}

/// Supported in-guest init systems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitSystem {
    Tini,
    DumbInit,
    #[default]
    None,
}

impl InitSystem {
    /// Binary name on the host, if any.
    pub fn binary_name(&self) -> Option<&'static str> {
        match self {
            Self::Tini => Some("tini"),
            Self::DumbInit => Some("dumb-init"),
            Self::None => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tini => "tini",
            Self::DumbInit => "dumb-init",
            Self::None => "none",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tini" => Some(Self::Tini),
            "dumb-init" => Some(Self::DumbInit),
            "none" => Some(Self::None),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// Host networking policy.
#[derive(Debug, Clone)]
pub struct NetworkSettings {
    /// Shared bridge name.
    pub bridge_name: String,
    /// Gateway address assigned to the bridge.
    pub bridge_ip: Ipv4Addr,
    /// Subnet guests are addressed from.
    pub subnet: Ipv4Subnet,
    /// Address assignment mode.
    pub ip_mode: IpMode,
    /// Whether to install the masquerade rule for the subnet.
    pub nat_enabled: bool,
    /// Optional NIC receive bandwidth cap (bytes/sec).
    pub rate_limit_rx_bps: Option<u64>,
    /// Optional NIC transmit bandwidth cap (bytes/sec).
    pub rate_limit_tx_bps: Option<u64>,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            bridge_name: "scorch0".to_string(),
            bridge_ip: Ipv4Addr::new(192, 168, 127, 1),
            subnet: Ipv4Subnet::from_cidr("192.168.127.0/24").expect("default subnet"),
            ip_mode: IpMode::Static,
            nat_enabled: true,
            rate_limit_rx_bps: None,
            rate_limit_tx_bps: None,
        }
    }
}

/// In-guest init policy.
#[derive(Debug, Clone, Copy)]
pub struct InitSettings {
    pub system: InitSystem,
    pub grace_period_secs: u64,
}

impl Default for InitSettings {
    fn default() -> Self {
        Self {
            system: InitSystem::None,
            grace_period_secs: 10,
        }
    }
}

/// Jailer launch policy. Detail beyond routing the VMM through the jail
/// (chroot layout, uid/gid drop) is delegated to the jailer binary itself.
#[derive(Debug, Clone)]
pub struct JailerSettings {
    pub enabled: bool,
    pub uid: u32,
    pub gid: u32,
    pub chroot_base: PathBuf,
}

impl Default for JailerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            uid: 1000,
            gid: 1000,
            chroot_base: PathBuf::from("/srv/scorch/jail"),
        }
    }
}

/// Executor daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the guest kernel image.
    pub kernel_path: PathBuf,
    /// Rootfs artifact cache directory.
    pub rootfs_dir: PathBuf,
    /// VMM API socket directory.
    pub socket_dir: PathBuf,
    /// vCPU fallback when a task requests no CPU.
    pub default_vcpus: u8,
    /// Memory fallback (MiB) when a task requests no memory.
    pub default_memory_mb: u32,
    pub jailer: JailerSettings,
    pub network: NetworkSettings,
    pub init: InitSettings,
    /// EnvFilter fallback for the subscriber.
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            kernel_path: PathBuf::from("/var/lib/scorch/vmlinux"),
            rootfs_dir: PathBuf::from("/var/lib/scorch/rootfs"),
            socket_dir: PathBuf::from("/var/run/scorch"),
            default_vcpus: 1,
            default_memory_mb: 512,
            jailer: JailerSettings::default(),
            network: NetworkSettings::default(),
            init: InitSettings::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let kernel_path = env_path("SCORCH_KERNEL_PATH", defaults.kernel_path);
        let rootfs_dir = env_path("SCORCH_ROOTFS_DIR", defaults.rootfs_dir);
        let socket_dir = env_path("SCORCH_SOCKET_DIR", defaults.socket_dir);

        let default_vcpus = env_parse("SCORCH_DEFAULT_VCPUS", defaults.default_vcpus);
        let default_memory_mb = env_parse("SCORCH_DEFAULT_MEMORY_MB", defaults.default_memory_mb);

        let jailer = JailerSettings {
            enabled: env_parse("SCORCH_ENABLE_JAILER", false),
            uid: env_parse("SCORCH_JAILER_UID", defaults.jailer.uid),
            gid: env_parse("SCORCH_JAILER_GID", defaults.jailer.gid),
            chroot_base: env_path("SCORCH_JAILER_CHROOT_BASE", defaults.jailer.chroot_base),
        };

        let subnet_str = std::env::var("SCORCH_SUBNET")
            .unwrap_or_else(|_| defaults.network.subnet.to_string());
        let subnet = Ipv4Subnet::from_cidr(&subnet_str)
            .with_context(|| format!("SCORCH_SUBNET: invalid CIDR {subnet_str:?}"))?;

        let bridge_ip_str = std::env::var("SCORCH_BRIDGE_IP")
            .unwrap_or_else(|_| defaults.network.bridge_ip.to_string());
        let bridge_ip: Ipv4Addr = bridge_ip_str
            .parse()
            .with_context(|| format!("SCORCH_BRIDGE_IP: invalid address {bridge_ip_str:?}"))?;
        if !subnet.contains(bridge_ip) {
            bail!("SCORCH_BRIDGE_IP {bridge_ip} is outside SCORCH_SUBNET {subnet}");
        }

        let ip_mode_str =
            std::env::var("SCORCH_IP_MODE").unwrap_or_else(|_| "static".to_string());
        let Some(ip_mode) = IpMode::parse(&ip_mode_str) else {
            bail!("SCORCH_IP_MODE: expected 'static' or 'dhcp', got {ip_mode_str:?}");
        };

        let network = NetworkSettings {
            bridge_name: std::env::var("SCORCH_BRIDGE_NAME")
                .unwrap_or(defaults.network.bridge_name),
            bridge_ip,
            subnet,
            ip_mode,
            nat_enabled: env_parse("SCORCH_NAT_ENABLED", true),
            rate_limit_rx_bps: env_opt_parse("SCORCH_RATE_LIMIT_RX_BPS"),
            rate_limit_tx_bps: env_opt_parse("SCORCH_RATE_LIMIT_TX_BPS"),
        };

        let init_system_str =
            std::env::var("SCORCH_INIT_SYSTEM").unwrap_or_else(|_| "none".to_string());
        let Some(init_system) = InitSystem::parse(&init_system_str) else {
            bail!("SCORCH_INIT_SYSTEM: expected tini, dumb-init or none, got {init_system_str:?}");
        };

        let init = InitSettings {
            system: init_system,
            grace_period_secs: env_parse(
                "SCORCH_INIT_GRACE_SEC",
                defaults.init.grace_period_secs,
            ),
        };

        Ok(Self {
            kernel_path,
            rootfs_dir,
            socket_dir,
            default_vcpus: default_vcpus.max(1),
            default_memory_mb: default_memory_mb.max(1),
            jailer,
            network,
            init,
            log_level: std::env::var("SCORCH_LOG_LEVEL").unwrap_or(defaults.log_level),
        })
    }
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    std::env::var(key).map(PathBuf::from).unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_opt_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}
