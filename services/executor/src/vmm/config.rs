//! VMM configuration document.
//!
//! These structures serialize to the JSON document handed to the VMM over
//! stdin (`--config-file -`). The shape follows the Firecracker config file:
//! boot source, machine config, drives, network interfaces.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default virtio queue depth for guest NICs.
pub const NIC_QUEUE_SIZE: u32 = 256;

/// Machine configuration for the microVM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Number of vCPUs.
    pub vcpu_count: u8,
    /// Memory size in MiB.
    pub mem_size_mib: u32,
    /// Enable simultaneous multithreading.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smt: Option<bool>,
}

impl MachineConfig {
    pub fn new(vcpu_count: u8, mem_size_mib: u32) -> Self {
        Self {
            vcpu_count,
            mem_size_mib,
            smt: Some(false),
        }
    }
}

/// Boot source configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootSource {
    /// Path to the kernel image.
    pub kernel_image_path: PathBuf,
    /// Kernel boot arguments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_args: Option<String>,
}

impl BootSource {
    pub fn new(kernel_image_path: PathBuf, boot_args: String) -> Self {
        Self {
            kernel_image_path,
            boot_args: Some(boot_args),
        }
    }
}

/// Block device (drive) configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveConfig {
    /// Unique drive identifier.
    pub drive_id: String,
    /// Path to the drive image file on the host.
    pub path_on_host: PathBuf,
    /// Whether this is the root device.
    pub is_root_device: bool,
    /// Whether the drive is read-only.
    pub is_read_only: bool,
}

impl DriveConfig {
    pub fn new(drive_id: &str, path_on_host: PathBuf, is_root_device: bool) -> Self {
        Self {
            drive_id: drive_id.to_string(),
            path_on_host,
            is_root_device,
            is_read_only: false,
        }
    }

    /// The read-write root device.
    pub fn rootfs(path: PathBuf) -> Self {
        Self {
            drive_id: "rootfs".to_string(),
            path_on_host: path,
            is_root_device: true,
            is_read_only: false,
        }
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.is_read_only = read_only;
        self
    }
}

/// Token bucket configuration for rate limiting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBucket {
    /// Bucket size (one-time burst).
    pub size: u64,
    /// Refill time in milliseconds.
    pub refill_time: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub one_time_burst: Option<u64>,
}

impl TokenBucket {
    /// A bucket refilled once per second, i.e. a bytes/sec cap.
    pub fn per_second(size: u64) -> Self {
        Self {
            size,
            refill_time: 1000,
            one_time_burst: None,
        }
    }
}

/// Rate limiter configuration for network interfaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bandwidth: Option<TokenBucket>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ops: Option<TokenBucket>,
}

impl RateLimiter {
    pub fn bandwidth_bps(bps: u64) -> Self {
        Self {
            bandwidth: Some(TokenBucket::per_second(bps)),
            ops: None,
        }
    }
}

/// Network interface configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterfaceConfig {
    /// Guest-visible interface id (ethN).
    pub iface_id: String,
    /// Host TAP device name.
    pub host_dev_name: String,
    /// Guest MAC address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest_mac: Option<String>,
    pub rx_queue_size: u32,
    pub tx_queue_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rx_rate_limiter: Option<RateLimiter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_rate_limiter: Option<RateLimiter>,
}

impl NetworkInterfaceConfig {
    pub fn new(iface_id: &str, host_dev_name: &str) -> Self {
        Self {
            iface_id: iface_id.to_string(),
            host_dev_name: host_dev_name.to_string(),
            guest_mac: None,
            rx_queue_size: NIC_QUEUE_SIZE,
            tx_queue_size: NIC_QUEUE_SIZE,
            rx_rate_limiter: None,
            tx_rate_limiter: None,
        }
    }

    pub fn with_mac(mut self, mac: &str) -> Self {
        self.guest_mac = Some(mac.to_string());
        self
    }

    pub fn with_rx_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.rx_rate_limiter = Some(limiter);
        self
    }

    pub fn with_tx_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.tx_rate_limiter = Some(limiter);
        self
    }
}

/// The full configuration document for one microVM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfigDocument {
    #[serde(rename = "boot-source")]
    pub boot_source: BootSource,
    #[serde(rename = "machine-config")]
    pub machine: MachineConfig,
    pub drives: Vec<DriveConfig>,
    #[serde(rename = "network-interfaces")]
    pub network_interfaces: Vec<NetworkInterfaceConfig>,
}

impl VmConfigDocument {
    /// Render the document as the JSON the VMM reads from stdin.
    pub fn render(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Generate a deterministic MAC address for a guest interface.
///
/// Locally administered (bit 1 of the first byte set), unicast (bit 0
/// clear). The zero-keyed hash makes the address stable across restarts.
pub fn generate_mac_address(task_id: &str, iface_id: &str) -> String {
    let hash = scorch_networking::stable_hash(&format!("{task_id}/{iface_id}"));

    let first_byte = ((hash >> 40) as u8 & 0xFC) | 0x02;

    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        first_byte,
        (hash >> 32) as u8,
        (hash >> 24) as u8,
        (hash >> 16) as u8,
        (hash >> 8) as u8,
        hash as u8,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_config() {
        let config = MachineConfig::new(2, 1024);
        assert_eq!(config.vcpu_count, 2);
        assert_eq!(config.mem_size_mib, 1024);
        assert_eq!(config.smt, Some(false));
    }

    #[test]
    fn test_rootfs_drive_is_writable_root() {
        let drive = DriveConfig::rootfs("/r/nginx.ext4".into());
        assert_eq!(drive.drive_id, "rootfs");
        assert!(drive.is_root_device);
        assert!(!drive.is_read_only);
    }

    #[test]
    fn test_generate_mac_address() {
        let mac1 = generate_mac_address("task-1", "eth0");
        let mac2 = generate_mac_address("task-2", "eth0");
        let mac3 = generate_mac_address("task-1", "eth1");
        let mac1_again = generate_mac_address("task-1", "eth0");

        assert_eq!(mac1, mac1_again);
        assert_ne!(mac1, mac2);
        assert_ne!(mac1, mac3);

        assert_eq!(mac1.len(), 17);
        assert_eq!(mac1.chars().filter(|&c| c == ':').count(), 5);

        // Locally administered, unicast.
        let first = u8::from_str_radix(&mac1[0..2], 16).unwrap();
        assert_eq!(first & 0x02, 0x02);
        assert_eq!(first & 0x01, 0x00);
    }

    #[test]
    fn test_document_renders_expected_sections() {
        let doc = VmConfigDocument {
            boot_source: BootSource::new("/k/vmlinux".into(), "console=ttyS0".to_string()),
            machine: MachineConfig::new(1, 512),
            drives: vec![DriveConfig::rootfs("/r/app.ext4".into())],
            network_interfaces: vec![NetworkInterfaceConfig::new("eth0", "tap-0a1b-eth0")],
        };

        let json = doc.render().unwrap();
        assert!(json.contains("\"boot-source\""));
        assert!(json.contains("\"machine-config\""));
        assert!(json.contains("\"network-interfaces\""));
        assert!(json.contains("\"rx_queue_size\":256"));
    }

    #[test]
    fn test_rate_limiter_shape() {
        let limiter = RateLimiter::bandwidth_bps(1_000_000);
        let bucket = limiter.bandwidth.unwrap();
        assert_eq!(bucket.size, 1_000_000);
        assert_eq!(bucket.refill_time, 1000);
    }
}
