//! Task translation.
//!
//! Maps an orchestrator task (with its rootfs annotation already set by the
//! image preparer) into an immutable VMM configuration document. This is a
//! pure transformation: no I/O, no side effects, deterministic output.

use std::path::PathBuf;

use thiserror::Error;

use crate::config::Config;
use crate::network::tap_device_name;
use crate::task::{annotations, Task};
use crate::vmm::config::{
    generate_mac_address, BootSource, DriveConfig, MachineConfig, NetworkInterfaceConfig,
    RateLimiter, VmConfigDocument,
};

/// Fixed kernel command-line prefix for every guest.
pub const BOOT_ARGS_PREFIX: &str =
    "console=ttyS0 reboot=k panic=1 pci=off random.trust_cpu=on ip=dhcp";

/// Errors from task translation. All are invalid-input: the caller handed
/// over a task the executor cannot express as a microVM.
#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("task runtime kind {0:?} is not a container")]
    UnsupportedRuntime(String),

    #[error("task {0} has no rootfs annotation (prepare must run first)")]
    MissingRootfs(String),
}

/// Translation capability. Narrow on purpose so tests can substitute a fake.
pub trait Translator: Send + Sync {
    fn translate(&self, task: &Task) -> Result<VmConfigDocument, TranslateError>;
}

/// The production translator, parameterized by node configuration.
#[derive(Debug, Clone)]
pub struct TaskTranslator {
    kernel_path: PathBuf,
    default_vcpus: u8,
    default_memory_mb: u32,
    rate_limit_rx_bps: Option<u64>,
    rate_limit_tx_bps: Option<u64>,
}

impl TaskTranslator {
    pub fn new(config: &Config) -> Self {
        Self {
            kernel_path: config.kernel_path.clone(),
            default_vcpus: config.default_vcpus,
            default_memory_mb: config.default_memory_mb,
            rate_limit_rx_bps: config.network.rate_limit_rx_bps,
            rate_limit_tx_bps: config.network.rate_limit_tx_bps,
        }
    }

    /// vCPU count: ceil(nano_cpus / 10^9), floored at 1; config default when
    /// the task requests nothing.
    fn vcpu_count(&self, nano_cpus: i64) -> u8 {
        if nano_cpus <= 0 {
            return self.default_vcpus.max(1);
        }
        let ceil = (nano_cpus as u64).div_ceil(1_000_000_000);
        ceil.clamp(1, u8::MAX as u64) as u8
    }

    /// Memory in MiB, floored at 1; config default when the task requests
    /// nothing.
    fn mem_size_mib(&self, memory_bytes: u64) -> u32 {
        if memory_bytes == 0 {
            return self.default_memory_mb.max(1);
        }
        (memory_bytes / (1024 * 1024)).clamp(1, u32::MAX as u64) as u32
    }

    fn boot_args(&self, task: &Task) -> String {
        if !task.has_command() {
            return BOOT_ARGS_PREFIX.to_string();
        }

        let mut argv: Vec<String> = Vec::new();
        let init_system = task
            .annotation(annotations::INIT_SYSTEM)
            .filter(|s| *s != "none");
        if let Some(name) = init_system {
            let init_path = task
                .annotation(annotations::INIT_PATH)
                .map(str::to_string)
                .unwrap_or_else(|| format!("/sbin/{name}"));
            argv.push(init_path);
            argv.push("--".to_string());
        }
        argv.extend(task.argv());

        format!("{} -- {}", BOOT_ARGS_PREFIX, join_argv(&argv))
    }

    fn drives(&self, task: &Task, rootfs: &str) -> Vec<DriveConfig> {
        let mut drives = vec![DriveConfig::rootfs(PathBuf::from(rootfs))];

        for (idx, mount) in task.runtime.mounts.iter().enumerate() {
            let drive_id = mount_drive_id(&mount.target, idx);
            drives.push(
                DriveConfig::new(&drive_id, PathBuf::from(&mount.source), false)
                    .read_only(mount.read_only),
            );
        }

        drives
    }

    fn network_interfaces(&self, task: &Task) -> Vec<NetworkInterfaceConfig> {
        task.networks
            .iter()
            .enumerate()
            .map(|(idx, _attachment)| {
                let iface_id = format!("eth{idx}");
                let host_dev = tap_device_name(&task.task_id, idx);
                let mac = generate_mac_address(&task.task_id, &iface_id);

                let mut nic = NetworkInterfaceConfig::new(&iface_id, &host_dev).with_mac(&mac);
                if let Some(bps) = self.rate_limit_rx_bps {
                    nic = nic.with_rx_rate_limiter(RateLimiter::bandwidth_bps(bps));
                }
                if let Some(bps) = self.rate_limit_tx_bps {
                    nic = nic.with_tx_rate_limiter(RateLimiter::bandwidth_bps(bps));
                }
                nic
            })
            .collect()
    }
}

impl Translator for TaskTranslator {
    fn translate(&self, task: &Task) -> Result<VmConfigDocument, TranslateError> {
        if !task.is_container() {
            return Err(TranslateError::UnsupportedRuntime(task.runtime.kind.clone()));
        }

        let rootfs = task
            .annotation(annotations::ROOTFS)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| TranslateError::MissingRootfs(task.task_id.clone()))?;

        Ok(VmConfigDocument {
            boot_source: BootSource::new(self.kernel_path.clone(), self.boot_args(task)),
            machine: MachineConfig::new(
                self.vcpu_count(task.resources.nano_cpus),
                self.mem_size_mib(task.resources.memory_bytes),
            ),
            drives: self.drives(task, rootfs),
            network_interfaces: self.network_interfaces(task),
        })
    }
}

/// Derive a drive id from a mount target: `/` becomes `-`, leading `-`
/// stripped. A degenerate target (e.g. "/") falls back to an indexed id.
fn mount_drive_id(target: &str, idx: usize) -> String {
    let id: String = target.replace('/', "-");
    let id = id.trim_start_matches('-').to_string();
    if id.is_empty() {
        format!("disk{idx}")
    } else {
        id
    }
}

/// Join an argv for the kernel command line, double-quoting arguments that
/// contain whitespace or quotes.
fn join_argv(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| quote_arg(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

fn quote_arg(arg: &str) -> String {
    if arg.is_empty() || arg.chars().any(|c| c.is_whitespace() || c == '"') {
        format!("\"{}\"", arg.replace('"', "\\\""))
    } else {
        arg.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Mount, NetworkAttachment, Resources, RuntimeSpec};
    use rstest::rstest;

    fn translator() -> TaskTranslator {
        let mut config = Config::default();
        config.kernel_path = PathBuf::from("/k/vmlinux");
        TaskTranslator::new(&config)
    }

    fn nginx_task() -> Task {
        let mut task = Task {
            task_id: "t1".to_string(),
            service_id: "web".to_string(),
            node_id: "n1".to_string(),
            runtime: RuntimeSpec {
                kind: "container".to_string(),
                image: "nginx:latest".to_string(),
                command: vec!["nginx".to_string()],
                args: vec!["-g".to_string(), "daemon off;".to_string()],
                env: Default::default(),
                mounts: vec![],
            },
            resources: Resources {
                nano_cpus: 2_000_000_000,
                memory_bytes: 1024 * 1024 * 1024,
            },
            networks: vec![NetworkAttachment {
                bridge: "br0".to_string(),
                static_addresses: vec![],
            }],
            annotations: Default::default(),
        };
        task.set_annotation(annotations::ROOTFS, "/r/nginx.ext4");
        task
    }

    #[test]
    fn test_translate_nginx_task() {
        let doc = translator().translate(&nginx_task()).unwrap();

        assert_eq!(doc.machine.vcpu_count, 2);
        assert_eq!(doc.machine.mem_size_mib, 1024);

        assert_eq!(doc.drives.len(), 1);
        let root = &doc.drives[0];
        assert_eq!(root.drive_id, "rootfs");
        assert_eq!(root.path_on_host, PathBuf::from("/r/nginx.ext4"));
        assert!(root.is_root_device);
        assert!(!root.is_read_only);

        assert_eq!(doc.network_interfaces.len(), 1);
        let nic = &doc.network_interfaces[0];
        assert_eq!(nic.iface_id, "eth0");
        assert_eq!(nic.host_dev_name, tap_device_name("t1", 0));
        assert_eq!(nic.rx_queue_size, 256);
        assert_eq!(nic.tx_queue_size, 256);

        let boot_args = doc.boot_source.boot_args.as_deref().unwrap();
        assert!(boot_args.starts_with(BOOT_ARGS_PREFIX));
        assert!(boot_args.ends_with(" -- nginx -g \"daemon off;\""));
    }

    #[test]
    fn test_translate_with_injected_init() {
        let mut task = nginx_task();
        task.set_annotation(annotations::INIT_SYSTEM, "tini");
        task.set_annotation(annotations::INIT_PATH, "/sbin/tini");

        let doc = translator().translate(&task).unwrap();
        let boot_args = doc.boot_source.boot_args.as_deref().unwrap();
        assert!(boot_args.ends_with(" -- /sbin/tini -- nginx -g \"daemon off;\""));
    }

    #[test]
    fn test_init_none_is_verbatim() {
        let mut task = nginx_task();
        task.set_annotation(annotations::INIT_SYSTEM, "none");

        let doc = translator().translate(&task).unwrap();
        let boot_args = doc.boot_source.boot_args.as_deref().unwrap();
        assert!(boot_args.ends_with(" -- nginx -g \"daemon off;\""));
    }

    #[test]
    fn test_translation_is_pure() {
        let task = nginx_task();
        let t = translator();
        let a = t.translate(&task).unwrap().render().unwrap();
        let b = t.translate(&task).unwrap().render().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_no_command_means_bare_boot_args() {
        let mut task = nginx_task();
        task.runtime.command.clear();
        task.runtime.args.clear();

        let doc = translator().translate(&task).unwrap();
        assert_eq!(doc.boot_source.boot_args.as_deref(), Some(BOOT_ARGS_PREFIX));
    }

    #[test]
    fn test_zero_networks_produces_zero_nics() {
        let mut task = nginx_task();
        task.networks.clear();

        let doc = translator().translate(&task).unwrap();
        assert!(doc.network_interfaces.is_empty());
    }

    #[rstest]
    #[case(500_000_000, 1)] // ceil(0.5) with floor-1 clamp
    #[case(1_000_000_000, 1)]
    #[case(1_000_000_001, 2)]
    #[case(2_500_000_000, 3)]
    fn test_vcpu_rounding(#[case] nano_cpus: i64, #[case] expected: u8) {
        let mut task = nginx_task();
        task.resources.nano_cpus = nano_cpus;
        let doc = translator().translate(&task).unwrap();
        assert_eq!(doc.machine.vcpu_count, expected);
    }

    #[test]
    fn test_zero_resources_fall_back_to_defaults() {
        let mut task = nginx_task();
        task.resources = Resources::default();

        let doc = translator().translate(&task).unwrap();
        assert_eq!(doc.machine.vcpu_count, 1);
        assert_eq!(doc.machine.mem_size_mib, 512);
    }

    #[test]
    fn test_tiny_memory_floors_at_one_mib() {
        let mut task = nginx_task();
        task.resources.memory_bytes = 4096;
        let doc = translator().translate(&task).unwrap();
        assert_eq!(doc.machine.mem_size_mib, 1);
    }

    #[test]
    fn test_mount_drives() {
        let mut task = nginx_task();
        task.runtime.mounts = vec![
            Mount {
                source: "/data/cache.ext4".to_string(),
                target: "/var/cache".to_string(),
                read_only: false,
            },
            Mount {
                source: "/data/conf.ext4".to_string(),
                target: "/etc/nginx".to_string(),
                read_only: true,
            },
        ];

        let doc = translator().translate(&task).unwrap();
        assert_eq!(doc.drives.len(), 3);

        assert_eq!(doc.drives[1].drive_id, "var-cache");
        assert!(!doc.drives[1].is_read_only);
        assert!(!doc.drives[1].is_root_device);

        assert_eq!(doc.drives[2].drive_id, "etc-nginx");
        assert!(doc.drives[2].is_read_only);
    }

    #[rstest]
    #[case("/var/cache", 0, "var-cache")]
    #[case("/data", 1, "data")]
    #[case("/", 2, "disk2")]
    fn test_mount_drive_id(#[case] target: &str, #[case] idx: usize, #[case] expected: &str) {
        assert_eq!(mount_drive_id(target, idx), expected);
    }

    #[test]
    fn test_missing_rootfs_is_invalid_input() {
        let mut task = nginx_task();
        task.annotations.clear();
        assert!(matches!(
            translator().translate(&task),
            Err(TranslateError::MissingRootfs(_))
        ));
    }

    #[test]
    fn test_non_container_runtime_is_invalid_input() {
        let mut task = nginx_task();
        task.runtime.kind = "wasm".to_string();
        assert!(matches!(
            translator().translate(&task),
            Err(TranslateError::UnsupportedRuntime(_))
        ));
    }

    #[test]
    fn test_quote_arg() {
        assert_eq!(quote_arg("nginx"), "nginx");
        assert_eq!(quote_arg("daemon off;"), "\"daemon off;\"");
        assert_eq!(quote_arg("say \"hi\""), "\"say \\\"hi\\\"\"");
        assert_eq!(quote_arg(""), "\"\"");
    }
}
