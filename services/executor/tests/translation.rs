//! End-to-end translation and allocation scenarios through the public API.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use scorch_executor::config::Config;
use scorch_executor::network::tap_device_name;
use scorch_executor::task::{annotations, Mount, NetworkAttachment, Resources, RuntimeSpec, Task};
use scorch_executor::translate::{TaskTranslator, Translator, BOOT_ARGS_PREFIX};
use scorch_networking::{IpAllocator, Ipv4Subnet};

fn translator() -> TaskTranslator {
    let mut config = Config::default();
    config.kernel_path = PathBuf::from("/var/lib/scorch/vmlinux");
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
            env: BTreeMap::new(),
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
        annotations: BTreeMap::new(),
    };
    task.set_annotation(annotations::ROOTFS, "/r/nginx.ext4");
    task
}

#[test]
fn pure_translation_scenario() {
    let doc = translator().translate(&nginx_task()).unwrap();

    // 2 * 10^9 nano-cpus, 1 GiB.
    assert_eq!(doc.machine.vcpu_count, 2);
    assert_eq!(doc.machine.mem_size_mib, 1024);
    assert_eq!(doc.machine.smt, Some(false));

    // Exactly one drive: the read-write root.
    assert_eq!(doc.drives.len(), 1);
    assert_eq!(doc.drives[0].drive_id, "rootfs");
    assert_eq!(doc.drives[0].path_on_host, PathBuf::from("/r/nginx.ext4"));
    assert!(doc.drives[0].is_root_device);
    assert!(!doc.drives[0].is_read_only);

    // One NIC with 256-deep queues, scoped to the task.
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
fn init_injection_scenario() {
    let mut task = nginx_task();
    task.set_annotation(annotations::INIT_SYSTEM, "tini");
    task.set_annotation(annotations::INIT_PATH, "/sbin/tini");
    task.set_annotation(annotations::INIT_GRACE_SEC, "10");

    let doc = translator().translate(&task).unwrap();
    let boot_args = doc.boot_source.boot_args.as_deref().unwrap();
    assert!(boot_args.ends_with(" -- /sbin/tini -- nginx -g \"daemon off;\""));
}

#[test]
fn deterministic_ip_scenario() {
    let subnet = Ipv4Subnet::from_cidr("192.168.127.0/24").unwrap();
    let gateway = Ipv4Addr::new(192, 168, 127, 1);

    let mut first_run = IpAllocator::new(subnet, gateway).unwrap();
    let alpha = first_run.allocate("alpha").unwrap();
    let beta = first_run.allocate("beta").unwrap();

    // A restart ("second allocator") reproduces alpha's address.
    let mut second_run = IpAllocator::new(subnet, gateway).unwrap();
    assert_eq!(second_run.allocate("alpha").unwrap(), alpha);

    assert_ne!(alpha, beta);
    assert_ne!(alpha, gateway);
    assert_ne!(beta, gateway);
    for addr in [alpha, beta] {
        assert!((2..=254).contains(&addr.octets()[3]));
    }
}

#[test]
fn translation_is_deterministic_across_calls() {
    let task = nginx_task();
    let translator = translator();

    let first = translator.translate(&task).unwrap().render().unwrap();
    let second = translator.translate(&task).unwrap().render().unwrap();
    assert_eq!(first, second);
}

#[test]
fn fractional_cpu_floors_at_one_vcpu() {
    let mut task = nginx_task();
    task.resources.nano_cpus = 500_000_000;

    let doc = translator().translate(&task).unwrap();
    assert_eq!(doc.machine.vcpu_count, 1);
}

#[test]
fn mounts_become_secondary_drives() {
    let mut task = nginx_task();
    task.runtime.mounts = vec![Mount {
        source: "/vol/data.ext4".to_string(),
        target: "/srv/data".to_string(),
        read_only: true,
    }];

    let doc = translator().translate(&task).unwrap();
    assert_eq!(doc.drives.len(), 2);
    assert_eq!(doc.drives[1].drive_id, "srv-data");
    assert!(doc.drives[1].is_read_only);
    assert!(!doc.drives[1].is_root_device);
}

#[test]
fn rendered_document_is_vmm_config_shaped() {
    let doc = translator().translate(&nginx_task()).unwrap();
    let json = doc.render().unwrap();

    let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert!(parsed.get("boot-source").is_some());
    assert!(parsed.get("machine-config").is_some());
    assert!(parsed.get("drives").is_some());
    assert!(parsed.get("network-interfaces").is_some());
    assert_eq!(
        parsed["boot-source"]["kernel_image_path"],
        "/var/lib/scorch/vmlinux"
    );
}
