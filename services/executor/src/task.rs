//! Orchestrator task model.
//!
//! A [`Task`] is the orchestrator's unit of work scheduled onto this node.
//! The orchestrator owns task identity and the runtime descriptor; the
//! executor communicates per-phase outputs (rootfs path, injected init
//! metadata, allocated TAP/IP) back through the `annotations` map and
//! mutates nothing else.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Runtime kind the executor accepts.
pub const RUNTIME_KIND_CONTAINER: &str = "container";

/// Well-known annotation keys written by the executor.
pub mod annotations {
    /// Path of the prepared rootfs artifact.
    pub const ROOTFS: &str = "rootfs";
    /// Name of the injected in-guest init system.
    pub const INIT_SYSTEM: &str = "init_system";
    /// In-guest path of the injected init binary.
    pub const INIT_PATH: &str = "init_path";
    /// Graceful-stop budget in seconds.
    pub const INIT_GRACE_SEC: &str = "init_grace_sec";

    /// Annotation key for the TAP device backing a guest interface.
    pub fn net_tap(iface: &str) -> String {
        format!("net.{iface}.tap")
    }

    /// Annotation key for the address assigned to a guest interface.
    pub fn net_ip(iface: &str) -> String {
        format!("net.{iface}.ip")
    }
}

/// A bind of host data into the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Host path of the backing image.
    pub source: String,
    /// Guest mount target.
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Container runtime descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSpec {
    /// Runtime kind; only "container" is supported.
    pub kind: String,
    /// OCI image reference.
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub mounts: Vec<Mount>,
}

/// Resource limits for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Resources {
    /// CPU limit in billionths of a core (2.5 cores = 2_500_000_000).
    #[serde(default)]
    pub nano_cpus: i64,
    /// Memory limit in bytes.
    #[serde(default)]
    pub memory_bytes: u64,
}

/// A network the task wants to be attached to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAttachment {
    /// Host bridge the TAP device joins. Empty means the configured default.
    #[serde(default)]
    pub bridge: String,
    /// Optional static addresses requested by the orchestrator.
    #[serde(default)]
    pub static_addresses: Vec<String>,
}

/// The orchestrator's unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub service_id: String,
    pub node_id: String,
    pub runtime: RuntimeSpec,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub networks: Vec<NetworkAttachment>,
    /// Per-phase outputs; the only field the executor mutates.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl Task {
    /// Read an annotation.
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    /// Write an annotation.
    pub fn set_annotation(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.annotations.insert(key.into(), value.into());
    }

    /// Whether the descriptor is a container runtime.
    pub fn is_container(&self) -> bool {
        self.runtime.kind == RUNTIME_KIND_CONTAINER
    }

    /// Whether the task carries an explicit command or args.
    pub fn has_command(&self) -> bool {
        !self.runtime.command.is_empty() || !self.runtime.args.is_empty()
    }

    /// Full guest argv: command followed by args.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = self.runtime.command.clone();
        argv.extend(self.runtime.args.iter().cloned());
        argv
    }
}
