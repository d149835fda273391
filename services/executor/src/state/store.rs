//! On-disk VM state store.
//!
//! A single JSON file holding the records of live VMs, so operator tooling
//! can list/inspect/stop them and the daemon can recover after a restart.
//! Every mutation rewrites the whole file atomically (temp file + rename);
//! readers get snapshots. The file is single-writer: only the executor
//! process mutates it.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// State file format version.
const STATE_VERSION: u32 = 1;

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no VM record for task {0}")]
    NotFound(String),

    #[error("no home directory to place the state file in")]
    NoHome,
}

/// VM lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    New,
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

impl VmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
        }
    }

    /// Terminal states; only removal transitions out of them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Crashed)
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted record of one VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmInstance {
    pub task_id: String,
    pub pid: i32,
    pub api_socket_path: PathBuf,
    pub state: VmState,
    pub created_at: DateTime<Utc>,
    /// In-guest init system name ("tini", "dumb-init", "none").
    pub init_system: String,
    pub grace_period_secs: u64,
    pub image: String,
    pub vcpus: u8,
    pub memory_mib: u32,
    pub kernel_path: PathBuf,
    pub rootfs_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_at: Option<DateTime<Utc>>,
}

/// On-disk envelope.
#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    vms: BTreeMap<String, VmInstance>,
}

/// JSON-file state store.
pub struct StateStore {
    path: PathBuf,
    vms: Mutex<BTreeMap<String, VmInstance>>,
}

impl StateStore {
    /// Open a store at an explicit path, loading existing records.
    /// A missing file is an empty store, not an error.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let vms = Self::load(&path)?;
        debug!(path = %path.display(), records = vms.len(), "State store opened");

        Ok(Self {
            path,
            vms: Mutex::new(vms),
        })
    }

    /// Open the store at the effective-uid-determined default location.
    pub fn open_default() -> Result<Self, StoreError> {
        Self::open(default_state_path()?)
    }

    /// The backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path) -> Result<BTreeMap<String, VmInstance>, StoreError> {
        match fs::read(path) {
            Ok(bytes) => {
                let file: StateFile = serde_json::from_slice(&bytes)?;
                Ok(file.vms)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Add (or replace) a record. Rolled back if persistence fails.
    pub fn add(&self, vm: VmInstance) -> Result<(), StoreError> {
        let mut vms = self.vms.lock().expect("state store lock");
        let previous = vms.insert(vm.task_id.clone(), vm.clone());

        if let Err(e) = self.persist(&vms) {
            match previous {
                Some(prev) => vms.insert(vm.task_id.clone(), prev),
                None => vms.remove(&vm.task_id),
            };
            return Err(e);
        }
        Ok(())
    }

    /// Snapshot of one record.
    pub fn get(&self, task_id: &str) -> Option<VmInstance> {
        self.vms.lock().expect("state store lock").get(task_id).cloned()
    }

    /// Snapshot of all records, oldest first.
    pub fn list(&self) -> Vec<VmInstance> {
        let vms = self.vms.lock().expect("state store lock");
        let mut list: Vec<VmInstance> = vms.values().cloned().collect();
        list.sort_by_key(|vm| vm.created_at);
        list
    }

    /// Update a record's lifecycle state.
    pub fn update_status(&self, task_id: &str, state: VmState) -> Result<(), StoreError> {
        self.mutate(task_id, |vm| vm.state = state)
    }

    /// Stamp a record with an error message.
    pub fn update_error(&self, task_id: &str, message: &str) -> Result<(), StoreError> {
        self.mutate(task_id, |vm| {
            vm.last_error = Some(message.to_string());
            vm.error_at = Some(Utc::now());
        })
    }

    fn mutate(
        &self,
        task_id: &str,
        apply: impl FnOnce(&mut VmInstance),
    ) -> Result<(), StoreError> {
        let mut vms = self.vms.lock().expect("state store lock");
        let Some(vm) = vms.get_mut(task_id) else {
            return Err(StoreError::NotFound(task_id.to_string()));
        };
        let previous = vm.clone();
        apply(vm);

        if let Err(e) = self.persist(&vms) {
            vms.insert(task_id.to_string(), previous);
            return Err(e);
        }
        Ok(())
    }

    /// Remove a record. Removing an absent record is not an error.
    pub fn remove(&self, task_id: &str) -> Result<(), StoreError> {
        let mut vms = self.vms.lock().expect("state store lock");
        let Some(previous) = vms.remove(task_id) else {
            return Ok(());
        };

        if let Err(e) = self.persist(&vms) {
            vms.insert(task_id.to_string(), previous);
            return Err(e);
        }
        Ok(())
    }

    /// Atomic whole-file rewrite: write the temp file, rename over the real
    /// one. Readers only ever observe a fully-formed file.
    fn persist(&self, vms: &BTreeMap<String, VmInstance>) -> Result<(), StoreError> {
        let file = StateFile {
            version: STATE_VERSION,
            vms: vms.clone(),
        };

        let tmp = tmp_path(&self.path);
        fs::write(&tmp, serde_json::to_vec_pretty(&file)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}

/// State file location by effective uid: a system path for root, a dotfile
/// under $HOME otherwise.
pub fn default_state_path() -> Result<PathBuf, StoreError> {
    if nix::unistd::geteuid().is_root() {
        Ok(PathBuf::from("/var/run/scorch/state.json"))
    } else {
        let home = std::env::var_os("HOME").ok_or(StoreError::NoHome)?;
        Ok(PathBuf::from(home).join(".scorch").join("state.json"))
    }
}
