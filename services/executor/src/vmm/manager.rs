//! VMM process lifecycle management.
//!
//! Owns the VMM OS process for each task from start to remove: spawns it
//! with the translated configuration document on stdin, drives the API over
//! its Unix socket, supervises PID liveness, and enforces the
//! graceful-then-forced shutdown protocol.
//!
//! Locking discipline: the instance map lock is held only across record
//! reads and writes, never across spawn, HTTP, or liveness polling.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, JailerSettings};
use crate::state::{StateStore, StoreError, VmInstance, VmState};
use crate::task::{annotations, Task};
use crate::vmm::api::{ApiError, VmmClient};
use crate::vmm::config::VmConfigDocument;
use crate::vmm::jail::{Jail, JailError};

/// How long the API socket gets to come up after spawn.
const READINESS_TIMEOUT: Duration = Duration::from_secs(10);

/// Liveness/readiness poll cadence.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long a CtrlAltDel shutdown may take before escalation.
const HARD_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on process death after SIGKILL.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Default graceful-stop budget when a record carries none.
const DEFAULT_GRACE_SECS: u64 = 10;

/// Errors from the VMM lifecycle manager.
#[derive(Debug, Error)]
pub enum VmmError {
    #[error("binary not found on PATH: {0}")]
    BinaryMissing(String),

    #[error("a VM already exists for task {0}")]
    AlreadyExists(String),

    #[error("configuration document could not be rendered: {0}")]
    ConfigInvalid(#[from] serde_json::Error),

    #[error("failed to spawn VMM process: {0}")]
    SpawnFailed(#[from] std::io::Error),

    #[error("VMM API did not become ready within {0:?}")]
    ApiNotReady(Duration),

    #[error("VMM API rejected the request: {0}")]
    ApiRejected(#[from] ApiError),

    #[error("start of task {0} cancelled")]
    Cancelled(String),

    #[error("jail staging failed: {0}")]
    Jail(#[from] JailError),

    #[error("state store: {0}")]
    Store(#[from] StoreError),
}

/// Runtime state of a task as seen by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// The VMM process is alive.
    Running,
    /// The VM ran and has exited (stopped or forcibly killed).
    Complete,
    /// The VMM process died without a preceding stop.
    Crashed,
    /// No record exists for the task.
    Orphaned,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Runtime status report for describe/wait.
#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub state: TaskState,
    pub pid: Option<i32>,
    pub uptime_secs: Option<i64>,
    /// VMM-internal state string, when the API answered.
    pub vmm_state: Option<String>,
}

impl RuntimeStatus {
    fn bare(state: TaskState) -> Self {
        Self {
            state,
            pid: None,
            uptime_secs: None,
            vmm_state: None,
        }
    }
}

/// VMM lifecycle capability.
#[async_trait]
pub trait VmmManager: Send + Sync {
    /// Spawn and boot a VM for the task. Fails if one already exists.
    async fn start(
        &self,
        task: &Task,
        doc: &VmConfigDocument,
        cancel: &CancellationToken,
    ) -> Result<(), VmmError>;

    /// One-shot runtime status probe.
    async fn describe(&self, task_id: &str) -> Result<RuntimeStatus, VmmError>;

    /// Block until the task reaches a terminal state or the caller cancels.
    async fn wait(&self, task_id: &str, cancel: &CancellationToken)
        -> Result<RuntimeStatus, VmmError>;

    /// Graceful-then-forced shutdown. Missing task is success.
    async fn stop(&self, task_id: &str, cancel: &CancellationToken) -> Result<(), VmmError>;

    /// Drop every trace of the task's VM. Idempotent.
    async fn remove(&self, task_id: &str) -> Result<(), VmmError>;
}

/// Production manager driving the Firecracker VMM.
pub struct FirecrackerManager {
    socket_dir: PathBuf,
    jailer: JailerSettings,
    store: Arc<StateStore>,
    instances: RwLock<HashMap<String, VmInstance>>,
}

impl FirecrackerManager {
    pub fn new(config: &Config, store: Arc<StateStore>) -> Self {
        Self {
            socket_dir: config.socket_dir.clone(),
            jailer: config.jailer.clone(),
            store,
            instances: RwLock::new(HashMap::new()),
        }
    }

    /// API socket path for a task.
    pub fn socket_path(&self, task_id: &str) -> PathBuf {
        self.socket_dir.join(format!("{task_id}.sock"))
    }

    /// Seed the in-memory map from persisted records (daemon restart).
    /// Records whose process is gone are flipped to crashed.
    pub async fn recover(&self) -> usize {
        let persisted = self.store.list();
        let mut recovered = 0;

        let mut instances = self.instances.write().await;
        for mut vm in persisted {
            if !vm.state.is_terminal() && !pid_alive(vm.pid) {
                vm.state = VmState::Crashed;
                if let Err(e) = self.store.update_status(&vm.task_id, VmState::Crashed) {
                    warn!(task_id = %vm.task_id, error = %e, "Failed to persist crash mark");
                }
                let _ = self
                    .store
                    .update_error(&vm.task_id, "VMM process gone after executor restart");
            }
            recovered += 1;
            instances.insert(vm.task_id.clone(), vm);
        }
        recovered
    }

    async fn set_state(&self, task_id: &str, state: VmState) {
        {
            let mut instances = self.instances.write().await;
            if let Some(vm) = instances.get_mut(task_id) {
                vm.state = state;
            }
        }
        if let Err(e) = self.store.update_status(task_id, state) {
            warn!(task_id = %task_id, state = %state, error = %e, "Failed to persist state change");
        }
    }

    async fn mark_crashed(&self, task_id: &str, message: &str) {
        self.set_state(task_id, VmState::Crashed).await;
        if let Err(e) = self.store.update_error(task_id, message) {
            warn!(task_id = %task_id, error = %e, "Failed to persist crash error");
        }
    }

    /// Kill the process and drop the provisional record after a failed start.
    async fn abort_start(&self, task_id: &str, pid: i32, socket_path: &Path) {
        if pid > 0 {
            let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
        }
        remove_socket_file(socket_path);
        self.instances.write().await.remove(task_id);
    }

    fn spawn_vmm(
        &self,
        task_id: &str,
        doc: &VmConfigDocument,
    ) -> Result<(tokio::process::Child, PathBuf, VmConfigDocument), VmmError> {
        let firecracker = which::which("firecracker")
            .map_err(|_| VmmError::BinaryMissing("firecracker".to_string()))?;

        let socket_name = format!("{task_id}.sock");

        let (mut command, socket_path, staged) = if self.jailer.enabled {
            let jailer_bin = which::which("jailer")
                .map_err(|_| VmmError::BinaryMissing("jailer".to_string()))?;

            let jail = Jail::new(task_id, &self.jailer);
            let staged = jail.stage(doc)?;
            let host_socket = jail.host_socket_path(&socket_name);
            let guest_socket = jail.guest_socket_path(&socket_name);

            let mut command = Command::new(jailer_bin);
            command
                .args(jail.jailer_args(&self.jailer, &firecracker))
                .arg("--")
                .arg("--api-sock")
                .arg(&guest_socket)
                .arg("--config-file")
                .arg("-");
            (command, host_socket, staged)
        } else {
            let socket_path = self.socket_path(task_id);
            let mut command = Command::new(firecracker);
            command
                .arg("--api-sock")
                .arg(&socket_path)
                .arg("--config-file")
                .arg("-");
            (command, socket_path, doc.clone())
        };

        // Remove a stale socket left by a crashed predecessor.
        remove_socket_file(&socket_path);
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        Ok((child, socket_path, staged))
    }
}

#[async_trait]
impl VmmManager for FirecrackerManager {
    async fn start(
        &self,
        task: &Task,
        doc: &VmConfigDocument,
        cancel: &CancellationToken,
    ) -> Result<(), VmmError> {
        let task_id = &task.task_id;

        let init_system = task
            .annotation(annotations::INIT_SYSTEM)
            .unwrap_or("none")
            .to_string();
        let grace_period_secs = task
            .annotation(annotations::INIT_GRACE_SEC)
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_GRACE_SECS);

        // Provisional entry: refuses duplicates and reserves the slot
        // without holding the lock across the spawn and readiness I/O.
        let provisional = VmInstance {
            task_id: task_id.clone(),
            pid: 0,
            api_socket_path: self.socket_path(task_id),
            state: VmState::Starting,
            created_at: Utc::now(),
            init_system: init_system.clone(),
            grace_period_secs,
            image: task.runtime.image.clone(),
            vcpus: doc.machine.vcpu_count,
            memory_mib: doc.machine.mem_size_mib,
            kernel_path: doc.boot_source.kernel_image_path.clone(),
            rootfs_path: doc
                .drives
                .first()
                .map(|d| d.path_on_host.clone())
                .unwrap_or_default(),
            log_path: None,
            last_error: None,
            error_at: None,
        };

        {
            let mut instances = self.instances.write().await;
            if instances.contains_key(task_id) {
                return Err(VmmError::AlreadyExists(task_id.clone()));
            }
            instances.insert(task_id.clone(), provisional);
        }

        let (mut child, socket_path, staged) = match self.spawn_vmm(task_id, doc) {
            Ok(spawned) => spawned,
            Err(e) => {
                self.instances.write().await.remove(task_id);
                return Err(e);
            }
        };

        let pid = child.id().map(|p| p as i32).unwrap_or(0);
        info!(task_id = %task_id, pid, socket = %socket_path.display(), "VMM process spawned");

        // Hand the configuration document over stdin. The staged variant only
        // differs when the jailer rewrote artifact paths.
        let rendered = match staged.render() {
            Ok(json) => json,
            Err(e) => {
                self.abort_start(task_id, pid, &socket_path).await;
                return Err(e.into());
            }
        };
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(rendered.as_bytes()).await {
                self.abort_start(task_id, pid, &socket_path).await;
                return Err(e.into());
            }
            // Closing stdin tells the VMM the document is complete.
            drop(stdin);
        }

        spawn_output_drain(task_id, child.stdout.take(), child.stderr.take());

        // Reap the child when it exits so the pid never zombifies.
        {
            let task_id = task_id.clone();
            tokio::spawn(async move {
                match child.wait().await {
                    Ok(status) => {
                        debug!(task_id = %task_id, status = %status, "VMM process exited")
                    }
                    Err(e) => warn!(task_id = %task_id, error = %e, "VMM process wait failed"),
                }
            });
        }

        // Readiness: poll the API socket until it answers.
        let client = VmmClient::new(&socket_path);
        let deadline = tokio::time::Instant::now() + READINESS_TIMEOUT;
        loop {
            if cancel.is_cancelled() {
                self.abort_start(task_id, pid, &socket_path).await;
                return Err(VmmError::Cancelled(task_id.clone()));
            }
            if client.instance_info().await.is_ok() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                self.abort_start(task_id, pid, &socket_path).await;
                return Err(VmmError::ApiNotReady(READINESS_TIMEOUT));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        if let Err(e) = client.start_instance().await {
            self.abort_start(task_id, pid, &socket_path).await;
            return Err(e.into());
        }

        // Commit: the VM is running.
        let record = {
            let mut instances = self.instances.write().await;
            if let Some(vm) = instances.get_mut(task_id) {
                vm.pid = pid;
                vm.api_socket_path = socket_path.clone();
                vm.state = VmState::Running;
                vm.clone()
            } else {
                // Removed underneath us (concurrent remove); treat as cancelled.
                let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
                return Err(VmmError::Cancelled(task_id.clone()));
            }
        };

        if let Err(e) = self.store.add(record) {
            warn!(task_id = %task_id, error = %e, "Failed to persist VM record");
        }

        info!(task_id = %task_id, pid, "VM started");
        Ok(())
    }

    async fn describe(&self, task_id: &str) -> Result<RuntimeStatus, VmmError> {
        let record = { self.instances.read().await.get(task_id).cloned() };
        let Some(record) = record else {
            return Ok(RuntimeStatus::bare(TaskState::Orphaned));
        };

        match record.state {
            VmState::Stopped => Ok(RuntimeStatus::bare(TaskState::Complete)),
            VmState::Crashed => Ok(RuntimeStatus::bare(TaskState::Crashed)),
            // A provisional entry has no pid yet; the start in flight owns it.
            VmState::New | VmState::Starting if record.pid == 0 => {
                Ok(RuntimeStatus::bare(TaskState::Running))
            }
            _ => {
                if pid_alive(record.pid) {
                    let vmm_state = VmmClient::new(&record.api_socket_path)
                        .instance_info()
                        .await
                        .ok()
                        .map(|info| info.state);
                    Ok(RuntimeStatus {
                        state: TaskState::Running,
                        pid: Some(record.pid),
                        uptime_secs: Some((Utc::now() - record.created_at).num_seconds()),
                        vmm_state,
                    })
                } else if record.state == VmState::Stopping {
                    // Death during a stop is the expected outcome.
                    self.set_state(task_id, VmState::Stopped).await;
                    Ok(RuntimeStatus::bare(TaskState::Complete))
                } else {
                    self.mark_crashed(task_id, "VMM process exited unexpectedly")
                        .await;
                    Ok(RuntimeStatus::bare(TaskState::Crashed))
                }
            }
        }
    }

    async fn wait(
        &self,
        task_id: &str,
        cancel: &CancellationToken,
    ) -> Result<RuntimeStatus, VmmError> {
        loop {
            let status = self.describe(task_id).await?;
            if status.state.is_terminal() {
                return Ok(status);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(status),
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }

    async fn stop(&self, task_id: &str, cancel: &CancellationToken) -> Result<(), VmmError> {
        let record = { self.instances.read().await.get(task_id).cloned() };
        let Some(record) = record else {
            debug!(task_id = %task_id, "Stop for unknown task is a no-op");
            return Ok(());
        };
        if record.state.is_terminal() {
            return Ok(());
        }

        self.set_state(task_id, VmState::Stopping).await;
        let pid = Pid::from_raw(record.pid);

        if record.init_system != "none" {
            // Graceful: the in-guest init forwards SIGTERM to the workload.
            info!(
                task_id = %task_id,
                init = %record.init_system,
                grace_secs = record.grace_period_secs,
                "Graceful shutdown"
            );
            let _ = kill(pid, Signal::SIGTERM);

            let deadline =
                tokio::time::Instant::now() + Duration::from_secs(record.grace_period_secs);
            loop {
                if !pid_alive(record.pid) {
                    break;
                }
                if cancel.is_cancelled() || tokio::time::Instant::now() >= deadline {
                    warn!(task_id = %task_id, "Grace period expired, forcing kill");
                    force_kill(record.pid).await;
                    break;
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        } else {
            // Hard: ask the VMM for a soft reset, then watch the socket.
            info!(task_id = %task_id, "Hard shutdown via CtrlAltDel");
            let client = VmmClient::new(&record.api_socket_path);
            if let Err(e) = client.send_ctrl_alt_del().await {
                warn!(task_id = %task_id, error = %e, "CtrlAltDel failed, will force kill");
            }

            let deadline = tokio::time::Instant::now() + HARD_SHUTDOWN_TIMEOUT;
            loop {
                if !pid_alive(record.pid) || !record.api_socket_path.exists() {
                    break;
                }
                if cancel.is_cancelled() || tokio::time::Instant::now() >= deadline {
                    warn!(task_id = %task_id, "Shutdown timed out, forcing kill");
                    break;
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
            force_kill(record.pid).await;
        }

        remove_socket_file(&record.api_socket_path);
        self.set_state(task_id, VmState::Stopped).await;
        info!(task_id = %task_id, "VM stopped");
        Ok(())
    }

    async fn remove(&self, task_id: &str) -> Result<(), VmmError> {
        let record = { self.instances.write().await.remove(task_id) };

        if let Some(record) = record {
            if pid_alive(record.pid) {
                let _ = kill(Pid::from_raw(record.pid), Signal::SIGKILL);
            }
            remove_socket_file(&record.api_socket_path);

            if self.jailer.enabled {
                if let Err(e) = Jail::new(task_id, &self.jailer).cleanup() {
                    warn!(task_id = %task_id, error = %e, "Failed to remove jail chroot");
                }
            }
        }

        self.store.remove(task_id)?;
        debug!(task_id = %task_id, "VM record removed");
        Ok(())
    }
}

/// Signal-0 liveness probe.
fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    kill(Pid::from_raw(pid), None).is_ok()
}

/// SIGKILL and wait (bounded) for the process to disappear.
async fn force_kill(pid: i32) {
    if !pid_alive(pid) {
        return;
    }
    let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);

    let deadline = tokio::time::Instant::now() + KILL_REAP_TIMEOUT;
    while pid_alive(pid) && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn remove_socket_file(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(socket = %path.display(), error = %e, "Failed to remove socket file");
        }
    }
}

/// Drain child output into debug logs so the pipes never fill up.
fn spawn_output_drain(
    task_id: &str,
    stdout: Option<tokio::process::ChildStdout>,
    stderr: Option<tokio::process::ChildStderr>,
) {
    if let Some(stdout) = stdout {
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(task_id = %task_id, stream = "stdout", line = %line, "vmm output");
            }
        });
    }
    if let Some(stderr) = stderr {
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(task_id = %task_id, stream = "stderr", line = %line, "vmm output");
            }
        });
    }
}

#[cfg(test)]
impl FirecrackerManager {
    /// Test hook: seed a record without spawning anything.
    pub async fn insert_record_for_test(&self, vm: VmInstance) {
        if let Err(e) = self.store.add(vm.clone()) {
            warn!(error = %e, "test record persist failed");
        }
        self.instances.write().await.insert(vm.task_id.clone(), vm);
    }
}
