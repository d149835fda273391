//! The orchestrator-facing lifecycle contract.
//!
//! Composes the four capability sets (image preparer, network manager,
//! translator, VMM manager) behind `prepare → start → wait → describe →
//! stop → remove` with strict cleanup ordering. Lifecycle operations are
//! serialized per task through a keyed lock; different tasks proceed in
//! parallel. `describe`/`wait` are read-only probes and bypass the per-task
//! lock, so a long `wait` can never deadlock a concurrent `stop`.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::events::{EventBus, TaskEvent, TaskPhase};
use crate::image::{ImageError, ImagePreparer};
use crate::network::{NetError, NetworkManager};
use crate::task::Task;
use crate::translate::{TranslateError, Translator};
use crate::vmm::{RuntimeStatus, VmmError, VmmManager};

/// Errors surfaced to the orchestrator, attributed to the failing component.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("image preparer: {0}")]
    Image(#[from] ImageError),

    #[error("network manager: {0}")]
    Network(#[from] NetError),

    #[error("task translator: {0}")]
    Translate(#[from] TranslateError),

    #[error("vmm manager: {0}")]
    Vmm(#[from] VmmError),

    #[error("remove finished with errors: {}", errors.join("; "))]
    Cleanup { errors: Vec<String> },
}

/// The per-node executor.
pub struct Executor {
    translator: Arc<dyn Translator>,
    image: Arc<dyn ImagePreparer>,
    network: Arc<dyn NetworkManager>,
    vmm: Arc<dyn VmmManager>,
    events: EventBus,
    task_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Executor {
    pub fn new(
        translator: Arc<dyn Translator>,
        image: Arc<dyn ImagePreparer>,
        network: Arc<dyn NetworkManager>,
        vmm: Arc<dyn VmmManager>,
    ) -> Self {
        Self {
            translator,
            image,
            network,
            vmm,
            events: EventBus::default(),
            task_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to the status event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    async fn task_lock(&self, task_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.task_locks.lock().await;
        locks
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn fail(&self, task_id: &str, error: &dyn std::fmt::Display) {
        self.events
            .emit(task_id, TaskPhase::Failed, Some(error.to_string()));
    }

    /// Materialize the rootfs, then plumb the network. A network failure
    /// does not undo the image: the cached artifact is shared state, not a
    /// leak. A task with no attachments never touches the network manager.
    pub async fn prepare(
        &self,
        task: &mut Task,
        cancel: &CancellationToken,
    ) -> Result<(), ExecutorError> {
        let lock = self.task_lock(&task.task_id).await;
        let _guard = lock.lock().await;

        self.events.emit(&task.task_id, TaskPhase::Preparing, None);

        if let Err(e) = self.image.prepare(task, cancel).await {
            self.fail(&task.task_id, &e);
            return Err(e.into());
        }

        if !task.networks.is_empty() {
            if let Err(e) = self.network.prepare_network(task, cancel).await {
                self.fail(&task.task_id, &e);
                return Err(e.into());
            }
        }

        self.events.emit(&task.task_id, TaskPhase::Prepared, None);
        Ok(())
    }

    /// Translate and boot. A start failure leaves network resources in
    /// place; `remove` owns their release.
    pub async fn start(
        &self,
        task: &Task,
        cancel: &CancellationToken,
    ) -> Result<(), ExecutorError> {
        let lock = self.task_lock(&task.task_id).await;
        let _guard = lock.lock().await;

        self.events.emit(&task.task_id, TaskPhase::Starting, None);

        let doc = match self.translator.translate(task) {
            Ok(doc) => doc,
            Err(e) => {
                self.fail(&task.task_id, &e);
                return Err(e.into());
            }
        };

        if let Err(e) = self.vmm.start(task, &doc, cancel).await {
            self.fail(&task.task_id, &e);
            return Err(e.into());
        }

        self.events.emit(&task.task_id, TaskPhase::Running, None);
        Ok(())
    }

    /// One-shot runtime status.
    pub async fn describe(&self, task: &Task) -> Result<RuntimeStatus, ExecutorError> {
        Ok(self.vmm.describe(&task.task_id).await?)
    }

    /// Block until the task is terminal or the caller cancels.
    pub async fn wait(
        &self,
        task: &Task,
        cancel: &CancellationToken,
    ) -> Result<RuntimeStatus, ExecutorError> {
        Ok(self.vmm.wait(&task.task_id, cancel).await?)
    }

    /// Graceful-then-forced shutdown. Idempotent for already-stopped tasks.
    pub async fn stop(
        &self,
        task: &Task,
        cancel: &CancellationToken,
    ) -> Result<(), ExecutorError> {
        let lock = self.task_lock(&task.task_id).await;
        let _guard = lock.lock().await;

        self.events.emit(&task.task_id, TaskPhase::Stopping, None);

        if let Err(e) = self.vmm.stop(&task.task_id, cancel).await {
            self.fail(&task.task_id, &e);
            return Err(e.into());
        }

        self.events.emit(&task.task_id, TaskPhase::Stopped, None);
        Ok(())
    }

    /// Tear everything down: VMM record first, then the network. Both are
    /// attempted even when the first fails; errors surface combined. The
    /// rootfs artifact is intentionally retained.
    pub async fn remove(&self, task: &Task) -> Result<(), ExecutorError> {
        let lock = self.task_lock(&task.task_id).await;
        let _guard = lock.lock().await;

        let mut errors = Vec::new();

        if let Err(e) = self.vmm.remove(&task.task_id).await {
            warn!(task_id = %task.task_id, error = %e, "VMM removal failed");
            errors.push(format!("vmm manager: {e}"));
        }

        if !task.networks.is_empty() {
            if let Err(e) = self.network.cleanup_network(task).await {
                warn!(task_id = %task.task_id, error = %e, "Network cleanup failed");
                errors.push(format!("network manager: {e}"));
            }
        }

        // The lock entry goes with the task.
        self.task_locks.lock().await.remove(&task.task_id);

        if errors.is_empty() {
            info!(task_id = %task.task_id, "Task removed");
            self.events.emit(&task.task_id, TaskPhase::Removed, None);
            Ok(())
        } else {
            let combined = ExecutorError::Cleanup { errors };
            self.fail(&task.task_id, &combined);
            Err(combined)
        }
    }
}
