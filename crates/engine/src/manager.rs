//! Caller-facing façade: submit, control, observe and remove transfers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ferry_transfer::{
    TaskId, TaskSnapshot, TaskSpec, TaskState, TransferError, TransferRegistry,
};
use tracing::{debug, info};

use crate::config::TransferConfig;
use crate::engine::{CommandOutcome, EngineHandle, TransferEngine};
use crate::events::{EventSink, SubscriberTable, Subscription, SubscriptionId, TransferEvent};
use crate::transport::Transport;

/// Owns the task registry, the engine and the subscriber lists.
///
/// Every method is non-blocking except [`wait`](Self::wait), which is
/// async. Commands on unknown ids fail with `NotFound`; commands that are
/// not valid in the task's current state fail with
/// `InvalidStateTransition`.
pub struct TransferManager {
    registry: TransferRegistry,
    engine: TransferEngine,
    handles: Mutex<HashMap<TaskId, EngineHandle>>,
    subscribers: Arc<SubscriberTable>,
}

impl TransferManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: TransferConfig,
    ) -> Result<Self, TransferError> {
        Ok(Self {
            registry: TransferRegistry::new(),
            engine: TransferEngine::new(transport, config)?,
            handles: Mutex::new(HashMap::new()),
            subscribers: Arc::new(SubscriberTable::default()),
        })
    }

    pub fn config(&self) -> &TransferConfig {
        self.engine.config()
    }

    fn handles(&self) -> MutexGuard<'_, HashMap<TaskId, EngineHandle>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a pending upload of `local_path` to `remote_key`.
    pub fn submit_upload(
        &self,
        local_path: impl Into<PathBuf>,
        remote_key: impl Into<String>,
    ) -> Result<TaskId, TransferError> {
        self.submit(TaskSpec::upload(local_path, remote_key))
    }

    /// Registers a pending download of `remote_key` to `local_path`.
    pub fn submit_download(
        &self,
        remote_key: impl Into<String>,
        local_path: impl Into<PathBuf>,
    ) -> Result<TaskId, TransferError> {
        self.submit(TaskSpec::download(remote_key, local_path))
    }

    pub fn submit(&self, spec: TaskSpec) -> Result<TaskId, TransferError> {
        let task = self.registry.submit(spec)?;
        self.subscribers.register(task.id());
        Ok(task.id())
    }

    /// Starts a pending task. Returns once the dispatcher is spawned.
    ///
    /// The dispatcher runs on the current tokio runtime; called outside one,
    /// this fails with `InvalidArgument` and the task stays Pending.
    pub fn start(&self, id: TaskId) -> Result<(), TransferError> {
        let task = self.registry.get(id)?;
        let mut handles = self.handles();
        let sink: Arc<dyn EventSink> = Arc::clone(&self.subscribers) as Arc<dyn EventSink>;
        let handle = self.engine.start(task, sink)?;
        handles.insert(id, handle);
        Ok(())
    }

    pub fn pause(&self, id: TaskId) -> Result<CommandOutcome, TransferError> {
        self.command(id, TaskState::Paused, EngineHandle::pause)
    }

    pub fn resume(&self, id: TaskId) -> Result<CommandOutcome, TransferError> {
        self.command(id, TaskState::InProgress, EngineHandle::resume)
    }

    /// Cancels a pending or running task.
    ///
    /// Once this returns `Applied`, no further progress or completion
    /// callbacks are made for the task; subscribers receive
    /// `on_cancelled`.
    pub fn cancel(&self, id: TaskId) -> Result<CommandOutcome, TransferError> {
        let task = self.registry.get(id)?;
        let handles = self.handles();
        if let Some(handle) = handles.get(&id) {
            let outcome = handle.cancel()?;
            if outcome == CommandOutcome::Applied {
                self.subscribers.close(id);
            }
            return Ok(outcome);
        }

        // Never started: nothing to stop, so the manager reports it.
        if !task.transition_idempotent(TaskState::Cancelled)? {
            return Ok(CommandOutcome::Unchanged);
        }
        drop(handles);
        info!(task = %id, "pending transfer cancelled");
        self.subscribers.emit(&TransferEvent::Cancelled { task_id: id });
        Ok(CommandOutcome::Applied)
    }

    fn command(
        &self,
        id: TaskId,
        target: TaskState,
        apply: fn(&EngineHandle) -> Result<CommandOutcome, TransferError>,
    ) -> Result<CommandOutcome, TransferError> {
        let task = self.registry.get(id)?;
        match self.handles().get(&id) {
            Some(handle) => apply(handle),
            None => Err(TransferError::InvalidStateTransition {
                from: task.state(),
                to: target,
            }),
        }
    }

    /// Registers callbacks for a task.
    ///
    /// If the task already finished, its terminal callback runs before this
    /// returns.
    pub fn subscribe(
        &self,
        id: TaskId,
        subscription: Subscription,
    ) -> Result<SubscriptionId, TransferError> {
        self.registry.get(id)?;
        self.subscribers.subscribe(id, subscription)
    }

    /// Removes a subscription. Returns `false` if it was not registered.
    pub fn unsubscribe(
        &self,
        id: TaskId,
        subscription: SubscriptionId,
    ) -> Result<bool, TransferError> {
        self.registry.get(id)?;
        Ok(self.subscribers.unsubscribe(id, subscription))
    }

    pub fn get_status(&self, id: TaskId) -> Result<TaskSnapshot, TransferError> {
        Ok(self.registry.get(id)?.snapshot())
    }

    /// Snapshots of every task, in submission order.
    pub fn list(&self) -> Vec<TaskSnapshot> {
        self.registry.list().iter().map(|t| t.snapshot()).collect()
    }

    /// Evicts a terminal task and drops its subscriptions.
    pub fn remove(&self, id: TaskId) -> Result<TaskSnapshot, TransferError> {
        let task = self.registry.remove(id)?;
        self.handles().remove(&id);
        self.subscribers.forget(id);
        debug!(task = %id, "transfer removed");
        Ok(task.snapshot())
    }

    /// Waits until the task's dispatcher has finished and returns the final
    /// snapshot. A task cancelled before it started resolves immediately.
    pub async fn wait(&self, id: TaskId) -> Result<TaskSnapshot, TransferError> {
        let task = self.registry.get(id)?;
        let finished = self.handles().get(&id).map(EngineHandle::finished);
        match finished {
            Some(finished) => finished.await,
            None if task.is_terminal() => {}
            None => {
                return Err(TransferError::InvalidArgument(format!(
                    "task {id} has not been started"
                )));
            }
        }
        Ok(task.snapshot())
    }
}
