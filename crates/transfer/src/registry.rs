use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use crate::{TaskId, TaskSpec, TransferError, TransferTask};

/// Process-wide table of submitted tasks, keyed by id.
///
/// Inserts and removals take the table's write lock; lookups and listing
/// only read. Tasks are shared with `Arc`, so removing a task detaches it
/// from the table without invalidating references an engine still holds.
#[derive(Default)]
pub struct TransferRegistry {
    tasks: RwLock<HashMap<TaskId, Entry>>,
    next_seq: AtomicU64,
}

struct Entry {
    seq: u64,
    task: Arc<TransferTask>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<TaskId, Entry>> {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<TaskId, Entry>> {
        self.tasks.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates a pending task from `spec` and registers it.
    pub fn submit(&self, spec: TaskSpec) -> Result<Arc<TransferTask>, TransferError> {
        let task = Arc::new(TransferTask::new(spec)?);
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.write().insert(
            task.id(),
            Entry {
                seq,
                task: Arc::clone(&task),
            },
        );
        debug!(
            task = %task.id(),
            direction = %task.direction(),
            key = %task.remote_key(),
            "task submitted"
        );
        Ok(task)
    }

    /// Looks up a task by id.
    pub fn get(&self, id: TaskId) -> Result<Arc<TransferTask>, TransferError> {
        self.read()
            .get(&id)
            .map(|e| Arc::clone(&e.task))
            .ok_or(TransferError::NotFound(id))
    }

    /// Returns all tasks in submission order.
    pub fn list(&self) -> Vec<Arc<TransferTask>> {
        let tasks = self.read();
        let mut entries: Vec<&Entry> = tasks.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| Arc::clone(&e.task)).collect()
    }

    /// Removes a task that has reached a terminal state.
    ///
    /// The check and the removal happen under one write lock, so a task
    /// cannot be evicted mid-transfer.
    pub fn remove(&self, id: TaskId) -> Result<Arc<TransferTask>, TransferError> {
        let mut tasks = self.write();
        let entry = tasks.get(&id).ok_or(TransferError::NotFound(id))?;
        let state = entry.task.state();
        if !state.is_terminal() {
            return Err(TransferError::InvalidStateTransition {
                from: state,
                to: state,
            });
        }
        let removed = tasks
            .remove(&id)
            .map(|e| e.task)
            .ok_or(TransferError::NotFound(id))?;
        debug!(task = %id, %state, "task removed");
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
