//! Transfer events and the callback subscriptions they are delivered to.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ferry_transfer::{TaskId, TransferError};
use tracing::debug;

/// Something that happened to a running task.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// Size resolved and plan computed; chunks are about to be dispatched.
    Started {
        task_id: TaskId,
        total_bytes: u64,
        chunks: usize,
    },
    /// A chunk finished. `transferred` is the task's cumulative count.
    Progress {
        task_id: TaskId,
        transferred: u64,
        total: u64,
    },
    Completed {
        task_id: TaskId,
    },
    Failed {
        task_id: TaskId,
        error: TransferError,
    },
    Cancelled {
        task_id: TaskId,
    },
}

impl TransferEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            Self::Started { task_id, .. }
            | Self::Progress { task_id, .. }
            | Self::Completed { task_id }
            | Self::Failed { task_id, .. }
            | Self::Cancelled { task_id } => *task_id,
        }
    }

    /// Returns `true` for the last event a task emits.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Failed { .. } | Self::Cancelled { .. }
        )
    }
}

/// Receives events from an engine.
///
/// `emit` is called from the task's dispatcher, one event at a time and in
/// order. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &TransferEvent);
}

impl<F> EventSink for F
where
    F: Fn(&TransferEvent) + Send + Sync,
{
    fn emit(&self, event: &TransferEvent) {
        self(event)
    }
}

type ProgressFn = Box<dyn Fn(u64, u64) + Send + Sync>;
type CompleteFn = Box<dyn Fn() + Send + Sync>;
type ErrorFn = Box<dyn Fn(&TransferError) + Send + Sync>;

/// A set of optional callbacks for one task.
///
/// ```ignore
/// let sub = Subscription::new()
///     .on_progress(|done, total| println!("{done}/{total}"))
///     .on_complete(|| println!("done"));
/// manager.subscribe(id, sub)?;
/// ```
#[derive(Default)]
pub struct Subscription {
    progress: Option<ProgressFn>,
    complete: Option<CompleteFn>,
    error: Option<ErrorFn>,
    cancelled: Option<CompleteFn>,
}

impl Subscription {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with `(bytes_transferred, total_bytes)` after each chunk.
    pub fn on_progress(mut self, f: impl Fn(u64, u64) + Send + Sync + 'static) -> Self {
        self.progress = Some(Box::new(f));
        self
    }

    pub fn on_complete(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.complete = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&TransferError) + Send + Sync + 'static) -> Self {
        self.error = Some(Box::new(f));
        self
    }

    pub fn on_cancelled(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.cancelled = Some(Box::new(f));
        self
    }

    fn deliver(&self, event: &TransferEvent) {
        match event {
            TransferEvent::Started { .. } => {}
            TransferEvent::Progress {
                transferred, total, ..
            } => {
                if let Some(f) = &self.progress {
                    f(*transferred, *total);
                }
            }
            TransferEvent::Completed { .. } => {
                if let Some(f) = &self.complete {
                    f();
                }
            }
            TransferEvent::Failed { error, .. } => {
                if let Some(f) = &self.error {
                    f(error);
                }
            }
            TransferEvent::Cancelled { .. } => {
                if let Some(f) = &self.cancelled {
                    f();
                }
            }
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("on_progress", &self.progress.is_some())
            .field("on_complete", &self.complete.is_some())
            .field("on_error", &self.error.is_some())
            .field("on_cancelled", &self.cancelled.is_some())
            .finish()
    }
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct TaskSubscribers {
    subs: Vec<(SubscriptionId, Arc<Subscription>)>,
    /// Set once a cancel was accepted: later progress is dropped.
    closed: bool,
    /// The terminal event, once emitted. Replayed to late subscribers.
    terminal: Option<TransferEvent>,
}

/// Per-task subscriber lists, fed by the engine through [`EventSink`].
///
/// Callbacks run outside the table lock, so a callback may call back into
/// the manager.
#[derive(Default)]
pub(crate) struct SubscriberTable {
    tasks: Mutex<HashMap<TaskId, TaskSubscribers>>,
    next_id: AtomicU64,
}

impl SubscriberTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<TaskId, TaskSubscribers>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts accepting subscriptions for `task_id`.
    pub(crate) fn register(&self, task_id: TaskId) {
        self.lock().entry(task_id).or_default();
    }

    /// Drops every subscription for `task_id`.
    pub(crate) fn forget(&self, task_id: TaskId) {
        self.lock().remove(&task_id);
    }

    pub(crate) fn subscribe(
        &self,
        task_id: TaskId,
        subscription: Subscription,
    ) -> Result<SubscriptionId, TransferError> {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let replay = {
            let mut tasks = self.lock();
            let entry = tasks
                .get_mut(&task_id)
                .ok_or(TransferError::NotFound(task_id))?;
            match &entry.terminal {
                Some(event) => Some(event.clone()),
                None => {
                    entry.subs.push((id, Arc::new(subscription)));
                    debug!(task = %task_id, subscription = id.0, "subscribed");
                    return Ok(id);
                }
            }
        };
        if let Some(event) = replay {
            subscription.deliver(&event);
        }
        Ok(id)
    }

    pub(crate) fn unsubscribe(&self, task_id: TaskId, id: SubscriptionId) -> bool {
        let mut tasks = self.lock();
        let Some(entry) = tasks.get_mut(&task_id) else {
            return false;
        };
        let before = entry.subs.len();
        entry.subs.retain(|(sub_id, _)| *sub_id != id);
        entry.subs.len() != before
    }

    /// Stops delivering progress for `task_id`; only its terminal event is
    /// still delivered.
    pub(crate) fn close(&self, task_id: TaskId) {
        if let Some(entry) = self.lock().get_mut(&task_id) {
            entry.closed = true;
        }
    }
}

impl EventSink for SubscriberTable {
    fn emit(&self, event: &TransferEvent) {
        let targets: Vec<Arc<Subscription>> = {
            let mut tasks = self.lock();
            let Some(entry) = tasks.get_mut(&event.task_id()) else {
                return;
            };
            if entry.terminal.is_some() {
                return;
            }
            if event.is_terminal() {
                entry.terminal = Some(event.clone());
                entry.subs.drain(..).map(|(_, sub)| sub).collect()
            } else if entry.closed {
                return;
            } else {
                entry.subs.iter().map(|(_, sub)| Arc::clone(sub)).collect()
            }
        };
        for sub in targets {
            sub.deliver(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counts {
        progress: AtomicUsize,
        complete: AtomicUsize,
        cancelled: AtomicUsize,
        last: AtomicU64,
    }

    fn counting(counts: &Arc<Counts>) -> Subscription {
        let (p, c, x) = (Arc::clone(counts), Arc::clone(counts), Arc::clone(counts));
        Subscription::new()
            .on_progress(move |done, _| {
                p.progress.fetch_add(1, Ordering::SeqCst);
                p.last.store(done, Ordering::SeqCst);
            })
            .on_complete(move || {
                c.complete.fetch_add(1, Ordering::SeqCst);
            })
            .on_cancelled(move || {
                x.cancelled.fetch_add(1, Ordering::SeqCst);
            })
    }

    fn progress(task_id: TaskId, transferred: u64) -> TransferEvent {
        TransferEvent::Progress {
            task_id,
            transferred,
            total: 100,
        }
    }

    #[test]
    fn delivers_in_order_then_terminal_once() {
        let table = SubscriberTable::default();
        let id = TaskId::new();
        table.register(id);
        let counts = Arc::new(Counts::default());
        table.subscribe(id, counting(&counts)).unwrap();

        table.emit(&progress(id, 40));
        table.emit(&progress(id, 100));
        table.emit(&TransferEvent::Completed { task_id: id });
        table.emit(&TransferEvent::Completed { task_id: id });
        table.emit(&progress(id, 100));

        assert_eq!(counts.progress.load(Ordering::SeqCst), 2);
        assert_eq!(counts.last.load(Ordering::SeqCst), 100);
        assert_eq!(counts.complete.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn late_subscriber_gets_terminal_immediately() {
        let table = SubscriberTable::default();
        let id = TaskId::new();
        table.register(id);
        table.emit(&TransferEvent::Cancelled { task_id: id });

        let counts = Arc::new(Counts::default());
        table.subscribe(id, counting(&counts)).unwrap();
        assert_eq!(counts.cancelled.load(Ordering::SeqCst), 1);

        table.emit(&TransferEvent::Cancelled { task_id: id });
        assert_eq!(counts.cancelled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn closed_task_drops_progress_but_not_terminal() {
        let table = SubscriberTable::default();
        let id = TaskId::new();
        table.register(id);
        let counts = Arc::new(Counts::default());
        table.subscribe(id, counting(&counts)).unwrap();

        table.close(id);
        table.emit(&progress(id, 10));
        table.emit(&TransferEvent::Cancelled { task_id: id });

        assert_eq!(counts.progress.load(Ordering::SeqCst), 0);
        assert_eq!(counts.cancelled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let table = SubscriberTable::default();
        let id = TaskId::new();
        table.register(id);
        let counts = Arc::new(Counts::default());
        let sub = table.subscribe(id, counting(&counts)).unwrap();

        assert!(table.unsubscribe(id, sub));
        assert!(!table.unsubscribe(id, sub));
        table.emit(&progress(id, 10));
        assert_eq!(counts.progress.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unknown_task_is_not_found() {
        let table = SubscriberTable::default();
        let id = TaskId::new();
        let err = table.subscribe(id, Subscription::new()).unwrap_err();
        assert_eq!(err, TransferError::NotFound(id));
    }

    #[test]
    fn closures_are_sinks() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let sink: Arc<dyn EventSink> = Arc::new(move |e: &TransferEvent| {
            s.lock().unwrap().push(e.clone());
        });
        let id = TaskId::new();
        sink.emit(&TransferEvent::Completed { task_id: id });
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(seen.lock().unwrap()[0].is_terminal());
    }
}
