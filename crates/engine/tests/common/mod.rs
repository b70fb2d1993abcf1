#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ferry_engine::{
    ChunkRequest, RetryPolicy, Subscription, TransferConfig, TransferEvent, TransferManager,
    TransferPlan, Transport, TransportError, TransportFuture,
};
use tokio::sync::Semaphore;

/// Transport whose chunk outcomes are scripted per chunk index.
///
/// Each attempt pops the next scripted error for its chunk; once the script
/// is empty the attempt succeeds. With a gate installed, every attempt
/// waits for a permit before returning. The begin and complete hooks pop
/// their own scripts the same way.
#[derive(Default)]
pub struct ScriptedTransport {
    pub size: u64,
    scripts: Mutex<HashMap<usize, VecDeque<TransportError>>>,
    attempts: Mutex<HashMap<usize, u32>>,
    gate: Option<Arc<Semaphore>>,
    started: AtomicUsize,
    begin_script: Mutex<VecDeque<TransportError>>,
    complete_script: Mutex<VecDeque<TransportError>>,
    pub begun: AtomicUsize,
    pub completed: AtomicUsize,
    pub aborted: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(size: u64) -> Self {
        Self {
            size,
            ..Self::default()
        }
    }

    /// Holds every attempt until [`release`](Self::release) is called.
    pub fn gated(size: u64) -> Self {
        Self {
            size,
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Self::default()
        }
    }

    pub fn fail_chunk(
        self,
        index: usize,
        errors: impl IntoIterator<Item = TransportError>,
    ) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(index)
            .or_default()
            .extend(errors);
        self
    }

    pub fn fail_begin(self, errors: impl IntoIterator<Item = TransportError>) -> Self {
        self.begin_script.lock().unwrap().extend(errors);
        self
    }

    pub fn fail_complete(self, errors: impl IntoIterator<Item = TransportError>) -> Self {
        self.complete_script.lock().unwrap().extend(errors);
        self
    }

    /// Lets `n` held attempts finish.
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    pub fn attempts(&self, index: usize) -> u32 {
        self.attempts.lock().unwrap().get(&index).copied().unwrap_or(0)
    }

    /// Number of attempts that have started, across all chunks.
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

impl Transport for ScriptedTransport {
    fn transfer_chunk<'a>(&'a self, request: &'a ChunkRequest) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            *self.attempts.lock().unwrap().entry(request.index).or_default() += 1;
            self.started.fetch_add(1, Ordering::SeqCst);

            if let Some(gate) = &self.gate {
                tokio::select! {
                    permit = gate.acquire() => {
                        if let Ok(p) = permit {
                            p.forget();
                        }
                    }
                    _ = request.cancel.cancelled() => {
                        return Err(TransportError::Retryable("cancelled".into()));
                    }
                }
            }

            let scripted = self
                .scripts
                .lock()
                .unwrap()
                .get_mut(&request.index)
                .and_then(VecDeque::pop_front);
            match scripted {
                Some(err) => Err(err),
                None => Ok(()),
            }
        })
    }

    fn stat_object<'a>(&'a self, _key: &'a str) -> TransportFuture<'a, u64> {
        Box::pin(async move { Ok(self.size) })
    }

    fn begin_transfer<'a>(&'a self, _plan: &'a TransferPlan) -> TransportFuture<'a, ()> {
        self.begun.fetch_add(1, Ordering::SeqCst);
        let scripted = self.begin_script.lock().unwrap().pop_front();
        Box::pin(async move { scripted.map_or(Ok(()), Err) })
    }

    fn complete_transfer<'a>(&'a self, _plan: &'a TransferPlan) -> TransportFuture<'a, ()> {
        self.completed.fetch_add(1, Ordering::SeqCst);
        let scripted = self.complete_script.lock().unwrap().pop_front();
        Box::pin(async move { scripted.map_or(Ok(()), Err) })
    }

    fn abort_transfer<'a>(&'a self, _plan: &'a TransferPlan) -> TransportFuture<'a, ()> {
        self.aborted.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}

pub fn config(chunk_size: u64, workers: usize) -> TransferConfig {
    TransferConfig {
        chunk_size,
        workers,
        retry: RetryPolicy::immediate(3),
    }
}

pub fn manager(
    transport: &Arc<ScriptedTransport>,
    chunk_size: u64,
    workers: usize,
) -> TransferManager {
    let transport = Arc::clone(transport) as Arc<dyn Transport>;
    TransferManager::new(transport, config(chunk_size, workers)).unwrap()
}

/// Writes `len` bytes to a temporary file.
pub fn source_file(len: usize) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&vec![0xAB; len]).unwrap();
    file.flush().unwrap();
    file
}

/// Everything delivered to a subscription, in delivery order.
#[derive(Default)]
pub struct Recorded {
    pub events: Mutex<Vec<TransferEvent>>,
}

impl Recorded {
    pub fn subscription(self: &Arc<Self>) -> Subscription {
        let (p, c, e, x) = (
            Arc::clone(self),
            Arc::clone(self),
            Arc::clone(self),
            Arc::clone(self),
        );
        let id = ferry_transfer::TaskId::new();
        Subscription::new()
            .on_progress(move |transferred, total| {
                p.events.lock().unwrap().push(TransferEvent::Progress {
                    task_id: id,
                    transferred,
                    total,
                });
            })
            .on_complete(move || {
                c.events.lock().unwrap().push(TransferEvent::Completed { task_id: id });
            })
            .on_error(move |error| {
                e.events.lock().unwrap().push(TransferEvent::Failed {
                    task_id: id,
                    error: error.clone(),
                });
            })
            .on_cancelled(move || {
                x.events.lock().unwrap().push(TransferEvent::Cancelled { task_id: id });
            })
    }

    pub fn progress(&self) -> Vec<u64> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                TransferEvent::Progress { transferred, .. } => Some(*transferred),
                _ => None,
            })
            .collect()
    }

    pub fn terminal(&self) -> Vec<TransferEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.is_terminal())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

/// Polls `cond` until it holds, panicking after five seconds.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}
