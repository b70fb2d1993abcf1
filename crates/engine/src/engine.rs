//! Chunk dispatcher: drives one task's plan through a bounded worker pool.
//!
//! [`TransferEngine::start`] moves the task to InProgress and spawns a
//! dispatcher onto the tokio runtime. The dispatcher resolves the total
//! size, computes the chunk plan and keeps up to `workers` chunks in flight.
//! Commands arrive through the returned [`EngineHandle`]:
//!
//! - pause stops new dispatches; in-flight chunks finish and are counted.
//! - resume re-enables dispatch of the remaining chunks.
//! - cancel fires the cancellation token; in-flight chunks are aborted and
//!   their results discarded.

use std::sync::Arc;

use ferry_transfer::{ChunkPlanner, Direction, TaskId, TaskState, TransferError, TransferTask};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::TransferConfig;
use crate::events::{EventSink, TransferEvent};
use crate::retry::{RetryError, run_with_retry};
use crate::transport::{ChunkRequest, Transport, TransferPlan};

/// Result of a pause/resume/cancel command that was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The task changed state.
    Applied,
    /// The task was already in the requested state.
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Running,
    Paused,
}

/// Starts dispatchers for tasks against one transport.
pub struct TransferEngine {
    transport: Arc<dyn Transport>,
    config: TransferConfig,
}

impl TransferEngine {
    /// Creates an engine after validating `config`.
    pub fn new(
        transport: Arc<dyn Transport>,
        config: TransferConfig,
    ) -> Result<Self, TransferError> {
        config.validate()?;
        Ok(Self { transport, config })
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Moves a Pending task to InProgress and spawns its dispatcher.
    ///
    /// Returns immediately. Outside a tokio runtime this fails with
    /// `InvalidArgument` and the task stays Pending.
    pub fn start(
        &self,
        task: Arc<TransferTask>,
        sink: Arc<dyn EventSink>,
    ) -> Result<EngineHandle, TransferError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            TransferError::InvalidArgument("start requires a running tokio runtime".into())
        })?;
        task.transition(TaskState::InProgress)?;
        info!(
            task = %task.id(),
            direction = %task.direction(),
            key = %task.remote_key(),
            path = %task.local_path().display(),
            "transfer started"
        );

        let (control_tx, control_rx) = watch::channel(Control::Running);
        let (done_tx, done_rx) = watch::channel(false);
        let cancel = CancellationToken::new();

        let dispatcher = Dispatcher {
            task: Arc::clone(&task),
            transport: Arc::clone(&self.transport),
            config: self.config.clone(),
            sink,
            control: control_rx,
            cancel: cancel.clone(),
        };
        runtime.spawn(async move {
            dispatcher.run().await;
            let _ = done_tx.send(true);
        });

        Ok(EngineHandle {
            task,
            control: control_tx,
            cancel,
            done: done_rx,
        })
    }
}

/// Command side of a running task.
///
/// Dropping the handle cancels the task.
pub struct EngineHandle {
    task: Arc<TransferTask>,
    control: watch::Sender<Control>,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

impl EngineHandle {
    pub fn task_id(&self) -> TaskId {
        self.task.id()
    }

    /// Stops dispatching new chunks.
    pub fn pause(&self) -> Result<CommandOutcome, TransferError> {
        let outcome = self.steer(TaskState::Paused, Control::Paused)?;
        if outcome == CommandOutcome::Applied {
            info!(task = %self.task.id(), "transfer paused");
        }
        Ok(outcome)
    }

    /// Re-enables dispatch of the remaining chunks.
    pub fn resume(&self) -> Result<CommandOutcome, TransferError> {
        let outcome = self.steer(TaskState::InProgress, Control::Running)?;
        if outcome == CommandOutcome::Applied {
            info!(task = %self.task.id(), "transfer resumed");
        }
        Ok(outcome)
    }

    /// Moves the task to `state` and publishes `control` while holding the
    /// channel's lock; task state and control value always agree.
    fn steer(&self, state: TaskState, control: Control) -> Result<CommandOutcome, TransferError> {
        let mut result = Ok(false);
        self.control.send_if_modified(|current| {
            result = self.task.transition_idempotent(state);
            if matches!(result, Ok(true)) {
                *current = control;
                true
            } else {
                false
            }
        });
        Ok(if result? {
            CommandOutcome::Applied
        } else {
            CommandOutcome::Unchanged
        })
    }

    /// Cancels the task. No chunk is dispatched once this returns.
    pub fn cancel(&self) -> Result<CommandOutcome, TransferError> {
        if !self.task.transition_idempotent(TaskState::Cancelled)? {
            return Ok(CommandOutcome::Unchanged);
        }
        self.cancel.cancel();
        info!(task = %self.task.id(), "transfer cancelled");
        Ok(CommandOutcome::Applied)
    }

    /// Returns `true` once the dispatcher has exited.
    pub fn is_finished(&self) -> bool {
        *self.done.borrow()
    }

    /// Resolves once the dispatcher has exited and emitted its terminal
    /// event.
    pub fn finished(&self) -> impl Future<Output = ()> + Send + use<> {
        let mut done = self.done.clone();
        async move {
            let _ = done.wait_for(|d| *d).await;
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// How a dispatcher run ended.
enum Finish {
    Completed,
    Cancelled,
    Failed(TransferError),
}

impl From<RetryError> for Finish {
    fn from(err: RetryError) -> Self {
        match err {
            RetryError::Cancelled => Finish::Cancelled,
            RetryError::Failed(e) => Finish::Failed(e),
        }
    }
}

struct Dispatcher {
    task: Arc<TransferTask>,
    transport: Arc<dyn Transport>,
    config: TransferConfig,
    sink: Arc<dyn EventSink>,
    control: watch::Receiver<Control>,
    cancel: CancellationToken,
}

impl Dispatcher {
    async fn run(mut self) {
        // Once begin_transfer has been attempted the plan goes to finish, so
        // an interrupted or failed begin is still aborted.
        let (finish, begun) = match self.prepare().await {
            Ok((mut planner, plan)) => {
                let finish = self.begin_and_dispatch(&mut planner, &plan).await;
                (finish, Some(plan))
            }
            Err(finish) => (finish, None),
        };
        self.finish(finish, begun.as_ref()).await;
    }

    /// Resolves the size and plans the chunks.
    async fn prepare(&mut self) -> Result<(ChunkPlanner, TransferPlan), Finish> {
        let id = self.task.id();
        let total = self.resolve_size().await?;
        self.task.set_total_bytes(total).map_err(Finish::Failed)?;

        let planner =
            ChunkPlanner::plan(id, total, self.config.chunk_size).map_err(Finish::Failed)?;
        let plan = TransferPlan {
            task_id: id,
            direction: self.task.direction(),
            remote_key: self.task.remote_key().to_string(),
            local_path: self.task.local_path().to_path_buf(),
            total_bytes: total,
            chunk_size: self.config.chunk_size,
            chunk_count: planner.len(),
        };
        debug!(task = %id, total_bytes = total, chunks = planner.len(), "transfer planned");
        Ok((planner, plan))
    }

    /// Calls `begin_transfer`, then dispatches the chunks.
    async fn begin_and_dispatch(
        &mut self,
        planner: &mut ChunkPlanner,
        plan: &TransferPlan,
    ) -> Finish {
        let transport = &self.transport;
        if let Err(e) = run_with_retry(&self.config.retry, &self.cancel, "begin", |_| {
            transport.begin_transfer(plan)
        })
        .await
        {
            return e.into();
        }

        self.sink.emit(&TransferEvent::Started {
            task_id: plan.task_id,
            total_bytes: plan.total_bytes,
            chunks: plan.chunk_count,
        });
        self.dispatch(planner, plan).await
    }

    async fn resolve_size(&self) -> Result<u64, Finish> {
        match self.task.direction() {
            Direction::Upload => {
                let path = self.task.local_path();
                let meta = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(Finish::Cancelled),
                    meta = tokio::fs::metadata(path) => meta,
                };
                let meta = meta.map_err(|e| {
                    Finish::Failed(TransferError::InvalidArgument(format!(
                        "cannot read source {}: {e}",
                        path.display()
                    )))
                })?;
                if !meta.is_file() {
                    return Err(Finish::Failed(TransferError::InvalidArgument(format!(
                        "source {} is not a regular file",
                        path.display()
                    ))));
                }
                Ok(meta.len())
            }
            Direction::Download => {
                let key = self.task.remote_key();
                let transport = &self.transport;
                let total = run_with_retry(&self.config.retry, &self.cancel, "stat", |_| {
                    transport.stat_object(key)
                })
                .await?;
                Ok(total)
            }
        }
    }

    async fn dispatch(&mut self, planner: &mut ChunkPlanner, plan: &TransferPlan) -> Finish {
        let id = self.task.id();
        let total = plan.total_bytes;
        let mut in_flight: JoinSet<(usize, Result<(), RetryError>)> = JoinSet::new();
        let mut finalized = false;

        loop {
            if self.cancel.is_cancelled() {
                in_flight.shutdown().await;
                return Finish::Cancelled;
            }

            let running = *self.control.borrow_and_update() == Control::Running;
            if running {
                while in_flight.len() < self.config.workers {
                    let Some(chunk) = planner.next_pending() else {
                        break;
                    };
                    let (index, range) = (chunk.index, chunk.range);

                    if range.is_empty() {
                        // Nothing to move for an empty object.
                        if let Err(e) = planner.mark_done(index) {
                            in_flight.shutdown().await;
                            return Finish::Failed(e);
                        }
                        self.report_progress(0, total);
                        continue;
                    }

                    if let Err(e) = planner.mark_in_flight(index) {
                        in_flight.shutdown().await;
                        return Finish::Failed(e);
                    }
                    debug!(task = %id, chunk = index, %range, "chunk dispatched");

                    let request = ChunkRequest {
                        task_id: id,
                        index,
                        direction: plan.direction,
                        remote_key: plan.remote_key.clone(),
                        local_path: plan.local_path.clone(),
                        range,
                        cancel: self.cancel.child_token(),
                    };
                    let transport = Arc::clone(&self.transport);
                    let policy = self.config.retry.clone();
                    in_flight.spawn(async move {
                        let operation = format!("chunk {index}");
                        let result = run_with_retry(&policy, &request.cancel, &operation, |_| {
                            transport.transfer_chunk(&request)
                        })
                        .await;
                        (index, result)
                    });
                }

                if in_flight.is_empty() && planner.is_complete() {
                    if !finalized {
                        let transport = &self.transport;
                        if let Err(e) =
                            run_with_retry(&self.config.retry, &self.cancel, "complete", |_| {
                                transport.complete_transfer(plan)
                            })
                            .await
                        {
                            return e.into();
                        }
                        finalized = true;
                    }
                    match self.task.transition(TaskState::Completed) {
                        Ok(_) => return Finish::Completed,
                        Err(_) if self.task.state() == TaskState::Cancelled => {
                            return Finish::Cancelled;
                        }
                        // Paused after the last chunk; completes on resume.
                        Err(_) => {}
                    }
                }
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {}
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    match joined {
                        Ok((index, Ok(()))) => {
                            let len = match planner.mark_done(index) {
                                Ok(chunk) => chunk.range.len(),
                                Err(e) => {
                                    in_flight.shutdown().await;
                                    return Finish::Failed(e);
                                }
                            };
                            debug!(task = %id, chunk = index, bytes = len, "chunk done");
                            if let Err(e) = self.record(len, total) {
                                in_flight.shutdown().await;
                                return Finish::Failed(e);
                            }
                        }
                        Ok((_, Err(RetryError::Cancelled))) => {}
                        Ok((index, Err(RetryError::Failed(e)))) => {
                            let _ = planner.mark_failed(index);
                            debug!(task = %id, chunk = index, error = %e, "chunk failed");
                            in_flight.shutdown().await;
                            return Finish::Failed(e);
                        }
                        Err(join_err) => {
                            in_flight.shutdown().await;
                            return Finish::Failed(TransferError::FatalTransport(format!(
                                "chunk worker aborted: {join_err}"
                            )));
                        }
                    }
                }
                changed = self.control.changed() => {
                    if changed.is_err() {
                        // Handle dropped without a command.
                        let _ = self.task.transition_idempotent(TaskState::Cancelled);
                        self.cancel.cancel();
                    }
                }
            }
        }
    }

    /// Adds a finished chunk to the task counter and reports it.
    fn record(&self, len: u64, total: u64) -> Result<(), TransferError> {
        if let Some(transferred) = self.task.record_progress(len)? {
            trace!(task = %self.task.id(), transferred, total, "progress");
            self.sink.emit(&TransferEvent::Progress {
                task_id: self.task.id(),
                transferred,
                total,
            });
        }
        Ok(())
    }

    fn report_progress(&self, len: u64, total: u64) {
        if let Err(e) = self.record(len, total) {
            warn!(task = %self.task.id(), error = %e, "progress not recorded");
        }
    }

    async fn finish(&self, finish: Finish, begun: Option<&TransferPlan>) {
        let id = self.task.id();
        let finish = match finish {
            Finish::Failed(e) => match self.task.fail(e.clone()) {
                Ok(()) => Finish::Failed(e),
                // Lost the race against cancel.
                Err(_) => Finish::Cancelled,
            },
            other => other,
        };

        match finish {
            Finish::Completed => {
                info!(
                    task = %id,
                    bytes = self.task.bytes_transferred(),
                    "transfer completed"
                );
                self.sink.emit(&TransferEvent::Completed { task_id: id });
            }
            Finish::Cancelled => {
                let _ = self.task.transition_idempotent(TaskState::Cancelled);
                self.abort(begun).await;
                info!(
                    task = %id,
                    bytes = self.task.bytes_transferred(),
                    "transfer stopped after cancel"
                );
                self.sink.emit(&TransferEvent::Cancelled { task_id: id });
            }
            Finish::Failed(e) => {
                self.abort(begun).await;
                error!(task = %id, error = %e, "transfer failed");
                self.sink.emit(&TransferEvent::Failed {
                    task_id: id,
                    error: e,
                });
            }
        }
    }

    async fn abort(&self, begun: Option<&TransferPlan>) {
        let Some(plan) = begun else {
            return;
        };
        if let Err(e) = self.transport.abort_transfer(plan).await {
            warn!(task = %plan.task_id, error = %e, "abort failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use ferry_transfer::TaskSpec;

    use crate::transport::{TransportError, TransportFuture};

    /// Serves every chunk immediately and reports a fixed object size.
    struct InstantTransport {
        size: u64,
        chunks: Mutex<Vec<usize>>,
    }

    impl Transport for InstantTransport {
        fn transfer_chunk<'a>(&'a self, request: &'a ChunkRequest) -> TransportFuture<'a, ()> {
            Box::pin(async move {
                self.chunks.lock().unwrap().push(request.index);
                Ok(())
            })
        }

        fn stat_object<'a>(&'a self, _key: &'a str) -> TransportFuture<'a, u64> {
            Box::pin(async move { Ok(self.size) })
        }
    }

    /// Never finishes a chunk on its own; optionally hangs in `begin_transfer`.
    #[derive(Default)]
    struct StalledTransport {
        hang_begin: bool,
        begun: AtomicUsize,
        aborted: AtomicUsize,
    }

    impl Transport for StalledTransport {
        fn transfer_chunk<'a>(&'a self, request: &'a ChunkRequest) -> TransportFuture<'a, ()> {
            Box::pin(async move {
                request.cancel.cancelled().await;
                Err(TransportError::Retryable("cancelled".into()))
            })
        }

        fn stat_object<'a>(&'a self, _key: &'a str) -> TransportFuture<'a, u64> {
            Box::pin(async { Ok(20) })
        }

        fn begin_transfer<'a>(&'a self, _plan: &'a TransferPlan) -> TransportFuture<'a, ()> {
            self.begun.fetch_add(1, Ordering::SeqCst);
            let hang = self.hang_begin;
            Box::pin(async move {
                if hang {
                    std::future::pending::<()>().await;
                }
                Ok(())
            })
        }

        fn abort_transfer<'a>(&'a self, _plan: &'a TransferPlan) -> TransportFuture<'a, ()> {
            self.aborted.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }
    }

    struct MissingTransport;

    impl Transport for MissingTransport {
        fn transfer_chunk<'a>(&'a self, _request: &'a ChunkRequest) -> TransportFuture<'a, ()> {
            Box::pin(async { Ok(()) })
        }

        fn stat_object<'a>(&'a self, key: &'a str) -> TransportFuture<'a, u64> {
            Box::pin(async move { Err(TransportError::NotFound(key.to_string())) })
        }
    }

    fn config(chunk_size: u64) -> TransferConfig {
        TransferConfig {
            chunk_size,
            workers: 2,
            retry: crate::retry::RetryPolicy::immediate(3),
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<TransferEvent>>>, Arc<dyn EventSink>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let e = Arc::clone(&events);
        let sink: Arc<dyn EventSink> = Arc::new(move |ev: &TransferEvent| {
            e.lock().unwrap().push(ev.clone());
        });
        (events, sink)
    }

    fn download_task() -> Arc<TransferTask> {
        Arc::new(TransferTask::new(TaskSpec::download("obj", "/tmp/ferry-engine-test")).unwrap())
    }

    #[tokio::test]
    async fn download_runs_every_chunk_once() {
        let transport = Arc::new(InstantTransport {
            size: 25,
            chunks: Mutex::new(Vec::new()),
        });
        let engine = TransferEngine::new(transport.clone(), config(10)).unwrap();
        let (events, sink) = recorder();
        let task = download_task();

        let handle = engine.start(Arc::clone(&task), sink).unwrap();
        handle.finished().await;

        assert_eq!(task.state(), TaskState::Completed);
        assert_eq!(task.bytes_transferred(), 25);
        let mut chunks = transport.chunks.lock().unwrap().clone();
        chunks.sort_unstable();
        assert_eq!(chunks, vec![0, 1, 2]);

        let events = events.lock().unwrap();
        assert!(matches!(
            events.first(),
            Some(TransferEvent::Started { total_bytes: 25, chunks: 3, .. })
        ));
        assert!(matches!(events.last(), Some(TransferEvent::Completed { .. })));
    }

    #[tokio::test]
    async fn empty_object_completes_without_transport_calls() {
        let transport = Arc::new(InstantTransport {
            size: 0,
            chunks: Mutex::new(Vec::new()),
        });
        let engine = TransferEngine::new(transport.clone(), config(10)).unwrap();
        let (events, sink) = recorder();
        let task = download_task();

        let handle = engine.start(Arc::clone(&task), sink).unwrap();
        handle.finished().await;

        assert_eq!(task.state(), TaskState::Completed);
        assert!(transport.chunks.lock().unwrap().is_empty());
        let progress = events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, TransferEvent::Progress { .. }))
            .count();
        assert_eq!(progress, 1);
    }

    #[tokio::test]
    async fn missing_remote_object_fails_task() {
        let engine = TransferEngine::new(Arc::new(MissingTransport), config(10)).unwrap();
        let (events, sink) = recorder();
        let task = download_task();

        let handle = engine.start(Arc::clone(&task), sink).unwrap();
        handle.finished().await;

        assert_eq!(task.state(), TaskState::Failed);
        assert_eq!(
            task.error(),
            Some(TransferError::RemoteObjectNotFound("obj".into()))
        );
        assert!(matches!(
            events.lock().unwrap().last(),
            Some(TransferEvent::Failed { .. })
        ));
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let transport = Arc::new(InstantTransport {
            size: 5,
            chunks: Mutex::new(Vec::new()),
        });
        let engine = TransferEngine::new(transport, config(10)).unwrap();
        let (_, sink) = recorder();
        let task = download_task();

        let handle = engine.start(Arc::clone(&task), Arc::clone(&sink)).unwrap();
        let err = engine.start(Arc::clone(&task), sink).err().unwrap();
        assert!(matches!(err, TransferError::InvalidStateTransition { .. }));
        handle.finished().await;
    }

    #[test]
    fn rejects_invalid_config() {
        let transport = Arc::new(MissingTransport);
        assert!(TransferEngine::new(transport, config(0)).is_err());
    }

    #[tokio::test]
    async fn missing_upload_source_is_invalid_argument() {
        let engine = TransferEngine::new(Arc::new(MissingTransport), config(10)).unwrap();
        let (_, sink) = recorder();
        let task = Arc::new(
            TransferTask::new(TaskSpec::upload("/nonexistent/ferry/source.bin", "k")).unwrap(),
        );

        let handle = engine.start(Arc::clone(&task), sink).unwrap();
        handle.finished().await;

        assert_eq!(task.state(), TaskState::Failed);
        assert_eq!(
            task.error().map(|e| e.kind()),
            Some(ferry_transfer::ErrorKind::InvalidArgument)
        );
    }

    #[test]
    fn start_outside_runtime_leaves_task_pending() {
        let engine = TransferEngine::new(Arc::new(MissingTransport), config(10)).unwrap();
        let (_, sink) = recorder();
        let task = download_task();

        let err = engine.start(Arc::clone(&task), sink).err().unwrap();
        assert_eq!(err.kind(), ferry_transfer::ErrorKind::InvalidArgument);
        assert_eq!(task.state(), TaskState::Pending);
    }

    #[tokio::test]
    async fn cancel_during_begin_still_aborts() {
        let transport = Arc::new(StalledTransport {
            hang_begin: true,
            ..StalledTransport::default()
        });
        let engine = TransferEngine::new(transport.clone(), config(10)).unwrap();
        let (events, sink) = recorder();
        let task = download_task();

        let handle = engine.start(Arc::clone(&task), sink).unwrap();
        while transport.begun.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(handle.cancel().unwrap(), CommandOutcome::Applied);
        handle.finished().await;

        assert_eq!(task.state(), TaskState::Cancelled);
        assert_eq!(transport.aborted.load(Ordering::SeqCst), 1);
        let events = events.lock().unwrap();
        assert!(!events.iter().any(|e| matches!(e, TransferEvent::Started { .. })));
        assert!(matches!(events.last(), Some(TransferEvent::Cancelled { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_pause_resume_keeps_control_in_step() {
        let transport = Arc::new(StalledTransport::default());
        let engine = TransferEngine::new(transport, config(5)).unwrap();
        let (_, sink) = recorder();
        let task = download_task();
        let handle = engine.start(Arc::clone(&task), sink).unwrap();

        std::thread::scope(|scope| {
            for t in 0..8 {
                let handle = &handle;
                scope.spawn(move || {
                    for n in 0..200 {
                        let _ = if (t + n) % 2 == 0 {
                            handle.pause()
                        } else {
                            handle.resume()
                        };
                    }
                });
            }
        });

        let control = *handle.control.borrow();
        match task.state() {
            TaskState::Paused => assert_eq!(control, Control::Paused),
            TaskState::InProgress => assert_eq!(control, Control::Running),
            other => panic!("unexpected state {other}"),
        }

        handle.cancel().unwrap();
        handle.finished().await;
        assert_eq!(task.state(), TaskState::Cancelled);
    }
}
