//! Async transfer engine for ferry.
//!
//! Drives the chunk plans produced by `ferry-transfer` against a pluggable
//! [`Transport`], with a bounded worker pool per task, per-chunk retry with
//! exponential backoff, and pause/resume/cancel commands that take effect at
//! the next dispatch decision.
//!
//! Most callers only need [`TransferManager`]:
//!
//! 1. **Submit** an upload or download; the task starts out Pending.
//! 2. **Subscribe** callbacks for progress and the terminal outcome.
//! 3. **Start**, then pause, resume or cancel at any time.
//! 4. **Remove** the task once it is terminal.

mod config;
mod engine;
mod events;
mod manager;
mod retry;
mod transport;

pub use config::{DEFAULT_WORKERS, TransferConfig};
pub use engine::{CommandOutcome, EngineHandle, TransferEngine};
pub use events::{EventSink, Subscription, SubscriptionId, TransferEvent};
pub use manager::TransferManager;
pub use retry::RetryPolicy;
pub use transport::{ChunkRequest, TransferPlan, Transport, TransportError, TransportFuture};
