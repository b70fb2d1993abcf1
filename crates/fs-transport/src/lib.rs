//! Local directory object store for ferry.
//!
//! [`LocalTransport`] implements `ferry_engine::Transport` on top of a
//! plain directory: each key is a relative path under the root. It backs the
//! `ferry` CLI and doubles as a realistic transport for engine tests.

mod checksum;
mod store;

pub use checksum::{checksum_bytes, file_checksum};
pub use store::{LocalTransport, PART_DIR};
