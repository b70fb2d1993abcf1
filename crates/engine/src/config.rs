use ferry_transfer::{DEFAULT_CHUNK_SIZE, TransferError};
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Default number of concurrent chunk workers per task.
pub const DEFAULT_WORKERS: usize = 4;

/// Engine tuning: chunk size, worker pool size and retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Chunk size in bytes.
    pub chunk_size: u64,
    /// Maximum chunks in flight per task.
    pub workers: usize,
    pub retry: RetryPolicy,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            workers: DEFAULT_WORKERS,
            retry: RetryPolicy::default(),
        }
    }
}

impl TransferConfig {
    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.chunk_size == 0 {
            return Err(invalid("chunk_size must be greater than zero"));
        }
        if self.workers == 0 {
            return Err(invalid("workers must be greater than zero"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts must be at least 1"));
        }
        if !(self.retry.backoff_factor >= 1.0) {
            return Err(invalid("retry.backoff_factor must be at least 1.0"));
        }
        if !(0.0..1.0).contains(&self.retry.jitter) {
            return Err(invalid("retry.jitter must be in [0, 1)"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> TransferError {
    TransferError::InvalidArgument(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = TransferConfig::default();
        assert_eq!(config.chunk_size, 5 * 1024 * 1024);
        assert_eq!(config.workers, 4);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_zero_values() {
        let zero_chunk = TransferConfig {
            chunk_size: 0,
            ..TransferConfig::default()
        };
        assert!(zero_chunk.validate().is_err());

        let zero_workers = TransferConfig {
            workers: 0,
            ..TransferConfig::default()
        };
        assert!(zero_workers.validate().is_err());

        let mut no_attempts = TransferConfig::default();
        no_attempts.retry.max_attempts = 0;
        assert!(no_attempts.validate().is_err());
    }

    #[test]
    fn rejects_bad_backoff() {
        let mut shrinking = TransferConfig::default();
        shrinking.retry.backoff_factor = 0.5;
        assert!(shrinking.validate().is_err());

        let mut nan = TransferConfig::default();
        nan.retry.backoff_factor = f64::NAN;
        assert!(nan.validate().is_err());

        let mut wide = TransferConfig::default();
        wide.retry.jitter = 1.0;
        assert!(wide.validate().is_err());
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: TransferConfig =
            serde_json::from_str(r#"{"workers": 8, "retry": {"max_attempts": 5}}"#).unwrap();
        assert_eq!(config.workers, 8);
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry, RetryPolicy {
            max_attempts: 5,
            ..RetryPolicy::default()
        });
    }
}
