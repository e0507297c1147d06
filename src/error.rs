use std::time::Duration;

use thiserror::Error;

use crate::retry::{GiveUp, PollError};

/// Error type for every harness operation.
///
/// `Fatal` and `Timeout` are the two terminal outcomes of a poll loop and are
/// kept apart so an environment that gave up can be told from one that is
/// broken.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("{check} failed: {reason}")]
    Fatal { check: String, reason: String },

    #[error("{check} timed out after {elapsed:?} ({attempts} attempts), last observed: {last_observed}")]
    Timeout {
        check: String,
        last_observed: String,
        elapsed: Duration,
        attempts: u32,
    },

    #[error("Failed to launch worker for run {run_id}: {source}")]
    WorkerLaunch {
        run_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command `{command}` failed: {message}")]
    Command { command: String, message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] tokio_postgres::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("Failed to create connection pool: {0}")]
    CreatePool(#[from] deadpool_postgres::CreatePoolError),

    #[error("Migration error: {0}")]
    Migration(#[from] refinery::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid backoff policy: {0}")]
    InvalidPolicy(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HarnessError {
    pub fn fatal(check: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Fatal {
            check: check.into(),
            reason: reason.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }
}

impl From<GiveUp> for HarnessError {
    fn from(give_up: GiveUp) -> Self {
        Self::Timeout {
            check: give_up.label,
            last_observed: give_up.last_reason,
            elapsed: give_up.elapsed,
            attempts: give_up.attempts,
        }
    }
}

impl From<PollError<HarnessError>> for HarnessError {
    fn from(error: PollError<HarnessError>) -> Self {
        match error {
            PollError::Fatal(error) => error,
            PollError::Timeout(give_up) => give_up.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_names_check_and_last_state() {
        let error = HarnessError::from(GiveUp {
            label: "containers".to_string(),
            last_reason: "still restarting: gateway".to_string(),
            elapsed: Duration::from_secs(60),
            attempts: 61,
        });

        assert!(error.is_timeout());
        let message = error.to_string();
        assert!(message.starts_with("containers timed out"));
        assert!(message.contains("still restarting: gateway"));
    }

    #[test]
    fn test_fatal_poll_error_is_unwrapped() {
        let error: HarnessError =
            PollError::Fatal(HarnessError::fatal("node", "HTTP 404")).into();

        assert!(error.is_fatal());
        assert_eq!(error.to_string(), "node failed: HTTP 404");
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<HarnessError>();
    }
}
