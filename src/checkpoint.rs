use log::info;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::error::HarnessError;
use crate::retry::{BackoffPolicy, ConditionPoller, PollOutcome};
use crate::storage::{Checkpoint, CheckpointStore};

const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

fn describe(indexed_to: Option<u64>) -> String {
    indexed_to.map_or_else(|| "none".to_string(), |block| block.to_string())
}

/// Blocks a test until the worker has processed a given block.
#[derive(Clone)]
pub struct CheckpointWaiter {
    store: Arc<dyn CheckpointStore>,
    attempt_timeout: Duration,
}

impl CheckpointWaiter {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            store,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }

    pub fn with_attempt_timeout(mut self, attempt_timeout: Duration) -> Self {
        self.attempt_timeout = attempt_timeout;
        self
    }

    /// Waits until the checkpoint of `run_id` reaches `target_block` and
    /// returns the block actually observed, which may be past the target.
    ///
    /// A missing checkpoint, a checkpoint behind the target, and a failed
    /// storage read all count as "not yet".
    pub async fn wait_until_indexed(
        &self,
        run_id: &str,
        target_block: u64,
        policy: &BackoffPolicy,
    ) -> Result<u64, HarnessError> {
        let store = &self.store;
        // Survives failed reads so a timeout still reports it.
        let last_known: Mutex<Option<u64>> = Mutex::new(None);
        let last_known = &last_known;

        let indexed_to = ConditionPoller::new(format!("checkpoint for run {run_id}"), policy)
            .with_attempt_timeout(self.attempt_timeout)
            .poll(|| async move {
                let read = store.find_checkpoint(run_id).await;
                let mut last_known = last_known.lock().unwrap_or_else(PoisonError::into_inner);

                match read {
                    Ok(Some(Checkpoint {
                        indexed_to: Some(indexed_to),
                        ..
                    })) if indexed_to >= target_block => {
                        PollOutcome::<u64, HarnessError>::Success(indexed_to)
                    }
                    Ok(Some(checkpoint)) => {
                        *last_known = checkpoint.indexed_to;
                        PollOutcome::retryable(format!(
                            "indexed_to={}, waiting for {target_block}",
                            describe(*last_known)
                        ))
                    }
                    Ok(None) => {
                        *last_known = None;
                        PollOutcome::retryable(format!(
                            "indexed_to=none (no checkpoint yet), waiting for {target_block}"
                        ))
                    }
                    Err(e) => PollOutcome::retryable(format!(
                        "checkpoint read failed: {e}; last indexed_to={}, waiting for {target_block}",
                        describe(*last_known)
                    )),
                }
            })
            .await?;

        info!("Run {run_id} indexed to block {indexed_to} (target {target_block})");
        Ok(indexed_to)
    }
}
