use anyhow::Result;
use deadpool_postgres::Transaction;
use std::sync::Arc;

use crate::proto::gateway::BlockEvents;
use crate::storage::{insert_event, timestamp_from_unix, StoredEvent};
use crate::worker::RunIdentity;

pub const STORE_EVENTS: &str = "store_events";
pub const CHECKPOINT_ONLY: &str = "checkpoint_only";

/// Turns one block of events into documents.
///
/// Handlers run inside the transaction that also advances the checkpoint, so
/// a block is either fully stored or not at all.
#[tonic::async_trait]
pub trait BatchHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns the number of documents written.
    async fn handle(
        &self,
        tx: &Transaction<'_>,
        run_id: &RunIdentity,
        batch: &BlockEvents,
    ) -> Result<usize>;
}

/// Stores every event as one row of `indexed_events`.
#[derive(Debug, Default)]
pub struct StoreEventsHandler;

#[tonic::async_trait]
impl BatchHandler for StoreEventsHandler {
    fn name(&self) -> &'static str {
        STORE_EVENTS
    }

    async fn handle(
        &self,
        tx: &Transaction<'_>,
        run_id: &RunIdentity,
        batch: &BlockEvents,
    ) -> Result<usize> {
        let block_timestamp = timestamp_from_unix(batch.block_timestamp);

        for event in &batch.events {
            let stored = StoredEvent {
                run_id: run_id.to_string(),
                block_number: batch.block_number,
                block_timestamp,
                transaction_hash: event.transaction_hash.clone(),
                address: event.address.clone(),
                name: event.name.clone(),
                data: event.data.clone(),
            };
            insert_event(tx, &stored).await?;
        }

        Ok(batch.events.len())
    }
}

/// Only advances the checkpoint.
#[derive(Debug, Default)]
pub struct CheckpointOnlyHandler;

#[tonic::async_trait]
impl BatchHandler for CheckpointOnlyHandler {
    fn name(&self) -> &'static str {
        CHECKPOINT_ONLY
    }

    async fn handle(
        &self,
        _tx: &Transaction<'_>,
        _run_id: &RunIdentity,
        _batch: &BlockEvents,
    ) -> Result<usize> {
        Ok(0)
    }
}

pub fn handler_by_name(name: &str) -> Option<Arc<dyn BatchHandler>> {
    match name {
        STORE_EVENTS => Some(Arc::new(StoreEventsHandler)),
        CHECKPOINT_ONLY => Some(Arc::new(CheckpointOnlyHandler)),
        _ => None,
    }
}

pub fn handler_names() -> &'static [&'static str] {
    &[STORE_EVENTS, CHECKPOINT_ONLY]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        for name in handler_names() {
            let handler = handler_by_name(name).unwrap();
            assert_eq!(handler.name(), *name);
        }
        assert!(handler_by_name("unknown").is_none());
    }
}
