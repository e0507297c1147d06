use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use deadpool_postgres::{Config, GenericClient, Pool, PoolConfig, Runtime};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_postgres::NoTls;

use crate::error::HarnessError;

mod embedded {
    use refinery::embed_migrations;
    embed_migrations!("migrations");
}

pub const DEFAULT_POOL_SIZE: usize = 8;

pub fn create_pool(url: &str, pool_size: usize) -> Result<Pool, HarnessError> {
    let mut cfg = Config::new();
    cfg.url = Some(url.to_string());
    cfg.pool = Some(PoolConfig::new(pool_size));

    Ok(cfg.create_pool(Some(Runtime::Tokio1), NoTls)?)
}

pub async fn run_migrations(pool: &Pool) -> Result<(), HarnessError> {
    let mut client = pool.get().await?;
    let report = embedded::migrations::runner()
        .run_async(&mut **client)
        .await?;

    for migration in report.applied_migrations() {
        info!("Applied migration {}", migration);
    }
    Ok(())
}

/// Progress marker written by the worker after each processed block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: String,
    /// Highest block fully processed; `None` until the first block lands.
    pub indexed_to: Option<u64>,
}

/// Read access to the checkpoint of a run.
#[tonic::async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn find_checkpoint(&self, run_id: &str) -> Result<Option<Checkpoint>, HarnessError>;
}

/// One event row written by the `store_events` handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub run_id: String,
    pub block_number: u64,
    pub block_timestamp: DateTime<Utc>,
    pub transaction_hash: String,
    pub address: String,
    pub name: String,
    pub data: Vec<String>,
}

fn to_db_block(block: u64) -> Result<i64, HarnessError> {
    i64::try_from(block)
        .map_err(|_| HarnessError::fatal("storage", format!("block {block} exceeds BIGINT")))
}

fn from_db_block(block: i64) -> Option<u64> {
    u64::try_from(block).ok()
}

pub fn timestamp_from_unix(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(seconds, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Advances the checkpoint of `run_id` to `block`. A lower block never moves
/// an existing checkpoint back.
pub async fn upsert_checkpoint<C: GenericClient>(
    client: &C,
    run_id: &str,
    block: u64,
) -> Result<(), HarnessError> {
    let block = to_db_block(block)?;
    client
        .execute(
            "INSERT INTO indexer_checkpoints (run_id, indexed_to, updated_at)
             VALUES ($1, $2, now())
             ON CONFLICT (run_id) DO UPDATE
             SET indexed_to = GREATEST(indexer_checkpoints.indexed_to, EXCLUDED.indexed_to),
                 updated_at = now()",
            &[&run_id, &block],
        )
        .await?;
    Ok(())
}

pub async fn insert_event<C: GenericClient>(
    client: &C,
    event: &StoredEvent,
) -> Result<(), HarnessError> {
    let block = to_db_block(event.block_number)?;
    let data = Value::from(event.data.clone());
    client
        .execute(
            "INSERT INTO indexed_events
                (run_id, block_number, block_timestamp, transaction_hash, address, name, data)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
            &[
                &event.run_id,
                &block,
                &event.block_timestamp,
                &event.transaction_hash,
                &event.address,
                &event.name,
                &data,
            ],
        )
        .await?;
    Ok(())
}

/// Removes every trace of a run so the worker starts from scratch.
pub async fn delete_run<C: GenericClient>(
    client: &C,
    run_id: &str,
) -> Result<(), HarnessError> {
    let events = client
        .execute("DELETE FROM indexed_events WHERE run_id = $1", &[&run_id])
        .await?;
    client
        .execute(
            "DELETE FROM indexer_checkpoints WHERE run_id = $1",
            &[&run_id],
        )
        .await?;
    debug!("Reset run {run_id}, removed {events} stored event(s)");
    Ok(())
}

pub async fn select_checkpoint<C: GenericClient>(
    client: &C,
    run_id: &str,
) -> Result<Option<Checkpoint>, HarnessError> {
    let row = client
        .query_opt(
            "SELECT indexed_to FROM indexer_checkpoints WHERE run_id = $1",
            &[&run_id],
        )
        .await?;

    Ok(row.map(|row| {
        let indexed_to: Option<i64> = row.get("indexed_to");
        Checkpoint {
            run_id: run_id.to_string(),
            indexed_to: indexed_to.and_then(from_db_block),
        }
    }))
}

/// PostgreSQL backed storage shared by the worker and the harness.
#[derive(Clone)]
pub struct PgCheckpointStore {
    pool: Pool,
}

impl PgCheckpointStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub async fn commit_checkpoint(&self, run_id: &str, block: u64) -> Result<(), HarnessError> {
        let client = self.pool.get().await?;
        upsert_checkpoint(&client, run_id, block).await
    }

    pub async fn reset_run(&self, run_id: &str) -> Result<(), HarnessError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        delete_run(&tx, run_id).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn list_events(&self, run_id: &str) -> Result<Vec<StoredEvent>, HarnessError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT run_id, block_number, block_timestamp, transaction_hash, address, name, data
                 FROM indexed_events
                 WHERE run_id = $1
                 ORDER BY block_number, id",
                &[&run_id],
            )
            .await?;

        rows.into_iter()
            .map(|row| -> Result<StoredEvent, HarnessError> {
                let block_number: i64 = row.get("block_number");
                let data: Value = row.get("data");
                Ok(StoredEvent {
                    run_id: row.get("run_id"),
                    block_number: from_db_block(block_number).unwrap_or_default(),
                    block_timestamp: row.get("block_timestamp"),
                    transaction_hash: row.get("transaction_hash"),
                    address: row.get("address"),
                    name: row.get("name"),
                    data: serde_json::from_value(data)?,
                })
            })
            .collect()
    }
}

#[tonic::async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn find_checkpoint(&self, run_id: &str) -> Result<Option<Checkpoint>, HarnessError> {
        let client = self.pool.get().await?;
        select_checkpoint(&client, run_id).await
    }
}

/// In-process store for exercising checkpoint waits without a database.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: DashMap<String, Option<u64>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commit(&self, run_id: &str, block: u64) {
        let mut entry = self.checkpoints.entry(run_id.to_string()).or_insert(None);
        let next = match *entry {
            Some(current) => current.max(block),
            None => block,
        };
        *entry = Some(next);
    }

    /// Registers a run whose worker has not processed any block yet.
    pub fn register(&self, run_id: &str) {
        self.checkpoints.entry(run_id.to_string()).or_insert(None);
    }

    pub fn reset(&self, run_id: &str) {
        self.checkpoints.remove(run_id);
    }
}

#[tonic::async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn find_checkpoint(&self, run_id: &str) -> Result<Option<Checkpoint>, HarnessError> {
        Ok(self.checkpoints.get(run_id).map(|entry| Checkpoint {
            run_id: run_id.to_string(),
            indexed_to: *entry,
        }))
    }
}
