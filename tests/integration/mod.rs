//! End-to-end tests for the indexer harness.
//!
//! ## Test Organization
//!
//! - **readiness**: session start-up against a static service stack
//! - **worker_lifecycle**: launching, crashing and terminating workers
//! - **end_to_end**: workers indexing mock gateway blocks into storage
//!
//! ## Running Integration Tests
//!
//! Every test starts its own PostgreSQL container. Run them sequentially to
//! avoid port and container contention:
//!
//! ```bash
//! cargo test --features test-harness -- --test-threads=1
//! ```

pub mod end_to_end;
pub mod readiness;
pub mod worker_lifecycle;

use indexer_harness::worker::EventFilter;

pub const WORKER_BINARY: &str = env!("CARGO_BIN_EXE_indexer-worker");

pub const TOKEN_ADDRESS: &str = "0x049d36570d4e46f48e99674bd3fcc84644ddd6b96f7c741b1562b82f9e004dc7";

pub fn transfer_filter() -> Vec<EventFilter> {
    vec![EventFilter::new(TOKEN_ADDRESS, "Transfer")]
}
