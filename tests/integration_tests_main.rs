//! Integration tests driving a real `indexer-worker` process against a
//! containerized PostgreSQL and an in-process mock gateway.
//!
//! The tests themselves live in the `integration/` module, grouped by area.

#![cfg(feature = "test-harness")]

mod integration;

pub use integration::*;
