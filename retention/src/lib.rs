//! Write-retention buffer for sparse-column row stores.
//!
//! [`RetentionBuffer`] sits in front of any [`common::Store`] and holds the
//! writes issued against each row for a configurable retention window.
//! Everything written to a row during the window is merged into a single
//! pending request, and only its net effect is sent to the backing store:
//! the latest value of each column, the sum of its increments, or a delete
//! of the whole row.
//!
//! Merges from concurrent callers are ordered by per-request transaction ids,
//! and a merge that loses the race against the eviction worker is retried
//! against a fresh request, so no write is dropped.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use common::{InMemoryStore, RowChanges, Store};
//! use retention::{RetentionBuffer, RetentionConfig};
//!
//! let backend = Arc::new(InMemoryStore::new());
//! let buffer = RetentionBuffer::new(RetentionConfig::new(Duration::from_millis(50)), backend)?;
//! buffer.start();
//!
//! let changes = RowChanges::new().with_increment("stats", "visits", 1);
//! buffer.store_changes(None, "users", "u1", &changes).await?;
//!
//! buffer.shutdown().await?;
//! ```

mod buffer;
mod config;
mod error;
mod metrics;
mod pending;
mod queue;
mod row;
mod worker;

#[cfg(test)]
mod test_utils;

pub use buffer::RetentionBuffer;
pub use config::RetentionConfig;
pub use error::{Error, Result};
pub use metrics::{FlushKind, FlushLabels, FlushOutcome, Metrics};
pub use pending::{Merge, NetEffect, PendingRequest, RequestSealed};
pub use queue::DelayQueue;
pub use row::RowKey;
pub use worker::WorkerState;
