//! # Device Data Store
//!
//! The storage seam the query pipeline executes translated filters against.
//! Results leave the store already serialized as a JSON array.

pub mod memory;

use axum::body::Bytes;
use oq_core::{Filter, SortSpec};

/// Payload returned when nothing matched.
pub const EMPTY_RESULT: &[u8] = b"[]";

/// Fields stripped from every returned record.
pub const HIDDEN_FIELDS: [&str; 2] = ["_id", "_active"];

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Nothing matched. Not a failure.
    #[error("no matching records")]
    NotFound,
    #[error("store backend failure: {0}")]
    Backend(String),
}

#[async_trait::async_trait]
pub trait StorageExecutor: Send + Sync {
    /// Run a filtered, sorted read and return the matching records.
    async fn execute(&self, filter: &Filter, sort: &SortSpec) -> Result<Bytes, StoreError>;

    /// The `time` of the newest record matching `filter`.
    async fn last_entry_time(&self, filter: &Filter) -> Result<Bytes, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}
