//! Storage seams for the carbon record store.
//!
//! The raw production table, the summary table and the settings blob are all
//! external collaborators. The engine only ever talks to them through the
//! traits below; backends live in the submodules.

use async_trait::async_trait;
use crs_core::{ProductionSummaryRecord, RawProductionRecord};
use futures::stream::BoxStream;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod blob_fs;
pub mod memory;
pub mod postgres;

pub use blob_fs::FsBlobStore;
pub use memory::{MemoryBlobStore, MemoryProductionStore, MemorySummaryStore};
pub use postgres::PgEntityStore;

pub const CRATE_NAME: &str = "crs-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid blob name: {0}")]
    InvalidName(String),
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("entity {key} could not be decoded: {message}")]
    Decode { key: String, message: String },
    #[error("{0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Production entities in table order. A `StoreError::Decode` item affects
/// that entity only; the stream keeps going after it.
pub type ProductionStream<'a> = BoxStream<'a, Result<RawProductionRecord, StoreError>>;

/// Read side of the raw production table.
#[async_trait]
pub trait ProductionSource: Send + Sync {
    /// Streams production entities, optionally filtered on `groupId`.
    async fn stream_productions<'a>(
        &'a self,
        group_id: Option<&'a str>,
    ) -> Result<ProductionStream<'a>, StoreError>;
}

/// Decode one stored entity. The entity's row key is its id, whatever the
/// payload carries.
pub fn decode_production(row_key: String, data: JsonValue) -> Result<RawProductionRecord, StoreError> {
    match serde_json::from_value::<RawProductionRecord>(data) {
        Ok(mut record) => {
            record.id = Some(row_key);
            Ok(record)
        }
        Err(err) => Err(StoreError::Decode {
            key: row_key,
            message: err.to_string(),
        }),
    }
}

/// The summary table. The engine is its only writer by convention.
#[async_trait]
pub trait SummaryStore: Send + Sync {
    /// Create the table if absent. Calling it on an existing table is a no-op.
    async fn ensure_table(&self) -> Result<(), StoreError>;

    async fn list_summaries(
        &self,
        group_id: Option<&str>,
    ) -> Result<Vec<ProductionSummaryRecord>, StoreError>;

    async fn delete_summary(&self, partition_key: &str, row_key: &str) -> Result<(), StoreError>;

    /// Fails with `StoreError::AlreadyExists` when the key is taken.
    async fn create_summary(&self, record: &ProductionSummaryRecord) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub name: String,
    pub content_hash: String,
    pub byte_size: usize,
}

/// Named-blob storage used for the calculation settings document.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get_blob(&self, name: &str) -> Result<Vec<u8>, StoreError>;

    async fn put_blob(
        &self,
        name: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<StoredBlob, StoreError>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub(crate) fn validate_blob_name(name: &str) -> Result<(), StoreError> {
    let bad = name.is_empty()
        || name.starts_with('.')
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..");
    if bad {
        Err(StoreError::InvalidName(name.to_string()))
    } else {
        Ok(())
    }
}
