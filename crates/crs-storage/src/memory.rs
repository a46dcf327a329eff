//! In-process stores for tests and database-less local runs.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use crs_core::{loose_text, ProductionSummaryRecord, RawProductionRecord};
use futures::stream::{self, StreamExt};
use serde_json::Value as JsonValue;
use tokio::sync::{Mutex, RwLock};

use crate::{
    decode_production, sha256_hex, validate_blob_name, BlobStore, ProductionSource, ProductionStream,
    StoreError, StoredBlob, SummaryStore,
};

/// Raw production entities keyed by row key, stored as the JSON payload a
/// table backend would hold.
#[derive(Debug, Default)]
pub struct MemoryProductionStore {
    entities: RwLock<Vec<(String, JsonValue)>>,
}

impl MemoryProductionStore {
    pub fn new(records: Vec<RawProductionRecord>) -> Self {
        Self {
            entities: RwLock::new(records.iter().enumerate().map(entity_of).collect()),
        }
    }

    pub async fn insert(&self, record: RawProductionRecord) {
        let mut entities = self.entities.write().await;
        let entity = entity_of((entities.len(), &record));
        entities.push(entity);
    }

    /// Store a payload as-is, including ones that will not decode.
    pub async fn insert_entity(&self, row_key: impl Into<String>, data: JsonValue) {
        self.entities.write().await.push((row_key.into(), data));
    }

    pub async fn replace_all(&self, records: Vec<RawProductionRecord>) {
        *self.entities.write().await = records.iter().enumerate().map(entity_of).collect();
    }
}

fn entity_of((idx, record): (usize, &RawProductionRecord)) -> (String, JsonValue) {
    let row_key = record
        .id
        .clone()
        .unwrap_or_else(|| format!("entity-{idx}"));
    let data = serde_json::to_value(record).unwrap_or(JsonValue::Null);
    (row_key, data)
}

#[async_trait]
impl ProductionSource for MemoryProductionStore {
    async fn stream_productions<'a>(
        &'a self,
        group_id: Option<&'a str>,
    ) -> Result<ProductionStream<'a>, StoreError> {
        let matching = self
            .entities
            .read()
            .await
            .iter()
            .filter(|(_, data)| {
                group_id.is_none() || data.get("groupId").and_then(loose_text).as_deref() == group_id
            })
            .cloned()
            .collect::<Vec<_>>();
        Ok(stream::iter(matching)
            .map(|(row_key, data)| decode_production(row_key, data))
            .boxed())
    }
}

type SummaryTable = BTreeMap<(String, String), ProductionSummaryRecord>;

/// Summary table keyed by (partition, row). Operations other than
/// `ensure_table` fail with `NotFound` until the table has been created.
#[derive(Debug, Default)]
pub struct MemorySummaryStore {
    table: Mutex<Option<SummaryTable>>,
}

impl MemorySummaryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-created table holding `rows`.
    pub fn with_rows(rows: Vec<ProductionSummaryRecord>) -> Self {
        let table = rows
            .into_iter()
            .map(|r| ((r.partition_key.clone(), r.row_key.clone()), r))
            .collect();
        Self {
            table: Mutex::new(Some(table)),
        }
    }

    pub async fn rows(&self) -> Vec<ProductionSummaryRecord> {
        self.table
            .lock()
            .await
            .as_ref()
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn table_exists(&self) -> bool {
        self.table.lock().await.is_some()
    }
}

fn missing_table() -> StoreError {
    StoreError::NotFound("summary table".to_string())
}

#[async_trait]
impl SummaryStore for MemorySummaryStore {
    async fn ensure_table(&self) -> Result<(), StoreError> {
        let mut table = self.table.lock().await;
        if table.is_none() {
            *table = Some(BTreeMap::new());
        }
        Ok(())
    }

    async fn list_summaries(
        &self,
        group_id: Option<&str>,
    ) -> Result<Vec<ProductionSummaryRecord>, StoreError> {
        let table = self.table.lock().await;
        let table = table.as_ref().ok_or_else(missing_table)?;
        Ok(table
            .values()
            .filter(|r| group_id.map_or(true, |g| r.group_id == g))
            .cloned()
            .collect())
    }

    async fn delete_summary(&self, partition_key: &str, row_key: &str) -> Result<(), StoreError> {
        let mut table = self.table.lock().await;
        let table = table.as_mut().ok_or_else(missing_table)?;
        table
            .remove(&(partition_key.to_string(), row_key.to_string()))
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("{partition_key}/{row_key}")))
    }

    async fn create_summary(&self, record: &ProductionSummaryRecord) -> Result<(), StoreError> {
        let mut table = self.table.lock().await;
        let table = table.as_mut().ok_or_else(missing_table)?;
        let key = (record.partition_key.clone(), record.row_key.clone());
        if table.contains_key(&key) {
            return Err(StoreError::AlreadyExists(format!("{}/{}", key.0, key.1)));
        }
        table.insert(key, record.clone());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, (Vec<u8>, String)>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn content_type(&self, name: &str) -> Option<String> {
        self.blobs.lock().await.get(name).map(|(_, ct)| ct.clone())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get_blob(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        self.blobs
            .lock()
            .await
            .get(name)
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn put_blob(
        &self,
        name: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<StoredBlob, StoreError> {
        validate_blob_name(name)?;
        self.blobs
            .lock()
            .await
            .insert(name.to_string(), (bytes.to_vec(), content_type.to_string()));
        Ok(StoredBlob {
            name: name.to_string(),
            content_hash: sha256_hex(bytes),
            byte_size: bytes.len(),
        })
    }
}
