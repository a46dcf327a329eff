//! Calculation settings stored as a JSON blob, with a hard fallback to the
//! built-in defaults whenever the blob cannot be used.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use crs_core::{CalcSettings, SettingsError};
use crs_storage::{BlobStore, StoreError};
use serde::Serialize;
use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;
use tracing::{info, warn};

use crate::SyncError;

pub const DEFAULT_SETTINGS_BLOB: &str = "settings.json";

const LAST_UPDATED_KEY: &str = "lastUpdated";

/// Why the stored settings were not used. Never surfaced to callers of
/// `resolve`; only logged.
#[derive(Debug, Error)]
pub enum ConfigUnavailable {
    #[error("settings blob `{0}` does not exist")]
    Missing(String),
    #[error("reading settings blob: {0}")]
    Read(StoreError),
    #[error("settings blob is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("settings blob is not a JSON object")]
    NotAnObject,
    #[error(transparent)]
    Invalid(#[from] SettingsError),
}

/// The stored settings document as served to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsDocument {
    /// Whole stored document without `lastUpdated`, unknown keys included.
    pub settings: Map<String, JsonValue>,
    pub is_default: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
    #[serde(skip)]
    pub resolved: CalcSettings,
}

impl SettingsDocument {
    fn defaults() -> Self {
        Self {
            settings: default_settings_map(),
            is_default: true,
            last_updated: None,
            resolved: CalcSettings::default(),
        }
    }
}

/// Served when no usable document is stored. Carries the client-side
/// correction tables next to the keys the calculation reads.
fn default_settings_map() -> Map<String, JsonValue> {
    let mut map = match serde_json::to_value(CalcSettings::default()) {
        Ok(JsonValue::Object(map)) => map,
        _ => Map::new(),
    };
    map.insert(
        "extinguishingCorrections".to_string(),
        json!({ "water": 1.1, "oxygen": 1 }),
    );
    map.insert(
        "volumeToWeightFactors".to_string(),
        json!({ "bamboo": 0.13, "pruning": 0.12, "herbaceous": 0.07, "other": 0.12 }),
    );
    map
}

#[derive(Clone)]
pub struct SettingsResolver {
    blobs: Arc<dyn BlobStore>,
    blob_name: String,
}

impl SettingsResolver {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            blobs,
            blob_name: DEFAULT_SETTINGS_BLOB.to_string(),
        }
    }

    pub fn with_blob_name(mut self, blob_name: impl Into<String>) -> Self {
        self.blob_name = blob_name.into();
        self
    }

    pub fn blob_name(&self) -> &str {
        &self.blob_name
    }

    /// Always yields a complete settings value; falls back to defaults.
    pub async fn resolve(&self) -> CalcSettings {
        self.load_document().await.resolved
    }

    pub async fn load_document(&self) -> SettingsDocument {
        match self.read_document().await {
            Ok((mut settings, resolved)) => {
                let last_updated = settings
                    .remove(LAST_UPDATED_KEY)
                    .and_then(|v| v.as_str().map(ToString::to_string));
                SettingsDocument {
                    settings,
                    is_default: false,
                    last_updated,
                    resolved,
                }
            }
            Err(reason) => {
                warn!(blob = %self.blob_name, %reason, "could not load calc settings, using defaults");
                SettingsDocument::defaults()
            }
        }
    }

    /// Merge defaults, then the stored object (valid or not), then `patch`,
    /// and write the result back. The blob is left untouched when the merged
    /// result is invalid.
    pub async fn save(&self, patch: JsonValue) -> Result<SettingsDocument, SyncError> {
        let JsonValue::Object(patch) = patch else {
            return Err(SyncError::SettingsPatchNotObject);
        };

        let mut merged = default_settings_map();
        match self.read_object().await {
            Ok(existing) => merged.extend(existing),
            Err(reason) => {
                info!(blob = %self.blob_name, %reason, "starting settings document from defaults");
            }
        }
        merged.extend(patch);
        merged.remove(LAST_UPDATED_KEY);

        let resolved = CalcSettings::from_json_value(&JsonValue::Object(merged.clone()))?;
        let last_updated = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);

        let mut stored = merged.clone();
        stored.insert(
            LAST_UPDATED_KEY.to_string(),
            JsonValue::String(last_updated.clone()),
        );
        let bytes = serde_json::to_vec_pretty(&stored)?;
        let blob = self
            .blobs
            .put_blob(&self.blob_name, &bytes, "application/json")
            .await?;
        info!(blob = %blob.name, hash = %blob.content_hash, "calc settings saved");

        Ok(SettingsDocument {
            settings: merged,
            is_default: false,
            last_updated: Some(last_updated),
            resolved,
        })
    }

    async fn read_object(&self) -> Result<Map<String, JsonValue>, ConfigUnavailable> {
        let bytes = self.blobs.get_blob(&self.blob_name).await.map_err(|err| match err {
            StoreError::NotFound(_) => ConfigUnavailable::Missing(self.blob_name.clone()),
            other => ConfigUnavailable::Read(other),
        })?;
        match serde_json::from_slice::<JsonValue>(&bytes)? {
            JsonValue::Object(map) => Ok(map),
            _ => Err(ConfigUnavailable::NotAnObject),
        }
    }

    async fn read_document(&self) -> Result<(Map<String, JsonValue>, CalcSettings), ConfigUnavailable> {
        let map = self.read_object().await?;
        let resolved = CalcSettings::from_json_value(&JsonValue::Object(map.clone()))?;
        Ok((map, resolved))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crs_storage::{MemoryBlobStore, StoredBlob};
    use serde_json::json;

    struct BrokenBlobStore;

    #[async_trait]
    impl BlobStore for BrokenBlobStore {
        async fn get_blob(&self, _name: &str) -> Result<Vec<u8>, StoreError> {
            Err(StoreError::Backend("connection reset".into()))
        }

        async fn put_blob(
            &self,
            _name: &str,
            _bytes: &[u8],
            _content_type: &str,
        ) -> Result<StoredBlob, StoreError> {
            Err(StoreError::Backend("connection reset".into()))
        }
    }

    async fn resolver_with(body: Option<&str>) -> SettingsResolver {
        let blobs = Arc::new(MemoryBlobStore::new());
        if let Some(body) = body {
            blobs
                .put_blob(DEFAULT_SETTINGS_BLOB, body.as_bytes(), "application/json")
                .await
                .expect("seed");
        }
        SettingsResolver::new(blobs)
    }

    #[tokio::test]
    async fn missing_blob_resolves_to_defaults() {
        let resolver = resolver_with(None).await;
        assert_eq!(resolver.resolve().await, CalcSettings::default());
        assert!(resolver.load_document().await.is_default);
    }

    #[tokio::test]
    async fn invalid_json_resolves_to_defaults() {
        let resolver = resolver_with(Some("{not json")).await;
        assert_eq!(resolver.resolve().await, CalcSettings::default());
    }

    #[tokio::test]
    async fn partial_document_resolves_to_defaults() {
        let resolver = resolver_with(Some(r#"{"co2ConversionFactor": 4.0}"#)).await;
        assert_eq!(resolver.resolve().await, CalcSettings::default());
    }

    #[tokio::test]
    async fn read_errors_resolve_to_defaults() {
        let resolver = SettingsResolver::new(Arc::new(BrokenBlobStore));
        assert_eq!(resolver.resolve().await, CalcSettings::default());
    }

    #[tokio::test]
    async fn stored_settings_are_used() {
        let mut custom = serde_json::to_value(CalcSettings::default()).unwrap();
        custom["co2ConversionFactor"] = json!(4.0);
        custom["lastUpdated"] = json!("2025-01-01T00:00:00.000Z");
        let body = serde_json::to_string(&custom).unwrap();
        let resolver = resolver_with(Some(body.as_str())).await;

        let doc = resolver.load_document().await;
        assert!(!doc.is_default);
        assert_eq!(doc.resolved.co2_conversion_factor, 4.0);
        assert_eq!(doc.last_updated.as_deref(), Some("2025-01-01T00:00:00.000Z"));
        assert!(!doc.settings.contains_key("lastUpdated"));
    }

    #[tokio::test]
    async fn save_merges_over_defaults_and_keeps_unknown_keys() {
        let resolver = resolver_with(None).await;
        let saved = resolver
            .save(json!({
                "co2ConversionFactor": 3.5,
                "volumeToWeightFactors": {"bamboo": 0.13, "pruning": 0.12, "herbaceous": 0.07, "other": 0.12}
            }))
            .await
            .expect("save");
        assert_eq!(saved.resolved.co2_conversion_factor, 3.5);
        assert!(saved.last_updated.is_some());

        let again = resolver
            .save(json!({"carbonContentFactors": {"bamboo": 0.7, "pruning": 0.8, "herbaceous": 0.65, "other": 0.8}}))
            .await
            .expect("second save");
        assert_eq!(again.resolved.co2_conversion_factor, 3.5);
        assert_eq!(again.resolved.carbon_content_factors.bamboo, 0.7);
        assert!(again.settings.contains_key("volumeToWeightFactors"));

        let reloaded = resolver.load_document().await;
        assert_eq!(reloaded.resolved, again.resolved);
        assert!(!reloaded.is_default);
    }

    #[tokio::test]
    async fn save_over_incomplete_document_keeps_its_keys() {
        let resolver = resolver_with(Some(
            r#"{"extinguishingCorrections": {"water": 1.3, "oxygen": 0.9}, "co2ConversionFactor": 3.67}"#,
        ))
        .await;
        assert!(resolver.load_document().await.is_default);

        let saved = resolver
            .save(json!({"co2ConversionFactor": 3.5}))
            .await
            .expect("save");
        assert_eq!(saved.resolved.co2_conversion_factor, 3.5);
        assert_eq!(
            saved.settings["extinguishingCorrections"],
            json!({"water": 1.3, "oxygen": 0.9})
        );
        assert_eq!(saved.resolved.carbon_content_factors, CalcSettings::default().carbon_content_factors);

        let reloaded = resolver.load_document().await;
        assert!(!reloaded.is_default);
        assert_eq!(
            reloaded.settings["extinguishingCorrections"],
            json!({"water": 1.3, "oxygen": 0.9})
        );
    }

    #[tokio::test]
    async fn save_over_non_object_blob_starts_from_defaults() {
        let resolver = resolver_with(Some("[1, 2, 3]")).await;
        let saved = resolver
            .save(json!({"co2ConversionFactor": 3.5}))
            .await
            .expect("save");
        assert_eq!(saved.resolved.co2_conversion_factor, 3.5);
        assert_eq!(saved.settings["volumeToWeightFactors"]["herbaceous"], json!(0.07));
    }

    #[tokio::test]
    async fn default_document_carries_correction_tables() {
        let doc = resolver_with(None).await.load_document().await;
        assert!(doc.is_default);
        assert_eq!(doc.settings["extinguishingCorrections"], json!({"water": 1.1, "oxygen": 1}));
        assert_eq!(
            doc.settings["volumeToWeightFactors"],
            json!({"bamboo": 0.13, "pruning": 0.12, "herbaceous": 0.07, "other": 0.12})
        );
        assert_eq!(doc.settings["co2ConversionFactor"], json!(3.67));
        assert_eq!(doc.resolved, CalcSettings::default());
    }

    #[tokio::test]
    async fn save_rejects_invalid_documents_without_writing() {
        let resolver = resolver_with(None).await;
        let err = resolver
            .save(json!({"co2ConversionFactor": -1}))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Settings(_)));
        assert!(resolver.load_document().await.is_default);

        let err = resolver.save(json!([1, 2])).await.unwrap_err();
        assert!(matches!(err, SyncError::SettingsPatchNotObject));
    }
}
