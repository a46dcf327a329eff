use std::path::PathBuf;

use crs_core::Granularity;
use tracing::warn;

use crate::settings::DEFAULT_SETTINGS_BLOB;

pub const DEFAULT_SUMMARY_CRON: &str = "0 0 15 * * *";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// `None` runs against in-memory stores.
    pub database_url: Option<String>,
    pub blob_dir: PathBuf,
    pub settings_blob: String,
    pub scheduler_enabled: bool,
    pub summary_cron: String,
    pub granularity: Granularity,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            blob_dir: PathBuf::from("./blobs"),
            settings_blob: DEFAULT_SETTINGS_BLOB.to_string(),
            scheduler_enabled: false,
            summary_cron: DEFAULT_SUMMARY_CRON.to_string(),
            granularity: Granularity::Material,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            blob_dir: lookup("CRS_BLOB_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.blob_dir),
            settings_blob: lookup("CRS_SETTINGS_BLOB").unwrap_or(defaults.settings_blob),
            scheduler_enabled: lookup("CRS_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            summary_cron: lookup("CRS_SUMMARY_CRON").unwrap_or(defaults.summary_cron),
            granularity: match lookup("CRS_SUMMARY_GRANULARITY") {
                Some(raw) => raw.parse().unwrap_or_else(|_| {
                    warn!(value = %raw, "unknown CRS_SUMMARY_GRANULARITY, using material");
                    Granularity::Material
                }),
                None => defaults.granularity,
            },
        }
    }
}
