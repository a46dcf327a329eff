//! Production aggregation and reconciliation engine.
//!
//! One run resolves the calculation factors, folds raw production entries into
//! (year, group, material) buckets, derives carbon metrics per bucket, and
//! wash-and-replaces the summary rows for the run's scope.

use thiserror::Error;

pub mod aggregate;
pub mod config;
pub mod pipeline;
pub mod reconcile;
pub mod schedule;
pub mod settings;

pub use aggregate::{aggregate, summarize, Aggregation, Aggregator};
pub use config::SyncConfig;
pub use pipeline::{run_once_from_env, run_scheduled, EngineContext, ProductionSumEngine, RunSummary};
pub use reconcile::{ReconciliationWriter, RowFailure, WriteReport};
pub use schedule::{build_scheduler, maybe_build_scheduler};
pub use settings::{ConfigUnavailable, SettingsDocument, SettingsResolver, DEFAULT_SETTINGS_BLOB};

pub const CRATE_NAME: &str = "crs-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] crs_storage::StoreError),
    #[error("{} of {attempted} summary inserts failed", .report.failed_inserts.len())]
    InsertFailures { attempted: usize, report: WriteReport },
    #[error("invalid calculation settings: {0}")]
    Settings(#[from] crs_core::SettingsError),
    #[error("settings patch must be a JSON object")]
    SettingsPatchNotObject,
    #[error("serializing settings: {0}")]
    Json(#[from] serde_json::Error),
}
