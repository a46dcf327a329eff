use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use crs_core::{Granularity, ProductionSummaryRecord, Scope};
use crs_storage::{
    FsBlobStore, MemoryProductionStore, MemorySummaryStore, PgEntityStore, ProductionSource,
    StoreError, SummaryStore,
};
use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::aggregate::{summarize, Aggregator};
use crate::config::SyncConfig;
use crate::reconcile::{ReconciliationWriter, WriteReport};
use crate::settings::SettingsResolver;
use crate::SyncError;

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub scope: Scope,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub records_read: usize,
    pub records_dropped: usize,
    pub rows: Vec<ProductionSummaryRecord>,
    pub report: WriteReport,
}

/// Aggregate-and-replace engine shared by the HTTP trigger and the scheduler.
#[derive(Clone)]
pub struct ProductionSumEngine {
    productions: Arc<dyn ProductionSource>,
    writer: ReconciliationWriter,
    settings: SettingsResolver,
    granularity: Granularity,
}

impl ProductionSumEngine {
    pub fn new(
        productions: Arc<dyn ProductionSource>,
        summaries: Arc<dyn SummaryStore>,
        settings: SettingsResolver,
    ) -> Self {
        Self {
            productions,
            writer: ReconciliationWriter::new(summaries),
            settings,
            granularity: Granularity::default(),
        }
    }

    pub fn with_granularity(mut self, granularity: Granularity) -> Self {
        self.granularity = granularity;
        self
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    pub fn settings(&self) -> &SettingsResolver {
        &self.settings
    }

    pub async fn run(&self, scope: Scope) -> Result<RunSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("production_sum_run", %run_id, scope = %scope);
        self.run_inner(run_id, scope).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, scope: Scope) -> Result<RunSummary, SyncError> {
        let started_at = Utc::now();

        let (settings, entries) = tokio::join!(
            self.settings.resolve(),
            self.productions.stream_productions(scope.group_filter()),
        );
        let mut entries = entries?;

        let mut aggregator = Aggregator::new(scope.clone());
        while let Some(entry) = entries.next().await {
            match entry {
                Ok(record) => aggregator.push(&record),
                Err(StoreError::Decode { key, message }) => {
                    warn!(row_key = %key, error = %message, "dropping undecodable production entry");
                    aggregator.record_undecodable();
                }
                Err(err) => return Err(err.into()),
            }
        }
        let aggregation = aggregator.finish();
        info!(
            records = aggregation.records_seen,
            dropped = aggregation.records_dropped,
            buckets = aggregation.buckets.len(),
            "production entries aggregated"
        );

        let rows = summarize(&aggregation.buckets, &settings, self.granularity, started_at);
        let report = self.writer.reconcile(&scope, &rows).await?;

        if !report.failed_inserts.is_empty() {
            return Err(SyncError::InsertFailures {
                attempted: rows.len(),
                report,
            });
        }

        let finished_at = Utc::now();
        info!(
            deleted = report.deleted,
            inserted = report.inserted,
            failed_deletes = report.failed_deletes.len(),
            elapsed_ms = (finished_at - started_at).num_milliseconds(),
            "production sum run finished"
        );

        Ok(RunSummary {
            run_id,
            scope: scope.clone(),
            started_at,
            finished_at,
            records_read: aggregation.records_seen,
            records_dropped: aggregation.records_dropped,
            rows,
            report,
        })
    }
}

/// Full-dataset run for the daily timer.
pub async fn run_scheduled(engine: &ProductionSumEngine) -> Result<RunSummary, SyncError> {
    let summary = engine.run(Scope::All).await?;

    let mut per_group: BTreeMap<&str, usize> = BTreeMap::new();
    for row in &summary.rows {
        *per_group.entry(row.group_id.as_str()).or_default() += 1;
    }
    for (group_id, rows) in &per_group {
        debug!(run_id = %summary.run_id, group_id, rows, "group summarized");
    }
    info!(
        run_id = %summary.run_id,
        groups = per_group.len(),
        rows = summary.rows.len(),
        "scheduled production sum complete"
    );
    Ok(summary)
}

/// Stores and engine wired from a `SyncConfig`.
#[derive(Clone)]
pub struct EngineContext {
    pub engine: Arc<ProductionSumEngine>,
    pub summaries: Arc<dyn SummaryStore>,
    pub settings: SettingsResolver,
    pub database: Option<PgEntityStore>,
}

impl EngineContext {
    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let blobs = Arc::new(FsBlobStore::new(config.blob_dir.clone()));
        let settings = SettingsResolver::new(blobs).with_blob_name(config.settings_blob.clone());

        let (productions, summaries, database): (
            Arc<dyn ProductionSource>,
            Arc<dyn SummaryStore>,
            Option<PgEntityStore>,
        ) = match &config.database_url {
            Some(url) => {
                let store = PgEntityStore::connect(url).await?;
                store.migrate().await.context("creating entity tables")?;
                let shared = Arc::new(store.clone());
                (
                    shared.clone() as Arc<dyn ProductionSource>,
                    shared as Arc<dyn SummaryStore>,
                    Some(store),
                )
            }
            None => {
                info!("DATABASE_URL not set; using in-memory stores");
                (
                    Arc::new(MemoryProductionStore::default()) as Arc<dyn ProductionSource>,
                    Arc::new(MemorySummaryStore::new()) as Arc<dyn SummaryStore>,
                    None,
                )
            }
        };

        let engine = ProductionSumEngine::new(productions, summaries.clone(), settings.clone())
            .with_granularity(config.granularity);
        Ok(Self {
            engine: Arc::new(engine),
            summaries,
            settings,
            database,
        })
    }
}

pub async fn run_once_from_env(scope: Scope) -> Result<RunSummary> {
    let config = SyncConfig::from_env();
    let context = EngineContext::from_config(&config).await?;
    context
        .engine
        .run(scope.clone())
        .await
        .with_context(|| format!("production sum run for {scope}"))
}
