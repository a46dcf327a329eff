use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::config::SyncConfig;
use crate::pipeline::{run_scheduled, ProductionSumEngine};

/// Scheduler with one daily full-dataset job. Cron expressions carry a
/// seconds field and are evaluated in UTC.
pub async fn build_scheduler(engine: Arc<ProductionSumEngine>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |job_id, _lock| {
        let engine = Arc::clone(&engine);
        Box::pin(async move {
            info!(%job_id, "scheduled production sum triggered");
            if let Err(err) = run_scheduled(&engine).await {
                error!(%job_id, error = %err, "scheduled production sum failed");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    engine: Arc<ProductionSumEngine>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }
    build_scheduler(engine, &config.summary_cron).await.map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SettingsResolver;
    use crs_storage::{MemoryBlobStore, MemoryProductionStore, MemorySummaryStore};

    fn engine() -> Arc<ProductionSumEngine> {
        Arc::new(ProductionSumEngine::new(
            Arc::new(MemoryProductionStore::default()),
            Arc::new(MemorySummaryStore::new()),
            SettingsResolver::new(Arc::new(MemoryBlobStore::new())),
        ))
    }

    #[tokio::test]
    async fn disabled_scheduler_builds_nothing() {
        let config = SyncConfig::default();
        assert!(maybe_build_scheduler(&config, engine()).await.expect("build").is_none());
    }

    #[tokio::test]
    async fn enabled_scheduler_accepts_default_cron() {
        let config = SyncConfig {
            scheduler_enabled: true,
            ..SyncConfig::default()
        };
        assert!(maybe_build_scheduler(&config, engine()).await.expect("build").is_some());
    }

    #[tokio::test]
    async fn rejects_malformed_cron() {
        assert!(build_scheduler(engine(), "every day at noon").await.is_err());
    }
}
