//! Wash-and-replace of the summary rows owned by one scope.

use std::sync::Arc;

use crs_core::{ProductionSummaryRecord, Scope};
use crs_storage::{StoreError, SummaryStore};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::SyncError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowFailure {
    pub row_key: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteReport {
    pub deleted: usize,
    pub inserted: usize,
    pub failed_deletes: Vec<RowFailure>,
    pub failed_inserts: Vec<RowFailure>,
}

impl WriteReport {
    pub fn is_clean(&self) -> bool {
        self.failed_deletes.is_empty() && self.failed_inserts.is_empty()
    }
}

#[derive(Clone)]
pub struct ReconciliationWriter {
    store: Arc<dyn SummaryStore>,
}

impl ReconciliationWriter {
    pub fn new(store: Arc<dyn SummaryStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn SummaryStore> {
        &self.store
    }

    /// Delete every existing row in `scope`, then insert `rows`.
    ///
    /// Both phases fan out one task per row and are fully drained before this
    /// returns. Per-row failures land in the report; only failures to create or
    /// list the table abort the call.
    pub async fn reconcile(
        &self,
        scope: &Scope,
        rows: &[ProductionSummaryRecord],
    ) -> Result<WriteReport, SyncError> {
        match self.store.ensure_table().await {
            Ok(()) | Err(StoreError::AlreadyExists(_)) => {}
            Err(err) => return Err(err.into()),
        }

        let existing = self
            .store
            .list_summaries(scope.group_filter())
            .await?
            .into_iter()
            .filter(|row| scope.matches(&row.group_id))
            .collect::<Vec<_>>();

        let mut report = WriteReport::default();

        let mut deletes = JoinSet::new();
        for row in existing {
            let store = Arc::clone(&self.store);
            deletes.spawn(async move {
                let result = store.delete_summary(&row.partition_key, &row.row_key).await;
                (row.row_key, result)
            });
        }
        while let Some(joined) = deletes.join_next().await {
            match joined {
                Ok((_, Ok(()))) => report.deleted += 1,
                Ok((row_key, Err(err))) => {
                    warn!(%scope, row_key = %row_key, error = %err, "failed to delete summary row");
                    report.failed_deletes.push(RowFailure {
                        row_key,
                        message: err.to_string(),
                    });
                }
                Err(err) => {
                    warn!(%scope, error = %err, "summary delete task did not complete");
                    report.failed_deletes.push(RowFailure {
                        row_key: String::new(),
                        message: err.to_string(),
                    });
                }
            }
        }
        info!(%scope, deleted = report.deleted, failed = report.failed_deletes.len(), "summary rows washed");

        let mut inserts = JoinSet::new();
        for row in rows.iter().cloned() {
            let store = Arc::clone(&self.store);
            inserts.spawn(async move {
                let result = store.create_summary(&row).await;
                (row.row_key, result)
            });
        }
        while let Some(joined) = inserts.join_next().await {
            match joined {
                Ok((_, Ok(()))) => report.inserted += 1,
                Ok((row_key, Err(err))) => {
                    warn!(%scope, row_key = %row_key, error = %err, "failed to insert summary row");
                    report.failed_inserts.push(RowFailure {
                        row_key,
                        message: err.to_string(),
                    });
                }
                Err(err) => {
                    warn!(%scope, error = %err, "summary insert task did not complete");
                    report.failed_inserts.push(RowFailure {
                        row_key: String::new(),
                        message: err.to_string(),
                    });
                }
            }
        }
        info!(%scope, inserted = report.inserted, failed = report.failed_inserts.len(), "summary rows replaced");

        Ok(report)
    }
}
