//! Postgres rendition of the partition/row keyed entity table.
//!
//! Every logical table (raw productions, summaries) shares one physical
//! `entities` table; `table_name` selects the logical one and `data` holds the
//! entity as camelCase JSON.

use anyhow::Context;
use async_trait::async_trait;
use crs_core::ProductionSummaryRecord;
use futures::StreamExt;
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row};
use tracing::debug;

use crate::{decode_production, ProductionSource, ProductionStream, StoreError, SummaryStore};

pub const PRODUCTION_TABLE: &str = "ProductionTable";
pub const SUMMARY_TABLE: &str = "ProductionSumTable";

const SELECT_ENTITIES: &str = r#"
    SELECT row_key, data
      FROM entities
     WHERE table_name = $1
       AND ($2::text IS NULL OR data->>'groupId' = $2)
     ORDER BY partition_key, row_key
"#;

#[derive(Debug, Clone)]
pub struct PgEntityStore {
    pool: PgPool,
    production_table: String,
    summary_table: String,
}

impl PgEntityStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            production_table: PRODUCTION_TABLE.to_string(),
            summary_table: SUMMARY_TABLE.to_string(),
        }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self::new(pool))
    }

    pub fn with_table_names(
        mut self,
        production_table: impl Into<String>,
        summary_table: impl Into<String>,
    ) -> Self {
        self.production_table = production_table.into();
        self.summary_table = summary_table.into();
        self
    }

    /// Create the shared physical tables. Safe to run repeatedly.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entity_tables (
                table_name TEXT PRIMARY KEY,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entities (
                table_name    TEXT NOT NULL,
                partition_key TEXT NOT NULL,
                row_key       TEXT NOT NULL,
                data          JSONB NOT NULL,
                updated_at    TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (table_name, partition_key, row_key)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS entities_group_idx
                ON entities (table_name, (data->>'groupId'))
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_entities(
        &self,
        table_name: &str,
        group_id: Option<&str>,
    ) -> Result<Vec<(String, JsonValue)>, StoreError> {
        let rows = sqlx::query(SELECT_ENTITIES)
            .bind(table_name)
            .bind(group_id)
            .fetch_all(&self.pool)
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push((row.try_get("row_key")?, row.try_get("data")?));
        }
        Ok(out)
    }
}

#[async_trait]
impl ProductionSource for PgEntityStore {
    async fn stream_productions<'a>(
        &'a self,
        group_id: Option<&'a str>,
    ) -> Result<ProductionStream<'a>, StoreError> {
        let rows = sqlx::query(SELECT_ENTITIES)
            .bind(self.production_table.as_str())
            .bind(group_id)
            .fetch(&self.pool);
        Ok(rows
            .map(|row| -> Result<_, StoreError> {
                let row = row?;
                let row_key: String = row.try_get("row_key")?;
                let data: JsonValue = row.try_get("data")?;
                decode_production(row_key, data)
            })
            .boxed())
    }
}

#[async_trait]
impl SummaryStore for PgEntityStore {
    async fn ensure_table(&self) -> Result<(), StoreError> {
        self.migrate().await?;
        let created = sqlx::query(
            r#"
            INSERT INTO entity_tables (table_name)
            VALUES ($1)
            ON CONFLICT (table_name) DO NOTHING
            "#,
        )
        .bind(&self.summary_table)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if created > 0 {
            debug!(table = %self.summary_table, "created summary table");
        }
        Ok(())
    }

    async fn list_summaries(
        &self,
        group_id: Option<&str>,
    ) -> Result<Vec<ProductionSummaryRecord>, StoreError> {
        let entities = self.list_entities(&self.summary_table, group_id).await?;
        let mut out = Vec::with_capacity(entities.len());
        for (_, data) in entities {
            out.push(serde_json::from_value(data)?);
        }
        Ok(out)
    }

    async fn delete_summary(&self, partition_key: &str, row_key: &str) -> Result<(), StoreError> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM entities
             WHERE table_name = $1
               AND partition_key = $2
               AND row_key = $3
            "#,
        )
        .bind(&self.summary_table)
        .bind(partition_key)
        .bind(row_key)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if deleted == 0 {
            return Err(StoreError::NotFound(format!("{partition_key}/{row_key}")));
        }
        Ok(())
    }

    async fn create_summary(&self, record: &ProductionSummaryRecord) -> Result<(), StoreError> {
        let data = serde_json::to_value(record)?;
        let result = sqlx::query(
            r#"
            INSERT INTO entities (table_name, partition_key, row_key, data)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&self.summary_table)
        .bind(&record.partition_key)
        .bind(&record.row_key)
        .bind(data)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => Err(
                StoreError::AlreadyExists(format!("{}/{}", record.partition_key, record.row_key)),
            ),
            Err(err) => Err(err.into()),
        }
    }
}
