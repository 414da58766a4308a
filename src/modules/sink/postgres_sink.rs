//! PostgreSQL sink
//!
//! Stores each record as one row with the payload in a `jsonb` column. The
//! target schema and table are created on connect when missing.

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::info;

use super::RecordSink;
use crate::core::config::{DatabaseConfig, SinkConfig};
use crate::core::database;
use crate::core::error::{AppError, Result};
use crate::features::ingestion::models::IngestedRecord;
use crate::shared::validation::quote_identifier;

pub struct PostgresSink {
    pool: PgPool,
    schema: String,
    table: String,
    insert_sql: String,
}

impl PostgresSink {
    /// Open the pool and make sure the target table exists
    pub async fn connect(database: &DatabaseConfig, sink: &SinkConfig) -> Result<Self> {
        let pool = database::create_pool(database).await?;
        info!(
            "Database connection pool created: {}",
            database::redacted_url(&database.url)
        );

        let sink = Self::with_pool(pool, sink);
        sink.ensure_table().await?;
        info!("Sink table ready: {}.{}", sink.schema, sink.table);

        Ok(sink)
    }

    fn with_pool(pool: PgPool, config: &SinkConfig) -> Self {
        Self {
            pool,
            insert_sql: insert_sql(&config.schema, &config.table),
            schema: config.schema.clone(),
            table: config.table.clone(),
        }
    }

    async fn ensure_table(&self) -> Result<()> {
        for statement in sink_ddl(&self.schema, &self.table) {
            sqlx::query(&statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl RecordSink for PostgresSink {
    async fn insert(&self, record: &IngestedRecord) -> Result<()> {
        let result = sqlx::query(&self.insert_sql)
            .bind(record.id)
            .bind(&record.topic)
            .bind(Json(&record.payload))
            .bind(record.received_at)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() != 1 {
            return Err(AppError::Sink(format!(
                "insert of record {} affected {} rows",
                record.id,
                result.rows_affected()
            )));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        info!("Database connection pool closed");
        Ok(())
    }
}

fn qualified_name(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_identifier(schema), quote_identifier(table))
}

/// DDL for the sink schema, table and lookup index
fn sink_ddl(schema: &str, table: &str) -> Vec<String> {
    let target = qualified_name(schema, table);
    let index_name = quote_identifier(&format!("{}_topic_received_at_idx", table));
    vec![
        format!("CREATE SCHEMA IF NOT EXISTS {}", quote_identifier(schema)),
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\
                id UUID PRIMARY KEY, \
                topic TEXT NOT NULL, \
                payload JSONB NOT NULL, \
                received_at TIMESTAMPTZ NOT NULL\
            )",
            target
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (topic, received_at)",
            index_name, target
        ),
    ]
}

fn insert_sql(schema: &str, table: &str) -> String {
    format!(
        "INSERT INTO {} (id, topic, payload, received_at) VALUES ($1, $2, $3, $4)",
        qualified_name(schema, table)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_sql_targets_quoted_table() {
        assert_eq!(
            insert_sql("telemetry", "readings"),
            "INSERT INTO \"telemetry\".\"readings\" (id, topic, payload, received_at) VALUES ($1, $2, $3, $4)"
        );
    }

    #[test]
    fn test_sink_ddl() {
        let ddl = sink_ddl("telemetry", "readings");
        assert_eq!(ddl.len(), 3);
        assert_eq!(ddl[0], "CREATE SCHEMA IF NOT EXISTS \"telemetry\"");
        assert!(ddl[1].starts_with("CREATE TABLE IF NOT EXISTS \"telemetry\".\"readings\" ("));
        assert!(ddl[1].contains("payload JSONB NOT NULL"));
        assert_eq!(
            ddl[2],
            "CREATE INDEX IF NOT EXISTS \"readings_topic_received_at_idx\" ON \"telemetry\".\"readings\" (topic, received_at)"
        );
    }
}
