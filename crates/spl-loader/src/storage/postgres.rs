//! PostgreSQL backend
//!
//! Staging files are streamed through `COPY ... FROM STDIN` (Parquet files
//! re-encoded to CSV batch by batch on the way) and the optimization snapshot is read from `pg_constraint` and `pg_indexes`.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Row, Transaction};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use super::{sql, LoaderBackend, MergeTransaction, SchemaObject, SchemaObjectKind};
use crate::config::PostgresConfig;
use crate::error::{EtlError, Result};
use crate::models::{LoadMode, RunOutcome, RunRecord, RunStatus};
use crate::config::IntermediateFormat;
use crate::tables::TableKind;
use crate::transform::{encode_csv, file_format, stream_batches, NULL_MARKER};

const COPY_CHUNK_BYTES: usize = 64 * 1024;

/// Rows re-encoded per `COPY` chunk when staging Parquet files
const PARQUET_COPY_ROWS: usize = 5_000;

const FOREIGN_KEY_SNAPSHOT: &str = r#"
    SELECT
        c.conname::text AS object_name,
        t.relname::text AS table_name,
        format('ALTER TABLE %I.%I ADD CONSTRAINT %I %s',
               n.nspname, t.relname, c.conname, pg_get_constraintdef(c.oid)) AS create_sql,
        format('ALTER TABLE %I.%I DROP CONSTRAINT IF EXISTS %I',
               n.nspname, t.relname, c.conname) AS drop_sql
    FROM pg_constraint c
    JOIN pg_class t ON t.oid = c.conrelid
    JOIN pg_namespace n ON n.oid = t.relnamespace
    WHERE c.contype = 'f'
      AND n.nspname = current_schema()
      AND t.relname::text = ANY($1)
    ORDER BY t.relname, c.conname
"#;

const INDEX_SNAPSHOT: &str = r#"
    SELECT
        i.indexname::text AS object_name,
        i.tablename::text AS table_name,
        i.indexdef AS create_sql,
        format('DROP INDEX IF EXISTS %I.%I', i.schemaname, i.indexname) AS drop_sql
    FROM pg_indexes i
    WHERE i.schemaname = current_schema()
      AND i.tablename::text = ANY($1)
      AND i.indexname NOT LIKE 'pg_%'
      AND NOT EXISTS (
          SELECT 1 FROM pg_constraint c
          WHERE c.conname = i.indexname AND c.contype IN ('p', 'u', 'x')
      )
    ORDER BY i.tablename, i.indexname
"#;

/// Rank every member of each touched family and flip the flag only where it
/// changes. Highest version wins, then latest effective date, then the
/// lexically greatest document id.
const RECOMPUTE_LATEST: &str = r#"
    WITH affected AS (
        SELECT DISTINCT set_id FROM products_staging WHERE set_id IS NOT NULL
    ),
    ranked AS (
        SELECT p.document_id,
               ROW_NUMBER() OVER (
                   PARTITION BY p.set_id
                   ORDER BY p.version_number DESC, p.effective_time DESC, p.document_id DESC
               ) AS rn
        FROM products p
        JOIN affected a ON a.set_id = p.set_id
    )
    UPDATE products p
    SET is_latest_version = (r.rn = 1)
    FROM ranked r
    WHERE p.document_id = r.document_id
      AND p.is_latest_version IS DISTINCT FROM (r.rn = 1)
"#;

pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.url)
            .await?;

        info!(
            max_connections = config.max_connections,
            "PostgreSQL connection pool created"
        );
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn production_table_names() -> Vec<String> {
        TableKind::DEPENDENCY_ORDER
            .iter()
            .map(|t| t.table_name().to_string())
            .collect()
    }

    async fn snapshot_kind(
        &self,
        query: &str,
        kind: SchemaObjectKind,
    ) -> Result<Vec<SchemaObject>> {
        let rows = sqlx::query(query)
            .bind(Self::production_table_names())
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<SchemaObject> {
                Ok(SchemaObject {
                    kind,
                    name: row.try_get("object_name")?,
                    table_name: row.try_get("table_name")?,
                    create_sql: row.try_get("create_sql")?,
                    drop_sql: row.try_get("drop_sql")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl LoaderBackend for PostgresBackend {
    fn name(&self) -> &'static str {
        "postgresql"
    }

    async fn initialize_schema(&self) -> Result<()> {
        info!("Running PostgreSQL migrations");
        sqlx::migrate!("../../migrations/postgres")
            .run(&self.pool)
            .await?;
        info!("Schema initialized");
        Ok(())
    }

    async fn verify_schema(&self) -> Result<()> {
        let present: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT table_name::text
            FROM information_schema.tables
            WHERE table_schema = current_schema() AND table_name::text = ANY($1)
            "#,
        )
        .bind(super::required_tables())
        .fetch_all(&self.pool)
        .await?;

        let present: BTreeSet<String> = present.into_iter().collect();
        let missing: Vec<String> = super::required_tables()
            .into_iter()
            .filter(|t| !present.contains(t))
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(EtlError::SchemaNotInitialized(format!(
                "missing table(s) {}",
                missing.join(", ")
            )))
        }
    }

    async fn start_run(&self, mode: LoadMode) -> Result<i64> {
        let run_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO etl_load_history (mode, start_time, status, records_loaded)
            VALUES ($1, $2, $3, 0)
            RETURNING run_id
            "#,
        )
        .bind(mode.as_str())
        .bind(Utc::now())
        .bind(RunStatus::Running.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(run_id)
    }

    async fn end_run(&self, run_id: i64, outcome: &RunOutcome) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE etl_load_history
            SET end_time = $2, status = $3, records_loaded = $4, error_log = $5
            WHERE run_id = $1 AND status = 'RUNNING'
            "#,
        )
        .bind(run_id)
        .bind(Utc::now())
        .bind(outcome.status.as_str())
        .bind(outcome.records_loaded as i64)
        .bind(outcome.error_log.as_deref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!("Run {} was not open; history left unchanged", run_id);
        }
        Ok(())
    }

    async fn recent_runs(&self, limit: u32) -> Result<Vec<RunRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, mode, start_time, end_time, status, records_loaded, error_log
            FROM etl_load_history
            ORDER BY run_id DESC
            LIMIT $1
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<RunRecord> {
                Ok(RunRecord {
                    run_id: row.try_get("run_id")?,
                    mode: row.try_get("mode")?,
                    start_time: row.try_get("start_time")?,
                    end_time: row.try_get("end_time")?,
                    status: RunStatus::from(row.try_get::<String, _>("status")?),
                    records_loaded: row.try_get("records_loaded")?,
                    error_log: row.try_get("error_log")?,
                })
            })
            .collect()
    }

    async fn processed_archives(&self) -> Result<BTreeSet<String>> {
        let names: Vec<String> = sqlx::query_scalar("SELECT archive_name FROM etl_processed_archives")
            .fetch_all(&self.pool)
            .await?;
        Ok(names.into_iter().collect())
    }

    async fn record_processed_archive(&self, archive_name: &str, checksum: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO etl_processed_archives (archive_name, archive_checksum, processed_timestamp)
            VALUES ($1, $2, $3)
            ON CONFLICT (archive_name)
            DO UPDATE SET archive_checksum = EXCLUDED.archive_checksum,
                          processed_timestamp = EXCLUDED.processed_timestamp
            "#,
        )
        .bind(archive_name)
        .bind(checksum)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_staging(&self) -> Result<()> {
        let tables = TableKind::DEPENDENCY_ORDER
            .iter()
            .map(|t| t.staging_table_name())
            .collect::<Vec<_>>()
            .join(", ");
        sqlx::query(&format!("TRUNCATE TABLE {}", tables))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_staging_file(&self, table: TableKind, path: &Path) -> Result<u64> {
        let statement = format!(
            "COPY {} ({}) FROM STDIN WITH (FORMAT CSV, NULL '{}')",
            table.staging_table_name(),
            table.column_list(),
            NULL_MARKER
        );
        debug!("{}", statement);

        if file_format(path) == Some(IntermediateFormat::Parquet) {
            let mut batches = stream_batches(table, path.to_path_buf(), PARQUET_COPY_ROWS);
            let mut conn = self.pool.acquire().await?;
            let mut copy = conn.copy_in_raw(&statement).await?;

            while let Some(batch) = batches.recv().await {
                let chunk = match batch.and_then(|rows| encode_csv(&rows)) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        copy.abort(format!("reading {} failed", path.display())).await?;
                        return Err(e);
                    },
                };
                copy.send(chunk).await?;
            }

            let rows = copy.finish().await?;
            info!("Loaded {} row(s) into {}", rows, table.staging_table_name());
            return Ok(rows);
        }

        let mut file = tokio::fs::File::open(path).await?;
        let mut conn = self.pool.acquire().await?;
        let mut copy = conn.copy_in_raw(&statement).await?;

        let mut buf = vec![0u8; COPY_CHUNK_BYTES];
        loop {
            let n = match file.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    copy.abort(format!("reading {} failed", path.display())).await?;
                    return Err(e.into());
                },
            };
            if n == 0 {
                break;
            }
            copy.send(buf[..n].to_vec()).await?;
        }

        let rows = copy.finish().await?;
        info!("Loaded {} row(s) into {}", rows, table.staging_table_name());
        Ok(rows)
    }

    async fn snapshot_schema_objects(&self) -> Result<Vec<SchemaObject>> {
        let mut objects = self
            .snapshot_kind(FOREIGN_KEY_SNAPSHOT, SchemaObjectKind::ForeignKey)
            .await?;
        objects.extend(self.snapshot_kind(INDEX_SNAPSHOT, SchemaObjectKind::Index).await?);
        Ok(objects)
    }

    async fn drop_schema_objects(&self, objects: &[SchemaObject]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let deferred_at = Utc::now();

        for (ordinal, object) in objects.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO etl_deferred_schema_objects
                    (ordinal, object_kind, object_name, table_name, create_sql, drop_sql, deferred_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(ordinal as i32)
            .bind(object.kind.as_str())
            .bind(&object.name)
            .bind(&object.table_name)
            .bind(&object.create_sql)
            .bind(&object.drop_sql)
            .bind(deferred_at)
            .execute(&mut *tx)
            .await?;

            debug!("Dropping {} {}", object.kind, object.name);
            sqlx::query(&object.drop_sql).execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn restore_schema_objects(&self, objects: &[SchemaObject]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for object in objects {
            debug!("Recreating {} {}", object.kind, object.name);
            sqlx::query(&object.create_sql).execute(&mut *tx).await?;
        }
        sqlx::query("DELETE FROM etl_deferred_schema_objects")
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn pending_schema_objects(&self) -> Result<Vec<SchemaObject>> {
        let rows = sqlx::query(
            r#"
            SELECT object_kind, object_name, table_name, create_sql, drop_sql
            FROM etl_deferred_schema_objects
            ORDER BY ordinal
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<SchemaObject> {
                Ok(SchemaObject {
                    kind: row.try_get::<String, _>("object_kind")?.parse()?,
                    name: row.try_get("object_name")?,
                    table_name: row.try_get("table_name")?,
                    create_sql: row.try_get("create_sql")?,
                    drop_sql: row.try_get("drop_sql")?,
                })
            })
            .collect()
    }

    async fn begin_merge(&self) -> Result<Box<dyn MergeTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgMergeTransaction { tx }))
    }

    async fn maintenance(&self) -> Result<()> {
        let tables = TableKind::DEPENDENCY_ORDER
            .iter()
            .map(|t| t.table_name())
            .collect::<Vec<_>>()
            .join(", ");
        info!("Running VACUUM (ANALYZE) on production tables");
        // VACUUM refuses to run inside a transaction block, so use the simple
        // query protocol directly on the pool.
        sqlx::raw_sql(&format!("VACUUM (ANALYZE) {}", tables))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

pub struct PgMergeTransaction {
    tx: Transaction<'static, Postgres>,
}

impl PgMergeTransaction {
    async fn execute(&mut self, statement: &str) -> Result<u64> {
        let result = sqlx::query(statement).execute(&mut *self.tx).await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl MergeTransaction for PgMergeTransaction {
    async fn truncate_production(&mut self, tables: &[TableKind]) -> Result<()> {
        // One statement so foreign keys between the listed tables are satisfied
        let names = tables
            .iter()
            .map(|t| t.table_name())
            .collect::<Vec<_>>()
            .join(", ");
        self.execute(&format!("TRUNCATE TABLE {}", names)).await?;
        Ok(())
    }

    async fn copy_from_staging(&mut self, table: TableKind) -> Result<u64> {
        self.execute(&sql::insert_from_staging(table)).await
    }

    async fn upsert_from_staging(&mut self, table: TableKind) -> Result<u64> {
        self.execute(&sql::upsert_from_staging(table)).await
    }

    async fn delete_children_of_staged(&mut self, table: TableKind) -> Result<u64> {
        self.execute(&sql::delete_children_of_staged(table)).await
    }

    async fn recompute_latest_versions(&mut self) -> Result<u64> {
        self.execute(RECOMPUTE_LATEST).await
    }

    async fn truncate_staging(&mut self, tables: &[TableKind]) -> Result<()> {
        let names = tables
            .iter()
            .map(|t| t.staging_table_name())
            .collect::<Vec<_>>()
            .join(", ");
        self.execute(&format!("TRUNCATE TABLE {}", names)).await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
