//! SQLite backend
//!
//! SQLite has no server-side CSV loader, so staging files are streamed here
//! and inserted as typed, batched multi-row `INSERT`s inside one transaction.
//! Foreign keys cannot be dropped from an existing SQLite table; the
//! optimization snapshot therefore covers indexes only.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};
use sqlx::{Executor, QueryBuilder, Row, Sqlite, Transaction};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{sql, LoaderBackend, MergeTransaction, SchemaObject, SchemaObjectKind};
use crate::config::SqliteConfig;
use crate::error::{EtlError, Result};
use crate::models::{LoadMode, RunOutcome, RunRecord, RunStatus};
use crate::tables::{ColumnType, TableKind};
use crate::transform::{stream_batches, FieldRow};

/// Rows per `INSERT`; the widest table stays far below SQLite's bind limit.
const ROWS_PER_BATCH: usize = 500;

const RECOMPUTE_LATEST: &str = r#"
    UPDATE products
    SET is_latest_version = CASE WHEN document_id = (
            SELECT p2.document_id
            FROM products p2
            WHERE p2.set_id = products.set_id
            ORDER BY p2.version_number DESC, p2.effective_time DESC, p2.document_id DESC
            LIMIT 1
        ) THEN 1 ELSE 0 END
    WHERE set_id IN (SELECT set_id FROM products_staging)
"#;

/// A decoded intermediate value ready to bind
#[derive(Debug, Clone, PartialEq, Eq)]
enum SqlValue {
    Null,
    Integer(i64),
    Text(String),
}

fn convert_field(raw: Option<&str>, column_type: ColumnType) -> std::result::Result<SqlValue, String> {
    let Some(raw) = raw else {
        return Ok(SqlValue::Null);
    };

    match column_type {
        ColumnType::Integer => raw
            .trim()
            .parse::<i64>()
            .map(SqlValue::Integer)
            .map_err(|e| format!("invalid integer '{}': {}", raw, e)),
        ColumnType::Boolean => match raw.trim() {
            "true" | "t" | "1" => Ok(SqlValue::Integer(1)),
            "false" | "f" | "0" => Ok(SqlValue::Integer(0)),
            other => Err(format!("invalid boolean '{}'", other)),
        },
        ColumnType::Uuid
        | ColumnType::Text
        | ColumnType::Date
        | ColumnType::Timestamp
        | ColumnType::Json => Ok(SqlValue::Text(raw.to_string())),
    }
}

/// Type one batch of intermediate rows; `first_record` is the 1-based record
/// number of `rows[0]` in the file.
fn convert_rows(
    table: TableKind,
    path: &Path,
    first_record: u64,
    rows: Vec<FieldRow>,
) -> Result<Vec<Vec<SqlValue>>> {
    let columns = table.columns();
    rows.into_iter()
        .enumerate()
        .map(|(offset, row)| {
            let record = first_record + offset as u64;
            columns
                .iter()
                .zip(row.iter())
                .map(|(column, raw)| {
                    convert_field(raw.as_deref(), column.column_type).map_err(|message| {
                        EtlError::Parse {
                            file: path.display().to_string(),
                            message: format!("record {} column {}: {}", record, column.name, message),
                        }
                    })
                })
                .collect()
        })
        .collect()
}

/// DDL is checked against the connection's cached schema at prepare time.
/// Reading the catalog first reloads it if another connection changed it.
async fn refresh_schema(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query("SELECT COUNT(*) FROM sqlite_master")
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub struct SqliteBackend {
    pool: SqlitePool,
    path: PathBuf,
}

impl SqliteBackend {
    pub async fn connect(config: &SqliteConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await?;

        info!("SQLite database opened at {}", config.path.display());
        Ok(Self {
            pool,
            path: config.path.clone(),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl LoaderBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn initialize_schema(&self) -> Result<()> {
        info!("Running SQLite migrations");
        sqlx::migrate!("../../migrations/sqlite")
            .run(&self.pool)
            .await?;
        info!("Schema initialized");
        Ok(())
    }

    async fn verify_schema(&self) -> Result<()> {
        let present: Vec<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table'")
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
            VALUES (?, ?, ?, 0)
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
            SET end_time = ?, status = ?, records_loaded = ?, error_log = ?
            WHERE run_id = ? AND status = 'RUNNING'
            "#,
        )
        .bind(Utc::now())
        .bind(outcome.status.as_str())
        .bind(outcome.records_loaded as i64)
        .bind(outcome.error_log.as_deref())
        .bind(run_id)
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
            LIMIT ?
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
            VALUES (?, ?, ?)
            ON CONFLICT (archive_name)
            DO UPDATE SET archive_checksum = excluded.archive_checksum,
                          processed_timestamp = excluded.processed_timestamp
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
        let mut tx = self.pool.begin().await?;
        for table in TableKind::DEPENDENCY_ORDER {
            sqlx::query(&sql::delete_all(&table.staging_table_name()))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn load_staging_file(&self, table: TableKind, path: &Path) -> Result<u64> {
        let insert = format!(
            "INSERT INTO {} ({}) ",
            table.staging_table_name(),
            table.column_list()
        );

        let mut batches = stream_batches(table, path.to_path_buf(), ROWS_PER_BATCH);
        let mut tx = self.pool.begin().await?;
        let mut loaded = 0u64;
        let mut records = 0u64;

        while let Some(batch) = batches.recv().await {
            let batch = batch?;
            let count = batch.len() as u64;
            let rows = convert_rows(table, path, records + 1, batch)?;
            records += count;

            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(&insert);
            builder.push_values(rows, |mut b, row| {
                for value in row {
                    match value {
                        SqlValue::Null => {
                            b.push_bind(None::<String>);
                        },
                        SqlValue::Integer(v) => {
                            b.push_bind(v);
                        },
                        SqlValue::Text(v) => {
                            b.push_bind(v);
                        },
                    }
                }
            });
            loaded += builder.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        info!("Loaded {} row(s) into {}", loaded, table.staging_table_name());
        Ok(loaded)
    }

    async fn snapshot_schema_objects(&self) -> Result<Vec<SchemaObject>> {
        let rows = sqlx::query(
            r#"
            SELECT name, tbl_name, sql
            FROM sqlite_master
            WHERE type = 'index' AND sql IS NOT NULL
            ORDER BY tbl_name, name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let production: BTreeSet<&str> = TableKind::DEPENDENCY_ORDER
            .iter()
            .map(|t| t.table_name())
            .collect();

        let mut objects = Vec::new();
        for row in &rows {
            let table_name: String = row.try_get("tbl_name")?;
            if !production.contains(table_name.as_str()) {
                continue;
            }
            let name: String = row.try_get("name")?;
            objects.push(SchemaObject {
                kind: SchemaObjectKind::Index,
                drop_sql: format!("DROP INDEX IF EXISTS \"{}\"", name),
                create_sql: row.try_get("sql")?,
                name,
                table_name,
            });
        }
        Ok(objects)
    }

    async fn drop_schema_objects(&self, objects: &[SchemaObject]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        refresh_schema(&mut tx).await?;
        let deferred_at = Utc::now();

        for (ordinal, object) in objects.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO etl_deferred_schema_objects
                    (ordinal, object_kind, object_name, table_name, create_sql, drop_sql, deferred_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(ordinal as i64)
            .bind(object.kind.as_str())
            .bind(&object.name)
            .bind(&object.table_name)
            .bind(&object.create_sql)
            .bind(&object.drop_sql)
            .bind(deferred_at)
            .execute(&mut *tx)
            .await?;

            debug!("Dropping {} {}", object.kind, object.name);
            (&mut *tx).execute(sqlx::raw_sql(&object.drop_sql)).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn restore_schema_objects(&self, objects: &[SchemaObject]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        refresh_schema(&mut tx).await?;

        for object in objects {
            debug!("Recreating {} {}", object.kind, object.name);
            (&mut *tx).execute(sqlx::raw_sql(&object.create_sql)).await?;
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
        Ok(Box::new(SqliteMergeTransaction { tx }))
    }

    async fn maintenance(&self) -> Result<()> {
        info!("Running ANALYZE and VACUUM");
        sqlx::raw_sql("ANALYZE").execute(&self.pool).await?;
        sqlx::raw_sql("VACUUM").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

pub struct SqliteMergeTransaction {
    tx: Transaction<'static, Sqlite>,
}

impl SqliteMergeTransaction {
    async fn execute(&mut self, statement: &str) -> Result<u64> {
        let result = sqlx::query(statement).execute(&mut *self.tx).await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl MergeTransaction for SqliteMergeTransaction {
    async fn truncate_production(&mut self, tables: &[TableKind]) -> Result<()> {
        for table in tables {
            self.execute(&sql::delete_all(table.table_name())).await?;
        }
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
        for table in tables {
            self.execute(&sql::delete_all(&table.staging_table_name())).await?;
        }
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
