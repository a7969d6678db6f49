//! PostgreSQL backend tests using testcontainers
//!
//! These need a Docker daemon and are ignored by default:
//!
//! ```bash
//! cargo test -p spl-loader --test postgres_tests -- --ignored
//! ```

mod common;

use anyhow::Result;
use common::*;
use serial_test::serial;
use spl_loader::config::{DatabaseConfig, PostgresConfig, Settings};
use spl_loader::models::{LoadMode, RunStatus};
use spl_loader::pipeline::Pipeline;
use spl_loader::storage::{bulk_load_to_staging, LoaderBackend, MergeEngine, PostgresBackend};
use spl_loader::EtlError;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use tempfile::TempDir;
use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;

struct PgEnv {
    _container: ContainerAsync<Postgres>,
    root: TempDir,
    url: String,
    backend: Arc<PostgresBackend>,
}

impl PgEnv {
    async fn start() -> Result<Self> {
        init_tracing();
        let container = Postgres::default().with_tag("16-alpine").start().await?;
        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432).await?;
        let url = format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);

        let pool = PgPoolOptions::new().max_connections(5).connect(&url).await?;
        let backend = PostgresBackend::from_pool(pool);
        backend.initialize_schema().await?;

        Ok(Self {
            _container: container,
            root: TempDir::new()?,
            url,
            backend: Arc::new(backend),
        })
    }

    fn pool(&self) -> &PgPool {
        self.backend.pool()
    }

    fn pipeline(&self) -> Pipeline {
        let settings = Settings {
            database: DatabaseConfig::Postgres(PostgresConfig {
                url: self.url.clone(),
                ..PostgresConfig::default()
            }),
            source_url: "http://127.0.0.1:9/listing".to_string(),
            data_dir: self.root.path().join("data"),
            download_path: self.root.path().join("data/downloads"),
            quarantine_path: self.root.path().join("data/quarantine"),
            max_workers: 2,
            ..Settings::default()
        };
        Pipeline::new(settings, self.backend.clone())
    }

    fn dir(&self, name: &str) -> Result<std::path::PathBuf> {
        let dir = self.root.path().join(name);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    async fn latest_documents(&self) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT document_id::text FROM products WHERE is_latest_version ORDER BY document_id",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(ids)
    }

    async fn count(&self, sql: &str) -> Result<i64> {
        Ok(sqlx::query_scalar(sql).fetch_one(self.pool()).await?)
    }
}

const FOREIGN_KEYS: &str = "SELECT COUNT(*) FROM pg_constraint WHERE contype = 'f'";
const SECONDARY_INDEXES: &str =
    "SELECT COUNT(*) FROM pg_indexes WHERE schemaname = 'public' AND indexname LIKE 'idx_%'";

#[tokio::test]
#[ignore]
#[serial]
async fn test_postgres_full_load_restores_indexes_and_constraints() -> Result<()> {
    let env = PgEnv::start().await?;
    let fks_before = env.count(FOREIGN_KEYS).await?;
    let indexes_before = env.count(SECONDARY_INDEXES).await?;
    assert_eq!(fks_before, 5);
    assert_eq!(indexes_before, 7);

    let source = env.dir("source")?;
    write_labels(
        &source,
        &[
            Label::new(DOC_A1, SET_A, 1).effective("20230101"),
            Label::new(DOC_A2, SET_A, 2).effective("20230601"),
            Label::new(DOC_B1, SET_B, 1).with_ingredients(&["SERTRALINE", "STARCH, CORN"]),
        ],
    )?;

    let report = env.pipeline().run_full_load(Some(&source)).await?;
    assert_eq!(report.documents, 3);

    assert_eq!(
        env.latest_documents().await?,
        vec![DOC_A2.to_string(), DOC_B1.to_string()]
    );
    assert_eq!(env.count("SELECT COUNT(*) FROM ingredients").await?, 4);
    assert_eq!(env.count(FOREIGN_KEYS).await?, fks_before);
    assert_eq!(env.count(SECONDARY_INDEXES).await?, indexes_before);
    assert!(env.backend.pending_schema_objects().await?.is_empty());
    assert_eq!(env.count("SELECT COUNT(*) FROM products_staging").await?, 0);
    Ok(())
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_postgres_failed_merge_leaves_production_untouched() -> Result<()> {
    let env = PgEnv::start().await?;
    let source = env.dir("source")?;
    write_labels(&source, &[Label::new(DOC_A1, SET_A, 1)])?;
    env.pipeline().run_full_load(Some(&source)).await?;

    let staged = env.dir("staged")?;
    std::fs::write(
        staged.join("raw_documents.csv"),
        format!(
            "{},{},2,2024-03-01,\\N,a2.xml,2024-03-01T00:00:00+00:00\n",
            DOC_A2, SET_A
        ),
    )?;
    std::fs::write(
        staged.join("products.csv"),
        format!(
            "{},{},2,2024-03-01,Fluoxetine,\\N,\\N,\\N,false,2024-03-01T00:00:00+00:00\n",
            DOC_A2, SET_A
        ),
    )?;
    std::fs::write(
        staged.join("ingredients.csv"),
        "\\N,FLUOXETINE,X1,20,1,mg,true\n",
    )?;

    let backend: &dyn LoaderBackend = env.backend.as_ref();
    assert_eq!(bulk_load_to_staging(backend, &staged).await?, 3);

    let result = MergeEngine::new(backend).merge(LoadMode::Delta).await;
    assert!(matches!(result, Err(EtlError::Merge { .. })));

    assert_eq!(env.latest_documents().await?, vec![DOC_A1.to_string()]);
    assert_eq!(env.count("SELECT COUNT(*) FROM products").await?, 1);
    assert_eq!(env.count("SELECT COUNT(*) FROM products_staging").await?, 1);
    Ok(())
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_postgres_degraded_schema_is_detected_and_restored() -> Result<()> {
    let env = PgEnv::start().await?;
    let pipeline = env.pipeline();

    let objects = env.backend.snapshot_schema_objects().await?;
    assert_eq!(objects.len(), 12);
    env.backend.drop_schema_objects(&objects).await?;
    assert_eq!(env.count(FOREIGN_KEYS).await?, 0);

    let source = env.dir("source")?;
    write_labels(&source, &[Label::new(DOC_A1, SET_A, 1)])?;
    let blocked = pipeline.run_full_load(Some(&source)).await;
    assert!(matches!(blocked, Err(EtlError::SchemaDegraded(12))));

    assert_eq!(pipeline.restore_schema().await?, 12);
    assert_eq!(env.count(FOREIGN_KEYS).await?, 5);
    assert_eq!(env.count(SECONDARY_INDEXES).await?, 7);

    pipeline.run_full_load(Some(&source)).await?;
    let runs = env.backend.recent_runs(2).await?;
    assert_eq!(runs[0].status, RunStatus::Success);
    assert_eq!(runs[1].status, RunStatus::Failed);
    Ok(())
}
