//! Shared helpers for spl-loader integration tests
//!
//! Every test gets its own SQLite file and working directories under a
//! temporary root, so tests can run in parallel.

#![allow(dead_code)]

use anyhow::Result;
use spl_loader::config::{DatabaseConfig, HttpConfig, IntermediateFormat, Settings, SqliteConfig};
use spl_loader::pipeline::Pipeline;
use spl_loader::storage::{LoaderBackend, SqliteBackend};
use sqlx::SqlitePool;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const SET_A: &str = "a0c2f3de-1111-4c4c-9d9d-0123456789ab";
pub const SET_B: &str = "b1d3e4ef-2222-4d4d-8e8e-123456789abc";

pub const DOC_A1: &str = "d1000000-0000-4000-8000-000000000001";
pub const DOC_A2: &str = "d1000000-0000-4000-8000-000000000002";
pub const DOC_A3: &str = "d1000000-0000-4000-8000-000000000003";
pub const DOC_B1: &str = "d2000000-0000-4000-8000-000000000001";

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,spl_loader=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// A migrated SQLite database plus scratch directories
pub struct TestEnv {
    pub root: TempDir,
    pub backend: Arc<SqliteBackend>,
}

impl TestEnv {
    pub async fn start() -> Result<Self> {
        init_tracing();
        let root = TempDir::new()?;
        let config = SqliteConfig::new(root.path().join("db").join("spl_test.db"));
        let backend = SqliteBackend::connect(&config).await?;
        backend.initialize_schema().await?;

        Ok(Self {
            root,
            backend: Arc::new(backend),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        self.backend.pool()
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.path().join(name)
    }

    /// Directory for source XML files, created on first use
    pub fn source_dir(&self) -> Result<PathBuf> {
        let dir = self.path("source");
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Settings pointing at this environment; `source_url` is only used by
    /// delta loads.
    pub fn settings(&self, source_url: &str) -> Settings {
        Settings {
            database: DatabaseConfig::Sqlite(SqliteConfig::new(self.backend.path())),
            http: HttpConfig::default()
                .with_max_retries(3)
                .with_retry_delays(Duration::from_millis(1), Duration::from_millis(5))
                .with_timeout_secs(10),
            source_url: source_url.to_string(),
            data_dir: self.path("data"),
            download_path: self.path("data/downloads"),
            quarantine_path: self.path("data/quarantine"),
            max_workers: 2,
            intermediate_format: IntermediateFormat::Csv,
        }
    }

    pub fn pipeline(&self, source_url: &str) -> Pipeline {
        Pipeline::new(self.settings(source_url), self.backend.clone())
    }

    pub async fn count(&self, table: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(self.pool())
            .await?;
        Ok(count)
    }

    /// Document ids flagged as latest, sorted
    pub async fn latest_documents(&self) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT document_id FROM products WHERE is_latest_version = 1 ORDER BY document_id",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(ids)
    }

    pub async fn ingredient_names(&self, document_id: &str) -> Result<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT ingredient_name FROM ingredients WHERE document_id = ? ORDER BY ingredient_name",
        )
        .bind(document_id)
        .fetch_all(self.pool())
        .await?;
        Ok(names)
    }
}

/// One label to render as SPL XML
#[derive(Debug, Clone)]
pub struct Label {
    pub document_id: &'static str,
    pub set_id: &'static str,
    pub version: i64,
    pub effective_time: &'static str,
    pub product_name: &'static str,
    pub ingredients: Vec<&'static str>,
}

impl Label {
    pub fn new(document_id: &'static str, set_id: &'static str, version: i64) -> Self {
        Self {
            document_id,
            set_id,
            version,
            effective_time: "20240115",
            product_name: "Fluoxetine",
            ingredients: vec!["FLUOXETINE HYDROCHLORIDE"],
        }
    }

    pub fn effective(mut self, effective_time: &'static str) -> Self {
        self.effective_time = effective_time;
        self
    }

    pub fn named(mut self, product_name: &'static str) -> Self {
        self.product_name = product_name;
        self
    }

    pub fn with_ingredients(mut self, ingredients: &[&'static str]) -> Self {
        self.ingredients = ingredients.to_vec();
        self
    }

    pub fn file_name(&self) -> String {
        format!("{}.xml", self.document_id)
    }

    pub fn to_xml(&self) -> String {
        let ingredients: String = self
            .ingredients
            .iter()
            .map(|name| {
                format!(
                    r#"
                <ingredient classCode="ACT">
                  <ingredientSubstance>
                    <code code="{code}" codeSystem="2.16.840.1.113883.4.9"/>
                    <name>{name}</name>
                  </ingredientSubstance>
                </ingredient>"#,
                    code = name.replace(' ', "_"),
                    name = name
                )
            })
            .collect();

        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<document xmlns="urn:hl7-org:v3">
  <id root="{document_id}"/>
  <code code="34391-3" codeSystem="2.16.840.1.113883.6.1"/>
  <effectiveTime value="{effective_time}"/>
  <setId root="{set_id}"/>
  <versionNumber value="{version}"/>
  <component>
    <structuredBody>
      <component>
        <section>
          <subject>
            <manufacturedProduct>
              <manufacturedProduct>
                <name>{product_name}</name>
                <formCode code="C25158" displayName="CAPSULE"/>
                <asEquivalentEntity classCode="EQUIV">
                  <code code="0777-3105-02" codeSystem="2.16.840.1.113883.6.69"/>
                </asEquivalentEntity>{ingredients}
              </manufacturedProduct>
              <manufacturer>
                <name>Dista Products</name>
              </manufacturer>
            </manufacturedProduct>
          </subject>
        </section>
      </component>
    </structuredBody>
  </component>
</document>
"#,
            document_id = self.document_id,
            effective_time = self.effective_time,
            set_id = self.set_id,
            version = self.version,
            product_name = self.product_name,
            ingredients = ingredients
        )
    }

    /// Production rows this label becomes: product, raw document, one NDC
    /// and its ingredients
    pub fn row_count(&self) -> u64 {
        3 + self.ingredients.len() as u64
    }
}

pub fn write_labels(dir: &Path, labels: &[Label]) -> Result<()> {
    for label in labels {
        std::fs::write(dir.join(label.file_name()), label.to_xml())?;
    }
    Ok(())
}

/// Zip the labels in memory, the way a daily update archive ships them
pub fn zip_labels(labels: &[Label]) -> Result<Vec<u8>> {
    let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    for label in labels {
        zip.start_file(label.file_name(), options)?;
        zip.write_all(label.to_xml().as_bytes())?;
    }
    Ok(zip.finish()?.into_inner())
}

pub fn md5_hex(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

/// Listing page advertising `archives` as (name, md5) pairs under `base`
pub fn listing_page(base: &str, archives: &[(&str, &str)]) -> String {
    let items: String = archives
        .iter()
        .map(|(name, checksum)| {
            format!(
                r#"
  <li>
    <a href="{base}/files/{name}">HTTPS</a>
    <span>MD5 checksum: {checksum}</span>
  </li>"#,
                base = base,
                name = name,
                checksum = checksum
            )
        })
        .collect();

    format!(
        r#"<html><body><h3>Daily Updates</h3><ul class="download">{}
</ul></body></html>"#,
        items
    )
}
