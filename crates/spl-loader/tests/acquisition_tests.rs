//! Acquisition and delta-load tests against a mock archive source

mod common;

use anyhow::Result;
use common::*;
use spl_loader::acquisition::{build_client, ArchiveDownloader, ArchiveListing};
use spl_loader::config::HttpConfig;
use spl_loader::models::{Archive, RunStatus};
use spl_loader::storage::LoaderBackend;
use spl_loader::EtlError;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_http() -> HttpConfig {
    HttpConfig::default()
        .with_max_retries(3)
        .with_retry_delays(Duration::from_millis(1), Duration::from_millis(5))
        .with_timeout_secs(10)
}

/// Serve `bytes` as `/files/<name>`, expecting exactly `hits` requests
async fn mount_archive(server: &MockServer, name: &str, bytes: Vec<u8>, hits: u64) {
    Mock::given(method("GET"))
        .and(path(format!("/files/{}", name)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(bytes))
        .expect(hits)
        .mount(server)
        .await;
}

async fn mount_listing(server: &MockServer, archives: &[(&str, &str)]) {
    Mock::given(method("GET"))
        .and(path("/listing"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(listing_page(&server.uri(), archives)),
        )
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_listing_retries_transient_failures() -> Result<()> {
    init_tracing();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/listing"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    mount_listing(&server, &[("a.zip", "0123456789abcdef0123456789abcdef")]).await;

    let http = fast_http();
    let listing = ArchiveListing::new(
        build_client(&http)?,
        http,
        format!("{}/listing", server.uri()),
    );

    let archives = listing.fetch().await?;
    assert_eq!(archives.len(), 1);
    assert_eq!(archives[0].name, "a.zip");
    assert_eq!(archives[0].url, format!("{}/files/a.zip", server.uri()));
    Ok(())
}

#[tokio::test]
async fn test_listing_gives_up_after_attempt_ceiling() -> Result<()> {
    init_tracing();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/listing"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let http = fast_http();
    let listing = ArchiveListing::new(
        build_client(&http)?,
        http,
        format!("{}/listing", server.uri()),
    );

    let result = listing.fetch().await;
    assert!(matches!(result, Err(EtlError::HttpStatus { status: 500, .. })));
    Ok(())
}

#[tokio::test]
async fn test_checksum_mismatch_is_final_and_removes_file() -> Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    let dir = tempfile::TempDir::new()?;

    mount_archive(&server, "bad.zip", b"not what was advertised".to_vec(), 1).await;

    let http = fast_http();
    let downloader = ArchiveDownloader::new(build_client(&http)?, http, dir.path());
    let archive = Archive {
        name: "bad.zip".to_string(),
        url: format!("{}/files/bad.zip", server.uri()),
        checksum: md5_hex(b"the real archive"),
    };

    let result = downloader.download(&archive).await;

    assert!(matches!(result, Err(EtlError::ChecksumMismatch { .. })));
    assert!(!downloader.archive_path(&archive).exists());
    Ok(())
}

#[tokio::test]
async fn test_download_verifies_and_reuses_archive() -> Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    let dir = tempfile::TempDir::new()?;
    let bytes = zip_labels(&[Label::new(DOC_A1, SET_A, 1)])?;

    mount_archive(&server, "good.zip", bytes.clone(), 1).await;

    let http = fast_http();
    let downloader =
        ArchiveDownloader::new(build_client(&http)?, http, dir.path()).reuse_verified_files(true);
    let archive = Archive {
        name: "good.zip".to_string(),
        url: format!("{}/files/good.zip", server.uri()),
        checksum: md5_hex(&bytes).to_uppercase(),
    };

    let first = downloader.download(&archive).await?;
    assert_eq!(std::fs::read(&first)?, bytes);

    // Second call is served from disk; the mock expects a single request
    let second = downloader.download(&archive).await?;
    assert_eq!(first, second);
    Ok(())
}

#[tokio::test]
async fn test_delta_load_skips_processed_archives() -> Result<()> {
    let env = TestEnv::start().await?;
    let server = MockServer::start().await;

    let archive_a = zip_labels(&[Label::new(DOC_A1, SET_A, 1)])?;
    let archive_b = zip_labels(&[Label::new(DOC_B1, SET_B, 1)])?;
    let (sum_a, sum_b) = (md5_hex(&archive_a), md5_hex(&archive_b));

    mount_listing(&server, &[("a.zip", sum_a.as_str()), ("b.zip", sum_b.as_str())]).await;
    mount_archive(&server, "a.zip", archive_a, 0).await;
    mount_archive(&server, "b.zip", archive_b, 1).await;

    env.backend.record_processed_archive("a.zip", &sum_a).await?;

    let pipeline = env.pipeline(&format!("{}/listing", server.uri()));
    let report = pipeline.run_delta_load().await?;

    assert_eq!(report.archives, vec!["b.zip".to_string()]);
    assert_eq!(report.documents, 1);
    assert_eq!(env.latest_documents().await?, vec![DOC_B1.to_string()]);

    let processed = env.backend.processed_archives().await?;
    assert!(processed.contains("a.zip"));
    assert!(processed.contains("b.zip"));

    // Nothing new the second time round
    let again = pipeline.run_delta_load().await?;
    assert!(again.archives.is_empty());
    assert_eq!(again.records_loaded, 0);
    assert_eq!(env.count("products").await?, 1);

    let runs = env.backend.recent_runs(10).await?;
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| r.status == RunStatus::Success && r.mode == "delta"));
    Ok(())
}

#[tokio::test]
async fn test_delta_load_promotes_new_version_and_replaces_children() -> Result<()> {
    let env = TestEnv::start().await?;
    let source = env.source_dir()?;
    write_labels(
        &source,
        &[
            Label::new(DOC_A1, SET_A, 1).with_ingredients(&["FLUOXETINE", "STARCH, CORN"]),
            Label::new(DOC_B1, SET_B, 1),
        ],
    )?;

    let server = MockServer::start().await;
    let pipeline = env.pipeline(&format!("{}/listing", server.uri()));
    pipeline.run_full_load(Some(&source)).await?;
    assert_eq!(
        env.latest_documents().await?,
        vec![DOC_A1.to_string(), DOC_B1.to_string()]
    );

    // Corrected A1 plus a new version of set A
    let update = zip_labels(&[
        Label::new(DOC_A1, SET_A, 1)
            .named("Fluoxetine (corrected)")
            .with_ingredients(&["FLUOXETINE HYDROCHLORIDE"]),
        Label::new(DOC_A2, SET_A, 2).effective("20240601"),
    ])?;
    let checksum = md5_hex(&update);
    mount_listing(&server, &[("dm_spl_daily_update_06012024.zip", checksum.as_str())]).await;
    mount_archive(&server, "dm_spl_daily_update_06012024.zip", update, 1).await;

    let report = pipeline.run_delta_load().await?;
    assert_eq!(report.documents, 2);

    assert_eq!(env.count("products").await?, 3);
    assert_eq!(env.count("raw_documents").await?, 3);
    assert_eq!(
        env.ingredient_names(DOC_A1).await?,
        vec!["FLUOXETINE HYDROCHLORIDE".to_string()]
    );
    let ndcs: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM product_ndcs WHERE document_id = ?")
            .bind(DOC_A1)
            .fetch_one(env.pool())
            .await?;
    assert_eq!(ndcs, 1);

    let name: String =
        sqlx::query_scalar("SELECT product_name FROM products WHERE document_id = ?")
            .bind(DOC_A1)
            .fetch_one(env.pool())
            .await?;
    assert_eq!(name, "Fluoxetine (corrected)");

    // B was not in the delta and keeps its flag
    assert_eq!(
        env.latest_documents().await?,
        vec![DOC_A2.to_string(), DOC_B1.to_string()]
    );
    Ok(())
}

#[tokio::test]
async fn test_delta_load_keeps_newer_production_version() -> Result<()> {
    let env = TestEnv::start().await?;
    let source = env.source_dir()?;
    write_labels(&source, &[Label::new(DOC_A2, SET_A, 2).effective("20240601")])?;

    let server = MockServer::start().await;
    let pipeline = env.pipeline(&format!("{}/listing", server.uri()));
    pipeline.run_full_load(Some(&source)).await?;
    assert_eq!(env.latest_documents().await?, vec![DOC_A2.to_string()]);

    // A late-arriving copy of the older version
    let update = zip_labels(&[Label::new(DOC_A1, SET_A, 1).effective("20240115")])?;
    let checksum = md5_hex(&update);
    mount_listing(&server, &[("dm_spl_daily_update_06022024.zip", checksum.as_str())]).await;
    mount_archive(&server, "dm_spl_daily_update_06022024.zip", update, 1).await;

    let report = pipeline.run_delta_load().await?;
    assert_eq!(report.documents, 1);

    assert_eq!(env.count("products").await?, 2);
    assert_eq!(env.latest_documents().await?, vec![DOC_A2.to_string()]);
    Ok(())
}

#[tokio::test]
async fn test_delta_load_repeated_document_keeps_later_archive() -> Result<()> {
    let env = TestEnv::start().await?;
    let server = MockServer::start().await;

    let earlier = zip_labels(&[
        Label::new(DOC_A1, SET_A, 1).with_ingredients(&["FLUOXETINE", "STARCH, CORN"]),
        Label::new(DOC_B1, SET_B, 1),
    ])?;
    let later = zip_labels(&[Label::new(DOC_A1, SET_A, 1)
        .named("Fluoxetine (corrected)")
        .with_ingredients(&["FLUOXETINE HYDROCHLORIDE"])])?;
    let (sum_earlier, sum_later) = (md5_hex(&earlier), md5_hex(&later));

    mount_listing(
        &server,
        &[
            ("dm_spl_daily_update_06012024.zip", sum_earlier.as_str()),
            ("dm_spl_daily_update_06022024.zip", sum_later.as_str()),
        ],
    )
    .await;
    mount_archive(&server, "dm_spl_daily_update_06012024.zip", earlier, 1).await;
    mount_archive(&server, "dm_spl_daily_update_06022024.zip", later, 1).await;

    let report = env
        .pipeline(&format!("{}/listing", server.uri()))
        .run_delta_load()
        .await?;

    assert_eq!(report.archives.len(), 2);
    assert_eq!(report.documents, 2);
    assert_eq!(env.count("products").await?, 2);
    assert_eq!(env.count("raw_documents").await?, 2);
    assert_eq!(
        env.ingredient_names(DOC_A1).await?,
        vec!["FLUOXETINE HYDROCHLORIDE".to_string()]
    );

    let name: String =
        sqlx::query_scalar("SELECT product_name FROM products WHERE document_id = ?")
            .bind(DOC_A1)
            .fetch_one(env.pool())
            .await?;
    assert_eq!(name, "Fluoxetine (corrected)");
    Ok(())
}

#[tokio::test]
async fn test_partial_download_fails_run_without_recording() -> Result<()> {
    let env = TestEnv::start().await?;
    let server = MockServer::start().await;

    let good = zip_labels(&[Label::new(DOC_A1, SET_A, 1)])?;
    let good_sum = md5_hex(&good);
    let bad_sum = md5_hex(b"advertised");

    mount_listing(
        &server,
        &[("good.zip", good_sum.as_str()), ("bad.zip", bad_sum.as_str())],
    )
    .await;
    mount_archive(&server, "good.zip", good, 1).await;
    mount_archive(&server, "bad.zip", b"corrupted".to_vec(), 1).await;

    let pipeline = env.pipeline(&format!("{}/listing", server.uri()));
    let result = pipeline.run_delta_load().await;

    match result {
        Err(EtlError::PartialBatch {
            failures,
            downloaded,
        }) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].archive, "bad.zip");
            assert_eq!(downloaded.len(), 1);
            assert_eq!(downloaded[0].name, "good.zip");
        },
        other => panic!("expected partial batch, got {:?}", other),
    }

    assert!(env.backend.processed_archives().await?.is_empty());
    assert_eq!(env.count("products").await?, 0);
    let runs = env.backend.recent_runs(1).await?;
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert!(runs[0]
        .error_log
        .as_deref()
        .is_some_and(|log| log.contains("bad.zip")));

    // The verified archive stays on disk for the next attempt
    assert!(env.path("data/downloads/good.zip").exists());
    assert!(!env.path("data/downloads/bad.zip").exists());
    Ok(())
}
