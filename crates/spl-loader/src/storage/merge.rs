//! Staging to production merge
//!
//! One merge is one transaction and moves through
//! `Staged -> Merging -> Committed | Failed`. A failure at any step rolls the
//! whole transaction back: production is untouched and staging keeps the
//! batch for inspection.

use std::fmt;
use std::future::Future;
use tracing::{error, info};

use super::{LoaderBackend, MergeTransaction};
use crate::error::{EtlError, Result};
use crate::models::LoadMode;
use crate::tables::TableKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeState {
    Staged,
    Merging,
    Committed,
    Failed,
}

impl fmt::Display for MergeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MergeState::Staged => "STAGED",
            MergeState::Merging => "MERGING",
            MergeState::Committed => "COMMITTED",
            MergeState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// What a committed merge did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub mode: LoadMode,
    /// Rows written into production tables
    pub rows_merged: u64,
    /// Products whose latest-version flag was rewritten
    pub latest_flags_updated: u64,
}

pub struct MergeEngine<'a> {
    backend: &'a dyn LoaderBackend,
    state: MergeState,
}

impl<'a> MergeEngine<'a> {
    pub fn new(backend: &'a dyn LoaderBackend) -> Self {
        Self {
            backend,
            state: MergeState::Staged,
        }
    }

    pub fn state(&self) -> MergeState {
        self.state
    }

    /// Merge the staged batch into production.
    ///
    /// Full mode replaces production wholesale; delta mode upserts parents by
    /// `document_id` and replaces the children of every staged document.
    /// Either way the latest-version flags of touched families are recomputed
    /// and staging is emptied, all before the single commit.
    pub async fn merge(&mut self, mode: LoadMode) -> Result<MergeReport> {
        if self.state != MergeState::Staged {
            return Err(EtlError::config(format!(
                "merge already attempted (state {})",
                self.state
            )));
        }

        info!("Merging staged data into production ({} mode)", mode);
        self.state = MergeState::Merging;

        let mut tx = match self.backend.begin_merge().await {
            Ok(tx) => tx,
            Err(e) => {
                self.state = MergeState::Failed;
                return Err(EtlError::merge("begin transaction", e));
            },
        };

        match run_steps(tx.as_mut(), mode).await {
            Ok(report) => match tx.commit().await {
                Ok(()) => {
                    self.state = MergeState::Committed;
                    info!(
                        "Merge committed: {} row(s), {} latest-version flag(s) updated",
                        report.rows_merged, report.latest_flags_updated
                    );
                    Ok(report)
                },
                Err(e) => {
                    self.state = MergeState::Failed;
                    Err(EtlError::merge("commit", e))
                },
            },
            Err(e) => {
                self.state = MergeState::Failed;
                error!("Merge failed, rolling back: {}", e);
                if let Err(rollback_error) = tx.rollback().await {
                    error!("Rollback failed: {}", rollback_error);
                }
                Err(e)
            },
        }
    }
}

async fn step<T>(name: impl Into<String>, fut: impl Future<Output = Result<T>>) -> Result<T> {
    fut.await.map_err(|e| EtlError::merge(name, e))
}

async fn run_steps(tx: &mut dyn MergeTransaction, mode: LoadMode) -> Result<MergeReport> {
    let children_first: Vec<TableKind> = TableKind::DEPENDENCY_ORDER.iter().rev().copied().collect();
    let mut rows_merged = 0;

    match mode {
        LoadMode::Full => {
            step("truncate production", tx.truncate_production(&children_first)).await?;
            for table in TableKind::DEPENDENCY_ORDER {
                rows_merged += step(format!("insert {}", table), tx.copy_from_staging(table)).await?;
            }
        },
        LoadMode::Delta => {
            for table in TableKind::PARENTS {
                rows_merged +=
                    step(format!("upsert {}", table), tx.upsert_from_staging(table)).await?;
            }
            for table in TableKind::CHILDREN {
                step(
                    format!("delete stale {}", table),
                    tx.delete_children_of_staged(table),
                )
                .await?;
                rows_merged += step(format!("insert {}", table), tx.copy_from_staging(table)).await?;
            }
        },
    }

    let latest_flags_updated =
        step("recompute latest versions", tx.recompute_latest_versions()).await?;
    step("truncate staging", tx.truncate_staging(&children_first)).await?;

    Ok(MergeReport {
        mode,
        rows_merged,
        latest_flags_updated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Records every step and fails on the named one
    #[derive(Default)]
    struct RecordingTransaction {
        steps: Vec<String>,
        fail_on: Option<&'static str>,
    }

    impl RecordingTransaction {
        fn record(&mut self, step: String) -> Result<u64> {
            let fail = self.fail_on.is_some_and(|f| step == f);
            self.steps.push(step);
            if fail {
                Err(EtlError::config("injected failure"))
            } else {
                Ok(1)
            }
        }
    }

    #[async_trait]
    impl MergeTransaction for RecordingTransaction {
        async fn truncate_production(&mut self, tables: &[TableKind]) -> Result<()> {
            let names: Vec<_> = tables.iter().map(|t| t.table_name()).collect();
            self.record(format!("truncate {}", names.join(","))).map(|_| ())
        }

        async fn copy_from_staging(&mut self, table: TableKind) -> Result<u64> {
            self.record(format!("insert {}", table))
        }

        async fn upsert_from_staging(&mut self, table: TableKind) -> Result<u64> {
            self.record(format!("upsert {}", table))
        }

        async fn delete_children_of_staged(&mut self, table: TableKind) -> Result<u64> {
            self.record(format!("delete {}", table))
        }

        async fn recompute_latest_versions(&mut self) -> Result<u64> {
            self.record("recompute".to_string())
        }

        async fn truncate_staging(&mut self, _tables: &[TableKind]) -> Result<()> {
            self.record("truncate staging".to_string()).map(|_| ())
        }

        async fn commit(self: Box<Self>) -> Result<()> {
            Ok(())
        }

        async fn rollback(self: Box<Self>) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_full_merge_truncates_children_first_then_inserts_parents_first() {
        let mut tx = RecordingTransaction::default();
        let report = run_steps(&mut tx, LoadMode::Full).await.unwrap();

        assert_eq!(
            tx.steps[0],
            "truncate marketing_status,packaging,ingredients,product_ndcs,products,raw_documents"
        );
        assert_eq!(tx.steps[1], "insert raw_documents");
        assert_eq!(tx.steps[2], "insert products");
        assert_eq!(tx.steps[tx.steps.len() - 2], "recompute");
        assert_eq!(tx.steps[tx.steps.len() - 1], "truncate staging");
        assert_eq!(report.rows_merged, 6);
    }

    #[tokio::test]
    async fn test_delta_merge_replaces_children_of_staged_documents() {
        let mut tx = RecordingTransaction::default();
        run_steps(&mut tx, LoadMode::Delta).await.unwrap();

        assert_eq!(tx.steps[0], "upsert raw_documents");
        assert_eq!(tx.steps[1], "upsert products");
        assert_eq!(tx.steps[2], "delete product_ndcs");
        assert_eq!(tx.steps[3], "insert product_ndcs");
        assert!(!tx.steps.iter().any(|s| s.starts_with("truncate ") && s != "truncate staging"));
    }

    #[tokio::test]
    async fn test_failed_step_stops_before_staging_is_cleared() {
        let mut tx = RecordingTransaction {
            fail_on: Some("insert ingredients"),
            ..Default::default()
        };
        let err = run_steps(&mut tx, LoadMode::Full).await.unwrap_err();

        assert!(matches!(err, EtlError::Merge { ref step, .. } if step == "insert ingredients"));
        assert!(!tx.steps.contains(&"recompute".to_string()));
        assert!(!tx.steps.contains(&"truncate staging".to_string()));
    }
}
