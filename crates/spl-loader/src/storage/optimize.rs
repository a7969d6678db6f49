//! Full-load index and foreign-key optimization
//!
//! Before a full merge the secondary indexes and foreign keys of the
//! production tables are captured and dropped; afterwards they are recreated
//! from the captured definitions. The definitions are persisted in
//! `etl_deferred_schema_objects` for as long as the objects are missing, so a
//! crash between the two phases leaves a record that later runs detect.

use tracing::{error, info, warn};

use super::{LoaderBackend, SchemaObject};
use crate::error::{EtlError, Result};
use crate::models::LoadMode;

pub struct OptimizationManager<'a> {
    backend: &'a dyn LoaderBackend,
    enabled: bool,
    dropped: Vec<SchemaObject>,
}

impl<'a> OptimizationManager<'a> {
    pub fn new(backend: &'a dyn LoaderBackend, enabled: bool) -> Self {
        Self {
            backend,
            enabled,
            dropped: Vec::new(),
        }
    }

    /// Objects dropped by this manager and not yet restored
    pub fn dropped(&self) -> &[SchemaObject] {
        &self.dropped
    }

    /// Refuse to run while an earlier run left dropped objects behind.
    pub async fn check_degraded(backend: &dyn LoaderBackend) -> Result<()> {
        let pending = backend.pending_schema_objects().await?;
        if pending.is_empty() {
            return Ok(());
        }

        for object in &pending {
            error!(
                alarm = "schema_degraded",
                object = %object.name,
                table = %object.table_name,
                "Deferred {} was never restored",
                object.kind
            );
        }
        Err(EtlError::SchemaDegraded(pending.len()))
    }

    /// Capture and drop secondary indexes and foreign keys.
    ///
    /// Only full loads with optimization enabled do anything.
    pub async fn pre_load(&mut self, mode: LoadMode) -> Result<usize> {
        if mode != LoadMode::Full || !self.enabled {
            info!("Skipping pre-load optimization ({} mode, enabled: {})", mode, self.enabled);
            return Ok(0);
        }

        let objects = self.backend.snapshot_schema_objects().await?;
        if objects.is_empty() {
            info!("No secondary indexes or foreign keys to drop");
            return Ok(0);
        }

        info!(
            "Dropping {} index/constraint definition(s) before full load",
            objects.len()
        );
        self.backend.drop_schema_objects(&objects).await?;
        self.dropped = objects;
        Ok(self.dropped.len())
    }

    /// Recreate whatever [`Self::pre_load`] dropped, in capture order.
    pub async fn post_load(&mut self) -> Result<usize> {
        if self.dropped.is_empty() {
            return Ok(0);
        }

        info!(
            "Restoring {} index/constraint definition(s)",
            self.dropped.len()
        );
        self.backend.restore_schema_objects(&self.dropped).await?;
        let restored = self.dropped.len();
        self.dropped.clear();
        Ok(restored)
    }

    /// Recreate every object recorded in the deferred ledger.
    pub async fn restore_pending(backend: &dyn LoaderBackend) -> Result<usize> {
        let pending = backend.pending_schema_objects().await?;
        if pending.is_empty() {
            info!("No deferred index/constraint definitions to restore");
            return Ok(0);
        }

        warn!(
            "Restoring {} deferred index/constraint definition(s)",
            pending.len()
        );
        backend.restore_schema_objects(&pending).await?;
        Ok(pending.len())
    }
}
