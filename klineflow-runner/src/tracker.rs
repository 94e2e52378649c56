//! Load tracking — which object paths have already been loaded.
//!
//! The tracking table is the only shared mutable state of the load side.
//! Workers for different symbols mark disjoint paths, and the warehouse
//! serializes writes to the table, so no locking happens here.

use crate::warehouse::{
    Literal, Statement, TableSpec, Warehouse, WarehouseError, LOADED_AT_COLUMN,
    SOURCE_FILE_COLUMN,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

pub struct LoadTracker {
    warehouse: Arc<dyn Warehouse>,
    table: String,
}

impl LoadTracker {
    pub fn new(warehouse: Arc<dyn Warehouse>, table: impl Into<String>) -> Self {
        Self {
            warehouse,
            table: table.into(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the dataset and tracking table if absent.
    pub fn ensure(&self) -> Result<(), WarehouseError> {
        self.warehouse.ensure_dataset()?;
        self.warehouse
            .ensure_table(&self.table, &TableSpec::load_tracking())?;
        Ok(())
    }

    /// Every path recorded as loaded.
    pub fn loaded_set(&self) -> Result<HashSet<String>, WarehouseError> {
        Ok(self
            .warehouse
            .scan_strings(&self.table, SOURCE_FILE_COLUMN)?
            .into_iter()
            .collect())
    }

    /// Record `path` as loaded. Recording a path twice is harmless.
    pub fn mark_loaded(&self, path: &str) -> Result<(), WarehouseError> {
        self.warehouse.execute(&Statement::Insert {
            table: self.table.clone(),
            values: vec![
                (SOURCE_FILE_COLUMN.to_string(), Literal::String(path.to_string())),
                (
                    LOADED_AT_COLUMN.to_string(),
                    Literal::TimestampMs(klineflow_core::now_ms()),
                ),
            ],
        })?;
        debug!(table = %self.table, path, "marked loaded");
        Ok(())
    }

    /// Remove every record of `path`. Unmarking an unknown path is not an
    /// error; returns how many records were removed.
    pub fn unmark(&self, path: &str) -> Result<usize, WarehouseError> {
        let removed = self.warehouse.execute(&Statement::DeleteWhereEq {
            table: self.table.clone(),
            column: SOURCE_FILE_COLUMN.to_string(),
            value: path.to_string(),
        })?;
        if removed > 0 {
            debug!(table = %self.table, path, removed, "unmarked");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::LocalWarehouse;

    fn tracker() -> (tempfile::TempDir, LoadTracker) {
        let dir = tempfile::tempdir().unwrap();
        let wh = Arc::new(LocalWarehouse::new(dir.path(), "analytics", "crypto"));
        let tracker = LoadTracker::new(wh, "bq_load_tracking");
        tracker.ensure().unwrap();
        (dir, tracker)
    }

    #[test]
    fn starts_empty() {
        let (_dir, tracker) = tracker();
        assert!(tracker.loaded_set().unwrap().is_empty());
    }

    #[test]
    fn ensure_is_idempotent() {
        let (_dir, tracker) = tracker();
        tracker.mark_loaded("a.parquet").unwrap();
        tracker.ensure().unwrap();
        assert!(tracker.loaded_set().unwrap().contains("a.parquet"));
    }

    #[test]
    fn mark_twice_then_unmark_removes_both() {
        let (_dir, tracker) = tracker();
        tracker.mark_loaded("a.parquet").unwrap();
        tracker.mark_loaded("a.parquet").unwrap();
        tracker.mark_loaded("b.parquet").unwrap();
        assert_eq!(tracker.loaded_set().unwrap().len(), 2);

        assert_eq!(tracker.unmark("a.parquet").unwrap(), 2);
        let loaded = tracker.loaded_set().unwrap();
        assert!(!loaded.contains("a.parquet"));
        assert!(loaded.contains("b.parquet"));
    }

    #[test]
    fn unmarking_unknown_path_is_not_an_error() {
        let (_dir, tracker) = tracker();
        assert_eq!(tracker.unmark("never-loaded.parquet").unwrap(), 0);
    }

    #[test]
    fn loaded_set_before_ensure_is_table_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let wh = Arc::new(LocalWarehouse::new(dir.path(), "analytics", "crypto"));
        let tracker = LoadTracker::new(wh, "bq_load_tracking");
        assert!(matches!(
            tracker.loaded_set(),
            Err(WarehouseError::TableNotFound { .. })
        ));
    }
}
