//! Load coordinator — reconciles storage against the tracking table.
//!
//! One run:
//! 1. List every object under the dataset prefix. Nothing listed means
//!    nothing to do, and no table is touched.
//! 2. Ensure the tracking table and read the loaded set once. Files that
//!    land in storage during the run are picked up by the next run.
//! 3. Group unseen paths by the symbol decoded from the path. Paths that do
//!    not decode are reported as ignored.
//! 4. Fan the groups out over a bounded pool. Inside a group, paths are
//!    processed one at a time in sorted order: load, then mark. A failed
//!    file is unmarked and the group moves on.
//! 5. Normalize each group's table (best effort).
//!
//! Only setup failures (listing, tracking table, pool) fail the run.

use crate::report::{FileLoadFailure, LoadReport, NormalizationFailure};
use crate::tracker::LoadTracker;
use crate::warehouse::{Statement, TableSpec, Warehouse, WarehouseError, WriteMode};
use klineflow_core::{ObjectStore, ObjectUri, PathCodec, StorageError};
use rayon::prelude::*;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

pub const DEFAULT_LOAD_WORKERS: usize = 3;
pub const DEFAULT_TABLE_PREFIX: &str = "raw_binance_klines_";

/// Failures that abort a whole coordinator run.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("bucket '{requested}' is not served by this coordinator (serving '{served}')")]
    UnknownBucket { requested: String, served: String },

    #[error("listing objects in bucket {bucket} failed: {source}")]
    Listing {
        bucket: String,
        #[source]
        source: StorageError,
    },

    #[error("load tracking setup failed: {0}")]
    Setup(#[source] WarehouseError),

    #[error("failed to build load worker pool: {0}")]
    Pool(String),
}

/// What happened to one symbol's group.
#[derive(Default)]
struct GroupOutcome {
    loaded: Vec<String>,
    failures: Vec<FileLoadFailure>,
    normalization: Option<NormalizationFailure>,
    cancelled: bool,
}

pub struct LoadCoordinator {
    store: Arc<dyn ObjectStore>,
    warehouse: Arc<dyn Warehouse>,
    tracker: LoadTracker,
    codec: PathCodec,
    table_prefix: String,
    workers: usize,
}

impl LoadCoordinator {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        warehouse: Arc<dyn Warehouse>,
        tracker: LoadTracker,
    ) -> Self {
        Self {
            store,
            warehouse,
            tracker,
            codec: PathCodec::default(),
            table_prefix: DEFAULT_TABLE_PREFIX.to_string(),
            workers: DEFAULT_LOAD_WORKERS,
        }
    }

    pub fn with_codec(mut self, codec: PathCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_table_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.table_prefix = prefix.into();
        self
    }

    /// Bound on concurrent symbol groups (and so on concurrent load jobs).
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn tracker(&self) -> &LoadTracker {
        &self.tracker
    }

    /// Destination table for `symbol`.
    pub fn table_for(&self, symbol: &str) -> String {
        format!("{}{}", self.table_prefix, symbol.to_ascii_lowercase())
    }

    /// Load every listed object of `bucket` that is not yet tracked.
    ///
    /// `cancel` is checked before each file. A raised flag stops workers
    /// between files; a load and its mark are never split by it.
    pub fn run(&self, bucket: &str, cancel: Option<&AtomicBool>) -> Result<LoadReport, LoadError> {
        if bucket != self.store.bucket() {
            return Err(LoadError::UnknownBucket {
                requested: bucket.to_string(),
                served: self.store.bucket().to_string(),
            });
        }

        let listed = self
            .store
            .list_objects(&self.codec.dataset_prefix())
            .map_err(|source| LoadError::Listing {
                bucket: bucket.to_string(),
                source,
            })?;
        let mut report = LoadReport::default();
        if listed.is_empty() {
            info!(bucket, "no objects listed, nothing to load");
            return Ok(report);
        }

        self.tracker.ensure().map_err(LoadError::Setup)?;
        let loaded_set = self.tracker.loaded_set().map_err(LoadError::Setup)?;

        let groups = self.group_unseen(listed, &loaded_set, &mut report);
        if groups.is_empty() {
            info!(bucket, skipped = report.skipped.len(), "everything already loaded");
            return Ok(report);
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
            .map_err(|e| LoadError::Pool(e.to_string()))?;

        let outcomes: Vec<GroupOutcome> = pool.install(|| {
            groups
                .par_iter()
                .map(|(symbol, paths)| self.load_group(bucket, symbol, paths, cancel))
                .collect()
        });

        for outcome in outcomes {
            report.loaded.extend(outcome.loaded);
            report.failures.extend(outcome.failures);
            report.normalization_failures.extend(outcome.normalization);
            report.cancelled |= outcome.cancelled;
        }
        report.loaded.sort();

        info!(
            bucket,
            loaded = report.loaded.len(),
            skipped = report.skipped.len(),
            failed = report.failures.len(),
            ignored = report.ignored.len(),
            "load run finished"
        );
        Ok(report)
    }

    /// Symbol → sorted unseen paths. Records skipped and ignored paths.
    fn group_unseen(
        &self,
        listed: Vec<String>,
        loaded_set: &HashSet<String>,
        report: &mut LoadReport,
    ) -> BTreeMap<String, Vec<String>> {
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for path in listed {
            match self.codec.decode(&path) {
                Ok(_) if loaded_set.contains(&path) => report.skipped.push(path),
                Ok(decoded) => groups.entry(decoded.symbol).or_default().push(path),
                Err(e) => {
                    warn!(%path, error = %e, "ignoring object outside the kline layout");
                    report.ignored.push(path);
                }
            }
        }
        for paths in groups.values_mut() {
            paths.sort();
        }
        groups
    }

    fn load_group(
        &self,
        bucket: &str,
        symbol: &str,
        paths: &[String],
        cancel: Option<&AtomicBool>,
    ) -> GroupOutcome {
        let table = self.table_for(symbol);
        let mut outcome = GroupOutcome::default();

        if let Err(e) = self.warehouse.ensure_table(&table, &TableSpec::klines()) {
            error!(symbol, %table, error = %e, "cannot create destination table");
            let detail = e.to_string();
            outcome.failures = paths
                .iter()
                .map(|path| FileLoadFailure {
                    symbol: symbol.to_string(),
                    path: path.clone(),
                    error: WarehouseError::LoadJob {
                        uri: ObjectUri::new(bucket, path.as_str()).to_string(),
                        detail: format!("destination table {table} unavailable: {detail}"),
                    },
                })
                .collect();
            return outcome;
        }

        for path in paths {
            if cancel.is_some_and(|f| f.load(Ordering::Relaxed)) {
                outcome.cancelled = true;
                break;
            }

            match self.load_one(bucket, &table, path) {
                Ok(rows) => {
                    info!(symbol, %table, %path, rows, "file loaded");
                    outcome.loaded.push(path.clone());
                }
                Err(e) => {
                    error!(
                        symbol,
                        %table,
                        %path,
                        error = %e,
                        "file load failed, rolling back tracking"
                    );
                    if let Err(undo) = self.tracker.unmark(path) {
                        error!(symbol, %path, error = %undo, "tracking rollback failed");
                    }
                    outcome.failures.push(FileLoadFailure {
                        symbol: symbol.to_string(),
                        path: path.clone(),
                        error: e,
                    });
                }
            }
        }

        if !outcome.cancelled {
            match self.warehouse.execute(&Statement::derive_kline_timestamps(&table)) {
                Ok(rows) => info!(symbol, %table, rows, "derived timestamp columns"),
                Err(e) => {
                    warn!(symbol, %table, error = %e, "post-load normalization failed");
                    outcome.normalization = Some(NormalizationFailure {
                        symbol: symbol.to_string(),
                        table,
                        error: e,
                    });
                }
            }
        }

        outcome
    }

    fn load_one(&self, bucket: &str, table: &str, path: &str) -> Result<usize, WarehouseError> {
        let uri = ObjectUri::new(bucket, path);
        let rows = self.warehouse.load_parquet(table, &uri, WriteMode::Append)?;
        self.tracker.mark_loaded(path)?;
        Ok(rows)
    }
}
