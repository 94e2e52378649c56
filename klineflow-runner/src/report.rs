//! Load run report — what a coordinator run did, per file.
//!
//! The CSV form lists one row per file that was loaded, skipped, ignored or
//! failed, so an operator can re-run a failed file by hand.

use anyhow::{Context, Result};

use crate::warehouse::WarehouseError;

/// A file whose load job failed. Its tracking entry was rolled back.
#[derive(Debug)]
pub struct FileLoadFailure {
    pub symbol: String,
    pub path: String,
    pub error: WarehouseError,
}

/// Post-load normalization that failed for one symbol's table.
///
/// Does not affect the status of files already loaded.
#[derive(Debug)]
pub struct NormalizationFailure {
    pub symbol: String,
    pub table: String,
    pub error: WarehouseError,
}

/// Outcome of one coordinator run.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Newly and successfully loaded paths, sorted.
    pub loaded: Vec<String>,
    /// Eligible paths that were already in the tracking table.
    pub skipped: Vec<String>,
    /// Listed paths that do not follow the object layout.
    pub ignored: Vec<String>,
    pub failures: Vec<FileLoadFailure>,
    pub normalization_failures: Vec<NormalizationFailure>,
    /// The cancel flag stopped workers before every file was visited.
    pub cancelled: bool,
}

impl LoadReport {
    pub fn all_succeeded(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }

    /// CSV with columns `status,symbol,path,detail`.
    pub fn to_csv(&self) -> Result<String> {
        let mut wtr = csv::Writer::from_writer(vec![]);
        wtr.write_record(["status", "symbol", "path", "detail"])?;

        for path in &self.loaded {
            wtr.write_record(["loaded", symbol_of(path), path.as_str(), ""])?;
        }
        for path in &self.skipped {
            wtr.write_record(["skipped", symbol_of(path), path.as_str(), "already loaded"])?;
        }
        for path in &self.ignored {
            wtr.write_record(["ignored", "", path.as_str(), "not a kline object path"])?;
        }
        for f in &self.failures {
            wtr.write_record([
                "failed",
                f.symbol.as_str(),
                f.path.as_str(),
                f.error.to_string().as_str(),
            ])?;
        }
        for f in &self.normalization_failures {
            wtr.write_record([
                "normalization_failed",
                f.symbol.as_str(),
                f.table.as_str(),
                f.error.to_string().as_str(),
            ])?;
        }

        let data = wtr.into_inner().context("failed to flush CSV writer")?;
        String::from_utf8(data).context("CSV output is not valid UTF-8")
    }
}

/// Symbol directory of a `{prefix}/{SYMBOL}/{yyyy}/M{mm}/{file}` path.
fn symbol_of(path: &str) -> &str {
    let segments: Vec<&str> = path.split('/').collect();
    segments
        .len()
        .checked_sub(4)
        .and_then(|i| segments.get(i).copied())
        .unwrap_or("")
}
