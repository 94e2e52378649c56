//! Warehouse collaborator.
//!
//! The load side only needs a handful of operations from a warehouse:
//! create-if-absent for the dataset and tables, bulk append of a Parquet
//! object, a few row-level statements, and a full scan of one string column.
//! [`LocalWarehouse`] implements them over Parquet files on disk.

mod local;

pub use local::LocalWarehouse;

use klineflow_core::columnar::KLINE_COLUMNS;
use klineflow_core::ObjectUri;
use polars::prelude::{DataType, TimeUnit};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Column holding the tracked object path.
pub const SOURCE_FILE_COLUMN: &str = "source_file";
/// Column holding the time a path was recorded as loaded.
pub const LOADED_AT_COLUMN: &str = "loaded_at";
/// Derived timestamp columns of a kline table, filled after each load.
pub const OPEN_TIME_TS_COLUMN: &str = "open_time_ts";
pub const CLOSE_TIME_TS_COLUMN: &str = "close_time_ts";

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("warehouse I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("warehouse storage error: {0}")]
    Columnar(String),

    #[error("table not found: {table}")]
    TableNotFound { table: String },

    #[error("schema mismatch in {table}: {detail}")]
    SchemaMismatch { table: String, detail: String },

    #[error("load job for {uri} failed: {detail}")]
    LoadJob { uri: String, detail: String },

    #[error("bucket '{bucket}' is not attached to this warehouse")]
    UnknownBucket { bucket: String },
}

impl WarehouseError {
    pub(crate) fn mismatch(table: &str, detail: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            table: table.to_string(),
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    String,
    Int64,
    Float64,
    /// Millisecond-precision UTC timestamp.
    Timestamp,
}

impl ColumnType {
    pub fn dtype(self) -> DataType {
        match self {
            ColumnType::String => DataType::String,
            ColumnType::Int64 => DataType::Int64,
            ColumnType::Float64 => DataType::Float64,
            ColumnType::Timestamp => DataType::Datetime(TimeUnit::Milliseconds, None),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub ty: ColumnType,
    pub nullable: bool,
}

impl ColumnSpec {
    pub fn required(name: &str, ty: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            ty,
            nullable: false,
        }
    }

    pub fn nullable(name: &str, ty: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            ty,
            nullable: true,
        }
    }
}

/// Schema of a table, applied on write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    pub columns: Vec<ColumnSpec>,
    /// Timestamp column the table is partitioned on by day.
    pub partition_by_day: Option<String>,
}

impl TableSpec {
    /// Per-symbol kline table: the file columns plus the two derived
    /// timestamps, partitioned by day on the open time.
    pub fn klines() -> Self {
        let mut columns: Vec<ColumnSpec> = KLINE_COLUMNS
            .iter()
            .map(|&name| match name {
                "symbol" => ColumnSpec::required(name, ColumnType::String),
                "open_time" | "close_time" => ColumnSpec::required(name, ColumnType::Int64),
                "number_of_trades" => ColumnSpec::nullable(name, ColumnType::Int64),
                _ => ColumnSpec::nullable(name, ColumnType::Float64),
            })
            .collect();
        columns.push(ColumnSpec::nullable(OPEN_TIME_TS_COLUMN, ColumnType::Timestamp));
        columns.push(ColumnSpec::nullable(CLOSE_TIME_TS_COLUMN, ColumnType::Timestamp));

        Self {
            columns,
            partition_by_day: Some(OPEN_TIME_TS_COLUMN.to_string()),
        }
    }

    /// Tracking table: one row per loaded object path.
    pub fn load_tracking() -> Self {
        Self {
            columns: vec![
                ColumnSpec::required(SOURCE_FILE_COLUMN, ColumnType::String),
                ColumnSpec::nullable(LOADED_AT_COLUMN, ColumnType::Timestamp),
            ],
            partition_by_day: None,
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    #[default]
    Append,
}

/// A literal cell value in a statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    String(String),
    Int64(i64),
    TimestampMs(i64),
    Null,
}

/// Row-level statements the load side issues.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// Insert one row; unnamed nullable columns are null.
    Insert {
        table: String,
        values: Vec<(String, Literal)>,
    },
    /// Delete every row whose string `column` equals `value`.
    DeleteWhereEq {
        table: String,
        column: String,
        value: String,
    },
    /// For each `(source, target)` pair, set the timestamp column `target`
    /// from the epoch-millisecond column `source` where `target` is null.
    DeriveTimestamps {
        table: String,
        pairs: Vec<(String, String)>,
    },
}

impl Statement {
    pub fn table(&self) -> &str {
        match self {
            Statement::Insert { table, .. }
            | Statement::DeleteWhereEq { table, .. }
            | Statement::DeriveTimestamps { table, .. } => table,
        }
    }

    /// Normalization run against a kline table after loading.
    pub fn derive_kline_timestamps(table: &str) -> Self {
        Statement::DeriveTimestamps {
            table: table.to_string(),
            pairs: vec![
                ("open_time".to_string(), OPEN_TIME_TS_COLUMN.to_string()),
                ("close_time".to_string(), CLOSE_TIME_TS_COLUMN.to_string()),
            ],
        }
    }
}

/// Trait for warehouses bound to one project and dataset.
///
/// Creation calls must be safe to race: concurrent `ensure_table` calls for
/// the same table create it once and succeed everywhere.
pub trait Warehouse: Send + Sync {
    /// `{project}.{dataset}`, for logs.
    fn dataset_id(&self) -> String;

    fn ensure_dataset(&self) -> Result<(), WarehouseError>;

    /// Create `table` with `spec` if absent. Returns whether it was created.
    fn ensure_table(&self, table: &str, spec: &TableSpec) -> Result<bool, WarehouseError>;

    /// Run a load job from an object into `table`. Returns rows loaded.
    ///
    /// Either every row of the object lands or none does.
    fn load_parquet(
        &self,
        table: &str,
        uri: &ObjectUri,
        mode: WriteMode,
    ) -> Result<usize, WarehouseError>;

    /// Run a statement. Returns the number of affected rows.
    fn execute(&self, statement: &Statement) -> Result<usize, WarehouseError>;

    /// Non-null values of a string column, in table order.
    fn scan_strings(&self, table: &str, column: &str) -> Result<Vec<String>, WarehouseError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kline_spec_extends_file_columns() {
        let spec = TableSpec::klines();
        assert_eq!(spec.columns.len(), KLINE_COLUMNS.len() + 2);
        assert_eq!(spec.partition_by_day.as_deref(), Some(OPEN_TIME_TS_COLUMN));
        assert!(!spec.column("open_time").unwrap().nullable);
        assert_eq!(
            spec.column(CLOSE_TIME_TS_COLUMN).unwrap().ty,
            ColumnType::Timestamp
        );
    }

    #[test]
    fn statement_reports_its_table() {
        let stmt = Statement::derive_kline_timestamps("raw_binance_klines_btcusdt");
        assert_eq!(stmt.table(), "raw_binance_klines_btcusdt");
    }
}
