//! klineflow runner — load orchestration on top of `klineflow-core`.
//!
//! This crate provides:
//! - Warehouse collaborator with a local Parquet-backed implementation
//! - Load tracking (exactly-once bookkeeping of loaded objects)
//! - Load coordinator with bounded per-symbol fan-out and rollback
//! - Multi-symbol extraction fan-out
//! - TOML pipeline configuration and the full extract-then-load cycle
//! - CSV load reports

pub mod config;
pub mod coordinator;
pub mod extract;
pub mod pipeline;
pub mod report;
pub mod tracker;
pub mod warehouse;

pub use config::{ConfigError, PipelineConfig};
pub use coordinator::{LoadCoordinator, LoadError};
pub use extract::{extract_symbols, ExtractSummary};
pub use pipeline::{CycleReport, Pipeline, SymbolStatus};
pub use report::{FileLoadFailure, LoadReport, NormalizationFailure};
pub use tracker::LoadTracker;
pub use warehouse::{
    LocalWarehouse, Statement, TableSpec, Warehouse, WarehouseError, WriteMode,
};
