//! klineflow core — incremental kline extraction into partitioned object storage.
//!
//! This crate contains the extraction half of the pipeline:
//! - Domain types (klines and batches)
//! - Deterministic object path codec, which doubles as the resumption index
//! - Watermark resolution from object listings (no side cursor)
//! - Binance REST source with a bounded retry policy
//! - Object storage collaborator with local and in-memory stores
//! - Parquet encoding and the batch writer
//! - The per-symbol extraction loop

pub mod batch;
pub mod columnar;
pub mod domain;
pub mod error;
pub mod extract;
pub mod path;
pub mod source;
pub mod storage;
pub mod watermark;

pub use batch::{BatchWriter, WriteOutcome, WriteStatus};
pub use domain::{Batch, Kline};
pub use error::{ExtractError, PathError, SourceError, StorageError};
pub use extract::{ExtractionConfig, ExtractionLoop, ExtractionReport, ResumePolicy, StopReason};
pub use path::{DecodedPath, PathCodec};
pub use source::{BinanceSource, KlineSource, ReqwestTransport, RetryPolicy};
pub use storage::{LocalObjectStore, MemoryObjectStore, ObjectStore, ObjectUri};
pub use watermark::WatermarkResolver;

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
