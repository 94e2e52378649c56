//! Extraction loop — one sequential state machine per symbol per cycle.
//!
//! ```text
//! RESOLVING_WATERMARK -> FETCHING -> EMPTY_STOP
//!                                 -> UNDERSIZED_STOP
//!                                 -> WRITING -> ADVANCING -> FETCHING
//! ```
//!
//! Terminal stops are successes. Upstream, storage, and integrity failures
//! abort only this symbol's cycle; the next cycle re-derives the watermark
//! from storage and retries idempotently.

use crate::batch::{BatchWriter, WriteStatus};
use crate::domain::Batch;
use crate::error::{ExtractError, StorageError};
use crate::source::KlineSource;
use crate::watermark::WatermarkResolver;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// How the resume point is derived from storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResumePolicy {
    /// Latest object's decoded timestamp + 1. Uses the listing only.
    ObjectName,
    /// Latest object's `max(close_time) + 1`, read from the object itself.
    /// Falls back to `ObjectName` if the object cannot be read.
    #[default]
    TailCloseTime,
}

/// Static per-cycle extraction parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionConfig {
    pub interval: String,
    /// Requested page size; a shorter page is the trailing partial window.
    pub limit: usize,
    pub default_start_ms: i64,
    pub resume: ResumePolicy,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            interval: "1m".to_string(),
            limit: 720,
            default_start_ms: 1_609_459_200_000,
            resume: ResumePolicy::default(),
        }
    }
}

/// Why a symbol's loop stopped successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Upstream returned no records.
    Empty,
    /// Page shorter than `limit`; its object (if any) was removed.
    Undersized { path: String, discarded: bool },
    /// The next start is at or beyond "now".
    CaughtUp,
    /// The cancellation flag was raised between operations.
    Cancelled,
}

/// Result of one symbol's extraction cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionReport {
    pub symbol: String,
    /// Watermark the cycle started from.
    pub start_ms: i64,
    /// Start of the next fetch that would have been issued.
    pub next_start_ms: i64,
    pub written: Vec<String>,
    /// Batches whose object already existed.
    pub skipped: Vec<String>,
    pub stop: StopReason,
}

/// Drives resolve → fetch → write → advance for one symbol.
pub struct ExtractionLoop<'a> {
    source: &'a dyn KlineSource,
    writer: &'a BatchWriter,
    resolver: WatermarkResolver,
    config: ExtractionConfig,
}

impl<'a> ExtractionLoop<'a> {
    pub fn new(
        source: &'a dyn KlineSource,
        writer: &'a BatchWriter,
        config: ExtractionConfig,
    ) -> Self {
        Self {
            source,
            writer,
            resolver: WatermarkResolver::new(writer.codec().clone()),
            config,
        }
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    /// Compute where `symbol` resumes, from the current object listing.
    pub fn resolve_watermark(&self, symbol: &str) -> Result<i64, ExtractError> {
        let prefix = self.writer.codec().symbol_prefix(symbol);
        let paths = self
            .writer
            .store()
            .list_objects(&prefix)
            .map_err(|source| ExtractError::StorageWrite {
                path: prefix.clone(),
                source,
            })?;

        let Some((latest, bucket_ms)) = self.resolver.latest(symbol, &paths) else {
            return Ok(self.config.default_start_ms);
        };
        let by_name = bucket_ms + 1;

        if self.config.resume == ResumePolicy::ObjectName {
            return Ok(by_name);
        }

        match self.tail_close_time(&latest) {
            Ok(Some(close)) => {
                let after = close.checked_add(1).ok_or_else(|| {
                    ExtractError::integrity(
                        symbol,
                        format!("close_time {close} in {latest} has no successor"),
                    )
                })?;
                Ok(after.max(by_name))
            }
            Ok(None) => Ok(by_name),
            Err(e) => {
                warn!(
                    symbol,
                    path = %latest,
                    error = %e,
                    "cannot read tail object, resuming from its name"
                );
                Ok(by_name)
            }
        }
    }

    fn tail_close_time(&self, path: &str) -> Result<Option<i64>, StorageError> {
        let klines = self.writer.read_batch(path)?;
        Ok(klines.iter().map(|k| k.close_time).max())
    }

    /// Run the loop for `symbol` until it stops or fails.
    ///
    /// `now_ms` bounds the loop: a start at or beyond it is `CaughtUp`.
    /// `cancel` is checked before every fetch, never mid-write.
    pub fn run_symbol(
        &self,
        symbol: &str,
        now_ms: i64,
        cancel: Option<&AtomicBool>,
    ) -> Result<ExtractionReport, ExtractError> {
        let start_ms = self.resolve_watermark(symbol)?;
        info!(symbol, start_ms, source = self.source.name(), "extraction starting");

        let mut report = ExtractionReport {
            symbol: symbol.to_string(),
            start_ms,
            next_start_ms: start_ms,
            written: Vec::new(),
            skipped: Vec::new(),
            stop: StopReason::CaughtUp,
        };

        loop {
            if cancel.is_some_and(|f| f.load(Ordering::Relaxed)) {
                report.stop = StopReason::Cancelled;
                break;
            }
            if report.next_start_ms >= now_ms {
                report.stop = StopReason::CaughtUp;
                break;
            }

            let page = self.source.fetch_page(
                symbol,
                report.next_start_ms,
                &self.config.interval,
                self.config.limit,
            )?;

            let Some(batch) = Batch::new(symbol, page) else {
                report.stop = StopReason::Empty;
                break;
            };

            if batch.len() < self.config.limit {
                let path = self.writer.path_for(&batch)?;
                let discarded = self.writer.discard_undersized(&path)?;
                info!(
                    symbol,
                    rows = batch.len(),
                    limit = self.config.limit,
                    %path,
                    "undersized page, stopping until the window fills"
                );
                report.stop = StopReason::Undersized { path, discarded };
                break;
            }

            let last_close = batch.last_close_time();
            let next = match last_close.checked_add(1) {
                Some(next) if next > report.next_start_ms => next,
                _ => {
                    return Err(ExtractError::integrity(
                        symbol,
                        format!(
                            "close_time {last_close} does not advance past start {}",
                            report.next_start_ms
                        ),
                    ))
                }
            };

            let outcome = self.writer.write(&batch)?;
            match outcome.status {
                WriteStatus::Written => report.written.push(outcome.path),
                WriteStatus::AlreadyPresent => report.skipped.push(outcome.path),
            }
            report.next_start_ms = next;
        }

        info!(
            symbol,
            written = report.written.len(),
            skipped = report.skipped.len(),
            stop = ?report.stop,
            "extraction finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::kline::sample_kline;
    use crate::domain::Kline;
    use crate::path::PathCodec;
    use crate::storage::{MemoryObjectStore, ObjectStore};
    use parking_lot::Mutex;
    use std::sync::Arc;

    const MINUTE: i64 = 60_000;
    const T0: i64 = 1_710_505_800_000;

    /// Serves contiguous one-minute klines from `T0` up to `end`.
    struct Synthetic {
        end: i64,
        requests: Mutex<Vec<i64>>,
    }

    impl KlineSource for Synthetic {
        fn name(&self) -> &str {
            "synthetic"
        }

        fn fetch_page(
            &self,
            symbol: &str,
            start_ms: i64,
            _interval: &str,
            limit: usize,
        ) -> Result<Vec<Kline>, ExtractError> {
            self.requests.lock().push(start_ms);
            let first = ((start_ms - T0 + MINUTE - 1).div_euclid(MINUTE)).max(0) * MINUTE + T0;
            Ok((0..limit as i64)
                .map(|i| first + i * MINUTE)
                .take_while(|&t| t < self.end)
                .map(|t| sample_kline(symbol, t))
                .collect())
        }
    }

    fn setup(end: i64) -> (Synthetic, BatchWriter, Arc<MemoryObjectStore>) {
        let store = Arc::new(MemoryObjectStore::new("test"));
        let writer = BatchWriter::new(store.clone(), PathCodec::default());
        let source = Synthetic {
            end,
            requests: Mutex::new(Vec::new()),
        };
        (source, writer, store)
    }

    fn config(limit: usize) -> ExtractionConfig {
        ExtractionConfig {
            interval: "1m".into(),
            limit,
            default_start_ms: T0,
            resume: ResumePolicy::TailCloseTime,
        }
    }

    #[test]
    fn writes_full_pages_and_discards_trailing_partial() {
        // 25 minutes available, pages of 10: two full pages, one partial
        let (source, writer, store) = setup(T0 + 25 * MINUTE);
        let lp = ExtractionLoop::new(&source, &writer, config(10));

        let report = lp.run_symbol("BTCUSDT", T0 + 365 * 86_400_000, None).unwrap();

        assert_eq!(report.start_ms, T0);
        assert_eq!(report.written.len(), 2);
        assert!(matches!(
            report.stop,
            StopReason::Undersized { discarded: false, .. }
        ));
        assert_eq!(store.len(), 2);
        assert_eq!(report.next_start_ms, T0 + 20 * MINUTE);
    }

    #[test]
    fn second_cycle_resumes_after_tail_without_overlap() {
        let (source, writer, store) = setup(T0 + 25 * MINUTE);
        let lp = ExtractionLoop::new(&source, &writer, config(10));
        lp.run_symbol("BTCUSDT", i64::MAX, None).unwrap();

        let resumed = lp.resolve_watermark("BTCUSDT").unwrap();
        assert_eq!(resumed, T0 + 20 * MINUTE);

        let second = lp.run_symbol("BTCUSDT", i64::MAX, None).unwrap();
        assert!(second.written.is_empty());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn object_name_policy_resumes_one_ms_after_bucket() {
        let (source, writer, _store) = setup(T0 + 25 * MINUTE);
        let mut cfg = config(10);
        cfg.resume = ResumePolicy::ObjectName;
        let lp = ExtractionLoop::new(&source, &writer, cfg);
        lp.run_symbol("BTCUSDT", i64::MAX, None).unwrap();

        assert_eq!(lp.resolve_watermark("BTCUSDT").unwrap(), T0 + 10 * MINUTE + 1);
    }

    #[test]
    fn stops_when_caught_up_with_now() {
        let (source, writer, _store) = setup(T0 + 100 * MINUTE);
        let lp = ExtractionLoop::new(&source, &writer, config(10));

        let report = lp.run_symbol("BTCUSDT", T0 + 30 * MINUTE, None).unwrap();
        assert_eq!(report.stop, StopReason::CaughtUp);
        assert_eq!(report.written.len(), 3);
    }

    #[test]
    fn empty_page_stops_cleanly() {
        let (source, writer, store) = setup(T0);
        let lp = ExtractionLoop::new(&source, &writer, config(10));

        let report = lp.run_symbol("BTCUSDT", i64::MAX, None).unwrap();
        assert_eq!(report.stop, StopReason::Empty);
        assert!(store.is_empty());
    }

    #[test]
    fn raised_cancel_flag_stops_before_fetching() {
        let (source, writer, _store) = setup(T0 + 100 * MINUTE);
        let lp = ExtractionLoop::new(&source, &writer, config(10));
        let cancel = AtomicBool::new(true);

        let report = lp.run_symbol("BTCUSDT", i64::MAX, Some(&cancel)).unwrap();
        assert_eq!(report.stop, StopReason::Cancelled);
        assert!(source.requests.lock().is_empty());
    }

    /// Ignores the requested start and always serves the same full page.
    struct Stuck;

    impl KlineSource for Stuck {
        fn name(&self) -> &str {
            "stuck"
        }

        fn fetch_page(
            &self,
            symbol: &str,
            _start_ms: i64,
            _interval: &str,
            limit: usize,
        ) -> Result<Vec<Kline>, ExtractError> {
            Ok((0..limit as i64)
                .map(|i| sample_kline(symbol, T0 + i * MINUTE))
                .collect())
        }
    }

    #[test]
    fn page_that_does_not_advance_is_integrity_error() {
        let (_, writer, store) = setup(T0);
        let lp = ExtractionLoop::new(&Stuck, &writer, config(10));

        let err = lp.run_symbol("BTCUSDT", i64::MAX, None).unwrap_err();
        assert!(matches!(err, ExtractError::DataIntegrity { .. }));
        // the repeated page is rejected before it reaches storage
        assert_eq!(store.len(), 1);
    }

    /// One full page whose last close time is the largest representable.
    struct EndOfTime;

    impl KlineSource for EndOfTime {
        fn name(&self) -> &str {
            "end-of-time"
        }

        fn fetch_page(
            &self,
            symbol: &str,
            start_ms: i64,
            _interval: &str,
            _limit: usize,
        ) -> Result<Vec<Kline>, ExtractError> {
            let mut kline = sample_kline(symbol, start_ms);
            kline.close_time = i64::MAX;
            Ok(vec![kline])
        }
    }

    #[test]
    fn close_time_without_successor_is_integrity_error() {
        let (_, writer, store) = setup(T0);
        let lp = ExtractionLoop::new(&EndOfTime, &writer, config(1));

        let err = lp.run_symbol("BTCUSDT", i64::MAX, None).unwrap_err();
        assert!(matches!(err, ExtractError::DataIntegrity { .. }));
        assert!(store.is_empty());
    }

    #[test]
    fn stored_close_time_without_successor_is_integrity_error() {
        let (source, writer, store) = setup(T0);
        let path = PathCodec::default().encode("BTCUSDT", T0).unwrap();
        let mut kline = sample_kline("BTCUSDT", T0);
        kline.close_time = i64::MAX;
        let bytes = crate::columnar::encode_klines(&[kline]).unwrap();
        store.put_object(&path, &bytes).unwrap();

        let lp = ExtractionLoop::new(&source, &writer, config(10));
        let err = lp.resolve_watermark("BTCUSDT").unwrap_err();
        assert!(matches!(err, ExtractError::DataIntegrity { .. }));
    }

    #[test]
    fn tail_refinement_reads_close_time_from_object() {
        let (source, writer, store) = setup(T0);
        let path = PathCodec::default().encode("BTCUSDT", T0).unwrap();
        let bytes = crate::columnar::encode_klines(&[sample_kline("BTCUSDT", T0)]).unwrap();
        store.put_object(&path, &bytes).unwrap();

        let lp = ExtractionLoop::new(&source, &writer, config(10));
        assert_eq!(lp.resolve_watermark("BTCUSDT").unwrap(), T0 + MINUTE);
    }

    #[test]
    fn unreadable_tail_falls_back_to_name() {
        let (source, writer, store) = setup(T0);
        let path = PathCodec::default().encode("BTCUSDT", T0).unwrap();
        store.put_object(&path, b"not parquet").unwrap();

        let lp = ExtractionLoop::new(&source, &writer, config(10));
        assert_eq!(lp.resolve_watermark("BTCUSDT").unwrap(), T0 + 1);
    }
}
