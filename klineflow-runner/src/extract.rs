//! Multi-symbol extraction — one independent loop per symbol.
//!
//! Symbols share no mutable state: each loop only touches objects under its
//! own symbol prefix. A failing symbol is recorded in the summary and never
//! stops or delays the others.

use klineflow_core::{ExtractError, ExtractionLoop, ExtractionReport};
use rayon::prelude::*;
use std::sync::atomic::AtomicBool;
use tracing::error;

/// Outcome of extracting a set of symbols.
#[derive(Debug, Default)]
pub struct ExtractSummary {
    pub total: usize,
    /// Reports of symbols whose cycle finished, in input order.
    pub reports: Vec<ExtractionReport>,
    /// Symbols whose cycle failed, in input order.
    pub errors: Vec<(String, ExtractError)>,
}

impl ExtractSummary {
    pub fn succeeded(&self) -> usize {
        self.reports.len()
    }

    pub fn failed(&self) -> usize {
        self.errors.len()
    }

    pub fn all_succeeded(&self) -> bool {
        self.errors.is_empty()
    }

    /// Objects written across all symbols.
    pub fn written(&self) -> usize {
        self.reports.iter().map(|r| r.written.len()).sum()
    }
}

/// Run `extraction` for every symbol on a pool of `workers` threads.
pub fn extract_symbols(
    extraction: &ExtractionLoop<'_>,
    symbols: &[String],
    workers: usize,
    now_ms: i64,
    cancel: Option<&AtomicBool>,
) -> Result<ExtractSummary, rayon::ThreadPoolBuildError> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .build()?;

    let results: Vec<(String, Result<ExtractionReport, ExtractError>)> = pool.install(|| {
        symbols
            .par_iter()
            .map(|symbol| (symbol.clone(), extraction.run_symbol(symbol, now_ms, cancel)))
            .collect()
    });

    let mut summary = ExtractSummary {
        total: symbols.len(),
        ..ExtractSummary::default()
    };
    for (symbol, result) in results {
        match result {
            Ok(report) => summary.reports.push(report),
            Err(e) => {
                error!(%symbol, error = %e, "extraction cycle failed");
                summary.errors.push((symbol, e));
            }
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use klineflow_core::{
        BatchWriter, ExtractionConfig, Kline, KlineSource, MemoryObjectStore, PathCodec,
        ResumePolicy, SourceError, StopReason,
    };
    use std::sync::Arc;

    const T0: i64 = 1_710_505_800_000;
    const MINUTE: i64 = 60_000;

    /// Serves three full pages for every symbol except `BROKEN`.
    struct ThreePages;

    impl KlineSource for ThreePages {
        fn name(&self) -> &str {
            "three-pages"
        }

        fn fetch_page(
            &self,
            symbol: &str,
            start_ms: i64,
            _interval: &str,
            limit: usize,
        ) -> Result<Vec<Kline>, ExtractError> {
            if symbol == "BROKEN" {
                return Err(ExtractError::UpstreamUnavailable {
                    symbol: symbol.into(),
                    attempts: 3,
                    last: SourceError::Transport("connection refused".into()),
                });
            }
            let end = T0 + 3 * limit as i64 * MINUTE;
            Ok((0..limit as i64)
                .map(|i| start_ms + i * MINUTE)
                .filter(|&t| t < end)
                .map(|open_time| Kline {
                    symbol: symbol.into(),
                    open_time,
                    close_time: open_time + MINUTE - 1,
                    open_price: 1.0,
                    high_price: 1.0,
                    low_price: 1.0,
                    close_price: 1.0,
                    volume: 1.0,
                    quote_asset_volume: 1.0,
                    number_of_trades: 1,
                    taker_buy_base_asset_volume: 1.0,
                    taker_buy_quote_asset_volume: 1.0,
                })
                .collect())
        }
    }

    #[test]
    fn failing_symbol_does_not_affect_others() {
        let store = Arc::new(MemoryObjectStore::new("klines"));
        let writer = BatchWriter::new(store.clone(), PathCodec::default());
        let config = ExtractionConfig {
            interval: "1m".into(),
            limit: 5,
            default_start_ms: T0,
            resume: ResumePolicy::TailCloseTime,
        };
        let extraction = ExtractionLoop::new(&ThreePages, &writer, config);
        let symbols: Vec<String> = ["BTCUSDT", "BROKEN", "ETHUSDT"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let summary = extract_symbols(&extraction, &symbols, 2, i64::MAX, None).unwrap();

        assert_eq!(summary.total, 3);
        assert_eq!(summary.succeeded(), 2);
        assert_eq!(summary.failed(), 1);
        assert_eq!(summary.errors[0].0, "BROKEN");
        assert_eq!(summary.written(), 6);
        assert!(summary.reports.iter().all(|r| r.stop == StopReason::Empty));
        assert_eq!(store.len(), 6);
    }
}
