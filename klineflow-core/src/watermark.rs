//! Watermark resolution — where extraction resumes for a symbol.
//!
//! There is no persisted cursor. The watermark is recomputed every cycle from
//! the object listing, so a crash between writing a batch and advancing any
//! position cannot leave a gap: the next run re-derives the same value from
//! what is durably in storage.

use crate::path::PathCodec;

/// Resolves the resume timestamp for a symbol from storage object paths.
#[derive(Debug, Clone, Default)]
pub struct WatermarkResolver {
    codec: PathCodec,
}

impl WatermarkResolver {
    pub fn new(codec: PathCodec) -> Self {
        Self { codec }
    }

    pub fn codec(&self) -> &PathCodec {
        &self.codec
    }

    /// The most recent object for `symbol` and its decoded timestamp.
    ///
    /// Paths that do not decode, or decode to another symbol, are ignored.
    /// Ties on timestamp fall back to path ordering, which agrees with time
    /// ordering under the fixed-width layout.
    pub fn latest<'a, I>(&self, symbol: &str, paths: I) -> Option<(String, i64)>
    where
        I: IntoIterator<Item = &'a String>,
    {
        paths
            .into_iter()
            .filter_map(|p| self.codec.decode_for(symbol, p).map(|ts| (ts, p)))
            .max_by(|(ts_a, p_a), (ts_b, p_b)| ts_a.cmp(ts_b).then_with(|| p_a.cmp(p_b)))
            .map(|(ts, p)| (p.clone(), ts))
    }

    /// Resume timestamp: latest decoded timestamp + 1, or `default_start_ms`
    /// when the symbol has no objects yet.
    pub fn resolve<'a, I>(&self, symbol: &str, paths: I, default_start_ms: i64) -> i64
    where
        I: IntoIterator<Item = &'a String>,
    {
        match self.latest(symbol, paths) {
            Some((_, ts)) => ts + 1,
            None => default_start_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULT_START: i64 = 1_609_459_200_000; // 2021-01-01T00:00Z
    const MAR_15_1230: i64 = 1_710_505_800_000;

    fn resolver() -> WatermarkResolver {
        WatermarkResolver::new(PathCodec::default())
    }

    #[test]
    fn empty_listing_uses_default_start() {
        let paths: Vec<String> = Vec::new();
        assert_eq!(resolver().resolve("ABCXYZ", &paths, DEFAULT_START), DEFAULT_START);
    }

    #[test]
    fn single_object_resumes_one_ms_after_its_bucket() {
        let paths = vec![
            "binance_klines/ABCXYZ/2024/M03/ABCXYZ_klines_2024-03-15-1230.parquet".to_string(),
        ];
        assert_eq!(
            resolver().resolve("ABCXYZ", &paths, DEFAULT_START),
            MAR_15_1230 + 1
        );
    }

    #[test]
    fn picks_latest_regardless_of_listing_order() {
        let codec = PathCodec::default();
        let paths = vec![
            codec.encode("BTCUSDT", MAR_15_1230).unwrap(),
            codec.encode("BTCUSDT", MAR_15_1230 + 86_400_000 * 40).unwrap(),
            codec.encode("BTCUSDT", MAR_15_1230 - 86_400_000).unwrap(),
        ];
        let (latest, ts) = resolver().latest("BTCUSDT", &paths).unwrap();
        assert_eq!(latest, paths[1]);
        assert_eq!(ts, MAR_15_1230 + 86_400_000 * 40);
    }

    #[test]
    fn ignores_foreign_and_malformed_objects() {
        let codec = PathCodec::default();
        let paths = vec![
            codec.encode("ETHUSDT", MAR_15_1230 + 3_600_000).unwrap(),
            "binance_klines/BTCUSDT/2024/M03/notes.txt".to_string(),
            "binance_klines/BTCUSDT/2025/M01/binance_klines_BTCUSDT_2025-01-01-0000.parquet"
                .to_string(),
            codec.encode("BTCUSDT", MAR_15_1230).unwrap(),
        ];
        assert_eq!(
            resolver().resolve("BTCUSDT", &paths, DEFAULT_START),
            MAR_15_1230 + 1
        );
    }

    #[test]
    fn only_malformed_objects_fall_back_to_default() {
        let paths = vec!["binance_klines/BTCUSDT/readme.md".to_string()];
        assert_eq!(resolver().resolve("BTCUSDT", &paths, DEFAULT_START), DEFAULT_START);
    }
}
