//! Kline — one candlestick record, and the batch it is persisted in.

use serde::{Deserialize, Serialize};

/// One OHLCV candlestick for a fixed interval.
///
/// `open_time` and `close_time` are inclusive epoch milliseconds. Price and
/// volume fields are decimal strings upstream and are parsed into `f64`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub symbol: String,
    pub open_time: i64,
    pub close_time: i64,
    pub open_price: f64,
    pub high_price: f64,
    pub low_price: f64,
    pub close_price: f64,
    pub volume: f64,
    pub quote_asset_volume: f64,
    pub number_of_trades: i64,
    pub taker_buy_base_asset_volume: f64,
    pub taker_buy_quote_asset_volume: f64,
}

impl Kline {
    /// The period must be non-empty: `open_time < close_time`.
    pub fn is_well_formed(&self) -> bool {
        self.open_time < self.close_time
    }
}

/// An ordered page of klines for one symbol, written to exactly one object.
///
/// Constructed only from a non-empty page; the bucket timestamp is the
/// first record's `open_time` and names the object.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    symbol: String,
    klines: Vec<Kline>,
}

impl Batch {
    /// Returns `None` for an empty page.
    pub fn new(symbol: impl Into<String>, klines: Vec<Kline>) -> Option<Self> {
        if klines.is_empty() {
            return None;
        }
        Some(Self {
            symbol: symbol.into(),
            klines,
        })
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn klines(&self) -> &[Kline] {
        &self.klines
    }

    pub fn len(&self) -> usize {
        self.klines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.klines.is_empty()
    }

    /// Timestamp used to name and partition the batch.
    pub fn bucket_timestamp(&self) -> i64 {
        self.klines[0].open_time
    }

    /// `close_time` of the last record in the page.
    pub fn last_close_time(&self) -> i64 {
        self.klines[self.klines.len() - 1].close_time
    }
}

#[cfg(test)]
pub(crate) fn sample_kline(symbol: &str, open_time: i64) -> Kline {
    Kline {
        symbol: symbol.to_string(),
        open_time,
        close_time: open_time + 59_999,
        open_price: 42_000.5,
        high_price: 42_100.0,
        low_price: 41_950.25,
        close_price: 42_050.0,
        volume: 12.5,
        quote_asset_volume: 525_000.0,
        number_of_trades: 310,
        taker_buy_base_asset_volume: 6.25,
        taker_buy_quote_asset_volume: 262_500.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_page_is_not_a_batch() {
        assert!(Batch::new("BTCUSDT", Vec::new()).is_none());
    }

    #[test]
    fn batch_bucket_is_first_open_time() {
        let klines = vec![
            sample_kline("BTCUSDT", 1_710_505_800_000),
            sample_kline("BTCUSDT", 1_710_505_860_000),
        ];
        let batch = Batch::new("BTCUSDT", klines).unwrap();
        assert_eq!(batch.bucket_timestamp(), 1_710_505_800_000);
        assert_eq!(batch.last_close_time(), 1_710_505_919_999);
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn kline_requires_open_before_close() {
        let mut k = sample_kline("BTCUSDT", 0);
        assert!(k.is_well_formed());
        k.close_time = k.open_time;
        assert!(!k.is_well_formed());
    }
}
