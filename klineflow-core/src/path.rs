//! Object path codec — bidirectional mapping between (symbol, timestamp) and
//! the storage key a batch is written under.
//!
//! Layout:
//! `{prefix}/{SYMBOL}/{yyyy}/M{mm}/{SYMBOL}_klines_{yyyy}-{mm}-{dd}-{HH}{MM}.parquet`
//!
//! The key is a pure function of its inputs, so two independent runs over the
//! same page produce the same key. Only minute resolution survives the round
//! trip; seconds and milliseconds are dropped on encode.

use crate::error::PathError;
use chrono::{DateTime, Datelike, NaiveDate, Timelike};

pub const DEFAULT_PREFIX: &str = "binance_klines";

const MS_PER_MINUTE: i64 = 60_000;
const EXTENSION: &str = ".parquet";

/// Symbol and timestamp recovered from a well-formed object path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPath {
    pub symbol: String,
    /// Minute-aligned epoch milliseconds.
    pub timestamp_ms: i64,
}

/// Encodes and decodes object paths under a fixed dataset prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathCodec {
    prefix: String,
}

impl Default for PathCodec {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl PathCodec {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix: String = prefix.into();
        Self {
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    /// Listing prefix covering every symbol: `{prefix}/`.
    pub fn dataset_prefix(&self) -> String {
        if self.prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.prefix)
        }
    }

    /// Listing prefix for one symbol: `{prefix}/{SYMBOL}/`.
    pub fn symbol_prefix(&self, symbol: &str) -> String {
        format!("{}{symbol}/", self.dataset_prefix())
    }

    /// Build the object path for `symbol` at `timestamp_ms` (UTC).
    ///
    /// Timestamps before the epoch or past year 9999 are rejected.
    pub fn encode(&self, symbol: &str, timestamp_ms: i64) -> Result<String, PathError> {
        if !is_valid_symbol(symbol) {
            return Err(PathError::malformed(
                symbol,
                "symbol must be non-empty ASCII alphanumeric",
            ));
        }
        let dt = Some(timestamp_ms)
            .filter(|&ms| ms >= 0)
            .and_then(DateTime::from_timestamp_millis)
            .filter(|dt| dt.year() <= 9999)
            .ok_or(PathError::TimestampOutOfRange { timestamp_ms })?;

        let (year, month, day) = (dt.year(), dt.month(), dt.day());
        let (hour, minute) = (dt.hour(), dt.minute());

        Ok(format!(
            "{}{symbol}/{year:04}/M{month:02}/{symbol}_klines_{year:04}-{month:02}-{day:02}-{hour:02}{minute:02}{EXTENSION}",
            self.dataset_prefix()
        ))
    }

    /// Recover `(symbol, minute-aligned timestamp)` from an object path.
    pub fn decode(&self, path: &str) -> Result<DecodedPath, PathError> {
        let rest = path
            .strip_prefix(self.dataset_prefix().as_str())
            .ok_or_else(|| {
                PathError::malformed(path, format!("outside prefix '{}'", self.prefix))
            })?;

        let segments: Vec<&str> = rest.split('/').collect();
        let [symbol, year_dir, month_dir, file_name] = segments.as_slice() else {
            return Err(PathError::malformed(
                path,
                format!("expected 4 segments after prefix, found {}", segments.len()),
            ));
        };

        if !is_valid_symbol(symbol) {
            return Err(PathError::malformed(path, "invalid symbol directory"));
        }
        let dir_year = parse_fixed(year_dir, 4)
            .ok_or_else(|| PathError::malformed(path, "year directory must be 4 digits"))?;
        let dir_month = month_dir
            .strip_prefix('M')
            .and_then(|m| parse_fixed(m, 2))
            .ok_or_else(|| PathError::malformed(path, "month directory must be M + 2 digits"))?;

        let stamp = file_name
            .strip_suffix(EXTENSION)
            .ok_or_else(|| PathError::malformed(path, "missing .parquet extension"))?
            .strip_prefix(&format!("{symbol}_klines_"))
            .ok_or_else(|| {
                PathError::malformed(path, "file name does not match symbol directory")
            })?;

        let (year, month, day, hour, minute) = parse_stamp(stamp)
            .ok_or_else(|| PathError::malformed(path, "timestamp must be yyyy-mm-dd-HHMM"))?;

        if year != dir_year || month != dir_month {
            return Err(PathError::malformed(
                path,
                "file timestamp disagrees with year/month directories",
            ));
        }

        let timestamp_ms = NaiveDate::from_ymd_opt(year as i32, month, day)
            .and_then(|d| d.and_hms_opt(hour, minute, 0))
            .map(|dt| dt.and_utc().timestamp_millis())
            .ok_or_else(|| PathError::malformed(path, "not a calendar date/time"))?;
        if timestamp_ms < 0 {
            return Err(PathError::malformed(path, "timestamp is before the epoch"));
        }

        Ok(DecodedPath {
            symbol: symbol.to_string(),
            timestamp_ms,
        })
    }

    /// Decode and keep only paths that belong to `symbol`.
    pub fn decode_for(&self, symbol: &str, path: &str) -> Option<i64> {
        self.decode(path)
            .ok()
            .filter(|d| d.symbol == symbol)
            .map(|d| d.timestamp_ms)
    }
}

/// Drop everything below minute resolution.
pub fn truncate_to_minute(timestamp_ms: i64) -> i64 {
    timestamp_ms.div_euclid(MS_PER_MINUTE) * MS_PER_MINUTE
}

/// Exchange symbols are ASCII alphanumeric (e.g. `BTCUSDT`, `1INCHUSDT`).
pub fn is_valid_symbol(symbol: &str) -> bool {
    !symbol.is_empty() && symbol.bytes().all(|b| b.is_ascii_alphanumeric())
}

fn parse_fixed(s: &str, width: usize) -> Option<u32> {
    if s.len() != width || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// `yyyy-mm-dd-HHMM`
fn parse_stamp(stamp: &str) -> Option<(u32, u32, u32, u32, u32)> {
    let mut parts = stamp.split('-');
    let year = parse_fixed(parts.next()?, 4)?;
    let month = parse_fixed(parts.next()?, 2)?;
    let day = parse_fixed(parts.next()?, 2)?;
    let hhmm = parts.next()?;
    if parts.next().is_some() || hhmm.len() != 4 {
        return None;
    }
    let hour = parse_fixed(hhmm.get(..2)?, 2)?;
    let minute = parse_fixed(hhmm.get(2..)?, 2)?;
    Some((year, month, day, hour, minute))
}
