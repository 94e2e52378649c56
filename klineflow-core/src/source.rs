//! Binance klines REST source.
//!
//! Fetches one page of klines per call with a bounded retry policy. Any
//! transport error or non-200 response is retried with a fixed delay;
//! running out of attempts fails the symbol's cycle with
//! `ExtractError::UpstreamUnavailable`. An empty array is not an error: it is
//! the normal end-of-data signal.
//!
//! The HTTP transport and the sleep between attempts are injected, so retry
//! behaviour is testable without a network or real delays.

use crate::domain::Kline;
use crate::error::{ExtractError, SourceError};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_BASE_URL: &str = "https://api.binance.com/api/v3/klines";

/// Raw HTTP reply: status code and body text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

/// Minimal blocking GET transport.
pub trait HttpTransport: Send + Sync {
    fn get(&self, url: &str, query: &[(&str, String)]) -> Result<HttpReply, SourceError>;
}

/// `reqwest` blocking client with a per-request timeout.
pub struct ReqwestTransport {
    client: reqwest::blocking::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, SourceError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("klineflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SourceError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

impl HttpTransport for ReqwestTransport {
    fn get(&self, url: &str, query: &[(&str, String)]) -> Result<HttpReply, SourceError> {
        let resp = self
            .client
            .get(url)
            .query(query)
            .send()
            .map_err(|e| SourceError::Transport(e.to_string()))?;
        let status = resp.status().as_u16();
        let body = resp
            .text()
            .map_err(|e| SourceError::Transport(format!("reading body: {e}")))?;
        Ok(HttpReply { status, body })
    }
}

/// Blocks the current thread between retry attempts.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, delay: Duration);
}

/// `std::thread::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, delay: Duration) {
        std::thread::sleep(delay);
    }
}

/// Bounded retry: at most `max_attempts` requests, `delay` between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(10),
        }
    }
}

/// Trait for kline sources.
///
/// Implementations return at most `limit` records ordered by `open_time`,
/// starting at or after `start_ms`.
pub trait KlineSource: Send + Sync {
    /// Human-readable name of this source.
    fn name(&self) -> &str;

    fn fetch_page(
        &self,
        symbol: &str,
        start_ms: i64,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Kline>, ExtractError>;
}

/// Binance `GET /api/v3/klines` source.
pub struct BinanceSource<T: HttpTransport = ReqwestTransport> {
    base_url: String,
    transport: T,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl BinanceSource<ReqwestTransport> {
    /// Source over a real HTTP client.
    pub fn with_timeout(
        base_url: impl Into<String>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, SourceError> {
        Ok(Self::new(base_url, ReqwestTransport::new(timeout)?, retry))
    }
}

impl<T: HttpTransport> BinanceSource<T> {
    pub fn new(base_url: impl Into<String>, transport: T, retry: RetryPolicy) -> Self {
        Self {
            base_url: base_url.into(),
            transport,
            retry,
            sleeper: Arc::new(ThreadSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// GET with retry. Returns the body of the first 200 response.
    fn get_with_retry(
        &self,
        symbol: &str,
        query: &[(&str, String)],
    ) -> Result<String, ExtractError> {
        let attempts = self.retry.max_attempts.max(1);
        let mut last_error = SourceError::Transport("no attempt made".into());

        for attempt in 1..=attempts {
            if attempt > 1 {
                self.sleeper.sleep(self.retry.delay);
            }

            match self.transport.get(&self.base_url, query) {
                Ok(reply) if reply.status == 200 => return Ok(reply.body),
                Ok(reply) => {
                    warn!(
                        symbol,
                        attempt,
                        status = reply.status,
                        body = %truncate(&reply.body, 200),
                        "upstream returned non-success status"
                    );
                    last_error = SourceError::Status {
                        status: reply.status,
                        body: truncate(&reply.body, 200),
                    };
                }
                Err(e) => {
                    warn!(symbol, attempt, error = %e, "upstream request failed");
                    last_error = e;
                }
            }
        }

        Err(ExtractError::UpstreamUnavailable {
            symbol: symbol.to_string(),
            attempts,
            last: last_error,
        })
    }
}

impl<T: HttpTransport> KlineSource for BinanceSource<T> {
    fn name(&self) -> &str {
        "binance"
    }

    fn fetch_page(
        &self,
        symbol: &str,
        start_ms: i64,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Kline>, ExtractError> {
        let query = [
            ("symbol", symbol.to_string()),
            ("interval", interval.to_string()),
            ("limit", limit.to_string()),
            ("startTime", start_ms.to_string()),
        ];
        let body = self.get_with_retry(symbol, &query)?;
        let klines = parse_page(symbol, &body)?;
        debug!(symbol, start_ms, count = klines.len(), "klines page fetched");
        Ok(klines)
    }
}

/// Parse a klines response body.
///
/// Each element is a fixed-position array:
///   [0] open_time, [1] open, [2] high, [3] low, [4] close, [5] volume,
///   [6] close_time, [7] quote_asset_volume, [8] number_of_trades,
///   [9] taker_buy_base_volume, [10] taker_buy_quote_volume, [11] ignored
pub fn parse_page(symbol: &str, body: &str) -> Result<Vec<Kline>, ExtractError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| ExtractError::integrity(symbol, format!("response is not JSON: {e}")))?;
    let rows = value
        .as_array()
        .ok_or_else(|| ExtractError::integrity(symbol, "response is not an array"))?;

    let mut klines: Vec<Kline> = Vec::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        let kline = parse_row(symbol, row)
            .map_err(|detail| ExtractError::integrity(symbol, format!("row {i}: {detail}")))?;

        if !kline.is_well_formed() {
            return Err(ExtractError::integrity(
                symbol,
                format!(
                    "row {i}: open_time {} is not before close_time {}",
                    kline.open_time, kline.close_time
                ),
            ));
        }
        if let Some(prev) = klines.last() {
            if kline.open_time <= prev.close_time {
                return Err(ExtractError::integrity(
                    symbol,
                    format!(
                        "row {i}: open_time {} overlaps previous close_time {}",
                        kline.open_time, prev.close_time
                    ),
                ));
            }
        }
        klines.push(kline);
    }

    Ok(klines)
}

fn parse_row(symbol: &str, row: &Value) -> Result<Kline, String> {
    let fields = row.as_array().ok_or("kline entry is not an array")?;
    if fields.len() < 11 {
        return Err(format!("expected at least 11 fields, found {}", fields.len()));
    }

    Ok(Kline {
        symbol: symbol.to_string(),
        open_time: integer(&fields[0], "open_time")?,
        open_price: decimal(&fields[1], "open")?,
        high_price: decimal(&fields[2], "high")?,
        low_price: decimal(&fields[3], "low")?,
        close_price: decimal(&fields[4], "close")?,
        volume: decimal(&fields[5], "volume")?,
        close_time: integer(&fields[6], "close_time")?,
        quote_asset_volume: decimal(&fields[7], "quote_asset_volume")?,
        number_of_trades: integer(&fields[8], "number_of_trades")?,
        taker_buy_base_asset_volume: decimal(&fields[9], "taker_buy_base_volume")?,
        taker_buy_quote_asset_volume: decimal(&fields[10], "taker_buy_quote_volume")?,
    })
}

fn integer(v: &Value, name: &str) -> Result<i64, String> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
    .ok_or_else(|| format!("{name} is missing or not an integer: {v}"))
}

fn decimal(v: &Value, name: &str) -> Result<f64, String> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
    .filter(|x: &f64| x.is_finite())
    .ok_or_else(|| format!("{name} is missing or not a decimal: {v}"))
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Transport that replays a fixed script of replies.
    struct Scripted {
        replies: Mutex<VecDeque<Result<HttpReply, SourceError>>>,
        calls: Mutex<Vec<Vec<(String, String)>>>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<HttpReply, SourceError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl HttpTransport for Scripted {
        fn get(&self, _url: &str, query: &[(&str, String)]) -> Result<HttpReply, SourceError> {
            self.calls
                .lock()
                .push(query.iter().map(|(k, v)| (k.to_string(), v.clone())).collect());
            self.replies
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(SourceError::Transport("script exhausted".into())))
        }
    }

    #[derive(Default)]
    struct RecordingSleeper(Mutex<Vec<Duration>>);

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, delay: Duration) {
            self.0.lock().push(delay);
        }
    }

    fn ok(body: &str) -> Result<HttpReply, SourceError> {
        Ok(HttpReply {
            status: 200,
            body: body.to_string(),
        })
    }

    fn status(code: u16) -> Result<HttpReply, SourceError> {
        Ok(HttpReply {
            status: code,
            body: "{\"code\":-1003,\"msg\":\"Too many requests\"}".to_string(),
        })
    }

    const TWO_ROWS: &str = r#"[
        [1710505800000,"42000.50","42100.00","41950.25","42050.00","12.5",1710505859999,"525000.0",310,"6.25","262500.0","0"],
        [1710505860000,"42050.00","42080.00","42000.00","42010.00","8.0",1710505919999,"336000.0",190,"4.0","168000.0","0"]
    ]"#;

    fn source(
        replies: Vec<Result<HttpReply, SourceError>>,
    ) -> (BinanceSource<Scripted>, Arc<RecordingSleeper>) {
        let sleeper = Arc::new(RecordingSleeper::default());
        let src = BinanceSource::new(
            DEFAULT_BASE_URL,
            Scripted::new(replies),
            RetryPolicy {
                max_attempts: 3,
                delay: Duration::from_secs(10),
            },
        )
        .with_sleeper(sleeper.clone());
        (src, sleeper)
    }

    #[test]
    fn parses_fixed_position_rows() {
        let klines = parse_page("BTCUSDT", TWO_ROWS).unwrap();
        assert_eq!(klines.len(), 2);
        assert_eq!(klines[0].symbol, "BTCUSDT");
        assert_eq!(klines[0].open_time, 1_710_505_800_000);
        assert_eq!(klines[0].close_time, 1_710_505_859_999);
        assert_eq!(klines[0].open_price, 42_000.5);
        assert_eq!(klines[0].number_of_trades, 310);
        assert_eq!(klines[1].taker_buy_quote_asset_volume, 168_000.0);
    }

    #[test]
    fn empty_array_is_an_empty_page() {
        assert!(parse_page("BTCUSDT", "[]").unwrap().is_empty());
    }

    #[test]
    fn missing_close_time_is_integrity_error() {
        let body = r#"[[1710505800000,"1","1","1","1","1",null,"1",1,"1","1","0"]]"#;
        let err = parse_page("BTCUSDT", body).unwrap_err();
        assert!(matches!(err, ExtractError::DataIntegrity { .. }));
        assert!(err.to_string().contains("close_time"));
    }

    #[test]
    fn overlapping_rows_are_integrity_error() {
        let body = r#"[
            [1000,"1","1","1","1","1",1999,"1",1,"1","1","0"],
            [1500,"1","1","1","1","1",2499,"1",1,"1","1","0"]
        ]"#;
        assert!(matches!(
            parse_page("BTCUSDT", body),
            Err(ExtractError::DataIntegrity { .. })
        ));
    }

    #[test]
    fn inverted_period_is_integrity_error() {
        let body = r#"[[2000,"1","1","1","1","1",1000,"1",1,"1","1","0"]]"#;
        assert!(matches!(
            parse_page("BTCUSDT", body),
            Err(ExtractError::DataIntegrity { .. })
        ));
    }

    #[test]
    fn sends_expected_query_parameters() {
        let (src, _) = source(vec![ok("[]")]);
        src.fetch_page("ETHUSDT", 1_609_459_200_000, "1m", 720).unwrap();

        let calls = src.transport.calls.lock();
        assert_eq!(
            calls[0],
            vec![
                ("symbol".to_string(), "ETHUSDT".to_string()),
                ("interval".to_string(), "1m".to_string()),
                ("limit".to_string(), "720".to_string()),
                ("startTime".to_string(), "1609459200000".to_string()),
            ]
        );
    }

    #[test]
    fn retries_until_success() {
        let (src, sleeper) = source(vec![
            status(429),
            Err(SourceError::Transport("connection reset".into())),
            ok(TWO_ROWS),
        ]);
        let klines = src.fetch_page("BTCUSDT", 0, "1m", 720).unwrap();

        assert_eq!(klines.len(), 2);
        assert_eq!(*sleeper.0.lock(), vec![Duration::from_secs(10); 2]);
    }

    #[test]
    fn exhausted_retries_are_upstream_unavailable() {
        let (src, sleeper) = source(vec![status(500), status(502), status(503), ok("[]")]);
        let err = src.fetch_page("BTCUSDT", 0, "1m", 720).unwrap_err();

        match err {
            ExtractError::UpstreamUnavailable {
                symbol,
                attempts,
                last,
            } => {
                assert_eq!(symbol, "BTCUSDT");
                assert_eq!(attempts, 3);
                assert!(matches!(last, SourceError::Status { status: 503, .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        // the fourth scripted reply is never requested
        assert_eq!(src.transport.calls.lock().len(), 3);
        assert_eq!(sleeper.0.lock().len(), 2);
    }

    #[test]
    fn malformed_success_body_is_not_retried() {
        let (src, _) = source(vec![ok("{\"unexpected\":true}"), ok("[]")]);
        assert!(matches!(
            src.fetch_page("BTCUSDT", 0, "1m", 720),
            Err(ExtractError::DataIntegrity { .. })
        ));
        assert_eq!(src.transport.calls.lock().len(), 1);
    }
}
