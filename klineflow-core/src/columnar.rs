//! Parquet encoding of kline pages.
//!
//! One batch becomes one Parquet file with a fixed column set. The same
//! columns (plus derived timestamp columns) make up the warehouse table.

use crate::domain::Kline;
use crate::error::StorageError;
use polars::prelude::*;
use std::io::{Cursor, Write};

/// Column names, in file order.
pub const KLINE_COLUMNS: [&str; 12] = [
    "symbol",
    "open_time",
    "close_time",
    "open_price",
    "high_price",
    "low_price",
    "close_price",
    "volume",
    "quote_asset_volume",
    "number_of_trades",
    "taker_buy_base_asset_volume",
    "taker_buy_quote_asset_volume",
];

/// Convert klines to a Polars DataFrame.
pub fn klines_to_dataframe(klines: &[Kline]) -> Result<DataFrame, StorageError> {
    let f64_col = |name: &str, get: fn(&Kline) -> f64| {
        Column::new(name.into(), klines.iter().map(get).collect::<Vec<f64>>())
    };

    DataFrame::new(vec![
        Column::new(
            "symbol".into(),
            klines.iter().map(|k| k.symbol.as_str()).collect::<Vec<&str>>(),
        ),
        Column::new(
            "open_time".into(),
            klines.iter().map(|k| k.open_time).collect::<Vec<i64>>(),
        ),
        Column::new(
            "close_time".into(),
            klines.iter().map(|k| k.close_time).collect::<Vec<i64>>(),
        ),
        f64_col("open_price", |k| k.open_price),
        f64_col("high_price", |k| k.high_price),
        f64_col("low_price", |k| k.low_price),
        f64_col("close_price", |k| k.close_price),
        f64_col("volume", |k| k.volume),
        f64_col("quote_asset_volume", |k| k.quote_asset_volume),
        Column::new(
            "number_of_trades".into(),
            klines.iter().map(|k| k.number_of_trades).collect::<Vec<i64>>(),
        ),
        f64_col("taker_buy_base_asset_volume", |k| k.taker_buy_base_asset_volume),
        f64_col("taker_buy_quote_asset_volume", |k| k.taker_buy_quote_asset_volume),
    ])
    .map_err(|e| StorageError::Columnar(format!("dataframe creation: {e}")))
}

/// Serialize klines as Parquet into `writer`.
pub fn write_klines<W: Write>(klines: &[Kline], writer: W) -> Result<(), StorageError> {
    let mut df = klines_to_dataframe(klines)?;
    ParquetWriter::new(writer)
        .finish(&mut df)
        .map_err(|e| StorageError::Columnar(format!("write parquet: {e}")))?;
    Ok(())
}

/// Serialize klines as Parquet bytes.
pub fn encode_klines(klines: &[Kline]) -> Result<Vec<u8>, StorageError> {
    let mut buf = Vec::new();
    write_klines(klines, &mut buf)?;
    Ok(buf)
}

/// Parse Parquet bytes into a DataFrame.
pub fn read_dataframe(bytes: Vec<u8>) -> Result<DataFrame, StorageError> {
    ParquetReader::new(Cursor::new(bytes))
        .finish()
        .map_err(|e| StorageError::Columnar(format!("read parquet: {e}")))
}

/// Decode Parquet bytes back into klines.
pub fn decode_klines(bytes: Vec<u8>) -> Result<Vec<Kline>, StorageError> {
    let df = read_dataframe(bytes)?;
    dataframe_to_klines(&df)
}

/// Convert a DataFrame with the kline columns back to klines.
pub fn dataframe_to_klines(df: &DataFrame) -> Result<Vec<Kline>, StorageError> {
    let col = |name: &str| {
        df.column(name)
            .map_err(|e| StorageError::Columnar(format!("missing column '{name}': {e}")))
    };
    let type_err = |name: &str, e: PolarsError| {
        StorageError::Columnar(format!("{name} column type: {e}"))
    };

    let symbol_col = col("symbol")?;
    let symbols = symbol_col.str().map_err(|e| type_err("symbol", e))?;
    let open_time_col = col("open_time")?;
    let open_times = open_time_col.i64().map_err(|e| type_err("open_time", e))?;
    let close_time_col = col("close_time")?;
    let close_times = close_time_col.i64().map_err(|e| type_err("close_time", e))?;
    let trades_col = col("number_of_trades")?;
    let trades = trades_col.i64().map_err(|e| type_err("number_of_trades", e))?;

    let f64_names = [
        "open_price",
        "high_price",
        "low_price",
        "close_price",
        "volume",
        "quote_asset_volume",
        "taker_buy_base_asset_volume",
        "taker_buy_quote_asset_volume",
    ];
    let mut f64_cols = Vec::with_capacity(f64_names.len());
    for name in f64_names {
        f64_cols.push(col(name)?.f64().map_err(|e| type_err(name, e))?);
    }

    let n = df.height();
    let mut klines = Vec::with_capacity(n);
    for i in 0..n {
        let required = |v: Option<i64>, name: &str| {
            v.ok_or_else(|| StorageError::Columnar(format!("null {name} at row {i}")))
        };
        let f = |c: usize| f64_cols[c].get(i).unwrap_or(f64::NAN);

        klines.push(Kline {
            symbol: symbols.get(i).unwrap_or_default().to_string(),
            open_time: required(open_times.get(i), "open_time")?,
            close_time: required(close_times.get(i), "close_time")?,
            open_price: f(0),
            high_price: f(1),
            low_price: f(2),
            close_price: f(3),
            volume: f(4),
            quote_asset_volume: f(5),
            number_of_trades: trades.get(i).unwrap_or(0),
            taker_buy_base_asset_volume: f(6),
            taker_buy_quote_asset_volume: f(7),
        });
    }

    Ok(klines)
}
