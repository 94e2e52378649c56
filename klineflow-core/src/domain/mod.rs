//! Domain types: klines and the batches they are written in.

pub mod kline;

pub use kline::{Batch, Kline};
