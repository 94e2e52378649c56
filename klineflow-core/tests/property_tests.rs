//! Property tests for the path codec and watermark resolution.
//!
//! Uses proptest to verify:
//! 1. Round trip: decode(encode(s, t)) == (s, t) for minute-aligned t
//! 2. Truncation: sub-minute precision is dropped, never rounded up
//! 3. Ordering: path order agrees with timestamp order for one symbol
//! 4. Watermark monotonicity: resolve() > every decoded timestamp

use klineflow_core::path::truncate_to_minute;
use klineflow_core::{PathCodec, WatermarkResolver};
use proptest::prelude::*;

// 1970-01-01 .. 2100-01-01
const MAX_TS: i64 = 4_102_444_800_000;
const DEFAULT_START: i64 = 1_609_459_200_000;

fn arb_symbol() -> impl Strategy<Value = String> {
    "[A-Z0-9]{2,12}"
}

fn arb_minute() -> impl Strategy<Value = i64> {
    (0..MAX_TS / 60_000).prop_map(|m| m * 60_000)
}

fn arb_timestamp() -> impl Strategy<Value = i64> {
    0..MAX_TS
}

proptest! {
    #[test]
    fn encode_decode_round_trip(symbol in arb_symbol(), ts in arb_minute()) {
        let codec = PathCodec::default();
        let path = codec.encode(&symbol, ts).unwrap();
        let decoded = codec.decode(&path).unwrap();
        prop_assert_eq!(decoded.symbol, symbol);
        prop_assert_eq!(decoded.timestamp_ms, ts);
    }

    #[test]
    fn sub_minute_precision_is_truncated(symbol in arb_symbol(), ts in arb_timestamp()) {
        let codec = PathCodec::new("data/klines");
        let decoded = codec.decode(&codec.encode(&symbol, ts).unwrap()).unwrap();
        prop_assert_eq!(decoded.timestamp_ms, truncate_to_minute(ts));
        prop_assert!(decoded.timestamp_ms <= ts);
        prop_assert!(ts - decoded.timestamp_ms < 60_000);
    }

    #[test]
    fn path_order_matches_time_order(symbol in arb_symbol(), a in arb_minute(), b in arb_minute()) {
        let codec = PathCodec::default();
        let pa = codec.encode(&symbol, a).unwrap();
        let pb = codec.encode(&symbol, b).unwrap();
        prop_assert_eq!(pa.cmp(&pb), a.cmp(&b));
    }

    #[test]
    fn watermark_exceeds_every_decoded_timestamp(
        symbol in arb_symbol(),
        stamps in prop::collection::vec(arb_minute(), 1..20),
    ) {
        let codec = PathCodec::default();
        let paths: Vec<String> = stamps
            .iter()
            .map(|&t| codec.encode(&symbol, t).unwrap())
            .collect();
        let resolver = WatermarkResolver::new(codec);

        let watermark = resolver.resolve(&symbol, &paths, DEFAULT_START);
        let max = *stamps.iter().max().unwrap();
        prop_assert!(stamps.iter().all(|&t| watermark > t));
        prop_assert_eq!(watermark, max + 1);
    }

    #[test]
    fn watermark_ignores_other_symbols(
        stamps in prop::collection::vec(arb_minute(), 0..10),
    ) {
        let codec = PathCodec::default();
        let paths: Vec<String> = stamps
            .iter()
            .map(|&t| codec.encode("ETHUSDT", t).unwrap())
            .collect();
        let resolver = WatermarkResolver::new(codec);
        prop_assert_eq!(resolver.resolve("BTCUSDT", &paths, DEFAULT_START), DEFAULT_START);
    }
}
