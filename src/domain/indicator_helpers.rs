//! Shared helper functions for indicator calculations.

use crate::domain::indicator::{
    IndicatorSeries, IndicatorType, calculate_ema, calculate_macd, calculate_rsi, calculate_sma,
};
use crate::domain::ohlcv::OhlcvBar;
use std::collections::HashMap;

/// Compute one series per requested indicator type. Duplicate types are computed once.
pub fn compute_indicators(
    bars: &[OhlcvBar],
    types: &[IndicatorType],
) -> HashMap<IndicatorType, IndicatorSeries> {
    let mut out = HashMap::with_capacity(types.len());
    for indicator_type in types {
        if out.contains_key(indicator_type) {
            continue;
        }
        let series = compute_one(bars, indicator_type);
        out.insert(indicator_type.clone(), series);
    }
    out
}

pub fn compute_one(bars: &[OhlcvBar], indicator_type: &IndicatorType) -> IndicatorSeries {
    match *indicator_type {
        IndicatorType::Sma(period) => calculate_sma(bars, period),
        IndicatorType::Ema(period) => calculate_ema(bars, period),
        IndicatorType::Rsi(period) => calculate_rsi(bars, period),
        IndicatorType::Macd { fast, slow, signal } => calculate_macd(bars, fast, slow, signal),
    }
}
