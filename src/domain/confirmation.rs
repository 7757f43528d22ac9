//! Confirmation scorer: four independent checks at a candidate low.
//!
//! Every check looks at bars after the candidate up to the last bar of the
//! slice it is given, so scoring a prefix of the history reproduces what a
//! live run saw at that bar. No state is kept between calls.

use crate::domain::indicator::{IndicatorSeries, IndicatorType};
use crate::domain::indicator::macd::{DEFAULT_FAST, DEFAULT_SIGNAL, DEFAULT_SLOW};
use crate::domain::instrument::CycleLevel;
use crate::domain::ohlcv::OhlcvBar;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Score at which a candidate low is confirmed.
pub const ACTIONABLE_SCORE: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaKind {
    Sma,
    Ema,
}

impl FromStr for MaKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sma" => Ok(MaKind::Sma),
            "ema" => Ok(MaKind::Ema),
            other => Err(format!("unknown moving average kind '{}'", other)),
        }
    }
}

impl fmt::Display for MaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaKind::Sma => f.write_str("sma"),
            MaKind::Ema => f.write_str("ema"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScorerParams {
    pub ma_kind: MaKind,
    pub ma_period: usize,
    pub rsi_period: usize,
    pub oversold: f64,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    /// Bars before the candidate searched for pivot highs.
    pub trendline_lookback: usize,
    /// Most recent pivot highs used for the fit (at least 2).
    pub trendline_pivots: usize,
    /// Bars on each side a pivot high must dominate.
    pub pivot_span: usize,
}

impl Default for ScorerParams {
    fn default() -> Self {
        Self {
            ma_kind: MaKind::Sma,
            ma_period: 10,
            rsi_period: 14,
            oversold: 30.0,
            macd_fast: DEFAULT_FAST,
            macd_slow: DEFAULT_SLOW,
            macd_signal: DEFAULT_SIGNAL,
            trendline_lookback: 30,
            trendline_pivots: 3,
            pivot_span: 2,
        }
    }
}

impl ScorerParams {
    pub fn ma_type(&self) -> IndicatorType {
        match self.ma_kind {
            MaKind::Sma => IndicatorType::Sma(self.ma_period),
            MaKind::Ema => IndicatorType::Ema(self.ma_period),
        }
    }

    pub fn rsi_type(&self) -> IndicatorType {
        IndicatorType::Rsi(self.rsi_period)
    }

    pub fn macd_type(&self) -> IndicatorType {
        IndicatorType::Macd {
            fast: self.macd_fast,
            slow: self.macd_slow,
            signal: self.macd_signal,
        }
    }

    /// Indicator series the scorer reads.
    pub fn indicator_types(&self) -> Vec<IndicatorType> {
        vec![self.ma_type(), self.rsi_type(), self.macd_type()]
    }

    /// Bars the scorer reads before a candidate low: indicator warm-up plus
    /// the trendline search.
    pub fn history_margin(&self) -> usize {
        let warmup = self
            .ma_period
            .max(self.rsi_period + 1)
            .max(self.macd_slow + self.macd_signal);
        warmup + self.trendline_lookback + self.pivot_span
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.ma_period == 0 || self.rsi_period == 0 {
            return Err("indicator periods must be positive".to_string());
        }
        if self.macd_fast == 0 || self.macd_slow == 0 || self.macd_signal == 0 {
            return Err("MACD periods must be positive".to_string());
        }
        if self.macd_fast >= self.macd_slow {
            return Err("MACD fast period must be shorter than slow".to_string());
        }
        if !(0.0..=100.0).contains(&self.oversold) {
            return Err("oversold level must be between 0 and 100".to_string());
        }
        if self.trendline_pivots < 2 {
            return Err("trendline needs at least 2 pivots".to_string());
        }
        if self.pivot_span == 0 {
            return Err("pivot_span must be at least 1".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationChecks {
    pub reversal_pattern: bool,
    pub ma_reclaim: bool,
    pub oscillator_reversal: bool,
    pub trendline_break: bool,
}

impl ConfirmationChecks {
    pub fn score(&self) -> u8 {
        [
            self.reversal_pattern,
            self.ma_reclaim,
            self.oscillator_reversal,
            self.trendline_break,
        ]
        .iter()
        .filter(|c| **c)
        .count() as u8
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationState {
    pub instrument: String,
    pub level: CycleLevel,
    pub candidate_index: usize,
    /// Last bar included in the evaluation.
    pub evaluated_at: usize,
    pub checks: ConfirmationChecks,
    pub score: u8,
}

impl ConfirmationState {
    pub fn new(
        instrument: &str,
        level: CycleLevel,
        candidate_index: usize,
        evaluated_at: usize,
        checks: ConfirmationChecks,
    ) -> Self {
        Self {
            instrument: instrument.to_string(),
            level,
            candidate_index,
            evaluated_at,
            checks,
            score: checks.score(),
        }
    }

    pub fn is_actionable(&self) -> bool {
        self.score >= ACTIONABLE_SCORE
    }
}

/// Run all four checks for `candidate` against `bars`, whose last element is
/// the current bar. `indicators` may cover more bars than `bars`.
pub fn score_candidate(
    bars: &[OhlcvBar],
    candidate: usize,
    params: &ScorerParams,
    indicators: &HashMap<IndicatorType, IndicatorSeries>,
) -> ConfirmationChecks {
    if bars.is_empty() || candidate + 1 >= bars.len() {
        return ConfirmationChecks::default();
    }
    let current = bars.len() - 1;
    let ma = indicators.get(&params.ma_type());
    let rsi = indicators.get(&params.rsi_type());
    let macd = indicators.get(&params.macd_type());

    ConfirmationChecks {
        reversal_pattern: reversal_pattern(bars, candidate),
        ma_reclaim: ma.is_some_and(|s| ma_reclaim(bars, candidate, s)),
        oscillator_reversal: oscillator_reversal(candidate, current, rsi, macd, params.oversold),
        trendline_break: trendline_break(bars, candidate, params),
    }
}

/// The candidate undercuts or matches the prior low, and a later bar opens
/// above the candidate body and closes above its high.
pub fn reversal_pattern(bars: &[OhlcvBar], candidate: usize) -> bool {
    if candidate == 0 || candidate + 1 >= bars.len() {
        return false;
    }
    let low_bar = &bars[candidate];
    if low_bar.low > bars[candidate - 1].low {
        return false;
    }
    bars[candidate + 1..]
        .iter()
        .any(|b| b.open > low_bar.body_top() && b.close > low_bar.high)
}

/// Close crossed above the moving average after the candidate and the latest
/// close is still above it.
pub fn ma_reclaim(bars: &[OhlcvBar], candidate: usize, ma: &IndicatorSeries) -> bool {
    let current = bars.len().saturating_sub(1);
    if candidate >= current {
        return false;
    }
    let Some(ma_now) = ma.simple_at(current) else {
        return false;
    };
    if bars[current].close <= ma_now {
        return false;
    }
    (candidate + 1..=current).any(|j| match (ma.simple_at(j), ma.simple_at(j - 1)) {
        (Some(ma_j), Some(ma_prev)) => bars[j].close > ma_j && bars[j - 1].close < ma_prev,
        _ => false,
    })
}

/// RSI crossed up through the oversold level, or MACD crossed above its
/// signal while below zero, after the candidate.
pub fn oscillator_reversal(
    candidate: usize,
    current: usize,
    rsi: Option<&IndicatorSeries>,
    macd: Option<&IndicatorSeries>,
    oversold: f64,
) -> bool {
    (candidate + 1..=current).any(|j| {
        let rsi_cross = rsi.is_some_and(|s| match (s.simple_at(j - 1), s.simple_at(j)) {
            (Some(prev), Some(now)) => prev < oversold && now >= oversold,
            _ => false,
        });
        let macd_cross = macd.is_some_and(|s| match (s.macd_at(j - 1), s.macd_at(j)) {
            (Some((prev_line, prev_signal)), Some((line, signal))) => {
                prev_line <= prev_signal && line > signal && line < 0.0
            }
            _ => false,
        });
        rsi_cross || macd_cross
    })
}

/// Indices of pivot highs in `[from, to]`: a bar whose high is above the
/// `span` bars before it and not below the `span` bars after it.
pub fn pivot_highs(bars: &[OhlcvBar], from: usize, to: usize, span: usize) -> Vec<usize> {
    if span == 0 || to >= bars.len() || from + span > to {
        return Vec::new();
    }
    let mut pivots = Vec::new();
    for k in from + span..=to.saturating_sub(span) {
        if k + span > to {
            break;
        }
        let high = bars[k].high;
        let left = bars[k - span..k].iter().all(|b| high > b.high);
        let right = bars[k + 1..=k + span].iter().all(|b| high >= b.high);
        if left && right {
            pivots.push(k);
        }
    }
    pivots
}

/// Least-squares (slope, intercept) through `points`; `None` for fewer than
/// two distinct x values.
pub fn fit_line(points: &[(f64, f64)]) -> Option<(f64, f64)> {
    if points.len() < 2 {
        return None;
    }
    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;
    let var_x: f64 = points.iter().map(|p| (p.0 - mean_x).powi(2)).sum();
    if var_x == 0.0 {
        return None;
    }
    let cov: f64 = points
        .iter()
        .map(|p| (p.0 - mean_x) * (p.1 - mean_y))
        .sum();
    let slope = cov / var_x;
    Some((slope, mean_y - slope * mean_x))
}

/// A descending line through the latest pivot highs before the candidate is
/// broken by the latest close.
pub fn trendline_break(bars: &[OhlcvBar], candidate: usize, params: &ScorerParams) -> bool {
    let current = bars.len().saturating_sub(1);
    if candidate >= current || candidate == 0 {
        return false;
    }
    let from = candidate.saturating_sub(params.trendline_lookback);
    let pivots = pivot_highs(bars, from, candidate, params.pivot_span);
    let wanted = params.trendline_pivots.max(2);
    if pivots.len() < 2 {
        return false;
    }
    let recent = &pivots[pivots.len().saturating_sub(wanted)..];
    let points: Vec<(f64, f64)> = recent
        .iter()
        .map(|&k| (k as f64, bars[k].high))
        .collect();
    match fit_line(&points) {
        Some((slope, intercept)) if slope < 0.0 => {
            bars[current].close > intercept + slope * current as f64
        }
        _ => false,
    }
}
