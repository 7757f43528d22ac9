//! OHLCV bar representation.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OhlcvBar {
    pub instrument: String,
    pub timestamp: NaiveDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

impl OhlcvBar {
    pub fn date(&self) -> NaiveDate {
        self.timestamp.date()
    }

    /// max(open, close)
    pub fn body_top(&self) -> f64 {
        self.open.max(self.close)
    }

    /// min(open, close)
    pub fn body_bottom(&self) -> f64 {
        self.open.min(self.close)
    }

    /// Returns a reason string if the bar is not internally consistent.
    pub fn sanity_issue(&self) -> Option<String> {
        let prices = [self.open, self.high, self.low, self.close];
        if prices.iter().any(|p| !p.is_finite()) {
            return Some("non-finite price".to_string());
        }
        if self.high < self.low {
            return Some(format!("high {} below low {}", self.high, self.low));
        }
        if self.close > self.high || self.close < self.low {
            return Some(format!(
                "close {} outside range [{}, {}]",
                self.close, self.low, self.high
            ));
        }
        if self.volume < 0 {
            return Some(format!("negative volume {}", self.volume));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bar() -> OhlcvBar {
        OhlcvBar {
            instrument: "GLD".into(),
            timestamp: NaiveDate::from_ymd_opt(2024, 1, 15)
                .unwrap()
                .and_hms_opt(16, 0, 0)
                .unwrap(),
            open: 100.0,
            high: 110.0,
            low: 90.0,
            close: 105.0,
            volume: 50_000,
        }
    }

    #[test]
    fn body_bounds() {
        let bar = sample_bar();
        assert!((bar.body_top() - 105.0).abs() < f64::EPSILON);
        assert!((bar.body_bottom() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn date_strips_time() {
        assert_eq!(
            sample_bar().date(),
            NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()
        );
    }

    #[test]
    fn sane_bar_has_no_issue() {
        assert!(sample_bar().sanity_issue().is_none());
    }

    #[test]
    fn inverted_range_is_flagged() {
        let mut bar = sample_bar();
        bar.high = 80.0;
        assert!(bar.sanity_issue().unwrap().contains("below low"));
    }

    #[test]
    fn close_outside_range_is_flagged() {
        let mut bar = sample_bar();
        bar.close = 120.0;
        assert!(bar.sanity_issue().unwrap().contains("outside range"));
    }

    #[test]
    fn nan_is_flagged() {
        let mut bar = sample_bar();
        bar.open = f64::NAN;
        assert_eq!(bar.sanity_issue().unwrap(), "non-finite price");
    }
}
