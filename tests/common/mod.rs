#![allow(dead_code)]

use chrono::{Duration, NaiveDate, NaiveDateTime};
use cyclewatch::adapters::file_config_adapter::FileConfigAdapter;
use cyclewatch::domain::account::{ExternalFlags, PortfolioSnapshot};
use cyclewatch::domain::alert::Alert;
use cyclewatch::domain::engine::{Boundary, Engine, TickInputs, TickReport};
use cyclewatch::domain::error::CycleError;
pub use cyclewatch::domain::ohlcv::OhlcvBar;
use cyclewatch::domain::settings::{load_settings, Settings};
use cyclewatch::ports::alert_port::AlertPort;
use cyclewatch::ports::persistence_port::PersistencePort;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Seed at 0, high at 3, candidate low at 7 confirmed on bar 8 by the
/// reversal pattern and the SMA(3) reclaim, failure below the prior low at 9.
pub const CLOSES: [f64; 10] = [100.0, 103.0, 106.0, 108.0, 107.0, 105.0, 103.0, 102.0, 106.0, 99.0];

/// One GLD short cycle of 6 to 10 bars and a rule firing on a confirmed low.
pub const GLD_CONFIG: &str = r#"
[engine]
instruments = GLD
warmup = 6

[instrument.GLD]
unit = USD

[cycle.GLD.short]
window_min = 6
window_max = 10

[confirm]
ma_period = 3

[rule.new_low]
when = AND(NEW_LOW(short), AT_LEAST(SCORE(short), 2))
severity = watch
action = entry
"#;

pub fn start() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, 1)
        .unwrap()
        .and_hms_opt(16, 0, 0)
        .unwrap()
}

/// Daily bar `i` with open = high = low = close.
pub fn flat_bar(instrument: &str, i: usize, close: f64) -> OhlcvBar {
    OhlcvBar {
        instrument: instrument.to_string(),
        timestamp: start() + Duration::days(i as i64),
        open: close,
        high: close,
        low: close,
        close,
        volume: 1000,
    }
}

pub fn batch(instrument: &str, closes: &[f64], range: std::ops::Range<usize>) -> BTreeMap<String, Vec<OhlcvBar>> {
    let mut map = BTreeMap::new();
    map.insert(
        instrument.to_string(),
        range.map(|i| flat_bar(instrument, i, closes[i])).collect(),
    );
    map
}

pub fn settings_from(text: &str) -> Settings {
    load_settings(&FileConfigAdapter::from_string(text).unwrap()).unwrap()
}

/// CSV text for `closes`, one daily bar per row.
pub fn csv_text(closes: &[f64]) -> String {
    let mut out = String::from("timestamp,open,high,low,close,volume\n");
    for (i, close) in closes.iter().enumerate() {
        let ts = start() + Duration::days(i as i64);
        out.push_str(&format!(
            "{},{close},{close},{close},{close},1000\n",
            ts.format("%Y-%m-%d %H:%M:%S")
        ));
    }
    out
}

#[derive(Default)]
pub struct RecordingSink {
    pub delivered: Mutex<Vec<Alert>>,
}

impl RecordingSink {
    pub fn sources(&self) -> Vec<String> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .map(|a| a.key.source.clone())
            .collect()
    }
}

impl AlertPort for RecordingSink {
    fn deliver(&self, alert: &Alert) -> Result<(), CycleError> {
        self.delivered.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

/// Run one live tick of `bars` with the configured portfolio and the given flags.
pub fn live_tick(
    engine: &mut Engine,
    bars: &BTreeMap<String, Vec<OhlcvBar>>,
    flags: &ExternalFlags,
    sink: &dyn AlertPort,
    persistence: Option<&dyn PersistencePort>,
) -> TickReport {
    let portfolio: PortfolioSnapshot = engine.settings().portfolio.clone();
    engine.tick(
        bars,
        &TickInputs {
            portfolio: &portfolio,
            flags,
        },
        &Boundary { sink, persistence },
    )
}
