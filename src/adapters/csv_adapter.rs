//! CSV bar feed: one `<INSTRUMENT>.csv` file per instrument.
//!
//! Columns: `timestamp,open,high,low,close,volume`. Timestamps may be a date
//! (`2024-01-15`, taken as midnight) or a date-time
//! (`2024-01-15 16:00:00` / `2024-01-15T16:00:00`). Rows are returned in file
//! order. A row that cannot be parsed, or whose timestamp is not after the
//! previous kept row, is skipped and reported as a data-quality issue; the
//! rest of the file is still used.

use crate::domain::error::CycleError;
use crate::domain::ohlcv::OhlcvBar;
use crate::ports::data_port::DataPort;
use chrono::{NaiveDate, NaiveDateTime};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use tracing::warn;

pub struct CsvAdapter {
    base_path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct CsvRow {
    #[serde(alias = "date")]
    timestamp: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    #[serde(default)]
    volume: i64,
}

impl CsvAdapter {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn csv_path(&self, instrument: &str) -> PathBuf {
        self.base_path.join(format!("{}.csv", instrument.to_uppercase()))
    }
}

pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S"))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

impl CsvAdapter {
    /// Bars after `after` plus one issue per skipped row. Only an unreadable
    /// file is an error.
    pub fn fetch_bars_checked(
        &self,
        instrument: &str,
        after: Option<NaiveDateTime>,
    ) -> Result<(Vec<OhlcvBar>, Vec<CycleError>), CycleError> {
        let path = self.csv_path(instrument);
        let content = fs::read_to_string(&path).map_err(|e| CycleError::Feed {
            reason: format!("failed to read {}: {}", path.display(), e),
        })?;
        let instrument = instrument.to_uppercase();
        let skip = |row: usize, reason: String| {
            let issue = CycleError::DataQuality {
                instrument: instrument.clone(),
                reason: format!("{} row {}: {}", path.display(), row, reason),
            };
            warn!(error = %issue, "csv row skipped");
            issue
        };

        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(content.as_bytes());
        let mut bars: Vec<OhlcvBar> = Vec::new();
        let mut issues = Vec::new();
        for (line, result) in rdr.deserialize::<CsvRow>().enumerate() {
            let row_number = line + 2;
            let row = match result {
                Ok(row) => row,
                Err(e) => {
                    issues.push(skip(row_number, e.to_string()));
                    continue;
                }
            };
            let Some(timestamp) = parse_timestamp(&row.timestamp) else {
                issues.push(skip(row_number, format!("invalid timestamp '{}'", row.timestamp)));
                continue;
            };
            if let Some(last) = bars.last().filter(|b| timestamp <= b.timestamp) {
                let reason = format!("{} is not after {}", timestamp, last.timestamp);
                issues.push(skip(row_number, reason));
                continue;
            }
            if after.is_some_and(|a| timestamp <= a) {
                continue;
            }
            bars.push(OhlcvBar {
                instrument: instrument.clone(),
                timestamp,
                open: row.open,
                high: row.high,
                low: row.low,
                close: row.close,
                volume: row.volume,
            });
        }
        Ok((bars, issues))
    }
}

impl DataPort for CsvAdapter {
    fn fetch_bars(
        &self,
        instrument: &str,
        after: Option<NaiveDateTime>,
    ) -> Result<Vec<OhlcvBar>, CycleError> {
        self.fetch_bars_checked(instrument, after).map(|(bars, _)| bars)
    }

    fn list_instruments(&self) -> Result<Vec<String>, CycleError> {
        let entries = fs::read_dir(&self.base_path).map_err(|e| CycleError::Feed {
            reason: format!("failed to read directory {}: {}", self.base_path.display(), e),
        })?;

        let mut instruments = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "csv") {
                if let Some(stem) = path.file_stem() {
                    instruments.push(stem.to_string_lossy().to_uppercase());
                }
            }
        }
        instruments.sort();
        Ok(instruments)
    }
}
