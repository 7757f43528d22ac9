//! Cycle record: one low-to-low segment of an instrument at one level.

use crate::domain::instrument::{CycleLevel, ExpectedWindow};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Translation {
    Pending,
    Right,
    Left,
    Mid,
}

impl Translation {
    /// Classify a confirmed high by its distance from the cycle start.
    pub fn classify(high_elapsed: usize, midpoint: usize) -> Self {
        match high_elapsed.cmp(&midpoint) {
            std::cmp::Ordering::Greater => Translation::Right,
            std::cmp::Ordering::Less => Translation::Left,
            std::cmp::Ordering::Equal => Translation::Mid,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Translation::Pending => "PENDING",
            Translation::Right => "RIGHT",
            Translation::Left => "LEFT",
            Translation::Mid => "MID",
        }
    }
}

impl fmt::Display for Translation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CyclePhase {
    /// Post-low, no confirmed high yet.
    Accumulating,
    /// High confirmed, searching for the next low.
    Distributing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cycle {
    pub instrument: String,
    pub level: CycleLevel,
    pub start_index: usize,
    pub start_price: f64,
    pub start_timestamp: NaiveDateTime,
    pub elapsed_count: usize,
    pub expected_window: ExpectedWindow,
    pub high_index: Option<usize>,
    pub high_price: Option<f64>,
    pub high_confirmed: bool,
    pub translation: Translation,
    pub failed: bool,
    pub previous_start_price: Option<f64>,
    pub parent_level: Option<CycleLevel>,
    pub child_levels: Vec<CycleLevel>,
    /// Bar index at which this cycle's low was confirmed; `None` for a seeded cycle.
    pub confirmed_at: Option<usize>,
    /// Bar index of the next cycle's low once this one is closed.
    pub closed_at: Option<usize>,
}

impl Cycle {
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        instrument: &str,
        level: CycleLevel,
        start_index: usize,
        start_price: f64,
        start_timestamp: NaiveDateTime,
        expected_window: ExpectedWindow,
        previous_start_price: Option<f64>,
        parent_level: Option<CycleLevel>,
        child_levels: Vec<CycleLevel>,
    ) -> Self {
        Self {
            instrument: instrument.to_string(),
            level,
            start_index,
            start_price,
            start_timestamp,
            elapsed_count: 0,
            expected_window,
            high_index: None,
            high_price: None,
            high_confirmed: false,
            translation: Translation::Pending,
            failed: false,
            previous_start_price,
            parent_level,
            child_levels,
            confirmed_at: None,
            closed_at: None,
        }
    }

    pub fn phase(&self) -> CyclePhase {
        if self.high_confirmed {
            CyclePhase::Distributing
        } else {
            CyclePhase::Accumulating
        }
    }

    pub fn midpoint(&self) -> usize {
        self.expected_window.midpoint()
    }

    pub fn past_midpoint(&self) -> bool {
        self.elapsed_count > self.midpoint()
    }

    /// Elapsed past `expected_window.max` with no confirmed low.
    pub fn is_stale(&self) -> bool {
        self.closed_at.is_none() && self.elapsed_count > self.expected_window.max
    }

    /// LEFT-translated or failed.
    pub fn is_weak(&self) -> bool {
        self.translation == Translation::Left || self.failed
    }

    pub fn is_open(&self) -> bool {
        self.closed_at.is_none()
    }

    pub fn high_elapsed(&self) -> Option<usize> {
        self.high_index.map(|h| h - self.start_index)
    }

    /// Rebase indexes after `n` bars were dropped from the front of the
    /// window. `n` must not exceed `start_index`.
    pub fn shift_back(&mut self, n: usize) {
        self.start_index -= n;
        self.high_index = self.high_index.map(|i| i - n);
        self.confirmed_at = self.confirmed_at.map(|i| i - n);
        self.closed_at = self.closed_at.map(|i| i - n);
    }

    /// Assign translation from the current high. Returns false if already set.
    pub fn assign_translation(&mut self) -> bool {
        if self.translation != Translation::Pending {
            return false;
        }
        let Some(elapsed) = self.high_elapsed() else {
            return false;
        };
        self.translation = Translation::classify(elapsed, self.midpoint());
        true
    }
}
