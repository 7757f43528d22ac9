//! Instrument registry: which instruments are tracked, at which cycle levels,
//! and with what timing parameters.
//!
//! Parent/child nesting between levels is expressed by `CycleLevel` identifiers
//! and resolved through the registry; cycles never own each other.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleLevel {
    Short,
    Medium,
    Long,
}

impl CycleLevel {
    pub const ALL: [CycleLevel; 3] = [CycleLevel::Short, CycleLevel::Medium, CycleLevel::Long];

    pub fn as_str(&self) -> &'static str {
        match self {
            CycleLevel::Short => "short",
            CycleLevel::Medium => "medium",
            CycleLevel::Long => "long",
        }
    }

    /// Upper-case tag used in alert and transition identifiers.
    pub fn tag(&self) -> &'static str {
        match self {
            CycleLevel::Short => "SHORT",
            CycleLevel::Medium => "MEDIUM",
            CycleLevel::Long => "LONG",
        }
    }
}

impl fmt::Display for CycleLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CycleLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "short" => Ok(CycleLevel::Short),
            "medium" => Ok(CycleLevel::Medium),
            "long" => Ok(CycleLevel::Long),
            other => Err(format!(
                "unknown cycle level '{}' (expected short, medium, long)",
                other
            )),
        }
    }
}

/// Range of elapsed bars within which the next cycle low is expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedWindow {
    pub min: usize,
    pub max: usize,
}

impl ExpectedWindow {
    pub fn new(min: usize, max: usize) -> Result<Self, String> {
        if max == 0 {
            return Err("window max must be positive".to_string());
        }
        if min > max {
            return Err(format!("window min {} exceeds max {}", min, max));
        }
        Ok(Self { min, max })
    }

    /// round(average(min, max) / 2)
    pub fn midpoint(&self) -> usize {
        let average = (self.min + self.max) as f64 / 2.0;
        (average / 2.0).round() as usize
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LevelConfig {
    pub level: CycleLevel,
    pub window: ExpectedWindow,
    /// Bars considered when testing for a local minimum.
    pub lookback: usize,
    /// Fraction of `window.min` that must elapse before a low can be due.
    pub due_fraction: f64,
    /// Lower closes required after a running high before it is confirmed.
    pub high_confirm_bars: usize,
    pub parent: Option<CycleLevel>,
    /// Overrun past `window.max`, as a fraction of it, at which a stale cycle escalates to WATCH.
    pub stale_watch_fraction: f64,
}

pub const DEFAULT_LOOKBACK: usize = 5;
pub const DEFAULT_DUE_FRACTION: f64 = 0.5;
pub const DEFAULT_HIGH_CONFIRM_BARS: usize = 1;
pub const DEFAULT_STALE_WATCH_FRACTION: f64 = 0.25;

impl LevelConfig {
    pub fn new(level: CycleLevel, window: ExpectedWindow) -> Self {
        Self {
            level,
            window,
            lookback: DEFAULT_LOOKBACK,
            due_fraction: DEFAULT_DUE_FRACTION,
            high_confirm_bars: DEFAULT_HIGH_CONFIRM_BARS,
            parent: None,
            stale_watch_fraction: DEFAULT_STALE_WATCH_FRACTION,
        }
    }

    pub fn with_parent(mut self, parent: CycleLevel) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Minimum elapsed count before a candidate low is considered, never below 1.
    pub fn due_after(&self) -> usize {
        let due = (self.window.min as f64 * self.due_fraction).ceil() as usize;
        due.max(1)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.lookback == 0 {
            return Err("lookback must be at least 1".to_string());
        }
        if self.high_confirm_bars == 0 {
            return Err("high_confirm_bars must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.due_fraction) {
            return Err("due_fraction must be between 0 and 1".to_string());
        }
        if self.stale_watch_fraction < 0.0 {
            return Err("stale_watch_fraction must be non-negative".to_string());
        }
        if self.parent == Some(self.level) {
            return Err("a level cannot be its own parent".to_string());
        }
        ExpectedWindow::new(self.window.min, self.window.max).map(|_| ())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instrument {
    pub id: String,
    pub unit: String,
    pub levels: BTreeMap<CycleLevel, LevelConfig>,
}

impl Instrument {
    pub fn new(id: &str, unit: &str) -> Self {
        Self {
            id: id.trim().to_uppercase(),
            unit: unit.to_string(),
            levels: BTreeMap::new(),
        }
    }

    pub fn with_level(mut self, config: LevelConfig) -> Self {
        self.levels.insert(config.level, config);
        self
    }

    pub fn level(&self, level: CycleLevel) -> Option<&LevelConfig> {
        self.levels.get(&level)
    }

    pub fn parent_of(&self, level: CycleLevel) -> Option<CycleLevel> {
        self.levels.get(&level).and_then(|c| c.parent)
    }

    pub fn children_of(&self, level: CycleLevel) -> Vec<CycleLevel> {
        self.levels
            .values()
            .filter(|c| c.parent == Some(level))
            .map(|c| c.level)
            .collect()
    }
}

/// Configuration-driven index of every tracked (instrument, level).
#[derive(Debug, Clone, Default)]
pub struct Registry {
    instruments: BTreeMap<String, Instrument>,
}

impl Registry {
    pub fn new(instruments: Vec<Instrument>) -> Self {
        Self {
            instruments: instruments
                .into_iter()
                .map(|i| (i.id.clone(), i))
                .collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Instrument> {
        self.instruments.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.instruments.keys().map(String::as_str)
    }

    pub fn instruments(&self) -> impl Iterator<Item = &Instrument> {
        self.instruments.values()
    }

    pub fn level(&self, id: &str, level: CycleLevel) -> Option<&LevelConfig> {
        self.get(id).and_then(|i| i.level(level))
    }

    pub fn parent(&self, id: &str, level: CycleLevel) -> Option<CycleLevel> {
        self.get(id).and_then(|i| i.parent_of(level))
    }

    pub fn children(&self, id: &str, level: CycleLevel) -> Vec<CycleLevel> {
        self.get(id)
            .map(|i| i.children_of(level))
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.instruments.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gold() -> Instrument {
        Instrument::new("gld", "USD")
            .with_level(
                LevelConfig::new(CycleLevel::Short, ExpectedWindow::new(22, 28).unwrap())
                    .with_parent(CycleLevel::Medium),
            )
            .with_level(
                LevelConfig::new(CycleLevel::Medium, ExpectedWindow::new(100, 130).unwrap())
                    .with_parent(CycleLevel::Long),
            )
            .with_level(LevelConfig::new(
                CycleLevel::Long,
                ExpectedWindow::new(380, 500).unwrap(),
            ))
    }

    #[test]
    fn level_round_trips_through_str() {
        for level in CycleLevel::ALL {
            assert_eq!(level.as_str().parse::<CycleLevel>().unwrap(), level);
        }
        assert_eq!(" Medium ".parse::<CycleLevel>().unwrap(), CycleLevel::Medium);
        assert!("weekly".parse::<CycleLevel>().is_err());
    }

    #[test]
    fn midpoint_rounds_half_up() {
        let window = ExpectedWindow::new(22, 28).unwrap();
        assert_eq!(window.midpoint(), 13);
        assert_eq!(ExpectedWindow::new(20, 20).unwrap().midpoint(), 10);
        assert_eq!(ExpectedWindow::new(35, 45).unwrap().midpoint(), 20);
    }

    #[test]
    fn window_rejects_inverted_bounds() {
        assert!(ExpectedWindow::new(30, 20).is_err());
        assert!(ExpectedWindow::new(0, 0).is_err());
    }

    #[test]
    fn due_after_uses_fraction_with_floor_of_one() {
        let mut cfg = LevelConfig::new(CycleLevel::Short, ExpectedWindow::new(22, 28).unwrap());
        assert_eq!(cfg.due_after(), 11);
        cfg.due_fraction = 0.0;
        assert_eq!(cfg.due_after(), 1);
    }

    #[test]
    fn instrument_ids_are_uppercased() {
        assert_eq!(gold().id, "GLD");
    }

    #[test]
    fn parent_and_child_lookup() {
        let registry = Registry::new(vec![gold()]);
        assert_eq!(
            registry.parent("GLD", CycleLevel::Short),
            Some(CycleLevel::Medium)
        );
        assert_eq!(registry.parent("GLD", CycleLevel::Long), None);
        assert_eq!(
            registry.children("GLD", CycleLevel::Medium),
            vec![CycleLevel::Short]
        );
        assert!(registry.children("SLV", CycleLevel::Medium).is_empty());
    }

    #[test]
    fn validate_rejects_self_parent() {
        let cfg = LevelConfig::new(CycleLevel::Short, ExpectedWindow::new(22, 28).unwrap())
            .with_parent(CycleLevel::Short);
        assert!(cfg.validate().is_err());
    }
}
