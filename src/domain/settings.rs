//! Build engine settings from configuration.
//!
//! Sections (section and key names are case-insensitive):
//!
//! - `[engine]`: `instruments` (optional list), `warmup`, `history_bars`
//! - `[instrument.<ID>]`: `unit`
//! - `[cycle.<ID>.<level>]`: `window_min`, `window_max`, `lookback`,
//!   `due_fraction`, `high_confirm_bars`, `stale_watch_fraction`, `parent`
//! - `[confirm]` / `[confirm.<ID>]`: scorer parameters, per-instrument keys
//!   override the shared section
//! - `[rule.<id>]`: `kind`, `level`, `instruments`, `severity`, `action`,
//!   `account`, `when`, `corroborate_with`; every other key is a numeric
//!   `$param`
//! - `[alerts]`: `<tier>_min_gap_hours`, `<tier>_daily_cap`
//! - `[account.<id>]`: `tax_advantaged`, `holdings` (`ID:units, ...`), `disallowed`
//! - `[flags]`: `name = true|false`

use crate::domain::account::{AccountState, ExternalFlags, PortfolioSnapshot};
use crate::domain::alert::{AlertPolicy, Severity, TierLimit};
use crate::domain::confirmation::{MaKind, ScorerParams};
use crate::domain::error::CycleError;
use crate::domain::instrument::{CycleLevel, ExpectedWindow, Instrument, LevelConfig, Registry};
use crate::domain::rule::CycleRef;
use crate::domain::rule_parser;
use crate::domain::signal::{RuleKind, RuleSpec, SignalAction};
use crate::ports::config_port::ConfigPort;
use chrono::Duration;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

pub const DEFAULT_WARMUP: usize = 0;
/// Bars kept per instrument once older cycles have closed.
pub const DEFAULT_HISTORY_BARS: usize = 1024;

const RULE_KEYS: [&str; 8] = [
    "kind",
    "level",
    "instruments",
    "severity",
    "action",
    "account",
    "when",
    "corroborate_with",
];

#[derive(Debug)]
pub struct Settings {
    pub registry: Registry,
    /// Resolved scorer parameters per instrument.
    pub scorers: BTreeMap<String, ScorerParams>,
    pub rules: Vec<RuleSpec>,
    /// Rules rejected at load time; they never fire.
    pub rule_errors: Vec<CycleError>,
    pub alert_policy: AlertPolicy,
    pub portfolio: PortfolioSnapshot,
    pub flags: ExternalFlags,
    /// Bars per instrument consumed by backfill before live ticks.
    pub warmup: usize,
    /// Soft cap on the bar window kept per instrument.
    pub history_bars: usize,
}

impl Settings {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            scorers: BTreeMap::new(),
            rules: Vec::new(),
            rule_errors: Vec::new(),
            alert_policy: AlertPolicy::default(),
            portfolio: PortfolioSnapshot::default(),
            flags: ExternalFlags::default(),
            warmup: DEFAULT_WARMUP,
            history_bars: DEFAULT_HISTORY_BARS,
        }
    }

    pub fn scorer(&self, instrument: &str) -> ScorerParams {
        self.scorers.get(instrument).cloned().unwrap_or_default()
    }
}

pub fn load_settings(config: &dyn ConfigPort) -> Result<Settings, CycleError> {
    let registry = load_registry(config)?;

    let mut scorers = BTreeMap::new();
    for id in registry.ids() {
        scorers.insert(id.to_string(), load_scorer(config, id)?);
    }

    let (rules, rule_errors) = load_rules(config);
    for err in &rule_errors {
        warn!(error = %err, "rule rejected");
    }

    let settings = Settings {
        scorers,
        rules,
        rule_errors,
        alert_policy: load_alert_policy(config)?,
        portfolio: load_portfolio(config)?,
        flags: load_flags(config)?,
        warmup: get_usize(config, "engine", "warmup", DEFAULT_WARMUP)?,
        history_bars: get_usize(config, "engine", "history_bars", DEFAULT_HISTORY_BARS)?,
        registry,
    };
    debug!(
        instruments = settings.registry.len(),
        rules = settings.rules.len(),
        "settings loaded"
    );
    Ok(settings)
}

fn load_registry(config: &dyn ConfigPort) -> Result<Registry, CycleError> {
    let sections = config.sections();
    let ids: Vec<String> = match config.get_string("engine", "instruments") {
        Some(list) => split_list(&list).map(|s| s.to_uppercase()).collect(),
        None => discover_instruments(&sections),
    };
    if ids.is_empty() {
        return Err(CycleError::ConfigMissing {
            section: "engine".to_string(),
            key: "instruments".to_string(),
        });
    }

    let mut instruments = Vec::with_capacity(ids.len());
    for id in ids {
        let section = format!("instrument.{}", id.to_lowercase());
        let unit = config
            .get_string(&section, "unit")
            .unwrap_or_else(|| "USD".to_string());
        let mut instrument = Instrument::new(&id, &unit);
        for level in CycleLevel::ALL {
            let section = format!("cycle.{}.{}", id.to_lowercase(), level);
            if sections.contains(&section) {
                instrument = instrument.with_level(load_level(config, &section, level)?);
            }
        }
        if instrument.levels.is_empty() {
            return Err(CycleError::ConfigMissing {
                section: format!("cycle.{}.<level>", id),
                key: "window_min".to_string(),
            });
        }
        instruments.push(instrument);
    }
    Ok(Registry::new(instruments))
}

/// Instrument ids named by `[instrument.<ID>]` or `[cycle.<ID>.<level>]`
/// sections, sorted and deduplicated.
fn discover_instruments(sections: &[String]) -> Vec<String> {
    let mut ids = BTreeSet::new();
    for section in sections {
        if let Some(id) = section.strip_prefix("instrument.") {
            ids.insert(id.to_uppercase());
        } else if let Some((id, _level)) = section
            .strip_prefix("cycle.")
            .and_then(|rest| rest.rsplit_once('.'))
        {
            ids.insert(id.to_uppercase());
        }
    }
    ids.into_iter().collect()
}

fn load_level(
    config: &dyn ConfigPort,
    section: &str,
    level: CycleLevel,
) -> Result<LevelConfig, CycleError> {
    let min = require_usize(config, section, "window_min")?;
    let max = require_usize(config, section, "window_max")?;
    let window = ExpectedWindow::new(min, max).map_err(|reason| invalid(section, "window_max", reason))?;

    let mut cfg = LevelConfig::new(level, window);
    cfg.lookback = get_usize(config, section, "lookback", cfg.lookback)?;
    cfg.due_fraction = config.get_double(section, "due_fraction", cfg.due_fraction);
    cfg.high_confirm_bars = get_usize(config, section, "high_confirm_bars", cfg.high_confirm_bars)?;
    cfg.stale_watch_fraction =
        config.get_double(section, "stale_watch_fraction", cfg.stale_watch_fraction);
    if let Some(parent) = config.get_string(section, "parent") {
        let parent: CycleLevel = parent
            .parse()
            .map_err(|reason: String| invalid(section, "parent", reason))?;
        if parent <= level {
            return Err(invalid(section, "parent", "parent must be a longer level".to_string()));
        }
        cfg = cfg.with_parent(parent);
    }
    cfg.validate().map_err(|reason| invalid(section, "window", reason))?;
    Ok(cfg)
}

fn load_scorer(config: &dyn ConfigPort, instrument: &str) -> Result<ScorerParams, CycleError> {
    let own = format!("confirm.{}", instrument.to_lowercase());
    let lookup = |key: &str| {
        config
            .get_string(&own, key)
            .map(|v| (own.clone(), v))
            .or_else(|| config.get_string("confirm", key).map(|v| ("confirm".to_string(), v)))
    };
    let number = |key: &str, default: f64| -> Result<f64, CycleError> {
        match lookup(key) {
            Some((section, raw)) => raw
                .trim()
                .parse::<f64>()
                .map_err(|_| invalid(&section, key, format!("'{}' is not a number", raw))),
            None => Ok(default),
        }
    };
    let count = |key: &str, default: usize| -> Result<usize, CycleError> {
        let v = number(key, default as f64)?;
        if v < 0.0 || v.fract() != 0.0 {
            return Err(invalid(&own, key, "must be a non-negative integer".to_string()));
        }
        Ok(v as usize)
    };

    let defaults = ScorerParams::default();
    let ma_kind = match lookup("ma_kind") {
        Some((section, raw)) => raw
            .parse::<MaKind>()
            .map_err(|reason| invalid(&section, "ma_kind", reason))?,
        None => defaults.ma_kind,
    };
    let params = ScorerParams {
        ma_kind,
        ma_period: count("ma_period", defaults.ma_period)?,
        rsi_period: count("rsi_period", defaults.rsi_period)?,
        oversold: number("oversold", defaults.oversold)?,
        macd_fast: count("macd_fast", defaults.macd_fast)?,
        macd_slow: count("macd_slow", defaults.macd_slow)?,
        macd_signal: count("macd_signal", defaults.macd_signal)?,
        trendline_lookback: count("trendline_lookback", defaults.trendline_lookback)?,
        trendline_pivots: count("trendline_pivots", defaults.trendline_pivots)?,
        pivot_span: count("pivot_span", defaults.pivot_span)?,
    };
    params.validate().map_err(|reason| invalid(&own, "confirm", reason))?;
    Ok(params)
}

/// Load every `[rule.<id>]` section. A broken rule is reported and skipped.
fn load_rules(config: &dyn ConfigPort) -> (Vec<RuleSpec>, Vec<CycleError>) {
    let mut rules = Vec::new();
    let mut errors = Vec::new();
    for section in config.sections() {
        let Some(id) = section.strip_prefix("rule.") else {
            continue;
        };
        match load_rule(config, &section, id) {
            Ok(rule) => rules.push(rule),
            Err(e) => errors.push(e),
        }
    }
    (rules, errors)
}

fn load_rule(config: &dyn ConfigPort, section: &str, id: &str) -> Result<RuleSpec, CycleError> {
    let kind: RuleKind = match config.get_string(section, "kind") {
        Some(raw) => raw.parse().map_err(|reason| invalid(section, "kind", reason))?,
        None if config.get_string(section, "when").is_some() => RuleKind::Custom,
        None => {
            return Err(CycleError::ConfigMissing {
                section: section.to_string(),
                key: "kind".to_string(),
            });
        }
    };
    let level: CycleLevel = match config.get_string(section, "level") {
        Some(raw) => raw.parse().map_err(|reason| invalid(section, "level", reason))?,
        None => CycleLevel::Short,
    };

    let corroborate_with = match config.get_string(section, "corroborate_with") {
        Some(raw) => Some(parse_cycle_ref(section, &raw)?),
        None => None,
    };
    let condition = match config.get_string(section, "when") {
        Some(text) => rule_parser::parse(&text).map_err(|e| CycleError::RuleInvalid {
            rule: id.to_string(),
            reason: e.display_with_context(&text),
        })?,
        None => kind
            .condition(level, corroborate_with.as_ref())?
            .ok_or_else(|| CycleError::ConfigMissing {
                section: section.to_string(),
                key: "when".to_string(),
            })?,
    };

    let severity = match kind {
        RuleKind::HardStop => Severity::Critical,
        _ => match config.get_string(section, "severity") {
            Some(raw) => raw.parse().map_err(|reason| invalid(section, "severity", reason))?,
            None => kind.default_severity(),
        },
    };
    let action: SignalAction = match config.get_string(section, "action") {
        Some(raw) => raw.parse().map_err(|reason| invalid(section, "action", reason))?,
        None => kind.default_action(),
    };
    let instruments = config
        .get_string(section, "instruments")
        .map(|list| split_list(&list).map(|s| s.to_uppercase()).collect())
        .unwrap_or_default();

    let mut params = BTreeMap::new();
    for key in config.keys(section) {
        if RULE_KEYS.contains(&key.as_str()) {
            continue;
        }
        let raw = config.get_string(section, &key).unwrap_or_default();
        let value = raw
            .trim()
            .parse::<f64>()
            .map_err(|_| invalid(section, &key, format!("'{}' is not a number", raw)))?;
        params.insert(key, value);
    }

    Ok(RuleSpec {
        id: id.to_string(),
        kind,
        instruments,
        level,
        condition,
        params,
        severity,
        action,
        account: config.get_string(section, "account"),
    })
}

/// `INSTR:level` as accepted by the rule DSL.
fn parse_cycle_ref(section: &str, raw: &str) -> Result<CycleRef, CycleError> {
    let (instrument, level) = raw.split_once(':').ok_or_else(|| {
        invalid(
            section,
            "corroborate_with",
            format!("expected INSTRUMENT:level, found '{}'", raw),
        )
    })?;
    let level: CycleLevel = level
        .parse()
        .map_err(|reason| invalid(section, "corroborate_with", reason))?;
    Ok(CycleRef::on(instrument.trim(), level))
}

fn load_alert_policy(config: &dyn ConfigPort) -> Result<AlertPolicy, CycleError> {
    let defaults = AlertPolicy::default();
    let tier = |name: &str, fallback: TierLimit| -> Result<TierLimit, CycleError> {
        let hours = config.get_double(
            "alerts",
            &format!("{}_min_gap_hours", name),
            fallback.min_gap.num_minutes() as f64 / 60.0,
        );
        if hours < 0.0 {
            return Err(invalid("alerts", &format!("{}_min_gap_hours", name), "must be non-negative".into()));
        }
        let cap = get_usize(config, "alerts", &format!("{}_daily_cap", name), fallback.daily_cap as usize)?;
        Ok(TierLimit {
            min_gap: Duration::minutes((hours * 60.0).round() as i64),
            daily_cap: u32::try_from(cap)
                .map_err(|_| invalid("alerts", &format!("{}_daily_cap", name), "too large".into()))?,
        })
    };
    Ok(AlertPolicy {
        watch: tier("watch", defaults.watch)?,
        info: tier("info", defaults.info)?,
    })
}

fn load_portfolio(config: &dyn ConfigPort) -> Result<PortfolioSnapshot, CycleError> {
    let mut accounts = Vec::new();
    for section in config.sections() {
        let Some(id) = section.strip_prefix("account.") else {
            continue;
        };
        let mut account = AccountState::new(id);
        account.tax_advantaged = config.get_bool(&section, "tax_advantaged", false);
        if let Some(list) = config.get_string(&section, "holdings") {
            for item in split_list(&list) {
                let (instrument, units) = item.split_once(':').ok_or_else(|| {
                    invalid(&section, "holdings", format!("expected ID:units, found '{}'", item))
                })?;
                let units: f64 = units.trim().parse().map_err(|_| {
                    invalid(&section, "holdings", format!("'{}' is not a number", units.trim()))
                })?;
                account.holdings.insert(instrument.trim().to_uppercase(), units);
            }
        }
        if let Some(list) = config.get_string(&section, "disallowed") {
            account
                .disallowed
                .extend(split_list(&list).map(|s| s.to_uppercase()));
        }
        accounts.push(account);
    }
    Ok(PortfolioSnapshot::new(accounts))
}

fn load_flags(config: &dyn ConfigPort) -> Result<ExternalFlags, CycleError> {
    let mut flags = ExternalFlags::new();
    for key in config.keys("flags") {
        let raw = config.get_string("flags", &key).unwrap_or_default();
        let value = match raw.trim().to_lowercase().as_str() {
            "true" | "yes" | "1" => true,
            "false" | "no" | "0" => false,
            _ => return Err(invalid("flags", &key, format!("'{}' is not a boolean", raw))),
        };
        flags.set(&key, value);
    }
    Ok(flags)
}

fn split_list(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn require_usize(config: &dyn ConfigPort, section: &str, key: &str) -> Result<usize, CycleError> {
    let raw = config
        .get_string(section, key)
        .ok_or_else(|| CycleError::ConfigMissing {
            section: section.to_string(),
            key: key.to_string(),
        })?;
    raw.trim()
        .parse()
        .map_err(|_| invalid(section, key, format!("'{}' is not a non-negative integer", raw)))
}

fn get_usize(
    config: &dyn ConfigPort,
    section: &str,
    key: &str,
    default: usize,
) -> Result<usize, CycleError> {
    match config.get_string(section, key) {
        Some(_) => require_usize(config, section, key),
        None => Ok(default),
    }
}

fn invalid(section: &str, key: &str, reason: String) -> CycleError {
    CycleError::ConfigInvalid {
        section: section.to_string(),
        key: key.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::file_config_adapter::FileConfigAdapter;

    const CONFIG: &str = r#"
[engine]
instruments = GLD, SLV
warmup = 40

[instrument.GLD]
unit = USD

[cycle.GLD.short]
window_min = 22
window_max = 28
parent = medium

[cycle.GLD.medium]
window_min = 100
window_max = 130
lookback = 8

[cycle.SLV.short]
window_min = 20
window_max = 30

[confirm]
ma_period = 10
oversold = 30

[confirm.SLV]
ma_kind = ema
ma_period = 8

[rule.gld_stop]
kind = hard_stop
instruments = GLD
severity = INFO
floor = 180.5

[rule.gld_tranche]
kind = tranche_entry
instruments = GLD
account = ira
min_day = 3
capital_fraction = 0.25

[rule.custom_watch]
when = AND(STALE(short), FLAG(volatility_rank_ok))
severity = watch

[rule.broken]
when = AND(STALE(short)

[alerts]
watch_min_gap_hours = 2
info_daily_cap = 1

[account.ira]
tax_advantaged = yes
holdings = GLD:10, SLV:2.5
disallowed = TLT

[flags]
volatility_rank_ok = true
"#;

    fn settings() -> Settings {
        load_settings(&FileConfigAdapter::from_string(CONFIG).unwrap()).unwrap()
    }

    #[test]
    fn registry_from_sections() {
        let s = settings();
        assert_eq!(s.registry.ids().collect::<Vec<_>>(), vec!["GLD", "SLV"]);
        let short = s.registry.level("GLD", CycleLevel::Short).unwrap();
        assert_eq!(short.window, ExpectedWindow::new(22, 28).unwrap());
        assert_eq!(short.parent, Some(CycleLevel::Medium));
        assert_eq!(s.registry.level("GLD", CycleLevel::Medium).unwrap().lookback, 8);
        assert!(s.registry.level("SLV", CycleLevel::Medium).is_none());
        assert_eq!(s.warmup, 40);
    }

    #[test]
    fn instruments_discovered_from_cycle_sections() {
        let text = "[cycle.GLD.short]\nwindow_min = 6\nwindow_max = 10\n\n\
                    [cycle.SLV.short]\nwindow_min = 20\nwindow_max = 30\n\n\
                    [cycle.SLV.medium]\nwindow_min = 100\nwindow_max = 130\n\n\
                    [instrument.SLV]\nunit = oz\n";
        let s = load_settings(&FileConfigAdapter::from_string(text).unwrap()).unwrap();
        assert_eq!(s.registry.ids().collect::<Vec<_>>(), vec!["GLD", "SLV"]);
        assert_eq!(s.registry.get("GLD").unwrap().unit, "USD");
        assert_eq!(s.registry.get("SLV").unwrap().unit, "oz");
        assert!(s.registry.level("SLV", CycleLevel::Medium).is_some());
        assert_eq!(s.history_bars, DEFAULT_HISTORY_BARS);
    }

    #[test]
    fn scorer_falls_back_to_shared_section() {
        let s = settings();
        assert_eq!(s.scorer("GLD").ma_kind, MaKind::Sma);
        assert_eq!(s.scorer("GLD").ma_period, 10);
        assert_eq!(s.scorer("SLV").ma_kind, MaKind::Ema);
        assert_eq!(s.scorer("SLV").ma_period, 8);
        assert_eq!(s.scorer("SLV").rsi_period, 14);
    }

    #[test]
    fn rules_and_params() {
        let s = settings();
        let stop = s.rules.iter().find(|r| r.id == "gld_stop").unwrap();
        assert_eq!(stop.severity, Severity::Critical);
        assert_eq!(stop.params["floor"], 180.5);
        assert_eq!(stop.instruments, vec!["GLD".to_string()]);

        let tranche = s.rules.iter().find(|r| r.id == "gld_tranche").unwrap();
        assert_eq!(tranche.action, SignalAction::Entry);
        assert_eq!(tranche.account.as_deref(), Some("ira"));
        assert_eq!(tranche.params.len(), 2);

        let custom = s.rules.iter().find(|r| r.id == "custom_watch").unwrap();
        assert_eq!(custom.kind, RuleKind::Custom);
        assert_eq!(custom.severity, Severity::Watch);
    }

    #[test]
    fn broken_rule_is_isolated() {
        let s = settings();
        assert_eq!(s.rules.len(), 3);
        assert_eq!(s.rule_errors.len(), 1);
        assert!(matches!(s.rule_errors[0], CycleError::RuleInvalid { ref rule, .. } if rule == "broken"));
    }

    #[test]
    fn alert_policy_overrides() {
        let s = settings();
        assert_eq!(s.alert_policy.watch.min_gap, Duration::hours(2));
        assert_eq!(s.alert_policy.watch.daily_cap, 5);
        assert_eq!(s.alert_policy.info.min_gap, Duration::hours(24));
        assert_eq!(s.alert_policy.info.daily_cap, 1);
    }

    #[test]
    fn accounts_and_flags() {
        let s = settings();
        let ira = s.portfolio.account("ira").unwrap();
        assert!(ira.tax_advantaged);
        assert_eq!(ira.position("SLV"), 2.5);
        assert!(!ira.allows("TLT"));
        assert_eq!(s.flags.get("volatility_rank_ok"), Some(true));
    }

    #[test]
    fn missing_window_is_reported() {
        let config = FileConfigAdapter::from_string(
            "[instrument.GLD]\n[cycle.GLD.short]\nwindow_min = 22\n",
        )
        .unwrap();
        let err = load_settings(&config).unwrap_err();
        assert!(matches!(err, CycleError::ConfigMissing { ref key, .. } if key == "window_max"));
    }

    #[test]
    fn inverted_window_is_invalid() {
        let config = FileConfigAdapter::from_string(
            "[instrument.GLD]\n[cycle.GLD.short]\nwindow_min = 30\nwindow_max = 20\n",
        )
        .unwrap();
        assert!(load_settings(&config).unwrap_err().is_configuration());
    }

    #[test]
    fn parent_must_be_longer() {
        let config = FileConfigAdapter::from_string(
            "[instrument.GLD]\n[cycle.GLD.medium]\nwindow_min = 100\nwindow_max = 130\nparent = short\n",
        )
        .unwrap();
        let err = load_settings(&config).unwrap_err();
        assert!(matches!(err, CycleError::ConfigInvalid { ref key, .. } if key == "parent"));
    }

    #[test]
    fn instrument_without_levels_is_rejected() {
        let config = FileConfigAdapter::from_string("[instrument.GLD]\nunit = USD\n").unwrap();
        assert!(load_settings(&config).is_err());
    }
}
