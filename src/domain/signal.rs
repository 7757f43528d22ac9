//! Signal rules: built-in rule kinds, edge-triggered evaluation and the
//! active-signal book.

use crate::domain::account::{ExternalFlags, PortfolioSnapshot};
use crate::domain::alert::Severity;
use crate::domain::error::CycleError;
use crate::domain::instrument::{CycleLevel, Registry};
use crate::domain::rule::{CycleRef, Rule};
use crate::domain::rule_eval::{self, EvalContext};
use crate::domain::rule_parser;
use crate::domain::state_store::InstrumentState;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

/// Flag consulted by `scale_out_full` when no corroborating cycle is configured.
pub const CORROBORATION_FLAG: &str = "cross_asset_corroboration";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalAction {
    Entry,
    PartialExit,
    FullExit,
    Exit,
    Notify,
}

impl fmt::Display for SignalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SignalAction::Entry => "entry",
            SignalAction::PartialExit => "partial_exit",
            SignalAction::FullExit => "full_exit",
            SignalAction::Exit => "exit",
            SignalAction::Notify => "notify",
        })
    }
}

impl FromStr for SignalAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "entry" => Ok(SignalAction::Entry),
            "partial_exit" => Ok(SignalAction::PartialExit),
            "full_exit" => Ok(SignalAction::FullExit),
            "exit" => Ok(SignalAction::Exit),
            "notify" => Ok(SignalAction::Notify),
            other => Err(format!("unknown action '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    TrancheEntry,
    ScaleOutPartial,
    ScaleOutFull,
    HardStop,
    PhaseTransitionEntry,
    Custom,
}

impl FromStr for RuleKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "tranche_entry" => Ok(RuleKind::TrancheEntry),
            "scale_out_partial" => Ok(RuleKind::ScaleOutPartial),
            "scale_out_full" => Ok(RuleKind::ScaleOutFull),
            "hard_stop" => Ok(RuleKind::HardStop),
            "phase_transition_entry" => Ok(RuleKind::PhaseTransitionEntry),
            "custom" => Ok(RuleKind::Custom),
            other => Err(format!("unknown rule kind '{}'", other)),
        }
    }
}

impl RuleKind {
    pub fn default_action(self) -> SignalAction {
        match self {
            RuleKind::TrancheEntry | RuleKind::PhaseTransitionEntry => SignalAction::Entry,
            RuleKind::ScaleOutPartial => SignalAction::PartialExit,
            RuleKind::ScaleOutFull => SignalAction::FullExit,
            RuleKind::HardStop => SignalAction::Exit,
            RuleKind::Custom => SignalAction::Notify,
        }
    }

    pub fn default_severity(self) -> Severity {
        match self {
            RuleKind::HardStop | RuleKind::ScaleOutFull => Severity::Critical,
            RuleKind::Custom => Severity::Info,
            _ => Severity::Watch,
        }
    }

    /// DSL text for a built-in kind; `None` for `Custom`.
    pub fn template(self, level: CycleLevel, corroborate_with: Option<&CycleRef>) -> Option<String> {
        let l = level;
        let text = match self {
            RuleKind::TrancheEntry => format!(
                "AND(AT_LEAST(ELAPSED({l}), $min_day), AT_LEAST(SCORE({l}), 2), \
                 NOT(PAST_MIDPOINT(PARENT({l}))), NOT(FAILED(PARENT({l}))))"
            ),
            RuleKind::ScaleOutPartial => format!(
                "AND(OR(TRANSLATION({l}, LEFT), FAILED({l})), PAST_MIDPOINT(PARENT({l})), \
                 AT_LEAST(GAIN(PARENT({l})), $stretch_pct))"
            ),
            RuleKind::ScaleOutFull => {
                let corroboration = match corroborate_with {
                    Some(c) => format!("OR(TRANSLATION({c}, LEFT), FAILED({c}))"),
                    None => format!("FLAG({})", CORROBORATION_FLAG),
                };
                format!(
                    "AND(OR(AT_LEAST(WEAK_STREAK({l}), 2), \
                     AT_LEAST(ELAPSED(PARENT({l})), $terminal_day)), {corroboration})"
                )
            }
            RuleKind::HardStop => "BELOW(close, $floor)".to_string(),
            RuleKind::PhaseTransitionEntry => format!(
                "AND(FLAG(drawdown_confirmed), FLAG(policy_easing_confirmed), \
                 NEW_LOW({l}), FLAG(volatility_rank_ok))"
            ),
            RuleKind::Custom => return None,
        };
        Some(text)
    }

    /// Parse the kind's template into a condition.
    pub fn condition(
        self,
        level: CycleLevel,
        corroborate_with: Option<&CycleRef>,
    ) -> Result<Option<Rule>, CycleError> {
        match self.template(level, corroborate_with) {
            Some(text) => Ok(Some(rule_parser::parse(&text)?)),
            None => Ok(None),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleSpec {
    pub id: String,
    pub kind: RuleKind,
    /// Empty targets every instrument that tracks `level`.
    pub instruments: Vec<String>,
    pub level: CycleLevel,
    pub condition: Rule,
    pub params: BTreeMap<String, f64>,
    pub severity: Severity,
    pub action: SignalAction,
    pub account: Option<String>,
}

impl RuleSpec {
    /// Rule of a built-in kind with its default action and severity.
    pub fn builtin(
        id: &str,
        kind: RuleKind,
        level: CycleLevel,
        params: BTreeMap<String, f64>,
    ) -> Result<Self, CycleError> {
        let condition = kind.condition(level, None)?.ok_or_else(|| CycleError::RuleInvalid {
            rule: id.to_string(),
            reason: "custom rules need an explicit condition".to_string(),
        })?;
        Ok(Self {
            id: id.to_string(),
            kind,
            instruments: Vec::new(),
            level,
            condition,
            params,
            severity: kind.default_severity(),
            action: kind.default_action(),
            account: None,
        })
    }

    pub fn targets(&self, registry: &Registry) -> Vec<String> {
        if self.instruments.is_empty() {
            registry
                .instruments()
                .filter(|i| i.level(self.level).is_some())
                .map(|i| i.id.clone())
                .collect()
        } else {
            self.instruments.clone()
        }
    }

    pub fn with_instruments(mut self, instruments: &[&str]) -> Self {
        self.instruments = instruments.iter().map(|s| s.to_uppercase()).collect();
        self
    }

    pub fn with_account(mut self, account: &str) -> Self {
        self.account = Some(account.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub rule_id: String,
    pub instrument: String,
    pub level: CycleLevel,
    /// Position of the triggering bar in the instrument's feed.
    pub bar_index: usize,
    pub timestamp: NaiveDateTime,
    pub action: SignalAction,
    pub severity: Severity,
    /// Suggested action parameters: the rule's params plus the triggering close.
    pub payload: BTreeMap<String, f64>,
}

impl Signal {
    pub fn key(&self) -> String {
        signal_key(&self.rule_id, &self.instrument)
    }
}

pub fn signal_key(rule_id: &str, instrument: &str) -> String {
    format!("{}|{}", rule_id, instrument)
}

/// Previous truth value per (rule, instrument).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeBook {
    pub by_rule: BTreeMap<String, BTreeMap<String, bool>>,
}

impl EdgeBook {
    /// Record `now`; true only on a false-to-true transition.
    pub fn observe(&mut self, rule_id: &str, instrument: &str, now: bool) -> bool {
        let previous = self
            .by_rule
            .entry(rule_id.to_string())
            .or_default()
            .insert(instrument.to_string(), now)
            .unwrap_or(false);
        now && !previous
    }

    pub fn get(&self, rule_id: &str, instrument: &str) -> Option<bool> {
        self.by_rule.get(rule_id)?.get(instrument).copied()
    }
}

#[derive(Debug)]
pub struct RuleFailure {
    pub rule_id: String,
    pub instrument: String,
    pub error: CycleError,
}

#[derive(Debug, Default)]
pub struct RuleOutcome {
    pub signals: Vec<Signal>,
    /// `ConstraintViolation` errors for Entry signals the account disallows.
    pub violations: Vec<CycleError>,
    pub failures: Vec<RuleFailure>,
}

pub struct RuleInputs<'a> {
    pub states: &'a BTreeMap<String, InstrumentState>,
    pub registry: &'a Registry,
    pub portfolio: &'a PortfolioSnapshot,
    pub flags: &'a ExternalFlags,
}

/// Evaluate every rule for each targeted instrument in `advanced`.
///
/// A failing rule leaves its edge memory untouched and never fires; the other
/// rules are unaffected. A withheld Entry still consumes its edge, so the
/// violation is reported once per transition.
pub fn evaluate_rules(
    rules: &[RuleSpec],
    advanced: &BTreeSet<String>,
    inputs: &RuleInputs,
    edges: &mut EdgeBook,
) -> RuleOutcome {
    let mut outcome = RuleOutcome::default();

    for spec in rules {
        for instrument in spec.targets(inputs.registry) {
            if !advanced.contains(&instrument) {
                continue;
            }
            let ctx = EvalContext {
                rule_id: &spec.id,
                instrument: &instrument,
                states: inputs.states,
                registry: inputs.registry,
                params: &spec.params,
                portfolio: inputs.portfolio,
                account: spec.account.as_deref(),
                flags: inputs.flags,
            };
            let now = match rule_eval::evaluate_checked(&spec.condition, &ctx) {
                Ok(v) => v,
                Err(error) => {
                    warn!(rule = %spec.id, instrument = %instrument, error = %error, "rule failed closed");
                    outcome.failures.push(RuleFailure {
                        rule_id: spec.id.clone(),
                        instrument: instrument.clone(),
                        error,
                    });
                    continue;
                }
            };
            if !edges.observe(&spec.id, &instrument, now) {
                continue;
            }

            let Some(bar) = inputs
                .states
                .get(&instrument)
                .and_then(InstrumentState::last_bar)
            else {
                continue;
            };
            let bar_index = inputs
                .states
                .get(&instrument)
                .and_then(InstrumentState::last_feed_index)
                .unwrap_or(0);

            if spec.action == SignalAction::Entry {
                if let Some(violation) = constraint_violation(spec, &instrument, inputs.portfolio) {
                    warn!(rule = %spec.id, instrument = %instrument, "entry blocked by account constraint");
                    outcome.violations.push(violation);
                    continue;
                }
            }

            let mut payload = spec.params.clone();
            payload.insert("close".to_string(), bar.close);
            debug!(rule = %spec.id, instrument = %instrument, bar_index, "rule fired");
            outcome.signals.push(Signal {
                rule_id: spec.id.clone(),
                instrument: instrument.clone(),
                level: spec.level,
                bar_index,
                timestamp: bar.timestamp,
                action: spec.action,
                severity: spec.severity,
                payload,
            });
        }
    }
    outcome
}

fn constraint_violation(
    spec: &RuleSpec,
    instrument: &str,
    portfolio: &PortfolioSnapshot,
) -> Option<CycleError> {
    let account = spec.account.as_deref()?;
    let state = portfolio.account(account)?;
    if state.allows(instrument) {
        return None;
    }
    Some(CycleError::ConstraintViolation {
        rule: spec.id.clone(),
        instrument: instrument.to_string(),
        account: account.to_string(),
    })
}

/// Fired signals awaiting acknowledgement, keyed by (rule, instrument).
pub fn record_active(active: &mut BTreeMap<String, Signal>, signal: &Signal) {
    active.insert(signal.key(), signal.clone());
}

pub fn acknowledge(active: &mut BTreeMap<String, Signal>, rule_id: &str, instrument: &str) -> bool {
    active
        .remove(&signal_key(rule_id, &instrument.to_uppercase()))
        .is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::account::AccountState;
    use crate::domain::instrument::{ExpectedWindow, Instrument, LevelConfig};
    use crate::domain::ohlcv::OhlcvBar;
    use chrono::{Duration, NaiveDate};

    fn registry() -> Registry {
        Registry::new(vec![
            Instrument::new("GLD", "USD").with_level(LevelConfig::new(
                CycleLevel::Short,
                ExpectedWindow::new(22, 28).unwrap(),
            )),
            Instrument::new("SLV", "USD").with_level(LevelConfig::new(
                CycleLevel::Short,
                ExpectedWindow::new(22, 28).unwrap(),
            )),
        ])
    }

    fn state_with_closes(closes: &[f64]) -> InstrumentState {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        InstrumentState {
            bars: closes
                .iter()
                .enumerate()
                .map(|(i, &c)| OhlcvBar {
                    instrument: "GLD".into(),
                    timestamp: start + Duration::days(i as i64),
                    open: c,
                    high: c,
                    low: c,
                    close: c,
                    volume: 1,
                })
                .collect(),
            ..InstrumentState::default()
        }
    }

    fn hard_stop() -> RuleSpec {
        let mut params = BTreeMap::new();
        params.insert("floor".to_string(), 100.0);
        RuleSpec::builtin("stop", RuleKind::HardStop, CycleLevel::Short, params)
            .unwrap()
            .with_instruments(&["GLD"])
    }

    fn run(
        rules: &[RuleSpec],
        states: &BTreeMap<String, InstrumentState>,
        portfolio: &PortfolioSnapshot,
        edges: &mut EdgeBook,
    ) -> RuleOutcome {
        let registry = registry();
        let flags = ExternalFlags::new();
        let advanced: BTreeSet<String> = states.keys().cloned().collect();
        evaluate_rules(
            rules,
            &advanced,
            &RuleInputs {
                states,
                registry: &registry,
                portfolio,
                flags: &flags,
            },
            edges,
        )
    }

    #[test]
    fn edge_book_fires_on_rising_edge_only() {
        let mut edges = EdgeBook::default();
        assert!(!edges.observe("r", "GLD", false));
        assert!(edges.observe("r", "GLD", true));
        assert!(!edges.observe("r", "GLD", true));
        assert!(!edges.observe("r", "GLD", false));
        assert!(edges.observe("r", "GLD", true));
        assert!(edges.observe("r", "SLV", true));
    }

    #[test]
    fn hard_stop_fires_once_per_breach() {
        let rules = vec![hard_stop()];
        let portfolio = PortfolioSnapshot::default();
        let mut edges = EdgeBook::default();
        let mut closes = vec![101.0];
        let mut fired = Vec::new();
        for close in [99.0, 98.0, 97.0, 96.0, 102.0, 99.5] {
            closes.push(close);
            let mut states = BTreeMap::new();
            states.insert("GLD".to_string(), state_with_closes(&closes));
            fired.push(run(&rules, &states, &portfolio, &mut edges).signals.len());
        }
        assert_eq!(fired, vec![1, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn signal_carries_payload_and_severity() {
        let rules = vec![hard_stop()];
        let mut states = BTreeMap::new();
        states.insert("GLD".to_string(), state_with_closes(&[101.0, 99.0]));
        let out = run(&rules, &states, &PortfolioSnapshot::default(), &mut EdgeBook::default());
        let signal = &out.signals[0];
        assert_eq!(signal.severity, Severity::Critical);
        assert_eq!(signal.action, SignalAction::Exit);
        assert_eq!(signal.bar_index, 1);
        assert_eq!(signal.payload["close"], 99.0);
        assert_eq!(signal.payload["floor"], 100.0);
        assert_eq!(signal.key(), "stop|GLD");
    }

    #[test]
    fn missing_param_fails_closed_without_touching_edges() {
        let mut rule = hard_stop();
        rule.params.clear();
        let mut states = BTreeMap::new();
        states.insert("GLD".to_string(), state_with_closes(&[99.0]));
        let mut edges = EdgeBook::default();
        let out = run(&[rule, hard_stop()], &states, &PortfolioSnapshot::default(), &mut edges);
        assert_eq!(out.failures.len(), 1);
        assert!(out.failures[0].error.is_configuration());
        // The second, well-formed rule shares the id but is evaluated independently.
        assert_eq!(out.signals.len(), 1);
    }

    #[test]
    fn disallowed_entry_raises_violation() {
        let mut params = BTreeMap::new();
        params.insert("floor".to_string(), 100.0);
        let mut rule = RuleSpec::builtin("buy_dip", RuleKind::HardStop, CycleLevel::Short, params)
            .unwrap()
            .with_instruments(&["GLD"])
            .with_account("taxable");
        rule.action = SignalAction::Entry;

        let mut taxable = AccountState::new("taxable");
        taxable.disallowed.insert("GLD".into());
        let portfolio = PortfolioSnapshot::new(vec![taxable]);

        let mut states = BTreeMap::new();
        states.insert("GLD".to_string(), state_with_closes(&[99.0]));
        let out = run(&[rule], &states, &portfolio, &mut EdgeBook::default());
        assert!(out.signals.is_empty());
        assert!(matches!(
            out.violations[0],
            CycleError::ConstraintViolation { ref account, .. } if account == "taxable"
        ));
    }

    #[test]
    fn untouched_instruments_are_skipped() {
        let rules = vec![hard_stop()];
        let mut states = BTreeMap::new();
        states.insert("GLD".to_string(), state_with_closes(&[99.0]));
        let registry = registry();
        let flags = ExternalFlags::new();
        let portfolio = PortfolioSnapshot::default();
        let mut edges = EdgeBook::default();
        let out = evaluate_rules(
            &rules,
            &BTreeSet::new(),
            &RuleInputs {
                states: &states,
                registry: &registry,
                portfolio: &portfolio,
                flags: &flags,
            },
            &mut edges,
        );
        assert!(out.signals.is_empty());
        assert_eq!(edges.get("stop", "GLD"), None);
    }

    #[test]
    fn templates_parse_for_every_builtin() {
        for kind in [
            RuleKind::TrancheEntry,
            RuleKind::ScaleOutPartial,
            RuleKind::ScaleOutFull,
            RuleKind::HardStop,
            RuleKind::PhaseTransitionEntry,
        ] {
            assert!(kind.condition(CycleLevel::Short, None).unwrap().is_some());
        }
        assert!(RuleKind::Custom.condition(CycleLevel::Short, None).unwrap().is_none());
    }

    #[test]
    fn scale_out_full_corroboration() {
        let with_flag = RuleKind::ScaleOutFull.template(CycleLevel::Short, None).unwrap();
        assert!(with_flag.ends_with("FLAG(cross_asset_corroboration))"));
        let slv = CycleRef::on("slv", CycleLevel::Medium);
        let with_cycle = RuleKind::ScaleOutFull
            .template(CycleLevel::Short, Some(&slv))
            .unwrap();
        assert!(with_cycle.contains("OR(TRANSLATION(SLV:medium, LEFT), FAILED(SLV:medium))"));
        let rule = rule_parser::parse(&with_cycle).unwrap();
        assert!(rule.referenced_instruments().contains("SLV"));
    }

    #[test]
    fn default_targets_follow_level() {
        let spec = RuleSpec::builtin("stop", RuleKind::HardStop, CycleLevel::Short, BTreeMap::new())
            .unwrap();
        assert_eq!(spec.targets(&registry()), vec!["GLD".to_string(), "SLV".to_string()]);
        let medium = RuleSpec {
            level: CycleLevel::Medium,
            ..spec
        };
        assert!(medium.targets(&registry()).is_empty());
    }

    #[test]
    fn acknowledge_removes_active_signal() {
        let rules = vec![hard_stop()];
        let mut states = BTreeMap::new();
        states.insert("GLD".to_string(), state_with_closes(&[99.0]));
        let out = run(&rules, &states, &PortfolioSnapshot::default(), &mut EdgeBook::default());
        let mut active = BTreeMap::new();
        record_active(&mut active, &out.signals[0]);
        assert!(acknowledge(&mut active, "stop", "gld"));
        assert!(!acknowledge(&mut active, "stop", "GLD"));
    }
}
