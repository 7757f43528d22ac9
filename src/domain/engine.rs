//! Tick pipeline.
//!
//! Per tick:
//! 1. Each instrument with new bars is processed independently (in parallel):
//!    bars are validated and appended, indicators computed once, then every
//!    level's tracker advances bar by bar, the current candidate is rescored
//!    and confirmed when actionable. Old bars beyond the history limit are
//!    dropped.
//! 2. Rules run over the completed per-instrument states (live ticks only).
//! 3. Alerts are gated against a copy of the rate-limit book.
//! 4. The next snapshot and its transitions are staged and persisted. A
//!    failed write discards the tick: nothing is committed or sent.
//! 5. The staged tick is committed and admitted alerts are delivered.
//!
//! A live batch holding several bars per instrument runs as one tick per
//! bar, so every bar gets its own rule pass. Backfill runs the whole history
//! as one tick with no rules and no alerts.

use crate::domain::account::{ExternalFlags, PortfolioSnapshot};
use crate::domain::alert::{Alert, AlertDispatcher, DedupKey, Severity};
use crate::domain::confirmation::{score_candidate, ConfirmationState, ScorerParams};
use crate::domain::cycle::{Cycle, CyclePhase};
use crate::domain::cycle_tracker::{CycleTracker, TrackerEvent, TrackerState};
use crate::domain::error::CycleError;
use crate::domain::indicator_helpers::compute_indicators;
use crate::domain::instrument::{CycleLevel, Instrument};
use crate::domain::ohlcv::OhlcvBar;
use crate::domain::settings::Settings;
use crate::domain::signal::{self, evaluate_rules, RuleFailure, RuleInputs, Signal};
use crate::domain::state_store::{
    InstrumentState, StagedTick, StateSnapshot, StateStore, TransitionKind, TransitionRecord,
};
use crate::ports::alert_port::AlertPort;
use crate::ports::persistence_port::PersistencePort;
use chrono::NaiveDateTime;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, info, warn};

/// Read-only inputs supplied with each live tick.
pub struct TickInputs<'a> {
    pub portfolio: &'a PortfolioSnapshot,
    pub flags: &'a ExternalFlags,
}

/// Collaborators touched around the commit.
pub struct Boundary<'a> {
    pub sink: &'a dyn AlertPort,
    pub persistence: Option<&'a dyn PersistencePort>,
}

#[derive(Debug, Default)]
pub struct TickReport {
    pub tick: u64,
    /// Bars appended per instrument.
    pub accepted: BTreeMap<String, usize>,
    pub data_issues: Vec<CycleError>,
    pub signals: Vec<Signal>,
    pub violations: Vec<CycleError>,
    pub rule_failures: Vec<RuleFailure>,
    pub alerts: Vec<Alert>,
    pub transitions: Vec<TransitionRecord>,
    pub degraded: Vec<String>,
    /// False when the tick was discarded because persisting it failed.
    pub committed: bool,
    pub persistence_error: Option<CycleError>,
}

impl TickReport {
    /// Fold the report of the next bar step into this one.
    fn absorb(&mut self, step: TickReport) {
        self.tick = step.tick;
        for (id, n) in step.accepted {
            *self.accepted.entry(id).or_default() += n;
        }
        self.data_issues.extend(step.data_issues);
        self.signals.extend(step.signals);
        self.violations.extend(step.violations);
        self.rule_failures.extend(step.rule_failures);
        self.alerts.extend(step.alerts);
        self.transitions.extend(step.transitions);
        for id in step.degraded {
            if !self.degraded.contains(&id) {
                self.degraded.push(id);
            }
        }
        self.committed = step.committed;
        if step.persistence_error.is_some() {
            self.persistence_error = step.persistence_error;
        }
    }
}

/// Query view of one (instrument, level).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleStatus {
    pub instrument: String,
    pub level: CycleLevel,
    pub cycle: Option<Cycle>,
    pub phase: Option<CyclePhase>,
    pub candidate: Option<usize>,
    pub score: u8,
    pub weak_streak: usize,
    pub closed_cycles: usize,
    /// Feed position of bar 0 in the retained window; add it to any index
    /// above to get a position in the whole feed.
    pub bar_offset: usize,
    /// The last tick failed for this instrument; values are last known good.
    pub degraded: bool,
    pub last_error: Option<String>,
}

struct LevelEvent {
    level: CycleLevel,
    /// Feed position of the bar that raised the event.
    index: usize,
    timestamp: NaiveDateTime,
    event: TrackerEvent,
}

struct InstrumentDelta {
    id: String,
    state: InstrumentState,
    accepted: usize,
    issues: Vec<CycleError>,
    events: Vec<LevelEvent>,
    errors: Vec<CycleError>,
}

pub struct Engine {
    settings: Settings,
    store: StateStore,
    dispatcher: AlertDispatcher,
}

impl Engine {
    pub fn new(settings: Settings) -> Self {
        Self::with_snapshot(settings, StateSnapshot::default())
    }

    /// Resume from a snapshot, including its rate-limit counters.
    pub fn with_snapshot(settings: Settings, snapshot: StateSnapshot) -> Self {
        let dispatcher = AlertDispatcher::new(settings.alert_policy, snapshot.rate_limits.clone());
        Self {
            settings,
            store: StateStore::from_snapshot(snapshot),
            dispatcher,
        }
    }

    pub fn resume(settings: Settings, persistence: &dyn PersistencePort) -> Result<Self, CycleError> {
        let snapshot = persistence.read_last_state()?.unwrap_or_default();
        info!(tick = snapshot.tick, instruments = snapshot.instruments.len(), "state restored");
        Ok(Self::with_snapshot(settings, snapshot))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn snapshot(&self) -> &StateSnapshot {
        self.store.snapshot()
    }

    /// Transitions committed by this engine instance.
    pub fn transitions(&self) -> &[TransitionRecord] {
        self.store.log()
    }

    pub fn last_timestamp(&self, instrument: &str) -> Option<NaiveDateTime> {
        self.snapshot()
            .instruments
            .get(instrument)
            .and_then(InstrumentState::last_bar)
            .map(|b| b.timestamp)
    }

    /// Build cycle state from history. Evaluates no rules and sends no alerts.
    pub fn backfill(
        &mut self,
        history: &BTreeMap<String, Vec<OhlcvBar>>,
        persistence: Option<&dyn PersistencePort>,
    ) -> TickReport {
        let report = self.run(history, None, persistence);
        if !report.committed {
            return report;
        }
        info!(
            tick = report.tick,
            bars = report.accepted.values().sum::<usize>(),
            transitions = report.transitions.len(),
            "backfill complete"
        );
        report
    }

    /// Apply new bars and evaluate rules. Several bars for one instrument
    /// run as consecutive ticks, one bar each; the batch stops at the first
    /// tick that cannot be persisted.
    pub fn tick(
        &mut self,
        new_bars: &BTreeMap<String, Vec<OhlcvBar>>,
        inputs: &TickInputs,
        boundary: &Boundary,
    ) -> TickReport {
        let mut steps = bar_steps(new_bars).into_iter();
        let Some(first) = steps.next() else {
            return self.run(new_bars, Some((inputs, boundary.sink)), boundary.persistence);
        };
        let mut report = self.run(&first, Some((inputs, boundary.sink)), boundary.persistence);
        for step in steps {
            if !report.committed {
                break;
            }
            let next = self.run(&step, Some((inputs, boundary.sink)), boundary.persistence);
            report.absorb(next);
        }
        report
    }

    fn run(
        &mut self,
        bars: &BTreeMap<String, Vec<OhlcvBar>>,
        live: Option<(&TickInputs, &dyn AlertPort)>,
        persistence: Option<&dyn PersistencePort>,
    ) -> TickReport {
        let settings = &self.settings;
        let current = self.store.snapshot();
        let mut report = TickReport {
            tick: current.tick + 1,
            ..TickReport::default()
        };

        for id in bars.keys() {
            if settings.registry.get(id).is_none() {
                warn!(instrument = %id, "bars for unknown instrument ignored");
                report.data_issues.push(CycleError::DataQuality {
                    instrument: id.clone(),
                    reason: "instrument is not configured".to_string(),
                });
            }
        }

        let instruments: Vec<&Instrument> = settings.registry.instruments().collect();
        let deltas: Vec<InstrumentDelta> = instruments
            .par_iter()
            .filter_map(|instrument| {
                let incoming = bars.get(&instrument.id).filter(|b| !b.is_empty())?;
                Some(process_instrument(
                    instrument,
                    &settings.scorer(&instrument.id),
                    current.instruments.get(&instrument.id),
                    incoming,
                    settings.history_bars,
                ))
            })
            .collect();

        let mut next = current.clone();
        next.tick = report.tick;
        let mut transitions = Vec::new();
        let mut alerts = Vec::new();
        let mut advanced = BTreeSet::new();

        for delta in deltas {
            let InstrumentDelta {
                id,
                mut state,
                accepted,
                issues,
                events,
                errors,
            } = delta;
            report.data_issues.extend(issues);
            if accepted > 0 {
                advanced.insert(id.clone());
                report.accepted.insert(id.clone(), accepted);
            }

            for LevelEvent {
                level,
                index,
                timestamp,
                event,
            } in &events
            {
                transitions.push(transition_for(&id, *level, *timestamp, event));
                if live.is_some() {
                    if let Some(alert) = alert_for(&id, *level, *index, *timestamp, event) {
                        alerts.push(alert);
                    }
                }
            }

            let was_degraded = current.instruments.get(&id).is_some_and(|s| s.degraded);
            let at = state.last_bar().map(|b| b.timestamp).unwrap_or_default();
            if errors.is_empty() {
                if was_degraded {
                    info!(instrument = %id, "instrument recovered");
                    transitions.push(TransitionRecord::new(at, &id, None, TransitionKind::Recovered, String::new()));
                }
                state.degraded = false;
                state.last_error = None;
            } else {
                let message = errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; ");
                error!(instrument = %id, error = %message, "instrument degraded");
                if !was_degraded {
                    transitions.push(TransitionRecord::new(
                        at,
                        &id,
                        None,
                        TransitionKind::Degraded,
                        message.clone(),
                    ));
                }
                state.degraded = true;
                state.last_error = Some(message);
                report.degraded.push(id.clone());
            }
            next.instruments.insert(id, state);
        }

        let mut outcome = None;
        if let Some((inputs, _)) = live {
            let evaluated = evaluate_rules(
                &settings.rules,
                &advanced,
                &RuleInputs {
                    states: &next.instruments,
                    registry: &settings.registry,
                    portfolio: inputs.portfolio,
                    flags: inputs.flags,
                },
                &mut next.edges,
            );

            for fired in &evaluated.signals {
                signal::record_active(&mut next.active_signals, fired);
                transitions.push(TransitionRecord::new(
                    fired.timestamp,
                    &fired.instrument,
                    Some(fired.level),
                    TransitionKind::SignalFired,
                    format!("rule {} {}", fired.rule_id, fired.action),
                ));
                alerts.push(Alert::new(
                    DedupKey::new(&fired.rule_id, &fired.instrument),
                    fired.severity,
                    fired.timestamp,
                    fired.bar_index,
                    format!(
                        "{} {} signal for {} at close {:.2}",
                        fired.rule_id,
                        fired.action,
                        fired.instrument,
                        fired.payload.get("close").copied().unwrap_or(f64::NAN)
                    ),
                ));
            }

            for violation in &evaluated.violations {
                let CycleError::ConstraintViolation {
                    rule, instrument, ..
                } = violation
                else {
                    continue;
                };
                let state = next.instruments.get(instrument);
                let at = state.and_then(InstrumentState::last_bar).map(|b| b.timestamp).unwrap_or_default();
                let index = state.and_then(InstrumentState::last_feed_index).unwrap_or(0);
                transitions.push(TransitionRecord::new(
                    at,
                    instrument,
                    None,
                    TransitionKind::ConstraintViolation,
                    violation.to_string(),
                ));
                alerts.push(Alert::new(
                    DedupKey::new(&format!("CONSTRAINT_VIOLATION_{}", rule), instrument),
                    Severity::Critical,
                    at,
                    index,
                    violation.to_string(),
                ));
            }

            outcome = Some(evaluated);
        }

        let mut book = self.dispatcher.book();
        let gated: Vec<Alert> = alerts
            .into_iter()
            .map(|alert| self.dispatcher.gate_with(&mut book, alert))
            .collect();
        next.rate_limits = book.clone();
        let staged = self.store.stage(next, transitions);

        if let Some(port) = persistence {
            if let Err(e) = persist(port, &staged) {
                error!(tick = report.tick, error = %e, "persisting state failed; tick discarded");
                report.persistence_error = Some(e);
                report.accepted.clear();
                report.degraded.clear();
                if let Some(outcome) = outcome {
                    report.rule_failures = outcome.failures;
                }
                return report;
            }
        }

        report.transitions = self.store.commit(staged);
        report.committed = true;
        self.dispatcher.restore(book);
        if let Some(outcome) = outcome {
            report.signals = outcome.signals;
            report.violations = outcome.violations;
            report.rule_failures = outcome.failures;
        }
        debug!(tick = report.tick, transitions = report.transitions.len(), "tick committed");

        if let Some((_, sink)) = live {
            report.alerts = gated
                .into_iter()
                .map(|alert| self.dispatcher.deliver(alert, sink))
                .collect();
            self.store.record_alerts(&report.alerts);
            if let Some(port) = persistence.filter(|_| !report.alerts.is_empty()) {
                // Delivery outcomes only; the tick itself is already durable.
                if let Err(e) = port.overwrite_current_state(self.store.snapshot()) {
                    error!(tick = report.tick, error = %e, "persisting alert outcomes failed");
                    report.persistence_error = Some(e);
                }
            }
        }
        report
    }

    pub fn get_cycle_state(&self, instrument: &str, level: CycleLevel) -> Option<CycleStatus> {
        let instrument = instrument.to_uppercase();
        self.settings.registry.level(&instrument, level)?;
        let state = self.snapshot().instruments.get(&instrument);
        let tracker = state.and_then(|s| s.levels.get(&level));
        let cycle = tracker.and_then(|t| t.open.clone());
        Some(CycleStatus {
            phase: cycle.as_ref().map(Cycle::phase),
            candidate: tracker.and_then(|t| t.candidate),
            score: state.map_or(0, |s| s.score(level)),
            weak_streak: tracker.map_or(0, TrackerState::weak_streak),
            closed_cycles: tracker.map_or(0, |t| t.closed.len()),
            bar_offset: state.map_or(0, |s| s.bar_offset),
            degraded: state.is_some_and(|s| s.degraded),
            last_error: state.and_then(|s| s.last_error.clone()),
            instrument,
            level,
            cycle,
        })
    }

    /// Most recent current confirmation across levels; ties go to the
    /// shorter level.
    pub fn get_confirmation_score(&self, instrument: &str) -> Option<&ConfirmationState> {
        let state = self.snapshot().instruments.get(&instrument.to_uppercase())?;
        CycleLevel::ALL
            .iter()
            .filter_map(|level| state.current_confirmation(*level))
            .max_by(|a, b| {
                a.candidate_index
                    .cmp(&b.candidate_index)
                    .then(b.level.cmp(&a.level))
            })
    }

    pub fn get_active_signals(&self) -> Vec<&Signal> {
        self.snapshot().active_signals.values().collect()
    }

    pub fn acknowledge_signal(
        &mut self,
        rule_id: &str,
        instrument: &str,
        persistence: Option<&dyn PersistencePort>,
    ) -> Result<bool, CycleError> {
        let instrument = instrument.to_uppercase();
        let at = self
            .last_timestamp(&instrument)
            .unwrap_or_else(|| chrono::Utc::now().naive_utc());
        let Some(staged) = self.store.stage_acknowledge(rule_id, &instrument, at) else {
            return Ok(false);
        };
        if let Some(port) = persistence {
            persist(port, &staged)?;
        }
        self.store.commit(staged);
        info!(rule = %rule_id, %instrument, "signal acknowledged");
        Ok(true)
    }
}

/// Write a staged tick: transitions first, then the snapshot that counts them.
/// Sequence numbers are reused on retry, so a partial append is overwritten.
fn persist(port: &dyn PersistencePort, staged: &StagedTick) -> Result<(), CycleError> {
    for record in &staged.transitions {
        port.append_transition(record)?;
    }
    port.overwrite_current_state(&staged.snapshot)
}

/// Split a batch into steps holding at most one bar per instrument, the k-th
/// bar of each instrument in step k.
fn bar_steps(bars: &BTreeMap<String, Vec<OhlcvBar>>) -> Vec<BTreeMap<String, Vec<OhlcvBar>>> {
    let depth = bars.values().map(Vec::len).max().unwrap_or(0);
    (0..depth)
        .map(|k| {
            bars.iter()
                .filter_map(|(id, list)| list.get(k).map(|bar| (id.clone(), vec![bar.clone()])))
                .collect()
        })
        .collect()
}

fn process_instrument(
    instrument: &Instrument,
    scorer: &ScorerParams,
    prior: Option<&InstrumentState>,
    incoming: &[OhlcvBar],
    history_bars: usize,
) -> InstrumentDelta {
    let mut state = prior.cloned().unwrap_or_default();
    let mut delta = InstrumentDelta {
        id: instrument.id.clone(),
        state: InstrumentState::default(),
        accepted: 0,
        issues: Vec::new(),
        events: Vec::new(),
        errors: Vec::new(),
    };

    for bar in incoming {
        if let Some(last) = state.last_bar() {
            if bar.timestamp <= last.timestamp {
                let issue = CycleError::DataQuality {
                    instrument: instrument.id.clone(),
                    reason: format!(
                        "bar at {} is not after {}; ignored",
                        bar.timestamp, last.timestamp
                    ),
                };
                warn!(instrument = %instrument.id, error = %issue, "duplicate or out-of-order bar");
                delta.issues.push(issue);
                continue;
            }
        }
        if let Some(reason) = bar.sanity_issue() {
            let issue = CycleError::DataQuality {
                instrument: instrument.id.clone(),
                reason: format!("bar at {}: {}", bar.timestamp, reason),
            };
            warn!(instrument = %instrument.id, error = %issue, "malformed bar");
            delta.issues.push(issue);
            continue;
        }
        let mut bar = bar.clone();
        bar.instrument = instrument.id.clone();
        state.bars.push(bar);
        delta.accepted += 1;
    }

    if delta.accepted > 0 {
        advance_levels(instrument, scorer, &mut state, &mut delta);
        let lookback = instrument.levels.values().map(|c| c.lookback).max().unwrap_or(0);
        let dropped = state.trim_history(history_bars, scorer.history_margin() + lookback);
        if dropped > 0 {
            debug!(instrument = %instrument.id, dropped, offset = state.bar_offset, "bar history trimmed");
        }
    }
    delta.state = state;
    delta
}

fn advance_levels(
    instrument: &Instrument,
    scorer: &ScorerParams,
    state: &mut InstrumentState,
    delta: &mut InstrumentDelta,
) {
    let indicators = compute_indicators(&state.bars, &scorer.indicator_types());
    let InstrumentState {
        bars,
        bar_offset,
        levels,
        confirmations,
        ..
    } = state;
    let offset = *bar_offset;
    let bars: &[OhlcvBar] = bars;
    let event_at = |level, i: usize, event| LevelEvent {
        level,
        index: offset + i,
        timestamp: bars[i].timestamp,
        event,
    };

    for (level, config) in &instrument.levels {
        let level = *level;
        let tracker = match CycleTracker::new(&instrument.id, config, instrument.children_of(level)) {
            Ok(t) => t,
            Err(e) => {
                delta.errors.push(e);
                continue;
            }
        };
        let tracked = levels.entry(level).or_insert_with(|| TrackerState::new(level));

        if tracked.open.is_none() {
            if let Some(event) = tracker.seed(tracked, bars) {
                let index = tracked.last_index.unwrap_or(0);
                delta.events.push(event_at(level, index, event));
            }
        }
        let from = tracked.last_index.map_or(0, |last| last + 1);

        for i in from..bars.len() {
            for event in tracker.advance(tracked, bars, i) {
                delta.events.push(event_at(level, i, event));
            }
            let Some(candidate) = tracked.candidate.filter(|&c| c < i) else {
                continue;
            };
            let checks = score_candidate(&bars[..=i], candidate, scorer, &indicators);
            let confirmation = ConfirmationState::new(&instrument.id, level, candidate, i, checks);
            let actionable = confirmation.is_actionable();
            confirmations.insert(level, confirmation);
            if actionable {
                debug!(instrument = %instrument.id, %level, candidate, score = checks.score(), "low confirmed");
                for event in tracker.confirm_low(tracked, bars, candidate, i) {
                    delta.events.push(event_at(level, i, event));
                }
            }
        }
    }
}

fn transition_for(
    instrument: &str,
    level: CycleLevel,
    timestamp: NaiveDateTime,
    event: &TrackerEvent,
) -> TransitionRecord {
    let (kind, detail) = match event {
        TrackerEvent::Seeded {
            start_index,
            start_price,
        } => (
            TransitionKind::Seeded,
            format!("start {} at {}", start_index, start_price),
        ),
        TrackerEvent::HighConfirmed {
            high_index,
            translation,
        } => (
            TransitionKind::HighConfirmed,
            format!("high {} translation {}", high_index, translation),
        ),
        TrackerEvent::CycleFailed {
            index,
            close,
            previous_start,
        } => (
            TransitionKind::CycleFailed,
            format!("bar {} close {} below {}", index, close, previous_start),
        ),
        TrackerEvent::CandidateLow { index } => {
            (TransitionKind::CandidateLow, format!("bar {}", index))
        }
        TrackerEvent::Stale {
            elapsed,
            max,
            escalated,
        } => (
            TransitionKind::Stale,
            format!("elapsed {} max {} escalated {}", elapsed, max, escalated),
        ),
        TrackerEvent::CycleClosed {
            start_index,
            closed_at,
            translation,
            failed,
        } => (
            TransitionKind::CycleClosed,
            format!(
                "start {} closed {} translation {} failed {}",
                start_index, closed_at, translation, failed
            ),
        ),
        TrackerEvent::CycleOpened {
            start_index,
            confirmed_at,
        } => (
            TransitionKind::CycleOpened,
            format!("start {} confirmed {}", start_index, confirmed_at),
        ),
    };
    TransitionRecord::new(timestamp, instrument, Some(level), kind, detail)
}

fn alert_for(
    instrument: &str,
    level: CycleLevel,
    index: usize,
    timestamp: NaiveDateTime,
    event: &TrackerEvent,
) -> Option<Alert> {
    let (source, severity, message) = match event {
        TrackerEvent::CycleFailed {
            close,
            previous_start,
            ..
        } => (
            format!("CYCLE_FAILED_{}", level.tag()),
            Severity::Watch,
            format!(
                "{} {} cycle failed: close {:.2} below prior low {:.2}",
                instrument, level, close, previous_start
            ),
        ),
        TrackerEvent::Stale {
            elapsed,
            max,
            escalated,
        } => {
            let stale = CycleError::StaleCycle {
                instrument: instrument.to_string(),
                level: level.to_string(),
                elapsed: *elapsed,
                max: *max,
            };
            warn!(error = %stale, escalated, "stale cycle");
            let severity = if *escalated {
                Severity::Watch
            } else {
                Severity::Info
            };
            (format!("STALE_CYCLE_{}", level.tag()), severity, stale.to_string())
        }
        TrackerEvent::CycleOpened { start_index, .. } => (
            format!("NEW_CYCLE_{}", level.tag()),
            Severity::Info,
            format!(
                "{} new {} cycle from confirmed low at bar {}",
                instrument, level, start_index
            ),
        ),
        _ => return None,
    };
    Some(Alert::new(
        DedupKey::new(&source, instrument),
        severity,
        timestamp,
        index,
        message,
    ))
}
