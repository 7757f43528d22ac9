//! Current-state snapshot plus the append-only transition log.
//!
//! The engine builds the next snapshot from a clone of the current one,
//! numbers it with [`StateStore::stage`], persists the staged tick and only
//! then hands it to [`StateStore::commit`], so a tick's delta is applied
//! whole or not at all.

use crate::domain::alert::{Alert, RateLimitBook};
use crate::domain::confirmation::ConfirmationState;
use crate::domain::cycle_tracker::TrackerState;
use crate::domain::error::CycleError;
use crate::domain::instrument::CycleLevel;
use crate::domain::ohlcv::OhlcvBar;
use crate::domain::signal::{EdgeBook, Signal};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Delivered or suppressed alerts kept in the snapshot for inspection.
pub const RECENT_ALERT_LIMIT: usize = 64;

/// Transitions kept in memory; the durable log keeps everything.
pub const LOG_LIMIT: usize = 1024;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstrumentState {
    /// Retained bar window. Every stored index is a position in this window.
    pub bars: Vec<OhlcvBar>,
    /// Feed position of `bars[0]`; grows as old bars are dropped.
    #[serde(default)]
    pub bar_offset: usize,
    pub levels: BTreeMap<CycleLevel, TrackerState>,
    /// Latest evaluation per level; replaced whenever the candidate is rescored.
    pub confirmations: BTreeMap<CycleLevel, ConfirmationState>,
    /// Set when the last tick failed for this instrument; state is last known good.
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl InstrumentState {
    pub fn last_bar(&self) -> Option<&OhlcvBar> {
        self.bars.last()
    }

    pub fn last_index(&self) -> Option<usize> {
        self.bars.len().checked_sub(1)
    }

    /// Position of the last bar in the instrument's whole feed.
    pub fn last_feed_index(&self) -> Option<usize> {
        self.last_index().map(|i| i + self.bar_offset)
    }

    /// Drop bars from the front once the window exceeds `keep`, never past
    /// `margin` bars before the oldest index any tracker still refers to.
    /// Returns the number of bars dropped.
    pub fn trim_history(&mut self, keep: usize, margin: usize) -> usize {
        if self.bars.len() <= keep {
            return 0;
        }
        let anchor = self
            .levels
            .values()
            .filter_map(TrackerState::oldest_index)
            .min()
            .unwrap_or(self.bars.len());
        let drop = (self.bars.len() - keep).min(anchor.saturating_sub(margin));
        if drop == 0 {
            return 0;
        }

        self.bars.drain(..drop);
        self.bar_offset += drop;
        for tracker in self.levels.values_mut() {
            tracker.shift_back(drop);
        }
        // An evaluation older than the window refers to nothing current.
        self.confirmations.retain(|_, c| c.candidate_index >= drop);
        for confirmation in self.confirmations.values_mut() {
            confirmation.candidate_index -= drop;
            confirmation.evaluated_at = confirmation.evaluated_at.saturating_sub(drop);
        }
        drop
    }

    /// The level's evaluation if it refers to the current candidate or to the
    /// low that opened the current cycle.
    pub fn current_confirmation(&self, level: CycleLevel) -> Option<&ConfirmationState> {
        let confirmation = self.confirmations.get(&level)?;
        let tracker = self.levels.get(&level)?;
        let index = confirmation.candidate_index;
        let current = tracker.candidate == Some(index)
            || tracker.open.as_ref().is_some_and(|c| c.start_index == index);
        current.then_some(confirmation)
    }

    /// Score of the current confirmation; stale evaluations count as 0.
    pub fn score(&self, level: CycleLevel) -> u8 {
        self.current_confirmation(level).map_or(0, |c| c.score)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Seeded,
    HighConfirmed,
    CycleFailed,
    CandidateLow,
    Stale,
    CycleClosed,
    CycleOpened,
    SignalFired,
    ConstraintViolation,
    Degraded,
    Recovered,
    Acknowledged,
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransitionKind::Seeded => "seeded",
            TransitionKind::HighConfirmed => "high_confirmed",
            TransitionKind::CycleFailed => "cycle_failed",
            TransitionKind::CandidateLow => "candidate_low",
            TransitionKind::Stale => "stale",
            TransitionKind::CycleClosed => "cycle_closed",
            TransitionKind::CycleOpened => "cycle_opened",
            TransitionKind::SignalFired => "signal_fired",
            TransitionKind::ConstraintViolation => "constraint_violation",
            TransitionKind::Degraded => "degraded",
            TransitionKind::Recovered => "recovered",
            TransitionKind::Acknowledged => "acknowledged",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// Assigned at commit; strictly increasing across the log.
    pub seq: u64,
    pub tick: u64,
    pub timestamp: NaiveDateTime,
    pub instrument: String,
    pub level: Option<CycleLevel>,
    pub kind: TransitionKind,
    pub detail: String,
}

impl TransitionRecord {
    pub fn new(
        timestamp: NaiveDateTime,
        instrument: &str,
        level: Option<CycleLevel>,
        kind: TransitionKind,
        detail: String,
    ) -> Self {
        Self {
            seq: 0,
            tick: 0,
            timestamp,
            instrument: instrument.to_string(),
            level,
            kind,
            detail,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub instruments: BTreeMap<String, InstrumentState>,
    pub edges: EdgeBook,
    pub active_signals: BTreeMap<String, Signal>,
    pub recent_alerts: Vec<Alert>,
    pub rate_limits: RateLimitBook,
    pub tick: u64,
    pub next_seq: u64,
}

impl StateSnapshot {
    pub fn to_json(&self) -> Result<String, CycleError> {
        serde_json::to_string(self).map_err(|e| CycleError::Persistence {
            reason: format!("encode snapshot: {}", e),
        })
    }

    pub fn from_json(json: &str) -> Result<Self, CycleError> {
        serde_json::from_str(json).map_err(|e| CycleError::Persistence {
            reason: format!("decode snapshot: {}", e),
        })
    }
}

#[derive(Debug, Default)]
pub struct StateStore {
    current: StateSnapshot,
    log: Vec<TransitionRecord>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume from a persisted snapshot. The in-memory log starts empty.
    pub fn from_snapshot(snapshot: StateSnapshot) -> Self {
        Self {
            current: snapshot,
            log: Vec::new(),
        }
    }

    pub fn snapshot(&self) -> &StateSnapshot {
        &self.current
    }

    pub fn log(&self) -> &[TransitionRecord] {
        &self.log
    }

    /// Number `transitions` after the current log and attach them to `next`
    /// without touching the store.
    pub fn stage(&self, mut next: StateSnapshot, transitions: Vec<TransitionRecord>) -> StagedTick {
        let tick = next.tick;
        let mut seq = next.next_seq;
        let transitions: Vec<TransitionRecord> = transitions
            .into_iter()
            .map(|mut t| {
                t.seq = seq;
                t.tick = tick;
                seq += 1;
                t
            })
            .collect();
        next.next_seq = seq;
        StagedTick {
            snapshot: next,
            transitions,
        }
    }

    /// Make a staged tick current and append its transitions to the log.
    /// Returns the numbered records.
    pub fn commit(&mut self, staged: StagedTick) -> Vec<TransitionRecord> {
        let StagedTick {
            snapshot,
            transitions,
        } = staged;
        self.current = snapshot;
        self.log.extend(transitions.iter().cloned());
        if self.log.len() > LOG_LIMIT {
            let excess = self.log.len() - LOG_LIMIT;
            self.log.drain(..excess);
        }
        transitions
    }

    /// Record dispatch results after a commit.
    pub fn record_alerts(&mut self, alerts: &[Alert]) {
        let recent = &mut self.current.recent_alerts;
        recent.extend(alerts.iter().cloned());
        if recent.len() > RECENT_ALERT_LIMIT {
            let excess = recent.len() - RECENT_ALERT_LIMIT;
            recent.drain(..excess);
        }
    }

    /// Stage removal of an active signal; `None` when there is nothing to
    /// acknowledge.
    pub fn stage_acknowledge(
        &self,
        rule_id: &str,
        instrument: &str,
        at: NaiveDateTime,
    ) -> Option<StagedTick> {
        let instrument = instrument.to_uppercase();
        let mut next = self.current.clone();
        if !crate::domain::signal::acknowledge(&mut next.active_signals, rule_id, &instrument) {
            return None;
        }
        let record = TransitionRecord::new(
            at,
            &instrument,
            None,
            TransitionKind::Acknowledged,
            format!("rule {}", rule_id),
        );
        Some(self.stage(next, vec![record]))
    }
}

/// A numbered snapshot and its transitions, not yet current.
#[derive(Debug, Clone)]
pub struct StagedTick {
    pub snapshot: StateSnapshot,
    pub transitions: Vec<TransitionRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::alert::{DedupKey, Severity};
    use crate::domain::confirmation::ConfirmationChecks;
    use crate::domain::cycle::Cycle;
    use crate::domain::instrument::ExpectedWindow;
    use crate::domain::signal::SignalAction;
    use chrono::NaiveDate;

    fn ts() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn tracked(start: usize, candidate: Option<usize>) -> InstrumentState {
        let mut tracker = TrackerState::new(CycleLevel::Short);
        tracker.open = Some(Cycle::open(
            "GLD",
            CycleLevel::Short,
            start,
            100.0,
            ts(),
            ExpectedWindow::new(22, 28).unwrap(),
            None,
            None,
            vec![],
        ));
        tracker.candidate = candidate;
        let mut state = InstrumentState::default();
        state.levels.insert(CycleLevel::Short, tracker);
        state.confirmations.insert(
            CycleLevel::Short,
            ConfirmationState::new(
                "GLD",
                CycleLevel::Short,
                12,
                14,
                ConfirmationChecks {
                    reversal_pattern: true,
                    trendline_break: true,
                    ..ConfirmationChecks::default()
                },
            ),
        );
        state
    }

    #[test]
    fn score_follows_current_candidate_or_cycle_start() {
        assert_eq!(tracked(0, Some(12)).score(CycleLevel::Short), 2);
        assert_eq!(tracked(12, None).score(CycleLevel::Short), 2);
        assert_eq!(tracked(0, Some(13)).score(CycleLevel::Short), 0);
        assert_eq!(tracked(0, None).score(CycleLevel::Medium), 0);
    }

    fn record(kind: TransitionKind) -> TransitionRecord {
        TransitionRecord::new(ts(), "GLD", Some(CycleLevel::Short), kind, String::new())
    }

    #[test]
    fn commit_numbers_transitions_across_ticks() {
        let mut store = StateStore::new();

        let mut next = store.snapshot().clone();
        next.tick = 1;
        let staged = store.stage(
            next,
            vec![record(TransitionKind::Seeded), record(TransitionKind::CandidateLow)],
        );
        let first = store.commit(staged);
        let mut next = store.snapshot().clone();
        next.tick = 2;
        let second = store.commit(store.stage(next, vec![record(TransitionKind::CycleOpened)]));

        assert_eq!(first.iter().map(|t| t.seq).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(second[0].seq, 2);
        assert_eq!(second[0].tick, 2);
        assert_eq!(store.log().len(), 3);
        assert_eq!(store.snapshot().next_seq, 3);
    }

    #[test]
    fn staging_leaves_store_untouched() {
        let store = StateStore::new();
        let mut next = store.snapshot().clone();
        next.tick = 1;
        let staged = store.stage(next, vec![record(TransitionKind::Seeded)]);
        assert_eq!(staged.snapshot.next_seq, 1);
        assert_eq!(staged.transitions[0].tick, 1);
        assert_eq!(store.snapshot().tick, 0);
        assert_eq!(store.snapshot().next_seq, 0);
        assert!(store.log().is_empty());
    }

    #[test]
    fn in_memory_log_keeps_the_tail() {
        let mut store = StateStore::new();
        for tick in 1..=3u64 {
            let mut next = store.snapshot().clone();
            next.tick = tick;
            let records = vec![record(TransitionKind::Stale); LOG_LIMIT / 2];
            store.commit(store.stage(next, records));
        }
        assert_eq!(store.log().len(), LOG_LIMIT);
        let last = 3 * (LOG_LIMIT / 2) as u64 - 1;
        assert_eq!(store.log().last().unwrap().seq, last);
        assert_eq!(store.log()[0].seq, last + 1 - LOG_LIMIT as u64);
        assert_eq!(store.snapshot().next_seq, last + 1);
    }

    #[test]
    fn recent_alerts_are_bounded() {
        let mut store = StateStore::new();
        let alert = Alert::new(DedupKey::new("x", "GLD"), Severity::Info, ts(), 0, String::new());
        let alerts = vec![alert; RECENT_ALERT_LIMIT + 10];
        store.record_alerts(&alerts);
        assert_eq!(store.snapshot().recent_alerts.len(), RECENT_ALERT_LIMIT);
    }

    fn with_bars(mut state: InstrumentState, n: usize) -> InstrumentState {
        let bar = OhlcvBar {
            instrument: "GLD".into(),
            timestamp: ts(),
            open: 100.0,
            high: 100.0,
            low: 100.0,
            close: 100.0,
            volume: 1,
        };
        state.bars = vec![bar; n];
        state
    }

    #[test]
    fn trim_rebases_indexes_behind_oldest_cycle() {
        // Closed cycle 5..12, open cycle from 12 with candidate 18.
        let mut state = with_bars(tracked(12, Some(18)), 20);
        let tracker = state.levels.get_mut(&CycleLevel::Short).unwrap();
        let mut closed = tracker.open.clone().unwrap();
        closed.start_index = 5;
        closed.high_index = Some(8);
        closed.closed_at = Some(12);
        tracker.closed.push(closed);
        tracker.last_index = Some(19);
        state.confirmations.get_mut(&CycleLevel::Short).unwrap().candidate_index = 18;

        assert_eq!(state.trim_history(8, 2), 3);
        assert_eq!(state.bars.len(), 17);
        assert_eq!(state.bar_offset, 3);
        assert_eq!(state.last_feed_index(), Some(19));

        let tracker = &state.levels[&CycleLevel::Short];
        assert_eq!(tracker.closed[0].start_index, 2);
        assert_eq!(tracker.closed[0].high_index, Some(5));
        assert_eq!(tracker.closed[0].closed_at, Some(9));
        assert_eq!(tracker.open.as_ref().unwrap().start_index, 9);
        assert_eq!(tracker.candidate, Some(15));
        assert_eq!(tracker.last_index, Some(16));
        assert_eq!(state.confirmations[&CycleLevel::Short].candidate_index, 15);
        assert_eq!(state.score(CycleLevel::Short), 2);
    }

    #[test]
    fn trim_is_a_no_op_within_the_window() {
        let mut state = with_bars(tracked(12, None), 20);
        let before = state.clone();
        assert_eq!(state.trim_history(20, 2), 0);
        assert_eq!(state, before);
        // Anchor inside the margin: nothing to drop.
        assert_eq!(state.trim_history(4, 12), 0);
        assert_eq!(state.bar_offset, 0);
    }

    #[test]
    fn snapshot_json_round_trip() {
        let mut snapshot = StateSnapshot::default();
        snapshot.instruments.insert("GLD".into(), tracked(3, Some(12)));
        snapshot.edges.observe("stop", "GLD", true);
        snapshot.tick = 7;
        let json = snapshot.to_json().unwrap();
        assert_eq!(StateSnapshot::from_json(&json).unwrap(), snapshot);
        assert!(StateSnapshot::from_json("{not json").is_err());
    }

    #[test]
    fn acknowledge_logs_transition() {
        let mut snapshot = StateSnapshot::default();
        snapshot.active_signals.insert(
            "stop|GLD".into(),
            Signal {
                rule_id: "stop".into(),
                instrument: "GLD".into(),
                level: CycleLevel::Short,
                bar_index: 4,
                timestamp: ts(),
                action: SignalAction::Exit,
                severity: Severity::Critical,
                payload: BTreeMap::new(),
            },
        );
        let mut store = StateStore::from_snapshot(snapshot);
        let staged = store.stage_acknowledge("stop", "gld", ts()).unwrap();
        assert_eq!(store.snapshot().active_signals.len(), 1);
        let record = store.commit(staged).pop().unwrap();
        assert_eq!(record.kind, TransitionKind::Acknowledged);
        assert!(store.snapshot().active_signals.is_empty());
        assert!(store.stage_acknowledge("stop", "GLD", ts()).is_none());
    }
}
