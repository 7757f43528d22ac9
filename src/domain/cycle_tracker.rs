//! Cycle tracker state machine, one per (instrument, level).
//!
//! ACCUMULATING (post-low) moves to DISTRIBUTING once a running high is
//! confirmed, and back to ACCUMULATING when a confirmed low opens a new
//! cycle. The tracker proposes candidate lows but never closes a cycle on
//! its own: the engine calls [`CycleTracker::confirm_low`] once the scorer
//! finds enough evidence.

use crate::domain::cycle::{Cycle, Translation};
use crate::domain::error::CycleError;
use crate::domain::instrument::{CycleLevel, LevelConfig};
use crate::domain::ohlcv::OhlcvBar;
use serde::{Deserialize, Serialize};

/// Closed cycles retained per level.
pub const CLOSED_HISTORY_LIMIT: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerState {
    pub level: CycleLevel,
    pub open: Option<Cycle>,
    pub closed: Vec<Cycle>,
    pub candidate: Option<usize>,
    pub last_index: Option<usize>,
}

impl TrackerState {
    pub fn new(level: CycleLevel) -> Self {
        Self {
            level,
            open: None,
            closed: Vec::new(),
            candidate: None,
            last_index: None,
        }
    }

    /// Oldest bar index still referenced by the open or retained closed cycles.
    pub fn oldest_index(&self) -> Option<usize> {
        self.closed
            .iter()
            .chain(self.open.iter())
            .map(|c| c.start_index)
            .chain(self.candidate)
            .min()
    }

    /// Rebase every stored index after `n` bars were dropped from the front.
    /// Callers keep `n` at or below [`TrackerState::oldest_index`].
    pub fn shift_back(&mut self, n: usize) {
        for cycle in self.closed.iter_mut().chain(self.open.iter_mut()) {
            cycle.shift_back(n);
        }
        self.candidate = self.candidate.map(|c| c - n);
        self.last_index = self.last_index.map(|i| i.saturating_sub(n));
    }

    /// Consecutive weak (LEFT or failed) cycles at the end of the closed history.
    pub fn weak_streak(&self) -> usize {
        self.closed.iter().rev().take_while(|c| c.is_weak()).count()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrackerEvent {
    Seeded {
        start_index: usize,
        start_price: f64,
    },
    HighConfirmed {
        high_index: usize,
        translation: Translation,
    },
    CycleFailed {
        index: usize,
        close: f64,
        previous_start: f64,
    },
    CandidateLow {
        index: usize,
    },
    Stale {
        elapsed: usize,
        max: usize,
        escalated: bool,
    },
    CycleClosed {
        start_index: usize,
        closed_at: usize,
        translation: Translation,
        failed: bool,
    },
    CycleOpened {
        start_index: usize,
        confirmed_at: usize,
    },
}

pub struct CycleTracker<'a> {
    instrument: &'a str,
    config: &'a LevelConfig,
    children: Vec<CycleLevel>,
}

impl<'a> CycleTracker<'a> {
    pub fn new(
        instrument: &'a str,
        config: &'a LevelConfig,
        children: Vec<CycleLevel>,
    ) -> Result<Self, CycleError> {
        config.validate().map_err(|reason| CycleError::ConfigInvalid {
            section: format!("cycle.{}.{}", instrument, config.level),
            key: "window".to_string(),
            reason,
        })?;
        Ok(Self {
            instrument,
            config,
            children,
        })
    }

    /// Open the first cycle at the lowest close among the first `window.max`
    /// bars. Ties go to the earliest bar.
    pub fn seed(&self, state: &mut TrackerState, bars: &[OhlcvBar]) -> Option<TrackerEvent> {
        if bars.is_empty() {
            return None;
        }
        let span = bars.len().min(self.config.window.max);
        let mut seed = 0;
        for (i, bar) in bars.iter().enumerate().take(span).skip(1) {
            if bar.close < bars[seed].close {
                seed = i;
            }
        }

        let bar = &bars[seed];
        state.open = Some(self.open_cycle(seed, bar, None));
        state.candidate = None;
        state.last_index = Some(seed);
        Some(TrackerEvent::Seeded {
            start_index: seed,
            start_price: bar.close,
        })
    }

    /// Apply bar `index`. Bars at or before the last applied index are ignored.
    pub fn advance(
        &self,
        state: &mut TrackerState,
        bars: &[OhlcvBar],
        index: usize,
    ) -> Vec<TrackerEvent> {
        let mut events = Vec::new();
        if state.last_index.is_some_and(|last| index <= last) || index >= bars.len() {
            return events;
        }
        self.apply_bar(state, bars, index, &mut events);
        state.last_index = Some(index);
        events
    }

    /// Close the open cycle at `low_index` and open its successor there, then
    /// replay bars up to `current` into the new cycle.
    pub fn confirm_low(
        &self,
        state: &mut TrackerState,
        bars: &[OhlcvBar],
        low_index: usize,
        current: usize,
    ) -> Vec<TrackerEvent> {
        let mut events = Vec::new();
        let Some(mut closing) = state.open.take() else {
            return events;
        };
        if low_index <= closing.start_index || low_index > current || current >= bars.len() {
            state.open = Some(closing);
            return events;
        }

        // A running high at or after the new low belongs to the next cycle.
        if closing.high_index.is_some_and(|h| h >= low_index) {
            let best = (closing.start_index + 1..low_index).fold(None, |best: Option<usize>, i| {
                match best {
                    Some(b) if bars[b].close >= bars[i].close => Some(b),
                    _ => Some(i),
                }
            });
            closing.high_index = best;
            closing.high_price = best.map(|i| bars[i].close);
            // Translation frozen against the dropped high no longer holds.
            closing.translation = Translation::Pending;
        }
        if closing.high_index.is_some() {
            closing.high_confirmed = true;
            closing.assign_translation();
        }
        closing.elapsed_count = low_index - closing.start_index;
        closing.closed_at = Some(low_index);

        events.push(TrackerEvent::CycleClosed {
            start_index: closing.start_index,
            closed_at: low_index,
            translation: closing.translation,
            failed: closing.failed,
        });

        let mut next = self.open_cycle(low_index, &bars[low_index], Some(closing.start_price));
        next.confirmed_at = Some(current);

        state.closed.push(closing);
        if state.closed.len() > CLOSED_HISTORY_LIMIT {
            let excess = state.closed.len() - CLOSED_HISTORY_LIMIT;
            state.closed.drain(..excess);
        }
        state.open = Some(next);
        state.candidate = None;
        events.push(TrackerEvent::CycleOpened {
            start_index: low_index,
            confirmed_at: current,
        });

        for i in low_index + 1..=current {
            self.apply_bar(state, bars, i, &mut events);
        }
        state.last_index = Some(current);
        events
    }

    fn open_cycle(&self, index: usize, bar: &OhlcvBar, previous: Option<f64>) -> Cycle {
        Cycle::open(
            self.instrument,
            self.config.level,
            index,
            bar.close,
            bar.timestamp,
            self.config.window,
            previous,
            self.config.parent,
            self.children.clone(),
        )
    }

    fn apply_bar(
        &self,
        state: &mut TrackerState,
        bars: &[OhlcvBar],
        index: usize,
        events: &mut Vec<TrackerEvent>,
    ) {
        let Some(cycle) = state.open.as_mut() else {
            return;
        };
        if index <= cycle.start_index {
            return;
        }
        let bar = &bars[index];
        cycle.elapsed_count = index - cycle.start_index;

        if cycle.high_price.is_none_or(|h| bar.close > h) {
            cycle.high_index = Some(index);
            cycle.high_price = Some(bar.close);
        } else if !cycle.high_confirmed {
            if let (Some(high_index), Some(high_price)) = (cycle.high_index, cycle.high_price) {
                let lower = bars[high_index + 1..=index]
                    .iter()
                    .filter(|b| b.close < high_price)
                    .count();
                if lower >= self.config.high_confirm_bars {
                    cycle.high_confirmed = true;
                    cycle.assign_translation();
                    events.push(TrackerEvent::HighConfirmed {
                        high_index,
                        translation: cycle.translation,
                    });
                }
            }
        }

        if !cycle.failed {
            if let Some(previous) = cycle.previous_start_price {
                if bar.close < previous && cycle.elapsed_count <= cycle.expected_window.max {
                    cycle.failed = true;
                    events.push(TrackerEvent::CycleFailed {
                        index,
                        close: bar.close,
                        previous_start: previous,
                    });
                }
            }
        }

        if cycle.elapsed_count >= self.config.due_after() {
            let from = index.saturating_sub(self.config.lookback.saturating_sub(1));
            if bars[from..=index].iter().all(|b| bar.close <= b.close) {
                state.candidate = Some(index);
                events.push(TrackerEvent::CandidateLow { index });
            }
        }

        let max = cycle.expected_window.max;
        if cycle.elapsed_count > max {
            let overrun = (cycle.elapsed_count - max) as f64;
            events.push(TrackerEvent::Stale {
                elapsed: cycle.elapsed_count,
                max,
                escalated: overrun > self.config.stale_watch_fraction * max as f64,
            });
        }
    }
}
