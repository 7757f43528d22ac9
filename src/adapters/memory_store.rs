//! In-process persistence, used when no database is configured and in tests.

use crate::domain::error::CycleError;
use crate::domain::state_store::{StateSnapshot, TransitionRecord};
use crate::ports::persistence_port::PersistencePort;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct MemoryStateAdapter {
    state: Mutex<Option<StateSnapshot>>,
    transitions: Mutex<Vec<TransitionRecord>>,
    /// Writes left to reject; `usize::MAX` rejects forever.
    failures_left: AtomicUsize,
}

impl MemoryStateAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// An adapter whose writes always fail; reads still work.
    pub fn failing() -> Self {
        Self::fail_times(usize::MAX)
    }

    /// An adapter that rejects its next `n` writes, then recovers.
    pub fn fail_times(n: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(n),
            ..Self::default()
        }
    }

    /// Every transition written so far, in sequence order.
    pub fn all_transitions(&self) -> Vec<TransitionRecord> {
        let log = self.transitions.lock().unwrap_or_else(|p| p.into_inner());
        let mut all = log.clone();
        all.sort_by_key(|r| r.seq);
        all
    }

    fn check_writable(&self) -> Result<(), CycleError> {
        let rejected = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                0 => None,
                usize::MAX => Some(usize::MAX),
                n => Some(n - 1),
            })
            .is_ok();
        if rejected {
            return Err(CycleError::Persistence {
                reason: "store is read-only".into(),
            });
        }
        Ok(())
    }
}

impl PersistencePort for MemoryStateAdapter {
    fn read_last_state(&self) -> Result<Option<StateSnapshot>, CycleError> {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        Ok(state.clone())
    }

    fn append_transition(&self, record: &TransitionRecord) -> Result<(), CycleError> {
        self.check_writable()?;
        let mut log = self.transitions.lock().unwrap_or_else(|p| p.into_inner());
        log.retain(|r| r.seq != record.seq);
        log.push(record.clone());
        Ok(())
    }

    fn overwrite_current_state(&self, snapshot: &StateSnapshot) -> Result<(), CycleError> {
        self.check_writable()?;
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        *state = Some(snapshot.clone());
        Ok(())
    }

    fn read_transitions(&self, limit: usize) -> Result<Vec<TransitionRecord>, CycleError> {
        let log = self.transitions.lock().unwrap_or_else(|p| p.into_inner());
        let start = log.len().saturating_sub(limit);
        Ok(log[start..].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::state_store::TransitionKind;
    use chrono::NaiveDate;

    fn record(seq: u64) -> TransitionRecord {
        let ts = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let mut record = TransitionRecord::new(ts, "GLD", None, TransitionKind::Seeded, String::new());
        record.seq = seq;
        record
    }

    #[test]
    fn stores_latest_snapshot_and_log() {
        let store = MemoryStateAdapter::new();
        assert!(store.read_last_state().unwrap().is_none());

        let snapshot = StateSnapshot {
            tick: 2,
            ..StateSnapshot::default()
        };
        store.overwrite_current_state(&snapshot).unwrap();
        for seq in 0..5 {
            store.append_transition(&record(seq)).unwrap();
        }

        assert_eq!(store.read_last_state().unwrap(), Some(snapshot));
        let tail = store.read_transitions(2).unwrap();
        assert_eq!(tail.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![3, 4]);
    }

    #[test]
    fn failing_store_rejects_writes() {
        let store = MemoryStateAdapter::failing();
        assert!(matches!(
            store.overwrite_current_state(&StateSnapshot::default()),
            Err(CycleError::Persistence { .. })
        ));
        assert!(store.append_transition(&record(0)).is_err());
        assert!(store.read_last_state().unwrap().is_none());
    }

    #[test]
    fn store_recovers_after_counted_failures() {
        let store = MemoryStateAdapter::fail_times(2);
        assert!(store.append_transition(&record(0)).is_err());
        assert!(store.overwrite_current_state(&StateSnapshot::default()).is_err());
        store.append_transition(&record(1)).unwrap();
        store.append_transition(&record(0)).unwrap();
        assert_eq!(
            store.all_transitions().iter().map(|r| r.seq).collect::<Vec<_>>(),
            vec![0, 1]
        );
    }
}
