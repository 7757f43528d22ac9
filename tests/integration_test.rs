//! End-to-end engine behaviour driven from INI configuration.

mod common;

use chrono::{Duration, NaiveDate};
use common::*;
use cyclewatch::adapters::memory_store::MemoryStateAdapter;
use cyclewatch::domain::account::ExternalFlags;
use cyclewatch::domain::alert::{
    Alert, AlertDispatcher, AlertPolicy, DedupKey, DeliveryStatus, RateLimitBook, Severity,
};
use cyclewatch::domain::cycle::{CyclePhase, Translation};
use cyclewatch::domain::engine::Engine;
use cyclewatch::domain::error::CycleError;
use cyclewatch::domain::instrument::CycleLevel;
use cyclewatch::domain::state_store::{StateSnapshot, TransitionKind};
use cyclewatch::ports::persistence_port::PersistencePort;

mod cycle_pipeline {
    use super::*;

    #[test]
    fn confirmed_low_fires_once_and_failure_raises_watch() {
        let mut engine = Engine::new(settings_from(GLD_CONFIG));
        let flags = ExternalFlags::default();
        let sink = RecordingSink::default();

        let backfill = engine.backfill(&batch("GLD", &CLOSES, 0..6), None);
        assert!(backfill.alerts.is_empty());
        let status = engine.get_cycle_state("GLD", CycleLevel::Short).unwrap();
        assert_eq!(status.phase, Some(CyclePhase::Distributing));
        assert_eq!(status.cycle.unwrap().translation, Translation::Left);

        let mut fired = Vec::new();
        for i in 6..10 {
            let report = live_tick(&mut engine, &batch("GLD", &CLOSES, i..i + 1), &flags, &sink, None);
            fired.push(report.signals.len());
        }
        assert_eq!(fired, vec![0, 0, 1, 0]);

        let sources = sink.sources();
        assert!(sources.contains(&"NEW_CYCLE_SHORT".to_string()));
        assert!(sources.contains(&"new_low".to_string()));
        assert!(sources.contains(&"CYCLE_FAILED_SHORT".to_string()));

        let confirmation = engine.get_confirmation_score("GLD").unwrap();
        assert_eq!(confirmation.candidate_index, 7);
        assert_eq!(confirmation.score, 2);
        assert!(confirmation.is_actionable());
    }

    #[test]
    fn hard_stop_fires_on_each_crossing_below_floor() {
        let config = r#"
[cycle.GLD.short]
window_min = 6
window_max = 10

[rule.stop]
kind = hard_stop
instruments = GLD
floor = 100
"#;
        let mut engine = Engine::new(settings_from(config));
        let flags = ExternalFlags::default();
        let sink = RecordingSink::default();
        let closes = [105.0, 104.0, 106.0, 99.0, 98.0, 101.0, 102.0, 97.0];

        engine.backfill(&batch("GLD", &closes, 0..3), None);
        let mut fired = Vec::new();
        for i in 3..closes.len() {
            let report = live_tick(&mut engine, &batch("GLD", &closes, i..i + 1), &flags, &sink, None);
            let stops: Vec<_> = report.signals.iter().filter(|s| s.rule_id == "stop").collect();
            if let Some(signal) = stops.first() {
                assert_eq!(signal.severity, Severity::Critical);
                assert_eq!(signal.payload["floor"], 100.0);
            }
            fired.push(stops.len());
        }
        assert_eq!(fired, vec![1, 0, 0, 0, 1]);
        assert_eq!(sink.sources().iter().filter(|s| *s == "stop").count(), 2);
    }

    #[test]
    fn missing_flag_fails_closed_without_consuming_edge() {
        let config = r#"
[cycle.GLD.short]
window_min = 6
window_max = 10

[rule.gate]
when = FLAG(volatility_rank_ok)
"#;
        let mut engine = Engine::new(settings_from(config));
        let sink = RecordingSink::default();
        engine.backfill(&batch("GLD", &CLOSES, 0..3), None);

        let missing = live_tick(&mut engine, &batch("GLD", &CLOSES, 3..4), &ExternalFlags::default(), &sink, None);
        assert!(missing.signals.is_empty());
        assert_eq!(missing.rule_failures.len(), 1);

        let on = ExternalFlags::default().with("volatility_rank_ok", true);
        let fired = live_tick(&mut engine, &batch("GLD", &CLOSES, 4..5), &on, &sink, None);
        assert_eq!(fired.signals.len(), 1);
        let held = live_tick(&mut engine, &batch("GLD", &CLOSES, 5..6), &on, &sink, None);
        assert!(held.signals.is_empty());
    }

    #[test]
    fn disallowed_entry_becomes_critical_violation() {
        let config = format!(
            "{GLD_CONFIG}\naccount = ira\n\n[account.ira]\ntax_advantaged = yes\ndisallowed = GLD\n"
        );
        let mut engine = Engine::new(settings_from(&config));
        let flags = ExternalFlags::default();
        let sink = RecordingSink::default();
        engine.backfill(&batch("GLD", &CLOSES, 0..6), None);

        let mut violations = 0;
        for i in 6..10 {
            let report = live_tick(&mut engine, &batch("GLD", &CLOSES, i..i + 1), &flags, &sink, None);
            assert!(report.signals.is_empty());
            violations += report.violations.len();
        }
        assert_eq!(violations, 1);
        let alerts = sink.delivered.lock().unwrap();
        let violation = alerts
            .iter()
            .find(|a| a.key.source.starts_with("CONSTRAINT_VIOLATION"))
            .unwrap();
        assert_eq!(violation.severity, Severity::Critical);
        assert!(engine.get_active_signals().is_empty());
    }
}

mod alerts {
    use super::*;

    #[test]
    fn watch_alerts_respect_four_hour_gap() {
        let dispatcher = AlertDispatcher::new(AlertPolicy::default(), RateLimitBook::default());
        let sink = RecordingSink::default();
        let day = NaiveDate::from_ymd_opt(2024, 5, 6).unwrap();
        let at = |h, m| day.and_hms_opt(h, m, 0).unwrap();

        let statuses: Vec<DeliveryStatus> = [at(10, 0), at(11, 30), at(14, 5)]
            .into_iter()
            .map(|ts| {
                let alert = Alert::new(
                    DedupKey::new("STALE_CYCLE_SHORT", "GLD"),
                    Severity::Watch,
                    ts,
                    0,
                    "stale".into(),
                );
                dispatcher.dispatch(alert, &sink).status
            })
            .collect();

        assert_eq!(
            statuses,
            vec![
                DeliveryStatus::Delivered,
                DeliveryStatus::Suppressed,
                DeliveryStatus::Delivered
            ]
        );
        assert_eq!(sink.delivered.lock().unwrap().len(), 2);
    }

    #[test]
    fn critical_alerts_are_never_limited() {
        let dispatcher = AlertDispatcher::new(AlertPolicy::default(), RateLimitBook::default());
        let sink = RecordingSink::default();
        let ts = NaiveDate::from_ymd_opt(2024, 5, 6)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        for i in 0..20 {
            let alert = Alert::new(
                DedupKey::new("stop", "GLD"),
                Severity::Critical,
                ts + Duration::minutes(i),
                0,
                String::new(),
            );
            assert_eq!(dispatcher.dispatch(alert, &sink).status, DeliveryStatus::Delivered);
        }
    }
}

mod persistence {
    use super::*;

    fn summary(report: &cyclewatch::domain::engine::TickReport) -> Vec<(String, DeliveryStatus)> {
        report
            .alerts
            .iter()
            .map(|a| (a.key.to_string(), a.status))
            .collect()
    }

    #[test]
    fn resumed_engine_matches_uninterrupted_run() {
        let store = MemoryStateAdapter::new();
        let flags = ExternalFlags::default();
        let sink = RecordingSink::default();

        let mut original = Engine::new(settings_from(GLD_CONFIG));
        original.backfill(&batch("GLD", &CLOSES, 0..6), Some(&store));
        for i in 6..8 {
            live_tick(&mut original, &batch("GLD", &CLOSES, i..i + 1), &flags, &sink, Some(&store));
        }

        // Round-trip through JSON as a database would.
        let persisted = store.read_last_state().unwrap().unwrap();
        let decoded = StateSnapshot::from_json(&persisted.to_json().unwrap()).unwrap();
        assert_eq!(decoded, *original.snapshot());
        let mut resumed = Engine::with_snapshot(settings_from(GLD_CONFIG), decoded);

        for i in 8..10 {
            let bars = batch("GLD", &CLOSES, i..i + 1);
            let a = live_tick(&mut original, &bars, &flags, &sink, None);
            let b = live_tick(&mut resumed, &bars, &flags, &sink, None);
            assert_eq!(a.signals, b.signals);
            assert_eq!(summary(&a), summary(&b));
            assert_eq!(a.transitions, b.transitions);
        }
        assert_eq!(original.snapshot(), resumed.snapshot());
    }

    #[test]
    fn transitions_are_appended_in_sequence() {
        let store = MemoryStateAdapter::new();
        let mut engine = Engine::new(settings_from(GLD_CONFIG));
        engine.backfill(&batch("GLD", &CLOSES, 0..6), Some(&store));

        let log = store.read_transitions(100).unwrap();
        assert!(log.iter().any(|t| t.kind == TransitionKind::HighConfirmed));
        assert!(log.windows(2).all(|w| w[0].seq < w[1].seq));
        assert_eq!(store.read_last_state().unwrap().unwrap().next_seq, log.len() as u64);
    }

    #[test]
    fn persistence_failure_keeps_previous_state() {
        let store = MemoryStateAdapter::failing();
        let mut engine = Engine::new(settings_from(GLD_CONFIG));
        let report = engine.backfill(&batch("GLD", &CLOSES, 0..6), Some(&store));

        assert!(matches!(
            report.persistence_error,
            Some(CycleError::Persistence { .. })
        ));
        assert!(!report.committed);
        assert_eq!(engine.snapshot().tick, 0);
        assert!(engine.get_cycle_state("GLD", CycleLevel::Short).unwrap().cycle.is_none());
        assert!(engine.transitions().is_empty());
    }

    #[test]
    fn store_outage_leaves_durable_log_contiguous() {
        let flags = ExternalFlags::default();
        let sink = RecordingSink::default();
        let store = MemoryStateAdapter::fail_times(1);
        let mut engine = Engine::new(settings_from(GLD_CONFIG));
        let history = batch("GLD", &CLOSES, 0..6);
        assert!(engine.backfill(&history, Some(&store)).persistence_error.is_some());
        assert!(engine.backfill(&history, Some(&store)).committed);
        for i in 6..10 {
            live_tick(&mut engine, &batch("GLD", &CLOSES, i..i + 1), &flags, &sink, Some(&store));
        }

        let log = store.read_transitions(1000).unwrap();
        let seqs: Vec<u64> = log.iter().map(|t| t.seq).collect();
        assert_eq!(seqs, (0..log.len() as u64).collect::<Vec<_>>());
        let durable = store.read_last_state().unwrap().unwrap();
        assert_eq!(durable, *engine.snapshot());
        assert_eq!(durable.tick, 5);
    }
}
