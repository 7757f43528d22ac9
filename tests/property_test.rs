//! Property tests: score bounds, engine determinism, indicator arithmetic.

mod common;

use approx::assert_relative_eq;
use common::*;
use cyclewatch::domain::account::ExternalFlags;
use cyclewatch::domain::confirmation::fit_line;
use cyclewatch::domain::engine::Engine;
use cyclewatch::domain::indicator::calculate_sma;
use proptest::prelude::*;
use std::collections::BTreeMap;

fn series(closes: &[f64]) -> Vec<OhlcvBar> {
    closes
        .iter()
        .enumerate()
        .map(|(i, c)| flat_bar("GLD", i, *c))
        .collect()
}

fn run(closes: &[f64], warmup: usize) -> Engine {
    let mut engine = Engine::new(settings_from(GLD_CONFIG));
    let bars = series(closes);
    let flags = ExternalFlags::default();
    let sink = RecordingSink::default();

    let mut head = BTreeMap::new();
    head.insert("GLD".to_string(), bars[..warmup].to_vec());
    engine.backfill(&head, None);
    for bar in &bars[warmup..] {
        let mut tick = BTreeMap::new();
        tick.insert("GLD".to_string(), vec![bar.clone()]);
        live_tick(&mut engine, &tick, &flags, &sink, None);
    }
    engine
}

proptest! {
    #[test]
    fn engine_is_deterministic_and_scores_bounded(
        closes in prop::collection::vec(50.0f64..150.0, 12..60),
    ) {
        let a = run(&closes, 6);
        let b = run(&closes, 6);
        prop_assert_eq!(a.snapshot(), b.snapshot());
        prop_assert_eq!(a.transitions(), b.transitions());

        for confirmation in a.snapshot().instruments["GLD"].confirmations.values() {
            prop_assert!(confirmation.score <= 4);
            prop_assert_eq!(confirmation.score, confirmation.checks.score());
        }
    }

    #[test]
    fn one_batch_matches_bar_by_bar_ticks(
        closes in prop::collection::vec(50.0f64..150.0, 12..40),
    ) {
        let stepped = run(&closes, 6);

        let mut batched = Engine::new(settings_from(GLD_CONFIG));
        let bars = series(&closes);
        let mut head = BTreeMap::new();
        head.insert("GLD".to_string(), bars[..6].to_vec());
        batched.backfill(&head, None);
        let mut tail = BTreeMap::new();
        tail.insert("GLD".to_string(), bars[6..].to_vec());
        let report = live_tick(&mut batched, &tail, &ExternalFlags::default(), &RecordingSink::default(), None);

        prop_assert!(report.committed);
        prop_assert_eq!(report.accepted["GLD"], closes.len() - 6);
        prop_assert_eq!(stepped.snapshot(), batched.snapshot());
        prop_assert_eq!(stepped.transitions(), batched.transitions());
    }

    #[test]
    fn fit_line_recovers_exact_lines(
        slope in -5.0f64..5.0,
        intercept in -100.0f64..100.0,
    ) {
        let points: Vec<(f64, f64)> = (0..6)
            .map(|x| (x as f64, slope * x as f64 + intercept))
            .collect();
        let (m, b) = fit_line(&points).unwrap();
        prop_assert!((m - slope).abs() < 1e-9);
        prop_assert!((b - intercept).abs() < 1e-9);
    }
}

#[test]
fn sma_matches_hand_computed_average() {
    let bars = series(&[100.0, 103.0, 106.0, 108.0]);
    let sma = calculate_sma(&bars, 3);
    assert!(sma.simple_at(1).is_none());
    assert_relative_eq!(sma.simple_at(2).unwrap(), 103.0);
    assert_relative_eq!(sma.simple_at(3).unwrap(), 317.0 / 3.0, epsilon = 1e-12);
}
