//! Rule evaluation against per-instrument cycle state.
//!
//! # Evaluation Semantics
//!
//! - Operands that are not yet available (no bars, no open cycle) resolve to
//!   NaN, so every comparison against them is `false`
//! - Cycle predicates on a level with no open cycle are `false`
//! - `AND`: Short-circuits on first `false`
//! - `OR`: Short-circuits on first `true`
//! - Unconfigured parameters, unknown instruments, missing parent levels and
//!   unsupplied flags are configuration errors; callers treat the rule as not
//!   firing

use crate::domain::account::{ExternalFlags, PortfolioSnapshot};
use crate::domain::cycle::Cycle;
use crate::domain::cycle_tracker::TrackerState;
use crate::domain::error::CycleError;
use crate::domain::instrument::{CycleLevel, ExpectedWindow, Registry};
use crate::domain::rule::{CycleRef, LevelSelector, Operand, Rule};
use crate::domain::state_store::InstrumentState;
use std::collections::BTreeMap;

const EPSILON: f64 = 1e-9;

pub struct EvalContext<'a> {
    pub rule_id: &'a str,
    pub instrument: &'a str,
    pub states: &'a BTreeMap<String, InstrumentState>,
    pub registry: &'a Registry,
    pub params: &'a BTreeMap<String, f64>,
    pub portfolio: &'a PortfolioSnapshot,
    pub account: Option<&'a str>,
    pub flags: &'a ExternalFlags,
}

impl EvalContext<'_> {
    fn section(&self) -> String {
        format!("rule.{}", self.rule_id)
    }
}

/// Resolved cycle reference: the tracker for (instrument, level), if any
/// bars have reached it yet.
struct CycleView<'s> {
    instrument: String,
    level: CycleLevel,
    state: Option<&'s InstrumentState>,
    tracker: Option<&'s TrackerState>,
}

impl<'s> CycleView<'s> {
    fn open(&self) -> Option<&'s Cycle> {
        self.tracker.and_then(|t| t.open.as_ref())
    }
}

/// Fail fast on references that can never resolve, regardless of which
/// branch of the rule would be reached.
pub fn check_references(rule: &Rule, ctx: &EvalContext) -> Result<(), CycleError> {
    for name in rule.referenced_params() {
        if !ctx.params.contains_key(&name) {
            return Err(CycleError::ConfigMissing {
                section: ctx.section(),
                key: name,
            });
        }
    }
    for name in rule.referenced_flags() {
        if ctx.flags.get(&name).is_none() {
            return Err(CycleError::ConfigMissing {
                section: "flags".to_string(),
                key: name,
            });
        }
    }
    for instrument in rule.referenced_instruments() {
        if ctx.registry.get(&instrument).is_none() {
            return Err(unknown_instrument(ctx, &instrument));
        }
    }
    Ok(())
}

/// `check_references` followed by `evaluate`.
pub fn evaluate_checked(rule: &Rule, ctx: &EvalContext) -> Result<bool, CycleError> {
    check_references(rule, ctx)?;
    evaluate(rule, ctx)
}

pub fn evaluate(rule: &Rule, ctx: &EvalContext) -> Result<bool, CycleError> {
    match rule {
        Rule::Above { left, right } => {
            Ok(resolve_operand(left, ctx)? > resolve_operand(right, ctx)?)
        }
        Rule::Below { left, right } => {
            Ok(resolve_operand(left, ctx)? < resolve_operand(right, ctx)?)
        }
        Rule::AtLeast { left, right } => {
            Ok(resolve_operand(left, ctx)? >= resolve_operand(right, ctx)?)
        }
        Rule::AtMost { left, right } => {
            Ok(resolve_operand(left, ctx)? <= resolve_operand(right, ctx)?)
        }
        Rule::Equals { left, right } => {
            let left_val = resolve_operand(left, ctx)?;
            let right_val = resolve_operand(right, ctx)?;
            Ok((left_val - right_val).abs() < EPSILON)
        }
        Rule::And(rules) => {
            for r in rules {
                if !evaluate(r, ctx)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Rule::Or(rules) => {
            for r in rules {
                if evaluate(r, ctx)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Rule::Not(rule) => Ok(!evaluate(rule, ctx)?),
        Rule::Translation { cycle, translation } => {
            let view = resolve_cycle(cycle, ctx)?;
            Ok(view.open().is_some_and(|c| c.translation == *translation))
        }
        Rule::Failed(cycle) => {
            let view = resolve_cycle(cycle, ctx)?;
            Ok(view.open().is_some_and(|c| c.failed))
        }
        Rule::PastMidpoint(cycle) => {
            let view = resolve_cycle(cycle, ctx)?;
            Ok(view.open().is_some_and(Cycle::past_midpoint))
        }
        Rule::NewLow(cycle) => {
            let view = resolve_cycle(cycle, ctx)?;
            let latest = view.state.and_then(InstrumentState::last_index);
            Ok(view
                .open()
                .is_some_and(|c| c.confirmed_at.is_some() && c.confirmed_at == latest))
        }
        Rule::Stale(cycle) => {
            let view = resolve_cycle(cycle, ctx)?;
            Ok(view.open().is_some_and(Cycle::is_stale))
        }
        Rule::Flag(name) => ctx.flags.get(name).ok_or_else(|| CycleError::ConfigMissing {
            section: "flags".to_string(),
            key: name.clone(),
        }),
    }
}

fn resolve_operand(operand: &Operand, ctx: &EvalContext) -> Result<f64, CycleError> {
    match operand {
        Operand::Close => Ok(ctx
            .states
            .get(ctx.instrument)
            .and_then(InstrumentState::last_bar)
            .map(|b| b.close)
            .unwrap_or(f64::NAN)),
        Operand::Constant(v) => Ok(*v),
        Operand::Param(name) => {
            ctx.params
                .get(name)
                .copied()
                .ok_or_else(|| CycleError::ConfigMissing {
                    section: ctx.section(),
                    key: name.clone(),
                })
        }
        Operand::Position => match ctx.account {
            Some(id) => ctx
                .portfolio
                .account(id)
                .map(|a| a.position(ctx.instrument))
                .ok_or_else(|| CycleError::ConfigInvalid {
                    section: ctx.section(),
                    key: "account".to_string(),
                    reason: format!("account '{}' not present in portfolio", id),
                }),
            None => Ok(ctx.portfolio.total_position(ctx.instrument)),
        },
        Operand::Elapsed(cycle) => {
            let view = resolve_cycle(cycle, ctx)?;
            Ok(view
                .open()
                .map(|c| c.elapsed_count as f64)
                .unwrap_or(f64::NAN))
        }
        Operand::Score(cycle) => {
            let view = resolve_cycle(cycle, ctx)?;
            Ok(view
                .state
                .map(|s| s.score(view.level) as f64)
                .unwrap_or(f64::NAN))
        }
        Operand::Midpoint(cycle) => {
            let view = resolve_cycle(cycle, ctx)?;
            Ok(level_window(&view, ctx)?.midpoint() as f64)
        }
        Operand::WindowMin(cycle) => {
            let view = resolve_cycle(cycle, ctx)?;
            Ok(level_window(&view, ctx)?.min as f64)
        }
        Operand::WindowMax(cycle) => {
            let view = resolve_cycle(cycle, ctx)?;
            Ok(level_window(&view, ctx)?.max as f64)
        }
        Operand::Gain(cycle) => {
            let view = resolve_cycle(cycle, ctx)?;
            let close = view.state.and_then(InstrumentState::last_bar).map(|b| b.close);
            Ok(match (view.open(), close) {
                (Some(c), Some(close)) if c.start_price != 0.0 => close / c.start_price - 1.0,
                _ => f64::NAN,
            })
        }
        Operand::WeakStreak(cycle) => {
            let view = resolve_cycle(cycle, ctx)?;
            Ok(view
                .tracker
                .map(|t| t.weak_streak() as f64)
                .unwrap_or(f64::NAN))
        }
    }
}

fn level_window(view: &CycleView, ctx: &EvalContext) -> Result<ExpectedWindow, CycleError> {
    ctx.registry
        .level(&view.instrument, view.level)
        .map(|c| c.window)
        .ok_or_else(|| untracked_level(&view.instrument, view.level))
}

fn resolve_cycle<'s>(cycle: &CycleRef, ctx: &EvalContext<'s>) -> Result<CycleView<'s>, CycleError> {
    let instrument = cycle
        .instrument
        .clone()
        .unwrap_or_else(|| ctx.instrument.to_string());
    if ctx.registry.get(&instrument).is_none() {
        return Err(unknown_instrument(ctx, &instrument));
    }

    let level = match cycle.selector {
        LevelSelector::Level(level) => level,
        LevelSelector::Parent(child) => {
            ctx.registry
                .parent(&instrument, child)
                .ok_or_else(|| CycleError::ConfigInvalid {
                    section: format!("cycle.{}.{}", instrument, child),
                    key: "parent".to_string(),
                    reason: "no parent level configured".to_string(),
                })?
        }
    };
    if ctx.registry.level(&instrument, level).is_none() {
        return Err(untracked_level(&instrument, level));
    }

    let state = ctx.states.get(&instrument);
    let tracker = state.and_then(|s| s.levels.get(&level));
    Ok(CycleView {
        instrument,
        level,
        state,
        tracker,
    })
}

fn unknown_instrument(ctx: &EvalContext, instrument: &str) -> CycleError {
    CycleError::ConfigInvalid {
        section: ctx.section(),
        key: "instrument".to_string(),
        reason: format!("unknown instrument '{}'", instrument),
    }
}

fn untracked_level(instrument: &str, level: CycleLevel) -> CycleError {
    CycleError::ConfigInvalid {
        section: format!("cycle.{}.{}", instrument, level),
        key: "window".to_string(),
        reason: "level is not tracked for this instrument".to_string(),
    }
}
