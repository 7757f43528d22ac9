//! Rule AST data structures.
//!
//! - `CycleRef`: which cycle a predicate looks at (own level, parent level, or
//!   another instrument's level)
//! - `Operand`: numeric values (close, constants, `$params`, position, cycle metrics)
//! - `Rule`: comparisons, boolean composites and cycle/flag predicates
//!
//! `Display` renders the DSL form accepted by `rule_parser::parse`.

use crate::domain::cycle::Translation;
use crate::domain::instrument::CycleLevel;
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelSelector {
    Level(CycleLevel),
    /// The configured parent of this level.
    Parent(CycleLevel),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleRef {
    /// `None` means the instrument the rule is being evaluated for.
    pub instrument: Option<String>,
    pub selector: LevelSelector,
}

impl CycleRef {
    pub fn level(level: CycleLevel) -> Self {
        Self {
            instrument: None,
            selector: LevelSelector::Level(level),
        }
    }

    pub fn parent(level: CycleLevel) -> Self {
        Self {
            instrument: None,
            selector: LevelSelector::Parent(level),
        }
    }

    pub fn on(instrument: &str, level: CycleLevel) -> Self {
        Self {
            instrument: Some(instrument.to_uppercase()),
            selector: LevelSelector::Level(level),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Close,
    Constant(f64),
    Param(String),
    /// Units held of the evaluated instrument.
    Position,
    Elapsed(CycleRef),
    Score(CycleRef),
    Midpoint(CycleRef),
    WindowMin(CycleRef),
    WindowMax(CycleRef),
    /// close / cycle start price - 1
    Gain(CycleRef),
    WeakStreak(CycleRef),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Rule {
    Above { left: Operand, right: Operand },
    Below { left: Operand, right: Operand },
    AtLeast { left: Operand, right: Operand },
    AtMost { left: Operand, right: Operand },
    Equals { left: Operand, right: Operand },
    And(Vec<Rule>),
    Or(Vec<Rule>),
    Not(Box<Rule>),
    Translation {
        cycle: CycleRef,
        translation: Translation,
    },
    Failed(CycleRef),
    PastMidpoint(CycleRef),
    NewLow(CycleRef),
    Stale(CycleRef),
    Flag(String),
}

impl Rule {
    /// `$name` parameters referenced anywhere in the rule.
    pub fn referenced_params(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.walk(&mut |rule| {
            if let Some((left, right)) = rule.operands() {
                for operand in [left, right] {
                    if let Operand::Param(name) = operand {
                        out.insert(name.clone());
                    }
                }
            }
        });
        out
    }

    pub fn referenced_flags(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.walk(&mut |rule| {
            if let Rule::Flag(name) = rule {
                out.insert(name.clone());
            }
        });
        out
    }

    /// Other instruments named through `INSTR:level` references.
    pub fn referenced_instruments(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.walk(&mut |rule| {
            let mut refs: Vec<&CycleRef> = Vec::new();
            match rule {
                Rule::Translation { cycle, .. }
                | Rule::Failed(cycle)
                | Rule::PastMidpoint(cycle)
                | Rule::NewLow(cycle)
                | Rule::Stale(cycle) => refs.push(cycle),
                _ => {}
            }
            if let Some((left, right)) = rule.operands() {
                refs.extend(left.cycle_ref());
                refs.extend(right.cycle_ref());
            }
            for cycle in refs {
                if let Some(instrument) = &cycle.instrument {
                    out.insert(instrument.clone());
                }
            }
        });
        out
    }

    fn operands(&self) -> Option<(&Operand, &Operand)> {
        match self {
            Rule::Above { left, right }
            | Rule::Below { left, right }
            | Rule::AtLeast { left, right }
            | Rule::AtMost { left, right }
            | Rule::Equals { left, right } => Some((left, right)),
            _ => None,
        }
    }

    fn walk<F: FnMut(&Rule)>(&self, visit: &mut F) {
        visit(self);
        match self {
            Rule::And(rules) | Rule::Or(rules) => {
                for r in rules {
                    r.walk(visit);
                }
            }
            Rule::Not(inner) => inner.walk(visit),
            _ => {}
        }
    }
}

impl Operand {
    pub fn cycle_ref(&self) -> Option<&CycleRef> {
        match self {
            Operand::Elapsed(c)
            | Operand::Score(c)
            | Operand::Midpoint(c)
            | Operand::WindowMin(c)
            | Operand::WindowMax(c)
            | Operand::Gain(c)
            | Operand::WeakStreak(c) => Some(c),
            _ => None,
        }
    }
}

impl fmt::Display for CycleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(instrument) = &self.instrument {
            write!(f, "{}:", instrument)?;
        }
        match self.selector {
            LevelSelector::Level(level) => write!(f, "{}", level),
            LevelSelector::Parent(level) => write!(f, "PARENT({})", level),
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Close => f.write_str("close"),
            Operand::Constant(v) => write!(f, "{}", v),
            Operand::Param(name) => write!(f, "${}", name),
            Operand::Position => f.write_str("POSITION"),
            Operand::Elapsed(c) => write!(f, "ELAPSED({})", c),
            Operand::Score(c) => write!(f, "SCORE({})", c),
            Operand::Midpoint(c) => write!(f, "MIDPOINT({})", c),
            Operand::WindowMin(c) => write!(f, "WINDOW_MIN({})", c),
            Operand::WindowMax(c) => write!(f, "WINDOW_MAX({})", c),
            Operand::Gain(c) => write!(f, "GAIN({})", c),
            Operand::WeakStreak(c) => write!(f, "WEAK_STREAK({})", c),
        }
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, name: &str, rules: &[Rule]) -> fmt::Result {
    write!(f, "{}(", name)?;
    for (i, r) in rules.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}", r)?;
    }
    f.write_str(")")
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rule::Above { left, right } => write!(f, "ABOVE({}, {})", left, right),
            Rule::Below { left, right } => write!(f, "BELOW({}, {})", left, right),
            Rule::AtLeast { left, right } => write!(f, "AT_LEAST({}, {})", left, right),
            Rule::AtMost { left, right } => write!(f, "AT_MOST({}, {})", left, right),
            Rule::Equals { left, right } => write!(f, "EQUALS({}, {})", left, right),
            Rule::And(rules) => write_list(f, "AND", rules),
            Rule::Or(rules) => write_list(f, "OR", rules),
            Rule::Not(inner) => write!(f, "NOT({})", inner),
            Rule::Translation { cycle, translation } => {
                write!(f, "TRANSLATION({}, {})", cycle, translation)
            }
            Rule::Failed(c) => write!(f, "FAILED({})", c),
            Rule::PastMidpoint(c) => write!(f, "PAST_MIDPOINT({})", c),
            Rule::NewLow(c) => write!(f, "NEW_LOW({})", c),
            Rule::Stale(c) => write!(f, "STALE({})", c),
            Rule::Flag(name) => write!(f, "FLAG({})", name),
        }
    }
}
