//! Threshold evaluator (§4.4).
//!
//! Per-source `warning`/`critical` rule tables map a compiled regex
//! (matched against `event.service`) to a compiled predicate over the
//! event's `metric`. The predicate mini-language is a closed grammar —
//! comparisons combined with `AND`/`OR` — compiled once at config time
//! into an expression tree, never evaluated with a general-purpose
//! interpreter.

use regex::Regex;
use thiserror::Error;

use crate::event::Event;

#[derive(Debug, Error)]
pub enum ThresholdError {
    #[error("invalid regex {pattern:?}: {source}")]
    Regex { pattern: String, #[source] source: regex::Error },
    #[error("invalid predicate {input:?}: {reason}")]
    Predicate { input: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
}

#[derive(Debug, Clone, Copy)]
struct Comparison {
    op: Op,
    value: f64,
}

impl Comparison {
    fn matches(self, metric: f64) -> bool {
        match self.op {
            Op::Gt => metric > self.value,
            Op::Ge => metric >= self.value,
            Op::Lt => metric < self.value,
            Op::Le => metric <= self.value,
            Op::Eq => metric == self.value,
            Op::Ne => metric != self.value,
        }
    }
}

/// A compiled predicate tree: comparisons combined with `AND` (binds
/// tighter) and `OR`, left-associative.
#[derive(Debug, Clone)]
pub struct Predicate {
    // Sum of products: outer Vec is OR'd, inner Vec is AND'd.
    terms: Vec<Vec<Comparison>>,
}

impl Predicate {
    pub fn compile(input: &str) -> Result<Self, ThresholdError> {
        let mut terms = Vec::new();
        for or_clause in input.split("OR") {
            let mut clause = Vec::new();
            for and_clause in or_clause.split("AND") {
                clause.push(parse_comparison(input, and_clause)?);
            }
            terms.push(clause);
        }
        Ok(Predicate { terms })
    }

    pub fn eval(&self, metric: f64) -> bool {
        self.terms
            .iter()
            .any(|and_clause| and_clause.iter().all(|c| c.matches(metric)))
    }
}

fn parse_comparison(whole: &str, s: &str) -> Result<Comparison, ThresholdError> {
    let s = s.trim();
    let err = || ThresholdError::Predicate {
        input: whole.to_string(),
        reason: format!("could not parse comparison {s:?}"),
    };

    let (op, rest) = if let Some(rest) = s.strip_prefix(">=") {
        (Op::Ge, rest)
    } else if let Some(rest) = s.strip_prefix("<=") {
        (Op::Le, rest)
    } else if let Some(rest) = s.strip_prefix("==") {
        (Op::Eq, rest)
    } else if let Some(rest) = s.strip_prefix("!=") {
        (Op::Ne, rest)
    } else if let Some(rest) = s.strip_prefix('>') {
        (Op::Gt, rest)
    } else if let Some(rest) = s.strip_prefix('<') {
        (Op::Lt, rest)
    } else {
        return Err(err());
    };

    let value: f64 = rest.trim().parse().map_err(|_| err())?;
    Ok(Comparison { op, value })
}

/// One compiled `(regex, predicate)` rule.
pub struct Rule {
    pub pattern: Regex,
    pub predicate: Predicate,
}

/// A source's compiled `warning`/`critical` rule tables. Rules are
/// tried in insertion order; the first match within a table wins.
#[derive(Default)]
pub struct Evaluator {
    warning: Vec<Rule>,
    critical: Vec<Rule>,
}

impl Evaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compile(
        warning: &[(String, String)],
        critical: &[(String, String)],
    ) -> Result<Self, ThresholdError> {
        Ok(Evaluator {
            warning: compile_table(warning)?,
            critical: compile_table(critical)?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.warning.is_empty() && self.critical.is_empty()
    }

    /// Applies warning rules then critical rules to an event already at
    /// state "ok"; preserves any other pre-existing state untouched.
    pub fn apply(&self, event: &mut Event) {
        if !event.is_ok() {
            return;
        }
        let Some(metric) = event.metric else { return };

        if let Some(rule) = first_match(&self.warning, &event.service, metric) {
            let _ = rule;
            event.state = "warning".into();
        }
        if let Some(rule) = first_match(&self.critical, &event.service, metric) {
            let _ = rule;
            event.state = "critical".into();
        }
    }
}

fn first_match<'a>(rules: &'a [Rule], service: &str, metric: f64) -> Option<&'a Rule> {
    rules
        .iter()
        .find(|rule| rule.pattern.is_match(service) && rule.predicate.eval(metric))
}

fn compile_table(table: &[(String, String)]) -> Result<Vec<Rule>, ThresholdError> {
    table
        .iter()
        .map(|(pattern, predicate)| {
            let regex = Regex::new(pattern).map_err(|source| ThresholdError::Regex {
                pattern: pattern.clone(),
                source,
            })?;
            Ok(Rule { pattern: regex, predicate: Predicate::compile(predicate)? })
        })
        .collect()
}
