//! Collected diagnostics.
//!
//! Anything that makes a witness invalid without making the definition
//! unusable ends up here. Values are rendered as signed decimals so reports
//! compare and serialize without depending on the field representation.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::field::{Fr, to_signed_string};

/// Renders a tuple of field elements for a report.
pub fn render_tuple(values: &[Fr]) -> Vec<String> {
    values.iter().map(to_signed_string).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    #[error("{machine}: identity `{identity}` is {value} at row {row}")]
    ConstraintViolation {
        machine: String,
        identity: String,
        row: usize,
        value: String,
    },

    #[error("{machine}: lookup `{lookup}` has no target for {tuple:?} at row {row}")]
    LookupMiss {
        machine: String,
        lookup: String,
        row: usize,
        tuple: Vec<String>,
    },

    #[error("{machine}: permutation `{lookup}` has {count} unmatched target tuple(s) {tuple:?}")]
    PermutationSurplus {
        machine: String,
        lookup: String,
        tuple: Vec<String>,
        count: usize,
    },

    #[error("bus {bus_id}: tuple {tuple:?} has net multiplicity {multiplicity}")]
    BusImbalance {
        bus_id: u64,
        tuple: Vec<String>,
        multiplicity: String,
    },

    #[error("{machine}: cannot solve `{identity}` at row {row}: {reason}")]
    NonInvertibleConstraint {
        machine: String,
        identity: String,
        row: usize,
        reason: String,
    },

    #[error("{machine}: no response to query `{query}` {args:?} at row {row}")]
    MissingQueryResponse {
        machine: String,
        query: String,
        args: Vec<String>,
        row: usize,
    },
}

impl Violation {
    /// Machine instance the violation belongs to; `None` for bus imbalances,
    /// which span the whole run.
    pub fn machine(&self) -> Option<&str> {
        match self {
            Violation::ConstraintViolation { machine, .. }
            | Violation::LookupMiss { machine, .. }
            | Violation::PermutationSurplus { machine, .. }
            | Violation::NonInvertibleConstraint { machine, .. }
            | Violation::MissingQueryResponse { machine, .. } => Some(machine),
            Violation::BusImbalance { .. } => None,
        }
    }

    pub fn row(&self) -> Option<usize> {
        match self {
            Violation::ConstraintViolation { row, .. }
            | Violation::LookupMiss { row, .. }
            | Violation::NonInvertibleConstraint { row, .. }
            | Violation::MissingQueryResponse { row, .. } => Some(*row),
            Violation::PermutationSurplus { .. } | Violation::BusImbalance { .. } => None,
        }
    }
}

/// Outcome of a run: execution diagnostics followed by the findings of the
/// identity, lookup and bus passes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub violations: Vec<Violation>,
    /// Violations dropped because of the configured limit.
    pub truncated: usize,
}

impl VerificationReport {
    pub fn new(mut violations: Vec<Violation>, limit: Option<usize>) -> Self {
        let truncated = match limit {
            Some(limit) if violations.len() > limit => {
                let dropped = violations.len() - limit;
                violations.truncate(limit);
                dropped
            }
            _ => 0,
        };
        Self {
            violations,
            truncated,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.violations.is_empty() && self.truncated == 0
    }

    pub fn len(&self) -> usize {
        self.violations.len() + self.truncated
    }

    pub fn constraint_violations(&self) -> impl Iterator<Item = &Violation> {
        self.violations
            .iter()
            .filter(|v| matches!(v, Violation::ConstraintViolation { .. }))
    }

    pub fn lookup_misses(&self) -> impl Iterator<Item = &Violation> {
        self.violations
            .iter()
            .filter(|v| matches!(v, Violation::LookupMiss { .. }))
    }

    pub fn bus_imbalances(&self) -> impl Iterator<Item = &Violation> {
        self.violations
            .iter()
            .filter(|v| matches!(v, Violation::BusImbalance { .. }))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for VerificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "all constraints satisfied");
        }
        for violation in &self.violations {
            writeln!(f, "{violation}")?;
        }
        if self.truncated > 0 {
            writeln!(f, "... and {} more", self.truncated)?;
        }
        Ok(())
    }
}
