//! Multiset bus argument.
//!
//! Bus entries of every machine instance contribute their tuple with a
//! signed multiplicity per row: `+m` for sends and `-m` for receives. The
//! ledger sums these per bus id and tuple over the whole run; the argument
//! holds when every net multiplicity is zero.

use ark_ff::AdditiveGroup;
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::ColumnError;
use crate::field::{Fr, to_signed_string};
use crate::report::{Violation, render_tuple};
use crate::vm::machine::{BusDirection, BusEntry};
use crate::vm::trace::ExecutionTrace;

/// One row's contribution to a bus.
#[derive(Debug, Clone, PartialEq)]
pub struct BusInteraction {
    pub bus_id: u64,
    pub tuple: Vec<Fr>,
    /// Signed multiplicity.
    pub multiplicity: Fr,
}

/// Nonzero contributions of `entries` over every row of `trace`.
pub fn interactions(entries: &[BusEntry], trace: &ExecutionTrace) -> Result<Vec<BusInteraction>, ColumnError> {
    let mut out = Vec::new();
    for entry in entries {
        for row in 0..trace.degree {
            let multiplicity = trace.evaluate(&entry.multiplicity, row)?;
            if multiplicity == Fr::ZERO {
                continue;
            }
            let tuple = entry
                .tuple
                .iter()
                .map(|expr| trace.evaluate(expr, row))
                .collect::<Result<Vec<_>, _>>()?;
            out.push(BusInteraction {
                bus_id: entry.bus_id,
                tuple,
                multiplicity: match entry.direction {
                    BusDirection::Send => multiplicity,
                    BusDirection::Receive => -multiplicity,
                },
            });
        }
    }
    Ok(out)
}

/// Net multiplicity of every tuple on every bus, for one run.
#[derive(Debug, Clone, Default)]
pub struct BusLedger {
    balances: BTreeMap<u64, BTreeMap<Vec<Fr>, Fr>>,
}

impl BusLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, interaction: BusInteraction) {
        *self
            .balances
            .entry(interaction.bus_id)
            .or_default()
            .entry(interaction.tuple)
            .or_insert(Fr::ZERO) += interaction.multiplicity;
    }

    pub fn absorb(&mut self, interactions: impl IntoIterator<Item = BusInteraction>) {
        for interaction in interactions {
            self.record(interaction);
        }
    }

    pub fn net(&self, bus_id: u64, tuple: &[Fr]) -> Fr {
        self.balances
            .get(&bus_id)
            .and_then(|tuples| tuples.get(tuple))
            .copied()
            .unwrap_or(Fr::ZERO)
    }

    /// Tuples with a nonzero net multiplicity, ordered by bus id then tuple.
    pub fn imbalances(&self) -> Vec<Violation> {
        let violations: Vec<Violation> = self
            .balances
            .iter()
            .flat_map(|(bus_id, tuples)| {
                tuples
                    .iter()
                    .filter(|(_, net)| **net != Fr::ZERO)
                    .map(|(tuple, net)| Violation::BusImbalance {
                        bus_id: *bus_id,
                        tuple: render_tuple(tuple),
                        multiplicity: to_signed_string(net),
                    })
            })
            .collect();
        debug!(buses = self.balances.len(), imbalanced = violations.len(), "bus ledger settled");
        violations
    }
}
