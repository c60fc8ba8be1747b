//! Lookup constraints.
//!
//! A lookup compares the tuples of rows selected on its source side with
//! those selected on its target side, which may live in a sub-machine.
//! Containment requires every source tuple to occur among the targets;
//! permutation requires both sides to be the same multiset.

use ark_ff::AdditiveGroup;
use rayon::prelude::*;
use std::collections::{BTreeMap, HashSet};

use crate::error::{ColumnError, MachineError};
use crate::field::Fr;
use crate::report::{Violation, render_tuple};
use crate::vm::loader::LoadedMachine;
use crate::vm::machine::{LookupDef, LookupKind, LookupSide};
use crate::vm::trace::ExecutionTrace;

/// Selected tuples of one side, with the row each came from.
fn selected(side: &LookupSide, trace: &ExecutionTrace) -> Result<Vec<(usize, Vec<Fr>)>, ColumnError> {
    let mut tuples = Vec::new();
    for row in 0..trace.degree {
        if trace.evaluate(&side.selector, row)? == Fr::ZERO {
            continue;
        }
        let tuple = side
            .tuple
            .iter()
            .map(|expr| trace.evaluate(expr, row))
            .collect::<Result<Vec<_>, _>>()?;
        tuples.push((row, tuple));
    }
    Ok(tuples)
}

/// Checks one lookup between `source` and `target`.
pub fn check_lookup(
    lookup: &LookupDef,
    path: &str,
    source: &ExecutionTrace,
    target: &ExecutionTrace,
) -> Result<Vec<Violation>, ColumnError> {
    let sources = selected(&lookup.source, source)?;
    let targets = selected(&lookup.target, target)?;
    let miss = |row: usize, tuple: &[Fr]| Violation::LookupMiss {
        machine: path.to_string(),
        lookup: lookup.name.clone(),
        row,
        tuple: render_tuple(tuple),
    };

    Ok(match lookup.kind {
        LookupKind::Containment => {
            let table: HashSet<&Vec<Fr>> = targets.iter().map(|(_, tuple)| tuple).collect();
            sources
                .iter()
                .filter(|(_, tuple)| !table.contains(tuple))
                .map(|(row, tuple)| miss(*row, tuple))
                .collect()
        }
        LookupKind::Permutation => {
            let mut remaining: BTreeMap<&Vec<Fr>, usize> = BTreeMap::new();
            for (_, tuple) in &targets {
                *remaining.entry(tuple).or_default() += 1;
            }
            let mut violations = Vec::new();
            for (row, tuple) in &sources {
                match remaining.get_mut(tuple) {
                    Some(count) if *count > 0 => *count -= 1,
                    _ => violations.push(miss(*row, tuple)),
                }
            }
            violations.extend(
                remaining
                    .into_iter()
                    .filter(|(_, count)| *count > 0)
                    .map(|(tuple, count)| Violation::PermutationSurplus {
                        machine: path.to_string(),
                        lookup: lookup.name.clone(),
                        tuple: render_tuple(tuple),
                        count,
                    }),
            );
            violations
        }
    })
}

/// Checks every lookup declared by a machine instance.
pub struct LookupEngine<'a> {
    machine: &'a LoadedMachine,
    path: &'a str,
}

impl<'a> LookupEngine<'a> {
    pub fn new(machine: &'a LoadedMachine, path: &'a str) -> Self {
        Self { machine, path }
    }

    fn target<'t>(
        &self,
        lookup: &LookupDef,
        traces: &'t BTreeMap<String, ExecutionTrace>,
    ) -> Result<&'t ExecutionTrace, MachineError> {
        let path = match &lookup.target_instance {
            Some(instance) => format!("{}.{instance}", self.path),
            None => self.path.to_string(),
        };
        traces.get(&path).ok_or_else(|| MachineError::UnknownSubmachine {
            machine: self.machine.name.clone(),
            instance: path,
        })
    }

    /// All lookup violations in declaration order.
    pub fn check(&self, traces: &BTreeMap<String, ExecutionTrace>, parallel: bool) -> Result<Vec<Violation>, MachineError> {
        let source = traces.get(self.path).ok_or_else(|| MachineError::UnknownSubmachine {
            machine: self.machine.name.clone(),
            instance: self.path.to_string(),
        })?;
        let run = |lookup: &LookupDef| -> Result<Vec<Violation>, MachineError> {
            Ok(check_lookup(lookup, self.path, source, self.target(lookup, traces)?)?)
        };
        let per_lookup: Vec<Vec<Violation>> = if parallel {
            self.machine.lookups.par_iter().map(run).collect::<Result<_, _>>()?
        } else {
            self.machine.lookups.iter().map(run).collect::<Result<_, _>>()?
        };
        Ok(per_lookup.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::fe;
    use crate::vm::expr::Expr;
    use crate::vm::machine::{FixedValues, Machine};
    use crate::vm::trace::ColumnStore;
    use proptest::prelude::*;

    fn fixed_trace(source: Vec<i64>, target: Vec<i64>) -> ExecutionTrace {
        let machine = Machine::new("M", source.len())
            .fixed("S", FixedValues::literal(source))
            .fixed("T", FixedValues::literal(target));
        ColumnStore::new(&LoadedMachine::load(&machine).unwrap())
            .freeze()
            .unwrap()
    }

    fn lookup() -> LookupDef {
        LookupDef::new("s_in_t", LookupSide::columns(&["S"]), LookupSide::columns(&["T"]))
    }

    #[test]
    fn test_containment_miss() {
        let trace = fixed_trace(vec![1, 2, 9, 2], vec![1, 2, 3, 4]);
        let violations = check_lookup(&lookup(), "M", &trace, &trace).unwrap();
        assert_eq!(
            violations,
            vec![Violation::LookupMiss {
                machine: "M".to_string(),
                lookup: "s_in_t".to_string(),
                row: 2,
                tuple: vec!["9".to_string()],
            }]
        );
    }

    #[test]
    fn test_vacuous_selector_never_misses() {
        let trace = fixed_trace(vec![7, 7, 7, 7], vec![1, 2, 3, 4]);
        let mut vacuous = lookup();
        vacuous.source.selector = Expr::zero();
        assert!(check_lookup(&vacuous, "M", &trace, &trace).unwrap().is_empty());
    }

    #[test]
    fn test_permutation_counts_multiplicities() {
        let trace = fixed_trace(vec![1, 2, 2, 3], vec![3, 2, 1, 1]);
        let violations = check_lookup(&lookup().permutation(), "M", &trace, &trace).unwrap();
        assert_eq!(violations.len(), 2);
        assert!(matches!(&violations[0], Violation::LookupMiss { row: 2, .. }));
        assert!(matches!(
            &violations[1],
            Violation::PermutationSurplus { count: 1, tuple, .. } if tuple == &vec!["1".to_string()]
        ));
    }

    proptest! {
        #[test]
        fn prop_containment_misses_exactly_values_outside_table(values in prop::collection::vec(0i64..12, 8)) {
            let trace = fixed_trace(values.clone(), (0..8).collect());
            let violations = check_lookup(&lookup(), "M", &trace, &trace).unwrap();
            let expected: Vec<usize> = values
                .iter()
                .enumerate()
                .filter(|(_, value)| **value >= 8)
                .map(|(row, _)| row)
                .collect();
            let rows: Vec<usize> = violations.iter().filter_map(Violation::row).collect();
            prop_assert_eq!(rows, expected);
        }

        #[test]
        fn prop_permutation_of_table_is_clean(seed in any::<u64>()) {
            let mut target: Vec<i64> = (0..8).collect();
            let shift = (seed % 8) as usize;
            target.rotate_left(shift);
            let trace = fixed_trace((0..8).collect(), target);
            prop_assert!(check_lookup(&lookup().permutation(), "M", &trace, &trace).unwrap().is_empty());
        }
    }

    #[test]
    fn test_engine_checks_declared_lookups() {
        let machine = Machine::new("M", 4)
            .fixed("S", FixedValues::literal([1, 2, 9, 2]))
            .fixed("T", FixedValues::literal([1, 2, 3, 4]))
            .lookup(lookup());
        let machine = LoadedMachine::load(&machine).unwrap();
        let trace = ColumnStore::new(&machine).freeze().unwrap();
        let traces = BTreeMap::from([("M".to_string(), trace)]);
        let engine = LookupEngine::new(&machine, "M");
        let sequential = engine.check(&traces, false).unwrap();
        assert_eq!(sequential.len(), 1);
        assert_eq!(sequential[0].row(), Some(2));
        assert_eq!(sequential, engine.check(&traces, true).unwrap());
        assert_eq!(trace_value(&traces, 2), fe(9));
    }

    fn trace_value(traces: &BTreeMap<String, ExecutionTrace>, row: usize) -> Fr {
        traces["M"].value("S", row).unwrap()
    }
}
