//! Polynomial identity checking.
//!
//! Evaluates every identity of a machine over its frozen trace. Identities
//! referencing the next row are transition constraints and are not evaluated
//! on the last row; first-row and last-row identities are boundary
//! constraints. Per-row evaluations can also be interpolated over the
//! evaluation domain, where a satisfied identity is divisible by the
//! vanishing polynomial.

use ark_ff::AdditiveGroup;
use rayon::prelude::*;
use tracing::debug;

use crate::error::ColumnError;
use crate::field::{Fr, to_signed_string};
use crate::math::domain::evaluation_domain;
use crate::math::polynomial::Polynomial;
use crate::report::Violation;
use crate::vm::loader::{LoadedIdentity, LoadedMachine};
use crate::vm::solver::inverse_or_zero;
use crate::vm::trace::{ColumnStore, ExecutionTrace};

/// Checks the identities of one machine instance.
pub struct ConstraintChecker<'a> {
    machine: &'a LoadedMachine,
    /// Instance path used in violations.
    path: &'a str,
}

impl<'a> ConstraintChecker<'a> {
    pub fn new(machine: &'a LoadedMachine, path: &'a str) -> Self {
        Self { machine, path }
    }

    /// Fills every unassigned helper cell with the inverse of its source
    /// expression, or zero where the source is zero. Returns the number of
    /// cells written.
    pub fn derive_helpers(&self, store: &mut ColumnStore) -> Result<usize, ColumnError> {
        let mut derived = 0;
        for (column, source) in self.machine.helpers() {
            for row in 0..store.degree() {
                if store.is_assigned(column, row) {
                    continue;
                }
                let value = source.evaluate(row, &|name, _| store.get(name, row))?;
                store.set(column, row, inverse_or_zero(value))?;
                derived += 1;
            }
        }
        if derived > 0 {
            debug!(machine = self.path, derived, "helper cells derived");
        }
        Ok(derived)
    }

    /// Evaluates `identity` at each row it applies to; other rows are zero.
    pub fn evaluations(&self, trace: &ExecutionTrace, identity: &LoadedIdentity) -> Result<Vec<Fr>, ColumnError> {
        let mut evaluations = vec![Fr::ZERO; trace.degree];
        for row in identity.rows(trace.degree) {
            evaluations[row] = trace.evaluate(&identity.expr, row)?;
        }
        Ok(evaluations)
    }

    fn check_identity(&self, trace: &ExecutionTrace, identity: &LoadedIdentity) -> Result<Vec<Violation>, ColumnError> {
        Ok(self
            .evaluations(trace, identity)?
            .into_iter()
            .enumerate()
            .filter(|(_, value)| *value != Fr::ZERO)
            .map(|(row, value)| Violation::ConstraintViolation {
                machine: self.path.to_string(),
                identity: identity.name.clone(),
                row,
                value: to_signed_string(&value),
            })
            .collect())
    }

    /// Every failing (identity, row) pair, in identity then row order.
    pub fn check(&self, trace: &ExecutionTrace, parallel: bool) -> Result<Vec<Violation>, ColumnError> {
        let identities = &self.machine.identities;
        let per_identity: Vec<Vec<Violation>> = if parallel {
            identities
                .par_iter()
                .map(|identity| self.check_identity(trace, identity))
                .collect::<Result<_, _>>()?
        } else {
            identities
                .iter()
                .map(|identity| self.check_identity(trace, identity))
                .collect::<Result<_, _>>()?
        };
        Ok(per_identity.into_iter().flatten().collect())
    }

    /// Checks if all identities are satisfied.
    pub fn is_satisfied(&self, trace: &ExecutionTrace) -> Result<bool, ColumnError> {
        Ok(self.check(trace, false)?.is_empty())
    }

    /// Interpolates an identity's per-row evaluations over the evaluation
    /// domain.
    pub fn identity_polynomial(
        &self,
        trace: &ExecutionTrace,
        identity: &LoadedIdentity,
    ) -> Result<Option<Polynomial>, ColumnError> {
        let Some(domain) = evaluation_domain(trace.degree) else {
            return Ok(None);
        };
        Ok(Some(Polynomial::interpolate(self.evaluations(trace, identity)?, domain)))
    }

    /// Whether the identity polynomial is divisible by the vanishing
    /// polynomial of the domain.
    pub fn identity_vanishes(&self, trace: &ExecutionTrace, identity: &LoadedIdentity) -> Result<bool, ColumnError> {
        let Some(domain) = evaluation_domain(trace.degree) else {
            return Ok(false);
        };
        Ok(self
            .identity_polynomial(trace, identity)?
            .is_some_and(|poly| poly.vanishes_on(&domain)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::fe;
    use crate::vm::expr::Expr;
    use crate::vm::machine::{Identity, Machine, WitnessSource};
    use ark_ff::Zero;
    use ark_poly::EvaluationDomain;

    fn machine() -> LoadedMachine {
        let machine = Machine::new("Counter", 4)
            .witness("x", WitnessSource::Free)
            .witness("y", WitnessSource::Free)
            .witness("x_inv", WitnessSource::InverseOf(Expr::col("x")))
            .identity(Identity::new("y_equals_2x", Expr::col("y"), Expr::constant(2) * Expr::col("x")))
            .identity(Identity::new("x_increments", Expr::next("x"), Expr::col("x") + Expr::one()))
            .identity(Identity::zero("x_starts_at_zero", Expr::col("x")).first_row())
            .identity(Identity::new("x_ends_at_three", Expr::col("x"), Expr::constant(3)).last_row());
        LoadedMachine::load(&machine).unwrap()
    }

    fn trace(machine: &LoadedMachine, xs: [i64; 4]) -> ExecutionTrace {
        let mut store = ColumnStore::new(machine);
        for (row, x) in xs.into_iter().enumerate() {
            store.set("x", row, fe(x)).unwrap();
            store.set("y", row, fe(2 * x)).unwrap();
        }
        let checker = ConstraintChecker::new(machine, "Counter");
        assert_eq!(checker.derive_helpers(&mut store).unwrap(), 4);
        store.freeze().unwrap()
    }

    #[test]
    fn test_transition_and_boundary_constraints() {
        let machine = machine();
        let trace = trace(&machine, [0, 1, 2, 3]);
        let checker = ConstraintChecker::new(&machine, "Counter");
        assert!(checker.is_satisfied(&trace).unwrap());
        // x[0] != x[3] + 1, but the wrap-around pair is not checked
        assert_eq!(machine.identities[1].rows(4), 0..3);
        assert_eq!(trace.value("x_inv", 0).unwrap(), fe(0));
        assert_eq!(trace.value("x_inv", 2).unwrap() * fe(2), fe(1));
    }

    #[test]
    fn test_unsatisfied_constraint() {
        let machine = machine();
        // x[n] = 2n instead of n
        let trace = trace(&machine, [0, 2, 4, 6]);
        let checker = ConstraintChecker::new(&machine, "Counter");
        let violations = checker.check(&trace, false).unwrap();
        let failing: Vec<(&str, usize)> = violations
            .iter()
            .map(|v| match v {
                Violation::ConstraintViolation { identity, row, .. } => (identity.as_str(), *row),
                other => panic!("unexpected {other}"),
            })
            .collect();
        assert_eq!(
            failing,
            vec![
                ("x_increments", 0),
                ("x_increments", 1),
                ("x_increments", 2),
                ("x_ends_at_three", 3),
            ]
        );
        assert_eq!(violations, checker.check(&trace, true).unwrap());
        assert_eq!(violations, checker.check(&trace, false).unwrap());
    }

    #[test]
    fn test_constraint_interpolation() {
        let machine = machine();
        let checker = ConstraintChecker::new(&machine, "Counter");
        let domain = evaluation_domain(4).unwrap();

        let good = trace(&machine, [0, 1, 2, 3]);
        for identity in &machine.identities {
            let poly = checker.identity_polynomial(&good, identity).unwrap().unwrap();
            for point in domain.elements() {
                assert!(poly.evaluate(point).is_zero());
            }
            assert!(checker.identity_vanishes(&good, identity).unwrap());
        }

        let bad = trace(&machine, [0, 2, 4, 6]);
        let increments = &machine.identities[1];
        assert!(!checker.identity_vanishes(&bad, increments).unwrap());
    }
}
