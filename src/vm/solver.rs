//! Fixpoint solver for the cells of one row.
//!
//! A row is described by a [`System`]: equations that must vanish, query
//! cells, inverse helpers and lookups into fixed tables. [`solve`] repeatedly
//! scans the system and fills any cell that is the single unknown of an
//! equation (by affine back-substitution), the value of a query whose
//! arguments are known, the inverse of a known helper source, or the missing
//! element of a lookup tuple whose other elements select a unique table row.
//! When a full scan makes no progress but some equation has a single
//! unknown it cannot determine (zero coefficient or non-linear), that cell is
//! set to zero with a diagnostic and the scan resumes. Otherwise it stops.
//!
//! The solver does not know where cells live. A [`Frame`] maps references to
//! storage: the executor's frame reads registers, the block and pure machine
//! frame reads the column store with next-row references at `row + 1`.

use ark_ff::{AdditiveGroup, Field};
use std::collections::BTreeSet;
use tracing::warn;

use crate::error::MachineError;
use crate::field::Fr;
use crate::report::{Violation, render_tuple};
use crate::vm::expr::{Expr, solve_affine};
use crate::vm::loader::{LoadedIdentity, LoadedMachine};
use crate::vm::machine::{IdentityScope, WitnessSource};
use crate::vm::query::QueryCallback;
use crate::vm::trace::ColumnStore;

/// Cell storage seen by the solver.
pub trait Frame {
    fn row(&self) -> usize;

    fn degree(&self) -> usize;

    fn known(&self, column: &str, next: bool) -> Option<Fr>;

    /// Whether the solver may write this cell.
    fn solvable(&self, column: &str, next: bool) -> bool;

    fn assign(&mut self, column: &str, next: bool, value: Fr) -> Result<(), MachineError>;
}

/// Where solver diagnostics go.
pub struct Context<'a> {
    /// Instance path used in diagnostics.
    pub machine: &'a str,
    pub queries: &'a dyn QueryCallback,
    pub violations: &'a mut Vec<Violation>,
}

impl Context<'_> {
    pub fn non_invertible(&mut self, identity: &str, row: usize, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(machine = self.machine, identity, row, %reason, "constraint not solvable");
        self.violations.push(Violation::NonInvertibleConstraint {
            machine: self.machine.to_string(),
            identity: identity.to_string(),
            row,
            reason,
        });
    }

    /// Resolves a query, defaulting to zero when unanswered.
    pub fn query(&mut self, kind: &str, args: &[Fr], row: usize) -> Fr {
        match self.queries.resolve(kind, args) {
            Some(value) => value,
            None => {
                warn!(machine = self.machine, kind, row, "query unanswered");
                self.violations.push(Violation::MissingQueryResponse {
                    machine: self.machine.to_string(),
                    query: kind.to_string(),
                    args: render_tuple(args),
                    row,
                });
                Fr::ZERO
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Equation {
    pub name: String,
    pub expr: Expr,
    pub scope: IdentityScope,
}

impl Equation {
    fn applies(&self, row: usize, degree: usize) -> bool {
        match self.scope {
            IdentityScope::FirstRow => row == 0,
            IdentityScope::LastRow => row + 1 == degree,
            IdentityScope::EveryRow => !self.expr.has_next() || row + 1 < degree,
        }
    }
}

impl From<&LoadedIdentity> for Equation {
    fn from(identity: &LoadedIdentity) -> Self {
        Self {
            name: identity.name.clone(),
            expr: identity.expr.clone(),
            scope: identity.scope,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryCell {
    pub column: String,
    pub kind: String,
    pub args: Vec<Expr>,
}

/// A lookup whose target is a fixed table of this machine.
#[derive(Debug, Clone)]
pub struct TableLookup {
    pub name: String,
    pub selector: Expr,
    pub tuple: Vec<Expr>,
    /// Selected target tuples in row order.
    pub rows: Vec<Vec<Fr>>,
}

#[derive(Debug, Clone, Default)]
pub struct System {
    pub equations: Vec<Equation>,
    pub queries: Vec<QueryCell>,
    /// Inverse helper columns and their sources.
    pub helpers: Vec<(String, Expr)>,
    pub lookups: Vec<TableLookup>,
}

impl System {
    /// Everything that determines a row of a machine without a program
    /// counter.
    pub fn for_rows(machine: &LoadedMachine) -> Self {
        let mut system = Self::for_columns(machine);
        system.equations.extend(machine.identities.iter().map(Equation::from));
        system.lookups = table_lookups(machine);
        system
    }

    /// What the solver may use on a row of a program-counter machine: the
    /// column definitions, the declared identities that stay within one row
    /// and the fixed-table lookups. Transitions belong to the executor.
    pub fn for_program(machine: &LoadedMachine) -> Self {
        let mut system = Self::for_columns(machine);
        system.equations.extend(
            machine
                .declared_identities()
                .iter()
                .filter(|identity| !identity.is_transition())
                .map(Equation::from),
        );
        system.lookups = table_lookups(machine);
        system
    }

    /// Defined, query and helper columns only.
    fn for_columns(machine: &LoadedMachine) -> Self {
        let mut system = Self::default();
        for (column, source) in &machine.witness {
            match source {
                WitnessSource::Free => {}
                WitnessSource::Defined(expr) => system.equations.push(Equation {
                    name: column.clone(),
                    expr: Expr::col(column) - expr.clone(),
                    scope: IdentityScope::EveryRow,
                }),
                WitnessSource::Query { kind, args } => system.queries.push(QueryCell {
                    column: column.clone(),
                    kind: kind.clone(),
                    args: args.clone(),
                }),
                WitnessSource::InverseOf(expr) => system.helpers.push((column.clone(), expr.clone())),
            }
        }
        system
    }

    fn is_helper(&self, column: &str) -> bool {
        self.helpers.iter().any(|(name, _)| name == column)
    }
}

/// Lookups into tables built only from fixed columns.
fn table_lookups(machine: &LoadedMachine) -> Vec<TableLookup> {
    let fixed = |name: &str, next: bool| -> Result<Fr, ()> {
        match machine.fixed.iter().find(|(n, _)| n == name) {
            Some((_, column)) if !next => Ok(column.value_at(0)),
            _ => Err(()),
        }
    };
    machine
        .lookups
        .iter()
        .filter(|lookup| lookup.target_instance.is_none())
        .filter(|lookup| {
            std::iter::once(&lookup.target.selector)
                .chain(&lookup.target.tuple)
                .all(|expr| expr.evaluate(0, &fixed).is_ok())
        })
        .map(|lookup| {
            let value_at = |row: usize| {
                move |name: &str, _next: bool| -> Result<Fr, ()> {
                    machine
                        .fixed
                        .iter()
                        .find(|(n, _)| n == name)
                        .map(|(_, column)| column.value_at(row))
                        .ok_or(())
                }
            };
            let rows = (0..machine.degree)
                .filter(|&row| {
                    lookup
                        .target
                        .selector
                        .evaluate(row, &value_at(row))
                        .is_ok_and(|s| s != Fr::ZERO)
                })
                .filter_map(|row| {
                    lookup
                        .target
                        .tuple
                        .iter()
                        .map(|expr| expr.evaluate(row, &value_at(row)))
                        .collect::<Result<Vec<_>, _>>()
                        .ok()
                })
                .collect();
            TableLookup {
                name: lookup.name.clone(),
                selector: lookup.source.selector.clone(),
                tuple: lookup.source.tuple.clone(),
                rows,
            }
        })
        .collect()
}

fn evaluate_known(frame: &impl Frame, expr: &Expr) -> Option<Fr> {
    expr.evaluate(frame.row(), &|name, next| frame.known(name, next).ok_or(()))
        .ok()
}

fn unknowns(frame: &impl Frame, expr: &Expr) -> Vec<(String, bool)> {
    expr.references()
        .into_iter()
        .filter(|(name, next)| frame.known(name, *next).is_none())
        .collect()
}

/// Inverse of `value`, or zero for zero.
pub fn inverse_or_zero(value: Fr) -> Fr {
    value.inverse().unwrap_or(Fr::ZERO)
}

#[derive(Clone, PartialEq, Eq)]
enum Progress {
    Done,
    Waiting,
    /// Single unknown that the equation cannot determine.
    Blocked { column: String, next: bool, reason: String },
}

/// Solves the row held by `frame` to a fixpoint. Returns the names of
/// applicable equations that still have unknowns.
pub fn solve(frame: &mut impl Frame, system: &System, ctx: &mut Context<'_>) -> Result<Vec<String>, MachineError> {
    let row = frame.row();
    let degree = frame.degree();
    let mut equations: Vec<&Equation> = system
        .equations
        .iter()
        .filter(|eq| eq.applies(row, degree))
        .collect();
    let mut queries: Vec<&QueryCell> = system.queries.iter().collect();
    let mut lookups: Vec<&TableLookup> = system.lookups.iter().collect();

    loop {
        let mut progress = false;

        for (column, source) in &system.helpers {
            if frame.known(column, false).is_some() {
                continue;
            }
            if let Some(value) = evaluate_known(&*frame, source) {
                frame.assign(column, false, inverse_or_zero(value))?;
                progress = true;
            }
        }

        let mut waiting = Vec::with_capacity(queries.len());
        for query in queries {
            if frame.known(&query.column, false).is_some() {
                continue;
            }
            let args: Option<Vec<Fr>> = query.args.iter().map(|arg| evaluate_known(&*frame, arg)).collect();
            match args {
                Some(args) => {
                    let value = ctx.query(&query.kind, &args, row);
                    frame.assign(&query.column, false, value)?;
                    progress = true;
                }
                None => waiting.push(query),
            }
        }
        queries = waiting;

        let mut waiting = Vec::with_capacity(equations.len());
        let mut blocked = None;
        for equation in equations {
            match solve_equation(frame, system, equation)? {
                Progress::Done => progress = true,
                Progress::Waiting => waiting.push(equation),
                Progress::Blocked { column, next, reason } => {
                    if blocked.is_none() {
                        blocked = Some((waiting.len(), column, next, reason));
                    }
                    waiting.push(equation);
                }
            }
        }
        equations = waiting;

        let mut waiting = Vec::with_capacity(lookups.len());
        for lookup in lookups {
            match solve_lookup(frame, system, lookup)? {
                Progress::Done => progress = true,
                Progress::Waiting | Progress::Blocked { .. } => waiting.push(lookup),
            }
        }
        lookups = waiting;

        if !progress {
            // Another equation may still determine the cell; only give up on
            // it once nothing else moves.
            let Some((index, column, next, reason)) = blocked else {
                break;
            };
            let equation = equations.remove(index);
            ctx.non_invertible(&equation.name, row, reason);
            frame.assign(&column, next, Fr::ZERO)?;
        }
    }

    Ok(equations.into_iter().map(|eq| eq.name.clone()).collect())
}

fn solve_equation(frame: &mut impl Frame, system: &System, equation: &Equation) -> Result<Progress, MachineError> {
    let missing = unknowns(&*frame, &equation.expr);
    let [(column, next)] = missing.as_slice() else {
        // Either fully known, left to the checker, or still underdetermined.
        return Ok(if missing.is_empty() {
            Progress::Done
        } else {
            Progress::Waiting
        });
    };
    if !frame.solvable(column, *next) || (!*next && system.is_helper(column)) {
        return Ok(Progress::Waiting);
    }
    let row = frame.row();
    let cell = |name: &str, next: bool| frame.known(name, next);
    let value = match solve_affine(&equation.expr, (column.as_str(), *next), row, &cell) {
        Ok(Some(value)) => value,
        Ok(None) => return Ok(Progress::Waiting),
        Err(failure) => {
            return Ok(Progress::Blocked {
                column: column.clone(),
                next: *next,
                reason: failure.to_string(),
            });
        }
    };
    frame.assign(column, *next, value)?;
    Ok(Progress::Done)
}

fn solve_lookup(frame: &mut impl Frame, system: &System, lookup: &TableLookup) -> Result<Progress, MachineError> {
    let Some(selector) = evaluate_known(&*frame, &lookup.selector) else {
        return Ok(Progress::Waiting);
    };
    if selector == Fr::ZERO {
        return Ok(Progress::Done);
    }

    let mut known = Vec::with_capacity(lookup.tuple.len());
    let mut unknown = Vec::new();
    let mut cells = BTreeSet::new();
    for (index, element) in lookup.tuple.iter().enumerate() {
        match evaluate_known(&*frame, element) {
            Some(value) => known.push((index, value)),
            None => {
                let mut missing = unknowns(&*frame, element);
                if missing.len() != 1 {
                    return Ok(Progress::Waiting);
                }
                let (column, next) = missing.remove(0);
                let writable = frame.solvable(&column, next) && (next || !system.is_helper(&column));
                if !writable || !cells.insert((column.clone(), next)) {
                    return Ok(Progress::Waiting);
                }
                unknown.push((index, column, next));
            }
        }
    }
    if unknown.is_empty() {
        return Ok(Progress::Done);
    }

    // First selected target row agreeing with every known element.
    let Some(target) = lookup
        .rows
        .iter()
        .find(|target| known.iter().all(|(index, value)| target[*index] == *value))
    else {
        // Leave the cells for the lookup pass to report.
        return Ok(Progress::Done);
    };
    let row = frame.row();
    for (index, column, next) in unknown {
        let equation = lookup.tuple[index].clone() - Expr::Const(target[index]);
        let cell = |name: &str, next: bool| frame.known(name, next);
        match solve_affine(&equation, (column.as_str(), next), row, &cell) {
            Ok(Some(value)) => frame.assign(&column, next, value)?,
            _ => return Ok(Progress::Waiting),
        }
    }
    Ok(Progress::Done)
}

/// Frame over the column store of a machine without a program counter.
pub struct StoreFrame<'s> {
    store: &'s mut ColumnStore,
    row: usize,
    writable: &'s BTreeSet<String>,
}

impl<'s> StoreFrame<'s> {
    pub fn new(store: &'s mut ColumnStore, row: usize, writable: &'s BTreeSet<String>) -> Self {
        Self { store, row, writable }
    }

    fn at(&self, next: bool) -> Option<usize> {
        let row = self.row + usize::from(next);
        (row < self.store.degree()).then_some(row)
    }
}

impl Frame for StoreFrame<'_> {
    fn row(&self) -> usize {
        self.row
    }

    fn degree(&self) -> usize {
        self.store.degree()
    }

    fn known(&self, column: &str, next: bool) -> Option<Fr> {
        self.store.try_get(column, self.at(next)?).ok().flatten()
    }

    fn solvable(&self, column: &str, next: bool) -> bool {
        self.at(next).is_some() && self.writable.contains(column)
    }

    fn assign(&mut self, column: &str, next: bool, value: Fr) -> Result<(), MachineError> {
        let row = self.at(next).ok_or_else(|| MachineError::RowLimitExceeded {
            machine: self.store.machine().to_string(),
            degree: self.store.degree(),
        })?;
        Ok(self.store.set(column, row, value)?)
    }
}

/// Witness columns the row solver may write: everything that is not a
/// helper, whose cells the helper pass derives.
pub fn writable_columns(machine: &LoadedMachine) -> BTreeSet<String> {
    machine
        .witness
        .iter()
        .filter(|(_, source)| !matches!(source, WitnessSource::InverseOf(_)))
        .map(|(name, _)| name.clone())
        .collect()
}

/// Solves one row of `store` and defaults every still-unassigned cell in
/// `writable` to zero, reporting each as unsolvable.
pub fn solve_row(
    store: &mut ColumnStore,
    row: usize,
    system: &System,
    writable: &BTreeSet<String>,
    ctx: &mut Context<'_>,
) -> Result<(), MachineError> {
    let stuck = solve(&mut StoreFrame::new(store, row, writable), system, ctx)?;
    for column in writable {
        if store.is_assigned(column, row) {
            continue;
        }
        let reason = if stuck.is_empty() {
            "no constraint determines the cell".to_string()
        } else {
            format!("underdetermined by {}", stuck.join(", "))
        };
        ctx.non_invertible(column, row, reason);
        store.set(column, row, Fr::ZERO)?;
    }
    Ok(())
}
