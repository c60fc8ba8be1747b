//! Column storage for one machine instance.
//!
//! While a machine runs, its witness cells live in a [`ColumnStore`]: every
//! cell is written at most once, reads of unwritten cells fail, and fixed
//! columns are answered from their generators. Once all rows are produced the
//! store is frozen into a dense [`ExecutionTrace`] that the verification
//! passes read.

use std::collections::{BTreeSet, HashMap};

use crate::digest_sha2;
use crate::error::ColumnError;
use crate::field::{Fr, to_bytes, to_signed_string};
use crate::math::domain::evaluation_domain;
use crate::math::polynomial::Polynomial;
use crate::vm::expr::Expr;
use crate::vm::loader::{FixedColumn, LoadedMachine};

enum Column {
    Fixed(FixedColumn),
    Witness(Vec<Option<Fr>>),
}

/// Write-once cell storage for a machine instance.
pub struct ColumnStore {
    machine: String,
    degree: usize,
    names: Vec<String>,
    columns: HashMap<String, Column>,
    /// Helper columns allowed to stay incomplete until the checker derives them.
    deferred: BTreeSet<String>,
}

impl ColumnStore {
    pub fn new(machine: &LoadedMachine) -> Self {
        let mut names = Vec::new();
        let mut columns = HashMap::new();
        for (name, fixed) in &machine.fixed {
            names.push(name.clone());
            columns.insert(name.clone(), Column::Fixed(fixed.clone()));
        }
        for (name, _) in &machine.witness {
            names.push(name.clone());
            columns.insert(name.clone(), Column::Witness(vec![None; machine.degree]));
        }
        Self {
            machine: machine.name.clone(),
            degree: machine.degree,
            names,
            columns,
            deferred: machine.helpers().map(|(name, _)| name.to_string()).collect(),
        }
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    pub fn machine(&self) -> &str {
        &self.machine
    }

    fn column(&self, column: &str) -> Result<&Column, ColumnError> {
        self.columns.get(column).ok_or_else(|| ColumnError::UnknownColumn {
            machine: self.machine.clone(),
            column: column.to_string(),
        })
    }

    fn check_row(&self, column: &str, row: usize) -> Result<(), ColumnError> {
        if row >= self.degree {
            return Err(ColumnError::OutOfRange {
                machine: self.machine.clone(),
                column: column.to_string(),
                row,
                degree: self.degree,
            });
        }
        Ok(())
    }

    /// Writes a witness cell. Writing the value a cell already holds is a
    /// no-op; writing a different one is a `Redefinition`.
    pub fn set(&mut self, column: &str, row: usize, value: Fr) -> Result<(), ColumnError> {
        self.check_row(column, row)?;
        let machine = &self.machine;
        let cells = match self.columns.get_mut(column) {
            Some(Column::Witness(cells)) => cells,
            Some(Column::Fixed(_)) => {
                return Err(ColumnError::FixedColumnWrite {
                    machine: machine.clone(),
                    column: column.to_string(),
                });
            }
            None => {
                return Err(ColumnError::UnknownColumn {
                    machine: machine.clone(),
                    column: column.to_string(),
                });
            }
        };
        match cells[row] {
            Some(existing) if existing != value => Err(ColumnError::Redefinition {
                machine: machine.clone(),
                column: column.to_string(),
                row,
                existing: to_signed_string(&existing),
                new: to_signed_string(&value),
            }),
            _ => {
                cells[row] = Some(value);
                Ok(())
            }
        }
    }

    /// Reads a cell; `None` if the witness cell has not been written yet.
    pub fn try_get(&self, column: &str, row: usize) -> Result<Option<Fr>, ColumnError> {
        self.check_row(column, row)?;
        Ok(match self.column(column)? {
            Column::Fixed(fixed) => Some(fixed.value_at(row)),
            Column::Witness(cells) => cells[row],
        })
    }

    pub fn get(&self, column: &str, row: usize) -> Result<Fr, ColumnError> {
        self.try_get(column, row)?
            .ok_or_else(|| ColumnError::Unassigned {
                machine: self.machine.clone(),
                column: column.to_string(),
                row,
            })
    }

    pub fn is_assigned(&self, column: &str, row: usize) -> bool {
        matches!(self.try_get(column, row), Ok(Some(_)))
    }

    /// Checks that every witness column other than the deferred helper
    /// columns is fully assigned.
    pub fn finalize(&self) -> Result<(), ColumnError> {
        for name in &self.names {
            if self.deferred.contains(name) {
                continue;
            }
            if let Column::Witness(cells) = &self.columns[name] {
                if let Some(row) = cells.iter().position(Option::is_none) {
                    return Err(ColumnError::IncompleteColumn {
                        machine: self.machine.clone(),
                        column: name.clone(),
                        row,
                    });
                }
            }
        }
        Ok(())
    }

    /// Materializes every column. Fails if any cell, helper or not, is still
    /// unassigned.
    pub fn freeze(self) -> Result<ExecutionTrace, ColumnError> {
        let mut columns = Vec::with_capacity(self.names.len());
        for name in &self.names {
            let values = match &self.columns[name] {
                Column::Fixed(fixed) => (0..self.degree).map(|row| fixed.value_at(row)).collect(),
                Column::Witness(cells) => cells
                    .iter()
                    .enumerate()
                    .map(|(row, cell)| {
                        cell.ok_or_else(|| ColumnError::IncompleteColumn {
                            machine: self.machine.clone(),
                            column: name.clone(),
                            row,
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?,
            };
            columns.push(values);
        }
        let index = self
            .names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Ok(ExecutionTrace {
            machine: self.machine,
            degree: self.degree,
            names: self.names,
            columns,
            index,
        })
    }
}

/// Finalized column values of one machine instance, one vector per column.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionTrace {
    pub machine: String,
    pub degree: usize,
    names: Vec<String>,
    columns: Vec<Vec<Fr>>,
    index: HashMap<String, usize>,
}

impl ExecutionTrace {
    pub fn column_names(&self) -> &[String] {
        &self.names
    }

    pub fn column(&self, name: &str) -> Option<&[Fr]> {
        self.index.get(name).map(|&i| self.columns[i].as_slice())
    }

    pub fn value(&self, name: &str, row: usize) -> Result<Fr, ColumnError> {
        let column = self.column(name).ok_or_else(|| ColumnError::UnknownColumn {
            machine: self.machine.clone(),
            column: name.to_string(),
        })?;
        column.get(row).copied().ok_or_else(|| ColumnError::OutOfRange {
            machine: self.machine.clone(),
            column: name.to_string(),
            row,
            degree: self.degree,
        })
    }

    /// Evaluates `expr` at `row`; next-row references wrap around to row 0.
    pub fn evaluate(&self, expr: &Expr, row: usize) -> Result<Fr, ColumnError> {
        expr.evaluate(row, &|name, next| {
            let at = if next { (row + 1) % self.degree } else { row };
            self.value(name, at)
        })
    }

    /// SHA-256 over column names and canonical cell bytes, in column order.
    pub fn digest(&self) -> [u8; 32] {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(self.machine.as_bytes());
        for (name, values) in self.names.iter().zip(&self.columns) {
            bytes.extend_from_slice(name.as_bytes());
            for value in values {
                bytes.extend_from_slice(&to_bytes(value));
            }
        }
        digest_sha2(&bytes)
    }

    /// Interpolates a column over the evaluation domain.
    pub fn interpolate_column(&self, name: &str) -> Option<Polynomial> {
        let domain = evaluation_domain(self.degree)?;
        Some(Polynomial::interpolate(self.column(name)?.to_vec(), domain))
    }

    /// Prints the selected columns in tabular format.
    pub fn print_trace(&self, columns: &[&str]) {
        println!("{}", columns.join(" | "));
        for row in 0..self.degree {
            let cells: Vec<String> = columns
                .iter()
                .map(|name| {
                    self.value(name, row)
                        .map(|v| to_signed_string(&v))
                        .unwrap_or_else(|_| "?".to_string())
                })
                .collect();
            println!("{}", cells.join(" | "));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::fe;
    use crate::vm::loader::LoadedMachine;
    use crate::vm::machine::{FixedValues, Machine, WitnessSource};

    fn store() -> ColumnStore {
        let machine = Machine::new("M", 4)
            .fixed("ONES", FixedValues::periodic([1]))
            .witness("x", WitnessSource::Free)
            .witness("x_inv", WitnessSource::InverseOf(Expr::col("x")));
        ColumnStore::new(&LoadedMachine::load(&machine).unwrap())
    }

    #[test]
    fn test_write_once_cells() {
        let mut store = store();
        store.set("x", 1, fe(5)).unwrap();
        store.set("x", 1, fe(5)).unwrap();
        assert!(matches!(
            store.set("x", 1, fe(6)),
            Err(ColumnError::Redefinition { row: 1, .. })
        ));
        assert!(matches!(
            store.set("x", 4, fe(6)),
            Err(ColumnError::OutOfRange { row: 4, degree: 4, .. })
        ));
        assert!(matches!(
            store.set("ONES", 0, fe(1)),
            Err(ColumnError::FixedColumnWrite { .. })
        ));
    }

    #[test]
    fn test_reads() {
        let mut store = store();
        assert_eq!(store.get("ONES", 3).unwrap(), fe(1));
        assert!(matches!(store.get("x", 0), Err(ColumnError::Unassigned { row: 0, .. })));
        store.set("x", 0, fe(9)).unwrap();
        assert_eq!(store.get("x", 0).unwrap(), fe(9));
        assert!(matches!(store.get("y", 0), Err(ColumnError::UnknownColumn { .. })));
    }

    #[test]
    fn test_finalize_skips_helpers_but_freeze_does_not() {
        let mut store = store();
        assert!(matches!(
            store.finalize(),
            Err(ColumnError::IncompleteColumn { row: 0, .. })
        ));
        for row in 0..4 {
            store.set("x", row, fe(row as i64)).unwrap();
        }
        store.finalize().unwrap();
        assert!(matches!(
            store.freeze(),
            Err(ColumnError::IncompleteColumn { .. })
        ));
    }

    #[test]
    fn test_trace_evaluation_wraps() {
        let mut store = store();
        for row in 0..4 {
            store.set("x", row, fe(row as i64 + 1)).unwrap();
            store.set("x_inv", row, fe(0)).unwrap();
        }
        let trace = store.freeze().unwrap();
        trace.print_trace(&["ONES", "x"]);
        let step = Expr::next("x") - Expr::col("x");
        assert_eq!(trace.evaluate(&step, 0).unwrap(), fe(1));
        assert_eq!(trace.evaluate(&step, 3).unwrap(), fe(-3));
        assert_eq!(trace.column("x").unwrap().len(), 4);
        assert_eq!(trace.digest(), trace.clone().digest());

        let poly = trace.interpolate_column("x").unwrap();
        let domain = evaluation_domain(4).unwrap();
        assert_eq!(poly.evaluate(ark_poly::EvaluationDomain::element(&domain, 2)), fe(3));
        assert!(trace.interpolate_column("missing").is_none());
    }
}
