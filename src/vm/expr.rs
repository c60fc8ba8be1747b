//! Polynomial expressions over machine columns.
//!
//! Expressions are the common currency of the engine: identities, lookup
//! tuples, bus tuples, defined witness columns and operand values are all
//! built from them. A reference is either to the current row (`x`) or to the
//! next row (`x'`).

use ark_ff::{AdditiveGroup, Field, One, Zero};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::ops::{Add, Mul, Neg, Sub};

use crate::field::{Fr, fe, serde_fr};

/// A column reference: `(name, is_next_row)`.
pub type Reference = (String, bool);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    Const(#[serde(with = "serde_fr")] Fr),
    Col(String),
    Next(String),
    /// The row index, only meaningful in fixed column definitions.
    RowIndex,
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Neg(Box<Expr>),
    Pow(Box<Expr>, u32),
}

impl Expr {
    pub fn col(name: impl Into<String>) -> Self {
        Expr::Col(name.into())
    }

    pub fn next(name: impl Into<String>) -> Self {
        Expr::Next(name.into())
    }

    pub fn constant(value: i64) -> Self {
        Expr::Const(fe(value))
    }

    pub fn zero() -> Self {
        Expr::Const(Fr::ZERO)
    }

    pub fn one() -> Self {
        Expr::Const(Fr::ONE)
    }

    pub fn pow(self, exponent: u32) -> Self {
        Expr::Pow(Box::new(self), exponent)
    }

    /// Evaluates the expression at `row`, resolving column references with
    /// `value_of(name, is_next)`.
    pub fn evaluate<E>(
        &self,
        row: usize,
        value_of: &impl Fn(&str, bool) -> Result<Fr, E>,
    ) -> Result<Fr, E> {
        Ok(match self {
            Expr::Const(value) => *value,
            Expr::Col(name) => value_of(name, false)?,
            Expr::Next(name) => value_of(name, true)?,
            Expr::RowIndex => Fr::from(row as u64),
            Expr::Add(a, b) => a.evaluate(row, value_of)? + b.evaluate(row, value_of)?,
            Expr::Sub(a, b) => a.evaluate(row, value_of)? - b.evaluate(row, value_of)?,
            Expr::Mul(a, b) => a.evaluate(row, value_of)? * b.evaluate(row, value_of)?,
            Expr::Neg(a) => -a.evaluate(row, value_of)?,
            Expr::Pow(a, exponent) => a.evaluate(row, value_of)?.pow([u64::from(*exponent)]),
        })
    }

    /// Collects every column reference.
    pub fn references(&self) -> BTreeSet<Reference> {
        let mut out = BTreeSet::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references(&self, out: &mut BTreeSet<Reference>) {
        match self {
            Expr::Col(name) => {
                out.insert((name.clone(), false));
            }
            Expr::Next(name) => {
                out.insert((name.clone(), true));
            }
            Expr::Const(_) | Expr::RowIndex => {}
            Expr::Add(a, b) | Expr::Sub(a, b) | Expr::Mul(a, b) => {
                a.collect_references(out);
                b.collect_references(out);
            }
            Expr::Neg(a) | Expr::Pow(a, _) => a.collect_references(out),
        }
    }

    pub fn has_next(&self) -> bool {
        self.references().iter().any(|(_, next)| *next)
    }

    /// Degree of the expression as a polynomial in the single reference `var`.
    pub fn degree_in(&self, var: (&str, bool)) -> u32 {
        match self {
            Expr::Col(name) => u32::from(var == (name.as_str(), false)),
            Expr::Next(name) => u32::from(var == (name.as_str(), true)),
            Expr::Const(_) | Expr::RowIndex => 0,
            Expr::Add(a, b) | Expr::Sub(a, b) => a.degree_in(var).max(b.degree_in(var)),
            Expr::Mul(a, b) => a.degree_in(var).saturating_add(b.degree_in(var)),
            Expr::Neg(a) => a.degree_in(var),
            Expr::Pow(a, exponent) => a.degree_in(var).saturating_mul(*exponent),
        }
    }

    /// Shifts every current-row reference to the next row. Returns `None` if
    /// the expression already refers to the next row.
    pub fn shifted(&self) -> Option<Expr> {
        Some(match self {
            Expr::Col(name) => Expr::Next(name.clone()),
            Expr::Next(_) => return None,
            Expr::Const(_) | Expr::RowIndex => self.clone(),
            Expr::Add(a, b) => Expr::Add(Box::new(a.shifted()?), Box::new(b.shifted()?)),
            Expr::Sub(a, b) => Expr::Sub(Box::new(a.shifted()?), Box::new(b.shifted()?)),
            Expr::Mul(a, b) => Expr::Mul(Box::new(a.shifted()?), Box::new(b.shifted()?)),
            Expr::Neg(a) => Expr::Neg(Box::new(a.shifted()?)),
            Expr::Pow(a, exponent) => Expr::Pow(Box::new(a.shifted()?), *exponent),
        })
    }

    /// Rewrites column names through `rename`, leaving unmapped names alone.
    pub fn renamed(&self, rename: &HashMap<String, String>) -> Expr {
        let map = |name: &String| rename.get(name).cloned().unwrap_or_else(|| name.clone());
        match self {
            Expr::Col(name) => Expr::Col(map(name)),
            Expr::Next(name) => Expr::Next(map(name)),
            Expr::Const(_) | Expr::RowIndex => self.clone(),
            Expr::Add(a, b) => Expr::Add(Box::new(a.renamed(rename)), Box::new(b.renamed(rename))),
            Expr::Sub(a, b) => Expr::Sub(Box::new(a.renamed(rename)), Box::new(b.renamed(rename))),
            Expr::Mul(a, b) => Expr::Mul(Box::new(a.renamed(rename)), Box::new(b.renamed(rename))),
            Expr::Neg(a) => Expr::Neg(Box::new(a.renamed(rename))),
            Expr::Pow(a, exponent) => Expr::Pow(Box::new(a.renamed(rename)), *exponent),
        }
    }

    /// Sum of expressions, `0` for an empty iterator.
    pub fn sum(terms: impl IntoIterator<Item = Expr>) -> Expr {
        terms.into_iter().reduce(|acc, term| acc + term).unwrap_or_else(Expr::zero)
    }
}

impl From<i64> for Expr {
    fn from(value: i64) -> Self {
        Expr::constant(value)
    }
}

impl Add for Expr {
    type Output = Expr;
    fn add(self, rhs: Expr) -> Expr {
        Expr::Add(Box::new(self), Box::new(rhs))
    }
}

impl Sub for Expr {
    type Output = Expr;
    fn sub(self, rhs: Expr) -> Expr {
        Expr::Sub(Box::new(self), Box::new(rhs))
    }
}

impl Mul for Expr {
    type Output = Expr;
    fn mul(self, rhs: Expr) -> Expr {
        Expr::Mul(Box::new(self), Box::new(rhs))
    }
}

impl Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::Neg(Box::new(self))
    }
}

/// Why an equation could not be solved for its unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveFailure {
    /// The equation is not linear in the unknown.
    NonLinear,
    /// The unknown's coefficient evaluates to zero.
    ZeroCoefficient,
}

impl std::fmt::Display for SolveFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SolveFailure::NonLinear => write!(f, "equation is not linear in the unknown"),
            SolveFailure::ZeroCoefficient => write!(f, "coefficient of the unknown is zero"),
        }
    }
}

/// Solves `expr = 0` for the single reference `unknown`, given values for all
/// other references. The equation is treated as `a * unknown + b`.
pub fn solve_affine(
    expr: &Expr,
    unknown: (&str, bool),
    row: usize,
    known: &impl Fn(&str, bool) -> Option<Fr>,
) -> Result<Option<Fr>, SolveFailure> {
    if expr.degree_in(unknown) > 1 {
        return Err(SolveFailure::NonLinear);
    }
    let at = |guess: Fr| {
        expr.evaluate(row, &|name, next| {
            if (name, next) == unknown {
                Ok(guess)
            } else {
                known(name, next).ok_or(())
            }
        })
    };
    let (Ok(b), Ok(a_plus_b)) = (at(Fr::zero()), at(Fr::one())) else {
        return Ok(None);
    };
    let a = a_plus_b - b;
    match a.inverse() {
        Some(inverse) => Ok(Some(-b * inverse)),
        None => Err(SolveFailure::ZeroCoefficient),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env<'a>(values: &'a [(&'a str, i64)]) -> impl Fn(&str, bool) -> Option<Fr> + 'a {
        move |name, next| {
            if next {
                return None;
            }
            values.iter().find(|(n, _)| *n == name).map(|(_, v)| fe(*v))
        }
    }

    #[test]
    fn test_evaluate_with_next_and_row() {
        let expr = Expr::next("x") - Expr::col("x") * Expr::RowIndex;
        let value = expr
            .evaluate(3, &|name, next| -> Result<Fr, ()> {
                match (name, next) {
                    ("x", false) => Ok(fe(2)),
                    ("x", true) => Ok(fe(10)),
                    _ => Err(()),
                }
            })
            .unwrap();
        assert_eq!(value, fe(4));
    }

    #[test]
    fn test_degree_in() {
        let expr = Expr::col("x") * Expr::col("x") + Expr::col("y");
        assert_eq!(expr.degree_in(("x", false)), 2);
        assert_eq!(expr.degree_in(("y", false)), 1);
        assert_eq!(expr.degree_in(("y", true)), 0);
        assert_eq!(Expr::col("x").pow(3).degree_in(("x", false)), 3);

        let huge = Expr::col("x").pow(u32::MAX).pow(u32::MAX);
        assert_eq!(huge.degree_in(("x", false)), u32::MAX);
        assert_eq!(
            solve_affine(&(huge * Expr::col("x")), ("x", false), 0, &|_, _| None),
            Err(SolveFailure::NonLinear)
        );
    }

    #[test]
    fn test_solve_linear_unknown() {
        // y - 2 * x = 0
        let expr = Expr::col("y") - Expr::constant(2) * Expr::col("x");
        let values = [("x", 3)];
        let solved = solve_affine(&expr, ("y", false), 0, &env(&values)).unwrap();
        assert_eq!(solved, Some(fe(6)));
    }

    #[test]
    fn test_solve_rejects_nonlinear_and_zero_coefficient() {
        let square = Expr::col("y") * Expr::col("y") - Expr::col("x");
        let values = [("x", 4)];
        assert_eq!(
            solve_affine(&square, ("y", false), 0, &env(&values)),
            Err(SolveFailure::NonLinear)
        );

        // x * y - 1 with x = 0 has no solution
        let product = Expr::col("x") * Expr::col("y") - Expr::one();
        let values = [("x", 0)];
        assert_eq!(
            solve_affine(&product, ("y", false), 0, &env(&values)),
            Err(SolveFailure::ZeroCoefficient)
        );
    }

    #[test]
    fn test_shifted_refuses_double_next() {
        let expr = Expr::col("a") + Expr::constant(1);
        assert_eq!(expr.shifted(), Some(Expr::next("a") + Expr::constant(1)));
        assert_eq!(Expr::next("a").shifted(), None);
    }
}
