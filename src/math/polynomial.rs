//! Dense univariate polynomials over `Fr`.

use ark_bls12_381::Fr;
use ark_ff::Zero;
use ark_poly::univariate::DensePolynomial;
use ark_poly::{EvaluationDomain, Evaluations, GeneralEvaluationDomain};
use std::fmt;

/// Polynomial in coefficient form, lowest power first, without trailing
/// zero coefficients.
#[derive(Debug, Clone, PartialEq)]
pub struct Polynomial {
    pub coefficients: Vec<Fr>,
}

impl Polynomial {
    pub fn new(mut coefficients: Vec<Fr>) -> Self {
        while coefficients.last().is_some_and(|c| c.is_zero()) {
            coefficients.pop();
        }
        Self { coefficients }
    }

    pub fn zero() -> Self {
        Self::new(Vec::new())
    }

    /// Interpolates one value per domain point.
    pub fn interpolate(values: Vec<Fr>, domain: GeneralEvaluationDomain<Fr>) -> Self {
        Self::from_dense_poly(Evaluations::from_vec_and_domain(values, domain).interpolate())
    }

    pub fn from_dense_poly(poly: DensePolynomial<Fr>) -> Self {
        Self::new(poly.coeffs)
    }

    /// Degree of the polynomial; the zero polynomial has degree 0.
    pub fn degree(&self) -> usize {
        self.coefficients.len().saturating_sub(1)
    }

    pub fn is_zero(&self) -> bool {
        self.coefficients.is_empty()
    }

    /// Horner evaluation.
    pub fn evaluate(&self, x: Fr) -> Fr {
        self.coefficients
            .iter()
            .rev()
            .fold(Fr::zero(), |acc, coeff| acc * x + coeff)
    }

    /// Long division, returning `(quotient, remainder)`; `None` for a zero
    /// divisor.
    pub fn divide(&self, divisor: &Polynomial) -> Option<(Polynomial, Polynomial)> {
        let lead_inverse = ark_ff::Field::inverse(divisor.coefficients.last()?)?;
        if self.coefficients.len() < divisor.coefficients.len() {
            return Some((Polynomial::zero(), self.clone()));
        }

        let shift = self.coefficients.len() - divisor.coefficients.len();
        let mut remainder = self.coefficients.clone();
        let mut quotient = vec![Fr::zero(); shift + 1];
        for i in (0..=shift).rev() {
            let factor = remainder[i + divisor.degree()] * lead_inverse;
            if factor.is_zero() {
                continue;
            }
            quotient[i] = factor;
            for (j, coeff) in divisor.coefficients.iter().enumerate() {
                remainder[i + j] -= factor * coeff;
            }
        }
        Some((Polynomial::new(quotient), Polynomial::new(remainder)))
    }

    /// True when the polynomial is zero on every point of `domain`, i.e. it is
    /// divisible by the domain's vanishing polynomial.
    pub fn vanishes_on(&self, domain: &GeneralEvaluationDomain<Fr>) -> bool {
        let vanishing = Polynomial::from_dense_poly(domain.vanishing_polynomial().into());
        self.divide(&vanishing)
            .is_some_and(|(_, remainder)| remainder.is_zero())
    }
}

impl fmt::Display for Polynomial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let terms: Vec<String> = self
            .coefficients
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.is_zero())
            .map(|(i, c)| match i {
                0 => format!("{c}"),
                1 => format!("{c}x"),
                _ => format!("{c}x^{i}"),
            })
            .collect();
        if terms.is_empty() {
            write!(f, "0")
        } else {
            write!(f, "{}", terms.join(" + "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::domain::evaluation_domain;

    #[test]
    fn test_interpolation_hits_every_point() {
        let domain = evaluation_domain(4).unwrap();
        let values: Vec<Fr> = [3u64, 1, 4, 1].into_iter().map(Fr::from).collect();
        let poly = Polynomial::interpolate(values.clone(), domain);
        for (point, value) in domain.elements().zip(values) {
            assert_eq!(poly.evaluate(point), value);
        }
        assert!(poly.degree() <= 3);
    }

    #[test]
    fn test_vanishing_detection() {
        let domain = evaluation_domain(8).unwrap();
        let zeros = Polynomial::interpolate(vec![Fr::zero(); 8], domain);
        assert!(zeros.vanishes_on(&domain));

        let mut values = vec![Fr::zero(); 8];
        values[5] = Fr::from(2u64);
        assert!(!Polynomial::interpolate(values, domain).vanishes_on(&domain));
    }

    #[test]
    fn test_divide_exact() {
        // (x + 1)(x + 2) = x^2 + 3x + 2
        let product = Polynomial::new(vec![Fr::from(2u64), Fr::from(3u64), Fr::from(1u64)]);
        let factor = Polynomial::new(vec![Fr::from(1u64), Fr::from(1u64)]);
        let (quotient, remainder) = product.divide(&factor).unwrap();
        assert_eq!(quotient, Polynomial::new(vec![Fr::from(2u64), Fr::from(1u64)]));
        assert!(remainder.is_zero());
        assert!(product.divide(&Polynomial::zero()).is_none());
    }
}
