//! Mathematical utilities over the evaluation domain.
//!
//! Machines live on a multiplicative subgroup of size `degree`; these helpers
//! build that domain and interpolate per-row values into polynomials for
//! downstream commitment.

pub mod domain;
pub mod polynomial;
