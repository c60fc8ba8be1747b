//! Execution and constraint-satisfaction engine for machine-based
//! arithmetizations.
//!
//! A [`Machine`] is a set of fixed and witness columns over a domain of
//! `degree` rows, optionally driven by a register program and composed with
//! sub-machines. The [`Engine`] executes it into concrete column values and
//! verifies every polynomial identity, lookup and bus argument.

use sha2::{Digest, Sha256};

pub mod config;
pub mod error;
pub mod field;
pub mod math;
pub mod pipeline;
pub mod report;
pub mod vm;

pub use config::EngineConfig;
pub use error::{ColumnError, ConfigError, MachineError};
pub use field::{Fr, fe};
pub use pipeline::{Engine, RunOutput};
pub use report::{VerificationReport, Violation};
pub use vm::machine::Machine;
pub use vm::query::{InputQueries, NoQueries, QueryCallback};

pub fn digest_sha2(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}
