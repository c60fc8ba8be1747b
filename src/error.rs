//! Fatal errors.
//!
//! A `MachineError` means the definition itself is unusable and no partial
//! result is meaningful. Diagnostics that only concern the produced witness
//! live in [`crate::report::Violation`] instead.

use thiserror::Error;

/// Column store errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ColumnError {
    #[error("machine `{machine}`: unknown column `{column}`")]
    UnknownColumn { machine: String, column: String },

    #[error("machine `{machine}`: row {row} of `{column}` is out of range for degree {degree}")]
    OutOfRange {
        machine: String,
        column: String,
        row: usize,
        degree: usize,
    },

    #[error("machine `{machine}`: `{column}` at row {row} already holds {existing}, refusing {new}")]
    Redefinition {
        machine: String,
        column: String,
        row: usize,
        existing: String,
        new: String,
    },

    #[error("machine `{machine}`: `{column}` read at row {row} before being assigned")]
    Unassigned {
        machine: String,
        column: String,
        row: usize,
    },

    #[error("machine `{machine}`: column `{column}` is incomplete, first missing row {row}")]
    IncompleteColumn {
        machine: String,
        column: String,
        row: usize,
    },

    #[error("machine `{machine}`: fixed column `{column}` cannot be written")]
    FixedColumnWrite { machine: String, column: String },
}

/// Structural errors raised while loading or executing a machine.
#[derive(Debug, Error)]
pub enum MachineError {
    #[error("machine `{machine}`: degree {degree} is not a supported power of two")]
    InvalidDegree { machine: String, degree: usize },

    #[error("machine `{machine}`: column `{column}` is declared twice")]
    DuplicateColumn { machine: String, column: String },

    #[error("machine `{machine}`: `{context}` references undeclared column `{column}`")]
    UndeclaredColumn {
        machine: String,
        column: String,
        context: String,
    },

    #[error("machine `{machine}`: period {period} of `{column}` does not divide degree {degree}")]
    PeriodMismatch {
        machine: String,
        column: String,
        period: usize,
        degree: usize,
    },

    #[error("machine `{machine}`: literal `{column}` has {found} values, expected {degree}")]
    LiteralLength {
        machine: String,
        column: String,
        found: usize,
        degree: usize,
    },

    #[error("machine `{machine}`: unknown instruction `{instruction}`")]
    UnknownInstruction { machine: String, instruction: String },

    #[error("machine `{machine}`: `{instruction}` expects {expected} operands, found {found}")]
    ArityMismatch {
        machine: String,
        instruction: String,
        expected: usize,
        found: usize,
    },

    #[error("machine `{machine}`: label `{label}` is not defined")]
    MissingLabel { machine: String, label: String },

    #[error("machine `{machine}`: label `{label}` is defined twice")]
    DuplicateLabel { machine: String, label: String },

    #[error("machine `{machine}`: invalid use of register `{register}`: {reason}")]
    InvalidRegister {
        machine: String,
        register: String,
        reason: String,
    },

    #[error("machine `{machine}`: malformed identity `{identity}`: {reason}")]
    MalformedIdentity {
        machine: String,
        identity: String,
        reason: String,
    },

    #[error("machine `{machine}`: unknown sub-machine instance `{instance}`")]
    UnknownSubmachine { machine: String, instance: String },

    #[error("machine `{machine}`: sub-machine `{instance}` has no operation `{operation}`")]
    SubMachineOperationNotFound {
        machine: String,
        instance: String,
        operation: String,
    },

    #[error("machine `{machine}`: instance `{instance}` cannot be called: {reason}")]
    UnsupportedCallee {
        machine: String,
        instance: String,
        reason: String,
    },

    #[error("machine `{machine}`: sub-machine instance `{instance}` is declared twice")]
    DuplicateInstance { machine: String, instance: String },

    #[error("machine `{machine}`: invalid operations: {reason}")]
    InvalidOperations { machine: String, reason: String },

    #[error("machine `{machine}`: program counter {pc} points outside the program")]
    ProgramCounterOutOfRange { machine: String, pc: String },

    #[error("machine `{machine}`: execution needs more than {degree} rows")]
    RowLimitExceeded { machine: String, degree: usize },

    #[error(transparent)]
    Column(#[from] ColumnError),
}

/// Errors while reading configuration or definitions.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}
