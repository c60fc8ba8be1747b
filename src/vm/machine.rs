//! Machine definitions.
//!
//! These types are the immutable input to the engine, produced by an external
//! parser. They can be built in code with the helper constructors below or
//! deserialized from JSON.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::field::{Fr, fe, serde_fr_vec};
use crate::vm::expr::Expr;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Machine {
    pub name: String,
    /// Number of rows; must be a power of two.
    pub degree: usize,
    pub columns: Vec<ColumnDef>,
    pub registers: Vec<RegisterDef>,
    pub instructions: Vec<InstructionDef>,
    pub program: Vec<Statement>,
    pub identities: Vec<Identity>,
    pub lookups: Vec<LookupDef>,
    pub bus: Vec<BusEntry>,
    pub submachines: Vec<SubmachineDef>,
    pub operations: Vec<OperationDef>,
    pub latch: Option<String>,
    pub operation_id: Option<String>,
}

impl Machine {
    pub fn new(name: impl Into<String>, degree: usize) -> Self {
        Self {
            name: name.into(),
            degree,
            ..Self::default()
        }
    }

    /// Parses a machine definition from JSON.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn has_program_counter(&self) -> bool {
        self.registers.iter().any(|r| r.kind == RegisterKind::Pc)
    }

    pub fn fixed(mut self, name: impl Into<String>, values: FixedValues) -> Self {
        self.columns.push(ColumnDef {
            name: name.into(),
            kind: ColumnKind::Fixed(values),
        });
        self
    }

    pub fn witness(mut self, name: impl Into<String>, source: WitnessSource) -> Self {
        self.columns.push(ColumnDef {
            name: name.into(),
            kind: ColumnKind::Witness(source),
        });
        self
    }

    pub fn intermediate(mut self, name: impl Into<String>, expr: Expr) -> Self {
        self.columns.push(ColumnDef {
            name: name.into(),
            kind: ColumnKind::Intermediate(expr),
        });
        self
    }

    pub fn register(mut self, name: impl Into<String>, kind: RegisterKind) -> Self {
        self.registers.push(RegisterDef {
            name: name.into(),
            kind,
        });
        self
    }

    pub fn instruction(mut self, instruction: InstructionDef) -> Self {
        self.instructions.push(instruction);
        self
    }

    pub fn program(mut self, statements: Vec<Statement>) -> Self {
        self.program = statements;
        self
    }

    pub fn identity(mut self, identity: Identity) -> Self {
        self.identities.push(identity);
        self
    }

    pub fn lookup(mut self, lookup: LookupDef) -> Self {
        self.lookups.push(lookup);
        self
    }

    pub fn bus_entry(mut self, entry: BusEntry) -> Self {
        self.bus.push(entry);
        self
    }

    pub fn submachine(mut self, instance: impl Into<String>, machine: Machine) -> Self {
        self.submachines.push(SubmachineDef {
            instance: instance.into(),
            machine,
        });
        self
    }

    pub fn operation(mut self, operation: OperationDef) -> Self {
        self.operations.push(operation);
        self
    }

    pub fn latch(mut self, column: impl Into<String>) -> Self {
        self.latch = Some(column.into());
        self
    }

    pub fn operation_id(mut self, column: impl Into<String>) -> Self {
        self.operation_id = Some(column.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub kind: ColumnKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Fixed(FixedValues),
    Witness(WitnessSource),
    /// Alias expression, inlined wherever the name is referenced.
    Intermediate(Expr),
}

/// How a fixed column produces its value at a row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixedValues {
    /// Exactly `degree` values.
    Literal(#[serde(with = "serde_fr_vec")] Vec<Fr>),
    /// Values repeated cyclically, e.g. `[1]*`.
    Periodic(#[serde(with = "serde_fr_vec")] Vec<Fr>),
    /// Closed form over `Expr::RowIndex`.
    Expr(Expr),
}

impl FixedValues {
    pub fn literal(values: impl IntoIterator<Item = i64>) -> Self {
        FixedValues::Literal(values.into_iter().map(fe).collect())
    }

    pub fn periodic(values: impl IntoIterator<Item = i64>) -> Self {
        FixedValues::Periodic(values.into_iter().map(fe).collect())
    }
}

/// Where a witness column's values come from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WitnessSource {
    /// Written by the executor or solved from constraints.
    #[default]
    Free,
    /// Computed from other columns of the same row.
    Defined(Expr),
    /// Supplied per row by the query callback; `args` are evaluated at the row.
    Query { kind: String, args: Vec<Expr> },
    /// Inverse of an expression, or zero where the expression is zero.
    InverseOf(Expr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterKind {
    Pc,
    /// `<=` register holding a value for the current row only.
    Assignment,
    Plain,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterDef {
    pub name: String,
    pub kind: RegisterKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Param {
    /// An assignment register.
    Reg(String),
    /// A label argument, resolved to a program line.
    Label(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstructionDef {
    pub name: String,
    pub inputs: Vec<Param>,
    pub outputs: Vec<String>,
    pub body: InstructionBody,
}

impl InstructionDef {
    pub fn new(name: impl Into<String>, inputs: Vec<Param>, outputs: Vec<&str>) -> Self {
        Self {
            name: name.into(),
            inputs,
            outputs: outputs.into_iter().map(String::from).collect(),
            body: InstructionBody::Constraints(Vec::new()),
        }
    }

    pub fn constraints(mut self, identities: Vec<Identity>) -> Self {
        self.body = InstructionBody::Constraints(identities);
        self
    }

    pub fn link(mut self, instance: impl Into<String>, operation: impl Into<String>) -> Self {
        self.body = InstructionBody::Link {
            instance: instance.into(),
            operation: operation.into(),
        };
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstructionBody {
    Constraints(Vec<Identity>),
    Link { instance: String, operation: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    /// Expression over constants and the current value of registers.
    Expr(Expr),
    Label(String),
    Query { kind: String, #[serde(with = "serde_fr_vec")] args: Vec<Fr> },
}

impl Operand {
    pub fn value(value: i64) -> Self {
        Operand::Expr(Expr::constant(value))
    }

    pub fn reg(name: impl Into<String>) -> Self {
        Operand::Expr(Expr::col(name))
    }

    pub fn label(name: impl Into<String>) -> Self {
        Operand::Label(name.into())
    }

    pub fn input(index: u64) -> Self {
        Operand::Query {
            kind: "input".to_string(),
            args: vec![Fr::from(index)],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Statement {
    Label(String),
    /// `dest, .. <=via= value`
    Assign {
        dests: Vec<String>,
        via: String,
        value: Operand,
    },
    /// `outputs <== name(args)`; `outputs` bind the instruction's output
    /// registers to plain registers and may be empty.
    Instr {
        name: String,
        args: Vec<Operand>,
        outputs: Vec<String>,
    },
    Return,
}

impl Statement {
    pub fn label(name: impl Into<String>) -> Self {
        Statement::Label(name.into())
    }

    pub fn assign(dest: &str, via: &str, value: Operand) -> Self {
        Statement::Assign {
            dests: vec![dest.to_string()],
            via: via.to_string(),
            value,
        }
    }

    pub fn instr(name: &str, args: Vec<Operand>, outputs: Vec<&str>) -> Self {
        Statement::Instr {
            name: name.to_string(),
            args,
            outputs: outputs.into_iter().map(String::from).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityScope {
    #[default]
    EveryRow,
    FirstRow,
    LastRow,
}

/// `lhs = rhs`, evaluated at the rows selected by `scope`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub lhs: Expr,
    pub rhs: Expr,
    #[serde(default)]
    pub scope: IdentityScope,
}

impl Identity {
    pub fn new(name: impl Into<String>, lhs: Expr, rhs: Expr) -> Self {
        Self {
            name: name.into(),
            lhs,
            rhs,
            scope: IdentityScope::EveryRow,
        }
    }

    /// `expr = 0`
    pub fn zero(name: impl Into<String>, expr: Expr) -> Self {
        Self::new(name, expr, Expr::zero())
    }

    pub fn first_row(mut self) -> Self {
        self.scope = IdentityScope::FirstRow;
        self
    }

    pub fn last_row(mut self) -> Self {
        self.scope = IdentityScope::LastRow;
        self
    }

    /// `lhs - rhs`, the expression that must vanish.
    pub fn difference(&self) -> Expr {
        self.lhs.clone() - self.rhs.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupKind {
    /// Every selected source tuple appears among the selected target tuples.
    #[default]
    Containment,
    /// Selected source and target tuples form the same multiset.
    Permutation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupSide {
    pub selector: Expr,
    pub tuple: Vec<Expr>,
}

impl LookupSide {
    pub fn new(selector: Expr, tuple: Vec<Expr>) -> Self {
        Self { selector, tuple }
    }

    pub fn columns(names: &[&str]) -> Self {
        Self::new(Expr::one(), names.iter().map(|n| Expr::col(*n)).collect())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupDef {
    pub name: String,
    #[serde(default)]
    pub kind: LookupKind,
    pub source: LookupSide,
    pub target: LookupSide,
    /// Sub-machine instance holding the target columns; `None` for the
    /// machine itself.
    #[serde(default)]
    pub target_instance: Option<String>,
}

impl LookupDef {
    pub fn new(name: impl Into<String>, source: LookupSide, target: LookupSide) -> Self {
        Self {
            name: name.into(),
            kind: LookupKind::Containment,
            source,
            target,
            target_instance: None,
        }
    }

    pub fn permutation(mut self) -> Self {
        self.kind = LookupKind::Permutation;
        self
    }

    pub fn into_instance(mut self, instance: impl Into<String>) -> Self {
        self.target_instance = Some(instance.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusDirection {
    Send,
    Receive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEntry {
    pub name: String,
    pub bus_id: u64,
    pub direction: BusDirection,
    pub tuple: Vec<Expr>,
    pub multiplicity: Expr,
}

impl BusEntry {
    pub fn send(name: impl Into<String>, bus_id: u64, tuple: Vec<Expr>, multiplicity: Expr) -> Self {
        Self {
            name: name.into(),
            bus_id,
            direction: BusDirection::Send,
            tuple,
            multiplicity,
        }
    }

    pub fn receive(
        name: impl Into<String>,
        bus_id: u64,
        tuple: Vec<Expr>,
        multiplicity: Expr,
    ) -> Self {
        Self {
            direction: BusDirection::Receive,
            ..Self::send(name, bus_id, tuple, multiplicity)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmachineDef {
    pub instance: String,
    pub machine: Machine,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationDef {
    pub name: String,
    /// Value of the callee's `operation_id` column for this operation.
    pub id: u64,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

impl OperationDef {
    pub fn new(name: impl Into<String>, id: u64, inputs: Vec<&str>, outputs: Vec<&str>) -> Self {
        Self {
            name: name.into(),
            id,
            inputs: inputs.into_iter().map(String::from).collect(),
            outputs: outputs.into_iter().map(String::from).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_from_json() {
        let json = r#"{
            "name": "Main",
            "degree": 4,
            "columns": [
                { "name": "ONES", "kind": { "fixed": { "periodic": ["1"] } } },
                { "name": "x", "kind": { "witness": { "defined": { "col": "ONES" } } } }
            ],
            "identities": [
                { "name": "x_is_one", "lhs": { "col": "x" }, "rhs": { "const": "1" } }
            ]
        }"#;
        let machine = Machine::from_json(json).unwrap();
        assert_eq!(machine.degree, 4);
        assert_eq!(machine.columns.len(), 2);
        assert_eq!(machine.identities[0].scope, IdentityScope::EveryRow);
        assert!(!machine.has_program_counter());
    }

    #[test]
    fn test_invalid_field_literal_is_rejected() {
        let json = r#"{ "name": "M", "degree": 2, "columns": [
            { "name": "A", "kind": { "fixed": { "literal": ["1", "x"] } } }
        ] }"#;
        assert!(Machine::from_json(json).is_err());
    }
}
