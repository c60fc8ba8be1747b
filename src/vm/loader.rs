//! Load-time validation and compilation of machine definitions.
//!
//! Loading resolves labels, inlines intermediate columns, checks every column
//! reference, and expands program-counter machines into plain columns and
//! identities:
//!
//! - one witness column per register, `instr_<name>` flag per instruction,
//!   `reg_write_<via>_<dest>` flag per register write path, and one column per
//!   label parameter
//! - a fixed program ROM (`p_line`, `p_instr_*`, label values) and a lookup
//!   binding the executed row to the program line it claims to execute
//! - identities for flag booleanity, gated instruction bodies, the program
//!   counter update and plain register updates
//! - one containment lookup per linked instruction into the callee
//!
//! All structural errors are raised here, before anything executes.

use ark_ff::{AdditiveGroup, Field};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, instrument};

use crate::error::MachineError;
use crate::field::Fr;
use crate::math::domain::evaluation_domain;
use crate::vm::expr::Expr;
use crate::vm::machine::{
    BusEntry, ColumnKind, FixedValues, IdentityScope, InstructionBody, InstructionDef, LookupDef,
    LookupSide, Machine, OperationDef, Operand, Param, RegisterDef, RegisterKind, Statement,
    WitnessSource,
};

pub const RETURN_FLAG: &str = "instr__return";
pub const PC_ROM: &str = "p_line";

pub fn instr_flag(instruction: &str) -> String {
    format!("instr_{instruction}")
}

pub fn write_flag(via: &str, dest: &str) -> String {
    format!("reg_write_{via}_{dest}")
}

fn label_column(instruction: &str, param: &str) -> String {
    format!("{instruction}_{param}")
}

fn rom_column(column: &str) -> String {
    format!("p_{column}")
}

/// A fixed column generator, evaluated per row instead of materialized.
#[derive(Debug, Clone)]
pub enum FixedColumn {
    Literal(Vec<Fr>),
    Periodic(Vec<Fr>),
    Expr(Expr),
}

impl FixedColumn {
    pub fn value_at(&self, row: usize) -> Fr {
        match self {
            FixedColumn::Literal(values) => values[row],
            FixedColumn::Periodic(values) => values[row % values.len()],
            // Validated at load time to reference nothing but the row index
            FixedColumn::Expr(expr) => expr.evaluate(row, &|_, _| Err(())).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineKind {
    /// Runs a program under a program counter.
    Vm,
    /// Exposes operations; each call fills one row.
    Block,
    /// Neither; every row is solved from the machine's own definitions.
    Pure,
}

#[derive(Debug, Clone)]
pub struct LoadedIdentity {
    pub name: String,
    /// Must evaluate to zero.
    pub expr: Expr,
    pub scope: IdentityScope,
}

impl LoadedIdentity {
    /// Identities referencing the next row are not evaluated on the last row.
    pub fn is_transition(&self) -> bool {
        self.expr.has_next()
    }

    /// Rows on which the identity is evaluated.
    ///
    /// Transitions stop at `degree - 2`: the pair (last row, first row) is
    /// never checked, since a program's final row does not lead back into
    /// its first. Lookup and bus tuples that read the next row still wrap
    /// around cyclically.
    pub fn rows(&self, degree: usize) -> std::ops::Range<usize> {
        match self.scope {
            IdentityScope::FirstRow => 0..1,
            IdentityScope::LastRow => degree - 1..degree,
            IdentityScope::EveryRow if self.is_transition() => 0..degree - 1,
            IdentityScope::EveryRow => 0..degree,
        }
    }
}

#[derive(Debug, Clone)]
pub enum LoadedParam {
    Reg(String),
    Label { column: String },
}

#[derive(Debug, Clone)]
pub enum LoadedBody {
    Constraints(Vec<LoadedIdentity>),
    Link { instance: String, operation: usize },
}

#[derive(Debug, Clone)]
pub struct LoadedInstruction {
    pub name: String,
    pub flag: String,
    pub inputs: Vec<LoadedParam>,
    pub outputs: Vec<String>,
    pub body: LoadedBody,
    /// Whether the body determines `pc'`.
    pub writes_pc: bool,
}

#[derive(Debug, Clone)]
pub enum LoadedOperand {
    Expr(Expr),
    /// Program line of a label.
    Label(usize),
    Query { kind: String, args: Vec<Fr> },
}

#[derive(Debug, Clone)]
pub enum LoadedStatement {
    Assign {
        dests: Vec<String>,
        via: String,
        value: LoadedOperand,
    },
    Instr {
        instruction: usize,
        args: Vec<LoadedOperand>,
        outputs: Vec<String>,
    },
    Return,
}

/// Closed set of operations a block machine exposes.
#[derive(Debug, Clone, Default)]
pub struct OperationTable {
    operations: Vec<OperationDef>,
}

impl OperationTable {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.operations.iter().position(|op| op.name == name)
    }

    pub fn get(&self, index: usize) -> Option<&OperationDef> {
        self.operations.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &OperationDef> {
        self.operations.iter()
    }
}

/// A validated machine with all derived columns and identities.
#[derive(Debug, Clone)]
pub struct LoadedMachine {
    pub name: String,
    pub degree: usize,
    pub kind: MachineKind,
    pub fixed: Vec<(String, FixedColumn)>,
    pub witness: Vec<(String, WitnessSource)>,
    pub registers: Vec<RegisterDef>,
    pub instructions: Vec<LoadedInstruction>,
    pub program: Vec<LoadedStatement>,
    pub labels: BTreeMap<String, usize>,
    pub identities: Vec<LoadedIdentity>,
    /// Index of the first identity taken from the definition; generated
    /// identities come before it.
    pub declared_from: usize,
    pub lookups: Vec<LookupDef>,
    pub bus: Vec<BusEntry>,
    pub submachines: Vec<(String, LoadedMachine)>,
    pub operations: OperationTable,
    pub latch: Option<String>,
    pub operation_id: Option<String>,
}

impl LoadedMachine {
    #[instrument(skip_all, fields(machine = %machine.name))]
    pub fn load(machine: &Machine) -> Result<Self, MachineError> {
        let loaded = Loader::new(machine)?.load()?;
        debug!(
            fixed = loaded.fixed.len(),
            witness = loaded.witness.len(),
            identities = loaded.identities.len(),
            lookups = loaded.lookups.len(),
            "machine loaded"
        );
        Ok(loaded)
    }

    /// Identities from the definition, without the generated ones.
    pub fn declared_identities(&self) -> &[LoadedIdentity] {
        &self.identities[self.declared_from..]
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.is_fixed(name) || self.witness_source(name).is_some()
    }

    pub fn is_fixed(&self, name: &str) -> bool {
        self.fixed.iter().any(|(n, _)| n == name)
    }

    pub fn witness_source(&self, name: &str) -> Option<&WitnessSource> {
        self.witness.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }

    /// Inverse helper columns and their source expressions.
    pub fn helpers(&self) -> impl Iterator<Item = (&str, &Expr)> {
        self.witness.iter().filter_map(|(name, source)| match source {
            WitnessSource::InverseOf(expr) => Some((name.as_str(), expr)),
            _ => None,
        })
    }

    pub fn register_kind(&self, name: &str) -> Option<RegisterKind> {
        self.registers.iter().find(|r| r.name == name).map(|r| r.kind)
    }

    pub fn registers_of(&self, kind: RegisterKind) -> impl Iterator<Item = &str> {
        self.registers
            .iter()
            .filter(move |r| r.kind == kind)
            .map(|r| r.name.as_str())
    }

    pub fn pc(&self) -> Option<&str> {
        self.registers_of(RegisterKind::Pc).next()
    }

    pub fn submachine(&self, instance: &str) -> Option<&LoadedMachine> {
        self.submachines
            .iter()
            .find(|(name, _)| name == instance)
            .map(|(_, machine)| machine)
    }

    /// Every flag column the executor writes per row.
    pub fn flag_columns(&self) -> Vec<String> {
        let mut flags: Vec<String> = self.instructions.iter().map(|i| i.flag.clone()).collect();
        if self.kind == MachineKind::Vm {
            flags.push(RETURN_FLAG.to_string());
            for via in self.registers_of(RegisterKind::Assignment) {
                for dest in self.registers_of(RegisterKind::Plain) {
                    flags.push(write_flag(via, dest));
                }
            }
        }
        flags
    }

    /// Columns holding label arguments.
    pub fn label_columns(&self) -> impl Iterator<Item = &str> {
        self.instructions.iter().flat_map(|instr| {
            instr.inputs.iter().filter_map(|param| match param {
                LoadedParam::Label { column } => Some(column.as_str()),
                LoadedParam::Reg(_) => None,
            })
        })
    }
}

struct Loader<'a> {
    def: &'a Machine,
    intermediates: HashMap<String, Expr>,
    declared: BTreeSet<String>,
    fixed: Vec<(String, FixedColumn)>,
    witness: Vec<(String, WitnessSource)>,
    identities: Vec<LoadedIdentity>,
    lookups: Vec<LookupDef>,
    submachines: Vec<(String, LoadedMachine)>,
}

impl<'a> Loader<'a> {
    fn new(def: &'a Machine) -> Result<Self, MachineError> {
        if evaluation_domain(def.degree).is_none() {
            return Err(MachineError::InvalidDegree {
                machine: def.name.clone(),
                degree: def.degree,
            });
        }
        Ok(Self {
            def,
            intermediates: HashMap::new(),
            declared: BTreeSet::new(),
            fixed: Vec::new(),
            witness: Vec::new(),
            identities: Vec::new(),
            lookups: Vec::new(),
            submachines: Vec::new(),
        })
    }

    fn name(&self) -> String {
        self.def.name.clone()
    }

    fn declare(&mut self, column: &str) -> Result<(), MachineError> {
        if !self.declared.insert(column.to_string()) {
            return Err(MachineError::DuplicateColumn {
                machine: self.name(),
                column: column.to_string(),
            });
        }
        Ok(())
    }

    fn add_fixed(&mut self, column: &str, values: FixedColumn) -> Result<(), MachineError> {
        self.declare(column)?;
        self.fixed.push((column.to_string(), values));
        Ok(())
    }

    fn add_witness(&mut self, column: &str, source: WitnessSource) -> Result<(), MachineError> {
        self.declare(column)?;
        self.witness.push((column.to_string(), source));
        Ok(())
    }

    fn kind(&self) -> Result<MachineKind, MachineError> {
        let pcs = self.def.registers.iter().filter(|r| r.kind == RegisterKind::Pc).count();
        match pcs {
            0 if !self.def.program.is_empty() || !self.def.instructions.is_empty() => {
                Err(MachineError::InvalidRegister {
                    machine: self.name(),
                    register: "pc".to_string(),
                    reason: "a program needs a program counter register".to_string(),
                })
            }
            0 if self.def.operations.is_empty() => Ok(MachineKind::Pure),
            0 => Ok(MachineKind::Block),
            1 if self.def.operations.is_empty() => Ok(MachineKind::Vm),
            1 => Err(MachineError::InvalidOperations {
                machine: self.name(),
                reason: "program-counter machines cannot expose operations".to_string(),
            }),
            _ => Err(MachineError::InvalidRegister {
                machine: self.name(),
                register: "pc".to_string(),
                reason: "only one program counter is allowed".to_string(),
            }),
        }
    }

    fn load(mut self) -> Result<LoadedMachine, MachineError> {
        let kind = self.kind()?;
        let def = self.def;

        for (instance, sub) in def.submachines.iter().map(|s| (&s.instance, &s.machine)) {
            if self.submachines.iter().any(|(name, _)| name == instance) {
                return Err(MachineError::DuplicateInstance {
                    machine: self.name(),
                    instance: instance.clone(),
                });
            }
            self.submachines.push((instance.clone(), LoadedMachine::load(sub)?));
        }

        let mut pending_witness = Vec::new();
        for column in &def.columns {
            match &column.kind {
                ColumnKind::Fixed(values) => {
                    let fixed = self.fixed_column(&column.name, values)?;
                    self.add_fixed(&column.name, fixed)?;
                }
                ColumnKind::Witness(source) => {
                    self.declare(&column.name)?;
                    pending_witness.push((column.name.clone(), source.clone()));
                }
                ColumnKind::Intermediate(expr) => {
                    self.declare(&column.name)?;
                    self.intermediates.insert(column.name.clone(), expr.clone());
                }
            }
        }
        for register in &def.registers {
            self.add_witness(&register.name, WitnessSource::Free)?;
        }

        let (instructions, program, labels) = if kind == MachineKind::Vm {
            self.compile_program()?
        } else {
            Default::default()
        };

        // Witness sources may reference derived columns, so resolve them last.
        for (name, source) in pending_witness {
            let source = self.witness_source(&name, source)?;
            self.witness.push((name, source));
        }

        let declared_from = self.identities.len();
        for identity in &def.identities {
            let expr = self.inline(&identity.difference(), &identity.name)?;
            self.check_references(&expr, &identity.name)?;
            self.identities.push(LoadedIdentity {
                name: identity.name.clone(),
                expr,
                scope: identity.scope,
            });
        }
        for lookup in &def.lookups {
            let lookup = self.inline_lookup(lookup)?;
            self.lookups.push(lookup);
        }
        let mut bus = Vec::with_capacity(def.bus.len());
        for entry in &def.bus {
            let mut entry = entry.clone();
            entry.multiplicity = self.inline(&entry.multiplicity, &entry.name)?;
            self.check_references(&entry.multiplicity, &entry.name)?;
            for element in entry.tuple.iter_mut() {
                *element = self.inline(element, &entry.name)?;
                self.check_references(element, &entry.name)?;
            }
            bus.push(entry);
        }

        let operations = OperationTable {
            operations: def.operations.clone(),
        };
        if kind == MachineKind::Block {
            self.check_operations(&operations)?;
        }

        Ok(LoadedMachine {
            name: def.name.clone(),
            degree: def.degree,
            kind,
            fixed: self.fixed,
            witness: self.witness,
            registers: def.registers.clone(),
            instructions,
            program,
            labels,
            identities: self.identities,
            declared_from,
            lookups: self.lookups,
            bus,
            submachines: self.submachines,
            operations,
            latch: def.latch.clone(),
            operation_id: def.operation_id.clone(),
        })
    }

    fn fixed_column(&self, column: &str, values: &FixedValues) -> Result<FixedColumn, MachineError> {
        let degree = self.def.degree;
        match values {
            FixedValues::Literal(values) if values.len() != degree => Err(MachineError::LiteralLength {
                machine: self.name(),
                column: column.to_string(),
                found: values.len(),
                degree,
            }),
            FixedValues::Literal(values) => Ok(FixedColumn::Literal(values.clone())),
            FixedValues::Periodic(values) if values.is_empty() || degree % values.len() != 0 => {
                Err(MachineError::PeriodMismatch {
                    machine: self.name(),
                    column: column.to_string(),
                    period: values.len(),
                    degree,
                })
            }
            FixedValues::Periodic(values) => Ok(FixedColumn::Periodic(values.clone())),
            FixedValues::Expr(expr) => match expr.references().into_iter().next() {
                Some((name, _)) => Err(MachineError::MalformedIdentity {
                    machine: self.name(),
                    identity: column.to_string(),
                    reason: format!("fixed column definitions may only use the row index, found `{name}`"),
                }),
                None => Ok(FixedColumn::Expr(expr.clone())),
            },
        }
    }

    fn witness_source(&self, column: &str, source: WitnessSource) -> Result<WitnessSource, MachineError> {
        Ok(match source {
            WitnessSource::Free => WitnessSource::Free,
            WitnessSource::Defined(expr) => {
                let expr = self.inline(&expr, column)?;
                self.check_references(&expr, column)?;
                WitnessSource::Defined(expr)
            }
            WitnessSource::Query { kind, args } => {
                let args = args
                    .iter()
                    .map(|arg| {
                        let arg = self.inline(arg, column)?;
                        self.check_references(&arg, column)?;
                        Ok(arg)
                    })
                    .collect::<Result<Vec<_>, MachineError>>()?;
                WitnessSource::Query { kind, args }
            }
            WitnessSource::InverseOf(expr) => {
                let expr = self.inline(&expr, column)?;
                self.check_references(&expr, column)?;
                if let Some((name, _)) = expr.references().into_iter().find(|(name, next)| {
                    *next
                        || self.def.columns.iter().any(|c| {
                            c.name == *name && matches!(c.kind, ColumnKind::Witness(WitnessSource::InverseOf(_)))
                        })
                }) {
                    return Err(MachineError::MalformedIdentity {
                        machine: self.name(),
                        identity: column.to_string(),
                        reason: format!("inverse helper source may not reference `{name}`"),
                    });
                }
                WitnessSource::InverseOf(expr)
            }
        })
    }

    /// Replaces intermediate column references by their definitions.
    fn inline(&self, expr: &Expr, context: &str) -> Result<Expr, MachineError> {
        self.inline_with(expr, context, &mut Vec::new())
    }

    fn inline_with(&self, expr: &Expr, context: &str, visiting: &mut Vec<String>) -> Result<Expr, MachineError> {
        Ok(match expr {
            Expr::Col(name) => self.expand(name, false, context, visiting)?.unwrap_or_else(|| expr.clone()),
            Expr::Next(name) => self.expand(name, true, context, visiting)?.unwrap_or_else(|| expr.clone()),
            Expr::Const(_) | Expr::RowIndex => expr.clone(),
            Expr::Add(a, b) => self.inline_with(a, context, visiting)? + self.inline_with(b, context, visiting)?,
            Expr::Sub(a, b) => self.inline_with(a, context, visiting)? - self.inline_with(b, context, visiting)?,
            Expr::Mul(a, b) => self.inline_with(a, context, visiting)? * self.inline_with(b, context, visiting)?,
            Expr::Neg(a) => -self.inline_with(a, context, visiting)?,
            Expr::Pow(a, exponent) => self.inline_with(a, context, visiting)?.pow(*exponent),
        })
    }

    fn expand(
        &self,
        name: &str,
        next: bool,
        context: &str,
        visiting: &mut Vec<String>,
    ) -> Result<Option<Expr>, MachineError> {
        let Some(definition) = self.intermediates.get(name) else {
            return Ok(None);
        };
        if visiting.iter().any(|v| v == name) {
            return Err(MachineError::MalformedIdentity {
                machine: self.name(),
                identity: context.to_string(),
                reason: format!("intermediate `{name}` is defined in terms of itself"),
            });
        }
        visiting.push(name.to_string());
        let inlined = self.inline_with(definition, context, visiting)?;
        visiting.pop();
        if !next {
            return Ok(Some(inlined));
        }
        inlined.shifted().map(Some).ok_or_else(|| MachineError::MalformedIdentity {
            machine: self.name(),
            identity: context.to_string(),
            reason: format!("`{name}'` would reference two rows ahead"),
        })
    }

    fn check_references(&self, expr: &Expr, context: &str) -> Result<(), MachineError> {
        self.check_references_in(expr, context, |name| self.declared.contains(name))
    }

    fn check_references_in(
        &self,
        expr: &Expr,
        context: &str,
        known: impl Fn(&str) -> bool,
    ) -> Result<(), MachineError> {
        match expr.references().into_iter().find(|(name, _)| !known(name)) {
            Some((column, _)) => Err(MachineError::UndeclaredColumn {
                machine: self.name(),
                column,
                context: context.to_string(),
            }),
            None => Ok(()),
        }
    }

    fn inline_lookup(&self, lookup: &LookupDef) -> Result<LookupDef, MachineError> {
        let mut lookup = lookup.clone();
        let context = lookup.name.clone();
        if lookup.source.tuple.len() != lookup.target.tuple.len() {
            return Err(MachineError::MalformedIdentity {
                machine: self.name(),
                identity: context,
                reason: format!(
                    "source has {} elements, target has {}",
                    lookup.source.tuple.len(),
                    lookup.target.tuple.len()
                ),
            });
        }
        lookup.source.selector = self.inline(&lookup.source.selector, &context)?;
        self.check_references(&lookup.source.selector, &context)?;
        for element in lookup.source.tuple.iter_mut() {
            *element = self.inline(element, &context)?;
            self.check_references(element, &context)?;
        }
        match &lookup.target_instance {
            None => {
                lookup.target.selector = self.inline(&lookup.target.selector, &context)?;
                self.check_references(&lookup.target.selector, &context)?;
                for element in lookup.target.tuple.iter_mut() {
                    *element = self.inline(element, &context)?;
                    self.check_references(element, &context)?;
                }
            }
            Some(instance) => {
                let target = self
                    .submachines
                    .iter()
                    .find(|(name, _)| name == instance)
                    .map(|(_, machine)| machine)
                    .ok_or_else(|| MachineError::UnknownSubmachine {
                        machine: self.name(),
                        instance: instance.clone(),
                    })?;
                for element in std::iter::once(&lookup.target.selector).chain(&lookup.target.tuple) {
                    self.check_references_in(element, &context, |name| target.has_column(name))?;
                }
            }
        }
        Ok(lookup)
    }

    fn check_operations(&self, operations: &OperationTable) -> Result<(), MachineError> {
        let invalid = |reason: String| MachineError::InvalidOperations {
            machine: self.name(),
            reason,
        };
        let is_witness = |name: &str| self.witness.iter().any(|(n, _)| n == name);
        match &self.def.operation_id {
            None if operations.operations.len() > 1 => {
                return Err(invalid("several operations need an operation_id column".to_string()));
            }
            Some(column) if !is_witness(column) => {
                return Err(invalid(format!("operation_id column `{column}` is not a witness column")));
            }
            _ => {}
        }
        if let Some(latch) = &self.def.latch {
            if !self.declared.contains(latch) {
                return Err(invalid(format!("latch column `{latch}` is not declared")));
            }
        }
        let mut ids = BTreeSet::new();
        for op in operations.iter() {
            if !ids.insert(op.id) {
                return Err(invalid(format!("operation id {} is used twice", op.id)));
            }
            if let Some(column) = op.inputs.iter().chain(&op.outputs).find(|c| !is_witness(c.as_str())) {
                return Err(invalid(format!(
                    "operation `{}` binds `{column}`, which is not a witness column",
                    op.name
                )));
            }
        }
        Ok(())
    }

    /// Expands a program-counter machine into columns, identities and
    /// lookups, and resolves its program.
    #[allow(clippy::type_complexity)]
    fn compile_program(
        &mut self,
    ) -> Result<(Vec<LoadedInstruction>, Vec<LoadedStatement>, BTreeMap<String, usize>), MachineError> {
        let def = self.def;
        let degree = def.degree;
        let pc = def
            .registers
            .iter()
            .find(|r| r.kind == RegisterKind::Pc)
            .map(|r| r.name.clone())
            .unwrap_or_default();
        let register_kind = |name: &str| def.registers.iter().find(|r| r.name == name).map(|r| r.kind);
        let assignment: Vec<&str> = def
            .registers
            .iter()
            .filter(|r| r.kind == RegisterKind::Assignment)
            .map(|r| r.name.as_str())
            .collect();
        let plain: Vec<&str> = def
            .registers
            .iter()
            .filter(|r| r.kind == RegisterKind::Plain)
            .map(|r| r.name.as_str())
            .collect();

        let mut instructions = Vec::with_capacity(def.instructions.len());
        for instr in &def.instructions {
            let loaded = self.compile_instruction(instr, &pc, &register_kind)?;
            instructions.push(loaded);
        }

        // Flags and write paths
        for instr in &instructions {
            self.add_witness(&instr.flag, WitnessSource::Free)?;
            for param in &instr.inputs {
                if let LoadedParam::Label { column } = param {
                    self.add_witness(column, WitnessSource::Free)?;
                }
            }
        }
        self.add_witness(RETURN_FLAG, WitnessSource::Free)?;
        for via in &assignment {
            for dest in &plain {
                self.add_witness(&write_flag(via, dest), WitnessSource::Free)?;
            }
        }

        let (program, labels) = self.compile_statements(&instructions, &pc, &register_kind)?;
        if program.len() > degree {
            return Err(MachineError::RowLimitExceeded {
                machine: self.name(),
                degree,
            });
        }

        self.add_program_rom(&instructions, &program, &pc)?;

        // Identities
        self.identities.push(LoadedIdentity {
            name: format!("{pc}_starts_at_zero"),
            expr: Expr::col(&pc),
            scope: IdentityScope::FirstRow,
        });
        let mut flags: Vec<String> = instructions.iter().map(|i| i.flag.clone()).collect();
        flags.push(RETURN_FLAG.to_string());
        for via in &assignment {
            for dest in &plain {
                flags.push(write_flag(via, dest));
            }
        }
        for flag in &flags {
            self.identities.push(LoadedIdentity {
                name: format!("{flag}_is_bool"),
                expr: Expr::col(flag) * (Expr::one() - Expr::col(flag)),
                scope: IdentityScope::EveryRow,
            });
        }
        for instr in &instructions {
            if let LoadedBody::Constraints(body) = &instr.body {
                for identity in body {
                    self.identities.push(LoadedIdentity {
                        name: identity.name.clone(),
                        expr: Expr::col(&instr.flag) * identity.expr.clone(),
                        scope: identity.scope,
                    });
                }
            }
        }
        let jumping = Expr::sum(
            instructions
                .iter()
                .filter(|i| i.writes_pc)
                .map(|i| Expr::col(&i.flag))
                .chain(std::iter::once(Expr::col(RETURN_FLAG))),
        );
        self.identities.push(LoadedIdentity {
            name: format!("{pc}_update"),
            expr: (Expr::one() - jumping) * (Expr::next(&pc) - Expr::col(&pc) - Expr::one()),
            scope: IdentityScope::EveryRow,
        });
        self.identities.push(LoadedIdentity {
            name: format!("{pc}_return"),
            expr: Expr::col(RETURN_FLAG) * (Expr::next(&pc) - Expr::col(&pc)),
            scope: IdentityScope::EveryRow,
        });
        for dest in &plain {
            let writes: Vec<(String, &str)> = assignment.iter().map(|via| (write_flag(via, dest), *via)).collect();
            let written = Expr::sum(writes.iter().map(|(flag, via)| Expr::col(flag) * Expr::col(*via)));
            let any_write = Expr::sum(writes.iter().map(|(flag, _)| Expr::col(flag)));
            self.identities.push(LoadedIdentity {
                name: format!("{dest}_update"),
                expr: Expr::next(*dest) - written - (Expr::one() - any_write) * Expr::col(*dest),
                scope: IdentityScope::EveryRow,
            });
        }

        // Links
        for instr in &instructions {
            if let LoadedBody::Link { instance, operation } = &instr.body {
                let lookup = self.link_lookup(instr, instance, *operation)?;
                self.lookups.push(lookup);
            }
        }

        Ok((instructions, program, labels))
    }

    fn compile_instruction(
        &self,
        instr: &InstructionDef,
        pc: &str,
        register_kind: &impl Fn(&str) -> Option<RegisterKind>,
    ) -> Result<LoadedInstruction, MachineError> {
        let assignment_register = |name: &str| -> Result<(), MachineError> {
            match register_kind(name) {
                Some(RegisterKind::Assignment) => Ok(()),
                _ => Err(MachineError::InvalidRegister {
                    machine: self.name(),
                    register: name.to_string(),
                    reason: format!("`{}` parameters must be assignment registers", instr.name),
                }),
            }
        };

        let mut inputs = Vec::with_capacity(instr.inputs.len());
        let mut rename = HashMap::new();
        for param in &instr.inputs {
            inputs.push(match param {
                Param::Reg(name) => {
                    assignment_register(name)?;
                    LoadedParam::Reg(name.clone())
                }
                Param::Label(name) => {
                    let column = label_column(&instr.name, name);
                    rename.insert(name.clone(), column.clone());
                    LoadedParam::Label { column }
                }
            });
        }
        for output in &instr.outputs {
            assignment_register(output)?;
        }

        let (body, writes_pc) = match &instr.body {
            InstructionBody::Constraints(identities) => {
                let mut body = Vec::with_capacity(identities.len());
                let mut writes_pc = false;
                for identity in identities {
                    let name = format!("{}::{}", instr.name, identity.name);
                    let expr = self.inline(&identity.difference().renamed(&rename), &name)?;
                    for (column, next) in expr.references() {
                        let known = self.declared.contains(&column) || rename.values().any(|c| *c == column);
                        if !known {
                            return Err(MachineError::UndeclaredColumn {
                                machine: self.name(),
                                column,
                                context: name,
                            });
                        }
                        if next && column != pc {
                            return Err(MachineError::MalformedIdentity {
                                machine: self.name(),
                                identity: name,
                                reason: format!("instruction bodies may only refer to `{pc}'`, found `{column}'`"),
                            });
                        }
                        writes_pc |= next;
                    }
                    body.push(LoadedIdentity {
                        name,
                        expr,
                        scope: identity.scope,
                    });
                }
                (LoadedBody::Constraints(body), writes_pc)
            }
            InstructionBody::Link { instance, operation } => {
                let callee = self
                    .submachines
                    .iter()
                    .find(|(name, _)| name == instance)
                    .map(|(_, machine)| machine)
                    .ok_or_else(|| MachineError::UnknownSubmachine {
                        machine: self.name(),
                        instance: instance.clone(),
                    })?;
                if callee.kind != MachineKind::Block {
                    return Err(MachineError::UnsupportedCallee {
                        machine: self.name(),
                        instance: instance.clone(),
                        reason: "only machines exposing operations can be linked".to_string(),
                    });
                }
                let index = callee.operations.index_of(operation).ok_or_else(|| {
                    MachineError::SubMachineOperationNotFound {
                        machine: self.name(),
                        instance: instance.clone(),
                        operation: operation.clone(),
                    }
                })?;
                let op = &callee.operations.operations[index];
                if inputs.iter().any(|p| matches!(p, LoadedParam::Label { .. })) {
                    return Err(MachineError::InvalidRegister {
                        machine: self.name(),
                        register: instr.name.clone(),
                        reason: "linked instructions cannot take label parameters".to_string(),
                    });
                }
                for (expected, found) in [(op.inputs.len(), inputs.len()), (op.outputs.len(), instr.outputs.len())] {
                    if expected != found {
                        return Err(MachineError::ArityMismatch {
                            machine: self.name(),
                            instruction: instr.name.clone(),
                            expected,
                            found,
                        });
                    }
                }
                (
                    LoadedBody::Link {
                        instance: instance.clone(),
                        operation: index,
                    },
                    false,
                )
            }
        };

        Ok(LoadedInstruction {
            name: instr.name.clone(),
            flag: instr_flag(&instr.name),
            inputs,
            outputs: instr.outputs.clone(),
            body,
            writes_pc,
        })
    }

    #[allow(clippy::type_complexity)]
    fn compile_statements(
        &self,
        instructions: &[LoadedInstruction],
        pc: &str,
        register_kind: &impl Fn(&str) -> Option<RegisterKind>,
    ) -> Result<(Vec<LoadedStatement>, BTreeMap<String, usize>), MachineError> {
        let mut labels = BTreeMap::new();
        let mut line = 0;
        for statement in &self.def.program {
            match statement {
                Statement::Label(label) => {
                    if labels.insert(label.clone(), line).is_some() {
                        return Err(MachineError::DuplicateLabel {
                            machine: self.name(),
                            label: label.clone(),
                        });
                    }
                }
                _ => line += 1,
            }
        }

        let plain_register = |name: &str| -> Result<(), MachineError> {
            match register_kind(name) {
                Some(RegisterKind::Plain) => Ok(()),
                _ => Err(MachineError::InvalidRegister {
                    machine: self.name(),
                    register: name.to_string(),
                    reason: "only plain registers can be written".to_string(),
                }),
            }
        };
        let operand = |value: &Operand| -> Result<LoadedOperand, MachineError> {
            Ok(match value {
                Operand::Expr(expr) => {
                    for (name, next) in expr.references() {
                        let readable = matches!(register_kind(&name), Some(RegisterKind::Plain | RegisterKind::Pc));
                        if next || !readable {
                            return Err(MachineError::InvalidRegister {
                                machine: self.name(),
                                register: name,
                                reason: format!("operands may only read the current value of `{pc}` or plain registers"),
                            });
                        }
                    }
                    LoadedOperand::Expr(expr.clone())
                }
                Operand::Label(label) => LoadedOperand::Label(*labels.get(label).ok_or_else(|| {
                    MachineError::MissingLabel {
                        machine: self.name(),
                        label: label.clone(),
                    }
                })?),
                Operand::Query { kind, args } => LoadedOperand::Query {
                    kind: kind.clone(),
                    args: args.clone(),
                },
            })
        };

        let mut program = Vec::new();
        for statement in &self.def.program {
            program.push(match statement {
                Statement::Label(_) => continue,
                Statement::Return => LoadedStatement::Return,
                Statement::Assign { dests, via, value } => {
                    if register_kind(via) != Some(RegisterKind::Assignment) {
                        return Err(MachineError::InvalidRegister {
                            machine: self.name(),
                            register: via.clone(),
                            reason: "values are assigned through assignment registers".to_string(),
                        });
                    }
                    for dest in dests {
                        plain_register(dest)?;
                    }
                    LoadedStatement::Assign {
                        dests: dests.clone(),
                        via: via.clone(),
                        value: operand(value)?,
                    }
                }
                Statement::Instr { name, args, outputs } => {
                    let index = instructions
                        .iter()
                        .position(|i| &i.name == name)
                        .ok_or_else(|| MachineError::UnknownInstruction {
                            machine: self.name(),
                            instruction: name.clone(),
                        })?;
                    let instr = &instructions[index];
                    if args.len() != instr.inputs.len() {
                        return Err(MachineError::ArityMismatch {
                            machine: self.name(),
                            instruction: name.clone(),
                            expected: instr.inputs.len(),
                            found: args.len(),
                        });
                    }
                    if !outputs.is_empty() && outputs.len() != instr.outputs.len() {
                        return Err(MachineError::ArityMismatch {
                            machine: self.name(),
                            instruction: name.clone(),
                            expected: instr.outputs.len(),
                            found: outputs.len(),
                        });
                    }
                    for dest in outputs {
                        plain_register(dest)?;
                    }
                    let mut loaded_args = Vec::with_capacity(args.len());
                    for (param, arg) in instr.inputs.iter().zip(args) {
                        let arg = operand(arg)?;
                        if matches!(param, LoadedParam::Label { .. }) && !matches!(arg, LoadedOperand::Label(_)) {
                            return Err(MachineError::InvalidRegister {
                                machine: self.name(),
                                register: name.clone(),
                                reason: "label parameters need a label argument".to_string(),
                            });
                        }
                        loaded_args.push(arg);
                    }
                    LoadedStatement::Instr {
                        instruction: index,
                        args: loaded_args,
                        outputs: outputs.clone(),
                    }
                }
            });
        }
        Ok((program, labels))
    }

    /// Fixed columns describing the program, one row per line, and the lookup
    /// tying every executed row to its line.
    fn add_program_rom(
        &mut self,
        instructions: &[LoadedInstruction],
        program: &[LoadedStatement],
        pc: &str,
    ) -> Result<(), MachineError> {
        let degree = self.def.degree;
        let mut rom: BTreeMap<String, Vec<Fr>> = BTreeMap::new();
        for instr in instructions {
            rom.insert(instr.flag.clone(), vec![Fr::ZERO; degree]);
            for param in &instr.inputs {
                if let LoadedParam::Label { column } = param {
                    rom.insert(column.clone(), vec![Fr::ZERO; degree]);
                }
            }
        }
        rom.insert(RETURN_FLAG.to_string(), vec![Fr::ZERO; degree]);

        let mut mark = |column: &str, line: usize, value: Fr| {
            if let Some(values) = rom.get_mut(column) {
                values[line] = value;
            }
        };
        for (line, statement) in program.iter().enumerate() {
            match statement {
                LoadedStatement::Return => mark(RETURN_FLAG, line, Fr::ONE),
                LoadedStatement::Assign { .. } => {}
                LoadedStatement::Instr { instruction, args, .. } => {
                    let instr = &instructions[*instruction];
                    mark(&instr.flag, line, Fr::ONE);
                    for (param, arg) in instr.inputs.iter().zip(args) {
                        if let (LoadedParam::Label { column }, LoadedOperand::Label(target)) = (param, arg) {
                            mark(column, line, Fr::from(*target as u64));
                        }
                    }
                }
            }
        }

        self.add_fixed(PC_ROM, FixedColumn::Expr(Expr::RowIndex))?;
        let mut source = vec![Expr::col(pc)];
        let mut target = vec![Expr::col(PC_ROM)];
        for (column, values) in rom {
            let name = rom_column(&column);
            self.add_fixed(&name, FixedColumn::Literal(values))?;
            source.push(Expr::col(&column));
            target.push(Expr::col(&name));
        }
        self.lookups.push(LookupDef::new(
            "program_rom",
            LookupSide::new(Expr::one(), source),
            LookupSide::new(Expr::one(), target),
        ));
        Ok(())
    }

    fn link_lookup(
        &self,
        instr: &LoadedInstruction,
        instance: &str,
        operation: usize,
    ) -> Result<LookupDef, MachineError> {
        let callee = self
            .submachines
            .iter()
            .find(|(name, _)| name == instance)
            .map(|(_, machine)| machine)
            .ok_or_else(|| MachineError::UnknownSubmachine {
                machine: self.name(),
                instance: instance.to_string(),
            })?;
        let op = callee.operations.operations.get(operation).ok_or_else(|| {
            MachineError::SubMachineOperationNotFound {
                machine: self.name(),
                instance: instance.to_string(),
                operation: operation.to_string(),
            }
        })?;

        let mut source = Vec::new();
        let mut target = Vec::new();
        if let Some(operation_id) = &callee.operation_id {
            source.push(Expr::Const(Fr::from(op.id)));
            target.push(Expr::col(operation_id));
        }
        for param in &instr.inputs {
            if let LoadedParam::Reg(register) = param {
                source.push(Expr::col(register));
            }
        }
        source.extend(instr.outputs.iter().map(Expr::col));
        target.extend(op.inputs.iter().chain(&op.outputs).map(Expr::col));
        let selector = callee.latch.as_deref().map_or_else(Expr::one, Expr::col);

        Ok(LookupDef::new(
            format!("link_{}", instr.name),
            LookupSide::new(Expr::col(&instr.flag), source),
            LookupSide::new(selector, target),
        )
        .into_instance(instance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::machine::Identity;

    fn counter() -> Machine {
        Machine::new("Counter", 8)
            .register("pc", RegisterKind::Pc)
            .register("X", RegisterKind::Assignment)
            .register("A", RegisterKind::Plain)
            .instruction(InstructionDef::new("jmp", vec![Param::Label("l".into())], vec![]).constraints(vec![
                Identity::new("target", Expr::next("pc"), Expr::col("l")),
            ]))
            .program(vec![
                Statement::assign("A", "X", Operand::value(1)),
                Statement::label("end"),
                Statement::Return,
            ])
    }

    #[test]
    fn test_vm_expansion() {
        let machine = LoadedMachine::load(&counter()).unwrap();
        assert_eq!(machine.kind, MachineKind::Vm);
        assert_eq!(machine.labels["end"], 1);
        for column in ["pc", "X", "A", "instr_jmp", "jmp_l", RETURN_FLAG, "reg_write_X_A"] {
            assert!(machine.witness_source(column).is_some(), "missing {column}");
        }
        for column in [PC_ROM, "p_instr_jmp", "p_jmp_l", "p_instr__return"] {
            assert!(machine.is_fixed(column), "missing {column}");
        }
        assert!(machine.instructions[0].writes_pc);
        assert!(machine.identities.iter().any(|i| i.name == "jmp::target"));
        assert!(machine.lookups.iter().any(|l| l.name == "program_rom"));
    }

    #[test]
    fn test_structural_errors() {
        let unknown = counter().program(vec![Statement::instr("jump", vec![], vec![]), Statement::Return]);
        assert!(matches!(
            LoadedMachine::load(&unknown),
            Err(MachineError::UnknownInstruction { .. })
        ));

        let arity = counter().program(vec![Statement::instr("jmp", vec![], vec![]), Statement::Return]);
        assert!(matches!(
            LoadedMachine::load(&arity),
            Err(MachineError::ArityMismatch { expected: 1, found: 0, .. })
        ));

        let missing = counter().program(vec![
            Statement::instr("jmp", vec![Operand::label("nowhere")], vec![]),
            Statement::Return,
        ]);
        assert!(matches!(
            LoadedMachine::load(&missing),
            Err(MachineError::MissingLabel { .. })
        ));

        let bad_degree = Machine::new("M", 6);
        assert!(matches!(
            LoadedMachine::load(&bad_degree),
            Err(MachineError::InvalidDegree { degree: 6, .. })
        ));

        let undeclared = Machine::new("M", 4).identity(Identity::zero("ghost", Expr::col("nope")));
        assert!(matches!(
            LoadedMachine::load(&undeclared),
            Err(MachineError::UndeclaredColumn { .. })
        ));

        let period = Machine::new("M", 8).fixed("P", FixedValues::periodic([1, 0, 0]));
        assert!(matches!(
            LoadedMachine::load(&period),
            Err(MachineError::PeriodMismatch { period: 3, .. })
        ));
    }

    #[test]
    fn test_intermediates_are_inlined() {
        let machine = Machine::new("M", 4)
            .witness("x", WitnessSource::Free)
            .intermediate("double", Expr::constant(2) * Expr::col("x"))
            .identity(Identity::new("step", Expr::next("x"), Expr::col("double")));
        let loaded = LoadedMachine::load(&machine).unwrap();
        let expr = &loaded.identities[0].expr;
        assert!(expr.references().iter().all(|(name, _)| name == "x"));
        assert!(loaded.identities[0].is_transition());

        let cyclic = Machine::new("M", 4)
            .intermediate("a", Expr::col("b"))
            .intermediate("b", Expr::col("a"))
            .identity(Identity::zero("loop", Expr::col("a")));
        assert!(matches!(
            LoadedMachine::load(&cyclic),
            Err(MachineError::MalformedIdentity { .. })
        ));
    }

    #[test]
    fn test_link_to_missing_operation() {
        let callee = Machine::new("Sq", 4)
            .witness("x", WitnessSource::Free)
            .witness("y", WitnessSource::Free)
            .operation(OperationDef::new("square", 0, vec!["x"], vec!["y"]));
        let caller = Machine::new("Main", 4)
            .submachine("sq", callee)
            .register("pc", RegisterKind::Pc)
            .register("X", RegisterKind::Assignment)
            .register("Y", RegisterKind::Assignment)
            .instruction(InstructionDef::new("cube", vec![Param::Reg("X".into())], vec!["Y"]).link("sq", "cube"))
            .program(vec![Statement::Return]);
        assert!(matches!(
            LoadedMachine::load(&caller),
            Err(MachineError::SubMachineOperationNotFound { .. })
        ));

        let mut fixed = caller.clone();
        fixed.instructions[0] = InstructionDef::new("sq", vec![Param::Reg("X".into())], vec!["Y"]).link("sq", "square");
        let loaded = LoadedMachine::load(&fixed).unwrap();
        let callee = loaded.submachine("sq").unwrap();
        assert_eq!(callee.kind, MachineKind::Block);
        assert_eq!(callee.operations.index_of("square"), Some(0));
        assert!(loaded.lookups.iter().any(|l| l.name == "link_sq" && l.target_instance.as_deref() == Some("sq")));
    }

    #[test]
    fn test_fixed_generators() {
        let periodic = FixedColumn::Periodic(vec![Fr::ONE, Fr::ZERO]);
        assert_eq!(periodic.value_at(5), Fr::ZERO);
        let squares = FixedColumn::Expr(Expr::RowIndex * Expr::RowIndex);
        assert_eq!(squares.value_at(3), Fr::from(9u64));
    }
}
