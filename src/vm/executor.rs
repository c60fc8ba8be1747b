//! Row-by-row execution.
//!
//! Program-counter machines run their program one statement per row. Each
//! row resolves operands, dispatches the statement, solves inline
//! instruction constraints for output registers and `pc'`, calls linked
//! sub-machine operations, and records registers, flags and label
//! parameters. Machines without a program counter are solved row by row.

use ark_ff::{AdditiveGroup, Field};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, instrument};

use crate::error::MachineError;
use crate::field::{Fr, to_signed_string, to_usize};
use crate::report::Violation;
use crate::vm::expr::Expr;
use crate::vm::linker::MachineInstance;
use crate::vm::loader::{
    LoadedBody, LoadedIdentity, LoadedMachine, LoadedOperand, LoadedParam, LoadedStatement, MachineKind,
    RETURN_FLAG, write_flag,
};
use crate::vm::machine::RegisterKind;
use crate::vm::query::QueryCallback;
use crate::vm::registers::RegisterBank;
use crate::vm::solver::{Context, Equation, Frame, System, solve, solve_row};
use crate::vm::trace::ColumnStore;

/// Produces every row of `instance`, then completes its sub-machines.
#[instrument(skip_all, fields(instance = %instance.path))]
pub fn run(
    instance: &mut MachineInstance<'_>,
    queries: &dyn QueryCallback,
    violations: &mut Vec<Violation>,
) -> Result<(), MachineError> {
    match instance.machine.kind {
        MachineKind::Vm => execute_program(instance, queries, violations)?,
        MachineKind::Pure => {
            for row in 0..instance.machine.degree {
                let mut ctx = Context {
                    machine: &instance.path,
                    queries,
                    violations: &mut *violations,
                };
                solve_row(&mut instance.store, row, &instance.system, &instance.writable, &mut ctx)?;
            }
        }
        MachineKind::Block => instance.pad(queries, violations)?,
    }
    instance.finish(queries, violations)
}

/// Cells visible to an instruction body: registers first, then label
/// parameters, then the column store.
struct ExecFrame<'e> {
    machine: &'e LoadedMachine,
    registers: &'e mut RegisterBank,
    labels: &'e BTreeMap<String, Fr>,
    /// Flag and label columns, recorded by the executor after the body.
    recorded: &'e BTreeSet<String>,
    store: &'e mut ColumnStore,
    row: usize,
}

impl Frame for ExecFrame<'_> {
    fn row(&self) -> usize {
        self.row
    }

    fn degree(&self) -> usize {
        self.machine.degree
    }

    fn known(&self, column: &str, next: bool) -> Option<Fr> {
        match (self.registers.kind(column), next) {
            (Some(_), false) => self.registers.read(column),
            (Some(_), true) => self.registers.read_next(column),
            (None, true) => None,
            (None, false) => match self.labels.get(column) {
                Some(value) => Some(*value),
                None => self.store.try_get(column, self.row).ok().flatten(),
            },
        }
    }

    fn solvable(&self, column: &str, next: bool) -> bool {
        match (self.registers.kind(column), next) {
            (Some(RegisterKind::Assignment), false) | (Some(RegisterKind::Pc), true) => true,
            (None, false) => self.machine.witness_source(column).is_some() && !self.recorded.contains(column),
            _ => false,
        }
    }

    fn assign(&mut self, column: &str, next: bool, value: Fr) -> Result<(), MachineError> {
        match (self.registers.kind(column), next) {
            (Some(_), false) => self.registers.assign(column, value),
            (Some(_), true) => self.registers.stage(column, value),
            (None, _) => self.store.set(column, self.row, value)?,
        }
        Ok(())
    }
}

fn operand(
    value: &LoadedOperand,
    registers: &RegisterBank,
    row: usize,
    ctx: &mut Context<'_>,
) -> Fr {
    match value {
        // Operands only read registers that always hold a value.
        LoadedOperand::Expr(expr) => expr
            .evaluate(row, &|name, _| registers.read(name).ok_or(()))
            .unwrap_or(Fr::ZERO),
        LoadedOperand::Label(line) => Fr::from(*line as u64),
        LoadedOperand::Query { kind, args } => ctx.query(kind, args, row),
    }
}

/// An instruction body together with the parts of the row system that do
/// not read flag or label columns, so outputs and `pc'` may depend on
/// constrained witness cells of the same row.
fn body_system(row: &System, body: &[LoadedIdentity], recorded: &BTreeSet<String>) -> System {
    let reads_recorded = |expr: &Expr| expr.references().iter().any(|(column, _)| recorded.contains(column));
    System {
        equations: body
            .iter()
            .map(Equation::from)
            .chain(row.equations.iter().filter(|eq| !reads_recorded(&eq.expr)).cloned())
            .collect(),
        queries: row
            .queries
            .iter()
            .filter(|query| !query.args.iter().any(|arg| reads_recorded(arg)))
            .cloned()
            .collect(),
        helpers: row
            .helpers
            .iter()
            .filter(|(_, source)| !reads_recorded(source))
            .cloned()
            .collect(),
        lookups: row
            .lookups
            .iter()
            .filter(|lookup| !std::iter::once(&lookup.selector).chain(&lookup.tuple).any(|e| reads_recorded(e)))
            .cloned()
            .collect(),
    }
}

fn execute_program(
    instance: &mut MachineInstance<'_>,
    queries: &dyn QueryCallback,
    violations: &mut Vec<Violation>,
) -> Result<(), MachineError> {
    let machine = instance.machine;
    let path = instance.path.clone();
    let pc = machine.pc().unwrap_or_default().to_string();
    let mut registers = RegisterBank::new(machine);
    let flag_columns = machine.flag_columns();
    let label_columns: Vec<String> = machine.label_columns().map(String::from).collect();
    let recorded: BTreeSet<String> = flag_columns.iter().cloned().chain(label_columns.iter().cloned()).collect();
    let bodies: Vec<(System, BTreeSet<&str>)> = machine
        .instructions
        .iter()
        .map(|instr| match &instr.body {
            LoadedBody::Constraints(body) => (
                body_system(&instance.system, body, &recorded),
                body.iter().map(|identity| identity.name.as_str()).collect(),
            ),
            LoadedBody::Link { .. } => (System::default(), BTreeSet::new()),
        })
        .collect();

    let mut returned = false;
    for row in 0..machine.degree {
        let current = registers.read(&pc).unwrap_or(Fr::ZERO);
        let line = to_usize(&current)
            .filter(|line| *line < machine.program.len())
            .ok_or_else(|| MachineError::ProgramCounterOutOfRange {
                machine: path.clone(),
                pc: to_signed_string(&current),
            })?;
        let mut flags: BTreeSet<String> = BTreeSet::new();
        let mut labels: BTreeMap<String, Fr> = BTreeMap::new();

        match &machine.program[line] {
            LoadedStatement::Return => {
                flags.insert(RETURN_FLAG.to_string());
                registers.stage(&pc, current);
                if !returned {
                    debug!(row, "return");
                }
                returned = true;
            }
            LoadedStatement::Assign { dests, via, value } => {
                let mut ctx = Context {
                    machine: &path,
                    queries,
                    violations: &mut *violations,
                };
                let value = operand(value, &registers, row, &mut ctx);
                registers.assign(via, value);
                for dest in dests {
                    registers.stage(dest, value);
                    flags.insert(write_flag(via, dest));
                }
            }
            LoadedStatement::Instr {
                instruction,
                args,
                outputs,
            } => {
                let instr = &machine.instructions[*instruction];
                flags.insert(instr.flag.clone());
                {
                    let mut ctx = Context {
                        machine: &path,
                        queries,
                        violations: &mut *violations,
                    };
                    for (param, arg) in instr.inputs.iter().zip(args) {
                        let value = operand(arg, &registers, row, &mut ctx);
                        match param {
                            LoadedParam::Reg(register) => registers.assign(register, value),
                            LoadedParam::Label { column } => {
                                labels.insert(column.clone(), value);
                            }
                        }
                    }
                }

                match &instr.body {
                    LoadedBody::Constraints(_) => {
                        let mut ctx = Context {
                            machine: &path,
                            queries,
                            violations: &mut *violations,
                        };
                        let mut frame = ExecFrame {
                            machine,
                            registers: &mut registers,
                            labels: &labels,
                            recorded: &recorded,
                            store: &mut instance.store,
                            row,
                        };
                        let (system, body) = &bodies[*instruction];
                        let stuck = solve(&mut frame, system, &mut ctx)?;
                        // The rest is finished by the row solve.
                        for identity in stuck.iter().filter(|name| body.contains(name.as_str())) {
                            ctx.non_invertible(identity, row, "more than one unknown");
                        }
                    }
                    LoadedBody::Link { instance: callee, operation } => {
                        let inputs: Vec<Fr> = instr
                            .inputs
                            .iter()
                            .filter_map(|param| match param {
                                LoadedParam::Reg(register) => registers.read(register),
                                LoadedParam::Label { .. } => None,
                            })
                            .collect();
                        let results = instance
                            .child_mut(callee)?
                            .call_operation(*operation, &inputs, queries, violations)?;
                        for (register, value) in instr.outputs.iter().zip(results) {
                            registers.assign(register, value);
                        }
                    }
                }

                for (output, dest) in instr.outputs.iter().zip(outputs) {
                    let value = registers.read(output).unwrap_or(Fr::ZERO);
                    registers.stage(dest, value);
                    flags.insert(write_flag(output, dest));
                }
            }
        }

        if registers.read_next(&pc).is_none() {
            registers.stage(&pc, current + Fr::ONE);
        }

        let mut ctx = Context {
            machine: &path,
            queries,
            violations: &mut *violations,
        };
        let store = &mut instance.store;
        for register in &machine.registers {
            let value = match registers.read(&register.name) {
                Some(value) => value,
                None if register.kind == RegisterKind::Assignment => Fr::ZERO,
                None => {
                    ctx.non_invertible(&register.name, row, "register has no value");
                    Fr::ZERO
                }
            };
            store.set(&register.name, row, value)?;
        }
        for flag in &flag_columns {
            let value = if flags.contains(flag) { Fr::ONE } else { Fr::ZERO };
            store.set(flag, row, value)?;
        }
        for column in &label_columns {
            store.set(column, row, labels.get(column).copied().unwrap_or(Fr::ZERO))?;
        }
        solve_row(store, row, &instance.system, &instance.writable, &mut ctx)?;
        registers.advance();
    }

    if !returned {
        return Err(MachineError::RowLimitExceeded {
            machine: path,
            degree: machine.degree,
        });
    }
    info!(rows = machine.degree, "program executed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::fe;
    use crate::vm::machine::{Identity, InstructionDef, Machine, Operand, Param, Statement, WitnessSource};
    use crate::vm::query::{InputQueries, NoQueries};

    fn counter(program: Vec<Statement>, degree: usize) -> Machine {
        Machine::new("Main", degree)
            .register("pc", RegisterKind::Pc)
            .register("X", RegisterKind::Assignment)
            .register("Y", RegisterKind::Assignment)
            .register("A", RegisterKind::Plain)
            .instruction(
                InstructionDef::new("incr", vec![Param::Reg("X".into())], vec!["Y"])
                    .constraints(vec![Identity::new("step", Expr::col("Y"), Expr::col("X") + Expr::one())]),
            )
            .instruction(
                InstructionDef::new("jmp", vec![Param::Label("l".into())], vec![])
                    .constraints(vec![Identity::new("target", Expr::next("pc"), Expr::col("l"))]),
            )
            .program(program)
    }

    fn execute(machine: &Machine, queries: &dyn QueryCallback) -> (Result<(), MachineError>, ColumnStore, Vec<Violation>) {
        let loaded = LoadedMachine::load(machine).unwrap();
        let mut instance = MachineInstance::new(&loaded);
        let mut violations = Vec::new();
        let result = run(&mut instance, queries, &mut violations);
        (result, instance.store, violations)
    }

    #[test]
    fn test_registers_flow_through_rows() {
        let machine = counter(
            vec![
                Statement::assign("A", "X", Operand::value(5)),
                Statement::instr("incr", vec![Operand::reg("A")], vec!["A"]),
                Statement::Return,
            ],
            4,
        );
        let (result, store, violations) = execute(&machine, &NoQueries);
        result.unwrap();
        assert!(violations.is_empty());
        let a: Vec<Fr> = (0..4).map(|row| store.get("A", row).unwrap()).collect();
        assert_eq!(a, vec![fe(0), fe(5), fe(6), fe(6)]);
        let pc: Vec<Fr> = (0..4).map(|row| store.get("pc", row).unwrap()).collect();
        assert_eq!(pc, vec![fe(0), fe(1), fe(2), fe(2)]);
        assert_eq!(store.get("reg_write_Y_A", 1).unwrap(), fe(1));
        assert_eq!(store.get(RETURN_FLAG, 3).unwrap(), fe(1));
    }

    #[test]
    fn test_inputs_and_missing_inputs() {
        let machine = counter(
            vec![
                Statement::assign("A", "X", Operand::input(0)),
                Statement::assign("A", "X", Operand::input(1)),
                Statement::Return,
            ],
            4,
        );
        let (result, store, violations) = execute(&machine, &InputQueries::new(vec![fe(42)]));
        result.unwrap();
        assert_eq!(store.get("A", 1).unwrap(), fe(42));
        assert_eq!(store.get("A", 2).unwrap(), fe(0));
        assert!(matches!(
            violations.as_slice(),
            [Violation::MissingQueryResponse { row: 1, .. }]
        ));
    }

    #[test]
    fn test_body_reads_constrained_witness() {
        let machine = counter(
            vec![
                Statement::assign("A", "X", Operand::value(4)),
                Statement::instr("twice", vec![Operand::reg("A")], vec!["A"]),
                Statement::Return,
            ],
            4,
        )
        .witness("double", WitnessSource::Free)
        .identity(Identity::new("double_x", Expr::col("double"), Expr::constant(2) * Expr::col("X")))
        .instruction(
            InstructionDef::new("twice", vec![Param::Reg("X".into())], vec!["Y"])
                .constraints(vec![Identity::new("out", Expr::col("Y"), Expr::col("double"))]),
        );
        let (result, store, violations) = execute(&machine, &NoQueries);
        result.unwrap();
        assert!(violations.is_empty(), "{violations:?}");
        let a: Vec<Fr> = (0..4).map(|row| store.get("A", row).unwrap()).collect();
        assert_eq!(a, vec![fe(0), fe(4), fe(8), fe(8)]);
        let double: Vec<Fr> = (0..4).map(|row| store.get("double", row).unwrap()).collect();
        assert_eq!(double, vec![fe(8), fe(8), fe(0), fe(0)]);
    }

    #[test]
    fn test_running_out_of_rows() {
        let machine = counter(
            vec![
                Statement::label("top"),
                Statement::instr("incr", vec![Operand::reg("A")], vec!["A"]),
                Statement::instr("jmp", vec![Operand::label("top")], vec![]),
                Statement::Return,
            ],
            8,
        );
        let (result, store, _) = execute(&machine, &NoQueries);
        assert!(matches!(result, Err(MachineError::RowLimitExceeded { degree: 8, .. })));
        // The loop alternates between its two lines
        assert_eq!(store.get("pc", 5).unwrap(), fe(1));
        assert_eq!(store.get("jmp_l", 5).unwrap(), fe(0));
        assert_eq!(store.get("A", 6).unwrap(), fe(3));
    }
}
