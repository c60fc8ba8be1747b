//! Sub-machine instances and block-machine calls.
//!
//! Every machine instance owns its column store and the instances of its
//! sub-machines. A call into a block machine fills the callee's next free
//! row: the operation id and inputs are written, the row is solved, and the
//! output cells are returned to the caller. Once the caller has produced all
//! of its rows, each block child pads its remaining rows by replaying its
//! last call and every other child runs on its own.

use ark_ff::AdditiveGroup;
use std::collections::BTreeSet;
use tracing::debug;

use crate::error::MachineError;
use crate::field::Fr;
use crate::report::Violation;
use crate::vm::executor;
use crate::vm::loader::{LoadedMachine, MachineKind};
use crate::vm::query::QueryCallback;
use crate::vm::solver::{Context, System, solve_row, writable_columns};
use crate::vm::trace::{ColumnStore, ExecutionTrace};

/// A machine definition together with the state of one run.
pub struct MachineInstance<'m> {
    /// `Main` for the root, `Main.instance` below it.
    pub path: String,
    pub machine: &'m LoadedMachine,
    pub store: ColumnStore,
    pub(crate) system: System,
    pub(crate) writable: BTreeSet<String>,
    children: Vec<(String, MachineInstance<'m>)>,
    /// Next free row of a block machine.
    next_row: usize,
    /// Operation index and inputs of the latest call.
    last_call: Option<(usize, Vec<Fr>)>,
}

impl<'m> MachineInstance<'m> {
    pub fn new(machine: &'m LoadedMachine) -> Self {
        Self::with_path(machine.name.clone(), machine)
    }

    fn with_path(path: String, machine: &'m LoadedMachine) -> Self {
        let children = machine
            .submachines
            .iter()
            .map(|(instance, sub)| {
                (instance.clone(), MachineInstance::with_path(format!("{path}.{instance}"), sub))
            })
            .collect();
        let system = match machine.kind {
            MachineKind::Vm => System::for_program(machine),
            MachineKind::Block | MachineKind::Pure => System::for_rows(machine),
        };
        Self {
            path,
            machine,
            store: ColumnStore::new(machine),
            system,
            writable: writable_columns(machine),
            children,
            next_row: 0,
            last_call: None,
        }
    }

    pub fn child_mut(&mut self, instance: &str) -> Result<&mut MachineInstance<'m>, MachineError> {
        let machine = &self.machine.name;
        self.children
            .iter_mut()
            .find(|(name, _)| name == instance)
            .map(|(_, child)| child)
            .ok_or_else(|| MachineError::UnknownSubmachine {
                machine: machine.clone(),
                instance: instance.to_string(),
            })
    }

    /// Finds an instance anywhere below (or at) this one by path.
    pub fn find_mut(&mut self, path: &str) -> Option<&mut MachineInstance<'m>> {
        if self.path == path {
            return Some(self);
        }
        self.children
            .iter_mut()
            .find_map(|(_, child)| child.find_mut(path))
    }

    /// Visits this instance and all descendants, parents first.
    pub fn for_each_mut(
        &mut self,
        visit: &mut impl FnMut(&mut MachineInstance<'m>) -> Result<(), MachineError>,
    ) -> Result<(), MachineError> {
        visit(self)?;
        for (_, child) in &mut self.children {
            child.for_each_mut(visit)?;
        }
        Ok(())
    }

    /// Executes one operation of a block machine in its next free row and
    /// returns the output values.
    pub fn call_operation(
        &mut self,
        operation: usize,
        inputs: &[Fr],
        queries: &dyn QueryCallback,
        violations: &mut Vec<Violation>,
    ) -> Result<Vec<Fr>, MachineError> {
        let machine = self.machine;
        let op = machine.operations.get(operation).ok_or_else(|| {
            MachineError::SubMachineOperationNotFound {
                machine: machine.name.clone(),
                instance: self.path.clone(),
                operation: operation.to_string(),
            }
        })?;
        let row = self.next_row;
        if row >= machine.degree {
            return Err(MachineError::RowLimitExceeded {
                machine: self.path.clone(),
                degree: machine.degree,
            });
        }
        debug!(instance = %self.path, operation = %op.name, row, "block call");

        if let Some(column) = &machine.operation_id {
            self.store.set(column, row, Fr::from(op.id))?;
        }
        for (column, value) in op.inputs.iter().zip(inputs) {
            self.store.set(column, row, *value)?;
        }
        let mut ctx = Context {
            machine: &self.path,
            queries,
            violations,
        };
        solve_row(&mut self.store, row, &self.system, &self.writable, &mut ctx)?;
        let outputs = op
            .outputs
            .iter()
            .map(|column| self.store.get(column, row))
            .collect::<Result<Vec<_>, _>>()?;

        self.next_row += 1;
        self.last_call = Some((operation, inputs.to_vec()));
        Ok(outputs)
    }

    /// Fills the unused rows of a block machine by repeating its last call,
    /// or a zero-input call of the first operation if it was never called.
    pub fn pad(&mut self, queries: &dyn QueryCallback, violations: &mut Vec<Violation>) -> Result<(), MachineError> {
        let (operation, inputs) = match &self.last_call {
            Some(call) => call.clone(),
            None => {
                let arity = self.machine.operations.get(0).map_or(0, |op| op.inputs.len());
                (0, vec![Fr::ZERO; arity])
            }
        };
        let calls = self.next_row;
        while self.next_row < self.machine.degree {
            self.call_operation(operation, &inputs, queries, violations)?;
        }
        debug!(instance = %self.path, calls, "block machine padded");
        Ok(())
    }

    /// Completes every child once this instance's rows are final.
    pub fn finish(&mut self, queries: &dyn QueryCallback, violations: &mut Vec<Violation>) -> Result<(), MachineError> {
        for (_, child) in &mut self.children {
            executor::run(child, queries, violations)?;
        }
        Ok(())
    }

    /// Freezes every store of the tree, keyed by instance path.
    pub fn freeze(self) -> Result<Vec<(String, ExecutionTrace)>, MachineError> {
        let mut traces = Vec::new();
        self.freeze_into(&mut traces)?;
        Ok(traces)
    }

    fn freeze_into(self, traces: &mut Vec<(String, ExecutionTrace)>) -> Result<(), MachineError> {
        traces.push((self.path, self.store.freeze()?));
        for (_, child) in self.children {
            child.freeze_into(traces)?;
        }
        Ok(())
    }
}
