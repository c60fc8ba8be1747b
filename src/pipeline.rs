//! End-to-end runs: load, execute, finalize, verify.

use rayon::prelude::*;
use std::collections::BTreeMap;
use tracing::{debug, info, instrument, warn};

use crate::config::EngineConfig;
use crate::error::MachineError;
use crate::field::Fr;
use crate::report::{VerificationReport, Violation};
use crate::vm::bus::{BusInteraction, BusLedger, interactions};
use crate::vm::constraints::ConstraintChecker;
use crate::vm::executor;
use crate::vm::linker::MachineInstance;
use crate::vm::loader::LoadedMachine;
use crate::vm::lookup::LookupEngine;
use crate::vm::machine::Machine;
use crate::vm::query::{NoQueries, QueryCallback};
use crate::vm::trace::ExecutionTrace;

/// A witness cell written before execution starts.
#[derive(Debug, Clone)]
struct Seed {
    path: String,
    column: String,
    row: usize,
    value: Fr,
}

/// Frozen traces of every instance plus the verification report.
#[derive(Debug, Clone)]
pub struct RunOutput {
    /// Keyed by instance path: `Main`, `Main.instance`, ...
    pub traces: BTreeMap<String, ExecutionTrace>,
    pub report: VerificationReport,
}

impl RunOutput {
    pub fn trace(&self, path: &str) -> Option<&ExecutionTrace> {
        self.traces.get(path)
    }

    pub fn digests(&self) -> BTreeMap<String, [u8; 32]> {
        self.traces
            .iter()
            .map(|(path, trace)| (path.clone(), trace.digest()))
            .collect()
    }
}

/// Runs a machine tree against a query callback.
pub struct Engine {
    machine: LoadedMachine,
    config: EngineConfig,
    queries: Box<dyn QueryCallback>,
    seeds: Vec<Seed>,
}

/// Every instance of the tree with its path, parents first.
fn instances(machine: &LoadedMachine) -> Vec<(String, &LoadedMachine)> {
    fn walk<'m>(path: String, machine: &'m LoadedMachine, out: &mut Vec<(String, &'m LoadedMachine)>) {
        out.push((path.clone(), machine));
        for (instance, sub) in &machine.submachines {
            walk(format!("{path}.{instance}"), sub, out);
        }
    }
    let mut out = Vec::new();
    walk(machine.name.clone(), machine, &mut out);
    out
}

/// Findings of one instance's verification passes.
type InstanceFindings = (Vec<Violation>, Vec<Violation>, Vec<BusInteraction>);

impl Engine {
    /// Loads and validates `definition`.
    #[instrument(skip_all, fields(machine = %definition.name))]
    pub fn new(definition: &Machine) -> Result<Self, MachineError> {
        let machine = LoadedMachine::load(definition)?;
        Ok(Self {
            machine,
            config: EngineConfig::default(),
            queries: Box::new(NoQueries),
            seeds: Vec::new(),
        })
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_query(mut self, queries: impl QueryCallback + 'static) -> Self {
        self.queries = Box::new(queries);
        self
    }

    /// Pre-assigns a witness cell of the instance at `path`.
    pub fn with_seed(mut self, path: impl Into<String>, column: impl Into<String>, row: usize, value: Fr) -> Self {
        self.seeds.push(Seed {
            path: path.into(),
            column: column.into(),
            row,
            value,
        });
        self
    }

    pub fn machine(&self) -> &LoadedMachine {
        &self.machine
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Executes the machine tree and verifies the result.
    #[instrument(skip_all, fields(machine = %self.machine.name))]
    pub fn run(&self) -> Result<RunOutput, MachineError> {
        let mut root = MachineInstance::new(&self.machine);
        for seed in &self.seeds {
            let instance = root
                .find_mut(&seed.path)
                .ok_or_else(|| MachineError::UnknownSubmachine {
                    machine: self.machine.name.clone(),
                    instance: seed.path.clone(),
                })?;
            instance.store.set(&seed.column, seed.row, seed.value)?;
        }

        let mut diagnostics = Vec::new();
        executor::run(&mut root, self.queries.as_ref(), &mut diagnostics)?;

        root.for_each_mut(&mut |instance: &mut MachineInstance<'_>| -> Result<(), MachineError> {
            instance.store.finalize()?;
            ConstraintChecker::new(instance.machine, &instance.path).derive_helpers(&mut instance.store)?;
            Ok(())
        })?;
        let traces: BTreeMap<String, ExecutionTrace> = root.freeze()?.into_iter().collect();
        info!(instances = traces.len(), diagnostics = diagnostics.len(), "execution finished");

        let report = self.report(&traces, diagnostics)?;
        Ok(RunOutput { traces, report })
    }

    /// Runs only the verification passes over existing traces.
    pub fn verify(&self, traces: &BTreeMap<String, ExecutionTrace>) -> Result<VerificationReport, MachineError> {
        self.report(traces, Vec::new())
    }

    fn report(
        &self,
        traces: &BTreeMap<String, ExecutionTrace>,
        mut violations: Vec<Violation>,
    ) -> Result<VerificationReport, MachineError> {
        let parallel = self.config.parallel;
        let check = |(path, machine): &(String, &LoadedMachine)| -> Result<InstanceFindings, MachineError> {
            let trace = traces.get(path).ok_or_else(|| MachineError::UnknownSubmachine {
                machine: self.machine.name.clone(),
                instance: path.clone(),
            })?;
            let identities = ConstraintChecker::new(machine, path).check(trace, parallel)?;
            let lookups = LookupEngine::new(machine, path).check(traces, parallel)?;
            let bus = interactions(&machine.bus, trace)?;
            debug!(
                instance = %path,
                identities = identities.len(),
                lookups = lookups.len(),
                interactions = bus.len(),
                "instance verified"
            );
            Ok((identities, lookups, bus))
        };

        let machines = instances(&self.machine);
        let findings: Vec<InstanceFindings> = if parallel {
            machines.par_iter().map(check).collect::<Result<_, _>>()?
        } else {
            machines.iter().map(check).collect::<Result<_, _>>()?
        };

        let mut ledger = BusLedger::new();
        let mut lookup_violations = Vec::new();
        for (identities, lookups, bus) in findings {
            violations.extend(identities);
            lookup_violations.extend(lookups);
            ledger.absorb(bus);
        }
        violations.extend(lookup_violations);
        violations.extend(ledger.imbalances());

        let report = VerificationReport::new(violations, self.config.violation_limit);
        if report.is_empty() {
            info!("all constraints satisfied");
        } else {
            warn!(violations = report.len(), "verification failed");
        }
        Ok(report)
    }
}
