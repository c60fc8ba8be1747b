//! Register state of a program-counter machine.
//!
//! The program counter and plain registers persist across rows: a write
//! during row `i` is staged and becomes visible at row `i + 1`. Assignment
//! registers only hold a value for the row that assigned them.

use ark_ff::AdditiveGroup;
use std::collections::BTreeMap;

use crate::field::Fr;
use crate::vm::loader::LoadedMachine;
use crate::vm::machine::RegisterKind;

#[derive(Debug, Clone)]
pub struct RegisterBank {
    kinds: BTreeMap<String, RegisterKind>,
    /// Values of `pc` and plain registers at the current row.
    current: BTreeMap<String, Fr>,
    /// Values for the next row.
    staged: BTreeMap<String, Fr>,
    /// Assignment registers written during the current row.
    assigned: BTreeMap<String, Fr>,
}

impl RegisterBank {
    /// All persistent registers start at zero.
    pub fn new(machine: &LoadedMachine) -> Self {
        let kinds: BTreeMap<String, RegisterKind> = machine
            .registers
            .iter()
            .map(|r| (r.name.clone(), r.kind))
            .collect();
        let current = kinds
            .iter()
            .filter(|(_, kind)| **kind != RegisterKind::Assignment)
            .map(|(name, _)| (name.clone(), Fr::ZERO))
            .collect();
        Self {
            kinds,
            current,
            staged: BTreeMap::new(),
            assigned: BTreeMap::new(),
        }
    }

    pub fn kind(&self, register: &str) -> Option<RegisterKind> {
        self.kinds.get(register).copied()
    }

    /// Current-row value. Assignment registers read `None` until assigned.
    pub fn read(&self, register: &str) -> Option<Fr> {
        match self.kind(register)? {
            RegisterKind::Assignment => self.assigned.get(register).copied(),
            _ => self.current.get(register).copied(),
        }
    }

    /// Next-row value, if one was staged.
    pub fn read_next(&self, register: &str) -> Option<Fr> {
        self.staged.get(register).copied()
    }

    pub fn assign(&mut self, register: &str, value: Fr) {
        self.assigned.insert(register.to_string(), value);
    }

    pub fn stage(&mut self, register: &str, value: Fr) {
        self.staged.insert(register.to_string(), value);
    }

    /// Moves to the next row: staged values become current, unstaged
    /// registers keep their value and assignment registers are cleared.
    pub fn advance(&mut self) {
        self.current.append(&mut self.staged);
        self.assigned.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::fe;
    use crate::vm::machine::Machine;

    fn bank() -> RegisterBank {
        let machine = Machine::new("M", 4)
            .register("pc", RegisterKind::Pc)
            .register("X", RegisterKind::Assignment)
            .register("A", RegisterKind::Plain)
            .program(vec![crate::vm::machine::Statement::Return]);
        RegisterBank::new(&LoadedMachine::load(&machine).unwrap())
    }

    #[test]
    fn test_staged_values_appear_after_advance() {
        let mut bank = bank();
        assert_eq!(bank.read("A"), Some(fe(0)));
        bank.stage("A", fe(7));
        assert_eq!(bank.read("A"), Some(fe(0)));
        assert_eq!(bank.read_next("A"), Some(fe(7)));
        bank.advance();
        assert_eq!(bank.read("A"), Some(fe(7)));
        assert_eq!(bank.read_next("A"), None);
    }

    #[test]
    fn test_assignment_registers_are_per_row() {
        let mut bank = bank();
        assert_eq!(bank.read("X"), None);
        bank.assign("X", fe(3));
        assert_eq!(bank.read("X"), Some(fe(3)));
        bank.advance();
        assert_eq!(bank.read("X"), None);
        assert_eq!(bank.read("nope"), None);
    }
}
