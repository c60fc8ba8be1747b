#[cfg(test)]
mod tests {
    use zkmachine::vm::expr::Expr;
    use zkmachine::vm::machine::{
        Identity, InstructionDef, Machine, OperationDef, Operand, Param, RegisterKind, Statement, WitnessSource,
    };
    use zkmachine::{Engine, MachineError, fe};

    fn vm() -> Machine {
        Machine::new("Main", 8)
            .register("pc", RegisterKind::Pc)
            .register("X", RegisterKind::Assignment)
            .register("A", RegisterKind::Plain)
    }

    #[test]
    fn test_duplicate_column() {
        let machine = Machine::new("M", 4)
            .witness("x", WitnessSource::Free)
            .witness("x", WitnessSource::Free);
        assert!(matches!(Engine::new(&machine), Err(MachineError::DuplicateColumn { .. })));
    }

    #[test]
    fn test_write_to_assignment_register() {
        let machine = vm().program(vec![Statement::assign("X", "X", Operand::value(1)), Statement::Return]);
        assert!(matches!(Engine::new(&machine), Err(MachineError::InvalidRegister { .. })));
    }

    #[test]
    fn test_duplicate_label() {
        let machine = vm().program(vec![Statement::label("a"), Statement::label("a"), Statement::Return]);
        assert!(matches!(Engine::new(&machine), Err(MachineError::DuplicateLabel { .. })));
    }

    #[test]
    fn test_program_longer_than_degree() {
        let machine = vm().program(vec![Statement::assign("A", "X", Operand::value(1)); 9]);
        assert!(matches!(Engine::new(&machine), Err(MachineError::RowLimitExceeded { degree: 8, .. })));
    }

    #[test]
    fn test_link_into_unknown_instance() {
        let machine = vm()
            .register("Y", RegisterKind::Assignment)
            .instruction(InstructionDef::new("sq", vec![Param::Reg("X".into())], vec!["Y"]).link("nope", "square"))
            .program(vec![Statement::Return]);
        assert!(matches!(Engine::new(&machine), Err(MachineError::UnknownSubmachine { .. })));
    }

    #[test]
    fn test_link_arity_mismatch() {
        let callee = Machine::new("Sq", 4)
            .witness("x", WitnessSource::Free)
            .witness("y", WitnessSource::Free)
            .operation(OperationDef::new("square", 0, vec!["x"], vec!["y"]));
        let machine = vm()
            .submachine("sq", callee)
            .instruction(InstructionDef::new("sq", vec![Param::Reg("X".into())], vec![]).link("sq", "square"))
            .program(vec![Statement::Return]);
        assert!(matches!(
            Engine::new(&machine),
            Err(MachineError::ArityMismatch { expected: 1, found: 0, .. })
        ));
    }

    #[test]
    fn test_operations_need_an_id_column() {
        let machine = Machine::new("M", 4)
            .witness("x", WitnessSource::Free)
            .operation(OperationDef::new("a", 0, vec!["x"], vec![]))
            .operation(OperationDef::new("b", 1, vec!["x"], vec![]));
        assert!(matches!(Engine::new(&machine), Err(MachineError::InvalidOperations { .. })));
    }

    #[test]
    fn test_instruction_body_next_reference() {
        let machine = vm()
            .instruction(
                InstructionDef::new("bad", vec![Param::Reg("X".into())], vec![])
                    .constraints(vec![Identity::new("peek", Expr::next("A"), Expr::col("X"))]),
            )
            .program(vec![Statement::Return]);
        assert!(matches!(Engine::new(&machine), Err(MachineError::MalformedIdentity { .. })));
    }

    #[test]
    fn test_machine_from_json_runs() {
        let json = r#"{
            "name": "Main",
            "degree": 4,
            "columns": [
                { "name": "ROW", "kind": { "fixed": { "expr": "row_index" } } },
                { "name": "sq", "kind": { "witness": { "defined": { "mul": [{ "col": "ROW" }, { "col": "ROW" }] } } } },
                { "name": "acc", "kind": { "witness": "free" } }
            ],
            "identities": [
                { "name": "acc_start", "lhs": { "col": "acc" }, "rhs": { "const": "0" }, "scope": "first_row" },
                { "name": "acc_step", "lhs": { "next": "acc" }, "rhs": { "add": [{ "col": "acc" }, { "col": "sq" }] } }
            ]
        }"#;
        let machine = Machine::from_json(json).unwrap();
        let output = Engine::new(&machine).unwrap().run().unwrap();
        assert!(output.report.is_empty(), "{}", output.report);
        // 0, 0, 0 + 1, 1 + 4
        assert_eq!(output.trace("Main").unwrap().value("acc", 3).unwrap(), fe(5));
    }
}
