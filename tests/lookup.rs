#[cfg(test)]
mod tests {
    use zkmachine::vm::expr::Expr;
    use zkmachine::vm::machine::{FixedValues, LookupDef, LookupSide, Machine, WitnessSource};
    use zkmachine::{Engine, EngineConfig, Fr, Violation, fe};

    const HINTS: [i64; 8] = [1, 5, 2, 6, 4, 2, 6, 3];

    fn hints(kind: &str, args: &[Fr]) -> Option<Fr> {
        if kind != "hint" {
            return None;
        }
        let row = (0..HINTS.len()).find(|row| fe(*row as i64) == args[0])?;
        Some(fe(HINTS[row]))
    }

    /// `y = x + 1`, enforced only through the increment table.
    fn increments(selector: Expr) -> Machine {
        Machine::new("Main", 8)
            .fixed("INC_X", FixedValues::literal(1..=8))
            .fixed("INC_Y", FixedValues::literal(2..=9))
            .fixed("SEL", FixedValues::literal([1, 1, 0, 1, 1, 1, 1, 1]))
            .witness(
                "x",
                WitnessSource::Query {
                    kind: "hint".to_string(),
                    args: vec![Expr::RowIndex],
                },
            )
            .witness("y", WitnessSource::Free)
            .lookup(LookupDef::new(
                "inc",
                LookupSide::new(selector, vec![Expr::col("x"), Expr::col("y")]),
                LookupSide::columns(&["INC_X", "INC_Y"]),
            ))
    }

    #[test]
    fn test_lookup_solves_witness() {
        let output = Engine::new(&increments(Expr::one())).unwrap().with_query(hints).run().unwrap();
        assert!(output.report.is_empty(), "{}", output.report);
        let y: Vec<Fr> = HINTS.iter().map(|x| fe(x + 1)).collect();
        assert_eq!(output.trace("Main").unwrap().column("y").unwrap(), y.as_slice());
    }

    #[test]
    fn test_lookup_miss_on_seeded_cell() {
        let engine = Engine::new(&increments(Expr::one()))
            .unwrap()
            .with_config(EngineConfig::sequential())
            .with_query(hints)
            .with_seed("Main", "y", 2, fe(7));
        let output = engine.run().unwrap();
        assert_eq!(
            output.report.violations,
            vec![Violation::LookupMiss {
                machine: "Main".to_string(),
                lookup: "inc".to_string(),
                row: 2,
                tuple: vec!["2".to_string(), "7".to_string()],
            }]
        );
        assert_eq!(output.report.lookup_misses().count(), 1);
    }

    #[test]
    fn test_unselected_row_is_not_looked_up() {
        let engine = Engine::new(&increments(Expr::col("SEL")))
            .unwrap()
            .with_query(hints)
            .with_seed("Main", "y", 2, fe(7));
        let output = engine.run().unwrap();
        assert!(output.report.is_empty(), "{}", output.report);
        let trace = output.trace("Main").unwrap();
        assert_eq!(trace.value("y", 2).unwrap(), fe(7));
        assert_eq!(trace.value("y", 3).unwrap(), fe(7));
    }

    #[test]
    fn test_report_limit_and_json() {
        let engine = Engine::new(&increments(Expr::one()))
            .unwrap()
            .with_config(EngineConfig::from_json(r#"{ "parallel": false, "violation_limit": 1 }"#).unwrap())
            .with_query(hints)
            .with_seed("Main", "y", 0, fe(0))
            .with_seed("Main", "y", 1, fe(0));
        let report = engine.run().unwrap().report;
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.truncated, 1);

        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["violations"][0]["kind"], "lookup_miss");
        assert_eq!(json["violations"][0]["row"], 0);
        assert_eq!(json["truncated"], 1);
    }
}
