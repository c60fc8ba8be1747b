//! The query hook through which witness values enter from outside.

use crate::field::{Fr, to_usize};

/// Answers `query(kind, args)` requests made while filling witness cells.
pub trait QueryCallback: Send + Sync {
    /// Returns `None` when the query has no answer.
    fn resolve(&self, kind: &str, args: &[Fr]) -> Option<Fr>;
}

impl<F> QueryCallback for F
where
    F: Fn(&str, &[Fr]) -> Option<Fr> + Send + Sync,
{
    fn resolve(&self, kind: &str, args: &[Fr]) -> Option<Fr> {
        self(kind, args)
    }
}

/// Answers nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoQueries;

impl QueryCallback for NoQueries {
    fn resolve(&self, _kind: &str, _args: &[Fr]) -> Option<Fr> {
        None
    }
}

/// Answers `input(i)` with the `i`-th public input.
#[derive(Debug, Clone, Default)]
pub struct InputQueries {
    inputs: Vec<Fr>,
}

impl InputQueries {
    pub fn new(inputs: Vec<Fr>) -> Self {
        Self { inputs }
    }
}

impl QueryCallback for InputQueries {
    fn resolve(&self, kind: &str, args: &[Fr]) -> Option<Fr> {
        match (kind, args) {
            ("input", [index]) => self.inputs.get(to_usize(index)?).copied(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::fe;

    #[test]
    fn test_input_queries() {
        let queries = InputQueries::new(vec![fe(10), fe(20)]);
        assert_eq!(queries.resolve("input", &[fe(1)]), Some(fe(20)));
        assert_eq!(queries.resolve("input", &[fe(2)]), None);
        assert_eq!(queries.resolve("hint", &[fe(0)]), None);
        assert_eq!(queries.resolve("input", &[fe(-1)]), None);
    }

    #[test]
    fn test_closures_answer_queries() {
        let double = |kind: &str, args: &[Fr]| (kind == "double").then(|| args[0] + args[0]);
        assert_eq!(double.resolve("double", &[fe(4)]), Some(fe(8)));
        assert_eq!(NoQueries.resolve("double", &[fe(4)]), None);
    }
}
