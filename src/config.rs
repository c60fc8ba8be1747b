//! Engine configuration.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Knobs for a run. Missing JSON fields take their default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Run the verification passes on the rayon thread pool.
    pub parallel: bool,
    /// Keep at most this many violations in the report.
    pub violation_limit: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallel: true,
            violation_limit: None,
        }
    }
}

impl EngineConfig {
    /// Single-threaded verification.
    pub fn sequential() -> Self {
        Self {
            parallel: false,
            ..Self::default()
        }
    }

    pub fn with_violation_limit(mut self, limit: usize) -> Self {
        self.violation_limit = Some(limit);
        self
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_presets() {
        assert!(EngineConfig::default().parallel);
        assert!(!EngineConfig::sequential().parallel);
        assert_eq!(EngineConfig::sequential().with_violation_limit(3).violation_limit, Some(3));
    }

    #[test]
    fn test_config_from_json() {
        let config = EngineConfig::from_json(r#"{ "violation_limit": 10 }"#).unwrap();
        assert_eq!(
            config,
            EngineConfig {
                parallel: true,
                violation_limit: Some(10),
            }
        );
        assert!(EngineConfig::from_json("{ \"parallel\": 1 }").is_err());
    }
}
