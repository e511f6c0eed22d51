//! Declarative configuration for an ensemble.
//!
//! Mirrors the external interface: a named ensemble, two or more `subModel`
//! entries (each paired with a target-evaluation store by name), and optional
//! iteration settings.

use serde::{Deserialize, Serialize};

use crate::error::{EnsembleError, Result};

pub const DEFAULT_MAX_ITERATIONS: u32 = 30;
pub const DEFAULT_TOLERANCE: f64 = 1e-3;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EnsembleConfig {
    /// Unique ensemble name; also the outer scope of every unique handler.
    pub name: String,
    #[serde(rename = "subModel")]
    pub sub_models: Vec<SubModelConfig>,
    #[serde(default)]
    pub settings: EnsembleSettings,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SubModelConfig {
    pub name: String,
    /// Names of the step inputs routed to this sub-model at initialize.
    pub input_names: Vec<String>,
    /// Name of the point-set store that both records this sub-model's
    /// evaluations and declares its input/output variables.
    pub target_evaluation: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EnsembleSettings {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    /// When true, a non-converged sample fails instead of keeping its last
    /// iterate.
    #[serde(default)]
    pub fatal_on_non_convergence: bool,
}

fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}

fn default_tolerance() -> f64 {
    DEFAULT_TOLERANCE
}

impl Default for EnsembleSettings {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            tolerance: DEFAULT_TOLERANCE,
            fatal_on_non_convergence: false,
        }
    }
}

impl EnsembleConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|err| EnsembleError::Configuration(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sub_models.len() < 2 {
            return Err(EnsembleError::Configuration(format!(
                "the ensemble `{}` needs at least 2 sub-models, got {}",
                self.name,
                self.sub_models.len()
            )));
        }
        for (idx, sub) in self.sub_models.iter().enumerate() {
            if sub.target_evaluation.is_empty() {
                return Err(EnsembleError::Configuration(format!(
                    "sub-model `{}` is missing its target evaluation",
                    sub.name
                )));
            }
            if self.sub_models[..idx].iter().any(|other| other.name == sub.name) {
                return Err(EnsembleError::Configuration(format!(
                    "duplicate sub-model name `{}`",
                    sub.name
                )));
            }
        }
        if self.settings.max_iterations == 0 {
            return Err(EnsembleError::Configuration(
                "maxIterations must be a positive integer".to_owned(),
            ));
        }
        if !(self.settings.tolerance > 0.0) {
            return Err(EnsembleError::Configuration(
                "tolerance must be a positive real".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_default_when_omitted() {
        let config = EnsembleConfig::from_json(
            r#"{
                "name": "thermalChain",
                "subModel": [
                    {"name": "conduction", "inputNames": ["mesh"], "targetEvaluation": "conductionData"},
                    {"name": "neutronics", "inputNames": ["mesh"], "targetEvaluation": "neutronicsData"}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(DEFAULT_MAX_ITERATIONS, config.settings.max_iterations);
        assert_eq!(DEFAULT_TOLERANCE, config.settings.tolerance);
        assert!(!config.settings.fatal_on_non_convergence);
    }

    #[test]
    fn rejects_single_sub_model() {
        let err = EnsembleConfig::from_json(
            r#"{
                "name": "solo",
                "subModel": [
                    {"name": "only", "inputNames": [], "targetEvaluation": "onlyData"}
                ]
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, EnsembleError::Configuration(_)));
    }

    #[test]
    fn rejects_duplicate_names_and_bad_settings() {
        let duplicated = EnsembleConfig {
            name: "dup".into(),
            sub_models: vec![
                SubModelConfig {
                    name: "a".into(),
                    input_names: vec![],
                    target_evaluation: "aData".into(),
                },
                SubModelConfig {
                    name: "a".into(),
                    input_names: vec![],
                    target_evaluation: "aData2".into(),
                },
            ],
            settings: EnsembleSettings::default(),
        };
        assert!(duplicated.validate().is_err());

        let mut bad_tol = duplicated.clone();
        bad_tol.sub_models[1].name = "b".into();
        bad_tol.settings.tolerance = 0.0;
        assert!(bad_tol.validate().is_err());
    }
}
