use crate::model::MAX_ABS_POINTS;
use crate::optimizer::BeamSearchConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Parameters of one scoring-sheet fit.
///
/// Every key is optional in the TOML form; missing keys take the defaults below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// Target number of nonzero decision parameters (`k`).
    pub num_decision_params: usize,
    /// Points per decision parameter are bounded to `[-max_points_per_param, max_points_per_param]`.
    pub max_points_per_param: i64,
    /// Optional limit on the number of original attributes the sheet may use.
    pub num_input_features: Option<usize>,
    /// Keep the training projection in the fitted model so that sheets with many decision
    /// parameters can still be enumerated later.
    pub retain_training_projection: bool,
    /// Number of ranked candidates requested from the optimizer.
    pub select_top_m: usize,
    pub optimizer: BeamSearchConfig,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            num_decision_params: 5,
            max_points_per_param: 5,
            num_input_features: None,
            retain_training_projection: true,
            select_top_m: 1,
            optimizer: BeamSearchConfig::default(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read the configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse the configuration TOML: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize the configuration to TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("'{key}' must be at least 1, but {value} was given.")]
    MustBePositive { key: &'static str, value: i64 },
    #[error("'{key}' may be at most {max}, but {value} was given.")]
    TooLarge { key: &'static str, value: i64, max: i64 },
    #[error("'optimizer.polish_tolerance' must be positive and finite, but {0} was given.")]
    InvalidTolerance(f64),
}

impl TrainerConfig {
    /// Reads a configuration from a TOML file and validates it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let counts = [
            ("num_decision_params", self.num_decision_params),
            ("select_top_m", self.select_top_m),
            ("optimizer.beam_width", self.optimizer.beam_width),
            ("optimizer.newton_max_iterations", self.optimizer.newton_max_iterations),
        ];
        for (key, value) in counts {
            if value == 0 {
                return Err(ConfigError::MustBePositive { key, value: 0 });
            }
        }
        if self.max_points_per_param < 1 {
            return Err(ConfigError::MustBePositive {
                key: "max_points_per_param",
                value: self.max_points_per_param,
            });
        }
        if self.max_points_per_param > MAX_ABS_POINTS {
            return Err(ConfigError::TooLarge {
                key: "max_points_per_param",
                value: self.max_points_per_param,
                max: MAX_ABS_POINTS,
            });
        }
        if self.num_input_features == Some(0) {
            return Err(ConfigError::MustBePositive {
                key: "num_input_features",
                value: 0,
            });
        }
        let tolerance = self.optimizer.polish_tolerance;
        if !(tolerance.is_finite() && tolerance > 0.0) {
            return Err(ConfigError::InvalidTolerance(tolerance));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_settings() {
        let config = TrainerConfig::default();
        assert_eq!(config.num_decision_params, 5);
        assert_eq!(config.max_points_per_param, 5);
        assert_eq!(config.num_input_features, None);
        assert!(config.retain_training_projection);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let config: TrainerConfig = toml::from_str(
            "num_decision_params = 3\n\n[optimizer]\nbeam_width = 4\n",
        )
        .unwrap();
        assert_eq!(config.num_decision_params, 3);
        assert_eq!(config.max_points_per_param, 5);
        assert_eq!(config.optimizer.beam_width, 4);
        assert_eq!(
            config.optimizer.refinement_sweeps,
            BeamSearchConfig::default().refinement_sweeps
        );
    }

    #[test]
    fn toml_text_parses_back_to_the_same_config() {
        let config = TrainerConfig {
            num_input_features: Some(2),
            ..TrainerConfig::default()
        };
        let text = config.to_toml().unwrap();
        let parsed: TrainerConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn zero_budgets_are_rejected() {
        let config = TrainerConfig {
            num_decision_params: 0,
            ..TrainerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MustBePositive { key: "num_decision_params", .. })
        ));

        let config = TrainerConfig {
            max_points_per_param: 0,
            ..TrainerConfig::default()
        };
        assert!(config.validate().is_err());

        let config = TrainerConfig {
            num_input_features: Some(0),
            ..TrainerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn point_bound_is_capped() {
        let config = TrainerConfig {
            max_points_per_param: MAX_ABS_POINTS,
            ..TrainerConfig::default()
        };
        assert!(config.validate().is_ok());

        let config = TrainerConfig {
            max_points_per_param: 100_000_000_000,
            ..TrainerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TooLarge {
                key: "max_points_per_param",
                value: 100_000_000_000,
                max: MAX_ABS_POINTS,
            })
        ));
    }
}
