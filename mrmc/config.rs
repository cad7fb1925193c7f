//! TOML-backed settings for analyses and trial sizing.

use std::fs;
use std::io::{BufWriter, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::design::SplitPlotDesign;
use crate::study::{ExperimentSize, StudyError};
use crate::types::Estimator;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to serialize config to TOML format: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<StudyError> for ConfigError {
    fn from(err: StudyError) -> Self {
        ConfigError::Invalid(err.to_string())
    }
}

fn check_alpha(alpha: f64) -> Result<(), ConfigError> {
    if alpha > 0.0 && alpha < 1.0 {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "alpha must lie strictly between 0 and 1, but it is {alpha}."
        )))
    }
}

fn check_effect(effect_size: Option<f64>) -> Result<(), ConfigError> {
    match effect_size {
        Some(effect) if !effect.is_finite() => Err(ConfigError::Invalid(format!(
            "effect_size must be finite, but it is {effect}."
        ))),
        _ => Ok(()),
    }
}

fn save_toml<T: Serialize>(value: &T, path: &str) -> Result<(), ConfigError> {
    let toml_string = toml::to_string_pretty(value)?;
    let mut file = BufWriter::new(fs::File::create(path)?);
    file.write_all(toml_string.as_bytes())?;
    Ok(())
}

fn load_toml<T: DeserializeOwned>(path: &str) -> Result<T, ConfigError> {
    let toml_string = fs::read_to_string(path)?;
    Ok(toml::from_str(&toml_string)?)
}

/// Settings of one analysis.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub alpha: f64,
    pub estimator: Estimator,
    /// When set, power at the analysed size is reported for this effect.
    pub effect_size: Option<f64>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            alpha: 0.05,
            estimator: Estimator::Unbiased,
            effect_size: None,
        }
    }
}

impl AnalysisConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_alpha(self.alpha)?;
        check_effect(self.effect_size)
    }

    pub fn save(&self, path: &str) -> Result<(), ConfigError> {
        save_toml(self, path)
    }

    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let config: Self = load_toml(path)?;
        config.validate()?;
        Ok(config)
    }
}

/// Planned study for sizing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SizingConfig {
    pub readers: usize,
    pub normals: usize,
    pub diseases: usize,
    pub split_plots: usize,
    pub paired_readers: bool,
    pub paired_normals: bool,
    pub paired_diseases: bool,
    pub effect_size: f64,
    pub alpha: f64,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            readers: 5,
            normals: 50,
            diseases: 50,
            split_plots: 1,
            paired_readers: true,
            paired_normals: true,
            paired_diseases: true,
            effect_size: 0.05,
            alpha: 0.05,
        }
    }
}

impl SizingConfig {
    pub fn size(&self) -> Result<ExperimentSize, ConfigError> {
        Ok(ExperimentSize::new(self.readers, self.normals, self.diseases)?)
    }

    pub fn design(&self) -> Result<SplitPlotDesign, ConfigError> {
        Ok(SplitPlotDesign {
            size: self.size()?,
            split_plots: self.split_plots,
            paired_readers: self.paired_readers,
            paired_normals: self.paired_normals,
            paired_diseases: self.paired_diseases,
        })
    }

    /// Same layout with another size.
    pub fn resized(&self, readers: usize, normals: usize, diseases: usize) -> Self {
        Self {
            readers,
            normals,
            diseases,
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.size()?;
        if self.split_plots == 0 {
            return Err(ConfigError::Invalid(
                "split_plots must be at least 1.".to_string(),
            ));
        }
        check_alpha(self.alpha)?;
        check_effect(Some(self.effect_size))
    }

    pub fn save(&self, path: &str) -> Result<(), ConfigError> {
        save_toml(self, path)
    }

    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let config: Self = load_toml(path)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_analysis_config_round_trips_through_toml() {
        let config = AnalysisConfig {
            alpha: 0.01,
            estimator: Estimator::Biased,
            effect_size: Some(0.07),
        };
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();
        config.save(path).unwrap();
        assert_eq!(AnalysisConfig::load(path).unwrap(), config);
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let config: SizingConfig = toml::from_str("readers = 8\nsplit_plots = 2\n").unwrap();
        assert_eq!(config.readers, 8);
        assert_eq!(config.split_plots, 2);
        assert_eq!(config.normals, 50);
        assert!(config.paired_readers);
        assert_eq!(config.alpha, 0.05);

        let analysis: AnalysisConfig = toml::from_str("estimator = \"biased\"").unwrap();
        assert_eq!(analysis.estimator, Estimator::Biased);
        assert_eq!(analysis.alpha, 0.05);
    }

    #[test]
    fn test_load_rejects_invalid_alpha() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();
        fs::write(path, "alpha = 1.5\n").unwrap();
        assert!(matches!(
            AnalysisConfig::load(path),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_sizing_validation() {
        let zero_readers = SizingConfig {
            readers: 0,
            ..SizingConfig::default()
        };
        assert!(matches!(
            zero_readers.validate(),
            Err(ConfigError::Invalid(_))
        ));

        let no_plots = SizingConfig {
            split_plots: 0,
            ..SizingConfig::default()
        };
        assert!(no_plots.validate().is_err());

        let design = SizingConfig::default().design().unwrap();
        assert!(design.is_fully_crossed());
    }

    #[test]
    fn test_parse_error_is_reported() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();
        fs::write(path, "alpha = \"high\"\n").unwrap();
        assert!(matches!(
            SizingConfig::load(path),
            Err(ConfigError::Parse(_))
        ));
    }
}
