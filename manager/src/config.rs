use crate::staging::DEFAULT_STAGE_MARKER;
use crate::worker::StagingPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("campaign config failed validation")]
    Invalid,
    #[error("failed to parse campaign config")]
    Parse(#[from] serde_yaml::Error),
    #[error("failed to read campaign config")]
    Io(#[from] std::io::Error),
}

/// Bounds that end a run. At least one must be set or the campaign would
/// only stop once allocation runs dry.
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct ExitCriteria {
    /// stop once this many rows have results
    #[serde(default)]
    pub sim_max: Option<usize>,
    /// stop once this many generator invocations were issued
    #[serde(default)]
    pub gen_max: Option<usize>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct CampaignConfig {
    #[serde(default = "default_workers")]
    pub workers: u32,

    /// seed for the per worker random streams
    #[serde(default)]
    pub seed: u64,

    // Working directory layout for dispatched items. Without an ensemble
    // dir workers run in place and stage nothing.
    #[serde(default)]
    pub ensemble_dir: Option<PathBuf>,
    #[serde(default)]
    pub sim_input_dir: Option<PathBuf>,
    #[serde(default)]
    pub copy_back_dir: Option<PathBuf>,
    #[serde(default = "default_stage_marker")]
    pub stage_marker: String,

    /// result field driving the nearest better bookkeeping
    #[serde(default = "default_objective")]
    pub objective: String,

    #[serde(alias = "exit", default)]
    pub exit_criteria: ExitCriteria,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            seed: 0,
            ensemble_dir: None,
            sim_input_dir: None,
            copy_back_dir: None,
            stage_marker: default_stage_marker(),
            objective: default_objective(),
            exit_criteria: ExitCriteria::default(),
        }
    }
}

impl CampaignConfig {
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_yaml(&std::fs::read_to_string(path)?)
    }

    /// Validate the whole config in one pass, logging every problem found
    /// instead of bailing at the first one. Returns whether anything was
    /// wrong.
    pub fn preflight_checks(&mut self) -> bool {
        let mut contains_error = false;

        if self.workers == 0 {
            error!("workers cannot be 0, there would be nobody to give work to");
            contains_error = true;
        }

        if self.exit_criteria.sim_max.is_none() && self.exit_criteria.gen_max.is_none() {
            error!("exit criteria must bound the run with sim_max or gen_max");
            contains_error = true;
        }

        if self.stage_marker.is_empty() {
            error!("stage_marker cannot be empty");
            contains_error = true;
        }

        if let Some(input_dir) = &self.sim_input_dir {
            if !input_dir.is_dir() {
                error!(
                    "sim_input_dir {} is not a directory",
                    input_dir.to_string_lossy()
                );
                contains_error = true;
            }
            if self.ensemble_dir.is_none() {
                warn!("sim_input_dir has no effect without an ensemble_dir");
            }
        }
        if self.copy_back_dir.is_some() && self.ensemble_dir.is_none() {
            warn!("copy_back_dir has no effect without an ensemble_dir");
        }

        contains_error
    }

    /// The staging behavior workers derive from this config.
    pub fn staging_policy(&self) -> StagingPolicy {
        StagingPolicy {
            ensemble_dir: self.ensemble_dir.clone(),
            input_dir: self.sim_input_dir.clone(),
            copy_back_dir: self.copy_back_dir.clone(),
            marker: self.stage_marker.clone(),
        }
    }
}

fn default_workers() -> u32 {
    num_cpus::get().saturating_sub(1).max(1) as u32
}

fn default_stage_marker() -> String {
    DEFAULT_STAGE_MARKER.to_owned()
}

fn default_objective() -> String {
    "f".to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_yaml_fills_in_defaults() {
        let config = CampaignConfig::from_yaml("exit:\n  sim_max: 100\n").unwrap();
        assert_eq!(config.exit_criteria.sim_max, Some(100));
        assert_eq!(config.objective, "f");
        assert_eq!(config.stage_marker, DEFAULT_STAGE_MARKER);
        assert!(config.workers >= 1);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(matches!(
            CampaignConfig::from_yaml("exit:\n  sim_max: 1\nworker_count: 3\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn preflight_catches_unbounded_runs() {
        let mut config = CampaignConfig::default();
        assert!(config.preflight_checks());

        config.exit_criteria.gen_max = Some(5);
        assert!(!config.preflight_checks());
    }

    #[test]
    fn preflight_catches_zero_workers() {
        let mut config = CampaignConfig {
            workers: 0,
            exit_criteria: ExitCriteria { sim_max: Some(1), gen_max: None },
            ..CampaignConfig::default()
        };
        assert!(config.preflight_checks());
    }

    #[test]
    fn preflight_catches_missing_input_dir() {
        let mut config = CampaignConfig {
            sim_input_dir: Some(PathBuf::from("/definitely/not/here")),
            ensemble_dir: Some(PathBuf::from("ensemble")),
            exit_criteria: ExitCriteria { sim_max: Some(1), gen_max: None },
            ..CampaignConfig::default()
        };
        assert!(config.preflight_checks());
    }
}
