//! Run configuration.
//!
//! `FixConfig` holds the denoising options (highpass cutoff, training file,
//! thresholds, dummy-volume policy). It is read from a YAML or JSON file and
//! every field has a default, so an empty file is a valid configuration.
//!
//! `ToolPaths` locates the external executables and is populated from the
//! environment the same way the FSL/HCP containers expose them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;

/// Marker value of `training_file` that requires a custom training file.
pub const USER_DEFINED_TRAINING: &str = "User Defined";

/// Options controlling the ICA-FIX stages for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FixConfig {
    /// Highpass filter cutoff in seconds; also names the ICA directory (`_hp<cutoff>.ica`).
    pub highpass: u32,
    /// Whether motion parameters are regressed out during cleanup.
    pub motion_regression: bool,
    /// Name of the built-in training file, or `"User Defined"`.
    pub training_file: String,
    /// Directory holding the built-in training files.
    pub training_dir: PathBuf,
    /// Custom training file; requires `training_file == "User Defined"`.
    pub custom_training_file: Option<PathBuf>,
    /// FIX classification threshold.
    pub fix_threshold: u32,
    /// Whether hcp_fix removes its intermediate files.
    pub delete_intermediates: bool,
    /// Whether leading non-steady-state frames are removed before ICA.
    pub drop_non_steady_state: bool,
    /// Fixed dummy-frame count applied to every run.
    pub dummy_volumes: Option<usize>,
    /// Dummy-frame counts keyed by BIDS acquisition name (e.g. `task-rest_acq-AP`).
    pub acquisition_dummy_volumes: BTreeMap<String, usize>,
    /// Treat the word "error" in a tool's stderr as a failure.
    pub scan_stderr_for_errors: bool,
    /// Log commands without executing anything.
    pub dry_run: bool,
}

impl Default for FixConfig {
    fn default() -> Self {
        Self {
            highpass: 2000,
            motion_regression: false,
            training_file: "HCP_hp2000.RData".to_string(),
            training_dir: PathBuf::from("/opt/fix/training_files"),
            custom_training_file: None,
            fix_threshold: 10,
            delete_intermediates: false,
            drop_non_steady_state: true,
            dummy_volumes: None,
            acquisition_dummy_volumes: BTreeMap::new(),
            scan_stderr_for_errors: true,
            dry_run: false,
        }
    }
}

impl FixConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a configuration file; the format follows the extension
    /// (`.yaml`/`.yml` or `.json`).
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let config: Self = match ext.as_str() {
            "yaml" | "yml" => serde_yaml::from_str(&content)?,
            "json" => serde_json::from_str(&content)?,
            other => return Err(ConfigError::UnsupportedFormat(other.to_string())),
        };
        info!("Loaded configuration from {}", path.display());
        config.validate()?;
        Ok(config)
    }

    /// Sets the custom training file.
    pub fn with_custom_training_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.custom_training_file = Some(path.into());
        self
    }

    /// Sets a fixed dummy-frame count.
    pub fn with_dummy_volumes(mut self, count: usize) -> Self {
        self.dummy_volumes = Some(count);
        self
    }

    /// Enables or disables dry-run mode.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.highpass == 0 {
            return Err(ConfigError::ValidationFailed(
                "highpass must be greater than 0".to_string(),
            ));
        }

        if !(1..=100).contains(&self.fix_threshold) {
            return Err(ConfigError::InvalidValue {
                key: "fix_threshold".to_string(),
                message: format!("{} is outside 1..=100", self.fix_threshold),
            });
        }

        if self.training_file.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "training_file cannot be empty".to_string(),
            ));
        }

        let user_defined = self.training_file == USER_DEFINED_TRAINING;
        match (&self.custom_training_file, user_defined) {
            (Some(_), false) => Err(ConfigError::CustomTrainingMismatch {
                configured: self.training_file.clone(),
            }),
            (None, true) => Err(ConfigError::ValidationFailed(
                "training_file is 'User Defined' but no custom training file was given"
                    .to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Full path of the training file handed to FIX.
    pub fn training_file_path(&self) -> PathBuf {
        match &self.custom_training_file {
            Some(path) => path.clone(),
            None => self.training_dir.join(&self.training_file),
        }
    }

    /// Training configuration name used to key metadata (file name up to the first `.`).
    pub fn training_name(&self) -> String {
        let file_name = self
            .training_file_path()
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.training_file.clone());
        file_name
            .split('.')
            .next()
            .unwrap_or_default()
            .to_string()
    }

    /// Stem of the training file, used to tag cleaned outputs.
    pub fn training_stem(&self) -> String {
        self.training_file_path()
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| self.training_name())
    }

    /// Suffix inserted into highpass-filtered file names, e.g. `_hp2000`.
    pub fn highpass_tag(&self) -> String {
        format!("_hp{}", self.highpass)
    }

    /// Number of dummy frames to drop for one acquisition.
    ///
    /// Disabled dropping yields 0; a fixed count wins over the per-acquisition
    /// map; no value at all is a configuration error.
    pub fn dummy_frames_for(&self, acquisition: Option<&str>) -> Result<usize, ConfigError> {
        if !self.drop_non_steady_state {
            return Ok(0);
        }
        if let Some(count) = self.dummy_volumes {
            info!("Set by user....Using {} dummy volumes", count);
            return Ok(count);
        }
        let acquisition = acquisition.unwrap_or_default();
        match self.acquisition_dummy_volumes.get(acquisition) {
            Some(count) => {
                info!(
                    "Using {} dummy volumes for acquisition {}",
                    count, acquisition
                );
                Ok(*count)
            }
            None => Err(ConfigError::MissingDummyVolumes {
                acquisition: acquisition.to_string(),
            }),
        }
    }
}

/// Locations of the external executables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolPaths {
    /// `hcp_fix` wrapper (full pipeline).
    pub hcp_fix: PathBuf,
    /// `fix` executable (classification and cleanup).
    pub fix: PathBuf,
    /// FSL `bin` directory containing `fslroi`, `fslmerge` and `fslnvols`.
    pub fsl_bin: PathBuf,
    /// Connectome Workbench `wb_command`.
    pub wb_command: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            hcp_fix: PathBuf::from("/opt/HCP-Pipelines/ICAFIX/hcp_fix"),
            fix: PathBuf::from("/opt/fix/fix"),
            fsl_bin: PathBuf::from("/usr/local/fsl/bin"),
            wb_command: PathBuf::from("wb_command"),
        }
    }
}

impl ToolPaths {
    /// Creates tool paths from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `HCP_FIX`: path to hcp_fix
    /// - `FIX_BIN`: path to fix
    /// - `FSLDIR`: FSL installation root (`$FSLDIR/bin` is used)
    /// - `FSL_FIX_WBC`: path to wb_command
    pub fn from_env() -> Self {
        let mut paths = Self::default();

        if let Ok(val) = std::env::var("HCP_FIX") {
            paths.hcp_fix = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("FIX_BIN") {
            paths.fix = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("FSLDIR") {
            paths.fsl_bin = PathBuf::from(val).join("bin");
        }

        if let Ok(val) = std::env::var("FSL_FIX_WBC") {
            paths.wb_command = PathBuf::from(val);
        }

        paths
    }

    /// Path of an FSL utility.
    pub fn fsl(&self, tool: &str) -> PathBuf {
        self.fsl_bin.join(tool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = FixConfig::new();
        config.validate().unwrap();
        assert_eq!(config.highpass_tag(), "_hp2000");
        assert_eq!(config.training_name(), "HCP_hp2000");
        assert_eq!(
            config.training_file_path(),
            PathBuf::from("/opt/fix/training_files/HCP_hp2000.RData")
        );
    }

    #[test]
    fn test_custom_training_requires_user_defined() {
        let config = FixConfig::new().with_custom_training_file("/data/mine.RData");
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::CustomTrainingMismatch { .. }));

        let mut config = FixConfig::new().with_custom_training_file("/data/mine.RData");
        config.training_file = USER_DEFINED_TRAINING.to_string();
        config.validate().unwrap();
        assert_eq!(config.training_stem(), "mine");
        assert_eq!(config.training_name(), "mine");
    }

    #[test]
    fn test_user_defined_without_file_is_invalid() {
        let mut config = FixConfig::new();
        config.training_file = USER_DEFINED_TRAINING.to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_dummy_frame_resolution() {
        let mut config = FixConfig::new();
        assert!(config.dummy_frames_for(Some("task-rest")).is_err());

        config
            .acquisition_dummy_volumes
            .insert("task-rest".to_string(), 4);
        assert_eq!(config.dummy_frames_for(Some("task-rest")).unwrap(), 4);

        let config = config.with_dummy_volumes(2);
        assert_eq!(config.dummy_frames_for(Some("task-rest")).unwrap(), 2);

        let mut config = config;
        config.drop_non_steady_state = false;
        assert_eq!(config.dummy_frames_for(None).unwrap(), 0);
    }

    #[test]
    fn test_load_yaml_and_json() {
        let temp = TempDir::new().unwrap();
        let yaml = temp.path().join("fix.yaml");
        std::fs::write(&yaml, "highpass: 100\nmotion_regression: true\n").unwrap();
        let config = FixConfig::from_path(&yaml).unwrap();
        assert_eq!(config.highpass, 100);
        assert!(config.motion_regression);
        assert_eq!(config.fix_threshold, 10);

        let json = temp.path().join("fix.json");
        std::fs::write(&json, r#"{"fix_threshold": 20, "dummy_volumes": 3}"#).unwrap();
        let config = FixConfig::from_path(&json).unwrap();
        assert_eq!(config.fix_threshold, 20);
        assert_eq!(config.dummy_volumes, Some(3));

        let toml = temp.path().join("fix.toml");
        std::fs::write(&toml, "").unwrap();
        assert!(matches!(
            FixConfig::from_path(&toml),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }
}
