//! Experiment configuration: typed options with explicit defaults.
//!
//! Uses `figment` for layered resolution: typed defaults -> YAML document ->
//! `SEGRUN_`-prefixed environment overrides for a small allow-list of keys.
//! Every option a downstream component consumes has a resolved value before any
//! component runs; unknown keys are rejected.

use crate::error::MlError;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Keys that may be overridden from the environment.
const ENV_OVERRIDES: &[&str] = &["seed", "epochs", "batch_size", "lr", "results_dir"];

/// Policy applied when the experiment output directory already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CollisionPolicy {
    /// Create `<name>-2`, `<name>-3`, ... instead of touching the existing directory.
    #[default]
    VersionSuffix,
    /// Write into the existing directory without clearing it.
    Reuse,
    /// Refuse to run.
    Fail,
}

/// Fully resolved experiment configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExperimentConfig {
    /// Identifier used for the output directory and artifact file names.
    pub experiment_name: String,
    pub seed: u64,
    pub batch_size: usize,
    /// Maximum number of epochs.
    pub epochs: usize,
    /// Stall window shared by early stopping and plateau reduction.
    pub patience: usize,
    pub augmentation: bool,
    /// Maximum rotation in degrees.
    pub rot_range: f64,
    pub zoom_range: f64,
    pub vertical_flip: bool,
    pub loss: Option<String>,
    /// Blend coefficient for `jaccard-xentropy`.
    pub alpha: f64,
    pub optimizer: Option<String>,
    pub lr: f64,
    pub lookahead: bool,
    /// Enables exponential learning-rate decay.
    pub lr_scheduler: bool,
    /// Selects plateau reduction instead of early stopping.
    pub reduce_lr_on_plateau: bool,
    pub class_weights: Option<String>,
    /// Architecture hyperparameters, passed through to the model factory.
    pub model: BTreeMap<String, serde_json::Value>,
    /// Path of the dataset document.
    pub dataset: PathBuf,
    pub results_dir: PathBuf,
    pub on_existing: CollisionPolicy,
    /// Depth of the background batch queue; 0 produces batches inline.
    pub prefetch_batches: usize,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            experiment_name: default_experiment_name(),
            seed: 42,
            batch_size: 8,
            epochs: 1,
            patience: 5,
            augmentation: false,
            rot_range: 0.0,
            zoom_range: 0.0,
            vertical_flip: false,
            loss: None,
            alpha: 0.5,
            optimizer: None,
            lr: 1e-3,
            lookahead: false,
            lr_scheduler: false,
            reduce_lr_on_plateau: false,
            class_weights: None,
            model: BTreeMap::new(),
            dataset: PathBuf::from("data/dataset.json"),
            results_dir: PathBuf::from("results"),
            on_existing: CollisionPolicy::default(),
            prefetch_batches: 4,
        }
    }
}

fn default_experiment_name() -> String {
    "experiment".to_string()
}

impl ExperimentConfig {
    /// Resolve a configuration from a YAML document.
    ///
    /// A missing file, malformed YAML, a mistyped value, an unknown key or an
    /// out-of-range value all yield [`MlError::ConfigLoad`].
    pub fn load(path: &Path) -> Result<Self, MlError> {
        if !path.is_file() {
            return Err(MlError::config_load(format!(
                "config file {} does not exist",
                path.display()
            )));
        }

        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Yaml::file(path))
            .merge(Env::prefixed("SEGRUN_").only(ENV_OVERRIDES))
            .extract()?;
        config.validate()?;
        config.log_resolved();
        Ok(config)
    }

    /// Resolve a configuration from an in-memory YAML string (no environment layer).
    pub fn from_yaml_str(yaml: &str) -> Result<Self, MlError> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Yaml::string(yaml))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), MlError> {
        let name = self.experiment_name.as_str();
        if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
            return Err(MlError::config_load(format!(
                "experiment_name '{name}' must be a non-empty plain directory name"
            )));
        }
        if self.batch_size == 0 {
            return Err(MlError::config_load("batch_size must be at least 1"));
        }
        if self.epochs == 0 {
            return Err(MlError::config_load("epochs must be at least 1"));
        }
        if !self.lr.is_finite() || self.lr <= 0.0 {
            return Err(MlError::config_load(format!(
                "lr must be a positive number, got {}",
                self.lr
            )));
        }
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(MlError::config_load(format!(
                "alpha must lie in [0, 1], got {}",
                self.alpha
            )));
        }
        if !self.rot_range.is_finite() || self.rot_range < 0.0 {
            return Err(MlError::config_load("rot_range must be non-negative"));
        }
        if !(0.0..1.0).contains(&self.zoom_range) {
            return Err(MlError::config_load("zoom_range must lie in [0, 1)"));
        }
        Ok(())
    }

    fn log_resolved(&self) {
        tracing::info!("Configuration:");
        if let Ok(serde_json::Value::Object(map)) = serde_json::to_value(self) {
            for (key, value) in map {
                tracing::info!("  {key}: {value}");
            }
        }
    }
}

/// The per-experiment output directory and the artifact paths inside it.
#[derive(Debug, Clone)]
pub struct ExperimentDir {
    root: PathBuf,
    name: String,
}

impl ExperimentDir {
    /// Create the output directory for `config`, honoring its collision policy.
    pub fn prepare(config: &ExperimentConfig) -> Result<Self, MlError> {
        std::fs::create_dir_all(&config.results_dir)?;
        let name = config.experiment_name.clone();
        let base = config.results_dir.join(&name);

        let root = if !base.exists() {
            base
        } else {
            match config.on_existing {
                CollisionPolicy::Reuse => {
                    tracing::warn!(
                        "Directory {} already exists, reusing without clearing",
                        base.display()
                    );
                    return Ok(Self { root: base, name });
                }
                CollisionPolicy::Fail => {
                    return Err(MlError::AlreadyExists(base.display().to_string()));
                }
                CollisionPolicy::VersionSuffix => (2..)
                    .map(|n| config.results_dir.join(format!("{name}-{n}")))
                    .find(|candidate| !candidate.exists())
                    .ok_or_else(|| MlError::AlreadyExists(base.display().to_string()))?,
            }
        };

        std::fs::create_dir(&root)?;
        tracing::info!("Directory {} created", root.display());
        Ok(Self { root, name })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn architecture_path(&self) -> PathBuf {
        self.root.join(format!("{}.yaml", self.name))
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.root.join(format!("{}-weights.json", self.name))
    }

    pub fn checkpoint_manifest_path(&self) -> PathBuf {
        self.root.join("checkpoints.json")
    }

    pub fn log_path(&self) -> PathBuf {
        self.root.join(format!("{}.log", self.name))
    }

    pub fn predictions_path(&self) -> PathBuf {
        self.root.join(format!("{}-preds.bin", self.name))
    }

    pub fn report_path(&self) -> PathBuf {
        self.root.join("eval.yaml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_omitted_keys_resolve_to_defaults() {
        let config = ExperimentConfig::from_yaml_str("experiment_name: unet-a\n").unwrap();
        let defaults = ExperimentConfig::default();
        assert_eq!(config.experiment_name, "unet-a");
        assert_eq!(config.seed, defaults.seed);
        assert_eq!(config.patience, 5);
        assert!(!config.augmentation);
        assert!(!config.lookahead);
        assert!(!config.lr_scheduler);
        assert!(!config.reduce_lr_on_plateau);
        assert_eq!(config.loss, None);
        assert_eq!(config.class_weights, None);
        assert!(config.model.is_empty());
        assert_eq!(config.on_existing, CollisionPolicy::VersionSuffix);
    }

    #[test]
    fn test_full_document() {
        let yaml = r#"
experiment_name: focal-radam
seed: 7
batch_size: 4
epochs: 30
patience: 3
augmentation: true
rot_range: 15.0
zoom_range: 0.1
vertical_flip: true
loss: jaccard-xentropy
alpha: 0.3
optimizer: radam
lr: 3e-4
lookahead: true
lr_scheduler: true
reduce_lr_on_plateau: true
class_weights: heavy-weighted
model:
  filters: 16
  dropout: 0.2
on_existing: fail
"#;
        let config = ExperimentConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.seed, 7);
        assert_eq!(config.epochs, 30);
        assert_eq!(config.loss.as_deref(), Some("jaccard-xentropy"));
        assert_eq!(config.optimizer.as_deref(), Some("radam"));
        assert!((config.lr - 3e-4).abs() < 1e-12);
        assert!(config.lookahead && config.lr_scheduler && config.reduce_lr_on_plateau);
        assert_eq!(config.model["filters"], serde_json::json!(16));
        assert_eq!(config.on_existing, CollisionPolicy::Fail);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = ExperimentConfig::from_yaml_str("epochz: 3\n").unwrap_err();
        assert!(matches!(err, MlError::ConfigLoad(_)));
    }

    #[test]
    fn test_invalid_values_rejected() {
        for yaml in [
            "batch_size: 0\n",
            "epochs: 0\n",
            "lr: -1.0\n",
            "alpha: 1.5\n",
            "zoom_range: 1.0\n",
            "experiment_name: ../escape\n",
        ] {
            let err = ExperimentConfig::from_yaml_str(yaml).unwrap_err();
            assert!(matches!(err, MlError::ConfigLoad(_)), "{yaml}");
        }
    }

    #[test]
    fn test_missing_file_is_config_load_error() {
        let dir = TempDir::new().unwrap();
        let err = ExperimentConfig::load(&dir.path().join("absent.yaml")).unwrap_err();
        assert!(matches!(err, MlError::ConfigLoad(_)));
    }

    #[test]
    fn test_malformed_file_is_config_load_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.yaml");
        std::fs::write(&path, "epochs: [1, 2\nloss: {").unwrap();
        let err = ExperimentConfig::load(&path).unwrap_err();
        assert!(matches!(err, MlError::ConfigLoad(_)));
    }

    fn config_in(dir: &TempDir, policy: CollisionPolicy) -> ExperimentConfig {
        ExperimentConfig {
            experiment_name: "run".into(),
            results_dir: dir.path().join("results"),
            on_existing: policy,
            ..Default::default()
        }
    }

    #[test]
    fn test_prepare_version_suffix() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir, CollisionPolicy::VersionSuffix);
        let first = ExperimentDir::prepare(&config).unwrap();
        let second = ExperimentDir::prepare(&config).unwrap();
        assert_eq!(first.root(), dir.path().join("results").join("run"));
        assert_eq!(second.root(), dir.path().join("results").join("run-2"));
        assert!(second.log_path().ends_with("run-2/run.log"));
    }

    #[test]
    fn test_prepare_reuse_keeps_contents() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir, CollisionPolicy::Reuse);
        let first = ExperimentDir::prepare(&config).unwrap();
        std::fs::write(first.log_path(), "stale").unwrap();
        let second = ExperimentDir::prepare(&config).unwrap();
        assert_eq!(first.root(), second.root());
        assert_eq!(std::fs::read_to_string(second.log_path()).unwrap(), "stale");
    }

    #[test]
    fn test_prepare_fail_policy() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir, CollisionPolicy::Fail);
        ExperimentDir::prepare(&config).unwrap();
        let err = ExperimentDir::prepare(&config).unwrap_err();
        assert!(matches!(err, MlError::AlreadyExists(_)));
    }
}
