use std::{
    error::Error,
    fmt, fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    data::{CsvDataset, DatasetProvider, SyntheticBlobs},
    orchestra::{Resources, StrategyConfig},
};

/// Errors raised while loading or validating a `SimulationConfig`.
#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, source: io::Error },
    Parse(serde_json::Error),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "cannot read '{}': {source}", path.display()),
            Self::Parse(e) => write!(f, "invalid JSON: {e}"),
            Self::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse(e) => Some(e),
            Self::Invalid(_) => None,
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse(e)
    }
}

/// What every participant evaluates the global model on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluateOn {
    /// Its own partition.
    #[default]
    Local,
    /// The shared held-out test set.
    Test,
}

/// Where the samples come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DatasetConfig {
    Synthetic {
        #[serde(default = "default_feature_dim")]
        feature_dim: usize,
        #[serde(default = "default_train_per_class")]
        train_per_class: usize,
        #[serde(default = "default_test_per_class")]
        test_per_class: usize,
        #[serde(default = "default_spread")]
        spread: f32,
    },
    Csv {
        train: PathBuf,
        test: PathBuf,
    },
}

fn default_feature_dim() -> usize {
    16
}

fn default_train_per_class() -> usize {
    500
}

fn default_test_per_class() -> usize {
    100
}

fn default_spread() -> f32 {
    1.0
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self::Synthetic {
            feature_dim: default_feature_dim(),
            train_per_class: default_train_per_class(),
            test_per_class: default_test_per_class(),
            spread: default_spread(),
        }
    }
}

/// Everything needed to run a federated simulation end to end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub num_clients: usize,
    pub num_classes: usize,
    pub shards_per_label: usize,
    pub strategy: StrategyConfig,
    pub local_epochs: usize,
    /// Requested by every participant task.
    pub client_resources: Resources,
    /// The simulation's compute pool, the host's parallelism if absent.
    pub capacity: Option<Resources>,
    pub batch_size: usize,
    pub lr: f32,
    pub momentum: f32,
    pub seed: u64,
    pub evaluate_on: EvaluateOn,
    pub dataset: DatasetConfig,
    /// Seconds a phase waits for stragglers, unbounded if absent.
    pub round_timeout_secs: Option<f64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            num_clients: 10,
            num_classes: 10,
            shards_per_label: 2,
            strategy: StrategyConfig::default(),
            local_epochs: 1,
            client_resources: Resources::cpus(2.0),
            capacity: None,
            batch_size: 32,
            lr: 0.001,
            momentum: 0.9,
            seed: 42,
            evaluate_on: EvaluateOn::default(),
            dataset: DatasetConfig::default(),
            round_timeout_secs: None,
        }
    }
}

impl SimulationConfig {
    /// Loads and validates a `SimulationConfig` from a JSON file.
    ///
    /// Missing fields take their default values.
    ///
    /// # Errors
    /// If the file can't be read or parsed, or the config is invalid.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content)
    }

    /// Parses and validates a `SimulationConfig` from a JSON string.
    ///
    /// # Errors
    /// If the JSON is malformed or the config is invalid.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// `Invalid` describing the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.num_clients == 0 {
            return invalid("num_clients must be greater than zero".into());
        }
        if self.num_classes == 0 {
            return invalid("num_classes must be greater than zero".into());
        }
        if self.shards_per_label == 0 {
            return invalid("shards_per_label must be greater than zero".into());
        }

        let total_shards = self.num_classes * self.shards_per_label;
        if total_shards % self.num_clients != 0 {
            return invalid(format!(
                "{total_shards} shards can't be dealt evenly to {} clients",
                self.num_clients
            ));
        }

        if self.local_epochs == 0 {
            return invalid("local_epochs must be greater than zero".into());
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be greater than zero".into());
        }
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return invalid(format!("lr must be positive, got {}", self.lr));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return invalid(format!("momentum must be in [0, 1), got {}", self.momentum));
        }
        if let Some(secs) = self.round_timeout_secs {
            if !(secs.is_finite() && secs > 0.0) {
                return invalid(format!("round_timeout_secs must be positive, got {secs}"));
            }
        }

        self.strategy
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// The compute pool, defaulting to the host's parallelism.
    ///
    /// The default always fits at least one participant task.
    pub fn capacity(&self) -> Resources {
        if let Some(capacity) = self.capacity {
            return capacity;
        }

        let cpus = std::thread::available_parallelism()
            .map(|n| n.get() as f64)
            .unwrap_or(1.0);
        let gpus = if self.client_resources.num_gpus > 0.0 {
            self.client_resources.num_gpus.max(1.0)
        } else {
            0.0
        };
        Resources::new(cpus.max(self.client_resources.num_cpus), gpus)
    }

    pub fn round_timeout(&self) -> Option<Duration> {
        self.round_timeout_secs.map(Duration::from_secs_f64)
    }

    /// The dataset provider this config describes.
    pub fn provider(&self) -> Box<dyn DatasetProvider + Send> {
        match &self.dataset {
            DatasetConfig::Synthetic {
                feature_dim,
                train_per_class,
                test_per_class,
                spread,
            } => Box::new(SyntheticBlobs {
                num_classes: self.num_classes,
                feature_dim: *feature_dim,
                train_per_class: *train_per_class,
                test_per_class: *test_per_class,
                spread: *spread,
                seed: self.seed,
            }),
            DatasetConfig::Csv { train, test } => Box::new(CsvDataset {
                train: train.clone(),
                test: test.clone(),
                num_classes: self.num_classes,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        let config = SimulationConfig::from_json("{}").unwrap();
        assert_eq!(config, SimulationConfig::default());
        assert_eq!(config.strategy.num_rounds, 100);
        assert_eq!(config.strategy.min_available_clients, 10);
        assert_eq!(config.client_resources, Resources::cpus(2.0));
    }

    #[test]
    fn partial_json_overrides_fields() {
        let config = SimulationConfig::from_json(
            r#"{
                "num_clients": 5,
                "strategy": { "num_rounds": 3, "min_available_clients": 5 },
                "client_resources": { "num_cpus": 1, "num_gpus": 0.2 },
                "evaluate_on": "test",
                "dataset": { "kind": "csv", "train": "train.csv", "test": "test.csv" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.num_clients, 5);
        assert_eq!(config.strategy.num_rounds, 3);
        assert_eq!(config.strategy.fraction_fit, 0.5);
        assert_eq!(config.client_resources, Resources::new(1.0, 0.2));
        assert_eq!(config.evaluate_on, EvaluateOn::Test);
        assert!(matches!(config.dataset, DatasetConfig::Csv { .. }));
        assert_eq!(config.capacity().num_gpus, 1.0);
    }

    #[test]
    fn uneven_shards_are_rejected() {
        let err = SimulationConfig::from_json(r#"{ "num_clients": 3 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = SimulationConfig::from_json(r#"{ "strategy": { "fraction_fit": 2.0 } }"#)
            .unwrap_err();
        assert!(err.to_string().contains("fraction_fit"));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let err = SimulationConfig::from_json("{ nope").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn default_capacity_fits_one_task() {
        let config = SimulationConfig {
            client_resources: Resources::cpus(512.0),
            ..Default::default()
        };
        assert!(config.capacity().num_cpus >= 512.0);
    }
}
