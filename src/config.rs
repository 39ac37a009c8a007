//! Run configuration.
use std::path::PathBuf;
use std::str::FromStr;

use crate::checkpoint::run_name;
use crate::models::naism::{Hyperparameters, L2Penalties};

/// Configuration error types.
#[derive(Debug, Fail, PartialEq)]
pub enum ConfigError {
    /// `--regs` is not a bracketed list of three numbers.
    #[fail(display = "Invalid regularization list {:?}: expected e.g. [1e-7,1e-7,1e-7].", value)]
    InvalidRegs {
        /// The rejected value.
        value: String,
    },
    /// A setting that must be positive is not.
    #[fail(display = "{} must be positive.", name)]
    NotPositive {
        /// Name of the setting.
        name: &'static str,
    },
}

impl FromStr for L2Penalties {
    type Err = ConfigError;

    /// Parse `[lambda,gamma,eta]`: the penalties on the target embeddings,
    /// the history embeddings and the attention weights.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidRegs {
            value: value.to_owned(),
        };

        let inner = value
            .trim()
            .strip_prefix('[')
            .and_then(|x| x.strip_suffix(']'))
            .ok_or_else(invalid)?;

        let penalties = inner
            .split(',')
            .map(|x| x.trim().parse::<f32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| invalid())?;

        match penalties.as_slice() {
            &[target_embedding, history_embedding, attention] => Ok(L2Penalties {
                target_embedding,
                history_embedding,
                attention,
            }),
            _ => Err(invalid()),
        }
    }
}

/// Settings of a training run.
#[derive(Clone, Debug)]
pub struct Config {
    /// Directory prefix of the dataset files.
    pub path: String,
    /// Dataset name; files are `{path}{dataset}.train.rating` and so on.
    pub dataset: String,
    /// Total number of epochs.
    pub epochs: usize,
    /// Minibatch size.
    pub batch_size: usize,
    /// Embedding size.
    pub embedding_dim: usize,
    /// L2 penalties.
    pub regs: L2Penalties,
    /// History length exponent.
    pub alpha: f32,
    /// Negatives per positive instance.
    pub num_negatives: usize,
    /// Adagrad learning rate.
    pub learning_rate: f32,
    /// Cut-off for hit rate and NDCG.
    pub top_k: usize,
    /// Seed for initialisation and sampling; random when absent.
    pub seed: Option<u64>,
    /// Parent directory of per-run checkpoint directories.
    pub checkpoint_root: PathBuf,
    /// Parent directory of per-run log files.
    pub log_root: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            path: "Data/".to_owned(),
            dataset: "pinterest-20".to_owned(),
            epochs: 100,
            batch_size: 256,
            embedding_dim: 8,
            regs: L2Penalties::default(),
            alpha: 0.0,
            num_negatives: 4,
            learning_rate: 0.01,
            top_k: 10,
            seed: None,
            checkpoint_root: PathBuf::from("Checkpoints/NAISM1"),
            log_root: PathBuf::from("Log/NAISM1"),
        }
    }
}

impl Config {
    /// Check settings that would make training meaningless.
    pub fn validate(self) -> Result<Self, ConfigError> {
        let positive = [
            ("batch_size", self.batch_size),
            ("embed_size", self.embedding_dim),
            ("topk", self.top_k),
        ];

        if let Some(&(name, _)) = positive.iter().find(|&&(_, value)| value == 0) {
            return Err(ConfigError::NotPositive { name });
        }

        if !(self.learning_rate > 0.0) {
            return Err(ConfigError::NotPositive { name: "lr" });
        }

        Ok(self)
    }

    /// Prefix of the dataset files.
    pub fn dataset_prefix(&self) -> String {
        format!("{}{}", self.path, self.dataset)
    }

    /// Directory holding this run's checkpoints.
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.checkpoint_root.join(run_name(
            self.learning_rate,
            self.batch_size,
            &self.dataset,
        ))
    }

    /// This run's log file.
    pub fn log_file(&self) -> PathBuf {
        self.log_root.join(format!(
            "log_lr{:.4}_bs{}",
            self.learning_rate, self.batch_size
        ))
    }

    /// Model hyperparameters for a dataset with `num_items` items.
    pub fn hyperparameters(&self, num_items: usize) -> Hyperparameters {
        let hyper = Hyperparameters::new(num_items)
            .embedding_dim(self.embedding_dim)
            .alpha(self.alpha)
            .l2_penalties(self.regs)
            .learning_rate(self.learning_rate);

        match self.seed {
            Some(seed) => hyper.from_seed(seed),
            None => hyper,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_reference_regs() {
        let regs: L2Penalties = "[1e-7,1e-6, 0.5]".parse().unwrap();

        assert_eq!(
            regs,
            L2Penalties {
                target_embedding: 1e-7,
                history_embedding: 1e-6,
                attention: 0.5,
            }
        );
    }

    #[test]
    fn rejects_malformed_regs() {
        for value in &["1e-7,1e-7,1e-7", "[1e-7,1e-7]", "[a,b,c]", "[1,2,3,4]", "[]"] {
            assert!(value.parse::<L2Penalties>().is_err(), "accepted {}", value);
        }
    }

    #[test]
    fn paths_are_keyed_by_run() {
        let config = Config::default();

        assert_eq!(
            config.checkpoint_dir(),
            PathBuf::from("Checkpoints/NAISM1/lr0.0100_bs256_pinterest-20")
        );
        assert_eq!(config.log_file(), PathBuf::from("Log/NAISM1/log_lr0.0100_bs256"));
        assert_eq!(config.dataset_prefix(), "Data/pinterest-20");
    }

    #[test]
    fn validation() {
        assert!(Config::default().validate().is_ok());

        let config = Config {
            batch_size: 0,
            ..Config::default()
        };
        assert_eq!(
            config.validate().unwrap_err(),
            ConfigError::NotPositive { name: "batch_size" }
        );

        let config = Config {
            learning_rate: 0.0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
