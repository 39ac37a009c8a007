//! Train NAISM1 on a dataset of `.train.rating`, `.test.rating` and
//! `.test.negative` files, logging per-epoch metrics and checkpointing.
use std::fs::{create_dir_all, OpenOptions};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Mutex;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use nais::checkpoint::Checkpointer;
use nais::config::Config;
use nais::datasets;
use nais::models::naism::L2Penalties;
use nais::training::Trainer;

/// Run NAISM1.
#[derive(Parser, Debug)]
#[command(name = "naism", about = "Run NAISM1.")]
struct Args {
    /// Input data path.
    #[arg(long, default_value = "Data/")]
    path: String,

    /// Choose a dataset.
    #[arg(long, default_value = "pinterest-20")]
    dataset: String,

    /// Number of epochs.
    #[arg(long, default_value_t = 100)]
    epochs: usize,

    /// Batch size.
    #[arg(long = "batch_size", default_value_t = 256)]
    batch_size: usize,

    /// Embedding size.
    #[arg(long = "embed_size", default_value_t = 8)]
    embed_size: usize,

    /// Regularization for the target embeddings, history embeddings and attention weights.
    #[arg(long, default_value = "[1e-7,1e-7,1e-7]")]
    regs: String,

    /// Exponent of the history length coefficient.
    #[arg(long, default_value_t = 0.0)]
    alpha: f32,

    /// Number of negative instances to pair with a positive instance.
    #[arg(long = "num_neg", default_value_t = 4)]
    num_neg: usize,

    /// Learning rate.
    #[arg(long, default_value_t = 0.01)]
    lr: f32,

    /// Cut-off for hit rate and NDCG.
    #[arg(long, default_value_t = 10)]
    topk: usize,

    /// Random seed for initialisation and sampling.
    #[arg(long)]
    seed: Option<u64>,

    /// Parent directory of checkpoint directories.
    #[arg(long = "checkpoint_root", default_value = "Checkpoints/NAISM1")]
    checkpoint_root: PathBuf,

    /// Parent directory of log files.
    #[arg(long = "log_root", default_value = "Log/NAISM1")]
    log_root: PathBuf,
}

impl Args {
    fn into_config(self) -> Result<Config, failure::Error> {
        let regs: L2Penalties = self.regs.parse()?;

        Ok(Config {
            path: self.path,
            dataset: self.dataset,
            epochs: self.epochs,
            batch_size: self.batch_size,
            embedding_dim: self.embed_size,
            regs,
            alpha: self.alpha,
            num_negatives: self.num_neg,
            learning_rate: self.lr,
            top_k: self.topk,
            seed: self.seed,
            checkpoint_root: self.checkpoint_root,
            log_root: self.log_root,
        }
        .validate()?)
    }
}

fn init_logging(log_file: &Path) -> Result<(), failure::Error> {
    if let Some(parent) = log_file.parent() {
        create_dir_all(parent)?;
    }

    let file = OpenOptions::new().create(true).append(true).open(log_file)?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .with(fmt::layer().with_writer(Mutex::new(file)).with_ansi(false))
        .try_init()?;

    Ok(())
}

fn run(config: &Config) -> Result<(), failure::Error> {
    info!(?config, "begin training the NAISM1 model");

    let dataset = datasets::load(config.dataset_prefix())?;
    let checkpointer = Checkpointer::new(config.checkpoint_dir());
    let mut trainer = Trainer::new(config, &dataset, Some(checkpointer))?;

    if let Some(report) = trainer.fit()? {
        info!(
            hit_ratio = report.hit_ratio,
            ndcg = report.ndcg,
            epochs = trainer.epoch(),
            "training finished"
        );
    }

    Ok(())
}

fn main() {
    let config = match Args::parse().into_config() {
        Ok(config) => config,
        Err(error) => {
            eprintln!("error: {}", error);
            process::exit(2);
        }
    };

    if let Err(error) = init_logging(&config.log_file()) {
        eprintln!("error: cannot set up logging: {}", error);
        process::exit(1);
    }

    if let Err(error) = run(&config) {
        error!(error = %error, "training failed");
        for cause in error.iter_causes() {
            error!(cause = %cause, "caused by");
        }
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_defaults() {
        let config = Args::try_parse_from(&["naism"])
            .unwrap()
            .into_config()
            .unwrap();

        assert_eq!(config.path, "Data/");
        assert_eq!(config.dataset, "pinterest-20");
        assert_eq!(config.epochs, 100);
        assert_eq!(config.batch_size, 256);
        assert_eq!(config.embedding_dim, 8);
        assert_eq!(config.regs, L2Penalties::default());
        assert_eq!(config.alpha, 0.0);
        assert_eq!(config.num_negatives, 4);
        assert_eq!(config.learning_rate, 0.01);
        assert_eq!(config.top_k, 10);
        assert_eq!(config.seed, None);
        assert_eq!(config.checkpoint_root, PathBuf::from("Checkpoints/NAISM1"));
        assert_eq!(config.log_root, PathBuf::from("Log/NAISM1"));
    }

    #[test]
    fn reference_flag_names() {
        let config = Args::try_parse_from(&[
            "naism",
            "--path",
            "/data/",
            "--dataset",
            "ml-1m",
            "--epochs",
            "3",
            "--batch_size",
            "64",
            "--embed_size",
            "16",
            "--regs",
            "[1e-6,1e-5,0.1]",
            "--alpha",
            "0.5",
            "--num_neg",
            "2",
            "--lr",
            "0.05",
            "--topk",
            "5",
            "--seed",
            "11",
            "--checkpoint_root",
            "ckpt",
            "--log_root",
            "logs",
        ])
        .unwrap()
        .into_config()
        .unwrap();

        assert_eq!(config.dataset_prefix(), "/data/ml-1m");
        assert_eq!(config.epochs, 3);
        assert_eq!(config.batch_size, 64);
        assert_eq!(config.embedding_dim, 16);
        assert_eq!(
            config.regs,
            L2Penalties {
                target_embedding: 1e-6,
                history_embedding: 1e-5,
                attention: 0.1,
            }
        );
        assert_eq!(config.alpha, 0.5);
        assert_eq!(config.num_negatives, 2);
        assert_eq!(config.learning_rate, 0.05);
        assert_eq!(config.top_k, 5);
        assert_eq!(config.seed, Some(11));
        assert!(config.checkpoint_dir().starts_with("ckpt"));
        assert!(config.log_file().starts_with("logs"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(Args::try_parse_from(&["naism", "--batchsize", "64"]).is_err());
        assert!(Args::try_parse_from(&["naism", "--regs", "1e-7"])
            .unwrap()
            .into_config()
            .is_err());
        assert!(Args::try_parse_from(&["naism", "--batch_size", "0"])
            .unwrap()
            .into_config()
            .is_err());
    }
}
