#![deny(missing_docs)]
//! # nais
//!
//! `nais` implements NAISM1, a neural attentive item similarity model for
//! implicit-feedback recommendation: a user is represented by the items
//! they interacted with in the past, pooled with learned attention weights,
//! and candidate items are scored against that pooled representation.
//!
//! The crate carries the whole training pipeline: dataset loading, training
//! instance generation with negative sampling, the model as a `wyrm`
//! computation graph trained with Adagrad, leave-one-out evaluation (hit
//! rate and NDCG) and JSON checkpointing.
//!
//! ## Example
//! Train on a small synthetic dataset:
//!
//! ```rust
//! # extern crate nais;
//! # extern crate rand;
//! # extern crate rand_xorshift;
//! # use rand::SeedableRng;
//! let mut rng = rand_xorshift::XorShiftRng::seed_from_u64(42);
//! let dataset = nais::datasets::synthetic(40, 40, 4, 6, 10, &mut rng);
//!
//! let config = nais::config::Config {
//!     epochs: 2,
//!     batch_size: 32,
//!     seed: Some(42),
//!     ..nais::config::Config::default()
//! };
//!
//! let mut trainer = nais::training::Trainer::new(&config, &dataset, None).unwrap();
//! let report = trainer.fit().unwrap().unwrap();
//!
//! println!("{}", report);
//! assert!(report.train_loss.is_finite());
//! ```
#[macro_use]
extern crate serde_derive;

#[macro_use]
extern crate itertools;

#[macro_use]
extern crate failure;

#[macro_use]
extern crate tracing;

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod datasets;
pub mod evaluation;
pub mod models;
pub mod training;

/// Alias for user indices.
pub type UserId = usize;
/// Alias for item indices.
pub type ItemId = usize;

/// Prediction error types.
#[derive(Debug, Fail)]
pub enum PredictionError {
    /// Failed prediction due to numerical issues.
    #[fail(display = "Invalid prediction value: non-finite or not a number.")]
    InvalidPredictionValue,
    /// An item id outside of the model's item range.
    #[fail(display = "Item {} is outside of the model's {} items.", item_id, num_items)]
    UnknownItem {
        /// The offending item.
        item_id: ItemId,
        /// Number of items the model knows about.
        num_items: usize,
    },
}

/// Fitting error types.
#[derive(Debug, Fail)]
pub enum FittingError {
    /// No interactions were given.
    #[fail(display = "No interactions were supplied.")]
    NoInteractions,
    /// The training objective diverged.
    #[fail(display = "Non-finite loss at step {}.", step)]
    NonFiniteLoss {
        /// Global step at which the loss was observed.
        step: u64,
    },
}

/// Trait describing models that can compute predictions given
/// a user's past interactions.
pub trait OnlineRankingModel {
    /// The representation the model computes from past interactions.
    type UserRepresentation: std::fmt::Debug;
    /// Compute a user representation from past interactions.
    fn user_representation(
        &self,
        item_ids: &[ItemId],
    ) -> Result<Self::UserRepresentation, PredictionError>;
    /// Given a user representation, score `item_ids` according
    /// to how likely the user is to interact with them.
    fn predict(
        &self,
        user: &Self::UserRepresentation,
        item_ids: &[ItemId],
    ) -> Result<Vec<f32>, PredictionError>;
}
