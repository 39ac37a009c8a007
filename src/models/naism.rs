//! Neural attentive item similarity model (NAISM1).
//!
//! The model estimates:
//!
//! - history item embeddings `Q_`, representing items a user interacted with,
//! - target item embeddings `Q` and item biases, representing candidates, and
//! - a small attention network `(W, b, h)` scoring each history item.
//!
//! For a user with history items `j_1..j_n` and a candidate item `i`:
//! ```text
//! a_t = (Q_[j_t] W + b) h
//! w_t = exp(a_t) / sum_s exp(a_s)
//! p   = n^(-alpha) * sum_t w_t Q_[j_t]
//! y   = sigmoid(p . Q[i] + bias[i])
//! ```
//! trained with log-loss plus L2 penalties on `Q`, `Q_` and `W`, using
//! Adagrad. Each minibatch is expressed as a `wyrm` graph over shared
//! parameters and differentiated by reverse-mode autodiff.
use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rand_xorshift::XorShiftRng;
use rayon::prelude::*;

use wyrm;
use wyrm::optim::Optimizer;
use wyrm::{Arr, BoxedNode, Variable};

use super::ImplicitUser;
use crate::checkpoint::CheckpointError;
use crate::data::Minibatch;
use crate::{FittingError, ItemId, OnlineRankingModel, PredictionError};

/// Size of the attention network's hidden layer.
pub const DEFAULT_WEIGHT_SIZE: usize = 16;

const INIT_STDDEV: f32 = 0.01;
const LOG_LOSS_EPSILON: f32 = 1e-7;
const PARAMETER_NAMES: [&str; 6] = [
    "history_embedding",
    "target_embedding",
    "item_biases",
    "attention_weights",
    "attention_bias",
    "attention_projection",
];

fn truncated_normal<R: Rng>(stddev: f32, rng: &mut R) -> f32 {
    loop {
        let value: f32 = rng.sample(StandardNormal);
        if value.abs() <= 2.0 {
            return value * stddev;
        }
    }
}

fn dense_init<R: Rng>(rows: usize, cols: usize, rng: &mut R) -> Arr {
    Arr::from_shape_fn((rows, cols), |_| truncated_normal(INIT_STDDEV, rng))
}

/// Logistic function.
pub fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let z = x.exp();
        z / (1.0 + z)
    }
}

/// Binary log-loss of `prediction` against `label`, smoothed by `1e-7`.
pub fn log_loss(label: f32, prediction: f32) -> f32 {
    -label * (prediction + LOG_LOSS_EPSILON).ln()
        - (1.0 - label) * (1.0 - prediction + LOG_LOSS_EPSILON).ln()
}

/// L2 penalty coefficients.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct L2Penalties {
    /// Penalty on target item embeddings `Q`.
    pub target_embedding: f32,
    /// Penalty on history item embeddings `Q_`.
    pub history_embedding: f32,
    /// Penalty on the attention weight matrix `W`.
    pub attention: f32,
}

impl Default for L2Penalties {
    fn default() -> Self {
        L2Penalties {
            target_embedding: 1e-7,
            history_embedding: 1e-7,
            attention: 1e-7,
        }
    }
}

/// Hyperparameters describing the NAISM1 model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Hyperparameters {
    num_items: usize,
    embedding_dim: usize,
    weight_size: usize,
    alpha: f32,
    l2_penalties: L2Penalties,
    learning_rate: f32,
    rng: XorShiftRng,
}

impl Hyperparameters {
    /// Build new hyperparameters.
    pub fn new(num_items: usize) -> Self {
        Hyperparameters {
            num_items,
            embedding_dim: 8,
            weight_size: DEFAULT_WEIGHT_SIZE,
            alpha: 0.0,
            l2_penalties: L2Penalties::default(),
            learning_rate: 0.01,
            rng: XorShiftRng::from_seed(rand::thread_rng().gen()),
        }
    }

    /// Set the embedding dimensionality.
    pub fn embedding_dim(mut self, embedding_dim: usize) -> Self {
        self.embedding_dim = embedding_dim;
        self
    }

    /// Set the size of the attention network's hidden layer.
    pub fn weight_size(mut self, weight_size: usize) -> Self {
        self.weight_size = weight_size;
        self
    }

    /// Set the exponent of the history length coefficient `n^(-alpha)`.
    pub fn alpha(mut self, alpha: f32) -> Self {
        self.alpha = alpha;
        self
    }

    /// Set the L2 penalties.
    pub fn l2_penalties(mut self, l2_penalties: L2Penalties) -> Self {
        self.l2_penalties = l2_penalties;
        self
    }

    /// Set the learning rate.
    pub fn learning_rate(mut self, learning_rate: f32) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    /// Set the random number generator from seed.
    pub fn from_seed(mut self, seed: u64) -> Self {
        self.rng = XorShiftRng::seed_from_u64(seed);
        self
    }

    fn parameter_shapes(&self) -> Vec<(usize, usize)> {
        let (num_items, embedding_dim, weight_size) =
            (self.num_items, self.embedding_dim, self.weight_size);

        vec![
            (num_items + 1, embedding_dim),
            (num_items, embedding_dim),
            (num_items, 1),
            (embedding_dim, weight_size),
            (1, weight_size),
            (weight_size, 1),
        ]
    }

    fn build_params(&mut self) -> Parameters {
        let num_items = self.num_items;
        let embedding_dim = self.embedding_dim;
        let weight_size = self.weight_size;
        let rng = &mut self.rng;

        // The last history row is the padding row and stays zero.
        let history_embedding = Arr::from_shape_fn((num_items + 1, embedding_dim), |(row, _)| {
            if row == num_items {
                0.0
            } else {
                truncated_normal(INIT_STDDEV, rng)
            }
        });

        Parameters {
            history_embedding: Arc::new(wyrm::HogwildParameter::new(history_embedding)),
            target_embedding: Arc::new(wyrm::HogwildParameter::new(dense_init(
                num_items,
                embedding_dim,
                rng,
            ))),
            item_biases: Arc::new(wyrm::HogwildParameter::new(Arr::zeros((num_items, 1)))),
            attention_weights: Arc::new(wyrm::HogwildParameter::new(dense_init(
                embedding_dim,
                weight_size,
                rng,
            ))),
            attention_bias: Arc::new(wyrm::HogwildParameter::new(dense_init(
                1,
                weight_size,
                rng,
            ))),
            attention_projection: Arc::new(wyrm::HogwildParameter::new(dense_init(
                weight_size,
                1,
                rng,
            ))),
        }
    }

    /// Build the NAISM1 model with freshly initialised parameters.
    pub fn build(mut self) -> ImplicitNAISModel {
        let params = self.build_params();

        ImplicitNAISModel {
            hyper: self,
            params,
            global_step: 0,
        }
    }
}

#[derive(Debug)]
struct Parameters {
    // (num_items + 1) x e; the last row is the zero padding row.
    history_embedding: Arc<wyrm::HogwildParameter>,
    // num_items x e
    target_embedding: Arc<wyrm::HogwildParameter>,
    // num_items x 1
    item_biases: Arc<wyrm::HogwildParameter>,
    // e x w
    attention_weights: Arc<wyrm::HogwildParameter>,
    // 1 x w
    attention_bias: Arc<wyrm::HogwildParameter>,
    // w x 1
    attention_projection: Arc<wyrm::HogwildParameter>,
}

impl Clone for Parameters {
    fn clone(&self) -> Self {
        Parameters {
            history_embedding: Arc::new(self.history_embedding.as_ref().clone()),
            target_embedding: Arc::new(self.target_embedding.as_ref().clone()),
            item_biases: Arc::new(self.item_biases.as_ref().clone()),
            attention_weights: Arc::new(self.attention_weights.as_ref().clone()),
            attention_bias: Arc::new(self.attention_bias.as_ref().clone()),
            attention_projection: Arc::new(self.attention_projection.as_ref().clone()),
        }
    }
}

impl Parameters {
    /// Build from values in `PARAMETER_NAMES` order.
    fn from_values(values: Vec<Arr>) -> Option<Self> {
        let mut values = values
            .into_iter()
            .map(|value| Arc::new(wyrm::HogwildParameter::new(value)));

        Some(Parameters {
            history_embedding: values.next()?,
            target_embedding: values.next()?,
            item_biases: values.next()?,
            attention_weights: values.next()?,
            attention_bias: values.next()?,
            attention_projection: values.next()?,
        })
    }

    fn fields(&self) -> Vec<&Arc<wyrm::HogwildParameter>> {
        vec![
            &self.history_embedding,
            &self.target_embedding,
            &self.item_biases,
            &self.attention_weights,
            &self.attention_bias,
            &self.attention_projection,
        ]
    }

    fn values(&self) -> Vec<Arr> {
        self.fields()
            .into_iter()
            .map(|field| field.value().clone())
            .collect()
    }

    fn num_items(&self) -> usize {
        self.target_embedding.value().dim().0
    }

    fn embedding_dim(&self) -> usize {
        self.target_embedding.value().dim().1
    }

    fn regularization(&self, l2: &L2Penalties) -> f32 {
        let squared = |x: &Arr| x.iter().map(|v| v * v).sum::<f32>();

        l2.target_embedding * squared(self.target_embedding.value())
            + l2.history_embedding * squared(self.history_embedding.value())
            + l2.attention * squared(self.attention_weights.value())
    }

    fn nodes(&self) -> Nodes {
        Nodes {
            history_embedding: wyrm::ParameterNode::shared(self.history_embedding.clone()),
            target_embedding: wyrm::ParameterNode::shared(self.target_embedding.clone()),
            item_biases: wyrm::ParameterNode::shared(self.item_biases.clone()),
            attention_weights: wyrm::ParameterNode::shared(self.attention_weights.clone()),
            attention_bias: wyrm::ParameterNode::shared(self.attention_bias.clone()),
            attention_projection: wyrm::ParameterNode::shared(self.attention_projection.clone()),
        }
    }
}

/// Graph handles onto the shared parameters. Gradients accumulate here
/// until the optimizer step.
struct Nodes {
    history_embedding: Variable<wyrm::ParameterNode>,
    target_embedding: Variable<wyrm::ParameterNode>,
    item_biases: Variable<wyrm::ParameterNode>,
    attention_weights: Variable<wyrm::ParameterNode>,
    attention_bias: Variable<wyrm::ParameterNode>,
    attention_projection: Variable<wyrm::ParameterNode>,
}

struct Pooling {
    // 1 x n
    weights: Variable<BoxedNode>,
    // 1 x e
    pooled: Variable<BoxedNode>,
}

fn sum_nodes(mut terms: Vec<Variable<BoxedNode>>) -> Option<Variable<BoxedNode>> {
    // Pairwise, to keep the graph shallow.
    while terms.len() > 1 {
        let mut summed = Vec::with_capacity((terms.len() + 1) / 2);
        let mut terms_iter = terms.into_iter();

        while let Some(lhs) = terms_iter.next() {
            summed.push(match terms_iter.next() {
                Some(rhs) => (lhs + rhs).boxed(),
                None => lhs,
            });
        }

        terms = summed;
    }

    terms.pop()
}

impl Nodes {
    /// Attention pooling of a non-empty history.
    fn pool(&self, history: &[ItemId], alpha: f32) -> Option<Pooling> {
        if history.is_empty() {
            return None;
        }

        let embedded = self
            .history_embedding
            .index(&wyrm::IndexInputNode::new(history));
        let ones = wyrm::InputNode::new(Arr::from_elem((history.len(), 1), 1.0));

        let hidden = embedded.dot(&self.attention_weights) + ones.dot(&self.attention_bias);
        let weights = hidden
            .dot(&self.attention_projection)
            .t()
            .softmax()
            .boxed();
        let pooled = weights.dot(&embedded);

        let coefficient = (history.len() as f32).powf(-alpha);
        let pooled = if coefficient == 1.0 {
            pooled.boxed()
        } else {
            (pooled * coefficient).boxed()
        };

        Some(Pooling { weights, pooled })
    }

    /// Pre-sigmoid score of `target`; an empty history scores the bias alone.
    fn score(&self, pooling: Option<&Pooling>, target: ItemId) -> Variable<BoxedNode> {
        let target = wyrm::IndexInputNode::new(&[target]);
        let bias = self.item_biases.index(&target);

        match pooling {
            Some(pooling) => {
                let embedding = self.target_embedding.index(&target);
                (pooling.pooled.vector_dot(&embedding) + bias).boxed()
            }
            None => bias.boxed(),
        }
    }

    fn regularization(&self, l2: &L2Penalties) -> Vec<Variable<BoxedNode>> {
        let penalties = [
            (l2.target_embedding, &self.target_embedding),
            (l2.history_embedding, &self.history_embedding),
            (l2.attention, &self.attention_weights),
        ];

        penalties
            .iter()
            .filter(|&&(coefficient, _)| coefficient > 0.0)
            .map(|&(coefficient, parameter)| {
                (parameter.square().scalar_sum() * coefficient).boxed()
            })
            .collect()
    }
}

/// Serializable values of one parameter matrix.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    values: Vec<f32>,
}

impl Matrix {
    fn from_arr(arr: &Arr) -> Self {
        let (rows, cols) = arr.dim();

        Matrix {
            rows,
            cols,
            values: arr.iter().cloned().collect(),
        }
    }

    fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    fn into_arr(self, name: &str) -> Result<Arr, CheckpointError> {
        let shape = self.shape();

        Arr::from_shape_vec(shape, self.values).map_err(|error| CheckpointError::ShapeMismatch {
            reason: format!("{}: {}", name, error),
        })
    }
}

/// Serializable snapshot of a model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelState {
    /// Hyperparameters the model was built with.
    pub hyperparameters: Hyperparameters,
    /// Parameter values: history embeddings, target embeddings, item
    /// biases, attention weights, attention bias, attention projection.
    pub parameters: Vec<Matrix>,
    /// Number of optimizer steps taken.
    pub global_step: u64,
}

/// Implicit NAISM1 model.
#[derive(Clone, Debug)]
pub struct ImplicitNAISModel {
    hyper: Hyperparameters,
    params: Parameters,
    global_step: u64,
}

impl ImplicitNAISModel {
    /// Rebuild a model from a snapshot.
    ///
    /// Adagrad accumulators are not part of the snapshot and start afresh.
    pub fn from_state(state: ModelState) -> Result<Self, CheckpointError> {
        let expected = state.hyperparameters.parameter_shapes();

        if state.parameters.len() != expected.len() {
            return Err(CheckpointError::ShapeMismatch {
                reason: format!(
                    "expected {} parameters, found {}",
                    expected.len(),
                    state.parameters.len()
                ),
            });
        }

        let mut values = Vec::with_capacity(expected.len());

        for (name, matrix, &shape) in izip!(PARAMETER_NAMES.iter(), state.parameters, &expected)
        {
            if matrix.shape() != shape {
                return Err(CheckpointError::ShapeMismatch {
                    reason: format!(
                        "{} has shape {:?}, hyperparameters imply {:?}",
                        name,
                        matrix.shape(),
                        shape
                    ),
                });
            }

            values.push(matrix.into_arr(name)?);
        }

        let params =
            Parameters::from_values(values).ok_or_else(|| CheckpointError::ShapeMismatch {
                reason: "missing parameter values".to_owned(),
            })?;

        Ok(ImplicitNAISModel {
            hyper: state.hyperparameters,
            params,
            global_step: state.global_step,
        })
    }

    /// Snapshot the model.
    pub fn state(&self) -> ModelState {
        ModelState {
            hyperparameters: self.hyper.clone(),
            parameters: self
                .params
                .fields()
                .into_iter()
                .map(|field| Matrix::from_arr(field.value()))
                .collect(),
            global_step: self.global_step,
        }
    }

    /// Replace the settings that do not affect parameter shapes.
    pub fn reconfigure(&mut self, alpha: f32, l2_penalties: L2Penalties, learning_rate: f32) {
        self.hyper.alpha = alpha;
        self.hyper.l2_penalties = l2_penalties;
        self.hyper.learning_rate = learning_rate;
    }

    /// Number of items the model scores.
    pub fn num_items(&self) -> usize {
        self.params.num_items()
    }

    /// Embedding dimensionality.
    pub fn embedding_dim(&self) -> usize {
        self.params.embedding_dim()
    }

    /// History length exponent.
    pub fn alpha(&self) -> f32 {
        self.hyper.alpha
    }

    /// L2 penalties.
    pub fn l2_penalties(&self) -> L2Penalties {
        self.hyper.l2_penalties
    }

    /// Adagrad learning rate.
    pub fn learning_rate(&self) -> f32 {
        self.hyper.learning_rate
    }

    /// Index of the padding row of the history embedding.
    pub fn padding_idx(&self) -> ItemId {
        self.num_items()
    }

    /// Number of optimizer steps taken so far.
    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    /// Attention weights over the padded history of example `idx`;
    /// padded positions get zero weight.
    pub fn attention_weights(&self, batch: &Minibatch, idx: usize) -> Vec<f32> {
        let mut weights = vec![0.0; batch.max_length()];
        let nodes = self.params.nodes();

        if let Some(pooling) = nodes.pool(batch.history(idx), self.hyper.alpha) {
            pooling.weights.forward();

            for (weight, &value) in weights.iter_mut().zip(pooling.weights.value().iter()) {
                *weight = value;
            }
        }

        weights
    }

    /// Predicted interaction probabilities for every example in `batch`.
    pub fn predict_minibatch(&self, batch: &Minibatch) -> Vec<f32> {
        (0..batch.len())
            .into_par_iter()
            .map(|idx| {
                let nodes = self.params.nodes();
                let pooling = nodes.pool(batch.history(idx), self.hyper.alpha);
                let score = nodes.score(pooling.as_ref(), batch.targets()[idx]);

                score.forward();
                let value = score.value()[(0, 0)];

                sigmoid(value)
            })
            .collect()
    }

    /// The L2 regularization term of the objective.
    pub fn regularization(&self) -> f32 {
        self.params.regularization(&self.hyper.l2_penalties)
    }

    /// The training objective on `batch`: mean log-loss plus regularization.
    pub fn loss(&self, batch: &Minibatch) -> f32 {
        if batch.is_empty() {
            return self.regularization();
        }

        let predictions = self.predict_minibatch(batch);
        let log_loss_sum: f32 = predictions
            .iter()
            .zip(batch.labels())
            .map(|(&prediction, &label)| log_loss(label, prediction))
            .sum();

        log_loss_sum / batch.len() as f32 + self.regularization()
    }

    /// The objective on `batch` as a graph over `nodes`.
    fn objective(&self, nodes: &Nodes, batch: &Minibatch) -> Option<Variable<BoxedNode>> {
        let log_likelihoods: Vec<_> = (0..batch.len())
            .map(|idx| {
                let pooling = nodes.pool(batch.history(idx), self.hyper.alpha);
                let prediction = nodes
                    .score(pooling.as_ref(), batch.targets()[idx])
                    .sigmoid()
                    .boxed();
                let label = batch.labels()[idx];

                ((prediction.clone() + LOG_LOSS_EPSILON).ln() * label
                    + (1.0 - prediction + LOG_LOSS_EPSILON).ln() * (1.0 - label))
                    .boxed()
            })
            .collect();

        let mean_log_loss = (sum_nodes(log_likelihoods)? * (-1.0 / batch.len() as f32)).boxed();

        let mut terms = nodes.regularization(&self.hyper.l2_penalties);
        terms.push(mean_log_loss);

        sum_nodes(terms)
    }

    /// Run one optimization step on `batch`, returning the objective value
    /// before the update.
    pub fn fit_minibatch(&mut self, batch: &Minibatch) -> Result<f32, FittingError> {
        let nodes = self.params.nodes();
        let mut objective = self
            .objective(&nodes, batch)
            .ok_or(FittingError::NoInteractions)?;

        objective.forward();
        let loss = objective.value()[(0, 0)];

        if !loss.is_finite() {
            return Err(FittingError::NonFiniteLoss {
                step: self.global_step,
            });
        }

        objective.backward(1.0);

        let optimizer = wyrm::optim::Adagrad::new().learning_rate(self.hyper.learning_rate);
        optimizer.step(objective.parameters());

        self.global_step += 1;

        Ok(loss)
    }

    fn check_items(&self, item_ids: &[ItemId]) -> Result<(), PredictionError> {
        let num_items = self.num_items();

        match item_ids.iter().find(|&&item_id| item_id >= num_items) {
            Some(&item_id) => Err(PredictionError::UnknownItem { item_id, num_items }),
            None => Ok(()),
        }
    }
}

impl OnlineRankingModel for ImplicitNAISModel {
    type UserRepresentation = ImplicitUser;
    fn user_representation(
        &self,
        item_ids: &[ItemId],
    ) -> Result<Self::UserRepresentation, PredictionError> {
        self.check_items(item_ids)?;

        let nodes = self.params.nodes();

        let user_embedding = match nodes.pool(item_ids, self.hyper.alpha) {
            Some(pooling) => {
                pooling.pooled.forward();
                let representation = pooling.pooled.value();
                representation.iter().cloned().collect()
            }
            None => vec![0.0; self.embedding_dim()],
        };

        Ok(ImplicitUser { user_embedding })
    }

    fn predict(
        &self,
        user: &Self::UserRepresentation,
        item_ids: &[ItemId],
    ) -> Result<Vec<f32>, PredictionError> {
        self.check_items(item_ids)?;

        let embeddings = self.params.target_embedding.value();
        let biases = self.params.item_biases.value();

        item_ids
            .iter()
            .map(|&item_id| {
                let dot: f32 = embeddings
                    .row(item_id)
                    .iter()
                    .zip(user.embedding())
                    .map(|(x, y)| x * y)
                    .sum();
                let prediction = sigmoid(dot + biases[(item_id, 0)]);

                if prediction.is_finite() {
                    Ok(prediction)
                } else {
                    Err(PredictionError::InvalidPredictionValue)
                }
            })
            .collect()
    }
}
