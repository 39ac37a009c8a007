//! Leave-one-out evaluation: hit rate, NDCG and log-loss over held-out items.
use std::fmt;

use rayon::prelude::*;

use crate::data::{CompressedInteractions, TestCase};
use crate::models::naism::log_loss;
use crate::models::naism::ImplicitNAISModel;
use crate::{ItemId, OnlineRankingModel, PredictionError};

/// Mean metrics over a set of test cases.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct EvaluationResult {
    /// Fraction of test cases whose held-out item ranks in the top `k`.
    pub hit_ratio: f32,
    /// Mean NDCG at `k`.
    pub ndcg: f32,
    /// Mean log-loss over candidates plus the model's regularization term.
    pub loss: f32,
    /// Number of test cases evaluated.
    pub num_cases: usize,
}

impl fmt::Display for EvaluationResult {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "HR = {:.4}, NDCG = {:.4}, loss = {:.4}",
            self.hit_ratio, self.ndcg, self.loss
        )
    }
}

/// Zero-based rank of the held-out item: the number of negatives scoring
/// at least as high. Ties count against the held-out item.
pub fn position(held_out_score: f32, negative_scores: &[f32]) -> usize {
    negative_scores
        .iter()
        .filter(|&&score| score >= held_out_score)
        .count()
}

/// 1 if `position` is inside the top `k`, 0 otherwise.
pub fn hit_ratio(position: usize, k: usize) -> f32 {
    if position < k {
        1.0
    } else {
        0.0
    }
}

/// NDCG of a single relevant item at zero-based `position`, cut off at `k`.
pub fn ndcg(position: usize, k: usize) -> f32 {
    if position < k {
        2.0_f32.ln() / (position as f32 + 2.0).ln()
    } else {
        0.0
    }
}

#[derive(Debug)]
struct CaseResult {
    hit_ratio: f32,
    ndcg: f32,
    log_loss: f32,
}

fn evaluate_case<T: OnlineRankingModel>(
    model: &T,
    history: &[ItemId],
    case: &TestCase,
    k: usize,
) -> Result<CaseResult, PredictionError> {
    let candidates: Vec<ItemId> = case
        .negatives
        .iter()
        .cloned()
        .chain(Some(case.item_id))
        .collect();

    let user = model.user_representation(history)?;
    let predictions = model.predict(&user, &candidates)?;

    let (&held_out, negatives) = predictions
        .split_last()
        .ok_or(PredictionError::InvalidPredictionValue)?;
    let rank = position(held_out, negatives);

    let log_loss_sum = log_loss(1.0, held_out)
        + negatives
            .iter()
            .map(|&prediction| log_loss(0.0, prediction))
            .sum::<f32>();

    Ok(CaseResult {
        hit_ratio: hit_ratio(rank, k),
        ndcg: ndcg(rank, k),
        log_loss: log_loss_sum / predictions.len() as f32,
    })
}

/// Rank each held-out item against its negatives, using the user's full
/// training list as history. Test cases are evaluated in parallel.
pub fn evaluate(
    model: &ImplicitNAISModel,
    train: &CompressedInteractions,
    test: &[TestCase],
    k: usize,
) -> Result<EvaluationResult, PredictionError> {
    let results = test
        .par_iter()
        .map(|case| {
            let history = train
                .get_user(case.user_id)
                .map(|user| user.item_ids)
                .unwrap_or(&[]);

            evaluate_case(model, history, case, k)
        })
        .collect::<Result<Vec<_>, _>>()?;

    if results.is_empty() {
        return Ok(EvaluationResult::default());
    }

    let num_cases = results.len();
    let mean = |func: fn(&CaseResult) -> f32| {
        results.iter().map(func).sum::<f32>() / num_cases as f32
    };

    Ok(EvaluationResult {
        hit_ratio: mean(|x| x.hit_ratio),
        ndcg: mean(|x| x.ndcg),
        loss: mean(|x| x.log_loss) + model.regularization(),
        num_cases,
    })
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_xorshift::XorShiftRng;

    use super::*;
    use crate::datasets;
    use crate::models::naism::Hyperparameters;

    #[test]
    fn ties_count_against_the_held_out_item() {
        assert_eq!(position(0.5, &[0.1, 0.5, 0.9, 0.2]), 2);
        assert_eq!(position(0.95, &[0.1, 0.5, 0.9]), 0);
        assert_eq!(position(0.0, &[]), 0);
    }

    #[test]
    fn ranking_metrics() {
        assert_eq!(hit_ratio(0, 10), 1.0);
        assert_eq!(hit_ratio(9, 10), 1.0);
        assert_eq!(hit_ratio(10, 10), 0.0);

        assert!((ndcg(0, 10) - 1.0).abs() < 1e-6);
        assert!((ndcg(1, 10) - 2.0_f32.ln() / 3.0_f32.ln()).abs() < 1e-6);
        assert_eq!(ndcg(10, 10), 0.0);
    }

    #[test]
    fn untrained_model_metrics_are_bounded() {
        let mut rng = XorShiftRng::seed_from_u64(3);
        let dataset = datasets::synthetic(20, 30, 3, 5, 8, &mut rng);
        let train = dataset.train.to_compressed();
        let model = Hyperparameters::new(dataset.num_items())
            .from_seed(3)
            .build();

        let result = evaluate(&model, &train, &dataset.test, 10).unwrap();

        assert_eq!(result.num_cases, 20);
        assert!(result.hit_ratio >= 0.0 && result.hit_ratio <= 1.0);
        assert!(result.ndcg >= 0.0 && result.ndcg <= result.hit_ratio);
        // Near-uniform predictions of 0.5 give a log-loss of ln 2.
        assert!((result.loss - 2.0_f32.ln()).abs() < 0.05);
    }

    #[test]
    fn k_covering_all_candidates_always_hits() {
        let mut rng = XorShiftRng::seed_from_u64(4);
        let dataset = datasets::synthetic(10, 20, 2, 4, 5, &mut rng);
        let train = dataset.train.to_compressed();
        let model = Hyperparameters::new(dataset.num_items())
            .from_seed(4)
            .build();

        let result = evaluate(&model, &train, &dataset.test, 6).unwrap();

        assert_eq!(result.hit_ratio, 1.0);
        assert!(result.ndcg > 0.0);
    }

    #[test]
    fn unknown_test_items_are_an_error() {
        let train = crate::data::Interactions::new(1, 3).to_compressed();
        let model = Hyperparameters::new(3).from_seed(1).build();
        let test = vec![TestCase {
            user_id: 0,
            item_id: 5,
            negatives: vec![0, 1],
        }];

        assert!(evaluate(&model, &train, &test, 10).is_err());
    }
}
