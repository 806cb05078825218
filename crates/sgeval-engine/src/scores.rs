use ndarray::{Array1, ArrayD};
use thiserror::Error;

use sgeval_core::config::ListenerLoss;
use sgeval_core::device::Device;
use sgeval_core::tensor::Tensor;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScoreError {
    #[error("true_index {index} out of range for {len} scores")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("scores must have shape (K,) or (K, 1), got {0:?}")]
    BadShape(Vec<usize>),
}

/// Operands of a margin ranking loss: every row asks `anchor > scores`.
#[derive(Debug, Clone, PartialEq)]
pub struct RankingOperands {
    pub anchor: Tensor<f32>,
    pub scores: Tensor<f32>,
    pub target: Tensor<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegressionOperands {
    pub scores: Tensor<f32>,
    pub target: Tensor<f32>,
}

fn score_values(scores: &Tensor<f32>) -> Result<Vec<f32>, ScoreError> {
    match scores.shape() {
        [_] | [_, 1] => Ok(scores.to_vec()),
        shape => Err(ScoreError::BadShape(shape.to_vec())),
    }
}

fn vector(values: Vec<f32>, device: Device) -> Tensor<f32> {
    Tensor::new(Array1::from(values).into_dyn(), device)
}

/// Ranking-loss operands for a listener that should score `true_index` highest.
pub fn format_scores(
    scores: &Tensor<f32>,
    true_index: usize,
    device: Device,
) -> Result<RankingOperands, ScoreError> {
    let values = score_values(scores)?;
    let len = values.len();
    let truth = *values.get(true_index).ok_or(ScoreError::IndexOutOfRange {
        index: true_index,
        len,
    })?;

    Ok(RankingOperands {
        anchor: vector(vec![truth; len], device),
        scores: vector(values, device),
        target: vector(vec![1.0; len], device),
    })
}

/// Regression targets: `+1` at `true_index`, `-1` elsewhere.
pub fn format_scores_reg(
    scores: &Tensor<f32>,
    true_index: usize,
    device: Device,
) -> Result<RegressionOperands, ScoreError> {
    let values = score_values(scores)?;
    let len = values.len();
    if true_index >= len {
        return Err(ScoreError::IndexOutOfRange {
            index: true_index,
            len,
        });
    }
    let mut target = vec![-1.0f32; len];
    target[true_index] = 1.0;

    Ok(RegressionOperands {
        scores: vector(values, device),
        target: vector(target, device),
    })
}

fn mean(values: ArrayD<f32>) -> f32 {
    values.mean().unwrap_or(0.0)
}

/// `mean(max(0, -y * (x1 - x2) + margin))`.
pub fn margin_ranking_loss(ops: &RankingOperands, margin: f32) -> f32 {
    let diff = &ops.anchor.data - &ops.scores.data;
    let per_pair = (-&ops.target.data * diff + margin).mapv(|v| v.max(0.0));
    mean(per_pair)
}

/// `mean((scores - target)^2)`.
pub fn mse_loss(ops: &RegressionOperands) -> f32 {
    let diff = &ops.scores.data - &ops.target.data;
    mean(diff.mapv(|v| v * v))
}

/// Loss of one listener call where `true_index` is the correct candidate.
pub fn listener_loss(
    kind: ListenerLoss,
    scores: &Tensor<f32>,
    true_index: usize,
    device: Device,
) -> Result<f32, ScoreError> {
    match kind {
        ListenerLoss::MarginRanking => Ok(margin_ranking_loss(
            &format_scores(scores, true_index, device)?,
            0.0,
        )),
        ListenerLoss::Regression => Ok(mse_loss(&format_scores_reg(
            scores, true_index, device,
        )?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores(values: &[f32]) -> Tensor<f32> {
        Tensor::from_shape_vec(&[values.len()], values.to_vec()).unwrap()
    }

    #[test]
    fn ranking_operands_broadcast_the_true_score() {
        let ops = format_scores(&scores(&[0.2, 0.9, 0.5]), 1, Device::Cpu).unwrap();
        assert_eq!(ops.anchor.to_vec(), vec![0.9, 0.9, 0.9]);
        assert_eq!(ops.scores.to_vec(), vec![0.2, 0.9, 0.5]);
        assert_eq!(ops.target.to_vec(), vec![1.0, 1.0, 1.0]);
    }

    #[test]
    fn column_scores_are_accepted() {
        let col = Tensor::from_shape_vec(&[3, 1], vec![0.2f32, 0.9, 0.5]).unwrap();
        let ops = format_scores(&col, 0, Device::Cuda(0)).unwrap();
        assert_eq!(ops.anchor.to_vec(), vec![0.2, 0.2, 0.2]);
        assert_eq!(ops.target.device, Device::Cuda(0));
    }

    #[test]
    fn regression_target_marks_the_true_index() {
        let ops = format_scores_reg(&scores(&[0.1, 0.2, 0.3, 0.4]), 2, Device::Cpu).unwrap();
        assert_eq!(ops.target.to_vec(), vec![-1.0, -1.0, 1.0, -1.0]);
        assert_eq!(ops.scores.to_vec(), vec![0.1, 0.2, 0.3, 0.4]);
    }

    #[test]
    fn out_of_range_index_is_an_error() {
        assert_eq!(
            format_scores(&scores(&[0.1, 0.2]), 2, Device::Cpu).unwrap_err(),
            ScoreError::IndexOutOfRange { index: 2, len: 2 }
        );
        assert_eq!(
            format_scores_reg(&scores(&[]), 0, Device::Cpu).unwrap_err(),
            ScoreError::IndexOutOfRange { index: 0, len: 0 }
        );
    }

    #[test]
    fn matrix_scores_are_rejected() {
        let m = Tensor::full(&[2, 2], 0.0, Device::Cpu);
        assert_eq!(
            format_scores(&m, 0, Device::Cpu).unwrap_err(),
            ScoreError::BadShape(vec![2, 2])
        );
    }

    #[test]
    fn ranking_loss_penalizes_higher_wrong_scores() {
        let ops = format_scores(&scores(&[0.2, 0.5, 0.9]), 1, Device::Cpu).unwrap();
        // Only index 2 outranks the truth: max(0, -(0.5 - 0.9)) = 0.4, averaged over 3.
        let loss = margin_ranking_loss(&ops, 0.0);
        assert!((loss - 0.4 / 3.0).abs() < 1e-6, "loss = {loss}");

        let best = format_scores(&scores(&[0.2, 0.9, 0.5]), 1, Device::Cpu).unwrap();
        assert_eq!(margin_ranking_loss(&best, 0.0), 0.0);
    }

    #[test]
    fn mse_of_perfect_prediction_is_zero() {
        let ops = format_scores_reg(&scores(&[-1.0, 1.0]), 1, Device::Cpu).unwrap();
        assert_eq!(mse_loss(&ops), 0.0);
    }
}
