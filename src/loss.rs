//! Loss functions over row-major batches.
//!
//! Every loss is averaged over the batch. Training calls
//!
//! - `net.forward(...)`
//! - [`Loss::backward`] to write `d_output`
//! - `net.backward(...)`
//!
//! once per integrator phase.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Supported loss functions.
pub enum Loss {
    /// Mean squared error, `0.5 * mean((pred - target)^2)`.
    #[default]
    Mse,
    /// Softmax cross-entropy.
    ///
    /// Expects raw logits per row and a one-hot (or probability) target row.
    /// Use an `Identity` activation on the output block.
    SoftmaxCrossEntropy,
}

impl Loss {
    /// Batch-mean loss.
    ///
    /// Shape contract: `pred.len() == target.len()`, a multiple of `dim`.
    pub fn forward(self, pred: &[f32], target: &[f32], dim: usize) -> f32 {
        match self {
            Loss::Mse => mse(pred, target),
            Loss::SoftmaxCrossEntropy => rows(pred, dim)
                .zip(rows(target, dim))
                .map(|(p, t)| softmax_cross_entropy(p, t))
                .sum::<f32>()
                / batch_len(pred, dim) as f32,
        }
    }

    /// Batch-mean loss plus its gradient w.r.t. `pred`, written into `d_pred`.
    pub fn backward(self, pred: &[f32], target: &[f32], dim: usize, d_pred: &mut [f32]) -> f32 {
        match self {
            Loss::Mse => mse_backward(pred, target, d_pred),
            Loss::SoftmaxCrossEntropy => {
                assert_eq!(
                    pred.len(),
                    d_pred.len(),
                    "pred len {} does not match d_pred len {}",
                    pred.len(),
                    d_pred.len()
                );
                let batch = batch_len(pred, dim);
                let inv_b = 1.0 / batch as f32;
                let mut total = 0.0_f32;
                for ((p, t), d) in rows(pred, dim)
                    .zip(rows(target, dim))
                    .zip(d_pred.chunks_exact_mut(dim))
                {
                    total += softmax_cross_entropy_backward(p, t, d);
                    for v in d.iter_mut() {
                        *v *= inv_b;
                    }
                }
                total * inv_b
            }
        }
    }
}

fn rows(buf: &[f32], dim: usize) -> std::slice::ChunksExact<'_, f32> {
    buf.chunks_exact(dim)
}

fn batch_len(pred: &[f32], dim: usize) -> usize {
    assert!(dim > 0, "loss dim must be > 0");
    assert!(
        pred.len().is_multiple_of(dim) && !pred.is_empty(),
        "pred len {} is not a positive multiple of dim {dim}",
        pred.len()
    );
    pred.len() / dim
}

/// Mean squared error (MSE) loss.
///
/// Returns `0.5 * mean((pred - target)^2)` over all entries.
#[inline]
pub fn mse(pred: &[f32], target: &[f32]) -> f32 {
    assert_eq!(
        pred.len(),
        target.len(),
        "pred len {} does not match target len {}",
        pred.len(),
        target.len()
    );

    if pred.is_empty() {
        return 0.0;
    }

    let inv_n = 1.0 / pred.len() as f32;
    let mut sum_sq = 0.0_f32;
    for (p, t) in pred.iter().zip(target) {
        let diff = p - t;
        sum_sq = diff.mul_add(diff, sum_sq);
    }
    0.5 * sum_sq * inv_n
}

/// MSE loss + gradient w.r.t. `pred`.
///
/// With `L = 0.5 * mean((pred - target)^2)`, the gradient is
/// `d_pred[i] = (pred[i] - target[i]) / N`.
#[inline]
pub fn mse_backward(pred: &[f32], target: &[f32], d_pred: &mut [f32]) -> f32 {
    assert_eq!(
        pred.len(),
        target.len(),
        "pred len {} does not match target len {}",
        pred.len(),
        target.len()
    );
    assert_eq!(
        pred.len(),
        d_pred.len(),
        "pred len {} does not match d_pred len {}",
        pred.len(),
        d_pred.len()
    );

    if pred.is_empty() {
        return 0.0;
    }

    let inv_n = 1.0 / pred.len() as f32;
    let mut sum_sq = 0.0_f32;
    for ((d, p), t) in d_pred.iter_mut().zip(pred).zip(target) {
        let diff = p - t;
        sum_sq = diff.mul_add(diff, sum_sq);
        *d = diff * inv_n;
    }

    0.5 * sum_sq * inv_n
}

/// Softmax cross-entropy of a single row of logits.
#[inline]
pub fn softmax_cross_entropy(logits: &[f32], target: &[f32]) -> f32 {
    assert_eq!(
        logits.len(),
        target.len(),
        "pred len {} does not match target len {}",
        logits.len(),
        target.len()
    );
    assert!(
        !logits.is_empty(),
        "softmax_cross_entropy requires at least 1 class"
    );

    let (log_sum_exp, _max) = log_sum_exp_and_max(logits);

    // -sum_i t_i * (logits_i - log_sum_exp)
    let mut sum = 0.0_f32;
    for (&x, &t) in logits.iter().zip(target) {
        if t != 0.0 {
            sum -= t * (x - log_sum_exp);
        }
    }
    sum
}

/// Softmax cross-entropy + gradient `softmax(logits) - target` for one row.
///
/// Computes the softmax into `d_logits` and turns it into the gradient in place.
#[inline]
pub fn softmax_cross_entropy_backward(logits: &[f32], target: &[f32], d_logits: &mut [f32]) -> f32 {
    assert_eq!(
        logits.len(),
        target.len(),
        "pred len {} does not match target len {}",
        logits.len(),
        target.len()
    );
    assert_eq!(
        logits.len(),
        d_logits.len(),
        "pred len {} does not match d_pred len {}",
        logits.len(),
        d_logits.len()
    );
    assert!(
        !logits.is_empty(),
        "softmax_cross_entropy_backward requires at least 1 class"
    );

    let (log_sum_exp, max_logit) = log_sum_exp_and_max(logits);

    let mut sum_exp = 0.0_f32;
    for (d, &x) in d_logits.iter_mut().zip(logits) {
        *d = (x - max_logit).exp();
        sum_exp += *d;
    }
    let inv_sum = 1.0 / sum_exp;

    let mut loss = 0.0_f32;
    for ((d, &x), &t) in d_logits.iter_mut().zip(logits).zip(target) {
        if t != 0.0 {
            loss -= t * (x - log_sum_exp);
        }
        *d = *d * inv_sum - t;
    }
    loss
}

#[inline]
fn log_sum_exp_and_max(xs: &[f32]) -> (f32, f32) {
    let max_x = xs.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let sum_exp: f32 = xs.iter().map(|&x| (x - max_x).exp()).sum();
    (max_x + sum_exp.ln(), max_x)
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_abs_diff_eq;

    #[test]
    fn mse_is_zero_when_equal() {
        let pred = [1.0_f32, -2.0, 0.5];
        let target = pred;
        assert_eq!(mse(&pred, &target), 0.0);
    }

    #[test]
    fn mse_backward_matches_expected_gradient() {
        let pred = [1.0_f32, 3.0];
        let target = [2.0_f32, 1.0];
        let mut d_pred = [0.0_f32; 2];
        let loss = mse_backward(&pred, &target, &mut d_pred);

        // 0.5 * (1 + 4) / 2
        assert_abs_diff_eq!(loss, 1.25, epsilon = 1e-6);
        assert_abs_diff_eq!(d_pred[0], -0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(d_pred[1], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn softmax_cross_entropy_prefers_correct_class() {
        let logits_good = [5.0_f32, 0.0, -1.0];
        let logits_bad = [-1.0_f32, 0.0, 5.0];
        let target = [1.0_f32, 0.0, 0.0];
        let loss_good = softmax_cross_entropy(&logits_good, &target);
        let loss_bad = softmax_cross_entropy(&logits_bad, &target);
        assert!(loss_good < loss_bad);
    }

    #[test]
    fn uniform_logits_cost_ln_k() {
        let loss = Loss::SoftmaxCrossEntropy.forward(&[0.0; 8], &[1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0], 4);
        assert_abs_diff_eq!(loss, 4.0_f32.ln(), epsilon = 1e-6);
    }

    #[test]
    fn batched_cross_entropy_gradient_is_mean_of_rows() {
        let logits = [1.0_f32, -1.0, 0.5, 0.5];
        let target = [0.0_f32, 1.0, 1.0, 0.0];
        let mut d = [0.0_f32; 4];
        let loss = Loss::SoftmaxCrossEntropy.backward(&logits, &target, 2, &mut d);
        assert_abs_diff_eq!(loss, Loss::SoftmaxCrossEntropy.forward(&logits, &target, 2), epsilon = 1e-6);

        // Each row's gradient sums to zero and is halved by the batch mean.
        assert_abs_diff_eq!(d[0] + d[1], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(d[2], -0.25, epsilon = 1e-6);
        assert_abs_diff_eq!(d[3], 0.25, epsilon = 1e-6);
    }

    #[test]
    fn mse_batch_forward_matches_backward() {
        let pred = [0.5_f32, 1.5, -2.0, 0.0];
        let target = [0.0_f32, 1.0, -1.0, 1.0];
        let mut d = [0.0_f32; 4];
        let l = Loss::Mse.backward(&pred, &target, 2, &mut d);
        assert_abs_diff_eq!(l, Loss::Mse.forward(&pred, &target, 2), epsilon = 1e-7);
    }
}
