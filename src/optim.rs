//! Optimizers.
//!
//! An optimizer updates the trainable tensors a [`Gradients`] set marks live:
//! `K` after the K phase, `L` after the L phase, `S̃` and the bias after the S
//! phase. Masked slots are skipped entirely, so neither the parameter nor its
//! accumulators move.
//!
//! - Optimizer *state* (momentum/Adam moments) lives outside the model.
//! - State is kept per tensor, i.e. per `(block, slot)`, with its own step
//!   counter. The integrator rebuilds `K`, `L` and `S̃` every step and their
//!   shapes follow the rank; a tensor whose length changed starts over from
//!   zeroed accumulators.

use log::trace;

use crate::phase::Slot;
use crate::{DlraNet, Error, Gradients, Result};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
/// Optimizer choice for training.
pub enum Optimizer {
    /// Plain SGD.
    #[default]
    Sgd,
    /// SGD with momentum.
    SgdMomentum { momentum: f32 },
    /// Adam (bias-corrected).
    Adam { beta1: f32, beta2: f32, eps: f32 },
}

impl Optimizer {
    /// Adam with the usual `(0.9, 0.999, 1e-8)` hyperparameters.
    pub const fn adam() -> Self {
        Optimizer::Adam {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }

    /// Validate optimizer hyperparameters.
    pub fn validate(self) -> Result<()> {
        match self {
            Optimizer::Sgd => Ok(()),
            Optimizer::SgdMomentum { momentum } => {
                if !(momentum.is_finite() && (0.0..1.0).contains(&momentum)) {
                    return Err(Error::InvalidConfig(format!(
                        "momentum must be finite and in [0,1), got {momentum}"
                    )));
                }
                Ok(())
            }
            Optimizer::Adam { beta1, beta2, eps } => {
                if !(beta1.is_finite() && (0.0..1.0).contains(&beta1)) {
                    return Err(Error::InvalidConfig(format!(
                        "adam beta1 must be finite and in [0,1), got {beta1}"
                    )));
                }
                if !(beta2.is_finite() && (0.0..1.0).contains(&beta2)) {
                    return Err(Error::InvalidConfig(format!(
                        "adam beta2 must be finite and in [0,1), got {beta2}"
                    )));
                }
                if !(eps.is_finite() && eps > 0.0) {
                    return Err(Error::InvalidConfig(format!(
                        "adam eps must be finite and > 0, got {eps}"
                    )));
                }
                Ok(())
            }
        }
    }

    /// Allocate optimizer state for `net`.
    pub fn state(self, net: &DlraNet) -> Result<OptimizerState> {
        self.validate()?;
        Ok(OptimizerState {
            optimizer: self,
            tensors: vec![Default::default(); net.num_blocks()],
        })
    }
}

/// Accumulators of one tensor.
#[derive(Debug, Clone, Default)]
struct TensorState {
    /// Momentum velocity or Adam first moment.
    m: Vec<f32>,
    /// Adam second moment.
    v: Vec<f32>,
    t: u64,
}

#[derive(Debug, Clone)]
/// Owned optimizer state.
pub struct OptimizerState {
    optimizer: Optimizer,
    tensors: Vec<[TensorState; 4]>,
}

impl OptimizerState {
    #[inline]
    pub fn optimizer(&self) -> Optimizer {
        self.optimizer
    }

    /// Forget all accumulators.
    pub fn reset(&mut self) {
        for block in &mut self.tensors {
            *block = Default::default();
        }
    }

    /// Apply one optimizer step to every live gradient slot.
    ///
    /// `lr` is passed in from the training loop.
    pub fn apply(&mut self, net: &mut DlraNet, grads: &Gradients, lr: f32) -> Result<()> {
        if !(lr.is_finite() && lr > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "lr must be finite and > 0, got {lr}"
            )));
        }
        if grads.num_blocks() != net.num_blocks() {
            return Err(Error::ShapeMismatch(format!(
                "gradients hold {} blocks, network has {}",
                grads.num_blocks(),
                net.num_blocks()
            )));
        }
        self.tensors.resize_with(net.num_blocks(), Default::default);

        let optimizer = self.optimizer;
        for (idx, block) in net.blocks_mut().iter_mut().enumerate() {
            let block_grads = grads.block(idx);
            for slot in Slot::ALL {
                let g = block_grads.get(slot);
                if !block_grads.is_live(slot) || g.is_empty() {
                    continue;
                }
                let param = block.param_mut(slot).ok_or_else(|| {
                    Error::OrderingViolation(format!(
                        "block {idx}: live {slot:?} gradient but the parameter is not prepared"
                    ))
                })?;
                if param.len() != g.len() {
                    return Err(Error::ShapeMismatch(format!(
                        "block {idx}: {slot:?} gradient length {} does not match parameter length {}",
                        g.len(),
                        param.len()
                    )));
                }
                let state = &mut self.tensors[idx][slot.index()];
                if state.m.len() != g.len() && state.t > 0 {
                    trace!("block {idx}: {slot:?} reshaped, resetting accumulators");
                }
                tensor_step(optimizer, state, param, g, lr);
            }
        }
        Ok(())
    }
}

fn tensor_step(optimizer: Optimizer, state: &mut TensorState, param: &mut [f32], g: &[f32], lr: f32) {
    if state.m.len() != g.len() {
        state.m.clear();
        state.m.resize(g.len(), 0.0);
        state.v.clear();
        state.t = 0;
    }
    state.t += 1;

    match optimizer {
        Optimizer::Sgd => {
            for (p, &g) in param.iter_mut().zip(g) {
                *p -= lr * g;
            }
        }
        Optimizer::SgdMomentum { momentum } => {
            for ((p, v), &g) in param.iter_mut().zip(&mut state.m).zip(g) {
                *v = momentum * *v + g;
                *p -= lr * *v;
            }
        }
        Optimizer::Adam { beta1, beta2, eps } => {
            state.v.resize(g.len(), 0.0);
            let t = i32::try_from(state.t).unwrap_or(i32::MAX);
            let corr1 = 1.0 - beta1.powi(t);
            let corr2 = 1.0 - beta2.powi(t);
            for (((p, m), v), &g) in param
                .iter_mut()
                .zip(&mut state.m)
                .zip(&mut state.v)
                .zip(g)
            {
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * (g * g);
                let m_hat = *m / corr1;
                let v_hat = *v / corr2;
                *p -= lr * m_hat / (v_hat.sqrt() + eps);
            }
        }
    }
}
