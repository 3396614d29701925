//! Rank-adaptive low-rank block.
//!
//! A [`DlraBlock`] computes `Y = activation(X Wᵗ + b)` with `W = U S Vᵗ` kept in
//! factored form. Training does not touch `W` directly. Each step drives the
//! block through a fixed sequence:
//!
//! 1. [`DlraBlock::k_step_preprocessing`]: `K = U S` becomes trainable.
//! 2. [`DlraBlock::l_step_preprocessing`]: `L = V Sᵗ` becomes trainable.
//! 3. K- and L-phase forward/backward/optimizer updates.
//! 4. [`DlraBlock::k_step_postprocessing_adapt`] /
//!    [`DlraBlock::l_step_postprocessing_adapt`]: `Ũ = qr([K | U])`,
//!    `Ṽ = qr([L | V])`, bases up to twice as wide.
//! 5. [`DlraBlock::s_step_preprocessing`]: the old coupling is expressed on the
//!    augmented bases, `S̃ = (Ũᵗ U) S (Ṽᵗ V)ᵗ`.
//! 6. S-phase forward/backward/optimizer update (`S̃` and the bias).
//! 7. [`DlraBlock::rank_adaption`]: truncated SVD of `S̃` picks the new rank.
//!
//! Out-of-order calls fail with [`Error::OrderingViolation`] instead of
//! silently desynchronizing the factor shapes.
//!
//! Batches are row-major `(batch, dim)` buffers, as everywhere in this crate.

use std::borrow::Cow;

use log::{debug, trace};
use rand::Rng;

use crate::decompose::{qr_thin, svd};
use crate::matmul::{View, gemm};
use crate::phase::{BlockGradients, Slot};
use crate::{Activation, Error, Init, LowRankFactor, Matrix, Phase, RankPolicy, Result};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Default discardable energy fraction.
pub const DEFAULT_TOLERANCE: f32 = 0.05;

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq)]
/// Shape, rank bounds and activation of one block.
pub struct BlockConfig {
    pub in_dim: usize,
    pub out_dim: usize,
    /// Initial rank.
    pub rank: usize,
    /// Fraction of squared singular-value energy rank adaptation may discard.
    pub tolerance: f32,
    /// Hard ceiling on the rank.
    pub rmax_total: usize,
    pub activation: Activation,
    pub init: Init,
}

impl BlockConfig {
    /// Config with the default tolerance, `rmax_total = min(in_dim, out_dim)`,
    /// identity activation and Xavier init.
    pub fn new(in_dim: usize, out_dim: usize, rank: usize) -> Self {
        Self {
            in_dim,
            out_dim,
            rank,
            tolerance: DEFAULT_TOLERANCE,
            rmax_total: in_dim.min(out_dim),
            activation: Activation::Identity,
            init: Init::Xavier,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.in_dim == 0 || self.out_dim == 0 {
            return Err(Error::InvalidConfig(format!(
                "block dims must be > 0, got in_dim={} out_dim={}",
                self.in_dim, self.out_dim
            )));
        }
        if self.rank == 0 || self.rank > self.in_dim.min(self.out_dim) {
            return Err(Error::InvalidConfig(format!(
                "initial rank must be in 1..={}, got {}",
                self.in_dim.min(self.out_dim),
                self.rank
            )));
        }
        if self.rmax_total < self.rank {
            return Err(Error::InvalidConfig(format!(
                "rmax_total {} is smaller than the initial rank {}",
                self.rmax_total, self.rank
            )));
        }
        RankPolicy::new(self.tolerance, self.rmax_total)?;
        self.activation.validate()
    }
}

/// Augmented basis `Ũ` (or `Ṽ`) and the map `Ũᵗ U_prev` into its frame.
#[derive(Debug, Clone)]
struct Augmented {
    basis: Matrix,
    transform: Matrix,
}

/// Transient per-step state. Empty between steps.
#[derive(Debug, Clone, Default)]
struct StepState {
    k: Option<Matrix>,
    l: Option<Matrix>,
    u_aug: Option<Augmented>,
    v_aug: Option<Augmented>,
    s_aug: Option<Matrix>,
}

#[derive(Debug, Clone)]
pub struct DlraBlock {
    factor: LowRankFactor,
    bias: Vec<f32>,
    activation: Activation,
    policy: RankPolicy,
    state: StepState,
}

/// Reusable forward/backward buffers for one block.
///
/// A cache only supports backprop if it was filled by a training-mode forward.
#[derive(Debug, Clone, Default)]
pub struct BlockCache {
    phase: Option<Phase>,
    batch: usize,
    /// Input projected onto the right factor.
    proj: Vec<f32>,
    hidden: Vec<f32>,
    aux: Vec<f32>,
    output: Vec<f32>,
}

impl BlockCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Post-activation output of the last forward, `(batch, out_dim)`.
    #[inline]
    pub fn output(&self) -> &[f32] {
        &self.output
    }

    #[inline]
    pub fn batch(&self) -> usize {
        self.batch
    }

    /// Phase recorded by the last training-mode forward.
    #[inline]
    pub fn recorded_phase(&self) -> Option<Phase> {
        self.phase
    }
}

impl DlraBlock {
    pub fn new_with_rng<R: Rng + ?Sized>(cfg: &BlockConfig, rng: &mut R) -> Result<Self> {
        cfg.validate()?;
        let factor = LowRankFactor::new_with_rng(cfg.in_dim, cfg.out_dim, cfg.rank, cfg.init, rng)?;
        let policy = RankPolicy::new(cfg.tolerance, cfg.rmax_total)?;
        Ok(Self {
            factor,
            bias: vec![0.0; cfg.out_dim],
            activation: cfg.activation,
            policy,
            state: StepState::default(),
        })
    }

    /// Assemble a block from an existing factor and bias.
    pub fn from_parts(
        factor: LowRankFactor,
        bias: Vec<f32>,
        activation: Activation,
        policy: RankPolicy,
    ) -> Result<Self> {
        if bias.len() != factor.out_dim() {
            return Err(Error::ShapeMismatch(format!(
                "bias length {} does not match out_dim {}",
                bias.len(),
                factor.out_dim()
            )));
        }
        if bias.iter().any(|b| !b.is_finite()) {
            return Err(Error::InvalidData(
                "bias must contain only finite values".to_owned(),
            ));
        }
        if policy.rmax_total() < factor.rank() {
            return Err(Error::InvalidConfig(format!(
                "rmax_total {} is smaller than the initial rank {}",
                policy.rmax_total(),
                factor.rank()
            )));
        }
        activation.validate()?;
        Ok(Self {
            factor,
            bias,
            activation,
            policy,
            state: StepState::default(),
        })
    }

    #[inline]
    pub fn in_dim(&self) -> usize {
        self.factor.in_dim()
    }

    #[inline]
    pub fn out_dim(&self) -> usize {
        self.factor.out_dim()
    }

    /// Current rank. Only changes in [`Self::rank_adaption`].
    #[inline]
    pub fn rank(&self) -> usize {
        self.factor.rank()
    }

    #[inline]
    pub fn factor(&self) -> &LowRankFactor {
        &self.factor
    }

    #[inline]
    pub fn bias(&self) -> &[f32] {
        &self.bias
    }

    #[inline]
    pub fn activation(&self) -> Activation {
        self.activation
    }

    #[inline]
    pub fn policy(&self) -> RankPolicy {
        self.policy
    }

    /// Stored scalars: factor plus bias.
    pub fn param_count(&self) -> usize {
        self.factor.param_count() + self.bias.len()
    }

    /// Trainable `K` between K-preprocessing and K-postprocessing.
    pub fn k_coefficient(&self) -> Option<&Matrix> {
        self.state.k.as_ref()
    }

    /// Trainable `L` between L-preprocessing and L-postprocessing.
    pub fn l_coefficient(&self) -> Option<&Matrix> {
        self.state.l.as_ref()
    }

    /// `Ũ` between K-postprocessing and rank adaptation.
    pub fn augmented_u(&self) -> Option<&Matrix> {
        self.state.u_aug.as_ref().map(|a| &a.basis)
    }

    /// `Ṽ` between L-postprocessing and rank adaptation.
    pub fn augmented_v(&self) -> Option<&Matrix> {
        self.state.v_aug.as_ref().map(|a| &a.basis)
    }

    /// `S̃` between S-preprocessing and rank adaptation.
    pub fn augmented_coupling(&self) -> Option<&Matrix> {
        self.state.s_aug.as_ref()
    }

    /// Expose `K₀ = U S` as the K-step's trainable coefficient.
    ///
    /// Calling this again before postprocessing resets `K` to the same value.
    pub fn k_step_preprocessing(&mut self) -> Result<()> {
        if self.state.u_aug.is_some() || self.state.s_aug.is_some() {
            return Err(Error::OrderingViolation(
                "k_step_preprocessing called after K postprocessing in the same step".to_owned(),
            ));
        }
        self.state.k = Some(self.factor.u().matmul(self.factor.s()));
        trace!("k-step preprocessed at rank {}", self.rank());
        Ok(())
    }

    /// Expose `L₀ = V Sᵗ` as the L-step's trainable coefficient.
    pub fn l_step_preprocessing(&mut self) -> Result<()> {
        if self.state.v_aug.is_some() || self.state.s_aug.is_some() {
            return Err(Error::OrderingViolation(
                "l_step_preprocessing called after L postprocessing in the same step".to_owned(),
            ));
        }
        self.state.l = Some(self.factor.v().matmul_t(self.factor.s()));
        trace!("l-step preprocessed at rank {}", self.rank());
        Ok(())
    }

    /// Augment the trained `K` with the current basis and re-orthonormalize.
    pub fn k_step_postprocessing_adapt(&mut self) -> Result<()> {
        let k = self.state.k.take().ok_or_else(|| {
            Error::OrderingViolation(
                "k_step_postprocessing_adapt called before k_step_preprocessing".to_owned(),
            )
        })?;
        let aug = augment(&k, self.factor.u())?;
        trace!("k-step augmented basis width {}", aug.basis.cols());
        self.state.u_aug = Some(aug);
        Ok(())
    }

    /// Augment the trained `L` with the current basis and re-orthonormalize.
    pub fn l_step_postprocessing_adapt(&mut self) -> Result<()> {
        let l = self.state.l.take().ok_or_else(|| {
            Error::OrderingViolation(
                "l_step_postprocessing_adapt called before l_step_preprocessing".to_owned(),
            )
        })?;
        let aug = augment(&l, self.factor.v())?;
        trace!("l-step augmented basis width {}", aug.basis.cols());
        self.state.v_aug = Some(aug);
        Ok(())
    }

    /// Embed the current coupling in the augmented frame: `S̃ = M S Nᵗ`.
    pub fn s_step_preprocessing(&mut self) -> Result<()> {
        if self.state.s_aug.is_some() {
            return Err(Error::OrderingViolation(
                "s_step_preprocessing called twice in one step".to_owned(),
            ));
        }
        let (Some(u_aug), Some(v_aug)) = (&self.state.u_aug, &self.state.v_aug) else {
            return Err(Error::OrderingViolation(
                "s_step_preprocessing requires both K and L postprocessing".to_owned(),
            ));
        };
        let s_aug = u_aug
            .transform
            .matmul(self.factor.s())
            .matmul_t(&v_aug.transform);
        trace!("s-step coupling {:?}", s_aug.shape());
        self.state.s_aug = Some(s_aug);
        Ok(())
    }

    /// Truncate the augmented factorization to the policy's rank.
    ///
    /// Returns the new rank. Clears all per-step state.
    pub fn rank_adaption(&mut self) -> Result<usize> {
        let (Some(u_aug), Some(v_aug), Some(s_aug)) =
            (&self.state.u_aug, &self.state.v_aug, &self.state.s_aug)
        else {
            return Err(Error::OrderingViolation(
                "rank_adaption called before s_step_preprocessing".to_owned(),
            ));
        };

        let dec = svd(s_aug)?;
        let old_rank = self.rank();
        let new_rank = self.policy.select_rank(&dec.singular_values, old_rank)?;
        let (u, s, v) = self
            .policy
            .truncate(&dec, &u_aug.basis, &v_aug.basis, new_rank)?;
        if u.cols() != new_rank || v.cols() != new_rank || s.shape() != (new_rank, new_rank) {
            return Err(Error::NumericalDegeneracy(format!(
                "truncation produced inconsistent shapes U {:?}, S {:?}, V {:?}",
                u.shape(),
                s.shape(),
                v.shape()
            )));
        }

        self.factor.replace(u, s, v);
        self.state = StepState::default();

        if new_rank != old_rank {
            debug!("rank adapted {old_rank} -> {new_rank}");
        }
        Ok(new_rank)
    }

    /// Drop a half-finished step. The factor and bias are kept as they are.
    pub fn discard_step(&mut self) {
        self.state = StepState::default();
    }

    /// Forward pass on a `(batch, in_dim)` input.
    ///
    /// `training` records what backprop needs in `cache`. With
    /// `training == false` the K phase falls back to `K₀ = U S` when no K
    /// coefficient is prepared, so inference never mutates the block.
    pub fn forward(
        &self,
        input: &[f32],
        batch: usize,
        phase: Phase,
        training: bool,
        cache: &mut BlockCache,
    ) -> Result<()> {
        self.check_input(input, batch)?;
        let (n, m) = (self.in_dim(), self.out_dim());
        let x = View::new(input, batch, n);

        cache.phase = None;
        cache.batch = batch;
        resize_zeroed(&mut cache.output, batch * m);

        match phase {
            Phase::K => {
                let k = self.k_operand(training)?;
                let v = self.factor.v();
                let r = v.cols();
                resize_zeroed(&mut cache.proj, batch * r);
                gemm(1.0, x, v.view(), 0.0, &mut cache.proj);
                let proj = View::new(&cache.proj, batch, r);
                gemm(1.0, proj, k.view().t(), 0.0, &mut cache.output);
            }
            Phase::L => {
                let l = self.l_operand(training)?;
                let u = self.factor.u();
                let r = l.cols();
                resize_zeroed(&mut cache.proj, batch * r);
                gemm(1.0, x, l.view(), 0.0, &mut cache.proj);
                let proj = View::new(&cache.proj, batch, r);
                gemm(1.0, proj, u.view().t(), 0.0, &mut cache.output);
            }
            Phase::S => {
                let (u_aug, s_aug, v_aug) = self.s_operands()?;
                let (wu, wv) = s_aug.shape();
                resize_zeroed(&mut cache.proj, batch * wv);
                gemm(1.0, x, v_aug.view(), 0.0, &mut cache.proj);
                resize_zeroed(&mut cache.hidden, batch * wu);
                let proj = View::new(&cache.proj, batch, wv);
                gemm(1.0, proj, s_aug.view().t(), 0.0, &mut cache.hidden);
                let hidden = View::new(&cache.hidden, batch, wu);
                gemm(1.0, hidden, u_aug.view().t(), 0.0, &mut cache.output);
            }
        }

        for row in cache.output.chunks_exact_mut(m) {
            for (z, b) in row.iter_mut().zip(&self.bias) {
                *z += b;
            }
        }
        self.activation.apply_in_place(&mut cache.output);

        if training {
            cache.phase = Some(phase);
        }
        Ok(())
    }

    /// Backward pass for the phase recorded in `cache`.
    ///
    /// - `d_output`: `dL/dY`, overwritten with `dL/dZ`
    /// - `d_input`: receives `dL/dX` when given
    /// - `grads`: overwritten with the full `(K, L, S, bias)` tuple; slots the
    ///   phase does not touch are explicit zeros. Masking is the caller's job.
    pub fn backward(
        &self,
        input: &[f32],
        cache: &mut BlockCache,
        d_output: &mut [f32],
        d_input: Option<&mut [f32]>,
        grads: &mut BlockGradients,
    ) -> Result<()> {
        let phase = cache.phase.ok_or_else(|| {
            Error::OrderingViolation("backward without a training-mode forward".to_owned())
        })?;
        let batch = cache.batch;
        let (n, m) = (self.in_dim(), self.out_dim());
        self.check_input(input, batch)?;
        if d_output.len() != batch * m {
            return Err(Error::ShapeMismatch(format!(
                "d_output length {} does not match batch * out_dim ({batch} * {m})",
                d_output.len()
            )));
        }
        if let Some(d) = &d_input
            && d.len() != batch * n
        {
            return Err(Error::ShapeMismatch(format!(
                "d_input length {} does not match batch * in_dim ({batch} * {n})",
                d.len()
            )));
        }

        self.activation.backprop_in_place(&cache.output, d_output);
        grads.reset(self.param_lens());

        let d_bias = grads.get_mut(Slot::Bias);
        for row in d_output.chunks_exact(m) {
            for (g, &dz) in d_bias.iter_mut().zip(row) {
                *g += dz;
            }
        }

        let x = View::new(input, batch, n);
        let dz = View::new(d_output, batch, m);

        match phase {
            Phase::K => {
                let k = self.state.k.as_ref().ok_or_else(|| stale(phase))?;
                let r = k.cols();
                check_cache_len(&cache.proj, batch * r, phase)?;

                // dK = dZᵗ (X V)
                let proj = View::new(&cache.proj, batch, r);
                gemm(1.0, dz.t(), proj, 0.0, grads.get_mut(Slot::K));

                if let Some(dx) = d_input {
                    resize_zeroed(&mut cache.hidden, batch * r);
                    gemm(1.0, dz, k.view(), 0.0, &mut cache.hidden);
                    let hidden = View::new(&cache.hidden, batch, r);
                    gemm(1.0, hidden, self.factor.v().view().t(), 0.0, dx);
                }
            }
            Phase::L => {
                let l = self.state.l.as_ref().ok_or_else(|| stale(phase))?;
                let r = l.cols();
                check_cache_len(&cache.proj, batch * r, phase)?;

                // dL = Xᵗ (dZ U)
                resize_zeroed(&mut cache.hidden, batch * r);
                gemm(1.0, dz, self.factor.u().view(), 0.0, &mut cache.hidden);
                let hidden = View::new(&cache.hidden, batch, r);
                gemm(1.0, x.t(), hidden, 0.0, grads.get_mut(Slot::L));

                if let Some(dx) = d_input {
                    gemm(1.0, hidden, l.view().t(), 0.0, dx);
                }
            }
            Phase::S => {
                let (u_aug, s_aug, v_aug) = self.s_operands()?;
                let (wu, wv) = s_aug.shape();
                check_cache_len(&cache.proj, batch * wv, phase)?;

                // dS̃ = (dZ Ũ)ᵗ (X Ṽ)
                resize_zeroed(&mut cache.hidden, batch * wu);
                gemm(1.0, dz, u_aug.view(), 0.0, &mut cache.hidden);
                let hidden = View::new(&cache.hidden, batch, wu);
                let proj = View::new(&cache.proj, batch, wv);
                gemm(1.0, hidden.t(), proj, 0.0, grads.get_mut(Slot::S));

                if let Some(dx) = d_input {
                    resize_zeroed(&mut cache.aux, batch * wv);
                    gemm(1.0, hidden, s_aug.view(), 0.0, &mut cache.aux);
                    let aux = View::new(&cache.aux, batch, wv);
                    gemm(1.0, aux, v_aug.view().t(), 0.0, dx);
                }
            }
        }

        Ok(())
    }

    /// Parameter buffer behind a gradient slot, if it exists right now.
    pub fn param(&self, slot: Slot) -> Option<&[f32]> {
        match slot {
            Slot::K => self.state.k.as_ref().map(Matrix::as_slice),
            Slot::L => self.state.l.as_ref().map(Matrix::as_slice),
            Slot::S => self.state.s_aug.as_ref().map(Matrix::as_slice),
            Slot::Bias => Some(&self.bias),
        }
    }

    pub(crate) fn param_mut(&mut self, slot: Slot) -> Option<&mut [f32]> {
        match slot {
            Slot::K => self.state.k.as_mut().map(Matrix::as_mut_slice),
            Slot::L => self.state.l.as_mut().map(Matrix::as_mut_slice),
            Slot::S => self.state.s_aug.as_mut().map(Matrix::as_mut_slice),
            Slot::Bias => Some(&mut self.bias),
        }
    }

    fn param_lens(&self) -> [usize; 4] {
        Slot::ALL.map(|slot| self.param(slot).map_or(0, <[f32]>::len))
    }

    fn check_input(&self, input: &[f32], batch: usize) -> Result<()> {
        if batch == 0 {
            return Err(Error::ShapeMismatch("batch must be > 0".to_owned()));
        }
        if input.len() != batch * self.in_dim() {
            return Err(Error::ShapeMismatch(format!(
                "input length {} does not match batch * in_dim ({batch} * {})",
                input.len(),
                self.in_dim()
            )));
        }
        Ok(())
    }

    fn k_operand(&self, training: bool) -> Result<Cow<'_, Matrix>> {
        match &self.state.k {
            Some(k) => Ok(Cow::Borrowed(k)),
            None if !training => Ok(Cow::Owned(self.factor.u().matmul(self.factor.s()))),
            None => Err(Error::OrderingViolation(
                "phase K forward before k_step_preprocessing".to_owned(),
            )),
        }
    }

    fn l_operand(&self, training: bool) -> Result<Cow<'_, Matrix>> {
        match &self.state.l {
            Some(l) => Ok(Cow::Borrowed(l)),
            None if !training => Ok(Cow::Owned(self.factor.v().matmul_t(self.factor.s()))),
            None => Err(Error::OrderingViolation(
                "phase L forward before l_step_preprocessing".to_owned(),
            )),
        }
    }

    fn s_operands(&self) -> Result<(&Matrix, &Matrix, &Matrix)> {
        match (&self.state.u_aug, &self.state.s_aug, &self.state.v_aug) {
            (Some(u), Some(s), Some(v)) => Ok((&u.basis, s, &v.basis)),
            _ => Err(Error::OrderingViolation(
                "phase S forward before s_step_preprocessing".to_owned(),
            )),
        }
    }
}

/// `Ũ, R = qr([coefficient | prev])`; `R`'s right block is `Ũᵗ prev`.
fn augment(coefficient: &Matrix, prev: &Matrix) -> Result<Augmented> {
    if !coefficient.is_finite() {
        return Err(Error::NumericalDegeneracy(
            "trained coefficient contains non-finite values".to_owned(),
        ));
    }
    let r = prev.cols();
    let qr = qr_thin(&coefficient.hcat(prev)?);
    let transform = qr.r.col_range(coefficient.cols(), coefficient.cols() + r);
    Ok(Augmented {
        basis: qr.q,
        transform,
    })
}

fn stale(phase: Phase) -> Error {
    Error::OrderingViolation(format!(
        "phase {phase} parameters changed between forward and backward"
    ))
}

fn check_cache_len(buf: &[f32], expected: usize, phase: Phase) -> Result<()> {
    if buf.len() != expected {
        return Err(stale(phase));
    }
    Ok(())
}

#[inline]
fn resize_zeroed(buf: &mut Vec<f32>, len: usize) {
    buf.clear();
    buf.resize(len, 0.0);
}
