//! Multi-block network composer.
//!
//! A [`DlraNet`] is an ordered list of [`DlraBlock`]s. It never owns factor
//! state itself; it only sequences block calls so that every block goes
//! through the same integrator phase at the same time.

use log::trace;
use rand::Rng;

use crate::phase::{BlockGradients, GradientMask};
use crate::{
    BlockCache, BlockConfig, DlraBlock, Error, Loss, Optimizer, OptimizerState, Phase, Result,
};

#[derive(Debug, Clone)]
pub struct DlraNet {
    blocks: Vec<DlraBlock>,
}

/// Reusable forward buffers, one [`BlockCache`] per block.
///
/// The output of the most recent forward pass lives inside `Scratch`.
#[derive(Debug, Clone)]
pub struct Scratch {
    caches: Vec<BlockCache>,
}

/// Per-block gradient tuples for one phase (overwrite semantics).
#[derive(Debug, Clone)]
pub struct Gradients {
    blocks: Vec<BlockGradients>,

    // Gradient w.r.t. each block output. The last entry is the loss gradient,
    // written by the caller through `d_output_mut`.
    d_block_outputs: Vec<Vec<f32>>,

    d_input: Vec<f32>,
}

/// Outcome of one full K → L → S → adapt cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    /// Loss of the K-phase forward, i.e. before any update in this step.
    pub loss: f32,
    /// Loss of the S-phase forward, after the K and L updates.
    pub s_loss: f32,
    /// Per-block ranks after adaptation.
    pub ranks: Vec<usize>,
}

impl DlraNet {
    /// Compose blocks in order. Adjacent dims must chain.
    pub fn from_blocks(blocks: Vec<DlraBlock>) -> Result<Self> {
        if blocks.is_empty() {
            return Err(Error::InvalidConfig(
                "network must have at least one block".to_owned(),
            ));
        }
        for (idx, pair) in blocks.windows(2).enumerate() {
            if pair[0].out_dim() != pair[1].in_dim() {
                return Err(Error::InvalidConfig(format!(
                    "block {idx} out_dim {} does not match block {} in_dim {}",
                    pair[0].out_dim(),
                    idx + 1,
                    pair[1].in_dim()
                )));
            }
        }
        Ok(Self { blocks })
    }

    /// Initialize one block per config, in order, drawing from `rng`.
    pub fn from_configs<R: Rng + ?Sized>(configs: &[BlockConfig], rng: &mut R) -> Result<Self> {
        let blocks = configs
            .iter()
            .map(|cfg| DlraBlock::new_with_rng(cfg, &mut *rng))
            .collect::<Result<Vec<_>>>()?;
        Self::from_blocks(blocks)
    }

    #[inline]
    pub fn input_dim(&self) -> usize {
        self.blocks[0].in_dim()
    }

    #[inline]
    pub fn output_dim(&self) -> usize {
        self.blocks[self.blocks.len() - 1].out_dim()
    }

    #[inline]
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    #[inline]
    pub fn block(&self, idx: usize) -> Option<&DlraBlock> {
        self.blocks.get(idx)
    }

    /// Mutable access for driving a block's step methods by hand.
    #[inline]
    pub fn block_mut(&mut self, idx: usize) -> Option<&mut DlraBlock> {
        self.blocks.get_mut(idx)
    }

    #[inline]
    pub fn blocks(&self) -> &[DlraBlock] {
        &self.blocks
    }

    #[inline]
    pub(crate) fn blocks_mut(&mut self) -> &mut [DlraBlock] {
        &mut self.blocks
    }

    /// Current rank of every block, in order.
    pub fn ranks(&self) -> Vec<usize> {
        self.blocks.iter().map(DlraBlock::rank).collect()
    }

    /// Stored scalars across all blocks (factors plus biases).
    pub fn param_count(&self) -> usize {
        self.blocks.iter().map(DlraBlock::param_count).sum()
    }

    /// Scalars a dense network of the same shape would store.
    pub fn dense_param_count(&self) -> usize {
        self.blocks
            .iter()
            .map(|b| b.out_dim() * (b.in_dim() + 1))
            .sum()
    }

    pub fn scratch(&self) -> Scratch {
        Scratch::new(self)
    }

    pub fn gradients(&self) -> Gradients {
        Gradients::new(self)
    }

    /// Allocate training buffers plus optimizer state.
    pub fn trainer(&self, optimizer: Optimizer, loss: Loss) -> Result<Trainer> {
        Trainer::new(self, optimizer, loss)
    }

    /// Forward pass for a `(batch, input_dim)` input in `phase`.
    ///
    /// Returns the final block output, `(batch, output_dim)`.
    pub fn forward<'a>(
        &self,
        input: &[f32],
        batch: usize,
        phase: Phase,
        training: bool,
        scratch: &'a mut Scratch,
    ) -> Result<&'a [f32]> {
        self.check_scratch(scratch)?;

        for (idx, block) in self.blocks.iter().enumerate() {
            // Borrow the previous output immutably and the current cache mutably.
            let (left, right) = scratch.caches.split_at_mut(idx);
            let layer_input = if idx == 0 { input } else { left[idx - 1].output() };
            block.forward(layer_input, batch, phase, training, &mut right[0])?;
        }

        Ok(scratch.output())
    }

    /// Inference on a `(batch, input_dim)` input. Never mutates the network.
    pub fn predict(&self, input: &[f32], batch: usize) -> Result<Vec<f32>> {
        let mut scratch = self.scratch();
        self.forward(input, batch, Phase::K, false, &mut scratch)
            .map(<[f32]>::to_vec)
    }

    /// Backward pass through every block, in reverse order.
    ///
    /// Call `forward` with `training == true` first, then write `dL/d(output)`
    /// into `grads.d_output_mut()`. Each block's gradient tuple is masked with
    /// the phase its cache recorded.
    pub fn backward(&self, input: &[f32], scratch: &mut Scratch, grads: &mut Gradients) -> Result<()> {
        self.check_scratch(scratch)?;
        if grads.blocks.len() != self.blocks.len() || grads.d_block_outputs.len() != self.blocks.len() {
            return Err(Error::ShapeMismatch(format!(
                "gradients hold {} blocks, network has {}",
                grads.blocks.len(),
                self.blocks.len()
            )));
        }

        for idx in (0..self.blocks.len()).rev() {
            let block = &self.blocks[idx];

            let (prev, rest) = scratch.caches.split_at_mut(idx);
            let cache = &mut rest[0];
            let layer_input = if idx == 0 { input } else { prev[idx - 1].output() };
            let phase = cache.recorded_phase().ok_or_else(|| {
                Error::OrderingViolation(format!("block {idx}: backward without a training forward"))
            })?;

            // `d_outputs` of block idx, and its `d_inputs` which are the
            // `d_outputs` of block idx - 1.
            let (left, right) = grads.d_block_outputs.split_at_mut(idx);
            let d_outputs = &mut right[0];
            let d_inputs: &mut [f32] = if idx == 0 {
                &mut grads.d_input
            } else {
                &mut left[idx - 1]
            };

            let block_grads = &mut grads.blocks[idx];
            block.backward(layer_input, cache, d_outputs, Some(d_inputs), block_grads)?;
            GradientMask::for_phase(phase).apply(block_grads);
        }

        Ok(())
    }

    /// One full integrator step on a minibatch.
    ///
    /// K and L gradients are both taken on the pre-update network, then
    /// applied in that order. The S phase runs on the augmented bases and is
    /// followed by rank adaptation. On error every block's half-finished step
    /// is discarded, so the network is left usable.
    pub fn train_step(
        &mut self,
        input: &[f32],
        target: &[f32],
        batch: usize,
        lr: f32,
        trainer: &mut Trainer,
    ) -> Result<StepReport> {
        if !(lr.is_finite() && lr > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "lr must be finite and > 0, got {lr}"
            )));
        }
        if target.len() != batch * self.output_dim() {
            return Err(Error::ShapeMismatch(format!(
                "target length {} does not match batch * output_dim ({batch} * {})",
                target.len(),
                self.output_dim()
            )));
        }

        let result = self.run_step(input, target, batch, lr, trainer);
        if result.is_err() {
            for block in &mut self.blocks {
                block.discard_step();
            }
        }
        result
    }

    fn run_step(
        &mut self,
        input: &[f32],
        target: &[f32],
        batch: usize,
        lr: f32,
        trainer: &mut Trainer,
    ) -> Result<StepReport> {
        let Trainer {
            scratch,
            grads_k,
            grads_l,
            optimizer,
            loss,
        } = trainer;

        for block in &mut self.blocks {
            block.k_step_preprocessing()?;
            block.l_step_preprocessing()?;
        }

        let loss_k = self.phase_gradients(input, target, batch, Phase::K, *loss, scratch, grads_k)?;
        self.phase_gradients(input, target, batch, Phase::L, *loss, scratch, grads_l)?;
        optimizer.apply(self, grads_k, lr)?;
        optimizer.apply(self, grads_l, lr)?;

        for block in &mut self.blocks {
            block.k_step_postprocessing_adapt()?;
            block.l_step_postprocessing_adapt()?;
            block.s_step_preprocessing()?;
        }

        let loss_s = self.phase_gradients(input, target, batch, Phase::S, *loss, scratch, grads_k)?;
        optimizer.apply(self, grads_k, lr)?;

        let mut ranks = Vec::with_capacity(self.blocks.len());
        for block in &mut self.blocks {
            ranks.push(block.rank_adaption()?);
        }

        trace!("step done: loss {loss_k} -> {loss_s}, ranks {ranks:?}");
        Ok(StepReport {
            loss: loss_k,
            s_loss: loss_s,
            ranks,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn phase_gradients(
        &self,
        input: &[f32],
        target: &[f32],
        batch: usize,
        phase: Phase,
        loss: Loss,
        scratch: &mut Scratch,
        grads: &mut Gradients,
    ) -> Result<f32> {
        self.forward(input, batch, phase, true, scratch)?;
        grads.prepare(self, batch);
        let value = loss.backward(scratch.output(), target, self.output_dim(), grads.d_output_mut());
        if !value.is_finite() {
            return Err(Error::NumericalDegeneracy(format!(
                "phase {phase} loss is not finite ({value})"
            )));
        }
        self.backward(input, scratch, grads)?;
        trace!("phase {phase}: loss {value}");
        Ok(value)
    }

    fn check_scratch(&self, scratch: &Scratch) -> Result<()> {
        if scratch.caches.len() != self.blocks.len() {
            return Err(Error::ShapeMismatch(format!(
                "scratch has {} block caches, network has {} blocks",
                scratch.caches.len(),
                self.blocks.len()
            )));
        }
        Ok(())
    }
}

/// Everything one training loop reuses across steps.
#[derive(Debug, Clone)]
pub struct Trainer {
    pub scratch: Scratch,
    /// K-phase gradients; reused for the S phase.
    pub grads_k: Gradients,
    pub grads_l: Gradients,
    pub optimizer: OptimizerState,
    pub loss: Loss,
}

impl Trainer {
    pub fn new(net: &DlraNet, optimizer: Optimizer, loss: Loss) -> Result<Self> {
        Ok(Self {
            scratch: Scratch::new(net),
            grads_k: Gradients::new(net),
            grads_l: Gradients::new(net),
            optimizer: optimizer.state(net)?,
            loss,
        })
    }
}

impl Scratch {
    pub fn new(net: &DlraNet) -> Self {
        Self {
            caches: vec![BlockCache::new(); net.num_blocks()],
        }
    }

    #[inline]
    pub fn output(&self) -> &[f32] {
        self.caches
            .last()
            .map(BlockCache::output)
            .unwrap_or_default()
    }

    #[inline]
    pub fn block(&self, idx: usize) -> Option<&BlockCache> {
        self.caches.get(idx)
    }
}

impl Gradients {
    pub fn new(net: &DlraNet) -> Self {
        Self {
            blocks: vec![BlockGradients::new(); net.num_blocks()],
            d_block_outputs: vec![Vec::new(); net.num_blocks()],
            d_input: Vec::new(),
        }
    }

    /// Size the activation-gradient buffers for a batch of `batch` samples.
    pub fn prepare(&mut self, net: &DlraNet, batch: usize) {
        self.blocks.resize_with(net.num_blocks(), BlockGradients::new);
        self.d_block_outputs.resize_with(net.num_blocks(), Vec::new);
        for (buf, block) in self.d_block_outputs.iter_mut().zip(net.blocks()) {
            buf.clear();
            buf.resize(batch * block.out_dim(), 0.0);
        }
        self.d_input.clear();
        self.d_input.resize(batch * net.input_dim(), 0.0);
    }

    /// Upstream gradient `dL/d(output)` for the final block.
    #[inline]
    pub fn d_output_mut(&mut self) -> &mut [f32] {
        self.d_block_outputs
            .last_mut()
            .map(Vec::as_mut_slice)
            .unwrap_or_default()
    }

    #[inline]
    pub fn d_input(&self) -> &[f32] {
        &self.d_input
    }

    #[inline]
    pub fn block(&self, idx: usize) -> &BlockGradients {
        &self.blocks[idx]
    }

    #[inline]
    pub(crate) fn block_mut(&mut self, idx: usize) -> &mut BlockGradients {
        &mut self.blocks[idx]
    }

    #[inline]
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use crate::phase::Slot;
    use crate::{Activation, DlraNetBuilder};

    fn net() -> DlraNet {
        DlraNetBuilder::new(4)
            .unwrap()
            .add_block(6, 2, Activation::Tanh)
            .unwrap()
            .add_block(3, 2, Activation::Identity)
            .unwrap()
            .build_with_seed(5)
            .unwrap()
    }

    fn sample(len: usize, seed: u64) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect()
    }

    fn assert_close(analytic: f32, numeric: f32) {
        let diff = (analytic - numeric).abs();
        let scale = analytic.abs().max(numeric.abs()).max(1.0);
        assert!(
            diff <= 1e-3 || diff / scale <= 1e-2,
            "analytic={analytic} numeric={numeric} diff={diff}"
        );
    }

    #[test]
    fn rejects_non_chaining_blocks() {
        let a = net();
        let blocks = vec![a.blocks()[1].clone(), a.blocks()[0].clone()];
        assert!(matches!(
            DlraNet::from_blocks(blocks),
            Err(Error::InvalidConfig(_))
        ));
        assert!(DlraNet::from_blocks(Vec::new()).is_err());
    }

    #[test]
    fn predict_does_not_mutate() {
        let n = net();
        let before = n.clone();
        let x = sample(2 * 4, 1);
        let y = n.predict(&x, 2).unwrap();
        assert_eq!(y.len(), 2 * 3);
        assert!(n.blocks()[0].k_coefficient().is_none());
        assert_eq!(n.ranks(), before.ranks());
    }

    #[test]
    fn backward_requires_training_forward() {
        let n = net();
        let x = sample(4, 2);
        let mut scratch = n.scratch();
        let mut grads = n.gradients();
        n.forward(&x, 1, Phase::K, false, &mut scratch).unwrap();
        grads.prepare(&n, 1);
        let err = n.backward(&x, &mut scratch, &mut grads).unwrap_err();
        assert!(matches!(err, Error::OrderingViolation(_)));
    }

    #[test]
    fn k_phase_masks_everything_but_k() {
        let mut n = net();
        for b in n.blocks_mut() {
            b.k_step_preprocessing().unwrap();
        }
        let x = sample(2 * 4, 3);
        let t = sample(2 * 3, 4);
        let mut scratch = n.scratch();
        let mut grads = n.gradients();
        n.phase_gradients(&x, &t, 2, Phase::K, Loss::Mse, &mut scratch, &mut grads)
            .unwrap();

        for idx in 0..n.num_blocks() {
            let g = grads.block(idx);
            assert!(g.is_live(Slot::K));
            assert!(g.get(Slot::K).iter().any(|&v| v != 0.0));
            assert!(!g.is_live(Slot::Bias));
            assert!(g.get(Slot::Bias).iter().all(|&v| v == 0.0));
        }
    }

    #[test]
    fn multi_block_gradients_match_numeric() {
        let mut n = net();
        for b in n.blocks_mut() {
            b.l_step_preprocessing().unwrap();
        }
        let batch = 2;
        let x = sample(batch * 4, 6);
        let t = sample(batch * 3, 7);
        let mut scratch = n.scratch();
        let mut grads = n.gradients();
        n.phase_gradients(&x, &t, batch, Phase::L, Loss::Mse, &mut scratch, &mut grads)
            .unwrap();

        let loss_at = |n: &DlraNet| {
            let mut s = n.scratch();
            let y = n.forward(&x, batch, Phase::L, true, &mut s).unwrap();
            Loss::Mse.forward(y, &t, 3)
        };

        let eps = 1e-3_f32;
        for idx in 0..n.num_blocks() {
            let len = n.blocks()[idx].param(Slot::L).unwrap().len();
            for p in 0..len {
                let orig = n.blocks()[idx].param(Slot::L).unwrap()[p];
                n.blocks_mut()[idx].param_mut(Slot::L).unwrap()[p] = orig + eps;
                let plus = loss_at(&n);
                n.blocks_mut()[idx].param_mut(Slot::L).unwrap()[p] = orig - eps;
                let minus = loss_at(&n);
                n.blocks_mut()[idx].param_mut(Slot::L).unwrap()[p] = orig;
                assert_close(grads.block(idx).get(Slot::L)[p], (plus - minus) / (2.0 * eps));
            }
        }
    }

    #[test]
    fn train_step_reports_ranks_and_clears_step_state() {
        let mut n = net();
        let mut trainer = n.trainer(Optimizer::Sgd, Loss::Mse).unwrap();
        let x = sample(4 * 4, 8);
        let t = sample(4 * 3, 9);
        let report = n.train_step(&x, &t, 4, 0.05, &mut trainer).unwrap();

        assert_eq!(report.ranks, n.ranks());
        assert!(report.loss.is_finite() && report.s_loss.is_finite());
        for b in n.blocks() {
            assert!(b.k_coefficient().is_none());
            assert!(b.augmented_coupling().is_none());
            assert!(b.factor().orthonormality_error() < 1e-4);
        }
    }

    #[test]
    fn failed_step_leaves_network_usable() {
        let mut n = net();
        let mut trainer = n.trainer(Optimizer::Sgd, Loss::Mse).unwrap();
        let x = sample(4, 10);
        let t = sample(3, 11);

        assert!(n.train_step(&x, &t, 1, f32::NAN, &mut trainer).is_err());
        assert!(n.train_step(&x[..3], &t, 1, 0.1, &mut trainer).is_err());
        assert!(n.blocks()[0].k_coefficient().is_none());
        assert!(n.train_step(&x, &t, 1, 0.1, &mut trainer).is_ok());
    }
}
