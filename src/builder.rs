//! Network builder.
//!
//! `DlraNetBuilder` is the recommended way to define a network.
//!
//! It makes the structure explicit (block sizes, initial ranks, activations)
//! and chooses a coupling initializer for each activation:
//!
//! - `tanh` / `sigmoid` / `identity`: Xavier/Glorot
//! - `relu` / `leaky relu`: He/Kaiming
//!
//! Rank bounds (`tolerance`, `rmax_total`) apply to every block added after
//! they are set.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::{Activation, BlockConfig, DlraNet, Error, Init, NetConfig, RankPolicy, Result};

#[derive(Debug, Clone)]
/// Builder for a `DlraNet`.
///
/// Example:
///
/// ```rust
/// use rust_dlra::{Activation, DlraNetBuilder};
///
/// # fn main() -> rust_dlra::Result<()> {
/// let net = DlraNetBuilder::new(8)?
///     .tolerance(0.1)?
///     .add_block(16, 4, Activation::ReLU)?
///     .add_block(2, 2, Activation::Identity)?
///     .build_with_seed(0)?;
/// assert_eq!(net.ranks(), vec![4, 2]);
/// # Ok(())
/// # }
/// ```
pub struct DlraNetBuilder {
    input_dim: usize,
    tolerance: f32,
    rmax_total: Option<usize>,
    blocks: Vec<BlockConfig>,
}

impl DlraNetBuilder {
    /// Start building a network that accepts inputs of length `input_dim`.
    pub fn new(input_dim: usize) -> Result<Self> {
        if input_dim == 0 {
            return Err(Error::InvalidConfig("input_dim must be > 0".to_owned()));
        }
        Ok(Self {
            input_dim,
            tolerance: crate::block::DEFAULT_TOLERANCE,
            rmax_total: None,
            blocks: Vec::new(),
        })
    }

    /// Energy fraction rank adaptation may discard, for blocks added next.
    pub fn tolerance(mut self, tolerance: f32) -> Result<Self> {
        RankPolicy::new(tolerance, 1)?;
        self.tolerance = tolerance;
        Ok(self)
    }

    /// Rank ceiling for blocks added next.
    ///
    /// Without one, each block is capped at `min(in_dim, out_dim)`.
    pub fn rmax_total(mut self, rmax_total: usize) -> Result<Self> {
        if rmax_total == 0 {
            return Err(Error::InvalidConfig("rmax_total must be > 0".to_owned()));
        }
        self.rmax_total = Some(rmax_total);
        Ok(self)
    }

    /// Add a block with `out_dim` outputs, starting at `rank`.
    pub fn add_block(self, out_dim: usize, rank: usize, activation: Activation) -> Result<Self> {
        let init = default_init_for_activation(activation);
        self.add_block_with_init(out_dim, rank, activation, init)
    }

    /// Add a block with an explicit coupling initializer.
    pub fn add_block_with_init(
        mut self,
        out_dim: usize,
        rank: usize,
        activation: Activation,
        init: Init,
    ) -> Result<Self> {
        let in_dim = self.next_in_dim();
        let cfg = BlockConfig {
            in_dim,
            out_dim,
            rank,
            tolerance: self.tolerance,
            rmax_total: self.rmax_total.unwrap_or(in_dim.min(out_dim)),
            activation,
            init,
        };
        cfg.validate()?;
        self.blocks.push(cfg);
        Ok(self)
    }

    /// Add a fully specified block. Its `in_dim` must chain.
    pub fn add_block_config(mut self, cfg: BlockConfig) -> Result<Self> {
        if cfg.in_dim != self.next_in_dim() {
            return Err(Error::InvalidConfig(format!(
                "block in_dim {} does not match previous out_dim {}",
                cfg.in_dim,
                self.next_in_dim()
            )));
        }
        cfg.validate()?;
        self.blocks.push(cfg);
        Ok(self)
    }

    /// The configuration this builder describes.
    pub fn config(&self, seed: u64) -> NetConfig {
        NetConfig::new(seed, self.blocks.clone())
    }

    /// Build using a deterministic seed.
    pub fn build_with_seed(self, seed: u64) -> Result<DlraNet> {
        let mut rng = StdRng::seed_from_u64(seed);
        self.build_with_rng(&mut rng)
    }

    /// Build using the provided RNG.
    pub fn build_with_rng<R: Rng + ?Sized>(self, rng: &mut R) -> Result<DlraNet> {
        if self.blocks.is_empty() {
            return Err(Error::InvalidConfig(
                "network must have at least one block".to_owned(),
            ));
        }
        DlraNet::from_configs(&self.blocks, rng)
    }

    fn next_in_dim(&self) -> usize {
        self.blocks.last().map_or(self.input_dim, |b| b.out_dim)
    }
}

#[inline]
fn default_init_for_activation(act: Activation) -> Init {
    match act {
        Activation::Tanh | Activation::Sigmoid | Activation::Identity => Init::Xavier,
        Activation::ReLU | Activation::LeakyReLU { .. } => Init::He,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chains_dims_and_applies_rank_bounds() {
        let b = DlraNetBuilder::new(10)
            .unwrap()
            .tolerance(0.2)
            .unwrap()
            .rmax_total(3)
            .unwrap()
            .add_block(8, 2, Activation::ReLU)
            .unwrap()
            .add_block(4, 1, Activation::Identity)
            .unwrap();

        let cfg = b.config(1);
        assert_eq!(cfg.blocks[1].in_dim, 8);
        assert_eq!(cfg.blocks[0].init, Init::He);
        assert!(cfg.blocks.iter().all(|c| c.rmax_total == 3 && c.tolerance == 0.2));

        let net = b.build_with_seed(1).unwrap();
        assert_eq!((net.input_dim(), net.output_dim()), (10, 4));
        assert_eq!(net.ranks(), vec![2, 1]);
    }

    #[test]
    fn rejects_rank_above_ceiling() {
        let err = DlraNetBuilder::new(6)
            .unwrap()
            .rmax_total(2)
            .unwrap()
            .add_block(6, 3, Activation::Tanh)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn rejects_bad_tolerance_and_empty_network() {
        assert!(DlraNetBuilder::new(2).unwrap().tolerance(1.5).is_err());
        assert!(DlraNetBuilder::new(0).is_err());
        assert!(DlraNetBuilder::new(2).unwrap().build_with_seed(0).is_err());
    }

    #[test]
    fn same_seed_same_network() {
        let build = || {
            DlraNetBuilder::new(5)
                .unwrap()
                .add_block(4, 2, Activation::Tanh)
                .unwrap()
                .build_with_seed(42)
                .unwrap()
        };
        let (a, b) = (build(), build());
        assert_eq!(a.blocks()[0].factor(), b.blocks()[0].factor());
    }
}
