//! Rank-adaptive low-rank layers.
//!
//! `rust-dlra` trains feed-forward networks whose weight matrices are stored
//! as `W = U S Vᵗ` with orthonormal `U`, `V` and a small coupling `S`. Training
//! uses a basis-update-and-Galerkin (BUG) integrator: every minibatch drives
//! each block through a K-step, an L-step and an S-step, after which the rank
//! is re-chosen from the singular values of the updated coupling.
//!
//! # Design goals
//!
//! - Explicit phases: the active [`Phase`] is an argument, never a hidden toggle.
//! - Clear contracts: shapes and step ordering are validated and reported as
//!   [`Error`] values.
//! - Reusable buffers: [`Scratch`] / [`Gradients`] / [`Trainer`] are allocated
//!   once and reused across steps.
//!
//! # Data layout and shapes
//!
//! - Scalars are `f32`.
//! - Batches are flat row-major buffers with the batch dimension first:
//!   - inputs: `(batch, input_dim)`
//!   - outputs: `(batch, output_dim)`
//! - A block mapping `n` inputs to `m` outputs at rank `r` stores `U: (m, r)`,
//!   `S: (r, r)`, `V: (n, r)` and a bias of length `m`.
//!
//! # Logging
//!
//! The crate logs through the [`log`] facade and never installs a logger:
//! `trace` per phase, `debug` on rank changes, `info` once per `fit` epoch.
//!
//! # MSRV
//!
//! This crate's minimum supported Rust version (MSRV) is specified in `Cargo.toml`.

//! # Quick start
//!
//! ```rust
//! use rust_dlra::{Activation, Dataset, DlraNetBuilder, FitConfig, Loss, Optimizer};
//!
//! # fn main() -> rust_dlra::Result<()> {
//! let xs: Vec<Vec<f32>> = (0..32).map(|i| vec![i as f32 / 32.0, 1.0 - i as f32 / 32.0]).collect();
//! let ys: Vec<Vec<f32>> = xs.iter().map(|x| vec![x[0] - x[1]]).collect();
//! let train = Dataset::from_rows(&xs, &ys)?;
//!
//! let mut net = DlraNetBuilder::new(2)?
//!     .tolerance(0.1)?
//!     .add_block(8, 2, Activation::Tanh)?
//!     .add_block(1, 1, Activation::Identity)?
//!     .build_with_seed(0)?;
//!
//! let report = net.fit(
//!     &train,
//!     None,
//!     &FitConfig {
//!         epochs: 5,
//!         lr: 1e-2,
//!         batch_size: 8,
//!         optimizer: Optimizer::adam(),
//!         loss: Loss::Mse,
//!     },
//! )?;
//! assert!(report.final_loss().is_finite());
//! # Ok(())
//! # }
//! ```

//! # Driving the integrator by hand
//!
//! ```rust
//! use rust_dlra::{Activation, DlraNetBuilder, Loss, Optimizer};
//!
//! # fn main() -> rust_dlra::Result<()> {
//! let mut net = DlraNetBuilder::new(3)?
//!     .add_block(4, 2, Activation::Tanh)?
//!     .add_block(2, 1, Activation::Identity)?
//!     .build_with_seed(0)?;
//!
//! let mut trainer = net.trainer(Optimizer::Sgd, Loss::Mse)?;
//! let x = [0.1_f32, -0.2, 0.3];
//! let t = [0.0_f32, 1.0];
//!
//! let step = net.train_step(&x, &t, 1, 1e-2, &mut trainer)?;
//! assert_eq!(step.ranks, net.ranks());
//! # Ok(())
//! # }
//! ```

pub mod activation;
pub mod block;
pub mod builder;
pub mod config;
pub mod data;
pub mod decompose;
pub mod error;
pub mod factor;
pub mod linalg;
pub mod loss;
pub(crate) mod matmul;
pub mod net;
pub mod optim;
pub mod phase;
pub mod rank;
pub mod train;

pub use activation::Activation;
pub use block::{BlockCache, BlockConfig, DlraBlock};
pub use builder::DlraNetBuilder;
pub use config::NetConfig;
pub use data::{Batch, Dataset};
pub use error::{Error, Result};
pub use factor::{Init, LowRankFactor};
pub use linalg::Matrix;
pub use loss::Loss;
pub use net::{DlraNet, Gradients, Scratch, StepReport, Trainer};
pub use optim::{Optimizer, OptimizerState};
pub use phase::{BlockGradients, GradientMask, Phase, Slot};
pub use rank::RankPolicy;
pub use train::{EpochReport, EvalReport, FitConfig, FitReport};
