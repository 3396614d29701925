//! Fit `y = x²` on `[-1, 1]` with a three-block rank-adaptive network and
//! print how loss and ranks evolve.
//!
//! Run with `cargo run --example quadratic_regression`.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use rust_dlra::{Activation, Dataset, DlraNetBuilder, FitConfig, Loss, Optimizer};

fn dataset(n: usize, seed: u64) -> rust_dlra::Result<Dataset> {
    let mut rng = StdRng::seed_from_u64(seed);
    let xs: Vec<f32> = (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let ys: Vec<f32> = xs.iter().map(|x| x * x).collect();
    Dataset::from_flat(xs, ys, 1, 1)
}

fn main() -> rust_dlra::Result<()> {
    let train = dataset(512, 0)?;
    let val = dataset(128, 1)?;

    let mut net = DlraNetBuilder::new(1)?
        .tolerance(0.05)?
        .rmax_total(16)?
        .add_block(32, 1, Activation::ReLU)?
        .add_block(32, 4, Activation::ReLU)?
        .add_block(1, 1, Activation::Identity)?
        .build_with_seed(42)?;

    let cfg = FitConfig {
        epochs: 30,
        lr: 1e-3,
        batch_size: 32,
        optimizer: Optimizer::adam(),
        loss: Loss::Mse,
    };
    let report = net.fit(&train, Some(&val), &cfg)?;

    for epoch in &report.epochs {
        let val_loss = epoch.val.map_or(f32::NAN, |v| v.loss);
        println!(
            "epoch {:>3}  train {:.6}  val {:.6}  ranks {:?}  params {}/{}",
            epoch.epoch + 1,
            epoch.train_loss,
            val_loss,
            epoch.ranks,
            epoch.param_count,
            net.dense_param_count()
        );
    }

    for x in [-0.9_f32, -0.5, 0.0, 0.5, 0.9] {
        let y = net.predict(&[x], 1)?;
        println!("f({x:+.1}) = {:.4} (target {:.4})", y[0], x * x);
    }
    Ok(())
}
