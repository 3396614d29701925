//! High-level training loop.
//!
//! `fit` runs one integrator step per minibatch, in dataset order, and logs an
//! epoch summary through the `log` facade. Evaluation always uses the
//! inference form, so it never touches the per-step state of a block.

use log::info;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{Dataset, DlraNet, Error, Loss, Optimizer, Phase, Result};

/// Samples per inference batch during evaluation.
const EVAL_BATCH: usize = 256;

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitConfig {
    pub epochs: usize,
    pub lr: f32,
    pub batch_size: usize,
    pub optimizer: Optimizer,
    pub loss: Loss,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            lr: 1e-3,
            batch_size: 32,
            optimizer: Optimizer::adam(),
            loss: Loss::Mse,
        }
    }
}

impl FitConfig {
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(Error::InvalidConfig("epochs must be > 0".to_owned()));
        }
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return Err(Error::InvalidConfig("lr must be finite and > 0".to_owned()));
        }
        if self.batch_size == 0 {
            return Err(Error::InvalidConfig("batch_size must be > 0".to_owned()));
        }
        self.optimizer.validate()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpochReport {
    pub epoch: usize,
    /// Sample-weighted mean of the pre-update step losses.
    pub train_loss: f32,
    pub val: Option<EvalReport>,
    /// Per-block ranks at the end of the epoch.
    pub ranks: Vec<usize>,
    pub param_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FitReport {
    pub epochs: Vec<EpochReport>,
}

impl FitReport {
    /// Training loss of the last epoch.
    pub fn final_loss(&self) -> f32 {
        self.epochs.last().map_or(f32::NAN, |e| e.train_loss)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalReport {
    pub loss: f32,
    /// Argmax accuracy; only reported for softmax cross-entropy.
    pub accuracy: Option<f32>,
}

impl DlraNet {
    /// Train on `train`, optionally evaluating `val` after every epoch.
    pub fn fit(&mut self, train: &Dataset, val: Option<&Dataset>, cfg: &FitConfig) -> Result<FitReport> {
        cfg.validate()?;
        self.check_dataset(train, "train")?;
        if let Some(val) = val {
            self.check_dataset(val, "val")?;
        }

        let mut trainer = self.trainer(cfg.optimizer, cfg.loss)?;
        let mut epochs = Vec::with_capacity(cfg.epochs);

        for epoch in 0..cfg.epochs {
            let mut total = 0.0_f32;
            for batch in train.batches(cfg.batch_size)? {
                let step = self.train_step(batch.inputs, batch.targets, batch.len, cfg.lr, &mut trainer)?;
                total += step.loss * batch.len as f32;
            }
            let train_loss = total / train.len() as f32;
            let val = val.map(|v| self.evaluate(v, cfg.loss)).transpose()?;
            let ranks = self.ranks();
            let param_count = self.param_count();

            match &val {
                Some(v) => info!(
                    "epoch {}/{}: train loss {train_loss:.6}, val loss {:.6}, ranks {ranks:?}, params {param_count}/{}",
                    epoch + 1,
                    cfg.epochs,
                    v.loss,
                    self.dense_param_count()
                ),
                None => info!(
                    "epoch {}/{}: train loss {train_loss:.6}, ranks {ranks:?}, params {param_count}/{}",
                    epoch + 1,
                    cfg.epochs,
                    self.dense_param_count()
                ),
            }

            epochs.push(EpochReport {
                epoch,
                train_loss,
                val,
                ranks,
                param_count,
            });
        }

        Ok(FitReport { epochs })
    }

    /// Mean loss (and accuracy for classification) over `data`.
    pub fn evaluate(&self, data: &Dataset, loss: Loss) -> Result<EvalReport> {
        self.check_dataset(data, "dataset")?;

        let out_dim = self.output_dim();
        let mut scratch = self.scratch();
        let mut total = 0.0_f32;
        let mut correct = 0_usize;

        for batch in data.batches(EVAL_BATCH)? {
            let y = self.forward(batch.inputs, batch.len, Phase::K, false, &mut scratch)?;
            total += loss.forward(y, batch.targets, out_dim) * batch.len as f32;
            if loss == Loss::SoftmaxCrossEntropy {
                correct += y
                    .chunks_exact(out_dim)
                    .zip(batch.targets.chunks_exact(out_dim))
                    .filter(|(p, t)| argmax(p) == argmax(t))
                    .count();
            }
        }

        let n = data.len() as f32;
        Ok(EvalReport {
            loss: total / n,
            accuracy: (loss == Loss::SoftmaxCrossEntropy).then(|| correct as f32 / n),
        })
    }

    fn check_dataset(&self, data: &Dataset, what: &str) -> Result<()> {
        if data.is_empty() {
            return Err(Error::InvalidData(format!("{what} dataset must not be empty")));
        }
        if data.input_dim() != self.input_dim() {
            return Err(Error::InvalidData(format!(
                "{what} input_dim {} does not match network input_dim {}",
                data.input_dim(),
                self.input_dim()
            )));
        }
        if data.target_dim() != self.output_dim() {
            return Err(Error::InvalidData(format!(
                "{what} target_dim {} does not match network output_dim {}",
                data.target_dim(),
                self.output_dim()
            )));
        }
        Ok(())
    }
}

fn argmax(xs: &[f32]) -> usize {
    xs.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &x)| if x > best.1 { (i, x) } else { best })
        .0
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{Activation, DlraNetBuilder};

    #[test]
    fn fit_config_validation() {
        assert!(FitConfig::default().validate().is_ok());
        let bad = FitConfig {
            batch_size: 0,
            ..FitConfig::default()
        };
        assert!(bad.validate().is_err());
        let bad = FitConfig {
            lr: -1.0,
            ..FitConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn fit_rejects_mismatched_dataset() {
        let mut net = DlraNetBuilder::new(3)
            .unwrap()
            .add_block(2, 1, Activation::Identity)
            .unwrap()
            .build_with_seed(0)
            .unwrap();
        let data = Dataset::from_flat(vec![0.0; 4], vec![0.0; 4], 2, 2).unwrap();
        let err = net.fit(&data, None, &FitConfig::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidData(_)));
    }

    #[test]
    fn evaluate_reports_accuracy_for_classification() {
        let net = DlraNetBuilder::new(2)
            .unwrap()
            .add_block(2, 2, Activation::Identity)
            .unwrap()
            .build_with_seed(1)
            .unwrap();
        let data = Dataset::from_flat(vec![1.0, 0.0, 0.0, 1.0], vec![1.0, 0.0, 0.0, 1.0], 2, 2).unwrap();

        let ce = net.evaluate(&data, Loss::SoftmaxCrossEntropy).unwrap();
        let acc = ce.accuracy.unwrap();
        assert!((0.0..=1.0).contains(&acc));

        let mse = net.evaluate(&data, Loss::Mse).unwrap();
        assert!(mse.accuracy.is_none());
    }

    #[test]
    fn argmax_picks_first_maximum() {
        assert_eq!(argmax(&[0.1, 0.9, 0.9]), 1);
        assert_eq!(argmax(&[3.0]), 0);
    }
}
