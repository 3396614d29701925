//! Contiguous dataset helpers.
//!
//! `Dataset` stores inputs and targets row-major with the batch dimension
//! first, which is exactly the layout every forward/backward call consumes.
//! [`Dataset::batches`] hands out in-order minibatches as borrowed slices.

use crate::{Error, Result};

/// A supervised dataset: inputs (X) and targets (Y).
///
/// - `inputs.len() == len * input_dim`
/// - `targets.len() == len * target_dim`
#[derive(Debug, Clone)]
pub struct Dataset {
    inputs: Vec<f32>,
    targets: Vec<f32>,
    len: usize,
    input_dim: usize,
    target_dim: usize,
}

/// One minibatch borrowed from a [`Dataset`].
#[derive(Debug, Clone, Copy)]
pub struct Batch<'a> {
    pub inputs: &'a [f32],
    pub targets: &'a [f32],
    pub len: usize,
}

impl Dataset {
    /// Build a dataset from flat buffers.
    ///
    /// `inputs` is `(len, input_dim)` and `targets` is `(len, target_dim)`.
    pub fn from_flat(
        inputs: Vec<f32>,
        targets: Vec<f32>,
        input_dim: usize,
        target_dim: usize,
    ) -> Result<Self> {
        if input_dim == 0 {
            return Err(Error::InvalidData("input_dim must be > 0".to_owned()));
        }
        if target_dim == 0 {
            return Err(Error::InvalidData("target_dim must be > 0".to_owned()));
        }
        if !inputs.len().is_multiple_of(input_dim) {
            return Err(Error::InvalidData(format!(
                "inputs length {} is not divisible by input_dim {input_dim}",
                inputs.len()
            )));
        }

        let len = inputs.len() / input_dim;
        if targets.len() != len * target_dim {
            return Err(Error::InvalidData(format!(
                "targets length {} does not match len * target_dim ({len} * {target_dim})",
                targets.len()
            )));
        }
        if inputs.iter().chain(&targets).any(|v| !v.is_finite()) {
            return Err(Error::InvalidData(
                "dataset must contain only finite values".to_owned(),
            ));
        }

        Ok(Self {
            inputs,
            targets,
            len,
            input_dim,
            target_dim,
        })
    }

    /// Build a dataset from per-sample rows (copies into contiguous storage).
    pub fn from_rows(inputs: &[Vec<f32>], targets: &[Vec<f32>]) -> Result<Self> {
        if inputs.len() != targets.len() {
            return Err(Error::InvalidData(format!(
                "inputs/targets length mismatch: {} vs {}",
                inputs.len(),
                targets.len()
            )));
        }
        if inputs.is_empty() {
            return Err(Error::InvalidData("dataset must not be empty".to_owned()));
        }

        let input_dim = inputs[0].len();
        let target_dim = targets[0].len();
        let inputs = flatten(inputs, input_dim, "input")?;
        let targets = flatten(targets, target_dim, "target")?;
        Self::from_flat(inputs, targets, input_dim, target_dim)
    }

    #[inline]
    /// Returns the number of samples.
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    /// Returns true if there are no samples.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    #[inline]
    pub fn target_dim(&self) -> usize {
        self.target_dim
    }

    /// All inputs, `(len, input_dim)`.
    #[inline]
    pub fn inputs(&self) -> &[f32] {
        &self.inputs
    }

    /// All targets, `(len, target_dim)`.
    #[inline]
    pub fn targets(&self) -> &[f32] {
        &self.targets
    }

    #[inline]
    /// Returns the `idx`-th input row.
    ///
    /// Panics if `idx >= len`.
    pub fn input(&self, idx: usize) -> &[f32] {
        let start = idx * self.input_dim;
        &self.inputs[start..start + self.input_dim]
    }

    #[inline]
    /// Returns the `idx`-th target row.
    ///
    /// Panics if `idx >= len`.
    pub fn target(&self, idx: usize) -> &[f32] {
        let start = idx * self.target_dim;
        &self.targets[start..start + self.target_dim]
    }

    /// In-order minibatches of at most `batch_size` samples.
    ///
    /// The last batch is shorter when `len` is not a multiple of `batch_size`.
    pub fn batches(&self, batch_size: usize) -> Result<impl Iterator<Item = Batch<'_>> + '_> {
        if batch_size == 0 {
            return Err(Error::InvalidConfig("batch_size must be > 0".to_owned()));
        }
        let target_dim = self.target_dim;
        Ok(self
            .inputs
            .chunks(batch_size * self.input_dim)
            .zip(self.targets.chunks(batch_size * target_dim))
            .map(move |(inputs, targets)| Batch {
                inputs,
                targets,
                len: targets.len() / target_dim,
            }))
    }
}

fn flatten(rows: &[Vec<f32>], dim: usize, what: &str) -> Result<Vec<f32>> {
    if dim == 0 {
        return Err(Error::InvalidData(format!("{what}_dim must be > 0")));
    }
    let mut flat = Vec::with_capacity(rows.len() * dim);
    for (i, row) in rows.iter().enumerate() {
        if row.len() != dim {
            return Err(Error::InvalidData(format!(
                "{what} row {i} has len {}, expected {dim}",
                row.len()
            )));
        }
        flat.extend_from_slice(row);
    }
    Ok(flat)
}
