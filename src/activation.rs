//! Activation functions.
//!
//! A block computes a pre-activation batch `Z = X Wᵗ + b` and applies the
//! activation element-wise in place: `Y = activation(Z)`.
//!
//! Only the post-activation output `Y` is cached. Backprop recovers
//! `dL/dZ` from `dL/dY` and `Y`, so no separate `Z` buffer is kept per phase.

use crate::{Error, Result};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
/// Element-wise activation applied after a block's affine map.
pub enum Activation {
    Tanh,
    #[cfg_attr(feature = "serde", serde(rename = "relu"))]
    ReLU,
    #[cfg_attr(feature = "serde", serde(rename = "leaky_relu"))]
    LeakyReLU {
        alpha: f32,
    },
    Sigmoid,
    /// Linear output, typical for the last block.
    #[default]
    Identity,
}

impl Activation {
    /// Validate activation parameters.
    pub fn validate(self) -> Result<()> {
        if let Activation::LeakyReLU { alpha } = self
            && !(alpha.is_finite() && alpha >= 0.0)
        {
            return Err(Error::InvalidConfig(format!(
                "leaky ReLU alpha must be finite and >= 0, got {alpha}"
            )));
        }
        Ok(())
    }

    /// Overwrite each pre-activation value with its activation.
    pub(crate) fn apply_in_place(self, z: &mut [f32]) {
        match self {
            Activation::Identity => {}
            Activation::Tanh => z.iter_mut().for_each(|v| *v = v.tanh()),
            Activation::ReLU => z.iter_mut().for_each(|v| *v = v.max(0.0)),
            Activation::LeakyReLU { alpha } => z.iter_mut().for_each(|v| {
                if *v <= 0.0 {
                    *v *= alpha;
                }
            }),
            Activation::Sigmoid => z.iter_mut().for_each(|v| *v = sigmoid(*v)),
        }
    }

    /// Turn `dL/dY` into `dL/dZ` in place, using the cached outputs `y`.
    pub(crate) fn backprop_in_place(self, y: &[f32], d: &mut [f32]) {
        debug_assert_eq!(y.len(), d.len());
        if self == Activation::Identity {
            return;
        }
        for (g, &out) in d.iter_mut().zip(y) {
            *g *= self.grad_from_output(out);
        }
    }

    #[inline]
    fn grad_from_output(self, y: f32) -> f32 {
        match self {
            Activation::Tanh => 1.0 - y * y,
            Activation::ReLU => {
                if y > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::LeakyReLU { alpha } => {
                if y > 0.0 {
                    1.0
                } else {
                    alpha
                }
            }
            Activation::Sigmoid => y * (1.0 - y),
            Activation::Identity => 1.0,
        }
    }
}

#[inline]
fn sigmoid(x: f32) -> f32 {
    // Numerically stable sigmoid.
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let z = x.exp();
        z / (1.0 + z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaky_relu_alpha_must_be_finite_and_non_negative() {
        assert!(
            Activation::LeakyReLU { alpha: f32::NAN }
                .validate()
                .is_err()
        );
        assert!(Activation::LeakyReLU { alpha: -0.1 }.validate().is_err());
        assert!(Activation::LeakyReLU { alpha: 0.1 }.validate().is_ok());
    }

    #[test]
    fn batch_apply_matches_scalar_definitions() {
        let mut z = [-2.0_f32, 0.0, 3.0];
        Activation::ReLU.apply_in_place(&mut z);
        assert_eq!(z, [0.0, 0.0, 3.0]);

        let mut z = [-2.0_f32, 3.0];
        Activation::LeakyReLU { alpha: 0.1 }.apply_in_place(&mut z);
        assert_eq!(z, [-0.2, 3.0]);

        let mut z = [0.0_f32, 10.0, -10.0];
        Activation::Sigmoid.apply_in_place(&mut z);
        assert!((z[0] - 0.5).abs() < 1e-6);
        assert!(z[1] > 0.999 && z[2] < 0.001);
    }

    #[test]
    fn backprop_scales_by_derivative_of_cached_output() {
        let mut y = [0.3_f32];
        Activation::Tanh.apply_in_place(&mut y);
        let mut d = [2.0_f32];
        Activation::Tanh.backprop_in_place(&y, &mut d);
        assert!((d[0] - 2.0 * (1.0 - y[0] * y[0])).abs() < 1e-6);

        let mut d = [1.0_f32, 1.0];
        Activation::ReLU.backprop_in_place(&[0.0, 2.0], &mut d);
        assert_eq!(d, [0.0, 1.0]);
    }
}
