//! Orthonormal basis store.
//!
//! A [`LowRankFactor`] holds `W ≈ U S Vᵗ` for a block mapping `n` inputs to `m`
//! outputs:
//!
//! - `U`: `(m, r)` with orthonormal columns
//! - `S`: `(r, r)` coupling
//! - `V`: `(n, r)` with orthonormal columns
//!
//! Mutation is crate-private: only the integrator replaces the triple, and it
//! does so atomically so `U`, `S` and `V` always agree on the rank.

use rand::Rng;

use crate::decompose::qr_thin;
use crate::{Error, Matrix, Result};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Orthonormality slack accepted by [`LowRankFactor::from_parts`].
const ORTHONORMAL_TOL: f32 = 1e-3;

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Initialization of the coupling `S`; the bases are always random orthonormal.
pub enum Init {
    /// Core scaled so `U S Vᵗ` has Xavier/Glorot energy.
    #[default]
    Xavier,
    /// Core scaled so `U S Vᵗ` has He/Kaiming energy.
    He,
    /// All-zero coupling, i.e. an all-zero weight.
    Zeros,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LowRankFactor {
    u: Matrix,
    s: Matrix,
    v: Matrix,
}

impl LowRankFactor {
    /// Random orthonormal bases plus an `init`-scaled dense core.
    pub fn new_with_rng<R: Rng + ?Sized>(
        in_dim: usize,
        out_dim: usize,
        rank: usize,
        init: Init,
        rng: &mut R,
    ) -> Result<Self> {
        if in_dim == 0 || out_dim == 0 {
            return Err(Error::InvalidConfig(format!(
                "factor dims must be > 0, got in_dim={in_dim} out_dim={out_dim}"
            )));
        }
        if rank == 0 || rank > in_dim.min(out_dim) {
            return Err(Error::InvalidConfig(format!(
                "rank must be in 1..={}, got {rank}",
                in_dim.min(out_dim)
            )));
        }

        let u = random_orthonormal(out_dim, rank, rng);
        let v = random_orthonormal(in_dim, rank, rng);

        // ||U S Vᵗ||_F = ||S||_F, so match the expected Frobenius energy of a
        // dense init with the same fan-in/fan-out.
        let (m, n, r) = (out_dim as f32, in_dim as f32, rank as f32);
        let energy = match init {
            Init::Xavier => 2.0 * m * n / (m + n),
            Init::He => 2.0 * m,
            Init::Zeros => 0.0,
        };
        let limit = (3.0 * energy / (r * r)).sqrt();

        let mut s = Matrix::zeros(rank, rank);
        if limit > 0.0 {
            for v in s.as_mut_slice() {
                *v = rng.gen_range(-limit..limit);
            }
        }

        Ok(Self { u, s, v })
    }

    /// Assemble a factor from explicit parts.
    ///
    /// Checks that the shapes agree on one rank and that both bases have
    /// orthonormal columns.
    pub fn from_parts(u: Matrix, s: Matrix, v: Matrix) -> Result<Self> {
        let r = u.cols();
        if r == 0 || s.shape() != (r, r) || v.cols() != r {
            return Err(Error::ShapeMismatch(format!(
                "inconsistent factor shapes: U {:?}, S {:?}, V {:?}",
                u.shape(),
                s.shape(),
                v.shape()
            )));
        }
        if r > u.rows() || r > v.rows() {
            return Err(Error::ShapeMismatch(format!(
                "rank {r} exceeds basis height (U {:?}, V {:?})",
                u.shape(),
                v.shape()
            )));
        }
        if !(u.is_finite() && s.is_finite() && v.is_finite()) {
            return Err(Error::InvalidData(
                "factor contains non-finite values".to_owned(),
            ));
        }
        for (name, basis) in [("U", &u), ("V", &v)] {
            let err = basis.orthonormality_error();
            if err > ORTHONORMAL_TOL {
                return Err(Error::InvalidData(format!(
                    "{name} columns are not orthonormal (max |{name}ᵗ{name} - I| = {err})"
                )));
            }
        }
        Ok(Self { u, s, v })
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.s.rows()
    }

    #[inline]
    pub fn in_dim(&self) -> usize {
        self.v.rows()
    }

    #[inline]
    pub fn out_dim(&self) -> usize {
        self.u.rows()
    }

    #[inline]
    pub fn u(&self) -> &Matrix {
        &self.u
    }

    #[inline]
    pub fn s(&self) -> &Matrix {
        &self.s
    }

    #[inline]
    pub fn v(&self) -> &Matrix {
        &self.v
    }

    /// Dense `(m, n)` weight `U S Vᵗ`.
    pub fn dense_weight(&self) -> Matrix {
        self.u.matmul(&self.s).matmul_t(&self.v)
    }

    /// Number of stored scalars: `r (m + n + r)`.
    pub fn param_count(&self) -> usize {
        let r = self.rank();
        r * (self.out_dim() + self.in_dim() + r)
    }

    /// Worst orthonormality defect over both bases.
    pub fn orthonormality_error(&self) -> f32 {
        self.u
            .orthonormality_error()
            .max(self.v.orthonormality_error())
    }

    /// Swap in a new triple produced by rank adaptation.
    pub(crate) fn replace(&mut self, u: Matrix, s: Matrix, v: Matrix) {
        debug_assert_eq!(u.cols(), s.rows());
        debug_assert_eq!(s.rows(), s.cols());
        debug_assert_eq!(v.cols(), s.cols());
        debug_assert_eq!(u.rows(), self.u.rows());
        debug_assert_eq!(v.rows(), self.v.rows());
        self.u = u;
        self.s = s;
        self.v = v;
    }
}

fn random_orthonormal<R: Rng + ?Sized>(rows: usize, cols: usize, rng: &mut R) -> Matrix {
    let mut a = Matrix::zeros(rows, cols);
    for v in a.as_mut_slice() {
        *v = rng.gen_range(-1.0..1.0);
    }
    qr_thin(&a).q
}
