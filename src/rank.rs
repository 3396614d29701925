//! Rank adaptation policy.
//!
//! After the S-step the coupling lives on augmented bases of width up to `2r`.
//! The policy picks the new rank from the singular values of that coupling:
//! the smallest `r'` whose discarded squared singular values sum to at most
//! `tolerance` times the total squared energy, bounded by
//! `1 <= r' <= min(len, rmax_total)`.

use crate::decompose::Svd;
use crate::{Error, Matrix, Result};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankPolicy {
    tolerance: f32,
    rmax_total: usize,
}

impl RankPolicy {
    /// `tolerance` must lie in `[0, 1)` and `rmax_total` must be positive.
    pub fn new(tolerance: f32, rmax_total: usize) -> Result<Self> {
        let policy = Self {
            tolerance,
            rmax_total,
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.tolerance.is_finite() && (0.0..1.0).contains(&self.tolerance)) {
            return Err(Error::InvalidConfig(format!(
                "tolerance must be finite and in [0,1), got {}",
                self.tolerance
            )));
        }
        if self.rmax_total == 0 {
            return Err(Error::InvalidConfig("rmax_total must be > 0".to_owned()));
        }
        Ok(())
    }

    #[inline]
    pub fn tolerance(&self) -> f32 {
        self.tolerance
    }

    #[inline]
    pub fn rmax_total(&self) -> usize {
        self.rmax_total
    }

    /// New rank for descending `singular_values`.
    ///
    /// - `tolerance == 0` keeps every direction up to `rmax_total`.
    /// - an exactly zero spectrum carries no information either way, so
    ///   `current_rank` is kept (within bounds).
    pub fn select_rank(&self, singular_values: &[f32], current_rank: usize) -> Result<usize> {
        if singular_values.is_empty() {
            return Err(Error::NumericalDegeneracy(
                "rank selection on an empty spectrum".to_owned(),
            ));
        }
        if singular_values.iter().any(|s| !s.is_finite() || *s < 0.0) {
            return Err(Error::NumericalDegeneracy(format!(
                "singular values must be finite and non-negative, got {singular_values:?}"
            )));
        }
        debug_assert!(singular_values.windows(2).all(|w| w[0] >= w[1]));

        let cap = singular_values.len().min(self.rmax_total);
        if self.tolerance == 0.0 {
            return Ok(cap);
        }

        let energies: Vec<f64> = singular_values
            .iter()
            .map(|&s| f64::from(s) * f64::from(s))
            .collect();
        let total: f64 = energies.iter().sum();
        if total == 0.0 {
            return Ok(current_rank.clamp(1, cap));
        }

        let budget = f64::from(self.tolerance) * total;
        // tail = energy discarded when keeping `keep` directions.
        let mut tail = 0.0_f64;
        let mut keep = energies.len();
        while keep > 0 {
            let next_tail = tail + energies[keep - 1];
            if next_tail > budget {
                break;
            }
            tail = next_tail;
            keep -= 1;
        }

        Ok(keep.clamp(1, cap))
    }

    /// Slice an SVD of the augmented coupling down to `rank`.
    ///
    /// Returns `(Ũ P_r, diag(σ_r), Ṽ Q_r)`.
    pub fn truncate(
        &self,
        svd: &Svd,
        u_aug: &Matrix,
        v_aug: &Matrix,
        rank: usize,
    ) -> Result<(Matrix, Matrix, Matrix)> {
        let available = svd.singular_values.len();
        if rank == 0 || rank > available {
            return Err(Error::NumericalDegeneracy(format!(
                "cannot truncate {available} singular directions to rank {rank}"
            )));
        }
        if u_aug.cols() != svd.u.rows() || v_aug.cols() != svd.v.rows() {
            return Err(Error::ShapeMismatch(format!(
                "augmented bases {:?}/{:?} do not match coupling svd {:?}/{:?}",
                u_aug.shape(),
                v_aug.shape(),
                svd.u.shape(),
                svd.v.shape()
            )));
        }

        let u = u_aug.matmul(&svd.u.leading_cols(rank));
        let s = Matrix::from_diag(&svd.singular_values[..rank]);
        let v = v_aug.matmul(&svd.v.leading_cols(rank));
        Ok((u, s, v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    use crate::decompose::{qr_thin, svd};

    #[test]
    fn rejects_out_of_range_tolerance() {
        assert!(RankPolicy::new(1.0, 4).is_err());
        assert!(RankPolicy::new(-0.1, 4).is_err());
        assert!(RankPolicy::new(f32::NAN, 4).is_err());
        assert!(RankPolicy::new(0.5, 0).is_err());
        assert!(RankPolicy::new(0.0, 4).is_ok());
    }

    #[test]
    fn small_tail_is_discarded() {
        let policy = RankPolicy::new(0.01, 10).unwrap();
        let r = policy.select_rank(&[5.0, 3.0, 0.001, 0.0001], 2).unwrap();
        assert_eq!(r, 2);
    }

    #[test]
    fn zero_tolerance_is_capped_by_rmax_total() {
        let policy = RankPolicy::new(0.0, 3).unwrap();
        let r = policy.select_rank(&[10.0; 8], 4).unwrap();
        assert_eq!(r, 3);

        let wide = RankPolicy::new(0.0, 100).unwrap();
        assert_eq!(wide.select_rank(&[10.0; 8], 4).unwrap(), 8);
    }

    #[test]
    fn noise_spectrum_shrinks_to_one_not_zero() {
        let policy = RankPolicy::new(0.5, 8).unwrap();
        let r = policy.select_rank(&[1e-7, 0.0, 0.0, 0.0], 2).unwrap();
        assert_eq!(r, 1);
    }

    #[test]
    fn exact_zero_spectrum_keeps_current_rank() {
        let policy = RankPolicy::new(0.5, 4).unwrap();
        assert_eq!(policy.select_rank(&[0.0; 4], 2).unwrap(), 2);
        assert_eq!(policy.select_rank(&[0.0; 2], 3).unwrap(), 2);
    }

    #[test]
    fn non_finite_spectrum_is_degenerate() {
        let policy = RankPolicy::new(0.1, 4).unwrap();
        assert!(matches!(
            policy.select_rank(&[f32::NAN, 1.0], 1),
            Err(Error::NumericalDegeneracy(_))
        ));
    }

    #[test]
    fn truncation_keeps_orthonormal_bases_of_any_frame() {
        let s_aug = Matrix::from_diag(&[5.0, 3.0, 0.001, 0.0001]);
        let dec = svd(&s_aug).unwrap();

        let mut basis = Matrix::zeros(6, 4);
        for (i, v) in basis.as_mut_slice().iter_mut().enumerate() {
            *v = ((i * 7 % 11) as f32 - 5.0) / 5.0;
        }
        let u_aug = qr_thin(&basis).q;
        let v_aug = Matrix::identity(4);

        let policy = RankPolicy::new(0.01, 4).unwrap();
        let r = policy.select_rank(&dec.singular_values, 4).unwrap();
        let (u, s, v) = policy.truncate(&dec, &u_aug, &v_aug, r).unwrap();

        assert_eq!(r, 2);
        assert_eq!((u.cols(), s.rows(), s.cols(), v.cols()), (2, 2, 2, 2));
        assert!(u.orthonormality_error() < 1e-5);
        assert!(v.orthonormality_error() < 1e-5);
        assert!((s.get(0, 0) - 5.0).abs() < 1e-5);
        assert!((s.get(1, 1) - 3.0).abs() < 1e-5);
    }

    proptest! {
        #[test]
        fn prop_selected_rank_is_within_bounds(
            mut values in proptest::collection::vec(0.0f32..100.0, 1..12),
            tolerance in 0.0f32..0.99,
            rmax in 1usize..16,
            current in 1usize..16,
        ) {
            values.sort_by(|a, b| b.total_cmp(a));
            let policy = RankPolicy::new(tolerance, rmax).unwrap();
            let r = policy.select_rank(&values, current).unwrap();
            prop_assert!(r >= 1);
            prop_assert!(r <= rmax.min(values.len()));
        }

        #[test]
        fn prop_discarded_energy_within_budget_when_uncapped(
            mut values in proptest::collection::vec(0.01f32..100.0, 1..12),
            tolerance in 0.0f32..0.99,
        ) {
            values.sort_by(|a, b| b.total_cmp(a));
            let policy = RankPolicy::new(tolerance, 64).unwrap();
            let r = policy.select_rank(&values, 1).unwrap();
            let total: f64 = values.iter().map(|&s| f64::from(s).powi(2)).sum();
            let tail: f64 = values[r..].iter().map(|&s| f64::from(s).powi(2)).sum();
            prop_assert!(tail <= f64::from(tolerance) * total + 1e-9);
        }
    }
}
