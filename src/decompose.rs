//! Matrix decompositions used by the integrator.
//!
//! - [`qr_thin`]: Householder QR, used to re-orthonormalize augmented bases.
//! - [`svd`]: one-sided (Hestenes) Jacobi SVD, used by rank adaptation.
//!
//! Both operate on `f32` matrices but accumulate in `f64`; the matrices
//! involved are at most `2 * rmax_total` wide, where Jacobi is cheap and
//! accurate.

use crate::{Error, Matrix, Result};

const JACOBI_EPS: f64 = 1e-12;
const JACOBI_MAX_SWEEPS: usize = 64;

/// Thin QR factors: `a = q * r`.
#[derive(Debug, Clone)]
pub struct Qr {
    /// `(rows, p)` with orthonormal columns, `p = min(rows, cols)`.
    pub q: Matrix,
    /// `(p, cols)` upper trapezoidal.
    pub r: Matrix,
}

/// Thin SVD factors: `a = u * diag(singular_values) * vᵗ`.
#[derive(Debug, Clone)]
pub struct Svd {
    /// `(rows, p)` with orthonormal columns.
    pub u: Matrix,
    /// Length `p`, non-negative, sorted in descending order.
    pub singular_values: Vec<f32>,
    /// `(cols, p)` with orthonormal columns.
    pub v: Matrix,
}

/// Householder thin QR.
///
/// Rank-deficient input (including all-zero columns) still yields a `q` with
/// orthonormal columns: a column with nothing left to reflect keeps the
/// identity reflector.
pub fn qr_thin(a: &Matrix) -> Qr {
    let (m, k) = a.shape();
    let p = m.min(k);

    let mut r: Vec<f64> = a.as_slice().iter().map(|&v| f64::from(v)).collect();
    let mut reflectors: Vec<Option<Vec<f64>>> = Vec::with_capacity(p);

    for j in 0..p {
        let norm = (j..m).map(|i| r[i * k + j].powi(2)).sum::<f64>().sqrt();
        if norm == 0.0 {
            reflectors.push(None);
            continue;
        }

        let alpha = if r[j * k + j] >= 0.0 { -norm } else { norm };
        let mut v: Vec<f64> = (j..m).map(|i| r[i * k + j]).collect();
        v[0] -= alpha;
        let v_norm = v.iter().map(|x| x * x).sum::<f64>().sqrt();
        if v_norm == 0.0 {
            reflectors.push(None);
            continue;
        }
        for x in &mut v {
            *x /= v_norm;
        }

        for col in j..k {
            let dot: f64 = v
                .iter()
                .enumerate()
                .map(|(t, vi)| vi * r[(j + t) * k + col])
                .sum();
            for (t, vi) in v.iter().enumerate() {
                r[(j + t) * k + col] -= 2.0 * vi * dot;
            }
        }
        reflectors.push(Some(v));
    }

    // Q = H_0 * H_1 * ... * H_{p-1} applied to the leading p columns of I.
    let mut q = vec![0.0_f64; m * p];
    for i in 0..p {
        q[i * p + i] = 1.0;
    }
    for (j, reflector) in reflectors.iter().enumerate().rev() {
        let Some(v) = reflector else { continue };
        for col in 0..p {
            let dot: f64 = v
                .iter()
                .enumerate()
                .map(|(t, vi)| vi * q[(j + t) * p + col])
                .sum();
            for (t, vi) in v.iter().enumerate() {
                q[(j + t) * p + col] -= 2.0 * vi * dot;
            }
        }
    }

    let mut r_out = Matrix::zeros(p, k);
    for i in 0..p {
        for j in i..k {
            r_out.set(i, j, r[i * k + j] as f32);
        }
    }

    Qr {
        q: to_matrix(m, p, &q),
        r: r_out,
    }
}

/// Thin singular value decomposition.
///
/// Fails with [`Error::NumericalDegeneracy`] on non-finite input or if the
/// Jacobi sweeps do not converge.
pub fn svd(a: &Matrix) -> Result<Svd> {
    let (rows, cols) = a.shape();
    if rows == 0 || cols == 0 {
        return Err(Error::ShapeMismatch(format!(
            "svd of an empty {rows}x{cols} matrix"
        )));
    }
    if !a.is_finite() {
        return Err(Error::NumericalDegeneracy(
            "svd input contains non-finite values".to_owned(),
        ));
    }

    if rows >= cols {
        jacobi_svd(a)
    } else {
        // a = u s vᵗ  <=>  aᵗ = v s uᵗ
        let t = jacobi_svd(&a.transpose())?;
        Ok(Svd {
            u: t.v,
            singular_values: t.singular_values,
            v: t.u,
        })
    }
}

/// One-sided Jacobi for `rows >= cols`.
fn jacobi_svd(a: &Matrix) -> Result<Svd> {
    let (p, q) = a.shape();

    let mut w: Vec<Vec<f64>> = (0..q)
        .map(|j| (0..p).map(|i| f64::from(a.get(i, j))).collect())
        .collect();
    let mut v: Vec<Vec<f64>> = (0..q)
        .map(|j| (0..q).map(|i| if i == j { 1.0 } else { 0.0 }).collect())
        .collect();

    let mut converged = false;
    for _ in 0..JACOBI_MAX_SWEEPS {
        let mut rotated = false;
        for i in 0..q {
            for j in (i + 1)..q {
                let alpha = dot(&w[i], &w[i]);
                let beta = dot(&w[j], &w[j]);
                let gamma = dot(&w[i], &w[j]);
                if gamma == 0.0 || gamma.abs() <= JACOBI_EPS * (alpha * beta).sqrt() {
                    continue;
                }
                rotated = true;

                let zeta = (beta - alpha) / (2.0 * gamma);
                let t = zeta.signum() / (zeta.abs() + (1.0 + zeta * zeta).sqrt());
                let c = 1.0 / (1.0 + t * t).sqrt();
                let s = c * t;
                rotate(&mut w, i, j, c, s);
                rotate(&mut v, i, j, c, s);
            }
        }
        if !rotated {
            converged = true;
            break;
        }
    }
    if !converged {
        return Err(Error::NumericalDegeneracy(format!(
            "jacobi svd did not converge within {JACOBI_MAX_SWEEPS} sweeps"
        )));
    }

    let sigmas: Vec<f64> = w.iter().map(|col| dot(col, col).sqrt()).collect();
    if sigmas.iter().any(|s| !s.is_finite()) {
        return Err(Error::NumericalDegeneracy(
            "svd produced non-finite singular values".to_owned(),
        ));
    }

    let mut order: Vec<usize> = (0..q).collect();
    order.sort_by(|&x, &y| sigmas[y].total_cmp(&sigmas[x]));

    let sigma_max = sigmas[order[0]];
    let null_threshold = sigma_max * f64::EPSILON * q as f64;

    let mut u_cols: Vec<Option<Vec<f64>>> = order
        .iter()
        .map(|&j| {
            let s = sigmas[j];
            (s > 0.0 && s > null_threshold).then(|| w[j].iter().map(|x| x / s).collect())
        })
        .collect();
    complete_orthonormal(&mut u_cols, p);

    let mut u = Matrix::zeros(p, q);
    let mut vm = Matrix::zeros(q, q);
    let mut singular_values = Vec::with_capacity(q);
    for (out_col, &j) in order.iter().enumerate() {
        let u_col = u_cols[out_col]
            .as_ref()
            .ok_or_else(|| Error::NumericalDegeneracy("could not complete svd basis".to_owned()))?;
        for i in 0..p {
            u.set(i, out_col, u_col[i] as f32);
        }
        for i in 0..q {
            vm.set(i, out_col, v[j][i] as f32);
        }
        singular_values.push(sigmas[j] as f32);
    }

    Ok(Svd {
        u,
        singular_values,
        v: vm,
    })
}

/// Fill the `None` slots with unit vectors orthogonal to every other column.
///
/// Null singular directions carry no information but the left basis still has
/// to stay orthonormal, so they are completed from the standard basis.
fn complete_orthonormal(cols: &mut [Option<Vec<f64>>], dim: usize) {
    for slot in 0..cols.len() {
        if cols[slot].is_some() {
            continue;
        }

        let mut best: Option<(f64, Vec<f64>)> = None;
        for e in 0..dim {
            let mut cand = vec![0.0_f64; dim];
            cand[e] = 1.0;
            // Two passes of Gram-Schmidt.
            for _ in 0..2 {
                for col in cols.iter().flatten() {
                    let proj = dot(col, &cand);
                    for (c, x) in cand.iter_mut().zip(col) {
                        *c -= proj * x;
                    }
                }
            }
            let norm = dot(&cand, &cand).sqrt();
            if best.as_ref().is_none_or(|(n, _)| norm > *n) {
                best = Some((norm, cand));
            }
        }

        if let Some((norm, cand)) = best
            && norm > 1e-8
        {
            cols[slot] = Some(cand.into_iter().map(|x| x / norm).collect());
        }
    }
}

#[inline]
fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[inline]
fn rotate(cols: &mut [Vec<f64>], i: usize, j: usize, c: f64, s: f64) {
    let (left, right) = cols.split_at_mut(j);
    let (ci, cj) = (&mut left[i], &mut right[0]);
    for (x, y) in ci.iter_mut().zip(cj.iter_mut()) {
        let (xi, yj) = (*x, *y);
        *x = c * xi - s * yj;
        *y = s * xi + c * yj;
    }
}

fn to_matrix(rows: usize, cols: usize, data: &[f64]) -> Matrix {
    let mut out = Matrix::zeros(rows, cols);
    for (dst, &src) in out.as_mut_slice().iter_mut().zip(data) {
        *dst = src as f32;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_matrix(rows: usize, cols: usize, seed: u64) -> Matrix {
        let mut rng = StdRng::seed_from_u64(seed);
        let data = (0..rows * cols).map(|_| rng.gen_range(-1.0..1.0)).collect();
        Matrix::from_vec(rows, cols, data).unwrap()
    }

    fn max_abs_diff(a: &Matrix, b: &Matrix) -> f32 {
        a.as_slice()
            .iter()
            .zip(b.as_slice())
            .map(|(x, y)| (x - y).abs())
            .fold(0.0, f32::max)
    }

    fn reconstruct(svd: &Svd) -> Matrix {
        svd.u
            .matmul(&Matrix::from_diag(&svd.singular_values))
            .matmul_t(&svd.v)
    }

    #[test]
    fn qr_of_zero_columns_is_still_orthonormal() {
        let u = qr_thin(&random_matrix(4, 2, 1)).q;
        let aug = Matrix::zeros(4, 2).hcat(&u).unwrap();

        let qr = qr_thin(&aug);
        assert_eq!(qr.q.shape(), (4, 4));
        assert!(qr.q.orthonormality_error() < 1e-5);
        assert!(max_abs_diff(&qr.q.matmul(&qr.r), &aug) < 1e-5);
    }

    #[test]
    fn qr_of_wide_matrix_truncates_to_row_count() {
        let a = random_matrix(3, 5, 2);
        let qr = qr_thin(&a);
        assert_eq!(qr.q.shape(), (3, 3));
        assert_eq!(qr.r.shape(), (3, 5));
        assert!(max_abs_diff(&qr.q.matmul(&qr.r), &a) < 1e-5);
    }

    #[test]
    fn svd_recovers_known_singular_values() {
        let a = Matrix::from_diag(&[0.001, 5.0, 0.0001, 3.0]);
        let svd = svd(&a).unwrap();
        let expected = [5.0, 3.0, 0.001, 0.0001];
        for (s, e) in svd.singular_values.iter().zip(expected) {
            assert_abs_diff_eq!(*s, e, epsilon = 1e-6);
        }
    }

    #[test]
    fn svd_of_zero_matrix_has_orthonormal_factors() {
        let svd = svd(&Matrix::zeros(3, 3)).unwrap();
        assert!(svd.singular_values.iter().all(|&s| s == 0.0));
        assert!(svd.u.orthonormality_error() < 1e-6);
        assert!(svd.v.orthonormality_error() < 1e-6);
    }

    #[test]
    fn svd_rejects_non_finite_input() {
        let mut a = Matrix::identity(2);
        a.set(0, 1, f32::NAN);
        assert!(matches!(svd(&a), Err(Error::NumericalDegeneracy(_))));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_qr_reconstructs_with_orthonormal_q(
            rows in 1usize..7,
            cols in 1usize..7,
            seed in 0u64..1000,
        ) {
            let a = random_matrix(rows, cols, seed);
            let qr = qr_thin(&a);
            prop_assert!(qr.q.orthonormality_error() < 1e-5);
            prop_assert!(max_abs_diff(&qr.q.matmul(&qr.r), &a) < 1e-4);
        }

        #[test]
        fn prop_svd_reconstructs_with_sorted_values(
            rows in 1usize..7,
            cols in 1usize..7,
            seed in 0u64..1000,
        ) {
            let a = random_matrix(rows, cols, seed);
            let svd = svd(&a).unwrap();
            prop_assert_eq!(svd.singular_values.len(), rows.min(cols));
            prop_assert!(svd.singular_values.windows(2).all(|w| w[0] >= w[1]));
            prop_assert!(svd.u.orthonormality_error() < 1e-4);
            prop_assert!(svd.v.orthonormality_error() < 1e-4);
            prop_assert!(max_abs_diff(&reconstruct(&svd), &a) < 1e-4);
        }
    }
}
