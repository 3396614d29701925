//! Strided GEMM used by every phase of the integrator.
//!
//! Operands are described by a [`View`]: a borrowed row-major buffer plus
//! strides, so transposed operands (`Vᵗ`, `Uᵗ`, `Xᵗ`) are expressed by swapping
//! strides instead of materializing copies.
//!
//! - default: a simple, safe triple-loop implementation
//! - optional: a faster backend via the `matrixmultiply` feature

/// Borrowed, strided matrix operand.
#[derive(Debug, Clone, Copy)]
pub(crate) struct View<'a> {
    data: &'a [f32],
    rows: usize,
    cols: usize,
    rs: usize,
    cs: usize,
}

impl<'a> View<'a> {
    /// Row-major view with shape `(rows, cols)`.
    #[inline]
    pub(crate) fn new(data: &'a [f32], rows: usize, cols: usize) -> Self {
        debug_assert!(data.len() >= rows * cols);
        Self {
            data,
            rows,
            cols,
            rs: cols,
            cs: 1,
        }
    }

    /// Transposed view of the same buffer.
    #[inline]
    pub(crate) fn t(self) -> Self {
        Self {
            data: self.data,
            rows: self.cols,
            cols: self.rows,
            rs: self.cs,
            cs: self.rs,
        }
    }

    #[inline]
    pub(crate) fn rows(&self) -> usize {
        self.rows
    }

    #[inline]
    pub(crate) fn cols(&self) -> usize {
        self.cols
    }
}

/// `c = alpha * a * b + beta * c`, with `c` row-major `(a.rows, b.cols)`.
///
/// Empty products leave `c` scaled by `beta`.
#[inline]
pub(crate) fn gemm(alpha: f32, a: View<'_>, b: View<'_>, beta: f32, c: &mut [f32]) {
    assert_eq!(
        a.cols, b.rows,
        "gemm inner dims disagree: {}x{} * {}x{}",
        a.rows, a.cols, b.rows, b.cols
    );
    let (m, k, n) = (a.rows, a.cols, b.cols);
    assert_eq!(
        c.len(),
        m * n,
        "gemm output len {} does not match {m}x{n}",
        c.len()
    );

    if m == 0 || n == 0 {
        return;
    }
    if k == 0 {
        for v in c.iter_mut() {
            *v *= beta;
        }
        return;
    }

    gemm_f32(
        m, n, k, alpha, a.data, a.rs, a.cs, b.data, b.rs, b.cs, beta, c, n, 1,
    );
}

#[allow(clippy::too_many_arguments)]
#[inline]
fn gemm_f32(
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    a: &[f32],
    rsa: usize,
    csa: usize,
    b: &[f32],
    rsb: usize,
    csb: usize,
    beta: f32,
    c: &mut [f32],
    rsc: usize,
    csc: usize,
) {
    debug_assert!(m > 0 && n > 0 && k > 0);

    #[cfg(feature = "matrixmultiply")]
    {
        // matrixmultiply supports arbitrary strides; bounds are checked by `gemm`.
        unsafe {
            matrixmultiply::sgemm(
                m,
                k,
                n,
                alpha,
                a.as_ptr(),
                rsa as isize,
                csa as isize,
                b.as_ptr(),
                rsb as isize,
                csb as isize,
                beta,
                c.as_mut_ptr(),
                rsc as isize,
                csc as isize,
            );
        }
    }

    #[cfg(not(feature = "matrixmultiply"))]
    for i in 0..m {
        for j in 0..n {
            let mut acc = 0.0_f32;
            let a0 = i * rsa;
            let b0 = j * csb;

            for p in 0..k {
                acc = a[a0 + p * csa].mul_add(b[p * rsb + b0], acc);
            }

            let idx = i * rsc + j * csc;
            // beta == 0 must not propagate NaN from stale output buffers.
            c[idx] = if beta == 0.0 {
                alpha * acc
            } else {
                alpha * acc + beta * c[idx]
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gemm_matches_hand_computed_product() {
        // [1 2; 3 4] * [5 6; 7 8] = [19 22; 43 50]
        let a = [1.0_f32, 2.0, 3.0, 4.0];
        let b = [5.0_f32, 6.0, 7.0, 8.0];
        let mut c = [0.0_f32; 4];
        gemm(1.0, View::new(&a, 2, 2), View::new(&b, 2, 2), 0.0, &mut c);
        assert_eq!(c, [19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn transposed_views_use_strides() {
        // a is 2x3, a^T * a is 3x3.
        let a = [1.0_f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let va = View::new(&a, 2, 3);
        let mut c = [0.0_f32; 9];
        gemm(1.0, va.t(), va, 0.0, &mut c);
        assert_eq!(c, [17.0, 22.0, 27.0, 22.0, 29.0, 36.0, 27.0, 36.0, 45.0]);
    }

    #[test]
    fn beta_accumulates_into_output() {
        let a = [2.0_f32];
        let b = [3.0_f32];
        let mut c = [1.0_f32];
        gemm(1.0, View::new(&a, 1, 1), View::new(&b, 1, 1), 1.0, &mut c);
        assert_eq!(c, [7.0]);
    }

    #[test]
    #[should_panic]
    fn gemm_panics_on_inner_dim_mismatch() {
        let a = [0.0_f32; 6];
        let mut c = [0.0_f32; 4];
        gemm(1.0, View::new(&a, 2, 3), View::new(&a, 2, 3), 0.0, &mut c);
    }
}
