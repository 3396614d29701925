//! Dense row-major matrices for factor storage.
//!
//! Factors are small (at most `2 * rmax_total` columns), so a plain owned
//! `Vec<f32>` per matrix is enough. Products go through [`crate::matmul`].

use crate::matmul::{View, gemm};
use crate::{Error, Result};

/// Row-major `f32` matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl Matrix {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    pub fn identity(n: usize) -> Self {
        let mut m = Self::zeros(n, n);
        for i in 0..n {
            m.data[i * n + i] = 1.0;
        }
        m
    }

    /// Square matrix with `diag` on its diagonal.
    pub fn from_diag(diag: &[f32]) -> Self {
        let n = diag.len();
        let mut m = Self::zeros(n, n);
        for (i, &d) in diag.iter().enumerate() {
            m.data[i * n + i] = d;
        }
        m
    }

    /// Build from a flat row-major buffer with shape `(rows, cols)`.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(Error::ShapeMismatch(format!(
                "buffer length {} does not match {rows}x{cols}",
                data.len()
            )));
        }
        Ok(Self { rows, cols, data })
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f32 {
        self.data[i * self.cols + j]
    }

    #[inline]
    pub fn set(&mut self, i: usize, j: usize, v: f32) {
        self.data[i * self.cols + j] = v;
    }

    #[inline]
    pub(crate) fn view(&self) -> View<'_> {
        View::new(&self.data, self.rows, self.cols)
    }

    pub fn transpose(&self) -> Self {
        let mut t = Self::zeros(self.cols, self.rows);
        for i in 0..self.rows {
            for j in 0..self.cols {
                t.data[j * self.rows + i] = self.data[i * self.cols + j];
            }
        }
        t
    }

    /// `self * rhs`.
    pub fn matmul(&self, rhs: &Matrix) -> Self {
        product(self.view(), rhs.view())
    }

    /// `selfᵗ * rhs`.
    pub fn t_matmul(&self, rhs: &Matrix) -> Self {
        product(self.view().t(), rhs.view())
    }

    /// `self * rhsᵗ`.
    pub fn matmul_t(&self, rhs: &Matrix) -> Self {
        product(self.view(), rhs.view().t())
    }

    /// Horizontal concatenation `[self | rhs]`.
    pub fn hcat(&self, rhs: &Matrix) -> Result<Self> {
        if self.rows != rhs.rows {
            return Err(Error::ShapeMismatch(format!(
                "cannot concatenate {}x{} with {}x{}",
                self.rows, self.cols, rhs.rows, rhs.cols
            )));
        }
        let cols = self.cols + rhs.cols;
        let mut out = Self::zeros(self.rows, cols);
        for i in 0..self.rows {
            let dst = &mut out.data[i * cols..(i + 1) * cols];
            dst[..self.cols].copy_from_slice(&self.data[i * self.cols..(i + 1) * self.cols]);
            dst[self.cols..].copy_from_slice(&rhs.data[i * rhs.cols..(i + 1) * rhs.cols]);
        }
        Ok(out)
    }

    /// Leading `n` columns.
    pub fn leading_cols(&self, n: usize) -> Self {
        self.col_range(0, n)
    }

    /// Columns `start..end`.
    pub fn col_range(&self, start: usize, end: usize) -> Self {
        assert!(
            start <= end && end <= self.cols,
            "column range {start}..{end} out of bounds for {} columns",
            self.cols
        );
        let n = end - start;
        let mut out = Self::zeros(self.rows, n);
        for i in 0..self.rows {
            let src = i * self.cols;
            out.data[i * n..(i + 1) * n].copy_from_slice(&self.data[src + start..src + end]);
        }
        out
    }

    pub fn frobenius_norm(&self) -> f32 {
        self.data
            .iter()
            .map(|&v| f64::from(v) * f64::from(v))
            .sum::<f64>()
            .sqrt() as f32
    }

    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }

    /// Largest entry of `|selfᵗ self - I|`.
    ///
    /// Zero for a matrix with exactly orthonormal columns.
    pub fn orthonormality_error(&self) -> f32 {
        let gram = self.t_matmul(self);
        let mut worst = 0.0_f32;
        for i in 0..gram.rows {
            for j in 0..gram.cols {
                let target = if i == j { 1.0 } else { 0.0 };
                worst = worst.max((gram.get(i, j) - target).abs());
            }
        }
        worst
    }
}

fn product(a: View<'_>, b: View<'_>) -> Matrix {
    let mut out = Matrix::zeros(a.rows(), b.cols());
    gemm(1.0, a, b, 0.0, &mut out.data);
    out
}
