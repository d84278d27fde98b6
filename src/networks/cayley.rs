//! Host-side Cayley transform for small square blocks
//!
//! candle has no matrix inverse, so each OFT block is pulled to the host as
//! `f64` and inverted with Gauss-Jordan elimination. Blocks are independent
//! and are processed on the rayon pool.

use rayon::prelude::*;

use super::error::{NetworkError, Result};

/// Pivots below this (relative to the largest entry) count as singular.
const PIVOT_EPS: f64 = 1e-12;

/// Dense row-major square matrix
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub size: usize,
    pub data: Vec<f64>,
}

impl Block {
    pub fn zeros(size: usize) -> Self {
        Self {
            size,
            data: vec![0.0; size * size],
        }
    }

    pub fn identity(size: usize) -> Self {
        let mut block = Self::zeros(size);
        for i in 0..size {
            block.data[i * size + i] = 1.0;
        }
        block
    }

    pub fn from_rows(rows: Vec<Vec<f64>>) -> Self {
        let size = rows.len();
        let data: Vec<f64> = rows.into_iter().flatten().collect();
        debug_assert_eq!(data.len(), size * size);
        Self { size, data }
    }

    pub fn matmul(&self, other: &Block) -> Self {
        let n = self.size;
        let mut out = Self::zeros(n);
        for i in 0..n {
            for k in 0..n {
                let a = self.data[i * n + k];
                if a == 0.0 {
                    continue;
                }
                for j in 0..n {
                    out.data[i * n + j] += a * other.data[k * n + j];
                }
            }
        }
        out
    }

    /// `self + sign * other`
    fn add_scaled(&self, other: &Block, sign: f64) -> Self {
        Self {
            size: self.size,
            data: self
                .data
                .iter()
                .zip(&other.data)
                .map(|(a, b)| a + sign * b)
                .collect(),
        }
    }

    /// Largest elementwise deviation from `other`
    pub fn max_abs_diff(&self, other: &Block) -> f64 {
        self.data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max)
    }
}

/// Invert a square matrix using Gauss-Jordan elimination with partial pivoting.
///
/// Returns a description of the failure if the matrix is singular.
pub fn invert(m: &Block) -> std::result::Result<Block, String> {
    let n = m.size;
    let width = 2 * n;

    // Augmented [M | I]
    let mut aug = vec![0.0f64; n * width];
    for i in 0..n {
        aug[i * width..i * width + n].copy_from_slice(&m.data[i * n..(i + 1) * n]);
        aug[i * width + n + i] = 1.0;
    }

    let scale = m.data.iter().fold(1.0f64, |acc, v| acc.max(v.abs()));
    let tolerance = PIVOT_EPS * scale;

    for col in 0..n {
        let mut max_row = col;
        let mut max_val = aug[col * width + col].abs();
        for row in (col + 1)..n {
            let val = aug[row * width + col].abs();
            if val > max_val {
                max_val = val;
                max_row = row;
            }
        }

        if !max_val.is_finite() {
            return Err(format!("non-finite pivot in column {}", col));
        }
        if max_val < tolerance {
            return Err(format!(
                "matrix is singular (pivot {:e} in column {})",
                max_val, col
            ));
        }

        if max_row != col {
            for j in 0..width {
                aug.swap(col * width + j, max_row * width + j);
            }
        }

        let pivot = aug[col * width + col];
        for j in 0..width {
            aug[col * width + j] /= pivot;
        }

        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = aug[row * width + col];
            if factor == 0.0 {
                continue;
            }
            for j in 0..width {
                aug[row * width + j] -= factor * aug[col * width + j];
            }
        }
    }

    let mut inv = Block::zeros(n);
    for i in 0..n {
        inv.data[i * n..(i + 1) * n].copy_from_slice(&aug[i * width + n..(i + 1) * width]);
    }
    Ok(inv)
}

/// `R = (I + Q)(I - Q)^-1` for one block.
///
/// `index` is only used to label the error.
pub fn cayley(q: &Block, index: usize) -> Result<Block> {
    let eye = Block::identity(q.size);
    let denominator = eye.add_scaled(q, -1.0);
    let inverse = invert(&denominator).map_err(|reason| NetworkError::Numerical {
        block: index,
        reason: format!("Cayley denominator (I - Q) is not invertible: {}", reason),
    })?;
    Ok(eye.add_scaled(q, 1.0).matmul(&inverse))
}

/// Cayley transform of every block, in order.
pub fn cayley_all(blocks: &[Block]) -> Result<Vec<Block>> {
    blocks
        .par_iter()
        .enumerate()
        .map(|(index, q)| cayley(q, index))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invert_known_matrix() {
        let m = Block::from_rows(vec![vec![4.0, 7.0], vec![2.0, 6.0]]);
        let inv = invert(&m).unwrap();
        let expected = Block::from_rows(vec![vec![0.6, -0.7], vec![-0.2, 0.4]]);
        assert!(inv.max_abs_diff(&expected) < 1e-12);
        assert!(m.matmul(&inv).max_abs_diff(&Block::identity(2)) < 1e-12);
    }

    #[test]
    fn test_invert_needs_pivoting() {
        let m = Block::from_rows(vec![
            vec![0.0, 1.0, 0.0],
            vec![1.0, 0.0, 0.0],
            vec![0.0, 0.0, 2.0],
        ]);
        let inv = invert(&m).unwrap();
        assert!(m.matmul(&inv).max_abs_diff(&Block::identity(3)) < 1e-12);
    }

    #[test]
    fn test_invert_singular() {
        let m = Block::from_rows(vec![vec![1.0, 2.0], vec![2.0, 4.0]]);
        assert!(invert(&m).is_err());
    }

    #[test]
    fn test_cayley_of_zero_is_identity() {
        let r = cayley(&Block::zeros(4), 0).unwrap();
        assert!(r.max_abs_diff(&Block::identity(4)) < 1e-15);
    }

    #[test]
    fn test_cayley_reports_failing_block() {
        let good = Block::zeros(2);
        // Q = I makes (I - Q) the zero matrix
        let bad = Block::identity(2);
        match cayley_all(&[good, bad]) {
            Err(NetworkError::Numerical { block, .. }) => assert_eq!(block, 1),
            other => panic!("expected numerical error, got {:?}", other),
        }
    }

    #[test]
    fn test_cayley_rejects_nan() {
        let q = Block::from_rows(vec![vec![0.0, f64::NAN], vec![f64::NAN, 0.0]]);
        assert!(matches!(cayley(&q, 3), Err(NetworkError::Numerical { block: 3, .. })));
    }
}
