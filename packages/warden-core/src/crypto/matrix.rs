//! Dense row-major matrices over `f64`.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A dense row-major matrix
///
/// Invariant: `data.len() == rows * cols`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl Matrix {
    /// A `rows × cols` matrix of zeros
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// Wrap existing row-major data
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(Error::InvalidCiphertext(format!(
                "Matrix data length {} does not match {}x{}",
                data.len(),
                rows,
                cols
            )));
        }
        Ok(Self { rows, cols, data })
    }

    /// Build from row vectors of equal length
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self> {
        let cols = rows.first().map(Vec::len).unwrap_or(0);
        let row_count = rows.len();
        let mut data = Vec::with_capacity(row_count * cols);
        for row in rows {
            if row.len() != cols {
                return Err(Error::InvalidCiphertext("Ragged matrix rows".into()));
            }
            data.extend(row);
        }
        Ok(Self {
            rows: row_count,
            cols,
            data,
        })
    }

    /// Number of rows
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Row-major backing data
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Mutable row-major backing data
    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// Borrow row `i`
    pub fn row(&self, i: usize) -> &[f64] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    /// Entry at `(i, j)`
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.data[i * self.cols + j]
    }

    /// `self · x`
    pub fn mul_vec(&self, x: &[f64]) -> Result<Vec<f64>> {
        if x.len() != self.cols {
            return Err(Error::InvalidKey(format!(
                "Vector length {} does not match {} columns",
                x.len(),
                self.cols
            )));
        }
        Ok((0..self.rows).map(|i| dot(self.row(i), x)).collect())
    }

    /// `selfᵗ · r` for a binary `r` given by the indices of its ones
    ///
    /// Sums the selected rows, which is what `Aᵗ·r` is when `r` is a
    /// 0/1 vector.
    pub fn transpose_mul_indicator(&self, ones: &[usize]) -> Vec<f64> {
        let mut out = vec![0.0; self.cols];
        for &i in ones {
            for (acc, value) in out.iter_mut().zip(self.row(i)) {
                *acc += value;
            }
        }
        out
    }

    /// Element-wise sum
    pub fn add(&self, other: &Matrix) -> Result<Matrix> {
        if self.rows != other.rows || self.cols != other.cols {
            return Err(Error::InvalidCiphertext(format!(
                "Cannot add {}x{} to {}x{}",
                other.rows, other.cols, self.rows, self.cols
            )));
        }
        let data = self
            .data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| a + b)
            .collect();
        Ok(Matrix {
            rows: self.rows,
            cols: self.cols,
            data,
        })
    }
}

/// Inner product of two equal-length slices
pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Element-wise sum of two vectors
pub fn add_vec(a: &[f64], b: &[f64]) -> Result<Vec<f64>> {
    if a.len() != b.len() {
        return Err(Error::InvalidCiphertext(format!(
            "Vector lengths differ: {} vs {}",
            a.len(),
            b.len()
        )));
    }
    Ok(a.iter().zip(b).map(|(x, y)| x + y).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vec_checks_length() {
        assert!(Matrix::from_vec(2, 3, vec![0.0; 6]).is_ok());
        assert!(Matrix::from_vec(2, 3, vec![0.0; 5]).is_err());
    }

    #[test]
    fn test_mul_vec() {
        let m = Matrix::from_rows(vec![vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        assert_eq!(m.mul_vec(&[1.0, 1.0]).unwrap(), vec![3.0, 7.0]);
        assert!(m.mul_vec(&[1.0]).is_err());
    }

    #[test]
    fn test_transpose_mul_indicator_sums_rows() {
        let m = Matrix::from_rows(vec![
            vec![1.0, 2.0],
            vec![3.0, 4.0],
            vec![5.0, 6.0],
        ])
        .unwrap();
        // r = (1, 0, 1)  =>  Aᵗ·r = row0 + row2
        assert_eq!(m.transpose_mul_indicator(&[0, 2]), vec![6.0, 8.0]);
        assert_eq!(m.transpose_mul_indicator(&[]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_add_shape_mismatch() {
        let a = Matrix::zeros(2, 2);
        let b = Matrix::zeros(2, 3);
        assert!(a.add(&b).is_err());
        assert_eq!(a.add(&a).unwrap(), a);
    }
}
