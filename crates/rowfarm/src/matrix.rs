//! Dense row-major matrices and the row-by-matrix product workers compute.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use rand::Rng;

/// Shape and I/O errors for matrices.
#[derive(Debug, thiserror::Error)]
pub enum MatrixError {
    #[error("data length {len} does not match dimensions {rows}x{cols}")]
    ShapeMismatch { len: usize, rows: usize, cols: usize },

    #[error("row {row} has {found} values, expected {expected}")]
    RaggedRow {
        row: usize,
        expected: usize,
        found: usize,
    },

    #[error("index ({row}, {col}) out of bounds for {rows}x{cols} matrix")]
    OutOfBounds {
        row: usize,
        col: usize,
        rows: usize,
        cols: usize,
    },

    #[error("failed to parse value on line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("matrix file is empty")]
    Empty,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Failure of the row-by-matrix product.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ComputeError {
    #[error("cannot multiply {left_rows}x{left_cols} by {right_rows}x{right_cols}")]
    DimensionMismatch {
        left_rows: usize,
        left_cols: usize,
        right_rows: usize,
        right_cols: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    data: Vec<f64>,
    rows: usize,
    cols: usize,
}

impl Matrix {
    /// Zero-filled matrix.
    pub fn new(rows: usize, cols: usize) -> Self {
        Matrix {
            data: vec![0.0; rows * cols],
            rows,
            cols,
        }
    }

    pub fn from_vec(data: Vec<f64>, rows: usize, cols: usize) -> Result<Self, MatrixError> {
        if rows.checked_mul(cols) != Some(data.len()) {
            return Err(MatrixError::ShapeMismatch {
                len: data.len(),
                rows,
                cols,
            });
        }
        Ok(Matrix { data, rows, cols })
    }

    /// Build a matrix from equal-width rows. An empty input gives a 0x0 matrix.
    pub fn from_rows<R: AsRef<[f64]>>(rows: &[R]) -> Result<Self, MatrixError> {
        let cols = rows.first().map_or(0, |r| r.as_ref().len());
        let mut data = Vec::with_capacity(rows.len() * cols);
        for (i, row) in rows.iter().enumerate() {
            let row = row.as_ref();
            if row.len() != cols {
                return Err(MatrixError::RaggedRow {
                    row: i,
                    expected: cols,
                    found: row.len(),
                });
            }
            data.extend_from_slice(row);
        }
        Ok(Matrix {
            data,
            rows: rows.len(),
            cols,
        })
    }

    /// Matrix with entries drawn uniformly from `[0, 1)`.
    pub fn random<R: Rng + ?Sized>(rows: usize, cols: usize, rng: &mut R) -> Self {
        let data = (0..rows * cols).map(|_| rng.r#gen::<f64>()).collect();
        Matrix { data, rows, cols }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn is_square(&self) -> bool {
        self.rows == self.cols
    }

    /// Row-major backing storage.
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn get(&self, row: usize, col: usize) -> Result<f64, MatrixError> {
        if row >= self.rows || col >= self.cols {
            return Err(self.out_of_bounds(row, col));
        }
        Ok(self.data[row * self.cols + col])
    }

    pub fn set(&mut self, row: usize, col: usize, value: f64) -> Result<(), MatrixError> {
        if row >= self.rows || col >= self.cols {
            return Err(self.out_of_bounds(row, col));
        }
        self.data[row * self.cols + col] = value;
        Ok(())
    }

    pub fn row(&self, row: usize) -> Option<&[f64]> {
        if row >= self.rows {
            return None;
        }
        let start = row * self.cols;
        Some(&self.data[start..start + self.cols])
    }

    pub fn row_mut(&mut self, row: usize) -> Option<&mut [f64]> {
        if row >= self.rows {
            return None;
        }
        let start = row * self.cols;
        Some(&mut self.data[start..start + self.cols])
    }

    /// Iterate rows in index order.
    pub fn iter_rows(&self) -> impl Iterator<Item = &[f64]> {
        (0..self.rows).map(move |r| &self.data[r * self.cols..(r + 1) * self.cols])
    }

    /// Full product `self * other`, computed locally.
    pub fn multiply(&self, other: &Matrix) -> Result<Matrix, ComputeError> {
        let mut data = Vec::with_capacity(self.rows * other.cols);
        for row in self.iter_rows() {
            data.extend(row_times_matrix(row, other)?);
        }
        Ok(Matrix {
            data,
            rows: self.rows,
            cols: other.cols,
        })
    }

    /// Load a matrix from a text file.
    ///
    /// Format: whitespace-separated values, one row per line. Blank lines are skipped.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, MatrixError> {
        let reader = BufReader::new(File::open(path)?);
        let mut rows: Vec<Vec<f64>> = Vec::new();

        for (line_num, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let values = trimmed
                .split_whitespace()
                .map(str::parse::<f64>)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| MatrixError::Parse {
                    line: line_num + 1,
                    message: e.to_string(),
                })?;
            rows.push(values);
        }

        if rows.is_empty() {
            return Err(MatrixError::Empty);
        }
        Self::from_rows(&rows)
    }

    /// Save as whitespace-separated text, one row per line.
    ///
    /// Values are written with Rust's shortest round-trip formatting, so
    /// `load_from_file` reproduces them exactly.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), MatrixError> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.write_to(&mut writer)?;
        writer.flush()?;
        Ok(())
    }

    /// Write the text form used by `save_to_file`.
    pub fn write_to<W: Write>(&self, mut writer: W) -> io::Result<()> {
        for row in self.iter_rows() {
            for (j, value) in row.iter().enumerate() {
                if j > 0 {
                    write!(writer, " ")?;
                }
                write!(writer, "{value}")?;
            }
            writeln!(writer)?;
        }
        Ok(())
    }

    fn out_of_bounds(&self, row: usize, col: usize) -> MatrixError {
        MatrixError::OutOfBounds {
            row,
            col,
            rows: self.rows,
            cols: self.cols,
        }
    }
}

/// Multiply a row vector by a matrix: `out[j] = sum_k row[k] * matrix[k][j]`.
pub fn row_times_matrix(row: &[f64], matrix: &Matrix) -> Result<Vec<f64>, ComputeError> {
    if row.len() != matrix.rows {
        return Err(ComputeError::DimensionMismatch {
            left_rows: 1,
            left_cols: row.len(),
            right_rows: matrix.rows,
            right_cols: matrix.cols,
        });
    }

    let mut out = vec![0.0; matrix.cols];
    for (k, &a) in row.iter().enumerate() {
        let b_row = &matrix.data[k * matrix.cols..(k + 1) * matrix.cols];
        for (acc, &b) in out.iter_mut().zip(b_row) {
            *acc += a * b;
        }
    }
    Ok(out)
}
