//! Compressed sparse row matrices.
//!
//! This is the matrix type exchanged with the model layer: operator matrices,
//! Hamiltonian connection factors, and anything else that is mostly zeros.
//! Storage and arithmetic are those of [`nalgebra_sparse::CsrMatrix`]; this
//! wrapper keeps explicit zeros out and adds the block/relabeling helpers the
//! super-block code needs.

use std::ops::Range;
use nalgebra as na;
use nalgebra_sparse::{
    CooMatrix,
    CsrMatrix,
    convert::serial::{ convert_coo_csr, convert_csr_dense, convert_dense_csr },
};
use thiserror::Error;
use crate::ComplexScalar;

#[derive(Debug, Error)]
pub enum SparseError {
    /// Returned when a triplet falls outside the declared shape.
    #[error("error in sparse matrix creation: entry ({0}, {1}) out of bounds")]
    OutOfBounds(usize, usize),

    /// Returned when two matrices of incompatible shapes are combined.
    #[error("error in sparse matrix operation: incompatible shapes {0:?} and {1:?}")]
    IncompatibleShape((usize, usize), (usize, usize)),

    /// Returned when a permutation does not match the matrix dimension.
    #[error("error in sparse matrix permutation: length {0} does not match dimension {1}")]
    BadPermutation(usize, usize),

    /// Returned when a list of column weights does not match the number of
    /// columns.
    #[error("error in sparse column scaling: {0} weights for {1} columns")]
    BadWeights(usize, usize),
}
use SparseError::*;
pub type SparseResult<T> = Result<T, SparseError>;

/// A sparse matrix in compressed sparse row (CSR) format.
///
/// Column indices within each row are strictly increasing and explicit zeros
/// are never stored.
#[derive(Clone, Debug, PartialEq)]
pub struct SparseMatrix<T> {
    data: CsrMatrix<T>,
}

impl<T: ComplexScalar> SparseMatrix<T> {
    // drops entries that are exactly zero, e.g. after cancellation
    fn from_csr(data: CsrMatrix<T>) -> Self {
        if data.values().iter().any(|x| x.is_zero()) {
            Self { data: data.filter(|_, _, x| !x.is_zero()) }
        } else {
            Self { data }
        }
    }

    fn from_coo(coo: &CooMatrix<T>) -> Self {
        Self::from_csr(convert_coo_csr(coo))
    }

    /// Create an all-zero matrix.
    pub fn zeros(nrows: usize, ncols: usize) -> Self {
        Self { data: CsrMatrix::zeros(nrows, ncols) }
    }

    /// Create an identity matrix.
    pub fn identity(n: usize) -> Self {
        Self { data: CsrMatrix::identity(n) }
    }

    /// Create a square diagonal matrix.
    pub fn from_diagonal<I>(diag: I) -> Self
    where I: IntoIterator<Item = T>
    {
        let diag: Vec<T> = diag.into_iter().collect();
        let n = diag.len();
        let mut coo = CooMatrix::new(n, n);
        diag.into_iter().enumerate().for_each(|(k, x)| { coo.push(k, k, x); });
        Self::from_coo(&coo)
    }

    /// Build from `(row, col, value)` triplets.
    ///
    /// Duplicate entries are summed and entries summing to exactly zero are
    /// dropped. Fails if any triplet is outside the `nrows x ncols` shape.
    pub fn from_triplets<I>(nrows: usize, ncols: usize, triplets: I)
        -> SparseResult<Self>
    where I: IntoIterator<Item = (usize, usize, T)>
    {
        let mut coo = CooMatrix::new(nrows, ncols);
        for (i, j, x) in triplets.into_iter() {
            if i >= nrows || j >= ncols { return Err(OutOfBounds(i, j)); }
            coo.push(i, j, x);
        }
        Ok(Self::from_coo(&coo))
    }

    /// Build from a dense matrix, keeping only its non-zero entries.
    pub fn from_dense(mat: &na::DMatrix<T>) -> Self {
        Self::from_csr(convert_dense_csr(mat))
    }

    /// Expand into a dense matrix.
    pub fn to_dense(&self) -> na::DMatrix<T> { convert_csr_dense(&self.data) }

    /// Borrow the underlying CSR storage.
    pub fn as_csr(&self) -> &CsrMatrix<T> { &self.data }

    pub fn nrows(&self) -> usize { self.data.nrows() }

    pub fn ncols(&self) -> usize { self.data.ncols() }

    pub fn shape(&self) -> (usize, usize) { (self.nrows(), self.ncols()) }

    /// Number of stored (non-zero) entries.
    pub fn nnz(&self) -> usize { self.data.nnz() }

    /// Return `true` if no entries are stored.
    pub fn is_zero(&self) -> bool { self.data.nnz() == 0 }

    /// Return the column indices and values of row `i`.
    ///
    /// *Panics if `i` is out of bounds.*
    pub fn row(&self, i: usize) -> (&[usize], &[T]) {
        let offsets = self.data.row_offsets();
        let r = offsets[i]..offsets[i + 1];
        (&self.data.col_indices()[r.clone()], &self.data.values()[r])
    }

    /// Iterate over all stored `(row, col, value)` entries in row-major order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize, T)> + '_ {
        self.data.triplet_iter().map(|(i, j, x)| (i, j, *x))
    }

    /// Return the element at `(i, j)`, or zero if `(i, j)` is out of bounds.
    pub fn get(&self, i: usize, j: usize) -> T {
        self.data.get_entry(i, j)
            .map(|entry| entry.into_value())
            .unwrap_or_else(T::zero)
    }

    /// Return `true` if all stored entries lie on the diagonal.
    pub fn is_diagonal(&self) -> bool {
        self.data.triplet_iter().all(|(i, j, _)| i == j)
    }

    /// Accumulate `y += self · x`.
    ///
    /// *Panics if `x` or `y` are shorter than the matrix dimensions.*
    pub fn matvec(&self, x: &[T], y: &mut [T]) {
        for (i, yi) in y.iter_mut().enumerate().take(self.nrows()) {
            let (cols, vals) = self.row(i);
            *yi += cols.iter().zip(vals)
                .fold(T::zero(), |acc, (&j, &a)| acc + a * x[j]);
        }
    }

    /// Return the conjugate transpose.
    pub fn transpose_conjugate(&self) -> Self {
        let mut data = self.data.transpose();
        data.values_mut().iter_mut().for_each(|x| { *x = x.conjugate(); });
        Self { data }
    }

    /// Return `self · rhs`.
    pub fn mul(&self, rhs: &Self) -> SparseResult<Self> {
        if self.ncols() != rhs.nrows() {
            return Err(IncompatibleShape(self.shape(), rhs.shape()));
        }
        Ok(Self::from_csr(&self.data * &rhs.data))
    }

    /// Return `self + rhs`.
    pub fn add(&self, rhs: &Self) -> SparseResult<Self> {
        if self.shape() != rhs.shape() {
            return Err(IncompatibleShape(self.shape(), rhs.shape()));
        }
        Ok(Self::from_csr(&self.data + &rhs.data))
    }

    /// Return `a · self`.
    pub fn scale(&self, a: T) -> Self {
        if a.is_zero() { return Self::zeros(self.nrows(), self.ncols()); }
        let mut data = self.data.clone();
        data.values_mut().iter_mut().for_each(|x| { *x *= a; });
        Self { data }
    }

    /// Multiply every column `j` by `weights[j]`.
    ///
    /// Fails if there is not exactly one weight per column.
    pub fn scale_columns(&self, weights: &[T]) -> SparseResult<Self> {
        if weights.len() != self.ncols() {
            return Err(BadWeights(weights.len(), self.ncols()));
        }
        let mut data = self.data.clone();
        let (_, cols, vals) = data.csr_data_mut();
        cols.iter().zip(vals.iter_mut())
            .for_each(|(&j, x)| { *x *= weights[j]; });
        Ok(Self::from_csr(data))
    }

    /// Return the sub-matrix spanned by the given row and column ranges.
    ///
    /// *Panics if either range reaches past the matrix.*
    pub fn block(&self, rows: Range<usize>, cols: Range<usize>) -> Self {
        let mut coo = CooMatrix::new(rows.len(), cols.len());
        for (ib, i) in rows.enumerate() {
            let (c, v) = self.row(i);
            let lo = c.partition_point(|&j| j < cols.start);
            let hi = c.partition_point(|&j| j < cols.end);
            c[lo..hi].iter().zip(&v[lo..hi])
                .for_each(|(&j, &x)| { coo.push(ib, j - cols.start, x); });
        }
        Self::from_coo(&coo)
    }

    /// Relabel a square matrix into a new ordering: entry `(perm[i], perm[j])`
    /// of `self` becomes entry `(i, j)` of the result.
    ///
    /// With `perm` = [`Basis::permutation`][crate::basis::Basis::permutation],
    /// this takes an operator from natural to quantum-number-sorted order.
    pub fn permuted(&self, perm: &[usize]) -> SparseResult<Self> {
        let n = self.nrows();
        if perm.len() != n || n != self.ncols() || perm.iter().any(|&p| p >= n) {
            return Err(BadPermutation(perm.len(), n));
        }
        let mut inv = vec![0; n];
        perm.iter().enumerate().for_each(|(i, &p)| { inv[p] = i; });
        let mut coo = CooMatrix::new(n, n);
        self.iter().for_each(|(i, j, x)| { coo.push(inv[i], inv[j], x); });
        Ok(Self::from_coo(&coo))
    }
}

impl<T: ComplexScalar> From<&na::DMatrix<T>> for SparseMatrix<T> {
    fn from(mat: &na::DMatrix<T>) -> Self { Self::from_dense(mat) }
}

impl<T: ComplexScalar> From<CsrMatrix<T>> for SparseMatrix<T> {
    fn from(data: CsrMatrix<T>) -> Self { Self::from_csr(data) }
}
