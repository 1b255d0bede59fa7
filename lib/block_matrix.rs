//! Block-diagonal matrices over a symmetry-adapted basis.
//!
//! A [`BlockMatrix`] is an ordered list of square dense blocks laid along the
//! diagonal of a larger matrix:
//!
//! ```text
//!   offset 0 ─► ┌────┐
//!               │ B0 │
//!   offset 2 ─► └────┼───────┐
//!                    │  B1   │
//!   offset 5 ─► ─────┴───────┼──┐
//!                            │B2│
//!                            └──┘   rank = 6
//! ```
//!
//! Off-block entries are implicitly zero.

use std::ops::AddAssign;
use nalgebra as na;
use thiserror::Error;
use crate::{ ComplexScalar, sparse::SparseMatrix };

#[derive(Debug, Error)]
pub enum BlockMatrixError {
    /// Returned when a block is not square.
    #[error("error in block matrix creation: block {0} is not square")]
    NonSquareBlock(usize),

    /// Returned when combining block matrices with different block layouts.
    #[error("error in block matrix arithmetic: block structures differ")]
    StructureMismatch,
}
use BlockMatrixError::*;
pub type BlockMatrixResult<T> = Result<T, BlockMatrixError>;

/// A block-diagonal matrix.
#[derive(Clone, Debug, PartialEq)]
pub struct BlockMatrix<T: ComplexScalar> {
    blocks: Vec<na::DMatrix<T>>,
    // offsets[k] is the first global row/column of block k;
    // offsets[nblocks] == rank
    offsets: Vec<usize>,
}

impl<T: ComplexScalar> BlockMatrix<T> {
    /// Assemble from an ordered sequence of square blocks.
    ///
    /// Fails if any block is not square.
    pub fn new<I>(blocks: I) -> BlockMatrixResult<Self>
    where I: IntoIterator<Item = na::DMatrix<T>>
    {
        let blocks: Vec<na::DMatrix<T>> = blocks.into_iter().collect();
        if let Some(k) = blocks.iter().position(|b| !b.is_square()) {
            return Err(NonSquareBlock(k));
        }
        let offsets = Self::offsets_from_sizes(blocks.iter().map(|b| b.nrows()));
        Ok(Self { blocks, offsets })
    }

    // for blocks that are square by construction
    pub(crate) fn from_square_blocks(blocks: Vec<na::DMatrix<T>>) -> Self {
        debug_assert!(blocks.iter().all(|b| b.is_square()));
        let offsets = Self::offsets_from_sizes(blocks.iter().map(|b| b.nrows()));
        Self { blocks, offsets }
    }

    /// Create zero blocks of the given sizes.
    pub fn zeros<I>(sizes: I) -> Self
    where I: IntoIterator<Item = usize>
    {
        let blocks: Vec<na::DMatrix<T>>
            = sizes.into_iter()
            .map(|n| na::DMatrix::zeros(n, n))
            .collect();
        let offsets = Self::offsets_from_sizes(blocks.iter().map(|b| b.nrows()));
        Self { blocks, offsets }
    }

    fn offsets_from_sizes<I>(sizes: I) -> Vec<usize>
    where I: IntoIterator<Item = usize>
    {
        let mut offsets: Vec<usize> = vec![0];
        let mut acc: usize = 0;
        for n in sizes.into_iter() {
            acc += n;
            offsets.push(acc);
        }
        offsets
    }

    /// Number of blocks.
    pub fn n_blocks(&self) -> usize { self.blocks.len() }

    /// Total dimension, i.e. the sum of block sizes.
    pub fn rank(&self) -> usize { self.offsets[self.blocks.len()] }

    /// Return block `k`.
    pub fn block(&self, k: usize) -> &na::DMatrix<T> { &self.blocks[k] }

    /// Return a mutable view of block `k`. Blocks cannot be resized after
    /// construction.
    pub fn block_mut(&mut self, k: usize) -> na::DMatrixViewMut<'_, T> {
        self.blocks[k].as_view_mut()
    }

    /// Return all blocks.
    pub fn blocks(&self) -> &[na::DMatrix<T>] { &self.blocks }

    /// Return the global row/column offset of block `k`.
    pub fn offset(&self, k: usize) -> usize { self.offsets[k] }

    /// Return the dimension of block `k`.
    pub fn block_size(&self, k: usize) -> usize { self.blocks[k].nrows() }

    /// Return all block sizes.
    pub fn sizes(&self) -> Vec<usize> {
        self.blocks.iter().map(|b| b.nrows()).collect()
    }

    /// Return `true` if `other` has the same number of blocks with the same
    /// sizes.
    pub fn same_structure(&self, other: &Self) -> bool {
        self.offsets == other.offsets
    }

    /// Return the element at global position `(i, j)`.
    pub fn get(&self, i: usize, j: usize) -> T {
        let k = self.offsets.partition_point(|&off| off <= i) - 1;
        let range = self.offsets[k]..self.offsets[k + 1];
        if range.contains(&j) {
            self.blocks[k][(i - range.start, j - range.start)]
        } else {
            T::zero()
        }
    }

    /// Blockwise `self += other`.
    ///
    /// Fails without modifying `self` if the block structures differ.
    pub fn try_add_assign(&mut self, other: &Self) -> BlockMatrixResult<()> {
        if !self.same_structure(other) { return Err(StructureMismatch); }
        self.blocks.iter_mut().zip(&other.blocks)
            .for_each(|(a, b)| { *a += b; });
        Ok(())
    }

    /// Multiply every block by a real factor.
    pub fn scale_mut(&mut self, a: T::Re) {
        let a = T::from_real(a);
        self.blocks.iter_mut().for_each(|b| { *b *= a; });
    }

    /// Sum of diagonal elements.
    pub fn trace(&self) -> T {
        self.blocks.iter()
            .fold(T::zero(), |acc, b| acc + b.trace())
    }

    /// Expand into a full dense matrix.
    pub fn to_dense(&self) -> na::DMatrix<T> {
        let n = self.rank();
        let mut mat: na::DMatrix<T> = na::DMatrix::zeros(n, n);
        self.blocks.iter().zip(&self.offsets)
            .for_each(|(b, &off)| {
                let m = b.nrows();
                mat.view_mut((off, off), (m, m)).copy_from(b);
            });
        mat
    }

    /// Expand into a full sparse matrix, dropping zeros inside blocks.
    pub fn to_sparse(&self) -> SparseMatrix<T> {
        let n = self.rank();
        let triplets
            = self.blocks.iter().zip(&self.offsets)
            .flat_map(|(b, &off)| {
                let m = b.nrows();
                (0..m).flat_map(move |j| {
                    (0..m).map(move |i| (off + i, off + j, b[(i, j)]))
                })
            });
        SparseMatrix::from_triplets(n, n, triplets)
            .unwrap_or_else(|_| unreachable!())
    }
}

impl<'a, T: ComplexScalar> AddAssign<&'a BlockMatrix<T>> for BlockMatrix<T> {
    /// *Panics if the block structures differ.* Use
    /// [`BlockMatrix::try_add_assign`] to get an error instead.
    fn add_assign(&mut self, other: &'a BlockMatrix<T>) {
        if let Err(err) = self.try_add_assign(other) { panic!("{err}"); }
    }
}
