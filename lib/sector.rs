//! Super-block symmetry sectors and their partition into patches.
//!
//! A super-block is the product of a left and a right sub-block basis. For a
//! fixed target [`Qn`], only pairs of (left group, right group) whose fused
//! quantum numbers equal the target contribute; each such pair is a *patch*.
//! Target vectors are stored patch after patch, each patch as a column-major
//! `left_size x right_size` matrix:
//!
//! ```text
//!                 right group gr
//!               ┌──────────────┐
//!  left group gl│  X_p         │  element (il, ir) of patch p lives at
//!               │              │  offset_p + il + ir * left_size_p
//!               └──────────────┘
//! ```

use nalgebra as na;
use num_traits::Zero;
use rand::{
    Rng,
    distributions::{ Distribution, Standard },
};
use thiserror::Error;
use crate::{ ComplexScalar, basis::Basis, qn::Qn };

#[derive(Debug, Error)]
pub enum SectorError {
    /// Returned when no pair of left and right groups fuses to the target.
    #[error("error in sector creation: no states with quantum numbers {0}")]
    EmptySector(Qn),

    /// Returned when left and right bases carry quantum numbers of different
    /// lengths, or the target does not match them.
    #[error("error in sector creation: quantum number lengths differ")]
    QnLengthMismatch,
}
use SectorError::*;
pub type SectorResult<T> = Result<T, SectorError>;

/// Selects one of the two sub-block factors of the super-block.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Side {
    Left,
    Right,
}

/// A contiguous range of a sector vector sharing one (left group, right group)
/// pair.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Patch {
    pub left_group: usize,
    pub right_group: usize,
    pub left_size: usize,
    pub right_size: usize,
    pub offset: usize,
}

impl Patch {
    /// Number of vector elements in the patch.
    pub fn size(&self) -> usize { self.left_size * self.right_size }

    /// Return the group index of the patch on one side.
    pub fn group(&self, side: Side) -> usize {
        match side {
            Side::Left => self.left_group,
            Side::Right => self.right_group,
        }
    }
}

/// A left/right super-block pair restricted to one target symmetry sector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SuperSector {
    left: Basis,
    right: Basis,
    target: Qn,
    patches: Vec<Patch>,
    // patch joining left group gl and right group gr, at gl * ngroups_right + gr
    patch_of: Vec<Option<usize>>,
    size: usize,
}

impl SuperSector {
    /// Enumerate all patches of the `target` sector.
    ///
    /// Patches are ordered by left group, then by right group, and laid out
    /// contiguously. Fails if the sector is empty.
    pub fn new(left: Basis, right: Basis, target: Qn) -> SectorResult<Self> {
        if left.qn(0).len() != right.qn(0).len() || left.qn(0).len() != target.len() {
            return Err(QnLengthMismatch);
        }
        let nr = right.number_of_groups();
        let mut patches: Vec<Patch> = Vec::new();
        let mut patch_of: Vec<Option<usize>>
            = vec![None; left.number_of_groups() * nr];
        let mut offset: usize = 0;
        for gl in 0..left.number_of_groups() {
            for gr in 0..nr {
                if left.group_qn(gl).fuse(right.group_qn(gr)) != target {
                    continue;
                }
                let patch = Patch {
                    left_group: gl,
                    right_group: gr,
                    left_size: left.group_size(gl),
                    right_size: right.group_size(gr),
                    offset,
                };
                offset += patch.size();
                patch_of[gl * nr + gr] = Some(patches.len());
                patches.push(patch);
            }
        }
        if patches.is_empty() { return Err(EmptySector(target)); }
        Ok(Self { left, right, target, patches, patch_of, size: offset })
    }

    pub fn left(&self) -> &Basis { &self.left }

    pub fn right(&self) -> &Basis { &self.right }

    /// Return the basis on one side.
    pub fn basis(&self, side: Side) -> &Basis {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    pub fn target(&self) -> &Qn { &self.target }

    /// Dimension of the sector, i.e. the length of target vectors.
    pub fn size(&self) -> usize { self.size }

    pub fn number_of_patches(&self) -> usize { self.patches.len() }

    pub fn patch(&self, p: usize) -> &Patch { &self.patches[p] }

    pub fn patches(&self) -> &[Patch] { &self.patches }

    /// Group indices of every patch on one side, in patch order.
    pub fn patch_groups(&self, side: Side) -> Vec<usize> {
        self.patches.iter().map(|p| p.group(side)).collect()
    }

    /// Size of every patch on one side, in patch order.
    pub fn patch_sizes(&self, side: Side) -> Vec<usize> {
        let basis = self.basis(side);
        self.patches.iter()
            .map(|p| {
                let g = p.group(side);
                basis.partition(g + 1) - basis.partition(g)
            })
            .collect()
    }

    /// Flattened offset of patch `p`.
    pub fn offset_for_patch(&self, p: usize) -> usize { self.patches[p].offset }

    /// Return the patch joining a left and a right group, if it belongs to
    /// the sector.
    pub fn find_patch(&self, left_group: usize, right_group: usize)
        -> Option<usize>
    {
        self.patch_of[left_group * self.right.number_of_groups() + right_group]
    }

    /// Return the sector-vector position of the product state `(l, r)` of
    /// (sorted) left and right basis states, if it belongs to the sector.
    pub fn index_of(&self, l: usize, r: usize) -> Option<usize> {
        let gl = self.left.group_of(l);
        let gr = self.right.group_of(r);
        let p = self.find_patch(gl, gr)?;
        let patch = &self.patches[p];
        let il = l - self.left.partition(gl);
        let ir = r - self.right.partition(gr);
        Some(patch.offset + il + ir * patch.left_size)
    }

    /// Inverse of [`Self::index_of`].
    ///
    /// *Panics if `i` is not less than the sector size.*
    pub fn position(&self, i: usize) -> (usize, usize) {
        if i >= self.size { panic!("sector index out of bounds"); }
        let p = self.patches.partition_point(|patch| patch.offset <= i) - 1;
        let patch = &self.patches[p];
        let k = i - patch.offset;
        let il = k % patch.left_size;
        let ir = k / patch.left_size;
        (
            self.left.partition(patch.left_group) + il,
            self.right.partition(patch.right_group) + ir,
        )
    }

    /// View the part of a sector vector belonging to patch `p` as a matrix.
    pub fn patch_view<'a, T>(&self, v: &'a [T], p: usize) -> na::DMatrixView<'a, T>
    where T: na::Scalar
    {
        let patch = &self.patches[p];
        na::DMatrixView::from_slice(
            &v[patch.offset..patch.offset + patch.size()],
            patch.left_size,
            patch.right_size,
        )
    }

    /// Mutable version of [`Self::patch_view`].
    pub fn patch_view_mut<'a, T>(&self, v: &'a mut [T], p: usize)
        -> na::DMatrixViewMut<'a, T>
    where T: na::Scalar
    {
        let patch = &self.patches[p];
        na::DMatrixViewMut::from_slice(
            &mut v[patch.offset..patch.offset + patch.size()],
            patch.left_size,
            patch.right_size,
        )
    }

    /// Generate a random, normalized sector vector, e.g. as the initial guess
    /// of an eigensolver.
    ///
    /// Every component (real and imaginary part alike) is drawn symmetrically
    /// about zero before normalization.
    pub fn random_vector<T, R>(&self, rng: &mut R) -> na::DVector<T>
    where
        T: ComplexScalar,
        R: Rng + ?Sized,
        Standard: Distribution<T>,
    {
        let mut v: na::DVector<T>
            = na::DVector::from_fn(self.size, |_, _| rng.gen::<T>() - rng.gen::<T>());
        let norm = v.norm();
        if norm > T::Re::zero() { v.unscale_mut(norm); }
        v
    }
}
