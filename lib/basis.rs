//! Quantum-number-sorted bases for left and right sub-blocks.
//!
//! States are stably sorted by their [`Qn`] so that each symmetry sector
//! ("group") occupies a contiguous range of indices. The boundaries of these
//! ranges are the basis' *partitions*:
//!
//! ```text
//! index:      0   1   2 | 3   4 | 5
//! group:        0       |   1   | 2
//! partition:  0           3       5   6
//! ```

use std::ops::Range;
use itertools::Itertools;
use thiserror::Error;
use crate::qn::Qn;

#[derive(Debug, Error)]
pub enum BasisError {
    /// Returned when attempting to create a basis with no states.
    #[error("error in basis creation: cannot create an empty basis")]
    EmptyBasis,

    /// Returned when states carry different numbers of additive quantum
    /// numbers.
    #[error("error in basis creation: inconsistent quantum number lengths")]
    InconsistentQn,
}
use BasisError::*;
pub type BasisResult<T> = Result<T, BasisError>;

/// An ordered basis whose states are grouped by conserved quantum numbers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Basis {
    // per-state quantum numbers, sorted
    qns: Vec<Qn>,
    // sorted index -> index in the original (natural) ordering
    permutation: Vec<usize>,
    // length ngroups + 1, partitions[0] == 0, partitions[ngroups] == size
    partitions: Vec<usize>,
}

impl Basis {
    /// Sort states by quantum number and compute the group partitions.
    ///
    /// `qns[k]` is the record of the `k`-th state in its natural ordering. The
    /// sort is stable, so states sharing a record keep their relative order.
    ///
    /// Fails if `qns` is empty or the records disagree in length.
    pub fn new(qns: Vec<Qn>) -> BasisResult<Self> {
        if qns.is_empty() { return Err(EmptyBasis); }
        let len = qns[0].len();
        if qns.iter().any(|q| q.len() != len) { return Err(InconsistentQn); }
        let permutation: Vec<usize>
            = (0..qns.len())
            .sorted_by(|&a, &b| qns[a].cmp(&qns[b]))
            .collect();
        let qns: Vec<Qn>
            = permutation.iter()
            .map(|&k| qns[k].clone())
            .collect();
        let mut partitions: Vec<usize> = vec![0];
        partitions.extend(
            qns.iter().enumerate().skip(1)
                .filter(|(k, q)| *q != &qns[k - 1])
                .map(|(k, _)| k)
        );
        partitions.push(qns.len());
        Ok(Self { qns, permutation, partitions })
    }

    /// Number of states.
    pub fn size(&self) -> usize { self.qns.len() }

    /// Number of symmetry groups.
    pub fn number_of_groups(&self) -> usize { self.partitions.len() - 1 }

    /// Return the first index of group `g`; `partition(number_of_groups())`
    /// is the basis size.
    ///
    /// *Panics if `g > number_of_groups()`.*
    pub fn partition(&self, g: usize) -> usize { self.partitions[g] }

    /// Return all partition boundaries.
    pub fn partitions(&self) -> &[usize] { &self.partitions }

    /// Return the index range of group `g`.
    pub fn group_range(&self, g: usize) -> Range<usize> {
        self.partitions[g]..self.partitions[g + 1]
    }

    /// Return the number of states in group `g`.
    pub fn group_size(&self, g: usize) -> usize {
        self.partitions[g + 1] - self.partitions[g]
    }

    /// Return the quantum numbers shared by group `g`.
    pub fn group_qn(&self, g: usize) -> &Qn { &self.qns[self.partitions[g]] }

    /// Return the group holding records equal to `qn`, if any.
    pub fn find_group(&self, qn: &Qn) -> Option<usize> {
        (0..self.number_of_groups())
            .find(|&g| self.group_qn(g) == qn)
    }

    /// Return the group containing (sorted) state `k`.
    pub fn group_of(&self, k: usize) -> usize {
        self.partitions.partition_point(|&p| p <= k) - 1
    }

    /// Return the quantum numbers of (sorted) state `k`.
    pub fn qn(&self, k: usize) -> &Qn { &self.qns[k] }

    /// Return all per-state quantum numbers in sorted order.
    pub fn qns(&self) -> &[Qn] { &self.qns }

    /// Sorted index -> natural index.
    pub fn permutation(&self) -> &[usize] { &self.permutation }

    /// Natural index -> sorted index.
    pub fn inverse_permutation(&self) -> Vec<usize> {
        let mut inv = vec![0; self.permutation.len()];
        self.permutation.iter().enumerate()
            .for_each(|(sorted, &natural)| { inv[natural] = sorted; });
        inv
    }

    /// `±1` fermionic parity of every (sorted) state.
    pub fn fermion_signs(&self) -> Vec<i8> {
        self.qns.iter().map(|q| q.fermion_sign()).collect()
    }
}
