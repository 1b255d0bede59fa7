//! Labeled operator matrices handed over by the model layer.
//!
//! The model layer owns the physics; this crate only needs its operators as
//! tagged sparse matrices. They are stored by string label (`"c"`, `"n"`,
//! `"Splus"`, `"Sz"`, ...), with one entry per internal degree of freedom
//! (e.g. spin projection for `"c"`).

use num_traits::One;
use rustc_hash::FxHashMap;
use thiserror::Error;
use crate::{
    ComplexScalar,
    basis::Basis,
    sparse::{ SparseError, SparseMatrix },
};

#[derive(Debug, Error)]
pub enum OperatorError {
    /// Returned when looking up a label that was never created.
    #[error("error in operator lookup: unknown label {0:?}")]
    UnknownLabel(String),

    /// Returned when looking up a degree of freedom past the end of a label's
    /// operator list.
    #[error("error in operator lookup: label {0:?} has no degree of freedom {1}")]
    DofOutOfRange(String, usize),

    /// Returned when building a matrix in a natural basis and the image of a
    /// ket is not itself part of the basis.
    #[error("error in operator construction: state {0:#b} is missing from the basis")]
    MissingBasisState(usize),

    /// Returned when a creation operator would map a basis state onto itself.
    #[error("error in operator construction: creation operator cannot be diagonal (ket {0:#b})")]
    DiagonalCreation(usize),

    /// Returned when an operator matrix does not match the basis it is
    /// attached to.
    #[error("error in operator construction: matrix is {0}x{1} but the basis has {2} states")]
    BasisMismatch(usize, usize, usize),

    #[error("sparse matrix error: {0}")]
    Sparse(#[from] SparseError),
}
use OperatorError::*;
pub type OperatorResult<T> = Result<T, OperatorError>;

/// Commutation statistics of an operator.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FermionOrBoson {
    Fermion,
    Boson,
}

/// A sparse operator matrix together with its symmetry tags.
#[derive(Clone, Debug, PartialEq)]
pub struct Operator<T: ComplexScalar> {
    pub data: SparseMatrix<T>,
    pub kind: FermionOrBoson,
    /// `(j, m)` of the irreducible tensor operator, `(0, 0)` without SU(2).
    pub jm: (usize, usize),
    pub angular_factor: T::Re,
}

impl<T: ComplexScalar> Operator<T> {
    pub fn new(data: SparseMatrix<T>, kind: FermionOrBoson) -> Self {
        Self { data, kind, jm: (0, 0), angular_factor: T::Re::one() }
    }

    pub fn fermion(data: SparseMatrix<T>) -> Self {
        Self::new(data, FermionOrBoson::Fermion)
    }

    pub fn boson(data: SparseMatrix<T>) -> Self {
        Self::new(data, FermionOrBoson::Boson)
    }

    pub fn is_fermionic(&self) -> bool { self.kind == FermionOrBoson::Fermion }

    /// Return a copy expressed in the quantum-number-sorted order of `basis`,
    /// assuming `self` is in the basis' natural order.
    pub fn sorted_for(&self, basis: &Basis) -> OperatorResult<Self> {
        let (m, n) = self.data.shape();
        if m != basis.size() || n != basis.size() {
            return Err(BasisMismatch(m, n, basis.size()));
        }
        let data = self.data.permuted(basis.permutation())?;
        Ok(Self { data, ..self.clone() })
    }
}

/// Operators grouped by label.
#[derive(Clone, Debug)]
pub struct OperatorStorage<T: ComplexScalar> {
    ops: FxHashMap<String, Vec<Operator<T>>>,
}

impl<T: ComplexScalar> Default for OperatorStorage<T> {
    fn default() -> Self { Self::new() }
}

impl<T: ComplexScalar> OperatorStorage<T> {
    pub fn new() -> Self { Self { ops: FxHashMap::default() } }

    /// Create a label if needed and return its operator list for filling.
    pub fn create_label(&mut self, label: &str) -> &mut Vec<Operator<T>> {
        self.ops.entry(label.to_string()).or_default()
    }

    /// Append an operator under `label`, returning its degree-of-freedom
    /// index.
    pub fn push(&mut self, label: &str, op: Operator<T>) -> usize {
        let ops = self.create_label(label);
        ops.push(op);
        ops.len() - 1
    }

    /// Return the operator for `label` and degree of freedom `dof`.
    pub fn get(&self, label: &str, dof: usize) -> OperatorResult<&Operator<T>> {
        let ops = self.ops.get(label)
            .ok_or_else(|| UnknownLabel(label.to_string()))?;
        ops.get(dof)
            .ok_or_else(|| DofOutOfRange(label.to_string(), dof))
    }

    pub fn contains(&self, label: &str) -> bool { self.ops.contains_key(label) }

    /// Number of degrees of freedom stored under `label`.
    pub fn dofs(&self, label: &str) -> usize {
        self.ops.get(label).map(|ops| ops.len()).unwrap_or(0)
    }

    /// All labels, sorted.
    pub fn labels(&self) -> Vec<&str> {
        let mut labels: Vec<&str> = self.ops.keys().map(|s| s.as_str()).collect();
        labels.sort_unstable();
        labels
    }
}

/// Build the matrix of a creation operator `c†` in a natural basis of
/// bit-encoded kets.
///
/// `mask` selects the bit the operator fills; `sign(ket)` gives the
/// fermionic sign picked up when acting on `ket`. Row `i` holds the image of
/// ket `i`, i.e. entry `(i, j)` is set when `kets[j]` is `kets[i]` with the
/// masked bit set; this is the row convention model code builds `c` from.
///
/// Fails if the image of a ket is missing from `kets`, or if it coincides with
/// the ket itself.
pub fn creation_matrix<T, F>(kets: &[usize], mask: usize, sign: F)
    -> OperatorResult<SparseMatrix<T>>
where
    T: ComplexScalar,
    F: Fn(usize) -> T,
{
    let lookup: FxHashMap<usize, usize>
        = kets.iter().enumerate().map(|(k, &ket)| (ket, k)).collect();
    let mut triplets: Vec<(usize, usize, T)> = Vec::new();
    for (i, &ket) in kets.iter().enumerate() {
        if ket & mask != 0 { continue; }
        let bra = ket ^ mask;
        let j = *lookup.get(&bra).ok_or(MissingBasisState(bra))?;
        if i == j { return Err(DiagonalCreation(ket)); }
        triplets.push((i, j, sign(ket)));
    }
    Ok(SparseMatrix::from_triplets(kets.len(), kets.len(), triplets)?)
}
