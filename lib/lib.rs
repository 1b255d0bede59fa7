//! Density-matrix truncation and Kronecker-structured Hamiltonian-vector
//! products for the super-block step of a DMRG solver.
//!
//! Two pieces of a sweep step live here:
//!
//! - Building the reduced density matrix of one or several target states over
//!   the basis being expanded, and diagonalizing it block by block so that the
//!   sweep driver can keep the heaviest states (see [`density_matrix`]).
//! - Applying the super-block Hamiltonian `H = Σ_c A_c ⊗ B_c` to trial vectors
//!   during iterative eigensolving. The super-block is split into symmetry
//!   patches ([`sector`]), every connection is sliced per pair of patches
//!   ([`kron`]), and the whole product is then executed as a batch of small
//!   dense matrix multiplications ([`batched`]).
//!
//! ```text
//!   target ψ ──► DensityMatrix ──► BlockMatrix ──► diag ──► truncation
//!
//!   SuperSector ─┐
//!                ├─► KronIndex ──► BatchedGemm ──► H·v (per eigensolver step)
//!   Connections ─┘
//! ```
//!
//! Model Hamiltonians, lattice geometry and the sweep driver are outside this
//! crate; they talk to it through [`operator::OperatorStorage`],
//! [`basis::Basis`], and plain [`kron::Connection`] lists.

use nalgebra as na;
use num_traits::Zero;

pub use num_complex::{ Complex32 as C32, Complex64 as C64 };

pub mod config;
pub mod qn;
pub mod basis;
pub mod sparse;
pub mod operator;
pub mod block_matrix;
pub mod sector;
pub mod density_matrix;
pub mod kron;
pub mod batched;

/// Convenience trait to identify number types that can be used in the
/// linear-algebraic operations of this crate.
///
/// Covers `f32`, `f64`, [`C32`], and [`C64`]. Dense work is delegated to
/// `nalgebra`, so this is essentially [`na::ComplexField`] plus the thread
/// bounds needed by the batched multiplication engine.
pub trait ComplexScalar
where Self: na::ComplexField<RealField = Self::Re> + Copy + Send + Sync
{
    /// Type for associated real values (eigenvalues, weights, norms).
    type Re: na::RealField + Copy + Send + Sync;
}

impl<A> ComplexScalar for A
where
    A: na::ComplexField + Copy + Send + Sync,
    <A as na::ComplexField>::RealField: Copy + Send + Sync,
{
    type Re = <A as na::ComplexField>::RealField;
}

/// Squared 2-norm of a slice.
pub(crate) fn norm_sqr<T: ComplexScalar>(v: &[T]) -> T::Re {
    v.iter()
        .fold(T::Re::zero(), |acc, a| acc + a.modulus_squared())
}
