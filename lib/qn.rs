//! Conserved quantum numbers labeling symmetry sectors.

use std::fmt;

/// A record of conserved quantum numbers for one basis state or one symmetry
/// sector.
///
/// Ordering is lexicographic over `(odd, other, jm, flavor)`, which is the
/// order states are sorted in by [`Basis`][crate::basis::Basis].
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Qn {
    /// Fermionic parity: `true` if the state holds an odd number of fermions.
    pub odd: bool,
    /// Additive quantum numbers (particle numbers, twice the total Sz, ...).
    pub other: Vec<usize>,
    /// `(j, m)` pair carried along for SU(2)-labeled bases.
    pub jm: (usize, usize),
    /// Free-form flavor tag.
    pub flavor: usize,
}

impl Qn {
    pub fn new(odd: bool, other: Vec<usize>, jm: (usize, usize), flavor: usize)
        -> Self
    {
        Self { odd, other, jm, flavor }
    }

    /// Even-parity record with `n` additive numbers, all zero.
    pub fn zero(n: usize) -> Self {
        Self { odd: false, other: vec![0; n], jm: (0, 0), flavor: 0 }
    }

    /// Shorthand for a record whose parity follows the first additive number,
    /// which is the usual convention when `other[0]` counts fermions.
    pub fn from_counts(other: Vec<usize>) -> Self {
        let odd = other.first().is_some_and(|n| n % 2 == 1);
        Self { odd, other, jm: (0, 0), flavor: 0 }
    }

    /// Number of additive quantum numbers.
    pub fn len(&self) -> usize { self.other.len() }

    pub fn is_empty(&self) -> bool { self.other.is_empty() }

    /// Combine the numbers of two sub-blocks into those of their product.
    ///
    /// Parities combine by exclusive-or and additive numbers by sum. `(j, m)`
    /// pairs are added componentwise; no SU(2) recoupling is done. The flavor
    /// tag is per-site and is reset.
    ///
    /// *Panics if the two records carry different numbers of additive
    /// quantum numbers.*
    pub fn fuse(&self, rhs: &Self) -> Self {
        if self.other.len() != rhs.other.len() {
            panic!("cannot fuse quantum numbers of different lengths");
        }
        Self {
            odd: self.odd ^ rhs.odd,
            other: self.other.iter().zip(&rhs.other).map(|(a, b)| a + b).collect(),
            jm: (self.jm.0 + rhs.jm.0, self.jm.1 + rhs.jm.1),
            flavor: 0,
        }
    }

    /// Return `+1` for even states, `-1` for odd ones.
    pub fn fermion_sign(&self) -> i8 { if self.odd { -1 } else { 1 } }
}

impl fmt::Display for Qn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Qn({}; [", if self.odd { "odd" } else { "even" })?;
        let n = self.other.len();
        for (k, x) in self.other.iter().enumerate() {
            write!(f, "{x}")?;
            if k < n - 1 { write!(f, ", ")?; }
        }
        write!(f, "]; jm = ({}, {}); flavor = {})", self.jm.0, self.jm.1, self.flavor)
    }
}
