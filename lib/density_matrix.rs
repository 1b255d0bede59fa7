//! Reduced density matrices of super-block target states.
//!
//! At every step of a sweep, the sub-block being expanded is truncated to the
//! states of largest weight in the reduced density matrix
//!
//! ```text
//! ρ = Σ_k w_k Tr_other( |ψ_k⟩⟨ψ_k| ),    Σ_k w_k = 1,  ⟨ψ_k|ψ_k⟩ = 1
//! ```
//!
//! where the trace runs over the sub-block that is *not* expanded. Because
//! every target lives in a single symmetry sector, ρ is block-diagonal over the
//! groups of the expanded basis and is stored as a [`BlockMatrix`].
//!
//! How the targets and their weights are chosen is what distinguishes
//! ground-state, multi-target, and time-evolution runs ([`Targets`]); the
//! resulting operator is consumed identically in all three cases through
//! [`DensityMatrix::matrix`], [`DensityMatrix::rank`], and
//! [`DensityMatrix::diag`].
//!
//! With [`DensityMatrixParams::use_svd`] set, ρ is never formed to obtain its
//! spectrum. Instead, for each group `g` the weighted wavefunction pieces are
//! stacked into a factor `M_g` with `ρ_g = M_g M_g†`, and eigenpairs come from
//! the singular value decomposition of `M_g` (`λ = s²`), which avoids squaring
//! the condition number.

use std::cmp::Ordering;
use approx::AbsDiffEq;
use nalgebra::{ self as na, ComplexField as _ };
use num_traits::{ One, Zero };
use once_cell::sync::OnceCell;
use serde::{ Deserialize, Serialize };
use thiserror::Error;
use tracing::{ debug, info };
use crate::{
    ComplexScalar,
    block_matrix::BlockMatrix,
    config::DensityMatrixParams,
    norm_sqr,
    sector::{ Patch, Side, SuperSector },
};

/// Iteration cap handed to the dense eigen- and singular value solvers.
const MAX_ITER: usize = 1000;

#[derive(Debug, Error)]
pub enum DensityMatrixError {
    /// Returned when a target vector's length differs from the sector size.
    #[error("error in density matrix creation: target {index} has length {got}, expected {expected}")]
    TargetIncompatibleShape { index: usize, got: usize, expected: usize },

    /// Returned when a target weight is negative or a ground-state weight lies
    /// outside `[0, 1]`.
    #[error("error in density matrix creation: invalid target weight")]
    InvalidWeight,

    /// Returned when every target has zero norm or zero weight.
    #[error("error in density matrix creation: no target with non-zero weight")]
    NoTargets,

    /// Returned when the dense eigensolver or SVD fails to converge on a
    /// block.
    #[error("error in density matrix diagonalization: no convergence in block {0}")]
    NotConverged(usize),

    /// Returned when converting an unknown job character.
    #[error("error in density matrix diagonalization: invalid job {0:?}, expected 'N' or 'V'")]
    InvalidJobz(char),
}
use DensityMatrixError::*;
pub type DensityMatrixResult<T> = Result<T, DensityMatrixError>;

/// Which side of the super-block is being grown.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// ρ lives on the left (system) basis; the right sub-block is traced out.
    #[default]
    ExpandSystem,
    /// ρ lives on the right (environment) basis; the left sub-block is traced
    /// out.
    ExpandEnvironment,
}

impl Direction {
    /// The side of the super-block whose basis ρ is built on.
    pub fn side(self) -> Side {
        match self {
            Self::ExpandSystem => Side::Left,
            Self::ExpandEnvironment => Side::Right,
        }
    }
}

/// What [`DensityMatrix::diag`] should compute.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Jobz {
    /// Eigenvalues only (`'N'`).
    ValuesOnly,
    /// Eigenvalues and eigenvectors (`'V'`).
    Vectors,
}

impl TryFrom<char> for Jobz {
    type Error = DensityMatrixError;

    fn try_from(c: char) -> DensityMatrixResult<Self> {
        match c {
            'N' | 'n' => Ok(Self::ValuesOnly),
            'V' | 'v' => Ok(Self::Vectors),
            _ => Err(InvalidJobz(c)),
        }
    }
}

/// The kind of run a density matrix was built for.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TargetKind {
    GroundState,
    MultiTarget,
    TimeTarget,
}

/// Target states a density matrix is built from. All vectors are sector
/// vectors in the patch layout of [`SuperSector`].
#[derive(Clone, Debug)]
pub enum Targets<'a, T: ComplexScalar> {
    /// A single state with weight 1.
    GroundState(&'a [T]),

    /// Several states with user-supplied non-negative weights, normalized to
    /// sum to 1.
    MultiTarget(Vec<(&'a [T], T::Re)>),

    /// A ground state with weight `gs_weight` mixed with time-evolved
    /// snapshots that share the remaining weight evenly. Snapshots with zero
    /// norm are skipped; if none remain, the ground state takes all the
    /// weight.
    TimeTarget {
        ground: &'a [T],
        gs_weight: T::Re,
        snapshots: Vec<&'a [T]>,
    },
}

impl<'a, T: ComplexScalar> Targets<'a, T> {
    pub fn kind(&self) -> TargetKind {
        match self {
            Self::GroundState(..) => TargetKind::GroundState,
            Self::MultiTarget(..) => TargetKind::MultiTarget,
            Self::TimeTarget { .. } => TargetKind::TimeTarget,
        }
    }

    // return every contributing vector with the factor `c` such that
    // ρ = Σ c |v⟩⟨v| has unit trace
    fn weighted(self, size: usize) -> DensityMatrixResult<Vec<(&'a [T], T::Re)>> {
        let raw: Vec<(&'a [T], T::Re)> = match self {
            Self::GroundState(psi) => vec![(psi, T::Re::one())],
            Self::MultiTarget(states) => states,
            Self::TimeTarget { ground, gs_weight, snapshots } => {
                if gs_weight < T::Re::zero() || gs_weight > T::Re::one() {
                    return Err(InvalidWeight);
                }
                let snapshots: Vec<&'a [T]>
                    = snapshots.into_iter()
                    .filter(|v| norm_sqr(v) > T::Re::zero())
                    .collect();
                if snapshots.is_empty() {
                    vec![(ground, T::Re::one())]
                } else {
                    let n: T::Re = na::convert(snapshots.len() as f64);
                    let w = (T::Re::one() - gs_weight) / n;
                    std::iter::once((ground, gs_weight))
                        .chain(snapshots.into_iter().map(|v| (v, w)))
                        .collect()
                }
            },
        };
        for (index, (v, w)) in raw.iter().enumerate() {
            if v.len() != size {
                return Err(TargetIncompatibleShape { index, got: v.len(), expected: size });
            }
            if *w < T::Re::zero() { return Err(InvalidWeight); }
        }
        let kept: Vec<(&'a [T], T::Re, T::Re)>
            = raw.into_iter()
            .map(|(v, w)| (v, w, norm_sqr(v)))
            .filter(|(_, w, n)| *w > T::Re::zero() && *n > T::Re::zero())
            .collect();
        let total
            = kept.iter()
            .fold(T::Re::zero(), |acc, (_, w, _)| acc + *w);
        if kept.is_empty() { return Err(NoTargets); }
        Ok(kept.into_iter().map(|(v, w, n)| (v, w / (total * n))).collect())
    }
}

#[derive(Clone, Debug)]
enum Rho<T: ComplexScalar> {
    // ρ formed explicitly
    Explicit(BlockMatrix<T>),
    // ρ_g = M_g M_g†, formed only on request
    Factored {
        factors: Vec<na::DMatrix<T>>,
        rho: OnceCell<BlockMatrix<T>>,
    },
}

/// The reduced density matrix of one or more target states over the basis
/// being expanded.
#[derive(Clone, Debug)]
pub struct DensityMatrix<T: ComplexScalar> {
    kind: TargetKind,
    params: DensityMatrixParams,
    sizes: Vec<usize>,
    data: Rho<T>,
    eigenvectors: Option<BlockMatrix<T>>,
}

impl<T: ComplexScalar> DensityMatrix<T> {
    /// Build ρ for `targets`, which must be vectors of `sector`.
    ///
    /// Weights are normalized to sum to 1 and each vector to unit norm, so
    /// that `Tr ρ = 1`. Targets with zero norm or zero weight do not
    /// contribute.
    ///
    /// Fails if a vector has the wrong length, a weight is invalid, or no
    /// target contributes.
    pub fn assemble(
        sector: &SuperSector,
        targets: Targets<'_, T>,
        params: DensityMatrixParams,
    ) -> DensityMatrixResult<Self>
    {
        let kind = targets.kind();
        let weighted = targets.weighted(sector.size())?;
        let side = params.direction.side();
        let basis = sector.basis(side);
        let sizes: Vec<usize>
            = (0..basis.number_of_groups())
            .map(|g| basis.group_size(g))
            .collect();

        // each patch of each target contributes a piece whose rows are
        // indexed by the kept side and whose columns by the traced side
        let piece = |v: &[T], p: usize| -> na::DMatrix<T> {
            let x = sector.patch_view(v, p);
            match side {
                Side::Left => x.clone_owned(),
                Side::Right => x.transpose(),
            }
        };

        let data = if params.use_svd {
            let mut ncols: Vec<usize> = vec![0; sizes.len()];
            for _ in weighted.iter() {
                sector.patches().iter()
                    .for_each(|p| { ncols[p.group(side)] += other_size(p, side); });
            }
            let mut factors: Vec<na::DMatrix<T>>
                = sizes.iter().zip(&ncols)
                .map(|(&n, &m)| na::DMatrix::zeros(n, m))
                .collect();
            let mut filled: Vec<usize> = vec![0; sizes.len()];
            for (v, c) in weighted.iter() {
                let c = T::from_real((*c).sqrt());
                for (p, patch) in sector.patches().iter().enumerate() {
                    let g = patch.group(side);
                    let x = piece(v, p) * c;
                    factors[g].columns_mut(filled[g], x.ncols()).copy_from(&x);
                    filled[g] += x.ncols();
                }
            }
            Rho::Factored { factors, rho: OnceCell::new() }
        } else {
            let mut rho: BlockMatrix<T> = BlockMatrix::zeros(sizes.iter().copied());
            for (v, c) in weighted.iter() {
                let c = T::from_real(*c);
                for (p, patch) in sector.patches().iter().enumerate() {
                    let x = piece(v, p);
                    let mut block = rho.block_mut(patch.group(side));
                    block.gemm(c, &x, &x.adjoint(), T::one());
                }
            }
            Rho::Explicit(rho)
        };

        if params.debug {
            debug!(
                ?kind,
                targets = weighted.len(),
                blocks = sizes.len(),
                use_svd = params.use_svd,
                "assembled density matrix",
            );
        }
        Ok(Self { kind, params, sizes, data, eigenvectors: None })
    }

    /// Return the assembled density-matrix operator.
    ///
    /// When built with `use_svd`, ρ is materialized from its factors on the
    /// first call; later calls return the same object.
    pub fn matrix(&self) -> &BlockMatrix<T> {
        match &self.data {
            Rho::Explicit(rho) => rho,
            Rho::Factored { factors, rho } => {
                rho.get_or_init(|| {
                    BlockMatrix::from_square_blocks(
                        factors.iter().map(|m| m * m.adjoint()).collect())
                })
            },
        }
    }

    /// Total dimension of ρ, i.e. the size of the expanded basis.
    pub fn rank(&self) -> usize { self.sizes.iter().sum() }

    /// Sizes of the blocks of ρ.
    pub fn block_sizes(&self) -> &[usize] { &self.sizes }

    pub fn kind(&self) -> TargetKind { self.kind }

    pub fn params(&self) -> &DensityMatrixParams { &self.params }

    /// Diagonalize ρ block by block.
    ///
    /// `eigenvalues` is overwritten with [`Self::rank`] values in block order,
    /// ascending within each block, so that value `k` belongs to global basis
    /// column `k` of [`Self::eigenvectors`]. With [`Jobz::Vectors`], the
    /// block-diagonal matrix of eigenvectors is kept; with
    /// [`Jobz::ValuesOnly`] any previously stored eigenvectors are dropped.
    ///
    /// Fails if the solver does not converge on some block; nothing is
    /// retried.
    pub fn diag(&mut self, eigenvalues: &mut Vec<T::Re>, jobz: Jobz)
        -> DensityMatrixResult<()>
    {
        eigenvalues.clear();
        eigenvalues.reserve(self.rank());
        let mut vectors: Vec<na::DMatrix<T>> = Vec::new();
        let mut collect = |k: usize, (vals, vecs): (Vec<T::Re>, Option<na::DMatrix<T>>)| {
            eigenvalues.extend(vals);
            if let Some(vecs) = vecs {
                debug_assert_eq!(vecs.nrows(), self.sizes[k]);
                vectors.push(vecs);
            }
        };
        match &self.data {
            Rho::Explicit(rho) => {
                for (k, block) in rho.blocks().iter().enumerate() {
                    collect(k, eigh_block(block, k, jobz)?);
                }
            },
            Rho::Factored { factors, .. } => {
                for (k, m) in factors.iter().enumerate() {
                    collect(k, svd_block(m, k, jobz)?);
                }
            },
        }
        self.eigenvectors = match jobz {
            Jobz::Vectors => Some(BlockMatrix::from_square_blocks(vectors)),
            Jobz::ValuesOnly => None,
        };

        if self.params.verbose || self.params.debug {
            let trace
                = eigenvalues.iter()
                .fold(T::Re::zero(), |acc, l| acc + *l);
            if self.params.verbose {
                info!(kind = ?self.kind, rank = self.rank(), ?trace, "diagonalized density matrix");
            }
            if self.params.debug {
                debug!(?eigenvalues, "density matrix spectrum");
            }
        }
        Ok(())
    }

    /// Eigenvectors from the last call to [`Self::diag`] with
    /// [`Jobz::Vectors`], as columns of a block-diagonal matrix.
    pub fn eigenvectors(&self) -> Option<&BlockMatrix<T>> {
        self.eigenvectors.as_ref()
    }
}

fn other_size(patch: &Patch, side: Side) -> usize {
    match side {
        Side::Left => patch.right_size,
        Side::Right => patch.left_size,
    }
}

// sort by ascending eigenvalue, permuting eigenvector columns along
fn sorted<T: ComplexScalar>(vals: Vec<T::Re>, vecs: Option<na::DMatrix<T>>)
    -> (Vec<T::Re>, Option<na::DMatrix<T>>)
{
    let mut order: Vec<usize> = (0..vals.len()).collect();
    order.sort_by(|&a, &b| vals[a].partial_cmp(&vals[b]).unwrap_or(Ordering::Equal));
    let vals_sorted: Vec<T::Re> = order.iter().map(|&k| vals[k]).collect();
    let vecs_sorted
        = vecs.map(|v| {
            na::DMatrix::from_fn(v.nrows(), order.len(), |i, j| v[(i, order[j])])
        });
    (vals_sorted, vecs_sorted)
}

fn eigh_block<T: ComplexScalar>(block: &na::DMatrix<T>, k: usize, jobz: Jobz)
    -> DensityMatrixResult<(Vec<T::Re>, Option<na::DMatrix<T>>)>
{
    if block.nrows() == 0 {
        return Ok((Vec::new(), (jobz == Jobz::Vectors).then(|| block.clone())));
    }
    match jobz {
        Jobz::ValuesOnly => {
            let vals = block.symmetric_eigenvalues().iter().copied().collect();
            Ok(sorted::<T>(vals, None))
        },
        Jobz::Vectors => {
            let eig
                = na::SymmetricEigen::try_new(
                    block.clone(), T::Re::default_epsilon(), MAX_ITER)
                .ok_or(NotConverged(k))?;
            Ok(sorted(eig.eigenvalues.iter().copied().collect(), Some(eig.eigenvectors)))
        },
    }
}

fn svd_block<T: ComplexScalar>(m: &na::DMatrix<T>, k: usize, jobz: Jobz)
    -> DensityMatrixResult<(Vec<T::Re>, Option<na::DMatrix<T>>)>
{
    let n = m.nrows();
    let vectors = jobz == Jobz::Vectors;
    if n == 0 {
        return Ok((Vec::new(), vectors.then(|| na::DMatrix::zeros(0, 0))));
    }
    // pad with zero columns so that there are n singular values and U is
    // square
    let m = if m.ncols() < n {
        m.clone().resize_horizontally(n, T::zero())
    } else {
        m.clone()
    };
    let svd = na::SVD::try_new(m, vectors, false, T::Re::default_epsilon(), MAX_ITER)
        .ok_or(NotConverged(k))?;
    let vals: Vec<T::Re>
        = svd.singular_values.iter().take(n)
        .map(|s| *s * *s)
        .collect();
    let u = if vectors {
        let u = svd.u.ok_or(NotConverged(k))?;
        Some(u.columns(0, n).clone_owned())
    } else {
        None
    };
    Ok(sorted(vals, u))
}

/// Selection of the states kept after a truncation.
#[derive(Clone, Debug, PartialEq)]
pub struct Truncation<R> {
    kept: Vec<usize>,
    discarded_weight: R,
}

impl<R> Truncation<R>
where R: na::RealField + Copy
{
    /// Keep the states of largest weight.
    ///
    /// At most `keep` states (and at least one, if any exist) are kept. With a
    /// `tolerance`, further states of smallest weight are dropped as long as
    /// the total discarded weight stays at or below it.
    pub fn new(eigenvalues: &[R], keep: usize, tolerance: Option<R>) -> Self {
        let n = eigenvalues.len();
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| {
            eigenvalues[b].partial_cmp(&eigenvalues[a]).unwrap_or(Ordering::Equal)
        });
        let mut nkeep = keep.min(n).max(n.min(1));
        let mut discarded
            = order[nkeep..].iter()
            .fold(R::zero(), |acc, &k| acc + eigenvalues[k]);
        if let Some(tol) = tolerance {
            while nkeep > 1 {
                let next = discarded + eigenvalues[order[nkeep - 1]];
                if next > tol { break; }
                discarded = next;
                nkeep -= 1;
            }
        }
        let mut kept: Vec<usize> = order[..nkeep].to_vec();
        kept.sort_unstable();
        Self { kept, discarded_weight: discarded }
    }

    /// Indices of the kept states, ascending.
    pub fn kept(&self) -> &[usize] { &self.kept }

    pub fn len(&self) -> usize { self.kept.len() }

    pub fn is_empty(&self) -> bool { self.kept.is_empty() }

    /// Total weight of the discarded states.
    pub fn discarded_weight(&self) -> R { self.discarded_weight }
}
