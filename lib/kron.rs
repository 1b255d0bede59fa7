//! Kronecker-product form of the super-block Hamiltonian.
//!
//! The super-block Hamiltonian is handed over as a list of connections
//!
//! ```text
//! H = Σ_ic value_ic · A_ic ⊗ B_ic
//! ```
//!
//! with `A_ic` acting on the left and `B_ic` on the right sub-block. In the
//! patch layout of a [`SuperSector`], a target vector is a list of small
//! matrices `X_p`, and applying one connection to it reduces to
//!
//! ```text
//! Y_out += A_ic(out, in) · X_in · B_ic(out, in)ᵀ
//! ```
//!
//! for every pair of patches, where `A_ic(out, in)` is the block of `A_ic`
//! between the left groups of the two patches (and likewise for `B_ic`).
//! [`KronIndex`] slices every connection into these per-patch blocks once per
//! super-block configuration; the batched engine in [`crate::batched`] and
//! the unbatched [`KronIndex::matrix_vector`] then only multiply.

use std::ops::Range;
use nalgebra as na;
use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing::debug;
use crate::{
    ComplexScalar,
    basis::Basis,
    config::{ ConfigError, KronConfig },
    operator::Operator,
    sector::{ Side, SuperSector },
    sparse::{ SparseError, SparseMatrix },
};

#[derive(Debug, Error)]
pub enum KronError {
    /// Returned when a connection factor does not match the sub-block basis
    /// it acts on.
    #[error("error in kron index: connection {index} has a {side:?} factor of shape {shape:?}, expected {expected}x{expected}")]
    IncompatibleConnection {
        index: usize,
        side: Side,
        shape: (usize, usize),
        expected: usize,
    },

    /// Returned when a per-patch factor block does not fit the patches it
    /// connects.
    #[error("error in kron index: factor blocks do not fit patches (out = {out}, in = {inp})")]
    PatchSizeMismatch { out: usize, inp: usize },

    /// Returned when a sub-block operator does not act on the basis given
    /// for it.
    #[error("error in connection: operator of shape {shape:?} does not act on a basis of size {expected}")]
    OperatorBasisMismatch { shape: (usize, usize), expected: usize },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("sparse matrix error: {0}")]
    Sparse(#[from] SparseError),
}
use KronError::*;
pub type KronResult<T> = Result<T, KronError>;

/// One Kronecker term `value · left ⊗ right` of the super-block Hamiltonian.
///
/// Both factors are in the quantum-number-sorted order of their bases. Row
/// indices address the output state, column indices the input state.
#[derive(Clone, Debug, PartialEq)]
pub struct Connection<T: ComplexScalar> {
    pub left: SparseMatrix<T>,
    pub right: SparseMatrix<T>,
    pub value: T,
}

impl<T: ComplexScalar> Connection<T> {
    pub fn new(left: SparseMatrix<T>, right: SparseMatrix<T>, value: T) -> Self {
        Self { left, right, value }
    }

    /// Build the term `value · left ⊗ right` from two sub-block operators.
    ///
    /// If `right` is fermionic, it has to be commuted past the left sub-block
    /// state it acts after, so the left factor picks up the parity of its
    /// input state: `A = left · P`, with `P = diag(±1)` from `left_basis`.
    ///
    /// Fails if `left` is not a square operator on `left_basis`.
    pub fn from_operators(
        left: &Operator<T>,
        right: &Operator<T>,
        value: T,
        left_basis: &Basis,
    ) -> KronResult<Self>
    {
        let shape = left.data.shape();
        let n = left_basis.size();
        if shape != (n, n) {
            return Err(OperatorBasisMismatch { shape, expected: n });
        }
        let a = if right.is_fermionic() {
            let signs: Vec<T>
                = left_basis.fermion_signs().into_iter()
                .map(|s| if s < 0 { -T::one() } else { T::one() })
                .collect();
            left.data.scale_columns(&signs)?
        } else {
            left.data.clone()
        };
        Ok(Self { left: a, right: right.data.clone(), value })
    }
}

/// A factor block stored either dense or sparse.
///
/// Sparse blocks materialize a dense copy the first time one is requested and
/// keep it afterwards.
#[derive(Clone, Debug)]
pub enum MatrixDenseOrSparse<T: ComplexScalar> {
    Dense(na::DMatrix<T>),
    Sparse {
        data: SparseMatrix<T>,
        dense: OnceCell<na::DMatrix<T>>,
    },
}

impl<T: ComplexScalar> MatrixDenseOrSparse<T> {
    /// Store `block` dense if the fraction of non-zero entries exceeds
    /// `dense_threshold`, sparse otherwise.
    pub fn new(block: SparseMatrix<T>, dense_threshold: f64) -> Self {
        let (m, n) = block.shape();
        let fill = if m * n == 0 { 0.0 } else { block.nnz() as f64 / (m * n) as f64 };
        if fill > dense_threshold {
            Self::Dense(block.to_dense())
        } else {
            Self::Sparse { data: block, dense: OnceCell::new() }
        }
    }

    pub fn is_dense(&self) -> bool { matches!(self, Self::Dense(..)) }

    /// Return `true` if the block has no non-zero entries.
    pub fn is_zero(&self) -> bool {
        match self {
            Self::Dense(d) => d.iter().all(|x| x.is_zero()),
            Self::Sparse { data, .. } => data.is_zero(),
        }
    }

    pub fn nrows(&self) -> usize {
        match self {
            Self::Dense(d) => d.nrows(),
            Self::Sparse { data, .. } => data.nrows(),
        }
    }

    pub fn ncols(&self) -> usize {
        match self {
            Self::Dense(d) => d.ncols(),
            Self::Sparse { data, .. } => data.ncols(),
        }
    }

    /// Return the dense form of the block, column-major with leading
    /// dimension [`Self::nrows`].
    pub fn dense(&self) -> &na::DMatrix<T> {
        match self {
            Self::Dense(d) => d,
            Self::Sparse { data, dense } => dense.get_or_init(|| data.to_dense()),
        }
    }

    /// Return `x · selfᵀ`.
    pub fn right_mul_transpose(&self, x: &na::DMatrixView<'_, T>) -> na::DMatrix<T> {
        match self {
            Self::Dense(d) => x * d.transpose(),
            Self::Sparse { data, .. } => {
                let mut out: na::DMatrix<T> = na::DMatrix::zeros(x.nrows(), data.nrows());
                for (i, j, b) in data.iter() {
                    out.column_mut(i).axpy(b, &x.column(j), T::one());
                }
                out
            },
        }
    }

    /// Accumulate `y += self · t`.
    pub fn left_mul_acc(&self, t: &na::DMatrix<T>, y: &mut na::DMatrixViewMut<'_, T>) {
        match self {
            Self::Dense(d) => { y.gemm(T::one(), d, t, T::one()); },
            Self::Sparse { data, .. } => {
                for (i, j, a) in data.iter() {
                    for c in 0..t.ncols() {
                        y[(i, c)] += a * t[(j, c)];
                    }
                }
            },
        }
    }
}

/// Blocks of one connection factor for every (output patch, input patch)
/// pair.
#[derive(Clone, Debug)]
pub struct ArrayOfMatStruct<T: ComplexScalar> {
    npatches: usize,
    // block (out, in) at out + in * npatches
    data: Vec<MatrixDenseOrSparse<T>>,
}

impl<T: ComplexScalar> ArrayOfMatStruct<T> {
    /// Slice `mat` along the per-patch basis ranges of one side.
    pub fn new(mat: &SparseMatrix<T>, ranges: &[Range<usize>], dense_threshold: f64)
        -> Self
    {
        let npatches = ranges.len();
        let data: Vec<MatrixDenseOrSparse<T>>
            = ranges.iter()
            .flat_map(|cols| {
                ranges.iter().map(move |rows| {
                    let block = mat.block(rows.clone(), cols.clone());
                    MatrixDenseOrSparse::new(block, dense_threshold)
                })
            })
            .collect();
        Self { npatches, data }
    }

    pub fn npatches(&self) -> usize { self.npatches }

    /// Return the block connecting input patch `inp` to output patch `out`.
    pub fn get(&self, out: usize, inp: usize) -> &MatrixDenseOrSparse<T> {
        &self.data[out + inp * self.npatches]
    }
}

/// Per-patch slicing of a list of connections over one super-block sector.
///
/// Holds a shared reference to the sector; both have to be rebuilt whenever
/// the super-block changes.
#[derive(Clone, Debug)]
pub struct KronIndex<'a, T: ComplexScalar> {
    sector: &'a SuperSector,
    config: KronConfig,
    xc: Vec<ArrayOfMatStruct<T>>,
    yc: Vec<ArrayOfMatStruct<T>>,
}

impl<'a, T: ComplexScalar> KronIndex<'a, T> {
    /// Slice every connection into per-patch blocks.
    ///
    /// Fails if the configuration is invalid, a connection factor does not
    /// match its basis, or a block does not fit its patches.
    pub fn new(
        sector: &'a SuperSector,
        connections: &[Connection<T>],
        config: KronConfig,
    ) -> KronResult<Self>
    {
        config.validate()?;
        let ranges = |side: Side| -> Vec<Range<usize>> {
            let basis = sector.basis(side);
            sector.patch_groups(side).into_iter()
                .map(|g| basis.group_range(g))
                .collect()
        };
        let left_ranges = ranges(Side::Left);
        let right_ranges = ranges(Side::Right);
        let nl = sector.left().size();
        let nr = sector.right().size();

        let mut xc: Vec<ArrayOfMatStruct<T>> = Vec::with_capacity(connections.len());
        let mut yc: Vec<ArrayOfMatStruct<T>> = Vec::with_capacity(connections.len());
        for (index, conn) in connections.iter().enumerate() {
            if conn.left.shape() != (nl, nl) {
                return Err(IncompatibleConnection {
                    index, side: Side::Left, shape: conn.left.shape(), expected: nl });
            }
            if conn.right.shape() != (nr, nr) {
                return Err(IncompatibleConnection {
                    index, side: Side::Right, shape: conn.right.shape(), expected: nr });
            }
            let a = conn.left.scale(conn.value);
            xc.push(ArrayOfMatStruct::new(&a, &left_ranges, config.dense_threshold));
            yc.push(ArrayOfMatStruct::new(&conn.right, &right_ranges, config.dense_threshold));
        }

        let new = Self { sector, config, xc, yc };
        let np = new.number_of_patches();
        for ic in 0..new.connections() {
            for inp in 0..np {
                for out in 0..np {
                    new.checks(new.xc[ic].get(out, inp), new.yc[ic].get(out, inp), out, inp)?;
                }
            }
        }
        debug!(
            patches = np,
            connections = new.connections(),
            size = sector.size(),
            dense_blocks = new.xc.iter().chain(&new.yc)
                .flat_map(|arr| arr.data.iter())
                .filter(|m| m.is_dense())
                .count(),
            "built kron index",
        );
        Ok(new)
    }

    pub fn sector(&self) -> &'a SuperSector { self.sector }

    pub fn config(&self) -> &KronConfig { &self.config }

    /// Whether the batched engine should be used for this index.
    pub fn batched_gemm(&self) -> bool { self.config.batched_gemm }

    pub fn number_of_patches(&self) -> usize { self.sector.number_of_patches() }

    /// Group indices of all patches on one side.
    pub fn patch(&self, side: Side) -> Vec<usize> { self.sector.patch_groups(side) }

    /// Flattened offset of patch `p` in sector vectors.
    pub fn offset_for_patch(&self, p: usize) -> usize { self.sector.offset_for_patch(p) }

    /// Number of connections.
    pub fn connections(&self) -> usize { self.xc.len() }

    /// Left factor blocks of connection `ic`, with the connection value
    /// folded in.
    pub fn xc(&self, ic: usize) -> &ArrayOfMatStruct<T> { &self.xc[ic] }

    /// Right factor blocks of connection `ic`.
    pub fn yc(&self, ic: usize) -> &ArrayOfMatStruct<T> { &self.yc[ic] }

    /// Check that left block `a` and right block `b` map input patch `inp`
    /// onto output patch `out`.
    pub fn checks(
        &self,
        a: &MatrixDenseOrSparse<T>,
        b: &MatrixDenseOrSparse<T>,
        out: usize,
        inp: usize,
    ) -> KronResult<()>
    {
        let p_out = self.sector.patch(out);
        let p_in = self.sector.patch(inp);
        let fits
            = a.nrows() == p_out.left_size
            && a.ncols() == p_in.left_size
            && b.nrows() == p_out.right_size
            && b.ncols() == p_in.right_size;
        if fits { Ok(()) } else { Err(PatchSizeMismatch { out, inp }) }
    }

    /// Compute `vout = H · vin` block by block, without batching.
    ///
    /// *Panics if either vector is shorter than the sector size.*
    pub fn matrix_vector(&self, vout: &mut [T], vin: &[T]) {
        debug_assert_eq!(vin.len(), self.sector.size());
        debug_assert_eq!(vout.len(), self.sector.size());
        vout.iter_mut().for_each(|y| { *y = T::zero(); });
        let np = self.number_of_patches();
        for out in 0..np {
            let mut y = self.sector.patch_view_mut(vout, out);
            for inp in 0..np {
                let x = self.sector.patch_view(vin, inp);
                for (xc, yc) in self.xc.iter().zip(&self.yc) {
                    let a = xc.get(out, inp);
                    let b = yc.get(out, inp);
                    if a.is_zero() || b.is_zero() { continue; }
                    let t = b.right_mul_transpose(&x);
                    a.left_mul_acc(&t, &mut y);
                }
            }
        }
    }
}

/// Compute `vout = P H P · vin` entry by entry from the full connection
/// matrices, where `P` projects onto `sector`.
///
/// This is slow, but independent of any per-patch bookkeeping.
///
/// *Panics if either vector is shorter than the sector size or a connection
/// factor is larger than its basis.*
pub fn kron_matrix_vector<T: ComplexScalar>(
    sector: &SuperSector,
    connections: &[Connection<T>],
    vin: &[T],
    vout: &mut [T],
) {
    vout.iter_mut().for_each(|y| { *y = T::zero(); });
    for conn in connections.iter() {
        for (l, lp, a) in conn.left.iter() {
            for (r, rp, b) in conn.right.iter() {
                let (Some(i), Some(j)) = (sector.index_of(l, r), sector.index_of(lp, rp))
                    else { continue; };
                vout[i] += conn.value * a * b * vin[j];
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::{ Rng, SeedableRng, rngs::StdRng };
    use crate::{ operator::Operator, qn::Qn };
    use super::*;

    fn basis(ns: &[usize]) -> Basis {
        Basis::new(ns.iter().map(|&n| Qn::from_counts(vec![n])).collect())
            .unwrap()
    }

    fn random_sparse(n: usize, fill: f64, rng: &mut StdRng) -> SparseMatrix<f64> {
        let triplets: Vec<(usize, usize, f64)>
            = (0..n).flat_map(|i| (0..n).map(move |j| (i, j)))
            .filter_map(|(i, j)| {
                rng.gen_bool(fill).then(|| (i, j, rng.gen::<f64>() - 0.5))
            })
            .collect();
        SparseMatrix::from_triplets(n, n, triplets).unwrap()
    }

    fn sector() -> SuperSector {
        SuperSector::new(
            basis(&[0, 1, 1, 2, 1, 2]),
            basis(&[0, 1, 2, 1]),
            Qn::from_counts(vec![2]),
        )
        .unwrap()
    }

    #[test]
    fn dense_or_sparse_threshold() {
        let m = SparseMatrix::from_triplets(2, 2, [(0, 0, 1.0), (1, 0, 2.0)]).unwrap();
        let d = MatrixDenseOrSparse::new(m.clone(), 0.4);
        assert!(d.is_dense());
        let s = MatrixDenseOrSparse::new(m.clone(), 0.5);
        assert!(!s.is_dense());
        assert_eq!(s.dense(), &m.to_dense());
        assert_eq!(d.dense(), s.dense());
        assert!(!s.is_zero());
        assert!(MatrixDenseOrSparse::new(SparseMatrix::<f64>::zeros(2, 3), 0.2).is_zero());
    }

    #[test]
    fn block_products_agree() {
        let mut rng = StdRng::seed_from_u64(10546);
        let a = random_sparse(3, 0.5, &mut rng);
        let b = random_sparse(3, 0.5, &mut rng);
        let x = na::DMatrix::from_fn(3, 3, |i, j| (i + 2 * j) as f64);
        let expected = a.to_dense() * &x * b.to_dense().transpose();
        for threshold in [0.0, 1.0] {
            let a = MatrixDenseOrSparse::new(a.clone(), threshold);
            let b = MatrixDenseOrSparse::new(b.clone(), threshold);
            let t = b.right_mul_transpose(&x.as_view());
            let mut y: na::DMatrix<f64> = na::DMatrix::zeros(3, 3);
            a.left_mul_acc(&t, &mut y.as_view_mut());
            assert!((y - &expected).norm() < 1e-12);
        }
    }

    #[test]
    fn blocks_follow_patches() {
        let sector = sector();
        let mut rng = StdRng::seed_from_u64(2718);
        let conn = Connection::new(
            random_sparse(6, 0.5, &mut rng),
            random_sparse(4, 0.5, &mut rng),
            1.5,
        );
        let kron = KronIndex::new(&sector, &[conn.clone()], KronConfig::default()).unwrap();
        assert_eq!(kron.connections(), 1);
        assert_eq!(kron.patch(Side::Left), sector.patch_groups(Side::Left));
        let np = kron.number_of_patches();
        for out in 0..np {
            for inp in 0..np {
                let a = kron.xc(0).get(out, inp);
                let rows = sector.left().group_range(sector.patch(out).left_group);
                let cols = sector.left().group_range(sector.patch(inp).left_group);
                let expected = conn.left.scale(1.5).block(rows, cols).to_dense();
                assert_eq!(a.dense(), &expected);
                assert!(kron.checks(a, kron.yc(0).get(out, inp), out, inp).is_ok());
                if out != inp {
                    let wrong = kron.xc(0).get(out, out);
                    let p_out = sector.patch(out);
                    let p_in = sector.patch(inp);
                    if p_out.left_size != p_in.left_size
                        || p_out.right_size != p_in.right_size
                    {
                        assert!(matches!(
                            kron.checks(wrong, kron.yc(0).get(out, out), out, inp),
                            Err(PatchSizeMismatch { .. })
                        ));
                    }
                }
            }
        }
    }

    #[test]
    fn unbatched_matches_reference() {
        let sector = sector();
        let mut rng = StdRng::seed_from_u64(31415);
        let connections: Vec<Connection<f64>>
            = (0..3)
            .map(|_| {
                Connection::new(
                    random_sparse(6, 0.4, &mut rng),
                    random_sparse(4, 0.6, &mut rng),
                    rng.gen::<f64>(),
                )
            })
            .collect();
        let vin: Vec<f64> = (0..sector.size()).map(|_| rng.gen::<f64>() - 0.5).collect();
        let mut expected = vec![0.0; sector.size()];
        kron_matrix_vector(&sector, &connections, &vin, &mut expected);
        for threshold in [0.0, 0.3, 1.0] {
            let config = KronConfig { dense_threshold: threshold, ..KronConfig::default() };
            let kron = KronIndex::new(&sector, &connections, config).unwrap();
            let mut vout = vec![1.0; sector.size()];
            kron.matrix_vector(&mut vout, &vin);
            vout.iter().zip(&expected)
                .for_each(|(y, e)| { assert!((y - e).abs() < 1e-12); });
        }
    }

    #[test]
    fn bad_connections() {
        let sector = sector();
        let conn: Connection<f64>
            = Connection::new(SparseMatrix::identity(5), SparseMatrix::identity(4), 1.0);
        assert!(matches!(
            KronIndex::new(&sector, &[conn], KronConfig::default()),
            Err(IncompatibleConnection { index: 0, side: Side::Left, shape: (5, 5), expected: 6 })
        ));
        let conn: Connection<f64>
            = Connection::new(SparseMatrix::identity(6), SparseMatrix::identity(4), 1.0);
        let config = KronConfig { dense_threshold: 2.0, ..KronConfig::default() };
        assert!(matches!(
            KronIndex::new(&sector, &[conn], config),
            Err(Config(ConfigError::DenseThreshold(..)))
        ));
    }

    #[test]
    fn fermionic_right_operator_signs_left_factor() {
        // single spinless site: |0>, |1>
        let site = basis(&[0, 1]);
        let c: SparseMatrix<f64> = SparseMatrix::from_triplets(2, 2, [(0, 1, 1.0)]).unwrap();
        let cdag = c.transpose_conjugate();
        let left = Operator::fermion(c.clone());
        let conn
            = Connection::from_operators(&left, &Operator::fermion(cdag.clone()), 1.0, &site)
            .unwrap();
        assert_eq!(conn.left.get(0, 1), -1.0);
        assert_eq!(conn.right, cdag);
        let conn
            = Connection::from_operators(&left, &Operator::boson(cdag), 1.0, &site)
            .unwrap();
        assert_eq!(conn.left, c);
    }

    #[test]
    fn operator_on_wrong_basis() {
        let site = basis(&[0, 1]);
        let pair = basis(&[0, 1, 1, 2]);
        let c: SparseMatrix<f64> = SparseMatrix::from_triplets(2, 2, [(0, 1, 1.0)]).unwrap();
        let right = Operator::fermion(c.transpose_conjugate());
        assert!(matches!(
            Connection::from_operators(&Operator::fermion(c.clone()), &right, 1.0, &pair),
            Err(OperatorBasisMismatch { shape: (2, 2), expected: 4 })
        ));
        // wider than the basis: also rejected, for bosonic right operators too
        let wide: SparseMatrix<f64> = SparseMatrix::from_triplets(2, 4, [(0, 3, 1.0)]).unwrap();
        assert!(matches!(
            Connection::from_operators(&Operator::fermion(wide.clone()), &right, 1.0, &site),
            Err(OperatorBasisMismatch { shape: (2, 4), expected: 2 })
        ));
        assert!(matches!(
            Connection::from_operators(&Operator::boson(wide), &Operator::boson(c), 1.0, &site),
            Err(OperatorBasisMismatch { shape: (2, 4), expected: 2 })
        ));
    }
}
