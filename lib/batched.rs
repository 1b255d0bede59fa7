//! Batched dense matrix multiplication over patch pairs.
//!
//! [`KronIndex::matrix_vector`] walks the per-patch factor blocks one by one,
//! switching between sparse and dense kernels. [`BatchedGemm`] instead lays
//! every non-zero block out once as a dense column-major matrix with a known
//! leading dimension, after which applying the Hamiltonian is nothing but a
//! fixed list of small GEMM calls per output patch:
//!
//! ```text
//! for out in patches:                       (one worker thread per chunk)
//!     Y_out = 0
//!     for ic in connections, in in patches:
//!         T     = X_in · B(out, in, ic)ᵀ    (scratch, per thread)
//!         Y_out += A(out, in, ic) · T
//! ```
//!
//! Output patches are disjoint ranges of the output vector and each is owned
//! by exactly one worker, so repeated calls give bit-identical results
//! independently of the number of threads.

use std::ops::Range;
use nalgebra as na;
use tracing::info;
use crate::{
    ComplexScalar,
    config::FactorStorage,
    kron::{ KronIndex, KronResult },
    sector::Side,
};

// Dense factor blocks, one slot per (out, in, connection) triple.
#[derive(Clone, Debug)]
enum Factors<'a, T> {
    // views into the dense blocks held by the kron index
    Borrowed(Vec<Option<&'a [T]>>),
    // one contiguous copy owned by the engine
    Arena {
        buf: Vec<T>,
        ranges: Vec<Option<Range<usize>>>,
    },
}

impl<'a, T> Factors<'a, T> {
    fn new(storage: FactorStorage) -> Self {
        match storage {
            FactorStorage::Borrowed => Self::Borrowed(Vec::new()),
            FactorStorage::Arena => Self::Arena { buf: Vec::new(), ranges: Vec::new() },
        }
    }

    fn push(&mut self, block: Option<&'a [T]>)
    where T: Copy
    {
        match self {
            Self::Borrowed(slots) => { slots.push(block); },
            Self::Arena { buf, ranges } => {
                let range = block.map(|data| {
                    let start = buf.len();
                    buf.extend_from_slice(data);
                    start..buf.len()
                });
                ranges.push(range);
            },
        }
    }

    fn get(&self, k: usize) -> Option<&[T]> {
        match self {
            Self::Borrowed(slots) => slots[k],
            Self::Arena { buf, ranges } => ranges[k].clone().map(|r| &buf[r]),
        }
    }
}

/// Executes the batched Hamiltonian-vector product from a flat description of
/// the patch structure and the dense factor blocks.
///
/// Slot `k = out + in * np + ic * np * np` describes the contribution of input
/// patch `in` to output patch `out` through connection `ic`. Its left factor
/// is a `left_sizes[out] x left_sizes[in]` block with leading dimension
/// `lda[k]`, its right factor a `right_sizes[out] x right_sizes[in]` block with
/// leading dimension `ldb[k]`. Empty slots are skipped.
#[derive(Clone, Debug)]
pub struct BatchedGemmEngine<'a, T> {
    offsets: Vec<usize>,
    left_sizes: Vec<usize>,
    right_sizes: Vec<usize>,
    nconnections: usize,
    a: Factors<'a, T>,
    b: Factors<'a, T>,
    lda: Vec<usize>,
    ldb: Vec<usize>,
    threads: usize,
}

impl<'a, T: ComplexScalar> BatchedGemmEngine<'a, T> {
    /// Number of patches.
    pub fn npatches(&self) -> usize { self.left_sizes.len() }

    pub fn nconnections(&self) -> usize { self.nconnections }

    pub fn threads(&self) -> usize { self.threads }

    /// Number of slots holding a pair of non-zero factor blocks.
    pub fn nonzero_slots(&self) -> usize {
        (0..self.lda.len())
            .filter(|&k| self.a.get(k).is_some())
            .count()
    }

    /// Compute `vout = H · vin`.
    ///
    /// *Panics if either vector is shorter than the total sector size.*
    pub fn apply_htarget(&self, vin: &[T], vout: &mut [T]) {
        let np = self.npatches();
        let mut outs: Vec<(usize, &mut [T])> = Vec::with_capacity(np);
        let mut rest: &mut [T] = &mut vout[..self.offsets[np]];
        for out in 0..np {
            let (y, tail)
                = std::mem::take(&mut rest)
                .split_at_mut(self.offsets[out + 1] - self.offsets[out]);
            outs.push((out, y));
            rest = tail;
        }

        let chunk_size = np.div_ceil(self.threads.min(np).max(1)).max(1);
        if self.threads <= 1 || np <= 1 {
            let mut scratch: Vec<T> = Vec::new();
            outs.iter_mut()
                .for_each(|(out, y)| { self.apply_patch(*out, vin, y, &mut scratch); });
            return;
        }
        crossbeam::thread::scope(|s| {
            for chunk in outs.chunks_mut(chunk_size) {
                s.spawn(move |_| {
                    let mut scratch: Vec<T> = Vec::new();
                    chunk.iter_mut()
                        .for_each(|(out, y)| { self.apply_patch(*out, vin, y, &mut scratch); });
                });
            }
        })
        .unwrap_or_else(|err| std::panic::resume_unwind(err));
    }

    fn apply_patch(&self, out: usize, vin: &[T], y: &mut [T], scratch: &mut Vec<T>) {
        let np = self.npatches();
        let nl_out = self.left_sizes[out];
        let nr_out = self.right_sizes[out];
        y.iter_mut().for_each(|yk| { *yk = T::zero(); });
        let mut y = na::DMatrixViewMut::from_slice(y, nl_out, nr_out);
        for ic in 0..self.nconnections {
            for inp in 0..np {
                let k = out + inp * np + ic * np * np;
                let (Some(a), Some(b)) = (self.a.get(k), self.b.get(k))
                    else { continue; };
                let nl_in = self.left_sizes[inp];
                let nr_in = self.right_sizes[inp];
                let x = na::DMatrixView::from_slice(
                    &vin[self.offsets[inp]..self.offsets[inp + 1]], nl_in, nr_in);
                let a = na::DMatrixView::<T, na::Dyn, na::Dyn>::from_slice_with_strides(
                    a, nl_out, nl_in, 1, self.lda[k]);
                // Bᵀ read in place by swapping strides
                let bt = na::DMatrixView::<T, na::Dyn, na::Dyn>::from_slice_with_strides(
                    b, nr_in, nr_out, self.ldb[k], 1);
                scratch.clear();
                scratch.resize(nl_in * nr_out, T::zero());
                let mut t = na::DMatrixViewMut::from_slice(scratch, nl_in, nr_out);
                t.gemm(T::one(), &x, &bt, T::zero());
                y.gemm(T::one(), &a, &t, T::one());
            }
        }
    }
}

/// Hamiltonian-vector product through batched dense multiplication.
///
/// Construction is cheap when the kron index has batching switched off: the
/// accelerator then only holds its reference and [`Self::enabled`] returns
/// `false`, so callers can build one unconditionally.
#[derive(Clone, Debug)]
pub struct BatchedGemm<'a, T: ComplexScalar> {
    kron: &'a KronIndex<'a, T>,
    engine: Option<BatchedGemmEngine<'a, T>>,
}

impl<'a, T: ComplexScalar> BatchedGemm<'a, T> {
    /// Lay out the per-patch factor blocks of `kron` for the batched engine.
    ///
    /// With [`FactorStorage::Borrowed`], the engine reads the dense blocks
    /// held by `kron` in place; with [`FactorStorage::Arena`], they are copied
    /// once into a buffer owned by the accelerator.
    ///
    /// Fails if a factor block does not fit its patches.
    pub fn new(kron: &'a KronIndex<'a, T>) -> KronResult<Self> {
        if !kron.batched_gemm() { return Ok(Self { kron, engine: None }); }

        let sector = kron.sector();
        let np = kron.number_of_patches();
        let nc = kron.connections();
        let offsets: Vec<usize>
            = (0..np).map(|p| kron.offset_for_patch(p))
            .chain(std::iter::once(sector.size()))
            .collect();
        let left_sizes = sector.patch_sizes(Side::Left);
        let right_sizes = sector.patch_sizes(Side::Right);

        let storage = kron.config().storage;
        let mut a_factors: Factors<'a, T> = Factors::new(storage);
        let mut b_factors: Factors<'a, T> = Factors::new(storage);
        let mut lda: Vec<usize> = Vec::with_capacity(np * np * nc);
        let mut ldb: Vec<usize> = Vec::with_capacity(np * np * nc);
        for ic in 0..nc {
            let xc = kron.xc(ic);
            let yc = kron.yc(ic);
            for inp in 0..np {
                for out in 0..np {
                    let a = xc.get(out, inp);
                    let b = yc.get(out, inp);
                    kron.checks(a, b, out, inp)?;
                    if a.is_zero() || b.is_zero() {
                        a_factors.push(None);
                        b_factors.push(None);
                    } else {
                        a_factors.push(Some(a.dense().as_slice()));
                        b_factors.push(Some(b.dense().as_slice()));
                    }
                    lda.push(a.nrows());
                    ldb.push(b.nrows());
                }
            }
        }

        let engine = BatchedGemmEngine {
            offsets,
            left_sizes,
            right_sizes,
            nconnections: nc,
            a: a_factors,
            b: b_factors,
            lda,
            ldb,
            threads: kron.config().num_threads(),
        };
        info!(
            patches = np,
            connections = nc,
            blocks = engine.nonzero_slots(),
            ?storage,
            threads = engine.threads(),
            "batched GEMM accelerator in use",
        );
        Ok(Self { kron, engine: Some(engine) })
    }

    /// Return `true` if the batched structures were built.
    pub fn enabled(&self) -> bool { self.engine.is_some() }

    pub fn kron(&self) -> &'a KronIndex<'a, T> { self.kron }

    pub fn engine(&self) -> Option<&BatchedGemmEngine<'a, T>> { self.engine.as_ref() }

    /// Flattened offsets of all patches, followed by the sector size. Empty
    /// when disabled.
    pub fn offsets(&self) -> &[usize] {
        self.engine.as_ref().map(|e| e.offsets.as_slice()).unwrap_or(&[])
    }

    /// Left basis size of every patch. Empty when disabled.
    pub fn left_sizes(&self) -> &[usize] {
        self.engine.as_ref().map(|e| e.left_sizes.as_slice()).unwrap_or(&[])
    }

    /// Right basis size of every patch. Empty when disabled.
    pub fn right_sizes(&self) -> &[usize] {
        self.engine.as_ref().map(|e| e.right_sizes.as_slice()).unwrap_or(&[])
    }

    /// Compute `vout = H · vin`.
    ///
    /// *Panics if the accelerator is disabled.* Vector lengths are only
    /// checked in debug builds.
    pub fn matrix_vector(&self, vout: &mut [T], vin: &[T]) {
        let Some(engine) = &self.engine else {
            panic!("batched GEMM accelerator is disabled");
        };
        debug_assert_eq!(vin.len(), self.kron.sector().size());
        debug_assert_eq!(vout.len(), self.kron.sector().size());
        engine.apply_htarget(vin, vout);
    }
}

#[cfg(test)]
mod tests {
    use num_traits::Zero;
    use rand::{ Rng, SeedableRng, rngs::StdRng };
    use crate::{
        C64,
        basis::Basis,
        config::KronConfig,
        kron::{ Connection, kron_matrix_vector },
        qn::Qn,
        sector::SuperSector,
        sparse::SparseMatrix,
    };
    use super::*;

    fn basis(ns: &[usize]) -> Basis {
        Basis::new(ns.iter().map(|&n| Qn::from_counts(vec![n])).collect())
            .unwrap()
    }

    fn random_c64(rng: &mut StdRng) -> C64 {
        C64::new(rng.gen::<f64>() - 0.5, rng.gen::<f64>() - 0.5)
    }

    fn random_sparse(n: usize, fill: f64, rng: &mut StdRng) -> SparseMatrix<C64> {
        let mut triplets: Vec<(usize, usize, C64)> = Vec::new();
        for j in 0..n {
            for i in 0..n {
                if rng.gen_bool(fill) { triplets.push((i, j, random_c64(rng))); }
            }
        }
        SparseMatrix::from_triplets(n, n, triplets).unwrap()
    }

    fn random_connection(nl: usize, nr: usize, rng: &mut StdRng) -> Connection<C64> {
        let left = random_sparse(nl, 0.3, rng);
        let right = random_sparse(nr, 0.6, rng);
        Connection::new(left, right, C64::new(0.7, -0.2))
    }

    #[test]
    fn identity_scaling() {
        let sector = SuperSector::new(
            basis(&[0, 0, 1, 1]),
            basis(&[0, 1]),
            Qn::from_counts(vec![1]),
        )
        .unwrap();
        assert_eq!(sector.number_of_patches(), 2);
        let conn: Connection<f64> = Connection::new(
            SparseMatrix::identity(4).scale(2.0),
            SparseMatrix::identity(2),
            1.0,
        );
        let kron = KronIndex::new(&sector, &[conn], KronConfig::batched()).unwrap();
        let acc = BatchedGemm::new(&kron).unwrap();
        assert!(acc.enabled());
        assert_eq!(acc.offsets(), &[0, 2, 4]);
        assert_eq!(acc.left_sizes(), &[2, 2]);
        assert_eq!(acc.right_sizes(), &[1, 1]);
        let vin = [1.0; 4];
        let mut vout = [0.0; 4];
        acc.matrix_vector(&mut vout, &vin);
        assert_eq!(vout, [2.0; 4]);
    }

    #[test]
    fn disabled_builds_nothing() {
        let sector = SuperSector::new(basis(&[0, 1]), basis(&[0, 1]), Qn::from_counts(vec![1]))
            .unwrap();
        let conn: Connection<f64>
            = Connection::new(SparseMatrix::identity(2), SparseMatrix::identity(2), 1.0);
        let kron = KronIndex::new(&sector, &[conn], KronConfig::default()).unwrap();
        let acc = BatchedGemm::new(&kron).unwrap();
        assert!(!acc.enabled());
        assert!(acc.engine.is_none());
        assert!(acc.offsets().is_empty());
        assert!(acc.left_sizes().is_empty());
        assert!(acc.right_sizes().is_empty());
    }

    #[test]
    #[should_panic]
    fn disabled_matrix_vector_panics() {
        let sector = SuperSector::new(basis(&[0, 1]), basis(&[0, 1]), Qn::from_counts(vec![1]))
            .unwrap();
        let kron: KronIndex<f64> = KronIndex::new(&sector, &[], KronConfig::default()).unwrap();
        let acc = BatchedGemm::new(&kron).unwrap();
        let mut vout = [0.0; 2];
        acc.matrix_vector(&mut vout, &[1.0, 1.0]);
    }

    #[test]
    fn matches_reference_in_both_storages() {
        let sector = SuperSector::new(
            basis(&[0, 1, 1, 2, 1, 2, 2, 3]),
            basis(&[0, 1, 1, 2, 1]),
            Qn::from_counts(vec![3]),
        )
        .unwrap();
        let mut rng = StdRng::seed_from_u64(10546);
        let connections: Vec<Connection<C64>>
            = (0..4).map(|_| random_connection(8, 5, &mut rng)).collect();
        let vin: Vec<C64> = (0..sector.size()).map(|_| random_c64(&mut rng)).collect();
        let mut expected = vec![C64::zero(); sector.size()];
        kron_matrix_vector(&sector, &connections, &vin, &mut expected);
        let scale = expected.iter().map(|y| y.norm()).fold(0.0, f64::max);

        for storage in [FactorStorage::Borrowed, FactorStorage::Arena] {
            for threads in [1, 3] {
                let config = KronConfig {
                    batched_gemm: true,
                    storage,
                    threads: Some(threads),
                    dense_threshold: 0.2,
                };
                let kron = KronIndex::new(&sector, &connections, config).unwrap();
                let acc = BatchedGemm::new(&kron).unwrap();
                assert_eq!(acc.engine().unwrap().threads(), threads);
                let mut vout = vec![C64::zero(); sector.size()];
                acc.matrix_vector(&mut vout, &vin);
                vout.iter().zip(&expected)
                    .for_each(|(y, e)| { assert!((y - e).norm() <= 1e-10 * scale); });
            }
        }
    }

    #[test]
    fn repeated_calls_are_bit_identical() {
        let sector = SuperSector::new(
            basis(&[0, 1, 1, 2, 2, 1]),
            basis(&[0, 1, 1, 2]),
            Qn::from_counts(vec![2]),
        )
        .unwrap();
        let mut rng = StdRng::seed_from_u64(2718);
        let connections: Vec<Connection<C64>>
            = (0..3).map(|_| random_connection(6, 4, &mut rng)).collect();
        let vin: Vec<C64> = (0..sector.size()).map(|_| random_c64(&mut rng)).collect();
        let run = |threads: usize| -> Vec<C64> {
            let config = KronConfig { threads: Some(threads), ..KronConfig::batched() };
            let kron = KronIndex::new(&sector, &connections, config).unwrap();
            let acc = BatchedGemm::new(&kron).unwrap();
            let mut first = vec![C64::zero(); sector.size()];
            let mut second = vec![C64::new(9.0, 9.0); sector.size()];
            acc.matrix_vector(&mut first, &vin);
            acc.matrix_vector(&mut second, &vin);
            assert_eq!(first, second);
            first
        };
        assert_eq!(run(1), run(4));
    }
}
