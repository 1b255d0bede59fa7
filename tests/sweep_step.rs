//! One super-block step for a four-site spinless fermion chain split into two
//! two-site sub-blocks.
//!
//! With open boundaries and hopping `t = 1`, the single-particle energies are
//! `-2 cos(kπ/5)`, `k = 1..4`, so the two-particle ground state has energy
//! `-2 (cos(π/5) + cos(2π/5)) = -√5`.

use std::path::PathBuf;
use nalgebra as na;
use dmrg_core::{
    basis::Basis,
    batched::BatchedGemm,
    config::{ Config, FactorStorage, KronConfig },
    density_matrix::{ DensityMatrix, Direction, Jobz, Targets, Truncation },
    kron::{ Connection, KronIndex, kron_matrix_vector },
    operator::{ Operator, OperatorStorage, creation_matrix },
    qn::Qn,
    sector::SuperSector,
    sparse::SparseMatrix,
};

const KETS: [usize; 4] = [0b00, 0b01, 0b10, 0b11];

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn config_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("data")
        .join("step.yaml")
}

fn two_site_basis() -> Basis {
    Basis::new(
        KETS.iter()
            .map(|ket| Qn::from_counts(vec![ket.count_ones() as usize]))
            .collect()
    )
    .unwrap()
}

// annihilators of both sites of a two-site block, with Jordan-Wigner signs,
// in the sorted order of `basis`
fn two_site_operators(basis: &Basis) -> OperatorStorage<f64> {
    let mut ops = OperatorStorage::new();
    for site in 0..2 {
        let below = (1_usize << site) - 1;
        let c = creation_matrix(&KETS, 1 << site, |ket| {
            if (ket & below).count_ones() % 2 == 1 { -1.0 } else { 1.0 }
        })
        .unwrap();
        ops.push("c", Operator::fermion(c).sorted_for(basis).unwrap());
    }
    ops
}

fn hopping(c0: &SparseMatrix<f64>, c1: &SparseMatrix<f64>) -> SparseMatrix<f64> {
    let forward = c0.transpose_conjugate().mul(c1).unwrap();
    forward.add(&forward.transpose_conjugate()).unwrap().scale(-1.0)
}

fn chain_connections(basis: &Basis) -> Vec<Connection<f64>> {
    let ops = two_site_operators(basis);
    let c0 = &ops.get("c", 0).unwrap().data;
    let c1 = &ops.get("c", 1).unwrap().data;
    let h_block = hopping(c0, c1);
    let id = SparseMatrix::identity(basis.size());

    // boundary bond between the last left site and the first right site
    let c_left = ops.get("c", 1).unwrap();
    let cdag_left = Operator::fermion(c_left.data.transpose_conjugate());
    let c_right = ops.get("c", 0).unwrap();
    let cdag_right = Operator::fermion(c_right.data.transpose_conjugate());
    vec![
        Connection::new(h_block.clone(), id.clone(), 1.0),
        Connection::new(id, h_block, 1.0),
        Connection::from_operators(&cdag_left, c_right, -1.0, basis).unwrap(),
        Connection::from_operators(c_left, &cdag_right, 1.0, basis).unwrap(),
    ]
}

fn half_filled_sector() -> SuperSector {
    SuperSector::new(two_site_basis(), two_site_basis(), Qn::from_counts(vec![2]))
        .unwrap()
}

fn dense_hamiltonian(sector: &SuperSector, connections: &[Connection<f64>])
    -> na::DMatrix<f64>
{
    let n = sector.size();
    let mut h: na::DMatrix<f64> = na::DMatrix::zeros(n, n);
    let mut e = vec![0.0; n];
    let mut col = vec![0.0; n];
    for j in 0..n {
        e[j] = 1.0;
        kron_matrix_vector(sector, connections, &e, &mut col);
        h.column_mut(j).copy_from_slice(&col);
        e[j] = 0.0;
    }
    h
}

#[test]
fn ground_state_energy() {
    init_tracing();
    let sector = half_filled_sector();
    assert_eq!(sector.size(), 6);
    let connections = chain_connections(sector.left());
    let h = dense_hamiltonian(&sector, &connections);
    assert!((&h - h.transpose()).norm() < 1e-14);
    let eig = na::SymmetricEigen::new(h);
    let e0 = eig.eigenvalues.iter().copied().fold(f64::INFINITY, f64::min);
    assert!((e0 + 5.0_f64.sqrt()).abs() < 1e-12);
}

#[test]
fn batched_and_unbatched_agree_on_the_chain() {
    init_tracing();
    let sector = half_filled_sector();
    let connections = chain_connections(sector.left());
    let h = dense_hamiltonian(&sector, &connections);
    let v: Vec<f64> = (0..sector.size()).map(|k| 1.0 / (k as f64 + 1.0)).collect();
    let expected = &h * na::DVector::from_column_slice(&v);

    for storage in [FactorStorage::Borrowed, FactorStorage::Arena] {
        let config = KronConfig { storage, ..KronConfig::batched() };
        let kron = KronIndex::new(&sector, &connections, config).unwrap();
        let mut plain = vec![0.0; sector.size()];
        kron.matrix_vector(&mut plain, &v);
        let acc = BatchedGemm::new(&kron).unwrap();
        assert!(acc.enabled());
        let mut batched = vec![0.0; sector.size()];
        acc.matrix_vector(&mut batched, &v);
        for k in 0..sector.size() {
            assert!((plain[k] - expected[k]).abs() < 1e-12);
            assert!((batched[k] - expected[k]).abs() < 1e-12);
        }
    }
}

#[test]
fn truncate_ground_state_from_file_config() {
    init_tracing();
    let config = Config::from_file(config_path()).unwrap();
    assert_eq!(config.kron.storage, FactorStorage::Arena);
    assert_eq!(config.density_matrix.direction, Direction::ExpandSystem);

    let sector = half_filled_sector();
    let connections = chain_connections(sector.left());
    let kron = KronIndex::new(&sector, &connections, config.kron.clone()).unwrap();
    let acc = BatchedGemm::new(&kron).unwrap();

    // ground state from the dense Hamiltonian, checked against the accelerator
    let eig = na::SymmetricEigen::new(dense_hamiltonian(&sector, &connections));
    let (k0, e0)
        = eig.eigenvalues.iter().copied().enumerate()
        .fold((0, f64::INFINITY), |(k, e), (j, x)| if x < e { (j, x) } else { (k, e) });
    let ground: Vec<f64> = eig.eigenvectors.column(k0).iter().copied().collect();
    let mut hg = vec![0.0; sector.size()];
    acc.matrix_vector(&mut hg, &ground);
    hg.iter().zip(&ground)
        .for_each(|(y, g)| { assert!((y - e0 * g).abs() < 1e-10); });

    let mut dm = DensityMatrix::assemble(
        &sector,
        Targets::GroundState(&ground),
        config.density_matrix,
    )
    .unwrap();
    assert_eq!(dm.rank(), 4);
    let mut eigs = Vec::new();
    dm.diag(&mut eigs, Jobz::Vectors).unwrap();
    assert!((eigs.iter().sum::<f64>() - 1.0).abs() < 1e-12);
    assert!(dm.eigenvectors().is_some());

    assert_eq!(dm.matrix().rank(), dm.rank());
    assert_eq!(dm.block_sizes(), &[1, 1, 2]);

    let trunc = Truncation::new(&eigs, 3, Some(1e-10));
    assert!(trunc.len() <= 3);
    assert!(trunc.discarded_weight() < 0.5);
    let kept: f64 = trunc.kept().iter().map(|&k| eigs[k]).sum();
    assert!((kept + trunc.discarded_weight() - 1.0).abs() < 1e-12);
}
