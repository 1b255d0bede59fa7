//! Run-time configuration for the truncation and matrix-vector layers.
//!
//! Configuration is read once, typically from the `kron` and `density_matrix`
//! sections of a YAML document, and handed to constructors by value. Nothing
//! in this crate re-queries it per call.
//!
//! ```yaml
//! kron:
//!   batched_gemm: true
//!   storage: arena
//!   threads: 4
//!   dense_threshold: 0.2
//! density_matrix:
//!   use_svd: true
//!   direction: expand_system
//! ```

use std::{ fs, path::Path };
use serde::{ Deserialize, Serialize };
use thiserror::Error;
use crate::density_matrix::Direction;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// Returned when the configuration file cannot be read.
    #[error("error reading configuration: {0}")]
    Io(#[from] std::io::Error),

    /// Returned when the configuration document is not valid YAML or does
    /// not match the expected layout.
    #[error("error parsing configuration: {0}")]
    Parse(#[from] serde_yml::Error),

    /// Returned when a dense-storage threshold outside `[0, 1]` is given.
    #[error("error in kron configuration: dense_threshold must lie in [0, 1], got {0}")]
    DenseThreshold(f64),

    /// Returned when zero worker threads are requested.
    #[error("error in kron configuration: threads must be at least 1")]
    ZeroThreads,
}
use ConfigError::*;
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Where the batched engine reads its dense factor blocks from.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorStorage {
    /// Borrow the dense blocks held by the [`KronIndex`][crate::kron::KronIndex].
    /// No copy is made, but the index has to outlive the accelerator.
    #[default]
    Borrowed,
    /// Copy every non-zero block once into a single contiguous buffer owned by
    /// the accelerator.
    Arena,
}

fn default_dense_threshold() -> f64 { 0.2 }

/// Settings for the Kronecker-product matrix-vector layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KronConfig {
    /// Whether [`BatchedGemm`][crate::batched::BatchedGemm] should build its
    /// batched structures at all.
    #[serde(default)]
    pub batched_gemm: bool,

    /// Storage strategy for the batched engine's factor blocks.
    #[serde(default)]
    pub storage: FactorStorage,

    /// Number of worker threads used by the batched engine. Defaults to the
    /// number of logical CPUs.
    #[serde(default)]
    pub threads: Option<usize>,

    /// Fraction of non-zero entries above which a per-patch factor block is
    /// stored dense rather than sparse.
    #[serde(default = "default_dense_threshold")]
    pub dense_threshold: f64,
}

impl Default for KronConfig {
    fn default() -> Self {
        Self {
            batched_gemm: false,
            storage: FactorStorage::default(),
            threads: None,
            dense_threshold: default_dense_threshold(),
        }
    }
}

impl KronConfig {
    /// Default settings with the batched engine switched on.
    pub fn batched() -> Self { Self { batched_gemm: true, ..Self::default() } }

    /// Number of threads the batched engine should use.
    pub fn num_threads(&self) -> usize {
        self.threads.unwrap_or_else(num_cpus::get).max(1)
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> ConfigResult<()> {
        if !(0.0..=1.0).contains(&self.dense_threshold) {
            return Err(DenseThreshold(self.dense_threshold));
        }
        if self.threads == Some(0) { return Err(ZeroThreads); }
        Ok(())
    }
}

/// Construction parameters for a
/// [`DensityMatrix`][crate::density_matrix::DensityMatrix].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DensityMatrixParams {
    /// Obtain eigenpairs from a singular value decomposition of the weighted
    /// wavefunction instead of diagonalizing an explicitly formed ρ.
    #[serde(default)]
    pub use_svd: bool,

    /// Which side of the super-block is being expanded, i.e. which basis ρ
    /// lives on.
    #[serde(default)]
    pub direction: Direction,

    /// Log a summary after each diagonalization.
    #[serde(default)]
    pub verbose: bool,

    /// Log eigenvalues and trace checks.
    #[serde(default)]
    pub debug: bool,
}

impl DensityMatrixParams {
    pub fn new(use_svd: bool, direction: Direction, verbose: bool, debug: bool)
        -> Self
    {
        Self { use_svd, direction, verbose, debug }
    }
}

/// Top-level configuration document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub kron: KronConfig,

    #[serde(default)]
    pub density_matrix: DensityMatrixParams,
}

impl Config {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(s: &str) -> ConfigResult<Self> {
        let config: Self = serde_yml::from_str(s)?;
        config.kron.validate()?;
        Ok(config)
    }

    /// Read, parse, and validate a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let s = fs::read_to_string(path)?;
        Self::from_yaml_str(&s)
    }
}
