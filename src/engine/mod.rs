//! Seam to the external DFT engine
//!
//! The engine owns every piece of iteration state: the k-point set, the
//! energy functional, and the raw optimizer vectors. The launcher only
//! observes that state through the traits below, once per iteration, to
//! assemble checkpoint records. All iteration control, convergence
//! detection, and parallel execution stay on the engine's side of this
//! boundary.

#[cfg(feature = "sirius")]
mod sirius;

#[cfg(feature = "sirius")]
pub use sirius::SiriusEngine;

use crate::checkpoint::CheckpointError;
use crate::config::RunConfig;
use nalgebra::{DMatrix, Vector3};
use num_complex::Complex64;
use std::path::Path;
use thiserror::Error;

/// Error type for engine operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The external engine reported a failure during the run
    #[error("engine run failed: {0}")]
    Run(String),
    /// Engine-owned state could not be read back through the seam
    #[error("engine state could not be read: {0}")]
    Protocol(String),
    /// A checkpoint could not be persisted from inside a callback
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// Engine-owned k-point set.
pub trait KpointSet {
    /// Band eigenvalues, one vector per k-point.
    fn band_energies(&self) -> Result<Vec<Vec<f64>>, EngineError>;
}

/// Engine-owned electron density.
pub trait Density {
    /// Magnetic moment vector of each atom, integrated from the current
    /// density.
    fn atomic_magnetic_moments(&self) -> Result<Vec<Vector3<f64>>, EngineError>;
}

/// Engine-owned energy functional.
pub trait EnergyFunctional {
    fn density(&self) -> &dyn Density;
}

/// Raw optimizer internals, only reachable on the error path.
///
/// Reading is deferred behind this trait so that a disabled error dump
/// never touches engine state at all.
pub trait OptimizerInternals {
    fn read(&self) -> Result<OptimizerState, EngineError>;
}

/// Materialized optimizer state, per-k-point complex coefficient matrices.
#[derive(Debug, Clone, Default)]
pub struct OptimizerState {
    /// Wavefunction coefficients
    pub x: Vec<DMatrix<Complex64>>,
    /// Subspace rotation / occupation matrix
    pub eta: Vec<DMatrix<Complex64>>,
    /// Gradient with respect to the coefficients
    pub g_x: Vec<DMatrix<Complex64>>,
    /// Preconditioned coefficient gradient
    pub g_x_prec: Vec<DMatrix<Complex64>>,
    /// Gradient with respect to eta
    pub g_eta: Vec<DMatrix<Complex64>>,
}

/// Per-iteration view handed to the callbacks.
///
/// The basic fields are always present; the optimizer internals appear
/// only when the engine is reporting a failure.
pub struct IterationSnapshot<'a> {
    /// Iteration index
    pub step: usize,
    /// Current trial step size along the search direction
    pub trial_step: f64,
    pub kset: &'a dyn KpointSet,
    pub energy: &'a dyn EnergyFunctional,
    pub optimizer: Option<&'a dyn OptimizerInternals>,
}

/// Hook invoked by the engine, synchronously, on whatever thread the
/// engine runs its iteration loop.
pub type IterationCallback =
    Box<dyn FnMut(&IterationSnapshot<'_>) -> Result<(), EngineError> + Send>;

/// Contract consumed from the external NLCG engine.
pub trait Engine {
    /// Run the optimization to completion.
    ///
    /// Blocks until the engine converges, runs out of iterations, or
    /// fails. `callback` fires once per iteration; `error_callback`
    /// fires at most once, at the moment of failure, before the error is
    /// returned. The launcher does not act on anything beyond the
    /// returned error.
    fn run(
        &mut self,
        config: &RunConfig,
        backend_config: &Path,
        callback: IterationCallback,
        error_callback: IterationCallback,
    ) -> Result<(), EngineError>;
}
