//! Periodic and error-time state checkpointing
//!
//! Records are assembled from the engine-owned iteration state and written
//! as JSON, one file per checkpoint, keyed by a step-numbered prefix.
//! nalgebra matrix types go through plain-`Vec` wrappers so the on-disk
//! format stays a flat JSON document.

use crate::engine::{EngineError, IterationSnapshot, OptimizerState};
use nalgebra::DMatrix;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

/// Error type for checkpoint persistence.
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Checkpointing decisions for one run.
///
/// `interval` comes from the validated `callback_interval` and must be
/// positive; `dump_on_error` mirrors the `-e` flag.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointPolicy {
    pub interval: usize,
    pub dump_on_error: bool,
}

/// Prefix tagging every record belonging to one iteration:
/// `fn_NNNNN_` with the step zero-padded to 5 digits.
pub fn step_prefix(step: usize) -> String {
    format!("fn_{:05}_", step)
}

/// Serializable wrapper for a complex matrix.
///
/// Stored as rows of `[re, im]` pairs so the record does not depend on
/// nalgebra's internal layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComplexMatrixRows(pub Vec<Vec<[f64; 2]>>);

impl From<&DMatrix<Complex64>> for ComplexMatrixRows {
    fn from(m: &DMatrix<Complex64>) -> Self {
        ComplexMatrixRows(
            m.row_iter()
                .map(|row| row.iter().map(|c| [c.re, c.im]).collect())
                .collect(),
        )
    }
}

/// One persisted checkpoint.
///
/// `f`, `ek` and `mag_mom` are always present. The raw optimizer vectors
/// are attached on the error path only and stay out of the document
/// otherwise.
#[derive(Debug, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Trial step size at this iteration
    pub f: f64,
    /// Band eigenvalues per k-point
    pub ek: Vec<Vec<f64>>,
    /// Atomic magnetic moment vectors
    pub mag_mom: Vec<[f64; 3]>,
    #[serde(rename = "X", default, skip_serializing_if = "Option::is_none")]
    pub x: Option<Vec<ComplexMatrixRows>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<Vec<ComplexMatrixRows>>,
    #[serde(rename = "g_X", default, skip_serializing_if = "Option::is_none")]
    pub g_x: Option<Vec<ComplexMatrixRows>>,
    #[serde(rename = "G_X", default, skip_serializing_if = "Option::is_none")]
    pub g_x_prec: Option<Vec<ComplexMatrixRows>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub g_eta: Option<Vec<ComplexMatrixRows>>,
}

impl CheckpointRecord {
    /// Assemble the standard record from the current iteration state.
    pub fn from_iteration(snapshot: &IterationSnapshot<'_>) -> Result<Self, EngineError> {
        let moments = snapshot.energy.density().atomic_magnetic_moments()?;
        Ok(CheckpointRecord {
            f: snapshot.trial_step,
            ek: snapshot.kset.band_energies()?,
            mag_mom: moments.iter().map(|m| [m.x, m.y, m.z]).collect(),
            x: None,
            eta: None,
            g_x: None,
            g_x_prec: None,
            g_eta: None,
        })
    }

    /// Assemble the extended record carrying the raw optimizer vectors.
    pub fn with_optimizer(
        snapshot: &IterationSnapshot<'_>,
        state: &OptimizerState,
    ) -> Result<Self, EngineError> {
        let mut record = Self::from_iteration(snapshot)?;
        record.x = Some(wrap_matrices(&state.x));
        record.eta = Some(wrap_matrices(&state.eta));
        record.g_x = Some(wrap_matrices(&state.g_x));
        record.g_x_prec = Some(wrap_matrices(&state.g_x_prec));
        record.g_eta = Some(wrap_matrices(&state.g_eta));
        Ok(record)
    }
}

fn wrap_matrices(matrices: &[DMatrix<Complex64>]) -> Vec<ComplexMatrixRows> {
    matrices.iter().map(ComplexMatrixRows::from).collect()
}

/// Durable storage for checkpoint records.
pub trait StateSink {
    fn save_state(&mut self, record: &CheckpointRecord, prefix: &str)
        -> Result<(), CheckpointError>;
}

/// Writes each record as pretty JSON under `<prefix>state.json` in a
/// target directory.
#[derive(Debug, Clone)]
pub struct JsonStateSink {
    dir: PathBuf,
}

impl JsonStateSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        JsonStateSink { dir: dir.into() }
    }

    /// File path a given prefix resolves to.
    pub fn path_for(&self, prefix: &str) -> PathBuf {
        self.dir.join(format!("{}state.json", prefix))
    }
}

impl StateSink for JsonStateSink {
    fn save_state(
        &mut self,
        record: &CheckpointRecord,
        prefix: &str,
    ) -> Result<(), CheckpointError> {
        let json = serde_json::to_string_pretty(record)?;
        fs::write(self.path_for(prefix), json)?;
        Ok(())
    }
}

/// Periodic checkpoint hook.
pub struct PeriodicCheckpointer<S> {
    interval: usize,
    sink: S,
}

impl<S: StateSink> PeriodicCheckpointer<S> {
    pub fn new(policy: &CheckpointPolicy, sink: S) -> Self {
        PeriodicCheckpointer {
            interval: policy.interval,
            sink,
        }
    }

    /// Persist the current state if the step falls on the configured
    /// interval. Off-interval iterations touch nothing, not even the
    /// engine state behind the snapshot.
    pub fn on_iteration(&mut self, snapshot: &IterationSnapshot<'_>) -> Result<(), EngineError> {
        if snapshot.step % self.interval != 0 {
            return Ok(());
        }
        let record = CheckpointRecord::from_iteration(snapshot)?;
        let prefix = step_prefix(snapshot.step);
        self.sink.save_state(&record, &prefix)?;
        info!("Checkpoint written at step {} ({})", snapshot.step, prefix);
        Ok(())
    }
}

/// Error-time dump hook. Inert unless enabled at launch.
pub struct ErrorDumper<S> {
    enabled: bool,
    sink: S,
}

impl<S: StateSink> ErrorDumper<S> {
    pub fn new(policy: &CheckpointPolicy, sink: S) -> Self {
        ErrorDumper {
            enabled: policy.dump_on_error,
            sink,
        }
    }

    /// Persist an extended record at the moment of failure. The dump
    /// itself is not guarded: a persistence failure propagates like any
    /// other error.
    pub fn on_error(&mut self, snapshot: &IterationSnapshot<'_>) -> Result<(), EngineError> {
        if !self.enabled {
            return Ok(());
        }
        let record = match snapshot.optimizer {
            Some(internals) => CheckpointRecord::with_optimizer(snapshot, &internals.read()?)?,
            None => CheckpointRecord::from_iteration(snapshot)?,
        };
        let prefix = step_prefix(snapshot.step);
        self.sink.save_state(&record, &prefix)?;
        info!(
            "Error-state dump written at step {} ({})",
            snapshot.step, prefix
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Density, EnergyFunctional, KpointSet, OptimizerInternals};
    use nalgebra::{DMatrix, Vector3};
    use num_complex::Complex64;
    use std::collections::BTreeSet;
    use std::sync::{Arc, Mutex};

    struct FixedKset {
        e: Vec<Vec<f64>>,
    }

    impl KpointSet for FixedKset {
        fn band_energies(&self) -> Result<Vec<Vec<f64>>, EngineError> {
            Ok(self.e.clone())
        }
    }

    struct FixedDensity {
        moments: Vec<Vector3<f64>>,
    }

    impl Density for FixedDensity {
        fn atomic_magnetic_moments(&self) -> Result<Vec<Vector3<f64>>, EngineError> {
            Ok(self.moments.clone())
        }
    }

    struct FixedEnergy {
        density: FixedDensity,
    }

    impl EnergyFunctional for FixedEnergy {
        fn density(&self) -> &dyn Density {
            &self.density
        }
    }

    struct FixedInternals {
        state: OptimizerState,
    }

    impl OptimizerInternals for FixedInternals {
        fn read(&self) -> Result<OptimizerState, EngineError> {
            Ok(self.state.clone())
        }
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        saved: Arc<Mutex<Vec<(String, serde_json::Value)>>>,
    }

    impl RecordingSink {
        fn saved(&self) -> Vec<(String, serde_json::Value)> {
            self.saved.lock().unwrap().clone()
        }
    }

    impl StateSink for RecordingSink {
        fn save_state(
            &mut self,
            record: &CheckpointRecord,
            prefix: &str,
        ) -> Result<(), CheckpointError> {
            let value = serde_json::to_value(record)?;
            self.saved.lock().unwrap().push((prefix.to_string(), value));
            Ok(())
        }
    }

    fn fixed_kset() -> FixedKset {
        FixedKset {
            e: vec![vec![-0.5, 0.2], vec![-0.4, 0.3]],
        }
    }

    fn fixed_energy() -> FixedEnergy {
        FixedEnergy {
            density: FixedDensity {
                moments: vec![Vector3::new(0.0, 0.0, 1.7), Vector3::new(0.1, 0.0, -1.7)],
            },
        }
    }

    fn one_matrix() -> Vec<DMatrix<Complex64>> {
        vec![DMatrix::from_row_slice(
            1,
            2,
            &[Complex64::new(1.0, -1.0), Complex64::new(0.5, 0.0)],
        )]
    }

    fn fixed_internals() -> FixedInternals {
        FixedInternals {
            state: OptimizerState {
                x: one_matrix(),
                eta: one_matrix(),
                g_x: one_matrix(),
                g_x_prec: one_matrix(),
                g_eta: one_matrix(),
            },
        }
    }

    fn snapshot<'a>(
        step: usize,
        kset: &'a FixedKset,
        energy: &'a FixedEnergy,
        optimizer: Option<&'a dyn OptimizerInternals>,
    ) -> IterationSnapshot<'a> {
        IterationSnapshot {
            step,
            trial_step: 0.25,
            kset,
            energy,
            optimizer,
        }
    }

    fn record_keys(value: &serde_json::Value) -> BTreeSet<String> {
        value
            .as_object()
            .expect("record should serialize to an object")
            .keys()
            .cloned()
            .collect()
    }

    #[test]
    fn prefix_is_zero_padded_to_five_digits() {
        assert_eq!(step_prefix(7), "fn_00007_");
        assert_eq!(step_prefix(0), "fn_00000_");
        assert_eq!(step_prefix(20), "fn_00020_");
        assert_eq!(step_prefix(123456), "fn_123456_");
    }

    #[test]
    fn periodic_checkpointer_fires_only_on_interval() {
        let kset = fixed_kset();
        let energy = fixed_energy();
        let sink = RecordingSink::default();
        let policy = CheckpointPolicy {
            interval: 10,
            dump_on_error: false,
        };
        let mut checkpointer = PeriodicCheckpointer::new(&policy, sink.clone());

        for step in 0..=25 {
            checkpointer
                .on_iteration(&snapshot(step, &kset, &energy, None))
                .unwrap();
        }

        let saved = sink.saved();
        let prefixes: Vec<&str> = saved.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(prefixes, ["fn_00000_", "fn_00010_", "fn_00020_"]);
    }

    #[test]
    fn periodic_record_has_exactly_the_standard_keys() {
        let kset = fixed_kset();
        let energy = fixed_energy();
        let sink = RecordingSink::default();
        let policy = CheckpointPolicy {
            interval: 1,
            dump_on_error: false,
        };
        let mut checkpointer = PeriodicCheckpointer::new(&policy, sink.clone());
        checkpointer
            .on_iteration(&snapshot(3, &kset, &energy, None))
            .unwrap();

        let saved = sink.saved();
        assert_eq!(saved.len(), 1);
        let expected: BTreeSet<String> =
            ["f", "ek", "mag_mom"].iter().map(|s| s.to_string()).collect();
        assert_eq!(record_keys(&saved[0].1), expected);
        assert_eq!(saved[0].1["f"], serde_json::json!(0.25));
        assert_eq!(saved[0].1["ek"][0][0], serde_json::json!(-0.5));
        assert_eq!(saved[0].1["mag_mom"][0][2], serde_json::json!(1.7));
    }

    #[test]
    fn disabled_error_dumper_is_a_no_op() {
        let kset = fixed_kset();
        let energy = fixed_energy();
        let internals = fixed_internals();
        let sink = RecordingSink::default();
        let policy = CheckpointPolicy {
            interval: 10,
            dump_on_error: false,
        };
        let mut dumper = ErrorDumper::new(&policy, sink.clone());

        dumper
            .on_error(&snapshot(13, &kset, &energy, Some(&internals)))
            .unwrap();
        dumper
            .on_error(&snapshot(14, &kset, &energy, None))
            .unwrap();

        assert!(sink.saved().is_empty());
    }

    #[test]
    fn enabled_error_dumper_persists_the_full_record() {
        let kset = fixed_kset();
        let energy = fixed_energy();
        let internals = fixed_internals();
        let sink = RecordingSink::default();
        let policy = CheckpointPolicy {
            interval: 10,
            dump_on_error: true,
        };
        let mut dumper = ErrorDumper::new(&policy, sink.clone());
        dumper
            .on_error(&snapshot(13, &kset, &energy, Some(&internals)))
            .unwrap();

        let saved = sink.saved();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].0, "fn_00013_");
        let expected: BTreeSet<String> = ["f", "ek", "mag_mom", "X", "eta", "g_X", "G_X", "g_eta"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(record_keys(&saved[0].1), expected);
        // complex entries serialize as [re, im] pairs
        assert_eq!(saved[0].1["X"][0][0][0], serde_json::json!([1.0, -1.0]));
    }

    #[test]
    fn json_sink_writes_parseable_file_under_prefixed_name() {
        let kset = fixed_kset();
        let energy = fixed_energy();
        let dir = tempfile::tempdir().unwrap();
        let mut sink = JsonStateSink::new(dir.path());
        let record =
            CheckpointRecord::from_iteration(&snapshot(20, &kset, &energy, None)).unwrap();
        sink.save_state(&record, &step_prefix(20)).unwrap();

        let path = dir.path().join("fn_00020_state.json");
        assert!(path.exists());
        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["mag_mom"][1], serde_json::json!([0.1, 0.0, -1.7]));
    }
}
