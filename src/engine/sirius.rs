//! Bridge to the SIRIUS NLCG engine
//!
//! The engine lives in the `sirius.nlcg` Python module. This file is the
//! only place that touches Python: it hands the validated configuration
//! across, wraps the launcher's hooks as callables honoring the engine's
//! factory protocol (`callback(kset, E=...)` returns the per-iteration
//! callable `(fn, it, **state)`), and adapts the engine's k-point set,
//! density and optimizer handles into the seam traits.

use super::{
    Density, EnergyFunctional, Engine, EngineError, IterationCallback, IterationSnapshot,
    KpointSet, OptimizerInternals, OptimizerState,
};
use crate::config::RunConfig;
use nalgebra::{DMatrix, Vector3};
use num_complex::Complex64;
use pyo3::exceptions::{PyKeyError, PyRuntimeError, PyTypeError};
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyList};
use serde_yml::Value as YamlValue;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// NLCG engine reached through the `sirius.nlcg` Python module.
#[derive(Debug, Default)]
pub struct SiriusEngine;

impl SiriusEngine {
    pub fn new() -> Self {
        SiriusEngine
    }
}

impl Engine for SiriusEngine {
    fn run(
        &mut self,
        config: &RunConfig,
        backend_config: &Path,
        callback: IterationCallback,
        error_callback: IterationCallback,
    ) -> Result<(), EngineError> {
        Python::with_gil(|py| {
            let module = PyModule::import_bound(py, "sirius.nlcg")
                .map_err(|err| EngineError::Run(format!("sirius.nlcg unavailable: {}", err)))?;

            let cfg = config_to_py(py, config)?;
            let backend = backend_config.to_string_lossy().into_owned();

            let kwargs = PyDict::new_bound(py);
            kwargs.set_item("callback", Py::new(py, IterationHookFactory::new(callback, false))?)?;
            kwargs.set_item(
                "error_callback",
                Py::new(py, IterationHookFactory::new(error_callback, true))?,
            )?;

            module.getattr("run")?.call((cfg, backend), Some(&kwargs))?;
            Ok(())
        })
    }
}

impl From<PyErr> for EngineError {
    fn from(err: PyErr) -> Self {
        EngineError::Run(err.to_string())
    }
}

/// Callback factory handed to the engine. The engine calls it once with
/// the k-point set and the energy functional; the returned object is the
/// per-iteration hook.
#[pyclass]
struct IterationHookFactory {
    hook: Arc<Mutex<IterationCallback>>,
    error_path: bool,
}

impl IterationHookFactory {
    fn new(hook: IterationCallback, error_path: bool) -> Self {
        IterationHookFactory {
            hook: Arc::new(Mutex::new(hook)),
            error_path,
        }
    }
}

#[pymethods]
impl IterationHookFactory {
    #[pyo3(signature = (kset, **state))]
    fn __call__(
        &self,
        kset: Py<PyAny>,
        state: Option<&Bound<'_, PyDict>>,
    ) -> PyResult<BoundIterationHook> {
        let energy = state
            .and_then(|d| d.get_item("E").ok().flatten())
            .ok_or_else(|| PyKeyError::new_err("E"))?
            .unbind();
        Ok(BoundIterationHook {
            hook: Arc::clone(&self.hook),
            kset,
            energy,
            error_path: self.error_path,
        })
    }
}

/// Per-iteration callable produced by the factory. Invoked by the engine
/// as `(fn, it, **state)`; on the error path `state` carries the raw
/// optimizer vectors.
#[pyclass]
struct BoundIterationHook {
    hook: Arc<Mutex<IterationCallback>>,
    kset: Py<PyAny>,
    energy: Py<PyAny>,
    error_path: bool,
}

#[pymethods]
impl BoundIterationHook {
    #[pyo3(signature = (trial_step, step, **state))]
    fn __call__(
        &self,
        py: Python<'_>,
        trial_step: f64,
        step: usize,
        state: Option<&Bound<'_, PyDict>>,
    ) -> PyResult<()> {
        let kset = PyKpointSet {
            obj: self.kset.bind(py).clone(),
        };
        let energy = PyEnergyFunctional {
            density: PyDensity {
                obj: self.energy.bind(py).getattr("density")?,
            },
        };
        let optimizer = if self.error_path {
            state.map(|dict| PyOptimizerInternals {
                state: dict.clone(),
            })
        } else {
            None
        };

        let snapshot = IterationSnapshot {
            step,
            trial_step,
            kset: &kset,
            energy: &energy,
            optimizer: optimizer
                .as_ref()
                .map(|internals| internals as &dyn OptimizerInternals),
        };

        let mut hook = self
            .hook
            .lock()
            .map_err(|_| PyRuntimeError::new_err("iteration hook mutex poisoned"))?;
        (*hook)(&snapshot).map_err(|err| PyRuntimeError::new_err(err.to_string()))
    }
}

struct PyKpointSet<'py> {
    obj: Bound<'py, PyAny>,
}

impl KpointSet for PyKpointSet<'_> {
    fn band_energies(&self) -> Result<Vec<Vec<f64>>, EngineError> {
        let e = self.obj.getattr("e").map_err(read_err("kset.e"))?;
        let e = listed(&e);
        if let Ok(per_kpoint) = e.extract::<Vec<Vec<f64>>>() {
            return Ok(per_kpoint);
        }
        // single k-point sets come back as a flat vector
        e.extract::<Vec<f64>>()
            .map(|flat| vec![flat])
            .map_err(read_err("kset.e"))
    }
}

struct PyDensity<'py> {
    obj: Bound<'py, PyAny>,
}

impl Density for PyDensity<'_> {
    fn atomic_magnetic_moments(&self) -> Result<Vec<Vector3<f64>>, EngineError> {
        let moments = self
            .obj
            .call_method0("compute_atomic_mag_mom")
            .map_err(read_err("density.compute_atomic_mag_mom"))?;
        let rows: Vec<[f64; 3]> = listed(&moments)
            .extract()
            .map_err(read_err("atomic magnetic moments"))?;
        Ok(rows
            .into_iter()
            .map(|m| Vector3::new(m[0], m[1], m[2]))
            .collect())
    }
}

struct PyEnergyFunctional<'py> {
    density: PyDensity<'py>,
}

impl EnergyFunctional for PyEnergyFunctional<'_> {
    fn density(&self) -> &dyn Density {
        &self.density
    }
}

struct PyOptimizerInternals<'py> {
    state: Bound<'py, PyDict>,
}

impl PyOptimizerInternals<'_> {
    fn matrices(&self, key: &str) -> Result<Vec<DMatrix<Complex64>>, EngineError> {
        let obj = self
            .state
            .get_item(key)
            .map_err(read_err("optimizer state"))?
            .ok_or_else(|| EngineError::Protocol(format!("engine error state is missing {}", key)))?;
        matrices_from(&obj)
            .map_err(|err| EngineError::Protocol(format!("optimizer field {}: {}", key, err)))
    }
}

impl OptimizerInternals for PyOptimizerInternals<'_> {
    fn read(&self) -> Result<OptimizerState, EngineError> {
        Ok(OptimizerState {
            x: self.matrices("X")?,
            eta: self.matrices("eta")?,
            g_x: self.matrices("g_X")?,
            g_x_prec: self.matrices("G_X")?,
            g_eta: self.matrices("g_eta")?,
        })
    }
}

/// numpy arrays come back through their `tolist` protocol; plain Python
/// containers pass through unchanged.
fn listed<'py>(obj: &Bound<'py, PyAny>) -> Bound<'py, PyAny> {
    obj.call_method0("tolist").unwrap_or_else(|_| obj.clone())
}

fn read_err(what: &'static str) -> impl Fn(PyErr) -> EngineError {
    move |err| EngineError::Protocol(format!("{}: {}", what, err))
}

/// One coefficient matrix per k-point. The engine may hand back a single
/// matrix, a sequence of matrices, or a k-point-keyed mapping.
fn matrices_from(obj: &Bound<'_, PyAny>) -> PyResult<Vec<DMatrix<Complex64>>> {
    let obj = listed(obj);
    if let Ok(dict) = obj.downcast::<PyDict>() {
        let mut out = Vec::new();
        for (_, item) in dict.iter() {
            out.push(matrix_from(&item)?);
        }
        return Ok(out);
    }
    if let Ok(single) = matrix_from(&obj) {
        return Ok(vec![single]);
    }
    let mut out = Vec::new();
    for item in obj.iter()? {
        out.push(matrix_from(&item?)?);
    }
    Ok(out)
}

fn matrix_from(obj: &Bound<'_, PyAny>) -> PyResult<DMatrix<Complex64>> {
    let rows: Vec<Vec<Complex64>> = listed(obj).extract()?;
    let nrows = rows.len();
    let ncols = rows.first().map_or(0, |row| row.len());
    if rows.iter().any(|row| row.len() != ncols) {
        return Err(PyTypeError::new_err("ragged matrix rows"));
    }
    Ok(DMatrix::from_row_iterator(
        nrows,
        ncols,
        rows.into_iter().flatten(),
    ))
}

fn config_to_py(py: Python<'_>, config: &RunConfig) -> Result<PyObject, EngineError> {
    let value = serde_yml::to_value(config).map_err(|err| {
        EngineError::Protocol(format!("configuration could not be serialized: {}", err))
    })?;
    yaml_to_py(py, &value).map_err(|err| {
        EngineError::Protocol(format!("configuration could not cross into Python: {}", err))
    })
}

fn yaml_to_py(py: Python<'_>, value: &YamlValue) -> PyResult<PyObject> {
    Ok(match value {
        YamlValue::Null => py.None(),
        YamlValue::Bool(b) => b.into_py(py),
        YamlValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.into_py(py)
            } else if let Some(u) = n.as_u64() {
                u.into_py(py)
            } else {
                n.as_f64().unwrap_or(f64::NAN).into_py(py)
            }
        }
        YamlValue::String(s) => s.into_py(py),
        YamlValue::Sequence(seq) => {
            let list = PyList::empty_bound(py);
            for item in seq {
                list.append(yaml_to_py(py, item)?)?;
            }
            list.into_any().unbind()
        }
        YamlValue::Mapping(map) => {
            let dict = PyDict::new_bound(py);
            for (key, item) in map {
                dict.set_item(yaml_to_py(py, key)?, yaml_to_py(py, item)?)?;
            }
            dict.into_any().unbind()
        }
        YamlValue::Tagged(tagged) => yaml_to_py(py, &tagged.value)?,
    })
}
