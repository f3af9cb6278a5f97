// Python Bindings
use numpy::{IntoPyArray, PyArrayDyn, PyReadonlyArrayDyn};
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;

use crate::config::WalkConfig;
use crate::engine::controller::{ExecutionMode, ExperimentRunner};
use crate::engine::dispatch::Dispatcher;
use crate::engine::kernels;
use crate::error::WalkError;

impl From<WalkError> for PyErr {
    fn from(err: WalkError) -> Self {
        match err {
            WalkError::InvalidChunkSize(_)
            | WalkError::InvalidCluster(_)
            | WalkError::InvalidConfig(_)
            | WalkError::Shape(_) => PyValueError::new_err(err.to_string()),
            _ => PyRuntimeError::new_err(err.to_string()),
        }
    }
}

/// Interpreted walk along the last axis
#[pyfunction]
fn walk<'py>(py: Python<'py>, steps: PyReadonlyArrayDyn<'py, f64>) -> Bound<'py, PyArrayDyn<f64>> {
    kernels::walk_interpreted(&steps.as_array()).into_pyarray(py)
}

/// Specialised walk, cached per dtype and shape
#[pyfunction]
fn walk_compiled<'py>(
    py: Python<'py>,
    steps: PyReadonlyArrayDyn<'py, f64>,
) -> Bound<'py, PyArrayDyn<f64>> {
    Dispatcher::global().call(&steps.as_array()).into_pyarray(py)
}

#[pyfunction]
fn std_dev(array: PyReadonlyArrayDyn<'_, f64>) -> f64 {
    kernels::std_dev(&array.as_array())
}

#[pyclass]
pub struct WalkSimulator {
    runner: ExperimentRunner,
}

#[pymethods]
impl WalkSimulator {
    #[new]
    #[pyo3(signature = (realisations, steps, seed = 42, chunk_rows = 100))]
    pub fn new(realisations: usize, steps: usize, seed: u64, chunk_rows: usize) -> PyResult<Self> {
        let config = WalkConfig {
            realisations,
            steps,
            seed,
            chunk_rows,
            ..WalkConfig::default()
        };
        Ok(Self {
            runner: ExperimentRunner::new(config)?,
        })
    }

    /// Returns (elapsed seconds, std) for one mode
    pub fn run(&mut self, mode: &str) -> PyResult<(f64, f64)> {
        let mode: ExecutionMode = mode.parse()?;
        let report = self.runner.run_mode(mode)?;
        Ok((report.elapsed.as_secs_f64(), report.std_dev))
    }

    pub fn specialisations(&self) -> usize {
        self.runner.dispatcher().compilations()
    }
}

pub(crate) fn register(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(walk, m)?)?;
    m.add_function(wrap_pyfunction!(walk_compiled, m)?)?;
    m.add_function(wrap_pyfunction!(std_dev, m)?)?;
    m.add_class::<WalkSimulator>()?;
    Ok(())
}
