//! Python bindings (`python` feature)

use crate::core::{build_processing_units, DeferredQueue, FailurePolicy, Pipeline, Stage, StageContext};
use crate::io::{load_inventory, ProcessingConfig};
use crate::types::{Polarization, SarError};
use pyo3::prelude::*;
use std::sync::Arc;

fn to_py_err(e: SarError) -> PyErr {
    match e {
        SarError::Config(_) | SarError::InvalidArgument(_) | SarError::InvalidFormat(_) => {
            PyErr::new::<pyo3::exceptions::PyValueError, _>(e.to_string())
        }
        _ => PyErr::new::<pyo3::exceptions::PyRuntimeError, _>(e.to_string()),
    }
}

/// Run pipeline stages over an inventory; returns one summary line per stage
#[pyfunction]
#[pyo3(signature = (config, inventory, stages = None, defer_to = None, fail_fast = false, jobs = 1))]
fn run_pipeline(
    config: String,
    inventory: String,
    stages: Option<Vec<String>>,
    defer_to: Option<String>,
    fail_fast: bool,
    jobs: usize,
) -> PyResult<Vec<String>> {
    let config = ProcessingConfig::from_file(&config).map_err(to_py_err)?;
    config.validate().map_err(to_py_err)?;
    let scenes = load_inventory(&inventory).map_err(to_py_err)?;

    let stages = match stages {
        Some(names) => names
            .iter()
            .map(|s| s.parse::<Stage>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(to_py_err)?,
        None => Stage::ALL.to_vec(),
    };

    let policy = if fail_fast {
        FailurePolicy::FailFast
    } else {
        FailurePolicy::Continue
    };

    // The interpreter is not the CLI, deferred acquisitions call the installed binary
    let mut ctx = StageContext::from_config(Arc::new(config))
        .with_policy(policy)
        .with_jobs(jobs)
        .with_program("sardine-batch");
    if let Some(exec_file) = defer_to {
        ctx = ctx.with_deferred(Arc::new(DeferredQueue::with_exec_file(exec_file)));
    }

    let report = Pipeline::new(ctx, &scenes).run(&stages).map_err(to_py_err)?;
    Ok(report.stages.iter().map(|s| s.to_string()).collect())
}

/// Group an inventory file into `(track, date, [identifiers])` tuples
#[pyfunction]
fn group_inventory(inventory: String) -> PyResult<Vec<(u32, String, Vec<String>)>> {
    let scenes = load_inventory(&inventory).map_err(to_py_err)?;

    Ok(build_processing_units(&scenes)
        .iter()
        .flat_map(|unit| unit.groups.iter())
        .map(|group| {
            (
                group.track.0,
                group.date_token(),
                group.identifiers().iter().map(|s| s.to_string()).collect(),
            )
        })
        .collect())
}

/// Python wrapper for Polarization enum
#[pyclass(name = "Polarization")]
#[derive(Clone)]
struct PyPolarization {
    inner: Polarization,
}

#[pymethods]
impl PyPolarization {
    #[new]
    fn new(pol_str: String) -> PyResult<Self> {
        let inner = pol_str.parse::<Polarization>().map_err(to_py_err)?;
        Ok(PyPolarization { inner })
    }

    fn __str__(&self) -> String {
        format!("{}", self.inner)
    }

    fn __repr__(&self) -> String {
        format!("Polarization('{}')", self.inner)
    }
}

/// Python module definition
#[pymodule]
fn _core(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(run_pipeline, m)?)?;
    m.add_function(wrap_pyfunction!(group_inventory, m)?)?;
    m.add_class::<PyPolarization>()?;
    Ok(())
}
