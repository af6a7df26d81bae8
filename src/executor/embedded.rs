//! Embedded interpreter backing thread mode.

use pyo3::prelude::*;
use pyo3::sync::GILOnceCell;
use pyo3::types::PyModule;

use super::thread::EmbeddedKernel;
use crate::sandbox::{KERNEL_MODULE, KERNEL_SOURCE};

/// Compiled once per interpreter; a failed compile is retried on the next run
static KERNEL: GILOnceCell<Py<PyModule>> = GILOnceCell::new();

fn kernel(py: Python<'_>) -> PyResult<&PyModule> {
    KERNEL
        .get_or_try_init(py, || {
            PyModule::from_code(py, KERNEL_SOURCE, &format!("{KERNEL_MODULE}.py"), KERNEL_MODULE)
                .map(Py::from)
        })
        .map(|module| module.as_ref(py))
}

/// Runs the sandbox kernel inside this process through `PyO3`
#[derive(Debug, Clone, Copy, Default)]
pub struct PyO3Kernel;

impl EmbeddedKernel for PyO3Kernel {
    fn handle(&self, request: String) -> Result<String, String> {
        Python::with_gil(|py| {
            kernel(py)
                .and_then(|module| module.getattr("handle"))
                .and_then(|handle| handle.call1((request,)))
                .and_then(|reply| reply.extract::<String>())
                .map_err(|e| e.to_string())
        })
    }
}
