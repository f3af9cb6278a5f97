pub mod config;
pub mod engine;
pub mod error;

#[cfg(feature = "python")]
mod python;

pub use config::{Generation, WalkConfig};
pub use engine::chunked::{ChunkSpec, ChunkedWalk};
pub use engine::cluster::{Client, ClusterConfig, LocalCluster};
pub use engine::controller::{ExecutionMode, ExperimentReport, ExperimentRunner, ModeReport};
pub use engine::dispatch::{Dispatcher, Signature};
pub use engine::kernels::{std_dev, walk_interpreted, walk_rows, WalkElement};
pub use engine::memory::MappedSteps;
pub use engine::rng::StepGenerator;
pub use engine::stats::Moments;
pub use error::{Result, WalkError};

/// Python module definition
#[cfg(feature = "python")]
#[pyo3::pymodule]
fn walk_sim_core(m: &pyo3::Bound<'_, pyo3::types::PyModule>) -> pyo3::PyResult<()> {
    python::register(m)
}
