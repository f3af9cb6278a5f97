//! TOML configuration for walk experiments.
//!
//! Every field is optional; a missing file section falls back to the
//! defaults below.
//!
//! ```toml
//! realisations = 1000
//! steps = 1000
//! seed = 42
//! chunk_rows = 100
//! generation = "chunked"
//! modes = ["interpreted", "compiled", "chunked", "cluster"]
//!
//! [cluster]
//! n_workers = 4
//! threads_per_worker = 1
//! memory_limit = 2_000_000_000
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::engine::cluster::ClusterConfig;
use crate::engine::controller::ExecutionMode;
use crate::engine::memory::store_size;
use crate::error::{Result, WalkError};

/// How the step array is drawn from the seed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Generation {
    /// One stream over the whole array, row by row.
    #[default]
    Whole,
    /// One stream per `chunk_rows` block, drawn in parallel.
    Chunked,
}

/// Top-level experiment configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalkConfig {
    #[serde(default = "default_realisations")]
    pub realisations: usize,
    #[serde(default = "default_steps")]
    pub steps: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Rows per chunk for the chunked and cluster modes.
    #[serde(default = "default_chunk_rows")]
    pub chunk_rows: usize,
    #[serde(default)]
    pub generation: Generation,
    #[serde(default = "default_modes")]
    pub modes: Vec<ExecutionMode>,
    /// Keep the step array in a memory-mapped file at this path.
    #[serde(default)]
    pub backing_store: Option<PathBuf>,
    #[serde(default)]
    pub cluster: ClusterConfig,
}

fn default_realisations() -> usize {
    1000
}
fn default_steps() -> usize {
    1000
}
fn default_seed() -> u64 {
    42
}
fn default_chunk_rows() -> usize {
    100
}
fn default_modes() -> Vec<ExecutionMode> {
    ExecutionMode::ALL.to_vec()
}

impl Default for WalkConfig {
    fn default() -> Self {
        Self {
            realisations: default_realisations(),
            steps: default_steps(),
            seed: default_seed(),
            chunk_rows: default_chunk_rows(),
            generation: Generation::default(),
            modes: default_modes(),
            backing_store: None,
            cluster: ClusterConfig::default(),
        }
    }
}

impl WalkConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_rows == 0 {
            return Err(WalkError::InvalidChunkSize(0));
        }
        if self.modes.is_empty() {
            return Err(WalkError::InvalidConfig("no execution modes selected".into()));
        }
        let (len, _) = store_size(self.realisations, self.steps).ok_or_else(|| {
            WalkError::InvalidConfig(format!(
                "step array of {} x {} values is too large",
                self.realisations, self.steps
            ))
        })?;
        if self.backing_store.is_some() && len == 0 {
            return Err(WalkError::InvalidConfig(
                "backing store requires a non-empty step array".into(),
            ));
        }
        if self.modes.contains(&ExecutionMode::Cluster) {
            self.cluster.validate()?;
        }
        Ok(())
    }
}
