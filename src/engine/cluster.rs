// Local Cluster
// Worker pool on a tokio runtime; chunk tasks are submitted, tracked and gathered
use std::sync::Arc;

use bitvec::prelude::*;
use ndarray::{s, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use tokio::runtime::{Builder, Runtime};
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::engine::chunked::{reassemble, ChunkSpec};
use crate::engine::dispatch::Dispatcher;
use crate::engine::stats::Moments;
use crate::error::{Result, WalkError};

/// Connection parameters, passed through from configuration unmodified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_n_workers")]
    pub n_workers: usize,
    #[serde(default = "default_threads_per_worker")]
    pub threads_per_worker: usize,
    /// Bytes a single worker may hold for one task
    #[serde(default)]
    pub memory_limit: Option<usize>,
}

fn default_n_workers() -> usize {
    4
}

fn default_threads_per_worker() -> usize {
    1
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            n_workers: default_n_workers(),
            threads_per_worker: default_threads_per_worker(),
            memory_limit: None,
        }
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.n_workers == 0 {
            return Err(WalkError::InvalidCluster("n_workers must be at least 1".into()));
        }
        if self.threads_per_worker == 0 {
            return Err(WalkError::InvalidCluster(
                "threads_per_worker must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Total task slots across all workers
    pub fn total_threads(&self) -> usize {
        self.n_workers * self.threads_per_worker
    }
}

/// Workers (runtime threads) plus a bounded pool of task slots.
/// Dropping the cluster shuts the runtime down.
pub struct LocalCluster {
    runtime: Runtime,
    config: ClusterConfig,
    slots: Arc<Semaphore>,
    dispatcher: Arc<Dispatcher>,
}

impl LocalCluster {
    pub fn start(config: ClusterConfig, dispatcher: Arc<Dispatcher>) -> Result<Self> {
        config.validate()?;

        // 1. Workers drive scheduling, blocking threads run the chunk tasks
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.n_workers)
            .max_blocking_threads(config.total_threads())
            .thread_name("walk-worker")
            .enable_all()
            .build()?;

        // 2. One permit per thread keeps in-flight tasks bounded
        let slots = Arc::new(Semaphore::new(config.total_threads()));

        info!(
            workers = config.n_workers,
            threads_per_worker = config.threads_per_worker,
            memory_limit = ?config.memory_limit,
            "local cluster started"
        );

        Ok(Self {
            runtime,
            config,
            slots,
            dispatcher,
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn client(&self) -> Client<'_> {
        Client { cluster: self }
    }
}

/// Submits work to a [`LocalCluster`].
pub struct Client<'c> {
    cluster: &'c LocalCluster,
}

impl Client<'_> {
    pub fn scheduler_info(&self) -> String {
        let config = &self.cluster.config;
        let limit = config
            .memory_limit
            .map_or_else(|| "none".to_string(), |bytes| format!("{bytes} B"));
        format!(
            "LocalCluster(workers={}, threads_per_worker={}, memory_limit={})",
            config.n_workers, config.threads_per_worker, limit
        )
    }

    /// Walks every chunk on the cluster and reassembles the full walk array
    pub fn map_chunks(&self, steps: &ArrayView2<f64>, chunk_rows: usize) -> Result<Array2<f64>> {
        let walked = self.map_blocks(steps, chunk_rows, |dispatcher, chunk| {
            dispatcher.call(&chunk)
        })?;
        reassemble(&walked, steps.ncols())
    }

    /// Distributed reduction: each task returns its chunk's moments
    pub fn chunk_moments(&self, steps: &ArrayView2<f64>, chunk_rows: usize) -> Result<Moments> {
        let partials = self.map_blocks(steps, chunk_rows, |dispatcher, chunk| {
            Moments::of(&dispatcher.call(&chunk))
        })?;
        Ok(partials.into_iter().fold(Moments::default(), Moments::merge))
    }

    /// Runs `task` once per row chunk and gathers the results in chunk order.
    ///
    /// Fails with [`WalkError::MemoryLimit`] before submitting anything if one
    /// chunk would not fit a worker, and with [`WalkError::Task`] if any task
    /// panics or is cancelled. Failed tasks are not retried.
    pub fn map_blocks<R, F>(
        &self,
        steps: &ArrayView2<f64>,
        chunk_rows: usize,
        task: F,
    ) -> Result<Vec<R>>
    where
        R: Send + 'static,
        F: Fn(&Dispatcher, Array2<f64>) -> R + Send + Sync + 'static,
    {
        let spec = ChunkSpec::new(steps.nrows(), chunk_rows)?;
        let ranges = spec.ranges();

        // 1. Admission: input + output of the largest chunk must fit one worker
        if let (Some(limit), Some(first)) = (self.cluster.config.memory_limit, ranges.first()) {
            let required = 2 * first.len() * steps.ncols() * std::mem::size_of::<f64>();
            if required > limit {
                return Err(WalkError::MemoryLimit {
                    chunk: 0,
                    required,
                    limit,
                });
            }
        }

        // 2. Scatter: each task owns its input
        let chunks: Vec<Array2<f64>> = ranges
            .iter()
            .map(|rows| steps.slice(s![rows.clone(), ..]).to_owned())
            .collect();

        let task = Arc::new(task);
        self.cluster.runtime.block_on(self.gather(chunks, task))
    }

    async fn gather<R, F>(&self, chunks: Vec<Array2<f64>>, task: Arc<F>) -> Result<Vec<R>>
    where
        R: Send + 'static,
        F: Fn(&Dispatcher, Array2<f64>) -> R + Send + Sync + 'static,
    {
        let total = chunks.len();
        let mut finished = bitvec![0; total];
        let mut handles = Vec::with_capacity(total);

        for chunk in chunks {
            let permit = Arc::clone(&self.cluster.slots)
                .acquire_owned()
                .await
                .map_err(|e| WalkError::Task(e.to_string()))?;
            let dispatcher = Arc::clone(&self.cluster.dispatcher);
            let task = Arc::clone(&task);

            handles.push(tokio::task::spawn_blocking(move || {
                let _permit = permit;
                task(&dispatcher, chunk)
            }));
        }

        // 3. Gather in submission order
        let mut results = Vec::with_capacity(total);
        for (index, handle) in handles.into_iter().enumerate() {
            let value = handle
                .await
                .map_err(|e| WalkError::Task(format!("chunk {index}: {e}")))?;
            finished.set(index, true);
            debug!(chunk = index, done = finished.count_ones(), total, "chunk finished");
            results.push(value);
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::kernels::walk_interpreted;

    fn cluster(n_workers: usize, memory_limit: Option<usize>) -> LocalCluster {
        let config = ClusterConfig {
            n_workers,
            threads_per_worker: 2,
            memory_limit,
        };
        LocalCluster::start(config, Arc::new(Dispatcher::new())).unwrap()
    }

    #[test]
    fn test_map_chunks_matches_direct_walk() {
        let steps = Array2::from_shape_fn((11, 6), |(r, t)| (r as f64 + 1.0) / (t as f64 + 2.0));
        let cluster = cluster(3, None);
        let walked = cluster.client().map_chunks(&steps.view(), 4).unwrap();
        assert_eq!(walked, walk_interpreted(&steps));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ClusterConfig {
            n_workers: 0,
            ..ClusterConfig::default()
        };
        assert!(matches!(
            LocalCluster::start(config, Arc::new(Dispatcher::new())),
            Err(WalkError::InvalidCluster(_))
        ));
    }

    #[test]
    fn test_memory_limit_refuses_large_chunks() {
        let steps = Array2::<f64>::zeros((10, 10));
        // 5 rows x 10 steps x 8 bytes x 2 = 800 bytes
        let cluster = cluster(2, Some(799));
        let err = cluster.client().map_chunks(&steps.view(), 5).unwrap_err();
        assert!(matches!(
            err,
            WalkError::MemoryLimit {
                required: 800,
                limit: 799,
                ..
            }
        ));
        // Smaller chunks fit
        assert!(cluster.client().map_chunks(&steps.view(), 4).is_ok());
    }

    #[test]
    fn test_panicking_task_surfaces_as_error() {
        let steps = Array2::<f64>::ones((4, 2));
        let cluster = cluster(2, None);
        let result = cluster
            .client()
            .map_blocks(&steps.view(), 1, |_, chunk| {
                if chunk.sum() > 0.0 {
                    panic!("worker lost");
                }
                chunk
            });
        assert!(matches!(result, Err(WalkError::Task(_))));
    }

    #[test]
    fn test_scheduler_info() {
        let cluster = cluster(2, Some(1024));
        assert_eq!(
            cluster.client().scheduler_info(),
            "LocalCluster(workers=2, threads_per_worker=2, memory_limit=1024 B)"
        );
    }
}
