// Controller
// Runs the walk under each execution mode and times it
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{Generation, WalkConfig};
use crate::engine::chunked::{ChunkSpec, ChunkedWalk};
use crate::engine::cluster::LocalCluster;
use crate::engine::dispatch::Dispatcher;
use crate::engine::kernels::{std_dev, walk_interpreted};
use crate::engine::memory::MappedSteps;
use crate::engine::rng::StepGenerator;
use crate::error::{Result, WalkError};

/// Relative tolerance when comparing a mode's statistic against the first mode
const AGREEMENT_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Interpreted,
    Compiled,
    Chunked,
    Cluster,
}

impl ExecutionMode {
    pub const ALL: [ExecutionMode; 4] = [
        ExecutionMode::Interpreted,
        ExecutionMode::Compiled,
        ExecutionMode::Chunked,
        ExecutionMode::Cluster,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Interpreted => "interpreted",
            ExecutionMode::Compiled => "compiled",
            ExecutionMode::Chunked => "chunked",
            ExecutionMode::Cluster => "cluster",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = WalkError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "interpreted" => Ok(ExecutionMode::Interpreted),
            "compiled" | "jit" => Ok(ExecutionMode::Compiled),
            "chunked" => Ok(ExecutionMode::Chunked),
            "cluster" => Ok(ExecutionMode::Cluster),
            other => Err(WalkError::InvalidConfig(format!(
                "unknown execution mode '{other}'"
            ))),
        }
    }
}

/// Timing and statistic of one mode
#[derive(Debug, Clone, PartialEq)]
pub struct ModeReport {
    pub mode: ExecutionMode,
    pub elapsed: Duration,
    pub std_dev: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentReport {
    pub realisations: usize,
    pub steps: usize,
    pub modes: Vec<ModeReport>,
    /// Kernel specialisations created while running
    pub specialisations: usize,
}

impl fmt::Display for ExperimentReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "walk {} x {}", self.realisations, self.steps)?;
        writeln!(f, "{:<12} {:>12} {:>14}", "mode", "elapsed ms", "std")?;
        for report in &self.modes {
            writeln!(
                f,
                "{:<12} {:>12.3} {:>14.6}",
                report.mode.as_str(),
                report.elapsed.as_secs_f64() * 1e3,
                report.std_dev
            )?;
        }
        write!(f, "specialisations: {}", self.specialisations)
    }
}

/// Where the step array lives
enum StepSource {
    InMemory(Array2<f64>),
    Mapped(MappedSteps),
}

impl StepSource {
    fn view(&self) -> Result<ArrayView2<'_, f64>> {
        match self {
            StepSource::InMemory(steps) => Ok(steps.view()),
            StepSource::Mapped(store) => store.view(),
        }
    }

    /// Evict a mapped store chunk by chunk once a mode has streamed through it
    fn release_chunks(&mut self, chunk_rows: usize) -> Result<()> {
        if let StepSource::Mapped(store) = self {
            let (realisations, _) = store.dim();
            for rows in ChunkSpec::new(realisations, chunk_rows)?.ranges() {
                store.release_rows(rows)?;
            }
        }
        Ok(())
    }
}

/// Generates the step array once, then runs any mode against it.
pub struct ExperimentRunner {
    config: WalkConfig,
    steps: StepSource,
    dispatcher: Arc<Dispatcher>,
    cluster: Option<LocalCluster>, // Started on first cluster run
}

impl ExperimentRunner {
    pub fn new(config: WalkConfig) -> Result<Self> {
        config.validate()?;
        let (seed, rows, cols) = (config.seed, config.realisations, config.steps);

        // 1. Generate Steps (heap or backing file, one stream or one per chunk)
        let steps = match &config.backing_store {
            Some(path) => {
                let mut store = MappedSteps::create(path, rows, cols)?;
                match config.generation {
                    Generation::Whole => store.fill_from(&mut StepGenerator::from_seed(seed))?,
                    Generation::Chunked => store.fill_chunked(seed, config.chunk_rows)?,
                }
                info!(path = %path.display(), "step array mapped to backing store");
                StepSource::Mapped(store)
            }
            None => match config.generation {
                Generation::Whole => {
                    StepSource::InMemory(StepGenerator::from_seed(seed).steps(rows, cols))
                }
                Generation::Chunked => StepSource::InMemory(StepGenerator::chunked_steps(
                    seed,
                    rows,
                    cols,
                    config.chunk_rows,
                )?),
            },
        };

        Ok(Self {
            config,
            steps,
            dispatcher: Arc::new(Dispatcher::new()),
            cluster: None,
        })
    }

    pub fn config(&self) -> &WalkConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn steps(&self) -> Result<ArrayView2<'_, f64>> {
        self.steps.view()
    }

    /// Rows of a mapped step store still resident; None for heap steps
    pub fn resident_rows(&self) -> Option<usize> {
        match &self.steps {
            StepSource::InMemory(_) => None,
            StepSource::Mapped(store) => Some(store.resident_count()),
        }
    }

    /// Run one mode; setup (specialisation warm-up, cluster start) is not timed
    pub fn run_mode(&mut self, mode: ExecutionMode) -> Result<ModeReport> {
        if mode == ExecutionMode::Cluster && self.cluster.is_none() {
            let cluster =
                LocalCluster::start(self.config.cluster.clone(), Arc::clone(&self.dispatcher))?;
            info!(info = %cluster.client().scheduler_info(), "cluster ready");
            self.cluster = Some(cluster);
        }

        let steps = self.steps.view()?;
        let chunk_rows = self.config.chunk_rows;
        info!(mode = %mode, "running walk");

        let (elapsed, std_dev) = match mode {
            ExecutionMode::Interpreted => {
                let started = Instant::now();
                let walk = walk_interpreted(&steps);
                let std = std_dev(&walk);
                (started.elapsed(), std)
            }
            ExecutionMode::Compiled => {
                // Warm-up call specialises outside the timed region
                self.dispatcher.specialize::<f64>(steps.shape());
                let started = Instant::now();
                let walk = self.dispatcher.call(&steps);
                let std = std_dev(&walk);
                (started.elapsed(), std)
            }
            ExecutionMode::Chunked => {
                let chunked = ChunkedWalk::new(&self.dispatcher, chunk_rows)?;
                let started = Instant::now();
                let walk = chunked.run(&steps)?;
                let std = std_dev(&walk);
                (started.elapsed(), std)
            }
            ExecutionMode::Cluster => {
                let cluster = self
                    .cluster
                    .as_ref()
                    .ok_or_else(|| WalkError::InvalidCluster("cluster not started".into()))?;
                let started = Instant::now();
                let moments = cluster.client().chunk_moments(&steps, chunk_rows)?;
                (started.elapsed(), moments.std_dev())
            }
        };

        // Chunk-wise modes are done with the mapped pages; they fault back in on reuse
        if matches!(mode, ExecutionMode::Chunked | ExecutionMode::Cluster) {
            self.steps.release_chunks(chunk_rows)?;
        }

        info!(mode = %mode, elapsed_ms = elapsed.as_secs_f64() * 1e3, std_dev, "walk finished");
        Ok(ModeReport {
            mode,
            elapsed,
            std_dev,
        })
    }

    /// Run the modes in order; every statistic must agree with the first
    pub fn run_all(&mut self, modes: &[ExecutionMode]) -> Result<ExperimentReport> {
        let mut reports = Vec::with_capacity(modes.len());
        for &mode in modes {
            reports.push(self.run_mode(mode)?);
        }

        if let Some(reference) = reports.first().map(|r| r.std_dev) {
            for report in &reports[1..] {
                if !agrees(report.std_dev, reference) {
                    return Err(WalkError::Mismatch {
                        mode: report.mode.to_string(),
                        got: report.std_dev,
                        expected: reference,
                    });
                }
            }
        }

        Ok(ExperimentReport {
            realisations: self.config.realisations,
            steps: self.config.steps,
            modes: reports,
            specialisations: self.dispatcher.compilations(),
        })
    }

    /// Run the configured modes
    pub fn run(&mut self) -> Result<ExperimentReport> {
        let modes = self.config.modes.clone();
        self.run_all(&modes)
    }
}

fn agrees(got: f64, expected: f64) -> bool {
    // Empty arrays yield NaN in every mode
    if got.is_nan() && expected.is_nan() {
        return true;
    }
    let scale = got.abs().max(expected.abs()).max(f64::MIN_POSITIVE);
    (got - expected).abs() / scale <= AGREEMENT_TOLERANCE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> WalkConfig {
        WalkConfig {
            realisations: 24,
            steps: 50,
            chunk_rows: 5,
            ..WalkConfig::default()
        }
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("JIT".parse::<ExecutionMode>().unwrap(), ExecutionMode::Compiled);
        assert_eq!(
            "cluster".parse::<ExecutionMode>().unwrap().to_string(),
            "cluster"
        );
        assert!("gpu".parse::<ExecutionMode>().is_err());
    }

    #[test]
    fn test_all_modes_agree() {
        let mut runner = ExperimentRunner::new(small_config()).unwrap();
        let report = runner.run().unwrap();
        assert_eq!(report.modes.len(), 4);

        let interpreted = report.modes[0].std_dev;
        // Same kernel, same summation order
        assert_eq!(report.modes[1].std_dev.to_bits(), interpreted.to_bits());
        assert_eq!(report.modes[2].std_dev.to_bits(), interpreted.to_bits());
        assert!(agrees(report.modes[3].std_dev, interpreted));
        assert!(report.specialisations >= 1);
    }

    #[test]
    fn test_compiled_is_specialised_once() {
        let mut runner = ExperimentRunner::new(small_config()).unwrap();
        runner.run_mode(ExecutionMode::Compiled).unwrap();
        runner.run_mode(ExecutionMode::Compiled).unwrap();
        assert_eq!(runner.dispatcher().compilations(), 1);
    }

    #[test]
    fn test_report_display() {
        let mut runner = ExperimentRunner::new(small_config()).unwrap();
        let report = runner.run_all(&[ExecutionMode::Interpreted]).unwrap();
        let text = report.to_string();
        assert!(text.starts_with("walk 24 x 50"));
        assert!(text.contains("interpreted"));
    }

    #[test]
    fn test_agreement_tolerance() {
        assert!(agrees(1.0, 1.0 + 1e-12));
        assert!(!agrees(1.0, 1.001));
        assert!(agrees(f64::NAN, f64::NAN));
    }

    #[test]
    fn test_chunked_generation_is_used() {
        let config = WalkConfig {
            generation: Generation::Chunked,
            ..small_config()
        };
        let runner = ExperimentRunner::new(config).unwrap();
        let expected = StepGenerator::chunked_steps(42, 24, 50, 5).unwrap();
        assert_eq!(runner.steps().unwrap(), expected);
        assert_eq!(runner.resident_rows(), None);
    }
}
