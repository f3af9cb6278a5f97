// Step Generation
// Seeded standard-normal steps, whole-array or chunk by chunk
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rayon::prelude::*;

use crate::engine::chunked::{reassemble, ChunkSpec};
use crate::error::Result;

/// Reproducible source of i.i.d. N(0, 1) steps
pub struct StepGenerator {
    rng: StdRng,
}

impl StepGenerator {
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Independent stream for one chunk of a partitioned array
    pub fn for_chunk(seed: u64, chunk_index: usize) -> Self {
        Self::from_seed(Self::chunk_seed(seed, chunk_index))
    }

    /// SplitMix64 finaliser over (seed, chunk index)
    pub fn chunk_seed(seed: u64, chunk_index: usize) -> u64 {
        let mut z = seed ^ (chunk_index as u64).wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    pub fn fill_normal(&mut self, buffer: &mut [f64]) {
        for value in buffer.iter_mut() {
            *value = self.rng.sample(StandardNormal);
        }
    }

    /// Step array of shape (realisations, steps)
    pub fn steps(&mut self, realisations: usize, steps: usize) -> Array2<f64> {
        let rng = &mut self.rng;
        Array2::from_shape_simple_fn((realisations, steps), || rng.sample(StandardNormal))
    }

    /// Generates each chunk from its own stream in parallel.
    /// The result depends on `chunk_rows` but not on the thread count.
    pub fn chunked_steps(
        seed: u64,
        realisations: usize,
        steps: usize,
        chunk_rows: usize,
    ) -> Result<Array2<f64>> {
        let spec = ChunkSpec::new(realisations, chunk_rows)?;
        let blocks: Vec<Array2<f64>> = spec
            .ranges()
            .into_par_iter()
            .enumerate()
            .map(|(index, rows)| Self::for_chunk(seed, index).steps(rows.len(), steps))
            .collect();

        reassemble(&blocks, steps)
    }
}
