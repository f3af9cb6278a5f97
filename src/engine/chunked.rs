// Chunked Execution
// Partition along the realisation axis, walk every chunk in parallel, reassemble
use std::ops::Range;

use ndarray::{concatenate, s, Array2, ArrayView2, Axis};
use rayon::prelude::*;
use tracing::debug;

use crate::engine::dispatch::Dispatcher;
use crate::engine::kernels::WalkElement;
use crate::engine::stats::Moments;
use crate::error::{Result, WalkError};

/// Row partitioning of a (realisations x steps) array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpec {
    total_rows: usize,
    chunk_rows: usize,
}

impl ChunkSpec {
    pub fn new(total_rows: usize, chunk_rows: usize) -> Result<Self> {
        if chunk_rows == 0 {
            return Err(WalkError::InvalidChunkSize(chunk_rows));
        }
        Ok(Self {
            total_rows,
            chunk_rows,
        })
    }

    pub fn chunk_rows(&self) -> usize {
        self.chunk_rows
    }

    /// Number of chunks (ceil division)
    pub fn len(&self) -> usize {
        self.total_rows.div_ceil(self.chunk_rows)
    }

    pub fn is_empty(&self) -> bool {
        self.total_rows == 0
    }

    /// Contiguous row ranges; only the last one may be short
    pub fn ranges(&self) -> Vec<Range<usize>> {
        (0..self.total_rows)
            .step_by(self.chunk_rows)
            .map(|start| start..(start + self.chunk_rows).min(self.total_rows))
            .collect()
    }
}

/// Stitches walked chunks back together in row order
pub fn reassemble<T: WalkElement>(blocks: &[Array2<T>], steps: usize) -> Result<Array2<T>> {
    if blocks.is_empty() {
        return Ok(Array2::zeros((0, steps)));
    }
    let views: Vec<ArrayView2<T>> = blocks.iter().map(|b| b.view()).collect();
    Ok(concatenate(Axis(0), &views)?)
}

/// Maps the compiled kernel over row chunks with Rayon.
pub struct ChunkedWalk<'d> {
    dispatcher: &'d Dispatcher,
    chunk_rows: usize,
}

impl<'d> ChunkedWalk<'d> {
    pub fn new(dispatcher: &'d Dispatcher, chunk_rows: usize) -> Result<Self> {
        // Validate eagerly so a bad size fails before any data is touched
        ChunkSpec::new(0, chunk_rows)?;
        Ok(Self {
            dispatcher,
            chunk_rows,
        })
    }

    pub fn run<T: WalkElement>(&self, steps: &ArrayView2<T>) -> Result<Array2<T>> {
        let spec = ChunkSpec::new(steps.nrows(), self.chunk_rows)?;
        debug!(chunks = spec.len(), chunk_rows = self.chunk_rows, "mapping walk over chunks");

        let walked: Vec<Array2<T>> = spec
            .ranges()
            .into_par_iter()
            .map(|rows| self.dispatcher.call(&steps.slice(s![rows, ..])))
            .collect();

        reassemble(&walked, steps.ncols())
    }

    /// Reduces the walk's moments chunk by chunk without reassembling it
    pub fn run_moments<T: WalkElement>(&self, steps: &ArrayView2<T>) -> Result<Moments> {
        let spec = ChunkSpec::new(steps.nrows(), self.chunk_rows)?;

        let moments = spec
            .ranges()
            .into_par_iter()
            .map(|rows| Moments::of(&self.dispatcher.call(&steps.slice(s![rows, ..]))))
            .reduce(Moments::default, Moments::merge);

        Ok(moments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::kernels::{std_dev, walk_interpreted};
    use approx::assert_relative_eq;

    #[test]
    fn test_ranges_cover_all_rows() {
        let spec = ChunkSpec::new(10, 4).unwrap();
        assert_eq!(spec.ranges(), vec![0..4, 4..8, 8..10]);
        assert_eq!(spec.len(), 3);
        assert!(ChunkSpec::new(0, 4).unwrap().ranges().is_empty());
    }

    #[test]
    fn test_zero_chunk_rows_rejected() {
        assert!(matches!(
            ChunkSpec::new(10, 0),
            Err(WalkError::InvalidChunkSize(0))
        ));
        assert!(ChunkedWalk::new(Dispatcher::global(), 0).is_err());
    }

    #[test]
    fn test_partition_invariance() {
        let steps =
            Array2::from_shape_fn((13, 8), |(r, t)| (r as f64 * 0.37 - t as f64 * 0.11).tan());
        let expected = walk_interpreted(&steps);
        let dispatcher = Dispatcher::new();

        for chunk_rows in [1, 2, 5, 13, 100] {
            let walked = ChunkedWalk::new(&dispatcher, chunk_rows)
                .unwrap()
                .run(&steps.view())
                .unwrap();
            assert_eq!(walked, expected, "chunk_rows = {chunk_rows}");
        }
    }

    #[test]
    fn test_moments_match_full_std() {
        let steps = Array2::from_shape_fn((9, 4), |(r, t)| ((r * 5 + t) % 7) as f64 - 3.0);
        let dispatcher = Dispatcher::new();
        let chunked = ChunkedWalk::new(&dispatcher, 2).unwrap();
        let moments = chunked.run_moments(&steps.view()).unwrap();
        assert_eq!(moments.count, 36);
        assert_relative_eq!(
            moments.std_dev(),
            std_dev(&walk_interpreted(&steps)),
            max_relative = 1e-12
        );
    }

    #[test]
    fn test_empty_array() {
        let steps = Array2::<f64>::zeros((0, 3));
        let walked = ChunkedWalk::new(Dispatcher::global(), 4)
            .unwrap()
            .run(&steps.view())
            .unwrap();
        assert_eq!(walked.dim(), (0, 3));
    }
}
