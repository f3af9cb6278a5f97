// Partial Statistics
// Mergeable moments so the std of a chunked walk can be reduced chunk by chunk
use ndarray::{ArrayBase, Data, Dimension};

use crate::engine::kernels::WalkElement;

/// Count, mean and sum of squared deviations of a block of values.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Moments {
    pub count: usize,
    pub mean: f64,
    pub m2: f64,
}

impl Moments {
    /// Two-pass moments of one block
    pub fn of<T, S, D>(block: &ArrayBase<S, D>) -> Self
    where
        T: WalkElement,
        S: Data<Elem = T>,
        D: Dimension,
    {
        let count = block.len();
        if count == 0 {
            return Self::default();
        }
        let mean = block.iter().map(|&x| Into::<f64>::into(x)).sum::<f64>() / count as f64;
        let m2 = block
            .iter()
            .map(|&x| {
                let d = Into::<f64>::into(x) - mean;
                d * d
            })
            .sum::<f64>();
        Self { count, mean, m2 }
    }

    /// Pairwise combination (Chan et al.)
    pub fn merge(self, other: Self) -> Self {
        if self.count == 0 {
            return other;
        }
        if other.count == 0 {
            return self;
        }
        let count = self.count + other.count;
        let n = count as f64;
        let delta = other.mean - self.mean;
        let mean = self.mean + delta * other.count as f64 / n;
        let m2 = self.m2 + other.m2 + delta * delta * (self.count as f64 * other.count as f64) / n;
        Self { count, mean, m2 }
    }

    /// Population variance (ddof = 0)
    pub fn variance(&self) -> f64 {
        if self.count == 0 {
            return f64::NAN;
        }
        self.m2 / self.count as f64
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }
}
