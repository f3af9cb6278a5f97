// Kernel Dispatcher
// Type- and shape-keyed specialisation cache for the compiled walk path
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use ndarray::{Array, ArrayBase, Data, Dimension};
use tracing::debug;

use crate::engine::kernels::{walk_rows, WalkElement};

/// Cache key: element type plus full input shape
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    dtype: TypeId,
    dtype_name: &'static str,
    shape: Vec<usize>,
}

impl Signature {
    pub fn of<T: 'static>(shape: &[usize]) -> Self {
        Self {
            dtype: TypeId::of::<T>(),
            dtype_name: std::any::type_name::<T>(),
            shape: shape.to_vec(),
        }
    }

    pub fn dtype_name(&self) -> &'static str {
        self.dtype_name
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:?}", self.dtype_name, self.shape)
    }
}

/// Loop bounds resolved once per signature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopPlan {
    pub rows: usize,
    pub row_len: usize,
    pub ndim: usize,
}

impl LoopPlan {
    fn for_shape(shape: &[usize]) -> Self {
        // 0-d arrays behave as one row of one step
        let row_len = shape.last().copied().unwrap_or(1);
        let len: usize = shape.iter().product();
        let rows = if row_len == 0 { 0 } else { len / row_len };
        Self {
            rows,
            row_len,
            ndim: shape.len(),
        }
    }
}

/// One cached, monomorphised entry point
pub struct Specialization<T: WalkElement> {
    signature: Signature,
    plan: LoopPlan,
    kernel: fn(&[T], &mut [T], usize),
}

impl<T: WalkElement> Specialization<T> {
    fn new(signature: Signature) -> Self {
        let plan = LoopPlan::for_shape(signature.shape());
        Self {
            signature,
            plan,
            kernel: walk_rows::<T>,
        }
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn plan(&self) -> LoopPlan {
        self.plan
    }

    /// Runs the plan over a standard-layout copy (or view) of the input
    pub fn execute<S, D>(&self, input: &ArrayBase<S, D>) -> Array<T, D>
    where
        S: Data<Elem = T>,
        D: Dimension,
    {
        debug_assert_eq!(input.ndim(), self.plan.ndim);
        let contiguous = input.as_standard_layout();
        let mut output = Array::<T, D>::zeros(input.raw_dim());

        // Standard layout (and a fresh zeros array) always yield slices
        if let (Some(src), Some(dst)) = (contiguous.as_slice(), output.as_slice_mut()) {
            debug_assert_eq!(src.len(), self.plan.rows * self.plan.row_len);
            (self.kernel)(src, dst, self.plan.row_len);
        }
        output
    }
}

/// Specialises the walk kernel on first use of each (dtype, shape) and
/// reuses the specialisation afterwards.
#[derive(Default)]
pub struct Dispatcher {
    cache: Mutex<HashMap<Signature, Arc<dyn Any + Send + Sync>>>,
    compilations: AtomicUsize,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide dispatcher
    pub fn global() -> &'static Dispatcher {
        static GLOBAL: OnceLock<Dispatcher> = OnceLock::new();
        GLOBAL.get_or_init(Dispatcher::new)
    }

    /// Compiled walk: same result as
    /// [`walk_interpreted`](crate::engine::kernels::walk_interpreted), bit for bit.
    pub fn call<T, S, D>(&self, input: &ArrayBase<S, D>) -> Array<T, D>
    where
        T: WalkElement,
        S: Data<Elem = T>,
        D: Dimension,
    {
        self.specialize::<T>(input.shape()).execute(input)
    }

    /// Looks up the specialisation for `shape`, creating it on a miss
    pub fn specialize<T: WalkElement>(&self, shape: &[usize]) -> Arc<Specialization<T>> {
        let signature = Signature::of::<T>(shape);
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(entry) = cache.get(&signature) {
            if let Ok(hit) = Arc::clone(entry).downcast::<Specialization<T>>() {
                return hit;
            }
        }

        debug!(signature = %signature, "specialising walk kernel");
        let spec = Arc::new(Specialization::<T>::new(signature.clone()));
        cache.insert(signature, Arc::clone(&spec) as Arc<dyn Any + Send + Sync>);
        self.compilations.fetch_add(1, Ordering::Relaxed);
        spec
    }

    /// Number of specialisations created so far (cache misses)
    pub fn compilations(&self) -> usize {
        self.compilations.load(Ordering::Relaxed)
    }

    pub fn cache_len(&self) -> usize {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn signatures(&self) -> Vec<Signature> {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Drops every cached specialisation; the counter is kept
    pub fn clear(&self) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::kernels::walk_interpreted;
    use ndarray::{arr0, arr2, Array2, Array3};

    #[test]
    fn test_compiled_matches_interpreted_bitwise() {
        let steps =
            Array2::from_shape_fn((5, 9), |(r, t)| ((r + 1) as f64).sin() * (t as f64).cos());
        let dispatcher = Dispatcher::new();
        let compiled = dispatcher.call(&steps);
        let interpreted = walk_interpreted(&steps);
        for (a, b) in compiled.iter().zip(interpreted.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn test_cache_keyed_on_shape_and_dtype() {
        let dispatcher = Dispatcher::new();
        let a = arr2(&[[1.0f64, 2.0], [3.0, 4.0]]);
        let b = arr2(&[[1.0f64, 2.0, 3.0]]);

        dispatcher.call(&a);
        dispatcher.call(&a);
        assert_eq!(dispatcher.compilations(), 1);

        dispatcher.call(&b);
        assert_eq!(dispatcher.compilations(), 2);

        dispatcher.call(&a.mapv(|x| x as f32));
        assert_eq!(dispatcher.compilations(), 3);
        assert_eq!(dispatcher.cache_len(), 3);

        let names: Vec<_> = dispatcher
            .signatures()
            .iter()
            .map(|s| s.dtype_name())
            .collect();
        assert!(names.contains(&"f32"));
    }

    #[test]
    fn test_non_standard_layout_input() {
        let steps = arr2(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        let transposed = steps.t();
        let walk = Dispatcher::new().call(&transposed);
        assert_eq!(walk, arr2(&[[1.0, 5.0], [2.0, 7.0], [3.0, 9.0]]));
    }

    #[test]
    fn test_plan_for_rank_three() {
        let dispatcher = Dispatcher::new();
        let spec = dispatcher.specialize::<f64>(&[2, 3, 4]);
        assert_eq!(
            spec.plan(),
            LoopPlan {
                rows: 6,
                row_len: 4,
                ndim: 3
            }
        );
        let steps = Array3::<f64>::ones((2, 3, 4));
        assert_eq!(dispatcher.call(&steps)[[1, 2, 3]], 4.0);
    }

    #[test]
    fn test_clear_forces_respecialisation() {
        let dispatcher = Dispatcher::new();
        let a = arr2(&[[1.0f64]]);
        dispatcher.call(&a);
        dispatcher.clear();
        assert_eq!(dispatcher.cache_len(), 0);
        dispatcher.call(&a);
        assert_eq!(dispatcher.compilations(), 2);
    }

    #[test]
    fn test_plan_covers_every_element() {
        let dispatcher = Dispatcher::new();
        for shape in [vec![], vec![0, 5], vec![4, 0], vec![3, 7], vec![2, 2, 2]] {
            let plan = dispatcher.specialize::<f64>(&shape).plan();
            let len: usize = shape.iter().product();
            assert_eq!(plan.rows * plan.row_len, len, "shape {shape:?}");
            assert_eq!(plan.ndim, shape.len());
        }
    }

    #[test]
    fn test_zero_dim_and_empty_inputs() {
        let dispatcher = Dispatcher::new();
        let scalar = arr0(-0.0f64);
        let walked = dispatcher.call(&scalar);
        assert_eq!(walked.into_scalar().to_bits(), 0.0f64.to_bits());
        assert_eq!(walked_bits(&walk_interpreted(&scalar.view().into_dyn())), vec![0.0f64.to_bits()]);

        let empty = Array2::<f64>::zeros((3, 0));
        assert_eq!(dispatcher.call(&empty).dim(), (3, 0));
    }

    fn walked_bits<D: Dimension>(walk: &Array<f64, D>) -> Vec<u64> {
        walk.iter().map(|x| x.to_bits()).collect()
    }
}
