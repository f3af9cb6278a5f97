// Computation Kernels
// Cumulative walk along the last (time) axis
use ndarray::{Array, ArrayBase, Axis, Data, Dimension, NdFloat, RemoveAxis, Zip};

/// Element types the walk kernel runs on.
/// `Into<f64>` lets statistics be reduced in double precision for any dtype.
pub trait WalkElement: NdFloat + Into<f64> {}

impl WalkElement for f32 {}
impl WalkElement for f64 {}

/// Walks the input step-by-step along its last axis.
///
/// Zero-initialises the output, then for every time index `l` sets
/// `out[.., l] = out[.., l - 1] + in[.., l]`. The previous index wraps around at
/// `l = 0` and reads the last slot, which is still zero at that point.
/// Every realisation (leading index) is independent.
///
/// No validation is performed.
pub fn walk_interpreted<T, S, D>(input: &ArrayBase<S, D>) -> Array<T, D>
where
    T: WalkElement,
    S: Data<Elem = T>,
    D: Dimension + RemoveAxis,
{
    // A 0-d array is a single step with nothing before it
    if input.ndim() == 0 {
        return input.mapv(|x| T::zero() + x);
    }

    let mut output = Array::<T, D>::zeros(input.raw_dim());
    let time = Axis(input.ndim() - 1);
    let len = input.len_of(time);

    for l in 0..len {
        // Wraparound: l - 1 at l = 0 is the last column
        let prev = (l + len - 1) % len;
        let carried = output.index_axis(time, prev).to_owned();
        let mut column = output.index_axis_mut(time, l);
        Zip::from(&mut column)
            .and(&carried)
            .and(&input.index_axis(time, l))
            .for_each(|out, &before, &step| *out = before + step);
    }

    output
}

/// Row-wise accumulation over contiguous memory.
/// `input` and `output` hold whole rows of `row_len` elements back to back.
///
/// Each row starts from zero, so the first element is `0 + x` exactly as
/// in [`walk_interpreted`] and results stay bit-identical.
pub fn walk_rows<T: WalkElement>(input: &[T], output: &mut [T], row_len: usize) {
    if row_len == 0 {
        return;
    }

    for (src, dst) in input
        .chunks_exact(row_len)
        .zip(output.chunks_exact_mut(row_len))
    {
        let mut acc = T::zero();
        for (step, out) in src.iter().zip(dst.iter_mut()) {
            acc = acc + *step;
            *out = acc;
        }
    }
}

/// Population standard deviation (ddof = 0) over every element.
/// Returns NaN for an empty array.
pub fn std_dev<T, S, D>(array: &ArrayBase<S, D>) -> f64
where
    T: WalkElement,
    S: Data<Elem = T>,
    D: Dimension,
{
    let n = array.len();
    if n == 0 {
        return f64::NAN;
    }

    // Two passes: mean first, then squared deviations
    let mean = array.iter().map(|&x| Into::<f64>::into(x)).sum::<f64>() / n as f64;
    let sq = array
        .iter()
        .map(|&x| {
            let d = Into::<f64>::into(x) - mean;
            d * d
        })
        .sum::<f64>();
    (sq / n as f64).sqrt()
}
