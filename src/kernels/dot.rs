/// Dot product with lane-parallel partial sums
///
/// Eight independent accumulators let the compiler keep the reduction in
/// vector registers; short inputs fall back to the scalar loop directly.
use super::LANES;

/// dot(a, b) over the common prefix of the two slices.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len().min(b.len());
    if n < LANES {
        let mut acc = 0.0;
        for i in 0..n {
            acc += a[i] * b[i];
        }
        return acc;
    }

    let chunks = n / LANES * LANES;
    let mut lanes = [0.0f32; LANES];
    for i in (0..chunks).step_by(LANES) {
        for l in 0..LANES {
            lanes[l] += a[i + l] * b[i + l];
        }
    }

    let mut acc: f32 = lanes.iter().sum();
    for i in chunks..n {
        acc += a[i] * b[i];
    }
    acc
}
