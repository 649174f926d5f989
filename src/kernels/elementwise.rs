/// Element-wise vector operations
///
/// All operations require identical slice lengths and fail with
/// `ShapeMismatch` otherwise. The add/scale family runs over `LANES`-wide
/// chunks with a scalar tail; the transcendental activations are simple
/// per-element loops the compiler unrolls on its own.
use super::{check_same_len, LANES};
use crate::error::VulcanResult;

/// out = a + b
pub fn add(a: &[f32], b: &[f32], out: &mut [f32]) -> VulcanResult<()> {
    check_same_len(a.len(), b.len())?;
    check_same_len(a.len(), out.len())?;

    let chunks = a.len() / LANES * LANES;
    for i in (0..chunks).step_by(LANES) {
        for l in 0..LANES {
            out[i + l] = a[i + l] + b[i + l];
        }
    }
    for i in chunks..a.len() {
        out[i] = a[i] + b[i];
    }
    Ok(())
}

/// out = a * k
pub fn scale(a: &[f32], k: f32, out: &mut [f32]) -> VulcanResult<()> {
    check_same_len(a.len(), out.len())?;

    let chunks = a.len() / LANES * LANES;
    for i in (0..chunks).step_by(LANES) {
        for l in 0..LANES {
            out[i + l] = a[i + l] * k;
        }
    }
    for i in chunks..a.len() {
        out[i] = a[i] * k;
    }
    Ok(())
}

/// out += a * k (fused accumulate used by the attention value pass)
pub fn scaled_add(a: &[f32], k: f32, out: &mut [f32]) -> VulcanResult<()> {
    check_same_len(a.len(), out.len())?;

    let chunks = a.len() / LANES * LANES;
    for i in (0..chunks).step_by(LANES) {
        for l in 0..LANES {
            out[i + l] += a[i + l] * k;
        }
    }
    for i in chunks..a.len() {
        out[i] += a[i] * k;
    }
    Ok(())
}

/// out = max(a, 0)
pub fn relu(a: &[f32], out: &mut [f32]) -> VulcanResult<()> {
    check_same_len(a.len(), out.len())?;
    for (x, y) in a.iter().zip(out.iter_mut()) {
        *y = x.max(0.0);
    }
    Ok(())
}

/// Gate the upstream gradient by the forward input: out = upstream where a > 0.
pub fn relu_backward(a: &[f32], upstream: &[f32], out: &mut [f32]) -> VulcanResult<()> {
    check_same_len(a.len(), upstream.len())?;
    check_same_len(a.len(), out.len())?;
    for i in 0..a.len() {
        out[i] = if a[i] > 0.0 { upstream[i] } else { 0.0 };
    }
    Ok(())
}

/// out = a where a > 0, slope * a otherwise
pub fn leaky_relu(a: &[f32], slope: f32, out: &mut [f32]) -> VulcanResult<()> {
    check_same_len(a.len(), out.len())?;
    for (x, y) in a.iter().zip(out.iter_mut()) {
        *y = if *x > 0.0 { *x } else { slope * *x };
    }
    Ok(())
}

/// out = tanh(a)
pub fn tanh_act(a: &[f32], out: &mut [f32]) -> VulcanResult<()> {
    check_same_len(a.len(), out.len())?;
    for (x, y) in a.iter().zip(out.iter_mut()) {
        *y = x.tanh();
    }
    Ok(())
}

/// out = 1 / (1 + e^-a)
pub fn sigmoid(a: &[f32], out: &mut [f32]) -> VulcanResult<()> {
    check_same_len(a.len(), out.len())?;
    for (x, y) in a.iter().zip(out.iter_mut()) {
        *y = 1.0 / (1.0 + (-x).exp());
    }
    Ok(())
}
