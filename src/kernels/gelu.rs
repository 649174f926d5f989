/// GELU activation, forward and backward
///
/// Uses the tanh-based approximation
/// `0.5 * x * (1 + tanh(sqrt(2/pi) * (x + 0.044715 * x^3)))` with tanh
/// replaced by the rational approximant `z * (27 + z^2) / (27 + 9 * z^2)`
/// so the whole expression vectorizes without a libm call. The inner
/// argument is clamped to [-10, 10] and the approximant output to [-1, 1].
/// The backward pass is the exact derivative of this approximation.
use super::check_same_len;
use crate::error::VulcanResult;

const SQRT_2_OVER_PI: f32 = 0.797_884_56;
const GELU_COEFF: f32 = 0.044_715;
const INNER_CLAMP: f32 = 10.0;

#[inline(always)]
fn rational_tanh(z: f32) -> f32 {
    let z2 = z * z;
    (z * (27.0 + z2) / (27.0 + 9.0 * z2)).clamp(-1.0, 1.0)
}

/// out = gelu(a)
pub fn gelu(a: &[f32], out: &mut [f32]) -> VulcanResult<()> {
    check_same_len(a.len(), out.len())?;
    for (x, y) in a.iter().zip(out.iter_mut()) {
        let inner =
            (SQRT_2_OVER_PI * (x + GELU_COEFF * x * x * x)).clamp(-INNER_CLAMP, INNER_CLAMP);
        let t = rational_tanh(inner);
        *y = 0.5 * x * (1.0 + t);
    }
    Ok(())
}

/// out = upstream * d gelu(a) / d a
///
/// Differentiates the implemented forward: where the inner argument hit the
/// clamp the tanh term is constant, leaving only the `0.5 * (1 + t)` factor.
pub fn gelu_backward(a: &[f32], upstream: &[f32], out: &mut [f32]) -> VulcanResult<()> {
    check_same_len(a.len(), upstream.len())?;
    check_same_len(a.len(), out.len())?;
    for i in 0..a.len() {
        let x = a[i];
        let raw_inner = SQRT_2_OVER_PI * (x + GELU_COEFF * x * x * x);
        let clamped = raw_inner.abs() > INNER_CLAMP;
        let inner = raw_inner.clamp(-INNER_CLAMP, INNER_CLAMP);
        let t = rational_tanh(inner);

        let mut grad = 0.5 * (1.0 + t);
        if !clamped {
            // d inner / d x
            let dinner = SQRT_2_OVER_PI * (1.0 + 3.0 * GELU_COEFF * x * x);
            grad += 0.5 * x * (1.0 - t * t) * dinner;
        }
        out[i] = upstream[i] * grad;
    }
    Ok(())
}
