/// Numeric kernels over contiguous float slices
///
/// Pure functions, no heap allocation in hot paths. Every kernel processes a
/// fixed-width vector stride (`LANES` elements at a time, written so the
/// autovectorizer emits SIMD) followed by a scalar tail. Shapes are validated
/// up front and surface as `ShapeMismatch`.
pub mod dot;
pub mod elementwise;
pub mod gelu;
pub mod layer_norm;
pub mod matmul;
pub mod softmax;

pub use dot::dot;
pub use elementwise::{
    add, leaky_relu, relu, relu_backward, scale, scaled_add, sigmoid, tanh_act,
};
pub use gelu::{gelu, gelu_backward};
pub use layer_norm::{layer_norm_rows, layer_norm_stats};
pub use matmul::{matmul_batched_scores, matmul_naive, matmul_tiled};
pub use softmax::{masked_softmax, softmax_row, softmax_rows};

/// Vector stride shared by all kernels.
pub const LANES: usize = 8;

pub(crate) fn check_same_len(a: usize, b: usize) -> crate::error::VulcanResult<()> {
    if a != b {
        return Err(crate::error::VulcanError::ShapeMismatch {
            expected: a,
            actual: b,
        });
    }
    Ok(())
}
