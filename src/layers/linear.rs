/// Linear projection with optional bias
///
/// Forward is `out = input @ weight + bias` for input (rows, in_features)
/// and weight (in_features, out_features). The backward closure produces
/// `d_input = upstream @ W^T`, `d_weight = input^T @ upstream` and the
/// per-column bias gradient.
use super::{fold_rows, transpose};
use crate::error::{VulcanError, VulcanResult};
use crate::kernels::matmul_tiled;
use crate::tensor::Tensor;

pub fn linear(input: &Tensor, weight: &Tensor, bias: Option<&Tensor>) -> VulcanResult<Tensor> {
    let in_shape = input.shape();
    let w_shape = weight.shape();
    if w_shape.len() != 2 {
        return Err(VulcanError::Validation(
            "linear weight must be 2-D (in_features, out_features)".to_string(),
        ));
    }
    let (rows, in_features) = fold_rows(&in_shape);
    let (w_in, w_out) = (w_shape[0], w_shape[1]);
    if in_features != w_in {
        return Err(VulcanError::ShapeMismatch {
            expected: w_in,
            actual: in_features,
        });
    }
    if let Some(b) = bias {
        if b.len() != w_out {
            return Err(VulcanError::ShapeMismatch {
                expected: w_out,
                actual: b.len(),
            });
        }
    }

    let mut out = vec![0.0; rows * w_out];
    matmul_tiled(&input.data(), &weight.data(), rows, in_features, w_out, &mut out)?;
    if let Some(b) = bias {
        let b_data = b.data();
        for row in out.chunks_mut(w_out) {
            for (o, bv) in row.iter_mut().zip(b_data.iter()) {
                *o += bv;
            }
        }
    }

    let mut out_shape = in_shape.clone();
    *out_shape.last_mut().expect("validated non-empty shape") = w_out;

    let needs_grad = input.requires_grad()
        || weight.requires_grad()
        || bias.map(|b| b.requires_grad()).unwrap_or(false);
    if !needs_grad {
        return Ok(Tensor::from_op(out, &out_shape, Vec::new(), None));
    }

    let input_c = input.clone();
    let weight_c = weight.clone();
    let bias_c = bias.cloned();
    let input_data = input.data().to_vec();
    let weight_data = weight.data().to_vec();
    let mut parents = vec![input.clone(), weight.clone()];
    if let Some(b) = bias {
        parents.push(b.clone());
    }

    let backward = Box::new(move |upstream: &[f32]| {
        if input_c.requires_grad() {
            // d_input = upstream @ W^T
            let w_t = transpose(&weight_data, w_in, w_out);
            let mut d_input = vec![0.0; rows * w_in];
            matmul_tiled(upstream, &w_t, rows, w_out, w_in, &mut d_input)
                .expect("linear backward: validated dims");
            input_c
                .accumulate_grad(&d_input)
                .expect("linear backward: input grad size");
        }
        if weight_c.requires_grad() {
            // d_weight = input^T @ upstream
            let in_t = transpose(&input_data, rows, w_in);
            let mut d_weight = vec![0.0; w_in * w_out];
            matmul_tiled(&in_t, upstream, w_in, rows, w_out, &mut d_weight)
                .expect("linear backward: validated dims");
            weight_c
                .accumulate_grad(&d_weight)
                .expect("linear backward: weight grad size");
        }
        if let Some(b) = &bias_c {
            if b.requires_grad() {
                let mut d_bias = vec![0.0; w_out];
                for row in upstream.chunks(w_out) {
                    for (g, u) in d_bias.iter_mut().zip(row.iter()) {
                        *g += u;
                    }
                }
                b.accumulate_grad(&d_bias)
                    .expect("linear backward: bias grad size");
            }
        }
    });

    Ok(Tensor::from_op(out, &out_shape, parents, Some(backward)))
}
