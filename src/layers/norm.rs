/// Layer normalization op with backward
///
/// Forward delegates to the Welford kernel and keeps per-row (mean, inv_std)
/// for the backward pass. The input gradient uses the standard layer-norm
/// jacobian expressed through row means of the scaled upstream.
use super::fold_rows;
use crate::error::{VulcanError, VulcanResult};
use crate::kernels::layer_norm_stats;
use crate::tensor::Tensor;

pub fn layer_norm(input: &Tensor, gamma: &Tensor, beta: &Tensor) -> VulcanResult<Tensor> {
    let in_shape = input.shape();
    let (rows, cols) = fold_rows(&in_shape);
    if gamma.len() != cols || beta.len() != cols {
        return Err(VulcanError::ShapeMismatch {
            expected: cols,
            actual: gamma.len().min(beta.len()),
        });
    }

    let mut out = vec![0.0; rows * cols];
    let mut means = vec![0.0; rows];
    let mut inv_stds = vec![0.0; rows];
    layer_norm_stats(
        &input.data(),
        &gamma.data(),
        &beta.data(),
        cols,
        &mut out,
        &mut means,
        &mut inv_stds,
    )?;

    let needs_grad = input.requires_grad() || gamma.requires_grad() || beta.requires_grad();
    if !needs_grad {
        return Ok(Tensor::from_op(out, &in_shape, Vec::new(), None));
    }

    let input_c = input.clone();
    let gamma_c = gamma.clone();
    let beta_c = beta.clone();
    let input_data = input.data().to_vec();
    let gamma_data = gamma.data().to_vec();

    let backward = Box::new(move |upstream: &[f32]| {
        let mut d_input = vec![0.0; rows * cols];
        let mut d_gamma = vec![0.0; cols];
        let mut d_beta = vec![0.0; cols];

        for r in 0..rows {
            let x = &input_data[r * cols..(r + 1) * cols];
            let u = &upstream[r * cols..(r + 1) * cols];
            let mean = means[r];
            let inv_std = inv_stds[r];

            // g = upstream * gamma; two row means drive the jacobian
            let mut mean_g = 0.0f32;
            let mut mean_gx = 0.0f32;
            for j in 0..cols {
                let x_hat = (x[j] - mean) * inv_std;
                let g = u[j] * gamma_data[j];
                mean_g += g;
                mean_gx += g * x_hat;
                d_gamma[j] += u[j] * x_hat;
                d_beta[j] += u[j];
            }
            mean_g /= cols as f32;
            mean_gx /= cols as f32;

            let dx_row = &mut d_input[r * cols..(r + 1) * cols];
            for j in 0..cols {
                let x_hat = (x[j] - mean) * inv_std;
                let g = u[j] * gamma_data[j];
                dx_row[j] = inv_std * (g - mean_g - x_hat * mean_gx);
            }
        }

        if input_c.requires_grad() {
            input_c
                .accumulate_grad(&d_input)
                .expect("layer_norm backward: input grad size");
        }
        if gamma_c.requires_grad() {
            gamma_c
                .accumulate_grad(&d_gamma)
                .expect("layer_norm backward: gamma grad size");
        }
        if beta_c.requires_grad() {
            beta_c
                .accumulate_grad(&d_beta)
                .expect("layer_norm backward: beta grad size");
        }
    });

    Ok(Tensor::from_op(
        out,
        &in_shape,
        vec![input.clone(), gamma.clone(), beta.clone()],
        Some(backward),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_norm_forward_normalizes() {
        let input = Tensor::from_vec(vec![1.0, 3.0, 5.0, 7.0], &[1, 4], false).unwrap();
        let gamma = Tensor::from_vec(vec![1.0; 4], &[4], false).unwrap();
        let beta = Tensor::from_vec(vec![0.0; 4], &[4], false).unwrap();
        let out = layer_norm(&input, &gamma, &beta).unwrap();
        let sum: f32 = out.data().iter().sum();
        assert!(sum.abs() < 1e-4);
    }

    #[test]
    fn test_layer_norm_backward_matches_finite_difference() {
        let x0 = vec![0.5, -1.0, 2.0, 0.1, 1.3, -0.7];
        let input = Tensor::from_vec(x0.clone(), &[2, 3], true).unwrap();
        let gamma = Tensor::from_vec(vec![1.2, 0.8, 1.0], &[3], true).unwrap();
        let beta = Tensor::from_vec(vec![0.0, 0.1, -0.1], &[3], true).unwrap();

        let out = layer_norm(&input, &gamma, &beta).unwrap();
        let upstream = vec![0.3, -0.2, 0.5, 1.0, 0.4, -0.6];
        out.accumulate_grad(&upstream).unwrap();
        let f = out.take_backward_fn().unwrap();
        f(&out.grad_or_zeros());
        let analytic = input.grad().unwrap().to_vec();

        // Finite differences on the scalar sum(upstream * out)
        let h = 1e-3f32;
        for i in 0..x0.len() {
            let eval = |delta: f32| {
                let mut x = x0.clone();
                x[i] += delta;
                let t = Tensor::from_vec(x, &[2, 3], false).unwrap();
                let o = layer_norm(&t, &gamma, &beta).unwrap();
                o.data()
                    .iter()
                    .zip(upstream.iter())
                    .map(|(a, b)| a * b)
                    .sum::<f32>()
            };
            let numeric = (eval(h) - eval(-h)) / (2.0 * h);
            assert!(
                (analytic[i] - numeric).abs() < 2e-2,
                "dx[{i}]: {} vs {}",
                analytic[i],
                numeric
            );
        }
    }

    #[test]
    fn test_layer_norm_shape_mismatch() {
        let input = Tensor::zeros(&[2, 4], false);
        let gamma = Tensor::zeros(&[3], false);
        let beta = Tensor::zeros(&[4], false);
        assert!(layer_norm(&input, &gamma, &beta).is_err());
    }
}
