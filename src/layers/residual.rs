/// Residual addition
///
/// `out = a + b` with the upstream gradient flowing unchanged into both
/// inputs.
use crate::error::VulcanResult;
use crate::kernels::add;
use crate::tensor::Tensor;

pub fn residual_add(a: &Tensor, b: &Tensor) -> VulcanResult<Tensor> {
    let shape = a.shape();
    let mut out = vec![0.0; a.len()];
    add(&a.data(), &b.data(), &mut out)?;

    if !a.requires_grad() && !b.requires_grad() {
        return Ok(Tensor::from_op(out, &shape, Vec::new(), None));
    }

    let a_c = a.clone();
    let b_c = b.clone();
    let backward = Box::new(move |upstream: &[f32]| {
        if a_c.requires_grad() {
            a_c.accumulate_grad(upstream)
                .expect("residual backward: a grad size");
        }
        if b_c.requires_grad() {
            b_c.accumulate_grad(upstream)
                .expect("residual backward: b grad size");
        }
    });

    Ok(Tensor::from_op(
        out,
        &shape,
        vec![a.clone(), b.clone()],
        Some(backward),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_residual_forward_and_backward() {
        let a = Tensor::from_vec(vec![1.0, 2.0], &[2], true).unwrap();
        let b = Tensor::from_vec(vec![10.0, 20.0], &[2], true).unwrap();
        let out = residual_add(&a, &b).unwrap();
        assert_eq!(&*out.data(), &[11.0, 22.0]);

        out.accumulate_grad(&[0.5, 0.25]).unwrap();
        let f = out.take_backward_fn().unwrap();
        f(&out.grad_or_zeros());
        assert_eq!(&*a.grad().unwrap(), &[0.5, 0.25]);
        assert_eq!(&*b.grad().unwrap(), &[0.5, 0.25]);
    }

    #[test]
    fn test_residual_length_mismatch() {
        let a = Tensor::zeros(&[2], false);
        let b = Tensor::zeros(&[3], false);
        assert!(residual_add(&a, &b).is_err());
    }
}
