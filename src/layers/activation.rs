/// GELU activation op
///
/// Thin autograd wrapper over the GELU kernels; the backward closure gates
/// the upstream gradient through the exact derivative of the forward
/// approximation.
use crate::error::VulcanResult;
use crate::kernels::{gelu, gelu_backward};
use crate::tensor::Tensor;

pub fn gelu_op(input: &Tensor) -> VulcanResult<Tensor> {
    let shape = input.shape();
    let mut out = vec![0.0; input.len()];
    gelu(&input.data(), &mut out)?;

    if !input.requires_grad() {
        return Ok(Tensor::from_op(out, &shape, Vec::new(), None));
    }

    let input_c = input.clone();
    let input_data = input.data().to_vec();
    let backward = Box::new(move |upstream: &[f32]| {
        let mut d_input = vec![0.0; input_data.len()];
        gelu_backward(&input_data, upstream, &mut d_input)
            .expect("gelu backward: validated lengths");
        input_c
            .accumulate_grad(&d_input)
            .expect("gelu backward: input grad size");
    });

    Ok(Tensor::from_op(
        out,
        &shape,
        vec![input.clone()],
        Some(backward),
    ))
}
