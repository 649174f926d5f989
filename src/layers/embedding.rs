/// Token embedding lookup
///
/// Gathers rows of the (vocab, dim) table for a sequence of token ids. The
/// backward closure scatter-adds the upstream gradient rows back into the
/// table gradient.
use crate::error::{VulcanError, VulcanResult};
use crate::tensor::Tensor;

pub fn embedding(ids: &[u32], table: &Tensor) -> VulcanResult<Tensor> {
    let shape = table.shape();
    if shape.len() != 2 {
        return Err(VulcanError::Validation(
            "embedding table must be 2-D (vocab, dim)".to_string(),
        ));
    }
    let (vocab, dim) = (shape[0], shape[1]);
    for &id in ids {
        if id as usize >= vocab {
            return Err(VulcanError::Validation(format!(
                "token id {} out of range for vocab {}",
                id, vocab
            )));
        }
    }

    let table_data = table.data();
    let mut out = vec![0.0; ids.len() * dim];
    for (row, &id) in ids.iter().enumerate() {
        let src = &table_data[id as usize * dim..(id as usize + 1) * dim];
        out[row * dim..(row + 1) * dim].copy_from_slice(src);
    }
    drop(table_data);

    let out_shape = [ids.len(), dim];
    if !table.requires_grad() {
        return Ok(Tensor::from_op(out, &out_shape, Vec::new(), None));
    }

    let table_c = table.clone();
    let ids_owned = ids.to_vec();
    let backward = Box::new(move |upstream: &[f32]| {
        let mut d_table = vec![0.0; vocab * dim];
        for (row, &id) in ids_owned.iter().enumerate() {
            let dst = &mut d_table[id as usize * dim..(id as usize + 1) * dim];
            let src = &upstream[row * dim..(row + 1) * dim];
            for (d, u) in dst.iter_mut().zip(src.iter()) {
                *d += u;
            }
        }
        table_c
            .accumulate_grad(&d_table)
            .expect("embedding backward: table grad size");
    });

    Ok(Tensor::from_op(
        out,
        &out_shape,
        vec![table.clone()],
        Some(backward),
    ))
}
