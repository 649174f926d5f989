/// Cross-entropy loss over logits
///
/// Forward computes a row-wise numerically stable log-softmax, sums the
/// negative log-likelihood over valid positions and normalizes by their
/// count. Targets outside [0, vocab) are skipped — padding positions carry
/// an out-of-range id. The softmax outputs are cached so backward never
/// recomputes them: the logit gradient per valid row is
/// `(softmax - one_hot) * upstream / count`.
use super::fold_rows;
use crate::error::{VulcanError, VulcanResult};
use crate::tensor::Tensor;

pub fn cross_entropy(logits: &Tensor, targets: &[u32]) -> VulcanResult<Tensor> {
    let shape = logits.shape();
    let (rows, vocab) = fold_rows(&shape);
    if targets.len() != rows {
        return Err(VulcanError::ShapeMismatch {
            expected: rows,
            actual: targets.len(),
        });
    }
    if vocab == 0 {
        return Err(VulcanError::Validation("empty vocab dimension".to_string()));
    }

    let logits_data = logits.data().to_vec();
    let mut probs = vec![0.0; rows * vocab];
    let mut total = 0.0f64;
    let mut count = 0usize;

    for r in 0..rows {
        let row = &logits_data[r * vocab..(r + 1) * vocab];
        let p_row = &mut probs[r * vocab..(r + 1) * vocab];

        // Stable log-softmax: shift by the row max
        let max_val = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum_exp = 0.0f32;
        for (p, &x) in p_row.iter_mut().zip(row.iter()) {
            *p = (x - max_val).exp();
            sum_exp += *p;
        }
        let inv = 1.0 / sum_exp;
        for p in p_row.iter_mut() {
            *p *= inv;
        }

        let target = targets[r] as usize;
        if target < vocab {
            let log_sum = sum_exp.ln();
            total += -((row[target] - max_val - log_sum) as f64);
            count += 1;
        }
    }

    let loss = if count > 0 {
        (total / count as f64) as f32
    } else {
        0.0
    };

    if !logits.requires_grad() {
        return Ok(Tensor::from_op(vec![loss], &[1], Vec::new(), None));
    }

    let logits_c = logits.clone();
    let targets_owned = targets.to_vec();
    let backward = Box::new(move |upstream: &[f32]| {
        if count == 0 {
            return;
        }
        let u = upstream[0] / count as f32;
        let mut d_logits = vec![0.0; rows * vocab];
        for r in 0..rows {
            let target = targets_owned[r] as usize;
            if target >= vocab {
                continue;
            }
            let p_row = &probs[r * vocab..(r + 1) * vocab];
            let d_row = &mut d_logits[r * vocab..(r + 1) * vocab];
            for (d, &p) in d_row.iter_mut().zip(p_row.iter()) {
                *d = p * u;
            }
            d_row[target] -= u;
        }
        logits_c
            .accumulate_grad(&d_logits)
            .expect("cross_entropy backward: logits grad size");
    });

    Ok(Tensor::from_op(
        vec![loss],
        &[1],
        vec![logits.clone()],
        Some(backward),
    ))
}
