/// Reverse-mode sweep over the computation graph
///
/// Backward runs in reverse topological order with an explicit stack, never
/// recursively, so deep graphs cannot overflow the call stack. Each node's
/// backward closure runs at most once; closures accumulate into producer
/// gradients through `Tensor::accumulate_grad`.
use std::collections::HashSet;

use super::Tensor;
use crate::error::{VulcanError, VulcanResult};

/// Post-order over the DAG reachable from `root` via producer edges.
///
/// Producers appear before their consumers, so iterating the result in
/// reverse visits every consumer before the tensors it feeds.
fn topological_order(root: &Tensor) -> Vec<Tensor> {
    let mut order = Vec::new();
    let mut visited = HashSet::new();
    let mut stack: Vec<(Tensor, usize)> = vec![(root.clone(), 0)];
    visited.insert(root.ptr());

    while let Some((node, child_idx)) = stack.pop() {
        let parents = node.parents();
        if child_idx < parents.len() {
            stack.push((node.clone(), child_idx + 1));
            let parent = parents[child_idx].clone();
            if visited.insert(parent.ptr()) {
                stack.push((parent, 0));
            }
        } else {
            order.push(node);
        }
    }
    order
}

/// Seed `root`'s gradient to 1.0 and propagate through the graph.
pub fn backward(root: &Tensor) -> VulcanResult<()> {
    if root.len() != 1 {
        return Err(VulcanError::Validation(format!(
            "backward requires a scalar loss, got {} elements",
            root.len()
        )));
    }
    if !root.requires_grad() {
        return Err(VulcanError::Validation(
            "backward on a tensor that does not require grad".to_string(),
        ));
    }

    root.accumulate_grad(&[1.0])?;

    let order = topological_order(root);
    for node in order.iter().rev() {
        if let Some(backward_fn) = node.take_backward_fn() {
            let grad = node.grad_or_zeros();
            backward_fn(&grad);
        }
    }
    Ok(())
}
