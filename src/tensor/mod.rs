/// Autograd-capable tensor
///
/// A `Tensor` is a shared handle over a dense row-major f32 buffer with a
/// shape, an optional gradient of identical element count, and an optional
/// backward closure that propagates the tensor's gradient into its
/// producers. The training graph is a DAG: tensors own handles to their
/// producers, never the reverse. The serving path does not use this type;
/// it operates on plain pooled buffers.
pub mod autograd;

use std::cell::{Ref, RefCell, RefMut};
use std::rc::Rc;

use crate::error::{VulcanError, VulcanResult};

pub(crate) type BackwardFn = Box<dyn FnOnce(&[f32])>;

pub(crate) struct TensorInner {
    pub(crate) data: Vec<f32>,
    pub(crate) shape: Vec<usize>,
    pub(crate) requires_grad: bool,
    pub(crate) grad: Option<Vec<f32>>,
    pub(crate) backward_fn: Option<BackwardFn>,
    pub(crate) parents: Vec<Tensor>,
}

/// Shared handle to a tensor node in the computation graph.
#[derive(Clone)]
pub struct Tensor {
    inner: Rc<RefCell<TensorInner>>,
}

impl Tensor {
    /// Create a tensor from data and shape.
    pub fn from_vec(data: Vec<f32>, shape: &[usize], requires_grad: bool) -> VulcanResult<Self> {
        let count: usize = shape.iter().product();
        if data.len() != count {
            return Err(VulcanError::ShapeMismatch {
                expected: count,
                actual: data.len(),
            });
        }
        Ok(Self {
            inner: Rc::new(RefCell::new(TensorInner {
                data,
                shape: shape.to_vec(),
                requires_grad,
                grad: None,
                backward_fn: None,
                parents: Vec::new(),
            })),
        })
    }

    /// Zero-filled tensor.
    pub fn zeros(shape: &[usize], requires_grad: bool) -> Self {
        let count: usize = shape.iter().product();
        Self::from_vec(vec![0.0; count], shape, requires_grad)
            .expect("zeros: shape product matches buffer")
    }

    /// Internal constructor for op outputs with an attached backward closure.
    pub(crate) fn from_op(
        data: Vec<f32>,
        shape: &[usize],
        parents: Vec<Tensor>,
        backward_fn: Option<BackwardFn>,
    ) -> Self {
        let requires_grad = backward_fn.is_some();
        Self {
            inner: Rc::new(RefCell::new(TensorInner {
                data,
                shape: shape.to_vec(),
                requires_grad,
                grad: None,
                backward_fn,
                parents,
            })),
        }
    }

    pub fn shape(&self) -> Vec<usize> {
        self.inner.borrow().shape.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn requires_grad(&self) -> bool {
        self.inner.borrow().requires_grad
    }

    /// Borrow the data buffer.
    pub fn data(&self) -> Ref<'_, [f32]> {
        Ref::map(self.inner.borrow(), |i| i.data.as_slice())
    }

    /// Mutably borrow the data buffer (optimizer steps, weight loading).
    pub fn data_mut(&self) -> RefMut<'_, [f32]> {
        RefMut::map(self.inner.borrow_mut(), |i| i.data.as_mut_slice())
    }

    /// Borrow the gradient buffer if one has been accumulated.
    pub fn grad(&self) -> Option<Ref<'_, [f32]>> {
        Ref::filter_map(self.inner.borrow(), |i| i.grad.as_deref()).ok()
    }

    /// Accumulate `upstream` into this tensor's gradient, allocating lazily.
    ///
    /// Invariant: the gradient buffer always matches the data element count.
    pub fn accumulate_grad(&self, upstream: &[f32]) -> VulcanResult<()> {
        let mut inner = self.inner.borrow_mut();
        let n = inner.data.len();
        if upstream.len() != n {
            return Err(VulcanError::ShapeMismatch {
                expected: n,
                actual: upstream.len(),
            });
        }
        let grad = inner.grad.get_or_insert_with(|| vec![0.0; n]);
        for (g, u) in grad.iter_mut().zip(upstream.iter()) {
            *g += u;
        }
        Ok(())
    }

    /// Drop the gradient buffer.
    pub fn zero_grad(&self) {
        self.inner.borrow_mut().grad = None;
    }

    pub(crate) fn ptr(&self) -> usize {
        Rc::as_ptr(&self.inner) as usize
    }

    pub(crate) fn parents(&self) -> Vec<Tensor> {
        self.inner.borrow().parents.clone()
    }

    pub(crate) fn take_backward_fn(&self) -> Option<BackwardFn> {
        self.inner.borrow_mut().backward_fn.take()
    }

    pub(crate) fn grad_or_zeros(&self) -> Vec<f32> {
        let inner = self.inner.borrow();
        match &inner.grad {
            Some(g) => g.clone(),
            None => vec![0.0; inner.data.len()],
        }
    }

    /// Run backward from this scalar: seed its gradient to 1.0 and sweep the
    /// graph in reverse topological order. See `autograd::backward`.
    pub fn backward(&self) -> VulcanResult<()> {
        autograd::backward(self)
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Tensor")
            .field("shape", &inner.shape)
            .field("requires_grad", &inner.requires_grad)
            .field("has_grad", &inner.grad.is_some())
            .finish()
    }
}

/// A named tensor with a stable identity for the optimizer.
///
/// Parameters always participate in autograd. Data is mutated only by
/// optimizer steps; gradients only by backward closures.
#[derive(Debug, Clone)]
pub struct Parameter {
    name: String,
    tensor: Tensor,
}

impl Parameter {
    pub fn new(name: impl Into<String>, data: Vec<f32>, shape: &[usize]) -> VulcanResult<Self> {
        Ok(Self {
            name: name.into(),
            tensor: Tensor::from_vec(data, shape, true)?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    pub fn zero_grad(&self) {
        self.tensor.zero_grad();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vec_shape_check() {
        assert!(Tensor::from_vec(vec![0.0; 5], &[2, 3], false).is_err());
        assert!(Tensor::from_vec(vec![0.0; 6], &[2, 3], false).is_ok());
    }

    #[test]
    fn test_grad_accumulates_lazily() {
        let t = Tensor::zeros(&[3], true);
        assert!(t.grad().is_none());
        t.accumulate_grad(&[1.0, 2.0, 3.0]).unwrap();
        t.accumulate_grad(&[1.0, 1.0, 1.0]).unwrap();
        let g = t.grad().unwrap();
        assert_eq!(&*g, &[2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_grad_shape_enforced() {
        let t = Tensor::zeros(&[3], true);
        assert!(t.accumulate_grad(&[1.0]).is_err());
    }

    #[test]
    fn test_zero_grad_clears() {
        let t = Tensor::zeros(&[2], true);
        t.accumulate_grad(&[1.0, 1.0]).unwrap();
        t.zero_grad();
        assert!(t.grad().is_none());
    }

    #[test]
    fn test_parameter_identity() {
        let p = Parameter::new("wq", vec![0.0; 4], &[2, 2]).unwrap();
        assert_eq!(p.name(), "wq");
        assert!(p.tensor().requires_grad());
    }
}
