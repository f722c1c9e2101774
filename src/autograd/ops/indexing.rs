//! Gather/index-select/scatter-add: differentiable with respect to the value
//! tensor being indexed into, never with respect to the integer indices.

use crate::autograd::{apply1, Op, Variable};
use crate::error::CoreResult;
use crate::shape::Shape;
use crate::tensor::Tensor;

struct Gather {
    indices: Vec<usize>,
    num_rows: usize,
}
impl Op for Gather {
    fn forward(&mut self, inputs: &[Tensor]) -> CoreResult<Vec<Tensor>> {
        self.num_rows = inputs[0].shape().dims()[0];
        Ok(vec![inputs[0].gather(&self.indices)?])
    }
    fn backward(&self, grad_outputs: &[Tensor]) -> CoreResult<Vec<Option<Tensor>>> {
        let grad = Tensor::gather_backward(&grad_outputs[0], &self.indices, self.num_rows)?;
        Ok(vec![Some(grad)])
    }
    fn name(&self) -> &'static str {
        "Gather"
    }
}

/// Embedding-style row lookup: `weight[indices[i]]` for each `i`.
pub fn gather(weight: &Variable, indices: &[usize], training: bool) -> CoreResult<Variable> {
    apply1(Box::new(Gather { indices: indices.to_vec(), num_rows: 0 }), vec![weight.clone()], training)
}

struct IndexSelect {
    axis: isize,
    indices: Vec<usize>,
    input_shape: Option<Shape>,
}
impl Op for IndexSelect {
    fn forward(&mut self, inputs: &[Tensor]) -> CoreResult<Vec<Tensor>> {
        self.input_shape = Some(inputs[0].shape().clone());
        Ok(vec![inputs[0].index_select(self.axis, &self.indices)?])
    }
    fn backward(&self, grad_outputs: &[Tensor]) -> CoreResult<Vec<Option<Tensor>>> {
        let shape = self.input_shape.as_ref().unwrap().clone();
        let zero = Tensor::zeros(shape);
        let grad = zero.scatter_add(self.axis, &self.indices, &grad_outputs[0])?;
        Ok(vec![Some(grad)])
    }
    fn name(&self) -> &'static str {
        "IndexSelect"
    }
}

pub fn index_select(a: &Variable, axis: isize, indices: &[usize], training: bool) -> CoreResult<Variable> {
    apply1(
        Box::new(IndexSelect { axis, indices: indices.to_vec(), input_shape: None }),
        vec![a.clone()],
        training,
    )
}

struct ScatterAdd {
    axis: isize,
    indices: Vec<usize>,
}
impl Op for ScatterAdd {
    fn forward(&mut self, inputs: &[Tensor]) -> CoreResult<Vec<Tensor>> {
        Ok(vec![inputs[0].scatter_add(self.axis, &self.indices, &inputs[1])?])
    }
    fn backward(&self, grad_outputs: &[Tensor]) -> CoreResult<Vec<Option<Tensor>>> {
        // d/d(base) is identity; d/d(src) is the corresponding gather back out.
        let grad_base = grad_outputs[0].clone();
        let grad_src = grad_outputs[0].index_select(self.axis, &self.indices)?;
        Ok(vec![Some(grad_base), Some(grad_src)])
    }
    fn name(&self) -> &'static str {
        "ScatterAdd"
    }
}

pub fn scatter_add(base: &Variable, axis: isize, indices: &[usize], src: &Variable, training: bool) -> CoreResult<Variable> {
    apply1(
        Box::new(ScatterAdd { axis, indices: indices.to_vec() }),
        vec![base.clone(), src.clone()],
        training,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::Variable;

    #[test]
    fn gather_backward_duplicate_safe() {
        let w = Variable::leaf(Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], Shape::new(vec![2, 2])).unwrap(), true);
        let rows = gather(&w, &[0, 0, 1], true).unwrap();
        let loss = crate::autograd::ops::reductions::sum(&rows, true).unwrap();
        loss.backward().unwrap();
        assert_eq!(w.grad().unwrap().data(), &[2.0, 2.0, 1.0, 1.0]);
    }
}
