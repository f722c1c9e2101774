//! Shape-only transforms: reshape, transpose, broadcast_to. None of these
//! touch values, so each backward is a shape inverse of its forward.

use crate::autograd::{apply1, Op, Variable};
use crate::error::CoreResult;
use crate::shape::Shape;
use crate::tensor::Tensor;

struct Reshape {
    original_shape: Option<Shape>,
    target: Option<Shape>,
}
impl Op for Reshape {
    fn forward(&mut self, inputs: &[Tensor]) -> CoreResult<Vec<Tensor>> {
        self.original_shape = Some(inputs[0].shape().clone());
        Ok(vec![inputs[0].reshape(self.target.clone().unwrap())?])
    }
    fn backward(&self, grad_outputs: &[Tensor]) -> CoreResult<Vec<Option<Tensor>>> {
        let shape = self.original_shape.as_ref().unwrap().clone();
        Ok(vec![Some(grad_outputs[0].reshape(shape)?)])
    }
    fn name(&self) -> &'static str {
        "Reshape"
    }
}

// `Reshape` needs its target baked in before `forward` runs; store it as a
// second field set at construction (the op is single-use regardless).
impl Reshape {
    fn new(target: Shape) -> Self {
        Reshape { original_shape: None, target: Some(target) }
    }
}

pub fn reshape(a: &Variable, target: Shape, training: bool) -> CoreResult<Variable> {
    apply1(Box::new(Reshape::new(target)), vec![a.clone()], training)
}

struct TransposePerm {
    perm: Vec<usize>,
}
impl Op for TransposePerm {
    fn forward(&mut self, inputs: &[Tensor]) -> CoreResult<Vec<Tensor>> {
        Ok(vec![inputs[0].transpose_perm(&self.perm)?])
    }
    fn backward(&self, grad_outputs: &[Tensor]) -> CoreResult<Vec<Option<Tensor>>> {
        let mut inverse = vec![0usize; self.perm.len()];
        for (i, &p) in self.perm.iter().enumerate() {
            inverse[p] = i;
        }
        Ok(vec![Some(grad_outputs[0].transpose_perm(&inverse)?)])
    }
    fn name(&self) -> &'static str {
        "TransposePerm"
    }
}

pub fn transpose_perm(a: &Variable, perm: &[usize], training: bool) -> CoreResult<Variable> {
    apply1(Box::new(TransposePerm { perm: perm.to_vec() }), vec![a.clone()], training)
}

/// Rank-2 transpose, expressed as the general permutation `[1, 0]`.
pub fn transpose(a: &Variable, training: bool) -> CoreResult<Variable> {
    transpose_perm(a, &[1, 0], training)
}

struct BroadcastTo {
    target: Shape,
}
impl Op for BroadcastTo {
    fn forward(&mut self, inputs: &[Tensor]) -> CoreResult<Vec<Tensor>> {
        Ok(vec![inputs[0].broadcast_to(self.target.clone())?])
    }
    fn backward(&self, grad_outputs: &[Tensor]) -> CoreResult<Vec<Option<Tensor>>> {
        // the generic accumulation step in Variable::backward reduces this
        // back to the input's own shape via `sum_to`, so pass it through.
        Ok(vec![Some(grad_outputs[0].clone())])
    }
    fn name(&self) -> &'static str {
        "BroadcastTo"
    }
}

pub fn broadcast_to(a: &Variable, target: Shape, training: bool) -> CoreResult<Variable> {
    apply1(Box::new(BroadcastTo { target }), vec![a.clone()], training)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::Variable;

    #[test]
    fn reshape_backward_restores_original_shape() {
        let x = Variable::leaf(Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], Shape::new(vec![2, 2])).unwrap(), true);
        let y = reshape(&x, Shape::new(vec![4]), true).unwrap();
        let loss = crate::autograd::ops::reductions::sum(&y, true).unwrap();
        loss.backward().unwrap();
        assert_eq!(x.grad().unwrap().shape().dims(), &[2, 2]);
    }

    #[test]
    fn broadcast_to_backward_sums_back_down() {
        let x = Variable::leaf(Tensor::from_vec(vec![1.0, 2.0, 3.0], Shape::new(vec![1, 3])).unwrap(), true);
        let y = broadcast_to(&x, Shape::new(vec![4, 3]), true).unwrap();
        let loss = crate::autograd::ops::reductions::sum(&y, true).unwrap();
        loss.backward().unwrap();
        assert_eq!(x.grad().unwrap().data(), &[4.0, 4.0, 4.0]);
    }
}
