//! Reductions: global sum, and per-axis sum/mean/max. `argmax`/`min_axis` are
//! exposed only on `Tensor` (used for eval-time reporting, not training).

use crate::autograd::{apply1, Op, Variable};
use crate::error::CoreResult;
use crate::shape::Shape;
use crate::tensor::Tensor;

struct Sum {
    input_shape: Option<Shape>,
}
impl Op for Sum {
    fn forward(&mut self, inputs: &[Tensor]) -> CoreResult<Vec<Tensor>> {
        self.input_shape = Some(inputs[0].shape().clone());
        Ok(vec![inputs[0].sum()])
    }
    fn backward(&self, grad_outputs: &[Tensor]) -> CoreResult<Vec<Option<Tensor>>> {
        let shape = self.input_shape.as_ref().unwrap().clone();
        Ok(vec![Some(grad_outputs[0].broadcast_to(shape)?)])
    }
    fn name(&self) -> &'static str {
        "Sum"
    }
}

pub fn sum(a: &Variable, training: bool) -> CoreResult<Variable> {
    apply1(Box::new(Sum { input_shape: None }), vec![a.clone()], training)
}

struct SumAxis {
    input_shape: Option<Shape>,
    axis: isize,
}
impl Op for SumAxis {
    fn forward(&mut self, inputs: &[Tensor]) -> CoreResult<Vec<Tensor>> {
        self.input_shape = Some(inputs[0].shape().clone());
        Ok(vec![inputs[0].sum_axis(self.axis)?])
    }
    fn backward(&self, grad_outputs: &[Tensor]) -> CoreResult<Vec<Option<Tensor>>> {
        let shape = self.input_shape.as_ref().unwrap();
        let ax = shape.resolve_axis(self.axis)?;
        let keepdim_shape = shape.with_axis_one(ax);
        let reshaped = grad_outputs[0].reshape(keepdim_shape)?;
        Ok(vec![Some(reshaped.broadcast_to(shape.clone())?)])
    }
    fn name(&self) -> &'static str {
        "SumAxis"
    }
}

pub fn sum_axis(a: &Variable, axis: isize, training: bool) -> CoreResult<Variable> {
    apply1(Box::new(SumAxis { input_shape: None, axis }), vec![a.clone()], training)
}

struct MeanAxis {
    input_shape: Option<Shape>,
    axis: isize,
}
impl Op for MeanAxis {
    fn forward(&mut self, inputs: &[Tensor]) -> CoreResult<Vec<Tensor>> {
        self.input_shape = Some(inputs[0].shape().clone());
        Ok(vec![inputs[0].mean_axis(self.axis)?])
    }
    fn backward(&self, grad_outputs: &[Tensor]) -> CoreResult<Vec<Option<Tensor>>> {
        let shape = self.input_shape.as_ref().unwrap();
        let ax = shape.resolve_axis(self.axis)?;
        let n = shape.dims()[ax] as f32;
        let keepdim_shape = shape.with_axis_one(ax);
        let reshaped = grad_outputs[0].reshape(keepdim_shape)?.div_scalar(n)?;
        Ok(vec![Some(reshaped.broadcast_to(shape.clone())?)])
    }
    fn name(&self) -> &'static str {
        "MeanAxis"
    }
}

pub fn mean_axis(a: &Variable, axis: isize, training: bool) -> CoreResult<Variable> {
    apply1(Box::new(MeanAxis { input_shape: None, axis }), vec![a.clone()], training)
}

struct MaxAxis {
    input: Option<Tensor>,
    axis: isize,
}
impl Op for MaxAxis {
    fn forward(&mut self, inputs: &[Tensor]) -> CoreResult<Vec<Tensor>> {
        self.input = Some(inputs[0].clone());
        Ok(vec![inputs[0].max_axis(self.axis)?])
    }
    fn backward(&self, grad_outputs: &[Tensor]) -> CoreResult<Vec<Option<Tensor>>> {
        let input = self.input.as_ref().unwrap();
        let shape = input.shape().clone();
        let ax = shape.resolve_axis(self.axis)?;
        let max_vals = input.max_axis(self.axis)?;
        let max_b = max_vals.broadcast_to(shape.clone())?;
        let mask = input.eq(&max_b)?;
        let count = mask.sum_axis(self.axis as isize)?;
        let count_b = count.broadcast_to(shape.clone())?;
        let keepdim_shape = shape.with_axis_one(ax);
        let grad_reshaped = grad_outputs[0].reshape(keepdim_shape)?;
        let grad_b = grad_reshaped.broadcast_to(shape.clone())?;
        let grad_input = mask.mul(&grad_b)?.div(&count_b)?;
        Ok(vec![Some(grad_input)])
    }
    fn name(&self) -> &'static str {
        "MaxAxis"
    }
}

pub fn max_axis(a: &Variable, axis: isize, training: bool) -> CoreResult<Variable> {
    apply1(Box::new(MaxAxis { input: None, axis }), vec![a.clone()], training)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::Variable;

    #[test]
    fn sum_backward_broadcasts_ones() {
        let x = Variable::leaf(Tensor::from_vec(vec![1.0, 2.0, 3.0], Shape::new(vec![3])).unwrap(), true);
        let y = sum(&x, true).unwrap();
        y.backward().unwrap();
        assert_eq!(x.grad().unwrap().data(), &[1.0, 1.0, 1.0]);
    }

    #[test]
    fn mean_axis_backward_divides_by_axis_length() {
        let x = Variable::leaf(Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], Shape::new(vec![2, 2])).unwrap(), true);
        let y = mean_axis(&x, 1, true).unwrap();
        let loss = sum(&y, true).unwrap();
        loss.backward().unwrap();
        for g in x.grad().unwrap().data() {
            assert!((g - 0.5).abs() < 1e-6);
        }
    }
}
