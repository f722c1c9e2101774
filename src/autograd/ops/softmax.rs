//! Softmax along an axis. Saves its own output (not the input) since the
//! Jacobian-vector product is most naturally expressed in terms of `y`.

use crate::autograd::{apply1, Op, Variable};
use crate::error::CoreResult;
use crate::shape::Shape;
use crate::tensor::Tensor;

struct Softmax {
    axis: Option<isize>,
    output: Option<Tensor>,
    shape: Option<Shape>,
}
impl Op for Softmax {
    fn forward(&mut self, inputs: &[Tensor]) -> CoreResult<Vec<Tensor>> {
        let out = inputs[0].softmax(self.axis)?;
        self.output = Some(out.clone());
        self.shape = Some(inputs[0].shape().clone());
        Ok(vec![out])
    }
    fn backward(&self, grad_outputs: &[Tensor]) -> CoreResult<Vec<Option<Tensor>>> {
        let y = self.output.as_ref().unwrap();
        let shape = self.shape.as_ref().unwrap();
        let axis = self.axis.unwrap_or(if shape.rank() <= 1 { 0 } else { -1 });
        let ax = shape.resolve_axis(axis)?;
        let dy = &grad_outputs[0];
        let prod = dy.mul(y)?;
        let s = prod.sum_axis(ax as isize)?;
        let keepdim = shape.with_axis_one(ax);
        let s_b = s.reshape(keepdim)?.broadcast_to(shape.clone())?;
        let grad = y.mul(&dy.sub(&s_b)?)?;
        Ok(vec![Some(grad)])
    }
    fn name(&self) -> &'static str {
        "Softmax"
    }
}

pub fn softmax(a: &Variable, axis: Option<isize>, training: bool) -> CoreResult<Variable> {
    apply1(Box::new(Softmax { axis, output: None, shape: None }), vec![a.clone()], training)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::Variable;

    #[test]
    fn softmax_backward_sums_to_zero_per_row() {
        let x = Variable::leaf(Tensor::from_vec(vec![1.0, 2.0, 3.0], Shape::new(vec![1, 3])).unwrap(), true);
        let y = softmax(&x, None, true).unwrap();
        let loss = crate::autograd::ops::reductions::sum(&y, true).unwrap();
        loss.backward().unwrap();
        // softmax output always sums to 1 regardless of x, so d(sum)/dx == 0 everywhere.
        for g in x.grad().unwrap().data() {
            assert!(g.abs() < 1e-5);
        }
    }
}
