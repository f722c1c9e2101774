//! Matrix multiply, including the batch-broadcasting form. Both operands are
//! saved for backward; gradients are computed at the broadcast shape and the
//! generic accumulation step in `Variable::backward` reduces them via `sum_to`.

use crate::autograd::{apply1, Op, Variable};
use crate::error::CoreResult;
use crate::tensor::Tensor;

fn transpose_last_two(t: &Tensor) -> CoreResult<Tensor> {
    let rank = t.shape().rank();
    let mut perm: Vec<usize> = (0..rank).collect();
    perm.swap(rank - 2, rank - 1);
    t.transpose_perm(&perm)
}

struct MatMul {
    a: Option<Tensor>,
    b: Option<Tensor>,
}
impl Op for MatMul {
    fn forward(&mut self, inputs: &[Tensor]) -> CoreResult<Vec<Tensor>> {
        self.a = Some(inputs[0].clone());
        self.b = Some(inputs[1].clone());
        Ok(vec![inputs[0].matmul(&inputs[1])?])
    }
    fn backward(&self, grad_outputs: &[Tensor]) -> CoreResult<Vec<Option<Tensor>>> {
        let a = self.a.as_ref().unwrap();
        let b = self.b.as_ref().unwrap();
        let grad_out = &grad_outputs[0];
        let b_t = transpose_last_two(b)?;
        let a_t = transpose_last_two(a)?;
        let grad_a = grad_out.matmul(&b_t)?;
        let grad_b = a_t.matmul(grad_out)?;
        Ok(vec![Some(grad_a), Some(grad_b)])
    }
    fn name(&self) -> &'static str {
        "MatMul"
    }
}

pub fn matmul(a: &Variable, b: &Variable, training: bool) -> CoreResult<Variable> {
    apply1(Box::new(MatMul { a: None, b: None }), vec![a.clone(), b.clone()], training)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::Shape;

    #[test]
    fn matmul_backward_matches_linear_reference() {
        // y = x @ w ; dL/dw with dL/dy = ones should equal x^T broadcast-summed.
        let x = Variable::leaf(Tensor::from_vec(vec![1.0, 1.0], Shape::new(vec![1, 2])).unwrap(), true);
        let w = Variable::leaf(Tensor::from_vec(vec![1.0, 3.0, 2.0, 4.0], Shape::new(vec![2, 2])).unwrap(), true);
        let y = matmul(&x, &w, true).unwrap();
        let loss = crate::autograd::ops::reductions::sum(&y, true).unwrap();
        loss.backward().unwrap();
        assert_eq!(w.grad().unwrap().data(), &[1.0, 1.0, 1.0, 1.0]);
        assert_eq!(x.grad().unwrap().data(), &[4.0, 6.0]);
    }
}
