//! Elementwise binary and unary ops: add/sub/mul/div and the unary math family.
//! Each saves exactly what its backward needs (usually one or both inputs).

use crate::autograd::{apply1, Op, Variable};
use crate::error::CoreResult;
use crate::tensor::Tensor;

struct Add;
impl Op for Add {
    fn forward(&mut self, inputs: &[Tensor]) -> CoreResult<Vec<Tensor>> {
        Ok(vec![inputs[0].add(&inputs[1])?])
    }
    fn backward(&self, grad_outputs: &[Tensor]) -> CoreResult<Vec<Option<Tensor>>> {
        Ok(vec![Some(grad_outputs[0].clone()), Some(grad_outputs[0].clone())])
    }
    fn name(&self) -> &'static str {
        "Add"
    }
}

pub fn add(a: &Variable, b: &Variable, training: bool) -> CoreResult<Variable> {
    apply1(Box::new(Add), vec![a.clone(), b.clone()], training)
}

struct Sub;
impl Op for Sub {
    fn forward(&mut self, inputs: &[Tensor]) -> CoreResult<Vec<Tensor>> {
        Ok(vec![inputs[0].sub(&inputs[1])?])
    }
    fn backward(&self, grad_outputs: &[Tensor]) -> CoreResult<Vec<Option<Tensor>>> {
        Ok(vec![Some(grad_outputs[0].clone()), Some(grad_outputs[0].neg())])
    }
    fn name(&self) -> &'static str {
        "Sub"
    }
}

pub fn sub(a: &Variable, b: &Variable, training: bool) -> CoreResult<Variable> {
    apply1(Box::new(Sub), vec![a.clone(), b.clone()], training)
}

struct Mul {
    a: Option<Tensor>,
    b: Option<Tensor>,
}
impl Op for Mul {
    fn forward(&mut self, inputs: &[Tensor]) -> CoreResult<Vec<Tensor>> {
        self.a = Some(inputs[0].clone());
        self.b = Some(inputs[1].clone());
        Ok(vec![inputs[0].mul(&inputs[1])?])
    }
    fn backward(&self, grad_outputs: &[Tensor]) -> CoreResult<Vec<Option<Tensor>>> {
        let a = self.a.as_ref().unwrap();
        let b = self.b.as_ref().unwrap();
        Ok(vec![
            Some(grad_outputs[0].mul(b)?),
            Some(grad_outputs[0].mul(a)?),
        ])
    }
    fn name(&self) -> &'static str {
        "Mul"
    }
}

pub fn mul(a: &Variable, b: &Variable, training: bool) -> CoreResult<Variable> {
    apply1(Box::new(Mul { a: None, b: None }), vec![a.clone(), b.clone()], training)
}

struct Div {
    a: Option<Tensor>,
    b: Option<Tensor>,
}
impl Op for Div {
    fn forward(&mut self, inputs: &[Tensor]) -> CoreResult<Vec<Tensor>> {
        self.a = Some(inputs[0].clone());
        self.b = Some(inputs[1].clone());
        Ok(vec![inputs[0].div(&inputs[1])?])
    }
    fn backward(&self, grad_outputs: &[Tensor]) -> CoreResult<Vec<Option<Tensor>>> {
        let a = self.a.as_ref().unwrap();
        let b = self.b.as_ref().unwrap();
        // d/da = 1/b ; d/db = -a/b^2
        let grad_a = grad_outputs[0].div(b)?;
        let b_sq = b.square();
        let grad_b = grad_outputs[0].mul(a)?.neg().div(&b_sq)?;
        Ok(vec![Some(grad_a), Some(grad_b)])
    }
    fn name(&self) -> &'static str {
        "Div"
    }
}

pub fn div(a: &Variable, b: &Variable, training: bool) -> CoreResult<Variable> {
    apply1(Box::new(Div { a: None, b: None }), vec![a.clone(), b.clone()], training)
}

macro_rules! unary_op {
    ($op_name:ident, $fn_name:ident, $forward:expr, $backward:expr) => {
        struct $op_name {
            saved: Option<Tensor>,
        }
        impl Op for $op_name {
            fn forward(&mut self, inputs: &[Tensor]) -> CoreResult<Vec<Tensor>> {
                let out = $forward(&inputs[0])?;
                self.saved = Some(out.clone());
                Ok(vec![out])
            }
            fn backward(&self, grad_outputs: &[Tensor]) -> CoreResult<Vec<Option<Tensor>>> {
                let out = self.saved.as_ref().unwrap();
                Ok(vec![Some($backward(&grad_outputs[0], out)?)])
            }
            fn name(&self) -> &'static str {
                stringify!($op_name)
            }
        }
        pub fn $fn_name(a: &Variable, training: bool) -> CoreResult<Variable> {
            apply1(Box::new($op_name { saved: None }), vec![a.clone()], training)
        }
    };
}

// `out` passed to backward is the *forward output* (saved), which is what each
// closure below needs: sqrt/exp/tanh/sigmoid all differentiate cleanly from y.
unary_op!(Sqrt, sqrt, |t: &Tensor| t.sqrt(), |g: &Tensor, y: &Tensor| {
    // d/dx sqrt(x) = 1/(2*sqrt(x)) = 1/(2y)
    let two_y = y.mul_scalar(2.0);
    g.div(&two_y)
});
unary_op!(Exp, exp, |t: &Tensor| Ok::<Tensor, crate::error::CoreError>(t.exp()), |g: &Tensor, y: &Tensor| {
    g.mul(y)
});
unary_op!(Tanh, tanh, |t: &Tensor| Ok::<Tensor, crate::error::CoreError>(t.tanh()), |g: &Tensor, y: &Tensor| {
    // d/dx tanh(x) = 1 - y^2
    let one_minus_y2 = y.square().neg().add_scalar(1.0);
    g.mul(&one_minus_y2)
});
unary_op!(Sigmoid, sigmoid, |t: &Tensor| Ok::<Tensor, crate::error::CoreError>(t.sigmoid()), |g: &Tensor, y: &Tensor| {
    // d/dx sigmoid(x) = y*(1-y)
    let one_minus_y = y.neg().add_scalar(1.0);
    g.mul(&y.mul(&one_minus_y)?)
});

macro_rules! unary_op_from_input {
    ($op_name:ident, $fn_name:ident, $forward:expr, $backward:expr) => {
        struct $op_name {
            input: Option<Tensor>,
        }
        impl Op for $op_name {
            fn forward(&mut self, inputs: &[Tensor]) -> CoreResult<Vec<Tensor>> {
                self.input = Some(inputs[0].clone());
                Ok(vec![$forward(&inputs[0])?])
            }
            fn backward(&self, grad_outputs: &[Tensor]) -> CoreResult<Vec<Option<Tensor>>> {
                let x = self.input.as_ref().unwrap();
                Ok(vec![Some($backward(&grad_outputs[0], x)?)])
            }
            fn name(&self) -> &'static str {
                stringify!($op_name)
            }
        }
        pub fn $fn_name(a: &Variable, training: bool) -> CoreResult<Variable> {
            apply1(Box::new($op_name { input: None }), vec![a.clone()], training)
        }
    };
}

unary_op_from_input!(Neg, neg, |t: &Tensor| Ok::<Tensor, crate::error::CoreError>(t.neg()), |g: &Tensor, _x: &Tensor| {
    Ok::<Tensor, crate::error::CoreError>(g.neg())
});
unary_op_from_input!(Square, square, |t: &Tensor| Ok::<Tensor, crate::error::CoreError>(t.square()), |g: &Tensor, x: &Tensor| {
    // d/dx x^2 = 2x
    g.mul(&x.mul_scalar(2.0))
});
unary_op_from_input!(Log, log, |t: &Tensor| t.log(), |g: &Tensor, x: &Tensor| { g.div(x) });
unary_op_from_input!(Sin, sin, |t: &Tensor| Ok::<Tensor, crate::error::CoreError>(t.sin()), |g: &Tensor, x: &Tensor| {
    g.mul(&x.cos())
});
unary_op_from_input!(Cos, cos, |t: &Tensor| Ok::<Tensor, crate::error::CoreError>(t.cos()), |g: &Tensor, x: &Tensor| {
    g.mul(&x.sin().neg())
});
unary_op_from_input!(Reciprocal, reciprocal, |t: &Tensor| t.reciprocal(), |g: &Tensor, x: &Tensor| {
    // d/dx (1/x) = -1/x^2
    let x_sq = x.square();
    g.neg().div(&x_sq)
});
unary_op_from_input!(Relu, relu, |t: &Tensor| Ok::<Tensor, crate::error::CoreError>(t.relu()), |g: &Tensor, x: &Tensor| {
    let zero = Tensor::zeros(x.shape().clone());
    let mask = x.gt(&zero)?;
    g.mul(&mask)
});

struct Clip {
    input: Option<Tensor>,
    min: f32,
    max: f32,
}
impl Op for Clip {
    fn forward(&mut self, inputs: &[Tensor]) -> CoreResult<Vec<Tensor>> {
        self.input = Some(inputs[0].clone());
        Ok(vec![inputs[0].clip(self.min, self.max)])
    }
    fn backward(&self, grad_outputs: &[Tensor]) -> CoreResult<Vec<Option<Tensor>>> {
        let x = self.input.as_ref().unwrap();
        // gradient passes through only where the input was inside [min, max].
        let data: Vec<f32> = x
            .data()
            .iter()
            .zip(grad_outputs[0].data().iter())
            .map(|(&v, &g)| if v >= self.min && v <= self.max { g } else { 0.0 })
            .collect();
        let grad = Tensor::from_vec(data, x.shape().clone())?;
        Ok(vec![Some(grad)])
    }
    fn name(&self) -> &'static str {
        "Clip"
    }
}

pub fn clip(a: &Variable, min: f32, max: f32, training: bool) -> CoreResult<Variable> {
    apply1(Box::new(Clip { input: None, min, max }), vec![a.clone()], training)
}

struct MulScalar {
    scalar: f32,
}
impl Op for MulScalar {
    fn forward(&mut self, inputs: &[Tensor]) -> CoreResult<Vec<Tensor>> {
        Ok(vec![inputs[0].mul_scalar(self.scalar)])
    }
    fn backward(&self, grad_outputs: &[Tensor]) -> CoreResult<Vec<Option<Tensor>>> {
        Ok(vec![Some(grad_outputs[0].mul_scalar(self.scalar))])
    }
    fn name(&self) -> &'static str {
        "MulScalar"
    }
}

pub fn mul_scalar(a: &Variable, scalar: f32, training: bool) -> CoreResult<Variable> {
    apply1(Box::new(MulScalar { scalar }), vec![a.clone()], training)
}

struct AddScalar {
    scalar: f32,
}
impl Op for AddScalar {
    fn forward(&mut self, inputs: &[Tensor]) -> CoreResult<Vec<Tensor>> {
        Ok(vec![inputs[0].add_scalar(self.scalar)])
    }
    fn backward(&self, grad_outputs: &[Tensor]) -> CoreResult<Vec<Option<Tensor>>> {
        Ok(vec![Some(grad_outputs[0].clone())])
    }
    fn name(&self) -> &'static str {
        "AddScalar"
    }
}

pub fn add_scalar(a: &Variable, scalar: f32, training: bool) -> CoreResult<Variable> {
    apply1(Box::new(AddScalar { scalar }), vec![a.clone()], training)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::Shape;

    #[test]
    fn mul_backward_cross_multiplies() {
        let a = Variable::leaf(Tensor::from_vec(vec![2.0], Shape::new(vec![1])).unwrap(), true);
        let b = Variable::leaf(Tensor::from_vec(vec![5.0], Shape::new(vec![1])).unwrap(), true);
        let y = mul(&a, &b, true).unwrap();
        y.backward().unwrap();
        assert!((a.grad().unwrap().data()[0] - 5.0).abs() < 1e-6);
        assert!((b.grad().unwrap().data()[0] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn relu_blocks_gradient_for_negative_input() {
        let x = Variable::leaf(Tensor::from_vec(vec![-1.0, 2.0], Shape::new(vec![2])).unwrap(), true);
        let y = relu(&x, true).unwrap();
        let loss = crate::autograd::ops::reductions::sum(&y, true).unwrap();
        loss.backward().unwrap();
        assert_eq!(x.grad().unwrap().data(), &[0.0, 1.0]);
    }
}
