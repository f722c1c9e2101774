//! Numerical gradient check: central-difference vs autograd, used by layer
//! catalog tests to verify a `backward` implementation against the spec's
//! tolerance (see the Autograd numerical check property).

use crate::autograd::Variable;
use crate::error::CoreResult;
use crate::tensor::Tensor;

/// Epsilon for central difference: `(f(x+eps) - f(x-eps)) / (2*eps)`.
pub const DEFAULT_EPS: f32 = 1e-5;

/// Numerical gradient of a scalar function of `x` via central difference.
/// `f` must return the same value for the same tensor (pure).
pub fn numerical_grad(x: &Tensor, f: impl Fn(&Tensor) -> CoreResult<f32>, eps: f32) -> CoreResult<Vec<f32>> {
    let n = x.numel();
    let mut grad = vec![0.0f32; n];
    for i in 0..n {
        let mut plus = x.data().to_vec();
        let mut minus = x.data().to_vec();
        plus[i] += eps;
        minus[i] -= eps;
        let t_plus = Tensor::from_vec(plus, x.shape().clone())?;
        let t_minus = Tensor::from_vec(minus, x.shape().clone())?;
        grad[i] = (f(&t_plus)? - f(&t_minus)?) / (2.0 * eps);
    }
    Ok(grad)
}

/// Build a one-input scalar graph from `x`, run `backward`, and compare the
/// resulting `x.grad()` against the central-difference numerical gradient.
/// `build_loss` receives a fresh leaf `Variable` each call and must return a
/// scalar (rank-0 or single-element) `Variable`.
pub fn check_gradients(
    build_loss: impl Fn(&Variable) -> CoreResult<Variable>,
    x: &Tensor,
    eps: f32,
    rtol: f32,
    atol: f32,
) -> Result<(), String> {
    let leaf = Variable::leaf(x.clone(), true);
    let loss = build_loss(&leaf).map_err(|e| e.to_string())?;
    loss.backward().map_err(|e| e.to_string())?;
    let analytical = leaf.grad().ok_or("no gradient accumulated on input")?;

    let numerical = numerical_grad(
        x,
        |perturbed| {
            let leaf = Variable::leaf(perturbed.clone(), false);
            let loss = build_loss(&leaf)?;
            Ok(loss.value().data()[0])
        },
        eps,
    )
    .map_err(|e| e.to_string())?;

    for (i, (&a, &n)) in analytical.data().iter().zip(numerical.iter()).enumerate() {
        let diff = (a - n).abs();
        if diff > atol && diff > rtol * n.abs().max(1e-8) {
            return Err(format!("element {}: analytical {} vs numerical {} (diff {})", i, a, n, diff));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::ops::{elementwise, reductions};
    use crate::shape::Shape;

    #[test]
    fn square_sum_matches_numerical_gradient() {
        let x = Tensor::from_vec(vec![1.0, -2.0, 3.0], Shape::new(vec![3])).unwrap();
        check_gradients(
            |v| {
                let sq = elementwise::square(v, true)?;
                reductions::sum(&sq, true)
            },
            &x,
            DEFAULT_EPS,
            1e-2,
            1e-3,
        )
        .unwrap();
    }

    #[test]
    fn tanh_sum_matches_numerical_gradient() {
        let x = Tensor::from_vec(vec![0.3, -0.7, 1.1], Shape::new(vec![3])).unwrap();
        check_gradients(
            |v| {
                let t = elementwise::tanh(v, true)?;
                reductions::sum(&t, true)
            },
            &x,
            DEFAULT_EPS,
            1e-2,
            1e-3,
        )
        .unwrap();
    }
}
