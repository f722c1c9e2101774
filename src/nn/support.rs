//! Shared helpers used across the layer catalog: broadcasting elementwise ops
//! (the core binary ops require identical shapes per spec 4.1; every layer
//! that adds a bias or a mask needs an explicit broadcast first), mask
//! construction, and a couple of small tensor-building conveniences.

use crate::autograd::ops::{elementwise, shape_ops};
use crate::autograd::Variable;
use crate::error::CoreResult;
use crate::shape::Shape;
use crate::tensor::Tensor;

/// `a + b`, broadcasting `b` up to `a`'s shape first (e.g. bias `[out]` against
/// activations `[batch, out]`).
pub fn add_broadcast(a: &Variable, b: &Variable, training: bool) -> CoreResult<Variable> {
    let b = if b.shape().same_as(a.shape()) { b.clone() } else { shape_ops::broadcast_to(b, a.shape().clone(), training)? };
    elementwise::add(a, &b, training)
}

/// `a * b`, broadcasting `b` up to `a`'s shape first.
pub fn mul_broadcast(a: &Variable, b: &Variable, training: bool) -> CoreResult<Variable> {
    let b = if b.shape().same_as(a.shape()) { b.clone() } else { shape_ops::broadcast_to(b, a.shape().clone(), training)? };
    elementwise::mul(a, &b, training)
}

/// A detached leaf wrapping a plain (non-differentiable) tensor, e.g. a mask
/// or a precomputed positional-encoding slice.
pub fn constant(t: Tensor) -> Variable {
    Variable::leaf(t, false)
}

/// Large negative value used to drive masked attention logits to ~0 after
/// softmax, without risking `inf - inf = NaN` the way literal `-inf` would if
/// a row were entirely masked.
pub const MASK_NEG: f32 = -1.0e9;

/// Turn a 0/1 mask tensor into an additive bias: `0` where the mask is `1`,
/// `MASK_NEG` where it is `0`. Added to attention scores before softmax.
pub fn additive_mask(mask: &Tensor) -> Tensor {
    mask.map(|v| if v > 0.5 { 0.0 } else { MASK_NEG })
}

/// Lower-triangular causal mask (`1` on and below the diagonal) of shape
/// `[seq_len, seq_len]`.
pub fn causal_mask(seq_len: usize) -> CoreResult<Tensor> {
    Tensor::tril(Shape::new(vec![seq_len, seq_len]), 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::Shape;

    #[test]
    fn add_broadcast_matches_manual_broadcast() {
        let a = Variable::leaf(Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], Shape::new(vec![2, 2])).unwrap(), false);
        let b = Variable::leaf(Tensor::from_vec(vec![10.0, 20.0], Shape::new(vec![2])).unwrap(), false);
        let out = add_broadcast(&a, &b, false).unwrap();
        assert_eq!(out.value().data(), &[11.0, 22.0, 13.0, 24.0]);
    }

    #[test]
    fn additive_mask_zeroes_allowed_positions() {
        let mask = Tensor::tril(Shape::new(vec![3, 3]), 0).unwrap();
        let bias = additive_mask(&mask);
        // row 0: only column 0 allowed.
        assert_eq!(bias.data()[0], 0.0);
        assert_eq!(bias.data()[1], MASK_NEG);
    }
}
