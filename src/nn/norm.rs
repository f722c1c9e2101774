//! LayerNorm and BatchNorm1d: the two normalization layers in the catalog.
//! Both normalize then apply a learnable affine (`gamma`, `beta`); BatchNorm
//! additionally tracks running statistics across calls via three buffers.

use crate::autograd::ops::{elementwise, reductions, shape_ops};
use crate::autograd::Variable;
use crate::error::{CoreError, CoreResult};
use crate::module::{Buffer, Module, ModuleCore, Parameter};
use crate::nn::support::constant;
use crate::shape::Shape;
use crate::tensor::Tensor;

/// Normalizes over the trailing `normalized_shape` dims of the input.
pub struct LayerNorm {
    core: ModuleCore,
    pub gamma: Parameter,
    pub beta: Parameter,
    normalized_shape: Shape,
    eps: f32,
}

impl LayerNorm {
    pub fn new(name: impl Into<String>, normalized_shape: Shape, eps: f32) -> Self {
        let core = ModuleCore::new(name);
        let gamma = Parameter::new(Tensor::ones(normalized_shape.clone()));
        let beta = Parameter::new(Tensor::zeros(normalized_shape.clone()));
        core.register_parameter("gamma", gamma.clone()).expect("fresh module: no collision");
        core.register_parameter("beta", beta.clone()).expect("fresh module: no collision");
        LayerNorm { core, gamma, beta, normalized_shape, eps }
    }

    fn split_outer_inner(&self, shape: &Shape) -> CoreResult<(usize, usize)> {
        let rank = shape.rank();
        let norm_rank = self.normalized_shape.rank();
        if norm_rank > rank || &shape.dims()[rank - norm_rank..] != self.normalized_shape.dims() {
            return Err(CoreError::ShapeMismatch(format!(
                "{}: input shape {} does not end with normalized_shape {}",
                self.core.name(),
                shape,
                self.normalized_shape
            )));
        }
        let inner = self.normalized_shape.size();
        let outer = shape.size() / inner.max(1);
        Ok((outer, inner))
    }

    pub fn forward(&self, x: &Variable) -> CoreResult<Variable> {
        let training = self.core.is_training();
        let original_shape = x.shape();
        let (outer, inner) = self.split_outer_inner(&original_shape)?;
        let flat = shape_ops::reshape(x, Shape::new(vec![outer, inner]), training)?;

        let mean = reductions::mean_axis(&flat, 1, training)?;
        let mean_keepdim = shape_ops::reshape(&mean, Shape::new(vec![outer, 1]), training)?;
        let mean_b = shape_ops::broadcast_to(&mean_keepdim, Shape::new(vec![outer, inner]), training)?;
        let centered = elementwise::sub(&flat, &mean_b, training)?;

        let sq = elementwise::square(&centered, training)?;
        let var = reductions::mean_axis(&sq, 1, training)?;
        let var_keepdim = shape_ops::reshape(&var, Shape::new(vec![outer, 1]), training)?;
        let var_b = shape_ops::broadcast_to(&var_keepdim, Shape::new(vec![outer, inner]), training)?;
        let denom = elementwise::sqrt(&elementwise::add_scalar(&var_b, self.eps, training)?, training)?;
        let normalized = elementwise::div(&centered, &denom, training)?;

        let reshaped = shape_ops::reshape(&normalized, original_shape.clone(), training)?;
        let gamma_b = shape_ops::broadcast_to(self.gamma.variable(), original_shape.clone(), training)?;
        let beta_b = shape_ops::broadcast_to(self.beta.variable(), original_shape.clone(), training)?;
        let scaled = elementwise::mul(&reshaped, &gamma_b, training)?;
        elementwise::add(&scaled, &beta_b, training)
    }
}

impl Module for LayerNorm {
    fn module(&self) -> &ModuleCore {
        &self.core
    }
}

/// Input `[batch, features]`. Buffers: `running_mean`, `running_var`,
/// `num_batches_tracked` (stored as a single-element tensor).
pub struct BatchNorm1d {
    core: ModuleCore,
    pub gamma: Option<Parameter>,
    pub beta: Option<Parameter>,
    running_mean: Buffer,
    running_var: Buffer,
    num_batches_tracked: Buffer,
    num_features: usize,
    eps: f32,
    momentum: f32,
    affine: bool,
    track_running_stats: bool,
}

impl BatchNorm1d {
    pub fn new(name: impl Into<String>, num_features: usize, eps: f32, momentum: f32, affine: bool, track_running_stats: bool) -> Self {
        let core = ModuleCore::new(name);
        let (gamma, beta) = if affine {
            let g = Parameter::new(Tensor::ones(Shape::new(vec![num_features])));
            let b = Parameter::new(Tensor::zeros(Shape::new(vec![num_features])));
            core.register_parameter("gamma", g.clone()).expect("fresh module: no collision");
            core.register_parameter("beta", b.clone()).expect("fresh module: no collision");
            (Some(g), Some(b))
        } else {
            (None, None)
        };
        let running_mean = Buffer::new(Tensor::zeros(Shape::new(vec![num_features])));
        let running_var = Buffer::new(Tensor::ones(Shape::new(vec![num_features])));
        let num_batches_tracked = Buffer::new(Tensor::zeros(Shape::new(vec![1])));
        core.register_buffer("running_mean", running_mean.clone()).expect("fresh module: no collision");
        core.register_buffer("running_var", running_var.clone()).expect("fresh module: no collision");
        core.register_buffer("num_batches_tracked", num_batches_tracked.clone()).expect("fresh module: no collision");

        BatchNorm1d {
            core,
            gamma,
            beta,
            running_mean,
            running_var,
            num_batches_tracked,
            num_features,
            eps,
            momentum,
            affine,
            track_running_stats,
        }
    }

    pub fn reset_running_stats(&self) {
        self.running_mean.set(Tensor::zeros(Shape::new(vec![self.num_features])));
        self.running_var.set(Tensor::ones(Shape::new(vec![self.num_features])));
        self.num_batches_tracked.set(Tensor::zeros(Shape::new(vec![1])));
    }

    pub fn forward(&self, x: &Variable) -> CoreResult<Variable> {
        let dims = x.shape().dims().to_vec();
        if dims.len() != 2 || dims[1] != self.num_features {
            return Err(CoreError::ShapeMismatch(format!(
                "{}: expected [batch, {}], got {}",
                self.core.name(),
                self.num_features,
                x.shape()
            )));
        }
        let batch = dims[0];
        let training = self.core.is_training();
        let full_shape = Shape::new(vec![batch, self.num_features]);

        let (mean_b, var_b, update_stats) = if training && self.track_running_stats {
            let mean = reductions::mean_axis(x, 0, training)?;
            let mean_bcast = shape_ops::broadcast_to(&mean, full_shape.clone(), training)?;
            let centered = elementwise::sub(x, &mean_bcast, training)?;
            let var = reductions::mean_axis(&elementwise::square(&centered, training)?, 0, training)?;
            let var_bcast = shape_ops::broadcast_to(&var, full_shape.clone(), training)?;
            (mean_bcast, var_bcast, Some((mean.value(), var.value())))
        } else if training {
            // training but not tracking stats: normalize with the live batch, no buffer update.
            let mean = reductions::mean_axis(x, 0, training)?;
            let mean_bcast = shape_ops::broadcast_to(&mean, full_shape.clone(), training)?;
            let centered = elementwise::sub(x, &mean_bcast, training)?;
            let var = reductions::mean_axis(&elementwise::square(&centered, training)?, 0, training)?;
            let var_bcast = shape_ops::broadcast_to(&var, full_shape.clone(), training)?;
            (mean_bcast, var_bcast, None)
        } else {
            let mean_bcast = shape_ops::broadcast_to(&constant(self.running_mean.get()), full_shape.clone(), false)?;
            let var_bcast = shape_ops::broadcast_to(&constant(self.running_var.get()), full_shape.clone(), false)?;
            (mean_bcast, var_bcast, None)
        };

        let centered = elementwise::sub(x, &mean_b, training)?;
        let denom = elementwise::sqrt(&elementwise::add_scalar(&var_b, self.eps, training)?, training)?;
        let normalized = elementwise::div(&centered, &denom, training)?;

        let out = if self.affine {
            let gamma_b = shape_ops::broadcast_to(self.gamma.as_ref().unwrap().variable(), full_shape.clone(), training)?;
            let beta_b = shape_ops::broadcast_to(self.beta.as_ref().unwrap().variable(), full_shape.clone(), training)?;
            elementwise::add(&elementwise::mul(&normalized, &gamma_b, training)?, &beta_b, training)?
        } else {
            normalized
        };

        if let Some((batch_mean, batch_var)) = update_stats {
            let m = self.momentum;
            let new_mean = self.running_mean.get().mul_scalar(1.0 - m).add(&batch_mean.mul_scalar(m))?;
            let new_var = self.running_var.get().mul_scalar(1.0 - m).add(&batch_var.mul_scalar(m))?;
            self.running_mean.set(new_mean);
            self.running_var.set(new_var);
            let mut count = self.num_batches_tracked.get();
            count.data_mut()[0] += 1.0;
            self.num_batches_tracked.set(count);
        }

        Ok(out)
    }
}

impl Module for BatchNorm1d {
    fn module(&self) -> &ModuleCore {
        &self.core
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layernorm_normalizes_last_axis() {
        let ln = LayerNorm::new("ln", Shape::new(vec![4]), 1e-5);
        let x = Variable::leaf(Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], Shape::new(vec![1, 4])).unwrap(), false);
        let y = ln.forward(&x).unwrap();
        let mean: f32 = y.value().data().iter().sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-4);
    }

    #[test]
    fn batchnorm_training_pass_matches_spec_example() {
        let bn = BatchNorm1d::new("bn", 2, 1e-5, 0.1, true, true);
        let x = Variable::leaf(
            Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], Shape::new(vec![3, 2])).unwrap(),
            false,
        );
        let y = bn.forward(&x).unwrap();
        for col in 0..2 {
            let vals: Vec<f32> = (0..3).map(|r| y.value().data()[r * 2 + col]).collect();
            let mean: f32 = vals.iter().sum::<f32>() / 3.0;
            assert!(mean.abs() < 1e-4, "col {} mean {}", col, mean);
        }
        let rm = bn.running_mean.get();
        assert!((rm.data()[0] - 0.3).abs() < 1e-5);
        assert!((rm.data()[1] - 0.4).abs() < 1e-5);
    }

    #[test]
    fn batchnorm_eval_does_not_mutate_running_stats() {
        let bn = BatchNorm1d::new("bn", 2, 1e-5, 0.1, true, true);
        bn.eval();
        let before = bn.running_mean.get();
        let x = Variable::leaf(Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], Shape::new(vec![2, 2])).unwrap(), false);
        bn.forward(&x).unwrap();
        let after = bn.running_mean.get();
        assert_eq!(before.data(), after.data());
    }

    #[test]
    fn batchnorm_batch_size_one_is_finite() {
        let bn = BatchNorm1d::new("bn", 2, 1e-5, 0.1, true, true);
        let x = Variable::leaf(Tensor::from_vec(vec![1.0, 2.0], Shape::new(vec![1, 2])).unwrap(), false);
        let y = bn.forward(&x).unwrap();
        for v in y.value().data() {
            assert!(v.is_finite());
        }
    }
}
