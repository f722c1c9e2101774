//! Inverted dropout: samples a Bernoulli keep-mask per call in training mode
//! and rescales survivors by `1/(1-p)`; identity in eval mode.

use crate::autograd::ops::elementwise;
use crate::autograd::Variable;
use crate::error::{CoreError, CoreResult};
use crate::module::{Module, ModuleCore};
use crate::nn::support::constant;
use crate::runtime::with_rng;
use crate::tensor::Tensor;
use rand::Rng;

pub struct Dropout {
    core: ModuleCore,
    /// Drop probability; keep ratio is `1 - p`.
    p: f32,
}

impl Dropout {
    pub fn new(name: impl Into<String>, p: f32) -> CoreResult<Self> {
        if !(0.0..1.0).contains(&p) {
            return Err(CoreError::Arithmetic(format!("Dropout: p must be in [0, 1), got {}", p)));
        }
        Ok(Dropout { core: ModuleCore::new(name), p })
    }

    pub fn forward(&self, x: &Variable) -> CoreResult<Variable> {
        if !self.core.is_training() || self.p == 0.0 {
            return Ok(x.clone());
        }
        let keep = 1.0 - self.p;
        let scale = 1.0 / keep;
        let mask_data: Vec<f32> = with_rng(|rng| {
            (0..x.value().numel()).map(|_| if rng.gen::<f32>() < keep { scale } else { 0.0 }).collect()
        });
        let mask = Tensor::from_vec(mask_data, x.shape().clone())?;
        elementwise::mul(x, &constant(mask), self.core.is_training())
    }
}

impl Module for Dropout {
    fn module(&self) -> &ModuleCore {
        &self.core
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::Shape;

    #[test]
    fn eval_mode_is_identity() {
        let layer = Dropout::new("drop", 0.5).unwrap();
        layer.eval();
        let x = Variable::leaf(Tensor::from_vec(vec![1.0, 2.0, 3.0], Shape::new(vec![3])).unwrap(), false);
        let y = layer.forward(&x).unwrap();
        assert_eq!(y.value().data(), x.value().data());
    }

    #[test]
    fn training_mode_scales_surviving_elements() {
        crate::runtime::set_seed(1);
        let layer = Dropout::new("drop", 0.5).unwrap();
        layer.train();
        let x = Variable::leaf(Tensor::ones(Shape::new(vec![1000])), false);
        let y = layer.forward(&x).unwrap();
        for &v in y.value().data() {
            assert!(v == 0.0 || (v - 2.0).abs() < 1e-6);
        }
    }

    #[test]
    fn zero_p_rejects_out_of_range() {
        assert!(Dropout::new("drop", 1.0).is_err());
        assert!(Dropout::new("drop", -0.1).is_err());
    }
}
