//! Linear: `y = x @ weight^T + bias`. The workhorse layer that most of the
//! catalog (MLP heads, attention projections, MoE experts) is built from.

use crate::autograd::ops::{matmul, shape_ops};
use crate::autograd::Variable;
use crate::error::{CoreError, CoreResult};
use crate::init::{self, FanMode, Nonlinearity};
use crate::module::{LazyState, Module, ModuleCore, Parameter};
use crate::nn::support::add_broadcast;
use crate::shape::Shape;
use crate::tensor::Tensor;

/// `weight: [out_features, in_features]`, optional `bias: [out_features]`.
pub struct Linear {
    core: ModuleCore,
    pub weight: Parameter,
    pub bias: Option<Parameter>,
    in_features: usize,
    out_features: usize,
}

impl Linear {
    pub fn new(name: impl Into<String>, in_features: usize, out_features: usize, use_bias: bool) -> Self {
        let core = ModuleCore::new(name);
        let mut weight_data = Tensor::zeros(Shape::new(vec![out_features, in_features]));
        init::kaiming_uniform_(&mut weight_data, 0.0, FanMode::FanIn, Nonlinearity::Relu);
        let weight = Parameter::new(weight_data);
        core.register_parameter("weight", weight.clone()).expect("fresh module: no collision");

        let bias = if use_bias {
            let bias_data = Tensor::zeros(Shape::new(vec![out_features]));
            let p = Parameter::new(bias_data);
            core.register_parameter("bias", p.clone()).expect("fresh module: no collision");
            Some(p)
        } else {
            None
        };

        Linear { core, weight, bias, in_features, out_features }
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    /// Re-draw `weight` (Kaiming uniform, fan_in, relu gain) and zero `bias`.
    pub fn reset_parameters(&self) {
        let mut w = self.weight.value();
        init::kaiming_uniform_(&mut w, 0.0, FanMode::FanIn, Nonlinearity::Relu);
        self.weight.set_value(w);
        if let Some(b) = &self.bias {
            let mut bd = b.value();
            init::zeros_(&mut bd);
            b.set_value(bd);
        }
    }

    pub fn forward(&self, x: &Variable) -> CoreResult<Variable> {
        let in_dim = *x.shape().dims().last().ok_or_else(|| CoreError::ShapeMismatch("Linear: scalar input".into()))?;
        if in_dim != self.in_features {
            return Err(CoreError::ShapeMismatch(format!(
                "{}: expected last dim {}, got {}",
                self.core.name(),
                self.in_features,
                in_dim
            )));
        }
        let training = self.core.is_training();
        let w_t = shape_ops::transpose(self.weight.variable(), training)?;
        let y = matmul::matmul(x, &w_t, training)?;
        match &self.bias {
            Some(b) => add_broadcast(&y, b.variable(), training),
            None => Ok(y),
        }
    }
}

impl Module for Linear {
    fn module(&self) -> &ModuleCore {
        &self.core
    }
}

/// `Linear` whose `in_features` is inferred from the first forward input.
pub struct LazyLinear {
    core: ModuleCore,
    out_features: usize,
    use_bias: bool,
    lazy: LazyState,
    weight: std::cell::RefCell<Option<Parameter>>,
    bias: std::cell::RefCell<Option<Parameter>>,
}

impl LazyLinear {
    pub fn new(name: impl Into<String>, out_features: usize, use_bias: bool) -> Self {
        LazyLinear {
            core: ModuleCore::new(name),
            out_features,
            use_bias,
            lazy: LazyState::new(),
            weight: std::cell::RefCell::new(None),
            bias: std::cell::RefCell::new(None),
        }
    }

    fn materialize(&self, in_features: usize) -> CoreResult<()> {
        if self.weight.borrow().is_some() {
            return Ok(());
        }
        let mut weight_data = Tensor::zeros(Shape::new(vec![self.out_features, in_features]));
        init::kaiming_uniform_(&mut weight_data, 0.0, FanMode::FanIn, Nonlinearity::Relu);
        let weight = Parameter::new(weight_data);
        self.core.register_parameter("weight", weight.clone())?;
        *self.weight.borrow_mut() = Some(weight);

        if self.use_bias {
            let bias_data = Tensor::zeros(Shape::new(vec![self.out_features]));
            let bias = Parameter::new(bias_data);
            self.core.register_parameter("bias", bias.clone())?;
            *self.bias.borrow_mut() = Some(bias);
        }
        Ok(())
    }

    pub fn forward(&self, x: &Variable) -> CoreResult<Variable> {
        let in_dim = *x.shape().dims().last().ok_or_else(|| CoreError::ShapeMismatch("LazyLinear: scalar input".into()))?;
        let resolved = self.lazy.resolve(in_dim, self.core.name())?;
        if self.weight.borrow().is_none() {
            self.materialize(resolved)?;
            self.core.set_lazy_pending(false);
        }
        let training = self.core.is_training();
        let weight = self.weight.borrow().clone().expect("materialized above");
        let w_t = shape_ops::transpose(weight.variable(), training)?;
        let y = matmul::matmul(x, &w_t, training)?;
        match self.bias.borrow().clone() {
            Some(b) => add_broadcast(&y, b.variable(), training),
            None => Ok(y),
        }
    }
}

impl Module for LazyLinear {
    fn module(&self) -> &ModuleCore {
        &self.core
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::Shape;

    #[test]
    fn linear_forward_matches_spec_example() {
        let layer = Linear::new("fc", 2, 2, true);
        layer.weight.set_value(Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], Shape::new(vec![2, 2])).unwrap());
        layer.bias.as_ref().unwrap().set_value(Tensor::from_vec(vec![0.5, -0.5], Shape::new(vec![2])).unwrap());
        let x = Variable::leaf(Tensor::from_vec(vec![1.0, 1.0], Shape::new(vec![1, 2])).unwrap(), false);
        let y = layer.forward(&x).unwrap();
        assert_eq!(y.value().data(), &[3.5, 6.5]);
    }

    #[test]
    fn lazy_linear_infers_in_features_once() {
        let layer = LazyLinear::new("fc", 3, false);
        let x1 = Variable::leaf(Tensor::zeros(Shape::new(vec![2, 4])), false);
        layer.forward(&x1).unwrap();
        assert_eq!(layer.weight.borrow().as_ref().unwrap().value().shape().dims(), &[3, 4]);

        let x2 = Variable::leaf(Tensor::zeros(Shape::new(vec![2, 5])), false);
        assert!(layer.forward(&x2).is_err());
    }
}
