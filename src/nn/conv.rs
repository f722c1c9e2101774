//! Conv2d (im2col + matmul) and the two pooling layers (unfold + axis
//! reduction). All three share output-shape arithmetic with `conv::output_hw`.

use crate::autograd::ops::conv::{self, Window};
use crate::autograd::ops::{matmul, reductions, shape_ops};
use crate::autograd::Variable;
use crate::error::{CoreError, CoreResult};
use crate::init::{self, FanMode, Nonlinearity};
use crate::module::{LazyState, Module, ModuleCore, Parameter};
use crate::nn::support::add_broadcast;
use crate::shape::Shape;
use crate::tensor::Tensor;

fn input_hw(x: &Variable, in_channels: usize, name: &str) -> CoreResult<(usize, usize, usize, usize)> {
    let dims = x.shape().dims().to_vec();
    if dims.len() != 4 || dims[1] != in_channels {
        return Err(CoreError::ShapeMismatch(format!(
            "{}: expected [batch, {}, h, w], got {}",
            name,
            in_channels,
            x.shape()
        )));
    }
    Ok((dims[0], dims[1], dims[2], dims[3]))
}

pub struct Conv2d {
    core: ModuleCore,
    pub weight: Parameter,
    pub bias: Option<Parameter>,
    in_channels: usize,
    out_channels: usize,
    win: Window,
}

impl Conv2d {
    pub fn new(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        kernel: (usize, usize),
        stride: usize,
        padding: usize,
        use_bias: bool,
    ) -> Self {
        let core = ModuleCore::new(name);
        let (kh, kw) = kernel;
        let mut weight_data = Tensor::zeros(Shape::new(vec![out_channels, in_channels, kh, kw]));
        init::kaiming_uniform_(&mut weight_data, 0.0, FanMode::FanIn, Nonlinearity::Relu);
        let weight = Parameter::new(weight_data);
        core.register_parameter("weight", weight.clone()).expect("fresh module: no collision");
        let bias = if use_bias {
            let b = Parameter::new(Tensor::zeros(Shape::new(vec![out_channels])));
            core.register_parameter("bias", b.clone()).expect("fresh module: no collision");
            Some(b)
        } else {
            None
        };
        Conv2d { core, weight, bias, in_channels, out_channels, win: Window { kh, kw, stride, padding } }
    }

    fn apply(&self, x: &Variable, weight: &Parameter, bias: Option<&Parameter>) -> CoreResult<Variable> {
        let (batch, _, h, w) = input_hw(x, self.in_channels, self.core.name())?;
        let training = self.core.is_training();
        let (out_h, out_w) = conv::output_hw(h, w, self.win.kh, self.win.kw, self.win.stride, self.win.padding)?;
        let patch = self.in_channels * self.win.kh * self.win.kw;

        let cols = conv::im2col(x, self.win, training)?;
        let weight_flat = shape_ops::reshape(weight.variable(), Shape::new(vec![self.out_channels, patch]), training)?;
        let weight_flat_t = shape_ops::transpose(&weight_flat, training)?;
        let projected = matmul::matmul(&cols, &weight_flat_t, training)?;

        let biased = match bias {
            Some(b) => add_broadcast(&projected, b.variable(), training)?,
            None => projected,
        };
        let swapped = shape_ops::transpose_perm(&biased, &[0, 2, 1], training)?;
        shape_ops::reshape(&swapped, Shape::new(vec![batch, self.out_channels, out_h, out_w]), training)
    }

    pub fn forward(&self, x: &Variable) -> CoreResult<Variable> {
        self.apply(x, &self.weight, self.bias.as_ref())
    }
}

impl Module for Conv2d {
    fn module(&self) -> &ModuleCore {
        &self.core
    }
}

/// `Conv2d` whose `in_channels` is inferred from the first forward input.
pub struct LazyConv2d {
    core: ModuleCore,
    out_channels: usize,
    win: Window,
    use_bias: bool,
    lazy: LazyState,
    weight: std::cell::RefCell<Option<Parameter>>,
    bias: std::cell::RefCell<Option<Parameter>>,
}

impl LazyConv2d {
    pub fn new(name: impl Into<String>, out_channels: usize, kernel: (usize, usize), stride: usize, padding: usize, use_bias: bool) -> Self {
        LazyConv2d {
            core: ModuleCore::new(name),
            out_channels,
            win: Window { kh: kernel.0, kw: kernel.1, stride, padding },
            use_bias,
            lazy: LazyState::new(),
            weight: std::cell::RefCell::new(None),
            bias: std::cell::RefCell::new(None),
        }
    }

    fn materialize(&self, in_channels: usize) -> CoreResult<()> {
        if self.weight.borrow().is_some() {
            return Ok(());
        }
        let mut weight_data = Tensor::zeros(Shape::new(vec![self.out_channels, in_channels, self.win.kh, self.win.kw]));
        init::kaiming_uniform_(&mut weight_data, 0.0, FanMode::FanIn, Nonlinearity::Relu);
        let weight = Parameter::new(weight_data);
        self.core.register_parameter("weight", weight.clone())?;
        *self.weight.borrow_mut() = Some(weight);
        if self.use_bias {
            let b = Parameter::new(Tensor::zeros(Shape::new(vec![self.out_channels])));
            self.core.register_parameter("bias", b.clone())?;
            *self.bias.borrow_mut() = Some(b);
        }
        Ok(())
    }

    pub fn forward(&self, x: &Variable) -> CoreResult<Variable> {
        let dims = x.shape().dims().to_vec();
        if dims.len() != 4 {
            return Err(CoreError::ShapeMismatch(format!("{}: expected rank-4 input, got {}", self.core.name(), x.shape())));
        }
        let resolved = self.lazy.resolve(dims[1], self.core.name())?;
        if self.weight.borrow().is_none() {
            self.materialize(resolved)?;
            self.core.set_lazy_pending(false);
        }
        let training = self.core.is_training();
        let (batch, _, h, w) = (dims[0], dims[1], dims[2], dims[3]);
        let (out_h, out_w) = conv::output_hw(h, w, self.win.kh, self.win.kw, self.win.stride, self.win.padding)?;
        let weight = self.weight.borrow().clone().expect("materialized above");
        let patch = resolved * self.win.kh * self.win.kw;

        let cols = conv::im2col(x, self.win, training)?;
        let weight_flat = shape_ops::reshape(weight.variable(), Shape::new(vec![self.out_channels, patch]), training)?;
        let weight_flat_t = shape_ops::transpose(&weight_flat, training)?;
        let projected = matmul::matmul(&cols, &weight_flat_t, training)?;
        let biased = match self.bias.borrow().clone() {
            Some(b) => add_broadcast(&projected, b.variable(), training)?,
            None => projected,
        };
        let swapped = shape_ops::transpose_perm(&biased, &[0, 2, 1], training)?;
        shape_ops::reshape(&swapped, Shape::new(vec![batch, self.out_channels, out_h, out_w]), training)
    }
}

impl Module for LazyConv2d {
    fn module(&self) -> &ModuleCore {
        &self.core
    }
}

fn pool_forward(x: &Variable, win: Window, name: &str, largest: bool, training: bool) -> CoreResult<Variable> {
    let dims = x.shape().dims().to_vec();
    if dims.len() != 4 {
        return Err(CoreError::ShapeMismatch(format!("{}: expected [batch, channels, h, w], got {}", name, x.shape())));
    }
    let (batch, channels, h, w) = (dims[0], dims[1], dims[2], dims[3]);
    let (out_h, out_w) = conv::output_hw(h, w, win.kh, win.kw, win.stride, win.padding)?;
    let windows = conv::unfold(x, win, training)?;
    let pooled = if largest {
        reductions::max_axis(&windows, -1, training)?
    } else {
        reductions::mean_axis(&windows, -1, training)?
    };
    shape_ops::reshape(&pooled, Shape::new(vec![batch, channels, out_h, out_w]), training)
}

/// Stateless: no parameters, no buffers, mode-independent. Kept as a
/// `ModuleCore`-backed layer anyway so it composes uniformly in a `Module`
/// tree (e.g. `named_submodules` still lists it).
pub struct MaxPool2d {
    core: ModuleCore,
    win: Window,
}

impl MaxPool2d {
    pub fn new(name: impl Into<String>, kernel: (usize, usize), stride: usize, padding: usize) -> Self {
        MaxPool2d { core: ModuleCore::new(name), win: Window { kh: kernel.0, kw: kernel.1, stride, padding } }
    }

    pub fn forward(&self, x: &Variable) -> CoreResult<Variable> {
        pool_forward(x, self.win, self.core.name(), true, self.core.is_training())
    }
}

impl Module for MaxPool2d {
    fn module(&self) -> &ModuleCore {
        &self.core
    }
}

pub struct AvgPool2d {
    core: ModuleCore,
    win: Window,
}

impl AvgPool2d {
    pub fn new(name: impl Into<String>, kernel: (usize, usize), stride: usize, padding: usize) -> Self {
        AvgPool2d { core: ModuleCore::new(name), win: Window { kh: kernel.0, kw: kernel.1, stride, padding } }
    }

    pub fn forward(&self, x: &Variable) -> CoreResult<Variable> {
        pool_forward(x, self.win, self.core.name(), false, self.core.is_training())
    }
}

impl Module for AvgPool2d {
    fn module(&self) -> &ModuleCore {
        &self.core
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conv2d_output_shape_matches_formula() {
        let conv = Conv2d::new("c1", 3, 8, (3, 3), 1, 1, true);
        let x = Variable::leaf(Tensor::zeros(Shape::new(vec![2, 3, 8, 8])), true);
        let y = conv.forward(&x).unwrap();
        assert_eq!(y.shape().dims(), &[2, 8, 8, 8]);
    }

    #[test]
    fn conv2d_gradient_flows_to_weight_and_bias() {
        let conv = Conv2d::new("c1", 1, 1, (2, 2), 2, 0, true);
        let x = Variable::leaf(Tensor::ones(Shape::new(vec![1, 1, 4, 4])), true);
        let y = conv.forward(&x).unwrap();
        let loss = reductions::sum(&y, true).unwrap();
        loss.backward().unwrap();
        assert!(conv.weight.grad().is_some());
        assert!(conv.bias.as_ref().unwrap().grad().is_some());
    }

    #[test]
    fn maxpool_halves_spatial_dims() {
        let pool = MaxPool2d::new("pool", (2, 2), 2, 0);
        let x = Variable::leaf(
            Tensor::from_vec((0..16).map(|i| i as f32).collect(), Shape::new(vec![1, 1, 4, 4])).unwrap(),
            false,
        );
        let y = pool.forward(&x).unwrap();
        assert_eq!(y.shape().dims(), &[1, 1, 2, 2]);
        assert_eq!(y.value().data(), &[5.0, 7.0, 13.0, 15.0]);
    }

    #[test]
    fn avgpool_averages_each_window() {
        let pool = AvgPool2d::new("pool", (2, 2), 2, 0);
        let x = Variable::leaf(Tensor::ones(Shape::new(vec![1, 1, 4, 4])), false);
        let y = pool.forward(&x).unwrap();
        for v in y.value().data() {
            assert!((v - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn lazy_conv2d_infers_in_channels_once() {
        let conv = LazyConv2d::new("c1", 4, (3, 3), 1, 1, true);
        let x1 = Variable::leaf(Tensor::zeros(Shape::new(vec![1, 3, 8, 8])), true);
        conv.forward(&x1).unwrap();
        let x2 = Variable::leaf(Tensor::zeros(Shape::new(vec![1, 5, 8, 8])), true);
        assert!(conv.forward(&x2).is_err());
    }
}
