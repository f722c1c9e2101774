//! Step-wise recurrent layers: `SimpleRNN`, `GRU`, `LSTM`. Each processes one
//! `[batch, input_size]` step per `forward` call and keeps its own hidden (and
//! for LSTM, cell) state as a `Buffer`. Per-step state is read back as a
//! detached constant rather than a live `Variable`, so each call only builds
//! a single step of autograd tape; a caller that wants backprop-through-time
//! across several steps composes the gate math directly with `unchain`
//! (available on every `Variable`) at whatever boundary it chooses.

use crate::autograd::ops::elementwise;
use crate::autograd::ops::{matmul, shape_ops};
use crate::autograd::Variable;
use crate::error::{CoreError, CoreResult};
use crate::init::{self, FanMode, Nonlinearity};
use crate::module::{Buffer, Module, ModuleCore, Parameter};
use crate::nn::support::{add_broadcast, constant};
use crate::shape::Shape;
use crate::tensor::Tensor;

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum RnnActivation {
    Tanh,
    Relu,
}

fn xavier_param(out: usize, inp: usize) -> Tensor {
    let mut data = Tensor::zeros(Shape::new(vec![out, inp]));
    init::xavier_uniform_(&mut data, 1.0);
    data
}

fn gate(x: &Variable, h: &Variable, wx: &Parameter, wh: &Parameter, b: &Parameter, training: bool) -> CoreResult<Variable> {
    let wx_t = shape_ops::transpose(wx.variable(), training)?;
    let wh_t = shape_ops::transpose(wh.variable(), training)?;
    let from_x = matmul::matmul(x, &wx_t, training)?;
    let from_h = matmul::matmul(h, &wh_t, training)?;
    let summed = elementwise::add(&from_x, &from_h, training)?;
    add_broadcast(&summed, b.variable(), training)
}

fn check_step_shape(x: &Variable, input_size: usize, name: &str) -> CoreResult<usize> {
    let dims = x.shape().dims().to_vec();
    if dims.len() != 2 || dims[1] != input_size {
        return Err(CoreError::ShapeMismatch(format!("{}: expected [batch, {}], got {}", name, input_size, x.shape())));
    }
    Ok(dims[0])
}

/// `h' = act(x @ Wx^T + h @ Wh^T + b)`.
pub struct SimpleRNN {
    core: ModuleCore,
    pub weight_x: Parameter,
    pub weight_h: Parameter,
    pub bias: Parameter,
    hidden: Buffer,
    input_size: usize,
    hidden_size: usize,
    activation: RnnActivation,
}

impl SimpleRNN {
    pub fn new(name: impl Into<String>, input_size: usize, hidden_size: usize, activation: RnnActivation) -> Self {
        let core = ModuleCore::new(name);
        let weight_x = Parameter::new(xavier_param(hidden_size, input_size));
        let weight_h = Parameter::new(xavier_param(hidden_size, hidden_size));
        let bias = Parameter::new(Tensor::zeros(Shape::new(vec![hidden_size])));
        core.register_parameter("weight_x", weight_x.clone()).expect("fresh module: no collision");
        core.register_parameter("weight_h", weight_h.clone()).expect("fresh module: no collision");
        core.register_parameter("bias", bias.clone()).expect("fresh module: no collision");
        let hidden = Buffer::new(Tensor::zeros(Shape::new(vec![1, hidden_size])));
        core.register_buffer("hidden", hidden.clone()).expect("fresh module: no collision");
        SimpleRNN { core, weight_x, weight_h, bias, hidden, input_size, hidden_size, activation }
    }

    pub fn reset_state(&self) {
        self.hidden.set(Tensor::zeros(Shape::new(vec![1, self.hidden_size])));
    }

    fn hidden_for(&self, batch: usize) -> CoreResult<Variable> {
        let stored = self.hidden.get();
        let seed = if stored.shape().dims()[0] == batch {
            stored
        } else {
            Tensor::zeros(Shape::new(vec![batch, self.hidden_size]))
        };
        Ok(constant(seed))
    }

    pub fn forward(&self, x: &Variable) -> CoreResult<Variable> {
        let batch = check_step_shape(x, self.input_size, self.core.name())?;
        let training = self.core.is_training();
        let h_prev = self.hidden_for(batch)?;
        let pre = gate(x, &h_prev, &self.weight_x, &self.weight_h, &self.bias, training)?;
        let h_next = match self.activation {
            RnnActivation::Tanh => elementwise::tanh(&pre, training)?,
            RnnActivation::Relu => elementwise::relu(&pre, training)?,
        };
        self.hidden.set(h_next.value());
        Ok(h_next)
    }
}

impl Module for SimpleRNN {
    fn module(&self) -> &ModuleCore {
        &self.core
    }
}

/// Reset/update/candidate gates (PyTorch gate order and bias split).
pub struct GRU {
    core: ModuleCore,
    pub weight_x_r: Parameter,
    pub weight_h_r: Parameter,
    pub bias_r: Parameter,
    pub weight_x_z: Parameter,
    pub weight_h_z: Parameter,
    pub bias_z: Parameter,
    pub weight_x_n: Parameter,
    pub weight_h_n: Parameter,
    pub bias_xn: Parameter,
    pub bias_hn: Parameter,
    hidden: Buffer,
    input_size: usize,
    hidden_size: usize,
}

impl GRU {
    pub fn new(name: impl Into<String>, input_size: usize, hidden_size: usize) -> Self {
        let core = ModuleCore::new(name);
        let mk_wx = || Parameter::new(xavier_param(hidden_size, input_size));
        let mk_wh = || Parameter::new(xavier_param(hidden_size, hidden_size));
        let mk_b = || Parameter::new(Tensor::zeros(Shape::new(vec![hidden_size])));

        let weight_x_r = mk_wx();
        let weight_h_r = mk_wh();
        let bias_r = mk_b();
        let weight_x_z = mk_wx();
        let weight_h_z = mk_wh();
        let bias_z = mk_b();
        let weight_x_n = mk_wx();
        let weight_h_n = mk_wh();
        let bias_xn = mk_b();
        let bias_hn = mk_b();

        for (n, p) in [
            ("weight_x_r", &weight_x_r),
            ("weight_h_r", &weight_h_r),
            ("bias_r", &bias_r),
            ("weight_x_z", &weight_x_z),
            ("weight_h_z", &weight_h_z),
            ("bias_z", &bias_z),
            ("weight_x_n", &weight_x_n),
            ("weight_h_n", &weight_h_n),
            ("bias_xn", &bias_xn),
            ("bias_hn", &bias_hn),
        ] {
            core.register_parameter(n, p.clone()).expect("fresh module: no collision");
        }

        let hidden = Buffer::new(Tensor::zeros(Shape::new(vec![1, hidden_size])));
        core.register_buffer("hidden", hidden.clone()).expect("fresh module: no collision");

        GRU {
            core,
            weight_x_r,
            weight_h_r,
            bias_r,
            weight_x_z,
            weight_h_z,
            bias_z,
            weight_x_n,
            weight_h_n,
            bias_xn,
            bias_hn,
            hidden,
            input_size,
            hidden_size,
        }
    }

    pub fn reset_state(&self) {
        self.hidden.set(Tensor::zeros(Shape::new(vec![1, self.hidden_size])));
    }

    fn hidden_for(&self, batch: usize) -> Variable {
        let stored = self.hidden.get();
        let seed = if stored.shape().dims()[0] == batch { stored } else { Tensor::zeros(Shape::new(vec![batch, self.hidden_size])) };
        constant(seed)
    }

    pub fn forward(&self, x: &Variable) -> CoreResult<Variable> {
        let batch = check_step_shape(x, self.input_size, self.core.name())?;
        let training = self.core.is_training();
        let h = self.hidden_for(batch);

        let r = elementwise::sigmoid(&gate(x, &h, &self.weight_x_r, &self.weight_h_r, &self.bias_r, training)?, training)?;
        let z = elementwise::sigmoid(&gate(x, &h, &self.weight_x_z, &self.weight_h_z, &self.bias_z, training)?, training)?;

        let wxn_t = shape_ops::transpose(self.weight_x_n.variable(), training)?;
        let whn_t = shape_ops::transpose(self.weight_h_n.variable(), training)?;
        let from_x = add_broadcast(&matmul::matmul(x, &wxn_t, training)?, self.bias_xn.variable(), training)?;
        let from_h = add_broadcast(&matmul::matmul(&h, &whn_t, training)?, self.bias_hn.variable(), training)?;
        let gated_h = elementwise::mul(&r, &from_h, training)?;
        let n = elementwise::tanh(&elementwise::add(&from_x, &gated_h, training)?, training)?;

        // h' = (1 - z) * n + z * h
        let one_minus_z = elementwise::add_scalar(&elementwise::neg(&z, training)?, 1.0, training)?;
        let keep_n = elementwise::mul(&one_minus_z, &n, training)?;
        let keep_h = elementwise::mul(&z, &h, training)?;
        let h_next = elementwise::add(&keep_n, &keep_h, training)?;

        self.hidden.set(h_next.value());
        Ok(h_next)
    }
}

impl Module for GRU {
    fn module(&self) -> &ModuleCore {
        &self.core
    }
}

/// Input/forget/cell/output gates, PyTorch gate order.
pub struct LSTM {
    core: ModuleCore,
    pub weight_x_i: Parameter,
    pub weight_h_i: Parameter,
    pub bias_i: Parameter,
    pub weight_x_f: Parameter,
    pub weight_h_f: Parameter,
    pub bias_f: Parameter,
    pub weight_x_g: Parameter,
    pub weight_h_g: Parameter,
    pub bias_g: Parameter,
    pub weight_x_o: Parameter,
    pub weight_h_o: Parameter,
    pub bias_o: Parameter,
    hidden: Buffer,
    cell: Buffer,
    input_size: usize,
    hidden_size: usize,
}

impl LSTM {
    pub fn new(name: impl Into<String>, input_size: usize, hidden_size: usize) -> Self {
        let core = ModuleCore::new(name);
        let mk_wx = || Parameter::new(xavier_param(hidden_size, input_size));
        let mk_wh = || Parameter::new(xavier_param(hidden_size, hidden_size));
        let mk_b = || Parameter::new(Tensor::zeros(Shape::new(vec![hidden_size])));

        let weight_x_i = mk_wx();
        let weight_h_i = mk_wh();
        let bias_i = mk_b();
        let weight_x_f = mk_wx();
        let weight_h_f = mk_wh();
        let bias_f = mk_b();
        let weight_x_g = mk_wx();
        let weight_h_g = mk_wh();
        let bias_g = mk_b();
        let weight_x_o = mk_wx();
        let weight_h_o = mk_wh();
        let bias_o = mk_b();

        for (n, p) in [
            ("weight_x_i", &weight_x_i),
            ("weight_h_i", &weight_h_i),
            ("bias_i", &bias_i),
            ("weight_x_f", &weight_x_f),
            ("weight_h_f", &weight_h_f),
            ("bias_f", &bias_f),
            ("weight_x_g", &weight_x_g),
            ("weight_h_g", &weight_h_g),
            ("bias_g", &bias_g),
            ("weight_x_o", &weight_x_o),
            ("weight_h_o", &weight_h_o),
            ("bias_o", &bias_o),
        ] {
            core.register_parameter(n, p.clone()).expect("fresh module: no collision");
        }

        let hidden = Buffer::new(Tensor::zeros(Shape::new(vec![1, hidden_size])));
        let cell = Buffer::new(Tensor::zeros(Shape::new(vec![1, hidden_size])));
        core.register_buffer("hidden", hidden.clone()).expect("fresh module: no collision");
        core.register_buffer("cell", cell.clone()).expect("fresh module: no collision");

        LSTM {
            core,
            weight_x_i,
            weight_h_i,
            bias_i,
            weight_x_f,
            weight_h_f,
            bias_f,
            weight_x_g,
            weight_h_g,
            bias_g,
            weight_x_o,
            weight_h_o,
            bias_o,
            hidden,
            cell,
            input_size,
            hidden_size,
        }
    }

    pub fn reset_state(&self) {
        self.hidden.set(Tensor::zeros(Shape::new(vec![1, self.hidden_size])));
        self.cell.set(Tensor::zeros(Shape::new(vec![1, self.hidden_size])));
    }

    pub fn hidden(&self) -> Tensor {
        self.hidden.get()
    }

    pub fn cell_state(&self) -> Tensor {
        self.cell.get()
    }

    fn state_for(&self, batch: usize) -> (Variable, Variable) {
        let h_stored = self.hidden.get();
        let c_stored = self.cell.get();
        if h_stored.shape().dims()[0] == batch {
            (constant(h_stored), constant(c_stored))
        } else {
            let zeros = Tensor::zeros(Shape::new(vec![batch, self.hidden_size]));
            (constant(zeros.clone()), constant(zeros))
        }
    }

    pub fn forward(&self, x: &Variable) -> CoreResult<Variable> {
        let batch = check_step_shape(x, self.input_size, self.core.name())?;
        let training = self.core.is_training();
        let (h, c) = self.state_for(batch);

        let i = elementwise::sigmoid(&gate(x, &h, &self.weight_x_i, &self.weight_h_i, &self.bias_i, training)?, training)?;
        let f = elementwise::sigmoid(&gate(x, &h, &self.weight_x_f, &self.weight_h_f, &self.bias_f, training)?, training)?;
        let g = elementwise::tanh(&gate(x, &h, &self.weight_x_g, &self.weight_h_g, &self.bias_g, training)?, training)?;
        let o = elementwise::sigmoid(&gate(x, &h, &self.weight_x_o, &self.weight_h_o, &self.bias_o, training)?, training)?;

        let c_next = elementwise::add(&elementwise::mul(&f, &c, training)?, &elementwise::mul(&i, &g, training)?, training)?;
        let h_next = elementwise::mul(&o, &elementwise::tanh(&c_next, training)?, training)?;

        self.hidden.set(h_next.value());
        self.cell.set(c_next.value());
        Ok(h_next)
    }
}

impl Module for LSTM {
    fn module(&self) -> &ModuleCore {
        &self.core
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_rnn_output_shape_and_state_update() {
        let rnn = SimpleRNN::new("rnn", 3, 5, RnnActivation::Tanh);
        let x = Variable::leaf(Tensor::ones(Shape::new(vec![2, 3])), false);
        let y = rnn.forward(&x).unwrap();
        assert_eq!(y.shape().dims(), &[2, 5]);
        assert_ne!(rnn.hidden.get().data(), vec![0.0; 10].as_slice());
    }

    #[test]
    fn gru_gradient_flows_to_all_gate_weights() {
        let gru = GRU::new("gru", 2, 3);
        let x = Variable::leaf(Tensor::ones(Shape::new(vec![1, 2])), true);
        let y = gru.forward(&x).unwrap();
        let loss = crate::autograd::ops::reductions::sum(&y, true).unwrap();
        loss.backward().unwrap();
        assert!(gru.weight_x_r.grad().is_some());
        assert!(gru.weight_h_n.grad().is_some());
        assert!(gru.bias_hn.grad().is_some());
    }

    #[test]
    fn lstm_state_reset_zeros_buffers() {
        let lstm = LSTM::new("lstm", 4, 8);
        let x = Variable::leaf(Tensor::ones(Shape::new(vec![2, 4])), false);
        lstm.forward(&x).unwrap();
        assert!(lstm.hidden().data().iter().any(|&v| v != 0.0));
        assert!(lstm.cell_state().data().iter().any(|&v| v != 0.0));
        lstm.reset_state();
        assert!(lstm.hidden().data().iter().all(|&v| v == 0.0));
        assert!(lstm.cell_state().data().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn batch_size_change_reseeds_zero_state_instead_of_mismatching() {
        let rnn = SimpleRNN::new("rnn", 2, 4, RnnActivation::Relu);
        let x1 = Variable::leaf(Tensor::ones(Shape::new(vec![3, 2])), false);
        rnn.forward(&x1).unwrap();
        let x2 = Variable::leaf(Tensor::ones(Shape::new(vec![1, 2])), false);
        let y2 = rnn.forward(&x2).unwrap();
        assert_eq!(y2.shape().dims(), &[1, 4]);
    }
}
