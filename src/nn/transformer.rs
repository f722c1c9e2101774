//! Transformer encoder/decoder blocks: a `MultiHeadAttention` (two of them
//! for the decoder), a two-layer feedforward block, and residual connections
//! around each sublayer. `NormPosition::Pre` (the default) normalizes before
//! each sublayer; `Post` normalizes after the residual add, matching the
//! original Transformer paper.

use crate::autograd::ops::elementwise;
use crate::autograd::Variable;
use crate::error::CoreResult;
use crate::module::{Module, ModuleCore};
use crate::nn::attention::MultiHeadAttention;
use crate::nn::dropout::Dropout;
use crate::nn::linear::Linear;
use crate::nn::norm::LayerNorm;
use crate::shape::Shape;
use crate::tensor::Tensor;
use std::rc::Rc;

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum NormPosition {
    Pre,
    Post,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Relu,
    Tanh,
    Sigmoid,
}

fn apply_activation(x: &Variable, activation: Activation, training: bool) -> CoreResult<Variable> {
    match activation {
        Activation::Relu => elementwise::relu(x, training),
        Activation::Tanh => elementwise::tanh(x, training),
        Activation::Sigmoid => elementwise::sigmoid(x, training),
    }
}

fn feedforward(x: &Variable, linear1: &Linear, linear2: &Linear, activation: Activation, training: bool) -> CoreResult<Variable> {
    let hidden = apply_activation(&linear1.forward(x)?, activation, training)?;
    linear2.forward(&hidden)
}

pub struct TransformerEncoderLayer {
    core: ModuleCore,
    pub self_attn: Rc<MultiHeadAttention>,
    pub linear1: Rc<Linear>,
    pub linear2: Rc<Linear>,
    pub norm1: Rc<LayerNorm>,
    pub norm2: Rc<LayerNorm>,
    dropout: Option<Rc<Dropout>>,
    activation: Activation,
    norm_position: NormPosition,
}

impl TransformerEncoderLayer {
    pub fn new(
        name: impl Into<String>,
        d_model: usize,
        num_heads: usize,
        d_ff: usize,
        dropout_p: Option<f32>,
        activation: Activation,
        norm_position: NormPosition,
    ) -> CoreResult<Self> {
        let name = name.into();
        let core = ModuleCore::new(name.clone());
        let self_attn = Rc::new(MultiHeadAttention::new(format!("{}.self_attn", name), d_model, num_heads, dropout_p)?);
        let linear1 = Rc::new(Linear::new(format!("{}.linear1", name), d_model, d_ff, true));
        let linear2 = Rc::new(Linear::new(format!("{}.linear2", name), d_ff, d_model, true));
        let norm1 = Rc::new(LayerNorm::new(format!("{}.norm1", name), Shape::new(vec![d_model]), 1e-5));
        let norm2 = Rc::new(LayerNorm::new(format!("{}.norm2", name), Shape::new(vec![d_model]), 1e-5));
        let dropout = dropout_p.map(|p| Dropout::new(format!("{}.dropout", name), p)).transpose()?.map(Rc::new);
        core.register_submodule("self_attn", self_attn.clone() as Rc<dyn Module>)?;
        core.register_submodule("linear1", linear1.clone() as Rc<dyn Module>)?;
        core.register_submodule("linear2", linear2.clone() as Rc<dyn Module>)?;
        core.register_submodule("norm1", norm1.clone() as Rc<dyn Module>)?;
        core.register_submodule("norm2", norm2.clone() as Rc<dyn Module>)?;
        if let Some(d) = &dropout {
            core.register_submodule("dropout", d.clone() as Rc<dyn Module>)?;
        }
        Ok(TransformerEncoderLayer { core, self_attn, linear1, linear2, norm1, norm2, dropout, activation, norm_position })
    }

    fn maybe_dropout(&self, x: &Variable) -> CoreResult<Variable> {
        match &self.dropout {
            Some(d) => d.forward(x),
            None => Ok(x.clone()),
        }
    }

    pub fn forward(&self, x: &Variable, mask: Option<&Tensor>) -> CoreResult<Variable> {
        let training = self.core.is_training();
        let x = match self.norm_position {
            NormPosition::Pre => {
                let normed = self.norm1.forward(x)?;
                let attn = self.self_attn.forward(&normed, &normed, &normed, mask)?;
                elementwise::add(x, &self.maybe_dropout(&attn)?, training)?
            }
            NormPosition::Post => {
                let attn = self.self_attn.forward(x, x, x, mask)?;
                self.norm1.forward(&elementwise::add(x, &self.maybe_dropout(&attn)?, training)?)?
            }
        };
        match self.norm_position {
            NormPosition::Pre => {
                let normed = self.norm2.forward(&x)?;
                let ff = feedforward(&normed, &self.linear1, &self.linear2, self.activation, training)?;
                elementwise::add(&x, &self.maybe_dropout(&ff)?, training)
            }
            NormPosition::Post => {
                let ff = feedforward(&x, &self.linear1, &self.linear2, self.activation, training)?;
                self.norm2.forward(&elementwise::add(&x, &self.maybe_dropout(&ff)?, training)?)
            }
        }
    }
}

impl Module for TransformerEncoderLayer {
    fn module(&self) -> &ModuleCore {
        &self.core
    }
}

pub struct TransformerDecoderLayer {
    core: ModuleCore,
    pub self_attn: Rc<MultiHeadAttention>,
    pub cross_attn: Rc<MultiHeadAttention>,
    pub linear1: Rc<Linear>,
    pub linear2: Rc<Linear>,
    pub norm1: Rc<LayerNorm>,
    pub norm2: Rc<LayerNorm>,
    pub norm3: Rc<LayerNorm>,
    dropout: Option<Rc<Dropout>>,
    activation: Activation,
    norm_position: NormPosition,
}

impl TransformerDecoderLayer {
    pub fn new(
        name: impl Into<String>,
        d_model: usize,
        num_heads: usize,
        d_ff: usize,
        dropout_p: Option<f32>,
        activation: Activation,
        norm_position: NormPosition,
    ) -> CoreResult<Self> {
        let name = name.into();
        let core = ModuleCore::new(name.clone());
        let self_attn = Rc::new(MultiHeadAttention::new(format!("{}.self_attn", name), d_model, num_heads, dropout_p)?);
        let cross_attn = Rc::new(MultiHeadAttention::new(format!("{}.cross_attn", name), d_model, num_heads, dropout_p)?);
        let linear1 = Rc::new(Linear::new(format!("{}.linear1", name), d_model, d_ff, true));
        let linear2 = Rc::new(Linear::new(format!("{}.linear2", name), d_ff, d_model, true));
        let norm1 = Rc::new(LayerNorm::new(format!("{}.norm1", name), Shape::new(vec![d_model]), 1e-5));
        let norm2 = Rc::new(LayerNorm::new(format!("{}.norm2", name), Shape::new(vec![d_model]), 1e-5));
        let norm3 = Rc::new(LayerNorm::new(format!("{}.norm3", name), Shape::new(vec![d_model]), 1e-5));
        let dropout = dropout_p.map(|p| Dropout::new(format!("{}.dropout", name), p)).transpose()?.map(Rc::new);
        core.register_submodule("self_attn", self_attn.clone() as Rc<dyn Module>)?;
        core.register_submodule("cross_attn", cross_attn.clone() as Rc<dyn Module>)?;
        core.register_submodule("linear1", linear1.clone() as Rc<dyn Module>)?;
        core.register_submodule("linear2", linear2.clone() as Rc<dyn Module>)?;
        core.register_submodule("norm1", norm1.clone() as Rc<dyn Module>)?;
        core.register_submodule("norm2", norm2.clone() as Rc<dyn Module>)?;
        core.register_submodule("norm3", norm3.clone() as Rc<dyn Module>)?;
        if let Some(d) = &dropout {
            core.register_submodule("dropout", d.clone() as Rc<dyn Module>)?;
        }
        Ok(TransformerDecoderLayer { core, self_attn, cross_attn, linear1, linear2, norm1, norm2, norm3, dropout, activation, norm_position })
    }

    fn maybe_dropout(&self, x: &Variable) -> CoreResult<Variable> {
        match &self.dropout {
            Some(d) => d.forward(x),
            None => Ok(x.clone()),
        }
    }

    pub fn forward(&self, x: &Variable, memory: &Variable, tgt_mask: Option<&Tensor>, memory_mask: Option<&Tensor>) -> CoreResult<Variable> {
        let training = self.core.is_training();

        let x = match self.norm_position {
            NormPosition::Pre => {
                let normed = self.norm1.forward(x)?;
                let attn = self.self_attn.forward(&normed, &normed, &normed, tgt_mask)?;
                elementwise::add(x, &self.maybe_dropout(&attn)?, training)?
            }
            NormPosition::Post => {
                let attn = self.self_attn.forward(x, x, x, tgt_mask)?;
                self.norm1.forward(&elementwise::add(x, &self.maybe_dropout(&attn)?, training)?)?
            }
        };

        let x = match self.norm_position {
            NormPosition::Pre => {
                let normed = self.norm2.forward(&x)?;
                let cross = self.cross_attn.forward(&normed, memory, memory, memory_mask)?;
                elementwise::add(&x, &self.maybe_dropout(&cross)?, training)?
            }
            NormPosition::Post => {
                let cross = self.cross_attn.forward(&x, memory, memory, memory_mask)?;
                self.norm2.forward(&elementwise::add(&x, &self.maybe_dropout(&cross)?, training)?)?
            }
        };

        match self.norm_position {
            NormPosition::Pre => {
                let normed = self.norm3.forward(&x)?;
                let ff = feedforward(&normed, &self.linear1, &self.linear2, self.activation, training)?;
                elementwise::add(&x, &self.maybe_dropout(&ff)?, training)
            }
            NormPosition::Post => {
                let ff = feedforward(&x, &self.linear1, &self.linear2, self.activation, training)?;
                self.norm3.forward(&elementwise::add(&x, &self.maybe_dropout(&ff)?, training)?)
            }
        }
    }
}

impl Module for TransformerDecoderLayer {
    fn module(&self) -> &ModuleCore {
        &self.core
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::ops::reductions;

    #[test]
    fn encoder_layer_preserves_shape_pre_ln() {
        let layer = TransformerEncoderLayer::new("enc", 8, 2, 16, None, Activation::Relu, NormPosition::Pre).unwrap();
        let x = Variable::leaf(Tensor::ones(Shape::new(vec![2, 4, 8])), true);
        let y = layer.forward(&x, None).unwrap();
        assert_eq!(y.shape().dims(), &[2, 4, 8]);
    }

    #[test]
    fn encoder_layer_post_ln_gradient_flows() {
        let layer = TransformerEncoderLayer::new("enc", 8, 2, 16, None, Activation::Relu, NormPosition::Post).unwrap();
        let x = Variable::leaf(Tensor::ones(Shape::new(vec![1, 3, 8])), true);
        let y = layer.forward(&x, None).unwrap();
        let loss = reductions::sum(&y, true).unwrap();
        loss.backward().unwrap();
        assert!(layer.linear1.weight.grad().is_some());
        assert!(layer.self_attn.w_q.grad().is_some());
    }

    #[test]
    fn encoder_layer_named_parameters_cover_every_sublayer() {
        let layer = TransformerEncoderLayer::new("enc", 8, 2, 16, Some(0.1), Activation::Relu, NormPosition::Pre).unwrap();
        let names: Vec<String> = layer.named_parameters("", true).into_iter().map(|(n, _)| n).collect();
        for expected in ["self_attn.w_q", "linear1.weight", "linear2.bias", "norm1.gamma", "norm2.beta"] {
            assert!(names.iter().any(|n| n == expected), "missing {} in {:?}", expected, names);
        }
    }

    #[test]
    fn decoder_layer_preserves_target_shape() {
        let layer = TransformerDecoderLayer::new("dec", 8, 2, 16, None, Activation::Relu, NormPosition::Pre).unwrap();
        let x = Variable::leaf(Tensor::ones(Shape::new(vec![1, 3, 8])), true);
        let memory = Variable::leaf(Tensor::ones(Shape::new(vec![1, 5, 8])), false);
        let tgt_mask = crate::nn::support::causal_mask(3).unwrap();
        let y = layer.forward(&x, &memory, Some(&tgt_mask), None).unwrap();
        assert_eq!(y.shape().dims(), &[1, 3, 8]);
    }
}
