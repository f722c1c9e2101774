//! Mixture-of-experts routing: a linear router picks `top_k` experts per
//! token, every token is still run through every expert (dense compute), and
//! the combination is masked/weighted down to just the selected experts. This
//! is correct and numerically identical to a capacity-limited sparse dispatch
//! as long as no token's selected experts are ever over capacity, which this
//! layer assumes (see `expert_capacity`: informational only, never enforced).
//!
//! Router and expert weights use Xavier uniform rather than `Linear`'s
//! default Kaiming init (there is no fixed ReLU directly downstream of the
//! router, and the experts' own internal ReLU is already accounted for by
//! their own fan-in): parameters are therefore built and registered directly
//! on this layer's core, the same flat-registration shape `MultiHeadAttention`
//! uses for its four projections, rather than nested `Linear` submodules.

use crate::autograd::ops::{elementwise, indexing, matmul, reductions, shape_ops, softmax as softmax_ops};
use crate::autograd::Variable;
use crate::error::{CoreError, CoreResult};
use crate::init;
use crate::module::{Module, ModuleCore, Parameter};
use crate::nn::support::{add_broadcast, additive_mask, constant, mul_broadcast};
use crate::shape::Shape;
use crate::tensor::Tensor;

fn xavier_weight(out_dim: usize, in_dim: usize) -> Tensor {
    let mut w = Tensor::zeros(Shape::new(vec![out_dim, in_dim]));
    init::xavier_uniform_(&mut w, 1.0);
    w
}

fn linear_forward(x: &Variable, weight: &Parameter, bias: &Parameter, training: bool) -> CoreResult<Variable> {
    let w_t = shape_ops::transpose(weight.variable(), training)?;
    let y = matmul::matmul(x, &w_t, training)?;
    add_broadcast(&y, bias.variable(), training)
}

struct ExpertWeights {
    fc1_w: Parameter,
    fc1_b: Parameter,
    fc2_w: Parameter,
    fc2_b: Parameter,
}

impl ExpertWeights {
    fn new(core: &ModuleCore, idx: usize, d_model: usize, d_expert: usize) -> CoreResult<Self> {
        let fc1_w = Parameter::new(xavier_weight(d_expert, d_model));
        let fc1_b = Parameter::new(Tensor::zeros(Shape::new(vec![d_expert])));
        let fc2_w = Parameter::new(xavier_weight(d_model, d_expert));
        let fc2_b = Parameter::new(Tensor::zeros(Shape::new(vec![d_model])));
        core.register_parameter(format!("expert{}.fc1.weight", idx), fc1_w.clone())?;
        core.register_parameter(format!("expert{}.fc1.bias", idx), fc1_b.clone())?;
        core.register_parameter(format!("expert{}.fc2.weight", idx), fc2_w.clone())?;
        core.register_parameter(format!("expert{}.fc2.bias", idx), fc2_b.clone())?;
        Ok(ExpertWeights { fc1_w, fc1_b, fc2_w, fc2_b })
    }

    fn forward(&self, x: &Variable, training: bool) -> CoreResult<Variable> {
        let hidden = linear_forward(x, &self.fc1_w, &self.fc1_b, training)?;
        let hidden = elementwise::relu(&hidden, training)?;
        linear_forward(&hidden, &self.fc2_w, &self.fc2_b, training)
    }

    fn reset(&self, d_model: usize, d_expert: usize) {
        let mut w1 = self.fc1_w.value();
        init::xavier_uniform_(&mut w1, 1.0);
        self.fc1_w.set_value(w1);
        self.fc1_b.set_value(Tensor::zeros(Shape::new(vec![d_expert])));
        let mut w2 = self.fc2_w.value();
        init::xavier_uniform_(&mut w2, 1.0);
        self.fc2_w.set_value(w2);
        self.fc2_b.set_value(Tensor::zeros(Shape::new(vec![d_model])));
    }
}

/// Per-call routing record: which experts each token used, their normalized
/// weights, and the two scalar regularization losses the training loop sums
/// into the task loss.
pub struct ExpertRoutingInfo {
    /// `selected_experts[token]` is that token's chosen expert indices, in
    /// ascending order (the order `Tensor::top_k` restores when `sorted =
    /// false`, matching the order the weights below line up with).
    pub selected_experts: Vec<Vec<usize>>,
    /// `weights[token][i]` is the gate weight for `selected_experts[token][i]`;
    /// sums to `1.0` (within float precision) for every token.
    pub weights: Vec<Vec<f32>>,
    /// KL divergence from the batch-average gating distribution to uniform.
    /// Zero when load is perfectly balanced across experts; the training loop
    /// adds this (typically un-scaled) to the task loss to discourage expert
    /// collapse.
    pub load_balance_loss: Variable,
    /// Router z-loss: mean squared log-sum-exp of the router logits, scaled
    /// by `z_loss_weight`. Not specified by name in the routing contract this
    /// layer implements, but a standard companion to the load-balance loss
    /// that keeps router logits from growing unboundedly; see DESIGN.md.
    pub auxiliary_loss: Variable,
}

/// Router (`Linear [d_model, num_experts]`) plus `num_experts` independent
/// two-layer MLPs (`d_model -> d_expert -> d_model`, ReLU). Every token is
/// routed through every expert; the router's top-k mask and softmax weights
/// zero out and renormalize the unselected experts' contributions.
pub struct MixtureOfExperts {
    core: ModuleCore,
    router_w: Parameter,
    router_b: Parameter,
    experts: Vec<ExpertWeights>,
    d_model: usize,
    d_expert: usize,
    num_experts: usize,
    top_k: usize,
    expert_capacity_factor: f32,
    z_loss_weight: f32,
}

impl MixtureOfExperts {
    pub fn new(
        name: impl Into<String>,
        d_model: usize,
        num_experts: usize,
        top_k: usize,
        d_expert: usize,
        expert_capacity_factor: f32,
    ) -> CoreResult<Self> {
        if num_experts == 0 {
            return Err(CoreError::ShapeMismatch("MixtureOfExperts: num_experts must be >= 1".into()));
        }
        if top_k == 0 || top_k > num_experts {
            return Err(CoreError::ShapeMismatch(format!(
                "MixtureOfExperts: top_k {} must be in [1, num_experts={}]",
                top_k, num_experts
            )));
        }
        let core = ModuleCore::new(name);
        let router_w = Parameter::new(xavier_weight(num_experts, d_model));
        let router_b = Parameter::new(Tensor::zeros(Shape::new(vec![num_experts])));
        core.register_parameter("router.weight", router_w.clone())?;
        core.register_parameter("router.bias", router_b.clone())?;

        let experts = (0..num_experts).map(|i| ExpertWeights::new(&core, i, d_model, d_expert)).collect::<CoreResult<Vec<_>>>()?;

        Ok(MixtureOfExperts {
            core,
            router_w,
            router_b,
            experts,
            d_model,
            d_expert,
            num_experts,
            top_k,
            expert_capacity_factor,
            z_loss_weight: 0.01,
        })
    }

    pub fn num_experts(&self) -> usize {
        self.num_experts
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Re-draw the router and every expert's weights (Xavier uniform, gain
    /// 1); biases reset to zero.
    pub fn reset_parameters(&self) {
        let mut rw = self.router_w.value();
        init::xavier_uniform_(&mut rw, 1.0);
        self.router_w.set_value(rw);
        self.router_b.set_value(Tensor::zeros(Shape::new(vec![self.num_experts])));
        for e in &self.experts {
            e.reset(self.d_model, self.d_expert);
        }
    }

    /// Informational only: this layer is dense-compute and never drops a
    /// token, so capacity is never enforced against this value (see module
    /// doc comment and DESIGN.md's Non-goals note on capacity).
    pub fn expert_capacity(&self, num_tokens: usize) -> usize {
        let ideal = (num_tokens as f32 / self.num_experts as f32) * self.top_k as f32 * self.expert_capacity_factor;
        ideal.ceil() as usize
    }

    fn logsumexp_axis_last(&self, logits: &Variable, tokens: usize, training: bool) -> CoreResult<Variable> {
        let m = reductions::max_axis(logits, -1, training)?;
        let m_keep = shape_ops::reshape(&m, Shape::new(vec![tokens, 1]), training)?;
        let m_b = shape_ops::broadcast_to(&m_keep, logits.shape(), training)?;
        let shifted = elementwise::sub(logits, &m_b, training)?;
        let exp_shifted = elementwise::exp(&shifted, training)?;
        let sum_exp = reductions::sum_axis(&exp_shifted, -1, training)?;
        let log_sum_exp = elementwise::log(&sum_exp, training)?;
        elementwise::add(&log_sum_exp, &m, training)
    }

    /// `x`: `[..., d_model]`, any number of leading dims (flattened to a
    /// token axis internally and restored on output). `task_bias`, if given,
    /// is a `[num_experts]` additive boost on the router logits for a caller
    /// supplied task tag — broadcast over every token in this call.
    pub fn forward(&self, x: &Variable, task_bias: Option<&Tensor>) -> CoreResult<(Variable, ExpertRoutingInfo)> {
        let original_shape = x.shape();
        let dims = original_shape.dims();
        let last = *dims.last().ok_or_else(|| CoreError::ShapeMismatch("MixtureOfExperts: scalar input".into()))?;
        if last != self.d_model {
            return Err(CoreError::ShapeMismatch(format!(
                "{}: expected trailing dim {}, got {}",
                self.core.name(),
                self.d_model,
                original_shape
            )));
        }
        let tokens = original_shape.size() / self.d_model;
        let training = self.core.is_training();
        let x_flat = shape_ops::reshape(x, Shape::new(vec![tokens, self.d_model]), training)?;

        let mut logits = linear_forward(&x_flat, &self.router_w, &self.router_b, training)?;
        if let Some(bias) = task_bias {
            if bias.shape().dims() != [self.num_experts].as_slice() {
                return Err(CoreError::ShapeMismatch(format!(
                    "{}: task_bias expected [{}], got {}",
                    self.core.name(),
                    self.num_experts,
                    bias.shape()
                )));
            }
            logits = add_broadcast(&logits, &constant(bias.clone()), training)?;
        }

        let (_, top_indices) = logits.value().top_k(self.top_k, -1, true, false)?;
        let mut mask = Tensor::zeros(Shape::new(vec![tokens, self.num_experts]));
        for t in 0..tokens {
            for slot in 0..self.top_k {
                let e = top_indices[t * self.top_k + slot];
                mask.data_mut()[t * self.num_experts + e] = 1.0;
            }
        }
        let masked_bias = constant(additive_mask(&mask));
        let masked_logits = elementwise::add(&logits, &masked_bias, training)?;
        let gate_weights = softmax_ops::softmax(&masked_logits, Some(-1), training)?;

        let mut output: Option<Variable> = None;
        for (e, expert) in self.experts.iter().enumerate() {
            let expert_out = expert.forward(&x_flat, training)?;
            let weight_col = indexing::index_select(&gate_weights, 1, &[e], training)?;
            let weighted = mul_broadcast(&expert_out, &weight_col, training)?;
            output = Some(match output {
                None => weighted,
                Some(acc) => elementwise::add(&acc, &weighted, training)?,
            });
        }
        let output = output.expect("num_experts >= 1 checked in new()");
        let output = shape_ops::reshape(&output, original_shape, training)?;

        let full_gate = softmax_ops::softmax(&logits, Some(-1), training)?;
        let avg_gate = reductions::mean_axis(&full_gate, 0, training)?;
        let log_avg_gate = elementwise::log(&avg_gate, training)?;
        let kl_terms = elementwise::mul(&avg_gate, &log_avg_gate, training)?;
        let kl_sum = reductions::sum(&kl_terms, training)?;
        let load_balance_loss = elementwise::add_scalar(&kl_sum, (self.num_experts as f32).ln(), training)?;

        let lse = self.logsumexp_axis_last(&logits, tokens, training)?;
        let z = elementwise::square(&lse, training)?;
        let z_mean = reductions::mean_axis(&z, 0, training)?;
        let auxiliary_loss = elementwise::mul_scalar(&z_mean, self.z_loss_weight, training)?;

        let weights_data = gate_weights.value();
        let mut selected_experts = Vec::with_capacity(tokens);
        let mut weights_out = Vec::with_capacity(tokens);
        for t in 0..tokens {
            let experts_t: Vec<usize> = top_indices[t * self.top_k..(t + 1) * self.top_k].to_vec();
            let weights_t: Vec<f32> = experts_t.iter().map(|&e| weights_data.data()[t * self.num_experts + e]).collect();
            selected_experts.push(experts_t);
            weights_out.push(weights_t);
        }

        Ok((
            output,
            ExpertRoutingInfo { selected_experts, weights: weights_out, load_balance_loss, auxiliary_loss },
        ))
    }
}

impl Module for MixtureOfExperts {
    fn module(&self) -> &ModuleCore {
        &self.core
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_preserves_leading_dims() {
        let moe = MixtureOfExperts::new("moe", 8, 4, 2, 16, 1.25).unwrap();
        let x = Variable::leaf(Tensor::random_normal(0.0, 1.0, Shape::new(vec![2, 3, 8]), Some(1)).unwrap(), true);
        let (y, info) = moe.forward(&x, None).unwrap();
        assert_eq!(y.shape().dims(), &[2, 3, 8]);
        assert_eq!(info.selected_experts.len(), 6);
        assert_eq!(info.weights.len(), 6);
    }

    #[test]
    fn weights_sum_to_one_per_token() {
        let moe = MixtureOfExperts::new("moe", 6, 5, 3, 12, 1.0).unwrap();
        let x = Variable::leaf(Tensor::random_normal(0.0, 1.0, Shape::new(vec![7, 6]), Some(2)).unwrap(), false);
        let (_, info) = moe.forward(&x, None).unwrap();
        for row in &info.weights {
            assert_eq!(row.len(), 3);
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-6, "sum was {}", sum);
        }
    }

    #[test]
    fn selected_experts_are_within_range_and_unique_per_token() {
        let moe = MixtureOfExperts::new("moe", 4, 4, 2, 8, 1.0).unwrap();
        let x = Variable::leaf(Tensor::random_normal(0.0, 1.0, Shape::new(vec![5, 4]), Some(3)).unwrap(), false);
        let (_, info) = moe.forward(&x, None).unwrap();
        for experts in &info.selected_experts {
            assert_eq!(experts.len(), 2);
            assert!(experts.iter().all(|&e| e < 4));
            let mut sorted = experts.clone();
            sorted.sort_unstable();
            sorted.dedup();
            assert_eq!(sorted.len(), experts.len());
        }
    }

    #[test]
    fn gradient_flows_to_router_and_selected_experts() {
        let moe = MixtureOfExperts::new("moe", 4, 3, 2, 8, 1.0).unwrap();
        let x = Variable::leaf(Tensor::ones(Shape::new(vec![2, 4])), true);
        let (y, info) = moe.forward(&x, None).unwrap();
        let loss = reductions::sum(&y, true).unwrap();
        let loss = elementwise::add(&loss, &info.load_balance_loss, true).unwrap();
        let loss = elementwise::add(&loss, &info.auxiliary_loss, true).unwrap();
        loss.backward().unwrap();
        assert!(moe.router_w.grad().is_some());
        let touched: std::collections::HashSet<usize> = info.selected_experts.iter().flatten().copied().collect();
        for &e in &touched {
            assert!(moe.experts[e].fc1_w.grad().is_some());
        }
    }

    #[test]
    fn task_bias_shifts_routing_toward_boosted_expert() {
        let moe = MixtureOfExperts::new("moe", 4, 4, 1, 8, 1.0).unwrap();
        let x = Variable::leaf(Tensor::zeros(Shape::new(vec![1, 4])), false);
        let mut bias = Tensor::zeros(Shape::new(vec![4]));
        bias.data_mut()[2] = 1000.0;
        let (_, info) = moe.forward(&x, Some(&bias)).unwrap();
        assert_eq!(info.selected_experts[0], vec![2]);
    }

    #[test]
    fn rejects_top_k_greater_than_num_experts() {
        assert!(MixtureOfExperts::new("moe", 4, 2, 3, 8, 1.0).is_err());
    }

    #[test]
    fn reset_parameters_reseeds_router_weight() {
        let moe = MixtureOfExperts::new("moe", 4, 2, 1, 8, 1.0).unwrap();
        let before = moe.router_w.value();
        moe.reset_parameters();
        let after = moe.router_w.value();
        assert_ne!(before.data(), after.data());
    }

    #[test]
    fn named_parameters_include_router_and_every_expert() {
        let moe = MixtureOfExperts::new("moe", 4, 3, 1, 8, 1.0).unwrap();
        let names: Vec<String> = moe.named_parameters("", true).into_iter().map(|(n, _)| n).collect();
        assert!(names.contains(&"router.weight".to_string()));
        assert!(names.contains(&"expert0.fc1.weight".to_string()));
        assert!(names.contains(&"expert2.fc2.bias".to_string()));
        assert_eq!(names.len(), 2 + 3 * 4);
    }
}
