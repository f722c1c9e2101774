//! Scaled dot-product multi-head attention, plus the KV-cache used for
//! incremental decoding. The cache is plain data owned by the caller (not a
//! `Module` buffer): its reads feed into attention as non-differentiable
//! leaves, matching inference-time use where nothing upstream of the cache
//! needs a gradient.

use crate::autograd::ops::{elementwise, matmul, reductions, shape_ops, softmax as softmax_ops};
use crate::autograd::Variable;
use crate::error::{CoreError, CoreResult};
use crate::init;
use crate::module::{Module, ModuleCore, Parameter};
use crate::nn::dropout::Dropout;
use crate::nn::support::{additive_mask, constant};
use crate::shape::Shape;
use crate::tensor::Tensor;
use std::rc::Rc;

fn projection(in_out: usize) -> Tensor {
    let mut data = Tensor::zeros(Shape::new(vec![in_out, in_out]));
    init::xavier_uniform_(&mut data, 1.0);
    data
}

fn project(x: &Variable, weight: &Parameter, training: bool) -> CoreResult<Variable> {
    let w_t = shape_ops::transpose(weight.variable(), training)?;
    matmul::matmul(x, &w_t, training)
}

fn split_heads(x: &Variable, batch: usize, seq: usize, num_heads: usize, head_dim: usize, training: bool) -> CoreResult<Variable> {
    let reshaped = shape_ops::reshape(x, Shape::new(vec![batch, seq, num_heads, head_dim]), training)?;
    shape_ops::transpose_perm(&reshaped, &[0, 2, 1, 3], training)
}

fn merge_heads(x: &Variable, batch: usize, seq: usize, num_heads: usize, head_dim: usize, training: bool) -> CoreResult<Variable> {
    let swapped = shape_ops::transpose_perm(x, &[0, 2, 1, 3], training)?;
    shape_ops::reshape(&swapped, Shape::new(vec![batch, seq, num_heads * head_dim]), training)
}

/// Raw `[batch, heads, max_seq_len, head_dim]` index into row-major data.
fn cache_index(heads: usize, max_seq_len: usize, head_dim: usize, b: usize, h: usize, t: usize, d: usize) -> usize {
    (((b * heads + h) * max_seq_len) + t) * head_dim + d
}

/// Owned by the inference driver, not by the attention module: K/V for
/// positions `>= current_len` are undefined and must not be read.
pub struct KvCache {
    batch: usize,
    heads: usize,
    head_dim: usize,
    max_seq_len: usize,
    current_len: usize,
    k_store: Tensor,
    v_store: Tensor,
}

impl KvCache {
    pub fn new(batch: usize, heads: usize, head_dim: usize, max_seq_len: usize) -> Self {
        let shape = Shape::new(vec![batch, heads, max_seq_len, head_dim]);
        KvCache {
            batch,
            heads,
            head_dim,
            max_seq_len,
            current_len: 0,
            k_store: Tensor::zeros(shape.clone()),
            v_store: Tensor::zeros(shape),
        }
    }

    pub fn current_len(&self) -> usize {
        self.current_len
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    /// Writes `k_new`/`v_new` (each `[batch, heads, new_len, head_dim]`) at
    /// `[start_pos, start_pos + new_len)` and advances `current_len`.
    pub fn write(&mut self, start_pos: usize, k_new: &Tensor, v_new: &Tensor) -> CoreResult<()> {
        let dims = k_new.shape().dims().to_vec();
        let shape_ok = dims.len() == 4 && dims[0] == self.batch && dims[1] == self.heads && dims[3] == self.head_dim;
        if !shape_ok || v_new.shape().dims() != dims.as_slice() {
            return Err(CoreError::ShapeMismatch(format!(
                "KvCache::write: expected [{}, {}, new_len, {}], got k={} v={}",
                self.batch,
                self.heads,
                self.head_dim,
                k_new.shape(),
                v_new.shape()
            )));
        }
        let new_len = dims[2];
        if start_pos + new_len > self.max_seq_len {
            return Err(CoreError::CacheOverflow(format!(
                "KvCache: start_pos {} + new_len {} exceeds max_seq_len {}",
                start_pos, new_len, self.max_seq_len
            )));
        }
        let kd = k_new.data();
        let vd = v_new.data();
        for b in 0..self.batch {
            for h in 0..self.heads {
                for t in 0..new_len {
                    for d in 0..self.head_dim {
                        let src = ((b * self.heads + h) * new_len + t) * self.head_dim + d;
                        let dst = cache_index(self.heads, self.max_seq_len, self.head_dim, b, h, start_pos + t, d);
                        self.k_store.data_mut()[dst] = kd[src];
                        self.v_store.data_mut()[dst] = vd[src];
                    }
                }
            }
        }
        self.current_len = start_pos + new_len;
        Ok(())
    }

    /// The live prefix `[batch, heads, current_len, head_dim]` of each store.
    pub fn read_prefix(&self) -> (Tensor, Tensor) {
        let len = self.current_len;
        let mut k = vec![0.0f32; self.batch * self.heads * len * self.head_dim];
        let mut v = vec![0.0f32; self.batch * self.heads * len * self.head_dim];
        for b in 0..self.batch {
            for h in 0..self.heads {
                for t in 0..len {
                    for d in 0..self.head_dim {
                        let src = cache_index(self.heads, self.max_seq_len, self.head_dim, b, h, t, d);
                        let dst = ((b * self.heads + h) * len + t) * self.head_dim + d;
                        k[dst] = self.k_store.data()[src];
                        v[dst] = self.v_store.data()[src];
                    }
                }
            }
        }
        let shape = Shape::new(vec![self.batch, self.heads, len, self.head_dim]);
        (Tensor::from_vec(k, shape.clone()).expect("size matches shape"), Tensor::from_vec(v, shape).expect("size matches shape"))
    }
}

/// `d_model`/`num_heads` split, no per-projection bias (matches the spec's
/// four bare `[d_model, d_model]` weight matrices).
pub struct MultiHeadAttention {
    core: ModuleCore,
    pub w_q: Parameter,
    pub w_k: Parameter,
    pub w_v: Parameter,
    pub w_o: Parameter,
    d_model: usize,
    num_heads: usize,
    head_dim: usize,
    dropout: Option<Rc<Dropout>>,
}

impl MultiHeadAttention {
    pub fn new(name: impl Into<String>, d_model: usize, num_heads: usize, dropout_p: Option<f32>) -> CoreResult<Self> {
        if num_heads == 0 || d_model % num_heads != 0 {
            return Err(CoreError::ShapeMismatch(format!("MultiHeadAttention: num_heads {} must divide d_model {}", num_heads, d_model)));
        }
        let name = name.into();
        let core = ModuleCore::new(name.clone());
        let w_q = Parameter::new(projection(d_model));
        let w_k = Parameter::new(projection(d_model));
        let w_v = Parameter::new(projection(d_model));
        let w_o = Parameter::new(projection(d_model));
        core.register_parameter("w_q", w_q.clone()).expect("fresh module: no collision");
        core.register_parameter("w_k", w_k.clone()).expect("fresh module: no collision");
        core.register_parameter("w_v", w_v.clone()).expect("fresh module: no collision");
        core.register_parameter("w_o", w_o.clone()).expect("fresh module: no collision");
        let dropout = match dropout_p {
            Some(p) => {
                let d = Rc::new(Dropout::new(format!("{}.dropout", name), p)?);
                core.register_submodule("dropout", d.clone() as Rc<dyn Module>)?;
                Some(d)
            }
            None => None,
        };
        Ok(MultiHeadAttention { core, w_q, w_k, w_v, w_o, d_model, num_heads, head_dim: d_model / num_heads, dropout })
    }

    fn check_input(&self, x: &Variable, label: &str) -> CoreResult<(usize, usize)> {
        let dims = x.shape().dims().to_vec();
        if dims.len() != 3 || dims[2] != self.d_model {
            return Err(CoreError::ShapeMismatch(format!(
                "{}: {} expected [batch, seq, {}], got {}",
                self.core.name(),
                label,
                self.d_model,
                x.shape()
            )));
        }
        Ok((dims[0], dims[1]))
    }

    fn scaled_dot_product(
        &self,
        q: &Variable,
        k: &Variable,
        v: &Variable,
        batch: usize,
        seq_q: usize,
        seq_k: usize,
        mask: Option<&Tensor>,
        training: bool,
    ) -> CoreResult<Variable> {
        let k_t = shape_ops::transpose_perm(k, &[0, 1, 3, 2], training)?;
        let raw_scores = matmul::matmul(q, &k_t, training)?;
        let scale = 1.0 / (self.head_dim as f32).sqrt();
        let scores = elementwise::mul_scalar(&raw_scores, scale, training)?;

        let masked = match mask {
            Some(m) => {
                let additive = additive_mask(m);
                let additive_v = constant(additive);
                let reshaped = shape_ops::reshape(&additive_v, Shape::new(vec![1, 1, seq_q, seq_k]), training)?;
                let broadcast = shape_ops::broadcast_to(&reshaped, Shape::new(vec![batch, self.num_heads, seq_q, seq_k]), training)?;
                elementwise::add(&scores, &broadcast, training)?
            }
            None => scores,
        };

        let weights = softmax_ops::softmax(&masked, Some(-1), training)?;
        let weights = match &self.dropout {
            Some(d) => d.forward(&weights)?,
            None => weights,
        };
        matmul::matmul(&weights, v, training)
    }

    /// Full self/cross attention over `[batch, seq, d_model]` tensors.
    pub fn forward(&self, q: &Variable, k: &Variable, v: &Variable, mask: Option<&Tensor>) -> CoreResult<Variable> {
        let (batch, seq_q) = self.check_input(q, "query")?;
        let (_, seq_k) = self.check_input(k, "key")?;
        self.check_input(v, "value")?;
        let training = self.core.is_training();

        let q_proj = split_heads(&project(q, &self.w_q, training)?, batch, seq_q, self.num_heads, self.head_dim, training)?;
        let k_proj = split_heads(&project(k, &self.w_k, training)?, batch, seq_k, self.num_heads, self.head_dim, training)?;
        let v_proj = split_heads(&project(v, &self.w_v, training)?, batch, seq_k, self.num_heads, self.head_dim, training)?;

        let attended = self.scaled_dot_product(&q_proj, &k_proj, &v_proj, batch, seq_q, seq_k, mask, training)?;
        let merged = merge_heads(&attended, batch, seq_q, self.num_heads, self.head_dim, training)?;
        project(&merged, &self.w_o, training)
    }

    /// Incremental decoding: projects only the new step's `q`/`k`/`v`, writes
    /// the new K/V into `cache` at `start_pos`, and attends over the cache's
    /// live prefix (length `start_pos + new_len`).
    pub fn forward_with_cache(
        &self,
        q: &Variable,
        k: &Variable,
        v: &Variable,
        cache: &mut KvCache,
        start_pos: usize,
        mask: Option<&Tensor>,
    ) -> CoreResult<Variable> {
        let (batch, new_len) = self.check_input(q, "query")?;
        self.check_input(k, "key")?;
        self.check_input(v, "value")?;
        let training = self.core.is_training();

        let q_proj = split_heads(&project(q, &self.w_q, training)?, batch, new_len, self.num_heads, self.head_dim, training)?;
        let k_new = split_heads(&project(k, &self.w_k, training)?, batch, new_len, self.num_heads, self.head_dim, training)?;
        let v_new = split_heads(&project(v, &self.w_v, training)?, batch, new_len, self.num_heads, self.head_dim, training)?;

        cache.write(start_pos, &k_new.value(), &v_new.value())?;
        let (k_full, v_full) = cache.read_prefix();
        let seq_k = cache.current_len();
        let k_var = Variable::leaf(k_full, false);
        let v_var = Variable::leaf(v_full, false);

        let attended = self.scaled_dot_product(&q_proj, &k_var, &v_var, batch, new_len, seq_k, mask, training)?;
        let merged = merge_heads(&attended, batch, new_len, self.num_heads, self.head_dim, training)?;
        project(&merged, &self.w_o, training)
    }
}

impl Module for MultiHeadAttention {
    fn module(&self) -> &ModuleCore {
        &self.core
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_output_shape_matches_query() {
        let mha = MultiHeadAttention::new("mha", 8, 2, None).unwrap();
        let x = Variable::leaf(Tensor::random_normal(0.0, 1.0, Shape::new(vec![2, 5, 8]), Some(1)).unwrap(), true);
        let y = mha.forward(&x, &x, &x, None).unwrap();
        assert_eq!(y.shape().dims(), &[2, 5, 8]);
    }

    #[test]
    fn causal_mask_blocks_future_keys() {
        let mha = MultiHeadAttention::new("mha", 4, 1, None).unwrap();
        let seq = 3;
        let x = Variable::leaf(Tensor::random_normal(0.0, 1.0, Shape::new(vec![1, seq, 4]), Some(2)).unwrap(), false);
        let mask = crate::nn::support::causal_mask(seq).unwrap();
        let y = mha.forward(&x, &x, &x, Some(&mask)).unwrap();
        assert_eq!(y.shape().dims(), &[1, seq, 4]);
    }

    #[test]
    fn gradient_flows_to_all_projections() {
        let mha = MultiHeadAttention::new("mha", 4, 2, None).unwrap();
        let x = Variable::leaf(Tensor::ones(Shape::new(vec![1, 2, 4])), true);
        let y = mha.forward(&x, &x, &x, None).unwrap();
        let loss = reductions::sum(&y, true).unwrap();
        loss.backward().unwrap();
        assert!(mha.w_q.grad().is_some());
        assert!(mha.w_o.grad().is_some());
    }

    #[test]
    fn kv_cache_incremental_matches_full_forward() {
        let mha = MultiHeadAttention::new("mha", 4, 2, None).unwrap();
        let full = Variable::leaf(
            Tensor::from_vec((0..8).map(|i| i as f32 * 0.1).collect(), Shape::new(vec![1, 2, 4])).unwrap(),
            false,
        );
        let full_out = mha.forward(&full, &full, &full, None).unwrap();

        let mut cache = KvCache::new(1, 2, 2, 4);
        let step0 = Variable::leaf(full.value().sub_array((0, 1), (0, 4)).unwrap(), false);
        let step0 = shape_ops::reshape(&step0, Shape::new(vec![1, 1, 4]), false).unwrap();
        let out0 = mha.forward_with_cache(&step0, &step0, &step0, &mut cache, 0, None).unwrap();
        assert_eq!(out0.shape().dims(), &[1, 1, 4]);
        assert_eq!(cache.current_len(), 1);

        let step1 = Variable::leaf(full.value().sub_array((1, 2), (0, 4)).unwrap(), false);
        let step1 = shape_ops::reshape(&step1, Shape::new(vec![1, 1, 4]), false).unwrap();
        let out1 = mha.forward_with_cache(&step1, &step1, &step1, &mut cache, 1, None).unwrap();
        assert_eq!(cache.current_len(), 2);

        for (a, b) in full_out.value().data()[0..4].iter().zip(out0.value().data().iter()) {
            assert!((a - b).abs() < 1e-4);
        }
        for (a, b) in full_out.value().data()[4..8].iter().zip(out1.value().data().iter()) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn cache_overflow_is_rejected() {
        let mut cache = KvCache::new(1, 1, 2, 2);
        let k = Tensor::zeros(Shape::new(vec![1, 1, 2, 2]));
        assert!(cache.write(1, &k, &k).is_err());
    }

    #[test]
    fn rejects_num_heads_not_dividing_d_model() {
        assert!(MultiHeadAttention::new("mha", 5, 2, None).is_err());
    }
}
