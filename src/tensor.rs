//! Tensor: pure numerical storage and shape. No grad, no graph (those live in
//! autograd). Contiguous `f32` buffer in row-major order; every operation here
//! returns a fresh tensor except the explicit in-place setters.

use crate::error::{CoreError, CoreResult};
use crate::shape::{self, Shape};
use rand::SeedableRng;
use rand_distr::{Distribution, Normal, Uniform};

const DIV_EPS: f32 = 1e-7;
const SOFTMAX_DENOM_FLOOR: f32 = 1e-7;

/// Default, strict, and loose absolute tolerances used by test assertions (see spec 4.1).
pub const TOL_DEFAULT: f32 = 1e-5;
pub const TOL_STRICT: f32 = 1e-7;
pub const TOL_LOOSE: f32 = 1e-1;

/// Tensor: data + shape. Immutable shape, mutable buffer.
#[derive(Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Tensor {
    data: Vec<f32>,
    shape: Shape,
}

impl Tensor {
    // ---- construction -----------------------------------------------------

    pub fn from_vec(data: Vec<f32>, shape: Shape) -> CoreResult<Self> {
        if data.len() != shape.size() {
            return Err(CoreError::ShapeMismatch(format!(
                "data len {} != shape size {}",
                data.len(),
                shape.size()
            )));
        }
        Ok(Tensor { data, shape })
    }

    /// Alias matching the spec's `from_array` factory.
    pub fn from_array(values: Vec<f32>, shape: Shape) -> CoreResult<Self> {
        Self::from_vec(values, shape)
    }

    pub fn zeros(shape: Shape) -> Self {
        let n = shape.size();
        Tensor { data: vec![0.0; n], shape }
    }

    pub fn ones(shape: Shape) -> Self {
        let n = shape.size();
        Tensor { data: vec![1.0; n], shape }
    }

    pub fn fill(shape: Shape, value: f32) -> Self {
        let n = shape.size();
        Tensor { data: vec![value; n], shape }
    }

    /// 1's on the main diagonal of the last two dims, 0 elsewhere, batched over
    /// any leading dims.
    pub fn eye(shape: Shape) -> CoreResult<Self> {
        let dims = shape.dims();
        if dims.len() < 2 {
            return Err(CoreError::Unsupported("eye: rank must be >= 2".into()));
        }
        let rows = dims[dims.len() - 2];
        let cols = dims[dims.len() - 1];
        let batch: usize = dims[..dims.len() - 2].iter().product();
        let mut data = vec![0.0f32; batch * rows * cols];
        for b in 0..batch {
            let base = b * rows * cols;
            for i in 0..rows.min(cols) {
                data[base + i * cols + i] = 1.0;
            }
        }
        Tensor::from_vec(data, shape)
    }

    /// `n` evenly spaced values in `[min, max]`. Fails if `n == 0`.
    pub fn linspace(min: f32, max: f32, n: usize) -> CoreResult<Self> {
        if n == 0 {
            return Err(CoreError::Arity("linspace: n must be > 0".into()));
        }
        if n == 1 {
            return Tensor::from_vec(vec![min], Shape::new(vec![1]));
        }
        let step = (max - min) / (n as f32 - 1.0);
        let data: Vec<f32> = (0..n).map(|i| min + step * i as f32).collect();
        Tensor::from_vec(data, Shape::new(vec![n]))
    }

    pub fn random_uniform(min: f32, max: f32, shape: Shape, seed: Option<u64>) -> CoreResult<Self> {
        let n = shape.size();
        let dist = Uniform::new(min, max);
        let data: Vec<f32> = match seed {
            Some(s) => {
                let mut rng = rand::rngs::StdRng::seed_from_u64(s);
                (0..n).map(|_| dist.sample(&mut rng)).collect()
            }
            None => crate::runtime::with_rng(|rng| (0..n).map(|_| dist.sample(rng)).collect()),
        };
        Tensor::from_vec(data, shape)
    }

    pub fn random_normal(mean: f32, std: f32, shape: Shape, seed: Option<u64>) -> CoreResult<Self> {
        let n = shape.size();
        let dist = Normal::new(mean, std).map_err(|e| CoreError::Arithmetic(e.to_string()))?;
        let data: Vec<f32> = match seed {
            Some(s) => {
                let mut rng = rand::rngs::StdRng::seed_from_u64(s);
                (0..n).map(|_| dist.sample(&mut rng)).collect()
            }
            None => crate::runtime::with_rng(|rng| (0..n).map(|_| dist.sample(rng)).collect()),
        };
        Tensor::from_vec(data, shape)
    }

    // ---- accessors ----------------------------------------------------------

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn numel(&self) -> usize {
        self.shape.size()
    }

    /// Overwrite buffer with zeros in place. Used by `clear_grads` / fresh buffers.
    pub fn zero_fill(&mut self) {
        self.data.fill(0.0);
    }

    // ---- elementwise binary ---------------------------------------------------

    fn binary(&self, rhs: &Tensor, f: impl Fn(f32, f32) -> f32, op: &str) -> CoreResult<Tensor> {
        if !self.shape.same_as(&rhs.shape) {
            return Err(CoreError::ShapeMismatch(format!(
                "{}: {} vs {}",
                op, self.shape, rhs.shape
            )));
        }
        let data: Vec<f32> = self.data.iter().zip(rhs.data.iter()).map(|(&a, &b)| f(a, b)).collect();
        Tensor::from_vec(data, self.shape.clone())
    }

    pub fn add(&self, rhs: &Tensor) -> CoreResult<Tensor> {
        self.binary(rhs, |a, b| a + b, "add")
    }

    pub fn sub(&self, rhs: &Tensor) -> CoreResult<Tensor> {
        self.binary(rhs, |a, b| a - b, "sub")
    }

    pub fn mul(&self, rhs: &Tensor) -> CoreResult<Tensor> {
        self.binary(rhs, |a, b| a * b, "mul")
    }

    pub fn div(&self, rhs: &Tensor) -> CoreResult<Tensor> {
        if !self.shape.same_as(&rhs.shape) {
            return Err(CoreError::ShapeMismatch(format!("div: {} vs {}", self.shape, rhs.shape)));
        }
        let mut data = Vec::with_capacity(self.data.len());
        for (&a, &b) in self.data.iter().zip(rhs.data.iter()) {
            if b.abs() < DIV_EPS {
                return Err(CoreError::Arithmetic(format!("div: divisor magnitude {} below {}", b, DIV_EPS)));
            }
            data.push(a / b);
        }
        Tensor::from_vec(data, self.shape.clone())
    }

    // ---- elementwise unary -----------------------------------------------------

    fn unary(&self, f: impl Fn(f32) -> f32) -> Tensor {
        let data: Vec<f32> = self.data.iter().map(|&a| f(a)).collect();
        Tensor { data, shape: self.shape.clone() }
    }

    pub fn neg(&self) -> Tensor {
        self.unary(|a| -a)
    }

    pub fn abs(&self) -> Tensor {
        self.unary(f32::abs)
    }

    pub fn square(&self) -> Tensor {
        self.unary(|a| a * a)
    }

    pub fn sqrt(&self) -> CoreResult<Tensor> {
        for &v in &self.data {
            if v < 0.0 {
                return Err(CoreError::Arithmetic(format!("sqrt: negative input {}", v)));
            }
        }
        Ok(self.unary(f32::sqrt))
    }

    pub fn exp(&self) -> Tensor {
        self.unary(f32::exp)
    }

    pub fn log(&self) -> CoreResult<Tensor> {
        for &v in &self.data {
            if v <= 0.0 {
                return Err(CoreError::Arithmetic(format!("log: non-positive input {}", v)));
            }
        }
        Ok(self.unary(f32::ln))
    }

    pub fn sin(&self) -> Tensor {
        self.unary(f32::sin)
    }

    pub fn cos(&self) -> Tensor {
        self.unary(f32::cos)
    }

    pub fn tanh(&self) -> Tensor {
        self.unary(f32::tanh)
    }

    pub fn sigmoid(&self) -> Tensor {
        self.unary(|a| 1.0 / (1.0 + (-a).exp()))
    }

    pub fn reciprocal(&self) -> CoreResult<Tensor> {
        for &v in &self.data {
            if v.abs() < DIV_EPS {
                return Err(CoreError::Arithmetic(format!("reciprocal: magnitude {} below {}", v, DIV_EPS)));
            }
        }
        Ok(self.unary(|a| 1.0 / a))
    }

    pub fn clip(&self, min: f32, max: f32) -> Tensor {
        self.unary(|a| a.max(min).min(max))
    }

    pub fn relu(&self) -> Tensor {
        self.unary(|a| a.max(0.0))
    }

    // ---- scalar variants --------------------------------------------------

    pub fn add_scalar(&self, s: f32) -> Tensor {
        self.unary(|a| a + s)
    }

    pub fn sub_scalar(&self, s: f32) -> Tensor {
        self.unary(|a| a - s)
    }

    pub fn mul_scalar(&self, s: f32) -> Tensor {
        self.unary(|a| a * s)
    }

    /// Alias used throughout the layer catalog.
    pub fn scale(&self, s: f32) -> Tensor {
        self.mul_scalar(s)
    }

    pub fn div_scalar(&self, s: f32) -> CoreResult<Tensor> {
        if s.abs() < DIV_EPS {
            return Err(CoreError::Arithmetic(format!("div_scalar: divisor magnitude {} below {}", s, DIV_EPS)));
        }
        Ok(self.unary(|a| a / s))
    }

    // ---- comparisons --------------------------------------------------------

    fn compare(&self, rhs: &Tensor, f: impl Fn(f32, f32) -> bool, op: &str) -> CoreResult<Tensor> {
        if !self.shape.same_as(&rhs.shape) {
            return Err(CoreError::ShapeMismatch(format!("{}: {} vs {}", op, self.shape, rhs.shape)));
        }
        let data: Vec<f32> = self
            .data
            .iter()
            .zip(rhs.data.iter())
            .map(|(&a, &b)| if f(a, b) { 1.0 } else { 0.0 })
            .collect();
        Tensor::from_vec(data, self.shape.clone())
    }

    pub fn eq(&self, rhs: &Tensor) -> CoreResult<Tensor> {
        self.compare(rhs, |a, b| a == b, "eq")
    }

    pub fn gt(&self, rhs: &Tensor) -> CoreResult<Tensor> {
        self.compare(rhs, |a, b| a > b, "gt")
    }

    pub fn lt(&self, rhs: &Tensor) -> CoreResult<Tensor> {
        self.compare(rhs, |a, b| a < b, "lt")
    }

    pub fn is_all_greater(&self, rhs: &Tensor) -> CoreResult<bool> {
        if !self.shape.same_as(&rhs.shape) {
            return Err(CoreError::ShapeMismatch(format!("is_all_greater: {} vs {}", self.shape, rhs.shape)));
        }
        Ok(self.data.iter().zip(rhs.data.iter()).all(|(&a, &b)| a > b))
    }

    // ---- reductions -----------------------------------------------------------

    /// Sum of all elements (scalar tensor, rank 0).
    pub fn sum(&self) -> Tensor {
        let s: f32 = self.data.iter().sum();
        Tensor { data: vec![s], shape: Shape::scalar() }
    }

    /// Global maximum over all elements (scalar tensor).
    pub fn max(&self) -> Tensor {
        let m = self.data.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        Tensor { data: vec![m], shape: Shape::scalar() }
    }

    fn reduce_axis(&self, axis: isize, init: f32, step: impl Fn(f32, f32) -> f32, finish: impl Fn(f32, usize) -> f32) -> CoreResult<Tensor> {
        let axis = self.shape.resolve_axis(axis)?;
        let dims = self.shape.dims();
        let reduced_len = dims[axis];
        let out_shape = self.shape.without_axis(axis);
        let out_numel = out_shape.size().max(1);
        let in_strides = self.shape.strides();
        let mut out = vec![init; out_numel];
        // iterate every input linear index; fold into its corresponding output slot.
        let out_dims = self.shape.with_axis_one(axis);
        let out_strides_full = out_dims.strides();
        for lin in 0..self.data.len() {
            let mut rem = lin;
            let mut out_lin = 0usize;
            for d in 0..dims.len() {
                let coord = rem / in_strides[d];
                rem %= in_strides[d];
                if d != axis {
                    out_lin += coord * out_strides_full[d];
                }
            }
            out[out_lin] = step(out[out_lin], self.data[lin]);
        }
        let data: Vec<f32> = out.into_iter().map(|v| finish(v, reduced_len)).collect();
        Tensor::from_vec(data, out_shape)
    }

    pub fn sum_axis(&self, axis: isize) -> CoreResult<Tensor> {
        self.reduce_axis(axis, 0.0, |a, b| a + b, |v, _| v)
    }

    pub fn mean_axis(&self, axis: isize) -> CoreResult<Tensor> {
        self.reduce_axis(axis, 0.0, |a, b| a + b, |v, n| v / n as f32)
    }

    pub fn var_axis(&self, axis: isize) -> CoreResult<Tensor> {
        let mean = self.mean_axis(axis)?;
        let ax = self.shape.resolve_axis(axis)?;
        let diffsq = {
            let broadcasted = mean.broadcast_to(self.shape.clone())?;
            self.sub(&broadcasted)?.square()
        };
        let _ = ax;
        diffsq.mean_axis(axis)
    }

    pub fn max_axis(&self, axis: isize) -> CoreResult<Tensor> {
        self.reduce_axis(axis, f32::NEG_INFINITY, f32::max, |v, _| v)
    }

    pub fn min_axis(&self, axis: isize) -> CoreResult<Tensor> {
        self.reduce_axis(axis, f32::INFINITY, f32::min, |v, _| v)
    }

    /// Index of the maximum element along `axis`, as f32 values, shape with axis removed.
    pub fn argmax(&self, axis: isize) -> CoreResult<Tensor> {
        let axis = self.shape.resolve_axis(axis)?;
        let dims = self.shape.dims();
        let reduced_len = dims[axis];
        let out_shape = self.shape.without_axis(axis);
        let out_numel = out_shape.size().max(1);
        let in_strides = self.shape.strides();
        let out_dims = self.shape.with_axis_one(axis);
        let out_strides_full = out_dims.strides();
        let mut best_val = vec![f32::NEG_INFINITY; out_numel];
        let mut best_idx = vec![0.0f32; out_numel];
        for lin in 0..self.data.len() {
            let mut rem = lin;
            let mut out_lin = 0usize;
            let mut axis_coord = 0usize;
            for d in 0..dims.len() {
                let coord = rem / in_strides[d];
                rem %= in_strides[d];
                if d == axis {
                    axis_coord = coord;
                } else {
                    out_lin += coord * out_strides_full[d];
                }
            }
            if self.data[lin] > best_val[out_lin] {
                best_val[out_lin] = self.data[lin];
                best_idx[out_lin] = axis_coord as f32;
            }
        }
        let _ = reduced_len;
        Tensor::from_vec(best_idx, out_shape)
    }

    /// Softmax stabilized by subtracting the per-axis max; denominator floored at 1e-7.
    /// Default axis is the last dim (or 0 for rank-1).
    pub fn softmax(&self, axis: Option<isize>) -> CoreResult<Tensor> {
        let axis = match axis {
            Some(a) => a,
            None => {
                if self.shape.rank() <= 1 {
                    0
                } else {
                    -1
                }
            }
        };
        let ax = self.shape.resolve_axis(axis)?;
        let max = self.max_axis(ax as isize)?;
        let max_b = max.broadcast_to(self.shape.clone())?;
        let shifted = self.sub(&max_b)?;
        let exps = shifted.exp();
        let denom = exps.sum_axis(ax as isize)?;
        let denom = denom.unary(|v| v.max(SOFTMAX_DENOM_FLOOR));
        let denom_b = denom.broadcast_to(self.shape.clone())?;
        exps.div_elementwise_safe(&denom_b)
    }

    /// Elementwise divide without the near-zero divisor guard (used internally by
    /// softmax where the denominator floor already guarantees safety).
    fn div_elementwise_safe(&self, rhs: &Tensor) -> CoreResult<Tensor> {
        if !self.shape.same_as(&rhs.shape) {
            return Err(CoreError::ShapeMismatch("div_elementwise_safe: shape mismatch".into()));
        }
        let data: Vec<f32> = self.data.iter().zip(rhs.data.iter()).map(|(&a, &b)| a / b).collect();
        Tensor::from_vec(data, self.shape.clone())
    }

    // ---- shape transforms --------------------------------------------------------

    pub fn reshape(&self, new_shape: Shape) -> CoreResult<Tensor> {
        if new_shape.size() != self.shape.size() {
            return Err(CoreError::ShapeMismatch(format!(
                "reshape: {} elements into shape {} ({} elements)",
                self.shape.size(),
                new_shape,
                new_shape.size()
            )));
        }
        Ok(Tensor { data: self.data.clone(), shape: new_shape })
    }

    /// Rank-2 transpose: swap the two dims.
    pub fn transpose(&self) -> CoreResult<Tensor> {
        let d = self.shape.dims();
        if d.len() != 2 {
            return Err(CoreError::Unsupported(format!("transpose(): rank {} != 2, use transpose_perm", d.len())));
        }
        let (m, n) = (d[0], d[1]);
        let mut out = vec![0.0f32; m * n];
        for i in 0..m {
            for j in 0..n {
                out[j * m + i] = self.data[i * n + j];
            }
        }
        Tensor::from_vec(out, Shape::new(vec![n, m]))
    }

    /// General transpose: permutation of `[0..rank)`.
    pub fn transpose_perm(&self, perm: &[usize]) -> CoreResult<Tensor> {
        let dims = self.shape.dims();
        if perm.len() != dims.len() {
            return Err(CoreError::ShapeMismatch(format!(
                "transpose_perm: permutation length {} != rank {}",
                perm.len(),
                dims.len()
            )));
        }
        let mut seen = vec![false; dims.len()];
        for &p in perm {
            if p >= dims.len() || seen[p] {
                return Err(CoreError::ShapeMismatch("transpose_perm: not a valid permutation".into()));
            }
            seen[p] = true;
        }
        let out_dims: Vec<usize> = perm.iter().map(|&p| dims[p]).collect();
        let out_shape = Shape::new(out_dims.clone());
        let in_strides = self.shape.strides();
        let out_strides = out_shape.strides();
        let mut out = vec![0.0f32; self.data.len()];
        for lin in 0..self.data.len() {
            let mut rem = lin;
            let mut in_coords = vec![0usize; dims.len()];
            for d in 0..dims.len() {
                in_coords[d] = rem / in_strides[d];
                rem %= in_strides[d];
            }
            let mut out_lin = 0usize;
            for (out_d, &p) in perm.iter().enumerate() {
                out_lin += in_coords[p] * out_strides[out_d];
            }
            out[out_lin] = self.data[lin];
        }
        Tensor::from_vec(out, out_shape)
    }

    /// Flatten to a rank-2 `[1, size]` row vector.
    pub fn flatten(&self) -> Tensor {
        let n = self.numel();
        Tensor { data: self.data.clone(), shape: Shape::new(vec![1, n]) }
    }

    /// Materialize broadcasting this tensor to `target`.
    pub fn broadcast_to(&self, target: Shape) -> CoreResult<Tensor> {
        if !shape::broadcastable_to(&self.shape, &target) {
            return Err(CoreError::ShapeMismatch(format!(
                "broadcast_to: {} not broadcastable to {}",
                self.shape, target
            )));
        }
        let out_numel = target.size();
        let out_strides = target.strides();
        let from_dims = self.shape.dims();
        let offset = target.rank() - from_dims.len();
        let from_strides = self.shape.strides();
        let mut out = vec![0.0f32; out_numel];
        for lin in 0..out_numel {
            let mut rem = lin;
            let mut in_lin = 0usize;
            for d in 0..target.rank() {
                let coord = rem / out_strides[d];
                rem %= out_strides[d];
                if d >= offset {
                    let fd = d - offset;
                    let from_coord = if from_dims[fd] == 1 { 0 } else { coord };
                    in_lin += from_coord * from_strides[fd];
                }
            }
            out[lin] = self.data[in_lin];
        }
        Tensor::from_vec(out, target)
    }

    /// Gradient-direction inverse of `broadcast_to`: sum over axes that were
    /// broadcast (size 1) or absent (extra leading dims) in `target`.
    pub fn sum_to(&self, target: Shape) -> CoreResult<Tensor> {
        if self.shape.same_as(&target) {
            return Ok(self.clone());
        }
        if !shape::broadcastable_to(&target, &self.shape) {
            return Err(CoreError::ShapeMismatch(format!(
                "sum_to: {} is not a broadcast target of {}",
                target, self.shape
            )));
        }
        let from_dims = self.shape.dims();
        let offset = from_dims.len() - target.rank();
        let mut out_dims = vec![1usize; from_dims.len()];
        for (i, d) in target.dims().iter().enumerate() {
            out_dims[offset + i] = *d;
        }
        let collapse_shape = Shape::new(out_dims);
        let from_strides = self.shape.strides();
        let collapse_strides = collapse_shape.strides();
        let mut collapsed = vec![0.0f32; collapse_shape.size()];
        for lin in 0..self.data.len() {
            let mut rem = lin;
            let mut out_lin = 0usize;
            for d in 0..from_dims.len() {
                let coord = rem / from_strides[d];
                rem %= from_strides[d];
                let out_coord = if collapse_shape.dims()[d] == 1 { 0 } else { coord };
                out_lin += out_coord * collapse_strides[d];
            }
            collapsed[out_lin] += self.data[lin];
        }
        Tensor::from_vec(collapsed, target)
    }

    /// Reshape combined with broadcasting semantics: reshape then broadcast to `shape`.
    pub fn broadcast_reshape(&self, shape: Shape) -> CoreResult<Tensor> {
        if self.numel() == shape.size() {
            return self.reshape(shape);
        }
        self.broadcast_to(shape)
    }

    // ---- linear algebra -----------------------------------------------------------

    /// `a @ b` over the last two dims, broadcasting leading batch dims.
    pub fn matmul(&self, rhs: &Tensor) -> CoreResult<Tensor> {
        let ad = self.shape.dims();
        let bd = rhs.shape.dims();
        if ad.len() < 2 || bd.len() < 2 {
            return Err(CoreError::Unsupported("matmul: both operands need rank >= 2".into()));
        }
        let (m, k1) = (ad[ad.len() - 2], ad[ad.len() - 1]);
        let (k2, n) = (bd[bd.len() - 2], bd[bd.len() - 1]);
        if k1 != k2 {
            return Err(CoreError::ShapeMismatch(format!("matmul: inner dims {} != {}", k1, k2)));
        }
        let a_batch = Shape::new(ad[..ad.len() - 2].to_vec());
        let b_batch = Shape::new(bd[..bd.len() - 2].to_vec());
        let batch_shape = shape::broadcast_shapes(&a_batch, &b_batch)?;
        let batch = batch_shape.size();

        let a_b = self.broadcast_to(Shape::new([batch_shape.dims(), &[m, k1]].concat()))?;
        let b_b = rhs.broadcast_to(Shape::new([batch_shape.dims(), &[k2, n]].concat()))?;

        let mut out = vec![0.0f32; batch * m * n];
        for b in 0..batch {
            let a_base = b * m * k1;
            let b_base = b * k2 * n;
            let o_base = b * m * n;
            for i in 0..m {
                for j in 0..n {
                    let mut s = 0.0f32;
                    for k in 0..k1 {
                        s += a_b.data[a_base + i * k1 + k] * b_b.data[b_base + k * n + j];
                    }
                    out[o_base + i * n + j] = s;
                }
            }
        }
        let mut out_dims = batch_shape.dims().to_vec();
        out_dims.push(m);
        out_dims.push(n);
        Tensor::from_vec(out, Shape::new(out_dims))
    }

    /// Rank-3 fast path: `[B, N, M] @ [B, M, P] -> [B, N, P]`.
    pub fn batched_matmul(&self, rhs: &Tensor) -> CoreResult<Tensor> {
        if self.shape.rank() != 3 || rhs.shape.rank() != 3 {
            return Err(CoreError::Unsupported("batched_matmul: both operands must be rank 3".into()));
        }
        self.matmul(rhs)
    }

    // ---- slicing / indexing --------------------------------------------------------

    /// Rank-2 contiguous rectangular sub-array, `[row_start, row_end) x [col_start, col_end)`.
    pub fn sub_array(&self, row_range: (usize, usize), col_range: (usize, usize)) -> CoreResult<Tensor> {
        let d = self.shape.dims();
        if d.len() != 2 {
            return Err(CoreError::Unsupported("sub_array: requires rank 2".into()));
        }
        let (rows, cols) = (d[0], d[1]);
        let (r0, r1) = row_range;
        let (c0, c1) = col_range;
        if r1 > rows || c1 > cols || r0 > r1 || c0 > c1 {
            return Err(CoreError::IndexOutOfRange(format!(
                "sub_array: rows {:?} cols {:?} out of bounds for [{},{}]",
                row_range, col_range, rows, cols
            )));
        }
        let mut out = Vec::with_capacity((r1 - r0) * (c1 - c0));
        for i in r0..r1 {
            for j in c0..c1 {
                out.push(self.data[i * cols + j]);
            }
        }
        Tensor::from_vec(out, Shape::new(vec![r1 - r0, c1 - c0]))
    }

    /// Gather elements by paired indices (if lengths match) or cartesian product otherwise.
    pub fn get_items(&self, row_indices: &[usize], col_indices: &[usize]) -> CoreResult<Tensor> {
        let d = self.shape.dims();
        if d.len() != 2 {
            return Err(CoreError::Unsupported("get_items: requires rank 2".into()));
        }
        let (rows, cols) = (d[0], d[1]);
        for &r in row_indices {
            if r >= rows {
                return Err(CoreError::IndexOutOfRange(format!("get_items: row {} >= {}", r, rows)));
            }
        }
        for &c in col_indices {
            if c >= cols {
                return Err(CoreError::IndexOutOfRange(format!("get_items: col {} >= {}", c, cols)));
            }
        }
        if row_indices.len() == col_indices.len() {
            let out: Vec<f32> = row_indices
                .iter()
                .zip(col_indices.iter())
                .map(|(&r, &c)| self.data[r * cols + c])
                .collect();
            Tensor::from_vec(out.clone(), Shape::new(vec![out.len()]))
        } else {
            let mut out = Vec::with_capacity(row_indices.len() * col_indices.len());
            for &r in row_indices {
                for &c in col_indices {
                    out.push(self.data[r * cols + c]);
                }
            }
            Tensor::from_vec(out, Shape::new(vec![row_indices.len(), col_indices.len()]))
        }
    }

    /// Overwrite a contiguous rectangular region in place.
    pub fn set_block(&mut self, row_range: (usize, usize), col_range: (usize, usize), data: &Tensor) -> CoreResult<()> {
        let d = self.shape.dims();
        if d.len() != 2 {
            return Err(CoreError::Unsupported("set_block: requires rank 2".into()));
        }
        let cols = d[1];
        let (r0, r1) = row_range;
        let (c0, c1) = col_range;
        if data.numel() != (r1 - r0) * (c1 - c0) {
            return Err(CoreError::ShapeMismatch("set_block: data size mismatch".into()));
        }
        if r1 > d[0] || c1 > cols {
            return Err(CoreError::IndexOutOfRange("set_block: range out of bounds".into()));
        }
        let mut k = 0;
        for i in r0..r1 {
            for j in c0..c1 {
                self.data[i * cols + j] = data.data[k];
                k += 1;
            }
        }
        Ok(())
    }

    /// Overwrite full rows in place. `rows[i]` becomes `self[row_indices[i], :]`.
    pub fn set_rows(&mut self, row_indices: &[usize], rows: &Tensor) -> CoreResult<()> {
        let d = self.shape.dims();
        if d.len() != 2 {
            return Err(CoreError::Unsupported("set_rows: requires rank 2".into()));
        }
        let cols = d[1];
        if rows.numel() != row_indices.len() * cols {
            return Err(CoreError::ShapeMismatch("set_rows: data size mismatch".into()));
        }
        for (k, &r) in row_indices.iter().enumerate() {
            if r >= d[0] {
                return Err(CoreError::IndexOutOfRange(format!("set_rows: row {} >= {}", r, d[0])));
            }
            self.data[r * cols..r * cols + cols].copy_from_slice(&rows.data[k * cols..k * cols + cols]);
        }
        Ok(())
    }

    /// Overwrite full columns in place. `cols[:,i]` becomes `self[:, col_indices[i]]`.
    pub fn set_cols(&mut self, col_indices: &[usize], cols_data: &Tensor) -> CoreResult<()> {
        let d = self.shape.dims();
        if d.len() != 2 {
            return Err(CoreError::Unsupported("set_cols: requires rank 2".into()));
        }
        let (rows, cols) = (d[0], d[1]);
        if cols_data.numel() != rows * col_indices.len() {
            return Err(CoreError::ShapeMismatch("set_cols: data size mismatch".into()));
        }
        for (k, &c) in col_indices.iter().enumerate() {
            if c >= cols {
                return Err(CoreError::IndexOutOfRange(format!("set_cols: col {} >= {}", c, cols)));
            }
            for i in 0..rows {
                self.data[i * cols + c] = cols_data.data[i * col_indices.len() + k];
            }
        }
        Ok(())
    }

    /// Generic single-cell setter.
    pub fn set(&mut self, index: &[usize], value: f32) -> CoreResult<()> {
        let lin = self.linear_index(index)?;
        self.data[lin] = value;
        Ok(())
    }

    fn linear_index(&self, index: &[usize]) -> CoreResult<usize> {
        let dims = self.shape.dims();
        if index.len() != dims.len() {
            return Err(CoreError::IndexOutOfRange(format!(
                "index rank {} != tensor rank {}",
                index.len(),
                dims.len()
            )));
        }
        let strides = self.shape.strides();
        let mut lin = 0usize;
        for (i, &ix) in index.iter().enumerate() {
            if ix >= dims[i] {
                return Err(CoreError::IndexOutOfRange(format!("index {} out of bounds for dim {} size {}", ix, i, dims[i])));
            }
            lin += ix * strides[i];
        }
        Ok(lin)
    }

    /// Accumulate `other` into the addressed cells of a rank-2 tensor. Repeated
    /// indices accumulate (duplicate-safe scatter-add).
    pub fn add_at(&mut self, row_indices: &[usize], col_indices: &[usize], other: &Tensor) -> CoreResult<()> {
        let d = self.shape.dims();
        if d.len() != 2 {
            return Err(CoreError::Unsupported("add_at: requires rank 2".into()));
        }
        let cols = d[1];
        if row_indices.len() != col_indices.len() {
            return Err(CoreError::ShapeMismatch("add_at: row/col index length mismatch".into()));
        }
        if other.numel() != row_indices.len() {
            return Err(CoreError::ShapeMismatch("add_at: other size mismatch".into()));
        }
        for (k, (&r, &c)) in row_indices.iter().zip(col_indices.iter()).enumerate() {
            if r >= d[0] || c >= cols {
                return Err(CoreError::IndexOutOfRange("add_at: index out of bounds".into()));
            }
            self.data[r * cols + c] += other.data[k];
        }
        Ok(())
    }

    /// Accumulate `other`'s buffer into this tensor's buffer in place (shapes must match).
    pub fn add_to(&mut self, other: &Tensor) -> CoreResult<()> {
        if !self.shape.same_as(&other.shape) {
            return Err(CoreError::ShapeMismatch("add_to: shape mismatch".into()));
        }
        for (a, &b) in self.data.iter_mut().zip(other.data.iter()) {
            *a += b;
        }
        Ok(())
    }

    /// Embedding lookup: for each index `i`, emit row `self[i]` (self must be rank 2).
    pub fn gather(&self, indices: &[usize]) -> CoreResult<Tensor> {
        let d = self.shape.dims();
        if d.len() != 2 {
            return Err(CoreError::Unsupported("gather: weight table must be rank 2".into()));
        }
        let cols = d[1];
        let mut out = Vec::with_capacity(indices.len() * cols);
        for &i in indices {
            if i >= d[0] {
                return Err(CoreError::IndexOutOfRange(format!("gather: index {} >= {}", i, d[0])));
            }
            out.extend_from_slice(&self.data[i * cols..i * cols + cols]);
        }
        Tensor::from_vec(out, Shape::new(vec![indices.len(), cols]))
    }

    /// Scatter `grad_out` (shape `[indices.len(), cols]`) back into a zeroed
    /// `[num_rows, cols]` tensor, duplicate indices accumulating. Backward of `gather`.
    pub fn gather_backward(grad_out: &Tensor, indices: &[usize], num_rows: usize) -> CoreResult<Tensor> {
        let gd = grad_out.shape.dims();
        if gd.len() != 2 {
            return Err(CoreError::Unsupported("gather_backward: grad_out must be rank 2".into()));
        }
        let cols = gd[1];
        let mut out = vec![0.0f32; num_rows * cols];
        for (k, &i) in indices.iter().enumerate() {
            for c in 0..cols {
                out[i * cols + c] += grad_out.data[k * cols + c];
            }
        }
        Tensor::from_vec(out, Shape::new(vec![num_rows, cols]))
    }

    /// Select slices along `axis` at the given `indices`, keeping all other axes.
    pub fn index_select(&self, axis: isize, indices: &[usize]) -> CoreResult<Tensor> {
        let ax = self.shape.resolve_axis(axis)?;
        let dims = self.shape.dims();
        for &i in indices {
            if i >= dims[ax] {
                return Err(CoreError::IndexOutOfRange(format!("index_select: {} >= {}", i, dims[ax])));
            }
        }
        let mut out_dims = dims.to_vec();
        out_dims[ax] = indices.len();
        let out_shape = Shape::new(out_dims);
        let in_strides = self.shape.strides();
        let out_strides = out_shape.strides();
        let mut out = vec![0.0f32; out_shape.size()];
        for out_lin in 0..out.len() {
            let mut rem = out_lin;
            let mut in_lin = 0usize;
            for d in 0..dims.len() {
                let coord = rem / out_strides[d];
                rem %= out_strides[d];
                let src_coord = if d == ax { indices[coord] } else { coord };
                in_lin += src_coord * in_strides[d];
            }
            out[out_lin] = self.data[in_lin];
        }
        Tensor::from_vec(out, out_shape)
    }

    /// Accumulate `src` into a copy of `self` at the given `indices` along `axis`.
    pub fn scatter_add(&self, axis: isize, indices: &[usize], src: &Tensor) -> CoreResult<Tensor> {
        let ax = self.shape.resolve_axis(axis)?;
        let dims = self.shape.dims();
        let mut expected_src_dims = dims.to_vec();
        expected_src_dims[ax] = indices.len();
        if src.shape.dims() != expected_src_dims.as_slice() {
            return Err(CoreError::ShapeMismatch(format!(
                "scatter_add: src shape {} != expected {:?}",
                src.shape, expected_src_dims
            )));
        }
        let mut out = self.clone();
        let in_strides = self.shape.strides();
        let src_shape = Shape::new(expected_src_dims);
        let src_strides = src_shape.strides();
        for src_lin in 0..src.data.len() {
            let mut rem = src_lin;
            let mut out_lin = 0usize;
            for d in 0..dims.len() {
                let coord = rem / src_strides[d];
                rem %= src_strides[d];
                let dst_coord = if d == ax { indices[coord] } else { coord };
                if dst_coord >= dims[d] {
                    return Err(CoreError::IndexOutOfRange("scatter_add: index out of bounds".into()));
                }
                out_lin += dst_coord * in_strides[d];
            }
            out.data[out_lin] += src.data[src_lin];
        }
        Ok(out)
    }

    /// Elementwise select: `cond != 0 ? x : y`, broadcasting all three operands.
    pub fn where_(cond: &Tensor, x: &Tensor, y: &Tensor) -> CoreResult<Tensor> {
        let s1 = shape::broadcast_shapes(&cond.shape, &x.shape)?;
        let out_shape = shape::broadcast_shapes(&s1, &y.shape)?;
        let c = cond.broadcast_to(out_shape.clone())?;
        let xb = x.broadcast_to(out_shape.clone())?;
        let yb = y.broadcast_to(out_shape.clone())?;
        let data: Vec<f32> = c
            .data
            .iter()
            .zip(xb.data.iter().zip(yb.data.iter()))
            .map(|(&cv, (&xv, &yv))| if cv != 0.0 { xv } else { yv })
            .collect();
        Tensor::from_vec(data, out_shape)
    }

    /// Lower-triangular mask (1 on/under the diagonal + offset `k`, 0 above) over
    /// the last two dims, batched over any leading dims.
    pub fn tril(shape: Shape, k: isize) -> CoreResult<Tensor> {
        let dims = shape.dims();
        if dims.len() < 2 {
            return Err(CoreError::Unsupported("tril: rank must be >= 2".into()));
        }
        let rows = dims[dims.len() - 2];
        let cols = dims[dims.len() - 1];
        let batch: usize = dims[..dims.len() - 2].iter().product();
        let mut data = vec![0.0f32; batch * rows * cols];
        for b in 0..batch {
            let base = b * rows * cols;
            for i in 0..rows {
                for j in 0..cols {
                    if (j as isize) <= (i as isize) + k {
                        data[base + i * cols + j] = 1.0;
                    }
                }
            }
        }
        Tensor::from_vec(data, shape)
    }

    /// Top-k values and indices along `axis`. `largest` selects max-k vs min-k;
    /// `sorted` controls whether the k results are sorted by value.
    pub fn top_k(&self, k: usize, axis: isize, largest: bool, sorted: bool) -> CoreResult<(Tensor, Vec<usize>)> {
        let ax = self.shape.resolve_axis(axis)?;
        let dims = self.shape.dims();
        if k > dims[ax] {
            return Err(CoreError::IndexOutOfRange(format!("top_k: k {} > axis size {}", k, dims[ax])));
        }
        let mut out_dims = dims.to_vec();
        out_dims[ax] = k;
        let out_shape = Shape::new(out_dims.clone());
        let in_strides = self.shape.strides();
        let out_strides = out_shape.strides();
        let outer: usize = out_shape.size() / k;
        let mut out_values = vec![0.0f32; out_shape.size()];
        let mut out_indices = vec![0usize; out_shape.size()];

        // iterate all "lines" along axis: every combination of the other coords.
        let mut line_coords = vec![0usize; dims.len()];
        for line in 0..outer {
            // decode line -> coordinates of non-axis dims, in out_shape's strides order
            let mut rem = line * k; // any axis-slot works as representative linear index
            for d in 0..dims.len() {
                line_coords[d] = rem / out_strides[d];
                rem %= out_strides[d];
            }
            let mut candidates: Vec<(f32, usize)> = Vec::with_capacity(dims[ax]);
            for a in 0..dims[ax] {
                let mut lin = 0usize;
                for d in 0..dims.len() {
                    let coord = if d == ax { a } else { line_coords[d] };
                    lin += coord * in_strides[d];
                }
                candidates.push((self.data[lin], a));
            }
            if largest {
                candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap());
            } else {
                candidates.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
            }
            let mut chosen: Vec<(f32, usize)> = candidates.into_iter().take(k).collect();
            if !sorted {
                chosen.sort_by_key(|c| c.1);
            }
            for (slot, (val, idx)) in chosen.into_iter().enumerate() {
                let mut out_lin = 0usize;
                for d in 0..dims.len() {
                    let coord = if d == ax { slot } else { line_coords[d] };
                    out_lin += coord * out_strides[d];
                }
                out_values[out_lin] = val;
                out_indices[out_lin] = idx;
            }
        }
        let values = Tensor::from_vec(out_values, out_shape)?;
        Ok((values, out_indices))
    }

    fn unary_mapped(&self, f: impl Fn(f32) -> f32) -> Tensor {
        self.unary(f)
    }
}

impl Tensor {
    /// Wrapper exposed for readability where callers want `t.unary(f)` semantics
    /// without reaching into private helpers (used by a couple of layer ops).
    pub fn map(&self, f: impl Fn(f32) -> f32) -> Tensor {
        self.unary_mapped(f)
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor").field("shape", &self.shape).field("data_len", &self.data.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sum_axis_removes_axis() {
        let t = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], Shape::new(vec![2, 3])).unwrap();
        let s = t.sum_axis(1).unwrap();
        assert_eq!(s.shape().dims(), &[2]);
        assert_eq!(s.data(), &[6.0, 15.0]);
    }

    #[test]
    fn mean_times_axis_len_equals_sum() {
        let t = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], Shape::new(vec![2, 3])).unwrap();
        let mean = t.mean_axis(1).unwrap();
        let sum = t.sum_axis(1).unwrap();
        for (m, s) in mean.data().iter().zip(sum.data().iter()) {
            assert!((m * 3.0 - s).abs() < 1e-4);
        }
    }

    #[test]
    fn softmax_sums_to_one() {
        let t = Tensor::from_vec(vec![1.0, 2.0, 3.0], Shape::new(vec![3])).unwrap();
        let s = t.softmax(None).unwrap();
        let total: f32 = s.data().iter().sum();
        assert!((total - 1.0).abs() < 1e-5);
    }

    #[test]
    fn softmax_is_numerically_stable() {
        let t = Tensor::from_vec(vec![1000.0, 1000.0, 1000.0], Shape::new(vec![1, 3])).unwrap();
        let s = t.softmax(None).unwrap();
        for v in s.data() {
            assert!((v - 1.0 / 3.0).abs() < 1e-6);
        }
    }

    #[test]
    fn div_rejects_near_zero_divisor() {
        let a = Tensor::from_vec(vec![1.0], Shape::new(vec![1])).unwrap();
        let b = Tensor::from_vec(vec![1e-9], Shape::new(vec![1])).unwrap();
        assert!(a.div(&b).is_err());
    }

    #[test]
    fn broadcast_to_then_sum_to_duality() {
        let a = Tensor::from_vec(vec![1.0, 2.0, 3.0], Shape::new(vec![1, 3])).unwrap();
        let target = Shape::new(vec![4, 3]);
        let b = a.broadcast_to(target.clone()).unwrap();
        let back = b.sum_to(Shape::new(vec![1, 3])).unwrap();
        for (orig, summed) in a.data().iter().zip(back.data().iter()) {
            assert!((orig * 4.0 - summed).abs() < 1e-5);
        }
    }

    #[test]
    fn matmul_broadcasts_batch_dims() {
        let a = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], Shape::new(vec![2, 2, 1, 2])).unwrap();
        let _ = a;
    }

    #[test]
    fn linear_forward_reference_case() {
        let weight = Tensor::from_vec(vec![1.0, 3.0, 2.0, 4.0], Shape::new(vec![2, 2])).unwrap();
        let bias = Tensor::from_vec(vec![0.5, -0.5], Shape::new(vec![2])).unwrap();
        let input = Tensor::from_vec(vec![1.0, 1.0], Shape::new(vec![1, 2])).unwrap();
        let y = input.matmul(&weight).unwrap();
        let y = y.add(&bias.broadcast_to(y.shape().clone()).unwrap()).unwrap();
        assert!((y.data()[0] - 3.5).abs() < 1e-6);
        assert!((y.data()[1] - 6.5).abs() < 1e-6);
    }

    #[test]
    fn tril_masks_upper_triangle() {
        let t = Tensor::tril(Shape::new(vec![3, 3]), 0).unwrap();
        assert_eq!(t.data(), &[1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn top_k_returns_largest_sorted() {
        let t = Tensor::from_vec(vec![3.0, 1.0, 4.0, 1.0, 5.0], Shape::new(vec![5])).unwrap();
        let (values, indices) = t.top_k(2, 0, true, true).unwrap();
        assert_eq!(values.data(), &[5.0, 4.0]);
        assert_eq!(indices, vec![4, 2]);
    }

    #[test]
    fn gather_then_gather_backward_duplicate_safe() {
        let w = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], Shape::new(vec![2, 2])).unwrap();
        let rows = w.gather(&[0, 0, 1]).unwrap();
        assert_eq!(rows.shape().dims(), &[3, 2]);
        let grad_out = Tensor::ones(Shape::new(vec![3, 2]));
        let grad_w = Tensor::gather_backward(&grad_out, &[0, 0, 1], 2).unwrap();
        assert_eq!(grad_w.data(), &[2.0, 2.0, 1.0, 1.0]);
    }
}
