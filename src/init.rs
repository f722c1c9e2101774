//! Weight initialization: the named distributions a layer's `reset_parameters`
//! draws from. Every function here is a pure `(tensor, options) -> ()` contract:
//! it overwrites the tensor's buffer in place and never touches its shape.

use crate::runtime::with_rng;
use crate::tensor::Tensor;
use rand::Rng;
use rand_distr::{Distribution, Normal};

/// Nonlinearity used to pick a Kaiming/Xavier gain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Nonlinearity {
    Relu,
    LeakyRelu,
    Tanh,
    Sigmoid,
    Linear,
}

/// Which fan to normalize against in Kaiming init.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FanMode {
    FanIn,
    FanOut,
}

/// `gain` for a nonlinearity, following the table in the layer catalog: relu ->
/// sqrt(2), tanh -> 5/3, sigmoid/linear -> 1. `a` is the negative slope for
/// leaky_relu: `gain = sqrt(2 / (1 + a^2))`.
pub fn calculate_gain(nonlinearity: Nonlinearity, a: f32) -> f32 {
    match nonlinearity {
        Nonlinearity::Relu => 2.0f32.sqrt(),
        Nonlinearity::LeakyRelu => (2.0 / (1.0 + a * a)).sqrt(),
        Nonlinearity::Tanh => 5.0 / 3.0,
        Nonlinearity::Sigmoid | Nonlinearity::Linear => 1.0,
    }
}

/// Fan-in/fan-out for a weight tensor: the trailing dims (everything after the
/// first) multiply into fan_in, the leading dim multiplies with any receptive
/// field into fan_out. For a rank < 2 tensor both fans equal its size.
pub fn fan_in_and_fan_out(t: &Tensor) -> (usize, usize) {
    let dims = t.shape().dims();
    if dims.len() < 2 {
        let n = t.numel().max(1);
        return (n, n);
    }
    let receptive: usize = dims[2..].iter().product::<usize>().max(1);
    let fan_out = dims[0] * receptive;
    let fan_in = dims[1] * receptive;
    (fan_in, fan_out)
}

pub fn zeros_(t: &mut Tensor) {
    t.zero_fill();
}

pub fn ones_(t: &mut Tensor) {
    for v in t.data_mut() {
        *v = 1.0;
    }
}

pub fn constant_(t: &mut Tensor, value: f32) {
    for v in t.data_mut() {
        *v = value;
    }
}

pub fn uniform_(t: &mut Tensor, min: f32, max: f32) {
    with_rng(|rng| {
        for v in t.data_mut() {
            *v = rng.gen_range(min..=max);
        }
    });
}

pub fn normal_(t: &mut Tensor, mean: f32, std: f32) {
    let dist = Normal::new(mean, std).expect("normal_: std must be finite and positive");
    with_rng(|rng| {
        for v in t.data_mut() {
            *v = dist.sample(rng);
        }
    });
}

/// `Uniform(-bound, bound)` where `bound = gain * sqrt(6 / (fan_in + fan_out))`.
pub fn xavier_uniform_(t: &mut Tensor, gain: f32) {
    let (fan_in, fan_out) = fan_in_and_fan_out(t);
    let bound = gain * (6.0 / (fan_in + fan_out) as f32).sqrt();
    uniform_(t, -bound, bound);
}

/// `Normal(0, std)` where `std = gain * sqrt(2 / (fan_in + fan_out))`.
pub fn xavier_normal_(t: &mut Tensor, gain: f32) {
    let (fan_in, fan_out) = fan_in_and_fan_out(t);
    let std = gain * (2.0 / (fan_in + fan_out) as f32).sqrt();
    normal_(t, 0.0, std);
}

fn kaiming_std(t: &Tensor, a: f32, mode: FanMode, nonlinearity: Nonlinearity) -> f32 {
    let (fan_in, fan_out) = fan_in_and_fan_out(t);
    let fan = match mode {
        FanMode::FanIn => fan_in,
        FanMode::FanOut => fan_out,
    };
    let gain = calculate_gain(nonlinearity, a);
    gain / (fan as f32).sqrt()
}

/// `Uniform(-bound, bound)` where `bound = std * sqrt(3)` and `std` follows
/// the Kaiming recipe for the chosen fan and nonlinearity.
pub fn kaiming_uniform_(t: &mut Tensor, a: f32, mode: FanMode, nonlinearity: Nonlinearity) {
    let std = kaiming_std(t, a, mode, nonlinearity);
    let bound = std * 3.0f32.sqrt();
    uniform_(t, -bound, bound);
}

pub fn kaiming_normal_(t: &mut Tensor, a: f32, mode: FanMode, nonlinearity: Nonlinearity) {
    let std = kaiming_std(t, a, mode, nonlinearity);
    normal_(t, 0.0, std);
}

/// Orthogonal init via Gram-Schmidt on a random Gaussian matrix (rank-2 only).
/// No SVD routine is pulled in for this pedagogical core, so ill-conditioned or
/// non-2D tensors fall back to `xavier_uniform_` as the spec allows.
pub fn orthogonal_(t: &mut Tensor, gain: f32) {
    let dims = t.shape().dims().to_vec();
    if dims.len() != 2 {
        xavier_uniform_(t, gain);
        return;
    }
    let (rows, cols) = (dims[0], dims[1]);
    let n = rows.max(cols);
    let mut mat = vec![vec![0.0f32; n]; n];
    with_rng(|rng| {
        let dist = Normal::new(0.0, 1.0).unwrap();
        for row in mat.iter_mut() {
            for v in row.iter_mut() {
                *v = dist.sample(rng);
            }
        }
    });
    // classical Gram-Schmidt; falls back to xavier if a column collapses (norm ~ 0).
    for i in 0..n {
        for j in 0..i {
            let dot: f32 = (0..n).map(|k| mat[k][i] * mat[k][j]).sum();
            for k in 0..n {
                mat[k][i] -= dot * mat[k][j];
            }
        }
        let norm: f32 = (0..n).map(|k| mat[k][i] * mat[k][i]).sum::<f32>().sqrt();
        if norm < 1e-7 {
            xavier_uniform_(t, gain);
            return;
        }
        for k in 0..n {
            mat[k][i] /= norm;
        }
    }
    let mut data = Vec::with_capacity(rows * cols);
    for r in 0..rows {
        for c in 0..cols {
            data.push(gain * mat[r][c]);
        }
    }
    t.data_mut().copy_from_slice(&data);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::Shape;

    #[test]
    fn gain_table_matches_spec() {
        assert!((calculate_gain(Nonlinearity::Relu, 0.0) - 2.0f32.sqrt()).abs() < 1e-6);
        assert!((calculate_gain(Nonlinearity::Tanh, 0.0) - 5.0 / 3.0).abs() < 1e-6);
        assert_eq!(calculate_gain(Nonlinearity::Linear, 0.0), 1.0);
        assert_eq!(calculate_gain(Nonlinearity::Sigmoid, 0.0), 1.0);
    }

    #[test]
    fn fan_in_out_rank2() {
        let t = Tensor::zeros(Shape::new(vec![8, 4]));
        let (fan_in, fan_out) = fan_in_and_fan_out(&t);
        assert_eq!(fan_in, 4);
        assert_eq!(fan_out, 8);
    }

    #[test]
    fn zeros_and_ones_fill_correctly() {
        let mut t = Tensor::ones(Shape::new(vec![3]));
        zeros_(&mut t);
        assert_eq!(t.data(), &[0.0, 0.0, 0.0]);
        ones_(&mut t);
        assert_eq!(t.data(), &[1.0, 1.0, 1.0]);
    }

    #[test]
    fn orthogonal_rows_are_unit_norm() {
        crate::runtime::set_seed(7);
        let mut t = Tensor::zeros(Shape::new(vec![4, 4]));
        orthogonal_(&mut t, 1.0);
        for r in 0..4 {
            let norm: f32 = (0..4).map(|c| {
                let v = t.data()[r * 4 + c];
                v * v
            }).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-3);
        }
    }
}
