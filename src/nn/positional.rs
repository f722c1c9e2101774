//! Sinusoidal positional encoding: a `[max_len, d_model]` table precomputed
//! once at construction and added to the input on every forward call.

use crate::autograd::ops::{elementwise, shape_ops};
use crate::autograd::Variable;
use crate::error::{CoreError, CoreResult};
use crate::module::{Buffer, Module, ModuleCore};
use crate::nn::dropout::Dropout;
use crate::nn::support::constant;
use crate::shape::Shape;
use crate::tensor::Tensor;
use std::rc::Rc;

fn build_table(max_len: usize, d_model: usize) -> Tensor {
    let mut data = vec![0.0f32; max_len * d_model];
    for p in 0..max_len {
        for i in 0..d_model {
            let pair = (i / 2) as f32;
            let exponent = 2.0 * pair / d_model as f32;
            let angle = p as f32 / 10000f32.powf(exponent);
            data[p * d_model + i] = if i % 2 == 0 { angle.sin() } else { angle.cos() };
        }
    }
    Tensor::from_vec(data, Shape::new(vec![max_len, d_model])).expect("fixed-size buffer matches shape")
}

pub struct PositionalEncoding {
    core: ModuleCore,
    table: Buffer,
    max_len: usize,
    d_model: usize,
    dropout: Option<Rc<Dropout>>,
}

impl PositionalEncoding {
    pub fn new(name: impl Into<String>, d_model: usize, max_len: usize, dropout_p: Option<f32>) -> CoreResult<Self> {
        let name = name.into();
        let core = ModuleCore::new(name.clone());
        let table = Buffer::new(build_table(max_len, d_model));
        core.register_buffer("table", table.clone()).expect("fresh module: no collision");
        let dropout = match dropout_p {
            Some(p) => {
                let d = Rc::new(Dropout::new(format!("{}.dropout", name), p)?);
                core.register_submodule("dropout", d.clone() as Rc<dyn Module>)?;
                Some(d)
            }
            None => None,
        };
        Ok(PositionalEncoding { core, table, max_len, d_model, dropout })
    }

    pub fn forward(&self, x: &Variable) -> CoreResult<Variable> {
        let dims = x.shape().dims().to_vec();
        if dims.len() != 3 || dims[2] != self.d_model {
            return Err(CoreError::ShapeMismatch(format!(
                "{}: expected [batch, seq, {}], got {}",
                self.core.name(),
                self.d_model,
                x.shape()
            )));
        }
        let (batch, seq) = (dims[0], dims[1]);
        if seq > self.max_len {
            return Err(CoreError::ShapeMismatch(format!(
                "{}: sequence length {} exceeds max_len {}",
                self.core.name(),
                seq,
                self.max_len
            )));
        }
        let training = self.core.is_training();
        let full = self.table.get();
        let prefix = full.sub_array((0, seq), (0, self.d_model))?;
        let prefix_3d = shape_ops::reshape(&constant(prefix), Shape::new(vec![1, seq, self.d_model]), training)?;
        let prefix_b = shape_ops::broadcast_to(&prefix_3d, Shape::new(vec![batch, seq, self.d_model]), training)?;
        let added = elementwise::add(x, &prefix_b, training)?;
        match &self.dropout {
            Some(d) => d.forward(&added),
            None => Ok(added),
        }
    }
}

impl Module for PositionalEncoding {
    fn module(&self) -> &ModuleCore {
        &self.core
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_matches_sin_cos_formula_at_origin() {
        let pe = PositionalEncoding::new("pe", 4, 10, None).unwrap();
        let row0 = pe.table.get();
        // position 0: sin(0) = 0, cos(0) = 1, for every pair.
        assert_eq!(row0.data()[0], 0.0);
        assert_eq!(row0.data()[1], 1.0);
    }

    #[test]
    fn forward_adds_prefix_broadcast_over_batch() {
        let pe = PositionalEncoding::new("pe", 4, 10, None).unwrap();
        let x = Variable::leaf(Tensor::zeros(Shape::new(vec![2, 3, 4])), false);
        let y = pe.forward(&x).unwrap();
        let table = pe.table.get();
        let prefix = table.sub_array((0, 3), (0, 4)).unwrap();
        for b in 0..2 {
            for i in 0..12 {
                assert_eq!(y.value().data()[b * 12 + i], prefix.data()[i]);
            }
        }
    }

    #[test]
    fn sequence_longer_than_max_len_errors() {
        let pe = PositionalEncoding::new("pe", 4, 5, None).unwrap();
        let x = Variable::leaf(Tensor::zeros(Shape::new(vec![1, 6, 4])), false);
        assert!(pe.forward(&x).is_err());
    }
}
