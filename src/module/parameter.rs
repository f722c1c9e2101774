//! `Parameter` and `Buffer`: the two kinds of named tensor a `Module` owns.
//! Both are reference-counted handles (cheap `Clone`, shared identity) so a
//! concrete layer can keep a typed field (`self.weight: Parameter`) and also
//! hand the same handle to its `ModuleCore` registry without duplicating the
//! underlying storage.

use crate::autograd::Variable;
use crate::tensor::Tensor;
use std::cell::RefCell;
use std::rc::Rc;

/// An `AutogradNode` whose `requires_grad` defaults to `true` and whose value
/// is the owned learnable tensor. Identity semantics match `Variable`.
#[derive(Clone)]
pub struct Parameter(Variable);

impl Parameter {
    pub fn new(data: Tensor) -> Self {
        Parameter(Variable::leaf(data, true))
    }

    pub fn variable(&self) -> &Variable {
        &self.0
    }

    pub fn value(&self) -> Tensor {
        self.0.value()
    }

    /// Overwrite the parameter's backing tensor (used by `reset_parameters`,
    /// an optimizer step, and `load_state_dict`).
    pub fn set_value(&self, data: Tensor) {
        self.0.set_value(data);
    }

    pub fn grad(&self) -> Option<Tensor> {
        self.0.grad()
    }

    pub fn clear_grad(&self) {
        self.0.clear_grad();
    }

    pub fn requires_grad(&self) -> bool {
        self.0.requires_grad()
    }
}

impl From<Variable> for Parameter {
    fn from(v: Variable) -> Self {
        v.set_requires_grad(true);
        Parameter(v)
    }
}

/// A named tensor attached to a module that is serialized with the module but
/// not differentiated (BatchNorm running stats, RNN hidden state, the
/// precomputed positional-encoding table).
#[derive(Clone)]
pub struct Buffer(Rc<RefCell<Tensor>>);

impl Buffer {
    pub fn new(value: Tensor) -> Self {
        Buffer(Rc::new(RefCell::new(value)))
    }

    pub fn get(&self) -> Tensor {
        self.0.borrow().clone()
    }

    pub fn set(&self, value: Tensor) {
        *self.0.borrow_mut() = value;
    }
}
