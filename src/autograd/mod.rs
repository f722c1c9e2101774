//! Dynamic reverse-mode autograd: `Variable` (the source calls it AutogradNode),
//! the `Op` capability each differentiable step implements, and the tape itself.
//!
//! Unlike an arena-of-nodes design, a `Variable` is a reference-counted handle
//! (`Rc<RefCell<...>>`) so that identity is "compared by reference, never by
//! value" and `unchain_backward` can sever exactly the links reachable from one
//! node without touching unrelated graphs.

pub mod check;
pub mod ops;

pub use check::{check_gradients, numerical_grad};

use crate::error::{CoreError, CoreResult};
use crate::tensor::Tensor;
use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::rc::{Rc, Weak};

/// A differentiable step recorded on the tape. Implementations are single-use:
/// `forward` is called exactly once and may stash whatever `backward` needs.
pub trait Op {
    fn forward(&mut self, inputs: &[Tensor]) -> CoreResult<Vec<Tensor>>;
    fn backward(&self, grad_outputs: &[Tensor]) -> CoreResult<Vec<Option<Tensor>>>;
    fn name(&self) -> &'static str;
}

struct OpNode {
    op: Box<dyn Op>,
    inputs: Vec<Variable>,
    outputs: RefCell<Vec<Weak<RefCell<VarInner>>>>,
}

struct VarInner {
    value: Tensor,
    grad: Option<Tensor>,
    creator: Option<Rc<OpNode>>,
    requires_grad: bool,
    name: Option<String>,
    generation: usize,
}

/// Reference-counted autograd node. Cloning a `Variable` clones the handle, not
/// the tensor — both clones observe the same grad/creator slots.
#[derive(Clone)]
pub struct Variable(Rc<RefCell<VarInner>>);

impl Variable {
    /// Create a detached leaf (a user input or a `Parameter`'s backing node).
    pub fn leaf(value: Tensor, requires_grad: bool) -> Self {
        Variable(Rc::new(RefCell::new(VarInner {
            value,
            grad: None,
            creator: None,
            requires_grad,
            name: None,
            generation: 0,
        })))
    }

    pub fn with_name(self, name: impl Into<String>) -> Self {
        self.0.borrow_mut().name = Some(name.into());
        self
    }

    pub fn name(&self) -> Option<String> {
        self.0.borrow().name.clone()
    }

    pub fn value(&self) -> Tensor {
        self.0.borrow().value.clone()
    }

    /// Overwrite the underlying tensor in place (used by optimizers and by
    /// `load_state_dict`). Only safe on a leaf whose creator is not live — see
    /// the in-place mutability note in the module system design.
    pub fn set_value(&self, value: Tensor) {
        self.0.borrow_mut().value = value;
    }

    pub fn grad(&self) -> Option<Tensor> {
        self.0.borrow().grad.clone()
    }

    pub fn set_grad(&self, grad: Tensor) {
        self.0.borrow_mut().grad = Some(grad);
    }

    pub fn clear_grad(&self) {
        self.0.borrow_mut().grad = None;
    }

    pub fn requires_grad(&self) -> bool {
        self.0.borrow().requires_grad
    }

    pub fn set_requires_grad(&self, flag: bool) {
        self.0.borrow_mut().requires_grad = flag;
    }

    pub fn shape(&self) -> crate::shape::Shape {
        self.0.borrow().value.shape().clone()
    }

    fn generation(&self) -> usize {
        self.0.borrow().generation
    }

    fn set_generation(&self, g: usize) {
        self.0.borrow_mut().generation = g;
    }

    fn creator(&self) -> Option<Rc<OpNode>> {
        self.0.borrow().creator.clone()
    }

    fn set_creator(&self, node: Rc<OpNode>) {
        self.0.borrow_mut().creator = Some(node);
    }

    fn clear_creator(&self) {
        self.0.borrow_mut().creator = None;
    }

    fn accumulate_grad(&self, g: Tensor) -> CoreResult<()> {
        let mut inner = self.0.borrow_mut();
        match &inner.grad {
            None => inner.grad = Some(g),
            Some(existing) => {
                let summed = existing.add(&g)?;
                inner.grad = Some(summed);
            }
        }
        Ok(())
    }

    /// `true` if `self` and `other` are the same underlying node.
    pub fn is_same_node(&self, other: &Variable) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Reverse-topological walk from this node, by DFS post-order over the
    /// recorded op DAG (any order visiting a node only after all of its
    /// downstream consumers is valid per the traversal contract).
    fn reverse_topo_order(&self) -> Vec<Rc<OpNode>> {
        let mut visited: HashSet<usize> = HashSet::new();
        let mut order = Vec::new();
        fn dfs(var: &Variable, visited: &mut HashSet<usize>, order: &mut Vec<Rc<OpNode>>) {
            if let Some(node) = var.creator() {
                let key = Rc::as_ptr(&node) as usize;
                if !visited.insert(key) {
                    return;
                }
                for input in &node.inputs {
                    dfs(input, visited, order);
                }
                order.push(node);
            }
        }
        dfs(self, &mut visited, &mut order);
        order.reverse();
        order
    }

    /// Seed this node's gradient with ones (if absent) and walk the tape
    /// backward, accumulating gradients into every reachable leaf.
    pub fn backward(&self) -> CoreResult<()> {
        if self.grad().is_none() {
            self.set_grad(Tensor::ones(self.value().shape().clone()));
        }
        for node in self.reverse_topo_order() {
            let grad_outputs: Vec<Tensor> = node
                .outputs
                .borrow()
                .iter()
                .map(|w| {
                    let rc = w.upgrade().expect("output Variable dropped while its creator is still live");
                    let inner = rc.borrow();
                    inner.grad.clone().unwrap_or_else(|| Tensor::zeros(inner.value.shape().clone()))
                })
                .collect();
            let input_grads = node.op.backward(&grad_outputs)?;
            if input_grads.len() != node.inputs.len() {
                return Err(CoreError::Arity(format!(
                    "{}: backward returned {} grads for {} inputs",
                    node.op.name(),
                    input_grads.len(),
                    node.inputs.len()
                )));
            }
            for (input, g) in node.inputs.iter().zip(input_grads.into_iter()) {
                if let Some(g) = g {
                    let target_shape = input.value().shape().clone();
                    let g = if g.shape().same_as(&target_shape) { g } else { g.sum_to(target_shape)? };
                    input.accumulate_grad(g)?;
                }
            }
        }
        Ok(())
    }

    /// Sever this node's creator link, and recursively sever every creator
    /// link reachable through it. Used by RNNs to cap backprop-through-time.
    pub fn unchain_backward(&self) {
        if let Some(node) = self.creator() {
            self.clear_creator();
            for input in &node.inputs {
                input.unchain_backward();
            }
        }
    }

    /// Sever only this node's own creator link, keeping upstream nodes intact.
    pub fn unchain(&self) {
        self.clear_creator();
    }
}

impl fmt::Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.0.borrow();
        f.debug_struct("Variable")
            .field("name", &inner.name)
            .field("shape", &inner.value.shape())
            .field("requires_grad", &inner.requires_grad)
            .field("has_grad", &inner.grad.is_some())
            .field("has_creator", &inner.creator.is_some())
            .finish()
    }
}

/// Graph-build predicate: record an Op (and wire up creator links) only when
/// training mode is active and at least one input requires a gradient.
fn should_build(training: bool, inputs: &[Variable]) -> bool {
    training && inputs.iter().any(|v| v.requires_grad())
}

/// Run `op.forward` over `inputs`, producing fresh output Variables, and
/// (per the graph-build predicate) wire up the tape entry linking them.
pub fn apply(mut op: Box<dyn Op>, inputs: Vec<Variable>, training: bool) -> CoreResult<Vec<Variable>> {
    if inputs.is_empty() {
        return Err(CoreError::NullInput(format!("{}: no inputs", op.name())));
    }
    let tensors: Vec<Tensor> = inputs.iter().map(|v| v.value()).collect();
    let outputs = op.forward(&tensors)?;
    let build = should_build(training, &inputs);
    let generation = inputs.iter().map(|v| v.generation()).max().unwrap_or(0) + 1;

    let out_vars: Vec<Variable> = outputs.into_iter().map(|t| Variable::leaf(t, build)).collect();
    if build {
        for v in &out_vars {
            v.set_generation(generation);
        }
        let node = Rc::new(OpNode {
            op,
            inputs,
            outputs: RefCell::new(out_vars.iter().map(|v| Rc::downgrade(&v.0)).collect()),
        });
        for v in &out_vars {
            v.set_creator(node.clone());
        }
    }
    Ok(out_vars)
}

/// Convenience wrapper for single-output ops.
pub fn apply1(op: Box<dyn Op>, inputs: Vec<Variable>, training: bool) -> CoreResult<Variable> {
    let mut outs = apply(op, inputs, training)?;
    Ok(outs.remove(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::ops::elementwise::square;
    use crate::shape::Shape;

    #[test]
    fn gradient_of_square_matches_spec_example() {
        let x = Variable::leaf(Tensor::from_vec(vec![3.0], Shape::new(vec![1])).unwrap(), true);
        let y = square(&x, true).unwrap();
        y.backward().unwrap();
        assert!((x.grad().unwrap().data()[0] - 6.0).abs() < 1e-6);
    }

    #[test]
    fn no_grad_recorded_outside_training_mode() {
        let x = Variable::leaf(Tensor::from_vec(vec![3.0], Shape::new(vec![1])).unwrap(), true);
        let y = square(&x, false).unwrap();
        assert!(y.creator().is_none());
    }

    #[test]
    fn unchain_backward_severs_reachable_creators() {
        let x = Variable::leaf(Tensor::from_vec(vec![2.0], Shape::new(vec![1])).unwrap(), true);
        let y = square(&x, true).unwrap();
        let z = square(&y, true).unwrap();
        assert!(z.creator().is_some());
        z.unchain_backward();
        assert!(z.creator().is_none());
        assert!(y.creator().is_none());
    }

    #[test]
    fn diamond_graph_accumulates_gradient_from_both_paths() {
        let x = Variable::leaf(Tensor::from_vec(vec![2.0], Shape::new(vec![1])).unwrap(), true);
        let a = square(&x, true).unwrap();
        let b = square(&x, true).unwrap();
        let sum = crate::autograd::ops::elementwise::add(&a, &b, true).unwrap();
        sum.backward().unwrap();
        // d/dx [x^2 + x^2] = 4x = 8
        assert!((x.grad().unwrap().data()[0] - 8.0).abs() < 1e-6);
    }
}
