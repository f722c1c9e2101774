//! The module system (C3): a named tree of parameters, buffers, and
//! submodules, with mode propagation, gradient hygiene, and state-dict
//! import/export.
//!
//! Mirrors the source's deep `Function -> Module -> Layer -> concrete`
//! hierarchy as composition instead of inheritance: every concrete layer owns
//! a [`ModuleCore`] that does the bookkeeping (registration, traversal, mode,
//! state dict), and implements the small [`Module`] trait so generic code
//! (an optimizer, a checkpointer) can walk the tree without knowing the
//! concrete layer types. Submodules are held as `Rc<dyn Module>` so a
//! `ModuleCore` can record a heterogeneous set of children, the same way the
//! teacher reaches for `Arc<dyn Backend>` for dynamic composition.
//!
//! Registration mutates through `&self` (the lists live behind `RefCell`),
//! matching the autograd tape's `Rc<RefCell<..>>` interior-mutability style —
//! this is what lets a `LazyModule` register its deferred parameters from
//! inside a `forward(&self, ..)` call.

mod core;
mod lazy;
mod parameter;

pub use core::ModuleCore;
pub use lazy::LazyState;
pub use parameter::{Buffer, Parameter};

use crate::error::CoreResult;
use crate::tensor::Tensor;
use std::collections::HashMap;
use std::rc::Rc;

/// Capability shared by every layer: access to its [`ModuleCore`]. All
/// traversal, mode propagation, and state-dict behavior is provided here as
/// default methods delegating to the core, so concrete layers get them for
/// free.
pub trait Module {
    fn module(&self) -> &ModuleCore;

    fn name(&self) -> String {
        self.module().name().to_string()
    }

    /// Set training mode on this node and recursively on every submodule.
    fn train(&self) {
        self.module().set_mode_recursive(true);
    }

    /// Set eval mode on this node and recursively on every submodule.
    fn eval(&self) {
        self.module().set_mode_recursive(false);
    }

    fn is_training(&self) -> bool {
        self.module().is_training()
    }

    /// `(fully_qualified_path, parameter)` pairs, depth-first pre-order,
    /// registration order within each node.
    fn named_parameters(&self, prefix: &str, recurse: bool) -> Vec<(String, Parameter)> {
        self.module().named_parameters(prefix, recurse)
    }

    fn named_buffers(&self, prefix: &str, recurse: bool) -> Vec<(String, Buffer)> {
        self.module().named_buffers(prefix, recurse)
    }

    fn named_submodules(&self, prefix: &str, recurse: bool) -> Vec<(String, Rc<dyn Module>)> {
        self.module().named_submodules(prefix, recurse)
    }

    /// Drop every parameter's `grad` field in the subtree.
    fn clear_grads(&self) {
        self.module().clear_grads();
    }

    /// Every parameter and buffer reachable from this node, keyed by
    /// fully-qualified path.
    fn state_dict(&self) -> HashMap<String, Tensor> {
        self.module().state_dict("")
    }

    /// Returns the paths skipped in non-strict mode (always empty when
    /// `strict` is true, since any mismatch there is a hard error instead).
    fn load_state_dict(&self, dict: &HashMap<String, Tensor>, strict: bool) -> CoreResult<Vec<String>> {
        self.module().load_state_dict(dict, strict)
    }
}
