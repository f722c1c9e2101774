//! `ModuleCore`: the registry every concrete layer composes. Implements the
//! explicit `register_*` API from the module system's contract (each fails on
//! a name collision) and the recursive traversal/mode/state-dict behavior.

use super::parameter::{Buffer, Parameter};
use super::Module;
use crate::error::{CoreError, CoreResult};
use crate::tensor::Tensor;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

pub struct ModuleCore {
    name: String,
    parameters: RefCell<Vec<(String, Parameter)>>,
    buffers: RefCell<Vec<(String, Buffer)>>,
    submodules: RefCell<Vec<(String, Rc<dyn Module>)>>,
    training: Cell<bool>,
    lazy_pending: Cell<bool>,
}

impl ModuleCore {
    pub fn new(name: impl Into<String>) -> Self {
        ModuleCore {
            name: name.into(),
            parameters: RefCell::new(Vec::new()),
            buffers: RefCell::new(Vec::new()),
            submodules: RefCell::new(Vec::new()),
            training: Cell::new(true),
            lazy_pending: Cell::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A name must be unique across parameters, buffers, *and* submodules in
    /// the same node: two categories sharing a name would collide on the same
    /// fully-qualified path in `state_dict`.
    fn name_taken(&self, name: &str) -> bool {
        self.parameters.borrow().iter().any(|(n, _)| n == name)
            || self.buffers.borrow().iter().any(|(n, _)| n == name)
            || self.submodules.borrow().iter().any(|(n, _)| n == name)
    }

    pub fn register_parameter(&self, name: impl Into<String>, param: Parameter) -> CoreResult<()> {
        let name = name.into();
        if self.name_taken(&name) {
            return Err(CoreError::NameCollision(format!("{}: parameter '{}' already registered", self.name, name)));
        }
        self.parameters.borrow_mut().push((name, param));
        Ok(())
    }

    pub fn register_buffer(&self, name: impl Into<String>, buffer: Buffer) -> CoreResult<()> {
        let name = name.into();
        if self.name_taken(&name) {
            return Err(CoreError::NameCollision(format!("{}: buffer '{}' already registered", self.name, name)));
        }
        self.buffers.borrow_mut().push((name, buffer));
        Ok(())
    }

    pub fn register_submodule(&self, name: impl Into<String>, module: Rc<dyn Module>) -> CoreResult<()> {
        let name = name.into();
        if self.name_taken(&name) {
            return Err(CoreError::NameCollision(format!("{}: submodule '{}' already registered", self.name, name)));
        }
        self.submodules.borrow_mut().push((name, module));
        Ok(())
    }

    pub fn parameter(&self, name: &str) -> Option<Parameter> {
        self.parameters.borrow().iter().find(|(n, _)| n == name).map(|(_, p)| p.clone())
    }

    pub fn buffer(&self, name: &str) -> Option<Buffer> {
        self.buffers.borrow().iter().find(|(n, _)| n == name).map(|(_, b)| b.clone())
    }

    // ---- mode -----------------------------------------------------------------

    pub fn is_training(&self) -> bool {
        self.training.get()
    }

    pub fn set_mode_recursive(&self, training: bool) {
        self.training.set(training);
        for (_, sub) in self.submodules.borrow().iter() {
            sub.module().set_mode_recursive(training);
        }
    }

    // ---- lazy init --------------------------------------------------------------

    pub fn is_lazy_pending(&self) -> bool {
        self.lazy_pending.get()
    }

    pub fn set_lazy_pending(&self, pending: bool) {
        self.lazy_pending.set(pending);
    }

    // ---- traversal --------------------------------------------------------------

    pub fn named_parameters(&self, prefix: &str, recurse: bool) -> Vec<(String, Parameter)> {
        let mut out = Vec::new();
        for (name, p) in self.parameters.borrow().iter() {
            out.push((join(prefix, name), p.clone()));
        }
        if recurse {
            for (name, sub) in self.submodules.borrow().iter() {
                let sub_prefix = join(prefix, name);
                out.extend(sub.module().named_parameters(&sub_prefix, true));
            }
        }
        out
    }

    pub fn named_buffers(&self, prefix: &str, recurse: bool) -> Vec<(String, Buffer)> {
        let mut out = Vec::new();
        for (name, b) in self.buffers.borrow().iter() {
            out.push((join(prefix, name), b.clone()));
        }
        if recurse {
            for (name, sub) in self.submodules.borrow().iter() {
                let sub_prefix = join(prefix, name);
                out.extend(sub.module().named_buffers(&sub_prefix, true));
            }
        }
        out
    }

    pub fn named_submodules(&self, prefix: &str, recurse: bool) -> Vec<(String, Rc<dyn Module>)> {
        let mut out = Vec::new();
        for (name, sub) in self.submodules.borrow().iter() {
            let sub_prefix = join(prefix, name);
            out.push((sub_prefix.clone(), sub.clone()));
            if recurse {
                out.extend(sub.module().named_submodules(&sub_prefix, true));
            }
        }
        out
    }

    pub fn clear_grads(&self) {
        for (_, p) in self.parameters.borrow().iter() {
            p.clear_grad();
        }
        for (_, sub) in self.submodules.borrow().iter() {
            sub.module().clear_grads();
        }
    }

    // ---- state dict --------------------------------------------------------------

    pub fn state_dict(&self, prefix: &str) -> HashMap<String, Tensor> {
        let mut out = HashMap::new();
        for (path, p) in self.named_parameters(prefix, true) {
            out.insert(path, p.value());
        }
        for (path, b) in self.named_buffers(prefix, true) {
            out.insert(path, b.get());
        }
        out
    }

    /// Strict mode fails if any path in `dict` has no target, any target has
    /// no entry in `dict`, or any shape mismatches. Non-strict mode skips
    /// mismatched entries, printing a warning for each to stderr and
    /// returning their paths so a caller can inspect what was dropped.
    pub fn load_state_dict(&self, dict: &HashMap<String, Tensor>, strict: bool) -> CoreResult<Vec<String>> {
        let params = self.named_parameters("", true);
        let buffers = self.named_buffers("", true);
        let mut targets: HashMap<String, Tensor> = HashMap::new();
        for (path, p) in &params {
            targets.insert(path.clone(), p.value());
        }
        for (path, b) in &buffers {
            targets.insert(path.clone(), b.get());
        }

        let mut consumed: HashSet<String> = HashSet::new();
        let mut skipped: Vec<String> = Vec::new();
        for (path, value) in dict.iter() {
            match targets.get(path) {
                None => {
                    if strict {
                        return Err(CoreError::StateDictMismatch(format!("no target for path '{}'", path)));
                    }
                    eprintln!("load_state_dict: warning: no target for path '{}', skipping", path);
                    skipped.push(path.clone());
                }
                Some(target) => {
                    if !target.shape().same_as(value.shape()) {
                        if strict {
                            return Err(CoreError::StateDictMismatch(format!(
                                "shape mismatch at '{}': target {} vs incoming {}",
                                path,
                                target.shape(),
                                value.shape()
                            )));
                        }
                        eprintln!(
                            "load_state_dict: warning: shape mismatch at '{}': target {} vs incoming {}, skipping",
                            path,
                            target.shape(),
                            value.shape()
                        );
                        skipped.push(path.clone());
                        continue;
                    }
                    consumed.insert(path.clone());
                }
            }
        }
        if strict {
            for (path, _) in targets.iter() {
                if !consumed.contains(path) {
                    return Err(CoreError::StateDictMismatch(format!("no entry in dict for target path '{}'", path)));
                }
            }
        }

        for (path, p) in &params {
            if let Some(value) = dict.get(path) {
                if p.value().shape().same_as(value.shape()) {
                    p.set_value(value.clone());
                }
            }
        }
        for (path, b) in &buffers {
            if let Some(value) = dict.get(path) {
                if b.get().shape().same_as(value.shape()) {
                    b.set(value.clone());
                }
            }
        }
        Ok(skipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::Shape;

    struct Leaf {
        core: ModuleCore,
    }
    impl Module for Leaf {
        fn module(&self) -> &ModuleCore {
            &self.core
        }
    }

    #[test]
    fn duplicate_parameter_name_is_a_collision() {
        let core = ModuleCore::new("leaf");
        core.register_parameter("weight", Parameter::new(Tensor::zeros(Shape::new(vec![2])))).unwrap();
        let err = core.register_parameter("weight", Parameter::new(Tensor::zeros(Shape::new(vec![2]))));
        assert!(err.is_err());
    }

    #[test]
    fn named_parameters_are_depth_first_with_full_paths() {
        let child_core = ModuleCore::new("child");
        child_core.register_parameter("w", Parameter::new(Tensor::zeros(Shape::new(vec![1])))).unwrap();
        let child = Rc::new(Leaf { core: child_core });

        let root = ModuleCore::new("root");
        root.register_parameter("b", Parameter::new(Tensor::zeros(Shape::new(vec![1])))).unwrap();
        root.register_submodule("child", child as Rc<dyn Module>).unwrap();

        let names: Vec<String> = root.named_parameters("", true).into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["b".to_string(), "child.w".to_string()]);
    }

    #[test]
    fn train_eval_propagate_to_submodules() {
        let child_core = ModuleCore::new("child");
        let child = Rc::new(Leaf { core: child_core });
        let root = ModuleCore::new("root");
        root.register_submodule("child", child.clone() as Rc<dyn Module>).unwrap();

        root.set_mode_recursive(false);
        assert!(!child.core.is_training());
        root.set_mode_recursive(true);
        assert!(child.core.is_training());
    }

    #[test]
    fn strict_load_fails_on_missing_target() {
        let core = ModuleCore::new("m");
        core.register_parameter("w", Parameter::new(Tensor::zeros(Shape::new(vec![2])))).unwrap();
        let mut dict = HashMap::new();
        dict.insert("w".to_string(), Tensor::zeros(Shape::new(vec![2])));
        dict.insert("ghost".to_string(), Tensor::zeros(Shape::new(vec![1])));
        assert!(core.load_state_dict(&dict, true).is_err());
        let skipped = core.load_state_dict(&dict, false).unwrap();
        assert_eq!(skipped, vec!["ghost".to_string()]);
    }
}
