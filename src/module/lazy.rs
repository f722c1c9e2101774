//! Shared bookkeeping for lazy modules: observe an inferred dimension on the
//! first forward call, then demand it stay fixed on every subsequent call.

use crate::error::{CoreError, CoreResult};
use std::cell::Cell;

/// Holds one lazily-inferred dimension (e.g. `in_features`, `in_channels`).
/// `LazyLinear`/`LazyConv2d` each own one; a layer with more than one deferred
/// dimension would hold more than one `LazyState`.
pub struct LazyState {
    inferred: Cell<Option<usize>>,
}

impl LazyState {
    pub fn new() -> Self {
        LazyState { inferred: Cell::new(None) }
    }

    pub fn is_pending(&self) -> bool {
        self.inferred.get().is_none()
    }

    pub fn get(&self) -> Option<usize> {
        self.inferred.get()
    }

    /// First call records `observed`; every later call must see the same
    /// value, or this is a fatal `LazyInitFailure` per the module contract.
    pub fn resolve(&self, observed: usize, context: &str) -> CoreResult<usize> {
        match self.inferred.get() {
            None => {
                self.inferred.set(Some(observed));
                Ok(observed)
            }
            Some(prev) if prev == observed => Ok(prev),
            Some(prev) => Err(CoreError::LazyInitFailure(format!(
                "{}: inferred dimension changed from {} to {} across forwards",
                context, prev, observed
            ))),
        }
    }
}

impl Default for LazyState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_resolve_sets_then_subsequent_must_match() {
        let lazy = LazyState::new();
        assert_eq!(lazy.resolve(4, "test").unwrap(), 4);
        assert!(!lazy.is_pending());
        assert_eq!(lazy.resolve(4, "test").unwrap(), 4);
        assert!(lazy.resolve(5, "test").is_err());
    }
}
