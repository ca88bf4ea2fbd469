//! Module registration and lifecycle hooks.
//!
//! A module registers once at startup and receives a dense index; every
//! cycle sizes its per-module config table from the registry, so config
//! lookup is an array index, not a search. Lifecycle hooks are called at
//! fixed points: `create_conf` while a cycle is being built (declare
//! zones, helpers, and module config), `init_module` once the cycle's
//! resources exist (an error here rejects the whole cycle), `init_process`
//! / `exit_process` inside each worker, and `init_master` / `exit_master`
//! in the supervisor.

use std::rc::Rc;

use crate::cycle::{Cycle, CycleBuilder};
use crate::event::Reactor;

#[derive(Debug)]
pub struct ModuleError(pub String);

impl std::fmt::Display for ModuleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ModuleError {}

impl From<&str> for ModuleError {
    fn from(s: &str) -> Self {
        ModuleError(s.to_string())
    }
}

impl From<String> for ModuleError {
    fn from(s: String) -> Self {
        ModuleError(s)
    }
}

/// A helper process declaration: forked alongside workers, runs the
/// callback on a fixed schedule instead of a reactor.
#[derive(Clone, Copy)]
pub struct HelperDecl {
    pub name: &'static str,
    pub interval_ms: u64,
    pub callback: fn(&Cycle),
}

pub trait Module {
    fn name(&self) -> &'static str;

    /// Declare configuration, shared zones, and helpers for a cycle under
    /// construction.
    fn create_conf(&self, _builder: &mut CycleBuilder) -> Result<(), ModuleError> {
        Ok(())
    }

    /// Called once per cycle after zones and listeners are set up. An
    /// error rejects the cycle wholesale; the previous cycle stays live.
    fn init_module(&self, _cycle: &Cycle) -> Result<(), ModuleError> {
        Ok(())
    }

    fn init_master(&self, _cycle: &Cycle) -> Result<(), ModuleError> {
        Ok(())
    }

    fn init_process(&self, _reactor: &mut Reactor) -> Result<(), ModuleError> {
        Ok(())
    }

    fn exit_process(&self, _reactor: &mut Reactor) {}

    fn exit_master(&self, _cycle: &Cycle) {}
}

/// Registration order defines each module's dense index.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: Vec<Rc<dyn Module>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, module: Rc<dyn Module>) -> usize {
        self.modules.push(module);
        self.modules.len() - 1
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rc<dyn Module>> {
        self.modules.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Rc<dyn Module>> {
        self.modules.get(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);
    impl Module for Named {
        fn name(&self) -> &'static str {
            self.0
        }
    }

    #[test]
    fn test_registration_yields_dense_indexes() {
        let mut reg = ModuleRegistry::new();
        let a = reg.register(Rc::new(Named("alpha")));
        let b = reg.register(Rc::new(Named("beta")));
        assert_eq!((a, b), (0, 1));
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.get(0).unwrap().name(), "alpha");
        assert_eq!(reg.get(1).unwrap().name(), "beta");
    }
}
