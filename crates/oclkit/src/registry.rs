//! Named lookup of built programs.

use crate::context::Context;
use crate::error::{OclError, Result};
use crate::program::Program;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Thread-safe map from name to shared [`Program`].
///
/// Owned by the application and passed to whoever needs it; entries live
/// until replaced, removed or evicted. Each call is atomic on its own, but
/// a lookup followed by a use is not protected against a concurrent
/// re-registration of the same name.
#[derive(Debug, Default)]
pub struct ProgramRegistry {
    programs: RwLock<HashMap<String, Arc<Program>>>,
}

impl ProgramRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `program` under `name`, returning the entry it replaces.
    pub fn register(&self, name: impl Into<String>, program: impl Into<Arc<Program>>) -> Option<Arc<Program>> {
        let name = name.into();
        debug!(program = %name, "program registered");
        self.programs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, program.into())
    }

    pub fn get(&self, name: &str) -> Result<Arc<Program>> {
        self.try_get(name)
            .ok_or_else(|| OclError::NoSuchProgram(name.to_string()))
    }

    pub fn try_get(&self, name: &str) -> Option<Arc<Program>> {
        self.programs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Program>> {
        self.programs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.programs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .programs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.programs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.programs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Drop every program created against `context`; run this alongside
    /// [`Context::release`]. Returns the number of entries removed.
    pub fn evict_context(&self, context: &Context) -> usize {
        let mut programs = self.programs.write().unwrap_or_else(PoisonError::into_inner);
        let before = programs.len();
        programs.retain(|_, program| !program.context().same_as(context));
        let evicted = before - programs.len();
        if evicted > 0 {
            debug!(evicted, "programs evicted with their context");
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OclConfig;
    use crate::driver::mock::MockDriver;
    use std::thread;

    fn context() -> (Arc<MockDriver>, Context) {
        let mock = Arc::new(MockDriver::new());
        let ctx = Context::open(mock.clone(), &OclConfig::default()).unwrap();
        (mock, ctx)
    }

    #[test]
    fn register_get_replace_remove() {
        let (_mock, ctx) = context();
        let registry = ProgramRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.register("blur", Program::new(&ctx)).is_none());

        let replacement = Arc::new(Program::new(&ctx));
        let old = registry.register("blur", replacement.clone()).unwrap();
        assert!(!Arc::ptr_eq(&old, &replacement));
        assert!(Arc::ptr_eq(&registry.get("blur").unwrap(), &replacement));

        let err = registry.get("sharpen").unwrap_err();
        assert_eq!(err.to_string(), "no such program: 'sharpen'");
        assert!(registry.try_get("sharpen").is_none());

        registry.register("add", Program::new(&ctx));
        assert_eq!(registry.names(), ["add", "blur"]);
        assert!(registry.remove("blur").is_some());
        assert!(!registry.contains("blur"));
        registry.clear();
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn eviction_releases_programs_of_one_context() {
        let (mock, ctx) = context();
        let other = Context::open(mock.clone(), &OclConfig::default()).unwrap();
        let registry = ProgramRegistry::new();

        let mut program = Program::new(&ctx);
        program.add_source_code("__kernel void k(int a) {}").unwrap();
        program.create_from_source().unwrap();
        registry.register("k", program);
        registry.register("other", Program::new(&other));

        assert_eq!(registry.evict_context(&ctx), 1);
        assert_eq!(registry.names(), ["other"]);
        assert_eq!(mock.stats().programs_released, 1);
        ctx.release().unwrap();
        assert!(ctx.is_released());
    }

    #[test]
    fn concurrent_registration_and_lookup() {
        let (_mock, ctx) = context();
        let registry = Arc::new(ProgramRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                let ctx = ctx.clone();
                thread::spawn(move || {
                    let name = format!("p{i}");
                    registry.register(name.clone(), Program::new(&ctx));
                    registry.get(&name).is_ok()
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }
        assert_eq!(registry.len(), 8);
    }
}
