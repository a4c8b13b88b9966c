//! Compile-time registry of module factories.
//!
//! The configuration's `impl_class` string keys this table; there is no
//! runtime type loading. Restarting a module creates a fresh instance from
//! the same factory.

use super::Module;
use anyhow::{anyhow, Result};
use std::collections::HashMap;

pub type ModuleFactory = Box<dyn Fn() -> Box<dyn Module> + Send + Sync>;

pub struct ModuleRegistry {
    factories: HashMap<String, ModuleFactory>,
}

impl ModuleRegistry {
    pub fn new() -> ModuleRegistry {
        ModuleRegistry {
            factories: HashMap::new(),
        }
    }

    /// Registry pre-populated with the built-in module types.
    pub fn standard() -> ModuleRegistry {
        let mut registry = ModuleRegistry::new();
        registry.register("Simulator", || Box::new(super::sim::Simulator::new()));
        registry
    }

    pub fn register<F>(&mut self, impl_class: &str, factory: F)
    where
        F: Fn() -> Box<dyn Module> + Send + Sync + 'static,
    {
        self.factories
            .insert(impl_class.to_string(), Box::new(factory));
    }

    /// Creates a fresh module instance for the given `impl_class`.
    pub fn create(&self, impl_class: &str) -> Result<Box<dyn Module>> {
        let factory = self
            .factories
            .get(impl_class)
            .ok_or_else(|| anyhow!("unknown module class '{}'", impl_class))?;
        Ok(factory())
    }

    pub fn list_classes(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_registry_has_simulator() {
        let registry = ModuleRegistry::standard();
        assert!(registry.list_classes().contains(&"Simulator".to_string()));
        registry.create("Simulator").unwrap();
    }

    #[test]
    fn unknown_class_errors() {
        let registry = ModuleRegistry::standard();
        assert!(registry.create("NoSuchClass").is_err());
    }
}
