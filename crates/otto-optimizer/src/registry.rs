//! Optimizer variants selected by logical class name.

use std::collections::HashMap;

use otto_core::{Error, Result};
use otto_tunables::TunableGroups;

use crate::optimizer::{Optimizer, OptimizerConfig};
use crate::random::{MockOptimizer, RandomOptimizer};

/// Factory closure building one optimizer variant.
pub type OptimizerFactory =
    Box<dyn Fn(&TunableGroups, &OptimizerConfig) -> Result<Box<dyn Optimizer>> + Send + Sync>;

/// Name -> factory registry; replaces dynamic class loading.
pub struct OptimizerRegistry {
    factories: HashMap<String, OptimizerFactory>,
}

impl OptimizerRegistry {
    /// Registry with the built-in variants: `random` and `mock`.
    /// Model-based engines plug in through [`OptimizerRegistry::register`].
    pub fn with_builtin() -> Self {
        let mut registry = OptimizerRegistry {
            factories: HashMap::new(),
        };
        registry.register("random", |tunables, config| {
            Ok(Box::new(RandomOptimizer::new(tunables.clone(), config)?))
        });
        registry.register("mock", |tunables, config| {
            Ok(Box::new(MockOptimizer::new(tunables.clone(), config)?))
        });
        registry
    }

    pub fn register<F>(&mut self, class_name: &str, factory: F)
    where
        F: Fn(&TunableGroups, &OptimizerConfig) -> Result<Box<dyn Optimizer>>
            + Send
            + Sync
            + 'static,
    {
        self.factories
            .insert(class_name.to_string(), Box::new(factory));
    }

    /// Build an optimizer by class name; unknown names are a configuration
    /// error.
    pub fn build(
        &self,
        class_name: &str,
        tunables: &TunableGroups,
        config: &OptimizerConfig,
    ) -> Result<Box<dyn Optimizer>> {
        let factory = self.factories.get(class_name).ok_or_else(|| {
            Error::config(format!("unknown optimizer class: {class_name}"))
        })?;
        factory(tunables, config)
    }
}

impl Default for OptimizerRegistry {
    fn default() -> Self {
        OptimizerRegistry::with_builtin()
    }
}
