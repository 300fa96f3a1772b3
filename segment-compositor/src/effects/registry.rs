//! Effect registry
//!
//! Maps effect identifiers to their definitions. New effects are added by
//! registering another definition; dispatch never changes.

use std::collections::HashMap;
use std::sync::Arc;

use super::builtin;
use super::traits::{Effect, EffectDefinition, EffectError, EffectSettings};

pub struct EffectRegistry {
    effects: HashMap<String, Arc<dyn EffectDefinition>>,
}

impl Default for EffectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EffectRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            effects: HashMap::new(),
        }
    }

    /// Registry holding every builtin effect
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        builtin::register_builtin_effects(&mut registry);
        registry
    }

    /// Register an effect definition, replacing one with the same id
    pub fn register(&mut self, definition: impl EffectDefinition + 'static) {
        self.effects
            .insert(definition.effect_type().to_string(), Arc::new(definition));
    }

    pub fn get(&self, effect_type: &str) -> Option<Arc<dyn EffectDefinition>> {
        self.effects.get(effect_type).cloned()
    }

    pub fn contains(&self, effect_type: &str) -> bool {
        self.effects.contains_key(effect_type)
    }

    /// Registered ids, sorted
    pub fn effect_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.effects.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.effects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    /// Instantiate an effect by id.
    pub fn create(&self, effect_type: &str, settings: &EffectSettings) -> Result<Box<dyn Effect>, EffectError> {
        self.get(effect_type)
            .map(|definition| definition.create(settings))
            .ok_or_else(|| EffectError::UnknownEffect(effect_type.to_string()))
    }
}
