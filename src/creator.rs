//! Instance creation
//!
//! The engine never constructs objects itself: it asks an [`InstanceCreator`]
//! for a new instance of a concrete type. [`FactoryCreator`] is the default,
//! a factory table keyed by type, paired with the bindings decoded from the
//! woven modules.

use crate::component::Component;
use crate::error::{HookError, InjectionError, Result};
use crate::instance::Instance;
use crate::loader::{ModuleSet, TypeBinding};
use crate::type_key::TypeKey;
use ahash::RandomState;
use dashmap::DashMap;
use std::sync::Arc;

#[cfg(feature = "logging")]
use tracing::{debug, trace};

/// Creates instances of concrete types
pub trait InstanceCreator: Send + Sync {
    /// Create a new instance of a concrete type
    fn create(&self, concrete: &TypeKey) -> Result<Instance>;

    /// Binding used for instances of `type_key`, also for external instances
    fn binding(&self, type_key: &TypeKey) -> Arc<TypeBinding>;

    /// Drop cached creation state
    fn reset(&self);
}

/// Type-erased component factory
type ComponentFactory =
    Arc<dyn Fn() -> std::result::Result<Arc<dyn Component>, HookError> + Send + Sync>;

/// Factory-table creator.
///
/// Uses `DashMap` with `ahash` so registration and creation can happen from
/// any thread.
///
/// # Example
///
/// ```rust
/// use tree_injector::{Component, FactoryCreator, Inject, InstanceCreator, TypeKey};
///
/// #[derive(Default)]
/// struct Audio;
/// impl Inject for Audio {}
/// impl Component for Audio {}
///
/// let creator = FactoryCreator::new();
/// creator.register_default::<Audio>("Game.Audio");
///
/// let instance = creator.create(&TypeKey::new("Game.Audio")).unwrap();
/// assert!(instance.downcast_ref::<Audio>().is_some());
/// assert_eq!(creator.created_count(&TypeKey::new("Game.Audio")), 1);
/// ```
pub struct FactoryCreator {
    factories: DashMap<TypeKey, ComponentFactory, RandomState>,
    bindings: DashMap<TypeKey, Arc<TypeBinding>, RandomState>,
    created: DashMap<TypeKey, u64, RandomState>,
}

impl Default for FactoryCreator {
    fn default() -> Self {
        Self::new()
    }
}

impl FactoryCreator {
    /// Create an empty creator
    pub fn new() -> Self {
        Self {
            factories: DashMap::with_capacity_and_hasher_and_shard_amount(0, RandomState::new(), 8),
            bindings: DashMap::with_capacity_and_hasher_and_shard_amount(0, RandomState::new(), 8),
            created: DashMap::with_capacity_and_hasher_and_shard_amount(0, RandomState::new(), 8),
        }
    }

    /// Create a creator bound to every class of the loaded modules
    pub fn from_modules(modules: &ModuleSet) -> Result<Self> {
        let creator = Self::new();
        for (type_key, binding) in modules.bindings()? {
            creator.bindings.insert(type_key, binding);
        }

        #[cfg(feature = "logging")]
        debug!(target: "tree_injector", bindings = creator.bindings.len(), "Instance creator bound to modules");

        Ok(creator)
    }

    /// Register a factory for a concrete type
    pub fn register<T, F>(&self, type_key: impl Into<TypeKey>, factory: F) -> &Self
    where
        T: Component,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.register_fallible(type_key, move || Ok(factory()))
    }

    /// Register a factory through `Default`
    pub fn register_default<T: Component + Default>(&self, type_key: impl Into<TypeKey>) -> &Self {
        self.register(type_key, T::default)
    }

    /// Register a factory that may fail
    pub fn register_fallible<T, F>(&self, type_key: impl Into<TypeKey>, factory: F) -> &Self
    where
        T: Component,
        F: Fn() -> std::result::Result<T, HookError> + Send + Sync + 'static,
    {
        let type_key = type_key.into();

        #[cfg(feature = "logging")]
        trace!(target: "tree_injector", type_name = %type_key, "Registering factory");

        self.factories.insert(
            type_key,
            Arc::new(move || factory().map(|object| Arc::new(object) as Arc<dyn Component>)),
        );
        self
    }

    /// Override the binding of a type
    pub fn bind(&self, binding: TypeBinding) -> &Self {
        self.bindings.insert(binding.type_key.clone(), Arc::new(binding));
        self
    }

    pub fn contains(&self, type_key: &TypeKey) -> bool {
        self.factories.contains_key(type_key)
    }

    /// Instances created for `type_key` since the last reset
    pub fn created_count(&self, type_key: &TypeKey) -> u64 {
        self.created.get(type_key).map(|count| *count).unwrap_or(0)
    }
}

impl InstanceCreator for FactoryCreator {
    fn create(&self, concrete: &TypeKey) -> Result<Instance> {
        let factory = self
            .factories
            .get(concrete)
            .map(|factory| Arc::clone(factory.value()))
            .ok_or_else(|| InjectionError::NoFactory {
                type_name: concrete.to_string(),
            })?;

        let object = factory().map_err(|error| InjectionError::CreationFailed {
            type_name: concrete.to_string(),
            reason: error.to_string(),
        })?;

        *self.created.entry(concrete.clone()).or_insert(0) += 1;

        let instance = Instance::new(concrete.clone(), object, self.binding(concrete));

        #[cfg(feature = "logging")]
        trace!(target: "tree_injector", instance = %instance, "Created instance");

        Ok(instance)
    }

    fn binding(&self, type_key: &TypeKey) -> Arc<TypeBinding> {
        self.bindings
            .get(type_key)
            .map(|binding| Arc::clone(binding.value()))
            .unwrap_or_else(|| Arc::new(TypeBinding::empty(type_key.clone())))
    }

    fn reset(&self) {
        #[cfg(feature = "logging")]
        debug!(target: "tree_injector", "Resetting instance creator");
        self.created.clear();
    }
}
