//! Injection context
//!
//! The [`InjectionContext`] owns the instance tree, drives the per-instance
//! lifecycle and dispatches item notifications. Instances go through
//! `UnResolved → Resolving → Initializing → Initialized`; the first two
//! transitions happen synchronously in [`InjectionContext::resolve_instance`],
//! the last one in a background Tokio task that waits on the instance's
//! recorded needs.
//!
//! A context is meant to be driven from a single logical thread (a game loop,
//! an event loop or one async task). Internal state is guarded for memory
//! safety only: calling into the same context from several threads at once
//! is unsupported and may interleave lifecycle steps arbitrarily.

use crate::asserter::Asserter;
use crate::attributes;
use crate::component::{Component, ItemObserver};
use crate::creator::InstanceCreator;
use crate::error::{HookError, InjectionError, Result};
use crate::hierarchy::Hierarchy;
use crate::instance::{Halt, Instance, InstanceData, LifecycleState, Milestone};
use crate::resolver::TypeResolver;
use crate::type_key::TypeKey;
use ahash::RandomState;
use dashmap::DashMap;
use futures::future::join_all;
use futures::FutureExt;
use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

#[cfg(feature = "logging")]
use tracing::{debug, error, trace, warn};

struct ContextInner {
    resolver: Arc<dyn TypeResolver>,
    creator: Arc<dyn InstanceCreator>,
    asserter: Option<Arc<dyn Asserter>>,
    hierarchy: Mutex<Hierarchy<Instance>>,
    instances: DashMap<Instance, Arc<InstanceData>, RandomState>,
    observers: DashMap<TypeKey, Vec<Instance>, RandomState>,
    root_token: Mutex<CancellationToken>,
    module_type: TypeKey,
    disposed: AtomicBool,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        self.root_token
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }
}

/// Runtime injection engine.
///
/// Cheap to clone; clones share the same instance tree. Background tasks only
/// hold weak references, so dropping the last clone cancels every pending
/// initialization and update loop.
///
/// Every operation requires a Tokio runtime on the calling thread: creating
/// an instance spawns its initialization task.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use tree_injector::{Component, FactoryCreator, Inject, InjectionContext, RegistryTypeResolver, TypeKey};
///
/// #[derive(Default)]
/// struct Audio;
/// impl Inject for Audio {}
/// impl Component for Audio {}
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let resolver = RegistryTypeResolver::new(
///     vec![vec![TypeKey::new("Game.Audio"), TypeKey::new("Game.IAudio")]],
///     [TypeKey::new("Game.Audio")],
/// );
/// let creator = FactoryCreator::new();
/// creator.register_default::<Audio>("Game.Audio");
///
/// let context = InjectionContext::new(Arc::new(resolver), Arc::new(creator));
/// let audio = context.get_instance("Game.IAudio", None).unwrap();
///
/// context.initialized(&audio).unwrap().wait().await.unwrap();
/// assert_eq!(context.len(), 1);
/// # }
/// ```
#[derive(Clone)]
pub struct InjectionContext {
    inner: Arc<ContextInner>,
}

impl InjectionContext {
    /// Create a context without an asserter; fatal errors are logged and returned
    pub fn new(resolver: Arc<dyn TypeResolver>, creator: Arc<dyn InstanceCreator>) -> Self {
        Self::build(resolver, creator, None)
    }

    /// Create a context reporting every fatal error to `asserter`
    pub fn with_asserter(
        resolver: Arc<dyn TypeResolver>,
        creator: Arc<dyn InstanceCreator>,
        asserter: Arc<dyn Asserter>,
    ) -> Self {
        Self::build(resolver, creator, Some(asserter))
    }

    fn build(
        resolver: Arc<dyn TypeResolver>,
        creator: Arc<dyn InstanceCreator>,
        asserter: Option<Arc<dyn Asserter>>,
    ) -> Self {
        #[cfg(feature = "logging")]
        debug!(target: "tree_injector", asserter = asserter.is_some(), "Creating injection context");

        Self {
            inner: Arc::new(ContextInner {
                resolver,
                creator,
                asserter,
                hierarchy: Mutex::new(Hierarchy::new()),
                instances: DashMap::with_capacity_and_hasher_and_shard_amount(
                    0,
                    RandomState::new(),
                    8,
                ),
                observers: DashMap::with_capacity_and_hasher_and_shard_amount(
                    0,
                    RandomState::new(),
                    8,
                ),
                root_token: Mutex::new(CancellationToken::new()),
                module_type: TypeKey::new(attributes::MODULE),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn resolver(&self) -> &Arc<dyn TypeResolver> {
        &self.inner.resolver
    }

    pub fn creator(&self) -> &Arc<dyn InstanceCreator> {
        &self.inner.creator
    }

    // =========================================================================
    // Creation
    // =========================================================================

    /// Create and attach one instance of `type_key` under `owner` (root when `None`).
    ///
    /// When the owner already holds a compatible instance, that instance is
    /// returned instead of a new one.
    pub fn add_instance(&self, type_key: impl Into<TypeKey>, owner: Option<&Instance>) -> Result<Instance> {
        let type_key = type_key.into();

        #[cfg(feature = "logging")]
        trace!(target: "tree_injector", type_name = %type_key, owner = ?owner.map(ToString::to_string), "Adding instance");

        let result = self.add_one(&type_key, owner);
        self.report(result)
    }

    /// Create one instance of every implementation of `type_key` under `owner`.
    ///
    /// Implementations already represented among the owner's children are not
    /// created again. Returns the new instances followed by the existing ones.
    pub fn add_instances(&self, type_key: impl Into<TypeKey>, owner: Option<&Instance>) -> Result<Vec<Instance>> {
        let type_key = type_key.into();

        #[cfg(feature = "logging")]
        trace!(target: "tree_injector", type_name = %type_key, owner = ?owner.map(ToString::to_string), "Adding instances");

        let result = self.add_all(&type_key, owner);
        self.report(result)
    }

    /// Attach an object constructed outside of the engine.
    ///
    /// Fails with [`InjectionError::AlreadyOwned`] when the owner already
    /// holds an instance compatible with `type_key`.
    pub fn add_external_instance<T: Component>(
        &self,
        type_key: impl Into<TypeKey>,
        object: Arc<T>,
        owner: Option<&Instance>,
        auto_resolve: bool,
    ) -> Result<Instance> {
        let type_key = type_key.into();

        #[cfg(feature = "logging")]
        trace!(target: "tree_injector", type_name = %type_key, auto_resolve, "Adding external instance");

        let result = self.add_external(type_key, object, owner, auto_resolve);
        self.report(result)
    }

    fn add_external(
        &self,
        type_key: TypeKey,
        object: Arc<dyn Component>,
        owner: Option<&Instance>,
        auto_resolve: bool,
    ) -> Result<Instance> {
        self.ensure_live()?;
        if let Some(owner) = owner {
            self.data(owner)?;
        }
        if !self.compatible_children(owner, &type_key).is_empty() {
            return Err(InjectionError::AlreadyOwned {
                owner: describe(owner),
                type_name: type_key.to_string(),
            });
        }

        let binding = self.inner.creator.binding(&type_key);
        let instance = Instance::new(type_key, object, binding);
        self.setup(owner, &instance)?;
        self.register_owned(&instance)?;

        if auto_resolve {
            self.resolve(&instance)?;
        }
        Ok(instance)
    }

    fn add_one(&self, type_key: &TypeKey, owner: Option<&Instance>) -> Result<Instance> {
        self.ensure_live()?;
        if let Some(owner) = owner {
            self.data(owner)?;
        }

        if let Some(existing) = self.compatible_children(owner, type_key).into_iter().next() {
            #[cfg(feature = "logging")]
            warn!(target: "tree_injector", instance = %existing, type_name = %type_key, owner = %describe(owner), "An instance already exists for owner");
            return Ok(existing);
        }

        let concrete = self.inner.resolver.get(type_key)?;
        self.ensure_assignable(&concrete, type_key)?;
        self.create(owner, &concrete)
    }

    fn add_all(&self, type_key: &TypeKey, owner: Option<&Instance>) -> Result<Vec<Instance>> {
        self.ensure_live()?;
        if let Some(owner) = owner {
            self.data(owner)?;
        }

        let existing = self.compatible_children(owner, type_key);
        let concretes = self.inner.resolver.get_all(type_key)?;
        for concrete in &concretes {
            self.ensure_assignable(concrete, type_key)?;
        }

        let mut instances = Vec::with_capacity(concretes.len());
        for concrete in concretes {
            if existing.iter().any(|instance| instance.type_key() == &concrete) {
                continue;
            }
            instances.push(self.create(owner, &concrete)?);
        }
        instances.extend(existing);
        Ok(instances)
    }

    fn ensure_assignable(&self, concrete: &TypeKey, requested: &TypeKey) -> Result<()> {
        if self.inner.resolver.is_assignable(concrete, requested) {
            Ok(())
        } else {
            Err(InjectionError::IncompatibleImplementation {
                requested: requested.to_string(),
                actual: concrete.to_string(),
            })
        }
    }

    fn create(&self, owner: Option<&Instance>, concrete: &TypeKey) -> Result<Instance> {
        let instance = self.inner.creator.create(concrete)?;

        #[cfg(feature = "logging")]
        trace!(target: "tree_injector", instance = %instance, owner = %describe(owner), "Created new instance");

        self.setup(owner, &instance)?;
        self.register_owned(&instance)?;
        Ok(instance)
    }

    /// Attach the instance and start its initialization task
    fn setup(&self, owner: Option<&Instance>, instance: &Instance) -> Result<()> {
        let runtime = Handle::try_current().map_err(|_| InjectionError::NoRuntime)?;

        let token = match owner {
            Some(owner) => self.data(owner)?.token().child_token(),
            None => self.root_token().child_token(),
        };

        self.hierarchy().add(instance.clone(), owner)?;

        let data = Arc::new(InstanceData::new(token));
        self.inner.instances.insert(instance.clone(), Arc::clone(&data));

        runtime.spawn(run_initialization(
            Arc::downgrade(&self.inner),
            instance.clone(),
            data,
        ));
        Ok(())
    }

    /// Create the instances registered by the type's constructor
    fn register_owned(&self, instance: &Instance) -> Result<()> {
        let binding = Arc::clone(instance.binding());
        for owned in &binding.owned {
            if owned.all {
                self.add_all(&owned.type_key, Some(instance))?;
            } else {
                self.add_one(&owned.type_key, Some(instance))?;
            }
        }
        Ok(())
    }

    /// Add then resolve one instance of `type_key`
    pub fn get_instance(&self, type_key: impl Into<TypeKey>, owner: Option<&Instance>) -> Result<Instance> {
        let type_key = type_key.into();

        #[cfg(feature = "logging")]
        trace!(target: "tree_injector", type_name = %type_key, owner = ?owner.map(ToString::to_string), "Getting instance");

        let result = self.add_one(&type_key, owner).and_then(|instance| {
            self.resolve(&instance)?;
            Ok(instance)
        });
        self.report(result)
    }

    /// Add then resolve every implementation of `type_key`
    pub fn get_instances(&self, type_key: impl Into<TypeKey>, owner: Option<&Instance>) -> Result<Vec<Instance>> {
        let type_key = type_key.into();

        #[cfg(feature = "logging")]
        trace!(target: "tree_injector", type_name = %type_key, owner = ?owner.map(ToString::to_string), "Getting instances");

        let result = self.add_all(&type_key, owner).and_then(|instances| {
            for instance in &instances {
                self.resolve(instance)?;
            }
            Ok(instances)
        });
        self.report(result)
    }

    // =========================================================================
    // Resolution
    // =========================================================================

    /// Populate the instance's needed fields, then resolve its owned children.
    ///
    /// Resolving an instance that is already resolving or resolved is a no-op.
    pub fn resolve_instance(&self, instance: &Instance) -> Result<()> {
        let result = self.resolve(instance);
        self.report(result)
    }

    pub fn resolve_instances(&self, instances: &[Instance]) -> Result<()> {
        let result = instances.iter().try_for_each(|instance| self.resolve(instance));
        self.report(result)
    }

    fn resolve(&self, instance: &Instance) -> Result<()> {
        self.ensure_live()?;
        let data = self.data(instance)?;
        if !data.advance(LifecycleState::Resolving) {
            return Ok(());
        }

        #[cfg(feature = "logging")]
        trace!(target: "tree_injector", instance = %instance, state = ?LifecycleState::Resolving, "Instance changing state");

        match self.resolve_members(instance) {
            Ok(()) => {
                data.advance(LifecycleState::Initializing);

                #[cfg(feature = "logging")]
                trace!(target: "tree_injector", instance = %instance, state = ?LifecycleState::Initializing, "Instance changing state");

                Ok(())
            }
            Err(error) => {
                data.halt(Halt::Failed(error.clone()));
                Err(error)
            }
        }
    }

    fn resolve_members(&self, instance: &Instance) -> Result<()> {
        if let Some(chain) = instance.binding().resolve.clone() {
            for step in chain.ordered_steps() {
                let dependency =
                    self.find(instance, &step.dependency, step.ignore_initialization)?;
                if !instance.object().inject(&step.field, dependency) {
                    return Err(InjectionError::UnknownField {
                        type_name: instance.type_key().to_string(),
                        field: step.field.clone(),
                    });
                }
            }
        }

        for child in self.children(Some(instance)) {
            self.resolve(&child)?;
        }

        if let Some(hook) = instance.object().as_resolvable() {
            match catch_unwind(AssertUnwindSafe(|| hook.resolve())) {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    #[cfg(feature = "logging")]
                    error!(target: "tree_injector", instance = %instance, error = %error, "Resolve hook failed");
                }
                Err(_) => {
                    #[cfg(feature = "logging")]
                    error!(target: "tree_injector", instance = %instance, "Resolve hook panicked");
                }
            }
        }

        Ok(())
    }

    /// Find the nearest instance compatible with `type_key` for `instance`.
    ///
    /// The search walks up from the instance's owner. At each ancestor the
    /// ancestor itself is checked, then its other children; modules among
    /// those children are searched through. The instance's own subtree is
    /// never searched. While the instance is resolving, the match is recorded
    /// as one of its needs.
    pub fn find_dependency(
        &self,
        instance: &Instance,
        type_key: impl Into<TypeKey>,
        ignore_initialization: bool,
    ) -> Result<Instance> {
        let type_key = type_key.into();
        let result = self.find(instance, &type_key, ignore_initialization);
        self.report(result)
    }

    fn find(&self, instance: &Instance, type_key: &TypeKey, ignore_initialization: bool) -> Result<Instance> {
        #[cfg(feature = "logging")]
        trace!(target: "tree_injector", instance = %instance, type_name = %type_key, "Finding dependency");

        self.ensure_live()?;
        let data = self.data(instance)?;
        if self.is_module(instance) {
            return Err(InjectionError::ModuleCannotHaveNeeds {
                instance: instance.to_string(),
            });
        }

        let dependency = {
            let hierarchy = self.hierarchy();
            let mut skipped = instance.clone();
            let mut current = hierarchy.parent(instance).cloned();
            loop {
                if let Some(found) =
                    self.search(&hierarchy, current.as_ref(), Some(&skipped), type_key)
                {
                    break Some(found);
                }
                let Some(ancestor) = current else {
                    break None;
                };
                current = hierarchy.parent(&ancestor).cloned();
                skipped = ancestor;
            }
        };

        let dependency = dependency.ok_or_else(|| InjectionError::DependencyNotFound {
            type_name: type_key.to_string(),
            instance: instance.to_string(),
        })?;

        #[cfg(feature = "logging")]
        trace!(target: "tree_injector", instance = %instance, dependency = %dependency, type_name = %type_key, "Dependency found");

        if data.state() == LifecycleState::Resolving {
            data.record_need(dependency.clone(), ignore_initialization);
        }
        Ok(dependency)
    }

    fn search(
        &self,
        hierarchy: &Hierarchy<Instance>,
        node: Option<&Instance>,
        skipped: Option<&Instance>,
        type_key: &TypeKey,
    ) -> Option<Instance> {
        if let Some(node) = node {
            if self.is_compatible(node, type_key) {
                return Some(node.clone());
            }
        }

        for child in hierarchy.children(node) {
            if Some(child) == skipped {
                continue;
            }
            if self.is_compatible(child, type_key) {
                return Some(child.clone());
            }
            if self.is_module(child) {
                for grandchild in hierarchy.children(Some(child)) {
                    if let Some(found) = self.search(hierarchy, Some(grandchild), None, type_key) {
                        return Some(found);
                    }
                }
            }
        }

        None
    }

    /// Fail if the non-ignored needs reachable from `instance` loop back
    fn verify_cycle(&self, instance: &Instance) -> Result<()> {
        let mut path = Vec::new();
        let mut cleared = HashSet::new();
        self.visit_needs(instance, &mut path, &mut cleared)
    }

    fn visit_needs(
        &self,
        instance: &Instance,
        path: &mut Vec<Instance>,
        cleared: &mut HashSet<Instance>,
    ) -> Result<()> {
        if path.contains(instance) {
            let chain = path
                .iter()
                .chain(std::iter::once(instance))
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" -> ");
            return Err(InjectionError::DependencyCycle { chain });
        }
        if cleared.contains(instance) {
            return Ok(());
        }
        // disposed dependencies can't be part of a cycle anymore
        let Ok(data) = self.data(instance) else {
            return Ok(());
        };

        path.push(instance.clone());
        for need in data.needs() {
            if !need.ignore_initialization {
                self.visit_needs(&need.dependency, path, cleared)?;
            }
        }
        path.pop();
        cleared.insert(instance.clone());
        Ok(())
    }

    // =========================================================================
    // Disposal
    // =========================================================================

    /// Dispose an instance and its whole subtree.
    ///
    /// Errors and panics from user hooks are logged; they never stop the
    /// disposal of siblings.
    pub fn dispose_instance(&self, instance: &Instance) -> Result<()> {
        let result = self.dispose_subtree(instance);
        self.report(result)
    }

    fn dispose_subtree(&self, instance: &Instance) -> Result<()> {
        let data = self.data(instance)?;

        #[cfg(feature = "logging")]
        trace!(target: "tree_injector", instance = %instance, "Disposing instance");

        data.token().cancel();
        data.halt(Halt::Cancelled);

        self.unregister_all(instance);
        self.notify_item_destruction(instance);

        if let Some(hook) = instance.object().as_disposable() {
            match catch_unwind(AssertUnwindSafe(|| hook.dispose())) {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    #[cfg(feature = "logging")]
                    error!(target: "tree_injector", instance = %instance, error = %error, "Dispose hook failed");
                }
                Err(_) => {
                    #[cfg(feature = "logging")]
                    error!(target: "tree_injector", instance = %instance, "Dispose hook panicked");
                }
            }
        }

        for child in self.children(Some(instance)) {
            if let Err(error) = self.dispose_subtree(&child) {
                #[cfg(feature = "logging")]
                error!(target: "tree_injector", instance = %child, error = %error, "Failed to dispose owned instance");
            }
        }

        let detached = self.hierarchy().remove(instance, true)?;
        for element in detached {
            self.inner.instances.remove(&element);
        }
        Ok(())
    }

    /// Dispose every instance and drop resolver and creator caches
    pub fn reset(&self) {
        #[cfg(feature = "logging")]
        debug!(target: "tree_injector", instances = self.len(), "Resetting injection context");

        for root in self.children(None) {
            if let Err(error) = self.dispose_subtree(&root) {
                #[cfg(feature = "logging")]
                error!(target: "tree_injector", instance = %root, error = %error, "Failed to dispose root instance");
            }
        }

        self.inner.resolver.reset();
        self.inner.creator.reset();
        self.hierarchy().reset();
        self.inner.instances.clear();
        self.inner.observers.clear();

        let mut token = self
            .inner
            .root_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        token.cancel();
        *token = CancellationToken::new();
    }

    /// Reset, then retire the context for good.
    ///
    /// Every clone shares the disposed state: creation, resolution and
    /// dependency lookups fail with [`InjectionError::Disposed`] afterwards.
    pub fn dispose(self) {
        #[cfg(feature = "logging")]
        debug!(target: "tree_injector", "Disposing injection context");

        self.inner.disposed.store(true, Ordering::Release);
        self.reset();
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    // =========================================================================
    // Item observation
    // =========================================================================

    /// Subscribe `observer` to creations and destructions of `observed` items
    pub fn register_item_observer(&self, observer: &Instance, observed: impl Into<TypeKey>) {
        let observed = observed.into();

        #[cfg(feature = "logging")]
        trace!(target: "tree_injector", observer = %observer, observed = %observed, "Registering item observer");

        let mut observers = self.inner.observers.entry(observed).or_default();
        if !observers.contains(observer) {
            observers.push(observer.clone());
        }
    }

    pub fn unregister_item_observer(&self, observer: &Instance, observed: &TypeKey) {
        #[cfg(feature = "logging")]
        trace!(target: "tree_injector", observer = %observer, observed = %observed, "Unregistering item observer");

        let now_empty = match self.inner.observers.get_mut(observed) {
            Some(mut observers) => {
                observers.retain(|registered| registered != observer);
                observers.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.inner
                .observers
                .remove_if(observed, |_, observers| observers.is_empty());
        }
    }

    fn unregister_all(&self, observer: &Instance) {
        for observed in &observer.binding().observed {
            self.unregister_item_observer(observer, observed);
        }
        self.inner
            .observers
            .retain(|_, observers| {
                observers.retain(|registered| registered != observer);
                !observers.is_empty()
            });
    }

    /// Tell every observer of one of the item's types that it was created
    pub fn notify_item_creation(&self, item: &Instance) {
        #[cfg(feature = "logging")]
        trace!(target: "tree_injector", instance = %item, "Notifying creation of instance");

        self.notify(item, |observer, observed| observer.on_item_created(observed, item));
    }

    /// Tell every observer of one of the item's types that it is destroyed
    pub fn notify_item_destruction(&self, item: &Instance) {
        #[cfg(feature = "logging")]
        trace!(target: "tree_injector", instance = %item, "Notifying destruction of instance");

        self.notify(item, |observer, observed| observer.on_item_destroyed(observed, item));
    }

    fn notify<F>(&self, item: &Instance, dispatch: F)
    where
        F: Fn(&dyn ItemObserver, &TypeKey) -> std::result::Result<(), HookError>,
    {
        let types = self
            .inner
            .resolver
            .assignable_types(item.type_key())
            .unwrap_or_else(|_| vec![item.type_key().clone()]);

        for observed in types {
            let observers = match self.inner.observers.get(&observed) {
                Some(observers) => observers.value().clone(),
                None => continue,
            };

            for observer in observers {
                let Some(hook) = observer.object().as_item_observer() else {
                    #[cfg(feature = "logging")]
                    warn!(target: "tree_injector", observer = %observer, "Registered observer does not implement ItemObserver");
                    continue;
                };

                match catch_unwind(AssertUnwindSafe(|| dispatch(hook, &observed))) {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => {
                        #[cfg(feature = "logging")]
                        error!(target: "tree_injector", observer = %observer, instance = %item, error = %error, "Item observer failed");
                    }
                    Err(_) => {
                        #[cfg(feature = "logging")]
                        error!(target: "tree_injector", observer = %observer, instance = %item, "Item observer panicked");
                    }
                }
            }
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn state(&self, instance: &Instance) -> Option<LifecycleState> {
        self.inner.instances.get(instance).map(|data| data.state())
    }

    /// Milestone reached once the instance is resolved
    pub fn resolved(&self, instance: &Instance) -> Result<Milestone> {
        self.milestone(instance, LifecycleState::Initializing)
    }

    /// Milestone reached once the instance is initialized
    pub fn initialized(&self, instance: &Instance) -> Result<Milestone> {
        self.milestone(instance, LifecycleState::Initialized)
    }

    fn milestone(&self, instance: &Instance, target: LifecycleState) -> Result<Milestone> {
        Ok(self.data(instance)?.milestone(instance, target))
    }

    pub fn parent(&self, instance: &Instance) -> Option<Instance> {
        self.hierarchy().parent(instance).cloned()
    }

    /// Direct children of `owner`, or the root-level instances when `None`
    pub fn children(&self, owner: Option<&Instance>) -> Vec<Instance> {
        self.hierarchy().children(owner).to_vec()
    }

    pub fn contains(&self, instance: &Instance) -> bool {
        self.inner.instances.contains_key(instance)
    }

    pub fn len(&self) -> usize {
        self.inner.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.instances.is_empty()
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            Err(InjectionError::Disposed)
        } else {
            Ok(())
        }
    }

    fn hierarchy(&self) -> MutexGuard<'_, Hierarchy<Instance>> {
        self.inner
            .hierarchy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn root_token(&self) -> CancellationToken {
        self.inner
            .root_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn data(&self, instance: &Instance) -> Result<Arc<InstanceData>> {
        self.inner
            .instances
            .get(instance)
            .map(|data| Arc::clone(data.value()))
            .ok_or_else(|| InjectionError::unknown_instance(instance))
    }

    fn is_compatible(&self, instance: &Instance, type_key: &TypeKey) -> bool {
        self.inner.resolver.is_assignable(instance.type_key(), type_key)
    }

    fn is_module(&self, instance: &Instance) -> bool {
        self.is_compatible(instance, &self.inner.module_type)
    }

    fn compatible_children(&self, owner: Option<&Instance>, type_key: &TypeKey) -> Vec<Instance> {
        self.hierarchy()
            .children(owner)
            .iter()
            .filter(|child| self.is_compatible(child, type_key))
            .cloned()
            .collect()
    }

    fn report<T>(&self, result: Result<T>) -> Result<T> {
        result.map_err(|error| self.fatal(error))
    }

    /// Log a configuration error and hand it to the asserter
    fn fatal(&self, error: InjectionError) -> InjectionError {
        #[cfg(feature = "logging")]
        error!(target: "tree_injector", fatal = true, error = %error, "Injection failed");

        if let Some(asserter) = &self.inner.asserter {
            asserter.fail(&error);
        }
        error
    }
}

impl std::fmt::Debug for InjectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InjectionContext")
            .field("instances", &self.len())
            .field("observed_types", &self.inner.observers.len())
            .finish()
    }
}

fn describe(owner: Option<&Instance>) -> String {
    owner.map_or_else(|| "root".to_string(), ToString::to_string)
}

// =============================================================================
// Background tasks
// =============================================================================

fn upgrade(context: &Weak<ContextInner>) -> std::result::Result<InjectionContext, Halt> {
    context
        .upgrade()
        .map(|inner| InjectionContext { inner })
        .ok_or(Halt::Cancelled)
}

async fn run_initialization(context: Weak<ContextInner>, instance: Instance, data: Arc<InstanceData>) {
    let token = data.token().clone();
    let outcome = tokio::select! {
        biased;
        _ = token.cancelled() => Err(Halt::Cancelled),
        outcome = initialize(&context, &instance, &data, &token) => outcome,
    };

    match outcome {
        Ok(()) => {}
        Err(Halt::Cancelled) => {
            #[cfg(feature = "logging")]
            trace!(target: "tree_injector", instance = %instance, "Initialization cancelled");
            data.halt(Halt::Cancelled);
        }
        Err(Halt::Failed(error)) => {
            data.halt(Halt::Failed(error.clone()));
            match upgrade(&context) {
                Ok(context) if !matches!(error, InjectionError::DependencyFailed { .. }) => {
                    context.fatal(error);
                }
                _ => {
                    #[cfg(feature = "logging")]
                    error!(target: "tree_injector", instance = %instance, error = %error, "Initialization failed");
                }
            }
        }
    }
}

async fn initialize(
    context: &Weak<ContextInner>,
    instance: &Instance,
    data: &InstanceData,
    token: &CancellationToken,
) -> std::result::Result<(), Halt> {
    // resolution failures are reported by the resolve call itself
    if data
        .milestone(instance, LifecycleState::Initializing)
        .wait()
        .await
        .is_err()
    {
        return Ok(());
    }

    let needs = data.needs();

    let resolved = {
        let context = upgrade(context)?;
        needs
            .iter()
            .map(|need| context.resolved(&need.dependency))
            .collect::<Result<Vec<_>>>()
            .map_err(Halt::Failed)?
    };
    join_all(resolved.into_iter().map(Milestone::wait)).await;

    #[cfg(feature = "logging")]
    trace!(target: "tree_injector", instance = %instance, "Verifying dependency cycle");

    upgrade(context)?.verify_cycle(instance).map_err(Halt::Failed)?;

    let awaited = {
        let context = upgrade(context)?;
        needs
            .iter()
            .filter(|need| !need.ignore_initialization)
            .map(|need| {
                #[cfg(feature = "logging")]
                trace!(target: "tree_injector", instance = %instance, dependency = %need.dependency, "Waiting for dependency initialization");
                Ok((need.dependency.clone(), context.initialized(&need.dependency)?))
            })
            .collect::<Result<Vec<_>>>()
            .map_err(Halt::Failed)?
    };
    let results = join_all(awaited.iter().map(|(_, milestone)| milestone.clone().wait())).await;
    for ((dependency, _), result) in awaited.iter().zip(results) {
        if let Err(error) = result {
            if token.is_cancelled() {
                return Err(Halt::Cancelled);
            }
            return Err(Halt::Failed(InjectionError::DependencyFailed {
                instance: instance.to_string(),
                dependency: dependency.to_string(),
                reason: error.to_string(),
            }));
        }
    }

    if token.is_cancelled() {
        return Err(Halt::Cancelled);
    }

    if let Some(hook) = instance.object().as_initializable() {
        #[cfg(feature = "logging")]
        trace!(target: "tree_injector", instance = %instance, "Initializing instance");

        match AssertUnwindSafe(hook.initialize(token.clone()))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(HookError::Cancelled)) => return Err(Halt::Cancelled),
            Ok(Err(error)) => {
                #[cfg(feature = "logging")]
                error!(target: "tree_injector", instance = %instance, error = %error, "Initialize hook failed");
            }
            Err(_) => {
                #[cfg(feature = "logging")]
                error!(target: "tree_injector", instance = %instance, "Initialize hook panicked");
            }
        }
    }

    if token.is_cancelled() {
        return Err(Halt::Cancelled);
    }

    let context = upgrade(context)?;

    for observed in &instance.binding().observed {
        context.register_item_observer(instance, observed.clone());
    }

    if instance.object().as_updatable().is_some() {
        spawn_update(instance.clone(), token.clone());
    }

    data.advance(LifecycleState::Initialized);

    #[cfg(feature = "logging")]
    trace!(target: "tree_injector", instance = %instance, state = ?LifecycleState::Initialized, "Instance changing state");

    context.notify_item_creation(instance);
    Ok(())
}

/// Run the update loop detached; faults are logged, cancellation is silent
fn spawn_update(instance: Instance, token: CancellationToken) {
    tokio::spawn(async move {
        let Some(updatable) = instance.object().as_updatable() else {
            return;
        };

        #[cfg(feature = "logging")]
        trace!(target: "tree_injector", instance = %instance, "Starting update loop");

        match AssertUnwindSafe(updatable.update(token.clone()))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) | Ok(Err(HookError::Cancelled)) => {
                #[cfg(feature = "logging")]
                trace!(target: "tree_injector", instance = %instance, cancelled = token.is_cancelled(), "Update loop done");
            }
            Ok(Err(error)) => {
                #[cfg(feature = "logging")]
                error!(target: "tree_injector", instance = %instance, error = %error, "Update loop failed");
            }
            Err(_) => {
                #[cfg(feature = "logging")]
                error!(target: "tree_injector", instance = %instance, "Update loop panicked");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{Disposable, Inject, Resolvable};
    use crate::creator::FactoryCreator;
    use crate::loader::{OwnedRegistration, ResolveChain, ResolveStep, TypeBinding};
    use crate::resolver::RegistryTypeResolver;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;

    #[derive(Default)]
    struct Node {
        fields: Mutex<Vec<(String, Instance)>>,
        resolves: AtomicUsize,
        disposals: AtomicUsize,
        events: Mutex<Vec<String>>,
    }

    impl Node {
        fn field(&self, name: &str) -> Option<Instance> {
            self.fields
                .lock()
                .unwrap()
                .iter()
                .find(|(field, _)| field == name)
                .map(|(_, instance)| instance.clone())
        }
    }

    impl Inject for Node {
        fn inject(&self, field: &str, dependency: Instance) -> bool {
            self.fields.lock().unwrap().push((field.to_string(), dependency));
            true
        }
    }

    impl Resolvable for Node {
        fn resolve(&self) -> std::result::Result<(), HookError> {
            self.resolves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl Disposable for Node {
        fn dispose(&self) -> std::result::Result<(), HookError> {
            self.disposals.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl ItemObserver for Node {
        fn on_item_created(&self, observed: &TypeKey, item: &Instance) -> std::result::Result<(), HookError> {
            self.events.lock().unwrap().push(format!("created {observed} {}", item.type_key()));
            Ok(())
        }

        fn on_item_destroyed(&self, observed: &TypeKey, item: &Instance) -> std::result::Result<(), HookError> {
            self.events.lock().unwrap().push(format!("destroyed {observed} {}", item.type_key()));
            Ok(())
        }
    }

    impl Component for Node {
        fn as_resolvable(&self) -> Option<&dyn Resolvable> {
            Some(self)
        }

        fn as_disposable(&self) -> Option<&dyn Disposable> {
            Some(self)
        }

        fn as_item_observer(&self) -> Option<&dyn ItemObserver> {
            Some(self)
        }
    }

    fn binding(type_name: &str) -> TypeBinding {
        TypeBinding::empty(TypeKey::new(type_name))
    }

    fn owns(type_name: &str) -> OwnedRegistration {
        OwnedRegistration {
            type_key: TypeKey::new(type_name),
            all: false,
        }
    }

    fn needs(declaring: &str, steps: &[(&str, &str, bool)]) -> Option<Arc<ResolveChain>> {
        Some(Arc::new(ResolveChain {
            declaring_type: TypeKey::new(declaring),
            steps: steps
                .iter()
                .map(|(field, dependency, ignore_initialization)| ResolveStep {
                    field: field.to_string(),
                    dependency: TypeKey::new(*dependency),
                    ignore_initialization: *ignore_initialization,
                })
                .collect(),
            next: None,
        }))
    }

    fn context(rows: &[&[&str]], bindings: Vec<TypeBinding>) -> InjectionContext {
        let rows = rows
            .iter()
            .map(|row| row.iter().map(|name| TypeKey::new(*name)).collect())
            .collect();
        let resolver = RegistryTypeResolver::new(
            rows,
            bindings.iter().map(|binding| binding.type_key.clone()).collect::<Vec<_>>(),
        );
        let creator = FactoryCreator::new();
        for binding in bindings {
            creator.register_default::<Node>(binding.type_key.clone());
            creator.bind(binding);
        }
        InjectionContext::new(Arc::new(resolver), Arc::new(creator))
    }

    /// Module owns System, System owns Leaf, Leaf needs ISystem
    fn tree() -> InjectionContext {
        context(
            &[
                &["Game.Module", attributes::MODULE],
                &["Game.System", "Game.ISystem"],
                &["Game.Leaf"],
            ],
            vec![
                TypeBinding {
                    owned: vec![owns("Game.ISystem")],
                    ..binding("Game.Module")
                },
                TypeBinding {
                    owned: vec![owns("Game.Leaf")],
                    ..binding("Game.System")
                },
                TypeBinding {
                    resolve: needs("Game.Leaf", &[("system", "Game.ISystem", false)]),
                    ..binding("Game.Leaf")
                },
            ],
        )
    }

    async fn settle(milestone: Milestone) -> Result<()> {
        timeout(Duration::from_secs(5), milestone.wait())
            .await
            .expect("milestone timed out")
    }

    #[tokio::test]
    async fn test_get_instance_builds_owned_tree() {
        let context = tree();
        let module = context.get_instance(attributes::MODULE, None).unwrap();
        let system = context.children(Some(&module))[0].clone();
        let leaf = context.children(Some(&system))[0].clone();

        assert_eq!(system.type_key().as_str(), "Game.System");
        assert_eq!(context.parent(&leaf), Some(system.clone()));
        assert_eq!(context.len(), 3);

        let node = leaf.downcast_ref::<Node>().unwrap();
        assert_eq!(node.field("system"), Some(system.clone()));

        settle(context.initialized(&leaf).unwrap()).await.unwrap();
        assert_eq!(context.state(&system), Some(LifecycleState::Initialized));
    }

    #[tokio::test]
    async fn test_add_instance_is_idempotent_per_owner() {
        let context = tree();
        let module = context.add_instance(attributes::MODULE, None).unwrap();
        let system = context.add_instance("Game.ISystem", Some(&module)).unwrap();
        assert_eq!(context.children(Some(&module)), vec![system.clone()]);
        assert_eq!(context.state(&system), Some(LifecycleState::UnResolved));
    }

    #[tokio::test]
    async fn test_resolve_twice_is_noop() {
        let context = tree();
        let module = context.get_instance(attributes::MODULE, None).unwrap();
        context.resolve_instance(&module).unwrap();

        let system = context.children(Some(&module))[0].clone();
        context.resolve_instance(&system).unwrap();

        let node = system.downcast_ref::<Node>().unwrap();
        assert_eq!(node.resolves.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_modules_cannot_have_needs() {
        let context = tree();
        let module = context.add_instance(attributes::MODULE, None).unwrap();
        let err = context.find_dependency(&module, "Game.ISystem", false).unwrap_err();
        assert!(matches!(err, InjectionError::ModuleCannotHaveNeeds { .. }));
    }

    #[tokio::test]
    async fn test_dependency_not_found() {
        let context = context(
            &[&["Game.Leaf"]],
            vec![TypeBinding {
                resolve: needs("Game.Leaf", &[("system", "Game.ISystem", false)]),
                ..binding("Game.Leaf")
            }],
        );
        let err = context.get_instance("Game.Leaf", None).unwrap_err();
        assert!(matches!(err, InjectionError::DependencyNotFound { ref type_name, .. } if type_name == "Game.ISystem"));
    }

    #[tokio::test]
    async fn test_search_goes_through_modules_but_not_descendants() {
        let context = context(
            &[
                &["Game.Module", attributes::MODULE],
                &["Game.System", "Game.ISystem"],
                &["Game.Leaf"],
            ],
            vec![binding("Game.Module"), binding("Game.System"), binding("Game.Leaf")],
        );
        let module = context.add_instance(attributes::MODULE, None).unwrap();
        let system = context.add_instance("Game.ISystem", Some(&module)).unwrap();
        let leaf = context.add_instance("Game.Leaf", None).unwrap();

        let found = context.find_dependency(&leaf, "Game.ISystem", false).unwrap();
        assert_eq!(found, system);

        // the system's own leaf is skipped in favor of the root-level one
        let owned = context.add_instance("Game.Leaf", Some(&system)).unwrap();
        let found = context.find_dependency(&system, "Game.Leaf", false).unwrap();
        assert_eq!(found, leaf);
        assert_ne!(found, owned);
    }

    #[tokio::test]
    async fn test_dependency_cycle_is_reported() {
        let context = context(
            &[&["Game.A", "Game.IA"], &["Game.B", "Game.IB"]],
            vec![
                TypeBinding {
                    resolve: needs("Game.A", &[("b", "Game.IB", false)]),
                    ..binding("Game.A")
                },
                TypeBinding {
                    resolve: needs("Game.B", &[("a", "Game.IA", false)]),
                    ..binding("Game.B")
                },
            ],
        );
        let a = context.add_instance("Game.IA", None).unwrap();
        let b = context.add_instance("Game.IB", None).unwrap();
        context.resolve_instances(&[a.clone(), b.clone()]).unwrap();

        match settle(context.initialized(&a).unwrap()).await.unwrap_err() {
            InjectionError::DependencyCycle { chain } => {
                assert!(chain.contains(&a.to_string()));
                assert!(chain.contains(&b.to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_dispose_removes_subtree() {
        let context = tree();
        let module = context.get_instance(attributes::MODULE, None).unwrap();
        let system = context.children(Some(&module))[0].clone();
        let leaf = context.children(Some(&system))[0].clone();

        context.dispose_instance(&module).unwrap();

        assert!(context.is_empty());
        assert!(!context.contains(&leaf));
        assert!(context.children(None).is_empty());
        assert_eq!(leaf.downcast_ref::<Node>().unwrap().disposals.load(Ordering::SeqCst), 1);
        assert!(context.state(&system).is_none());
        assert!(matches!(
            context.dispose_instance(&module),
            Err(InjectionError::UnknownInstance { .. })
        ));
    }

    #[tokio::test]
    async fn test_observers_see_creation_and_destruction() {
        let context = context(
            &[&["Game.Watcher"], &["Game.System", "Game.ISystem"]],
            vec![
                TypeBinding {
                    observed: vec![TypeKey::new("Game.ISystem")],
                    ..binding("Game.Watcher")
                },
                binding("Game.System"),
            ],
        );
        let watcher = context.get_instance("Game.Watcher", None).unwrap();
        settle(context.initialized(&watcher).unwrap()).await.unwrap();

        let system = context.get_instance("Game.ISystem", None).unwrap();
        settle(context.initialized(&system).unwrap()).await.unwrap();
        context.dispose_instance(&system).unwrap();

        let events = watcher.downcast_ref::<Node>().unwrap().events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                "created Game.ISystem Game.System".to_string(),
                "destroyed Game.ISystem Game.System".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_external_instance_rejects_duplicates() {
        let context = tree();
        let system = context
            .add_external_instance("Game.System", Arc::new(Node::default()), None, false)
            .unwrap();
        assert_eq!(context.children(Some(&system)).len(), 1);

        let err = context
            .add_external_instance("Game.System", Arc::new(Node::default()), None, true)
            .unwrap_err();
        assert!(matches!(err, InjectionError::AlreadyOwned { .. }));
    }

    #[tokio::test]
    async fn test_reset_clears_everything() {
        let context = tree();
        let module = context.get_instance(attributes::MODULE, None).unwrap();
        let initialized = context.initialized(&module).unwrap();

        context.reset();

        assert!(context.is_empty());
        match settle(initialized).await {
            Ok(()) => {}
            Err(error) => assert!(error.is_cancelled(), "unexpected error: {error}"),
        }
    }

    #[tokio::test]
    async fn test_dispose_retires_every_clone() {
        let context = tree();
        let other = context.clone();
        let module = context.get_instance(attributes::MODULE, None).unwrap();
        let leaf = context.children(Some(&context.children(Some(&module))[0]))[0].clone();

        context.dispose();

        assert!(other.is_disposed());
        assert!(other.is_empty());
        assert_eq!(leaf.downcast_ref::<Node>().unwrap().disposals.load(Ordering::SeqCst), 1);
        assert_eq!(
            other.add_instance(attributes::MODULE, None).unwrap_err(),
            InjectionError::Disposed
        );
        assert_eq!(
            other.get_instance("Game.ISystem", None).unwrap_err(),
            InjectionError::Disposed
        );
        assert_eq!(
            other
                .add_external_instance("Game.System", Arc::new(Node::default()), None, false)
                .unwrap_err(),
            InjectionError::Disposed
        );
        assert_eq!(
            other.find_dependency(&leaf, "Game.ISystem", false).unwrap_err(),
            InjectionError::Disposed
        );
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn test_reset_keeps_context_usable() {
        let context = tree();
        context.get_instance(attributes::MODULE, None).unwrap();

        context.reset();

        assert!(!context.is_disposed());
        let module = context.get_instance(attributes::MODULE, None).unwrap();
        assert_eq!(context.len(), 3);
        settle(context.initialized(&module).unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn test_external_instance_is_disposed_with_hooks() {
        let context = tree();
        let node = Arc::new(Node::default());
        let system = context
            .add_external_instance("Game.System", Arc::clone(&node), None, true)
            .unwrap();
        settle(context.initialized(&system).unwrap()).await.unwrap();
        assert_eq!(node.resolves.load(Ordering::SeqCst), 1);

        context.dispose_instance(&system).unwrap();

        assert_eq!(node.disposals.load(Ordering::SeqCst), 1);
        assert!(context.is_empty());
    }

    #[tokio::test]
    async fn test_failed_dependency_fails_dependent() {
        let context = context(
            &[&["Game.A", "Game.IA"], &["Game.B", "Game.IB"]],
            vec![
                TypeBinding {
                    resolve: needs("Game.A", &[("b", "Game.IB", false)]),
                    ..binding("Game.A")
                },
                TypeBinding {
                    resolve: needs("Game.B", &[("missing", "Game.IMissing", false)]),
                    ..binding("Game.B")
                },
            ],
        );
        let a = context.add_instance("Game.IA", None).unwrap();
        let b = context.add_instance("Game.IB", None).unwrap();
        context.resolve_instance(&a).unwrap();
        assert!(matches!(
            context.resolve_instance(&b),
            Err(InjectionError::DependencyNotFound { .. })
        ));

        settle(context.resolved(&a).unwrap()).await.unwrap();
        match settle(context.initialized(&a).unwrap()).await.unwrap_err() {
            InjectionError::DependencyFailed { instance, dependency, .. } => {
                assert_eq!(instance, a.to_string());
                assert_eq!(dependency, b.to_string());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(context.state(&a), Some(LifecycleState::Initializing));
    }

    #[test]
    fn test_requires_runtime() {
        let context = tree();
        let err = context.add_instance(attributes::MODULE, None).unwrap_err();
        assert_eq!(err, InjectionError::NoRuntime);
        assert!(context.is_empty());
    }
}
