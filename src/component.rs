//! User object contract
//!
//! Every object the engine manages implements [`Component`]. Lifecycle
//! capabilities are optional and discovered through the `as_*` accessors, so
//! a component only implements the hooks it cares about:
//!
//! | Capability        | Called                                                  |
//! |-------------------|---------------------------------------------------------|
//! | [`Inject`]        | once per needed field, while resolving                  |
//! | [`Resolvable`]    | after fields and owned children are resolved            |
//! | [`Initializable`] | once every non-ignored dependency is initialized        |
//! | [`Updatable`]     | right after initialization, runs until cancelled        |
//! | [`Disposable`]    | on disposal, before owned children are disposed         |
//! | [`ItemObserver`]  | when observed items are created or destroyed            |
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use tokio_util::sync::CancellationToken;
//! use tree_injector::{Component, Dependency, HookError, Initializable, Inject, Instance};
//!
//! #[derive(Default)]
//! struct Renderer {
//!     window: Dependency,
//! }
//!
//! impl Inject for Renderer {
//!     fn inject(&self, field: &str, dependency: Instance) -> bool {
//!         match field {
//!             "window" => self.window.set(dependency),
//!             _ => false,
//!         }
//!     }
//! }
//!
//! #[async_trait]
//! impl Initializable for Renderer {
//!     async fn initialize(&self, _token: CancellationToken) -> Result<(), HookError> {
//!         Ok(())
//!     }
//! }
//!
//! impl Component for Renderer {
//!     fn as_initializable(&self) -> Option<&dyn Initializable> {
//!         Some(self)
//!     }
//! }
//! ```

use crate::error::HookError;
use crate::instance::Instance;
use crate::type_key::TypeKey;
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Upcast to `Any` for downcasting trait objects back to their concrete type
pub trait AsAny: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAny for T {
    #[inline]
    fn as_any(&self) -> &dyn Any {
        self
    }

    #[inline]
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Field-level injection target.
///
/// `inject` receives the name of a needed field and the dependency found for
/// it, and returns `false` when the component has no such field.
pub trait Inject {
    fn inject(&self, field: &str, dependency: Instance) -> bool {
        let _ = (field, dependency);
        false
    }
}

/// An object managed by the injection engine
pub trait Component: Inject + AsAny {
    fn as_resolvable(&self) -> Option<&dyn Resolvable> {
        None
    }

    fn as_initializable(&self) -> Option<&dyn Initializable> {
        None
    }

    fn as_updatable(&self) -> Option<&dyn Updatable> {
        None
    }

    fn as_disposable(&self) -> Option<&dyn Disposable> {
        None
    }

    fn as_item_observer(&self) -> Option<&dyn ItemObserver> {
        None
    }
}

/// Manual resolve hook, called once after automatic resolution
pub trait Resolvable: Send + Sync {
    fn resolve(&self) -> Result<(), HookError>;
}

/// Async setup, run after every non-ignored dependency finished its own
#[async_trait]
pub trait Initializable: Send + Sync {
    async fn initialize(&self, token: CancellationToken) -> Result<(), HookError>;
}

/// Long-running update loop.
///
/// The loop is never awaited by the engine. It should return once `token` is
/// cancelled; returning [`HookError::Cancelled`] is treated as a clean exit.
#[async_trait]
pub trait Updatable: Send + Sync {
    async fn update(&self, token: CancellationToken) -> Result<(), HookError>;
}

/// Disposal hook
pub trait Disposable: Send + Sync {
    fn dispose(&self) -> Result<(), HookError>;
}

/// Creation/destruction notifications for observed item types.
///
/// `observed` is the registered type through which `item` matched, so one
/// observer can tell its subscriptions apart.
pub trait ItemObserver: Send + Sync {
    fn on_item_created(&self, observed: &TypeKey, item: &Instance) -> Result<(), HookError>;

    fn on_item_destroyed(&self, observed: &TypeKey, item: &Instance) -> Result<(), HookError>;
}

// =============================================================================
// Dependency slot
// =============================================================================

/// Write-once slot holding a resolved dependency
#[derive(Default)]
pub struct Dependency {
    slot: OnceCell<Instance>,
}

impl Dependency {
    pub const fn new() -> Self {
        Self {
            slot: OnceCell::new(),
        }
    }

    /// Store the dependency; returns `true` when the field accepts it.
    ///
    /// A slot that is already filled keeps its first value.
    pub fn set(&self, dependency: Instance) -> bool {
        let _ = self.slot.set(dependency);
        true
    }

    pub fn get(&self) -> Option<&Instance> {
        self.slot.get()
    }

    pub fn is_resolved(&self) -> bool {
        self.slot.get().is_some()
    }

    /// Borrow the dependency as its concrete type
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.slot.get()?.downcast_ref::<T>()
    }

    /// Share the dependency as its concrete type
    pub fn downcast_arc<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.slot.get()?.downcast_arc::<T>()
    }
}

impl fmt::Debug for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.slot.get() {
            Some(instance) => write!(f, "Dependency({instance})"),
            None => f.write_str("Dependency(<unresolved>)"),
        }
    }
}
