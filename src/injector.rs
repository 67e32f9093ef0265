//! Optional process-wide accessor
//!
//! The engine itself never reads global state. Hosts that want a single
//! ambient context (the usual setup in a game) install one here and call the
//! forwarding functions from anywhere.
//!
//! ```rust
//! use std::sync::Arc;
//! use tree_injector::{injector, FactoryCreator, InjectionContext, RegistryTypeResolver};
//!
//! let context = InjectionContext::new(
//!     Arc::new(RegistryTypeResolver::new(Vec::new(), [])),
//!     Arc::new(FactoryCreator::new()),
//! );
//!
//! injector::install(context);
//! assert!(injector::current().is_ok());
//! assert!(injector::uninstall().is_some());
//! ```

use crate::context::InjectionContext;
use crate::error::{InjectionError, Result};
use crate::instance::Instance;
use crate::type_key::TypeKey;
use once_cell::sync::Lazy;
use std::sync::{PoisonError, RwLock};

#[cfg(feature = "logging")]
use tracing::debug;

static CURRENT: Lazy<RwLock<Option<InjectionContext>>> = Lazy::new(|| RwLock::new(None));

/// Install `context` as the process-wide context, returning the previous one
pub fn install(context: InjectionContext) -> Option<InjectionContext> {
    #[cfg(feature = "logging")]
    debug!(target: "tree_injector", "Installing process-wide injection context");

    CURRENT
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .replace(context)
}

/// The installed context
pub fn current() -> Result<InjectionContext> {
    CURRENT
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
        .ok_or(InjectionError::NoContext)
}

/// Remove the installed context without disposing it
pub fn uninstall() -> Option<InjectionContext> {
    #[cfg(feature = "logging")]
    debug!(target: "tree_injector", "Uninstalling process-wide injection context");

    CURRENT.write().unwrap_or_else(PoisonError::into_inner).take()
}

pub fn get_instance(type_key: impl Into<TypeKey>, owner: Option<&Instance>) -> Result<Instance> {
    current()?.get_instance(type_key, owner)
}

pub fn get_instances(type_key: impl Into<TypeKey>, owner: Option<&Instance>) -> Result<Vec<Instance>> {
    current()?.get_instances(type_key, owner)
}

pub fn dispose_instance(instance: &Instance) -> Result<()> {
    current()?.dispose_instance(instance)
}

/// Reset the installed context
pub fn reset() -> Result<()> {
    current()?.reset();
    Ok(())
}
