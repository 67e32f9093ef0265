//! # Tree Injector - Ownership-Tree Dependency Injection
//!
//! Dependency injection in two phases:
//!
//! - **Build time**: a weaver scans compiled module images for injection
//!   markers and synthesizes constructor registrations, resolve methods,
//!   observer hooks and a per-module type registry.
//! - **Run time**: an [`InjectionContext`] loads the woven metadata, builds an
//!   ownership tree of instances, resolves needed fields by searching that
//!   tree, then initializes every instance asynchronously once its
//!   dependencies are initialized.
//!
//! ## Features
//!
//! - 🌳 **Ownership tree** - dependencies are found by walking up from the owner
//! - ⏱️ **Ordered initialization** - Tokio tasks wait on dependency milestones
//! - 🔁 **Cycle detection** - needs cycles are reported with the full chain
//! - 👀 **Item observers** - creation/destruction notifications per type
//! - 🧵 **Lock-free storage** - `DashMap` + `ahash` for instance bookkeeping
//! - 📊 **Observable** - optional tracing integration with JSON or pretty output
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use tree_injector::attributes::{self, module_interface, needs, owns};
//! use tree_injector::metadata::{FieldDef, ModuleDef, TypeDef, TypeRef};
//! use tree_injector::{weave, Component, Dependency, FactoryCreator, Inject, Instance, InjectionContext, ModuleSet};
//!
//! #[derive(Default)]
//! struct Game;
//! impl Inject for Game {}
//! impl Component for Game {}
//!
//! #[derive(Default)]
//! struct Audio;
//! impl Inject for Audio {}
//! impl Component for Audio {}
//!
//! #[derive(Default)]
//! struct Player {
//!     audio: Dependency,
//! }
//!
//! impl Inject for Player {
//!     fn inject(&self, field: &str, dependency: Instance) -> bool {
//!         match field {
//!             "audio" => self.audio.set(dependency),
//!             _ => false,
//!         }
//!     }
//! }
//! impl Component for Player {}
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let demo = |name: &str| TypeRef::new("Demo", name);
//!
//! // Build time: weave the compiled module
//! let mut module = ModuleDef::new("Demo")
//!     .with_type(TypeDef::interface("Demo.IAudio"))
//!     .with_type(TypeDef::class("Demo.Audio").implementing(demo("Demo.IAudio")))
//!     .with_type(
//!         TypeDef::class("Demo.Player")
//!             .with_field(FieldDef::new("audio", demo("Demo.IAudio")).with_attribute(needs(false))),
//!     )
//!     .with_type(
//!         TypeDef::class("Demo.Game")
//!             .implementing(module_interface())
//!             .with_attribute(owns(demo("Demo.IAudio")))
//!             .with_attribute(owns(demo("Demo.Player"))),
//!     );
//! weave(&mut module)?;
//!
//! // Run time: load the woven module and build the tree
//! let mut modules = ModuleSet::new();
//! modules.load(&module)?;
//!
//! let creator = FactoryCreator::from_modules(&modules)?;
//! creator
//!     .register_default::<Game>("Demo.Game")
//!     .register_default::<Audio>("Demo.Audio")
//!     .register_default::<Player>("Demo.Player");
//!
//! let context = InjectionContext::new(Arc::new(modules.type_resolver()), Arc::new(creator));
//! let game = context.get_instance(attributes::MODULE, None)?;
//!
//! let player = context.children(Some(&game))[1].clone();
//! context.initialized(&player)?.wait().await?;
//!
//! assert!(player.downcast_ref::<Player>().unwrap().audio.downcast_ref::<Audio>().is_some());
//! # Ok(())
//! # }
//! ```
//!
//! ## Threading
//!
//! Each context is driven from one logical thread; see [`InjectionContext`].

#![cfg_attr(not(feature = "logging"), allow(unused_variables))]

mod asserter;
pub mod attributes;
mod component;
mod context;
mod creator;
mod error;
mod hierarchy;
mod hook;
pub mod injector;
mod instance;
mod loader;
#[cfg(feature = "logging")]
pub mod logging;
pub mod metadata;
mod resolver;
mod scanner;
mod settings;
mod synthesizer;
mod type_key;

pub use asserter::*;
pub use component::*;
pub use context::*;
pub use creator::*;
pub use error::*;
pub use hierarchy::*;
pub use hook::*;
pub use instance::*;
pub use loader::*;
pub use resolver::*;
pub use scanner::*;
pub use settings::*;
pub use synthesizer::*;
pub use type_key::*;

pub use metadata::{ModuleDef, ModuleImage, TypeDef, TypeRef};

/// `#[derive(Inject)]` for structs whose `#[needs]` fields are [`Dependency`] slots
#[cfg(feature = "derive")]
pub use tree_injector_derive::Inject;

// Re-export tracing macros for convenience when logging feature is enabled
#[cfg(feature = "logging")]
pub use tracing::{debug, error, info, trace, warn};

// Re-export for convenience
pub use std::sync::Arc;
pub use tokio_util::sync::CancellationToken;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        BuildHook, Component, Dependency, Disposable, FactoryCreator, HookError, Initializable,
        Inject, InjectionContext, InjectionError, Instance, ItemObserver, LifecycleState,
        ModuleSet, RegistryTypeResolver, Resolvable, Result, TypeKey, TypeResolver, Updatable,
        WeaveError, WeaveOutcome,
    };
    pub use async_trait::async_trait;
    pub use std::sync::Arc;
    pub use tokio_util::sync::CancellationToken;
}
