//! Error types for weaving and runtime injection

use thiserror::Error;

/// Structural errors raised by the ownership [`Hierarchy`](crate::Hierarchy)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HierarchyError {
    /// The element is already attached under another parent
    #[error("{element} is already parented to {current}, cannot attach it to {requested}")]
    AlreadyParented {
        element: String,
        current: String,
        requested: String,
    },

    /// The requested parent is not part of the hierarchy
    #[error("Parent {parent} is unknown from this hierarchy")]
    UnknownParent { parent: String },

    /// An element cannot own itself
    #[error("{element} cannot be its own parent")]
    SelfParent { element: String },

    /// The element is not part of the hierarchy
    #[error("{element} is unknown from this hierarchy")]
    UnknownElement { element: String },

    /// Non-recursive removal of an element that still owns children
    #[error("Can't remove {element} with {children} children, remove it recursively to do so")]
    HasChildren { element: String, children: usize },
}

/// Errors raised by the runtime injection engine
///
/// All of them are configuration errors: the host is expected to abort when
/// one surfaces. They are `Clone` so a single failure can be fanned out to
/// every waiter of an initialization milestone.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InjectionError {
    /// No concrete type implements the requested type
    #[error("No implementation registered for type {type_name}")]
    NoImplementation { type_name: String },

    /// More than one concrete type implements the requested type
    #[error("Ambiguous implementation for type {type_name}: {candidates:?}")]
    AmbiguousImplementation {
        type_name: String,
        candidates: Vec<String>,
    },

    /// The resolver answered with a type that is not assignable to the request
    #[error("Type resolver resolved to an incompatible type ({actual}) for type {requested}")]
    IncompatibleImplementation { requested: String, actual: String },

    /// The type is not part of any loaded registry
    #[error("Type {type_name} is unknown from the type registry")]
    UnknownType { type_name: String },

    /// The instance is not managed by this context
    #[error("{instance} is unknown from this injection context")]
    UnknownInstance { instance: String },

    /// The owner already holds an instance compatible with the requested type
    #[error("{owner} already contains an instance for type {type_name}")]
    AlreadyOwned { owner: String, type_name: String },

    /// The hierarchy walk reached the root without a match
    #[error("No dependency of type {type_name} found for instance: {instance}")]
    DependencyNotFound { type_name: String, instance: String },

    /// Modules group instances and never declare needs
    #[error("{instance} is a module and thus can't have dependencies")]
    ModuleCannotHaveNeeds { instance: String },

    /// The recorded needs form a cycle
    #[error("There is an initialization cycle introduced by a cyclic chain of needed dependencies: {chain}")]
    DependencyCycle { chain: String },

    /// A non-ignored dependency failed its own initialization
    #[error("{instance} can't initialize because its dependency {dependency} failed: {reason}")]
    DependencyFailed {
        instance: String,
        dependency: String,
        reason: String,
    },

    /// The instance was disposed before reaching the awaited milestone
    #[error("{instance} was cancelled before reaching {milestone}")]
    Cancelled { instance: String, milestone: String },

    /// No factory is registered for the concrete type
    #[error("No factory registered for type {type_name}")]
    NoFactory { type_name: String },

    /// The factory failed to build an instance
    #[error("Failed to create instance of {type_name}: {reason}")]
    CreationFailed { type_name: String, reason: String },

    /// The component does not accept the synthesized field assignment
    #[error("{type_name} has no injectable field named {field}")]
    UnknownField { type_name: String, field: String },

    /// Synthesized metadata could not be decoded into a binding
    #[error("Malformed injection binding for {type_name}: {reason}")]
    MalformedBinding { type_name: String, reason: String },

    /// No process-wide context is installed
    #[error("No injection context installed")]
    NoContext,

    /// The context was disposed
    #[error("The injection context has been disposed")]
    Disposed,

    /// Initialization tasks need a Tokio runtime to be spawned on
    #[error("Injection requires a running Tokio runtime")]
    NoRuntime,

    /// Ownership tree violation
    #[error(transparent)]
    Hierarchy(#[from] HierarchyError),
}

impl InjectionError {
    /// Create a NoImplementation error
    #[inline]
    pub fn no_implementation(type_name: impl Into<String>) -> Self {
        Self::NoImplementation {
            type_name: type_name.into(),
        }
    }

    /// Create an UnknownInstance error
    #[inline]
    pub fn unknown_instance(instance: impl std::fmt::Display) -> Self {
        Self::UnknownInstance {
            instance: instance.to_string(),
        }
    }

    /// Create a MalformedBinding error
    #[inline]
    pub fn malformed(type_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedBinding {
            type_name: type_name.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error only reports a disposal-triggered cancellation
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Build-time errors raised while weaving a module
#[derive(Error, Debug)]
pub enum WeaveError {
    /// The module already carries the processed marker
    #[error("Module {module} has already been processed")]
    AlreadyProcessed { module: String },

    /// A custom attribute carries an unexpected argument
    #[error("Malformed {attribute} on {type_name}: {reason}")]
    MalformedAttribute {
        type_name: String,
        attribute: String,
        reason: String,
    },

    /// The injection plan references a type the module does not define
    #[error("Type {type_name} is not defined in module {module}")]
    UnknownType { type_name: String, module: String },

    /// The type registry outgrows its 32-bit array indices
    #[error("Type registry {registry} cannot index {index} entries")]
    RegistryOverflow { registry: String, index: usize },

    /// Woven metadata could not be linked for the runtime
    #[error(transparent)]
    Binding(#[from] InjectionError),

    /// Reading or writing a module image failed
    #[error("I/O error on module image: {0}")]
    Io(#[from] std::io::Error),

    /// A module image or symbol file is not valid JSON
    #[error("Invalid module image: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Weaver settings could not be loaded or stored
    #[error("Invalid weaver settings: {0}")]
    Settings(String),
}

impl WeaveError {
    /// Create a MalformedAttribute error
    #[inline]
    pub fn malformed_attribute(
        type_name: impl Into<String>,
        attribute: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::MalformedAttribute {
            type_name: type_name.into(),
            attribute: attribute.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error is the distinguished "already processed" signal
    #[inline]
    pub fn is_already_processed(&self) -> bool {
        matches!(self, Self::AlreadyProcessed { .. })
    }
}

/// Errors returned by user lifecycle hooks
#[derive(Error, Debug)]
pub enum HookError {
    /// The hook observed its cancellation token
    #[error("Operation cancelled")]
    Cancelled,

    /// The hook failed
    #[error("{0}")]
    Failed(Box<dyn std::error::Error + Send + Sync>),
}

impl HookError {
    /// Create a failure from a message or any error type
    #[inline]
    pub fn failed(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Failed(error.into())
    }
}

/// Result type alias for runtime injection operations
pub type Result<T> = std::result::Result<T, InjectionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ambiguous_names_requested_type() {
        let err = InjectionError::AmbiguousImplementation {
            type_name: "Game.IWeapon".into(),
            candidates: vec!["Game.Sword".into(), "Game.Bow".into()],
        };
        let message = err.to_string();
        assert!(message.contains("Game.IWeapon"));
        assert!(message.contains("Game.Sword"));
    }

    #[test]
    fn test_hierarchy_error_converts() {
        let err: InjectionError = HierarchyError::SelfParent {
            element: "A#1".into(),
        }
        .into();
        assert!(matches!(err, InjectionError::Hierarchy(_)));
        assert_eq!(err.to_string(), "A#1 cannot be its own parent");
    }

    #[test]
    fn test_hook_error_from_message() {
        let err = HookError::failed("boom");
        assert_eq!(err.to_string(), "boom");
        assert!(InjectionError::Cancelled {
            instance: "A#1".into(),
            milestone: "initialized".into()
        }
        .is_cancelled());
    }
}
