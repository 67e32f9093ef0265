//! Contract surface shared by the scanner, the synthesizer and the runtime
//!
//! These are the full names of the markers user code is annotated with, the
//! interfaces the runtime recognizes, and the injector entry points that woven
//! method bodies call. Helper constructors build the matching
//! [`CustomAttribute`]s for modules assembled in code.

use crate::metadata::{AttributeArgument, CustomAttribute, MethodRef, TypeRef};

/// Scope (module name) that defines the contract types
pub const CONTRACT_SCOPE: &str = "Injection";

// Markers applied by user code
pub const OWNS: &str = "Injection.OwnsAttribute";
pub const OWNS_ALL: &str = "Injection.OwnsAllAttribute";
pub const NEEDS: &str = "Injection.NeedsAttribute";
pub const INCLUDE_TYPE: &str = "Injection.IncludeTypeAttribute";
pub const IGNORE_TYPE: &str = "Injection.IgnoreTypeAttribute";
pub const INHERITS_FROM_INJECTABLE: &str = "Injection.InheritsFromInjectableAttribute";

// Interfaces implemented by user code
pub const MODULE: &str = "Injection.IModule";
pub const ITEM_OBSERVER: &str = "Injection.IItemObserver";

// Synthesized markers
pub const INJECTED: &str = "Injection.Internal.__IInjected";
pub const INJECTED_RESOLVE: &str = "Resolve";
pub const ITEM_OBSERVER_MARKER: &str = "Injection.Internal.__IItemObserver";
pub const ITEM_OBSERVER_REGISTER: &str = "Register";
pub const ITEM_OBSERVER_UNREGISTER: &str = "Unregister";
pub const PROCESSED: &str = "Injection.Internal.__PostProcessedAttribute";

// Synthesized members
pub const RESOLVE_METHOD: &str = "<>Injected<>Resolve";
pub const REGISTRY_NAMESPACE: &str = "__Injection";
pub const REGISTRY_TYPE: &str = "__Registry";
pub const REGISTRY_FIELD: &str = "__types";

// Injector entry points
pub const INJECTOR: &str = "Injection.Injector";
pub const INJECTOR_ADVANCED: &str = "Injection.Injector/Advanced";
pub const INJECTOR_INTERNAL: &str = "Injection.Injector/Internal";
pub const GET_INSTANCE: &str = "GetInstance";
pub const GET_INSTANCES: &str = "GetInstances";
pub const ADD_INSTANCE: &str = "AddInstance";
pub const ADD_INSTANCES: &str = "AddInstances";
pub const FIND_DEPENDENCY: &str = "FindDependency";
pub const REGISTER_ITEM_OBSERVER: &str = "RegisterItemObserver";
pub const UNREGISTER_ITEM_OBSERVER: &str = "UnregisterItemObserver";

// Runtime library types referenced by synthesized code
pub const SYSTEM_SCOPE: &str = "System";
pub const SYSTEM_OBJECT: &str = "System.Object";
pub const SYSTEM_TYPE: &str = "System.Type";
pub const GET_TYPE_FROM_HANDLE: &str = "GetTypeFromHandle";

/// Reference a contract type
pub fn contract_type(name: &str) -> TypeRef {
    TypeRef::new(CONTRACT_SCOPE, name)
}

/// Reference a runtime library type
pub fn system_type(name: &str) -> TypeRef {
    TypeRef::new(SYSTEM_SCOPE, name)
}

/// Name of the registry type synthesized for a module
pub fn registry_type_name(module: &str) -> String {
    format!("{REGISTRY_NAMESPACE}.{module}.{REGISTRY_TYPE}")
}

/// Whether a type name is a synthesized registry
pub fn is_registry_type(name: &str) -> bool {
    name.starts_with(REGISTRY_NAMESPACE) && name.ends_with(REGISTRY_TYPE)
}

/// Whether a method reference targets one of the injector's generic entry
/// points that make their type argument resolvable at runtime.
pub fn is_instance_entry_point(method: &MethodRef) -> bool {
    match method.declaring_type.name.as_str() {
        INJECTOR => matches!(method.name.as_str(), GET_INSTANCE | GET_INSTANCES),
        INJECTOR_ADVANCED => matches!(
            method.name.as_str(),
            GET_INSTANCE | GET_INSTANCES | ADD_INSTANCE | ADD_INSTANCES
        ),
        _ => false,
    }
}

/// Call target of an injector entry point closed over `argument`
pub fn entry_point(declaring: &str, name: &str, argument: TypeRef) -> MethodRef {
    MethodRef::static_method(contract_type(declaring), name, vec![argument])
}

// =============================================================================
// Attribute builders
// =============================================================================

/// `[Owns(typeof(T))]`
pub fn owns(owned: TypeRef) -> CustomAttribute {
    CustomAttribute::new(contract_type(OWNS)).with_argument(AttributeArgument::Type(owned))
}

/// `[OwnsAll(typeof(T))]`
pub fn owns_all(owned: TypeRef) -> CustomAttribute {
    CustomAttribute::new(contract_type(OWNS_ALL)).with_argument(AttributeArgument::Type(owned))
}

/// `[Needs]`, `[Needs(ignoreInitialization)]`
pub fn needs(ignore_initialization: bool) -> CustomAttribute {
    let attribute = CustomAttribute::new(contract_type(NEEDS));
    if ignore_initialization {
        attribute.with_argument(AttributeArgument::Bool(true))
    } else {
        attribute
    }
}

/// `[IncludeType]`
pub fn include_type() -> CustomAttribute {
    CustomAttribute::new(contract_type(INCLUDE_TYPE))
}

/// `[IgnoreType]`
pub fn ignore_type() -> CustomAttribute {
    CustomAttribute::new(contract_type(IGNORE_TYPE))
}

/// `[InheritsFromInjectable]`, optionally naming the injectable base
pub fn inherits_from_injectable(base: Option<TypeRef>) -> CustomAttribute {
    let attribute = CustomAttribute::new(contract_type(INHERITS_FROM_INJECTABLE));
    match base {
        Some(base) => attribute.with_argument(AttributeArgument::Type(base)),
        None => attribute,
    }
}

/// The `IModule` interface reference
pub fn module_interface() -> TypeRef {
    contract_type(MODULE)
}

/// `IItemObserver<T>` interface reference
pub fn item_observer(observed: TypeRef) -> TypeRef {
    TypeRef::generic(CONTRACT_SCOPE, ITEM_OBSERVER, vec![observed])
}
