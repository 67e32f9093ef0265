//! Bytecode synthesizer: the "mutate" phase of weaving
//!
//! [`Synthesizer::apply`] is a function of an [`InjectionPlan`]: it rewrites
//! the planned types in place and never looks at attributes again.
//!
//! For every descriptor it may:
//!
//! 1. register owned instances from a private parameterless constructor,
//! 2. add the injected marker and a chained, protected resolve method,
//! 3. add the observer marker with register/unregister methods.
//!
//! It then emits the module's type registry and marks the module processed.
//!
//! # Example
//!
//! ```rust
//! use tree_injector::metadata::{ModuleDef, TypeDef, TypeRef};
//! use tree_injector::{attributes, weave, WeaveOutcome};
//!
//! let mut module = ModuleDef::new("Game")
//!     .with_type(TypeDef::class("Game.Audio"))
//!     .with_type(
//!         TypeDef::class("Game.Boot")
//!             .with_attribute(attributes::owns(TypeRef::new("Game", "Game.Audio"))),
//!     );
//!
//! assert_eq!(weave(&mut module).unwrap(), WeaveOutcome::Modified);
//! assert!(weave(&mut module).unwrap_err().is_already_processed());
//! ```

use crate::attributes::{
    self, contract_type, entry_point, system_type, ADD_INSTANCE, ADD_INSTANCES, FIND_DEPENDENCY,
    INJECTED, INJECTED_RESOLVE, INJECTOR, INJECTOR_ADVANCED, INJECTOR_INTERNAL,
    ITEM_OBSERVER_MARKER, PROCESSED, RESOLVE_METHOD,
};
use crate::error::WeaveError;
use crate::metadata::{
    CustomAttribute, FieldDef, FieldRef, Instruction, MethodDef, MethodRef, ModuleDef, TypeDef,
    TypeKind, TypeRef, Visibility, CONSTRUCTOR, STATIC_CONSTRUCTOR,
};
use crate::scanner::{self, InjectableTypeDescriptor, InjectedTypeSet, InjectionPlan};

#[cfg(feature = "logging")]
use tracing::{debug, info, trace};

/// Result of weaving one module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeaveOutcome {
    /// The module was rewritten and must be written back
    Modified,
    /// Nothing to inject
    Unchanged,
}

/// Fail with [`WeaveError::AlreadyProcessed`] if the module carries the
/// processed marker.
pub fn ensure_unprocessed(module: &ModuleDef) -> Result<(), WeaveError> {
    if module.has_attribute(PROCESSED) {
        return Err(WeaveError::AlreadyProcessed {
            module: module.name.clone(),
        });
    }
    Ok(())
}

/// Scan then synthesize a module in place
pub fn weave(module: &mut ModuleDef) -> Result<WeaveOutcome, WeaveError> {
    ensure_unprocessed(module)?;
    let plan = scanner::scan(module)?;
    Synthesizer::new(module)?.apply(&plan)
}

/// Applies an injection plan to the module it was scanned from
pub struct Synthesizer<'m> {
    module: &'m mut ModuleDef,
}

impl<'m> Synthesizer<'m> {
    /// Prepare a module for mutation; refuses modules already processed
    pub fn new(module: &'m mut ModuleDef) -> Result<Self, WeaveError> {
        ensure_unprocessed(module)?;
        Ok(Self { module })
    }

    /// Rewrite the module according to the plan
    pub fn apply(self, plan: &InjectionPlan) -> Result<WeaveOutcome, WeaveError> {
        if plan.is_empty() {
            #[cfg(feature = "logging")]
            debug!(target: "tree_injector", module = %self.module.name, "Nothing to inject");
            return Ok(WeaveOutcome::Unchanged);
        }

        for descriptor in &plan.injectable_types {
            let module_name = self.module.name.clone();
            let type_def = if descriptor.type_ref.scope == module_name {
                self.module.find_type_mut(&descriptor.type_ref.name)
            } else {
                None
            };
            let type_def = type_def.ok_or_else(|| WeaveError::UnknownType {
                type_name: descriptor.type_ref.full_name(),
                module: module_name,
            })?;

            if descriptor.is_owner() {
                synthesize_owner(type_def, descriptor);
            }
            synthesize_resolver(type_def, descriptor);
            if descriptor.is_observer() {
                synthesize_observer(type_def, descriptor);
            }
        }

        let registry = registry_type(self.module, &plan.injected_types)?;
        self.module.types.push(registry);
        self.module
            .attributes
            .push(CustomAttribute::new(contract_type(PROCESSED)));

        #[cfg(feature = "logging")]
        info!(
            target: "tree_injector",
            module = %self.module.name,
            injectable = plan.injectable_types.len(),
            registered = plan.injected_types.len(),
            "Module injected"
        );

        Ok(WeaveOutcome::Modified)
    }
}

// =============================================================================
// Owners
// =============================================================================

fn base_constructor_call(body: &[Instruction]) -> Option<usize> {
    body.iter().position(|instruction| {
        matches!(instruction, Instruction::Call(method) if method.is_constructor() && method.has_this)
    })
}

/// Build a private parameterless constructor, keeping the field initializers
/// of an existing parameterized constructor.
fn parameterless_constructor(type_def: &TypeDef) -> MethodDef {
    let template = type_def
        .methods
        .iter()
        .filter(|m| m.is_constructor() && !m.parameters.is_empty())
        .find_map(|m| {
            let body = m.body.as_deref()?;
            let call = base_constructor_call(body)?;
            let initializers = body[..call]
                .iter()
                .rposition(|i| matches!(i, Instruction::StFld(_)))
                .map(|last_store| body[..=last_store].to_vec())
                .unwrap_or_default();
            Some((initializers, body[call].clone()))
        });

    let (mut body, base_call) = match template {
        Some((initializers, base_call)) => (initializers, base_call),
        None => {
            let base = type_def
                .base_type
                .clone()
                .unwrap_or_else(|| system_type(attributes::SYSTEM_OBJECT));
            (Vec::new(), Instruction::Call(MethodRef::instance(base, CONSTRUCTOR)))
        }
    };

    body.extend([Instruction::LdArg0, base_call, Instruction::Ret]);

    MethodDef {
        name: CONSTRUCTOR.into(),
        visibility: Visibility::Private,
        body: Some(body),
        ..MethodDef::default()
    }
}

fn registration(entry: &str, owned: &TypeRef) -> [Instruction; 4] {
    [
        Instruction::LdArg0,
        Instruction::Call(entry_point(INJECTOR_ADVANCED, entry, owned.clone())),
        Instruction::Pop,
        Instruction::Nop,
    ]
}

fn synthesize_owner(type_def: &mut TypeDef, descriptor: &InjectableTypeDescriptor) {
    let index = match type_def.methods.iter().position(|m| m.is_constructor() && m.parameters.is_empty()) {
        Some(index) => index,
        None => {
            #[cfg(feature = "logging")]
            trace!(target: "tree_injector", type_name = %type_def.name, "Synthesizing parameterless constructor");
            let constructor = parameterless_constructor(type_def);
            type_def.methods.push(constructor);
            type_def.methods.len() - 1
        }
    };

    let registrations: Vec<Instruction> = descriptor
        .owned
        .iter()
        .flat_map(|owned| registration(ADD_INSTANCE, owned))
        .chain(
            descriptor
                .owned_all
                .iter()
                .flat_map(|owned| registration(ADD_INSTANCES, owned)),
        )
        .collect();

    let body = type_def.methods[index].body.get_or_insert_with(|| vec![Instruction::Ret]);
    let at = base_constructor_call(body).map(|call| call + 1).unwrap_or(0);
    body.splice(at..at, registrations);

    #[cfg(feature = "logging")]
    debug!(
        target: "tree_injector",
        type_name = %type_def.name,
        owned = descriptor.owned.len(),
        owned_all = descriptor.owned_all.len(),
        "Registered owned instances in constructor"
    );
}

// =============================================================================
// Resolvers
// =============================================================================

fn synthesize_resolver(type_def: &mut TypeDef, descriptor: &InjectableTypeDescriptor) {
    let this = descriptor.type_ref.clone();
    let mut body = Vec::new();

    // Base fields are resolved before ours
    if let Some(base) = &descriptor.injectable_base {
        body.push(Instruction::LdArg0);
        body.push(Instruction::Call(MethodRef::instance(base.clone(), RESOLVE_METHOD)));
    }

    for need in &descriptor.needs {
        body.extend([
            Instruction::LdArg0,
            Instruction::LdArg0,
            Instruction::LdcI4(i32::from(need.ignore_initialization)),
            Instruction::Call(entry_point(INJECTOR, FIND_DEPENDENCY, need.dependency.clone())),
            Instruction::StFld(FieldRef {
                declaring_type: this.clone(),
                name: need.field.clone(),
                field_type: need.dependency.clone(),
            }),
        ]);
    }
    body.push(Instruction::Ret);

    type_def.methods.push(MethodDef {
        name: RESOLVE_METHOD.into(),
        visibility: Visibility::Family,
        is_virtual: true,
        is_new_slot: descriptor.injectable_base.is_none(),
        body: Some(body),
        ..MethodDef::default()
    });

    if !type_def.has_interface(INJECTED) {
        type_def.interfaces.push(contract_type(INJECTED));
    }

    if descriptor.injectable_base.is_none() {
        type_def.methods.push(explicit_implementation(
            INJECTED,
            INJECTED_RESOLVE,
            vec![
                Instruction::LdArg0,
                Instruction::CallVirt(MethodRef::instance(this, RESOLVE_METHOD)),
                Instruction::Ret,
            ],
        ));
    }

    #[cfg(feature = "logging")]
    debug!(
        target: "tree_injector",
        type_name = %type_def.name,
        needs = descriptor.needs.len(),
        base = ?descriptor.injectable_base.as_ref().map(TypeRef::full_name),
        "Synthesized resolve method"
    );
}

fn explicit_implementation(interface: &str, method: &str, body: Vec<Instruction>) -> MethodDef {
    MethodDef {
        name: format!("{interface}.{method}"),
        visibility: Visibility::Private,
        is_virtual: true,
        is_new_slot: true,
        is_final: true,
        overrides: vec![MethodRef::instance(contract_type(interface), method)],
        body: Some(body),
        ..MethodDef::default()
    }
}

// =============================================================================
// Observers
// =============================================================================

fn synthesize_observer(type_def: &mut TypeDef, descriptor: &InjectableTypeDescriptor) {
    if !type_def.has_interface(ITEM_OBSERVER_MARKER) {
        type_def.interfaces.push(contract_type(ITEM_OBSERVER_MARKER));
    }

    let methods = [
        (attributes::ITEM_OBSERVER_REGISTER, attributes::REGISTER_ITEM_OBSERVER),
        (attributes::ITEM_OBSERVER_UNREGISTER, attributes::UNREGISTER_ITEM_OBSERVER),
    ];

    for (method, entry) in methods {
        let mut body: Vec<Instruction> = descriptor
            .observed
            .iter()
            .flat_map(|observed| {
                [
                    Instruction::LdArg0,
                    Instruction::Call(entry_point(INJECTOR_INTERNAL, entry, observed.clone())),
                ]
            })
            .collect();
        body.push(Instruction::Ret);

        type_def
            .methods
            .push(explicit_implementation(ITEM_OBSERVER_MARKER, method, body));
    }
}

// =============================================================================
// Registry
// =============================================================================

fn array_type(element: &str) -> TypeRef {
    system_type(&format!("{element}[]"))
}

/// Push an array length or index; the registry is indexed with 32-bit integers
fn load_index(value: usize, registry: &str) -> Result<Instruction, WeaveError> {
    i32::try_from(value)
        .map(Instruction::LdcI4)
        .map_err(|_| WeaveError::RegistryOverflow {
            registry: registry.to_string(),
            index: value,
        })
}

fn registry_type(module: &ModuleDef, injected: &InjectedTypeSet) -> Result<TypeDef, WeaveError> {
    let name = attributes::registry_type_name(&module.name);
    let table_type = array_type(&format!("{}[]", attributes::SYSTEM_TYPE));
    let table = FieldRef {
        declaring_type: TypeRef::new(module.name.clone(), name.clone()),
        name: attributes::REGISTRY_FIELD.into(),
        field_type: table_type.clone(),
    };
    let type_from_handle = MethodRef::static_method(
        system_type(attributes::SYSTEM_TYPE),
        attributes::GET_TYPE_FROM_HANDLE,
        Vec::new(),
    );

    let rows: Vec<Vec<TypeRef>> = injected
        .iter()
        .map(|type_ref| scanner::assignable_chain(module, type_ref))
        .collect();

    let mut body = vec![
        load_index(rows.len(), &name)?,
        Instruction::NewArr(array_type(attributes::SYSTEM_TYPE)),
    ];
    for (i, row) in rows.iter().enumerate() {
        body.extend([
            Instruction::Dup,
            load_index(i, &name)?,
            load_index(row.len(), &name)?,
            Instruction::NewArr(system_type(attributes::SYSTEM_TYPE)),
        ]);
        for (j, type_ref) in row.iter().enumerate() {
            body.extend([
                Instruction::Dup,
                load_index(j, &name)?,
                Instruction::LdToken(type_ref.clone()),
                Instruction::Call(type_from_handle.clone()),
                Instruction::StElemRef,
            ]);
        }
        body.push(Instruction::StElemRef);
    }
    body.extend([Instruction::StSFld(table), Instruction::Ret]);

    #[cfg(feature = "logging")]
    debug!(target: "tree_injector", registry = %name, rows = rows.len(), "Emitted type registry");

    Ok(TypeDef {
        name,
        kind: TypeKind::Class,
        is_abstract: true,
        fields: vec![FieldDef::new(attributes::REGISTRY_FIELD, table_type).static_field()],
        methods: vec![MethodDef {
            name: STATIC_CONSTRUCTOR.into(),
            visibility: Visibility::Private,
            is_static: true,
            body: Some(body),
            ..MethodDef::default()
        }],
        ..TypeDef::default()
    })
}
