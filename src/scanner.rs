//! Metadata scanner: the pure "plan" phase of weaving
//!
//! [`scan`] reads a module without touching it and produces an
//! [`InjectionPlan`]: one [`InjectableTypeDescriptor`] per type that owns,
//! needs or observes something, plus the [`InjectedTypeSet`] that must be
//! resolvable at runtime.

use crate::attributes::{self, INCLUDE_TYPE, INHERITS_FROM_INJECTABLE, IGNORE_TYPE, MODULE};
use crate::error::WeaveError;
use crate::metadata::{AttributeArgument, CustomAttribute, ModuleDef, TypeDef, TypeKind, TypeRef};
use std::collections::{BTreeSet, HashSet};

#[cfg(feature = "logging")]
use tracing::{debug, trace, warn};

/// Ordered set of every type that must be resolvable at runtime
pub type InjectedTypeSet = BTreeSet<TypeRef>;

/// A field annotated with the need marker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeededField {
    pub field: String,
    pub dependency: TypeRef,
    pub ignore_initialization: bool,
}

/// Everything the synthesizer needs to know about one injectable type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectableTypeDescriptor {
    pub type_ref: TypeRef,
    pub owned: BTreeSet<TypeRef>,
    pub owned_all: BTreeSet<TypeRef>,
    pub needs: Vec<NeededField>,
    pub observed: BTreeSet<TypeRef>,
    /// Injectable base whose resolve method is chained first
    pub injectable_base: Option<TypeRef>,
}

impl InjectableTypeDescriptor {
    /// Whether the type registers owned instances from its constructor
    pub fn is_owner(&self) -> bool {
        !self.owned.is_empty() || !self.owned_all.is_empty()
    }

    pub fn is_observer(&self) -> bool {
        !self.observed.is_empty()
    }
}

/// Immutable output of the scanner for one module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionPlan {
    pub module: String,
    pub injectable_types: Vec<InjectableTypeDescriptor>,
    pub injected_types: InjectedTypeSet,
}

impl InjectionPlan {
    /// Whether weaving this plan would change nothing
    pub fn is_empty(&self) -> bool {
        self.injectable_types.is_empty() && self.injected_types.is_empty()
    }

    pub fn descriptor(&self, type_name: &str) -> Option<&InjectableTypeDescriptor> {
        self.injectable_types
            .iter()
            .find(|d| d.type_ref.name == type_name)
    }
}

// =============================================================================
// Marker extraction
// =============================================================================

#[derive(Default)]
struct TypeMarkers {
    owned: BTreeSet<TypeRef>,
    owned_all: BTreeSet<TypeRef>,
    needs: Vec<NeededField>,
    observed: BTreeSet<TypeRef>,
    /// `Some(None)` when the inherits marker carries no type argument
    inherits: Option<Option<TypeRef>>,
}

impl TypeMarkers {
    fn is_injectable(&self) -> bool {
        !self.owned.is_empty()
            || !self.owned_all.is_empty()
            || !self.needs.is_empty()
            || !self.observed.is_empty()
            || self.inherits.is_some()
    }
}

fn type_argument(
    type_def: &TypeDef,
    attribute: &CustomAttribute,
) -> Result<TypeRef, WeaveError> {
    match attribute.arguments.as_slice() {
        [AttributeArgument::Type(target)] => Ok(target.clone()),
        [] => Err(WeaveError::malformed_attribute(
            &type_def.name,
            &attribute.attribute_type.name,
            "missing type argument",
        )),
        other => Err(WeaveError::malformed_attribute(
            &type_def.name,
            &attribute.attribute_type.name,
            format!("expected a single type argument, found {other:?}"),
        )),
    }
}

fn read_markers(module: &ModuleDef, type_def: &TypeDef) -> Result<TypeMarkers, WeaveError> {
    let mut markers = TypeMarkers::default();

    for attribute in &type_def.attributes {
        if attribute.is(attributes::OWNS) {
            markers.owned.insert(type_argument(type_def, attribute)?);
        } else if attribute.is(attributes::OWNS_ALL) {
            markers.owned_all.insert(type_argument(type_def, attribute)?);
        } else if attribute.is(INHERITS_FROM_INJECTABLE) {
            let declared = match attribute.arguments.as_slice() {
                [] => None,
                _ => Some(type_argument(type_def, attribute)?),
            };
            markers.inherits = Some(declared);
        }
    }

    for field in &type_def.fields {
        let Some(attribute) = field.attributes.iter().find(|a| a.is(attributes::NEEDS)) else {
            continue;
        };

        if field.is_static {
            return Err(WeaveError::malformed_attribute(
                format!("{}::{}", type_def.name, field.name),
                attributes::NEEDS,
                "needs can't be applied to a static field",
            ));
        }

        let ignore_initialization = match attribute.arguments.as_slice() {
            [] => false,
            [AttributeArgument::Bool(flag)] => *flag,
            other => {
                return Err(WeaveError::malformed_attribute(
                    format!("{}::{}", type_def.name, field.name),
                    attributes::NEEDS,
                    format!("expected an optional boolean argument, found {other:?}"),
                ));
            }
        };

        // only types defined in this module can be inspected
        if let Some(needed) = local_definition(module, &field.field_type) {
            if needed.kind != TypeKind::Interface {
                return Err(WeaveError::malformed_attribute(
                    format!("{}::{}", type_def.name, field.name),
                    attributes::NEEDS,
                    format!("needed type {} is not an interface", needed.name),
                ));
            }
        }

        markers.needs.push(NeededField {
            field: field.name.clone(),
            dependency: field.field_type.clone(),
            ignore_initialization,
        });
    }

    for interface in &type_def.interfaces {
        if interface.name != attributes::ITEM_OBSERVER {
            continue;
        }
        match interface.generic_args.first() {
            Some(observed) => {
                markers.observed.insert(observed.clone());
            }
            None => {
                return Err(WeaveError::malformed_attribute(
                    &type_def.name,
                    attributes::ITEM_OBSERVER,
                    "observer interface without observed type",
                ));
            }
        }
    }

    Ok(markers)
}

/// Type arguments of calls to the injector's instance entry points
fn entry_point_types(type_def: &TypeDef, injected: &mut InjectedTypeSet) {
    let calls = type_def
        .methods
        .iter()
        .flat_map(|m| m.instructions())
        .filter_map(|i| i.called_method())
        .filter(|m| attributes::is_instance_entry_point(m));

    for call in calls {
        if let Some(argument) = call.generic_args.first() {
            #[cfg(feature = "logging")]
            trace!(
                target: "tree_injector",
                caller = %type_def.name,
                entry_point = %call.name,
                argument = %argument,
                "Found injector call"
            );
            injected.insert(argument.clone());
        }
    }
}

// =============================================================================
// Hierarchy helpers
// =============================================================================

/// A type followed by every interface and base type reachable from it,
/// walking through definitions that live in the same module.
///
/// Order is `[type, interfaces…, base, base interfaces…, …]` without duplicates.
pub(crate) fn assignable_chain(module: &ModuleDef, type_ref: &TypeRef) -> Vec<TypeRef> {
    let mut chain = Vec::new();
    let mut seen = HashSet::new();
    let mut current = Some(type_ref.clone());

    while let Some(type_ref) = current.take() {
        if !seen.insert(type_ref.clone()) {
            break;
        }
        chain.push(type_ref.clone());

        let Some(type_def) = local_definition(module, &type_ref) else {
            break;
        };

        let mut pending: Vec<TypeRef> = type_def.interfaces.clone();
        while let Some(interface) = pending.pop() {
            if !seen.insert(interface.clone()) {
                continue;
            }
            if let Some(interface_def) = local_definition(module, &interface) {
                pending.extend(interface_def.interfaces.iter().cloned());
            }
            chain.push(interface);
        }

        current = type_def.base_type.clone();
    }

    chain
}

fn local_definition<'m>(module: &'m ModuleDef, type_ref: &TypeRef) -> Option<&'m TypeDef> {
    if type_ref.scope == module.name {
        module.find_type(&type_ref.name)
    } else {
        None
    }
}

fn injectable_base(
    module: &ModuleDef,
    type_def: &TypeDef,
    inherits: &Option<Option<TypeRef>>,
    injectable: &HashSet<&str>,
) -> Option<TypeRef> {
    match inherits {
        // The declared type wins over the compiled base
        Some(Some(declared)) => {
            let compiled = assignable_chain(module, &type_def.reference(&module.name));
            if !compiled.iter().skip(1).any(|t| t == declared) {
                #[cfg(feature = "logging")]
                warn!(
                    target: "tree_injector",
                    type_name = %type_def.name,
                    declared = %declared,
                    compiled = ?type_def.base_type.as_ref().map(TypeRef::full_name),
                    "Injectable base declared by marker is not a compiled base type"
                );
            }
            Some(declared.clone())
        }
        Some(None) => type_def.base_type.clone(),
        None => {
            let mut current = type_def.base_type.clone();
            while let Some(base) = current {
                let base_def = local_definition(module, &base)?;
                if injectable.contains(base.name.as_str()) {
                    return Some(base);
                }
                current = base_def.base_type.clone();
            }
            None
        }
    }
}

fn close_over_hierarchy(module: &ModuleDef, injected: &mut InjectedTypeSet) {
    loop {
        let mut added = false;

        for type_def in &module.types {
            if !type_def.is_concrete_class()
                || type_def.has_attribute(IGNORE_TYPE)
                || attributes::is_registry_type(&type_def.name)
            {
                continue;
            }

            let reference = type_def.reference(&module.name);
            if injected.contains(&reference) {
                continue;
            }

            let reachable = type_def.has_attribute(INCLUDE_TYPE)
                || type_def.has_attribute(INHERITS_FROM_INJECTABLE)
                || assignable_chain(module, &reference)
                    .iter()
                    .skip(1)
                    .any(|t| t.name == MODULE || injected.contains(t));

            if reachable {
                injected.insert(reference);
                added = true;
            }
        }

        if !added {
            break;
        }
    }
}

// =============================================================================
// Scan
// =============================================================================

/// Scan a module and build its injection plan
pub fn scan(module: &ModuleDef) -> Result<InjectionPlan, WeaveError> {
    let mut injected = InjectedTypeSet::new();
    let mut scanned = Vec::new();

    for type_def in &module.types {
        if type_def.has_attribute(IGNORE_TYPE) || attributes::is_registry_type(&type_def.name) {
            continue;
        }

        let markers = read_markers(module, type_def)?;

        injected.extend(markers.owned.iter().cloned());
        injected.extend(markers.owned_all.iter().cloned());
        injected.extend(markers.needs.iter().map(|n| n.dependency.clone()));
        injected.extend(markers.observed.iter().cloned());
        entry_point_types(type_def, &mut injected);

        scanned.push((type_def, markers));
    }

    let injectable: HashSet<&str> = scanned
        .iter()
        .filter(|(_, markers)| markers.is_injectable())
        .map(|(type_def, _)| type_def.name.as_str())
        .collect();

    let mut injectable_types = Vec::new();
    for (type_def, markers) in scanned {
        if !markers.is_injectable() {
            continue;
        }

        let reference = type_def.reference(&module.name);
        if type_def.is_concrete_class() {
            injected.insert(reference.clone());
        }

        let injectable_base = injectable_base(module, type_def, &markers.inherits, &injectable);

        injectable_types.push(InjectableTypeDescriptor {
            type_ref: reference,
            owned: markers.owned,
            owned_all: markers.owned_all,
            needs: markers.needs,
            observed: markers.observed,
            injectable_base,
        });
    }

    close_over_hierarchy(module, &mut injected);

    injected.retain(|t| {
        !t.is_open()
            && !local_definition(module, t).is_some_and(|d| d.has_attribute(IGNORE_TYPE))
    });

    #[cfg(feature = "logging")]
    debug!(
        target: "tree_injector",
        module = %module.name,
        injectable = injectable_types.len(),
        injected = injected.len(),
        "Scanned module"
    );

    Ok(InjectionPlan {
        module: module.name.clone(),
        injectable_types,
        injected_types: injected,
    })
}
