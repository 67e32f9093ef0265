//! Runtime view of woven modules
//!
//! A [`ModuleSet`] is what the runtime knows about the modules it loaded: a
//! catalog of type definitions, the registry rows emitted by the synthesizer,
//! and one [`TypeBinding`] per class decoded from the synthesized members.
//!
//! Bindings are the explicit form of what woven code does:
//!
//! - constructor registrations become [`OwnedRegistration`]s, base classes first,
//! - resolve methods become a linked [`ResolveChain`] following the base calls,
//! - observer registration methods become the observed type list.

use crate::attributes::{
    self, ADD_INSTANCE, ADD_INSTANCES, FIND_DEPENDENCY, INJECTOR, INJECTOR_ADVANCED,
    ITEM_OBSERVER_MARKER, RESOLVE_METHOD,
};
use crate::error::{InjectionError, Result, WeaveError};
use crate::metadata::{Instruction, MethodDef, ModuleDef, ModuleImage, TypeDef, TypeKind};
use crate::resolver::RegistryTypeResolver;
use crate::type_key::TypeKey;
use ahash::RandomState;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

#[cfg(feature = "logging")]
use tracing::{debug, warn};

// =============================================================================
// Bindings
// =============================================================================

/// An instance registered by a constructor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedRegistration {
    pub type_key: TypeKey,
    /// `true` for "add instances": every implementation is created
    pub all: bool,
}

/// One needed field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveStep {
    pub field: String,
    pub dependency: TypeKey,
    pub ignore_initialization: bool,
}

/// Resolve steps declared by one type, linked to the steps of its injectable base
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveChain {
    pub declaring_type: TypeKey,
    pub steps: Vec<ResolveStep>,
    pub next: Option<Arc<ResolveChain>>,
}

impl ResolveChain {
    /// Every step in execution order: the deepest base first
    pub fn ordered_steps(&self) -> Vec<&ResolveStep> {
        let mut links = vec![self];
        let mut current = self.next.as_deref();
        while let Some(link) = current {
            links.push(link);
            current = link.next.as_deref();
        }
        links.iter().rev().flat_map(|link| link.steps.iter()).collect()
    }

    pub fn has_needs(&self) -> bool {
        !self.steps.is_empty() || self.next.as_ref().is_some_and(|next| next.has_needs())
    }
}

/// Everything the runtime does on behalf of one concrete class
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeBinding {
    pub type_key: TypeKey,
    pub owned: Vec<OwnedRegistration>,
    pub resolve: Option<Arc<ResolveChain>>,
    pub observed: Vec<TypeKey>,
}

impl TypeBinding {
    /// Binding of a type with no woven members
    pub fn empty(type_key: TypeKey) -> Self {
        Self {
            type_key,
            owned: Vec::new(),
            resolve: None,
            observed: Vec::new(),
        }
    }

    pub fn has_needs(&self) -> bool {
        self.resolve.as_ref().is_some_and(|chain| chain.has_needs())
    }
}

/// Catalog entry of a loaded type definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeInfo {
    pub kind: TypeKind,
    pub is_abstract: bool,
    pub is_generic_definition: bool,
    pub base: Option<TypeKey>,
    pub interfaces: Vec<TypeKey>,
}

impl TypeInfo {
    pub fn is_concrete(&self) -> bool {
        self.kind == TypeKind::Class && !self.is_abstract && !self.is_generic_definition
    }
}

#[derive(Debug, Default)]
struct RawResolve {
    base: Option<TypeKey>,
    steps: Vec<ResolveStep>,
}

#[derive(Debug, Default)]
struct RawBinding {
    owned: Vec<OwnedRegistration>,
    resolve: Option<RawResolve>,
    observed: Vec<TypeKey>,
}

// =============================================================================
// Decoding
// =============================================================================

fn generic_argument(type_def: &TypeDef, method: &crate::metadata::MethodRef) -> Result<TypeKey> {
    method
        .generic_args
        .first()
        .map(TypeKey::from)
        .ok_or_else(|| {
            InjectionError::malformed(&type_def.name, format!("call to {} without type argument", method.name))
        })
}

fn decode_owned(type_def: &TypeDef) -> Result<Vec<OwnedRegistration>> {
    let Some(constructor) = type_def.default_constructor() else {
        return Ok(Vec::new());
    };

    let mut owned = Vec::new();
    for method in constructor.instructions().iter().filter_map(Instruction::called_method) {
        if method.declaring_type.name != INJECTOR_ADVANCED {
            continue;
        }
        let all = match method.name.as_str() {
            ADD_INSTANCE => false,
            ADD_INSTANCES => true,
            _ => continue,
        };
        owned.push(OwnedRegistration {
            type_key: generic_argument(type_def, method)?,
            all,
        });
    }
    Ok(owned)
}

fn decode_resolve(type_def: &TypeDef, method: &MethodDef) -> Result<RawResolve> {
    let mut raw = RawResolve::default();
    let mut flag = None;
    let mut pending: Option<(TypeKey, bool)> = None;

    for instruction in method.instructions() {
        match instruction {
            Instruction::LdcI4(value) => flag = Some(*value != 0),
            Instruction::Call(call) if call.name == RESOLVE_METHOD && call.has_this => {
                raw.base = Some(TypeKey::from(&call.declaring_type));
            }
            Instruction::Call(call)
                if call.declaring_type.name == INJECTOR && call.name == FIND_DEPENDENCY =>
            {
                let dependency = generic_argument(type_def, call)?;
                pending = Some((dependency, flag.take().unwrap_or(false)));
            }
            Instruction::StFld(field) => {
                if let Some((dependency, ignore_initialization)) = pending.take() {
                    raw.steps.push(ResolveStep {
                        field: field.name.clone(),
                        dependency,
                        ignore_initialization,
                    });
                }
            }
            _ => {}
        }
    }

    if let Some((dependency, _)) = pending {
        return Err(InjectionError::malformed(
            &type_def.name,
            format!("dependency {dependency} is looked up but never stored"),
        ));
    }

    Ok(raw)
}

fn decode_observed(type_def: &TypeDef) -> Result<Vec<TypeKey>> {
    let name = format!("{ITEM_OBSERVER_MARKER}.{}", attributes::ITEM_OBSERVER_REGISTER);
    let Some(method) = type_def.find_method(&name) else {
        return Ok(Vec::new());
    };

    method
        .instructions()
        .iter()
        .filter_map(Instruction::called_method)
        .filter(|call| call.name == attributes::REGISTER_ITEM_OBSERVER)
        .map(|call| generic_argument(type_def, call))
        .collect()
}

fn decode_registry(type_def: &TypeDef) -> Result<Vec<Vec<TypeKey>>> {
    let initializer = type_def
        .find_method(crate::metadata::STATIC_CONSTRUCTOR)
        .ok_or_else(|| InjectionError::malformed(&type_def.name, "registry without initializer"))?;

    let mut rows: Vec<Vec<TypeKey>> = Vec::new();
    for instruction in initializer.instructions() {
        match instruction {
            Instruction::NewArr(element) if element.name == attributes::SYSTEM_TYPE => {
                rows.push(Vec::new());
            }
            Instruction::LdToken(type_ref) => {
                rows.last_mut()
                    .ok_or_else(|| {
                        InjectionError::malformed(&type_def.name, "type token outside of a registry row")
                    })?
                    .push(TypeKey::from(type_ref));
            }
            _ => {}
        }
    }
    Ok(rows)
}

// =============================================================================
// Module set
// =============================================================================

/// Every module loaded into the runtime
#[derive(Debug, Default)]
pub struct ModuleSet {
    modules: Vec<String>,
    catalog: HashMap<TypeKey, TypeInfo, RandomState>,
    rows: Vec<Vec<TypeKey>>,
    raw: HashMap<TypeKey, RawBinding, RandomState>,
}

impl ModuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a woven module
    pub fn load(&mut self, module: &ModuleDef) -> Result<()> {
        if !module.has_attribute(attributes::PROCESSED) {
            #[cfg(feature = "logging")]
            warn!(target: "tree_injector", module = %module.name, "Loading a module that was never injected");
        }

        for type_def in &module.types {
            if attributes::is_registry_type(&type_def.name) {
                self.rows.extend(decode_registry(type_def)?);
                continue;
            }

            let key = TypeKey::new(&type_def.name);
            self.catalog.insert(
                key.clone(),
                TypeInfo {
                    kind: type_def.kind,
                    is_abstract: type_def.is_abstract,
                    is_generic_definition: !type_def.generic_parameters.is_empty(),
                    base: type_def.base_type.as_ref().map(TypeKey::from),
                    interfaces: type_def.interfaces.iter().map(TypeKey::from).collect(),
                },
            );

            let resolve = type_def
                .find_method(RESOLVE_METHOD)
                .map(|method| decode_resolve(type_def, method))
                .transpose()?;
            let raw = RawBinding {
                owned: decode_owned(type_def)?,
                resolve,
                observed: decode_observed(type_def)?,
            };
            if !raw.owned.is_empty() || raw.resolve.is_some() || !raw.observed.is_empty() {
                self.raw.insert(key, raw);
            }
        }

        #[cfg(feature = "logging")]
        debug!(
            target: "tree_injector",
            module = %module.name,
            types = module.types.len(),
            rows = self.rows.len(),
            "Loaded module"
        );

        self.modules.push(module.name.clone());
        Ok(())
    }

    /// Load a module image from disk
    pub fn load_image(&mut self, path: impl AsRef<Path>) -> std::result::Result<(), WeaveError> {
        let image = ModuleImage::read(path)?;
        self.load(&image.module)?;
        Ok(())
    }

    /// Names of the loaded modules, in load order
    pub fn modules(&self) -> &[String] {
        &self.modules
    }

    pub fn registry_rows(&self) -> &[Vec<TypeKey>] {
        &self.rows
    }

    pub fn type_info(&self, key: &TypeKey) -> Option<&TypeInfo> {
        self.catalog.get(key)
    }

    /// Concrete classes of every loaded module
    pub fn concrete_types(&self) -> impl Iterator<Item = &TypeKey> {
        self.catalog
            .iter()
            .filter(|(_, info)| info.is_concrete())
            .map(|(key, _)| key)
    }

    /// Build the default type resolver from the loaded registries
    pub fn type_resolver(&self) -> RegistryTypeResolver {
        RegistryTypeResolver::new(self.rows.clone(), self.concrete_types().cloned())
    }

    /// `key` followed by its loaded base types, most derived first
    fn base_chain(&self, key: &TypeKey) -> Vec<TypeKey> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = Some(key.clone());
        while let Some(key) = current {
            if !seen.insert(key.clone()) {
                break;
            }
            current = self.catalog.get(&key).and_then(|info| info.base.clone());
            chain.push(key);
        }
        chain
    }

    /// Nearest type in the base chain declaring a resolve method
    fn nearest_resolve(&self, key: &TypeKey) -> Option<(TypeKey, &RawResolve)> {
        self.base_chain(key).into_iter().find_map(|candidate| {
            let raw = self.raw.get(&candidate)?.resolve.as_ref()?;
            Some((candidate, raw))
        })
    }

    fn link_resolve(
        &self,
        declaring: TypeKey,
        raw: &RawResolve,
        visited: &mut HashSet<TypeKey>,
    ) -> Result<Arc<ResolveChain>> {
        if !visited.insert(declaring.clone()) {
            return Err(InjectionError::malformed(declaring.as_str(), "cyclic resolve chain"));
        }

        let next = match &raw.base {
            Some(base) => {
                let (base_key, base_raw) = self.nearest_resolve(base).ok_or_else(|| {
                    InjectionError::malformed(
                        declaring.as_str(),
                        format!("injectable base {base} has no resolve method"),
                    )
                })?;
                Some(self.link_resolve(base_key, base_raw, visited)?)
            }
            None => None,
        };

        Ok(Arc::new(ResolveChain {
            declaring_type: declaring,
            steps: raw.steps.clone(),
            next,
        }))
    }

    /// Link the binding of a type through its base classes
    pub fn binding(&self, key: &TypeKey) -> Result<TypeBinding> {
        let chain = self.base_chain(key);

        let mut owned = Vec::new();
        let mut observed: Vec<TypeKey> = Vec::new();
        for ancestor in chain.iter().rev() {
            let Some(raw) = self.raw.get(ancestor) else {
                continue;
            };
            owned.extend(raw.owned.iter().cloned());
            for observed_type in &raw.observed {
                if !observed.contains(observed_type) {
                    observed.push(observed_type.clone());
                }
            }
        }

        let resolve = match self.nearest_resolve(key) {
            Some((declaring, raw)) => Some(self.link_resolve(declaring, raw, &mut HashSet::new())?),
            None => None,
        };

        Ok(TypeBinding {
            type_key: key.clone(),
            owned,
            resolve,
            observed,
        })
    }

    /// Bindings of every concrete class
    pub fn bindings(&self) -> Result<HashMap<TypeKey, Arc<TypeBinding>, RandomState>> {
        self.concrete_types()
            .map(|key| Ok((key.clone(), Arc::new(self.binding(key)?))))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::{inherits_from_injectable, item_observer, needs, owns, owns_all};
    use crate::metadata::{FieldDef, TypeRef};
    use crate::synthesizer::weave;
    use crate::TypeResolver;

    fn game(name: &str) -> TypeRef {
        TypeRef::new("Game", name)
    }

    fn key(name: &str) -> TypeKey {
        TypeKey::new(name)
    }

    fn game_module() -> ModuleDef {
        let mut module = ModuleDef::new("Game")
            .with_type(TypeDef::interface("Game.IAudio"))
            .with_type(TypeDef::class("Game.Audio").implementing(game("Game.IAudio")))
            .with_type(TypeDef::interface("Game.IEnemy"))
            .with_type(
                TypeDef::class("Game.Enemy")
                    .implementing(game("Game.IEnemy"))
                    .with_attribute(attributes::include_type()),
            )
            .with_type(
                TypeDef::class("Game.Actor")
                    .with_attribute(owns(game("Game.IAudio")))
                    .with_field(FieldDef::new("audio", game("Game.IAudio")).with_attribute(needs(false))),
            )
            .with_type(
                TypeDef::class("Game.Player")
                    .with_base(game("Game.Actor"))
                    .implementing(item_observer(game("Game.Enemy")))
                    .with_attribute(owns_all(game("Game.Enemy")))
                    .with_field(FieldDef::new("enemy", game("Game.IEnemy")).with_attribute(needs(true))),
            );
        weave(&mut module).unwrap();
        module
    }

    #[test]
    fn test_load_reads_registry_rows() {
        let mut modules = ModuleSet::new();
        modules.load(&game_module()).unwrap();

        let rows = modules.registry_rows();
        assert!(rows.contains(&vec![key("Game.Audio"), key("Game.IAudio")]));
        assert!(rows.iter().any(|row| row.first() == Some(&key("Game.Player"))));

        let resolver = modules.type_resolver();
        assert_eq!(resolver.get(&key("Game.IAudio")).unwrap(), key("Game.Audio"));
        assert!(resolver.is_assignable(&key("Game.Player"), &key("Game.Actor")));
    }

    #[test]
    fn test_binding_orders_base_first() {
        let mut modules = ModuleSet::new();
        modules.load(&game_module()).unwrap();

        let binding = modules.binding(&key("Game.Player")).unwrap();
        assert_eq!(
            binding.owned,
            vec![
                OwnedRegistration { type_key: key("Game.IAudio"), all: false },
                OwnedRegistration { type_key: key("Game.Enemy"), all: true },
            ]
        );
        assert_eq!(binding.observed, vec![key("Game.Enemy")]);

        let chain = binding.resolve.unwrap();
        assert_eq!(chain.declaring_type, key("Game.Player"));
        let fields: Vec<(&str, bool)> = chain
            .ordered_steps()
            .iter()
            .map(|s| (s.field.as_str(), s.ignore_initialization))
            .collect();
        assert_eq!(fields, vec![("audio", false), ("enemy", true)]);
    }

    #[test]
    fn test_cross_module_chain() {
        let mut engine = ModuleDef::new("Engine").with_type(
            TypeDef::class("Engine.Behaviour").with_field(
                FieldDef::new("clock", TypeRef::new("Engine", "Engine.IClock")).with_attribute(needs(false)),
            ),
        );
        weave(&mut engine).unwrap();

        let behaviour = TypeRef::new("Engine", "Engine.Behaviour");
        let mut game = ModuleDef::new("Game").with_type(
            TypeDef::class("Game.Door")
                .with_base(behaviour.clone())
                .with_attribute(inherits_from_injectable(Some(behaviour)))
                .with_field(FieldDef::new("lock", game("Game.ILock")).with_attribute(needs(false))),
        );
        weave(&mut game).unwrap();

        let mut modules = ModuleSet::new();
        modules.load(&engine).unwrap();
        modules.load(&game).unwrap();
        assert_eq!(modules.modules(), &["Engine".to_string(), "Game".to_string()]);

        let chain = modules.binding(&key("Game.Door")).unwrap().resolve.unwrap();
        let fields: Vec<&str> = chain.ordered_steps().iter().map(|s| s.field.as_str()).collect();
        assert_eq!(fields, vec!["clock", "lock"]);
        assert_eq!(chain.next.as_ref().unwrap().declaring_type, key("Engine.Behaviour"));
    }

    #[test]
    fn test_missing_base_resolve_is_malformed() {
        let mut game = ModuleDef::new("Game").with_type(
            TypeDef::class("Game.Door")
                .with_attribute(inherits_from_injectable(Some(TypeRef::new("Engine", "Engine.Behaviour"))))
                .with_field(FieldDef::new("lock", game("Game.ILock")).with_attribute(needs(false))),
        );
        weave(&mut game).unwrap();

        let mut modules = ModuleSet::new();
        modules.load(&game).unwrap();
        let err = modules.binding(&key("Game.Door")).unwrap_err();
        assert!(matches!(err, InjectionError::MalformedBinding { .. }));
    }

    #[test]
    fn test_load_image_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Game.json");
        ModuleImage {
            module: game_module(),
            symbols: None,
        }
        .write(&path)
        .unwrap();

        let mut modules = ModuleSet::new();
        modules.load_image(&path).unwrap();
        assert!(modules.type_info(&key("Game.Player")).unwrap().is_concrete());
        assert!(!modules.type_info(&key("Game.IAudio")).unwrap().is_concrete());
        assert!(modules.bindings().unwrap().contains_key(&key("Game.Player")));
    }
}
