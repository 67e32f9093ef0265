//! Type resolution from woven registry tables
//!
//! Every woven module carries rows of `[type, interfaces…, base, …]`. The
//! [`RegistryTypeResolver`] folds the rows of all loaded modules into two
//! lookup tables: for each concrete class the full set of types it is
//! assignable to, and for each type the concrete classes implementing it.

use crate::error::{InjectionError, Result};
use crate::type_key::TypeKey;
use ahash::RandomState;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

#[cfg(feature = "logging")]
use tracing::{debug, trace};

/// Maps requested types to the concrete types implementing them
pub trait TypeResolver: Send + Sync {
    /// The single concrete type implementing `requested`
    fn get(&self, requested: &TypeKey) -> Result<TypeKey>;

    /// Every concrete type implementing `requested`, never empty
    fn get_all(&self, requested: &TypeKey) -> Result<Vec<TypeKey>>;

    /// Every type a concrete type is assignable to, itself included
    fn assignable_types(&self, concrete: &TypeKey) -> Result<Vec<TypeKey>>;

    /// Whether instances of `concrete` can be used as `target`
    fn is_assignable(&self, concrete: &TypeKey, target: &TypeKey) -> bool;

    /// Drop cached lookup state
    fn reset(&self);
}

#[derive(Default)]
struct Tables {
    implementations: HashMap<TypeKey, Vec<TypeKey>, RandomState>,
    assignable: HashMap<TypeKey, Vec<TypeKey>, RandomState>,
}

impl Tables {
    fn build(rows: &[Vec<TypeKey>], concrete: &BTreeSet<TypeKey>) -> Self {
        let mut direct: HashMap<&TypeKey, BTreeSet<&TypeKey>, RandomState> = HashMap::default();
        for row in rows {
            if let Some((head, rest)) = row.split_first() {
                direct.entry(head).or_default().extend(rest);
            }
        }

        let mut tables = Tables::default();
        for class in concrete {
            if !direct.contains_key(class) {
                continue;
            }

            let mut reachable: BTreeSet<&TypeKey> = BTreeSet::from([class]);
            let mut pending = vec![class];
            while let Some(current) = pending.pop() {
                for &next in direct.get(current).into_iter().flatten() {
                    if reachable.insert(next) {
                        pending.push(next);
                    }
                }
            }

            for target in &reachable {
                tables
                    .implementations
                    .entry((*target).clone())
                    .or_default()
                    .push(class.clone());
            }
            tables
                .assignable
                .insert(class.clone(), reachable.into_iter().cloned().collect());
        }

        tables
    }
}

/// Default resolver built from the registry rows of all loaded modules.
///
/// Tables are computed on first use and dropped by [`TypeResolver::reset`];
/// the rows themselves are kept so the resolver stays usable afterwards.
///
/// # Example
///
/// ```rust
/// use tree_injector::{RegistryTypeResolver, TypeKey, TypeResolver};
///
/// let rows = vec![
///     vec![TypeKey::new("Game.Audio"), TypeKey::new("Game.IAudio")],
///     vec![TypeKey::new("Game.IAudio")],
/// ];
/// let resolver = RegistryTypeResolver::new(rows, [TypeKey::new("Game.Audio")]);
///
/// assert_eq!(resolver.get(&TypeKey::new("Game.IAudio")).unwrap(), TypeKey::new("Game.Audio"));
/// ```
pub struct RegistryTypeResolver {
    rows: Vec<Vec<TypeKey>>,
    concrete: BTreeSet<TypeKey>,
    tables: RwLock<Option<Arc<Tables>>>,
}

impl RegistryTypeResolver {
    /// Build a resolver from registry rows and the set of concrete classes
    pub fn new(rows: Vec<Vec<TypeKey>>, concrete: impl IntoIterator<Item = TypeKey>) -> Self {
        Self {
            rows,
            concrete: concrete.into_iter().collect(),
            tables: RwLock::new(None),
        }
    }

    fn tables(&self) -> Arc<Tables> {
        if let Some(tables) = self
            .tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            return Arc::clone(tables);
        }

        let mut slot = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        let tables = slot.get_or_insert_with(|| {
            #[cfg(feature = "logging")]
            debug!(
                target: "tree_injector",
                rows = self.rows.len(),
                concrete = self.concrete.len(),
                "Building type resolution tables"
            );
            Arc::new(Tables::build(&self.rows, &self.concrete))
        });
        Arc::clone(tables)
    }

    /// Every type known to the resolver as a row head
    pub fn registered_types(&self) -> HashSet<TypeKey> {
        self.rows.iter().filter_map(|row| row.first().cloned()).collect()
    }
}

impl TypeResolver for RegistryTypeResolver {
    fn get(&self, requested: &TypeKey) -> Result<TypeKey> {
        let tables = self.tables();
        match tables.implementations.get(requested).map(Vec::as_slice) {
            None | Some([]) => Err(InjectionError::no_implementation(requested.as_str())),
            Some([single]) => {
                #[cfg(feature = "logging")]
                trace!(target: "tree_injector", requested = %requested, resolved = %single, "Resolved type");
                Ok(single.clone())
            }
            Some(candidates) => Err(InjectionError::AmbiguousImplementation {
                type_name: requested.to_string(),
                candidates: candidates.iter().map(ToString::to_string).collect(),
            }),
        }
    }

    fn get_all(&self, requested: &TypeKey) -> Result<Vec<TypeKey>> {
        let tables = self.tables();
        match tables.implementations.get(requested) {
            Some(all) if !all.is_empty() => Ok(all.clone()),
            _ => Err(InjectionError::no_implementation(requested.as_str())),
        }
    }

    fn assignable_types(&self, concrete: &TypeKey) -> Result<Vec<TypeKey>> {
        self.tables()
            .assignable
            .get(concrete)
            .cloned()
            .ok_or_else(|| InjectionError::UnknownType {
                type_name: concrete.to_string(),
            })
    }

    fn is_assignable(&self, concrete: &TypeKey, target: &TypeKey) -> bool {
        concrete == target
            || self
                .tables()
                .assignable
                .get(concrete)
                .is_some_and(|types| types.contains(target))
    }

    fn reset(&self) {
        #[cfg(feature = "logging")]
        debug!(target: "tree_injector", "Resetting type resolver");
        *self.tables.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}
