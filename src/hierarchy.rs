//! Ownership tree of live instances

use crate::error::HierarchyError;
use ahash::RandomState;
use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;

#[cfg(feature = "logging")]
use tracing::trace;

/// A pure tree mapping every element to its owner.
///
/// Elements attached without a parent hang off a synthetic root that is never
/// exposed as an element. Children keep their insertion order. Re-parenting
/// is rejected, so the structure can never form a cycle.
///
/// # Example
///
/// ```rust
/// use tree_injector::Hierarchy;
///
/// let mut tree = Hierarchy::new();
/// tree.add("module", None).unwrap();
/// tree.add("system", Some(&"module")).unwrap();
///
/// assert_eq!(tree.parent(&"system"), Some(&"module"));
/// assert_eq!(tree.children(Some(&"module")), &["system"]);
/// assert!(tree.add("system", None).is_err());
/// ```
#[derive(Debug, Clone)]
pub struct Hierarchy<T> {
    parents: HashMap<T, Option<T>, RandomState>,
    children: HashMap<T, Vec<T>, RandomState>,
    roots: Vec<T>,
}

impl<T> Default for Hierarchy<T> {
    fn default() -> Self {
        Self {
            parents: HashMap::default(),
            children: HashMap::default(),
            roots: Vec::new(),
        }
    }
}

impl<T: Clone + Eq + Hash + Display> Hierarchy<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `element` under `parent`, or under the root when `parent` is `None`.
    ///
    /// Attaching an element again under the same parent is a no-op.
    pub fn add(&mut self, element: T, parent: Option<&T>) -> Result<(), HierarchyError> {
        if parent == Some(&element) {
            return Err(HierarchyError::SelfParent {
                element: element.to_string(),
            });
        }

        if let Some(current) = self.parents.get(&element) {
            if current.as_ref() == parent {
                return Ok(());
            }
            return Err(HierarchyError::AlreadyParented {
                element: element.to_string(),
                current: describe(current.as_ref()),
                requested: describe(parent),
            });
        }

        match parent {
            Some(parent) => {
                if !self.parents.contains_key(parent) {
                    return Err(HierarchyError::UnknownParent {
                        parent: parent.to_string(),
                    });
                }
                self.children
                    .entry(parent.clone())
                    .or_default()
                    .push(element.clone());
            }
            None => self.roots.push(element.clone()),
        }

        #[cfg(feature = "logging")]
        trace!(target: "tree_injector", element = %element, parent = %describe(parent), "Attached to hierarchy");

        self.parents.insert(element, parent.cloned());
        Ok(())
    }

    /// Detach `element`.
    ///
    /// Without `recursive` the element must not own anything. With it the
    /// whole subtree is detached, children before their parent. Returns the
    /// detached elements in that order.
    pub fn remove(&mut self, element: &T, recursive: bool) -> Result<Vec<T>, HierarchyError> {
        if !self.contains(element) {
            return Err(HierarchyError::UnknownElement {
                element: element.to_string(),
            });
        }

        let owned = self.children(Some(element)).len();
        if owned > 0 && !recursive {
            return Err(HierarchyError::HasChildren {
                element: element.to_string(),
                children: owned,
            });
        }

        let mut removed = Vec::new();
        self.detach(element, &mut removed);
        Ok(removed)
    }

    fn detach(&mut self, element: &T, removed: &mut Vec<T>) {
        for child in self.children.remove(element).unwrap_or_default() {
            self.detach(&child, removed);
        }

        if let Some(parent) = self.parents.remove(element) {
            let siblings = match &parent {
                Some(parent) => self.children.get_mut(parent),
                None => Some(&mut self.roots),
            };
            if let Some(siblings) = siblings {
                siblings.retain(|sibling| sibling != element);
            }
        }

        removed.push(element.clone());
    }

    /// Direct children of `parent`, or of the root when `None`
    pub fn children(&self, parent: Option<&T>) -> &[T] {
        match parent {
            Some(parent) => self.children.get(parent).map(Vec::as_slice).unwrap_or(&[]),
            None => &self.roots,
        }
    }

    /// Owner of `element`; `None` for root-level and unknown elements
    pub fn parent(&self, element: &T) -> Option<&T> {
        self.parents.get(element).and_then(Option::as_ref)
    }

    pub fn contains(&self, element: &T) -> bool {
        self.parents.contains_key(element)
    }

    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    /// Drop every element
    pub fn reset(&mut self) {
        self.parents.clear();
        self.children.clear();
        self.roots.clear();
    }
}

fn describe<T: Display>(element: Option<&T>) -> String {
    element.map_or_else(|| "root".to_string(), ToString::to_string)
}
