//! Entity-type dependency graph.
//!
//! The graph is built once at initialization from many-to-one
//! relationship declarations (child depends on parent) and is read-only
//! afterward. Queue draining uses the computed levels to order parents
//! before children; id negotiation uses the reverse edges to find every
//! foreign key that references a rewritten entity.

use crate::error::{SyncError, SyncResult};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};

/// One many-to-one relationship edge: the child type holds `fk_field`
/// referencing the parent type's id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    /// Parent entity type name.
    pub parent: String,
    /// Name of the foreign-key field on the child payload.
    pub fk_field: String,
}

/// Static dependency graph over entity types.
///
/// # Invariants
///
/// - The graph is acyclic; [`DependencyGraph::register`] rejects any edge
///   that would close a cycle
/// - `level(t)` is `0` for types with no dependencies, else
///   `1 + max(level(parent))`
/// - Safe for unsynchronized concurrent reads once registration is done
pub struct DependencyGraph {
    /// Forward edges: child type -> relations to its parents.
    edges: HashMap<String, Vec<Relation>>,
    /// Reverse edges: parent type -> (child type, fk field).
    reverse: HashMap<String, Vec<(String, String)>>,
    /// Memoized levels, filled on first query.
    levels: RwLock<HashMap<String, u32>>,
}

impl DependencyGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self {
            edges: HashMap::new(),
            reverse: HashMap::new(),
            levels: RwLock::new(HashMap::new()),
        }
    }

    /// Declares that `child` rows carry `fk_field` referencing `parent`.
    ///
    /// The child type will never sync ahead of the referenced parent.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::CircularDependency`] if the edge would close a
    /// cycle; the edge is not added in that case.
    pub fn register(
        &mut self,
        child: impl Into<String>,
        fk_field: impl Into<String>,
        parent: impl Into<String>,
    ) -> SyncResult<()> {
        let child = child.into();
        let parent = parent.into();
        let fk_field = fk_field.into();

        if let Some(mut chain) = self.path_between(&parent, &child) {
            chain.insert(0, child.clone());
            return Err(SyncError::CircularDependency { chain });
        }

        self.edges.entry(child.clone()).or_default().push(Relation {
            parent: parent.clone(),
            fk_field: fk_field.clone(),
        });
        self.reverse
            .entry(parent)
            .or_default()
            .push((child, fk_field));
        self.levels.write().clear();
        Ok(())
    }

    /// Returns the dependency level of an entity type.
    ///
    /// Unregistered types and types with no parents sit at level 0.
    /// Diamond dependencies resolve naturally: a type depending on two
    /// independent level-0 parents sits at level 1 exactly once.
    pub fn level(&self, entity_type: &str) -> u32 {
        if let Some(level) = self.levels.read().get(entity_type) {
            return *level;
        }
        let level = self.compute_level(entity_type, &mut HashSet::new());
        self.levels
            .write()
            .insert(entity_type.to_string(), level);
        level
    }

    fn compute_level(&self, entity_type: &str, visiting: &mut HashSet<String>) -> u32 {
        // Registration rejects cycles, so the visiting set only guards
        // against a corrupted graph reaching infinite recursion.
        if !visiting.insert(entity_type.to_string()) {
            return 0;
        }
        let level = match self.edges.get(entity_type) {
            None => 0,
            Some(relations) if relations.is_empty() => 0,
            Some(relations) => {
                1 + relations
                    .iter()
                    .map(|r| self.compute_level(&r.parent, visiting))
                    .max()
                    .unwrap_or(0)
            }
        };
        visiting.remove(entity_type);
        level
    }

    /// Returns the relations (parent + fk field) of an entity type.
    pub fn relations_of(&self, entity_type: &str) -> &[Relation] {
        self.edges
            .get(entity_type)
            .map(|r| r.as_slice())
            .unwrap_or(&[])
    }

    /// Returns the parent types an entity type depends on.
    pub fn dependencies_of(&self, entity_type: &str) -> HashSet<&str> {
        self.relations_of(entity_type)
            .iter()
            .map(|r| r.parent.as_str())
            .collect()
    }

    /// Returns every (child type, fk field) pair referencing a parent type.
    pub fn dependents_of(&self, entity_type: &str) -> &[(String, String)] {
        self.reverse
            .get(entity_type)
            .map(|r| r.as_slice())
            .unwrap_or(&[])
    }

    /// Scans every registered node for a cycle.
    ///
    /// Always false for graphs built through [`DependencyGraph::register`];
    /// exposed for diagnostics.
    pub fn has_circular_dependencies(&self) -> bool {
        self.edges
            .keys()
            .any(|node| self.path_between(node, node).is_some())
    }

    /// Returns every known entity type with its level, for diagnostics.
    pub fn debug_levels(&self) -> BTreeMap<String, u32> {
        let mut all: HashSet<&str> = HashSet::new();
        for (child, relations) in &self.edges {
            all.insert(child);
            for relation in relations {
                all.insert(&relation.parent);
            }
        }
        all.into_iter()
            .map(|t| (t.to_string(), self.level(t)))
            .collect()
    }

    /// Finds a path `from -> ... -> to` along forward edges, if one exists.
    ///
    /// Used for cycle detection: an edge child->parent closes a cycle
    /// exactly when a path parent -> ... -> child already exists.
    fn path_between(&self, from: &str, to: &str) -> Option<Vec<String>> {
        let mut stack = vec![vec![from.to_string()]];
        let mut seen = HashSet::new();

        while let Some(path) = stack.pop() {
            let node = path.last().cloned().unwrap_or_default();
            for relation in self.relations_of(&node) {
                let mut next = path.clone();
                next.push(relation.parent.clone());
                if relation.parent == to {
                    return Some(next);
                }
                if seen.insert(relation.parent.clone()) {
                    stack.push(next);
                }
            }
        }
        None
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DependencyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraph")
            .field("levels", &self.debug_levels())
            .finish_non_exhaustive()
    }
}
