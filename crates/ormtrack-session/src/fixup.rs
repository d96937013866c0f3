//! Relationship index and foreign-key fixup.
//!
//! Navigations are never owned object graphs: a dependent references its
//! principal through a foreign-key scalar, and the index here is what
//! makes the reverse direction cheap. Whenever a foreign key changes, the
//! session reports it to the index so that "children of this principal"
//! stays consistent with the scalar state, in both directions.

use crate::identity_map::{EntityKey, hash_key_values};
use ormtrack_core::{PropertyInfo, Record, Value};
use std::collections::HashMap;

/// One principal row, identified by entity set and key hash.
///
/// Principals are addressed by name rather than `TypeId` so metadata can
/// reference them before the principal type is ever attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct PrincipalRef {
    pub entity: &'static str,
    pub key_hash: u64,
}

impl PrincipalRef {
    pub(crate) fn new(entity: &'static str, key_values: &[Value]) -> Self {
        Self {
            entity,
            key_hash: hash_key_values(key_values),
        }
    }
}

/// A dependent tracked under some principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Edge {
    pub child: EntityKey,
    pub child_entity: &'static str,
    pub fk_property: &'static str,
}

/// Bidirectional index over tracked foreign-key references.
#[derive(Default)]
pub(crate) struct RelationshipIndex {
    edges: HashMap<PrincipalRef, Vec<Edge>>,
    reverse: HashMap<EntityKey, Vec<(PrincipalRef, &'static str)>>,
}

impl RelationshipIndex {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Index every non-null foreign key of a freshly tracked record.
    pub(crate) fn index_record(
        &mut self,
        child: EntityKey,
        child_entity: &'static str,
        properties: &[PropertyInfo],
        record: &Record,
    ) {
        for prop in properties {
            let Some(principal_entity) = prop.principal_entity() else {
                continue;
            };
            if let Some(value) = record.get(prop.name) {
                if !value.is_null() {
                    let principal =
                        PrincipalRef::new(principal_entity, std::slice::from_ref(value));
                    self.add_edge(
                        principal,
                        Edge {
                            child,
                            child_entity,
                            fk_property: prop.name,
                        },
                    );
                }
            }
        }
    }

    fn add_edge(&mut self, principal: PrincipalRef, edge: Edge) {
        let bucket = self.edges.entry(principal).or_default();
        if !bucket.contains(&edge) {
            bucket.push(edge);
        }
        self.reverse
            .entry(edge.child)
            .or_default()
            .push((principal, edge.fk_property));
    }

    fn remove_edge(&mut self, child: EntityKey, fk_property: &'static str) {
        let Some(back) = self.reverse.get_mut(&child) else {
            return;
        };
        let mut removed = Vec::new();
        back.retain(|(principal, prop)| {
            if *prop == fk_property {
                removed.push(*principal);
                false
            } else {
                true
            }
        });
        if back.is_empty() {
            self.reverse.remove(&child);
        }
        for principal in removed {
            if let Some(bucket) = self.edges.get_mut(&principal) {
                bucket.retain(|e| !(e.child == child && e.fk_property == fk_property));
                if bucket.is_empty() {
                    self.edges.remove(&principal);
                }
            }
        }
    }

    /// Re-point a child's foreign-key edge after the scalar changed.
    #[tracing::instrument(level = "trace", skip(self, new_value))]
    pub(crate) fn on_foreign_key_changed(
        &mut self,
        child: EntityKey,
        child_entity: &'static str,
        fk_property: &'static str,
        principal_entity: &'static str,
        new_value: Option<&Value>,
    ) {
        self.remove_edge(child, fk_property);
        if let Some(value) = new_value {
            if !value.is_null() {
                let principal = PrincipalRef::new(principal_entity, std::slice::from_ref(value));
                self.add_edge(
                    principal,
                    Edge {
                        child,
                        child_entity,
                        fk_property,
                    },
                );
            }
        }
    }

    /// Tracked dependents of a principal through one specific relationship.
    pub(crate) fn dependents(
        &self,
        principal_entity: &'static str,
        key_values: &[Value],
        child_entity: &'static str,
        fk_property: &'static str,
    ) -> Vec<EntityKey> {
        let principal = PrincipalRef::new(principal_entity, key_values);
        self.edges
            .get(&principal)
            .map(|bucket| {
                bucket
                    .iter()
                    .filter(|e| e.child_entity == child_entity && e.fk_property == fk_property)
                    .map(|e| e.child)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop every edge a child participates in.
    pub(crate) fn forget_child(&mut self, child: EntityKey) {
        let Some(back) = self.reverse.remove(&child) else {
            return;
        };
        for (principal, fk_property) in back {
            if let Some(bucket) = self.edges.get_mut(&principal) {
                bucket.retain(|e| !(e.child == child && e.fk_property == fk_property));
                if bucket.is_empty() {
                    self.edges.remove(&principal);
                }
            }
        }
    }

    /// Move a child's edges to a new key after rekeying.
    pub(crate) fn rekey_child(&mut self, old: EntityKey, new: EntityKey) {
        let Some(back) = self.reverse.remove(&old) else {
            return;
        };
        for (principal, fk_property) in &back {
            if let Some(bucket) = self.edges.get_mut(principal) {
                for edge in bucket.iter_mut() {
                    if edge.child == old && edge.fk_property == *fk_property {
                        edge.child = new;
                    }
                }
            }
        }
        self.reverse.insert(new, back);
    }

    pub(crate) fn clear(&mut self) {
        self.edges.clear();
        self.reverse.clear();
    }
}
