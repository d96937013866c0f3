//! Change-tracking session for ormtrack.
//!
//! A [`Session`] observes plain entity instances and turns their mutations
//! into store operations at commit time. It combines:
//!
//! - an identity map (one instance per key, shared references)
//! - snapshot-based change detection (state recomputed, never cached)
//! - a relationship index with foreign-key fixup
//! - a dependency-ordered commit pipeline with optimistic concurrency
//!
//! Entities stay plain value holders; every piece of tracking state lives
//! here. All store access is async and cancel-correct through asupersync's
//! `Cx`/`Outcome`.

pub mod commit;
mod fixup;
pub mod identity_map;
pub mod snapshot;
#[cfg(test)]
pub(crate) mod testkit;

pub use commit::CommitResult;
pub use identity_map::{EntityKey, EntityRef, IdentityMap, KeySlot};
pub use snapshot::{Snapshot, SnapshotStore};

use crate::commit::JoinOp;
use crate::fixup::RelationshipIndex;
use crate::identity_map::{EntityVtable, hash_key_values};
use asupersync::{Cx, Outcome};
use ormtrack_core::{
    ConcurrencyConflict, ConstraintError, DeleteBehavior, Entity, Error, IdentityError, Record,
    RelationshipInfo, RelationshipKind, Result, Store, Value,
};
use std::collections::{HashMap, HashSet};
use std::sync::{RwLockReadGuard, RwLockWriteGuard};

/// Lifecycle state of a tracked entity.
///
/// `Modified` is never cached: it is recomputed from the snapshot diff on
/// every query, so reverting a property in place returns the entity to
/// `Unchanged` without any bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityState {
    /// Not tracked by any session
    Detached,
    /// Tracked, no pending changes
    Unchanged,
    /// Scheduled for insert
    Added,
    /// Tracked with at least one property differing from its snapshot
    Modified,
    /// Scheduled for delete
    Deleted,
}

impl EntityState {
    /// Human-readable name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            EntityState::Detached => "detached",
            EntityState::Unchanged => "unchanged",
            EntityState::Added => "added",
            EntityState::Modified => "modified",
            EntityState::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for EntityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the session detects modifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ObservationStrategy {
    /// Diff every tracked entry against its snapshot (the default).
    #[default]
    Snapshot,
    /// Diff only entries explicitly reported via [`Session::mark_modified`].
    Notifying,
}

/// Session configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionConfig {
    /// Change-detection strategy.
    pub observation: ObservationStrategy,
}

type AttachHook = Box<dyn Fn(&'static str, &[Value]) + Send + Sync>;
type StateHook = Box<dyn Fn(&'static str, &[Value], EntityState, EntityState) + Send + Sync>;
type CommitHook = Box<dyn Fn(&CommitResult) + Send + Sync>;

/// Optional observer hooks for session lifecycle events.
#[derive(Default)]
pub struct SessionEventCallbacks {
    pub(crate) on_attach: Option<AttachHook>,
    pub(crate) on_state_change: Option<StateHook>,
    pub(crate) on_commit: Option<CommitHook>,
}

impl SessionEventCallbacks {
    /// Create empty callbacks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Called when an entity enters the session.
    #[must_use]
    pub fn on_attach(mut self, hook: impl Fn(&'static str, &[Value]) + Send + Sync + 'static) -> Self {
        self.on_attach = Some(Box::new(hook));
        self
    }

    /// Called on explicit state transitions (delete, detach, commit).
    #[must_use]
    pub fn on_state_change(
        mut self,
        hook: impl Fn(&'static str, &[Value], EntityState, EntityState) + Send + Sync + 'static,
    ) -> Self {
        self.on_state_change = Some(Box::new(hook));
        self
    }

    /// Called after every successful commit.
    #[must_use]
    pub fn on_commit(mut self, hook: impl Fn(&CommitResult) + Send + Sync + 'static) -> Self {
        self.on_commit = Some(Box::new(hook));
        self
    }
}

/// Aggregated view of the session's bookkeeping, for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionDebugInfo {
    /// Total tracked entries
    pub tracked: usize,
    /// Entries in `Added` state
    pub added: usize,
    /// Entries whose snapshot diff is non-empty
    pub modified: usize,
    /// Entries in `Deleted` state
    pub deleted: usize,
    /// Entries with no pending changes
    pub unchanged: usize,
    /// Queued many-to-many link/unlink operations
    pub pending_links: usize,
}

/// Handle to a tracked entity: its session key plus a shared reference.
#[derive(Debug)]
pub struct Tracked<E> {
    /// The session-level identity of this entry.
    pub key: EntityKey,
    entity: EntityRef<E>,
}

impl<E> Tracked<E> {
    /// The shared reference to the entity instance.
    #[must_use]
    pub fn entity(&self) -> &EntityRef<E> {
        &self.entity
    }

    /// Read access to the entity.
    pub fn read(&self) -> RwLockReadGuard<'_, E> {
        self.entity.read().expect("lock poisoned")
    }

    /// Write access to the entity.
    pub fn write(&self) -> RwLockWriteGuard<'_, E> {
        self.entity.write().expect("lock poisoned")
    }
}

impl<E> Clone for Tracked<E> {
    fn clone(&self) -> Self {
        Self {
            key: self.key,
            entity: std::sync::Arc::clone(&self.entity),
        }
    }
}

/// A change-tracking session over one store.
pub struct Session<S: Store> {
    pub(crate) store: S,
    pub(crate) config: SessionConfig,
    pub(crate) map: IdentityMap,
    pub(crate) states: HashMap<EntityKey, EntityState>,
    pub(crate) snapshots: SnapshotStore,
    pub(crate) index: RelationshipIndex,
    pub(crate) types: HashMap<&'static str, EntityVtable>,
    /// Child FK slots waiting for a transient parent's store-assigned key.
    pub(crate) pending_refs: HashMap<(EntityKey, &'static str), EntityKey>,
    pub(crate) join_ops: Vec<JoinOp>,
    /// Entries reported dirty under the notifying strategy.
    pub(crate) marked: HashSet<EntityKey>,
    pub(crate) events: SessionEventCallbacks,
    next_transient: u64,
}

impl<S: Store> Session<S> {
    /// Create a session with default configuration.
    pub fn new(store: S) -> Self {
        Self::with_config(store, SessionConfig::default())
    }

    /// Create a session with explicit configuration.
    pub fn with_config(store: S, config: SessionConfig) -> Self {
        Self {
            store,
            config,
            map: IdentityMap::new(),
            states: HashMap::new(),
            snapshots: SnapshotStore::new(),
            index: RelationshipIndex::new(),
            types: HashMap::new(),
            pending_refs: HashMap::new(),
            join_ops: Vec::new(),
            marked: HashSet::new(),
            events: SessionEventCallbacks::default(),
            next_transient: 0,
        }
    }

    /// Install lifecycle callbacks.
    pub fn set_event_callbacks(&mut self, events: SessionEventCallbacks) {
        self.events = events;
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Register an entity type's metadata with the session.
    ///
    /// Called implicitly by `attach`/`add`/`load`; explicit registration is
    /// only needed for types the session first meets through a cascade.
    pub fn register<E: Entity + 'static>(&mut self) {
        self.types
            .entry(E::ENTITY_NAME)
            .or_insert_with(EntityVtable::of::<E>);
    }

    /// Track an existing entity as `Unchanged`.
    ///
    /// The entity must already carry its key. Re-attaching an instance whose
    /// record equals the tracked one returns the tracked reference; a
    /// differing instance under a taken key is a duplicate-identity error.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(entity = E::ENTITY_NAME))]
    pub fn attach<E: Entity + 'static>(&mut self, entity: E) -> Result<Tracked<E>> {
        if entity.is_new() {
            return Err(Error::Custom(format!(
                "cannot attach '{}' without a key; use add for new entities",
                E::ENTITY_NAME
            )));
        }
        self.register::<E>();
        let key = EntityKey::assigned::<E>(&entity.key_value());
        let entity = self.track_loaded(key, entity)?;
        Ok(Tracked { key, entity })
    }

    /// Track an entity as `Added`, scheduling an insert.
    ///
    /// Entities without a key are tracked under a transient slot and rekeyed
    /// once the store assigns their key at commit.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(entity = E::ENTITY_NAME))]
    pub fn add<E: Entity + 'static>(&mut self, entity: E) -> Result<Tracked<E>> {
        self.register::<E>();
        let key = if entity.is_new() {
            self.next_transient += 1;
            EntityKey::transient::<E>(self.next_transient)
        } else {
            EntityKey::assigned::<E>(&entity.key_value())
        };

        if self.states.contains_key(&key) {
            return Err(Error::DuplicateIdentity(IdentityError {
                entity: E::ENTITY_NAME,
                key: entity.key_value(),
            }));
        }

        let record = entity.to_record();
        let key_values = entity.key_value();
        let arc = self.map.attach(key, entity)?;
        self.states.insert(key, EntityState::Added);
        self.index
            .index_record(key, E::ENTITY_NAME, E::properties(), &record);
        self.emit_attach(E::ENTITY_NAME, &key_values);
        Ok(Tracked { key, entity: arc })
    }

    /// Track a batch of entities as `Added`.
    pub fn add_all<E, I>(&mut self, entities: I) -> Result<Vec<Tracked<E>>>
    where
        E: Entity + 'static,
        I: IntoIterator<Item = E>,
    {
        entities.into_iter().map(|e| self.add(e)).collect()
    }

    /// Look up a tracked entity by key values.
    pub fn get<E: Entity + 'static>(&self, key_values: &[Value]) -> Option<Tracked<E>> {
        let key = EntityKey::assigned::<E>(key_values);
        let entity = self.map.find::<E>(key_values)?;
        Some(Tracked { key, entity })
    }

    /// Load an entity from the store, or return the tracked instance.
    ///
    /// An identity-map hit never touches the store; the instance already in
    /// the session wins over whatever the store holds.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(entity = E::ENTITY_NAME))]
    pub async fn load<E: Entity + 'static>(
        &mut self,
        cx: &Cx,
        key_values: &[Value],
    ) -> Outcome<Tracked<E>, Error> {
        self.register::<E>();
        let key = EntityKey::assigned::<E>(key_values);
        if let Some(entity) = self.map.find::<E>(key_values) {
            tracing::trace!("identity map hit");
            return Outcome::Ok(Tracked { key, entity });
        }

        let record = match self.store.fetch_by_key(cx, E::ENTITY_NAME, key_values).await {
            Outcome::Ok(Some(record)) => record,
            Outcome::Ok(None) => {
                return Outcome::Err(Error::NotFound(IdentityError {
                    entity: E::ENTITY_NAME,
                    key: key_values.to_vec(),
                }));
            }
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let entity = match E::from_record(&record) {
            Ok(entity) => entity,
            Err(e) => return Outcome::Err(e),
        };
        match self.track_loaded(key, entity) {
            Ok(entity) => Outcome::Ok(Tracked { key, entity }),
            Err(e) => Outcome::Err(e),
        }
    }

    /// The current state of a tracked entry.
    pub fn state_of(&self, key: &EntityKey) -> EntityState {
        match self.states.get(key) {
            None => EntityState::Detached,
            Some(EntityState::Unchanged) => {
                if self.entry_changed(key) {
                    EntityState::Modified
                } else {
                    EntityState::Unchanged
                }
            }
            Some(state) => *state,
        }
    }

    /// Whether an entry carries pending work for the next commit.
    pub fn is_dirty(&self, key: &EntityKey) -> bool {
        matches!(
            self.state_of(key),
            EntityState::Added | EntityState::Modified | EntityState::Deleted
        )
    }

    /// Names of properties differing from the snapshot baseline.
    ///
    /// `Added` entries report every property.
    pub fn changed_properties(&self, key: &EntityKey) -> Vec<&'static str> {
        let Some(record) = self.map.read_record(key) else {
            return Vec::new();
        };
        match self.states.get(key) {
            Some(EntityState::Added) => record.names().to_vec(),
            Some(_) => self.snapshots.changed_properties(key, &record),
            None => Vec::new(),
        }
    }

    /// Report an entry as modified (notifying strategy).
    ///
    /// Under the snapshot strategy this is a no-op; the diff sees the
    /// change regardless.
    pub fn mark_modified(&mut self, key: &EntityKey) {
        self.marked.insert(*key);
    }

    /// The current scalar state of a tracked entry.
    pub fn record_of(&self, key: &EntityKey) -> Option<Record> {
        self.map.read_record(key)
    }

    /// Schedule an entry for deletion, walking its relationships.
    ///
    /// Tracked dependents are handled according to each relationship's
    /// delete behavior: cascaded, FK-nulled, or refused. An `Added` entry
    /// is simply detached, since it was never persisted. The walk is
    /// planned before anything is applied, so a refused delete leaves the
    /// session untouched.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn mark_deleted(&mut self, key: &EntityKey) -> Result<()> {
        if !self.states.contains_key(key) {
            return Err(Error::Custom(
                "cannot delete an entity the session does not track".into(),
            ));
        }

        let mut visited: HashSet<EntityKey> = HashSet::new();
        let mut to_delete: Vec<EntityKey> = Vec::new();
        // (child, fk property, child entity, principal entity)
        let mut to_null: Vec<(EntityKey, &'static str, &'static str, &'static str)> = Vec::new();
        // (dependent, principal entity, relationship name)
        let mut restrict: Vec<(EntityKey, &'static str, &'static str)> = Vec::new();

        let mut stack = vec![*key];
        while let Some(k) = stack.pop() {
            if !visited.insert(k) || !self.states.contains_key(&k) {
                continue;
            }
            to_delete.push(k);
            let vtable = *self
                .map
                .vtable(&k)
                .ok_or_else(|| Error::Custom("tracked entry missing from identity map".into()))?;
            let key_values = self.map.key_values(&k).unwrap_or_default();
            for rel in vtable.relationships {
                let Some(fk) = rel.foreign_key else {
                    continue; // many-to-many links are handled through join ops
                };
                let deps = self
                    .index
                    .dependents(vtable.entity, &key_values, rel.related_entity, fk);
                match rel.on_delete {
                    DeleteBehavior::Cascade | DeleteBehavior::ClientCascade => {
                        stack.extend(deps);
                    }
                    DeleteBehavior::SetNull => {
                        for dep in deps {
                            to_null.push((dep, fk, rel.related_entity, vtable.entity));
                        }
                    }
                    DeleteBehavior::Restrict => {
                        for dep in deps {
                            restrict.push((dep, vtable.entity, rel.name));
                        }
                    }
                }
            }
        }

        let planned: HashSet<EntityKey> = to_delete.iter().copied().collect();
        for (dep, principal_entity, rel_name) in restrict {
            let already_deleted = matches!(self.states.get(&dep), Some(EntityState::Deleted));
            if !planned.contains(&dep) && !already_deleted {
                return Err(Error::RestrictViolation(ConstraintError {
                    entity: principal_entity,
                    constraint: format!("{principal_entity}.{rel_name}"),
                    message: "tracked dependents remain".into(),
                }));
            }
        }

        for (dep, fk, child_entity, principal_entity) in to_null {
            if planned.contains(&dep) {
                continue;
            }
            self.map.write_property(&dep, fk, Value::Null)?;
            self.index
                .on_foreign_key_changed(dep, child_entity, fk, principal_entity, None);
            self.marked.insert(dep);
        }

        for k in to_delete {
            self.join_ops.retain(|op| !op.involves(k));
            self.pending_refs
                .retain(|(child, _), parent| *child != k && *parent != k);
            let old = self.state_of(&k);
            match self.states.get(&k).copied() {
                Some(EntityState::Added) => {
                    let (entity, key_values) = self.entry_identity(&k);
                    self.detach_inner(&k);
                    self.emit_state_change(entity, &key_values, old, EntityState::Detached);
                }
                Some(EntityState::Deleted) | None => {}
                Some(_) => {
                    self.states.insert(k, EntityState::Deleted);
                    let (entity, key_values) = self.entry_identity(&k);
                    self.emit_state_change(entity, &key_values, old, EntityState::Deleted);
                }
            }
        }
        Ok(())
    }

    /// Stop tracking an entry without touching the store.
    ///
    /// Returns `true` if the entry was tracked.
    pub fn detach(&mut self, key: &EntityKey) -> bool {
        if !self.states.contains_key(key) {
            return false;
        }
        let old = self.state_of(key);
        let (entity, key_values) = self.entry_identity(key);
        self.detach_inner(key);
        self.emit_state_change(entity, &key_values, old, EntityState::Detached);
        true
    }

    /// Detach everything and drop all pending work.
    pub fn clear_all(&mut self) {
        self.map.clear();
        self.states.clear();
        self.snapshots.clear_all();
        self.index.clear();
        self.pending_refs.clear();
        self.join_ops.clear();
        self.marked.clear();
    }

    /// Point a child's foreign key at a tracked principal (or at nothing).
    ///
    /// Writes the FK scalar, keeps the relationship index consistent, and
    /// defers the value when the principal's key is still transient.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn set_reference(
        &mut self,
        child: &EntityKey,
        fk_property: &'static str,
        parent: Option<&EntityKey>,
    ) -> Result<()> {
        let child_vtable = *self
            .map
            .vtable(child)
            .ok_or_else(|| Error::Custom("child is not tracked".into()))?;
        let prop = (child_vtable.properties)()
            .iter()
            .find(|p| p.name == fk_property && p.foreign_key.is_some())
            .ok_or_else(|| {
                Error::Custom(format!(
                    "'{fk_property}' is not a foreign key of '{}'",
                    child_vtable.entity
                ))
            })?;
        let principal_entity = prop
            .principal_entity()
            .ok_or_else(|| Error::Custom("malformed foreign key target".into()))?;

        self.pending_refs.remove(&(*child, fk_property));
        match parent {
            None => {
                if !prop.nullable {
                    return Err(Error::ForeignKeyConstraint(ConstraintError {
                        entity: child_vtable.entity,
                        constraint: prop.foreign_key.unwrap_or("").to_string(),
                        message: format!("foreign key '{fk_property}' is not nullable"),
                    }));
                }
                self.map.write_property(child, fk_property, Value::Null)?;
                self.index.on_foreign_key_changed(
                    *child,
                    child_vtable.entity,
                    fk_property,
                    principal_entity,
                    None,
                );
            }
            Some(p) => {
                let parent_vtable = *self
                    .map
                    .vtable(p)
                    .ok_or_else(|| Error::Custom("parent is not tracked".into()))?;
                if parent_vtable.entity != principal_entity {
                    return Err(Error::Custom(format!(
                        "'{fk_property}' references '{principal_entity}', not '{}'",
                        parent_vtable.entity
                    )));
                }
                if p.is_transient() {
                    // Value arrives when the parent's insert assigns a key.
                    self.map.write_property(child, fk_property, Value::Null)?;
                    self.index.on_foreign_key_changed(
                        *child,
                        child_vtable.entity,
                        fk_property,
                        principal_entity,
                        None,
                    );
                    self.pending_refs.insert((*child, fk_property), *p);
                } else {
                    let mut parent_key = self.map.key_values(p).unwrap_or_default();
                    if parent_key.len() != 1 {
                        return Err(Error::Custom(
                            "a single foreign key cannot reference a composite key".into(),
                        ));
                    }
                    let value = parent_key.remove(0);
                    self.map.write_property(child, fk_property, value.clone())?;
                    self.index.on_foreign_key_changed(
                        *child,
                        child_vtable.entity,
                        fk_property,
                        principal_entity,
                        Some(&value),
                    );
                }
            }
        }
        self.marked.insert(*child);
        Ok(())
    }

    /// Add a child to a principal's collection navigation.
    ///
    /// Collection mutation is FK fixup seen from the other side: this
    /// writes the child's foreign key to reference `parent`.
    pub fn add_child(
        &mut self,
        parent: &EntityKey,
        relationship: &'static str,
        child: &EntityKey,
    ) -> Result<()> {
        let rel = self.relationship_of(parent, relationship)?;
        let fk = rel.foreign_key.ok_or_else(|| {
            Error::Custom(format!("'{relationship}' is not a foreign-key relationship"))
        })?;
        self.set_reference(child, fk, Some(parent))
    }

    /// Remove a child from a principal's collection navigation.
    pub fn remove_child(
        &mut self,
        parent: &EntityKey,
        relationship: &'static str,
        child: &EntityKey,
    ) -> Result<()> {
        let rel = self.relationship_of(parent, relationship)?;
        let fk = rel.foreign_key.ok_or_else(|| {
            Error::Custom(format!("'{relationship}' is not a foreign-key relationship"))
        })?;
        self.set_reference(child, fk, None)
    }

    /// Tracked entries on the many side of a relationship.
    ///
    /// Resolved through the relationship index; for many-to-many this
    /// reports pending (uncommitted) link partners.
    pub fn dependents_of(
        &self,
        parent: &EntityKey,
        relationship: &'static str,
    ) -> Result<Vec<EntityKey>> {
        let rel = self.relationship_of(parent, relationship)?;
        if rel.kind == RelationshipKind::ManyToMany {
            let mut partners: Vec<EntityKey> = Vec::new();
            for op in &self.join_ops {
                if !op.link {
                    continue;
                }
                if op.left == *parent {
                    partners.push(op.right);
                } else if op.right == *parent {
                    partners.push(op.left);
                }
            }
            return Ok(partners);
        }

        let vtable = *self
            .map
            .vtable(parent)
            .ok_or_else(|| Error::Custom("parent is not tracked".into()))?;
        let fk = rel.foreign_key.ok_or_else(|| {
            Error::Custom(format!("'{relationship}' is not a foreign-key relationship"))
        })?;
        let key_values = self.map.key_values(parent).unwrap_or_default();
        let mut deps = self
            .index
            .dependents(vtable.entity, &key_values, rel.related_entity, fk);
        for ((child, prop), p) in &self.pending_refs {
            if p == parent && *prop == fk && !deps.contains(child) {
                deps.push(*child);
            }
        }
        Ok(deps)
    }

    /// Queue a many-to-many association between two tracked entries.
    ///
    /// A pending unlink of the same pair is cancelled instead.
    pub fn link(
        &mut self,
        left: &EntityKey,
        relationship: &'static str,
        right: &EntityKey,
    ) -> Result<()> {
        let (join, right_entity) = self.join_of(left, relationship)?;
        self.check_join_partner(right, right_entity)?;
        if let Some(pos) = self
            .join_ops
            .iter()
            .position(|op| !op.link && op.same_pair(join.name, *left, *right))
        {
            self.join_ops.remove(pos);
            return Ok(());
        }
        if self
            .join_ops
            .iter()
            .any(|op| op.link && op.same_pair(join.name, *left, *right))
        {
            return Ok(());
        }
        self.join_ops.push(JoinOp {
            link: true,
            join,
            left: *left,
            right: *right,
        });
        Ok(())
    }

    /// Queue removal of a many-to-many association.
    ///
    /// A pending link of the same pair is cancelled instead.
    pub fn unlink(
        &mut self,
        left: &EntityKey,
        relationship: &'static str,
        right: &EntityKey,
    ) -> Result<()> {
        let (join, right_entity) = self.join_of(left, relationship)?;
        self.check_join_partner(right, right_entity)?;
        if let Some(pos) = self
            .join_ops
            .iter()
            .position(|op| op.link && op.same_pair(join.name, *left, *right))
        {
            self.join_ops.remove(pos);
            return Ok(());
        }
        self.join_ops.push(JoinOp {
            link: false,
            join,
            left: *left,
            right: *right,
        });
        Ok(())
    }

    /// Overwrite a tracked entry with the store's current values.
    ///
    /// The store wins: properties, snapshot baseline, and index edges are
    /// all reset. A row the store no longer has detaches the entry and
    /// reports not-found.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn refresh(&mut self, cx: &Cx, key: &EntityKey) -> Outcome<(), Error> {
        let Some(vtable) = self.map.vtable(key).copied() else {
            return Outcome::Err(Error::Custom(
                "cannot refresh an entity the session does not track".into(),
            ));
        };
        let key_values = self.map.key_values(key).unwrap_or_default();
        let record = match self
            .store
            .fetch_by_key(cx, vtable.entity, &key_values)
            .await
        {
            Outcome::Ok(Some(record)) => record,
            Outcome::Ok(None) => {
                self.detach_inner(key);
                return Outcome::Err(Error::NotFound(IdentityError {
                    entity: vtable.entity,
                    key: key_values,
                }));
            }
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        for (name, value) in record.iter() {
            if let Err(e) = self.map.write_property(key, name, value.clone()) {
                return Outcome::Err(e);
            }
        }
        self.snapshots.capture(*key, record.clone());
        self.states.insert(*key, EntityState::Unchanged);
        self.marked.remove(key);
        self.index.forget_child(*key);
        self.index
            .index_record(*key, vtable.entity, (vtable.properties)(), &record);
        Outcome::Ok(())
    }

    /// Resolve a concurrency conflict in favor of this session's values.
    ///
    /// Rebases the snapshot baseline onto the authoritative values carried
    /// by the conflict, so the next commit's expected-value guard matches
    /// the store and this session's modifications win on resubmit.
    pub fn accept_store_values(
        &mut self,
        key: &EntityKey,
        conflict: &ConcurrencyConflict,
    ) -> Result<()> {
        let found = conflict.found.as_ref().ok_or_else(|| {
            Error::NotFound(IdentityError {
                entity: conflict.entity,
                key: conflict.key.clone(),
            })
        })?;
        let mut baseline = self
            .snapshots
            .original(key)
            .cloned()
            .ok_or_else(|| Error::Custom("entry has no snapshot baseline".into()))?;
        for (name, value) in found {
            baseline.set(name, value.clone());
        }
        self.snapshots.capture(*key, baseline);
        Ok(())
    }

    /// Aggregate bookkeeping counters.
    pub fn debug_info(&self) -> SessionDebugInfo {
        let mut info = SessionDebugInfo {
            tracked: self.states.len(),
            pending_links: self.join_ops.len(),
            ..SessionDebugInfo::default()
        };
        for key in self.states.keys() {
            match self.state_of(key) {
                EntityState::Added => info.added += 1,
                EntityState::Modified => info.modified += 1,
                EntityState::Deleted => info.deleted += 1,
                EntityState::Unchanged => info.unchanged += 1,
                EntityState::Detached => {}
            }
        }
        info
    }

    // ------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------

    fn track_loaded<E: Entity + 'static>(
        &mut self,
        key: EntityKey,
        entity: E,
    ) -> Result<EntityRef<E>> {
        let record = entity.to_record();
        let key_values = entity.key_value();
        let newly = !self.states.contains_key(&key);
        let arc = self.map.attach(key, entity)?;
        if newly {
            self.states.insert(key, EntityState::Unchanged);
            self.snapshots.capture(key, record.clone());
            self.index
                .index_record(key, E::ENTITY_NAME, E::properties(), &record);
            self.emit_attach(E::ENTITY_NAME, &key_values);
        }
        Ok(arc)
    }

    /// Track a store record whose concrete type is only known via vtable.
    pub(crate) fn track_record(
        &mut self,
        vtable: &EntityVtable,
        record: &Record,
    ) -> Result<EntityKey> {
        let (cell, key_values) = (vtable.from_record)(record)?;
        let key = EntityKey {
            type_id: vtable.type_id,
            slot: KeySlot::Assigned(hash_key_values(&key_values)),
        };
        let newly = !self.states.contains_key(&key);
        self.map.attach_erased(key, cell, *vtable, key_values.clone())?;
        if newly {
            self.states.insert(key, EntityState::Unchanged);
            self.snapshots.capture(key, record.clone());
            self.index
                .index_record(key, vtable.entity, (vtable.properties)(), record);
            self.emit_attach(vtable.entity, &key_values);
        }
        Ok(key)
    }

    fn entry_changed(&self, key: &EntityKey) -> bool {
        if self.config.observation == ObservationStrategy::Notifying && !self.marked.contains(key) {
            return false;
        }
        match self.map.read_record(key) {
            Some(current) => self.snapshots.is_dirty(key, &current),
            None => false,
        }
    }

    fn detach_inner(&mut self, key: &EntityKey) {
        self.map.forget(key);
        self.states.remove(key);
        self.snapshots.clear(key);
        self.index.forget_child(*key);
        self.marked.remove(key);
        self.pending_refs
            .retain(|(child, _), parent| child != key && parent != key);
        self.join_ops.retain(|op| !op.involves(*key));
    }

    fn relationship_of(
        &self,
        key: &EntityKey,
        name: &'static str,
    ) -> Result<RelationshipInfo> {
        let vtable = self
            .map
            .vtable(key)
            .ok_or_else(|| Error::Custom("entity is not tracked".into()))?;
        vtable
            .relationships
            .iter()
            .find(|r| r.name == name)
            .copied()
            .ok_or_else(|| {
                Error::Custom(format!(
                    "'{}' has no relationship named '{name}'",
                    vtable.entity
                ))
            })
    }

    fn join_of(
        &self,
        key: &EntityKey,
        name: &'static str,
    ) -> Result<(ormtrack_core::JoinTableInfo, &'static str)> {
        let rel = self.relationship_of(key, name)?;
        let join = rel
            .join
            .ok_or_else(|| Error::Custom(format!("'{name}' is not many-to-many")))?;
        Ok((join, rel.related_entity))
    }

    fn check_join_partner(&self, partner: &EntityKey, expected_entity: &'static str) -> Result<()> {
        let vtable = self
            .map
            .vtable(partner)
            .ok_or_else(|| Error::Custom("link partner is not tracked".into()))?;
        if vtable.entity != expected_entity {
            return Err(Error::Custom(format!(
                "link partner is '{}', expected '{expected_entity}'",
                vtable.entity
            )));
        }
        Ok(())
    }

    fn entry_identity(&self, key: &EntityKey) -> (&'static str, Vec<Value>) {
        match self.map.vtable(key) {
            Some(vtable) => (
                vtable.entity,
                self.map.key_values(key).unwrap_or_default(),
            ),
            None => ("", Vec::new()),
        }
    }

    fn emit_attach(&self, entity: &'static str, key_values: &[Value]) {
        if let Some(hook) = &self.events.on_attach {
            hook(entity, key_values);
        }
    }

    pub(crate) fn emit_state_change(
        &self,
        entity: &'static str,
        key_values: &[Value],
        old: EntityState,
        new: EntityState,
    ) {
        if old != new {
            if let Some(hook) = &self.events.on_state_change {
                hook(entity, key_values, old, new);
            }
        }
    }
}
