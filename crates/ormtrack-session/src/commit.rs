//! Commit pipeline: turning tracked changes into ordered store operations.
//!
//! A commit runs in three phases:
//!
//! 1. **Plan** (synchronous): expand client-side cascades, collect the
//!    pending operations, and order them so referential constraints hold
//!    at every point: unlinks, then updates that clear foreign keys, then
//!    deletes child-first, then inserts parent-first, then the remaining
//!    updates, foreign-key patches, and links.
//! 2. **Execute**: run the plan inside one store transaction. Guarded
//!    updates and deletes that affect zero rows are concurrency misses;
//!    the authoritative row is fetched, a conflict built, and the whole
//!    transaction rolled back.
//! 3. **Apply**: only after the transaction committed, write store-assigned
//!    keys back, rekey transient entries, resolve deferred references,
//!    resync snapshots, and settle entity states.
//!
//! Insert cycles (mutually referencing new rows) are broken by choosing a
//! nullable foreign key inside the cycle: the child row is inserted with
//! that key NULL and patched once its principal exists.

use crate::identity_map::{EntityKey, EntityVtable, KeySlot, hash_key_values};
use crate::{EntityState, Session, SnapshotStore};
use asupersync::{Cx, Outcome};
use ormtrack_core::{
    ConcurrencyConflict, ConflictKind, DeleteBehavior, Error, JoinTableInfo, Record, Store,
    StoreTransaction, Value,
};
use std::collections::{HashMap, HashSet};

/// Propagate the non-success arms of an [`Outcome`].
macro_rules! outcome_try {
    ($expr:expr) => {
        match $expr {
            Outcome::Ok(v) => v,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
    };
}

/// Counters for one successful commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitResult {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub linked: usize,
    pub unlinked: usize,
}

impl CommitResult {
    /// Whether the commit had nothing to do.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inserted == 0
            && self.updated == 0
            && self.deleted == 0
            && self.linked == 0
            && self.unlinked == 0
    }
}

/// A queued many-to-many association change.
#[derive(Debug, Clone, Copy)]
pub(crate) struct JoinOp {
    /// `true` for link, `false` for unlink
    pub link: bool,
    pub join: JoinTableInfo,
    pub left: EntityKey,
    pub right: EntityKey,
}

impl JoinOp {
    pub(crate) fn involves(&self, key: EntityKey) -> bool {
        self.left == key || self.right == key
    }

    /// Whether this op concerns the same unordered pair in the same join.
    pub(crate) fn same_pair(&self, join_name: &str, a: EntityKey, b: EntityKey) -> bool {
        self.join.name == join_name
            && ((self.left == a && self.right == b) || (self.left == b && self.right == a))
    }
}

/// A dependency between two rows scheduled for insert.
#[derive(Debug, Clone, Copy)]
pub(crate) struct InsertEdge {
    pub child: EntityKey,
    pub parent: EntityKey,
    pub fk: &'static str,
    pub nullable: bool,
}

/// A deferred foreign-key write used to break an insert cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PatchOp {
    pub child: EntityKey,
    pub fk: &'static str,
    pub parent: EntityKey,
}

/// Order inserts so every principal precedes its dependents.
///
/// When the dependency graph has a cycle, one nullable edge per cycle is
/// cut and returned as a patch; the corresponding row is inserted with
/// that foreign key NULL. A cycle with no nullable edge cannot be
/// satisfied and is an error.
pub(crate) fn order_inserts(
    nodes: &[EntityKey],
    edges: &[InsertEdge],
) -> ormtrack_core::Result<(Vec<EntityKey>, Vec<PatchOp>)> {
    let node_set: HashSet<EntityKey> = nodes.iter().copied().collect();
    let mut indegree: HashMap<EntityKey, usize> = nodes.iter().map(|n| (*n, 0)).collect();
    let mut live: Vec<bool> = vec![false; edges.len()];
    for (i, edge) in edges.iter().enumerate() {
        if node_set.contains(&edge.parent) && node_set.contains(&edge.child) {
            live[i] = true;
            *indegree.entry(edge.child).or_default() += 1;
        }
    }

    let mut ordered = Vec::with_capacity(nodes.len());
    let mut patches = Vec::new();
    let mut placed: HashSet<EntityKey> = HashSet::new();

    while ordered.len() < nodes.len() {
        let next = nodes
            .iter()
            .copied()
            .find(|n| !placed.contains(n) && indegree[n] == 0);
        if let Some(n) = next {
            placed.insert(n);
            ordered.push(n);
            for (i, edge) in edges.iter().enumerate() {
                if live[i] && edge.parent == n {
                    live[i] = false;
                    *indegree.get_mut(&edge.child).expect("edge child not a node") -= 1;
                }
            }
            continue;
        }

        // Every remaining node waits on another: a cycle. Cut one
        // nullable edge among the unplaced nodes.
        let cut = edges.iter().enumerate().find(|(i, e)| {
            live[*i] && e.nullable && !placed.contains(&e.child) && !placed.contains(&e.parent)
        });
        let Some((i, edge)) = cut else {
            return Err(Error::Custom(
                "insert cycle with no nullable foreign key to break it".into(),
            ));
        };
        live[i] = false;
        *indegree.get_mut(&edge.child).expect("edge child not a node") -= 1;
        patches.push(PatchOp {
            child: edge.child,
            fk: edge.fk,
            parent: edge.parent,
        });
    }
    Ok((ordered, patches))
}

/// Order deletes so every dependent precedes its principal.
///
/// Cycles (mutual references within the delete set) are appended in input
/// order; the guarded deletes still run, relying on the store's deferred
/// or absent checking for the cyclic remainder.
pub(crate) fn order_deletes(
    nodes: &[EntityKey],
    edges: &[(EntityKey, EntityKey)],
) -> Vec<EntityKey> {
    let node_set: HashSet<EntityKey> = nodes.iter().copied().collect();
    // indegree of a principal = dependents that must go first
    let mut indegree: HashMap<EntityKey, usize> = nodes.iter().map(|n| (*n, 0)).collect();
    let mut live: Vec<bool> = vec![false; edges.len()];
    for (i, (child, parent)) in edges.iter().enumerate() {
        if node_set.contains(child) && node_set.contains(parent) && child != parent {
            live[i] = true;
            *indegree.entry(*parent).or_default() += 1;
        }
    }

    let mut ordered = Vec::with_capacity(nodes.len());
    let mut placed: HashSet<EntityKey> = HashSet::new();
    loop {
        let next = nodes
            .iter()
            .copied()
            .find(|n| !placed.contains(n) && indegree[n] == 0);
        let Some(n) = next else { break };
        placed.insert(n);
        ordered.push(n);
        for (i, (child, parent)) in edges.iter().enumerate() {
            if live[i] && *child == n {
                live[i] = false;
                *indegree.get_mut(parent).expect("edge parent not a node") -= 1;
            }
        }
    }
    for n in nodes {
        if !placed.contains(n) {
            ordered.push(*n);
        }
    }
    ordered
}

struct DeleteStep {
    key: EntityKey,
    entity: &'static str,
    key_values: Vec<Value>,
    expected: Vec<(&'static str, Value)>,
}

struct UpdateStep {
    key: EntityKey,
    entity: &'static str,
    key_values: Vec<Value>,
    changes: Vec<(&'static str, Value)>,
    /// Foreign keys whose value arrives from an insert in this same commit.
    pending: Vec<(&'static str, EntityKey)>,
    expected: Vec<(&'static str, Value)>,
}

struct InsertStep {
    key: EntityKey,
    entity: &'static str,
    record: Record,
    pending: Vec<(&'static str, EntityKey)>,
}

struct CommitPlan {
    unlinks: Vec<JoinOp>,
    pre_updates: Vec<UpdateStep>,
    deletes: Vec<DeleteStep>,
    inserts: Vec<InsertStep>,
    post_updates: Vec<UpdateStep>,
    patches: Vec<PatchOp>,
    links: Vec<JoinOp>,
}

struct ExecOutput {
    /// Store-assigned key values per inserted entry.
    assigned: HashMap<EntityKey, Vec<Value>>,
}

impl<S: Store> Session<S> {
    /// Persist every pending change in one store transaction.
    ///
    /// On success the session is resynchronized: inserted entries become
    /// `Unchanged` under their store-assigned keys, updated entries get a
    /// fresh snapshot baseline, deleted entries are detached, and queued
    /// link operations are drained.
    ///
    /// On a concurrency miss the transaction is rolled back and the error
    /// carries a [`ConcurrencyConflict`] with both sides of the
    /// disagreement; the session keeps its state so the caller can resolve
    /// and commit again. Dependents pulled in for client-side cascading
    /// are released again when the commit fails.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn commit(&mut self, cx: &Cx) -> Outcome<CommitResult, Error> {
        let mut expansion = Vec::new();
        let (plan, output) = match self.execute_pending(cx, &mut expansion).await {
            Outcome::Ok(executed) => executed,
            Outcome::Err(e) => {
                self.revert_cascade_expansion(expansion);
                return Outcome::Err(e);
            }
            Outcome::Cancelled(r) => {
                self.revert_cascade_expansion(expansion);
                return Outcome::Cancelled(r);
            }
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        match self.apply_plan(&plan, &output.assigned) {
            Ok(result) => {
                tracing::debug!(
                    inserted = result.inserted,
                    updated = result.updated,
                    deleted = result.deleted,
                    "commit applied"
                );
                if let Some(hook) = &self.events.on_commit {
                    hook(&result);
                }
                Outcome::Ok(result)
            }
            Err(e) => Outcome::Err(e),
        }
    }

    /// Expand cascades, plan, and run every operation in one transaction.
    async fn execute_pending(
        &mut self,
        cx: &Cx,
        expansion: &mut Vec<(EntityKey, Option<EntityState>)>,
    ) -> Outcome<(CommitPlan, ExecOutput), Error> {
        outcome_try!(self.expand_client_cascades(cx, expansion).await);
        let plan = match self.build_plan() {
            Ok(plan) => plan,
            Err(e) => return Outcome::Err(e),
        };

        let mut tx = outcome_try!(self.store.begin(cx).await);
        let output = match self.execute_plan(cx, &mut tx, &plan).await {
            Outcome::Ok(output) => output,
            Outcome::Err(e) => {
                // Best effort; the original error is what matters.
                let _ = tx.rollback(cx).await;
                return Outcome::Err(e);
            }
            Outcome::Cancelled(r) => {
                let _ = tx.rollback(cx).await;
                return Outcome::Cancelled(r);
            }
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        outcome_try!(tx.commit(cx).await);
        Outcome::Ok((plan, output))
    }

    /// Undo what [`expand_client_cascades`](Self::expand_client_cascades)
    /// did to the session, newest change first.
    fn revert_cascade_expansion(&mut self, expansion: Vec<(EntityKey, Option<EntityState>)>) {
        for (key, previous) in expansion.into_iter().rev() {
            match previous {
                Some(state) => {
                    self.states.insert(key, state);
                }
                None => self.detach_inner(&key),
            }
        }
    }

    /// Pull stored, untracked dependents of client-cascade deletes into
    /// the session as `Deleted`, until the closure is complete.
    ///
    /// Every state change is recorded in `expansion` so a failed commit
    /// can put the session back exactly as it was.
    async fn expand_client_cascades(
        &mut self,
        cx: &Cx,
        expansion: &mut Vec<(EntityKey, Option<EntityState>)>,
    ) -> Outcome<(), Error> {
        let mut frontier: Vec<EntityKey> = self
            .states
            .iter()
            .filter(|(_, s)| **s == EntityState::Deleted)
            .map(|(k, _)| *k)
            .collect();

        while let Some(key) = frontier.pop() {
            let Some(vtable) = self.map.vtable(&key).copied() else {
                continue;
            };
            let Some(key_values) = self.map.key_values(&key) else {
                continue;
            };
            for rel in vtable.relationships {
                if rel.on_delete != DeleteBehavior::ClientCascade {
                    continue;
                }
                let Some(fk) = rel.foreign_key else { continue };
                let Some(related) = self.types.get(rel.related_entity).copied() else {
                    return Outcome::Err(Error::Custom(format!(
                        "entity type '{}' must be registered before a cascading commit",
                        rel.related_entity
                    )));
                };
                if key_values.len() != 1 {
                    return Outcome::Err(Error::Custom(
                        "client cascade over a composite key is not supported".into(),
                    ));
                }
                let records = outcome_try!(
                    self.store
                        .fetch_by_property(cx, rel.related_entity, fk, &key_values[0])
                        .await
                );
                for record in records {
                    let dep_key_values: Vec<Value> = record
                        .project(related.key_props)
                        .into_iter()
                        .map(|(_, v)| v)
                        .collect();
                    let dep_key = EntityKey {
                        type_id: related.type_id,
                        slot: KeySlot::Assigned(hash_key_values(&dep_key_values)),
                    };
                    let previous = self.states.get(&dep_key).copied();
                    if previous == Some(EntityState::Deleted) {
                        continue;
                    }
                    if previous.is_none() {
                        if let Err(e) = self.track_record(&related, &record) {
                            return Outcome::Err(e);
                        }
                    }
                    expansion.push((dep_key, previous));
                    let old = self.state_of(&dep_key);
                    self.states.insert(dep_key, EntityState::Deleted);
                    self.emit_state_change(
                        related.entity,
                        &dep_key_values,
                        old,
                        EntityState::Deleted,
                    );
                    frontier.push(dep_key);
                }
            }
        }
        Outcome::Ok(())
    }

    fn build_plan(&self) -> ormtrack_core::Result<CommitPlan> {
        let mut delete_keys = Vec::new();
        let mut insert_keys = Vec::new();
        let mut pre_updates = Vec::new();
        let mut post_updates = Vec::new();

        let mut tracked: Vec<EntityKey> = self.states.keys().copied().collect();
        tracked.sort_by_key(|k| k.slot_order());

        for key in tracked {
            match self.states[&key] {
                EntityState::Deleted => delete_keys.push(key),
                EntityState::Added => insert_keys.push(key),
                EntityState::Unchanged => {
                    let pending = self.pending_of(&key);
                    let changed = self.state_of(&key) == EntityState::Modified;
                    if !changed && pending.is_empty() {
                        continue;
                    }
                    let vtable = self.vtable_of(&key)?;
                    let current = self
                        .map
                        .read_record(&key)
                        .ok_or_else(|| Error::Custom("tracked entry lost its instance".into()))?;
                    let step = UpdateStep {
                        key,
                        entity: vtable.entity,
                        key_values: self.map.key_values(&key).unwrap_or_default(),
                        changes: self.snapshots.changes(&key, &current),
                        pending: pending.clone(),
                        expected: guard_pairs(&self.snapshots, &key, &vtable),
                    };
                    if pending.is_empty() {
                        pre_updates.push(step);
                    } else {
                        post_updates.push(step);
                    }
                }
                EntityState::Detached | EntityState::Modified => {}
            }
        }

        // Deletes: dependents first, resolved through FK values.
        let delete_identity: HashMap<(&'static str, u64), EntityKey> = delete_keys
            .iter()
            .filter_map(|k| {
                let vtable = self.map.vtable(k)?;
                let key_values = self.map.key_values(k)?;
                Some(((vtable.entity, hash_key_values(&key_values)), *k))
            })
            .collect();
        let mut delete_edges = Vec::new();
        for key in &delete_keys {
            let vtable = self.vtable_of(key)?;
            let Some(record) = self.map.read_record(key) else {
                continue;
            };
            for prop in (vtable.properties)() {
                let Some(principal) = prop.principal_entity() else {
                    continue;
                };
                let Some(value) = record.get(prop.name) else {
                    continue;
                };
                if value.is_null() {
                    continue;
                }
                let principal_hash = hash_key_values(std::slice::from_ref(value));
                if let Some(parent) = delete_identity.get(&(principal, principal_hash)) {
                    delete_edges.push((*key, *parent));
                }
            }
        }
        let delete_order = order_deletes(&delete_keys, &delete_edges);
        let mut deletes = Vec::with_capacity(delete_order.len());
        for key in delete_order {
            let vtable = self.vtable_of(&key)?;
            deletes.push(DeleteStep {
                key,
                entity: vtable.entity,
                key_values: self.map.key_values(&key).unwrap_or_default(),
                expected: guard_pairs(&self.snapshots, &key, &vtable),
            });
        }

        // Inserts: principals first, with nullable cycle breaking.
        let insert_identity: HashMap<(&'static str, u64), EntityKey> = insert_keys
            .iter()
            .filter(|k| !k.is_transient())
            .filter_map(|k| {
                let vtable = self.map.vtable(k)?;
                let key_values = self.map.key_values(k)?;
                Some(((vtable.entity, hash_key_values(&key_values)), *k))
            })
            .collect();
        let insert_set: HashSet<EntityKey> = insert_keys.iter().copied().collect();
        let mut insert_edges = Vec::new();
        for key in &insert_keys {
            let vtable = self.vtable_of(key)?;
            let Some(record) = self.map.read_record(key) else {
                continue;
            };
            let props = (vtable.properties)();
            for (fk, parent) in self.pending_of(key) {
                if insert_set.contains(&parent) {
                    let nullable = props.iter().any(|p| p.name == fk && p.nullable);
                    insert_edges.push(InsertEdge {
                        child: *key,
                        parent,
                        fk,
                        nullable,
                    });
                }
            }
            for prop in props {
                let Some(principal) = prop.principal_entity() else {
                    continue;
                };
                let Some(value) = record.get(prop.name) else {
                    continue;
                };
                if value.is_null() {
                    continue;
                }
                let principal_hash = hash_key_values(std::slice::from_ref(value));
                if let Some(parent) = insert_identity.get(&(principal, principal_hash)) {
                    if parent != key {
                        insert_edges.push(InsertEdge {
                            child: *key,
                            parent: *parent,
                            fk: prop.name,
                            nullable: prop.nullable,
                        });
                    }
                }
            }
        }
        let (insert_order, patches) = order_inserts(&insert_keys, &insert_edges)?;
        let patched: HashSet<(EntityKey, &'static str)> =
            patches.iter().map(|p| (p.child, p.fk)).collect();
        let mut inserts = Vec::with_capacity(insert_order.len());
        for key in insert_order {
            let vtable = self.vtable_of(&key)?;
            let mut record = self
                .map
                .read_record(&key)
                .ok_or_else(|| Error::Custom("tracked entry lost its instance".into()))?;
            let mut pending = self.pending_of(&key);
            pending.retain(|(fk, _)| !patched.contains(&(key, *fk)));
            for (child, fk, _) in patches.iter().map(|p| (p.child, p.fk, p.parent)) {
                if child == key {
                    record.set(fk, Value::Null);
                }
            }
            inserts.push(InsertStep {
                key,
                entity: vtable.entity,
                record,
                pending,
            });
        }

        Ok(CommitPlan {
            unlinks: self.join_ops.iter().filter(|op| !op.link).copied().collect(),
            pre_updates,
            deletes,
            inserts,
            post_updates,
            patches,
            links: self.join_ops.iter().filter(|op| op.link).copied().collect(),
        })
    }

    async fn execute_plan(
        &self,
        cx: &Cx,
        tx: &mut S::Tx<'_>,
        plan: &CommitPlan,
    ) -> Outcome<ExecOutput, Error> {
        let mut assigned: HashMap<EntityKey, Vec<Value>> = HashMap::new();

        for op in &plan.unlinks {
            let left = outcome_try!(self.resolved_single(&op.left, &assigned));
            let right = outcome_try!(self.resolved_single(&op.right, &assigned));
            outcome_try!(
                tx.unlink(cx, op.join.name, (op.join.self_key, left), (op.join.related_key, right))
                    .await
            );
        }

        for step in &plan.pre_updates {
            outcome_try!(self.run_update(cx, tx, step, &assigned).await);
        }

        for step in &plan.deletes {
            let rows = outcome_try!(
                tx.delete(cx, step.entity, &step.key_values, &step.expected)
                    .await
            );
            if rows == 0 {
                let conflict = outcome_try!(
                    self.build_conflict(cx, step.entity, &step.key_values, &step.expected)
                        .await
                );
                return Outcome::Err(Error::Conflict(conflict));
            }
        }

        for step in &plan.inserts {
            let mut record = step.record.clone();
            for (fk, parent) in &step.pending {
                let value = outcome_try!(self.resolved_single(parent, &assigned));
                record.set(fk, value);
            }
            let key_values = outcome_try!(tx.insert(cx, step.entity, &record).await);
            assigned.insert(step.key, key_values);
        }

        for step in &plan.post_updates {
            outcome_try!(self.run_update(cx, tx, step, &assigned).await);
        }

        for patch in &plan.patches {
            let key_values = outcome_try!(self.resolved_key_values(&patch.child, &assigned));
            let value = outcome_try!(self.resolved_single(&patch.parent, &assigned));
            let entity = match self.map.vtable(&patch.child) {
                Some(vtable) => vtable.entity,
                None => return Outcome::Err(Error::Custom("patched entry vanished".into())),
            };
            outcome_try!(
                tx.update(cx, entity, &key_values, &[(patch.fk, value)], &[])
                    .await
            );
        }

        for op in &plan.links {
            let left = outcome_try!(self.resolved_single(&op.left, &assigned));
            let right = outcome_try!(self.resolved_single(&op.right, &assigned));
            outcome_try!(
                tx.link(cx, op.join.name, (op.join.self_key, left), (op.join.related_key, right))
                    .await
            );
        }

        Outcome::Ok(ExecOutput { assigned })
    }

    async fn run_update(
        &self,
        cx: &Cx,
        tx: &mut S::Tx<'_>,
        step: &UpdateStep,
        assigned: &HashMap<EntityKey, Vec<Value>>,
    ) -> Outcome<(), Error> {
        let mut changes = step.changes.clone();
        for (fk, parent) in &step.pending {
            let value = outcome_try!(self.resolved_single(parent, assigned));
            if let Some(existing) = changes.iter_mut().find(|(name, _)| name == fk) {
                existing.1 = value;
            } else {
                changes.push((fk, value));
            }
        }
        if changes.is_empty() {
            return Outcome::Ok(());
        }
        let rows = outcome_try!(
            tx.update(cx, step.entity, &step.key_values, &changes, &step.expected)
                .await
        );
        if rows == 0 {
            let conflict = outcome_try!(
                self.build_conflict(cx, step.entity, &step.key_values, &step.expected)
                    .await
            );
            return Outcome::Err(Error::Conflict(conflict));
        }
        Outcome::Ok(())
    }

    /// Fetch the authoritative row and package both sides of a concurrency
    /// disagreement.
    async fn build_conflict(
        &self,
        cx: &Cx,
        entity: &'static str,
        key_values: &[Value],
        expected: &[(&'static str, Value)],
    ) -> Outcome<ConcurrencyConflict, Error> {
        let current = outcome_try!(self.store.fetch_current_values(cx, entity, key_values).await);
        let kind = if current.is_some() {
            ConflictKind::ValueMismatch
        } else {
            ConflictKind::DeletedByAnotherWriter
        };
        tracing::debug!(entity, kind = ?kind, "concurrency conflict");
        Outcome::Ok(ConcurrencyConflict {
            entity,
            key: key_values.to_vec(),
            kind,
            expected: expected.to_vec(),
            found: current.map(Record::into_pairs),
        })
    }

    fn apply_plan(
        &mut self,
        plan: &CommitPlan,
        assigned: &HashMap<EntityKey, Vec<Value>>,
    ) -> ormtrack_core::Result<CommitResult> {
        let result = CommitResult {
            inserted: plan.inserts.len(),
            updated: plan.pre_updates.len() + plan.post_updates.len() + plan.patches.len(),
            deleted: plan.deletes.len(),
            linked: plan.links.len(),
            unlinked: plan.unlinks.len(),
        };

        for step in &plan.deletes {
            self.states.remove(&step.key);
            self.map.forget(&step.key);
            self.snapshots.clear(&step.key);
            self.index.forget_child(step.key);
            self.marked.remove(&step.key);
            self.emit_state_change(
                step.entity,
                &step.key_values,
                EntityState::Deleted,
                EntityState::Detached,
            );
        }

        // Rekey inserted entries under their store-assigned keys.
        let mut rekeyed: HashMap<EntityKey, EntityKey> = HashMap::new();
        for step in &plan.inserts {
            let vtable = self.vtable_of(&step.key)?;
            let mut new_key = step.key;
            if step.key.is_transient() {
                let key_values = assigned
                    .get(&step.key)
                    .ok_or_else(|| Error::Custom("insert produced no key values".into()))?;
                for (prop, value) in vtable.key_props.iter().zip(key_values) {
                    self.map.write_property(&step.key, prop, value.clone())?;
                }
                new_key = self
                    .map
                    .rekey(&step.key)
                    .ok_or_else(|| Error::Custom("inserted entry vanished before rekey".into()))?;
                self.snapshots.rekey(&step.key, new_key);
                self.index.rekey_child(step.key, new_key);
                self.states.remove(&step.key);
                self.marked.remove(&step.key);
                rekeyed.insert(step.key, new_key);
            }
            self.states.insert(new_key, EntityState::Unchanged);
        }

        // Resolve deferred references in the tracked instances themselves.
        let pending: Vec<((EntityKey, &'static str), EntityKey)> =
            self.pending_refs.drain().collect();
        for ((child, fk), parent) in pending {
            let child = *rekeyed.get(&child).unwrap_or(&child);
            let parent = *rekeyed.get(&parent).unwrap_or(&parent);
            if !self.states.contains_key(&child) {
                continue;
            }
            let mut parent_key = self
                .map
                .key_values(&parent)
                .ok_or_else(|| Error::Custom("referenced principal vanished".into()))?;
            if parent_key.len() != 1 {
                return Err(Error::Custom(
                    "a single foreign key cannot reference a composite key".into(),
                ));
            }
            let value = parent_key.remove(0);
            let vtable = self.vtable_of(&child)?;
            let principal = (vtable.properties)()
                .iter()
                .find(|p| p.name == fk)
                .and_then(ormtrack_core::PropertyInfo::principal_entity)
                .unwrap_or_default();
            self.map.write_property(&child, fk, value.clone())?;
            self.index
                .on_foreign_key_changed(child, vtable.entity, fk, principal, Some(&value));
        }

        // Fresh baselines for everything that survived the commit.
        for step in &plan.inserts {
            let key = *rekeyed.get(&step.key).unwrap_or(&step.key);
            let record = self
                .map
                .read_record(&key)
                .ok_or_else(|| Error::Custom("inserted entry vanished after rekey".into()))?;
            let key_values = self.map.key_values(&key).unwrap_or_default();
            self.snapshots.capture(key, record);
            self.emit_state_change(
                step.entity,
                &key_values,
                EntityState::Added,
                EntityState::Unchanged,
            );
        }
        for step in plan.pre_updates.iter().chain(&plan.post_updates) {
            let key = *rekeyed.get(&step.key).unwrap_or(&step.key);
            if let Some(record) = self.map.read_record(&key) {
                self.snapshots.capture(key, record);
            }
            self.emit_state_change(
                step.entity,
                &step.key_values,
                EntityState::Modified,
                EntityState::Unchanged,
            );
        }

        self.join_ops.clear();
        self.marked.clear();
        Ok(result)
    }

    fn pending_of(&self, key: &EntityKey) -> Vec<(&'static str, EntityKey)> {
        self.pending_refs
            .iter()
            .filter(|((child, _), _)| child == key)
            .map(|((_, fk), parent)| (*fk, *parent))
            .collect()
    }

    fn vtable_of(&self, key: &EntityKey) -> ormtrack_core::Result<EntityVtable> {
        self.map
            .vtable(key)
            .copied()
            .ok_or_else(|| Error::Custom("tracked entry missing from identity map".into()))
    }

    fn resolved_key_values(
        &self,
        key: &EntityKey,
        assigned: &HashMap<EntityKey, Vec<Value>>,
    ) -> Outcome<Vec<Value>, Error> {
        if let Some(values) = assigned.get(key) {
            return Outcome::Ok(values.clone());
        }
        match self.map.key_values(key) {
            Some(values) => Outcome::Ok(values),
            None => Outcome::Err(Error::Custom("referenced entry is not tracked".into())),
        }
    }

    fn resolved_single(
        &self,
        key: &EntityKey,
        assigned: &HashMap<EntityKey, Vec<Value>>,
    ) -> Outcome<Value, Error> {
        let mut values = outcome_try!(self.resolved_key_values(key, assigned));
        if values.len() != 1 {
            return Outcome::Err(Error::Custom(
                "a single foreign key cannot reference a composite key".into(),
            ));
        }
        Outcome::Ok(values.remove(0))
    }
}

impl EntityKey {
    /// Stable ordering helper so plans are deterministic across runs.
    fn slot_order(&self) -> (u8, u64) {
        match self.slot {
            KeySlot::Assigned(h) => (0, h),
            KeySlot::Transient(n) => (1, n),
        }
    }
}

/// Properties guarding an update or delete: declared concurrency tokens,
/// or every non-key property when none are declared. Values come from the
/// snapshot baseline, the state this writer last read.
fn guard_pairs(
    snapshots: &SnapshotStore,
    key: &EntityKey,
    vtable: &EntityVtable,
) -> Vec<(&'static str, Value)> {
    let props = (vtable.properties)();
    let tokens: Vec<&str> = props
        .iter()
        .filter(|p| p.concurrency_token)
        .map(|p| p.name)
        .collect();
    let guards: Vec<&str> = if tokens.is_empty() {
        props.iter().filter(|p| !p.key).map(|p| p.name).collect()
    } else {
        tokens
    };
    snapshots
        .original(key)
        .map(|record| record.project(&guards))
        .unwrap_or_default()
}
