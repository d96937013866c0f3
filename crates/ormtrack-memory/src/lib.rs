//! In-memory store backend for ormtrack.
//!
//! [`MemoryStore`] implements the persistence port against plain hash maps:
//! entity tables, join tables for many-to-many associations, and per-table
//! auto-increment counters. It enforces the same rules a relational store
//! would: unique keys, foreign-key existence, referential delete actions,
//! and expected-value guards on update and delete.
//!
//! Transactions are copy-on-begin: a transaction works on a private copy of
//! the store state and publishes it atomically on commit, so readers (and
//! conflict reporting in particular) always observe the last committed
//! state.

use asupersync::{Cx, Outcome};
use ormtrack_core::{
    ConstraintError, DeleteBehavior, Entity, Error, Record, RelationshipKind, Result, Store,
    StoreTransaction, Value,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A foreign-key constraint derived from entity metadata.
#[derive(Debug, Clone, Copy)]
struct ForeignKey {
    property: &'static str,
    principal: &'static str,
    on_delete: DeleteBehavior,
}

/// Static shape of one entity table.
#[derive(Debug, Clone)]
struct TableSchema {
    key_props: &'static [&'static str],
    auto_props: Vec<&'static str>,
    foreign_keys: Vec<ForeignKey>,
}

#[derive(Debug, Clone, Default)]
struct Table {
    rows: Vec<Record>,
}

/// One many-to-many join table. Column order is fixed at registration;
/// link and unlink accept the columns in either order.
#[derive(Debug, Clone)]
struct JoinTable {
    columns: [(&'static str, &'static str); 2],
    rows: Vec<(Value, Value)>,
}

#[derive(Debug, Clone, Default)]
struct Inner {
    schemas: HashMap<&'static str, TableSchema>,
    tables: HashMap<&'static str, Table>,
    joins: HashMap<&'static str, JoinTable>,
    next_id: HashMap<&'static str, i64>,
}

/// An in-memory store implementing the persistence port.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity type, creating its table and any join tables its
    /// relationships declare. Registration is idempotent.
    pub fn register<E: Entity>(&self) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner
            .schemas
            .entry(E::ENTITY_NAME)
            .or_insert_with(|| TableSchema {
                key_props: E::KEY,
                auto_props: E::properties()
                    .iter()
                    .filter(|p| p.auto_generated)
                    .map(|p| p.name)
                    .collect(),
                foreign_keys: E::properties()
                    .iter()
                    .filter_map(|p| {
                        Some(ForeignKey {
                            property: p.name,
                            principal: p.principal_entity()?,
                            on_delete: p.on_delete,
                        })
                    })
                    .collect(),
            });
        inner.tables.entry(E::ENTITY_NAME).or_default();
        for rel in E::RELATIONSHIPS {
            if rel.kind != RelationshipKind::ManyToMany {
                continue;
            }
            let Some(join) = rel.join else { continue };
            inner.joins.entry(join.name).or_insert_with(|| JoinTable {
                columns: [
                    (join.self_key, E::ENTITY_NAME),
                    (join.related_key, rel.related_entity),
                ],
                rows: Vec::new(),
            });
        }
    }

    /// Insert rows directly, outside any session. For test setup.
    pub fn seed<E: Entity>(&self, entities: impl IntoIterator<Item = E>) -> Result<Vec<Vec<Value>>> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        entities
            .into_iter()
            .map(|e| inner.insert_row(E::ENTITY_NAME, &e.to_record()))
            .collect()
    }

    /// Number of rows in an entity table.
    #[must_use]
    pub fn row_count(&self, entity: &str) -> usize {
        let inner = self.inner.lock().expect("lock poisoned");
        inner.tables.get(entity).map_or(0, |t| t.rows.len())
    }

    /// Number of entries in a join table.
    #[must_use]
    pub fn join_count(&self, join: &str) -> usize {
        let inner = self.inner.lock().expect("lock poisoned");
        inner.joins.get(join).map_or(0, |j| j.rows.len())
    }

    /// The committed row with the given key, if present.
    #[must_use]
    pub fn row(&self, entity: &str, key: &[Value]) -> Option<Record> {
        let inner = self.inner.lock().expect("lock poisoned");
        inner.find_row(entity, key).cloned()
    }

    /// Whether a join table holds the given pair, in either column order.
    #[must_use]
    pub fn joined(&self, join: &str, a: &Value, b: &Value) -> bool {
        let inner = self.inner.lock().expect("lock poisoned");
        inner.joins.get(join).is_some_and(|j| {
            j.rows
                .iter()
                .any(|(l, r)| (l == a && r == b) || (l == b && r == a))
        })
    }
}

impl Inner {
    fn schema(&self, entity: &str) -> Result<&TableSchema> {
        self.schemas
            .get(entity)
            .ok_or_else(|| Error::Custom(format!("entity '{entity}' is not registered")))
    }

    fn find_row(&self, entity: &str, key: &[Value]) -> Option<&Record> {
        let schema = self.schemas.get(entity)?;
        let table = self.tables.get(entity)?;
        table
            .rows
            .iter()
            .find(|row| key_matches(row, schema.key_props, key))
    }

    fn row_position(&self, entity: &str, key: &[Value]) -> Option<usize> {
        let schema = self.schemas.get(entity)?;
        let table = self.tables.get(entity)?;
        table
            .rows
            .iter()
            .position(|row| key_matches(row, schema.key_props, key))
    }

    /// Existence check for a foreign-key target. Single-property keys only;
    /// FK scalars cannot address composite keys.
    fn principal_exists(&self, entity: &str, value: &Value) -> bool {
        self.find_row(entity, std::slice::from_ref(value)).is_some()
    }

    fn check_foreign_keys(&self, entity: &'static str, record: &Record) -> Result<()> {
        let schema = self.schema(entity)?;
        for fk in &schema.foreign_keys {
            let Some(value) = record.get(fk.property) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            if !self.principal_exists(fk.principal, value) {
                return Err(Error::ForeignKeyConstraint(ConstraintError {
                    entity,
                    constraint: format!("{entity}.{}", fk.property),
                    message: format!("no '{}' row for value {value}", fk.principal),
                }));
            }
        }
        Ok(())
    }

    fn insert_row(&mut self, entity: &'static str, record: &Record) -> Result<Vec<Value>> {
        let schema = self.schema(entity)?.clone();
        let mut record = record.clone();

        for prop in &schema.auto_props {
            let current = record.get(prop).cloned().unwrap_or(Value::Null);
            if current.is_null() {
                let id = self.next_id.entry(entity).or_insert(1);
                record.set(prop, Value::BigInt(*id));
                *id += 1;
            } else if let Some(explicit) = current.as_i64() {
                let next = self.next_id.entry(entity).or_insert(1);
                if explicit >= *next {
                    *next = explicit + 1;
                }
            }
        }

        let key: Vec<Value> = record
            .project(schema.key_props)
            .into_iter()
            .map(|(_, v)| v)
            .collect();
        if self.find_row(entity, &key).is_some() {
            return Err(Error::UniqueConstraint(ConstraintError {
                entity,
                constraint: format!("{entity}.key"),
                message: "a row with this key already exists".into(),
            }));
        }
        self.check_foreign_keys(entity, &record)?;

        self.tables.entry(entity).or_default().rows.push(record);
        Ok(key)
    }

    fn update_row(
        &mut self,
        entity: &'static str,
        key: &[Value],
        changes: &[(&'static str, Value)],
        expected: &[(&'static str, Value)],
    ) -> Result<u64> {
        let Some(pos) = self.row_position(entity, key) else {
            return Ok(0);
        };
        {
            let row = &self.tables[entity].rows[pos];
            if !guard_matches(row, expected) {
                return Ok(0);
            }
            let mut candidate = row.clone();
            for (name, value) in changes {
                candidate.set(name, value.clone());
            }
            self.check_foreign_keys(entity, &candidate)?;
        }
        let row = &mut self
            .tables
            .get_mut(entity)
            .expect("row position without table")
            .rows[pos];
        for (name, value) in changes {
            row.set(name, value.clone());
        }
        Ok(1)
    }

    fn delete_row(
        &mut self,
        entity: &'static str,
        key: &[Value],
        expected: &[(&'static str, Value)],
    ) -> Result<u64> {
        let Some(pos) = self.row_position(entity, key) else {
            return Ok(0);
        };
        if !guard_matches(&self.tables[entity].rows[pos], expected) {
            return Ok(0);
        }
        self.remove_with_actions(entity, key)?;
        Ok(1)
    }

    /// Remove one row, applying referential delete actions to its
    /// dependents: cascade removes recurse, set-null clears the scalar,
    /// restrict and client-cascade refuse while dependents remain.
    fn remove_with_actions(&mut self, entity: &'static str, key: &[Value]) -> Result<()> {
        if key.len() == 1 {
            let key_value = key[0].clone();
            let referencing: Vec<(&'static str, ForeignKey)> = self
                .schemas
                .iter()
                .flat_map(|(child, schema)| {
                    schema
                        .foreign_keys
                        .iter()
                        .filter(|fk| fk.principal == entity)
                        .map(|fk| (*child, *fk))
                })
                .collect();
            for (child, fk) in referencing {
                let dependents: Vec<Vec<Value>> = {
                    let child_schema = self.schema(child)?;
                    let key_props = child_schema.key_props;
                    self.tables
                        .get(child)
                        .map(|t| {
                            t.rows
                                .iter()
                                .filter(|row| row.get(fk.property) == Some(&key_value))
                                .map(|row| {
                                    row.project(key_props).into_iter().map(|(_, v)| v).collect()
                                })
                                .collect()
                        })
                        .unwrap_or_default()
                };
                if dependents.is_empty() {
                    continue;
                }
                match fk.on_delete {
                    DeleteBehavior::Cascade => {
                        for dep_key in dependents {
                            self.remove_with_actions(child, &dep_key)?;
                        }
                    }
                    DeleteBehavior::SetNull => {
                        for dep_key in dependents {
                            if let Some(pos) = self.row_position(child, &dep_key) {
                                self.tables
                                    .get_mut(child)
                                    .expect("row position without table")
                                    .rows[pos]
                                    .set(fk.property, Value::Null);
                            }
                        }
                    }
                    DeleteBehavior::Restrict => {
                        return Err(Error::RestrictViolation(ConstraintError {
                            entity,
                            constraint: format!("{child}.{}", fk.property),
                            message: format!("{} dependent rows remain", dependents.len()),
                        }));
                    }
                    DeleteBehavior::ClientCascade => {
                        return Err(Error::ForeignKeyConstraint(ConstraintError {
                            entity,
                            constraint: format!("{child}.{}", fk.property),
                            message: format!(
                                "{} dependent rows remain; the writer must delete them",
                                dependents.len()
                            ),
                        }));
                    }
                }
            }

            // Join entries referencing the removed row go with it.
            for join in self.joins.values_mut() {
                let [left, right] = join.columns;
                join.rows.retain(|(l, r)| {
                    !((left.1 == entity && *l == key_value)
                        || (right.1 == entity && *r == key_value))
                });
            }
        }

        if let Some(pos) = self.row_position(entity, key) {
            self.tables
                .get_mut(entity)
                .expect("row position without table")
                .rows
                .remove(pos);
        }
        Ok(())
    }

    /// Map a (column, value) pair onto the join table's stored column
    /// order, whichever side the caller named first.
    fn join_pair(
        &self,
        join_entity: &'static str,
        left: (&'static str, Value),
        right: (&'static str, Value),
    ) -> Result<(Value, Value)> {
        let join = self
            .joins
            .get(join_entity)
            .ok_or_else(|| Error::Custom(format!("join table '{join_entity}' is not registered")))?;
        if left.0 == join.columns[0].0 && right.0 == join.columns[1].0 {
            Ok((left.1, right.1))
        } else if left.0 == join.columns[1].0 && right.0 == join.columns[0].0 {
            Ok((right.1, left.1))
        } else {
            Err(Error::Custom(format!(
                "columns ('{}', '{}') do not match join table '{join_entity}'",
                left.0, right.0
            )))
        }
    }
}

fn key_matches(row: &Record, key_props: &[&'static str], key: &[Value]) -> bool {
    key_props.len() == key.len()
        && key_props
            .iter()
            .zip(key)
            .all(|(prop, value)| row.get(prop) == Some(value))
}

fn guard_matches(row: &Record, expected: &[(&'static str, Value)]) -> bool {
    expected
        .iter()
        .all(|(name, value)| row.get(name) == Some(value))
}

impl Store for MemoryStore {
    type Tx<'s> = MemoryTransaction;

    async fn fetch_by_key(
        &self,
        _cx: &Cx,
        entity: &'static str,
        key: &[Value],
    ) -> Outcome<Option<Record>, Error> {
        let inner = self.inner.lock().expect("lock poisoned");
        Outcome::Ok(inner.find_row(entity, key).cloned())
    }

    async fn fetch_by_property(
        &self,
        _cx: &Cx,
        entity: &'static str,
        property: &'static str,
        value: &Value,
    ) -> Outcome<Vec<Record>, Error> {
        let inner = self.inner.lock().expect("lock poisoned");
        let rows = inner
            .tables
            .get(entity)
            .map(|t| {
                t.rows
                    .iter()
                    .filter(|row| row.get(property) == Some(value))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Outcome::Ok(rows)
    }

    async fn fetch_current_values(
        &self,
        _cx: &Cx,
        entity: &'static str,
        key: &[Value],
    ) -> Outcome<Option<Record>, Error> {
        let inner = self.inner.lock().expect("lock poisoned");
        Outcome::Ok(inner.find_row(entity, key).cloned())
    }

    async fn begin(&self, _cx: &Cx) -> Outcome<MemoryTransaction, Error> {
        let working = self.inner.lock().expect("lock poisoned").clone();
        tracing::trace!("transaction begun");
        Outcome::Ok(MemoryTransaction {
            store: Arc::clone(&self.inner),
            working,
        })
    }
}

/// A copy-on-begin transaction over a [`MemoryStore`].
///
/// All writes land in a private copy; commit publishes the copy, rollback
/// (or drop) discards it.
pub struct MemoryTransaction {
    store: Arc<Mutex<Inner>>,
    working: Inner,
}

impl StoreTransaction for MemoryTransaction {
    async fn insert(
        &mut self,
        _cx: &Cx,
        entity: &'static str,
        record: &Record,
    ) -> Outcome<Vec<Value>, Error> {
        match self.working.insert_row(entity, record) {
            Ok(key) => Outcome::Ok(key),
            Err(e) => Outcome::Err(e),
        }
    }

    async fn update(
        &mut self,
        _cx: &Cx,
        entity: &'static str,
        key: &[Value],
        changes: &[(&'static str, Value)],
        expected: &[(&'static str, Value)],
    ) -> Outcome<u64, Error> {
        match self.working.update_row(entity, key, changes, expected) {
            Ok(rows) => Outcome::Ok(rows),
            Err(e) => Outcome::Err(e),
        }
    }

    async fn delete(
        &mut self,
        _cx: &Cx,
        entity: &'static str,
        key: &[Value],
        expected: &[(&'static str, Value)],
    ) -> Outcome<u64, Error> {
        match self.working.delete_row(entity, key, expected) {
            Ok(rows) => Outcome::Ok(rows),
            Err(e) => Outcome::Err(e),
        }
    }

    async fn link(
        &mut self,
        _cx: &Cx,
        join_entity: &'static str,
        left: (&'static str, Value),
        right: (&'static str, Value),
    ) -> Outcome<(), Error> {
        let pair = match self.working.join_pair(join_entity, left, right) {
            Ok(pair) => pair,
            Err(e) => return Outcome::Err(e),
        };
        let join = self
            .working
            .joins
            .get_mut(join_entity)
            .expect("join checked above");
        if !join.rows.contains(&pair) {
            join.rows.push(pair);
        }
        Outcome::Ok(())
    }

    async fn unlink(
        &mut self,
        _cx: &Cx,
        join_entity: &'static str,
        left: (&'static str, Value),
        right: (&'static str, Value),
    ) -> Outcome<(), Error> {
        let pair = match self.working.join_pair(join_entity, left, right) {
            Ok(pair) => pair,
            Err(e) => return Outcome::Err(e),
        };
        let join = self
            .working
            .joins
            .get_mut(join_entity)
            .expect("join checked above");
        join.rows.retain(|row| *row != pair);
        Outcome::Ok(())
    }

    async fn commit(self, _cx: &Cx) -> Outcome<(), Error> {
        *self.store.lock().expect("lock poisoned") = self.working;
        tracing::trace!("transaction committed");
        Outcome::Ok(())
    }

    async fn rollback(self, _cx: &Cx) -> Outcome<(), Error> {
        tracing::trace!("transaction rolled back");
        Outcome::Ok(())
    }
}
