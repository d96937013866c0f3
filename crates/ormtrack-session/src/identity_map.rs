//! Identity map: at most one tracked instance per (type, key).
//!
//! The identity map guarantees that each store row corresponds to exactly
//! one instance within a session:
//!
//! - **Uniqueness**: the same key always resolves to the same reference
//! - **Cache**: repeated loads of the same row skip the store
//! - **Consistency**: changes to an instance are visible everywhere it's used
//!
//! # Design
//!
//! Entries hold `Arc<RwLock<E>>` type-erased behind `Box<dyn Any>`, so
//! getting the same key twice returns clones of the same `Arc`. Each entry
//! also carries an [`EntityVtable`] of erased accessors, which lets the
//! session read records and write properties without knowing the concrete
//! type at the call site.
//!
//! Entities whose key the store has not assigned yet are tracked under a
//! session-local transient slot and rekeyed after commit.

use ormtrack_core::{Entity, Error, IdentityError, PropertyInfo, Record, RelationshipInfo, Result, Value};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Hash a slice of key values into a stable identifier.
pub(crate) fn hash_key_values(values: &[Value]) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::Hasher;

    let mut hasher = DefaultHasher::new();
    for v in values {
        hash_single_value(v, &mut hasher);
    }
    hasher.finish()
}

/// Hash a single Value into the hasher, tagged by variant.
fn hash_single_value(v: &Value, hasher: &mut impl std::hash::Hasher) {
    use std::hash::Hash;

    match v {
        Value::Null => 0u8.hash(hasher),
        Value::Bool(b) => {
            1u8.hash(hasher);
            b.hash(hasher);
        }
        Value::Int(i) => {
            2u8.hash(hasher);
            i.hash(hasher);
        }
        Value::BigInt(i) => {
            3u8.hash(hasher);
            i.hash(hasher);
        }
        Value::Double(f) => {
            4u8.hash(hasher);
            f.to_bits().hash(hasher);
        }
        Value::Decimal(s) => {
            5u8.hash(hasher);
            s.hash(hasher);
        }
        Value::Text(s) => {
            6u8.hash(hasher);
            s.hash(hasher);
        }
        Value::Bytes(b) => {
            7u8.hash(hasher);
            b.hash(hasher);
        }
        Value::Date(d) => {
            8u8.hash(hasher);
            d.hash(hasher);
        }
        Value::Timestamp(ts) => {
            9u8.hash(hasher);
            ts.hash(hasher);
        }
        Value::Uuid(u) => {
            10u8.hash(hasher);
            u.hash(hasher);
        }
    }
}

/// How a tracked entry is identified within its type's namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeySlot {
    /// A real primary key, identified by its hash
    Assigned(u64),
    /// A session-local placeholder for entities with no key yet
    Transient(u64),
}

/// Identity of one tracked entry: entity type plus key slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityKey {
    pub(crate) type_id: TypeId,
    pub(crate) slot: KeySlot,
}

impl EntityKey {
    /// Key for an entity with real key values.
    #[must_use]
    pub fn assigned<E: Entity + 'static>(key_values: &[Value]) -> Self {
        Self {
            type_id: TypeId::of::<E>(),
            slot: KeySlot::Assigned(hash_key_values(key_values)),
        }
    }

    /// Key for an entity awaiting a store-assigned key.
    #[must_use]
    pub fn transient<E: Entity + 'static>(id: u64) -> Self {
        Self {
            type_id: TypeId::of::<E>(),
            slot: KeySlot::Transient(id),
        }
    }

    /// Whether this entry is still awaiting a store-assigned key.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self.slot, KeySlot::Transient(_))
    }
}

/// A shared reference to a tracked entity.
pub type EntityRef<E> = Arc<RwLock<E>>;

type ErasedCell = Box<dyn Any + Send + Sync>;

/// Erased accessors over one entity type.
///
/// Built once per concrete type at attach time; all fields are plain fn
/// pointers instantiated from the `Entity` impl, so the session can work
/// with entries uniformly during fixup and commit.
#[derive(Clone, Copy)]
pub(crate) struct EntityVtable {
    pub entity: &'static str,
    pub type_id: TypeId,
    pub key_props: &'static [&'static str],
    pub properties: fn() -> &'static [PropertyInfo],
    pub relationships: &'static [RelationshipInfo],
    pub read_record: fn(&ErasedCell) -> Record,
    pub write_property: fn(&ErasedCell, &str, Value) -> Result<()>,
    pub key_value: fn(&ErasedCell) -> Vec<Value>,
    pub from_record: fn(&Record) -> Result<(ErasedCell, Vec<Value>)>,
}

fn downcast<E: Entity + 'static>(cell: &ErasedCell) -> &EntityRef<E> {
    cell.downcast_ref::<EntityRef<E>>()
        .expect("identity map entry type mismatch")
}

impl EntityVtable {
    pub(crate) fn of<E: Entity + 'static>() -> Self {
        Self {
            entity: E::ENTITY_NAME,
            type_id: TypeId::of::<E>(),
            key_props: E::KEY,
            properties: E::properties,
            relationships: E::RELATIONSHIPS,
            read_record: |cell| downcast::<E>(cell).read().expect("lock poisoned").to_record(),
            write_property: |cell, name, value| {
                downcast::<E>(cell)
                    .write()
                    .expect("lock poisoned")
                    .write_property(name, value)
            },
            key_value: |cell| downcast::<E>(cell).read().expect("lock poisoned").key_value(),
            from_record: |record| {
                let entity = E::from_record(record)?;
                let key = entity.key_value();
                let arc: EntityRef<E> = Arc::new(RwLock::new(entity));
                Ok((Box::new(arc), key))
            },
        }
    }
}

struct MapEntry {
    /// Type-erased `Arc<RwLock<E>>`; clones of the same Arc are handed out.
    cell: ErasedCell,
    vtable: EntityVtable,
    key_values: Vec<Value>,
}

/// Identity map for tracked entity instances.
///
/// Keyed by [`EntityKey`] so each entity type has its own namespace and
/// transient entries coexist with keyed ones.
#[derive(Default)]
pub struct IdentityMap {
    entries: HashMap<EntityKey, MapEntry>,
}

impl IdentityMap {
    /// Create a new empty identity map.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Attach an entity under the given key.
    ///
    /// If the key is already taken by an instance with equal record state,
    /// the new instance is discarded and the existing reference returned.
    /// A differing instance under a taken key is a duplicate-identity error.
    pub fn attach<E: Entity + 'static>(
        &mut self,
        key: EntityKey,
        entity: E,
    ) -> Result<EntityRef<E>> {
        if let Some(existing) = self.entries.get(&key) {
            let tracked = (existing.vtable.read_record)(&existing.cell);
            if tracked == entity.to_record() {
                return Ok(Arc::clone(downcast::<E>(&existing.cell)));
            }
            return Err(Error::DuplicateIdentity(IdentityError {
                entity: E::ENTITY_NAME,
                key: entity.key_value(),
            }));
        }

        let key_values = entity.key_value();
        let arc: EntityRef<E> = Arc::new(RwLock::new(entity));
        self.entries.insert(
            key,
            MapEntry {
                cell: Box::new(Arc::clone(&arc)),
                vtable: EntityVtable::of::<E>(),
                key_values,
            },
        );
        Ok(arc)
    }

    /// Attach an already-erased entry, as produced by `EntityVtable::from_record`.
    pub(crate) fn attach_erased(
        &mut self,
        key: EntityKey,
        cell: ErasedCell,
        vtable: EntityVtable,
        key_values: Vec<Value>,
    ) -> Result<()> {
        if let Some(existing) = self.entries.get(&key) {
            let tracked = (existing.vtable.read_record)(&existing.cell);
            let incoming = (vtable.read_record)(&cell);
            if tracked == incoming {
                return Ok(());
            }
            return Err(Error::DuplicateIdentity(IdentityError {
                entity: vtable.entity,
                key: key_values,
            }));
        }
        self.entries.insert(
            key,
            MapEntry {
                cell,
                vtable,
                key_values,
            },
        );
        Ok(())
    }

    /// Look up an entity by its real key values.
    ///
    /// The stored key values are compared as well as the derived slot, so
    /// two distinct keys hashing to the same slot can never alias each
    /// other's entry.
    pub fn find<E: Entity + 'static>(&self, key_values: &[Value]) -> Option<EntityRef<E>> {
        let key = EntityKey::assigned::<E>(key_values);
        let entry = self.entries.get(&key)?;
        if entry.key_values.as_slice() != key_values {
            return None;
        }
        Some(Arc::clone(downcast::<E>(&entry.cell)))
    }

    /// Look up an entity by tracked key (assigned or transient).
    pub fn find_by_key<E: Entity + 'static>(&self, key: &EntityKey) -> Option<EntityRef<E>> {
        let entry = self.entries.get(key)?;
        Some(Arc::clone(downcast::<E>(&entry.cell)))
    }

    /// Whether the map tracks the given key.
    #[must_use]
    pub fn contains(&self, key: &EntityKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Remove an entry.
    ///
    /// Returns `true` if it was present.
    pub fn forget(&mut self, key: &EntityKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Move an entry to the key derived from its current key values.
    ///
    /// Called after commit assigns real keys to transient entries. Returns
    /// the new key, or `None` if the old key was not tracked.
    pub fn rekey(&mut self, old: &EntityKey) -> Option<EntityKey> {
        let mut entry = self.entries.remove(old)?;
        entry.key_values = (entry.vtable.key_value)(&entry.cell);
        let new = EntityKey {
            type_id: entry.vtable.type_id,
            slot: KeySlot::Assigned(hash_key_values(&entry.key_values)),
        };
        self.entries.insert(new, entry);
        Some(new)
    }

    /// Read the current scalar state of an entry.
    pub fn read_record(&self, key: &EntityKey) -> Option<Record> {
        let entry = self.entries.get(key)?;
        Some((entry.vtable.read_record)(&entry.cell))
    }

    /// Write one scalar property of an entry.
    pub fn write_property(&self, key: &EntityKey, name: &str, value: Value) -> Result<()> {
        let entry = self
            .entries
            .get(key)
            .ok_or_else(|| Error::Custom(format!("untracked entry for property '{name}'")))?;
        (entry.vtable.write_property)(&entry.cell, name, value)
    }

    /// The current key values of an entry.
    pub fn key_values(&self, key: &EntityKey) -> Option<Vec<Value>> {
        let entry = self.entries.get(key)?;
        Some((entry.vtable.key_value)(&entry.cell))
    }

    pub(crate) fn vtable(&self, key: &EntityKey) -> Option<&EntityVtable> {
        self.entries.get(key).map(|e| &e.vtable)
    }

    /// Iterate over tracked keys.
    pub fn keys(&self) -> impl Iterator<Item = &EntityKey> {
        self.entries.keys()
    }

    /// Clear all entries.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of tracked entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
