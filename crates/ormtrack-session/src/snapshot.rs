//! Snapshot-based change detection.
//!
//! The snapshot store keeps the original record of every tracked entry,
//! captured when the entry enters the session or after a successful
//! commit. Dirty detection and changed-property queries compare the
//! current record against this baseline, property by property, so nothing
//! needs to observe writes as they happen.

use crate::identity_map::EntityKey;
use ormtrack_core::{Record, Value};
use std::collections::HashMap;
use std::time::Instant;

/// Original record of one tracked entry.
#[derive(Debug)]
pub struct Snapshot {
    record: Record,
    taken_at: Instant,
}

impl Snapshot {
    fn new(record: Record) -> Self {
        Self {
            record,
            taken_at: Instant::now(),
        }
    }

    /// The captured record.
    pub fn record(&self) -> &Record {
        &self.record
    }

    /// When this snapshot was taken.
    pub fn taken_at(&self) -> Instant {
        self.taken_at
    }
}

/// Stores original records keyed by tracked entry.
#[derive(Default)]
pub struct SnapshotStore {
    snapshots: HashMap<EntityKey, Snapshot>,
}

impl SnapshotStore {
    /// Create a new empty snapshot store.
    pub fn new() -> Self {
        Self {
            snapshots: HashMap::new(),
        }
    }

    /// Capture a baseline for an entry, replacing any previous one.
    #[tracing::instrument(level = "trace", skip(self, record))]
    pub fn capture(&mut self, key: EntityKey, record: Record) {
        tracing::trace!(properties = record.len(), "capturing snapshot");
        self.snapshots.insert(key, Snapshot::new(record));
    }

    /// The original record for an entry, if captured.
    pub fn original(&self, key: &EntityKey) -> Option<&Record> {
        self.snapshots.get(key).map(Snapshot::record)
    }

    /// Whether an entry's current record differs from its baseline.
    ///
    /// An entry with no baseline is treated as dirty.
    pub fn is_dirty(&self, key: &EntityKey, current: &Record) -> bool {
        match self.original(key) {
            Some(original) => original != current,
            None => true,
        }
    }

    /// Names of properties whose current value differs from the baseline.
    ///
    /// With no baseline, every property counts as changed.
    #[tracing::instrument(level = "debug", skip(self, current))]
    pub fn changed_properties(&self, key: &EntityKey, current: &Record) -> Vec<&'static str> {
        let Some(original) = self.original(key) else {
            return current.names().to_vec();
        };

        let changed: Vec<&'static str> = current
            .iter()
            .filter(|(name, value)| original.get(name) != Some(value))
            .map(|(name, _)| name)
            .collect();
        tracing::debug!(changed = changed.len(), "diffed against baseline");
        changed
    }

    /// Changed properties paired with their new values, for building
    /// update operations.
    pub fn changes(&self, key: &EntityKey, current: &Record) -> Vec<(&'static str, Value)> {
        let Some(original) = self.original(key) else {
            return current.clone().into_pairs();
        };

        current
            .iter()
            .filter(|(name, value)| original.get(name) != Some(value))
            .map(|(name, value)| (name, value.clone()))
            .collect()
    }

    /// Move a baseline to a new key after the entry was rekeyed.
    pub fn rekey(&mut self, old: &EntityKey, new: EntityKey) {
        if let Some(snapshot) = self.snapshots.remove(old) {
            self.snapshots.insert(new, snapshot);
        }
    }

    /// Whether a baseline exists for an entry.
    pub fn has_snapshot(&self, key: &EntityKey) -> bool {
        self.snapshots.contains_key(key)
    }

    /// Drop the baseline of one entry.
    pub fn clear(&mut self, key: &EntityKey) {
        self.snapshots.remove(key);
    }

    /// Drop every baseline.
    pub fn clear_all(&mut self) {
        self.snapshots.clear();
    }

    /// Number of captured baselines.
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// Check if there are no baselines.
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{Employee, employee};
    use ormtrack_core::Entity;

    fn make_key(id: i64) -> EntityKey {
        EntityKey::assigned::<Employee>(&[Value::BigInt(id)])
    }

    #[test]
    fn unchanged_record_is_clean() {
        let mut store = SnapshotStore::new();
        let alice = employee(Some(1), "Alice", 1000, None);
        store.capture(make_key(1), alice.to_record());

        assert!(!store.is_dirty(&make_key(1), &alice.to_record()));
        assert!(store.changed_properties(&make_key(1), &alice.to_record()).is_empty());
    }

    #[test]
    fn modified_property_is_detected() {
        let mut store = SnapshotStore::new();
        let mut alice = employee(Some(1), "Alice", 1000, None);
        store.capture(make_key(1), alice.to_record());

        alice.salary = 1100;
        assert!(store.is_dirty(&make_key(1), &alice.to_record()));
        assert_eq!(
            store.changed_properties(&make_key(1), &alice.to_record()),
            vec!["salary"]
        );
        assert_eq!(
            store.changes(&make_key(1), &alice.to_record()),
            vec![("salary", Value::BigInt(1100))]
        );
    }

    #[test]
    fn reverting_a_change_goes_clean_again() {
        let mut store = SnapshotStore::new();
        let mut alice = employee(Some(1), "Alice", 1000, None);
        store.capture(make_key(1), alice.to_record());

        alice.salary = 1100;
        assert!(store.is_dirty(&make_key(1), &alice.to_record()));

        alice.salary = 1000;
        assert!(!store.is_dirty(&make_key(1), &alice.to_record()));
    }

    #[test]
    fn missing_baseline_counts_everything_changed() {
        let store = SnapshotStore::new();
        let alice = employee(Some(1), "Alice", 1000, None);

        assert!(store.is_dirty(&make_key(1), &alice.to_record()));
        assert_eq!(
            store.changed_properties(&make_key(1), &alice.to_record()).len(),
            alice.to_record().len()
        );
    }

    #[test]
    fn recapture_sets_new_baseline() {
        let mut store = SnapshotStore::new();
        let mut alice = employee(Some(1), "Alice", 1000, None);
        store.capture(make_key(1), alice.to_record());

        alice.salary = 1100;
        store.capture(make_key(1), alice.to_record());
        assert!(!store.is_dirty(&make_key(1), &alice.to_record()));
    }

    #[test]
    fn rekey_moves_the_baseline() {
        let mut store = SnapshotStore::new();
        let alice = employee(Some(7), "Alice", 1000, None);
        let transient = EntityKey::transient::<Employee>(1);
        store.capture(transient, alice.to_record());

        store.rekey(&transient, make_key(7));
        assert!(!store.has_snapshot(&transient));
        assert!(store.has_snapshot(&make_key(7)));
    }
}
