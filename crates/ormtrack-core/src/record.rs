//! Property records exchanged with the persistence port.

use crate::value::Value;
use std::collections::HashMap;

/// An ordered set of named property values.
///
/// A `Record` is what the tracker hands to (and receives from) the
/// persistence port: the raw scalar state of one entity, without any
/// tracking metadata. Property order follows the entity's declared
/// property order; name lookup is O(1).
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    names: Vec<&'static str>,
    values: Vec<Value>,
    index: HashMap<&'static str, usize>,
}

impl Record {
    /// Build a record from (name, value) pairs.
    pub fn new(pairs: Vec<(&'static str, Value)>) -> Self {
        let mut names = Vec::with_capacity(pairs.len());
        let mut values = Vec::with_capacity(pairs.len());
        let mut index = HashMap::with_capacity(pairs.len());
        for (i, (name, value)) in pairs.into_iter().enumerate() {
            index.insert(name, i);
            names.push(name);
            values.push(value);
        }
        Self {
            names,
            values,
            index,
        }
    }

    /// Number of properties in this record.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if this record has no properties.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Get a value by property name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.index.get(name).and_then(|i| self.values.get(*i))
    }

    /// Check if a property exists.
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Replace a value by property name.
    ///
    /// Returns `true` if the property existed and was replaced.
    pub fn set(&mut self, name: &str, value: Value) -> bool {
        if let Some(i) = self.index.get(name) {
            self.values[*i] = value;
            true
        } else {
            false
        }
    }

    /// Property names in declaration order.
    pub fn names(&self) -> &[&'static str] {
        &self.names
    }

    /// Iterate over (name, value) pairs in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &Value)> {
        self.names.iter().copied().zip(self.values.iter())
    }

    /// Consume the record into (name, value) pairs.
    pub fn into_pairs(self) -> Vec<(&'static str, Value)> {
        self.names.into_iter().zip(self.values).collect()
    }

    /// Project the record down to the named properties, in the given order.
    ///
    /// Missing properties are skipped.
    pub fn project(&self, names: &[&str]) -> Vec<(&'static str, Value)> {
        names
            .iter()
            .filter_map(|n| {
                self.index
                    .get(n)
                    .map(|i| (self.names[*i], self.values[*i].clone()))
            })
            .collect()
    }
}

impl FromIterator<(&'static str, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (&'static str, Value)>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
