//! Entity trait and property metadata.
//!
//! The `Entity` trait is the contract between application structs and the
//! tracker. Entities are plain mutable value holders; all tracking state
//! lives in the session. The trait exposes a generic property-accessor
//! capability (`to_record` / `write_property`) so the tracker can read and
//! write scalar values without reflection.

use crate::error::{Error, Result};
use crate::record::Record;
use crate::relationship::RelationshipInfo;
use crate::value::Value;

/// What happens to dependent rows when their principal is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeleteBehavior {
    /// Delete dependents recursively, both tracked and stored.
    Cascade,
    /// Set the dependents' foreign key to NULL (requires a nullable FK).
    SetNull,
    /// Refuse the delete while dependents remain.
    #[default]
    Restrict,
    /// Cascade over dependents the session has loaded; untracked rows are
    /// left to the store's own constraint check.
    ClientCascade,
}

impl DeleteBehavior {
    /// Human-readable name, used in error messages and logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            DeleteBehavior::Cascade => "cascade",
            DeleteBehavior::SetNull => "set-null",
            DeleteBehavior::Restrict => "restrict",
            DeleteBehavior::ClientCascade => "client-cascade",
        }
    }
}

/// Metadata about one scalar property of an entity.
#[derive(Debug, Clone)]
pub struct PropertyInfo {
    /// Property name
    pub name: &'static str,
    /// Whether this property is part of the primary key
    pub key: bool,
    /// Whether the store assigns the value on insert
    pub auto_generated: bool,
    /// Whether NULL is a legal value
    pub nullable: bool,
    /// Foreign key target (`entity.property`), if this is an FK scalar
    pub foreign_key: Option<&'static str>,
    /// Delete behavior for the relationship this FK participates in
    pub on_delete: DeleteBehavior,
    /// Whether this property participates in optimistic concurrency checks.
    ///
    /// When no property of an entity carries this flag, every non-key
    /// property is treated as concurrency-relevant.
    pub concurrency_token: bool,
}

impl PropertyInfo {
    /// Create property metadata with defaults.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            key: false,
            auto_generated: false,
            nullable: false,
            foreign_key: None,
            on_delete: DeleteBehavior::Restrict,
            concurrency_token: false,
        }
    }

    /// Mark this property as part of the primary key.
    pub const fn key(mut self, value: bool) -> Self {
        self.key = value;
        self
    }

    /// Mark this property as store-assigned on insert.
    pub const fn auto_generated(mut self, value: bool) -> Self {
        self.auto_generated = value;
        self
    }

    /// Set nullable flag.
    pub const fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    /// Declare this property as a foreign key (`entity.property`).
    pub const fn foreign_key(mut self, target: &'static str) -> Self {
        self.foreign_key = Some(target);
        self
    }

    /// Set the delete behavior for this foreign key.
    pub const fn on_delete(mut self, behavior: DeleteBehavior) -> Self {
        self.on_delete = behavior;
        self
    }

    /// Mark this property as a concurrency token.
    pub const fn concurrency_token(mut self, value: bool) -> Self {
        self.concurrency_token = value;
        self
    }

    /// The entity name part of the foreign key target.
    #[must_use]
    pub fn principal_entity(&self) -> Option<&'static str> {
        self.foreign_key.and_then(|fk| fk.split('.').next())
    }
}

/// Trait for application types the session can track.
///
/// # Example
///
/// ```ignore
/// struct Employee {
///     id: Option<i64>,
///     name: String,
///     salary: i64,
/// }
///
/// impl Entity for Employee {
///     const ENTITY_NAME: &'static str = "employees";
///     const KEY: &'static [&'static str] = &["id"];
///     // ...
/// }
/// ```
pub trait Entity: Sized + Send + Sync {
    /// The entity set name in the store.
    const ENTITY_NAME: &'static str;

    /// The primary key property name(s).
    const KEY: &'static [&'static str];

    /// Relationship metadata for this entity type.
    ///
    /// Entities with no navigations can rely on the default empty slice.
    const RELATIONSHIPS: &'static [RelationshipInfo] = &[];

    /// Property metadata in declaration order.
    fn properties() -> &'static [PropertyInfo];

    /// Read the current scalar state as a record.
    fn to_record(&self) -> Record;

    /// Construct an instance from a record returned by the store.
    fn from_record(record: &Record) -> Result<Self>;

    /// Write a single scalar property.
    ///
    /// This is the write half of the property-accessor capability; the
    /// tracker uses it for key assignment after insert, foreign-key fixup,
    /// and refresh from authoritative values.
    fn write_property(&mut self, name: &str, value: Value) -> Result<()>;

    /// The current primary key value(s), in `KEY` order.
    fn key_value(&self) -> Vec<Value>;

    /// Whether this instance has no store-assigned key yet.
    fn is_new(&self) -> bool;
}

/// Look up a required value in a record, with a uniform error.
///
/// Convenience for `from_record` implementations.
pub fn require_value<'r>(record: &'r Record, name: &str) -> Result<&'r Value> {
    record.get(name).ok_or_else(|| Error::Custom(format!(
        "record is missing property '{name}'"
    )))
}
