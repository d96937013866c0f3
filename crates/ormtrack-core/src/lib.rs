//! Core types and traits for ormtrack.
//!
//! This crate provides the foundational abstractions for entity change
//! tracking:
//!
//! - `Entity` trait for tracked struct mapping
//! - `PropertyInfo` / `RelationshipInfo` metadata
//! - `Store` / `StoreTransaction` persistence port
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Budget, Cx, Outcome, RegionId, TaskId};

pub mod entity;
pub mod error;
pub mod record;
pub mod relationship;
pub mod store;
pub mod value;

pub use entity::{DeleteBehavior, Entity, PropertyInfo, require_value};
pub use error::{
    ConcurrencyConflict, ConflictKind, ConstraintError, Error, IdentityError, Result,
    TransactionError, TransactionErrorKind,
};
pub use record::Record;
pub use relationship::{JoinTableInfo, RelationshipInfo, RelationshipKind};
pub use store::{Store, StoreTransaction};
pub use value::Value;
