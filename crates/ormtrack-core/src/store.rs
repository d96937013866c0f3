//! Persistence port traits.
//!
//! This module defines the abstraction the session commits through:
//!
//! - [`Store`] - read access and transaction creation
//! - [`StoreTransaction`] - write operations with optimistic concurrency
//!
//! All operations integrate with asupersync's structured concurrency via `Cx`
//! for proper cancellation handling. The port speaks [`Record`]s and raw
//! key values; it never sees tracked entries or session state.
//!
//! Optimistic concurrency is built into the write surface: `update` and
//! `delete` take the caller's original values and must refuse to touch a
//! row whose current values disagree, reporting zero affected rows.

use crate::error::Error;
use crate::record::Record;
use crate::value::Value;
use asupersync::{Cx, Outcome};
use std::future::Future;

/// A store the session can read from and commit into.
///
/// Implementations must be `Send + Sync` for use across async boundaries.
///
/// # Example
///
/// ```rust,ignore
/// let found = store.fetch_by_key(&cx, "employees", &[Value::BigInt(1)]).await?;
///
/// let mut tx = store.begin(&cx).await?;
/// tx.insert(&cx, "employees", &record).await?;
/// tx.commit(&cx).await?;
/// ```
pub trait Store: Send + Sync {
    /// The transaction type returned by this store.
    type Tx<'s>: StoreTransaction
    where
        Self: 's;

    /// Fetch one row by primary key, if present.
    fn fetch_by_key(
        &self,
        cx: &Cx,
        entity: &'static str,
        key: &[Value],
    ) -> impl Future<Output = Outcome<Option<Record>, Error>> + Send;

    /// Fetch all rows of an entity set whose named property equals `value`.
    ///
    /// This is the read the session uses to populate collection navigations
    /// and to find stored dependents during cascade planning.
    fn fetch_by_property(
        &self,
        cx: &Cx,
        entity: &'static str,
        property: &'static str,
        value: &Value,
    ) -> impl Future<Output = Outcome<Vec<Record>, Error>> + Send;

    /// Fetch the current authoritative values of one row.
    ///
    /// Used by conflict reporting to populate the `found` side of a
    /// [`ConcurrencyConflict`](crate::error::ConcurrencyConflict). Returns
    /// `None` when the row no longer exists.
    fn fetch_current_values(
        &self,
        cx: &Cx,
        entity: &'static str,
        key: &[Value],
    ) -> impl Future<Output = Outcome<Option<Record>, Error>> + Send;

    /// Begin a transaction.
    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<Self::Tx<'_>, Error>> + Send;
}

/// Write operations within one store transaction.
///
/// Writes are all-or-nothing: either `commit` makes every operation
/// durable or `rollback` (explicit, or implied by dropping the
/// transaction) discards all of them.
pub trait StoreTransaction: Send {
    /// Insert a new row.
    ///
    /// Returns the row's primary key values, with store-assigned values
    /// filled in for auto-generated key properties.
    fn insert(
        &mut self,
        cx: &Cx,
        entity: &'static str,
        record: &Record,
    ) -> impl Future<Output = Outcome<Vec<Value>, Error>> + Send;

    /// Update a row, guarded by its expected original values.
    ///
    /// `expected` holds the (property, value) pairs this writer read before
    /// modifying; the store applies `changes` only if the row still matches.
    /// Returns the number of rows affected: zero signals a concurrency miss,
    /// never an error.
    fn update(
        &mut self,
        cx: &Cx,
        entity: &'static str,
        key: &[Value],
        changes: &[(&'static str, Value)],
        expected: &[(&'static str, Value)],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;

    /// Delete a row, guarded by its expected original values.
    ///
    /// Same affected-row contract as [`update`](StoreTransaction::update).
    fn delete(
        &mut self,
        cx: &Cx,
        entity: &'static str,
        key: &[Value],
        expected: &[(&'static str, Value)],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;

    /// Insert a join entry linking two rows of a many-to-many association.
    fn link(
        &mut self,
        cx: &Cx,
        join_entity: &'static str,
        left: (&'static str, Value),
        right: (&'static str, Value),
    ) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Remove a join entry of a many-to-many association.
    fn unlink(
        &mut self,
        cx: &Cx,
        join_entity: &'static str,
        left: (&'static str, Value),
        right: (&'static str, Value),
    ) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Commit the transaction, making all changes durable.
    fn commit(self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Rollback the transaction, discarding all changes.
    fn rollback(self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;
}
