//! Error types for tracker operations.

use crate::value::Value;
use std::fmt;

/// The primary error type for all tracker operations.
#[derive(Debug)]
pub enum Error {
    /// A second instance with the same identity was attached
    DuplicateIdentity(IdentityError),
    /// Unique key constraint violated at the store
    UniqueConstraint(ConstraintError),
    /// Foreign key constraint violated at the store
    ForeignKeyConstraint(ConstraintError),
    /// Optimistic concurrency check failed during commit
    Conflict(ConcurrencyConflict),
    /// Entity not found in the store
    NotFound(IdentityError),
    /// Delete was rejected because dependents remain.
    ///
    /// The same class of refusal as [`Error::ForeignKeyConstraint`], split
    /// out so callers can tell a restricted delete from a bad reference
    /// write.
    RestrictViolation(ConstraintError),
    /// Transaction errors
    Transaction(TransactionError),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

/// Identifies one tracked entity by type and key.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityError {
    pub entity: &'static str,
    pub key: Vec<Value>,
}

#[derive(Debug)]
pub struct ConstraintError {
    pub entity: &'static str,
    pub constraint: String,
    pub message: String,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy)]
pub enum TransactionErrorKind {
    /// Already committed
    AlreadyCommitted,
    /// Already rolled back
    AlreadyRolledBack,
    /// Store rejected the transaction
    Aborted,
}

/// Details of a failed optimistic concurrency check.
///
/// Carries both sides of the disagreement so callers can inspect, merge,
/// and resubmit: the values this session expected (its originals) and the
/// authoritative values currently in the store.
#[derive(Debug)]
pub struct ConcurrencyConflict {
    /// Entity set the conflicting row belongs to
    pub entity: &'static str,
    /// Primary key of the conflicting row
    pub key: Vec<Value>,
    /// The kind of disagreement
    pub kind: ConflictKind,
    /// Original values this session based its update on
    pub expected: Vec<(&'static str, Value)>,
    /// Values currently in the store, `None` when the row is gone
    pub found: Option<Vec<(&'static str, Value)>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// Another writer changed the row after this session read it
    ValueMismatch,
    /// Another writer deleted the row after this session read it
    DeletedByAnotherWriter,
}

impl ConcurrencyConflict {
    /// Properties whose stored value differs from the expected original.
    #[must_use]
    pub fn disputed_properties(&self) -> Vec<&'static str> {
        let Some(found) = &self.found else {
            return self.expected.iter().map(|(n, _)| *n).collect();
        };
        self.expected
            .iter()
            .filter(|(name, expected)| {
                found
                    .iter()
                    .find(|(n, _)| n == name)
                    .is_none_or(|(_, actual)| actual != expected)
            })
            .map(|(n, _)| *n)
            .collect()
    }

    /// The authoritative store value for one property, if the row survives.
    #[must_use]
    pub fn found_value(&self, name: &str) -> Option<&Value> {
        self.found
            .as_ref()?
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v)
    }
}

impl Error {
    /// Is this a concurrency conflict the caller can resolve and retry?
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    /// Is this a store-side constraint violation?
    #[must_use]
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            Error::UniqueConstraint(_)
                | Error::ForeignKeyConstraint(_)
                | Error::RestrictViolation(_)
        )
    }

    /// Access the conflict payload, if this is a conflict.
    #[must_use]
    pub fn as_conflict(&self) -> Option<&ConcurrencyConflict> {
        match self {
            Error::Conflict(c) => Some(c),
            _ => None,
        }
    }
}

fn fmt_key(key: &[Value], f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "[")?;
    for (i, v) in key.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{v}")?;
    }
    write!(f, "]")
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::DuplicateIdentity(e) => {
                write!(f, "duplicate identity for '{}' key ", e.entity)?;
                fmt_key(&e.key, f)
            }
            Error::UniqueConstraint(e) => {
                write!(f, "unique constraint '{}' violated: {}", e.constraint, e.message)
            }
            Error::ForeignKeyConstraint(e) => {
                write!(
                    f,
                    "foreign key constraint '{}' violated: {}",
                    e.constraint, e.message
                )
            }
            Error::Conflict(c) => write!(f, "{c}"),
            Error::NotFound(e) => {
                write!(f, "'{}' not found for key ", e.entity)?;
                fmt_key(&e.key, f)
            }
            Error::RestrictViolation(e) => {
                write!(
                    f,
                    "delete restricted by '{}': {}",
                    e.constraint, e.message
                )
            }
            Error::Transaction(e) => write!(f, "transaction error: {}", e.message),
            Error::Cancelled => write!(f, "operation cancelled"),
            Error::Serde(msg) => write!(f, "serialization error: {msg}"),
            Error::Custom(msg) => write!(f, "{msg}"),
        }
    }
}

impl fmt::Display for ConcurrencyConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ConflictKind::ValueMismatch => {
                write!(
                    f,
                    "concurrency conflict on '{}' key ",
                    self.entity
                )?;
                fmt_key(&self.key, f)?;
                let disputed = self.disputed_properties();
                write!(f, ": store values differ on {disputed:?}")
            }
            ConflictKind::DeletedByAnotherWriter => {
                write!(
                    f,
                    "concurrency conflict on '{}' key ",
                    self.entity
                )?;
                fmt_key(&self.key, f)?;
                write!(f, ": row was deleted by another writer")
            }
        }
    }
}

impl fmt::Display for ConstraintError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Error {}

impl From<ConcurrencyConflict> for Error {
    fn from(conflict: ConcurrencyConflict) -> Self {
        Error::Conflict(conflict)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for tracker operations.
pub type Result<T> = std::result::Result<T, Error>;
