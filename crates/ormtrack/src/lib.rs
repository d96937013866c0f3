//! ormtrack - entity change tracking with identity resolution and
//! optimistic concurrency.
//!
//! A [`Session`] observes plain entity structs and turns their mutations
//! into ordered store operations:
//!
//! - **Identity map**: one tracked instance per (type, key); repeated loads
//!   return the same shared reference and skip the store
//! - **Snapshot change detection**: entity state is recomputed from a
//!   baseline diff, never cached, so in-place reverts go back to unchanged
//! - **Relationship fixup**: foreign-key scalars and collection
//!   navigations stay consistent in both directions
//! - **Optimistic concurrency**: updates and deletes are guarded by the
//!   values this session read; a miss rolls the transaction back and hands
//!   both sides of the disagreement to the caller
//!
//! # Quick Start
//!
//! ```ignore
//! use ormtrack::prelude::*;
//!
//! async fn example(cx: &Cx, store: MemoryStore) -> Result<()> {
//!     let mut session = Session::new(store);
//!
//!     let alice = session.add(Employee::new("Alice", 1000))?;
//!     session.commit(cx).await.into_result()?;
//!
//!     alice.write().salary = 1100;
//!     assert_eq!(session.state_of(&alice.key), EntityState::Modified);
//!     session.commit(cx).await.into_result()?;
//!     Ok(())
//! }
//! ```

pub use ormtrack_core::{
    // asupersync re-exports
    Budget,
    ConcurrencyConflict,
    ConflictKind,
    ConstraintError,
    Cx,
    // Referential behavior
    DeleteBehavior,
    // Core traits and types
    Entity,
    Error,
    IdentityError,
    JoinTableInfo,
    Outcome,
    PropertyInfo,
    Record,
    RegionId,
    RelationshipInfo,
    RelationshipKind,
    Result,
    // Persistence port
    Store,
    StoreTransaction,
    TaskId,
    TransactionError,
    TransactionErrorKind,
    Value,
    require_value,
};

pub use ormtrack_session::{
    CommitResult, EntityKey, EntityRef, EntityState, IdentityMap, KeySlot, ObservationStrategy,
    Session, SessionConfig, SessionDebugInfo, SessionEventCallbacks, Snapshot, SnapshotStore,
    Tracked,
};

pub use ormtrack_memory::{MemoryStore, MemoryTransaction};

pub mod prelude {
    pub use crate::{
        CommitResult,
        ConcurrencyConflict,
        ConflictKind,
        Cx,
        DeleteBehavior,
        Entity,
        EntityKey,
        EntityState,
        Error,
        JoinTableInfo,
        MemoryStore,
        Outcome,
        PropertyInfo,
        Record,
        RelationshipInfo,
        Result,
        Session,
        SessionConfig,
        Store,
        Tracked,
        Value,
        require_value,
    };
}
