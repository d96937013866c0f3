//! Relationship metadata.
//!
//! Relationships are declared on the entity type as const metadata; the
//! session uses them to index navigations, run foreign-key fixup, and
//! order commit operations. Navigations themselves are key references
//! resolved through the identity map, never owned object graphs.

use crate::entity::DeleteBehavior;

/// The shape of a relationship between two entity types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationshipKind {
    /// One principal row to at most one dependent row
    OneToOne,
    /// One principal row to any number of dependent rows
    OneToMany,
    /// Association through a join entry, no FK on either side
    ManyToMany,
}

/// Join entry metadata for a many-to-many relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinTableInfo {
    /// Name of the join entity set in the store
    pub name: &'static str,
    /// Join property referencing this entity's key
    pub self_key: &'static str,
    /// Join property referencing the related entity's key
    pub related_key: &'static str,
}

/// Metadata about one relationship, declared on the principal or on
/// either many-to-many side.
#[derive(Debug, Clone, Copy)]
pub struct RelationshipInfo {
    /// Relationship name, unique within the declaring entity
    pub name: &'static str,
    /// The shape of this relationship
    pub kind: RelationshipKind,
    /// The related entity set name
    pub related_entity: &'static str,
    /// The FK property on the dependent side (`None` for many-to-many)
    pub foreign_key: Option<&'static str>,
    /// What happens to dependents when the principal is deleted
    pub on_delete: DeleteBehavior,
    /// Join entry metadata, present only for many-to-many
    pub join: Option<JoinTableInfo>,
}

impl RelationshipInfo {
    /// Declare a one-to-many relationship on the principal; `foreign_key`
    /// names the referencing property on the dependent side.
    pub const fn one_to_many(
        name: &'static str,
        related_entity: &'static str,
        foreign_key: &'static str,
    ) -> Self {
        Self {
            name,
            kind: RelationshipKind::OneToMany,
            related_entity,
            foreign_key: Some(foreign_key),
            on_delete: DeleteBehavior::Restrict,
            join: None,
        }
    }

    /// Declare a one-to-one relationship on the principal; `foreign_key`
    /// names the referencing property on the dependent side.
    pub const fn one_to_one(
        name: &'static str,
        related_entity: &'static str,
        foreign_key: &'static str,
    ) -> Self {
        Self {
            name,
            kind: RelationshipKind::OneToOne,
            related_entity,
            foreign_key: Some(foreign_key),
            on_delete: DeleteBehavior::Restrict,
            join: None,
        }
    }

    /// Declare a many-to-many relationship through a join entity.
    pub const fn many_to_many(
        name: &'static str,
        related_entity: &'static str,
        join: JoinTableInfo,
    ) -> Self {
        Self {
            name,
            kind: RelationshipKind::ManyToMany,
            related_entity,
            foreign_key: None,
            on_delete: DeleteBehavior::Restrict,
            join: Some(join),
        }
    }

    /// Set the delete behavior.
    pub const fn on_delete(mut self, behavior: DeleteBehavior) -> Self {
        self.on_delete = behavior;
        self
    }
}
