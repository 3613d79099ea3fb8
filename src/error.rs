//! Error types.
//!
//! Ingestion failures (`ResolveError`) and read-side data-integrity problems
//! (`IntegrityError`) are separate types: the first means the current write
//! was refused, the second means something already committed is corrupt.

use itertools::Itertools;
use thiserror::Error;

use crate::model::{EntityKind, Hierarchy, Id, Key, NodeId};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unique constraint violated on {table}")]
    UniqueViolation { table: &'static str },

    #[error("foreign key violated on {table}: {detail}")]
    ForeignKeyViolation { table: &'static str, detail: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("storage backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error, PartialEq)]
pub enum ValidationFailure {
    #[error("{kind} has no column '{field}'")]
    UnknownField { kind: EntityKind, field: String },

    #[error("{kind} has no relationship '{relation}'")]
    UnknownRelation { kind: EntityKind, relation: String },

    #[error("required field '{field}' is missing on {kind}")]
    MissingField { kind: EntityKind, field: &'static str },

    #[error("required relationship '{relation}' is unset on {kind}")]
    MissingRelation {
        kind: EntityKind,
        relation: &'static str,
    },

    #[error("{kind}.{field} expects {expected}")]
    TypeMismatch {
        kind: EntityKind,
        field: &'static str,
        expected: &'static str,
    },

    #[error("{kind}.{field} does not accept '{value}'")]
    InvalidEnum {
        kind: EntityKind,
        field: &'static str,
        value: String,
    },

    #[error("{kind} violates {constraint}: {message}")]
    Check {
        kind: EntityKind,
        constraint: &'static str,
        message: String,
    },

    #[error("{kind}.{relation} must point at {expected}, got {actual}")]
    WrongTargetKind {
        kind: EntityKind,
        relation: String,
        expected: EntityKind,
        actual: EntityKind,
    },

    #[error("{kind}.{field} disagrees with the target of relationship '{relation}'")]
    ConflictingReference {
        kind: EntityKind,
        field: &'static str,
        relation: &'static str,
    },

    #[error("{kind} is not part of any hierarchy")]
    NotHierarchical { kind: EntityKind },

    #[error("{hierarchy} edge from {id} to itself")]
    SelfLoop { hierarchy: Hierarchy, id: Id },

    #[error("instance {id} cannot be equivalent to itself")]
    SelfEquivalence { id: Id },

    #[error("candidate {node} is not part of this graph")]
    UnknownNode { node: NodeId },
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("{kind} {key} does not exist")]
    NotFound { kind: EntityKind, key: Key },

    #[error("cyclic dependency: {}", chain.join(" -> "))]
    CyclicDependency { chain: Vec<String> },

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationFailure),

    #[error("{kind} kept conflicting with concurrent inserts after {attempts} attempts")]
    ConstraintConflict { kind: EntityKind, attempts: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ResolveError {
    pub fn is_validation(&self) -> bool {
        matches!(self, ResolveError::Validation(_))
    }

    pub fn is_cycle(&self) -> bool {
        matches!(self, ResolveError::CyclicDependency { .. })
    }
}

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("cycle in {hierarchy}: {}", display_chain(chain))]
    Cycle { hierarchy: Hierarchy, chain: Vec<Id> },

    #[error(transparent)]
    Store(#[from] StoreError),
}

fn display_chain(chain: &[Id]) -> String {
    chain.iter().join(" -> ")
}
