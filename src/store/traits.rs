use log::warn;
use std::fmt::Display;

use crate::error::StoreError;
use crate::model::{EntityKind, Hierarchy, Id, Key, Row};

pub type StoreResult<T> = Result<T, StoreError>;

/// Entity tables.
#[async_trait::async_trait]
pub trait EntityStore: Send + Sync {
    /// Open a write transaction. Nothing written through it is visible to
    /// other readers until `commit`.
    async fn begin(&self) -> StoreResult<Box<dyn EntityTx>>;

    async fn count(&self, kind: EntityKind) -> StoreResult<u64>;

    async fn exists(&self, kind: EntityKind, key: &Key) -> StoreResult<bool>;

    /// Fetch a committed row by primary key.
    async fn get(&self, kind: EntityKind, key: &Key) -> StoreResult<Option<Row>>;
}

/// Parent edge tables of the aspect, class and instance hierarchies.
#[async_trait::async_trait]
pub trait HierarchyStore: Send + Sync {
    async fn parents(&self, hierarchy: Hierarchy, id: Id) -> StoreResult<Vec<Id>>;

    async fn children(&self, hierarchy: Hierarchy, id: Id) -> StoreResult<Vec<Id>>;

    /// Every `(child, parent)` edge of one hierarchy, ordered.
    async fn edges(&self, hierarchy: Hierarchy) -> StoreResult<Vec<(Id, Id)>>;
}

/// Instance equivalence pairs.
#[async_trait::async_trait]
pub trait EquivalenceStore: Send + Sync {
    /// Every stored pair, normalised so that `left < right`, ordered.
    async fn pairs(&self) -> StoreResult<Vec<(Id, Id)>>;
}

/// Combined store trait
pub trait Store: EntityStore + HierarchyStore + EquivalenceStore {}

impl<T> Store for T where T: EntityStore + HierarchyStore + EquivalenceStore {}

/// A write transaction. Dropping it without `commit` discards its writes.
#[async_trait::async_trait]
pub trait EntityTx: Send {
    /// First row of `kind` whose columns `columns` equal the values in `row`.
    /// A column missing from `row` matches NULL.
    async fn find(
        &mut self,
        kind: EntityKind,
        columns: &[&'static str],
        row: &Row,
    ) -> StoreResult<Option<Key>>;

    async fn exists(&mut self, kind: EntityKind, key: &Key) -> StoreResult<bool>;

    /// Insert a validated row. Fails with `UniqueViolation` when any unique
    /// set collides with an existing row, without aborting the transaction.
    async fn insert(&mut self, kind: EntityKind, row: &Row) -> StoreResult<Key>;

    /// Append a parent edge. Returns false if it was already present.
    async fn insert_edge(
        &mut self,
        hierarchy: Hierarchy,
        child: Id,
        parent: Id,
    ) -> StoreResult<bool>;

    /// Append a normalised equivalence pair. Returns false if already present.
    async fn insert_equivalence(&mut self, left: Id, right: Id) -> StoreResult<bool>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}

/// Roll `tx` back after `err` and hand `err` back. A failing rollback is
/// logged; the failure that caused it stays the one reported.
pub async fn abandon<E: Display>(tx: Box<dyn EntityTx>, err: E) -> E {
    if let Err(rollback) = tx.rollback().await {
        warn!("rollback after '{}' failed: {}", err, rollback);
    }
    err
}
