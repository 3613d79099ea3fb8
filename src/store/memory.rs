use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::StoreError;
use crate::model::{EntityKind, Hierarchy, Id, Key, KeySpec, Row, Scalar};
use crate::store::traits::{EntityStore, EntityTx, EquivalenceStore, HierarchyStore, StoreResult};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    tables: HashMap<EntityKind, BTreeMap<Key, Row>>,
    next_serial: HashMap<EntityKind, i64>,
    edges: HashMap<Hierarchy, BTreeSet<(Id, Id)>>,
    equivalences: BTreeSet<(Id, Id)>,
}

impl MemoryState {
    fn table(&self, kind: EntityKind) -> Option<&BTreeMap<Key, Row>> {
        self.tables.get(&kind)
    }

    fn contains(&self, kind: EntityKind, key: &Key) -> bool {
        self.table(kind).is_some_and(|t| t.contains_key(key))
    }

    fn find(&self, kind: EntityKind, columns: &[&'static str], row: &Row) -> Option<Key> {
        let table = self.table(kind)?;
        table
            .iter()
            .find(|(key, stored)| {
                columns
                    .iter()
                    .all(|c| column_value(kind, key, stored, c) == row.get(*c).cloned())
            })
            .map(|(key, _)| key.clone())
    }

    fn insert(&mut self, kind: EntityKind, row: &Row) -> StoreResult<Key> {
        let spec = kind.spec();

        for relation in spec.relations {
            if !relation.fields.iter().all(|f| row.contains_key(*f)) {
                continue;
            }
            let target = relation.target_key(row);
            if !target.is_some_and(|key| self.contains(relation.target, &key)) {
                return Err(StoreError::ForeignKeyViolation {
                    table: spec.table,
                    detail: format!(
                        "{} does not reference an existing {}",
                        relation.name, relation.target
                    ),
                });
            }
        }

        let table = self.tables.entry(kind).or_default();
        for set in spec.unique {
            // NULLs never collide, as in SQL
            if !set.iter().all(|c| row.contains_key(*c)) {
                continue;
            }
            if table.values().any(|stored| set.iter().all(|c| stored.get(*c) == row.get(*c))) {
                return Err(StoreError::UniqueViolation { table: spec.table });
            }
        }

        let key = match spec.key {
            KeySpec::Serial => {
                let next = self.next_serial.entry(kind).or_insert(0);
                *next += 1;
                Key::Serial(*next)
            }
            _ => spec.key_from_row(row).ok_or_else(|| {
                StoreError::Backend(format!("{} row without a complete primary key", spec.table))
            })?,
        };
        if table.contains_key(&key) {
            return Err(StoreError::UniqueViolation { table: spec.table });
        }
        table.insert(key.clone(), row.clone());
        Ok(key)
    }
}

/// Value of `column` in a stored row; serial ids live in the key.
fn column_value(kind: EntityKind, key: &Key, row: &Row, column: &str) -> Option<Scalar> {
    match (kind.spec().key, column) {
        (KeySpec::Serial, "id") => key.as_serial().map(Scalar::Int),
        _ => row.get(column).cloned(),
    }
}

/// Embedded store used by tests and tools that do not need Postgres.
///
/// Readers see the last committed state. Writers are serialised: a
/// transaction holds the writer lock until it commits or is dropped, and
/// works on its own copy of the state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
    writer: Arc<Mutex<()>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl EntityStore for MemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn EntityTx>> {
        let guard = self.writer.clone().lock_owned().await;
        let working = self.state.read().clone();
        Ok(Box::new(MemoryTx {
            _guard: guard,
            shared: self.state.clone(),
            working,
        }))
    }

    async fn count(&self, kind: EntityKind) -> StoreResult<u64> {
        Ok(self.state.read().table(kind).map_or(0, |t| t.len() as u64))
    }

    async fn exists(&self, kind: EntityKind, key: &Key) -> StoreResult<bool> {
        Ok(self.state.read().contains(kind, key))
    }

    async fn get(&self, kind: EntityKind, key: &Key) -> StoreResult<Option<Row>> {
        let state = self.state.read();
        let Some(row) = state.table(kind).and_then(|t| t.get(key)) else {
            return Ok(None);
        };
        let mut row = row.clone();
        if let Key::Serial(id) = key {
            row.insert("id".to_string(), Scalar::Int(*id));
        }
        Ok(Some(row))
    }
}

#[async_trait::async_trait]
impl HierarchyStore for MemoryStore {
    async fn parents(&self, hierarchy: Hierarchy, id: Id) -> StoreResult<Vec<Id>> {
        let state = self.state.read();
        Ok(state
            .edges
            .get(&hierarchy)
            .map(|e| e.iter().filter(|(c, _)| *c == id).map(|(_, p)| *p).collect())
            .unwrap_or_default())
    }

    async fn children(&self, hierarchy: Hierarchy, id: Id) -> StoreResult<Vec<Id>> {
        let state = self.state.read();
        Ok(state
            .edges
            .get(&hierarchy)
            .map(|e| e.iter().filter(|(_, p)| *p == id).map(|(c, _)| *c).collect())
            .unwrap_or_default())
    }

    async fn edges(&self, hierarchy: Hierarchy) -> StoreResult<Vec<(Id, Id)>> {
        let state = self.state.read();
        Ok(state
            .edges
            .get(&hierarchy)
            .map(|e| e.iter().copied().collect())
            .unwrap_or_default())
    }
}

#[async_trait::async_trait]
impl EquivalenceStore for MemoryStore {
    async fn pairs(&self) -> StoreResult<Vec<(Id, Id)>> {
        Ok(self.state.read().equivalences.iter().copied().collect())
    }
}

pub struct MemoryTx {
    _guard: OwnedMutexGuard<()>,
    shared: Arc<RwLock<MemoryState>>,
    working: MemoryState,
}

#[async_trait::async_trait]
impl EntityTx for MemoryTx {
    async fn find(
        &mut self,
        kind: EntityKind,
        columns: &[&'static str],
        row: &Row,
    ) -> StoreResult<Option<Key>> {
        Ok(self.working.find(kind, columns, row))
    }

    async fn exists(&mut self, kind: EntityKind, key: &Key) -> StoreResult<bool> {
        Ok(self.working.contains(kind, key))
    }

    async fn insert(&mut self, kind: EntityKind, row: &Row) -> StoreResult<Key> {
        self.working.insert(kind, row)
    }

    async fn insert_edge(
        &mut self,
        hierarchy: Hierarchy,
        child: Id,
        parent: Id,
    ) -> StoreResult<bool> {
        let member = hierarchy.member();
        for id in [child, parent] {
            if !self.working.contains(member, &Key::Serial(id)) {
                return Err(StoreError::ForeignKeyViolation {
                    table: hierarchy.table(),
                    detail: format!("{} {} does not exist", member, id),
                });
            }
        }
        Ok(self.working.edges.entry(hierarchy).or_default().insert((child, parent)))
    }

    async fn insert_equivalence(&mut self, left: Id, right: Id) -> StoreResult<bool> {
        for id in [left, right] {
            if !self.working.contains(EntityKind::ValueInst, &Key::Serial(id)) {
                return Err(StoreError::ForeignKeyViolation {
                    table: crate::model::EQUIVALENCE_TABLE,
                    detail: format!("{} {} does not exist", EntityKind::ValueInst, id),
                });
            }
        }
        Ok(self.working.equivalences.insert((left, right)))
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryTx { _guard, shared, working } = *self;
        *shared.write() = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aspect(label: &str) -> Row {
        let mut row = Row::new();
        row.insert("label".into(), Scalar::from(label));
        row.insert("iri".into(), Scalar::from(format!("http://example.org/{}", label)));
        row
    }

    #[tokio::test]
    async fn test_uncommitted_writes_are_invisible() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert(EntityKind::Aspect, &aspect("length")).await.unwrap();
        assert_eq!(store.count(EntityKind::Aspect).await.unwrap(), 0);
        tx.rollback().await.unwrap();
        assert_eq!(store.count(EntityKind::Aspect).await.unwrap(), 0);

        let mut tx = store.begin().await.unwrap();
        let key = tx.insert(EntityKind::Aspect, &aspect("length")).await.unwrap();
        tx.commit().await.unwrap();
        assert!(store.exists(EntityKind::Aspect, &key).await.unwrap());
        let row = store.get(EntityKind::Aspect, &key).await.unwrap().unwrap();
        assert_eq!(row.get("id"), Some(&Scalar::Int(1)));
    }

    #[tokio::test]
    async fn test_unique_sets_and_foreign_keys_are_enforced() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert(EntityKind::Aspect, &aspect("length")).await.unwrap();

        let mut same_label = aspect("length");
        same_label.insert("iri".into(), Scalar::from("http://example.org/other"));
        let err = tx.insert(EntityKind::Aspect, &same_label).await.unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation { table: "aspects" }));

        let mut quant = Row::new();
        quant.insert("label".into(), Scalar::from("length in mm"));
        quant.insert("shape".into(), Scalar::from("scalar"));
        quant.insert("aggregation_type".into(), Scalar::from("instance"));
        quant.insert("unit".into(), Scalar::Int(42));
        let err = tx.insert(EntityKind::DescriptorQuant, &quant).await.unwrap_err();
        assert!(matches!(err, StoreError::ForeignKeyViolation { .. }));
    }

    #[tokio::test]
    async fn test_find_matches_missing_columns_as_null() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let mut row = Row::new();
        row.insert("addr_type".into(), Scalar::from("constant"));
        row.insert("value_type".into(), Scalar::from("single"));
        let key = tx.insert(EntityKind::Address, &row).await.unwrap();

        let columns = ["addr_type", "addr_field", "value_type"];
        assert_eq!(tx.find(EntityKind::Address, &columns, &row).await.unwrap(), Some(key));

        row.insert("addr_field".into(), Scalar::from("#/x"));
        assert_eq!(tx.find(EntityKind::Address, &columns, &row).await.unwrap(), None);
    }
}
