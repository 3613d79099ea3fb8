//! Get-or-create of single rows and whole candidate graphs.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::ResolverConfig;
use crate::error::{ResolveError, StoreError, ValidationFailure};
use crate::logic::constraint_index::ConstraintIndex;
use crate::logic::traverse::post_order;
use crate::logic::validate::{normalise, prepare};
use crate::model::{Candidate, CandidateGraph, EntityId, EntityKind, Key, NodeId, Row};
use crate::store::{abandon, EntityStore, EntityTx};

/// Outcome of [`EntityGraphResolver::resolve_graph`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedGraph {
    pub root: EntityId,
    /// Identifier of every candidate reachable from the root.
    pub nodes: BTreeMap<NodeId, EntityId>,
    /// Rows inserted by this call, in insertion order.
    pub created: Vec<EntityId>,
}

impl ResolvedGraph {
    pub fn get(&self, node: NodeId) -> Option<&EntityId> {
        self.nodes.get(&node)
    }
}

pub struct EntityGraphResolver<S: ?Sized> {
    store: Arc<S>,
    conflict_retries: u32,
}

impl<S> EntityGraphResolver<S>
where
    S: EntityStore + ?Sized,
{
    pub fn new(store: Arc<S>, config: &ResolverConfig) -> Self {
        Self {
            store,
            conflict_retries: config.conflict_retries,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Return the row of `kind` matching `row` on a unique constraint set,
    /// inserting it if there is none. An existing row is returned as is,
    /// even when its other columns differ from `row`.
    pub async fn get_or_create(
        &self,
        kind: EntityKind,
        mut row: Row,
    ) -> Result<EntityId, ResolveError> {
        prepare(kind, &mut row)?;
        let mut tx = self.store.begin().await?;
        let outcome = match check_references(tx.as_mut(), kind, &row).await {
            Ok(()) => self.get_or_create_in(tx.as_mut(), kind, &row).await,
            Err(err) => Err(err),
        };
        match outcome {
            Ok((id, _)) => {
                tx.commit().await?;
                Ok(id)
            }
            Err(err) => {
                warn!("rolling back get_or_create on {}: {}", kind, err);
                Err(abandon(tx, err).await)
            }
        }
    }

    /// Resolve `root` and every candidate it reaches, dependencies first, in
    /// a single transaction.
    ///
    /// Relationships are followed in catalog declaration order, then hierarchy
    /// parents in the order they were added, so identical graphs always
    /// produce identical writes.
    pub async fn resolve_graph(
        &self,
        graph: &CandidateGraph,
        root: NodeId,
    ) -> Result<ResolvedGraph, ResolveError> {
        if graph.get(root).is_none() {
            return Err(ValidationFailure::UnknownNode { node: root }.into());
        }

        let order = post_order([root], |node| dependencies(graph, *node)).map_err(|cycle| {
            ResolveError::CyclicDependency {
                chain: cycle.chain.iter().map(|n| describe(graph, *n)).collect(),
            }
        })?;

        let mut tx = self.store.begin().await?;
        match self.resolve_in(tx.as_mut(), graph, &order).await {
            Ok((nodes, created)) => {
                tx.commit().await?;
                let root = nodes
                    .get(&root)
                    .cloned()
                    .ok_or(ValidationFailure::UnknownNode { node: root })?;
                info!(
                    "resolved {} candidates under {}, {} created",
                    nodes.len(),
                    root,
                    created.len()
                );
                Ok(ResolvedGraph { root, nodes, created })
            }
            Err(err) => {
                warn!("rolling back graph resolution of {}: {}", describe(graph, root), err);
                Err(abandon(tx, err).await)
            }
        }
    }

    async fn resolve_in(
        &self,
        tx: &mut dyn EntityTx,
        graph: &CandidateGraph,
        order: &[NodeId],
    ) -> Result<(BTreeMap<NodeId, EntityId>, Vec<EntityId>), ResolveError> {
        let mut resolved: BTreeMap<NodeId, EntityId> = BTreeMap::new();
        let mut created = Vec::new();

        for node in order {
            let candidate = graph
                .get(*node)
                .ok_or(ValidationFailure::UnknownNode { node: *node })?;
            let mut row = bind_links(candidate, &resolved)?;
            prepare(candidate.kind, &mut row)?;
            check_references(tx, candidate.kind, &row).await?;

            let (id, was_created) = self.get_or_create_in(tx, candidate.kind, &row).await?;
            if was_created {
                created.push(id.clone());
            }

            for parent in &candidate.parents {
                let parent_id = resolved
                    .get(parent)
                    .ok_or(ValidationFailure::UnknownNode { node: *parent })?;
                add_edge(tx, &id, parent_id).await?;
            }

            resolved.insert(*node, id);
        }

        Ok((resolved, created))
    }

    /// Find-then-insert inside an open transaction. A unique violation on
    /// insert means a concurrent writer got there first; the lookup is
    /// retried so the caller gets that writer's row.
    async fn get_or_create_in(
        &self,
        tx: &mut dyn EntityTx,
        kind: EntityKind,
        row: &Row,
    ) -> Result<(EntityId, bool), ResolveError> {
        let mut attempts = 0;
        loop {
            if let Some(id) = ConstraintIndex::find(tx, kind, row).await? {
                return Ok((id, false));
            }
            match tx.insert(kind, row).await {
                Ok(key) => {
                    let id = EntityId::new(kind, key);
                    debug!("created {}", id);
                    return Ok((id, true));
                }
                Err(StoreError::UniqueViolation { table }) => {
                    attempts += 1;
                    if attempts > self.conflict_retries {
                        return Err(ResolveError::ConstraintConflict { kind, attempts });
                    }
                    info!("insert into {} raced with another writer, looking up again", table);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// Candidates `node` depends on: linked targets in relation declaration
/// order, then hierarchy parents.
fn dependencies(graph: &CandidateGraph, node: NodeId) -> Vec<NodeId> {
    let Some(candidate) = graph.get(node) else {
        return Vec::new();
    };
    let relations = candidate.kind.spec().relations;
    let mut deps: Vec<NodeId> = relations
        .iter()
        .filter_map(|relation| candidate.linked(relation.name))
        .collect();
    // links under unknown names are still walked so the failure is reported
    // against the candidate that carries them
    deps.extend(
        candidate
            .links
            .iter()
            .filter(|(name, _)| relations.iter().all(|r| r.name != name.as_str()))
            .map(|(_, target)| *target),
    );
    deps.extend(candidate.parents.iter().copied());
    deps
}

fn describe(graph: &CandidateGraph, node: NodeId) -> String {
    match graph.get(node) {
        Some(candidate) => format!("{}{}", candidate.kind, node),
        None => node.to_string(),
    }
}

/// Candidate fields plus the key columns of every resolved link. Fields are
/// normalised first so that a column given as `N:dataset:<uuid>` agrees with
/// a link to that same object.
fn bind_links(
    candidate: &Candidate,
    resolved: &BTreeMap<NodeId, EntityId>,
) -> Result<Row, ValidationFailure> {
    let kind = candidate.kind;
    let spec = kind.spec();
    let mut row = candidate.fields.clone();
    normalise(kind, &mut row)?;

    for (name, target) in &candidate.links {
        let relation = spec.relation(name).ok_or_else(|| ValidationFailure::UnknownRelation {
            kind,
            relation: name.clone(),
        })?;
        let target_id = resolved
            .get(target)
            .ok_or(ValidationFailure::UnknownNode { node: *target })?;
        if target_id.kind != relation.target {
            return Err(ValidationFailure::WrongTargetKind {
                kind,
                relation: name.clone(),
                expected: relation.target,
                actual: target_id.kind,
            });
        }
        for (field, value) in relation.columns_for(&target_id.key) {
            match row.get(field) {
                Some(existing) if *existing != value => {
                    return Err(ValidationFailure::ConflictingReference {
                        kind,
                        field,
                        relation: relation.name,
                    });
                }
                _ => {
                    row.insert(field.to_string(), value);
                }
            }
        }
    }

    Ok(row)
}

/// Every relationship whose columns are all set must point at an existing row.
async fn check_references(
    tx: &mut dyn EntityTx,
    kind: EntityKind,
    row: &Row,
) -> Result<(), ResolveError> {
    for relation in kind.spec().relations {
        let Some(key) = relation.target_key(row) else {
            continue;
        };
        if !tx.exists(relation.target, &key).await? {
            return Err(ResolveError::NotFound {
                kind: relation.target,
                key,
            });
        }
    }
    Ok(())
}

async fn add_edge(
    tx: &mut dyn EntityTx,
    child: &EntityId,
    parent: &EntityId,
) -> Result<(), ResolveError> {
    let kind = child.kind;
    let hierarchy = kind
        .spec()
        .hierarchy
        .ok_or(ValidationFailure::NotHierarchical { kind })?;
    if parent.kind != kind {
        return Err(ValidationFailure::WrongTargetKind {
            kind,
            relation: "parent".to_string(),
            expected: kind,
            actual: parent.kind,
        }
        .into());
    }
    let (Key::Serial(child_id), Key::Serial(parent_id)) = (&child.key, &parent.key) else {
        return Err(ValidationFailure::NotHierarchical { kind }.into());
    };
    if child_id == parent_id {
        return Err(ValidationFailure::SelfLoop {
            hierarchy,
            id: *child_id,
        }
        .into());
    }
    if tx.insert_edge(hierarchy, *child_id, *parent_id).await? {
        debug!("added {} edge {} -> {}", hierarchy, child_id, parent_id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Candidate, Scalar};
    use crate::store::{MemoryStore, StoreResult};
    use parking_lot::Mutex;

    fn resolver(store: Arc<MemoryStore>) -> EntityGraphResolver<MemoryStore> {
        EntityGraphResolver::new(store, &ResolverConfig::default())
    }

    fn aspect_row(label: &str) -> Row {
        Candidate::aspect(label, &format!("http://example.org/{}", label)).fields
    }

    fn dataset_row() -> Row {
        let id = uuid::Uuid::parse_str("55c5b69c-a5b8-4881-a105-e4048af26fa5").unwrap();
        Candidate::dataset(id).fields
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let resolver = resolver(store.clone());

        let first = resolver
            .get_or_create(EntityKind::Aspect, aspect_row("length"))
            .await
            .unwrap();
        let second = resolver
            .get_or_create(EntityKind::Aspect, aspect_row("length"))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(store.count(EntityKind::Aspect).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_existing_row_wins_over_differing_candidate() {
        let store = Arc::new(MemoryStore::new());
        let resolver = resolver(store.clone());

        let first = resolver
            .get_or_create(EntityKind::Aspect, aspect_row("length"))
            .await
            .unwrap();
        let mut same_label = aspect_row("length");
        same_label.insert("iri".into(), Scalar::from("http://other.org/length"));
        same_label.insert("description".into(), Scalar::from("ignored"));
        let second = resolver.get_or_create(EntityKind::Aspect, same_label).await.unwrap();

        assert_eq!(first, second);
        let stored = store.get(EntityKind::Aspect, &first.key).await.unwrap().unwrap();
        assert_eq!(stored.get("iri"), Some(&Scalar::from("http://example.org/length")));
        assert!(!stored.contains_key("description"));
    }

    #[tokio::test]
    async fn test_missing_direct_reference_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let resolver = resolver(store.clone());

        let row = Candidate::new(EntityKind::DescriptorQuant)
            .with("label", "length in mm")
            .with("unit", 99i64)
            .fields;
        let err = resolver.get_or_create(EntityKind::DescriptorQuant, row).await.unwrap_err();
        assert!(matches!(err, ResolveError::NotFound { kind: EntityKind::Unit, .. }));
        assert_eq!(store.count(EntityKind::DescriptorQuant).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_link_conflicting_with_field_is_refused() {
        let store = Arc::new(MemoryStore::new());
        let resolver = resolver(store.clone());
        let unit = resolver
            .get_or_create(EntityKind::Unit, Candidate::unit("um", "http://example.org/um").fields)
            .await
            .unwrap();

        let mut graph = CandidateGraph::new();
        let mm = graph.add(Candidate::unit("mm", "http://example.org/mm"));
        let quant = graph.add(
            Candidate::new(EntityKind::DescriptorQuant)
                .with("label", "length in mm")
                .with("unit", unit.serial().unwrap())
                .link("unit", mm),
        );

        let err = resolver.resolve_graph(&graph, quant).await.unwrap_err();
        assert!(matches!(
            err,
            ResolveError::Validation(ValidationFailure::ConflictingReference { field: "unit", .. })
        ));
        assert_eq!(store.count(EntityKind::Unit).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_link_to_wrong_kind_is_refused() {
        let store = Arc::new(MemoryStore::new());
        let resolver = resolver(store.clone());

        let mut graph = CandidateGraph::new();
        let aspect = graph.add(Candidate::aspect("length", "http://example.org/length"));
        let quant = graph.add(
            Candidate::new(EntityKind::DescriptorQuant)
                .with("label", "length in mm")
                .link("unit", aspect),
        );

        let err = resolver.resolve_graph(&graph, quant).await.unwrap_err();
        assert!(matches!(
            err,
            ResolveError::Validation(ValidationFailure::WrongTargetKind {
                expected: EntityKind::Unit,
                ..
            })
        ));
        assert_eq!(store.count(EntityKind::Aspect).await.unwrap(), 0);
    }

    /// Transaction whose first lookup misses, as if a concurrent writer
    /// committed between the lookup and the insert. Objects have a single
    /// unique set, so one missed lookup is one missed `ConstraintIndex::find`.
    struct BlindTx {
        inner: Box<dyn EntityTx>,
        blind: Arc<Mutex<bool>>,
        broken_rollback: bool,
    }

    #[async_trait::async_trait]
    impl EntityTx for BlindTx {
        async fn find(
            &mut self,
            kind: EntityKind,
            columns: &[&'static str],
            row: &Row,
        ) -> StoreResult<Option<Key>> {
            if std::mem::replace(&mut *self.blind.lock(), false) {
                return Ok(None);
            }
            self.inner.find(kind, columns, row).await
        }

        async fn exists(&mut self, kind: EntityKind, key: &Key) -> StoreResult<bool> {
            self.inner.exists(kind, key).await
        }

        async fn insert(&mut self, kind: EntityKind, row: &Row) -> StoreResult<Key> {
            self.inner.insert(kind, row).await
        }

        async fn insert_edge(
            &mut self,
            hierarchy: crate::model::Hierarchy,
            child: i64,
            parent: i64,
        ) -> StoreResult<bool> {
            self.inner.insert_edge(hierarchy, child, parent).await
        }

        async fn insert_equivalence(&mut self, left: i64, right: i64) -> StoreResult<bool> {
            self.inner.insert_equivalence(left, right).await
        }

        async fn commit(self: Box<Self>) -> StoreResult<()> {
            self.inner.commit().await
        }

        async fn rollback(self: Box<Self>) -> StoreResult<()> {
            self.inner.rollback().await?;
            if self.broken_rollback {
                return Err(StoreError::Backend("connection reset".to_string()));
            }
            Ok(())
        }
    }

    struct RacingStore {
        inner: MemoryStore,
        blind: Arc<Mutex<bool>>,
        broken_rollback: bool,
    }

    #[async_trait::async_trait]
    impl EntityStore for RacingStore {
        async fn begin(&self) -> StoreResult<Box<dyn EntityTx>> {
            Ok(Box::new(BlindTx {
                inner: self.inner.begin().await?,
                blind: self.blind.clone(),
                broken_rollback: self.broken_rollback,
            }))
        }

        async fn count(&self, kind: EntityKind) -> StoreResult<u64> {
            self.inner.count(kind).await
        }

        async fn exists(&self, kind: EntityKind, key: &Key) -> StoreResult<bool> {
            EntityStore::exists(&self.inner, kind, key).await
        }

        async fn get(&self, kind: EntityKind, key: &Key) -> StoreResult<Option<Row>> {
            self.inner.get(kind, key).await
        }
    }

    #[tokio::test]
    async fn test_lost_insert_race_returns_existing_row() {
        let inner = MemoryStore::new();
        let plain = EntityGraphResolver::new(Arc::new(inner.clone()), &ResolverConfig::default());
        let existing = plain.get_or_create(EntityKind::Object, dataset_row()).await.unwrap();

        let blind = Arc::new(Mutex::new(true));
        let racing = Arc::new(RacingStore {
            inner: inner.clone(),
            blind: blind.clone(),
            broken_rollback: false,
        });
        let resolver = EntityGraphResolver::new(racing, &ResolverConfig::default());
        let id = resolver.get_or_create(EntityKind::Object, dataset_row()).await.unwrap();

        assert_eq!(id, existing);
        assert!(!*blind.lock());
        assert_eq!(inner.count(EntityKind::Object).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_conflict() {
        let inner = MemoryStore::new();
        let plain = EntityGraphResolver::new(Arc::new(inner.clone()), &ResolverConfig::default());
        plain.get_or_create(EntityKind::Object, dataset_row()).await.unwrap();

        let racing = Arc::new(RacingStore {
            inner: inner.clone(),
            blind: Arc::new(Mutex::new(true)),
            broken_rollback: false,
        });
        let resolver = EntityGraphResolver::new(racing, &ResolverConfig { conflict_retries: 0 });
        let err = resolver.get_or_create(EntityKind::Object, dataset_row()).await.unwrap_err();

        assert!(matches!(err, ResolveError::ConstraintConflict { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn test_failed_rollback_keeps_the_original_error() {
        let inner = MemoryStore::new();
        let store = Arc::new(RacingStore {
            inner: inner.clone(),
            blind: Arc::new(Mutex::new(false)),
            broken_rollback: true,
        });
        let resolver = EntityGraphResolver::new(store, &ResolverConfig::default());

        let row = Candidate::new(EntityKind::DescriptorQuant)
            .with("label", "length in mm")
            .with("unit", 99i64)
            .fields;
        let err = resolver.get_or_create(EntityKind::DescriptorQuant, row).await.unwrap_err();
        assert!(matches!(err, ResolveError::NotFound { kind: EntityKind::Unit, .. }));

        let mut graph = CandidateGraph::new();
        let unit = graph.add(Candidate::unit("um", "http://example.org/um"));
        let other = graph.add(Candidate::unit("nm", "http://example.org/nm"));
        graph.add_parent(unit, other);
        let err = resolver.resolve_graph(&graph, unit).await.unwrap_err();
        assert!(matches!(
            err,
            ResolveError::Validation(ValidationFailure::NotHierarchical { kind: EntityKind::Unit })
        ));
        assert_eq!(inner.count(EntityKind::Unit).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remote_id_field_agrees_with_link_to_same_object() {
        let store = Arc::new(MemoryStore::new());
        let resolver = resolver(store.clone());
        let remote_id = "N:dataset:55c5b69c-a5b8-4881-a105-e4048af26fa5";

        let mut graph = CandidateGraph::new();
        let dataset = graph.add(
            Candidate::new(EntityKind::Object)
                .with("id", remote_id)
                .with("id_type", "dataset"),
        );
        let subject = graph.add(
            Candidate::subject("sub-1")
                .with("dataset", remote_id)
                .link("dataset", dataset),
        );
        let resolved = resolver.resolve_graph(&graph, subject).await.unwrap();

        let stored = store
            .get(EntityKind::ValueInst, &resolved.root.key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.get("dataset"), dataset_row().get("id"));

        // a different dataset in the field still conflicts with the link
        let mut graph = CandidateGraph::new();
        let dataset = graph.add(
            Candidate::new(EntityKind::Object)
                .with("id", remote_id)
                .with("id_type", "dataset"),
        );
        let subject = graph.add(
            Candidate::subject("sub-2")
                .with("dataset", "N:dataset:00000000-0000-4000-8000-000000000000")
                .link("dataset", dataset),
        );
        let err = resolver.resolve_graph(&graph, subject).await.unwrap_err();
        assert!(matches!(
            err,
            ResolveError::Validation(ValidationFailure::ConflictingReference {
                field: "dataset",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_non_finite_measurement_is_refused() {
        let store = Arc::new(MemoryStore::new());
        let resolver = resolver(store.clone());

        let row = Candidate::new(EntityKind::ValueQuant)
            .with("value", f64::NAN)
            .with("object", uuid::Uuid::new_v4())
            .with("desc_inst", 1i64)
            .with("desc_quant", 1i64)
            .with("value_blob", serde_json::json!({ "value": null }))
            .fields;
        for _ in 0..2 {
            let err = resolver
                .get_or_create(EntityKind::ValueQuant, row.clone())
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                ResolveError::Validation(ValidationFailure::TypeMismatch { field: "value", .. })
            ));
        }
        assert_eq!(store.count(EntityKind::ValueQuant).await.unwrap(), 0);
    }
}
