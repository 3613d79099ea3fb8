//! Transitive queries over the aspect, class and instance parent hierarchies.
//!
//! Edges are append-only and nothing keeps them acyclic at write time, so
//! every transitive query reports a cycle instead of trusting the data.
//! Queries read a snapshot of the edge table and walk it in memory; each
//! node is expanded at most once however many paths reach it.

use log::warn;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::{IntegrityError, ResolveError, ValidationFailure};
use crate::logic::traverse::{post_order, Cycle};
use crate::model::{Hierarchy, Id, Key};
use crate::store::{abandon, EntityStore, HierarchyStore};

#[derive(Debug, Default)]
struct Snapshot {
    parents: BTreeMap<Id, Vec<Id>>,
    children: BTreeMap<Id, Vec<Id>>,
}

impl Snapshot {
    fn from_edges(edges: Vec<(Id, Id)>) -> Self {
        let mut snapshot = Self::default();
        for (child, parent) in edges {
            snapshot.parents.entry(child).or_default().push(parent);
            snapshot.children.entry(parent).or_default().push(child);
        }
        snapshot
    }

    fn parents(&self, id: &Id) -> Vec<Id> {
        self.parents.get(id).cloned().unwrap_or_default()
    }

    fn children(&self, id: &Id) -> Vec<Id> {
        self.children.get(id).cloned().unwrap_or_default()
    }

    /// Every node touching an edge, ascending.
    fn nodes(&self) -> BTreeSet<Id> {
        self.parents.keys().chain(self.children.keys()).copied().collect()
    }
}

pub struct HierarchyClosure<S: ?Sized> {
    store: Arc<S>,
    hierarchy: Hierarchy,
}

impl<S> HierarchyClosure<S>
where
    S: EntityStore + HierarchyStore + ?Sized,
{
    pub fn new(store: Arc<S>, hierarchy: Hierarchy) -> Self {
        Self { store, hierarchy }
    }

    pub fn hierarchy(&self) -> Hierarchy {
        self.hierarchy
    }

    /// Direct parents.
    pub async fn parents_of(&self, id: Id) -> Result<BTreeSet<Id>, IntegrityError> {
        Ok(self.store.parents(self.hierarchy, id).await?.into_iter().collect())
    }

    /// Direct children.
    pub async fn children_of(&self, id: Id) -> Result<BTreeSet<Id>, IntegrityError> {
        Ok(self.store.children(self.hierarchy, id).await?.into_iter().collect())
    }

    /// Parents, their parents and so on, without `id` itself.
    pub async fn ancestors_of(&self, id: Id) -> Result<BTreeSet<Id>, IntegrityError> {
        let mut closed = self.closed_ancestors([id]).await?;
        closed.remove(&id);
        Ok(closed)
    }

    /// Children, their children and so on, without `id` itself.
    pub async fn descendants_of(&self, id: Id) -> Result<BTreeSet<Id>, IntegrityError> {
        let mut closed = self.closed_descendants([id]).await?;
        closed.remove(&id);
        Ok(closed)
    }

    /// `ids` together with all of their ancestors.
    pub async fn closed_ancestors<I>(&self, ids: I) -> Result<BTreeSet<Id>, IntegrityError>
    where
        I: IntoIterator<Item = Id> + Send,
    {
        let snapshot = self.snapshot().await?;
        let visited = post_order(ids, |n| snapshot.parents(n)).map_err(|c| self.cycle(c))?;
        Ok(visited.into_iter().collect())
    }

    /// `ids` together with all of their descendants, e.g. to select values
    /// whose aspect is "diameter or anything more specific".
    pub async fn closed_descendants<I>(&self, ids: I) -> Result<BTreeSet<Id>, IntegrityError>
    where
        I: IntoIterator<Item = Id> + Send,
    {
        let snapshot = self.snapshot().await?;
        let visited = post_order(ids, |n| snapshot.children(n)).map_err(|c| self.cycle(c))?;
        Ok(visited.into_iter().collect())
    }

    /// Every `(node, ancestor)` pair of the hierarchy.
    pub async fn all_ancestor_edges(&self) -> Result<BTreeSet<(Id, Id)>, IntegrityError> {
        let snapshot = self.snapshot().await?;
        // post-order along parent edges finishes every parent before its children
        let order =
            post_order(snapshot.nodes(), |n| snapshot.parents(n)).map_err(|c| self.cycle(c))?;

        let mut ancestors: BTreeMap<Id, BTreeSet<Id>> = BTreeMap::new();
        for node in order {
            let mut mine = BTreeSet::new();
            for parent in snapshot.parents(&node) {
                mine.insert(parent);
                if let Some(theirs) = ancestors.get(&parent) {
                    mine.extend(theirs.iter().copied());
                }
            }
            ancestors.insert(node, mine);
        }

        Ok(ancestors
            .into_iter()
            .flat_map(|(node, set)| set.into_iter().map(move |a| (node, a)))
            .collect())
    }

    /// Walk the whole hierarchy once and report the first cycle found.
    pub async fn verify(&self) -> Result<(), IntegrityError> {
        let snapshot = self.snapshot().await?;
        post_order(snapshot.nodes(), |n| snapshot.parents(n)).map_err(|c| self.cycle(c))?;
        Ok(())
    }

    /// Append the edge `child -> parent`. Both ends must be existing members
    /// of this hierarchy. Returns false when the edge was already recorded.
    pub async fn add_parent(&self, child: Id, parent: Id) -> Result<bool, ResolveError> {
        if child == parent {
            return Err(ValidationFailure::SelfLoop {
                hierarchy: self.hierarchy,
                id: child,
            }
            .into());
        }
        let member = self.hierarchy.member();
        for id in [child, parent] {
            let key = Key::Serial(id);
            if !self.store.exists(member, &key).await? {
                return Err(ResolveError::NotFound { kind: member, key });
            }
        }
        let mut tx = self.store.begin().await?;
        match tx.insert_edge(self.hierarchy, child, parent).await {
            Ok(added) => {
                tx.commit().await?;
                Ok(added)
            }
            Err(err) => {
                Err(abandon(tx, err).await.into())
            }
        }
    }

    async fn snapshot(&self) -> Result<Snapshot, IntegrityError> {
        Ok(Snapshot::from_edges(self.store.edges(self.hierarchy).await?))
    }

    fn cycle(&self, cycle: Cycle<Id>) -> IntegrityError {
        let err = IntegrityError::Cycle {
            hierarchy: self.hierarchy,
            chain: cycle.chain,
        };
        warn!("data integrity: {}", err);
        err
    }
}
