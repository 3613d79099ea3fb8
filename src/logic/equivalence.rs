use log::debug;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::{ResolveError, StoreError, ValidationFailure};
use crate::logic::traverse::reachable;
use crate::model::{EntityKind, Id, Key};
use crate::store::{abandon, EntityStore, EquivalenceStore};

/// Equivalence classes of instances, derived from the stored pairs on every
/// query. A pair that bridges two classes merges them for all later queries.
pub struct EquivalenceMerger<S: ?Sized> {
    store: Arc<S>,
}

impl<S> EquivalenceMerger<S>
where
    S: EntityStore + EquivalenceStore + ?Sized,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Record that `a` and `b` denote the same thing and return the merged
    /// class. Recording a known pair again is a no-op.
    pub async fn add_equivalence(&self, a: Id, b: Id) -> Result<BTreeSet<Id>, ResolveError> {
        if a == b {
            return Err(ValidationFailure::SelfEquivalence { id: a }.into());
        }
        for id in [a, b] {
            let key = Key::Serial(id);
            if !self.store.exists(EntityKind::ValueInst, &key).await? {
                return Err(ResolveError::NotFound {
                    kind: EntityKind::ValueInst,
                    key,
                });
            }
        }

        let (left, right) = (a.min(b), a.max(b));
        let mut tx = self.store.begin().await?;
        match tx.insert_equivalence(left, right).await {
            Ok(added) => {
                tx.commit().await?;
                if added {
                    debug!("instances {} and {} are now equivalent", left, right);
                }
            }
            Err(err) => {
                return Err(abandon(tx, err).await.into());
            }
        }

        Ok(self.class_of(a).await?)
    }

    /// Every instance connected to `id` through recorded pairs, `id` included.
    pub async fn class_of(&self, id: Id) -> Result<BTreeSet<Id>, StoreError> {
        self.expand([id]).await
    }

    /// Union of the classes of `ids`.
    pub async fn expand<I>(&self, ids: I) -> Result<BTreeSet<Id>, StoreError>
    where
        I: IntoIterator<Item = Id>,
    {
        let mut adjacent: BTreeMap<Id, Vec<Id>> = BTreeMap::new();
        for (left, right) in self.store.pairs().await? {
            adjacent.entry(left).or_default().push(right);
            adjacent.entry(right).or_default().push(left);
        }

        let roots: Vec<Id> = ids.into_iter().collect();
        let mut class: BTreeSet<Id> = roots.iter().copied().collect();
        class.extend(reachable(roots, |n| adjacent.get(n).cloned().unwrap_or_default()));
        Ok(class)
    }
}
