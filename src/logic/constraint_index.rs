use crate::model::{EntityId, EntityKind, Row};
use crate::store::{EntityTx, StoreResult};

/// Lookup of existing rows through each kind's unique constraint sets.
pub struct ConstraintIndex;

impl ConstraintIndex {
    /// Unique sets that can match `row`, in declaration order. A set with a
    /// missing column is skipped: NULLs never collide under a unique
    /// constraint, so it cannot identify a row.
    pub fn applicable(kind: EntityKind, row: &Row) -> Vec<&'static [&'static str]> {
        kind.spec()
            .unique
            .iter()
            .copied()
            .filter(|set| set.iter().all(|c| row.contains_key(*c)))
            .collect()
    }

    /// Columns compared when no unique set applies: every column, absent
    /// ones matching NULL.
    pub fn exact_columns(kind: EntityKind) -> Vec<&'static str> {
        kind.spec().fields.iter().map(|f| f.name).collect()
    }

    /// First existing row that shares all values of one applicable unique
    /// set with `row`. Kinds with no applicable set are matched on the
    /// whole row instead.
    pub async fn find(
        tx: &mut dyn EntityTx,
        kind: EntityKind,
        row: &Row,
    ) -> StoreResult<Option<EntityId>> {
        let sets = Self::applicable(kind, row);
        if sets.is_empty() {
            let columns = Self::exact_columns(kind);
            let key = tx.find(kind, &columns, row).await?;
            return Ok(key.map(|key| EntityId::new(kind, key)));
        }
        for set in sets {
            if let Some(key) = tx.find(kind, set, row).await? {
                return Ok(Some(EntityId::new(kind, key)));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Key, Scalar};
    use crate::store::{EntityStore, MemoryStore};

    fn aspect(label: &str, iri: &str) -> Row {
        let mut row = Row::new();
        row.insert("label".into(), Scalar::from(label));
        row.insert("iri".into(), Scalar::from(iri));
        row
    }

    #[test]
    fn test_sets_with_missing_columns_do_not_apply() {
        let mut quant = Row::new();
        quant.insert("label".into(), Scalar::from("volume"));
        quant.insert("shape".into(), Scalar::from("scalar"));
        quant.insert("aggregation_type".into(), Scalar::from("instance"));
        let sets = ConstraintIndex::applicable(EntityKind::DescriptorQuant, &quant);
        assert_eq!(sets, vec![&["label"][..]]);
        assert!(ConstraintIndex::applicable(EntityKind::ValueQuant, &Row::new()).is_empty());
    }

    #[tokio::test]
    async fn test_sets_are_searched_in_declaration_order() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let by_iri = tx.insert(EntityKind::Aspect, &aspect("length", "iri:a")).await.unwrap();
        let by_label = tx.insert(EntityKind::Aspect, &aspect("width", "iri:b")).await.unwrap();

        // iri matches the first row, label the second; iri is declared first
        let lookup = aspect("width", "iri:a");
        let found = ConstraintIndex::find(tx.as_mut(), EntityKind::Aspect, &lookup).await.unwrap();
        assert_eq!(found.map(|id| id.key), Some(by_iri.clone()));

        let lookup = aspect("width", "iri:zzz");
        let found = ConstraintIndex::find(tx.as_mut(), EntityKind::Aspect, &lookup).await.unwrap();
        assert_eq!(found.map(|id| id.key), Some(by_label));

        let lookup = aspect("depth", "iri:c");
        assert!(ConstraintIndex::find(tx.as_mut(), EntityKind::Aspect, &lookup)
            .await
            .unwrap()
            .is_none());
        assert_eq!(by_iri, Key::Serial(1));
    }
}
