use bson::{Bson, Document};

use crate::error::StoreError;
use crate::values::{first_at, value_eq};

use super::source::Records;

#[derive(Debug, Clone, PartialEq)]
pub struct IndexInfo {
    pub name: String,
    pub keys: Document,
    pub unique: bool,
}

impl IndexInfo {
    pub(crate) fn id_index() -> IndexInfo {
        let mut keys = Document::new();
        keys.insert("_id", 1);
        IndexInfo {
            name: "_id_".into(),
            keys,
            unique: true,
        }
    }

    /// MongoDB-style generated name: `{"a": 1, "b": -1}` → `a_1_b_-1`.
    pub(crate) fn name_for(keys: &Document) -> String {
        keys.iter()
            .map(|(k, v)| match v {
                Bson::Int32(n) => format!("{k}_{n}"),
                Bson::Int64(n) => format!("{k}_{n}"),
                Bson::String(s) => format!("{k}_{s}"),
                other => format!("{k}_{other}"),
            })
            .collect::<Vec<_>>()
            .join("_")
    }

    fn key_of(&self, doc: &Document) -> Vec<Bson> {
        self.keys
            .keys()
            .map(|k| first_at(doc, k).cloned().unwrap_or(Bson::Null))
            .collect()
    }

    /// Check that none of the `changed` records collides with another record
    /// on this index.
    pub(crate) fn check(
        &self,
        collection: &str,
        records: &Records,
        changed: &[u64],
    ) -> Result<(), StoreError> {
        if !self.unique {
            return Ok(());
        }
        for seq in changed {
            let Some(doc) = records.get(seq) else {
                continue;
            };
            let key = self.key_of(doc);
            let clash = records.iter().any(|(other_seq, other)| {
                other_seq != seq
                    && self
                        .key_of(other)
                        .iter()
                        .zip(&key)
                        .all(|(a, b)| value_eq(a, b))
            });
            if clash {
                return Err(self.duplicate(collection, &key));
            }
        }
        Ok(())
    }

    fn duplicate(&self, collection: &str, key: &[Bson]) -> StoreError {
        let dup = self
            .keys
            .keys()
            .zip(key)
            .map(|(k, v)| format!("{k}: {v}"))
            .collect::<Vec<_>>()
            .join(", ");
        StoreError::DuplicateKey(format!(
            "E11000 duplicate key error collection: {collection} index: {} dup key: {{ {dup} }}",
            self.name
        ))
    }
}
