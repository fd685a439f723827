//! A reference model of collection state.
//!
//! The model applies the same operation semantics as the segment manager
//! with plain maps, so property tests can compare every read against it.

use std::collections::BTreeMap;
use tessera_core::{DataRecord, Operation, OperationRecord, SegmentManager, SparseVector};

/// Expected contents of one collection.
#[derive(Debug, Clone, Default)]
pub struct CollectionModel {
    records: BTreeMap<String, (u32, DataRecord)>,
    next_offset_id: u32,
}

impl CollectionModel {
    /// Creates an empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a batch in order.
    pub fn apply(&mut self, batch: &[OperationRecord]) {
        for op in batch {
            self.apply_one(op);
        }
    }

    fn apply_one(&mut self, op: &OperationRecord) {
        let existing = self.records.get(&op.id).cloned();
        match (op.operation, existing) {
            (Operation::Add, Some(_)) | (Operation::Update, None) | (Operation::Delete, None) => {}
            (Operation::Add | Operation::Upsert, None) => {
                let offset_id = self.next_offset_id;
                self.next_offset_id += 1;
                let record = merge(op, DataRecord::new(op.id.clone()));
                self.records.insert(op.id.clone(), (offset_id, record));
            }
            (Operation::Update | Operation::Upsert, Some((offset_id, old))) => {
                self.records.insert(op.id.clone(), (offset_id, merge(op, old)));
            }
            (Operation::Delete, Some(_)) => {
                self.records.remove(&op.id);
            }
        }
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns whether no record is live.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The live record with this id.
    pub fn get(&self, id: &str) -> Option<&DataRecord> {
        self.records.get(id).map(|(_, record)| record)
    }

    /// Every live record in offset id order.
    pub fn records(&self) -> Vec<DataRecord> {
        let mut records = self.records.values().cloned().collect::<Vec<_>>();
        records.sort_by_key(|(offset_id, _)| *offset_id);
        records.into_iter().map(|(_, record)| record).collect()
    }

    /// Sparse top-k by scoring every live record, as `(id, score)`.
    ///
    /// Scores accumulate in ascending term order; ties go to the lower
    /// offset id.
    pub fn sparse_top_k(&self, query: &SparseVector, k: usize) -> Vec<(String, f32)> {
        let mut scored = Vec::new();
        for (offset_id, record) in self.records.values() {
            let Some(sparse) = &record.sparse else {
                continue;
            };
            let mut score = 0.0f32;
            let mut matched = false;
            for (term, &weight) in query {
                if weight == 0.0 {
                    continue;
                }
                if let Some(&w) = sparse.get(term) {
                    score += weight * w;
                    matched = true;
                }
            }
            if matched {
                scored.push((*offset_id, record.id.clone(), score));
            }
        }
        scored.sort_by(|a, b| b.2.total_cmp(&a.2).then(a.0.cmp(&b.0)));
        scored.into_iter().take(k).map(|(_, id, score)| (id, score)).collect()
    }

    /// Asserts that every committed read of `manager` agrees with the model.
    pub fn assert_matches(&self, manager: &SegmentManager) {
        let count = manager.count().expect("Failed to count");
        assert_eq!(count, self.len() as u64, "record count mismatch");
        let actual = manager
            .get(&tessera_core::GetRequest::new())
            .expect("Failed to get records");
        assert_eq!(actual, self.records(), "record contents mismatch");
    }
}

fn merge(op: &OperationRecord, mut base: DataRecord) -> DataRecord {
    if let Some(embedding) = &op.embedding {
        base.embedding = Some(embedding.clone());
    }
    if let Some(document) = &op.document {
        base.document = Some(document.clone());
    }
    if let Some(sparse) = &op.sparse {
        base.sparse = Some(sparse.clone());
    }
    if let Some(changes) = &op.metadata {
        let mut metadata = base.metadata.take().unwrap_or_default();
        for (key, value) in changes {
            match value {
                Some(value) => {
                    metadata.insert(key.clone(), value.clone());
                }
                None => {
                    metadata.remove(key);
                }
            }
        }
        base.metadata = (!metadata.is_empty()).then_some(metadata);
    }
    base
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follows_operation_semantics() {
        let mut model = CollectionModel::new();
        model.apply(&[
            OperationRecord::add("a").document("one"),
            OperationRecord::add("a").document("ignored"),
            OperationRecord::update("missing").document("ignored"),
            OperationRecord::upsert("b").metadata("n", 1u32),
            OperationRecord::update("b").remove_metadata("n"),
            OperationRecord::delete("a"),
            OperationRecord::add("a").document("two"),
        ]);
        let ids = model.records().into_iter().map(|r| r.id).collect::<Vec<_>>();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(model.get("a").unwrap().document.as_deref(), Some("two"));
        assert!(model.get("b").unwrap().metadata.is_none());
    }

    #[test]
    fn sparse_ties_go_to_the_older_record() {
        let mut model = CollectionModel::new();
        model.apply(&[
            OperationRecord::add("x").sparse([("t".to_string(), 1.0)].into()),
            OperationRecord::add("y").sparse([("t".to_string(), 1.0)].into()),
            OperationRecord::add("z").sparse([("t".to_string(), 2.0)].into()),
        ]);
        let hits = model.sparse_top_k(&[("t".to_string(), 1.0)].into(), 2);
        assert_eq!(hits, vec![("z".to_string(), 2.0), ("x".to_string(), 1.0)]);
    }
}
