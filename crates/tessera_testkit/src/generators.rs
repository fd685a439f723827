//! Property-based test generators using proptest.
//!
//! Id pools and vocabularies are kept small so generated batches collide on
//! ids, terms and metadata values often enough to exercise updates.

use proptest::prelude::*;
use tessera_core::{OperationRecord, SparseVector};

/// Dimension of every generated embedding.
pub const EMBEDDING_DIMENSION: usize = 3;

/// Terms generated sparse vectors draw from.
pub const TERMS: [&str; 6] = ["ant", "bee", "cat", "dog", "eel", "fox"];

const WORDS: [&str; 5] = ["red", "green", "blue", "quick", "lazy"];

/// Strategy for batches of blockfile writes over a small `u32` key space.
/// `None` deletes the key.
pub fn blockfile_batches_strategy() -> impl Strategy<Value = Vec<Vec<(u32, Option<u32>)>>> {
    prop::collection::vec(
        prop::collection::vec((0u32..400, prop::option::weighted(0.8, any::<u32>())), 1..120),
        1..5,
    )
}

/// Strategy for user ids drawn from a pool of 16.
pub fn user_id_strategy() -> impl Strategy<Value = String> {
    (0u8..16).prop_map(|i| format!("id-{i:02}"))
}

/// Strategy for sparse vectors over [`TERMS`] with weights in `(-1, 1)`.
pub fn sparse_vector_strategy() -> impl Strategy<Value = SparseVector> {
    prop::collection::btree_map(
        prop::sample::select(TERMS.to_vec()).prop_map(str::to_string),
        -1.0f32..1.0,
        1..4,
    )
}

/// Strategy for sparse queries: positive weights, which is what callers send.
pub fn sparse_query_strategy() -> impl Strategy<Value = SparseVector> {
    prop::collection::btree_map(
        prop::sample::select(TERMS.to_vec()).prop_map(str::to_string),
        0.05f32..2.0,
        1..4,
    )
}

fn embedding_strategy() -> impl Strategy<Value = Vec<f32>> {
    prop::collection::vec(-10.0f32..10.0, EMBEDDING_DIMENSION)
}

fn document_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec(prop::sample::select(WORDS.to_vec()), 1..5).prop_map(|words| words.join(" "))
}

/// Strategy for one mutation of any kind.
pub fn operation_strategy() -> impl Strategy<Value = OperationRecord> {
    (
        0u8..4,
        user_id_strategy(),
        prop::option::of(embedding_strategy()),
        prop::option::of(document_strategy()),
        prop::option::of(0u32..5),
        any::<bool>(),
        prop::option::of(sparse_vector_strategy()),
    )
        .prop_map(|(op, id, embedding, document, rank, drop_rank, sparse)| {
            let mut record = match op {
                0 => OperationRecord::add(id),
                1 => OperationRecord::update(id),
                2 => OperationRecord::upsert(id),
                _ => return OperationRecord::delete(id),
            };
            if let Some(embedding) = embedding {
                record = record.embedding(embedding);
            }
            if let Some(document) = document {
                record = record.document(document);
            }
            record = match (rank, drop_rank) {
                (Some(rank), _) => record.metadata("rank", rank),
                (None, true) => record.remove_metadata("rank"),
                (None, false) => record,
            };
            if let Some(sparse) = sparse {
                record = record.sparse(sparse);
            }
            record
        })
}

/// Strategy for sequences of batches, flushed one at a time.
pub fn operation_batches_strategy() -> impl Strategy<Value = Vec<Vec<OperationRecord>>> {
    prop::collection::vec(prop::collection::vec(operation_strategy(), 1..12), 1..4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::strategy::ValueTree;
    use proptest::test_runner::TestRunner;

    #[test]
    fn generated_embeddings_share_a_dimension() {
        let mut runner = TestRunner::default();
        for _ in 0..50 {
            let op = operation_strategy().new_tree(&mut runner).unwrap().current();
            if let Some(embedding) = &op.embedding {
                assert_eq!(embedding.len(), EMBEDDING_DIMENSION);
            }
        }
    }
}
