// SPDX-License-Identifier: MIT
//! Memory store integration tests: read-through counters, decay/prune,
//! query modes, and encrypted-at-rest behavior.

mod common;

use std::sync::Arc;

use agentd::error::ErrorKind;
use agentd::events::EventBus;
use agentd::memory::crypto::MemoryCipher;
use agentd::memory::store::MemoryStore;
use agentd::memory::types::{
    EpisodicMemory, Memory, MemoryBase, MemoryKind, MemoryQuery, SemanticMemory,
};
use agentd::memory::vector::{InMemoryVectorIndex, VectorIndex};
use agentd::storage::Storage;

fn episodic(owner: &str, event: &str, strength: f64) -> Memory {
    Memory::Episodic(EpisodicMemory {
        base: MemoryBase::new(owner, 0.5, strength),
        event: event.into(),
        context: "test context".into(),
        outcome: None,
        success: true,
        valence: 0.2,
        session_id: None,
        related_ids: vec![],
        embedding: None,
    })
}

fn semantic(owner: &str, subject: &str, embedding: Option<Vec<f32>>) -> Memory {
    Memory::Semantic(SemanticMemory {
        base: MemoryBase::new(owner, 0.8, 0.8),
        subject: subject.into(),
        predicate: "is".into(),
        object: "important".into(),
        confidence: 0.9,
        source: None,
        verified_at: None,
        related_concepts: vec![],
        embedding,
    })
}

async fn plain_store() -> (MemoryStore, Arc<InMemoryVectorIndex>) {
    let storage = Storage::in_memory().await.unwrap();
    let index = Arc::new(InMemoryVectorIndex::new());
    let store = MemoryStore::new(
        storage.pool(),
        Some(index.clone() as Arc<dyn VectorIndex>),
        None,
        Arc::new(EventBus::new()),
    );
    (store, index)
}

async fn encrypted_store() -> (MemoryStore, Arc<InMemoryVectorIndex>) {
    let storage = Storage::in_memory().await.unwrap();
    let index = Arc::new(InMemoryVectorIndex::new());
    let store = MemoryStore::new(
        storage.pool(),
        Some(index.clone() as Arc<dyn VectorIndex>),
        Some(Arc::new(MemoryCipher::new("test-master-key").unwrap())),
        Arc::new(EventBus::new()),
    );
    (store, index)
}

#[tokio::test]
async fn save_then_get_bumps_access_count_once() {
    let (store, _) = plain_store().await;
    let saved = store.save(episodic("a1", "first deploy", 0.5)).await.unwrap();
    assert!(!saved.id().is_empty());

    let got = store.get(saved.id()).await.unwrap();
    assert_eq!(got.base().access_count, saved.base().access_count + 1);
    assert_eq!(got.id(), saved.id());
    match (&saved, &got) {
        (Memory::Episodic(a), Memory::Episodic(b)) => {
            assert_eq!(a.event, b.event);
            assert_eq!(a.context, b.context);
        }
        _ => panic!("kind changed"),
    }
    // Strength was recomputed (boosted for an immediate read).
    assert!(got.base().strength > saved.base().strength);

    // The bump persisted: a second read sees count 2.
    let again = store.get(saved.id()).await.unwrap();
    assert_eq!(again.base().access_count, 2);
}

#[tokio::test]
async fn get_unknown_is_not_found() {
    let (store, _) = plain_store().await;
    let err = store.get("missing").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
}

#[tokio::test]
async fn update_keeps_id_and_kind() {
    let (store, _) = plain_store().await;
    let saved = store.save(episodic("a1", "original", 0.5)).await.unwrap();

    let mut patch = serde_json::Map::new();
    patch.insert("event".into(), serde_json::json!("rewritten"));
    patch.insert("id".into(), serde_json::json!("hijacked"));
    patch.insert("importance".into(), serde_json::json!(0.9));

    let updated = store.update(saved.id(), &patch).await.unwrap();
    assert_eq!(updated.id(), saved.id());
    assert_eq!(updated.base().importance, 0.9);
    match updated {
        Memory::Episodic(e) => assert_eq!(e.event, "rewritten"),
        _ => panic!("kind changed"),
    }

    let mut bad = serde_json::Map::new();
    bad.insert("importance".into(), serde_json::json!(7.0));
    assert!(store.update(saved.id(), &bad).await.is_err());
}

#[tokio::test]
async fn delete_then_get_is_not_found() {
    let (store, index) = plain_store().await;
    let saved = store
        .save(semantic("a1", "rust", Some(vec![1.0, 0.0])))
        .await
        .unwrap();
    assert_eq!(index.len(), 1);

    assert!(store.delete(saved.id()).await.unwrap());
    assert!(!store.delete(saved.id()).await.unwrap());
    assert_eq!(index.len(), 0);
    assert_eq!(store.get(saved.id()).await.unwrap_err().kind, ErrorKind::NotFound);
}

#[tokio::test]
async fn decay_then_prune_clears_everything() {
    let (store, _) = plain_store().await;
    for i in 0..10 {
        store
            .save(episodic("a1", &format!("event {i}"), 0.5))
            .await
            .unwrap();
    }

    let affected = store.decay_strength("a1", 0.6).await.unwrap();
    assert_eq!(affected, 10);

    // 0.5 · (1 − 0.6) = 0.2 for every row.
    let rows = store
        .query(
            "a1",
            &MemoryQuery {
                limit: 20,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 10);
    for row in &rows {
        assert!((row.base().strength - 0.2).abs() < 1e-9);
    }

    let removed = store.prune("a1", 0.3).await.unwrap();
    assert_eq!(removed, 10);
    let stats = store.stats("a1").await.unwrap();
    assert_eq!(stats.total_count, 0);
}

#[tokio::test]
async fn decay_leaves_other_owners_alone() {
    let (store, _) = plain_store().await;
    store.save(episodic("a1", "mine", 0.5)).await.unwrap();
    store.save(episodic("a2", "theirs", 0.5)).await.unwrap();

    assert_eq!(store.decay_strength("a1", 0.5).await.unwrap(), 1);
    let other = store
        .query("a2", &MemoryQuery::default())
        .await
        .unwrap();
    assert_eq!(other[0].base().strength, 0.5);
}

#[tokio::test]
async fn clear_wipes_all_kinds_and_vectors() {
    let (store, index) = plain_store().await;
    store.save(episodic("a1", "e", 0.5)).await.unwrap();
    store
        .save(semantic("a1", "s", Some(vec![0.5, 0.5])))
        .await
        .unwrap();
    store.save(episodic("a2", "other", 0.5)).await.unwrap();

    assert_eq!(store.clear("a1").await.unwrap(), 2);
    assert_eq!(index.len(), 0);
    assert_eq!(store.stats("a1").await.unwrap().total_count, 0);
    assert_eq!(store.stats("a2").await.unwrap().total_count, 1);
}

#[tokio::test]
async fn text_query_filters_and_ranks() {
    let (store, _) = plain_store().await;
    store.save(episodic("a1", "Deployed the gateway", 0.9)).await.unwrap();
    store.save(episodic("a1", "ate lunch", 0.4)).await.unwrap();
    store.save(semantic("a1", "deploy pipeline", None)).await.unwrap();

    let results = store
        .query(
            "a1",
            &MemoryQuery {
                text: Some("deploy".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    // Sorted by importance · strength: semantic (0.8·0.8) beats episodic (0.5·0.9).
    assert_eq!(results[0].kind(), MemoryKind::Semantic);

    let only_episodic = store
        .query(
            "a1",
            &MemoryQuery {
                text: Some("deploy".into()),
                types: vec![MemoryKind::Episodic],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(only_episodic.len(), 1);
}

#[tokio::test]
async fn vector_query_rehydrates_rows_and_strips_embeddings() {
    let (store, _) = plain_store().await;
    store
        .save(semantic("a1", "close fact", Some(vec![1.0, 0.0])))
        .await
        .unwrap();
    store
        .save(semantic("a1", "far fact", Some(vec![0.0, 1.0])))
        .await
        .unwrap();

    let hits = store
        .query(
            "a1",
            &MemoryQuery {
                embedding: Some(vec![1.0, 0.0]),
                min_similarity: 0.9,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    match &hits[0] {
        Memory::Semantic(m) => {
            assert_eq!(m.subject, "close fact");
            assert!(m.embedding.is_none(), "embeddings omitted by default");
        }
        _ => panic!("wrong kind"),
    }

    let with_embeddings = store
        .query(
            "a1",
            &MemoryQuery {
                embedding: Some(vec![1.0, 0.0]),
                min_similarity: 0.9,
                include_embeddings: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(with_embeddings[0].embedding().is_some());
}

#[tokio::test]
async fn encryption_roundtrips_and_disables_vector_and_text() {
    let (store, index) = encrypted_store().await;
    let saved = store
        .save(semantic("a1", "classified fact", Some(vec![1.0, 0.0])))
        .await
        .unwrap();

    // No vector entry was written.
    assert_eq!(index.len(), 0);

    // Reads come back decrypted.
    let got = store.get(saved.id()).await.unwrap();
    match &got {
        Memory::Semantic(m) => assert_eq!(m.subject, "classified fact"),
        _ => panic!("wrong kind"),
    }

    // Text search is unavailable — the needle is ignored, the metadata
    // filter still returns the row.
    let results = store
        .query(
            "a1",
            &MemoryQuery {
                text: Some("classified".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(results.len(), 1);

    let no_match_either = store
        .query(
            "a1",
            &MemoryQuery {
                text: Some("zzz-not-present".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(no_match_either.len(), 1, "needle must be ignored under encryption");
}

#[tokio::test]
async fn encrypted_rows_are_sealed_at_rest() {
    let storage = Storage::in_memory().await.unwrap();
    let store = MemoryStore::new(
        storage.pool(),
        None,
        Some(Arc::new(MemoryCipher::new("k").unwrap())),
        Arc::new(EventBus::new()),
    );
    let saved = store.save(episodic("a1", "sealed event", 0.5)).await.unwrap();

    use sqlx::Row as _;
    let row = sqlx::query("SELECT event FROM episodic_memories WHERE id = ?")
        .bind(saved.id())
        .fetch_one(&storage.pool())
        .await
        .unwrap();
    let raw: String = row.get("event");
    assert!(raw.starts_with("enc:v1:"), "stored value is plaintext: {raw}");
    assert!(!raw.contains("sealed event"));
}
