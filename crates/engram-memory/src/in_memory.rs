use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use engram_core::{EngramError, PayloadStore, VectorEntry, VectorIndex, VectorMatch};
use serde_json::Value;
use tokio::sync::RwLock;

// ---------------------------------------------------------------------------
// InMemoryVectorIndex
// ---------------------------------------------------------------------------

struct IndexEntry {
    vector: Vec<f32>,
    metadata: Value,
}

/// In-memory similarity index using cosine similarity. Suitable for tests
/// and single-process deployments.
pub struct InMemoryVectorIndex {
    entries: RwLock<HashMap<String, IndexEntry>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Remove an entry, for simulating vector/KV drift in tests.
    pub async fn remove(&self, id: &str) {
        self.entries.write().await.remove(id);
    }
}

impl Default for InMemoryVectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<VectorMatch>, EngramError> {
        let entries = self.entries.read().await;
        let mut matches: Vec<VectorMatch> = entries
            .iter()
            .map(|(id, entry)| VectorMatch {
                id: id.clone(),
                score: cosine_similarity(vector, &entry.vector),
                metadata: Some(entry.metadata.clone()),
            })
            .collect();

        matches.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        matches.truncate(top_k);
        Ok(matches)
    }

    async fn upsert(&self, entry: VectorEntry) -> Result<(), EngramError> {
        let mut entries = self.entries.write().await;
        entries.insert(
            entry.id,
            IndexEntry {
                vector: entry.vector,
                metadata: entry.metadata,
            },
        );
        Ok(())
    }
}

/// Compute cosine similarity between two vectors.
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }

    dot / (mag_a * mag_b)
}

// ---------------------------------------------------------------------------
// InMemoryPayloadStore
// ---------------------------------------------------------------------------

struct StoredValue {
    value: Value,
    expires_at: Instant,
}

impl StoredValue {
    fn alive(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// In-memory payload store with per-key expiry and NX set semantics.
pub struct InMemoryPayloadStore {
    entries: RwLock<HashMap<String, StoredValue>>,
}

impl InMemoryPayloadStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryPayloadStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PayloadStore for InMemoryPayloadStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, EngramError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|stored| stored.alive())
            .map(|stored| stored.value.clone()))
    }

    async fn set(&self, key: &str, value: &Value, ttl_secs: u64) -> Result<(), EngramError> {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            StoredValue {
                value: value.clone(),
                expires_at: Instant::now() + Duration::from_secs(ttl_secs),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool, EngramError> {
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(StoredValue::alive) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            StoredValue {
                value: Value::String(value.to_string()),
                expires_at: Instant::now() + Duration::from_secs(ttl_secs),
            },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<(), EngramError> {
        let mut entries = self.entries.write().await;
        entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn cosine_similarity_identical_vectors() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_orthogonal_vectors() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_mismatched_lengths() {
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn query_returns_best_first() {
        let index = InMemoryVectorIndex::new();
        index
            .upsert(VectorEntry {
                id: "far".to_string(),
                vector: vec![0.0, 1.0],
                metadata: json!({}),
            })
            .await
            .unwrap();
        index
            .upsert(VectorEntry {
                id: "near".to_string(),
                vector: vec![1.0, 0.0],
                metadata: json!({}),
            })
            .await
            .unwrap();

        let matches = index.query(&[1.0, 0.0], 2).await.unwrap();
        assert_eq!(matches[0].id, "near");
        assert!(matches[0].score > matches[1].score);
    }

    #[tokio::test]
    async fn top_k_truncates() {
        let index = InMemoryVectorIndex::new();
        for i in 0..5 {
            index
                .upsert(VectorEntry {
                    id: format!("e{i}"),
                    vector: vec![1.0, i as f32],
                    metadata: json!({}),
                })
                .await
                .unwrap();
        }
        assert_eq!(index.query(&[1.0, 0.0], 3).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn get_respects_expiry() {
        let store = InMemoryPayloadStore::new();
        store.set("k", &json!({"v": 1}), 0).await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());

        store.set("k", &json!({"v": 2}), 60).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(json!({"v": 2})));
    }

    #[tokio::test]
    async fn set_nx_only_sets_once() {
        let store = InMemoryPayloadStore::new();
        assert!(store.set_nx("lock", "1", 15).await.unwrap());
        assert!(!store.set_nx("lock", "1", 15).await.unwrap());

        store.del("lock").await.unwrap();
        assert!(store.set_nx("lock", "1", 15).await.unwrap());
    }

    #[tokio::test]
    async fn set_nx_succeeds_after_expiry() {
        let store = InMemoryPayloadStore::new();
        assert!(store.set_nx("lock", "1", 0).await.unwrap());
        // The previous holder's lock has already expired.
        assert!(store.set_nx("lock", "1", 15).await.unwrap());
    }
}
