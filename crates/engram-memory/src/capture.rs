use std::sync::Arc;

use engram_core::{
    ChunkStream, EngramError, PayloadStore, StepEvent, StepKind, StreamChunk, VectorEntry,
    VectorIndex,
};
use futures::StreamExt;
use serde_json::{json, Value};

use crate::fingerprint::{lock_key, LOCK_TTL_SECS};
use crate::steps::StepEmitter;

/// One pending write of `(payload, vector entry)` for a cache id.
///
/// Writes are serialized per id by an NX lock in the payload store: a writer
/// that loses the lock race performs neither write and reports no error.
pub(crate) struct WriteBack {
    pub(crate) store: Arc<dyn PayloadStore>,
    pub(crate) index: Arc<dyn VectorIndex>,
    pub(crate) id: String,
    pub(crate) embedding: Vec<f32>,
    pub(crate) metadata: Value,
    pub(crate) ttl_secs: u64,
    pub(crate) emitter: StepEmitter,
}

impl WriteBack {
    pub(crate) async fn run(self, payload: Value) {
        self.emitter.emit(StepEvent::new(StepKind::CacheStoreStart));

        let lock = lock_key(&self.id);
        match self.store.set_nx(&lock, "1", LOCK_TTL_SECS).await {
            Ok(true) => {}
            // Another writer owns this id; back off without touching either store.
            Ok(false) => return,
            Err(e) => {
                tracing::warn!(id = %self.id, error = %e, "cache lock acquire failed");
                self.emitter
                    .emit(StepEvent::new(StepKind::CacheStoreError).with_error(e.to_string()));
                return;
            }
        }

        let result = self.write(&payload).await;

        if let Err(e) = self.store.del(&lock).await {
            tracing::warn!(id = %self.id, error = %e, "cache lock release failed");
        }

        match result {
            Ok(()) => {
                tracing::debug!(id = %self.id, "cache entry stored");
                self.emitter.emit(StepEvent::new(StepKind::CacheStoreComplete));
            }
            Err(e) => {
                tracing::warn!(id = %self.id, error = %e, "cache write-back failed");
                self.emitter
                    .emit(StepEvent::new(StepKind::CacheStoreError).with_error(e.to_string()));
            }
        }
    }

    // Payload before vector entry: the only inconsistency a failure here can
    // leave behind is a dangling vector, which the lookup path tolerates.
    async fn write(&self, payload: &Value) -> Result<(), EngramError> {
        self.store.set(&self.id, payload, self.ttl_secs).await?;
        self.index
            .upsert(VectorEntry {
                id: self.id.clone(),
                vector: self.embedding.clone(),
                metadata: self.metadata.clone(),
            })
            .await
    }
}

/// Interpose on a live stream: forward every chunk unchanged while recording
/// it, and on normal termination detach the write-back. An erroring stream
/// never writes.
pub(crate) fn capture_stream(
    inner: ChunkStream,
    emitter: StepEmitter,
    write_back: Option<WriteBack>,
) -> ChunkStream {
    Box::pin(async_stream::stream! {
        let mut inner = inner;
        let mut captured: Vec<StreamChunk> = Vec::new();
        let mut failed = false;

        while let Some(item) = inner.next().await {
            match item {
                Ok(chunk) => {
                    if write_back.is_some() {
                        captured.push(chunk.clone());
                    }
                    yield Ok(chunk);
                }
                Err(e) => {
                    failed = true;
                    yield Err(e);
                }
            }
        }

        if failed {
            return;
        }

        emitter.emit(StepEvent::new(StepKind::GenerationComplete));

        // The consumer sees end-of-stream immediately; store I/O happens
        // behind its back.
        if let Some(write_back) = write_back {
            let payload = json!({ "streamParts": captured });
            tokio::spawn(write_back.run(payload));
        }
    })
}

#[cfg(test)]
mod tests {
    use engram_core::RecordingSteps;
    use serde_json::json;

    use crate::in_memory::{InMemoryPayloadStore, InMemoryVectorIndex};

    use super::*;

    fn write_back(
        store: Arc<InMemoryPayloadStore>,
        index: Arc<InMemoryVectorIndex>,
        recording: &RecordingSteps,
    ) -> WriteBack {
        WriteBack {
            store,
            index,
            id: "llm:test".to_string(),
            embedding: vec![1.0, 0.0],
            metadata: json!({"prompt": "hello"}),
            ttl_secs: 60,
            emitter: StepEmitter::new(Some(recording.callback()), false),
        }
    }

    #[tokio::test]
    async fn winner_writes_payload_then_vector_and_releases_lock() {
        let store = Arc::new(InMemoryPayloadStore::new());
        let index = Arc::new(InMemoryVectorIndex::new());
        let recording = RecordingSteps::new();

        write_back(store.clone(), index.clone(), &recording)
            .run(json!({"streamParts": []}))
            .await;

        assert!(store.get("llm:test").await.unwrap().is_some());
        assert_eq!(index.query(&[1.0, 0.0], 3).await.unwrap().len(), 1);
        // Lock was released.
        assert!(store.get("lock:llm:test").await.unwrap().is_none());
        assert_eq!(
            recording.kinds(),
            vec![StepKind::CacheStoreStart, StepKind::CacheStoreComplete]
        );
    }

    #[tokio::test]
    async fn loser_touches_neither_store_and_stays_silent() {
        let store = Arc::new(InMemoryPayloadStore::new());
        let index = Arc::new(InMemoryVectorIndex::new());
        let recording = RecordingSteps::new();

        // Another writer holds the lock.
        assert!(store.set_nx("lock:llm:test", "1", 15).await.unwrap());

        write_back(store.clone(), index.clone(), &recording)
            .run(json!({"streamParts": []}))
            .await;

        assert!(store.get("llm:test").await.unwrap().is_none());
        assert!(index.query(&[1.0, 0.0], 3).await.unwrap().is_empty());
        // The holder's lock is still in place.
        assert!(store.get("lock:llm:test").await.unwrap().is_some());
        assert_eq!(recording.kinds(), vec![StepKind::CacheStoreStart]);
    }

    #[tokio::test]
    async fn concurrent_writers_both_complete_without_error() {
        let store = Arc::new(InMemoryPayloadStore::new());
        let index = Arc::new(InMemoryVectorIndex::new());
        let recording = RecordingSteps::new();

        let a = write_back(store.clone(), index.clone(), &recording)
            .run(json!({"streamParts": [{"type": "text-delta", "id": "t", "delta": "a"}]}));
        let b = write_back(store.clone(), index.clone(), &recording)
            .run(json!({"streamParts": [{"type": "text-delta", "id": "t", "delta": "b"}]}));
        tokio::join!(a, b);

        // Whoever won, the stores are consistent and unlocked.
        assert!(store.get("llm:test").await.unwrap().is_some());
        assert_eq!(index.query(&[1.0, 0.0], 3).await.unwrap().len(), 1);
        assert!(store.get("lock:llm:test").await.unwrap().is_none());
    }
}
