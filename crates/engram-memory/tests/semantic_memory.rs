//! End-to-end scenarios for the prompt-similarity cache against the
//! in-memory backends.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use engram_core::{
    CallMessage, CallOptions, Embeddings, EngramError, GenerateResult, PayloadStore,
    RecordingSteps, StepKind, StreamChunk, StreamResponse, Usage, VectorIndex,
};
use engram_embeddings::FakeEmbeddings;
use engram_memory::{
    composite_id, lock_key, prompt_cache_text, CacheMode, FailureMode, InMemoryPayloadStore,
    InMemoryVectorIndex, MemoryConfig, Scope, SemanticMemory, SimulateStream, PROMPT_ID_PREFIX,
};
use engram_models::ScriptedModel;
use futures::StreamExt;
use serde_json::{json, Value};

struct Fixture {
    model: Arc<ScriptedModel>,
    index: Arc<InMemoryVectorIndex>,
    store: Arc<InMemoryPayloadStore>,
    recording: RecordingSteps,
}

impl Fixture {
    fn new() -> Self {
        Self {
            model: Arc::new(ScriptedModel::new()),
            index: Arc::new(InMemoryVectorIndex::new()),
            store: Arc::new(InMemoryPayloadStore::new()),
            recording: RecordingSteps::new(),
        }
    }

    fn memory(&self) -> SemanticMemory {
        self.memory_with(MemoryConfig::new())
    }

    fn memory_with(&self, config: MemoryConfig) -> SemanticMemory {
        SemanticMemory::builder(self.model.clone())
            .embeddings(Arc::new(FakeEmbeddings::new(8)))
            .index(self.index.clone())
            .store(self.store.clone())
            .config(
                config
                    .with_simulate_stream(SimulateStream::disabled())
                    .with_on_step(self.recording.callback()),
            )
            .build()
            .unwrap()
    }
}

fn ask(text: &str) -> CallOptions {
    CallOptions::new("gpt-4o").with_message(CallMessage::user(text))
}

fn cache_id_for(options: &CallOptions) -> String {
    let scope = Scope::of(options);
    let text = prompt_cache_text(options, false);
    composite_id(PROMPT_ID_PREFIX, &scope, &text)
}

fn answer_script() -> Vec<StreamChunk> {
    vec![
        StreamChunk::text_start("t1"),
        StreamChunk::text_delta("t1", "An agent is "),
        StreamChunk::text_delta("t1", "a loop around a model."),
        StreamChunk::finish(
            "stop",
            Some(Usage {
                input_tokens: 5,
                output_tokens: 9,
                total_tokens: 14,
            }),
        ),
    ]
}

async fn collect(response: StreamResponse) -> Vec<StreamChunk> {
    response
        .stream
        .map(|item| item.expect("stream chunk"))
        .collect()
        .await
}

/// Wait until the detached write-back has landed in both stores: the
/// payload is written first, the vector entry second.
async fn wait_for_write(fx: &Fixture, options: &CallOptions) -> Value {
    let id = cache_id_for(options);
    let text = prompt_cache_text(options, false);
    let embedding = FakeEmbeddings::new(8).embed_query(&text).await.unwrap();
    for _ in 0..200 {
        let indexed = fx
            .index
            .query(&embedding, 3)
            .await
            .unwrap()
            .iter()
            .any(|m| m.id == id);
        if indexed {
            if let Some(value) = fx.store.get(&id).await.unwrap() {
                return value;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("write-back did not land for {id}");
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn exact_re_ask_replays_the_captured_stream() {
    let fx = Fixture::new();
    fx.model.push_script(answer_script());
    let memory = fx.memory();

    let first = collect(memory.stream_text(ask("What is an agent?")).await.unwrap()).await;
    assert_eq!(first, answer_script());

    let payload = wait_for_write(&fx, &ask("What is an agent?")).await;
    assert!(payload.get("streamParts").is_some());

    // The scripted model is exhausted: a second live call would error.
    let second = collect(memory.stream_text(ask("What is an agent?")).await.unwrap()).await;
    assert_eq!(second, first);
    assert_eq!(fx.model.call_count(), 1);
}

#[tokio::test]
async fn near_paraphrase_above_threshold_hits() {
    let fx = Fixture::new();
    fx.model
        .push_result(GenerateResult::from_text("An agent is a loop."));
    let memory = fx.memory();

    let first = memory
        .generate_text(ask("What is an agent?"))
        .await
        .unwrap();
    assert_eq!(first.text.as_deref(), Some("An agent is a loop."));

    // Different casing and spacing, same meaning: the fingerprint text
    // normalizes to nearly the same string and embeds within the threshold.
    let second = memory
        .generate_text(ask("what is an AGENT?  "))
        .await
        .unwrap();
    assert_eq!(second.text.as_deref(), Some("An agent is a loop."));
    assert_eq!(fx.model.call_count(), 1);
}

#[tokio::test]
async fn scope_mismatch_misses_despite_perfect_score() {
    let fx = Fixture::new();
    fx.model.push_result(GenerateResult::from_text("cold answer"));
    fx.model.push_result(GenerateResult::from_text("warm answer"));
    let memory = fx.memory();

    let cold = ask("What is an agent?").with_temperature(0.2);
    let warm = ask("What is an agent?").with_temperature(0.7);

    memory.generate_text(cold).await.unwrap();
    // Identical prompt, so the candidate scores 1.0; the params hash differs.
    let result = memory.generate_text(warm).await.unwrap();
    assert_eq!(result.text.as_deref(), Some("warm answer"));
    assert_eq!(fx.model.call_count(), 2);
}

#[tokio::test]
async fn refresh_mode_regenerates_and_overwrites() {
    let fx = Fixture::new();
    fx.model.push_result(GenerateResult::from_text("v1"));
    fx.model.push_result(GenerateResult::from_text("v2"));

    let memory = fx.memory();
    memory.generate_text(ask("tell me a joke")).await.unwrap();

    let refreshing = fx.memory_with(MemoryConfig::new().with_cache_mode(CacheMode::Refresh));
    let refreshed = refreshing
        .generate_text(ask("tell me a joke"))
        .await
        .unwrap();
    assert_eq!(refreshed.text.as_deref(), Some("v2"));
    assert_eq!(fx.model.call_count(), 2);

    // The entry was overwritten: a default-mode reader now sees v2.
    let read_back = memory.generate_text(ask("tell me a joke")).await.unwrap();
    assert_eq!(read_back.text.as_deref(), Some("v2"));
    assert_eq!(fx.model.call_count(), 2);
}

#[tokio::test]
async fn dangling_vector_entry_is_a_miss_and_heals() {
    let fx = Fixture::new();
    fx.model.push_result(GenerateResult::from_text("first"));
    fx.model.push_result(GenerateResult::from_text("second"));
    let memory = fx.memory();

    let options = ask("What is an agent?");
    let id = cache_id_for(&options);

    memory.generate_text(options.clone()).await.unwrap();
    assert!(fx.store.get(&id).await.unwrap().is_some());

    // Expire the payload while the vector entry lives on.
    fx.store.del(&id).await.unwrap();

    let result = memory.generate_text(options.clone()).await.unwrap();
    assert_eq!(result.text.as_deref(), Some("second"));
    assert_eq!(fx.model.call_count(), 2);

    // The live call re-populated the dangling id.
    assert!(fx.store.get(&id).await.unwrap().is_some());
}

#[tokio::test]
async fn write_lock_loser_touches_nothing_and_stays_silent() {
    let fx = Fixture::new();
    fx.model.push_result(GenerateResult::from_text("answer"));
    let memory = fx.memory();

    let options = ask("race me");
    let id = cache_id_for(&options);

    // Another writer holds the per-id lock.
    assert!(fx.store.set_nx(&lock_key(&id), "1", 15).await.unwrap());

    let result = memory.generate_text(options).await.unwrap();
    assert_eq!(result.text.as_deref(), Some("answer"));

    // Neither store was written, and no error surfaced.
    assert!(fx.store.get(&id).await.unwrap().is_none());
    let kinds = fx.recording.kinds();
    assert!(kinds.contains(&StepKind::CacheStoreStart));
    assert!(!kinds.contains(&StepKind::CacheStoreComplete));
    assert!(!kinds.contains(&StepKind::CacheStoreError));
}

#[tokio::test]
async fn unknown_chunk_types_are_captured_and_replayed_verbatim() {
    let fx = Fixture::new();
    let exotic = StreamChunk::Other(json!({
        "type": "reasoning-delta",
        "id": "r1",
        "delta": "thinking…",
    }));
    fx.model.push_script(vec![
        exotic.clone(),
        StreamChunk::text_delta("t1", "done"),
        StreamChunk::finish("stop", None),
    ]);
    let memory = fx.memory();

    let options = ask("think hard");
    let first = collect(memory.stream_text(options.clone()).await.unwrap()).await;
    assert_eq!(first[0], exotic);

    wait_for_write(&fx, &options).await;

    let second = collect(memory.stream_text(options).await.unwrap()).await;
    assert_eq!(second, first);
    assert_eq!(fx.model.call_count(), 1);
}

#[tokio::test]
async fn legacy_payload_replays_with_a_deterministic_id() {
    let fx = Fixture::new();
    let memory = fx.memory();

    let options = ask("What is an agent?");
    let scope = Scope::of(&options);
    let text = prompt_cache_text(&options, false);
    let id = composite_id(PROMPT_ID_PREFIX, &scope, &text);

    // Seed the stores with an entry in the legacy shape (no recorded id).
    fx.store
        .set(&id, &json!({"text": "a loop around a model"}), 60)
        .await
        .unwrap();
    let embeddings = FakeEmbeddings::new(8);
    fx.index
        .upsert(engram_core::VectorEntry {
            id: id.clone(),
            vector: embeddings.embed_query(&text).await.unwrap(),
            metadata: Value::Object(scope.metadata_fields()),
        })
        .await
        .unwrap();

    let chunks = collect(memory.stream_text(options).await.unwrap()).await;
    assert_eq!(
        chunks,
        vec![
            StreamChunk::text_start(id.clone()),
            StreamChunk::text_delta(id, "a loop around a model"),
            StreamChunk::finish("stop", None),
        ]
    );
    assert_eq!(fx.model.call_count(), 0);
}

#[tokio::test]
async fn erroring_stream_is_never_written() {
    let fx = Fixture::new();
    fx.model.push_failing_script(
        vec![StreamChunk::text_delta("t1", "partial")],
        EngramError::Model("connection reset".to_string()),
    );
    fx.model.push_script(answer_script());
    let memory = fx.memory();

    let options = ask("What is an agent?");
    let id = cache_id_for(&options);

    let items: Vec<_> = memory
        .stream_text(options.clone())
        .await
        .unwrap()
        .stream
        .collect()
        .await;
    assert!(items.last().unwrap().is_err());

    // Give any (incorrect) write-back a chance to land before checking.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(fx.store.get(&id).await.unwrap().is_none());

    // The retry is a miss and generates live.
    let chunks = collect(memory.stream_text(options).await.unwrap()).await;
    assert_eq!(chunks, answer_script());
    assert_eq!(fx.model.call_count(), 2);
}

#[tokio::test]
async fn generate_events_follow_the_documented_sequence() {
    let fx = Fixture::new();
    fx.model.push_result(GenerateResult::from_text("answer"));
    let memory = fx.memory();

    memory.generate_text(ask("What is an agent?")).await.unwrap();
    assert_eq!(
        fx.recording.kinds(),
        vec![
            StepKind::CacheCheckStart,
            StepKind::CacheMiss,
            StepKind::GenerationStart,
            StepKind::GenerationComplete,
            StepKind::CacheStoreStart,
            StepKind::CacheStoreComplete,
        ]
    );

    memory.generate_text(ask("What is an agent?")).await.unwrap();
    let kinds = fx.recording.kinds();
    assert_eq!(
        &kinds[6..],
        &[StepKind::CacheCheckStart, StepKind::CacheHit]
    );

    let hit = fx
        .recording
        .events()
        .into_iter()
        .find(|e| e.step == StepKind::CacheHit)
        .unwrap();
    assert!(hit.cache_score.unwrap() > 0.99);
    assert!(hit.user_intention.unwrap().contains("what is an agent?"));
}

#[tokio::test]
async fn lookup_errors_surface_when_failing_closed() {
    struct BrokenEmbeddings;

    #[async_trait]
    impl Embeddings for BrokenEmbeddings {
        async fn embed_documents(&self, _texts: &[&str]) -> Result<Vec<Vec<f32>>, EngramError> {
            Err(EngramError::Embedding("embedder offline".to_string()))
        }

        async fn embed_query(&self, _text: &str) -> Result<Vec<f32>, EngramError> {
            Err(EngramError::Embedding("embedder offline".to_string()))
        }
    }

    let fx = Fixture::new();
    fx.model.push_result(GenerateResult::from_text("live"));

    let closed = SemanticMemory::builder(fx.model.clone())
        .embeddings(Arc::new(BrokenEmbeddings))
        .index(fx.index.clone())
        .store(fx.store.clone())
        .config(MemoryConfig::new())
        .build()
        .unwrap();
    let err = closed.generate_text(ask("hi")).await.unwrap_err();
    assert!(matches!(err, EngramError::Embedding(_)));
    assert_eq!(fx.model.call_count(), 0);

    let open = SemanticMemory::builder(fx.model.clone())
        .embeddings(Arc::new(BrokenEmbeddings))
        .index(fx.index.clone())
        .store(fx.store.clone())
        .config(MemoryConfig::new().with_failure_mode(FailureMode::FailOpen))
        .build()
        .unwrap();
    let result = open.generate_text(ask("hi")).await.unwrap();
    assert_eq!(result.text.as_deref(), Some("live"));
    // With no embedding there is nothing to upsert: no write-back happened.
    assert!(fx.store.get(&cache_id_for(&ask("hi"))).await.unwrap().is_none());
}

#[tokio::test]
async fn full_message_fingerprinting_distinguishes_histories() {
    // Embeds the two conversation histories onto orthogonal axes so the
    // outcome depends only on which text the fingerprinter produced.
    struct HistoryAwareEmbeddings;

    #[async_trait]
    impl Embeddings for HistoryAwareEmbeddings {
        async fn embed_documents(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EngramError> {
            let mut vectors = Vec::with_capacity(texts.len());
            for text in texts {
                vectors.push(self.embed_query(text).await?);
            }
            Ok(vectors)
        }

        async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EngramError> {
            Ok(if text.contains("roses are red") {
                vec![1.0, 0.0]
            } else {
                vec![0.0, 1.0]
            })
        }
    }

    let fx = Fixture::new();
    fx.model.push_result(GenerateResult::from_text("one"));
    fx.model.push_result(GenerateResult::from_text("two"));
    let memory = SemanticMemory::builder(fx.model.clone())
        .embeddings(Arc::new(HistoryAwareEmbeddings))
        .index(fx.index.clone())
        .store(fx.store.clone())
        .config(MemoryConfig::new().with_use_full_messages(true))
        .build()
        .unwrap();

    let short = CallOptions::new("gpt-4o").with_message(CallMessage::user("continue"));
    let long = CallOptions::new("gpt-4o")
        .with_message(CallMessage::user("write a poem"))
        .with_message(CallMessage::assistant("Roses are red…"))
        .with_message(CallMessage::user("continue"));

    memory.generate_text(short).await.unwrap();
    memory.generate_text(long).await.unwrap();
    // Same last message, different conversations: both go live.
    assert_eq!(fx.model.call_count(), 2);
}

#[tokio::test]
async fn builder_reports_all_missing_backends() {
    let model = Arc::new(ScriptedModel::new());
    let err = SemanticMemory::builder(model).build().unwrap_err();
    let message = err.to_string();
    assert!(message.contains("embedding model"));
    assert!(message.contains("vector index"));
    assert!(message.contains("payload store"));
}

#[tokio::test]
async fn invalid_threshold_fails_at_build_time() {
    let fx = Fixture::new();
    let err = SemanticMemory::builder(fx.model.clone())
        .embeddings(Arc::new(FakeEmbeddings::default()))
        .index(fx.index.clone())
        .store(fx.store.clone())
        .config(MemoryConfig::new().with_threshold(2.0))
        .build()
        .unwrap_err();
    assert!(err.to_string().contains("threshold"));
}
