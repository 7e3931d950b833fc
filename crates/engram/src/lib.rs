//! Engram — a semantic response cache for LLM invocations.
//!
//! Engram sits as a transparent middleware in front of a language model: it
//! fingerprints each call, looks the fingerprint up in a vector index under
//! exact request scope, and on a hit replays the recorded response
//! (optionally re-simulating the token stream) instead of calling the model.
//!
//! Two variants share one core and differ only in how they derive the lookup
//! text: [`SemanticMemory`] fingerprints the raw prompt, [`IntentMemory`]
//! first runs a small LLM to extract a structured intent from the
//! conversation so multi-turn chats hit cache even when wording drifts.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use engram::{create_semantic_memory, CallMessage, CallOptions, MemoryConfig};
//!
//! let memory = create_semantic_memory(provider_model, embeddings, MemoryConfig::new())?;
//! let options = CallOptions::new("gpt-4o").with_message(CallMessage::user("What is an agent?"));
//! let response = memory.stream_text(options).await?;
//! ```

pub use engram_core as core;
pub use engram_embeddings as embeddings;
pub use engram_memory as memory;
pub use engram_models as models;
pub use engram_qdrant as qdrant;
pub use engram_redis as redis;

pub use engram_core::{
    CallMessage, CallOptions, Embeddings, EngramError, ExtractedIntent, GenerateResult,
    LanguageModel, StepCallback, StepEvent, StepKind, StreamChunk, StreamResponse,
};
pub use engram_memory::{
    CacheMode, FailureMode, IntentMemory, MemoryConfig, SemanticMemory, SimulateStream,
};

use std::sync::Arc;

use engram_qdrant::{QdrantIndexConfig, QdrantVectorIndex};
use engram_redis::{RedisPayloadStore, RedisStoreConfig};

const VECTOR_URL_VAR: &str = "VECTOR_REST_URL";
const VECTOR_TOKEN_VAR: &str = "VECTOR_REST_TOKEN";
const REDIS_URL_VAR: &str = "REDIS_REST_URL";
const REDIS_TOKEN_VAR: &str = "REDIS_REST_TOKEN";

struct EnvCredentials {
    vector_url: String,
    vector_token: String,
    redis_url: String,
    redis_token: String,
}

/// Read the backend credentials from the environment, reporting every
/// missing or empty variable at once.
fn credentials_from_env() -> Result<EnvCredentials, EngramError> {
    let mut missing = Vec::new();
    let mut require = |name: &'static str| {
        match std::env::var(name) {
            Ok(value) if !value.is_empty() => value,
            _ => {
                missing.push(name);
                String::new()
            }
        }
    };

    let vector_url = require(VECTOR_URL_VAR);
    let vector_token = require(VECTOR_TOKEN_VAR);
    let redis_url = require(REDIS_URL_VAR);
    let redis_token = require(REDIS_TOKEN_VAR);

    if !missing.is_empty() {
        return Err(EngramError::Config(format!(
            "missing credentials: {}",
            missing.join(", ")
        )));
    }

    Ok(EnvCredentials {
        vector_url,
        vector_token,
        redis_url,
        redis_token,
    })
}

fn backends_from_env(
) -> Result<(Arc<QdrantVectorIndex>, Arc<RedisPayloadStore>), EngramError> {
    let credentials = credentials_from_env()?;

    let index = QdrantVectorIndex::new(
        QdrantIndexConfig::new(credentials.vector_url).with_token(credentials.vector_token),
    )?;
    let store = RedisPayloadStore::new(
        RedisStoreConfig::new(credentials.redis_url).with_token(credentials.redis_token),
    )?;

    Ok((Arc::new(index), Arc::new(store)))
}

/// Create a prompt-similarity cache around `model`, with the vector index
/// and payload store configured from `VECTOR_REST_URL`, `VECTOR_REST_TOKEN`,
/// `REDIS_REST_URL` and `REDIS_REST_TOKEN`.
pub fn create_semantic_memory(
    model: Arc<dyn LanguageModel>,
    embeddings: Arc<dyn Embeddings>,
    config: MemoryConfig,
) -> Result<SemanticMemory, EngramError> {
    let (index, store) = backends_from_env()?;
    SemanticMemory::builder(model)
        .embeddings(embeddings)
        .index(index)
        .store(store)
        .config(config)
        .build()
}

/// Create an intent-similarity cache around `model`. `extractor_model` is
/// the small LLM used to extract intents; backends are configured from the
/// environment as in [`create_semantic_memory`].
pub fn create_intent_memory(
    model: Arc<dyn LanguageModel>,
    extractor_model: Arc<dyn LanguageModel>,
    embeddings: Arc<dyn Embeddings>,
    config: MemoryConfig,
) -> Result<IntentMemory, EngramError> {
    let (index, store) = backends_from_env()?;
    IntentMemory::builder(model)
        .extractor_model(extractor_model)
        .embeddings(embeddings)
        .index(index)
        .store(store)
        .config(config)
        .build()
}
