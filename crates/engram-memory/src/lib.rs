//! The Engram cache engine: fingerprint a model call, look it up in a
//! similarity index scoped by exact request parameters, replay the recorded
//! response on a hit, and capture the live response on a miss.

mod capture;
mod config;
mod fingerprint;
mod in_memory;
mod intent;
mod lookup;
mod middleware;
mod replay;
mod steps;

pub use config::{
    CacheMode, FailureMode, MemoryConfig, SimulateStream, DEFAULT_THRESHOLD, DEFAULT_TTL_SECS,
    DEFAULT_WINDOW_SIZE,
};
pub use fingerprint::{
    composite_id, intent_cache_text, lock_key, normalize, prompt_cache_text, sha256_hex,
    Fingerprint, Scope, INTENT_ID_PREFIX, LOCK_TTL_SECS, PROMPT_ID_PREFIX,
};
pub use in_memory::{InMemoryPayloadStore, InMemoryVectorIndex};
pub use intent::{IntentExtractor, DEFAULT_EXTRACTOR_INSTRUCTIONS};
pub use middleware::{
    CacheMiddleware, IntentMemory, IntentMemoryBuilder, SemanticMemory, SemanticMemoryBuilder,
};
