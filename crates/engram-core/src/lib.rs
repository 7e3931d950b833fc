use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

// ---------------------------------------------------------------------------
// StreamChunk — the provider-independent stream part union
// ---------------------------------------------------------------------------

/// A single part of a streamed model response.
///
/// The cache engine only interprets the four variants below; any other chunk
/// type a provider emits is carried in [`StreamChunk::Other`] and passes
/// through capture, storage, and replay byte-for-byte.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamChunk {
    /// Opens a text part.
    TextStart { id: String },
    /// A fragment of generated text belonging to an open text part.
    TextDelta { id: String, delta: String },
    /// Provider response metadata. The timestamp round-trips through JSON as
    /// an RFC 3339 string and is rehydrated on deserialization.
    #[serde(rename_all = "camelCase")]
    ResponseMetadata {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },
    /// Terminates the stream.
    #[serde(rename_all = "camelCase")]
    Finish {
        finish_reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
    /// Any chunk type the engine does not interpret, preserved verbatim.
    #[serde(untagged)]
    Other(Value),
}

impl StreamChunk {
    pub fn text_start(id: impl Into<String>) -> Self {
        StreamChunk::TextStart { id: id.into() }
    }

    pub fn text_delta(id: impl Into<String>, delta: impl Into<String>) -> Self {
        StreamChunk::TextDelta {
            id: id.into(),
            delta: delta.into(),
        }
    }

    pub fn finish(finish_reason: impl Into<String>, usage: Option<Usage>) -> Self {
        StreamChunk::Finish {
            finish_reason: finish_reason.into(),
            usage,
        }
    }

    /// The text fragment carried by this chunk, if any.
    pub fn delta(&self) -> Option<&str> {
        match self {
            StreamChunk::TextDelta { delta, .. } => Some(delta),
            _ => None,
        }
    }
}

/// Token accounting reported by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

// ---------------------------------------------------------------------------
// Call options
// ---------------------------------------------------------------------------

/// A single conversation message. `content` is usually a JSON string but may
/// be any provider-native content value (multimodal parts, tool results).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallMessage {
    pub role: String,
    pub content: Value,
}

impl CallMessage {
    pub fn new(role: impl Into<String>, content: impl Into<Value>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content.into())
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content.into())
    }

    /// The message content as plain text: strings are returned as-is,
    /// anything else is JSON-serialized.
    pub fn content_text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Provider-visible options for a single model call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CallOptions {
    /// Identifier of the model being invoked.
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<CallMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    /// Provider-native tools descriptor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Value>,
}

impl CallOptions {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            ..Default::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_message(mut self, message: CallMessage) -> Self {
        self.messages.push(message);
        self
    }

    pub fn with_messages(mut self, messages: Vec<CallMessage>) -> Self {
        self.messages = messages;
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_top_p(mut self, top_p: f64) -> Self {
        self.top_p = Some(top_p);
        self
    }

    pub fn with_tools(mut self, tools: Value) -> Self {
        self.tools = Some(tools);
        self
    }
}

// ---------------------------------------------------------------------------
// Generate / stream results
// ---------------------------------------------------------------------------

/// Provider response identification. Extra provider-private fields are kept
/// in `extra` and survive storage and replay untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResponseInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The result of a non-streaming model call, in the provider's shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseInfo>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl GenerateResult {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            finish_reason: Some("stop".to_string()),
            ..Default::default()
        }
    }
}

/// Type alias for a pinned, boxed async stream of [`StreamChunk`] results.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, EngramError>> + Send>>;

/// The result of a streaming model call.
pub struct StreamResponse {
    pub stream: ChunkStream,
}

impl StreamResponse {
    pub fn new(stream: ChunkStream) -> Self {
        Self { stream }
    }

    /// Build a response from an already-materialized chunk sequence.
    pub fn from_chunks(chunks: Vec<StreamChunk>) -> Self {
        Self {
            stream: Box::pin(futures::stream::iter(chunks.into_iter().map(Ok))),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Unified error type for Engram with variants covering all subsystems.
#[derive(Debug, Error)]
pub enum EngramError {
    #[error("config error: {0}")]
    Config(String),
    #[error("embedding error: {0}")]
    Embedding(String),
    #[error("index error: {0}")]
    Index(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("model error: {0}")]
    Model(String),
    #[error("extraction error: {0}")]
    Extraction(String),
    #[error("parsing error: {0}")]
    Parsing(String),
}

// ---------------------------------------------------------------------------
// Provider contract
// ---------------------------------------------------------------------------

/// The core trait for language model providers.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate(&self, options: CallOptions) -> Result<GenerateResult, EngramError>;

    async fn stream(&self, options: CallOptions) -> Result<StreamResponse, EngramError>;
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

/// Continuation for the non-streaming path of a middleware.
#[async_trait]
pub trait GenerateCaller: Send + Sync {
    async fn call(&self, options: CallOptions) -> Result<GenerateResult, EngramError>;
}

/// Continuation for the streaming path of a middleware.
#[async_trait]
pub trait StreamCaller: Send + Sync {
    async fn call(&self, options: CallOptions) -> Result<StreamResponse, EngramError>;
}

/// A middleware that intercepts model calls. Implementations receive the
/// call options plus a continuation invoking the wrapped provider, and may
/// answer without calling it at all.
#[async_trait]
pub trait ModelMiddleware: Send + Sync {
    async fn wrap_generate(
        &self,
        options: CallOptions,
        next: &dyn GenerateCaller,
    ) -> Result<GenerateResult, EngramError>;

    async fn wrap_stream(
        &self,
        options: CallOptions,
        next: &dyn StreamCaller,
    ) -> Result<StreamResponse, EngramError>;
}

/// Continuation that forwards directly to a [`LanguageModel`].
pub struct BaseModelCaller {
    model: Arc<dyn LanguageModel>,
}

impl BaseModelCaller {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl GenerateCaller for BaseModelCaller {
    async fn call(&self, options: CallOptions) -> Result<GenerateResult, EngramError> {
        self.model.generate(options).await
    }
}

#[async_trait]
impl StreamCaller for BaseModelCaller {
    async fn call(&self, options: CallOptions) -> Result<StreamResponse, EngramError> {
        self.model.stream(options).await
    }
}

/// A [`LanguageModel`] with a middleware applied around every call.
pub struct WrappedModel {
    inner: Arc<dyn LanguageModel>,
    middleware: Arc<dyn ModelMiddleware>,
}

impl WrappedModel {
    pub fn new(inner: Arc<dyn LanguageModel>, middleware: Arc<dyn ModelMiddleware>) -> Self {
        Self { inner, middleware }
    }
}

#[async_trait]
impl LanguageModel for WrappedModel {
    async fn generate(&self, options: CallOptions) -> Result<GenerateResult, EngramError> {
        let next = BaseModelCaller::new(self.inner.clone());
        self.middleware.wrap_generate(options, &next).await
    }

    async fn stream(&self, options: CallOptions) -> Result<StreamResponse, EngramError> {
        let next = BaseModelCaller::new(self.inner.clone());
        self.middleware.wrap_stream(options, &next).await
    }
}

// ---------------------------------------------------------------------------
// Embeddings trait (implementations in engram-embeddings)
// ---------------------------------------------------------------------------

/// Trait for embedding text into vectors.
#[async_trait]
pub trait Embeddings: Send + Sync {
    /// Embed multiple texts (for batch document embedding).
    async fn embed_documents(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EngramError>;

    /// Embed a single query text.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EngramError>;
}

// ---------------------------------------------------------------------------
// VectorIndex trait (implementations in engram-qdrant / engram-memory)
// ---------------------------------------------------------------------------

/// A candidate returned from a similarity query, best-first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorMatch {
    pub id: String,
    pub score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// An entry to upsert into the similarity index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorEntry {
    pub id: String,
    pub vector: Vec<f32>,
    pub metadata: Value,
}

/// Trait for similarity-index backends.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Query the `top_k` nearest entries, sorted by descending score.
    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<VectorMatch>, EngramError>;

    /// Insert or overwrite an entry.
    async fn upsert(&self, entry: VectorEntry) -> Result<(), EngramError>;
}

// ---------------------------------------------------------------------------
// PayloadStore trait (implementations in engram-redis / engram-memory)
// ---------------------------------------------------------------------------

/// String-keyed JSON store with per-key expiry and NX set semantics.
#[async_trait]
pub trait PayloadStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, EngramError>;

    async fn set(&self, key: &str, value: &Value, ttl_secs: u64) -> Result<(), EngramError>;

    /// Set `key` only if it does not exist, with expiry. Returns whether the
    /// key was set.
    async fn set_nx(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool, EngramError>;

    async fn del(&self, key: &str) -> Result<(), EngramError>;
}

// ---------------------------------------------------------------------------
// Intent
// ---------------------------------------------------------------------------

/// Structured summary of what a conversation is trying to achieve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedIntent {
    pub intent: String,
    #[serde(default)]
    pub domain: Vec<String>,
    #[serde(default)]
    pub stack: Vec<String>,
    pub goal: String,
    #[serde(default)]
    pub constraints: Vec<String>,
}

impl ExtractedIntent {
    /// Fallback intent built from raw message text when extraction fails.
    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            intent: text.clone(),
            domain: Vec::new(),
            stack: Vec::new(),
            goal: text,
            constraints: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Step events
// ---------------------------------------------------------------------------

/// Lifecycle steps emitted by the cache engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    IntentExtractionStart,
    IntentExtractionComplete,
    IntentExtractionError,
    CacheCheckStart,
    CacheHit,
    CacheMiss,
    GenerationStart,
    GenerationComplete,
    CacheStoreStart,
    CacheStoreComplete,
    CacheStoreError,
}

/// A single observability event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepEvent {
    pub step: StepKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_intention: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_intent: Option<ExtractedIntent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_score: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepEvent {
    pub fn new(step: StepKind) -> Self {
        Self {
            step,
            user_intention: None,
            extracted_intent: None,
            cache_score: None,
            error: None,
        }
    }

    pub fn with_user_intention(mut self, text: impl Into<String>) -> Self {
        self.user_intention = Some(text.into());
        self
    }

    pub fn with_extracted_intent(mut self, intent: ExtractedIntent) -> Self {
        self.extracted_intent = Some(intent);
        self
    }

    pub fn with_cache_score(mut self, score: f32) -> Self {
        self.cache_score = Some(score);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Observability callback invoked once per [`StepEvent`].
pub type StepCallback = Arc<dyn Fn(StepEvent) + Send + Sync>;

/// Callback that records all received events for later inspection, useful
/// for testing.
#[derive(Default, Clone)]
pub struct RecordingSteps {
    events: Arc<std::sync::Mutex<Vec<StepEvent>>>,
}

impl RecordingSteps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self) -> StepCallback {
        let events = self.events.clone();
        Arc::new(move |event| {
            events.lock().expect("step event mutex poisoned").push(event);
        })
    }

    pub fn events(&self) -> Vec<StepEvent> {
        self.events.lock().expect("step event mutex poisoned").clone()
    }

    pub fn kinds(&self) -> Vec<StepKind> {
        self.events().iter().map(|e| e.step).collect()
    }
}
