use std::sync::Arc;

use async_trait::async_trait;
use engram_core::{
    CallOptions, Embeddings, EngramError, GenerateCaller, GenerateResult, LanguageModel,
    ModelMiddleware, PayloadStore, StepEvent, StepKind, StreamCaller, StreamResponse, VectorIndex,
    WrappedModel,
};
use serde_json::Value;

use crate::capture::{capture_stream, WriteBack};
use crate::config::{CacheMode, FailureMode, MemoryConfig};
use crate::fingerprint::{
    composite_id, intent_cache_text, normalize, prompt_cache_text, Fingerprint, Scope,
    INTENT_ID_PREFIX, PROMPT_ID_PREFIX,
};
use crate::intent::IntentExtractor;
use crate::lookup::{select_candidate, CacheHit, LookupOutcome};
use crate::replay::{payload_stream_parts, replay_stream};
use crate::steps::StepEmitter;

const DEFAULT_TOP_K: usize = 3;

enum Variant {
    /// Fingerprint the raw prompt text.
    Prompt,
    /// Fingerprint a canonical concatenation of the extracted intent.
    Intent(IntentExtractor),
}

/// The cache middleware: fingerprints each call, replays a recorded response
/// when a qualifying entry exists, and otherwise records the live response
/// for future calls.
pub struct CacheMiddleware {
    embeddings: Arc<dyn Embeddings>,
    index: Arc<dyn VectorIndex>,
    store: Arc<dyn PayloadStore>,
    config: MemoryConfig,
    variant: Variant,
    emitter: StepEmitter,
}

impl CacheMiddleware {
    /// Prompt-similarity variant.
    pub fn semantic(
        embeddings: Arc<dyn Embeddings>,
        index: Arc<dyn VectorIndex>,
        store: Arc<dyn PayloadStore>,
        config: MemoryConfig,
    ) -> Result<Self, EngramError> {
        Self::new(embeddings, index, store, config, Variant::Prompt)
    }

    /// Intent-similarity variant.
    pub fn intent(
        embeddings: Arc<dyn Embeddings>,
        index: Arc<dyn VectorIndex>,
        store: Arc<dyn PayloadStore>,
        config: MemoryConfig,
        extractor_model: Arc<dyn LanguageModel>,
    ) -> Result<Self, EngramError> {
        let mut extractor =
            IntentExtractor::new(extractor_model).with_window_size(config.window_size);
        if let Some(instructions) = &config.extractor_instructions {
            extractor = extractor.with_instructions(instructions.clone());
        }
        Self::new(embeddings, index, store, config, Variant::Intent(extractor))
    }

    fn new(
        embeddings: Arc<dyn Embeddings>,
        index: Arc<dyn VectorIndex>,
        store: Arc<dyn PayloadStore>,
        config: MemoryConfig,
        variant: Variant,
    ) -> Result<Self, EngramError> {
        config.validate()?;
        let emitter = StepEmitter::new(config.on_step.clone(), config.debug);
        Ok(Self {
            embeddings,
            index,
            store,
            config,
            variant,
            emitter,
        })
    }

    // -- Fingerprinting ------------------------------------------------------

    async fn fingerprint(&self, options: &CallOptions) -> Fingerprint {
        let scope = Scope::of(options);
        match &self.variant {
            Variant::Prompt => {
                let text = prompt_cache_text(options, self.config.use_full_messages);
                let id = composite_id(PROMPT_ID_PREFIX, &scope, &text);
                let mut metadata = scope.metadata_fields();
                metadata.insert("prompt".to_string(), Value::String(text.clone()));
                Fingerprint {
                    id,
                    scope,
                    text,
                    metadata: Value::Object(metadata),
                }
            }
            Variant::Intent(extractor) => {
                if options.messages.is_empty() {
                    // Nothing to extract from: stringify the prompt directly.
                    let text = normalize(options.prompt.as_deref().unwrap_or(""));
                    let id = composite_id(INTENT_ID_PREFIX, &scope, &text);
                    let mut metadata = scope.metadata_fields();
                    metadata.insert("intent".to_string(), Value::String(text.clone()));
                    Fingerprint {
                        id,
                        scope,
                        text,
                        metadata: Value::Object(metadata),
                    }
                } else {
                    self.emitter.emit(StepEvent::new(StepKind::IntentExtractionStart));
                    let intent = extractor.extract(&options.messages, &self.emitter).await;
                    let text = intent_cache_text(&intent);
                    let id = composite_id(INTENT_ID_PREFIX, &scope, &text);
                    let mut metadata = scope.metadata_fields();
                    metadata.insert("intent".to_string(), Value::String(text.clone()));
                    metadata.insert("goal".to_string(), Value::String(intent.goal.clone()));
                    metadata.insert("domain".to_string(), Value::from(intent.domain.clone()));
                    metadata.insert("stack".to_string(), Value::from(intent.stack.clone()));
                    Fingerprint {
                        id,
                        scope,
                        text,
                        metadata: Value::Object(metadata),
                    }
                }
            }
        }
    }

    // -- Lookup --------------------------------------------------------------

    async fn lookup(&self, fp: &Fingerprint) -> Result<LookupOutcome, EngramError> {
        self.emitter.emit(
            StepEvent::new(StepKind::CacheCheckStart).with_user_intention(fp.text.clone()),
        );

        let embedding = match self.embeddings.embed_query(&fp.text).await {
            Ok(embedding) => embedding,
            Err(e) => return self.lookup_failure(e, None),
        };

        if self.config.cache_mode == CacheMode::Refresh {
            tracing::debug!(id = %fp.id, "cache read bypassed (refresh mode)");
            self.emit_miss(fp);
            return Ok(LookupOutcome {
                embedding: Some(embedding),
                hit: None,
            });
        }

        let candidates = match self.index.query(&embedding, DEFAULT_TOP_K).await {
            Ok(candidates) => candidates,
            Err(e) => return self.lookup_failure(e, Some(embedding)),
        };

        let Some(candidate) = select_candidate(&candidates, self.config.threshold, &fp.scope)
        else {
            self.emit_miss(fp);
            return Ok(LookupOutcome {
                embedding: Some(embedding),
                hit: None,
            });
        };

        let payload = match self.store.get(&candidate.id).await {
            Ok(payload) => payload,
            Err(e) => return self.lookup_failure(e, Some(embedding)),
        };

        match payload {
            Some(payload) => {
                tracing::debug!(id = %candidate.id, score = candidate.score, "cache hit");
                self.emitter.emit(
                    StepEvent::new(StepKind::CacheHit)
                        .with_user_intention(fp.text.clone())
                        .with_cache_score(candidate.score),
                );
                Ok(LookupOutcome {
                    embedding: Some(embedding),
                    hit: Some(CacheHit {
                        id: candidate.id.clone(),
                        payload,
                    }),
                })
            }
            None => {
                // Dangling vector entry: the payload expired or never landed.
                tracing::debug!(id = %candidate.id, "dangling vector entry, treating as miss");
                self.emit_miss(fp);
                Ok(LookupOutcome {
                    embedding: Some(embedding),
                    hit: None,
                })
            }
        }
    }

    fn emit_miss(&self, fp: &Fingerprint) {
        self.emitter
            .emit(StepEvent::new(StepKind::CacheMiss).with_user_intention(fp.text.clone()));
    }

    fn lookup_failure(
        &self,
        error: EngramError,
        embedding: Option<Vec<f32>>,
    ) -> Result<LookupOutcome, EngramError> {
        match self.config.failure_mode {
            FailureMode::FailClosed => Err(error),
            FailureMode::FailOpen => {
                tracing::warn!(error = %error, "cache lookup failed, downgrading to live call");
                self.emitter.emit(
                    StepEvent::new(StepKind::CacheMiss).with_error(error.to_string()),
                );
                Ok(LookupOutcome {
                    embedding,
                    hit: None,
                })
            }
        }
    }

    fn write_back(&self, fp: &Fingerprint, embedding: Vec<f32>) -> WriteBack {
        WriteBack {
            store: self.store.clone(),
            index: self.index.clone(),
            id: fp.id.clone(),
            embedding,
            metadata: fp.metadata.clone(),
            ttl_secs: self.config.ttl_secs,
            emitter: self.emitter.clone(),
        }
    }
}

#[async_trait]
impl ModelMiddleware for CacheMiddleware {
    async fn wrap_generate(
        &self,
        options: CallOptions,
        next: &dyn GenerateCaller,
    ) -> Result<GenerateResult, EngramError> {
        let fp = self.fingerprint(&options).await;
        let outcome = self.lookup(&fp).await?;

        if let Some(hit) = &outcome.hit {
            match serde_json::from_value::<GenerateResult>(hit.payload.clone()) {
                Ok(result) => return Ok(result),
                Err(e) => {
                    tracing::warn!(id = %hit.id, error = %e, "unreadable cached payload, falling through to live call");
                }
            }
        }

        self.emitter.emit(StepEvent::new(StepKind::GenerationStart));
        let result = next.call(options).await?;
        self.emitter.emit(StepEvent::new(StepKind::GenerationComplete));

        if let Some(embedding) = outcome.embedding {
            match serde_json::to_value(&result) {
                Ok(payload) => self.write_back(&fp, embedding).run(payload).await,
                Err(e) => {
                    tracing::warn!(id = %fp.id, error = %e, "unserializable provider result, skipping write-back");
                }
            }
        }

        Ok(result)
    }

    async fn wrap_stream(
        &self,
        options: CallOptions,
        next: &dyn StreamCaller,
    ) -> Result<StreamResponse, EngramError> {
        let fp = self.fingerprint(&options).await;
        let outcome = self.lookup(&fp).await?;

        if let Some(hit) = &outcome.hit {
            if let Some(parts) = payload_stream_parts(&hit.payload, &hit.id) {
                return Ok(StreamResponse::new(replay_stream(
                    parts,
                    self.config.simulate_stream,
                )));
            }
        }

        self.emitter.emit(StepEvent::new(StepKind::GenerationStart));
        let response = next.call(options).await?;

        let write_back = outcome
            .embedding
            .map(|embedding| self.write_back(&fp, embedding));
        Ok(StreamResponse::new(capture_stream(
            response.stream,
            self.emitter.clone(),
            write_back,
        )))
    }
}

// ---------------------------------------------------------------------------
// SemanticMemory / IntentMemory
// ---------------------------------------------------------------------------

macro_rules! memory_operations {
    () => {
        /// Stream a text completion through the cache.
        pub async fn stream_text(
            &self,
            options: CallOptions,
        ) -> Result<StreamResponse, EngramError> {
            self.wrapped.stream(options).await
        }

        /// Generate a text completion through the cache.
        pub async fn generate_text(
            &self,
            options: CallOptions,
        ) -> Result<GenerateResult, EngramError> {
            self.wrapped.generate(options).await
        }

        /// Stream a structured-object completion through the cache.
        pub async fn stream_object(
            &self,
            options: CallOptions,
        ) -> Result<StreamResponse, EngramError> {
            self.wrapped.stream(options).await
        }

        /// Generate a structured-object completion through the cache.
        pub async fn generate_object(
            &self,
            options: CallOptions,
        ) -> Result<GenerateResult, EngramError> {
            self.wrapped.generate(options).await
        }
    };
}

/// A provider model wrapped with the prompt-similarity cache.
pub struct SemanticMemory {
    wrapped: WrappedModel,
}

impl std::fmt::Debug for SemanticMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemanticMemory").finish_non_exhaustive()
    }
}

impl SemanticMemory {
    pub fn builder(model: Arc<dyn LanguageModel>) -> SemanticMemoryBuilder {
        SemanticMemoryBuilder {
            model,
            embeddings: None,
            index: None,
            store: None,
            config: MemoryConfig::new(),
        }
    }

    memory_operations!();
}

pub struct SemanticMemoryBuilder {
    model: Arc<dyn LanguageModel>,
    embeddings: Option<Arc<dyn Embeddings>>,
    index: Option<Arc<dyn VectorIndex>>,
    store: Option<Arc<dyn PayloadStore>>,
    config: MemoryConfig,
}

impl SemanticMemoryBuilder {
    pub fn embeddings(mut self, embeddings: Arc<dyn Embeddings>) -> Self {
        self.embeddings = Some(embeddings);
        self
    }

    pub fn index(mut self, index: Arc<dyn VectorIndex>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn store(mut self, store: Arc<dyn PayloadStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(mut self, config: MemoryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<SemanticMemory, EngramError> {
        let (embeddings, index, store) =
            require_backends(self.embeddings, self.index, self.store)?;
        let middleware = CacheMiddleware::semantic(embeddings, index, store, self.config)?;
        Ok(SemanticMemory {
            wrapped: WrappedModel::new(self.model, Arc::new(middleware)),
        })
    }
}

/// A provider model wrapped with the intent-similarity cache.
pub struct IntentMemory {
    wrapped: WrappedModel,
}

impl IntentMemory {
    pub fn builder(model: Arc<dyn LanguageModel>) -> IntentMemoryBuilder {
        IntentMemoryBuilder {
            model,
            extractor_model: None,
            embeddings: None,
            index: None,
            store: None,
            config: MemoryConfig::new(),
        }
    }

    memory_operations!();
}

pub struct IntentMemoryBuilder {
    model: Arc<dyn LanguageModel>,
    extractor_model: Option<Arc<dyn LanguageModel>>,
    embeddings: Option<Arc<dyn Embeddings>>,
    index: Option<Arc<dyn VectorIndex>>,
    store: Option<Arc<dyn PayloadStore>>,
    config: MemoryConfig,
}

impl IntentMemoryBuilder {
    pub fn extractor_model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.extractor_model = Some(model);
        self
    }

    pub fn embeddings(mut self, embeddings: Arc<dyn Embeddings>) -> Self {
        self.embeddings = Some(embeddings);
        self
    }

    pub fn index(mut self, index: Arc<dyn VectorIndex>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn store(mut self, store: Arc<dyn PayloadStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(mut self, config: MemoryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<IntentMemory, EngramError> {
        let (embeddings, index, store) =
            require_backends(self.embeddings, self.index, self.store)?;
        let extractor_model = self.extractor_model.ok_or_else(|| {
            EngramError::Config("intent memory requires an extractor model".to_string())
        })?;
        let middleware =
            CacheMiddleware::intent(embeddings, index, store, self.config, extractor_model)?;
        Ok(IntentMemory {
            wrapped: WrappedModel::new(self.model, Arc::new(middleware)),
        })
    }
}

#[allow(clippy::type_complexity)]
fn require_backends(
    embeddings: Option<Arc<dyn Embeddings>>,
    index: Option<Arc<dyn VectorIndex>>,
    store: Option<Arc<dyn PayloadStore>>,
) -> Result<(Arc<dyn Embeddings>, Arc<dyn VectorIndex>, Arc<dyn PayloadStore>), EngramError> {
    let mut missing = Vec::new();
    if embeddings.is_none() {
        missing.push("embedding model");
    }
    if index.is_none() {
        missing.push("vector index");
    }
    if store.is_none() {
        missing.push("payload store");
    }
    if !missing.is_empty() {
        return Err(EngramError::Config(format!(
            "missing required backends: {}",
            missing.join(", ")
        )));
    }
    Ok((embeddings.unwrap(), index.unwrap(), store.unwrap()))
}
