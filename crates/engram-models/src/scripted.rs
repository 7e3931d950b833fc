use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use engram_core::{
    CallOptions, EngramError, GenerateResult, LanguageModel, StreamChunk, StreamResponse,
};
use tokio::sync::Mutex;

/// A [`LanguageModel`] that replays pre-scripted results, for tests.
///
/// Generate calls pop from the queued results; stream calls pop a chunk
/// script and yield it as a stream. Exhausted queues produce a model error.
#[derive(Clone)]
pub struct ScriptedModel {
    results: Arc<Mutex<VecDeque<GenerateResult>>>,
    scripts: Arc<Mutex<VecDeque<Vec<Result<StreamChunk, EngramError>>>>>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self {
            results: Arc::new(Mutex::new(VecDeque::new())),
            scripts: Arc::new(Mutex::new(VecDeque::new())),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_results(results: Vec<GenerateResult>) -> Self {
        let model = Self::new();
        model
            .results
            .try_lock()
            .expect("not concurrent during setup")
            .extend(results);
        model
    }

    pub fn push_result(&self, result: GenerateResult) -> &Self {
        self.results
            .try_lock()
            .expect("not concurrent during setup")
            .push_back(result);
        self
    }

    /// Queue a stream script. Each entry becomes one `stream()` response.
    pub fn push_script(&self, chunks: Vec<StreamChunk>) -> &Self {
        self.scripts
            .try_lock()
            .expect("not concurrent during setup")
            .push_back(chunks.into_iter().map(Ok).collect());
        self
    }

    /// Queue a stream script that yields `chunks` and then an error.
    pub fn push_failing_script(&self, chunks: Vec<StreamChunk>, error: EngramError) -> &Self {
        let mut script: Vec<Result<StreamChunk, EngramError>> =
            chunks.into_iter().map(Ok).collect();
        script.push(Err(error));
        self.scripts
            .try_lock()
            .expect("not concurrent during setup")
            .push_back(script);
        self
    }

    /// How many times the provider was actually invoked.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedModel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn generate(&self, _options: CallOptions) -> Result<GenerateResult, EngramError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut results = self.results.lock().await;
        results
            .pop_front()
            .ok_or_else(|| EngramError::Model("scripted model exhausted results".to_string()))
    }

    async fn stream(&self, _options: CallOptions) -> Result<StreamResponse, EngramError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut scripts = self.scripts.lock().await;
        let script = scripts
            .pop_front()
            .ok_or_else(|| EngramError::Model("scripted model exhausted scripts".to_string()))?;
        Ok(StreamResponse::new(Box::pin(futures::stream::iter(script))))
    }
}
