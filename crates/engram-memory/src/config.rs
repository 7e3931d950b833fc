use engram_core::{EngramError, StepCallback};

pub const DEFAULT_THRESHOLD: f32 = 0.92;
pub const DEFAULT_TTL_SECS: u64 = 14 * 24 * 3600;
pub const DEFAULT_WINDOW_SIZE: usize = 5;

/// Whether lookups read the cache or only write it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Read the cache normally.
    #[default]
    Default,
    /// Always bypass the read path but still write back after the live call.
    Refresh,
}

/// What to do when the lookup path itself fails (embed, query, payload get).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureMode {
    /// Surface the error to the caller.
    #[default]
    FailClosed,
    /// Log the error and downgrade to a live call.
    FailOpen,
}

/// Pacing applied to replayed streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulateStream {
    pub enabled: bool,
    pub initial_delay_ms: u64,
    pub chunk_delay_ms: u64,
}

impl Default for SimulateStream {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_ms: 0,
            chunk_delay_ms: 10,
        }
    }
}

impl SimulateStream {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }
}

/// Configuration for a semantic or intent memory.
#[derive(Clone)]
pub struct MemoryConfig {
    pub threshold: f32,
    pub ttl_secs: u64,
    pub debug: bool,
    pub cache_mode: CacheMode,
    pub simulate_stream: SimulateStream,
    /// Prompt variant: fingerprint the whole conversation instead of only
    /// the last message.
    pub use_full_messages: bool,
    /// Intent variant: trailing messages fed to the extractor.
    pub window_size: usize,
    /// Intent variant: override the built-in extractor instructions.
    pub extractor_instructions: Option<String>,
    pub failure_mode: FailureMode,
    pub on_step: Option<StepCallback>,
}

impl MemoryConfig {
    pub fn new() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            ttl_secs: DEFAULT_TTL_SECS,
            debug: false,
            cache_mode: CacheMode::Default,
            simulate_stream: SimulateStream::default(),
            use_full_messages: false,
            window_size: DEFAULT_WINDOW_SIZE,
            extractor_instructions: None,
            failure_mode: FailureMode::FailClosed,
            on_step: None,
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_ttl_secs(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_cache_mode(mut self, mode: CacheMode) -> Self {
        self.cache_mode = mode;
        self
    }

    pub fn with_simulate_stream(mut self, simulate: SimulateStream) -> Self {
        self.simulate_stream = simulate;
        self
    }

    pub fn with_use_full_messages(mut self, use_full_messages: bool) -> Self {
        self.use_full_messages = use_full_messages;
        self
    }

    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = window_size;
        self
    }

    pub fn with_extractor_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.extractor_instructions = Some(instructions.into());
        self
    }

    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    pub fn with_on_step(mut self, callback: StepCallback) -> Self {
        self.on_step = Some(callback);
        self
    }

    /// Validate option values, reporting every problem at once.
    pub fn validate(&self) -> Result<(), EngramError> {
        let mut problems = Vec::new();
        if !(0.0..=1.0).contains(&self.threshold) {
            problems.push(format!(
                "threshold must be within [0, 1], got {}",
                self.threshold
            ));
        }
        if self.ttl_secs == 0 {
            problems.push("ttl must be positive".to_string());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(EngramError::Config(problems.join("; ")))
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConfig")
            .field("threshold", &self.threshold)
            .field("ttl_secs", &self.ttl_secs)
            .field("debug", &self.debug)
            .field("cache_mode", &self.cache_mode)
            .field("simulate_stream", &self.simulate_stream)
            .field("use_full_messages", &self.use_full_messages)
            .field("window_size", &self.window_size)
            .field("failure_mode", &self.failure_mode)
            .field("on_step", &self.on_step.as_ref().map(|_| "…"))
            .finish()
    }
}
