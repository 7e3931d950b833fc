use engram_core::{CallOptions, ExtractedIntent};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Id prefix for entries keyed by prompt similarity.
pub const PROMPT_ID_PREFIX: &str = "llm:";
/// Id prefix for entries keyed by extracted intent.
pub const INTENT_ID_PREFIX: &str = "intent:";
/// Expiry of write-back locks, so a crashed writer self-heals.
pub const LOCK_TTL_SECS: u64 = 15;

/// Hex-encoded SHA-256 digest of a string.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
}

/// Normalize cache input text: trim, lowercase, collapse whitespace runs to
/// single ASCII spaces. Idempotent.
pub fn normalize(text: &str) -> String {
    text.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// The provider-visible request parameters that must match exactly for a
/// cache hit. Two calls share a scope iff all four fields are byte-equal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub llm_model: String,
    pub system_hash: String,
    pub params_hash: String,
    pub tools_hash: String,
}

impl Scope {
    /// Derive the scope tuple from a call's options.
    pub fn of(options: &CallOptions) -> Self {
        let system_hash = sha256_hex(options.system.as_deref().unwrap_or(""));

        // serde_json objects serialize with sorted keys, so the hashes below
        // are over canonical JSON.
        let mut params = Map::new();
        if let Some(temperature) = options.temperature {
            params.insert("temperature".to_string(), Value::from(temperature));
        }
        if let Some(top_p) = options.top_p {
            params.insert("topP".to_string(), Value::from(top_p));
        }
        let params_hash = sha256_hex(&Value::Object(params).to_string());

        let tools = options
            .tools
            .clone()
            .unwrap_or_else(|| Value::Object(Map::new()));
        let tools_hash = sha256_hex(&tools.to_string());

        Self {
            llm_model: options.model_id.clone(),
            system_hash,
            params_hash,
            tools_hash,
        }
    }

    /// The scope fields as index-entry metadata.
    pub fn metadata_fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("llmModel".to_string(), Value::String(self.llm_model.clone()));
        fields.insert("systemHash".to_string(), Value::String(self.system_hash.clone()));
        fields.insert("paramsHash".to_string(), Value::String(self.params_hash.clone()));
        fields.insert("toolsHash".to_string(), Value::String(self.tools_hash.clone()));
        fields
    }

    /// Whether candidate metadata carries exactly this scope. Scope is never
    /// approximated: all four fields must be string-equal.
    pub fn matches_metadata(&self, metadata: &Value) -> bool {
        let field = |key: &str| metadata.get(key).and_then(Value::as_str);
        field("llmModel") == Some(self.llm_model.as_str())
            && field("systemHash") == Some(self.system_hash.as_str())
            && field("paramsHash") == Some(self.params_hash.as_str())
            && field("toolsHash") == Some(self.tools_hash.as_str())
    }

    fn joined(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.llm_model, self.system_hash, self.params_hash, self.tools_hash
        )
    }
}

// ---------------------------------------------------------------------------
// Cache input text
// ---------------------------------------------------------------------------

/// Derive the prompt-variant cache input text from a call.
///
/// Conversations fingerprint the last message (or the whole array when
/// `use_full_messages`) as `{role, content}` JSON; bare prompts are used
/// directly; calls with neither produce the empty string.
pub fn prompt_cache_text(options: &CallOptions, use_full_messages: bool) -> String {
    let raw = if !options.messages.is_empty() {
        if use_full_messages {
            serde_json::to_string(&options.messages).unwrap_or_default()
        } else {
            options
                .messages
                .last()
                .and_then(|m| serde_json::to_string(m).ok())
                .unwrap_or_default()
        }
    } else if let Some(prompt) = &options.prompt {
        prompt.clone()
    } else {
        String::new()
    };
    normalize(&raw)
}

/// Derive the intent-variant cache input text from an extracted intent:
/// goal, domains, stack and constraints joined with spaces, empties dropped.
pub fn intent_cache_text(intent: &ExtractedIntent) -> String {
    let parts: Vec<&str> = std::iter::once(intent.goal.as_str())
        .chain(intent.domain.iter().map(String::as_str))
        .chain(intent.stack.iter().map(String::as_str))
        .chain(intent.constraints.iter().map(String::as_str))
        .filter(|part| !part.trim().is_empty())
        .collect();
    normalize(&parts.join(" "))
}

// ---------------------------------------------------------------------------
// Composite id
// ---------------------------------------------------------------------------

/// The composite cache id: a pure function of `(scope, text)`.
pub fn composite_id(prefix: &str, scope: &Scope, text: &str) -> String {
    format!("{prefix}{}", sha256_hex(&format!("{}|{text}", scope.joined())))
}

/// The transient lock key guarding writes for `id`.
pub fn lock_key(id: &str) -> String {
    format!("lock:{id}")
}

/// Everything the lookup and write paths need to know about one request.
#[derive(Debug, Clone)]
pub struct Fingerprint {
    pub id: String,
    pub scope: Scope,
    pub text: String,
    pub metadata: Value,
}
