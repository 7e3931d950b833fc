use std::sync::Arc;

use engram_core::{
    CallMessage, CallOptions, EngramError, ExtractedIntent, LanguageModel, StepEvent, StepKind,
};

use crate::config::DEFAULT_WINDOW_SIZE;
use crate::steps::StepEmitter;

/// Built-in instructions for the intent-extractor model.
pub const DEFAULT_EXTRACTOR_INSTRUCTIONS: &str = "\
You extract the underlying intent from a conversation. Reply with a single \
JSON object of the shape {\"intent\": string, \"domain\": string[], \
\"stack\": string[], \"goal\": string, \"constraints\": string[]} and \
nothing else. Summarize what the user wants in \"intent\", name the problem \
areas in \"domain\", the technologies involved in \"stack\", the concrete \
outcome in \"goal\", and any hard requirements in \"constraints\".";

/// Extracts a structured intent from a sliding window over the conversation
/// by asking a small LLM.
///
/// Extraction never errors outward: every failure falls back to the last
/// message's text standing in for both intent and goal.
pub struct IntentExtractor {
    model: Arc<dyn LanguageModel>,
    window_size: usize,
    instructions: String,
}

impl IntentExtractor {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self {
            model,
            window_size: DEFAULT_WINDOW_SIZE,
            instructions: DEFAULT_EXTRACTOR_INSTRUCTIONS.to_string(),
        }
    }

    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = window_size;
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub(crate) async fn extract(
        &self,
        messages: &[CallMessage],
        emitter: &StepEmitter,
    ) -> ExtractedIntent {
        let last = messages
            .last()
            .map(CallMessage::content_text)
            .unwrap_or_default();

        match self.try_extract(messages).await {
            Ok(intent) => {
                emitter.emit(
                    StepEvent::new(StepKind::IntentExtractionComplete)
                        .with_user_intention(last)
                        .with_extracted_intent(intent.clone()),
                );
                intent
            }
            Err(e) => {
                emitter.emit(
                    StepEvent::new(StepKind::IntentExtractionError)
                        .with_user_intention(last.clone())
                        .with_error(e.to_string()),
                );
                ExtractedIntent::from_text(last)
            }
        }
    }

    async fn try_extract(&self, messages: &[CallMessage]) -> Result<ExtractedIntent, EngramError> {
        let options = CallOptions::new("intent-extractor")
            .with_system(self.instructions.clone())
            .with_prompt(format_window(messages, self.window_size))
            .with_temperature(0.1);

        let result = self.model.generate(options).await?;
        let text = result.text.unwrap_or_default();
        let json = extract_json_object(&text).ok_or_else(|| {
            EngramError::Extraction("no JSON object in extractor reply".to_string())
        })?;
        serde_json::from_str(json)
            .map_err(|e| EngramError::Extraction(format!("malformed intent JSON: {e}")))
    }
}

/// Format the trailing `window_size` messages as `role: content` lines.
fn format_window(messages: &[CallMessage], window_size: usize) -> String {
    let start = messages.len().saturating_sub(window_size);
    messages[start..]
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content_text()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// The first brace-delimited substring of `text`, if any.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&text[start..=end])
}
