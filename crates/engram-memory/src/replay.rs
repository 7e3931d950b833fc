use std::time::Duration;

use engram_core::{ChunkStream, StreamChunk};
use serde_json::Value;

use crate::config::SimulateStream;

/// Reconstruct the chunk sequence recorded in a cached payload.
///
/// `streamParts` payloads replay as recorded (timestamps rehydrate through
/// serde). Legacy `{text, id?, usage?}` payloads synthesize a minimal
/// start/delta/finish sequence, using `fallback_id` when the stored shape
/// lacks an id. Any other shape returns `None` and the caller falls through
/// to the live path.
pub(crate) fn payload_stream_parts(payload: &Value, fallback_id: &str) -> Option<Vec<StreamChunk>> {
    if let Some(parts) = payload.get("streamParts") {
        return match serde_json::from_value::<Vec<StreamChunk>>(parts.clone()) {
            Ok(parts) => Some(parts),
            Err(e) => {
                tracing::warn!(error = %e, "unreadable streamParts payload, treating as miss");
                None
            }
        };
    }

    let text = payload.get("text")?.as_str()?.to_string();
    let id = payload
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or(fallback_id)
        .to_string();
    let usage = payload
        .get("usage")
        .and_then(|u| serde_json::from_value(u.clone()).ok());

    Some(vec![
        StreamChunk::text_start(id.clone()),
        StreamChunk::text_delta(id, text),
        StreamChunk::finish("stop", usage),
    ])
}

/// Emit `parts` as a lazy stream, paced like a live token stream when
/// simulation is enabled. The stream ends after the last recorded chunk; no
/// terminator is synthesized.
pub(crate) fn replay_stream(parts: Vec<StreamChunk>, pacing: SimulateStream) -> ChunkStream {
    Box::pin(async_stream::stream! {
        let mut delay_ms = if pacing.enabled { pacing.initial_delay_ms } else { 0 };
        for part in parts {
            if delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            delay_ms = if pacing.enabled { pacing.chunk_delay_ms } else { 0 };
            yield Ok(part);
        }
    })
}
