use chrono::{TimeZone, Utc};
use engram_core::{GenerateResult, StreamChunk, Usage};
use serde_json::json;

#[test]
fn text_delta_serializes_with_kebab_case_tag() {
    let chunk = StreamChunk::text_delta("t1", "hello");
    let value = serde_json::to_value(&chunk).unwrap();
    assert_eq!(value, json!({"type": "text-delta", "id": "t1", "delta": "hello"}));
}

#[test]
fn finish_uses_camel_case_fields() {
    let chunk = StreamChunk::finish(
        "stop",
        Some(Usage {
            input_tokens: 3,
            output_tokens: 7,
            total_tokens: 10,
        }),
    );
    let value = serde_json::to_value(&chunk).unwrap();
    assert_eq!(value["type"], "finish");
    assert_eq!(value["finishReason"], "stop");
    assert_eq!(value["usage"]["outputTokens"], 7);
}

#[test]
fn response_metadata_timestamp_round_trips() {
    let ts = Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap();
    let chunk = StreamChunk::ResponseMetadata {
        id: Some("resp-1".to_string()),
        model_id: None,
        timestamp: Some(ts),
    };

    let value = serde_json::to_value(&chunk).unwrap();
    // Stored form is a string; deserialization rehydrates the timestamp.
    assert!(value["timestamp"].is_string());

    let back: StreamChunk = serde_json::from_value(value).unwrap();
    match back {
        StreamChunk::ResponseMetadata { timestamp, .. } => assert_eq!(timestamp, Some(ts)),
        other => panic!("unexpected chunk: {other:?}"),
    }
}

#[test]
fn unknown_chunk_type_survives_round_trip() {
    let raw = json!({"type": "tool-call", "toolCallId": "c1", "input": {"x": 1}});
    let chunk: StreamChunk = serde_json::from_value(raw.clone()).unwrap();
    assert_eq!(chunk, StreamChunk::Other(raw.clone()));

    let back = serde_json::to_value(&chunk).unwrap();
    assert_eq!(back, raw);
}

#[test]
fn known_chunk_parses_from_stored_json() {
    let raw = json!({"type": "text-start", "id": "t1"});
    let chunk: StreamChunk = serde_json::from_value(raw).unwrap();
    assert_eq!(chunk, StreamChunk::text_start("t1"));
}

#[test]
fn generate_result_preserves_provider_private_fields() {
    let raw = json!({
        "text": "hi",
        "finishReason": "stop",
        "providerMetadata": {"internal": true}
    });
    let result: GenerateResult = serde_json::from_value(raw.clone()).unwrap();
    assert_eq!(result.text.as_deref(), Some("hi"));
    assert_eq!(result.extra["providerMetadata"], json!({"internal": true}));

    let back = serde_json::to_value(&result).unwrap();
    assert_eq!(back, raw);
}

#[test]
fn generate_result_response_timestamp_rehydrates() {
    let ts = Utc.with_ymd_and_hms(2024, 11, 2, 17, 0, 5).unwrap();
    let raw = json!({
        "text": "cached",
        "response": {"id": "r-9", "timestamp": ts.to_rfc3339()}
    });
    let result: GenerateResult = serde_json::from_value(raw).unwrap();
    assert_eq!(result.response.unwrap().timestamp, Some(ts));
}
