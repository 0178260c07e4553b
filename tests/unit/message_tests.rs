//! Unit tests for envelope classification and encoding.

use serde_json::{json, Value};

use acp_bridge::acp::message::{decode, encode, RawMessage, RequestId, ResponsePayload, RpcError};
use acp_bridge::AppError;

// ── Tag discrimination ───────────────────────────────────────────────────────

#[test]
fn id_and_result_is_a_response() {
    let msg = decode(r#"{"jsonrpc":"2.0","id":7,"result":{"sessionId":"s1"}}"#).expect("decode");

    assert_eq!(msg, RawMessage::result(RequestId::Number(7), json!({"sessionId": "s1"})));
}

#[test]
fn id_and_error_is_an_error_response() {
    let msg = decode(r#"{"id":"abc","error":{"code":-32601,"message":"nope"}}"#).expect("decode");

    let RawMessage::Response(response) = msg else {
        panic!("expected a response, got {msg:?}");
    };
    assert_eq!(response.id, RequestId::String("abc".into()));
    assert_eq!(
        response.payload,
        ResponsePayload::Error(RpcError::new(-32601, "nope"))
    );
}

#[test]
fn id_with_method_and_result_prefers_response() {
    let msg = decode(r#"{"id":1,"method":"x","result":1}"#).expect("decode");

    assert!(matches!(msg, RawMessage::Response(_)));
}

#[test]
fn id_and_method_is_a_request() {
    let msg = decode(r#"{"id":3,"method":"fs/read_text_file","params":{"path":"/tmp/a"}}"#)
        .expect("decode");

    assert_eq!(
        msg,
        RawMessage::request(3, "fs/read_text_file", Some(json!({"path": "/tmp/a"})))
    );
}

#[test]
fn method_without_id_is_a_notification() {
    let msg = decode(r#"{"method":"session/update"}"#).expect("decode");

    assert_eq!(msg, RawMessage::notification("session/update", None));
}

#[test]
fn null_result_is_still_a_response() {
    let msg = decode(r#"{"id":1,"result":null}"#).expect("decode");

    assert_eq!(msg, RawMessage::result(RequestId::Number(1), Value::Null));
}

#[test]
fn object_matching_no_tag_is_a_decode_error() {
    let err = decode(r#"{"id":1}"#).expect_err("no tag applies");

    assert!(matches!(err, AppError::Decode(msg) if msg.contains("unable to determine")));
}

#[test]
fn non_object_json_is_a_decode_error() {
    assert!(matches!(decode("42"), Err(AppError::Decode(_))));
    assert!(matches!(decode("[]"), Err(AppError::Decode(_))));
}

#[test]
fn garbage_without_brace_is_a_decode_error() {
    let err = decode("Starting agent...").expect_err("not json");

    assert!(matches!(err, AppError::Decode(msg) if msg.contains("malformed json")));
}

// ── Noise recovery ───────────────────────────────────────────────────────────

#[test]
fn prefixed_noise_decodes_like_the_suffix() {
    let clean = r#"{"id":2,"method":"session/prompt","params":{"sessionId":"s"}}"#;
    let noisy = format!("2024-01-01 INFO agent ready >>> {clean}");

    assert_eq!(decode(&noisy).expect("noisy"), decode(clean).expect("clean"));
}

#[test]
fn noise_with_unparseable_suffix_is_an_error() {
    assert!(matches!(decode("log { not json"), Err(AppError::Decode(_))));
}

// ── Encoding ─────────────────────────────────────────────────────────────────

#[test]
fn encoded_messages_decode_to_the_same_value() {
    let messages = [
        RawMessage::request(5, "session/new", Some(json!({"cwd": "/work", "mcpServers": []}))),
        RawMessage::request("req-1", "initialize", None),
        RawMessage::notification("session/cancel", Some(json!({"sessionId": "s"}))),
        RawMessage::result(RequestId::Number(9), json!({"stopReason": "end_turn"})),
        RawMessage::error(RequestId::Number(4), RpcError::new(-32603, "boom")),
    ];

    for message in messages {
        let line = encode(&message).expect("encode");
        assert_eq!(decode(&line).expect("decode"), message, "line: {line}");
    }
}

#[test]
fn encoded_line_has_no_raw_line_breaks() {
    let message = RawMessage::notification(
        "session/update",
        Some(json!({"text": "first line\nsecond line\r\nthird"})),
    );

    let line = encode(&message).expect("encode");

    assert!(!line.contains('\n'));
    assert!(!line.contains('\r'));
}

#[test]
fn encoded_envelope_carries_jsonrpc_version() {
    let line = encode(&RawMessage::notification("x", None)).expect("encode");
    let value: Value = serde_json::from_str(&line).expect("json");

    assert_eq!(value["jsonrpc"], "2.0");
    assert!(value.get("params").is_none());
}

#[test]
fn rpc_error_converts_to_app_error() {
    let err = AppError::from(RpcError::new(-32601, "Method not supported: x"));

    assert_eq!(
        err,
        AppError::Rpc {
            code: -32601,
            message: "Method not supported: x".into()
        }
    );
}
