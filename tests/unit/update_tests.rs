//! Unit tests for `session/update` payload decoding.

use serde_json::json;

use acp_bridge::acp::update::{
    ContentBlock, SessionNotification, SessionUpdate, ToolCallContent, ToolCallStatus,
};

#[test]
fn notification_params_decode() {
    let params = json!({
        "sessionId": "sess-1",
        "update": {
            "sessionUpdate": "agent_message_chunk",
            "content": {"type": "text", "text": "hi"}
        }
    });

    let notification: SessionNotification = serde_json::from_value(params).expect("decode");

    assert_eq!(notification.session_id, "sess-1");
    let SessionUpdate::AgentMessageChunk(chunk) = notification.update else {
        panic!("expected a message chunk");
    };
    assert_eq!(chunk.content, ContentBlock::text("hi"));
}

#[test]
fn unknown_variant_decodes_to_unknown() {
    let update: SessionUpdate =
        serde_json::from_value(json!({"sessionUpdate": "config_option_update", "value": 1}))
            .expect("decode");

    assert_eq!(update, SessionUpdate::Unknown);
    assert_eq!(update.label(), "unknown");
}

#[test]
fn tool_call_content_variants_decode() {
    let update: SessionUpdate = serde_json::from_value(json!({
        "sessionUpdate": "tool_call",
        "toolCallId": "c1",
        "title": "Edit",
        "status": "in_progress",
        "content": [
            {"type": "diff", "path": "src/a.rs", "newText": "b", "oldText": "a"},
            {"type": "terminal", "terminalId": "term-1"},
            {"type": "content", "content": {"type": "text", "text": "done"}}
        ],
        "locations": [{"path": "src/a.rs", "line": 3}]
    }))
    .expect("decode");

    let SessionUpdate::ToolCall(call) = update else {
        panic!("expected tool call");
    };
    assert_eq!(call.status, Some(ToolCallStatus::InProgress));
    assert_eq!(call.content.len(), 3);
    assert!(matches!(
        &call.content[0],
        ToolCallContent::Diff { old_text: Some(old), .. } if old == "a"
    ));
    assert!(matches!(
        &call.content[1],
        ToolCallContent::Terminal { terminal_id } if terminal_id == "term-1"
    ));
    assert_eq!(call.locations[0].line, Some(3));
}

#[test]
fn content_text_extraction() {
    let cases = [
        (ContentBlock::text("plain"), "plain".to_owned()),
        (
            ContentBlock::ResourceLink {
                uri: "file:///x".into(),
                name: "x".into(),
                title: Some("The X".into()),
            },
            "The X".to_owned(),
        ),
        (
            ContentBlock::ResourceLink {
                uri: "file:///x".into(),
                name: "x".into(),
                title: None,
            },
            "x".to_owned(),
        ),
        (
            ContentBlock::Audio {
                mime_type: "audio/wav".into(),
                data: String::new(),
            },
            "[audio:audio/wav]".to_owned(),
        ),
        (
            ContentBlock::Resource {
                resource: json!({"uri": "mem://a", "text": "body"}),
            },
            json!({"uri": "mem://a", "text": "body"}).to_string(),
        ),
    ];

    for (block, expected) in cases {
        assert_eq!(block.extract_text(), expected);
    }
}

#[test]
fn text_block_serializes_with_type_tag() {
    let value = serde_json::to_value(ContentBlock::text("hello")).expect("serialize");

    assert_eq!(value, json!({"type": "text", "text": "hello"}));
}
