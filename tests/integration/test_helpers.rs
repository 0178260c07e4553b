//! Shared fixtures: a scripted fake agent on the far side of a duplex pipe
//! and a listener that records what a transport reports.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{
    split, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf,
};
use tokio::sync::{mpsc, Notify};

use acp_bridge::acp::message::RawMessage;
use acp_bridge::acp::transport::TransportListener;
use acp_bridge::AppError;

/// Upper bound for any single wait in these tests.
pub const WAIT: Duration = Duration::from_secs(5);

/// Client half of the pipe: what a transport reads from and writes to.
pub struct ClientStreams {
    pub input: ReadHalf<DuplexStream>,
    pub output: WriteHalf<DuplexStream>,
}

/// Agent half of the pipe, driven line by line from a test.
pub struct FakeAgent {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
}

impl FakeAgent {
    /// A connected agent/client pair.
    pub fn pair() -> (Self, ClientStreams) {
        Self::pair_with_capacity(1 << 16)
    }

    /// A pair whose pipe buffers at most `capacity` bytes per direction.
    pub fn pair_with_capacity(capacity: usize) -> (Self, ClientStreams) {
        let (client, agent) = tokio::io::duplex(capacity);
        let (client_input, client_output) = split(client);
        let (agent_input, agent_output) = split(agent);
        (
            Self {
                lines: BufReader::new(agent_input).lines(),
                writer: agent_output,
            },
            ClientStreams {
                input: client_input,
                output: client_output,
            },
        )
    }

    /// Next JSON message written by the client, or `None` at EOF.
    pub async fn try_recv(&mut self) -> Option<Value> {
        let line = tokio::time::timeout(WAIT, self.lines.next_line())
            .await
            .expect("client message in time")
            .expect("readable pipe")?;
        Some(serde_json::from_str(&line).expect("client writes valid JSON"))
    }

    /// Next JSON message written by the client.
    pub async fn recv(&mut self) -> Value {
        self.try_recv().await.expect("client message")
    }

    /// Next message, asserting it is a request for `method`.
    pub async fn expect_request(&mut self, method: &str) -> Value {
        let message = self.recv().await;
        assert_eq!(message["jsonrpc"], "2.0");
        assert_eq!(message["method"], method, "unexpected message {message}");
        assert!(message.get("id").is_some(), "{method} must be a request");
        message
    }

    /// Write a raw line.
    pub async fn send_line(&mut self, line: &str) {
        self.send_bytes(format!("{line}\n").as_bytes()).await;
    }

    /// Write raw bytes, terminator included by the caller.
    pub async fn send_bytes(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.expect("write to client");
    }

    /// Write one JSON message.
    pub async fn send(&mut self, message: Value) {
        self.send_line(&message.to_string()).await;
    }

    /// Answer request `request` with `result`.
    pub async fn respond(&mut self, request: &Value, result: Value) {
        self.send(json!({"jsonrpc": "2.0", "id": request["id"], "result": result}))
            .await;
    }

    /// Answer request `request` with an error object.
    pub async fn respond_error(&mut self, request: &Value, code: i64, message: &str) {
        self.send(json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "error": {"code": code, "message": message}
        }))
        .await;
    }

    /// Stream one `session/update`.
    pub async fn update(&mut self, session_id: &str, update: Value) {
        self.send(json!({
            "jsonrpc": "2.0",
            "method": "session/update",
            "params": {"sessionId": session_id, "update": update}
        }))
        .await;
    }

    /// Stream a text chunk of kind `tag`.
    pub async fn chunk(&mut self, session_id: &str, tag: &str, text: &str) {
        self.update(
            session_id,
            json!({"sessionUpdate": tag, "content": {"type": "text", "text": text}}),
        )
        .await;
    }

    /// Answer `initialize` and `session/new`, returning the session/new params.
    pub async fn handshake(&mut self, session_id: &str) -> Value {
        let init = self.expect_request("initialize").await;
        self.respond(&init, json!({"protocolVersion": 1, "agentCapabilities": {}}))
            .await;
        let new_session = self.expect_request("session/new").await;
        self.respond(&new_session, json!({"sessionId": session_id}))
            .await;
        new_session["params"].clone()
    }

    /// Wait for the client's next `session/prompt` and return it.
    pub async fn expect_prompt(&mut self) -> Value {
        self.expect_request("session/prompt").await
    }

    /// Prompt text of a `session/prompt` request.
    pub fn prompt_text(request: &Value) -> String {
        request["params"]["prompt"]
            .as_array()
            .expect("prompt blocks")
            .iter()
            .filter_map(|block| block["text"].as_str())
            .collect()
    }
}

/// [`TransportListener`] that records every callback.
#[derive(Default)]
pub struct RecordingListener {
    messages: Mutex<Vec<RawMessage>>,
    errors: Mutex<Vec<AppError>>,
    closes: AtomicUsize,
    arrived: Notify,
    closed: Notify,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messages(&self) -> Vec<RawMessage> {
        self.messages.lock().expect("lock").clone()
    }

    pub fn errors(&self) -> Vec<AppError> {
        self.errors.lock().expect("lock").clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` messages arrived.
    pub async fn wait_for_messages(&self, count: usize) -> Vec<RawMessage> {
        tokio::time::timeout(WAIT, async {
            loop {
                let notified = self.arrived.notified();
                let messages = self.messages();
                if messages.len() >= count {
                    return messages;
                }
                notified.await;
            }
        })
        .await
        .expect("messages in time")
    }

    /// Wait for the close hook.
    pub async fn wait_closed(&self) {
        tokio::time::timeout(WAIT, async {
            loop {
                let notified = self.closed.notified();
                if self.close_count() > 0 {
                    return;
                }
                notified.await;
            }
        })
        .await
        .expect("closed in time");
    }
}

impl TransportListener for RecordingListener {
    fn on_message(&self, message: RawMessage) {
        self.messages.lock().expect("lock").push(message);
        self.arrived.notify_waiters();
    }

    fn on_error(&self, error: &AppError) {
        self.errors.lock().expect("lock").push(error.clone());
    }

    fn on_close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.notify_waiters();
    }
}

/// Forwards fake agents created by a connector to the test body.
pub type AgentInbox = mpsc::UnboundedReceiver<FakeAgent>;
