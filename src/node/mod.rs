//! Generic dataflow node abstraction.
//!
//! A node consumes [`NodeEvent`]s one at a time and emits named [`Output`]s
//! with optional [`Metadata`]. The runtime that moves events between nodes is
//! outside this crate's concern: nodes only see a [`NodeIo`] pair, which may be
//! backed by the in-process [`crate::dataflow`] router or by the
//! newline-delimited JSON bridge in [`stdio`].

pub mod stdio;

use crate::error::{HarnessError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// Default event channel capacity for a node inbox.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Port every node writes its final shutdown line to.
pub const LOG_PORT: &str = "log";

/// Port every node writes JSON status objects to.
pub const STATUS_PORT: &str = "status";

/// A value carried on a port.
#[derive(Debug, Clone, PartialEq)]
pub enum PortValue {
    /// UTF-8 text.
    Text(String),
    /// Opaque binary payload (synthesized audio).
    Bytes(Bytes),
    /// Arbitrary JSON (null when a port carries no value).
    Json(serde_json::Value),
}

impl PortValue {
    /// Interpret the value as text.
    ///
    /// JSON strings are unwrapped and JSON null reads as the empty string.
    /// Non-UTF-8 bytes and structured JSON are rejected.
    pub fn as_text(&self) -> Result<String> {
        match self {
            Self::Text(text) => Ok(text.clone()),
            Self::Bytes(bytes) => String::from_utf8(bytes.to_vec())
                .map_err(|e| HarnessError::Input(format!("payload is not UTF-8: {e}"))),
            Self::Json(serde_json::Value::String(s)) => Ok(s.clone()),
            Self::Json(serde_json::Value::Null) => Ok(String::new()),
            Self::Json(other) => Err(HarnessError::Input(format!(
                "expected text, got JSON {other}"
            ))),
        }
    }

    /// Byte length of the payload as it would travel on the wire.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Bytes(bytes) => bytes.len(),
            Self::Json(value) => value.to_string().len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<&str> for PortValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for PortValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Bytes> for PortValue {
    fn from(value: Bytes) -> Self {
        Self::Bytes(value)
    }
}

impl From<serde_json::Value> for PortValue {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

/// Free-form key/value metadata attached to an input or output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(serde_json::Map<String, serde_json::Value>);

impl Metadata {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.0.insert(key.to_owned(), value.into());
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    /// Read a boolean flag. Missing or non-boolean values read as `false`;
    /// the strings `"true"`/`"false"` are accepted for loosely-typed runtimes.
    #[must_use]
    pub fn flag(&self, key: &str) -> bool {
        match self.0.get(key) {
            Some(serde_json::Value::Bool(b)) => *b,
            Some(serde_json::Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    #[must_use]
    pub fn streaming(&self) -> bool {
        self.flag("streaming")
    }

    #[must_use]
    pub fn complete(&self) -> bool {
        self.flag("complete")
    }

    #[must_use]
    pub fn index(&self) -> Option<u64> {
        self.0.get("index").and_then(serde_json::Value::as_u64)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// An input arriving on a named port.
#[derive(Debug, Clone, PartialEq)]
pub struct InputEvent {
    pub id: String,
    pub value: PortValue,
    pub metadata: Metadata,
}

impl InputEvent {
    #[must_use]
    pub fn new(id: impl Into<String>, value: impl Into<PortValue>, metadata: Metadata) -> Self {
        Self {
            id: id.into(),
            value: value.into(),
            metadata,
        }
    }

    /// Read the value as text, falling back to the empty string on a
    /// malformed payload. The failure is logged and never propagated.
    #[must_use]
    pub fn text_or_empty(&self, node: &str) -> String {
        match self.value.as_text() {
            Ok(text) => text,
            Err(e) => {
                warn!(node, port = %self.id, "malformed input, using empty text: {e}");
                String::new()
            }
        }
    }
}

/// Events delivered to a node by the runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    Input(InputEvent),
    /// Terminate the node; it emits its shutdown log and returns.
    Stop,
    /// Upstream runtime error. Logged, never fatal.
    Error(String),
}

/// A named, typed output emitted by a node.
#[derive(Debug, Clone, PartialEq)]
pub struct Output {
    pub port: String,
    pub value: PortValue,
    pub metadata: Metadata,
}

impl Output {
    /// Parse a JSON status payload, if this output carries one.
    #[must_use]
    pub fn status(&self) -> Option<serde_json::Value> {
        if self.port != STATUS_PORT {
            return None;
        }
        let text = self.value.as_text().ok()?;
        serde_json::from_str(&text).ok()
    }
}

/// Sending half of a node's output stream.
#[derive(Debug, Clone)]
pub struct OutputSender {
    node: Arc<str>,
    tx: mpsc::UnboundedSender<Output>,
}

impl OutputSender {
    #[must_use]
    pub fn node_name(&self) -> &str {
        &self.node
    }

    /// Emit `value` on `port`.
    pub fn send(&self, port: &str, value: impl Into<PortValue>, metadata: Metadata) -> Result<()> {
        self.tx
            .send(Output {
                port: port.to_owned(),
                value: value.into(),
                metadata,
            })
            .map_err(|e| {
                HarnessError::Channel(format!("{} output channel closed: {e}", self.node))
            })
    }

    /// Emit plain text with no metadata.
    pub fn send_text(&self, port: &str, text: impl Into<String>) -> Result<()> {
        self.send(port, PortValue::Text(text.into()), Metadata::new())
    }

    /// Emit a JSON object on the `status` port, serialized as text.
    pub fn send_status(&self, status: serde_json::Value) -> Result<()> {
        self.send_text(STATUS_PORT, status.to_string())
    }
}

/// The node-side end of a runtime connection.
#[derive(Debug)]
pub struct NodeIo {
    events: mpsc::Receiver<NodeEvent>,
    outputs: OutputSender,
}

impl NodeIo {
    /// Receive the next event. `None` means the runtime hung up, which nodes
    /// treat the same as [`NodeEvent::Stop`].
    pub async fn recv(&mut self) -> Option<NodeEvent> {
        self.events.recv().await
    }

    #[must_use]
    pub fn outputs(&self) -> &OutputSender {
        &self.outputs
    }
}

/// Cloneable sender for delivering events into a node.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<NodeEvent>,
}

impl EventSender {
    pub async fn send(&self, event: NodeEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|e| HarnessError::Channel(format!("node inbox closed: {e}")))
    }

    pub async fn input(
        &self,
        id: &str,
        value: impl Into<PortValue>,
        metadata: Metadata,
    ) -> Result<()> {
        self.send(NodeEvent::Input(InputEvent::new(id, value, metadata)))
            .await
    }

    pub async fn stop(&self) -> Result<()> {
        self.send(NodeEvent::Stop).await
    }
}

/// The runtime-side end of a node connection.
#[derive(Debug)]
pub struct NodeHandle {
    events: EventSender,
    outputs: mpsc::UnboundedReceiver<Output>,
}

impl NodeHandle {
    pub async fn input(
        &self,
        id: &str,
        value: impl Into<PortValue>,
        metadata: Metadata,
    ) -> Result<()> {
        self.events.input(id, value, metadata).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.events.stop().await
    }

    pub async fn recv_output(&mut self) -> Option<Output> {
        self.outputs.recv().await
    }

    pub fn try_recv_output(&mut self) -> Option<Output> {
        self.outputs.try_recv().ok()
    }

    /// Split into the event sender and the output receiver.
    #[must_use]
    pub fn split(self) -> (EventSender, mpsc::UnboundedReceiver<Output>) {
        (self.events, self.outputs)
    }
}

/// Create a connected runtime/node pair.
#[must_use]
pub fn node_channel(name: &str, event_capacity: usize) -> (NodeHandle, NodeIo) {
    let (event_tx, event_rx) = mpsc::channel(event_capacity.max(1));
    let (output_tx, output_rx) = mpsc::unbounded_channel();
    (
        NodeHandle {
            events: EventSender { tx: event_tx },
            outputs: output_rx,
        },
        NodeIo {
            events: event_rx,
            outputs: OutputSender {
                node: Arc::from(name),
                tx: output_tx,
            },
        },
    )
}

/// A harness component that runs as an event loop over a [`NodeIo`].
#[async_trait]
pub trait Node: Send {
    /// Node name used in logs and shutdown lines.
    fn name(&self) -> &str;

    /// Run until a stop event arrives or the runtime hangs up.
    async fn run(self: Box<Self>, io: NodeIo) -> Result<()>;
}

/// Emit the final `log` line every node writes on shutdown.
pub(crate) fn send_shutdown_log(outputs: &OutputSender, tag: &str) {
    if let Err(e) = outputs.send_text(LOG_PORT, format!("[{tag}] Shutdown complete")) {
        tracing::debug!(node = outputs.node_name(), "shutdown log dropped: {e}");
    }
}

/// Sleep until `deadline`, or forever when there is none.
///
/// Used as a `select!` branch next to [`NodeIo::recv`] so timers stay
/// cancellable by incoming events.
pub(crate) async fn sleep_until_deadline(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Log a failed emit without interrupting the event loop.
pub(crate) fn log_send_error(outputs: &OutputSender, result: Result<()>) {
    if let Err(e) = result {
        warn!(node = outputs.node_name(), "failed to emit output: {e}");
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn text_value_reads_as_text() {
        assert_eq!(PortValue::from("hi").as_text().unwrap(), "hi");
    }

    #[test]
    fn json_null_reads_as_empty_text() {
        let value = PortValue::Json(serde_json::Value::Null);
        assert_eq!(value.as_text().unwrap(), "");
    }

    #[test]
    fn invalid_utf8_bytes_are_rejected() {
        let value = PortValue::Bytes(Bytes::from_static(&[0xff, 0xfe]));
        assert!(value.as_text().is_err());
    }

    #[test]
    fn structured_json_falls_back_to_empty_text() {
        let event = InputEvent::new("text", serde_json::json!({"a": 1}), Metadata::new());
        assert_eq!(event.text_or_empty("test"), "");
    }

    #[test]
    fn metadata_flags_default_to_false() {
        let meta = Metadata::new();
        assert!(!meta.streaming());
        assert!(!meta.complete());
        assert_eq!(meta.index(), None);
    }

    #[test]
    fn metadata_accepts_string_booleans() {
        let meta = Metadata::new().with("streaming", "true").with("index", 3);
        assert!(meta.streaming());
        assert_eq!(meta.index(), Some(3));
    }

    #[test]
    fn status_output_parses_json() {
        let output = Output {
            port: STATUS_PORT.to_owned(),
            value: PortValue::Text(r#"{"status":"ok"}"#.to_owned()),
            metadata: Metadata::new(),
        };
        assert_eq!(output.status().unwrap()["status"], "ok");
    }

    #[tokio::test]
    async fn node_channel_round_trips_events_and_outputs() {
        let (mut handle, mut io) = node_channel("probe", 4);
        handle.input("text", "hello", Metadata::new()).await.unwrap();

        let event = io.recv().await.unwrap();
        let NodeEvent::Input(input) = event else {
            panic!("expected input event");
        };
        assert_eq!(input.id, "text");

        io.outputs().send_text("echo", "hello").unwrap();
        let out = handle.recv_output().await.unwrap();
        assert_eq!(out.port, "echo");
        assert_eq!(out.value, PortValue::Text("hello".to_owned()));
    }
}
