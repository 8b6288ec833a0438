//! Newline-delimited JSON bridge between a node and an external runtime.
//!
//! Each stdin line is one [`WireEvent`]; each output the node emits is
//! written to stdout as one [`WireOutput`] line. Binary payloads travel as
//! `{"base64": "..."}` objects.
//!
//! Stdout is exclusively reserved for the JSON protocol; all diagnostic
//! output (tracing, logs) must be routed to stderr.

use super::{
    EventSender, InputEvent, Metadata, Node, NodeEvent, Output, PortValue,
    DEFAULT_EVENT_CAPACITY, node_channel,
};
use crate::error::{HarnessError, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// One inbound line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireEvent {
    Input {
        id: String,
        #[serde(default)]
        value: WireValue,
        #[serde(default)]
        metadata: Metadata,
    },
    Stop,
    Error {
        message: String,
    },
}

/// A port value as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireValue {
    Binary { base64: String },
    Text(String),
    Json(serde_json::Value),
}

impl Default for WireValue {
    fn default() -> Self {
        Self::Json(serde_json::Value::Null)
    }
}

impl From<&PortValue> for WireValue {
    fn from(value: &PortValue) -> Self {
        match value {
            PortValue::Text(text) => Self::Text(text.clone()),
            PortValue::Bytes(bytes) => Self::Binary {
                base64: STANDARD.encode(bytes),
            },
            PortValue::Json(json) => Self::Json(json.clone()),
        }
    }
}

impl TryFrom<WireValue> for PortValue {
    type Error = HarnessError;

    fn try_from(value: WireValue) -> Result<Self> {
        match value {
            WireValue::Text(text) => Ok(Self::Text(text)),
            WireValue::Binary { base64 } => STANDARD
                .decode(base64.as_bytes())
                .map(|raw| Self::Bytes(Bytes::from(raw)))
                .map_err(|e| HarnessError::Input(format!("invalid base64 payload: {e}"))),
            WireValue::Json(json) => Ok(Self::Json(json)),
        }
    }
}

/// One outbound line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireOutput {
    pub port: String,
    pub value: WireValue,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

/// Parse one inbound line into a node event.
///
/// # Errors
///
/// Returns an error for malformed JSON or an undecodable binary payload.
pub fn decode_event(line: &str) -> Result<NodeEvent> {
    let event = match serde_json::from_str::<WireEvent>(line)? {
        WireEvent::Input {
            id,
            value,
            metadata,
        } => NodeEvent::Input(InputEvent {
            id,
            value: PortValue::try_from(value)?,
            metadata,
        }),
        WireEvent::Stop => NodeEvent::Stop,
        WireEvent::Error { message } => NodeEvent::Error(message),
    };
    Ok(event)
}

/// Serialize one output as a JSON line (without the newline).
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_output(output: &Output) -> Result<String> {
    let wire = WireOutput {
        port: output.port.clone(),
        value: WireValue::from(&output.value),
        metadata: output.metadata.clone(),
    };
    Ok(serde_json::to_string(&wire)?)
}

/// Run `node` over stdin/stdout until a stop line or stdin EOF.
///
/// # Errors
///
/// Returns an error if stdin/stdout fail or the node itself fails.
pub async fn run_stdio_node(node: Box<dyn Node>) -> Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    run_node_lines(node, stdin, stdout, DEFAULT_EVENT_CAPACITY).await?;
    Ok(())
}

/// Run `node` over an arbitrary line reader and writer, returning the writer
/// once the node has shut down and every output has been written.
///
/// # Errors
///
/// Returns an error if reading, writing or the node fails.
pub async fn run_node_lines<R, W>(
    node: Box<dyn Node>,
    reader: R,
    writer: W,
    event_capacity: usize,
) -> Result<W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let name = node.name().to_owned();
    let (handle, io) = node_channel(&name, event_capacity);
    let (events, outputs) = handle.split();
    let node_task = tokio::spawn(node.run(io));

    let (read_result, write_result) =
        tokio::join!(pump_events(reader, events), pump_outputs(outputs, writer));

    let node_result = node_task
        .await
        .map_err(|e| HarnessError::Node(format!("{name} task failed: {e}")))?;
    read_result?;
    node_result?;
    write_result
}

/// Feed decoded lines into the node. Always leaves the node stopped.
async fn pump_events<R: AsyncBufRead + Unpin>(mut reader: R, events: EventSender) -> Result<()> {
    let mut line = String::new();
    loop {
        line.clear();
        let bytes_read = match reader.read_line(&mut line).await {
            Ok(n) => n,
            Err(e) => {
                stop_quietly(&events).await;
                return Err(HarnessError::Channel(format!("failed to read from stdin: {e}")));
            }
        };

        if bytes_read == 0 {
            info!("stdin closed (EOF); stopping node");
            stop_quietly(&events).await;
            return Ok(());
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let event = decode_event(trimmed).unwrap_or_else(|e| {
            warn!(error = %e, raw_line = %trimmed, "failed to parse event line");
            NodeEvent::Error(format!("malformed event line: {e}"))
        });
        let is_stop = event == NodeEvent::Stop;

        if let Err(e) = events.send(event).await {
            warn!("node exited before stdin closed: {e}");
            return Ok(());
        }
        if is_stop {
            info!("stop received; closing stdin reader");
            return Ok(());
        }
    }
}

async fn stop_quietly(events: &EventSender) {
    if let Err(e) = events.stop().await {
        debug!("node already stopped: {e}");
    }
}

/// Write outputs until the node drops its sender.
async fn pump_outputs<W: AsyncWrite + Unpin>(
    mut outputs: mpsc::UnboundedReceiver<Output>,
    mut writer: W,
) -> Result<W> {
    while let Some(output) = outputs.recv().await {
        match encode_output(&output) {
            Ok(json) => write_line(&mut writer, &json).await?,
            Err(e) => warn!(port = %output.port, error = %e, "failed to serialize output; skipping"),
        }
    }
    Ok(writer)
}

/// Write a single JSON line and flush.
async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, json: &str) -> Result<()> {
    writer
        .write_all(json.as_bytes())
        .await
        .map_err(|e| HarnessError::Channel(format!("failed to write to stdout: {e}")))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| HarnessError::Channel(format!("failed to write newline to stdout: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| HarnessError::Channel(format!("failed to flush stdout: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn decodes_input_with_metadata() {
        let event = decode_event(
            r#"{"type":"input","id":"myself","value":"你","metadata":{"streaming":true,"index":0}}"#,
        )
        .unwrap();
        let NodeEvent::Input(input) = event else {
            panic!("expected input");
        };
        assert_eq!(input.id, "myself");
        assert_eq!(input.value, PortValue::Text("你".to_owned()));
        assert!(input.metadata.streaming());
        assert_eq!(input.metadata.index(), Some(0));
    }

    #[test]
    fn missing_value_decodes_as_null() {
        let event = decode_event(r#"{"type":"input","id":"session_start"}"#).unwrap();
        let NodeEvent::Input(input) = event else {
            panic!("expected input");
        };
        assert_eq!(input.value, PortValue::Json(serde_json::Value::Null));
        assert!(input.metadata.is_empty());
    }

    #[test]
    fn decodes_stop_and_error() {
        assert_eq!(decode_event(r#"{"type":"stop"}"#).unwrap(), NodeEvent::Stop);
        assert_eq!(
            decode_event(r#"{"type":"error","message":"boom"}"#).unwrap(),
            NodeEvent::Error("boom".to_owned())
        );
    }

    #[test]
    fn rejects_bad_base64_and_bad_json() {
        assert!(
            decode_event(r#"{"type":"input","id":"x","value":{"base64":"@@@"}}"#).is_err()
        );
        assert!(decode_event("not json").is_err());
    }

    #[test]
    fn binary_output_is_base64_encoded() {
        let output = Output {
            port: "audio".to_owned(),
            value: PortValue::Bytes(Bytes::from_static(&[0, 0, 0, 0])),
            metadata: Metadata::new().with("sample_rate", 22_050),
        };
        let line = encode_output(&output).unwrap();
        let wire: WireOutput = serde_json::from_str(&line).unwrap();
        assert_eq!(
            wire.value,
            WireValue::Binary {
                base64: "AAAAAA==".to_owned()
            }
        );
        assert_eq!(*wire.metadata.get("sample_rate").unwrap(), 22_050);
    }

    #[test]
    fn empty_metadata_is_omitted() {
        let output = Output {
            port: "log".to_owned(),
            value: PortValue::Text("done".to_owned()),
            metadata: Metadata::new(),
        };
        assert_eq!(
            encode_output(&output).unwrap(),
            r#"{"port":"log","value":"done"}"#
        );
    }
}
