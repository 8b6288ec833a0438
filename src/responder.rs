//! Canned-reply speaker.
//!
//! Stands in for a language model: every prompt is answered with the next
//! reply from a fixed per-speaker list, streamed one character at a time and
//! closed with an explicit end-of-utterance marker.

use crate::config::ResponderConfig;
use crate::error::Result;
use crate::node::{InputEvent, Node, NodeEvent, NodeIo, OutputSender, log_send_error};
use crate::pipeline::control::ControlCommand;
use crate::pipeline::messages::{SpeakerId, TextFragment};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const NODE_TAG: &str = "RESPONDER";

/// Reply lists with a wrapping cursor per speaker.
#[derive(Debug, Clone, Default)]
pub struct ReplyBook {
    replies: HashMap<SpeakerId, Vec<String>>,
    cursors: HashMap<SpeakerId, usize>,
}

impl ReplyBook {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace `speaker`'s reply list and rewind its cursor.
    pub fn insert(&mut self, speaker: SpeakerId, replies: Vec<String>) {
        self.cursors.remove(&speaker);
        self.replies.insert(speaker, replies);
    }

    /// Next reply for `speaker` with its list index, advancing the cursor.
    /// `None` when the speaker has no replies.
    pub fn next_reply(&mut self, speaker: &SpeakerId) -> Option<(usize, String)> {
        let replies = self.replies.get(speaker).filter(|r| !r.is_empty())?;
        let cursor = self.cursors.entry(speaker.clone()).or_insert(0);
        let index = *cursor % replies.len();
        *cursor = cursor.wrapping_add(1);
        Some((index, replies[index].clone()))
    }

    /// Index the next reply for `speaker` will be served from.
    #[must_use]
    pub fn cursor(&self, speaker: &SpeakerId) -> usize {
        let len = self.replies.get(speaker).map_or(0, Vec::len);
        match self.cursors.get(speaker) {
            Some(cursor) if len > 0 => cursor % len,
            _ => 0,
        }
    }

    /// Rewind every cursor to the first reply.
    pub fn reset(&mut self) {
        self.cursors.clear();
    }
}

/// A reply being streamed out.
#[derive(Debug)]
struct ReplyStream {
    chars: Vec<char>,
    next: usize,
    due: Instant,
}

/// Responder node serving one participant.
pub struct ResponderNode {
    name: String,
    participant: SpeakerId,
    book: ReplyBook,
    think_delay: Duration,
    char_delay: Duration,
    active: Option<ReplyStream>,
    queued: VecDeque<String>,
}

impl ResponderNode {
    #[must_use]
    pub fn new(participant: SpeakerId, config: &ResponderConfig) -> Self {
        let mut book = ReplyBook::new();
        book.insert(participant.clone(), config.replies_for(&participant));
        Self {
            name: format!("responder_{participant}"),
            participant,
            book,
            think_delay: config.think_delay(),
            char_delay: config.char_delay(),
            active: None,
            queued: VecDeque::new(),
        }
    }

    /// Cursor position of the served participant.
    #[must_use]
    pub fn cursor(&self) -> usize {
        self.book.cursor(&self.participant)
    }

    fn on_prompt(&mut self, prompt: &str) {
        info!(participant = %self.participant, "prompt: {prompt}");
        let reply = match self.book.next_reply(&self.participant) {
            Some((index, reply)) => {
                debug!(participant = %self.participant, index, "selected reply");
                reply
            }
            None => {
                warn!(participant = %self.participant, "no replies configured");
                String::new()
            }
        };
        if self.active.is_some() {
            self.queued.push_back(reply);
        } else {
            self.begin(reply);
        }
    }

    fn begin(&mut self, reply: String) {
        self.active = Some(ReplyStream {
            chars: reply.chars().collect(),
            next: 0,
            due: Instant::now() + self.think_delay,
        });
    }

    /// Emit the next character, or the end marker once the reply is spent.
    fn advance(&mut self, outputs: &OutputSender) {
        let Some(stream) = self.active.as_mut() else {
            return;
        };
        if let Some(ch) = stream.chars.get(stream.next) {
            let fragment = TextFragment::streamed(ch.to_string(), stream.next as u64);
            stream.next += 1;
            stream.due = Instant::now() + self.char_delay;
            let meta = fragment
                .metadata()
                .with("participant", self.participant.as_str());
            log_send_error(outputs, outputs.send("text", fragment.text, meta));
            return;
        }

        let end = TextFragment::end_of_utterance();
        let meta = end.metadata().with("participant", self.participant.as_str());
        log_send_error(outputs, outputs.send("text", end.text, meta));
        log_send_error(
            outputs,
            outputs.send_status(serde_json::json!({
                "status": "complete",
                "participant": self.participant.as_str(),
            })),
        );
        info!(participant = %self.participant, "reply complete");

        self.active = None;
        if let Some(reply) = self.queued.pop_front() {
            self.begin(reply);
        }
    }

    fn on_control(&mut self, input: &InputEvent, outputs: &OutputSender) {
        let raw = input.text_or_empty(NODE_TAG);
        info!(participant = %self.participant, "control signal: {raw}");
        match ControlCommand::parse(&raw) {
            Some(ControlCommand::Reset) => {
                self.book.reset();
                info!(participant = %self.participant, "reply cursor reset");
            }
            Some(ControlCommand::Stop) => {
                if self.active.take().is_some() {
                    // Close the cut-off utterance so downstream buffers drop it.
                    let marker = TextFragment::interrupted();
                    let meta = marker
                        .metadata()
                        .with("participant", self.participant.as_str());
                    log_send_error(outputs, outputs.send("text", marker.text, meta));
                    info!(participant = %self.participant, "in-flight reply cancelled");
                }
                if !self.queued.is_empty() {
                    info!(
                        participant = %self.participant,
                        dropped = self.queued.len(),
                        "queued replies dropped"
                    );
                    self.queued.clear();
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl Node for ResponderNode {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(mut self: Box<Self>, mut io: NodeIo) -> Result<()> {
        info!(participant = %self.participant, "starting canned-reply responder");
        loop {
            let due = self.active.as_ref().map(|s| s.due);
            tokio::select! {
                biased;
                () = crate::node::sleep_until_deadline(due) => self.advance(io.outputs()),
                event = io.recv() => {
                    match event {
                        Some(NodeEvent::Input(input)) => {
                            debug!(port = %input.id, "responder input");
                            match input.id.as_str() {
                                "text" => {
                                    let prompt = input.text_or_empty(NODE_TAG);
                                    self.on_prompt(&prompt);
                                }
                                "control" => self.on_control(&input, io.outputs()),
                                other => debug!(port = other, "ignoring input on unknown port"),
                            }
                        }
                        Some(NodeEvent::Error(e)) => warn!("upstream error: {e}"),
                        Some(NodeEvent::Stop) | None => {
                            info!(participant = %self.participant, "responder stopping");
                            break;
                        }
                    }
                }
            }
        }
        crate::node::send_shutdown_log(io.outputs(), NODE_TAG);
        Ok(())
    }
}
