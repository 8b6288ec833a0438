//! Synthetic text-to-speech stage.
//!
//! [`AudioTimingModel`] produces silent audio whose length, sample count and
//! encoding are derived from the input text, after a simulated processing
//! delay. [`SynthNode`] runs the model behind the `text` → `audio` ports.

use crate::config::SynthConfig;
use crate::error::Result;
use crate::node::{Metadata, Node, NodeEvent, NodeIo, OutputSender, log_send_error};
use crate::pipeline::control::ControlCommand;
use crate::pipeline::messages::{AudioEncoding, SampleFormat, SpeakerId, SynthesizedAudio};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const NODE_TAG: &str = "TTS";

/// Linear timing model for synthetic speech.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioTimingModel {
    encoding: AudioEncoding,
    duration_per_char: f64,
    processing_per_char: f64,
    max_processing: f64,
}

impl AudioTimingModel {
    #[must_use]
    pub fn new(config: &SynthConfig) -> Self {
        Self {
            encoding: AudioEncoding {
                sample_rate: config.sample_rate,
                channels: config.channels,
                format: SampleFormat::S16le,
            },
            duration_per_char: config.duration_per_char_secs.max(0.0),
            processing_per_char: config.processing_per_char_secs.max(0.0),
            max_processing: config.max_processing_secs.max(0.0),
        }
    }

    #[must_use]
    pub fn encoding(&self) -> AudioEncoding {
        self.encoding
    }

    /// Simulated processing time: linear in character count, capped.
    #[must_use]
    pub fn processing_delay(&self, text: &str) -> Duration {
        let chars = text.chars().count() as f64;
        Duration::from_secs_f64((chars * self.processing_per_char).min(self.max_processing))
    }

    /// Number of samples per channel for `text`, rounded to nearest with
    /// ties to even.
    #[must_use]
    pub fn sample_count(&self, text: &str) -> usize {
        let seconds = text.chars().count() as f64 * self.duration_per_char;
        (f64::from(self.encoding.sample_rate) * seconds).round_ties_even() as usize
    }

    /// Render `text` as silence of the modelled length.
    #[must_use]
    pub fn synthesize(&self, text: &str) -> SynthesizedAudio {
        let sample_count = self.sample_count(text);
        let payload = Bytes::from(vec![0_u8; sample_count * self.encoding.frame_bytes()]);
        let duration = if self.encoding.sample_rate == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(sample_count as f64 / f64::from(self.encoding.sample_rate))
        };
        SynthesizedAudio {
            payload,
            sample_count,
            duration,
            encoding: self.encoding,
            text: text.to_owned(),
        }
    }
}

#[derive(Debug)]
struct PendingSegment {
    text: String,
    due: Instant,
}

/// Synth node for one participant's voice.
pub struct SynthNode {
    name: String,
    participant: SpeakerId,
    voice: String,
    model: AudioTimingModel,
    pending: VecDeque<PendingSegment>,
}

impl SynthNode {
    #[must_use]
    pub fn new(participant: SpeakerId, config: &SynthConfig) -> Self {
        Self {
            name: format!("synth_{participant}"),
            participant,
            voice: config.voice.clone(),
            model: AudioTimingModel::new(config),
            pending: VecDeque::new(),
        }
    }

    fn enqueue(&mut self, text: String) {
        if text.trim().is_empty() {
            debug!(participant = %self.participant, "skipping blank segment");
            return;
        }
        // Segments are processed one after another, so only the head has a
        // running timer; later ones are armed when they reach the front.
        let due = if self.pending.is_empty() {
            Instant::now() + self.model.processing_delay(&text)
        } else {
            Instant::now()
        };
        self.pending.push_back(PendingSegment { text, due });
    }

    fn head_due(&self) -> Option<Instant> {
        self.pending.front().map(|p| p.due)
    }

    fn finish_head(&mut self, outputs: &OutputSender) {
        let Some(segment) = self.pending.pop_front() else {
            return;
        };
        self.emit(&segment.text, outputs);
        if let Some(next) = self.pending.front_mut() {
            next.due = Instant::now() + self.model.processing_delay(&next.text);
        }
    }

    fn emit(&self, text: &str, outputs: &OutputSender) {
        let audio = self.model.synthesize(text);
        let audio_bytes = audio.payload.len();
        info!(
            participant = %self.participant,
            samples = audio.sample_count,
            "synthesized {} chars",
            text.chars().count()
        );

        let meta = Metadata::new()
            .with("sample_rate", audio.encoding.sample_rate)
            .with("channels", audio.encoding.channels)
            .with("format", audio.encoding.format.as_str())
            .with("sample_count", audio.sample_count as u64)
            .with("duration_ms", audio.duration.as_millis() as u64)
            .with("text", text)
            .with("voice", self.voice.as_str())
            .with("participant", self.participant.as_str());
        log_send_error(outputs, outputs.send("audio", audio.payload, meta));
        log_send_error(
            outputs,
            outputs.send_status(serde_json::json!({
                "status": "synthesized",
                "text_length": text.chars().count(),
                "audio_bytes": audio_bytes,
                "voice": self.voice,
            })),
        );
        log_send_error(
            outputs,
            outputs.send_text(
                "segment_complete",
                serde_json::json!({"text": text, "voice": self.voice}).to_string(),
            ),
        );
    }
}

#[async_trait]
impl Node for SynthNode {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(mut self: Box<Self>, mut io: NodeIo) -> Result<()> {
        info!(participant = %self.participant, voice = %self.voice, "starting synth");
        loop {
            // Timers round up to the next tick; finish zero-delay work now.
            while self.head_due().is_some_and(|due| due <= Instant::now()) {
                self.finish_head(io.outputs());
            }
            tokio::select! {
                biased;
                () = crate::node::sleep_until_deadline(self.head_due()) => {
                    self.finish_head(io.outputs());
                }
                event = io.recv() => {
                    match event {
                        Some(NodeEvent::Input(input)) => {
                            debug!(port = %input.id, "synth input");
                            match input.id.as_str() {
                                "text" => {
                                    let text = input.text_or_empty(NODE_TAG);
                                    self.enqueue(text);
                                }
                                "control" => {
                                    let raw = input.text_or_empty(NODE_TAG);
                                    if matches!(
                                        ControlCommand::parse(&raw),
                                        Some(ControlCommand::Stop | ControlCommand::Reset)
                                    ) {
                                        info!(dropped = self.pending.len(), "synth queue cleared");
                                        self.pending.clear();
                                    }
                                }
                                other => debug!(port = other, "ignoring input on unknown port"),
                            }
                        }
                        Some(NodeEvent::Error(e)) => warn!("upstream error: {e}"),
                        Some(NodeEvent::Stop) | None => {
                            info!(participant = %self.participant, "synth stopping");
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
