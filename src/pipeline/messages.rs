//! Message types passed between harness nodes.

use crate::node::{InputEvent, Metadata};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Identity of one conversation participant (e.g. `techer`, `myself`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpeakerId(String);

impl SpeakerId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Port carrying this speaker's segmented sentences.
    #[must_use]
    pub fn segment_port(&self) -> String {
        format!("text_segment_{}", self.0)
    }

    /// Port carrying this speaker's go signal from the coordinator.
    #[must_use]
    pub fn control_port(&self) -> String {
        format!("control_{}", self.0)
    }
}

impl fmt::Display for SpeakerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SpeakerId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// One piece of an utterance stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextFragment {
    pub text: String,
    /// More fragments of the same utterance follow.
    pub streaming: bool,
    /// This fragment closes the utterance.
    pub complete: bool,
    /// Position of the fragment within its utterance, when streamed.
    pub index: Option<u64>,
    /// The utterance was cut off; text buffered for it is void.
    pub interrupted: bool,
}

impl TextFragment {
    /// A mid-utterance fragment.
    #[must_use]
    pub fn streamed(text: impl Into<String>, index: u64) -> Self {
        Self {
            text: text.into(),
            streaming: true,
            complete: false,
            index: Some(index),
            interrupted: false,
        }
    }

    /// A standalone, non-streamed message.
    #[must_use]
    pub fn whole(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            streaming: false,
            complete: false,
            index: None,
            interrupted: false,
        }
    }

    /// The explicit end-of-utterance marker: empty text, `complete=true`.
    #[must_use]
    pub fn end_of_utterance() -> Self {
        Self {
            text: String::new(),
            streaming: false,
            complete: true,
            index: None,
            interrupted: false,
        }
    }

    /// End marker for an utterance cancelled mid-stream.
    #[must_use]
    pub fn interrupted() -> Self {
        Self {
            interrupted: true,
            ..Self::end_of_utterance()
        }
    }

    /// Whether this fragment ends the speaker's utterance.
    ///
    /// A fragment flagged `complete` always does. For runtimes that drop
    /// metadata, an empty non-streaming fragment is also accepted.
    #[must_use]
    pub fn is_end_of_utterance(&self) -> bool {
        self.complete || (!self.streaming && self.text.is_empty())
    }

    /// Decode a fragment from an input event; malformed text reads as empty.
    #[must_use]
    pub fn from_input(event: &InputEvent, node: &str) -> Self {
        Self {
            text: event.text_or_empty(node),
            streaming: event.metadata.streaming(),
            complete: event.metadata.complete(),
            index: event.metadata.index(),
            interrupted: event.metadata.flag("interrupted"),
        }
    }

    /// Wire metadata for this fragment.
    #[must_use]
    pub fn metadata(&self) -> Metadata {
        let mut meta = Metadata::new().with("streaming", self.streaming);
        if self.complete {
            meta = meta.with("complete", true);
        }
        if let Some(index) = self.index {
            meta = meta.with("index", index);
        }
        if self.interrupted {
            meta = meta.with("interrupted", true);
        }
        meta
    }
}

/// A sentence carved out of a speaker's stream, ready for synthesis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentenceChunk {
    pub speaker: SpeakerId,
    /// Trimmed, non-empty sentence text.
    pub text: String,
    /// Emitted by an end-of-utterance flush rather than mid-stream.
    pub is_final: bool,
}

/// PCM sample layout of a synthesized payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    /// 16-bit signed little-endian.
    S16le,
}

impl SampleFormat {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::S16le => "s16le",
        }
    }

    #[must_use]
    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::S16le => 2,
        }
    }
}

/// Encoding descriptor attached to every synthesized payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioEncoding {
    pub sample_rate: u32,
    pub channels: u16,
    pub format: SampleFormat,
}

impl AudioEncoding {
    /// Bytes occupied by one frame (one sample on every channel).
    #[must_use]
    pub fn frame_bytes(&self) -> usize {
        self.format.bytes_per_sample() * usize::from(self.channels)
    }
}

/// Synthesized audio for one sentence chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedAudio {
    /// Silent PCM payload in `encoding`'s layout.
    pub payload: Bytes,
    /// Samples per channel.
    pub sample_count: usize,
    /// Playback duration implied by the text length.
    pub duration: Duration,
    pub encoding: AudioEncoding,
    /// Source text that was "spoken".
    pub text: String,
}
