//! Message and control types shared by every harness node.

pub mod control;
pub mod messages;

pub use control::ControlCommand;
pub use messages::{
    AudioEncoding, SampleFormat, SentenceChunk, SpeakerId, SynthesizedAudio, TextFragment,
};
