//! Parley: a simulated multi-party spoken-dialogue pipeline.
//!
//! This crate provides synthetic stand-ins for every stage of a voice
//! conversation so that dataflow wiring can be exercised without models:
//! Coordinator → Bridge → Responder → Segmenter → Synth
//!
//! # Architecture
//!
//! Components are independent nodes exchanging events over named ports:
//! - **Coordinator**: Turn-taking state machine over a fixed speaker rotation
//! - **Bridge**: Turns go signals into opening prompts for a participant
//! - **Responder**: Streams canned replies one character at a time
//! - **Segmenter**: Carves per-speaker streams into punctuated sentences
//! - **Synth**: Produces silent audio with a linear timing model
//!
//! Nodes run in-process through [`dataflow`] or one at a time behind the
//! line-delimited JSON bridge in [`node::stdio`].

pub mod bridge;
pub mod config;
pub mod coordinator;
pub mod dataflow;
pub mod error;
pub mod node;
pub mod pipeline;
pub mod responder;
pub mod segmenter;
pub mod synth;

pub use config::HarnessConfig;
pub use dataflow::{Dataflow, DataflowEvent, RunningDataflow, conversation_dataflow};
pub use error::{HarnessError, Result};
pub use node::{Node, NodeEvent, PortValue};
