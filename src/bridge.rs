//! Conference bridge: turns go signals into opening prompts for one target
//! participant and relays other participants' text to it.

use crate::config::BridgeConfig;
use crate::error::Result;
use crate::node::{InputEvent, Node, NodeEvent, NodeIo, OutputSender, log_send_error};
use crate::pipeline::control::ControlCommand;
use crate::pipeline::messages::SpeakerId;
use async_trait::async_trait;
use tracing::{debug, info, warn};

const NODE_TAG: &str = "BRIDGE";

/// Bridge node feeding prompts to one target participant.
pub struct BridgeNode {
    name: String,
    target: SpeakerId,
    participants: Vec<SpeakerId>,
    prompt: String,
}

impl BridgeNode {
    /// Bridge routing to `target`; text arriving on any of `participants`'
    /// ports is relayed.
    #[must_use]
    pub fn new(target: SpeakerId, participants: Vec<SpeakerId>, config: &BridgeConfig) -> Self {
        Self {
            name: format!("bridge_{target}"),
            prompt: config.prompt_for(&target).to_owned(),
            target,
            participants,
        }
    }

    fn send_to_target(&self, text: &str, status: &str, outputs: &OutputSender) {
        log_send_error(outputs, outputs.send_text("text", text));
        log_send_error(
            outputs,
            outputs.send_status(serde_json::json!({
                "status": status,
                "target": self.target.as_str(),
            })),
        );
    }

    fn handle_input(&self, input: &InputEvent, outputs: &OutputSender) {
        if input.id == "control" {
            let raw = input.text_or_empty(NODE_TAG);
            info!(target = %self.target, "control: {raw}");
            if ControlCommand::parse(&raw).is_some_and(ControlCommand::begins_turn) {
                info!(target = %self.target, "sending prompt: {}", self.prompt);
                self.send_to_target(&self.prompt, "sent", outputs);
            }
            return;
        }

        if self.participants.iter().any(|p| p.as_str() == input.id) {
            let text = input.text_or_empty(NODE_TAG);
            if text.is_empty() {
                return;
            }
            let preview: String = text.chars().take(50).collect();
            debug!(target = %self.target, from = %input.id, "forwarding: {preview}");
            self.send_to_target(&text, "forwarded", outputs);
            return;
        }

        debug!(port = %input.id, "ignoring input on unknown port");
    }
}

#[async_trait]
impl Node for BridgeNode {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(self: Box<Self>, mut io: NodeIo) -> Result<()> {
        info!(target = %self.target, "starting bridge");
        while let Some(event) = io.recv().await {
            match event {
                NodeEvent::Input(input) => self.handle_input(&input, io.outputs()),
                NodeEvent::Stop => {
                    info!(target = %self.target, "bridge stopping");
                    break;
                }
                NodeEvent::Error(e) => warn!("upstream error: {e}"),
            }
        }
        crate::node::send_shutdown_log(io.outputs(), NODE_TAG);
        Ok(())
    }
}
