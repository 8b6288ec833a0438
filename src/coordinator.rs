//! Turn-taking coordinator.
//!
//! [`TurnCoordinator`] is a synchronous state machine over a fixed speaker
//! rotation; it returns the actions each transition requires. The node
//! wrapper turns those actions into outputs and owns the handoff timer, so a
//! `stop` arriving during the handoff delay cancels the pending go signal
//! instead of waiting for it.

use crate::config::CoordinatorConfig;
use crate::error::{HarnessError, Result};
use crate::node::{InputEvent, Node, NodeEvent, NodeIo, OutputSender, log_send_error};
use crate::pipeline::control::ControlCommand;
use crate::pipeline::messages::{SpeakerId, TextFragment};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const NODE_TAG: &str = "CONTROLLER";

/// Port carrying broadcast control for every participant.
pub const PARTICIPANTS_CONTROL_PORT: &str = "llm_control";

/// Coordinator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Stopped,
    Running {
        /// Index into the rotation of the speaker who holds the turn.
        current: usize,
        /// The previous turn ended and the current speaker has not yet been
        /// signalled.
        awaiting_handoff: bool,
    },
}

/// Effects requested by a state transition.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorAction {
    /// Send a go signal to one speaker.
    Signal {
        speaker: SpeakerId,
        command: ControlCommand,
    },
    /// Broadcast a control word to every participant.
    Broadcast(&'static str),
    /// Publish a status object.
    Status(serde_json::Value),
    /// Arm the handoff timer for the next speaker.
    ScheduleHandoff { next: SpeakerId },
}

/// Turn state machine over a fixed rotation.
#[derive(Debug, Clone)]
pub struct TurnCoordinator {
    rotation: Vec<SpeakerId>,
    state: TurnState,
}

impl TurnCoordinator {
    /// Create a stopped coordinator.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Config`] if the rotation is empty.
    pub fn new(rotation: Vec<SpeakerId>) -> Result<Self> {
        if rotation.is_empty() {
            return Err(HarnessError::Config(
                "turn rotation needs at least one speaker".to_owned(),
            ));
        }
        Ok(Self {
            rotation,
            state: TurnState::Stopped,
        })
    }

    #[must_use]
    pub fn state(&self) -> TurnState {
        self.state
    }

    #[must_use]
    pub fn rotation(&self) -> &[SpeakerId] {
        &self.rotation
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self.state, TurnState::Running { .. })
    }

    /// Whether an end-of-turn is waiting on the handoff timer.
    #[must_use]
    pub fn handoff_pending(&self) -> bool {
        matches!(
            self.state,
            TurnState::Running {
                awaiting_handoff: true,
                ..
            }
        )
    }

    /// Speaker holding the turn, if running.
    #[must_use]
    pub fn current_speaker(&self) -> Option<&SpeakerId> {
        match self.state {
            TurnState::Running { current, .. } => self.rotation.get(current),
            TurnState::Stopped => None,
        }
    }

    /// Start (or restart) the conversation with the first speaker.
    pub fn start(&mut self) -> Vec<CoordinatorAction> {
        self.state = TurnState::Running {
            current: 0,
            awaiting_handoff: false,
        };
        let first = self.rotation[0].clone();
        info!(speaker = %first, "starting conversation");
        vec![
            CoordinatorAction::Signal {
                speaker: first.clone(),
                command: ControlCommand::Start,
            },
            CoordinatorAction::Broadcast("active"),
            CoordinatorAction::Status(serde_json::json!({
                "status": "started",
                "turn": first.as_str(),
            })),
        ]
    }

    /// Stop the conversation. A no-op when already stopped.
    pub fn stop(&mut self) -> Vec<CoordinatorAction> {
        if !self.is_running() {
            debug!("stop while stopped ignored");
            return Vec::new();
        }
        self.state = TurnState::Stopped;
        info!("conversation stopped");
        vec![
            CoordinatorAction::Broadcast("stop"),
            CoordinatorAction::Status(serde_json::json!({"status": "stopped"})),
        ]
    }

    /// Apply a control command. Commands other than start/stop are ignored.
    pub fn control(&mut self, command: ControlCommand) -> Vec<CoordinatorAction> {
        match command {
            ControlCommand::Start => self.start(),
            ControlCommand::Stop => self.stop(),
            ControlCommand::Speak | ControlCommand::Reset => Vec::new(),
        }
    }

    /// Record `speaker`'s end-of-utterance marker.
    ///
    /// Only the current speaker can end a turn, and only while running with
    /// no handoff pending; anything else is stale and ignored.
    pub fn end_of_turn(&mut self, speaker: &SpeakerId) -> Vec<CoordinatorAction> {
        let TurnState::Running {
            current,
            awaiting_handoff: false,
        } = self.state
        else {
            debug!(%speaker, state = ?self.state, "end of turn ignored");
            return Vec::new();
        };
        if self.rotation[current] != *speaker {
            debug!(
                %speaker,
                current = %self.rotation[current],
                "end of turn from non-current speaker ignored"
            );
            return Vec::new();
        }

        let next = (current + 1) % self.rotation.len();
        self.state = TurnState::Running {
            current: next,
            awaiting_handoff: true,
        };
        let next_speaker = self.rotation[next].clone();
        info!(next = %next_speaker, "turn complete");
        vec![CoordinatorAction::ScheduleHandoff { next: next_speaker }]
    }

    /// The handoff delay elapsed: signal the new current speaker.
    pub fn handoff_due(&mut self) -> Vec<CoordinatorAction> {
        let TurnState::Running {
            current,
            awaiting_handoff: true,
        } = self.state
        else {
            return Vec::new();
        };
        self.state = TurnState::Running {
            current,
            awaiting_handoff: false,
        };
        let speaker = self.rotation[current].clone();
        vec![
            CoordinatorAction::Signal {
                speaker: speaker.clone(),
                command: ControlCommand::Speak,
            },
            CoordinatorAction::Status(serde_json::json!({
                "status": "turn_change",
                "turn": speaker.as_str(),
            })),
        ]
    }
}

/// Coordinator node with a cancellable handoff timer.
pub struct CoordinatorNode {
    coordinator: TurnCoordinator,
    handoff_delay: Duration,
    handoff_at: Option<Instant>,
}

impl CoordinatorNode {
    /// # Errors
    ///
    /// Returns an error if the rotation is empty.
    pub fn new(rotation: Vec<SpeakerId>, config: &CoordinatorConfig) -> Result<Self> {
        Ok(Self {
            coordinator: TurnCoordinator::new(rotation)?,
            handoff_delay: config.handoff_delay(),
            handoff_at: None,
        })
    }

    fn apply(&mut self, actions: Vec<CoordinatorAction>, outputs: &OutputSender) {
        for action in actions {
            let result = match action {
                CoordinatorAction::Signal { speaker, command } => {
                    outputs.send_text(&speaker.control_port(), command.as_str())
                }
                CoordinatorAction::Broadcast(word) => {
                    outputs.send_text(PARTICIPANTS_CONTROL_PORT, word)
                }
                CoordinatorAction::Status(status) => outputs.send_status(status),
                CoordinatorAction::ScheduleHandoff { next } => {
                    debug!(%next, delay = ?self.handoff_delay, "handoff scheduled");
                    self.handoff_at = Some(Instant::now() + self.handoff_delay);
                    Ok(())
                }
            };
            log_send_error(outputs, result);
        }
        if !self.coordinator.handoff_pending() {
            self.handoff_at = None;
        }
    }

    fn handle_input(&mut self, input: &InputEvent, outputs: &OutputSender) {
        let speaker = self
            .coordinator
            .rotation()
            .iter()
            .find(|s| s.as_str() == input.id)
            .cloned();
        if let Some(speaker) = speaker {
            if !self.coordinator.is_running() {
                return;
            }
            let fragment = TextFragment::from_input(input, NODE_TAG);
            if fragment.interrupted {
                debug!(%speaker, "interrupted utterance does not end the turn");
            } else if fragment.is_end_of_utterance() {
                let actions = self.coordinator.end_of_turn(&speaker);
                self.apply(actions, outputs);
            }
            return;
        }

        match input.id.as_str() {
            "control" => {
                let raw = input.text_or_empty(NODE_TAG);
                info!("control signal: {raw}");
                match ControlCommand::parse(&raw) {
                    Some(command) => {
                        let actions = self.coordinator.control(command);
                        self.apply(actions, outputs);
                    }
                    None => debug!("unrecognised control signal ignored"),
                }
            }
            "session_start" => info!("received session_start signal"),
            "buffer_status" => {
                info!("buffer status: {}", input.text_or_empty(NODE_TAG));
            }
            other => debug!(port = other, "ignoring input on unknown port"),
        }
    }
}

#[async_trait]
impl Node for CoordinatorNode {
    fn name(&self) -> &str {
        "controller"
    }

    async fn run(mut self: Box<Self>, mut io: NodeIo) -> Result<()> {
        info!(rotation = ?self.coordinator.rotation(), "starting conversation controller");
        loop {
            tokio::select! {
                biased;
                () = crate::node::sleep_until_deadline(self.handoff_at) => {
                    self.handoff_at = None;
                    let actions = self.coordinator.handoff_due();
                    self.apply(actions, io.outputs());
                }
                event = io.recv() => {
                    match event {
                        Some(NodeEvent::Input(input)) => {
                            debug!(port = %input.id, "controller input");
                            self.handle_input(&input, io.outputs());
                        }
                        Some(NodeEvent::Error(e)) => warn!("upstream error: {e}"),
                        Some(NodeEvent::Stop) | None => {
                            info!("controller stopping");
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

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::node::{Metadata, Output, node_channel};

    fn ab() -> TurnCoordinator {
        TurnCoordinator::new(vec![SpeakerId::from("A"), SpeakerId::from("B")]).unwrap()
    }

    fn signalled(actions: &[CoordinatorAction]) -> Vec<(&str, ControlCommand)> {
        actions
            .iter()
            .filter_map(|a| match a {
                CoordinatorAction::Signal { speaker, command } => {
                    Some((speaker.as_str(), *command))
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn empty_rotation_is_rejected() {
        assert!(TurnCoordinator::new(Vec::new()).is_err());
    }

    #[test]
    fn start_signals_first_speaker() {
        let mut c = ab();
        let actions = c.start();
        assert_eq!(signalled(&actions), vec![("A", ControlCommand::Start)]);
        assert!(actions.contains(&CoordinatorAction::Broadcast("active")));
        assert_eq!(c.current_speaker(), Some(&SpeakerId::from("A")));
    }

    #[test]
    fn rotation_returns_to_first_speaker() {
        let mut c = ab();
        c.start();

        let actions = c.end_of_turn(&SpeakerId::from("A"));
        assert_eq!(
            actions,
            vec![CoordinatorAction::ScheduleHandoff {
                next: SpeakerId::from("B")
            }]
        );
        assert_eq!(
            signalled(&c.handoff_due()),
            vec![("B", ControlCommand::Speak)]
        );

        c.end_of_turn(&SpeakerId::from("B"));
        assert_eq!(
            signalled(&c.handoff_due()),
            vec![("A", ControlCommand::Speak)]
        );
        assert_eq!(c.current_speaker(), Some(&SpeakerId::from("A")));
    }

    #[test]
    fn end_of_turn_from_non_current_speaker_is_ignored() {
        let mut c = ab();
        c.start();
        assert!(c.end_of_turn(&SpeakerId::from("B")).is_empty());
        assert_eq!(
            c.state(),
            TurnState::Running {
                current: 0,
                awaiting_handoff: false
            }
        );
    }

    #[test]
    fn end_of_turn_while_stopped_is_ignored() {
        let mut c = ab();
        assert!(c.end_of_turn(&SpeakerId::from("A")).is_empty());
        assert_eq!(c.state(), TurnState::Stopped);
    }

    #[test]
    fn end_of_turn_during_pending_handoff_is_ignored() {
        let mut c = ab();
        c.start();
        c.end_of_turn(&SpeakerId::from("A"));
        assert!(c.end_of_turn(&SpeakerId::from("B")).is_empty());
        assert!(c.handoff_pending());
    }

    #[test]
    fn stop_discards_turn_and_pending_handoff() {
        let mut c = ab();
        c.start();
        c.end_of_turn(&SpeakerId::from("A"));
        let actions = c.stop();
        assert!(actions.contains(&CoordinatorAction::Broadcast("stop")));
        assert_eq!(c.state(), TurnState::Stopped);
        assert!(c.handoff_due().is_empty());
        assert!(c.current_speaker().is_none());
    }

    #[test]
    fn stop_while_stopped_is_a_no_op() {
        let mut c = ab();
        assert!(c.stop().is_empty());
    }

    #[test]
    fn restart_returns_to_first_speaker() {
        let mut c = ab();
        c.start();
        c.end_of_turn(&SpeakerId::from("A"));
        c.handoff_due();
        c.start();
        assert_eq!(c.current_speaker(), Some(&SpeakerId::from("A")));
    }

    #[test]
    fn single_speaker_rotation_hands_back_to_itself() {
        let mut c = TurnCoordinator::new(vec![SpeakerId::from("solo")]).unwrap();
        c.start();
        c.end_of_turn(&SpeakerId::from("solo"));
        assert_eq!(
            signalled(&c.handoff_due()),
            vec![("solo", ControlCommand::Speak)]
        );
    }

    fn drain(handle: &mut crate::node::NodeHandle) -> Vec<Output> {
        let mut outputs = Vec::new();
        while let Some(out) = handle.try_recv_output() {
            outputs.push(out);
        }
        outputs
    }

    fn node(delay_ms: u64) -> CoordinatorNode {
        CoordinatorNode::new(
            vec![SpeakerId::from("techer"), SpeakerId::from("myself")],
            &CoordinatorConfig {
                handoff_delay_ms: delay_ms,
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn node_hands_off_after_delay() {
        let (mut handle, io) = node_channel("controller", 16);
        let task = tokio::spawn(Box::new(node(10)).run(io));

        handle.input("control", "start", Metadata::new()).await.unwrap();
        let first = handle.recv_output().await.unwrap();
        assert_eq!(first.port, "control_techer");
        assert_eq!(first.value.as_text().unwrap(), "start");

        handle
            .input("techer", "", Metadata::new().with("complete", true))
            .await
            .unwrap();

        let go = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let out = handle.recv_output().await.unwrap();
                if out.port == "control_myself" {
                    return out;
                }
            }
        })
        .await
        .expect("handoff within timeout");
        assert_eq!(go.value.as_text().unwrap(), "speak");

        handle.stop().await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stop_cancels_pending_handoff() {
        let (mut handle, io) = node_channel("controller", 16);
        let task = tokio::spawn(Box::new(node(200)).run(io));

        handle.input("control", "start", Metadata::new()).await.unwrap();
        handle
            .input("techer", "", Metadata::new().with("complete", true))
            .await
            .unwrap();
        handle.input("control", "stop", Metadata::new()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.stop().await.unwrap();
        task.await.unwrap().unwrap();

        let outputs = drain(&mut handle);
        assert!(outputs.iter().all(|o| o.port != "control_myself"));
        assert!(outputs.iter().any(|o| {
            o.port == PARTICIPANTS_CONTROL_PORT && o.value.as_text().unwrap() == "stop"
        }));
        let last = outputs.last().unwrap();
        assert_eq!(last.port, "log");
    }

    #[tokio::test]
    async fn streaming_characters_do_not_end_a_turn() {
        let (mut handle, io) = node_channel("controller", 16);
        let task = tokio::spawn(Box::new(node(1)).run(io));

        handle.input("control", "start", Metadata::new()).await.unwrap();
        handle
            .input(
                "techer",
                "好",
                Metadata::new().with("streaming", true).with("index", 0),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.stop().await.unwrap();
        task.await.unwrap().unwrap();

        let outputs = drain(&mut handle);
        assert!(outputs.iter().all(|o| o.port != "control_myself"));
    }

    #[tokio::test]
    async fn interrupted_marker_does_not_end_a_turn() {
        let (mut handle, io) = node_channel("controller", 16);
        let task = tokio::spawn(Box::new(node(1)).run(io));

        handle.input("control", "start", Metadata::new()).await.unwrap();
        handle
            .input("techer", "", TextFragment::interrupted().metadata())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.stop().await.unwrap();
        task.await.unwrap().unwrap();

        let outputs = drain(&mut handle);
        assert!(outputs.iter().all(|o| o.port != "control_myself"));
    }
}
