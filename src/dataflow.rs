//! In-process dataflow: wires nodes together by `(node, port)` routes.
//!
//! Every node runs on its own task. Each node's outputs are drained by a
//! router task that copies them onto a broadcast tap and delivers them to
//! the inboxes of the routed destinations. Shutdown cancels a
//! [`CancellationToken`], which stops routing and delivers
//! [`NodeEvent::Stop`](crate::node::NodeEvent::Stop) to every node.

use crate::bridge::BridgeNode;
use crate::config::HarnessConfig;
use crate::coordinator::{CoordinatorNode, PARTICIPANTS_CONTROL_PORT};
use crate::error::{HarnessError, Result};
use crate::node::{EventSender, Metadata, Node, Output, PortValue, node_channel};
use crate::pipeline::messages::SpeakerId;
use crate::responder::ResponderNode;
use crate::segmenter::SegmenterNode;
use crate::synth::SynthNode;
use std::collections::HashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Capacity of the observation tap.
const TAP_CAPACITY: usize = 1024;

/// Name of the turn coordinator node.
pub const CONTROLLER_NODE: &str = "controller";
/// Name of the segmenter node.
pub const SEGMENTER_NODE: &str = "segmenter";

#[must_use]
pub fn bridge_node_name(speaker: &SpeakerId) -> String {
    format!("bridge_{speaker}")
}

#[must_use]
pub fn responder_node_name(speaker: &SpeakerId) -> String {
    format!("responder_{speaker}")
}

#[must_use]
pub fn synth_node_name(speaker: &SpeakerId) -> String {
    format!("synth_{speaker}")
}

/// An output observed on the tap.
#[derive(Debug, Clone, PartialEq)]
pub struct DataflowEvent {
    pub node: String,
    pub output: Output,
}

/// A directed connection from one node's output port to another's input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub from_node: String,
    pub from_port: String,
    pub to_node: String,
    pub to_port: String,
}

/// Dataflow under construction.
pub struct Dataflow {
    nodes: Vec<Box<dyn Node>>,
    routes: Vec<Route>,
    event_capacity: usize,
}

impl Dataflow {
    #[must_use]
    pub fn new(event_capacity: usize) -> Self {
        Self {
            nodes: Vec::new(),
            routes: Vec::new(),
            event_capacity,
        }
    }

    /// Register a node under its own name.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Config`] if the name is already taken.
    pub fn add_node(&mut self, node: Box<dyn Node>) -> Result<&mut Self> {
        if self.nodes.iter().any(|n| n.name() == node.name()) {
            return Err(HarnessError::Config(format!(
                "duplicate node name: {}",
                node.name()
            )));
        }
        self.nodes.push(node);
        Ok(self)
    }

    /// Route `from_node.from_port` into `to_node.to_port`.
    pub fn connect(
        &mut self,
        from_node: &str,
        from_port: &str,
        to_node: &str,
        to_port: &str,
    ) -> &mut Self {
        self.routes.push(Route {
            from_node: from_node.to_owned(),
            from_port: from_port.to_owned(),
            to_node: to_node.to_owned(),
            to_port: to_port.to_owned(),
        });
        self
    }

    #[must_use]
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    #[must_use]
    pub fn node_names(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.name()).collect()
    }

    /// Spawn every node and router.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Config`] if a route names an unknown node.
    pub fn start(self) -> Result<RunningDataflow> {
        for route in &self.routes {
            for name in [&route.from_node, &route.to_node] {
                if !self.nodes.iter().any(|n| n.name() == name.as_str()) {
                    return Err(HarnessError::Config(format!(
                        "route {}.{} -> {}.{} names unknown node {name}",
                        route.from_node, route.from_port, route.to_node, route.to_port
                    )));
                }
            }
        }

        let run_id = Uuid::new_v4();
        let shutdown = CancellationToken::new();
        let (tap, _) = broadcast::channel(TAP_CAPACITY);

        let mut inboxes = HashMap::new();
        let mut receivers = Vec::new();
        let mut nodes = Vec::new();
        for node in self.nodes {
            let name = node.name().to_owned();
            let (handle, io) = node_channel(&name, self.event_capacity);
            let (events, outputs) = handle.split();
            inboxes.insert(name.clone(), events);
            receivers.push((name.clone(), outputs));
            nodes.push((name, node, io));
        }

        let mut routers = Vec::new();
        for (name, outputs) in receivers {
            let mut table: HashMap<String, Vec<(EventSender, String)>> = HashMap::new();
            for route in self.routes.iter().filter(|r| r.from_node == name) {
                if let Some(inbox) = inboxes.get(&route.to_node) {
                    table
                        .entry(route.from_port.clone())
                        .or_default()
                        .push((inbox.clone(), route.to_port.clone()));
                }
            }
            routers.push(tokio::spawn(route_outputs(
                name,
                outputs,
                table,
                tap.clone(),
                shutdown.clone(),
            )));
        }

        let mut tasks = Vec::new();
        for (name, node, io) in nodes {
            debug!(%run_id, node = %name, "spawning node");
            tasks.push((name, tokio::spawn(node.run(io))));
        }

        let stopper = tokio::spawn(stop_on_cancel(
            inboxes.values().cloned().collect(),
            shutdown.clone(),
        ));

        info!(%run_id, nodes = tasks.len(), routes = self.routes.len(), "dataflow started");
        Ok(RunningDataflow {
            run_id,
            inboxes,
            tap,
            shutdown,
            tasks,
            routers,
            stopper,
        })
    }
}

/// Forward one node's outputs to the tap and to routed inboxes.
async fn route_outputs(
    node: String,
    mut outputs: mpsc::UnboundedReceiver<Output>,
    table: HashMap<String, Vec<(EventSender, String)>>,
    tap: broadcast::Sender<DataflowEvent>,
    shutdown: CancellationToken,
) {
    while let Some(output) = outputs.recv().await {
        // No subscribers is fine.
        let _ = tap.send(DataflowEvent {
            node: node.clone(),
            output: output.clone(),
        });
        let targets = if shutdown.is_cancelled() {
            None
        } else {
            table.get(&output.port)
        };
        for (inbox, port) in targets.into_iter().flatten() {
            if let Err(e) = inbox
                .input(port, output.value.clone(), output.metadata.clone())
                .await
            {
                debug!(from = %node, port = %output.port, "route target gone: {e}");
            }
        }
    }
    debug!(node = %node, "router finished");
}

async fn stop_on_cancel(inboxes: Vec<EventSender>, shutdown: CancellationToken) {
    shutdown.cancelled().await;
    for inbox in inboxes {
        if let Err(e) = inbox.stop().await {
            debug!("node already stopped: {e}");
        }
    }
}

/// A started dataflow.
pub struct RunningDataflow {
    run_id: Uuid,
    inboxes: HashMap<String, EventSender>,
    tap: broadcast::Sender<DataflowEvent>,
    shutdown: CancellationToken,
    tasks: Vec<(String, JoinHandle<Result<()>>)>,
    routers: Vec<JoinHandle<()>>,
    stopper: JoinHandle<()>,
}

impl RunningDataflow {
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Observe every output emitted from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DataflowEvent> {
        self.tap.subscribe()
    }

    /// Deliver an external input to `node.port`.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is unknown or has stopped.
    pub async fn send(
        &self,
        node: &str,
        port: &str,
        value: impl Into<PortValue>,
        metadata: Metadata,
    ) -> Result<()> {
        let inbox = self
            .inboxes
            .get(node)
            .ok_or_else(|| HarnessError::Node(format!("unknown node: {node}")))?;
        inbox.input(port, value, metadata).await
    }

    /// Stop every node and wait for all tasks to finish.
    ///
    /// # Errors
    ///
    /// Returns the first node failure, if any.
    pub async fn shutdown(self) -> Result<()> {
        info!(run_id = %self.run_id, "dataflow shutting down");
        self.shutdown.cancel();
        if let Err(e) = self.stopper.await {
            warn!("stop task failed: {e}");
        }

        let mut first_error = None;
        for (name, task) in self.tasks {
            let result = task
                .await
                .map_err(|e| HarnessError::Node(format!("{name} task failed: {e}")))
                .and_then(|r| r);
            if let Err(e) = result {
                error!(node = %name, "node failed: {e}");
                first_error.get_or_insert(e);
            }
        }
        drop(self.inboxes);
        for router in self.routers {
            if let Err(e) = router.await {
                warn!("router task failed: {e}");
            }
        }
        info!(run_id = %self.run_id, "dataflow stopped");
        first_error.map_or(Ok(()), Err)
    }
}

/// Component names accepted by [`component_node`].
pub const COMPONENTS: [&str; 5] = ["segmenter", "coordinator", "responder", "synth", "bridge"];

/// Build a single component for running under an external runtime.
///
/// Responder and synth serve `config.participant()`, the bridge routes to
/// `config.bridge_target()`.
///
/// # Errors
///
/// Returns [`HarnessError::Config`] for an unknown component or invalid
/// configuration.
pub fn component_node(component: &str, config: &HarnessConfig) -> Result<Box<dyn Node>> {
    config.validate()?;
    let node: Box<dyn Node> = match component {
        "segmenter" => Box::new(SegmenterNode::new(config.rotation(), &config.segmenter)),
        "coordinator" | "controller" => Box::new(CoordinatorNode::new(
            config.rotation(),
            &config.coordinator,
        )?),
        "responder" => Box::new(ResponderNode::new(
            config.participant(),
            &config.responder,
        )),
        "synth" => Box::new(SynthNode::new(config.participant(), &config.synth)),
        "bridge" => Box::new(BridgeNode::new(
            config.bridge_target(),
            config.rotation(),
            &config.bridge,
        )),
        other => {
            return Err(HarnessError::Config(format!(
                "unknown component {other:?}; expected one of {}",
                COMPONENTS.join(", ")
            )));
        }
    };
    Ok(node)
}

/// Build the conversation topology for `config`'s rotation.
///
/// # Errors
///
/// Returns an error if the configuration is invalid.
pub fn conversation_dataflow(config: &HarnessConfig) -> Result<Dataflow> {
    config.validate()?;
    let rotation = config.rotation();
    let mut flow = Dataflow::new(config.dataflow.event_capacity);

    flow.add_node(Box::new(CoordinatorNode::new(
        rotation.clone(),
        &config.coordinator,
    )?))?;
    flow.add_node(Box::new(SegmenterNode::new(
        rotation.clone(),
        &config.segmenter,
    )))?;

    for speaker in &rotation {
        let bridge = bridge_node_name(speaker);
        let responder = responder_node_name(speaker);
        let synth = synth_node_name(speaker);

        flow.add_node(Box::new(BridgeNode::new(
            speaker.clone(),
            rotation.clone(),
            &config.bridge,
        )))?;
        flow.add_node(Box::new(ResponderNode::new(
            speaker.clone(),
            &config.responder,
        )))?;
        flow.add_node(Box::new(SynthNode::new(speaker.clone(), &config.synth)))?;

        flow.connect(CONTROLLER_NODE, &speaker.control_port(), &bridge, "control")
            .connect(CONTROLLER_NODE, PARTICIPANTS_CONTROL_PORT, &responder, "control")
            .connect(CONTROLLER_NODE, PARTICIPANTS_CONTROL_PORT, &synth, "control")
            .connect(&bridge, "text", &responder, "text")
            .connect(&responder, "text", SEGMENTER_NODE, speaker.as_str())
            .connect(&responder, "text", CONTROLLER_NODE, speaker.as_str())
            .connect(SEGMENTER_NODE, &speaker.segment_port(), &synth, "text");
    }
    Ok(flow)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::node::{NodeEvent, NodeIo};
    use async_trait::async_trait;
    use std::time::Duration;

    /// Echoes every `in` input to `out`.
    struct Echo(&'static str);

    #[async_trait]
    impl Node for Echo {
        fn name(&self) -> &str {
            self.0
        }

        async fn run(self: Box<Self>, mut io: NodeIo) -> Result<()> {
            while let Some(event) = io.recv().await {
                match event {
                    NodeEvent::Input(input) if input.id == "in" => {
                        io.outputs().send("out", input.value, input.metadata)?;
                    }
                    NodeEvent::Stop => break,
                    _ => {}
                }
            }
            io.outputs().send_text("log", format!("[{}] Shutdown complete", self.0))?;
            Ok(())
        }
    }

    #[test]
    fn duplicate_node_names_are_rejected() {
        let mut flow = Dataflow::new(8);
        flow.add_node(Box::new(Echo("a"))).unwrap();
        assert!(flow.add_node(Box::new(Echo("a"))).is_err());
    }

    #[tokio::test]
    async fn unknown_route_target_is_rejected() {
        let mut flow = Dataflow::new(8);
        flow.add_node(Box::new(Echo("a"))).unwrap();
        flow.connect("a", "out", "missing", "in");
        assert!(flow.start().is_err());
    }

    #[tokio::test]
    async fn outputs_follow_routes_and_reach_the_tap() {
        let mut flow = Dataflow::new(8);
        flow.add_node(Box::new(Echo("a"))).unwrap();
        flow.add_node(Box::new(Echo("b"))).unwrap();
        flow.connect("a", "out", "b", "in");

        let running = flow.start().unwrap();
        let mut tap = running.subscribe();
        running.send("a", "in", "ping", Metadata::new()).await.unwrap();

        let seen = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let event = tap.recv().await.unwrap();
                if event.node == "b" && event.output.port == "out" {
                    return event;
                }
            }
        })
        .await
        .expect("routed output within timeout");
        assert_eq!(seen.output.value.as_text().unwrap(), "ping");

        running.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_stops_every_node() {
        let mut flow = Dataflow::new(8);
        flow.add_node(Box::new(Echo("a"))).unwrap();
        flow.add_node(Box::new(Echo("b"))).unwrap();
        let running = flow.start().unwrap();
        let mut tap = running.subscribe();

        tokio::time::timeout(Duration::from_secs(2), running.shutdown())
            .await
            .expect("shutdown within timeout")
            .unwrap();

        let mut logs = Vec::new();
        while let Ok(event) = tap.try_recv() {
            if event.output.port == "log" {
                logs.push(event.node);
            }
        }
        logs.sort();
        assert_eq!(logs, vec!["a", "b"]);
    }

    #[test]
    fn component_nodes_are_named_by_role() {
        let mut config = HarnessConfig::default();
        config.speakers.participant = "techer".to_owned();
        assert_eq!(
            component_node("responder", &config).unwrap().name(),
            "responder_techer"
        );
        assert_eq!(component_node("synth", &config).unwrap().name(), "synth_techer");
        assert_eq!(
            component_node("bridge", &config).unwrap().name(),
            "bridge_myself"
        );
        assert_eq!(
            component_node("coordinator", &config).unwrap().name(),
            "controller"
        );
        assert!(component_node("mixer", &config).is_err());
    }

    #[test]
    fn conversation_topology_wires_every_speaker() {
        let flow = conversation_dataflow(&HarnessConfig::default()).unwrap();
        let names = flow.node_names();
        for expected in [
            "controller",
            "segmenter",
            "bridge_techer",
            "responder_techer",
            "synth_techer",
            "bridge_myself",
            "responder_myself",
            "synth_myself",
        ] {
            assert!(names.contains(&expected), "missing node {expected}");
        }
        assert!(flow.routes().contains(&Route {
            from_node: "controller".to_owned(),
            from_port: "control_myself".to_owned(),
            to_node: "bridge_myself".to_owned(),
            to_port: "control".to_owned(),
        }));
        assert!(flow.routes().contains(&Route {
            from_node: "segmenter".to_owned(),
            from_port: "text_segment_techer".to_owned(),
            to_node: "synth_techer".to_owned(),
            to_port: "text".to_owned(),
        }));
    }
}
