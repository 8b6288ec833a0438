//! Runs one harness component over stdin/stdout for an external dataflow
//! runtime.
//!
//! Usage: `parley-node <segmenter|coordinator|responder|synth|bridge>`
//!
//! Events arrive as newline-delimited JSON on stdin and outputs leave the
//! same way on stdout. All tracing/diagnostic output goes to stderr so that
//! stdout remains a clean JSON protocol channel.

use parley::HarnessConfig;
use parley::dataflow::{COMPONENTS, component_node};
use parley::node::stdio::run_stdio_node;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise tracing to stderr only (stdout is reserved for the JSON
    // protocol).
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let component = std::env::args().nth(1).ok_or_else(|| {
        anyhow::anyhow!("usage: parley-node <{}>", COMPONENTS.join("|"))
    })?;

    let config = HarnessConfig::from_env()?;
    let node = component_node(&component, &config)?;
    tracing::info!(component = %component, node = node.name(), "parley-node starting");

    run_stdio_node(node).await.map_err(|e| {
        tracing::error!(error = %e, "parley-node exited with error");
        anyhow::anyhow!("parley-node failed: {e}")
    })?;

    tracing::info!("parley-node shut down cleanly");
    Ok(())
}
