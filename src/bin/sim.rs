//! Runs the whole simulated conversation in-process and prints the
//! segmented transcript.
//!
//! Usage: `parley-sim [--turns N]`

use parley::dataflow::{CONTROLLER_NODE, SEGMENTER_NODE};
use parley::node::Metadata;
use parley::{DataflowEvent, HarnessConfig, conversation_dataflow};
use tokio::sync::broadcast::error::RecvError;

const DEFAULT_TURNS: usize = 4;

fn parse_turns() -> anyhow::Result<usize> {
    let mut args = std::env::args().skip(1);
    let mut turns = DEFAULT_TURNS;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--turns" => {
                let value = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--turns needs a value"))?;
                turns = value
                    .parse()
                    .map_err(|e| anyhow::anyhow!("invalid --turns value {value:?}: {e}"))?;
            }
            other => anyhow::bail!("unknown argument {other:?}; usage: parley-sim [--turns N]"),
        }
    }
    Ok(turns)
}

#[derive(Default)]
struct Transcript {
    turns: usize,
    segments: usize,
    audio_bytes: usize,
}

impl Transcript {
    fn observe(&mut self, event: &DataflowEvent) {
        let output = &event.output;
        if event.node == SEGMENTER_NODE {
            if let Some(speaker) = output.port.strip_prefix("text_segment_") {
                self.segments += 1;
                let text = output.value.as_text().unwrap_or_default();
                println!("{speaker}: {text}");
            }
        } else if output.port == "audio" {
            self.audio_bytes += output.value.len();
        } else if event.node.starts_with("responder_")
            && output.status().is_some_and(|s| s["status"] == "complete")
        {
            self.turns += 1;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let turns = parse_turns()?;
    let config = HarnessConfig::from_env()?;
    let running = conversation_dataflow(&config)?.start()?;
    let mut tap = running.subscribe();
    tracing::info!(run_id = %running.run_id(), turns, "simulation starting");

    running
        .send(CONTROLLER_NODE, "control", "start", Metadata::new())
        .await?;

    let mut transcript = Transcript::default();
    while transcript.turns < turns {
        tokio::select! {
            event = tap.recv() => match event {
                Ok(event) => transcript.observe(&event),
                Err(RecvError::Lagged(n)) => tracing::warn!(lagged = n, "transcript lagged"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
        }
    }

    running
        .send(CONTROLLER_NODE, "control", "stop", Metadata::new())
        .await?;
    running.shutdown().await?;
    // The final flush of the last reply may still be in the tap.
    while let Ok(event) = tap.try_recv() {
        transcript.observe(&event);
    }

    println!(
        "-- {} turns, {} segments, {} bytes of audio",
        transcript.turns, transcript.segments, transcript.audio_bytes
    );
    Ok(())
}
