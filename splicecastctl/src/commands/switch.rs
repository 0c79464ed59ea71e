use std::path::PathBuf;

use clap::Args;
use serde::Serialize;
use splicecast_core::process::describe_status;
use splicecast_core::splice::TS_PACKET_SIZE;
use splicecast_core::{
    CommandDescriptor, Passthrough, ProcessChain, SpliceState, SplicingSink, Switch,
    SwitchOutcome, SwitchSettings, WriterSink,
};
use tokio::fs::OpenOptions;
use tracing::info;

use crate::{render, seconds, AppError, DisplayFallback, OutputFormat, Result};

#[derive(Args, Debug)]
pub struct SwitchArgs {
    /// FIFO or file receiving the switched stream
    #[arg(long, value_name = "PATH")]
    pub fifo: PathBuf,
    /// Shell command writing the placeholder stream to stdout
    #[arg(long, value_name = "CMD")]
    pub placeholder_cmd: String,
    /// Shell command writing the live stream to stdout
    #[arg(long, value_name = "CMD")]
    pub live_cmd: String,
    /// Seconds the placeholder keeps running after live data appears
    #[arg(long, default_value_t = 0.0)]
    pub switch_grace: f64,
    /// Rewrite live timestamps to continue the placeholder timeline
    #[arg(long)]
    pub splice: bool,
    /// Bytes per read
    #[arg(long, default_value_t = 188 * 256)]
    pub chunk_size: usize,
}

#[derive(Debug, Serialize)]
struct SwitchReport {
    outcome: &'static str,
    placeholder_bytes: u64,
    live_bytes: u64,
    live_exit: Option<String>,
    splice: Option<SpliceState>,
}

impl SwitchReport {
    fn new(outcome: SwitchOutcome, splice: Option<SpliceState>) -> Self {
        let (name, placeholder_bytes, live_bytes) = match outcome {
            SwitchOutcome::Completed {
                placeholder_bytes,
                live_bytes,
            } => ("completed", placeholder_bytes, live_bytes),
            SwitchOutcome::SinkClosed => ("sink_closed", 0, 0),
        };
        Self {
            outcome: name,
            placeholder_bytes,
            live_bytes,
            live_exit: None,
            splice,
        }
    }
}

impl DisplayFallback for SwitchReport {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "Switch {}: placeholder {} bytes, live {} bytes",
            self.outcome, self.placeholder_bytes, self.live_bytes
        )];
        if let Some(exit) = &self.live_exit {
            lines.push(format!("Live chain: {exit}"));
        }
        if let Some(state) = &self.splice {
            let offset = state
                .pts_offset
                .map(|offset| offset.to_string())
                .unwrap_or_else(|| "-".to_string());
            lines.push(format!("PTS offset: {offset}"));
        }
        lines.join("\n")
    }
}

pub async fn run(args: &SwitchArgs, format: OutputFormat) -> Result<()> {
    let settings = SwitchSettings {
        chunk_size: args.chunk_size.max(TS_PACKET_SIZE),
        switch_grace: seconds(args.switch_grace),
        ..SwitchSettings::default()
    };
    // opening a FIFO blocks until its reader shows up
    let output = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&args.fifo)
        .await?;
    info!(path = %args.fifo.display(), "switch output opened");

    let mut placeholder = ProcessChain::spawn(
        "placeholder",
        &[CommandDescriptor::shell(args.placeholder_cmd.as_str())],
        None,
    )?;
    let mut live = ProcessChain::spawn(
        "live",
        &[CommandDescriptor::shell(args.live_cmd.as_str())],
        None,
    )?;

    let switch = Switch::new(settings);
    let writer = WriterSink::new(output);
    let (outcome, splice) = if args.splice {
        let mut sink = SplicingSink::new(writer);
        let outcome = switch.run(&mut placeholder, &mut live, &mut sink).await?;
        (outcome, Some(*sink.splicer().state()))
    } else {
        let mut sink = Passthrough(writer);
        (switch.run(&mut placeholder, &mut live, &mut sink).await?, None)
    };

    let mut report = SwitchReport::new(outcome, splice);
    if let SwitchOutcome::Completed { .. } = outcome {
        let status = live.wait().await?;
        let described = describe_status(&status);
        if !status.success() {
            return Err(AppError::ChainFailed {
                chain: "live".to_string(),
                status: described,
            });
        }
        report.live_exit = Some(described);
    }
    render(&report, format)
}
