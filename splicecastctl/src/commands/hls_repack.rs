use std::path::PathBuf;

use clap::Args;
use serde::Serialize;
use splicecast_core::{HlsRepackager, HlsSection, HlsSettings};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{render, seconds, DisplayFallback, OutputFormat, Result};

#[derive(Args, Debug)]
pub struct HlsRepackArgs {
    /// Playlist written by the upstream segmenter
    #[arg(long, value_name = "PATH")]
    pub source_manifest: PathBuf,
    /// Directory receiving renumbered segments and index.m3u8
    #[arg(long, value_name = "DIR")]
    pub output_dir: PathBuf,
    /// Seconds between manifest polls
    #[arg(long, default_value_t = 0.5)]
    pub poll_interval: f64,
    /// Seconds to wait for a listed segment to become stable
    #[arg(long, default_value_t = 15.0)]
    pub segment_timeout: f64,
    /// Duration advertised for every segment
    #[arg(long, default_value_t = 4.0)]
    pub segment_duration: f64,
    /// Segments kept in the output playlist
    #[arg(long, default_value_t = 8)]
    pub keep_segments: usize,
    /// Seconds without new source segments before the last one is repeated; 0 disables
    #[arg(long, default_value_t = 20.0)]
    pub gap_timeout: f64,
}

impl HlsRepackArgs {
    fn settings(&self) -> HlsSettings {
        let mut settings = HlsSettings::from_section(
            &HlsSection::default(),
            self.source_manifest.clone(),
            self.output_dir.clone(),
        );
        settings.poll_interval = seconds(self.poll_interval).max(seconds(0.001));
        settings.segment_timeout = seconds(self.segment_timeout);
        settings.segment_duration = self.segment_duration;
        settings.keep_segments = self.keep_segments.max(1);
        settings.gap_timeout = seconds(self.gap_timeout);
        settings
    }
}

#[derive(Debug, Serialize)]
struct RepackReport {
    manifest: PathBuf,
    segments_emitted: u64,
}

impl DisplayFallback for RepackReport {
    fn display(&self) -> String {
        format!(
            "{} segments published to {}",
            self.segments_emitted,
            self.manifest.display()
        )
    }
}

pub async fn run(args: &HlsRepackArgs, format: OutputFormat) -> Result<()> {
    let mut repackager = HlsRepackager::new(args.settings()).await?;
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupt received, stopping repackager"),
            Err(err) => warn!(error = %err, "failed to listen for interrupt"),
        }
        interrupt.cancel();
    });

    repackager.run(cancel).await?;
    render(
        &RepackReport {
            manifest: repackager.manifest_path(),
            segments_emitted: repackager.next_sequence(),
        },
        format,
    )
}
