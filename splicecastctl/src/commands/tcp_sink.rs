use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use serde::Serialize;
use splicecast_core::{TcpBroadcaster, TcpSettings};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::{render, seconds, DisplayFallback, OutputFormat, Result};

#[derive(Args, Debug)]
pub struct TcpSinkArgs {
    /// Port to listen on
    #[arg(long)]
    pub port: u16,
    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,
    /// File rewritten with the running byte total
    #[arg(long, value_name = "PATH")]
    pub stats_file: Option<PathBuf>,
    /// Hold stdin until the first client connects
    #[arg(long)]
    pub wait_for_client: bool,
    /// Exit once the last client disconnects
    #[arg(long)]
    pub stop_on_disconnect: bool,
    /// Seconds a client write may stall before that client is dropped
    #[arg(long, default_value_t = 5.0)]
    pub write_timeout: f64,
    /// Bytes read from stdin per chunk
    #[arg(long, default_value_t = 64 * 1024)]
    pub chunk_size: usize,
}

impl TcpSinkArgs {
    fn settings(&self) -> TcpSettings {
        TcpSettings {
            write_timeout: seconds(self.write_timeout),
            chunk_size: self.chunk_size.max(1),
            wait_for_client: self.wait_for_client,
            stop_on_disconnect: self.stop_on_disconnect,
            stats_file: self.stats_file.clone(),
            ..TcpSettings::default()
        }
    }
}

#[derive(Debug, Serialize)]
struct TcpSinkReport {
    addr: String,
    relayed_bytes: u64,
    bytes_total: u64,
}

impl DisplayFallback for TcpSinkReport {
    fn display(&self) -> String {
        format!(
            "tcp sink on {} relayed {} bytes",
            self.addr, self.relayed_bytes
        )
    }
}

pub async fn run(args: &TcpSinkArgs, format: OutputFormat) -> Result<()> {
    let settings = args.settings();
    let drain_limit = settings.write_timeout + Duration::from_secs(1);
    let broadcaster = TcpBroadcaster::bind(&args.host, args.port, settings).await?;
    let relayed = broadcaster.run(tokio::io::stdin()).await?;
    info!(bytes = relayed, "input finished, closing clients");
    broadcaster.shutdown().await;
    if timeout(drain_limit, broadcaster.drained()).await.is_err() {
        warn!(clients = broadcaster.client_count(), "clients still draining at exit");
    }
    render(
        &TcpSinkReport {
            addr: broadcaster.local_addr().to_string(),
            relayed_bytes: relayed,
            bytes_total: broadcaster.bytes_total(),
        },
        format,
    )
}
