use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use chat_relay::config::{DEFAULT_MAX_LINE_LENGTH, DEFAULT_PORT};
use chat_relay::{Server, ServerConfig};

#[derive(Parser)]
#[command(name = "server", about = "Chat-X line relay server")]
struct Args {
    /// TCP address to listen on
    #[arg(long, default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)))]
    addr: SocketAddr,

    /// Send chat lines as `[name]: msg` instead of `[HH:MM:SS] name: msg`
    #[arg(long)]
    no_timestamps: bool,

    /// Lines buffered per client before it is dropped as stalled
    #[arg(long, default_value_t = 256)]
    outbound_buffer: usize,

    /// Capacity of the broadcast queue
    #[arg(long, default_value_t = 1024)]
    dispatch_queue: usize,

    /// Longest line a client may send before it is disconnected
    #[arg(long, default_value_t = DEFAULT_MAX_LINE_LENGTH)]
    max_line_length: usize,

    /// Maximum concurrent connections (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    max_connections: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = ServerConfig::with_addr(args.addr)
        .timestamps(!args.no_timestamps)
        .outbound_buffer(args.outbound_buffer)
        .dispatch_queue(args.dispatch_queue)
        .max_line_length(args.max_line_length)
        .max_connections(args.max_connections);

    let srv = Arc::new(Server::new(config));

    tokio::select! {
        result = srv.listen_and_serve() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
        }
    }
    Ok(())
}
