use std::path::PathBuf;

use clap::Parser;
use ysync_relay::{ServerConfig, SyncServer};

/// CRDT sync relay with a persistent update log.
#[derive(Debug, Parser)]
#[command(name = "ysync-relay", version, about)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "YSYNC_BIND", default_value = "127.0.0.1:9090")]
    bind: String,

    /// Shared secret clients present in Sec-WebSocket-Protocol
    #[arg(long, env = "YSYNC_TOKEN")]
    token: Option<String>,

    /// RocksDB directory; in-memory storage when omitted
    #[arg(long, env = "YSYNC_STORAGE")]
    storage: Option<PathBuf>,

    /// Compact a document once its log exceeds this many updates
    #[arg(long, env = "YSYNC_TRIM_THRESHOLD", default_value_t = 500)]
    trim_threshold: usize,

    /// Debug logging unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    let config = ServerConfig {
        bind_addr: args.bind,
        auth_token: args.token,
        storage_path: args.storage,
        trim_threshold: args.trim_threshold,
        ..ServerConfig::default()
    };

    let server = SyncServer::new(config)?;
    server.run().await
}
