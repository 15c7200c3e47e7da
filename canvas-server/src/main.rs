//! Canvas sync server: serves shared canvas documents over WebSocket.
//!
//! Documents live in RocksDB when `--data-dir` is given, otherwise in
//! memory for the lifetime of the process.

use clap::Parser;
use log::{error, info};
use std::path::PathBuf;

use canvas_sync::channel::DEFAULT_CHANNEL_CAPACITY;
use canvas_sync::{ServerConfig, SyncServer};

#[derive(Parser, Debug)]
#[command(name = "canvas-server")]
#[command(about = "Real-time sync server for shared canvas documents")]
#[command(version)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "CANVAS_BIND", default_value = "127.0.0.1:9090")]
    bind: String,

    /// RocksDB directory; documents are kept in memory when omitted
    #[arg(long, env = "CANVAS_DATA_DIR", value_name = "PATH")]
    data_dir: Option<PathBuf>,

    /// Buffered notifications per subscriber before it starts lagging
    #[arg(long, env = "CANVAS_CHANNEL_CAPACITY", default_value_t = DEFAULT_CHANNEL_CAPACITY)]
    channel_capacity: usize,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind,
            channel_capacity: self.channel_capacity.max(1),
            storage_path: self.data_dir,
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config();
    match &config.storage_path {
        Some(path) => info!("Storing documents in {}", path.display()),
        None => info!("No data directory given, documents are kept in memory"),
    }

    let server = match SyncServer::open(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to open document store: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run().await {
        error!("Server stopped: {e}");
        std::process::exit(1);
    }
}
