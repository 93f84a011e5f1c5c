//! Diagram collaboration hub
//!
//! Serves relay rooms (`/relay/<room>`) and CRDT rooms (`/crdt/<room>`) over
//! WebSocket.
//!
//! # Usage
//!
//! ```bash
//! diagram-hub --bind 0.0.0.0:9090 --max-peers 50
//! RUST_LOG=debug diagram-hub
//! ```

use clap::Parser;
use diagram_collab::{Hub, HubConfig};
use log::info;

#[derive(Parser)]
#[command(name = "diagram-hub")]
#[command(version)]
#[command(about = "Real-time collaboration hub for the diagram editor")]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:9090")]
    bind: String,
    /// Frames buffered per connection before slow readers skip
    #[arg(long, default_value_t = 256)]
    capacity: usize,
    /// Connections allowed per room
    #[arg(long, default_value_t = 100)]
    max_peers: usize,
}

impl From<Cli> for HubConfig {
    fn from(cli: Cli) -> Self {
        HubConfig {
            bind_addr: cli.bind,
            broadcast_capacity: cli.capacity,
            max_peers_per_room: cli.max_peers,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = HubConfig::from(Cli::parse());
    info!("Starting diagram hub on {}...", config.bind_addr);

    Hub::new(config).run().await
}
