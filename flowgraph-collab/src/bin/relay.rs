//! flowgraph-relay — signaling and relay server.
//!
//! Usage: `flowgraph-relay [bind_addr]`. Falls back to
//! `FLOWGRAPH_RELAY_ADDR`, then `127.0.0.1:9090`. Log level via `RUST_LOG`.

use log::{error, info};

use flowgraph_collab::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let mut config = RelayConfig::default();
    if let Some(addr) = std::env::args().nth(1).or_else(|| std::env::var("FLOWGRAPH_RELAY_ADDR").ok()) {
        config.bind_addr = addr;
    }

    info!("Starting flowgraph relay on {}...", config.bind_addr);
    let server = RelayServer::new(config);
    if let Err(e) = server.run().await {
        error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}
