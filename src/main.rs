// src/main.rs
//
// Process entry point: load config (falling back to defaults), init
// logging, bind the node, optionally join a bootstrap peer, then wait for
// Ctrl-C to shut down cleanly — the same overall shape as the teacher's
// `main.rs` minus the demo integrations this crate has no use for.

use anyhow::Result;
use kadcoin::config::{load_config, NodeConfig};
use kadcoin::logging::init_logging;
use kadcoin::node::Node;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/node.yaml".to_string());
    let config: NodeConfig = match load_config(&cfg_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("could not load {cfg_path} ({e}); using defaults");
            NodeConfig::default()
        }
    };

    init_logging(&config.log_level);

    let bootstrap = config.bootstrap_addr.clone();
    let node = Node::bind(config).await?;
    info!("node {} listening on {}", node.id, node.local_addr());
    node.run();

    if let Some(addr) = bootstrap {
        match addr.parse() {
            Ok(addr) => {
                if let Err(e) = node.join(addr).await {
                    warn!("join {addr} failed: {e}");
                }
            }
            Err(e) => warn!("invalid bootstrap_addr {addr}: {e}"),
        }
    }

    info!("node running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    node.stop();
    Ok(())
}
