//! Process entrypoint: parses configuration, wires up a mixnode, and runs
//! it until interrupted.
//!
//! Exit codes: 0 success, 1 configuration error, 2 crypto/key error,
//! 3 reputation snapshot corruption.

use betanet_mixcore::{MixNode, MixnodeError, MixnodeTrait, NodeConfig};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config = NodeConfig::parse();

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut node = match MixNode::new(config) {
        Ok(node) => node,
        Err(e) => {
            tracing::error!("failed to build mixnode: {}", e);
            std::process::exit(exit_code_for(&e));
        }
    };

    if let Err(e) = node.start().await {
        tracing::error!("failed to start mixnode: {}", e);
        std::process::exit(exit_code_for(&e));
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
    }

    tracing::info!("shutting down");
    if let Err(e) = node.stop().await {
        tracing::error!("error during shutdown: {}", e);
        std::process::exit(exit_code_for(&e));
    }
}

fn exit_code_for(error: &MixnodeError) -> i32 {
    match error {
        MixnodeError::Config(_) => 1,
        MixnodeError::Crypto(_) | MixnodeError::Vrf(_) => 2,
        MixnodeError::CorruptSnapshot(_) => 3,
        MixnodeError::Io(_)
        | MixnodeError::Packet(_)
        | MixnodeError::Routing(_)
        | MixnodeError::Network(_)
        | MixnodeError::Protocol(_) => 3,
    }
}
