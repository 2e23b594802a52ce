//! Roster Node binary
//!
//! Serves the participation ledger over HTTP and the admin socket.

use gemou_roster::{RosterConfig, RosterNode};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roster_node=info,gemou_roster=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Roster Node");

    let config = RosterConfig::from_env()?;

    // Create and run node
    let node = RosterNode::new(config)?;
    node.run().await?;

    Ok(())
}
