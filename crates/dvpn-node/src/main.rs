//! dvpn-node: consumer node entry point
//!
//! Loads the node configuration (first argument, defaults otherwise), sets
//! up logging and prints the recorded session history as client JSON.

use anyhow::{Context, Result};
use dvpn_node::api::SessionList;
use dvpn_node::{JsonFileSessionStorage, NodeConfig, SessionStorage};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

fn main() -> Result<()> {
    let config = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => NodeConfig::load(&path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => NodeConfig::default(),
    };

    // RUST_LOG overrides the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log.level))
        .context("invalid log level")?;
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("dvpn-node starting...");

    let history = JsonFileSessionStorage::open(&config.history.path)?;
    let sessions = SessionList::from_records(&history.get_all()?);
    info!("{} sessions in history", sessions.sessions.len());

    println!("{}", serde_json::to_string_pretty(&sessions)?);
    Ok(())
}
