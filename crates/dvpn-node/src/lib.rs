//! dVPN Node - consumer node assembly
//!
//! Ties session negotiation and tunnel connections together behind
//! [`Node`], with TOML configuration, session history and the JSON DTOs
//! served to local clients.

pub mod api;
pub mod config;
pub mod history;
mod node;

pub use config::{NodeConfig, NodeConfigError};
pub use history::{
    HistoryError, JsonFileSessionStorage, MemorySessionStorage, SessionHistoryRecord,
    SessionStorage,
};
pub use node::{wireguard_negotiator, ActiveConnection, ConnectRequest, Node, NodeError};
