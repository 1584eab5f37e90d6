//! dVPN Tunnel - consumer-side wireguard connection
//!
//! Brings up a tunnel interface through the platform's [`TunnelSetup`],
//! hands it to a wireguard [`CryptoDevice`], and runs the connection
//! lifecycle with periodic traffic statistics.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────┐  ConnectOptions  ┌────────────────────────────┐
//! │ ConnectionRegistry │─────────────────▶│ WireguardConnectionFactory │
//! └────────────────────┘                  └─────────────┬──────────────┘
//!                                                       │ establish()
//!                          ┌────────────────────────────▼───────────────┐
//!                          │ PreparedConnection                         │
//!                          │  TunnelSetup: interface, MTU, protect      │
//!                          │  CryptoDevice: keys, provider peer         │
//!                          └────────────────────────────┬───────────────┘
//!                                                       │ start()
//!                          ┌────────────────────────────▼───────────────┐
//!                          │ TunnelConnection ──▶ state stream          │
//!                          │  statistics worker ──▶ statistics stream   │
//!                          └────────────────────────────────────────────┘
//! ```
//!
//! The platform descriptor creation and the wireguard engine itself are
//! external; they are reached only through the traits in [`setup`].

mod config;
mod connection;
mod device;
mod keys;
mod registry;
pub mod setup;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use config::{
    ConfigError, ConnectOptions, ConsumerConfig, Endpoint, ProviderConfig, Subnet, TunnelOptions,
    WireguardServiceConfig, DEFAULT_MTU, DEFAULT_STATISTICS_INTERVAL, MIN_MTU,
};
pub use connection::{
    ConnectionError, ConnectionState, PreparedConnection, SessionStatistics, TunnelConnection,
};
pub use keys::{KeyError, PrivateKey, PublicKey, KEY_LEN};
pub use registry::{
    ConnectionFactory, ConnectionRegistry, RegistryError, WireguardConnectionFactory,
    SERVICE_WIREGUARD,
};
pub use setup::{
    CryptoDevice, CryptoDeviceFactory, DeviceError, PeerStatistics, SetupError, TunnelDescriptor,
    TunnelSetup,
};
