//! Platform capabilities consumed by the tunnel.
//!
//! `TunnelSetup` is implemented by the host platform (VPN service on mobile,
//! a TUN helper on desktop). `CryptoDevice` is the wireguard engine that
//! takes over the established interface. Both are opaque to this crate.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Raw platform handle for an established tunnel or a protected socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TunnelDescriptor(pub i32);

impl fmt::Display for TunnelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd({})", self.0)
    }
}

/// Platform builder for the tunnel interface.
///
/// Calls before [`TunnelSetup::establish`] only accumulate settings for the
/// interface started by [`TunnelSetup::new_tunnel`].
pub trait TunnelSetup: Send + Sync {
    /// Start describing a fresh tunnel interface
    fn new_tunnel(&self);

    /// Assign the interface address
    fn add_tunnel_address(&self, ip: IpAddr, prefix_len: u8);

    /// Route a network through the tunnel
    fn add_route(&self, route: IpAddr, prefix_len: u8);

    /// Push a DNS server to the interface
    fn add_dns(&self, ip: IpAddr);

    /// Select blocking I/O on the interface descriptor
    fn set_blocking(&self, blocking: bool);

    /// Set interface MTU
    fn set_mtu(&self, mtu: u16);

    /// Create the interface and hand back its descriptor
    fn establish(&self) -> Result<TunnelDescriptor, SetupError>;

    /// Exclude a socket from being routed through the tunnel
    fn protect(&self, socket: TunnelDescriptor) -> Result<(), SetupError>;

    /// Label the tunnel session for the platform UI
    fn set_session_name(&self, name: &str);
}

/// Traffic counters of one device peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PeerStatistics {
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Wireguard engine bound to one tunnel interface.
pub trait CryptoDevice: Send {
    /// Set the UDP listening port (0 picks a random port)
    fn set_listening_port(&mut self, port: u16) -> Result<(), DeviceError>;

    /// Install the local private key
    fn set_private_key(&mut self, key: &[u8; 32]) -> Result<(), DeviceError>;

    /// Register a remote peer
    fn add_peer(&mut self, public_key: &[u8; 32], endpoint: SocketAddr) -> Result<(), DeviceError>;

    /// Traffic counters of all registered peers
    fn peers(&self) -> Result<Vec<PeerStatistics>, DeviceError>;

    /// Socket the device sends encrypted traffic from
    fn network_socket(&self) -> Result<TunnelDescriptor, DeviceError>;

    /// Begin shutting the device down
    fn close(&mut self);

    /// Block until shutdown finished
    fn wait(&mut self);
}

/// Wraps an established interface descriptor as a [`CryptoDevice`].
///
/// Once `open` is called the descriptor belongs to the factory, whether or
/// not it succeeds.
pub trait CryptoDeviceFactory: Send + Sync {
    fn open(&self, tunnel: TunnelDescriptor, mtu: u16) -> Result<Box<dyn CryptoDevice>, DeviceError>;
}

/// Tunnel setup errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum SetupError {
    #[error("Failed to establish tunnel interface: {0}")]
    Establish(String),

    #[error("Failed to protect socket {socket}: {reason}")]
    Protect {
        socket: TunnelDescriptor,
        reason: String,
    },
}

/// Crypto device errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeviceError {
    #[error("Failed to open device: {0}")]
    Open(String),

    #[error("Device rejected configuration: {0}")]
    Configure(String),

    #[error("Device query failed: {0}")]
    Query(String),

    #[error("Device is closed")]
    Closed,
}
