//! Tunnel Configuration
//!
//! The wireguard session config as negotiated with the provider, plus the
//! local options that shape how the tunnel interface is brought up.

use crate::keys::KeyError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

/// MTU that fits wireguard encapsulation under common path MTUs
pub const DEFAULT_MTU: u16 = 1280;

/// Smallest MTU an IPv4 interface may use
pub const MIN_MTU: u16 = 576;

/// How often peer traffic counters are sampled
pub const DEFAULT_STATISTICS_INTERVAL: Duration = Duration::from_secs(1);

/// Network endpoint (IP + port)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// IP address
    pub addr: IpAddr,
    /// UDP port
    pub port: u16,
}

impl Endpoint {
    /// Create a new endpoint
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self { addr, port }
    }

    /// Convert to SocketAddr
    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr: SocketAddr = s.trim()
            .parse()
            .map_err(|_| ConfigError::InvalidEndpoint(s.to_string()))?;
        if addr.port() == 0 {
            return Err(ConfigError::InvalidEndpoint(s.to_string()));
        }
        Ok(Self::new(addr.ip(), addr.port()))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_socket_addr())
    }
}

/// Address with prefix length, e.g. `10.182.0.2/24`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Subnet {
    ip: IpAddr,
    prefix_len: u8,
}

impl Subnet {
    /// Create a subnet, checking the prefix against the address family
    pub fn new(ip: IpAddr, prefix_len: u8) -> Result<Self, ConfigError> {
        let max = if ip.is_ipv4() { 32 } else { 128 };
        if prefix_len > max {
            return Err(ConfigError::InvalidSubnet(format!("{}/{}", ip, prefix_len)));
        }
        Ok(Self { ip, prefix_len })
    }

    /// Interface address
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// Prefix length in bits
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }
}

impl FromStr for Subnet {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidSubnet(s.to_string());

        let (ip, prefix) = s.trim().split_once('/').ok_or_else(invalid)?;
        let ip: IpAddr = ip.parse().map_err(|_| invalid())?;
        let prefix_len: u8 = prefix.parse().map_err(|_| invalid())?;
        Self::new(ip, prefix_len)
    }
}

impl TryFrom<String> for Subnet {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Subnet> for String {
    fn from(subnet: Subnet) -> Self {
        subnet.to_string()
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ip, self.prefix_len)
    }
}

/// Provider side of the wireguard session config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    /// Provider public key (base64)
    pub public_key: String,
    /// Provider UDP endpoint, `ip:port`
    pub endpoint: String,
}

/// Consumer side of the wireguard session config
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerConfig {
    /// Consumer private key (base64)
    pub private_key: String,
}

impl fmt::Debug for ConsumerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerConfig")
            .field("private_key", &"[redacted]")
            .finish()
    }
}

/// Session config exchanged for the wireguard service type.
///
/// Keys and endpoint stay in their text form here; they are decoded while
/// the tunnel is being built so that malformed values surface as
/// construction errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireguardServiceConfig {
    pub provider: ProviderConfig,
    pub consumer: ConsumerConfig,
    /// Tunnel address assigned to the consumer, e.g. `10.182.0.2/24`
    pub subnet: String,
}

impl WireguardServiceConfig {
    /// Decode from serialized session config bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ConfigError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Local options for bringing up a tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelOptions {
    /// Interface MTU
    pub mtu: u16,
    /// Statistics sampling interval
    pub statistics_interval: Duration,
    /// Device listening port (0 = random)
    pub listen_port: u16,
    /// DNS servers pushed to the interface
    pub dns: Vec<IpAddr>,
    /// Routes sent through the tunnel
    pub routes: Vec<Subnet>,
    /// Name shown for the tunnel session by the platform
    pub session_name: Option<String>,
}

impl TunnelOptions {
    /// Validate options
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mtu < MIN_MTU {
            return Err(ConfigError::InvalidMtu(self.mtu));
        }
        if self.statistics_interval.is_zero() {
            return Err(ConfigError::ZeroInterval);
        }
        Ok(())
    }
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            statistics_interval: DEFAULT_STATISTICS_INTERVAL,
            listen_port: 0,
            dns: Vec::new(),
            routes: Vec::new(),
            session_name: None,
        }
    }
}

/// What a caller hands to a connection factory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Selected proposal
    pub proposal_id: i64,
    /// Session the tunnel is built for, if already known
    pub session_id: Option<String>,
    /// Serialized session config, interpreted per service type
    pub session_config: Vec<u8>,
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Invalid subnet: {0}")]
    InvalidSubnet(String),

    #[error("Invalid key: {0}")]
    Key(#[from] KeyError),

    #[error("Invalid MTU: {0}")]
    InvalidMtu(u16),

    #[error("Statistics interval must be non-zero")]
    ZeroInterval,

    #[error("Malformed session config: {0}")]
    Decode(#[from] serde_json::Error),
}
