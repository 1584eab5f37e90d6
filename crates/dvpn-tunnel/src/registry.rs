//! Connection Registry
//!
//! Maps a service type name to the factory that builds its tunnels. The
//! registry is a plain value owned by whoever composes the node; there is no
//! process-wide table.

use crate::config::{ConnectOptions, TunnelOptions, WireguardServiceConfig};
use crate::connection::{ConnectionError, PreparedConnection};
use crate::setup::{CryptoDeviceFactory, TunnelSetup};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Service type name of wireguard sessions
pub const SERVICE_WIREGUARD: &str = "wireguard";

/// Builds a connection for one service type
pub trait ConnectionFactory: Send + Sync {
    fn create(&self, options: &ConnectOptions) -> Result<PreparedConnection, ConnectionError>;
}

impl<F> ConnectionFactory for F
where
    F: Fn(&ConnectOptions) -> Result<PreparedConnection, ConnectionError> + Send + Sync,
{
    fn create(&self, options: &ConnectOptions) -> Result<PreparedConnection, ConnectionError> {
        self(options)
    }
}

/// Factory for wireguard tunnels on a given platform
pub struct WireguardConnectionFactory {
    setup: Arc<dyn TunnelSetup>,
    devices: Arc<dyn CryptoDeviceFactory>,
    options: TunnelOptions,
}

impl WireguardConnectionFactory {
    /// Factory building wireguard tunnels with the given platform hooks
    pub fn new(
        setup: Arc<dyn TunnelSetup>,
        devices: Arc<dyn CryptoDeviceFactory>,
        options: TunnelOptions,
    ) -> Self {
        Self { setup, devices, options }
    }
}

impl ConnectionFactory for WireguardConnectionFactory {
    fn create(&self, options: &ConnectOptions) -> Result<PreparedConnection, ConnectionError> {
        let config = WireguardServiceConfig::from_slice(&options.session_config)?;

        let mut tunnel_options = self.options.clone();
        if tunnel_options.session_name.is_none() {
            tunnel_options.session_name = options.session_id.clone();
        }

        debug!("Building wireguard tunnel for proposal {}", options.proposal_id);
        PreparedConnection::establish(
            self.setup.as_ref(),
            self.devices.as_ref(),
            &config,
            &tunnel_options,
        )
    }
}

/// Service type → connection factory
#[derive(Default)]
pub struct ConnectionRegistry {
    factories: HashMap<String, Arc<dyn ConnectionFactory>>,
}

impl ConnectionRegistry {
    /// Registry with no service types
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory, replacing any previous one for the same type
    pub fn register(&mut self, service_type: impl Into<String>, factory: impl ConnectionFactory + 'static) {
        let service_type = service_type.into();
        if self.factories.insert(service_type.clone(), Arc::new(factory)).is_some() {
            warn!("Connection factory for {} replaced", service_type);
        }
    }

    /// Build a connection for the given service type
    pub fn create(
        &self,
        service_type: &str,
        options: &ConnectOptions,
    ) -> Result<PreparedConnection, RegistryError> {
        let factory = self.factories
            .get(service_type)
            .ok_or_else(|| RegistryError::UnknownServiceType(service_type.to_string()))?;
        Ok(factory.create(options)?)
    }

    /// Registered service types, sorted
    pub fn service_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

/// Registry errors
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("No connection factory for service type {0}")]
    UnknownServiceType(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}
