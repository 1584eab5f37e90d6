//! Node composition root
//!
//! Owns the connection registry and the session history. A connect call
//! builds the tunnel for the requested service type, starts the connection
//! and records the session; [`ActiveConnection::finish`] tears it down and
//! writes the final traffic into history.

use crate::api::StatisticsDto;
use crate::config::NodeConfig;
use crate::history::{HistoryError, SessionHistoryRecord, SessionStorage};
use dvpn_session::{Creator, Identity, JsonConfigProvider, SessionId, SessionNegotiator};
use dvpn_tunnel::{
    ConnectOptions, ConnectionError, ConnectionFactory, ConnectionRegistry, CryptoDeviceFactory,
    RegistryError, TunnelConnection, TunnelOptions, TunnelSetup, WireguardConnectionFactory,
    WireguardServiceConfig, SERVICE_WIREGUARD,
};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tracing::{info, warn};

/// What the caller selected to connect to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub service_type: String,
    pub session_id: SessionId,
    pub provider_id: Identity,
    pub provider_country: String,
    pub proposal_id: i64,
    /// Session config as negotiated, opaque to the node
    pub session_config: Vec<u8>,
}

/// Consumer node
pub struct Node {
    registry: ConnectionRegistry,
    history: Arc<dyn SessionStorage>,
    tunnel_options: TunnelOptions,
}

impl Node {
    /// Node with no registered services
    pub fn new(config: &NodeConfig, history: Arc<dyn SessionStorage>) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            history,
            tunnel_options: config.tunnel_options(),
        }
    }

    /// Register a connection factory for a service type
    pub fn register_service(
        &mut self,
        service_type: impl Into<String>,
        factory: impl ConnectionFactory + 'static,
    ) {
        self.registry.register(service_type, factory);
    }

    /// Register wireguard on the given platform capabilities
    pub fn register_wireguard(
        &mut self,
        setup: Arc<dyn TunnelSetup>,
        devices: Arc<dyn CryptoDeviceFactory>,
    ) {
        let factory = WireguardConnectionFactory::new(setup, devices, self.tunnel_options.clone());
        self.registry.register(SERVICE_WIREGUARD, factory);
    }

    /// Service types this node can connect to
    pub fn service_types(&self) -> Vec<&str> {
        self.registry.service_types()
    }

    /// All recorded sessions
    pub fn history(&self) -> Result<Vec<SessionHistoryRecord>, NodeError> {
        Ok(self.history.get_all()?)
    }

    /// Bring up the tunnel for a negotiated session
    pub fn connect(&self, request: ConnectRequest) -> Result<ActiveConnection, NodeError> {
        let options = ConnectOptions {
            proposal_id: request.proposal_id,
            session_id: Some(request.session_id.to_string()),
            session_config: request.session_config,
        };
        let prepared = self.registry.create(&request.service_type, &options)?;
        let connection = prepared.start()?;

        // Only sessions that actually started are recorded
        let record = SessionHistoryRecord::started(
            request.session_id.clone(),
            request.provider_id,
            request.service_type,
            request.provider_country,
        );
        if let Err(e) = self.history.save(record) {
            warn!("Session {} not recorded, disconnecting: {}", request.session_id, e);
            connection.stop();
            connection.wait();
            return Err(e.into());
        }
        info!("Session {} connected", request.session_id);

        Ok(ActiveConnection {
            session_id: request.session_id,
            connection,
            history: self.history.clone(),
            started: Instant::now(),
        })
    }
}

/// Negotiator answering `session-create` with wireguard configs
pub fn wireguard_negotiator(peer_id: Identity, creator: Arc<dyn Creator>) -> SessionNegotiator {
    SessionNegotiator::new(
        peer_id,
        creator,
        Arc::new(JsonConfigProvider::<WireguardServiceConfig>::new()),
    )
}

/// Running connection with its history entry
pub struct ActiveConnection {
    session_id: SessionId,
    connection: TunnelConnection,
    history: Arc<dyn SessionStorage>,
    started: Instant,
}

impl ActiveConnection {
    /// Session this connection was started for
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Underlying tunnel connection
    pub fn connection(&self) -> &TunnelConnection {
        &self.connection
    }

    /// Latest sample and time since connect
    pub fn statistics(&self) -> StatisticsDto {
        StatisticsDto::new(self.connection.latest_statistics(), self.started.elapsed())
    }

    /// Stop the tunnel, wait for its release and record the final traffic
    pub async fn finish(self) -> Result<SessionHistoryRecord, NodeError> {
        self.connection.stop();
        self.connection.wait_async().await;

        let stats = self.connection.latest_statistics();
        if let Err(e) = self.history.update(&self.session_id, SystemTime::now(), stats) {
            warn!("Session {} history not updated: {}", self.session_id, e);
            return Err(e.into());
        }
        info!(
            "Session {} finished: {} bytes sent, {} bytes received",
            self.session_id, stats.bytes_sent, stats.bytes_received
        );

        self.history
            .get_all()?
            .into_iter()
            .find(|r| r.session_id == self.session_id)
            .ok_or_else(|| HistoryError::NotFound(self.session_id.clone()).into())
    }
}

/// Node errors
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    History(#[from] HistoryError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::MemorySessionStorage;
    use dvpn_session::{
        CreateError, CreateRequest, DestroyCallback, RawConfig, ResponseKind,
        ServiceConfiguration, Session,
    };
    use dvpn_tunnel::testing::{FakeDeviceFactory, FakeTunnelSetup, ResourceCounters};
    use dvpn_tunnel::{ConsumerConfig, PrivateKey, ProviderConfig, SessionStatistics};
    use std::time::Duration;

    struct Fixture {
        node: Node,
        counters: Arc<ResourceCounters>,
        history: Arc<MemorySessionStorage>,
    }

    fn fixture() -> Fixture {
        let mut config = NodeConfig::default();
        config.tunnel.statistics_interval_ms = 10;

        let counters = Arc::new(ResourceCounters::default());
        let history = Arc::new(MemorySessionStorage::new());
        let mut node = Node::new(&config, history.clone());
        node.register_wireguard(
            Arc::new(FakeTunnelSetup::new(counters.clone())),
            Arc::new(FakeDeviceFactory::new(counters.clone())),
        );
        Fixture {
            node,
            counters,
            history,
        }
    }

    fn wireguard_config() -> WireguardServiceConfig {
        WireguardServiceConfig {
            provider: ProviderConfig {
                public_key: PrivateKey::generate().public_key().to_base64(),
                endpoint: "203.0.113.9:51820".to_string(),
            },
            consumer: ConsumerConfig {
                private_key: PrivateKey::generate().to_base64(),
            },
            subnet: "10.182.0.2/24".to_string(),
        }
    }

    fn connect_request(session_config: Vec<u8>) -> ConnectRequest {
        ConnectRequest {
            service_type: SERVICE_WIREGUARD.to_string(),
            session_id: SessionId::new("abc"),
            provider_id: Identity::new("0xprovider"),
            provider_country: "NL".to_string(),
            proposal_id: 3,
            session_config,
        }
    }

    #[tokio::test]
    async fn test_connect_and_finish_records_history() {
        let f = fixture();
        let request = connect_request(serde_json::to_vec(&wireguard_config()).unwrap());

        let active = f.node.connect(request).unwrap();
        assert_eq!(f.counters.open_devices(), 1);
        let recorded = f.node.history().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].time_updated, None);

        let sample = active
            .connection()
            .statistics()
            .recv_timeout(Duration::from_secs(2))
            .unwrap();
        assert!(sample.bytes_received > 0);

        let record = active.finish().await.unwrap();
        assert_eq!(f.counters.open_devices(), 0);
        assert_eq!(record.session_id, SessionId::new("abc"));
        assert_eq!(record.provider_country, "NL");
        assert!(record.time_updated.is_some());
        assert_ne!(record.data_stats, SessionStatistics::default());
        assert_eq!(f.history.get_all().unwrap()[0], record);
    }

    #[test]
    fn test_unknown_service_type_not_recorded() {
        let f = fixture();
        let request = ConnectRequest {
            service_type: "openvpn".to_string(),
            ..connect_request(Vec::new())
        };

        assert!(matches!(
            f.node.connect(request),
            Err(NodeError::Registry(RegistryError::UnknownServiceType(_)))
        ));
        assert!(f.node.history().unwrap().is_empty());
    }

    #[test]
    fn test_bad_session_config_leaks_nothing() {
        let f = fixture();
        let mut config = wireguard_config();
        config.consumer.private_key = "c2hvcnQ=".to_string();

        let err = f
            .node
            .connect(connect_request(serde_json::to_vec(&config).unwrap()))
            .err()
            .unwrap();
        assert!(matches!(
            err,
            NodeError::Registry(RegistryError::Connection(ref e)) if e.is_configuration()
        ));
        assert_eq!(f.counters.open_devices(), 0);
        assert!(f.node.history().unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_session_releases_device() {
        let f = fixture();
        f.history
            .save(SessionHistoryRecord::started(
                SessionId::new("abc"),
                Identity::new("0xprovider"),
                SERVICE_WIREGUARD,
                "NL",
            ))
            .unwrap();

        let result = f
            .node
            .connect(connect_request(serde_json::to_vec(&wireguard_config()).unwrap()));
        assert!(matches!(result, Err(NodeError::History(HistoryError::Duplicate(_)))));
        assert_eq!(f.counters.open_devices(), 0);
        assert_eq!(f.counters.devices_opened(), 1);
        assert_eq!(f.counters.devices_waited(), 1);
        assert_eq!(f.node.history().unwrap().len(), 1);
    }

    struct EchoCreator;

    impl Creator for EchoCreator {
        fn create(
            &self,
            consumer_id: Identity,
            _proposal_id: i64,
            config: ServiceConfiguration,
            destroy_callback: DestroyCallback,
        ) -> Result<Session, CreateError> {
            if config.downcast_ref::<WireguardServiceConfig>().is_none() {
                return Err(CreateError::Failed("unexpected config type".into()));
            }
            Ok(Session::new(
                SessionId::new("abc"),
                config,
                consumer_id,
                destroy_callback,
            ))
        }
    }

    #[test]
    fn test_wireguard_negotiator_roundtrip() {
        let negotiator = wireguard_negotiator(Identity::new("0xpeer"), Arc::new(EchoCreator));
        let config = wireguard_config();

        let response = negotiator.handle(CreateRequest {
            proposal_id: 3,
            config: RawConfig(serde_json::to_vec(&config).unwrap()),
        });
        assert_eq!(response.kind(), ResponseKind::Success);
        let echoed = WireguardServiceConfig::from_slice(response.session.config.as_bytes()).unwrap();
        assert_eq!(echoed, config);

        let response = negotiator.handle(CreateRequest {
            proposal_id: 3,
            config: RawConfig(br#"{"subnet":"10.0.0.2/24"}"#.to_vec()),
        });
        assert_eq!(response.kind(), ResponseKind::InternalError);
    }
}
