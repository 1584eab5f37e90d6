//! Tunnel Connection
//!
//! Owns one established tunnel interface and the crypto device wrapped
//! around it, and drives the connection lifecycle:
//!
//! ```text
//! NotConnected ─start()─▶ Connecting ─▶ Connected ─stop()─▶ Disconnecting ─cleanup─▶ NotConnected
//!                                           │                                      (stream closed)
//!                                           └── statistics sampled every interval
//! ```
//!
//! # Threads
//!
//! Building the tunnel happens on the caller's thread in
//! [`PreparedConnection::establish`]. After [`PreparedConnection::start`]
//! the device moves into a dedicated statistics worker, which is the only
//! code that touches it until it is closed. `stop()` never touches the
//! device; it drops a close-only stop channel that the worker observes.
//!
//! # Teardown order
//!
//! 1. statistics stream closed
//! 2. device closed, waited on and its handle dropped
//! 3. `NotConnected` emitted, state stream closed
//! 4. completion signalled, waking `wait()`

use crate::config::{ConfigError, Endpoint, Subnet, TunnelOptions, WireguardServiceConfig};
use crate::device::OwnedDevice;
use crate::keys::{KeyError, PrivateKey, PublicKey};
use crate::setup::{CryptoDevice, CryptoDeviceFactory, DeviceError, SetupError, TunnelSetup};
use crossbeam_channel::{bounded, select, tick, unbounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Samples buffered on the statistics stream before new ones are dropped
const STATISTICS_BUFFER: usize = 64;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No tunnel (initial and terminal)
    NotConnected,
    /// Tunnel is coming up
    Connecting,
    /// Tunnel is carrying traffic
    Connected,
    /// Teardown requested
    Disconnecting,
}

impl ConnectionState {
    /// Name used in client status responses
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::NotConnected => "NotConnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnecting => "Disconnecting",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Instantaneous traffic counters of the tunnel peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatistics {
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Latest sample, readable without draining the stream
#[derive(Debug, Default)]
struct StatisticsSnapshot {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    faults: AtomicU64,
}

impl StatisticsSnapshot {
    fn store(&self, stats: SessionStatistics) {
        self.bytes_sent.store(stats.bytes_sent, Ordering::Relaxed);
        self.bytes_received.store(stats.bytes_received, Ordering::Relaxed);
    }

    fn load(&self) -> SessionStatistics {
        SessionStatistics {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// A tunnel that is fully built but not started.
///
/// Dropping it releases the crypto device.
pub struct PreparedConnection {
    device: OwnedDevice,
    interval: Duration,
    state_tx: Sender<ConnectionState>,
    state_rx: Receiver<ConnectionState>,
    stats_tx: Sender<SessionStatistics>,
    stats_rx: Receiver<SessionStatistics>,
}

impl PreparedConnection {
    /// Build the tunnel interface and configure a crypto device on it.
    ///
    /// On error every resource acquired so far has already been released
    /// and no state has been emitted.
    pub fn establish(
        setup: &dyn TunnelSetup,
        devices: &dyn CryptoDeviceFactory,
        config: &WireguardServiceConfig,
        options: &TunnelOptions,
    ) -> Result<Self, ConnectionError> {
        options.validate()?;
        let subnet: Subnet = config.subnet.parse()?;

        let mut device = OwnedDevice::new(open_tunnel_device(setup, devices, &subnet, options)?);
        configure_device(&mut *device, config, options.listen_port)?;

        let socket = device.network_socket()?;
        setup.protect(socket)?;
        debug!("Protected device socket {}", socket);

        let (state_tx, state_rx) = unbounded();
        let (stats_tx, stats_rx) = bounded(STATISTICS_BUFFER);

        info!("Tunnel established on {}", subnet);
        Ok(Self {
            device,
            interval: options.statistics_interval,
            state_tx,
            state_rx,
            stats_tx,
            stats_rx,
        })
    }

    /// State event stream
    pub fn states(&self) -> Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Statistics event stream
    pub fn statistics(&self) -> Receiver<SessionStatistics> {
        self.stats_rx.clone()
    }

    /// Start the connection.
    ///
    /// Emits `Connecting` and `Connected`, then lets the statistics worker
    /// run. If the worker cannot be spawned nothing is emitted and the
    /// device is released.
    pub fn start(self) -> Result<TunnelConnection, ConnectionError> {
        let PreparedConnection {
            device,
            interval,
            state_tx,
            state_rx,
            stats_tx,
            stats_rx,
        } = self;

        let (stop_tx, stop_rx) = bounded::<Infallible>(0);
        let (release_tx, release_rx) = bounded::<Infallible>(0);
        let (done_tx, done_rx) = bounded::<Infallible>(0);
        let snapshot = Arc::new(StatisticsSnapshot::default());

        let worker = StatisticsWorker {
            device,
            interval,
            state_tx: state_tx.clone(),
            stats_tx,
            snapshot: snapshot.clone(),
            done: done_tx,
        };

        let handle = thread::Builder::new()
            .name("tunnel-statistics".to_string())
            .spawn(move || worker.run(release_rx, stop_rx))
            .map_err(ConnectionError::Spawn)?;

        let _ = state_tx.send(ConnectionState::Connecting);
        let _ = state_tx.send(ConnectionState::Connected);
        drop(release_tx);
        info!("Tunnel connection started");

        Ok(TunnelConnection {
            control: Mutex::new(Some(Control {
                stop: stop_tx,
                states: state_tx,
            })),
            stopping: AtomicBool::new(false),
            done: done_rx,
            state_rx,
            stats_rx,
            snapshot,
            worker: Mutex::new(Some(handle)),
        })
    }
}

/// Steps 1-5 of construction: interface up, device wrapped around it.
fn open_tunnel_device(
    setup: &dyn TunnelSetup,
    devices: &dyn CryptoDeviceFactory,
    subnet: &Subnet,
    options: &TunnelOptions,
) -> Result<Box<dyn CryptoDevice>, ConnectionError> {
    setup.new_tunnel();
    if let Some(name) = &options.session_name {
        setup.set_session_name(name);
    }
    setup.add_tunnel_address(subnet.ip(), subnet.prefix_len());
    for route in &options.routes {
        setup.add_route(route.ip(), route.prefix_len());
    }
    for dns in &options.dns {
        setup.add_dns(*dns);
    }
    setup.set_mtu(options.mtu);
    setup.set_blocking(true);

    let tunnel = setup.establish()?;
    debug!("Tunnel interface established as {}", tunnel);

    Ok(devices.open(tunnel, options.mtu)?)
}

/// Steps 6-7 of construction: keys and the single provider peer.
fn configure_device(
    device: &mut dyn CryptoDevice,
    config: &WireguardServiceConfig,
    listen_port: u16,
) -> Result<(), ConnectionError> {
    device.set_listening_port(listen_port)?;

    let private_key = PrivateKey::from_base64(&config.consumer.private_key)?;
    device.set_private_key(&private_key.to_bytes())?;

    let public_key = PublicKey::from_base64(&config.provider.public_key)?;
    let endpoint: Endpoint = config.provider.endpoint.parse()?;
    device.add_peer(&public_key.to_bytes(), endpoint.to_socket_addr())?;

    debug!("Registered provider peer {:?} at {}", public_key, endpoint);
    Ok(())
}

/// What `stop()` hands over exactly once
struct Control {
    stop: Sender<Infallible>,
    states: Sender<ConnectionState>,
}

/// A running tunnel connection.
///
/// Dropping it requests a stop but does not wait for cleanup.
pub struct TunnelConnection {
    control: Mutex<Option<Control>>,
    stopping: AtomicBool,
    done: Receiver<Infallible>,
    state_rx: Receiver<ConnectionState>,
    stats_rx: Receiver<SessionStatistics>,
    snapshot: Arc<StatisticsSnapshot>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TunnelConnection {
    /// State event stream
    pub fn states(&self) -> Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Statistics event stream
    pub fn statistics(&self) -> Receiver<SessionStatistics> {
        self.stats_rx.clone()
    }

    /// Most recent successful sample (zero before the first one)
    pub fn latest_statistics(&self) -> SessionStatistics {
        self.snapshot.load()
    }

    /// Number of sampling ticks skipped because of a device fault
    pub fn statistics_faults(&self) -> u64 {
        self.snapshot.faults.load(Ordering::Relaxed)
    }

    /// Request teardown.
    ///
    /// Emits `Disconnecting` and signals the worker. Calls after the first
    /// are no-ops.
    pub fn stop(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            debug!("Tunnel connection already stopping");
            return;
        }

        info!("Stopping tunnel connection");
        let control = match self.control.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(Control { stop, states }) = control {
            let _ = states.send(ConnectionState::Disconnecting);
            drop(states);
            drop(stop);
        }
    }

    /// Block until cleanup finished: `NotConnected` emitted, state stream
    /// closed and the device released.
    pub fn wait(&self) {
        let _ = self.done.recv();

        let handle = match self.worker.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Tunnel statistics worker panicked");
            }
        }
    }

    /// [`wait`](Self::wait) for async callers
    pub async fn wait_async(&self) {
        let done = self.done.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || {
            let _ = done.recv();
        })
        .await
        {
            warn!("Waiting for tunnel cleanup failed: {}", e);
        }
    }
}

impl Drop for TunnelConnection {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Outcome of one wait in the worker loop
enum Tick {
    Sample,
    Stop,
}

/// Background task owning the device while the connection runs
struct StatisticsWorker {
    device: OwnedDevice,
    interval: Duration,
    state_tx: Sender<ConnectionState>,
    stats_tx: Sender<SessionStatistics>,
    snapshot: Arc<StatisticsSnapshot>,
    done: Sender<Infallible>,
}

impl StatisticsWorker {
    fn run(self, release: Receiver<Infallible>, stop: Receiver<Infallible>) {
        // Parked until start() has emitted Connected
        let _ = release.recv();
        debug!("Statistics worker running every {:?}", self.interval);

        let ticker = tick(self.interval);
        loop {
            let event = select! {
                recv(stop) -> _ => Tick::Stop,
                recv(ticker) -> _ => Tick::Sample,
            };
            match event {
                Tick::Sample => self.sample(),
                Tick::Stop => break,
            }
        }

        self.cleanup();
    }

    fn sample(&self) {
        let peers = match self.device.peers() {
            Ok(peers) => peers,
            Err(e) => {
                self.snapshot.faults.fetch_add(1, Ordering::Relaxed);
                warn!("Error updating statistics: {}", e);
                return;
            }
        };

        let [peer] = peers.as_slice() else {
            self.snapshot.faults.fetch_add(1, Ordering::Relaxed);
            warn!("Error updating statistics: exactly 1 peer expected, got {}", peers.len());
            return;
        };

        let stats = SessionStatistics {
            bytes_sent: peer.bytes_sent,
            bytes_received: peer.bytes_received,
        };
        self.snapshot.store(stats);

        match self.stats_tx.try_send(stats) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(_)) => debug!("Statistics stream full, sample dropped"),
        }
    }

    fn cleanup(self) {
        let StatisticsWorker {
            mut device,
            state_tx,
            stats_tx,
            done,
            ..
        } = self;

        drop(stats_tx);
        device.shutdown();
        // Handle gone before anyone can observe completion
        drop(device);

        let _ = state_tx.send(ConnectionState::NotConnected);
        drop(state_tx);
        info!("Tunnel connection closed");

        drop(done);
    }
}

/// Tunnel connection errors
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Tunnel setup failed: {0}")]
    Setup(#[from] SetupError),

    #[error("Crypto device failed: {0}")]
    Device(#[from] DeviceError),

    #[error("Failed to spawn statistics worker: {0}")]
    Spawn(#[source] std::io::Error),
}

impl ConnectionError {
    /// Caused by bad session config rather than the platform
    pub fn is_configuration(&self) -> bool {
        matches!(self, ConnectionError::Configuration(_))
    }
}

impl From<KeyError> for ConnectionError {
    fn from(e: KeyError) -> Self {
        ConnectionError::Configuration(ConfigError::Key(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConsumerConfig, ProviderConfig};
    use crate::setup::{PeerStatistics, TunnelDescriptor};
    use crate::testing::{
        DeviceCall, FakeDeviceFactory, FakeTunnelSetup, ResourceCounters, SetupCall, FAKE_TRAFFIC,
    };
    use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
    use crossbeam_channel::TryRecvError;
    use std::net::{IpAddr, Ipv4Addr};

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct Fixture {
        counters: Arc<ResourceCounters>,
        setup: FakeTunnelSetup,
        devices: FakeDeviceFactory,
    }

    fn fixture() -> Fixture {
        let counters = Arc::new(ResourceCounters::default());
        Fixture {
            setup: FakeTunnelSetup::new(counters.clone()),
            devices: FakeDeviceFactory::new(counters.clone()),
            counters,
        }
    }

    fn service_config() -> WireguardServiceConfig {
        WireguardServiceConfig {
            provider: ProviderConfig {
                public_key: PrivateKey::generate().public_key().to_base64(),
                endpoint: "203.0.113.7:51820".to_string(),
            },
            consumer: ConsumerConfig {
                private_key: PrivateKey::generate().to_base64(),
            },
            subnet: "10.182.0.2/24".to_string(),
        }
    }

    fn fast_options() -> TunnelOptions {
        TunnelOptions {
            statistics_interval: Duration::from_millis(10),
            ..TunnelOptions::default()
        }
    }

    impl Fixture {
        fn establish(&self, config: &WireguardServiceConfig) -> Result<PreparedConnection, ConnectionError> {
            PreparedConnection::establish(&self.setup, &self.devices, config, &fast_options())
        }
    }

    #[test]
    fn test_construction_steps_in_order() {
        let f = fixture();
        let config = service_config();
        let prepared = f.establish(&config).unwrap();

        assert_eq!(
            f.setup.calls(),
            vec![
                SetupCall::NewTunnel,
                SetupCall::AddTunnelAddress(IpAddr::V4(Ipv4Addr::new(10, 182, 0, 2)), 24),
                SetupCall::SetMtu(1280),
                SetupCall::SetBlocking(true),
                SetupCall::Establish,
                SetupCall::Protect(TunnelDescriptor(99)),
            ]
        );

        let private = PrivateKey::from_base64(&config.consumer.private_key).unwrap();
        let public = PublicKey::from_base64(&config.provider.public_key).unwrap();
        assert_eq!(
            f.devices.calls(),
            vec![
                DeviceCall::SetListeningPort(0),
                DeviceCall::SetPrivateKey(private.to_bytes()),
                DeviceCall::AddPeer(public.to_bytes(), "203.0.113.7:51820".parse().unwrap()),
            ]
        );

        // Nothing is emitted during construction
        assert_eq!(prepared.states().try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn test_optional_interface_settings_applied() {
        let f = fixture();
        let options = TunnelOptions {
            dns: vec![IpAddr::V4(Ipv4Addr::new(10, 182, 0, 1))],
            routes: vec!["0.0.0.0/0".parse().unwrap()],
            session_name: Some("session-abc".to_string()),
            ..fast_options()
        };
        let _prepared =
            PreparedConnection::establish(&f.setup, &f.devices, &service_config(), &options).unwrap();

        let calls = f.setup.calls();
        assert!(calls.contains(&SetupCall::SetSessionName("session-abc".to_string())));
        assert!(calls.contains(&SetupCall::AddRoute(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)));
        assert!(calls.contains(&SetupCall::AddDns(IpAddr::V4(Ipv4Addr::new(10, 182, 0, 1)))));
    }

    #[test]
    fn test_dropping_prepared_connection_releases_device() {
        let f = fixture();
        let prepared = f.establish(&service_config()).unwrap();
        assert_eq!(f.counters.open_devices(), 1);

        drop(prepared);
        assert_eq!(f.counters.open_devices(), 0);
        assert_eq!(f.counters.devices_waited(), 1);
    }

    #[test]
    fn test_start_emits_connecting_then_connected_before_statistics() {
        let f = fixture();
        let prepared = f.establish(&service_config()).unwrap();
        let states = prepared.states();
        let stats = prepared.statistics();

        let connection = prepared.start().unwrap();
        let sample = stats.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(sample.bytes_sent, FAKE_TRAFFIC.bytes_sent);

        let seen: Vec<_> = states.try_iter().collect();
        assert_eq!(seen, vec![ConnectionState::Connecting, ConnectionState::Connected]);

        connection.stop();
        connection.wait();
    }

    #[test]
    fn test_stop_then_wait_closes_state_stream() {
        let f = fixture();
        let prepared = f.establish(&service_config()).unwrap();
        let states = prepared.states();

        let connection = prepared.start().unwrap();
        connection.stop();
        connection.wait();

        let seen: Vec<_> = states.try_iter().collect();
        assert_eq!(
            seen,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnecting,
                ConnectionState::NotConnected,
            ]
        );
        assert_eq!(states.try_recv(), Err(TryRecvError::Disconnected));
        assert_eq!(f.counters.open_devices(), 0);
        assert_eq!(f.counters.devices_waited(), 1);
    }

    #[test]
    fn test_no_statistics_after_not_connected() {
        let f = fixture();
        let prepared = f.establish(&service_config()).unwrap();
        let states = prepared.states();
        let stats = prepared.statistics();

        let connection = prepared.start().unwrap();
        stats.recv_timeout(TIMEOUT).unwrap();
        connection.stop();

        // Block on the stream itself, not on wait()
        let last = states.iter().last();
        assert_eq!(last, Some(ConnectionState::NotConnected));

        // The statistics stream was already closed when NotConnected went out
        let _buffered = stats.try_iter().count();
        assert_eq!(stats.try_recv(), Err(TryRecvError::Disconnected));
        connection.wait();
    }

    #[test]
    fn test_bad_private_key_length_leaks_nothing() {
        let f = fixture();
        let mut config = service_config();
        config.consumer.private_key = BASE64.encode([1u8; 16]);

        let err = f.establish(&config).err().unwrap();
        assert!(err.is_configuration());
        assert!(matches!(
            err,
            ConnectionError::Configuration(ConfigError::Key(KeyError::InvalidLength(16)))
        ));

        assert_eq!(f.counters.devices_opened(), 1);
        assert_eq!(f.counters.open_devices(), 0);
        assert_eq!(f.counters.sockets_protected(), 0);
    }

    #[test]
    fn test_bad_endpoint_is_configuration_error() {
        let f = fixture();
        let mut config = service_config();
        config.provider.endpoint = "nowhere".to_string();

        let err = f.establish(&config).err().unwrap();
        assert!(matches!(
            err,
            ConnectionError::Configuration(ConfigError::InvalidEndpoint(_))
        ));
        assert_eq!(f.counters.open_devices(), 0);
    }

    #[test]
    fn test_bad_subnet_fails_before_any_setup() {
        let f = fixture();
        let mut config = service_config();
        config.subnet = "10.182.0.2".to_string();

        assert!(f.establish(&config).err().unwrap().is_configuration());
        assert!(f.setup.calls().is_empty());
    }

    #[test]
    fn test_establish_failure_has_no_side_effects() {
        let f = fixture();
        f.setup.fail_establish();

        let err = f.establish(&service_config()).err().unwrap();
        assert!(matches!(err, ConnectionError::Setup(SetupError::Establish(_))));
        assert_eq!(f.counters.devices_opened(), 0);
        assert!(f.devices.calls().is_empty());
    }

    #[test]
    fn test_protect_failure_closes_device() {
        let f = fixture();
        f.setup.fail_protect();

        let err = f.establish(&service_config()).err().unwrap();
        assert!(matches!(err, ConnectionError::Setup(SetupError::Protect { .. })));
        assert_eq!(f.counters.devices_opened(), 1);
        assert_eq!(f.counters.open_devices(), 0);
        assert_eq!(f.devices.calls().last(), Some(&DeviceCall::Wait));
    }

    #[test]
    fn test_device_open_failure_after_establish() {
        let f = fixture();
        f.devices.fail_open();

        let err = f.establish(&service_config()).err().unwrap();
        assert!(matches!(err, ConnectionError::Device(DeviceError::Open(_))));
        assert_eq!(f.counters.tunnels_established(), 1);
        assert_eq!(f.counters.devices_opened(), 0);
        assert_eq!(f.setup.calls().last(), Some(&SetupCall::Establish));
        assert!(f.devices.calls().is_empty());
    }

    #[test]
    fn test_socket_failure_closes_device() {
        let f = fixture();
        f.devices.fail_socket();

        let err = f.establish(&service_config()).err().unwrap();
        assert!(matches!(err, ConnectionError::Device(DeviceError::Query(_))));
        assert_eq!(f.counters.open_devices(), 0);
    }

    #[test]
    fn test_unexpected_peer_count_skips_sample() {
        let f = fixture();
        let two = PeerStatistics { bytes_sent: 1, bytes_received: 1 };
        let one = PeerStatistics { bytes_sent: 10, bytes_received: 20 };
        f.devices.script_peers(Ok(vec![two, two]));
        f.devices.script_peers(Ok(vec![one]));

        let prepared = f.establish(&service_config()).unwrap();
        let stats = prepared.statistics();
        let connection = prepared.start().unwrap();

        let first = stats.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(first, SessionStatistics { bytes_sent: 10, bytes_received: 20 });
        assert_eq!(connection.statistics_faults(), 1);

        // Sampling carries on after the fault
        let next = stats.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(next.bytes_received, FAKE_TRAFFIC.bytes_received);

        connection.stop();
        connection.wait();
    }

    #[test]
    fn test_peer_query_error_is_not_fatal() {
        let f = fixture();
        f.devices.script_peers(Err(DeviceError::Query("ipc timeout".into())));
        f.devices.script_peers(Ok(Vec::new()));

        let prepared = f.establish(&service_config()).unwrap();
        let stats = prepared.statistics();
        let states = prepared.states();
        let connection = prepared.start().unwrap();

        stats.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(connection.statistics_faults(), 2);
        assert_eq!(connection.latest_statistics().bytes_sent, FAKE_TRAFFIC.bytes_sent);
        assert!(!states.try_iter().any(|s| s == ConnectionState::NotConnected));

        connection.stop();
        connection.wait();
    }

    #[test]
    fn test_repeated_stop_is_noop() {
        let f = fixture();
        let prepared = f.establish(&service_config()).unwrap();
        let states = prepared.states();

        let connection = prepared.start().unwrap();
        connection.stop();
        connection.stop();
        connection.wait();
        connection.stop();

        let seen: Vec<_> = states.try_iter().collect();
        let disconnecting = seen.iter().filter(|s| **s == ConnectionState::Disconnecting).count();
        assert_eq!(disconnecting, 1);
        assert_eq!(seen.last(), Some(&ConnectionState::NotConnected));
        assert_eq!(f.counters.devices_closed(), 1);
    }

    #[test]
    fn test_wait_from_another_thread() {
        let f = fixture();
        let prepared = f.establish(&service_config()).unwrap();
        let states = prepared.states();
        let connection = Arc::new(prepared.start().unwrap());

        let waiter = {
            let connection = connection.clone();
            thread::spawn(move || {
                connection.wait();
                states.try_iter().last()
            })
        };

        thread::sleep(Duration::from_millis(30));
        connection.stop();

        let last = waiter.join().unwrap();
        assert_eq!(last, Some(ConnectionState::NotConnected));
        assert_eq!(f.counters.open_devices(), 0);
    }

    #[test]
    fn test_drop_requests_stop() {
        let f = fixture();
        let prepared = f.establish(&service_config()).unwrap();
        let states = prepared.states();

        drop(prepared.start().unwrap());

        let seen: Vec<_> = states.iter().collect();
        assert_eq!(
            &seen[2..],
            &[ConnectionState::Disconnecting, ConnectionState::NotConnected]
        );
        assert_eq!(f.counters.open_devices(), 0);
    }

    #[tokio::test]
    async fn test_wait_async() {
        let f = fixture();
        let prepared = f.establish(&service_config()).unwrap();
        let states = prepared.states();
        let connection = prepared.start().unwrap();

        connection.stop();
        connection.wait_async().await;

        assert_eq!(states.try_iter().last(), Some(ConnectionState::NotConnected));
        assert_eq!(f.counters.devices_waited(), 1);
    }

    /// Device whose handle takes a while to go away after close
    struct SlowReleaseDevice {
        inner: Box<dyn CryptoDevice>,
        released: Arc<AtomicBool>,
    }

    impl CryptoDevice for SlowReleaseDevice {
        fn set_listening_port(&mut self, port: u16) -> Result<(), DeviceError> {
            self.inner.set_listening_port(port)
        }

        fn set_private_key(&mut self, key: &[u8; 32]) -> Result<(), DeviceError> {
            self.inner.set_private_key(key)
        }

        fn add_peer(&mut self, public_key: &[u8; 32], endpoint: std::net::SocketAddr) -> Result<(), DeviceError> {
            self.inner.add_peer(public_key, endpoint)
        }

        fn peers(&self) -> Result<Vec<PeerStatistics>, DeviceError> {
            self.inner.peers()
        }

        fn network_socket(&self) -> Result<TunnelDescriptor, DeviceError> {
            self.inner.network_socket()
        }

        fn close(&mut self) {
            self.inner.close();
        }

        fn wait(&mut self) {
            self.inner.wait();
        }
    }

    impl Drop for SlowReleaseDevice {
        fn drop(&mut self) {
            thread::sleep(Duration::from_millis(200));
            self.released.store(true, Ordering::SeqCst);
        }
    }

    struct SlowReleaseFactory {
        inner: FakeDeviceFactory,
        released: Arc<AtomicBool>,
    }

    impl CryptoDeviceFactory for SlowReleaseFactory {
        fn open(&self, tunnel: TunnelDescriptor, mtu: u16) -> Result<Box<dyn CryptoDevice>, DeviceError> {
            Ok(Box::new(SlowReleaseDevice {
                inner: self.inner.open(tunnel, mtu)?,
                released: self.released.clone(),
            }))
        }
    }

    #[tokio::test]
    async fn test_wait_async_returns_after_device_handle_released() {
        let f = fixture();
        let released = Arc::new(AtomicBool::new(false));
        let devices = SlowReleaseFactory {
            inner: FakeDeviceFactory::new(f.counters.clone()),
            released: released.clone(),
        };

        let prepared =
            PreparedConnection::establish(&f.setup, &devices, &service_config(), &fast_options())
                .unwrap();
        let connection = prepared.start().unwrap();

        connection.stop();
        connection.wait_async().await;

        assert!(released.load(Ordering::SeqCst));
        assert_eq!(f.counters.open_devices(), 0);
    }
}
