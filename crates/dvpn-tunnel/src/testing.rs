//! Counting fakes for [`TunnelSetup`] and [`CryptoDevice`].
//!
//! Every tunnel established, device opened, closed and waited on is counted
//! so tests can assert that no platform resource outlives its owner.

use crate::setup::{
    CryptoDevice, CryptoDeviceFactory, DeviceError, PeerStatistics, SetupError,
    TunnelDescriptor, TunnelSetup,
};
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Traffic reported by a fake device for each registered peer
pub const FAKE_TRAFFIC: PeerStatistics = PeerStatistics {
    bytes_sent: 1024,
    bytes_received: 4096,
};

/// Shared resource counters
#[derive(Debug, Default)]
pub struct ResourceCounters {
    tunnels_established: AtomicUsize,
    devices_opened: AtomicUsize,
    devices_closed: AtomicUsize,
    devices_waited: AtomicUsize,
    sockets_protected: AtomicUsize,
}

impl ResourceCounters {
    pub fn tunnels_established(&self) -> usize {
        self.tunnels_established.load(Ordering::SeqCst)
    }

    pub fn devices_opened(&self) -> usize {
        self.devices_opened.load(Ordering::SeqCst)
    }

    pub fn devices_closed(&self) -> usize {
        self.devices_closed.load(Ordering::SeqCst)
    }

    pub fn devices_waited(&self) -> usize {
        self.devices_waited.load(Ordering::SeqCst)
    }

    pub fn sockets_protected(&self) -> usize {
        self.sockets_protected.load(Ordering::SeqCst)
    }

    /// Devices opened but not yet closed
    pub fn open_devices(&self) -> usize {
        self.devices_opened().saturating_sub(self.devices_closed())
    }
}

/// Recorded [`TunnelSetup`] call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupCall {
    NewTunnel,
    AddTunnelAddress(IpAddr, u8),
    AddRoute(IpAddr, u8),
    AddDns(IpAddr),
    SetBlocking(bool),
    SetMtu(u16),
    Establish,
    Protect(TunnelDescriptor),
    SetSessionName(String),
}

/// Fake platform tunnel builder
#[derive(Debug)]
pub struct FakeTunnelSetup {
    counters: Arc<ResourceCounters>,
    calls: Mutex<Vec<SetupCall>>,
    fail_establish: AtomicBool,
    fail_protect: AtomicBool,
    next_descriptor: AtomicI32,
}

impl FakeTunnelSetup {
    /// Setup that succeeds and counts tunnels in `counters`
    pub fn new(counters: Arc<ResourceCounters>) -> Self {
        Self {
            counters,
            calls: Mutex::new(Vec::new()),
            fail_establish: AtomicBool::new(false),
            fail_protect: AtomicBool::new(false),
            next_descriptor: AtomicI32::new(10),
        }
    }

    /// Make the next `establish` calls fail
    pub fn fail_establish(&self) {
        self.fail_establish.store(true, Ordering::SeqCst);
    }

    /// Make the next `protect` calls fail
    pub fn fail_protect(&self) {
        self.fail_protect.store(true, Ordering::SeqCst);
    }

    /// Calls received so far
    pub fn calls(&self) -> Vec<SetupCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: SetupCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl TunnelSetup for FakeTunnelSetup {
    fn new_tunnel(&self) {
        self.record(SetupCall::NewTunnel);
    }

    fn add_tunnel_address(&self, ip: IpAddr, prefix_len: u8) {
        self.record(SetupCall::AddTunnelAddress(ip, prefix_len));
    }

    fn add_route(&self, route: IpAddr, prefix_len: u8) {
        self.record(SetupCall::AddRoute(route, prefix_len));
    }

    fn add_dns(&self, ip: IpAddr) {
        self.record(SetupCall::AddDns(ip));
    }

    fn set_blocking(&self, blocking: bool) {
        self.record(SetupCall::SetBlocking(blocking));
    }

    fn set_mtu(&self, mtu: u16) {
        self.record(SetupCall::SetMtu(mtu));
    }

    fn establish(&self) -> Result<TunnelDescriptor, SetupError> {
        self.record(SetupCall::Establish);
        if self.fail_establish.load(Ordering::SeqCst) {
            return Err(SetupError::Establish("permission denied".into()));
        }
        self.counters.tunnels_established.fetch_add(1, Ordering::SeqCst);
        Ok(TunnelDescriptor(self.next_descriptor.fetch_add(1, Ordering::SeqCst)))
    }

    fn protect(&self, socket: TunnelDescriptor) -> Result<(), SetupError> {
        self.record(SetupCall::Protect(socket));
        if self.fail_protect.load(Ordering::SeqCst) {
            return Err(SetupError::Protect {
                socket,
                reason: "vpn service revoked".into(),
            });
        }
        self.counters.sockets_protected.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn set_session_name(&self, name: &str) {
        self.record(SetupCall::SetSessionName(name.to_string()));
    }
}

/// Recorded [`CryptoDevice`] call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    SetListeningPort(u16),
    SetPrivateKey([u8; 32]),
    AddPeer([u8; 32], SocketAddr),
    Close,
    Wait,
}

type PeerScript = Arc<Mutex<VecDeque<Result<Vec<PeerStatistics>, DeviceError>>>>;

/// Factory handing out [`FakeDevice`]s
#[derive(Debug)]
pub struct FakeDeviceFactory {
    counters: Arc<ResourceCounters>,
    calls: Arc<Mutex<Vec<DeviceCall>>>,
    script: PeerScript,
    fail_open: AtomicBool,
    fail_socket: AtomicBool,
}

impl FakeDeviceFactory {
    /// Factory whose devices report to `counters`
    pub fn new(counters: Arc<ResourceCounters>) -> Self {
        Self {
            counters,
            calls: Arc::new(Mutex::new(Vec::new())),
            script: Arc::new(Mutex::new(VecDeque::new())),
            fail_open: AtomicBool::new(false),
            fail_socket: AtomicBool::new(false),
        }
    }

    /// Queue the answer for one upcoming `peers()` query.
    ///
    /// Once the queue is empty, devices report [`FAKE_TRAFFIC`] for every
    /// registered peer.
    pub fn script_peers(&self, report: Result<Vec<PeerStatistics>, DeviceError>) {
        self.script.lock().unwrap().push_back(report);
    }

    /// Fail every following open
    pub fn fail_open(&self) {
        self.fail_open.store(true, Ordering::SeqCst);
    }

    /// Devices opened from now on fail to hand out their socket
    pub fn fail_socket(&self) {
        self.fail_socket.store(true, Ordering::SeqCst);
    }

    /// Calls received by all devices from this factory
    pub fn calls(&self) -> Vec<DeviceCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl CryptoDeviceFactory for FakeDeviceFactory {
    fn open(&self, tunnel: TunnelDescriptor, _mtu: u16) -> Result<Box<dyn CryptoDevice>, DeviceError> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(DeviceError::Open(format!("bad descriptor {}", tunnel)));
        }
        self.counters.devices_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeDevice {
            counters: self.counters.clone(),
            calls: self.calls.clone(),
            script: self.script.clone(),
            fail_socket: self.fail_socket.load(Ordering::SeqCst),
            peers: Vec::new(),
            closed: false,
        }))
    }
}

/// In-memory crypto device
#[derive(Debug)]
pub struct FakeDevice {
    counters: Arc<ResourceCounters>,
    calls: Arc<Mutex<Vec<DeviceCall>>>,
    script: PeerScript,
    fail_socket: bool,
    peers: Vec<[u8; 32]>,
    closed: bool,
}

impl FakeDevice {
    fn record(&self, call: DeviceCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl CryptoDevice for FakeDevice {
    fn set_listening_port(&mut self, port: u16) -> Result<(), DeviceError> {
        self.record(DeviceCall::SetListeningPort(port));
        Ok(())
    }

    fn set_private_key(&mut self, key: &[u8; 32]) -> Result<(), DeviceError> {
        self.record(DeviceCall::SetPrivateKey(*key));
        Ok(())
    }

    fn add_peer(&mut self, public_key: &[u8; 32], endpoint: SocketAddr) -> Result<(), DeviceError> {
        self.record(DeviceCall::AddPeer(*public_key, endpoint));
        self.peers.push(*public_key);
        Ok(())
    }

    fn peers(&self) -> Result<Vec<PeerStatistics>, DeviceError> {
        if self.closed {
            return Err(DeviceError::Closed);
        }
        if let Some(report) = self.script.lock().unwrap().pop_front() {
            return report;
        }
        Ok(self.peers.iter().map(|_| FAKE_TRAFFIC).collect())
    }

    fn network_socket(&self) -> Result<TunnelDescriptor, DeviceError> {
        if self.fail_socket {
            return Err(DeviceError::Query("socket not bound".into()));
        }
        Ok(TunnelDescriptor(99))
    }

    fn close(&mut self) {
        self.record(DeviceCall::Close);
        self.closed = true;
        self.counters.devices_closed.fetch_add(1, Ordering::SeqCst);
    }

    fn wait(&mut self) {
        self.record(DeviceCall::Wait);
        self.counters.devices_waited.fetch_add(1, Ordering::SeqCst);
    }
}
