//! In-memory radio links for tests and dry runs without hardware.

use crate::agent::{
    AgentBundle, AgentFactory, DisconnectCallback, LocalAgent, RadioAgent, RadioLink,
    RadioPacketCallback,
};
use async_trait::async_trait;
use dashmap::DashMap;
use macp_ipc::IpcTransport;
use macp_types::config::IpcConfig;
use macp_types::{AgentAddress, CallbackTable, CallbackToken, MacpError, MacpResult, RadioPacket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// A radio link that records what is sent and lets tests play the vehicle.
pub struct SimulatedLink {
    uri: String,
    open: AtomicBool,
    fail_open: AtomicBool,
    sent: Mutex<Vec<RadioPacket>>,
    port_callbacks: CallbackTable<u8, RadioPacketCallback>,
    disconnect_callbacks: Mutex<Vec<Arc<DisconnectCallback>>>,
}

impl SimulatedLink {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            open: AtomicBool::new(false),
            fail_open: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            port_callbacks: CallbackTable::new(),
            disconnect_callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Make subsequent [`open`](RadioLink::open) calls fail.
    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Packets sent to the vehicle so far.
    pub fn sent_packets(&self) -> Vec<RadioPacket> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Drain the packets sent to the vehicle so far.
    pub fn take_sent(&self) -> Vec<RadioPacket> {
        std::mem::take(&mut *self.sent.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Deliver `packet` as if the vehicle had sent it.
    pub fn inject(&self, packet: RadioPacket) {
        for callback in self.port_callbacks.snapshot(&packet.port) {
            callback(packet.clone());
        }
    }

    /// Simulate losing the connection.
    pub fn drop_connection(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.notify_disconnected();
    }

    fn notify_disconnected(&self) {
        let callbacks = self
            .disconnect_callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for callback in callbacks {
            callback(&self.uri);
        }
    }
}

#[async_trait]
impl RadioLink for SimulatedLink {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn open(&self) -> MacpResult<()> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(MacpError::ConnectionFailed {
                address: AgentAddress::from_link_uri(&self.uri)
                    .unwrap_or(AgentAddress::CLIENT),
                reason: "simulated link refused connection".to_string(),
            });
        }
        self.open.store(true, Ordering::SeqCst);
        debug!(uri = %self.uri, "Simulated link opened");
        Ok(())
    }

    async fn close(&self) -> MacpResult<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.notify_disconnected();
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send_packet(&self, packet: RadioPacket) -> MacpResult<()> {
        if !self.is_open() {
            return Err(MacpError::Transport(format!("link {} is closed", self.uri)));
        }
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(packet);
        Ok(())
    }

    fn add_port_callback(&self, port: u8, callback: Arc<RadioPacketCallback>) -> CallbackToken {
        self.port_callbacks.register(port, callback)
    }

    fn add_disconnect_callback(&self, callback: Arc<DisconnectCallback>) {
        self.disconnect_callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(callback);
    }
}

/// Builds [`SimulatedLink`]s and keeps them reachable by address.
///
/// With [`with_local_processes`](Self::with_local_processes) every agent also
/// gets a local handle over an in-memory transport pair; the process end is
/// available through [`process_transport`](Self::process_transport).
pub struct SimulatedFactory {
    links: DashMap<AgentAddress, Arc<SimulatedLink>>,
    processes: DashMap<AgentAddress, Arc<IpcTransport>>,
    local_poll_interval: Option<Duration>,
}

impl Default for SimulatedFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedFactory {
    pub fn new() -> Self {
        Self {
            links: DashMap::new(),
            processes: DashMap::new(),
            local_poll_interval: None,
        }
    }

    /// Pair every agent with a local process transport polling at
    /// `config.poll_interval_ms`.
    pub fn with_local_processes(config: &IpcConfig) -> Self {
        Self {
            local_poll_interval: Some(config.poll_interval()),
            ..Self::new()
        }
    }

    /// Most recent link built for `address`.
    pub fn link(&self, address: AgentAddress) -> Option<Arc<SimulatedLink>> {
        self.links.get(&address).map(|link| Arc::clone(link.value()))
    }

    /// Process end of the most recent local transport built for `address`.
    pub fn process_transport(&self, address: AgentAddress) -> Option<Arc<IpcTransport>> {
        self.processes
            .get(&address)
            .map(|transport| Arc::clone(transport.value()))
    }
}

impl AgentFactory for SimulatedFactory {
    fn construct(&self, address: AgentAddress) -> MacpResult<AgentBundle> {
        let uri = format!("sim://0/80/2M/E7E7E7E7{:02}", address.value());
        let link = Arc::new(SimulatedLink::new(uri));
        self.links.insert(address, Arc::clone(&link));
        let radio = RadioAgent::new(address, link);

        let Some(poll_interval) = self.local_poll_interval else {
            return Ok(AgentBundle::radio_only(radio));
        };
        let (base, process) = IpcTransport::queue_pair(poll_interval);
        self.processes.insert(address, process);
        Ok(AgentBundle {
            radio,
            local: Some(LocalAgent::new(address, base)),
        })
    }
}
