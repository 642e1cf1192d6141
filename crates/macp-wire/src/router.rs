//! Base-station MACP router.
//!
//! Every MACP packet sent by a vehicle or a local agent process passes
//! through the base station. [`MacpRouter`] decides, per packet, whether it
//! is for the base station itself, for one other agent, or for everyone.
//!
//! Classification of a packet arriving over the radio:
//!
//! | port    | destination | action                                          |
//! |---------|-------------|-------------------------------------------------|
//! | network | broadcast   | forward to every other agent, deliver locally   |
//! | network | client      | deliver to the port callbacks                   |
//! | network | agent       | forward to that agent, invoke peek callbacks    |
//! | local   | broadcast   | forward to every other local process, deliver   |
//! | local   | client      | deliver to the local-port callbacks             |
//! | local   | agent       | forward to that agent's local process           |
//!
//! Packets from local processes follow the same table, except that a
//! network-port packet is never delivered to the base station and is never
//! peeked.

use bytes::Bytes;
use macp_swarm::{AgentSession, Swarm};
use macp_types::config::RadioConfig;
use macp_types::{
    AgentAddress, CallbackTable, CallbackToken, MacpError, MacpPacket, MacpResult, PortKind,
    RadioPacket, TaskError,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Handler for MACP packets addressed to (or peeked by) the base station.
///
/// Receives the decoded packet and the address of the agent whose link or
/// local process it arrived on.
pub type MacpCallback = dyn Fn(&MacpPacket, AgentAddress) + Send + Sync;

/// Where an inbound packet entered the base station.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Radio,
    Local,
}

pub struct MacpRouter {
    swarm: Arc<Swarm>,
    radio: RadioConfig,
    port_callbacks: CallbackTable<u8, MacpCallback>,
    local_port_callbacks: CallbackTable<u8, MacpCallback>,
    peek_callbacks: CallbackTable<(u8, u8), MacpCallback>,
}

impl MacpRouter {
    pub fn new(swarm: Arc<Swarm>, radio: RadioConfig) -> Self {
        Self {
            swarm,
            radio,
            port_callbacks: CallbackTable::new(),
            local_port_callbacks: CallbackTable::new(),
            peek_callbacks: CallbackTable::new(),
        }
    }

    pub fn swarm(&self) -> &Arc<Swarm> {
        &self.swarm
    }

    // -- registration --

    /// Receive packets for the base station on `port`.
    ///
    /// Local ports (`>= 0x10`) go to the local-port table, which is fed by
    /// local processes.
    pub fn add_port_callback(&self, port: u8, callback: Arc<MacpCallback>) -> CallbackToken {
        match PortKind::of(port) {
            PortKind::Network => self.port_callbacks.register(port, callback),
            PortKind::Local => self.local_port_callbacks.register(port, callback),
        }
    }

    pub fn remove_port_callback(&self, port: u8, token: CallbackToken) -> bool {
        match PortKind::of(port) {
            PortKind::Network => self.port_callbacks.unregister(port, token),
            PortKind::Local => self.local_port_callbacks.unregister(port, token),
        }
    }

    /// Observe packets forwarded between agents on (`port`, `sub_port`).
    ///
    /// Only network ports are routed through the radio, so only they can be
    /// peeked.
    pub fn add_peek_port_callback(
        &self,
        port: u8,
        sub_port: u8,
        callback: Arc<MacpCallback>,
    ) -> MacpResult<CallbackToken> {
        if PortKind::of(port) == PortKind::Local {
            return Err(MacpError::PeekOnLocalPort(port));
        }
        Ok(self.peek_callbacks.register((port, sub_port), callback))
    }

    pub fn remove_peek_port_callback(&self, port: u8, sub_port: u8, token: CallbackToken) -> bool {
        self.peek_callbacks.unregister((port, sub_port), token)
    }

    // -- inbound --

    /// Route a packet that arrived on the radio link of `origin`.
    ///
    /// Packets on other channels than the MACP channel, and packets too
    /// short to carry a header, are dropped.
    pub async fn distribute_radio(&self, packet: RadioPacket, origin: AgentAddress) {
        if packet.channel != self.radio.channel {
            debug!(
                origin = %origin,
                channel = packet.channel,
                "Dropping radio packet on foreign channel"
            );
            return;
        }
        self.distribute(packet.data, origin, Origin::Radio).await;
    }

    /// Route a packet that arrived from the local process of `origin`.
    pub async fn distribute_local(&self, data: Bytes, origin: AgentAddress) {
        self.distribute(data, origin, Origin::Local).await;
    }

    async fn distribute(&self, raw: Bytes, origin: AgentAddress, from: Origin) {
        let packet = match MacpPacket::decode(raw.clone()) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(origin = %origin, error = %e, "Dropping malformed MACP packet");
                return;
            }
        };

        match packet.port_kind() {
            PortKind::Network => {
                // A broadcast claiming to come from the base station is not
                // forwarded back out.
                if packet.destination.is_broadcast() && !packet.source.is_client() {
                    self.forward_broadcast(&raw, packet.source).await;
                }
                if packet.destination.is_broadcast() || packet.destination.is_client() {
                    if from == Origin::Radio {
                        dispatch(&self.port_callbacks, &packet.port, &packet, origin);
                    } else if packet.destination.is_client() {
                        debug!(
                            origin = %origin,
                            port = packet.port,
                            "Dropping network-port packet from local process to base station"
                        );
                    }
                } else {
                    self.forward_exclusive(&raw, packet.destination).await;
                    if from == Origin::Radio {
                        dispatch(
                            &self.peek_callbacks,
                            &(packet.port, packet.sub_port),
                            &packet,
                            origin,
                        );
                    }
                }
            }
            PortKind::Local => {
                if packet.destination.is_broadcast() && !packet.source.is_client() {
                    self.forward_broadcast_local(&raw, packet.source).await;
                }
                if packet.destination.is_broadcast() || packet.destination.is_client() {
                    dispatch(&self.local_port_callbacks, &packet.port, &packet, origin);
                } else {
                    self.forward_exclusive_local(&raw, packet.destination).await;
                }
            }
        }
    }

    // -- connected-agent snapshots --

    /// Addresses of all radio agents with an open link.
    ///
    /// Rebuilt on every call so one routing decision works on a frozen,
    /// internally consistent view.
    async fn connected_agents(&self) -> BTreeSet<AgentAddress> {
        let found = Arc::new(Mutex::new(BTreeSet::new()));
        let sink = Arc::clone(&found);
        self.swarm
            .parallel(move |agent| {
                let sink = Arc::clone(&sink);
                async move {
                    if agent.is_link_open() {
                        sink.lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .insert(agent.address());
                    }
                    Ok::<(), TaskError>(())
                }
            })
            .await;
        let connected = std::mem::take(&mut *found.lock().unwrap_or_else(|e| e.into_inner()));
        connected
    }

    /// Addresses of all local agent processes.
    async fn connected_local_agents(&self) -> BTreeSet<AgentAddress> {
        let found = Arc::new(Mutex::new(BTreeSet::new()));
        let sink = Arc::clone(&found);
        self.swarm
            .parallel_local(move |agent| {
                let sink = Arc::clone(&sink);
                async move {
                    if agent.transport().is_running() {
                        sink.lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .insert(agent.address());
                    }
                    Ok::<(), TaskError>(())
                }
            })
            .await;
        let connected = std::mem::take(&mut *found.lock().unwrap_or_else(|e| e.into_inner()));
        connected
    }

    // -- forwarding --

    /// Forward `raw` to every connected agent except `source`.
    async fn forward_broadcast(&self, raw: &Bytes, source: AgentAddress) {
        let targets: HashMap<AgentAddress, Bytes> = self
            .connected_agents()
            .await
            .into_iter()
            .filter(|address| *address != source)
            .map(|address| (address, raw.clone()))
            .collect();
        if targets.is_empty() {
            return;
        }

        let (port, channel) = (self.radio.macp_port, self.radio.channel);
        self.swarm
            .parallel_with(
                move |agent, packet: Option<Bytes>| async move {
                    if let Some(packet) = packet {
                        agent.send(port, channel, packet)?;
                    }
                    Ok::<(), TaskError>(())
                },
                Some(targets),
            )
            .await;
    }

    async fn forward_exclusive(&self, raw: &Bytes, destination: AgentAddress) {
        if !self.connected_agents().await.contains(&destination) {
            debug!(destination = %destination, "No connected agent for MACP packet");
            return;
        }
        let sent = self.swarm.single(destination, |agent| {
            agent.send(self.radio.macp_port, self.radio.channel, raw.clone())
        });
        if let Some(Err(e)) = sent {
            warn!(destination = %destination, error = %e, "Failed to forward MACP packet");
        }
    }

    /// Forward `raw` to every local process except the one of `source`.
    async fn forward_broadcast_local(&self, raw: &Bytes, source: AgentAddress) {
        let targets: HashMap<AgentAddress, Bytes> = self
            .connected_local_agents()
            .await
            .into_iter()
            .filter(|address| *address != source)
            .map(|address| (address, raw.clone()))
            .collect();
        if targets.is_empty() {
            return;
        }

        self.swarm
            .parallel_local_with(
                |agent, packet: Option<Bytes>| async move {
                    if let Some(packet) = packet {
                        agent.send_packet(packet)?;
                    }
                    Ok::<(), TaskError>(())
                },
                Some(targets),
            )
            .await;
    }

    async fn forward_exclusive_local(&self, raw: &Bytes, destination: AgentAddress) {
        if !self.connected_agents().await.contains(&destination) {
            debug!(destination = %destination, "No connected agent for local MACP packet");
            return;
        }
        match self
            .swarm
            .single_local(destination, |agent| agent.send_packet(raw.clone()))
        {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                warn!(destination = %destination, error = %e, "Failed to forward local MACP packet")
            }
            None => debug!(destination = %destination, "Agent has no local process"),
        }
    }

    // -- outbound --

    /// Build a MACP packet and send it through agent `via`.
    ///
    /// Network ports travel over `via`'s radio link, local ports through
    /// `via`'s local process transport.
    pub fn send_packet(
        &self,
        destination: AgentAddress,
        source: AgentAddress,
        port: u8,
        sub_port: u8,
        payload: impl Into<Bytes>,
        via: AgentAddress,
    ) -> MacpResult<()> {
        let packet = MacpPacket::new(destination, source, port, sub_port, payload).encode();
        let sent = match PortKind::of(port) {
            PortKind::Network => self.swarm.single(via, |agent| {
                agent.send(self.radio.macp_port, self.radio.channel, packet)
            }),
            PortKind::Local => self
                .swarm
                .single_local(via, |agent| agent.send_packet(packet)),
        };
        sent.unwrap_or(Err(MacpError::AgentNotFound(via)))
    }
}

impl std::fmt::Debug for MacpRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacpRouter")
            .field("swarm", &self.swarm)
            .field("radio", &self.radio)
            .finish()
    }
}

/// Invoke every handler registered under `key`, over a copy of the list.
fn dispatch<K>(
    table: &CallbackTable<K, MacpCallback>,
    key: &K,
    packet: &MacpPacket,
    origin: AgentAddress,
) where
    K: Eq + std::hash::Hash + Copy,
{
    for callback in table.snapshot(key) {
        callback(packet, origin);
    }
}
