//! Agent handles: what the swarm knows about a single connected agent.
//!
//! An agent reachable over the radio is represented by a [`RadioAgent`]
//! wrapping a [`RadioLink`]. An agent that also runs a co-located process
//! on the base station gets a [`LocalAgent`] holding the inter-process
//! transport to that process. Both share one address.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use macp_ipc::IpcTransport;
use macp_types::{AgentAddress, CallbackToken, MacpResult, RadioPacket};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

#[cfg(unix)]
use macp_ipc::{datagram, DatagramChannel};
#[cfg(unix)]
use macp_types::config::IpcConfig;
#[cfg(unix)]
use std::sync::atomic::AtomicU64;

/// Distinguishes socket files of successive spawns within one process.
#[cfg(unix)]
static SPAWN_SEQ: AtomicU64 = AtomicU64::new(0);

/// Callback receiving packets the vehicle sent on a radio port.
pub type RadioPacketCallback = dyn Fn(RadioPacket) + Send + Sync;

/// Callback invoked with the link URI once a link drops.
pub type DisconnectCallback = dyn Fn(&str) + Send + Sync;

/// A radio connection to one vehicle.
///
/// Implementations deliver inbound packets to port callbacks from their own
/// context and must tolerate callbacks that call back into the link.
#[async_trait]
pub trait RadioLink: Send + Sync + 'static {
    /// URI the link was created for.
    fn uri(&self) -> &str;

    /// Open the link. Resolves once the attempt succeeded or failed.
    async fn open(&self) -> MacpResult<()>;

    /// Close the link. Fires the disconnect callbacks if it was open.
    async fn close(&self) -> MacpResult<()>;

    /// Whether the link is currently open.
    fn is_open(&self) -> bool;

    /// Queue a packet for the vehicle.
    fn send_packet(&self, packet: RadioPacket) -> MacpResult<()>;

    /// Receive packets the vehicle sends on `port`.
    fn add_port_callback(&self, port: u8, callback: Arc<RadioPacketCallback>) -> CallbackToken;

    /// Observe the link dropping, whether closed locally or lost.
    fn add_disconnect_callback(&self, callback: Arc<DisconnectCallback>);
}

/// Anything held in one of the swarm's address spaces.
pub trait AgentSession: Send + Sync + 'static {
    /// The address the handle is registered under.
    fn address(&self) -> AgentAddress;
}

/// Handle for an agent reachable over the radio.
pub struct RadioAgent {
    address: AgentAddress,
    link: Arc<dyn RadioLink>,
    added_at: DateTime<Utc>,
    disconnect_observed: AtomicBool,
}

impl RadioAgent {
    /// Wrap a link for the agent at `address`.
    pub fn new(address: AgentAddress, link: Arc<dyn RadioLink>) -> Self {
        Self {
            address,
            link,
            added_at: Utc::now(),
            disconnect_observed: AtomicBool::new(false),
        }
    }

    pub fn link(&self) -> &Arc<dyn RadioLink> {
        &self.link
    }

    pub fn uri(&self) -> &str {
        self.link.uri()
    }

    pub fn is_link_open(&self) -> bool {
        self.link.is_open()
    }

    pub fn added_at(&self) -> DateTime<Utc> {
        self.added_at
    }

    /// Send raw bytes to the vehicle on the given radio port and channel.
    pub fn send(&self, port: u8, channel: u8, data: impl Into<Bytes>) -> MacpResult<()> {
        self.link.send_packet(RadioPacket::new(port, channel, data))
    }

    /// Marks the disconnect observer as registered. Returns `false` if it
    /// already was.
    pub(crate) fn claim_disconnect_observer(&self) -> bool {
        !self.disconnect_observed.swap(true, Ordering::SeqCst)
    }
}

impl AgentSession for RadioAgent {
    fn address(&self) -> AgentAddress {
        self.address
    }
}

impl std::fmt::Debug for RadioAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RadioAgent")
            .field("address", &self.address)
            .field("uri", &self.link.uri())
            .field("open", &self.link.is_open())
            .finish()
    }
}

/// Handle for an agent's co-located process on the base station.
pub struct LocalAgent {
    address: AgentAddress,
    transport: Arc<IpcTransport>,
    process: Mutex<Option<tokio::process::Child>>,
    socket: Option<PathBuf>,
    added_at: DateTime<Utc>,
}

impl LocalAgent {
    /// Wrap an already running transport.
    pub fn new(address: AgentAddress, transport: Arc<IpcTransport>) -> Self {
        Self {
            address,
            transport,
            process: Mutex::new(None),
            socket: None,
            added_at: Utc::now(),
        }
    }

    /// Spawn `command` as the agent's process and connect to it over a pair
    /// of datagram sockets.
    ///
    /// The child finds its socket paths in the `MACP_IPC_LOCAL` and
    /// `MACP_IPC_PEER` environment variables.
    #[cfg(unix)]
    pub fn spawn(
        address: AgentAddress,
        mut command: tokio::process::Command,
        config: &IpcConfig,
    ) -> MacpResult<Self> {
        let dir = config.socket_dir();
        std::fs::create_dir_all(&dir)?;
        let seq = SPAWN_SEQ.fetch_add(1, Ordering::Relaxed);
        let stem = format!("macp-{:02}-{}-{seq}", address.value(), std::process::id());
        let base_path = dir.join(format!("{stem}.base.sock"));
        let agent_path = dir.join(format!("{stem}.agent.sock"));

        let channel = DatagramChannel::bind(&base_path, &agent_path)?;

        command
            .env(datagram::ENV_LOCAL_SOCKET, &agent_path)
            .env(datagram::ENV_PEER_SOCKET, &base_path)
            .kill_on_drop(true);
        let child = command.spawn()?;
        debug!(
            address = %address,
            pid = ?child.id(),
            socket = %base_path.display(),
            "Spawned local agent process"
        );

        let transport = IpcTransport::start(Arc::new(channel), config.datagram_poll_interval());
        let mut agent = Self::new(address, transport);
        agent.process = Mutex::new(Some(child));
        agent.socket = Some(base_path);
        Ok(agent)
    }

    pub fn transport(&self) -> &Arc<IpcTransport> {
        &self.transport
    }

    pub fn added_at(&self) -> DateTime<Utc> {
        self.added_at
    }

    pub fn has_process(&self) -> bool {
        self.process
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Whether the spawned process has not exited yet.
    pub fn is_process_running(&self) -> bool {
        match self
            .process
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_mut()
        {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Base-station socket file of a spawned process.
    pub fn socket_path(&self) -> Option<&Path> {
        self.socket.as_deref()
    }

    /// Forward an encoded MACP packet to the process.
    pub fn send_packet(&self, macp: impl Into<Bytes>) -> MacpResult<()> {
        self.transport
            .send(macp_types::address::LOCAL_PORT_MACP, macp)
            .map_err(Into::into)
    }

    /// Stop communication and signal the process without waiting.
    pub fn terminate(&self) {
        self.transport.stop();
        if let Some(child) = self
            .process
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_mut()
        {
            if let Err(e) = child.start_kill() {
                debug!(address = %self.address, error = %e, "Local agent process already exited");
            }
        }
    }

    /// Stop communication, kill the process and reap it.
    pub async fn shutdown(&self) {
        self.transport.end_communication().await;
        let child = self
            .process
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut child) = child {
            if let Err(e) = child.kill().await {
                warn!(address = %self.address, error = %e, "Failed to kill local agent process");
            }
        }
    }
}

impl AgentSession for LocalAgent {
    fn address(&self) -> AgentAddress {
        self.address
    }
}

impl std::fmt::Debug for LocalAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalAgent")
            .field("address", &self.address)
            .field("running", &self.transport.is_running())
            .finish()
    }
}

/// Either kind of agent handle.
#[derive(Debug, Clone)]
pub enum AgentHandle {
    Radio(Arc<RadioAgent>),
    Local(Arc<LocalAgent>),
}

impl AgentHandle {
    pub fn address(&self) -> AgentAddress {
        match self {
            Self::Radio(agent) => agent.address(),
            Self::Local(agent) => agent.address(),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }
}

/// What [`AgentFactory::construct`] produces for one address.
pub struct AgentBundle {
    pub radio: RadioAgent,
    pub local: Option<LocalAgent>,
}

impl AgentBundle {
    pub fn radio_only(radio: RadioAgent) -> Self {
        Self { radio, local: None }
    }
}

/// Builds the handles for a newly added agent.
pub trait AgentFactory: Send + Sync {
    /// Construct the handles for `address`. The returned link must not be
    /// open yet.
    fn construct(&self, address: AgentAddress) -> MacpResult<AgentBundle>;
}

/// Point-in-time description of a registered agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    pub address: AgentAddress,
    pub uri: String,
    pub link_open: bool,
    pub has_local_process: bool,
    pub added_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedLink;

    fn radio(raw: u8) -> RadioAgent {
        let address = AgentAddress::agent(raw).unwrap();
        RadioAgent::new(address, Arc::new(SimulatedLink::new("sim://0/80/2M/E7E7E7E701")))
    }

    #[tokio::test]
    async fn test_radio_agent_send_goes_through_link() {
        let link = Arc::new(SimulatedLink::new("sim://0/80/2M/E7E7E7E701"));
        let agent = RadioAgent::new(AgentAddress::agent(1).unwrap(), link.clone());
        link.open().await.unwrap();

        agent.send(0x09, 0, vec![0x10, 0x05, 0x00]).unwrap();
        let sent = link.sent_packets();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].port, 0x09);
        assert_eq!(&sent[0].data[..], &[0x10, 0x05, 0x00]);
    }

    #[test]
    fn test_radio_agent_send_on_closed_link_fails() {
        let agent = radio(1);
        assert!(agent.send(0x09, 0, vec![1]).is_err());
    }

    #[test]
    fn test_disconnect_observer_claimed_once() {
        let agent = radio(2);
        assert!(agent.claim_disconnect_observer());
        assert!(!agent.claim_disconnect_observer());
    }

    #[tokio::test]
    async fn test_local_agent_send_and_terminate() {
        let (base, process) = IpcTransport::queue_pair(std::time::Duration::from_millis(10));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        process.add_port_callback(
            macp_types::address::LOCAL_PORT_MACP,
            Arc::new(move |payload: Bytes| {
                let _ = tx.send(payload);
            }),
        );

        let agent = LocalAgent::new(AgentAddress::agent(3).unwrap(), base);
        assert!(!agent.has_process());
        agent.send_packet(vec![0x03, 0x20, 0x01]).unwrap();
        let got = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&got[..], &[0x03, 0x20, 0x01]);

        agent.terminate();
        assert!(agent.send_packet(vec![0x00]).is_err());
        agent.shutdown().await;
        process.end_communication().await;
    }

    #[cfg(unix)]
    fn sleeper() -> tokio::process::Command {
        let mut command = tokio::process::Command::new("sh");
        command
            .arg("-c")
            .arg(r#"test -n "$MACP_IPC_LOCAL" && test -n "$MACP_IPC_PEER" && exec sleep 5"#);
        command
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_hands_sockets_to_child_and_shutdown_reaps_it() {
        let dir = tempfile::tempdir().unwrap();
        let config = IpcConfig {
            datagram_poll_interval_ms: 10,
            socket_dir: Some(dir.path().to_path_buf()),
            ..IpcConfig::default()
        };
        let agent = LocalAgent::spawn(AgentAddress::agent(4).unwrap(), sleeper(), &config).unwrap();
        assert!(agent.has_process());
        let socket = agent.socket_path().unwrap().to_path_buf();
        assert!(socket.starts_with(dir.path()));
        assert!(socket.exists());

        // The child exits right away if either variable is missing.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(agent.is_process_running());

        agent.shutdown().await;
        assert!(!agent.has_process());
        assert!(!agent.is_process_running());
        assert!(!socket.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_respawn_uses_fresh_socket_paths() {
        let dir = tempfile::tempdir().unwrap();
        let config = IpcConfig {
            datagram_poll_interval_ms: 10,
            socket_dir: Some(dir.path().to_path_buf()),
            ..IpcConfig::default()
        };
        let address = AgentAddress::agent(5).unwrap();
        let first = LocalAgent::spawn(address, sleeper(), &config).unwrap();
        let second = LocalAgent::spawn(address, sleeper(), &config).unwrap();
        assert_ne!(first.socket_path(), second.socket_path());

        // Tearing down the old agent leaves the new one's socket in place.
        first.shutdown().await;
        assert!(second.socket_path().unwrap().exists());
        second.shutdown().await;
    }

    #[test]
    fn test_handle_address() {
        let handle = AgentHandle::Radio(Arc::new(radio(7)));
        assert_eq!(handle.address().value(), 7);
        assert!(!handle.is_local());
    }
}
