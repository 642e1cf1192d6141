//! MACP endpoint inside a local agent process.
//!
//! The base station forwards MACP packets to an agent's process over the
//! inter-process transport on [`LOCAL_PORT_MACP`]. [`MacpRemote`] queues
//! them and a background task hands each one to the callbacks registered on
//! its MACP port. Only local ports (`>= 0x10`) can be subscribed to.

use bytes::Bytes;
use macp_ipc::IpcTransport;
use macp_types::address::LOCAL_PORT_MACP;
use macp_types::config::RemoteConfig;
use macp_types::{
    AgentAddress, CallbackTable, CallbackToken, MacpError, MacpPacket, MacpResult, PortKind,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Handler for packets delivered to a local agent process.
///
/// Receives the source address, the sub-port and the payload.
pub type RemoteCallback = dyn Fn(AgentAddress, u8, Bytes) + Send + Sync;

pub struct MacpRemote {
    transport: Arc<IpcTransport>,
    callbacks: Arc<CallbackTable<u8, RemoteCallback>>,
    inbound: mpsc::UnboundedSender<MacpPacket>,
    transport_token: CallbackToken,
    running: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MacpRemote {
    /// Attach to `transport` and start the dispatch task.
    pub fn new(transport: Arc<IpcTransport>, config: &RemoteConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let callbacks = Arc::new(CallbackTable::new());
        let running = Arc::new(AtomicBool::new(true));

        let feed = tx.clone();
        let transport_token = transport.add_port_callback(
            LOCAL_PORT_MACP,
            Arc::new(move |raw: Bytes| enqueue(&feed, raw)),
        );

        let task = tokio::spawn(dispatch_loop(
            rx,
            Arc::clone(&callbacks),
            Arc::clone(&running),
            config.poll_interval(),
        ));

        Arc::new(Self {
            transport,
            callbacks,
            inbound: tx,
            transport_token,
            running,
            task: Mutex::new(Some(task)),
        })
    }

    /// Connect to the base station over the datagram sockets named in the
    /// environment of a spawned agent process.
    #[cfg(unix)]
    pub fn from_env(
        config: &macp_types::config::MacpConfig,
    ) -> MacpResult<(Arc<IpcTransport>, Arc<Self>)> {
        let channel = macp_ipc::DatagramChannel::from_env()?;
        let transport = IpcTransport::start(Arc::new(channel), config.ipc.datagram_poll_interval());
        let remote = Self::new(Arc::clone(&transport), &config.remote);
        Ok((transport, remote))
    }

    /// Queue a raw MACP packet for dispatch.
    pub fn handle_macp_packet(&self, raw: Bytes) {
        enqueue(&self.inbound, raw);
    }

    /// Receive packets on the local `port`.
    pub fn add_port_callback(
        &self,
        port: u8,
        callback: Arc<RemoteCallback>,
    ) -> MacpResult<CallbackToken> {
        if PortKind::of(port) != PortKind::Local {
            return Err(MacpError::NotALocalPort(port));
        }
        Ok(self.callbacks.register(port, callback))
    }

    pub fn remove_port_callback(&self, port: u8, token: CallbackToken) -> bool {
        self.callbacks.unregister(port, token)
    }

    /// Build a MACP packet and send it toward the base station.
    pub fn send_macp_packet(
        &self,
        destination: AgentAddress,
        source: AgentAddress,
        port: u8,
        sub_port: u8,
        payload: impl Into<Bytes>,
    ) -> MacpResult<()> {
        let packet = MacpPacket::new(destination, source, port, sub_port, payload);
        self.transport
            .send(LOCAL_PORT_MACP, packet.encode())
            .map_err(Into::into)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the dispatch task, wait for it and drop every registration.
    ///
    /// Safe to call more than once. The transport is left running.
    pub async fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.transport
            .remove_port_callback(LOCAL_PORT_MACP, self.transport_token);

        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("MACP remote: dispatch task panicked: {e}");
            }
        }
        self.callbacks.clear();
    }
}

impl Drop for MacpRemote {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

fn enqueue(queue: &mpsc::UnboundedSender<MacpPacket>, raw: Bytes) {
    match MacpPacket::decode(raw) {
        Ok(packet) => {
            if queue.send(packet).is_err() {
                debug!("MACP remote: closed, dropping packet");
            }
        }
        Err(e) => debug!(error = %e, "MACP remote: dropping malformed packet"),
    }
}

async fn dispatch_loop(
    mut rx: mpsc::UnboundedReceiver<MacpPacket>,
    callbacks: Arc<CallbackTable<u8, RemoteCallback>>,
    running: Arc<AtomicBool>,
    poll_interval: Duration,
) {
    while running.load(Ordering::SeqCst) {
        let packet = match tokio::time::timeout(poll_interval, rx.recv()).await {
            Ok(Some(packet)) => packet,
            Ok(None) => break,
            Err(_) => continue,
        };
        for callback in callbacks.snapshot(&packet.port) {
            callback(packet.source, packet.sub_port, packet.payload.clone());
        }
    }
    debug!("MACP remote: dispatch task stopped");
}
