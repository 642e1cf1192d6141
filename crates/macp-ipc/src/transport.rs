//! Port-multiplexed duplex transport with inbound and outbound worker tasks.

use crate::channel::{queue_pair, IpcChannel};
use crate::error::IpcError;
use bytes::Bytes;
use macp_types::{CallbackTable, CallbackToken, IpcFrame};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Handler invoked with the payload of every frame received on its port.
pub type PortCallback = dyn Fn(Bytes) + Send + Sync;

/// Duplex, port-multiplexed transport over an [`IpcChannel`].
///
/// Outbound frames are delivered in submission order. Inbound dispatch
/// follows callback registration order within a port; there is no ordering
/// across ports.
pub struct IpcTransport {
    outbound: mpsc::UnboundedSender<IpcFrame>,
    callbacks: Arc<CallbackTable<u8, PortCallback>>,
    running: Arc<AtomicBool>,
    poll_interval: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl IpcTransport {
    /// Start the background tasks over `channel`.
    ///
    /// `poll_interval` bounds how long either task waits before re-checking
    /// the run flag, and therefore how quickly shutdown is observed.
    pub fn start(channel: Arc<dyn IpcChannel>, poll_interval: Duration) -> Arc<Self> {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let callbacks = Arc::new(CallbackTable::new());
        let running = Arc::new(AtomicBool::new(true));

        let inbound_task = tokio::spawn(inbound_loop(
            Arc::clone(&channel),
            Arc::clone(&callbacks),
            Arc::clone(&running),
            poll_interval,
        ));
        let outbound_task = tokio::spawn(outbound_loop(
            channel,
            outbound_rx,
            Arc::clone(&running),
            poll_interval,
        ));

        Arc::new(Self {
            outbound,
            callbacks,
            running,
            poll_interval,
            tasks: Mutex::new(vec![inbound_task, outbound_task]),
        })
    }

    /// Two transports wired back to back over an in-memory queue pair.
    pub fn queue_pair(poll_interval: Duration) -> (Arc<Self>, Arc<Self>) {
        let (a, b) = queue_pair();
        (
            Self::start(Arc::new(a), poll_interval),
            Self::start(Arc::new(b), poll_interval),
        )
    }

    /// Enqueue `payload` for delivery on `port`. Never waits.
    ///
    /// Fails with [`IpcError::Closed`] once communication has ended.
    pub fn send(&self, port: u8, payload: impl Into<Bytes>) -> Result<(), IpcError> {
        if !self.is_running() {
            return Err(IpcError::Closed);
        }
        self.outbound
            .send(IpcFrame::new(port, payload))
            .map_err(|_| IpcError::Closed)
    }

    /// Register a handler for frames arriving on `port`.
    pub fn add_port_callback(&self, port: u8, callback: Arc<PortCallback>) -> CallbackToken {
        self.callbacks.register(port, callback)
    }

    /// Remove a handler registered with [`add_port_callback`](Self::add_port_callback).
    pub fn remove_port_callback(&self, port: u8, token: CallbackToken) -> bool {
        self.callbacks.unregister(port, token)
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Whether the background tasks are still meant to run.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Signal both background tasks to stop without waiting for them.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Stop both background tasks, wait for them, and drop all callbacks.
    ///
    /// Frames still queued for sending are not guaranteed to be delivered.
    /// Calling this again is a no-op.
    pub async fn end_communication(&self) {
        self.stop();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        if tasks.is_empty() {
            return;
        }
        for task in tasks {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!("IPC: background task panicked: {e}");
                }
            }
        }
        self.callbacks.clear();
        info!("IPC: communication ended");
    }
}

impl Drop for IpcTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn inbound_loop(
    channel: Arc<dyn IpcChannel>,
    callbacks: Arc<CallbackTable<u8, PortCallback>>,
    running: Arc<AtomicBool>,
    poll_interval: Duration,
) {
    while running.load(Ordering::Acquire) {
        match channel.recv_frame(poll_interval).await {
            Ok(frame) => {
                for callback in callbacks.snapshot(&frame.port) {
                    callback(frame.payload.clone());
                }
            }
            Err(IpcError::Timeout) => {}
            Err(e) if e.is_fatal() => {
                debug!("IPC: inbound channel closed, receiver stopping");
                break;
            }
            Err(e) => debug!(error = %e, "IPC: dropped inbound frame"),
        }
    }
}

async fn outbound_loop(
    channel: Arc<dyn IpcChannel>,
    mut queue: mpsc::UnboundedReceiver<IpcFrame>,
    running: Arc<AtomicBool>,
    poll_interval: Duration,
) {
    while running.load(Ordering::Acquire) {
        let frame = match tokio::time::timeout(poll_interval, queue.recv()).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(_) => continue,
        };
        let port = frame.port;
        match channel.send_frame(frame).await {
            Ok(()) => {}
            Err(e) if e.is_fatal() => {
                debug!(port, "IPC: outbound channel closed, sender stopping");
                break;
            }
            Err(e) => debug!(port, error = %e, "IPC: dropped outbound frame"),
        }
    }
}
