//! Channel seam and the in-memory queue-pair implementation.

use crate::error::IpcError;
use async_trait::async_trait;
use macp_types::IpcFrame;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// Frames a queue can hold before `send_frame` waits for the reader.
pub const QUEUE_CAPACITY: usize = 1024;

/// One end of a duplex frame channel.
#[async_trait]
pub trait IpcChannel: Send + Sync + 'static {
    /// Deliver one frame to the peer. May wait until the peer has room.
    async fn send_frame(&self, frame: IpcFrame) -> Result<(), IpcError>;

    /// Wait at most `timeout` for the next frame from the peer.
    async fn recv_frame(&self, timeout: Duration) -> Result<IpcFrame, IpcError>;
}

/// One end of an in-memory queue pair.
///
/// The transmit queue of one end is the receive queue of the other.
pub struct QueueChannel {
    tx: mpsc::Sender<IpcFrame>,
    rx: Mutex<mpsc::Receiver<IpcFrame>>,
}

/// Create two connected queue channels.
pub fn queue_pair() -> (QueueChannel, QueueChannel) {
    let (a_tx, b_rx) = mpsc::channel(QUEUE_CAPACITY);
    let (b_tx, a_rx) = mpsc::channel(QUEUE_CAPACITY);
    (
        QueueChannel {
            tx: a_tx,
            rx: Mutex::new(a_rx),
        },
        QueueChannel {
            tx: b_tx,
            rx: Mutex::new(b_rx),
        },
    )
}

#[async_trait]
impl IpcChannel for QueueChannel {
    async fn send_frame(&self, frame: IpcFrame) -> Result<(), IpcError> {
        self.tx.send(frame).await.map_err(|_| IpcError::Closed)
    }

    async fn recv_frame(&self, timeout: Duration) -> Result<IpcFrame, IpcError> {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => Err(IpcError::Closed),
            Err(_) => Err(IpcError::Timeout),
        }
    }
}
