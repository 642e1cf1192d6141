//! Unix datagram socket channel for agent processes outside the base station.
//!
//! Each side binds its own socket file and sends to the peer's path. A
//! datagram carries exactly one encoded [`IpcFrame`], so no extra framing is
//! needed. A base station spawning an agent process hands the child the two
//! paths through [`ENV_LOCAL_SOCKET`] and [`ENV_PEER_SOCKET`].

use crate::channel::IpcChannel;
use crate::error::IpcError;
use async_trait::async_trait;
use bytes::Bytes;
use macp_types::IpcFrame;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixDatagram;
use tracing::debug;

/// Largest datagram accepted by [`DatagramChannel::recv_frame`].
pub const MAX_DATAGRAM_SIZE: usize = 4096;

/// Environment variable naming the socket path the agent process binds.
pub const ENV_LOCAL_SOCKET: &str = "MACP_IPC_LOCAL";

/// Environment variable naming the socket path of the base station.
pub const ENV_PEER_SOCKET: &str = "MACP_IPC_PEER";

/// One end of a Unix datagram channel.
pub struct DatagramChannel {
    socket: UnixDatagram,
    /// Destination for path-addressed sockets; `None` for connected pairs.
    peer: Option<PathBuf>,
    /// Socket file we own and remove on drop.
    local: Option<PathBuf>,
    /// `(dev, ino)` of the socket file as bound.
    identity: Option<(u64, u64)>,
}

impl DatagramChannel {
    /// Create two connected, unnamed channels.
    pub fn pair() -> Result<(Self, Self), IpcError> {
        let (a, b) = UnixDatagram::pair()?;
        Ok((
            Self {
                socket: a,
                peer: None,
                local: None,
                identity: None,
            },
            Self {
                socket: b,
                peer: None,
                local: None,
                identity: None,
            },
        ))
    }

    /// Bind `local` and address every frame to `peer`.
    ///
    /// A stale socket file at `local` is replaced. The peer does not need to
    /// exist yet; frames sent before it binds are lost.
    pub fn bind(local: impl AsRef<Path>, peer: impl AsRef<Path>) -> Result<Self, IpcError> {
        let local = local.as_ref();
        if local.exists() {
            std::fs::remove_file(local)?;
        }
        let socket = UnixDatagram::bind(local)?;
        let meta = std::fs::metadata(local)?;
        debug!(local = %local.display(), peer = %peer.as_ref().display(), "IPC: datagram socket bound");
        Ok(Self {
            socket,
            peer: Some(peer.as_ref().to_path_buf()),
            local: Some(local.to_path_buf()),
            identity: Some((meta.dev(), meta.ino())),
        })
    }

    /// Bind using the paths handed to a spawned agent process.
    pub fn from_env() -> Result<Self, IpcError> {
        let local =
            std::env::var_os(ENV_LOCAL_SOCKET).ok_or(IpcError::MissingEnv(ENV_LOCAL_SOCKET))?;
        let peer = std::env::var_os(ENV_PEER_SOCKET).ok_or(IpcError::MissingEnv(ENV_PEER_SOCKET))?;
        Self::bind(PathBuf::from(local), PathBuf::from(peer))
    }

    /// Path of the socket file this end owns, if any.
    pub fn local_path(&self) -> Option<&Path> {
        self.local.as_deref()
    }
}

#[async_trait]
impl IpcChannel for DatagramChannel {
    async fn send_frame(&self, frame: IpcFrame) -> Result<(), IpcError> {
        let bytes = frame.encode();
        match &self.peer {
            Some(peer) => self.socket.send_to(&bytes, peer).await?,
            None => self.socket.send(&bytes).await?,
        };
        Ok(())
    }

    async fn recv_frame(&self, timeout: Duration) -> Result<IpcFrame, IpcError> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let len = match tokio::time::timeout(timeout, self.socket.recv(&mut buf)).await {
            Ok(result) => result?,
            Err(_) => return Err(IpcError::Timeout),
        };
        buf.truncate(len);
        IpcFrame::decode(Bytes::from(buf)).map_err(|e| IpcError::Malformed(e.to_string()))
    }
}

impl Drop for DatagramChannel {
    fn drop(&mut self) {
        let (Some(path), Some(identity)) = (&self.local, self.identity) else {
            return;
        };
        // Leave the file alone if another channel has re-bound the path.
        match std::fs::metadata(path) {
            Ok(meta) if (meta.dev(), meta.ino()) == identity => {
                let _ = std::fs::remove_file(path);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_roundtrip() {
        let (a, b) = DatagramChannel::pair().unwrap();
        a.send_frame(IpcFrame::new(0x01, vec![0x35, 0x12, 0x00]))
            .await
            .unwrap();
        let frame = b.recv_frame(Duration::from_millis(500)).await.unwrap();
        assert_eq!(frame.port, 0x01);
        assert_eq!(&frame.payload[..], &[0x35, 0x12, 0x00]);
    }

    #[tokio::test]
    async fn test_bound_paths() {
        let dir = tempfile::tempdir().unwrap();
        let base_path = dir.path().join("base.sock");
        let agent_path = dir.path().join("agent.sock");

        let base = DatagramChannel::bind(&base_path, &agent_path).unwrap();
        let agent = DatagramChannel::bind(&agent_path, &base_path).unwrap();

        agent
            .send_frame(IpcFrame::new(0x03, vec![0x61, 0x62]))
            .await
            .unwrap();
        let frame = base.recv_frame(Duration::from_millis(500)).await.unwrap();
        assert_eq!(frame, IpcFrame::new(0x03, vec![0x61, 0x62]));

        drop(base);
        assert!(!base_path.exists());
    }

    #[tokio::test]
    async fn test_dropping_replaced_channel_keeps_new_socket() {
        let dir = tempfile::tempdir().unwrap();
        let base_path = dir.path().join("base.sock");
        let agent_path = dir.path().join("agent.sock");

        let stale = DatagramChannel::bind(&base_path, &agent_path).unwrap();
        let fresh = DatagramChannel::bind(&base_path, &agent_path).unwrap();
        drop(stale);
        assert!(base_path.exists());

        let agent = DatagramChannel::bind(&agent_path, &base_path).unwrap();
        agent
            .send_frame(IpcFrame::new(0x01, vec![0x42]))
            .await
            .unwrap();
        let frame = fresh.recv_frame(Duration::from_millis(500)).await.unwrap();
        assert_eq!(frame, IpcFrame::new(0x01, vec![0x42]));

        drop(fresh);
        assert!(!base_path.exists());
    }

    #[tokio::test]
    async fn test_from_env_reads_both_paths() {
        // The only test in this crate touching these variables.
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("agent.sock");
        let peer = dir.path().join("base.sock");

        std::env::remove_var(ENV_LOCAL_SOCKET);
        std::env::remove_var(ENV_PEER_SOCKET);
        assert!(matches!(
            DatagramChannel::from_env(),
            Err(IpcError::MissingEnv(ENV_LOCAL_SOCKET))
        ));

        std::env::set_var(ENV_LOCAL_SOCKET, &local);
        assert!(matches!(
            DatagramChannel::from_env(),
            Err(IpcError::MissingEnv(ENV_PEER_SOCKET))
        ));

        std::env::set_var(ENV_PEER_SOCKET, &peer);
        let channel = DatagramChannel::from_env().unwrap();
        assert_eq!(channel.local_path(), Some(local.as_path()));
        assert!(local.exists());

        std::env::remove_var(ENV_LOCAL_SOCKET);
        std::env::remove_var(ENV_PEER_SOCKET);
    }

    #[tokio::test]
    async fn test_send_before_peer_binds_fails_without_panicking() {
        let dir = tempfile::tempdir().unwrap();
        let lonely = DatagramChannel::bind(dir.path().join("a.sock"), dir.path().join("b.sock"))
            .unwrap();
        let err = lonely
            .send_frame(IpcFrame::new(1, vec![0x00]))
            .await
            .unwrap_err();
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_empty_datagram_is_malformed() {
        let (a, b) = DatagramChannel::pair().unwrap();
        a.socket.send(&[]).await.unwrap();
        let err = b.recv_frame(Duration::from_millis(500)).await.unwrap_err();
        assert!(matches!(err, IpcError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_recv_timeout() {
        let (a, _b) = DatagramChannel::pair().unwrap();
        let err = a.recv_frame(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, IpcError::Timeout));
    }
}
