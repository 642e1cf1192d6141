//! Configuration types for the MACP base station and agent processes.

use crate::address::{CRTP_DEFAULT_CHANNEL, CRTP_PORT_MACP};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MacpConfig {
    /// Vehicle radio transport settings.
    pub radio: RadioConfig,
    /// Inter-process transport settings.
    pub ipc: IpcConfig,
    /// Remote endpoint settings (inside local agent processes).
    pub remote: RemoteConfig,
}

/// Where MACP traffic lives on the vehicle transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    /// Reserved transport port for MACP.
    pub macp_port: u8,
    /// Channel on that port carrying MACP packets.
    pub channel: u8,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            macp_port: CRTP_PORT_MACP,
            channel: CRTP_DEFAULT_CHANNEL,
        }
    }
}

/// Inter-process transport settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    /// Poll timeout of the background tasks over in-memory queue pairs.
    pub poll_interval_ms: u64,
    /// Poll timeout of the background tasks over datagram sockets.
    pub datagram_poll_interval_ms: u64,
    /// Directory holding datagram socket files of spawned agent processes.
    pub socket_dir: Option<PathBuf>,
}

impl IpcConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn datagram_poll_interval(&self) -> Duration {
        Duration::from_millis(self.datagram_poll_interval_ms)
    }

    /// Socket directory, falling back to the system temp dir.
    pub fn socket_dir(&self) -> PathBuf {
        self.socket_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            datagram_poll_interval_ms: 100,
            socket_dir: None,
        }
    }
}

/// Remote endpoint settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Poll timeout of the inbound dispatch task.
    pub poll_interval_ms: u64,
}

impl RemoteConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
        }
    }
}
