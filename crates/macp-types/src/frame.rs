//! Transport envelopes that carry MACP packets.

use crate::error::MacpError;
use bytes::{BufMut, Bytes, BytesMut};

/// A packet on the vehicle's generic radio transport.
///
/// MACP rides on port [`CRTP_PORT_MACP`](crate::address::CRTP_PORT_MACP),
/// channel [`CRTP_DEFAULT_CHANNEL`](crate::address::CRTP_DEFAULT_CHANNEL).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadioPacket {
    pub port: u8,
    pub channel: u8,
    pub data: Bytes,
}

impl RadioPacket {
    pub fn new(port: u8, channel: u8, data: impl Into<Bytes>) -> Self {
        Self {
            port,
            channel,
            data: data.into(),
        }
    }
}

/// A frame on the inter-process transport: one port byte, then payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcFrame {
    pub port: u8,
    pub payload: Bytes,
}

impl IpcFrame {
    pub fn new(port: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            port,
            payload: payload.into(),
        }
    }

    /// Encode to wire bytes (port prefix + payload).
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.payload.len());
        buf.put_u8(self.port);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode wire bytes.
    pub fn decode(bytes: Bytes) -> Result<Self, MacpError> {
        if bytes.is_empty() {
            return Err(MacpError::MalformedFrame(
                "IPC frame is missing its port prefix".to_string(),
            ));
        }
        Ok(Self {
            port: bytes[0],
            payload: bytes.slice(1..),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipc_frame_layout() {
        let frame = IpcFrame::new(0x01, vec![0x35, 0x12, 0x00, 0x61]);
        assert_eq!(&frame.encode()[..], &[0x01, 0x35, 0x12, 0x00, 0x61]);
        assert_eq!(IpcFrame::decode(frame.encode()).unwrap(), frame);
    }

    #[test]
    fn test_ipc_frame_port_only() {
        let frame = IpcFrame::decode(Bytes::from_static(&[0x03])).unwrap();
        assert_eq!(frame.port, 0x03);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn test_ipc_frame_empty_is_malformed() {
        assert!(IpcFrame::decode(Bytes::new()).is_err());
    }
}
