//! MACP packet codec.
//!
//! Wire form: one address header byte (destination in the high nibble,
//! source in the low nibble), one port byte, one sub-port byte, then the
//! payload. The same layout is used on every send and receive path.

use crate::address::{AgentAddress, PortKind};
use crate::error::MacpError;
use bytes::{BufMut, Bytes, BytesMut};

/// Length of the MACP header (address byte, port, sub-port).
pub const MACP_HEADER_LEN: usize = 3;

/// Pack destination and source into the address header byte.
pub const fn pack_address_header(destination: AgentAddress, source: AgentAddress) -> u8 {
    (destination.value() << 4) | source.value()
}

/// Split the address header byte into `(destination, source)`.
pub const fn unpack_address_header(header: u8) -> (AgentAddress, AgentAddress) {
    (
        AgentAddress::from_nibble(header >> 4),
        AgentAddress::from_nibble(header),
    )
}

/// A decoded MACP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacpPacket {
    pub destination: AgentAddress,
    pub source: AgentAddress,
    pub port: u8,
    pub sub_port: u8,
    pub payload: Bytes,
}

impl MacpPacket {
    pub fn new(
        destination: AgentAddress,
        source: AgentAddress,
        port: u8,
        sub_port: u8,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            destination,
            source,
            port,
            sub_port,
            payload: payload.into(),
        }
    }

    /// Routing class of this packet's port.
    pub fn port_kind(&self) -> PortKind {
        PortKind::of(self.port)
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MACP_HEADER_LEN + self.payload.len());
        buf.put_u8(pack_address_header(self.destination, self.source));
        buf.put_u8(self.port);
        buf.put_u8(self.sub_port);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode wire bytes. The payload shares the input buffer.
    pub fn decode(bytes: Bytes) -> Result<Self, MacpError> {
        if bytes.len() < MACP_HEADER_LEN {
            return Err(MacpError::MalformedFrame(format!(
                "MACP packet needs {MACP_HEADER_LEN} header bytes, got {}",
                bytes.len()
            )));
        }
        let (destination, source) = unpack_address_header(bytes[0]);
        Ok(Self {
            destination,
            source,
            port: bytes[1],
            sub_port: bytes[2],
            payload: bytes.slice(MACP_HEADER_LEN..),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(raw: u8) -> AgentAddress {
        AgentAddress::new(raw).unwrap()
    }

    #[test]
    fn test_header_layout() {
        let packet = MacpPacket::new(addr(0x3), addr(0x5), 0x02, 0x07, vec![0xAA]);
        let bytes = packet.encode();
        assert_eq!(&bytes[..], &[0x35, 0x02, 0x07, 0xAA]);
    }

    #[test]
    fn test_decode_is_inverse_of_encode_for_all_addresses() {
        for dst in 0..=0x0F {
            for src in 0..=0x0F {
                let packet = MacpPacket::new(addr(dst), addr(src), 0x11, 0xFE, vec![dst, src, 0x00]);
                let decoded = MacpPacket::decode(packet.encode()).unwrap();
                assert_eq!(decoded, packet, "dst={dst:#x} src={src:#x}");
            }
        }
    }

    #[test]
    fn test_decode_empty_payload() {
        let decoded = MacpPacket::decode(Bytes::from_static(&[0xF1, 0x04, 0x00])).unwrap();
        assert!(decoded.destination.is_broadcast());
        assert_eq!(decoded.source.value(), 1);
        assert_eq!(decoded.port, 0x04);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_decode_short_frame() {
        let err = MacpPacket::decode(Bytes::from_static(&[0x12, 0x01])).unwrap_err();
        assert!(matches!(err, MacpError::MalformedFrame(_)));
    }

    #[test]
    fn test_port_kind() {
        assert_eq!(
            MacpPacket::new(addr(1), addr(2), 0x05, 0, Bytes::new()).port_kind(),
            PortKind::Network
        );
        assert_eq!(
            MacpPacket::new(addr(1), addr(2), 0x12, 0, Bytes::new()).port_kind(),
            PortKind::Local
        );
    }
}
