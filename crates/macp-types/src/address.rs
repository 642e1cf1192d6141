//! 4-bit agent addresses and MACP port classification.

use crate::error::MacpError;
use serde::{Deserialize, Serialize};

/// Vehicle transport port reserved for MACP traffic.
pub const CRTP_PORT_MACP: u8 = 0x09;

/// Vehicle transport channel MACP traffic is carried on.
pub const CRTP_DEFAULT_CHANNEL: u8 = 0x0;

/// Inter-process port reserved for MACP traffic between the base station
/// and local agent processes.
pub const LOCAL_PORT_MACP: u8 = 0x01;

/// First MACP port routed to local agent processes. Everything below is a
/// network port.
pub const FIRST_LOCAL_PORT: u8 = 0x10;

/// A 4-bit MACP address.
///
/// `0x0` is the base station itself and `0xF` is the broadcast address;
/// agents use `0x1..=0xE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct AgentAddress(u8);

impl AgentAddress {
    /// The base station (client) address.
    pub const CLIENT: AgentAddress = AgentAddress(0x0);
    /// The broadcast address.
    pub const BROADCAST: AgentAddress = AgentAddress(0xF);

    /// Build an address from any 4-bit value, including the reserved ones.
    pub fn new(raw: u8) -> Result<Self, MacpError> {
        if raw > 0x0F {
            return Err(MacpError::InvalidAddress(format!(
                "{raw:#x} does not fit in 4 bits"
            )));
        }
        Ok(Self(raw))
    }

    /// Build an address for an agent. Rejects the base station and
    /// broadcast addresses.
    pub fn agent(raw: u8) -> Result<Self, MacpError> {
        let address = Self::new(raw)?;
        if !address.is_agent() {
            return Err(MacpError::InvalidAddress(format!(
                "{address} is reserved and cannot name an agent"
            )));
        }
        Ok(address)
    }

    /// Take the low nibble of `raw`, discarding the rest.
    pub const fn from_nibble(raw: u8) -> Self {
        Self(raw & 0x0F)
    }

    /// Derive the agent address from a link URI.
    ///
    /// The address is the decimal value of the last two characters of the
    /// URI, e.g. `radio://0/80/2M/E7E7E7E705` is agent 5.
    pub fn from_link_uri(uri: &str) -> Result<Self, MacpError> {
        let tail = uri
            .len()
            .checked_sub(2)
            .and_then(|start| uri.get(start..))
            .ok_or_else(|| MacpError::InvalidAddress(format!("link URI too short: {uri}")))?;
        let raw: u8 = tail.parse().map_err(|_| {
            MacpError::InvalidAddress(format!("link URI does not end in a decimal id: {uri}"))
        })?;
        Self::agent(raw)
    }

    /// Raw 4-bit value.
    pub const fn value(self) -> u8 {
        self.0
    }

    pub const fn is_broadcast(self) -> bool {
        self.0 == Self::BROADCAST.0
    }

    pub const fn is_client(self) -> bool {
        self.0 == Self::CLIENT.0
    }

    /// Whether this address names a single agent.
    pub const fn is_agent(self) -> bool {
        !self.is_broadcast() && !self.is_client()
    }
}

impl TryFrom<u8> for AgentAddress {
    type Error = MacpError;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        Self::new(raw)
    }
}

impl From<AgentAddress> for u8 {
    fn from(address: AgentAddress) -> Self {
        address.0
    }
}

impl std::fmt::Display for AgentAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Routing class of a MACP port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    /// Ports `0x00..0x10`, routed to and from real vehicles.
    Network,
    /// Ports `0x10..`, routed only to and from local agent processes.
    Local,
}

impl PortKind {
    /// Classify a MACP port.
    pub const fn of(port: u8) -> Self {
        if port >= FIRST_LOCAL_PORT {
            PortKind::Local
        } else {
            PortKind::Network
        }
    }
}

impl std::fmt::Display for PortKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortKind::Network => write!(f, "network"),
            PortKind::Local => write!(f, "local"),
        }
    }
}
