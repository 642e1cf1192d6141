//! Inter-process transport for MACP.
//!
//! Connects the base station to agent control logic running in a separate
//! local process. A duplex byte channel carries [`IpcFrame`]s (one port byte
//! plus payload) and two background tasks per [`IpcTransport`] do the work:
//!
//! - the **outbound** task drains a FIFO queue fed by [`IpcTransport::send`]
//!   and performs the (possibly blocking) channel send, so callers only ever
//!   enqueue;
//! - the **inbound** task polls the channel with a short timeout and hands
//!   each frame to the callbacks registered on its port.
//!
//! Two interchangeable channels implement [`IpcChannel`]: an in-memory
//! [`QueueChannel`] pair and, on Unix, a [`DatagramChannel`] over Unix
//! datagram sockets for real process boundaries.
//!
//! [`IpcFrame`]: macp_types::IpcFrame

pub mod channel;
#[cfg(unix)]
pub mod datagram;
pub mod error;
pub mod transport;

pub use channel::{queue_pair, IpcChannel, QueueChannel};
#[cfg(unix)]
pub use datagram::DatagramChannel;
pub use error::IpcError;
pub use transport::{IpcTransport, PortCallback};
