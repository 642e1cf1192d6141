//! Core types for the Multi Agent Communication Protocol (MACP).
//!
//! MACP emulates a decentralized peer-to-peer network on top of a star-shaped
//! radio link: every agent talks to the base station only, and the base
//! station routes by the 4-bit addresses carried in each packet header.
//!
//! This crate defines the shared data structures (addresses, packet codecs,
//! callback tables, errors, configuration) used by the transport, swarm and
//! routing crates. It contains no routing logic.

pub mod address;
pub mod callback;
pub mod config;
pub mod error;
pub mod frame;
pub mod packet;

pub use address::{AgentAddress, PortKind};
pub use callback::{CallbackTable, CallbackToken};
pub use error::{MacpError, MacpResult, TaskError, TaskResult};
pub use frame::{IpcFrame, RadioPacket};
pub use packet::MacpPacket;
