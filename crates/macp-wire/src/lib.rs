//! MACP routing layer.
//!
//! Vehicles on a radio network can only talk to the base station. MACP
//! emulates a decentralized network on top of that: every packet carries a
//! destination and source address, and the base station forwards it.
//!
//! - [`MacpRouter`] runs on the base station. It classifies every inbound
//!   packet and delivers it to local callbacks, forwards it to one agent, or
//!   broadcasts it to all others.
//! - [`MacpRemote`] runs inside a local agent process and exchanges MACP
//!   packets with the base station over the inter-process transport.
//! - [`Fleet`] ties the swarm and the router together and owns the
//!   connection lifecycle.

pub mod fleet;
pub mod remote;
pub mod router;

pub use fleet::Fleet;
pub use remote::{MacpRemote, RemoteCallback};
pub use router::{MacpCallback, MacpRouter};
