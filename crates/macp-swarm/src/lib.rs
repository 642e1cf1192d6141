//! Agent registry ("swarm") for the MACP base station.
//!
//! The [`Swarm`] owns every connected agent in two address spaces:
//! radio-attached [`RadioAgent`]s and local-process-attached
//! [`LocalAgent`]s. On top of that membership it offers the execution
//! primitives the rest of the system uses to act across the fleet:
//!
//! - `single` runs a closure against one agent, if present;
//! - `sequential` runs it against every agent, one at a time;
//! - `parallel` spawns one task per agent, joins all of them and swallows
//!   failures;
//! - `parallel_or_fail` does the same but surfaces an aggregate error.
//!
//! Every primitive has a `*_local` twin over the local-process space.

pub mod agent;
pub mod config;
pub mod report;
pub mod sim;
pub mod store;
pub mod swarm;

pub use agent::{
    AgentBundle, AgentFactory, AgentHandle, AgentInfo, AgentSession, LocalAgent, RadioAgent,
    RadioLink,
};
pub use report::ParallelReport;
pub use sim::{SimulatedFactory, SimulatedLink};
pub use store::SharedStore;
pub use swarm::{Swarm, SwarmEvent};
