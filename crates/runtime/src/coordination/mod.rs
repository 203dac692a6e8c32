//! The multi-agent coordination fabric: agent registry, durable message
//! bus, task coordinator and consensus voting.
//!
//! Multi-agent means multiple processes on the same host; everything here
//! coordinates through files under the shared data directory, never over
//! the network.

pub mod consensus;
pub mod message_bus;
pub mod registry;
pub mod tasks;

pub use consensus::{ConsensusEngine, Proposal, Vote};
pub use message_bus::{
    Message, MessageBus, OutgoingMessage, QueueStats, SweepReport, TOPIC_PREFIX,
};
pub use registry::{score_agent, AgentRecord, AgentRegistry, RegistryFilter};
pub use tasks::{Task, TaskCoordinator, TaskSpec};
