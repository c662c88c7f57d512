//! napgrid-cluster — coordination between napgrid instances.
//!
//! Several `napd` processes can front the same functions. They share one
//! key-value store and use it for three things:
//!
//! ```text
//! napgrid:leader           LeadershipSelector  soft lease, 5s default
//! topology:deployments     TopologySync        leader publishes, followers pull
//! activity:<function>      ActivitySync        max timestamp wins
//! ```
//!
//! Only the leader lists functions from the [`Orchestrator`] and runs the
//! autoscaler.

pub mod leader;
pub mod orchestrator;
pub mod sync;

pub use leader::{LEADER_KEY, LeaderHandle, LeaderRecord, LeadershipSelector};
pub use orchestrator::{Orchestrator, StaticOrchestrator};
pub use sync::{ActivitySync, RefreshOutcome, TOPOLOGY_KEY, TopologySync, activity_key};
