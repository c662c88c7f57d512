//! napgrid-state — shared state for the napgrid control plane.
//!
//! Holds the domain types exchanged between the proxy, dispatcher, and
//! autoscaler, the in-process [`ActivityTracker`] and [`TopologyCache`],
//! and a [redb](https://docs.rs/redb)-backed [`StateStore`] that serves as
//! both the distributed key-value store and the per-function queue.
//!
//! # Collaborator contracts
//!
//! The control loops only see the [`KeyValueStore`] and [`FunctionQueue`]
//! traits, so a networked store can replace the embedded one without
//! touching the decision logic.

pub mod activity;
pub mod error;
pub mod kv;
pub mod queue;
pub mod request;
pub mod store;
pub mod tables;
pub mod topology;
pub mod types;

pub use activity::{ActivityTracker, now_ms, now_us};
pub use error::{StateError, StateResult};
pub use kv::KeyValueStore;
pub use queue::FunctionQueue;
pub use request::{CustomHeader, CustomRequest};
pub use store::StateStore;
pub use topology::TopologyCache;
pub use types::*;
