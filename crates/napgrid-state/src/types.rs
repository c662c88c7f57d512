//! Domain types shared by the proxy, dispatcher, and autoscaler.
//!
//! All types serialize to JSON: the topology snapshot is published to the
//! shared store by the leader and read back by followers.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};

// ── Deployment ─────────────────────────────────────────────────────

/// Deployment state and scaling policy of one function.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentInfo {
    pub name: String,
    pub namespace: String,
    /// Current replica count; `None` until the orchestrator has reported it.
    pub replicas: Option<u32>,
    pub replicas_min: u32,
    pub replicas_at_start: u32,
    /// Maximum concurrent in-flight async dispatches.
    pub number_parallel_request: u32,
    pub timeout_seconds_before_scale_to_min: u64,
    /// When set, activity on any function resets this function's idle clock.
    pub start_with_any_function: bool,
    pub pods: Vec<PodStatus>,
}

/// Readiness of one pod backing a function.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PodStatus {
    pub name: String,
    pub ready: bool,
}

impl DeploymentInfo {
    /// True when the function has replicas and at least one ready pod.
    pub fn has_ready_pod(&self) -> bool {
        self.replicas.is_some_and(|r| r > 0) && self.pods.iter().any(|p| p.ready)
    }
}

// ── Topology snapshot ──────────────────────────────────────────────

/// Full list of known functions, replaced wholesale on each refresh.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TopologySnapshot {
    pub functions: Vec<DeploymentInfo>,
}

impl TopologySnapshot {
    pub fn new(functions: Vec<DeploymentInfo>) -> Self {
        Self { functions }
    }

    /// Names must be non-empty and unique.
    pub fn validate(&self) -> StateResult<()> {
        let mut seen = HashSet::new();
        for function in &self.functions {
            if function.name.is_empty() {
                return Err(StateError::InvalidTopology("empty function name".into()));
            }
            if !seen.insert(function.name.as_str()) {
                return Err(StateError::InvalidTopology(format!(
                    "duplicate function name: {}",
                    function.name
                )));
            }
        }
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<&DeploymentInfo> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn to_json(&self) -> StateResult<String> {
        serde_json::to_string(self).map_err(|e| StateError::Serialize(e.to_string()))
    }

    pub fn from_json(json: &str) -> StateResult<Self> {
        let snapshot: TopologySnapshot =
            serde_json::from_str(json).map_err(|e| StateError::Deserialize(e.to_string()))?;
        snapshot.validate()?;
        Ok(snapshot)
    }
}

// ── Scaling ────────────────────────────────────────────────────────

/// One replica-count change sent to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleRequest {
    pub deployment: String,
    pub namespace: String,
    pub replicas: u32,
}
