//! Autoscaler — activity-driven scaling decisions.
//!
//! Reads the topology cache and the activity tracker, decides per function
//! whether to scale down to its minimum or wake it from zero, and sends
//! the resulting requests to the orchestrator.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use napgrid_cluster::{LeaderHandle, Orchestrator};
use napgrid_state::{ActivityTracker, DeploymentInfo, ScaleRequest, TopologyCache, now_us};

/// A scaling decision for a single function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Scale to the specified replica count.
    ScaleTo(u32),
    /// No change needed.
    NoChange,
}

/// Decide what to do with one function.
///
/// `reference_us` is the last activity that counts for this function, or
/// `None` if it was never called. A function is idle once
/// `reference + timeout < now`. Idle functions above their minimum go down
/// to it; active functions at exactly zero go up to `replicas_at_start`.
/// Unknown replica counts are never touched.
pub fn evaluate(function: &DeploymentInfo, reference_us: Option<u64>, now_us: u64) -> ScaleDecision {
    let Some(current) = function.replicas else {
        return ScaleDecision::NoChange;
    };

    let timeout_us = function.timeout_seconds_before_scale_to_min.saturating_mul(1_000_000);
    let idle = match reference_us {
        Some(reference) => reference.saturating_add(timeout_us) < now_us,
        None => true,
    };

    if idle {
        if current > function.replicas_min {
            return ScaleDecision::ScaleTo(function.replicas_min);
        }
    } else if current == 0 && function.replicas_at_start > 0 {
        return ScaleDecision::ScaleTo(function.replicas_at_start);
    }
    ScaleDecision::NoChange
}

pub struct Autoscaler {
    topology: TopologyCache,
    activity: ActivityTracker,
    orchestrator: Arc<dyn Orchestrator>,
}

impl Autoscaler {
    pub fn new(
        topology: TopologyCache,
        activity: ActivityTracker,
        orchestrator: Arc<dyn Orchestrator>,
    ) -> Self {
        Self {
            topology,
            activity,
            orchestrator,
        }
    }

    /// Decisions for every known function at `now_us`.
    ///
    /// Functions with `start_with_any_function` use the latest activity of
    /// any known function as their idle reference.
    pub fn evaluate_all(&self, now_us: u64) -> Vec<(DeploymentInfo, ScaleDecision)> {
        let snapshot = self.topology.snapshot();
        let latest_any = snapshot
            .functions
            .iter()
            .filter_map(|f| self.activity.last_call(&f.name))
            .max();

        snapshot
            .functions
            .iter()
            .map(|function| {
                let reference = if function.start_with_any_function {
                    latest_any
                } else {
                    self.activity.last_call(&function.name)
                };
                (function.clone(), evaluate(function, reference, now_us))
            })
            .collect()
    }

    /// One reconciliation pass: decide, then issue every scale request
    /// concurrently and wait for all of them. A failed request is logged
    /// and does not affect the others.
    pub async fn reconcile(&self) -> Vec<(String, ScaleDecision)> {
        let decisions = self.evaluate_all(now_us());

        let mut scaling = JoinSet::new();
        for (function, decision) in &decisions {
            let ScaleDecision::ScaleTo(target) = *decision else {
                continue;
            };
            info!(
                function = %function.name,
                from = function.replicas.unwrap_or_default(),
                to = target,
                "scaling function"
            );
            let orchestrator = self.orchestrator.clone();
            let request = ScaleRequest {
                deployment: function.name.clone(),
                namespace: function.namespace.clone(),
                replicas: target,
            };
            scaling.spawn(async move {
                let deployment = request.deployment.clone();
                (deployment, target, orchestrator.scale(request).await)
            });
        }

        while let Some(joined) = scaling.join_next().await {
            match joined {
                Ok((_, _, Ok(()))) => {}
                Ok((function, target, Err(e))) => warn!(
                    function = %function,
                    target,
                    error = %e,
                    "scaling action failed"
                ),
                Err(e) => warn!(error = %e, "scaling task aborted"),
            }
        }

        decisions
            .into_iter()
            .map(|(function, decision)| (function.name, decision))
            .collect()
    }

    /// Run the autoscaler loop. Passes only run while this instance leads.
    pub async fn run(
        &self,
        interval: Duration,
        leadership: LeaderHandle,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            interval_ms = interval.as_millis() as u64,
            "autoscaler started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if !leadership.is_leader() {
                        continue;
                    }
                    let decisions = self.reconcile().await;
                    let scaled = decisions
                        .iter()
                        .filter(|(_, d)| *d != ScaleDecision::NoChange)
                        .count();
                    debug!(functions = decisions.len(), scaled, "autoscale pass complete");
                }
                _ = shutdown.changed() => {
                    info!("autoscaler shutting down");
                    break;
                }
            }
        }
    }
}
