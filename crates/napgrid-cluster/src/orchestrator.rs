//! Orchestrator contract and the built-in static orchestrator.
//!
//! The orchestrator owns replica counts and pod readiness. The control
//! plane only lists functions and asks for a new replica count; it never
//! waits for a scale to take effect.

use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use tracing::info;

use napgrid_core::FunctionConfig;
use napgrid_state::{DeploymentInfo, PodStatus, ScaleRequest};

#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Every function deployed in `namespace`, with its current state.
    async fn list_functions(&self, namespace: &str) -> anyhow::Result<Vec<DeploymentInfo>>;

    /// Set the replica count of one function.
    async fn scale(&self, request: ScaleRequest) -> anyhow::Result<()>;
}

/// In-process orchestrator fed from the `[[functions]]` catalogue.
///
/// Scaling takes effect immediately: the replica count is updated and one
/// ready pod is reported per replica. Lets the daemon run without a
/// cluster behind it.
pub struct StaticOrchestrator {
    functions: RwLock<Vec<DeploymentInfo>>,
}

impl StaticOrchestrator {
    pub fn new(namespace: &str, functions: &[FunctionConfig]) -> Self {
        let functions = functions
            .iter()
            .map(|f| DeploymentInfo {
                name: f.name.clone(),
                namespace: namespace.to_string(),
                replicas: Some(f.replicas),
                replicas_min: f.replicas_min,
                replicas_at_start: f.replicas_at_start,
                number_parallel_request: f.number_parallel_request,
                timeout_seconds_before_scale_to_min: f.timeout_seconds_before_scale_to_min,
                start_with_any_function: f.start_with_any_function,
                pods: ready_pods(&f.name, f.replicas),
            })
            .collect();
        Self {
            functions: RwLock::new(functions),
        }
    }

    pub fn replicas(&self, name: &str) -> Option<u32> {
        self.functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|f| f.name == name)
            .and_then(|f| f.replicas)
    }
}

fn ready_pods(name: &str, replicas: u32) -> Vec<PodStatus> {
    (0..replicas)
        .map(|i| PodStatus {
            name: format!("{name}-{i}"),
            ready: true,
        })
        .collect()
}

#[async_trait]
impl Orchestrator for StaticOrchestrator {
    async fn list_functions(&self, namespace: &str) -> anyhow::Result<Vec<DeploymentInfo>> {
        Ok(self
            .functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|f| f.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn scale(&self, request: ScaleRequest) -> anyhow::Result<()> {
        let mut functions = self
            .functions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let function = functions
            .iter_mut()
            .find(|f| f.name == request.deployment && f.namespace == request.namespace)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "deployment {}/{} not found",
                    request.namespace,
                    request.deployment
                )
            })?;

        function.replicas = Some(request.replicas);
        function.pods = ready_pods(&function.name, request.replicas);
        info!(
            function = %request.deployment,
            replicas = request.replicas,
            "static orchestrator scaled function"
        );
        Ok(())
    }
}
