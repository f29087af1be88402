//! Cluster handles shared by a run and the per-scenario context built on them

use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use tracing::{info, warn};

use crate::backend::{BackendExec, PodExecutor, PodSelector};
use crate::ceph::CephCli;
use crate::deployer::Deployer;
use crate::error::{E2eError, Result};
use crate::ledger::CleanupLedger;
use crate::manifest::ManifestLoader;
use crate::poll::PollSettings;
use crate::resources::ResourceClient;
use crate::verify::Verifier;

/// Tunable waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub poll_interval: Duration,
    /// Deadline for deployments, binding, pod start and deletions.
    pub deploy: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            deploy: Duration::from_secs(10 * 60),
        }
    }
}

impl Timeouts {
    pub fn poll(&self) -> PollSettings {
        PollSettings::new(self.poll_interval, self.deploy)
    }
}

/// `${prefix}-${8 hex chars}`, a DNS-1123 compatible name unique per call.
pub fn unique_name(prefix: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &id[..8])
}

/// Process-wide cluster handles.
#[derive(Clone)]
pub struct Cluster {
    client: Client,
    exec: BackendExec,
    driver_namespace: String,
    rados_namespace: String,
    timeouts: Timeouts,
}

impl Cluster {
    pub fn new(
        client: Client,
        executor: Arc<dyn PodExecutor>,
        rook_namespace: &str,
        driver_namespace: impl Into<String>,
        rados_namespace: impl Into<String>,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            client,
            exec: BackendExec::new(executor, rook_namespace),
            driver_namespace: driver_namespace.into(),
            rados_namespace: rados_namespace.into(),
            timeouts,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn exec(&self) -> &BackendExec {
        &self.exec
    }

    pub fn driver_namespace(&self) -> &str {
        &self.driver_namespace
    }

    pub fn rados_namespace(&self) -> &str {
        &self.rados_namespace
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    /// Resource client that records nothing.
    pub fn resources(&self) -> ResourceClient {
        ResourceClient::new(self.client.clone(), self.timeouts.poll())
    }

    pub fn deployer(&self) -> Deployer {
        Deployer::new(self.client.clone(), self.timeouts.poll())
    }

    pub fn manifests(&self) -> ManifestLoader {
        ManifestLoader::new(self.driver_namespace.clone())
    }

    pub fn ceph(&self) -> CephCli {
        CephCli::new(self.exec.clone())
    }

    /// Create a fresh namespace named after `prefix` and a context whose
    /// resource client records into its own ledger.
    pub async fn scenario_context(&self, prefix: &str) -> Result<ClusterContext> {
        let ledger = Arc::new(CleanupLedger::new());
        let resources = self.resources().with_ledger(ledger.clone());
        let namespace = unique_name(prefix);
        if let Err(e) = resources
            .create_namespace(&namespace, self.timeouts.deploy)
            .await
        {
            // The namespace may exist even though it never became readable.
            for leaked in resources.teardown_recorded(self.timeouts.deploy).await {
                warn!(namespace = %namespace, error = %leaked, "Failed to remove scenario namespace");
            }
            return Err(e);
        }
        info!(namespace = %namespace, "Scenario namespace created");

        Ok(ClusterContext {
            unique_name: unique_name(prefix),
            namespace,
            ledger,
            verifier: Verifier::new(resources.clone(), self.exec.clone(), self.rados_namespace.clone()),
            resources,
            cluster: self.clone(),
        })
    }
}

/// What a scenario's steps operate on. Fixed once built.
pub struct ClusterContext {
    cluster: Cluster,
    unique_name: String,
    namespace: String,
    ledger: Arc<CleanupLedger>,
    resources: ResourceClient,
    verifier: Verifier,
}

impl ClusterContext {
    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    /// Base for derived object names.
    pub fn unique_name(&self) -> &str {
        &self.unique_name
    }

    /// Test namespace owned by this scenario.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn driver_namespace(&self) -> &str {
        &self.cluster.driver_namespace
    }

    pub fn timeouts(&self) -> Timeouts {
        self.cluster.timeouts
    }

    pub fn deploy_timeout(&self) -> Duration {
        self.cluster.timeouts.deploy
    }

    pub fn ledger(&self) -> &Arc<CleanupLedger> {
        &self.ledger
    }

    /// Ledger-backed resource client.
    pub fn resources(&self) -> &ResourceClient {
        &self.resources
    }

    pub fn verifier(&self) -> &Verifier {
        &self.verifier
    }

    pub fn exec(&self) -> &BackendExec {
        &self.cluster.exec
    }

    pub fn manifests(&self) -> ManifestLoader {
        self.cluster.manifests()
    }

    /// Remove everything recorded during the scenario, namespace last.
    pub async fn cleanup(&self) -> Vec<E2eError> {
        let errors = self.resources.teardown_recorded(self.deploy_timeout()).await;
        if errors.is_empty() {
            info!(namespace = %self.namespace, "Scenario resources removed");
        }
        errors
    }

    /// Namespace dump plus logs of the pods matching `log_sources`.
    pub async fn diagnostics(&self, log_sources: &[(PodSelector, &str)]) -> Vec<String> {
        let mut out = Vec::new();
        match self.resources.namespace_dump(&self.namespace).await {
            Ok(dump) => out.push(dump),
            Err(e) => warn!(namespace = %self.namespace, error = %e, "Namespace dump failed"),
        }

        for (selector, container) in log_sources {
            let pods = match self
                .resources
                .list_pods(&selector.namespace, &selector.label_selector)
                .await
            {
                Ok(pods) => pods,
                Err(e) => {
                    warn!(selector = %selector, error = %e, "Listing pods for logs failed");
                    continue;
                }
            };
            for pod in pods {
                let Some(name) = pod.metadata.name else { continue };
                match self
                    .resources
                    .pod_logs(&selector.namespace, &name, Some(container))
                    .await
                {
                    Ok(logs) => out.push(format!("=== logs {}/{} ({}) ===\n{}", selector.namespace, name, container, logs)),
                    Err(e) => warn!(pod = %name, error = %e, "Fetching logs failed"),
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_name_shape() {
        let a = unique_name("rbd");
        let b = unique_name("rbd");
        assert_ne!(a, b);
        assert!(a.starts_with("rbd-"));
        assert_eq!(a.len(), "rbd-".len() + 8);
        assert!(a.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
    }

    #[test]
    fn test_default_timeouts() {
        let t = Timeouts::default();
        assert_eq!(t.poll().interval, Duration::from_secs(2));
        assert_eq!(t.poll().timeout, Duration::from_secs(600));
    }
}
