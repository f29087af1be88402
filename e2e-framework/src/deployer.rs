//! Driver deployment and teardown
//!
//! A [`DeployPlan`] groups manifest objects by [`DeployStage`]. Deploying
//! creates the stages in dependency order and waits for the driver
//! workloads; teardown deletes them in reverse. Both directions are
//! idempotent: an existing object counts as created, a missing one as
//! deleted.

use std::fmt;
use std::time::Duration;

use kube::api::{Api, DeleteParams, DynamicObject, GroupVersionKind, PostParams};
use kube::discovery::{ApiResource, Discovery, Scope};
use kube::{Client, ResourceExt};
use tracing::{debug, info, instrument, warn};

use crate::error::{E2eError, Result};
use crate::poll::{PollSettings, gone, poll_until};
use crate::resources::{ResourceClient, retry_on_conflict};

/// Namespace that is never created or deleted by a deployment.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Deployment stages in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeployStage {
    Namespace,
    Rbac,
    PodSecurity,
    ConfigMap,
    Secrets,
    Provisioner,
    NodePlugin,
    SnapshotClass,
}

impl DeployStage {
    pub const ORDER: [DeployStage; 8] = [
        DeployStage::Namespace,
        DeployStage::Rbac,
        DeployStage::PodSecurity,
        DeployStage::ConfigMap,
        DeployStage::Secrets,
        DeployStage::Provisioner,
        DeployStage::NodePlugin,
        DeployStage::SnapshotClass,
    ];

    /// Stages whose objects carry cluster-specific data and are replaced
    /// when they already exist.
    fn replaces_existing(self) -> bool {
        matches!(self, DeployStage::ConfigMap | DeployStage::Secrets)
    }
}

impl fmt::Display for DeployStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeployStage::Namespace => "namespace",
            DeployStage::Rbac => "rbac",
            DeployStage::PodSecurity => "pod-security",
            DeployStage::ConfigMap => "configmap",
            DeployStage::Secrets => "secrets",
            DeployStage::Provisioner => "provisioner",
            DeployStage::NodePlugin => "nodeplugin",
            DeployStage::SnapshotClass => "snapshotclass",
        };
        write!(f, "{}", s)
    }
}

/// Objects of one stage.
#[derive(Debug, Clone)]
pub struct DeployItem {
    pub stage: DeployStage,
    pub objects: Vec<DynamicObject>,
}

/// Everything needed to stand up one driver.
#[derive(Debug, Clone)]
pub struct DeployPlan {
    name: String,
    namespace: String,
    items: Vec<DeployItem>,
    deployments: Vec<String>,
    daemonsets: Vec<String>,
    keep_namespace: bool,
}

impl DeployPlan {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            items: Vec::new(),
            deployments: Vec::new(),
            daemonsets: Vec::new(),
            keep_namespace: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Whether the plan creates (and later deletes) its namespace.
    pub fn owns_namespace(&self) -> bool {
        !self.keep_namespace && self.namespace != DEFAULT_NAMESPACE
    }

    /// The items of `stages` only, leaving the namespace alone. Used to
    /// replace the driver workloads while config and secrets stay.
    pub fn subset(&self, stages: &[DeployStage]) -> DeployPlan {
        DeployPlan {
            name: format!("{}-workloads", self.name),
            namespace: self.namespace.clone(),
            items: self
                .items
                .iter()
                .filter(|item| stages.contains(&item.stage))
                .cloned()
                .collect(),
            deployments: if stages.contains(&DeployStage::Provisioner) {
                self.deployments.clone()
            } else {
                Vec::new()
            },
            daemonsets: if stages.contains(&DeployStage::NodePlugin) {
                self.daemonsets.clone()
            } else {
                Vec::new()
            },
            keep_namespace: true,
        }
    }

    pub fn stage(mut self, stage: DeployStage, objects: Vec<DynamicObject>) -> Self {
        self.items.push(DeployItem { stage, objects });
        self
    }

    /// Deployment that must report complete before the deploy finishes.
    pub fn wait_deployment(mut self, name: impl Into<String>) -> Self {
        self.deployments.push(name.into());
        self
    }

    /// DaemonSet that must report ready before the deploy finishes.
    pub fn wait_daemonset(mut self, name: impl Into<String>) -> Self {
        self.daemonsets.push(name.into());
        self
    }

    /// Items in creation order; items of the same stage keep insertion order.
    pub fn creation_order(&self) -> Vec<&DeployItem> {
        let mut items: Vec<&DeployItem> = self.items.iter().collect();
        items.sort_by_key(|item| item.stage);
        items
    }

    /// `(stage, object)` pairs in deletion order.
    pub fn deletion_order(&self) -> Vec<(DeployStage, &DynamicObject)> {
        let mut objects: Vec<(DeployStage, &DynamicObject)> = self
            .creation_order()
            .into_iter()
            .flat_map(|item| item.objects.iter().map(move |obj| (item.stage, obj)))
            .collect();
        objects.reverse();
        objects
    }
}

/// Split `apiVersion` and pull `kind` out of an untyped object.
pub fn object_gvk(obj: &DynamicObject) -> Result<GroupVersionKind> {
    let types = obj.types.as_ref().ok_or_else(|| {
        E2eError::InvalidObject(format!("{} has no apiVersion/kind", obj.name_any()))
    })?;
    let (group, version) = match types.api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", types.api_version.as_str()),
    };
    Ok(GroupVersionKind::gvk(group, version, &types.kind))
}

fn fallback_plural(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') {
        format!("{}es", lower)
    } else if let Some(stem) = lower.strip_suffix('y') {
        format!("{}ies", stem)
    } else {
        format!("{}s", lower)
    }
}

/// Applies [`DeployPlan`]s against the cluster.
#[derive(Clone)]
pub struct Deployer {
    client: Client,
    resources: ResourceClient,
    poll: PollSettings,
}

impl Deployer {
    pub fn new(client: Client, poll: PollSettings) -> Self {
        Self {
            resources: ResourceClient::new(client.clone(), poll),
            client,
            poll,
        }
    }

    async fn discover(&self) -> Result<Discovery> {
        Ok(Discovery::new(self.client.clone()).run().await?)
    }

    /// Api handle for an object, or `None` when the API is not served.
    fn api_for(
        &self,
        discovery: &Discovery,
        obj: &DynamicObject,
        default_namespace: &str,
    ) -> Result<Option<Api<DynamicObject>>> {
        let gvk = object_gvk(obj)?;
        let (resource, namespaced) = match discovery.resolve_gvk(&gvk) {
            Some((resource, caps)) => (resource, caps.scope == Scope::Namespaced),
            None if obj.metadata.namespace.is_some() => {
                debug!(kind = %gvk.kind, "Kind not discovered, guessing plural");
                let plural = fallback_plural(&gvk.kind);
                (ApiResource::from_gvk_with_plural(&gvk, &plural), true)
            }
            None => return Ok(None),
        };
        let api = if namespaced {
            let ns = obj.metadata.namespace.as_deref().unwrap_or(default_namespace);
            Api::namespaced_with(self.client.clone(), ns, &resource)
        } else {
            Api::all_with(self.client.clone(), &resource)
        };
        Ok(Some(api))
    }

    async fn create_object(
        &self,
        api: &Api<DynamicObject>,
        stage: DeployStage,
        obj: &DynamicObject,
    ) -> Result<()> {
        let name = obj.name_any();
        match api.create(&PostParams::default(), obj).await {
            Ok(_) => {
                debug!(stage = %stage, name = %name, "Created");
                Ok(())
            }
            Err(e) => {
                let e = E2eError::from(e);
                if !e.is_already_exists() {
                    return Err(e);
                }
                if !stage.replaces_existing() {
                    debug!(stage = %stage, name = %name, "Already exists");
                    return Ok(());
                }
                let name = name.as_str();
                retry_on_conflict("replace_deploy_object", move || async move {
                    let existing = api.get(name).await?;
                    let mut updated = obj.clone();
                    updated.metadata.resource_version = existing.metadata.resource_version;
                    api.replace(name, &PostParams::default(), &updated).await?;
                    Ok(())
                })
                .await?;
                debug!(stage = %stage, name = %name, "Replaced");
                Ok(())
            }
        }
    }

    async fn delete_object(&self, api: &Api<DynamicObject>, name: &str, timeout: Duration) -> Result<()> {
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(e) => {
                let e = E2eError::from(e);
                if e.is_not_found() {
                    return Ok(());
                }
                return Err(e);
            }
        }
        let what = format!("{} deleted", name);
        let what = what.as_str();
        poll_until(self.poll.with_timeout(timeout), what, move || async move {
            gone(api.get(name).await.map_err(E2eError::from), what)
        })
        .await
    }

    /// Create every stage in order, then wait for the driver workloads.
    #[instrument(skip(self, plan), fields(plan = %plan.name()))]
    pub async fn deploy(&self, plan: &DeployPlan, timeout: Duration) -> Result<()> {
        if plan.owns_namespace() {
            self.resources.create_namespace(plan.namespace(), timeout).await?;
        }

        let discovery = self.discover().await?;
        for item in plan.creation_order() {
            for obj in &item.objects {
                match self.api_for(&discovery, obj, plan.namespace())? {
                    Some(api) => self.create_object(&api, item.stage, obj).await?,
                    None => {
                        let kind = object_gvk(obj)?.kind;
                        warn!(stage = %item.stage, kind = %kind, name = %obj.name_any(), "API not served, skipping");
                    }
                }
            }
            info!(stage = %item.stage, objects = item.objects.len(), "Stage deployed");
        }

        for name in &plan.deployments {
            self.wait_for_deployment_complete(plan.namespace(), name, timeout)
                .await?;
        }
        for name in &plan.daemonsets {
            self.wait_for_daemonset(plan.namespace(), name, timeout).await?;
        }
        info!(namespace = %plan.namespace(), "Driver deployed");
        Ok(())
    }

    /// Delete every object in reverse order.
    ///
    /// Every deletion is attempted; the errors of those that failed are
    /// returned.
    #[instrument(skip(self, plan), fields(plan = %plan.name()))]
    pub async fn teardown(&self, plan: &DeployPlan, timeout: Duration) -> Vec<E2eError> {
        let mut errors = Vec::new();
        let discovery = match self.discover().await {
            Ok(d) => d,
            Err(e) => return vec![e],
        };

        for (stage, obj) in plan.deletion_order() {
            let result = match self.api_for(&discovery, obj, plan.namespace()) {
                Ok(Some(api)) => self.delete_object(&api, &obj.name_any(), timeout).await,
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(stage = %stage, name = %obj.name_any(), error = %e, "Teardown failed");
                errors.push(e);
            }
        }

        if plan.owns_namespace() {
            if let Err(e) = self.resources.delete_namespace(plan.namespace(), timeout).await {
                warn!(namespace = %plan.namespace(), error = %e, "Namespace teardown failed");
                errors.push(e);
            }
        }
        info!(namespace = %plan.namespace(), errors = errors.len(), "Driver removed");
        errors
    }

    pub async fn wait_for_deployment_complete(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<()> {
        self.resources
            .wait_for_deployment_complete(namespace, name, timeout)
            .await
    }

    pub async fn wait_for_daemonset(&self, namespace: &str, name: &str, timeout: Duration) -> Result<()> {
        self.resources
            .wait_for_daemonset_ready(namespace, name, timeout)
            .await
    }
}
