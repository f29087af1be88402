//! Typed facade over the Kubernetes API
//!
//! Wraps the object kinds the harness touches with the two recurring
//! shapes: create-and-wait-converged and delete-and-wait-gone. Every
//! object created here is recorded in the scenario's [`CleanupLedger`]
//! (when one is attached) so teardown can remove it.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{
    Event, Namespace, Node, PersistentVolume, PersistentVolumeClaim, Pod, Service,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams};
use kube::{Client, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, instrument, warn};

use crate::error::{E2eError, Result};
use crate::ledger::{CleanupLedger, ResourceKind, ResourceRef};
use crate::metrics::OperationTimer;
use crate::poll::{PollSettings, Progress, gone, poll_until, present};
use crate::quantity::{parse_bytes, quantity_bytes};
use crate::snapshot::{VolumeSnapshot, VolumeSnapshotContent};

/// Maximum number of attempts for a read-modify-write that hits a conflict
const MAX_CONFLICT_RETRIES: u32 = 5;
/// Initial backoff delay in milliseconds
const INITIAL_BACKOFF_MS: u64 = 100;
/// Maximum backoff delay in milliseconds
const MAX_BACKOFF_MS: u64 = 2000;
/// Backoff multiplier (exponential factor)
const BACKOFF_MULTIPLIER: u64 = 2;

/// PVC conditions that mean an expansion is still in flight.
const RESIZE_IN_PROGRESS_CONDITIONS: &[&str] = &["Resizing", "FileSystemResizePending"];

/// Execute a read-modify-write with exponential backoff on conflicts.
///
/// Retries up to MAX_CONFLICT_RETRIES times when the update races another
/// writer or the API server reports a transient error.
pub async fn retry_on_conflict<T, F, Fut>(operation_name: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    let mut backoff_ms = INITIAL_BACKOFF_MS;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                attempt += 1;

                if !(e.is_conflict() || e.is_retryable()) || attempt > MAX_CONFLICT_RETRIES {
                    if attempt > 1 {
                        warn!(
                            operation = operation_name,
                            attempts = attempt,
                            error = %e,
                            "Update failed after retries"
                        );
                    }
                    return Err(e);
                }

                debug!(
                    operation = operation_name,
                    attempt = attempt,
                    backoff_ms = backoff_ms,
                    error = %e,
                    "Update conflicted, backing off"
                );

                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * BACKOFF_MULTIPLIER).min(MAX_BACKOFF_MS);
            }
        }
    }
}

/// Treat a missing object as already handled.
pub fn ignore_not_found(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

fn object_name(meta: &ObjectMeta, kind: &str) -> Result<String> {
    meta.name
        .clone()
        .ok_or_else(|| E2eError::InvalidObject(format!("{} has no metadata.name", kind)))
}

fn object_namespace(meta: &ObjectMeta, kind: &str) -> Result<String> {
    meta.namespace
        .clone()
        .ok_or_else(|| E2eError::InvalidObject(format!("{} has no metadata.namespace", kind)))
}

// ============================================================================
// Readiness predicates
// ============================================================================

fn pvc_phase(pvc: &PersistentVolumeClaim) -> &str {
    pvc.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("Unknown")
}

fn pv_phase(pv: &PersistentVolume) -> &str {
    pv.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("Unknown")
}

/// Name of the PV a claim is bound to, once the binder has set it.
pub fn pvc_volume_name(pvc: &PersistentVolumeClaim) -> Option<&str> {
    pvc.spec
        .as_ref()
        .and_then(|s| s.volume_name.as_deref())
        .filter(|v| !v.is_empty())
}

/// Whether deleting the claim also removes its volume. Retained volumes
/// stay `Released` until someone deletes them.
pub fn reclaimed_with_claim(pv: &PersistentVolume) -> bool {
    pv.spec
        .as_ref()
        .and_then(|s| s.persistent_volume_reclaim_policy.as_deref())
        != Some("Retain")
}

/// Both halves of a claim/volume pair report `Bound`.
pub fn binding_progress(pvc: &PersistentVolumeClaim, pv: &PersistentVolume) -> Progress<()> {
    let (claim, volume) = (pvc_phase(pvc), pv_phase(pv));
    if claim == "Bound" && volume == "Bound" {
        Progress::Done(())
    } else {
        Progress::not_yet(format!("pvc phase {}, pv phase {}", claim, volume))
    }
}

/// A pod that ran to completion will never become Running again.
pub fn pod_running_progress(pod: &Pod) -> Result<Progress<()>> {
    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("Unknown");
    match phase {
        "Running" => Ok(Progress::Done(())),
        "Failed" | "Succeeded" => Err(E2eError::mismatch(format!(
            "pod {} completed with phase {}",
            pod.name_any(),
            phase
        ))),
        other => Ok(Progress::not_yet(format!("pod phase {}", other))),
    }
}

pub fn deployment_progress(deployment: &Deployment) -> Progress<()> {
    let generation = deployment.metadata.generation.unwrap_or(0);
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let Some(status) = deployment.status.as_ref() else {
        return Progress::not_yet("no status");
    };
    let observed = status.observed_generation.unwrap_or(0);
    let replicas = status.replicas.unwrap_or(0);
    let ready = status.ready_replicas.unwrap_or(0);

    if observed < generation {
        return Progress::not_yet(format!(
            "observed generation {} < {}",
            observed, generation
        ));
    }
    if ready == replicas && ready >= desired {
        Progress::Done(())
    } else {
        Progress::not_yet(format!("{}/{} replicas ready", ready, desired))
    }
}

pub fn daemonset_progress(daemonset: &DaemonSet) -> Progress<()> {
    let generation = daemonset.metadata.generation.unwrap_or(0);
    let Some(status) = daemonset.status.as_ref() else {
        return Progress::not_yet("no status");
    };
    let observed = status.observed_generation.unwrap_or(0);
    if observed < generation {
        return Progress::not_yet(format!(
            "observed generation {} < {}",
            observed, generation
        ));
    }
    let (ready, desired) = (status.number_ready, status.desired_number_scheduled);
    if desired > 0 && ready == desired {
        Progress::Done(())
    } else {
        Progress::not_yet(format!("{}/{} pods ready", ready, desired))
    }
}

/// Expansion is done when no resize condition remains and the reported
/// capacity equals the requested size.
pub fn resize_progress(pvc: &PersistentVolumeClaim, requested_bytes: u64) -> Progress<()> {
    let status = pvc.status.as_ref();
    if let Some(condition) = status
        .and_then(|s| s.conditions.as_ref())
        .and_then(|c| {
            c.iter()
                .find(|c| RESIZE_IN_PROGRESS_CONDITIONS.contains(&c.type_.as_str()))
        })
    {
        return Progress::not_yet(format!("condition {}", condition.type_));
    }

    let capacity = status
        .and_then(|s| s.capacity.as_ref())
        .and_then(|c| c.get("storage"));
    match capacity.and_then(quantity_bytes) {
        Some(bytes) if bytes == requested_bytes => Progress::Done(()),
        Some(bytes) => Progress::not_yet(format!("capacity {} bytes", bytes)),
        None => Progress::not_yet("no capacity reported"),
    }
}

pub fn snapshot_ready_progress(snapshot: &VolumeSnapshot) -> Progress<()> {
    if snapshot.is_ready() {
        return Progress::Done(());
    }
    match snapshot.error_message() {
        Some(msg) => Progress::not_yet(format!("not ready: {}", msg)),
        None => Progress::not_yet("readyToUse is not true"),
    }
}

/// First InternalIP among a node's addresses.
pub fn node_internal_ip(node: &Node) -> Option<String> {
    node.status
        .as_ref()?
        .addresses
        .as_ref()?
        .iter()
        .find(|a| a.type_ == "InternalIP")
        .map(|a| a.address.clone())
}

/// Apply a label edit to a label map; `None` removes the key.
pub fn edit_labels(labels: &mut BTreeMap<String, String>, key: &str, value: Option<&str>) -> bool {
    match value {
        Some(v) => labels.insert(key.to_string(), v.to_string()).as_deref() != Some(v),
        None => labels.remove(key).is_some(),
    }
}

// ============================================================================
// ResourceClient
// ============================================================================

#[derive(Clone)]
pub struct ResourceClient {
    client: Client,
    poll: PollSettings,
    ledger: Option<Arc<CleanupLedger>>,
}

impl ResourceClient {
    pub fn new(client: Client, poll: PollSettings) -> Self {
        Self {
            client,
            poll,
            ledger: None,
        }
    }

    /// Record created objects in `ledger`.
    pub fn with_ledger(mut self, ledger: Arc<CleanupLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn poll_settings(&self) -> PollSettings {
        self.poll
    }

    fn settings(&self, timeout: Duration) -> PollSettings {
        self.poll.with_timeout(timeout)
    }

    fn record(&self, r: ResourceRef) {
        if let Some(ledger) = &self.ledger {
            ledger.record(r);
        }
    }

    fn forget(&self, r: &ResourceRef) {
        if let Some(ledger) = &self.ledger {
            ledger.forget(r);
        }
    }

    async fn wait_gone<K>(&self, api: &Api<K>, name: &str, what: &str, timeout: Duration) -> Result<()>
    where
        K: Clone + DeserializeOwned + Debug,
    {
        poll_until(self.settings(timeout), what, move || async move {
            gone(api.get(name).await.map_err(E2eError::from), what)
        })
        .await
    }

    async fn create_recorded<K>(&self, api: &Api<K>, obj: &K, r: ResourceRef) -> Result<K>
    where
        K: Clone + DeserializeOwned + Serialize + Debug,
    {
        let created = api.create(&PostParams::default(), obj).await?;
        info!(resource = %r, "Created");
        self.record(r);
        Ok(created)
    }

    async fn delete_and_wait<K>(&self, api: &Api<K>, r: &ResourceRef, timeout: Duration) -> Result<()>
    where
        K: Clone + DeserializeOwned + Debug,
    {
        api.delete(&r.name, &DeleteParams::default()).await?;
        let what = format!("{} deleted", r);
        self.wait_gone(api, &r.name, &what, timeout).await?;
        info!(resource = %r, "Deleted");
        self.forget(r);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Namespaces
    // ------------------------------------------------------------------

    /// Create a namespace (existing is fine) and wait until it is readable.
    #[instrument(skip(self))]
    pub async fn create_namespace(&self, name: &str, timeout: Duration) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let r = ResourceRef::cluster(ResourceKind::Namespace, name);
        match self.create_recorded(&api, &ns, r.clone()).await {
            Ok(_) => {}
            Err(e) if e.is_already_exists() => {
                debug!(namespace = %name, "Namespace already exists");
                self.record(r);
            }
            Err(e) => return Err(e),
        }

        let api = &api;
        let what = format!("namespace {} created", name);
        poll_until(self.settings(timeout), &what, move || async move {
            Ok(match present(api.get(name).await.map_err(E2eError::from))? {
                Some(_) => Progress::Done(()),
                None => Progress::not_yet("namespace not visible"),
            })
        })
        .await
    }

    /// Delete a namespace (missing is fine) and wait until it is gone.
    #[instrument(skip(self))]
    pub async fn delete_namespace(&self, name: &str, timeout: Duration) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let r = ResourceRef::cluster(ResourceKind::Namespace, name);
        ignore_not_found(self.delete_and_wait(&api, &r, timeout).await)?;
        self.forget(&r);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Storage classes, secrets, config maps, services
    // ------------------------------------------------------------------

    #[instrument(skip(self, sc), fields(name = ?sc.metadata.name))]
    pub async fn create_storage_class(&self, sc: &StorageClass) -> Result<StorageClass> {
        let name = object_name(&sc.metadata, "StorageClass")?;
        let api: Api<StorageClass> = Api::all(self.client.clone());
        self.create_recorded(&api, sc, ResourceRef::cluster(ResourceKind::StorageClass, &name))
            .await
    }

    #[instrument(skip(self))]
    pub async fn delete_storage_class(&self, name: &str) -> Result<()> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        let r = ResourceRef::cluster(ResourceKind::StorageClass, name);
        self.delete_and_wait(&api, &r, self.poll.timeout).await
    }

    pub async fn list_services(&self, namespace: &str, selector: &str) -> Result<Vec<Service>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default().labels(selector)).await?.items)
    }

    // ------------------------------------------------------------------
    // Persistent volume claims and volumes
    // ------------------------------------------------------------------

    /// Create a claim and wait until it and its volume are `Bound`.
    ///
    /// A zero `timeout` only issues the create.
    #[instrument(skip(self, pvc), fields(name = ?pvc.metadata.name))]
    pub async fn create_pvc_and_wait_bound(
        &self,
        pvc: &PersistentVolumeClaim,
        timeout: Duration,
    ) -> Result<PersistentVolumeClaim> {
        let name = object_name(&pvc.metadata, "PersistentVolumeClaim")?;
        let ns = object_namespace(&pvc.metadata, "PersistentVolumeClaim")?;
        let timer = OperationTimer::new("create_pvc");

        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &ns);
        let created = self
            .create_recorded(
                &api,
                pvc,
                ResourceRef::namespaced(ResourceKind::PersistentVolumeClaim, &ns, &name),
            )
            .await?;
        if timeout.is_zero() {
            timer.success();
            return Ok(created);
        }

        let pvs: Api<PersistentVolume> = Api::all(self.client.clone());
        let (api, pvs, claim) = (&api, &pvs, name.as_str());
        let what = format!("pvc {}/{} bound", ns, name);
        let result = poll_until(self.settings(timeout), &what, move || async move {
            let Some(pvc) = present(api.get(claim).await.map_err(E2eError::from))? else {
                return Ok(Progress::not_yet("pvc not visible yet"));
            };
            let Some(volume) = pvc_volume_name(&pvc) else {
                return Ok(Progress::not_yet(format!(
                    "pvc phase {}, no volume yet",
                    pvc_phase(&pvc)
                )));
            };
            let Some(pv) = present(pvs.get(volume).await.map_err(E2eError::from))? else {
                return Ok(Progress::not_yet(format!("pv {} not visible yet", volume)));
            };
            Ok(match binding_progress(&pvc, &pv) {
                Progress::Done(()) => Progress::Done(pvc),
                Progress::NotYet(state) => Progress::NotYet(state),
            })
        })
        .await;

        match &result {
            Ok(_) => timer.success(),
            Err(e) => timer.failure(&e.kind().to_string()),
        }
        result
    }

    pub async fn get_pvc(&self, namespace: &str, name: &str) -> Result<PersistentVolumeClaim> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    pub async fn get_pv(&self, name: &str) -> Result<PersistentVolume> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        Ok(api.get(name).await?)
    }

    /// Volume bound to a claim; fails when the claim is not bound yet.
    pub async fn bound_pv(&self, namespace: &str, name: &str) -> Result<PersistentVolume> {
        let pvc = self.get_pvc(namespace, name).await?;
        let volume = pvc_volume_name(&pvc).ok_or_else(|| {
            E2eError::mismatch(format!("pvc {}/{} has no bound volume", namespace, name))
        })?;
        self.get_pv(volume).await
    }

    /// Delete a claim and wait until both the claim and its volume are gone.
    #[instrument(skip(self))]
    pub async fn delete_pvc_and_wait(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<()> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let volume = pvc_volume_name(&api.get(name).await?).map(str::to_string);

        let r = ResourceRef::namespaced(ResourceKind::PersistentVolumeClaim, namespace, name);
        self.delete_and_wait(&api, &r, timeout).await?;

        if let Some(volume) = volume {
            let pvs: Api<PersistentVolume> = Api::all(self.client.clone());
            match present(pvs.get(&volume).await.map_err(E2eError::from))? {
                Some(pv) if !reclaimed_with_claim(&pv) => {
                    debug!(pv = %volume, "Volume is retained");
                }
                _ => {
                    let what = format!("pv {} deleted", volume);
                    self.wait_gone(&pvs, &volume, &what, timeout).await?;
                }
            }
        }
        Ok(())
    }

    /// Create a pre-provisioned volume for a claim to bind by name.
    #[instrument(skip(self, pv), fields(name = ?pv.metadata.name))]
    pub async fn create_pv(&self, pv: &PersistentVolume) -> Result<PersistentVolume> {
        let name = object_name(&pv.metadata, "PersistentVolume")?;
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        self.create_recorded(&api, pv, ResourceRef::cluster(ResourceKind::PersistentVolume, &name))
            .await
    }

    pub async fn delete_pv_and_wait(&self, name: &str, timeout: Duration) -> Result<()> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        let r = ResourceRef::cluster(ResourceKind::PersistentVolume, name);
        self.delete_and_wait(&api, &r, timeout).await
    }

    /// Request a new size for a claim and wait until the resize completes.
    #[instrument(skip(self))]
    pub async fn expand_pvc(
        &self,
        namespace: &str,
        name: &str,
        size: &str,
        timeout: Duration,
    ) -> Result<()> {
        let requested = parse_bytes(size)
            .ok_or_else(|| E2eError::InvalidObject(format!("invalid storage size {}", size)))?;
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let (api, claim) = (&api, name);

        retry_on_conflict("expand_pvc", move || async move {
            let mut pvc = api.get(claim).await?;
            let spec = pvc.spec.get_or_insert_with(Default::default);
            spec.resources
                .get_or_insert_with(Default::default)
                .requests
                .get_or_insert_with(Default::default)
                .insert("storage".to_string(), Quantity(size.to_string()));
            api.replace(claim, &PostParams::default(), &pvc).await?;
            Ok(())
        })
        .await?;
        info!(namespace, name, size, "Requested PVC expansion");

        let what = format!("pvc {}/{} resized to {}", namespace, name, size);
        poll_until(self.settings(timeout), &what, move || async move {
            let pvc = api.get(claim).await?;
            Ok(resize_progress(&pvc, requested))
        })
        .await
    }

    // ------------------------------------------------------------------
    // Pods
    // ------------------------------------------------------------------

    #[instrument(skip(self, pod), fields(name = ?pod.metadata.name))]
    pub async fn create_pod_and_wait_running(&self, pod: &Pod, timeout: Duration) -> Result<Pod> {
        let name = object_name(&pod.metadata, "Pod")?;
        let ns = object_namespace(&pod.metadata, "Pod")?;
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &ns);
        self.create_recorded(&api, pod, ResourceRef::namespaced(ResourceKind::Pod, &ns, &name))
            .await?;
        self.wait_pod_running(&ns, &name, timeout).await
    }

    pub async fn wait_pod_running(&self, namespace: &str, name: &str, timeout: Duration) -> Result<Pod> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let (api, pod_name) = (&api, name);
        let what = format!("pod {}/{} running", namespace, name);
        poll_until(self.settings(timeout), &what, move || async move {
            let Some(pod) = present(api.get(pod_name).await.map_err(E2eError::from))? else {
                return Ok(Progress::not_yet("pod not visible yet"));
            };
            Ok(match pod_running_progress(&pod)? {
                Progress::Done(()) => Progress::Done(pod),
                Progress::NotYet(state) => Progress::NotYet(state),
            })
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn delete_pod_and_wait(&self, namespace: &str, name: &str, timeout: Duration) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let r = ResourceRef::namespaced(ResourceKind::Pod, namespace, name);
        self.delete_and_wait(&api, &r, timeout).await
    }

    pub async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default().labels(selector)).await?.items)
    }

    /// Delete every pod matching `selector` and wait for each to disappear.
    #[instrument(skip(self))]
    pub async fn delete_pods_by_label(
        &self,
        namespace: &str,
        selector: &str,
        timeout: Duration,
    ) -> Result<usize> {
        let pods = self.list_pods(namespace, selector).await?;
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        for pod in &pods {
            let name = pod.name_any();
            let deleted = api
                .delete(&name, &DeleteParams::default())
                .await
                .map(|_| ())
                .map_err(E2eError::from);
            ignore_not_found(deleted)?;
            let what = format!("pod {}/{} deleted", namespace, name);
            self.wait_gone(&api, &name, &what, timeout).await?;
        }
        Ok(pods.len())
    }

    pub async fn pod_logs(&self, namespace: &str, name: &str, container: Option<&str>) -> Result<String> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = LogParams {
            container: container.map(str::to_string),
            tail_lines: Some(200),
            ..Default::default()
        };
        Ok(api.logs(name, &params).await?)
    }

    // ------------------------------------------------------------------
    // Workload readiness
    // ------------------------------------------------------------------

    #[instrument(skip(self))]
    pub async fn wait_for_deployment_complete(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let (api, deployment) = (&api, name);
        let what = format!("deployment {}/{} complete", namespace, name);
        poll_until(self.settings(timeout), &what, move || async move {
            Ok(match present(api.get(deployment).await.map_err(E2eError::from))? {
                Some(d) => deployment_progress(&d),
                None => Progress::not_yet("deployment not visible yet"),
            })
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn wait_for_daemonset_ready(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<()> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        let (api, daemonset) = (&api, name);
        let what = format!("daemonset {}/{} ready", namespace, name);
        poll_until(self.settings(timeout), &what, move || async move {
            Ok(match present(api.get(daemonset).await.map_err(E2eError::from))? {
                Some(ds) => daemonset_progress(&ds),
                None => Progress::not_yet("daemonset not visible yet"),
            })
        })
        .await
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    #[instrument(skip(self, snapshot), fields(name = ?snapshot.metadata.name))]
    pub async fn create_snapshot_and_wait_ready(
        &self,
        snapshot: &VolumeSnapshot,
        timeout: Duration,
    ) -> Result<VolumeSnapshot> {
        let name = object_name(&snapshot.metadata, "VolumeSnapshot")?;
        let ns = object_namespace(&snapshot.metadata, "VolumeSnapshot")?;
        let api: Api<VolumeSnapshot> = Api::namespaced(self.client.clone(), &ns);
        self.create_recorded(
            &api,
            snapshot,
            ResourceRef::namespaced(ResourceKind::VolumeSnapshot, &ns, &name),
        )
        .await?;

        let (api, snap) = (&api, name.as_str());
        let what = format!("snapshot {}/{} ready", ns, name);
        poll_until(self.settings(timeout), &what, move || async move {
            let Some(s) = present(api.get(snap).await.map_err(E2eError::from))? else {
                return Ok(Progress::not_yet("snapshot not visible yet"));
            };
            Ok(match snapshot_ready_progress(&s) {
                Progress::Done(()) => Progress::Done(s),
                Progress::NotYet(state) => Progress::NotYet(state),
            })
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn delete_snapshot_and_wait(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<()> {
        let api: Api<VolumeSnapshot> = Api::namespaced(self.client.clone(), namespace);
        let r = ResourceRef::namespaced(ResourceKind::VolumeSnapshot, namespace, name);
        self.delete_and_wait(&api, &r, timeout).await
    }

    pub async fn get_snapshot(&self, namespace: &str, name: &str) -> Result<VolumeSnapshot> {
        let api: Api<VolumeSnapshot> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    pub async fn get_snapshot_content(&self, name: &str) -> Result<VolumeSnapshotContent> {
        let api: Api<VolumeSnapshotContent> = Api::all(self.client.clone());
        Ok(api.get(name).await?)
    }

    // ------------------------------------------------------------------
    // Nodes
    // ------------------------------------------------------------------

    async fn edit_all_node_labels(&self, key: &str, value: Option<&str>) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api.list(&ListParams::default()).await?;
        for node in nodes.items {
            let node_name = node.name_any();
            let (api, node_name) = (&api, node_name.as_str());
            retry_on_conflict("edit_node_label", move || async move {
                let mut node = api.get(node_name).await?;
                if edit_labels(node.labels_mut(), key, value) {
                    api.replace(node_name, &PostParams::default(), &node).await?;
                }
                Ok(())
            })
            .await?;
        }
        Ok(())
    }

    /// Set `key=value` on every node.
    #[instrument(skip(self))]
    pub async fn label_all_nodes(&self, key: &str, value: &str) -> Result<()> {
        self.edit_all_node_labels(key, Some(value)).await?;
        self.record(ResourceRef::cluster(ResourceKind::NodeLabel, key));
        info!(key, value, "Labelled all nodes");
        Ok(())
    }

    /// Remove `key` from every node; nodes without the label are skipped.
    #[instrument(skip(self))]
    pub async fn remove_node_label(&self, key: &str) -> Result<()> {
        self.edit_all_node_labels(key, None).await?;
        self.forget(&ResourceRef::cluster(ResourceKind::NodeLabel, key));
        Ok(())
    }

    /// InternalIP of the first node, where the kubelet read-only port lives.
    pub async fn kubelet_ip(&self) -> Result<String> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api.list(&ListParams::default()).await?;
        nodes
            .items
            .first()
            .and_then(node_internal_ip)
            .ok_or_else(|| E2eError::NotFound("node with an InternalIP address".to_string()))
    }

    // ------------------------------------------------------------------
    // Ledger-driven cleanup and diagnostics
    // ------------------------------------------------------------------

    /// Delete a recorded object; an already missing object counts as deleted.
    pub async fn delete_ref(&self, r: &ResourceRef, timeout: Duration) -> Result<()> {
        let ns = r.namespace.as_deref().unwrap_or_default();
        let result = match r.kind {
            ResourceKind::Namespace => return self.delete_namespace(&r.name, timeout).await,
            ResourceKind::NodeLabel => return self.remove_node_label(&r.name).await,
            ResourceKind::StorageClass => {
                let api: Api<StorageClass> = Api::all(self.client.clone());
                self.delete_and_wait(&api, r, timeout).await
            }
            ResourceKind::PersistentVolumeClaim => {
                self.delete_pvc_and_wait(ns, &r.name, timeout).await
            }
            ResourceKind::PersistentVolume => self.delete_pv_and_wait(&r.name, timeout).await,
            ResourceKind::Pod => {
                let api: Api<Pod> = Api::namespaced(self.client.clone(), ns);
                self.delete_and_wait(&api, r, timeout).await
            }
            ResourceKind::VolumeSnapshot => {
                let api: Api<VolumeSnapshot> = Api::namespaced(self.client.clone(), ns);
                self.delete_and_wait(&api, r, timeout).await
            }
        };
        ignore_not_found(result)?;
        self.forget(r);
        Ok(())
    }

    /// Delete everything in the attached ledger, newest first.
    ///
    /// Every entry is attempted; the errors of the ones that could not be
    /// removed within `timeout` are returned.
    pub async fn teardown_recorded(&self, timeout: Duration) -> Vec<E2eError> {
        let Some(ledger) = &self.ledger else {
            return Vec::new();
        };
        let mut errors = Vec::new();
        for r in ledger.drain_reverse() {
            if let Err(e) = self.delete_ref(&r, timeout).await {
                warn!(resource = %r, error = %e, "Failed to remove resource");
                errors.push(E2eError::mismatch(format!("{} leaked: {}", r, e)));
            }
        }
        errors
    }

    /// Human-readable state of a namespace for failure reports.
    pub async fn namespace_dump(&self, namespace: &str) -> Result<String> {
        let mut out = format!("=== namespace {} ===\n", namespace);

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        for pod in pods.list(&ListParams::default()).await?.items {
            let status = pod.status.as_ref();
            out.push_str(&format!(
                "pod {} phase={} node={}\n",
                pod.name_any(),
                status.and_then(|s| s.phase.as_deref()).unwrap_or("Unknown"),
                pod.spec
                    .as_ref()
                    .and_then(|s| s.node_name.as_deref())
                    .unwrap_or("-"),
            ));
        }

        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        for pvc in pvcs.list(&ListParams::default()).await?.items {
            out.push_str(&format!(
                "pvc {} phase={} volume={}\n",
                pvc.name_any(),
                pvc_phase(&pvc),
                pvc_volume_name(&pvc).unwrap_or("-"),
            ));
        }

        let events: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        for ev in events.list(&ListParams::default()).await?.items {
            out.push_str(&format!(
                "event {} {}/{}: {} {}\n",
                ev.type_.as_deref().unwrap_or("-"),
                ev.involved_object.kind.as_deref().unwrap_or("-"),
                ev.involved_object.name.as_deref().unwrap_or("-"),
                ev.reason.as_deref().unwrap_or("-"),
                ev.message.as_deref().unwrap_or(""),
            ));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{DaemonSetStatus, DeploymentSpec, DeploymentStatus};
    use k8s_openapi::api::core::v1::{
        NodeAddress, NodeStatus, PersistentVolumeClaimCondition, PersistentVolumeClaimSpec,
        PersistentVolumeClaimStatus, PersistentVolumeSpec, PersistentVolumeStatus, PodStatus,
    };
    use std::sync::atomic::{AtomicU32, Ordering};

    fn pvc_with(phase: &str, volume: Option<&str>) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            spec: Some(PersistentVolumeClaimSpec {
                volume_name: volume.map(str::to_string),
                ..Default::default()
            }),
            status: Some(PersistentVolumeClaimStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn pv_with(phase: &str) -> PersistentVolume {
        PersistentVolume {
            status: Some(PersistentVolumeStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn pod_in(phase: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("app".into()),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    // ========================================================================
    // Binding
    // ========================================================================

    #[test]
    fn test_volume_name_ignores_empty() {
        assert_eq!(pvc_volume_name(&pvc_with("Pending", Some(""))), None);
        assert_eq!(pvc_volume_name(&pvc_with("Bound", Some("pv-1"))), Some("pv-1"));
    }

    #[test]
    fn test_binding_requires_both_bound() {
        let pvc = pvc_with("Bound", Some("pv-1"));
        assert_eq!(binding_progress(&pvc, &pv_with("Bound")), Progress::Done(()));
        assert!(matches!(
            binding_progress(&pvc, &pv_with("Available")),
            Progress::NotYet(_)
        ));
        assert!(matches!(
            binding_progress(&pvc_with("Pending", Some("pv-1")), &pv_with("Bound")),
            Progress::NotYet(_)
        ));
    }

    #[test]
    fn test_retained_volume_outlives_claim() {
        let mut pv = pv_with("Released");
        assert!(reclaimed_with_claim(&pv));
        pv.spec = Some(PersistentVolumeSpec {
            persistent_volume_reclaim_policy: Some("Retain".to_string()),
            ..Default::default()
        });
        assert!(!reclaimed_with_claim(&pv));
        pv.spec = Some(PersistentVolumeSpec {
            persistent_volume_reclaim_policy: Some("Delete".to_string()),
            ..Default::default()
        });
        assert!(reclaimed_with_claim(&pv));
    }

    // ========================================================================
    // Pods and workloads
    // ========================================================================

    #[test]
    fn test_pod_running_progress() {
        assert_eq!(pod_running_progress(&pod_in("Running")).unwrap(), Progress::Done(()));
        assert!(matches!(
            pod_running_progress(&pod_in("Pending")).unwrap(),
            Progress::NotYet(_)
        ));
        assert!(pod_running_progress(&pod_in("Succeeded")).is_err());
        assert!(pod_running_progress(&pod_in("Failed")).is_err());
    }

    #[test]
    fn test_deployment_progress() {
        let mut d = Deployment {
            metadata: ObjectMeta {
                generation: Some(2),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                observed_generation: Some(1),
                replicas: Some(1),
                ready_replicas: Some(1),
                ..Default::default()
            }),
        };
        // Stale status from the previous generation
        assert!(matches!(deployment_progress(&d), Progress::NotYet(_)));

        if let Some(s) = d.status.as_mut() {
            s.observed_generation = Some(2);
        }
        assert_eq!(deployment_progress(&d), Progress::Done(()));

        if let Some(s) = d.status.as_mut() {
            s.ready_replicas = Some(0);
        }
        assert!(matches!(deployment_progress(&d), Progress::NotYet(_)));
    }

    #[test]
    fn test_daemonset_progress() {
        let mut ds = DaemonSet {
            status: Some(DaemonSetStatus {
                desired_number_scheduled: 3,
                number_ready: 2,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(matches!(daemonset_progress(&ds), Progress::NotYet(_)));
        if let Some(s) = ds.status.as_mut() {
            s.number_ready = 3;
        }
        assert_eq!(daemonset_progress(&ds), Progress::Done(()));

        let empty = DaemonSet::default();
        assert!(matches!(daemonset_progress(&empty), Progress::NotYet(_)));
    }

    // ========================================================================
    // Resize
    // ========================================================================

    #[test]
    fn test_resize_waits_for_conditions_and_capacity() {
        let five_gi = 5 * crate::quantity::GIB;
        let mut pvc = pvc_with("Bound", Some("pv-1"));
        let status = pvc.status.as_mut().unwrap();
        status.capacity = Some(BTreeMap::from([(
            "storage".to_string(),
            Quantity("2Gi".into()),
        )]));
        status.conditions = Some(vec![PersistentVolumeClaimCondition {
            type_: "FileSystemResizePending".into(),
            status: "True".into(),
            ..Default::default()
        }]);
        match resize_progress(&pvc, five_gi) {
            Progress::NotYet(s) => assert!(s.contains("FileSystemResizePending")),
            other => panic!("unexpected {:?}", other),
        }

        let status = pvc.status.as_mut().unwrap();
        status.conditions = None;
        assert!(matches!(resize_progress(&pvc, five_gi), Progress::NotYet(_)));

        let status = pvc.status.as_mut().unwrap();
        status.capacity = Some(BTreeMap::from([(
            "storage".to_string(),
            Quantity("5Gi".into()),
        )]));
        assert_eq!(resize_progress(&pvc, five_gi), Progress::Done(()));
    }

    // ========================================================================
    // Nodes and labels
    // ========================================================================

    #[test]
    fn test_node_internal_ip() {
        let node = Node {
            status: Some(NodeStatus {
                addresses: Some(vec![
                    NodeAddress {
                        address: "node-1".into(),
                        type_: "Hostname".into(),
                    },
                    NodeAddress {
                        address: "10.0.0.5".into(),
                        type_: "InternalIP".into(),
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(node_internal_ip(&node).as_deref(), Some("10.0.0.5"));
        assert_eq!(node_internal_ip(&Node::default()), None);
    }

    #[test]
    fn test_edit_labels_reports_change() {
        let mut labels = BTreeMap::new();
        assert!(edit_labels(&mut labels, "zone", Some("testzone")));
        assert!(!edit_labels(&mut labels, "zone", Some("testzone")));
        assert!(edit_labels(&mut labels, "zone", None));
        // Removal of an absent label is not an error
        assert!(!edit_labels(&mut labels, "zone", None));
    }

    #[test]
    fn test_ignore_not_found() {
        assert!(ignore_not_found(Err(E2eError::NotFound("x".into()))).is_ok());
        assert!(ignore_not_found(Err(E2eError::mismatch("x"))).is_err());
    }

    // ========================================================================
    // Conflict retry
    // ========================================================================

    #[tokio::test]
    async fn test_retry_on_conflict_succeeds_after_conflicts() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = retry_on_conflict("label", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(E2eError::Conflict("object has been modified".into()))
                } else {
                    Ok("done")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_on_conflict_does_not_retry_other_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<()> = retry_on_conflict("label", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(E2eError::NotFound("node".into()))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
