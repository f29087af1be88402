//! YAML fixture loading and mutation
//!
//! Fixtures are read from disk and deserialized into typed objects.
//! Driver deployment manifests have their `namespace: default` rewritten to
//! the driver namespace. The mutators below are pure functions on the
//! loaded objects.

use std::collections::BTreeMap;
use std::path::Path;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{Container, PersistentVolumeClaim, Pod, PodSecurityContext};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{E2eError, Result};
use crate::snapshot::VolumeSnapshot;

/// Namespace token used by the upstream deployment manifests.
const DEFAULT_NAMESPACE_LINE: &str = "namespace: default";
const DOMAIN_LABELS_FLAG: &str = "--domainlabels=";
const TOPOLOGY_GATE_DISABLED: &str = "--feature-gates=Topology=false";
const TOPOLOGY_GATE_ENABLED: &str = "--feature-gates=Topology=true";

/// Reads fixtures and driver manifests.
#[derive(Debug, Clone)]
pub struct ManifestLoader {
    driver_namespace: String,
}

fn manifest_error(path: &Path, reason: impl ToString) -> E2eError {
    E2eError::Manifest {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

impl ManifestLoader {
    pub fn new(driver_namespace: impl Into<String>) -> Self {
        Self {
            driver_namespace: driver_namespace.into(),
        }
    }

    pub fn driver_namespace(&self) -> &str {
        &self.driver_namespace
    }

    pub async fn read(&self, path: &Path) -> Result<String> {
        tokio::fs::read_to_string(path)
            .await
            .map_err(|e| manifest_error(path, e))
    }

    /// Deserialize a single-document fixture.
    pub async fn load<T: DeserializeOwned>(&self, path: &Path) -> Result<T> {
        let text = self.read(path).await?;
        debug!(path = %path.display(), "Loaded fixture");
        serde_yaml::from_str(&text).map_err(|e| manifest_error(path, e))
    }

    /// Deployment manifest text with the namespace rewritten.
    pub async fn load_deploy_text(&self, path: &Path) -> Result<String> {
        let text = self.read(path).await?;
        Ok(replace_namespace(&text, &self.driver_namespace))
    }

    /// Every object of a (possibly multi-document) deployment manifest.
    pub async fn load_deploy_objects(&self, path: &Path) -> Result<Vec<DynamicObject>> {
        let text = self.load_deploy_text(path).await?;
        split_documents(&text).map_err(|e| manifest_error(path, e))
    }

    pub async fn load_pvc(&self, path: &Path) -> Result<PersistentVolumeClaim> {
        self.load(path).await
    }

    /// Load a pod fixture; images are pulled only when missing.
    pub async fn load_pod(&self, path: &Path) -> Result<Pod> {
        let mut pod: Pod = self.load(path).await?;
        if let Some(spec) = pod.spec.as_mut() {
            for container in spec.containers.iter_mut() {
                container.image_pull_policy = Some("IfNotPresent".to_string());
            }
        }
        Ok(pod)
    }

    pub async fn load_storage_class(&self, path: &Path) -> Result<StorageClass> {
        self.load(path).await
    }

    pub async fn load_snapshot(&self, path: &Path) -> Result<VolumeSnapshot> {
        self.load(path).await
    }
}

/// Rewrite `namespace: default` to `namespace: <namespace>`.
pub fn replace_namespace(text: &str, namespace: &str) -> String {
    text.replace(DEFAULT_NAMESPACE_LINE, &format!("namespace: {}", namespace))
}

/// Parse a multi-document YAML stream, skipping empty documents.
pub fn split_documents(text: &str) -> Result<Vec<DynamicObject>> {
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(text) {
        let value = serde_yaml::Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        objects.push(serde_yaml::from_value(value)?);
    }
    Ok(objects)
}

/// Convert an untyped object into its typed form.
pub fn to_typed<K: DeserializeOwned>(obj: &DynamicObject) -> Result<K> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

/// Convert a typed object back into an untyped one.
pub fn to_dynamic<K: Serialize>(obj: &K) -> Result<DynamicObject> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

// ============================================================================
// Mutators
// ============================================================================

pub fn set_name(meta: &mut ObjectMeta, name: &str, namespace: Option<&str>) {
    meta.name = Some(name.to_string());
    if let Some(ns) = namespace {
        meta.namespace = Some(ns.to_string());
    }
}

/// Replace the label set.
pub fn set_labels(meta: &mut ObjectMeta, labels: BTreeMap<String, String>) {
    meta.labels = Some(labels);
}

/// Merge `params` into the storage class parameters.
pub fn set_storage_class_params(sc: &mut StorageClass, params: &BTreeMap<String, String>) {
    let existing = sc.parameters.get_or_insert_with(BTreeMap::new);
    for (k, v) in params {
        existing.insert(k.clone(), v.clone());
    }
}

pub fn set_volume_binding_mode(sc: &mut StorageClass, mode: &str) {
    sc.volume_binding_mode = Some(mode.to_string());
}

/// Point a claim's data source (snapshot or claim) at `name`.
pub fn set_data_source_name(pvc: &mut PersistentVolumeClaim, name: &str) -> Result<()> {
    let source = pvc
        .spec
        .as_mut()
        .and_then(|s| s.data_source.as_mut())
        .ok_or_else(|| E2eError::InvalidObject("pvc has no dataSource".to_string()))?;
    source.name = name.to_string();
    if let Some(source_ref) = pvc
        .spec
        .as_mut()
        .and_then(|s| s.data_source_ref.as_mut())
    {
        source_ref.name = name.to_string();
    }
    Ok(())
}

pub fn data_source_name(pvc: &PersistentVolumeClaim) -> Option<&str> {
    pvc.spec
        .as_ref()
        .and_then(|s| s.data_source.as_ref())
        .map(|d| d.name.as_str())
}

pub fn set_storage_request(pvc: &mut PersistentVolumeClaim, size: &str) {
    pvc.spec
        .get_or_insert_with(Default::default)
        .resources
        .get_or_insert_with(Default::default)
        .requests
        .get_or_insert_with(BTreeMap::new)
        .insert("storage".to_string(), Quantity(size.to_string()));
}

pub fn set_storage_class_name(pvc: &mut PersistentVolumeClaim, class: &str) {
    pvc.spec.get_or_insert_with(Default::default).storage_class_name = Some(class.to_string());
}

/// Make every claim-backed volume of the pod use `claim_name`.
pub fn bind_claim(pod: &mut Pod, claim_name: &str) {
    let volumes = pod.spec.as_mut().and_then(|s| s.volumes.as_mut());
    for volume in volumes.into_iter().flatten() {
        if let Some(claim) = volume.persistent_volume_claim.as_mut() {
            claim.claim_name = claim_name.to_string();
        }
    }
}

/// Run the pod as a non-root user that owns the mounted volume.
pub fn run_as_user(pod: &mut Pod, uid: i64) {
    let spec = pod.spec.get_or_insert_with(Default::default);
    let ctx = spec
        .security_context
        .get_or_insert_with(PodSecurityContext::default);
    ctx.run_as_user = Some(uid);
    ctx.fs_group = Some(uid);
}

/// First mount path of the pod's first container.
pub fn mount_path(pod: &Pod) -> Option<&str> {
    pod.spec
        .as_ref()?
        .containers
        .first()?
        .volume_mounts
        .as_ref()?
        .first()
        .map(|m| m.mount_path.as_str())
}

/// First device path of the pod's first container (block-mode claims).
pub fn device_path(pod: &Pod) -> Option<&str> {
    pod.spec
        .as_ref()?
        .containers
        .first()?
        .volume_devices
        .as_ref()?
        .first()
        .map(|d| d.device_path.as_str())
}

pub fn set_snapshot_source(snapshot: &mut VolumeSnapshot, pvc_name: &str, class: Option<&str>) {
    snapshot.spec.source.persistent_volume_claim_name = Some(pvc_name.to_string());
    if let Some(class) = class {
        snapshot.spec.volume_snapshot_class_name = Some(class.to_string());
    }
}

fn set_domain_labels_arg(container: &mut Container, labels: &[&str]) {
    let flag = format!("{}{}", DOMAIN_LABELS_FLAG, labels.join(","));
    let args = container.args.get_or_insert_with(Vec::new);
    match args.iter_mut().find(|a| a.starts_with(DOMAIN_LABELS_FLAG)) {
        Some(existing) => *existing = flag,
        None => args.push(flag),
    }
}

/// Make the node plugin advertise `labels` as topology domains.
pub fn set_domain_labels(daemonset: &mut DaemonSet, container_name: &str, labels: &[&str]) -> Result<()> {
    let container = daemonset
        .spec
        .as_mut()
        .and_then(|s| s.template.spec.as_mut())
        .and_then(|s| s.containers.iter_mut().find(|c| c.name == container_name))
        .ok_or_else(|| {
            E2eError::InvalidObject(format!("daemonset has no container {}", container_name))
        })?;
    set_domain_labels_arg(container, labels);
    Ok(())
}

/// Flip the provisioner sidecars' Topology feature gate on.
pub fn enable_topology(deployment: &mut Deployment) {
    let containers = deployment
        .spec
        .as_mut()
        .and_then(|s| s.template.spec.as_mut())
        .map(|s| s.containers.iter_mut());
    for container in containers.into_iter().flatten() {
        for arg in container.args.iter_mut().flatten() {
            if arg == TOPOLOGY_GATE_DISABLED {
                *arg = TOPOLOGY_GATE_ENABLED.to_string();
            }
        }
    }
}

/// Scale a deployment to a single replica (small test clusters).
pub fn one_replica(deployment: &mut Deployment) {
    if let Some(spec) = deployment.spec.as_mut() {
        spec.replicas = Some(1);
    }
}
