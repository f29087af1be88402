//! Cluster-specific objects the drivers need, and the deploy plan that
//! carries them
//!
//! The deploy manifests and example fixtures come from the ceph-csi tree;
//! everything that depends on the live Ceph cluster (cluster id, monitors,
//! user keys) is filled in here.

use std::collections::BTreeMap;
use std::path::Path;

use e2e_framework::ceph::BackendImage;
use e2e_framework::manifest::{
    enable_topology, one_replica, set_domain_labels, set_name, set_storage_class_params, to_dynamic,
    to_typed,
};
use e2e_framework::{DeployPlan, DeployStage, E2eError, ManifestLoader, Result};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{
    CSIPersistentVolumeSource, ConfigMap, PersistentVolume, PersistentVolumeSpec, Secret,
    SecretReference, Service,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ManifestDirs;
use crate::plugin::{CEPHFS_NAME, NODE_REGION_LABEL, NODE_ZONE_LABEL, Plugin, RBD_POOL, Role};

/// Name of the driver configuration ConfigMap.
pub const CONFIG_MAP_NAME: &str = "ceph-csi-config";
pub const CONFIG_MAP_KEY: &str = "config.json";
/// Label of the Rook monitor services.
pub const MON_SERVICE_SELECTOR: &str = "app=rook-ceph-mon";
pub const STORAGE_CLASS_FILE: &str = "storageclass.yaml";
pub const SNAPSHOT_CLASS_FILE: &str = "snapshotclass.yaml";

const SECRET_PARAM_PREFIX: &str = "csi.storage.k8s.io";
/// Passphrase RBD secrets carry for encrypted volumes.
pub const ENCRYPTION_PASSPHRASE: &str = "test_passphrase";

// ============================================================================
// config.json
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RbdClusterInfo {
    #[serde(rename = "radosNamespace", default, skip_serializing_if = "String::is_empty")]
    pub rados_namespace: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CephFsClusterInfo {
    #[serde(rename = "subvolumeGroup", default, skip_serializing_if = "String::is_empty")]
    pub subvolume_group: String,
}

/// One entry of the driver's `config.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    #[serde(rename = "clusterID")]
    pub cluster_id: String,
    pub monitors: Vec<String>,
    #[serde(default)]
    pub rbd: RbdClusterInfo,
    #[serde(rename = "cephFS", default)]
    pub cephfs: CephFsClusterInfo,
}

/// `<svc>.<ns>.svc.cluster.local:<port>` for every monitor service.
pub fn monitor_addresses(services: &[Service]) -> Vec<String> {
    services
        .iter()
        .filter_map(|svc| {
            let name = svc.metadata.name.as_deref()?;
            let namespace = svc.metadata.namespace.as_deref()?;
            let port = svc.spec.as_ref()?.ports.as_ref()?.first()?.port;
            Some(format!("{}.{}.svc.cluster.local:{}", name, namespace, port))
        })
        .collect()
}

pub fn config_map(namespace: &str, clusters: &[ClusterInfo]) -> Result<ConfigMap> {
    let json = serde_json::to_string(clusters)?;
    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(CONFIG_MAP_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(CONFIG_MAP_KEY.to_string(), json)])),
        ..Default::default()
    })
}

// ============================================================================
// Secrets and classes
// ============================================================================

/// Secret holding the credentials of `plugin`'s `role` user.
pub fn user_secret(plugin: Plugin, role: Role, namespace: &str, key: &str) -> Secret {
    let user = plugin.user(role);
    let (id_key, key_key) = plugin.secret_keys();
    let mut data = BTreeMap::from([
        (id_key.to_string(), user.to_string()),
        (key_key.to_string(), key.to_string()),
    ]);
    if plugin == Plugin::Rbd {
        data.insert("encryptionPassphrase".to_string(), ENCRYPTION_PASSPHRASE.to_string());
    }
    Secret {
        metadata: ObjectMeta {
            name: Some(user.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        string_data: Some(data),
        ..Default::default()
    }
}

fn secret_param(kind: &str, field: &str) -> String {
    format!("{}/{}-secret-{}", SECRET_PARAM_PREFIX, kind, field)
}

/// Parameters pointing a storage class at this cluster and the driver's
/// secrets.
pub fn storage_class_params(plugin: Plugin, cluster_id: &str, secret_namespace: &str) -> BTreeMap<String, String> {
    let provisioner = plugin.user(Role::Provisioner);
    let node = plugin.user(Role::Node);
    let mut params = BTreeMap::from([
        ("clusterID".to_string(), cluster_id.to_string()),
        (secret_param("provisioner", "name"), provisioner.to_string()),
        (secret_param("provisioner", "namespace"), secret_namespace.to_string()),
        (secret_param("controller-expand", "name"), provisioner.to_string()),
        (secret_param("controller-expand", "namespace"), secret_namespace.to_string()),
        (secret_param("node-stage", "name"), node.to_string()),
        (secret_param("node-stage", "namespace"), secret_namespace.to_string()),
    ]);
    match plugin {
        Plugin::Rbd => {
            params.insert("pool".to_string(), RBD_POOL.to_string());
        }
        Plugin::CephFs => {
            params.insert("fsName".to_string(), CEPHFS_NAME.to_string());
        }
    }
    params
}

/// Default storage class from the examples tree, pointed at this cluster.
pub async fn storage_class(
    plugin: Plugin,
    loader: &ManifestLoader,
    examples: &Path,
    cluster_id: &str,
) -> Result<StorageClass> {
    let mut sc = loader.load_storage_class(&examples.join(STORAGE_CLASS_FILE)).await?;
    let params = storage_class_params(plugin, cluster_id, loader.driver_namespace());
    set_storage_class_params(&mut sc, &params);
    if plugin == Plugin::CephFs {
        sc.mount_options = None;
    }
    Ok(sc)
}

/// Snapshot class from the examples tree with cluster and secret filled in.
pub async fn snapshot_class(
    plugin: Plugin,
    loader: &ManifestLoader,
    examples: &Path,
    cluster_id: &str,
) -> Result<DynamicObject> {
    let path = examples.join(SNAPSHOT_CLASS_FILE);
    let mut objects = loader.load_deploy_objects(&path).await?;
    if objects.len() != 1 {
        return Err(E2eError::Manifest {
            path: path.display().to_string(),
            reason: format!("expected one snapshot class, found {}", objects.len()),
        });
    }
    let mut class = objects.remove(0);

    let provisioner = plugin.user(Role::Provisioner);
    let mut params = serde_json::Map::new();
    params.insert("clusterID".into(), cluster_id.into());
    params.insert(secret_param("snapshotter", "name"), provisioner.into());
    params.insert(secret_param("snapshotter", "namespace"), loader.driver_namespace().into());
    match plugin {
        Plugin::Rbd => params.insert("pool".into(), RBD_POOL.into()),
        Plugin::CephFs => params.insert("fsName".into(), CEPHFS_NAME.into()),
    };

    let data = class
        .data
        .as_object_mut()
        .ok_or_else(|| E2eError::InvalidObject("snapshot class body is not an object".to_string()))?;
    let existing = data
        .entry("parameters")
        .or_insert_with(|| serde_json::Value::Object(Default::default()));
    match existing.as_object_mut() {
        Some(existing) => existing.extend(params),
        None => *existing = serde_json::Value::Object(params),
    }
    Ok(class)
}

// ============================================================================
// Static volumes
// ============================================================================

/// Retained volume exposing a pre-created RBD image, staged with the node
/// user's secret. Claims bind to it by name with an empty class.
pub fn static_rbd_pv(
    name: &str,
    image: &BackendImage,
    cluster_id: &str,
    size: &str,
    secret_namespace: &str,
) -> PersistentVolume {
    let mut attributes = BTreeMap::from([
        ("clusterID".to_string(), cluster_id.to_string()),
        ("pool".to_string(), image.pool.clone()),
        ("staticVolume".to_string(), "true".to_string()),
        ("imageFeatures".to_string(), "layering".to_string()),
    ]);
    if let Some(ns) = &image.rados_namespace {
        attributes.insert("radosNamespace".to_string(), ns.clone());
    }
    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            capacity: Some(BTreeMap::from([("storage".to_string(), Quantity(size.to_string()))])),
            persistent_volume_reclaim_policy: Some("Retain".to_string()),
            storage_class_name: Some(String::new()),
            volume_mode: Some("Filesystem".to_string()),
            csi: Some(CSIPersistentVolumeSource {
                driver: Plugin::Rbd.driver_name().to_string(),
                volume_handle: image.name.clone(),
                volume_attributes: Some(attributes),
                node_stage_secret_ref: Some(SecretReference {
                    name: Some(Plugin::Rbd.user(Role::Node).to_string()),
                    namespace: Some(secret_namespace.to_string()),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

// ============================================================================
// Deploy plan
// ============================================================================

/// Values read from the live cluster that the plan embeds.
#[derive(Debug, Clone)]
pub struct DriverInputs {
    pub cluster: ClusterInfo,
    pub provisioner_key: String,
    pub node_key: String,
    /// Advertise and enforce topology domains.
    pub topology: bool,
}

fn adjust_workload(plugin: Plugin, stage: DeployStage, obj: DynamicObject, topology: bool) -> Result<DynamicObject> {
    let kind = obj.types.as_ref().map(|t| t.kind.as_str()).unwrap_or_default();
    match (stage, kind) {
        (DeployStage::Provisioner, "Deployment") => {
            let mut deployment: Deployment = to_typed(&obj)?;
            one_replica(&mut deployment);
            if topology {
                enable_topology(&mut deployment);
            }
            to_dynamic(&deployment)
        }
        (DeployStage::NodePlugin, "DaemonSet") if topology => {
            let mut daemonset: DaemonSet = to_typed(&obj)?;
            set_domain_labels(&mut daemonset, plugin.container(), &[NODE_REGION_LABEL, NODE_ZONE_LABEL])?;
            to_dynamic(&daemonset)
        }
        _ => Ok(obj),
    }
}

/// Everything needed to stand up `plugin` from `dirs`: the deploy
/// manifests plus config map, secrets and snapshot class.
pub async fn deploy_plan(
    plugin: Plugin,
    loader: &ManifestLoader,
    dirs: &ManifestDirs,
    inputs: &DriverInputs,
) -> Result<DeployPlan> {
    let namespace = loader.driver_namespace();
    let mut plan = DeployPlan::new(plugin.name(), namespace)
        .wait_deployment(plugin.provisioner())
        .wait_daemonset(plugin.node_plugin());

    for manifest in plugin.manifests() {
        let path = dirs.deploy.join(manifest.file);
        if !manifest.required && !tokio::fs::try_exists(&path).await? {
            debug!(path = %path.display(), "Optional manifest absent");
            continue;
        }
        let objects = loader
            .load_deploy_objects(&path)
            .await?
            .into_iter()
            .map(|obj| adjust_workload(plugin, manifest.stage, obj, inputs.topology))
            .collect::<Result<Vec<_>>>()?;
        plan = plan.stage(manifest.stage, objects);
    }

    let config = config_map(namespace, std::slice::from_ref(&inputs.cluster))?;
    let secrets = vec![
        to_dynamic(&user_secret(plugin, Role::Provisioner, namespace, &inputs.provisioner_key))?,
        to_dynamic(&user_secret(plugin, Role::Node, namespace, &inputs.node_key))?,
    ];
    let snapshot_class = snapshot_class(plugin, loader, &dirs.examples, &inputs.cluster.cluster_id).await?;

    Ok(plan
        .stage(DeployStage::ConfigMap, vec![to_dynamic(&config)?])
        .stage(DeployStage::Secrets, secrets)
        .stage(DeployStage::SnapshotClass, vec![snapshot_class]))
}

/// The default storage class, renamed for one scenario.
pub fn named_storage_class(base: &StorageClass, name: &str) -> StorageClass {
    let mut sc = base.clone();
    sc.metadata = ObjectMeta::default();
    set_name(&mut sc.metadata, name, None);
    sc
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};

    fn mon(name: &str, port: i32) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("rook-ceph".to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                ports: Some(vec![ServicePort {
                    port,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_monitor_addresses() {
        let addrs = monitor_addresses(&[mon("rook-ceph-mon-a", 6789), mon("rook-ceph-mon-b", 3300)]);
        assert_eq!(
            addrs,
            vec![
                "rook-ceph-mon-a.rook-ceph.svc.cluster.local:6789",
                "rook-ceph-mon-b.rook-ceph.svc.cluster.local:3300"
            ]
        );
    }

    #[test]
    fn test_config_json_shape() {
        let info = ClusterInfo {
            cluster_id: "fsid-1".to_string(),
            monitors: vec!["mon:6789".to_string()],
            rbd: RbdClusterInfo {
                rados_namespace: "e2e".to_string(),
            },
            cephfs: CephFsClusterInfo::default(),
        };
        let cm = config_map("ceph-csi", &[info]).unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&cm.data.unwrap()[CONFIG_MAP_KEY]).unwrap();
        assert_eq!(json[0]["clusterID"], "fsid-1");
        assert_eq!(json[0]["monitors"][0], "mon:6789");
        assert_eq!(json[0]["rbd"]["radosNamespace"], "e2e");
        assert!(json[0]["cephFS"].get("subvolumeGroup").is_none());
    }

    #[test]
    fn test_cephfs_secret_uses_admin_keys() {
        let secret = user_secret(Plugin::CephFs, Role::Node, "ceph-csi", "AQD==");
        assert_eq!(secret.metadata.name.as_deref(), Some("cephcsi-cephfs-node"));
        let data = secret.string_data.unwrap();
        assert_eq!(data["adminID"], "cephcsi-cephfs-node");
        assert_eq!(data["adminKey"], "AQD==");
        assert!(!data.contains_key("userID"));
        assert!(!data.contains_key("encryptionPassphrase"));

        let secret = user_secret(Plugin::Rbd, Role::Node, "ceph-csi", "AQD==");
        let data = secret.string_data.unwrap();
        assert_eq!(data["userID"], "cephcsi-rbd-node");
        assert_eq!(data["encryptionPassphrase"], ENCRYPTION_PASSPHRASE);
    }

    #[test]
    fn test_storage_class_params() {
        let params = storage_class_params(Plugin::Rbd, "fsid-1", "ceph-csi");
        assert_eq!(params["pool"], "replicapool");
        assert_eq!(params["csi.storage.k8s.io/provisioner-secret-name"], "cephcsi-rbd-provisioner");
        assert_eq!(params["csi.storage.k8s.io/node-stage-secret-name"], "cephcsi-rbd-node");
        assert_eq!(params["csi.storage.k8s.io/controller-expand-secret-namespace"], "ceph-csi");

        let params = storage_class_params(Plugin::CephFs, "fsid-1", "ceph-csi");
        assert_eq!(params["fsName"], "myfs");
        assert!(!params.contains_key("pool"));
    }

    #[test]
    fn test_static_pv_points_at_image() {
        let image = BackendImage::new("replicapool", "rbd-1a2b-static").in_namespace("e2e");
        let pv = static_rbd_pv("rbd-1a2b-static", &image, "fsid-1", "4Gi", "ceph-csi");
        let spec = pv.spec.unwrap();
        assert_eq!(spec.persistent_volume_reclaim_policy.as_deref(), Some("Retain"));
        assert_eq!(spec.storage_class_name.as_deref(), Some(""));
        assert_eq!(spec.capacity.unwrap()["storage"].0, "4Gi");

        let csi = spec.csi.unwrap();
        assert_eq!(csi.driver, "rbd.csi.ceph.com");
        assert_eq!(csi.volume_handle, "rbd-1a2b-static");
        let attrs = csi.volume_attributes.unwrap();
        assert_eq!(attrs["staticVolume"], "true");
        assert_eq!(attrs["pool"], "replicapool");
        assert_eq!(attrs["radosNamespace"], "e2e");
        assert_eq!(attrs["clusterID"], "fsid-1");
        let secret = csi.node_stage_secret_ref.unwrap();
        assert_eq!(secret.name.as_deref(), Some("cephcsi-rbd-node"));
        assert_eq!(secret.namespace.as_deref(), Some("ceph-csi"));

        let plain = BackendImage::new("replicapool", "img");
        let pv = static_rbd_pv("img", &plain, "fsid-1", "4Gi", "ceph-csi");
        let attrs = pv.spec.unwrap().csi.unwrap().volume_attributes.unwrap();
        assert!(!attrs.contains_key("radosNamespace"));
    }

    #[tokio::test]
    async fn test_snapshot_class_parameters_merged() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(SNAPSHOT_CLASS_FILE),
            r#"
apiVersion: snapshot.storage.k8s.io/v1
kind: VolumeSnapshotClass
metadata:
  name: csi-rbdplugin-snapclass
driver: rbd.csi.ceph.com
parameters:
  clusterID: <cluster-id>
deletionPolicy: Delete
"#,
        )
        .unwrap();

        let loader = ManifestLoader::new("ceph-csi");
        let class = snapshot_class(Plugin::Rbd, &loader, dir.path(), "fsid-1").await.unwrap();

        assert_eq!(class.data["parameters"]["clusterID"], "fsid-1");
        assert_eq!(class.data["parameters"]["pool"], "replicapool");
        assert_eq!(
            class.data["parameters"]["csi.storage.k8s.io/snapshotter-secret-namespace"],
            "ceph-csi"
        );
        assert_eq!(class.data["deletionPolicy"], "Delete");
    }
}
