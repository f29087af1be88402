//! Names, files and Ceph capabilities of the two CSI drivers

use std::fmt;

use clap::ValueEnum;
use e2e_framework::{DeployStage, PodSelector};

// ============================================================================
// Backend layout created by Rook
// ============================================================================

pub const RBD_POOL: &str = "replicapool";
/// Pool created for topology-constrained provisioning.
pub const RBD_TOPOLOGY_POOL: &str = "newrbdpool";
pub const CEPHFS_NAME: &str = "myfs";
pub const CEPHFS_DATA_POOL: &str = "myfs-replicated";
pub const SUBVOLUME_GROUP: &str = "csi";

// ============================================================================
// Topology
// ============================================================================

pub const NODE_REGION_LABEL: &str = "test.failure-domain/region";
pub const NODE_ZONE_LABEL: &str = "test.failure-domain/zone";
pub const REGION_VALUE: &str = "testregion";
pub const ZONE_VALUE: &str = "testzone";

/// Which CSI driver a suite exercises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum Plugin {
    #[value(name = "rbd")]
    Rbd,
    #[value(name = "cephfs")]
    CephFs,
}

/// One deploy manifest of a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManifestFile {
    pub stage: DeployStage,
    pub file: &'static str,
    /// Older releases ship without some files.
    pub required: bool,
}

const fn manifest(stage: DeployStage, file: &'static str, required: bool) -> ManifestFile {
    ManifestFile { stage, file, required }
}

const RBD_MANIFESTS: [ManifestFile; 7] = [
    manifest(DeployStage::Rbac, "csidriver.yaml", false),
    manifest(DeployStage::Rbac, "csi-provisioner-rbac.yaml", true),
    manifest(DeployStage::Rbac, "csi-nodeplugin-rbac.yaml", true),
    manifest(DeployStage::PodSecurity, "csi-provisioner-psp.yaml", false),
    manifest(DeployStage::PodSecurity, "csi-nodeplugin-psp.yaml", false),
    manifest(DeployStage::Provisioner, "csi-rbdplugin-provisioner.yaml", true),
    manifest(DeployStage::NodePlugin, "csi-rbdplugin.yaml", true),
];

const CEPHFS_MANIFESTS: [ManifestFile; 7] = [
    manifest(DeployStage::Rbac, "csidriver.yaml", false),
    manifest(DeployStage::Rbac, "csi-provisioner-rbac.yaml", true),
    manifest(DeployStage::Rbac, "csi-nodeplugin-rbac.yaml", true),
    manifest(DeployStage::PodSecurity, "csi-provisioner-psp.yaml", false),
    manifest(DeployStage::PodSecurity, "csi-nodeplugin-psp.yaml", false),
    manifest(DeployStage::Provisioner, "csi-cephfsplugin-provisioner.yaml", true),
    manifest(DeployStage::NodePlugin, "csi-cephfsplugin.yaml", true),
];

/// Credentials a driver component uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Provisioner,
    Node,
}

impl Plugin {
    pub const ALL: [Plugin; 2] = [Plugin::Rbd, Plugin::CephFs];

    pub fn name(self) -> &'static str {
        match self {
            Plugin::Rbd => "rbd",
            Plugin::CephFs => "cephfs",
        }
    }

    /// CSI driver name, also the topology key prefix.
    pub fn driver_name(self) -> &'static str {
        match self {
            Plugin::Rbd => "rbd.csi.ceph.com",
            Plugin::CephFs => "cephfs.csi.ceph.com",
        }
    }

    pub fn manifests(self) -> &'static [ManifestFile] {
        match self {
            Plugin::Rbd => &RBD_MANIFESTS,
            Plugin::CephFs => &CEPHFS_MANIFESTS,
        }
    }

    /// Provisioner Deployment name (also its `app` label).
    pub fn provisioner(self) -> &'static str {
        match self {
            Plugin::Rbd => "csi-rbdplugin-provisioner",
            Plugin::CephFs => "csi-cephfsplugin-provisioner",
        }
    }

    /// Node plugin DaemonSet name (also its `app` label).
    pub fn node_plugin(self) -> &'static str {
        match self {
            Plugin::Rbd => "csi-rbdplugin",
            Plugin::CephFs => "csi-cephfsplugin",
        }
    }

    /// Driver container in both the provisioner and node plugin pods.
    pub fn container(self) -> &'static str {
        self.node_plugin()
    }

    pub fn provisioner_selector(self, namespace: &str) -> PodSelector {
        PodSelector::new(namespace, format!("app={}", self.provisioner())).container(self.container())
    }

    pub fn node_plugin_selector(self, namespace: &str) -> PodSelector {
        PodSelector::new(namespace, format!("app={}", self.node_plugin())).container(self.container())
    }

    /// Ceph user of `role`; the matching secret has the same name.
    pub fn user(self, role: Role) -> &'static str {
        match (self, role) {
            (Plugin::Rbd, Role::Provisioner) => "cephcsi-rbd-provisioner",
            (Plugin::Rbd, Role::Node) => "cephcsi-rbd-node",
            (Plugin::CephFs, Role::Provisioner) => "cephcsi-cephfs-provisioner",
            (Plugin::CephFs, Role::Node) => "cephcsi-cephfs-node",
        }
    }

    /// `ceph auth` caps of `role`. RBD users are confined to the RADOS
    /// namespace when one is configured.
    pub fn caps(self, role: Role, rados_namespace: &str) -> String {
        match self {
            Plugin::Rbd => {
                let osd = if rados_namespace.is_empty() {
                    "osd 'profile rbd'".to_string()
                } else {
                    format!("osd 'profile rbd pool={} namespace={}'", RBD_POOL, rados_namespace)
                };
                format!("mon 'profile rbd' mgr 'allow rw' {}", osd)
            }
            Plugin::CephFs => match role {
                Role::Provisioner => {
                    "mon 'allow r' mgr 'allow rw' osd 'allow rw tag cephfs metadata=*'".to_string()
                }
                Role::Node => {
                    "mon 'allow r' mgr 'allow rw' osd 'allow rw tag cephfs *=*' mds 'allow rw'".to_string()
                }
            },
        }
    }

    /// Secret keys holding the user id and key.
    pub fn secret_keys(self) -> (&'static str, &'static str) {
        match self {
            Plugin::Rbd => ("userID", "userKey"),
            Plugin::CephFs => ("adminID", "adminKey"),
        }
    }

    /// Node-plugin topology labels as `(pv affinity key, value)`.
    pub fn topology(self) -> [(String, &'static str); 2] {
        [
            (format!("topology.{}/region", self.driver_name()), REGION_VALUE),
            (format!("topology.{}/zone", self.driver_name()), ZONE_VALUE),
        ]
    }
}

impl fmt::Display for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rbd_caps_with_rados_namespace() {
        assert_eq!(
            Plugin::Rbd.caps(Role::Node, ""),
            "mon 'profile rbd' mgr 'allow rw' osd 'profile rbd'"
        );
        assert_eq!(
            Plugin::Rbd.caps(Role::Provisioner, "e2e"),
            "mon 'profile rbd' mgr 'allow rw' osd 'profile rbd pool=replicapool namespace=e2e'"
        );
    }

    #[test]
    fn test_cephfs_node_caps_include_mds() {
        assert!(Plugin::CephFs.caps(Role::Node, "").ends_with("mds 'allow rw'"));
        assert!(!Plugin::CephFs.caps(Role::Provisioner, "").contains("mds"));
    }

    #[test]
    fn test_selectors() {
        let sel = Plugin::Rbd.node_plugin_selector("ceph-csi");
        assert_eq!(sel.label_selector, "app=csi-rbdplugin");
        assert_eq!(sel.container.as_deref(), Some("csi-rbdplugin"));
        let sel = Plugin::CephFs.provisioner_selector("ceph-csi");
        assert_eq!(sel.label_selector, "app=csi-cephfsplugin-provisioner");
        assert_eq!(sel.container.as_deref(), Some("csi-cephfsplugin"));
    }

    #[test]
    fn test_manifests_cover_workloads() {
        for plugin in Plugin::ALL {
            let required: Vec<_> = plugin
                .manifests()
                .iter()
                .filter(|m| m.required)
                .map(|m| m.stage)
                .collect();
            assert!(required.contains(&DeployStage::Provisioner));
            assert!(required.contains(&DeployStage::NodePlugin));
        }
    }

    #[test]
    fn test_topology_keys() {
        let [(region, rv), (zone, zv)] = Plugin::Rbd.topology();
        assert_eq!(region, "topology.rbd.csi.ceph.com/region");
        assert_eq!(rv, "testregion");
        assert_eq!(zone, "topology.rbd.csi.ceph.com/zone");
        assert_eq!(zv, "testzone");
    }
}
