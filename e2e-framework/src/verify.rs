//! Cross-plane assertions: Kubernetes state against backend state
//!
//! Each check that reads an eventually-consistent surface returns a
//! [`Progress`] so it can run inside [`poll_until`]; the `wait_*` wrappers
//! do exactly that with a caller-chosen timeout.

use std::sync::LazyLock;
use std::time::Duration;

use k8s_openapi::api::core::v1::PersistentVolume;
use regex::Regex;
use sha2::{Digest, Sha512};
use tracing::{debug, info, instrument};

use crate::backend::{BackendExec, PodSelector};
use crate::ceph::{BackendImage, CephCli, ENCRYPTED_META_KEY, ENCRYPTED_META_VALUE, JournalKind};
use crate::error::{E2eError, Result};
use crate::poll::{PollSettings, Progress, poll_until};
use crate::quantity::{GIB, parse_df_size, round_up_gib};
use crate::resources::ResourceClient;

/// Trailing five dash-separated groups of a volume handle form the object id.
static HANDLE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\w+-?){5}$").expect("static volume handle pattern"));
const IMAGE_PREFIX: &str = "csi-vol-";
const SNAPSHOT_PREFIX: &str = "csi-snap-";
const KUBELET_METRICS_PORT: u16 = 10255;
const VOLUME_STATS_PREFIX: &str = "kubelet_volume_stats_";

/// CSI volume (or snapshot) handle and the object id embedded in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeHandle {
    pub handle: String,
    pub id: String,
}

impl VolumeHandle {
    pub fn parse(handle: &str) -> Result<Self> {
        let id = HANDLE_ID
            .find(handle)
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| E2eError::mismatch(format!("volume handle {:?} has no object id", handle)))?;
        Ok(Self {
            handle: handle.to_string(),
            id,
        })
    }

    /// Backend image (or subvolume) name of a volume.
    pub fn image_name(&self) -> String {
        format!("{}{}", IMAGE_PREFIX, self.id)
    }

    /// Backend image name of a snapshot.
    pub fn snapshot_name(&self) -> String {
        format!("{}{}", SNAPSHOT_PREFIX, self.id)
    }
}

/// Handle of a CSI persistent volume.
pub fn pv_volume_handle(pv: &PersistentVolume) -> Result<VolumeHandle> {
    let handle = pv
        .spec
        .as_ref()
        .and_then(|s| s.csi.as_ref())
        .map(|csi| csi.volume_handle.as_str())
        .ok_or_else(|| E2eError::mismatch("pv is not a CSI volume"))?;
    VolumeHandle::parse(handle)
}

/// Check that the volume's required node affinity pins exactly the
/// expected topology labels: one expression per key, matching value, no
/// other keys.
pub fn topology_matches_pv(pv: &PersistentVolume, expected: &[(&str, &str)]) -> Result<()> {
    let terms = pv
        .spec
        .as_ref()
        .and_then(|s| s.node_affinity.as_ref())
        .and_then(|a| a.required.as_ref())
        .map(|r| r.node_selector_terms.as_slice())
        .unwrap_or_default();
    let Some(term) = terms.first() else {
        return Err(E2eError::mismatch("found empty node selector terms in pv"));
    };

    let mut seen: Vec<&str> = Vec::new();
    for expr in term.match_expressions.iter().flatten() {
        let Some((_, want)) = expected.iter().find(|(key, _)| *key == expr.key) else {
            return Err(E2eError::mismatch(format!(
                "unexpected topology key {} in pv node affinity",
                expr.key
            )));
        };
        if seen.contains(&expr.key.as_str()) {
            return Err(E2eError::mismatch(format!(
                "multiple expressions for topology key {}",
                expr.key
            )));
        }
        seen.push(&expr.key);

        let value = expr.values.as_ref().and_then(|v| v.first());
        if value.map(String::as_str) != Some(*want) {
            return Err(E2eError::mismatch(format!(
                "topology key {} is {:?}, expected {}",
                expr.key, value, want
            )));
        }
    }

    if let Some((missing, _)) = expected.iter().find(|(key, _)| !seen.contains(key)) {
        return Err(E2eError::mismatch(format!(
            "topology key {} missing from pv node affinity",
            missing
        )));
    }
    Ok(())
}

/// First field of `sha512sum` output.
pub fn parse_checksum(command: &str, stdout: &str) -> Result<String> {
    stdout
        .split_whitespace()
        .next()
        .filter(|sum| sum.len() == 128)
        .map(str::to_string)
        .ok_or_else(|| E2eError::malformed(command, "no sha512 digest in output"))
}

/// Hex SHA-512 of `data`, comparable to `sha512sum` output.
pub fn sha512_hex(data: &[u8]) -> String {
    hex::encode(Sha512::digest(data))
}

/// Whether kubelet metrics text carries volume stats for a claim.
pub fn volume_stats_present(metrics: &str, namespace: &str, pvc: &str) -> bool {
    let ns = format!("namespace=\"{}\"", namespace);
    let claim = format!("persistentvolumeclaim=\"{}\"", pvc);
    metrics
        .lines()
        .filter(|line| line.starts_with(VOLUME_STATS_PREFIX))
        .any(|line| line.contains(&ns) && line.contains(&claim))
}

fn resize_command(path: &str, block: bool) -> String {
    if block {
        format!("blockdev --getsize64 {}", path)
    } else {
        format!("df -h | grep {} | awk '{{print $2}}'", path)
    }
}

/// Size reported by the resize check, in whole GiB (rounded up).
fn parse_reported_gib(command: &str, stdout: &str, block: bool) -> Result<u64> {
    let raw = stdout.trim();
    let bytes = if block {
        raw.parse::<u64>().ok()
    } else {
        parse_df_size(raw)
    };
    bytes
        .map(round_up_gib)
        .ok_or_else(|| E2eError::malformed(command, format!("unexpected size {:?}", raw)))
}

/// Assertions spanning the Kubernetes API and the storage backend.
#[derive(Clone)]
pub struct Verifier {
    resources: ResourceClient,
    ceph: CephCli,
    rados_namespace: String,
}

impl Verifier {
    pub fn new(resources: ResourceClient, exec: BackendExec, rados_namespace: impl Into<String>) -> Self {
        Self {
            resources,
            ceph: CephCli::new(exec),
            rados_namespace: rados_namespace.into(),
        }
    }

    pub fn ceph(&self) -> &CephCli {
        &self.ceph
    }

    fn exec(&self) -> &BackendExec {
        self.ceph.exec()
    }

    fn settings(&self, timeout: Duration) -> PollSettings {
        self.resources.poll_settings().with_timeout(timeout)
    }

    /// Backend image behind a bound claim, assuming it lives in `pool`.
    pub async fn image_for_pvc(&self, namespace: &str, pvc: &str, pool: &str) -> Result<BackendImage> {
        let pv = self.resources.bound_pv(namespace, pvc).await?;
        let handle = pv_volume_handle(&pv)?;
        Ok(BackendImage::new(pool, handle.image_name()).in_namespace(&self.rados_namespace))
    }

    /// Bound claim's image appears in the pool listing.
    #[instrument(skip(self))]
    pub async fn image_exists_in_pool(
        &self,
        namespace: &str,
        pvc: &str,
        pool: &str,
    ) -> Result<Progress<BackendImage>> {
        let image = self.image_for_pvc(namespace, pvc, pool).await?;
        let images = self.ceph.list_images(pool, &self.rados_namespace).await?;
        if images.contains(&image.name) {
            debug!(image = %image.spec(), "Found backing image");
            Ok(Progress::Done(image))
        } else {
            Ok(Progress::not_yet(format!(
                "{} not among {} images in {}",
                image.name,
                images.len(),
                pool
            )))
        }
    }

    pub async fn wait_image_in_pool(
        &self,
        namespace: &str,
        pvc: &str,
        pool: &str,
        timeout: Duration,
    ) -> Result<BackendImage> {
        let what = format!("image of {}/{} in {}", namespace, pvc, pool);
        poll_until(self.settings(timeout), &what, move || {
            self.image_exists_in_pool(namespace, pvc, pool)
        })
        .await
    }

    /// Pool holds exactly `expected` images.
    pub async fn image_count(&self, pool: &str, expected: usize) -> Result<Progress<()>> {
        let images = self.ceph.list_images(pool, &self.rados_namespace).await?;
        if images.len() == expected {
            Ok(Progress::Done(()))
        } else {
            Ok(Progress::not_yet(format!(
                "{} images in {}: {:?}",
                images.len(),
                pool,
                images
            )))
        }
    }

    pub async fn wait_image_count(&self, pool: &str, expected: usize, timeout: Duration) -> Result<()> {
        let what = format!("{} images in pool {}", expected, pool);
        poll_until(self.settings(timeout), &what, move || self.image_count(pool, expected)).await?;
        info!(pool, expected, "Backend image count matches");
        Ok(())
    }

    /// Backend image that backs a ready volume snapshot.
    pub async fn image_for_snapshot(&self, namespace: &str, snapshot: &str, pool: &str) -> Result<BackendImage> {
        let snap = self.resources.get_snapshot(namespace, snapshot).await?;
        let content_name = snap.content_name().ok_or_else(|| {
            E2eError::mismatch(format!("snapshot {}/{} has no bound content", namespace, snapshot))
        })?;
        let content = self.resources.get_snapshot_content(content_name).await?;
        let handle = content
            .status
            .as_ref()
            .and_then(|s| s.snapshot_handle.as_deref())
            .ok_or_else(|| E2eError::mismatch(format!("content {} has no snapshot handle", content_name)))?;
        let handle = VolumeHandle::parse(handle)?;
        Ok(BackendImage::new(pool, handle.snapshot_name()).in_namespace(&self.rados_namespace))
    }

    /// Backend snapshot `snap_name` exists on `image`.
    #[instrument(skip(self, image), fields(image = %image.spec()))]
    pub async fn snapshot_exists_for_image(&self, image: &BackendImage, snap_name: &str) -> Result<Progress<()>> {
        let snaps = self.ceph.list_image_snapshots(image).await?;
        if snaps.iter().any(|s| s.name == snap_name) {
            Ok(Progress::Done(()))
        } else {
            Ok(Progress::not_yet(format!(
                "{} snapshots on {}, none named {}",
                snaps.len(),
                image.spec(),
                snap_name
            )))
        }
    }

    pub async fn snapshot_count(&self, image: &BackendImage) -> Result<usize> {
        Ok(self.ceph.list_image_snapshots(image).await?.len())
    }

    /// Bound claim's volume carries the expected topology affinity.
    pub async fn topology_matches(&self, namespace: &str, pvc: &str, expected: &[(&str, &str)]) -> Result<()> {
        let pv = self.resources.bound_pv(namespace, pvc).await?;
        topology_matches_pv(&pv, expected)
    }

    /// SHA-512 of `path` inside a pod.
    pub async fn checksum(&self, pod: &PodSelector, path: &str) -> Result<String> {
        let cmd = format!("sha512sum {}", path);
        let out = self.exec().in_pod(pod, &cmd).await?.require_clean(&cmd)?;
        parse_checksum(&cmd, &out)
    }

    /// `path` inside a pod holds exactly `content`; returns its digest.
    pub async fn content_matches(&self, pod: &PodSelector, path: &str, content: &[u8]) -> Result<String> {
        let want = sha512_hex(content);
        let got = self.checksum(pod, path).await?;
        if got != want {
            return Err(E2eError::mismatch(format!(
                "checksum of {} in {} is {}, expected {}",
                path, pod, got, want
            )));
        }
        Ok(got)
    }

    /// `path` has identical content in both pods.
    #[instrument(skip(self))]
    pub async fn checksums_match(&self, source: &PodSelector, clone: &PodSelector, path: &str) -> Result<String> {
        let want = self.checksum(source, path).await?;
        let got = self.checksum(clone, path).await?;
        if want != got {
            return Err(E2eError::mismatch(format!(
                "checksum of {} differs: {} has {}, {} has {}",
                path, source, want, clone, got
            )));
        }
        Ok(got)
    }

    /// Mounted filesystem (or block device) reports at least `bytes`.
    pub async fn dir_size_at_least(
        &self,
        pod: &PodSelector,
        path: &str,
        bytes: u64,
        block: bool,
    ) -> Result<Progress<u64>> {
        let cmd = resize_command(path, block);
        let out = self.exec().in_pod(pod, &cmd).await?.require_clean(&cmd)?;
        let observed = parse_reported_gib(&cmd, &out, block)?;
        let wanted = round_up_gib(bytes);
        if observed >= wanted {
            Ok(Progress::Done(observed * GIB))
        } else {
            Ok(Progress::not_yet(format!(
                "{} reports {}Gi, want {}Gi",
                path, observed, wanted
            )))
        }
    }

    pub async fn wait_size_at_least(
        &self,
        pod: &PodSelector,
        path: &str,
        bytes: u64,
        block: bool,
        timeout: Duration,
    ) -> Result<u64> {
        let what = format!("{} at least {} bytes", path, bytes);
        poll_until(self.settings(timeout), &what, move || {
            self.dir_size_at_least(pod, path, bytes, block)
        })
        .await
    }

    /// Kubelet exposes volume stats for a claim.
    pub async fn metrics_present(&self, kubelet_ip: &str, namespace: &str, pvc: &str) -> Result<Progress<()>> {
        let cmd = format!(
            "curl --silent 'http://{}:{}/metrics'",
            kubelet_ip, KUBELET_METRICS_PORT
        );
        let out = match self.exec().in_toolbox(&cmd).await {
            Ok(out) if out.success => out.stdout,
            Ok(out) => return Ok(Progress::not_yet(format!("curl failed: {}", out.stderr.trim()))),
            Err(e) => return Ok(Progress::not_yet(format!("exec failed: {}", e))),
        };
        if volume_stats_present(&out, namespace, pvc) {
            Ok(Progress::Done(()))
        } else {
            Ok(Progress::not_yet(format!(
                "no volume stats for {}/{} on {}",
                namespace, pvc, kubelet_ip
            )))
        }
    }

    pub async fn wait_metrics_present(&self, namespace: &str, pvc: &str, timeout: Duration) -> Result<()> {
        let kubelet = self.resources.kubelet_ip().await?;
        let kubelet = kubelet.as_str();
        let what = format!("kubelet metrics for {}/{}", namespace, pvc);
        poll_until(self.settings(timeout), &what, move || {
            self.metrics_present(kubelet, namespace, pvc)
        })
        .await
    }

    /// Subvolume group holds exactly `expected` subvolumes.
    pub async fn subvolume_count(&self, filesystem: &str, group: &str, expected: usize) -> Result<Progress<()>> {
        let subvolumes = self.ceph.list_subvolumes(filesystem, group).await?;
        if subvolumes.len() == expected {
            Ok(Progress::Done(()))
        } else {
            Ok(Progress::not_yet(format!(
                "{} subvolumes in {}/{}",
                subvolumes.len(),
                filesystem,
                group
            )))
        }
    }

    pub async fn wait_subvolume_count(
        &self,
        filesystem: &str,
        group: &str,
        expected: usize,
        timeout: Duration,
    ) -> Result<()> {
        let what = format!("{} subvolumes in {}/{}", expected, filesystem, group);
        poll_until(self.settings(timeout), &what, move || {
            self.subvolume_count(filesystem, group, expected)
        })
        .await
    }

    /// Subvolume behind a bound CephFS claim.
    pub async fn subvolume_for_pvc(&self, namespace: &str, pvc: &str) -> Result<String> {
        let pv = self.resources.bound_pv(namespace, pvc).await?;
        Ok(pv_volume_handle(&pv)?.image_name())
    }

    pub async fn subvolume_snapshot_exists(
        &self,
        filesystem: &str,
        subvolume: &str,
        group: &str,
        snap_name: &str,
    ) -> Result<Progress<()>> {
        let snaps = self
            .ceph
            .list_subvolume_snapshots(filesystem, subvolume, group)
            .await?;
        if snaps.iter().any(|s| s == snap_name) {
            Ok(Progress::Done(()))
        } else {
            Ok(Progress::not_yet(format!(
                "{} snapshots on {}, none named {}",
                snaps.len(),
                subvolume,
                snap_name
            )))
        }
    }

    /// Image is flagged encrypted and its mount is a dm-crypt device.
    ///
    /// `node_plugin` selects the node-plugin container that sees the
    /// kubelet mount at `mount_path`.
    pub async fn image_encrypted(
        &self,
        image: &BackendImage,
        node_plugin: &PodSelector,
        mount_path: &str,
    ) -> Result<()> {
        let state = self.ceph.image_meta(image, ENCRYPTED_META_KEY).await?;
        if state.trim() != ENCRYPTED_META_VALUE {
            return Err(E2eError::mismatch(format!(
                "image {} encryption state is {:?}",
                image.spec(),
                state.trim()
            )));
        }
        let cmd = format!(
            "lsblk -o TYPE,MOUNTPOINT | grep '{}' | awk '{{print $1}}'",
            mount_path
        );
        let mount_type = self.exec().in_pod(node_plugin, &cmd).await?.require_clean(&cmd)?;
        if mount_type.trim() != "crypt" {
            return Err(E2eError::mismatch(format!(
                "mount {} is {:?}, expected crypt",
                mount_path,
                mount_type.trim()
            )));
        }
        Ok(())
    }

    /// No journal objects or directory keys remain for `kind` in `pool`.
    pub async fn journal_clean(&self, pool: &str, kind: JournalKind) -> Result<Progress<()>> {
        let (objects, keys) = self
            .ceph
            .journal_counts(pool, &self.rados_namespace, kind)
            .await?;
        if objects == 0 && keys == 0 {
            Ok(Progress::Done(()))
        } else {
            Ok(Progress::not_yet(format!(
                "{} journal objects and {} keys left in {}",
                objects, keys, pool
            )))
        }
    }

    pub async fn wait_journal_clean(&self, pool: &str, kind: JournalKind, timeout: Duration) -> Result<()> {
        let what = format!("{:?} journal of {} empty", kind, pool);
        poll_until(self.settings(timeout), &what, move || self.journal_clean(pool, kind)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        CSIPersistentVolumeSource, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
        PersistentVolumeSpec, VolumeNodeAffinity,
    };

    const HANDLE: &str = "0001-0024-fed5480a-f00f-417a-a51d-31d8a8144c03-0000000000000002-ee2a0bcd-b6ab-11ec-87a5-0242ac110003";

    fn pv_with_affinity(exprs: Vec<(&str, &str)>) -> PersistentVolume {
        PersistentVolume {
            spec: Some(PersistentVolumeSpec {
                csi: Some(CSIPersistentVolumeSource {
                    driver: "rbd.csi.ceph.com".into(),
                    volume_handle: HANDLE.into(),
                    ..Default::default()
                }),
                node_affinity: Some(VolumeNodeAffinity {
                    required: Some(NodeSelector {
                        node_selector_terms: vec![NodeSelectorTerm {
                            match_expressions: Some(
                                exprs
                                    .into_iter()
                                    .map(|(k, v)| NodeSelectorRequirement {
                                        key: k.into(),
                                        operator: "In".into(),
                                        values: Some(vec![v.into()]),
                                    })
                                    .collect(),
                            ),
                            match_fields: None,
                        }],
                    }),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    const REGION: &str = "topology.rbd.csi.ceph.com/region";
    const ZONE: &str = "topology.rbd.csi.ceph.com/zone";

    #[test]
    fn test_volume_handle_id() {
        let handle = VolumeHandle::parse(HANDLE).unwrap();
        assert_eq!(handle.id, "ee2a0bcd-b6ab-11ec-87a5-0242ac110003");
        assert_eq!(handle.image_name(), "csi-vol-ee2a0bcd-b6ab-11ec-87a5-0242ac110003");
        assert_eq!(handle.snapshot_name(), "csi-snap-ee2a0bcd-b6ab-11ec-87a5-0242ac110003");
    }

    #[test]
    fn test_volume_handle_parse_repeated() {
        let ids: Vec<String> = (0..3)
            .map(|n| VolumeHandle::parse(&format!("0001-0009-rook-ceph-{:016x}-ee2a0bcd-b6ab-11ec-87a5-0242ac11000{}", n, n)))
            .map(|h| h.unwrap().id)
            .collect();
        assert_eq!(ids[0], "ee2a0bcd-b6ab-11ec-87a5-0242ac110000");
        assert_eq!(ids[2], "ee2a0bcd-b6ab-11ec-87a5-0242ac110002");
    }

    #[test]
    fn test_volume_handle_without_id() {
        assert!(VolumeHandle::parse("").is_err());
    }

    #[test]
    fn test_pv_volume_handle() {
        let pv = pv_with_affinity(vec![]);
        assert_eq!(pv_volume_handle(&pv).unwrap().handle, HANDLE);
        assert!(pv_volume_handle(&PersistentVolume::default()).is_err());
    }

    #[test]
    fn test_topology_matches() {
        let pv = pv_with_affinity(vec![(REGION, "testregion"), (ZONE, "testzone")]);
        let expected = [(REGION, "testregion"), (ZONE, "testzone")];
        topology_matches_pv(&pv, &expected).unwrap();
    }

    #[test]
    fn test_topology_rejects_duplicate_key() {
        let pv = pv_with_affinity(vec![(REGION, "testregion"), (REGION, "testregion")]);
        let err = topology_matches_pv(&pv, &[(REGION, "testregion")]).unwrap_err();
        assert!(err.to_string().contains("multiple"));
    }

    #[test]
    fn test_topology_rejects_unknown_key() {
        let pv = pv_with_affinity(vec![(REGION, "testregion"), ("other/key", "x")]);
        let err = topology_matches_pv(&pv, &[(REGION, "testregion")]).unwrap_err();
        assert!(err.to_string().contains("unexpected"));
    }

    #[test]
    fn test_topology_rejects_wrong_value_and_missing_key() {
        let pv = pv_with_affinity(vec![(REGION, "otherregion")]);
        assert!(topology_matches_pv(&pv, &[(REGION, "testregion")]).is_err());

        let pv = pv_with_affinity(vec![(REGION, "testregion")]);
        let err = topology_matches_pv(&pv, &[(REGION, "testregion"), (ZONE, "testzone")]).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_topology_rejects_empty_terms() {
        let err = topology_matches_pv(&PersistentVolume::default(), &[]).unwrap_err();
        assert_eq!(err.kind().to_string(), "ClusterMismatch");
    }

    #[test]
    fn test_sha512_hex_matches_sha512sum() {
        assert_eq!(
            sha512_hex(b"hello\n"),
            "e7c22b994c59d9cf2b48e549b1e24666636045930d3da7c1acb299d1c3b7f931\
             f94aae41edda2c2b207a36e10f8bcb8d45223e54878f5b316e7ce3b6bc019629"
        );
    }

    #[test]
    fn test_parse_checksum() {
        let digest = sha512_hex(b"hello\n");
        let out = format!("{}  /var/lib/www/html/test\n", digest);
        assert_eq!(parse_checksum("sha512sum x", &out).unwrap(), digest);
        assert!(parse_checksum("sha512sum x", "").is_err());
        assert!(parse_checksum("sha512sum x", "abc  file").is_err());
    }

    #[test]
    fn test_volume_stats_present() {
        let metrics = "\
# HELP kubelet_volume_stats_used_bytes Number of used bytes in the volume
kubelet_volume_stats_used_bytes{namespace=\"e2e\",persistentvolumeclaim=\"rbd-pvc\"} 1.2e+06
kubelet_running_pods{namespace=\"e2e\",persistentvolumeclaim=\"other\"} 3
";
        assert!(volume_stats_present(metrics, "e2e", "rbd-pvc"));
        assert!(!volume_stats_present(metrics, "e2e", "other"));
        assert!(!volume_stats_present(metrics, "default", "rbd-pvc"));
    }

    #[test]
    fn test_reported_size_parsing() {
        let fs = resize_command("/var/lib/www/html", false);
        assert_eq!(fs, "df -h | grep /var/lib/www/html | awk '{print $2}'");
        assert_eq!(parse_reported_gib(&fs, "4.9G\n", false).unwrap(), 5);

        let blk = resize_command("/dev/xvda", true);
        assert_eq!(parse_reported_gib(&blk, "5368709120\n", true).unwrap(), 5);
        assert!(parse_reported_gib(&blk, "garbage", true).is_err());
    }
}
