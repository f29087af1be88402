//! Ceph and RBD command helpers run through the toolbox pod

use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, instrument};

use crate::backend::BackendExec;
use crate::error::{E2eError, Result};

/// Image metadata key set by the driver on encrypted images.
pub const ENCRYPTED_META_KEY: &str = "rbd.csi.ceph.com/encrypted";
/// Value of [`ENCRYPTED_META_KEY`] once the image is formatted.
pub const ENCRYPTED_META_VALUE: &str = "encrypted";

/// Backend image (or subvolume) backing a volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendImage {
    pub pool: String,
    pub name: String,
    pub rados_namespace: Option<String>,
}

impl BackendImage {
    pub fn new(pool: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            name: name.into(),
            rados_namespace: None,
        }
    }

    pub fn in_namespace(mut self, rados_namespace: &str) -> Self {
        if !rados_namespace.is_empty() {
            self.rados_namespace = Some(rados_namespace.to_string());
        }
        self
    }

    /// `pool[/namespace]/image`
    pub fn spec(&self) -> String {
        image_spec(
            &self.pool,
            self.rados_namespace.as_deref().unwrap_or(""),
            &self.name,
        )
    }
}

/// `pool[/namespace]/image`
pub fn image_spec(pool: &str, rados_namespace: &str, image: &str) -> String {
    if rados_namespace.is_empty() {
        format!("{}/{}", pool, image)
    } else {
        format!("{}/{}/{}", pool, rados_namespace, image)
    }
}

/// `--pool=P [--namespace=N]`, accepted by both `rbd` and `rados`.
pub fn pool_options(pool: &str, rados_namespace: &str) -> String {
    if rados_namespace.is_empty() {
        format!("--pool={}", pool)
    } else {
        format!("--pool={} --namespace={}", pool, rados_namespace)
    }
}

fn parse_json<T: DeserializeOwned>(command: &str, stdout: &str) -> Result<T> {
    serde_json::from_str(stdout.trim()).map_err(|e| {
        E2eError::malformed(command, format!("{} (raw output: {:?})", e, stdout.trim()))
    })
}

fn parse_count(command: &str, stdout: &str) -> Result<usize> {
    stdout
        .trim()
        .parse()
        .map_err(|e| E2eError::malformed(command, format!("expected a count: {}", e)))
}

#[derive(Debug, Clone, Deserialize)]
pub struct RbdSnapshot {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RbdImageInfo {
    pub name: String,
    pub size: u64,
    #[serde(default)]
    pub object_size: u64,
    #[serde(default)]
    pub data_pool: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct NamedEntry {
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CephFilesystem {
    pub name: String,
    pub metadata_pool: String,
    #[serde(default)]
    pub data_pools: Vec<String>,
}

/// Journal objects kept by the driver in a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalKind {
    Volume,
    Snapshot,
}

impl JournalKind {
    fn object_prefix(self) -> &'static str {
        match self {
            JournalKind::Volume => "csi.volume.",
            JournalKind::Snapshot => "csi.snap.",
        }
    }

    fn directory(self) -> &'static str {
        match self {
            JournalKind::Volume => "csi.volumes.default",
            JournalKind::Snapshot => "csi.snaps.default",
        }
    }
}

/// Typed wrapper over the `ceph`, `rbd` and `rados` CLIs in the toolbox.
#[derive(Clone)]
pub struct CephCli {
    exec: BackendExec,
}

impl CephCli {
    pub fn new(exec: BackendExec) -> Self {
        Self { exec }
    }

    pub fn exec(&self) -> &BackendExec {
        &self.exec
    }

    /// Names of all images in a pool.
    #[instrument(skip(self))]
    pub async fn list_images(&self, pool: &str, rados_namespace: &str) -> Result<Vec<String>> {
        let cmd = format!("rbd ls --format=json {}", pool_options(pool, rados_namespace));
        let out = self.exec.toolbox_clean(&cmd).await?;
        // `rbd ls` prints nothing at all for an empty pool on some releases
        if out.trim().is_empty() {
            return Ok(Vec::new());
        }
        parse_json(&cmd, &out)
    }

    #[instrument(skip(self))]
    pub async fn list_image_snapshots(&self, image: &BackendImage) -> Result<Vec<RbdSnapshot>> {
        let cmd = format!("rbd snap ls {} --format=json", image.spec());
        let out = self.exec.toolbox_clean(&cmd).await?;
        parse_json(&cmd, &out)
    }

    #[instrument(skip(self))]
    pub async fn image_info(&self, image: &BackendImage) -> Result<RbdImageInfo> {
        let cmd = format!("rbd info {} --format=json", image.spec());
        let out = self.exec.toolbox_clean(&cmd).await?;
        parse_json(&cmd, &out)
    }

    /// Create an image of `size_mib` with only the layering feature.
    #[instrument(skip(self))]
    pub async fn create_image(&self, image: &BackendImage, size_mib: u64) -> Result<()> {
        let cmd = format!(
            "rbd create {} --size={} --image-feature=layering",
            image.spec(),
            size_mib
        );
        self.exec.toolbox_clean(&cmd).await?;
        info!(image = %image.spec(), size_mib, "Image created");
        Ok(())
    }

    /// `rbd rm` reports progress on stderr, so only the exit status counts.
    #[instrument(skip(self))]
    pub async fn remove_image(&self, image: &BackendImage) -> Result<()> {
        self.exec
            .toolbox_ceph(&format!("rbd rm {}", image.spec()))
            .await?;
        info!(image = %image.spec(), "Image removed");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn image_meta(&self, image: &BackendImage, key: &str) -> Result<String> {
        let cmd = format!("rbd image-meta get {} {}", image.spec(), key);
        let out = self.exec.toolbox_clean(&cmd).await?;
        Ok(out.trim().to_string())
    }

    #[instrument(skip(self))]
    pub async fn list_subvolumes(&self, filesystem: &str, group: &str) -> Result<Vec<String>> {
        let cmd = format!(
            "ceph fs subvolume ls {} --group_name={} --format=json",
            filesystem, group
        );
        let out = self.exec.toolbox_clean(&cmd).await?;
        let entries: Vec<NamedEntry> = parse_json(&cmd, &out)?;
        Ok(entries.into_iter().map(|e| e.name).collect())
    }

    #[instrument(skip(self))]
    pub async fn list_subvolume_snapshots(
        &self,
        filesystem: &str,
        subvolume: &str,
        group: &str,
    ) -> Result<Vec<String>> {
        let cmd = format!(
            "ceph fs subvolume snapshot ls {} {} --group_name={} --format=json",
            filesystem, subvolume, group
        );
        let out = self.exec.toolbox_clean(&cmd).await?;
        let entries: Vec<NamedEntry> = parse_json(&cmd, &out)?;
        Ok(entries.into_iter().map(|e| e.name).collect())
    }

    pub async fn list_filesystems(&self) -> Result<Vec<CephFilesystem>> {
        let cmd = "ceph fs ls --format=json";
        let out = self.exec.toolbox_ceph(cmd).await?;
        parse_json(cmd, &out)
    }

    /// Cluster fsid, used as the driver's cluster ID.
    pub async fn fsid(&self) -> Result<String> {
        let cmd = "ceph fsid";
        let fsid = self.exec.toolbox_ceph(cmd).await?.trim().to_string();
        if fsid.is_empty() {
            return Err(E2eError::malformed(cmd, "empty fsid"));
        }
        Ok(fsid)
    }

    /// Create a replicated pool of size 1.
    #[instrument(skip(self))]
    pub async fn create_pool(&self, name: &str) -> Result<()> {
        info!(pool = %name, "Creating pool");
        self.exec
            .toolbox_ceph(&format!("ceph osd pool create {} 128", name))
            .await?;
        self.exec
            .toolbox_ceph(&format!(
                "ceph osd pool set {} size 1 --yes-i-really-mean-it",
                name
            ))
            .await?;
        self.exec
            .toolbox_ceph(&format!("rbd pool init {}", name))
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn delete_pool(&self, name: &str) -> Result<()> {
        info!(pool = %name, "Deleting pool");
        self.exec
            .toolbox_ceph(&format!(
                "ceph osd pool delete {} {} --yes-i-really-really-mean-it",
                name, name
            ))
            .await?;
        Ok(())
    }

    /// Create a RADOS namespace in `pool` unless it already exists.
    #[instrument(skip(self))]
    pub async fn ensure_rados_namespace(&self, pool: &str, rados_namespace: &str) -> Result<()> {
        if rados_namespace.is_empty() {
            return Ok(());
        }
        let listed = self
            .exec
            .toolbox_clean(&format!("rbd namespace ls --pool={}", pool))
            .await?;
        if listed.lines().any(|l| l.trim() == rados_namespace) {
            debug!(pool, rados_namespace, "RADOS namespace already present");
            return Ok(());
        }
        self.exec
            .toolbox_clean(&format!(
                "rbd namespace create {}",
                pool_options(pool, rados_namespace)
            ))
            .await?;
        Ok(())
    }

    /// Create (or fetch) a cephx user and return its key.
    #[instrument(skip(self, caps))]
    pub async fn get_or_create_user_key(&self, user: &str, caps: &str) -> Result<String> {
        let cmd = format!("ceph auth get-or-create-key client.{} {}", user, caps);
        let key = self.exec.toolbox_ceph(&cmd).await?.trim().to_string();
        if key.is_empty() {
            return Err(E2eError::malformed(cmd, "empty key"));
        }
        Ok(key)
    }

    #[instrument(skip(self))]
    pub async fn delete_user(&self, user: &str) -> Result<()> {
        self.exec
            .toolbox_ceph(&format!("ceph auth del client.{}", user))
            .await?;
        Ok(())
    }

    /// Count journal objects and directory keys for `kind` in a pool.
    ///
    /// Returns `(objects, keys)`; both are zero once every volume (or
    /// snapshot) has been cleaned up.
    #[instrument(skip(self))]
    pub async fn journal_counts(
        &self,
        pool: &str,
        rados_namespace: &str,
        kind: JournalKind,
    ) -> Result<(usize, usize)> {
        let opts = pool_options(pool, rados_namespace);
        let objects_cmd = format!(
            "rados ls {} | grep -v default | grep -c ^{} || true",
            opts,
            kind.object_prefix()
        );
        let keys_cmd = format!("rados listomapkeys {} {} | wc -l", kind.directory(), opts);

        let objects = parse_count(&objects_cmd, &self.exec.toolbox_ceph(&objects_cmd).await?)?;
        let keys = parse_count(&keys_cmd, &self.exec.toolbox_ceph(&keys_cmd).await?)?;
        Ok((objects, keys))
    }
}
