//! Checkout of an older ceph-csi release for upgrade testing

use std::path::{Path, PathBuf};
use std::process::Stdio;

use e2e_framework::{E2eError, Result};
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{info, instrument};

use crate::config::{ManifestDirs, UpgradeConfig};
use crate::plugin::Plugin;

/// Shallow clone of one release; removed when dropped.
#[derive(Debug)]
pub struct ReleaseCheckout {
    version: String,
    dir: TempDir,
}

/// Arguments of the clone command for `version` of `repo` into `target`.
pub fn clone_args(repo: &str, version: &str, target: &Path) -> Vec<String> {
    vec![
        "clone".to_string(),
        "--depth".to_string(),
        "1".to_string(),
        "--branch".to_string(),
        version.to_string(),
        repo.to_string(),
        target.display().to_string(),
    ]
}

/// Deploy and example trees of `plugin` below a ceph-csi checkout root.
pub fn plugin_dirs(root: &Path, plugin: Plugin) -> ManifestDirs {
    ManifestDirs {
        deploy: root.join("deploy").join(plugin.name()).join("kubernetes"),
        examples: root.join("examples").join(plugin.name()),
    }
}

impl ReleaseCheckout {
    /// Clone `upgrade.version` of `upgrade.repo` with git.
    #[instrument(skip(upgrade), fields(version = %upgrade.version))]
    pub async fn fetch(upgrade: &UpgradeConfig) -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("ceph-csi-").tempdir()?;
        let target = dir.path().join("ceph-csi");
        let args = clone_args(&upgrade.repo, &upgrade.version, &target);
        let command = format!("git {}", args.join(" "));

        let output = Command::new("git")
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            return Err(E2eError::Backend {
                command,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        info!(path = %target.display(), "Release checked out");
        Ok(Self {
            version: upgrade.version.clone(),
            dir,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn root(&self) -> PathBuf {
        self.dir.path().join("ceph-csi")
    }

    pub fn dirs(&self, plugin: Plugin) -> ManifestDirs {
        plugin_dirs(&self.root(), plugin)
    }
}
