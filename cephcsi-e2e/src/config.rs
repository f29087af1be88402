//! Command-line flags and the validated run configuration

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};
use e2e_framework::{E2eError, Result, Timeouts};

use crate::plugin::Plugin;

/// CLI arguments for the e2e harness
#[derive(Parser, Debug, Clone)]
#[command(name = "cephcsi-e2e")]
#[command(about = "End-to-end tests for the Ceph CSI drivers on a live cluster")]
pub struct Args {
    /// Namespace the CSI drivers are deployed into
    #[arg(long, env = "CEPHCSI_NAMESPACE", default_value = "default")]
    pub cephcsi_namespace: String,

    /// Namespace of the Rook operator and toolbox pod
    #[arg(long, env = "ROOK_NAMESPACE", default_value = "rook-ceph")]
    pub rook_namespace: String,

    /// Run the RBD suites
    #[arg(long, default_value = "true", action = ArgAction::Set)]
    pub test_rbd: bool,

    /// Run the CephFS suites
    #[arg(long, default_value = "true", action = ArgAction::Set)]
    pub test_cephfs: bool,

    /// Deploy the RBD driver before testing (otherwise it must already run)
    #[arg(long, default_value = "true", action = ArgAction::Set)]
    pub deploy_rbd: bool,

    /// Deploy the CephFS driver before testing
    #[arg(long, default_value = "true", action = ArgAction::Set)]
    pub deploy_cephfs: bool,

    /// Deadline for deployments, binding and deletions, in minutes
    #[arg(long, default_value = "10")]
    pub deploy_timeout: u64,

    /// Interval between readiness checks, in seconds
    #[arg(long, default_value = "2")]
    pub poll_interval: u64,

    /// Budget for one scenario's setup and steps, in minutes
    #[arg(long, default_value = "30")]
    pub scenario_timeout: u64,

    /// Test upgrading from an older release instead of the regular suites
    #[arg(long, default_value = "false", action = ArgAction::Set)]
    pub upgrade_testing: bool,

    /// Release tag to upgrade from
    #[arg(long, env = "UPGRADE_VERSION", default_value = "v3.5.1")]
    pub upgrade_version: String,

    /// Repository the old release is cloned from
    #[arg(long, default_value = "https://github.com/ceph/ceph-csi")]
    pub upgrade_repo: String,

    /// RADOS namespace for RBD images (empty for none)
    #[arg(long, default_value = "")]
    pub rados_namespace: String,

    #[arg(long, default_value = "../deploy/rbd/kubernetes")]
    pub rbd_deploy_dir: PathBuf,

    #[arg(long, default_value = "../deploy/cephfs/kubernetes")]
    pub cephfs_deploy_dir: PathBuf,

    #[arg(long, default_value = "../examples/rbd")]
    pub rbd_examples_dir: PathBuf,

    #[arg(long, default_value = "../examples/cephfs")]
    pub cephfs_examples_dir: PathBuf,

    /// Restrict the run to these suites (repeatable)
    #[arg(long = "suite", value_enum)]
    pub suites: Vec<Plugin>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Prometheus metrics HTTP address (e.g., 0.0.0.0:9095)
    /// If not set, metrics endpoint is disabled
    #[arg(long, env = "E2E_METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,
}

/// Manifest and fixture trees of one driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestDirs {
    pub deploy: PathBuf,
    pub examples: PathBuf,
}

/// Per-plugin switches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginConfig {
    pub test: bool,
    pub deploy: bool,
    pub dirs: ManifestDirs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeConfig {
    pub version: String,
    pub repo: String,
}

/// Validated configuration of a run.
#[derive(Debug, Clone)]
pub struct E2eConfig {
    pub cephcsi_namespace: String,
    pub rook_namespace: String,
    pub rados_namespace: String,
    pub rbd: PluginConfig,
    pub cephfs: PluginConfig,
    pub timeouts: Timeouts,
    pub scenario_timeout: Duration,
    /// Set when this is an upgrade run.
    pub upgrade: Option<UpgradeConfig>,
    pub suites: Vec<Plugin>,
}

/// `minutes` as a duration; flag values past `u64::MAX` seconds are rejected.
fn minutes(flag: &str, minutes: u64) -> Result<Duration> {
    minutes
        .checked_mul(60)
        .map(Duration::from_secs)
        .ok_or_else(|| E2eError::Config(format!("--{} of {} minutes is out of range", flag, minutes)))
}

impl Args {
    pub fn into_config(self) -> Result<E2eConfig> {
        let upgrade = self.upgrade_testing.then(|| UpgradeConfig {
            version: self.upgrade_version.trim().to_string(),
            repo: self.upgrade_repo.clone(),
        });
        let config = E2eConfig {
            cephcsi_namespace: self.cephcsi_namespace,
            rook_namespace: self.rook_namespace,
            rados_namespace: self.rados_namespace,
            rbd: PluginConfig {
                test: self.test_rbd,
                deploy: self.deploy_rbd,
                dirs: ManifestDirs {
                    deploy: self.rbd_deploy_dir,
                    examples: self.rbd_examples_dir,
                },
            },
            cephfs: PluginConfig {
                test: self.test_cephfs,
                deploy: self.deploy_cephfs,
                dirs: ManifestDirs {
                    deploy: self.cephfs_deploy_dir,
                    examples: self.cephfs_examples_dir,
                },
            },
            timeouts: Timeouts {
                poll_interval: Duration::from_secs(self.poll_interval),
                deploy: minutes("deploy-timeout", self.deploy_timeout)?,
            },
            scenario_timeout: minutes("scenario-timeout", self.scenario_timeout)?,
            upgrade,
            suites: self.suites,
        };
        config.validate()?;
        Ok(config)
    }
}

impl E2eConfig {
    pub fn plugin(&self, plugin: Plugin) -> &PluginConfig {
        match plugin {
            Plugin::Rbd => &self.rbd,
            Plugin::CephFs => &self.cephfs,
        }
    }

    /// Whether `plugin`'s suites run: its test flag is set and, when
    /// `--suite` was given, it was named.
    pub fn enabled(&self, plugin: Plugin) -> bool {
        self.plugin(plugin).test && (self.suites.is_empty() || self.suites.contains(&plugin))
    }

    /// Plugins to run, in suite order.
    pub fn enabled_plugins(&self) -> Vec<Plugin> {
        Plugin::ALL
            .into_iter()
            .filter(|p| self.enabled(*p))
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.enabled_plugins().is_empty() {
            return Err(E2eError::Config(
                "no plugin enabled; set --test-rbd or --test-cephfs".to_string(),
            ));
        }
        if self.timeouts.poll_interval.is_zero() {
            return Err(E2eError::Config("--poll-interval must be positive".to_string()));
        }
        if self.timeouts.deploy.is_zero() {
            return Err(E2eError::Config("--deploy-timeout must be positive".to_string()));
        }
        if let Some(upgrade) = &self.upgrade {
            if upgrade.version.is_empty() {
                return Err(E2eError::Config(
                    "--upgrade-testing needs --upgrade-version".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["cephcsi-e2e"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]).into_config().unwrap();
        assert_eq!(config.cephcsi_namespace, "default");
        assert_eq!(config.rook_namespace, "rook-ceph");
        assert_eq!(config.timeouts.deploy, Duration::from_secs(600));
        assert_eq!(config.timeouts.poll_interval, Duration::from_secs(2));
        assert_eq!(config.scenario_timeout, Duration::from_secs(1800));
        assert!(config.upgrade.is_none());
        assert_eq!(config.enabled_plugins(), vec![Plugin::Rbd, Plugin::CephFs]);
        assert_eq!(config.rbd.dirs.deploy, PathBuf::from("../deploy/rbd/kubernetes"));
    }

    #[test]
    fn test_suite_filter() {
        let config = parse(&["--suite", "cephfs"]).into_config().unwrap();
        assert_eq!(config.enabled_plugins(), vec![Plugin::CephFs]);

        let config = parse(&["--suite", "rbd", "--test-rbd", "false", "--suite", "cephfs"])
            .into_config()
            .unwrap();
        assert_eq!(config.enabled_plugins(), vec![Plugin::CephFs]);
    }

    #[test]
    fn test_no_plugin_rejected() {
        let err = parse(&["--test-rbd", "false", "--test-cephfs", "false"])
            .into_config()
            .unwrap_err();
        assert!(matches!(err, E2eError::Config(_)));
    }

    #[test]
    fn test_huge_timeouts_rejected() {
        let huge = u64::MAX.to_string();
        let err = parse(&["--deploy-timeout", &huge]).into_config().unwrap_err();
        assert!(matches!(err, E2eError::Config(_)));
        assert!(err.to_string().contains("deploy-timeout"));

        let err = parse(&["--scenario-timeout", &huge]).into_config().unwrap_err();
        assert!(err.to_string().contains("scenario-timeout"));

        let largest = (u64::MAX / 60).to_string();
        let config = parse(&["--deploy-timeout", &largest]).into_config().unwrap();
        assert_eq!(config.timeouts.deploy, Duration::from_secs(u64::MAX / 60 * 60));
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let err = parse(&["--poll-interval", "0"]).into_config().unwrap_err();
        assert!(err.to_string().contains("poll-interval"));
    }

    #[test]
    fn test_upgrade_needs_version() {
        let err = parse(&["--upgrade-testing", "true", "--upgrade-version", " "])
            .into_config()
            .unwrap_err();
        assert!(err.to_string().contains("upgrade-version"));

        let config = parse(&["--upgrade-testing", "true"]).into_config().unwrap();
        assert_eq!(config.upgrade.unwrap().version, "v3.5.1");
    }
}
