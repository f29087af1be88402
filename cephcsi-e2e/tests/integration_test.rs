//! Integration tests for cephcsi-e2e
//!
//! Nothing here talks to a cluster. The Kubernetes client points at an
//! unreachable address and backend commands go to a scripted executor, so
//! the tests cover configuration, fixtures, suite registration and the
//! failure paths that stop before any API call.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};

use cephcsi_e2e::config::{Args, E2eConfig, ManifestDirs};
use cephcsi_e2e::fixtures::{self, ClusterInfo, DriverInputs};
use cephcsi_e2e::plugin::Plugin;
use cephcsi_e2e::suites::{
    self,
    common::{BatchFixture, BatchHandler, Driver, PluginScope, PvcApp, Release},
};
use e2e_framework::backend::{ExecOutput, PodExecutor, PodSelector};
use e2e_framework::deployer::DeployStage;
use e2e_framework::dispatch::{Operation, TaskHandler, TaskSpec};
use e2e_framework::error::{E2eError, ErrorKind, Result};
use e2e_framework::manifest::{ManifestLoader, to_typed};
use e2e_framework::runner::{Runner, Suite};
use e2e_framework::scenario::{ScenarioScope, ScenarioState};
use e2e_framework::{Cluster, ResourceClient, Timeouts};

/// Fails every command with stderr, counting calls.
#[derive(Default)]
struct RejectingExecutor {
    calls: Arc<AtomicU32>,
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl PodExecutor for RejectingExecutor {
    async fn exec(&self, target: &PodSelector, command: &str) -> Result<ExecOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(format!("{} {}", target, command));
        Ok(ExecOutput {
            stdout: String::new(),
            stderr: "Error initializing cluster client: ObjectNotFound".to_string(),
            success: false,
        })
    }
}

fn config(extra: &[&str]) -> E2eConfig {
    let mut argv = vec!["cephcsi-e2e"];
    argv.extend_from_slice(extra);
    Args::try_parse_from(argv).unwrap().into_config().unwrap()
}

fn offline_client() -> kube::Client {
    let config = kube::Config::new("http://127.0.0.1:9".parse().unwrap());
    kube::Client::try_from(config).unwrap()
}

fn offline_cluster(executor: Arc<RejectingExecutor>) -> Cluster {
    Cluster::new(
        offline_client(),
        executor,
        "rook-ceph",
        "ceph-csi",
        "",
        Timeouts {
            poll_interval: Duration::from_millis(10),
            deploy: Duration::from_millis(100),
        },
    )
}

// ============================================================================
// Suite registration
// ============================================================================

#[tokio::test]
async fn test_regular_run_registers_both_plugins() {
    let cluster = offline_cluster(Arc::new(RejectingExecutor::default()));
    let mut runner = Runner::new();
    suites::register(&mut runner, &config(&[]), &cluster);
    assert_eq!(runner.suite_names(), vec!["rbd", "cephfs"]);
}

#[tokio::test]
async fn test_upgrade_run_registers_upgrade_suites() {
    let cluster = offline_cluster(Arc::new(RejectingExecutor::default()));
    let config = config(&["--upgrade-testing", "true", "--suite", "rbd"]);
    let suites = suites::suites(&config, &cluster);
    assert_eq!(suites.len(), 1);
    assert_eq!(suites[0].name(), "rbd-upgrade");
    assert_eq!(suites[0].len(), 1);
}

#[test]
fn test_scenarios_follow_run_mode() {
    let regular = suites::plugin_scenarios(&config(&[]), Plugin::Rbd);
    assert!(regular.len() > 1);
    assert!(regular.iter().all(|s| s.id().suite == "rbd"));
    assert!(regular.iter().any(|s| s.id().name.contains("topology")));

    let upgrade = suites::plugin_scenarios(&config(&["--upgrade-testing", "true"]), Plugin::CephFs);
    assert_eq!(upgrade.len(), 1);
    assert_eq!(upgrade[0].id().to_string(), "cephfs-upgrade/upgrade with existing volumes");
}

// ============================================================================
// Driver setup failures
// ============================================================================

#[tokio::test]
async fn test_prepare_fails_on_backend_error_before_any_deploy() {
    let executor = Arc::new(RejectingExecutor::default());
    let cluster = offline_cluster(executor.clone());
    let config = config(&["--suite", "cephfs"]);
    let driver = Driver::new(Plugin::CephFs, cluster, config.cephfs.clone());
    let scope = PluginScope::new(driver, Release::Current);

    let err = scope.prepare().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BackendError);
    assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    let seen = executor.seen.lock().unwrap();
    assert!(seen[0].starts_with("rook-ceph/app=rook-ceph-tools"));
    assert!(seen[0].ends_with("ceph fsid"));
    drop(seen);

    // Nothing was installed, so nothing needs removing
    assert!(scope.release().await.is_empty());
    assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_suite_setup_failure_skips_scenarios_and_fails_run() {
    let executor = Arc::new(RejectingExecutor::default());
    let cluster = offline_cluster(executor.clone());
    let config = config(&["--suite", "rbd"]);
    let driver = Driver::new(Plugin::Rbd, cluster, config.rbd.clone());
    let suite = Suite::new("rbd", PluginScope::new(driver, Release::Current))
        .scenario(suites::rbd::scenarios(true).remove(0));

    let mut runner = Runner::new();
    runner.add(suite);
    let report = runner.run().await;

    assert_eq!(report.count(ScenarioState::Failed), 1);
    assert_eq!(report.count(ScenarioState::Skipped), 1);
    assert_eq!(report.exit_code(), 1);
    assert!(report.render().contains("FAILED rbd/suite setup"));
}

// ============================================================================
// Batch handler
// ============================================================================

fn app() -> PvcApp {
    let pvc: PersistentVolumeClaim = serde_json::from_value(serde_json::json!({
        "apiVersion": "v1",
        "kind": "PersistentVolumeClaim",
        "metadata": {"name": "rbd-pvc", "namespace": "rbd-0a1b2c3d"},
        "spec": {
            "accessModes": ["ReadWriteOnce"],
            "resources": {"requests": {"storage": "1Gi"}},
            "storageClassName": "csi-rbd-sc"
        }
    }))
    .unwrap();
    let pod: Pod = serde_json::from_value(serde_json::json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {"name": "csi-rbd-demo-pod", "namespace": "rbd-0a1b2c3d"},
        "spec": {
            "containers": [{"name": "web-server", "image": "nginx"}],
            "volumes": [{"name": "mypvc", "persistentVolumeClaim": {"claimName": "rbd-pvc"}}]
        }
    }))
    .unwrap();
    PvcApp::new(pvc, pod)
}

fn task(operation: Operation, fixture: BatchFixture) -> TaskSpec<BatchFixture> {
    TaskSpec {
        id: 0,
        name: "rbd-0a1b2c3d0".to_string(),
        operation,
        fixture,
    }
}

#[tokio::test]
async fn test_batch_handler_rejects_unknown_operation() {
    let resources = ResourceClient::new(offline_client(), Timeouts::default().poll());
    let handler = BatchHandler::new(resources, Duration::from_millis(100));
    let fixture = BatchFixture {
        app: app(),
        snapshot: None,
        indexed_source: false,
    };

    let err = handler
        .handle(task(Operation::parse("resizePVC"), fixture.clone()))
        .await
        .unwrap_err();
    assert!(matches!(err, E2eError::UnknownOperation(ref op) if op == "resizePVC"));

    let err = handler
        .handle(task(Operation::CreateSnapshot, fixture))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

#[test]
fn test_task_copies_are_independent() {
    let fixture = BatchFixture {
        app: app(),
        snapshot: None,
        indexed_source: false,
    };
    let first = fixture.app.clone().named("rbd-0a1b2c3d0");
    let second = fixture.app.clone().named("rbd-0a1b2c3d1");
    assert_eq!(first.pvc_name(), "rbd-0a1b2c3d0");
    assert_eq!(second.pvc_name(), "rbd-0a1b2c3d1");
    assert_eq!(fixture.app.pvc_name(), "rbd-pvc");
}

// ============================================================================
// Deploy plan
// ============================================================================

const PROVISIONER: &str = r#"
kind: Deployment
apiVersion: apps/v1
metadata:
  name: csi-rbdplugin-provisioner
  namespace: default
spec:
  replicas: 3
  selector:
    matchLabels:
      app: csi-rbdplugin-provisioner
  template:
    metadata:
      labels:
        app: csi-rbdplugin-provisioner
    spec:
      containers:
        - name: csi-provisioner
          image: registry.k8s.io/sig-storage/csi-provisioner:v3.1.0
          args:
            - "--csi-address=$(ADDRESS)"
            - "--feature-gates=Topology=false"
        - name: csi-rbdplugin
          image: quay.io/cephcsi/cephcsi:canary
          args:
            - "--type=rbd"
            - "--controllerserver=true"
"#;

const NODE_PLUGIN: &str = r#"
kind: DaemonSet
apiVersion: apps/v1
metadata:
  name: csi-rbdplugin
  namespace: default
spec:
  selector:
    matchLabels:
      app: csi-rbdplugin
  template:
    metadata:
      labels:
        app: csi-rbdplugin
    spec:
      containers:
        - name: csi-rbdplugin
          image: quay.io/cephcsi/cephcsi:canary
          args:
            - "--type=rbd"
            - "--nodeserver=true"
"#;

const RBAC: &str = r#"
apiVersion: v1
kind: ServiceAccount
metadata:
  name: rbd-csi-provisioner
  namespace: default
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRole
metadata:
  name: rbd-external-provisioner-runner
rules: []
"#;

const SNAPSHOT_CLASS: &str = r#"
apiVersion: snapshot.storage.k8s.io/v1
kind: VolumeSnapshotClass
metadata:
  name: csi-rbdplugin-snapclass
driver: rbd.csi.ceph.com
parameters:
  clusterID: <cluster-id>
deletionPolicy: Delete
"#;

fn write_tree(root: &Path) -> ManifestDirs {
    let dirs = ManifestDirs {
        deploy: root.join("deploy"),
        examples: root.join("examples"),
    };
    std::fs::create_dir_all(&dirs.deploy).unwrap();
    std::fs::create_dir_all(&dirs.examples).unwrap();
    std::fs::write(dirs.deploy.join("csi-provisioner-rbac.yaml"), RBAC).unwrap();
    std::fs::write(dirs.deploy.join("csi-nodeplugin-rbac.yaml"), RBAC).unwrap();
    std::fs::write(dirs.deploy.join("csi-rbdplugin-provisioner.yaml"), PROVISIONER).unwrap();
    std::fs::write(dirs.deploy.join("csi-rbdplugin.yaml"), NODE_PLUGIN).unwrap();
    std::fs::write(dirs.examples.join("snapshotclass.yaml"), SNAPSHOT_CLASS).unwrap();
    dirs
}

fn inputs() -> DriverInputs {
    DriverInputs {
        cluster: ClusterInfo {
            cluster_id: "fed5480a-f00f-417a-a51d-31d8a8144c03".to_string(),
            monitors: vec!["rook-ceph-mon-a.rook-ceph.svc.cluster.local:6789".to_string()],
            ..Default::default()
        },
        provisioner_key: "AQBprovisioner==".to_string(),
        node_key: "AQBnode==".to_string(),
        topology: true,
    }
}

#[tokio::test]
async fn test_deploy_plan_from_release_tree() {
    let tmp = tempfile::tempdir().unwrap();
    let dirs = write_tree(tmp.path());
    let loader = ManifestLoader::new("ceph-csi");

    let plan = fixtures::deploy_plan(Plugin::Rbd, &loader, &dirs, &inputs())
        .await
        .unwrap();
    assert_eq!(plan.namespace(), "ceph-csi");

    // Optional csidriver and psp files are absent and skipped
    let stages: Vec<DeployStage> = plan.creation_order().iter().map(|i| i.stage).collect();
    assert_eq!(
        stages,
        vec![
            DeployStage::Rbac,
            DeployStage::Rbac,
            DeployStage::ConfigMap,
            DeployStage::Secrets,
            DeployStage::Provisioner,
            DeployStage::NodePlugin,
            DeployStage::SnapshotClass,
        ]
    );

    let order = plan.creation_order();
    let provisioner = order
        .iter()
        .find(|i| i.stage == DeployStage::Provisioner)
        .unwrap();
    let deployment: Deployment = to_typed(&provisioner.objects[0]).unwrap();
    assert_eq!(deployment.metadata.namespace.as_deref(), Some("ceph-csi"));
    assert_eq!(deployment.spec.as_ref().unwrap().replicas, Some(1));
    let args = deployment.spec.unwrap().template.spec.unwrap().containers[0]
        .args
        .clone()
        .unwrap();
    assert!(args.contains(&"--feature-gates=Topology=true".to_string()));

    let node = order
        .iter()
        .find(|i| i.stage == DeployStage::NodePlugin)
        .unwrap();
    let daemonset: DaemonSet = to_typed(&node.objects[0]).unwrap();
    let args = daemonset.spec.unwrap().template.spec.unwrap().containers[0]
        .args
        .clone()
        .unwrap();
    assert!(
        args.iter()
            .any(|a| a.contains("test.failure-domain/region,test.failure-domain/zone"))
    );

    let snapshot_class = &order
        .iter()
        .find(|i| i.stage == DeployStage::SnapshotClass)
        .unwrap()
        .objects[0];
    assert_eq!(
        snapshot_class.data["parameters"]["clusterID"],
        "fed5480a-f00f-417a-a51d-31d8a8144c03"
    );
    assert_eq!(snapshot_class.data["parameters"]["pool"], "replicapool");
}

#[tokio::test]
async fn test_workload_subset_keeps_config_in_place() {
    let tmp = tempfile::tempdir().unwrap();
    let dirs = write_tree(tmp.path());
    let loader = ManifestLoader::new("ceph-csi");
    let plan = fixtures::deploy_plan(Plugin::Rbd, &loader, &dirs, &inputs())
        .await
        .unwrap();

    let workloads = plan.subset(&[
        DeployStage::Rbac,
        DeployStage::PodSecurity,
        DeployStage::Provisioner,
        DeployStage::NodePlugin,
    ]);
    assert!(!workloads.owns_namespace());
    assert!(
        workloads
            .creation_order()
            .iter()
            .all(|i| !matches!(i.stage, DeployStage::ConfigMap | DeployStage::Secrets))
    );
}

#[tokio::test]
async fn test_missing_required_manifest_is_reported() {
    let tmp = tempfile::tempdir().unwrap();
    let dirs = write_tree(tmp.path());
    std::fs::remove_file(dirs.deploy.join("csi-rbdplugin.yaml")).unwrap();
    let loader = ManifestLoader::new("ceph-csi");

    let err = fixtures::deploy_plan(Plugin::Rbd, &loader, &dirs, &inputs())
        .await
        .unwrap_err();
    assert!(matches!(err, E2eError::Manifest { ref path, .. } if path.ends_with("csi-rbdplugin.yaml")));
}

// ============================================================================
// Driver users on partial setup
// ============================================================================

/// Answers commands by prefix; unmatched commands fail with stderr.
#[derive(Default)]
struct ScriptedExecutor {
    replies: Vec<(&'static str, ExecOutput)>,
    seen: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    fn reply(mut self, prefix: &'static str, stdout: &str, stderr: &str) -> Self {
        self.replies.push((
            prefix,
            ExecOutput {
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
                success: stderr.is_empty(),
            },
        ));
        self
    }

    fn deleted_users(&self) -> Vec<String> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter_map(|cmd| cmd.strip_prefix("ceph auth del client."))
            .map(str::to_string)
            .collect()
    }
}

#[async_trait]
impl PodExecutor for ScriptedExecutor {
    async fn exec(&self, _target: &PodSelector, command: &str) -> Result<ExecOutput> {
        self.seen.lock().unwrap().push(command.to_string());
        Ok(self
            .replies
            .iter()
            .find(|(prefix, _)| command.starts_with(prefix))
            .map(|(_, out)| out.clone())
            .unwrap_or_else(|| ExecOutput {
                stdout: String::new(),
                stderr: format!("unexpected command: {}", command),
                success: false,
            }))
    }
}

fn api_response(status: http::StatusCode, body: serde_json::Value) -> http::Response<kube::client::Body> {
    http::Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(kube::client::Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

/// API server that lists one monitor service and refuses everything else.
fn monitors_only_client() -> kube::Client {
    let service = tower::service_fn(|req: http::Request<kube::client::Body>| async move {
        let resp = if req.uri().path() == "/api/v1/namespaces/rook-ceph/services" {
            api_response(
                http::StatusCode::OK,
                serde_json::json!({
                    "apiVersion": "v1",
                    "kind": "ServiceList",
                    "metadata": {},
                    "items": [{
                        "metadata": {"name": "rook-ceph-mon-a", "namespace": "rook-ceph"},
                        "spec": {"ports": [{"port": 6789}]}
                    }]
                }),
            )
        } else {
            api_response(
                http::StatusCode::FORBIDDEN,
                serde_json::json!({
                    "apiVersion": "v1",
                    "kind": "Status",
                    "metadata": {},
                    "status": "Failure",
                    "message": "nodes is forbidden",
                    "reason": "Forbidden",
                    "code": 403
                }),
            )
        };
        Ok::<_, std::convert::Infallible>(resp)
    });
    kube::Client::new(service, "default")
}

fn rbd_driver(executor: Arc<ScriptedExecutor>) -> Driver {
    let cluster = Cluster::new(
        monitors_only_client(),
        executor,
        "rook-ceph",
        "ceph-csi",
        "",
        Timeouts {
            poll_interval: Duration::from_millis(10),
            deploy: Duration::from_millis(100),
        },
    );
    Driver::new(Plugin::Rbd, cluster, config(&[]).rbd)
}

#[tokio::test]
async fn test_node_user_failure_removes_provisioner_user() {
    let executor = Arc::new(
        ScriptedExecutor::default()
            .reply("ceph fsid", "7d8b4b3c-fsid\n", "")
            .reply("ceph auth get-or-create-key client.cephcsi-rbd-provisioner", "AQBprov==\n", "")
            .reply("ceph auth get-or-create-key client.cephcsi-rbd-node", "", "Error EINVAL: bad caps")
            .reply("ceph auth del", "", ""),
    );
    let driver = rbd_driver(executor.clone());

    let err = driver.install(driver.current_dirs()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BackendError);
    assert_eq!(executor.deleted_users(), vec!["cephcsi-rbd-provisioner"]);

    // No inputs were kept, so uninstall has no users left to remove
    assert!(driver.uninstall().await.is_empty());
    assert_eq!(executor.deleted_users().len(), 1);
}

#[tokio::test]
async fn test_label_failure_still_removes_users_on_uninstall() {
    let executor = Arc::new(
        ScriptedExecutor::default()
            .reply("ceph fsid", "7d8b4b3c-fsid\n", "")
            .reply("ceph auth get-or-create-key", "AQBkey==\n", "")
            .reply("ceph auth del", "", ""),
    );
    let driver = rbd_driver(executor.clone());

    let err = driver.install(driver.current_dirs()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Api);
    assert!(executor.deleted_users().is_empty());

    assert!(driver.uninstall().await.is_empty());
    assert_eq!(
        executor.deleted_users(),
        vec!["cephcsi-rbd-provisioner", "cephcsi-rbd-node"]
    );
}
