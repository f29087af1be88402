//! Driver lifecycle, the per-scenario context and the PVC/pod helpers
//! shared by every suite

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use e2e_framework::ceph::BackendImage;
use e2e_framework::dispatch::wait_for_all;
use e2e_framework::manifest::{
    bind_claim, device_path, mount_path, set_data_source_name, set_labels, set_name,
    set_snapshot_source, set_storage_class_name, set_storage_class_params, set_storage_request,
    set_volume_binding_mode,
};
use e2e_framework::resources::ignore_not_found;
use e2e_framework::scenario::ScenarioId;
use e2e_framework::snapshot::VolumeSnapshot;
use e2e_framework::{
    CleanupLedger, Cluster, ClusterContext, DeployPlan, DeployStage, Dispatcher, E2eError,
    Operation, PodSelector, ResourceClient, Result, ScenarioScope, TaskHandler, TaskSpec, Verifier,
};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::StorageClass;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::{ManifestDirs, PluginConfig, UpgradeConfig};
use crate::fetch::ReleaseCheckout;
use crate::fixtures::{self, ClusterInfo, DriverInputs, MON_SERVICE_SELECTOR};
use crate::plugin::{
    NODE_REGION_LABEL, NODE_ZONE_LABEL, Plugin, RBD_POOL, REGION_VALUE, Role, SUBVOLUME_GROUP,
    ZONE_VALUE,
};

/// Stages replaced when the driver is upgraded in place.
const WORKLOAD_STAGES: [DeployStage; 4] = [
    DeployStage::Rbac,
    DeployStage::PodSecurity,
    DeployStage::Provisioner,
    DeployStage::NodePlugin,
];

/// Stages still applied when the driver itself is deployed externally.
const SUPPORT_STAGES: [DeployStage; 3] = [
    DeployStage::ConfigMap,
    DeployStage::Secrets,
    DeployStage::SnapshotClass,
];

// ============================================================================
// Driver
// ============================================================================

#[derive(Default)]
struct DriverState {
    plan: Option<DeployPlan>,
    inputs: Option<DriverInputs>,
    storage_class: Option<StorageClass>,
}

/// One CSI driver on the cluster and the suite-wide objects around it.
pub struct Driver {
    plugin: Plugin,
    cluster: Cluster,
    config: PluginConfig,
    topology: bool,
    /// Records suite-wide objects (the default storage class).
    suite: ResourceClient,
    state: Mutex<DriverState>,
}

impl Driver {
    pub fn new(plugin: Plugin, cluster: Cluster, config: PluginConfig) -> Self {
        let suite = cluster.resources().with_ledger(Arc::new(CleanupLedger::new()));
        Self {
            plugin,
            topology: plugin == Plugin::Rbd,
            cluster,
            config,
            suite,
            state: Mutex::new(DriverState::default()),
        }
    }

    pub fn plugin(&self) -> Plugin {
        self.plugin
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    /// Manifests of the tree under test.
    pub fn current_dirs(&self) -> &ManifestDirs {
        &self.config.dirs
    }

    pub fn examples(&self) -> &Path {
        &self.config.dirs.examples
    }

    /// RADOS namespace images are created in (RBD only).
    pub fn rados_namespace(&self) -> &str {
        match self.plugin {
            Plugin::Rbd => self.cluster.rados_namespace(),
            Plugin::CephFs => "",
        }
    }

    fn timeout(&self) -> Duration {
        self.cluster.timeouts().deploy
    }

    /// Read cluster id and monitors, and make sure both users exist.
    #[instrument(skip(self), fields(plugin = %self.plugin))]
    async fn read_inputs(&self) -> Result<DriverInputs> {
        let ceph = self.cluster.ceph();
        let cluster_id = ceph.fsid().await?;

        let rook_namespace = self.cluster.exec().toolbox_selector().namespace.clone();
        let services = self.suite.list_services(&rook_namespace, MON_SERVICE_SELECTOR).await?;
        let monitors = fixtures::monitor_addresses(&services);
        if monitors.is_empty() {
            return Err(E2eError::mismatch(format!(
                "no services labelled {} in {}",
                MON_SERVICE_SELECTOR, rook_namespace
            )));
        }

        let rados = self.rados_namespace();
        let provisioner_key = ceph
            .get_or_create_user_key(
                self.plugin.user(Role::Provisioner),
                &self.plugin.caps(Role::Provisioner, rados),
            )
            .await?;
        let node_key = match ceph
            .get_or_create_user_key(self.plugin.user(Role::Node), &self.plugin.caps(Role::Node, rados))
            .await
        {
            Ok(key) => key,
            Err(e) => {
                if self.config.deploy {
                    let user = self.plugin.user(Role::Provisioner);
                    if let Err(del) = ceph.delete_user(user).await {
                        warn!(user, error = %del, "Deleting user failed");
                    }
                }
                return Err(e);
            }
        };

        let mut cluster = ClusterInfo {
            cluster_id,
            monitors,
            ..Default::default()
        };
        match self.plugin {
            Plugin::Rbd => cluster.rbd.rados_namespace = rados.to_string(),
            Plugin::CephFs => cluster.cephfs.subvolume_group = SUBVOLUME_GROUP.to_string(),
        }
        info!(cluster_id = %cluster.cluster_id, monitors = cluster.monitors.len(), "Cluster inputs read");
        Ok(DriverInputs {
            cluster,
            provisioner_key,
            node_key,
            topology: self.topology,
        })
    }

    /// Deploy the driver from `dirs` and create the default storage class.
    #[instrument(skip(self, dirs), fields(plugin = %self.plugin, deploy = %dirs.deploy.display()))]
    pub async fn install(&self, dirs: &ManifestDirs) -> Result<()> {
        let mut state = self.state.lock().await;
        let inputs = match &state.inputs {
            Some(inputs) => inputs.clone(),
            None => {
                let inputs = self.read_inputs().await?;
                // Users exist from here on, so uninstall must see them
                state.inputs = Some(inputs.clone());
                if inputs.topology && self.config.deploy {
                    // Node plugins read the domain labels at startup
                    for (key, value) in [(NODE_REGION_LABEL, REGION_VALUE), (NODE_ZONE_LABEL, ZONE_VALUE)] {
                        self.suite.label_all_nodes(key, value).await?;
                    }
                }
                inputs
            }
        };
        if !self.rados_namespace().is_empty() {
            self.cluster
                .ceph()
                .ensure_rados_namespace(RBD_POOL, self.rados_namespace())
                .await?;
        }

        let plan = fixtures::deploy_plan(self.plugin, &self.cluster.manifests(), dirs, &inputs).await?;
        let plan = if self.config.deploy {
            plan
        } else {
            debug!("Driver deployed externally, applying config only");
            plan.subset(&SUPPORT_STAGES)
        };
        // Recorded first so a partial deploy is still torn down
        state.plan = Some(plan.clone());
        self.cluster.deployer().deploy(&plan, self.timeout()).await?;

        if state.storage_class.is_none() {
            let sc = fixtures::storage_class(
                self.plugin,
                &self.cluster.manifests(),
                self.examples(),
                &inputs.cluster.cluster_id,
            )
            .await?;
            let name = sc.metadata.name.clone().unwrap_or_default();
            ignore_not_found(self.suite.delete_storage_class(&name).await)?;
            self.suite.create_storage_class(&sc).await?;
            state.storage_class = Some(sc);
        }
        info!("Driver installed");
        Ok(())
    }

    /// Replace the running driver workloads with the current tree's,
    /// keeping config, secrets and existing volumes.
    #[instrument(skip(self), fields(plugin = %self.plugin))]
    pub async fn upgrade(&self) -> Result<()> {
        let old = self.state.lock().await.plan.take();
        if let Some(old) = old {
            let errors = self
                .cluster
                .deployer()
                .teardown(&old.subset(&WORKLOAD_STAGES), self.timeout())
                .await;
            if !errors.is_empty() {
                self.state.lock().await.plan = Some(old);
                return Err(E2eError::Teardown(errors));
            }
            info!(from = %old.name(), "Previous driver removed");
        }
        self.install(&self.config.dirs).await
    }

    /// Remove the storage class, the driver and its users.
    #[instrument(skip(self), fields(plugin = %self.plugin))]
    pub async fn uninstall(&self) -> Vec<E2eError> {
        let mut state = self.state.lock().await;
        let mut errors = self.suite.teardown_recorded(self.timeout()).await;
        state.storage_class = None;

        if let Some(plan) = state.plan.take() {
            errors.extend(self.cluster.deployer().teardown(&plan, self.timeout()).await);
        }
        if state.inputs.take().is_some() && self.config.deploy {
            let ceph = self.cluster.ceph();
            for role in [Role::Provisioner, Role::Node] {
                if let Err(e) = ceph.delete_user(self.plugin.user(role)).await {
                    warn!(user = self.plugin.user(role), error = %e, "Deleting user failed");
                    errors.push(e);
                }
            }
        }
        if errors.is_empty() {
            info!("Driver removed");
        }
        errors
    }

    /// The default storage class created by `install`.
    pub async fn storage_class(&self) -> Result<StorageClass> {
        self.state
            .lock()
            .await
            .storage_class
            .clone()
            .ok_or_else(|| E2eError::InvalidObject(format!("{} driver is not installed", self.plugin)))
    }

    pub async fn cluster_id(&self) -> Result<String> {
        self.state
            .lock()
            .await
            .inputs
            .as_ref()
            .map(|i| i.cluster.cluster_id.clone())
            .ok_or_else(|| E2eError::InvalidObject(format!("{} driver is not installed", self.plugin)))
    }
}

// ============================================================================
// Scope
// ============================================================================

/// Which release a suite deploys before its scenarios.
#[derive(Debug, Clone)]
pub enum Release {
    Current,
    Previous(UpgradeConfig),
}

/// Deploys one driver for a suite and hands every scenario its own
/// namespace.
pub struct PluginScope {
    driver: Arc<Driver>,
    release: Release,
    checkout: Mutex<Option<ReleaseCheckout>>,
}

impl PluginScope {
    pub fn new(driver: Driver, release: Release) -> Self {
        Self {
            driver: Arc::new(driver),
            release,
            checkout: Mutex::new(None),
        }
    }

    pub fn driver(&self) -> &Arc<Driver> {
        &self.driver
    }
}

#[async_trait]
impl ScenarioScope for PluginScope {
    type Context = TestContext;

    async fn prepare(&self) -> Result<()> {
        match &self.release {
            Release::Current => self.driver.install(self.driver.current_dirs()).await,
            Release::Previous(upgrade) => {
                let checkout = ReleaseCheckout::fetch(upgrade).await?;
                info!(version = checkout.version(), "Installing previous release");
                let result = self.driver.install(&checkout.dirs(self.driver.plugin())).await;
                *self.checkout.lock().await = Some(checkout);
                result
            }
        }
    }

    async fn release(&self) -> Vec<E2eError> {
        let errors = self.driver.uninstall().await;
        self.checkout.lock().await.take();
        errors
    }

    async fn enter(&self, id: &ScenarioId) -> Result<TestContext> {
        let cx = self
            .driver
            .cluster()
            .scenario_context(self.driver.plugin().name())
            .await?;
        debug!(scenario = %id, namespace = cx.namespace(), "Scenario context ready");
        Ok(TestContext::new(cx, self.driver.clone()))
    }

    async fn leave(&self, ctx: &mut TestContext) -> Vec<E2eError> {
        ctx.cx.cleanup().await
    }

    async fn diagnose(&self, ctx: &mut TestContext) -> Vec<String> {
        let plugin = self.driver.plugin();
        let namespace = ctx.cx.driver_namespace().to_string();
        let sources = [
            (plugin.provisioner_selector(&namespace), plugin.container()),
            (plugin.node_plugin_selector(&namespace), plugin.container()),
        ];
        ctx.cx.diagnostics(&sources).await
    }
}

// ============================================================================
// Scenario context
// ============================================================================

fn missing(what: &str) -> E2eError {
    E2eError::InvalidObject(format!("no {} recorded by an earlier step", what))
}

/// State a scenario's steps share.
pub struct TestContext {
    pub cx: ClusterContext,
    driver: Arc<Driver>,
    /// Primary claim and pod.
    pub app: Option<PvcApp>,
    /// Restored or cloned claim and pod.
    pub clone: Option<PvcApp>,
    pub snapshot: Option<VolumeSnapshot>,
    /// Checksum of the data written by the scenario.
    pub checksum: Option<String>,
    /// Image created outside the driver, removed by the scenario itself.
    pub static_image: Option<BackendImage>,
}

impl TestContext {
    pub fn new(cx: ClusterContext, driver: Arc<Driver>) -> Self {
        Self {
            cx,
            driver,
            app: None,
            clone: None,
            snapshot: None,
            checksum: None,
            static_image: None,
        }
    }

    pub fn plugin(&self) -> Plugin {
        self.driver.plugin()
    }

    pub fn driver(&self) -> &Arc<Driver> {
        &self.driver
    }

    pub fn namespace(&self) -> &str {
        self.cx.namespace()
    }

    pub fn timeout(&self) -> Duration {
        self.cx.deploy_timeout()
    }

    pub fn resources(&self) -> &ResourceClient {
        self.cx.resources()
    }

    pub fn verifier(&self) -> &Verifier {
        self.cx.verifier()
    }

    pub fn fixture(&self, file: &str) -> PathBuf {
        self.driver.examples().join(file)
    }

    /// Claim and pod fixtures, placed in the scenario namespace.
    pub async fn load_app(&self, pvc_file: &str, pod_file: &str) -> Result<PvcApp> {
        let loader = self.cx.manifests();
        let pvc = loader.load_pvc(&self.fixture(pvc_file)).await?;
        let pod = loader.load_pod(&self.fixture(pod_file)).await?;
        Ok(PvcApp::new(pvc, pod).in_namespace(self.namespace()))
    }

    /// Snapshot fixture of `pvc` in the scenario namespace.
    pub async fn load_snapshot(&self, file: &str, pvc: &str) -> Result<VolumeSnapshot> {
        let mut snapshot = self.cx.manifests().load_snapshot(&self.fixture(file)).await?;
        snapshot.metadata.namespace = Some(self.namespace().to_string());
        set_snapshot_source(&mut snapshot, pvc, None);
        Ok(snapshot)
    }

    pub fn app(&self) -> Result<&PvcApp> {
        self.app.as_ref().ok_or_else(|| missing("pvc and app"))
    }

    pub fn clone_app(&self) -> Result<&PvcApp> {
        self.clone.as_ref().ok_or_else(|| missing("cloned pvc and app"))
    }

    pub fn snapshot_name(&self) -> Result<&str> {
        self.snapshot
            .as_ref()
            .and_then(|s| s.metadata.name.as_deref())
            .ok_or_else(|| missing("snapshot"))
    }

    pub fn expected_checksum(&self) -> Result<&str> {
        self.checksum.as_deref().ok_or_else(|| missing("checksum"))
    }

    /// Storage class for this scenario only: the default class renamed
    /// after the scenario, with `params` merged in.
    pub async fn custom_storage_class(
        &self,
        params: &[(&str, &str)],
        binding_mode: Option<&str>,
    ) -> Result<String> {
        let base = self.driver.storage_class().await?;
        let name = self.cx.unique_name().to_string();
        let mut sc = fixtures::named_storage_class(&base, &name);
        let params: BTreeMap<String, String> = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        set_storage_class_params(&mut sc, &params);
        if let Some(mode) = binding_mode {
            set_volume_binding_mode(&mut sc, mode);
        }
        self.resources().create_storage_class(&sc).await?;
        Ok(name)
    }

    /// Node plugin container, for commands that need the host's view.
    pub fn node_plugin(&self) -> PodSelector {
        self.plugin().node_plugin_selector(self.cx.driver_namespace())
    }
}

// ============================================================================
// Claim + pod pairs
// ============================================================================

/// A claim and the pod that mounts it.
#[derive(Debug, Clone)]
pub struct PvcApp {
    pub pvc: PersistentVolumeClaim,
    pub pod: Pod,
}

impl PvcApp {
    pub fn new(pvc: PersistentVolumeClaim, pod: Pod) -> Self {
        Self { pvc, pod }
    }

    pub fn in_namespace(mut self, namespace: &str) -> Self {
        self.pvc.metadata.namespace = Some(namespace.to_string());
        self.pod.metadata.namespace = Some(namespace.to_string());
        self
    }

    /// Name both objects `name` and bind the pod to the claim.
    pub fn named(mut self, name: &str) -> Self {
        set_name(&mut self.pvc.metadata, name, None);
        set_name(&mut self.pod.metadata, name, None);
        bind_claim(&mut self.pod, name);
        self
    }

    /// Replace the pod's labels with `app=<value>`.
    pub fn labelled(mut self, value: &str) -> Self {
        set_labels(
            &mut self.pod.metadata,
            [("app".to_string(), value.to_string())].into(),
        );
        self
    }

    pub fn with_storage_class(mut self, class: &str) -> Self {
        set_storage_class_name(&mut self.pvc, class);
        self
    }

    /// Bind the claim to a pre-provisioned volume instead of a class.
    pub fn bound_to_volume(mut self, volume: &str) -> Self {
        set_storage_class_name(&mut self.pvc, "");
        self.pvc.spec.get_or_insert_with(Default::default).volume_name = Some(volume.to_string());
        self
    }

    pub fn with_size(mut self, size: &str) -> Self {
        set_storage_request(&mut self.pvc, size);
        self
    }

    /// Point the claim's data source at `name`.
    pub fn restored_from(mut self, name: &str) -> Result<Self> {
        set_data_source_name(&mut self.pvc, name)?;
        Ok(self)
    }

    pub fn namespace(&self) -> &str {
        self.pvc.metadata.namespace.as_deref().unwrap_or_default()
    }

    pub fn pvc_name(&self) -> &str {
        self.pvc.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn pod_name(&self) -> &str {
        self.pod.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn selector(&self) -> PodSelector {
        PodSelector::named(self.namespace(), self.pod_name())
    }

    /// Raw block claims expose a device instead of a mount.
    pub fn is_block(&self) -> bool {
        device_path(&self.pod).is_some()
    }

    /// Mount path, or device path for raw block claims.
    pub fn data_path(&self) -> Result<&str> {
        mount_path(&self.pod)
            .or_else(|| device_path(&self.pod))
            .ok_or_else(|| E2eError::InvalidObject(format!("pod {} mounts no volume", self.pod_name())))
    }

    /// Create the claim, wait for it to bind, then start the pod.
    pub async fn create(&self, resources: &ResourceClient, timeout: Duration) -> Result<()> {
        resources.create_pvc_and_wait_bound(&self.pvc, timeout).await?;
        resources.create_pod_and_wait_running(&self.pod, timeout).await?;
        Ok(())
    }

    /// Start the pod before waiting for the claim, for classes that bind
    /// on first consumer.
    pub async fn create_late_binding(&self, resources: &ResourceClient, timeout: Duration) -> Result<()> {
        resources.create_pvc_and_wait_bound(&self.pvc, Duration::ZERO).await?;
        resources.create_pod_and_wait_running(&self.pod, timeout).await?;
        resources.bound_pv(self.namespace(), self.pvc_name()).await?;
        Ok(())
    }

    /// Delete the pod, then the claim and its volume.
    pub async fn delete(&self, resources: &ResourceClient, timeout: Duration) -> Result<()> {
        resources
            .delete_pod_and_wait(self.namespace(), self.pod_name(), timeout)
            .await?;
        resources
            .delete_pvc_and_wait(self.namespace(), self.pvc_name(), timeout)
            .await
    }
}

// ============================================================================
// Data helpers
// ============================================================================

/// Run `cmd` in the app pod, failing on any stderr.
pub async fn app_exec(ctx: &TestContext, app: &PvcApp, cmd: &str) -> Result<String> {
    ctx.cx
        .exec()
        .in_pod(&app.selector(), cmd)
        .await?
        .require_clean(cmd)
}

/// Write `content` to `file` below the app's mount and flush it.
pub async fn write_file(ctx: &TestContext, app: &PvcApp, file: &str, content: &str) -> Result<()> {
    let cmd = format!("echo '{}' > {}/{} && sync", content, app.data_path()?, file);
    app_exec(ctx, app, &cmd).await.map(|_| ())
}

pub async fn read_file(ctx: &TestContext, app: &PvcApp, file: &str) -> Result<String> {
    let cmd = format!("cat {}/{}", app.data_path()?, file);
    Ok(app_exec(ctx, app, &cmd).await?.trim().to_string())
}

/// Expect `file` below the app's mount to hold `content`.
pub async fn expect_file(ctx: &TestContext, app: &PvcApp, file: &str, content: &str) -> Result<()> {
    let got = read_file(ctx, app, file).await?;
    if got != content {
        return Err(E2eError::mismatch(format!(
            "{}/{} holds {:?}, expected {:?}",
            app.pod_name(),
            file,
            got,
            content
        )));
    }
    Ok(())
}

// ============================================================================
// Batches
// ============================================================================

/// Template every task of a batch copies.
#[derive(Debug, Clone)]
pub struct BatchFixture {
    pub app: PvcApp,
    pub snapshot: Option<VolumeSnapshot>,
    /// Restore each task's claim from the snapshot named like the task.
    pub indexed_source: bool,
}

/// Runs dispatcher tasks against one scenario namespace.
pub struct BatchHandler {
    resources: ResourceClient,
    timeout: Duration,
}

impl BatchHandler {
    pub fn new(resources: ResourceClient, timeout: Duration) -> Self {
        Self { resources, timeout }
    }
}

#[async_trait]
impl TaskHandler<BatchFixture> for BatchHandler {
    async fn handle(&self, task: TaskSpec<BatchFixture>) -> Result<()> {
        let TaskSpec {
            name,
            operation,
            fixture,
            ..
        } = task;
        match operation {
            Operation::CreatePvcAndApp => {
                let mut app = fixture.app.named(&name);
                if fixture.indexed_source {
                    app = app.restored_from(&name)?;
                }
                app.create(&self.resources, self.timeout).await
            }
            Operation::DeletePvcAndApp => {
                fixture
                    .app
                    .named(&name)
                    .delete(&self.resources, self.timeout)
                    .await
            }
            Operation::CreateSnapshot => {
                let mut snapshot = fixture.snapshot.ok_or_else(|| {
                    E2eError::InvalidObject("createSnapshot needs a snapshot fixture".to_string())
                })?;
                set_name(&mut snapshot.metadata, &name, None);
                self.resources
                    .create_snapshot_and_wait_ready(&snapshot, self.timeout)
                    .await?;
                Ok(())
            }
            Operation::DeleteSnapshot => {
                self.resources
                    .delete_snapshot_and_wait(fixture.app.namespace(), &name, self.timeout)
                    .await
            }
            Operation::Unknown(other) => Err(E2eError::UnknownOperation(other)),
        }
    }
}

/// Run `count` copies of `operation` on `count` workers and wait for all.
pub async fn run_batch(ctx: &TestContext, operation: Operation, count: usize, fixture: &BatchFixture) -> Result<()> {
    let handler: Arc<dyn TaskHandler<BatchFixture>> =
        Arc::new(BatchHandler::new(ctx.resources().clone(), ctx.timeout()));
    let dispatcher = Dispatcher::new(count, handler);
    let outcome = match dispatcher
        .submit_batch(ctx.cx.unique_name(), count, operation, fixture)
        .await
    {
        Ok(batch) => wait_for_all(batch).await.into_result(),
        Err(e) => Err(e),
    };
    dispatcher.shutdown().await;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app() -> PvcApp {
        let pvc: PersistentVolumeClaim = serde_yaml::from_str(
            r#"
apiVersion: v1
kind: PersistentVolumeClaim
metadata:
  name: rbd-pvc-restore
spec:
  storageClassName: csi-rbd-sc
  dataSource:
    name: rbd-pvc-snapshot
    kind: VolumeSnapshot
    apiGroup: snapshot.storage.k8s.io
  accessModes: [ReadWriteOnce]
  resources:
    requests:
      storage: 1Gi
"#,
        )
        .unwrap();
        let pod: Pod = serde_yaml::from_str(
            r#"
apiVersion: v1
kind: Pod
metadata:
  name: csi-rbd-restore-demo-pod
spec:
  containers:
    - name: web-server
      image: docker.io/library/nginx:latest
      volumeMounts:
        - name: mypvc
          mountPath: /var/lib/www/html
  volumes:
    - name: mypvc
      persistentVolumeClaim:
        claimName: rbd-pvc-restore
"#,
        )
        .unwrap();
        PvcApp::new(pvc, pod).in_namespace("rbd-1234abcd")
    }

    #[test]
    fn test_named_binds_pod_to_claim() {
        let app = app().named("rbd-5678ef000");
        assert_eq!(app.pvc_name(), "rbd-5678ef000");
        assert_eq!(app.pod_name(), "rbd-5678ef000");
        let claim = app.pod.spec.as_ref().unwrap().volumes.as_ref().unwrap()[0]
            .persistent_volume_claim
            .as_ref()
            .unwrap()
            .claim_name
            .clone();
        assert_eq!(claim, "rbd-5678ef000");
        assert_eq!(app.namespace(), "rbd-1234abcd");
    }

    #[test]
    fn test_restored_from_and_paths() {
        let app = app().restored_from("snap-1").unwrap().labelled("validate-data");
        assert_eq!(
            app.pvc.spec.as_ref().unwrap().data_source.as_ref().unwrap().name,
            "snap-1"
        );
        assert_eq!(app.pod.metadata.labels.as_ref().unwrap()["app"], "validate-data");
        assert_eq!(app.data_path().unwrap(), "/var/lib/www/html");
        assert!(!app.is_block());
        assert_eq!(app.selector().to_string(), "rbd-1234abcd/metadata.name=csi-rbd-restore-demo-pod");
    }
}
