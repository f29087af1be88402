//! RBD block-volume scenarios

use e2e_framework::ceph::{BackendImage, JournalKind};
use e2e_framework::poll_until;
use e2e_framework::quantity::GIB;
use e2e_framework::resources::ignore_not_found;
use e2e_framework::scenario::StepFuture;
use e2e_framework::{E2eError, Result, Scenario};
use futures::FutureExt;
use tracing::info;

use super::common::TestContext;
use super::steps::{self, BATCH_SIZE};
use crate::fixtures;
use crate::plugin::{Plugin, RBD_POOL, RBD_TOPOLOGY_POOL, REGION_VALUE, ZONE_VALUE};

pub const SUITE: &str = "rbd";

fn scenario(name: &str) -> Scenario<TestContext> {
    Scenario::new(SUITE, name)
}

/// Path of a CSI volume's mount as the node plugin sees it.
pub fn kubelet_mount_path(pod_uid: &str, pv_name: &str) -> String {
    format!(
        "/var/lib/kubelet/pods/{}/volumes/kubernetes.io~csi/{}/mount",
        pod_uid, pv_name
    )
}

/// `topologyConstrainedPools` parameter pinning the topology pool to the
/// labelled region and zone.
pub fn topology_constrained_pools() -> String {
    serde_json::json!([{
        "poolName": RBD_TOPOLOGY_POOL,
        "domainSegments": [
            {"domainLabel": "region", "value": REGION_VALUE},
            {"domainLabel": "zone", "value": ZONE_VALUE},
        ],
    }])
    .to_string()
}

// ============================================================================
// Backend checks
// ============================================================================

async fn expect_images(ctx: &mut TestContext, count: usize) -> Result<()> {
    ctx.verifier().wait_image_count(RBD_POOL, count, ctx.timeout()).await
}

fn verify_image(ctx: &mut TestContext) -> StepFuture<'_> {
    async move {
        let app = ctx.app()?;
        let image = ctx
            .verifier()
            .wait_image_in_pool(app.namespace(), app.pvc_name(), RBD_POOL, ctx.timeout())
            .await?;
        info!(image = %image.spec(), "Claim backed by image");
        Ok(())
    }
    .boxed()
}

fn verify_journal_clean(ctx: &mut TestContext) -> StepFuture<'_> {
    async move {
        let verifier = ctx.verifier();
        verifier
            .wait_journal_clean(RBD_POOL, JournalKind::Volume, ctx.timeout())
            .await?;
        verifier
            .wait_journal_clean(RBD_POOL, JournalKind::Snapshot, ctx.timeout())
            .await
    }
    .boxed()
}

/// The snapshot's backing image carries exactly one RBD snapshot.
fn verify_backend_snapshot(ctx: &mut TestContext) -> StepFuture<'_> {
    async move {
        let snapshot = ctx.snapshot_name()?;
        let verifier = ctx.verifier();
        let image = verifier
            .image_for_snapshot(ctx.namespace(), snapshot, RBD_POOL)
            .await?;
        let settings = ctx.resources().poll_settings().with_timeout(ctx.timeout());
        let what = format!("rbd snapshot on {}", image.spec());
        let image = &image;
        poll_until(settings, &what, move || {
            verifier.snapshot_exists_for_image(image, &image.name)
        })
        .await?;

        let count = verifier.snapshot_count(image).await?;
        if count != 1 {
            return Err(E2eError::mismatch(format!(
                "{} has {} rbd snapshots, expected 1",
                image.spec(),
                count
            )));
        }
        Ok(())
    }
    .boxed()
}

fn verify_encrypted(ctx: &mut TestContext) -> StepFuture<'_> {
    async move {
        let app = ctx.app()?;
        let (namespace, timeout) = (app.namespace(), ctx.timeout());
        let image = ctx
            .verifier()
            .image_for_pvc(namespace, app.pvc_name(), RBD_POOL)
            .await?;
        let pv = ctx.resources().bound_pv(namespace, app.pvc_name()).await?;
        let pod = ctx
            .resources()
            .wait_pod_running(namespace, app.pod_name(), timeout)
            .await?;

        let pod_uid = pod
            .metadata
            .uid
            .ok_or_else(|| E2eError::InvalidObject(format!("pod {} has no uid", app.pod_name())))?;
        let pv_name = pv
            .metadata
            .name
            .ok_or_else(|| E2eError::InvalidObject("bound volume has no name".to_string()))?;
        let mount = kubelet_mount_path(&pod_uid, &pv_name);
        ctx.verifier()
            .image_encrypted(&image, &ctx.node_plugin(), &mount)
            .await
    }
    .boxed()
}

// ============================================================================
// Topology
// ============================================================================

fn prepare_topology(ctx: &mut TestContext) -> StepFuture<'_> {
    async move {
        let ceph = ctx.cx.cluster().ceph();
        ceph.create_pool(RBD_TOPOLOGY_POOL).await?;
        ceph.ensure_rados_namespace(RBD_TOPOLOGY_POOL, ctx.driver().rados_namespace())
            .await?;

        let pools = topology_constrained_pools();
        let class = ctx
            .custom_storage_class(
                &[("topologyConstrainedPools", pools.as_str())],
                Some("WaitForFirstConsumer"),
            )
            .await?;
        steps::load_with_class(ctx, class).await
    }
    .boxed()
}

fn create_late_binding(ctx: &mut TestContext) -> StepFuture<'_> {
    async move {
        let app = ctx.app()?;
        app.create_late_binding(ctx.resources(), ctx.timeout()).await
    }
    .boxed()
}

fn verify_topology(ctx: &mut TestContext) -> StepFuture<'_> {
    async move {
        let app = ctx.app()?;
        let topology = Plugin::Rbd.topology();
        let expected: Vec<(&str, &str)> = topology.iter().map(|(k, v)| (k.as_str(), *v)).collect();
        ctx.verifier()
            .topology_matches(app.namespace(), app.pvc_name(), &expected)
            .await?;
        ctx.verifier()
            .wait_image_in_pool(app.namespace(), app.pvc_name(), RBD_TOPOLOGY_POOL, ctx.timeout())
            .await?;
        Ok(())
    }
    .boxed()
}

/// The claim must be gone before its pool.
fn remove_topology_pool(ctx: &mut TestContext) -> StepFuture<'_> {
    async move {
        if let Some(app) = ctx.app.as_ref() {
            let resources = ctx.resources();
            ignore_not_found(
                resources
                    .delete_pod_and_wait(app.namespace(), app.pod_name(), ctx.timeout())
                    .await,
            )?;
            ignore_not_found(
                resources
                    .delete_pvc_and_wait(app.namespace(), app.pvc_name(), ctx.timeout())
                    .await,
            )?;
        }
        ctx.cx.cluster().ceph().delete_pool(RBD_TOPOLOGY_POOL).await
    }
    .boxed()
}

// ============================================================================
// Static volumes
// ============================================================================

const STATIC_SIZE_GIB: u64 = 4;

/// Name of the pre-created image and of the volume exposing it.
fn static_name(ctx: &TestContext) -> String {
    format!("{}-static", ctx.cx.unique_name())
}

fn create_static_image(ctx: &mut TestContext) -> StepFuture<'_> {
    async move {
        let image = BackendImage::new(RBD_POOL, static_name(ctx)).in_namespace(ctx.driver().rados_namespace());
        let ceph = ctx.verifier().ceph().clone();
        ceph.create_image(&image, STATIC_SIZE_GIB * 1024).await?;
        ctx.static_image = Some(image.clone());

        let info = ceph.image_info(&image).await?;
        if info.size != STATIC_SIZE_GIB * GIB {
            return Err(E2eError::mismatch(format!(
                "{} has {} bytes, expected {}",
                image.spec(),
                info.size,
                STATIC_SIZE_GIB * GIB
            )));
        }
        Ok(())
    }
    .boxed()
}

/// Volume for the static image and an app whose claim binds to it by name.
fn create_static_volume(ctx: &mut TestContext) -> StepFuture<'_> {
    async move {
        let image = ctx
            .static_image
            .clone()
            .ok_or_else(|| E2eError::InvalidObject("no static image created".to_string()))?;
        let name = static_name(ctx);
        let size = format!("{}Gi", STATIC_SIZE_GIB);
        let cluster_id = ctx.driver().cluster_id().await?;
        let pv = fixtures::static_rbd_pv(&name, &image, &cluster_id, &size, ctx.cx.driver_namespace());
        ctx.resources().create_pv(&pv).await?;

        steps::load_default(ctx).await?;
        if let Some(app) = ctx.app.take() {
            ctx.app = Some(app.bound_to_volume(&name).with_size(&size));
        }
        Ok(())
    }
    .boxed()
}

/// The retained volume keeps its image after the claim is gone.
fn release_static_volume(ctx: &mut TestContext) -> StepFuture<'_> {
    async move {
        let image = ctx
            .static_image
            .as_ref()
            .ok_or_else(|| E2eError::InvalidObject("no static image created".to_string()))?;
        ctx.verifier().ceph().image_info(image).await?;
        ctx.resources()
            .delete_pv_and_wait(&static_name(ctx), ctx.timeout())
            .await
    }
    .boxed()
}

/// The claim and volume must be gone before their image.
fn remove_static_image(ctx: &mut TestContext) -> StepFuture<'_> {
    async move {
        let resources = ctx.resources();
        if let Some(app) = ctx.app.as_ref() {
            ignore_not_found(
                resources
                    .delete_pod_and_wait(app.namespace(), app.pod_name(), ctx.timeout())
                    .await,
            )?;
            ignore_not_found(
                resources
                    .delete_pvc_and_wait(app.namespace(), app.pvc_name(), ctx.timeout())
                    .await,
            )?;
        }
        ignore_not_found(resources.delete_pv_and_wait(&static_name(ctx), ctx.timeout()).await)?;
        if let Some(image) = ctx.static_image.take() {
            ctx.verifier().ceph().remove_image(&image).await?;
        }
        Ok(())
    }
    .boxed()
}

// ============================================================================
// Node plugin
// ============================================================================

fn restart_node_plugin(ctx: &mut TestContext) -> StepFuture<'_> {
    async move {
        let selector = ctx.node_plugin();
        let resources = ctx.resources();
        let deleted = resources
            .delete_pods_by_label(&selector.namespace, &selector.label_selector, ctx.timeout())
            .await?;
        resources
            .wait_for_daemonset_ready(&selector.namespace, Plugin::Rbd.node_plugin(), ctx.timeout())
            .await?;
        info!(deleted, "Node plugin restarted");
        Ok(())
    }
    .boxed()
}

// ============================================================================
// Scenarios
// ============================================================================

/// Every RBD scenario. `deployed` is false when the driver is managed
/// outside the harness.
pub fn scenarios(deployed: bool) -> Vec<Scenario<TestContext>> {
    vec![
        scenario("create a PVC and bind it to an app")
            .setup("load pvc and app", steps::load_default)
            .step("create pvc and app", steps::create_app)
            .step("check backing image", verify_image)
            .step("expect one image", |ctx| expect_images(ctx, 1).boxed())
            .step("delete pvc and app", steps::delete_app)
            .step("expect no images", |ctx| expect_images(ctx, 0).boxed())
            .step("check journal is clean", verify_journal_clean),
        scenario("create and delete PVCs in parallel")
            .step("create pvcs and apps", |ctx| steps::batch_create_apps(ctx, BATCH_SIZE).boxed())
            .step("expect one image per pvc", |ctx| expect_images(ctx, BATCH_SIZE).boxed())
            .step("delete pvcs and apps", |ctx| steps::batch_delete_apps(ctx, BATCH_SIZE).boxed())
            .step("expect no images", |ctx| expect_images(ctx, 0).boxed()),
        scenario("create a raw block PVC")
            .setup("load block pvc and app", steps::load_block)
            .step("create pvc and app", steps::create_app)
            .step("check backing image", verify_image)
            .step("delete pvc and app", steps::delete_app)
            .step("expect no images", |ctx| expect_images(ctx, 0).boxed()),
        scenario("create a snapshot and restore it")
            .setup("load pvc and app", steps::load_default)
            .step("create pvc and app", steps::create_app)
            .step("write data", steps::write_data)
            .step("create snapshot", steps::create_snapshot)
            .step("check backend snapshot", verify_backend_snapshot)
            .step("restore snapshot", steps::restore_snapshot)
            .step("compare restored data", steps::verify_clone_data)
            .step("delete restored pvc", steps::delete_clone)
            .step("delete snapshot", steps::delete_snapshot)
            .step("delete pvc and app", steps::delete_app)
            .step("expect no images", |ctx| expect_images(ctx, 0).boxed())
            .step("check journal is clean", verify_journal_clean),
        scenario("snapshot and restore in parallel")
            .setup("load pvc and app", steps::load_default)
            .step("create pvc and app", steps::create_app)
            .step("create snapshots", |ctx| steps::batch_create_snapshots(ctx, BATCH_SIZE).boxed())
            .step("restore snapshots", |ctx| steps::batch_restore_apps(ctx, BATCH_SIZE).boxed())
            .step("delete restored pvcs", |ctx| steps::batch_delete_restored(ctx, BATCH_SIZE).boxed())
            .step("delete snapshots", |ctx| steps::batch_delete_snapshots(ctx, BATCH_SIZE).boxed())
            .step("delete pvc and app", steps::delete_app)
            .step("expect no images", |ctx| expect_images(ctx, 0).boxed()),
        scenario("clone a PVC")
            .setup("load pvc and app", steps::load_default)
            .step("create pvc and app", steps::create_app)
            .step("write data", steps::write_data)
            .step("clone pvc", steps::clone_pvc)
            .step("compare cloned data", steps::verify_clone_data)
            .step("delete cloned pvc", steps::delete_clone)
            .step("delete pvc and app", steps::delete_app)
            .step("expect no images", |ctx| expect_images(ctx, 0).boxed()),
        scenario("provision in a topology constrained pool")
            .skip_if(move || (!deployed).then(|| "driver not deployed with topology labels".to_string()))
            .setup("create pool and topology storage class", prepare_topology)
            .step("create pvc and app", create_late_binding)
            .step("check volume topology and pool", verify_topology)
            .step("delete pvc and app", steps::delete_app)
            .teardown("delete topology pool", remove_topology_pool),
        scenario("resize a filesystem PVC")
            .setup("load 2Gi pvc and app", |ctx| {
                steps::load_sized(ctx, steps::PVC, steps::POD, "2Gi").boxed()
            })
            .step("create pvc and app", steps::create_app)
            .step("expand to 5Gi", |ctx| steps::expand(ctx, "5Gi").boxed())
            .step("delete pvc and app", steps::delete_app),
        scenario("resize a raw block PVC")
            .setup("load 2Gi block pvc and app", |ctx| {
                steps::load_sized(ctx, steps::BLOCK_PVC, steps::BLOCK_POD, "2Gi").boxed()
            })
            .step("create pvc and app", steps::create_app)
            .step("expand to 5Gi", |ctx| steps::expand(ctx, "5Gi").boxed())
            .step("delete pvc and app", steps::delete_app),
        scenario("data persists across pod restarts")
            .setup("load pvc and app", steps::load_default)
            .step("create pvc and app", steps::create_app)
            .step("write data", steps::write_data)
            .step("recreate app and read data", steps::remount_and_verify)
            .step("delete pvc and app", steps::delete_app),
        scenario("normal user writes and volume stats are reported")
            .setup("load pvc and non-root app", steps::load_normal_user)
            .step("create pvc and app", steps::create_app)
            .step("write as non-root user", steps::write_as_normal_user)
            .step("check kubelet volume stats", steps::check_metrics)
            .step("delete pvc and app", steps::delete_app),
        scenario("create an encrypted PVC")
            .setup("create encrypted storage class", |ctx| {
                async move {
                    let class = ctx.custom_storage_class(&[("encrypted", "true")], None).await?;
                    steps::load_with_class(ctx, class).await
                }
                .boxed()
            })
            .step("create pvc and app", steps::create_app)
            .step("check image and mount are encrypted", verify_encrypted)
            .step("delete pvc and app", steps::delete_app)
            .step("expect no images", |ctx| expect_images(ctx, 0).boxed()),
        scenario("bind a PVC to a static RBD volume")
            .setup("create rbd image", create_static_image)
            .setup("create static pv", create_static_volume)
            .step("create pvc and app", steps::create_app)
            .step("write data", steps::write_data)
            .step("delete pvc and app", steps::delete_app)
            .step("delete pv and keep image", release_static_volume)
            .teardown("remove rbd image", remove_static_image),
        scenario("volumes survive a node plugin restart")
            .setup("load pvc and app", steps::load_default)
            .step("create pvc and app", steps::create_app)
            .step("write data", steps::write_data)
            .step("restart node plugin", restart_node_plugin)
            .step("recreate app and read data", steps::remount_and_verify)
            .step("delete pvc and app", steps::delete_app)
            .step("expect no images", |ctx| expect_images(ctx, 0).boxed()),
    ]
}
