//! CephFS filesystem-volume scenarios

use e2e_framework::poll_until;
use e2e_framework::scenario::StepFuture;
use e2e_framework::{E2eError, Progress, Result, Scenario};
use futures::FutureExt;
use tracing::info;

use super::common::TestContext;
use super::steps::{self, BATCH_SIZE};
use crate::plugin::{CEPHFS_DATA_POOL, CEPHFS_NAME, SUBVOLUME_GROUP};

pub const SUITE: &str = "cephfs";

fn scenario(name: &str) -> Scenario<TestContext> {
    Scenario::new(SUITE, name)
}

// ============================================================================
// Backend checks
// ============================================================================

async fn expect_subvolumes(ctx: &mut TestContext, count: usize) -> Result<()> {
    ctx.verifier()
        .wait_subvolume_count(CEPHFS_NAME, SUBVOLUME_GROUP, count, ctx.timeout())
        .await?;
    info!(count, "Subvolume count matches");
    Ok(())
}

/// The subvolume named in the claim's volume handle is listed in the group.
fn verify_subvolume(ctx: &mut TestContext) -> StepFuture<'_> {
    async move {
        let app = ctx.app()?;
        let verifier = ctx.verifier();
        let subvolume = verifier.subvolume_for_pvc(app.namespace(), app.pvc_name()).await?;
        let settings = ctx.resources().poll_settings().with_timeout(ctx.timeout());
        let what = format!("subvolume {} in {}/{}", subvolume, CEPHFS_NAME, SUBVOLUME_GROUP);
        let wanted = subvolume.as_str();
        poll_until(settings, &what, move || async move {
            let listed = verifier
                .ceph()
                .list_subvolumes(CEPHFS_NAME, SUBVOLUME_GROUP)
                .await?;
            Ok(if listed.iter().any(|s| s == wanted) {
                Progress::Done(())
            } else {
                Progress::not_yet(format!("{} subvolumes, none named {}", listed.len(), wanted))
            })
        })
        .await
    }
    .boxed()
}

/// The source subvolume carries the snapshot named in the content handle.
fn verify_backend_snapshot(ctx: &mut TestContext) -> StepFuture<'_> {
    async move {
        let app = ctx.app()?;
        let snapshot = ctx.snapshot_name()?;
        let verifier = ctx.verifier();
        let subvolume = verifier.subvolume_for_pvc(app.namespace(), app.pvc_name()).await?;
        let backend = verifier
            .image_for_snapshot(ctx.namespace(), snapshot, CEPHFS_NAME)
            .await?;

        let settings = ctx.resources().poll_settings().with_timeout(ctx.timeout());
        let what = format!("snapshot {} of subvolume {}", backend.name, subvolume);
        let (subvolume, snap_name) = (subvolume.as_str(), backend.name.as_str());
        poll_until(settings, &what, move || {
            verifier.subvolume_snapshot_exists(CEPHFS_NAME, subvolume, SUBVOLUME_GROUP, snap_name)
        })
        .await
    }
    .boxed()
}

/// The filesystem has the extra data pool the pool scenario places
/// volumes in.
fn check_data_pool(ctx: &mut TestContext) -> StepFuture<'_> {
    async move {
        let filesystems = ctx.verifier().ceph().list_filesystems().await?;
        let fs = filesystems
            .iter()
            .find(|fs| fs.name == CEPHFS_NAME)
            .ok_or_else(|| E2eError::mismatch(format!("filesystem {} not found", CEPHFS_NAME)))?;
        if !fs.data_pools.iter().any(|p| p == CEPHFS_DATA_POOL) {
            return Err(E2eError::mismatch(format!(
                "filesystem {} has data pools {:?}, expected {}",
                CEPHFS_NAME, fs.data_pools, CEPHFS_DATA_POOL
            )));
        }
        let class = ctx.custom_storage_class(&[("pool", CEPHFS_DATA_POOL)], None).await?;
        steps::load_with_class(ctx, class).await
    }
    .boxed()
}

// ============================================================================
// Scenarios
// ============================================================================

pub fn scenarios() -> Vec<Scenario<TestContext>> {
    vec![
        scenario("create a PVC and bind it to an app")
            .setup("load pvc and app", steps::load_default)
            .step("create pvc and app", steps::create_app)
            .step("check backing subvolume", verify_subvolume)
            .step("expect one subvolume", |ctx| expect_subvolumes(ctx, 1).boxed())
            .step("delete pvc and app", steps::delete_app)
            .step("expect no subvolumes", |ctx| expect_subvolumes(ctx, 0).boxed()),
        scenario("create and delete PVCs in parallel")
            .step("create pvcs and apps", |ctx| steps::batch_create_apps(ctx, BATCH_SIZE).boxed())
            .step("expect one subvolume per pvc", |ctx| expect_subvolumes(ctx, BATCH_SIZE).boxed())
            .step("delete pvcs and apps", |ctx| steps::batch_delete_apps(ctx, BATCH_SIZE).boxed())
            .step("expect no subvolumes", |ctx| expect_subvolumes(ctx, 0).boxed()),
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
            .step("expect no subvolumes", |ctx| expect_subvolumes(ctx, 0).boxed()),
        scenario("snapshot and restore in parallel")
            .setup("load pvc and app", steps::load_default)
            .step("create pvc and app", steps::create_app)
            .step("create snapshots", |ctx| steps::batch_create_snapshots(ctx, BATCH_SIZE).boxed())
            .step("restore snapshots", |ctx| steps::batch_restore_apps(ctx, BATCH_SIZE).boxed())
            .step("expect source and restored subvolumes", |ctx| {
                expect_subvolumes(ctx, BATCH_SIZE + 1).boxed()
            })
            .step("delete restored pvcs", |ctx| steps::batch_delete_restored(ctx, BATCH_SIZE).boxed())
            .step("delete snapshots", |ctx| steps::batch_delete_snapshots(ctx, BATCH_SIZE).boxed())
            .step("delete pvc and app", steps::delete_app)
            .step("expect no subvolumes", |ctx| expect_subvolumes(ctx, 0).boxed()),
        scenario("clone a PVC")
            .setup("load pvc and app", steps::load_default)
            .step("create pvc and app", steps::create_app)
            .step("write data", steps::write_data)
            .step("clone pvc", steps::clone_pvc)
            .step("compare cloned data", steps::verify_clone_data)
            .step("delete cloned pvc", steps::delete_clone)
            .step("delete pvc and app", steps::delete_app)
            .step("expect no subvolumes", |ctx| expect_subvolumes(ctx, 0).boxed()),
        scenario("resize a PVC")
            .setup("load 2Gi pvc and app", |ctx| {
                steps::load_sized(ctx, steps::PVC, steps::POD, "2Gi").boxed()
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
        scenario("place volumes in a named data pool")
            .setup("check data pool and create storage class", check_data_pool)
            .step("create pvc and app", steps::create_app)
            .step("check backing subvolume", verify_subvolume)
            .step("delete pvc and app", steps::delete_app)
            .step("expect no subvolumes", |ctx| expect_subvolumes(ctx, 0).boxed()),
    ]
}
