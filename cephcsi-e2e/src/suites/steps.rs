//! Steps both plugins run the same way

use e2e_framework::manifest::run_as_user;
use e2e_framework::quantity::parse_bytes;
use e2e_framework::scenario::StepFuture;
use e2e_framework::{E2eError, Operation, Result};
use futures::FutureExt;
use tracing::info;

use super::common::{BatchFixture, PvcApp, TestContext, app_exec, expect_file, run_batch, write_file};

pub const PVC: &str = "pvc.yaml";
pub const POD: &str = "pod.yaml";
pub const BLOCK_PVC: &str = "raw-block-pvc.yaml";
pub const BLOCK_POD: &str = "raw-block-pod.yaml";
pub const RESTORE_PVC: &str = "pvc-restore.yaml";
pub const RESTORE_POD: &str = "pod-restore.yaml";
pub const CLONE_PVC: &str = "pvc-clone.yaml";
pub const CLONE_POD: &str = "pod-clone.yaml";
pub const SNAPSHOT: &str = "snapshot.yaml";

/// File written into volumes and read back later.
pub const DATA_FILE: &str = "test";
pub const DATA: &str = "check data persists";

/// Non-root uid apps run as in the normal user scenarios.
pub const NORMAL_UID: i64 = 2000;

/// Volumes created by each batch scenario.
pub const BATCH_SIZE: usize = 2;

fn data_path(app: &PvcApp) -> Result<String> {
    Ok(format!("{}/{}", app.data_path()?, DATA_FILE))
}

// ============================================================================
// Primary claim and pod
// ============================================================================

/// Load the primary claim and pod, named after the scenario.
pub async fn load_primary(ctx: &mut TestContext, pvc: &str, pod: &str) -> Result<()> {
    let name = ctx.cx.unique_name().to_string();
    ctx.app = Some(ctx.load_app(pvc, pod).await?.named(&name));
    Ok(())
}

pub fn load_default(ctx: &mut TestContext) -> StepFuture<'_> {
    load_primary(ctx, PVC, POD).boxed()
}

pub fn load_block(ctx: &mut TestContext) -> StepFuture<'_> {
    load_primary(ctx, BLOCK_PVC, BLOCK_POD).boxed()
}

/// Primary app requesting `size`.
pub async fn load_sized(ctx: &mut TestContext, pvc: &str, pod: &str, size: &str) -> Result<()> {
    load_primary(ctx, pvc, pod).await?;
    if let Some(app) = ctx.app.take() {
        ctx.app = Some(app.with_size(size));
    }
    Ok(())
}

/// Primary app whose pod runs as an unprivileged user.
pub fn load_normal_user(ctx: &mut TestContext) -> StepFuture<'_> {
    async move {
        load_primary(ctx, PVC, POD).await?;
        if let Some(app) = ctx.app.as_mut() {
            run_as_user(&mut app.pod, NORMAL_UID);
        }
        Ok(())
    }
    .boxed()
}

/// Primary app on a scenario-only storage class.
pub async fn load_with_class(ctx: &mut TestContext, class: String) -> Result<()> {
    load_primary(ctx, PVC, POD).await?;
    if let Some(app) = ctx.app.take() {
        ctx.app = Some(app.with_storage_class(&class));
    }
    Ok(())
}

pub fn create_app(ctx: &mut TestContext) -> StepFuture<'_> {
    async move {
        let app = ctx.app()?;
        app.create(ctx.resources(), ctx.timeout()).await?;
        info!(pvc = app.pvc_name(), pod = app.pod_name(), "Claim bound and pod running");
        Ok(())
    }
    .boxed()
}

pub fn delete_app(ctx: &mut TestContext) -> StepFuture<'_> {
    async move { ctx.app()?.delete(ctx.resources(), ctx.timeout()).await }.boxed()
}

// ============================================================================
// Data
// ============================================================================

/// Write the data file and record its checksum.
pub fn write_data(ctx: &mut TestContext) -> StepFuture<'_> {
    async move {
        let app = ctx.app()?.clone();
        write_file(ctx, &app, DATA_FILE, DATA).await?;
        // echo appends a newline
        let written = format!("{}\n", DATA);
        let sum = ctx
            .verifier()
            .content_matches(&app.selector(), &data_path(&app)?, written.as_bytes())
            .await?;
        ctx.checksum = Some(sum);
        Ok(())
    }
    .boxed()
}

async fn expect_data(ctx: &TestContext, app: &PvcApp) -> Result<()> {
    expect_file(ctx, app, DATA_FILE, DATA).await?;
    let sum = ctx.verifier().checksum(&app.selector(), &data_path(app)?).await?;
    let want = ctx.expected_checksum()?;
    if sum != want {
        return Err(E2eError::mismatch(format!(
            "checksum of {} in {} is {}, expected {}",
            DATA_FILE,
            app.pod_name(),
            sum,
            want
        )));
    }
    Ok(())
}

/// Delete the primary pod, keeping its claim.
pub fn delete_pod(ctx: &mut TestContext) -> StepFuture<'_> {
    async move {
        let app = ctx.app()?;
        ctx.resources()
            .delete_pod_and_wait(app.namespace(), app.pod_name(), ctx.timeout())
            .await
    }
    .boxed()
}

/// Start the primary pod again and read the data back.
pub fn start_pod_and_verify(ctx: &mut TestContext) -> StepFuture<'_> {
    async move {
        let app = ctx.app()?.clone();
        ctx.resources()
            .create_pod_and_wait_running(&app.pod, ctx.timeout())
            .await?;
        expect_data(ctx, &app).await
    }
    .boxed()
}

/// Recreate the primary pod against the same claim and read the data back.
pub fn remount_and_verify(ctx: &mut TestContext) -> StepFuture<'_> {
    async move {
        delete_pod(ctx).await?;
        start_pod_and_verify(ctx).await
    }
    .boxed()
}

/// An unprivileged pod can create files in its volume.
pub fn write_as_normal_user(ctx: &mut TestContext) -> StepFuture<'_> {
    async move {
        let app = ctx.app()?.clone();
        let cmd = format!("touch {} && id -u", data_path(&app)?);
        let uid = app_exec(ctx, &app, &cmd).await?;
        if uid.trim() != NORMAL_UID.to_string() {
            return Err(E2eError::mismatch(format!(
                "pod {} runs as uid {}, expected {}",
                app.pod_name(),
                uid.trim(),
                NORMAL_UID
            )));
        }
        Ok(())
    }
    .boxed()
}

pub fn check_metrics(ctx: &mut TestContext) -> StepFuture<'_> {
    async move {
        let app = ctx.app()?;
        ctx.verifier()
            .wait_metrics_present(app.namespace(), app.pvc_name(), ctx.timeout())
            .await
    }
    .boxed()
}

// ============================================================================
// Snapshots and clones
// ============================================================================

pub fn create_snapshot(ctx: &mut TestContext) -> StepFuture<'_> {
    async move {
        let pvc = ctx.app()?.pvc_name().to_string();
        let mut snapshot = ctx.load_snapshot(SNAPSHOT, &pvc).await?;
        snapshot.metadata.name = Some(format!("{}-snap", ctx.cx.unique_name()));
        let ready = ctx
            .resources()
            .create_snapshot_and_wait_ready(&snapshot, ctx.timeout())
            .await?;
        info!(snapshot = ?ready.metadata.name, source = %pvc, "Snapshot ready");
        ctx.snapshot = Some(ready);
        Ok(())
    }
    .boxed()
}

pub fn delete_snapshot(ctx: &mut TestContext) -> StepFuture<'_> {
    async move {
        let name = ctx.snapshot_name()?.to_string();
        ctx.resources()
            .delete_snapshot_and_wait(ctx.namespace(), &name, ctx.timeout())
            .await?;
        ctx.snapshot = None;
        Ok(())
    }
    .boxed()
}

/// New claim restored from the recorded snapshot, with its pod.
pub fn restore_snapshot(ctx: &mut TestContext) -> StepFuture<'_> {
    async move {
        let snapshot = ctx.snapshot_name()?.to_string();
        let name = format!("{}-restore", ctx.cx.unique_name());
        let app = ctx
            .load_app(RESTORE_PVC, RESTORE_POD)
            .await?
            .named(&name)
            .restored_from(&snapshot)?;
        app.create(ctx.resources(), ctx.timeout()).await?;
        ctx.clone = Some(app);
        Ok(())
    }
    .boxed()
}

/// New claim cloned from the primary claim, with its pod.
pub fn clone_pvc(ctx: &mut TestContext) -> StepFuture<'_> {
    async move {
        let source = ctx.app()?.pvc_name().to_string();
        let name = format!("{}-clone", ctx.cx.unique_name());
        let app = ctx
            .load_app(CLONE_PVC, CLONE_POD)
            .await?
            .named(&name)
            .restored_from(&source)?;
        app.create(ctx.resources(), ctx.timeout()).await?;
        ctx.clone = Some(app);
        Ok(())
    }
    .boxed()
}

/// The restored or cloned volume holds the data written to the source.
pub fn verify_clone_data(ctx: &mut TestContext) -> StepFuture<'_> {
    async move {
        let clone = ctx.clone_app()?.clone();
        expect_data(ctx, &clone).await?;
        let source = ctx.app()?.clone();
        let path = data_path(&clone)?;
        // Both pods mount at the same path in the shipped fixtures
        if data_path(&source)? == path {
            ctx.verifier()
                .checksums_match(&source.selector(), &clone.selector(), &path)
                .await?;
        }
        Ok(())
    }
    .boxed()
}

pub fn delete_clone(ctx: &mut TestContext) -> StepFuture<'_> {
    async move {
        ctx.clone_app()?.delete(ctx.resources(), ctx.timeout()).await?;
        ctx.clone = None;
        Ok(())
    }
    .boxed()
}

// ============================================================================
// Resize
// ============================================================================

/// Expand the primary claim to `size` and wait until the pod sees it.
pub async fn expand(ctx: &mut TestContext, size: &str) -> Result<()> {
    let app = ctx.app()?.clone();
    let bytes = parse_bytes(size)
        .ok_or_else(|| E2eError::InvalidObject(format!("invalid storage size {}", size)))?;
    ctx.resources()
        .expand_pvc(app.namespace(), app.pvc_name(), size, ctx.timeout())
        .await?;
    let observed = ctx
        .verifier()
        .wait_size_at_least(&app.selector(), app.data_path()?, bytes, app.is_block(), ctx.timeout())
        .await?;
    ctx.resources()
        .wait_pod_running(app.namespace(), app.pod_name(), ctx.timeout())
        .await?;
    info!(pvc = app.pvc_name(), observed, "Volume expanded");
    Ok(())
}

// ============================================================================
// Batches
// ============================================================================

async fn app_fixture(ctx: &TestContext) -> Result<BatchFixture> {
    Ok(BatchFixture {
        app: ctx.load_app(PVC, POD).await?,
        snapshot: None,
        indexed_source: false,
    })
}

/// `count` claims and pods named `${unique}0..`, created in parallel.
pub async fn batch_create_apps(ctx: &mut TestContext, count: usize) -> Result<()> {
    let fixture = app_fixture(ctx).await?;
    run_batch(ctx, Operation::CreatePvcAndApp, count, &fixture).await
}

pub async fn batch_delete_apps(ctx: &mut TestContext, count: usize) -> Result<()> {
    let fixture = app_fixture(ctx).await?;
    run_batch(ctx, Operation::DeletePvcAndApp, count, &fixture).await
}

async fn snapshot_fixture(ctx: &TestContext) -> Result<BatchFixture> {
    let app = ctx.app()?.clone();
    let snapshot = ctx.load_snapshot(SNAPSHOT, app.pvc_name()).await?;
    Ok(BatchFixture {
        app,
        snapshot: Some(snapshot),
        indexed_source: false,
    })
}

/// `count` snapshots of the primary claim, taken in parallel.
pub async fn batch_create_snapshots(ctx: &mut TestContext, count: usize) -> Result<()> {
    let fixture = snapshot_fixture(ctx).await?;
    run_batch(ctx, Operation::CreateSnapshot, count, &fixture).await
}

pub async fn batch_delete_snapshots(ctx: &mut TestContext, count: usize) -> Result<()> {
    let fixture = snapshot_fixture(ctx).await?;
    run_batch(ctx, Operation::DeleteSnapshot, count, &fixture).await
}

async fn restore_fixture(ctx: &TestContext) -> Result<BatchFixture> {
    Ok(BatchFixture {
        app: ctx.load_app(RESTORE_PVC, RESTORE_POD).await?,
        snapshot: None,
        indexed_source: true,
    })
}

/// One claim and pod per batch snapshot, each restored from the snapshot
/// sharing its name.
pub async fn batch_restore_apps(ctx: &mut TestContext, count: usize) -> Result<()> {
    let fixture = restore_fixture(ctx).await?;
    run_batch(ctx, Operation::CreatePvcAndApp, count, &fixture).await
}

pub async fn batch_delete_restored(ctx: &mut TestContext, count: usize) -> Result<()> {
    let fixture = restore_fixture(ctx).await?;
    run_batch(ctx, Operation::DeletePvcAndApp, count, &fixture).await
}
