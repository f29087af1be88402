//! Upgrade from an older release with live volumes

use e2e_framework::Scenario;
use e2e_framework::scenario::StepFuture;
use futures::FutureExt;
use tracing::info;

use super::common::TestContext;
use super::steps;
use crate::plugin::Plugin;

/// Size the claim is expanded to once the new driver runs.
pub const EXPANDED_SIZE: &str = "5Gi";

pub fn suite_name(plugin: Plugin) -> String {
    format!("{}-upgrade", plugin.name())
}

fn upgrade_driver(ctx: &mut TestContext) -> StepFuture<'_> {
    async move {
        ctx.driver().upgrade().await?;
        info!(plugin = %ctx.plugin(), "Driver upgraded in place");
        Ok(())
    }
    .boxed()
}

/// Data written and snapshotted under the old driver must stay readable,
/// restorable and clonable under the new one.
pub fn scenarios(plugin: Plugin) -> Vec<Scenario<TestContext>> {
    vec![
        Scenario::new(suite_name(plugin), "upgrade with existing volumes")
            .setup("load pvc and app", steps::load_default)
            .step("create pvc and app", steps::create_app)
            .step("write data", steps::write_data)
            .step("create snapshot", steps::create_snapshot)
            .step("delete app", steps::delete_pod)
            .step("upgrade driver", upgrade_driver)
            .step("recreate app and read data", steps::start_pod_and_verify)
            .step("restore snapshot taken before upgrade", steps::restore_snapshot)
            .step("compare restored data", steps::verify_clone_data)
            .step("delete restored pvc", steps::delete_clone)
            .step("clone pvc", steps::clone_pvc)
            .step("compare cloned data", steps::verify_clone_data)
            .step("delete cloned pvc", steps::delete_clone)
            .step("expand pvc", |ctx| steps::expand(ctx, EXPANDED_SIZE).boxed())
            .step("delete snapshot", steps::delete_snapshot)
            .step("delete pvc and app", steps::delete_app),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upgrade_suite_names() {
        assert_eq!(suite_name(Plugin::Rbd), "rbd-upgrade");
        assert_eq!(suite_name(Plugin::CephFs), "cephfs-upgrade");
        let scenarios = scenarios(Plugin::CephFs);
        assert_eq!(scenarios.len(), 1);
        assert_eq!(scenarios[0].id().suite, "cephfs-upgrade");
    }
}
