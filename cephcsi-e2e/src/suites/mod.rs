//! Suite registration for the enabled plugins

pub mod cephfs;
pub mod common;
pub mod rbd;
pub mod steps;
pub mod upgrade;

use e2e_framework::{Cluster, Runner, Scenario, Suite};
use tracing::info;

use crate::config::E2eConfig;
use crate::plugin::Plugin;
use common::{Driver, PluginScope, Release, TestContext};

/// Scenarios of one plugin's suite, before budgets are applied.
pub fn plugin_scenarios(config: &E2eConfig, plugin: Plugin) -> Vec<Scenario<TestContext>> {
    if config.upgrade.is_some() {
        return upgrade::scenarios(plugin);
    }
    match plugin {
        Plugin::Rbd => rbd::scenarios(config.rbd.deploy),
        Plugin::CephFs => cephfs::scenarios(),
    }
}

pub fn suite_name(config: &E2eConfig, plugin: Plugin) -> String {
    match config.upgrade {
        Some(_) => upgrade::suite_name(plugin),
        None => plugin.name().to_string(),
    }
}

/// Build one suite per enabled plugin, each deploying its own driver.
pub fn suites(config: &E2eConfig, cluster: &Cluster) -> Vec<Suite<PluginScope>> {
    config
        .enabled_plugins()
        .into_iter()
        .map(|plugin| {
            let driver = Driver::new(plugin, cluster.clone(), config.plugin(plugin).clone());
            let release = match &config.upgrade {
                Some(upgrade) => Release::Previous(upgrade.clone()),
                None => Release::Current,
            };
            plugin_scenarios(config, plugin).into_iter().fold(
                Suite::new(suite_name(config, plugin), PluginScope::new(driver, release)),
                |suite, scenario| suite.scenario(scenario.budget(config.scenario_timeout)),
            )
        })
        .collect()
}

/// Add every enabled suite to `runner`.
pub fn register(runner: &mut Runner, config: &E2eConfig, cluster: &Cluster) {
    for suite in suites(config, cluster) {
        info!(suite = suite.name(), scenarios = suite.len(), "Suite registered");
        runner.add(suite);
    }
}

