//! Ceph CSI end-to-end suites
//!
//! Deploys the RBD and CephFS drivers into a live cluster backed by Rook
//! and runs their scenarios on top of `e2e_framework`:
//! - `config`: command-line flags and the validated run configuration
//! - `plugin`: names, manifests and Ceph capabilities of each driver
//! - `fixtures`: cluster-specific config map, secrets, classes and deploy plan
//! - `fetch`: checkout of an older release for upgrade runs
//! - `suites`: the scenarios and their registration

pub mod config;
pub mod fetch;
pub mod fixtures;
pub mod plugin;
pub mod suites;

pub use config::{Args, E2eConfig};
pub use plugin::Plugin;
