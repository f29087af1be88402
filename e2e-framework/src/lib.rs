//! End-to-end test engine for CSI drivers on Kubernetes
//!
//! Drives a live cluster through scenarios and checks the results against
//! both the Kubernetes API and the storage backend. This library provides:
//! - Polling, retry and error classification for cluster operations
//! - Typed resource lifecycle helpers that record what they create
//! - Command execution in the backend toolbox pod and Ceph CLI parsing
//! - Manifest loading, driver deployment and cross-layer verification
//! - A bounded worker pool for batched operations
//! - The scenario state machine and the sequential suite runner

pub mod backend;
pub mod ceph;
pub mod context;
pub mod deployer;
pub mod dispatch;
pub mod error;
pub mod ledger;
pub mod manifest;
pub mod metrics;
pub mod poll;
pub mod quantity;
pub mod resources;
pub mod runner;
pub mod scenario;
pub mod snapshot;
pub mod verify;

pub use backend::{BackendExec, KubeExecutor, PodExecutor, PodSelector};
pub use context::{Cluster, ClusterContext, Timeouts};
pub use deployer::{DeployPlan, DeployStage, Deployer};
pub use dispatch::{Dispatcher, Operation, TaskHandler, TaskSpec};
pub use error::{E2eError, ErrorKind, Result};
pub use ledger::CleanupLedger;
pub use manifest::ManifestLoader;
pub use poll::{PollSettings, Progress, poll_until};
pub use resources::ResourceClient;
pub use runner::{RunReport, Runner, Suite};
pub use scenario::{Scenario, ScenarioReport, ScenarioScope, ScenarioState};
pub use verify::Verifier;
