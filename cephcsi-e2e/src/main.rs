use std::sync::Arc;

use clap::Parser;
use tracing::{Level, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use cephcsi_e2e::config::Args;
use cephcsi_e2e::suites;
use e2e_framework::{Cluster, KubeExecutor, Runner, metrics};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // RUST_LOG, when set, overrides --log-level
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(addr) = args.metrics_addr {
        if let Err(e) = metrics::init_metrics(addr) {
            return Err(format!("Failed to initialize metrics: {}", e).into());
        }
    }

    let log_level = args.log_level.clone();
    let config = args
        .into_config()
        .map_err(|e| format!("Invalid configuration: {}", e))?;

    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    info!(
        host = %host,
        driver_namespace = %config.cephcsi_namespace,
        rook_namespace = %config.rook_namespace,
        upgrade = ?config.upgrade.as_ref().map(|u| u.version.as_str()),
        log_level = %log_level,
        "Starting cephcsi-e2e"
    );

    let client = kube::Client::try_default()
        .await
        .map_err(|e| format!("Failed to load Kubernetes client configuration: {}", e))?;
    let cluster = Cluster::new(
        client.clone(),
        Arc::new(KubeExecutor::new(client)),
        &config.rook_namespace,
        config.cephcsi_namespace.clone(),
        config.rados_namespace.clone(),
        config.timeouts,
    );

    let mut runner = Runner::new();
    suites::register(&mut runner, &config, &cluster);
    info!(suites = ?runner.suite_names(), "Running suites");

    let report = runner.run().await;
    println!("{}", report.render());
    std::process::exit(report.exit_code());
}
