//! Shell command execution inside cluster pods
//!
//! The toolbox pod is the only path to backend (Ceph) state. Commands are
//! run through `/bin/sh -c` in a fresh exec session per call; stdout and
//! stderr are captured separately and each caller decides whether stderr
//! means failure.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::Client;
use kube::api::{Api, AttachParams, ListParams};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, instrument, warn};

use crate::error::{E2eError, Result};
use crate::metrics;

/// Label of the Rook toolbox deployment.
pub const TOOLBOX_LABEL: &str = "app=rook-ceph-tools";

/// Pod (and optionally container) a command should run in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodSelector {
    pub namespace: String,
    pub label_selector: String,
    pub field_selector: Option<String>,
    pub container: Option<String>,
}

impl PodSelector {
    pub fn new(namespace: impl Into<String>, label_selector: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            label_selector: label_selector.into(),
            field_selector: None,
            container: None,
        }
    }

    /// The pod called `name`.
    pub fn named(namespace: impl Into<String>, name: &str) -> Self {
        Self {
            namespace: namespace.into(),
            label_selector: String::new(),
            field_selector: Some(format!("metadata.name={}", name)),
            container: None,
        }
    }

    pub fn container(mut self, name: impl Into<String>) -> Self {
        self.container = Some(name.into());
        self
    }
}

impl fmt::Display for PodSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field_selector {
            Some(fields) => write!(f, "{}/{}", self.namespace, fields)?,
            None => write!(f, "{}/{}", self.namespace, self.label_selector)?,
        }
        if let Some(c) = &self.container {
            write!(f, " [{}]", c)?;
        }
        Ok(())
    }
}

/// Captured output of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// Whether the remote process exited with status zero.
    pub success: bool,
}

impl ExecOutput {
    /// Stdout of a command for which any stderr output is a failure.
    pub fn require_clean(self, command: &str) -> Result<String> {
        if !self.success || !self.stderr.trim().is_empty() {
            return Err(E2eError::Backend {
                command: command.to_string(),
                stderr: self.failure_text(),
            });
        }
        Ok(self.stdout)
    }

    /// Stdout of a command that may print notices on stderr while succeeding.
    pub fn require_success(self, command: &str) -> Result<String> {
        if !self.success {
            return Err(E2eError::Backend {
                command: command.to_string(),
                stderr: self.failure_text(),
            });
        }
        if !self.stderr.trim().is_empty() {
            debug!(command, stderr = %self.stderr.trim(), "Ignoring informational stderr");
        }
        Ok(self.stdout)
    }

    fn failure_text(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            "command exited with non-zero status".to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// Executes shell commands in pods.
#[async_trait]
pub trait PodExecutor: Send + Sync {
    async fn exec(&self, target: &PodSelector, command: &str) -> Result<ExecOutput>;
}

/// [`PodExecutor`] backed by the Kubernetes exec subresource.
#[derive(Clone)]
pub struct KubeExecutor {
    client: Client,
}

impl KubeExecutor {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn pick_pod(&self, target: &PodSelector) -> Result<String> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &target.namespace);
        let mut params = ListParams::default();
        if !target.label_selector.is_empty() {
            params = params.labels(&target.label_selector);
        }
        if let Some(fields) = &target.field_selector {
            params = params.fields(fields);
        }
        let list = pods.list(&params).await?;

        let chosen = list.items.iter().find(|pod| match &target.container {
            None => true,
            Some(container) => pod
                .spec
                .as_ref()
                .is_some_and(|spec| spec.containers.iter().any(|c| &c.name == container)),
        });

        chosen
            .and_then(|pod| pod.metadata.name.clone())
            .ok_or_else(|| E2eError::NotFound(format!("no pod matching {}", target)))
    }
}

async fn read_all(mut reader: impl AsyncRead + Unpin) -> std::io::Result<String> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[async_trait]
impl PodExecutor for KubeExecutor {
    #[instrument(skip(self))]
    async fn exec(&self, target: &PodSelector, command: &str) -> Result<ExecOutput> {
        let pod_name = self.pick_pod(target).await?;
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &target.namespace);

        let mut params = AttachParams::default().stderr(true);
        if let Some(container) = &target.container {
            params = params.container(container.clone());
        }

        let mut attached = pods
            .exec(&pod_name, vec!["/bin/sh", "-c", command], &params)
            .await?;

        let stdout = attached
            .stdout()
            .ok_or_else(|| E2eError::malformed(command, "exec session has no stdout"))?;
        let stderr = attached
            .stderr()
            .ok_or_else(|| E2eError::malformed(command, "exec session has no stderr"))?;
        let status = attached.take_status();

        let (stdout, stderr) = tokio::try_join!(read_all(stdout), read_all(stderr))?;
        let success = match status {
            Some(status) => status
                .await
                .is_none_or(|s| s.status.as_deref() == Some("Success")),
            None => true,
        };

        if let Err(e) = attached.join().await {
            warn!(pod = %pod_name, error = %e, "Exec session did not close cleanly");
        }

        Ok(ExecOutput {
            stdout,
            stderr,
            success,
        })
    }
}

/// Entry point for running commands in the toolbox or in workload pods.
#[derive(Clone)]
pub struct BackendExec {
    executor: Arc<dyn PodExecutor>,
    toolbox: PodSelector,
}

impl BackendExec {
    pub fn new(executor: Arc<dyn PodExecutor>, rook_namespace: &str) -> Self {
        Self {
            executor,
            toolbox: PodSelector::new(rook_namespace, TOOLBOX_LABEL),
        }
    }

    pub fn toolbox_selector(&self) -> &PodSelector {
        &self.toolbox
    }

    /// Run a command in the first pod matching `target`.
    pub async fn in_pod(&self, target: &PodSelector, command: &str) -> Result<ExecOutput> {
        debug!(target = %target, command, "Executing command");
        let result = self.executor.exec(target, command).await;
        match &result {
            Ok(out) => metrics::record_backend_command(out.success),
            Err(e) => {
                warn!(target = %target, command, error = %e, "Exec failed");
                metrics::record_backend_command(false);
            }
        }
        result
    }

    /// Run a command in the toolbox pod.
    pub async fn in_toolbox(&self, command: &str) -> Result<ExecOutput> {
        let target = self.toolbox.clone();
        self.in_pod(&target, command).await
    }

    /// Toolbox command whose stderr output means failure.
    pub async fn toolbox_clean(&self, command: &str) -> Result<String> {
        self.in_toolbox(command).await?.require_clean(command)
    }

    /// Toolbox `ceph` command; informational stderr is tolerated.
    pub async fn toolbox_ceph(&self, command: &str) -> Result<String> {
        self.in_toolbox(command).await?.require_success(command)
    }
}
