//! Error type shared by the harness, with a coarse [`ErrorKind`] for
//! reports and API status classification

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Transport-level messages that indicate a transient API failure.
///
/// The API server and the HTTP stack surface these as plain strings, so
/// classification falls back to substring matching.
const TRANSIENT_MESSAGES: &[&str] = &[
    "EOF",
    "connection reset",
    "connection refused",
    "etcdserver: request timed out",
    "unable to upgrade connection",
    "transport is closing",
    "transport: missing content-type field",
    "broken pipe",
];

#[derive(Error, Debug)]
pub enum E2eError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("retryable API error: {0}")]
    RetryableApi(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("timed out after {}s waiting for {what} (last state: {last_state})", .elapsed.as_secs())]
    Timeout {
        what: String,
        elapsed: Duration,
        last_state: String,
    },

    #[error("scenario exceeded its timeout budget of {}s", .0.as_secs())]
    BudgetExceeded(Duration),

    #[error("backend command `{command}` failed: {stderr}")]
    Backend { command: String, stderr: String },

    #[error("malformed output from `{command}`: {reason}")]
    MalformedOutput { command: String, reason: String },

    #[error("cluster mismatch: {0}")]
    ClusterMismatch(String),

    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    #[error("{failed} of {total} {operation} tasks failed: {details}")]
    BatchFailed {
        operation: String,
        failed: usize,
        total: usize,
        details: String,
    },

    #[error("setup failed: {0}")]
    Setup(Box<E2eError>),

    #[error("teardown failed: {}", join_errors(.0))]
    Teardown(Vec<E2eError>),

    #[error("invalid manifest {path}: {reason}")]
    Manifest { path: String, reason: String },

    #[error("invalid object: {0}")]
    InvalidObject(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, E2eError>;

/// Coarse classification printed in reports next to the error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    Conflict,
    RetryableApi,
    Api,
    Timeout,
    BackendError,
    MalformedOutput,
    ClusterMismatch,
    UnknownOperation,
    BatchFailure,
    SetupFailure,
    TeardownFailure,
    InvalidInput,
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "NotFound",
            ErrorKind::AlreadyExists => "AlreadyExists",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::RetryableApi => "RetryableAPI",
            ErrorKind::Api => "API",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::BackendError => "BackendError",
            ErrorKind::MalformedOutput => "MalformedOutput",
            ErrorKind::ClusterMismatch => "ClusterMismatch",
            ErrorKind::UnknownOperation => "UnknownOperation",
            ErrorKind::BatchFailure => "BatchFailure",
            ErrorKind::SetupFailure => "SetupFailure",
            ErrorKind::TeardownFailure => "TeardownFailure",
            ErrorKind::InvalidInput => "InvalidInput",
            ErrorKind::Io => "IO",
        };
        write!(f, "{}", s)
    }
}

impl E2eError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            E2eError::NotFound(_) => ErrorKind::NotFound,
            E2eError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            E2eError::Conflict(_) => ErrorKind::Conflict,
            E2eError::RetryableApi(_) => ErrorKind::RetryableApi,
            E2eError::Api(_) => ErrorKind::Api,
            E2eError::Timeout { .. } | E2eError::BudgetExceeded(_) => ErrorKind::Timeout,
            E2eError::Backend { .. } => ErrorKind::BackendError,
            E2eError::MalformedOutput { .. } | E2eError::Yaml(_) | E2eError::Json(_) => {
                ErrorKind::MalformedOutput
            }
            E2eError::ClusterMismatch(_) => ErrorKind::ClusterMismatch,
            E2eError::UnknownOperation(_) => ErrorKind::UnknownOperation,
            E2eError::BatchFailed { .. } => ErrorKind::BatchFailure,
            E2eError::Setup(_) => ErrorKind::SetupFailure,
            E2eError::Teardown(_) => ErrorKind::TeardownFailure,
            E2eError::Manifest { .. } | E2eError::InvalidObject(_) | E2eError::Config(_) => {
                ErrorKind::InvalidInput
            }
            E2eError::Io(_) => ErrorKind::Io,
        }
    }

    /// Whether the error is a transient API failure that a wait loop may absorb.
    pub fn is_retryable(&self) -> bool {
        matches!(self, E2eError::RetryableApi(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, E2eError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, E2eError::AlreadyExists(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, E2eError::Conflict(_))
    }

    /// Stderr captured from a failing backend command, looking through
    /// setup/teardown wrappers.
    pub fn captured_stderr(&self) -> Option<&str> {
        match self {
            E2eError::Backend { stderr, .. } => Some(stderr.as_str()),
            E2eError::Setup(inner) => inner.captured_stderr(),
            E2eError::Teardown(errors) => errors.iter().find_map(|e| e.captured_stderr()),
            _ => None,
        }
    }

    pub fn setup(inner: E2eError) -> Self {
        E2eError::Setup(Box::new(inner))
    }

    pub fn mismatch(msg: impl Into<String>) -> Self {
        E2eError::ClusterMismatch(msg.into())
    }

    pub fn malformed(command: impl Into<String>, reason: impl Into<String>) -> Self {
        E2eError::MalformedOutput {
            command: command.into(),
            reason: reason.into(),
        }
    }
}

fn join_errors(errors: &[E2eError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Whether a transport error message describes a transient condition.
pub fn is_transient_message(message: &str) -> bool {
    TRANSIENT_MESSAGES.iter().any(|m| message.contains(m))
}

/// Map an API status response to an error kind.
pub fn classify_status(code: u16, reason: &str, message: &str) -> E2eError {
    let msg = message.to_string();
    match (code, reason) {
        (404, _) | (_, "NotFound") => E2eError::NotFound(msg),
        (_, "AlreadyExists") => E2eError::AlreadyExists(msg),
        (409, _) | (_, "Conflict") => E2eError::Conflict(msg),
        (429 | 500 | 503 | 504, _)
        | (_, "Timeout" | "ServerTimeout" | "TooManyRequests" | "InternalError") => {
            E2eError::RetryableApi(msg)
        }
        _ if is_transient_message(message) => E2eError::RetryableApi(msg),
        _ => E2eError::Api(format!("{} ({}): {}", reason, code, message)),
    }
}

impl From<kube::Error> for E2eError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(resp) => classify_status(resp.code, &resp.reason, &resp.message),
            other => {
                let msg = other.to_string();
                if is_transient_message(&msg) {
                    E2eError::RetryableApi(msg)
                } else {
                    E2eError::Api(msg)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_not_found() {
        let err = classify_status(404, "NotFound", "pvcs \"x\" not found");
        assert!(err.is_not_found());
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_classify_conflict_vs_already_exists() {
        assert!(classify_status(409, "AlreadyExists", "exists").is_already_exists());
        assert!(classify_status(409, "Conflict", "modified").is_conflict());
    }

    #[test]
    fn test_classify_retryable_codes() {
        for code in [429u16, 500, 503, 504] {
            assert!(
                classify_status(code, "", "busy").is_retryable(),
                "code {} should be retryable",
                code
            );
        }
        assert!(classify_status(400, "ServerTimeout", "slow").is_retryable());
    }

    #[test]
    fn test_classify_transient_message() {
        let err = classify_status(400, "BadRequest", "etcdserver: request timed out");
        assert!(err.is_retryable());

        let err = classify_status(422, "Invalid", "spec.storageClassName: Invalid value");
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), ErrorKind::Api);
    }

    #[test]
    fn test_transient_messages() {
        assert!(is_transient_message("read: connection reset by peer"));
        assert!(is_transient_message("unexpected EOF"));
        assert!(is_transient_message("dial tcp: connection refused"));
        assert!(!is_transient_message("forbidden: user cannot list pods"));
    }

    #[test]
    fn test_captured_stderr_through_wrappers() {
        let inner = E2eError::Backend {
            command: "rbd ls".into(),
            stderr: "rbd: error opening pool".into(),
        };
        let wrapped = E2eError::setup(inner);
        assert_eq!(wrapped.kind(), ErrorKind::SetupFailure);
        assert_eq!(wrapped.captured_stderr(), Some("rbd: error opening pool"));
    }

    #[test]
    fn test_teardown_display_joins_errors() {
        let err = E2eError::Teardown(vec![
            E2eError::NotFound("a".into()),
            E2eError::mismatch("b"),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("not found: a"));
        assert!(msg.contains("cluster mismatch: b"));
    }

    #[test]
    fn test_timeout_display() {
        let err = E2eError::Timeout {
            what: "pvc bound".into(),
            elapsed: Duration::from_secs(42),
            last_state: "phase Pending".into(),
        };
        assert_eq!(
            err.to_string(),
            "timed out after 42s waiting for pvc bound (last state: phase Pending)"
        );
    }
}
