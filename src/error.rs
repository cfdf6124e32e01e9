//! Typed errors for the resource, collection, and agent layers.
//!
//! Library entry points return these so callers can tell a caller mistake
//! (validation, configuration) from a transient failure (git, I/O) and from
//! an agent-side failure. The CLI and server wrap them in `anyhow` or map
//! them onto HTTP status codes.

use std::io;
use std::path::PathBuf;

/// A value rejected before it could reach a process spawn or filesystem call.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid {field}: {reason}")]
pub struct ValidationError {
    pub field: &'static str,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Failures while making a resource available on disk.
#[derive(thiserror::Error, Debug)]
pub enum ResourceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("resource not configured: {0}")]
    NotConfigured(String),

    #[error("resource '{name}' not found at {}", path.display())]
    NotFound { name: String, path: PathBuf },

    #[error("git {operation} failed for '{name}' (code={code:?}): {stderr}")]
    Git {
        name: String,
        operation: &'static str,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{operation} failed for '{name}': {source}")]
    Io {
        name: String,
        operation: &'static str,
        #[source]
        source: io::Error,
    },
}

impl ResourceError {
    /// Whether re-invoking `ensure` may succeed without a configuration change.
    pub fn is_retryable(&self) -> bool {
        match self {
            ResourceError::Git { .. } => true,
            ResourceError::Io { source, .. } => source.kind() != io::ErrorKind::PermissionDenied,
            ResourceError::Validation(_)
            | ResourceError::NotConfigured(_)
            | ResourceError::NotFound { .. } => false,
        }
    }
}

/// Failures while assembling a collection workspace.
#[derive(thiserror::Error, Debug)]
pub enum CollectionError {
    #[error("at least one resource is required")]
    Empty,

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error("collection filesystem error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Failures of the external agent process or its session.
#[derive(thiserror::Error, Debug)]
pub enum AgentError {
    #[error("failed to spawn agent '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("agent did not start after {attempts} port attempts")]
    PortExhausted { attempts: u32 },

    #[error("agent startup failed: {0}")]
    Startup(String),

    #[error("agent request failed: {0}")]
    Http(String),

    #[error("agent reported {name}: {message}")]
    Provider { name: String, message: String },

    #[error("agent event stream closed before completion")]
    StreamClosed,
}

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        AgentError::Http(err.to_string())
    }
}

/// Failures of the ask pipeline as a whole.
#[derive(thiserror::Error, Debug)]
pub enum AskError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("thread not found: {0}")]
    ThreadNotFound(String),

    #[error(transparent)]
    Collection(#[from] CollectionError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("thread store error: {0:#}")]
    Store(anyhow::Error),
}

impl AskError {
    /// Whether the request itself was at fault rather than a dependency.
    pub fn is_caller_error(&self) -> bool {
        match self {
            AskError::Validation(_) => true,
            AskError::Collection(CollectionError::Empty | CollectionError::Validation(_)) => true,
            AskError::Collection(CollectionError::Resource(err)) => matches!(
                err,
                ResourceError::Validation(_)
                    | ResourceError::NotConfigured(_)
                    | ResourceError::NotFound { .. }
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_displays_field_and_reason() {
        let err = ValidationError::new("branch", "must not start with '-'");
        assert_eq!(err.to_string(), "invalid branch: must not start with '-'");
    }

    #[test]
    fn git_failures_are_retryable() {
        let err = ResourceError::Git {
            name: "svelte".into(),
            operation: "fetch",
            code: Some(128),
            stderr: "could not resolve host".into(),
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("git fetch failed for 'svelte'"));
    }

    #[test]
    fn permission_errors_are_terminal() {
        let err = ResourceError::Io {
            name: "svelte".into(),
            operation: "create resource directory",
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn configuration_errors_are_terminal() {
        assert!(!ResourceError::NotConfigured("x".into()).is_retryable());
        let err: ResourceError = ValidationError::new("name", "empty").into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn ask_errors_classify_caller_mistakes() {
        let not_configured: AskError =
            CollectionError::from(ResourceError::NotConfigured("react".into())).into();
        assert!(not_configured.is_caller_error());
        assert!(AskError::from(CollectionError::Empty).is_caller_error());
        assert!(AskError::from(CollectionError::from(ValidationError::new("resources", "too long")))
            .is_caller_error());
        assert!(!AskError::from(AgentError::StreamClosed).is_caller_error());
        assert!(!AskError::ThreadNotFound("t".into()).is_caller_error());
    }

    #[test]
    fn provider_error_displays_name() {
        let err = AgentError::Provider {
            name: "ProviderModelNotFoundError".into(),
            message: "model gpt-x not found".into(),
        };
        assert_eq!(
            err.to_string(),
            "agent reported ProviderModelNotFoundError: model gpt-x not found"
        );
    }
}
