//! Error and retry-policy types for repository provisioning.
//!
//! [`RemoteError`] is what a REST-client adapter reports for a failed call;
//! it is typed by [`RemoteErrorKind`] rather than by raw status code.
//! [`ProvisionError`] is what the provisioner and supervisor report to their
//! caller, and always identifies the step (and, where one applies, the
//! repository) that failed.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::collector::TaskPanic;
use crate::{HttpMethod, ProvisionStep, RepoName};

// ---------------------------------------------------------------------------
// Retry semantics
// ---------------------------------------------------------------------------

/// Whether an error condition is safe to retry and, if so, after what delay.
///
/// The provisioning core never retries on its own; the policy is logged
/// alongside failures so an operator (or a transport layer) can decide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// The operation may be retried.
    Retryable {
        /// Minimum back-off before the next attempt. `None` means retry
        /// immediately or apply the caller's own back-off schedule.
        after: Option<Duration>,
    },
    /// The operation must not be retried without human intervention.
    NonRetryable,
}

// ---------------------------------------------------------------------------
// Remote (port-level) errors
// ---------------------------------------------------------------------------

/// Category of a failed remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    /// The addressed resource does not exist.
    NotFound,
    /// The request conflicts with current remote state (e.g. name taken).
    Conflict,
    /// Credentials are missing, invalid, or lack the required scope.
    Unauthorized,
    /// The remote throttled the caller.
    RateLimited,
    /// Any other client-side rejection.
    Rejected,
    /// The remote failed to process a valid request.
    ServerError,
    /// The request never produced an HTTP response (DNS, TLS, timeout).
    Transport,
    /// A response arrived but its body could not be interpreted.
    InvalidResponse,
    /// The call was issued on a session that was already closed.
    SessionClosed,
}

impl std::fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotFound => "not found",
            Self::Conflict => "conflict",
            Self::Unauthorized => "unauthorized",
            Self::RateLimited => "rate limited",
            Self::Rejected => "rejected",
            Self::ServerError => "server error",
            Self::Transport => "transport failure",
            Self::InvalidResponse => "invalid response",
            Self::SessionClosed => "session closed",
        };
        f.write_str(s)
    }
}

/// A failed GET/POST/DELETE against the remote API.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{method} {path} failed ({kind}): {message}")]
pub struct RemoteError {
    /// Category of the failure.
    pub kind: RemoteErrorKind,
    /// Method of the failed request.
    pub method: HttpMethod,
    /// Request path relative to the API root.
    pub path: String,
    /// Human-readable detail, usually the remote's own error message.
    pub message: String,
    /// Delay requested by the remote before trying again, if any.
    pub retry_after: Option<Duration>,
}

impl RemoteError {
    /// Creates a [`RemoteError`] with no retry hint.
    pub fn new(
        kind: RemoteErrorKind,
        method: HttpMethod,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            method,
            path: path.into(),
            message: message.into(),
            retry_after: None,
        }
    }

    /// Attaches the remote's requested back-off.
    #[must_use]
    pub fn with_retry_after(mut self, after: Option<Duration>) -> Self {
        self.retry_after = after;
        self
    }

    /// Returns whether the failed call may be retried.
    ///
    /// Throttling, server errors and transport failures are transient;
    /// everything else needs the remote state or the request to change first.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self.kind {
            RemoteErrorKind::RateLimited
            | RemoteErrorKind::ServerError
            | RemoteErrorKind::Transport => RetryPolicy::Retryable {
                after: self.retry_after,
            },
            _ => RetryPolicy::NonRetryable,
        }
    }
}

// ---------------------------------------------------------------------------
// Provisioning errors
// ---------------------------------------------------------------------------

/// Which end of the session lifecycle failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Open,
    Close,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => f.write_str("open"),
            Self::Close => f.write_str("close"),
        }
    }
}

/// Errors that fail a provisioning task or a whole batch.
///
/// The first one raised by any task in a batch is the one the supervisor
/// returns; [`ProvisionError::repo`] and [`ProvisionError::step`] identify
/// where it originated.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// A repository expected to be absent already exists and the collision
    /// policy forbids replacing it.
    #[error("Repository '{repo}' already exists and collisions are configured to fail")]
    AlreadyExistsConflict { repo: RepoName },

    /// A remote call returned an error.
    #[error("{step} failed for {}: {source}", display_repo(.repo.as_ref()))]
    RemoteOperationFailed {
        /// Repository being provisioned; `None` for batch-level calls.
        repo: Option<RepoName>,
        step: ProvisionStep,
        #[source]
        source: RemoteError,
    },

    /// Remote state contradicts a guarantee an earlier step relied on.
    ///
    /// Produced when the default branch is missing from a freshly created,
    /// auto-initialized repository.
    #[error("Invariant violated during {step} for '{repo}': {detail}")]
    InvariantViolation {
        repo: RepoName,
        step: ProvisionStep,
        detail: String,
    },

    /// A remote call succeeded but its payload did not have the expected shape.
    #[error("Unexpected response during {step} for {}: {detail}", display_repo(.repo.as_ref()))]
    MalformedResponse {
        repo: Option<RepoName>,
        step: ProvisionStep,
        detail: String,
    },

    /// The shared client session could not be opened or closed.
    #[error("Failed to {phase} the API session: {source}")]
    SessionError {
        phase: SessionPhase,
        #[source]
        source: RemoteError,
    },

    /// The batch request itself is unusable.
    #[error("Invalid batch: {reason}")]
    InvalidBatch { reason: String },

    /// A provisioning task panicked instead of returning.
    #[error("Provisioning task panicked: {message}")]
    TaskPanicked { message: String },
}

fn display_repo(repo: Option<&RepoName>) -> String {
    match repo {
        Some(r) => format!("'{r}'"),
        None => "the batch".to_string(),
    }
}

impl ProvisionError {
    /// Returns the repository whose workflow raised this error, if any.
    pub fn repo(&self) -> Option<&RepoName> {
        match self {
            Self::AlreadyExistsConflict { repo } | Self::InvariantViolation { repo, .. } => {
                Some(repo)
            }
            Self::RemoteOperationFailed { repo, .. } | Self::MalformedResponse { repo, .. } => {
                repo.as_ref()
            }
            Self::SessionError { .. } | Self::InvalidBatch { .. } | Self::TaskPanicked { .. } => {
                None
            }
        }
    }

    /// Returns the workflow step that raised this error, if any.
    pub fn step(&self) -> Option<ProvisionStep> {
        match self {
            Self::AlreadyExistsConflict { .. } => Some(ProvisionStep::DeleteExisting),
            Self::RemoteOperationFailed { step, .. }
            | Self::InvariantViolation { step, .. }
            | Self::MalformedResponse { step, .. } => Some(*step),
            Self::SessionError { .. } | Self::InvalidBatch { .. } | Self::TaskPanicked { .. } => {
                None
            }
        }
    }

    /// Returns the underlying remote failure, if this error wraps one.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::RemoteOperationFailed { source, .. } | Self::SessionError { source, .. } => {
                Some(source)
            }
            _ => None,
        }
    }
}

impl From<TaskPanic> for ProvisionError {
    fn from(panic: TaskPanic) -> Self {
        Self::TaskPanicked {
            message: panic.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(kind: RemoteErrorKind) -> RemoteError {
        RemoteError::new(kind, HttpMethod::Post, "/user/repos", "boom")
    }

    #[test]
    fn transient_failures_are_retryable() {
        let err = remote(RemoteErrorKind::RateLimited)
            .with_retry_after(Some(Duration::from_secs(30)));
        assert_eq!(
            err.retry_policy(),
            RetryPolicy::Retryable {
                after: Some(Duration::from_secs(30))
            }
        );
        assert_eq!(
            remote(RemoteErrorKind::ServerError).retry_policy(),
            RetryPolicy::Retryable { after: None }
        );
    }

    #[test]
    fn client_rejections_are_not_retryable() {
        assert_eq!(
            remote(RemoteErrorKind::Conflict).retry_policy(),
            RetryPolicy::NonRetryable
        );
        assert_eq!(
            remote(RemoteErrorKind::Unauthorized).retry_policy(),
            RetryPolicy::NonRetryable
        );
    }

    #[test]
    fn provision_error_identifies_repo_and_step() {
        let repo = RepoName::new("beta").unwrap();
        let err = ProvisionError::RemoteOperationFailed {
            repo: Some(repo.clone()),
            step: ProvisionStep::Create,
            source: remote(RemoteErrorKind::Conflict),
        };
        assert_eq!(err.repo(), Some(&repo));
        assert_eq!(err.step(), Some(ProvisionStep::Create));
        assert!(err.to_string().contains("'beta'"));

        let listing = ProvisionError::RemoteOperationFailed {
            repo: None,
            step: ProvisionStep::ListExisting,
            source: remote(RemoteErrorKind::ServerError),
        };
        assert!(listing.repo().is_none());
        assert!(listing.to_string().contains("the batch"));
    }
}
