//! Construction-time errors for the GitHub adapter.
//!
//! Failures of individual API calls are reported as
//! [`provisioning::RemoteError`]; the errors here only cover building a
//! [`crate::GithubClient`] from its configuration.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GithubError {
    /// The token is empty or cannot be sent as a header value.
    #[error("GitHub token is missing or contains invalid characters")]
    InvalidToken,

    /// The configured user agent cannot be sent as a header value.
    #[error("Invalid user agent '{user_agent}'")]
    InvalidUserAgent { user_agent: String },

    /// The API base URL is not an absolute http(s) URL.
    #[error("Invalid GitHub API URL '{url}'")]
    InvalidApiUrl { url: String },

    /// The underlying HTTP client could not be built.
    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(#[from] reqwest::Error),
}
