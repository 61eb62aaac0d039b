//! GitHub infrastructure adapter.
//!
//! Implements the [`provisioning::RestClient`] and [`provisioning::RestSession`]
//! ports over the GitHub REST API using `reqwest`.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** This crate must not contain domain rules.
//! All GitHub API details (authentication, pagination, status mapping, rate
//! limit headers) are handled here; the [`provisioning`] crate never sees them.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`client`] | `GithubClient`, `GithubSession`, `GithubClientConfig` |
//! | [`errors`] | `GithubError` for client construction |

pub mod client;
pub mod errors;

pub use client::{
    GithubClient, GithubClientConfig, GithubSession, DEFAULT_API_URL, DEFAULT_USER_AGENT,
};
pub use errors::GithubError;
