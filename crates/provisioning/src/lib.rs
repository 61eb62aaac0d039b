//! Core domain for provisioning batches of remote repositories.
//!
//! This crate contains the provisioning workflow, the concurrency primitives it
//! is built on, and the port traits an infrastructure crate implements to
//! reach a real repository host. It performs no I/O of its own.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype identifiers (`RepoName`, `BranchName`, `ContextId`, etc.) |
//! | [`types`] | Shared value types (`BatchRequest`, `ProvisionSettings`, `Resource`, etc.) |
//! | [`errors`] | `RemoteError`, `ProvisionError` and `RetryPolicy` |
//! | [`context`] | `SchedulingContext`, the logical task-creation tree |
//! | [`collector`] | `ushering_to`, the fan-out/fan-in scope |
//! | [`client`] | `RestClient` / `RestSession` ports and an in-memory fake |
//! | [`provisioner`] | The per-repository workflow |
//! | [`supervisor`] | The batch orchestrator |

pub mod client;
pub mod collector;
pub mod context;
pub mod errors;
pub mod identifiers;
pub mod provisioner;
pub mod supervisor;
pub mod types;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use client::{RestClient, RestSession};
pub use collector::{ushering_to, TaskPanic, Usher};
pub use context::SchedulingContext;
pub use errors::{ProvisionError, RemoteError, RemoteErrorKind, RetryPolicy, SessionPhase};
pub use identifiers::{
    BatchRunId, BranchName, CommitSha, ContextId, OwnerName, ProjectName, RepoName,
};
pub use provisioner::RepoProvisioner;
pub use supervisor::ProvisioningSupervisor;
pub use types::{
    BatchRequest, CollisionPolicy, HttpMethod, OwnerKind, ProvisionSettings, ProvisionStep,
    RepoDescriptor, Resource,
};
