//! REST-client port consumed by the provisioning workflow.
//!
//! This module provides:
//!
//! - [`RestClient`]: opens authenticated sessions scoped to one owner
//! - [`RestSession`]: the GET/POST/DELETE capability shared by every task of
//!   a batch
//! - [`memory::InMemoryRestClient`]: an in-memory fake for tests
//!
//! Adapters surface failures as typed [`RemoteError`]s. Transport concerns
//! (auth headers, pagination, rate-limit parsing) stay inside the adapter.
//!
//! A session is shared by reference across concurrently running tasks, so it
//! must accept interleaved calls without serializing them.

pub mod memory;

use async_trait::async_trait;
use serde_json::Value;

use crate::{OwnerName, RemoteError, Resource, SchedulingContext};

/// Factory for [`RestSession`]s.
#[async_trait]
pub trait RestClient: Send + Sync {
    type Session: RestSession + 'static;

    /// Opens a session acting on behalf of `owner`.
    ///
    /// The caller must call [`RestSession::close`] on every exit path.
    async fn open(
        &self,
        ctx: &SchedulingContext,
        owner: &OwnerName,
    ) -> Result<Self::Session, RemoteError>;
}

/// An open, authenticated session with the remote API.
///
/// Every call takes the [`SchedulingContext`] of the step issuing it so
/// adapters can tag their own log records with the same label.
#[async_trait]
pub trait RestSession: Send + Sync {
    async fn get(
        &self,
        ctx: &SchedulingContext,
        resource: &Resource,
        sub_path: &str,
    ) -> Result<Value, RemoteError>;

    async fn post(
        &self,
        ctx: &SchedulingContext,
        resource: &Resource,
        sub_path: &str,
        body: Value,
    ) -> Result<Value, RemoteError>;

    async fn delete(
        &self,
        ctx: &SchedulingContext,
        resource: &Resource,
        sub_path: &str,
    ) -> Result<Value, RemoteError>;

    /// Ends the session. Calls issued afterwards fail with
    /// [`crate::RemoteErrorKind::SessionClosed`]; closing twice is a no-op.
    async fn close(&self, ctx: &SchedulingContext) -> Result<(), RemoteError>;
}
