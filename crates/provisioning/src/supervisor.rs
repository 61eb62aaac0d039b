//! Batch-level orchestration of repository provisioning.
//!
//! [`ProvisioningSupervisor::provision`] opens one session, lists the owner's
//! repositories once, and fans out one [`RepoProvisioner`] task per requested
//! name through [`ushering_to`]. All tasks share the session and the listing.
//!
//! Provisioning is not transactional: when a task fails, its siblings still
//! run to completion and whatever they created stays created. Re-running the
//! same batch converges because existing repositories are replaced.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use tracing::{info, info_span, warn, Instrument};

use crate::client::{RestClient, RestSession};
use crate::collector::ushering_to;
use crate::provisioner::RepoProvisioner;
use crate::{
    BatchRequest, BatchRunId, ProvisionError, ProvisionSettings, ProvisionStep, RepoName,
    Resource, SchedulingContext, SessionPhase,
};

const REPOS_PATH: &str = "/repos";

/// Provisions batches of repositories through a [`RestClient`].
pub struct ProvisioningSupervisor<C> {
    client: C,
    settings: Arc<ProvisionSettings>,
}

impl<C> ProvisioningSupervisor<C>
where
    C: RestClient,
{
    pub fn new(client: C, settings: ProvisionSettings) -> Self {
        Self {
            client,
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &ProvisionSettings {
        &self.settings
    }

    /// Provisions every repository in `batch`.
    ///
    /// Returns the names that were fully provisioned, in completion order
    /// (not request order).
    ///
    /// # Errors
    ///
    /// - [`ProvisionError::InvalidBatch`] if the integration branch is the
    ///   default branch.
    /// - [`ProvisionError::SessionError`] if the session cannot be opened, or
    ///   cannot be closed after an otherwise successful batch.
    /// - The first error raised by the listing call or by any repository
    ///   task, returned only after every task has finished.
    pub async fn provision(&self, batch: &BatchRequest) -> Result<Vec<RepoName>, ProvisionError> {
        if batch.integration_branch() == &self.settings.default_branch {
            return Err(ProvisionError::InvalidBatch {
                reason: format!(
                    "integration branch '{}' must differ from the default branch",
                    batch.integration_branch()
                ),
            });
        }

        let run_id = BatchRunId::new_random();
        let root = SchedulingContext::root();
        let span = info_span!(
            "provision_batch",
            run_id = %run_id,
            owner = %batch.owner(),
            ctx = %root,
        );
        self.provision_with_session(root, batch)
            .instrument(span)
            .await
    }

    async fn provision_with_session(
        &self,
        root: SchedulingContext,
        batch: &BatchRequest,
    ) -> Result<Vec<RepoName>, ProvisionError> {
        let open_ctx = root.child();
        let session = self
            .client
            .open(&open_ctx, batch.owner())
            .await
            .map_err(|source| ProvisionError::SessionError {
                phase: SessionPhase::Open,
                source,
            })?;
        info!(ctx = %open_ctx, owner = %batch.owner(), "Opened API session");
        let session = Arc::new(session);

        let outcome = self.fan_out(&root, Arc::clone(&session), batch).await;

        let close_ctx = root.child();
        let closed = session.close(&close_ctx).await;
        match (outcome, closed) {
            (Ok(provisioned), Ok(())) => {
                info!(
                    ctx = %close_ctx,
                    requested = batch.repo_names().len(),
                    provisioned = provisioned.len(),
                    "Batch provisioned"
                );
                Ok(provisioned)
            }
            (Ok(_), Err(source)) => Err(ProvisionError::SessionError {
                phase: SessionPhase::Close,
                source,
            }),
            (Err(err), Ok(())) => {
                warn!(ctx = %close_ctx, error = %err, "Batch failed");
                Err(err)
            }
            (Err(err), Err(close_err)) => {
                warn!(
                    ctx = %close_ctx,
                    error = %err,
                    close_error = %close_err,
                    "Batch failed and the API session did not close cleanly"
                );
                Err(err)
            }
        }
    }

    async fn fan_out(
        &self,
        root: &SchedulingContext,
        session: Arc<C::Session>,
        batch: &BatchRequest,
    ) -> Result<Vec<RepoName>, ProvisionError> {
        let list_ctx = root.child();
        let listing = session
            .get(&list_ctx, &Resource::Owner, REPOS_PATH)
            .await
            .map_err(|source| ProvisionError::RemoteOperationFailed {
                repo: None,
                step: ProvisionStep::ListExisting,
                source,
            })?;
        let existing = existing_names(&listing)?;
        let colliding: Vec<&str> = batch
            .repo_names()
            .iter()
            .filter(|name| existing.contains(&name.folded()))
            .map(RepoName::as_str)
            .collect();
        info!(
            ctx = %list_ctx,
            existing = existing.len(),
            colliding = ?colliding,
            "Listed existing repositories"
        );

        let provisioner = RepoProvisioner::new(
            session,
            Arc::new(existing),
            Arc::clone(&self.settings),
            batch.integration_branch().clone(),
        );
        let names = batch.repo_names().to_vec();
        let root = root.clone();

        let mut provisioned = Vec::with_capacity(names.len());
        ushering_to(&mut provisioned, |mut usher| async move {
            for name in names {
                let task_ctx = root.child();
                let span = info_span!("provision_repo", repo = %name, ctx = %task_ctx);
                usher += provisioner.clone().run(task_ctx, name).instrument(span);
            }
            Ok(())
        })
        .await?;
        Ok(provisioned)
    }
}

/// Extracts repository names from a listing response, folded to lowercase
/// because the remote treats names case-insensitively.
///
/// A `null` body means the owner has no repositories.
fn existing_names(listing: &Value) -> Result<HashSet<RepoName>, ProvisionError> {
    let malformed = |detail: String| ProvisionError::MalformedResponse {
        repo: None,
        step: ProvisionStep::ListExisting,
        detail,
    };
    match listing {
        Value::Null => Ok(HashSet::new()),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.get("name")
                    .and_then(Value::as_str)
                    .and_then(RepoName::new)
                    .map(|name| name.folded())
                    .ok_or_else(|| malformed(format!("repository entry without a name: {item}")))
            })
            .collect(),
        other => Err(malformed(format!("expected a list of repositories, got {other}"))),
    }
}
