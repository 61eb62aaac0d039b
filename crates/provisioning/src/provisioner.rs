//! Per-repository provisioning workflow.
//!
//! One [`RepoProvisioner::run`] call drives one repository through:
//!
//! 1. check the batch's pre-fetched set of existing names;
//! 2. delete the repository if it exists (or fail, per [`CollisionPolicy`]);
//! 3. create it with `auto_init` so the default branch has a first commit;
//! 4. list its branch references and resolve the default branch head;
//! 5. create the integration branch at that head.
//!
//! Any failed step ends the task. Every remote call runs under its own child
//! [`SchedulingContext`] and every step logs the remote response under that
//! context's label.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::client::RestSession;
use crate::{
    BranchName, CollisionPolicy, CommitSha, ProvisionError, ProvisionSettings, ProvisionStep,
    RemoteError, RemoteErrorKind, RepoDescriptor, RepoName, Resource, SchedulingContext,
};

const REPOS_PATH: &str = "/repos";
const BRANCH_REFS_PATH: &str = "/git/refs/heads";
const CREATE_REF_PATH: &str = "/git/refs";

/// Runs the provisioning workflow for single repositories.
///
/// Cloning is cheap: the session, the pre-existing set and the settings are
/// shared, never copied.
pub struct RepoProvisioner<S> {
    session: Arc<S>,
    existing: Arc<HashSet<RepoName>>,
    settings: Arc<ProvisionSettings>,
    integration_branch: BranchName,
}

impl<S> Clone for RepoProvisioner<S> {
    fn clone(&self) -> Self {
        Self {
            session: Arc::clone(&self.session),
            existing: Arc::clone(&self.existing),
            settings: Arc::clone(&self.settings),
            integration_branch: self.integration_branch.clone(),
        }
    }
}

impl<S> RepoProvisioner<S>
where
    S: RestSession + 'static,
{
    pub fn new(
        session: Arc<S>,
        existing: Arc<HashSet<RepoName>>,
        settings: Arc<ProvisionSettings>,
        integration_branch: BranchName,
    ) -> Self {
        Self {
            session,
            existing,
            settings,
            integration_branch,
        }
    }

    /// Provisions `name`, returning it on success.
    ///
    /// Consumes the provisioner so the returned future is `'static` and can be
    /// handed to a [`crate::collector::Usher`].
    pub async fn run(
        self,
        ctx: SchedulingContext,
        name: RepoName,
    ) -> Result<RepoName, ProvisionError> {
        let mut descriptor =
            RepoDescriptor::new(name, &self.existing, self.integration_branch.clone());
        match self.drive(&ctx, &mut descriptor).await {
            Ok(()) => {
                info!(
                    ctx = %ctx,
                    repo = %descriptor.name,
                    descriptor = ?descriptor,
                    "Repository provisioned"
                );
                Ok(descriptor.name)
            }
            Err(err) => {
                warn!(
                    ctx = %ctx,
                    repo = %descriptor.name,
                    step = ?err.step(),
                    retry = ?err.remote().map(RemoteError::retry_policy),
                    error = %err,
                    "Repository provisioning failed"
                );
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        ctx: &SchedulingContext,
        descriptor: &mut RepoDescriptor,
    ) -> Result<(), ProvisionError> {
        if descriptor.pre_existing {
            self.remove_existing(ctx, &descriptor.name).await?;
        }
        self.create(ctx, &descriptor.name).await?;
        let head = self.resolve_default_head(ctx, &descriptor.name).await?;
        descriptor.default_branch_sha = Some(head.clone());
        self.create_integration_branch(ctx, &descriptor.name, &head)
            .await
    }

    async fn remove_existing(
        &self,
        ctx: &SchedulingContext,
        name: &RepoName,
    ) -> Result<(), ProvisionError> {
        if self.settings.on_collision == CollisionPolicy::Fail {
            return Err(ProvisionError::AlreadyExistsConflict { repo: name.clone() });
        }
        let step_ctx = ctx.child();
        let response = self
            .session
            .delete(&step_ctx, &Resource::Repository(name.clone()), "")
            .await
            .map_err(remote_failure(name, ProvisionStep::DeleteExisting))?;
        info!(
            ctx = %step_ctx,
            repo = %name,
            response = %response,
            "Deleted pre-existing repository"
        );
        Ok(())
    }

    async fn create(&self, ctx: &SchedulingContext, name: &RepoName) -> Result<(), ProvisionError> {
        let step_ctx = ctx.child();
        let body = json!({
            "name": name.as_str(),
            "description": self.settings.description,
            "private": self.settings.private,
            "auto_init": true,
        });
        let response = self
            .session
            .post(&step_ctx, &Resource::Owner, REPOS_PATH, body)
            .await
            .map_err(remote_failure(name, ProvisionStep::Create))?;
        info!(
            ctx = %step_ctx,
            repo = %name,
            response = %response,
            "Created repository"
        );
        Ok(())
    }

    async fn resolve_default_head(
        &self,
        ctx: &SchedulingContext,
        name: &RepoName,
    ) -> Result<CommitSha, ProvisionError> {
        const STEP: ProvisionStep = ProvisionStep::ResolveDefaultBranch;
        let step_ctx = ctx.child();
        let default_ref = self.settings.default_branch.to_ref();
        let response = match self
            .session
            .get(&step_ctx, &Resource::Repository(name.clone()), BRANCH_REFS_PATH)
            .await
        {
            Ok(response) => response,
            // An auto-initialized repository is never empty; the remote says otherwise.
            Err(source) if source.kind == RemoteErrorKind::Conflict => {
                return Err(ProvisionError::InvariantViolation {
                    repo: name.clone(),
                    step: STEP,
                    detail: format!(
                        "repository has no commits after auto-initialized creation ({})",
                        source.message
                    ),
                });
            }
            Err(source) => return Err(remote_failure(name, STEP)(source)),
        };
        info!(
            ctx = %step_ctx,
            repo = %name,
            response = %response,
            "Listed branch references"
        );

        let refs: Vec<&Value> = match &response {
            Value::Array(items) => items.iter().collect(),
            Value::Object(_) => vec![&response],
            Value::Null => Vec::new(),
            other => {
                return Err(ProvisionError::MalformedResponse {
                    repo: Some(name.clone()),
                    step: STEP,
                    detail: format!("expected a list of references, got {other}"),
                })
            }
        };

        let Some(default) = refs
            .iter()
            .find(|r| r.get("ref").and_then(Value::as_str) == Some(default_ref.as_str()))
        else {
            return Err(ProvisionError::InvariantViolation {
                repo: name.clone(),
                step: STEP,
                detail: format!(
                    "no '{default_ref}' among {} branch reference(s) after auto-initialized creation",
                    refs.len()
                ),
            });
        };

        default
            .get("object")
            .and_then(|o| o.get("sha"))
            .and_then(Value::as_str)
            .and_then(CommitSha::new)
            .ok_or_else(|| ProvisionError::MalformedResponse {
                repo: Some(name.clone()),
                step: STEP,
                detail: format!("reference '{default_ref}' has no object sha"),
            })
    }

    async fn create_integration_branch(
        &self,
        ctx: &SchedulingContext,
        name: &RepoName,
        head: &CommitSha,
    ) -> Result<(), ProvisionError> {
        let step_ctx = ctx.child();
        let body = json!({
            "ref": self.integration_branch.to_ref(),
            "sha": head.as_str(),
        });
        let response = self
            .session
            .post(
                &step_ctx,
                &Resource::Repository(name.clone()),
                CREATE_REF_PATH,
                body,
            )
            .await
            .map_err(remote_failure(name, ProvisionStep::CreateIntegrationBranch))?;
        info!(
            ctx = %step_ctx,
            repo = %name,
            branch = %self.integration_branch,
            sha = %head,
            response = %response,
            "Created integration branch"
        );
        Ok(())
    }
}

fn remote_failure(
    repo: &RepoName,
    step: ProvisionStep,
) -> impl FnOnce(RemoteError) -> ProvisionError + '_ {
    move |source| ProvisionError::RemoteOperationFailed {
        repo: Some(repo.clone()),
        step,
        source,
    }
}
