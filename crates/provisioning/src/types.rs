//! Shared value types for repository provisioning.
//!
//! Unlike the newtype identifiers in [`crate::identifiers`], these types carry
//! invariants (e.g. a [`BatchRequest`] never holds duplicate names) or drive
//! decisions in the provisioning workflow.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::{BranchName, CommitSha, OwnerName, ProjectName, ProvisionError, RepoName};

// ---------------------------------------------------------------------------
// REST addressing
// ---------------------------------------------------------------------------

/// HTTP method of a remote call. Used for logging and error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Delete,
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Get => f.write_str("GET"),
            Self::Post => f.write_str("POST"),
            Self::Delete => f.write_str("DELETE"),
        }
    }
}

/// Whether the repository owner is the authenticated user or an organization.
///
/// Only adapters care about this; it changes how [`Resource::Owner`] maps onto
/// a URL path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerKind {
    #[default]
    User,
    Organization,
}

/// The remote resource a GET/POST/DELETE is addressed to.
///
/// Paths beneath the resource (e.g. `"/repos"`, `"/git/refs"`) are passed
/// separately as the call's `sub_path`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resource {
    /// The session owner's collection of repositories.
    Owner,
    /// One repository belonging to the session owner.
    Repository(RepoName),
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Owner => f.write_str("owner"),
            Self::Repository(name) => write!(f, "repo:{name}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Workflow vocabulary
// ---------------------------------------------------------------------------

/// A step of the provisioning workflow, used to say where a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionStep {
    /// Batch-level listing of the owner's existing repositories.
    ListExisting,
    DeleteExisting,
    Create,
    ResolveDefaultBranch,
    CreateIntegrationBranch,
}

impl std::fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ListExisting => "list existing repositories",
            Self::DeleteExisting => "delete existing repository",
            Self::Create => "create repository",
            Self::ResolveDefaultBranch => "resolve default branch head",
            Self::CreateIntegrationBranch => "create integration branch",
        };
        f.write_str(s)
    }
}

/// What to do when a requested repository already exists remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// Delete the existing repository, then create it afresh.
    #[default]
    Replace,
    /// Fail the repository's task with [`ProvisionError::AlreadyExistsConflict`].
    Fail,
}

/// Batch-independent settings applied to every repository a supervisor creates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionSettings {
    /// Description sent with every create request.
    pub description: String,
    /// Branch the remote creates when it auto-initializes a repository.
    pub default_branch: BranchName,
    /// Whether created repositories are private.
    pub private: bool,
    pub on_collision: CollisionPolicy,
}

impl Default for ProvisionSettings {
    fn default() -> Self {
        Self {
            description: "Repository provisioned as a test fixture".to_string(),
            default_branch: BranchName::main(),
            private: true,
            on_collision: CollisionPolicy::Replace,
        }
    }
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

/// One request to provision several repositories for the same owner.
///
/// Repository names are unique and kept in request order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    owner: OwnerName,
    repo_names: Vec<RepoName>,
    integration_branch: BranchName,
}

impl BatchRequest {
    /// Creates a batch request.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::InvalidBatch`] if `repo_names` is empty or
    /// contains the same name twice.
    pub fn new(
        owner: OwnerName,
        repo_names: Vec<RepoName>,
        integration_branch: BranchName,
    ) -> Result<Self, ProvisionError> {
        if repo_names.is_empty() {
            return Err(ProvisionError::InvalidBatch {
                reason: "no repositories requested".to_string(),
            });
        }
        let mut seen = HashSet::with_capacity(repo_names.len());
        for name in &repo_names {
            if !seen.insert(name) {
                return Err(ProvisionError::InvalidBatch {
                    reason: format!("repository '{name}' requested more than once"),
                });
            }
        }
        Ok(Self {
            owner,
            repo_names,
            integration_branch,
        })
    }

    /// Creates the batch for a project's repository bundle.
    ///
    /// Each suffix becomes a repository named `"{project}.{suffix}"`, so
    /// project `foo_app` with suffixes `["docs", "svc"]` yields
    /// `foo_app.docs` and `foo_app.svc`.
    ///
    /// # Errors
    ///
    /// Same as [`BatchRequest::new`]; a blank suffix is also rejected.
    pub fn for_project<S: AsRef<str>>(
        owner: OwnerName,
        project: &ProjectName,
        suffixes: &[S],
        integration_branch: BranchName,
    ) -> Result<Self, ProvisionError> {
        let names = suffixes
            .iter()
            .map(|suffix| {
                let suffix = suffix.as_ref().trim();
                if suffix.is_empty() {
                    return Err(ProvisionError::InvalidBatch {
                        reason: format!("blank repository suffix in project '{project}'"),
                    });
                }
                RepoName::new(format!("{project}.{suffix}")).ok_or_else(|| {
                    ProvisionError::InvalidBatch {
                        reason: format!("invalid repository suffix '{suffix}'"),
                    }
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(owner, names, integration_branch)
    }

    pub fn owner(&self) -> &OwnerName {
        &self.owner
    }

    /// Requested repositories, in request order.
    pub fn repo_names(&self) -> &[RepoName] {
        &self.repo_names
    }

    pub fn integration_branch(&self) -> &BranchName {
        &self.integration_branch
    }
}

// ---------------------------------------------------------------------------
// Per-task state
// ---------------------------------------------------------------------------

/// Progress record for one repository's provisioning workflow.
///
/// Lives only as long as the task that owns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoDescriptor {
    pub name: RepoName,
    /// Whether the repository appeared in the batch's one listing call.
    pub pre_existing: bool,
    /// Head of the default branch, once resolved.
    pub default_branch_sha: Option<CommitSha>,
    pub integration_branch: BranchName,
}

impl RepoDescriptor {
    /// Starts a descriptor for `name`, checking membership in the batch's
    /// pre-existing set. `existing` holds [`RepoName::folded`] names.
    pub fn new(
        name: RepoName,
        existing: &HashSet<RepoName>,
        integration_branch: BranchName,
    ) -> Self {
        let pre_existing = existing.contains(&name.folded());
        Self {
            name,
            pre_existing,
            default_branch_sha: None,
            integration_branch,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> OwnerName {
        OwnerName::new("acme").unwrap()
    }

    fn branch() -> BranchName {
        BranchName::new("dev-integ").unwrap()
    }

    fn names(list: &[&str]) -> Vec<RepoName> {
        list.iter().map(|n| RepoName::new(*n).unwrap()).collect()
    }

    #[test]
    fn batch_keeps_request_order() {
        let batch = BatchRequest::new(owner(), names(&["beta", "alpha"]), branch()).unwrap();
        assert_eq!(batch.repo_names(), names(&["beta", "alpha"]).as_slice());
    }

    #[test]
    fn batch_rejects_duplicates_and_empty_lists() {
        let dup = BatchRequest::new(owner(), names(&["alpha", "alpha"]), branch());
        assert!(matches!(dup, Err(ProvisionError::InvalidBatch { .. })));

        let empty = BatchRequest::new(owner(), Vec::new(), branch());
        assert!(matches!(empty, Err(ProvisionError::InvalidBatch { .. })));
    }

    #[test]
    fn project_batch_derives_dotted_names() {
        let project = ProjectName::new("foo_app").unwrap();
        let batch =
            BatchRequest::for_project(owner(), &project, &["docs", "svc"], branch()).unwrap();
        assert_eq!(
            batch.repo_names(),
            names(&["foo_app.docs", "foo_app.svc"]).as_slice()
        );

        let blank = BatchRequest::for_project(owner(), &project, &["docs", " "], branch());
        assert!(matches!(blank, Err(ProvisionError::InvalidBatch { .. })));
    }

    #[test]
    fn descriptor_records_pre_existence() {
        let existing: HashSet<RepoName> = names(&["alpha"]).into_iter().collect();
        let alpha = RepoDescriptor::new(RepoName::new("alpha").unwrap(), &existing, branch());
        let beta = RepoDescriptor::new(RepoName::new("beta").unwrap(), &existing, branch());
        assert!(alpha.pre_existing);
        assert!(!beta.pre_existing);
        assert!(beta.default_branch_sha.is_none());

        let upper = RepoDescriptor::new(RepoName::new("ALPHA").unwrap(), &existing, branch());
        assert!(upper.pre_existing);
        assert_eq!(upper.name.as_str(), "ALPHA");
    }
}
