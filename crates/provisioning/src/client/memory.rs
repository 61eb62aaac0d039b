//! In-memory REST client for testing.
//!
//! This module provides [`InMemoryRestClient`], a fake implementation of the
//! [`RestClient`] / [`RestSession`] port that models just enough of a
//! repository-hosting API for the provisioning workflow:
//!
//! | Call | Effect |
//! |------|--------|
//! | `GET owner /repos` | lists repositories as `[{"name": ...}]` |
//! | `POST owner /repos` | creates a repository; with `auto_init` it gets a default branch |
//! | `DELETE repo ""` | deletes the repository, returns `null` |
//! | `GET repo /git/refs/heads` | lists `[{"ref": "refs/heads/..", "object": {"sha": ..}}]` |
//! | `POST repo /git/refs` | creates a branch reference from `{"ref", "sha"}` |
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: no persistence, no authentication
//! - **Single owner**: the owner passed to `open` is recorded but not used
//!   to partition state

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{RestClient, RestSession};
use crate::{
    BranchName, HttpMethod, OwnerName, RemoteError, RemoteErrorKind, Resource, SchedulingContext,
};

/// One call observed by the fake, in the order it took effect.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub method: HttpMethod,
    pub resource: Resource,
    pub sub_path: String,
    pub body: Option<Value>,
    /// Label of the [`SchedulingContext`] the caller passed.
    pub ctx_label: String,
}

impl RecordedCall {
    /// Returns `true` if this call addressed `repo`.
    pub fn targets(&self, repo: &str) -> bool {
        matches!(&self.resource, Resource::Repository(name) if name.as_str() == repo)
    }
}

#[derive(Debug, Clone)]
struct InjectedFailure {
    method: HttpMethod,
    resource: Resource,
    sub_path: String,
    kind: RemoteErrorKind,
}

#[derive(Debug, Default)]
struct State {
    /// Repository name → branch name → head SHA.
    repos: BTreeMap<String, BTreeMap<String, String>>,
    calls: Vec<RecordedCall>,
    failures: Vec<InjectedFailure>,
    skip_auto_init: HashSet<String>,
    latency: HashMap<String, Duration>,
    open_failure: Option<RemoteErrorKind>,
    sessions_opened: usize,
    sessions_closed: usize,
}

#[derive(Debug)]
struct Shared {
    default_branch: BranchName,
    head_sha: String,
    state: Mutex<State>,
}

impl State {
    /// Stored key of `name`; the remote matches repository names ignoring
    /// ASCII case.
    fn repo_key(&self, name: &str) -> Option<String> {
        self.repos
            .keys()
            .find(|key| key.eq_ignore_ascii_case(name))
            .cloned()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory fake of a repository-hosting REST API.
///
/// Clones share state, so a test can keep one handle for assertions while the
/// supervisor owns another.
///
/// ## Example
///
/// ```rust
/// use provisioning::client::memory::InMemoryRestClient;
///
/// let client = InMemoryRestClient::new().with_existing(["alpha"]);
/// assert!(client.repo_exists("alpha"));
/// ```
#[derive(Debug, Clone)]
pub struct InMemoryRestClient {
    shared: Arc<Shared>,
}

impl Default for InMemoryRestClient {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRestClient {
    /// Creates an empty fake whose auto-initialized repositories get a `main`
    /// branch at `abc123`.
    pub fn new() -> Self {
        Self::with_head(BranchName::main(), "abc123")
    }

    /// Creates an empty fake whose auto-initialized repositories get
    /// `default_branch` at `head_sha`.
    pub fn with_head(default_branch: BranchName, head_sha: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                default_branch,
                head_sha: head_sha.into(),
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Seeds repositories that exist before any session is opened.
    #[must_use]
    pub fn with_existing<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        {
            let mut state = self.shared.lock();
            for name in names {
                let mut branches = BTreeMap::new();
                branches.insert(
                    self.shared.default_branch.to_string(),
                    "0000000".to_string(),
                );
                state.repos.insert(name.into(), branches);
            }
        }
        self
    }

    /// Makes creation of `repo` ignore `auto_init`, leaving it without any
    /// branch.
    #[must_use]
    pub fn without_auto_init(self, repo: &str) -> Self {
        self.shared.lock().skip_auto_init.insert(repo.to_string());
        self
    }

    /// Delays every call addressed to `repo` by `delay`.
    #[must_use]
    pub fn with_latency(self, repo: &str, delay: Duration) -> Self {
        self.shared.lock().latency.insert(repo.to_string(), delay);
        self
    }

    /// Makes every matching call fail with `kind` instead of taking effect.
    #[must_use]
    pub fn failing(
        self,
        method: HttpMethod,
        resource: Resource,
        sub_path: &str,
        kind: RemoteErrorKind,
    ) -> Self {
        self.shared.lock().failures.push(InjectedFailure {
            method,
            resource,
            sub_path: sub_path.to_string(),
            kind,
        });
        self
    }

    /// Makes [`RestClient::open`] fail with `kind`.
    #[must_use]
    pub fn failing_open(self, kind: RemoteErrorKind) -> Self {
        self.shared.lock().open_failure = Some(kind);
        self
    }

    /// Every call that reached the fake, in the order it took effect.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.shared.lock().calls.clone()
    }

    /// Calls that addressed `repo`, in order.
    pub fn calls_for(&self, repo: &str) -> Vec<RecordedCall> {
        self.calls().into_iter().filter(|c| c.targets(repo)).collect()
    }

    pub fn repo_exists(&self, repo: &str) -> bool {
        self.shared.lock().repo_key(repo).is_some()
    }

    /// Head SHA of `branch` in `repo`, if both exist.
    pub fn branch_head(&self, repo: &str, branch: &str) -> Option<String> {
        let state = self.shared.lock();
        let key = state.repo_key(repo)?;
        state.repos.get(&key)?.get(branch).cloned()
    }

    pub fn sessions_opened(&self) -> usize {
        self.shared.lock().sessions_opened
    }

    pub fn sessions_closed(&self) -> usize {
        self.shared.lock().sessions_closed
    }
}

#[async_trait]
impl RestClient for InMemoryRestClient {
    type Session = InMemorySession;

    async fn open(
        &self,
        _ctx: &SchedulingContext,
        owner: &OwnerName,
    ) -> Result<InMemorySession, RemoteError> {
        let mut state = self.shared.lock();
        if let Some(kind) = state.open_failure {
            return Err(RemoteError::new(
                kind,
                HttpMethod::Get,
                "/user",
                "session refused",
            ));
        }
        state.sessions_opened += 1;
        Ok(InMemorySession {
            shared: Arc::clone(&self.shared),
            owner: owner.clone(),
            closed: AtomicBool::new(false),
        })
    }
}

/// Session handed out by [`InMemoryRestClient`].
#[derive(Debug)]
pub struct InMemorySession {
    shared: Arc<Shared>,
    owner: OwnerName,
    closed: AtomicBool,
}

impl InMemorySession {
    pub fn owner(&self) -> &OwnerName {
        &self.owner
    }

    async fn call(
        &self,
        ctx: &SchedulingContext,
        method: HttpMethod,
        resource: &Resource,
        sub_path: &str,
        body: Option<Value>,
    ) -> Result<Value, RemoteError> {
        let path = format!("{resource}{sub_path}");
        if self.closed.load(Ordering::Acquire) {
            return Err(RemoteError::new(
                RemoteErrorKind::SessionClosed,
                method,
                path,
                "session already closed",
            ));
        }

        let delay = match resource {
            Resource::Repository(name) => self.shared.lock().latency.get(name.as_str()).copied(),
            Resource::Owner => None,
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.shared.lock();
        state.calls.push(RecordedCall {
            method,
            resource: resource.clone(),
            sub_path: sub_path.to_string(),
            body: body.clone(),
            ctx_label: ctx.label(),
        });

        let injected = state.failures.iter().find(|f| {
            f.method == method && &f.resource == resource && f.sub_path == sub_path
        });
        if let Some(failure) = injected {
            return Err(RemoteError::new(failure.kind, method, path, "injected failure"));
        }

        let not_found = |path: String| {
            RemoteError::new(RemoteErrorKind::NotFound, method, path, "Not Found")
        };

        match (method, resource, sub_path) {
            (HttpMethod::Get, Resource::Owner, "/repos") => Ok(Value::Array(
                state
                    .repos
                    .keys()
                    .map(|name| json!({ "name": name }))
                    .collect(),
            )),
            (HttpMethod::Post, Resource::Owner, "/repos") => {
                let body = body.unwrap_or(Value::Null);
                let Some(name) = body.get("name").and_then(Value::as_str) else {
                    return Err(RemoteError::new(
                        RemoteErrorKind::Rejected,
                        method,
                        path,
                        "name is required",
                    ));
                };
                if state.repo_key(name).is_some() {
                    return Err(RemoteError::new(
                        RemoteErrorKind::Conflict,
                        method,
                        path,
                        "name already exists on this account",
                    ));
                }
                let auto_init = body
                    .get("auto_init")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let mut branches = BTreeMap::new();
                if auto_init && !state.skip_auto_init.contains(name) {
                    branches.insert(
                        self.shared.default_branch.to_string(),
                        self.shared.head_sha.clone(),
                    );
                }
                state.repos.insert(name.to_string(), branches);
                Ok(json!({
                    "name": name,
                    "full_name": format!("{}/{}", self.owner, name),
                    "default_branch": self.shared.default_branch.as_str(),
                }))
            }
            (HttpMethod::Delete, Resource::Repository(name), "") => {
                match state.repo_key(name.as_str()) {
                    Some(key) => {
                        state.repos.remove(&key);
                        Ok(Value::Null)
                    }
                    None => Err(not_found(path)),
                }
            }
            (HttpMethod::Get, Resource::Repository(name), "/git/refs/heads") => {
                let Some(branches) = state
                    .repo_key(name.as_str())
                    .and_then(|key| state.repos.get(&key))
                else {
                    return Err(not_found(path));
                };
                Ok(Value::Array(
                    branches
                        .iter()
                        .map(|(branch, sha)| {
                            json!({
                                "ref": format!("refs/heads/{branch}"),
                                "object": { "sha": sha, "type": "commit" },
                            })
                        })
                        .collect(),
                ))
            }
            (HttpMethod::Post, Resource::Repository(name), "/git/refs") => {
                let body = body.unwrap_or(Value::Null);
                let reference = body.get("ref").and_then(Value::as_str);
                let sha = body.get("sha").and_then(Value::as_str);
                let (Some(reference), Some(sha)) = (reference, sha) else {
                    return Err(RemoteError::new(
                        RemoteErrorKind::Rejected,
                        method,
                        path,
                        "ref and sha are required",
                    ));
                };
                let Some(branch) = reference.strip_prefix("refs/heads/") else {
                    return Err(RemoteError::new(
                        RemoteErrorKind::Rejected,
                        method,
                        path,
                        "only branch references are supported",
                    ));
                };
                let Some(key) = state.repo_key(name.as_str()) else {
                    return Err(not_found(path));
                };
                let Some(branches) = state.repos.get_mut(&key) else {
                    return Err(not_found(path));
                };
                if branches.contains_key(branch) {
                    return Err(RemoteError::new(
                        RemoteErrorKind::Conflict,
                        method,
                        path,
                        "Reference already exists",
                    ));
                }
                branches.insert(branch.to_string(), sha.to_string());
                Ok(json!({ "ref": reference, "object": { "sha": sha, "type": "commit" } }))
            }
            _ => Err(not_found(path)),
        }
    }
}

#[async_trait]
impl RestSession for InMemorySession {
    async fn get(
        &self,
        ctx: &SchedulingContext,
        resource: &Resource,
        sub_path: &str,
    ) -> Result<Value, RemoteError> {
        self.call(ctx, HttpMethod::Get, resource, sub_path, None).await
    }

    async fn post(
        &self,
        ctx: &SchedulingContext,
        resource: &Resource,
        sub_path: &str,
        body: Value,
    ) -> Result<Value, RemoteError> {
        self.call(ctx, HttpMethod::Post, resource, sub_path, Some(body))
            .await
    }

    async fn delete(
        &self,
        ctx: &SchedulingContext,
        resource: &Resource,
        sub_path: &str,
    ) -> Result<Value, RemoteError> {
        self.call(ctx, HttpMethod::Delete, resource, sub_path, None)
            .await
    }

    async fn close(&self, _ctx: &SchedulingContext) -> Result<(), RemoteError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shared.lock().sessions_closed += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RepoName;

    fn repo(name: &str) -> Resource {
        Resource::Repository(RepoName::new(name).unwrap())
    }

    async fn session(client: &InMemoryRestClient) -> InMemorySession {
        client
            .open(&SchedulingContext::root(), &OwnerName::new("acme").unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_with_auto_init_yields_default_branch() {
        let client = InMemoryRestClient::new();
        let session = session(&client).await;
        let ctx = SchedulingContext::root();

        session
            .post(&ctx, &Resource::Owner, "/repos", json!({"name": "alpha", "auto_init": true}))
            .await
            .unwrap();
        let refs = session.get(&ctx, &repo("alpha"), "/git/refs/heads").await.unwrap();

        assert_eq!(refs[0]["ref"], "refs/heads/main");
        assert_eq!(refs[0]["object"]["sha"], "abc123");
    }

    #[tokio::test]
    async fn duplicate_create_conflicts() {
        let client = InMemoryRestClient::new().with_existing(["alpha"]);
        let session = session(&client).await;
        let err = session
            .post(
                &SchedulingContext::root(),
                &Resource::Owner,
                "/repos",
                json!({"name": "alpha"}),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::Conflict);
    }

    #[tokio::test]
    async fn injected_failure_is_recorded_but_has_no_effect() {
        let client = InMemoryRestClient::new().with_existing(["alpha"]).failing(
            HttpMethod::Delete,
            repo("alpha"),
            "",
            RemoteErrorKind::ServerError,
        );
        let session = session(&client).await;
        let err = session
            .delete(&SchedulingContext::root(), &repo("alpha"), "")
            .await
            .unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::ServerError);
        assert!(client.repo_exists("alpha"));
        assert_eq!(client.calls_for("alpha").len(), 1);
    }

    #[tokio::test]
    async fn closed_session_rejects_calls() {
        let client = InMemoryRestClient::new();
        let session = session(&client).await;
        let ctx = SchedulingContext::root();
        session.close(&ctx).await.unwrap();
        session.close(&ctx).await.unwrap();

        let err = session.get(&ctx, &Resource::Owner, "/repos").await.unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::SessionClosed);
        assert_eq!(client.sessions_opened(), 1);
        assert_eq!(client.sessions_closed(), 1);
    }
}
