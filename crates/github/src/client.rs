//! `reqwest`-backed implementation of the provisioning REST-client port.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, RETRY_AFTER, USER_AGENT,
};
use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, info};

use provisioning::{
    HttpMethod, OwnerKind, OwnerName, RemoteError, RemoteErrorKind, Resource, RestClient,
    RestSession, SchedulingContext,
};

use crate::GithubError;

/// Public GitHub REST API root.
pub const DEFAULT_API_URL: &str = "https://api.github.com";

/// User agent sent when none is configured.
pub const DEFAULT_USER_AGENT: &str = concat!("provision-repos/", env!("CARGO_PKG_VERSION"));

const API_VERSION: &str = "2022-11-28";
const PAGE_SIZE: usize = 100;

/// Settings for [`GithubClient::new`].
#[derive(Clone)]
pub struct GithubClientConfig {
    /// API root, e.g. [`DEFAULT_API_URL`] or a GitHub Enterprise `/api/v3` URL.
    pub api_url: String,
    pub token: String,
    pub owner_kind: OwnerKind,
    pub user_agent: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl std::fmt::Debug for GithubClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GithubClientConfig")
            .field("api_url", &self.api_url)
            .field("token", &"<redacted>")
            .field("owner_kind", &self.owner_kind)
            .field("user_agent", &self.user_agent)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl GithubClientConfig {
    /// Creates a configuration for the public API with default settings.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            token: token.into(),
            owner_kind: OwnerKind::User,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Opens authenticated [`GithubSession`]s.
///
/// Holds one connection pool that every session shares.
#[derive(Debug, Clone)]
pub struct GithubClient {
    http: reqwest::Client,
    api_url: String,
    owner_kind: OwnerKind,
}

impl GithubClient {
    /// Builds the HTTP client with authentication and API-version headers.
    ///
    /// # Errors
    ///
    /// Returns [`GithubError`] if the token, user agent or URL are unusable,
    /// or the TLS backend cannot be initialized.
    pub fn new(config: GithubClientConfig) -> Result<Self, GithubError> {
        let api_url = config.api_url.trim_end_matches('/').to_string();
        if !(api_url.starts_with("https://") || api_url.starts_with("http://")) {
            return Err(GithubError::InvalidApiUrl {
                url: config.api_url,
            });
        }
        if config.token.trim().is_empty() {
            return Err(GithubError::InvalidToken);
        }

        let mut auth = HeaderValue::from_str(&format!("Bearer {}", config.token.trim()))
            .map_err(|_| GithubError::InvalidToken)?;
        auth.set_sensitive(true);
        let user_agent =
            HeaderValue::from_str(&config.user_agent).map_err(|_| GithubError::InvalidUserAgent {
                user_agent: config.user_agent.clone(),
            })?;

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);
        headers.insert(USER_AGENT, user_agent);
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(
            HeaderName::from_static("x-github-api-version"),
            HeaderValue::from_static(API_VERSION),
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            http,
            api_url,
            owner_kind: config.owner_kind,
        })
    }
}

#[async_trait]
impl RestClient for GithubClient {
    type Session = GithubSession;

    /// Verifies the credentials with `GET /user` before handing out a session.
    async fn open(
        &self,
        ctx: &SchedulingContext,
        owner: &OwnerName,
    ) -> Result<GithubSession, RemoteError> {
        let session = GithubSession {
            http: self.http.clone(),
            api_url: self.api_url.clone(),
            owner: owner.clone(),
            owner_kind: self.owner_kind,
            closed: AtomicBool::new(false),
        };
        let me = session
            .send(ctx, HttpMethod::Get, "/user".to_string(), &[], None)
            .await?;
        let login = me.get("login").and_then(Value::as_str).ok_or_else(|| {
            RemoteError::new(
                RemoteErrorKind::InvalidResponse,
                HttpMethod::Get,
                "/user",
                format!("authenticated user has no login: {me}"),
            )
        })?;
        check_owner(self.owner_kind, login, owner)?;
        info!(
            ctx = %ctx,
            login,
            owner = %owner,
            owner_kind = ?self.owner_kind,
            "Authenticated with GitHub"
        );
        Ok(session)
    }
}

/// An authenticated session acting on one owner's repositories.
///
/// Safe to share across tasks; concurrent calls are issued concurrently.
#[derive(Debug)]
pub struct GithubSession {
    http: reqwest::Client,
    api_url: String,
    owner: OwnerName,
    owner_kind: OwnerKind,
    closed: AtomicBool,
}

impl GithubSession {
    /// Maps a resource and sub-path onto a REST path.
    pub fn resource_path(&self, resource: &Resource, sub_path: &str) -> String {
        match resource {
            Resource::Owner => match self.owner_kind {
                OwnerKind::User => format!("/user{sub_path}"),
                OwnerKind::Organization => format!("/orgs/{}{sub_path}", self.owner),
            },
            Resource::Repository(name) => format!("/repos/{}/{name}{sub_path}", self.owner),
        }
    }

    async fn send(
        &self,
        ctx: &SchedulingContext,
        method: HttpMethod,
        path: String,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Value, RemoteError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RemoteError::new(
                RemoteErrorKind::SessionClosed,
                method,
                path,
                "session already closed",
            ));
        }

        let url = format!("{}{}", self.api_url, path);
        let mut request = match method {
            HttpMethod::Get => self.http.get(&url),
            HttpMethod::Post => self.http.post(&url),
            HttpMethod::Delete => self.http.delete(&url),
        };
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        debug!(ctx = %ctx, method = %method, path = %path, "Sending GitHub request");
        let response = request.send().await.map_err(|e| {
            RemoteError::new(RemoteErrorKind::Transport, method, path.clone(), e.to_string())
        })?;
        let status = response.status();
        let headers = response.headers().clone();
        let text = response.text().await.map_err(|e| {
            RemoteError::new(RemoteErrorKind::Transport, method, path.clone(), e.to_string())
        })?;
        debug!(
            ctx = %ctx,
            method = %method,
            path = %path,
            status = status.as_u16(),
            "GitHub responded"
        );

        if !status.is_success() {
            return Err(error_from_response(method, path, status, &headers, &text));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| {
            RemoteError::new(
                RemoteErrorKind::InvalidResponse,
                method,
                path,
                format!("response body is not JSON: {e}"),
            )
        })
    }

    fn list_query(
        &self,
        resource: &Resource,
        sub_path: &str,
        page: usize,
    ) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("per_page", PAGE_SIZE.to_string()),
            ("page", page.to_string()),
        ];
        let own_repos = *resource == Resource::Owner && sub_path == "/repos";
        if self.owner_kind == OwnerKind::User && own_repos {
            query.push(("affiliation", "owner".to_string()));
        }
        query
    }
}

#[async_trait]
impl RestSession for GithubSession {
    /// Fetches `resource`/`sub_path`, following pagination when the body is a
    /// JSON array.
    async fn get(
        &self,
        ctx: &SchedulingContext,
        resource: &Resource,
        sub_path: &str,
    ) -> Result<Value, RemoteError> {
        let path = self.resource_path(resource, sub_path);
        let mut items = Vec::new();
        let mut page = 1;
        loop {
            let query = self.list_query(resource, sub_path, page);
            match self
                .send(ctx, HttpMethod::Get, path.clone(), &query, None)
                .await?
            {
                Value::Array(batch) => {
                    let count = batch.len();
                    items.extend(batch);
                    if count < PAGE_SIZE {
                        return Ok(Value::Array(items));
                    }
                    page += 1;
                }
                // Only the first page can be a non-array body.
                other if page == 1 => return Ok(other),
                other => {
                    return Err(RemoteError::new(
                        RemoteErrorKind::InvalidResponse,
                        HttpMethod::Get,
                        path,
                        format!("page {page} is not a list: {other}"),
                    ))
                }
            }
        }
    }

    async fn post(
        &self,
        ctx: &SchedulingContext,
        resource: &Resource,
        sub_path: &str,
        body: Value,
    ) -> Result<Value, RemoteError> {
        let path = self.resource_path(resource, sub_path);
        self.send(ctx, HttpMethod::Post, path, &[], Some(&body))
            .await
    }

    async fn delete(
        &self,
        ctx: &SchedulingContext,
        resource: &Resource,
        sub_path: &str,
    ) -> Result<Value, RemoteError> {
        let path = self.resource_path(resource, sub_path);
        self.send(ctx, HttpMethod::Delete, path, &[], None).await
    }

    async fn close(&self, ctx: &SchedulingContext) -> Result<(), RemoteError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(ctx = %ctx, owner = %self.owner, "Closed GitHub session");
        }
        Ok(())
    }
}

/// A user owner's collection is addressed as `/user`, so the token must
/// belong to that owner. Logins compare case-insensitively.
fn check_owner(kind: OwnerKind, login: &str, owner: &OwnerName) -> Result<(), RemoteError> {
    if kind == OwnerKind::User && !login.eq_ignore_ascii_case(owner.as_str()) {
        return Err(RemoteError::new(
            RemoteErrorKind::Rejected,
            HttpMethod::Get,
            "/user",
            format!(
                "token belongs to '{login}' but owner '{owner}' was requested; \
                 use owner_kind = \"organization\" for organization owners"
            ),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Response classification
// ---------------------------------------------------------------------------

/// Builds a typed error from a non-success response.
pub(crate) fn error_from_response(
    method: HttpMethod,
    path: String,
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
) -> RemoteError {
    let kind = classify(status, headers);
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| match body.trim() {
            "" => status
                .canonical_reason()
                .unwrap_or("no response body")
                .to_string(),
            text => text.chars().take(200).collect(),
        });
    RemoteError::new(kind, method, path, format!("{} {message}", status.as_u16()))
        .with_retry_after(retry_after(headers, SystemTime::now()))
}

pub(crate) fn classify(status: StatusCode, headers: &HeaderMap) -> RemoteErrorKind {
    match status.as_u16() {
        401 => RemoteErrorKind::Unauthorized,
        403 if is_throttled(headers) => RemoteErrorKind::RateLimited,
        403 => RemoteErrorKind::Unauthorized,
        404 => RemoteErrorKind::NotFound,
        409 | 422 => RemoteErrorKind::Conflict,
        429 => RemoteErrorKind::RateLimited,
        400..=499 => RemoteErrorKind::Rejected,
        _ => RemoteErrorKind::ServerError,
    }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn is_throttled(headers: &HeaderMap) -> bool {
    headers.contains_key(RETRY_AFTER) || header_u64(headers, "x-ratelimit-remaining") == Some(0)
}

/// Back-off requested by GitHub, from `Retry-After` (seconds) or, when the
/// primary rate limit is exhausted, from `x-ratelimit-reset` (epoch seconds).
pub(crate) fn retry_after(headers: &HeaderMap, now: SystemTime) -> Option<Duration> {
    if let Some(secs) = header_u64(headers, RETRY_AFTER.as_str()) {
        return Some(Duration::from_secs(secs));
    }
    if header_u64(headers, "x-ratelimit-remaining") != Some(0) {
        return None;
    }
    let reset = header_u64(headers, "x-ratelimit-reset")?;
    let now = now.duration_since(UNIX_EPOCH).ok()?.as_secs();
    Some(Duration::from_secs(reset.saturating_sub(now)))
}

#[cfg(test)]
mod tests {
    use provisioning::RepoName;

    use super::*;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    fn session(kind: OwnerKind) -> GithubSession {
        GithubSession {
            http: reqwest::Client::new(),
            api_url: DEFAULT_API_URL.to_string(),
            owner: OwnerName::new("acme").unwrap(),
            owner_kind: kind,
            closed: AtomicBool::new(false),
        }
    }

    #[test]
    fn owner_paths_depend_on_owner_kind() {
        assert_eq!(
            session(OwnerKind::User).resource_path(&Resource::Owner, "/repos"),
            "/user/repos"
        );
        assert_eq!(
            session(OwnerKind::Organization).resource_path(&Resource::Owner, "/repos"),
            "/orgs/acme/repos"
        );
    }

    #[test]
    fn repository_paths_are_owner_scoped() {
        let repo = Resource::Repository(RepoName::new("foo_app.svc").unwrap());
        assert_eq!(
            session(OwnerKind::User).resource_path(&repo, "/git/refs"),
            "/repos/acme/foo_app.svc/git/refs"
        );
        assert_eq!(
            session(OwnerKind::User).resource_path(&repo, ""),
            "/repos/acme/foo_app.svc"
        );
    }

    #[test]
    fn user_repo_listing_is_limited_to_owned_repositories() {
        let query = session(OwnerKind::User).list_query(&Resource::Owner, "/repos", 2);
        assert!(query.contains(&("affiliation", "owner".to_string())));
        assert!(query.contains(&("page", "2".to_string())));

        let org_query = session(OwnerKind::Organization).list_query(&Resource::Owner, "/repos", 1);
        assert!(!org_query.iter().any(|(k, _)| *k == "affiliation"));
    }

    #[test]
    fn user_owner_must_match_token_login() {
        let acme = OwnerName::new("acme").unwrap();
        assert!(check_owner(OwnerKind::User, "acme", &acme).is_ok());
        assert!(check_owner(OwnerKind::User, "ACME", &acme).is_ok());
        assert!(check_owner(OwnerKind::Organization, "bob", &acme).is_ok());

        let err = check_owner(OwnerKind::User, "bob", &acme).unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::Rejected);
        assert!(err.message.contains("'bob'"), "{}", err.message);
    }

    #[test]
    fn statuses_map_to_error_kinds() {
        let none = HeaderMap::new();
        assert_eq!(classify(StatusCode::UNAUTHORIZED, &none), RemoteErrorKind::Unauthorized);
        assert_eq!(classify(StatusCode::FORBIDDEN, &none), RemoteErrorKind::Unauthorized);
        assert_eq!(classify(StatusCode::NOT_FOUND, &none), RemoteErrorKind::NotFound);
        assert_eq!(classify(StatusCode::CONFLICT, &none), RemoteErrorKind::Conflict);
        assert_eq!(
            classify(StatusCode::UNPROCESSABLE_ENTITY, &none),
            RemoteErrorKind::Conflict
        );
        assert_eq!(classify(StatusCode::BAD_REQUEST, &none), RemoteErrorKind::Rejected);
        assert_eq!(
            classify(StatusCode::TOO_MANY_REQUESTS, &none),
            RemoteErrorKind::RateLimited
        );
        assert_eq!(classify(StatusCode::BAD_GATEWAY, &none), RemoteErrorKind::ServerError);
    }

    #[test]
    fn exhausted_quota_turns_forbidden_into_rate_limited() {
        let h = headers(&[("x-ratelimit-remaining", "0"), ("x-ratelimit-reset", "1000")]);
        assert_eq!(classify(StatusCode::FORBIDDEN, &h), RemoteErrorKind::RateLimited);

        let now = UNIX_EPOCH + Duration::from_secs(940);
        assert_eq!(retry_after(&h, now), Some(Duration::from_secs(60)));
    }

    #[test]
    fn retry_after_header_takes_precedence() {
        let h = headers(&[
            ("retry-after", "7"),
            ("x-ratelimit-remaining", "0"),
            ("x-ratelimit-reset", "1000"),
        ]);
        assert_eq!(retry_after(&h, UNIX_EPOCH), Some(Duration::from_secs(7)));
        assert_eq!(retry_after(&HeaderMap::new(), UNIX_EPOCH), None);
    }

    #[test]
    fn error_message_prefers_github_message_field() {
        let err = error_from_response(
            HttpMethod::Post,
            "/user/repos".to_string(),
            StatusCode::UNPROCESSABLE_ENTITY,
            &HeaderMap::new(),
            r#"{"message":"Repository creation failed.","errors":[]}"#,
        );
        assert_eq!(err.kind, RemoteErrorKind::Conflict);
        assert_eq!(err.message, "422 Repository creation failed.");

        let bare = error_from_response(
            HttpMethod::Delete,
            "/repos/acme/x".to_string(),
            StatusCode::NOT_FOUND,
            &HeaderMap::new(),
            "",
        );
        assert_eq!(bare.message, "404 Not Found");
    }

    #[test]
    fn config_debug_hides_token() {
        let rendered = format!("{:?}", GithubClientConfig::new("ghp_secret"));
        assert!(!rendered.contains("ghp_secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn config_rejects_blank_token_and_relative_url() {
        assert!(matches!(
            GithubClient::new(GithubClientConfig::new("  ")),
            Err(GithubError::InvalidToken)
        ));
        let relative = GithubClientConfig {
            api_url: "api.github.com".to_string(),
            ..GithubClientConfig::new("ghp_token")
        };
        assert!(matches!(
            GithubClient::new(relative),
            Err(GithubError::InvalidApiUrl { .. })
        ));
    }
}
