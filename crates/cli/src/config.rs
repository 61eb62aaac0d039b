//! Provisioning profile (`provision.toml`) and its resolution against
//! command-line overrides.
//!
//! ```toml
//! [github]
//! owner = "acme"
//! owner_kind = "organization"
//!
//! [provisioning]
//! integration_branch = "dev-integ"
//!
//! [projects.foo_app]
//! repos = ["docs", "ops", "scenarios", "svc", "test"]
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;

use github::{GithubClientConfig, DEFAULT_API_URL, DEFAULT_USER_AGENT};
use provisioning::{
    BatchRequest, BranchName, CollisionPolicy, OwnerKind, OwnerName, ProjectName,
    ProvisionSettings, RepoName,
};

use crate::Args;

pub const DEFAULT_CONFIG_PATH: &str = "provision.toml";

// ---------------------------------------------------------------------------
// File format
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Profile {
    #[serde(default)]
    pub github: GithubSection,
    #[serde(default)]
    pub provisioning: ProvisioningSection,
    #[serde(default)]
    pub projects: BTreeMap<String, ProjectSection>,
    #[serde(default)]
    pub telemetry: TelemetrySection,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GithubSection {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    pub owner: Option<String>,
    #[serde(default)]
    pub owner_kind: OwnerKind,
    /// Name of the environment variable holding the API token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    pub user_agent: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GithubSection {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            owner: None,
            owner_kind: OwnerKind::default(),
            token_env: default_token_env(),
            user_agent: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProvisioningSection {
    pub description: Option<String>,
    pub default_branch: Option<String>,
    pub integration_branch: Option<String>,
    pub private: Option<bool>,
    pub on_collision: Option<CollisionPolicy>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectSection {
    /// Repository suffixes; each becomes `{project}.{suffix}`.
    pub repos: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetrySection {
    pub otlp_endpoint: Option<String>,
}

impl Profile {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("invalid provisioning profile")
    }

    /// Loads the profile at `path`.
    ///
    /// A missing file is only tolerated for the default path, in which case
    /// every setting must come from flags.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(path) => (path, true),
            None => (Path::new(DEFAULT_CONFIG_PATH), false),
        };
        if !explicit && !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read profile {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("in {}", path.display()))
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Everything one invocation needs, with flags applied over the profile.
#[derive(Debug)]
pub struct RunPlan {
    pub client: GithubClientConfig,
    pub settings: ProvisionSettings,
    pub batch: BatchRequest,
}

/// Merges `args` over `profile` and reads the token through `lookup_env`.
///
/// Fails before any remote call if the token, owner, integration branch or
/// repository list is missing.
pub fn resolve(
    profile: &Profile,
    args: &Args,
    lookup_env: impl Fn(&str) -> Option<String>,
) -> Result<RunPlan> {
    let github = &profile.github;
    let token = lookup_env(&github.token_env)
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| {
            anyhow!(
                "no GitHub token: set the {} environment variable",
                github.token_env
            )
        })?;

    let owner = args
        .owner
        .as_deref()
        .or(github.owner.as_deref())
        .and_then(OwnerName::new)
        .context("no owner configured: pass --owner or set [github] owner")?;

    let section = &profile.provisioning;
    let defaults = ProvisionSettings::default();
    let default_branch = match section.default_branch.as_deref() {
        Some(name) => BranchName::new(name).context("[provisioning] default_branch is blank")?,
        None => defaults.default_branch,
    };
    let settings = ProvisionSettings {
        description: section.description.clone().unwrap_or(defaults.description),
        default_branch,
        private: section.private.unwrap_or(defaults.private),
        on_collision: args
            .on_collision
            .map(CollisionPolicy::from)
            .or(section.on_collision)
            .unwrap_or(defaults.on_collision),
    };

    let integration_branch = args
        .integration_branch
        .as_deref()
        .or(section.integration_branch.as_deref())
        .and_then(BranchName::new)
        .context(
            "no integration branch configured: pass --integration-branch or set [provisioning] integration_branch",
        )?;

    let batch = match (&args.project, args.repos.is_empty()) {
        (Some(_), false) => bail!("--project and --repo are mutually exclusive"),
        (None, false) => {
            let names = args
                .repos
                .iter()
                .map(|name| RepoName::new(name.as_str()).context("blank --repo name"))
                .collect::<Result<Vec<_>>>()?;
            BatchRequest::new(owner, names, integration_branch)?
        }
        (Some(project), true) => {
            let suffixes = &profile
                .projects
                .get(project)
                .with_context(|| format!("project '{project}' is not defined in the profile"))?
                .repos;
            let project = ProjectName::new(project.as_str()).context("blank --project name")?;
            BatchRequest::for_project(
                owner,
                &project,
                suffixes.as_slice(),
                integration_branch,
            )?
        }
        (None, true) => bail!("nothing to provision: pass --project or at least one --repo"),
    };

    let client = GithubClientConfig {
        api_url: github.api_url.clone(),
        owner_kind: github.owner_kind,
        timeout: Duration::from_secs(github.timeout_secs),
        user_agent: github
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
        token,
    };

    Ok(RunPlan {
        client,
        settings,
        batch,
    })
}
