//! `provision-repos`: creates a batch of GitHub repositories, each with an
//! integration branch cut from its default branch.
//!
//! This binary is the composition root. Responsibilities:
//!
//! 1. **Parse configuration**: load the TOML profile and apply flag overrides
//!    ([`config`]).
//! 2. **Wire observability**: install the `tracing` subscriber, optionally
//!    exporting spans over OTLP ([`observability`]).
//! 3. **Construct infrastructure**: build the [`GithubClient`] and inject it
//!    into a [`ProvisioningSupervisor`].
//! 4. **Run one batch** and print the provisioned names in completion order.
//!
//! The runtime is single-threaded: every task the supervisor spawns runs
//! cooperatively on one thread and overlaps only while awaiting the network.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{error, info};

use github::GithubClient;
use provisioning::{CollisionPolicy, ProvisioningSupervisor};

mod config;
mod observability;

use config::Profile;

#[derive(Debug, Parser)]
#[command(name = "provision-repos")]
#[command(version, about = "Provision a batch of GitHub repositories with an integration branch")]
pub struct Args {
    /// Path to the provisioning profile (defaults to ./provision.toml if present).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Provision the repositories of this project from the profile.
    #[arg(long)]
    pub project: Option<String>,

    /// Provision this repository (repeatable); replaces --project.
    #[arg(long = "repo", value_name = "NAME")]
    pub repos: Vec<String>,

    /// Owning user or organization. Overrides [github] owner.
    #[arg(long)]
    pub owner: Option<String>,

    /// Branch to create in every repository. Overrides [provisioning] integration_branch.
    #[arg(long)]
    pub integration_branch: Option<String>,

    /// What to do with repositories that already exist.
    #[arg(long, value_enum)]
    pub on_collision: Option<CollisionArg>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CollisionArg {
    /// Delete the existing repository and create it again.
    Replace,
    /// Fail that repository without touching it.
    Fail,
}

impl From<CollisionArg> for CollisionPolicy {
    fn from(arg: CollisionArg) -> Self {
        match arg {
            CollisionArg::Replace => CollisionPolicy::Replace,
            CollisionArg::Fail => CollisionPolicy::Fail,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    let profile = Profile::load(args.config.as_deref())?;
    let telemetry =
        observability::init(args.log_json, profile.telemetry.otlp_endpoint.as_deref())?;

    let outcome = run(&profile, &args).await;
    if let Err(err) = &outcome {
        error!(error = %format!("{err:#}"), "Provisioning failed");
    }
    telemetry.shutdown();
    outcome
}

async fn run(profile: &Profile, args: &Args) -> Result<()> {
    let plan = config::resolve(profile, args, |name| std::env::var(name).ok())?;
    info!(
        owner = %plan.batch.owner(),
        repos = plan.batch.repo_names().len(),
        integration_branch = %plan.batch.integration_branch(),
        on_collision = ?plan.settings.on_collision,
        "Starting provisioning"
    );

    let client = GithubClient::new(plan.client).context("failed to build GitHub client")?;
    let supervisor = ProvisioningSupervisor::new(client, plan.settings);
    let provisioned = supervisor
        .provision(&plan.batch)
        .await
        .context("batch did not complete")?;

    for name in &provisioned {
        println!("{name}");
    }
    Ok(())
}
