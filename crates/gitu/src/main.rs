//! `gitu`: one CLI for every hosted Git forge.

mod render;
mod settings;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use git_host::{
    CloneOptions, ConflictResolver, CreatePullRequestOptions, CreateRepoOptions,
    CreateWebhookOptions, DefaultResolver, GitHost, KustomizeResolver, MergeMethod,
    MergePullRequestOptions, UnionResolver, UpdateAndMergeOptions,
};
use render::OutputFormat;

#[derive(Debug, Parser)]
#[command(name = "gitu", version, about = "Work with any hosted Git forge through one interface")]
struct Cli {
    /// Output format for command results.
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    output: OutputFormat,

    /// Log at debug level (also enabled by VERBOSE_LOGGING=true).
    #[arg(long, global = true)]
    debug: bool,

    /// Only log errors.
    #[arg(long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct Target {
    /// Repository or org URL; falls back to GIT_URL, then GIT_HOST/GIT_PROJECT.
    url: Option<String>,

    /// Username for the forge; falls back to GIT_USERNAME.
    #[arg(long, short = 'u')]
    username: Option<String>,

    /// Token or password; falls back to GIT_TOKEN, then ~/.gitu-config.
    #[arg(long, short = 't')]
    token: Option<String>,

    /// Path to a CA bundle for self-hosted forges; falls back to GIT_CA_CERT.
    #[arg(long)]
    ca_cert: Option<PathBuf>,
}

impl Target {
    async fn attach(&self) -> Result<Box<dyn GitHost>> {
        let url = settings::resolve_url(self.url.clone())?;
        let credentials =
            settings::resolve_credentials(&url, self.username.clone(), self.token.clone(), self.ca_cert.clone())?;
        git_host::attach(&url, credentials)
            .await
            .map_err(|e| anyhow!(e))
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a repository.
    Create {
        #[command(flatten)]
        target: Target,
        /// Name of the repository to create; defaults to the repo in the URL.
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        private: bool,
        /// Skip creating the initial commit.
        #[arg(long)]
        no_auto_init: bool,
    },
    /// Delete the repository.
    Delete {
        #[command(flatten)]
        target: Target,
    },
    /// Check whether the repository exists.
    Exists {
        #[command(flatten)]
        target: Target,
    },
    /// List repositories in the org or user scope.
    List {
        #[command(flatten)]
        target: Target,
    },
    /// Clone the repository with credentials baked into the remote.
    Clone {
        #[command(flatten)]
        target: Target,
        /// Directory to clone into.
        dir: PathBuf,
    },
    /// Inspect or create webhooks.
    Webhook {
        #[command(flatten)]
        target: Target,
        #[command(subcommand)]
        action: WebhookCommand,
    },
    /// Work with pull requests.
    #[command(name = "pullRequest", alias = "pull-request", alias = "pr")]
    PullRequest {
        #[command(flatten)]
        target: Target,
        #[command(subcommand)]
        action: PullRequestCommand,
    },
}

#[derive(Debug, Subcommand)]
enum WebhookCommand {
    /// List webhooks on the repository.
    List,
    /// Register a webhook.
    Create {
        #[arg(long)]
        webhook_url: String,
        #[arg(long)]
        secret: Option<String>,
        #[arg(long)]
        insecure_ssl: bool,
    },
}

#[derive(Debug, Subcommand)]
enum PullRequestCommand {
    /// Read a pull request.
    Get {
        #[arg(long, short = 'n')]
        number: u64,
    },
    /// Open a pull request from the URL's `#source:target` branches.
    Create {
        #[arg(long)]
        title: String,
        #[arg(long)]
        body: Option<String>,
        #[arg(long)]
        draft: bool,
    },
    /// Merge a pull request.
    Merge {
        #[arg(long, short = 'n')]
        number: u64,
        /// merge, squash, or rebase.
        #[arg(long, default_value = "merge")]
        method: String,
        #[arg(long)]
        delete_source_branch: bool,
        /// Rebase-and-resolve instead of a single merge attempt.
        #[arg(long)]
        rebase: bool,
        /// Conflict resolver: none, union, or kustomize:<resource>.
        #[arg(long, default_value = "none")]
        resolver: String,
        /// How long to wait out a blocked pull request (e.g. "1h30m").
        #[arg(long)]
        wait_for_blocked: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let verbose_env = std::env::var("VERBOSE_LOGGING")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);
    utils::logging::init(cli.debug || verbose_env, cli.quiet);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let output = cli.output;
    match cli.command {
        Command::Create {
            target,
            name,
            private,
            no_auto_init,
        } => {
            let host = target.attach().await?;
            let name = name
                .or_else(|| {
                    let repo = host.config().repo.clone();
                    repo.filter(|r| !r.is_empty())
                })
                .context("no repository name: pass --name or a repository URL")?;
            let options = CreateRepoOptions {
                private_repo: private,
                auto_init: !no_auto_init,
                ..CreateRepoOptions::new(name)
            };
            let created = host.create_repo(&options).await?;
            let info = created.get_repo_info().await?;
            render::emit(output, &info, format!("Created {}", info.http_url))
        }
        Command::Delete { target } => {
            let host = target.attach().await?;
            let url = host.config().url();
            host.delete_repo().await?;
            render::emit(output, &serde_json::json!({ "deleted": url }), format!("Deleted {url}"))
        }
        Command::Exists { target } => {
            let host = target.attach().await?;
            match host.get_repo_info().await {
                Ok(info) => render::emit(
                    output,
                    &serde_json::json!({ "exists": true, "url": info.http_url }),
                    format!("{} exists", info.http_url),
                ),
                Err(error) if error.kind() == git_host::ErrorKind::RepoNotFound => {
                    render::emit(
                        output,
                        &serde_json::json!({ "exists": false }),
                        "not found".to_string(),
                    )?;
                    bail!("repository not found")
                }
                Err(error) => Err(error.into()),
            }
        }
        Command::List { target } => {
            let host = target.attach().await?;
            let repos = host.list_repos().await?;
            let text = repos.join("\n");
            render::emit(output, &repos, text)
        }
        Command::Clone { target, dir } => {
            let host = target.attach().await?;
            let workspace = host.clone_repo(&CloneOptions::new(dir)).await?;
            render::emit(
                output,
                &serde_json::json!({ "dir": workspace.root() }),
                format!("Cloned into {}", workspace.root().display()),
            )
        }
        Command::Webhook { target, action } => {
            let host = target.attach().await?;
            match action {
                WebhookCommand::List => {
                    let hooks = host.get_webhooks().await?;
                    let text = hooks
                        .iter()
                        .map(|h| format!("{}\t{}\t{}", h.id, h.config.url, h.events.join(",")))
                        .collect::<Vec<_>>()
                        .join("\n");
                    render::emit(output, &hooks, text)
                }
                WebhookCommand::Create {
                    webhook_url,
                    secret,
                    insecure_ssl,
                } => {
                    let options = CreateWebhookOptions {
                        secret,
                        insecure_ssl,
                        ..CreateWebhookOptions::new(webhook_url)
                    };
                    let id = host.create_webhook(&options).await?;
                    render::emit(
                        output,
                        &serde_json::json!({ "id": id }),
                        format!("Created webhook {id}"),
                    )
                }
            }
        }
        Command::PullRequest { target, action } => {
            let host = target.attach().await?;
            match action {
                PullRequestCommand::Get { number } => {
                    let pr = host.get_pull_request(number).await?;
                    render::emit(
                        output,
                        &pr,
                        format!(
                            "#{} {} -> {}: {:?}",
                            pr.pull_number, pr.source_branch, pr.target_branch, pr.status
                        ),
                    )
                }
                PullRequestCommand::Create { title, body, draft } => {
                    let config = host.config();
                    let source = config
                        .branch
                        .clone()
                        .context("no source branch: add #source:target to the URL")?;
                    let pr_target = match config.target_branch.clone() {
                        Some(branch) => branch,
                        None => host.get_default_branch().await?,
                    };
                    let options = CreatePullRequestOptions {
                        title,
                        source_branch: source,
                        target_branch: pr_target,
                        body,
                        draft,
                    };
                    let pr = host.create_pull_request(&options).await?;
                    render::emit(
                        output,
                        &pr,
                        format!("Created pull request #{}", pr.pull_number),
                    )
                }
                PullRequestCommand::Merge {
                    number,
                    method,
                    delete_source_branch,
                    rebase,
                    resolver,
                    wait_for_blocked,
                } => {
                    let merge = MergePullRequestOptions {
                        pull_number: number,
                        method: method
                            .parse::<MergeMethod>()
                            .map_err(|e| anyhow!(e))?,
                        delete_source_branch,
                        merge_commit_title: None,
                        merge_commit_message: None,
                    };
                    let message = if rebase {
                        let resolver = parse_resolver(&resolver)?;
                        let options = UpdateAndMergeOptions {
                            merge,
                            wait_for_blocked,
                            user_config: None,
                            resolver: resolver.as_ref(),
                            retry_evaluator: None,
                        };
                        host.update_and_merge_pull_request(&options).await?
                    } else {
                        host.merge_pull_request(&merge).await?
                    };
                    render::emit(
                        output,
                        &serde_json::json!({ "merged": number, "message": message }),
                        format!("Merged pull request #{number}: {message}"),
                    )
                }
            }
        }
    }
}

fn parse_resolver(spec: &str) -> Result<Box<dyn ConflictResolver>> {
    if spec == "none" {
        return Ok(Box::new(DefaultResolver));
    }
    if spec == "union" {
        return Ok(Box::new(UnionResolver));
    }
    if let Some(resource) = spec.strip_prefix("kustomize:") {
        if resource.is_empty() {
            bail!("kustomize resolver needs a resource name: kustomize:<resource>");
        }
        return Ok(Box::new(KustomizeResolver::new(resource)));
    }
    bail!("unknown resolver {spec:?}; expected none, union, or kustomize:<resource>")
}
