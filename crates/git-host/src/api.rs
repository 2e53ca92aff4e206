//! The forge-neutral capability surface and the adapter factory.

use async_trait::async_trait;
use local_git::{CloneArgs, GitCli, Workspace};

use crate::coordinate::RepoCoordinate;
use crate::detection;
use crate::error::GitHostError;
use crate::hosts;
use crate::merge::{self, RebaseRequest, UpdateAndMergeOptions};
use crate::resolve::ConflictResolver;
use crate::types::{
    Branch, CloneOptions, CreatePullRequestOptions, CreateRepoOptions, CreateWebhookOptions,
    Credentials, FileEntry, ForgeKind, GitEvent, MergePullRequestOptions, PullRequest,
    RepoSummary, Webhook, WebhookParams,
};

/// One hosted Git service, bound to a repository or organization coordinate.
///
/// Adapters are cheap to construct and not required to be shared across
/// tasks; callers either serialize access or attach one per task. All
/// operations read fresh state from the forge; nothing is cached.
#[async_trait]
pub trait GitHost: Send + Sync {
    /// Which forge this adapter speaks to.
    fn kind(&self) -> ForgeKind;

    /// Defensive copy of the coordinate the adapter was built on.
    fn config(&self) -> RepoCoordinate;

    async fn get_repo_info(&self) -> Result<RepoSummary, GitHostError>;

    /// URLs of every repository in the configured org or user scope.
    async fn list_repos(&self) -> Result<Vec<String>, GitHostError>;

    /// Create a repository and return an adapter bound to it. With
    /// `auto_init` the new repository has an initial commit on its default
    /// branch before this returns.
    async fn create_repo(
        &self,
        options: &CreateRepoOptions,
    ) -> Result<Box<dyn GitHost>, GitHostError>;

    /// Delete the configured repository and return an adapter bound to the
    /// parent org scope.
    async fn delete_repo(&self) -> Result<Box<dyn GitHost>, GitHostError>;

    /// Files on the configured branch (or the default branch).
    async fn list_files(&self) -> Result<Vec<FileEntry>, GitHostError>;

    async fn get_file_contents(&self, entry: &FileEntry) -> Result<Vec<u8>, GitHostError>;

    async fn get_default_branch(&self) -> Result<String, GitHostError>;

    async fn get_branches(&self) -> Result<Vec<Branch>, GitHostError>;

    async fn delete_branch(&self, branch: &str) -> Result<(), GitHostError>;

    async fn get_pull_request(&self, pull_number: u64) -> Result<PullRequest, GitHostError>;

    /// Create a pull request. The returned number is immediately readable
    /// through `get_pull_request`, though the forge may still be computing
    /// mergeability.
    async fn create_pull_request(
        &self,
        options: &CreatePullRequestOptions,
    ) -> Result<PullRequest, GitHostError>;

    /// One merge attempt against the forge, with only the kernel's transport
    /// retries applied. Merge-state errors surface mapped but unretried; the
    /// provided merge drivers build their loops on top of this.
    async fn merge_pull_request_internal(
        &self,
        options: &MergePullRequestOptions,
    ) -> Result<String, GitHostError>;

    /// Ask the forge to bring the PR's source branch up to date with its
    /// target. Best-effort: several forges have no such operation.
    async fn update_pull_request_branch(&self, pull_number: u64) -> Result<(), GitHostError>;

    async fn get_webhooks(&self) -> Result<Vec<Webhook>, GitHostError>;

    /// Register a webhook and return its id.
    async fn create_webhook(&self, options: &CreateWebhookOptions) -> Result<String, GitHostError>;

    /// Header and payload selectors CI templates need for this forge's
    /// deliveries of `event`.
    fn webhook_params(&self, event: GitEvent) -> WebhookParams;

    /// Clone the configured repository with credentials percent-encoded into
    /// the effective remote URL. A configured CA bundle is wired into the
    /// clone via `http.sslCAInfo`.
    async fn clone_repo(&self, options: &CloneOptions) -> Result<Workspace, GitHostError> {
        let config = self.config();
        let remote = config.remote_url_with_credentials()?;

        let mut clone_args = CloneArgs {
            branch: config.branch.clone(),
            ..CloneArgs::default()
        };
        if let Some(ca) = &config.ca_cert {
            clone_args.config.push((
                "http.sslCAInfo".to_string(),
                ca.path.to_string_lossy().into_owned(),
            ));
        }
        if let Some(user) = &options.user_config {
            clone_args
                .config
                .push(("user.name".to_string(), user.name.clone()));
            clone_args
                .config
                .push(("user.email".to_string(), user.email.clone()));
        }
        clone_args.config.extend(options.extra_config.iter().cloned());

        GitCli::new()
            .clone_repo(&remote, &options.local_dir, &clone_args)
            .await?;
        Ok(Workspace::new(options.local_dir.clone()))
    }

    /// Rebase the source branch onto the target in a scratch workspace,
    /// resolving conflicts through `resolver`, and push with lease when the
    /// source changed. Returns whether anything was pushed.
    async fn rebase_branch(
        &self,
        request: &RebaseRequest,
        resolver: &dyn ConflictResolver,
    ) -> Result<bool, GitHostError> {
        merge::rebase_for_coordinate(&self.config(), request, resolver).await
    }

    /// Single-shot merge: one attempt (plus kernel retries), optional
    /// best-effort source-branch deletion, no rebasing.
    async fn merge_pull_request(
        &self,
        options: &MergePullRequestOptions,
    ) -> Result<String, GitHostError> {
        merge::drive_single_merge(self, options).await
    }

    /// The full merge state machine: poll, rebase conflicts away, wait out
    /// blocked states within the configured budget, merge, and retry
    /// merge-related transients after a fresh rebase.
    async fn update_and_merge_pull_request(
        &self,
        options: &UpdateAndMergeOptions<'_>,
    ) -> Result<String, GitHostError> {
        merge::drive_update_and_merge(self, options).await
    }
}

/// Build an adapter for a URL: parse, detect the forge (probing self-hosted
/// APIs when the host is not well known), and construct the right adapter.
pub async fn attach(
    url: &str,
    credentials: Credentials,
) -> Result<Box<dyn GitHost>, GitHostError> {
    let coordinate = RepoCoordinate::parse(url)?.with_credentials(&credentials);
    let (kind, coordinate) = detection::detect(&coordinate).await?;
    for_kind(kind, coordinate)
}

/// Construct the adapter for an already-identified forge.
pub fn for_kind(
    kind: ForgeKind,
    coordinate: RepoCoordinate,
) -> Result<Box<dyn GitHost>, GitHostError> {
    Ok(match kind {
        ForgeKind::Github | ForgeKind::Ghe => {
            Box::new(hosts::github::GithubHost::attach(coordinate, kind)?)
        }
        ForgeKind::Gitlab => Box::new(hosts::gitlab::GitlabHost::attach(coordinate)?),
        ForgeKind::Gitea | ForgeKind::Gogs => {
            Box::new(hosts::gitea::GiteaHost::attach(coordinate, kind)?)
        }
        ForgeKind::Bitbucket => Box::new(hosts::bitbucket::BitbucketHost::attach(coordinate)?),
        ForgeKind::Azure => Box::new(hosts::azure::AzureHost::attach(coordinate)?),
    })
}
