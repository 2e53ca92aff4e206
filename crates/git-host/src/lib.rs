//! Uniform client for hosted Git forges.
//!
//! One capability surface (repositories, pull requests, branches, webhooks,
//! files, and local clone with rebase-and-resolve) routed to GitHub, GitHub
//! Enterprise, GitLab, Gitea, Gogs, Bitbucket Cloud, or Azure DevOps from
//! nothing but a URL and credentials:
//!
//! ```no_run
//! use git_host::{Credentials, GitHost};
//!
//! # async fn demo() -> Result<(), git_host::GitHostError> {
//! let credentials = Credentials::new("jane", "token");
//! let host = git_host::attach("https://github.com/org/service", credentials).await?;
//! let pr = host.get_pull_request(17).await?;
//! println!("{} -> {}: {:?}", pr.source_branch, pr.target_branch, pr.status);
//! # Ok(())
//! # }
//! ```

mod api;
mod coordinate;
mod detection;
mod error;
mod http;
mod types;

pub mod hosts;
pub mod merge;
pub mod resolve;

pub use api::{GitHost, attach, for_kind};
pub use coordinate::RepoCoordinate;
pub use detection::detect;
pub use error::{ErrorKind, GitHostError};
pub use http::{
    ApiResponse, Auth, CaCert, HostClient, Payload, RetryCheck, RetryDecision, RetryPolicy,
};
pub use merge::{RebaseRequest, RetryEvaluator, UpdateAndMergeOptions};
pub use resolve::{ConflictResolver, DefaultResolver, KustomizeResolver, Resolution, UnionResolver};
pub use types::{
    Branch, CloneOptions, CreatePullRequestOptions, CreateRepoOptions, CreateWebhookOptions,
    Credentials, FileEntry, ForgeKind, GitEvent, MergeMethod, MergePullRequestOptions,
    PullRequest, PullRequestStatus, RepoSummary, UserConfig, Webhook, WebhookConfig,
    WebhookParams,
};
