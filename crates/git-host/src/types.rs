//! Shared types for the forge-neutral capability surface.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::http::CaCert;

/// The hosted Git services this crate can speak to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForgeKind {
    Github,
    Ghe,
    Gitlab,
    Gogs,
    Gitea,
    Bitbucket,
    Azure,
}

impl fmt::Display for ForgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ForgeKind::Github => "GitHub",
            ForgeKind::Ghe => "GitHub Enterprise",
            ForgeKind::Gitlab => "GitLab",
            ForgeKind::Gogs => "Gogs",
            ForgeKind::Gitea => "Gitea",
            ForgeKind::Bitbucket => "Bitbucket",
            ForgeKind::Azure => "Azure DevOps",
        };
        write!(f, "{name}")
    }
}

/// Authentication material carried into every adapter.
///
/// `username` may be empty for token-only forges. The CA bundle, when
/// present, is read once and attached by value to every request; the on-disk
/// path is retained so local clones can point `http.sslCAInfo` at it.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub username: String,
    pub token: String,
    pub ca_cert: Option<CaCert>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            token: token.into(),
            ca_cert: None,
        }
    }

    pub fn with_ca_cert(mut self, ca_cert: CaCert) -> Self {
        self.ca_cert = Some(ca_cert);
        self
    }
}

/// Normalized pull-request state across forges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PullRequestStatus {
    NotSet,
    Active,
    Abandoned,
    Completed,
    Conflicts,
    Blocked,
}

impl fmt::Display for PullRequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// One pull request as read from a forge. Never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct PullRequest {
    pub pull_number: u64,
    pub source_branch: String,
    pub target_branch: String,
    pub status: PullRequestStatus,
    /// The forge's own mergeability string, for diagnostics.
    pub merge_status: Option<String>,
    pub has_conflicts: Option<bool>,
}

/// Repository description returned by `get_repo_info`.
#[derive(Debug, Clone, Serialize)]
pub struct RepoSummary {
    pub id: String,
    pub slug: String,
    pub http_url: String,
    pub name: String,
    pub description: Option<String>,
    pub is_private: bool,
    pub default_branch: Option<String>,
}

/// A file visible on the configured branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub path: String,
    /// Direct download location when the forge provides one.
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Branch {
    pub name: String,
}

/// A webhook registered on a repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Webhook {
    pub id: String,
    pub name: String,
    pub active: bool,
    pub events: Vec<String>,
    pub config: WebhookConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub content_type: String,
    pub url: String,
    pub insecure_ssl: String,
}

/// Events a webhook can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitEvent {
    Push,
    PullRequest,
}

/// Header and payload selectors CI templates need to consume a forge's
/// webhook deliveries.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookParams {
    /// Header naming the delivered event.
    pub event_header: String,
    /// Value of that header for the requested event.
    pub event_name: String,
    /// Payload path of the pushed ref or source branch.
    pub ref_path: String,
    /// Payload path of the repository clone URL.
    pub repository_url_path: String,
    /// Payload path of the repository name.
    pub repository_name_path: String,
}

/// Options for `create_repo`.
#[derive(Debug, Clone)]
pub struct CreateRepoOptions {
    pub name: String,
    pub private_repo: bool,
    /// Guarantee an initial commit on the default branch before returning.
    pub auto_init: bool,
}

impl CreateRepoOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            private_repo: false,
            auto_init: true,
        }
    }
}

/// Options for `create_pull_request`.
#[derive(Debug, Clone, Default)]
pub struct CreatePullRequestOptions {
    pub title: String,
    pub source_branch: String,
    pub target_branch: String,
    pub body: Option<String>,
    pub draft: bool,
}

/// Forge-neutral merge strategies; each adapter maps these onto its native
/// vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeMethod {
    #[default]
    Merge,
    Squash,
    Rebase,
}

impl FromStr for MergeMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "merge" => Ok(MergeMethod::Merge),
            "squash" => Ok(MergeMethod::Squash),
            "rebase" => Ok(MergeMethod::Rebase),
            other => Err(format!("unknown merge method: {other}")),
        }
    }
}

/// Options for the merge operations.
#[derive(Debug, Clone, Default)]
pub struct MergePullRequestOptions {
    pub pull_number: u64,
    pub method: MergeMethod,
    pub delete_source_branch: bool,
    pub merge_commit_title: Option<String>,
    pub merge_commit_message: Option<String>,
}

/// Options for `create_webhook`.
#[derive(Debug, Clone)]
pub struct CreateWebhookOptions {
    pub webhook_url: String,
    pub content_type: String,
    pub secret: Option<String>,
    pub events: Vec<GitEvent>,
    pub insecure_ssl: bool,
}

impl CreateWebhookOptions {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            webhook_url: webhook_url.into(),
            content_type: "json".to_string(),
            secret: None,
            events: vec![GitEvent::Push],
            insecure_ssl: false,
        }
    }
}

/// Identity applied to commits made in a local workspace.
#[derive(Debug, Clone)]
pub struct UserConfig {
    pub name: String,
    pub email: String,
}

/// Options for `clone_repo`.
#[derive(Debug, Clone)]
pub struct CloneOptions {
    pub local_dir: PathBuf,
    pub user_config: Option<UserConfig>,
    pub extra_config: Vec<(String, String)>,
}

impl CloneOptions {
    pub fn new(local_dir: impl Into<PathBuf>) -> Self {
        Self {
            local_dir: local_dir.into(),
            user_config: None,
            extra_config: Vec::new(),
        }
    }
}
