//! Gitea and Gogs adapter.
//!
//! The two forges share the `api/v1` dialect, so one adapter serves both;
//! the kind tag picks the webhook flavor and event header.

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Method;
use serde::Deserialize;
use tracing::info;

use super::{api_error, is_no_commits};
use crate::api::GitHost;
use crate::coordinate::RepoCoordinate;
use crate::error::GitHostError;
use crate::http::{ApiResponse, Auth, HostClient, Payload, RetryPolicy};
use crate::types::{
    Branch, CreatePullRequestOptions, CreateRepoOptions, CreateWebhookOptions, FileEntry,
    ForgeKind, GitEvent, MergeMethod, MergePullRequestOptions, PullRequest, PullRequestStatus,
    RepoSummary, Webhook, WebhookConfig, WebhookParams,
};

pub struct GiteaHost {
    config: RepoCoordinate,
    kind: ForgeKind,
    client: HostClient,
}

impl GiteaHost {
    pub fn attach(config: RepoCoordinate, kind: ForgeKind) -> Result<GiteaHost, GitHostError> {
        let client = HostClient::new(
            format!("{}://{}/api/v1", config.protocol, config.host),
            Auth::Basic {
                username: config.username.clone().unwrap_or_default(),
                token: config.password.clone().unwrap_or_default(),
            },
            config.ca_cert.as_ref(),
            RetryPolicy::default(),
        )?;
        Ok(GiteaHost {
            config,
            kind,
            client,
        })
    }

    fn repo_path(&self) -> String {
        format!("/repos/{}/{}", self.config.owner, self.config.repo_name())
    }

    async fn get(&self, operation: &str, path: &str) -> Result<ApiResponse, GitHostError> {
        self.client
            .execute(operation, Method::GET, path, Payload::Empty, &[])
            .await
    }

    async fn effective_branch(&self) -> Result<String, GitHostError> {
        match &self.config.branch {
            Some(branch) => Ok(branch.clone()),
            None => self.get_default_branch().await,
        }
    }

    fn map_pull_request(pr: GiteaPullRequest) -> PullRequest {
        let status = match pr.state.as_str() {
            "open" => {
                if pr.mergeable.unwrap_or(true) {
                    PullRequestStatus::Active
                } else {
                    PullRequestStatus::Conflicts
                }
            }
            "closed" => {
                if pr.merged {
                    PullRequestStatus::Completed
                } else {
                    PullRequestStatus::Abandoned
                }
            }
            _ => PullRequestStatus::NotSet,
        };
        PullRequest {
            pull_number: pr.number,
            source_branch: pr.head.map(|r| r.branch).unwrap_or_default(),
            target_branch: pr.base.map(|r| r.branch).unwrap_or_default(),
            status,
            merge_status: pr.mergeable.map(|m| m.to_string()),
            has_conflicts: pr.mergeable.map(|m| !m),
        }
    }

    /// "Automatic merge failed … fix conflicts" over 405 or 500 is this
    /// dialect's conflict signal.
    fn is_merge_conflict_body(message: &str) -> bool {
        static PATTERN: OnceLock<Regex> = OnceLock::new();
        PATTERN
            .get_or_init(|| Regex::new(r"(?is)Automatic merge failed.*fix conflicts").unwrap())
            .is_match(message)
    }

    fn event_name(event: GitEvent) -> &'static str {
        match event {
            GitEvent::Push => "push",
            GitEvent::PullRequest => "pull_request",
        }
    }
}

#[async_trait]
impl GitHost for GiteaHost {
    fn kind(&self) -> ForgeKind {
        self.kind
    }

    fn config(&self) -> RepoCoordinate {
        self.config.clone()
    }

    async fn get_repo_info(&self) -> Result<RepoSummary, GitHostError> {
        let response = self.get("get-repo-info", &self.repo_path()).await?;
        if response.status == 404 {
            return Err(GitHostError::RepoNotFound(self.repo_path()));
        }
        if !response.ok() {
            return Err(api_error(self.kind, &response));
        }
        let repo: GiteaRepo = response.json()?;
        Ok(RepoSummary {
            id: repo.id.to_string(),
            slug: repo.full_name,
            http_url: repo.html_url,
            name: repo.name,
            description: repo.description,
            is_private: repo.private,
            default_branch: repo.default_branch,
        })
    }

    async fn list_repos(&self) -> Result<Vec<String>, GitHostError> {
        let owner = &self.config.owner;
        for scope in [format!("/orgs/{owner}/repos"), format!("/users/{owner}/repos")] {
            let mut urls = Vec::new();
            let mut page = 1u32;
            loop {
                let path = format!("{scope}?limit=50&page={page}");
                let response = self.get("list-repos", &path).await?;
                if response.status == 404 {
                    break;
                }
                if !response.ok() {
                    return Err(api_error(self.kind, &response));
                }
                let repos: Vec<GiteaRepo> = response.json()?;
                let count = repos.len();
                urls.extend(repos.into_iter().map(|r| r.html_url));
                if count < 50 {
                    return Ok(urls);
                }
                page += 1;
            }
        }
        Err(GitHostError::UserNotFound(owner.clone()))
    }

    async fn create_repo(
        &self,
        options: &CreateRepoOptions,
    ) -> Result<Box<dyn GitHost>, GitHostError> {
        let owner = &self.config.owner;
        let owner_is_user = self
            .config
            .username
            .as_deref()
            .is_some_and(|user| user == owner);
        let path = if owner_is_user {
            "/user/repos".to_string()
        } else {
            format!("/orgs/{owner}/repos")
        };
        let body = serde_json::json!({
            "name": options.name,
            "private": options.private_repo,
            "auto_init": options.auto_init,
        });
        let response = self
            .client
            .execute("create-repo", Method::POST, &path, Payload::Json(&body), &[])
            .await?;
        if !response.ok() {
            return Err(api_error(self.kind, &response));
        }
        info!(repo = %options.name, "created repository");
        crate::api::for_kind(self.kind, self.config.with_repo(&options.name))
    }

    async fn delete_repo(&self) -> Result<Box<dyn GitHost>, GitHostError> {
        let response = self
            .client
            .execute(
                "delete-repo",
                Method::DELETE,
                &self.repo_path(),
                Payload::Empty,
                &[],
            )
            .await?;
        if !response.ok() && response.status != 404 {
            return Err(api_error(self.kind, &response));
        }
        info!(repo = %self.repo_path(), "deleted repository");
        crate::api::for_kind(self.kind, self.config.org_scope())
    }

    async fn list_files(&self) -> Result<Vec<FileEntry>, GitHostError> {
        let branch = self.effective_branch().await?;
        let path = format!(
            "{}/contents?ref={}",
            self.repo_path(),
            urlencoding::encode(&branch)
        );
        let response = self.get("list-files", &path).await?;
        if !response.ok() {
            return Err(api_error(self.kind, &response));
        }
        let entries: Vec<GiteaContentsEntry> = response.json()?;
        Ok(entries
            .into_iter()
            .filter(|e| e.kind == "file")
            .map(|e| FileEntry {
                path: e.path,
                url: e.download_url,
            })
            .collect())
    }

    async fn get_file_contents(&self, entry: &FileEntry) -> Result<Vec<u8>, GitHostError> {
        let path = match &entry.url {
            Some(url) => url.clone(),
            None => {
                let branch = self.effective_branch().await?;
                format!("{}/raw/{branch}/{}", self.repo_path(), entry.path)
            }
        };
        let response = self.get("get-file-contents", &path).await?;
        if !response.ok() {
            return Err(api_error(self.kind, &response));
        }
        Ok(response.body)
    }

    async fn get_default_branch(&self) -> Result<String, GitHostError> {
        let info = self.get_repo_info().await?;
        Ok(info.default_branch.unwrap_or_else(|| "main".to_string()))
    }

    async fn get_branches(&self) -> Result<Vec<Branch>, GitHostError> {
        let path = format!("{}/branches", self.repo_path());
        let response = self.get("get-branches", &path).await?;
        if !response.ok() {
            return Err(api_error(self.kind, &response));
        }
        let branches: Vec<GiteaBranch> = response.json()?;
        Ok(branches
            .into_iter()
            .map(|b| Branch { name: b.name })
            .collect())
    }

    async fn delete_branch(&self, branch: &str) -> Result<(), GitHostError> {
        let path = format!("{}/branches/{branch}", self.repo_path());
        let response = self
            .client
            .execute("delete-branch", Method::DELETE, &path, Payload::Empty, &[])
            .await?;
        if !response.ok() {
            return Err(api_error(self.kind, &response));
        }
        Ok(())
    }

    async fn get_pull_request(&self, pull_number: u64) -> Result<PullRequest, GitHostError> {
        let path = format!("{}/pulls/{pull_number}", self.repo_path());
        let response = self.get("get-pull-request", &path).await?;
        if !response.ok() {
            return Err(api_error(self.kind, &response));
        }
        Ok(Self::map_pull_request(response.json()?))
    }

    async fn create_pull_request(
        &self,
        options: &CreatePullRequestOptions,
    ) -> Result<PullRequest, GitHostError> {
        let path = format!("{}/pulls", self.repo_path());
        let body = serde_json::json!({
            "title": options.title,
            "head": options.source_branch,
            "base": options.target_branch,
            "body": options.body.as_deref().unwrap_or_default(),
        });
        let response = self
            .client
            .execute(
                "create-pull-request",
                Method::POST,
                &path,
                Payload::Json(&body),
                &[],
            )
            .await?;
        if !response.ok() {
            let message = response.text();
            if is_no_commits(&message) {
                return Err(GitHostError::NoCommitsForPullRequest(message));
            }
            return Err(api_error(self.kind, &response));
        }
        let pr = Self::map_pull_request(response.json()?);
        info!(pull_number = pr.pull_number, "created pull request");
        Ok(pr)
    }

    async fn merge_pull_request_internal(
        &self,
        options: &MergePullRequestOptions,
    ) -> Result<String, GitHostError> {
        let path = format!("{}/pulls/{}/merge", self.repo_path(), options.pull_number);
        let mut body = serde_json::json!({
            "Do": match options.method {
                MergeMethod::Merge => "merge",
                MergeMethod::Squash => "squash",
                MergeMethod::Rebase => "rebase",
            },
        });
        if let Some(title) = &options.merge_commit_title {
            body["MergeTitleField"] = serde_json::Value::String(title.clone());
        }
        if let Some(message) = &options.merge_commit_message {
            body["MergeMessageField"] = serde_json::Value::String(message.clone());
        }

        // 500 joins the pass-throughs: this dialect reports content conflicts
        // through it.
        let policy = RetryPolicy {
            pass_through_status: vec![405, 409, 422, 500],
            ..RetryPolicy::default()
        };
        let response = self
            .client
            .execute_with_policy(
                "merge-pull-request",
                &policy,
                Method::POST,
                &path,
                Payload::Json(&body),
                &[],
            )
            .await?;

        if response.ok() {
            return Ok(format!("merged #{}", options.pull_number));
        }
        let message = response.text();
        if (response.status == 405 || response.status == 500)
            && Self::is_merge_conflict_body(&message)
        {
            return Err(GitHostError::MergeConflict {
                pull_number: options.pull_number,
                message,
            });
        }
        Err(api_error(self.kind, &response))
    }

    async fn update_pull_request_branch(&self, pull_number: u64) -> Result<(), GitHostError> {
        if self.kind == ForgeKind::Gogs {
            return Err(GitHostError::NotImplemented("update_pull_request_branch"));
        }
        let path = format!("{}/pulls/{pull_number}/update", self.repo_path());
        let response = self
            .client
            .execute(
                "update-pull-request-branch",
                Method::POST,
                &path,
                Payload::Empty,
                &[],
            )
            .await?;
        if !response.ok() {
            return Err(api_error(self.kind, &response));
        }
        Ok(())
    }

    async fn get_webhooks(&self) -> Result<Vec<Webhook>, GitHostError> {
        let path = format!("{}/hooks", self.repo_path());
        let response = self.get("get-webhooks", &path).await?;
        if !response.ok() {
            return Err(api_error(self.kind, &response));
        }
        let hooks: Vec<GiteaHook> = response.json()?;
        Ok(hooks
            .into_iter()
            .map(|hook| Webhook {
                id: hook.id.to_string(),
                name: hook.kind,
                active: hook.active,
                events: hook.events,
                config: WebhookConfig {
                    content_type: hook
                        .config
                        .get("content_type")
                        .cloned()
                        .unwrap_or_default(),
                    url: hook.config.get("url").cloned().unwrap_or_default(),
                    insecure_ssl: "0".to_string(),
                },
            })
            .collect())
    }

    async fn create_webhook(
        &self,
        options: &CreateWebhookOptions,
    ) -> Result<String, GitHostError> {
        let path = format!("{}/hooks", self.repo_path());
        let hook_type = match self.kind {
            ForgeKind::Gogs => "gogs",
            _ => "gitea",
        };
        let events: Vec<&str> = options.events.iter().map(|e| Self::event_name(*e)).collect();
        let mut config = serde_json::json!({
            "url": options.webhook_url,
            "content_type": options.content_type,
        });
        if let Some(secret) = &options.secret {
            config["secret"] = serde_json::Value::String(secret.clone());
        }
        let body = serde_json::json!({
            "type": hook_type,
            "active": true,
            "events": events,
            "config": config,
        });
        let response = self
            .client
            .execute(
                "create-webhook",
                Method::POST,
                &path,
                Payload::Json(&body),
                &[],
            )
            .await?;
        let message = response.text();
        if !response.ok() {
            if message.to_lowercase().contains("already exists") {
                return Err(GitHostError::WebhookAlreadyExists(
                    options.webhook_url.clone(),
                ));
            }
            if response.status == 422 || response.status == 400 {
                return Err(GitHostError::UnknownWebhook(message));
            }
            return Err(api_error(self.kind, &response));
        }
        let hook: GiteaHook = response.json()?;
        info!(id = hook.id, "created webhook");
        Ok(hook.id.to_string())
    }

    fn webhook_params(&self, event: GitEvent) -> WebhookParams {
        let event_header = match self.kind {
            ForgeKind::Gogs => "X-Gogs-Event",
            _ => "X-Gitea-Event",
        };
        let ref_path = match event {
            GitEvent::Push => "body.ref",
            GitEvent::PullRequest => "body.pull_request.head.ref",
        };
        WebhookParams {
            event_header: event_header.to_string(),
            event_name: Self::event_name(event).to_string(),
            ref_path: ref_path.to_string(),
            repository_url_path: "body.repository.clone_url".to_string(),
            repository_name_path: "body.repository.name".to_string(),
        }
    }
}

// Gitea/Gogs API response structures

#[derive(Debug, Deserialize)]
struct GiteaRepo {
    id: i64,
    name: String,
    full_name: String,
    html_url: String,
    description: Option<String>,
    private: bool,
    default_branch: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GiteaPullRequest {
    number: u64,
    state: String,
    #[serde(default)]
    merged: bool,
    mergeable: Option<bool>,
    head: Option<GiteaRef>,
    base: Option<GiteaRef>,
}

#[derive(Debug, Deserialize)]
struct GiteaRef {
    #[serde(rename = "ref")]
    branch: String,
}

#[derive(Debug, Deserialize)]
struct GiteaBranch {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GiteaContentsEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    download_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GiteaHook {
    id: i64,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    active: bool,
    #[serde(default)]
    events: Vec<String>,
    #[serde(default)]
    config: std::collections::HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pr(state: &str, mergeable: Option<bool>, merged: bool) -> GiteaPullRequest {
        GiteaPullRequest {
            number: 4,
            state: state.to_string(),
            merged,
            mergeable,
            head: Some(GiteaRef {
                branch: "feature".to_string(),
            }),
            base: Some(GiteaRef {
                branch: "main".to_string(),
            }),
        }
    }

    #[test]
    fn test_status_mapping_table() {
        let cases = [
            (("open", Some(true), false), PullRequestStatus::Active),
            (("open", Some(false), false), PullRequestStatus::Conflicts),
            (("open", None, false), PullRequestStatus::Active),
            (("closed", None, true), PullRequestStatus::Completed),
            (("closed", Some(true), false), PullRequestStatus::Abandoned),
        ];
        for ((state, mergeable, merged), expected) in cases {
            let mapped = GiteaHost::map_pull_request(pr(state, mergeable, merged));
            assert_eq!(mapped.status, expected, "{state}/{mergeable:?}/{merged}");
        }
    }

    #[test]
    fn test_conflict_body_detection() {
        assert!(GiteaHost::is_merge_conflict_body(
            "Automatic merge failed; fix conflicts and then commit the result"
        ));
        assert!(GiteaHost::is_merge_conflict_body(
            "automatic merge FAILED.\nPlease fix conflicts."
        ));
        assert!(!GiteaHost::is_merge_conflict_body("internal server error"));
    }
}
