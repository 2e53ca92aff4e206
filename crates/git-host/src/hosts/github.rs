//! GitHub and GitHub Enterprise adapter.
//!
//! Both speak the same v3 REST dialect; only the base URL and the kind tag
//! differ (`https://api.github.com` vs `https://{host}/api/v3`).

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
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

pub struct GithubHost {
    config: RepoCoordinate,
    kind: ForgeKind,
    client: HostClient,
}

impl GithubHost {
    pub fn attach(config: RepoCoordinate, kind: ForgeKind) -> Result<GithubHost, GitHostError> {
        let base_url = match kind {
            ForgeKind::Github => "https://api.github.com".to_string(),
            _ => format!("{}://{}/api/v3", config.protocol, config.host),
        };
        let client = HostClient::new(
            base_url,
            Auth::Bearer {
                token: config.password.clone().unwrap_or_default(),
            },
            config.ca_cert.as_ref(),
            RetryPolicy::default(),
        )?;
        Ok(GithubHost {
            config,
            kind,
            client,
        })
    }

    fn repo_path(&self) -> String {
        format!(
            "/repos/{}/{}",
            self.config.owner,
            self.config.repo_name()
        )
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

    fn map_pull_request(pr: GithubPullRequest) -> PullRequest {
        let status = match pr.state.as_str() {
            "open" => match pr.mergeable_state.as_deref() {
                Some("dirty") => PullRequestStatus::Conflicts,
                Some("blocked") => PullRequestStatus::Blocked,
                _ => PullRequestStatus::Active,
            },
            "closed" => {
                if pr.merged.unwrap_or(false) || pr.merged_at.is_some() {
                    PullRequestStatus::Completed
                } else {
                    PullRequestStatus::Abandoned
                }
            }
            _ => PullRequestStatus::NotSet,
        };
        let has_conflicts = pr
            .mergeable_state
            .as_deref()
            .map(|_| status == PullRequestStatus::Conflicts);
        PullRequest {
            pull_number: pr.number,
            source_branch: pr.head.branch,
            target_branch: pr.base.branch,
            status,
            merge_status: pr.mergeable_state,
            has_conflicts,
        }
    }

    fn event_name(event: GitEvent) -> &'static str {
        match event {
            GitEvent::Push => "push",
            GitEvent::PullRequest => "pull_request",
        }
    }
}

#[async_trait]
impl GitHost for GithubHost {
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
        let repo: GithubRepo = response.json()?;
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
                let path = format!("{scope}?per_page=100&page={page}");
                let response = self.get("list-repos", &path).await?;
                if response.status == 404 {
                    break;
                }
                if !response.ok() {
                    return Err(api_error(self.kind, &response));
                }
                let repos: Vec<GithubRepo> = response.json()?;
                let count = repos.len();
                urls.extend(repos.into_iter().map(|r| r.html_url));
                if count < 100 {
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
        let is_user_repo = self
            .config
            .username
            .as_deref()
            .is_some_and(|user| user == owner);
        let path = if is_user_repo {
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
        if response.status == 403 && response.text().contains("Must have admin rights") {
            return Err(GitHostError::InsufficientPermissions(response.text()));
        }
        if !response.ok() && response.status != 404 {
            return Err(api_error(self.kind, &response));
        }
        info!(repo = %self.repo_path(), "deleted repository");
        crate::api::for_kind(self.kind, self.config.org_scope())
    }

    async fn list_files(&self) -> Result<Vec<FileEntry>, GitHostError> {
        let branch = self.effective_branch().await?;
        let path = format!("{}/git/trees/{branch}?recursive=1", self.repo_path());
        let response = self.get("list-files", &path).await?;
        if !response.ok() {
            return Err(api_error(self.kind, &response));
        }
        let tree: GithubTree = response.json()?;
        Ok(tree
            .tree
            .into_iter()
            .filter(|entry| entry.kind == "blob")
            .map(|entry| FileEntry {
                path: entry.path,
                url: entry.url,
            })
            .collect())
    }

    async fn get_file_contents(&self, entry: &FileEntry) -> Result<Vec<u8>, GitHostError> {
        let branch = self.effective_branch().await?;
        let path = format!("{}/contents/{}?ref={branch}", self.repo_path(), entry.path);
        let response = self
            .client
            .execute(
                "get-file-contents",
                Method::GET,
                &path,
                Payload::Empty,
                &[("Accept", "application/vnd.github.raw")],
            )
            .await?;
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
        let path = format!("{}/branches?per_page=100", self.repo_path());
        let response = self.get("get-branches", &path).await?;
        if !response.ok() {
            return Err(api_error(self.kind, &response));
        }
        let branches: Vec<GithubBranch> = response.json()?;
        Ok(branches
            .into_iter()
            .map(|b| Branch { name: b.name })
            .collect())
    }

    async fn delete_branch(&self, branch: &str) -> Result<(), GitHostError> {
        let path = format!("{}/git/refs/heads/{branch}", self.repo_path());
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
            "draft": options.draft,
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
        if response.status == 422 && is_no_commits(&response.text()) {
            return Err(GitHostError::NoCommitsForPullRequest(response.text()));
        }
        if !response.ok() {
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
            "merge_method": match options.method {
                MergeMethod::Merge => "merge",
                MergeMethod::Squash => "squash",
                MergeMethod::Rebase => "rebase",
            },
        });
        if let Some(title) = &options.merge_commit_title {
            body["commit_title"] = serde_json::Value::String(title.clone());
        }
        if let Some(message) = &options.merge_commit_message {
            body["commit_message"] = serde_json::Value::String(message.clone());
        }

        let response = self
            .client
            .execute_with_policy(
                "merge-pull-request",
                &RetryPolicy::merge(),
                Method::PUT,
                &path,
                Payload::Json(&body),
                &[],
            )
            .await?;

        if response.ok() {
            let merged: GithubMergeResult = response.json()?;
            return Ok(merged.message.unwrap_or_else(|| {
                merged.sha.unwrap_or_else(|| "merged".to_string())
            }));
        }

        let message = response.text();
        match response.status {
            405 if message.to_lowercase().contains("approving review is required") => {
                Err(GitHostError::MergeBlockedForPullRequest(options.pull_number))
            }
            405 => Err(GitHostError::MergeConflict {
                pull_number: options.pull_number,
                message,
            }),
            _ => Err(api_error(self.kind, &response)),
        }
    }

    async fn update_pull_request_branch(&self, pull_number: u64) -> Result<(), GitHostError> {
        let path = format!("{}/pulls/{pull_number}/update-branch", self.repo_path());
        let response = self
            .client
            .execute(
                "update-pull-request-branch",
                Method::PUT,
                &path,
                Payload::Json(&serde_json::json!({})),
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
        let hooks: Vec<GithubHook> = response.json()?;
        Ok(hooks
            .into_iter()
            .map(|hook| Webhook {
                id: hook.id.to_string(),
                name: hook.name,
                active: hook.active,
                events: hook.events,
                config: WebhookConfig {
                    content_type: hook.config.content_type.unwrap_or_default(),
                    url: hook.config.url.unwrap_or_default(),
                    insecure_ssl: hook
                        .config
                        .insecure_ssl
                        .map(|v| v.to_string().trim_matches('"').to_string())
                        .unwrap_or_else(|| "0".to_string()),
                },
            })
            .collect())
    }

    async fn create_webhook(
        &self,
        options: &CreateWebhookOptions,
    ) -> Result<String, GitHostError> {
        let path = format!("{}/hooks", self.repo_path());
        let events: Vec<&str> = options.events.iter().map(|e| Self::event_name(*e)).collect();
        let mut config = serde_json::json!({
            "url": options.webhook_url,
            "content_type": options.content_type,
            "insecure_ssl": if options.insecure_ssl { "1" } else { "0" },
        });
        if let Some(secret) = &options.secret {
            config["secret"] = serde_json::Value::String(secret.clone());
        }
        let body = serde_json::json!({
            "name": "web",
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
        if response.status == 422 && message.contains("Hook already exists") {
            return Err(GitHostError::WebhookAlreadyExists(options.webhook_url.clone()));
        }
        if response.status == 422 {
            return Err(GitHostError::UnknownWebhook(message));
        }
        if !response.ok() {
            return Err(api_error(self.kind, &response));
        }
        let hook: GithubHook = response.json()?;
        info!(id = hook.id, "created webhook");
        Ok(hook.id.to_string())
    }

    fn webhook_params(&self, event: GitEvent) -> WebhookParams {
        let ref_path = match event {
            GitEvent::Push => "body.ref",
            GitEvent::PullRequest => "body.pull_request.head.ref",
        };
        WebhookParams {
            event_header: "X-GitHub-Event".to_string(),
            event_name: Self::event_name(event).to_string(),
            ref_path: ref_path.to_string(),
            repository_url_path: "body.repository.clone_url".to_string(),
            repository_name_path: "body.repository.name".to_string(),
        }
    }
}

// GitHub API response structures

#[derive(Debug, Deserialize)]
struct GithubRepo {
    id: i64,
    name: String,
    full_name: String,
    html_url: String,
    description: Option<String>,
    private: bool,
    default_branch: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GithubPullRequest {
    number: u64,
    state: String,
    merged: Option<bool>,
    merged_at: Option<chrono::DateTime<chrono::Utc>>,
    mergeable_state: Option<String>,
    head: GithubRef,
    base: GithubRef,
}

#[derive(Debug, Deserialize)]
struct GithubBranch {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GithubRef {
    #[serde(rename = "ref")]
    branch: String,
}

#[derive(Debug, Deserialize)]
struct GithubMergeResult {
    sha: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GithubTree {
    tree: Vec<GithubTreeEntry>,
}

#[derive(Debug, Deserialize)]
struct GithubTreeEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    url: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
struct GithubHook {
    id: i64,
    #[serde(default = "web_hook_name")]
    name: String,
    #[serde(default)]
    active: bool,
    #[serde(default)]
    events: Vec<String>,
    #[serde(default)]
    config: GithubHookConfig,
}

fn web_hook_name() -> String {
    "web".to_string()
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct GithubHookConfig {
    url: Option<String>,
    content_type: Option<String>,
    insecure_ssl: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pr(state: &str, mergeable_state: Option<&str>, merged: bool) -> GithubPullRequest {
        GithubPullRequest {
            number: 12,
            state: state.to_string(),
            merged: Some(merged),
            merged_at: merged.then(|| "2024-05-01T00:00:00Z".parse().unwrap()),
            mergeable_state: mergeable_state.map(str::to_string),
            head: GithubRef {
                branch: "feature".to_string(),
            },
            base: GithubRef {
                branch: "main".to_string(),
            },
        }
    }

    #[test]
    fn test_status_mapping_table() {
        let cases = [
            (("open", Some("dirty"), false), PullRequestStatus::Conflicts),
            (("open", Some("blocked"), false), PullRequestStatus::Blocked),
            (("open", Some("clean"), false), PullRequestStatus::Active),
            (("open", Some("unstable"), false), PullRequestStatus::Active),
            (("open", None, false), PullRequestStatus::Active),
            (("closed", None, true), PullRequestStatus::Completed),
            (("closed", None, false), PullRequestStatus::Abandoned),
            (("unknown", None, false), PullRequestStatus::NotSet),
        ];
        for ((state, mergeable, merged), expected) in cases {
            let mapped = GithubHost::map_pull_request(pr(state, mergeable, merged));
            assert_eq!(mapped.status, expected, "{state}/{mergeable:?}/{merged}");
        }
    }

    #[test]
    fn test_conflict_flag_follows_mergeable_state() {
        let mapped = GithubHost::map_pull_request(pr("open", Some("dirty"), false));
        assert_eq!(mapped.has_conflicts, Some(true));
        assert_eq!(mapped.merge_status.as_deref(), Some("dirty"));

        let mapped = GithubHost::map_pull_request(pr("open", Some("clean"), false));
        assert_eq!(mapped.has_conflicts, Some(false));

        let mapped = GithubHost::map_pull_request(pr("open", None, false));
        assert_eq!(mapped.has_conflicts, None);
    }

    #[test]
    fn test_branches_flow_through() {
        let mapped = GithubHost::map_pull_request(pr("open", None, false));
        assert_eq!(mapped.source_branch, "feature");
        assert_eq!(mapped.target_branch, "main");
        assert_eq!(mapped.pull_number, 12);
    }
}
