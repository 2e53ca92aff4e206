//! GitLab adapter (gitlab.com and self-hosted, API v4).

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::Method;
use serde::Deserialize;
use tracing::{debug, info};

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

/// How often and how long to poll a merge request that is still in a
/// mergeability-checking state before attempting the merge.
const MERGE_STATUS_POLLS: u32 = 10;

pub struct GitlabHost {
    config: RepoCoordinate,
    client: HostClient,
}

impl GitlabHost {
    pub fn attach(config: RepoCoordinate) -> Result<GitlabHost, GitHostError> {
        let client = HostClient::new(
            format!("{}://{}/api/v4", config.protocol, config.host),
            Auth::Bearer {
                token: config.password.clone().unwrap_or_default(),
            },
            config.ca_cert.as_ref(),
            RetryPolicy::default(),
        )?;
        Ok(GitlabHost { config, client })
    }

    /// `{owner}%2F{repo}`, the URL-encoded project id GitLab expects.
    fn project_id(&self) -> String {
        format!(
            "{}%2F{}",
            urlencoding::encode(&self.config.owner),
            urlencoding::encode(self.config.repo_name())
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

    async fn group_id(&self) -> Result<i64, GitHostError> {
        let owner = &self.config.owner;
        let path = format!("/groups?search={}", urlencoding::encode(owner));
        let response = self.get("find-group", &path).await?;
        if !response.ok() {
            return Err(api_error(ForgeKind::Gitlab, &response));
        }
        let groups: Vec<GitlabGroup> = response.json()?;
        groups
            .iter()
            .find(|g| &g.path == owner || &g.full_path == owner)
            .or_else(|| groups.first())
            .map(|g| g.id)
            .ok_or_else(|| GitHostError::GroupNotFound(owner.clone()))
    }

    async fn fetch_merge_request(
        &self,
        pull_number: u64,
    ) -> Result<GitlabMergeRequest, GitHostError> {
        let path = format!("/projects/{}/merge_requests/{pull_number}", self.project_id());
        let response = self.get("get-merge-request", &path).await?;
        if !response.ok() {
            return Err(api_error(ForgeKind::Gitlab, &response));
        }
        response.json()
    }

    fn map_merge_request(mr: GitlabMergeRequest) -> PullRequest {
        let status = match mr.state.as_str() {
            "opened" => {
                if mr.merge_status.as_deref() == Some("cannot_be_merged") {
                    PullRequestStatus::Conflicts
                } else {
                    PullRequestStatus::Active
                }
            }
            _ => {
                if mr.merged_at.is_some() {
                    PullRequestStatus::Completed
                } else {
                    PullRequestStatus::Abandoned
                }
            }
        };
        let has_conflicts = mr
            .merge_status
            .as_deref()
            .map(|s| s == "cannot_be_merged");
        PullRequest {
            pull_number: mr.iid,
            source_branch: mr.source_branch,
            target_branch: mr.target_branch,
            status,
            merge_status: mr.merge_status,
            has_conflicts,
        }
    }

    fn event_fields(event: GitEvent) -> (&'static str, &'static str) {
        match event {
            GitEvent::Push => ("push_events", "Push Hook"),
            GitEvent::PullRequest => ("merge_requests_events", "Merge Request Hook"),
        }
    }
}

#[async_trait]
impl GitHost for GitlabHost {
    fn kind(&self) -> ForgeKind {
        ForgeKind::Gitlab
    }

    fn config(&self) -> RepoCoordinate {
        self.config.clone()
    }

    async fn get_repo_info(&self) -> Result<RepoSummary, GitHostError> {
        let path = format!("/projects/{}", self.project_id());
        let response = self.get("get-repo-info", &path).await?;
        if response.status == 404 {
            return Err(GitHostError::RepoNotFound(format!(
                "{}/{}",
                self.config.owner,
                self.config.repo_name()
            )));
        }
        if !response.ok() {
            return Err(api_error(ForgeKind::Gitlab, &response));
        }
        let project: GitlabProject = response.json()?;
        Ok(RepoSummary {
            id: project.id.to_string(),
            slug: project.path_with_namespace,
            http_url: project.web_url,
            name: project.name,
            description: project.description,
            is_private: project.visibility.as_deref() != Some("public"),
            default_branch: project.default_branch,
        })
    }

    async fn list_repos(&self) -> Result<Vec<String>, GitHostError> {
        let group = self.group_id().await?;
        let mut urls = Vec::new();
        let mut page = 1u32;
        loop {
            let path = format!("/groups/{group}/projects?per_page=100&page={page}");
            let response = self.get("list-repos", &path).await?;
            if !response.ok() {
                return Err(api_error(ForgeKind::Gitlab, &response));
            }
            let projects: Vec<GitlabProject> = response.json()?;
            let count = projects.len();
            urls.extend(projects.into_iter().map(|p| p.web_url));
            if count < 100 {
                return Ok(urls);
            }
            page += 1;
        }
    }

    async fn create_repo(
        &self,
        options: &CreateRepoOptions,
    ) -> Result<Box<dyn GitHost>, GitHostError> {
        let mut body = serde_json::json!({
            "name": options.name,
            "visibility": if options.private_repo { "private" } else { "public" },
            "initialize_with_readme": options.auto_init,
        });
        let owner_is_user = self
            .config
            .username
            .as_deref()
            .is_some_and(|user| user == self.config.owner);
        if !owner_is_user {
            body["namespace_id"] = serde_json::Value::from(self.group_id().await?);
        }

        let response = self
            .client
            .execute(
                "create-repo",
                Method::POST,
                "/projects",
                Payload::Json(&body),
                &[],
            )
            .await?;
        if !response.ok() {
            return Err(api_error(ForgeKind::Gitlab, &response));
        }
        info!(repo = %options.name, "created project");
        crate::api::for_kind(ForgeKind::Gitlab, self.config.with_repo(&options.name))
    }

    async fn delete_repo(&self) -> Result<Box<dyn GitHost>, GitHostError> {
        let path = format!("/projects/{}", self.project_id());
        let response = self
            .client
            .execute("delete-repo", Method::DELETE, &path, Payload::Empty, &[])
            .await?;
        if !response.ok() && response.status != 404 {
            return Err(api_error(ForgeKind::Gitlab, &response));
        }
        info!(project = %self.project_id(), "deleted project");
        crate::api::for_kind(ForgeKind::Gitlab, self.config.org_scope())
    }

    async fn list_files(&self) -> Result<Vec<FileEntry>, GitHostError> {
        let branch = self.effective_branch().await?;
        let path = format!(
            "/projects/{}/repository/tree?ref={}&recursive=true&per_page=1000",
            self.project_id(),
            urlencoding::encode(&branch)
        );
        let response = self.get("list-files", &path).await?;
        if !response.ok() {
            return Err(api_error(ForgeKind::Gitlab, &response));
        }
        let entries: Vec<GitlabTreeEntry> = response.json()?;
        Ok(entries
            .into_iter()
            .filter(|e| e.kind == "blob")
            .map(|e| FileEntry {
                path: e.path,
                url: None,
            })
            .collect())
    }

    async fn get_file_contents(&self, entry: &FileEntry) -> Result<Vec<u8>, GitHostError> {
        let branch = self.effective_branch().await?;
        let path = format!(
            "/projects/{}/repository/files/{}/raw?ref={}",
            self.project_id(),
            urlencoding::encode(&entry.path),
            urlencoding::encode(&branch)
        );
        let response = self.get("get-file-contents", &path).await?;
        if !response.ok() {
            return Err(api_error(ForgeKind::Gitlab, &response));
        }
        Ok(response.body)
    }

    async fn get_default_branch(&self) -> Result<String, GitHostError> {
        let info = self.get_repo_info().await?;
        Ok(info.default_branch.unwrap_or_else(|| "main".to_string()))
    }

    async fn get_branches(&self) -> Result<Vec<Branch>, GitHostError> {
        let path = format!(
            "/projects/{}/repository/branches?per_page=100",
            self.project_id()
        );
        let response = self.get("get-branches", &path).await?;
        if !response.ok() {
            return Err(api_error(ForgeKind::Gitlab, &response));
        }
        let branches: Vec<GitlabBranch> = response.json()?;
        Ok(branches
            .into_iter()
            .map(|b| Branch { name: b.name })
            .collect())
    }

    async fn delete_branch(&self, branch: &str) -> Result<(), GitHostError> {
        let path = format!(
            "/projects/{}/repository/branches/{}",
            self.project_id(),
            urlencoding::encode(branch)
        );
        let response = self
            .client
            .execute("delete-branch", Method::DELETE, &path, Payload::Empty, &[])
            .await?;
        if !response.ok() {
            return Err(api_error(ForgeKind::Gitlab, &response));
        }
        Ok(())
    }

    async fn get_pull_request(&self, pull_number: u64) -> Result<PullRequest, GitHostError> {
        Ok(Self::map_merge_request(
            self.fetch_merge_request(pull_number).await?,
        ))
    }

    async fn create_pull_request(
        &self,
        options: &CreatePullRequestOptions,
    ) -> Result<PullRequest, GitHostError> {
        let path = format!("/projects/{}/merge_requests", self.project_id());
        let body = serde_json::json!({
            "source_branch": options.source_branch,
            "target_branch": options.target_branch,
            "title": options.title,
            "description": options.body.as_deref().unwrap_or_default(),
        });
        let response = self
            .client
            .execute(
                "create-merge-request",
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
            return Err(api_error(ForgeKind::Gitlab, &response));
        }
        let mr = Self::map_merge_request(response.json()?);
        info!(pull_number = mr.pull_number, "created merge request");
        Ok(mr)
    }

    async fn merge_pull_request_internal(
        &self,
        options: &MergePullRequestOptions,
    ) -> Result<String, GitHostError> {
        // Wait out the mergeability check before attempting the merge.
        let mut mr = self.fetch_merge_request(options.pull_number).await?;
        let mut polls = MERGE_STATUS_POLLS;
        while matches!(
            mr.merge_status.as_deref(),
            Some("checking") | Some("unchecked") | Some("preparing")
        ) && polls > 0
        {
            debug!(
                pull_number = options.pull_number,
                merge_status = mr.merge_status.as_deref().unwrap_or("-"),
                "merge status still being computed"
            );
            let delay_ms = 1_000 + rand::rng().random_range(0..1_000);
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            mr = self.fetch_merge_request(options.pull_number).await?;
            polls -= 1;
        }
        if mr.merge_status.as_deref() != Some("can_be_merged") {
            return Err(GitHostError::MergeConflict {
                pull_number: options.pull_number,
                message: format!(
                    "merge_status is {}",
                    mr.merge_status.as_deref().unwrap_or("unknown")
                ),
            });
        }

        let path = format!(
            "/projects/{}/merge_requests/{}/merge",
            self.project_id(),
            options.pull_number
        );
        let body = match options.method {
            MergeMethod::Squash => serde_json::json!({
                "squash": true,
                "squash_commit_message": options.merge_commit_message,
            }),
            _ => serde_json::json!({
                "merge_commit_message": options.merge_commit_message,
            }),
        };
        let response = self
            .client
            .execute_with_policy(
                "merge-merge-request",
                &RetryPolicy::merge(),
                Method::PUT,
                &path,
                Payload::Json(&body),
                &[],
            )
            .await?;

        if response.ok() {
            let merged: GitlabMergeRequest = response.json()?;
            return Ok(merged
                .merge_commit_sha
                .unwrap_or_else(|| format!("merged !{}", options.pull_number)));
        }
        match response.status {
            405 | 406 => Err(GitHostError::MergeConflict {
                pull_number: options.pull_number,
                message: response.text(),
            }),
            _ => Err(api_error(ForgeKind::Gitlab, &response)),
        }
    }

    async fn update_pull_request_branch(&self, _pull_number: u64) -> Result<(), GitHostError> {
        Err(GitHostError::NotImplemented("update_pull_request_branch"))
    }

    async fn get_webhooks(&self) -> Result<Vec<Webhook>, GitHostError> {
        let path = format!("/projects/{}/hooks", self.project_id());
        let response = self.get("get-webhooks", &path).await?;
        if !response.ok() {
            return Err(api_error(ForgeKind::Gitlab, &response));
        }
        let hooks: Vec<GitlabHook> = response.json()?;
        Ok(hooks
            .into_iter()
            .map(|hook| {
                let mut events = Vec::new();
                if hook.push_events {
                    events.push("push".to_string());
                }
                if hook.merge_requests_events {
                    events.push("merge_requests".to_string());
                }
                Webhook {
                    id: hook.id.to_string(),
                    name: "web".to_string(),
                    active: true,
                    events,
                    config: WebhookConfig {
                        content_type: "json".to_string(),
                        url: hook.url,
                        insecure_ssl: if hook.enable_ssl_verification {
                            "0".to_string()
                        } else {
                            "1".to_string()
                        },
                    },
                }
            })
            .collect())
    }

    async fn create_webhook(
        &self,
        options: &CreateWebhookOptions,
    ) -> Result<String, GitHostError> {
        let path = format!("/projects/{}/hooks", self.project_id());
        let mut body = serde_json::json!({
            "url": options.webhook_url,
            "push_events": options.events.contains(&GitEvent::Push),
            "merge_requests_events": options.events.contains(&GitEvent::PullRequest),
            "enable_ssl_verification": !options.insecure_ssl,
        });
        if let Some(secret) = &options.secret {
            body["token"] = serde_json::Value::String(secret.clone());
        }
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
            return Err(api_error(ForgeKind::Gitlab, &response));
        }
        let hook: GitlabHook = response.json()?;
        info!(id = hook.id, "created webhook");
        Ok(hook.id.to_string())
    }

    fn webhook_params(&self, event: GitEvent) -> WebhookParams {
        let (_, event_name) = Self::event_fields(event);
        let ref_path = match event {
            GitEvent::Push => "body.ref",
            GitEvent::PullRequest => "body.object_attributes.source_branch",
        };
        WebhookParams {
            event_header: "X-Gitlab-Event".to_string(),
            event_name: event_name.to_string(),
            ref_path: ref_path.to_string(),
            repository_url_path: "body.project.git_http_url".to_string(),
            repository_name_path: "body.project.name".to_string(),
        }
    }
}

// GitLab API response structures

#[derive(Debug, Deserialize)]
struct GitlabProject {
    id: i64,
    name: String,
    path_with_namespace: String,
    web_url: String,
    description: Option<String>,
    visibility: Option<String>,
    default_branch: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitlabGroup {
    id: i64,
    path: String,
    #[serde(default)]
    full_path: String,
}

#[derive(Debug, Deserialize)]
struct GitlabMergeRequest {
    iid: u64,
    state: String,
    merge_status: Option<String>,
    merged_at: Option<chrono::DateTime<chrono::Utc>>,
    merge_commit_sha: Option<String>,
    source_branch: String,
    target_branch: String,
}

#[derive(Debug, Deserialize)]
struct GitlabTreeEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct GitlabBranch {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GitlabHook {
    id: i64,
    url: String,
    #[serde(default)]
    push_events: bool,
    #[serde(default)]
    merge_requests_events: bool,
    #[serde(default = "default_true")]
    enable_ssl_verification: bool,
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mr(state: &str, merge_status: Option<&str>, merged_at: Option<&str>) -> GitlabMergeRequest {
        GitlabMergeRequest {
            iid: 8,
            state: state.to_string(),
            merge_status: merge_status.map(str::to_string),
            merged_at: merged_at.map(|at| at.parse().unwrap()),
            merge_commit_sha: None,
            source_branch: "feature".to_string(),
            target_branch: "main".to_string(),
        }
    }

    #[test]
    fn test_status_mapping_table() {
        let cases = [
            (
                ("opened", Some("cannot_be_merged"), None),
                PullRequestStatus::Conflicts,
            ),
            (
                ("opened", Some("can_be_merged"), None),
                PullRequestStatus::Active,
            ),
            (("opened", Some("checking"), None), PullRequestStatus::Active),
            (("opened", None, None), PullRequestStatus::Active),
            (
                ("closed", None, Some("2024-05-01T00:00:00Z")),
                PullRequestStatus::Completed,
            ),
            (("closed", None, None), PullRequestStatus::Abandoned),
            (
                ("merged", None, Some("2024-05-01T00:00:00Z")),
                PullRequestStatus::Completed,
            ),
        ];
        for ((state, merge_status, merged_at), expected) in cases {
            let mapped = GitlabHost::map_merge_request(mr(state, merge_status, merged_at));
            assert_eq!(mapped.status, expected, "{state}/{merge_status:?}");
        }
    }

    #[test]
    fn test_conflict_flag() {
        let mapped = GitlabHost::map_merge_request(mr("opened", Some("cannot_be_merged"), None));
        assert_eq!(mapped.has_conflicts, Some(true));
        let mapped = GitlabHost::map_merge_request(mr("opened", Some("can_be_merged"), None));
        assert_eq!(mapped.has_conflicts, Some(false));
    }
}
