//! Azure DevOps adapter (`dev.azure.com`, REST `_apis`, api-version 6.0).

use async_trait::async_trait;
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

const API_VERSION: &str = "api-version=6.0";
const ZERO_OID: &str = "0000000000000000000000000000000000000000";

pub struct AzureHost {
    config: RepoCoordinate,
    client: HostClient,
}

impl AzureHost {
    pub fn attach(config: RepoCoordinate) -> Result<AzureHost, GitHostError> {
        let client = HostClient::new(
            format!("https://dev.azure.com/{}", config.owner),
            Auth::Bearer {
                token: config.password.clone().unwrap_or_default(),
            },
            config.ca_cert.as_ref(),
            RetryPolicy::default(),
        )?;
        Ok(AzureHost { config, client })
    }

    fn project(&self) -> &str {
        self.config.project.as_deref().unwrap_or_default()
    }

    fn repo_api(&self, suffix: &str) -> String {
        format!(
            "/{}/_apis/git/repositories/{}{}?{}",
            self.project(),
            self.config.repo_name(),
            suffix,
            API_VERSION
        )
    }

    async fn get(&self, operation: &str, path: &str) -> Result<ApiResponse, GitHostError> {
        self.client
            .execute(operation, Method::GET, path, Payload::Empty, &[])
            .await
    }

    async fn fetch_repo(&self) -> Result<AzureRepo, GitHostError> {
        let response = self.get("get-repo-info", &self.repo_api("")).await?;
        if response.status == 404 {
            return Err(GitHostError::RepoNotFound(format!(
                "{}/{}/{}",
                self.config.owner,
                self.project(),
                self.config.repo_name()
            )));
        }
        if !response.ok() {
            return Err(api_error(ForgeKind::Azure, &response));
        }
        response.json()
    }

    async fn fetch_pull_request(
        &self,
        pull_number: u64,
    ) -> Result<AzurePullRequest, GitHostError> {
        let path = self.repo_api(&format!("/pullrequests/{pull_number}"));
        let response = self.get("get-pull-request", &path).await?;
        if !response.ok() {
            return Err(api_error(ForgeKind::Azure, &response));
        }
        response.json()
    }

    fn map_pull_request(pr: AzurePullRequest) -> PullRequest {
        let merge_status = pr.merge_status.clone();
        let status = match pr.status.as_str() {
            "active" => match merge_status.as_deref() {
                Some("rejectedByPolicy") => PullRequestStatus::Blocked,
                Some("conflicts") => PullRequestStatus::Conflicts,
                _ => PullRequestStatus::Active,
            },
            "abandoned" => PullRequestStatus::Abandoned,
            "completed" => PullRequestStatus::Completed,
            _ => PullRequestStatus::NotSet,
        };
        PullRequest {
            pull_number: pr.pull_request_id,
            source_branch: strip_ref(&pr.source_ref_name),
            target_branch: strip_ref(&pr.target_ref_name),
            status,
            has_conflicts: merge_status.as_deref().map(|s| s == "conflicts"),
            merge_status,
        }
    }
}

#[async_trait]
impl GitHost for AzureHost {
    fn kind(&self) -> ForgeKind {
        ForgeKind::Azure
    }

    fn config(&self) -> RepoCoordinate {
        self.config.clone()
    }

    async fn get_repo_info(&self) -> Result<RepoSummary, GitHostError> {
        let repo = self.fetch_repo().await?;
        Ok(RepoSummary {
            id: repo.id,
            slug: format!("{}/{}", self.project(), repo.name),
            http_url: repo.web_url.unwrap_or_default(),
            name: repo.name,
            description: None,
            is_private: repo
                .project
                .and_then(|p| p.visibility)
                .as_deref()
                != Some("public"),
            default_branch: repo.default_branch.as_deref().map(strip_ref),
        })
    }

    async fn list_repos(&self) -> Result<Vec<String>, GitHostError> {
        let path = format!("/{}/_apis/git/repositories?{}", self.project(), API_VERSION);
        let response = self.get("list-repos", &path).await?;
        if response.status == 404 {
            return Err(GitHostError::GroupNotFound(self.project().to_string()));
        }
        if !response.ok() {
            return Err(api_error(ForgeKind::Azure, &response));
        }
        let listing: AzureList<AzureRepo> = response.json()?;
        Ok(listing
            .value
            .into_iter()
            .filter_map(|r| r.remote_url.or(r.web_url))
            .collect())
    }

    async fn create_repo(
        &self,
        options: &CreateRepoOptions,
    ) -> Result<Box<dyn GitHost>, GitHostError> {
        let path = format!("/{}/_apis/git/repositories?{}", self.project(), API_VERSION);
        let body = serde_json::json!({ "name": options.name });
        let response = self
            .client
            .execute("create-repo", Method::POST, &path, Payload::Json(&body), &[])
            .await?;
        if !response.ok() {
            return Err(api_error(ForgeKind::Azure, &response));
        }

        // No native auto-init: push a README as the first commit.
        if options.auto_init {
            let push_path = format!(
                "/{}/_apis/git/repositories/{}/pushes?{}",
                self.project(),
                options.name,
                API_VERSION
            );
            let push = serde_json::json!({
                "refUpdates": [{ "name": "refs/heads/main", "oldObjectId": ZERO_OID }],
                "commits": [{
                    "comment": "Initial commit",
                    "changes": [{
                        "changeType": "add",
                        "item": { "path": "/README.md" },
                        "newContent": {
                            "content": format!("# {}\n", options.name),
                            "contentType": "rawtext",
                        },
                    }],
                }],
            });
            let seeded = self
                .client
                .execute(
                    "init-repo",
                    Method::POST,
                    &push_path,
                    Payload::Json(&push),
                    &[],
                )
                .await?;
            if !seeded.ok() {
                return Err(api_error(ForgeKind::Azure, &seeded));
            }
        }
        info!(repo = %options.name, "created repository");
        crate::api::for_kind(ForgeKind::Azure, self.config.with_repo(&options.name))
    }

    async fn delete_repo(&self) -> Result<Box<dyn GitHost>, GitHostError> {
        // Deletion is by repository id, not name.
        let repo = self.fetch_repo().await?;
        let path = format!(
            "/{}/_apis/git/repositories/{}?{}",
            self.project(),
            repo.id,
            API_VERSION
        );
        let response = self
            .client
            .execute("delete-repo", Method::DELETE, &path, Payload::Empty, &[])
            .await?;
        if !response.ok() && response.status != 404 {
            return Err(api_error(ForgeKind::Azure, &response));
        }
        info!(repo = %repo.name, "deleted repository");
        crate::api::for_kind(ForgeKind::Azure, self.config.org_scope())
    }

    async fn list_files(&self) -> Result<Vec<FileEntry>, GitHostError> {
        Err(GitHostError::NotImplemented("list_files"))
    }

    async fn get_file_contents(&self, _entry: &FileEntry) -> Result<Vec<u8>, GitHostError> {
        Err(GitHostError::NotImplemented("get_file_contents"))
    }

    async fn get_default_branch(&self) -> Result<String, GitHostError> {
        let info = self.get_repo_info().await?;
        Ok(info.default_branch.unwrap_or_else(|| "main".to_string()))
    }

    async fn get_branches(&self) -> Result<Vec<Branch>, GitHostError> {
        let path = format!(
            "/{}/_apis/git/repositories/{}/refs?filter=heads/&{}",
            self.project(),
            self.config.repo_name(),
            API_VERSION
        );
        let response = self.get("get-branches", &path).await?;
        if !response.ok() {
            return Err(api_error(ForgeKind::Azure, &response));
        }
        let listing: AzureList<AzureRef> = response.json()?;
        Ok(listing
            .value
            .into_iter()
            .map(|r| Branch {
                name: strip_ref(&r.name),
            })
            .collect())
    }

    async fn delete_branch(&self, branch: &str) -> Result<(), GitHostError> {
        // Ref updates need the current object id.
        let lookup = format!(
            "/{}/_apis/git/repositories/{}/refs?filter=heads/{}&{}",
            self.project(),
            self.config.repo_name(),
            branch,
            API_VERSION
        );
        let response = self.get("delete-branch", &lookup).await?;
        if !response.ok() {
            return Err(api_error(ForgeKind::Azure, &response));
        }
        let listing: AzureList<AzureRef> = response.json()?;
        let current = listing
            .value
            .into_iter()
            .find(|r| r.name == format!("refs/heads/{branch}"))
            .ok_or_else(|| GitHostError::RepoNotFound(format!("branch {branch}")))?;

        let path = self.repo_api("/refs");
        let body = serde_json::json!([{
            "name": format!("refs/heads/{branch}"),
            "oldObjectId": current.object_id,
            "newObjectId": ZERO_OID,
        }]);
        let response = self
            .client
            .execute("delete-branch", Method::POST, &path, Payload::Json(&body), &[])
            .await?;
        if !response.ok() {
            return Err(api_error(ForgeKind::Azure, &response));
        }
        Ok(())
    }

    async fn get_pull_request(&self, pull_number: u64) -> Result<PullRequest, GitHostError> {
        Ok(Self::map_pull_request(
            self.fetch_pull_request(pull_number).await?,
        ))
    }

    async fn create_pull_request(
        &self,
        options: &CreatePullRequestOptions,
    ) -> Result<PullRequest, GitHostError> {
        let path = self.repo_api("/pullrequests");
        let body = serde_json::json!({
            "sourceRefName": format!("refs/heads/{}", options.source_branch),
            "targetRefName": format!("refs/heads/{}", options.target_branch),
            "title": options.title,
            "description": options.body.as_deref().unwrap_or_default(),
            "isDraft": options.draft,
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
            return Err(api_error(ForgeKind::Azure, &response));
        }
        let pr = Self::map_pull_request(response.json()?);
        info!(pull_number = pr.pull_number, "created pull request");
        Ok(pr)
    }

    async fn merge_pull_request_internal(
        &self,
        options: &MergePullRequestOptions,
    ) -> Result<String, GitHostError> {
        let pr = self.fetch_pull_request(options.pull_number).await?;
        let last_merge_source = pr
            .last_merge_source_commit
            .as_ref()
            .map(|c| c.commit_id.clone())
            .unwrap_or_default();

        let path = self.repo_api(&format!("/pullrequests/{}", options.pull_number));
        let body = serde_json::json!({
            "status": "completed",
            "lastMergeSourceCommit": { "commitId": last_merge_source },
            "completionOptions": {
                "mergeStrategy": match options.method {
                    MergeMethod::Merge => "rebaseMerge",
                    MergeMethod::Rebase => "rebase",
                    MergeMethod::Squash => "squash",
                },
                "deleteSourceBranch": options.delete_source_branch,
                "mergeCommitMessage": options.merge_commit_message,
            },
        });
        let response = self
            .client
            .execute_with_policy(
                "merge-pull-request",
                &RetryPolicy::merge(),
                Method::PATCH,
                &path,
                Payload::Json(&body),
                &[],
            )
            .await?;

        // Mergeability is recomputed server-side; the conflicts listing is
        // the reliable signal either way.
        let conflicts_path = self.repo_api(&format!(
            "/pullrequests/{}/conflicts",
            options.pull_number
        ));
        if let Ok(conflicts_response) = self.get("get-pull-request-conflicts", &conflicts_path).await
        {
            if conflicts_response.ok() {
                if let Ok(conflicts) = conflicts_response.json::<AzureList<serde_json::Value>>() {
                    if !conflicts.value.is_empty() {
                        return Err(GitHostError::MergeConflict {
                            pull_number: options.pull_number,
                            message: format!("{} conflicting files", conflicts.value.len()),
                        });
                    }
                }
            }
        }

        if !response.ok() {
            return Err(api_error(ForgeKind::Azure, &response));
        }
        let merged: AzurePullRequest = response.json()?;
        Ok(merged
            .last_merge_commit
            .map(|c| c.commit_id)
            .unwrap_or_else(|| format!("completed #{}", options.pull_number)))
    }

    async fn update_pull_request_branch(&self, _pull_number: u64) -> Result<(), GitHostError> {
        Err(GitHostError::NotImplemented("update_pull_request_branch"))
    }

    async fn get_webhooks(&self) -> Result<Vec<Webhook>, GitHostError> {
        let path = format!("/_apis/hooks/subscriptions?{API_VERSION}");
        let response = self.get("get-webhooks", &path).await?;
        if !response.ok() {
            return Err(api_error(ForgeKind::Azure, &response));
        }
        let listing: AzureList<AzureSubscription> = response.json()?;
        Ok(listing
            .value
            .into_iter()
            .filter(|s| s.publisher_id == "tfs")
            .map(|s| Webhook {
                id: s.id,
                name: s.event_type.clone(),
                active: s.status.as_deref() != Some("disabledByUser"),
                events: vec![s.event_type],
                config: WebhookConfig {
                    content_type: "json".to_string(),
                    url: s
                        .consumer_inputs
                        .and_then(|c| c.url)
                        .unwrap_or_default(),
                    insecure_ssl: "0".to_string(),
                },
            })
            .collect())
    }

    async fn create_webhook(
        &self,
        options: &CreateWebhookOptions,
    ) -> Result<String, GitHostError> {
        let repo = self.fetch_repo().await?;
        let project_id = repo.project.as_ref().and_then(|p| p.id.clone());
        let event = options
            .events
            .first()
            .copied()
            .unwrap_or(GitEvent::Push);
        let path = format!("/_apis/hooks/subscriptions?{API_VERSION}");
        let body = serde_json::json!({
            "publisherId": "tfs",
            "eventType": azure_event_type(event),
            "resourceVersion": "1.0",
            "consumerId": "webHooks",
            "consumerActionId": "httpRequest",
            "publisherInputs": {
                "projectId": project_id,
                "repository": repo.id,
            },
            "consumerInputs": {
                "url": options.webhook_url,
            },
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
        if !response.ok() {
            let message = response.text();
            if response.status == 400 {
                return Err(GitHostError::UnknownWebhook(message));
            }
            return Err(api_error(ForgeKind::Azure, &response));
        }
        let subscription: AzureSubscription = response.json()?;
        info!(id = %subscription.id, "created webhook subscription");
        Ok(subscription.id)
    }

    fn webhook_params(&self, event: GitEvent) -> WebhookParams {
        let ref_path = match event {
            GitEvent::Push => "body.resource.refUpdates[0].name",
            GitEvent::PullRequest => "body.resource.sourceRefName",
        };
        WebhookParams {
            // Deliveries carry the event only in the payload (`body.eventType`).
            event_header: String::new(),
            event_name: azure_event_type(event).to_string(),
            ref_path: ref_path.to_string(),
            repository_url_path: "body.resource.repository.remoteUrl".to_string(),
            repository_name_path: "body.resource.repository.name".to_string(),
        }
    }
}

fn azure_event_type(event: GitEvent) -> &'static str {
    match event {
        GitEvent::Push => "git.push",
        GitEvent::PullRequest => "git.pullrequest.created",
    }
}

fn strip_ref(name: &str) -> String {
    name.trim_start_matches("refs/heads/").to_string()
}

// Azure DevOps API response structures

#[derive(Debug, Deserialize)]
struct AzureList<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AzureRepo {
    id: String,
    name: String,
    web_url: Option<String>,
    remote_url: Option<String>,
    default_branch: Option<String>,
    project: Option<AzureProject>,
}

#[derive(Debug, Deserialize)]
struct AzureProject {
    id: Option<String>,
    visibility: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AzurePullRequest {
    pull_request_id: u64,
    status: String,
    merge_status: Option<String>,
    source_ref_name: String,
    target_ref_name: String,
    last_merge_source_commit: Option<AzureCommitRef>,
    last_merge_commit: Option<AzureCommitRef>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AzureCommitRef {
    commit_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AzureRef {
    name: String,
    object_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AzureSubscription {
    id: String,
    publisher_id: String,
    event_type: String,
    status: Option<String>,
    consumer_inputs: Option<AzureConsumerInputs>,
}

#[derive(Debug, Deserialize)]
struct AzureConsumerInputs {
    url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pr(status: &str, merge_status: Option<&str>) -> AzurePullRequest {
        AzurePullRequest {
            pull_request_id: 21,
            status: status.to_string(),
            merge_status: merge_status.map(str::to_string),
            source_ref_name: "refs/heads/feature".to_string(),
            target_ref_name: "refs/heads/main".to_string(),
            last_merge_source_commit: None,
            last_merge_commit: None,
        }
    }

    #[test]
    fn test_status_mapping_table() {
        let cases = [
            (("active", Some("rejectedByPolicy")), PullRequestStatus::Blocked),
            (("active", Some("conflicts")), PullRequestStatus::Conflicts),
            (("active", Some("succeeded")), PullRequestStatus::Active),
            (("active", Some("queued")), PullRequestStatus::Active),
            (("active", None), PullRequestStatus::Active),
            (("abandoned", None), PullRequestStatus::Abandoned),
            (("completed", Some("succeeded")), PullRequestStatus::Completed),
            (("notSet", None), PullRequestStatus::NotSet),
        ];
        for ((status, merge_status), expected) in cases {
            let mapped = AzureHost::map_pull_request(pr(status, merge_status));
            assert_eq!(mapped.status, expected, "{status}/{merge_status:?}");
        }
    }

    #[test]
    fn test_ref_names_are_stripped() {
        let mapped = AzureHost::map_pull_request(pr("active", None));
        assert_eq!(mapped.source_branch, "feature");
        assert_eq!(mapped.target_branch, "main");
    }
}
