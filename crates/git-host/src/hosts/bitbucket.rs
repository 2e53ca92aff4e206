//! Bitbucket Cloud adapter (api.bitbucket.org, REST 2.0).

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

const CONFLICT_MESSAGE: &str = "You can't merge until you resolve all merge conflicts.";

pub struct BitbucketHost {
    config: RepoCoordinate,
    client: HostClient,
}

impl BitbucketHost {
    pub fn attach(config: RepoCoordinate) -> Result<BitbucketHost, GitHostError> {
        let client = HostClient::new(
            "https://api.bitbucket.org/2.0",
            Auth::Basic {
                username: config.username.clone().unwrap_or_default(),
                token: config.password.clone().unwrap_or_default(),
            },
            config.ca_cert.as_ref(),
            RetryPolicy::default(),
        )?;
        Ok(BitbucketHost { config, client })
    }

    fn repo_path(&self) -> String {
        format!(
            "/repositories/{}/{}",
            self.config.owner,
            self.config.repo_name()
        )
    }

    async fn get(&self, operation: &str, path: &str) -> Result<ApiResponse, GitHostError> {
        self.client
            .execute(operation, Method::GET, path, Payload::Empty, &[])
            .await
    }

    /// Walk a paged 2.0 listing (`values` plus a `next` URL) to the end.
    async fn get_paged<T: serde::de::DeserializeOwned>(
        &self,
        operation: &str,
        first_path: &str,
    ) -> Result<Vec<T>, GitHostError> {
        let mut items = Vec::new();
        let mut next = Some(first_path.to_string());
        while let Some(path) = next {
            let response = self.get(operation, &path).await?;
            if !response.ok() {
                return Err(api_error(ForgeKind::Bitbucket, &response));
            }
            let page: BitbucketPage<T> = response.json()?;
            items.extend(page.values);
            next = page.next;
        }
        Ok(items)
    }

    async fn effective_branch(&self) -> Result<String, GitHostError> {
        match &self.config.branch {
            Some(branch) => Ok(branch.clone()),
            None => self.get_default_branch().await,
        }
    }

    fn map_pull_request(pr: BitbucketPullRequest) -> PullRequest {
        let status = match pr.state.as_str() {
            "OPEN" => PullRequestStatus::Active,
            "MERGED" => PullRequestStatus::Completed,
            "SUPERSEDED" | "DECLINED" => PullRequestStatus::Abandoned,
            _ => PullRequestStatus::NotSet,
        };
        PullRequest {
            pull_number: pr.id,
            source_branch: pr.source.branch.name,
            target_branch: pr.destination.branch.name,
            status,
            merge_status: Some(pr.state),
            has_conflicts: None,
        }
    }

    fn event_key(event: GitEvent) -> &'static str {
        match event {
            GitEvent::Push => "repo:push",
            GitEvent::PullRequest => "pullrequest:created",
        }
    }
}

#[async_trait]
impl GitHost for BitbucketHost {
    fn kind(&self) -> ForgeKind {
        ForgeKind::Bitbucket
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
            return Err(api_error(ForgeKind::Bitbucket, &response));
        }
        let repo: BitbucketRepo = response.json()?;
        Ok(RepoSummary {
            id: repo.uuid,
            slug: repo.full_name,
            http_url: repo.links.html.map(|l| l.href).unwrap_or_default(),
            name: repo.name,
            description: repo.description,
            is_private: repo.is_private,
            default_branch: repo.mainbranch.map(|b| b.name),
        })
    }

    async fn list_repos(&self) -> Result<Vec<String>, GitHostError> {
        let path = format!("/repositories/{}?pagelen=100", self.config.owner);
        let repos: Vec<BitbucketRepo> = self.get_paged("list-repos", &path).await?;
        Ok(repos
            .into_iter()
            .filter_map(|r| r.links.html.map(|l| l.href))
            .collect())
    }

    async fn create_repo(
        &self,
        options: &CreateRepoOptions,
    ) -> Result<Box<dyn GitHost>, GitHostError> {
        let path = format!("/repositories/{}/{}", self.config.owner, options.name);
        let body = serde_json::json!({
            "scm": "git",
            "is_private": options.private_repo,
        });
        let response = self
            .client
            .execute("create-repo", Method::POST, &path, Payload::Json(&body), &[])
            .await?;
        if !response.ok() {
            return Err(api_error(ForgeKind::Bitbucket, &response));
        }

        // No native auto-init here: seed the first commit by writing a README
        // through the src endpoint.
        if options.auto_init {
            let fields = vec![
                ("message".to_string(), "Initial commit".to_string()),
                ("/README.md".to_string(), format!("# {}\n", options.name)),
            ];
            let src_path = format!("{path}/src");
            let seeded = self
                .client
                .execute(
                    "init-repo",
                    Method::POST,
                    &src_path,
                    Payload::Form(&fields),
                    &[],
                )
                .await?;
            if !seeded.ok() {
                return Err(api_error(ForgeKind::Bitbucket, &seeded));
            }
        }
        info!(repo = %options.name, "created repository");
        crate::api::for_kind(ForgeKind::Bitbucket, self.config.with_repo(&options.name))
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
            return Err(api_error(ForgeKind::Bitbucket, &response));
        }
        info!(repo = %self.repo_path(), "deleted repository");
        crate::api::for_kind(ForgeKind::Bitbucket, self.config.org_scope())
    }

    async fn list_files(&self) -> Result<Vec<FileEntry>, GitHostError> {
        let branch = self.effective_branch().await?;
        let path = format!("{}/src/{branch}/?pagelen=100", self.repo_path());
        let entries: Vec<BitbucketSrcEntry> = self.get_paged("list-files", &path).await?;
        Ok(entries
            .into_iter()
            .filter(|e| e.kind == "commit_file")
            .map(|e| FileEntry {
                url: e.links.and_then(|l| l.self_link).map(|l| l.href),
                path: e.path,
            })
            .collect())
    }

    async fn get_file_contents(&self, entry: &FileEntry) -> Result<Vec<u8>, GitHostError> {
        let path = match &entry.url {
            Some(url) => url.clone(),
            None => {
                let branch = self.effective_branch().await?;
                format!("{}/src/{branch}/{}", self.repo_path(), entry.path)
            }
        };
        let response = self.get("get-file-contents", &path).await?;
        if !response.ok() {
            return Err(api_error(ForgeKind::Bitbucket, &response));
        }
        Ok(response.body)
    }

    async fn get_default_branch(&self) -> Result<String, GitHostError> {
        let info = self.get_repo_info().await?;
        Ok(info.default_branch.unwrap_or_else(|| "main".to_string()))
    }

    async fn get_branches(&self) -> Result<Vec<Branch>, GitHostError> {
        let path = format!("{}/refs/branches?pagelen=100", self.repo_path());
        let branches: Vec<BitbucketBranch> = self.get_paged("get-branches", &path).await?;
        Ok(branches
            .into_iter()
            .map(|b| Branch { name: b.name })
            .collect())
    }

    async fn delete_branch(&self, branch: &str) -> Result<(), GitHostError> {
        let path = format!("{}/refs/branches/{branch}", self.repo_path());
        let response = self
            .client
            .execute("delete-branch", Method::DELETE, &path, Payload::Empty, &[])
            .await?;
        if !response.ok() {
            return Err(api_error(ForgeKind::Bitbucket, &response));
        }
        Ok(())
    }

    async fn get_pull_request(&self, pull_number: u64) -> Result<PullRequest, GitHostError> {
        let path = format!("{}/pullrequests/{pull_number}", self.repo_path());
        let response = self.get("get-pull-request", &path).await?;
        if !response.ok() {
            return Err(api_error(ForgeKind::Bitbucket, &response));
        }
        Ok(Self::map_pull_request(response.json()?))
    }

    async fn create_pull_request(
        &self,
        options: &CreatePullRequestOptions,
    ) -> Result<PullRequest, GitHostError> {
        let path = format!("{}/pullrequests", self.repo_path());
        let body = serde_json::json!({
            "title": options.title,
            "source": { "branch": { "name": options.source_branch } },
            "destination": { "branch": { "name": options.target_branch } },
            "description": options.body.as_deref().unwrap_or_default(),
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
            if is_no_commits(&message) || message.contains("There are no changes") {
                return Err(GitHostError::NoCommitsForPullRequest(message));
            }
            return Err(api_error(ForgeKind::Bitbucket, &response));
        }
        let pr = Self::map_pull_request(response.json()?);
        info!(pull_number = pr.pull_number, "created pull request");
        Ok(pr)
    }

    async fn merge_pull_request_internal(
        &self,
        options: &MergePullRequestOptions,
    ) -> Result<String, GitHostError> {
        let path = format!("{}/pullrequests/{}/merge", self.repo_path(), options.pull_number);
        let mut body = serde_json::json!({
            "merge_strategy": match options.method {
                MergeMethod::Merge => "merge_commit",
                MergeMethod::Squash => "squash",
                MergeMethod::Rebase => "fast_forward",
            },
            "close_source_branch": options.delete_source_branch,
        });
        if let Some(message) = &options.merge_commit_message {
            body["message"] = serde_json::Value::String(message.clone());
        }
        let response = self
            .client
            .execute_with_policy(
                "merge-pull-request",
                &RetryPolicy::merge(),
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
        if message.contains(CONFLICT_MESSAGE) {
            return Err(GitHostError::MergeConflict {
                pull_number: options.pull_number,
                message,
            });
        }
        Err(api_error(ForgeKind::Bitbucket, &response))
    }

    async fn update_pull_request_branch(&self, _pull_number: u64) -> Result<(), GitHostError> {
        Err(GitHostError::NotImplemented("update_pull_request_branch"))
    }

    async fn get_webhooks(&self) -> Result<Vec<Webhook>, GitHostError> {
        let path = format!("{}/hooks?pagelen=100", self.repo_path());
        let hooks: Vec<BitbucketHook> = self.get_paged("get-webhooks", &path).await?;
        Ok(hooks
            .into_iter()
            .map(|hook| Webhook {
                id: hook.uuid,
                name: hook.description.unwrap_or_default(),
                active: hook.active,
                events: hook.events,
                config: WebhookConfig {
                    content_type: "json".to_string(),
                    url: hook.url,
                    insecure_ssl: if hook.skip_cert_verification {
                        "1".to_string()
                    } else {
                        "0".to_string()
                    },
                },
            })
            .collect())
    }

    async fn create_webhook(
        &self,
        options: &CreateWebhookOptions,
    ) -> Result<String, GitHostError> {
        let path = format!("{}/hooks", self.repo_path());
        let events: Vec<&str> = options.events.iter().map(|e| Self::event_key(*e)).collect();
        let body = serde_json::json!({
            "description": "gitu",
            "url": options.webhook_url,
            "active": true,
            "events": events,
            "skip_cert_verification": options.insecure_ssl,
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
            if response.status == 400 || response.status == 422 {
                return Err(GitHostError::UnknownWebhook(message));
            }
            return Err(api_error(ForgeKind::Bitbucket, &response));
        }
        let hook: BitbucketHook = response.json()?;
        info!(id = %hook.uuid, "created webhook");
        Ok(hook.uuid)
    }

    fn webhook_params(&self, event: GitEvent) -> WebhookParams {
        let ref_path = match event {
            GitEvent::Push => "body.push.changes[0].new.name",
            GitEvent::PullRequest => "body.pullrequest.source.branch.name",
        };
        WebhookParams {
            event_header: "X-Event-Key".to_string(),
            event_name: Self::event_key(event).to_string(),
            ref_path: ref_path.to_string(),
            repository_url_path: "body.repository.links.html.href".to_string(),
            repository_name_path: "body.repository.name".to_string(),
        }
    }
}

// Bitbucket API response structures

#[derive(Debug, Deserialize)]
struct BitbucketPage<T> {
    #[serde(default = "Vec::new")]
    values: Vec<T>,
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BitbucketRepo {
    uuid: String,
    name: String,
    full_name: String,
    description: Option<String>,
    #[serde(default)]
    is_private: bool,
    #[serde(default)]
    links: BitbucketLinks,
    mainbranch: Option<BitbucketBranch>,
}

#[derive(Debug, Default, Deserialize)]
struct BitbucketLinks {
    html: Option<BitbucketLink>,
}

#[derive(Debug, Deserialize)]
struct BitbucketLink {
    href: String,
}

#[derive(Debug, Deserialize)]
struct BitbucketBranch {
    name: String,
}

#[derive(Debug, Deserialize)]
struct BitbucketPullRequest {
    id: u64,
    state: String,
    source: BitbucketPrEndpoint,
    destination: BitbucketPrEndpoint,
}

#[derive(Debug, Deserialize)]
struct BitbucketPrEndpoint {
    branch: BitbucketBranch,
}

#[derive(Debug, Deserialize)]
struct BitbucketSrcEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    links: Option<BitbucketSrcLinks>,
}

#[derive(Debug, Deserialize)]
struct BitbucketSrcLinks {
    #[serde(rename = "self")]
    self_link: Option<BitbucketLink>,
}

#[derive(Debug, Deserialize)]
struct BitbucketHook {
    uuid: String,
    description: Option<String>,
    url: String,
    #[serde(default)]
    active: bool,
    #[serde(default)]
    events: Vec<String>,
    #[serde(default)]
    skip_cert_verification: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pr(state: &str) -> BitbucketPullRequest {
        BitbucketPullRequest {
            id: 9,
            state: state.to_string(),
            source: BitbucketPrEndpoint {
                branch: BitbucketBranch {
                    name: "feature".to_string(),
                },
            },
            destination: BitbucketPrEndpoint {
                branch: BitbucketBranch {
                    name: "main".to_string(),
                },
            },
        }
    }

    #[test]
    fn test_status_mapping_table() {
        let cases = [
            ("OPEN", PullRequestStatus::Active),
            ("MERGED", PullRequestStatus::Completed),
            ("SUPERSEDED", PullRequestStatus::Abandoned),
            ("DECLINED", PullRequestStatus::Abandoned),
            ("???", PullRequestStatus::NotSet),
        ];
        for (state, expected) in cases {
            let mapped = BitbucketHost::map_pull_request(pr(state));
            assert_eq!(mapped.status, expected, "{state}");
        }
    }

    #[test]
    fn test_conflict_message_is_exact() {
        assert!(
            "Bad request: You can't merge until you resolve all merge conflicts."
                .contains(CONFLICT_MESSAGE)
        );
    }
}
