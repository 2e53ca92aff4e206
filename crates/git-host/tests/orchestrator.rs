//! Merge state machine against a scripted in-memory forge.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use git_host::{
    Branch, CloneOptions, ConflictResolver, CreatePullRequestOptions, CreateRepoOptions,
    CreateWebhookOptions, DefaultResolver, ErrorKind, FileEntry, ForgeKind, GitEvent, GitHost,
    GitHostError, MergePullRequestOptions, PullRequest, PullRequestStatus, RebaseRequest,
    RepoCoordinate, RepoSummary, UpdateAndMergeOptions, Webhook, WebhookParams,
};

fn pr(status: PullRequestStatus) -> PullRequest {
    PullRequest {
        pull_number: 17,
        source_branch: "feature".to_string(),
        target_branch: "main".to_string(),
        status,
        merge_status: None,
        has_conflicts: Some(status == PullRequestStatus::Conflicts),
    }
}

fn api_error(status: u16, message: &str) -> GitHostError {
    GitHostError::Api {
        forge: ForgeKind::Github,
        status,
        message: message.to_string(),
    }
}

/// Forge double that serves scripted poll and merge responses and records
/// rebase and branch-deletion calls.
#[derive(Default)]
struct ScriptedForge {
    polls: Mutex<VecDeque<PullRequest>>,
    merges: Mutex<VecDeque<Result<String, GitHostError>>>,
    rebases: Mutex<Vec<RebaseRequest>>,
    rebase_error: Mutex<Option<GitHostError>>,
    deleted_branches: Mutex<Vec<String>>,
    fail_branch_deletion: bool,
}

impl ScriptedForge {
    fn with_polls(statuses: &[PullRequestStatus]) -> ScriptedForge {
        let forge = ScriptedForge::default();
        forge
            .polls
            .lock()
            .unwrap()
            .extend(statuses.iter().map(|s| pr(*s)));
        forge
    }

    fn push_merge(&self, result: Result<String, GitHostError>) {
        self.merges.lock().unwrap().push_back(result);
    }

    fn rebase_count(&self) -> usize {
        self.rebases.lock().unwrap().len()
    }
}

#[async_trait]
impl GitHost for ScriptedForge {
    fn kind(&self) -> ForgeKind {
        ForgeKind::Github
    }

    fn config(&self) -> RepoCoordinate {
        RepoCoordinate::parse("https://github.com/owner/repo").unwrap()
    }

    async fn get_repo_info(&self) -> Result<RepoSummary, GitHostError> {
        Err(GitHostError::NotImplemented("get_repo_info"))
    }

    async fn list_repos(&self) -> Result<Vec<String>, GitHostError> {
        Err(GitHostError::NotImplemented("list_repos"))
    }

    async fn create_repo(
        &self,
        _options: &CreateRepoOptions,
    ) -> Result<Box<dyn GitHost>, GitHostError> {
        Err(GitHostError::NotImplemented("create_repo"))
    }

    async fn delete_repo(&self) -> Result<Box<dyn GitHost>, GitHostError> {
        Err(GitHostError::NotImplemented("delete_repo"))
    }

    async fn list_files(&self) -> Result<Vec<FileEntry>, GitHostError> {
        Err(GitHostError::NotImplemented("list_files"))
    }

    async fn get_file_contents(&self, _entry: &FileEntry) -> Result<Vec<u8>, GitHostError> {
        Err(GitHostError::NotImplemented("get_file_contents"))
    }

    async fn get_default_branch(&self) -> Result<String, GitHostError> {
        Ok("main".to_string())
    }

    async fn get_branches(&self) -> Result<Vec<Branch>, GitHostError> {
        Ok(Vec::new())
    }

    async fn delete_branch(&self, branch: &str) -> Result<(), GitHostError> {
        if self.fail_branch_deletion {
            return Err(api_error(500, "boom"));
        }
        self.deleted_branches.lock().unwrap().push(branch.to_string());
        Ok(())
    }

    async fn get_pull_request(&self, _pull_number: u64) -> Result<PullRequest, GitHostError> {
        self.polls
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| api_error(500, "poll script exhausted"))
    }

    async fn create_pull_request(
        &self,
        _options: &CreatePullRequestOptions,
    ) -> Result<PullRequest, GitHostError> {
        Err(GitHostError::NotImplemented("create_pull_request"))
    }

    async fn merge_pull_request_internal(
        &self,
        _options: &MergePullRequestOptions,
    ) -> Result<String, GitHostError> {
        self.merges
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(api_error(500, "merge script exhausted")))
    }

    async fn update_pull_request_branch(&self, _pull_number: u64) -> Result<(), GitHostError> {
        Err(GitHostError::NotImplemented("update_pull_request_branch"))
    }

    async fn get_webhooks(&self) -> Result<Vec<Webhook>, GitHostError> {
        Ok(Vec::new())
    }

    async fn create_webhook(
        &self,
        _options: &CreateWebhookOptions,
    ) -> Result<String, GitHostError> {
        Err(GitHostError::NotImplemented("create_webhook"))
    }

    fn webhook_params(&self, _event: GitEvent) -> WebhookParams {
        unreachable!("not used by the merge driver")
    }

    async fn clone_repo(
        &self,
        _options: &CloneOptions,
    ) -> Result<local_git::Workspace, GitHostError> {
        Err(GitHostError::NotImplemented("clone_repo"))
    }

    async fn rebase_branch(
        &self,
        request: &RebaseRequest,
        _resolver: &dyn ConflictResolver,
    ) -> Result<bool, GitHostError> {
        if let Some(error) = self.rebase_error.lock().unwrap().take() {
            return Err(error);
        }
        self.rebases.lock().unwrap().push(request.clone());
        Ok(true)
    }
}

fn options(wait_for_blocked: Option<&str>) -> UpdateAndMergeOptions<'static> {
    UpdateAndMergeOptions {
        merge: MergePullRequestOptions {
            pull_number: 17,
            ..MergePullRequestOptions::default()
        },
        wait_for_blocked: wait_for_blocked.map(str::to_string),
        user_config: None,
        resolver: &DefaultResolver,
        retry_evaluator: None,
    }
}

#[tokio::test(start_paused = true)]
async fn test_blocked_pr_waits_then_merges() {
    let forge =
        ScriptedForge::with_polls(&[PullRequestStatus::Blocked, PullRequestStatus::Active]);
    forge.push_merge(Ok("merged-after-wait".to_string()));

    let started = tokio::time::Instant::now();
    let message = forge
        .update_and_merge_pull_request(&options(Some("10m")))
        .await
        .unwrap();

    assert_eq!(message, "merged-after-wait");
    assert_eq!(forge.rebase_count(), 0);
    // One full blocked-poll interval elapsed on the test clock.
    assert!(started.elapsed() >= Duration::from_secs(300));
}

#[tokio::test(start_paused = true)]
async fn test_blocked_budget_exhaustion_surfaces() {
    let forge =
        ScriptedForge::with_polls(&[PullRequestStatus::Blocked, PullRequestStatus::Blocked]);

    let error = forge
        .update_and_merge_pull_request(&options(Some("5m")))
        .await
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::MergeBlockedForPullRequest);
}

#[tokio::test(start_paused = true)]
async fn test_no_budget_means_no_waiting() {
    let forge = ScriptedForge::with_polls(&[PullRequestStatus::Blocked]);

    let error = forge
        .update_and_merge_pull_request(&options(None))
        .await
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::MergeBlockedForPullRequest);
}

#[tokio::test(start_paused = true)]
async fn test_base_modified_rebases_once_then_returns_second_message() {
    let forge =
        ScriptedForge::with_polls(&[PullRequestStatus::Active, PullRequestStatus::Active]);
    forge.push_merge(Err(api_error(405, "Base branch was modified")));
    forge.push_merge(Ok("second-attempt".to_string()));

    let message = forge
        .update_and_merge_pull_request(&options(None))
        .await
        .unwrap();

    assert_eq!(message, "second-attempt");
    assert_eq!(forge.rebase_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_conflicted_pr_rebases_before_merging() {
    let forge =
        ScriptedForge::with_polls(&[PullRequestStatus::Conflicts, PullRequestStatus::Active]);
    forge.push_merge(Ok("merged".to_string()));

    let message = forge
        .update_and_merge_pull_request(&options(None))
        .await
        .unwrap();

    assert_eq!(message, "merged");
    assert_eq!(forge.rebase_count(), 1);
    let rebases = forge.rebases.lock().unwrap();
    assert_eq!(rebases[0].source_branch, "feature");
    assert_eq!(rebases[0].target_branch, "main");
}

#[tokio::test(start_paused = true)]
async fn test_unresolved_conflicts_abort() {
    let forge = ScriptedForge::with_polls(&[PullRequestStatus::Conflicts]);
    *forge.rebase_error.lock().unwrap() = Some(GitHostError::UnresolvedConflicts(vec![
        "kustomization.yaml".to_string(),
    ]));

    let error = forge
        .update_and_merge_pull_request(&options(None))
        .await
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::UnresolvedConflicts);
    assert_eq!(forge.rebase_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_merge_error_surfaces_without_rebase() {
    let forge = ScriptedForge::with_polls(&[PullRequestStatus::Active]);
    forge.push_merge(Err(GitHostError::BadCredentials("expired token".to_string())));

    let error = forge
        .update_and_merge_pull_request(&options(None))
        .await
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::BadCredentials);
    assert_eq!(forge.rebase_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_caller_retry_evaluator_is_composed() {
    let forge =
        ScriptedForge::with_polls(&[PullRequestStatus::Active, PullRequestStatus::Active]);
    forge.push_merge(Err(api_error(503, "flaky mirror")));
    forge.push_merge(Ok("after-custom-retry".to_string()));

    let evaluate: &(dyn Fn(&GitHostError) -> bool + Send + Sync) =
        &|error: &GitHostError| matches!(error, GitHostError::Api { status: 503, .. });
    let options = UpdateAndMergeOptions {
        retry_evaluator: Some(evaluate),
        ..options(None)
    };

    let message = forge.update_and_merge_pull_request(&options).await.unwrap();
    assert_eq!(message, "after-custom-retry");
    assert_eq!(forge.rebase_count(), 1);
}

#[tokio::test]
async fn test_single_shot_merge_deletes_source_branch_best_effort() {
    let forge = ScriptedForge::with_polls(&[PullRequestStatus::Active]);
    forge.push_merge(Ok("merged".to_string()));

    let message = forge
        .merge_pull_request(&MergePullRequestOptions {
            pull_number: 17,
            delete_source_branch: true,
            ..MergePullRequestOptions::default()
        })
        .await
        .unwrap();

    assert_eq!(message, "merged");
    assert_eq!(
        *forge.deleted_branches.lock().unwrap(),
        vec!["feature".to_string()]
    );
}

#[tokio::test]
async fn test_branch_deletion_failures_are_swallowed() {
    let forge = ScriptedForge {
        fail_branch_deletion: true,
        ..ScriptedForge::default()
    };
    forge
        .polls
        .lock()
        .unwrap()
        .push_back(pr(PullRequestStatus::Active));
    forge.push_merge(Ok("merged".to_string()));

    let message = forge
        .merge_pull_request(&MergePullRequestOptions {
            pull_number: 17,
            delete_source_branch: true,
            ..MergePullRequestOptions::default()
        })
        .await
        .unwrap();

    assert_eq!(message, "merged");
}
