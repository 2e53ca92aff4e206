//! Pull-request merge orchestration.
//!
//! One pull request moves through these states while
//! `update_and_merge_pull_request` runs:
//!
//! ```text
//!   Polled -> (Conflicts)  -> Rebased -> Polled
//!          -> (Blocked)    -> Waited  -> Polled
//!          -> (otherwise)  -> MergeAttempted -> { Done | retryable -> Polled }
//! ```
//!
//! A successful rebase-push always precedes the next merge attempt, and a
//! rebase workspace never outlives the rebase, whatever the outcome.

mod rebase;

use std::time::Duration;

use rand::Rng;
use tracing::{debug, info};
use utils::duration::time_text_to_millis;

use crate::api::GitHost;
use crate::coordinate::RepoCoordinate;
use crate::error::GitHostError;
use crate::resolve::ConflictResolver;
use crate::types::{MergePullRequestOptions, PullRequest, PullRequestStatus, UserConfig};

pub use rebase::rebase_with_remote;

/// How long one blocked-state wait lasts before the PR is polled again.
const BLOCKED_POLL_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Inputs for `rebase_branch`.
#[derive(Debug, Clone)]
pub struct RebaseRequest {
    pub source_branch: String,
    pub target_branch: String,
    pub user_config: Option<UserConfig>,
}

/// Caller hook OR-composed with the built-in merge-retry rules.
pub type RetryEvaluator<'a> = &'a (dyn Fn(&GitHostError) -> bool + Send + Sync);

/// Options for the full merge state machine.
pub struct UpdateAndMergeOptions<'a> {
    pub merge: MergePullRequestOptions,
    /// Total budget for waiting out a blocked PR, as duration text
    /// (`"1h30m"`); unparseable or absent means no waiting.
    pub wait_for_blocked: Option<String>,
    pub user_config: Option<UserConfig>,
    pub resolver: &'a dyn ConflictResolver,
    pub retry_evaluator: Option<RetryEvaluator<'a>>,
}

/// Rebase driven off an adapter coordinate: derive the credentialed remote
/// URL and run the workspace machine.
pub(crate) async fn rebase_for_coordinate(
    config: &RepoCoordinate,
    request: &RebaseRequest,
    resolver: &dyn ConflictResolver,
) -> Result<bool, GitHostError> {
    let remote = config.remote_url_with_credentials()?;
    rebase::rebase_with_remote(&remote, request, resolver, config.ca_cert.as_ref()).await
}

pub(crate) async fn drive_update_and_merge<H>(
    host: &H,
    options: &UpdateAndMergeOptions<'_>,
) -> Result<String, GitHostError>
where
    H: GitHost + ?Sized,
{
    let pull_number = options.merge.pull_number;
    let budget = Duration::from_millis(time_text_to_millis(
        options.wait_for_blocked.as_deref().unwrap_or_default(),
    ));
    let mut waited = Duration::ZERO;

    loop {
        let pr = host.get_pull_request(pull_number).await?;
        debug!(
            pull_number,
            status = %pr.status,
            merge_status = pr.merge_status.as_deref().unwrap_or("-"),
            "polled pull request"
        );

        match pr.status {
            PullRequestStatus::Conflicts => {
                info!(pull_number, "pull request has conflicts, rebasing source branch");
                host.rebase_branch(&rebase_request(&pr, options), options.resolver)
                    .await?;
            }
            PullRequestStatus::Blocked => {
                if waited >= budget {
                    return Err(GitHostError::MergeBlockedForPullRequest(pull_number));
                }
                debug!(
                    pull_number,
                    waited_secs = waited.as_secs(),
                    budget_secs = budget.as_secs(),
                    "pull request is blocked, waiting"
                );
                tokio::time::sleep(BLOCKED_POLL_INTERVAL).await;
                waited += BLOCKED_POLL_INTERVAL;
            }
            _ => match host.merge_pull_request_internal(&options.merge).await {
                Ok(message) => {
                    delete_source_branch(host, &options.merge, &pr).await;
                    info!(pull_number, "merged pull request");
                    return Ok(message);
                }
                Err(error) => {
                    let caller_retry = options
                        .retry_evaluator
                        .map(|evaluate| evaluate(&error))
                        .unwrap_or(false);
                    if !is_rebase_trigger(&error) && !caller_retry {
                        return Err(error);
                    }
                    debug!(pull_number, "merge attempt failed, rebasing and retrying: {error}");
                    host.rebase_branch(&rebase_request(&pr, options), options.resolver)
                        .await?;
                    tokio::time::sleep(post_rebase_delay()).await;
                }
            },
        }
    }
}

pub(crate) async fn drive_single_merge<H>(
    host: &H,
    options: &MergePullRequestOptions,
) -> Result<String, GitHostError>
where
    H: GitHost + ?Sized,
{
    let pr = if options.delete_source_branch {
        Some(host.get_pull_request(options.pull_number).await?)
    } else {
        None
    };

    let message = host.merge_pull_request_internal(options).await?;
    if let Some(pr) = pr {
        delete_source_branch(host, options, &pr).await;
    }
    info!(pull_number = options.pull_number, "merged pull request");
    Ok(message)
}

/// Best-effort deletion of the merged source branch; failures are logged and
/// swallowed.
async fn delete_source_branch<H>(host: &H, options: &MergePullRequestOptions, pr: &PullRequest)
where
    H: GitHost + ?Sized,
{
    if !options.delete_source_branch {
        return;
    }
    if let Err(error) = host.delete_branch(&pr.source_branch).await {
        debug!(
            pull_number = options.pull_number,
            branch = %pr.source_branch,
            "could not delete source branch: {error}"
        );
    }
}

fn rebase_request(pr: &PullRequest, options: &UpdateAndMergeOptions<'_>) -> RebaseRequest {
    RebaseRequest {
        source_branch: pr.source_branch.clone(),
        target_branch: pr.target_branch.clone(),
        user_config: options.user_config.clone(),
    }
}

/// Merge failures the orchestrator answers with a rebase instead of
/// surfacing: explicit conflicts, and the forges' "base moved under you"
/// responses.
fn is_rebase_trigger(error: &GitHostError) -> bool {
    match error {
        GitHostError::MergeConflict { .. } => true,
        GitHostError::Api { status, message, .. } => {
            let message = message.to_lowercase();
            match status {
                409 => true,
                405 => {
                    message.contains("base branch was modified")
                        || message.contains("pull request is not mergeable")
                }
                422 => message.contains("merge conflict between base and head"),
                _ => false,
            }
        }
        _ => false,
    }
}

fn post_rebase_delay() -> Duration {
    Duration::from_millis(1_000 + rand::rng().random_range(0..5_000))
}
