//! Forge-independent error taxonomy.

use thiserror::Error;

use crate::types::ForgeKind;

/// Stable classification of every surfaced error, independent of which forge
/// produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InsufficientPermissions,
    BadCredentials,
    UserNotFound,
    InvalidGitUrl,
    RepoNotFound,
    GroupNotFound,
    WebhookAlreadyExists,
    UnknownWebhook,
    MergeConflict,
    NoCommitsForPullRequest,
    MergeBlockedForPullRequest,
    UnresolvedConflicts,
    ConflictResolutionFailed,
    Retryable,
    Fatal,
}

/// Errors surfaced by any forge operation.
#[derive(Debug, Error)]
pub enum GitHostError {
    #[error("invalid git url: {0}")]
    InvalidGitUrl(String),

    #[error("bad credentials: {0}")]
    BadCredentials(String),

    #[error("insufficient permissions: {0}")]
    InsufficientPermissions(String),

    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("repository not found: {0}")]
    RepoNotFound(String),

    #[error("group not found: {0}")]
    GroupNotFound(String),

    #[error("webhook already exists for {0}")]
    WebhookAlreadyExists(String),

    #[error("webhook error: {0}")]
    UnknownWebhook(String),

    #[error("merge conflict in pull request #{pull_number}: {message}")]
    MergeConflict { pull_number: u64, message: String },

    #[error("no commits for pull request: {0}")]
    NoCommitsForPullRequest(String),

    #[error("pull request #{0} is blocked from merging")]
    MergeBlockedForPullRequest(u64),

    #[error("conflicts left unresolved: {}", .0.join(", "))]
    UnresolvedConflicts(Vec<String>),

    #[error("conflict resolution failed: {}", .0.join("; "))]
    ConflictResolutionFailed(Vec<String>),

    /// Non-2xx forge response not recognized as any specific condition.
    #[error("{forge} responded {status}: {message}")]
    Api {
        forge: ForgeKind,
        status: u16,
        message: String,
    },

    /// Connection-level failure; always retryable.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to decode forge response: {0}")]
    Decode(String),

    #[error("git: {0}")]
    Git(#[from] local_git::GitError),

    #[error("{0} is not implemented for this forge")]
    NotImplemented(&'static str),
}

impl GitHostError {
    /// The stable, forge-independent classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            GitHostError::InvalidGitUrl(_) => ErrorKind::InvalidGitUrl,
            GitHostError::BadCredentials(_) => ErrorKind::BadCredentials,
            GitHostError::InsufficientPermissions(_) => ErrorKind::InsufficientPermissions,
            GitHostError::UserNotFound(_) => ErrorKind::UserNotFound,
            GitHostError::RepoNotFound(_) => ErrorKind::RepoNotFound,
            GitHostError::GroupNotFound(_) => ErrorKind::GroupNotFound,
            GitHostError::WebhookAlreadyExists(_) => ErrorKind::WebhookAlreadyExists,
            GitHostError::UnknownWebhook(_) => ErrorKind::UnknownWebhook,
            GitHostError::MergeConflict { .. } => ErrorKind::MergeConflict,
            GitHostError::NoCommitsForPullRequest(_) => ErrorKind::NoCommitsForPullRequest,
            GitHostError::MergeBlockedForPullRequest(_) => ErrorKind::MergeBlockedForPullRequest,
            GitHostError::UnresolvedConflicts(_) => ErrorKind::UnresolvedConflicts,
            GitHostError::ConflictResolutionFailed(_) => ErrorKind::ConflictResolutionFailed,
            GitHostError::Transport(_) => ErrorKind::Retryable,
            GitHostError::Api { .. }
            | GitHostError::Decode(_)
            | GitHostError::Git(_)
            | GitHostError::NotImplemented(_) => ErrorKind::Fatal,
        }
    }

    /// Whether the operation that produced this error may be retried as-is.
    pub fn should_retry(&self) -> bool {
        matches!(self.kind(), ErrorKind::Retryable)
    }

    /// The forge that produced the error, when one was involved.
    pub fn forge(&self) -> Option<ForgeKind> {
        match self {
            GitHostError::Api { forge, .. } => Some(*forge),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            GitHostError::InvalidGitUrl("x".into()).kind(),
            ErrorKind::InvalidGitUrl
        );
        assert_eq!(
            GitHostError::Transport("reset".into()).kind(),
            ErrorKind::Retryable
        );
        assert_eq!(
            GitHostError::Api {
                forge: ForgeKind::Github,
                status: 500,
                message: "boom".into()
            }
            .kind(),
            ErrorKind::Fatal
        );
    }

    #[test]
    fn test_only_transport_retries() {
        assert!(GitHostError::Transport("reset".into()).should_retry());
        assert!(!GitHostError::BadCredentials("no".into()).should_retry());
        assert!(
            !GitHostError::MergeConflict {
                pull_number: 1,
                message: "x".into()
            }
            .should_retry()
        );
    }
}
