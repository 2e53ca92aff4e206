//! The rebase-and-resolve workspace machine.

use std::path::{Path, PathBuf};

use rand::Rng;
use rand::distr::Alphanumeric;
use tracing::{debug, info};

use crate::error::GitHostError;
use crate::http::CaCert;
use crate::merge::RebaseRequest;
use crate::resolve::ConflictResolver;
use local_git::{CloneArgs, GitCli, Workspace};

/// Identity used for resolution commits when the caller supplies none.
const FALLBACK_USER: (&str, &str) = ("gitu", "gitu@localhost");

/// Scratch directory removed on every exit path, including cancellation.
struct WorkspaceGuard {
    dir: PathBuf,
}

impl WorkspaceGuard {
    fn new(dir: PathBuf) -> WorkspaceGuard {
        WorkspaceGuard { dir }
    }
}

impl Drop for WorkspaceGuard {
    fn drop(&mut self) {
        if let Err(error) = std::fs::remove_dir_all(&self.dir) {
            if error.kind() != std::io::ErrorKind::NotFound {
                debug!(dir = %self.dir.display(), "failed to remove rebase workspace: {error}");
            }
        }
    }
}

/// Rebase `request.source_branch` onto the target in a fresh clone of
/// `remote`, resolving conflicts through `resolver`, and push the result
/// with `--force-with-lease`.
///
/// Returns `false` when the source already contained the target and there
/// was nothing to push. The workspace under `/tmp/repo` is removed whether
/// the rebase succeeds, fails, or is cancelled.
pub async fn rebase_with_remote(
    remote: &str,
    request: &RebaseRequest,
    resolver: &dyn ConflictResolver,
    ca_cert: Option<&CaCert>,
) -> Result<bool, GitHostError> {
    let source = &request.source_branch;
    let target = &request.target_branch;

    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(5)
        .map(char::from)
        .collect();
    let dir = PathBuf::from(format!("/tmp/repo/{source}/rebase-{suffix}"));
    if let Some(parent) = dir.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| GitHostError::Transport(format!("cannot create workspace: {e}")))?;
    }
    let _guard = WorkspaceGuard::new(dir.clone());

    let git = GitCli::new();
    let (user_name, user_email) = request
        .user_config
        .as_ref()
        .map(|u| (u.name.clone(), u.email.clone()))
        .unwrap_or_else(|| (FALLBACK_USER.0.to_string(), FALLBACK_USER.1.to_string()));
    let mut clone_args = CloneArgs {
        config: vec![
            ("user.name".to_string(), user_name),
            ("user.email".to_string(), user_email),
            ("advice.detachedHead".to_string(), "false".to_string()),
        ],
        ..CloneArgs::default()
    };
    if let Some(ca) = ca_cert {
        clone_args.config.push((
            "http.sslCAInfo".to_string(),
            ca.path.to_string_lossy().into_owned(),
        ));
    }

    git.clone_repo(remote, &dir, &clone_args).await?;
    git.checkout_new(&dir, source, &format!("origin/{source}"))
        .await?;

    debug!(source = %source, target = %target, dir = %dir.display(), "rebasing");
    // The rebase's own exit status is uninformative; the status loop below
    // decides what happened.
    let _ = git.rebase(&dir, &format!("origin/{target}")).await?;

    resolve_until_clean(&git, &dir, resolver).await?;

    let status = git.status(&dir).await?;
    if status.ahead == 0 && status.behind == 0 {
        debug!(source = %source, "source already contains target, nothing to push");
        return Ok(false);
    }

    git.push(&dir, "origin", source, true).await?;
    info!(source = %source, target = %target, "rebased and pushed");
    Ok(true)
}

/// Step the stopped rebase forward until the working copy is clean, running
/// the resolver over every batch of conflicted files.
async fn resolve_until_clean(
    git: &GitCli,
    dir: &Path,
    resolver: &dyn ConflictResolver,
) -> Result<(), GitHostError> {
    loop {
        let status = git.status(dir).await?;
        if status.is_clean() {
            return Ok(());
        }

        if !status.conflicted.is_empty() {
            let workspace = Workspace::new(dir.to_path_buf());
            let resolution = resolver.resolve(&workspace, &status.conflicted).await?;

            if !resolution.conflict_errors.is_empty() {
                return Err(GitHostError::ConflictResolutionFailed(
                    resolution.conflict_errors,
                ));
            }
            let unresolved: Vec<String> = status
                .conflicted
                .iter()
                .filter(|file| !resolution.resolved_conflicts.contains(*file))
                .cloned()
                .collect();
            if !unresolved.is_empty() {
                return Err(GitHostError::UnresolvedConflicts(unresolved));
            }

            for file in &resolution.resolved_conflicts {
                git.add(dir, file).await?;
                git.commit(dir, &format!("Resolves conflict with {file}"))
                    .await?;
            }
        }

        let outcome = git.rebase_continue(dir).await?;
        let combined = outcome.combined();
        if combined.contains("No changes - did you forget to use 'git add'") {
            let _ = git.rebase_skip(dir).await?;
        } else if combined.to_lowercase().contains("no rebase in progress") {
            // Dirty for some reason other than the rebase; nothing further to
            // step through.
            return Ok(());
        }
    }
}
