//! Pluggable conflict resolution for the rebase machine.
//!
//! A resolver is a value injected into `rebase_branch`; it sees the
//! workspace and the conflicted paths and says which of them it settled.
//! Compose behaviors by wrapping one resolver in another, not by extending
//! these types.

use std::path::Path;

use async_trait::async_trait;
use serde_yaml::Value;
use tracing::debug;

use crate::error::GitHostError;
use local_git::Workspace;

/// What a resolver did with one batch of conflicted files.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Files whose conflicts were settled and are ready to stage.
    pub resolved_conflicts: Vec<String>,
    /// Per-file failures; any entry aborts the rebase.
    pub conflict_errors: Vec<String>,
}

/// Converts conflicted files into resolved files, possibly with per-file
/// errors.
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    async fn resolve(
        &self,
        workspace: &Workspace,
        conflicted: &[String],
    ) -> Result<Resolution, GitHostError>;
}

/// Resolves nothing, so any conflict surfaces as unresolved.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultResolver;

#[async_trait]
impl ConflictResolver for DefaultResolver {
    async fn resolve(
        &self,
        _workspace: &Workspace,
        _conflicted: &[String],
    ) -> Result<Resolution, GitHostError> {
        Ok(Resolution::default())
    }
}

/// Line-union merge: both sides of every conflict are kept.
///
/// For each conflicted file the common ancestor and the two sides are
/// recovered from index stages 1/2/3, merged with
/// `git merge-file --union -p`, and written back into the working tree.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnionResolver;

#[async_trait]
impl ConflictResolver for UnionResolver {
    async fn resolve(
        &self,
        workspace: &Workspace,
        conflicted: &[String],
    ) -> Result<Resolution, GitHostError> {
        let git = workspace.git();
        let root = workspace.root();
        let mut resolution = Resolution::default();

        let scratch = tempfile::tempdir()
            .map_err(|e| GitHostError::Transport(format!("cannot create scratch dir: {e}")))?;

        for file in conflicted {
            let staged = async {
                let common = git.show_stage(root, 1, file).await?;
                let ours = git.show_stage(root, 2, file).await?;
                let theirs = git.show_stage(root, 3, file).await?;
                Ok::<_, GitHostError>((common, ours, theirs))
            }
            .await;

            let (common, ours, theirs) = match staged {
                Ok(stages) => stages,
                Err(error) => {
                    resolution
                        .conflict_errors
                        .push(format!("{file}: cannot recover merge stages: {error}"));
                    continue;
                }
            };

            let common_path = scratch.path().join("common");
            let ours_path = scratch.path().join("ours");
            let theirs_path = scratch.path().join("theirs");
            if let Err(error) = write_all(&common_path, &common)
                .and_then(|_| write_all(&ours_path, &ours))
                .and_then(|_| write_all(&theirs_path, &theirs))
            {
                resolution
                    .conflict_errors
                    .push(format!("{file}: {error}"));
                continue;
            }

            match git
                .merge_file_union(root, &ours_path, &common_path, &theirs_path)
                .await
            {
                Ok(merged) => {
                    if let Err(error) = write_all(&workspace.join(file), &merged) {
                        resolution.conflict_errors.push(format!("{file}: {error}"));
                        continue;
                    }
                    debug!(file = %file, "union-merged conflicted file");
                    resolution.resolved_conflicts.push(file.clone());
                }
                Err(error) => {
                    resolution
                        .conflict_errors
                        .push(format!("{file}: union merge failed: {error}"));
                }
            }
        }

        Ok(resolution)
    }
}

/// Resolver for conflicting `kustomization.yaml` files: keep our side, then
/// make sure the configured resource appears in the `resources:` list.
#[derive(Debug, Clone)]
pub struct KustomizeResolver {
    resource: String,
}

impl KustomizeResolver {
    pub fn new(resource: impl Into<String>) -> KustomizeResolver {
        KustomizeResolver {
            resource: resource.into(),
        }
    }
}

#[async_trait]
impl ConflictResolver for KustomizeResolver {
    async fn resolve(
        &self,
        workspace: &Workspace,
        conflicted: &[String],
    ) -> Result<Resolution, GitHostError> {
        let git = workspace.git();
        let root = workspace.root();
        let mut resolution = Resolution::default();

        for file in conflicted {
            let name = Path::new(file)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if name != "kustomization.yaml" {
                continue;
            }

            if let Err(error) = git.checkout_ours(root, file).await {
                resolution
                    .conflict_errors
                    .push(format!("{file}: cannot keep our side: {error}"));
                continue;
            }

            match add_resource(&workspace.join(file), &self.resource) {
                Ok(()) => {
                    debug!(file = %file, resource = %self.resource, "updated kustomization resources");
                    resolution.resolved_conflicts.push(file.clone());
                }
                Err(error) => resolution.conflict_errors.push(format!("{file}: {error}")),
            }
        }

        Ok(resolution)
    }
}

/// Insert `resource` into the file's `resources:` list, keeping the list
/// sorted and free of duplicates.
fn add_resource(path: &Path, resource: &str) -> Result<(), String> {
    let raw = std::fs::read_to_string(path).map_err(|e| format!("cannot read: {e}"))?;
    let mut doc: Value =
        serde_yaml::from_str(&raw).map_err(|e| format!("not valid yaml: {e}"))?;

    let mapping = doc
        .as_mapping_mut()
        .ok_or_else(|| "kustomization is not a mapping".to_string())?;

    let key = Value::String("resources".to_string());
    let mut resources: Vec<String> = match mapping.get(&key) {
        Some(Value::Sequence(items)) => items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    };
    resources.push(resource.to_string());
    resources.sort();
    resources.dedup();

    mapping.insert(
        key,
        Value::Sequence(resources.into_iter().map(Value::String).collect()),
    );

    let rendered = serde_yaml::to_string(&doc).map_err(|e| format!("cannot render yaml: {e}"))?;
    std::fs::write(path, rendered).map_err(|e| format!("cannot write: {e}"))
}

fn write_all(path: &Path, bytes: &[u8]) -> Result<(), String> {
    std::fs::write(path, bytes).map_err(|e| format!("cannot write {}: {e}", path.display()))
}
