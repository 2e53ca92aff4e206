//! Rebase-and-resolve machine against real local repositories.
//!
//! A bare repository plays the forge remote; a seed working copy sets up
//! diverging branches, then the rebase machine runs against the bare remote
//! exactly as it would against a forge.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use git_host::merge::rebase_with_remote;
use git_host::{
    ConflictResolver, DefaultResolver, ErrorKind, GitHostError, KustomizeResolver, RebaseRequest,
    Resolution, UnionResolver, UserConfig,
};
use local_git::{GitCli, Workspace};
use tempfile::TempDir;

struct Fixture {
    _tmp: TempDir,
    remote: PathBuf,
    work: PathBuf,
    git: GitCli,
}

impl Fixture {
    async fn run(&self, args: &[&str]) -> String {
        self.git.run(&self.work, args).await.unwrap()
    }

    async fn commit_file(&self, path: &str, content: &str, message: &str) {
        std::fs::write(self.work.join(path), content).unwrap();
        self.run(&["add", "--", path]).await;
        self.run(&["commit", "-m", message]).await;
    }

    async fn show_remote(&self, branch: &str, path: &str) -> String {
        let spec = format!("{branch}:{path}");
        self.git
            .run(&self.remote, &["show", &spec])
            .await
            .unwrap()
    }
}

/// Bare remote plus a seed clone with an initial commit on `main`.
async fn fixture() -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let remote = tmp.path().join("remote.git");
    let work = tmp.path().join("work");
    let git = GitCli::new();

    git.run(tmp.path(), &["init", "--bare", "-b", "main", "remote.git"])
        .await
        .unwrap();
    git.run(
        tmp.path(),
        &["clone", remote.to_str().unwrap(), work.to_str().unwrap()],
    )
    .await
    .unwrap();

    let fixture = Fixture {
        _tmp: tmp,
        remote,
        work,
        git,
    };
    fixture.run(&["checkout", "-B", "main"]).await;
    fixture.run(&["config", "user.name", "fixture"]).await;
    fixture
        .run(&["config", "user.email", "fixture@localhost"])
        .await;
    fixture
        .commit_file("README.md", "# fixture\n", "initial commit")
        .await;
    fixture.run(&["push", "-u", "origin", "main"]).await;
    fixture
}

/// Branch `source` off the current main, give both sides a conflicting edit
/// to `path`, and push everything.
async fn diverge(fixture: &Fixture, source: &str, path: &str, ours: &str, theirs: &str) {
    fixture.run(&["checkout", "-b", source]).await;
    fixture
        .commit_file(path, theirs, &format!("{source} change"))
        .await;
    fixture.run(&["push", "-u", "origin", source]).await;

    fixture.run(&["checkout", "main"]).await;
    fixture.commit_file(path, ours, "main change").await;
    fixture.run(&["push", "origin", "main"]).await;
}

fn request(source: &str) -> RebaseRequest {
    RebaseRequest {
        source_branch: source.to_string(),
        target_branch: "main".to_string(),
        user_config: Some(UserConfig {
            name: "rebase-bot".to_string(),
            email: "rebase-bot@localhost".to_string(),
        }),
    }
}

fn assert_workspace_removed(source: &str) {
    let leftovers = std::fs::read_dir(Path::new("/tmp/repo").join(source))
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0, "workspace for {source} should be removed");
}

#[tokio::test]
async fn test_rebase_is_idempotent_when_source_contains_target() {
    let fixture = fixture().await;
    // Source sits at the main tip: nothing to rebase, nothing to push.
    fixture.run(&["checkout", "-b", "idempotent-src"]).await;
    fixture.run(&["push", "-u", "origin", "idempotent-src"]).await;
    let tip_before = fixture
        .git
        .run(&fixture.remote, &["rev-parse", "idempotent-src"])
        .await
        .unwrap();

    let remote = fixture.remote.to_str().unwrap().to_string();
    let pushed = rebase_with_remote(&remote, &request("idempotent-src"), &DefaultResolver, None)
        .await
        .unwrap();

    assert!(!pushed);
    let tip_after = fixture
        .git
        .run(&fixture.remote, &["rev-parse", "idempotent-src"])
        .await
        .unwrap();
    assert_eq!(tip_before, tip_after);
    assert_workspace_removed("idempotent-src");
}

#[tokio::test]
async fn test_default_resolver_leaves_conflicts_unresolved() {
    let fixture = fixture().await;
    diverge(
        &fixture,
        "unresolved-src",
        "data.txt",
        "base\nfrom-main\n",
        "base\nfrom-feature\n",
    )
    .await;

    let remote = fixture.remote.to_str().unwrap().to_string();
    let error = rebase_with_remote(&remote, &request("unresolved-src"), &DefaultResolver, None)
        .await
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::UnresolvedConflicts);
    assert!(error.to_string().contains("data.txt"));
    assert_workspace_removed("unresolved-src");
}

#[tokio::test]
async fn test_union_resolver_keeps_both_sides_and_pushes() {
    let fixture = fixture().await;
    diverge(
        &fixture,
        "union-src",
        "data.txt",
        "base\nfrom-main\n",
        "base\nfrom-feature\n",
    )
    .await;

    let remote = fixture.remote.to_str().unwrap().to_string();
    let pushed = rebase_with_remote(&remote, &request("union-src"), &UnionResolver, None)
        .await
        .unwrap();

    assert!(pushed);
    let merged = fixture.show_remote("union-src", "data.txt").await;
    assert!(merged.contains("from-main"), "{merged}");
    assert!(merged.contains("from-feature"), "{merged}");
    assert_workspace_removed("union-src");
}

#[tokio::test]
async fn test_kustomize_resolver_unions_resource_lists() {
    let fixture = fixture().await;
    fixture
        .commit_file(
            "kustomization.yaml",
            "kind: Kustomization\nresources:\n- a.yaml\n",
            "add kustomization",
        )
        .await;
    fixture.run(&["push", "origin", "main"]).await;
    diverge(
        &fixture,
        "kustomize-src",
        "kustomization.yaml",
        "kind: Kustomization\nresources:\n- a.yaml\n- b.yaml\n",
        "kind: Kustomization\nresources:\n- a.yaml\n- c.yaml\n",
    )
    .await;

    let remote = fixture.remote.to_str().unwrap().to_string();
    let resolver = KustomizeResolver::new("c.yaml");
    let pushed = rebase_with_remote(&remote, &request("kustomize-src"), &resolver, None)
        .await
        .unwrap();

    assert!(pushed);
    let merged = fixture.show_remote("kustomize-src", "kustomization.yaml").await;
    let doc: serde_yaml::Value = serde_yaml::from_str(&merged).unwrap();
    let resources: Vec<&str> = doc["resources"]
        .as_sequence()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert_eq!(resources, vec!["a.yaml", "b.yaml", "c.yaml"]);
    assert_workspace_removed("kustomize-src");
}

struct FailingResolver;

#[async_trait]
impl ConflictResolver for FailingResolver {
    async fn resolve(
        &self,
        _workspace: &Workspace,
        conflicted: &[String],
    ) -> Result<Resolution, GitHostError> {
        Ok(Resolution {
            resolved_conflicts: Vec::new(),
            conflict_errors: conflicted
                .iter()
                .map(|f| format!("{f}: cannot handle this shape"))
                .collect(),
        })
    }
}

#[tokio::test]
async fn test_resolver_errors_fail_the_rebase() {
    let fixture = fixture().await;
    diverge(
        &fixture,
        "failing-src",
        "data.txt",
        "base\nfrom-main\n",
        "base\nfrom-feature\n",
    )
    .await;

    let remote = fixture.remote.to_str().unwrap().to_string();
    let error = rebase_with_remote(&remote, &request("failing-src"), &FailingResolver, None)
        .await
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::ConflictResolutionFailed);
    assert_workspace_removed("failing-src");
}
