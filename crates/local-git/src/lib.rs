//! Narrow capability over the local `git` binary.
//!
//! Everything here shells out to `git` through `tokio::process` and parses
//! its output; there is no in-process Git object model. Higher layers drive
//! clone/rebase/push sequences and decide what a non-zero exit status means,
//! so most operations come in two flavors: `run` (zero exit required) and
//! `git` (exit status handed back for inspection).

mod status;

use std::path::{Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

pub use status::GitStatus;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("failed to spawn `git {args}`: {source}")]
    Spawn {
        args: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`git {args}` failed: {stderr}")]
    Command { args: String, stderr: String },
    #[error("unexpected git output: {0}")]
    Parse(String),
}

/// Captured result of a single `git` invocation.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// stdout and stderr joined, for callers that sniff messages the git
    /// binary prints to either stream depending on version.
    pub fn combined(&self) -> String {
        let mut text = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&self.stderr);
        }
        text
    }
}

/// Options for [`GitCli::clone_repo`].
#[derive(Debug, Clone, Default)]
pub struct CloneArgs {
    /// `-c key=value` pairs applied to the clone invocation and persisted
    /// into the new repository's local config afterwards.
    pub config: Vec<(String, String)>,
    pub branch: Option<String>,
    pub depth: Option<u32>,
}

/// Async driver for the `git` binary.
#[derive(Debug, Clone)]
pub struct GitCli {
    program: String,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new()
    }
}

impl GitCli {
    pub fn new() -> Self {
        Self {
            program: "git".to_string(),
        }
    }

    /// Run git in `cwd` and hand back the outcome regardless of exit status.
    pub async fn git(&self, cwd: &Path, args: &[&str]) -> Result<GitOutput, GitError> {
        let rendered = args.join(" ");
        debug!(cwd = %cwd.display(), "git {}", rendered);
        let output = Command::new(&self.program)
            .args(args)
            .current_dir(cwd)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| GitError::Spawn {
                args: rendered.clone(),
                source,
            })?;

        Ok(GitOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Run git in `cwd`, requiring a zero exit status.
    pub async fn run(&self, cwd: &Path, args: &[&str]) -> Result<String, GitError> {
        let out = self.git(cwd, args).await?;
        if !out.success() {
            return Err(GitError::Command {
                args: args.join(" "),
                stderr: if out.stderr.trim().is_empty() {
                    out.stdout.trim().to_string()
                } else {
                    out.stderr.trim().to_string()
                },
            });
        }
        Ok(out.stdout)
    }

    /// Raw byte output, for file content recovered from the index.
    async fn run_bytes(&self, cwd: &Path, args: &[&str]) -> Result<Vec<u8>, GitError> {
        let rendered = args.join(" ");
        let output = Command::new(&self.program)
            .args(args)
            .current_dir(cwd)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| GitError::Spawn {
                args: rendered.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(GitError::Command {
                args: rendered,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    /// Clone `url` into `dest`, then persist the requested config pairs into
    /// the new repository so follow-up commands see them.
    pub async fn clone_repo(
        &self,
        url: &str,
        dest: &Path,
        args: &CloneArgs,
    ) -> Result<(), GitError> {
        let parent = match dest.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let dest_str = dest.to_string_lossy().into_owned();
        let depth_str = args.depth.map(|d| d.to_string());

        let mut argv: Vec<String> = Vec::new();
        for (key, value) in &args.config {
            argv.push("-c".to_string());
            argv.push(format!("{key}={value}"));
        }
        argv.push("clone".to_string());
        if let Some(branch) = &args.branch {
            argv.push("--branch".to_string());
            argv.push(branch.clone());
        }
        if let Some(depth) = &depth_str {
            argv.push("--depth".to_string());
            argv.push(depth.clone());
        }
        argv.push(url.to_string());
        argv.push(dest_str);

        let argv_refs: Vec<&str> = argv.iter().map(String::as_str).collect();
        self.run(parent, &argv_refs).await?;

        for (key, value) in &args.config {
            self.config_set(dest, key, value).await?;
        }
        Ok(())
    }

    pub async fn config_set(&self, cwd: &Path, key: &str, value: &str) -> Result<(), GitError> {
        self.run(cwd, &["config", key, value]).await.map(|_| ())
    }

    pub async fn checkout_new(
        &self,
        cwd: &Path,
        branch: &str,
        start_point: &str,
    ) -> Result<(), GitError> {
        self.run(cwd, &["checkout", "-b", branch, start_point])
            .await
            .map(|_| ())
    }

    pub async fn checkout_ours(&self, cwd: &Path, path: &str) -> Result<(), GitError> {
        self.run(cwd, &["checkout", "--ours", "--", path])
            .await
            .map(|_| ())
    }

    /// Start a rebase. The exit status is intentionally not an error: callers
    /// inspect `git status` to learn whether the rebase stopped on conflicts.
    pub async fn rebase(&self, cwd: &Path, target: &str) -> Result<GitOutput, GitError> {
        self.git(cwd, &["rebase", target]).await
    }

    pub async fn rebase_continue(&self, cwd: &Path) -> Result<GitOutput, GitError> {
        self.git(cwd, &["-c", "core.editor=true", "rebase", "--continue"])
            .await
    }

    pub async fn rebase_skip(&self, cwd: &Path) -> Result<GitOutput, GitError> {
        self.git(cwd, &["rebase", "--skip"]).await
    }

    pub async fn status(&self, cwd: &Path) -> Result<GitStatus, GitError> {
        let raw = self
            .run(cwd, &["status", "--porcelain=v2", "--branch"])
            .await?;
        GitStatus::parse(&raw)
    }

    pub async fn add(&self, cwd: &Path, path: &str) -> Result<(), GitError> {
        self.run(cwd, &["add", "--", path]).await.map(|_| ())
    }

    pub async fn commit(&self, cwd: &Path, message: &str) -> Result<(), GitError> {
        self.run(cwd, &["commit", "-m", message]).await.map(|_| ())
    }

    pub async fn push(
        &self,
        cwd: &Path,
        remote: &str,
        branch: &str,
        force_with_lease: bool,
    ) -> Result<(), GitError> {
        let mut argv = vec!["push", remote, branch];
        if force_with_lease {
            argv.push("--force-with-lease");
        }
        self.run(cwd, &argv).await.map(|_| ())
    }

    /// Recover the content of `path` at the given index stage (1 = common
    /// ancestor, 2 = ours, 3 = theirs) while a merge conflict is pending.
    pub async fn show_stage(
        &self,
        cwd: &Path,
        stage: u8,
        path: &str,
    ) -> Result<Vec<u8>, GitError> {
        let spec = format!(":{stage}:{path}");
        self.run_bytes(cwd, &["show", &spec]).await
    }

    /// Three-way union merge of the given files, result on stdout.
    pub async fn merge_file_union(
        &self,
        cwd: &Path,
        ours: &Path,
        base: &Path,
        theirs: &Path,
    ) -> Result<Vec<u8>, GitError> {
        let ours = ours.to_string_lossy().into_owned();
        let base = base.to_string_lossy().into_owned();
        let theirs = theirs.to_string_lossy().into_owned();
        self.run_bytes(cwd, &["merge-file", "--union", "-p", &ours, &base, &theirs])
            .await
    }
}

/// Handle to a local working copy produced by a clone.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    git: GitCli,
}

impl Workspace {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            git: GitCli::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn git(&self) -> &GitCli {
        &self.git
    }

    pub fn join(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    pub async fn status(&self) -> Result<GitStatus, GitError> {
        self.git.status(&self.root).await
    }
}
