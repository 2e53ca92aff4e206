//! `git status --porcelain=v2 --branch` parsing.

use crate::GitError;

/// Snapshot of a working copy as reported by porcelain-v2 status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitStatus {
    pub conflicted: Vec<String>,
    pub staged: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
    pub untracked: Vec<String>,
    pub ahead: u32,
    pub behind: u32,
}

impl GitStatus {
    /// A working copy with nothing untracked, deleted, conflicted, or staged.
    pub fn is_clean(&self) -> bool {
        self.untracked.is_empty()
            && self.deleted.is_empty()
            && self.conflicted.is_empty()
            && self.staged.is_empty()
    }

    pub fn parse(raw: &str) -> Result<GitStatus, GitError> {
        let mut status = GitStatus::default();

        for line in raw.lines() {
            if let Some(ab) = line.strip_prefix("# branch.ab ") {
                let mut parts = ab.split_whitespace();
                status.ahead = parse_signed(parts.next(), '+')?;
                status.behind = parse_signed(parts.next(), '-')?;
            } else if line.starts_with("# ") {
                continue;
            } else if let Some(rest) = line.strip_prefix("1 ") {
                let xy = rest.get(..2).ok_or_else(|| truncated(line))?;
                // 1 <XY> <sub> <mH> <mI> <mW> <hH> <hI> <path>
                let path = rest
                    .splitn(8, ' ')
                    .nth(7)
                    .ok_or_else(|| truncated(line))?
                    .to_string();
                classify(&mut status, xy, path);
            } else if let Some(rest) = line.strip_prefix("2 ") {
                let xy = rest.get(..2).ok_or_else(|| truncated(line))?;
                // 2 <XY> <sub> <mH> <mI> <mW> <hH> <hI> <Xscore> <path>\t<orig>
                let paths = rest.splitn(9, ' ').nth(8).ok_or_else(|| truncated(line))?;
                let path = paths.split('\t').next().unwrap_or(paths).to_string();
                classify(&mut status, xy, path);
            } else if let Some(rest) = line.strip_prefix("u ") {
                // u <XY> <sub> <m1> <m2> <m3> <mW> <h1> <h2> <h3> <path>
                let path = rest
                    .splitn(10, ' ')
                    .nth(9)
                    .ok_or_else(|| truncated(line))?
                    .to_string();
                status.conflicted.push(path);
            } else if let Some(path) = line.strip_prefix("? ") {
                status.untracked.push(path.to_string());
            }
        }

        Ok(status)
    }
}

fn classify(status: &mut GitStatus, xy: &str, path: String) {
    let mut chars = xy.chars();
    let index = chars.next().unwrap_or('.');
    let worktree = chars.next().unwrap_or('.');

    if index == 'D' || worktree == 'D' {
        status.deleted.push(path.clone());
    }
    if index != '.' && index != 'D' {
        status.staged.push(path.clone());
    }
    if worktree == 'M' {
        status.modified.push(path);
    }
}

fn parse_signed(field: Option<&str>, sign: char) -> Result<u32, GitError> {
    let field = field.ok_or_else(|| GitError::Parse("missing branch.ab field".to_string()))?;
    field
        .strip_prefix(sign)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| GitError::Parse(format!("bad branch.ab field: {field}")))
}

fn truncated(line: &str) -> GitError {
    GitError::Parse(format!("truncated status line: {line}"))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_clean_tree() {
        let raw = "# branch.oid abc\n# branch.head main\n# branch.upstream origin/main\n# branch.ab +0 -0\n";
        let status = GitStatus::parse(raw).unwrap();
        assert!(status.is_clean());
        assert_eq!(status.ahead, 0);
        assert_eq!(status.behind, 0);
    }

    #[test]
    fn test_ahead_behind() {
        let raw = "# branch.ab +3 -1\n";
        let status = GitStatus::parse(raw).unwrap();
        assert_eq!(status.ahead, 3);
        assert_eq!(status.behind, 1);
    }

    #[test]
    fn test_conflicted_path_with_spaces() {
        let raw = "u UU N... 100644 100644 100644 100644 aaa bbb ccc some dir/a file.yaml\n";
        let status = GitStatus::parse(raw).unwrap();
        assert_eq!(status.conflicted, vec!["some dir/a file.yaml".to_string()]);
        assert!(!status.is_clean());
    }

    #[test]
    fn test_staged_and_modified() {
        let raw = concat!(
            "1 M. N... 100644 100644 100644 aaa bbb staged.txt\n",
            "1 .M N... 100644 100644 100644 aaa bbb modified.txt\n",
            "1 .D N... 100644 100644 100644 aaa bbb removed.txt\n",
            "? new.txt\n",
        );
        let status = GitStatus::parse(raw).unwrap();
        assert_eq!(status.staged, vec!["staged.txt".to_string()]);
        assert_eq!(status.modified, vec!["modified.txt".to_string()]);
        assert_eq!(status.deleted, vec!["removed.txt".to_string()]);
        assert_eq!(status.untracked, vec!["new.txt".to_string()]);
    }

    #[test]
    fn test_rename_entry() {
        let raw = "2 R. N... 100644 100644 100644 aaa bbb R100 new_name.rs\told_name.rs\n";
        let status = GitStatus::parse(raw).unwrap();
        assert_eq!(status.staged, vec!["new_name.rs".to_string()]);
    }

    #[test]
    fn test_modified_only_tree_counts_clean() {
        // An unstaged edit alone does not block the rebase loop's exit
        // condition; only untracked/deleted/conflicted/staged entries do.
        let raw = "1 .M N... 100644 100644 100644 aaa bbb modified.txt\n";
        let status = GitStatus::parse(raw).unwrap();
        assert!(status.is_clean());
    }
}
