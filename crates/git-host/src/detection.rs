//! Forge detection from a coordinate plus credentials.
//!
//! Well-known hosts are decided outright; everything else is probed over the
//! wire until one of the self-hosted forges answers in its own dialect.

use reqwest::Method;
use tracing::debug;

use crate::coordinate::RepoCoordinate;
use crate::error::GitHostError;
use crate::http::{ApiResponse, Auth, HostClient, Payload, RetryPolicy};
use crate::types::ForgeKind;

/// Identify the forge behind a coordinate.
///
/// Returns the kind together with a (possibly transformed) coordinate:
/// Azure DevOps coordinates get their `project/_git/repo` remainder split if
/// the caller assembled one by hand. The fixed hosts `github.com`,
/// `bitbucket.org`, and `dev.azure.com` never cause a probe; unknown hosts are
/// probed as GitHub Enterprise, GitLab, Gitea, then Gogs, in that order.
pub async fn detect(
    coordinate: &RepoCoordinate,
) -> Result<(ForgeKind, RepoCoordinate), GitHostError> {
    match coordinate.host.as_str() {
        "github.com" => return Ok((ForgeKind::Github, coordinate.clone())),
        "bitbucket.org" => return Ok((ForgeKind::Bitbucket, coordinate.clone())),
        "dev.azure.com" => return Ok((ForgeKind::Azure, split_azure(coordinate))),
        _ => {}
    }

    let client = probe_client(coordinate)?;
    let username = coordinate.username.as_deref().unwrap_or_default();

    if let Some(response) = probe(&client, "detect-ghe", "/api/v3").await {
        if response.header("x-github-enterprise-version").is_some() {
            debug!(host = %coordinate.host, "detected GitHub Enterprise");
            return Ok((ForgeKind::Ghe, coordinate.clone()));
        }
    }

    if let Some(response) = probe(&client, "detect-gitlab", "/api/v4/projects").await {
        if is_non_empty_json(&response) {
            debug!(host = %coordinate.host, "detected GitLab");
            return Ok((ForgeKind::Gitlab, coordinate.clone()));
        }
    }

    if let Some(response) = probe(&client, "detect-gitea", "/api/v1/settings/api").await {
        if !response.text().trim().is_empty() {
            debug!(host = %coordinate.host, "detected Gitea");
            return Ok((ForgeKind::Gitea, coordinate.clone()));
        }
    }

    let gogs_path = format!("/api/v1/users/{username}");
    if let Some(response) = probe(&client, "detect-gogs", &gogs_path).await {
        if !response.text().trim().is_empty() {
            debug!(host = %coordinate.host, "detected Gogs");
            return Ok((ForgeKind::Gogs, coordinate.clone()));
        }
    }

    Err(GitHostError::InvalidGitUrl(format!(
        "Unable to identify Git host type for {}",
        coordinate.host
    )))
}

fn probe_client(coordinate: &RepoCoordinate) -> Result<HostClient, GitHostError> {
    HostClient::new(
        format!("{}://{}", coordinate.protocol, coordinate.host),
        Auth::Basic {
            username: coordinate.username.clone().unwrap_or_default(),
            token: coordinate.password.clone().unwrap_or_default(),
        },
        coordinate.ca_cert.as_ref(),
        RetryPolicy::none(),
    )
}

/// One probe request. Transport and TLS failures, like non-2xx responses,
/// mean "not this forge" rather than an error.
async fn probe(client: &HostClient, operation: &str, path: &str) -> Option<ApiResponse> {
    match client
        .execute(operation, Method::GET, path, Payload::Empty, &[])
        .await
    {
        Ok(response) if response.ok() => Some(response),
        Ok(response) => {
            debug!(operation, status = response.status, "probe rejected");
            None
        }
        Err(error) => {
            debug!(operation, "probe failed: {error}");
            None
        }
    }
}

fn is_non_empty_json(response: &ApiResponse) -> bool {
    match response.json::<serde_json::Value>() {
        Ok(serde_json::Value::Array(items)) => !items.is_empty(),
        Ok(serde_json::Value::Object(fields)) => !fields.is_empty(),
        _ => false,
    }
}

/// Split a hand-assembled Azure coordinate whose repo field still carries the
/// `project/_git/repo` remainder.
fn split_azure(coordinate: &RepoCoordinate) -> RepoCoordinate {
    let mut transformed = coordinate.clone();
    if transformed.project.is_none() {
        if let Some(repo) = transformed.repo.clone() {
            match repo.split_once("/_git/") {
                Some((project, repo)) if !project.is_empty() && !repo.is_empty() => {
                    transformed.project = Some(project.to_string());
                    transformed.repo = Some(repo.trim_end_matches(".git").to_string());
                }
                _ => {
                    transformed.project = Some(repo);
                    transformed.repo = None;
                }
            }
        }
    }
    transformed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_github_com_needs_no_probe() {
        let coordinate = RepoCoordinate::parse("https://github.com/owner/repo").unwrap();
        let (kind, _) = detect(&coordinate).await.unwrap();
        assert_eq!(kind, ForgeKind::Github);
    }

    #[tokio::test]
    async fn test_bitbucket_org_needs_no_probe() {
        let coordinate = RepoCoordinate::parse("https://bitbucket.org/owner/repo").unwrap();
        let (kind, _) = detect(&coordinate).await.unwrap();
        assert_eq!(kind, ForgeKind::Bitbucket);
    }

    #[tokio::test]
    async fn test_azure_splits_coordinate() {
        let coordinate = RepoCoordinate::parse("https://dev.azure.com/org/proj/_git/r").unwrap();
        let (kind, transformed) = detect(&coordinate).await.unwrap();
        assert_eq!(kind, ForgeKind::Azure);
        assert_eq!(transformed.owner, "org");
        assert_eq!(transformed.project.as_deref(), Some("proj"));
        assert_eq!(transformed.repo.as_deref(), Some("r"));
    }

    #[test]
    fn test_split_azure_handles_manual_coordinate() {
        let mut coordinate = RepoCoordinate::parse("https://dev.azure.com/org").unwrap();
        coordinate.project = None;
        coordinate.repo = Some("proj/_git/r".to_string());
        let transformed = split_azure(&coordinate);
        assert_eq!(transformed.project.as_deref(), Some("proj"));
        assert_eq!(transformed.repo.as_deref(), Some("r"));
    }
}
