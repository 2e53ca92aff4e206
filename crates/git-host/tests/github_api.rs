//! GitHub-dialect adapter against a mock server (driven as GHE so the base
//! URL points at the mock).

use git_host::hosts::github::GithubHost;
use git_host::{
    CreatePullRequestOptions, CreateWebhookOptions, ErrorKind, ForgeKind, GitHost,
    GitHostError, MergePullRequestOptions, PullRequestStatus, RepoCoordinate,
};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn host_for(server: &MockServer) -> GithubHost {
    let address = server.address();
    let coordinate = RepoCoordinate::parse(&format!(
        "http://jane:t0ken@{}:{}/owner/repo",
        address.ip(),
        address.port()
    ))
    .unwrap();
    GithubHost::attach(coordinate, ForgeKind::Ghe).unwrap()
}

fn pr_body(state: &str, mergeable_state: &str) -> serde_json::Value {
    serde_json::json!({
        "number": 17,
        "state": state,
        "merged": false,
        "merged_at": null,
        "mergeable_state": mergeable_state,
        "head": { "ref": "feature" },
        "base": { "ref": "main" },
    })
}

#[tokio::test]
async fn test_get_pull_request_maps_over_the_wire() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/repos/owner/repo/pulls/17"))
        .respond_with(ResponseTemplate::new(200).set_body_json(pr_body("open", "dirty")))
        .mount(&server)
        .await;

    let host = host_for(&server);
    let pr = host.get_pull_request(17).await.unwrap();
    assert_eq!(pr.pull_number, 17);
    assert_eq!(pr.status, PullRequestStatus::Conflicts);
    assert_eq!(pr.source_branch, "feature");
    assert_eq!(pr.target_branch, "main");
}

#[tokio::test]
async fn test_repo_not_found_maps_404() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/repos/owner/repo"))
        .respond_with(ResponseTemplate::new(404).set_body_string("Not Found"))
        .mount(&server)
        .await;

    let host = host_for(&server);
    let error = host.get_repo_info().await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::RepoNotFound);
}

#[tokio::test]
async fn test_bad_credentials_maps_401() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/repos/owner/repo"))
        .respond_with(ResponseTemplate::new(401).set_body_string("Bad credentials"))
        .mount(&server)
        .await;

    let host = host_for(&server);
    let error = host.get_repo_info().await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::BadCredentials);
}

#[tokio::test]
async fn test_merge_405_base_modified_is_a_merge_conflict() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/api/v3/repos/owner/repo/pulls/17/merge"))
        .respond_with(
            ResponseTemplate::new(405)
                .set_body_json(serde_json::json!({ "message": "Base branch was modified" })),
        )
        .mount(&server)
        .await;

    let host = host_for(&server);
    let error = host
        .merge_pull_request_internal(&MergePullRequestOptions {
            pull_number: 17,
            ..MergePullRequestOptions::default()
        })
        .await
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::MergeConflict);
    // Pass-through: the kernel must not have eaten the 405 with retries.
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_merge_405_review_required_is_blocked() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/api/v3/repos/owner/repo/pulls/17/merge"))
        .respond_with(ResponseTemplate::new(405).set_body_json(
            serde_json::json!({ "message": "At least 1 approving review is required" }),
        ))
        .mount(&server)
        .await;

    let host = host_for(&server);
    let error = host
        .merge_pull_request_internal(&MergePullRequestOptions {
            pull_number: 17,
            ..MergePullRequestOptions::default()
        })
        .await
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::MergeBlockedForPullRequest);
}

#[tokio::test]
async fn test_merge_success_returns_server_message() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/api/v3/repos/owner/repo/pulls/17/merge"))
        .and(body_partial_json(serde_json::json!({ "merge_method": "squash" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(
            serde_json::json!({ "sha": "abc123", "merged": true, "message": "Pull Request successfully merged" }),
        ))
        .mount(&server)
        .await;

    let host = host_for(&server);
    let message = host
        .merge_pull_request_internal(&MergePullRequestOptions {
            pull_number: 17,
            method: "squash".parse().unwrap(),
            ..MergePullRequestOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(message, "Pull Request successfully merged");
}

#[tokio::test]
async fn test_create_pull_request_no_commits() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v3/repos/owner/repo/pulls"))
        .respond_with(ResponseTemplate::new(422).set_body_json(
            serde_json::json!({ "message": "Validation Failed: No commits between main and feature" }),
        ))
        .mount(&server)
        .await;

    let host = host_for(&server);
    let error = host
        .create_pull_request(&CreatePullRequestOptions {
            title: "t".to_string(),
            source_branch: "feature".to_string(),
            target_branch: "main".to_string(),
            ..CreatePullRequestOptions::default()
        })
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::NoCommitsForPullRequest);
}

#[tokio::test]
async fn test_webhook_already_exists() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v3/repos/owner/repo/hooks"))
        .respond_with(ResponseTemplate::new(422).set_body_json(
            serde_json::json!({ "message": "Validation Failed", "errors": [{ "message": "Hook already exists on this repository" }] }),
        ))
        .mount(&server)
        .await;

    let host = host_for(&server);
    let error = host
        .create_webhook(&CreateWebhookOptions::new("https://ci.example.com/hook"))
        .await
        .unwrap_err();
    assert!(matches!(error, GitHostError::WebhookAlreadyExists(_)));
}

#[tokio::test]
async fn test_list_repos_falls_back_to_user_scope() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/orgs/owner/repos"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v3/users/owner/repos"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            { "id": 1, "name": "a", "full_name": "owner/a", "html_url": "http://x/owner/a", "private": false },
            { "id": 2, "name": "b", "full_name": "owner/b", "html_url": "http://x/owner/b", "private": true },
        ])))
        .mount(&server)
        .await;

    let host = host_for(&server);
    let repos = host.list_repos().await.unwrap();
    assert_eq!(repos, vec!["http://x/owner/a", "http://x/owner/b"]);
}
