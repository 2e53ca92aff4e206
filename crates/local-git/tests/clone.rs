//! Clone behavior against real local repositories.

use local_git::{CloneArgs, GitCli};

#[tokio::test]
async fn test_clone_persists_requested_config() {
    let tmp = tempfile::tempdir().unwrap();
    let git = GitCli::new();

    git.run(tmp.path(), &["init", "--bare", "-b", "main", "origin.git"])
        .await
        .unwrap();

    let dest = tmp.path().join("clone");
    let args = CloneArgs {
        config: vec![
            ("http.sslCAInfo".to_string(), "/etc/ssl/custom-ca.pem".to_string()),
            ("user.name".to_string(), "clone-bot".to_string()),
        ],
        ..CloneArgs::default()
    };
    git.clone_repo(
        tmp.path().join("origin.git").to_str().unwrap(),
        &dest,
        &args,
    )
    .await
    .unwrap();

    let ca = git.run(&dest, &["config", "http.sslCAInfo"]).await.unwrap();
    assert_eq!(ca.trim(), "/etc/ssl/custom-ca.pem");
    let name = git.run(&dest, &["config", "user.name"]).await.unwrap();
    assert_eq!(name.trim(), "clone-bot");
}

#[tokio::test]
async fn test_status_of_fresh_clone_is_clean() {
    let tmp = tempfile::tempdir().unwrap();
    let git = GitCli::new();

    git.run(tmp.path(), &["init", "--bare", "-b", "main", "origin.git"])
        .await
        .unwrap();
    let seed = tmp.path().join("seed");
    git.run(
        tmp.path(),
        &["clone", tmp.path().join("origin.git").to_str().unwrap(), seed.to_str().unwrap()],
    )
    .await
    .unwrap();
    git.run(&seed, &["checkout", "-B", "main"]).await.unwrap();
    git.run(&seed, &["config", "user.name", "seed"]).await.unwrap();
    git.run(&seed, &["config", "user.email", "seed@localhost"])
        .await
        .unwrap();
    std::fs::write(seed.join("README.md"), "# seed\n").unwrap();
    git.add(&seed, "README.md").await.unwrap();
    git.commit(&seed, "initial commit").await.unwrap();
    git.push(&seed, "origin", "main", false).await.unwrap();

    let status = git.status(&seed).await.unwrap();
    assert!(status.is_clean());
    assert_eq!(status.ahead, 0);
    assert_eq!(status.behind, 0);
}
