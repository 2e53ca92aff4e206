//! Credential and URL resolution for the CLI.
//!
//! Explicit flags win, then environment variables, then the optional
//! `~/.gitu-config` credential file.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use git_host::{CaCert, Credentials};
use serde::Deserialize;

/// `~/.gitu-config`: a YAML list of per-host credentials.
#[derive(Debug, Default, Deserialize)]
pub struct CredentialFile {
    #[serde(default)]
    pub credentials: Vec<CredentialEntry>,
}

#[derive(Debug, Deserialize)]
pub struct CredentialEntry {
    pub host: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub token: String,
}

impl CredentialFile {
    pub fn load() -> CredentialFile {
        let Some(path) = Self::path() else {
            return CredentialFile::default();
        };
        Self::load_from(&path).unwrap_or_default()
    }

    pub fn load_from(path: &PathBuf) -> Option<CredentialFile> {
        let raw = std::fs::read_to_string(path).ok()?;
        serde_yaml::from_str(&raw).ok()
    }

    fn path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".gitu-config"))
    }

    /// First entry matching `host`, if any.
    pub fn lookup(&self, host: &str) -> Option<&CredentialEntry> {
        self.credentials.iter().find(|entry| entry.host == host)
    }
}

/// Resolve the target URL from the positional argument or the environment.
pub fn resolve_url(explicit: Option<String>) -> Result<String> {
    if let Some(url) = explicit {
        return Ok(url);
    }
    if let Ok(url) = std::env::var("GIT_URL") {
        if !url.is_empty() {
            return Ok(url);
        }
    }
    let host = std::env::var("GIT_HOST").unwrap_or_default();
    if !host.is_empty() {
        let project = std::env::var("GIT_PROJECT").unwrap_or_default();
        if project.is_empty() {
            bail!("GIT_HOST is set but GIT_PROJECT is not; cannot build a repository URL");
        }
        return Ok(format!("https://{host}/{project}"));
    }
    bail!("no repository URL: pass one as an argument or set GIT_URL (or GIT_HOST and GIT_PROJECT)")
}

/// Assemble credentials for `url` from flags, environment, and the
/// credential file, in that order.
pub fn resolve_credentials(
    url: &str,
    username: Option<String>,
    token: Option<String>,
    ca_cert: Option<PathBuf>,
) -> Result<Credentials> {
    let mut username = username
        .or_else(|| std::env::var("GIT_USERNAME").ok())
        .unwrap_or_default();
    let mut token = token
        .or_else(|| std::env::var("GIT_TOKEN").ok())
        .unwrap_or_default();

    if token.is_empty() {
        let host = git_host::RepoCoordinate::parse(url)
            .map(|c| c.host)
            .unwrap_or_default();
        let file = CredentialFile::load();
        if let Some(entry) = file.lookup(&host) {
            if username.is_empty() {
                username = entry.username.clone();
            }
            token = entry.token.clone();
        }
    }

    let mut credentials = Credentials::new(username, token);
    let ca_path = ca_cert.or_else(|| {
        std::env::var("GIT_CA_CERT")
            .ok()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
    });
    if let Some(path) = ca_path {
        let ca = CaCert::read(&path)
            .with_context(|| format!("cannot read CA bundle {}", path.display()))?;
        credentials = credentials.with_ca_cert(ca);
    }
    Ok(credentials)
}
