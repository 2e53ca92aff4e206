//! Per-forge adapters.
//!
//! Each adapter is a base-URL builder plus request shaping and response
//! mapping for one forge dialect; everything rides the shared HTTP kernel.

pub mod azure;
pub mod bitbucket;
pub mod gitea;
pub mod github;
pub mod gitlab;

use crate::error::GitHostError;
use crate::http::ApiResponse;
use crate::types::ForgeKind;

/// Fallback mapping for non-2xx responses no adapter rule recognized.
pub(crate) fn api_error(forge: ForgeKind, response: &ApiResponse) -> GitHostError {
    let message = response.text();
    match response.status {
        401 => GitHostError::BadCredentials(message),
        403 if message.contains("Bad credentials") || message.contains("Unauthorized") => {
            GitHostError::BadCredentials(message)
        }
        403 => GitHostError::InsufficientPermissions(message),
        _ => GitHostError::Api {
            forge,
            status: response.status,
            message,
        },
    }
}

/// `create_pull_request` failure shared by several forges: the source branch
/// has nothing the target does not already have.
pub(crate) fn is_no_commits(message: &str) -> bool {
    message.to_lowercase().contains("no commits between")
}
