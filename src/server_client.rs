//! Client side of the project-server status protocol
//!
//! A project whose owner runs a server publishes the authoritative pledge
//! list at `{payment_url}/status`. Responses are trusted: the recipient of
//! the funds has no incentive to forge pledges against themselves.

use crate::error::BackendError;
use crate::model::{Pledge, Project, Sha256Hash};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// The status document a project server publishes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectStatus {
    /// Server-accepted pledges, metadata scrubbed.
    pub pledges: Vec<Pledge>,
    /// Set once the server saw (or broadcast) the claim transaction.
    pub claimed_by: Option<Sha256Hash>,
}

pub struct ServerClient {
    http: reqwest::Client,
}

impl ServerClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .expect("reqwest client construction cannot fail with static options");
        ServerClient { http }
    }

    /// Fetch the authoritative pledge list for `project`.
    pub async fn fetch_status(&self, project: &Project) -> Result<ProjectStatus, BackendError> {
        let url = project
            .status_url()
            .ok_or_else(|| BackendError::Transport("project has no payment URL".into()))?;
        debug!(%url, "refreshing project status from server");
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?
            .error_for_status()
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        response
            .json::<ProjectStatus>()
            .await
            .map_err(|e| BackendError::Transport(format!("bad status document: {e}")))
    }
}

impl Default for ServerClient {
    fn default() -> Self {
        Self::new()
    }
}
