//! HTTP reachability probe for the hub

use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use tracing::debug;

/// Checks `GET <hub_url>/status` with the hub's basic-auth credentials
#[derive(Clone)]
pub struct HubProbe {
    client: reqwest::Client,
    user: String,
    password: SecretString,
}

impl HubProbe {
    pub fn new(user: impl Into<String>, password: SecretString, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            user: user.into(),
            password,
        }
    }

    /// `true` iff the hub answered `200 OK`
    pub async fn check(&self, hub_url: &str) -> bool {
        let url = format!("{}/status", hub_url.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .basic_auth(&self.user, Some(self.password.expose_secret()))
            .send()
            .await;

        match response {
            Ok(resp) if resp.status() == reqwest::StatusCode::OK => true,
            Ok(resp) => {
                debug!(url = %url, status = %resp.status(), "Hub status check failed");
                false
            }
            Err(e) => {
                debug!(url = %url, error = %e, "Hub unreachable");
                false
            }
        }
    }
}
