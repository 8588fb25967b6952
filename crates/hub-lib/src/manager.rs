//! Hub lifecycle manager
//!
//! Owns the backend selected by the deployment mode and adds the coarse
//! retry around hub convergence. Backends run their own finer-grained
//! retries; this loop only retries the overall outcome.

use crate::backend::{Backend, ResourceBackend};
use crate::error::{HubError, HubResult};
use crate::models::BrowserStatus;
use crate::settings::{DeploymentMode, HubSettings};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Attempts used when the caller does not say
pub const DEFAULT_ENSURE_RETRIES: u32 = 3;

/// Pause between attempts used when the caller does not say
pub const DEFAULT_ENSURE_WAIT: Duration = Duration::from_secs(2);

pub struct HubLifecycleManager {
    backend: Backend,
    settings: Arc<HubSettings>,
}

impl HubLifecycleManager {
    /// Build the manager and connect the backend named by the settings
    pub async fn new(settings: Arc<HubSettings>) -> HubResult<Self> {
        let backend = Backend::connect(settings.clone()).await?;
        Ok(Self::with_backend(settings, backend))
    }

    pub fn with_backend(settings: Arc<HubSettings>, backend: Backend) -> Self {
        Self { backend, settings }
    }

    pub fn deployment_mode(&self) -> DeploymentMode {
        self.backend.mode()
    }

    pub fn settings(&self) -> &Arc<HubSettings> {
        &self.settings
    }

    /// Call the backend's convergence up to `retries` times, sleeping `wait`
    /// between attempts. Validation errors are returned at once.
    pub async fn ensure_hub_running(&self, retries: u32, wait: Duration) -> HubResult<bool> {
        let retries = retries.max(1);

        for attempt in 1..=retries {
            if self.backend.ensure_hub_running().await? {
                info!(attempt, "Selenium Hub is running");
                return Ok(true);
            }

            warn!(attempt, retries, "Selenium Hub is not running yet");
            if attempt < retries && !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        }

        error!(retries, "Selenium Hub did not come up");
        Ok(false)
    }

    /// Make sure the hub is up, then create `count` workers of `browser_type`
    pub async fn create_browsers(&self, count: u32, browser_type: &str) -> HubResult<Vec<String>> {
        if !self
            .ensure_hub_running(DEFAULT_ENSURE_RETRIES, DEFAULT_ENSURE_WAIT)
            .await?
        {
            return Err(HubError::HubUnavailable);
        }

        self.backend
            .create_browsers(count, browser_type, &self.settings.browser_configs)
            .await
    }

    pub async fn delete_browsers(&self, ids: &[String]) -> Vec<String> {
        self.backend.delete_browsers(ids).await
    }

    pub async fn delete_browser(&self, id: &str) -> bool {
        self.backend.delete_browser(id).await
    }

    pub async fn get_browser_status(&self, id: &str) -> BrowserStatus {
        self.backend.get_browser_status(id).await
    }

    pub async fn cleanup(&self) {
        self.backend.cleanup().await;
    }

    pub async fn hub_url(&self) -> String {
        self.backend.hub_url().await
    }

    pub async fn port_forward_active(&self) -> Option<bool> {
        self.backend.port_forward_active().await
    }
}
