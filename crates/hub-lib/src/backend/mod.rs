//! Resource backends for the hub and its browser workers
//!
//! Two variants implement [`ResourceBackend`]: [`LocalBackend`] drives a local
//! container engine and [`ClusterBackend`] drives a Kubernetes cluster. The
//! [`Backend`] enum is the closed set the manager dispatches over.
//!
//! Error contract shared by both variants:
//! - `Err` is reserved for structural problems (unknown browser type, bad
//!   resource quantities, a spec rejected by the validation gate).
//! - Infrastructure failures degrade to `Ok(false)` or a shorter id list.

pub mod cluster;
pub mod local;

pub use cluster::ClusterBackend;
pub use local::LocalBackend;

use crate::error::{HubError, HubResult};
use crate::models::BrowserStatus;
use crate::settings::{
    flag, BrowserConfig, DeploymentMode, HubSettings, EVENT_BUS_PUBLISH_PORT,
    EVENT_BUS_SUBSCRIBE_PORT,
};
use async_trait::async_trait;
use secrecy::ExposeSecret;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Lifecycle operations every backend provides
#[async_trait]
pub trait ResourceBackend: Send + Sync {
    /// Create whatever is missing of the hub's infrastructure.
    /// Returns whether the hub is now present and addressable.
    async fn ensure_hub_running(&self) -> HubResult<bool>;

    /// Create `count` workers of `browser_type`, returning the ids that were
    /// actually created
    async fn create_browsers(
        &self,
        count: u32,
        browser_type: &str,
        configs: &HashMap<String, BrowserConfig>,
    ) -> HubResult<Vec<String>>;

    /// Best-effort delete; `false` when the worker does not exist or the
    /// engine refused
    async fn delete_browser(&self, id: &str) -> bool;

    /// Delete all `ids` concurrently and return the ones that went away
    async fn delete_browsers(&self, ids: &[String]) -> Vec<String> {
        let results =
            futures::future::join_all(ids.iter().map(|id| self.delete_browser(id))).await;

        let deleted: Vec<String> = ids
            .iter()
            .zip(results)
            .filter_map(|(id, ok)| ok.then(|| id.clone()))
            .collect();

        info!(
            requested = ids.len(),
            deleted = deleted.len(),
            "Bulk browser deletion finished"
        );
        deleted
    }

    /// Remove every worker carrying the node label
    async fn cleanup_browsers(&self);

    /// Remove the hub and the infrastructure created for it
    async fn cleanup_hub(&self);

    /// Workers first, then the hub
    async fn cleanup(&self) {
        self.cleanup_browsers().await;
        self.cleanup_hub().await;
    }

    async fn get_browser_status(&self, id: &str) -> BrowserStatus;

    /// Address the HTTP layer forwards hub traffic to
    async fn hub_url(&self) -> String;
}

/// The backend selected by the deployment mode
pub enum Backend {
    Local(LocalBackend),
    Cluster(ClusterBackend),
}

impl Backend {
    /// Build the backend named by `settings.deployment_mode`
    pub async fn connect(settings: Arc<HubSettings>) -> HubResult<Self> {
        let backend = match settings.deployment_mode {
            DeploymentMode::Local => Backend::Local(LocalBackend::connect(settings)?),
            DeploymentMode::Cluster => Backend::Cluster(ClusterBackend::connect(settings).await?),
        };
        info!(deployment_mode = %backend.mode(), "Resource backend ready");
        Ok(backend)
    }

    pub fn mode(&self) -> DeploymentMode {
        match self {
            Backend::Local(_) => DeploymentMode::Local,
            Backend::Cluster(_) => DeploymentMode::Cluster,
        }
    }

    /// Port-forward state for test clusters, `None` everywhere else
    pub async fn port_forward_active(&self) -> Option<bool> {
        match self {
            Backend::Local(_) => None,
            Backend::Cluster(backend) => backend.port_forward_active().await,
        }
    }

    fn inner(&self) -> &dyn ResourceBackend {
        match self {
            Backend::Local(backend) => backend,
            Backend::Cluster(backend) => backend,
        }
    }
}

#[async_trait]
impl ResourceBackend for Backend {
    async fn ensure_hub_running(&self) -> HubResult<bool> {
        self.inner().ensure_hub_running().await
    }

    async fn create_browsers(
        &self,
        count: u32,
        browser_type: &str,
        configs: &HashMap<String, BrowserConfig>,
    ) -> HubResult<Vec<String>> {
        self.inner()
            .create_browsers(count, browser_type, configs)
            .await
    }

    async fn delete_browser(&self, id: &str) -> bool {
        self.inner().delete_browser(id).await
    }

    async fn delete_browsers(&self, ids: &[String]) -> Vec<String> {
        self.inner().delete_browsers(ids).await
    }

    async fn cleanup_browsers(&self) {
        self.inner().cleanup_browsers().await
    }

    async fn cleanup_hub(&self) {
        self.inner().cleanup_hub().await
    }

    async fn cleanup(&self) {
        self.inner().cleanup().await
    }

    async fn get_browser_status(&self, id: &str) -> BrowserStatus {
        self.inner().get_browser_status(id).await
    }

    async fn hub_url(&self) -> String {
        self.inner().hub_url().await
    }
}

/// Rejection for a browser type missing from `configs`
pub(crate) fn unsupported_browser(
    browser_type: &str,
    configs: &HashMap<String, BrowserConfig>,
) -> HubError {
    let mut available: Vec<String> = configs.keys().cloned().collect();
    available.sort();
    HubError::UnsupportedBrowser {
        browser_type: browser_type.to_string(),
        available,
    }
}

/// Event bus variables pointing a container at `host`
pub(crate) fn event_bus_env(host: &str) -> Vec<(String, String)> {
    vec![
        ("SE_EVENT_BUS_HOST".to_string(), host.to_string()),
        (
            "SE_EVENT_BUS_PUBLISH_PORT".to_string(),
            EVENT_BUS_PUBLISH_PORT.to_string(),
        ),
        (
            "SE_EVENT_BUS_SUBSCRIBE_PORT".to_string(),
            EVENT_BUS_SUBSCRIBE_PORT.to_string(),
        ),
    ]
}

/// VNC options shared by the hub and the workers
pub(crate) fn vnc_env(settings: &HubSettings) -> Vec<(String, String)> {
    vec![
        (
            "SE_VNC_NO_PASSWORD".to_string(),
            flag(settings.vnc_no_password()).to_string(),
        ),
        (
            "SE_VNC_PASSWORD".to_string(),
            settings.vnc_password.expose_secret().to_string(),
        ),
        (
            "SE_VNC_VIEW_ONLY".to_string(),
            flag(settings.vnc_view_only).to_string(),
        ),
    ]
}

/// Environment for the hub process. `event_bus_host` is the name the hub
/// advertises to workers.
pub(crate) fn hub_env(settings: &HubSettings, event_bus_host: &str) -> Vec<(String, String)> {
    let mut env = event_bus_env(event_bus_host);
    env.extend([
        ("SE_PORT".to_string(), settings.hub_port.to_string()),
        (
            "SE_NODE_MAX_SESSIONS".to_string(),
            settings.session_cap().to_string(),
        ),
        ("SE_NODE_OVERRIDE_MAX_SESSIONS".to_string(), "true".to_string()),
        ("SE_OPTS".to_string(), settings.se_opts()),
    ]);
    env.extend(vnc_env(settings));
    env
}

/// Environment for one browser worker registering with `hub_host`
pub(crate) fn worker_env(settings: &HubSettings, hub_host: &str) -> Vec<(String, String)> {
    let mut env = event_bus_env(hub_host);
    env.push((
        "SE_NODE_MAX_SESSIONS".to_string(),
        settings.se_node_max_sessions.to_string(),
    ));
    env.extend(vnc_env(settings));
    env
}
