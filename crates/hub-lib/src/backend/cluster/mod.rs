//! Cluster backend over the Kubernetes API
//!
//! The hub runs as a single-replica Deployment exposed by a Service of the
//! same name in the configured namespace. Workers are bare pods labelled
//! `app=<node_label>`. On single-node test clusters the hub is reached
//! through a local port-forward.

mod api;
mod config;
mod port_forward;
mod specs;

#[cfg(test)]
mod tests;

pub use api::{pod_is_ready, ClusterApi, KubeApi};
pub use config::{detect_test_cluster, is_test_cluster, ClusterConnection, TEST_CLUSTER_NODE_SUFFIX};
pub use port_forward::{HealthCheck, PortForward, PortForwardConfig, PortForwardManager};
pub use specs::{
    browser_pod, hub_deployment, hub_selector, hub_service, validate_deployment, validate_service,
    ALLOWED_SERVICE_TYPES,
};

use super::{unsupported_browser, ResourceBackend};
use crate::error::{HubError, HubResult, InfraError};
use crate::models::BrowserStatus;
use crate::probe::HubProbe;
use crate::retry::RetryDecision;
use crate::settings::{BrowserConfig, HubSettings};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use secrecy::ExposeSecret;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Default bound on waiting for the hub pod to become ready
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResourceKind {
    Pod,
    Deployment,
    Service,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Pod => write!(f, "pod"),
            ResourceKind::Deployment => write!(f, "deployment"),
            ResourceKind::Service => write!(f, "service"),
        }
    }
}

/// Resource backend driving a Kubernetes cluster
pub struct ClusterBackend {
    api: Arc<dyn ClusterApi>,
    settings: Arc<HubSettings>,
    in_cluster: bool,
    test_cluster: bool,
    port_forward: Mutex<Box<dyn PortForward>>,
    ready_timeout: Duration,
}

impl ClusterBackend {
    /// Load credentials, connect, and inspect the cluster's nodes
    pub async fn connect(settings: Arc<HubSettings>) -> HubResult<Self> {
        let connection = config::connect(&settings.kubernetes).await?;
        let api: Arc<dyn ClusterApi> = Arc::new(KubeApi::new(connection.client));
        let test_cluster = detect_test_cluster(api.as_ref()).await;

        let port_forward = PortForwardManager::new(
            PortForwardConfig::for_hub(&settings),
            forwarded_hub_check(&settings),
        );

        Ok(Self::with_parts(
            settings,
            api,
            connection.in_cluster,
            test_cluster,
            Box::new(port_forward),
        ))
    }

    pub fn with_parts(
        settings: Arc<HubSettings>,
        api: Arc<dyn ClusterApi>,
        in_cluster: bool,
        test_cluster: bool,
        port_forward: Box<dyn PortForward>,
    ) -> Self {
        info!(
            namespace = %settings.kubernetes.namespace,
            in_cluster,
            test_cluster,
            "Cluster backend configured"
        );
        Self {
            api,
            settings,
            in_cluster,
            test_cluster,
            port_forward: Mutex::new(port_forward),
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn is_test_cluster(&self) -> bool {
        self.test_cluster
    }

    /// Whether the hub port-forward is up; `None` when this cluster does
    /// not use one
    pub async fn port_forward_active(&self) -> Option<bool> {
        if !self.test_cluster {
            return None;
        }
        Some(self.port_forward.lock().await.is_active())
    }

    fn namespace(&self) -> &str {
        &self.settings.kubernetes.namespace
    }

    fn service_name(&self) -> &str {
        &self.settings.kubernetes.service_name
    }

    async fn ensure_namespace(&self) -> HubResult<()> {
        match self.api.get_namespace(self.namespace()).await {
            Ok(_) => {
                debug!(namespace = %self.namespace(), "Namespace exists");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                info!(namespace = %self.namespace(), "Creating namespace");
                tolerate_conflict(self.api.create_namespace(&specs::namespace(self.namespace())).await)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_deployment(&self) -> HubResult<()> {
        match self.api.get_deployment(self.namespace(), self.service_name()).await {
            Ok(_) => {
                debug!(deployment = %self.service_name(), "Hub deployment exists");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                let deployment = hub_deployment(&self.settings);
                validate_deployment(&deployment)?;
                info!(deployment = %self.service_name(), image = %self.settings.hub_image, "Creating hub deployment");
                tolerate_conflict(self.api.create_deployment(self.namespace(), &deployment).await)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_service(&self) -> HubResult<()> {
        match self.api.get_service(self.namespace(), self.service_name()).await {
            Ok(_) => {
                debug!(service = %self.service_name(), "Hub service exists");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                let service = hub_service(&self.settings, self.in_cluster);
                validate_service(&service)?;
                info!(service = %self.service_name(), in_cluster = self.in_cluster, "Creating hub service");
                tolerate_conflict(self.api.create_service(self.namespace(), &service).await)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Wait for the hub pod and forward its port; test clusters only
    async fn ensure_port_forward(&self) -> HubResult<()> {
        let mut port_forward = self.port_forward.lock().await;
        if port_forward.is_active() {
            return Ok(());
        }

        let pod = self
            .api
            .wait_for_pod_ready(self.namespace(), &hub_selector(&self.settings), self.ready_timeout)
            .await?;
        info!(pod = %pod, "Hub pod ready");

        if !port_forward.start().await {
            return Err(InfraError::Api(
                "failed to start port-forward and reach the hub".to_string(),
            )
            .into());
        }
        Ok(())
    }

    /// One pass over namespace, Deployment and Service, in that order
    async fn converge_hub(&self) -> HubResult<()> {
        self.ensure_namespace().await?;
        self.ensure_deployment().await?;
        self.ensure_service().await?;
        if self.test_cluster {
            self.ensure_port_forward().await?;
        }
        Ok(())
    }

    async fn create_browser_pod(
        &self,
        browser_type: &str,
        config: &BrowserConfig,
    ) -> HubResult<String> {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let name = format!("{}-{}-{}", self.settings.node_label, browser_type, &suffix[..8]);
        let pod = browser_pod(&self.settings, &name, browser_type, config)?;
        self.api.create_pod(self.namespace(), &pod).await?;
        Ok(name)
    }

    async fn lookup(&self, kind: ResourceKind, name: &str) -> Result<(), InfraError> {
        let namespace = self.namespace();
        match kind {
            ResourceKind::Pod => self.api.get_pod(namespace, name).await.map(|_| ()),
            ResourceKind::Deployment => self.api.get_deployment(namespace, name).await.map(|_| ()),
            ResourceKind::Service => self.api.get_service(namespace, name).await.map(|_| ()),
        }
    }

    /// Poll until `name` is gone, at most `max_retries` times. Running out of
    /// polls only logs.
    async fn wait_for_deletion(&self, kind: ResourceKind, name: &str) -> Result<(), InfraError> {
        let k8s = &self.settings.kubernetes;
        let delay = Duration::from_secs(k8s.retry_delay_seconds);
        for _ in 0..k8s.max_retries {
            match self.lookup(kind, name).await {
                Err(e) if e.is_not_found() => {
                    debug!(kind = %kind, name = %name, "Deleted");
                    return Ok(());
                }
                Err(e) => return Err(e),
                Ok(()) => tokio::time::sleep(delay).await,
            }
        }
        warn!(kind = %kind, name = %name, "Timed out waiting for deletion");
        Ok(())
    }

    async fn delete_and_wait(&self, kind: ResourceKind, name: &str) {
        let namespace = self.namespace();
        let deleted = match kind {
            ResourceKind::Pod => self.api.delete_pod(namespace, name).await,
            ResourceKind::Deployment => self.api.delete_deployment(namespace, name).await,
            ResourceKind::Service => self.api.delete_service(namespace, name).await,
        };

        match deleted {
            Ok(()) => {
                info!(kind = %kind, name = %name, "Deleting");
                if let Err(e) = self.wait_for_deletion(kind, name).await {
                    error!(kind = %kind, name = %name, error = %e, "Failed waiting for deletion");
                }
            }
            Err(e) if e.is_not_found() => debug!(kind = %kind, name = %name, "Already gone"),
            Err(e) => error!(kind = %kind, name = %name, error = %e, "Failed to delete"),
        }
    }

    async fn node_port_url(&self) -> Option<String> {
        let service = match self.api.get_service(self.namespace(), self.service_name()).await {
            Ok(service) => service,
            Err(e) => {
                warn!(error = %e, "Could not read hub service");
                return None;
            }
        };
        let hub_port = i32::from(self.settings.hub_port);
        let node_port = service
            .spec?
            .ports?
            .into_iter()
            .find(|port| port.port == hub_port)?
            .node_port?;
        Some(format!("http://localhost:{}", node_port))
    }
}

/// Creation races with another writer count as success
fn tolerate_conflict(result: Result<(), InfraError>) -> HubResult<()> {
    match result {
        Err(e) if e.is_conflict() => {
            debug!(error = %e, "Created concurrently");
            Ok(())
        }
        other => other.map_err(HubError::from),
    }
}

fn is_worker_pod(pod: &Pod, node_label: &str) -> bool {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get("app"))
        .map(String::as_str)
        == Some(node_label)
}

/// Health check against the locally forwarded hub port
fn forwarded_hub_check(settings: &HubSettings) -> HealthCheck {
    let probe = Arc::new(HubProbe::new(
        settings.hub_user.expose_secret().clone(),
        settings.hub_password.clone(),
        Duration::from_secs(5),
    ));
    let url = format!("http://localhost:{}", settings.hub_port);
    Arc::new(move || {
        let probe = probe.clone();
        let url = url.clone();
        Box::pin(async move { probe.check(&url).await })
    })
}

#[async_trait]
impl ResourceBackend for ClusterBackend {
    async fn ensure_hub_running(&self) -> HubResult<bool> {
        let policy = self.settings.retry_policy();
        let result = policy
            .run(
                "ensure cluster hub",
                |_| self.converge_hub(),
                |e: &HubError| {
                    if e.is_validation() {
                        RetryDecision::Abort
                    } else {
                        RetryDecision::Backoff
                    }
                },
            )
            .await;

        match result {
            Ok(()) => {
                info!(namespace = %self.namespace(), "Hub infrastructure ready");
                Ok(true)
            }
            Err(e) if e.is_validation() => Err(e),
            Err(e) => {
                error!(error = %e, "Failed to ensure hub after all retries");
                Ok(false)
            }
        }
    }

    async fn create_browsers(
        &self,
        count: u32,
        browser_type: &str,
        configs: &HashMap<String, BrowserConfig>,
    ) -> HubResult<Vec<String>> {
        let config = configs
            .get(browser_type)
            .ok_or_else(|| unsupported_browser(browser_type, configs))?;
        config.resources.validate()?;

        let policy = self.settings.retry_policy();
        let mut names = Vec::with_capacity(count as usize);
        for index in 0..count {
            let result = policy
                .run(
                    "create browser pod",
                    |_| self.create_browser_pod(browser_type, config),
                    |e: &HubError| match e {
                        e if e.is_validation() => RetryDecision::Abort,
                        HubError::Infra(infra) if infra.is_conflict() => RetryDecision::Immediate,
                        _ => RetryDecision::Backoff,
                    },
                )
                .await;

            match result {
                Ok(name) => {
                    debug!(pod = %name, "Browser pod created");
                    names.push(name);
                }
                Err(e) => {
                    error!(
                        browser_type = %browser_type,
                        index,
                        error = %e,
                        "Skipping browser pod after all retries"
                    );
                }
            }
        }

        info!(
            browser_type = %browser_type,
            requested = count,
            created = names.len(),
            "Browser pods created"
        );
        Ok(names)
    }

    async fn delete_browser(&self, id: &str) -> bool {
        match self.api.get_pod(self.namespace(), id).await {
            Ok(pod) if is_worker_pod(&pod, &self.settings.node_label) => {}
            Ok(_) => {
                warn!(pod = %id, "Refusing to delete a pod that is not a browser worker");
                return false;
            }
            Err(e) if e.is_not_found() => {
                info!(pod = %id, "Browser pod not found");
                return false;
            }
            Err(e) => {
                error!(pod = %id, error = %e, "Failed to read browser pod");
                return false;
            }
        }

        match self.api.delete_pod(self.namespace(), id).await {
            Ok(()) => {
                info!(pod = %id, "Deleting browser pod");
                if let Err(e) = self.wait_for_deletion(ResourceKind::Pod, id).await {
                    warn!(pod = %id, error = %e, "Could not confirm browser pod deletion");
                }
                true
            }
            Err(e) if e.is_not_found() => {
                info!(pod = %id, "Browser pod not found");
                false
            }
            Err(e) => {
                error!(pod = %id, error = %e, "Failed to delete browser pod");
                false
            }
        }
    }

    async fn cleanup_browsers(&self) {
        let selector = self.settings.node_selector();
        match self.api.delete_pods(self.namespace(), &selector).await {
            Ok(()) => info!(selector = %selector, "Deleted browser pods"),
            Err(e) if e.is_not_found() => debug!(selector = %selector, "No browser pods to delete"),
            Err(e) => error!(selector = %selector, error = %e, "Failed to delete browser pods"),
        }
    }

    async fn cleanup_hub(&self) {
        let name = self.service_name().to_string();
        self.delete_and_wait(ResourceKind::Deployment, &name).await;
        self.delete_and_wait(ResourceKind::Service, &name).await;
    }

    async fn cleanup(&self) {
        {
            let mut port_forward = self.port_forward.lock().await;
            if port_forward.is_active() {
                port_forward.stop().await;
            }
        }
        self.cleanup_browsers().await;
        self.cleanup_hub().await;
    }

    async fn get_browser_status(&self, id: &str) -> BrowserStatus {
        match self.api.get_pod(self.namespace(), id).await {
            Ok(pod) => BrowserStatus {
                id: id.to_string(),
                status: pod
                    .status
                    .as_ref()
                    .and_then(|s| s.phase.clone())
                    .unwrap_or_else(|| "Unknown".to_string()),
                name: pod.metadata.name.clone(),
                image: pod
                    .spec
                    .as_ref()
                    .and_then(|spec| spec.containers.first())
                    .and_then(|c| c.image.clone()),
            },
            Err(e) => {
                if !e.is_not_found() {
                    warn!(pod = %id, error = %e, "Failed to read browser pod");
                }
                BrowserStatus::not_found(id)
            }
        }
    }

    async fn hub_url(&self) -> String {
        let hub_port = self.settings.hub_port;
        if self.in_cluster {
            return format!(
                "http://{}.{}.svc.cluster.local:{}",
                self.service_name(),
                self.namespace(),
                hub_port
            );
        }
        if self.test_cluster {
            return format!("http://localhost:{}", hub_port);
        }
        match self.node_port_url().await {
            Some(url) => url,
            None => format!("http://localhost:{}", hub_port),
        }
    }
}
