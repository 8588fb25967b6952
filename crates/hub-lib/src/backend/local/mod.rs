//! Local backend over a container engine
//!
//! Manages one bridge network, a singleton hub container named after
//! `hub_name`, and worker containers labelled `app=<node_label>`.

mod engine;

#[cfg(test)]
mod tests;

pub use engine::{ContainerEngine, ContainerSpec, ContainerState, DockerEngine};

use super::{hub_env, unsupported_browser, worker_env, ResourceBackend};
use crate::error::{HubResult, InfraError};
use crate::models::BrowserStatus;
use crate::settings::{
    BrowserConfig, HubSettings, EVENT_BUS_PUBLISH_PORT, EVENT_BUS_SUBSCRIBE_PORT,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Length of the container id prefix handed back to callers
pub const SHORT_ID_LEN: usize = 12;

/// Resource backend driving a local container engine
pub struct LocalBackend {
    engine: Arc<dyn ContainerEngine>,
    settings: Arc<HubSettings>,
}

impl LocalBackend {
    /// Connect to the local Docker daemon
    pub fn connect(settings: Arc<HubSettings>) -> HubResult<Self> {
        let engine = DockerEngine::connect()?;
        Ok(Self::with_engine(settings, Arc::new(engine)))
    }

    pub fn with_engine(settings: Arc<HubSettings>, engine: Arc<dyn ContainerEngine>) -> Self {
        Self { engine, settings }
    }

    fn network(&self) -> &str {
        &self.settings.docker.network_name
    }

    async fn ensure_network(&self) -> Result<(), InfraError> {
        match self.engine.inspect_network(self.network()).await {
            Ok(()) => {
                debug!(network = %self.network(), "Network already exists");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                info!(network = %self.network(), "Creating bridge network");
                self.engine.create_network(self.network()).await
            }
            Err(e) => Err(e),
        }
    }

    /// Make sure `image` is present locally, pulling only when the engine
    /// reports it missing
    async fn ensure_image(&self, image: &str) -> Result<(), InfraError> {
        match self.engine.inspect_image(image).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                info!(image = %image, "Pulling image");
                self.engine.pull_image(image).await
            }
            Err(e) => Err(e),
        }
    }

    fn hub_spec(&self) -> ContainerSpec {
        let settings = &self.settings;
        ContainerSpec {
            name: Some(settings.hub_name.clone()),
            image: settings.hub_image.clone(),
            network: self.network().to_string(),
            env: hub_env(settings, &settings.hub_name),
            labels: HashMap::from([("app".to_string(), settings.hub_name.clone())]),
            published_ports: vec![
                settings.hub_port,
                EVENT_BUS_PUBLISH_PORT,
                EVENT_BUS_SUBSCRIBE_PORT,
            ],
            memory_bytes: None,
            nano_cpus: None,
        }
    }

    fn worker_spec(&self, browser_type: &str, config: &BrowserConfig) -> HubResult<ContainerSpec> {
        let settings = &self.settings;
        let memory_bytes = config.resources.memory_bytes()?;
        let millicores = config.resources.cpu_millicores()?;

        Ok(ContainerSpec {
            name: None,
            image: config.image.clone(),
            network: self.network().to_string(),
            env: worker_env(settings, &settings.hub_name),
            labels: HashMap::from([
                ("app".to_string(), settings.node_label.clone()),
                (settings.browser_label.clone(), browser_type.to_string()),
            ]),
            published_ports: Vec::new(),
            memory_bytes: Some(i64::try_from(memory_bytes).unwrap_or(i64::MAX)),
            nano_cpus: Some(i64::try_from(millicores.saturating_mul(1_000_000)).unwrap_or(i64::MAX)),
        })
    }

    async fn ensure_hub_container(&self) -> Result<(), InfraError> {
        let hub_name = &self.settings.hub_name;
        match self.engine.inspect_container(hub_name).await {
            Ok(state) if state.is_running() => {
                debug!(hub = %hub_name, "Hub container already running");
                Ok(())
            }
            Ok(state) => {
                info!(hub = %hub_name, status = %state.status, "Restarting stopped hub container");
                self.engine.restart_container(hub_name).await
            }
            Err(e) if e.is_not_found() => {
                info!(hub = %hub_name, image = %self.settings.hub_image, "Creating hub container");
                self.ensure_image(&self.settings.hub_image).await?;
                let id = self.run_container(&self.hub_spec()).await?;
                info!(hub = %hub_name, container_id = %short_id(&id), "Hub container started");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Create then start a container. A container that fails to start is
    /// force-removed before the start error is returned.
    async fn run_container(&self, spec: &ContainerSpec) -> Result<String, InfraError> {
        let id = self.engine.create_container(spec).await?;
        if let Err(e) = self.engine.start_container(&id).await {
            if let Err(remove_err) = self.engine.remove_container(&id).await {
                warn!(
                    container_id = %short_id(&id),
                    error = %remove_err,
                    "Failed to remove container that did not start"
                );
            }
            return Err(e);
        }
        Ok(id)
    }

    /// Whether `id` names a worker container of this hub
    async fn is_worker(&self, id: &str) -> Result<bool, InfraError> {
        let state = self.engine.inspect_container(id).await?;
        Ok(state.has_label("app", &self.settings.node_label))
    }

    async fn create_browser(&self, spec: &ContainerSpec) -> Result<String, InfraError> {
        self.ensure_image(&spec.image).await?;
        let id = self.run_container(spec).await?;
        if id.is_empty() {
            return Err(InfraError::Api("engine returned an empty container id".to_string()));
        }
        Ok(short_id(&id))
    }
}

fn short_id(id: &str) -> String {
    id.chars().take(SHORT_ID_LEN).collect()
}

#[async_trait]
impl ResourceBackend for LocalBackend {
    async fn ensure_hub_running(&self) -> HubResult<bool> {
        let result = async {
            self.ensure_network().await?;
            self.ensure_hub_container().await
        }
        .await;

        match result {
            Ok(()) => Ok(true),
            Err(e) => {
                error!(error = %e, "Failed to ensure hub container");
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
        let spec = self.worker_spec(browser_type, config)?;

        let mut ids = Vec::with_capacity(count as usize);
        for index in 0..count {
            match self.create_browser(&spec).await {
                Ok(id) => {
                    debug!(browser_type = %browser_type, container_id = %id, "Browser container started");
                    ids.push(id);
                }
                Err(e) => {
                    warn!(
                        browser_type = %browser_type,
                        index,
                        error = %e,
                        "Skipping browser container that failed to start"
                    );
                }
            }
        }

        info!(
            browser_type = %browser_type,
            requested = count,
            created = ids.len(),
            "Browser containers created"
        );
        Ok(ids)
    }

    async fn delete_browser(&self, id: &str) -> bool {
        match self.is_worker(id).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(container_id = %id, "Refusing to remove a container that is not a browser worker");
                return false;
            }
            Err(e) if e.is_not_found() => {
                info!(container_id = %id, "Browser container not found");
                return false;
            }
            Err(e) => {
                error!(container_id = %id, error = %e, "Failed to inspect browser container");
                return false;
            }
        }

        match self.engine.remove_container(id).await {
            Ok(()) => {
                info!(container_id = %id, "Removed browser container");
                true
            }
            Err(e) if e.is_not_found() => {
                info!(container_id = %id, "Browser container not found");
                false
            }
            Err(e) => {
                error!(container_id = %id, error = %e, "Failed to remove browser container");
                false
            }
        }
    }

    async fn cleanup_browsers(&self) {
        let selector = self.settings.node_selector();
        let ids = match self.engine.list_containers(&selector).await {
            Ok(ids) => ids,
            Err(e) => {
                error!(selector = %selector, error = %e, "Failed to list browser containers");
                return;
            }
        };

        for id in &ids {
            match self.engine.remove_container(id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(container_id = %short_id(id), error = %e, "Failed to remove browser container"),
            }
        }
        info!(removed = ids.len(), "Browser containers cleaned up");
    }

    async fn cleanup_hub(&self) {
        let hub_name = &self.settings.hub_name;
        match self.engine.remove_container(hub_name).await {
            Ok(()) => info!(hub = %hub_name, "Removed hub container"),
            Err(e) if e.is_not_found() => debug!(hub = %hub_name, "Hub container already gone"),
            Err(e) => error!(hub = %hub_name, error = %e, "Failed to remove hub container"),
        }

        match self.engine.remove_network(self.network()).await {
            Ok(()) => info!(network = %self.network(), "Removed network"),
            Err(e) if e.is_not_found() => debug!(network = %self.network(), "Network already gone"),
            Err(e) => error!(network = %self.network(), error = %e, "Failed to remove network"),
        }
    }

    async fn get_browser_status(&self, id: &str) -> BrowserStatus {
        match self.engine.inspect_container(id).await {
            Ok(state) => BrowserStatus {
                id: short_id(&state.id),
                status: state.status,
                name: state.name,
                image: state.image,
            },
            Err(e) => {
                if !e.is_not_found() {
                    warn!(container_id = %id, error = %e, "Failed to inspect browser container");
                }
                BrowserStatus::not_found(id)
            }
        }
    }

    async fn hub_url(&self) -> String {
        format!("http://localhost:{}", self.settings.hub_port)
    }
}
