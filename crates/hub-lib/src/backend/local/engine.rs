//! Container engine seam for the local backend

use crate::error::InfraError;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, RestartContainerOptions, StartContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use bollard::Docker;
use futures::TryStreamExt;
use std::collections::HashMap;
use tracing::debug;

/// Everything needed to run one container
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    /// Fixed container name; the engine picks one when unset
    pub name: Option<String>,
    pub image: String,
    pub network: String,
    pub env: Vec<(String, String)>,
    pub labels: HashMap<String, String>,
    /// Ports published on the same host port number
    pub published_ports: Vec<u16>,
    pub memory_bytes: Option<i64>,
    pub nano_cpus: Option<i64>,
}

/// What the backend needs to know about an existing container
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerState {
    pub id: String,
    pub name: Option<String>,
    pub status: String,
    pub image: Option<String>,
    pub labels: HashMap<String, String>,
}

impl ContainerState {
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }

    /// Whether the container carries the label `key=value`
    pub fn has_label(&self, key: &str, value: &str) -> bool {
        self.labels.get(key).map(String::as_str) == Some(value)
    }
}

/// Operations the local backend performs against a container engine.
/// Every method reports a missing object as [`InfraError::NotFound`].
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn inspect_network(&self, name: &str) -> Result<(), InfraError>;

    /// Create a bridge network
    async fn create_network(&self, name: &str) -> Result<(), InfraError>;

    async fn remove_network(&self, name: &str) -> Result<(), InfraError>;

    /// Look a container up by id or name
    async fn inspect_container(&self, id: &str) -> Result<ContainerState, InfraError>;

    async fn restart_container(&self, id: &str) -> Result<(), InfraError>;

    /// Create a container without starting it, returning its full id
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, InfraError>;

    async fn start_container(&self, id: &str) -> Result<(), InfraError>;

    /// Force-remove a container
    async fn remove_container(&self, id: &str) -> Result<(), InfraError>;

    /// Ids of all containers (running or not) matching a `key=value` label
    async fn list_containers(&self, label: &str) -> Result<Vec<String>, InfraError>;

    async fn inspect_image(&self, image: &str) -> Result<(), InfraError>;

    async fn pull_image(&self, image: &str) -> Result<(), InfraError>;
}

/// [`ContainerEngine`] over the Docker Engine API
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect using `DOCKER_HOST` or the platform's default socket
    pub fn connect() -> Result<Self, InfraError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }
}

fn tcp_port(port: u16) -> String {
    format!("{}/tcp", port)
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn inspect_network(&self, name: &str) -> Result<(), InfraError> {
        self.docker
            .inspect_network(name, None::<InspectNetworkOptions<String>>)
            .await?;
        Ok(())
    }

    async fn create_network(&self, name: &str) -> Result<(), InfraError> {
        let options = CreateNetworkOptions {
            name: name.to_string(),
            driver: "bridge".to_string(),
            ..Default::default()
        };
        self.docker.create_network(options).await?;
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<(), InfraError> {
        self.docker.remove_network(name).await?;
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerState, InfraError> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;

        let status = info
            .state
            .and_then(|state| state.status)
            .map(|status| status.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let (image, labels) = match info.config {
            Some(config) => (config.image, config.labels.unwrap_or_default()),
            None => (None, HashMap::new()),
        };

        Ok(ContainerState {
            id: info.id.unwrap_or_else(|| id.to_string()),
            name: info.name.map(|name| name.trim_start_matches('/').to_string()),
            status,
            image,
            labels,
        })
    }

    async fn restart_container(&self, id: &str) -> Result<(), InfraError> {
        self.docker
            .restart_container(id, None::<RestartContainerOptions>)
            .await?;
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, InfraError> {
        let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = spec
            .published_ports
            .iter()
            .map(|port| {
                (
                    tcp_port(*port),
                    Some(vec![PortBinding {
                        host_ip: None,
                        host_port: Some(port.to_string()),
                    }]),
                )
            })
            .collect();

        let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
            .published_ports
            .iter()
            .map(|port| (tcp_port(*port), HashMap::new()))
            .collect();

        let host_config = HostConfig {
            network_mode: Some(spec.network.clone()),
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            memory: spec.memory_bytes,
            nano_cpus: spec.nano_cpus,
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(
                spec.env
                    .iter()
                    .map(|(key, value)| format!("{}={}", key, value))
                    .collect(),
            ),
            labels: Some(spec.labels.clone()),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = spec.name.as_ref().map(|name| CreateContainerOptions {
            name: name.clone(),
            platform: None,
        });

        let created = self.docker.create_container(options, config).await?;
        for warning in &created.warnings {
            debug!(container_id = %created.id, warning = %warning, "Engine warning");
        }

        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), InfraError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), InfraError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker.remove_container(id, Some(options)).await?;
        Ok(())
    }

    async fn list_containers(&self, label: &str) -> Result<Vec<String>, InfraError> {
        let options = ListContainersOptions::<String> {
            all: true,
            filters: HashMap::from([("label".to_string(), vec![label.to_string()])]),
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    async fn inspect_image(&self, image: &str) -> Result<(), InfraError> {
        self.docker.inspect_image(image).await?;
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> Result<(), InfraError> {
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        self.docker
            .create_image(Some(options), None, None)
            .try_collect::<Vec<_>>()
            .await?;
        Ok(())
    }
}
