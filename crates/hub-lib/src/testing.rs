//! Recording fakes for the infrastructure seams

use crate::backend::cluster::{ClusterApi, PortForward};
use crate::backend::local::{ContainerEngine, ContainerSpec, ContainerState};
use crate::error::InfraError;
use crate::settings::{BrowserConfig, ContainerResources, DeploymentMode, HubSettings};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Pod, PodStatus, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Settings with a single `chrome` browser type
pub fn chrome_settings(mode: DeploymentMode, cap: Option<u32>) -> HubSettings {
    let mut settings = HubSettings {
        deployment_mode: mode,
        max_browser_instances: cap,
        ..HubSettings::default()
    };
    settings.kubernetes.retry_delay_seconds = 1;
    settings.kubernetes.max_retries = 3;
    settings.browser_configs.insert(
        "chrome".to_string(),
        BrowserConfig {
            image: "selenium/node-chrome:latest".to_string(),
            port: 5555,
            resources: ContainerResources::new("1G", "1"),
        },
    );
    settings
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub name: Option<String>,
    pub status: String,
    pub image: String,
    pub labels: HashMap<String, String>,
}

#[derive(Default)]
pub struct EngineState {
    pub networks: HashSet<String>,
    pub containers: Vec<FakeContainer>,
    pub images: HashSet<String>,
    pub calls: Vec<String>,
    /// 0-based `create_container` call indices that fail
    pub failing_runs: HashSet<usize>,
    pub runs: usize,
    /// 0-based `start_container` call indices that fail
    pub failing_starts: HashSet<usize>,
    pub starts: usize,
    /// Number of upcoming `inspect_network` calls that fail with an API error
    pub network_failures: u32,
    pub next_id: u64,
}

impl EngineState {
    fn find(&self, key: &str) -> Option<usize> {
        self.containers.iter().position(|c| {
            c.id == key || (key.len() >= 12 && c.id.starts_with(key)) || c.name.as_deref() == Some(key)
        })
    }
}

/// In-memory container engine that records every call
#[derive(Default)]
pub struct FakeEngine {
    pub state: Mutex<EngineState>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Number of recorded calls starting with `prefix`
    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn fail_runs(&self, indices: impl IntoIterator<Item = usize>) {
        self.state.lock().unwrap().failing_runs.extend(indices);
    }

    pub fn fail_starts(&self, indices: impl IntoIterator<Item = usize>) {
        self.state.lock().unwrap().failing_starts.extend(indices);
    }

    pub fn fail_network_lookups(&self, times: u32) {
        self.state.lock().unwrap().network_failures = times;
    }

    pub fn add_container(&self, name: &str, status: &str, labels: &[(&str, &str)]) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("{:012x}{}", state.next_id, "0".repeat(52));
        state.containers.push(FakeContainer {
            id: id.clone(),
            name: Some(name.to_string()),
            status: status.to_string(),
            image: "preexisting".to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        });
        id
    }

    pub fn container_named(&self, name: &str) -> Option<FakeContainer> {
        let state = self.state.lock().unwrap();
        state.find(name).map(|i| state.containers[i].clone())
    }

    pub fn container_count(&self) -> usize {
        self.state.lock().unwrap().containers.len()
    }
}

fn not_found(what: &str) -> InfraError {
    InfraError::NotFound(what.to_string())
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn inspect_network(&self, name: &str) -> Result<(), InfraError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("inspect_network:{}", name));
        if state.network_failures > 0 {
            state.network_failures -= 1;
            return Err(InfraError::Api("daemon unavailable".to_string()));
        }
        if state.networks.contains(name) {
            Ok(())
        } else {
            Err(not_found(name))
        }
    }

    async fn create_network(&self, name: &str) -> Result<(), InfraError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("create_network:{}", name));
        state.networks.insert(name.to_string());
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<(), InfraError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("remove_network:{}", name));
        if state.networks.remove(name) {
            Ok(())
        } else {
            Err(not_found(name))
        }
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerState, InfraError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("inspect_container:{}", id));
        let index = state.find(id).ok_or_else(|| not_found(id))?;
        let container = &state.containers[index];
        Ok(ContainerState {
            id: container.id.clone(),
            name: container.name.clone(),
            status: container.status.clone(),
            image: Some(container.image.clone()),
            labels: container.labels.clone(),
        })
    }

    async fn restart_container(&self, id: &str) -> Result<(), InfraError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("restart_container:{}", id));
        let index = state.find(id).ok_or_else(|| not_found(id))?;
        state.containers[index].status = "running".to_string();
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, InfraError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("create_container:{}", spec.image));
        let index = state.runs;
        state.runs += 1;
        if state.failing_runs.contains(&index) {
            return Err(InfraError::Api(format!("run {} failed", index)));
        }
        if let Some(name) = &spec.name {
            if state.find(name).is_some() {
                return Err(InfraError::Conflict(name.clone()));
            }
        }
        state.next_id += 1;
        let id = format!("{:012x}{}", state.next_id, "f".repeat(52));
        state.containers.push(FakeContainer {
            id: id.clone(),
            name: spec.name.clone(),
            status: "created".to_string(),
            image: spec.image.clone(),
            labels: spec.labels.clone(),
        });
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), InfraError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("start_container:{}", id));
        let index = state.starts;
        state.starts += 1;
        if state.failing_starts.contains(&index) {
            return Err(InfraError::Api(format!("start {} failed", index)));
        }
        let container = state.find(id).ok_or_else(|| not_found(id))?;
        state.containers[container].status = "running".to_string();
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), InfraError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("remove_container:{}", id));
        let index = state.find(id).ok_or_else(|| not_found(id))?;
        state.containers.remove(index);
        Ok(())
    }

    async fn list_containers(&self, label: &str) -> Result<Vec<String>, InfraError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("list_containers:{}", label));
        let (key, value) = label.split_once('=').unwrap_or((label, ""));
        Ok(state
            .containers
            .iter()
            .filter(|c| c.labels.get(key).map(String::as_str) == Some(value))
            .map(|c| c.id.clone())
            .collect())
    }

    async fn inspect_image(&self, image: &str) -> Result<(), InfraError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("inspect_image:{}", image));
        if state.images.contains(image) {
            Ok(())
        } else {
            Err(not_found(image))
        }
    }

    async fn pull_image(&self, image: &str) -> Result<(), InfraError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("pull_image:{}", image));
        state.images.insert(image.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct ClusterState {
    pub nodes: Vec<String>,
    pub namespaces: HashSet<String>,
    pub deployments: HashMap<String, Deployment>,
    pub services: HashMap<String, Service>,
    pub pods: HashMap<String, Pod>,
    /// Errors returned by upcoming `create_pod` calls, in order
    pub create_pod_errors: VecDeque<InfraError>,
    /// Number of upcoming `get_namespace` calls that fail with an API error
    pub namespace_failures: u32,
    /// Outcomes of upcoming ready-waits; an empty queue means ready
    pub ready_results: VecDeque<Result<String, InfraError>>,
}

/// In-memory cluster API that records every call
pub struct FakeCluster {
    pub state: Mutex<ClusterState>,
    /// Shared call log; fakes for other seams may append to it
    pub log: Arc<Mutex<Vec<String>>>,
}

impl FakeCluster {
    pub fn new(nodes: &[&str]) -> Arc<Self> {
        let state = ClusterState {
            nodes: nodes.iter().map(|n| n.to_string()).collect(),
            ..Default::default()
        };
        Arc::new(Self {
            state: Mutex::new(state),
            log: Arc::new(Mutex::new(Vec::new())),
        })
    }

    fn record(&self, call: String) {
        self.log.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn clear_calls(&self) {
        self.log.lock().unwrap().clear();
    }

    pub fn pod_count(&self) -> usize {
        self.state.lock().unwrap().pods.len()
    }

    pub fn insert_pod(&self, name: &str, phase: &str, labels: &[(&str, &str)]) {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.state.lock().unwrap().pods.insert(name.to_string(), pod);
    }
}

fn object_name(meta: &ObjectMeta) -> String {
    meta.name.clone().unwrap_or_default()
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn list_node_names(&self) -> Result<Vec<String>, InfraError> {
        self.record("list_node_names".to_string());
        Ok(self.state.lock().unwrap().nodes.clone())
    }

    async fn get_namespace(&self, name: &str) -> Result<Namespace, InfraError> {
        self.record(format!("get_namespace:{}", name));
        let mut state = self.state.lock().unwrap();
        if state.namespace_failures > 0 {
            state.namespace_failures -= 1;
            return Err(InfraError::Api("apiserver unavailable".to_string()));
        }
        if state.namespaces.contains(name) {
            Ok(Namespace {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            })
        } else {
            Err(not_found(name))
        }
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<(), InfraError> {
        let name = object_name(&namespace.metadata);
        self.record(format!("create_namespace:{}", name));
        self.state.lock().unwrap().namespaces.insert(name);
        Ok(())
    }

    async fn get_deployment(&self, _namespace: &str, name: &str) -> Result<Deployment, InfraError> {
        self.record(format!("get_deployment:{}", name));
        self.state
            .lock()
            .unwrap()
            .deployments
            .get(name)
            .cloned()
            .ok_or_else(|| not_found(name))
    }

    async fn create_deployment(&self, _namespace: &str, deployment: &Deployment) -> Result<(), InfraError> {
        let name = object_name(&deployment.metadata);
        self.record(format!("create_deployment:{}", name));
        self.state
            .lock()
            .unwrap()
            .deployments
            .insert(name, deployment.clone());
        Ok(())
    }

    async fn delete_deployment(&self, _namespace: &str, name: &str) -> Result<(), InfraError> {
        self.record(format!("delete_deployment:{}", name));
        self.state
            .lock()
            .unwrap()
            .deployments
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found(name))
    }

    async fn get_service(&self, _namespace: &str, name: &str) -> Result<Service, InfraError> {
        self.record(format!("get_service:{}", name));
        self.state
            .lock()
            .unwrap()
            .services
            .get(name)
            .cloned()
            .ok_or_else(|| not_found(name))
    }

    async fn create_service(&self, _namespace: &str, service: &Service) -> Result<(), InfraError> {
        let name = object_name(&service.metadata);
        self.record(format!("create_service:{}", name));
        self.state
            .lock()
            .unwrap()
            .services
            .insert(name, service.clone());
        Ok(())
    }

    async fn delete_service(&self, _namespace: &str, name: &str) -> Result<(), InfraError> {
        self.record(format!("delete_service:{}", name));
        self.state
            .lock()
            .unwrap()
            .services
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found(name))
    }

    async fn get_pod(&self, _namespace: &str, name: &str) -> Result<Pod, InfraError> {
        self.record(format!("get_pod:{}", name));
        self.state
            .lock()
            .unwrap()
            .pods
            .get(name)
            .cloned()
            .ok_or_else(|| not_found(name))
    }

    async fn create_pod(&self, _namespace: &str, pod: &Pod) -> Result<(), InfraError> {
        let name = object_name(&pod.metadata);
        self.record(format!("create_pod:{}", name));
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.create_pod_errors.pop_front() {
            return Err(err);
        }
        if state.pods.contains_key(&name) {
            return Err(InfraError::Conflict(name));
        }
        state.pods.insert(name, pod.clone());
        Ok(())
    }

    async fn delete_pod(&self, _namespace: &str, name: &str) -> Result<(), InfraError> {
        self.record(format!("delete_pod:{}", name));
        self.state
            .lock()
            .unwrap()
            .pods
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found(name))
    }

    async fn delete_pods(&self, _namespace: &str, label_selector: &str) -> Result<(), InfraError> {
        self.record(format!("delete_pods:{}", label_selector));
        let (key, value) = label_selector
            .split_once('=')
            .unwrap_or((label_selector, ""));
        self.state.lock().unwrap().pods.retain(|_, pod| {
            pod.metadata
                .labels
                .as_ref()
                .and_then(|labels| labels.get(key))
                .map(String::as_str)
                != Some(value)
        });
        Ok(())
    }

    async fn wait_for_pod_ready(
        &self,
        _namespace: &str,
        label_selector: &str,
        _timeout: Duration,
    ) -> Result<String, InfraError> {
        self.record(format!("wait_for_pod_ready:{}", label_selector));
        self.state
            .lock()
            .unwrap()
            .ready_results
            .pop_front()
            .unwrap_or_else(|| Ok("selenium-grid-7d9f-hub".to_string()))
    }
}

/// Port-forward double counting starts and stops
pub struct FakePortForward {
    pub starts: Arc<AtomicU32>,
    pub stops: Arc<AtomicU32>,
    succeed: bool,
    active: bool,
    log: Arc<Mutex<Vec<String>>>,
}

impl FakePortForward {
    pub fn new(succeed: bool, log: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            starts: Arc::new(AtomicU32::new(0)),
            stops: Arc::new(AtomicU32::new(0)),
            succeed,
            active: false,
            log,
        }
    }
}

#[async_trait]
impl PortForward for FakePortForward {
    async fn start(&mut self) -> bool {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().push("port_forward_start".to_string());
        self.active = self.succeed;
        self.succeed
    }

    async fn stop(&mut self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().push("port_forward_stop".to_string());
        self.active = false;
    }

    fn is_active(&self) -> bool {
        self.active
    }
}
