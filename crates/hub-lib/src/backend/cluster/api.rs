//! Cluster API seam and its kube-rs implementation

use crate::error::InfraError;
use async_trait::async_trait;
use futures::TryStreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Node, Pod, Service};
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use std::time::Duration;
use tracing::debug;

/// Kubernetes operations the cluster backend depends on.
/// Missing objects surface as [`InfraError::NotFound`], name clashes as
/// [`InfraError::Conflict`].
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn list_node_names(&self) -> Result<Vec<String>, InfraError>;

    async fn get_namespace(&self, name: &str) -> Result<Namespace, InfraError>;
    async fn create_namespace(&self, namespace: &Namespace) -> Result<(), InfraError>;

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment, InfraError>;
    async fn create_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<(), InfraError>;
    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), InfraError>;

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, InfraError>;
    async fn create_service(&self, namespace: &str, service: &Service) -> Result<(), InfraError>;
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), InfraError>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, InfraError>;
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<(), InfraError>;
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), InfraError>;

    /// Collection delete of every pod matching `label_selector`
    async fn delete_pods(&self, namespace: &str, label_selector: &str) -> Result<(), InfraError>;

    /// Watch pods matching `label_selector` until one is ready, returning its
    /// name. Fails with [`InfraError::Timeout`] once `timeout` elapses.
    async fn wait_for_pod_ready(
        &self,
        namespace: &str,
        label_selector: &str,
        timeout: Duration,
    ) -> Result<String, InfraError>;
}

/// Running with every container reporting ready
pub fn pod_is_ready(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    if status.phase.as_deref() != Some("Running") {
        return false;
    }
    match status.container_statuses.as_deref() {
        Some(statuses) if !statuses.is_empty() => statuses.iter().all(|s| s.ready),
        _ => false,
    }
}

fn pod_has_failed(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        == Some("Failed")
}

/// [`ClusterApi`] backed by a kube client
#[derive(Clone)]
pub struct KubeApi {
    client: Client,
}

impl KubeApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterApi for KubeApi {
    async fn list_node_names(&self) -> Result<Vec<String>, InfraError> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = nodes.list(&ListParams::default()).await?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|node| node.metadata.name)
            .collect())
    }

    async fn get_namespace(&self, name: &str) -> Result<Namespace, InfraError> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        Ok(namespaces.get(name).await?)
    }

    async fn create_namespace(&self, namespace: &Namespace) -> Result<(), InfraError> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        namespaces.create(&PostParams::default(), namespace).await?;
        Ok(())
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment, InfraError> {
        Ok(self.deployments(namespace).get(name).await?)
    }

    async fn create_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<(), InfraError> {
        self.deployments(namespace)
            .create(&PostParams::default(), deployment)
            .await?;
        Ok(())
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), InfraError> {
        self.deployments(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, InfraError> {
        Ok(self.services(namespace).get(name).await?)
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<(), InfraError> {
        self.services(namespace)
            .create(&PostParams::default(), service)
            .await?;
        Ok(())
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), InfraError> {
        self.services(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, InfraError> {
        Ok(self.pods(namespace).get(name).await?)
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<(), InfraError> {
        self.pods(namespace).create(&PostParams::default(), pod).await?;
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), InfraError> {
        self.pods(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn delete_pods(&self, namespace: &str, label_selector: &str) -> Result<(), InfraError> {
        self.pods(namespace)
            .delete_collection(
                &DeleteParams::default(),
                &ListParams::default().labels(label_selector),
            )
            .await?;
        Ok(())
    }

    async fn wait_for_pod_ready(
        &self,
        namespace: &str,
        label_selector: &str,
        timeout: Duration,
    ) -> Result<String, InfraError> {
        let config = watcher::Config::default().labels(label_selector);
        let stream = watcher(self.pods(namespace), config).applied_objects();
        let mut stream = std::pin::pin!(stream);

        let wait = async {
            while let Some(pod) = stream
                .try_next()
                .await
                .map_err(|e| InfraError::Api(format!("pod watch failed: {}", e)))?
            {
                let name = pod.metadata.name.clone().unwrap_or_default();
                if pod_is_ready(&pod) {
                    return Ok(name);
                }
                if pod_has_failed(&pod) {
                    return Err(InfraError::Api(format!("pod {} failed to start", name)));
                }
                debug!(pod = %name, "Waiting for pod to become ready");
            }
            Err(InfraError::Api("pod watch ended unexpectedly".to_string()))
        };

        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            InfraError::Timeout(format!(
                "no pod matching {} became ready within {}s",
                label_selector,
                timeout.as_secs()
            ))
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ContainerStatus, PodStatus};

    fn pod_with(phase: &str, ready: &[bool]) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                container_statuses: Some(
                    ready
                        .iter()
                        .map(|r| ContainerStatus {
                            ready: *r,
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_pod_readiness() {
        assert!(pod_is_ready(&pod_with("Running", &[true, true])));
        assert!(!pod_is_ready(&pod_with("Running", &[true, false])));
        assert!(!pod_is_ready(&pod_with("Running", &[])));
        assert!(!pod_is_ready(&pod_with("Pending", &[true])));
        assert!(!pod_is_ready(&Pod::default()));
    }

    #[test]
    fn test_pod_failure() {
        assert!(pod_has_failed(&pod_with("Failed", &[false])));
        assert!(!pod_has_failed(&pod_with("Running", &[true])));
    }
}
