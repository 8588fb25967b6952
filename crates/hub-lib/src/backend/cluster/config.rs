//! Cluster credentials and environment detection

use super::api::ClusterApi;
use crate::error::{HubError, HubResult};
use crate::settings::KubernetesSettings;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::{debug, info, warn};

/// Node name suffix used by kind's single-node test clusters
pub const TEST_CLUSTER_NODE_SUFFIX: &str = "-control-plane";

/// A connected client and whether it came from in-cluster credentials
pub struct ClusterConnection {
    pub client: Client,
    pub in_cluster: bool,
}

/// Try in-cluster credentials first, then the kubeconfig named in settings
/// (or the default lookup).
pub async fn connect(settings: &KubernetesSettings) -> HubResult<ClusterConnection> {
    let (config, in_cluster) = match Config::incluster() {
        Ok(config) => {
            info!("Using in-cluster Kubernetes configuration");
            (config, true)
        }
        Err(e) => {
            debug!(error = %e, "In-cluster configuration unavailable, using kubeconfig");
            (load_kubeconfig(settings).await?, false)
        }
    };

    let client = Client::try_from(config)
        .map_err(|e| HubError::Settings(format!("failed to build Kubernetes client: {}", e)))?;

    Ok(ClusterConnection { client, in_cluster })
}

async fn load_kubeconfig(settings: &KubernetesSettings) -> HubResult<Config> {
    let options = KubeConfigOptions {
        context: settings.context.clone(),
        ..Default::default()
    };

    let config = match settings.kubeconfig_path() {
        Some(path) => {
            info!(path = %path.display(), context = ?settings.context, "Loading kubeconfig");
            let kubeconfig = Kubeconfig::read_from(&path).map_err(|e| {
                HubError::Settings(format!("failed to read kubeconfig {}: {}", path.display(), e))
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &options).await
        }
        None => {
            info!(context = ?settings.context, "Loading default kubeconfig");
            Config::from_kubeconfig(&options).await
        }
    };

    config.map_err(|e| HubError::Settings(format!("failed to load kubeconfig: {}", e)))
}

/// Whether any node follows the single-node test cluster naming
pub async fn detect_test_cluster(api: &dyn ClusterApi) -> bool {
    match api.list_node_names().await {
        Ok(names) => {
            let is_test = is_test_cluster(&names);
            info!(nodes = names.len(), test_cluster = is_test, "Inspected cluster nodes");
            is_test
        }
        Err(e) => {
            warn!(error = %e, "Could not list nodes, assuming a regular cluster");
            false
        }
    }
}

pub fn is_test_cluster(node_names: &[String]) -> bool {
    node_names
        .iter()
        .any(|name| name.ends_with(TEST_CLUSTER_NODE_SUFFIX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_node_names() {
        assert!(is_test_cluster(&["kind-control-plane".to_string()]));
        assert!(is_test_cluster(&[
            "worker-1".to_string(),
            "grid-control-plane".to_string()
        ]));
        assert!(!is_test_cluster(&["ip-10-0-0-1.ec2.internal".to_string()]));
        assert!(!is_test_cluster(&[]));
    }
}
