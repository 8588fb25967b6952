use super::*;
use crate::settings::DeploymentMode;
use crate::testing::{chrome_settings, FakeCluster, FakePortForward};
use std::sync::atomic::{AtomicU32, Ordering};

struct Harness {
    cluster: Arc<FakeCluster>,
    starts: Arc<AtomicU32>,
    stops: Arc<AtomicU32>,
    backend: ClusterBackend,
}

fn harness(in_cluster: bool, test_cluster: bool, port_forward_works: bool) -> Harness {
    let nodes: &[&str] = if test_cluster {
        &["kind-control-plane"]
    } else {
        &["node-a", "node-b"]
    };
    let cluster = FakeCluster::new(nodes);
    let port_forward = FakePortForward::new(port_forward_works, cluster.log.clone());
    let starts = port_forward.starts.clone();
    let stops = port_forward.stops.clone();
    let settings = Arc::new(chrome_settings(DeploymentMode::Cluster, None));

    let backend = ClusterBackend::with_parts(
        settings,
        cluster.clone(),
        in_cluster,
        test_cluster,
        Box::new(port_forward),
    );

    Harness {
        cluster,
        starts,
        stops,
        backend,
    }
}

fn configs() -> HashMap<String, BrowserConfig> {
    chrome_settings(DeploymentMode::Cluster, None).browser_configs
}

#[tokio::test]
async fn test_ensure_creates_namespace_deployment_service_in_order() {
    let h = harness(false, false, true);

    assert!(h.backend.ensure_hub_running().await.unwrap());

    let creates: Vec<String> = h
        .cluster
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("create_"))
        .collect();
    assert_eq!(
        creates,
        vec![
            "create_namespace:selenium-grid",
            "create_deployment:selenium-grid",
            "create_service:selenium-grid",
        ]
    );

    let state = h.cluster.state.lock().unwrap();
    let service = &state.services["selenium-grid"];
    assert_eq!(
        service.spec.as_ref().unwrap().type_.as_deref(),
        Some("NodePort")
    );
}

#[tokio::test]
async fn test_ensure_is_idempotent() {
    let h = harness(true, false, true);

    assert!(h.backend.ensure_hub_running().await.unwrap());
    h.cluster.clear_calls();
    assert!(h.backend.ensure_hub_running().await.unwrap());

    assert_eq!(h.cluster.count("create_"), 0);
    assert_eq!(h.cluster.count("get_"), 3);
}

#[tokio::test]
async fn test_in_cluster_service_is_cluster_ip() {
    let h = harness(true, false, true);
    h.backend.ensure_hub_running().await.unwrap();

    let state = h.cluster.state.lock().unwrap();
    assert_eq!(
        state.services["selenium-grid"]
            .spec
            .as_ref()
            .unwrap()
            .type_
            .as_deref(),
        Some("ClusterIP")
    );
}

#[tokio::test(start_paused = true)]
async fn test_transient_read_error_is_retried_with_backoff() {
    let h = harness(false, false, true);
    h.cluster.state.lock().unwrap().namespace_failures = 2;
    let start = tokio::time::Instant::now();

    assert!(h.backend.ensure_hub_running().await.unwrap());

    assert_eq!(h.cluster.count("get_namespace"), 3);
    assert_eq!(h.cluster.count("create_namespace"), 1);
    // 1s then 2s of backoff
    assert!(start.elapsed() >= Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_report_not_running() {
    let h = harness(false, false, true);
    h.cluster.state.lock().unwrap().namespace_failures = 10;

    assert!(!h.backend.ensure_hub_running().await.unwrap());
    assert_eq!(h.cluster.count("get_namespace"), 3);
    assert_eq!(h.cluster.count("create_"), 0);
}

#[tokio::test]
async fn test_test_cluster_waits_once_then_forwards_once() {
    let h = harness(false, true, true);

    assert!(h.backend.ensure_hub_running().await.unwrap());
    assert_eq!(h.cluster.count("wait_for_pod_ready:app=selenium-grid"), 1);
    assert_eq!(h.starts.load(Ordering::SeqCst), 1);

    let calls = h.cluster.calls();
    let waited = calls.iter().position(|c| c.starts_with("wait_for_pod_ready")).unwrap();
    let started = calls.iter().position(|c| c == "port_forward_start").unwrap();
    assert!(waited < started);

    // an active session is reused
    assert!(h.backend.ensure_hub_running().await.unwrap());
    assert_eq!(h.cluster.count("wait_for_pod_ready"), 1);
    assert_eq!(h.starts.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_ready_timeout_never_starts_port_forward() {
    let h = harness(false, true, true);
    {
        let mut state = h.cluster.state.lock().unwrap();
        for _ in 0..3 {
            state
                .ready_results
                .push_back(Err(InfraError::Timeout("hub pod".to_string())));
        }
    }

    assert!(!h.backend.ensure_hub_running().await.unwrap());
    assert_eq!(h.cluster.count("wait_for_pod_ready"), 3);
    assert_eq!(h.starts.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_port_forward_reports_not_running() {
    let h = harness(false, true, false);

    assert!(!h.backend.ensure_hub_running().await.unwrap());
    assert_eq!(h.starts.load(Ordering::SeqCst), 3);
    // resources were created once and found on later attempts
    assert_eq!(h.cluster.count("create_deployment"), 1);
}

#[tokio::test]
async fn test_regular_cluster_never_forwards() {
    let h = harness(false, false, true);
    assert!(h.backend.ensure_hub_running().await.unwrap());
    assert_eq!(h.cluster.count("wait_for_pod_ready"), 0);
    assert_eq!(h.starts.load(Ordering::SeqCst), 0);
    assert_eq!(h.backend.port_forward_active().await, None);
}

#[tokio::test]
async fn test_port_forward_state_on_test_cluster() {
    let h = harness(false, true, true);
    assert_eq!(h.backend.port_forward_active().await, Some(false));

    assert!(h.backend.ensure_hub_running().await.unwrap());
    assert_eq!(h.backend.port_forward_active().await, Some(true));
}

#[tokio::test]
async fn test_create_browsers_names_and_labels() {
    let h = harness(false, false, true);

    let names = h.backend.create_browsers(2, "chrome", &configs()).await.unwrap();

    assert_eq!(names.len(), 2);
    assert_ne!(names[0], names[1]);
    for name in &names {
        let suffix = name.strip_prefix("selenium-node-chrome-").unwrap();
        assert_eq!(suffix.len(), 8);
    }

    let state = h.cluster.state.lock().unwrap();
    let labels = state.pods[&names[0]].metadata.labels.clone().unwrap();
    assert_eq!(labels.get("app").map(String::as_str), Some("selenium-node"));
    assert_eq!(labels.get("browser").map(String::as_str), Some("chrome"));
}

#[tokio::test(start_paused = true)]
async fn test_conflict_retries_immediately_with_fresh_name() {
    let h = harness(false, false, true);
    h.cluster
        .state
        .lock()
        .unwrap()
        .create_pod_errors
        .push_back(InfraError::Conflict("taken".to_string()));
    let start = tokio::time::Instant::now();

    let names = h.backend.create_browsers(1, "chrome", &configs()).await.unwrap();

    assert_eq!(names.len(), 1);
    let attempts: Vec<String> = h
        .cluster
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("create_pod:"))
        .collect();
    assert_eq!(attempts.len(), 2);
    assert_ne!(attempts[0], attempts[1]);
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_unit_exhausting_retries_is_skipped() {
    let h = harness(false, false, true);
    {
        let mut state = h.cluster.state.lock().unwrap();
        for _ in 0..3 {
            state
                .create_pod_errors
                .push_back(InfraError::Api("quota exceeded".to_string()));
        }
    }

    let names = h.backend.create_browsers(3, "chrome", &configs()).await.unwrap();

    assert_eq!(names.len(), 2);
    assert_eq!(h.cluster.count("create_pod"), 5);
    assert_eq!(h.cluster.pod_count(), 2);
}

#[tokio::test]
async fn test_unknown_browser_type_rejected_without_api_calls() {
    let h = harness(false, false, true);
    h.cluster.clear_calls();

    let err = h
        .backend
        .create_browsers(1, "opera", &configs())
        .await
        .unwrap_err();

    assert!(matches!(err, HubError::UnsupportedBrowser { .. }));
    assert!(h.cluster.calls().is_empty());
}

#[tokio::test]
async fn test_delete_browser() {
    let h = harness(false, false, true);
    let names = h.backend.create_browsers(1, "chrome", &configs()).await.unwrap();

    assert!(h.backend.delete_browser(&names[0]).await);
    assert!(!h.backend.delete_browser(&names[0]).await);
    assert!(!h.backend.delete_browser("selenium-node-chrome-missing0").await);
}

#[tokio::test]
async fn test_delete_browser_refuses_hub_pod() {
    let h = harness(false, false, true);
    h.backend.ensure_hub_running().await.unwrap();
    h.cluster
        .insert_pod("selenium-grid-7d9f-abcde", "Running", &[("app", "selenium-grid")]);
    h.cluster.clear_calls();

    assert!(!h.backend.delete_browser("selenium-grid-7d9f-abcde").await);
    assert_eq!(h.cluster.count("delete_pod"), 0);
    assert_eq!(h.cluster.pod_count(), 1);
}

#[tokio::test]
async fn test_cleanup_stops_forward_then_workers_then_hub() {
    let h = harness(false, true, true);
    h.backend.ensure_hub_running().await.unwrap();
    h.backend.create_browsers(2, "chrome", &configs()).await.unwrap();
    h.cluster
        .insert_pod("unrelated", "Running", &[("app", "something-else")]);
    h.cluster.clear_calls();

    h.backend.cleanup().await;

    let calls = h.cluster.calls();
    let position = |prefix: &str| calls.iter().position(|c| c.starts_with(prefix)).unwrap();
    let stop = position("port_forward_stop");
    let workers = position("delete_pods:app=selenium-node");
    let deployment = position("delete_deployment:selenium-grid");
    let service = position("delete_service:selenium-grid");

    assert!(stop < workers);
    assert!(workers < deployment);
    assert!(deployment < service);
    assert_eq!(h.stops.load(Ordering::SeqCst), 1);
    // only the unrelated pod survives
    assert_eq!(h.cluster.pod_count(), 1);

    let state = h.cluster.state.lock().unwrap();
    assert!(state.deployments.is_empty());
    assert!(state.services.is_empty());
}

#[tokio::test]
async fn test_cleanup_without_hub_is_quiet() {
    let h = harness(false, false, true);
    h.backend.cleanup().await;
    assert_eq!(h.cluster.count("delete_deployment"), 1);
    assert_eq!(h.cluster.count("delete_service"), 1);
    assert_eq!(h.stops.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_browser_status() {
    let h = harness(false, false, true);
    let names = h.backend.create_browsers(1, "chrome", &configs()).await.unwrap();

    let status = h.backend.get_browser_status(&names[0]).await;
    assert_eq!(status.name.as_deref(), Some(names[0].as_str()));
    assert_eq!(status.image.as_deref(), Some("selenium/node-chrome:latest"));
    assert_eq!(status.status, "Unknown");

    h.cluster.insert_pod("running-pod", "Running", &[]);
    assert_eq!(h.backend.get_browser_status("running-pod").await.status, "Running");

    assert!(!h.backend.get_browser_status("gone").await.exists());
}

#[tokio::test]
async fn test_hub_url_in_cluster_uses_service_dns() {
    let h = harness(true, false, true);
    assert_eq!(
        h.backend.hub_url().await,
        "http://selenium-grid.selenium-grid.svc.cluster.local:4444"
    );
}

#[tokio::test]
async fn test_hub_url_out_of_cluster_uses_node_port() {
    let h = harness(false, false, true);
    // no service yet
    assert_eq!(h.backend.hub_url().await, "http://localhost:4444");

    h.backend.ensure_hub_running().await.unwrap();
    {
        let mut state = h.cluster.state.lock().unwrap();
        let service = state.services.get_mut("selenium-grid").unwrap();
        service.spec.as_mut().unwrap().ports.as_mut().unwrap()[0].node_port = Some(30444);
    }
    assert_eq!(h.backend.hub_url().await, "http://localhost:30444");
}

#[tokio::test]
async fn test_hub_url_on_test_cluster_is_forwarded_port() {
    let h = harness(false, true, true);
    assert_eq!(h.backend.hub_url().await, "http://localhost:4444");
}

#[tokio::test]
async fn test_detects_test_cluster_from_nodes() {
    let kind = FakeCluster::new(&["kind-control-plane"]);
    assert!(detect_test_cluster(kind.as_ref()).await);

    let regular = FakeCluster::new(&["ip-10-0-1-7"]);
    assert!(!detect_test_cluster(regular.as_ref()).await);
}
