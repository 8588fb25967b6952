use super::*;
use crate::error::HubError;
use crate::settings::DeploymentMode;
use crate::testing::{chrome_settings, FakeEngine};

fn backend_with(engine: Arc<FakeEngine>, cap: Option<u32>) -> LocalBackend {
    let settings = Arc::new(chrome_settings(DeploymentMode::Local, cap));
    LocalBackend::with_engine(settings, engine)
}

fn configs() -> HashMap<String, BrowserConfig> {
    chrome_settings(DeploymentMode::Local, None).browser_configs
}

#[tokio::test]
async fn test_ensure_creates_network_and_hub() {
    let engine = FakeEngine::new();
    let backend = backend_with(engine.clone(), None);

    assert!(backend.ensure_hub_running().await.unwrap());

    let calls = engine.calls();
    assert!(calls.contains(&"create_network:selenium-grid".to_string()));
    assert!(calls.contains(&"pull_image:selenium/hub:4.18.1".to_string()));
    assert_eq!(engine.count("create_container:selenium/hub"), 1);

    let hub = engine.container_named("selenium-hub").unwrap();
    assert_eq!(hub.labels.get("app").map(String::as_str), Some("selenium-hub"));
}

#[tokio::test]
async fn test_ensure_is_idempotent() {
    let engine = FakeEngine::new();
    let backend = backend_with(engine.clone(), None);

    assert!(backend.ensure_hub_running().await.unwrap());
    engine.clear_calls();
    assert!(backend.ensure_hub_running().await.unwrap());

    assert_eq!(engine.count("create_network"), 0);
    assert_eq!(engine.count("create_container"), 0);
    assert_eq!(engine.count("pull_image"), 0);
    assert_eq!(engine.container_count(), 1);
}

#[tokio::test]
async fn test_stopped_hub_is_restarted() {
    let engine = FakeEngine::new();
    engine
        .state
        .lock()
        .unwrap()
        .networks
        .insert("selenium-grid".to_string());
    engine.add_container("selenium-hub", "exited", &[("app", "selenium-hub")]);
    let backend = backend_with(engine.clone(), None);

    assert!(backend.ensure_hub_running().await.unwrap());
    assert_eq!(engine.count("restart_container:selenium-hub"), 1);
    assert_eq!(engine.count("create_container"), 0);
}

#[tokio::test]
async fn test_engine_error_reports_not_running() {
    let engine = FakeEngine::new();
    engine.fail_network_lookups(1);
    let backend = backend_with(engine.clone(), None);

    assert!(!backend.ensure_hub_running().await.unwrap());
    // a non-404 lookup failure must not fall through to creation
    assert_eq!(engine.count("create_network"), 0);
}

#[tokio::test]
async fn test_create_browsers_returns_short_ids() {
    let engine = FakeEngine::new();
    let backend = backend_with(engine.clone(), None);

    let ids = backend.create_browsers(2, "chrome", &configs()).await.unwrap();

    assert_eq!(ids.len(), 2);
    assert!(ids.iter().all(|id| id.len() == SHORT_ID_LEN));
    assert_ne!(ids[0], ids[1]);
    // image is pulled once, then found locally
    assert_eq!(engine.count("pull_image"), 1);
}

#[tokio::test]
async fn test_worker_labels_and_limits() {
    let engine = FakeEngine::new();
    let backend = backend_with(engine.clone(), None);
    let config = &configs()["chrome"];

    let spec = backend.worker_spec("chrome", config).unwrap();
    assert_eq!(spec.labels.get("app").map(String::as_str), Some("selenium-node"));
    assert_eq!(spec.labels.get("browser").map(String::as_str), Some("chrome"));
    assert_eq!(spec.memory_bytes, Some(1 << 30));
    assert_eq!(spec.nano_cpus, Some(1_000_000_000));
    assert!(spec
        .env
        .contains(&("SE_EVENT_BUS_HOST".to_string(), "selenium-hub".to_string())));
}

#[tokio::test]
async fn test_partial_failure_returns_fewer_ids() {
    let engine = FakeEngine::new();
    engine.fail_runs([1, 3]);
    let backend = backend_with(engine.clone(), None);

    let ids = backend.create_browsers(5, "chrome", &configs()).await.unwrap();

    assert_eq!(ids.len(), 3);
    assert_eq!(engine.count("create_container"), 5);
}

#[tokio::test]
async fn test_unknown_browser_type_rejected_without_engine_calls() {
    let engine = FakeEngine::new();
    let backend = backend_with(engine.clone(), None);

    let err = backend
        .create_browsers(1, "safari", &configs())
        .await
        .unwrap_err();

    assert!(matches!(err, HubError::UnsupportedBrowser { .. }));
    assert!(engine.calls().is_empty());
}

#[tokio::test]
async fn test_delete_browser_missing_returns_false() {
    let engine = FakeEngine::new();
    let backend = backend_with(engine.clone(), None);

    let ids = backend.create_browsers(1, "chrome", &configs()).await.unwrap();
    assert!(backend.delete_browser(&ids[0]).await);
    assert!(!backend.delete_browser(&ids[0]).await);
}

#[tokio::test]
async fn test_delete_browsers_reports_subset() {
    let engine = FakeEngine::new();
    let backend = backend_with(engine.clone(), None);

    let mut ids = backend.create_browsers(2, "chrome", &configs()).await.unwrap();
    ids.push("doesnotexist".to_string());

    let deleted = backend.delete_browsers(&ids).await;
    assert_eq!(deleted.len(), 2);
    assert!(!deleted.contains(&"doesnotexist".to_string()));
}

#[tokio::test]
async fn test_delete_browser_refuses_hub_container() {
    let engine = FakeEngine::new();
    let backend = backend_with(engine.clone(), None);

    assert!(backend.ensure_hub_running().await.unwrap());
    engine.clear_calls();

    assert!(!backend.delete_browser("selenium-hub").await);
    assert_eq!(engine.count("remove_container"), 0);
    let hub = engine.container_named("selenium-hub").unwrap();
    assert_eq!(hub.status, "running");
}

#[tokio::test]
async fn test_delete_browser_refuses_unlabelled_container() {
    let engine = FakeEngine::new();
    engine.add_container("someone-else", "running", &[("app", "postgres")]);
    let backend = backend_with(engine.clone(), None);

    assert!(!backend.delete_browser("someone-else").await);
    assert!(engine.container_named("someone-else").is_some());
}

#[tokio::test]
async fn test_container_that_fails_to_start_is_removed() {
    let engine = FakeEngine::new();
    engine.fail_starts([0]);
    let backend = backend_with(engine.clone(), None);

    let ids = backend.create_browsers(2, "chrome", &configs()).await.unwrap();

    assert_eq!(ids.len(), 1);
    assert_eq!(engine.count("create_container"), 2);
    assert_eq!(engine.count("remove_container"), 1);
    assert_eq!(engine.container_count(), 1);
}

#[tokio::test]
async fn test_cleanup_removes_workers_before_hub() {
    let engine = FakeEngine::new();
    let backend = backend_with(engine.clone(), None);

    backend.ensure_hub_running().await.unwrap();
    backend.create_browsers(2, "chrome", &configs()).await.unwrap();
    engine.clear_calls();

    backend.cleanup().await;

    let calls = engine.calls();
    let hub_removal = calls
        .iter()
        .position(|c| c == "remove_container:selenium-hub")
        .unwrap();
    let worker_removals: Vec<usize> = calls
        .iter()
        .enumerate()
        .filter(|(_, c)| c.starts_with("remove_container:") && !c.ends_with("selenium-hub"))
        .map(|(i, _)| i)
        .collect();

    assert_eq!(worker_removals.len(), 2);
    assert!(worker_removals.iter().all(|i| *i < hub_removal));
    assert_eq!(calls.last().map(String::as_str), Some("remove_network:selenium-grid"));
    assert_eq!(engine.container_count(), 0);
}

#[tokio::test]
async fn test_cleanup_tolerates_missing_hub() {
    let engine = FakeEngine::new();
    let backend = backend_with(engine.clone(), None);

    backend.cleanup().await;

    assert_eq!(engine.count("remove_container:selenium-hub"), 1);
    assert_eq!(engine.count("remove_network"), 1);
}

#[tokio::test]
async fn test_browser_status() {
    let engine = FakeEngine::new();
    let backend = backend_with(engine.clone(), None);

    let ids = backend.create_browsers(1, "chrome", &configs()).await.unwrap();
    let status = backend.get_browser_status(&ids[0]).await;
    assert_eq!(status.id, ids[0]);
    assert_eq!(status.status, "running");
    assert_eq!(status.image.as_deref(), Some("selenium/node-chrome:latest"));

    let missing = backend.get_browser_status("nope").await;
    assert!(!missing.exists());
}

#[tokio::test]
async fn test_hub_url_is_localhost() {
    let backend = backend_with(FakeEngine::new(), None);
    assert_eq!(backend.hub_url().await, "http://localhost:4444");
}
