//! HTTP API: probes, metrics and browser management

use axum::{
    extract::{Path, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use dashmap::DashMap;
use hub_lib::{
    health::{components, ComponentStatus, HealthRegistry},
    BrowserInstance, HubError, SeleniumHub,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::proxy::{self, HubProxy, PROXY_PREFIX};

/// Shared application state
pub struct AppState {
    pub hub: Arc<SeleniumHub>,
    /// Live workers created through this API, keyed by id
    pub browsers: DashMap<String, BrowserInstance>,
    pub health_registry: HealthRegistry,
    pub proxy: HubProxy,
    api_token: Option<String>,
}

impl AppState {
    pub fn new(
        hub: Arc<SeleniumHub>,
        health_registry: HealthRegistry,
        api_token: Option<String>,
    ) -> anyhow::Result<Self> {
        let proxy = HubProxy::new(hub.settings())?;
        Ok(Self {
            hub,
            browsers: DashMap::new(),
            health_registry,
            proxy,
            api_token,
        })
    }

    fn register(&self, browser_type: &str, ids: &[String]) -> Vec<BrowserInstance> {
        let resources = self
            .hub
            .settings()
            .browser_configs
            .get(browser_type)
            .map(|c| c.resources.clone())
            .unwrap_or_default();

        ids.iter()
            .map(|id| {
                let instance = BrowserInstance::new(id.clone(), browser_type, resources.clone());
                self.browsers.insert(id.clone(), instance.clone());
                instance
            })
            .collect()
    }

    fn unregister(&self, id: &str) {
        if let Some((_, instance)) = self.browsers.remove(id) {
            self.hub
                .metrics()
                .add_browser_instances(&instance.browser_type, -1);
        }
    }
}

/// A library error rendered as `{"error": ...}` with a matching status
pub struct ApiError(HubError);

impl From<HubError> for ApiError {
    fn from(err: HubError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            e if e.is_validation() => StatusCode::BAD_REQUEST,
            HubError::HubUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }
        (
            status,
            Json(serde_json::json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateBrowsersRequest {
    #[serde(default = "default_count")]
    pub count: u32,
    #[serde(default = "default_browser_type")]
    pub browser_type: String,
}

fn default_count() -> u32 {
    1
}

fn default_browser_type() -> String {
    "chrome".to_string()
}

#[derive(Debug, Serialize)]
pub struct CreateBrowsersResponse {
    pub browsers: Vec<BrowserInstance>,
    pub hub_url: String,
    pub status: &'static str,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct DeleteBrowsersRequest {
    pub browsers_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct DeleteBrowsersResponse {
    pub browsers_ids: Vec<String>,
    pub status: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct DeleteBrowserResponse {
    pub success: bool,
    pub message: String,
}

/// Liveness: 200 unless a component is unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy | ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}

/// Converge the hub and report whether it is running
async fn hub_health(State(state): State<Arc<AppState>>) -> Response {
    let running = matches!(state.hub.ensure_hub_running(None, None).await, Ok(true));
    state.health_registry.record_hub(running).await;
    refresh_port_forward(&state.health_registry, &state.hub).await;

    let status_code = if running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = serde_json::json!({
        "status": if running { "healthy" } else { "unhealthy" },
        "deployment_mode": state.hub.deployment_mode().to_string(),
    });
    (status_code, Json(body)).into_response()
}

async fn list_browsers(State(state): State<Arc<AppState>>) -> Json<Vec<BrowserInstance>> {
    let mut browsers: Vec<BrowserInstance> =
        state.browsers.iter().map(|e| e.value().clone()).collect();
    browsers.sort_by(|a, b| a.id.cmp(&b.id));
    Json(browsers)
}

async fn create_browsers(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateBrowsersRequest>,
) -> Result<(StatusCode, Json<CreateBrowsersResponse>), ApiError> {
    let ids = state
        .hub
        .create_browsers(request.count, &request.browser_type)
        .await?;
    state
        .health_registry
        .record_browser_batch(request.count, ids.len())
        .await;

    let browsers = state.register(&request.browser_type, &ids);
    info!(
        browser_type = %request.browser_type,
        requested = request.count,
        created = browsers.len(),
        "Browsers registered"
    );

    Ok((
        StatusCode::CREATED,
        Json(CreateBrowsersResponse {
            message: format!(
                "Created {} of {} {} browsers",
                browsers.len(),
                request.count,
                request.browser_type
            ),
            browsers,
            hub_url: state.hub.hub_url().await,
            status: "created",
        }),
    ))
}

async fn delete_browsers(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DeleteBrowsersRequest>,
) -> Json<DeleteBrowsersResponse> {
    let deleted = state.hub.delete_browsers(&request.browsers_ids).await;
    for id in &deleted {
        state.unregister(id);
    }

    let (status, message) = if deleted.is_empty() {
        ("unchanged", "No browsers deleted.".to_string())
    } else {
        ("deleted", "Browsers deleted successfully.".to_string())
    };
    Json(DeleteBrowsersResponse {
        browsers_ids: deleted,
        status,
        message,
    })
}

async fn delete_browser(
    State(state): State<Arc<AppState>>,
    Path(browser_id): Path<String>,
) -> Json<DeleteBrowserResponse> {
    let success = state.hub.delete_browser(&browser_id).await;
    if success {
        state.unregister(&browser_id);
    }

    Json(DeleteBrowserResponse {
        success,
        message: if success {
            "Browser deleted successfully".to_string()
        } else {
            "Failed to delete browser".to_string()
        },
    })
}

/// Rejects requests without `Authorization: Bearer <token>` when a token
/// is configured
async fn require_token(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.api_token.as_deref() else {
        return next.run(request).await;
    };

    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    if provided.is_some_and(|token| constant_time_eq(token, expected)) {
        next.run(request).await
    } else {
        warn!(path = %request.uri().path(), "Rejected request with missing or invalid token");
        (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "Invalid or missing token" })),
        )
            .into_response()
    }
}

/// Compares in time independent of where the inputs differ
pub(crate) fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/health", get(hub_health))
        .route("/api/v1/browsers", get(list_browsers))
        .route("/api/v1/browsers/create", post(create_browsers))
        .route("/api/v1/browsers/delete", post(delete_browsers))
        .route("/api/v1/browsers/:id", delete(delete_browser))
        .layer(middleware::from_fn_with_state(state.clone(), require_token));

    let hub_proxy = Router::new()
        .route(PROXY_PREFIX, get(proxy::proxy_root))
        .route(
            &format!("{}/*path", PROXY_PREFIX),
            get(proxy::proxy_path)
                .post(proxy::proxy_path)
                .delete(proxy::proxy_path),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            proxy::require_hub_credentials,
        ));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .merge(protected)
        .merge(hub_proxy)
        .with_state(state)
}

/// Serve until `shutdown` resolves
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

/// Register the components `/healthz` reports for this hub
pub async fn register_components(registry: &HealthRegistry, hub: &SeleniumHub) {
    registry.register(components::HUB).await;
    registry.register(components::BACKEND).await;
    if hub.port_forward_active().await.is_some() {
        registry.register(components::PORT_FORWARD).await;
    }
}

/// Copy the port-forward session state into the registry
pub async fn refresh_port_forward(registry: &HealthRegistry, hub: &SeleniumHub) {
    match hub.port_forward_active().await {
        Some(true) => registry.set_healthy(components::PORT_FORWARD).await,
        Some(false) => {
            registry
                .set_unhealthy(components::PORT_FORWARD, "no active port-forward session")
                .await
        }
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use hub_lib::backend::{Backend, ClusterBackend, LocalBackend};
    use hub_lib::settings::DeploymentMode;
    use hub_lib::testing::{chrome_settings, FakeCluster, FakeEngine, FakePortForward};
    use hub_lib::HubLifecycleManager;
    use tower::ServiceExt;

    const TOKEN: &str = "test-token";
    // base64("user:CHANGE_ME"), the default hub credentials
    const HUB_AUTH: &str = "Basic dXNlcjpDSEFOR0VfTUU=";

    fn app(cap: Option<u32>) -> (Router, Arc<AppState>, Arc<FakeEngine>) {
        let engine = FakeEngine::new();
        let settings = Arc::new(chrome_settings(DeploymentMode::Local, cap));
        let backend = Backend::Local(LocalBackend::with_engine(settings.clone(), engine.clone()));
        let manager = HubLifecycleManager::with_backend(settings.clone(), backend);
        let hub = Arc::new(SeleniumHub::from_parts(settings, manager));

        let state = Arc::new(
            AppState::new(hub, HealthRegistry::new("local"), Some(TOKEN.to_string())).unwrap(),
        );
        (create_router(state.clone()), state, engine)
    }

    /// Cluster-mode app whose hub Service exposes `node_port`
    async fn cluster_app(node_port: u16) -> Router {
        let cluster = FakeCluster::new(&["node-a", "node-b"]);
        let settings = Arc::new(chrome_settings(DeploymentMode::Cluster, None));
        let backend = Backend::Cluster(ClusterBackend::with_parts(
            settings.clone(),
            cluster.clone(),
            false,
            false,
            Box::new(FakePortForward::new(true, cluster.log.clone())),
        ));
        let manager = HubLifecycleManager::with_backend(settings.clone(), backend);
        let hub = Arc::new(SeleniumHub::from_parts(settings, manager));
        assert!(hub.ensure_hub_running(Some(1), None).await.unwrap());

        {
            let mut state = cluster.state.lock().unwrap();
            let service = state.services.get_mut("selenium-grid").unwrap();
            for port in service.spec.as_mut().unwrap().ports.as_mut().unwrap() {
                if port.port == 4444 {
                    port.node_port = Some(i32::from(node_port));
                }
            }
        }

        let state = Arc::new(AppState::new(hub, HealthRegistry::new("cluster"), None).unwrap());
        create_router(state)
    }

    fn authed(method: &str, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", TOKEN));
        match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_probes_need_no_token() {
        let (app, state, _) = app(None);
        state.health_registry.record_hub(true).await;

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readyz_before_hub_is_up() {
        let (app, _, _) = app(None);
        let response = app
            .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_api_rejects_missing_token() {
        let (app, _, engine) = app(None);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/browsers")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn test_create_list_and_delete() {
        let (app, state, _) = app(None);

        let response = app
            .clone()
            .oneshot(authed(
                "POST",
                "/api/v1/browsers/create",
                Some(serde_json::json!({ "count": 2, "browser_type": "chrome" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = json_body(response).await;
        assert_eq!(body["status"], "created");
        assert_eq!(body["hub_url"], "http://localhost:4444");
        let browsers = body["browsers"].as_array().unwrap();
        assert_eq!(browsers.len(), 2);
        assert_eq!(browsers[0]["type"], "chrome");
        assert_eq!(state.browsers.len(), 2);

        let response = app
            .clone()
            .oneshot(authed("GET", "/api/v1/browsers", None))
            .await
            .unwrap();
        assert_eq!(json_body(response).await.as_array().unwrap().len(), 2);

        let first = browsers[0]["id"].as_str().unwrap().to_string();
        let response = app
            .clone()
            .oneshot(authed("DELETE", &format!("/api/v1/browsers/{}", first), None))
            .await
            .unwrap();
        assert_eq!(json_body(response).await["success"], true);
        assert_eq!(state.browsers.len(), 1);

        let second = browsers[1]["id"].as_str().unwrap().to_string();
        let response = app
            .oneshot(authed(
                "POST",
                "/api/v1/browsers/delete",
                Some(serde_json::json!({ "browsers_ids": [second, "missing"] })),
            ))
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["status"], "deleted");
        assert_eq!(body["browsers_ids"].as_array().unwrap().len(), 1);
        assert!(state.browsers.is_empty());
    }

    #[tokio::test]
    async fn test_validation_errors_map_to_bad_request() {
        let (app, _, engine) = app(Some(2));

        let response = app
            .clone()
            .oneshot(authed(
                "POST",
                "/api/v1/browsers/create",
                Some(serde_json::json!({ "count": 3, "browser_type": "chrome" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(authed(
                "POST",
                "/api/v1/browsers/create",
                Some(serde_json::json!({ "count": 1, "browser_type": "safari" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert!(body["error"]
            .as_str()
            .unwrap()
            .contains("Unsupported browser type"));
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn test_delete_of_nothing_is_unchanged() {
        let (app, _, _) = app(None);
        let response = app
            .oneshot(authed(
                "POST",
                "/api/v1/browsers/delete",
                Some(serde_json::json!({ "browsers_ids": [] })),
            ))
            .await
            .unwrap();
        assert_eq!(json_body(response).await["status"], "unchanged");
    }

    #[tokio::test]
    async fn test_hub_health_converges_hub() {
        let (app, state, engine) = app(None);
        let response = app.oneshot(authed("GET", "/health", None)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["deployment_mode"], "local");
        assert_eq!(engine.count("create_container:selenium/hub"), 1);
        assert!(state.health_registry.readiness().await.ready);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "abcd"));
        assert!(!constant_time_eq("", "a"));
    }

    #[tokio::test]
    async fn test_api_rejects_wrong_token() {
        let (app, _, engine) = app(None);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/browsers")
                    .header(header::AUTHORIZATION, "Bearer test-tokem")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn test_hub_proxy_requires_hub_credentials() {
        let (app, _, _) = app(None);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/selenium-hub/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));

        // base64("user:wrong")
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/selenium-hub/status")
                    .header(header::AUTHORIZATION, "Basic dXNlcjp3cm9uZw==")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_hub_proxy_forwards_to_hub_url_with_credentials() {
        let mut hub = mockito::Server::new_async().await;
        let mock = hub
            .mock("GET", "/status")
            .match_header("authorization", HUB_AUTH)
            .match_query(mockito::Matcher::UrlEncoded(
                "verbose".into(),
                "true".into(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"value":{"ready":true}}"#)
            .create_async()
            .await;

        let app = cluster_app(hub.socket_address().port()).await;
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/selenium-hub/status?verbose=true")
                    .header(header::AUTHORIZATION, HUB_AUTH)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["value"]["ready"], true);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_hub_proxy_redirects_bare_ui_path() {
        let (app, _, _) = app(None);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/selenium-hub/ui")
                    .header(header::AUTHORIZATION, HUB_AUTH)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "/selenium-hub/ui/"
        );
    }

    #[tokio::test]
    async fn test_delete_route_cannot_remove_hub() {
        let (app, _, engine) = app(None);
        let response = app
            .clone()
            .oneshot(authed("GET", "/health", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(authed("DELETE", "/api/v1/browsers/selenium-hub", None))
            .await
            .unwrap();
        assert_eq!(json_body(response).await["success"], false);
        assert!(engine.container_named("selenium-hub").is_some());
    }
}
