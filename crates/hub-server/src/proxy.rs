//! Authenticated passthrough to the hub's own UI and API
//!
//! Everything under `/selenium-hub` is forwarded to the URL the active
//! backend resolves for the hub, with the hub's basic-auth credentials
//! attached. Callers authenticate with those same credentials.

use crate::api::{constant_time_eq, AppState};
use axum::{
    body::{to_bytes, Body},
    extract::{Path, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hub_lib::HubSettings;
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

pub const PROXY_PREFIX: &str = "/selenium-hub";

const PROXY_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_REDIRECTS: usize = 10;
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Request headers passed through to the hub
const FORWARDED_HEADERS: [&str; 4] = ["user-agent", "accept", "accept-language", "content-type"];

/// Response headers rebuilt by the server rather than copied
const DROPPED_RESPONSE_HEADERS: [&str; 4] = [
    "content-encoding",
    "transfer-encoding",
    "content-length",
    "connection",
];

pub struct HubProxy {
    /// Follows redirects; used for the hub root only
    following: reqwest::Client,
    direct: reqwest::Client,
    user: String,
    password: SecretString,
}

impl HubProxy {
    pub fn new(settings: &HubSettings) -> reqwest::Result<Self> {
        let following = reqwest::Client::builder()
            .timeout(PROXY_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()?;
        let direct = reqwest::Client::builder()
            .timeout(PROXY_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            following,
            direct,
            user: settings.hub_user.expose_secret().clone(),
            password: settings.hub_password.clone(),
        })
    }

    /// Whether `Authorization: Basic ...` carries the hub credentials
    fn authorizes(&self, headers: &HeaderMap) -> bool {
        let Some(encoded) = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Basic "))
        else {
            return false;
        };
        let Some(decoded) = STANDARD
            .decode(encoded.trim())
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
        else {
            return false;
        };
        let Some((user, password)) = decoded.split_once(':') else {
            return false;
        };

        // both halves are always compared
        let user_ok = constant_time_eq(user, &self.user);
        let password_ok = constant_time_eq(password, self.password.expose_secret());
        user_ok & password_ok
    }

    async fn forward(&self, request: Request, target: String, follow_redirects: bool) -> Response {
        let (parts, body) = request.into_parts();
        let body = match to_bytes(body, MAX_BODY_BYTES).await {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "Could not read request body for the hub");
                return StatusCode::PAYLOAD_TOO_LARGE.into_response();
            }
        };
        let Ok(method) = reqwest::Method::from_bytes(parts.method.as_str().as_bytes()) else {
            return StatusCode::METHOD_NOT_ALLOWED.into_response();
        };
        let url = match parts.uri.query() {
            Some(query) => format!("{}?{}", target, query),
            None => target,
        };

        let client = if follow_redirects {
            &self.following
        } else {
            &self.direct
        };
        let mut upstream = client
            .request(method, &url)
            .basic_auth(&self.user, Some(self.password.expose_secret()))
            .body(body);
        for name in FORWARDED_HEADERS {
            if let Some(value) = parts.headers.get(name).and_then(|v| v.to_str().ok()) {
                upstream = upstream.header(name, value);
            }
        }

        let response = match upstream.send().await {
            Ok(response) => response,
            Err(e) => {
                error!(url = %url, error = %e, "Failed to reach the hub");
                return (StatusCode::BAD_GATEWAY, format!("Bad Gateway: {}", e)).into_response();
            }
        };

        let status =
            StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        let mut headers = HeaderMap::new();
        for (name, value) in response.headers() {
            if DROPPED_RESPONSE_HEADERS.contains(&name.as_str()) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_str().as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                headers.append(name, value);
            }
        }
        debug!(url = %url, status = %status, "Proxied request to the hub");

        match response.bytes().await {
            Ok(bytes) => (status, headers, Body::from(bytes)).into_response(),
            Err(e) => {
                error!(url = %url, error = %e, "Hub response was cut short");
                (StatusCode::BAD_GATEWAY, format!("Bad Gateway: {}", e)).into_response()
            }
        }
    }
}

/// Rejects proxy requests that do not carry the hub's basic-auth credentials
pub async fn require_hub_credentials(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    if state.proxy.authorizes(request.headers()) {
        return next.run(request).await;
    }

    warn!(path = %request.uri().path(), "Rejected hub proxy request with invalid credentials");
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"Selenium Hub\"")],
        "Unauthorized",
    )
        .into_response()
}

async fn target_url(state: &AppState, path: &str) -> String {
    let base = state.hub.hub_url().await;
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// The hub root, following its redirects into the UI
pub async fn proxy_root(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let target = target_url(&state, "").await;
    state.proxy.forward(request, target, true).await
}

pub async fn proxy_path(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    request: Request,
) -> Response {
    // the UI resolves its assets relative to a trailing slash
    if path.trim_start_matches('/') == "ui" {
        return Redirect::temporary(&format!("{}/ui/", PROXY_PREFIX)).into_response();
    }
    let target = target_url(&state, &path).await;
    state.proxy.forward(request, target, false).await
}
