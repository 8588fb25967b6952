//! `SeleniumHub`: the process-wide entry point used by the HTTP layer
//!
//! Caller errors (zero count, unknown browser type, capacity) are rejected
//! here before the manager or any backend is touched. The process-wide
//! handle is replaced only through [`SeleniumHub::reset`] and
//! [`SeleniumHub::install`], which are meant for startup, tests and
//! operator reconfiguration, never for use under live traffic.

use crate::backend::unsupported_browser;
use crate::error::{HubError, HubResult};
use crate::manager::{HubLifecycleManager, DEFAULT_ENSURE_RETRIES, DEFAULT_ENSURE_WAIT};
use crate::models::BrowserStatus;
use crate::observability::{HubMetrics, StructuredLogger};
use crate::probe::HubProbe;
use crate::settings::{DeploymentMode, HubSettings};
use secrecy::ExposeSecret;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{info, warn};

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

static INSTANCE: RwLock<Option<Arc<SeleniumHub>>> = RwLock::new(None);

pub struct SeleniumHub {
    settings: Arc<HubSettings>,
    manager: HubLifecycleManager,
    metrics: HubMetrics,
    logger: StructuredLogger,
    probe: HubProbe,
}

impl SeleniumHub {
    /// Validate `settings` and connect the backend they select
    pub async fn new(settings: HubSettings) -> HubResult<Self> {
        settings.validate()?;
        let settings = Arc::new(settings);
        let manager = HubLifecycleManager::new(settings.clone()).await?;
        Ok(Self::from_parts(settings, manager))
    }

    pub fn from_parts(settings: Arc<HubSettings>, manager: HubLifecycleManager) -> Self {
        let mode = manager.deployment_mode();
        let probe = HubProbe::new(
            settings.hub_user.expose_secret().clone(),
            settings.hub_password.clone(),
            HEALTH_CHECK_TIMEOUT,
        );
        Self {
            settings,
            manager,
            metrics: HubMetrics::new(mode),
            logger: StructuredLogger::new(mode),
            probe,
        }
    }

    /// With settings, rebuild the process-wide hub; without, return the
    /// existing one
    pub async fn instance(settings: Option<HubSettings>) -> HubResult<Arc<SeleniumHub>> {
        match settings {
            Some(settings) => Self::reset(settings).await,
            None => Self::get(),
        }
    }

    /// The process-wide hub, or `Uninitialized`
    pub fn get() -> HubResult<Arc<SeleniumHub>> {
        INSTANCE
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(HubError::Uninitialized)
    }

    /// Replace the process-wide hub with one built from `settings`.
    /// The previous instance stays usable by holders of its `Arc`.
    pub async fn reset(settings: HubSettings) -> HubResult<Arc<SeleniumHub>> {
        let hub = Self::new(settings).await?;
        info!(deployment_mode = %hub.deployment_mode(), "Selenium Hub instance rebuilt");
        Ok(Self::install(hub))
    }

    pub fn install(hub: SeleniumHub) -> Arc<SeleniumHub> {
        let hub = Arc::new(hub);
        *INSTANCE.write().unwrap_or_else(PoisonError::into_inner) = Some(hub.clone());
        hub
    }

    /// Drop the process-wide handle, returning it
    pub fn release() -> Option<Arc<SeleniumHub>> {
        INSTANCE
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }

    pub fn deployment_mode(&self) -> DeploymentMode {
        self.manager.deployment_mode()
    }

    pub fn metrics(&self) -> &HubMetrics {
        &self.metrics
    }

    pub fn logger(&self) -> &StructuredLogger {
        &self.logger
    }

    pub async fn ensure_hub_running(
        &self,
        retries: Option<u32>,
        wait: Option<Duration>,
    ) -> HubResult<bool> {
        let started = Instant::now();
        let result = self
            .manager
            .ensure_hub_running(
                retries.unwrap_or(DEFAULT_ENSURE_RETRIES),
                wait.unwrap_or(DEFAULT_ENSURE_WAIT),
            )
            .await;
        self.metrics
            .observe_operation("ensure_hub_running", started.elapsed().as_secs_f64());

        let running = matches!(result, Ok(true));
        self.metrics.set_hub_status(running);
        self.logger.log_hub_status(running);
        result
    }

    /// Create `count` workers of `browser_type`. The returned list may be
    /// shorter than `count`.
    pub async fn create_browsers(&self, count: u32, browser_type: &str) -> HubResult<Vec<String>> {
        self.check_request(count, browser_type)?;

        let started = Instant::now();
        let result = self.manager.create_browsers(count, browser_type).await;
        self.metrics
            .observe_browser_creation(browser_type, started.elapsed().as_secs_f64());

        match &result {
            Ok(ids) => {
                self.metrics
                    .add_browser_instances(browser_type, ids.len() as i64);
                if ids.len() < count as usize {
                    self.metrics
                        .inc_browser_creation_errors(browser_type, "partial");
                }
                self.logger.log_browsers_created(browser_type, count, ids);
            }
            Err(e) => {
                let error_type = match e {
                    e if e.is_validation() => "validation",
                    HubError::HubUnavailable => "hub_unavailable",
                    _ => "infrastructure",
                };
                warn!(browser_type = %browser_type, count, error = %e, "Browser creation failed");
                self.metrics
                    .inc_browser_creation_errors(browser_type, error_type);
            }
        }
        result
    }

    fn check_request(&self, count: u32, browser_type: &str) -> HubResult<()> {
        if count == 0 {
            return Err(HubError::InvalidCount);
        }
        if !self.settings.browser_configs.contains_key(browser_type) {
            return Err(unsupported_browser(
                browser_type,
                &self.settings.browser_configs,
            ));
        }
        if let Some(max) = self.settings.max_browser_instances {
            if count > max {
                return Err(HubError::CapacityExceeded {
                    requested: count,
                    max,
                });
            }
        }
        Ok(())
    }

    pub async fn delete_browsers(&self, ids: &[String]) -> Vec<String> {
        if ids.is_empty() {
            return Vec::new();
        }
        let deleted = self.manager.delete_browsers(ids).await;
        self.logger.log_browsers_deleted(ids.len(), &deleted);
        deleted
    }

    pub async fn delete_browser(&self, id: &str) -> bool {
        self.manager.delete_browser(id).await
    }

    pub async fn get_browser_status(&self, id: &str) -> BrowserStatus {
        self.manager.get_browser_status(id).await
    }

    /// `GET <hub_url>/status` with the hub credentials
    pub async fn check_hub_health(&self) -> bool {
        let url = self.hub_url().await;
        self.probe.check(&url).await
    }

    pub async fn hub_url(&self) -> String {
        self.manager.hub_url().await
    }

    /// `None` unless the hub is reached through a port-forward
    pub async fn port_forward_active(&self) -> Option<bool> {
        self.manager.port_forward_active().await
    }

    /// Remove all workers, then the hub
    pub async fn cleanup(&self) {
        let started = Instant::now();
        self.manager.cleanup().await;
        self.metrics
            .observe_operation("cleanup", started.elapsed().as_secs_f64());
        self.metrics.set_hub_status(false);
        info!(deployment_mode = %self.deployment_mode(), "Selenium Hub resources cleaned up");
    }
}
