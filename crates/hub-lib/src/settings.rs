//! Settings model for the Selenium Hub control plane
//!
//! Settings are loaded once by the service binary and treated as read-only
//! afterwards. `HubSettings::updated` is the only way to derive a modified
//! copy, and it re-runs validation on the result.

use crate::error::{HubError, HubResult};
use crate::retry::RetryPolicy;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Port baked into the `selenium/hub` image
pub const HUB_PORT: u16 = 4444;

/// Event bus ports exposed by the hub
pub const EVENT_BUS_PUBLISH_PORT: u16 = 4442;
pub const EVENT_BUS_SUBSCRIBE_PORT: u16 = 4443;

/// Session cap used when `max_browser_instances` is unset
pub const DEFAULT_SESSION_CAP: u32 = 10;

/// Where the hub and its workers run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    /// Local container engine (Docker)
    #[default]
    #[serde(alias = "docker")]
    Local,
    /// Cluster orchestrator (Kubernetes)
    #[serde(alias = "kubernetes")]
    Cluster,
}

impl std::fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeploymentMode::Local => write!(f, "local"),
            DeploymentMode::Cluster => write!(f, "cluster"),
        }
    }
}

/// Resource limits for a single browser worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerResources {
    /// Byte quantity such as "512M", "1G" or "1Gi"
    #[serde(default = "default_memory")]
    pub memory: String,
    /// Core count such as "1", "0.5" or "500m"
    #[serde(default = "default_cpu")]
    pub cpu: String,
}

fn default_memory() -> String {
    "1G".to_string()
}

fn default_cpu() -> String {
    "1".to_string()
}

impl Default for ContainerResources {
    fn default() -> Self {
        Self {
            memory: default_memory(),
            cpu: default_cpu(),
        }
    }
}

impl ContainerResources {
    pub fn new(memory: impl Into<String>, cpu: impl Into<String>) -> Self {
        Self {
            memory: memory.into(),
            cpu: cpu.into(),
        }
    }

    /// Memory limit in bytes
    pub fn memory_bytes(&self) -> HubResult<u64> {
        match parse_memory_bytes(&self.memory) {
            Some(bytes) if bytes > 0 => Ok(bytes),
            _ => Err(HubError::Settings(format!(
                "memory must be a positive byte quantity such as '512M' or '1G', got '{}'",
                self.memory
            ))),
        }
    }

    /// CPU limit in millicores
    pub fn cpu_millicores(&self) -> HubResult<u64> {
        match parse_cpu_millicores(&self.cpu) {
            Some(millis) if millis > 0 => Ok(millis),
            _ => Err(HubError::Settings(format!(
                "cpu must be a positive core count such as '1', '0.5' or '500m', got '{}'",
                self.cpu
            ))),
        }
    }

    pub fn validate(&self) -> HubResult<()> {
        self.memory_bytes()?;
        self.cpu_millicores()?;
        Ok(())
    }
}

/// Image, port and limits for one browser type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrowserConfig {
    pub image: String,
    #[serde(default = "default_node_port")]
    pub port: u16,
    #[serde(default)]
    pub resources: ContainerResources,
}

fn default_node_port() -> u16 {
    5555
}

/// Local engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerSettings {
    #[serde(default = "default_grid_name")]
    pub network_name: String,
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            network_name: default_grid_name(),
        }
    }
}

/// Cluster settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubernetesSettings {
    /// Explicit kubeconfig; the default lookup applies when unset
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default = "default_grid_name")]
    pub namespace: String,
    /// Name shared by the hub Deployment and Service
    #[serde(default = "default_grid_name")]
    pub service_name: String,
    #[serde(default = "default_retry_delay_seconds")]
    pub retry_delay_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_grid_name() -> String {
    "selenium-grid".to_string()
}

fn default_retry_delay_seconds() -> u64 {
    2
}

fn default_max_retries() -> u32 {
    5
}

impl Default for KubernetesSettings {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            context: None,
            namespace: default_grid_name(),
            service_name: default_grid_name(),
            retry_delay_seconds: default_retry_delay_seconds(),
            max_retries: default_max_retries(),
        }
    }
}

impl KubernetesSettings {
    /// Kubeconfig path with a leading `~` expanded
    pub fn kubeconfig_path(&self) -> Option<PathBuf> {
        let path = self.kubeconfig.as_ref()?;
        if path.as_os_str().is_empty() {
            return None;
        }
        match path.strip_prefix("~") {
            Ok(rest) => std::env::var_os("HOME")
                .map(|home| PathBuf::from(home).join(rest))
                .or_else(|| Some(path.clone())),
            Err(_) => Some(path.clone()),
        }
    }
}

/// Aggregate settings for the hub, its workers and both backends
#[derive(Debug, Clone, Deserialize)]
pub struct HubSettings {
    #[serde(default)]
    pub deployment_mode: DeploymentMode,

    /// Fixed by the hub image; any other value is rejected
    #[serde(default = "default_hub_port")]
    pub hub_port: u16,

    #[serde(default = "default_hub_image")]
    pub hub_image: String,

    /// Hub container name (local) and container name inside the hub pod
    #[serde(default = "default_hub_name")]
    pub hub_name: String,

    /// `app` label carried by every worker
    #[serde(default = "default_node_label")]
    pub node_label: String,

    /// Label key carrying the worker's browser type
    #[serde(default = "default_browser_label")]
    pub browser_label: String,

    /// Global cap on workers per request; unbounded when unset
    #[serde(default)]
    pub max_browser_instances: Option<u32>,

    #[serde(default = "default_node_max_sessions")]
    pub se_node_max_sessions: u32,

    #[serde(default = "default_hub_user")]
    pub hub_user: SecretString,

    #[serde(default = "default_hub_password")]
    pub hub_password: SecretString,

    #[serde(default = "default_vnc_password")]
    pub vnc_password: SecretString,

    #[serde(default = "default_true")]
    pub vnc_view_only: bool,

    #[serde(default)]
    pub browser_configs: HashMap<String, BrowserConfig>,

    #[serde(default)]
    pub docker: DockerSettings,

    #[serde(default)]
    pub kubernetes: KubernetesSettings,
}

fn default_hub_port() -> u16 {
    HUB_PORT
}

fn default_hub_image() -> String {
    "selenium/hub:4.18.1".to_string()
}

fn default_hub_name() -> String {
    "selenium-hub".to_string()
}

fn default_node_label() -> String {
    "selenium-node".to_string()
}

fn default_browser_label() -> String {
    "browser".to_string()
}

fn default_node_max_sessions() -> u32 {
    1
}

fn default_hub_user() -> SecretString {
    SecretString::new("user".to_string())
}

fn default_hub_password() -> SecretString {
    SecretString::new("CHANGE_ME".to_string())
}

fn default_vnc_password() -> SecretString {
    SecretString::new("secret".to_string())
}

fn default_true() -> bool {
    true
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            deployment_mode: DeploymentMode::default(),
            hub_port: HUB_PORT,
            hub_image: default_hub_image(),
            hub_name: default_hub_name(),
            node_label: default_node_label(),
            browser_label: default_browser_label(),
            max_browser_instances: None,
            se_node_max_sessions: default_node_max_sessions(),
            hub_user: default_hub_user(),
            hub_password: default_hub_password(),
            vnc_password: default_vnc_password(),
            vnc_view_only: true,
            browser_configs: HashMap::new(),
            docker: DockerSettings::default(),
            kubernetes: KubernetesSettings::default(),
        }
    }
}

impl HubSettings {
    /// Check every load-time invariant
    pub fn validate(&self) -> HubResult<()> {
        if self.hub_port != HUB_PORT {
            return Err(HubError::Settings(format!(
                "hub_port cannot be set. Port {} is hardcoded in the container image.",
                HUB_PORT
            )));
        }

        for (name, value) in [
            ("hub_name", &self.hub_name),
            ("hub_image", &self.hub_image),
            ("node_label", &self.node_label),
            ("browser_label", &self.browser_label),
            ("docker.network_name", &self.docker.network_name),
            ("kubernetes.namespace", &self.kubernetes.namespace),
            ("kubernetes.service_name", &self.kubernetes.service_name),
        ] {
            if value.trim().is_empty() {
                return Err(HubError::Settings(format!("{} must not be empty", name)));
            }
        }

        if self.kubernetes.max_retries == 0 {
            return Err(HubError::Settings(
                "kubernetes.max_retries must be at least 1".to_string(),
            ));
        }

        if self.max_browser_instances == Some(0) {
            return Err(HubError::Settings(
                "max_browser_instances must be positive when set".to_string(),
            ));
        }

        for (name, config) in &self.browser_configs {
            if config.image.trim().is_empty() {
                return Err(HubError::Settings(format!(
                    "browser_configs.{}.image must not be empty",
                    name
                )));
            }
            config.resources.validate().map_err(|e| {
                HubError::Settings(format!("browser_configs.{}.resources: {}", name, e))
            })?;
        }

        Ok(())
    }

    /// Copy these settings, apply `update`, and validate the result
    pub fn updated(&self, update: impl FnOnce(&mut HubSettings)) -> HubResult<HubSettings> {
        let mut copy = self.clone();
        update(&mut copy);
        copy.validate()?;
        Ok(copy)
    }

    /// Session cap handed to the hub, applied the same way on both backends
    pub fn session_cap(&self) -> u32 {
        self.max_browser_instances.unwrap_or(DEFAULT_SESSION_CAP)
    }

    pub fn vnc_no_password(&self) -> bool {
        self.vnc_password.expose_secret().is_empty()
    }

    /// Value for the image's `SE_OPTS` variable carrying the hub credentials
    pub fn se_opts(&self) -> String {
        format!(
            "--username {} --password {}",
            self.hub_user.expose_secret(),
            self.hub_password.expose_secret()
        )
    }

    /// Backoff policy for cluster convergence loops
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.kubernetes.max_retries,
            Duration::from_secs(self.kubernetes.retry_delay_seconds),
        )
    }

    /// Sorted browser type names
    pub fn browser_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.browser_configs.keys().cloned().collect();
        names.sort();
        names
    }

    /// Label selector matching every worker
    pub fn node_selector(&self) -> String {
        format!("app={}", self.node_label)
    }
}

/// `"1"`/`"0"` flag form the Selenium images expect
pub fn flag(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

/// Parse a byte quantity. Accepts bare bytes, docker suffixes (`b`, `k`, `m`,
/// `g`, `t`, optionally followed by `b`) and binary suffixes (`Ki`, `Mi`, ...).
pub fn parse_memory_bytes(value: &str) -> Option<u64> {
    let s = value.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let number: f64 = number.parse().ok()?;
    if !number.is_finite() || number < 0.0 {
        return None;
    }
    let multiplier: u64 = match unit.to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "ki" => 1 << 10,
        "m" | "mb" | "mi" => 1 << 20,
        "g" | "gb" | "gi" => 1 << 30,
        "t" | "tb" | "ti" => 1 << 40,
        _ => return None,
    };
    Some((number * multiplier as f64) as u64)
}

/// Parse a CPU amount (`"2"`, `"0.5"` or `"500m"`) into millicores
pub fn parse_cpu_millicores(value: &str) -> Option<u64> {
    let s = value.trim();
    let millis = match s.strip_suffix('m') {
        Some(m) => m.parse::<f64>().ok()?,
        None => s.parse::<f64>().ok()? * 1000.0,
    };
    if !millis.is_finite() || millis < 0.0 {
        return None;
    }
    Some(millis.round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chrome() -> BrowserConfig {
        BrowserConfig {
            image: "selenium/node-chrome:latest".to_string(),
            port: 5555,
            resources: ContainerResources::new("1G", "1"),
        }
    }

    #[test]
    fn test_default_hub_port_is_accepted() {
        let settings = HubSettings::default();
        assert_eq!(settings.hub_port, HUB_PORT);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_overridden_hub_port_is_rejected() {
        for port in [80, 4443, 4445, 8080] {
            let err = HubSettings::default()
                .updated(|s| s.hub_port = port)
                .unwrap_err();
            assert!(matches!(err, HubError::Settings(_)));
            assert!(err.to_string().contains("4444"));
        }
    }

    #[test]
    fn test_updated_copies_and_leaves_original() {
        let original = HubSettings::default();
        let copy = original
            .updated(|s| s.max_browser_instances = Some(3))
            .unwrap();
        assert_eq!(copy.max_browser_instances, Some(3));
        assert_eq!(original.max_browser_instances, None);
    }

    #[test]
    fn test_session_cap_falls_back_to_default() {
        let settings = HubSettings::default();
        assert_eq!(settings.session_cap(), DEFAULT_SESSION_CAP);
        let capped = settings.updated(|s| s.max_browser_instances = Some(4)).unwrap();
        assert_eq!(capped.session_cap(), 4);
    }

    #[test]
    fn test_zero_cap_rejected() {
        assert!(HubSettings::default()
            .updated(|s| s.max_browser_instances = Some(0))
            .is_err());
    }

    #[test]
    fn test_parse_memory_bytes() {
        assert_eq!(parse_memory_bytes("512"), Some(512));
        assert_eq!(parse_memory_bytes("512M"), Some(512 * 1024 * 1024));
        assert_eq!(parse_memory_bytes("1g"), Some(1 << 30));
        assert_eq!(parse_memory_bytes("1Gi"), Some(1 << 30));
        assert_eq!(parse_memory_bytes("256Mi"), Some(256 << 20));
        assert_eq!(parse_memory_bytes("1.5g"), Some(3 << 29));
        assert_eq!(parse_memory_bytes("lots"), None);
        assert_eq!(parse_memory_bytes("12X"), None);
        assert_eq!(parse_memory_bytes(""), None);
    }

    #[test]
    fn test_parse_cpu_millicores() {
        assert_eq!(parse_cpu_millicores("1"), Some(1000));
        assert_eq!(parse_cpu_millicores("0.5"), Some(500));
        assert_eq!(parse_cpu_millicores("500m"), Some(500));
        assert_eq!(parse_cpu_millicores("two"), None);
        assert_eq!(parse_cpu_millicores("-1"), None);
    }

    #[test]
    fn test_browser_config_resources_validated() {
        let mut settings = HubSettings::default();
        settings.browser_configs.insert("chrome".to_string(), chrome());
        assert!(settings.validate().is_ok());

        let bad_memory = settings
            .updated(|s| {
                s.browser_configs.get_mut("chrome").unwrap().resources.memory = "huge".into()
            })
            .unwrap_err();
        assert!(bad_memory.to_string().contains("browser_configs.chrome"));

        let zero_cpu = settings.updated(|s| {
            s.browser_configs.get_mut("chrome").unwrap().resources.cpu = "0".into()
        });
        assert!(zero_cpu.is_err());
    }

    #[test]
    fn test_deployment_mode_aliases() {
        let mode: DeploymentMode = serde_json::from_str("\"kubernetes\"").unwrap();
        assert_eq!(mode, DeploymentMode::Cluster);
        let mode: DeploymentMode = serde_json::from_str("\"docker\"").unwrap();
        assert_eq!(mode, DeploymentMode::Local);
        assert!(serde_json::from_str::<DeploymentMode>("\"swarm\"").is_err());
    }

    #[test]
    fn test_settings_deserialize_with_defaults() {
        let json = r#"{
            "max_browser_instances": 2,
            "browser_configs": {
                "firefox": { "image": "selenium/node-firefox:latest", "resources": { "memory": "512M", "cpu": "500m" } }
            },
            "kubernetes": { "namespace": "grid" }
        }"#;
        let settings: HubSettings = serde_json::from_str(json).unwrap();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.kubernetes.namespace, "grid");
        assert_eq!(settings.kubernetes.service_name, "selenium-grid");
        assert_eq!(settings.browser_configs["firefox"].port, 5555);
        assert_eq!(settings.browser_names(), vec!["firefox".to_string()]);
        assert_eq!(settings.node_selector(), "app=selenium-node");
    }

    #[test]
    fn test_vnc_flags_and_se_opts() {
        let settings = HubSettings::default();
        assert!(!settings.vnc_no_password());
        assert_eq!(flag(settings.vnc_view_only), "1");
        assert_eq!(settings.se_opts(), "--username user --password CHANGE_ME");

        let open = settings
            .updated(|s| s.vnc_password = SecretString::new(String::new()))
            .unwrap();
        assert!(open.vnc_no_password());
    }
}
