//! Server configuration
//!
//! Hub settings live at the top level of the config file and the `HUB__`
//! environment namespace. Server-only options live under `server`.

use anyhow::{Context, Result};
use hub_lib::settings::{DeploymentMode, HubSettings};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Options for the HTTP control plane itself
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bearer token for the `/api` and `/health` routes; auth is off when unset
    #[serde(default)]
    pub api_token: Option<String>,

    /// Hub convergence attempts at startup
    #[serde(default = "default_startup_retries")]
    pub startup_retries: u32,

    #[serde(default = "default_startup_wait_secs")]
    pub startup_wait_secs: u64,
}

fn default_port() -> u16 {
    8000
}

fn default_startup_retries() -> u32 {
    3
}

fn default_startup_wait_secs() -> u64 {
    2
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            api_token: None,
            startup_retries: default_startup_retries(),
            startup_wait_secs: default_startup_wait_secs(),
        }
    }
}

impl ServerConfig {
    pub fn startup_wait(&self) -> Duration {
        Duration::from_secs(self.startup_wait_secs)
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub hub: HubSettings,
}

impl AppConfig {
    /// Load from `HUB_CONFIG_FILE` (or an optional `config.{yaml,toml}` in
    /// the working directory) and the `HUB__*` environment
    pub fn load() -> Result<Self> {
        let file = std::env::var_os("HUB_CONFIG_FILE").map(PathBuf::from);
        let in_docker = std::env::var("IS_RUNNING_IN_DOCKER")
            .map(|v| is_truthy(&v))
            .unwrap_or(false);
        Self::load_with(file.as_deref(), None, in_docker)
    }

    /// `env` replaces the process environment when given
    fn load_with(
        file: Option<&Path>,
        env: Option<HashMap<String, String>>,
        in_docker: bool,
    ) -> Result<Self> {
        let file_source = match file {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name("config").required(false),
        };

        let settings = config::Config::builder()
            .add_source(file_source)
            .add_source(
                config::Environment::with_prefix("HUB")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()
            .context("failed to read configuration")?;

        let server = match settings.get::<ServerConfig>("server") {
            Ok(server) => server,
            Err(config::ConfigError::NotFound(_)) => ServerConfig::default(),
            Err(e) => return Err(e).context("invalid server configuration"),
        };

        let mut hub: HubSettings = settings
            .try_deserialize()
            .context("invalid hub settings")?;

        // A containerised control plane cannot reach the host's engine
        if in_docker {
            hub.deployment_mode = DeploymentMode::Cluster;
        }
        hub.validate()?;

        Ok(Self { server, hub })
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
