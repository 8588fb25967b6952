//! Control plane for a Selenium Grid hub and its browser workers
//!
//! This crate provides:
//! - Typed settings and the error taxonomy
//! - A `ResourceBackend` contract with a local container-engine backend and
//!   a Kubernetes backend (including port-forwarding for test clusters)
//! - The lifecycle manager and the `SeleniumHub` facade
//! - Health tracking and observability

pub mod backend;
pub mod error;
pub mod health;
pub mod hub;
pub mod manager;
pub mod models;
pub mod observability;
pub mod probe;
pub mod retry;
pub mod settings;

/// Recording fakes for the infrastructure seams, shared with the server tests
#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use backend::{Backend, ClusterBackend, LocalBackend, ResourceBackend};
pub use error::{HubError, HubResult, InfraError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use hub::SeleniumHub;
pub use manager::HubLifecycleManager;
pub use models::*;
pub use observability::{HubMetrics, StructuredLogger};
pub use settings::{BrowserConfig, ContainerResources, DeploymentMode, HubSettings};
