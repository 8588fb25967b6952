//! Kubernetes object builders and the pre-submission validation gate

use crate::backend::{hub_env, worker_env};
use crate::error::{HubError, HubResult};
use crate::settings::{
    parse_cpu_millicores, parse_memory_bytes, BrowserConfig, HubSettings,
    EVENT_BUS_PUBLISH_PORT, EVENT_BUS_SUBSCRIBE_PORT,
};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, ContainerPort, EnvVar, Namespace, Pod, PodSecurityContext, PodSpec,
    PodTemplateSpec, ResourceRequirements, SeccompProfile, SecurityContext, Service, ServicePort,
    ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;

/// Service types the gate accepts
pub const ALLOWED_SERVICE_TYPES: &[&str] = &["ClusterIP", "NodePort", "LoadBalancer"];

/// UID/GID the Selenium images run as
const SELENIUM_UID: i64 = 1001;

const HUB_CPU_REQUEST: &str = "500m";
const HUB_CPU_LIMIT: &str = "1";
const HUB_MEMORY_REQUEST: &str = "256Mi";
const HUB_MEMORY_LIMIT: &str = "500Mi";

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn env_vars(env: Vec<(String, String)>) -> Vec<EnvVar> {
    env.into_iter()
        .map(|(name, value)| EnvVar {
            name,
            value: Some(value),
            value_from: None,
        })
        .collect()
}

fn quantities(cpu: &str, memory: &str) -> BTreeMap<String, Quantity> {
    BTreeMap::from([
        ("cpu".to_string(), Quantity(cpu.to_string())),
        ("memory".to_string(), Quantity(memory.to_string())),
    ])
}

fn tcp_port(name: &str, port: u16) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: i32::from(port),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn pod_security_context() -> PodSecurityContext {
    PodSecurityContext {
        run_as_non_root: Some(true),
        run_as_user: Some(SELENIUM_UID),
        fs_group: Some(SELENIUM_UID),
        seccomp_profile: Some(SeccompProfile {
            type_: "RuntimeDefault".to_string(),
            localhost_profile: None,
        }),
        ..Default::default()
    }
}

fn container_security_context() -> SecurityContext {
    SecurityContext {
        allow_privilege_escalation: Some(false),
        run_as_non_root: Some(true),
        capabilities: Some(Capabilities {
            add: None,
            drop: Some(vec!["ALL".to_string()]),
        }),
        ..Default::default()
    }
}

/// Namespace object for `name`
pub fn namespace(name: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Selector matching the hub pod
pub fn hub_selector(settings: &HubSettings) -> String {
    format!("app={}", settings.kubernetes.service_name)
}

/// Single-replica hub Deployment with hardened security contexts
pub fn hub_deployment(settings: &HubSettings) -> Deployment {
    let k8s = &settings.kubernetes;
    let app_labels = labels(&[("app", k8s.service_name.as_str())]);

    let container = Container {
        name: settings.hub_name.clone(),
        image: Some(settings.hub_image.clone()),
        ports: Some(vec![
            tcp_port("http", settings.hub_port),
            tcp_port("publish", EVENT_BUS_PUBLISH_PORT),
            tcp_port("subscribe", EVENT_BUS_SUBSCRIBE_PORT),
        ]),
        env: Some(env_vars(hub_env(settings, &k8s.service_name))),
        resources: Some(ResourceRequirements {
            requests: Some(quantities(HUB_CPU_REQUEST, HUB_MEMORY_REQUEST)),
            limits: Some(quantities(HUB_CPU_LIMIT, HUB_MEMORY_LIMIT)),
            ..Default::default()
        }),
        security_context: Some(container_security_context()),
        ..Default::default()
    };

    Deployment {
        metadata: ObjectMeta {
            name: Some(k8s.service_name.clone()),
            namespace: Some(k8s.namespace.clone()),
            labels: Some(app_labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(app_labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(app_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    security_context: Some(pod_security_context()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Hub Service: ClusterIP inside the cluster, NodePort otherwise
pub fn hub_service(settings: &HubSettings, in_cluster: bool) -> Service {
    let k8s = &settings.kubernetes;
    let service_port = |name: &str, port: u16| ServicePort {
        name: Some(name.to_string()),
        port: i32::from(port),
        target_port: Some(IntOrString::Int(i32::from(port))),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    };

    Service {
        metadata: ObjectMeta {
            name: Some(k8s.service_name.clone()),
            namespace: Some(k8s.namespace.clone()),
            labels: Some(labels(&[("app", k8s.service_name.as_str())])),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(labels(&[("app", k8s.service_name.as_str())])),
            type_: Some(if in_cluster { "ClusterIP" } else { "NodePort" }.to_string()),
            ports: Some(vec![
                service_port("http", settings.hub_port),
                service_port("publish", EVENT_BUS_PUBLISH_PORT),
                service_port("subscribe", EVENT_BUS_SUBSCRIBE_PORT),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Worker pod named `name`; requests equal limits
pub fn browser_pod(
    settings: &HubSettings,
    name: &str,
    browser_type: &str,
    config: &BrowserConfig,
) -> HubResult<Pod> {
    let memory = config.resources.memory_bytes()?;
    let millicores = config.resources.cpu_millicores()?;
    let resources = quantities(&format!("{}m", millicores), &memory.to_string());

    let container = Container {
        name: format!("{}-{}", settings.node_label, browser_type),
        image: Some(config.image.clone()),
        ports: Some(vec![tcp_port("node", config.port)]),
        env: Some(env_vars(worker_env(settings, &settings.kubernetes.service_name))),
        resources: Some(ResourceRequirements {
            requests: Some(resources.clone()),
            limits: Some(resources),
            ..Default::default()
        }),
        ..Default::default()
    };

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(settings.kubernetes.namespace.clone()),
            labels: Some(labels(&[
                ("app", settings.node_label.as_str()),
                (settings.browser_label.as_str(), browser_type),
            ])),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![container],
            restart_policy: Some("Never".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn invalid(kind: &'static str, reason: impl Into<String>) -> HubError {
    HubError::InvalidSpec {
        kind,
        reason: reason.into(),
    }
}

fn check_limits(container: &Container) -> HubResult<()> {
    let kind = "Deployment";
    let limits = container
        .resources
        .as_ref()
        .and_then(|r| r.limits.as_ref())
        .ok_or_else(|| invalid(kind, format!("container {} has no resource limits", container.name)))?;

    let memory = limits
        .get("memory")
        .ok_or_else(|| invalid(kind, format!("container {} has no memory limit", container.name)))?;
    let cpu = limits
        .get("cpu")
        .ok_or_else(|| invalid(kind, format!("container {} has no cpu limit", container.name)))?;

    if !matches!(parse_memory_bytes(&memory.0), Some(bytes) if bytes > 0) {
        return Err(invalid(kind, format!("memory limit '{}' is not a positive quantity", memory.0)));
    }
    if !matches!(parse_cpu_millicores(&cpu.0), Some(millis) if millis > 0) {
        return Err(invalid(kind, format!("cpu limit '{}' is not a positive quantity", cpu.0)));
    }
    Ok(())
}

/// Reject a hub Deployment missing limits or a security context
pub fn validate_deployment(deployment: &Deployment) -> HubResult<()> {
    let kind = "Deployment";
    let pod_spec = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.template.spec.as_ref())
        .ok_or_else(|| invalid(kind, "missing pod template"))?;

    if pod_spec.containers.is_empty() {
        return Err(invalid(kind, "pod template has no containers"));
    }

    let security = pod_spec
        .security_context
        .as_ref()
        .ok_or_else(|| invalid(kind, "missing pod security context"))?;
    if security.run_as_non_root != Some(true) {
        return Err(invalid(kind, "pod security context must set runAsNonRoot"));
    }

    for container in &pod_spec.containers {
        check_limits(container)?;
    }
    Ok(())
}

/// Reject a Service with an unknown type or incomplete ports
pub fn validate_service(service: &Service) -> HubResult<()> {
    let kind = "Service";
    let spec = service
        .spec
        .as_ref()
        .ok_or_else(|| invalid(kind, "missing spec"))?;

    let service_type = spec.type_.as_deref().unwrap_or("ClusterIP");
    if !ALLOWED_SERVICE_TYPES.contains(&service_type) {
        return Err(invalid(kind, format!("unsupported service type '{}'", service_type)));
    }

    let ports = spec.ports.as_deref().unwrap_or_default();
    if ports.is_empty() {
        return Err(invalid(kind, "no ports declared"));
    }
    for port in ports {
        if port.port <= 0 || port.target_port.is_none() {
            return Err(invalid(
                kind,
                format!(
                    "port {} must declare both port and targetPort",
                    port.name.as_deref().unwrap_or("<unnamed>")
                ),
            ));
        }
    }
    Ok(())
}
