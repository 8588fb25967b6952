//! Local port-forward to the hub Service
//!
//! Runs `kubectl port-forward` as a child process. Its stdout and stderr are
//! drained into the log by two tasks per process so the child never blocks on
//! a full pipe. A session only counts as started once the injected health
//! check passes through the forwarded port.

use crate::settings::HubSettings;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Predicate deciding whether the forwarded hub answers
pub type HealthCheck = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

/// A startable, stoppable port-forward session
#[async_trait]
pub trait PortForward: Send + Sync {
    /// Start the session, retrying internally. `true` once the forwarded port
    /// passes the health check.
    async fn start(&mut self) -> bool;

    /// Terminate the session if one is running
    async fn stop(&mut self);

    fn is_active(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct PortForwardConfig {
    pub service_name: String,
    pub namespace: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub kubeconfig: Option<PathBuf>,
    pub context: Option<String>,
    pub max_retries: u32,
    /// Upper bound on one health check
    pub health_timeout: Duration,
    /// Pause between spawning and the first liveness probe
    pub settle_delay: Duration,
    pub retry_delay: Duration,
    /// Grace period between SIGTERM and SIGKILL
    pub stop_timeout: Duration,
}

impl PortForwardConfig {
    /// Forward `localhost:<hub_port>` to the hub Service
    pub fn for_hub(settings: &HubSettings) -> Self {
        let k8s = &settings.kubernetes;
        Self {
            service_name: k8s.service_name.clone(),
            namespace: k8s.namespace.clone(),
            local_port: settings.hub_port,
            remote_port: settings.hub_port,
            kubeconfig: k8s.kubeconfig_path(),
            context: k8s.context.clone(),
            max_retries: k8s.max_retries,
            health_timeout: Duration::from_secs(30),
            settle_delay: Duration::from_secs(2),
            retry_delay: Duration::from_secs(2),
            stop_timeout: Duration::from_secs(5),
        }
    }

    /// `kubectl` invocation for this forward
    pub fn command(&self) -> Vec<String> {
        let mut command = vec![
            "kubectl".to_string(),
            "port-forward".to_string(),
            format!("service/{}", self.service_name),
            format!("{}:{}", self.local_port, self.remote_port),
            "-n".to_string(),
            self.namespace.clone(),
        ];
        if let Some(path) = &self.kubeconfig {
            command.push("--kubeconfig".to_string());
            command.push(path.display().to_string());
        }
        if let Some(context) = &self.context {
            command.push("--context".to_string());
            command.push(context.clone());
        }
        command
    }
}

struct Session {
    child: Child,
    drains: Vec<JoinHandle<()>>,
}

/// Supervises one `kubectl port-forward` child process
pub struct PortForwardManager {
    config: PortForwardConfig,
    command: Vec<String>,
    check_health: HealthCheck,
    session: Option<Session>,
}

impl PortForwardManager {
    pub fn new(config: PortForwardConfig, check_health: HealthCheck) -> Self {
        let command = config.command();
        Self {
            config,
            command,
            check_health,
            session: None,
        }
    }

    /// Replace the spawned program and its arguments
    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }

    pub fn config(&self) -> &PortForwardConfig {
        &self.config
    }

    fn spawn(&self) -> Option<Session> {
        let (program, args) = self.command.split_first()?;
        let spawned = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                error!(program = %program, "Port-forward program not found");
                return None;
            }
            Err(e) => {
                error!(program = %program, error = %e, "Failed to spawn port-forward");
                return None;
            }
        };

        let mut drains = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            drains.push(tokio::spawn(drain(stdout, "stdout")));
        }
        if let Some(stderr) = child.stderr.take() {
            drains.push(tokio::spawn(drain(stderr, "stderr")));
        }

        debug!(pid = ?child.id(), command = ?self.command, "Spawned port-forward");
        Some(Session { child, drains })
    }

    async fn terminate(&self, mut session: Session) {
        if let Some(pid) = session.child.id() {
            let pid = nix::unistd::Pid::from_raw(pid as i32);
            if let Err(e) = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM) {
                debug!(error = %e, "SIGTERM to port-forward failed");
            }
        }

        match tokio::time::timeout(self.config.stop_timeout, session.child.wait()).await {
            Ok(Ok(status)) => debug!(?status, "Port-forward exited"),
            Ok(Err(e)) => warn!(error = %e, "Failed waiting for port-forward"),
            Err(_) => {
                warn!("Port-forward ignored SIGTERM, killing");
                if let Err(e) = session.child.kill().await {
                    error!(error = %e, "Failed to kill port-forward");
                }
            }
        }

        for drain in session.drains {
            drain.abort();
        }
    }
}

async fn drain<R>(reader: R, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if stream == "stderr" => error!(stream, "{}", line),
            Ok(Some(line)) => info!(stream, "{}", line),
            Ok(None) => break,
            Err(e) => {
                warn!(stream, error = %e, "Stopped reading port-forward output");
                break;
            }
        }
    }
}

#[async_trait]
impl PortForward for PortForwardManager {
    async fn start(&mut self) -> bool {
        if self.session.is_some() {
            return true;
        }

        let max_retries = self.config.max_retries.max(1);
        for attempt in 1..=max_retries {
            info!(
                attempt,
                max_retries,
                service = %self.config.service_name,
                namespace = %self.config.namespace,
                local_port = self.config.local_port,
                "Starting port-forward"
            );

            let Some(mut session) = self.spawn() else {
                tokio::time::sleep(self.config.retry_delay).await;
                continue;
            };

            tokio::time::sleep(self.config.settle_delay).await;

            match session.child.try_wait() {
                Ok(Some(status)) => {
                    futures::future::join_all(session.drains).await;
                    error!(?status, attempt, "Port-forward exited early");
                    tokio::time::sleep(self.config.retry_delay).await;
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, attempt, "Could not poll port-forward");
                    self.terminate(session).await;
                    tokio::time::sleep(self.config.retry_delay).await;
                    continue;
                }
            }

            let healthy = tokio::time::timeout(self.config.health_timeout, (self.check_health)())
                .await
                .unwrap_or(false);

            if healthy {
                info!(attempt, local_port = self.config.local_port, "Port-forward established");
                self.session = Some(session);
                return true;
            }

            warn!(attempt, "Hub not reachable through port-forward, restarting it");
            self.terminate(session).await;
            tokio::time::sleep(self.config.retry_delay).await;
        }

        error!(max_retries, "Failed to establish port-forward");
        false
    }

    async fn stop(&mut self) {
        if let Some(session) = self.session.take() {
            info!(service = %self.config.service_name, "Stopping port-forward");
            self.terminate(session).await;
        }
    }

    fn is_active(&self) -> bool {
        self.session.is_some()
    }
}
