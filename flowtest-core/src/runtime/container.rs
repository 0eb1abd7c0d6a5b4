//! Container runtime seam.
//!
//! The engine container substrate is an external collaborator, so it sits
//! behind a trait like every other backend in this workspace. `DockerCli`
//! is the production implementation, driving the local `docker` binary
//! through `tokio::process`; tests plug in an in-memory fake.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Log streaming has backpressure-unaware pipe semantics, so every capture
/// is bounded by this timeout; a wedged pipe must never block error
/// propagation.
const LOG_CAPTURE_TIMEOUT: Duration = Duration::from_secs(8);

#[derive(Clone, Debug, Default)]
pub struct ContainerRequest {
    /// Full image reference (`name:tag`).
    pub image: String,
    pub env: BTreeMap<String, String>,
    /// Container-internal ports published on random host ports.
    pub exposed_ports: Vec<u16>,
}

#[derive(Clone, Debug)]
pub struct ContainerHandle {
    pub id: String,
    pub host: String,
    /// Container port → mapped host port.
    pub ports: BTreeMap<u16, u16>,
}

impl ContainerHandle {
    pub fn mapped_port(&self, container_port: u16) -> Option<u16> {
        self.ports.get(&container_port).copied()
    }
}

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("`{command}` failed: {message}")]
    Command { command: String, message: String },

    #[error("container runtime io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("log capture timed out after {0:?}")]
    LogTimeout(Duration),

    #[error("could not determine host port for container port {0}")]
    UnmappedPort(u16),
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn start(&self, req: ContainerRequest) -> Result<ContainerHandle, ContainerError>;

    async fn stop(&self, id: &str) -> Result<(), ContainerError>;

    /// Full log stream of the container, bounded by the runtime's own
    /// capture timeout.
    async fn logs(&self, id: &str) -> Result<String, ContainerError>;
}

/// Drives the local `docker` binary.
#[derive(Default)]
pub struct DockerCli;

impl DockerCli {
    pub fn new() -> Self {
        Self
    }

    async fn run(&self, args: &[&str]) -> Result<String, ContainerError> {
        let output = Command::new("docker")
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            return Err(ContainerError::Command {
                command: format!("docker {}", args.join(" ")),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn start(&self, req: ContainerRequest) -> Result<ContainerHandle, ContainerError> {
        let mut args: Vec<String> = vec!["run".into(), "-d".into()];
        for (key, value) in &req.env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        for port in &req.exposed_ports {
            args.push("-p".into());
            args.push(format!("127.0.0.1:0:{port}"));
        }
        args.push(req.image.clone());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let id = self.run(&arg_refs).await?;
        info!(image = %req.image, container = %id, "container started");

        let mut ports = BTreeMap::new();
        for port in &req.exposed_ports {
            let spec = format!("{port}/tcp");
            let mapping = self.run(&["port", &id, &spec]).await?;
            // Output shape: `0.0.0.0:49153` (possibly one line per address).
            let host_port = mapping
                .lines()
                .filter_map(|line| line.rsplit(':').next())
                .find_map(|p| p.trim().parse::<u16>().ok())
                .ok_or(ContainerError::UnmappedPort(*port))?;
            ports.insert(*port, host_port);
        }

        Ok(ContainerHandle {
            id,
            host: "127.0.0.1".into(),
            ports,
        })
    }

    async fn stop(&self, id: &str) -> Result<(), ContainerError> {
        self.run(&["stop", id]).await?;
        // Container is kept around for post-mortem logs; remove it now.
        let _ = self.run(&["rm", "-f", id]).await;
        debug!(container = %id, "container stopped");
        Ok(())
    }

    async fn logs(&self, id: &str) -> Result<String, ContainerError> {
        // The engine logs to both streams; capture both, stdout first.
        let capture = async {
            let output = Command::new("docker")
                .args(["logs", id])
                .stdin(Stdio::null())
                .output()
                .await?;
            if !output.status.success() {
                return Err(ContainerError::Command {
                    command: format!("docker logs {id}"),
                    message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                });
            }
            let mut logs = String::from_utf8_lossy(&output.stdout).into_owned();
            logs.push_str(&String::from_utf8_lossy(&output.stderr));
            Ok(logs)
        };
        match tokio::time::timeout(LOG_CAPTURE_TIMEOUT, capture).await {
            Ok(result) => result,
            Err(_) => Err(ContainerError::LogTimeout(LOG_CAPTURE_TIMEOUT)),
        }
    }
}
