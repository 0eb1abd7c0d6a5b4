//! Engine runtime manager.
//!
//! Owns the engine instance for a test run: starts a container in managed
//! mode (and waits for it to be genuinely ready), or binds to connection
//! coordinates in remote mode. Exactly one [`EngineHandle`] exists per run
//! and nothing mutates it after creation.

pub mod container;

use flowtest_client::types::{PartitionHealth, PartitionRole, Topology};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{RuntimeConfiguration, RuntimeMode};
use crate::poll::{wait_until, PollSettings};
use container::{ContainerError, ContainerHandle, ContainerRequest, ContainerRuntime, DockerCli};

/// Base polling interval for the readiness gates.
const READINESS_INTERVAL: Duration = Duration::from_millis(500);

/// Connection coordinates of the running engine. Shared read-only by every
/// verification and the worker mocks for the duration of the run.
#[derive(Clone, Debug)]
pub struct EngineHandle {
    pub gateway_address: String,
    pub management_address: String,
    /// Absent in remote mode.
    pub container_id: Option<String>,
    pub secondary_container_id: Option<String>,
    pub mode: RuntimeMode,
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("engine runtime is not started")]
    NotStarted,

    #[error(
        "engine startup gate \"{gate}\" not passed within {waited:?}{}",
        .log_path
            .as_ref()
            .map(|p| format!("; container logs saved to {}", p.display()))
            .unwrap_or_default()
    )]
    StartupTimeout {
        gate: String,
        waited: Duration,
        log_path: Option<PathBuf>,
    },

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error(transparent)]
    Engine(#[from] flowtest_client::EngineError),

    /// Operation requires managed mode. Distinct from transport failures:
    /// the remediation is switching modes, not retrying.
    #[error("{operation} requires managed mode, but the runtime is in {mode} mode")]
    ModeMismatch {
        operation: &'static str,
        mode: RuntimeMode,
    },

    #[error("failed to persist container logs: {0}")]
    LogPersist(#[from] std::io::Error),
}

/// Readiness probe seam so runtime tests run without a live engine.
#[async_trait::async_trait]
pub trait ReadinessProbe: Send + Sync {
    /// True when the management health endpoint answers 2xx.
    async fn health(&self, management_address: &str) -> Result<bool, flowtest_client::EngineError>;

    async fn topology(&self, gateway_address: &str)
        -> Result<Topology, flowtest_client::EngineError>;
}

/// HTTP probe used outside of tests.
pub struct HttpProbe {
    http: reqwest::Client,
}

impl HttpProbe {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ReadinessProbe for HttpProbe {
    async fn health(&self, management_address: &str) -> Result<bool, flowtest_client::EngineError> {
        let url = format!("{}actuator/health", ensure_trailing_slash(management_address));
        let response = self.http.get(url).send().await?;
        Ok(response.status().is_success())
    }

    async fn topology(
        &self,
        gateway_address: &str,
    ) -> Result<Topology, flowtest_client::EngineError> {
        let url = format!("{}v2/topology", ensure_trailing_slash(gateway_address));
        let response = self.http.get(url).send().await?;
        let topology = response.json::<Topology>().await?;
        Ok(topology)
    }
}

fn ensure_trailing_slash(address: &str) -> String {
    if address.ends_with('/') {
        address.to_string()
    } else {
        format!("{address}/")
    }
}

struct Started {
    handle: EngineHandle,
}

pub struct EngineRuntime {
    config: RuntimeConfiguration,
    containers: Arc<dyn ContainerRuntime>,
    probe: Arc<dyn ReadinessProbe>,
    secondary_image: Option<String>,
    scratch_dir: PathBuf,
    started: Option<Started>,
}

impl EngineRuntime {
    pub fn new(config: RuntimeConfiguration) -> Self {
        Self::with_backends(config, Arc::new(DockerCli::new()), Arc::new(HttpProbe::new()))
    }

    /// Inject container/probe backends (tests use in-memory fakes).
    pub fn with_backends(
        config: RuntimeConfiguration,
        containers: Arc<dyn ContainerRuntime>,
        probe: Arc<dyn ReadinessProbe>,
    ) -> Self {
        let scratch_dir =
            std::env::temp_dir().join(format!("flowtest-{}", uuid::Uuid::now_v7().simple()));
        Self {
            config,
            containers,
            probe,
            secondary_image: None,
            scratch_dir,
            started: None,
        }
    }

    /// Also start a secondary service container (e.g. a connector runtime)
    /// alongside the engine. Stopped before the engine on teardown.
    pub fn with_secondary_image(mut self, image: impl Into<String>) -> Self {
        self.secondary_image = Some(image.into());
        self
    }

    pub fn mode(&self) -> RuntimeMode {
        self.config.mode
    }

    pub fn config(&self) -> &RuntimeConfiguration {
        &self.config
    }

    pub fn handle(&self) -> Result<&EngineHandle, RuntimeError> {
        self.started
            .as_ref()
            .map(|s| &s.handle)
            .ok_or(RuntimeError::NotStarted)
    }

    pub fn gateway_address(&self) -> Result<&str, RuntimeError> {
        self.handle().map(|h| h.gateway_address.as_str())
    }

    pub fn management_address(&self) -> Result<&str, RuntimeError> {
        self.handle().map(|h| h.management_address.as_str())
    }

    /// Start the engine (or bind to it) and return its handle. A second
    /// call on a started runtime returns the existing handle.
    pub async fn start(&mut self) -> Result<&EngineHandle, RuntimeError> {
        if self.started.is_some() {
            return Ok(&self.started.as_ref().unwrap().handle);
        }
        let handle = match self.config.mode {
            RuntimeMode::Remote => self.bind_remote()?,
            RuntimeMode::Managed => self.start_managed().await?,
        };
        info!(
            mode = %handle.mode,
            gateway = %handle.gateway_address,
            "engine runtime ready"
        );
        self.started = Some(Started { handle });
        Ok(&self.started.as_ref().unwrap().handle)
    }

    fn bind_remote(&self) -> Result<EngineHandle, RuntimeError> {
        // Presence was validated at configuration resolution; this guards
        // hand-built configurations.
        let gateway = self
            .config
            .remote_gateway_address
            .clone()
            .ok_or(RuntimeError::NotStarted)?;
        let management = self
            .config
            .remote_management_address
            .clone()
            .unwrap_or_else(|| gateway.clone());
        Ok(EngineHandle {
            gateway_address: ensure_trailing_slash(&gateway),
            management_address: ensure_trailing_slash(&management),
            container_id: None,
            secondary_container_id: None,
            mode: RuntimeMode::Remote,
        })
    }

    async fn start_managed(&mut self) -> Result<EngineHandle, RuntimeError> {
        let image = format!(
            "{}:{}",
            self.config.engine_image, self.config.engine_version
        );
        let request = ContainerRequest {
            image,
            env: [
                // Deterministic in-memory storage: no external database in
                // test runs, and the engine's clock endpoint is enabled.
                ("ENGINE_STORAGE_MODE".to_string(), "in-memory".to_string()),
                ("ENGINE_CLOCK_CONTROLLABLE".to_string(), "true".to_string()),
            ]
            .into(),
            exposed_ports: vec![self.config.gateway_port, self.config.management_port],
        };
        let primary = self.containers.start(request).await?;
        let gateway_address = address_for(&primary, self.config.gateway_port)?;
        let management_address = address_for(&primary, self.config.management_port)?;

        if let Err(error) = self
            .await_ready(&gateway_address, &management_address)
            .await
        {
            let log_path = self.persist_logs(&primary.id, "engine-startup").await;
            if let Err(stop_error) = self.containers.stop(&primary.id).await {
                warn!(%stop_error, "failed to stop engine container after startup failure");
            }
            return Err(match error {
                RuntimeError::StartupTimeout { gate, waited, .. } => {
                    RuntimeError::StartupTimeout {
                        gate,
                        waited,
                        log_path,
                    }
                }
                other => other,
            });
        }

        let secondary_container_id = match &self.secondary_image {
            None => None,
            Some(image) => {
                let handle = self
                    .containers
                    .start(ContainerRequest {
                        image: image.clone(),
                        env: [(
                            "ENGINE_GATEWAY_ADDRESS".to_string(),
                            gateway_address.clone(),
                        )]
                        .into(),
                        exposed_ports: Vec::new(),
                    })
                    .await?;
                Some(handle.id)
            }
        };

        Ok(EngineHandle {
            gateway_address,
            management_address,
            container_id: Some(primary.id),
            secondary_container_id,
            mode: RuntimeMode::Managed,
        })
    }

    /// Two readiness gates, each bounded on its own, the pair bounded by
    /// the total wait-strategy timeout.
    async fn await_ready(
        &self,
        gateway_address: &str,
        management_address: &str,
    ) -> Result<(), RuntimeError> {
        let gate_settings = PollSettings::new(self.config.startup_timeout, READINESS_INTERVAL);
        let probe = self.probe.clone();

        let both_gates = async {
            let health_probe = probe.clone();
            wait_until(gate_settings, "engine health endpoint answers 2xx", || {
                let probe = health_probe.clone();
                async move { probe.health(management_address).await }
            })
            .await
            .map_err(|t| RuntimeError::StartupTimeout {
                gate: "health".into(),
                waited: t.timeout,
                log_path: None,
            })?;

            wait_until(
                gate_settings,
                "topology reports exactly one healthy leader partition",
                || {
                    let probe = probe.clone();
                    async move {
                        let topology = probe.topology(gateway_address).await?;
                        Ok::<_, flowtest_client::EngineError>(topology_ready(&topology))
                    }
                },
            )
            .await
            .map_err(|t| RuntimeError::StartupTimeout {
                gate: "topology".into(),
                waited: t.timeout,
                log_path: None,
            })?;

            Ok::<(), RuntimeError>(())
        };

        match tokio::time::timeout(self.config.total_startup_timeout, both_gates).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::StartupTimeout {
                gate: "overall".into(),
                waited: self.config.total_startup_timeout,
                log_path: None,
            }),
        }
    }

    /// Capture container logs into the scratch directory. Managed mode
    /// only; capture itself is bounded by the container runtime.
    pub async fn dump_logs(&self, label: &str) -> Result<PathBuf, RuntimeError> {
        let handle = self.handle()?;
        let Some(container_id) = handle.container_id.clone() else {
            return Err(RuntimeError::ModeMismatch {
                operation: "container log capture",
                mode: handle.mode,
            });
        };
        let logs = self.containers.logs(&container_id).await?;
        self.write_log_file(label, &logs)
    }

    /// Startup-failure path: best-effort capture that must never mask the
    /// startup error itself.
    async fn persist_logs(&self, container_id: &str, label: &str) -> Option<PathBuf> {
        match self.containers.logs(container_id).await {
            Ok(logs) => match self.write_log_file(label, &logs) {
                Ok(path) => Some(path),
                Err(error) => {
                    warn!(%error, "could not persist engine container logs");
                    None
                }
            },
            Err(error) => {
                warn!(%error, "could not capture engine container logs");
                None
            }
        }
    }

    fn write_log_file(&self, label: &str, logs: &str) -> Result<PathBuf, RuntimeError> {
        std::fs::create_dir_all(&self.scratch_dir)?;
        let path = self.scratch_dir.join(format!("{label}.log"));
        std::fs::write(&path, logs)?;
        info!(path = %path.display(), "container logs persisted");
        Ok(path)
    }

    /// Idempotent. Any secondary container stops before the engine.
    pub async fn stop(&mut self) -> Result<(), RuntimeError> {
        let Some(started) = self.started.take() else {
            return Ok(());
        };
        if let Some(secondary) = &started.handle.secondary_container_id {
            self.containers.stop(secondary).await?;
        }
        if let Some(primary) = &started.handle.container_id {
            self.containers.stop(primary).await?;
        }
        info!("engine runtime stopped");
        Ok(())
    }
}

fn address_for(handle: &ContainerHandle, port: u16) -> Result<String, RuntimeError> {
    let mapped = handle
        .mapped_port(port)
        .ok_or(ContainerError::UnmappedPort(port))?;
    Ok(format!("http://{}:{}/", handle.host, mapped))
}

/// Ready means exactly one partition in the whole cluster, led and healthy.
fn topology_ready(topology: &Topology) -> bool {
    let partitions: Vec<_> = topology.all_partitions().collect();
    partitions.len() == 1
        && partitions[0].role == PartitionRole::Leader
        && partitions[0].health == PartitionHealth::Healthy
}

#[cfg(test)]
mod tests {
    use super::container::*;
    use super::*;
    use crate::config::AuthMethod;
    use flowtest_client::types::{BrokerInfo, PartitionInfo};
    use flowtest_client::EngineError;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn config(mode: RuntimeMode) -> RuntimeConfiguration {
        RuntimeConfiguration {
            mode,
            engine_image: "process-engine".into(),
            engine_version: "8.7".into(),
            gateway_port: 8080,
            management_port: 9600,
            remote_gateway_address: (mode == RuntimeMode::Remote)
                .then(|| "http://engine.test:8080".into()),
            remote_management_address: None,
            auth: AuthMethod::None,
            flush_on_start: false,
            startup_timeout: Duration::from_secs(60),
            total_startup_timeout: Duration::from_secs(120),
            assertion_timeout: Duration::from_secs(10),
            assertion_interval: Duration::from_millis(100),
        }
    }

    /// In-memory container substrate recording lifecycle calls.
    #[derive(Default)]
    struct FakeContainers {
        counter: AtomicU32,
        started: Mutex<Vec<String>>,
        stopped: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl ContainerRuntime for FakeContainers {
        async fn start(&self, req: ContainerRequest) -> Result<ContainerHandle, ContainerError> {
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            let id = format!("container-{n}");
            self.started.lock().unwrap().push(id.clone());
            let ports: BTreeMap<u16, u16> = req
                .exposed_ports
                .iter()
                .map(|p| (*p, 40000 + *p))
                .collect();
            Ok(ContainerHandle {
                id,
                host: "127.0.0.1".into(),
                ports,
            })
        }

        async fn stop(&self, id: &str) -> Result<(), ContainerError> {
            self.stopped.lock().unwrap().push(id.to_string());
            Ok(())
        }

        async fn logs(&self, _id: &str) -> Result<String, ContainerError> {
            Ok("engine log line\n".into())
        }
    }

    /// Probe that becomes healthy after a configurable number of polls.
    struct FakeProbe {
        healthy_after: AtomicU32,
        ready_topology: bool,
    }

    impl FakeProbe {
        fn ready_after(polls: u32) -> Self {
            Self {
                healthy_after: AtomicU32::new(polls),
                ready_topology: true,
            }
        }

        fn never_ready() -> Self {
            Self {
                healthy_after: AtomicU32::new(u32::MAX),
                ready_topology: false,
            }
        }
    }

    #[async_trait::async_trait]
    impl ReadinessProbe for FakeProbe {
        async fn health(&self, _management_address: &str) -> Result<bool, EngineError> {
            let remaining = self.healthy_after.load(Ordering::SeqCst);
            if remaining == 0 {
                return Ok(true);
            }
            if remaining != u32::MAX {
                self.healthy_after.store(remaining - 1, Ordering::SeqCst);
            }
            // An engine still booting refuses connections outright.
            Err(EngineError::InvalidRequest("connection refused".into()))
        }

        async fn topology(&self, _gateway_address: &str) -> Result<Topology, EngineError> {
            if !self.ready_topology {
                return Ok(Topology {
                    brokers: Vec::new(),
                    partitions_count: 0,
                });
            }
            Ok(Topology {
                brokers: vec![BrokerInfo {
                    node_id: 0,
                    host: "127.0.0.1".into(),
                    port: 26501,
                    partitions: vec![PartitionInfo {
                        partition_id: 1,
                        role: PartitionRole::Leader,
                        health: PartitionHealth::Healthy,
                    }],
                }],
                partitions_count: 1,
            })
        }
    }

    fn runtime_with(
        mode: RuntimeMode,
        containers: Arc<FakeContainers>,
        probe: FakeProbe,
    ) -> EngineRuntime {
        EngineRuntime::with_backends(config(mode), containers, Arc::new(probe))
    }

    #[tokio::test(start_paused = true)]
    async fn managed_start_waits_for_both_gates() {
        let containers = Arc::new(FakeContainers::default());
        let mut runtime = runtime_with(
            RuntimeMode::Managed,
            containers.clone(),
            FakeProbe::ready_after(3),
        );

        let handle = runtime.start().await.unwrap().clone();
        assert_eq!(handle.mode, RuntimeMode::Managed);
        assert_eq!(handle.gateway_address, "http://127.0.0.1:48080/");
        assert_eq!(handle.management_address, "http://127.0.0.1:49600/");
        assert_eq!(handle.container_id.as_deref(), Some("container-0"));
        assert!(containers.stopped.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn startup_failure_captures_logs_and_stops_the_container() {
        let containers = Arc::new(FakeContainers::default());
        let mut runtime = runtime_with(
            RuntimeMode::Managed,
            containers.clone(),
            FakeProbe::never_ready(),
        );

        let err = runtime.start().await.unwrap_err();
        match err {
            RuntimeError::StartupTimeout { gate, log_path, .. } => {
                assert_eq!(gate, "health");
                let log_path = log_path.expect("logs should have been captured");
                let logs = std::fs::read_to_string(&log_path).unwrap();
                assert!(logs.contains("engine log line"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(
            containers.stopped.lock().unwrap().as_slice(),
            ["container-0"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_order_is_secondary_before_primary() {
        let containers = Arc::new(FakeContainers::default());
        let mut runtime = runtime_with(
            RuntimeMode::Managed,
            containers.clone(),
            FakeProbe::ready_after(0),
        )
        .with_secondary_image("connector-runtime:latest");

        runtime.start().await.unwrap();
        runtime.stop().await.unwrap();

        assert_eq!(
            containers.stopped.lock().unwrap().as_slice(),
            ["container-1", "container-0"],
            "secondary container must stop before the engine"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent() {
        let containers = Arc::new(FakeContainers::default());
        let mut runtime = runtime_with(
            RuntimeMode::Managed,
            containers.clone(),
            FakeProbe::ready_after(0),
        );

        runtime.start().await.unwrap();
        runtime.stop().await.unwrap();
        runtime.stop().await.unwrap();

        assert_eq!(containers.stopped.lock().unwrap().len(), 1);
        assert!(matches!(
            runtime.gateway_address(),
            Err(RuntimeError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn remote_mode_binds_without_containers() {
        let containers = Arc::new(FakeContainers::default());
        let mut runtime = runtime_with(
            RuntimeMode::Remote,
            containers.clone(),
            FakeProbe::never_ready(),
        );

        let handle = runtime.start().await.unwrap().clone();
        assert_eq!(handle.mode, RuntimeMode::Remote);
        assert_eq!(handle.gateway_address, "http://engine.test:8080/");
        assert!(handle.container_id.is_none());
        assert!(containers.started.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn log_capture_is_a_mode_mismatch_in_remote_mode() {
        let containers = Arc::new(FakeContainers::default());
        let mut runtime = runtime_with(
            RuntimeMode::Remote,
            containers,
            FakeProbe::never_ready(),
        );
        runtime.start().await.unwrap();

        let err = runtime.dump_logs("whatever").await.unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::ModeMismatch {
                operation: "container log capture",
                ..
            }
        ));
    }
}
