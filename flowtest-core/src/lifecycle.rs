//! Lifecycle glue — binds the harness to a host test-runner's hooks.
//!
//! The host runner calls `before_all`/`before_each`/`after_each`/`after_all`
//! from its own setup/teardown machinery and hands tests the `client()` and
//! `context()` accessors. There is no registration magic: a suite constructs
//! one [`TestHarness`] and wires the four hooks explicitly.

use flowtest_client::http::{Auth, HttpEngineClient};
use flowtest_client::types::{ProcessInstanceFilter, ProcessInstanceState, SearchRequest};
use flowtest_client::{EngineClient, EngineError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::assert::AssertionSettings;
use crate::config::{AuthMethod, ConfigError, RuntimeConfiguration, RuntimeMode};
use crate::context::{CleanupReport, TestContext};
use crate::runtime::{EngineRuntime, RuntimeError};

/// Upper bound on flush-on-start sweep rounds; instances that survive ten
/// cancellation rounds are not going away by sweeping harder.
const FLUSH_ROUNDS: usize = 10;
const FLUSH_PAGE: u32 = 100;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("harness not initialized; call before_all first")]
    NotInitialized,

    #[error("invalid engine address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

pub struct TestHarness {
    config: RuntimeConfiguration,
    runtime: EngineRuntime,
    client_override: Option<Arc<dyn EngineClient>>,
    client: Option<Arc<dyn EngineClient>>,
    context: Option<Arc<TestContext>>,
}

impl TestHarness {
    pub fn new(config: RuntimeConfiguration) -> Self {
        let runtime = EngineRuntime::new(config.clone());
        Self::with_runtime(config, runtime)
    }

    /// Inject a pre-built runtime (tests wire fake container/probe
    /// backends through here).
    pub fn with_runtime(config: RuntimeConfiguration, runtime: EngineRuntime) -> Self {
        Self {
            config,
            runtime,
            client_override: None,
            client: None,
            context: None,
        }
    }

    /// Use this client instead of building an HTTP client from the
    /// runtime's handle.
    pub fn with_client(mut self, client: Arc<dyn EngineClient>) -> Self {
        self.client_override = Some(client);
        self
    }

    pub fn config(&self) -> &RuntimeConfiguration {
        &self.config
    }

    // ── Suite hooks ──

    /// Start (or bind) the engine runtime and build the shared client.
    /// With `flush-on-start` set, every instance still active in the
    /// engine is cancelled before the first test runs — the safety net for
    /// remote engines that outlive previous runs.
    pub async fn before_all(&mut self) -> Result<(), HarnessError> {
        self.runtime.start().await?;
        let client = match &self.client_override {
            Some(client) => client.clone(),
            None => Arc::new(self.build_http_client()?),
        };
        if self.config.flush_on_start {
            let cancelled = flush_active_instances(client.as_ref()).await?;
            info!(cancelled, "flushed active instances on startup");
        }
        self.client = Some(client);
        Ok(())
    }

    /// Fresh, empty-tracked context for the next test.
    pub async fn before_each(&mut self) -> Result<Arc<TestContext>, HarnessError> {
        let client = self.client()?;
        let settings = AssertionSettings {
            timeout: self.config.assertion_timeout,
            interval: self.config.assertion_interval,
        };
        let context = Arc::new(TestContext::new(client, self.config.mode, settings));
        self.context = Some(context.clone());
        Ok(context)
    }

    /// Tear down what the test created. On a failed test in managed mode,
    /// the engine container's logs are dumped first — often the only
    /// diagnostic signal left.
    pub async fn after_each(&mut self, test_failed: bool) -> Result<CleanupReport, HarnessError> {
        if test_failed && self.config.mode == RuntimeMode::Managed {
            match self.runtime.dump_logs("test-failure").await {
                Ok(path) => info!(path = %path.display(), "engine logs dumped for failed test"),
                Err(error) => warn!(%error, "could not dump engine logs for failed test"),
            }
        }
        let Some(context) = self.context.take() else {
            return Ok(CleanupReport::default());
        };
        Ok(context.cleanup().await)
    }

    /// Stop the runtime. Idempotent, like the runtime itself.
    pub async fn after_all(&mut self) -> Result<(), HarnessError> {
        self.client = None;
        self.context = None;
        self.runtime.stop().await?;
        Ok(())
    }

    // ── Accessors ──

    pub fn client(&self) -> Result<Arc<dyn EngineClient>, HarnessError> {
        self.client.clone().ok_or(HarnessError::NotInitialized)
    }

    pub fn context(&self) -> Result<Arc<TestContext>, HarnessError> {
        self.context.clone().ok_or(HarnessError::NotInitialized)
    }

    fn build_http_client(&self) -> Result<HttpEngineClient, HarnessError> {
        let parse = |address: &str| {
            url::Url::parse(address).map_err(|e| HarnessError::InvalidAddress {
                address: address.to_string(),
                reason: e.to_string(),
            })
        };
        let gateway = parse(self.runtime.gateway_address()?)?;
        let management = parse(self.runtime.management_address()?)?;
        let auth = match &self.config.auth {
            AuthMethod::None => Auth::None,
            AuthMethod::Basic { username, password } => Auth::Basic {
                username: username.clone(),
                password: password.clone(),
            },
            AuthMethod::Bearer { token } => Auth::Bearer {
                token: token.clone(),
            },
        };
        Ok(HttpEngineClient::new(gateway, management, auth)?)
    }
}

/// Cancel every active instance the engine still knows about. Errors on
/// individual cancellations are tolerated; the sweep is bounded.
async fn flush_active_instances(client: &dyn EngineClient) -> Result<usize, EngineError> {
    let mut cancelled = 0;
    for _ in 0..FLUSH_ROUNDS {
        let page = client
            .search_process_instances(
                SearchRequest::filtered(ProcessInstanceFilter {
                    state: Some(ProcessInstanceState::Active),
                    ..Default::default()
                })
                .limit(FLUSH_PAGE),
            )
            .await?;
        if page.items.is_empty() {
            break;
        }
        for instance in &page.items {
            match client.cancel_instance(instance.process_instance_key).await {
                Ok(()) => cancelled += 1,
                Err(error) => debug!(
                    instance = instance.process_instance_key,
                    %error,
                    "flush: instance not cancelled"
                ),
            }
        }
        if (page.items.len() as u32) < FLUSH_PAGE {
            break;
        }
    }
    Ok(cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowtest_client::inprocess::InProcessEngine;
    use flowtest_client::types::{CreateInstanceRequest, DeployResource, Variables};
    use std::time::Duration;

    fn remote_config(flush_on_start: bool) -> RuntimeConfiguration {
        RuntimeConfiguration {
            mode: RuntimeMode::Remote,
            engine_image: "process-engine".into(),
            engine_version: "latest".into(),
            gateway_port: 8080,
            management_port: 9600,
            remote_gateway_address: Some("http://engine.test:8080/".into()),
            remote_management_address: Some("http://engine.test:9600/".into()),
            auth: AuthMethod::None,
            flush_on_start,
            startup_timeout: Duration::from_secs(60),
            total_startup_timeout: Duration::from_secs(120),
            assertion_timeout: Duration::from_secs(10),
            assertion_interval: Duration::from_millis(100),
        }
    }

    async fn engine_with_active_instance() -> InProcessEngine {
        let engine = InProcessEngine::new();
        engine
            .deploy(vec![DeployResource {
                name: "left-over.bpmn".into(),
                content: "<definitions/>".into(),
            }])
            .await
            .unwrap();
        engine
            .create_instance(CreateInstanceRequest {
                process_definition_id: "left-over".into(),
                variables: Variables::new(),
            })
            .await
            .unwrap();
        engine
    }

    #[tokio::test]
    async fn flush_on_start_cancels_active_remote_instances() {
        let engine = engine_with_active_instance().await;
        let config = remote_config(true);
        let runtime = EngineRuntime::new(config.clone());
        let mut harness =
            TestHarness::with_runtime(config, runtime).with_client(Arc::new(engine.clone()));

        harness.before_all().await.unwrap();
        assert!(engine.active_instance_keys().is_empty());
    }

    #[tokio::test]
    async fn without_the_flag_nothing_is_flushed() {
        let engine = engine_with_active_instance().await;
        let config = remote_config(false);
        let runtime = EngineRuntime::new(config.clone());
        let mut harness =
            TestHarness::with_runtime(config, runtime).with_client(Arc::new(engine.clone()));

        harness.before_all().await.unwrap();
        assert_eq!(engine.active_instance_keys().len(), 1);
    }

    #[tokio::test]
    async fn accessors_fail_before_initialization() {
        let config = remote_config(false);
        let runtime = EngineRuntime::new(config.clone());
        let harness = TestHarness::with_runtime(config, runtime);
        assert!(matches!(
            harness.client(),
            Err(HarnessError::NotInitialized)
        ));
        assert!(matches!(
            harness.context(),
            Err(HarnessError::NotInitialized)
        ));
    }
}
