//! flowtest-core — process-engine test harness.
//!
//! Brings an engine instance up (or attaches to one), deploys process and
//! decision artifacts, drives execution through mocked job workers, and
//! verifies outcomes through polling assertions. The engine itself, the
//! container substrate and the host test-runner stay behind seams:
//! [`flowtest_client::EngineClient`], [`runtime::container::ContainerRuntime`]
//! and the four [`lifecycle::TestHarness`] hooks.

pub mod assert;
pub mod clock;
pub mod config;
pub mod context;
pub mod lifecycle;
pub mod poll;
pub mod runtime;
pub mod worker;

pub use assert::{
    AssertionError, AssertionSettings, DecisionAssert, DecisionSelector, ProcessInstanceAssert,
    ProcessInstanceSelector, UserTaskAssert, UserTaskSelector,
};
pub use clock::EngineClock;
pub use config::{AuthMethod, ConfigError, ConfigResolver, RuntimeConfiguration, RuntimeMode};
pub use context::{CleanupReport, TestContext};
pub use lifecycle::{HarnessError, TestHarness};
pub use poll::{wait_until, PollSettings, WaitTimeout};
pub use runtime::{EngineHandle, EngineRuntime, RuntimeError};
pub use worker::MockJobWorker;
