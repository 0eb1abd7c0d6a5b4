//! Clock controller — the engine's time-control protocol.
//!
//! Timer-heavy process tests advance the engine clock instead of sleeping.
//! Mutation is only possible when the harness owns the engine (managed
//! mode); in remote mode `advance`/`reset` fail with a mode-mismatch error
//! so the remediation ("switch modes") is obvious, rather than surfacing as
//! a generic network failure. Reading the clock works in either mode.

use chrono::{DateTime, TimeZone, Utc};
use flowtest_client::EngineClient;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::RuntimeMode;
use crate::runtime::RuntimeError;

#[derive(Clone)]
pub struct EngineClock {
    client: Arc<dyn EngineClient>,
    mode: RuntimeMode,
}

impl EngineClock {
    pub fn new(client: Arc<dyn EngineClient>, mode: RuntimeMode) -> Self {
        Self { client, mode }
    }

    pub async fn current_time(&self) -> Result<DateTime<Utc>, RuntimeError> {
        let millis = self.client.clock_current_millis().await?;
        Ok(Utc
            .timestamp_millis_opt(millis)
            .single()
            .unwrap_or_else(Utc::now))
    }

    /// Move the engine clock forward by `offset`.
    pub async fn advance(&self, offset: Duration) -> Result<(), RuntimeError> {
        self.require_managed("clock manipulation")?;
        self.client.clock_add(offset).await?;
        info!(offset_ms = offset.as_millis() as u64, "engine clock advanced");
        Ok(())
    }

    /// Drop any applied offset and return the engine to wall-clock time.
    pub async fn reset(&self) -> Result<(), RuntimeError> {
        self.require_managed("clock manipulation")?;
        self.client.clock_reset().await?;
        Ok(())
    }

    fn require_managed(&self, operation: &'static str) -> Result<(), RuntimeError> {
        if self.mode == RuntimeMode::Managed {
            return Ok(());
        }
        warn!(%operation, "rejected: engine is not managed by this harness");
        Err(RuntimeError::ModeMismatch {
            operation,
            mode: self.mode,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowtest_client::inprocess::InProcessEngine;

    #[tokio::test]
    async fn advance_moves_the_engine_clock() {
        let engine = InProcessEngine::new();
        let clock = EngineClock::new(Arc::new(engine), RuntimeMode::Managed);

        let before = clock.current_time().await.unwrap();
        clock.advance(Duration::from_secs(3600)).await.unwrap();
        let after = clock.current_time().await.unwrap();

        assert!(after - before >= chrono::Duration::seconds(3600));
        clock.reset().await.unwrap();
    }

    #[tokio::test]
    async fn mutation_is_rejected_in_remote_mode() {
        let engine = InProcessEngine::new();
        let clock = EngineClock::new(Arc::new(engine.clone()), RuntimeMode::Remote);

        let err = clock.advance(Duration::from_secs(60)).await.unwrap_err();
        assert!(matches!(err, RuntimeError::ModeMismatch { .. }));
        // No engine call was made.
        assert_eq!(engine.call_count(), 0);

        // Reads stay available against a remote engine.
        clock.current_time().await.unwrap();
    }
}
