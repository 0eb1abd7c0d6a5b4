use thiserror::Error;

/// Errors produced at the engine API boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A point lookup returned a 404-equivalent. Polling predicates treat
    /// this as "not yet visible"; everything else treats it as a real miss.
    #[error("{entity} {key} not found")]
    NotFound { entity: &'static str, key: String },

    /// The engine rejected the request (non-2xx other than 404).
    #[error("engine returned {status}: {message}")]
    Engine { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("failed to decode {endpoint} response: {source}")]
    Decode {
        endpoint: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl EngineError {
    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        EngineError::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    /// True for 404-class conditions that a polling predicate should retry.
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound { .. })
    }
}
