use uuid::Uuid;

/// Engine error taxonomy.
///
/// Everything except `LedgerInconsistent` is recoverable: the control loop logs it and
/// moves on to the next tick.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Missing candles or insufficient history; skip this tick's decision
    #[error("data unavailable: {0}")]
    DataUnavailable(String),

    #[error("brokerage call failed: {0}")]
    Brokerage(String),

    #[error("candle store error: {0}")]
    Store(String),

    #[error("trade ledger error: {0}")]
    Ledger(String),

    /// The broker and the ledger disagree about a position. Requires an operator.
    #[error("trade {trade_id} is out of sync between brokerage and ledger: {reason}")]
    LedgerInconsistent { trade_id: Uuid, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl EngineError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::LedgerInconsistent { .. })
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        EngineError::Brokerage(e.to_string())
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(e: config::ConfigError) -> Self {
        EngineError::Config(e.to_string())
    }
}
