//! Error taxonomy (spec §7). Generalizes the teacher's bare `OrderError`
//! (`exchange.rs`) into one `thiserror` enum per boundary, each carrying
//! enough context to act on and a `is_transient` classification so callers
//! don't have to string-match.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),
    #[error("quantity/notional below venue minimum: qty={qty} price={price} min_notional={min_notional}")]
    BelowVenueMinimum {
        qty: rust_decimal::Decimal,
        price: rust_decimal::Decimal,
        min_notional: rust_decimal::Decimal,
    },
    #[error("clock drift exceeds recvWindow: drift_ms={drift_ms} recv_window_ms={recv_window_ms}")]
    ClockDrift { drift_ms: i64, recv_window_ms: i64 },
    #[error("transient I/O error: {0}")]
    Transient(String),
    #[error("exchange rejected request: {0}")]
    Rejected(String),
}

impl ExchangeError {
    /// Idempotent reads retry on these; writes never do (spec §4.1).
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::Transient(_))
    }
}

#[derive(Debug, Error)]
pub enum RecognitionError {
    #[error("LLM call timed out or failed: {0}")]
    Transient(String),
    #[error("LLM reply did not match the extraction schema: {0}")]
    SchemaMismatch(String),
}

#[derive(Debug, Error)]
pub enum SizingError {
    #[error("signal is incoherent for its direction: {0}")]
    IncoherentSignal(String),
    #[error("sized quantity falls below minimum notional")]
    BelowNotional,
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("sizing failed: {0}")]
    Sizing(#[from] SizingError),
    #[error("exchange call failed: {0}")]
    Exchange(#[from] ExchangeError),
    #[error("compensation required after partial execution (position_id={position_id:?})")]
    CompensationRequired { position_id: Option<uuid::Uuid> },
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("exchange call failed while reconciling: {0}")]
    Exchange(#[from] ExchangeError),
    #[error("database error while reconciling: {0}")]
    Database(#[from] sqlx::Error),
}

/// Kind 6 of spec §7: credential invalidity, schema-mismatched LLM reply
/// after retry, database unreachable. Never retried internally.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),
    #[error("database unreachable: {0}")]
    DatabaseUnreachable(#[from] sqlx::Error),
    #[error("LLM reply schema mismatch persisted after retry: {0}")]
    PersistentSchemaMismatch(String),
}
