use uuid::Uuid;

/// Domain error taxonomy (spec §7). Transient I/O is represented by
/// [`EngineError::Db`] and retried by the caller's loop; everything else
/// here is either malformed input (never retried, never fatal) or an
/// invariant violation that must roll back the surrounding transaction.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("stock not found: {0}")]
    StockNotFound(Uuid),

    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    #[error("ledger row not found: {0}")]
    LedgerRowNotFound(Uuid),

    #[error("cannot void row {target}: refunding {amount}g would require remaining_grams >= {amount}, but only {available}g remain")]
    InsufficientToVoid {
        target: Uuid,
        amount: i64,
        available: i64,
    },

    #[error("pricing conflict: rolls_count={rolls_count:?} price_per_roll={price_per_roll:?} price_total={price_total:?} expected_total={expected_total}")]
    PricingConflict {
        rolls_count: Option<i32>,
        price_per_roll: Option<f64>,
        price_total: Option<f64>,
        expected_total: f64,
    },

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("crypto error: {0}")]
    Crypto(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
