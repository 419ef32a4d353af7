use crate::money::Currency;

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("command '{command}' is not legal from status {from}")]
    InvalidTransition {
        from: &'static str,
        command: &'static str,
    },
    #[error("validation failed on '{field}': {message}")]
    ValidationFailed {
        field: &'static str,
        message: String,
    },
    #[error("currency mismatch: {left} vs {right}")]
    CurrencyMismatch { left: Currency, right: Currency },
    #[error("fine percentage {0} is outside the allowed range")]
    InvalidFinePercentage(u8),
    #[error("a fine of {fine} minor units would consume the whole refund of {total}")]
    FineExceedsTotal { fine: i64, total: i64 },
    #[error("request was already updated: expected {expected}, found {actual}")]
    StaleState { expected: String, actual: String },
    #[error("available balance {available} is below the payable amount {required}")]
    InsufficientBalance { available: i64, required: i64 },
    #[error("collaborator call failed: {0}")]
    CollaboratorUnavailable(String),
}
