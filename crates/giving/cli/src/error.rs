//! CLI error types

use giving_sync::SyncError;
use giving_types::{InvariantViolation, ParseError, ValidationError};
use giving_wallet::AuthError;
use thiserror::Error;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("wallet error: {0}")]
    Wallet(#[from] AuthError),

    #[error("invalid input: {0}")]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Invariant(#[from] InvariantViolation),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("no password given; pass --password or set GIVING_PASSWORD")]
    MissingPassword,
}
