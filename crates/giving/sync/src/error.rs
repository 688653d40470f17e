use giving_types::{DonationId, InvariantViolation, TxHash, ValidationError};
use giving_wallet::SignatureError;
use thiserror::Error;

/// The ledger refused a transaction before producing a hash.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmissionError {
    #[error("ledger rejected transaction: {0}")]
    Rejected(String),

    #[error("ledger unreachable: {0}")]
    Unavailable(String),

    #[error("ledger dropped transaction {0} before it was mined")]
    Dropped(TxHash),
}

/// Off-chain index query or patch failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IndexError {
    #[error("index unavailable: {0}")]
    Unavailable(String),

    #[error("donation not in index: {0}")]
    NotFound(DonationId),

    #[error("index rejected patch: {0}")]
    Rejected(String),
}

/// Engine-level error. `Validation`, `Submission`, `Reverted` and `CacheSync`
/// are the four outcomes callers act on; the rest are programming or
/// signing faults.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("transaction submission failed: {0}")]
    Submission(#[from] SubmissionError),

    #[error("transaction {tx_hash} reverted: {reason}")]
    Reverted { tx_hash: TxHash, reason: String },

    #[error("index sync failed: {0}")]
    CacheSync(#[from] IndexError),

    #[error("signing failed: {0}")]
    Signing(#[from] SignatureError),

    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
}

impl SyncError {
    /// Whether the ledger never saw the transaction.
    pub fn is_before_hash(&self) -> bool {
        matches!(
            self,
            SyncError::Validation(_) | SyncError::Submission(_) | SyncError::Signing(_) | SyncError::Invariant(_)
        )
    }
}
