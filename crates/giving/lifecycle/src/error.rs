use giving_types::{
    Address, AdminId, Amount, InvariantViolation, ParseError, PledgeId, ValidationError,
};
use thiserror::Error;

/// A confirmed ledger call could not be projected; the ledger reverts it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProjectionError {
    #[error("no open donation holds pledge {0}")]
    UnknownPledge(PledgeId),

    #[error("admin not registered: {0}")]
    UnknownAdmin(AdminId),

    #[error("unknown token: {0}")]
    UnknownToken(Address),

    #[error("admin {0} is already canceled")]
    AlreadyCanceled(AdminId),

    #[error("pledge {pledge} holds {available}, cannot move {requested}")]
    InsufficientFunds {
        pledge: PledgeId,
        requested: Amount,
        available: Amount,
    },

    #[error("illegal move of pledge {pledge} to {receiver}: {reason}")]
    IllegalMove {
        pledge: PledgeId,
        receiver: AdminId,
        reason: String,
    },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Invariant(#[from] InvariantViolation),

    #[error("malformed withdrawal entry: {0}")]
    Packed(#[from] ParseError),
}
