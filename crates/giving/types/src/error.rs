//! Error types shared by the giving crates.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::action::ActionKind;
use crate::admin::AdminKind;
use crate::donation::DonationStatus;
use crate::ids::{Address, AdminId, DonationId};
use crate::token::Amount;

/// A local precondition failed. Raised synchronously; the ledger is never
/// contacted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{actor} is not authorized to {action} {subject}")]
    Unauthorized {
        action: ActionKind,
        actor: Address,
        subject: String,
    },

    #[error("veto window for donation {donation} closed at {deadline}")]
    VetoWindowClosed {
        donation: DonationId,
        deadline: DateTime<Utc>,
    },

    #[error("cannot {action} donation {donation} while it is {status}")]
    InvalidState {
        action: ActionKind,
        donation: DonationId,
        status: DonationStatus,
    },

    #[error("no committed funds to withdraw for milestone {0}")]
    NoFunds(AdminId),

    #[error("admin not found: {0}")]
    AdminNotFound(AdminId),

    #[error("admin {0} is not active")]
    AdminInactive(AdminId),

    #[error("admin {0:?} has not been registered on the ledger")]
    AdminNotOnLedger(String),

    #[error("admin {admin} is a {actual}, expected a {expected}")]
    WrongAdminKind {
        admin: AdminId,
        expected: AdminKind,
        actual: AdminKind,
    },

    #[error("cannot delegate donation {donation} to {target}: {reason}")]
    InvalidTarget {
        donation: DonationId,
        target: AdminId,
        reason: String,
    },

    #[error("amount {requested} exceeds available {available}")]
    AmountExceedsAvailable { requested: Amount, available: Amount },

    #[error("amount must be greater than zero")]
    ZeroAmount,

    #[error("amounts held by milestone {0} overflow when summed")]
    AmountOverflow(AdminId),

    #[error("milestone {0} has reached its funding cap")]
    CapReached(AdminId),

    #[error("an action is already in flight for donation {0}")]
    ActionInFlight(DonationId),

    #[error("donation not found: {0}")]
    DonationNotFound(DonationId),
}

/// A record or registry broke one of the data-model invariants.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("donation {donation}: remaining {remaining} exceeds amount {amount}")]
    RemainingExceedsAmount {
        donation: DonationId,
        remaining: Amount,
        amount: Amount,
    },

    #[error("donation {donation}: remaining may not grow from {from} to {to}")]
    RemainingIncreased {
        donation: DonationId,
        from: Amount,
        to: Amount,
    },

    #[error("donation {0} is waiting without a delegate")]
    WaitingWithoutDelegate(DonationId),

    #[error("donation {0} is waiting with a proposed project")]
    WaitingWithPendingProject(DonationId),

    #[error("donation {donation} has a delegate and no proposal but is {status}")]
    DelegatedButNotWaiting {
        donation: DonationId,
        status: DonationStatus,
    },

    #[error("donation {0} awaits approval without a proposed project or commit time")]
    ToApproveWithoutProposal(DonationId),

    #[error("donation {donation} carries a proposed project but is {status}")]
    ProposalOutsideVetoWindow {
        donation: DonationId,
        status: DonationStatus,
    },

    #[error("optimistic patch for donation {0} may not move its pledge")]
    OptimisticPledgeMove(DonationId),

    #[error("admin id {existing} cannot be reassigned to {attempted}")]
    AdminIdReassigned { existing: AdminId, attempted: AdminId },

    #[error("admin {0:?} has no ledger id")]
    MissingAdminId(String),

    #[error("admin id {0} is already registered")]
    DuplicateAdmin(AdminId),
}

/// Malformed textual input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid hex: {0}")]
    InvalidHex(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("amount {input} has more than {decimals} decimals")]
    TooManyDecimals { input: String, decimals: u8 },

    #[error("unsupported token decimals: {0}")]
    UnsupportedDecimals(u8),

    #[error("packed pledge must be 32 bytes, got {0}")]
    PackedLength(usize),
}
