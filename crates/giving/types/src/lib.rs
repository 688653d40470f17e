//! Data model for the delegated giving core.
//!
//! Everything the lifecycle, planner and sync crates agree on lives here:
//!
//! - `ids`: ledger ids (`AdminId`, `PledgeId`), record ids, addresses, tx hashes
//! - `token`: tokens and minor-unit `Amount`s with decimal parsing/formatting
//! - `admin`: the `PledgeAdmin` tagged union and the `AdminRegistry`
//! - `donation`: the `Donation` record, its status and invariants
//! - `action`: the user-facing actions a donation can be subjected to
//! - `filter`: `DonationFilter` for index queries and subscriptions
//! - `patch`: partial `DonationPatch` updates with an unset directive
//! - `ledger`: ledger calls, packed withdrawal entries and receipts
//! - `clock`: injectable time source

#![deny(unsafe_code)]

pub mod action;
pub mod admin;
pub mod clock;
pub mod donation;
pub mod error;
pub mod filter;
pub mod ids;
pub mod ledger;
pub mod patch;
pub mod token;

pub use action::{ActionKind, DonationAction};
pub use admin::{AdminKind, AdminProfile, AdminRegistry, AdminStatus, MilestoneTerms, PledgeAdmin};
pub use clock::{Clock, ManualClock, SystemClock};
pub use donation::{Donation, DonationStatus, DEFAULT_REQUIRED_CONFIRMATIONS};
pub use error::{InvariantViolation, ParseError, ValidationError};
pub use filter::DonationFilter;
pub use ids::{ActionId, Address, AdminId, DonationId, PledgeId, TxHash};
pub use ledger::{LedgerCall, PackedPledge, PledgeAmount, ReceiptStatus, TxReceipt};
pub use patch::{DonationPatch, UnsetField};
pub use token::{Amount, Token};
