//! The donation record: a giver's view into a ledger pledge.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::admin::AdminKind;
use crate::error::InvariantViolation;
use crate::ids::{Address, AdminId, DonationId, PledgeId, TxHash};
use crate::token::{Amount, Token};

/// Confirmations a mined transaction needs before the index treats it as final.
pub const DEFAULT_REQUIRED_CONFIRMATIONS: u32 = 6;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DonationStatus {
    /// A ledger transaction touching the donation is in flight
    Pending,
    /// Parked at a delegate, waiting to be delegated onward
    Waiting,
    /// Proposed to a milestone; the giver may veto until `commit_time`
    ToApprove,
    /// Owned by a project
    Committed,
    /// Withdrawal requested, payout not yet observed
    Paying,
    /// Paid out to the milestone recipient
    Paid,
    /// The owning project was cancelled; refundable
    Cancelled,
    /// Proposal vetoed
    Rejected,
}

impl DonationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DonationStatus::Pending => "PENDING",
            DonationStatus::Waiting => "WAITING",
            DonationStatus::ToApprove => "TO_APPROVE",
            DonationStatus::Committed => "COMMITTED",
            DonationStatus::Paying => "PAYING",
            DonationStatus::Paid => "PAID",
            DonationStatus::Cancelled => "CANCELLED",
            DonationStatus::Rejected => "REJECTED",
        }
    }
}

impl fmt::Display for DonationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Off-chain record representing (part of) a pledge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Donation {
    pub id: DonationId,
    /// Reassigned only by confirmed ledger moves
    pub pledge_id: PledgeId,
    /// Original amount in minor units; immutable
    pub amount: Amount,
    pub amount_remaining: Amount,
    pub token: Token,
    pub giver_address: Address,
    /// The giver's own admin id
    pub giver_id: AdminId,
    pub owner_id: AdminId,
    pub owner_type: AdminKind,
    #[serde(default)]
    pub delegate_id: Option<AdminId>,
    #[serde(default)]
    pub delegate_type: Option<AdminKind>,
    /// Ordered delegates the funds passed through; `delegate_id` is the tail
    #[serde(default)]
    pub delegate_chain: Vec<AdminId>,
    /// Project proposed during the veto window
    #[serde(default, alias = "intendedProject")]
    pub pending_project: Option<AdminId>,
    pub status: DonationStatus,
    #[serde(default)]
    pub tx_hash: Option<TxHash>,
    #[serde(default)]
    pub confirmations: u32,
    #[serde(default = "default_required_confirmations")]
    pub required_confirmations: u32,
    /// End of the veto window
    #[serde(default)]
    pub commit_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

fn default_required_confirmations() -> u32 {
    DEFAULT_REQUIRED_CONFIRMATIONS
}

impl Donation {
    /// Check the record-level invariants. `Pending` is transitional and exempt
    /// from the status/field correspondence checks.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        if self.amount_remaining > self.amount {
            return Err(InvariantViolation::RemainingExceedsAmount {
                donation: self.id.clone(),
                remaining: self.amount_remaining,
                amount: self.amount,
            });
        }

        let delegated = self.delegate_id.is_some();
        let proposed = self.pending_project.is_some();
        match self.status {
            DonationStatus::Waiting if !delegated => {
                return Err(InvariantViolation::WaitingWithoutDelegate(self.id.clone()))
            }
            DonationStatus::Waiting if proposed => {
                return Err(InvariantViolation::WaitingWithPendingProject(self.id.clone()))
            }
            DonationStatus::ToApprove if !proposed || self.commit_time.is_none() => {
                return Err(InvariantViolation::ToApproveWithoutProposal(self.id.clone()))
            }
            DonationStatus::Pending => return Ok(()),
            _ => {}
        }

        if delegated && !proposed && self.status != DonationStatus::Waiting {
            return Err(InvariantViolation::DelegatedButNotWaiting {
                donation: self.id.clone(),
                status: self.status,
            });
        }
        if proposed && self.status != DonationStatus::ToApprove {
            return Err(InvariantViolation::ProposalOutsideVetoWindow {
                donation: self.id.clone(),
                status: self.status,
            });
        }
        Ok(())
    }

    /// Whether the giver may still commit or reject the proposed project.
    pub fn veto_window_open(&self, now: DateTime<Utc>) -> bool {
        self.status == DonationStatus::ToApprove
            && self.pending_project.is_some()
            && self.commit_time.is_some_and(|deadline| now < deadline)
    }

    /// A spent record with nothing in flight is kept for history only.
    pub fn is_archivable(&self) -> bool {
        self.amount_remaining.is_zero() && self.status != DonationStatus::Pending
    }

    /// The giver still owns the funds (they only sit at a delegate).
    pub fn is_giver_owned(&self) -> bool {
        self.owner_type == AdminKind::Giver
    }

    pub fn has_remaining(&self) -> bool {
        !self.amount_remaining.is_zero()
    }

    /// Whether the transaction that produced this state is deep enough to be
    /// final.
    pub fn is_confirmed(&self) -> bool {
        self.confirmations >= self.required_confirmations
    }
}
