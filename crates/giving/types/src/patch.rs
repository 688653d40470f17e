//! Partial updates to donation records.
//!
//! Used both for optimistic overlays in the read model and for partial writes
//! to the index. Fields set to `Some` overwrite; fields named in `unset` are
//! cleared after the overwrites are applied.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::admin::AdminKind;
use crate::donation::{Donation, DonationStatus};
use crate::error::InvariantViolation;
use crate::ids::{AdminId, PledgeId, TxHash};
use crate::token::Amount;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UnsetField {
    /// Proposed project and commit time
    PendingProject,
    /// Delegate id, type and chain
    Delegate,
    TxHash,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DonationPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<DonationStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<TxHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<(AdminId, AdminKind)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegate: Option<(AdminId, AdminKind)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_project: Option<AdminId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_remaining: Option<Amount>,
    /// Only confirmed ledger moves may carry a pledge id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pledge_id: Option<PledgeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmations: Option<u32>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub unset: BTreeSet<UnsetField>,
}

impl DonationPatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// A patch that only moves the status.
    pub fn status(status: DonationStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_tx_hash(mut self, hash: TxHash) -> Self {
        self.tx_hash = Some(hash);
        self
    }

    pub fn with_owner(mut self, id: AdminId, kind: AdminKind) -> Self {
        self.owner = Some((id, kind));
        self
    }

    pub fn with_delegate(mut self, id: AdminId, kind: AdminKind) -> Self {
        self.delegate = Some((id, kind));
        self
    }

    pub fn with_proposal(mut self, project: AdminId, commit_time: DateTime<Utc>) -> Self {
        self.pending_project = Some(project);
        self.commit_time = Some(commit_time);
        self
    }

    pub fn with_remaining(mut self, remaining: Amount) -> Self {
        self.amount_remaining = Some(remaining);
        self
    }

    pub fn with_pledge(mut self, pledge: PledgeId) -> Self {
        self.pledge_id = Some(pledge);
        self
    }

    pub fn with_confirmations(mut self, confirmations: u32) -> Self {
        self.confirmations = Some(confirmations);
        self
    }

    pub fn unset(mut self, field: UnsetField) -> Self {
        self.unset.insert(field);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Whether the patch is limited to what an optimistic overlay may touch.
    pub fn is_advisory(&self) -> bool {
        self.pledge_id.is_none() && self.amount_remaining.is_none()
    }

    /// Apply onto a record. Fails without modifying it if the result would
    /// grow `amount_remaining`.
    pub fn apply(&self, donation: &mut Donation) -> Result<(), InvariantViolation> {
        if let Some(remaining) = self.amount_remaining {
            if remaining > donation.amount_remaining {
                return Err(InvariantViolation::RemainingIncreased {
                    donation: donation.id.clone(),
                    from: donation.amount_remaining,
                    to: remaining,
                });
            }
        }

        if let Some(status) = self.status {
            donation.status = status;
        }
        if let Some(ref hash) = self.tx_hash {
            donation.tx_hash = Some(hash.clone());
        }
        if let Some((id, kind)) = self.owner {
            donation.owner_id = id;
            donation.owner_type = kind;
        }
        if let Some((id, kind)) = self.delegate {
            donation.delegate_id = Some(id);
            donation.delegate_type = Some(kind);
            if donation.delegate_chain.last() != Some(&id) {
                donation.delegate_chain.push(id);
            }
        }
        if let Some(project) = self.pending_project {
            donation.pending_project = Some(project);
        }
        if let Some(at) = self.commit_time {
            donation.commit_time = Some(at);
        }
        if let Some(remaining) = self.amount_remaining {
            donation.amount_remaining = remaining;
        }
        if let Some(pledge) = self.pledge_id {
            donation.pledge_id = pledge;
        }
        if let Some(confirmations) = self.confirmations {
            donation.confirmations = confirmations;
        }

        for field in &self.unset {
            match field {
                UnsetField::PendingProject => {
                    donation.pending_project = None;
                    donation.commit_time = None;
                }
                UnsetField::Delegate => {
                    donation.delegate_id = None;
                    donation.delegate_type = None;
                    donation.delegate_chain.clear();
                }
                UnsetField::TxHash => donation.tx_hash = None,
            }
        }
        Ok(())
    }
}
