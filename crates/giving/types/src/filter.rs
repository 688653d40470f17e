//! Donation query filter, shared by index queries and live subscriptions.

use serde::{Deserialize, Serialize};

use crate::admin::AdminKind;
use crate::donation::{Donation, DonationStatus};
use crate::ids::{Address, AdminId};

/// Conjunction of optional criteria. An empty filter matches everything.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DonationFilter {
    pub owner_id: Option<AdminId>,
    pub owner_type: Option<AdminKind>,
    pub giver_address: Option<Address>,
    pub delegate_id: Option<AdminId>,
    /// Admin that owns, delegates, or is proposed the donation
    pub involving: Option<AdminId>,
    /// Any of these statuses; empty means any status
    #[serde(default)]
    pub statuses: Vec<DonationStatus>,
    /// Skip records with nothing left
    #[serde(default)]
    pub with_remaining: bool,
}

impl DonationFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_owner(mut self, owner: AdminId) -> Self {
        self.owner_id = Some(owner);
        self
    }

    pub fn with_owner_type(mut self, kind: AdminKind) -> Self {
        self.owner_type = Some(kind);
        self
    }

    pub fn with_giver(mut self, giver: Address) -> Self {
        self.giver_address = Some(giver);
        self
    }

    pub fn with_delegate(mut self, delegate: AdminId) -> Self {
        self.delegate_id = Some(delegate);
        self
    }

    pub fn involving(mut self, admin: AdminId) -> Self {
        self.involving = Some(admin);
        self
    }

    pub fn with_status(mut self, status: DonationStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn with_remaining(mut self) -> Self {
        self.with_remaining = true;
        self
    }

    pub fn matches(&self, donation: &Donation) -> bool {
        if let Some(owner) = self.owner_id {
            if donation.owner_id != owner {
                return false;
            }
        }
        if let Some(kind) = self.owner_type {
            if donation.owner_type != kind {
                return false;
            }
        }
        if let Some(ref giver) = self.giver_address {
            if &donation.giver_address != giver {
                return false;
            }
        }
        if let Some(delegate) = self.delegate_id {
            if donation.delegate_id != Some(delegate) {
                return false;
            }
        }
        if let Some(admin) = self.involving {
            let involved = donation.owner_id == admin
                || donation.delegate_chain.contains(&admin)
                || donation.delegate_id == Some(admin)
                || donation.pending_project == Some(admin);
            if !involved {
                return false;
            }
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&donation.status) {
            return false;
        }
        if self.with_remaining && !donation.has_remaining() {
            return false;
        }
        true
    }
}
