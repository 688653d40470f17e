//! Pledge admins: the addressable entities funds can be owned by or
//! delegated to.
//!
//! Delegates (communities), campaigns and milestones are an explicit tagged
//! union. Givers are admins on the ledger too, but carry nothing beyond an
//! address, so the registry tracks them separately.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{InvariantViolation, ValidationError};
use crate::ids::{Address, AdminId};
use crate::token::Amount;

/// Role an admin id plays in an owner/delegate slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdminKind {
    Giver,
    Delegate,
    Campaign,
    Milestone,
}

impl fmt::Display for AdminKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AdminKind::Giver => "giver",
            AdminKind::Delegate => "delegate",
            AdminKind::Campaign => "campaign",
            AdminKind::Milestone => "milestone",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdminStatus {
    #[default]
    Active,
    Canceled,
    /// Created locally, not yet confirmed on the ledger
    Pending,
}

/// Fields every admin kind carries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminProfile {
    /// Ledger-assigned id; set once, never changed afterwards
    pub admin_id: Option<AdminId>,
    /// Display name
    pub name: String,
    /// Controls the admin's funds and can cancel it
    pub owner_address: Address,
    /// May cancel the admin
    pub reviewer_address: Option<Address>,
    /// Receives milestone payouts
    pub recipient_address: Option<Address>,
    pub status: AdminStatus,
}

impl AdminProfile {
    pub fn new(name: impl Into<String>, owner: Address) -> Self {
        Self {
            admin_id: None,
            name: name.into(),
            owner_address: owner,
            reviewer_address: None,
            recipient_address: None,
            status: AdminStatus::Active,
        }
    }

    pub fn with_admin_id(mut self, id: AdminId) -> Self {
        self.admin_id = Some(id);
        self
    }

    pub fn with_reviewer(mut self, reviewer: Address) -> Self {
        self.reviewer_address = Some(reviewer);
        self
    }

    pub fn with_recipient(mut self, recipient: Address) -> Self {
        self.recipient_address = Some(recipient);
        self
    }

    pub fn with_status(mut self, status: AdminStatus) -> Self {
        self.status = status;
        self
    }
}

/// Milestone-only funding terms.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MilestoneTerms {
    /// Campaign the milestone belongs to
    pub campaign_id: AdminId,
    /// Funding cap; `None` means uncapped
    pub max_amount: Option<Amount>,
    /// Funds currently committed to the milestone
    pub current_balance: Amount,
}

impl MilestoneTerms {
    pub fn new(campaign_id: AdminId) -> Self {
        Self {
            campaign_id,
            max_amount: None,
            current_balance: Amount::ZERO,
        }
    }

    pub fn with_cap(mut self, max_amount: Amount) -> Self {
        self.max_amount = Some(max_amount);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PledgeAdmin {
    Delegate {
        #[serde(flatten)]
        profile: AdminProfile,
    },
    Campaign {
        #[serde(flatten)]
        profile: AdminProfile,
    },
    Milestone {
        #[serde(flatten)]
        profile: AdminProfile,
        terms: MilestoneTerms,
    },
}

impl PledgeAdmin {
    pub fn delegate(profile: AdminProfile) -> Self {
        PledgeAdmin::Delegate { profile }
    }

    pub fn campaign(profile: AdminProfile) -> Self {
        PledgeAdmin::Campaign { profile }
    }

    pub fn milestone(profile: AdminProfile, terms: MilestoneTerms) -> Self {
        PledgeAdmin::Milestone { profile, terms }
    }

    pub fn profile(&self) -> &AdminProfile {
        match self {
            PledgeAdmin::Delegate { profile }
            | PledgeAdmin::Campaign { profile }
            | PledgeAdmin::Milestone { profile, .. } => profile,
        }
    }

    fn profile_mut(&mut self) -> &mut AdminProfile {
        match self {
            PledgeAdmin::Delegate { profile }
            | PledgeAdmin::Campaign { profile }
            | PledgeAdmin::Milestone { profile, .. } => profile,
        }
    }

    pub fn kind(&self) -> AdminKind {
        match self {
            PledgeAdmin::Delegate { .. } => AdminKind::Delegate,
            PledgeAdmin::Campaign { .. } => AdminKind::Campaign,
            PledgeAdmin::Milestone { .. } => AdminKind::Milestone,
        }
    }

    pub fn admin_id(&self) -> Option<AdminId> {
        self.profile().admin_id
    }

    pub fn name(&self) -> &str {
        &self.profile().name
    }

    pub fn status(&self) -> AdminStatus {
        self.profile().status
    }

    pub fn is_active(&self) -> bool {
        self.status() == AdminStatus::Active
    }

    /// Record the ledger id. Setting the same id twice is a no-op; a
    /// different id is refused.
    pub fn assign_admin_id(&mut self, id: AdminId) -> Result<(), InvariantViolation> {
        let profile = self.profile_mut();
        match profile.admin_id {
            Some(existing) if existing != id => Err(InvariantViolation::AdminIdReassigned {
                existing,
                attempted: id,
            }),
            _ => {
                profile.admin_id = Some(id);
                Ok(())
            }
        }
    }

    /// Whether funds proposed to this admin go through the giver's veto
    /// window instead of landing directly.
    pub fn requires_giver_veto(&self) -> bool {
        match self {
            PledgeAdmin::Milestone { .. } => true,
            PledgeAdmin::Delegate { .. } | PledgeAdmin::Campaign { .. } => false,
        }
    }

    pub fn is_owner(&self, actor: &Address) -> bool {
        &self.profile().owner_address == actor
    }

    pub fn is_reviewer(&self, actor: &Address) -> bool {
        self.profile().reviewer_address.as_ref() == Some(actor)
    }

    pub fn is_recipient(&self, actor: &Address) -> bool {
        self.profile().recipient_address.as_ref() == Some(actor)
    }

    pub fn terms(&self) -> Option<&MilestoneTerms> {
        match self {
            PledgeAdmin::Milestone { terms, .. } => Some(terms),
            PledgeAdmin::Delegate { .. } | PledgeAdmin::Campaign { .. } => None,
        }
    }

    /// How much more the admin may receive. `None` means unlimited.
    pub fn remaining_capacity(&self) -> Option<Amount> {
        self.terms()
            .and_then(|t| t.max_amount.map(|cap| cap.saturating_sub(t.current_balance)))
    }
}

/// In-memory view of every known admin.
#[derive(Clone, Debug, Default)]
pub struct AdminRegistry {
    admins: BTreeMap<AdminId, PledgeAdmin>,
    givers: BTreeMap<AdminId, Address>,
}

impl AdminRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an admin that already has its ledger id.
    pub fn register(&mut self, admin: PledgeAdmin) -> Result<AdminId, InvariantViolation> {
        let id = admin
            .admin_id()
            .ok_or_else(|| InvariantViolation::MissingAdminId(admin.name().to_string()))?;
        if self.admins.contains_key(&id) || self.givers.contains_key(&id) {
            return Err(InvariantViolation::DuplicateAdmin(id));
        }
        self.admins.insert(id, admin);
        Ok(id)
    }

    pub fn register_giver(&mut self, id: AdminId, address: Address) -> Result<(), InvariantViolation> {
        if self.admins.contains_key(&id) || self.givers.contains_key(&id) {
            return Err(InvariantViolation::DuplicateAdmin(id));
        }
        self.givers.insert(id, address);
        Ok(())
    }

    pub fn get(&self, id: AdminId) -> Option<&PledgeAdmin> {
        self.admins.get(&id)
    }

    pub fn giver_address(&self, id: AdminId) -> Option<&Address> {
        self.givers.get(&id)
    }

    pub fn giver_id(&self, address: &Address) -> Option<AdminId> {
        self.givers
            .iter()
            .find(|(_, a)| *a == address)
            .map(|(id, _)| *id)
    }

    pub fn kind_of(&self, id: AdminId) -> Option<AdminKind> {
        if self.givers.contains_key(&id) {
            return Some(AdminKind::Giver);
        }
        self.admins.get(&id).map(PledgeAdmin::kind)
    }

    /// Address that controls funds sitting at `id`: the giver's own address,
    /// or the admin's owner.
    pub fn controller(&self, id: AdminId) -> Option<&Address> {
        self.givers
            .get(&id)
            .or_else(|| self.admins.get(&id).map(|a| &a.profile().owner_address))
    }

    pub fn require(&self, id: AdminId) -> Result<&PledgeAdmin, ValidationError> {
        self.admins.get(&id).ok_or(ValidationError::AdminNotFound(id))
    }

    /// Look up an admin that may still receive funds.
    pub fn require_active(&self, id: AdminId) -> Result<&PledgeAdmin, ValidationError> {
        let admin = self.require(id)?;
        if !admin.is_active() {
            return Err(ValidationError::AdminInactive(id));
        }
        Ok(admin)
    }

    pub fn milestones_of(&self, campaign: AdminId) -> impl Iterator<Item = &PledgeAdmin> {
        self.admins
            .values()
            .filter(move |a| a.terms().is_some_and(|t| t.campaign_id == campaign))
    }

    pub fn admins(&self) -> impl Iterator<Item = &PledgeAdmin> {
        self.admins.values()
    }

    /// Mark an admin canceled. Cancelling a campaign cancels its milestones.
    /// Returns every admin whose status changed, the target first.
    pub fn cancel(&mut self, id: AdminId) -> Result<Vec<AdminId>, ValidationError> {
        let kind = self.require(id)?.kind();
        let mut targets = vec![id];
        if kind == AdminKind::Campaign {
            targets.extend(self.milestones_of(id).filter_map(PledgeAdmin::admin_id));
        }

        let mut changed = Vec::new();
        for target in targets {
            if let Some(admin) = self.admins.get_mut(&target) {
                if admin.status() != AdminStatus::Canceled {
                    admin.profile_mut().status = AdminStatus::Canceled;
                    changed.push(target);
                }
            }
        }
        Ok(changed)
    }

    /// Adjust a milestone's committed balance. Non-milestones are ignored.
    pub fn add_balance(&mut self, id: AdminId, amount: Amount) {
        if let Some(PledgeAdmin::Milestone { terms, .. }) = self.admins.get_mut(&id) {
            terms.current_balance = terms.current_balance.checked_add(amount).unwrap_or(Amount(u128::MAX));
        }
    }

    pub fn subtract_balance(&mut self, id: AdminId, amount: Amount) {
        if let Some(PledgeAdmin::Milestone { terms, .. }) = self.admins.get_mut(&id) {
            terms.current_balance = terms.current_balance.saturating_sub(amount);
        }
    }
}
