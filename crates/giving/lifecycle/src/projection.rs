//! Projection of confirmed ledger calls onto the canonical donation set.
//!
//! This is what the off-chain index derives from ledger events. It is used
//! by the simulated ledger to decide whether a call reverts (projection
//! error) and by the simulated index as its source of truth.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use giving_types::{
    Address, AdminId, AdminKind, AdminRegistry, Amount, Donation, DonationId, DonationStatus,
    LedgerCall, PledgeId, Token, TxHash, DEFAULT_REQUIRED_CONFIRMATIONS,
};
use tracing::debug;

use crate::error::ProjectionError;
use crate::machine::DEFAULT_COMMIT_WINDOW_SECS;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum PledgeState {
    Pledged,
    Paying,
    Paid,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct PledgeKey {
    owner: AdminId,
    chain: Vec<AdminId>,
    intended: Option<AdminId>,
    state: PledgeState,
    token: Address,
}

/// Find-or-create pledge ids: funds with the same owner, delegation chain,
/// proposal, payment state and token share one pledge.
#[derive(Clone, Debug, Default)]
pub struct PledgeBook {
    last: u64,
    ids: HashMap<PledgeKey, PledgeId>,
}

impl PledgeBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pledge_for(&mut self, donation: &Donation) -> PledgeId {
        let state = match donation.status {
            DonationStatus::Paying => PledgeState::Paying,
            DonationStatus::Paid => PledgeState::Paid,
            _ => PledgeState::Pledged,
        };
        let key = PledgeKey {
            owner: donation.owner_id,
            chain: donation.delegate_chain.clone(),
            intended: donation.pending_project,
            state,
            token: donation.token.address.clone(),
        };
        if let Some(id) = self.ids.get(&key) {
            return *id;
        }
        self.last += 1;
        let id = PledgeId(self.last);
        self.ids.insert(key, id);
        id
    }
}

/// A mined ledger call as the index observes it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Confirmed {
    pub call: LedgerCall,
    pub tx_hash: TxHash,
    pub at: DateTime<Utc>,
    pub confirmations: u32,
    /// Records the call was issued for; their funds move first
    pub reference: Vec<DonationId>,
}

/// Canonical donation set plus the admin and pledge state it depends on.
#[derive(Clone, Debug)]
pub struct LedgerProjection {
    registry: AdminRegistry,
    pledges: PledgeBook,
    tokens: Vec<Token>,
    donations: Vec<Donation>,
    commit_window: Duration,
    required_confirmations: u32,
}

struct Selection {
    moved: Vec<usize>,
    reduced: Vec<DonationId>,
}

impl LedgerProjection {
    pub fn new(registry: AdminRegistry) -> Self {
        Self {
            registry,
            pledges: PledgeBook::new(),
            tokens: Vec::new(),
            donations: Vec::new(),
            commit_window: Duration::seconds(DEFAULT_COMMIT_WINDOW_SECS),
            required_confirmations: DEFAULT_REQUIRED_CONFIRMATIONS,
        }
    }

    pub fn with_commit_window(mut self, window: Duration) -> Self {
        self.commit_window = window;
        self
    }

    pub fn with_required_confirmations(mut self, confirmations: u32) -> Self {
        self.required_confirmations = confirmations;
        self
    }

    pub fn register_token(&mut self, token: Token) {
        if !self.tokens.iter().any(|t| t.address == token.address) {
            self.tokens.push(token);
        }
    }

    pub fn registry(&self) -> &AdminRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut AdminRegistry {
        &mut self.registry
    }

    pub fn donations(&self) -> &[Donation] {
        &self.donations
    }

    pub fn donation(&self, id: &DonationId) -> Option<&Donation> {
        self.donations.iter().find(|d| &d.id == id)
    }

    /// Apply a confirmed call atomically. On error nothing changes and the
    /// ledger treats the call as reverted. Returns the touched records.
    pub fn apply(&mut self, confirmed: &Confirmed) -> Result<Vec<DonationId>, ProjectionError> {
        let mut draft = self.clone();
        let touched = draft.apply_in_place(confirmed)?;
        *self = draft;
        debug!(
            call = confirmed.call.name(),
            tx_hash = %confirmed.tx_hash,
            touched = touched.len(),
            "projected confirmed call"
        );
        Ok(touched)
    }

    /// Payout observed for every paying record: `PAYING -> PAID`.
    pub fn confirm_payouts(&mut self) -> Vec<DonationId> {
        let mut paid = Vec::new();
        for idx in 0..self.donations.len() {
            if self.donations[idx].status != DonationStatus::Paying {
                continue;
            }
            let d = &mut self.donations[idx];
            self.registry.subtract_balance(d.owner_id, d.amount_remaining);
            d.status = DonationStatus::Paid;
            d.amount_remaining = Amount::ZERO;
            paid.push(d.id.clone());
            self.relocate(idx);
        }
        paid
    }

    /// Update the confirmation count of records last written by `tx_hash`.
    pub fn set_confirmations(&mut self, tx_hash: &TxHash, confirmations: u32) -> Vec<DonationId> {
        self.donations
            .iter_mut()
            .filter(|d| d.tx_hash.as_ref() == Some(tx_hash))
            .map(|d| {
                d.confirmations = confirmations;
                d.id.clone()
            })
            .collect()
    }

    fn apply_in_place(&mut self, c: &Confirmed) -> Result<Vec<DonationId>, ProjectionError> {
        let mut touched = match &c.call {
            LedgerCall::Donate {
                giver_id,
                receiver_id,
                amount,
                token,
            } => vec![self.project_donate(*giver_id, *receiver_id, *amount, token, c.at)?],
            LedgerCall::Transfer {
                sender_id,
                pledge_id,
                amount,
                receiver_id,
            } => self.project_transfer(*sender_id, *pledge_id, *amount, *receiver_id, c)?,
            LedgerCall::Withdraw { pledge_id, amount } => self.project_refund(*pledge_id, *amount, c)?,
            LedgerCall::MultiWithdraw {
                milestone_id,
                pledges,
            } => {
                let mut touched = Vec::new();
                for packed in pledges {
                    let entry = packed.decode()?;
                    touched.extend(self.project_payout(*milestone_id, entry.pledge_id, entry.amount, c)?);
                }
                touched
            }
            LedgerCall::CancelProject { admin_id } => self.project_cancel(*admin_id)?,
        };
        touched.dedup();

        for d in self.donations.iter_mut().filter(|d| touched.contains(&d.id)) {
            d.tx_hash = Some(c.tx_hash.clone());
            d.confirmations = c.confirmations;
            d.required_confirmations = self.required_confirmations;
            d.check_invariants()?;
        }
        Ok(touched)
    }

    fn project_donate(
        &mut self,
        giver_id: AdminId,
        receiver: AdminId,
        amount: Amount,
        token: &Address,
        at: DateTime<Utc>,
    ) -> Result<DonationId, ProjectionError> {
        let giver_address = self
            .registry
            .giver_address(giver_id)
            .cloned()
            .ok_or(ProjectionError::UnknownAdmin(giver_id))?;
        let token = self
            .tokens
            .iter()
            .find(|t| &t.address == token)
            .cloned()
            .ok_or_else(|| ProjectionError::UnknownToken(token.clone()))?;
        let kind = self.receiver_kind(receiver)?;

        let mut donation = Donation {
            id: DonationId::generate(),
            pledge_id: PledgeId(0),
            amount,
            amount_remaining: amount,
            token,
            giver_address,
            giver_id,
            owner_id: giver_id,
            owner_type: AdminKind::Giver,
            delegate_id: None,
            delegate_type: None,
            delegate_chain: Vec::new(),
            pending_project: None,
            status: DonationStatus::Waiting,
            tx_hash: None,
            confirmations: 0,
            required_confirmations: self.required_confirmations,
            commit_time: None,
            created_at: at,
        };
        match kind {
            AdminKind::Delegate | AdminKind::Giver => park_at(&mut donation, receiver, kind),
            AdminKind::Campaign | AdminKind::Milestone => {
                donation.owner_id = receiver;
                donation.owner_type = kind;
                donation.status = DonationStatus::Committed;
                self.registry.add_balance(receiver, amount);
            }
        }

        let id = donation.id.clone();
        self.donations.push(donation);
        self.relocate(self.donations.len() - 1);
        Ok(id)
    }

    fn project_transfer(
        &mut self,
        sender: AdminId,
        pledge: PledgeId,
        amount: Amount,
        receiver: AdminId,
        c: &Confirmed,
    ) -> Result<Vec<DonationId>, ProjectionError> {
        let kind = self.receiver_kind(receiver)?;
        let selection = self.select(pledge, amount, &c.reference, c.at, |d| {
            !matches!(
                d.status,
                DonationStatus::Paying | DonationStatus::Paid | DonationStatus::Cancelled
            )
        })?;

        let mut touched = selection.reduced;
        for idx in selection.moved {
            let deadline = c.at + self.commit_window;
            let d = &mut self.donations[idx];
            move_to(&mut self.registry, d, sender, receiver, kind, deadline)?;
            touched.push(d.id.clone());
            self.relocate(idx);
        }
        Ok(touched)
    }

    fn project_refund(
        &mut self,
        pledge: PledgeId,
        amount: Amount,
        c: &Confirmed,
    ) -> Result<Vec<DonationId>, ProjectionError> {
        let selection = self.select(pledge, amount, &c.reference, c.at, |d| {
            let parked = d.status == DonationStatus::Waiting
                && d.is_giver_owned()
                && matches!(d.delegate_type, Some(AdminKind::Delegate | AdminKind::Campaign));
            parked || d.status == DonationStatus::Cancelled
        })?;

        let mut touched = selection.reduced;
        for idx in selection.moved {
            let d = &mut self.donations[idx];
            if !d.is_giver_owned() {
                self.registry.subtract_balance(d.owner_id, d.amount_remaining);
            }
            d.owner_id = d.giver_id;
            d.owner_type = AdminKind::Giver;
            d.delegate_chain.clear();
            let giver = d.giver_id;
            park_at(d, giver, AdminKind::Giver);
            touched.push(d.id.clone());
            self.relocate(idx);
        }
        Ok(touched)
    }

    fn project_payout(
        &mut self,
        milestone: AdminId,
        pledge: PledgeId,
        amount: Amount,
        c: &Confirmed,
    ) -> Result<Vec<DonationId>, ProjectionError> {
        let selection = self.select(pledge, amount, &c.reference, c.at, |d| {
            d.owner_id == milestone && d.status == DonationStatus::Committed
        })?;

        let mut touched = selection.reduced;
        for idx in selection.moved {
            self.donations[idx].status = DonationStatus::Paying;
            touched.push(self.donations[idx].id.clone());
            self.relocate(idx);
        }
        Ok(touched)
    }

    /// Cancel an admin: proposals to it are dropped, records it owns become
    /// `CANCELLED`, delegation chains through it unwind to the entry before
    /// it (or to the giver).
    fn project_cancel(&mut self, admin: AdminId) -> Result<Vec<DonationId>, ProjectionError> {
        let canceled = self.registry.cancel(admin)?;
        if canceled.is_empty() {
            return Err(ProjectionError::AlreadyCanceled(admin));
        }

        let mut touched = Vec::new();
        for idx in 0..self.donations.len() {
            let d = &mut self.donations[idx];
            if !d.has_remaining() || matches!(d.status, DonationStatus::Paying | DonationStatus::Paid) {
                continue;
            }
            let mut changed = false;

            if d.pending_project.is_some_and(|p| canceled.contains(&p)) {
                d.pending_project = None;
                d.commit_time = None;
                d.status = DonationStatus::Waiting;
                changed = true;
            }
            if canceled.contains(&d.owner_id) && d.status == DonationStatus::Committed {
                d.status = DonationStatus::Cancelled;
                changed = true;
            }
            if let Some(pos) = d.delegate_chain.iter().position(|a| canceled.contains(a)) {
                d.delegate_chain.truncate(pos);
                d.pending_project = None;
                d.commit_time = None;
                match d.delegate_chain.last().copied() {
                    Some(tail) => {
                        let kind = self.registry.kind_of(tail).unwrap_or(AdminKind::Delegate);
                        d.delegate_id = Some(tail);
                        d.delegate_type = Some(kind);
                        d.status = DonationStatus::Waiting;
                    }
                    None => {
                        let giver = d.giver_id;
                        park_at(d, giver, AdminKind::Giver);
                    }
                }
                changed = true;
            }

            if changed {
                debug!(donation_id = %d.id, admin = %admin, status = %d.status, "unwound after cancel");
                touched.push(d.id.clone());
                self.relocate(idx);
            }
        }
        Ok(touched)
    }

    fn receiver_kind(&self, receiver: AdminId) -> Result<AdminKind, ProjectionError> {
        let kind = self
            .registry
            .kind_of(receiver)
            .ok_or(ProjectionError::UnknownAdmin(receiver))?;
        if kind != AdminKind::Giver {
            self.registry.require_active(receiver)?;
        }
        Ok(kind)
    }

    /// Pick the records holding `amount` of `pledge`, referenced records
    /// first, then oldest first. The last record is split if it holds more
    /// than what is left to move.
    fn select(
        &mut self,
        pledge: PledgeId,
        amount: Amount,
        reference: &[DonationId],
        at: DateTime<Utc>,
        eligible: impl Fn(&Donation) -> bool,
    ) -> Result<Selection, ProjectionError> {
        let mut candidates: Vec<usize> = (0..self.donations.len())
            .filter(|&i| {
                let d = &self.donations[i];
                d.pledge_id == pledge && d.has_remaining() && eligible(d)
            })
            .collect();
        if candidates.is_empty() {
            return Err(ProjectionError::UnknownPledge(pledge));
        }
        candidates.sort_by_key(|&i| {
            let d = &self.donations[i];
            (
                reference.iter().position(|r| r == &d.id).unwrap_or(usize::MAX),
                d.created_at,
            )
        });

        // An overflowing sum holds more than any request.
        let available = Amount::checked_sum(candidates.iter().map(|&i| self.donations[i].amount_remaining));
        if let Some(available) = available.filter(|&available| amount > available) {
            return Err(ProjectionError::InsufficientFunds {
                pledge,
                requested: amount,
                available,
            });
        }

        let mut left = amount;
        let mut selection = Selection {
            moved: Vec::new(),
            reduced: Vec::new(),
        };
        for idx in candidates {
            if left.is_zero() {
                break;
            }
            let remaining = self.donations[idx].amount_remaining;
            if remaining <= left {
                selection.moved.push(idx);
                left = left.saturating_sub(remaining);
            } else {
                let original = &mut self.donations[idx];
                original.amount_remaining = remaining.saturating_sub(left);
                let mut part = original.clone();
                part.id = DonationId::generate();
                part.amount = left;
                part.amount_remaining = left;
                part.created_at = at;
                selection.reduced.push(original.id.clone());
                self.donations.push(part);
                selection.moved.push(self.donations.len() - 1);
                left = Amount::ZERO;
            }
        }
        Ok(selection)
    }

    fn relocate(&mut self, idx: usize) {
        let pledge = self.pledges.pledge_for(&self.donations[idx]);
        self.donations[idx].pledge_id = pledge;
    }
}

/// Park a giver-owned record at `admin` as its current delegate.
fn park_at(d: &mut Donation, admin: AdminId, kind: AdminKind) {
    d.delegate_id = Some(admin);
    d.delegate_type = Some(kind);
    if d.delegate_chain.last() != Some(&admin) {
        d.delegate_chain.push(admin);
    }
    d.pending_project = None;
    d.commit_time = None;
    d.status = DonationStatus::Waiting;
}

fn move_to(
    registry: &mut AdminRegistry,
    d: &mut Donation,
    sender: AdminId,
    receiver: AdminId,
    kind: AdminKind,
    deadline: DateTime<Utc>,
) -> Result<(), ProjectionError> {
    let pledge = d.pledge_id;
    let illegal = move |reason: &str| ProjectionError::IllegalMove {
        pledge,
        receiver,
        reason: reason.to_string(),
    };
    let sender_pos = d.delegate_chain.iter().position(|a| *a == sender);
    if sender != d.owner_id && sender_pos.is_none() {
        return Err(illegal("sender does not control the pledge"));
    }

    if d.status == DonationStatus::ToApprove {
        if d.pending_project == Some(receiver) && sender == d.owner_id {
            d.owner_id = receiver;
            d.owner_type = kind;
            d.delegate_id = None;
            d.delegate_type = None;
            d.delegate_chain.clear();
            d.pending_project = None;
            d.commit_time = None;
            d.status = DonationStatus::Committed;
            registry.add_balance(receiver, d.amount_remaining);
            return Ok(());
        }
        if d.delegate_id == Some(receiver) {
            d.pending_project = None;
            d.commit_time = None;
            d.status = DonationStatus::Waiting;
            return Ok(());
        }
        return Err(illegal("a proposal is awaiting the giver's decision"));
    }

    if d.is_giver_owned() {
        match kind {
            AdminKind::Giver if receiver == d.giver_id => {
                d.delegate_chain.clear();
                park_at(d, receiver, kind);
            }
            AdminKind::Giver => return Err(illegal("funds cannot move to another giver")),
            AdminKind::Milestone => {
                d.pending_project = Some(receiver);
                d.commit_time = Some(deadline);
                d.status = DonationStatus::ToApprove;
            }
            AdminKind::Delegate | AdminKind::Campaign => {
                match sender_pos {
                    Some(pos) => d.delegate_chain.truncate(pos + 1),
                    None => d.delegate_chain.clear(),
                }
                park_at(d, receiver, kind);
            }
        }
        return Ok(());
    }

    match kind {
        AdminKind::Campaign | AdminKind::Milestone => {
            registry.subtract_balance(d.owner_id, d.amount_remaining);
            d.owner_id = receiver;
            d.owner_type = kind;
            d.status = DonationStatus::Committed;
            registry.add_balance(receiver, d.amount_remaining);
            Ok(())
        }
        AdminKind::Delegate | AdminKind::Giver => Err(illegal("committed funds can only move to a project")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::fixtures::*;
    use giving_types::{PackedPledge, PledgeAmount};

    fn projection() -> LedgerProjection {
        let mut p = LedgerProjection::new(registry());
        p.register_token(token());
        p
    }

    fn confirmed(call: LedgerCall, n: u8) -> Confirmed {
        Confirmed {
            call,
            tx_hash: TxHash::from_digest(&[n; 32]),
            at: now(),
            confirmations: 1,
            reference: Vec::new(),
        }
    }

    fn donate(p: &mut LedgerProjection, receiver: AdminId, amount: u128) -> DonationId {
        let call = LedgerCall::Donate {
            giver_id: GIVER,
            receiver_id: receiver,
            amount: Amount(amount),
            token: token().address,
        };
        p.apply(&confirmed(call, 1)).unwrap().remove(0)
    }

    fn transfer(p: &mut LedgerProjection, id: &DonationId, sender: AdminId, receiver: AdminId, amount: u128) -> Result<Vec<DonationId>, ProjectionError> {
        let pledge = p.donation(id).unwrap().pledge_id;
        let mut c = confirmed(
            LedgerCall::Transfer {
                sender_id: sender,
                pledge_id: pledge,
                amount: Amount(amount),
                receiver_id: receiver,
            },
            2,
        );
        c.reference = vec![id.clone()];
        p.apply(&c)
    }

    #[test]
    fn donate_to_delegate_waits() {
        let mut p = projection();
        let id = donate(&mut p, COMMUNITY, 100);
        let d = p.donation(&id).unwrap();
        assert_eq!(d.status, DonationStatus::Waiting);
        assert_eq!(d.delegate_id, Some(COMMUNITY));
        assert_eq!(d.owner_id, GIVER);
        assert_ne!(d.pledge_id, PledgeId(0));
        assert!(d.tx_hash.is_some());
    }

    #[test]
    fn confirmations_follow_the_producing_transaction() {
        let mut p = projection();
        let id = donate(&mut p, COMMUNITY, 100);
        let hash = p.donation(&id).unwrap().tx_hash.clone().unwrap();
        assert_eq!(p.donation(&id).unwrap().confirmations, 1);
        assert!(!p.donation(&id).unwrap().is_confirmed());

        assert_eq!(p.set_confirmations(&hash, 6), vec![id.clone()]);
        assert!(p.donation(&id).unwrap().is_confirmed());

        // A later transaction owns the record now.
        transfer(&mut p, &id, COMMUNITY, CAMPAIGN, 100).unwrap();
        assert!(p.set_confirmations(&hash, 9).is_empty());
        assert_eq!(p.donation(&id).unwrap().confirmations, 1);
    }

    #[test]
    fn donate_to_milestone_commits_and_books_balance() {
        let mut p = projection();
        let id = donate(&mut p, CAPPED, 100);
        assert_eq!(p.donation(&id).unwrap().status, DonationStatus::Committed);
        assert_eq!(p.registry().get(CAPPED).unwrap().remaining_capacity(), Some(Amount(50)));
    }

    #[test]
    fn delegation_chain_to_proposal_and_commit() {
        let mut p = projection();
        let id = donate(&mut p, COMMUNITY, 100);

        transfer(&mut p, &id, COMMUNITY, CAMPAIGN, 100).unwrap();
        let d = p.donation(&id).unwrap();
        assert_eq!(d.status, DonationStatus::Waiting);
        assert_eq!(d.delegate_chain, vec![COMMUNITY, CAMPAIGN]);

        transfer(&mut p, &id, CAMPAIGN, MILESTONE, 100).unwrap();
        let d = p.donation(&id).unwrap();
        assert_eq!(d.status, DonationStatus::ToApprove);
        assert_eq!(d.pending_project, Some(MILESTONE));
        assert_eq!(d.commit_time, Some(now() + Duration::days(3)));

        transfer(&mut p, &id, GIVER, MILESTONE, 100).unwrap();
        let d = p.donation(&id).unwrap();
        assert_eq!(d.status, DonationStatus::Committed);
        assert_eq!(d.owner_id, MILESTONE);
        assert!(d.delegate_chain.is_empty());
    }

    #[test]
    fn reject_returns_to_delegate() {
        let mut p = projection();
        let id = donate(&mut p, COMMUNITY, 100);
        transfer(&mut p, &id, COMMUNITY, MILESTONE, 100).unwrap();
        transfer(&mut p, &id, GIVER, COMMUNITY, 100).unwrap();
        let d = p.donation(&id).unwrap();
        assert_eq!(d.status, DonationStatus::Waiting);
        assert_eq!(d.pending_project, None);
        assert_eq!(d.delegate_id, Some(COMMUNITY));
    }

    #[test]
    fn partial_transfer_splits_record() {
        let mut p = projection();
        let id = donate(&mut p, COMMUNITY, 100);
        let touched = transfer(&mut p, &id, COMMUNITY, CAMPAIGN, 40).unwrap();
        assert_eq!(touched.len(), 2);

        let original = p.donation(&id).unwrap();
        assert_eq!(original.amount, Amount(100));
        assert_eq!(original.amount_remaining, Amount(60));
        assert_eq!(original.delegate_id, Some(COMMUNITY));

        let part = p.donations().iter().find(|d| d.id != id).unwrap();
        assert_eq!(part.amount, Amount(40));
        assert_eq!(part.delegate_id, Some(CAMPAIGN));
        assert_ne!(part.pledge_id, original.pledge_id);
    }

    #[test]
    fn failed_projection_leaves_state_untouched() {
        let mut p = projection();
        let id = donate(&mut p, COMMUNITY, 100);
        let before = p.donations().to_vec();
        assert!(matches!(
            transfer(&mut p, &id, COMMUNITY, CAMPAIGN, 500),
            Err(ProjectionError::InsufficientFunds { .. })
        ));
        assert!(matches!(
            transfer(&mut p, &id, CAMPAIGN, MILESTONE, 100),
            Err(ProjectionError::IllegalMove { .. })
        ));
        assert_eq!(p.donations(), before.as_slice());
    }

    #[test]
    fn refund_parks_at_giver() {
        let mut p = projection();
        let id = donate(&mut p, COMMUNITY, 100);
        let pledge = p.donation(&id).unwrap().pledge_id;
        p.apply(&confirmed(LedgerCall::Withdraw { pledge_id: pledge, amount: Amount(100) }, 3))
            .unwrap();
        let d = p.donation(&id).unwrap();
        assert_eq!(d.status, DonationStatus::Waiting);
        assert_eq!(d.delegate_id, Some(GIVER));
        assert_eq!(d.delegate_type, Some(AdminKind::Giver));
        assert_eq!(d.amount_remaining, Amount(100));
    }

    #[test]
    fn payout_moves_to_paying_then_paid() {
        let mut p = projection();
        let a = donate(&mut p, MILESTONE, 100);
        let b = donate(&mut p, MILESTONE, 50);
        let pledge = p.donation(&a).unwrap().pledge_id;
        assert_eq!(p.donation(&b).unwrap().pledge_id, pledge);

        let call = LedgerCall::MultiWithdraw {
            milestone_id: MILESTONE,
            pledges: vec![PackedPledge::encode(PledgeAmount { pledge_id: pledge, amount: Amount(150) })],
        };
        let touched = p.apply(&confirmed(call, 4)).unwrap();
        assert_eq!(touched.len(), 2);
        assert!(p.donations().iter().all(|d| d.status == DonationStatus::Paying));

        let paid = p.confirm_payouts();
        assert_eq!(paid.len(), 2);
        assert!(p.donations().iter().all(|d| d.status == DonationStatus::Paid && d.amount_remaining.is_zero()));
    }

    #[test]
    fn cancel_campaign_unwinds_chains_and_cancels_commitments() {
        let mut p = projection();
        let parked = donate(&mut p, COMMUNITY, 100);
        transfer(&mut p, &parked, COMMUNITY, CAMPAIGN, 100).unwrap();
        let proposed = donate(&mut p, COMMUNITY, 30);
        transfer(&mut p, &proposed, COMMUNITY, MILESTONE, 30).unwrap();
        let committed = donate(&mut p, MILESTONE, 70);

        p.apply(&confirmed(LedgerCall::CancelProject { admin_id: CAMPAIGN }, 5)).unwrap();

        let d = p.donation(&parked).unwrap();
        assert_eq!(d.status, DonationStatus::Waiting);
        assert_eq!(d.delegate_id, Some(COMMUNITY));
        assert_eq!(d.delegate_chain, vec![COMMUNITY]);

        let d = p.donation(&proposed).unwrap();
        assert_eq!(d.status, DonationStatus::Waiting);
        assert_eq!(d.pending_project, None);

        assert_eq!(p.donation(&committed).unwrap().status, DonationStatus::Cancelled);
        assert!(matches!(
            p.apply(&confirmed(LedgerCall::CancelProject { admin_id: CAMPAIGN }, 6)),
            Err(ProjectionError::AlreadyCanceled(CAMPAIGN))
        ));
    }

    #[test]
    fn cancel_first_delegate_parks_at_giver() {
        let mut p = projection();
        let id = donate(&mut p, COMMUNITY, 100);
        p.apply(&confirmed(LedgerCall::CancelProject { admin_id: COMMUNITY }, 5)).unwrap();
        let d = p.donation(&id).unwrap();
        assert_eq!(d.delegate_id, Some(GIVER));
        assert_eq!(d.status, DonationStatus::Waiting);
    }

    #[test]
    fn donations_to_inactive_admin_revert() {
        let mut p = projection();
        p.registry_mut().cancel(COMMUNITY).unwrap();
        let call = LedgerCall::Donate {
            giver_id: GIVER,
            receiver_id: COMMUNITY,
            amount: Amount(1),
            token: token().address,
        };
        assert!(p.apply(&confirmed(call, 1)).is_err());
        assert!(p.donations().is_empty());
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn split_preserves_remaining(total in 2u128..10_000, cut in 1u128..10_000) {
                prop_assume!(cut < total);
                let mut p = projection();
                let id = donate(&mut p, COMMUNITY, total);
                transfer(&mut p, &id, COMMUNITY, CAMPAIGN, cut).unwrap();
                let sum = Amount::checked_sum(p.donations().iter().map(|d| d.amount_remaining));
                prop_assert_eq!(sum, Some(Amount(total)));
                for d in p.donations() {
                    prop_assert!(d.amount_remaining <= d.amount);
                    prop_assert!(d.check_invariants().is_ok());
                }
            }
        }
    }
}
