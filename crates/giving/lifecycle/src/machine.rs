//! Donation lifecycle state machine.
//!
//! Planning an action runs every local precondition (authorization, state,
//! amounts, target checks) and yields the ledger call to submit, the
//! optimistic patch to overlay on the visible record, and the status the
//! index should show once the call is confirmed. Nothing here touches the
//! ledger; a failed plan is a `ValidationError`.

use chrono::{DateTime, Duration, Utc};
use giving_types::{
    ActionKind, Address, AdminId, AdminKind, AdminRegistry, Amount, Donation, DonationAction,
    DonationId, DonationPatch, DonationStatus, LedgerCall, PledgeAdmin, PledgeId, Token,
    UnsetField, ValidationError, DEFAULT_REQUIRED_CONFIRMATIONS,
};
use tracing::debug;

use crate::authz::{AuthorizationResolver, Subject};

/// Veto window length: 3 days.
pub const DEFAULT_COMMIT_WINDOW_SECS: i64 = 3 * 24 * 60 * 60;

/// A planned action on an existing donation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    pub action: ActionKind,
    pub donation_id: DonationId,
    pub call: LedgerCall,
    /// Advisory overlay shown until the index catches up
    pub optimistic: DonationPatch,
    /// Status the canonical record should reach once confirmed
    pub expected: DonationStatus,
}

/// A planned donation: the call plus a local placeholder record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DonatePlan {
    pub call: LedgerCall,
    pub placeholder: Donation,
    pub expected: DonationStatus,
}

pub struct LifecycleMachine<'a> {
    registry: &'a AdminRegistry,
    commit_window: Duration,
}

impl<'a> LifecycleMachine<'a> {
    pub fn new(registry: &'a AdminRegistry) -> Self {
        Self {
            registry,
            commit_window: Duration::seconds(DEFAULT_COMMIT_WINDOW_SECS),
        }
    }

    pub fn with_commit_window(mut self, window: Duration) -> Self {
        self.commit_window = window;
        self
    }

    pub fn commit_window(&self) -> Duration {
        self.commit_window
    }

    fn authz(&self) -> AuthorizationResolver<'a> {
        AuthorizationResolver::new(self.registry)
    }

    /// Plan a new donation from `actor` to `receiver`.
    ///
    /// Confirmed donations to a delegate wait there; donations straight to a
    /// campaign or milestone are committed, since the giver picked the project.
    pub fn plan_donate(
        &self,
        actor: &Address,
        receiver: AdminId,
        amount: Amount,
        token: &Token,
        now: DateTime<Utc>,
    ) -> Result<DonatePlan, ValidationError> {
        let giver_id = self
            .registry
            .giver_id(actor)
            .ok_or_else(|| ValidationError::AdminNotOnLedger(actor.to_string()))?;
        self.authz()
            .authorize(actor, ActionKind::Donate, Subject::Admin(giver_id), now)?;

        if amount.is_zero() {
            return Err(ValidationError::ZeroAmount);
        }
        let target = self.registry.require_active(receiver)?;
        check_capacity(target, receiver, amount)?;

        let expected = match target.kind() {
            AdminKind::Delegate | AdminKind::Giver => DonationStatus::Waiting,
            AdminKind::Campaign | AdminKind::Milestone => DonationStatus::Committed,
        };

        let placeholder = Donation {
            id: DonationId::generate(),
            pledge_id: PledgeId(0),
            amount,
            amount_remaining: amount,
            token: token.clone(),
            giver_address: actor.clone(),
            giver_id,
            owner_id: giver_id,
            owner_type: AdminKind::Giver,
            delegate_id: None,
            delegate_type: None,
            delegate_chain: Vec::new(),
            pending_project: None,
            status: DonationStatus::Pending,
            tx_hash: None,
            confirmations: 0,
            required_confirmations: DEFAULT_REQUIRED_CONFIRMATIONS,
            commit_time: None,
            created_at: now,
        };

        debug!(giver = %giver_id, receiver = %receiver, amount = %amount, "planned donation");
        Ok(DonatePlan {
            call: LedgerCall::Donate {
                giver_id,
                receiver_id: receiver,
                amount,
                token: token.address.clone(),
            },
            placeholder,
            expected,
        })
    }

    /// Plan an action on an existing donation.
    pub fn plan(
        &self,
        actor: &Address,
        donation: &Donation,
        action: &DonationAction,
        now: DateTime<Utc>,
    ) -> Result<Transition, ValidationError> {
        match action {
            DonationAction::Delegate { target, amount } => {
                self.plan_delegate(actor, donation, *target, *amount, now)
            }
            DonationAction::Commit => self.plan_commit(actor, donation, now),
            DonationAction::Reject => self.plan_reject(actor, donation, now),
            DonationAction::Refund => self.plan_refund(actor, donation, now),
        }
    }

    /// Move (part of) a donation to `target`.
    ///
    /// Giver-owned funds sent to a target that requires giver veto become a
    /// proposal (`TO_APPROVE`, veto window opens at confirmation); other
    /// giver-owned moves park the funds at the new delegate (`WAITING`).
    /// Project-owned funds move ownership directly (`COMMITTED`).
    pub fn plan_delegate(
        &self,
        actor: &Address,
        donation: &Donation,
        target: AdminId,
        amount: Option<Amount>,
        now: DateTime<Utc>,
    ) -> Result<Transition, ValidationError> {
        let authz = self.authz();
        authz.authorize(actor, ActionKind::Delegate, Subject::Donation(donation), now)?;

        let giver_owned = donation.is_giver_owned();
        let movable = match donation.status {
            DonationStatus::Waiting => true,
            DonationStatus::Committed => !giver_owned,
            DonationStatus::Pending
            | DonationStatus::ToApprove
            | DonationStatus::Paying
            | DonationStatus::Paid
            | DonationStatus::Cancelled
            | DonationStatus::Rejected => false,
        };
        if !movable || !donation.has_remaining() {
            return Err(invalid_state(ActionKind::Delegate, donation));
        }

        let admin = self.registry.require_active(target)?;
        if donation.owner_id == target || donation.delegate_id == Some(target) {
            return Err(ValidationError::InvalidTarget {
                donation: donation.id.clone(),
                target,
                reason: "funds are already there".into(),
            });
        }
        if !giver_owned && admin.kind() == AdminKind::Delegate {
            return Err(ValidationError::InvalidTarget {
                donation: donation.id.clone(),
                target,
                reason: "committed funds can only move to another project".into(),
            });
        }

        let amount = match amount {
            Some(a) if a.is_zero() => return Err(ValidationError::ZeroAmount),
            Some(a) if a > donation.amount_remaining => {
                return Err(ValidationError::AmountExceedsAvailable {
                    requested: a,
                    available: donation.amount_remaining,
                })
            }
            Some(a) => a,
            // default: everything left, clipped to the target's headroom
            None => match admin.remaining_capacity() {
                Some(cap) if !cap.is_zero() => donation.amount_remaining.min(cap),
                _ => donation.amount_remaining,
            },
        };
        check_capacity(admin, target, amount)?;

        let sender = authz
            .acting_admin(actor, donation)
            .unwrap_or(donation.owner_id);
        let expected = if !giver_owned {
            DonationStatus::Committed
        } else if admin.requires_giver_veto() {
            DonationStatus::ToApprove
        } else {
            DonationStatus::Waiting
        };

        debug!(
            donation_id = %donation.id,
            sender = %sender,
            target = %target,
            amount = %amount,
            expected = %expected,
            "planned delegation"
        );
        Ok(Transition {
            action: ActionKind::Delegate,
            donation_id: donation.id.clone(),
            call: LedgerCall::Transfer {
                sender_id: sender,
                pledge_id: donation.pledge_id,
                amount,
                receiver_id: target,
            },
            optimistic: pending_patch(),
            expected,
        })
    }

    /// Accept the proposed project. Only the giver, only inside the window.
    pub fn plan_commit(
        &self,
        actor: &Address,
        donation: &Donation,
        now: DateTime<Utc>,
    ) -> Result<Transition, ValidationError> {
        self.authz()
            .authorize(actor, ActionKind::Commit, Subject::Donation(donation), now)?;
        let project = donation
            .pending_project
            .ok_or_else(|| invalid_state(ActionKind::Commit, donation))?;
        let kind = self
            .registry
            .kind_of(project)
            .ok_or(ValidationError::AdminNotFound(project))?;

        Ok(Transition {
            action: ActionKind::Commit,
            donation_id: donation.id.clone(),
            call: LedgerCall::Transfer {
                sender_id: donation.owner_id,
                pledge_id: donation.pledge_id,
                amount: donation.amount_remaining,
                receiver_id: project,
            },
            optimistic: pending_patch()
                .with_owner(project, kind)
                .unset(UnsetField::PendingProject)
                .unset(UnsetField::Delegate),
            expected: DonationStatus::Committed,
        })
    }

    /// Veto the proposed project; funds return to the current delegate.
    pub fn plan_reject(
        &self,
        actor: &Address,
        donation: &Donation,
        now: DateTime<Utc>,
    ) -> Result<Transition, ValidationError> {
        self.authz()
            .authorize(actor, ActionKind::Reject, Subject::Donation(donation), now)?;
        let back_to = donation
            .delegate_id
            .ok_or_else(|| invalid_state(ActionKind::Reject, donation))?;

        Ok(Transition {
            action: ActionKind::Reject,
            donation_id: donation.id.clone(),
            call: LedgerCall::Transfer {
                sender_id: donation.owner_id,
                pledge_id: donation.pledge_id,
                amount: donation.amount_remaining,
                receiver_id: back_to,
            },
            optimistic: pending_patch().unset(UnsetField::PendingProject),
            expected: DonationStatus::Waiting,
        })
    }

    /// Pull funds back to the giver. Allowed while parked at a delegate or
    /// campaign, or once the owning project was cancelled.
    pub fn plan_refund(
        &self,
        actor: &Address,
        donation: &Donation,
        now: DateTime<Utc>,
    ) -> Result<Transition, ValidationError> {
        self.authz()
            .authorize(actor, ActionKind::Refund, Subject::Donation(donation), now)?;

        let parked_at_delegate = donation.status == DonationStatus::Waiting
            && donation.is_giver_owned()
            && matches!(
                donation.delegate_type,
                Some(AdminKind::Delegate) | Some(AdminKind::Campaign)
            );
        let cancelled = donation.status == DonationStatus::Cancelled;
        if !(parked_at_delegate || cancelled) || !donation.has_remaining() {
            return Err(invalid_state(ActionKind::Refund, donation));
        }

        Ok(Transition {
            action: ActionKind::Refund,
            donation_id: donation.id.clone(),
            call: LedgerCall::Withdraw {
                pledge_id: donation.pledge_id,
                amount: donation.amount_remaining,
            },
            optimistic: pending_patch()
                .unset(UnsetField::Delegate)
                .unset(UnsetField::PendingProject),
            expected: DonationStatus::Waiting,
        })
    }

    /// Plan cancelling an admin (and, for a campaign, its milestones).
    pub fn plan_cancel(
        &self,
        actor: &Address,
        admin: AdminId,
        now: DateTime<Utc>,
    ) -> Result<LedgerCall, ValidationError> {
        self.authz()
            .authorize(actor, ActionKind::CancelProject, Subject::Admin(admin), now)?;
        if !self.registry.require(admin)?.is_active() {
            return Err(ValidationError::AdminInactive(admin));
        }
        Ok(LedgerCall::CancelProject { admin_id: admin })
    }

    /// Authorize a milestone withdrawal request. Planning the batches
    /// themselves is the planner's job.
    pub fn authorize_withdrawal(
        &self,
        actor: &Address,
        milestone: AdminId,
        now: DateTime<Utc>,
    ) -> Result<(), ValidationError> {
        self.authz()
            .authorize(actor, ActionKind::RequestWithdrawal, Subject::Admin(milestone), now)
    }
}

fn pending_patch() -> DonationPatch {
    DonationPatch::status(DonationStatus::Pending).unset(UnsetField::TxHash)
}

fn invalid_state(action: ActionKind, donation: &Donation) -> ValidationError {
    ValidationError::InvalidState {
        action,
        donation: donation.id.clone(),
        status: donation.status,
    }
}

fn check_capacity(admin: &PledgeAdmin, id: AdminId, amount: Amount) -> Result<(), ValidationError> {
    match admin.remaining_capacity() {
        Some(cap) if cap.is_zero() => Err(ValidationError::CapReached(id)),
        Some(cap) if amount > cap => Err(ValidationError::AmountExceedsAvailable {
            requested: amount,
            available: cap,
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::fixtures::*;

    #[test]
    fn donate_to_delegate_waits_and_to_project_commits() {
        let reg = registry();
        let machine = LifecycleMachine::new(&reg);

        let plan = machine.plan_donate(&giver(), COMMUNITY, Amount(100), &token(), now()).unwrap();
        assert_eq!(plan.expected, DonationStatus::Waiting);
        assert_eq!(plan.placeholder.status, DonationStatus::Pending);
        assert_eq!(plan.placeholder.giver_id, GIVER);
        assert!(matches!(plan.call, LedgerCall::Donate { receiver_id: COMMUNITY, .. }));

        let plan = machine.plan_donate(&giver(), MILESTONE, Amount(100), &token(), now()).unwrap();
        assert_eq!(plan.expected, DonationStatus::Committed);
    }

    #[test]
    fn donate_rejects_unknown_giver_zero_and_cap() {
        let reg = registry();
        let machine = LifecycleMachine::new(&reg);
        assert!(matches!(
            machine.plan_donate(&recipient(), COMMUNITY, Amount(1), &token(), now()),
            Err(ValidationError::AdminNotOnLedger(_))
        ));
        assert_eq!(
            machine.plan_donate(&giver(), COMMUNITY, Amount::ZERO, &token(), now()),
            Err(ValidationError::ZeroAmount)
        );
        assert_eq!(
            machine.plan_donate(&giver(), CAPPED, Amount(200), &token(), now()),
            Err(ValidationError::AmountExceedsAvailable {
                requested: Amount(200),
                available: Amount(150)
            })
        );
    }

    #[test]
    fn donate_to_cancelled_admin_is_rejected() {
        let mut reg = registry();
        reg.cancel(COMMUNITY).unwrap();
        let machine = LifecycleMachine::new(&reg);
        assert_eq!(
            machine.plan_donate(&giver(), COMMUNITY, Amount(1), &token(), now()),
            Err(ValidationError::AdminInactive(COMMUNITY))
        );
    }

    #[test]
    fn delegate_to_campaign_waits_and_to_milestone_needs_approval() {
        let reg = registry();
        let machine = LifecycleMachine::new(&reg);
        let d = waiting_at("d1", 100, COMMUNITY, AdminKind::Delegate);

        let t = machine.plan_delegate(&community_owner(), &d, CAMPAIGN, None, now()).unwrap();
        assert_eq!(t.expected, DonationStatus::Waiting);
        assert_eq!(
            t.call,
            LedgerCall::Transfer {
                sender_id: COMMUNITY,
                pledge_id: d.pledge_id,
                amount: Amount(100),
                receiver_id: CAMPAIGN
            }
        );
        assert_eq!(t.optimistic.status, Some(DonationStatus::Pending));
        assert!(t.optimistic.is_advisory());

        let t = machine.plan_delegate(&community_owner(), &d, MILESTONE, None, now()).unwrap();
        assert_eq!(t.expected, DonationStatus::ToApprove);
    }

    #[test]
    fn committed_funds_move_between_projects_directly() {
        let reg = registry();
        let machine = LifecycleMachine::new(&reg);
        let d = committed_to("d1", 100, CAMPAIGN, AdminKind::Campaign);

        let t = machine.plan_delegate(&campaign_owner(), &d, MILESTONE, None, now()).unwrap();
        assert_eq!(t.expected, DonationStatus::Committed);
        assert!(matches!(
            machine.plan_delegate(&campaign_owner(), &d, COMMUNITY, None, now()),
            Err(ValidationError::InvalidTarget { .. })
        ));
    }

    #[test]
    fn partial_delegation_amounts() {
        let reg = registry();
        let machine = LifecycleMachine::new(&reg);
        let d = waiting_at("d1", 100, COMMUNITY, AdminKind::Delegate);

        let t = machine
            .plan_delegate(&community_owner(), &d, CAMPAIGN, Some(Amount(40)), now())
            .unwrap();
        assert!(matches!(t.call, LedgerCall::Transfer { amount: Amount(40), .. }));

        assert_eq!(
            machine.plan_delegate(&community_owner(), &d, CAMPAIGN, Some(Amount::ZERO), now()),
            Err(ValidationError::ZeroAmount)
        );
        assert!(matches!(
            machine.plan_delegate(&community_owner(), &d, CAMPAIGN, Some(Amount(101)), now()),
            Err(ValidationError::AmountExceedsAvailable { .. })
        ));
    }

    #[test]
    fn capped_milestone_clips_default_and_rejects_when_full() {
        let mut reg = registry();
        let d = waiting_at("d1", 200, COMMUNITY, AdminKind::Delegate);
        {
            let machine = LifecycleMachine::new(&reg);
            let t = machine.plan_delegate(&community_owner(), &d, CAPPED, None, now()).unwrap();
            assert!(matches!(t.call, LedgerCall::Transfer { amount: Amount(150), .. }));
        }
        reg.add_balance(CAPPED, Amount(150));
        let machine = LifecycleMachine::new(&reg);
        assert_eq!(
            machine.plan_delegate(&community_owner(), &d, CAPPED, None, now()),
            Err(ValidationError::CapReached(CAPPED))
        );
    }

    #[test]
    fn delegate_rejects_same_target_and_bad_state() {
        let reg = registry();
        let machine = LifecycleMachine::new(&reg);
        let d = waiting_at("d1", 100, COMMUNITY, AdminKind::Delegate);
        assert!(matches!(
            machine.plan_delegate(&community_owner(), &d, COMMUNITY, None, now()),
            Err(ValidationError::InvalidTarget { .. })
        ));

        let mut pending = d.clone();
        pending.status = DonationStatus::Pending;
        assert!(matches!(
            machine.plan_delegate(&community_owner(), &pending, CAMPAIGN, None, now()),
            Err(ValidationError::InvalidState { .. })
        ));
    }

    #[test]
    fn commit_and_reject_inside_window() {
        let reg = registry();
        let machine = LifecycleMachine::new(&reg);
        let deadline = now() + machine.commit_window();
        let d = to_approve("d1", 100, deadline);

        let t = machine.plan_commit(&giver(), &d, now()).unwrap();
        assert_eq!(t.expected, DonationStatus::Committed);
        assert_eq!(t.optimistic.owner, Some((MILESTONE, AdminKind::Milestone)));
        assert!(t.optimistic.unset.contains(&UnsetField::PendingProject));
        assert!(matches!(t.call, LedgerCall::Transfer { sender_id: GIVER, receiver_id: MILESTONE, .. }));

        let t = machine.plan_reject(&giver(), &d, now()).unwrap();
        assert_eq!(t.expected, DonationStatus::Waiting);
        assert!(matches!(t.call, LedgerCall::Transfer { receiver_id: CAMPAIGN, .. }));
    }

    #[test]
    fn commit_after_window_fails_without_call() {
        let reg = registry();
        let machine = LifecycleMachine::new(&reg);
        let deadline = now() + machine.commit_window();
        let d = to_approve("d1", 100, deadline);
        assert!(matches!(
            machine.plan(&giver(), &d, &DonationAction::Commit, deadline),
            Err(ValidationError::VetoWindowClosed { .. })
        ));
        assert!(matches!(
            machine.plan(&giver(), &d, &DonationAction::Reject, deadline + Duration::seconds(1)),
            Err(ValidationError::VetoWindowClosed { .. })
        ));
    }

    #[test]
    fn refund_only_while_parked_or_cancelled() {
        let reg = registry();
        let machine = LifecycleMachine::new(&reg);

        let parked = waiting_at("d1", 100, COMMUNITY, AdminKind::Delegate);
        let t = machine.plan_refund(&giver(), &parked, now()).unwrap();
        assert_eq!(t.call, LedgerCall::Withdraw { pledge_id: parked.pledge_id, amount: Amount(100) });
        assert_eq!(t.expected, DonationStatus::Waiting);

        let committed = committed_to("d2", 100, MILESTONE, AdminKind::Milestone);
        assert!(matches!(
            machine.plan_refund(&giver(), &committed, now()),
            Err(ValidationError::InvalidState { .. })
        ));

        let mut cancelled = committed.clone();
        cancelled.status = DonationStatus::Cancelled;
        assert!(machine.plan_refund(&giver(), &cancelled, now()).is_ok());

        let at_giver = waiting_at("d3", 100, GIVER, AdminKind::Giver);
        assert!(machine.plan_refund(&giver(), &at_giver, now()).is_err());
    }

    #[test]
    fn cancel_requires_active_admin() {
        let mut reg = registry();
        {
            let machine = LifecycleMachine::new(&reg);
            assert_eq!(
                machine.plan_cancel(&campaign_reviewer(), CAMPAIGN, now()).unwrap(),
                LedgerCall::CancelProject { admin_id: CAMPAIGN }
            );
        }
        reg.cancel(CAMPAIGN).unwrap();
        let machine = LifecycleMachine::new(&reg);
        assert_eq!(
            machine.plan_cancel(&campaign_reviewer(), CAMPAIGN, now()),
            Err(ValidationError::AdminInactive(CAMPAIGN))
        );
    }
}
