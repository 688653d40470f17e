//! Authorization resolver: `(action, subject, actor) -> allowed | denied`.
//!
//! | action | authorized actor |
//! |---|---|
//! | donate | any registered giver, for themselves |
//! | delegate | controller of the current owner, or of the current delegate |
//! | commit / reject | the giver, inside the veto window |
//! | request withdrawal | the milestone's recipient |
//! | cancel project | the admin's reviewer or owner |
//! | refund | the giver |
//!
//! State preconditions beyond the actor (e.g. "parked at a delegate" for a
//! refund) belong to the state machine. The veto window is the exception: it
//! is part of who may act, so it is checked here.

use chrono::{DateTime, Utc};
use giving_types::{
    ActionKind, Address, AdminId, AdminKind, AdminRegistry, Donation, DonationStatus,
    PledgeAdmin, ValidationError,
};

/// What an action targets.
#[derive(Clone, Copy, Debug)]
pub enum Subject<'a> {
    Donation(&'a Donation),
    Admin(AdminId),
}

impl Subject<'_> {
    fn describe(&self) -> String {
        match self {
            Subject::Donation(d) => format!("donation {}", d.id),
            Subject::Admin(id) => format!("admin {id}"),
        }
    }
}

pub struct AuthorizationResolver<'a> {
    registry: &'a AdminRegistry,
}

impl<'a> AuthorizationResolver<'a> {
    pub fn new(registry: &'a AdminRegistry) -> Self {
        Self { registry }
    }

    /// Allow or deny. A denial never reaches the ledger.
    pub fn authorize(
        &self,
        actor: &Address,
        action: ActionKind,
        subject: Subject<'_>,
        now: DateTime<Utc>,
    ) -> Result<(), ValidationError> {
        let allowed = match (action, subject) {
            (ActionKind::Delegate, Subject::Donation(d)) => self.controls_owner_or_delegate(actor, d),
            (ActionKind::Commit | ActionKind::Reject, Subject::Donation(d)) => {
                if &d.giver_address != actor {
                    false
                } else {
                    return self.check_veto_window(action, d, now);
                }
            }
            (ActionKind::Refund, Subject::Donation(d)) => &d.giver_address == actor,
            (ActionKind::Donate, Subject::Admin(giver)) => {
                self.registry.giver_address(giver) == Some(actor)
            }
            (ActionKind::RequestWithdrawal, Subject::Admin(id)) => {
                let admin = self.registry.require(id)?;
                if admin.kind() != AdminKind::Milestone {
                    return Err(ValidationError::WrongAdminKind {
                        admin: id,
                        expected: AdminKind::Milestone,
                        actual: admin.kind(),
                    });
                }
                admin.is_recipient(actor)
            }
            (ActionKind::CancelProject, Subject::Admin(id)) => {
                let admin: &PledgeAdmin = self.registry.require(id)?;
                admin.is_reviewer(actor) || admin.is_owner(actor)
            }
            (
                ActionKind::Delegate | ActionKind::Commit | ActionKind::Reject | ActionKind::Refund,
                Subject::Admin(_),
            )
            | (
                ActionKind::Donate | ActionKind::RequestWithdrawal | ActionKind::CancelProject,
                Subject::Donation(_),
            ) => false,
        };

        if allowed {
            Ok(())
        } else {
            Err(ValidationError::Unauthorized {
                action,
                actor: actor.clone(),
                subject: subject.describe(),
            })
        }
    }

    /// Admin id the actor would act as when delegating `donation`: the
    /// current delegate if they control it, else the owner.
    pub fn acting_admin(&self, actor: &Address, donation: &Donation) -> Option<AdminId> {
        if let Some(delegate) = donation.delegate_id {
            if self.registry.controller(delegate) == Some(actor) {
                return Some(delegate);
            }
        }
        (self.registry.controller(donation.owner_id) == Some(actor)).then_some(donation.owner_id)
    }

    fn controls_owner_or_delegate(&self, actor: &Address, donation: &Donation) -> bool {
        self.acting_admin(actor, donation).is_some()
    }

    fn check_veto_window(
        &self,
        action: ActionKind,
        donation: &Donation,
        now: DateTime<Utc>,
    ) -> Result<(), ValidationError> {
        if donation.status != DonationStatus::ToApprove || donation.pending_project.is_none() {
            return Err(ValidationError::InvalidState {
                action,
                donation: donation.id.clone(),
                status: donation.status,
            });
        }
        match donation.commit_time {
            Some(deadline) if now < deadline => Ok(()),
            Some(deadline) => Err(ValidationError::VetoWindowClosed {
                donation: donation.id.clone(),
                deadline,
            }),
            None => Err(ValidationError::InvalidState {
                action,
                donation: donation.id.clone(),
                status: donation.status,
            }),
        }
    }
}
