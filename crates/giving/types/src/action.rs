//! Actions a user can take against donations and admins.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::AdminId;
use crate::token::Amount;

/// Every action gated by the authorization resolver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Donate,
    Delegate,
    Commit,
    Reject,
    Refund,
    RequestWithdrawal,
    CancelProject,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionKind::Donate => "donate",
            ActionKind::Delegate => "delegate",
            ActionKind::Commit => "commit",
            ActionKind::Reject => "reject",
            ActionKind::Refund => "refund",
            ActionKind::RequestWithdrawal => "request withdrawal",
            ActionKind::CancelProject => "cancel project",
        };
        f.write_str(s)
    }
}

/// An action on a single existing donation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DonationAction {
    /// Move the donation (or `amount` of it) to another admin.
    Delegate {
        target: AdminId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        amount: Option<Amount>,
    },
    /// Accept a proposed project inside the veto window.
    Commit,
    /// Veto a proposed project inside the veto window.
    Reject,
    /// Pull the funds back to the giver.
    Refund,
}

impl DonationAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            DonationAction::Delegate { .. } => ActionKind::Delegate,
            DonationAction::Commit => ActionKind::Commit,
            DonationAction::Reject => ActionKind::Reject,
            DonationAction::Refund => ActionKind::Refund,
        }
    }
}
