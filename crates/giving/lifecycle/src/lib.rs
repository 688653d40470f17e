//! Donation lifecycle rules.
//!
//! - `authz`: who may perform which action on which donation or admin
//! - `machine`: pre-flight checks that turn an action into a ledger call,
//!   an optimistic patch and the status the index is expected to show
//! - `projection`: how a confirmed ledger call changes the canonical
//!   donation set (used by the simulated ledger and index)

#![deny(unsafe_code)]

pub mod authz;
pub mod error;
pub mod machine;
pub mod projection;

pub use authz::{AuthorizationResolver, Subject};
pub use error::ProjectionError;
pub use machine::{DonatePlan, LifecycleMachine, Transition, DEFAULT_COMMIT_WINDOW_SECS};
pub use projection::{Confirmed, LedgerProjection, PledgeBook};
