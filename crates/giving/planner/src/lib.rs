//! Batch withdrawal planning for milestones.
//!
//! A milestone's committed donations are grouped by pledge, encoded as
//! packed `(amount, pledgeId)` entries and cut into ledger-call-sized
//! chunks. The plan (and its chunk count) is known before anything is
//! submitted; submitting the chunks one after another is the sync engine's
//! job.

#![deny(unsafe_code)]

pub mod aggregate;
pub mod plan;

pub use aggregate::{aggregate_pledges, encode_entries};
pub use plan::{is_eligible, WithdrawalChunk, WithdrawalPlan, WithdrawalPlanner, DEFAULT_COLLECT_COUNT_LIMIT};
