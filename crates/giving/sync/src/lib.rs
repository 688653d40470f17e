//! Optimistic read model and reconciliation engine.
//!
//! Two external systems own the truth: the ledger, which orders and mines
//! calls, and the off-chain index, which projects mined calls into donation
//! records. [`SyncEngine`] validates actions locally, submits them, shows
//! their expected effect immediately and then lets the index snapshots take
//! over.
//!
//! # Example
//!
//! ```ignore
//! let engine = SyncEngine::new(ledger, index, clock, EngineConfig::default());
//! let mut waiting = engine.subscribe(DonationFilter::new().with_delegate(community)).await;
//! let receipt = engine
//!     .perform_action(&session, &donation_id, DonationAction::Delegate { target: milestone, amount: None })
//!     .await?;
//! receipt.confirmed().await?;
//! ```

#![deny(unsafe_code)]

pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod memory;
pub mod read_model;

pub use client::{DonationIndex, LedgerClient, PendingTransaction, SnapshotStream};
pub use config::EngineConfig;
pub use engine::{
    ActionReceipt, ChunkReport, DonationSubscription, EngineStats, SyncEngine, WithdrawalProgress,
    WithdrawalReport,
};
pub use error::{IndexError, SubmissionError, SyncError};
pub use memory::{InMemoryIndex, InMemoryLedger};
pub use read_model::{ActionOutcome, Phase, ReadModel, TentativeEvent};
