//! Seams to the two external systems: the ledger that orders and mines
//! calls, and the off-chain index that serves donation records.

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::oneshot;

use giving_types::{AdminRegistry, Donation, DonationFilter, DonationId, DonationPatch, TxHash, TxReceipt};
use giving_wallet::SignedCall;

use crate::error::{IndexError, SubmissionError};

/// A broadcast transaction. `mined` resolves once with the receipt.
#[derive(Debug)]
pub struct PendingTransaction {
    pub hash: TxHash,
    pub mined: oneshot::Receiver<TxReceipt>,
}

/// Ledger client.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Submit a signed call. Resolves as soon as the hash is known; an error
    /// means the ledger never accepted the transaction.
    async fn submit(&self, call: SignedCall) -> Result<PendingTransaction, SubmissionError>;
}

/// Live snapshot stream. Each item replaces the previous one.
pub type SnapshotStream = BoxStream<'static, Result<Vec<Donation>, IndexError>>;

/// Off-chain donation index.
#[async_trait]
pub trait DonationIndex: Send + Sync {
    async fn query(&self, filter: &DonationFilter) -> Result<Vec<Donation>, IndexError>;

    async fn get(&self, id: &DonationId) -> Result<Option<Donation>, IndexError>;

    /// Subscribe to `filter`. The first item is the current result set.
    async fn watch(&self, filter: DonationFilter) -> Result<SnapshotStream, IndexError>;

    async fn patch(&self, id: &DonationId, patch: &DonationPatch) -> Result<(), IndexError>;

    /// Patch `id` unless the stored record already carries `tx_hash`, as one
    /// step on the index side. Returns whether the patch was applied.
    async fn patch_unless_hash(
        &self,
        id: &DonationId,
        tx_hash: &TxHash,
        patch: &DonationPatch,
    ) -> Result<bool, IndexError>;

    /// Admin profiles as last indexed from the ledger.
    async fn admins(&self) -> Result<AdminRegistry, IndexError>;
}
