//! In-process ledger and index, for simulations and tests.
//!
//! The ledger verifies each signed call, projects it onto its own canonical
//! donation set and writes the touched records to the index before the
//! receipt is delivered, so a live index read after a receipt reflects it.
//! Failure injection covers the submission, mining and index paths, and
//! point reads can be frozen to play a lagging index.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, info, warn};

use giving_lifecycle::{Confirmed, LedgerProjection};
use giving_types::{
    Address, AdminId, AdminRegistry, Clock, Donation, DonationFilter, DonationId, DonationPatch,
    InvariantViolation, PledgeAdmin, ReceiptStatus, Token, TxHash, TxReceipt,
};
use giving_wallet::SignedCall;

use crate::client::{DonationIndex, LedgerClient, PendingTransaction, SnapshotStream};
use crate::config::EngineConfig;
use crate::error::{IndexError, SubmissionError};

#[derive(Clone, Debug, Default)]
struct IndexState {
    donations: BTreeMap<DonationId, Donation>,
    admins: AdminRegistry,
    /// Bumped to drop every open watch stream
    faults: u64,
}

impl IndexState {
    fn select(&self, filter: &DonationFilter) -> Vec<Donation> {
        let mut out: Vec<Donation> = self
            .donations
            .values()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        out
    }
}

/// Donation index backed by a watch channel. Clones share state.
#[derive(Clone)]
pub struct InMemoryIndex {
    state: Arc<watch::Sender<IndexState>>,
    /// Copy served to point reads while frozen
    frozen: Arc<watch::Sender<Option<IndexState>>>,
    failing_patches: Arc<AtomicUsize>,
    failing_queries: Arc<AtomicUsize>,
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryIndex {
    pub fn new() -> Self {
        let (state, _) = watch::channel(IndexState::default());
        let (frozen, _) = watch::channel(None);
        Self {
            state: Arc::new(state),
            frozen: Arc::new(frozen),
            failing_patches: Arc::new(AtomicUsize::new(0)),
            failing_queries: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Insert or replace records.
    pub fn upsert(&self, records: impl IntoIterator<Item = Donation>) {
        let records: Vec<Donation> = records.into_iter().collect();
        if records.is_empty() {
            return;
        }
        self.state.send_modify(|state| {
            for record in records {
                state.donations.insert(record.id.clone(), record);
            }
        });
    }

    pub fn set_admins(&self, admins: AdminRegistry) {
        self.state.send_modify(|state| state.admins = admins);
    }

    pub fn donations(&self) -> Vec<Donation> {
        self.state.borrow().select(&DonationFilter::new())
    }

    /// End every open watch stream with an error.
    pub fn disconnect_watchers(&self) {
        self.state.send_modify(|state| state.faults += 1);
    }

    /// Serve `query`, `get` and `admins` from a copy of the current state
    /// until [`thaw_reads`](Self::thaw_reads). Writes and watch streams stay
    /// live.
    pub fn freeze_reads(&self) {
        let copy = self.state.borrow().clone();
        self.frozen.send_replace(Some(copy));
    }

    pub fn thaw_reads(&self) {
        self.frozen.send_replace(None);
    }

    fn read<R>(&self, f: impl FnOnce(&IndexState) -> R) -> R {
        match &*self.frozen.borrow() {
            Some(stale) => f(stale),
            None => f(&self.state.borrow()),
        }
    }

    pub fn fail_next_patches(&self, count: usize) {
        self.failing_patches.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_queries(&self, count: usize) {
        self.failing_queries.store(count, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn check_query(&self) -> Result<(), IndexError> {
        if Self::take_failure(&self.failing_queries) {
            return Err(IndexError::Unavailable("simulated query failure".into()));
        }
        Ok(())
    }

    fn apply_patch(&self, id: &DonationId, patch: &DonationPatch, unless: Option<&TxHash>) -> Result<bool, IndexError> {
        if Self::take_failure(&self.failing_patches) {
            return Err(IndexError::Unavailable("simulated patch failure".into()));
        }
        let mut result = Ok(false);
        self.state.send_if_modified(|state| match state.donations.get_mut(id) {
            None => {
                result = Err(IndexError::NotFound(id.clone()));
                false
            }
            Some(record) if unless.is_some() && record.tx_hash.as_ref() == unless => false,
            Some(record) => {
                let mut draft = record.clone();
                match patch.apply(&mut draft) {
                    Ok(()) => {
                        *record = draft;
                        result = Ok(true);
                        true
                    }
                    Err(e) => {
                        result = Err(IndexError::Rejected(e.to_string()));
                        false
                    }
                }
            }
        });
        result
    }
}

#[async_trait]
impl DonationIndex for InMemoryIndex {
    async fn query(&self, filter: &DonationFilter) -> Result<Vec<Donation>, IndexError> {
        self.check_query()?;
        Ok(self.read(|state| state.select(filter)))
    }

    async fn get(&self, id: &DonationId) -> Result<Option<Donation>, IndexError> {
        self.check_query()?;
        Ok(self.read(|state| state.donations.get(id).cloned()))
    }

    async fn watch(&self, filter: DonationFilter) -> Result<SnapshotStream, IndexError> {
        self.check_query()?;
        let rx = self.state.subscribe();
        let epoch = rx.borrow().faults;

        let stream = futures::stream::unfold(Some((rx, true)), move |cursor| {
            let filter = filter.clone();
            async move {
                let (mut rx, first) = cursor?;
                if !first && rx.changed().await.is_err() {
                    return None;
                }
                let item = {
                    let state = rx.borrow_and_update();
                    if state.faults > epoch {
                        Err(IndexError::Unavailable("watch connection dropped".into()))
                    } else {
                        Ok(state.select(&filter))
                    }
                };
                let next = item.is_ok().then_some((rx, false));
                Some((item, next))
            }
        });
        Ok(stream.boxed())
    }

    async fn patch(&self, id: &DonationId, patch: &DonationPatch) -> Result<(), IndexError> {
        self.apply_patch(id, patch, None).map(|_| ())
    }

    async fn patch_unless_hash(
        &self,
        id: &DonationId,
        tx_hash: &TxHash,
        patch: &DonationPatch,
    ) -> Result<bool, IndexError> {
        self.apply_patch(id, patch, Some(tx_hash))
    }

    async fn admins(&self) -> Result<AdminRegistry, IndexError> {
        self.check_query()?;
        Ok(self.read(|state| state.admins.clone()))
    }
}

struct HeldTransaction {
    call: SignedCall,
    hash: TxHash,
    notify: oneshot::Sender<TxReceipt>,
}

struct LedgerState {
    projection: LedgerProjection,
    last_admin: u64,
    block: u64,
    /// Confirmations a call carries in the block that mines it
    confirmations: u32,
    required_confirmations: u32,
    /// Mined transactions still short of the required depth
    shallow: Vec<(TxHash, u32)>,
    fail_submissions: usize,
    revert_next: usize,
    hold_mining: bool,
    held: Vec<HeldTransaction>,
    submitted: Vec<SignedCall>,
}

/// Single-node ledger that mines every accepted call at once unless mining
/// is held.
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
    index: InMemoryIndex,
    clock: Arc<dyn Clock>,
}

impl InMemoryLedger {
    pub fn new(index: InMemoryIndex, clock: Arc<dyn Clock>, config: &EngineConfig) -> Self {
        let projection = LedgerProjection::new(AdminRegistry::new())
            .with_commit_window(config.commit_window())
            .with_required_confirmations(config.required_confirmations);
        Self {
            state: Mutex::new(LedgerState {
                projection,
                last_admin: 0,
                block: 0,
                confirmations: config.required_confirmations,
                required_confirmations: config.required_confirmations,
                shallow: Vec::new(),
                fail_submissions: 0,
                revert_next: 0,
                hold_mining: false,
                held: Vec::new(),
                submitted: Vec::new(),
            }),
            index,
            clock,
        }
    }

    pub fn index(&self) -> &InMemoryIndex {
        &self.index
    }

    /// Add a giver; the ledger assigns the admin id.
    pub async fn register_giver(&self, address: Address) -> Result<AdminId, InvariantViolation> {
        let mut state = self.state.lock().await;
        let id = AdminId(state.last_admin + 1);
        state.projection.registry_mut().register_giver(id, address)?;
        state.last_admin = id.0;
        self.index.set_admins(state.projection.registry().clone());
        Ok(id)
    }

    /// Add a delegate, campaign or milestone; the ledger assigns the admin id.
    pub async fn register_admin(&self, mut admin: PledgeAdmin) -> Result<AdminId, InvariantViolation> {
        let mut state = self.state.lock().await;
        admin.assign_admin_id(AdminId(state.last_admin + 1))?;
        let id = state.projection.registry_mut().register(admin)?;
        state.last_admin = id.0;
        self.index.set_admins(state.projection.registry().clone());
        info!(admin = %id, "registered admin");
        Ok(id)
    }

    pub async fn register_token(&self, token: Token) {
        self.state.lock().await.projection.register_token(token);
    }

    /// Park accepted calls instead of mining them.
    pub async fn set_hold_mining(&self, hold: bool) {
        self.state.lock().await.hold_mining = hold;
    }

    /// Mine every parked call in submission order.
    pub async fn release_held(&self) -> usize {
        let mut state = self.state.lock().await;
        let held = std::mem::take(&mut state.held);
        let count = held.len();
        for tx in held {
            self.mine(&mut state, tx);
        }
        count
    }

    /// Refuse the next `count` submissions before a hash is produced.
    pub async fn fail_next_submissions(&self, count: usize) {
        self.state.lock().await.fail_submissions = count;
    }

    /// Revert the next `count` mined calls without touching state.
    pub async fn revert_next(&self, count: usize) {
        self.state.lock().await.revert_next = count;
    }

    /// Confirmations a call starts with when mined. Defaults to the required
    /// depth, so mined calls are final at once.
    pub async fn set_mining_confirmations(&self, confirmations: u32) {
        self.state.lock().await.confirmations = confirmations;
    }

    /// Mine `count` empty blocks. Every record produced by a shallow
    /// transaction gains the confirmations and is republished to the index.
    pub async fn advance_blocks(&self, count: u32) -> Vec<DonationId> {
        let mut state = self.state.lock().await;
        state.block += u64::from(count);
        let mut touched = Vec::new();
        for (hash, confirmations) in std::mem::take(&mut state.shallow) {
            let confirmations = confirmations.saturating_add(count);
            touched.extend(state.projection.set_confirmations(&hash, confirmations));
            if confirmations < state.required_confirmations {
                state.shallow.push((hash, confirmations));
            }
        }
        debug!(block = state.block, records = touched.len(), "advanced blocks");
        self.publish(&state, &touched);
        touched
    }

    /// Observe payout of every paying record.
    pub async fn confirm_payouts(&self) -> Vec<DonationId> {
        let mut state = self.state.lock().await;
        let paid = state.projection.confirm_payouts();
        self.publish(&state, &paid);
        paid
    }

    pub async fn submitted(&self) -> Vec<SignedCall> {
        self.state.lock().await.submitted.clone()
    }

    pub async fn donations(&self) -> Vec<Donation> {
        self.state.lock().await.projection.donations().to_vec()
    }

    pub async fn registry(&self) -> AdminRegistry {
        self.state.lock().await.projection.registry().clone()
    }

    fn mine(&self, state: &mut LedgerState, tx: HeldTransaction) {
        state.block += 1;
        let status = if state.revert_next > 0 {
            state.revert_next -= 1;
            ReceiptStatus::Reverted
        } else {
            let confirmed = Confirmed {
                call: tx.call.call,
                tx_hash: tx.hash.clone(),
                at: self.clock.now(),
                confirmations: state.confirmations,
                reference: tx.call.reference,
            };
            match state.projection.apply(&confirmed) {
                Ok(touched) => {
                    if state.confirmations < state.required_confirmations {
                        state.shallow.push((tx.hash.clone(), state.confirmations));
                    }
                    self.publish(state, &touched);
                    ReceiptStatus::Succeeded
                }
                Err(e) => {
                    warn!(tx_hash = %tx.hash, call = confirmed.call.name(), error = %e, "call reverted");
                    ReceiptStatus::Reverted
                }
            }
        };

        debug!(tx_hash = %tx.hash, block = state.block, ?status, "mined");
        let receipt = TxReceipt {
            tx_hash: tx.hash,
            block_number: state.block,
            status,
            confirmations: state.confirmations,
        };
        let _ = tx.notify.send(receipt);
    }

    fn publish(&self, state: &LedgerState, touched: &[DonationId]) {
        let records = touched
            .iter()
            .filter_map(|id| state.projection.donation(id))
            .cloned();
        self.index.upsert(records);
        self.index.set_admins(state.projection.registry().clone());
    }
}

#[async_trait]
impl LedgerClient for InMemoryLedger {
    async fn submit(&self, call: SignedCall) -> Result<PendingTransaction, SubmissionError> {
        call.verify()
            .map_err(|e| SubmissionError::Rejected(e.to_string()))?;
        let hash = call
            .tx_hash()
            .map_err(|e| SubmissionError::Rejected(e.to_string()))?;

        let mut state = self.state.lock().await;
        if state.fail_submissions > 0 {
            state.fail_submissions -= 1;
            return Err(SubmissionError::Unavailable("simulated outage".into()));
        }
        state.submitted.push(call.clone());

        let (notify, mined) = oneshot::channel();
        let tx = HeldTransaction {
            call,
            hash: hash.clone(),
            notify,
        };
        if state.hold_mining {
            state.held.push(tx);
        } else {
            self.mine(&mut state, tx);
        }
        Ok(PendingTransaction { hash, mined })
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::donation;
    use super::*;
    use giving_types::DonationStatus;

    #[tokio::test]
    async fn watch_emits_current_then_changes() {
        let index = InMemoryIndex::new();
        index.upsert([donation("d1", DonationStatus::Waiting)]);

        let mut stream = index
            .watch(DonationFilter::new().with_status(DonationStatus::Waiting))
            .await
            .unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap().len(), 1);

        index.upsert([donation("d2", DonationStatus::Waiting)]);
        assert_eq!(stream.next().await.unwrap().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn disconnect_ends_streams_with_error() {
        let index = InMemoryIndex::new();
        let mut stream = index.watch(DonationFilter::new()).await.unwrap();
        stream.next().await.unwrap().unwrap();

        index.disconnect_watchers();
        assert!(matches!(stream.next().await, Some(Err(IndexError::Unavailable(_)))));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn patch_applies_and_refuses_growth() {
        let index = InMemoryIndex::new();
        let record = donation("d1", DonationStatus::Committed);
        index.upsert([record.clone()]);

        index
            .patch(&record.id, &DonationPatch::status(DonationStatus::Paying))
            .await
            .unwrap();
        assert_eq!(index.get(&record.id).await.unwrap().unwrap().status, DonationStatus::Paying);

        let grow = DonationPatch::new().with_remaining(giving_types::Amount(1_000));
        assert!(matches!(index.patch(&record.id, &grow).await, Err(IndexError::Rejected(_))));
        assert!(matches!(
            index.patch(&DonationId::new("nope"), &grow).await,
            Err(IndexError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn conditional_patch_leaves_mined_records_alone() {
        let index = InMemoryIndex::new();
        let hash = TxHash("0xaa".into());
        let mut mined = donation("d1", DonationStatus::Committed);
        mined.tx_hash = Some(hash.clone());
        index.upsert([mined.clone(), donation("d2", DonationStatus::Waiting)]);

        let pending = DonationPatch::status(DonationStatus::Pending).with_tx_hash(hash.clone());
        assert!(!index.patch_unless_hash(&mined.id, &hash, &pending).await.unwrap());
        assert_eq!(index.get(&mined.id).await.unwrap().unwrap(), mined);

        let other = DonationId::new("d2");
        assert!(index.patch_unless_hash(&other, &hash, &pending).await.unwrap());
        let patched = index.get(&other).await.unwrap().unwrap();
        assert_eq!(patched.status, DonationStatus::Pending);
        assert_eq!(patched.tx_hash, Some(hash));
    }

    #[tokio::test]
    async fn frozen_reads_serve_the_old_copy() {
        let index = InMemoryIndex::new();
        let record = donation("d1", DonationStatus::Committed);
        index.upsert([record.clone()]);
        let mut stream = index.watch(DonationFilter::new()).await.unwrap();
        stream.next().await.unwrap().unwrap();

        index.freeze_reads();
        index.upsert([donation("d1", DonationStatus::Paying)]);
        assert_eq!(index.get(&record.id).await.unwrap().unwrap().status, DonationStatus::Committed);
        assert_eq!(
            index.query(&DonationFilter::new()).await.unwrap()[0].status,
            DonationStatus::Committed
        );
        // Streams stay live.
        assert_eq!(stream.next().await.unwrap().unwrap()[0].status, DonationStatus::Paying);

        index.thaw_reads();
        assert_eq!(index.get(&record.id).await.unwrap().unwrap().status, DonationStatus::Paying);
    }

    #[tokio::test]
    async fn shallow_transactions_deepen_with_new_blocks() {
        let clock: Arc<dyn Clock> = Arc::new(giving_types::SystemClock);
        let index = InMemoryIndex::new();
        let ledger = InMemoryLedger::new(index.clone(), clock, &EngineConfig::default());
        ledger.set_mining_confirmations(1).await;

        // Nothing mined yet.
        assert!(ledger.advance_blocks(3).await.is_empty());
        assert!(ledger.state.lock().await.shallow.is_empty());

        ledger.state.lock().await.shallow.push((TxHash("0xbb".into()), 1));
        ledger.advance_blocks(2).await;
        assert_eq!(ledger.state.lock().await.shallow, vec![(TxHash("0xbb".into()), 3)]);
        ledger.advance_blocks(3).await;
        assert!(ledger.state.lock().await.shallow.is_empty());
    }
}
