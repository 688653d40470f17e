//! Reconciliation engine.
//!
//! Every user action follows the same path: validate locally, raise a
//! tentative event (which locks the donations it touches), sign and submit,
//! attach the hash, then wait for the receipt and for the index to reflect
//! it. Failures before a hash roll the event back; after a hash only the
//! index decides. After mining the index is polled with point reads, spaced
//! by the resubscribe backoff, until the action settles.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use giving_lifecycle::LifecycleMachine;
use giving_planner::{WithdrawalPlan, WithdrawalPlanner};
use giving_types::{
    ActionId, ActionKind, Address, AdminId, AdminRegistry, Amount, Clock, Donation, DonationAction, DonationFilter,
    DonationId, DonationPatch, DonationStatus, LedgerCall, Token, TxHash, TxReceipt, ValidationError,
};
use giving_wallet::TransactionSigner;

use crate::client::{DonationIndex, LedgerClient};
use crate::config::EngineConfig;
use crate::error::{SubmissionError, SyncError};
use crate::read_model::{ActionOutcome, ReadModel, TentativeEvent};

const OUTCOME_CHANNEL_CAPACITY: usize = 1000;

/// Handle on a submitted action.
#[derive(Debug)]
pub struct ActionReceipt {
    pub action_id: ActionId,
    pub tx_hash: TxHash,
    outcome: oneshot::Receiver<ActionOutcome>,
}

impl ActionReceipt {
    /// Wait until the index reflects the transaction, or it reverts.
    pub async fn confirmed(self) -> Result<TxReceipt, SyncError> {
        match self.outcome.await {
            Ok(outcome) => outcome.result,
            Err(_) => Err(SubmissionError::Dropped(self.tx_hash).into()),
        }
    }
}

/// Live, optimistic view of the donations matching a filter.
///
/// The pump task stops when the subscription is dropped.
pub struct DonationSubscription {
    filter: DonationFilter,
    rx: watch::Receiver<Vec<Donation>>,
    pump: JoinHandle<()>,
}

impl DonationSubscription {
    pub fn filter(&self) -> &DonationFilter {
        &self.filter
    }

    pub fn current(&self) -> Vec<Donation> {
        self.rx.borrow().clone()
    }

    /// Next published result set; `None` once the engine is gone.
    pub async fn changed(&mut self) -> Option<Vec<Donation>> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Wait for a result set satisfying `predicate`.
    pub async fn wait_for<F>(&mut self, mut predicate: F) -> Option<Vec<Donation>>
    where
        F: FnMut(&[Donation]) -> bool,
    {
        loop {
            {
                let current = self.rx.borrow_and_update();
                if predicate(&current) {
                    return Some(current.clone());
                }
            }
            self.rx.changed().await.ok()?;
        }
    }
}

impl Drop for DonationSubscription {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Progress of a batch withdrawal, reported as it happens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WithdrawalProgress {
    /// Reported before anything is submitted
    Planned {
        chunks: usize,
        donations: usize,
        total: Amount,
    },
    Submitted {
        chunk: usize,
        of: usize,
        tx_hash: TxHash,
    },
    Failed {
        chunk: usize,
        of: usize,
        error: SyncError,
    },
}

#[derive(Debug)]
pub struct ChunkReport {
    pub index: usize,
    pub donations: Vec<DonationId>,
    pub total: Amount,
    pub result: Result<ActionReceipt, SyncError>,
}

#[derive(Debug)]
pub struct WithdrawalReport {
    pub milestone: AdminId,
    pub chunks: Vec<ChunkReport>,
}

impl WithdrawalReport {
    pub fn submitted(&self) -> usize {
        self.chunks.iter().filter(|c| c.result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.chunks.len() - self.submitted()
    }

    /// Receipts of the submitted chunks, in order.
    pub fn into_receipts(self) -> Vec<ActionReceipt> {
        self.chunks.into_iter().filter_map(|c| c.result.ok()).collect()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub pending_actions: usize,
    pub subscriptions: usize,
    /// Canonical records held for subscriptions and in-flight actions
    pub cached_records: usize,
    pub outcome_listeners: usize,
}

/// What to read from the index after a receipt arrives.
#[derive(Clone, Debug)]
enum PointRead {
    Donations(Vec<DonationId>),
    Giver(Address),
    Nothing,
}

struct Subscription {
    id: u64,
    filter: DonationFilter,
    snapshot: Vec<Donation>,
    tx: watch::Sender<Vec<Donation>>,
}

#[derive(Default)]
struct Shared {
    model: ReadModel,
    subscriptions: Vec<Subscription>,
    waiters: HashMap<ActionId, oneshot::Sender<ActionOutcome>>,
    last_subscription: u64,
}

impl Shared {
    fn republish(&mut self) {
        self.subscriptions.retain(|s| !s.tx.is_closed());
        let held: HashSet<&DonationId> = self
            .subscriptions
            .iter()
            .flat_map(|s| s.snapshot.iter().map(|d| &d.id))
            .collect();
        self.model.retain_canonical(&held);
        for sub in &self.subscriptions {
            sub.tx.send_replace(self.model.visible(&sub.filter, &sub.snapshot));
        }
    }

    fn settle(&mut self, outcomes: Vec<ActionOutcome>, bus: &broadcast::Sender<ActionOutcome>) {
        for outcome in outcomes {
            match &outcome.result {
                Ok(receipt) => info!(
                    action_id = %outcome.action_id,
                    action = %outcome.action,
                    tx_hash = %receipt.tx_hash,
                    block = receipt.block_number,
                    "action confirmed"
                ),
                Err(e) => warn!(
                    action_id = %outcome.action_id,
                    action = %outcome.action,
                    error = %e,
                    "action failed"
                ),
            }
            if let Some(waiter) = self.waiters.remove(&outcome.action_id) {
                let _ = waiter.send(outcome.clone());
            }
            let _ = bus.send(outcome);
        }
    }
}

pub struct SyncEngine {
    ledger: Arc<dyn LedgerClient>,
    index: Arc<dyn DonationIndex>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    shared: Arc<Mutex<Shared>>,
    outcomes: broadcast::Sender<ActionOutcome>,
}

impl SyncEngine {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        index: Arc<dyn DonationIndex>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        let (outcomes, _) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);
        Self {
            ledger,
            index,
            clock,
            config,
            shared: Arc::new(Mutex::new(Shared::default())),
            outcomes,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Every resolved action, confirmed or failed.
    pub fn outcomes(&self) -> broadcast::Receiver<ActionOutcome> {
        self.outcomes.subscribe()
    }

    pub async fn stats(&self) -> EngineStats {
        let shared = self.shared.lock().await;
        EngineStats {
            pending_actions: shared.model.pending(),
            cached_records: shared.model.cached(),
            subscriptions: shared.subscriptions.iter().filter(|s| !s.tx.is_closed()).count(),
            outcome_listeners: self.outcomes.receiver_count(),
        }
    }

    /// Visible state of one donation, if a subscription or an in-flight
    /// action holds it.
    pub async fn view(&self, id: &DonationId) -> Option<Donation> {
        self.shared.lock().await.model.view(id)
    }

    pub async fn is_in_flight(&self, id: &DonationId) -> bool {
        self.shared.lock().await.model.is_locked(id)
    }

    fn machine<'a>(&self, registry: &'a AdminRegistry) -> LifecycleMachine<'a> {
        LifecycleMachine::new(registry).with_commit_window(self.config.commit_window())
    }

    /// Subscribe to the donations matching `filter`. The result set is
    /// republished on every index snapshot and every local optimistic change.
    /// Index failures are logged and the subscription is re-established
    /// after the configured backoff.
    pub async fn subscribe(&self, filter: DonationFilter) -> DonationSubscription {
        let (id, rx) = {
            let mut shared = self.shared.lock().await;
            shared.last_subscription += 1;
            let id = shared.last_subscription;
            let (tx, rx) = watch::channel(shared.model.visible(&filter, &[]));
            shared.subscriptions.push(Subscription {
                id,
                filter: filter.clone(),
                snapshot: Vec::new(),
                tx,
            });
            (id, rx)
        };

        let pump = tokio::spawn(pump(
            id,
            filter.clone(),
            self.index.clone(),
            self.shared.clone(),
            self.outcomes.clone(),
            self.config.resubscribe_backoff(),
        ));
        debug!(subscription = id, "subscribed to index");
        DonationSubscription { filter, rx, pump }
    }

    /// Donate `amount` of `token` from the signer's giver account.
    pub async fn donate(
        &self,
        signer: &dyn TransactionSigner,
        receiver: AdminId,
        amount: Amount,
        token: &Token,
    ) -> Result<ActionReceipt, SyncError> {
        let registry = self.index.admins().await?;
        let plan = self
            .machine(&registry)
            .plan_donate(signer.address(), receiver, amount, token, self.clock.now())?;

        let giver = plan.placeholder.giver_address.clone();
        let event = TentativeEvent::new(ActionKind::Donate, Vec::new())
            .with_placeholder(plan.placeholder)
            .expecting(plan.expected);
        self.submit(signer, event, plan.call, Vec::new(), PointRead::Giver(giver))
            .await
    }

    /// Delegate, commit, reject or refund an existing donation.
    pub async fn perform_action(
        &self,
        signer: &dyn TransactionSigner,
        donation_id: &DonationId,
        action: DonationAction,
    ) -> Result<ActionReceipt, SyncError> {
        if self.is_in_flight(donation_id).await {
            return Err(ValidationError::ActionInFlight(donation_id.clone()).into());
        }
        let donation = self
            .index
            .get(donation_id)
            .await?
            .ok_or_else(|| ValidationError::DonationNotFound(donation_id.clone()))?;
        let registry = self.index.admins().await?;
        let transition = self
            .machine(&registry)
            .plan(signer.address(), &donation, &action, self.clock.now())?;

        let subjects = vec![transition.donation_id.clone()];
        let event = TentativeEvent::new(transition.action, subjects.clone())
            .with_patch(transition.optimistic)
            .expecting(transition.expected);
        self.submit(
            signer,
            event,
            transition.call,
            subjects.clone(),
            PointRead::Donations(subjects),
        )
        .await
    }

    /// Cancel a campaign, milestone or delegate.
    pub async fn cancel_project(
        &self,
        signer: &dyn TransactionSigner,
        admin: AdminId,
    ) -> Result<ActionReceipt, SyncError> {
        let registry = self.index.admins().await?;
        let call = self
            .machine(&registry)
            .plan_cancel(signer.address(), admin, self.clock.now())?;
        let event = TentativeEvent::new(ActionKind::CancelProject, Vec::new());
        self.submit(signer, event, call, Vec::new(), PointRead::Nothing)
            .await
    }

    /// Plan a milestone withdrawal for `actor`. The plan's chunk count is
    /// known before anything is signed.
    pub async fn plan_withdrawal(
        &self,
        actor: &Address,
        milestone: AdminId,
        tokens: &[Address],
    ) -> Result<WithdrawalPlan, SyncError> {
        let registry = self.index.admins().await?;
        self.machine(&registry)
            .authorize_withdrawal(actor, milestone, self.clock.now())?;

        let filter = DonationFilter::new()
            .with_owner(milestone)
            .with_status(DonationStatus::Committed)
            .with_remaining();
        let donations = self.index.query(&filter).await?;

        let shared = self.shared.lock().await;
        let free = donations.iter().filter(|d| !shared.model.is_locked(&d.id));
        let plan = WithdrawalPlanner::new(self.config.donation_collect_count_limit)
            .plan(milestone, free, tokens)?;
        Ok(plan)
    }

    /// Submit every chunk of `plan`, strictly in order. A failed chunk does
    /// not stop the rest and submitted chunks are never rolled back.
    pub async fn execute_withdrawal<F>(
        &self,
        signer: &dyn TransactionSigner,
        plan: &WithdrawalPlan,
        mut on_progress: F,
    ) -> Result<WithdrawalReport, SyncError>
    where
        F: FnMut(WithdrawalProgress) + Send,
    {
        let registry = self.index.admins().await?;
        self.machine(&registry)
            .authorize_withdrawal(signer.address(), plan.milestone, self.clock.now())?;

        let of = plan.chunk_count();
        on_progress(WithdrawalProgress::Planned {
            chunks: of,
            donations: plan.donation_count(),
            total: plan.total,
        });
        info!(
            milestone = %plan.milestone,
            chunks = of,
            donations = plan.donation_count(),
            "Starting batch withdrawal"
        );

        let mut chunks = Vec::with_capacity(of);
        for chunk in &plan.chunks {
            let event = TentativeEvent::new(ActionKind::RequestWithdrawal, chunk.donation_ids.clone())
                .with_patch(DonationPatch::status(DonationStatus::Paying))
                .expecting(DonationStatus::Paying)
                .revealed_on_hash();
            let result = self
                .submit(
                    signer,
                    event,
                    chunk.call(plan.milestone),
                    chunk.donation_ids.clone(),
                    PointRead::Donations(chunk.donation_ids.clone()),
                )
                .await;

            match &result {
                Ok(receipt) => {
                    debug!(chunk = chunk.index + 1, of, tx_hash = %receipt.tx_hash, "Submitted withdrawal chunk");
                    on_progress(WithdrawalProgress::Submitted {
                        chunk: chunk.index,
                        of,
                        tx_hash: receipt.tx_hash.clone(),
                    });
                }
                Err(e) => {
                    warn!(chunk = chunk.index + 1, of, error = %e, "Withdrawal chunk failed");
                    on_progress(WithdrawalProgress::Failed {
                        chunk: chunk.index,
                        of,
                        error: e.clone(),
                    });
                }
            }
            chunks.push(ChunkReport {
                index: chunk.index,
                donations: chunk.donation_ids.clone(),
                total: chunk.total,
                result,
            });
        }

        let report = WithdrawalReport {
            milestone: plan.milestone,
            chunks,
        };
        info!(
            milestone = %plan.milestone,
            submitted = report.submitted(),
            failed = report.failed(),
            "Batch withdrawal submitted"
        );
        Ok(report)
    }

    /// Plan and execute a withdrawal of the signer's milestone.
    pub async fn request_withdrawal<F>(
        &self,
        signer: &dyn TransactionSigner,
        milestone: AdminId,
        tokens: &[Address],
        on_progress: F,
    ) -> Result<WithdrawalReport, SyncError>
    where
        F: FnMut(WithdrawalProgress) + Send,
    {
        let plan = self.plan_withdrawal(signer.address(), milestone, tokens).await?;
        self.execute_withdrawal(signer, &plan, on_progress).await
    }

    async fn submit(
        &self,
        signer: &dyn TransactionSigner,
        event: TentativeEvent,
        call: LedgerCall,
        reference: Vec<DonationId>,
        point_read: PointRead,
    ) -> Result<ActionReceipt, SyncError> {
        let action = event.action;
        let mirror_status = event.patch.status.unwrap_or(DonationStatus::Pending);
        let (waiter, outcome) = oneshot::channel();
        let action_id = {
            let mut shared = self.shared.lock().await;
            let action_id = shared.model.begin(event)?;
            shared.waiters.insert(action_id, waiter);
            shared.republish();
            action_id
        };

        let signed = match signer.sign_call(call, reference) {
            Ok(signed) => signed,
            Err(e) => {
                self.abort(&action_id).await;
                return Err(e.into());
            }
        };
        let pending = match self.ledger.submit(signed).await {
            Ok(pending) => pending,
            Err(e) => {
                warn!(action_id = %action_id, %action, error = %e, "Submission failed, rolling back");
                self.abort(&action_id).await;
                return Err(e.into());
            }
        };
        info!(action_id = %action_id, %action, tx_hash = %pending.hash, "Transaction broadcast");

        {
            let mut shared = self.shared.lock().await;
            shared.model.attach_hash(&action_id, pending.hash.clone());
            shared.republish();
        }
        if self.config.mirror_pending_to_index {
            if let PointRead::Donations(ids) = &point_read {
                self.mirror(ids, mirror_status, &pending.hash).await;
            }
        }

        self.spawn_watcher(action_id, pending.hash.clone(), pending.mined, point_read);
        Ok(ActionReceipt {
            action_id,
            tx_hash: pending.hash,
            outcome,
        })
    }

    async fn abort(&self, action_id: &ActionId) {
        let mut shared = self.shared.lock().await;
        shared.model.rollback(action_id);
        shared.waiters.remove(action_id);
        shared.republish();
    }

    /// Write the in-flight state to the index. A record that already carries
    /// the hash was mined and indexed first and is left as it is. Failures
    /// only cost the mirror.
    async fn mirror(&self, ids: &[DonationId], status: DonationStatus, hash: &TxHash) {
        let patch = DonationPatch::status(status).with_tx_hash(hash.clone());
        for id in ids {
            match self.index.patch_unless_hash(id, hash, &patch).await {
                Ok(true) => {}
                Ok(false) => debug!(donation = %id, tx_hash = %hash, "Index already reflects the transaction"),
                Err(e) => warn!(donation = %id, error = %SyncError::from(e), "Failed to mirror pending state"),
            }
        }
    }

    fn spawn_watcher(
        &self,
        action_id: ActionId,
        hash: TxHash,
        mined: oneshot::Receiver<TxReceipt>,
        point_read: PointRead,
    ) {
        let shared = self.shared.clone();
        let index = self.index.clone();
        let bus = self.outcomes.clone();
        let required = self.config.required_confirmations;
        let backoff = self.config.resubscribe_backoff();

        tokio::spawn(async move {
            let receipt = match mined.await {
                Ok(receipt) => receipt,
                Err(_) => {
                    let mut shared = shared.lock().await;
                    if let Some(event) = shared.model.rollback(&action_id) {
                        let outcome = ActionOutcome {
                            action_id,
                            action: event.action,
                            donations: event.subjects,
                            tx_hash: Some(hash.clone()),
                            result: Err(SubmissionError::Dropped(hash).into()),
                        };
                        shared.settle(vec![outcome], &bus);
                    }
                    shared.republish();
                    return;
                }
            };
            if receipt.succeeded() && receipt.confirmations < required {
                debug!(
                    tx_hash = %receipt.tx_hash,
                    confirmations = receipt.confirmations,
                    required,
                    "Mined below required confirmations"
                );
            }

            {
                let mut shared = shared.lock().await;
                let outcome = shared.model.mark_mined(&action_id, receipt);
                let settled = outcome.is_some();
                shared.settle(outcome.into_iter().collect(), &bus);
                shared.republish();
                if settled {
                    return;
                }
            }

            // Poll until the event settles, here or from a subscription
            // snapshot. With nobody left waiting the event stays open for the
            // next snapshot.
            let mut read = 0u32;
            loop {
                {
                    let shared = shared.lock().await;
                    if shared.model.event(&action_id).is_none() {
                        return;
                    }
                    let awaited = shared.waiters.get(&action_id).is_some_and(|w| !w.is_closed());
                    if !awaited && bus.receiver_count() == 0 {
                        debug!(action_id = %action_id, "Nobody awaits the outcome, leaving it to snapshots");
                        return;
                    }
                }
                read += 1;
                match read_back(index.as_ref(), &point_read).await {
                    Ok(records) => {
                        let mut shared = shared.lock().await;
                        let outcomes = shared.model.apply_point_read(&records);
                        shared.settle(outcomes, &bus);
                        shared.republish();
                        if shared.model.event(&action_id).is_none() {
                            return;
                        }
                        debug!(action_id = %action_id, read, "Index does not reflect the transaction yet");
                    }
                    Err(e) => warn!(action_id = %action_id, read, error = %e, "Point read after mining failed"),
                }
                tokio::time::sleep(backoff).await;
            }
        });
    }
}

async fn read_back(index: &dyn DonationIndex, point_read: &PointRead) -> Result<Vec<Donation>, SyncError> {
    match point_read {
        PointRead::Donations(ids) => {
            let mut records = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(record) = index.get(id).await? {
                    records.push(record);
                }
            }
            Ok(records)
        }
        PointRead::Giver(giver) => Ok(index.query(&DonationFilter::new().with_giver(giver.clone())).await?),
        PointRead::Nothing => Ok(Vec::new()),
    }
}

/// Feed index snapshots for one subscription into the read model until the
/// subscription goes away.
async fn pump(
    id: u64,
    filter: DonationFilter,
    index: Arc<dyn DonationIndex>,
    shared: Arc<Mutex<Shared>>,
    bus: broadcast::Sender<ActionOutcome>,
    backoff: Duration,
) {
    loop {
        match index.watch(filter.clone()).await {
            Ok(mut stream) => {
                while let Some(item) = stream.next().await {
                    let records = match item {
                        Ok(records) => records,
                        Err(e) => {
                            warn!(subscription = id, error = %SyncError::from(e), "Index subscription failed");
                            break;
                        }
                    };
                    let mut shared = shared.lock().await;
                    let outcomes = shared.model.apply_snapshot(&records);
                    match shared.subscriptions.iter_mut().find(|s| s.id == id) {
                        Some(sub) => sub.snapshot = records,
                        None => return,
                    }
                    shared.settle(outcomes, &bus);
                    shared.republish();
                }
            }
            Err(e) => warn!(subscription = id, error = %SyncError::from(e), "Index subscribe failed"),
        }

        if !shared.lock().await.subscriptions.iter().any(|s| s.id == id && !s.tx.is_closed()) {
            return;
        }
        debug!(subscription = id, backoff_ms = backoff.as_millis() as u64, "Resubscribing to index");
        tokio::time::sleep(backoff).await;
    }
}
