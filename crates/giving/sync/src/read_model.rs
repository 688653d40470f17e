//! Optimistic read model.
//!
//! Holds the last canonical record seen for every donation plus the tentative
//! events raised by in-flight actions. Visible state is canonical state with
//! the advisory patches of unresolved events laid on top. A canonical record
//! received after an event was raised supersedes that event's patch for the
//! record; the event itself stays (and keeps its donations locked) until it
//! resolves.
//!
//! Canonical records are only kept while a subscription snapshot or an
//! unresolved event refers to them.
//!
//! Resolution:
//! - a reverted receipt fails the event at once;
//! - a succeeded receipt confirms it as soon as the canonical records carry
//!   the transaction hash (or the expected status, checked against the first
//!   subscription snapshot received after mining).

use std::collections::{HashMap, HashSet};

use giving_types::{
    ActionId, ActionKind, Donation, DonationFilter, DonationId, DonationPatch, DonationStatus,
    InvariantViolation, TxHash, TxReceipt, UnsetField, ValidationError,
};
use tracing::{debug, trace};

use crate::error::SyncError;

/// Where an in-flight action stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Patch applied, waiting for a hash
    Submitting,
    /// Hash known, waiting to be mined
    Broadcast,
    /// Mined, waiting for the index to reflect it
    Mined,
}

/// An optimistic action not yet reconciled with the index.
#[derive(Clone, Debug)]
pub struct TentativeEvent {
    pub action_id: ActionId,
    pub action: ActionKind,
    /// Existing records the action was issued for; locked while in flight
    pub subjects: Vec<DonationId>,
    /// Local stand-in for a record the ledger has not created yet
    pub placeholder: Option<Donation>,
    pub patch: DonationPatch,
    pub expected: Option<DonationStatus>,
    pub tx_hash: Option<TxHash>,
    pub phase: Phase,
    reveal_on_hash: bool,
    superseded: HashSet<DonationId>,
    landed: bool,
}

impl TentativeEvent {
    pub fn new(action: ActionKind, subjects: Vec<DonationId>) -> Self {
        Self {
            action_id: ActionId::generate(),
            action,
            subjects,
            placeholder: None,
            patch: DonationPatch::new(),
            expected: None,
            tx_hash: None,
            phase: Phase::Submitting,
            reveal_on_hash: false,
            superseded: HashSet::new(),
            landed: false,
        }
    }

    pub fn with_patch(mut self, patch: DonationPatch) -> Self {
        self.patch = patch;
        self
    }

    pub fn expecting(mut self, status: DonationStatus) -> Self {
        self.expected = Some(status);
        self
    }

    pub fn with_placeholder(mut self, placeholder: Donation) -> Self {
        self.placeholder = Some(placeholder);
        self
    }

    /// Keep the patch hidden until the transaction hash is attached.
    pub fn revealed_on_hash(mut self) -> Self {
        self.reveal_on_hash = true;
        self
    }

    fn overlays(&self, id: &DonationId) -> bool {
        self.subjects.contains(id)
            && !self.superseded.contains(id)
            && (!self.reveal_on_hash || self.tx_hash.is_some())
    }

    /// Whether a canonical record shows this event's effect.
    fn reflected_in(&self, record: &Donation, by_status: bool) -> bool {
        // A PENDING record carrying the hash is a mirror of this event, not its effect.
        let hashed = self.tx_hash.is_some()
            && record.tx_hash == self.tx_hash
            && record.status != DonationStatus::Pending;
        hashed || (by_status && self.expected == Some(record.status))
    }
}

/// Final result of a tentative event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActionOutcome {
    pub action_id: ActionId,
    pub action: ActionKind,
    pub donations: Vec<DonationId>,
    pub tx_hash: Option<TxHash>,
    pub result: Result<TxReceipt, SyncError>,
}

impl ActionOutcome {
    pub fn is_confirmed(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug, Default)]
pub struct ReadModel {
    canonical: HashMap<DonationId, Donation>,
    events: Vec<TentativeEvent>,
    receipts: HashMap<ActionId, TxReceipt>,
    locks: HashMap<DonationId, ActionId>,
}

impl ReadModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn canonical(&self, id: &DonationId) -> Option<&Donation> {
        self.canonical.get(id)
    }

    /// Whether an unresolved action holds `id`.
    pub fn is_locked(&self, id: &DonationId) -> bool {
        self.locks.contains_key(id)
    }

    pub fn pending(&self) -> usize {
        self.events.len()
    }

    /// Number of canonical records held.
    pub fn cached(&self) -> usize {
        self.canonical.len()
    }

    /// Drop canonical records that neither `keep` nor an unresolved event
    /// refers to. Returns how many were dropped.
    pub fn retain_canonical(&mut self, keep: &HashSet<&DonationId>) -> usize {
        let before = self.canonical.len();
        let events = &self.events;
        self.canonical
            .retain(|id, _| keep.contains(id) || events.iter().any(|e| e.subjects.contains(id)));
        let dropped = before - self.canonical.len();
        if dropped > 0 {
            trace!(dropped, kept = self.canonical.len(), "evicted canonical records");
        }
        dropped
    }

    pub fn event(&self, action_id: &ActionId) -> Option<&TentativeEvent> {
        self.events.iter().find(|e| &e.action_id == action_id)
    }

    /// Record a new tentative event and lock its subjects.
    pub fn begin(&mut self, event: TentativeEvent) -> Result<ActionId, SyncError> {
        if !event.patch.is_advisory() {
            let id = event
                .subjects
                .first()
                .cloned()
                .or_else(|| event.placeholder.as_ref().map(|p| p.id.clone()))
                .unwrap_or_else(|| DonationId::new(event.action_id.to_string()));
            return Err(InvariantViolation::OptimisticPledgeMove(id).into());
        }
        if let Some(busy) = event.subjects.iter().find(|id| self.locks.contains_key(*id)) {
            return Err(ValidationError::ActionInFlight(busy.clone()).into());
        }

        let action_id = event.action_id;
        for id in &event.subjects {
            self.locks.insert(id.clone(), action_id);
        }
        trace!(action_id = %action_id, action = %event.action, subjects = event.subjects.len(), "tentative event raised");
        self.events.push(event);
        Ok(action_id)
    }

    /// Attach the transaction hash once the ledger accepted the call.
    pub fn attach_hash(&mut self, action_id: &ActionId, hash: TxHash) -> bool {
        let Some(event) = self.events.iter_mut().find(|e| &e.action_id == action_id) else {
            return false;
        };
        event.patch.unset.remove(&UnsetField::TxHash);
        event.patch.tx_hash = Some(hash.clone());
        if let Some(placeholder) = event.placeholder.as_mut() {
            placeholder.tx_hash = Some(hash.clone());
        }
        event.tx_hash = Some(hash);
        event.phase = Phase::Broadcast;
        true
    }

    /// Drop an event that never reached the ledger.
    pub fn rollback(&mut self, action_id: &ActionId) -> Option<TentativeEvent> {
        let pos = self.events.iter().position(|e| &e.action_id == action_id)?;
        let event = self.events.remove(pos);
        self.release(&event);
        debug!(action_id = %action_id, action = %event.action, "tentative event rolled back");
        Some(event)
    }

    /// Record the mined receipt. Resolves the event if the outcome is already
    /// known.
    pub fn mark_mined(&mut self, action_id: &ActionId, receipt: TxReceipt) -> Option<ActionOutcome> {
        let pos = self.events.iter().position(|e| &e.action_id == action_id)?;
        self.events[pos].phase = Phase::Mined;
        self.receipts.insert(*action_id, receipt.clone());

        let event = &self.events[pos];
        if !receipt.succeeded() {
            let reason = "ledger reverted the transaction".to_string();
            return Some(self.resolve(pos, Err(reason)));
        }
        if event.subjects.is_empty() && event.placeholder.is_none() {
            return Some(self.resolve(pos, Ok(())));
        }

        let records: Vec<&Donation> = self.canonical.values().collect();
        match evaluate(event, &records, false) {
            Some(Ok(())) => Some(self.resolve(pos, Ok(()))),
            _ => None,
        }
    }

    /// Take in a subscription snapshot. Every record replaces the canonical
    /// one and supersedes overlays raised before it; mined events whose
    /// records appear are resolved against them.
    pub fn apply_snapshot(&mut self, records: &[Donation]) -> Vec<ActionOutcome> {
        self.absorb(records, true)
    }

    /// Take in records fetched by a point read. Unlike a snapshot, a point
    /// read that does not yet show a mined transaction leaves it pending.
    pub fn apply_point_read(&mut self, records: &[Donation]) -> Vec<ActionOutcome> {
        self.absorb(records, false)
    }

    fn absorb(&mut self, records: &[Donation], strict: bool) -> Vec<ActionOutcome> {
        for record in records {
            self.canonical.insert(record.id.clone(), record.clone());
        }

        let mut decided = Vec::new();
        for (pos, event) in self.events.iter_mut().enumerate() {
            let present: Vec<&Donation> = records
                .iter()
                .filter(|r| event.subjects.contains(&r.id))
                .collect();
            for record in &present {
                event.superseded.insert(record.id.clone());
            }
            if event.placeholder.is_some()
                && event.tx_hash.is_some()
                && records.iter().any(|r| r.tx_hash == event.tx_hash)
            {
                event.landed = true;
            }

            if event.phase != Phase::Mined {
                continue;
            }
            let seen: Vec<&Donation> = if event.placeholder.is_some() {
                records.iter().filter(|r| r.tx_hash == event.tx_hash).collect()
            } else {
                present
            };
            if let Some(result) = evaluate(event, &seen, strict) {
                decided.push((pos, result));
            }
        }

        decided
            .into_iter()
            .rev()
            .map(|(pos, result)| self.resolve(pos, result))
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect()
    }

    fn resolve(&mut self, pos: usize, result: Result<(), String>) -> ActionOutcome {
        let event = self.events.remove(pos);
        let receipt = self.receipts.remove(&event.action_id);
        let reverted = |reason: String| SyncError::Reverted {
            tx_hash: event.tx_hash.clone().unwrap_or_else(|| TxHash(String::new())),
            reason,
        };

        let result = match (result, receipt) {
            (Ok(()), Some(receipt)) => Ok(receipt),
            (Ok(()), None) => Err(reverted("resolved without a receipt".into())),
            (Err(reason), _) => Err(reverted(reason)),
        };
        self.release(&event);
        let tx_hash = event.tx_hash.clone();
        debug!(
            action_id = %event.action_id,
            action = %event.action,
            confirmed = result.is_ok(),
            "tentative event resolved"
        );
        ActionOutcome {
            action_id: event.action_id,
            action: event.action,
            donations: event.subjects,
            tx_hash,
            result,
        }
    }

    fn release(&mut self, event: &TentativeEvent) {
        for id in &event.subjects {
            if self.locks.get(id) == Some(&event.action_id) {
                self.locks.remove(id);
            }
        }
    }

    /// The visible version of one canonical record.
    pub fn overlay(&self, record: &Donation) -> Donation {
        let mut view = record.clone();
        for event in self.events.iter().filter(|e| e.overlays(&record.id)) {
            if let Err(e) = event.patch.apply(&mut view) {
                debug!(donation = %record.id, error = %e, "skipped overlay");
            }
        }
        view
    }

    /// Visible version of a donation: canonical plus overlays.
    pub fn view(&self, id: &DonationId) -> Option<Donation> {
        if let Some(record) = self.canonical.get(id) {
            return Some(self.overlay(record));
        }
        self.events
            .iter()
            .filter(|e| !e.landed)
            .filter_map(|e| e.placeholder.as_ref())
            .find(|p| &p.id == id)
            .cloned()
    }

    /// The visible result set for a subscription whose latest snapshot is
    /// `snapshot`, including placeholders that match `filter`.
    pub fn visible(&self, filter: &DonationFilter, snapshot: &[Donation]) -> Vec<Donation> {
        let mut out: Vec<Donation> = snapshot.iter().map(|d| self.overlay(d)).collect();
        out.extend(
            self.events
                .iter()
                .filter(|e| !e.landed)
                .filter_map(|e| e.placeholder.as_ref())
                .filter(|p| filter.matches(p))
                .cloned(),
        );
        out
    }
}

/// `Some(Ok)` when `records` show the event's effect, `Some(Err)` when a
/// strict check finds they do not, `None` when there is nothing to decide on.
fn evaluate(event: &TentativeEvent, records: &[&Donation], strict: bool) -> Option<Result<(), String>> {
    if event.placeholder.is_some() {
        let landed = records.iter().any(|r| event.tx_hash.is_some() && r.tx_hash == event.tx_hash);
        return landed.then_some(Ok(()));
    }

    let relevant: Vec<&&Donation> = records
        .iter()
        .filter(|r| event.subjects.contains(&r.id))
        .collect();
    if relevant.is_empty() {
        return None;
    }
    if relevant.iter().all(|r| event.reflected_in(r, strict)) {
        return Some(Ok(()));
    }
    if !strict {
        return None;
    }
    let observed = relevant
        .iter()
        .find(|r| !event.reflected_in(r, true))
        .map(|r| r.status.to_string())
        .unwrap_or_default();
    let expected = event.expected.map(|s| s.to_string()).unwrap_or_else(|| "-".into());
    Some(Err(format!("index shows {observed}, expected {expected}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::fixtures::{donation, receipt};
    use giving_types::{AdminId, AdminKind, ReceiptStatus};

    fn commit_event(id: &str) -> TentativeEvent {
        TentativeEvent::new(ActionKind::Commit, vec![DonationId::new(id)])
            .with_patch(DonationPatch::status(DonationStatus::Pending).unset(UnsetField::TxHash))
            .expecting(DonationStatus::Committed)
    }

    #[test]
    fn second_action_on_locked_donation_is_refused() {
        let mut model = ReadModel::new();
        model.begin(commit_event("d1")).unwrap();

        let err = model.begin(commit_event("d1")).unwrap_err();
        assert_eq!(err, SyncError::Validation(ValidationError::ActionInFlight(DonationId::new("d1"))));
        assert!(model.is_locked(&DonationId::new("d1")));
        assert_eq!(model.pending(), 1);
    }

    #[test]
    fn overlay_may_not_move_pledges() {
        let mut model = ReadModel::new();
        let event = TentativeEvent::new(ActionKind::Delegate, vec![DonationId::new("d1")])
            .with_patch(DonationPatch::new().with_remaining(giving_types::Amount(1)));
        assert!(matches!(
            model.begin(event),
            Err(SyncError::Invariant(InvariantViolation::OptimisticPledgeMove(_)))
        ));
        assert!(!model.is_locked(&DonationId::new("d1")));
    }

    #[test]
    fn snapshot_replaces_optimistic_status() {
        let mut model = ReadModel::new();
        let record = donation("d1", DonationStatus::Waiting);
        model.apply_snapshot(std::slice::from_ref(&record));

        model.begin(commit_event("d1")).unwrap();
        assert_eq!(model.view(&record.id).unwrap().status, DonationStatus::Pending);

        // Index still shows the prior delegated state.
        model.apply_snapshot(std::slice::from_ref(&record));
        let view = model.view(&record.id).unwrap();
        assert_eq!(view.status, DonationStatus::Waiting);
        assert_eq!(view.delegate_id, Some(AdminId(2)));
        // Still locked until the transaction resolves.
        assert!(model.is_locked(&record.id));
    }

    #[test]
    fn rollback_releases_lock_and_overlay() {
        let mut model = ReadModel::new();
        let record = donation("d1", DonationStatus::Waiting);
        model.apply_snapshot(std::slice::from_ref(&record));
        let action = model.begin(commit_event("d1")).unwrap();

        assert!(model.rollback(&action).is_some());
        assert!(!model.is_locked(&record.id));
        assert_eq!(model.view(&record.id).unwrap(), record);
    }

    #[test]
    fn reverted_receipt_fails_immediately() {
        let mut model = ReadModel::new();
        model.apply_snapshot(&[donation("d1", DonationStatus::Waiting)]);
        let action = model.begin(commit_event("d1")).unwrap();
        let hash = TxHash("0xaa".into());
        model.attach_hash(&action, hash.clone());

        let outcome = model
            .mark_mined(&action, receipt(&hash, ReceiptStatus::Reverted))
            .unwrap();
        assert!(matches!(outcome.result, Err(SyncError::Reverted { ref tx_hash, .. }) if *tx_hash == hash));
        assert!(!model.is_locked(&DonationId::new("d1")));
    }

    #[test]
    fn mined_event_confirms_once_index_carries_hash() {
        let mut model = ReadModel::new();
        model.apply_snapshot(&[donation("d1", DonationStatus::Waiting)]);
        let action = model.begin(commit_event("d1")).unwrap();
        let hash = TxHash("0xbb".into());
        model.attach_hash(&action, hash.clone());

        assert_eq!(model.view(&DonationId::new("d1")).unwrap().tx_hash, Some(hash.clone()));
        assert!(model.mark_mined(&action, receipt(&hash, ReceiptStatus::Succeeded)).is_none());

        let mut committed = donation("d1", DonationStatus::Committed);
        committed.tx_hash = Some(hash.clone());
        let outcomes = model.apply_snapshot(&[committed]);
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].is_confirmed());
        assert_eq!(model.pending(), 0);
    }

    #[test]
    fn snapshot_after_mining_without_effect_is_reverted() {
        let mut model = ReadModel::new();
        let record = donation("d1", DonationStatus::Waiting);
        model.apply_snapshot(std::slice::from_ref(&record));
        let action = model.begin(commit_event("d1")).unwrap();
        let hash = TxHash("0xcc".into());
        model.attach_hash(&action, hash.clone());
        model.mark_mined(&action, receipt(&hash, ReceiptStatus::Succeeded));

        // A point read that has not caught up leaves the event pending.
        assert!(model.apply_point_read(std::slice::from_ref(&record)).is_empty());
        assert_eq!(model.pending(), 1);

        let outcomes = model.apply_snapshot(&[record]);
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0].result, Err(SyncError::Reverted { .. })));
    }

    #[test]
    fn placeholder_visible_until_record_lands() {
        let mut model = ReadModel::new();
        let mut placeholder = donation("local", DonationStatus::Pending);
        placeholder.owner_type = AdminKind::Giver;
        let filter = DonationFilter::new().with_giver(placeholder.giver_address.clone());

        let action = model
            .begin(TentativeEvent::new(ActionKind::Donate, Vec::new()).with_placeholder(placeholder.clone()))
            .unwrap();
        assert_eq!(model.visible(&filter, &[]).len(), 1);

        let hash = TxHash("0xdd".into());
        model.attach_hash(&action, hash.clone());
        model.mark_mined(&action, receipt(&hash, ReceiptStatus::Succeeded));

        let mut landed = donation("real", DonationStatus::Waiting);
        landed.tx_hash = Some(hash);
        let outcomes = model.apply_snapshot(std::slice::from_ref(&landed));
        assert!(outcomes[0].is_confirmed());

        let visible = model.visible(&filter, &[landed]);
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, DonationId::new("real"));
    }

    #[test]
    fn hidden_until_hash_when_requested() {
        let mut model = ReadModel::new();
        model.apply_snapshot(&[donation("d1", DonationStatus::Committed)]);
        let event = TentativeEvent::new(ActionKind::RequestWithdrawal, vec![DonationId::new("d1")])
            .with_patch(DonationPatch::status(DonationStatus::Paying))
            .expecting(DonationStatus::Paying)
            .revealed_on_hash();
        let action = model.begin(event).unwrap();
        assert_eq!(model.view(&DonationId::new("d1")).unwrap().status, DonationStatus::Committed);

        model.attach_hash(&action, TxHash("0xee".into()));
        assert_eq!(model.view(&DonationId::new("d1")).unwrap().status, DonationStatus::Paying);
    }

    #[test]
    fn unreferenced_records_are_evicted() {
        let mut model = ReadModel::new();
        model.apply_snapshot(&[
            donation("d1", DonationStatus::Waiting),
            donation("d2", DonationStatus::Waiting),
            donation("d3", DonationStatus::Committed),
        ]);
        let action = model.begin(commit_event("d1")).unwrap();

        let d2 = DonationId::new("d2");
        assert_eq!(model.retain_canonical(&HashSet::from([&d2])), 1);
        assert_eq!(model.cached(), 2);
        assert!(model.canonical(&DonationId::new("d3")).is_none());

        // Locked subjects stay until their event resolves.
        assert_eq!(model.retain_canonical(&HashSet::new()), 1);
        assert!(model.canonical(&DonationId::new("d1")).is_some());

        model.rollback(&action);
        assert_eq!(model.retain_canonical(&HashSet::new()), 1);
        assert_eq!(model.cached(), 0);
    }
}
