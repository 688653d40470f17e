use giving_types::{
    Address, AdminId, AdminKind, Amount, Donation, DonationId, DonationStatus, LedgerCall,
    PackedPledge, PledgeAmount, ValidationError,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::aggregate::{aggregate_pledges, encode_entries};

/// Donations that can be paid out in one multi-withdraw call.
pub const DEFAULT_COLLECT_COUNT_LIMIT: usize = 50;

/// Committed to `milestone`, with funds left.
pub fn is_eligible(donation: &Donation, milestone: AdminId) -> bool {
    donation.status == DonationStatus::Committed
        && donation.owner_id == milestone
        && donation.owner_type == AdminKind::Milestone
        && donation.has_remaining()
}

/// One multi-withdraw ledger call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalChunk {
    /// Zero-based submission order
    pub index: usize,
    pub token: Address,
    /// Records paid by this chunk
    pub donation_ids: Vec<DonationId>,
    /// Per-pledge sums, in first-seen order
    pub entries: Vec<PledgeAmount>,
    pub total: Amount,
}

impl WithdrawalChunk {
    pub fn packed(&self) -> Vec<PackedPledge> {
        encode_entries(&self.entries)
    }

    pub fn call(&self, milestone: AdminId) -> LedgerCall {
        LedgerCall::MultiWithdraw {
            milestone_id: milestone,
            pledges: self.packed(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalPlan {
    pub milestone: AdminId,
    pub chunks: Vec<WithdrawalChunk>,
    pub total: Amount,
}

impl WithdrawalPlan {
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn donation_count(&self) -> usize {
        self.chunks.iter().map(|c| c.donation_ids.len()).sum()
    }
}

/// Cuts eligible donations into chunks of at most `limit` donations, then
/// aggregates each chunk by pledge, so no chunk carries more than `limit`
/// packed entries either. Donations in different tokens never share a chunk.
#[derive(Clone, Debug)]
pub struct WithdrawalPlanner {
    limit: usize,
}

impl Default for WithdrawalPlanner {
    fn default() -> Self {
        Self::new(DEFAULT_COLLECT_COUNT_LIMIT)
    }
}

impl WithdrawalPlanner {
    pub fn new(limit: usize) -> Self {
        Self { limit: limit.max(1) }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Plan a withdrawal. `tokens` restricts the payout to some tokens; empty
    /// means all of them.
    pub fn plan<'a>(
        &self,
        milestone: AdminId,
        donations: impl IntoIterator<Item = &'a Donation>,
        tokens: &[Address],
    ) -> Result<WithdrawalPlan, ValidationError> {
        let mut by_token: Vec<(Address, Vec<&Donation>)> = Vec::new();
        for donation in donations {
            if !is_eligible(donation, milestone) {
                continue;
            }
            let token = &donation.token.address;
            if !tokens.is_empty() && !tokens.contains(token) {
                continue;
            }
            match by_token.iter_mut().find(|(t, _)| t == token) {
                Some((_, group)) => group.push(donation),
                None => by_token.push((token.clone(), vec![donation])),
            }
        }
        if by_token.is_empty() {
            return Err(ValidationError::NoFunds(milestone));
        }

        let mut chunks = Vec::new();
        for (token, group) in by_token {
            for batch in group.chunks(self.limit) {
                let overflow = || ValidationError::AmountOverflow(milestone);
                let entries = aggregate_pledges(batch.iter().copied()).ok_or_else(overflow)?;
                let total = Amount::checked_sum(entries.iter().map(|e| e.amount)).ok_or_else(overflow)?;
                chunks.push(WithdrawalChunk {
                    index: chunks.len(),
                    token: token.clone(),
                    donation_ids: batch.iter().map(|d| d.id.clone()).collect(),
                    entries,
                    total,
                });
            }
        }
        let total = Amount::checked_sum(chunks.iter().map(|c| c.total))
            .ok_or(ValidationError::AmountOverflow(milestone))?;

        let plan = WithdrawalPlan {
            milestone,
            chunks,
            total,
        };
        info!(
            milestone = %milestone,
            chunks = plan.chunk_count(),
            donations = plan.donation_count(),
            total = %plan.total,
            "planned withdrawal"
        );
        Ok(plan)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::DateTime;
    use giving_types::{PledgeId, Token, DEFAULT_REQUIRED_CONFIRMATIONS};

    pub const MILESTONE: AdminId = AdminId(4);

    fn eth() -> Token {
        Token::new("ETH", 18, Address::from_bytes([0xee; 20]))
    }

    fn dai() -> Token {
        Token::new("DAI", 18, Address::from_bytes([0xda; 20]))
    }

    pub fn committed(pledge: u64, amount: u128) -> Donation {
        Donation {
            id: DonationId::generate(),
            pledge_id: PledgeId(pledge),
            amount: Amount(amount),
            amount_remaining: Amount(amount),
            token: eth(),
            giver_address: Address::from_bytes([1; 20]),
            giver_id: AdminId(1),
            owner_id: MILESTONE,
            owner_type: AdminKind::Milestone,
            delegate_id: None,
            delegate_type: None,
            delegate_chain: Vec::new(),
            pending_project: None,
            status: DonationStatus::Committed,
            tx_hash: None,
            confirmations: 6,
            required_confirmations: DEFAULT_REQUIRED_CONFIRMATIONS,
            commit_time: None,
            created_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        }
    }

    #[test]
    fn one_hundred_twenty_five_donations_make_three_chunks() {
        let donations: Vec<_> = (0..125).map(|_| committed(1, 10)).collect();
        let plan = WithdrawalPlanner::new(50).plan(MILESTONE, &donations, &[]).unwrap();

        let sizes: Vec<usize> = plan.chunks.iter().map(|c| c.donation_ids.len()).collect();
        assert_eq!(sizes, vec![50, 50, 25]);
        assert_eq!(plan.chunk_count(), 3);
        assert_eq!(plan.total, Amount(1_250));
        assert_eq!(Amount::checked_sum(plan.chunks.iter().map(|c| c.total)), Some(Amount(1_250)));
        // all share one pledge, so each chunk carries a single entry
        assert!(plan.chunks.iter().all(|c| c.entries.len() == 1));
        assert_eq!(plan.chunks[2].entries[0].amount, Amount(250));
    }

    #[test]
    fn no_eligible_donations_is_no_funds() {
        let mut d = committed(1, 10);
        d.status = DonationStatus::Paying;
        let mut spent = committed(1, 10);
        spent.amount_remaining = Amount::ZERO;
        assert_eq!(
            WithdrawalPlanner::default().plan(MILESTONE, &[d, spent], &[]),
            Err(ValidationError::NoFunds(MILESTONE))
        );
        assert_eq!(
            WithdrawalPlanner::default().plan(MILESTONE, &[], &[]),
            Err(ValidationError::NoFunds(MILESTONE))
        );
    }

    #[test]
    fn other_owners_are_ignored() {
        let mut other = committed(1, 10);
        other.owner_id = AdminId(9);
        let plan = WithdrawalPlanner::default()
            .plan(MILESTONE, &[other, committed(2, 5)], &[])
            .unwrap();
        assert_eq!(plan.total, Amount(5));
        assert_eq!(plan.donation_count(), 1);
    }

    #[test]
    fn tokens_are_split_and_filterable() {
        let mut in_dai = committed(3, 7);
        in_dai.token = dai();
        let donations = vec![committed(1, 10), in_dai, committed(2, 5)];

        let plan = WithdrawalPlanner::default().plan(MILESTONE, &donations, &[]).unwrap();
        assert_eq!(plan.chunk_count(), 2);
        assert_eq!(plan.chunks[0].token, eth().address);
        assert_eq!(plan.chunks[0].total, Amount(15));
        assert_eq!(plan.chunks[1].index, 1);
        assert_eq!(plan.chunks[1].token, dai().address);

        let only_dai = WithdrawalPlanner::default()
            .plan(MILESTONE, &donations, &[dai().address])
            .unwrap();
        assert_eq!(only_dai.total, Amount(7));
    }

    #[test]
    fn chunk_call_carries_packed_entries() {
        let plan = WithdrawalPlanner::default()
            .plan(MILESTONE, &[committed(1, 100), committed(1, 50), committed(2, 30)], &[])
            .unwrap();
        match plan.chunks[0].call(MILESTONE) {
            LedgerCall::MultiWithdraw { milestone_id, pledges } => {
                assert_eq!(milestone_id, MILESTONE);
                assert_eq!(pledges.len(), 2);
                assert_eq!(pledges[0].decode().unwrap().amount, Amount(150));
            }
            other => panic!("unexpected call {other:?}"),
        }
    }

    #[test]
    fn zero_limit_is_treated_as_one() {
        assert_eq!(WithdrawalPlanner::new(0).limit(), 1);
    }

    #[test]
    fn plan_serializes_for_dry_runs() {
        let plan = WithdrawalPlanner::default().plan(MILESTONE, &[committed(1, 100)], &[]).unwrap();
        let json = serde_json::to_value(&plan).unwrap();
        assert_eq!(json["chunks"][0]["entries"][0]["pledgeId"], 1);
    }

    #[test]
    fn overflowing_totals_are_an_error() {
        let overflow = Err(ValidationError::AmountOverflow(MILESTONE));

        // One pledge in one chunk.
        let same_pledge = vec![committed(1, u128::MAX), committed(1, 1)];
        assert_eq!(WithdrawalPlanner::default().plan(MILESTONE, &same_pledge, &[]), overflow);

        // Distinct pledges in one chunk.
        let one_chunk = vec![committed(1, u128::MAX), committed(2, 1)];
        assert_eq!(WithdrawalPlanner::default().plan(MILESTONE, &one_chunk, &[]), overflow);

        // Each chunk fits, the plan total does not.
        let across_chunks = vec![committed(1, u128::MAX), committed(2, 1)];
        assert_eq!(WithdrawalPlanner::new(1).plan(MILESTONE, &across_chunks, &[]), overflow);
    }
}
