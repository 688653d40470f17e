use giving_types::{Donation, PackedPledge, PledgeAmount};

/// Sum `amount_remaining` per pledge, keeping the order in which pledges
/// first appear. `None` if a pledge's sum overflows.
pub fn aggregate_pledges<'a>(donations: impl IntoIterator<Item = &'a Donation>) -> Option<Vec<PledgeAmount>> {
    let mut out: Vec<PledgeAmount> = Vec::new();
    for donation in donations {
        match out.iter_mut().find(|p| p.pledge_id == donation.pledge_id) {
            Some(entry) => entry.amount = entry.amount.checked_add(donation.amount_remaining)?,
            None => out.push(PledgeAmount {
                pledge_id: donation.pledge_id,
                amount: donation.amount_remaining,
            }),
        }
    }
    Some(out)
}

pub fn encode_entries(entries: &[PledgeAmount]) -> Vec<PackedPledge> {
    entries.iter().copied().map(PackedPledge::encode).collect()
}
