//! Shared world for engine integration tests: an in-memory ledger and index,
//! one giver, one community delegate, a campaign and one of its milestones.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use giving_sync::{EngineConfig, InMemoryIndex, InMemoryLedger, SyncEngine};
use giving_types::{
    Address, AdminId, AdminProfile, Amount, Donation, DonationFilter, DonationId, ManualClock, MilestoneTerms,
    PledgeAdmin, Token, TxHash,
};
use giving_wallet::{Keystore, LockedSession, TransactionSigner};

pub const PASSWORD: &str = "correct horse battery staple";
const KDF_ROUNDS: u32 = 1_000;

pub struct Wallets {
    pub giver: LockedSession,
    pub community: LockedSession,
    pub campaign: LockedSession,
    pub recipient: LockedSession,
}

pub struct World {
    pub clock: Arc<ManualClock>,
    pub index: InMemoryIndex,
    pub ledger: Arc<InMemoryLedger>,
    pub engine: SyncEngine,
    pub token: Token,
    pub giver: AdminId,
    pub community: AdminId,
    pub campaign: AdminId,
    pub milestone: AdminId,
    pub giver_address: Address,
}

fn wallet() -> LockedSession {
    LockedSession::new(Keystore::create_with_rounds(PASSWORD, KDF_ROUNDS).unwrap())
}

pub fn fast_config() -> EngineConfig {
    EngineConfig {
        resubscribe_backoff_ms: 10,
        ..EngineConfig::default()
    }
}

pub async fn setup(config: EngineConfig) -> (World, Wallets) {
    let wallets = Wallets {
        giver: wallet(),
        community: wallet(),
        campaign: wallet(),
        recipient: wallet(),
    };

    let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap()));
    let index = InMemoryIndex::new();
    let ledger = Arc::new(InMemoryLedger::new(index.clone(), clock.clone(), &config));
    let token = Token::new("ETH", 18, Address::from_bytes([0xee; 20]));
    ledger.register_token(token.clone()).await;

    let giver = ledger.register_giver(wallets.giver.address().clone()).await.unwrap();
    let community = ledger
        .register_admin(PledgeAdmin::delegate(AdminProfile::new(
            "Community",
            wallets.community.address().clone(),
        )))
        .await
        .unwrap();
    let campaign = ledger
        .register_admin(PledgeAdmin::campaign(
            AdminProfile::new("Clean water", wallets.campaign.address().clone())
                .with_reviewer(wallets.campaign.address().clone()),
        ))
        .await
        .unwrap();
    let milestone = ledger
        .register_admin(PledgeAdmin::milestone(
            AdminProfile::new("Build a well", wallets.campaign.address().clone())
                .with_recipient(wallets.recipient.address().clone()),
            MilestoneTerms::new(campaign),
        ))
        .await
        .unwrap();

    let engine = SyncEngine::new(ledger.clone(), Arc::new(index.clone()), clock.clone(), config);
    let world = World {
        clock,
        index,
        ledger,
        engine,
        token,
        giver,
        community,
        campaign,
        milestone,
        giver_address: wallets.giver.address().clone(),
    };
    (world, wallets)
}

/// Fail the test instead of hanging.
pub async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out waiting for the engine")
}

impl World {
    /// Donate through the engine and wait for the indexed record.
    pub async fn donate(&self, signer: &dyn TransactionSigner, receiver: AdminId, amount: u128) -> Donation {
        let receipt = self
            .engine
            .donate(signer, receiver, Amount(amount), &self.token)
            .await
            .unwrap();
        let hash = receipt.tx_hash.clone();
        within(receipt.confirmed()).await.unwrap();
        self.record_with_hash(&hash)
    }

    pub fn record_with_hash(&self, hash: &TxHash) -> Donation {
        self.index
            .donations()
            .into_iter()
            .find(|d| d.tx_hash.as_ref() == Some(hash))
            .expect("no indexed record carries the hash")
    }

    pub fn record(&self, id: &DonationId) -> Donation {
        self.index
            .donations()
            .into_iter()
            .find(|d| &d.id == id)
            .expect("record missing from index")
    }

    pub fn giver_filter(&self) -> DonationFilter {
        DonationFilter::new().with_giver(self.giver_address.clone())
    }
}
