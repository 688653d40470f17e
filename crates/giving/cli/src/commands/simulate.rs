//! In-memory end-to-end run: donations flow through a delegate into a
//! milestone and are paid out in batches.

use std::sync::Arc;

use clap::Args;
use giving_sync::{EngineConfig, InMemoryIndex, InMemoryLedger, SyncEngine, WithdrawalProgress};
use giving_types::{
    Address, AdminId, AdminProfile, Amount, Clock, DonationAction, DonationId, DonationStatus, MilestoneTerms,
    PledgeAdmin, SystemClock, Token, ValidationError,
};
use giving_wallet::{Keystore, LockedSession, TransactionSigner};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tabled::Tabled;
use tracing::info;

use crate::error::CliResult;
use crate::output::{self, print_info, print_warning, OutputFormat};

const PASSWORD: &str = "simulation";
/// The simulation's keys never leave the process.
const KDF_ROUNDS: u32 = 1_000;

/// Simulation options
#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    /// Number of donations to make
    #[arg(short = 'n', long, default_value = "120")]
    pub donations: usize,

    /// Amount per donation, in whole tokens
    #[arg(short, long, default_value = "0.5")]
    pub amount: String,

    /// Donations per withdrawal call (defaults to the engine setting)
    #[arg(short, long)]
    pub limit: Option<usize>,
}

/// What a simulation run did
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationSummary {
    pub donations: usize,
    pub chunks: usize,
    pub submitted: usize,
    pub failed: usize,
    pub paid: usize,
    pub total_paid: String,
    pub calls: usize,
}

#[derive(Tabled)]
struct SummaryRow {
    metric: &'static str,
    value: String,
}

impl SimulationSummary {
    fn rows(&self) -> Vec<SummaryRow> {
        vec![
            SummaryRow { metric: "donations", value: self.donations.to_string() },
            SummaryRow { metric: "withdrawal chunks", value: self.chunks.to_string() },
            SummaryRow { metric: "chunks submitted", value: self.submitted.to_string() },
            SummaryRow { metric: "chunks failed", value: self.failed.to_string() },
            SummaryRow { metric: "donations paid", value: self.paid.to_string() },
            SummaryRow { metric: "total paid", value: self.total_paid.clone() },
            SummaryRow { metric: "ledger calls", value: self.calls.to_string() },
        ]
    }
}

struct Cast {
    giver: LockedSession,
    community: LockedSession,
    owner: LockedSession,
    recipient: LockedSession,
}

struct Ids {
    community: AdminId,
    milestone: AdminId,
}

async fn stage(ledger: &InMemoryLedger, token: &Token, cast: &Cast) -> CliResult<Ids> {
    ledger.register_token(token.clone()).await;
    ledger.register_giver(cast.giver.address().clone()).await?;
    let community = ledger
        .register_admin(PledgeAdmin::delegate(AdminProfile::new(
            "Community",
            cast.community.address().clone(),
        )))
        .await?;
    let campaign = ledger
        .register_admin(PledgeAdmin::campaign(
            AdminProfile::new("Clean water", cast.owner.address().clone())
                .with_reviewer(cast.owner.address().clone()),
        ))
        .await?;
    let milestone = ledger
        .register_admin(PledgeAdmin::milestone(
            AdminProfile::new("Build a well", cast.owner.address().clone())
                .with_recipient(cast.recipient.address().clone()),
            MilestoneTerms::new(campaign),
        ))
        .await?;
    Ok(Ids { community, milestone })
}

/// Run the simulation against a fresh in-memory ledger and index.
pub async fn run(config: &EngineConfig, args: &SimulateArgs, progress: ProgressBar) -> CliResult<SimulationSummary> {
    let mut config = config.clone();
    if let Some(limit) = args.limit {
        config.donation_collect_count_limit = limit;
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let index = InMemoryIndex::new();
    let ledger = Arc::new(InMemoryLedger::new(index.clone(), clock.clone(), &config));
    let engine = SyncEngine::new(ledger.clone(), Arc::new(index.clone()), clock, config);

    let token = Token::new("ETH", 18, Address::from_bytes([0xee; 20]));
    let amount = token.parse_amount(&args.amount)?;
    let wallet = || -> CliResult<LockedSession> {
        Ok(LockedSession::new(Keystore::create_with_rounds(PASSWORD, KDF_ROUNDS)?))
    };
    let mut cast = Cast {
        giver: wallet()?,
        community: wallet()?,
        owner: wallet()?,
        recipient: wallet()?,
    };
    let ids = stage(&ledger, &token, &cast).await?;

    let giver = cast.giver.unlock(PASSWORD)?;
    let community = cast.community.unlock(PASSWORD)?;
    let recipient = cast.recipient.unlock(PASSWORD)?;

    progress.set_length(args.donations as u64 * 3);
    progress.set_message("donating");
    let mut donations = Vec::with_capacity(args.donations);
    for _ in 0..args.donations {
        let receipt = engine.donate(&giver, ids.community, amount, &token).await?;
        let hash = receipt.tx_hash.clone();
        receipt.confirmed().await?;
        let record = index
            .donations()
            .into_iter()
            .find(|d| d.tx_hash.as_ref() == Some(&hash))
            .map(|d| d.id);
        donations.extend(record);
        progress.inc(1);
    }

    progress.set_message("proposing");
    for id in &donations {
        let propose = DonationAction::Delegate {
            target: ids.milestone,
            amount: None,
        };
        act(&engine, &community, id, propose).await?;
        progress.inc(1);
    }

    progress.set_message("committing");
    for id in &donations {
        act(&engine, &giver, id, DonationAction::Commit).await?;
        progress.inc(1);
    }

    let plan = engine.plan_withdrawal(recipient.address(), ids.milestone, &[]).await?;
    progress.set_length(progress.length().unwrap_or(0) + plan.chunk_count() as u64);
    progress.set_message("withdrawing");
    let report = engine
        .execute_withdrawal(&recipient, &plan, |event| match event {
            WithdrawalProgress::Planned { chunks, .. } => {
                progress.set_message(format!("withdrawing in {chunks} calls"));
            }
            WithdrawalProgress::Submitted { .. } => progress.inc(1),
            WithdrawalProgress::Failed { chunk, of, error } => {
                progress.inc(1);
                progress.println(format!("chunk {}/{} failed: {}", chunk + 1, of, error));
            }
        })
        .await?;
    let (submitted, failed) = (report.submitted(), report.failed());
    for receipt in report.into_receipts() {
        receipt.confirmed().await?;
    }
    ledger.confirm_payouts().await;
    progress.finish_with_message("done");

    let paid: Vec<_> = index
        .donations()
        .into_iter()
        .filter(|d| d.status == DonationStatus::Paid)
        .collect();
    let total_paid =
        Amount::checked_sum(paid.iter().map(|d| d.amount)).ok_or(ValidationError::AmountOverflow(ids.milestone))?;

    let summary = SimulationSummary {
        donations: donations.len(),
        chunks: plan.chunk_count(),
        submitted,
        failed,
        paid: paid.len(),
        total_paid: token.display_amount(total_paid),
        calls: ledger.submitted().await.len(),
    };
    info!(
        donations = summary.donations,
        chunks = summary.chunks,
        paid = summary.paid,
        "simulation finished"
    );
    Ok(summary)
}

async fn act(
    engine: &SyncEngine,
    signer: &dyn TransactionSigner,
    id: &DonationId,
    action: DonationAction,
) -> CliResult<()> {
    engine.perform_action(signer, id, action).await?.confirmed().await?;
    Ok(())
}

/// Execute the simulate command
pub async fn execute(args: SimulateArgs, config: &EngineConfig, format: OutputFormat) -> CliResult<()> {
    let progress = match format {
        OutputFormat::Table => {
            print_info(&format!("Simulating {} donations of {} ETH", args.donations, args.amount));
            let pb = ProgressBar::new(0);
            if let Ok(style) = ProgressStyle::default_bar().template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}") {
                pb.set_style(style);
            }
            pb
        }
        OutputFormat::Json => ProgressBar::hidden(),
    };

    let summary = run(config, &args, progress).await?;
    if summary.failed > 0 {
        print_warning(&format!("{} withdrawal chunks failed", summary.failed));
    }
    output::print_output(summary.rows(), &summary, format)
}
