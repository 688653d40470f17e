//! Withdrawal planning commands

use std::path::{Path, PathBuf};

use clap::Subcommand;
use giving_planner::{WithdrawalChunk, WithdrawalPlan, WithdrawalPlanner};
use giving_types::{Address, AdminId, Amount, Donation, PackedPledge};
use serde::Serialize;
use tabled::Tabled;

use crate::error::CliResult;
use crate::output::{self, abbreviate, print_info, OutputFormat};

/// Withdrawal subcommands
#[derive(Subcommand)]
pub enum WithdrawalCommands {
    /// Plan a milestone payout from an exported list of donation records
    Plan {
        /// JSON file holding an array of donation records
        #[arg(short, long)]
        donations: PathBuf,

        /// Milestone admin id
        #[arg(short, long)]
        milestone: u64,

        /// Donations per ledger call (defaults to the engine setting)
        #[arg(short, long)]
        limit: Option<usize>,

        /// Only pay out these token addresses (repeatable)
        #[arg(short, long = "token")]
        tokens: Vec<String>,
    },
}

/// Table row for chunk display
#[derive(Debug, Tabled)]
struct ChunkRow {
    /// Submission order
    chunk: usize,
    token: String,
    donations: usize,
    /// Packed entries after per-pledge aggregation
    pledges: usize,
    total: String,
}

impl From<&WithdrawalChunk> for ChunkRow {
    fn from(c: &WithdrawalChunk) -> Self {
        Self {
            chunk: c.index + 1,
            token: abbreviate(c.token.as_str()),
            donations: c.donation_ids.len(),
            pledges: c.entries.len(),
            total: c.total.to_string(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PlannedChunk<'a> {
    #[serde(flatten)]
    chunk: &'a WithdrawalChunk,
    packed: Vec<PackedPledge>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PlanOutput<'a> {
    milestone: AdminId,
    total: Amount,
    chunks: Vec<PlannedChunk<'a>>,
}

/// Plan a withdrawal of `milestone` from a JSON export of donation records.
pub fn plan_from_export(
    path: &Path,
    milestone: AdminId,
    limit: usize,
    tokens: &[String],
) -> CliResult<WithdrawalPlan> {
    let donations: Vec<Donation> = serde_json::from_str(&std::fs::read_to_string(path)?)?;
    let tokens = tokens
        .iter()
        .map(|t| Address::parse(t))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(WithdrawalPlanner::new(limit).plan(milestone, &donations, &tokens)?)
}

/// Execute a withdrawal command
pub fn execute(command: WithdrawalCommands, default_limit: usize, format: OutputFormat) -> CliResult<()> {
    match command {
        WithdrawalCommands::Plan {
            donations,
            milestone,
            limit,
            tokens,
        } => {
            let plan = plan_from_export(
                &donations,
                AdminId(milestone),
                limit.unwrap_or(default_limit),
                &tokens,
            )?;

            if matches!(format, OutputFormat::Table) {
                print_info(&format!(
                    "Milestone {}: {} donations in {} ledger calls, {} total",
                    plan.milestone,
                    plan.donation_count(),
                    plan.chunk_count(),
                    plan.total
                ));
            }
            let rows: Vec<ChunkRow> = plan.chunks.iter().map(ChunkRow::from).collect();
            let data = PlanOutput {
                milestone: plan.milestone,
                total: plan.total,
                chunks: plan
                    .chunks
                    .iter()
                    .map(|chunk| PlannedChunk {
                        chunk,
                        packed: chunk.packed(),
                    })
                    .collect(),
            };
            output::print_output(rows, &data, format)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use giving_types::{
        AdminKind, DonationId, DonationStatus, PledgeId, Token, ValidationError,
        DEFAULT_REQUIRED_CONFIRMATIONS,
    };

    use crate::error::CliError;

    const MILESTONE: AdminId = AdminId(4);

    fn committed(n: usize, pledge: u64) -> Donation {
        Donation {
            id: DonationId::new(format!("d{n}")),
            pledge_id: PledgeId(pledge),
            amount: Amount(100),
            amount_remaining: Amount(100),
            token: Token::new("ETH", 18, Address::from_bytes([0xee; 20])),
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
            confirmations: DEFAULT_REQUIRED_CONFIRMATIONS,
            required_confirmations: DEFAULT_REQUIRED_CONFIRMATIONS,
            commit_time: None,
            created_at: DateTime::from_timestamp(1_700_000_000 + n as i64, 0).unwrap(),
        }
    }

    fn export(donations: &[Donation]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("donations-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, serde_json::to_string(donations).unwrap()).unwrap();
        path
    }

    #[test]
    fn test_plan_from_export_chunks_by_limit() {
        let donations: Vec<Donation> = (0..7).map(|n| committed(n, 10 + n as u64)).collect();
        let path = export(&donations);
        let plan = plan_from_export(&path, MILESTONE, 3, &[]).unwrap();
        std::fs::remove_file(&path).ok();

        let sizes: Vec<usize> = plan.chunks.iter().map(|c| c.donation_ids.len()).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
        assert_eq!(plan.total, Amount(700));
    }

    #[test]
    fn test_token_filter_excludes_everything() {
        let path = export(&[committed(0, 10)]);
        let other = Address::from_bytes([0xda; 20]).to_string();
        let result = plan_from_export(&path, MILESTONE, 50, &[other]);
        std::fs::remove_file(&path).ok();

        assert!(matches!(
            result,
            Err(CliError::Validation(ValidationError::NoFunds(MILESTONE)))
        ));
    }

    #[test]
    fn test_bad_token_address() {
        let path = export(&[committed(0, 10)]);
        let result = plan_from_export(&path, MILESTONE, 50, &["0x12".to_string()]);
        std::fs::remove_file(&path).ok();
        assert!(matches!(result, Err(CliError::Parse(_))));
    }

    #[test]
    fn test_chunk_row() {
        let path = export(&[committed(0, 10), committed(1, 10)]);
        let plan = plan_from_export(&path, MILESTONE, 50, &[]).unwrap();
        std::fs::remove_file(&path).ok();

        let row = ChunkRow::from(&plan.chunks[0]);
        assert_eq!(row.chunk, 1);
        assert_eq!(row.donations, 2);
        assert_eq!(row.pledges, 1);
        assert_eq!(row.total, "200");
    }
}
