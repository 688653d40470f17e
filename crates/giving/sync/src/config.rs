use serde::{Deserialize, Serialize};

use giving_lifecycle::DEFAULT_COMMIT_WINDOW_SECS;
use giving_planner::DEFAULT_COLLECT_COUNT_LIMIT;
use giving_types::DEFAULT_REQUIRED_CONFIRMATIONS;

/// Reconciliation engine settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Max donations paid out by one multi-withdraw call
    #[serde(default = "default_collect_count_limit")]
    pub donation_collect_count_limit: usize,

    /// Giver veto window, in seconds
    #[serde(default = "default_commit_window_secs")]
    pub commit_window_secs: u64,

    /// Confirmations before a mined transaction counts as final
    #[serde(default = "default_required_confirmations")]
    pub required_confirmations: u32,

    /// Delay before resubscribing after an index failure, and between
    /// point reads after mining
    #[serde(default = "default_resubscribe_backoff_ms")]
    pub resubscribe_backoff_ms: u64,

    /// Write `{status: PENDING, txHash}` to the index once a hash exists
    #[serde(default)]
    pub mirror_pending_to_index: bool,
}

fn default_collect_count_limit() -> usize {
    DEFAULT_COLLECT_COUNT_LIMIT
}

fn default_commit_window_secs() -> u64 {
    DEFAULT_COMMIT_WINDOW_SECS as u64
}

fn default_required_confirmations() -> u32 {
    DEFAULT_REQUIRED_CONFIRMATIONS
}

fn default_resubscribe_backoff_ms() -> u64 {
    500
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            donation_collect_count_limit: default_collect_count_limit(),
            commit_window_secs: default_commit_window_secs(),
            required_confirmations: default_required_confirmations(),
            resubscribe_backoff_ms: default_resubscribe_backoff_ms(),
            mirror_pending_to_index: false,
        }
    }
}

impl EngineConfig {
    pub fn commit_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.commit_window_secs).unwrap_or(i64::MAX / 1_000))
    }

    pub fn resubscribe_backoff(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.resubscribe_backoff_ms)
    }
}
