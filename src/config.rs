use std::time::Duration;

use crate::boltz::StatusClassifier;
use crate::network::{Currency, Network};

/// Settings of the swap engine. Flatten into a binary's `clap::Parser`.
#[derive(Debug, Clone, PartialEq, clap::Args)]
pub struct NurseryConfig {
    #[arg(long, value_enum, default_value_t = Network::Mainnet)]
    pub network: Network,

    /// Delay between reconnection attempts of status streams and block listeners.
    #[arg(long, default_value_t = 15_000)]
    pub retry_interval_ms: u64,

    /// Upper bound for one cooperative signing round trip.
    #[arg(long, default_value_t = 10_000)]
    pub nonce_timeout_ms: u64,

    /// Claim reverse and chain swaps from the mempool.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub accept_zero_conf: bool,

    /// Routing fee budget for paying reverse swap invoices, in parts per million.
    #[arg(long, default_value_t = 2_500)]
    pub max_routing_fee_ppm: u64,

    /// Extra server statuses that complete a swap.
    #[arg(long = "completed-status")]
    pub completed_statuses: Vec<String>,

    /// Extra server statuses that fail a swap.
    #[arg(long = "failed-status")]
    pub failed_statuses: Vec<String>,

    #[command(flatten)]
    pub claimer: ClaimerConfig,
}

impl Default for NurseryConfig {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            retry_interval_ms: 15_000,
            nonce_timeout_ms: 10_000,
            accept_zero_conf: true,
            max_routing_fee_ppm: 2_500,
            completed_statuses: Vec::new(),
            failed_statuses: Vec::new(),
            claimer: ClaimerConfig::default(),
        }
    }
}

impl NurseryConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn nonce_timeout(&self) -> Duration {
        Duration::from_millis(self.nonce_timeout_ms)
    }

    pub fn status_classifier(&self) -> StatusClassifier {
        StatusClassifier::default().with_extra(
            self.completed_statuses.iter().cloned(),
            self.failed_statuses.iter().cloned(),
        )
    }
}

/// Batching policy of the claim sweeper.
#[derive(Debug, Clone, PartialEq, Eq, clap::Args)]
pub struct ClaimerConfig {
    /// Sweep an output right away once its timeout is this close.
    #[arg(long, default_value_t = 7_200)]
    pub expiry_tolerance_secs: u64,

    /// Currencies whose outputs wait for the sweep interval.
    #[arg(long = "deferred-currency", value_enum)]
    pub deferred_currencies: Vec<Currency>,

    /// Seconds between scheduled sweeps. 0 settles every output immediately.
    #[arg(long, default_value_t = 0)]
    pub claim_interval_secs: u64,

    #[arg(long, default_value_t = 200)]
    pub max_count: usize,

    /// Queued value in sats that triggers a sweep. 0 means unlimited.
    #[arg(long, default_value_t = 0)]
    pub max_balance: u64,
}

impl Default for ClaimerConfig {
    fn default() -> Self {
        Self {
            expiry_tolerance_secs: 7_200,
            deferred_currencies: Vec::new(),
            claim_interval_secs: 0,
            max_count: 200,
            max_balance: 0,
        }
    }
}

impl ClaimerConfig {
    pub fn expiry_tolerance(&self) -> Duration {
        Duration::from_secs(self.expiry_tolerance_secs)
    }

    /// `None` when batching is disabled.
    pub fn interval(&self) -> Option<Duration> {
        (self.claim_interval_secs > 0).then(|| Duration::from_secs(self.claim_interval_secs))
    }

    pub fn is_deferred(&self, currency: Currency) -> bool {
        self.deferred_currencies.contains(&currency)
    }
}
