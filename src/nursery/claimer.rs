use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::config::ClaimerConfig;
use crate::network::Currency;
use crate::transaction::Output;

/// Why a sweep was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SweepReason {
    None,
    Expiry,
    Count,
    Amount,
    Interval,
    Forced,
    /// An earlier sweep of the currency failed.
    Retry,
}

impl SweepReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SweepReason::None => "none",
            SweepReason::Expiry => "expiry",
            SweepReason::Count => "count",
            SweepReason::Amount => "amount",
            SweepReason::Interval => "interval",
            SweepReason::Forced => "forced",
            SweepReason::Retry => "retry",
        }
    }
}

impl fmt::Display for SweepReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue of outputs waiting to be settled, per currency.
#[derive(Debug)]
pub struct Claimer {
    config: ClaimerConfig,
    outputs: HashMap<Currency, Vec<Output>>,
    retry: HashSet<Currency>,
}

impl Claimer {
    pub fn new(config: ClaimerConfig) -> Self {
        Self {
            config,
            outputs: HashMap::new(),
            retry: HashSet::new(),
        }
    }

    /// Adds `output` unless it is already queued and decides whether its currency should
    /// be swept now.
    pub fn queue(&mut self, output: Output, current_height: Option<u32>) -> SweepReason {
        let reason_for = output.clone();
        self.insert(output);
        self.should_sweep(&reason_for, current_height)
    }

    /// Sweep policy for `output`, evaluated against the current queue.
    pub fn should_sweep(&self, output: &Output, current_height: Option<u32>) -> SweepReason {
        if self.config.interval().is_none() || !self.config.is_deferred(output.currency) {
            return SweepReason::Forced;
        }
        let Some(height) = current_height else {
            return SweepReason::Forced;
        };

        if self.expires_soon(output, height) {
            return SweepReason::Expiry;
        }
        if self.queued(output.currency).len() > self.config.max_count {
            return SweepReason::Count;
        }
        if self.config.max_balance > 0
            && self.sweepable_balance(output.currency) > self.config.max_balance
        {
            return SweepReason::Amount;
        }
        SweepReason::None
    }

    /// Whether any queued output of `currency` is within the expiry tolerance at `height`.
    pub fn has_expiring(&self, currency: Currency, height: u32) -> bool {
        self.queued(currency)
            .iter()
            .any(|output| self.expires_soon(output, height))
    }

    pub fn queued(&self, currency: Currency) -> &[Output] {
        self.outputs.get(&currency).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn sweepable_balance(&self, currency: Currency) -> u64 {
        self.queued(currency).iter().map(|output| output.value).sum()
    }

    /// Empties the queue of `currency`.
    pub fn take(&mut self, currency: Currency) -> Vec<Output> {
        self.outputs.remove(&currency).unwrap_or_default()
    }

    /// Puts back outputs of a failed sweep.
    pub fn restore(&mut self, outputs: Vec<Output>) {
        for output in outputs {
            self.insert(output);
        }
    }

    /// Marks `currency` for another sweep. Returns `false` if it already was.
    pub fn mark_retry(&mut self, currency: Currency) -> bool {
        self.retry.insert(currency)
    }

    /// Clears the retry mark of `currency`, returning whether one was set.
    pub fn take_retry(&mut self, currency: Currency) -> bool {
        self.retry.remove(&currency)
    }

    pub fn needs_retry(&self, currency: Currency) -> bool {
        self.retry.contains(&currency)
    }

    fn insert(&mut self, output: Output) {
        let queued = self.outputs.entry(output.currency).or_default();
        if !queued
            .iter()
            .any(|existing| existing.swap_id == output.swap_id && existing.side == output.side)
        {
            queued.push(output);
        }
    }

    fn expires_soon(&self, output: &Output, height: u32) -> bool {
        let blocks_left = output.timeout_block_height.saturating_sub(height);
        output.currency.blocks_to_duration(blocks_left) <= self.config.expiry_tolerance()
    }
}
