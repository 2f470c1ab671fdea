use std::collections::BTreeSet;

/// Status strings published by the swap server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SwapUpdateEvent {
    SwapCreated,
    SwapExpired,
    InvoiceSet,
    InvoicePending,
    InvoicePaid,
    InvoiceSettled,
    InvoiceFailedToPay,
    InvoiceExpired,
    TransactionFailed,
    TransactionMempool,
    TransactionClaimPending,
    TransactionClaimed,
    TransactionRefunded,
    TransactionConfirmed,
    TransactionLockupFailed,
    TransactionServerMempool,
    TransactionServerConfirmed,
}

impl SwapUpdateEvent {
    pub const ALL: [SwapUpdateEvent; 17] = [
        SwapUpdateEvent::SwapCreated,
        SwapUpdateEvent::SwapExpired,
        SwapUpdateEvent::InvoiceSet,
        SwapUpdateEvent::InvoicePending,
        SwapUpdateEvent::InvoicePaid,
        SwapUpdateEvent::InvoiceSettled,
        SwapUpdateEvent::InvoiceFailedToPay,
        SwapUpdateEvent::InvoiceExpired,
        SwapUpdateEvent::TransactionFailed,
        SwapUpdateEvent::TransactionMempool,
        SwapUpdateEvent::TransactionClaimPending,
        SwapUpdateEvent::TransactionClaimed,
        SwapUpdateEvent::TransactionRefunded,
        SwapUpdateEvent::TransactionConfirmed,
        SwapUpdateEvent::TransactionLockupFailed,
        SwapUpdateEvent::TransactionServerMempool,
        SwapUpdateEvent::TransactionServerConfirmed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SwapUpdateEvent::SwapCreated => "swap.created",
            SwapUpdateEvent::SwapExpired => "swap.expired",
            SwapUpdateEvent::InvoiceSet => "invoice.set",
            SwapUpdateEvent::InvoicePending => "invoice.pending",
            SwapUpdateEvent::InvoicePaid => "invoice.paid",
            SwapUpdateEvent::InvoiceSettled => "invoice.settled",
            SwapUpdateEvent::InvoiceFailedToPay => "invoice.failedToPay",
            SwapUpdateEvent::InvoiceExpired => "invoice.expired",
            SwapUpdateEvent::TransactionFailed => "transaction.failed",
            SwapUpdateEvent::TransactionMempool => "transaction.mempool",
            SwapUpdateEvent::TransactionClaimPending => "transaction.claim.pending",
            SwapUpdateEvent::TransactionClaimed => "transaction.claimed",
            SwapUpdateEvent::TransactionRefunded => "transaction.refunded",
            SwapUpdateEvent::TransactionConfirmed => "transaction.confirmed",
            SwapUpdateEvent::TransactionLockupFailed => "transaction.lockupFailed",
            SwapUpdateEvent::TransactionServerMempool => "transaction.server.mempool",
            SwapUpdateEvent::TransactionServerConfirmed => "transaction.server.confirmed",
        }
    }

    pub fn parse(status: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|event| event.as_str() == status)
    }

    /// How far along its lifecycle a swap is once it reports this event. Events of
    /// different swap types that can replace each other share a rank.
    pub fn progress(self) -> u8 {
        use SwapUpdateEvent::*;
        match self {
            SwapCreated => 0,
            InvoiceSet => 1,
            TransactionMempool => 2,
            TransactionConfirmed | TransactionLockupFailed => 3,
            InvoicePending | TransactionServerMempool => 4,
            InvoicePaid | TransactionServerConfirmed => 5,
            TransactionClaimPending => 6,
            InvoiceSettled | TransactionClaimed => 7,
            SwapExpired | InvoiceFailedToPay | InvoiceExpired | TransactionFailed
            | TransactionRefunded => 8,
        }
    }
}

/// Which status strings end a swap successfully or unsuccessfully.
///
/// The server's taxonomy grows over time, so both sets can be extended from config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusClassifier {
    completed: BTreeSet<String>,
    failed: BTreeSet<String>,
}

impl Default for StatusClassifier {
    fn default() -> Self {
        let completed = [
            SwapUpdateEvent::TransactionClaimed,
            SwapUpdateEvent::InvoiceSettled,
        ];
        let failed = [
            SwapUpdateEvent::SwapExpired,
            SwapUpdateEvent::InvoiceFailedToPay,
            SwapUpdateEvent::InvoiceExpired,
            SwapUpdateEvent::TransactionFailed,
            SwapUpdateEvent::TransactionRefunded,
            SwapUpdateEvent::TransactionLockupFailed,
        ];
        Self {
            completed: completed.iter().map(|e| e.as_str().to_string()).collect(),
            failed: failed.iter().map(|e| e.as_str().to_string()).collect(),
        }
    }
}

impl StatusClassifier {
    pub fn with_extra(
        mut self,
        completed: impl IntoIterator<Item = String>,
        failed: impl IntoIterator<Item = String>,
    ) -> Self {
        self.completed.extend(completed);
        self.failed.extend(failed);
        self
    }

    pub fn is_completed(&self, status: &str) -> bool {
        self.completed.contains(status)
    }

    pub fn is_failed(&self, status: &str) -> bool {
        self.failed.contains(status)
    }
}
