/// Failures the swap engine reacts to differently from plain operational errors.
///
/// Values of this type travel inside `anyhow::Error`; use [`SwapError::find`] to classify.
#[derive(Debug, thiserror::Error)]
pub enum SwapError {
    /// The locally derived output does not match what the server declared.
    #[error("derived swap output {derived} does not match declared {expected}")]
    ScriptMismatch { expected: String, derived: String },

    /// The observed lockup pays less than the swap requires.
    #[error("lockup value {actual} is below expected {expected}")]
    InsufficientAmount { expected: u64, actual: u64 },

    /// A quote implies a network fee well above the estimate.
    #[error("onchain fee way above expectation: {actual} > {expected}+{tolerance}")]
    InvalidOnchainFee {
        actual: u64,
        expected: u64,
        tolerance: u64,
    },

    /// Malformed or unreconcilable nonce or partial signature.
    #[error("cooperative signing failed: {0}")]
    SigningProtocol(String),

    /// Stream, poll or broadcast failure that is worth retrying.
    #[error("network: {0}")]
    TransientNetwork(String),

    /// The swap database rejected or failed an operation.
    #[error("persistence: {0}")]
    Persistence(String),
}

impl SwapError {
    /// Returns the first `SwapError` in the chain of `err`.
    pub fn find(err: &anyhow::Error) -> Option<&SwapError> {
        err.chain().find_map(|e| e.downcast_ref::<SwapError>())
    }

    /// Whether the swap can never complete and must not be spent from.
    pub fn is_abandoning(&self) -> bool {
        matches!(
            self,
            SwapError::ScriptMismatch { .. } | SwapError::InsufficientAmount { .. }
        )
    }
}

pub(crate) fn persistence(err: anyhow::Error) -> anyhow::Error {
    SwapError::Persistence(format!("{err:#}")).into()
}
