//! Cross-shard debt verification seam.
//!
//! Whether a debt's source block is packed and deep enough is decided by
//! whoever can see the source shard; pools and the miner only consume the
//! answer.

use crate::entities::Debt;
use thiserror::Error;

/// Verification outcome for one debt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DebtStatus {
    /// The originating transaction is packed in a source-shard block.
    pub packed: bool,
    /// That block is final enough to settle the debt locally.
    pub confirmed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DebtVerifyError {
    #[error("debt verification failed: {0}")]
    Failed(String),
}

/// Oracle for debt settlement readiness.
pub trait DebtVerifier: Send + Sync {
    fn validate_debt(&self, debt: &Debt) -> Result<DebtStatus, DebtVerifyError>;
}

/// Fixed-answer verifier for tests.
pub struct StaticVerifier {
    pub status: DebtStatus,
    pub error: Option<String>,
}

impl StaticVerifier {
    pub fn new(packed: bool, confirmed: bool) -> Self {
        Self {
            status: DebtStatus { packed, confirmed },
            error: None,
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            status: DebtStatus::default(),
            error: Some(message.to_string()),
        }
    }
}

impl DebtVerifier for StaticVerifier {
    fn validate_debt(&self, _debt: &Debt) -> Result<DebtStatus, DebtVerifyError> {
        match &self.error {
            Some(message) => Err(DebtVerifyError::Failed(message.clone())),
            None => Ok(self.status),
        }
    }
}
