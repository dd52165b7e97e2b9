//! The execution seam.
//!
//! The chain treats the virtual machine as an opaque
//! `execute(tx, state) → receipt` function behind [`Executor`].
//! [`TransferExecutor`] is the plain value-transfer machine used by block
//! assembly and tests; a contract VM plugs in behind the same trait.

use fc_02_state::{StateError, Statedb};
use shared_types::{Receipt, Transaction, U256};
use thiserror::Error;

/// Gas consumed by a plain transfer.
pub const TRANSFER_GAS: u64 = 21_000;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("nonce mismatch, have {have}, want {want}")]
    NonceMismatch { have: u64, want: u64 },

    #[error("gas limit {limit} below the transfer cost {required}")]
    GasTooLow { limit: u64, required: u64 },

    #[error("balance {balance} cannot cover cost {cost}")]
    InsufficientBalance { balance: U256, cost: U256 },

    #[error("state access failed")]
    State(#[from] StateError),
}

/// Applies one transaction to the mutable state, returning its receipt.
/// Implementations must leave the state untouched on error.
pub trait Executor: Send + Sync {
    fn apply(&self, tx: &Transaction, state: &mut Statedb) -> Result<Receipt, ExecutorError>;
}

/// Plain value transfers with a fixed gas cost. Fees are deducted from the
/// sender and burned; cross-shard transfers deduct locally and leave the
/// credit to the target shard's debt settlement.
#[derive(Debug, Default)]
pub struct TransferExecutor;

impl TransferExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Executor for TransferExecutor {
    fn apply(&self, tx: &Transaction, state: &mut Statedb) -> Result<Receipt, ExecutorError> {
        if tx.is_reward() {
            state.add_balance(&tx.to, tx.amount)?;
            return Ok(Receipt {
                post_state: state.hash()?,
                tx_hash: tx.hash(),
                ..Default::default()
            });
        }

        let snapshot = state.snapshot();
        match self.apply_transfer(tx, state) {
            Ok(receipt) => Ok(receipt),
            Err(err) => {
                // Leave no partial mutation behind.
                state
                    .revert_to_snapshot(snapshot)
                    .expect("snapshot taken above");
                Err(err)
            }
        }
    }
}

impl TransferExecutor {
    fn apply_transfer(
        &self,
        tx: &Transaction,
        state: &mut Statedb,
    ) -> Result<Receipt, ExecutorError> {
        if tx.gas_limit < TRANSFER_GAS {
            return Err(ExecutorError::GasTooLow {
                limit: tx.gas_limit,
                required: TRANSFER_GAS,
            });
        }

        let account_nonce = state.get_nonce(&tx.from)?;
        if tx.nonce != account_nonce + 1 {
            return Err(ExecutorError::NonceMismatch {
                have: tx.nonce,
                want: account_nonce + 1,
            });
        }

        let fee = tx.price * U256::from(TRANSFER_GAS);
        let cost = tx.amount + fee;
        let balance = state.get_balance(&tx.from)?;
        if balance < cost {
            return Err(ExecutorError::InsufficientBalance { balance, cost });
        }

        state.sub_balance(&tx.from, cost)?;
        state.set_nonce(&tx.from, tx.nonce)?;
        if !tx.is_cross_shard() {
            state.add_balance(&tx.to, tx.amount)?;
        }

        Ok(Receipt {
            post_state: state.hash()?,
            tx_hash: tx.hash(),
            used_gas: TRANSFER_GAS,
            total_fee: fee,
            ..Default::default()
        })
    }
}
