//! One block-assembly attempt.

use fc_02_state::Statedb;
use fc_04_pool::{DebtPool, TxPool};
use fc_07_chain::{Blockchain, ChainError, ExecutorError};
use shared_types::consensus::block_reward;
use shared_types::{
    merkle_root, Address, Block, BlockHeader, Debt, Receipt, Transaction, U256, DEBT_SIZE,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Capabilities the miner pulls from the node.
pub trait MinerBackend: Send + Sync {
    fn chain(&self) -> Arc<Blockchain>;
    fn tx_pool(&self) -> Arc<TxPool>;
    fn debt_pool(&self) -> Arc<DebtPool>;
}

#[derive(Debug, Clone)]
pub struct MinerConfig {
    /// Gas cap for one block.
    pub block_gas_limit: u64,
    /// Byte budget for debts in one block.
    pub debt_size_budget: usize,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            block_gas_limit: 3_000_000,
            debt_size_budget: 200 * DEBT_SIZE,
        }
    }
}

#[derive(Debug, Error)]
pub enum MinerError {
    #[error("chain access failed")]
    Chain(#[from] ChainError),

    #[error("state access failed")]
    State(#[from] fc_02_state::StateError),

    #[error("reward application failed")]
    Reward(#[source] ExecutorError),
}

/// A candidate block under assembly.
pub struct Task {
    header: BlockHeader,
    coinbase: Address,
    config: MinerConfig,
    transactions: Vec<Transaction>,
    receipts: Vec<Receipt>,
    debts: Vec<Debt>,
}

impl Task {
    pub fn new(header: BlockHeader, coinbase: Address, config: MinerConfig) -> Self {
        Task {
            header,
            coinbase,
            config,
            transactions: Vec::new(),
            receipts: Vec::new(),
            debts: Vec::new(),
        }
    }

    /// Header template on top of `parent`.
    pub fn header_on_parent(parent: &BlockHeader, coinbase: Address, timestamp: u64) -> BlockHeader {
        BlockHeader {
            previous_hash: parent.hash(),
            creator: coinbase,
            height: parent.height + 1,
            timestamp: U256::from(timestamp),
            witness: vec![0u8; shared_types::WITNESS_SIZE],
            ..Default::default()
        }
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn debts(&self) -> &[Debt] {
        &self.debts
    }

    /// Outgoing debts this block's cross-shard transactions produce, for
    /// relay to their target shards.
    pub fn emitted_debts(&self) -> Vec<Debt> {
        self.transactions
            .iter()
            .filter_map(Debt::from_transaction)
            .collect()
    }

    /// Fill the task: settled debts first (execution order is part of the
    /// block contract), then the reward, then pool transactions.
    pub fn apply_transactions_and_debts(
        &mut self,
        backend: &dyn MinerBackend,
        state: &mut Statedb,
    ) -> Result<(), MinerError> {
        self.choose_debts(backend, state)?;
        self.handle_miner_reward(backend, state)?;
        self.choose_transactions(backend, state)?;
        info!(
            height = self.header.height,
            txs = self.transactions.len(),
            debts = self.debts.len(),
            "assembled block candidate"
        );
        Ok(())
    }

    /// Credit the coinbase with the height-scheduled reward.
    fn handle_miner_reward(
        &mut self,
        backend: &dyn MinerBackend,
        state: &mut Statedb,
    ) -> Result<U256, MinerError> {
        let reward = block_reward(self.header.height);
        let reward_tx = Transaction {
            to: self.coinbase,
            amount: reward,
            timestamp: self.header.height,
            ..Default::default()
        };
        let receipt = backend
            .chain()
            .executor()
            .apply(&reward_tx, state)
            .map_err(MinerError::Reward)?;
        self.transactions.push(reward_tx);
        self.receipts.push(receipt);
        Ok(reward)
    }

    /// Settle as many confirmed debts as the size budget allows.
    fn choose_debts(
        &mut self,
        backend: &dyn MinerBackend,
        state: &mut Statedb,
    ) -> Result<(), MinerError> {
        let (debts, used) = backend
            .debt_pool()
            .get_processable_debts(self.config.debt_size_budget);
        for debt in debts {
            state.add_balance(&debt.account, debt.amount)?;
            self.debts.push(debt);
        }
        if !self.debts.is_empty() {
            debug!(count = self.debts.len(), bytes = used, "packed debts");
        }
        Ok(())
    }

    /// Pop best-priced transactions until the pool dries up or the gas cap
    /// is reached; transactions that fail execution are skipped.
    fn choose_transactions(
        &mut self,
        backend: &dyn MinerBackend,
        state: &mut Statedb,
    ) -> Result<(), MinerError> {
        let pool = backend.tx_pool();
        let executor = backend.chain().executor();
        let mut used_gas = 0u64;

        while let Some(tx) = pool.pop_best_transaction() {
            if used_gas.saturating_add(tx.gas_limit) > self.config.block_gas_limit {
                debug!(gas = used_gas, "block gas cap reached");
                break;
            }

            match executor.apply(&tx, state) {
                Ok(receipt) => {
                    used_gas = used_gas.saturating_add(receipt.used_gas);
                    self.transactions.push(tx);
                    self.receipts.push(receipt);
                }
                Err(err) => {
                    warn!(tx = %tx.hash(), %err, "skipping failing transaction");
                }
            }
        }
        Ok(())
    }

    /// Derive the roots and produce the sealable block.
    pub fn generate_block(mut self, state: &mut Statedb) -> Result<Block, MinerError> {
        self.header.state_root = state.hash()?;
        self.header.tx_root = merkle_root(&self.transactions);
        self.header.receipt_root = merkle_root(&self.receipts);
        self.header.debt_root = merkle_root(&self.debts);
        Ok(Block::new(self.header, self.transactions, self.debts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fc_03_store::{BlockchainStore, MemoryStore};
    use fc_04_pool::{DebtPoolConfig, TxPoolConfig};
    use fc_05_zpow::ZpowEngine;
    use fc_07_chain::{GenesisInfo, TransferExecutor, TRANSFER_GAS};
    use fc_07_chain::events::HeadChanged;
    use shared_crypto::KeyPair;
    use shared_types::consensus::ChainReader;
    use shared_types::{DebtVerifier, Hash, StaticVerifier};
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc;
    use std::time::Duration;

    const SHARD: u8 = 1;

    struct TestBackend {
        chain: Arc<Blockchain>,
        tx_pool: Arc<TxPool>,
        debt_pool: Arc<DebtPool>,
    }

    impl MinerBackend for TestBackend {
        fn chain(&self) -> Arc<Blockchain> {
            self.chain.clone()
        }

        fn tx_pool(&self) -> Arc<TxPool> {
            self.tx_pool.clone()
        }

        fn debt_pool(&self) -> Arc<DebtPool> {
            self.debt_pool.clone()
        }
    }

    struct Fixture {
        backend: TestBackend,
        sender_key: KeyPair,
        sender: Address,
    }

    fn addr(shard: u8, tail: u8) -> Address {
        let mut bytes = [tail; 20];
        bytes[0] = shard << 4;
        Address(bytes)
    }

    fn fixture(verifier: Option<Arc<dyn DebtVerifier>>) -> Fixture {
        let sender_key = KeyPair::generate();
        let sender = Address::from_public_key(&sender_key.public_key_bytes(), SHARD);

        let mut info = GenesisInfo::new(SHARD);
        info.accounts = vec![(sender, U256::from(10u64) * U256::exp10(18))];
        info.difficulty = U256::from(10u64);

        let chain = Arc::new(
            Blockchain::open(
                info,
                Arc::new(BlockchainStore::new(Arc::new(MemoryStore::new()))),
                Arc::new(MemoryStore::new()),
                Arc::new(ZpowEngine::new(1)),
                Arc::new(TransferExecutor::new()),
                "",
            )
            .unwrap(),
        );

        let tx_pool = Arc::new(TxPool::new(
            TxPoolConfig::new(SHARD),
            chain.store(),
            chain.clone(),
        ));
        let debt_pool = Arc::new(DebtPool::new(
            DebtPoolConfig::new(SHARD),
            chain.store(),
            verifier,
        ));

        {
            let tx_pool = tx_pool.clone();
            let debt_pool = debt_pool.clone();
            chain.subscribe_head_changed(move |event: &HeadChanged| {
                tx_pool.on_head_changed(event.new_head, event.old_head);
                debt_pool.on_head_changed(event.new_head, event.old_head);
            });
        }

        Fixture {
            backend: TestBackend {
                chain,
                tx_pool,
                debt_pool,
            },
            sender_key,
            sender,
        }
    }

    fn transfer(f: &Fixture, nonce: u64, to: Address) -> Transaction {
        let mut tx = Transaction {
            from: f.sender,
            to,
            amount: U256::from(100u64),
            price: U256::one(),
            gas_limit: TRANSFER_GAS,
            nonce,
            timestamp: nonce,
            ..Default::default()
        };
        tx.sign(&f.sender_key).unwrap();
        tx
    }

    fn incoming_debt(seed: u64) -> Debt {
        Debt {
            tx_hash: Hash::of(&seed.to_be_bytes()),
            from: addr(2, 9),
            account: addr(SHARD, 5),
            amount: U256::from(50u64),
            price: U256::from(seed + 1),
            code: vec![],
        }
    }

    fn run_task(f: &Fixture) -> (Task, Statedb) {
        let chain = f.backend.chain();
        let parent = chain.genesis().header.clone();
        let coinbase = addr(SHARD, 0xC0);
        let header = Task::header_on_parent(&parent, coinbase, 100);

        let mut task = Task::new(header, coinbase, MinerConfig::default());
        let mut state = chain.state_at(parent.state_root).unwrap();
        task.apply_transactions_and_debts(&f.backend, &mut state)
            .unwrap();
        (task, state)
    }

    fn fill_pools(f: &Fixture) {
        // Three local transfers, two cross-shard ones.
        for nonce in 1..=3u64 {
            f.backend
                .tx_pool
                .add_transaction(transfer(f, nonce, addr(SHARD, 7)))
                .unwrap();
        }
        for nonce in 4..=5u64 {
            f.backend
                .tx_pool
                .add_transaction(transfer(f, nonce, addr(2, 7)))
                .unwrap();
        }
        for seed in 0..3u64 {
            f.backend.debt_pool.add_debt(incoming_debt(seed)).unwrap();
        }
        f.backend.debt_pool.do_checking_debt();
    }

    // =========================================================================
    // SELECTION
    // =========================================================================

    #[test]
    fn unconfirmed_debts_stay_out_of_the_block() {
        let f = fixture(Some(Arc::new(StaticVerifier::new(true, false))));
        fill_pools(&f);

        let (task, _state) = run_task(&f);
        assert_eq!(task.transactions().len(), 6); // reward + 5
        assert_eq!(task.debts().len(), 0);
        assert_eq!(f.backend.debt_pool.to_confirm_count(), 3);
    }

    #[test]
    fn confirmed_debts_are_packed() {
        let f = fixture(Some(Arc::new(StaticVerifier::new(true, true))));
        fill_pools(&f);

        let (task, _state) = run_task(&f);
        assert_eq!(task.transactions().len(), 6);
        assert_eq!(task.debts().len(), 3);
        assert_eq!(f.backend.debt_pool.to_confirm_count(), 0);
        assert_eq!(f.backend.debt_pool.processing_count(), 3);
    }

    #[test]
    fn reward_matches_the_height_schedule() {
        let f = fixture(None);
        let (task, _state) = run_task(&f);

        let reward_tx = &task.transactions()[0];
        assert!(reward_tx.is_reward());
        assert_eq!(reward_tx.amount, block_reward(1));
        assert_eq!(reward_tx.to, addr(SHARD, 0xC0));
    }

    #[test]
    fn emitted_debts_cover_cross_shard_transfers() {
        let f = fixture(None);
        fill_pools(&f);

        let (task, _state) = run_task(&f);
        let emitted = task.emitted_debts();
        assert_eq!(emitted.len(), 2);
        assert!(emitted.iter().all(|debt| debt.target_shard() == 2));
    }

    #[test]
    fn gas_cap_limits_selection() {
        let f = fixture(None);
        fill_pools(&f);

        let chain = f.backend.chain();
        let parent = chain.genesis().header.clone();
        let coinbase = addr(SHARD, 0xC0);
        let header = Task::header_on_parent(&parent, coinbase, 100);

        // Cap fits exactly two transfers.
        let config = MinerConfig {
            block_gas_limit: 2 * TRANSFER_GAS,
            ..Default::default()
        };
        let mut task = Task::new(header, coinbase, config);
        let mut state = chain.state_at(parent.state_root).unwrap();
        task.apply_transactions_and_debts(&f.backend, &mut state)
            .unwrap();

        assert_eq!(task.transactions().len(), 3); // reward + 2
    }

    // =========================================================================
    // SEAL AND WRITE
    // =========================================================================

    #[test]
    fn assembled_block_seals_and_writes() {
        let f = fixture(Some(Arc::new(StaticVerifier::new(true, true))));
        fill_pools(&f);

        let chain = f.backend.chain();
        let engine = chain.engine();
        let parent = chain.genesis().header.clone();
        let coinbase = addr(SHARD, 0xC0);
        let mut header = Task::header_on_parent(&parent, coinbase, 100);
        engine.prepare(chain.as_ref(), &mut header).unwrap();

        let mut task = Task::new(header, coinbase, MinerConfig::default());
        let mut state = chain.state_at(parent.state_root).unwrap();
        task.apply_transactions_and_debts(&f.backend, &mut state)
            .unwrap();
        let block = task.generate_block(&mut state).unwrap();

        let (sender, receiver) = mpsc::channel();
        engine
            .seal(
                chain.as_ref(),
                block,
                Arc::new(AtomicBool::new(false)),
                sender,
            )
            .unwrap();
        let sealed = receiver
            .recv_timeout(Duration::from_secs(30))
            .unwrap()
            .unwrap();

        chain.write_block(&sealed).unwrap();
        assert_eq!(chain.current_header().hash(), sealed.hash());

        // Pools drained: everything ended up in the canonical chain.
        assert_eq!(f.backend.tx_pool.pending_count(), 0);
        assert_eq!(f.backend.tx_pool.processing_count(), 0);
        assert_eq!(f.backend.debt_pool.confirmed_count(), 0);
        assert_eq!(f.backend.debt_pool.processing_count(), 0);

        // Balances reflect transfers, debts and the reward.
        let state = chain.current_state().unwrap();
        assert_eq!(
            state.get_balance(&addr(SHARD, 7)).unwrap(),
            U256::from(300u64)
        );
        assert_eq!(
            state.get_balance(&addr(SHARD, 5)).unwrap(),
            U256::from(150u64)
        );
        assert_eq!(
            state.get_balance(&coinbase).unwrap(),
            block_reward(1)
        );
        assert_eq!(state.get_nonce(&f.sender).unwrap(), 5);
    }
}
