//! The chain-facing engine adapter.
//!
//! Header-level duties of the consensus: filling in the Istanbul fields at
//! assembly time and validating sealed headers against the validator
//! snapshot in effect at their parent. Multi-validator agreement runs through
//! [`crate::core::Controller`]; the direct [`Engine::seal`] path only applies
//! to a single-validator set, where the proposer's own committed seal already
//! is the quorum.

use crate::config::IbftConfig;
use crate::errors::IbftError;
use crate::extra::{
    committed_seal_digest, prepare_extra, recover_sealer, seal_digest, write_committed_seals,
    write_seal, IstanbulExtra,
};
use crate::snapshot::Snapshot;
use crate::validator::ValidatorSet;
use fc_03_store::KeyValueStore;
use shared_crypto::{recover_public_key, KeyPair};
use shared_types::consensus::{verify_header_common, ChainReader, ConsensusError, Engine};
use shared_types::{Address, Block, BlockHeader, ConsensusType, Hash, U256, WITNESS_SIZE};
use std::sync::atomic::AtomicBool;
use std::sync::{mpsc, Arc};
use tracing::debug;

/// Snapshots persist every this many heights.
const CHECKPOINT_INTERVAL: u64 = 1024;

/// Istanbul blocks carry a fixed difficulty.
fn istanbul_difficulty() -> U256 {
    U256::one()
}

/// IBFT as a chain engine.
pub struct IbftEngine {
    config: IbftConfig,
    keypair: Arc<KeyPair>,
    db: Arc<dyn KeyValueStore>,
    shard: u8,
}

impl IbftEngine {
    pub fn new(
        config: IbftConfig,
        keypair: Arc<KeyPair>,
        db: Arc<dyn KeyValueStore>,
        shard: u8,
    ) -> Self {
        Self {
            config,
            keypair,
            db,
            shard,
        }
    }

    pub fn address(&self) -> Address {
        Address::from_public_key(&self.keypair.public_key_bytes(), self.shard)
    }

    /// Validator snapshot in effect at `(height, hash)`: walk back to a
    /// stored snapshot or genesis, then replay forward.
    pub fn snapshot(
        &self,
        chain: &dyn ChainReader,
        mut height: u64,
        mut hash: Hash,
    ) -> Result<Snapshot, IbftError> {
        let mut pending = Vec::new();

        let base = loop {
            if let Some(snapshot) = Snapshot::load(self.db.as_ref(), &hash)? {
                break snapshot;
            }
            let header = chain
                .header_by_hash(&hash)
                .ok_or(IbftError::UnknownAncestor(height))?;
            if height == 0 {
                let extra = IstanbulExtra::decode_from(&header.extra)?;
                let snapshot = Snapshot::new(
                    self.config.epoch,
                    0,
                    header.hash(),
                    ValidatorSet::new(extra.validators, self.config.proposer_policy),
                );
                snapshot.store(self.db.as_ref())?;
                break snapshot;
            }
            hash = header.previous_hash;
            height -= 1;
            pending.push(header);
        };

        pending.reverse();
        let snapshot = base.apply(&pending, self.shard)?;
        if snapshot.height % CHECKPOINT_INTERVAL == 0 && !pending.is_empty() {
            snapshot.store(self.db.as_ref())?;
            debug!(height = snapshot.height, "stored validator snapshot");
        }
        Ok(snapshot)
    }

    /// The proposal hash committed seals sign: the header with the committed
    /// seals (and only those) cleared.
    fn proposal_hash(header: &BlockHeader) -> Result<Hash, IbftError> {
        let mut extra = IstanbulExtra::decode_from(&header.extra)?;
        extra.committed_seals = Vec::new();
        let mut cleared = header.clone();
        cleared.extra = extra.encode_with_vanity();
        Ok(cleared.hash())
    }

    fn verify_committed_seals(
        &self,
        header: &BlockHeader,
        validators: &ValidatorSet,
    ) -> Result<(), IbftError> {
        let extra = IstanbulExtra::decode_from(&header.extra)?;
        let digest = committed_seal_digest(&Self::proposal_hash(header)?);

        let mut signers = Vec::new();
        for seal in &extra.committed_seals {
            let public_key = recover_public_key(&digest, seal)?;
            let signer = Address::from_public_key(&public_key, self.shard);
            if validators.contains(&signer) && !signers.contains(&signer) {
                signers.push(signer);
            }
        }

        if signers.len() < validators.quorum() {
            return Err(IbftError::InvalidMessage);
        }
        Ok(())
    }
}

impl Engine for IbftEngine {
    fn prepare(
        &self,
        chain: &dyn ChainReader,
        header: &mut BlockHeader,
    ) -> Result<(), ConsensusError> {
        let parent = chain
            .header_by_hash(&header.previous_hash)
            .ok_or(ConsensusError::InvalidParent(header.previous_hash))?;

        let snapshot = self
            .snapshot(chain, parent.height, parent.hash())
            .map_err(|err| ConsensusError::InvalidSeal(err.to_string()))?;

        header.consensus = ConsensusType::Istanbul;
        header.difficulty = istanbul_difficulty();
        if header.witness.len() != WITNESS_SIZE {
            header.witness = vec![0u8; WITNESS_SIZE];
        }
        prepare_extra(header, snapshot.validators());
        Ok(())
    }

    fn verify_header(
        &self,
        chain: &dyn ChainReader,
        header: &BlockHeader,
    ) -> Result<(), ConsensusError> {
        let parent = chain
            .header_by_hash(&header.previous_hash)
            .ok_or(ConsensusError::InvalidParent(header.previous_hash))?;

        verify_header_common(header, &parent)?;

        if header.difficulty != istanbul_difficulty() {
            return Err(ConsensusError::InvalidDifficulty {
                have: header.difficulty,
                want: istanbul_difficulty(),
            });
        }

        let snapshot = self
            .snapshot(chain, parent.height, parent.hash())
            .map_err(|err| ConsensusError::InvalidSeal(err.to_string()))?;

        // The proposer identifies itself through the seal alone; the creator
        // field carries the vote target and stays empty on non-voting blocks.
        let sealer = recover_sealer(header, self.shard)
            .map_err(|err| ConsensusError::InvalidSeal(err.to_string()))?;
        if !snapshot.validator_set.contains(&sealer) {
            return Err(ConsensusError::InvalidSeal(
                "sealer is not an authorized validator".into(),
            ));
        }

        self.verify_committed_seals(header, &snapshot.validator_set)
            .map_err(|err| ConsensusError::InvalidSeal(err.to_string()))?;
        Ok(())
    }

    /// Sign and publish directly; valid only when this node is the entire
    /// validator set (quorum of one). Larger sets agree through the
    /// consensus controller before blocks reach the chain.
    fn seal(
        &self,
        chain: &dyn ChainReader,
        block: Block,
        _stop: Arc<AtomicBool>,
        results: mpsc::Sender<Option<Block>>,
    ) -> Result<(), ConsensusError> {
        let parent = chain
            .header_by_hash(&block.header.previous_hash)
            .ok_or(ConsensusError::InvalidParent(block.header.previous_hash))?;

        let snapshot = self
            .snapshot(chain, parent.height, parent.hash())
            .map_err(|err| ConsensusError::InvalidSeal(err.to_string()))?;

        let me = self.address();
        if !snapshot.validator_set.contains(&me) {
            return Err(ConsensusError::InvalidSeal(
                "this node is not an authorized validator".into(),
            ));
        }
        if snapshot.validator_set.len() != 1 {
            return Err(ConsensusError::InvalidSeal(
                "multi-validator sealing runs through the consensus controller".into(),
            ));
        }

        let mut header = block.header.clone();

        let seal = |digest: [u8; 32]| {
            self.keypair
                .sign_digest(&digest)
                .map(|s| s.to_vec())
                .map_err(|err| ConsensusError::InvalidSeal(err.to_string()))
        };

        let digest =
            seal_digest(&header).map_err(|err| ConsensusError::InvalidSeal(err.to_string()))?;
        write_seal(&mut header, seal(digest)?)
            .map_err(|err| ConsensusError::InvalidSeal(err.to_string()))?;

        let proposal_hash = Self::proposal_hash(&header)
            .map_err(|err| ConsensusError::InvalidSeal(err.to_string()))?;
        let committed = seal(committed_seal_digest(&proposal_hash))?;
        write_committed_seals(&mut header, vec![committed])
            .map_err(|err| ConsensusError::InvalidSeal(err.to_string()))?;

        let _ = results.send(Some(block.with_seal(header)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extra::NONCE_DROP_VOTE;
    use fc_03_store::MemoryStore;
    use std::collections::HashMap;
    use std::time::Duration;

    struct MapChain {
        headers: HashMap<Hash, BlockHeader>,
        head: Hash,
    }

    impl MapChain {
        fn new(genesis: BlockHeader) -> Self {
            let head = genesis.hash();
            MapChain {
                headers: HashMap::from([(head, genesis)]),
                head,
            }
        }

        fn insert(&mut self, header: BlockHeader) {
            let hash = header.hash();
            self.headers.insert(hash, header);
            self.head = hash;
        }
    }

    impl ChainReader for MapChain {
        fn current_header(&self) -> BlockHeader {
            self.headers[&self.head].clone()
        }

        fn header_by_hash(&self, hash: &Hash) -> Option<BlockHeader> {
            self.headers.get(hash).cloned()
        }

        fn header_by_height(&self, height: u64) -> Option<BlockHeader> {
            self.headers.values().find(|h| h.height == height).cloned()
        }
    }

    fn solo_engine() -> (IbftEngine, MapChain) {
        let keypair = Arc::new(KeyPair::generate());
        let engine = IbftEngine::new(
            IbftConfig::default(),
            keypair,
            Arc::new(MemoryStore::new()),
            1,
        );

        let mut genesis = BlockHeader {
            height: 0,
            difficulty: istanbul_difficulty(),
            timestamp: U256::from(1u64),
            witness: NONCE_DROP_VOTE.to_vec(),
            consensus: ConsensusType::Istanbul,
            ..Default::default()
        };
        prepare_extra(&mut genesis, vec![engine.address()]);
        let chain = MapChain::new(genesis);
        (engine, chain)
    }

    fn child_block(engine: &IbftEngine, chain: &MapChain) -> Block {
        let parent = chain.current_header();
        let mut header = BlockHeader {
            previous_hash: parent.hash(),
            creator: Address::EMPTY,
            height: parent.height + 1,
            timestamp: parent.timestamp + U256::from(1u64),
            witness: NONCE_DROP_VOTE.to_vec(),
            ..Default::default()
        };
        engine.prepare(chain, &mut header).unwrap();
        Block::new(header, vec![], vec![])
    }

    #[test]
    fn genesis_snapshot_comes_from_extra() {
        let (engine, chain) = solo_engine();
        let genesis = chain.current_header();
        let snapshot = engine.snapshot(&chain, 0, genesis.hash()).unwrap();
        assert_eq!(snapshot.validators(), vec![engine.address()]);
    }

    #[test]
    fn prepare_sets_istanbul_fields() {
        let (engine, chain) = solo_engine();
        let block = child_block(&engine, &chain);
        assert_eq!(block.header.consensus, ConsensusType::Istanbul);
        assert_eq!(block.header.difficulty, istanbul_difficulty());
        let extra = IstanbulExtra::decode_from(&block.header.extra).unwrap();
        assert_eq!(extra.validators, vec![engine.address()]);
    }

    #[test]
    fn solo_seal_round_trips_through_verify() {
        let (engine, mut chain) = solo_engine();
        let block = child_block(&engine, &chain);

        let (sender, receiver) = mpsc::channel();
        engine
            .seal(&chain, block, Arc::new(AtomicBool::new(false)), sender)
            .unwrap();
        let sealed = receiver
            .recv_timeout(Duration::from_secs(5))
            .unwrap()
            .unwrap();

        engine.verify_header(&chain, &sealed.header).unwrap();
        chain.insert(sealed.header.clone());

        // And the chain extends to a second height.
        let next = child_block(&engine, &chain);
        let (sender, receiver) = mpsc::channel();
        engine
            .seal(&chain, next, Arc::new(AtomicBool::new(false)), sender)
            .unwrap();
        let sealed = receiver
            .recv_timeout(Duration::from_secs(5))
            .unwrap()
            .unwrap();
        engine.verify_header(&chain, &sealed.header).unwrap();
    }

    #[test]
    fn foreign_sealer_is_rejected() {
        let (engine, chain) = solo_engine();
        let block = child_block(&engine, &chain);

        // A stranger signs the same header.
        let stranger = KeyPair::generate();
        let mut header = block.header.clone();
        header.creator = Address::from_public_key(&stranger.public_key_bytes(), 1);
        let digest = seal_digest(&header).unwrap();
        write_seal(&mut header, stranger.sign_digest(&digest).unwrap().to_vec()).unwrap();
        let proposal_hash = IbftEngine::proposal_hash(&header).unwrap();
        let committed = stranger
            .sign_digest(&committed_seal_digest(&proposal_hash))
            .unwrap()
            .to_vec();
        write_committed_seals(&mut header, vec![committed]).unwrap();

        assert!(matches!(
            engine.verify_header(&chain, &header),
            Err(ConsensusError::InvalidSeal(_))
        ));
    }

    #[test]
    fn missing_committed_seals_fail_quorum() {
        let (engine, chain) = solo_engine();
        let block = child_block(&engine, &chain);

        let (sender, receiver) = mpsc::channel();
        engine
            .seal(&chain, block, Arc::new(AtomicBool::new(false)), sender)
            .unwrap();
        let sealed = receiver
            .recv_timeout(Duration::from_secs(5))
            .unwrap()
            .unwrap();

        let mut stripped = sealed.header.clone();
        write_committed_seals(&mut stripped, vec![]).unwrap();
        assert!(matches!(
            engine.verify_header(&chain, &stripped),
            Err(ConsensusError::InvalidSeal(_))
        ));
    }

    #[test]
    fn wrong_difficulty_is_rejected() {
        let (engine, chain) = solo_engine();
        let mut block = child_block(&engine, &chain);
        block.header.difficulty = U256::from(7u64);
        assert!(matches!(
            engine.verify_header(&chain, &block.header),
            Err(ConsensusError::InvalidDifficulty { .. })
        ));
    }
}
