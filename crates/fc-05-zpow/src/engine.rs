//! Sealing and verification.

use crate::difficulty::next_difficulty;
use crate::matrix::{mining_target, satisfies_target};
use rand::Rng;
use shared_types::consensus::{verify_header_common, ChainReader, ConsensusError, Engine};
use shared_types::{Block, BlockHeader, Hash};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use tracing::{debug, info, warn};

/// The matrix-determinant proof-of-work engine.
pub struct ZpowEngine {
    threads: usize,
}

impl ZpowEngine {
    pub fn new(threads: usize) -> Self {
        let mut engine = ZpowEngine { threads: 1 };
        engine.set_threads(threads);
        engine
    }

    /// Set the worker count; zero selects the available parallelism.
    pub fn set_threads(&mut self, threads: usize) {
        self.threads = if threads == 0 {
            thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            threads
        };
    }

    pub fn threads(&self) -> usize {
        self.threads
    }
}

impl Engine for ZpowEngine {
    fn prepare(
        &self,
        chain: &dyn ChainReader,
        header: &mut BlockHeader,
    ) -> Result<(), ConsensusError> {
        let parent = chain
            .header_by_hash(&header.previous_hash)
            .ok_or(ConsensusError::InvalidParent(header.previous_hash))?;
        header.difficulty = next_difficulty(header.timestamp, &parent);
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

        let expected = next_difficulty(header.timestamp, &parent);
        if header.difficulty != expected {
            return Err(ConsensusError::InvalidDifficulty {
                have: header.difficulty,
                want: expected,
            });
        }

        if !satisfies_target(&header.hash(), header.height, header.difficulty) {
            return Err(ConsensusError::NonceInvalid);
        }
        Ok(())
    }

    fn seal(
        &self,
        _chain: &dyn ChainReader,
        block: Block,
        stop: Arc<AtomicBool>,
        results: mpsc::Sender<Option<Block>>,
    ) -> Result<(), ConsensusError> {
        let threads = self.threads as u64;
        let step = u64::MAX / threads;

        let found = Arc::new(AtomicBool::new(false));
        let published = Arc::new(AtomicBool::new(false));
        let mut rng = rand::thread_rng();

        info!(
            threads,
            height = block.height(),
            difficulty = %block.header.difficulty,
            "starting nonce search"
        );

        for i in 0..threads {
            let min = i * step;
            let max = if i == threads - 1 {
                u64::MAX
            } else {
                min + step - 1
            };
            let seed = min + rng.gen_range(0..=(max - min));

            let block = block.clone();
            let stop = Arc::clone(&stop);
            let found = Arc::clone(&found);
            let published = Arc::clone(&published);
            let results = results.clone();

            thread::spawn(move || {
                mine_range(block, seed, min, max, results, stop, found, published);
            });
        }

        Ok(())
    }
}

/// One worker's traversal of `[seed..=max]` then `[min..seed)`.
#[allow(clippy::too_many_arguments)]
fn mine_range(
    block: Block,
    seed: u64,
    min: u64,
    max: u64,
    results: mpsc::Sender<Option<Block>>,
    stop: Arc<AtomicBool>,
    found: Arc<AtomicBool>,
    published: Arc<AtomicBool>,
) {
    let mut header = block.header.clone();
    let target = mining_target(header.difficulty);
    let mut nonce = seed;
    let mut attempts = 0u64;

    loop {
        if stop.load(Ordering::Relaxed) {
            debug!(attempts, "nonce search aborted");
            return;
        }
        if found.load(Ordering::Relaxed) {
            debug!("exiting, nonce found by another worker");
            return;
        }
        attempts += 1;

        header.witness = nonce.to_string().into_bytes();
        let hash = header.hash();

        if satisfies_target(&hash, header.height, header.difficulty) {
            if publish_once(&published, &results, Some(block.with_seal(header))) {
                found.store(true, Ordering::SeqCst);
                debug!(nonce, attempts, target, "sealed block");
            }
            return;
        }

        // Wrap around the assigned range; a full cycle back to the seed is an
        // outage.
        nonce = if nonce == max { min } else { nonce + 1 };
        if nonce == seed {
            if publish_once(&published, &results, None) {
                warn!("nonce search outage, range exhausted");
            }
            return;
        }
    }
}

/// Single-publication guard: only the first caller's message reaches the
/// channel.
fn publish_once(
    published: &AtomicBool,
    results: &mpsc::Sender<Option<Block>>,
    message: Option<Block>,
) -> bool {
    if published
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return false;
    }
    let _ = results.send(message);
    true
}
