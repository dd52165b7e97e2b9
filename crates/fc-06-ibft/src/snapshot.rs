//! Validator-set snapshots and header voting.
//!
//! Each sealed header may carry one vote: the `creator` field names the
//! target, the witness sentinel gives the direction, and the seal identifies
//! the voter. Replaying headers over a snapshot yields the validator set in
//! effect after them. Tallies are never persisted; they are recomputed from
//! the vote list, so stored snapshots cannot disagree with their votes.

use crate::errors::IbftError;
use crate::extra::{recover_sealer, vote_of_witness};
use crate::validator::ValidatorSet;
use fc_03_store::KeyValueStore;
use serde::{Deserialize, Serialize};
use shared_types::{Address, BlockHeader, Hash};
use std::collections::HashMap;
use tracing::debug;

const SNAPSHOT_PREFIX: &[u8] = b"ibft-snap-";

fn snapshot_key(hash: &Hash) -> Vec<u8> {
    let mut key = SNAPSHOT_PREFIX.to_vec();
    key.extend_from_slice(hash.as_bytes());
    key
}

/// One cast vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    /// Who cast it.
    pub validator: Address,
    /// Height it was cast at.
    pub block: u64,
    /// Who it is about.
    pub address: Address,
    /// Add (`true`) or drop (`false`).
    pub authorize: bool,
}

/// Running count toward one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Tally {
    pub authorize: bool,
    pub votes: usize,
}

/// The validator set and open votes at a given chain position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub epoch: u64,
    pub height: u64,
    pub hash: Hash,
    pub votes: Vec<Vote>,
    #[serde(skip)]
    pub tally: HashMap<Address, Tally>,
    pub validator_set: ValidatorSet,
}

impl Snapshot {
    pub fn new(epoch: u64, height: u64, hash: Hash, validator_set: ValidatorSet) -> Self {
        Snapshot {
            epoch,
            height,
            hash,
            votes: Vec::new(),
            tally: HashMap::new(),
            validator_set,
        }
    }

    /// Current validators, sorted.
    pub fn validators(&self) -> Vec<Address> {
        self.validator_set.addresses().to_vec()
    }

    /// A vote is meaningful only if it would change membership.
    fn valid_vote(&self, address: &Address, authorize: bool) -> bool {
        self.validator_set.contains(address) != authorize
    }

    /// Count a vote; returns whether it was tallied.
    fn cast(&mut self, address: Address, authorize: bool) -> bool {
        if !self.valid_vote(&address, authorize) {
            return false;
        }
        match self.tally.get_mut(&address) {
            Some(tally) => {
                if tally.authorize != authorize {
                    return false;
                }
                tally.votes += 1;
            }
            None => {
                self.tally.insert(address, Tally { authorize, votes: 1 });
            }
        }
        true
    }

    /// Remove a previously counted vote.
    fn uncast(&mut self, address: &Address, authorize: bool) {
        let Some(tally) = self.tally.get_mut(address) else {
            return;
        };
        if tally.authorize != authorize {
            return;
        }
        if tally.votes > 1 {
            tally.votes -= 1;
        } else {
            self.tally.remove(address);
        }
    }

    /// Replay `headers` (contiguous, ascending from this snapshot) and
    /// return the resulting snapshot. `shard` localizes recovered voter
    /// addresses.
    pub fn apply(&self, headers: &[BlockHeader], shard: u8) -> Result<Snapshot, IbftError> {
        let Some(last) = headers.last() else {
            return Ok(self.clone());
        };

        for window in headers.windows(2) {
            if window[1].height != window[0].height + 1 {
                return Err(IbftError::InvalidMessage);
            }
        }
        if headers[0].height != self.height + 1 {
            return Err(IbftError::InvalidMessage);
        }

        let mut snap = self.clone();

        for header in headers {
            // Checkpoint: wipe the in-flight election state.
            if header.height % snap.epoch == 0 {
                snap.votes.clear();
                snap.tally.clear();
            }

            let voter = recover_sealer(header, shard)?;
            if !snap.validator_set.contains(&voter) {
                return Err(IbftError::UnauthorizedAddress);
            }

            let target = header.creator;
            let authorize = vote_of_witness(&header.witness)?;

            // One open vote per (voter, target): a re-vote supersedes.
            if let Some(pos) = snap
                .votes
                .iter()
                .position(|vote| vote.validator == voter && vote.address == target)
            {
                let old = snap.votes.remove(pos);
                snap.uncast(&old.address, old.authorize);
            }

            if snap.cast(target, authorize) {
                snap.votes.push(Vote {
                    validator: voter,
                    block: header.height,
                    address: target,
                    authorize,
                });
            }

            // Majority reached: apply the membership change.
            if let Some(tally) = snap.tally.get(&target).copied() {
                if tally.votes > snap.validator_set.len() / 2 {
                    if tally.authorize {
                        snap.validator_set.add(target);
                    } else {
                        snap.validator_set.remove(&target);
                        // A dropped validator's own pending votes die with it.
                        let mut i = 0;
                        while i < snap.votes.len() {
                            if snap.votes[i].validator == target {
                                let dead = snap.votes.remove(i);
                                snap.uncast(&dead.address, dead.authorize);
                            } else {
                                i += 1;
                            }
                        }
                    }
                    // Votes about the changed address are settled.
                    snap.votes.retain(|vote| vote.address != target);
                    snap.tally.remove(&target);
                    debug!(target = %target, authorized = tally.authorize, "validator set changed");
                }
            }
        }

        snap.height = last.height;
        snap.hash = last.hash();
        Ok(snap)
    }

    /// Rebuild the tally from the vote list (after deserialization).
    fn rebuild_tally(&mut self) {
        self.tally.clear();
        for vote in &self.votes {
            let entry = self.tally.entry(vote.address).or_insert(Tally {
                authorize: vote.authorize,
                votes: 0,
            });
            if entry.authorize == vote.authorize {
                entry.votes += 1;
            }
        }
    }

    /// Persist under the snapshot's block hash.
    pub fn store(&self, db: &dyn KeyValueStore) -> Result<(), IbftError> {
        let encoded = serde_json::to_vec(self)?;
        db.put(&snapshot_key(&self.hash), &encoded)
            .map_err(fc_03_store::StoreError::from)?;
        Ok(())
    }

    /// Load the snapshot stored for `hash`, if any.
    pub fn load(db: &dyn KeyValueStore, hash: &Hash) -> Result<Option<Snapshot>, IbftError> {
        let Some(bytes) = db
            .get(&snapshot_key(hash))
            .map_err(fc_03_store::StoreError::from)?
        else {
            return Ok(None);
        };
        let mut snapshot: Snapshot = serde_json::from_slice(&bytes)?;
        snapshot.rebuild_tally();
        Ok(Some(snapshot))
    }
}
