//! The replicated state machine.
//!
//! [`Core`] is strictly sequential: every transition happens inside one of
//! its `handle_*` methods, so it needs no interior locking. [`Controller`]
//! owns a core on a dedicated thread and feeds it network messages, chain
//! head notifications, proposal requests and round timeouts through one
//! channel.

use crate::backlog::Backlog;
use crate::config::IbftConfig;
use crate::errors::IbftError;
use crate::extra::committed_seal_digest;
use crate::message::{Message, MsgCode, Payload, Preprepare, Subject, View};
use crate::validator::ValidatorSet;
use shared_crypto::KeyPair;
use shared_types::{Address, Block, Hash};
use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Chain-facing capabilities the core consumes.
pub trait Backend: Send + Sync {
    /// Deliver a message to every other validator.
    fn broadcast(&self, message: Message);

    /// Validate a proposal's content (header, body, parent linkage).
    fn verify(&self, proposal: &Block) -> Result<(), IbftError>;

    /// Persist an agreed proposal together with its committed seals.
    fn commit(&self, proposal: Block, committed_seals: Vec<Vec<u8>>) -> Result<(), IbftError>;

    /// Validator set for the given sequence.
    fn validators(&self, sequence: u64) -> ValidatorSet;

    /// Hash and height of the latest committed proposal.
    fn last_proposal(&self) -> (Hash, u64);
}

/// Protocol states, in commit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    AcceptRequest = 0,
    Preprepared = 1,
    Prepared = 2,
    Committed = 3,
}

/// Messages of one kind collected for the current view, keyed by sender.
#[derive(Debug, Default)]
struct MessageSet {
    messages: HashMap<Address, Message>,
}

impl MessageSet {
    fn add(&mut self, message: Message) {
        self.messages.insert(message.address, message);
    }

    fn len(&self) -> usize {
        self.messages.len()
    }

    fn committed_seals(&self) -> Vec<Vec<u8>> {
        self.messages
            .values()
            .map(|message| message.committed_seal.clone())
            .collect()
    }
}

/// State scoped to one (sequence, round).
#[derive(Debug, Default)]
struct RoundState {
    sequence: u64,
    round: u64,
    preprepare: Option<Preprepare>,
    prepares: MessageSet,
    commits: MessageSet,
    locked_hash: Hash,
    pending_request: Option<Block>,
}

impl RoundState {
    fn view(&self) -> View {
        View::new(self.sequence, self.round)
    }

    fn proposal_hash(&self) -> Option<Hash> {
        self.preprepare
            .as_ref()
            .map(|preprepare| preprepare.proposal.hash())
    }
}

/// The IBFT core state machine.
pub struct Core {
    config: IbftConfig,
    address: Address,
    keypair: Arc<KeyPair>,
    backend: Arc<dyn Backend>,

    state: State,
    current: RoundState,
    validators: ValidatorSet,
    wait_for_round_change: bool,
    backlog: Backlog,
    round_changes: HashMap<u64, MessageSet>,
    round_deadline: Option<Instant>,
}

impl Core {
    pub fn new(config: IbftConfig, keypair: Arc<KeyPair>, backend: Arc<dyn Backend>) -> Self {
        let address = Address::from_public_key(&keypair.public_key_bytes(), 0);
        Self::with_address(config, address, keypair, backend)
    }

    /// Build a core whose address carries an explicit shard nibble.
    pub fn with_address(
        config: IbftConfig,
        address: Address,
        keypair: Arc<KeyPair>,
        backend: Arc<dyn Backend>,
    ) -> Self {
        Core {
            config,
            address,
            keypair,
            backend,
            state: State::AcceptRequest,
            current: RoundState::default(),
            validators: ValidatorSet::new(Vec::new(), Default::default()),
            wait_for_round_change: false,
            backlog: Backlog::new(),
            round_changes: HashMap::new(),
            round_deadline: None,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn current_view(&self) -> View {
        self.current.view()
    }

    pub fn is_proposer(&self) -> bool {
        self.validators
            .is_proposer(&self.address, self.current.sequence, self.current.round)
    }

    /// Enter the first round for the sequence after the chain head.
    pub fn start(&mut self) {
        self.start_new_round(0);
    }

    /// Time left on the round-change timer, if armed.
    pub fn time_until_deadline(&self) -> Option<Duration> {
        self.round_deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    fn round_timeout(&self, round: u64) -> Duration {
        let shift = round.min(16) as u32;
        Duration::from_millis(self.config.request_timeout_ms.saturating_mul(1 << shift))
    }

    // -------------------------------------------------------------------------
    // Round lifecycle
    // -------------------------------------------------------------------------

    fn start_new_round(&mut self, round: u64) {
        let (last_hash, last_height) = self.backend.last_proposal();

        let sequence = if round == 0 {
            last_height + 1
        } else {
            self.current.sequence
        };
        // A pending request for a different sequence is stale.
        let carried_request = self
            .current
            .pending_request
            .take()
            .filter(|block| block.height() == sequence);

        if round == 0 {
            self.validators = self.backend.validators(sequence);
        }

        let locked_hash = if round > 0 {
            self.current.locked_hash
        } else {
            Hash::EMPTY
        };
        let preprepare = if round > 0 && !locked_hash.is_empty() {
            self.current.preprepare.take()
        } else {
            None
        };

        self.current = RoundState {
            sequence,
            round,
            preprepare,
            prepares: MessageSet::default(),
            commits: MessageSet::default(),
            locked_hash,
            pending_request: carried_request,
        };
        self.state = State::AcceptRequest;
        self.wait_for_round_change = false;
        self.round_changes.retain(|&r, _| r > round);
        self.round_deadline = Some(Instant::now() + self.round_timeout(round));

        debug!(
            sequence,
            round,
            parent = %last_hash,
            proposer = self.is_proposer(),
            "new round"
        );

        // A locked proposal re-proposes itself; otherwise the pending
        // request does.
        if self.is_proposer() {
            if let Some(preprepare) = self.current.preprepare.clone() {
                self.send_preprepare_for(preprepare.proposal);
            } else if let Some(request) = self.current.pending_request.clone() {
                self.send_preprepare_for(request);
            }
        }

        self.process_backlog();
    }

    /// A proposal produced locally (by the miner) for this sequence.
    pub fn handle_request(&mut self, proposal: Block) -> Result<(), IbftError> {
        if proposal.height() != self.current.sequence {
            debug!(
                height = proposal.height(),
                sequence = self.current.sequence,
                "request out of sequence"
            );
            return Err(IbftError::FutureMessage);
        }
        self.current.pending_request = Some(proposal.clone());
        if self.state == State::AcceptRequest && self.is_proposer() {
            self.send_preprepare_for(proposal);
        }
        Ok(())
    }

    /// The chain committed a block; move to the next sequence.
    pub fn handle_final_committed(&mut self) {
        debug!("received a final committed proposal");
        self.current.locked_hash = Hash::EMPTY;
        self.current.preprepare = None;
        self.start_new_round(0);
    }

    /// The round timer fired.
    pub fn handle_timeout(&mut self) {
        let round = self.current.round + 1;
        warn!(
            sequence = self.current.sequence,
            round, "round timed out, requesting round change"
        );
        self.send_round_change(round);
    }

    // -------------------------------------------------------------------------
    // Message intake
    // -------------------------------------------------------------------------

    /// Decode, authenticate and dispatch an encoded message from a peer.
    pub fn handle_encoded(&mut self, bytes: &[u8]) -> Result<(), IbftError> {
        use shared_types::CanonicalDecode;
        let message = Message::from_canonical_bytes(bytes)?;
        let signer = message.verify(&self.validators)?;
        self.dispatch(message, signer)
    }

    /// Gate a message against the current view and state.
    fn check_message(&self, code: MsgCode, view: View) -> Result<(), IbftError> {
        let current = self.current.view();

        if code == MsgCode::RoundChange {
            if view.sequence > current.sequence {
                return Err(IbftError::FutureMessage);
            }
            if view < current {
                return Err(IbftError::OldMessage);
            }
            return Ok(());
        }

        if view > current {
            return Err(IbftError::FutureMessage);
        }
        if view < current {
            return Err(IbftError::OldMessage);
        }
        if self.wait_for_round_change {
            return Err(IbftError::FutureMessage);
        }

        // AcceptRequest admits only PREPREPARE; the rest wait.
        if self.state == State::AcceptRequest && code != MsgCode::Preprepare {
            return Err(IbftError::FutureMessage);
        }

        Ok(())
    }

    fn dispatch(&mut self, message: Message, src: Address) -> Result<(), IbftError> {
        match self.check_message(message.code, message.view()) {
            Ok(()) => {}
            Err(IbftError::FutureMessage) => {
                if src != self.address {
                    debug!(code = ?message.code, view = ?message.view(), "backlogged future message");
                    self.backlog.store(src, message);
                }
                return Ok(());
            }
            Err(IbftError::OldMessage) => {
                debug!(code = ?message.code, "dropped old message");
                return Ok(());
            }
            Err(err) => return Err(err),
        }

        let result = match message.code {
            MsgCode::Preprepare => self.handle_preprepare(&message, src),
            MsgCode::Prepare => self.handle_prepare(&message, src),
            MsgCode::Commit => self.handle_commit(&message, src),
            MsgCode::RoundChange => self.handle_round_change(&message, src),
        };
        if let Err(err) = &result {
            debug!(code = ?message.code, %err, "message rejected");
        }
        result
    }

    // -------------------------------------------------------------------------
    // Phase handlers
    // -------------------------------------------------------------------------

    fn handle_preprepare(&mut self, message: &Message, src: Address) -> Result<(), IbftError> {
        let Payload::Preprepare(preprepare) = &message.payload else {
            return Err(IbftError::InvalidMessage);
        };

        if !self
            .validators
            .is_proposer(&src, self.current.sequence, self.current.round)
        {
            return Err(IbftError::NotFromProposer);
        }

        if preprepare.proposal.height() != self.current.sequence {
            return Err(IbftError::InvalidMessage);
        }

        self.backend.verify(&preprepare.proposal)?;

        if self.state != State::AcceptRequest {
            return Ok(());
        }

        let proposal_hash = preprepare.proposal.hash();
        if !self.current.locked_hash.is_empty() && self.current.locked_hash != proposal_hash {
            // Locked on a different proposal: force a round change.
            self.send_round_change(self.current.round + 1);
            return Ok(());
        }

        self.current.preprepare = Some(preprepare.clone());
        self.set_state(State::Preprepared);
        self.send_subject(MsgCode::Prepare, proposal_hash);
        Ok(())
    }

    fn handle_prepare(&mut self, message: &Message, _src: Address) -> Result<(), IbftError> {
        let subject = message.payload.subject().ok_or(IbftError::InvalidMessage)?;
        self.verify_subject(subject)?;

        self.current.prepares.add(message.clone());

        if self.current.prepares.len() >= self.validators.quorum()
            && self.state == State::Preprepared
        {
            self.current.locked_hash = subject.digest;
            self.set_state(State::Prepared);
            self.send_commit(subject.digest);
        }
        Ok(())
    }

    fn handle_commit(&mut self, message: &Message, _src: Address) -> Result<(), IbftError> {
        let subject = message.payload.subject().ok_or(IbftError::InvalidMessage)?;
        self.verify_subject(subject)?;

        self.current.commits.add(message.clone());

        if self.current.commits.len() >= self.validators.quorum() && self.state < State::Committed
        {
            self.current.locked_hash = subject.digest;
            self.commit();
        }
        Ok(())
    }

    fn commit(&mut self) {
        self.set_state(State::Committed);

        let Some(preprepare) = self.current.preprepare.clone() else {
            // Commit quorum without the proposal itself: recover via round
            // change.
            self.send_round_change(self.current.round + 1);
            return;
        };

        let seals = self.current.commits.committed_seals();
        info!(
            sequence = self.current.sequence,
            round = self.current.round,
            proposal = %preprepare.proposal.hash(),
            seals = seals.len(),
            "committing proposal"
        );
        if let Err(err) = self.backend.commit(preprepare.proposal, seals) {
            warn!(%err, "backend rejected committed proposal, changing round");
            self.send_round_change(self.current.round + 1);
        }
    }

    fn handle_round_change(&mut self, message: &Message, _src: Address) -> Result<(), IbftError> {
        let subject = message.payload.subject().ok_or(IbftError::InvalidMessage)?;
        let round = subject.view.round;

        let set = self.round_changes.entry(round).or_default();
        set.add(message.clone());
        let count = set.len();

        let f_plus_one = self.validators.f() + 1;
        let quorum = self.validators.quorum();

        if count >= quorum && (self.wait_for_round_change || self.current.round < round) {
            // Enough validators want this round: move.
            self.start_new_round(round);
        } else if self.wait_for_round_change
            && count >= f_plus_one
            && self.current.round < round
        {
            // Catch up to the highest round with F+1 backers.
            self.send_round_change(round);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Sending
    // -------------------------------------------------------------------------

    fn send_preprepare_for(&mut self, proposal: Block) {
        let preprepare = Preprepare {
            view: self.current.view(),
            proposal,
        };
        self.broadcast(MsgCode::Preprepare, Payload::Preprepare(preprepare), Vec::new());
    }

    fn send_subject(&mut self, code: MsgCode, digest: Hash) {
        let subject = Subject {
            view: self.current.view(),
            digest,
        };
        self.broadcast(code, Payload::Subject(subject), Vec::new());
    }

    fn send_commit(&mut self, digest: Hash) {
        let seal_digest = committed_seal_digest(&digest);
        let committed_seal = match self.keypair.sign_digest(&seal_digest) {
            Ok(seal) => seal.to_vec(),
            Err(err) => {
                warn!(%err, "failed to sign committed seal");
                return;
            }
        };
        let subject = Subject {
            view: self.current.view(),
            digest,
        };
        self.broadcast(MsgCode::Commit, Payload::Subject(subject), committed_seal);
    }

    fn send_round_change(&mut self, round: u64) {
        self.wait_for_round_change = true;
        self.round_deadline = Some(Instant::now() + self.round_timeout(round));
        let subject = Subject {
            view: View::new(self.current.sequence, round),
            digest: Hash::EMPTY,
        };
        self.broadcast(MsgCode::RoundChange, Payload::Subject(subject), Vec::new());
    }

    /// Sign, hand to the backend for gossip, then process our own copy.
    fn broadcast(&mut self, code: MsgCode, payload: Payload, committed_seal: Vec<u8>) {
        let message = match Message::signed(
            code,
            payload,
            self.address,
            &self.keypair,
            committed_seal,
        ) {
            Ok(message) => message,
            Err(err) => {
                warn!(%err, "failed to sign outgoing message");
                return;
            }
        };
        self.backend.broadcast(message.clone());
        let address = self.address;
        if let Err(err) = self.dispatch(message, address) {
            debug!(%err, "own message not applicable");
        }
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    fn verify_subject(&self, subject: &Subject) -> Result<(), IbftError> {
        if subject.view != self.current.view() {
            return Err(IbftError::InconsistentSubject);
        }
        match self.current.proposal_hash() {
            Some(hash) if hash == subject.digest => Ok(()),
            _ => Err(IbftError::InconsistentSubject),
        }
    }

    fn set_state(&mut self, state: State) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "state transition");
            self.state = state;
        }
        self.process_backlog();
    }

    /// Drain backlogged messages that became applicable; requeue the still
    /// future, drop the now old.
    fn process_backlog(&mut self) {
        for source in self.backlog.sources() {
            if !self.validators.contains(&source) {
                self.backlog.remove_source(&source);
                continue;
            }
            while let Some(message) = self.backlog.pop(&source) {
                match self.check_message(message.code, message.view()) {
                    Ok(()) => {
                        debug!(code = ?message.code, "replaying backlogged message");
                        let _ = self.dispatch(message, source);
                    }
                    Err(IbftError::FutureMessage) => {
                        self.backlog.push_back(source, message);
                        break;
                    }
                    Err(_) => {
                        // Old or malformed: drop and keep draining.
                    }
                }
            }
        }
    }
}

/// Events fed into the controller loop.
pub enum CoreEvent {
    /// Encoded message from a peer.
    Message(Vec<u8>),
    /// Locally assembled proposal.
    Request(Block),
    /// The chain head moved.
    NewChainHead,
    /// Shut the loop down.
    Stop,
}

/// Owns a [`Core`] on its event-loop thread.
pub struct Controller {
    sender: mpsc::Sender<CoreEvent>,
    handle: Option<JoinHandle<()>>,
}

impl Controller {
    /// Spawn the loop and enter the first round.
    pub fn start(config: IbftConfig, keypair: Arc<KeyPair>, backend: Arc<dyn Backend>) -> Self {
        let (sender, receiver) = mpsc::channel::<CoreEvent>();

        let handle = std::thread::spawn(move || {
            let mut core = Core::new(config, keypair, backend);
            core.start();

            loop {
                let timeout = core
                    .time_until_deadline()
                    .unwrap_or(Duration::from_secs(3600));
                match receiver.recv_timeout(timeout) {
                    Ok(CoreEvent::Message(bytes)) => {
                        if let Err(err) = core.handle_encoded(&bytes) {
                            debug!(%err, "message discarded");
                        }
                    }
                    Ok(CoreEvent::Request(block)) => {
                        let _ = core.handle_request(block);
                    }
                    Ok(CoreEvent::NewChainHead) => core.handle_final_committed(),
                    Ok(CoreEvent::Stop) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    Err(mpsc::RecvTimeoutError::Timeout) => core.handle_timeout(),
                }
            }
            info!("consensus loop stopped");
        });

        Controller {
            sender,
            handle: Some(handle),
        }
    }

    /// Enqueue an event; fails once the loop has stopped.
    pub fn post(&self, event: CoreEvent) -> Result<(), IbftError> {
        self.sender
            .send(event)
            .map_err(|_| IbftError::EngineStopped)
    }

    pub fn stop(mut self) {
        let _ = self.sender.send(CoreEvent::Stop);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        let _ = self.sender.send(CoreEvent::Stop);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
