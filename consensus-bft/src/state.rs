//! The consensus state machine.
//!
//! `ConsensusState` owns the [`RoundState`] and is only ever driven from one
//! thread: messages and timeouts are handed to [`ConsensusState::handle_msg`]
//! and [`ConsensusState::handle_timeout`] one at a time. Votes and proposals
//! the node produces itself are not handled inline; they go through the
//! internal queue like everything else, so every state change is the result
//! of exactly one dequeued item.
//!
//! Other threads read a copy of the round state that is republished after
//! every handled item.

use {
    crate::{
        config::{ConsensusConfig, QueueOverflowPolicy},
        error::{ConsensusError, Result, VoteSetError},
        events::{ConsensusEvent, EventBus},
        evidence::EvidenceCollector,
        service::ConsensusHandle,
        height_vote_set::HeightVoteSet,
        round_state::{RoundState, RoundStep, RoundStepInfo, ValidBlockInfo},
        timeout::TimeoutInfo,
        vote_set::VoteSet,
    },
    crossbeam_channel::{bounded, unbounded, Receiver, SendError, Sender, TrySendError},
    kestrel_chain_store::{BlockOperations, StoreError},
    kestrel_monitoring::ConsensusMetrics,
    kestrel_types::{
        now_ms, Block, BlockId, ChainState, Commit, FatalError, Part, PartSet, PeerId,
        PrivValidator, Proposal, Vote, VoteSetReader, VoteType,
    },
    log::*,
    parking_lot::RwLock,
    solana_pubkey::Pubkey,
    solana_signature::Signature,
    std::{
        collections::HashSet,
        fmt,
        sync::{atomic::AtomicBool, Arc},
        thread,
        time::Duration,
    },
};

/// Offences older than this many heights are no longer recorded.
const EVIDENCE_MAX_AGE_HEIGHTS: u64 = 100;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsensusMessage {
    Proposal(Proposal),
    BlockPart { height: u64, round: i32, part: Part },
    Vote(Vote),
    /// A peer claims +2/3 of the votes of a round are for `block_id`.
    PeerMaj23 {
        height: u64,
        round: i32,
        vote_type: VoteType,
        block_id: BlockId,
    },
}

impl fmt::Display for ConsensusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Proposal(proposal) => write!(f, "{proposal}"),
            Self::BlockPart { height, round, part } => {
                write!(f, "BlockPart{{{height}/{round} #{}}}", part.index)
            }
            Self::Vote(vote) => write!(f, "{vote}"),
            Self::PeerMaj23 {
                height,
                round,
                vote_type,
                block_id,
            } => write!(f, "PeerMaj23{{{height}/{round} {vote_type} {block_id}}}"),
        }
    }
}

/// A message for the state machine and the peer it came from. `peer_id` is
/// `None` for messages the node produced itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MsgInfo {
    pub msg: ConsensusMessage,
    pub peer_id: Option<PeerId>,
}

impl MsgInfo {
    pub fn internal(msg: ConsensusMessage) -> Self {
        Self { msg, peer_id: None }
    }

    pub fn from_peer(msg: ConsensusMessage, peer_id: PeerId) -> Self {
        Self {
            msg,
            peer_id: Some(peer_id),
        }
    }
}

pub struct ConsensusState {
    config: ConsensusConfig,
    block_ops: Arc<BlockOperations>,
    priv_validator: Option<Box<dyn PrivValidator>>,
    priv_validator_address: Option<Pubkey>,
    /// State after the last committed block.
    state: ChainState,
    rs: RoundState,
    snapshot: Arc<RwLock<RoundState>>,

    internal_tx: Sender<MsgInfo>,
    internal_rx: Receiver<MsgInfo>,
    peer_tx: Sender<MsgInfo>,
    peer_rx: Receiver<MsgInfo>,
    /// Timeouts to schedule, consumed by the ticker.
    timeout_tx: Sender<TimeoutInfo>,
    timeout_rx: Receiver<TimeoutInfo>,
    /// Fired timeouts.
    tock_tx: Sender<TimeoutInfo>,
    tock_rx: Receiver<TimeoutInfo>,

    event_bus: Arc<EventBus>,
    evidence: EvidenceCollector,
    metrics: Arc<ConsensusMetrics>,
    halted: Arc<AtomicBool>,
}

impl ConsensusState {
    /// Creates the state machine for the height after `state`. A node that
    /// already committed blocks rebuilds the last commit from the stored
    /// seen commit.
    pub fn new(
        config: ConsensusConfig,
        state: ChainState,
        block_ops: Arc<BlockOperations>,
        priv_validator: Option<Box<dyn PrivValidator>>,
        metrics: Arc<ConsensusMetrics>,
    ) -> Result<Self> {
        let last_commit = if state.last_block_height > 0 {
            Some(reconstruct_last_commit(&state, &block_ops)?)
        } else {
            None
        };
        let (internal_tx, internal_rx) = bounded(config.msg_queue_size);
        let (peer_tx, peer_rx) = bounded(config.msg_queue_size);
        let (timeout_tx, timeout_rx) = unbounded();
        let (tock_tx, tock_rx) = unbounded();

        let rs = RoundState {
            height: 0,
            round: 0,
            step: RoundStep::NewHeight,
            start_time_ms: 0,
            commit_time_ms: 0,
            validators: state.validators.clone(),
            proposal: None,
            proposal_block: None,
            proposal_block_parts: None,
            locked_round: -1,
            locked_block: None,
            locked_block_parts: None,
            valid_round: -1,
            valid_block: None,
            valid_block_parts: None,
            votes: HeightVoteSet::new(
                &state.chain_id,
                0,
                Arc::new(state.validators.clone()),
                config.max_catchup_rounds_per_peer,
            ),
            commit_round: -1,
            last_commit,
            last_validators: state.last_validators.clone(),
            triggered_timeout_precommit: false,
        };
        let priv_validator_address = priv_validator.as_ref().map(|pv| pv.address());
        let mut cs = Self {
            config,
            block_ops,
            priv_validator,
            priv_validator_address,
            state: state.clone(),
            snapshot: Arc::new(RwLock::new(rs.clone())),
            rs,
            internal_tx,
            internal_rx,
            peer_tx,
            peer_rx,
            timeout_tx,
            timeout_rx,
            tock_tx,
            tock_rx,
            event_bus: Arc::new(EventBus::new()),
            evidence: EvidenceCollector::new(),
            metrics,
            halted: Arc::new(AtomicBool::new(false)),
        };
        cs.update_to_state(state)?;
        cs.publish_snapshot();
        Ok(cs)
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    pub fn round_state(&self) -> &RoundState {
        &self.rs
    }

    pub fn chain_state(&self) -> &ChainState {
        &self.state
    }

    /// The round state copy republished after every handled item.
    pub fn snapshot(&self) -> Arc<RwLock<RoundState>> {
        self.snapshot.clone()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn subscribe(&self, name: &str) -> Receiver<ConsensusEvent> {
        self.event_bus.subscribe(name, self.config.event_queue_size)
    }

    /// Where messages received from peers are queued.
    pub fn peer_sender(&self) -> Sender<MsgInfo> {
        self.peer_tx.clone()
    }

    /// A handle sharing this state machine's snapshot, peer queue and event
    /// bus.
    pub fn handle(&self) -> ConsensusHandle {
        ConsensusHandle::new(
            self.snapshot.clone(),
            self.peer_tx.clone(),
            self.event_bus.clone(),
            self.config.event_queue_size,
            self.metrics.clone(),
            self.halted.clone(),
        )
    }

    pub fn evidence(&self) -> &EvidenceCollector {
        &self.evidence
    }

    pub fn metrics(&self) -> &Arc<ConsensusMetrics> {
        &self.metrics
    }

    pub(crate) fn internal_receiver(&self) -> Receiver<MsgInfo> {
        self.internal_rx.clone()
    }

    pub(crate) fn peer_receiver(&self) -> Receiver<MsgInfo> {
        self.peer_rx.clone()
    }

    pub(crate) fn tock_receiver(&self) -> Receiver<TimeoutInfo> {
        self.tock_rx.clone()
    }

    /// Channels for the timeout ticker: scheduled timeouts in, fired out.
    pub(crate) fn ticker_channels(&self) -> (Receiver<TimeoutInfo>, Sender<TimeoutInfo>) {
        (self.timeout_rx.clone(), self.tock_tx.clone())
    }

    /// Handles one message. Only invariant violations are returned; anything
    /// else wrong with the message is logged and dropped.
    pub fn handle_msg(&mut self, mi: MsgInfo) -> std::result::Result<(), FatalError> {
        let MsgInfo { msg, peer_id } = mi;
        let result = match msg {
            ConsensusMessage::Proposal(proposal) => self.set_proposal(proposal),
            ConsensusMessage::BlockPart { height, part, .. } => {
                self.add_proposal_block_part(height, part).map(|_| ())
            }
            ConsensusMessage::Vote(vote) => self.try_add_vote(vote, peer_id.as_ref()),
            ConsensusMessage::PeerMaj23 {
                height,
                round,
                vote_type,
                block_id,
            } => self.set_peer_maj23(height, round, vote_type, block_id, peer_id.as_ref()),
        };
        if let Err(err) = &result {
            if err.fatal().is_none() {
                let from = peer_id.as_ref().map_or("self", |p| p.0.as_str());
                warn!("failed to process message from {from} at {}: {err}", self.rs);
            }
        }
        self.finish(result)
    }

    pub fn handle_timeout(&mut self, ti: TimeoutInfo) -> std::result::Result<(), FatalError> {
        let result = self.on_timeout(ti);
        if let Err(err) = &result {
            if err.fatal().is_none() {
                warn!("failed to process timeout {ti:?}: {err}");
            }
        }
        self.finish(result)
    }

    fn finish(&mut self, result: Result<()>) -> std::result::Result<(), FatalError> {
        self.publish_snapshot();
        match result {
            Err(err) => err.fatal().cloned().map_or(Ok(()), Err),
            Ok(()) => Ok(()),
        }
    }

    fn publish_snapshot(&self) {
        *self.snapshot.write() = self.rs.clone();
    }

    fn publish(&self, event: ConsensusEvent) {
        if let Err(err) = self.event_bus.publish(event) {
            debug!("{err}");
        }
    }

    fn new_step(&self) {
        let info = RoundStepInfo::from_round_state(&self.rs, now_ms());
        self.publish(ConsensusEvent::NewRoundStep(info));
    }

    fn schedule_timeout(&self, duration: Duration, height: u64, round: i32, step: RoundStep) {
        let ti = TimeoutInfo {
            duration,
            height,
            round,
            step,
        };
        if self.timeout_tx.send(ti).is_err() {
            debug!("timeout ticker is gone");
        }
    }

    /// Schedules the first round of the current height at its start time.
    pub(crate) fn schedule_round0(&self) {
        let sleep_ms = self.rs.start_time_ms.saturating_sub(now_ms());
        self.schedule_timeout(
            Duration::from_millis(sleep_ms),
            self.rs.height,
            0,
            RoundStep::NewHeight,
        );
    }

    fn send_internal(&self, mi: MsgInfo) {
        match self.internal_tx.try_send(mi) {
            Ok(()) => {}
            Err(TrySendError::Full(mi)) => match self.config.internal_queue_overflow {
                QueueOverflowPolicy::SpawnRetry => {
                    // The message may now be handled after later ones.
                    info!("internal msg queue is full; using a thread");
                    let tx = self.internal_tx.clone();
                    let spawned = thread::Builder::new()
                        .name("kstlConsRetry".to_string())
                        .spawn(move || {
                            if let Err(SendError(mi)) = tx.send(mi) {
                                debug!("internal msg queue closed; dropping {}", mi.msg);
                            }
                        });
                    if let Err(err) = spawned {
                        error!("failed to spawn internal queue retry: {err}");
                    }
                }
                QueueOverflowPolicy::DropWithLog => {
                    error!("internal msg queue is full; dropping {}", mi.msg);
                }
            },
            Err(TrySendError::Disconnected(_)) => debug!("internal msg queue closed"),
        }
    }

    fn is_proposer(&self) -> bool {
        self.priv_validator_address
            .is_some_and(|address| self.rs.validators.is_proposer(&address))
    }

    /// Moves to the height after `state`.
    fn update_to_state(&mut self, state: ChainState) -> Result<()> {
        if self.rs.commit_round > -1
            && self.rs.height > 0
            && self.rs.height != state.last_block_height
        {
            return Err(FatalError::HeightMismatch {
                state_height: state.last_block_height,
                round_height: self.rs.height,
                commit_round: self.rs.commit_round,
            }
            .into());
        }
        if self.rs.height > 0 && state.last_block_height <= self.state.last_block_height {
            debug!(
                "ignoring update_to_state: height {} is not past {}",
                state.last_block_height, self.state.last_block_height
            );
            self.new_step();
            return Ok(());
        }

        let last_commit = if self.rs.commit_round > -1 {
            let precommits = self
                .rs
                .votes
                .precommits(self.rs.commit_round)
                .filter(|p| p.has_two_thirds_majority())
                .cloned()
                .ok_or_else(|| {
                    FatalError::Invariant(format!(
                        "precommits of commit round {}/{} lost their +2/3 majority",
                        self.rs.height, self.rs.commit_round
                    ))
                })?;
            Some(precommits)
        } else if state.last_block_height == 0 {
            None
        } else {
            self.rs.last_commit.take()
        };

        let height = state.next_height();
        let start_time_ms = if self.rs.commit_time_ms == 0 {
            self.config.commit(now_ms())
        } else {
            self.config.commit(self.rs.commit_time_ms)
        };
        let validators = state.validators.clone();
        self.rs = RoundState {
            height,
            round: 0,
            step: RoundStep::NewHeight,
            start_time_ms,
            commit_time_ms: 0,
            votes: HeightVoteSet::new(
                &state.chain_id,
                height,
                Arc::new(validators.clone()),
                self.config.max_catchup_rounds_per_peer,
            ),
            validators,
            proposal: None,
            proposal_block: None,
            proposal_block_parts: None,
            locked_round: -1,
            locked_block: None,
            locked_block_parts: None,
            valid_round: -1,
            valid_block: None,
            valid_block_parts: None,
            commit_round: -1,
            last_commit,
            last_validators: state.last_validators.clone(),
            triggered_timeout_precommit: false,
        };
        self.metrics.height.set_u64(height);
        self.metrics.rounds.set(0);
        self.metrics.validators.set_u64(self.rs.validators.size() as u64);
        self.metrics
            .validators_power
            .set_u64(self.rs.validators.total_voting_power());
        self.state = state;
        self.new_step();
        Ok(())
    }

    fn on_timeout(&mut self, ti: TimeoutInfo) -> Result<()> {
        if ti.height != self.rs.height
            || ti.round < self.rs.round
            || (ti.round == self.rs.round && ti.step < self.rs.step)
        {
            debug!(
                "ignoring tock for {}/{}/{}, we are at {}",
                ti.height, ti.round, ti.step, self.rs
            );
            return Ok(());
        }
        match ti.step {
            RoundStep::NewHeight => self.enter_new_round(ti.height, 0),
            RoundStep::NewRound => self.enter_propose(ti.height, 0),
            RoundStep::Propose => {
                self.publish(ConsensusEvent::TimeoutPropose {
                    height: ti.height,
                    round: ti.round,
                });
                self.enter_prevote(ti.height, ti.round)
            }
            RoundStep::PrevoteWait => {
                self.publish(ConsensusEvent::TimeoutWait {
                    height: ti.height,
                    round: ti.round,
                });
                self.enter_precommit(ti.height, ti.round)
            }
            RoundStep::PrecommitWait => {
                self.publish(ConsensusEvent::TimeoutWait {
                    height: ti.height,
                    round: ti.round,
                });
                self.enter_precommit(ti.height, ti.round)?;
                self.enter_new_round(ti.height, ti.round.saturating_add(1))
            }
            step => {
                warn!("unexpected timeout step {step}");
                Ok(())
            }
        }
    }

    /// Starts `round` of `height`. Does nothing for an earlier round, another
    /// height, a round already started, or while committing.
    fn enter_new_round(&mut self, height: u64, round: i32) -> Result<()> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step != RoundStep::NewHeight)
            || self.rs.step == RoundStep::Commit
        {
            debug!("enter_new_round({height}/{round}): invalid args, at {}", self.rs);
            return Ok(());
        }
        let now = now_ms();
        if now < self.rs.start_time_ms {
            debug!(
                "enter_new_round({height}/{round}): {}ms before start time",
                self.rs.start_time_ms.saturating_sub(now)
            );
        }
        info!("enter_new_round({height}/{round}), at {}", self.rs);

        if self.rs.round < round {
            let times = u32::try_from(round.saturating_sub(self.rs.round)).unwrap_or(u32::MAX);
            self.rs.validators.advance_proposer(times);
        }
        self.rs.round = round;
        self.rs.step = RoundStep::NewRound;
        if round != 0 {
            debug!("resetting proposal info");
            self.rs.proposal = None;
            self.rs.proposal_block = None;
            self.rs.proposal_block_parts = None;
        }
        // Track the next round too, so +2/3 for it can trigger a round skip.
        self.rs.votes.set_round(round.saturating_add(1))?;
        self.rs.triggered_timeout_precommit = false;
        self.metrics.rounds.set(i64::from(round));
        self.publish(ConsensusEvent::NewRound(RoundStepInfo::from_round_state(
            &self.rs, now,
        )));
        self.enter_propose(height, round)
    }

    fn enter_propose(&mut self, height: u64, round: i32) -> Result<()> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && RoundStep::Propose <= self.rs.step)
        {
            debug!("enter_propose({height}/{round}): invalid args, at {}", self.rs);
            return Ok(());
        }
        info!("enter_propose({height}/{round}), at {}", self.rs);
        self.schedule_timeout(self.config.propose(round), height, round, RoundStep::Propose);

        if self.priv_validator_address.is_none() {
            debug!("node is not a validator");
        } else if self.is_proposer() {
            info!("our turn to propose at {height}/{round}");
            if let Err(err) = self.decide_proposal(height, round) {
                if err.fatal().is_some() {
                    return Err(err);
                }
                error!("failed to create proposal at {height}/{round}: {err}");
            }
        } else {
            debug!(
                "not our turn to propose at {height}/{round}, proposer is {:?}",
                self.rs.proposer()
            );
        }

        self.rs.round = round;
        self.rs.step = RoundStep::Propose;
        self.new_step();
        if self.is_proposal_complete() {
            self.enter_prevote(height, self.rs.round)?;
        }
        Ok(())
    }

    /// Proposes the locked block, else the valid block, else a new block.
    fn decide_proposal(&mut self, height: u64, round: i32) -> Result<()> {
        let (block, parts, pol_round) = match (
            &self.rs.locked_block,
            &self.rs.locked_block_parts,
            &self.rs.valid_block,
            &self.rs.valid_block_parts,
        ) {
            (Some(block), Some(parts), _, _) => {
                (block.clone(), parts.clone(), self.rs.locked_round)
            }
            (_, _, Some(block), Some(parts)) => (block.clone(), parts.clone(), self.rs.valid_round),
            _ => {
                let Some(last_commit) = self.proposal_last_commit()? else {
                    error!(
                        "cannot propose at {height}/{round} without a commit for the previous block"
                    );
                    return Ok(());
                };
                let Some(proposer) = self.priv_validator_address else {
                    return Ok(());
                };
                let (block, parts) = self.block_ops.create_proposal_block(
                    height,
                    &self.state,
                    proposer,
                    last_commit,
                )?;
                (block, parts, -1)
            }
        };

        let block_id = BlockId::new(block.hash(), parts.header());
        let pol_block_id = if pol_round >= 0 {
            block_id
        } else {
            BlockId::default()
        };
        let mut proposal = Proposal::new(
            height,
            round,
            now_ms(),
            parts.header(),
            pol_round,
            pol_block_id,
        );
        let Some(pv) = self.priv_validator.as_mut() else {
            return Ok(());
        };
        if let Err(err) = pv.sign_proposal(&self.state.chain_id, &mut proposal) {
            error!("failed signing proposal at {height}/{round}: {err}");
            return Ok(());
        }
        info!("signed proposal {proposal} for block {block_id}");
        self.send_internal(MsgInfo::internal(ConsensusMessage::Proposal(proposal)));
        for index in 0..parts.total() {
            if let Some(part) = parts.get_part(index) {
                self.send_internal(MsgInfo::internal(ConsensusMessage::BlockPart {
                    height,
                    round,
                    part: part.clone(),
                }));
            }
        }
        Ok(())
    }

    /// The commit for the previous block that a new proposal must carry.
    fn proposal_last_commit(&self) -> Result<Option<Commit>> {
        if self.state.last_block_height == 0 {
            return Ok(Some(Commit::empty()));
        }
        match &self.rs.last_commit {
            Some(last_commit) if last_commit.has_two_thirds_majority() => {
                Ok(Some(last_commit.make_commit()?))
            }
            _ => Ok(None),
        }
    }

    /// True once we have the proposal, its block, and the polka it refers to.
    fn is_proposal_complete(&self) -> bool {
        let (Some(proposal), Some(_)) = (&self.rs.proposal, &self.rs.proposal_block) else {
            return false;
        };
        proposal.pol_round < 0
            || self
                .rs
                .prevotes(proposal.pol_round)
                .is_some_and(VoteSet::has_two_thirds_majority)
    }

    fn set_proposal(&mut self, proposal: Proposal) -> Result<()> {
        if self.rs.proposal.is_some() {
            return Ok(());
        }
        if proposal.height != self.rs.height || proposal.round != self.rs.round {
            debug!("ignoring proposal {proposal}, at {}", self.rs);
            return Ok(());
        }
        if proposal.pol_round < -1
            || (proposal.pol_round >= 0 && proposal.pol_round >= proposal.round)
        {
            return Err(ConsensusError::InvalidProposalPolRound {
                round: proposal.round,
                pol_round: proposal.pol_round,
            });
        }
        let Some(proposer) = self.rs.proposer() else {
            return Err(ConsensusError::InvalidProposalSignature);
        };
        if proposal.verify(&self.state.chain_id, &proposer).is_err() {
            return Err(ConsensusError::InvalidProposalSignature);
        }
        info!("received proposal {proposal}");
        // Parts may already be expected if we saw a polka or a commit.
        if self.rs.proposal_block_parts.is_none() {
            self.rs.proposal_block_parts =
                Some(PartSet::new_from_header(&proposal.block_parts_header));
        }
        self.rs.proposal = Some(proposal);
        Ok(())
    }

    /// Returns true if the part was new.
    fn add_proposal_block_part(&mut self, height: u64, part: Part) -> Result<bool> {
        if height != self.rs.height {
            debug!("ignoring block part for height {height}, at {}", self.rs);
            return Ok(false);
        }
        let max = self.config.max_block_size_bytes;
        let Some(parts) = self.rs.proposal_block_parts.as_mut() else {
            debug!("received a block part when we are not expecting any");
            return Ok(false);
        };
        let added = parts.add_part(part)?;
        if parts.byte_size() > max {
            return Err(ConsensusError::ProposalBlockTooLarge { max });
        }
        if !added || !parts.is_complete() {
            return Ok(added);
        }
        let Some(bytes) = parts.assemble() else {
            return Ok(added);
        };
        let parts_header = parts.header();
        let block = Block::from_bytes(&bytes)?;
        let block_id = BlockId::new(block.hash(), parts_header);
        info!(
            "received complete proposal block {} at height {height}",
            block_id.hash
        );
        self.rs.proposal_block = Some(block);
        self.publish(ConsensusEvent::CompleteProposal {
            height,
            round: self.rs.round,
            block_id,
        });
        self.handle_complete_proposal(height)?;
        Ok(true)
    }

    fn handle_complete_proposal(&mut self, height: u64) -> Result<()> {
        let round = self.rs.round;
        let polka = self
            .rs
            .prevotes(round)
            .and_then(VoteSet::two_thirds_majority);
        if let Some(block_id) = polka {
            if !block_id.is_zero()
                && self.rs.valid_round < round
                && self.rs.has_proposal_block(&block_id)
            {
                debug!("updating valid block to the new proposal block");
                self.set_valid_from_proposal(round);
            }
        }
        if self.rs.step <= RoundStep::Propose && self.is_proposal_complete() {
            self.enter_prevote(height, round)?;
            if polka.is_some() {
                self.enter_precommit(height, round)?;
            }
        } else if self.rs.step == RoundStep::Commit {
            self.try_finalize_commit(height)?;
        }
        Ok(())
    }

    fn set_valid_from_proposal(&mut self, round: i32) {
        self.rs.valid_round = round;
        self.rs.valid_block = self.rs.proposal_block.clone();
        self.rs.valid_block_parts = self.rs.proposal_block_parts.clone();
    }

    fn unlock(&mut self) {
        self.rs.locked_round = -1;
        self.rs.locked_block = None;
        self.rs.locked_block_parts = None;
    }

    fn set_peer_maj23(
        &mut self,
        height: u64,
        round: i32,
        vote_type: VoteType,
        block_id: BlockId,
        peer_id: Option<&PeerId>,
    ) -> Result<()> {
        let Some(peer_id) = peer_id else {
            return Ok(());
        };
        if height != self.rs.height {
            return Ok(());
        }
        self.rs
            .votes
            .set_peer_maj23(round, vote_type, peer_id.clone(), block_id)?;
        Ok(())
    }

    /// Adds a vote, turning a conflicting one into evidence.
    fn try_add_vote(&mut self, vote: Vote, peer_id: Option<&PeerId>) -> Result<()> {
        match self.add_vote(vote, peer_id) {
            Ok(_) => Ok(()),
            Err(ConsensusError::VoteSet(VoteSetError::ConflictingVote {
                existing,
                conflicting,
            })) => {
                if Some(conflicting.validator_address) == self.priv_validator_address {
                    error!("found conflicting vote from ourselves: {conflicting}");
                    return Ok(());
                }
                if self.evidence.record(*existing, *conflicting).is_some() {
                    let offenders: HashSet<Pubkey> = self
                        .evidence
                        .evidence()
                        .iter()
                        .map(|ev| ev.validator())
                        .collect();
                    self.metrics
                        .byzantine_validators
                        .set_u64(offenders.len() as u64);
                }
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn add_vote(&mut self, vote: Vote, peer_id: Option<&PeerId>) -> Result<bool> {
        // A late precommit for the block we just committed.
        if vote.height.saturating_add(1) == self.rs.height && vote.vote_type == VoteType::Precommit
        {
            if self.rs.step != RoundStep::NewHeight {
                debug!("ignoring precommit for the previous height, at {}", self.rs);
                return Ok(false);
            }
            let Some(last_commit) = self.rs.last_commit.as_mut() else {
                return Ok(false);
            };
            if !last_commit.add_vote(vote.clone())? {
                return Ok(false);
            }
            let has_all = last_commit.has_all();
            debug!("added {vote} to last precommits");
            self.publish(ConsensusEvent::Vote(vote));
            if self.config.skip_timeout_commit && has_all {
                self.enter_new_round(self.rs.height, 0)?;
            }
            return Ok(true);
        }
        if vote.height != self.rs.height {
            debug!("ignoring {vote}, at {}", self.rs);
            return Ok(false);
        }

        let height = self.rs.height;
        let round = vote.round;
        let vote_type = vote.vote_type;
        let peer = peer_id.cloned().unwrap_or_else(|| PeerId::new(""));
        if !self.rs.votes.add_vote(vote.clone(), &peer)? {
            return Ok(false);
        }
        self.publish(ConsensusEvent::Vote(vote));
        match vote_type {
            VoteType::Prevote => self.on_prevote_added(height, round)?,
            VoteType::Precommit => self.on_precommit_added(height, round)?,
        }
        Ok(true)
    }

    fn on_prevote_added(&mut self, height: u64, round: i32) -> Result<()> {
        let Some(prevotes) = self.rs.prevotes(round) else {
            return Ok(());
        };
        let maj23 = prevotes.two_thirds_majority();
        let two_thirds_any = prevotes.has_two_thirds_any();
        debug!("added prevote: {}", prevotes.string_short());

        if let Some(block_id) = maj23 {
            let locked_elsewhere = self
                .rs
                .locked_block
                .as_ref()
                .is_some_and(|b| !b.hashes_to(&block_id.hash));
            if locked_elsewhere && self.rs.locked_round < round && round <= self.rs.round {
                info!("unlocking because of POL at {height}/{round}");
                self.unlock();
                self.publish(ConsensusEvent::Unlock {
                    height,
                    round: self.rs.round,
                });
            }

            if !block_id.is_zero() && self.rs.valid_round < round && round == self.rs.round {
                if self.rs.has_proposal_block(&block_id) {
                    info!("updating valid block because of POL at {height}/{round}");
                    self.set_valid_from_proposal(round);
                } else {
                    info!("valid block {block_id} is unknown; setting proposal block to nil");
                    self.rs.proposal_block = None;
                }
                let has_header = self
                    .rs
                    .proposal_block_parts
                    .as_ref()
                    .is_some_and(|p| p.has_header(&block_id.parts_header));
                if !has_header {
                    self.rs.proposal_block_parts =
                        Some(PartSet::new_from_header(&block_id.parts_header));
                }
                self.publish_valid_block(false);
            }
        }

        if self.rs.round < round && two_thirds_any {
            self.enter_new_round(height, round)?;
        } else if self.rs.round == round && RoundStep::Prevote <= self.rs.step {
            match maj23 {
                Some(block_id) if self.is_proposal_complete() || block_id.is_zero() => {
                    self.enter_precommit(height, round)?;
                }
                _ if two_thirds_any => self.enter_prevote_wait(height, round)?,
                _ => {}
            }
        } else if self
            .rs
            .proposal
            .as_ref()
            .is_some_and(|p| p.pol_round >= 0 && p.pol_round == round)
            && self.is_proposal_complete()
        {
            self.enter_prevote(height, self.rs.round)?;
        }
        Ok(())
    }

    fn on_precommit_added(&mut self, height: u64, round: i32) -> Result<()> {
        let Some(precommits) = self.rs.precommits(round) else {
            return Ok(());
        };
        let maj23 = precommits.two_thirds_majority();
        let two_thirds_any = precommits.has_two_thirds_any();
        let has_all = precommits.has_all();
        debug!("added precommit: {}", precommits.string_short());

        if let Some(block_id) = maj23 {
            self.enter_new_round(height, round)?;
            self.enter_precommit(height, round)?;
            if block_id.is_zero() {
                self.enter_precommit_wait(height, round)?;
            } else {
                self.enter_commit(height, round)?;
                if self.config.skip_timeout_commit && has_all {
                    self.enter_new_round(self.rs.height, 0)?;
                }
            }
        } else if self.rs.round <= round && two_thirds_any {
            self.enter_new_round(height, round)?;
            self.enter_precommit_wait(height, round)?;
        }
        Ok(())
    }

    fn enter_prevote(&mut self, height: u64, round: i32) -> Result<()> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && RoundStep::Prevote <= self.rs.step)
        {
            debug!("enter_prevote({height}/{round}): invalid args, at {}", self.rs);
            return Ok(());
        }
        info!("enter_prevote({height}/{round}), at {}", self.rs);
        self.do_prevote();
        self.rs.round = round;
        self.rs.step = RoundStep::Prevote;
        self.new_step();
        Ok(())
    }

    fn do_prevote(&mut self) {
        if let (Some(block), Some(parts)) = (&self.rs.locked_block, &self.rs.locked_block_parts) {
            info!("prevote step: already locked on a block; prevoting locked block");
            let block_id = BlockId::new(block.hash(), parts.header());
            self.sign_add_vote(VoteType::Prevote, block_id);
            return;
        }
        let Some(block) = &self.rs.proposal_block else {
            info!("prevote step: proposal block is nil");
            self.sign_add_vote(VoteType::Prevote, BlockId::default());
            return;
        };
        if let Err(err) = self.block_ops.validate_block(&self.state, block) {
            error!("prevote step: proposal block is invalid: {err}");
            self.sign_add_vote(VoteType::Prevote, BlockId::default());
            return;
        }
        let parts_header = self
            .rs
            .proposal_block_parts
            .as_ref()
            .map(PartSet::header)
            .unwrap_or_default();
        let block_id = BlockId::new(block.hash(), parts_header);
        info!("prevote step: proposal block is valid");
        self.sign_add_vote(VoteType::Prevote, block_id);
    }

    fn enter_prevote_wait(&mut self, height: u64, round: i32) -> Result<()> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && RoundStep::PrevoteWait <= self.rs.step)
        {
            debug!("enter_prevote_wait({height}/{round}): invalid args, at {}", self.rs);
            return Ok(());
        }
        if !self
            .rs
            .prevotes(round)
            .is_some_and(VoteSet::has_two_thirds_any)
        {
            return Err(FatalError::Invariant(format!(
                "enter_prevote_wait({height}/{round}) without +2/3 prevotes"
            ))
            .into());
        }
        info!("enter_prevote_wait({height}/{round}), at {}", self.rs);
        self.rs.round = round;
        self.rs.step = RoundStep::PrevoteWait;
        self.new_step();
        self.schedule_timeout(
            self.config.prevote(round),
            height,
            round,
            RoundStep::PrevoteWait,
        );
        Ok(())
    }

    /// Precommits the block with a polka at `round`, or nil. Locks, relocks
    /// or unlocks according to that polka.
    fn enter_precommit(&mut self, height: u64, round: i32) -> Result<()> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && RoundStep::Precommit <= self.rs.step)
        {
            debug!("enter_precommit({height}/{round}): invalid args, at {}", self.rs);
            return Ok(());
        }
        info!("enter_precommit({height}/{round}), at {}", self.rs);
        self.do_precommit(height, round)?;
        self.rs.round = round;
        self.rs.step = RoundStep::Precommit;
        self.new_step();
        Ok(())
    }

    fn do_precommit(&mut self, height: u64, round: i32) -> Result<()> {
        let Some(block_id) = self
            .rs
            .prevotes(round)
            .and_then(VoteSet::two_thirds_majority)
        else {
            if self.rs.locked_block.is_some() {
                info!("precommit step: no +2/3 prevotes while locked; precommitting nil");
            } else {
                info!("precommit step: no +2/3 prevotes; precommitting nil");
            }
            self.sign_add_vote(VoteType::Precommit, BlockId::default());
            return Ok(());
        };
        self.publish(ConsensusEvent::Polka { height, round });

        let (pol_round, _) = self.rs.votes.pol_info();
        if pol_round < round {
            return Err(FatalError::Invariant(format!(
                "POL round should be {round} but got {pol_round}"
            ))
            .into());
        }

        if block_id.is_zero() {
            if self.rs.locked_block.is_some() {
                info!("precommit step: +2/3 prevoted nil; unlocking");
                self.unlock();
                self.publish(ConsensusEvent::Unlock { height, round });
            } else {
                info!("precommit step: +2/3 prevoted nil");
            }
            self.sign_add_vote(VoteType::Precommit, BlockId::default());
            return Ok(());
        }

        if self
            .rs
            .locked_block
            .as_ref()
            .is_some_and(|b| b.hashes_to(&block_id.hash))
        {
            info!("precommit step: +2/3 prevoted locked block; relocking");
            self.rs.locked_round = round;
            self.publish(ConsensusEvent::Relock { height, round });
            self.sign_add_vote(VoteType::Precommit, block_id);
            return Ok(());
        }

        if let Some(block) = self
            .rs
            .proposal_block
            .as_ref()
            .filter(|b| b.hashes_to(&block_id.hash))
        {
            // +2/3 of the network prevoted a block we consider invalid.
            if let Err(err) = self.block_ops.validate_block(&self.state, block) {
                return Err(FatalError::InvalidPolkaBlock {
                    height,
                    round,
                    block_hash: block_id.hash,
                    reason: err.to_string(),
                }
                .into());
            }
            info!("precommit step: +2/3 prevoted proposal block; locking");
            self.rs.locked_round = round;
            self.rs.locked_block = self.rs.proposal_block.clone();
            self.rs.locked_block_parts = self.rs.proposal_block_parts.clone();
            self.publish(ConsensusEvent::Lock { height, round });
            self.sign_add_vote(VoteType::Precommit, block_id);
            return Ok(());
        }

        info!("precommit step: +2/3 prevotes for a block we do not have; voting nil");
        self.unlock();
        self.publish(ConsensusEvent::Unlock { height, round });
        let has_header = self
            .rs
            .proposal_block_parts
            .as_ref()
            .is_some_and(|p| p.has_header(&block_id.parts_header));
        if !has_header {
            self.rs.proposal_block = None;
            self.rs.proposal_block_parts = Some(PartSet::new_from_header(&block_id.parts_header));
        }
        self.sign_add_vote(VoteType::Precommit, BlockId::default());
        Ok(())
    }

    fn enter_precommit_wait(&mut self, height: u64, round: i32) -> Result<()> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.triggered_timeout_precommit)
        {
            debug!("enter_precommit_wait({height}/{round}): invalid args, at {}", self.rs);
            return Ok(());
        }
        if !self
            .rs
            .precommits(round)
            .is_some_and(VoteSet::has_two_thirds_any)
        {
            return Err(FatalError::Invariant(format!(
                "enter_precommit_wait({height}/{round}) without +2/3 precommits"
            ))
            .into());
        }
        info!("enter_precommit_wait({height}/{round}), at {}", self.rs);
        self.rs.triggered_timeout_precommit = true;
        // A node that has not precommitted yet keeps its step so it still can.
        if self.rs.step == RoundStep::Precommit {
            self.rs.step = RoundStep::PrecommitWait;
        }
        self.new_step();
        self.schedule_timeout(
            self.config.precommit(round),
            height,
            round,
            RoundStep::PrecommitWait,
        );
        Ok(())
    }

    fn enter_commit(&mut self, height: u64, commit_round: i32) -> Result<()> {
        if self.rs.height != height || RoundStep::Commit <= self.rs.step {
            debug!("enter_commit({height}/{commit_round}): invalid args, at {}", self.rs);
            return Ok(());
        }
        info!("enter_commit({height}/{commit_round}), at {}", self.rs);
        let Some(block_id) = self
            .rs
            .precommits(commit_round)
            .and_then(VoteSet::two_thirds_majority)
        else {
            return Err(FatalError::Invariant(format!(
                "enter_commit({height}/{commit_round}) without +2/3 precommits"
            ))
            .into());
        };
        self.rs.step = RoundStep::Commit;
        self.rs.commit_round = commit_round;
        self.rs.commit_time_ms = now_ms();
        self.new_step();

        if self
            .rs
            .locked_block
            .as_ref()
            .is_some_and(|b| b.hashes_to(&block_id.hash))
        {
            debug!("commit is for the locked block");
            self.rs.proposal_block = self.rs.locked_block.clone();
            self.rs.proposal_block_parts = self.rs.locked_block_parts.clone();
        }
        if !self.rs.has_proposal_block(&block_id) {
            let has_header = self
                .rs
                .proposal_block_parts
                .as_ref()
                .is_some_and(|p| p.has_header(&block_id.parts_header));
            if !has_header {
                info!("commit is for a block we do not know about; setting proposal block to nil");
                self.rs.proposal_block = None;
                self.rs.proposal_block_parts =
                    Some(PartSet::new_from_header(&block_id.parts_header));
                self.publish_valid_block(true);
            }
        }
        self.try_finalize_commit(height)
    }

    fn try_finalize_commit(&mut self, height: u64) -> Result<()> {
        if self.rs.height != height {
            return Err(FatalError::Invariant(format!(
                "try_finalize_commit({height}) at height {}",
                self.rs.height
            ))
            .into());
        }
        let block_id = self
            .rs
            .precommits(self.rs.commit_round)
            .and_then(VoteSet::two_thirds_majority);
        let Some(block_id) = block_id.filter(|id| !id.is_zero()) else {
            error!("cannot finalize commit: no +2/3 majority for a block");
            return Ok(());
        };
        if !self.rs.has_proposal_block(&block_id) {
            debug!("cannot finalize commit yet: we do not have block {block_id}");
            return Ok(());
        }
        self.finalize_commit(height)
    }

    fn finalize_commit(&mut self, height: u64) -> Result<()> {
        if self.rs.height != height || self.rs.step != RoundStep::Commit {
            debug!("finalize_commit({height}): invalid args, at {}", self.rs);
            return Ok(());
        }
        let Some(precommits) = self.rs.precommits(self.rs.commit_round) else {
            return Err(FatalError::Invariant(format!(
                "no precommits for commit round {}",
                self.rs.commit_round
            ))
            .into());
        };
        let Some(block_id) = precommits.two_thirds_majority() else {
            return Err(FatalError::Invariant("finalize_commit without +2/3".to_string()).into());
        };
        let seen_commit = precommits.make_commit()?;
        let (Some(block), Some(parts)) = (
            self.rs.proposal_block.clone(),
            self.rs.proposal_block_parts.clone(),
        ) else {
            return Err(FatalError::Invariant(format!(
                "finalize_commit({height}) without the committed block"
            ))
            .into());
        };
        if !parts.has_header(&block_id.parts_header) || !block.hashes_to(&block_id.hash) {
            return Err(FatalError::Invariant(format!(
                "proposal block does not match commit {block_id}"
            ))
            .into());
        }
        if let Err(err) = self.block_ops.validate_block(&self.state, &block) {
            return Err(FatalError::InvalidCommittedBlock {
                height,
                block_hash: block_id.hash,
                reason: err.to_string(),
            }
            .into());
        }
        info!(
            "finalizing commit of block {} at height {height} with {} txs",
            block_id.hash, block.header.num_txs
        );

        if self.block_ops.height() < block.height() {
            self.block_ops
                .save_block(&block, &parts, &seen_commit)
                .map_err(storage_fatal)?;
        } else {
            info!("block at height {} is already stored", block.height());
        }
        let new_state = self
            .block_ops
            .apply_block(&self.state, &block_id, &block)
            .map_err(|err| FatalError::InvalidCommittedBlock {
                height,
                block_hash: block_id.hash,
                reason: err.to_string(),
            })?;
        self.block_ops.save_state(&new_state).map_err(storage_fatal)?;

        self.record_commit_metrics(&block, &parts, &seen_commit);
        self.evidence
            .prune(height.saturating_sub(EVIDENCE_MAX_AGE_HEIGHTS));
        self.publish(ConsensusEvent::NewBlock {
            height,
            block_id,
            num_txs: block.header.num_txs,
        });

        self.update_to_state(new_state)?;
        self.schedule_round0();
        Ok(())
    }

    fn record_commit_metrics(&self, block: &Block, parts: &PartSet, commit: &Commit) {
        let m = &self.metrics;
        let (mut missing, mut missing_power) = (0u64, 0u64);
        for (index, validator) in self.rs.validators.iter().enumerate() {
            if !matches!(commit.precommits.get(index), Some(Some(_))) {
                missing = missing.saturating_add(1);
                missing_power = missing_power.saturating_add(validator.voting_power);
            }
        }
        m.missing_validators.set_u64(missing);
        m.missing_validators_power.set_u64(missing_power);
        m.rounds_per_block
            .observe(f64::from(self.rs.commit_round.saturating_add(1)));
        if self.state.last_block_height > 0 {
            let interval_ms = block
                .header
                .time_ms
                .saturating_sub(self.state.last_block_time_ms);
            m.block_interval_seconds.observe(interval_ms as f64 / 1000.0);
        }
        m.num_txs.set_u64(block.header.num_txs);
        m.total_txs.set_u64(block.header.total_txs);
        m.block_size_bytes.set_u64(parts.byte_size() as u64);
        m.committed_height.set_u64(block.height());
        m.blocks_committed.inc();
    }

    fn publish_valid_block(&self, is_commit: bool) {
        let Some(parts) = &self.rs.proposal_block_parts else {
            return;
        };
        self.publish(ConsensusEvent::ValidBlock(ValidBlockInfo {
            height: self.rs.height,
            round: self.rs.round,
            block_parts_header: parts.header(),
            block_parts: parts.bit_array(),
            is_commit,
        }));
    }

    /// Vote timestamps never go backwards past the block being voted on.
    fn vote_time(&self) -> u64 {
        let base = self
            .rs
            .locked_block
            .as_ref()
            .or(self.rs.proposal_block.as_ref())
            .map(|b| b.header.time_ms);
        let now = now_ms();
        match base {
            Some(base) => now.max(base.saturating_add(1)),
            None => now,
        }
    }

    /// Signs a vote for the current height and round and queues it. Nodes
    /// outside the validator set do not vote.
    fn sign_add_vote(&mut self, vote_type: VoteType, block_id: BlockId) {
        let Some(address) = self.priv_validator_address else {
            return;
        };
        let Some((index, _)) = self.rs.validators.get_by_address(&address) else {
            return;
        };
        let mut vote = Vote {
            validator_address: address,
            validator_index: index,
            height: self.rs.height,
            round: self.rs.round,
            timestamp_ms: self.vote_time(),
            vote_type,
            block_id,
            signature: Signature::default(),
        };
        let Some(pv) = self.priv_validator.as_mut() else {
            return;
        };
        if let Err(err) = pv.sign_vote(&self.state.chain_id, &mut vote) {
            error!("failed signing {vote_type} at {}: {err}", self.rs);
            return;
        }
        info!("signed and queued {vote}");
        self.send_internal(MsgInfo::internal(ConsensusMessage::Vote(vote)));
    }

    /// Handles every queued internal message, including the ones queued
    /// while handling.
    #[cfg(any(test, feature = "dev-context-only-utils"))]
    pub fn drain_internal_queue(&mut self) -> std::result::Result<(), FatalError> {
        while let Ok(mi) = self.internal_rx.try_recv() {
            self.handle_msg(mi)?;
        }
        Ok(())
    }

    /// Handles every queued peer message and whatever they cause.
    #[cfg(any(test, feature = "dev-context-only-utils"))]
    pub fn drain_peer_queue(&mut self) -> std::result::Result<(), FatalError> {
        while let Ok(mi) = self.peer_rx.try_recv() {
            self.handle_msg(mi)?;
            self.drain_internal_queue()?;
        }
        Ok(())
    }

    /// Timeouts scheduled since the last call, oldest first.
    #[cfg(any(test, feature = "dev-context-only-utils"))]
    pub fn drain_scheduled_timeouts(&self) -> Vec<TimeoutInfo> {
        self.timeout_rx.try_iter().collect()
    }

    /// Starts round 0 of the current height immediately.
    #[cfg(any(test, feature = "dev-context-only-utils"))]
    pub fn start_round0(&mut self) -> std::result::Result<(), FatalError> {
        let result = self.enter_new_round(self.rs.height, 0);
        self.finish(result)
    }
}

fn storage_fatal(err: StoreError) -> FatalError {
    match err {
        StoreError::Fatal(fatal) => fatal,
        other => FatalError::Storage(other.to_string()),
    }
}

/// Rebuilds the precommits of the last stored block from its seen commit.
fn reconstruct_last_commit(state: &ChainState, block_ops: &BlockOperations) -> Result<VoteSet> {
    let height = state.last_block_height;
    let seen_commit = block_ops.load_seen_commit(height)?.ok_or_else(|| {
        FatalError::Invariant(format!("no seen commit stored for height {height}"))
    })?;
    let mut last_commit = VoteSet::new(
        &state.chain_id,
        height,
        seen_commit.round(),
        VoteType::Precommit,
        Arc::new(state.last_validators.clone()),
    );
    for vote in seen_commit.precommits.iter().flatten() {
        last_commit.add_vote(vote.clone()).map_err(|err| {
            FatalError::Invariant(format!("failed to reconstruct last commit: {err}"))
        })?;
    }
    if !last_commit.has_two_thirds_majority() {
        return Err(FatalError::Invariant(format!(
            "reconstructed last commit for height {height} has no +2/3 majority"
        ))
        .into());
    }
    Ok(last_commit)
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        assert_matches::assert_matches,
        kestrel_chain_store::{BlockLimits, HashChainExecutor, MemoryStore, MemoryTxPool},
        kestrel_types::{
            GenesisDoc, GenesisValidator, KeypairValidator, PartSetHeader, Transaction,
        },
        solana_hash::Hash,
        solana_keypair::Keypair,
        solana_signer::Signer,
    };

    // `assert_matches!` needs `Debug` on the matched `Result`.
    impl std::fmt::Debug for ConsensusState {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("ConsensusState").finish_non_exhaustive()
        }
    }

    const CHAIN_ID: &str = "consensus-test";

    struct Fixture {
        cs: ConsensusState,
        /// The other validators and their indices.
        others: Vec<(u32, Keypair)>,
        address: Pubkey,
        events: Receiver<ConsensusEvent>,
        store: MemoryStore,
        pool: Arc<MemoryTxPool>,
        block_ops: Arc<BlockOperations>,
    }

    fn genesis_state(keys: &[Keypair]) -> ChainState {
        let genesis = GenesisDoc {
            chain_id: CHAIN_ID.to_string(),
            genesis_time_ms: 0,
            validators: keys
                .iter()
                .map(|k| GenesisValidator {
                    address: k.pubkey(),
                    power: 10,
                })
                .collect(),
            initial_state_root: Hash::default(),
        };
        ChainState::from_genesis(&genesis).unwrap()
    }

    fn setup_with_config(n: usize, we_propose: bool, config: ConsensusConfig) -> Fixture {
        let mut keys: Vec<Keypair> = (0..n).map(|_| Keypair::new()).collect();
        let state = genesis_state(&keys);
        let proposer = state.validators.get_proposer().unwrap().address;
        let ours = keys
            .iter()
            .position(|k| (k.pubkey() == proposer) == we_propose)
            .unwrap();
        let ours = keys.swap_remove(ours);
        let others = keys
            .into_iter()
            .map(|k| (state.validators.get_by_address(&k.pubkey()).unwrap().0, k))
            .collect();
        let address = ours.pubkey();
        build_fixture(
            config,
            state,
            Some(Box::new(KeypairValidator::new(ours))),
            address,
            others,
        )
    }

    fn setup(n: usize, we_propose: bool) -> Fixture {
        setup_with_config(n, we_propose, ConsensusConfig::dev_default())
    }

    fn build_fixture(
        config: ConsensusConfig,
        state: ChainState,
        signer: Option<Box<dyn PrivValidator>>,
        address: Pubkey,
        others: Vec<(u32, Keypair)>,
    ) -> Fixture {
        let store = MemoryStore::new();
        let pool = Arc::new(MemoryTxPool::new(1000, false));
        let block_ops = Arc::new(
            BlockOperations::new(
                Arc::new(store.clone()),
                pool.clone(),
                Arc::new(HashChainExecutor::default()),
                config.block_limits(),
            )
            .unwrap(),
        );
        let cs = ConsensusState::new(
            config,
            state,
            block_ops.clone(),
            signer,
            Arc::new(ConsensusMetrics::new()),
        )
        .unwrap();
        let events = cs.subscribe("test");
        Fixture {
            cs,
            others,
            address,
            events,
            store,
            pool,
            block_ops,
        }
    }

    fn signed_vote(
        key: &Keypair,
        index: u32,
        height: u64,
        round: i32,
        vote_type: VoteType,
        block_id: BlockId,
    ) -> Vote {
        let mut vote = Vote {
            validator_address: key.pubkey(),
            validator_index: index,
            height,
            round,
            timestamp_ms: now_ms(),
            vote_type,
            block_id,
            signature: Signature::default(),
        };
        vote.signature = key.sign_message(&vote.sign_bytes(CHAIN_ID));
        vote
    }

    fn unknown_block_id() -> BlockId {
        BlockId::new(
            Hash::new_unique(),
            PartSetHeader {
                total: 1,
                hash: Hash::new_unique(),
            },
        )
    }

    fn peer() -> PeerId {
        PeerId::new("peer")
    }

    impl Fixture {
        fn start(&mut self) {
            self.cs.start_round0().unwrap();
            self.cs.drain_internal_queue().unwrap();
        }

        /// Votes from the first `count` other validators.
        fn deliver_votes(
            &mut self,
            round: i32,
            vote_type: VoteType,
            block_id: BlockId,
            count: usize,
        ) {
            let height = self.cs.rs.height;
            for (index, key) in self.others.iter().take(count) {
                let vote = signed_vote(key, *index, height, round, vote_type, block_id);
                self.cs
                    .handle_msg(MsgInfo::from_peer(ConsensusMessage::Vote(vote), peer()))
                    .unwrap();
                self.cs.drain_internal_queue().unwrap();
            }
        }

        fn fire(&mut self, round: i32, step: RoundStep) {
            let ti = TimeoutInfo {
                duration: Duration::ZERO,
                height: self.cs.rs.height,
                round,
                step,
            };
            self.cs.handle_timeout(ti).unwrap();
            self.cs.drain_internal_queue().unwrap();
        }

        fn our_vote(&self, round: i32, vote_type: VoteType) -> Option<Vote> {
            self.cs
                .rs
                .votes
                .vote_set(round, vote_type)
                .and_then(|set| set.get_by_address(&self.address))
                .cloned()
        }

        fn step(&self) -> RoundStep {
            self.cs.rs.step
        }
    }

    #[test]
    fn test_single_validator_commits_own_proposal() {
        let mut fx = setup(1, true);
        fx.start();

        assert_eq!(fx.block_ops.height(), 1);
        assert_eq!(fx.cs.rs.height, 2);
        assert_eq!(fx.step(), RoundStep::NewHeight);

        let events: Vec<ConsensusEvent> = fx.events.try_iter().collect();
        let votes: Vec<&Vote> = events
            .iter()
            .filter_map(|e| match e {
                ConsensusEvent::Vote(v) => Some(v),
                _ => None,
            })
            .collect();
        assert_eq!(votes.len(), 2);
        assert_eq!(votes[0].vote_type, VoteType::Prevote);
        assert_eq!(votes[1].vote_type, VoteType::Precommit);
        assert!(!votes[0].is_nil());
        assert_eq!(votes[0].block_id, votes[1].block_id);
        assert!(events
            .iter()
            .any(|e| matches!(e, ConsensusEvent::Lock { height: 1, round: 0 })));
        assert!(events
            .iter()
            .any(|e| matches!(e, ConsensusEvent::NewBlock { height: 1, .. })));

        let meta = fx.block_ops.load_block_meta(1).unwrap().unwrap();
        assert_eq!(meta.block_id, votes[1].block_id);
        let seen = fx.block_ops.load_seen_commit(1).unwrap().unwrap();
        assert_eq!(seen.block_id, meta.block_id);
        assert!(fx
            .cs
            .rs
            .last_commit
            .as_ref()
            .is_some_and(VoteSet::has_two_thirds_majority));
        // The next height starts after timeout_commit.
        let scheduled = fx.cs.drain_scheduled_timeouts();
        assert_matches!(
            scheduled.last(),
            Some(TimeoutInfo {
                height: 2,
                round: 0,
                step: RoundStep::NewHeight,
                ..
            })
        );
    }

    #[test]
    fn test_chain_progresses_and_includes_txs() {
        let mut fx = setup(1, true);
        for nonce in 0..3 {
            fx.pool
                .add_tx(Transaction {
                    sender: Pubkey::new_unique(),
                    nonce,
                    payload: vec![1, 2, 3],
                })
                .unwrap();
        }
        fx.start();
        assert!(fx.pool.is_empty());
        let block = fx.block_ops.load_block(1).unwrap().unwrap();
        assert_eq!(block.txs.len(), 3);

        for height in 2..=4 {
            fx.fire(0, RoundStep::NewHeight);
            assert_eq!(fx.block_ops.height(), height);
        }
        let block = fx.block_ops.load_block(4).unwrap().unwrap();
        assert_eq!(block.header.total_txs, 3);
        let meta = fx.block_ops.load_block_meta(3).unwrap().unwrap();
        assert_eq!(block.last_commit.block_id, meta.block_id);
        assert_eq!(fx.cs.metrics().committed_height.get(), 4);
        assert_eq!(fx.cs.metrics().blocks_committed.get(), 4);
    }

    #[test]
    fn test_two_validators_wait_for_second_prevote() {
        let mut fx = setup(2, true);
        fx.start();

        assert_eq!(fx.step(), RoundStep::Prevote);
        let prevote = fx.our_vote(0, VoteType::Prevote).unwrap();
        assert!(!prevote.is_nil());
        assert!(fx.our_vote(0, VoteType::Precommit).is_none());

        // A timeout for an earlier step changes nothing.
        fx.fire(0, RoundStep::Propose);
        assert_eq!(fx.step(), RoundStep::Prevote);
        assert!(fx.our_vote(0, VoteType::Precommit).is_none());

        fx.deliver_votes(0, VoteType::Prevote, prevote.block_id, 1);
        assert_eq!(fx.step(), RoundStep::Precommit);
        assert_eq!(fx.cs.rs.locked_round, 0);
        assert_eq!(
            fx.our_vote(0, VoteType::Precommit).unwrap().block_id,
            prevote.block_id
        );
        assert_eq!(fx.block_ops.height(), 0);

        fx.deliver_votes(0, VoteType::Precommit, prevote.block_id, 1);
        assert_eq!(fx.block_ops.height(), 1);
        assert_eq!(fx.cs.rs.height, 2);
    }

    #[test]
    fn test_locked_validator_unlocks_on_later_polka() {
        let mut fx = setup(4, true);
        fx.start();

        // Round 0: everybody prevotes X, we lock on it.
        let x = fx.our_vote(0, VoteType::Prevote).unwrap().block_id;
        fx.deliver_votes(0, VoteType::Prevote, x, 3);
        assert_eq!(fx.cs.rs.locked_round, 0);
        assert_eq!(fx.our_vote(0, VoteType::Precommit).unwrap().block_id, x);

        // Others precommit nil: +2/3 precommits, but no majority.
        fx.deliver_votes(0, VoteType::Precommit, BlockId::default(), 2);
        assert_eq!(fx.step(), RoundStep::PrecommitWait);
        fx.fire(0, RoundStep::PrecommitWait);
        assert_eq!(fx.cs.rs.round, 1);
        // Equal powers rotate the proposer away from us, so round 1 waits
        // for a proposal that never comes.
        assert!(!fx.cs.is_proposer());
        assert_eq!(fx.step(), RoundStep::Propose);
        fx.fire(1, RoundStep::Propose);

        // Still locked: round 1 prevote is for X.
        assert_eq!(fx.step(), RoundStep::Prevote);
        assert_eq!(fx.cs.rs.locked_round, 0);
        assert_eq!(fx.our_vote(1, VoteType::Prevote).unwrap().block_id, x);

        // The other three prevote Y, which we never received.
        let y = unknown_block_id();
        fx.deliver_votes(1, VoteType::Prevote, y, 3);
        assert_eq!(fx.cs.rs.locked_round, -1);
        assert!(fx.cs.rs.locked_block.is_none());
        assert_eq!(fx.step(), RoundStep::PrevoteWait);
        assert!(fx.our_vote(1, VoteType::Precommit).is_none());

        fx.fire(1, RoundStep::PrevoteWait);
        assert_eq!(fx.step(), RoundStep::Precommit);
        assert!(fx.our_vote(1, VoteType::Precommit).unwrap().is_nil());

        fx.deliver_votes(1, VoteType::Precommit, y, 2);
        assert_eq!(fx.step(), RoundStep::PrecommitWait);
        assert!(fx.cs.rs.locked_block.is_none());

        let events: Vec<ConsensusEvent> = fx.events.try_iter().collect();
        assert!(events
            .iter()
            .any(|e| matches!(e, ConsensusEvent::Unlock { height: 1, round: 1 })));
        // Every precommit we signed was for the locked block or nil.
        for event in &events {
            if let ConsensusEvent::Vote(v) = event {
                if v.validator_address == fx.address && v.vote_type == VoteType::Precommit {
                    assert!(v.block_id == x || v.is_nil(), "precommitted {}", v.block_id);
                }
            }
        }
    }

    #[test]
    fn test_polka_for_invalid_block_is_fatal() {
        let mut fx = setup(4, false);
        let proposer = fx.cs.rs.proposer().unwrap();
        let (_, proposer_key) = fx
            .others
            .iter()
            .find(|(_, k)| k.pubkey() == proposer)
            .unwrap();

        let state = fx.cs.state.clone();
        let (valid, _) = fx
            .block_ops
            .create_proposal_block(1, &state, proposer, Commit::empty())
            .unwrap();
        let mut header = valid.header.clone();
        header.state_root = Hash::new_unique();
        let block = Block::new(header, valid.txs.clone(), valid.last_commit.clone());
        let parts = block.make_part_set(fx.cs.config.block_part_size).unwrap();
        let block_id = BlockId::new(block.hash(), parts.header());
        let mut proposal = Proposal::new(1, 0, now_ms(), parts.header(), -1, BlockId::default());
        proposal.signature = proposer_key.sign_message(&proposal.sign_bytes(CHAIN_ID));

        fx.start();
        assert_eq!(fx.step(), RoundStep::Propose);
        fx.cs
            .handle_msg(MsgInfo::from_peer(ConsensusMessage::Proposal(proposal), peer()))
            .unwrap();
        let part = parts.get_part(0).unwrap().clone();
        fx.cs
            .handle_msg(MsgInfo::from_peer(
                ConsensusMessage::BlockPart {
                    height: 1,
                    round: 0,
                    part,
                },
                peer(),
            ))
            .unwrap();
        fx.cs.drain_internal_queue().unwrap();
        // We refuse the block ourselves.
        assert!(fx.our_vote(0, VoteType::Prevote).unwrap().is_nil());

        let mut result = Ok(());
        for (index, key) in &fx.others {
            let vote = signed_vote(key, *index, 1, 0, VoteType::Prevote, block_id);
            result = fx
                .cs
                .handle_msg(MsgInfo::from_peer(ConsensusMessage::Vote(vote), peer()));
            if result.is_err() {
                break;
            }
        }
        assert_matches!(
            result,
            Err(FatalError::InvalidPolkaBlock {
                height: 1,
                round: 0,
                ..
            })
        );
    }

    #[test]
    fn test_stale_round_entries_are_noops() {
        let mut fx = setup(2, true);
        fx.start();
        assert_eq!((fx.cs.rs.round, fx.step()), (0, RoundStep::Prevote));

        fx.cs.enter_new_round(1, 0).unwrap();
        fx.cs.enter_propose(1, 0).unwrap();
        fx.cs.enter_prevote(1, 0).unwrap();
        fx.cs.enter_new_round(2, 0).unwrap();
        fx.cs.drain_internal_queue().unwrap();
        assert_eq!((fx.cs.rs.round, fx.step()), (0, RoundStep::Prevote));

        fx.fire(0, RoundStep::PrevoteWait);
        assert_eq!(fx.step(), RoundStep::Precommit);
        let precommit = fx.our_vote(0, VoteType::Precommit).unwrap();
        assert!(precommit.is_nil());

        fx.cs.enter_precommit(1, 0).unwrap();
        fx.cs.drain_internal_queue().unwrap();
        assert_eq!(fx.our_vote(0, VoteType::Precommit).unwrap(), precommit);
        assert_eq!(fx.step(), RoundStep::Precommit);
    }

    #[test]
    fn test_future_round_polka_skips_round() {
        let mut fx = setup(4, false);
        fx.start();
        assert_eq!(fx.cs.rs.round, 0);
        // +2/3 of anything at round 3 moves us there.
        fx.deliver_votes(3, VoteType::Prevote, BlockId::default(), 3);
        assert_eq!(fx.cs.rs.round, 3);
        assert!(fx.step() >= RoundStep::Propose);
    }

    #[test]
    fn test_non_validator_never_votes() {
        let keys: Vec<Keypair> = (0..2).map(|_| Keypair::new()).collect();
        let state = genesis_state(&keys);
        let others = keys
            .into_iter()
            .map(|k| (state.validators.get_by_address(&k.pubkey()).unwrap().0, k))
            .collect();
        let observer = KeypairValidator::new_random();
        let address = observer.address();
        let mut fx = build_fixture(
            ConsensusConfig::dev_default(),
            state,
            Some(Box::new(observer)),
            address,
            others,
        );
        fx.start();
        assert_eq!(fx.step(), RoundStep::Propose);
        fx.fire(0, RoundStep::Propose);
        assert_eq!(fx.step(), RoundStep::Prevote);
        assert_eq!(fx.cs.rs.prevotes(0).unwrap().sum(), 0);
        assert!(fx.cs.internal_rx.is_empty());
    }

    #[test]
    fn test_update_to_state_height_mismatch_is_fatal() {
        let mut fx = setup(1, true);
        fx.cs.rs.commit_round = 0;
        let mut state = fx.cs.state.clone();
        state.last_block_height = 5;
        assert_matches!(
            fx.cs.update_to_state(state),
            Err(ConsensusError::Fatal(FatalError::HeightMismatch {
                round_height: 1,
                state_height: 5,
                ..
            }))
        );
    }

    #[test]
    fn test_restart_reconstructs_last_commit() {
        let mut fx = setup(1, true);
        fx.start();
        let state = fx.block_ops.load_state().unwrap().unwrap();
        let block_ops = Arc::new(
            BlockOperations::new(
                Arc::new(fx.store.clone()),
                fx.pool.clone(),
                Arc::new(HashChainExecutor::default()),
                BlockLimits::default(),
            )
            .unwrap(),
        );
        assert_eq!(block_ops.height(), 1);
        let cs = ConsensusState::new(
            ConsensusConfig::dev_default(),
            state,
            block_ops,
            None,
            Arc::new(ConsensusMetrics::new()),
        )
        .unwrap();
        assert_eq!(cs.round_state().height, 2);
        let last_commit = cs.round_state().last_commit.as_ref().unwrap();
        assert!(last_commit.has_two_thirds_majority());
        assert_eq!(last_commit.height(), 1);
    }

    #[test]
    fn test_restart_without_seen_commit_is_fatal() {
        let fx = setup(1, true);
        let mut state = fx.cs.state.clone();
        state.last_block_height = 1;
        let result = ConsensusState::new(
            ConsensusConfig::dev_default(),
            state,
            fx.block_ops.clone(),
            None,
            Arc::new(ConsensusMetrics::new()),
        );
        assert_matches!(result, Err(ConsensusError::Fatal(FatalError::Invariant(_))));
    }

    #[test]
    fn test_conflicting_peer_vote_becomes_evidence() {
        let mut fx = setup(4, true);
        fx.start();
        let (index, key) = &fx.others[0];
        let first = signed_vote(key, *index, 1, 0, VoteType::Prevote, unknown_block_id());
        let second = signed_vote(key, *index, 1, 0, VoteType::Prevote, BlockId::default());
        fx.cs
            .handle_msg(MsgInfo::from_peer(ConsensusMessage::Vote(first), peer()))
            .unwrap();
        fx.cs
            .handle_msg(MsgInfo::from_peer(ConsensusMessage::Vote(second), peer()))
            .unwrap();
        assert!(fx.cs.evidence().has_evidence_against(&key.pubkey()));
        assert_eq!(fx.cs.metrics().byzantine_validators.get(), 1);
    }

    #[test]
    fn test_skip_timeout_commit_starts_next_height() {
        let config = ConsensusConfig {
            skip_timeout_commit: true,
            ..ConsensusConfig::dev_default()
        };
        let mut fx = setup_with_config(2, true, config);
        fx.start();
        let block_id = fx.our_vote(0, VoteType::Prevote).unwrap().block_id;
        fx.deliver_votes(0, VoteType::Prevote, block_id, 1);
        fx.deliver_votes(0, VoteType::Precommit, block_id, 1);
        assert_eq!(fx.block_ops.height(), 1);
        assert_eq!(fx.cs.rs.height, 2);
        // No NewHeight timeout needed.
        assert!(fx.step() >= RoundStep::Propose);
    }

    fn make_queued_votes(fx: &Fixture) -> (MsgInfo, MsgInfo) {
        let (index, key) = &fx.others[0];
        let vote = |round| {
            MsgInfo::internal(ConsensusMessage::Vote(signed_vote(
                key,
                *index,
                1,
                round,
                VoteType::Prevote,
                BlockId::default(),
            )))
        };
        (vote(0), vote(1))
    }

    #[test]
    fn test_internal_overflow_retried_on_a_thread() {
        let config = ConsensusConfig {
            msg_queue_size: 1,
            internal_queue_overflow: QueueOverflowPolicy::SpawnRetry,
            ..ConsensusConfig::dev_default()
        };
        let fx = setup_with_config(4, false, config);
        let (first, second) = make_queued_votes(&fx);
        let rx = fx.cs.internal_receiver();

        fx.cs.send_internal(first.clone());
        fx.cs.send_internal(second.clone());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), first);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), second);

        // A retry still pending when the state machine goes away ends quietly.
        fx.cs.send_internal(first);
        fx.cs.send_internal(second);
        drop(rx);
        drop(fx);
    }

    #[test]
    fn test_internal_overflow_dropped_with_policy() {
        let config = ConsensusConfig {
            msg_queue_size: 1,
            internal_queue_overflow: QueueOverflowPolicy::DropWithLog,
            ..ConsensusConfig::dev_default()
        };
        let fx = setup_with_config(4, false, config);
        let (first, second) = make_queued_votes(&fx);
        let rx = fx.cs.internal_receiver();

        fx.cs.send_internal(first.clone());
        fx.cs.send_internal(second);
        assert_eq!(rx.try_recv().unwrap(), first);
        std::thread::sleep(Duration::from_millis(50));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_proposal_from_wrong_proposer_rejected() {
        let mut fx = setup(2, false);
        fx.start();
        let parts_header = PartSetHeader {
            total: 1,
            hash: Hash::new_unique(),
        };
        let mut proposal = Proposal::new(1, 0, now_ms(), parts_header, -1, BlockId::default());
        // Signed by a key that is not the proposer's.
        proposal.signature = Keypair::new().sign_message(&proposal.sign_bytes(CHAIN_ID));
        fx.cs
            .handle_msg(MsgInfo::from_peer(ConsensusMessage::Proposal(proposal), peer()))
            .unwrap();
        assert!(fx.cs.rs.proposal.is_none());
        assert!(fx.cs.snapshot().read().proposal.is_none());
    }
}
