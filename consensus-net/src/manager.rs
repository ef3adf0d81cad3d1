//! Consensus gossip.
//!
//! The [`ConsensusManager`] keeps a [`PeerState`] for every connected peer
//! and runs three loops per peer:
//!
//! - **data**: proposal and block parts the peer is missing, or parts of
//!   stored blocks when the peer is behind.
//! - **votes**: last commit, proof-of-lock prevotes, prevotes and
//!   precommits the peer is missing, or stored commits when it is behind.
//! - **maj23**: which blocks we have seen +2/3 votes for, so the peer can
//!   answer with the votes we lack.
//!
//! Inbound messages are decoded and validated here. Proposals, block parts
//! and votes go to the consensus service's peer queue; everything else only
//! updates the sender's [`PeerState`].

use {
    crate::{
        backoff::{IdleBackoff, Sleeper},
        config::GossipConfig,
        error::{ConsensusNetError, Result},
        message::{
            ConsensusNetMessage, DATA_CHANNEL, STATE_CHANNEL, VOTE_CHANNEL, VOTE_SET_BITS_CHANNEL,
        },
        peer_state::{PeerRoundState, PeerState},
        transport::{Envelope, Peer, Switch},
    },
    crossbeam_channel::{Receiver, RecvTimeoutError},
    kestrel_chain_store::BlockOperations,
    kestrel_consensus_bft::{
        ConsensusEvent, ConsensusHandle, ConsensusMessage, MsgInfo, RoundState, RoundStep,
        RoundStepInfo, VoteSet,
    },
    kestrel_types::{now_ms, BitArray, BlockId, PeerId, Proposal, Vote, VoteSetReader, VoteType},
    log::*,
    parking_lot::{Mutex, RwLock},
    std::{
        collections::HashMap,
        io,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread::{Builder, JoinHandle},
        time::Duration,
    },
};

const EVENT_POLL: Duration = Duration::from_millis(100);

struct PeerEntry {
    peer: Arc<dyn Peer>,
    state: Arc<PeerState>,
}

enum DataAction {
    Part {
        msg: ConsensusNetMessage,
        height: u64,
        round: i32,
        index: u32,
    },
    CatchUp,
    Proposal {
        proposal: Proposal,
        pol: Option<ConsensusNetMessage>,
    },
    Idle,
}

struct Inner {
    config: GossipConfig,
    consensus: ConsensusHandle,
    block_ops: Arc<BlockOperations>,
    switch: Arc<dyn Switch>,
    sleeper: Arc<dyn Sleeper>,
    peers: RwLock<HashMap<PeerId, PeerEntry>>,
    exit: AtomicBool,
}

pub struct ConsensusManager {
    inner: Arc<Inner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ConsensusManager {
    pub fn new(
        config: GossipConfig,
        consensus: ConsensusHandle,
        block_ops: Arc<BlockOperations>,
        switch: Arc<dyn Switch>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                consensus,
                block_ops,
                switch,
                sleeper,
                peers: RwLock::default(),
                exit: AtomicBool::new(false),
            }),
            threads: Mutex::default(),
        }
    }

    /// Starts broadcasting our own step changes, valid blocks and votes.
    pub fn start(&self) -> io::Result<()> {
        let inner = self.inner.clone();
        let events = inner.consensus.subscribe("consensus-net");
        let handle = Builder::new()
            .name("kstlGossipEvts".to_string())
            .spawn(move || inner.run_events(events))?;
        self.threads.lock().push(handle);
        Ok(())
    }

    /// Starts gossiping with `peer`.
    pub fn add_peer(&self, peer: Arc<dyn Peer>) -> Result<Arc<PeerState>> {
        let state = self.inner.register_peer(peer.clone())?;
        let spawned = self.spawn_peer_loops(&peer, &state);
        if let Err(err) = spawned {
            self.remove_peer(peer.id());
            return Err(err.into());
        }
        let info = self
            .inner
            .consensus
            .with_round_state(|rs| RoundStepInfo::from_round_state(rs, now_ms()));
        self.inner
            .send_msg(&*peer, &ConsensusNetMessage::new_round_step(&info));
        info!("added consensus peer {}", peer.id());
        Ok(state)
    }

    fn spawn_peer_loops(&self, peer: &Arc<dyn Peer>, state: &Arc<PeerState>) -> io::Result<()> {
        let mut threads = self.threads.lock();
        threads.retain(|t| !t.is_finished());

        let (inner, p, s) = (self.inner.clone(), peer.clone(), state.clone());
        threads.push(
            Builder::new()
                .name("kstlGossipData".to_string())
                .spawn(move || inner.gossip_data_loop(p, s))?,
        );
        let (inner, p, s) = (self.inner.clone(), peer.clone(), state.clone());
        threads.push(
            Builder::new()
                .name("kstlGossipVote".to_string())
                .spawn(move || inner.gossip_votes_loop(p, s))?,
        );
        let (inner, p, s) = (self.inner.clone(), peer.clone(), state.clone());
        threads.push(
            Builder::new()
                .name("kstlGossipMaj23".to_string())
                .spawn(move || inner.query_maj23_loop(p, s))?,
        );
        Ok(())
    }

    /// Forgets `peer`. Its loops exit once the peer stops running.
    pub fn remove_peer(&self, peer: &PeerId) {
        if self.inner.peers.write().remove(peer).is_some() {
            info!("removed consensus peer {peer}");
        }
    }

    pub fn peer_state(&self, peer: &PeerId) -> Option<Arc<PeerState>> {
        self.inner.peer_state(peer)
    }

    pub fn num_peers(&self) -> usize {
        self.inner.peers.read().len()
    }

    /// Handles one payload from a peer. A peer that sends something
    /// undecodable or invalid is stopped.
    pub fn receive(&self, envelope: Envelope) -> Result<()> {
        let result = self.inner.receive(&envelope);
        if let Err(ConsensusNetError::InvalidMessage(reason)) = &result {
            self.inner
                .switch
                .stop_peer_for_error(&envelope.from, reason);
            self.remove_peer(&envelope.from);
        }
        result
    }

    /// Stops every loop and waits for them.
    pub fn stop(&self) {
        self.inner.exit.store(true, Ordering::Relaxed);
        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            if handle.join().is_err() {
                error!("a gossip thread panicked");
            }
        }
    }
}

impl Drop for ConsensusManager {
    fn drop(&mut self) {
        self.inner.exit.store(true, Ordering::Relaxed);
    }
}

fn invalid(reason: impl Into<String>) -> ConsensusNetError {
    ConsensusNetError::InvalidMessage(reason.into())
}

/// The votes we hold for `block_id`, or an empty array of the right size.
fn our_votes_for(rs: &RoundState, round: i32, vote_type: VoteType, block_id: &BlockId) -> BitArray {
    rs.votes
        .vote_set(round, vote_type)
        .and_then(|votes| votes.bit_array_by_block_id(block_id))
        .unwrap_or_else(|| BitArray::new(rs.validators.size()))
}

/// True if `vote` is one we did not have yet.
fn is_new_vote(rs: &RoundState, vote: &Vote) -> bool {
    let votes = if vote.height == rs.height {
        rs.votes.vote_set(vote.round, vote.vote_type)
    } else if vote.height.saturating_add(1) == rs.height && vote.vote_type == VoteType::Precommit {
        rs.last_commit.as_ref()
    } else {
        return false;
    };
    match votes {
        Some(votes) => votes.get_by_address(&vote.validator_address).is_none(),
        // A round we do not track yet; consensus may open it.
        None => true,
    }
}

fn reached(count: u64, threshold: u64) -> bool {
    count.checked_rem(threshold) == Some(0)
}

impl Inner {
    fn is_running(&self, peer: &dyn Peer) -> bool {
        !self.exit.load(Ordering::Relaxed) && peer.is_running()
    }

    fn peer_state(&self, peer: &PeerId) -> Option<Arc<PeerState>> {
        self.peers.read().get(peer).map(|entry| entry.state.clone())
    }

    fn peer(&self, peer: &PeerId) -> Option<Arc<dyn Peer>> {
        self.peers.read().get(peer).map(|entry| entry.peer.clone())
    }

    fn register_peer(&self, peer: Arc<dyn Peer>) -> Result<Arc<PeerState>> {
        let mut peers = self.peers.write();
        let id = peer.id().clone();
        if peers.contains_key(&id) {
            return Err(ConsensusNetError::PeerAlreadyConnected(id));
        }
        let state = Arc::new(PeerState::new(id.clone()));
        peers.insert(
            id,
            PeerEntry {
                peer,
                state: state.clone(),
            },
        );
        Ok(state)
    }

    /// Drops the peer's entry if it still belongs to this connection.
    fn forget_stopped_peer(&self, peer: &dyn Peer, state: &Arc<PeerState>) {
        let mut peers = self.peers.write();
        if peers
            .get(peer.id())
            .is_some_and(|entry| Arc::ptr_eq(&entry.state, state))
        {
            peers.remove(peer.id());
            debug!("peer {} disconnected", peer.id());
        }
    }

    fn send_msg(&self, peer: &dyn Peer, msg: &ConsensusNetMessage) -> bool {
        match msg.encode(self.config.max_message_size) {
            Ok(bytes) => peer.send(msg.channel(), bytes),
            Err(err) => {
                error!("failed to encode {}: {err}", msg.kind());
                false
            }
        }
    }

    fn try_send_msg(&self, peer: &dyn Peer, msg: &ConsensusNetMessage) -> bool {
        match msg.encode(self.config.max_message_size) {
            Ok(bytes) => peer.try_send(msg.channel(), bytes),
            Err(err) => {
                error!("failed to encode {}: {err}", msg.kind());
                false
            }
        }
    }

    fn broadcast(&self, msg: &ConsensusNetMessage) {
        match msg.encode(self.config.max_message_size) {
            Ok(bytes) => self.switch.broadcast(msg.channel(), bytes),
            Err(err) => error!("failed to encode {}: {err}", msg.kind()),
        }
    }

    fn forward(&self, msg: ConsensusMessage, from: &PeerId) -> Result<()> {
        self.consensus
            .send_peer_msg(MsgInfo::from_peer(msg, from.clone()))
            .map_err(|_| ConsensusNetError::ConsensusStopped)
    }

    fn run_events(&self, events: Receiver<ConsensusEvent>) {
        while !self.exit.load(Ordering::Relaxed) {
            match events.recv_timeout(EVENT_POLL) {
                Ok(event) => self.handle_event(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("gossip event loop exiting");
    }

    fn handle_event(&self, event: ConsensusEvent) {
        match event {
            ConsensusEvent::NewRoundStep(info) | ConsensusEvent::NewRound(info) => {
                self.broadcast(&ConsensusNetMessage::new_round_step(&info));
            }
            ConsensusEvent::ValidBlock(info) => {
                self.broadcast(&ConsensusNetMessage::new_valid_block(&info));
            }
            ConsensusEvent::Vote(vote) => {
                self.broadcast(&ConsensusNetMessage::HasVote {
                    height: vote.height,
                    round: vote.round,
                    vote_type: vote.vote_type,
                    index: vote.validator_index,
                });
            }
            ConsensusEvent::Halted(err) => {
                warn!("consensus halted ({err}); gossip keeps serving stored blocks");
            }
            _ => {}
        }
    }

    fn receive(&self, envelope: &Envelope) -> Result<()> {
        let from = &envelope.from;
        let ps = self
            .peer_state(from)
            .ok_or_else(|| ConsensusNetError::UnknownPeer(from.clone()))?;
        let msg = ConsensusNetMessage::decode(&envelope.payload, self.config.max_message_size)
            .map_err(|err| {
                invalid(format!(
                    "undecodable message on channel {:#04x}: {err}",
                    envelope.channel
                ))
            })?;
        if msg.channel() != envelope.channel {
            return Err(invalid(format!(
                "{} message on channel {:#04x}",
                msg.kind(),
                envelope.channel
            )));
        }
        msg.validate_basic()?;
        trace!("received {msg} from {from}");

        match msg {
            ConsensusNetMessage::NewRoundStep { .. }
            | ConsensusNetMessage::NewValidBlock { .. }
            | ConsensusNetMessage::ProposalPol { .. }
            | ConsensusNetMessage::HasVote { .. } => {
                ps.apply(&msg);
                Ok(())
            }
            ConsensusNetMessage::VoteSetMaj23 {
                height,
                round,
                vote_type,
                block_id,
            } => self.on_vote_set_maj23(&ps, from, height, round, vote_type, block_id),
            ConsensusNetMessage::Proposal(proposal) => {
                ps.set_has_proposal(&proposal);
                self.forward(ConsensusMessage::Proposal(proposal), from)
            }
            ConsensusNetMessage::BlockPart {
                height,
                round,
                part,
            } => {
                ps.set_has_proposal_block_part(height, round, part.index);
                let is_new = self.consensus.with_round_state(|rs| {
                    rs.height == height
                        && rs
                            .proposal_block_parts
                            .as_ref()
                            .is_some_and(|parts| !parts.bit_array().get_index(part.index as usize))
                });
                self.forward(ConsensusMessage::BlockPart { height, round, part }, from)?;
                if is_new
                    && reached(
                        ps.record_block_part(),
                        self.config.block_parts_to_become_good_peer,
                    )
                {
                    self.switch.mark_peer_as_good(from);
                }
                Ok(())
            }
            ConsensusNetMessage::Vote(vote) => {
                let (height, num_validators, last_commit_size, is_new) =
                    self.consensus.with_round_state(|rs| {
                        (
                            rs.height,
                            rs.validators.size(),
                            rs.last_commit.as_ref().map_or(0, |lc| lc.size()),
                            is_new_vote(rs, &vote),
                        )
                    });
                ps.ensure_vote_bit_arrays(height, num_validators);
                if height > 1 {
                    ps.ensure_vote_bit_arrays(height.saturating_sub(1), last_commit_size);
                }
                ps.set_has_vote(&vote);
                self.forward(ConsensusMessage::Vote(vote), from)?;
                if is_new && reached(ps.record_vote(), self.config.votes_to_become_good_peer) {
                    self.switch.mark_peer_as_good(from);
                }
                Ok(())
            }
            ConsensusNetMessage::VoteSetBits {
                height,
                round,
                vote_type,
                block_id,
                votes,
            } => {
                let ours = self.consensus.with_round_state(|rs| {
                    (rs.height == height).then(|| our_votes_for(rs, round, vote_type, &block_id))
                });
                ps.apply_vote_set_bits(height, round, vote_type, &votes, ours.as_ref());
                Ok(())
            }
        }
    }

    /// Records the peer's claim and answers with the votes we hold for the
    /// same block.
    fn on_vote_set_maj23(
        &self,
        ps: &PeerState,
        from: &PeerId,
        height: u64,
        round: i32,
        vote_type: VoteType,
        block_id: BlockId,
    ) -> Result<()> {
        let ours = self.consensus.with_round_state(|rs| {
            (rs.height == height).then(|| our_votes_for(rs, round, vote_type, &block_id))
        });
        let Some(votes) = ours else {
            return Ok(());
        };
        self.forward(
            ConsensusMessage::PeerMaj23 {
                height,
                round,
                vote_type,
                block_id,
            },
            from,
        )?;
        let Some(peer) = self.peer(ps.peer_id()) else {
            return Ok(());
        };
        self.try_send_msg(
            &*peer,
            &ConsensusNetMessage::VoteSetBits {
                height,
                round,
                vote_type,
                block_id,
                votes,
            },
        );
        Ok(())
    }

    fn gossip_data_loop(&self, peer: Arc<dyn Peer>, ps: Arc<PeerState>) {
        let mut backoff =
            IdleBackoff::new(self.config.peer_gossip_sleep(), self.config.peer_gossip_max_sleep());
        while self.is_running(&*peer) {
            if self.gossip_data_step(&*peer, &ps) {
                backoff.reset();
            } else {
                self.sleeper.sleep(backoff.idle());
            }
        }
        if !peer.is_running() {
            self.forget_stopped_peer(&*peer, &ps);
        }
        debug!("data gossip for {} exiting", peer.id());
    }

    fn gossip_votes_loop(&self, peer: Arc<dyn Peer>, ps: Arc<PeerState>) {
        let mut backoff =
            IdleBackoff::new(self.config.peer_gossip_sleep(), self.config.peer_gossip_max_sleep());
        while self.is_running(&*peer) {
            if self.gossip_votes_step(&*peer, &ps) {
                backoff.reset();
            } else {
                self.sleeper.sleep(backoff.idle());
            }
        }
        debug!("vote gossip for {} exiting", peer.id());
    }

    fn query_maj23_loop(&self, peer: Arc<dyn Peer>, ps: Arc<PeerState>) {
        while self.is_running(&*peer) {
            self.query_maj23_step(&*peer, &ps);
            self.sleeper.sleep(self.config.peer_query_maj23_sleep());
        }
        debug!("maj23 gossip for {} exiting", peer.id());
    }

    /// One pass of the data loop. Returns true if it did something.
    fn gossip_data_step(&self, peer: &dyn Peer, ps: &PeerState) -> bool {
        let prs = ps.get_round_state();
        let action = self.consensus.with_round_state(|rs| {
            if let (Some(parts), Some(peer_parts)) =
                (rs.proposal_block_parts.as_ref(), prs.proposal_block_parts.as_ref())
            {
                if parts.has_header(&prs.proposal_block_parts_header) {
                    let missing = parts.bit_array().sub(peer_parts).pick_random();
                    if let Some(part) = missing.and_then(|i| parts.get_part(i as u32)) {
                        return DataAction::Part {
                            msg: ConsensusNetMessage::BlockPart {
                                height: rs.height,
                                round: rs.round,
                                part: part.clone(),
                            },
                            height: prs.height,
                            round: prs.round,
                            index: part.index,
                        };
                    }
                }
            }
            if prs.height > 0 && prs.height < rs.height {
                return DataAction::CatchUp;
            }
            if rs.height != prs.height || rs.round != prs.round || prs.proposal {
                return DataAction::Idle;
            }
            let Some(proposal) = rs.proposal.as_ref() else {
                return DataAction::Idle;
            };
            let pol = (proposal.pol_round >= 0)
                .then(|| rs.prevotes(proposal.pol_round))
                .flatten()
                .map(|prevotes| ConsensusNetMessage::ProposalPol {
                    height: rs.height,
                    proposal_pol_round: proposal.pol_round,
                    proposal_pol: prevotes.bit_array(),
                });
            DataAction::Proposal {
                proposal: proposal.clone(),
                pol,
            }
        });

        match action {
            DataAction::Part {
                msg,
                height,
                round,
                index,
            } => {
                if self.send_msg(peer, &msg) {
                    ps.set_has_proposal_block_part(height, round, index);
                }
                true
            }
            DataAction::CatchUp => self.gossip_data_for_catchup(peer, ps, &prs),
            DataAction::Proposal { proposal, pol } => {
                if self.send_msg(peer, &ConsensusNetMessage::Proposal(proposal.clone())) {
                    ps.set_has_proposal(&proposal);
                }
                if let Some(pol) = pol {
                    self.send_msg(peer, &pol);
                }
                true
            }
            DataAction::Idle => false,
        }
    }

    /// Sends a part of the stored block at the peer's height.
    fn gossip_data_for_catchup(
        &self,
        peer: &dyn Peer,
        ps: &PeerState,
        prs: &PeerRoundState,
    ) -> bool {
        if prs.height > self.block_ops.height() {
            return false;
        }
        let meta = match self.block_ops.load_block_meta(prs.height) {
            Ok(Some(meta)) => meta,
            Ok(None) => {
                warn!("no block meta at height {} for catch-up of {}", prs.height, peer.id());
                return false;
            }
            Err(err) => {
                error!("failed to load block meta at height {}: {err}", prs.height);
                return false;
            }
        };
        let Some(peer_parts) = prs.proposal_block_parts.as_ref() else {
            ps.init_proposal_block_parts(meta.block_id.parts_header);
            return true;
        };
        let Some(index) = peer_parts.not().pick_random() else {
            return false;
        };
        if meta.block_id.parts_header != prs.proposal_block_parts_header {
            debug!(
                "peer {} expects part set {} at height {}, we stored {}",
                peer.id(),
                prs.proposal_block_parts_header,
                prs.height,
                meta.block_id.parts_header
            );
            return false;
        }
        let index = index as u32;
        let part = match self.block_ops.load_block_part(prs.height, index) {
            Ok(Some(part)) => part,
            Ok(None) => {
                warn!("missing block part {index} at height {}", prs.height);
                return false;
            }
            Err(err) => {
                error!("failed to load block part {index} at height {}: {err}", prs.height);
                return false;
            }
        };
        let msg = ConsensusNetMessage::BlockPart {
            height: prs.height,
            round: prs.round,
            part,
        };
        if self.send_msg(peer, &msg) {
            ps.set_has_proposal_block_part(prs.height, prs.round, index);
        }
        true
    }

    /// One pass of the votes loop. Returns true if a vote was sent.
    fn gossip_votes_step(&self, peer: &dyn Peer, ps: &PeerState) -> bool {
        let prs = ps.get_round_state();
        let (picked, height) = self.consensus.with_round_state(|rs| {
            if rs.height == prs.height {
                if let Some(vote) = pick_vote_for_height(rs, &prs, ps) {
                    return (Some(vote), rs.height);
                }
            }
            // Peer is one height behind: it needs our last commit.
            if prs.height != 0 && rs.height == prs.height.saturating_add(1) {
                if let Some(vote) = rs
                    .last_commit
                    .as_ref()
                    .and_then(|lc| ps.pick_vote_to_send(lc))
                {
                    return (Some(vote), rs.height);
                }
            }
            (None, rs.height)
        });
        let vote = picked.or_else(|| {
            // Further behind: send the stored commit for its height.
            if prs.height == 0 || height < prs.height.saturating_add(2) {
                return None;
            }
            match self.block_ops.load_block_commit(prs.height) {
                Ok(Some(commit)) => ps.pick_vote_to_send(&commit),
                Ok(None) => None,
                Err(err) => {
                    error!("failed to load commit at height {}: {err}", prs.height);
                    None
                }
            }
        });
        let Some(vote) = vote else {
            return false;
        };
        if !self.send_msg(peer, &ConsensusNetMessage::Vote(vote.clone())) {
            return false;
        }
        ps.set_has_vote(&vote);
        true
    }

    /// One pass of the maj23 loop. Returns how many announcements were sent.
    fn query_maj23_step(&self, peer: &dyn Peer, ps: &PeerState) -> usize {
        let prs = ps.get_round_state();
        let mut msgs = self.consensus.with_round_state(|rs| {
            if rs.height != prs.height {
                return Vec::new();
            }
            [
                (prs.round, VoteType::Prevote),
                (prs.round, VoteType::Precommit),
                (prs.proposal_pol_round, VoteType::Prevote),
            ]
            .into_iter()
            .filter(|(round, _)| *round >= 0)
            .filter_map(|(round, vote_type)| {
                let block_id = rs.votes.vote_set(round, vote_type)?.two_thirds_majority()?;
                Some(ConsensusNetMessage::VoteSetMaj23 {
                    height: prs.height,
                    round,
                    vote_type,
                    block_id,
                })
            })
            .collect::<Vec<_>>()
        });

        let stored_height = self.block_ops.height();
        if prs.catchup_commit_round != -1 && prs.height > 0 && prs.height <= stored_height {
            let commit = if prs.height == stored_height {
                self.block_ops.load_seen_commit(prs.height)
            } else {
                self.block_ops.load_block_commit(prs.height)
            };
            match commit {
                Ok(Some(commit)) if !commit.block_id.is_zero() => {
                    msgs.push(ConsensusNetMessage::VoteSetMaj23 {
                        height: prs.height,
                        round: commit.round(),
                        vote_type: VoteType::Precommit,
                        block_id: commit.block_id,
                    });
                }
                Ok(_) => {}
                Err(err) => error!("failed to load commit at height {}: {err}", prs.height),
            }
        }

        msgs.iter().filter(|msg| self.try_send_msg(peer, msg)).count()
    }
}

fn pick_vote_for_height(rs: &RoundState, prs: &PeerRoundState, ps: &PeerState) -> Option<Vote> {
    let pick = |votes: Option<&VoteSet>| votes.and_then(|votes| ps.pick_vote_to_send(votes));
    let in_round = prs.round != -1 && prs.round <= rs.round;

    if prs.step == RoundStep::NewHeight {
        if let Some(vote) = pick(rs.last_commit.as_ref()) {
            return Some(vote);
        }
    }
    if prs.step <= RoundStep::Propose && in_round && prs.proposal_pol_round != -1 {
        if let Some(vote) = pick(rs.prevotes(prs.proposal_pol_round)) {
            return Some(vote);
        }
    }
    if prs.step <= RoundStep::PrevoteWait && in_round {
        if let Some(vote) = pick(rs.prevotes(prs.round)) {
            return Some(vote);
        }
    }
    if prs.step <= RoundStep::PrecommitWait && in_round {
        if let Some(vote) = pick(rs.precommits(prs.round)) {
            return Some(vote);
        }
    }
    // Prevotes are still useful after the step, for valid blocks.
    if in_round {
        if let Some(vote) = pick(rs.prevotes(prs.round)) {
            return Some(vote);
        }
    }
    if prs.proposal_pol_round != -1 {
        return pick(rs.prevotes(prs.proposal_pol_round));
    }
    None
}
