//! Runs a [`ConsensusState`] on its own thread.
//!
//! The service thread is the only place the state machine is touched. It
//! waits on the internal queue, the peer queue and the timeout ticker and
//! hands whatever arrives first to the state machine. Everybody else talks
//! to it through a [`ConsensusHandle`].

use {
    crate::{
        error::ConsensusError,
        events::{ConsensusEvent, EventBus},
        round_state::RoundState,
        state::{ConsensusState, MsgInfo},
        timeout::TimeoutTicker,
    },
    crossbeam_channel::{select, Receiver, Sender},
    kestrel_monitoring::ConsensusMetrics,
    kestrel_types::FatalError,
    log::*,
    parking_lot::RwLock,
    std::{
        io,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread::{self, Builder, JoinHandle},
        time::Duration,
    },
};

const LOOP_TIMEOUT: Duration = Duration::from_millis(100);

/// Cheap, cloneable access to a running consensus service.
#[derive(Clone)]
pub struct ConsensusHandle {
    snapshot: Arc<RwLock<RoundState>>,
    peer_tx: Sender<MsgInfo>,
    event_bus: Arc<EventBus>,
    event_queue_size: usize,
    metrics: Arc<ConsensusMetrics>,
    halted: Arc<AtomicBool>,
}

impl ConsensusHandle {
    pub(crate) fn new(
        snapshot: Arc<RwLock<RoundState>>,
        peer_tx: Sender<MsgInfo>,
        event_bus: Arc<EventBus>,
        event_queue_size: usize,
        metrics: Arc<ConsensusMetrics>,
        halted: Arc<AtomicBool>,
    ) -> Self {
        Self {
            snapshot,
            peer_tx,
            event_bus,
            event_queue_size,
            metrics,
            halted,
        }
    }

    /// A copy of the round state as of the last handled message or timeout.
    pub fn round_state(&self) -> RoundState {
        self.snapshot.read().clone()
    }

    pub fn with_round_state<R>(&self, f: impl FnOnce(&RoundState) -> R) -> R {
        f(&self.snapshot.read())
    }

    /// Queues a message received from a peer. Blocks while the queue is full.
    pub fn send_peer_msg(&self, mi: MsgInfo) -> Result<(), ConsensusError> {
        self.peer_tx.send(mi).map_err(|_| ConsensusError::Stopped)
    }

    pub fn subscribe(&self, name: &str) -> Receiver<ConsensusEvent> {
        self.event_bus.subscribe(name, self.event_queue_size)
    }

    pub fn metrics(&self) -> &Arc<ConsensusMetrics> {
        &self.metrics
    }

    /// True once the state machine stopped on a fatal error.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Relaxed)
    }
}

pub struct ConsensusService {
    thread_hdl: JoinHandle<Result<(), FatalError>>,
    ticker: TimeoutTicker,
    handle: ConsensusHandle,
}

impl ConsensusService {
    /// Starts the ticker and the service thread, which runs until `exit` is
    /// set or the state machine fails.
    pub fn start(cs: ConsensusState, exit: Arc<AtomicBool>) -> io::Result<Self> {
        let handle = cs.handle();
        let halted = handle.halted.clone();
        let (schedule_rx, tock_tx) = cs.ticker_channels();
        let ticker = TimeoutTicker::start(schedule_rx, tock_tx)?;
        let thread_hdl = Builder::new()
            .name("kstlConsensus".to_string())
            .spawn(move || Self::run(cs, exit, halted))?;
        Ok(Self {
            thread_hdl,
            ticker,
            handle,
        })
    }

    pub fn handle(&self) -> &ConsensusHandle {
        &self.handle
    }

    fn run(
        mut cs: ConsensusState,
        exit: Arc<AtomicBool>,
        halted: Arc<AtomicBool>,
    ) -> Result<(), FatalError> {
        let internal_rx = cs.internal_receiver();
        let peer_rx = cs.peer_receiver();
        let tock_rx = cs.tock_receiver();
        info!("consensus service starting at {}", cs.round_state());
        cs.schedule_round0();

        while !exit.load(Ordering::Relaxed) {
            let result = select! {
                recv(internal_rx) -> mi => mi.ok().map(|mi| cs.handle_msg(mi)),
                recv(peer_rx) -> mi => mi.ok().map(|mi| cs.handle_msg(mi)),
                recv(tock_rx) -> ti => ti.ok().map(|ti| cs.handle_timeout(ti)),
                default(LOOP_TIMEOUT) => None,
            };
            if let Some(Err(err)) = result {
                error!(
                    "CONSENSUS FAILURE!!! {err}, at {}; the node must be restarted",
                    cs.round_state()
                );
                halted.store(true, Ordering::Relaxed);
                if let Err(publish_err) = cs
                    .event_bus()
                    .publish(ConsensusEvent::Halted(err.clone()))
                {
                    warn!("could not announce halt: {publish_err}");
                }
                return Err(err);
            }
        }
        info!("consensus service exiting at {}", cs.round_state());
        Ok(())
    }

    /// Waits for the service to stop. Returns the fatal error that stopped
    /// it, if any.
    pub fn join(self) -> thread::Result<Result<(), FatalError>> {
        let result = self.thread_hdl.join();
        // The state machine is gone now, which stops the ticker too.
        self.ticker.join()?;
        result
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{config::ConsensusConfig, state::ConsensusMessage},
        assert_matches::assert_matches,
        kestrel_chain_store::{BlockOperations, HashChainExecutor, MemoryStore, MemoryTxPool},
        kestrel_types::{
            now_ms, Block, BlockId, ChainState, Commit, GenesisDoc, GenesisValidator,
            KeypairValidator, PeerId, Proposal, Vote, VoteType,
        },
        solana_hash::Hash,
        solana_keypair::Keypair,
        solana_signature::Signature,
        solana_signer::Signer,
    };

    const CHAIN_ID: &str = "service-test";

    fn genesis_state(keys: &[Keypair]) -> ChainState {
        ChainState::from_genesis(&GenesisDoc {
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
        })
        .unwrap()
    }

    fn make_block_ops() -> Arc<BlockOperations> {
        Arc::new(
            BlockOperations::new(
                Arc::new(MemoryStore::new()),
                Arc::new(MemoryTxPool::new(100, false)),
                Arc::new(HashChainExecutor::default()),
                ConsensusConfig::dev_default().block_limits(),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_single_validator_service_commits_blocks() {
        let key = Keypair::new();
        let state = genesis_state(std::slice::from_ref(&key));
        let block_ops = make_block_ops();
        let cs = ConsensusState::new(
            ConsensusConfig::dev_default(),
            state,
            block_ops.clone(),
            Some(Box::new(KeypairValidator::new(key))),
            Arc::new(ConsensusMetrics::new()),
        )
        .unwrap();
        let events = cs.subscribe("test");
        let exit = Arc::new(AtomicBool::new(false));
        let service = ConsensusService::start(cs, exit.clone()).unwrap();

        let mut committed = Vec::new();
        while committed.len() < 3 {
            if let ConsensusEvent::NewBlock { height, .. } =
                events.recv_timeout(Duration::from_secs(10)).unwrap()
            {
                committed.push(height);
            }
        }
        assert_eq!(committed, vec![1, 2, 3]);
        assert!(service.handle().round_state().height >= 4);
        assert!(!service.handle().is_halted());

        exit.store(true, Ordering::Relaxed);
        assert_matches!(service.join(), Ok(Ok(())));
        assert!(block_ops.height() >= 3);
    }

    #[test]
    fn test_fatal_error_halts_service() {
        let mut keys: Vec<Keypair> = (0..4).map(|_| Keypair::new()).collect();
        let state = genesis_state(&keys);
        let proposer = state.validators.get_proposer().unwrap().address;
        let ours = keys.iter().position(|k| k.pubkey() != proposer).unwrap();
        let ours = keys.swap_remove(ours);
        let block_ops = make_block_ops();

        // The proposer's block with a state root nobody can agree with.
        let (valid, _) = block_ops
            .create_proposal_block(1, &state, proposer, Commit::empty())
            .unwrap();
        let mut header = valid.header.clone();
        header.state_root = Hash::new_unique();
        let block = Block::new(header, valid.txs.clone(), valid.last_commit.clone());
        let parts = block.make_part_set(ConsensusConfig::dev_default().block_part_size).unwrap();
        let block_id = BlockId::new(block.hash(), parts.header());
        let proposer_key = keys.iter().find(|k| k.pubkey() == proposer).unwrap();
        let mut proposal = Proposal::new(1, 0, now_ms(), parts.header(), -1, BlockId::default());
        proposal.signature = proposer_key.sign_message(&proposal.sign_bytes(CHAIN_ID));

        let mut prevotes = Vec::new();
        for key in &keys {
            let (index, _) = state.validators.get_by_address(&key.pubkey()).unwrap();
            let mut vote = Vote {
                validator_address: key.pubkey(),
                validator_index: index,
                height: 1,
                round: 0,
                timestamp_ms: now_ms(),
                vote_type: VoteType::Prevote,
                block_id,
                signature: Signature::default(),
            };
            vote.signature = key.sign_message(&vote.sign_bytes(CHAIN_ID));
            prevotes.push(vote);
        }

        let cs = ConsensusState::new(
            ConsensusConfig::dev_default(),
            state,
            block_ops,
            Some(Box::new(KeypairValidator::new(ours))),
            Arc::new(ConsensusMetrics::new()),
        )
        .unwrap();
        let events = cs.subscribe("test");
        let service = ConsensusService::start(cs, Arc::new(AtomicBool::new(false))).unwrap();
        let handle = service.handle().clone();
        let peer = PeerId::new("byzantine");
        handle
            .send_peer_msg(MsgInfo::from_peer(ConsensusMessage::Proposal(proposal), peer.clone()))
            .unwrap();
        handle
            .send_peer_msg(MsgInfo::from_peer(
                ConsensusMessage::BlockPart {
                    height: 1,
                    round: 0,
                    part: parts.get_part(0).unwrap().clone(),
                },
                peer.clone(),
            ))
            .unwrap();
        for vote in prevotes {
            // The service may already be gone after the polka.
            let _ = handle.send_peer_msg(MsgInfo::from_peer(
                ConsensusMessage::Vote(vote),
                peer.clone(),
            ));
        }

        assert_matches!(
            service.join(),
            Ok(Err(FatalError::InvalidPolkaBlock { height: 1, .. }))
        );
        assert!(handle.is_halted());
        assert!(events
            .try_iter()
            .any(|e| matches!(e, ConsensusEvent::Halted(FatalError::InvalidPolkaBlock { .. }))));
        assert_matches!(
            handle.send_peer_msg(MsgInfo::from_peer(
                ConsensusMessage::PeerMaj23 {
                    height: 1,
                    round: 0,
                    vote_type: VoteType::Prevote,
                    block_id,
                },
                peer,
            )),
            Err(ConsensusError::Stopped)
        );
    }
}
