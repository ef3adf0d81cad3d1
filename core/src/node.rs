//! A full Kestrel node in one process.
//!
//! ```text
//!   peers ──> ChannelSwitch inbox ──> kstlNodeRouter ──> ConsensusManager
//!                                                          │  ▲
//!                                            peer queue ◄──┘  │ events
//!                                                             │
//!                      BlockOperations ◄── ConsensusService ──┘
//!                      (store, tx pool, executor)
//! ```
//!
//! [`Node::new`] resumes from the chain state saved in the store, or starts
//! from genesis when the store is empty. [`Node::connect`] links two nodes
//! through their switches and starts gossip both ways.

use {
    crate::{
        config::NodeConfig,
        error::{NodeError, Result},
    },
    crossbeam_channel::{Receiver, RecvTimeoutError},
    kestrel_chain_store::{BlockOperations, HashChainExecutor, KeyValueStore, MemoryTxPool},
    kestrel_consensus_bft::{ConsensusHandle, ConsensusService, ConsensusState},
    kestrel_consensus_net::{
        ChannelSwitch, ConsensusManager, ConsensusNetError, Envelope, Switch, ThreadSleeper,
    },
    kestrel_monitoring::{prometheus, ConsensusMetrics},
    kestrel_types::{ChainState, GenesisDoc, PeerId, PrivValidator, Transaction},
    log::*,
    std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread::{Builder, JoinHandle},
        time::Duration,
    },
};

const ROUTER_POLL: Duration = Duration::from_millis(100);

pub struct Node {
    id: PeerId,
    config: NodeConfig,
    exit: Arc<AtomicBool>,
    block_ops: Arc<BlockOperations>,
    tx_pool: Arc<MemoryTxPool>,
    switch: Arc<ChannelSwitch>,
    manager: Arc<ConsensusManager>,
    consensus: ConsensusHandle,
    service: ConsensusService,
    router: JoinHandle<()>,
}

impl Node {
    /// Assembles and starts a node. `priv_validator` is `None` for a node
    /// that follows the chain without voting.
    pub fn new(
        id: PeerId,
        config: NodeConfig,
        genesis: &GenesisDoc,
        priv_validator: Option<Box<dyn PrivValidator>>,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<Self> {
        config.validate()?;
        if genesis.chain_id != config.chain_id {
            return Err(NodeError::ChainIdMismatch {
                config: config.chain_id.clone(),
                genesis: genesis.chain_id.clone(),
            });
        }

        let tx_pool = Arc::new(MemoryTxPool::new(
            config.tx_pool_capacity,
            config.tx_pool_evict_on_full,
        ));
        let block_ops = Arc::new(BlockOperations::new(
            store,
            tx_pool.clone(),
            Arc::new(HashChainExecutor::default()),
            config.consensus.block_limits(),
        )?);
        let state = Self::initial_state(&config, genesis, &block_ops)?;
        info!(
            "node {id} starting on chain {} after height {} with {} validators",
            state.chain_id,
            state.last_block_height,
            state.validators.size()
        );

        let cs = ConsensusState::new(
            config.consensus.clone(),
            state,
            block_ops.clone(),
            priv_validator,
            Arc::new(ConsensusMetrics::new()),
        )?;
        let exit = Arc::new(AtomicBool::new(false));
        let service = ConsensusService::start(cs, exit.clone())?;
        let consensus = service.handle().clone();

        let switch = Arc::new(ChannelSwitch::new(
            id.clone(),
            config.consensus.msg_queue_size,
        ));
        let manager = Arc::new(ConsensusManager::new(
            config.gossip.clone(),
            consensus.clone(),
            block_ops.clone(),
            switch.clone() as Arc<dyn Switch>,
            Arc::new(ThreadSleeper),
        ));
        manager.start()?;

        let router = {
            let (inbox, manager, exit) = (switch.inbox(), manager.clone(), exit.clone());
            Builder::new()
                .name("kstlNodeRouter".to_string())
                .spawn(move || Self::run_router(inbox, manager, exit))?
        };

        Ok(Self {
            id,
            config,
            exit,
            block_ops,
            tx_pool,
            switch,
            manager,
            consensus,
            service,
            router,
        })
    }

    fn initial_state(
        config: &NodeConfig,
        genesis: &GenesisDoc,
        block_ops: &BlockOperations,
    ) -> Result<ChainState> {
        match block_ops.load_state()? {
            Some(state) if state.chain_id != config.chain_id => {
                Err(NodeError::StoredChainIdMismatch {
                    config: config.chain_id.clone(),
                    stored: state.chain_id,
                })
            }
            Some(state) => Ok(state),
            None => Ok(ChainState::from_genesis(genesis)?),
        }
    }

    fn run_router(
        inbox: Receiver<Envelope>,
        manager: Arc<ConsensusManager>,
        exit: Arc<AtomicBool>,
    ) {
        while !exit.load(Ordering::Relaxed) {
            let envelope = match inbox.recv_timeout(ROUTER_POLL) {
                Ok(envelope) => envelope,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            let from = envelope.from.clone();
            match manager.receive(envelope) {
                Ok(()) => {}
                Err(ConsensusNetError::UnknownPeer(_)) => {
                    debug!("dropping message from unregistered peer {from}")
                }
                Err(ConsensusNetError::ConsensusStopped) => {
                    debug!("consensus stopped, dropping message from {from}")
                }
                Err(err) => warn!("message from {from} rejected: {err}"),
            }
        }
    }

    /// Connects two nodes and starts gossiping in both directions.
    pub fn connect(a: &Node, b: &Node) -> Result<()> {
        let (b_seen_by_a, a_seen_by_b) = ChannelSwitch::connect(&a.switch, &b.switch);
        a.manager.add_peer(b_seen_by_a)?;
        b.manager.add_peer(a_seen_by_b)?;
        Ok(())
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn consensus(&self) -> &ConsensusHandle {
        &self.consensus
    }

    pub fn block_ops(&self) -> &Arc<BlockOperations> {
        &self.block_ops
    }

    pub fn switch(&self) -> &Arc<ChannelSwitch> {
        &self.switch
    }

    pub fn manager(&self) -> &ConsensusManager {
        &self.manager
    }

    /// Height of the last committed block.
    pub fn height(&self) -> u64 {
        self.block_ops.height()
    }

    pub fn is_halted(&self) -> bool {
        self.consensus.is_halted()
    }

    /// Queues a transaction for a future proposal.
    pub fn submit_tx(&self, tx: Transaction) -> Result<()> {
        self.tx_pool.add_tx(tx)?;
        Ok(())
    }

    pub fn pending_txs(&self) -> usize {
        self.tx_pool.len()
    }

    /// Consensus metrics in the Prometheus text format.
    pub fn metrics_text(&self) -> String {
        prometheus::encode(&self.consensus.metrics().snapshot())
    }

    pub fn round_state_json(&self) -> serde_json::Result<String> {
        let summary = self.consensus.with_round_state(|rs| rs.summary());
        serde_json::to_string(&summary)
    }

    pub fn peer_state_json(&self, peer: &PeerId) -> Option<serde_json::Result<String>> {
        self.manager.peer_state(peer).map(|ps| ps.to_json())
    }

    /// Asks every thread to stop without waiting for them.
    pub fn exit(&self) {
        self.exit.store(true, Ordering::Relaxed);
    }

    /// Stops the node and waits for its threads. Returns the fatal error
    /// that halted consensus, if there was one.
    pub fn join(self) -> Result<()> {
        self.exit();
        self.manager.stop();
        self.switch.stop();
        if self.router.join().is_err() {
            return Err(NodeError::ThreadPanicked("kstlNodeRouter"));
        }
        match self.service.join() {
            Ok(Ok(())) => {
                info!("node {} stopped at height {}", self.id, self.block_ops.height());
                Ok(())
            }
            Ok(Err(fatal)) => Err(NodeError::Fatal(fatal)),
            Err(_) => Err(NodeError::ThreadPanicked("kstlConsensus")),
        }
    }
}
