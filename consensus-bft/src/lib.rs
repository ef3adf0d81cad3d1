//! Kestrel Tendermint-style BFT Consensus
//!
//! A height is decided in one or more rounds. Each round runs three phases:
//!
//! 1. **Propose**: the round's proposer, picked by weighted round robin,
//!    broadcasts a block split into parts.
//! 2. **Prevote**: validators vote for the proposal, their locked block, or
//!    nil. +2/3 prevotes for one block is a *polka*.
//! 3. **Precommit**: validators precommit the polka block (locking on it) or
//!    nil. +2/3 precommits for one block commits it.
//!
//! A round that does not decide times out and the next round starts with the
//! next proposer. A validator locked on a block keeps voting for it until it
//! sees a polka for something else in a later round.
//!
//! # Layout
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │               ConsensusService                │
//! │  internal queue ─┐                            │
//! │  peer queue ─────┼──> ConsensusState          │
//! │  TimeoutTicker ──┘    ├─ RoundState           │
//! │                       │   └─ HeightVoteSet    │
//! │                       │       └─ VoteSet      │
//! │                       ├─ EvidenceCollector    │
//! │                       └─ EventBus ──> subs    │
//! └───────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod evidence;
pub mod height_vote_set;
pub mod round_state;
pub mod service;
pub mod state;
pub mod timeout;
pub mod vote_set;

pub use {
    config::{ConfigError, ConsensusConfig, QueueOverflowPolicy},
    error::{ConsensusError, VoteSetError},
    events::{ConsensusEvent, EventBus, EventBusError},
    evidence::{DuplicateVoteEvidence, EvidenceCollector},
    height_vote_set::HeightVoteSet,
    round_state::{RoundState, RoundStateSummary, RoundStep, RoundStepInfo, ValidBlockInfo},
    service::{ConsensusHandle, ConsensusService},
    state::{ConsensusMessage, ConsensusState, MsgInfo},
    timeout::{TimeoutInfo, TimeoutTicker},
    vote_set::VoteSet,
};
