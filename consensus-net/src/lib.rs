//! Kestrel Consensus Gossip
//!
//! Carries proposals, block parts and votes between validators and helps
//! lagging peers catch up. It handles:
//!
//! - **Wire messages**: a closed set of nine messages on four channels,
//!   bincode-encoded, checked by `validate_basic` before they reach the
//!   state machine.
//! - **Peer state**: what each peer has announced and what we already sent
//!   it, so gossip only sends what is missing.
//! - **Gossip loops**: data, votes and +2/3 announcements, three threads per
//!   peer, each backing off while it has nothing to send.
//! - **Transport**: the `Peer`/`Switch` traits the loops send through, plus
//!   an in-process channel implementation.
//!
//! ## Architecture
//!
//! ```text
//!  ┌─────────────────────────────────────────────────┐
//!  │  ConsensusService (kestrel-consensus-bft)       │
//!  │  <- peer queue: Proposal, BlockPart, Vote, Maj23│
//!  │  -> events: step, valid block, vote             │
//!  └──────────────┬──────────────────────────────────┘
//!                 │  ConsensusHandle
//!  ┌──────────────▼──────────────────────────────────┐
//!  │  ConsensusManager                               │
//!  │  • receive: decode, validate, route by channel  │
//!  │  • per peer: data / votes / maj23 loops         │
//!  │  • PeerState per peer                           │
//!  └──────────────┬──────────────────────────────────┘
//!                 │  Peer / Switch
//!  ┌──────────────▼──────────────────────────────────┐
//!  │  Transport (ChannelSwitch in process)           │
//!  └─────────────────────────────────────────────────┘
//! ```
//!
//! ## Crate modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`]     | `GossipConfig` defaults and dev overrides |
//! | [`message`]    | Wire types, channels, validation, framing |
//! | [`peer_state`] | Per-peer round state mirror |
//! | [`manager`]    | Inbound routing and the gossip loops |
//! | [`backoff`]    | Idle backoff and the injectable sleeper |
//! | [`transport`]  | Peer/switch traits, in-process switch |
//! | [`error`]      | Crate-wide error enum |

pub mod backoff;
pub mod config;
pub mod error;
pub mod manager;
pub mod message;
pub mod peer_state;
pub mod transport;

pub use {
    backoff::{IdleBackoff, Sleeper, ThreadSleeper},
    config::{GossipConfig, MAX_MESSAGE_SIZE},
    error::ConsensusNetError,
    manager::ConsensusManager,
    message::{
        ConsensusNetMessage, DATA_CHANNEL, MAX_VOTES_COUNT, STATE_CHANNEL, VOTE_CHANNEL,
        VOTE_SET_BITS_CHANNEL,
    },
    peer_state::{PeerRoundState, PeerState, PeerStats},
    transport::{ChannelPeer, ChannelSwitch, Envelope, Peer, Switch},
};
