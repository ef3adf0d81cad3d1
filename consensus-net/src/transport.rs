//! The peer transport consumed by gossip.
//!
//! Gossip needs only three things from the network: send a payload to one
//! peer on a channel, broadcast a payload to every peer, and report
//! misbehaving or useful peers. [`Peer`] and [`Switch`] capture exactly
//! that. [`ChannelSwitch`] is an in-process implementation over crossbeam
//! channels, used to wire several nodes together in one process.
//!
//! ```text
//!   node A                                node B
//!  ┌──────────────┐  ChannelPeer(B)   ┌──────────────┐
//!  │ ChannelSwitch│ ────────────────> │    inbox     │
//!  │    inbox     │ <──────────────── │ ChannelSwitch│
//!  └──────────────┘  ChannelPeer(A)   └──────────────┘
//! ```

use {
    crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender, TrySendError},
    kestrel_types::PeerId,
    log::*,
    parking_lot::{Mutex, RwLock},
    std::{
        collections::{BTreeMap, BTreeSet},
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::Duration,
    },
};

/// How long a blocking send waits for room in the remote inbox.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// One connected peer, as seen by gossip.
pub trait Peer: Send + Sync {
    fn id(&self) -> &PeerId;

    /// Queues `payload` for the peer, waiting for room up to a timeout.
    /// Returns false if it was not queued.
    fn send(&self, channel: u8, payload: Vec<u8>) -> bool;

    /// Like [`Peer::send`] but never waits.
    fn try_send(&self, channel: u8, payload: Vec<u8>) -> bool;

    fn is_running(&self) -> bool;
}

/// The set of connected peers.
pub trait Switch: Send + Sync {
    fn broadcast(&self, channel: u8, payload: Vec<u8>);

    /// Disconnects a peer that broke the protocol.
    fn stop_peer_for_error(&self, peer: &PeerId, reason: &str);

    fn mark_peer_as_good(&self, peer: &PeerId);
}

/// A payload received from a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub from: PeerId,
    pub channel: u8,
    pub payload: Vec<u8>,
}

/// One direction of an in-process connection. Both directions share the
/// `running` flag, so stopping either end stops the connection.
pub struct ChannelPeer {
    id: PeerId,
    local_id: PeerId,
    remote_inbox: Sender<Envelope>,
    running: Arc<AtomicBool>,
}

impl ChannelPeer {
    fn envelope(&self, channel: u8, payload: Vec<u8>) -> Envelope {
        Envelope {
            from: self.local_id.clone(),
            channel,
            payload,
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

impl Peer for ChannelPeer {
    fn id(&self) -> &PeerId {
        &self.id
    }

    fn send(&self, channel: u8, payload: Vec<u8>) -> bool {
        if !self.is_running() {
            return false;
        }
        match self
            .remote_inbox
            .send_timeout(self.envelope(channel, payload), SEND_TIMEOUT)
        {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(_)) => {
                warn!("send to {} timed out on channel {channel:#04x}", self.id);
                false
            }
            Err(SendTimeoutError::Disconnected(_)) => {
                self.stop();
                false
            }
        }
    }

    fn try_send(&self, channel: u8, payload: Vec<u8>) -> bool {
        if !self.is_running() {
            return false;
        }
        match self.remote_inbox.try_send(self.envelope(channel, payload)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => false,
            Err(TrySendError::Disconnected(_)) => {
                self.stop();
                false
            }
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

/// In-process [`Switch`]. Every node owns one; [`ChannelSwitch::connect`]
/// links two of them.
pub struct ChannelSwitch {
    local_id: PeerId,
    inbox_tx: Sender<Envelope>,
    inbox_rx: Receiver<Envelope>,
    peers: RwLock<BTreeMap<PeerId, Arc<ChannelPeer>>>,
    good_peers: Mutex<BTreeSet<PeerId>>,
    stopped_peers: Mutex<Vec<(PeerId, String)>>,
}

impl ChannelSwitch {
    pub fn new(local_id: PeerId, inbox_capacity: usize) -> Self {
        let (inbox_tx, inbox_rx) = bounded(inbox_capacity);
        Self {
            local_id,
            inbox_tx,
            inbox_rx,
            peers: RwLock::default(),
            good_peers: Mutex::default(),
            stopped_peers: Mutex::default(),
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Everything peers sent to this node.
    pub fn inbox(&self) -> Receiver<Envelope> {
        self.inbox_rx.clone()
    }

    /// Connects `a` and `b`. Returns `a`'s handle on `b` and `b`'s handle
    /// on `a`.
    pub fn connect(a: &ChannelSwitch, b: &ChannelSwitch) -> (Arc<ChannelPeer>, Arc<ChannelPeer>) {
        let running = Arc::new(AtomicBool::new(true));
        let b_seen_by_a = Arc::new(ChannelPeer {
            id: b.local_id.clone(),
            local_id: a.local_id.clone(),
            remote_inbox: b.inbox_tx.clone(),
            running: running.clone(),
        });
        let a_seen_by_b = Arc::new(ChannelPeer {
            id: a.local_id.clone(),
            local_id: b.local_id.clone(),
            remote_inbox: a.inbox_tx.clone(),
            running,
        });
        a.peers
            .write()
            .insert(b.local_id.clone(), b_seen_by_a.clone());
        b.peers
            .write()
            .insert(a.local_id.clone(), a_seen_by_b.clone());
        (b_seen_by_a, a_seen_by_b)
    }

    pub fn peers(&self) -> Vec<Arc<ChannelPeer>> {
        self.peers
            .read()
            .values()
            .filter(|p| p.is_running())
            .cloned()
            .collect()
    }

    pub fn num_peers(&self) -> usize {
        self.peers.read().values().filter(|p| p.is_running()).count()
    }

    pub fn is_good_peer(&self, peer: &PeerId) -> bool {
        self.good_peers.lock().contains(peer)
    }

    /// Peers stopped for misbehaviour, with the reason.
    pub fn stopped_peers(&self) -> Vec<(PeerId, String)> {
        self.stopped_peers.lock().clone()
    }

    /// Stops every connection.
    pub fn stop(&self) {
        for peer in self.peers.write().values() {
            peer.stop();
        }
    }
}

impl Switch for ChannelSwitch {
    fn broadcast(&self, channel: u8, payload: Vec<u8>) {
        for peer in self.peers() {
            if !peer.send(channel, payload.clone()) {
                debug!("broadcast to {} on {channel:#04x} dropped", peer.id());
            }
        }
    }

    fn stop_peer_for_error(&self, peer: &PeerId, reason: &str) {
        let Some(conn) = self.peers.write().remove(peer) else {
            return;
        };
        warn!("stopping peer {peer}: {reason}");
        conn.stop();
        self.good_peers.lock().remove(peer);
        self.stopped_peers
            .lock()
            .push((peer.clone(), reason.to_string()));
    }

    fn mark_peer_as_good(&self, peer: &PeerId) {
        if self.good_peers.lock().insert(peer.clone()) {
            info!("peer {peer} marked as good");
        }
    }
}
