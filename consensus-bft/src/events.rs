//! Events published by the consensus state machine.
//!
//! Each subscriber gets its own bounded queue. Publishing never blocks: a
//! subscriber whose queue is full misses the event and the publisher gets
//! [`EventBusError::Full`] back; a subscriber that hung up is removed.

use {
    crate::round_state::{RoundStepInfo, ValidBlockInfo},
    crossbeam_channel::{bounded, Receiver, Sender, TrySendError},
    kestrel_types::{BlockId, FatalError, Vote},
    log::*,
    parking_lot::Mutex,
    thiserror::Error,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsensusEvent {
    NewRoundStep(RoundStepInfo),
    NewRound(RoundStepInfo),
    CompleteProposal { height: u64, round: i32, block_id: BlockId },
    Polka { height: u64, round: i32 },
    Lock { height: u64, round: i32 },
    Relock { height: u64, round: i32 },
    Unlock { height: u64, round: i32 },
    TimeoutPropose { height: u64, round: i32 },
    TimeoutWait { height: u64, round: i32 },
    ValidBlock(ValidBlockInfo),
    /// A vote was added to the height's vote sets.
    Vote(Vote),
    NewBlock { height: u64, block_id: BlockId, num_txs: u64 },
    Halted(FatalError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventBusError {
    #[error("event queue of subscriber {0} is full")]
    Full(String),
}

struct Subscriber {
    name: String,
    sender: Sender<ConsensusEvent>,
}

pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, name: &str, capacity: usize) -> Receiver<ConsensusEvent> {
        let (sender, receiver) = bounded(capacity);
        self.subscribers.lock().push(Subscriber {
            name: name.to_string(),
            sender,
        });
        receiver
    }

    pub fn num_subscribers(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Delivers `event` to every subscriber with room for it. Reports the
    /// first subscriber that had to be skipped.
    pub fn publish(&self, event: ConsensusEvent) -> Result<(), EventBusError> {
        let mut result = Ok(());
        self.subscribers
            .lock()
            .retain(|sub| match sub.sender.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    if result.is_ok() {
                        result = Err(EventBusError::Full(sub.name.clone()));
                    }
                    true
                }
                Err(TrySendError::Disconnected(_)) => {
                    debug!("event subscriber {} went away", sub.name);
                    false
                }
            });
        result
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
