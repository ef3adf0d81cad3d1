//! Timeout ticker for the consensus state machine.
//!
//! Only one timeout is live at a time. A newly scheduled timeout replaces the
//! live one only if it is for a later (height, round, step); anything older
//! is ignored. A fired timeout is delivered on the tock channel and consumed
//! by the same loop that handles consensus messages.

use {
    crate::round_state::RoundStep,
    crossbeam_channel::{Receiver, RecvTimeoutError, Sender},
    log::*,
    std::{
        cmp::Ordering,
        io,
        thread::{self, Builder, JoinHandle},
        time::{Duration, Instant},
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeoutInfo {
    pub duration: Duration,
    pub height: u64,
    pub round: i32,
    pub step: RoundStep,
}

impl TimeoutInfo {
    fn hrs(&self) -> (u64, i32, RoundStep) {
        (self.height, self.round, self.step)
    }
}

/// Whether `new` supersedes the live timeout `current`.
pub fn should_replace(current: Option<&TimeoutInfo>, new: &TimeoutInfo) -> bool {
    let Some(current) = current else {
        return true;
    };
    new.hrs().cmp(&current.hrs()) == Ordering::Greater
}

pub struct TimeoutTicker {
    thread_hdl: JoinHandle<()>,
}

impl TimeoutTicker {
    /// Runs until `schedule_rx` is disconnected or nobody listens on
    /// `tock_tx` anymore.
    pub fn start(
        schedule_rx: Receiver<TimeoutInfo>,
        tock_tx: Sender<TimeoutInfo>,
    ) -> io::Result<Self> {
        let thread_hdl = Builder::new()
            .name("kstlTimeoutTick".to_string())
            .spawn(move || Self::run(schedule_rx, tock_tx))?;
        Ok(Self { thread_hdl })
    }

    fn run(schedule_rx: Receiver<TimeoutInfo>, tock_tx: Sender<TimeoutInfo>) {
        // The last scheduled timeout stays the reference after it fires.
        let mut current: Option<TimeoutInfo> = None;
        let mut deadline: Option<Instant> = None;
        loop {
            let received = match deadline {
                Some(deadline) => {
                    schedule_rx.recv_timeout(deadline.saturating_duration_since(Instant::now()))
                }
                None => schedule_rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match received {
                Ok(ti) => {
                    if should_replace(current.as_ref(), &ti) {
                        trace!(
                            "scheduled timeout {:?} for {}/{}/{}",
                            ti.duration,
                            ti.height,
                            ti.round,
                            ti.step
                        );
                        current = Some(ti);
                        deadline = Instant::now().checked_add(ti.duration);
                    } else {
                        trace!(
                            "ignoring stale timeout for {}/{}/{}",
                            ti.height,
                            ti.round,
                            ti.step
                        );
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    deadline = None;
                    if let Some(ti) = current {
                        debug!("timed out {}/{}/{}", ti.height, ti.round, ti.step);
                        if tock_tx.send(ti).is_err() {
                            break;
                        }
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("timeout ticker exiting");
    }

    pub fn join(self) -> thread::Result<()> {
        self.thread_hdl.join()
    }
}
