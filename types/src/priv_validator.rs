//! Signing identity of a validator.
//!
//! [`KeypairValidator`] remembers the last (height, round, step) it signed and
//! refuses to sign anything at an earlier step, or different data at the same
//! step. Re-signing identical data returns the earlier signature.

use {
    crate::{
        error::TypesError,
        proposal::Proposal,
        vote::{Vote, VoteType},
    },
    log::*,
    solana_keypair::Keypair,
    solana_pubkey::Pubkey,
    solana_signature::Signature,
    solana_signer::Signer,
};

pub trait PrivValidator: Send {
    fn address(&self) -> Pubkey;
    fn sign_vote(&mut self, chain_id: &str, vote: &mut Vote) -> Result<(), TypesError>;
    fn sign_proposal(&mut self, chain_id: &str, proposal: &mut Proposal) -> Result<(), TypesError>;
}

const STEP_PROPOSE: i8 = 1;
const STEP_PREVOTE: i8 = 2;
const STEP_PRECOMMIT: i8 = 3;

fn vote_step(vote_type: VoteType) -> i8 {
    match vote_type {
        VoteType::Prevote => STEP_PREVOTE,
        VoteType::Precommit => STEP_PRECOMMIT,
    }
}

#[derive(Clone, Debug, Default)]
struct LastSignState {
    height: u64,
    round: i32,
    step: i8,
    timestamp_ms: u64,
    sign_bytes: Vec<u8>,
    signature: Signature,
}

enum SignDecision {
    Sign,
    /// Same data already signed: reuse this timestamp and signature.
    Reuse(u64, Signature),
}

impl LastSignState {
    fn check(
        &self,
        height: u64,
        round: i32,
        step: i8,
        sign_bytes_at: impl Fn(u64) -> Vec<u8>,
    ) -> Result<SignDecision, TypesError> {
        if self.step == 0 {
            return Ok(SignDecision::Sign);
        }
        if height < self.height {
            return Err(TypesError::HeightRegression {
                last: self.height,
                requested: height,
            });
        }
        if height > self.height {
            return Ok(SignDecision::Sign);
        }
        if round < self.round {
            return Err(TypesError::RoundRegression {
                height,
                last: self.round,
                requested: round,
            });
        }
        if round > self.round {
            return Ok(SignDecision::Sign);
        }
        if step < self.step {
            return Err(TypesError::StepRegression {
                height,
                round,
                last: self.step,
                requested: step,
            });
        }
        if step > self.step {
            return Ok(SignDecision::Sign);
        }
        // Same HRS: only identical data (ignoring the timestamp) may be re-signed.
        if sign_bytes_at(self.timestamp_ms) == self.sign_bytes {
            Ok(SignDecision::Reuse(self.timestamp_ms, self.signature))
        } else {
            Err(TypesError::ConflictingSign {
                height,
                round,
                step,
            })
        }
    }

    fn record(
        &mut self,
        height: u64,
        round: i32,
        step: i8,
        timestamp_ms: u64,
        sign_bytes: Vec<u8>,
        signature: Signature,
    ) {
        *self = Self {
            height,
            round,
            step,
            timestamp_ms,
            sign_bytes,
            signature,
        };
    }
}

/// A validator signing with an in-memory ed25519 keypair.
pub struct KeypairValidator {
    keypair: Keypair,
    last_sign_state: LastSignState,
}

impl KeypairValidator {
    pub fn new(keypair: Keypair) -> Self {
        Self {
            keypair,
            last_sign_state: LastSignState::default(),
        }
    }

    #[cfg(any(test, feature = "dev-context-only-utils"))]
    pub fn new_random() -> Self {
        Self::new(Keypair::new())
    }
}

impl PrivValidator for KeypairValidator {
    fn address(&self) -> Pubkey {
        self.keypair.pubkey()
    }

    fn sign_vote(&mut self, chain_id: &str, vote: &mut Vote) -> Result<(), TypesError> {
        let step = vote_step(vote.vote_type);
        let decision = self.last_sign_state.check(vote.height, vote.round, step, |ts| {
            let mut probe = vote.clone();
            probe.timestamp_ms = ts;
            probe.sign_bytes(chain_id)
        })?;
        match decision {
            SignDecision::Reuse(ts, signature) => {
                debug!("re-using earlier signature for {}/{} step {step}", vote.height, vote.round);
                vote.timestamp_ms = ts;
                vote.signature = signature;
            }
            SignDecision::Sign => {
                let bytes = vote.sign_bytes(chain_id);
                let signature = self.keypair.sign_message(&bytes);
                self.last_sign_state
                    .record(vote.height, vote.round, step, vote.timestamp_ms, bytes, signature);
                vote.signature = signature;
            }
        }
        Ok(())
    }

    fn sign_proposal(&mut self, chain_id: &str, proposal: &mut Proposal) -> Result<(), TypesError> {
        let decision =
            self.last_sign_state
                .check(proposal.height, proposal.round, STEP_PROPOSE, |ts| {
                    let mut probe = proposal.clone();
                    probe.timestamp_ms = ts;
                    probe.sign_bytes(chain_id)
                })?;
        match decision {
            SignDecision::Reuse(ts, signature) => {
                proposal.timestamp_ms = ts;
                proposal.signature = signature;
            }
            SignDecision::Sign => {
                let bytes = proposal.sign_bytes(chain_id);
                let signature = self.keypair.sign_message(&bytes);
                self.last_sign_state.record(
                    proposal.height,
                    proposal.round,
                    STEP_PROPOSE,
                    proposal.timestamp_ms,
                    bytes,
                    signature,
                );
                proposal.signature = signature;
            }
        }
        Ok(())
    }
}
