use {
    crate::{bit_array::BitArray, block_id::BlockId, error::TypesError},
    serde::{Deserialize, Serialize},
    solana_pubkey::Pubkey,
    solana_signature::Signature,
    std::fmt,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VoteType {
    Prevote,
    Precommit,
}

impl VoteType {
    pub(crate) fn sign_byte(self) -> u8 {
        match self {
            Self::Prevote => 1,
            Self::Precommit => 2,
        }
    }
}

impl fmt::Display for VoteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prevote => f.write_str("Prevote"),
            Self::Precommit => f.write_str("Precommit"),
        }
    }
}

/// A signed prevote or precommit for a block (or nil) at a height and round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub validator_address: Pubkey,
    pub validator_index: u32,
    pub height: u64,
    pub round: i32,
    pub timestamp_ms: u64,
    pub vote_type: VoteType,
    pub block_id: BlockId,
    pub signature: Signature,
}

impl Vote {
    /// Canonical bytes covered by the signature. The validator address and
    /// index are not signed; the verifying key binds the vote to its author.
    pub fn sign_bytes(&self, chain_id: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(chain_id.len().saturating_add(128));
        out.extend_from_slice(&(chain_id.len() as u32).to_le_bytes());
        out.extend_from_slice(chain_id.as_bytes());
        out.push(self.vote_type.sign_byte());
        out.extend_from_slice(&self.height.to_le_bytes());
        out.extend_from_slice(&self.round.to_le_bytes());
        out.extend_from_slice(&self.timestamp_ms.to_le_bytes());
        out.extend_from_slice(self.block_id.hash.as_ref());
        out.extend_from_slice(&self.block_id.parts_header.total.to_le_bytes());
        out.extend_from_slice(self.block_id.parts_header.hash.as_ref());
        out
    }

    pub fn verify(&self, chain_id: &str, pubkey: &Pubkey) -> Result<(), TypesError> {
        if self.validator_address != *pubkey {
            return Err(TypesError::AddressMismatch {
                vote: self.validator_address,
                validator: *pubkey,
            });
        }
        if !self
            .signature
            .verify(pubkey.as_ref(), &self.sign_bytes(chain_id))
        {
            return Err(TypesError::InvalidSignature(*pubkey));
        }
        Ok(())
    }

    pub fn validate_basic(&self) -> Result<(), TypesError> {
        if self.height == 0 {
            return Err(TypesError::InvalidHeight(self.height));
        }
        if self.round < 0 {
            return Err(TypesError::NegativeRound(self.round));
        }
        self.block_id.validate_basic()?;
        if self.signature == Signature::default() {
            return Err(TypesError::MissingSignature);
        }
        Ok(())
    }

    pub fn is_nil(&self) -> bool {
        self.block_id.is_zero()
    }
}

impl fmt::Display for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Vote{{{}:{} {}/{:02} {} {}}}",
            self.validator_index,
            self.validator_address,
            self.height,
            self.round,
            self.vote_type,
            self.block_id,
        )
    }
}

/// Read access shared by live vote sets and stored commits, so gossip can
/// pick votes to send from either.
pub trait VoteSetReader {
    fn height(&self) -> u64;
    fn round(&self) -> i32;
    fn vote_type(&self) -> VoteType;
    fn size(&self) -> usize;
    fn bit_array(&self) -> BitArray;
    fn get_by_index(&self, index: u32) -> Option<&Vote>;
    fn is_commit(&self) -> bool;
}
