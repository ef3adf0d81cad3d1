use {
    crate::{
        block_id::{BlockId, PartSetHeader},
        error::TypesError,
    },
    serde::{Deserialize, Serialize},
    solana_pubkey::Pubkey,
    solana_signature::Signature,
    std::fmt,
};

/// A proposer's signed claim that the block with `block_parts_header` should
/// be decided at `height`/`round`.
///
/// `pol_round` is -1 unless the proposer is re-proposing a block that got a
/// proof-of-lock (+2/3 prevotes) in an earlier round of this height.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub height: u64,
    pub round: i32,
    pub timestamp_ms: u64,
    pub block_parts_header: PartSetHeader,
    pub pol_round: i32,
    pub pol_block_id: BlockId,
    pub signature: Signature,
}

impl Proposal {
    pub fn new(
        height: u64,
        round: i32,
        timestamp_ms: u64,
        block_parts_header: PartSetHeader,
        pol_round: i32,
        pol_block_id: BlockId,
    ) -> Self {
        Self {
            height,
            round,
            timestamp_ms,
            block_parts_header,
            pol_round,
            pol_block_id,
            signature: Signature::default(),
        }
    }

    pub fn sign_bytes(&self, chain_id: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(chain_id.len().saturating_add(160));
        out.extend_from_slice(&(chain_id.len() as u32).to_le_bytes());
        out.extend_from_slice(chain_id.as_bytes());
        out.push(0);
        out.extend_from_slice(&self.height.to_le_bytes());
        out.extend_from_slice(&self.round.to_le_bytes());
        out.extend_from_slice(&self.timestamp_ms.to_le_bytes());
        out.extend_from_slice(&self.block_parts_header.total.to_le_bytes());
        out.extend_from_slice(self.block_parts_header.hash.as_ref());
        out.extend_from_slice(&self.pol_round.to_le_bytes());
        out.extend_from_slice(self.pol_block_id.hash.as_ref());
        out.extend_from_slice(&self.pol_block_id.parts_header.total.to_le_bytes());
        out.extend_from_slice(self.pol_block_id.parts_header.hash.as_ref());
        out
    }

    pub fn verify(&self, chain_id: &str, proposer: &Pubkey) -> Result<(), TypesError> {
        if self
            .signature
            .verify(proposer.as_ref(), &self.sign_bytes(chain_id))
        {
            Ok(())
        } else {
            Err(TypesError::InvalidSignature(*proposer))
        }
    }

    pub fn validate_basic(&self) -> Result<(), TypesError> {
        if self.height == 0 {
            return Err(TypesError::InvalidHeight(self.height));
        }
        if self.round < 0 {
            return Err(TypesError::NegativeRound(self.round));
        }
        if self.pol_round < -1 || (self.pol_round >= 0 && self.pol_round >= self.round) {
            return Err(TypesError::InvalidPolRound {
                round: self.round,
                pol_round: self.pol_round,
            });
        }
        if self.block_parts_header.total == 0 {
            return Err(TypesError::InvalidBlockId("proposal without block parts"));
        }
        self.pol_block_id.validate_basic()?;
        if self.signature == Signature::default() {
            return Err(TypesError::MissingSignature);
        }
        Ok(())
    }
}

impl fmt::Display for Proposal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Proposal{{{}/{} {} ({},{})}}",
            self.height, self.round, self.block_parts_header, self.pol_round, self.pol_block_id,
        )
    }
}
