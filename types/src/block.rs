use {
    crate::{
        bit_array::BitArray,
        block_id::BlockId,
        error::TypesError,
        merkle::hash_from_byte_slices,
        part_set::PartSet,
        vote::{Vote, VoteSetReader, VoteType},
    },
    serde::{Deserialize, Serialize},
    solana_hash::Hash,
    solana_pubkey::Pubkey,
    solana_sha256_hasher::hashv,
};

/// An opaque transaction as far as consensus is concerned. `nonce` orders the
/// transactions of one sender.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub sender: Pubkey,
    pub nonce: u64,
    pub payload: Vec<u8>,
}

impl Transaction {
    pub fn hash(&self) -> Hash {
        hashv(&[
            self.sender.as_ref(),
            &self.nonce.to_le_bytes(),
            &self.payload,
        ])
    }

    /// Approximate encoded size, used when packing blocks.
    pub fn size(&self) -> usize {
        self.payload.len().saturating_add(40)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub chain_id: String,
    pub height: u64,
    pub time_ms: u64,
    pub num_txs: u64,
    pub total_txs: u64,
    pub last_block_id: BlockId,
    pub last_commit_hash: Hash,
    pub data_hash: Hash,
    pub validators_hash: Hash,
    pub proposer_address: Pubkey,
    /// State root after executing this block's transactions.
    pub state_root: Hash,
}

impl Header {
    pub fn hash(&self) -> Hash {
        hashv(&[
            &(self.chain_id.len() as u32).to_le_bytes(),
            self.chain_id.as_bytes(),
            &self.height.to_le_bytes(),
            &self.time_ms.to_le_bytes(),
            &self.num_txs.to_le_bytes(),
            &self.total_txs.to_le_bytes(),
            self.last_block_id.hash.as_ref(),
            &self.last_block_id.parts_header.total.to_le_bytes(),
            self.last_block_id.parts_header.hash.as_ref(),
            self.last_commit_hash.as_ref(),
            self.data_hash.as_ref(),
            self.validators_hash.as_ref(),
            self.proposer_address.as_ref(),
            self.state_root.as_ref(),
        ])
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: Header,
    pub txs: Vec<Transaction>,
    /// The +2/3 precommits for the previous block.
    pub last_commit: Commit,
}

impl Block {
    /// Assembles a block, filling in the header fields derived from the body.
    pub fn new(mut header: Header, txs: Vec<Transaction>, last_commit: Commit) -> Self {
        header.num_txs = txs.len() as u64;
        header.data_hash = data_hash(&txs);
        header.last_commit_hash = last_commit.hash();
        Self {
            header,
            txs,
            last_commit,
        }
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn hashes_to(&self, hash: &Hash) -> bool {
        *hash != Hash::default() && self.hash() == *hash
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TypesError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TypesError> {
        Ok(bincode::deserialize(bytes)?)
    }

    pub fn make_part_set(&self, part_size: usize) -> Result<PartSet, TypesError> {
        Ok(PartSet::new_from_data(&self.to_bytes()?, part_size))
    }

    /// Checks that the header agrees with the body. Validity against chain
    /// state is the executor's job.
    pub fn validate_basic(&self) -> Result<(), TypesError> {
        if self.header.height == 0 {
            return Err(TypesError::InvalidHeight(0));
        }
        if self.header.num_txs != self.txs.len() as u64 {
            return Err(TypesError::TxCountMismatch {
                declared: self.header.num_txs,
                actual: self.txs.len() as u64,
            });
        }
        let computed = data_hash(&self.txs);
        if computed != self.header.data_hash {
            return Err(TypesError::DataHashMismatch {
                header: self.header.data_hash,
                computed,
            });
        }
        self.last_commit.validate_basic()?;
        let computed = self.last_commit.hash();
        if computed != self.header.last_commit_hash {
            return Err(TypesError::LastCommitHashMismatch {
                header: self.header.last_commit_hash,
                computed,
            });
        }
        self.header.last_block_id.validate_basic()
    }
}

pub fn data_hash(txs: &[Transaction]) -> Hash {
    let hashes: Vec<Hash> = txs.iter().map(Transaction::hash).collect();
    hash_from_byte_slices(&hashes)
}

/// The precommits that committed a block, indexed by validator index. Only
/// precommits for `block_id` are kept.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub block_id: BlockId,
    pub precommits: Vec<Option<Vote>>,
}

impl Commit {
    pub fn new(block_id: BlockId, precommits: Vec<Option<Vote>>) -> Self {
        Self {
            block_id,
            precommits,
        }
    }

    /// The last commit carried by the first block of the chain.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.precommits.iter().all(Option::is_none)
    }

    fn first_precommit(&self) -> Option<&Vote> {
        self.precommits.iter().flatten().next()
    }

    pub fn hash(&self) -> Hash {
        let items: Vec<Vec<u8>> = self
            .precommits
            .iter()
            .map(|p| match p {
                Some(vote) => {
                    let mut bytes = vote.sign_bytes("");
                    bytes.extend_from_slice(vote.validator_address.as_ref());
                    bytes.extend_from_slice(vote.signature.as_ref());
                    bytes
                }
                None => Vec::new(),
            })
            .collect();
        hash_from_byte_slices(&items)
    }

    pub fn validate_basic(&self) -> Result<(), TypesError> {
        let Some(first) = self.first_precommit() else {
            return if self.block_id.is_zero() {
                Ok(())
            } else {
                Err(TypesError::InvalidCommit("block id without precommits".into()))
            };
        };
        if self.block_id.is_zero() {
            return Err(TypesError::InvalidCommit("precommits for nil block".into()));
        }
        for (index, vote) in self.precommits.iter().enumerate() {
            let Some(vote) = vote else { continue };
            if vote.vote_type != VoteType::Precommit {
                return Err(TypesError::InvalidCommit(format!(
                    "vote at index {index} is a {}",
                    vote.vote_type
                )));
            }
            if vote.height != first.height || vote.round != first.round {
                return Err(TypesError::InvalidCommit(format!(
                    "vote at index {index} is for {}/{}, expected {}/{}",
                    vote.height, vote.round, first.height, first.round
                )));
            }
            if vote.validator_index as usize != index {
                return Err(TypesError::InvalidCommit(format!(
                    "vote at index {index} claims index {}",
                    vote.validator_index
                )));
            }
            if vote.block_id != self.block_id {
                return Err(TypesError::InvalidCommit(format!(
                    "vote at index {index} is for another block"
                )));
            }
        }
        Ok(())
    }
}

impl VoteSetReader for Commit {
    fn height(&self) -> u64 {
        self.first_precommit().map_or(0, |v| v.height)
    }

    fn round(&self) -> i32 {
        self.first_precommit().map_or(-1, |v| v.round)
    }

    fn vote_type(&self) -> VoteType {
        VoteType::Precommit
    }

    fn size(&self) -> usize {
        self.precommits.len()
    }

    fn bit_array(&self) -> BitArray {
        let mut bits = BitArray::new(self.precommits.len());
        for (i, p) in self.precommits.iter().enumerate() {
            bits.set_index(i, p.is_some());
        }
        bits
    }

    fn get_by_index(&self, index: u32) -> Option<&Vote> {
        self.precommits.get(index as usize).and_then(Option::as_ref)
    }

    fn is_commit(&self) -> bool {
        !self.block_id.is_zero()
    }
}

/// Header and id of a stored block, readable without loading its parts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    pub block_id: BlockId,
    pub header: Header,
}
