//! Blocks are gossiped as fixed-size parts, each carrying a merkle proof
//! against the part set hash in the block id.

use {
    crate::{
        bit_array::BitArray,
        block_id::PartSetHeader,
        error::TypesError,
        merkle::{proofs_from_byte_slices, MerkleProof},
    },
    serde::{Deserialize, Serialize},
    solana_hash::Hash,
};

/// Default size of a block part in bytes.
pub const BLOCK_PART_SIZE_BYTES: usize = 65_536;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    pub index: u32,
    pub bytes: Vec<u8>,
    pub proof: MerkleProof,
}

impl Part {
    pub fn validate_basic(&self) -> Result<(), TypesError> {
        if self.bytes.len() > BLOCK_PART_SIZE_BYTES {
            return Err(TypesError::PartTooLarge {
                size: self.bytes.len(),
                max: BLOCK_PART_SIZE_BYTES,
            });
        }
        if self.proof.index != self.index || self.index >= self.proof.total {
            return Err(TypesError::PartIndexOutOfRange {
                index: self.index,
                total: self.proof.total,
            });
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct PartSet {
    total: u32,
    hash: Hash,
    parts: Vec<Option<Part>>,
    parts_bit_array: BitArray,
    count: u32,
    byte_size: usize,
}

impl PartSet {
    /// Splits `data` into `part_size` chunks and builds the proofs.
    pub fn new_from_data(data: &[u8], part_size: usize) -> Self {
        let part_size = part_size.max(1);
        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![data]
        } else {
            data.chunks(part_size).collect()
        };
        let (hash, proofs) = proofs_from_byte_slices(&chunks);
        let total = chunks.len() as u32;
        let mut parts_bit_array = BitArray::new(chunks.len());
        let parts = chunks
            .into_iter()
            .zip(proofs)
            .enumerate()
            .map(|(i, (chunk, proof))| {
                parts_bit_array.set_index(i, true);
                Some(Part {
                    index: i as u32,
                    bytes: chunk.to_vec(),
                    proof,
                })
            })
            .collect();
        Self {
            total,
            hash,
            parts,
            parts_bit_array,
            count: total,
            byte_size: data.len(),
        }
    }

    /// An empty part set expecting the parts described by `header`.
    pub fn new_from_header(header: &PartSetHeader) -> Self {
        Self {
            total: header.total,
            hash: header.hash,
            parts: vec![None; header.total as usize],
            parts_bit_array: BitArray::new(header.total as usize),
            count: 0,
            byte_size: 0,
        }
    }

    pub fn header(&self) -> PartSetHeader {
        PartSetHeader {
            total: self.total,
            hash: self.hash,
        }
    }

    pub fn has_header(&self, header: &PartSetHeader) -> bool {
        self.header() == *header
    }

    pub fn bit_array(&self) -> BitArray {
        self.parts_bit_array.clone()
    }

    pub fn hash(&self) -> Hash {
        self.hash
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    pub fn is_complete(&self) -> bool {
        self.count == self.total
    }

    pub fn get_part(&self, index: u32) -> Option<&Part> {
        self.parts.get(index as usize).and_then(Option::as_ref)
    }

    /// Adds a part after checking its proof. Returns `Ok(false)` for a part
    /// that is already present.
    pub fn add_part(&mut self, part: Part) -> Result<bool, TypesError> {
        let Some(slot) = self.parts.get_mut(part.index as usize) else {
            return Err(TypesError::PartIndexOutOfRange {
                index: part.index,
                total: self.total,
            });
        };
        if slot.is_some() {
            return Ok(false);
        }
        if part.proof.index != part.index
            || part.proof.total != self.total
            || !part.proof.verify(&self.hash, &part.bytes)
        {
            return Err(TypesError::InvalidPartProof(part.index));
        }
        self.parts_bit_array.set_index(part.index as usize, true);
        self.count = self.count.saturating_add(1);
        self.byte_size = self.byte_size.saturating_add(part.bytes.len());
        *slot = Some(part);
        Ok(true)
    }

    /// Concatenated part bytes, once every part is present.
    pub fn assemble(&self) -> Option<Vec<u8>> {
        if !self.is_complete() {
            return None;
        }
        let mut out = Vec::with_capacity(self.byte_size);
        for part in self.parts.iter().flatten() {
            out.extend_from_slice(&part.bytes);
        }
        Some(out)
    }
}
