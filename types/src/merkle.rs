//! Binary merkle tree over byte slices, with inclusion proofs.
//!
//! Leaves and inner nodes are domain separated (`0x00` / `0x01` prefix) so a
//! leaf can never be passed off as an inner node. For `n > 1` items the tree
//! splits at the largest power of two strictly below `n`.

use {
    serde::{Deserialize, Serialize},
    solana_hash::Hash,
    solana_sha256_hasher::hashv,
};

const LEAF_PREFIX: &[u8] = &[0];
const INNER_PREFIX: &[u8] = &[1];

pub fn leaf_hash(leaf: &[u8]) -> Hash {
    hashv(&[LEAF_PREFIX, leaf])
}

fn inner_hash(left: &Hash, right: &Hash) -> Hash {
    hashv(&[INNER_PREFIX, left.as_ref(), right.as_ref()])
}

fn split_point(n: usize) -> usize {
    let mut k: usize = 1;
    while k.saturating_mul(2) < n {
        k = k.saturating_mul(2);
    }
    k
}

fn root_of(leaves: &[Hash]) -> Hash {
    match leaves.len() {
        0 => Hash::default(),
        1 => leaves[0],
        n => {
            let k = split_point(n);
            inner_hash(&root_of(&leaves[..k]), &root_of(&leaves[k..]))
        }
    }
}

fn aunts_of(leaves: &[Hash], index: usize) -> Vec<Hash> {
    if leaves.len() <= 1 {
        return Vec::new();
    }
    let k = split_point(leaves.len());
    if index < k {
        let mut aunts = aunts_of(&leaves[..k], index);
        aunts.push(root_of(&leaves[k..]));
        aunts
    } else {
        let mut aunts = aunts_of(&leaves[k..], index.saturating_sub(k));
        aunts.push(root_of(&leaves[..k]));
        aunts
    }
}

/// Merkle root of `items`. The empty list hashes to the default hash.
pub fn hash_from_byte_slices<T: AsRef<[u8]>>(items: &[T]) -> Hash {
    let leaves: Vec<Hash> = items.iter().map(|i| leaf_hash(i.as_ref())).collect();
    root_of(&leaves)
}

/// Root plus one inclusion proof per item.
pub fn proofs_from_byte_slices<T: AsRef<[u8]>>(items: &[T]) -> (Hash, Vec<MerkleProof>) {
    let leaves: Vec<Hash> = items.iter().map(|i| leaf_hash(i.as_ref())).collect();
    let total = leaves.len() as u32;
    let proofs = leaves
        .iter()
        .enumerate()
        .map(|(index, leaf)| MerkleProof {
            total,
            index: index as u32,
            leaf_hash: *leaf,
            aunts: aunts_of(&leaves, index),
        })
        .collect();
    (root_of(&leaves), proofs)
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub total: u32,
    pub index: u32,
    pub leaf_hash: Hash,
    pub aunts: Vec<Hash>,
}

impl MerkleProof {
    /// Checks that `leaf` sits at `self.index` in the tree with `root`.
    pub fn verify(&self, root: &Hash, leaf: &[u8]) -> bool {
        if leaf_hash(leaf) != self.leaf_hash {
            return false;
        }
        self.compute_root().as_ref() == Some(root)
    }

    pub fn compute_root(&self) -> Option<Hash> {
        compute_from_aunts(self.index as usize, self.total as usize, self.leaf_hash, &self.aunts)
    }
}

fn compute_from_aunts(index: usize, total: usize, leaf: Hash, aunts: &[Hash]) -> Option<Hash> {
    if index >= total {
        return None;
    }
    match total {
        0 => None,
        1 => aunts.is_empty().then_some(leaf),
        _ => {
            let (last, rest) = aunts.split_last()?;
            let k = split_point(total);
            if index < k {
                let left = compute_from_aunts(index, k, leaf, rest)?;
                Some(inner_hash(&left, last))
            } else {
                let (sub_index, sub_total) = (index.saturating_sub(k), total.saturating_sub(k));
                let right = compute_from_aunts(sub_index, sub_total, leaf, rest)?;
                Some(inner_hash(last, &right))
            }
        }
    }
}
