//! Fixed-size bit array used to track which votes and block parts a node holds.

use {
    rand::Rng,
    serde::{Deserialize, Serialize},
    std::fmt,
};

const WORD_BITS: usize = 64;

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitArray {
    bits: usize,
    words: Vec<u64>,
}

impl BitArray {
    pub fn new(bits: usize) -> Self {
        Self {
            bits,
            words: vec![0; words_for(bits)],
        }
    }

    pub fn size(&self) -> usize {
        self.bits
    }

    /// True when the backing storage matches the declared size and no bit
    /// beyond `size()` is set. Arrays decoded from peers must pass this.
    pub fn is_well_formed(&self) -> bool {
        if self.words.len() != words_for(self.bits) {
            return false;
        }
        let tail = self.bits % WORD_BITS;
        match self.words.last() {
            Some(last) if tail != 0 => last.wrapping_shr(tail as u32) == 0,
            _ => true,
        }
    }

    pub fn get_index(&self, i: usize) -> bool {
        if i >= self.bits {
            return false;
        }
        self.words
            .get(i / WORD_BITS)
            .is_some_and(|w| w & bit_mask(i) != 0)
    }

    /// Returns false if `i` is out of range.
    pub fn set_index(&mut self, i: usize, value: bool) -> bool {
        if i >= self.bits {
            return false;
        }
        let mask = bit_mask(i);
        let Some(word) = self.words.get_mut(i / WORD_BITS) else {
            return false;
        };
        if value {
            *word |= mask;
        } else {
            *word &= !mask;
        }
        true
    }

    /// Union of both arrays, sized to the larger of the two.
    pub fn or(&self, other: &BitArray) -> BitArray {
        let mut out = BitArray::new(self.bits.max(other.bits));
        for (i, word) in out.words.iter_mut().enumerate() {
            *word = self.words.get(i).copied().unwrap_or(0)
                | other.words.get(i).copied().unwrap_or(0);
        }
        out
    }

    /// Bits set in `self` but not in `other`, sized like `self`.
    pub fn sub(&self, other: &BitArray) -> BitArray {
        let mut out = self.clone();
        for (i, word) in out.words.iter_mut().enumerate() {
            *word &= !other.words.get(i).copied().unwrap_or(0);
        }
        out.clear_tail();
        out
    }

    pub fn not(&self) -> BitArray {
        let mut out = self.clone();
        for word in out.words.iter_mut() {
            *word = !*word;
        }
        out.clear_tail();
        out
    }

    /// True when no bit is set.
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn is_full(&self) -> bool {
        self.count_ones() == self.bits
    }

    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn true_indices(&self) -> Vec<usize> {
        (0..self.bits).filter(|i| self.get_index(*i)).collect()
    }

    /// Picks a uniformly random set bit.
    pub fn pick_random(&self) -> Option<usize> {
        let set = self.true_indices();
        if set.is_empty() {
            return None;
        }
        let mut rng = rand::rng();
        Some(set[rng.random_range(0..set.len())])
    }

    /// Overwrites `self` with `other` when both have the same size.
    pub fn update(&mut self, other: &BitArray) {
        if self.bits == other.bits && self.words.len() == other.words.len() {
            self.words.copy_from_slice(&other.words);
        }
    }

    fn clear_tail(&mut self) {
        let tail = self.bits % WORD_BITS;
        if tail != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= bit_mask(tail).wrapping_sub(1);
            }
        }
    }
}

fn words_for(bits: usize) -> usize {
    bits.div_ceil(WORD_BITS)
}

/// Mask of bit `i` within its word.
fn bit_mask(i: usize) -> u64 {
    1u64.wrapping_shl((i % WORD_BITS) as u32)
}

impl fmt::Debug for BitArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BA{{{}:", self.bits)?;
        for i in 0..self.bits {
            f.write_str(if self.get_index(i) { "x" } else { "_" })?;
        }
        f.write_str("}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_indices(size: usize, indices: &[usize]) -> BitArray {
        let mut ba = BitArray::new(size);
        for i in indices {
            assert!(ba.set_index(*i, true));
        }
        ba
    }

    #[test]
    fn test_set_and_get() {
        let mut ba = BitArray::new(70);
        assert!(ba.is_empty());
        assert!(ba.set_index(0, true));
        assert!(ba.set_index(69, true));
        assert!(!ba.set_index(70, true));
        assert!(ba.get_index(0));
        assert!(ba.get_index(69));
        assert!(!ba.get_index(1));
        assert!(!ba.get_index(1_000));
        assert_eq!(ba.count_ones(), 2);
        ba.set_index(0, false);
        assert!(!ba.get_index(0));
    }

    #[test]
    fn test_sub_and_or() {
        let a = from_indices(10, &[1, 3, 5]);
        let b = from_indices(10, &[3, 4]);
        assert_eq!(a.sub(&b).true_indices(), vec![1, 5]);
        assert_eq!(a.or(&b).true_indices(), vec![1, 3, 4, 5]);

        let short = from_indices(4, &[0]);
        assert_eq!(short.or(&a).size(), 10);
        assert_eq!(a.sub(&short).size(), 10);
    }

    #[test]
    fn test_not_clears_tail() {
        let a = from_indices(3, &[1]);
        let n = a.not();
        assert_eq!(n.true_indices(), vec![0, 2]);
        assert!(n.is_well_formed());
    }

    #[test]
    fn test_word_boundaries() {
        for size in [63, 64, 65, 128, 129] {
            let full = BitArray::new(size).not();
            assert_eq!(full.count_ones(), size, "size {size}");
            assert!(full.is_well_formed());
            assert!(full.get_index(size - 1));
            assert!(!full.get_index(size));

            let mut ba = BitArray::new(size);
            assert!(ba.set_index(size - 1, true));
            assert!(ba.set_index(63, true) || size <= 63);
            assert!(ba.is_well_formed());
            assert_eq!(ba.true_indices().last(), Some(&(size - 1)));
        }
    }

    #[test]
    fn test_full() {
        let a = from_indices(3, &[0, 1, 2]);
        assert!(a.is_full());
        assert!(!from_indices(3, &[0, 2]).is_full());
        assert!(BitArray::new(0).is_full());
    }

    #[test]
    fn test_pick_random() {
        assert_eq!(BitArray::new(8).pick_random(), None);
        let a = from_indices(8, &[6]);
        assert_eq!(a.pick_random(), Some(6));
        let b = from_indices(128, &[2, 90]);
        for _ in 0..20 {
            let i = b.pick_random().unwrap();
            assert!(i == 2 || i == 90);
        }
    }

    #[test]
    fn test_update_requires_same_size() {
        let mut a = BitArray::new(5);
        a.update(&from_indices(5, &[4]));
        assert!(a.get_index(4));
        a.update(&from_indices(6, &[0]));
        assert!(!a.get_index(0));
    }

    #[test]
    fn test_malformed_detection() {
        let bad: BitArray = serde_json::from_str(r#"{"bits":3,"words":[255]}"#).unwrap();
        assert!(!bad.is_well_formed());
        let short: BitArray = serde_json::from_str(r#"{"bits":70,"words":[0]}"#).unwrap();
        assert!(!short.is_well_formed());
        assert!(from_indices(70, &[65]).is_well_formed());
    }
}
