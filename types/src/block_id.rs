use {
    crate::error::TypesError,
    serde::{Deserialize, Serialize},
    solana_hash::Hash,
    std::fmt,
};

/// Identifies the set of parts a block was split into for gossip.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartSetHeader {
    pub total: u32,
    pub hash: Hash,
}

impl PartSetHeader {
    pub fn is_zero(&self) -> bool {
        self.total == 0 && self.hash == Hash::default()
    }
}

impl fmt::Display for PartSetHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.total, self.hash)
    }
}

/// A block hash together with the header of its part set.
///
/// The zero value is the "nil" block id that nil votes carry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockId {
    pub hash: Hash,
    pub parts_header: PartSetHeader,
}

impl BlockId {
    pub fn new(hash: Hash, parts_header: PartSetHeader) -> Self {
        Self { hash, parts_header }
    }

    /// True for the nil block id.
    pub fn is_zero(&self) -> bool {
        self.hash == Hash::default() && self.parts_header.is_zero()
    }

    /// True when both the hash and part set header are present.
    pub fn is_complete(&self) -> bool {
        self.hash != Hash::default() && self.parts_header.total > 0
    }

    /// A block id is either nil or fully specified.
    pub fn validate_basic(&self) -> Result<(), TypesError> {
        if self.is_zero() || self.is_complete() {
            Ok(())
        } else if self.hash == Hash::default() {
            Err(TypesError::InvalidBlockId("part set header without block hash"))
        } else {
            Err(TypesError::InvalidBlockId("block hash without part set header"))
        }
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            f.write_str("nil")
        } else {
            write!(f, "{}:{}", self.hash, self.parts_header)
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, assert_matches::assert_matches};

    #[test]
    fn test_nil_block_id() {
        let nil = BlockId::default();
        assert!(nil.is_zero());
        assert!(!nil.is_complete());
        assert!(nil.validate_basic().is_ok());
        assert_eq!(nil.to_string(), "nil");
    }

    #[test]
    fn test_complete_block_id() {
        let id = BlockId::new(
            Hash::new_unique(),
            PartSetHeader {
                total: 2,
                hash: Hash::new_unique(),
            },
        );
        assert!(!id.is_zero());
        assert!(id.is_complete());
        assert!(id.validate_basic().is_ok());
    }

    #[test]
    fn test_half_specified_block_id_is_invalid() {
        let no_parts = BlockId::new(Hash::new_unique(), PartSetHeader::default());
        assert_matches!(no_parts.validate_basic(), Err(TypesError::InvalidBlockId(_)));

        let no_hash = BlockId::new(
            Hash::default(),
            PartSetHeader {
                total: 1,
                hash: Hash::new_unique(),
            },
        );
        assert_matches!(no_hash.validate_basic(), Err(TypesError::InvalidBlockId(_)));
    }
}
