//! Key schema of the block store.

pub const STORE_HEIGHT_KEY: &[u8] = b"blockStore";
pub const CHAIN_STATE_KEY: &[u8] = b"chainState";

pub fn block_meta_key(height: u64) -> Vec<u8> {
    format!("H:{height}").into_bytes()
}

pub fn block_part_key(height: u64, index: u32) -> Vec<u8> {
    format!("P:{height}:{index}").into_bytes()
}

/// Commit for `height`, as carried in block `height + 1`.
pub fn block_commit_key(height: u64) -> Vec<u8> {
    format!("C:{height}").into_bytes()
}

/// Commit this node observed locally for `height`.
pub fn seen_commit_key(height: u64) -> Vec<u8> {
    format!("SC:{height}").into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_distinct() {
        let keys = [
            block_meta_key(12),
            block_part_key(1, 2),
            block_part_key(12, 0),
            block_commit_key(12),
            seen_commit_key(12),
        ];
        for (i, a) in keys.iter().enumerate() {
            for b in keys.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }
}
