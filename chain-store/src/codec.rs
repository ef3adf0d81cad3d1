//! Encoding of stored values. The block store only relies on round-trip
//! fidelity, never on the byte layout.

use {
    crate::error::Result,
    serde::{de::DeserializeOwned, Serialize},
};

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use {super::*, crate::error::StoreError, assert_matches::assert_matches, kestrel_types::Commit};

    #[test]
    fn test_decode_garbage_is_an_error() {
        assert_matches!(decode::<Commit>(&[0xff; 3]), Err(StoreError::Codec(_)));
    }

    #[test]
    fn test_commit_survives_encoding() {
        let commit = Commit::empty();
        let bytes = encode(&commit).unwrap();
        assert_eq!(decode::<Commit>(&bytes).unwrap(), commit);
    }
}
