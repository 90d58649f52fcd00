//! Content identifiers for announced blocks
//!
//! CIDv1 derivation over sha2-256 with the `raw` codec, plus the
//! bytes/string parse helpers the queue and tracker persist through.

use cid::Cid;
use multihash::Multihash;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// sha2-256 multihash code
/// See: https://github.com/multiformats/multicodec/blob/master/table.csv
const SHA256_CODE: u64 = 0x12;

/// Raw binary block codec
const RAW_CODEC: u64 = 0x55;

#[derive(Debug, Error)]
pub enum ContentIdError {
    #[error("Invalid CID: {0}")]
    InvalidCid(String),

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Multihash error: {0}")]
    Multihash(String),
}

/// Compute the sha2-256 digest of a block's data
pub fn block_digest(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// Compute the CID for a raw block
pub fn block_cid(data: &[u8]) -> Result<Cid, ContentIdError> {
    let digest = block_digest(data);

    let mh = Multihash::wrap(SHA256_CODE, &digest)
        .map_err(|e| ContentIdError::Multihash(format!("Failed to create multihash: {}", e)))?;

    Ok(Cid::new_v1(RAW_CODEC, mh))
}

/// Verify data against an expected CID
pub fn verify_block(data: &[u8], expected_cid: &Cid) -> Result<(), ContentIdError> {
    let computed_cid = block_cid(data)?;

    if &computed_cid != expected_cid {
        return Err(ContentIdError::HashMismatch {
            expected: expected_cid.to_string(),
            actual: computed_cid.to_string(),
        });
    }

    Ok(())
}

/// Parse a CID from its binary encoding
pub fn parse_cid(bytes: &[u8]) -> Result<Cid, ContentIdError> {
    Cid::try_from(bytes).map_err(|e| ContentIdError::InvalidCid(e.to_string()))
}

/// Parse a CID from its string form
pub fn parse_cid_str(s: &str) -> Result<Cid, ContentIdError> {
    s.parse()
        .map_err(|e| ContentIdError::InvalidCid(format!("{}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_digest() {
        let data = b"hello world";
        let digest = block_digest(data);

        // sha2-256 produces 32-byte digests
        assert_eq!(digest.len(), 32);

        // Same data should produce the same digest
        let digest2 = block_digest(data);
        assert_eq!(digest, digest2);

        // Different data should produce a different digest
        let digest3 = block_digest(b"goodbye world");
        assert_ne!(digest, digest3);
    }

    #[test]
    fn test_block_cid() {
        let data = b"hello world";
        let cid = block_cid(data).unwrap();

        assert_eq!(cid.version(), cid::Version::V1);
        assert_eq!(cid.codec(), RAW_CODEC);

        // Same data should produce the same CID
        let cid2 = block_cid(data).unwrap();
        assert_eq!(cid, cid2);
    }

    #[test]
    fn test_verify_block() {
        let data = b"hello world";
        let cid = block_cid(data).unwrap();

        assert!(verify_block(data, &cid).is_ok());

        let result = verify_block(b"goodbye world", &cid);
        match result {
            Err(ContentIdError::HashMismatch { .. }) => {}
            _ => panic!("Expected HashMismatch error"),
        }
    }

    #[test]
    fn test_parse_cid_roundtrip() {
        let data = b"hello world";
        let cid = block_cid(data).unwrap();

        let cid_bytes = cid.to_bytes();
        let parsed_cid = parse_cid(&cid_bytes).unwrap();

        assert_eq!(cid, parsed_cid);
    }

    #[test]
    fn test_parse_cid_rejects_garbage() {
        let result = parse_cid(b"not a cid");
        assert!(matches!(result, Err(ContentIdError::InvalidCid(_))));
    }

    #[test]
    fn test_parse_cid_str_roundtrip() {
        let data = b"hello world";
        let cid = block_cid(data).unwrap();

        let cid_str = cid.to_string();
        let parsed_cid = parse_cid_str(&cid_str).unwrap();

        assert_eq!(cid, parsed_cid);
    }
}
