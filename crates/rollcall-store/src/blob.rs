//! Embedding blob: `RCEB` magic, SHA-256 of the payload, bincode payload.

use crate::store::StoreError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;

pub const BLOB_FILE: &str = "face_encodings.bin";
pub const MAGIC: &[u8; 4] = b"RCEB";
pub const BLOB_VERSION: u32 = 1;

const DIGEST_LEN: usize = 32;
const HEADER_LEN: usize = MAGIC.len() + DIGEST_LEN;

/// Person id → embeddings in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingBlob {
    pub version: u32,
    pub entries: BTreeMap<u64, Vec<Vec<f32>>>,
}

impl EmbeddingBlob {
    pub fn new() -> Self {
        Self {
            version: BLOB_VERSION,
            entries: BTreeMap::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        let payload = bincode::serialize(self)?;
        let digest = Sha256::digest(&payload);
        let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&digest);
        out.extend_from_slice(&payload);
        Ok(out)
    }

    pub fn decode(bytes: &[u8], path: &Path) -> Result<Self, StoreError> {
        let corrupt = |reason: String| StoreError::CorruptData {
            path: path.to_path_buf(),
            reason,
        };

        if bytes.len() < HEADER_LEN || &bytes[..MAGIC.len()] != MAGIC {
            return Err(corrupt("missing RCEB header".to_string()));
        }
        let (digest, payload) = bytes[MAGIC.len()..].split_at(DIGEST_LEN);
        if Sha256::digest(payload).as_slice() != digest {
            return Err(corrupt("checksum mismatch".to_string()));
        }
        let blob: Self = bincode::deserialize(payload).map_err(|e| corrupt(format!("undecodable payload: {e}")))?;
        if blob.version != BLOB_VERSION {
            return Err(corrupt(format!("unsupported version {}", blob.version)));
        }
        Ok(blob)
    }

    /// Dimensionality of the first embedding stored for any of `ids`.
    pub fn dimension_among(&self, ids: impl IntoIterator<Item = u64>) -> Option<usize> {
        ids.into_iter()
            .filter_map(|id| self.entries.get(&id))
            .flatten()
            .map(Vec::len)
            .next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EmbeddingBlob {
        let mut blob = EmbeddingBlob::new();
        blob.entries.insert(1, vec![vec![0.1, 0.2], vec![0.3, 0.4]]);
        blob.entries.insert(3, vec![vec![1.0, -1.0]]);
        blob
    }

    #[test]
    fn test_encode_layout() {
        let bytes = sample().encode().unwrap();
        assert_eq!(&bytes[..4], b"RCEB");
        assert_eq!(&bytes[4..36], Sha256::digest(&bytes[36..]).as_slice());
        assert_eq!(EmbeddingBlob::decode(&bytes, Path::new("b")).unwrap(), sample());
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = sample().encode().unwrap();
        bytes[0] = b'X';
        assert!(matches!(
            EmbeddingBlob::decode(&bytes, Path::new("b")),
            Err(StoreError::CorruptData { .. })
        ));
        assert!(EmbeddingBlob::decode(b"RCEB", Path::new("b")).is_err());
    }

    #[test]
    fn test_flipped_payload_byte_fails_checksum() {
        let mut bytes = sample().encode().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        match EmbeddingBlob::decode(&bytes, Path::new("b")) {
            Err(StoreError::CorruptData { reason, .. }) => assert!(reason.contains("checksum")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_valid_digest_over_garbage_payload() {
        let payload = b"\x01\x02".to_vec();
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&Sha256::digest(&payload));
        bytes.extend_from_slice(&payload);
        match EmbeddingBlob::decode(&bytes, Path::new("b")) {
            Err(StoreError::CorruptData { reason, .. }) => assert!(reason.contains("undecodable")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_dimension_among() {
        let blob = sample();
        assert_eq!(blob.dimension_among([3]), Some(2));
        assert_eq!(blob.dimension_among([2, 9]), None);
        assert_eq!(EmbeddingBlob::new().dimension_among([1]), None);
    }
}
