use sha2::{Digest, Sha256};

pub const HASH_METHOD_SHA256: &str = "sha256";

/// Content fingerprint of chunk bytes, rendered as `sha256:<hex>`.
pub struct ChunkHasher {
    hasher: Sha256,
}

impl Default for ChunkHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkHasher {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finish(self) -> String {
        format!("{}:{}", HASH_METHOD_SHA256, hex::encode(self.hasher.finalize()))
    }

    pub fn calc_from_bytes(data: &[u8]) -> String {
        let mut hasher = Self::new();
        hasher.update(data);
        hasher.finish()
    }

    pub fn verify(data: &[u8], expected: &str) -> bool {
        Self::calc_from_bytes(data) == expected
    }

    /// Whole-file hash, derived from the ordered chunk hashes rather than
    /// from the raw bytes so it can be recomputed from metadata alone.
    pub fn calc_file_hash<S: AsRef<str>>(chunk_hashes: &[S]) -> String {
        let mut hasher = Self::new();
        for (i, chunk_hash) in chunk_hashes.iter().enumerate() {
            if i > 0 {
                hasher.update(b"\n");
            }
            hasher.update(chunk_hash.as_ref().as_bytes());
        }
        hasher.finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_chunk_hash_format() {
        let hash = ChunkHasher::calc_from_bytes(b"abc");
        assert_eq!(
            hash,
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(ChunkHasher::verify(b"abc", &hash));
        assert!(!ChunkHasher::verify(b"abd", &hash));
    }

    #[test]
    fn test_streaming_matches_oneshot() {
        let mut hasher = ChunkHasher::new();
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(hasher.finish(), ChunkHasher::calc_from_bytes(b"hello world"));
    }

    #[test]
    fn test_file_hash_depends_on_order() {
        let a = ChunkHasher::calc_from_bytes(b"a");
        let b = ChunkHasher::calc_from_bytes(b"b");
        let ab = ChunkHasher::calc_file_hash(&[a.clone(), b.clone()]);
        let ba = ChunkHasher::calc_file_hash(&[b, a]);
        assert_ne!(ab, ba);

        let empty: [String; 0] = [];
        assert_eq!(
            ChunkHasher::calc_file_hash(&empty),
            ChunkHasher::calc_from_bytes(b"")
        );
    }
}
