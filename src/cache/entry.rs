//! The per-blob metadata record stored in the index.

use serde::{Deserialize, Serialize};

/// Metadata kept alongside every cached blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// 32-hex-char MD5 digest of the fingerprint; primary key in the index.
    pub hash: String,
    /// Seconds since epoch of the last write or refresh-on-read touch.
    pub timestamp: i64,
    /// Byte length of the on-disk blob at the moment this entry was written.
    pub size: u64,
}

impl Entry {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_bincode() {
        let entry = Entry {
            hash: "0123456789abcdef0123456789abcdef".into(),
            timestamp: 1_700_000_000,
            size: 4096,
        };
        let encoded = entry.encode().unwrap();
        let decoded = Entry::decode(&encoded).unwrap();
        assert_eq!(entry, decoded);
    }
}
