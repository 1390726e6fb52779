use serde::{Deserialize, Serialize};

/// eMule file identity (MD4 over the part hashes).
///
/// Storage convention: big-endian bytes, same as `KadId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileHash(pub [u8; 16]);

impl FileHash {
    pub fn to_hex_lower(self) -> String {
        let mut s = String::with_capacity(32);
        for b in self.0 {
            use std::fmt::Write as _;
            let _ = write!(&mut s, "{:02x}", b);
        }
        s
    }

    pub fn from_hex(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.len() != 32 {
            return None;
        }
        let mut out = [0u8; 16];
        for (i, pair) in value.as_bytes().chunks_exact(2).enumerate() {
            let hi = (pair[0] as char).to_digit(16)?;
            let lo = (pair[1] as char).to_digit(16)?;
            out[i] = ((hi << 4) | lo) as u8;
        }
        Some(Self(out))
    }
}

impl std::fmt::Display for FileHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex_lower())
    }
}

/// Lookup mechanism a requery went out on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    /// Network-wide source search, sent at most once per download.
    Broadcast,
    /// Kad alternate-source lookup; cancelable and repeatable.
    Dht,
}

impl QueryType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Broadcast => "broadcast",
            Self::Dht => "dht",
        }
    }

    pub(crate) fn to_tag(kind: Option<Self>) -> u8 {
        match kind {
            None => 0,
            Some(Self::Broadcast) => 1,
            Some(Self::Dht) => 2,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Broadcast),
            2 => Some(Self::Dht),
            _ => None,
        }
    }
}

/// A concrete source search built by the download for a broadcast requery.
///
/// Opaque to the requery supervisor; the dispatcher owns the encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub file_hash: FileHash,
    pub file_name: String,
    pub file_size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_hash_hex_parses_back() {
        let hash = FileHash::from_hex("0123456789ABCDEF0123456789abcdef").expect("hex");
        assert_eq!(hash.0[0], 0x01);
        assert_eq!(hash.0[15], 0xef);
        assert_eq!(hash.to_hex_lower(), "0123456789abcdef0123456789abcdef");
    }

    #[test]
    fn file_hash_rejects_bad_input() {
        assert!(FileHash::from_hex("").is_none());
        assert!(FileHash::from_hex("0123").is_none());
        assert!(FileHash::from_hex("zz23456789abcdef0123456789abcdef").is_none());
    }

    #[test]
    fn query_type_tag_mapping_covers_none() {
        for kind in [None, Some(QueryType::Broadcast), Some(QueryType::Dht)] {
            assert_eq!(QueryType::from_tag(QueryType::to_tag(kind)), kind);
        }
        assert_eq!(QueryType::from_tag(42), None);
    }
}
