use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::common::decode;

/// 32-byte Keccak-256 digest.
#[derive(Clone, Copy, Default, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Hash(pub [u8; 32]);

/// Keccak-256 of the empty byte string; the `code_hash` of an EOA.
pub const EMPTY_CODE_HASH: Hash = Hash(decode(
    "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470",
));

/// Keccak-256 of the RLP empty string; root of a trie with no keys.
pub const EMPTY_TRIE_ROOT: Hash = Hash(decode(
    "56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421",
));

pub fn keccak256(input: &[u8]) -> Hash {
    use tiny_keccak::Hasher;
    let mut sha3 = tiny_keccak::Keccak::v256();
    let mut ret = [0u8; 32];
    sha3.update(input);
    sha3.finalize(&mut ret);
    Hash(ret)
}

impl Hash {
    pub fn zero() -> Self {
        Self([0u8; 32])
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|byte| byte == &0)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 32 {
            return None;
        }
        let mut ret = [0u8; 32];
        ret.copy_from_slice(bytes);
        Some(Self(ret))
    }
}

impl std::fmt::Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash(0x{})", hex::encode(self.0))
    }
}

impl From<[u8; 32]> for Hash {
    fn from(value: [u8; 32]) -> Self {
        Self(value)
    }
}

impl Serialize for Hash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("0x{}", hex::encode(self.0)))
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D>(deserializer: D) -> Result<Hash, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        let hex: String = Deserialize::deserialize(deserializer)?;
        let hex = hex.trim_start_matches("0x");
        if hex.len() != 64 {
            return Err(D::Error::invalid_value(
                serde::de::Unexpected::Str(hex),
                &"64 hex characters",
            ));
        }
        Ok(Hash(decode(hex)))
    }
}

pub const fn hash(s: &str) -> Hash {
    Hash(decode(s))
}
