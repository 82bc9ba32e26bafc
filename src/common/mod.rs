pub mod account;
pub mod address;
pub mod block;
pub mod call;
pub mod hash;
pub mod tx;
pub mod word;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub use address::{Address, addr};
pub use hash::Hash;
pub use word::{Word, word};

pub(crate) const fn decode<const N: usize>(s: &str) -> [u8; N] {
    let s = s.as_bytes();
    let mut b = [0u8; N];
    let mut n = s.len();
    let parity = s.len() % 2;

    if s.is_empty() {
        return b;
    }
    let min = if s[0] == b'0' && s.len() > 1 && s[1] == b'x' {
        2
    } else {
        0
    };

    let mut i = N;
    while n > min {
        let c = s[n - 1];
        let c = match c {
            b'0'..=b'9' => c - b'0',
            b'a'..=b'f' => c - b'a' + 10,
            b'A'..=b'F' => c - b'A' + 10,
            _ => panic!("Invalid hex"),
        };

        if n % 2 == parity {
            b[i - 1] = c;
        } else {
            b[i - 1] += c << 4;
            i -= 1;
        }

        n -= 1;
    }
    b
}

/// Byte string carried over the RPC boundary as 0x-prefixed lowercase hex.
#[derive(Clone, Default, Eq, PartialEq)]
pub struct Hex(pub Vec<u8>);

impl Hex {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }
}

impl std::fmt::Debug for Hex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex::encode(&self.0))
    }
}

impl std::fmt::Display for Hex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex::encode(&self.0))
    }
}

impl From<Vec<u8>> for Hex {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl Serialize for Hex {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("0x{}", hex::encode(&self.0)))
    }
}

impl<'de> Deserialize<'de> for Hex {
    fn deserialize<D>(deserializer: D) -> Result<Hex, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        let hex: String = Deserialize::deserialize(deserializer)?;
        let bytes = hex::decode(hex.trim_start_matches("0x"))
            .map_err(|_| D::Error::custom("invalid hex string"))?;
        Ok(Hex(bytes))
    }
}

/// Serde adapter for `u64` quantities: minimal hex, `"0x0"` for zero.
pub mod quantity {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &u64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{value:#x}"))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        let hex: String = Deserialize::deserialize(deserializer)?;
        u64::from_str_radix(hex.trim_start_matches("0x"), 16)
            .map_err(|_| D::Error::custom("invalid hex quantity"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(s: &str) {
        let hex = hex::decode(s.trim_start_matches("0x")).expect("hex");
        assert_eq!(&decode::<20>(s), &hex[..], "{s}");
    }

    #[test]
    fn test_decode() {
        assert_eq!(
            decode("123456789abcdef"),
            [0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef]
        );
        assert_eq!(
            decode("0x123456789abcdef"),
            [0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef]
        );
        check("0xc80a141ce8a5b73371043cba5cee40437975bb37");
    }

    #[test]
    fn test_hex_roundtrip() {
        let hex: Hex = serde_json::from_str("\"0xdeadbeef\"").unwrap();
        assert_eq!(hex.0, vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(serde_json::to_string(&hex).unwrap(), "\"0xdeadbeef\"");
    }
}
