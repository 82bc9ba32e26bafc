use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::common::{decode, hash::keccak256, word::Word};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Invalid address")]
    InvalidAddress,
    #[error("Invalid hex quantity")]
    InvalidQuantity,
}

/// 20-byte account identifier.
#[derive(Clone, Copy, Default, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Address(pub [u8; 20]);

impl Address {
    pub fn zero() -> Self {
        Self([0u8; 20])
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|byte| byte == &0)
    }

    /// `keccak256(rlp([sender, nonce]))[12:]`
    pub fn create(&self, nonce: u64) -> Address {
        let mut stream = rlp::RlpStream::new_list(2);
        stream.append(&self.0.to_vec());
        stream.append(&nonce);
        let hash = keccak256(stream.as_raw());
        let mut addr = [0u8; 20];
        addr.copy_from_slice(&hash.0[12..32]);
        Address(addr)
    }

    /// `keccak256(0xff || sender || salt || keccak256(initcode))[12:]`
    pub fn create2(&self, salt: &Word, initcode: &[u8]) -> Address {
        let mut buffer = Vec::with_capacity(1 + 20 + 32 + 32);
        buffer.push(0xffu8);
        buffer.extend_from_slice(&self.0);
        buffer.extend_from_slice(&salt.into_bytes());
        buffer.extend_from_slice(keccak256(initcode).as_slice());
        let hash = keccak256(&buffer);
        let mut addr = [0u8; 20];
        addr.copy_from_slice(&hash.0[12..32]);
        Address(addr)
    }

    pub fn as_word(&self) -> Word {
        let mut bytes = [0u8; 32];
        bytes[12..].copy_from_slice(&self.0);
        Word::from_bytes(&bytes)
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Address(0x{})", hex::encode(self.0))
    }
}

impl From<&Address> for Word {
    fn from(value: &Address) -> Self {
        value.as_word()
    }
}

impl From<&Word> for Address {
    fn from(value: &Word) -> Self {
        let bytes: [u8; 32] = value.into_bytes();
        let mut ret = Address::default();
        ret.0[..].copy_from_slice(&bytes[12..]);
        ret
    }
}

impl From<[u8; 20]> for Address {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

impl TryFrom<&[u8]> for Address {
    type Error = ParseError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() != 20 {
            return Err(ParseError::InvalidAddress);
        }
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(value);
        Ok(Address(bytes))
    }
}

impl TryFrom<&str> for Address {
    type Error = ParseError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        if value.len() != 40 && value.len() != 42 {
            return Err(ParseError::InvalidAddress);
        }
        let mut bytes = [0u8; 20];
        hex::decode_to_slice(value.trim_start_matches("0x"), &mut bytes)
            .map_err(|_| ParseError::InvalidAddress)?;
        Ok(Address(bytes))
    }
}

impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("0x{}", hex::encode(self.0)))
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Address, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        let hex: String = Deserialize::deserialize(deserializer)?;
        let hex = hex.trim_start_matches("0x");
        if hex.len() != 40 {
            return Err(D::Error::invalid_value(
                serde::de::Unexpected::Str(hex),
                &"40 hex characters",
            ));
        }
        Ok(addr(hex))
    }
}

pub const fn addr(s: &str) -> Address {
    Address(decode(s))
}
