use std::ops::{BitAnd, BitOr, BitXor, Shl, Shr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::common::decode;

type U256 = primitive_types::U256;
type U512 = primitive_types::U512;

/// 32-byte big-endian unsigned integer: stack entries, storage keys and
/// values, balances.
#[derive(Default, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Word(U256);

impl Word {
    pub fn zero() -> Self {
        Self(U256::zero())
    }

    pub fn one() -> Self {
        Self(U256::one())
    }

    pub fn max() -> Self {
        Self(U256::max_value())
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(U256::from_big_endian(bytes))
    }

    pub fn into_bytes(&self) -> [u8; 32] {
        self.0.to_big_endian()
    }

    /// Big-endian bytes with leading zeros stripped; empty for zero.
    pub fn to_trimmed_bytes(&self) -> Vec<u8> {
        self.into_bytes()
            .into_iter()
            .skip_while(|byte| byte == &0)
            .collect()
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn bit(&self, index: usize) -> bool {
        self.0.bit(index)
    }

    /// Number of significant bits.
    pub fn bits(&self) -> usize {
        self.0.bits()
    }

    /// Big-endian byte at `index` (0 = most significant).
    pub fn byte(&self, index: usize) -> u8 {
        self.0.byte(31 - index)
    }

    pub fn as_u64(&self) -> u64 {
        self.0.as_u64()
    }

    pub fn as_usize(&self) -> usize {
        self.0.as_usize()
    }

    /// `u64::MAX` when the value does not fit; gas forwarding never needs
    /// more precision than that.
    pub fn as_u64_saturating(&self) -> u64 {
        if self.0 > U256::from(u64::MAX) {
            u64::MAX
        } else {
            self.0.as_u64()
        }
    }

    pub fn fits_usize(&self) -> bool {
        self.0 <= U256::from(usize::MAX as u64)
    }

    pub fn pow(&self, exp: Self) -> Self {
        let (ret, _) = self.0.overflowing_pow(exp.0);
        Self(ret)
    }

    pub fn overflowing_add(&self, rhs: Self) -> (Self, bool) {
        let (word, flag) = self.0.overflowing_add(rhs.0);
        (Self(word), flag)
    }

    pub fn overflowing_sub(&self, rhs: Self) -> (Self, bool) {
        let (word, flag) = self.0.overflowing_sub(rhs.0);
        (Self(word), flag)
    }

    pub fn overflowing_mul(&self, rhs: Self) -> (Self, bool) {
        let (word, flag) = self.0.overflowing_mul(rhs.0);
        (Self(word), flag)
    }

    pub fn saturating_sub(&self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }

    pub fn checked_sub(&self, rhs: Self) -> Option<Self> {
        self.0.checked_sub(rhs.0).map(Self)
    }

    pub fn add_modulo(&self, that: &Word, modulo: &Word) -> Word {
        if modulo.is_zero() {
            return Word::zero();
        }
        let sum = U512::from(self.0) + U512::from(that.0);
        let res = sum % U512::from(modulo.0);
        Word(U256::try_from(res).expect("reduced below a 256-bit modulus"))
    }

    pub fn mul_modulo(&self, that: &Word, modulo: &Word) -> Word {
        if modulo.is_zero() {
            return Word::zero();
        }
        let res = self.0.full_mul(that.0) % U512::from(modulo.0);
        Word(U256::try_from(res).expect("reduced below a 256-bit modulus"))
    }

    pub fn from_hex(hex: &str) -> Result<Self, crate::common::address::ParseError> {
        let hex = hex.trim_start_matches("0x");
        U256::from_str_radix(hex, 16)
            .map(Self)
            .map_err(|_| crate::common::address::ParseError::InvalidQuantity)
    }
}

impl std::fmt::Debug for Word {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::LowerHex::fmt(&self.0, f)
    }
}

impl std::fmt::Display for Word {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::LowerHex::fmt(&self.0, f)
    }
}

impl std::fmt::LowerHex for Word {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::LowerHex::fmt(&self.0, f)
    }
}

impl From<u8> for Word {
    fn from(value: u8) -> Self {
        Self(U256::from(value))
    }
}

impl From<u64> for Word {
    fn from(value: u64) -> Self {
        Self(U256::from(value))
    }
}

impl From<u128> for Word {
    fn from(value: u128) -> Self {
        Self(U256::from(value))
    }
}

impl From<usize> for Word {
    fn from(value: usize) -> Self {
        Self(U256::from(value))
    }
}

impl std::ops::Add<Word> for Word {
    type Output = Word;

    fn add(self, rhs: Word) -> Self::Output {
        Word(self.0 + rhs.0)
    }
}

impl std::ops::AddAssign<Word> for Word {
    fn add_assign(&mut self, rhs: Word) {
        self.0 += rhs.0;
    }
}

impl std::ops::Sub<Word> for Word {
    type Output = Word;

    fn sub(self, rhs: Word) -> Self::Output {
        Word(self.0 - rhs.0)
    }
}

impl std::ops::SubAssign<Word> for Word {
    fn sub_assign(&mut self, rhs: Word) {
        self.0 -= rhs.0;
    }
}

impl std::ops::Mul<Word> for Word {
    type Output = Word;

    fn mul(self, rhs: Word) -> Self::Output {
        Word(self.0 * rhs.0)
    }
}

impl std::ops::Div<Word> for Word {
    type Output = Word;

    fn div(self, rhs: Word) -> Self::Output {
        Word(self.0 / rhs.0)
    }
}

impl std::ops::Rem<Word> for Word {
    type Output = Word;

    fn rem(self, rhs: Word) -> Self::Output {
        Word(self.0 % rhs.0)
    }
}

impl BitAnd for Word {
    type Output = Word;

    fn bitand(self, rhs: Self) -> Self::Output {
        Self(self.0 & rhs.0)
    }
}

impl BitOr for Word {
    type Output = Word;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitXor for Word {
    type Output = Word;

    fn bitxor(self, rhs: Self) -> Self::Output {
        Self(self.0 ^ rhs.0)
    }
}

impl std::ops::Not for Word {
    type Output = Word;

    fn not(self) -> Self::Output {
        Self(!self.0)
    }
}

impl Shl<usize> for Word {
    type Output = Word;

    fn shl(self, rhs: usize) -> Self::Output {
        Self(self.0 << rhs)
    }
}

impl Shr<usize> for Word {
    type Output = Word;

    fn shr(self, rhs: usize) -> Self::Output {
        Self(self.0 >> rhs)
    }
}

impl rlp::Encodable for Word {
    fn rlp_append(&self, s: &mut rlp::RlpStream) {
        s.append_internal(&self.0);
    }
}

impl rlp::Decodable for Word {
    fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
        U256::decode(rlp).map(Self)
    }
}

impl Serialize for Word {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{:#x}", self.0))
    }
}

impl<'de> Deserialize<'de> for Word {
    fn deserialize<D>(deserializer: D) -> Result<Word, D::Error>
    where
        D: Deserializer<'de>,
    {
        let hex: String = Deserialize::deserialize(deserializer)?;
        Ok(word(hex.trim_start_matches("0x")))
    }
}

pub fn word(s: &str) -> Word {
    let b = decode::<32>(s);
    Word::from_bytes(&b)
}
