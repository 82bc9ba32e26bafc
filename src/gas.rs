//! Gas metering: one meter per frame plus the dynamic parts of the cost
//! schedule. Static per-opcode charges live in the dispatch table
//! (`opcodes.rs`); this is everything priced by operand size or state shape.
//!
//! The schedule is a fixed constant-cost model (no warm/cold access lists):
//! classic tier costs for reads, quadratic-plus-linear memory growth,
//! original/dirty-insensitive SSTORE pricing with a clear refund.

/// Intrinsic charge for any transaction.
pub const TX_GAS: u64 = 21_000;
/// Intrinsic charge for a contract-creating transaction.
pub const TX_CREATE_GAS: u64 = 53_000;
pub const TX_DATA_ZERO_GAS: u64 = 4;
pub const TX_DATA_NONZERO_GAS: u64 = 68;

pub const SSTORE_SET_GAS: u64 = 20_000;
pub const SSTORE_RESET_GAS: u64 = 5_000;
pub const SSTORE_CLEAR_REFUND: u64 = 15_000;

pub const CALL_VALUE_GAS: u64 = 9_000;
pub const CALL_STIPEND: u64 = 2_300;
pub const NEW_ACCOUNT_GAS: u64 = 25_000;

/// Per byte of code deposited by CREATE/CREATE2.
pub const CODE_DEPOSIT_GAS: u64 = 200;

pub const SHA3_WORD_GAS: u64 = 6;
pub const COPY_WORD_GAS: u64 = 3;
pub const LOG_TOPIC_GAS: u64 = 375;
pub const LOG_DATA_GAS: u64 = 8;
pub const EXP_BYTE_GAS: u64 = 50;

pub const MEMORY_GAS: u64 = 3;
pub const MEMORY_QUAD_DIVISOR: u64 = 512;

/// Remaining-gas meter for one frame.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Gas {
    limit: u64,
    used: u64,
}

impl Gas {
    pub fn new(limit: u64) -> Self {
        Self { limit, used: 0 }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn remaining(&self) -> u64 {
        self.limit - self.used
    }

    /// `false` when the charge exceeds what is left; nothing is consumed
    /// in that case (the caller then drains the frame).
    #[must_use]
    pub fn try_consume(&mut self, amount: u64) -> bool {
        if amount > self.remaining() {
            return false;
        }
        self.used += amount;
        true
    }

    /// Drain the meter; failed frames burn whatever was left.
    pub fn consume_all(&mut self) {
        self.used = self.limit;
    }

    /// Hand back gas a sub-frame did not use.
    pub fn reclaim(&mut self, amount: u64) {
        debug_assert!(amount <= self.used);
        self.used -= amount;
    }
}

pub fn words(len: usize) -> u64 {
    (len as u64).div_ceil(32)
}

/// Total cost of a memory of `w` 32-byte words.
fn memory_cost(w: u64) -> u64 {
    let w = w as u128;
    let cost = MEMORY_GAS as u128 * w + w * w / MEMORY_QUAD_DIVISOR as u128;
    u64::try_from(cost).unwrap_or(u64::MAX)
}

/// Charge for growing memory from `current` bytes to cover `end` bytes.
pub fn memory_expansion(current: usize, end: u64) -> u64 {
    let new_words = end.div_ceil(32);
    let old_words = words(current);
    if new_words <= old_words {
        return 0;
    }
    memory_cost(new_words) - memory_cost(old_words)
}

pub fn copy_gas(len: usize) -> u64 {
    COPY_WORD_GAS * words(len)
}

pub fn sha3_gas(len: usize) -> u64 {
    SHA3_WORD_GAS * words(len)
}

pub fn log_gas(topics: usize, len: usize) -> u64 {
    LOG_TOPIC_GAS * topics as u64 + LOG_DATA_GAS * len as u64
}

pub fn exp_gas(exponent_bits: usize) -> u64 {
    EXP_BYTE_GAS * (exponent_bits.div_ceil(8) as u64)
}

/// A caller keeps at least one 64th of its remaining gas.
pub fn max_forwardable(remaining: u64) -> u64 {
    remaining - remaining / 64
}

/// Intrinsic transaction charge: base plus calldata.
pub fn intrinsic_gas(data: &[u8], is_create: bool) -> u64 {
    let base = if is_create { TX_CREATE_GAS } else { TX_GAS };
    data.iter().fold(base, |acc, byte| {
        acc + if *byte == 0 {
            TX_DATA_ZERO_GAS
        } else {
            TX_DATA_NONZERO_GAS
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meter() {
        let mut gas = Gas::new(100);
        assert!(gas.try_consume(60));
        assert_eq!(gas.remaining(), 40);
        assert!(!gas.try_consume(41));
        assert_eq!(gas.remaining(), 40, "failed charge consumes nothing");
        gas.reclaim(10);
        assert_eq!(gas.used(), 50);
        gas.consume_all();
        assert_eq!(gas.remaining(), 0);
    }

    #[test]
    fn test_memory_expansion_is_quadratic() {
        // one word: 3 + 0
        assert_eq!(memory_expansion(0, 32), 3);
        // 1024 words: 3*1024 + 1024^2/512 = 3072 + 2048
        assert_eq!(memory_expansion(0, 32 * 1024), 5120);
        // growth from 1 word to 2 words charges the marginal cost only
        assert_eq!(memory_expansion(32, 64), memory_expansion(0, 64) - 3);
        // no charge for already-covered memory
        assert_eq!(memory_expansion(64, 32), 0);
    }

    #[test]
    fn test_intrinsic() {
        assert_eq!(intrinsic_gas(&[], false), 21_000);
        assert_eq!(intrinsic_gas(&[0, 1], false), 21_000 + 4 + 68);
        assert_eq!(intrinsic_gas(&[], true), 53_000);
    }

    #[test]
    fn test_forwardable() {
        assert_eq!(max_forwardable(6400), 6300);
        assert_eq!(max_forwardable(63), 63);
    }
}
