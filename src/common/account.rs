use crate::common::{
    hash::{EMPTY_CODE_HASH, EMPTY_TRIE_ROOT, Hash},
    word::Word,
};

/// Leaf value of the world trie: one account record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Account {
    pub nonce: u64,
    pub balance: Word,
    pub storage_root: Hash,
    pub code_hash: Hash,
}

impl Default for Account {
    fn default() -> Self {
        Self {
            nonce: 0,
            balance: Word::zero(),
            storage_root: EMPTY_TRIE_ROOT,
            code_hash: EMPTY_CODE_HASH,
        }
    }
}

impl Account {
    pub fn has_code(&self) -> bool {
        self.code_hash != EMPTY_CODE_HASH
    }

    /// EIP-161 shape: no nonce, no balance, no code.
    pub fn is_empty(&self) -> bool {
        self.nonce == 0 && self.balance.is_zero() && !self.has_code()
    }
}

impl rlp::Encodable for Account {
    fn rlp_append(&self, s: &mut rlp::RlpStream) {
        s.begin_list(4);
        s.append(&self.nonce);
        s.append(&self.balance);
        s.append(&self.storage_root.0.to_vec());
        s.append(&self.code_hash.0.to_vec());
    }
}

impl rlp::Decodable for Account {
    fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
        if rlp.item_count()? != 4 {
            return Err(rlp::DecoderError::RlpIncorrectListLen);
        }
        let storage_root: Vec<u8> = rlp.val_at(2)?;
        let code_hash: Vec<u8> = rlp.val_at(3)?;
        Ok(Self {
            nonce: rlp.val_at(0)?,
            balance: rlp.val_at(1)?,
            storage_root: Hash::from_slice(&storage_root)
                .ok_or(rlp::DecoderError::RlpInvalidLength)?,
            code_hash: Hash::from_slice(&code_hash)
                .ok_or(rlp::DecoderError::RlpInvalidLength)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rlp_roundtrip() {
        let account = Account {
            nonce: 7,
            balance: Word::from(1_000_000_000_000_000_000u64),
            storage_root: EMPTY_TRIE_ROOT,
            code_hash: EMPTY_CODE_HASH,
        };
        let bytes = rlp::encode(&account);
        let decoded: Account = rlp::decode(&bytes).unwrap();
        assert_eq!(decoded, account);
    }

    #[test]
    fn test_default_is_empty() {
        assert!(Account::default().is_empty());
        assert!(!Account::default().has_code());
    }
}
