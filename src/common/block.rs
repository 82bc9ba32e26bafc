use serde::{Deserialize, Serialize};

use crate::common::{
    hash::{Hash, keccak256},
    quantity,
    tx::Transaction,
};

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Header {
    #[serde(with = "quantity")]
    pub number: u64,
    pub hash: Hash,
    #[serde(rename = "parentHash")]
    pub parent_hash: Hash,
    #[serde(with = "quantity")]
    pub timestamp: u64,
    #[serde(rename = "stateRoot")]
    pub state_root: Hash,
    #[serde(rename = "gasLimit", with = "quantity")]
    pub gas_limit: u64,
    #[serde(rename = "gasUsed", with = "quantity")]
    pub gas_used: u64,
}

impl Header {
    /// Hash over everything except the hash field itself.
    pub fn compute_hash(&self) -> Hash {
        let mut s = rlp::RlpStream::new_list(6);
        s.append(&self.number);
        s.append(&self.parent_hash.0.to_vec());
        s.append(&self.timestamp);
        s.append(&self.state_root.0.to_vec());
        s.append(&self.gas_limit);
        s.append(&self.gas_used);
        keccak256(s.as_raw())
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    #[serde(flatten)]
    pub header: Header,
    pub transactions: Vec<Transaction>,
}

impl rlp::Encodable for Header {
    fn rlp_append(&self, s: &mut rlp::RlpStream) {
        s.begin_list(7);
        s.append(&self.number);
        s.append(&self.hash.0.to_vec());
        s.append(&self.parent_hash.0.to_vec());
        s.append(&self.timestamp);
        s.append(&self.state_root.0.to_vec());
        s.append(&self.gas_limit);
        s.append(&self.gas_used);
    }
}

impl rlp::Decodable for Header {
    fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
        if rlp.item_count()? != 7 {
            return Err(rlp::DecoderError::RlpIncorrectListLen);
        }
        let hash: Vec<u8> = rlp.val_at(1)?;
        let parent_hash: Vec<u8> = rlp.val_at(2)?;
        let state_root: Vec<u8> = rlp.val_at(4)?;
        Ok(Self {
            number: rlp.val_at(0)?,
            hash: Hash::from_slice(&hash).ok_or(rlp::DecoderError::RlpInvalidLength)?,
            parent_hash: Hash::from_slice(&parent_hash)
                .ok_or(rlp::DecoderError::RlpInvalidLength)?,
            timestamp: rlp.val_at(3)?,
            state_root: Hash::from_slice(&state_root)
                .ok_or(rlp::DecoderError::RlpInvalidLength)?,
            gas_limit: rlp.val_at(5)?,
            gas_used: rlp.val_at(6)?,
        })
    }
}

impl rlp::Encodable for Block {
    fn rlp_append(&self, s: &mut rlp::RlpStream) {
        s.begin_list(2);
        s.append(&self.header);
        s.append_list(&self.transactions);
    }
}

impl rlp::Decodable for Block {
    fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
        if rlp.item_count()? != 2 {
            return Err(rlp::DecoderError::RlpIncorrectListLen);
        }
        Ok(Self {
            header: rlp.val_at(0)?,
            transactions: rlp.list_at(1)?,
        })
    }
}
