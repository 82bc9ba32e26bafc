use serde::{Deserialize, Serialize};

use crate::common::{Hex, address::Address, hash::Hash, hash::keccak256, quantity, word::Word};

/// A transaction as executed and stored in a block.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    pub hash: Hash,
    pub from: Address,
    pub to: Option<Address>,
    #[serde(with = "quantity")]
    pub nonce: u64,
    pub value: Word,
    #[serde(with = "quantity")]
    pub gas: u64,
    #[serde(rename = "gasPrice")]
    pub gas_price: Word,
    #[serde(rename = "input")]
    pub data: Hex,
}

impl Transaction {
    /// Deterministic identifier over the executed fields.
    pub fn compute_hash(&self) -> Hash {
        let mut s = rlp::RlpStream::new_list(7);
        s.append(&self.from.0.to_vec());
        s.append(&self.to.map(|to| to.0.to_vec()).unwrap_or_default());
        s.append(&self.nonce);
        s.append(&self.value);
        s.append(&self.gas);
        s.append(&self.gas_price);
        s.append(&self.data.0);
        keccak256(s.as_raw())
    }
}

impl rlp::Encodable for Transaction {
    fn rlp_append(&self, s: &mut rlp::RlpStream) {
        s.begin_list(8);
        s.append(&self.hash.0.to_vec());
        s.append(&self.from.0.to_vec());
        s.append(&self.to.map(|to| to.0.to_vec()).unwrap_or_default());
        s.append(&self.nonce);
        s.append(&self.value);
        s.append(&self.gas);
        s.append(&self.gas_price);
        s.append(&self.data.0);
    }
}

impl rlp::Decodable for Transaction {
    fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
        if rlp.item_count()? != 8 {
            return Err(rlp::DecoderError::RlpIncorrectListLen);
        }
        let hash: Vec<u8> = rlp.val_at(0)?;
        let from: Vec<u8> = rlp.val_at(1)?;
        let to: Vec<u8> = rlp.val_at(2)?;
        Ok(Self {
            hash: Hash::from_slice(&hash).ok_or(rlp::DecoderError::RlpInvalidLength)?,
            from: Address::try_from(from.as_slice())
                .map_err(|_| rlp::DecoderError::RlpInvalidLength)?,
            to: if to.is_empty() {
                None
            } else {
                Some(
                    Address::try_from(to.as_slice())
                        .map_err(|_| rlp::DecoderError::RlpInvalidLength)?,
                )
            },
            nonce: rlp.val_at(3)?,
            value: rlp.val_at(4)?,
            gas: rlp.val_at(5)?,
            gas_price: rlp.val_at(6)?,
            data: Hex(rlp.val_at(7)?),
        })
    }
}

/// Indexed emission from a contract. Positional fields are filled in when
/// the enclosing block is sealed.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<Hash>,
    pub data: Hex,
    #[serde(rename = "blockNumber", with = "quantity")]
    pub block_number: u64,
    #[serde(rename = "blockHash")]
    pub block_hash: Hash,
    #[serde(rename = "transactionHash")]
    pub tx_hash: Hash,
    #[serde(rename = "transactionIndex", with = "quantity")]
    pub tx_index: u64,
    #[serde(rename = "logIndex", with = "quantity")]
    pub log_index: u64,
}

impl Log {
    /// A log as emitted inside the interpreter, before placement is known.
    pub fn emitted(address: Address, topics: Vec<Hash>, data: Vec<u8>) -> Self {
        Self {
            address,
            topics,
            data: Hex(data),
            block_number: 0,
            block_hash: Hash::zero(),
            tx_hash: Hash::zero(),
            tx_index: 0,
            log_index: 0,
        }
    }
}

impl rlp::Encodable for Log {
    fn rlp_append(&self, s: &mut rlp::RlpStream) {
        s.begin_list(8);
        s.append(&self.address.0.to_vec());
        s.begin_list(self.topics.len());
        for topic in &self.topics {
            s.append(&topic.0.to_vec());
        }
        s.append(&self.data.0);
        s.append(&self.block_number);
        s.append(&self.block_hash.0.to_vec());
        s.append(&self.tx_hash.0.to_vec());
        s.append(&self.tx_index);
        s.append(&self.log_index);
    }
}

impl rlp::Decodable for Log {
    fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
        if rlp.item_count()? != 8 {
            return Err(rlp::DecoderError::RlpIncorrectListLen);
        }
        let address: Vec<u8> = rlp.val_at(0)?;
        let mut topics = Vec::new();
        for item in rlp.at(1)?.iter() {
            let bytes: Vec<u8> = item.as_val()?;
            topics.push(Hash::from_slice(&bytes).ok_or(rlp::DecoderError::RlpInvalidLength)?);
        }
        let block_hash: Vec<u8> = rlp.val_at(4)?;
        let tx_hash: Vec<u8> = rlp.val_at(5)?;
        Ok(Self {
            address: Address::try_from(address.as_slice())
                .map_err(|_| rlp::DecoderError::RlpInvalidLength)?,
            topics,
            data: Hex(rlp.val_at(2)?),
            block_number: rlp.val_at(3)?,
            block_hash: Hash::from_slice(&block_hash).ok_or(rlp::DecoderError::RlpInvalidLength)?,
            tx_hash: Hash::from_slice(&tx_hash).ok_or(rlp::DecoderError::RlpInvalidLength)?,
            tx_index: rlp.val_at(6)?,
            log_index: rlp.val_at(7)?,
        })
    }
}

/// Post-execution record of one transaction.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Receipt {
    #[serde(rename = "transactionHash")]
    pub tx_hash: Hash,
    #[serde(rename = "transactionIndex", with = "quantity")]
    pub tx_index: u64,
    #[serde(rename = "blockNumber", with = "quantity")]
    pub block_number: u64,
    #[serde(rename = "blockHash")]
    pub block_hash: Hash,
    pub from: Address,
    pub to: Option<Address>,
    #[serde(rename = "contractAddress")]
    pub contract_address: Option<Address>,
    #[serde(rename = "gasUsed", with = "quantity")]
    pub gas_used: u64,
    #[serde(rename = "cumulativeGasUsed", with = "quantity")]
    pub cumulative_gas_used: u64,
    #[serde(with = "quantity")]
    pub status: u64,
    pub logs: Vec<Log>,
}

impl rlp::Encodable for Receipt {
    fn rlp_append(&self, s: &mut rlp::RlpStream) {
        s.begin_list(11);
        s.append(&self.tx_hash.0.to_vec());
        s.append(&self.tx_index);
        s.append(&self.block_number);
        s.append(&self.block_hash.0.to_vec());
        s.append(&self.from.0.to_vec());
        s.append(&self.to.map(|to| to.0.to_vec()).unwrap_or_default());
        s.append(
            &self
                .contract_address
                .map(|a| a.0.to_vec())
                .unwrap_or_default(),
        );
        s.append(&self.gas_used);
        s.append(&self.cumulative_gas_used);
        s.append(&self.status);
        s.append_list(&self.logs);
    }
}

impl rlp::Decodable for Receipt {
    fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
        if rlp.item_count()? != 11 {
            return Err(rlp::DecoderError::RlpIncorrectListLen);
        }
        let tx_hash: Vec<u8> = rlp.val_at(0)?;
        let block_hash: Vec<u8> = rlp.val_at(3)?;
        let from: Vec<u8> = rlp.val_at(4)?;
        let to: Vec<u8> = rlp.val_at(5)?;
        let contract: Vec<u8> = rlp.val_at(6)?;
        let parse_addr = |bytes: &[u8]| {
            if bytes.is_empty() {
                Ok(None)
            } else {
                Address::try_from(bytes)
                    .map(Some)
                    .map_err(|_| rlp::DecoderError::RlpInvalidLength)
            }
        };
        Ok(Self {
            tx_hash: Hash::from_slice(&tx_hash).ok_or(rlp::DecoderError::RlpInvalidLength)?,
            tx_index: rlp.val_at(1)?,
            block_number: rlp.val_at(2)?,
            block_hash: Hash::from_slice(&block_hash).ok_or(rlp::DecoderError::RlpInvalidLength)?,
            from: Address::try_from(from.as_slice())
                .map_err(|_| rlp::DecoderError::RlpInvalidLength)?,
            to: parse_addr(&to)?,
            contract_address: parse_addr(&contract)?,
            gas_used: rlp.val_at(7)?,
            cumulative_gas_used: rlp.val_at(8)?,
            status: rlp.val_at(9)?,
            logs: rlp.list_at(10)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::addr;

    fn receipt() -> Receipt {
        Receipt {
            tx_hash: keccak256(b"tx"),
            tx_index: 0,
            block_number: 3,
            block_hash: keccak256(b"block"),
            from: addr("f39fd6e51aad88f6f4ce6ab8827279cfffb92266"),
            to: None,
            contract_address: Some(addr("c80a141ce8a5b73371043cba5cee40437975bb37")),
            gas_used: 21000,
            cumulative_gas_used: 21000,
            status: 1,
            logs: vec![Log {
                address: addr("c80a141ce8a5b73371043cba5cee40437975bb37"),
                topics: vec![keccak256(b"Transfer(address,address,uint256)")],
                data: Hex(vec![0u8; 32]),
                block_number: 3,
                block_hash: keccak256(b"block"),
                tx_hash: keccak256(b"tx"),
                tx_index: 0,
                log_index: 0,
            }],
        }
    }

    #[test]
    fn test_receipt_rlp_roundtrip() {
        let receipt = receipt();
        let bytes = rlp::encode(&receipt);
        let decoded: Receipt = rlp::decode(&bytes).unwrap();
        assert_eq!(decoded, receipt);
    }

    #[test]
    fn test_transaction_rlp_roundtrip() {
        let mut tx = Transaction {
            hash: Hash::zero(),
            from: addr("f39fd6e51aad88f6f4ce6ab8827279cfffb92266"),
            to: None,
            nonce: 1,
            value: Word::from(100u64),
            gas: 100_000,
            gas_price: Word::from(50_000u64),
            data: Hex(vec![0x60, 0x00]),
        };
        tx.hash = tx.compute_hash();
        let bytes = rlp::encode(&tx);
        let decoded: Transaction = rlp::decode(&bytes).unwrap();
        assert_eq!(decoded, tx);
    }
}
