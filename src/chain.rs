use std::collections::BTreeSet;
use std::sync::Arc;

use thiserror::Error;

use crate::{
    common::{
        address::Address,
        block::{Block, Header},
        hash::Hash,
        tx::{Log, Receipt},
    },
    kv::{KvBackend, WriteBatch, column, key},
};

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Unknown block")]
    UnknownBlock,
    #[error("Unknown transaction")]
    UnknownTransaction,
    #[error("Bad filter: {0}")]
    BadFilter(String),
    #[error("Undecodable chain entry: {0}")]
    Codec(#[from] rlp::DecoderError),
}

/// One slot of a log filter's topic list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TopicFilter {
    /// Wildcard: any topic, or none.
    Any,
    One(Hash),
    Set(Vec<Hash>),
}

impl TopicFilter {
    fn matches(&self, topic: Option<&Hash>) -> bool {
        match self {
            TopicFilter::Any => true,
            TopicFilter::One(hash) => topic == Some(hash),
            TopicFilter::Set(hashes) => topic.is_some_and(|t| hashes.contains(t)),
        }
    }
}

/// Resolved log query: block bounds are concrete numbers by the time they
/// reach the chain.
#[derive(Clone, Debug, Default)]
pub struct LogFilter {
    pub from_block: u64,
    pub to_block: u64,
    pub address: Option<Address>,
    pub topics: Vec<TopicFilter>,
}

/// Sentinel topic index for the address-only posting list.
const ADDRESS_POSTING: u8 = 0xff;

/// Append-only block sequence plus two secondary indices: receipts by
/// transaction hash and `(address, topic position, topic)` posting lists
/// for log queries.
pub struct Blockchain {
    kv: Arc<dyn KvBackend>,
    latest: u64,
}

impl Blockchain {
    /// Recover from the `M|latest` pointer, or write the genesis block with
    /// the given state root.
    pub fn open(kv: Arc<dyn KvBackend>, genesis_state_root: Hash) -> Result<Self, ChainError> {
        if let Some(bytes) = kv.get(&key(column::META, b"latest")) {
            let latest = decode_number(&bytes)?;
            return Ok(Self { kv, latest });
        }

        let mut genesis = Block {
            header: Header {
                number: 0,
                parent_hash: Hash::zero(),
                timestamp: 0,
                state_root: genesis_state_root,
                gas_limit: 0,
                gas_used: 0,
                ..Default::default()
            },
            transactions: vec![],
        };
        genesis.header.hash = genesis.header.compute_hash();

        let mut chain = Self { kv, latest: 0 };
        let mut batch = WriteBatch::new();
        chain.write_block(&mut batch, &genesis, &[]);
        chain.kv.put_batch(batch);
        tracing::info!(hash = %genesis.header.hash, "genesis block written");
        Ok(chain)
    }

    pub fn latest_number(&self) -> u64 {
        self.latest
    }

    pub fn latest_header(&self) -> Result<Header, ChainError> {
        Ok(self.block_by_number(self.latest)?.header)
    }

    pub fn block_by_number(&self, number: u64) -> Result<Block, ChainError> {
        let bytes = self
            .kv
            .get(&key(column::BLOCK, &number.to_be_bytes()))
            .ok_or(ChainError::UnknownBlock)?;
        Ok(rlp::decode(&bytes)?)
    }

    pub fn block_by_hash(&self, hash: &Hash) -> Result<Block, ChainError> {
        let bytes = self
            .kv
            .get(&key(column::HASH, &hash.0))
            .ok_or(ChainError::UnknownBlock)?;
        self.block_by_number(decode_number(&bytes)?)
    }

    pub fn receipt(&self, tx_hash: &Hash) -> Result<Receipt, ChainError> {
        let bytes = self
            .kv
            .get(&key(column::RECEIPT, &tx_hash.0))
            .ok_or(ChainError::UnknownTransaction)?;
        Ok(rlp::decode(&bytes)?)
    }

    /// Persist the next block, its receipts and the log index in one batch.
    pub fn append(&mut self, block: &Block, receipts: &[Receipt]) -> Result<(), ChainError> {
        debug_assert_eq!(block.header.number, self.latest + 1, "blocks are contiguous");
        debug_assert_eq!(
            block.header.parent_hash,
            self.latest_header()?.hash,
            "parent hash links the chain"
        );

        let mut batch = WriteBatch::new();
        self.latest = block.header.number;
        self.write_block(&mut batch, block, receipts);
        self.kv.put_batch(batch);
        tracing::debug!(
            number = block.header.number,
            receipts = receipts.len(),
            "block appended"
        );
        Ok(())
    }

    fn write_block(&mut self, batch: &mut WriteBatch, block: &Block, receipts: &[Receipt]) {
        batch.put(
            key(column::BLOCK, &block.header.number.to_be_bytes()),
            rlp::encode(block).to_vec(),
        );
        batch.put(
            key(column::HASH, &block.header.hash.0),
            block.header.number.to_be_bytes().to_vec(),
        );
        for receipt in receipts {
            batch.put(
                key(column::RECEIPT, &receipt.tx_hash.0),
                rlp::encode(receipt).to_vec(),
            );
            for log in &receipt.logs {
                self.index_log(batch, log);
            }
        }
        batch.put(
            key(column::META, b"latest"),
            block.header.number.to_be_bytes().to_vec(),
        );
    }

    fn index_log(&self, batch: &mut WriteBatch, log: &Log) {
        let entry = (log.block_number, log.log_index);
        self.append_posting(
            batch,
            posting_key(&log.address, ADDRESS_POSTING, &Hash::zero()),
            entry,
        );
        for (i, topic) in log.topics.iter().enumerate().take(4) {
            self.append_posting(batch, posting_key(&log.address, i as u8, topic), entry);
        }
    }

    fn append_posting(&self, batch: &mut WriteBatch, key: Vec<u8>, entry: (u64, u64)) {
        // read-modify-write inside the append batch; postings for a key are
        // naturally ordered because blocks only grow
        let mut postings = self
            .kv
            .get(&key)
            .and_then(|bytes| decode_postings(&bytes).ok())
            .unwrap_or_default();
        // the same batch may already extend this key; merge those first
        for (pending_key, value) in &batch.writes {
            if *pending_key == key {
                if let Some(Ok(pending)) = value.as_ref().map(|v| decode_postings(v)) {
                    postings = pending;
                }
            }
        }
        postings.push(entry);
        batch.put(key, encode_postings(&postings));
    }

    /// Evaluate a log filter: posting-list intersection when an address
    /// anchors the query, a block-range scan otherwise. Results come back
    /// in block order, then log-index order.
    pub fn logs(&self, filter: &LogFilter) -> Result<Vec<Log>, ChainError> {
        if filter.from_block > filter.to_block {
            return Err(ChainError::BadFilter(format!(
                "fromBlock {} is past toBlock {}",
                filter.from_block, filter.to_block
            )));
        }
        if filter.topics.len() > 4 {
            return Err(ChainError::BadFilter(
                "at most 4 topic positions".to_string(),
            ));
        }
        let to_block = filter.to_block.min(self.latest);

        let candidates: Vec<(u64, u64)> = match &filter.address {
            Some(address) => {
                let mut set: BTreeSet<(u64, u64)> = self
                    .read_postings(posting_key(address, ADDRESS_POSTING, &Hash::zero()))
                    .into_iter()
                    .collect();
                for (i, slot) in filter.topics.iter().enumerate() {
                    let wanted: Vec<&Hash> = match slot {
                        TopicFilter::Any => continue,
                        TopicFilter::One(hash) => vec![hash],
                        TopicFilter::Set(hashes) => hashes.iter().collect(),
                    };
                    let mut slot_set = BTreeSet::new();
                    for topic in wanted {
                        slot_set
                            .extend(self.read_postings(posting_key(address, i as u8, topic)));
                    }
                    set = set.intersection(&slot_set).copied().collect();
                }
                set.into_iter()
                    .filter(|(block, _)| *block >= filter.from_block && *block <= to_block)
                    .collect()
            }
            None => {
                let mut out = Vec::new();
                for number in filter.from_block..=to_block {
                    for (index, _) in self.block_logs(number)?.iter().enumerate() {
                        out.push((number, index as u64));
                    }
                }
                out
            }
        };

        let mut out = Vec::new();
        let mut current: Option<(u64, Vec<Log>)> = None;
        for (number, index) in candidates {
            if current.as_ref().map(|(n, _)| *n) != Some(number) {
                current = Some((number, self.block_logs(number)?));
            }
            let logs = &current.as_ref().expect("just set").1;
            let Some(log) = logs.get(index as usize) else {
                continue;
            };
            if matches(log, filter) {
                out.push(log.clone());
            }
        }
        Ok(out)
    }

    /// All logs of one block, flattened across receipts in emission order.
    fn block_logs(&self, number: u64) -> Result<Vec<Log>, ChainError> {
        let block = self.block_by_number(number)?;
        let mut logs = Vec::new();
        for tx in &block.transactions {
            logs.extend(self.receipt(&tx.hash)?.logs);
        }
        Ok(logs)
    }

    fn read_postings(&self, key: Vec<u8>) -> Vec<(u64, u64)> {
        self.kv
            .get(&key)
            .and_then(|bytes| decode_postings(&bytes).ok())
            .unwrap_or_default()
    }
}

fn matches(log: &Log, filter: &LogFilter) -> bool {
    if let Some(address) = &filter.address {
        if log.address != *address {
            return false;
        }
    }
    if log.block_number < filter.from_block || log.block_number > filter.to_block {
        return false;
    }
    filter
        .topics
        .iter()
        .enumerate()
        .all(|(i, slot)| slot.matches(log.topics.get(i)))
}

fn posting_key(address: &Address, topic_index: u8, topic: &Hash) -> Vec<u8> {
    let mut suffix = Vec::with_capacity(20 + 1 + 32);
    suffix.extend_from_slice(&address.0);
    suffix.push(topic_index);
    suffix.extend_from_slice(&topic.0);
    key(column::LOGS, &suffix)
}

fn encode_postings(postings: &[(u64, u64)]) -> Vec<u8> {
    let mut s = rlp::RlpStream::new_list(postings.len());
    for (block, index) in postings {
        s.begin_list(2);
        s.append(block);
        s.append(index);
    }
    s.out().to_vec()
}

fn decode_postings(bytes: &[u8]) -> Result<Vec<(u64, u64)>, rlp::DecoderError> {
    let rlp = rlp::Rlp::new(bytes);
    let mut out = Vec::with_capacity(rlp.item_count()?);
    for item in rlp.iter() {
        out.push((item.val_at(0)?, item.val_at(1)?));
    }
    Ok(out)
}

fn decode_number(bytes: &[u8]) -> Result<u64, ChainError> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| ChainError::Codec(rlp::DecoderError::RlpInvalidLength))?;
    Ok(u64::from_be_bytes(array))
}
