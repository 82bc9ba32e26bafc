use std::sync::Arc;

use serde_json::{Value, json};
use thiserror::Error;

use crate::{
    chain::{Blockchain, ChainError, LogFilter},
    common::{Hex, address::Address, block::Block, call::Call, hash::Hash, tx::Receipt, word::Word},
    executor::Executor,
    kv::{KvBackend, MemoryKv, column, key},
    processor::{ChainConfig, Processor, TxRequest},
    rpc::{BlockTag, FilterRequest, Request, RpcError, TransactionRequest},
    state::{StateError, WorldState},
};

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("{0}")]
    State(#[from] StateError),
    #[error("{0}")]
    Chain(#[from] ChainError),
}

/// The in-process node: world state, block log and transaction pipeline
/// behind the JSON-RPC methods contract tests use. Construct with
/// [`Provider::builder`]; callers inject the KV backend, nothing ambient.
pub struct Provider {
    state: WorldState,
    chain: Blockchain,
    config: ChainConfig,
}

pub struct ProviderBuilder {
    kv: Option<Arc<dyn KvBackend>>,
    config: ChainConfig,
    funds: Vec<(Address, Word)>,
}

impl ProviderBuilder {
    pub fn with_kv(mut self, kv: Arc<dyn KvBackend>) -> Self {
        self.kv = Some(kv);
        self
    }

    pub fn with_chain_id(mut self, chain_id: u64) -> Self {
        self.config.chain_id = chain_id;
        self
    }

    pub fn with_gas_price(mut self, gas_price: Word) -> Self {
        self.config.gas_price = gas_price;
        self
    }

    pub fn with_gas_limit(mut self, gas_limit: u64) -> Self {
        self.config.gas_limit = gas_limit;
        self
    }

    /// Pre-fund an account in the genesis state. Applied only when the
    /// backend holds no chain yet.
    pub fn fund(mut self, address: Address, balance: Word) -> Self {
        self.funds.push((address, balance));
        self
    }

    pub fn ready(self) -> Result<Provider, ProviderError> {
        let kv = self.kv.unwrap_or_else(|| Arc::new(MemoryKv::new()));
        let fresh = kv.get(&key(column::META, b"latest")).is_none();

        let mut state = WorldState::open(kv.clone());
        if fresh && !self.funds.is_empty() {
            let mut overlay = state.snapshot();
            for (address, balance) in &self.funds {
                overlay.credit(address, *balance)?;
            }
            state.commit(overlay.into_changes())?;
        }

        let chain = Blockchain::open(kv, state.root())?;

        Ok(Provider {
            state,
            chain,
            config: self.config,
        })
    }
}

impl Provider {
    pub fn builder() -> ProviderBuilder {
        ProviderBuilder {
            kv: None,
            config: ChainConfig::default(),
            funds: Vec::new(),
        }
    }

    /// Fresh provider on an in-memory backend.
    pub fn in_memory() -> Result<Self, ProviderError> {
        Self::builder().ready()
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn state(&self) -> &WorldState {
        &self.state
    }

    pub fn chain(&self) -> &Blockchain {
        &self.chain
    }

    /// Single entry point: parse, dispatch, encode. All semantics live in
    /// the components; this is a thin adapter.
    pub fn dispatch(&mut self, method: &str, params: &Value) -> Result<Value, RpcError> {
        match Request::parse(method, params)? {
            Request::GasPrice => Ok(json!(self.config.gas_price)),
            Request::BlockNumber => Ok(json!(format!("{:#x}", self.chain.latest_number()))),
            Request::ChainId => Ok(json!(format!("{:#x}", self.config.chain_id))),
            Request::SendTransaction(request) => {
                let receipt = self.send_transaction(request)?;
                Ok(json!(receipt.tx_hash))
            }
            Request::Call(request, tag) => {
                let ret = self.call(&request, tag)?;
                Ok(json!(Hex(ret)))
            }
            Request::GetTransactionReceipt(tx_hash) => match self.chain.receipt(&tx_hash) {
                Ok(receipt) => Ok(serde_json::to_value(receipt)?),
                Err(ChainError::UnknownTransaction) => Ok(Value::Null),
                Err(e) => Err(e.into()),
            },
            Request::GetCode(address, tag) => {
                let root = self.root_at(tag)?;
                Ok(json!(Hex(self.state.code_at(&root, &address)?)))
            }
            Request::GetBalance(address, tag) => {
                let root = self.root_at(tag)?;
                Ok(json!(self.state.account_at(&root, &address)?.balance))
            }
            Request::GetTransactionCount(address, tag) => {
                let root = self.root_at(tag)?;
                let nonce = self.state.account_at(&root, &address)?.nonce;
                Ok(json!(format!("{nonce:#x}")))
            }
            Request::GetStorageAt(address, slot, tag) => {
                let root = self.root_at(tag)?;
                let value = self.state.storage_at(&root, &address, &slot)?;
                Ok(json!(Hex(value.into_bytes().to_vec())))
            }
            Request::GetLogs(filter) => {
                let logs = self.logs(&filter)?;
                Ok(serde_json::to_value(logs)?)
            }
            Request::GetBlockByNumber(tag, full) => {
                let number = self.block_number_at(tag);
                match self.chain.block_by_number(number) {
                    Ok(block) => Ok(block_to_value(&block, full)?),
                    Err(ChainError::UnknownBlock) => Ok(Value::Null),
                    Err(e) => Err(e.into()),
                }
            }
            Request::GetBlockByHash(hash, full) => match self.chain.block_by_hash(&hash) {
                Ok(block) => Ok(block_to_value(&block, full)?),
                Err(ChainError::UnknownBlock) => Ok(Value::Null),
                Err(e) => Err(e.into()),
            },
        }
    }

    /// Execute a transaction immediately; block and receipt are readable
    /// once this returns.
    pub fn send_transaction(&mut self, request: TransactionRequest) -> Result<Receipt, RpcError> {
        let request = self.to_tx_request(request);
        let receipt = Processor::new(&mut self.state, &mut self.chain, &self.config)
            .process(request)?;
        Ok(receipt)
    }

    /// Read-only execution against the state at `tag`. Returns whatever the
    /// frame returned, including a REVERT payload; nothing is committed.
    pub fn call(&self, request: &TransactionRequest, tag: BlockTag) -> Result<Vec<u8>, RpcError> {
        let to = request
            .to
            .ok_or_else(|| RpcError::BadParams("call requires 'to'".into()))?;
        let number = self.block_number_at(tag);
        let header = self.chain.block_by_number(number)?.header;

        let env = crate::executor::BlockEnv {
            number: header.number,
            timestamp: header.timestamp,
            gas_limit: self.config.gas_limit,
            chain_id: self.config.chain_id,
            coinbase: self.config.coinbase,
            parent_hash: header.parent_hash,
            gas_price: request.gas_price.unwrap_or(self.config.gas_price),
        };
        let from = request.from.unwrap_or_default();
        let call = Call {
            from,
            to,
            value: request.value.unwrap_or_default(),
            data: request.data.clone().map(Hex::into_vec).unwrap_or_default(),
            gas: request
                .gas
                .map(|gas| gas.as_u64_saturating())
                .unwrap_or(self.config.gas_limit),
        };

        let mut overlay = self.state.snapshot_at(header.state_root);
        let outcome = Executor::new(&env, from).call(&mut overlay, &call)?;
        Ok(outcome.ret)
    }

    pub fn receipt(&self, tx_hash: &Hash) -> Result<Receipt, RpcError> {
        Ok(self.chain.receipt(tx_hash)?)
    }

    pub fn logs(&self, filter: &FilterRequest) -> Result<Vec<crate::common::tx::Log>, RpcError> {
        let (from, to) = filter.block_tags()?;
        let filter = LogFilter {
            from_block: self.block_number_at(from.unwrap_or(BlockTag::Latest)),
            to_block: self.block_number_at(to.unwrap_or(BlockTag::Latest)),
            address: filter.address,
            topics: filter.topic_filters()?,
        };
        Ok(self.chain.logs(&filter)?)
    }

    fn to_tx_request(&self, request: TransactionRequest) -> TxRequest {
        TxRequest {
            from: request.from,
            to: request.to,
            value: request.value.unwrap_or_default(),
            gas: request
                .gas
                .map(|gas| gas.as_u64_saturating())
                .unwrap_or(self.config.gas_limit),
            gas_price: request.gas_price.unwrap_or(self.config.gas_price),
            data: request.data.map(Hex::into_vec).unwrap_or_default(),
            nonce: request.nonce.map(|nonce| nonce.as_u64_saturating()),
        }
    }

    fn block_number_at(&self, tag: BlockTag) -> u64 {
        match tag {
            BlockTag::Latest => self.chain.latest_number(),
            BlockTag::Number(number) => number,
        }
    }

    fn root_at(&self, tag: BlockTag) -> Result<Hash, RpcError> {
        match tag {
            BlockTag::Latest => Ok(self.state.root()),
            BlockTag::Number(number) => {
                Ok(self.chain.block_by_number(number)?.header.state_root)
            }
        }
    }
}

fn block_to_value(block: &Block, full_transactions: bool) -> Result<Value, RpcError> {
    let mut value = serde_json::to_value(block)?;
    if !full_transactions {
        let hashes: Vec<Hash> = block.transactions.iter().map(|tx| tx.hash).collect();
        value["transactions"] = json!(hashes);
    }
    Ok(value)
}
