use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::{
    chain::{ChainError, TopicFilter},
    common::{Hex, address::Address, hash::Hash, word::Word},
    executor::ExecutorError,
    processor::{InvalidTransaction, ProcessorError},
    state::StateError,
};

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Method not found: {0}")]
    MethodNotFound(String),
    #[error("Bad params: {0}")]
    BadParams(String),
    #[error("Invalid transaction: {0}")]
    Transaction(#[from] InvalidTransaction),
    #[error("{0}")]
    Chain(#[from] ChainError),
    #[error("{0}")]
    State(#[from] StateError),
    #[error("serialization: {0}")]
    Codec(#[from] serde_json::Error),
}

impl From<ProcessorError> for RpcError {
    fn from(e: ProcessorError) -> Self {
        match e {
            ProcessorError::InvalidTransaction(e) => RpcError::Transaction(e),
            ProcessorError::State(e) => RpcError::State(e),
            ProcessorError::Executor(ExecutorError::State(e)) => RpcError::State(e),
            ProcessorError::Chain(e) => RpcError::Chain(e),
        }
    }
}

impl From<ExecutorError> for RpcError {
    fn from(e: ExecutorError) -> Self {
        let ExecutorError::State(e) = e;
        RpcError::State(e)
    }
}

/// Block selector accepted wherever the API takes a block parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockTag {
    Latest,
    Number(u64),
}

impl BlockTag {
    fn parse(value: &Value) -> Result<Self, RpcError> {
        let Some(tag) = value.as_str() else {
            return Err(RpcError::BadParams("block parameter must be a string".into()));
        };
        match tag {
            "latest" | "pending" => Ok(BlockTag::Latest),
            "earliest" => Ok(BlockTag::Number(0)),
            hex => u64::from_str_radix(hex.trim_start_matches("0x"), 16)
                .map(BlockTag::Number)
                .map_err(|_| RpcError::BadParams(format!("bad block number '{hex}'"))),
        }
    }
}

/// `eth_sendTransaction` / `eth_call` parameter object.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct TransactionRequest {
    pub from: Option<Address>,
    pub to: Option<Address>,
    pub gas: Option<Word>,
    #[serde(rename = "gasPrice")]
    pub gas_price: Option<Word>,
    pub value: Option<Word>,
    #[serde(alias = "input")]
    pub data: Option<Hex>,
    pub nonce: Option<Word>,
}

/// `eth_getLogs` parameter object, topics still in wire shape.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct FilterRequest {
    #[serde(rename = "fromBlock")]
    pub from_block: Option<Value>,
    #[serde(rename = "toBlock")]
    pub to_block: Option<Value>,
    pub address: Option<Address>,
    pub topics: Option<Vec<Value>>,
}

impl FilterRequest {
    pub fn block_tags(&self) -> Result<(Option<BlockTag>, Option<BlockTag>), RpcError> {
        let parse = |value: &Option<Value>| -> Result<Option<BlockTag>, RpcError> {
            value.as_ref().map(BlockTag::parse).transpose()
        };
        Ok((parse(&self.from_block)?, parse(&self.to_block)?))
    }

    pub fn topic_filters(&self) -> Result<Vec<TopicFilter>, RpcError> {
        let Some(topics) = &self.topics else {
            return Ok(Vec::new());
        };
        topics
            .iter()
            .map(|slot| match slot {
                Value::Null => Ok(TopicFilter::Any),
                Value::String(_) => Ok(TopicFilter::One(serde_json::from_value(slot.clone())?)),
                Value::Array(values) => {
                    let hashes = values
                        .iter()
                        .map(|v| serde_json::from_value(v.clone()).map_err(RpcError::from))
                        .collect::<Result<Vec<Hash>, _>>()?;
                    Ok(TopicFilter::Set(hashes))
                }
                _ => Err(RpcError::BadParams(
                    "topic must be null, a hash or an array of hashes".into(),
                )),
            })
            .collect()
    }
}

/// One variant per served method; the dispatcher pattern-matches on these
/// instead of strings.
#[derive(Clone, Debug)]
pub enum Request {
    GasPrice,
    BlockNumber,
    ChainId,
    SendTransaction(TransactionRequest),
    Call(TransactionRequest, BlockTag),
    GetTransactionReceipt(Hash),
    GetCode(Address, BlockTag),
    GetBalance(Address, BlockTag),
    GetTransactionCount(Address, BlockTag),
    GetStorageAt(Address, Word, BlockTag),
    GetLogs(FilterRequest),
    GetBlockByNumber(BlockTag, bool),
    GetBlockByHash(Hash, bool),
}

impl Request {
    pub fn parse(method: &str, params: &Value) -> Result<Self, RpcError> {
        let params: &[Value] = match params {
            Value::Array(values) => values,
            Value::Null => &[],
            _ => return Err(RpcError::BadParams("params must be an array".into())),
        };
        match method {
            "eth_gasPrice" => Ok(Request::GasPrice),
            "eth_blockNumber" => Ok(Request::BlockNumber),
            "eth_chainId" => Ok(Request::ChainId),
            "eth_sendTransaction" => Ok(Request::SendTransaction(param(params, 0, "transaction")?)),
            "eth_call" => Ok(Request::Call(
                param(params, 0, "call request")?,
                block_param(params, 1)?,
            )),
            "eth_getTransactionReceipt" => {
                Ok(Request::GetTransactionReceipt(param(params, 0, "tx hash")?))
            }
            "eth_getCode" => Ok(Request::GetCode(
                param(params, 0, "address")?,
                block_param(params, 1)?,
            )),
            "eth_getBalance" => Ok(Request::GetBalance(
                param(params, 0, "address")?,
                block_param(params, 1)?,
            )),
            "eth_getTransactionCount" => Ok(Request::GetTransactionCount(
                param(params, 0, "address")?,
                block_param(params, 1)?,
            )),
            "eth_getStorageAt" => Ok(Request::GetStorageAt(
                param(params, 0, "address")?,
                param(params, 1, "storage slot")?,
                block_param(params, 2)?,
            )),
            "eth_getLogs" => Ok(Request::GetLogs(param(params, 0, "filter")?)),
            "eth_getBlockByNumber" => Ok(Request::GetBlockByNumber(
                params
                    .first()
                    .map(BlockTag::parse)
                    .transpose()?
                    .ok_or_else(|| RpcError::BadParams("missing block parameter".into()))?,
                opt_param(params, 1)?.unwrap_or(false),
            )),
            "eth_getBlockByHash" => Ok(Request::GetBlockByHash(
                param(params, 0, "block hash")?,
                opt_param(params, 1)?.unwrap_or(false),
            )),
            _ => Err(RpcError::MethodNotFound(method.to_string())),
        }
    }
}

fn param<T: serde::de::DeserializeOwned>(
    params: &[Value],
    index: usize,
    name: &str,
) -> Result<T, RpcError> {
    let value = params
        .get(index)
        .ok_or_else(|| RpcError::BadParams(format!("missing {name} at position {index}")))?;
    serde_json::from_value(value.clone())
        .map_err(|e| RpcError::BadParams(format!("bad {name}: {e}")))
}

fn opt_param<T: serde::de::DeserializeOwned>(
    params: &[Value],
    index: usize,
) -> Result<Option<T>, RpcError> {
    match params.get(index) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|e| RpcError::BadParams(format!("bad parameter {index}: {e}"))),
    }
}

fn block_param(params: &[Value], index: usize) -> Result<BlockTag, RpcError> {
    match params.get(index) {
        None | Some(Value::Null) => Ok(BlockTag::Latest),
        Some(value) => BlockTag::parse(value),
    }
}
