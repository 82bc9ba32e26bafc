//! In-process Ethereum provider: a node substitute that executes
//! transactions against a persisted world state, assembles blocks and
//! answers the JSON-RPC subset contract tests need.
//!
//! The pieces, leaves first: a byte-keyed [`kv`] backend; an authenticated
//! [`trie`] over it; the [`state`] module's world state and transactional
//! overlay; the [`executor`]'s frame-stack interpreter; the [`processor`]
//! driving one transaction through validation, execution and settlement;
//! the [`chain`] block log with its receipt and log indices; and the
//! [`rpc`]/[`provider`] dispatch surface tying them together.

pub mod chain;
pub mod common;
pub mod decoder;
pub mod executor;
pub mod gas;
pub mod kv;
pub mod opcodes;
pub mod processor;
pub mod provider;
pub mod rpc;
pub mod state;
pub mod trie;

pub use common::{Address, Hash, Hex, Word, addr, word};
pub use provider::{Provider, ProviderBuilder, ProviderError};
pub use rpc::{BlockTag, FilterRequest, RpcError, TransactionRequest};
