use thiserror::Error;

use crate::{
    chain::{Blockchain, ChainError},
    common::{
        Hex,
        address::Address,
        block::{Block, Header},
        hash::Hash,
        tx::{Log, Receipt, Transaction},
        word::Word,
    },
    executor::{BlockEnv, Executor, ExecutorError},
    gas,
    state::{StateError, WorldState},
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidTransaction {
    #[error("missing sender")]
    MissingSender,
    #[error("nonce mismatch: account is at {expected}, transaction says {got}")]
    NonceMismatch { expected: u64, got: u64 },
    #[error("insufficient funds: balance {balance}, transaction needs {required}")]
    InsufficientFunds { balance: Word, required: Word },
    #[error("gas limit {gas} below intrinsic cost {intrinsic}")]
    IntrinsicGas { gas: u64, intrinsic: u64 },
}

#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(#[from] InvalidTransaction),
    #[error("{0}")]
    State(#[from] StateError),
    #[error("{0}")]
    Executor(#[from] ExecutorError),
    #[error("{0}")]
    Chain(#[from] ChainError),
}

/// A transaction as submitted; the processor fills the gaps.
#[derive(Clone, Debug, Default)]
pub struct TxRequest {
    pub from: Option<Address>,
    pub to: Option<Address>,
    pub value: Word,
    pub gas: u64,
    pub gas_price: Word,
    pub data: Vec<u8>,
    pub nonce: Option<u64>,
}

/// Chain-wide parameters shared by the processor and the RPC surface.
#[derive(Clone, Debug)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub gas_limit: u64,
    /// The fixed value `eth_gasPrice` reports and unpriced transactions pay.
    pub gas_price: Word,
    pub coinbase: Address,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            chain_id: 1337,
            gas_limit: 6_721_975,
            gas_price: Word::from(50_000u64),
            coinbase: Address::zero(),
        }
    }
}

/// What one executed transaction did, before packaging into a receipt.
struct TxResult {
    success: bool,
    gas_used: u64,
    created: Option<Address>,
    logs: Vec<Log>,
}

/// Drives one transaction through validation, execution and settlement,
/// then seals a single-transaction block around it.
pub struct Processor<'a> {
    state: &'a mut WorldState,
    chain: &'a mut Blockchain,
    config: &'a ChainConfig,
}

impl<'a> Processor<'a> {
    pub fn new(
        state: &'a mut WorldState,
        chain: &'a mut Blockchain,
        config: &'a ChainConfig,
    ) -> Self {
        Self {
            state,
            chain,
            config,
        }
    }

    /// Validate, execute, settle fees, commit state and append the block.
    /// A reverted execution still advances the nonce, pays the fee and
    /// appends a status-0 receipt; a validation failure changes nothing.
    pub fn process(&mut self, request: TxRequest) -> Result<Receipt, ProcessorError> {
        let from = request.from.ok_or(InvalidTransaction::MissingSender)?;
        let account = self.state.get_account(&from)?;

        let nonce = request.nonce.unwrap_or(account.nonce);
        if nonce != account.nonce {
            return Err(InvalidTransaction::NonceMismatch {
                expected: account.nonce,
                got: nonce,
            }
            .into());
        }
        let required =
            Word::from(request.gas) * request.gas_price + request.value;
        if account.balance < required {
            return Err(InvalidTransaction::InsufficientFunds {
                balance: account.balance,
                required,
            }
            .into());
        }
        let intrinsic = gas::intrinsic_gas(&request.data, request.to.is_none());
        if request.gas < intrinsic {
            return Err(InvalidTransaction::IntrinsicGas {
                gas: request.gas,
                intrinsic,
            }
            .into());
        }

        let mut tx = Transaction {
            hash: Hash::zero(),
            from,
            to: request.to,
            nonce,
            value: request.value,
            gas: request.gas,
            gas_price: request.gas_price,
            data: Hex(request.data),
        };
        tx.hash = tx.compute_hash();

        let parent = self.chain.latest_header()?;
        let env = BlockEnv {
            number: parent.number + 1,
            timestamp: next_timestamp(parent.timestamp),
            gas_limit: self.config.gas_limit,
            chain_id: self.config.chain_id,
            coinbase: self.config.coinbase,
            parent_hash: parent.hash,
            gas_price: tx.gas_price,
        };

        let base_root = self.state.root();
        let (changes, result) = apply_tx(self.state, &env, base_root, &tx, self.config)?;
        let state_root = self.state.commit(changes)?;

        let (block, receipt) = seal(&env, state_root, tx, result);
        self.chain.append(&block, std::slice::from_ref(&receipt))?;
        tracing::info!(
            tx = %receipt.tx_hash,
            block = block.header.number,
            status = receipt.status,
            gas_used = receipt.gas_used,
            "transaction processed"
        );
        Ok(receipt)
    }

    /// Re-execute a committed block against its parent state and return the
    /// recomputed state root and receipt. Persists nothing.
    pub fn replay(&mut self, number: u64) -> Result<(Hash, Receipt), ProcessorError> {
        let block = self.chain.block_by_number(number)?;
        let parent = self.chain.block_by_number(number.wrapping_sub(1))?;
        let tx = block
            .transactions
            .first()
            .ok_or(ChainError::UnknownTransaction)?
            .clone();

        let env = BlockEnv {
            number: block.header.number,
            timestamp: block.header.timestamp,
            gas_limit: block.header.gas_limit,
            chain_id: self.config.chain_id,
            coinbase: self.config.coinbase,
            parent_hash: block.header.parent_hash,
            gas_price: tx.gas_price,
        };

        let base_root = parent.header.state_root;
        let (changes, result) = apply_tx(self.state, &env, base_root, &tx, self.config)?;
        let state_root = self.state.preview_root(base_root, changes)?;
        let (_, receipt) = seal(&env, state_root, tx, result);
        Ok((state_root, receipt))
    }
}

/// Run one validated transaction against `base_root`: pre-charge the fee,
/// bump the nonce, execute, settle the refund and the coinbase fee. The
/// returned changes hold everything that survives (all of it on success,
/// fees and nonce only after a revert).
fn apply_tx(
    state: &WorldState,
    env: &BlockEnv,
    base_root: Hash,
    tx: &Transaction,
    config: &ChainConfig,
) -> Result<(crate::state::Changes, TxResult), ProcessorError> {
    let mut overlay = state.snapshot_at(base_root);

    let prepaid = Word::from(tx.gas) * tx.gas_price;
    if !overlay.debit(&tx.from, prepaid)? {
        // the balance was validated against the current root
        return Err(InvalidTransaction::InsufficientFunds {
            balance: overlay.balance(&tx.from)?,
            required: prepaid,
        }
        .into());
    }
    overlay.bump_nonce(&tx.from)?;

    let intrinsic = gas::intrinsic_gas(&tx.data.0, tx.to.is_none());
    let exec_gas = tx.gas - intrinsic;
    let call = crate::common::call::Call {
        from: tx.from,
        to: tx.to.unwrap_or_default(),
        value: tx.value,
        data: tx.data.0.clone(),
        gas: exec_gas,
    };

    let executor = Executor::new(env, tx.from);
    let outcome = match tx.to {
        Some(_) => executor.call(&mut overlay, &call)?,
        None => {
            let address = tx.from.create(tx.nonce);
            executor.create(&mut overlay, &call, address)?
        }
    };

    let mut gas_used = intrinsic + (exec_gas - outcome.gas_left);
    if outcome.success {
        // refunds pay out at most half of what was spent
        let refund = overlay.refund().min(gas_used / 2);
        gas_used -= refund;
    }
    overlay.credit(&tx.from, Word::from(tx.gas - gas_used) * tx.gas_price)?;
    overlay.credit(&config.coinbase, Word::from(gas_used) * tx.gas_price)?;

    let logs = if outcome.success {
        overlay.logs()
    } else {
        Vec::new()
    };

    Ok((
        overlay.into_changes(),
        TxResult {
            success: outcome.success,
            gas_used,
            created: outcome.created.filter(|_| outcome.success),
            logs,
        },
    ))
}

/// Build the block and receipt for one executed transaction, stamping the
/// logs with their final position.
fn seal(env: &BlockEnv, state_root: Hash, tx: Transaction, result: TxResult) -> (Block, Receipt) {
    let mut block = Block {
        header: Header {
            number: env.number,
            parent_hash: env.parent_hash,
            timestamp: env.timestamp,
            state_root,
            gas_limit: env.gas_limit,
            gas_used: result.gas_used,
            ..Default::default()
        },
        transactions: vec![tx.clone()],
    };
    block.header.hash = block.header.compute_hash();

    let logs = result
        .logs
        .into_iter()
        .enumerate()
        .map(|(i, mut log)| {
            log.block_number = block.header.number;
            log.block_hash = block.header.hash;
            log.tx_hash = tx.hash;
            log.tx_index = 0;
            log.log_index = i as u64;
            log
        })
        .collect();

    let receipt = Receipt {
        tx_hash: tx.hash,
        tx_index: 0,
        block_number: block.header.number,
        block_hash: block.header.hash,
        from: tx.from,
        to: tx.to,
        contract_address: result.created,
        gas_used: result.gas_used,
        cumulative_gas_used: result.gas_used,
        status: result.success as u64,
        logs,
    };
    (block, receipt)
}

fn next_timestamp(parent: u64) -> u64 {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    now.max(parent + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::addr;
    use crate::kv::MemoryKv;
    use std::sync::Arc;

    fn setup(balance: u64) -> (WorldState, Blockchain, ChainConfig, Address) {
        let kv: Arc<dyn crate::kv::KvBackend> = Arc::new(MemoryKv::new());
        let mut state = WorldState::open(kv.clone());
        let sender = addr("f39fd6e51aad88f6f4ce6ab8827279cfffb92266");
        let mut overlay = state.snapshot();
        overlay
            .credit(&sender, Word::from(balance) * Word::from(1_000_000_000_000u64))
            .unwrap();
        state.commit(overlay.into_changes()).unwrap();
        let chain = Blockchain::open(kv, state.root()).unwrap();
        (state, chain, ChainConfig::default(), sender)
    }

    fn transfer_request(from: Address, to: Address, value: u64) -> TxRequest {
        TxRequest {
            from: Some(from),
            to: Some(to),
            value: Word::from(value),
            gas: 100_000,
            gas_price: Word::from(50_000u64),
            data: vec![],
            nonce: None,
        }
    }

    #[test]
    fn test_plain_transfer() {
        let (mut state, mut chain, config, sender) = setup(1_000_000);
        let to = addr("c80a141ce8a5b73371043cba5cee40437975bb37");

        let receipt = Processor::new(&mut state, &mut chain, &config)
            .process(transfer_request(sender, to, 1234))
            .unwrap();

        assert_eq!(receipt.status, 1);
        assert_eq!(receipt.block_number, 1);
        assert_eq!(receipt.gas_used, 21_000);
        assert_eq!(state.get_account(&to).unwrap().balance, Word::from(1234u64));
        assert_eq!(state.get_account(&sender).unwrap().nonce, 1);
        assert_eq!(chain.latest_number(), 1);
        assert_eq!(
            chain.block_by_number(1).unwrap().header.state_root,
            state.root()
        );
    }

    #[test]
    fn test_fee_goes_to_coinbase_and_totals_conserve() {
        let (mut state, mut chain, config, sender) = setup(1_000_000);
        let to = addr("c80a141ce8a5b73371043cba5cee40437975bb37");
        let before = state.get_account(&sender).unwrap().balance;

        let receipt = Processor::new(&mut state, &mut chain, &config)
            .process(transfer_request(sender, to, 1000))
            .unwrap();

        let fee = Word::from(receipt.gas_used) * Word::from(50_000u64);
        let sender_after = state.get_account(&sender).unwrap().balance;
        let to_after = state.get_account(&to).unwrap().balance;
        let coinbase_after = state.get_account(&config.coinbase).unwrap().balance;

        assert_eq!(coinbase_after, fee);
        assert_eq!(before, sender_after + to_after + fee);
    }

    #[test]
    fn test_nonce_mismatch_rejected_without_side_effects() {
        let (mut state, mut chain, config, sender) = setup(1_000_000);
        let to = addr("c80a141ce8a5b73371043cba5cee40437975bb37");
        let root_before = state.root();

        let mut request = transfer_request(sender, to, 1);
        request.nonce = Some(1); // account is at 0
        let err = Processor::new(&mut state, &mut chain, &config)
            .process(request)
            .unwrap_err();

        assert!(matches!(
            err,
            ProcessorError::InvalidTransaction(InvalidTransaction::NonceMismatch { .. })
        ));
        assert_eq!(state.root(), root_before, "no state change");
        assert_eq!(chain.latest_number(), 0, "no block appended");
        assert_eq!(state.get_account(&sender).unwrap().nonce, 0);
    }

    #[test]
    fn test_insufficient_funds_rejected() {
        let (mut state, mut chain, config, sender) = setup(0);
        let to = addr("c80a141ce8a5b73371043cba5cee40437975bb37");
        let err = Processor::new(&mut state, &mut chain, &config)
            .process(transfer_request(sender, to, 1))
            .unwrap_err();
        assert!(matches!(
            err,
            ProcessorError::InvalidTransaction(InvalidTransaction::InsufficientFunds { .. })
        ));
    }

    #[test]
    fn test_reverting_tx_appends_status_zero_block() {
        let (mut state, mut chain, config, sender) = setup(1_000_000);
        // deploy a contract that always reverts: PUSH1 0 PUSH1 0 REVERT
        let runtime = [0x60, 0x00, 0x60, 0x00, 0xfd];
        let initcode = initcode_for(&runtime);

        let deploy = TxRequest {
            from: Some(sender),
            to: None,
            value: Word::zero(),
            gas: 1_000_000,
            gas_price: Word::from(50_000u64),
            data: initcode,
            nonce: None,
        };
        let receipt = Processor::new(&mut state, &mut chain, &config)
            .process(deploy)
            .unwrap();
        assert_eq!(receipt.status, 1);
        let contract = receipt.contract_address.unwrap();
        assert!(!state.get_code(&contract).unwrap().is_empty());

        let receipt = Processor::new(&mut state, &mut chain, &config)
            .process(TxRequest {
                from: Some(sender),
                to: Some(contract),
                value: Word::zero(),
                gas: 100_000,
                gas_price: Word::from(50_000u64),
                data: vec![],
                nonce: None,
            })
            .unwrap();

        assert_eq!(receipt.status, 0);
        assert!(receipt.logs.is_empty());
        assert_eq!(chain.latest_number(), 2, "block appended despite revert");
        assert_eq!(state.get_account(&sender).unwrap().nonce, 2, "nonce advanced");
    }

    #[test]
    fn test_create_collision_consumes_gas_and_bumps_nonce() {
        let (mut state, mut chain, config, sender) = setup(1_000_000);
        // occupy the address the sender's nonce-0 CREATE would take
        let target = sender.create(0);
        let mut overlay = state.snapshot();
        overlay.deploy_code(&target, vec![0x00]).unwrap();
        state.commit(overlay.into_changes()).unwrap();

        let receipt = Processor::new(&mut state, &mut chain, &config)
            .process(TxRequest {
                from: Some(sender),
                to: None,
                value: Word::zero(),
                gas: 200_000,
                gas_price: Word::from(50_000u64),
                data: vec![0x00],
                nonce: None,
            })
            .unwrap();

        assert_eq!(receipt.status, 0);
        assert_eq!(receipt.contract_address, None);
        assert_eq!(state.get_account(&sender).unwrap().nonce, 1);
        assert_eq!(receipt.gas_used, 200_000, "collision burns the gas limit");
    }

    #[test]
    fn test_replay_reproduces_root_and_receipt() {
        let (mut state, mut chain, config, sender) = setup(1_000_000);
        let to = addr("c80a141ce8a5b73371043cba5cee40437975bb37");
        let receipt = Processor::new(&mut state, &mut chain, &config)
            .process(transfer_request(sender, to, 777))
            .unwrap();

        let (root, replayed) = Processor::new(&mut state, &mut chain, &config)
            .replay(1)
            .unwrap();
        assert_eq!(root, chain.block_by_number(1).unwrap().header.state_root);
        assert_eq!(replayed, receipt);
    }

    fn initcode_for(runtime: &[u8]) -> Vec<u8> {
        // PUSH1 len PUSH1 offset PUSH1 0 CODECOPY PUSH1 len PUSH1 0 RETURN
        let len = runtime.len() as u8;
        let mut code = vec![
            0x60, len, 0x60, 0x0c, 0x60, 0x00, 0x39, 0x60, len, 0x60, 0x00, 0xf3,
        ];
        code.extend_from_slice(runtime);
        code
    }
}
