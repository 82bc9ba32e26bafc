use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;

use crate::{
    common::{
        account::Account,
        address::Address,
        hash::{EMPTY_CODE_HASH, EMPTY_TRIE_ROOT, Hash, keccak256},
        tx::Log,
        word::Word,
    },
    kv::{KvBackend, WriteBatch, column, key},
    trie::{Trie, TrieError},
};

#[derive(Error, Debug)]
pub enum StateError {
    #[error("{0}")]
    Trie(#[from] TrieError),
    #[error("Missing code {0}")]
    MissingCode(Hash),
    #[error("Undecodable state entry: {0}")]
    Codec(#[from] rlp::DecoderError),
}

/// The persisted world: a trie of accounts, a storage trie per account and
/// a content-addressed code table, all on one KV backend.
pub struct WorldState {
    kv: Arc<dyn KvBackend>,
    trie: Trie,
    root: Hash,
}

impl WorldState {
    /// Recover from the `M|state_root` pointer, or start empty.
    pub fn open(kv: Arc<dyn KvBackend>) -> Self {
        let root = kv
            .get(&key(column::META, b"state_root"))
            .and_then(|bytes| Hash::from_slice(&bytes))
            .unwrap_or(EMPTY_TRIE_ROOT);
        Self {
            trie: Trie::new(kv.clone()),
            kv,
            root,
        }
    }

    pub fn root(&self) -> Hash {
        self.root
    }

    pub fn get_account(&self, addr: &Address) -> Result<Account, StateError> {
        self.account_at(&self.root, addr)
    }

    pub fn get_storage(&self, addr: &Address, slot: &Word) -> Result<Word, StateError> {
        self.storage_at(&self.root, addr, slot)
    }

    pub fn get_code(&self, addr: &Address) -> Result<Vec<u8>, StateError> {
        self.code_at(&self.root, addr)
    }

    /// Account under a specific (possibly historical) state root; a zeroed
    /// default when absent.
    pub fn account_at(&self, root: &Hash, addr: &Address) -> Result<Account, StateError> {
        match self.trie.get(root, &addr.0)? {
            Some(bytes) => Ok(rlp::decode(&bytes)?),
            None => Ok(Account::default()),
        }
    }

    pub fn storage_at(
        &self,
        root: &Hash,
        addr: &Address,
        slot: &Word,
    ) -> Result<Word, StateError> {
        let account = self.account_at(root, addr)?;
        match self.trie.get(&account.storage_root, &slot.into_bytes())? {
            Some(bytes) => Ok(rlp::decode(&bytes)?),
            None => Ok(Word::zero()),
        }
    }

    pub fn code_at(&self, root: &Hash, addr: &Address) -> Result<Vec<u8>, StateError> {
        let account = self.account_at(root, addr)?;
        self.code_by_hash(&account.code_hash)
    }

    pub fn code_by_hash(&self, code_hash: &Hash) -> Result<Vec<u8>, StateError> {
        if *code_hash == EMPTY_CODE_HASH {
            return Ok(Vec::new());
        }
        self.kv
            .get(&key(column::CODE, &code_hash.0))
            .ok_or(StateError::MissingCode(*code_hash))
    }

    /// Transactional view over the current root.
    pub fn snapshot(&self) -> Overlay<'_> {
        self.snapshot_at(self.root)
    }

    /// Transactional view over an arbitrary committed root.
    pub fn snapshot_at(&self, root: Hash) -> Overlay<'_> {
        Overlay {
            state: self,
            root,
            layers: vec![Layer::default()],
        }
    }

    /// Fold committed overlay changes into the tries and persist them in
    /// one batch. Returns the new state root.
    pub fn commit(&mut self, changes: Changes) -> Result<Hash, StateError> {
        let mut batch = WriteBatch::new();
        let base = self.root;
        let root = self.apply_changes(base, &mut batch, changes)?;

        self.trie.flush(&mut batch);
        batch.put(key(column::META, b"state_root"), root.0.to_vec());
        self.kv.put_batch(batch);

        tracing::debug!(root = %root, "state committed");
        self.root = root;
        Ok(root)
    }

    /// The root `commit` would produce for `changes` on top of `base`,
    /// without persisting anything or moving the current root.
    pub fn preview_root(&mut self, base: Hash, changes: Changes) -> Result<Hash, StateError> {
        let mut scratch = WriteBatch::new();
        let root = self.apply_changes(base, &mut scratch, changes)?;
        self.trie.clear_dirty();
        Ok(root)
    }

    fn apply_changes(
        &mut self,
        base: Hash,
        batch: &mut WriteBatch,
        changes: Changes,
    ) -> Result<Hash, StateError> {
        let mut root = base;

        for addr in &changes.destroyed {
            root = self.trie.update(&root, &addr.0, &[])?;
        }

        let mut storage: HashMap<Address, Vec<(Word, Word)>> = HashMap::new();
        for ((addr, slot), value) in changes.storage {
            storage.entry(addr).or_default().push((slot, value));
        }

        for (addr, mut account) in changes.accounts {
            // a destroy stands unless the same transaction re-created the
            // account afterwards (a CREATE2 redeploy to the same address)
            if changes.destroyed.contains(&addr) && !account.has_code() && account.nonce == 0 {
                continue;
            }
            if let Some(slots) = storage.remove(&addr) {
                let mut storage_root = account.storage_root;
                for (slot, value) in slots {
                    let encoded = if value.is_zero() {
                        Vec::new()
                    } else {
                        rlp::encode(&value).to_vec()
                    };
                    storage_root = self.trie.update(&storage_root, &slot.into_bytes(), &encoded)?;
                }
                account.storage_root = storage_root;
            }
            root = self.trie.update(&root, &addr.0, &rlp::encode(&account))?;
        }

        for (code_hash, code) in changes.code {
            batch.put(key(column::CODE, &code_hash.0), code);
        }

        Ok(root)
    }
}

#[derive(Debug, Default)]
struct Layer {
    accounts: HashMap<Address, Account>,
    storage: HashMap<(Address, Word), Word>,
    code: HashMap<Hash, Vec<u8>>,
    destroyed: HashSet<Address>,
    logs: Vec<Log>,
    refund: u64,
}

impl Layer {
    fn merge_into(self, parent: &mut Layer) {
        // a destruction wipes out slot writes buffered below it; writes made
        // after the destroy live in this layer and land on the clean slate
        for addr in &self.destroyed {
            parent.storage.retain(|(a, _), _| a != addr);
        }
        parent.accounts.extend(self.accounts);
        parent.storage.extend(self.storage);
        parent.code.extend(self.code);
        parent.destroyed.extend(self.destroyed);
        parent.logs.extend(self.logs);
        parent.refund += self.refund;
    }
}

/// Buffered account, storage, code and log writes folded into [`Changes`]
/// at commit time.
#[derive(Debug, Default)]
pub struct Changes {
    pub(crate) accounts: HashMap<Address, Account>,
    pub(crate) storage: HashMap<(Address, Word), Word>,
    pub(crate) code: HashMap<Hash, Vec<u8>>,
    pub(crate) destroyed: HashSet<Address>,
    pub logs: Vec<Log>,
    pub refund: u64,
}

/// Transient write buffer over the world state with nested checkpoints
/// matching CALL/CREATE sub-contexts. Reads see the nearest buffered write,
/// then the underlying root.
pub struct Overlay<'a> {
    state: &'a WorldState,
    root: Hash,
    layers: Vec<Layer>,
}

impl<'a> Overlay<'a> {
    pub fn root(&self) -> Hash {
        self.root
    }

    pub fn checkpoint(&mut self) -> usize {
        self.layers.push(Layer::default());
        self.layers.len() - 1
    }

    /// Fold the newest checkpoint into its parent.
    pub fn commit(&mut self) {
        debug_assert!(self.layers.len() > 1, "no checkpoint to commit");
        let top = self.layers.pop().expect("layer stack is never empty");
        top.merge_into(self.layers.last_mut().expect("parent layer"));
    }

    /// Discard every write buffered since the newest checkpoint.
    pub fn revert(&mut self) {
        debug_assert!(self.layers.len() > 1, "no checkpoint to revert");
        self.layers.pop();
    }

    pub fn depth(&self) -> usize {
        self.layers.len() - 1
    }

    pub fn account(&self, addr: &Address) -> Result<Account, StateError> {
        for layer in self.layers.iter().rev() {
            if let Some(account) = layer.accounts.get(addr) {
                return Ok(account.clone());
            }
        }
        self.state.account_at(&self.root, addr)
    }

    pub fn balance(&self, addr: &Address) -> Result<Word, StateError> {
        Ok(self.account(addr)?.balance)
    }

    pub fn nonce(&self, addr: &Address) -> Result<u64, StateError> {
        Ok(self.account(addr)?.nonce)
    }

    pub fn storage(&self, addr: &Address, slot: &Word) -> Result<Word, StateError> {
        for layer in self.layers.iter().rev() {
            if let Some(value) = layer.storage.get(&(*addr, *slot)) {
                return Ok(*value);
            }
            // a destruction in this layer shadows everything below it
            if layer.destroyed.contains(addr) {
                return Ok(Word::zero());
            }
        }
        self.state.storage_at(&self.root, addr, slot)
    }

    pub fn code(&self, addr: &Address) -> Result<Vec<u8>, StateError> {
        let account = self.account(addr)?;
        if account.code_hash == EMPTY_CODE_HASH {
            return Ok(Vec::new());
        }
        for layer in self.layers.iter().rev() {
            if let Some(code) = layer.code.get(&account.code_hash) {
                return Ok(code.clone());
            }
        }
        self.state.code_by_hash(&account.code_hash)
    }

    pub fn code_hash(&self, addr: &Address) -> Result<Hash, StateError> {
        Ok(self.account(addr)?.code_hash)
    }

    fn account_mut(&mut self, addr: &Address) -> Result<&mut Account, StateError> {
        if !self
            .layers
            .last()
            .expect("layer stack is never empty")
            .accounts
            .contains_key(addr)
        {
            let account = self.account(addr)?;
            self.layers
                .last_mut()
                .expect("layer stack is never empty")
                .accounts
                .insert(*addr, account);
        }
        Ok(self
            .layers
            .last_mut()
            .expect("layer stack is never empty")
            .accounts
            .get_mut(addr)
            .expect("just inserted"))
    }

    pub fn set_storage(&mut self, addr: &Address, slot: Word, value: Word) -> Result<(), StateError> {
        // materialize the account so lazy creation on first write holds
        self.account_mut(addr)?;
        self.layers
            .last_mut()
            .expect("layer stack is never empty")
            .storage
            .insert((*addr, slot), value);
        Ok(())
    }

    pub fn credit(&mut self, addr: &Address, amount: Word) -> Result<(), StateError> {
        let account = self.account_mut(addr)?;
        account.balance += amount;
        Ok(())
    }

    /// `false` when the balance does not cover `amount`; nothing changes.
    pub fn debit(&mut self, addr: &Address, amount: Word) -> Result<bool, StateError> {
        let account = self.account_mut(addr)?;
        match account.balance.checked_sub(amount) {
            Some(rest) => {
                account.balance = rest;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// `false` when the sender cannot cover `value`.
    pub fn transfer(
        &mut self,
        from: &Address,
        to: &Address,
        value: Word,
    ) -> Result<bool, StateError> {
        if value.is_zero() {
            return Ok(true);
        }
        if !self.debit(from, value)? {
            return Ok(false);
        }
        self.credit(to, value)?;
        Ok(true)
    }

    pub fn bump_nonce(&mut self, addr: &Address) -> Result<u64, StateError> {
        let account = self.account_mut(addr)?;
        let nonce = account.nonce;
        account.nonce = nonce + 1;
        Ok(nonce)
    }

    pub fn set_nonce(&mut self, addr: &Address, nonce: u64) -> Result<(), StateError> {
        self.account_mut(addr)?.nonce = nonce;
        Ok(())
    }

    pub fn deploy_code(&mut self, addr: &Address, code: Vec<u8>) -> Result<(), StateError> {
        let code_hash = keccak256(&code);
        self.account_mut(addr)?.code_hash = code_hash;
        self.layers
            .last_mut()
            .expect("layer stack is never empty")
            .code
            .insert(code_hash, code);
        Ok(())
    }

    /// Reset the account and schedule its removal at commit. A later
    /// creation at the same address within the same overlay starts from a
    /// blank account and supersedes the removal.
    pub fn selfdestruct(&mut self, addr: &Address) -> Result<(), StateError> {
        *self.account_mut(addr)? = Account::default();
        let layer = self.layers.last_mut().expect("layer stack is never empty");
        layer.storage.retain(|(a, _), _| a != addr);
        layer.destroyed.insert(*addr);
        Ok(())
    }

    pub fn log(&mut self, log: Log) {
        self.layers
            .last_mut()
            .expect("layer stack is never empty")
            .logs
            .push(log);
    }

    pub fn add_refund(&mut self, amount: u64) {
        self.layers
            .last_mut()
            .expect("layer stack is never empty")
            .refund += amount;
    }

    pub fn refund(&self) -> u64 {
        self.layers.iter().map(|layer| layer.refund).sum()
    }

    pub fn logs(&self) -> Vec<Log> {
        self.layers
            .iter()
            .flat_map(|layer| layer.logs.iter().cloned())
            .collect()
    }

    /// Fold every remaining layer, oldest first, into one change set.
    pub fn into_changes(self) -> Changes {
        let mut changes = Changes::default();
        for layer in self.layers {
            for addr in &layer.destroyed {
                changes.storage.retain(|(a, _), _| a != addr);
            }
            changes.accounts.extend(layer.accounts);
            changes.storage.extend(layer.storage);
            changes.code.extend(layer.code);
            changes.destroyed.extend(layer.destroyed);
            changes.logs.extend(layer.logs);
            changes.refund += layer.refund;
        }
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::addr;
    use crate::kv::MemoryKv;

    fn state() -> WorldState {
        WorldState::open(Arc::new(MemoryKv::new()))
    }

    #[test]
    fn test_default_account() {
        let state = state();
        let account = state
            .get_account(&addr("f39fd6e51aad88f6f4ce6ab8827279cfffb92266"))
            .unwrap();
        assert_eq!(account, Account::default());
        assert_eq!(state.root(), EMPTY_TRIE_ROOT);
    }

    #[test]
    fn test_overlay_read_your_writes() {
        let state = state();
        let a = addr("f39fd6e51aad88f6f4ce6ab8827279cfffb92266");
        let mut overlay = state.snapshot();
        overlay.credit(&a, Word::from(100u64)).unwrap();
        overlay.set_storage(&a, Word::one(), Word::from(42u64)).unwrap();

        assert_eq!(overlay.balance(&a).unwrap(), Word::from(100u64));
        assert_eq!(
            overlay.storage(&a, &Word::one()).unwrap(),
            Word::from(42u64)
        );
    }

    #[test]
    fn test_checkpoint_revert() {
        let state = state();
        let a = addr("f39fd6e51aad88f6f4ce6ab8827279cfffb92266");
        let mut overlay = state.snapshot();
        overlay.credit(&a, Word::from(100u64)).unwrap();

        overlay.checkpoint();
        overlay.credit(&a, Word::from(1u64)).unwrap();
        overlay.set_storage(&a, Word::zero(), Word::one()).unwrap();
        assert_eq!(overlay.balance(&a).unwrap(), Word::from(101u64));
        overlay.revert();

        assert_eq!(overlay.balance(&a).unwrap(), Word::from(100u64));
        assert_eq!(overlay.storage(&a, &Word::zero()).unwrap(), Word::zero());
    }

    #[test]
    fn test_commit_roundtrip() {
        let mut state = state();
        let a = addr("f39fd6e51aad88f6f4ce6ab8827279cfffb92266");

        let mut overlay = state.snapshot();
        overlay.credit(&a, Word::from(7u64)).unwrap();
        overlay.set_storage(&a, Word::one(), Word::from(9u64)).unwrap();
        overlay.bump_nonce(&a).unwrap();
        let root = state.commit(overlay.into_changes()).unwrap();

        assert_eq!(root, state.root());
        let account = state.get_account(&a).unwrap();
        assert_eq!(account.balance, Word::from(7u64));
        assert_eq!(account.nonce, 1);
        assert_eq!(
            state.get_storage(&a, &Word::one()).unwrap(),
            Word::from(9u64)
        );
    }

    #[test]
    fn test_zero_storage_write_deletes() {
        let mut state = state();
        let a = addr("f39fd6e51aad88f6f4ce6ab8827279cfffb92266");

        let mut overlay = state.snapshot();
        overlay.credit(&a, Word::one()).unwrap();
        let clean_root = state.commit(overlay.into_changes()).unwrap();

        // write then zero-out in a follow-up commit: same account record
        let mut overlay = state.snapshot();
        overlay.set_storage(&a, Word::one(), Word::from(5u64)).unwrap();
        state.commit(overlay.into_changes()).unwrap();

        let mut overlay = state.snapshot();
        overlay.set_storage(&a, Word::one(), Word::zero()).unwrap();
        let root = state.commit(overlay.into_changes()).unwrap();
        assert_eq!(root, clean_root);
    }

    #[test]
    fn test_write_then_delete_in_one_overlay_is_neutral() {
        let mut state = state();
        let a = addr("f39fd6e51aad88f6f4ce6ab8827279cfffb92266");

        let mut overlay = state.snapshot();
        overlay.credit(&a, Word::one()).unwrap();
        let untouched = state.commit(overlay.into_changes()).unwrap();

        let mut overlay = state.snapshot();
        overlay.set_storage(&a, Word::from(3u64), Word::from(8u64)).unwrap();
        overlay.set_storage(&a, Word::from(3u64), Word::zero()).unwrap();
        let root = state.commit(overlay.into_changes()).unwrap();
        assert_eq!(root, untouched);
    }

    #[test]
    fn test_selfdestruct_clears_account() {
        let mut state = state();
        let a = addr("c80a141ce8a5b73371043cba5cee40437975bb37");

        let mut overlay = state.snapshot();
        overlay.credit(&a, Word::from(10u64)).unwrap();
        overlay.deploy_code(&a, vec![0x00]).unwrap();
        state.commit(overlay.into_changes()).unwrap();
        assert!(state.get_account(&a).unwrap().has_code());

        let mut overlay = state.snapshot();
        overlay.selfdestruct(&a).unwrap();
        state.commit(overlay.into_changes()).unwrap();
        assert_eq!(state.get_account(&a).unwrap(), Account::default());
    }

    #[test]
    fn test_selfdestruct_resets_account_in_overlay() {
        let mut state = state();
        let a = addr("c80a141ce8a5b73371043cba5cee40437975bb37");

        let mut overlay = state.snapshot();
        overlay.credit(&a, Word::from(10u64)).unwrap();
        overlay.deploy_code(&a, vec![0x00]).unwrap();
        overlay.set_nonce(&a, 1).unwrap();
        overlay.set_storage(&a, Word::one(), Word::from(9u64)).unwrap();
        state.commit(overlay.into_changes()).unwrap();

        let mut overlay = state.snapshot();
        overlay.set_storage(&a, Word::from(2u64), Word::from(3u64)).unwrap();
        overlay.selfdestruct(&a).unwrap();

        assert_eq!(overlay.account(&a).unwrap(), Account::default());
        assert_eq!(overlay.code(&a).unwrap(), Vec::<u8>::new());
        assert_eq!(overlay.storage(&a, &Word::one()).unwrap(), Word::zero());
        assert_eq!(overlay.storage(&a, &Word::from(2u64)).unwrap(), Word::zero());
    }

    #[test]
    fn test_recreation_after_selfdestruct_survives_commit() {
        let mut state = state();
        let a = addr("c80a141ce8a5b73371043cba5cee40437975bb37");

        let mut overlay = state.snapshot();
        overlay.deploy_code(&a, vec![0x00]).unwrap();
        overlay.set_nonce(&a, 1).unwrap();
        overlay.set_storage(&a, Word::one(), Word::from(9u64)).unwrap();
        state.commit(overlay.into_changes()).unwrap();

        // destroy, then redeploy at the same address in the same overlay
        let mut overlay = state.snapshot();
        overlay.checkpoint();
        overlay.selfdestruct(&a).unwrap();
        overlay.commit();
        overlay.checkpoint();
        overlay.set_nonce(&a, 1).unwrap();
        overlay.deploy_code(&a, vec![0x60, 0x00]).unwrap();
        overlay.set_storage(&a, Word::from(2u64), Word::from(4u64)).unwrap();
        overlay.commit();
        state.commit(overlay.into_changes()).unwrap();

        let account = state.get_account(&a).unwrap();
        assert_eq!(account.nonce, 1);
        assert!(account.has_code());
        assert_eq!(state.get_code(&a).unwrap(), vec![0x60, 0x00]);
        // the old storage died with the first incarnation
        assert_eq!(state.get_storage(&a, &Word::one()).unwrap(), Word::zero());
        assert_eq!(
            state.get_storage(&a, &Word::from(2u64)).unwrap(),
            Word::from(4u64)
        );
    }

    #[test]
    fn test_reopen_recovers_root() {
        let kv: Arc<dyn KvBackend> = Arc::new(MemoryKv::new());
        let mut state = WorldState::open(kv.clone());
        let a = addr("f39fd6e51aad88f6f4ce6ab8827279cfffb92266");

        let mut overlay = state.snapshot();
        overlay.credit(&a, Word::from(5u64)).unwrap();
        let root = state.commit(overlay.into_changes()).unwrap();

        let reopened = WorldState::open(kv);
        assert_eq!(reopened.root(), root);
        assert_eq!(
            reopened.get_account(&a).unwrap().balance,
            Word::from(5u64)
        );
    }
}
