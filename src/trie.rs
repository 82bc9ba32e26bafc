use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use thiserror::Error;

use crate::{
    common::hash::{EMPTY_TRIE_ROOT, Hash, keccak256},
    kv::{KvBackend, WriteBatch, column, key},
};

#[derive(Error, Debug)]
pub enum TrieError {
    #[error("Missing trie node {0}")]
    CorruptNode(Hash),
    #[error("Undecodable trie node: {0}")]
    Codec(#[from] rlp::DecoderError),
}

/// Authenticated map from byte keys to byte values. Nodes are RLP-encoded
/// and content-addressed by Keccak-256; every mutation returns a new root
/// and leaves the old root readable.
///
/// New nodes accumulate in an in-memory dirty set until [`Trie::flush`]
/// moves them into a write batch.
pub struct Trie {
    kv: Arc<dyn KvBackend>,
    dirty: HashMap<Hash, Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Node {
    Leaf {
        path: Vec<u8>,
        value: Vec<u8>,
    },
    Extension {
        path: Vec<u8>,
        child: Hash,
    },
    Branch {
        children: Box<[Option<Hash>; 16]>,
        value: Option<Vec<u8>>,
    },
}

impl Trie {
    pub fn new(kv: Arc<dyn KvBackend>) -> Self {
        Self {
            kv,
            dirty: HashMap::new(),
        }
    }

    pub fn get(&self, root: &Hash, key: &[u8]) -> Result<Option<Vec<u8>>, TrieError> {
        if *root == EMPTY_TRIE_ROOT {
            return Ok(None);
        }
        let path = to_nibbles(key);
        let mut hash = *root;
        let mut offset = 0;
        loop {
            match self.load(&hash)? {
                Node::Leaf { path: lp, value } => {
                    return Ok(if lp == path[offset..] { Some(value) } else { None });
                }
                Node::Extension { path: ep, child } => {
                    if path[offset..].len() < ep.len() || path[offset..offset + ep.len()] != ep[..]
                    {
                        return Ok(None);
                    }
                    offset += ep.len();
                    hash = child;
                }
                Node::Branch { children, value } => {
                    if offset == path.len() {
                        return Ok(value);
                    }
                    match children[path[offset] as usize] {
                        Some(child) => {
                            offset += 1;
                            hash = child;
                        }
                        None => return Ok(None),
                    }
                }
            }
        }
    }

    /// Set `key` to `value`; an empty value deletes the key. Returns the
    /// root of the updated trie.
    pub fn update(&mut self, root: &Hash, key: &[u8], value: &[u8]) -> Result<Hash, TrieError> {
        let path = to_nibbles(key);
        if value.is_empty() {
            if *root == EMPTY_TRIE_ROOT {
                return Ok(EMPTY_TRIE_ROOT);
            }
            let root = *root;
            Ok(self.remove_at(&root, &path)?.unwrap_or(EMPTY_TRIE_ROOT))
        } else {
            let at = (*root != EMPTY_TRIE_ROOT).then_some(*root);
            self.insert_at(at, &path, value.to_vec())
        }
    }

    /// All keys whose value differs between the two roots, with the value
    /// on each side.
    #[allow(clippy::type_complexity)]
    pub fn diff(
        &self,
        a: &Hash,
        b: &Hash,
    ) -> Result<Vec<(Vec<u8>, Option<Vec<u8>>, Option<Vec<u8>>)>, TrieError> {
        let left = self.leaves(a)?;
        let right = self.leaves(b)?;
        let mut keys: Vec<&Vec<u8>> = left.keys().chain(right.keys()).collect();
        keys.sort();
        keys.dedup();
        let mut out = Vec::new();
        for key in keys {
            let old = left.get(key);
            let new = right.get(key);
            if old != new {
                out.push((key.clone(), old.cloned(), new.cloned()));
            }
        }
        Ok(out)
    }

    /// Move all unflushed nodes into `batch` under the trie column.
    pub fn flush(&mut self, batch: &mut WriteBatch) {
        for (hash, bytes) in self.dirty.drain() {
            batch.put(key(column::TRIE, &hash.0), bytes);
        }
    }

    /// Drop unflushed nodes (a failed or abandoned update).
    pub fn clear_dirty(&mut self) {
        self.dirty.clear();
    }

    fn leaves(&self, root: &Hash) -> Result<BTreeMap<Vec<u8>, Vec<u8>>, TrieError> {
        let mut out = BTreeMap::new();
        if *root != EMPTY_TRIE_ROOT {
            self.collect(root, Vec::new(), &mut out)?;
        }
        Ok(out)
    }

    fn collect(
        &self,
        hash: &Hash,
        prefix: Vec<u8>,
        out: &mut BTreeMap<Vec<u8>, Vec<u8>>,
    ) -> Result<(), TrieError> {
        match self.load(hash)? {
            Node::Leaf { path, value } => {
                let mut nibbles = prefix;
                nibbles.extend_from_slice(&path);
                out.insert(from_nibbles(&nibbles), value);
            }
            Node::Extension { path, child } => {
                let mut nibbles = prefix;
                nibbles.extend_from_slice(&path);
                self.collect(&child, nibbles, out)?;
            }
            Node::Branch { children, value } => {
                if let Some(value) = value {
                    out.insert(from_nibbles(&prefix), value);
                }
                for (i, child) in children.iter().enumerate() {
                    if let Some(child) = child {
                        let mut nibbles = prefix.clone();
                        nibbles.push(i as u8);
                        self.collect(child, nibbles, out)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn insert_at(
        &mut self,
        node: Option<Hash>,
        path: &[u8],
        value: Vec<u8>,
    ) -> Result<Hash, TrieError> {
        let Some(hash) = node else {
            return Ok(self.store(Node::Leaf {
                path: path.to_vec(),
                value,
            }));
        };
        match self.load(&hash)? {
            Node::Leaf {
                path: lp,
                value: lv,
            } => {
                if lp == path {
                    return Ok(self.store(Node::Leaf { path: lp, value }));
                }
                let common = common_prefix(&lp, path);
                let mut children: Box<[Option<Hash>; 16]> = Default::default();
                let mut slot_value = None;

                let rest = &lp[common..];
                if rest.is_empty() {
                    slot_value = Some(lv);
                } else {
                    let leaf = self.store(Node::Leaf {
                        path: rest[1..].to_vec(),
                        value: lv,
                    });
                    children[rest[0] as usize] = Some(leaf);
                }
                let rest = &path[common..];
                if rest.is_empty() {
                    slot_value = Some(value);
                } else {
                    let leaf = self.store(Node::Leaf {
                        path: rest[1..].to_vec(),
                        value,
                    });
                    children[rest[0] as usize] = Some(leaf);
                }

                let mut node = self.store(Node::Branch {
                    children,
                    value: slot_value,
                });
                if common > 0 {
                    node = self.store(Node::Extension {
                        path: path[..common].to_vec(),
                        child: node,
                    });
                }
                Ok(node)
            }
            Node::Extension { path: ep, child } => {
                let common = common_prefix(&ep, path);
                if common == ep.len() {
                    let child = self.insert_at(Some(child), &path[common..], value)?;
                    return Ok(self.store(Node::Extension { path: ep, child }));
                }

                let mut children: Box<[Option<Hash>; 16]> = Default::default();
                let mut slot_value = None;

                let rest = &ep[common..];
                children[rest[0] as usize] = Some(if rest.len() == 1 {
                    child
                } else {
                    self.store(Node::Extension {
                        path: rest[1..].to_vec(),
                        child,
                    })
                });
                let rest = &path[common..];
                if rest.is_empty() {
                    slot_value = Some(value);
                } else {
                    let leaf = self.store(Node::Leaf {
                        path: rest[1..].to_vec(),
                        value,
                    });
                    children[rest[0] as usize] = Some(leaf);
                }

                let mut node = self.store(Node::Branch {
                    children,
                    value: slot_value,
                });
                if common > 0 {
                    node = self.store(Node::Extension {
                        path: path[..common].to_vec(),
                        child: node,
                    });
                }
                Ok(node)
            }
            Node::Branch {
                mut children,
                value: slot_value,
            } => {
                if path.is_empty() {
                    return Ok(self.store(Node::Branch {
                        children,
                        value: Some(value),
                    }));
                }
                let i = path[0] as usize;
                let child = self.insert_at(children[i], &path[1..], value)?;
                children[i] = Some(child);
                Ok(self.store(Node::Branch {
                    children,
                    value: slot_value,
                }))
            }
        }
    }

    /// `None` means the whole subtree is gone.
    fn remove_at(&mut self, hash: &Hash, path: &[u8]) -> Result<Option<Hash>, TrieError> {
        match self.load(hash)? {
            Node::Leaf { path: lp, .. } => Ok(if lp == path { None } else { Some(*hash) }),
            Node::Extension { path: ep, child } => {
                if path.len() < ep.len() || path[..ep.len()] != ep[..] {
                    return Ok(Some(*hash));
                }
                match self.remove_at(&child, &path[ep.len()..])? {
                    None => Ok(None),
                    Some(new_child) if new_child == child => Ok(Some(*hash)),
                    Some(new_child) => {
                        // A collapsed child folds into this extension.
                        let merged = match self.load(&new_child)? {
                            Node::Leaf { path: cp, value } => Node::Leaf {
                                path: concat(&ep, &cp),
                                value,
                            },
                            Node::Extension {
                                path: cp,
                                child: cc,
                            } => Node::Extension {
                                path: concat(&ep, &cp),
                                child: cc,
                            },
                            Node::Branch { .. } => Node::Extension {
                                path: ep,
                                child: new_child,
                            },
                        };
                        Ok(Some(self.store(merged)))
                    }
                }
            }
            Node::Branch {
                mut children,
                mut value,
            } => {
                if path.is_empty() {
                    if value.is_none() {
                        return Ok(Some(*hash));
                    }
                    value = None;
                } else {
                    let i = path[0] as usize;
                    match children[i] {
                        None => return Ok(Some(*hash)),
                        Some(child) => children[i] = self.remove_at(&child, &path[1..])?,
                    }
                }

                let occupied: Vec<usize> = (0..16).filter(|i| children[*i].is_some()).collect();
                match (occupied.len(), &value) {
                    (0, None) => Ok(None),
                    (0, Some(v)) => Ok(Some(self.store(Node::Leaf {
                        path: Vec::new(),
                        value: v.clone(),
                    }))),
                    (1, None) => {
                        let i = occupied[0];
                        let child = children[i].expect("occupied slot");
                        let merged = match self.load(&child)? {
                            Node::Leaf { path: cp, value } => Node::Leaf {
                                path: concat(&[i as u8], &cp),
                                value,
                            },
                            Node::Extension {
                                path: cp,
                                child: cc,
                            } => Node::Extension {
                                path: concat(&[i as u8], &cp),
                                child: cc,
                            },
                            Node::Branch { .. } => Node::Extension {
                                path: vec![i as u8],
                                child,
                            },
                        };
                        Ok(Some(self.store(merged)))
                    }
                    _ => Ok(Some(self.store(Node::Branch { children, value }))),
                }
            }
        }
    }

    fn load(&self, hash: &Hash) -> Result<Node, TrieError> {
        let bytes = match self.dirty.get(hash) {
            Some(bytes) => bytes.clone(),
            None => self
                .kv
                .get(&key(column::TRIE, &hash.0))
                .ok_or(TrieError::CorruptNode(*hash))?,
        };
        Ok(rlp::decode(&bytes)?)
    }

    fn store(&mut self, node: Node) -> Hash {
        let bytes = rlp::encode(&node).to_vec();
        let hash = keccak256(&bytes);
        self.dirty.insert(hash, bytes);
        hash
    }
}

impl rlp::Encodable for Node {
    fn rlp_append(&self, s: &mut rlp::RlpStream) {
        match self {
            Node::Leaf { path, value } => {
                s.begin_list(2);
                s.append(&hex_prefix(path, true));
                s.append(value);
            }
            Node::Extension { path, child } => {
                s.begin_list(2);
                s.append(&hex_prefix(path, false));
                s.append(&child.0.to_vec());
            }
            Node::Branch { children, value } => {
                s.begin_list(17);
                for child in children.iter() {
                    s.append(&child.map(|c| c.0.to_vec()).unwrap_or_default());
                }
                s.append(&value.clone().unwrap_or_default());
            }
        }
    }
}

impl rlp::Decodable for Node {
    fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
        match rlp.item_count()? {
            2 => {
                let encoded: Vec<u8> = rlp.val_at(0)?;
                let (path, is_leaf) = decode_hex_prefix(&encoded)?;
                if is_leaf {
                    Ok(Node::Leaf {
                        path,
                        value: rlp.val_at(1)?,
                    })
                } else {
                    let child: Vec<u8> = rlp.val_at(1)?;
                    Ok(Node::Extension {
                        path,
                        child: Hash::from_slice(&child)
                            .ok_or(rlp::DecoderError::RlpInvalidLength)?,
                    })
                }
            }
            17 => {
                let mut children: Box<[Option<Hash>; 16]> = Default::default();
                for (i, slot) in children.iter_mut().enumerate() {
                    let bytes: Vec<u8> = rlp.val_at(i)?;
                    if !bytes.is_empty() {
                        *slot = Some(
                            Hash::from_slice(&bytes).ok_or(rlp::DecoderError::RlpInvalidLength)?,
                        );
                    }
                }
                let value: Vec<u8> = rlp.val_at(16)?;
                Ok(Node::Branch {
                    children,
                    value: (!value.is_empty()).then_some(value),
                })
            }
            _ => Err(rlp::DecoderError::RlpIncorrectListLen),
        }
    }
}

fn to_nibbles(key: &[u8]) -> Vec<u8> {
    let mut nibbles = Vec::with_capacity(key.len() * 2);
    for byte in key {
        nibbles.push(byte >> 4);
        nibbles.push(byte & 0x0f);
    }
    nibbles
}

fn from_nibbles(nibbles: &[u8]) -> Vec<u8> {
    nibbles
        .chunks(2)
        .map(|pair| (pair[0] << 4) | pair.get(1).copied().unwrap_or(0))
        .collect()
}

/// Hex-prefix rule: the first nibble carries the leaf flag (bit 1) and the
/// odd-length flag (bit 0).
fn hex_prefix(nibbles: &[u8], is_leaf: bool) -> Vec<u8> {
    let odd = nibbles.len() % 2 == 1;
    let flag = if is_leaf { 2u8 } else { 0u8 } + if odd { 1 } else { 0 };

    let mut out = Vec::with_capacity(1 + nibbles.len() / 2);
    if odd {
        out.push((flag << 4) | nibbles[0]);
        for pair in nibbles[1..].chunks(2) {
            out.push((pair[0] << 4) | pair[1]);
        }
    } else {
        out.push(flag << 4);
        for pair in nibbles.chunks(2) {
            out.push((pair[0] << 4) | pair[1]);
        }
    }
    out
}

fn decode_hex_prefix(encoded: &[u8]) -> Result<(Vec<u8>, bool), rlp::DecoderError> {
    if encoded.is_empty() {
        return Err(rlp::DecoderError::RlpIsTooShort);
    }
    let flag = encoded[0] >> 4;
    if flag > 3 {
        return Err(rlp::DecoderError::Custom("bad hex-prefix flag"));
    }
    let is_leaf = flag >= 2;
    let odd = flag % 2 == 1;

    let mut nibbles = Vec::new();
    if odd {
        nibbles.push(encoded[0] & 0x0f);
    }
    for byte in &encoded[1..] {
        nibbles.push(byte >> 4);
        nibbles.push(byte & 0x0f);
    }
    Ok((nibbles, is_leaf))
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

fn concat(a: &[u8], b: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    out.extend_from_slice(a);
    out.extend_from_slice(b);
    out
}
