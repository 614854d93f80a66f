//! Thin wrappers over [`eth_trie`] for the tries a timeline commits to:
//! per-block transaction and receipt tries, the access-list trie and the
//! block-hash trie.

use std::fmt;
use std::sync::Arc;

use eth_trie::{EthTrie, MemoryDB, Trie};
use ethereum_types::H256;

use crate::error::TrieError;

/// An in-memory Merkle Patricia trie.
pub struct KeyedTrie {
    inner: EthTrie<MemoryDB>,
}

impl fmt::Debug for KeyedTrie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedTrie").finish_non_exhaustive()
    }
}

impl Default for KeyedTrie {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyedTrie {
    pub fn new() -> Self {
        Self {
            inner: EthTrie::new(Arc::new(MemoryDB::new(true))),
        }
    }

    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<(), TrieError> {
        self.inner
            .insert(key, value)
            .map_err(|e| TrieError(format!("{e:?}")))
    }

    pub fn root(&mut self) -> Result<H256, TrieError> {
        let root = self
            .inner
            .root_hash()
            .map_err(|e| TrieError(format!("{e:?}")))?;
        // Same bytes, but `eth_trie` may resolve to a different
        // `ethereum-types` release than ours.
        Ok(H256(root.0))
    }

    /// Nodes on the path from the root to `key`, root first.
    pub fn proof(&mut self, key: &[u8]) -> Result<Vec<Vec<u8>>, TrieError> {
        self.inner
            .get_proof(key)
            .map_err(|e| TrieError(format!("{e:?}")))
    }
}

/// Key of the `index`-th item of an ordered trie (transactions, receipts).
pub fn index_key(index: u64) -> Vec<u8> {
    rlp::encode(&index).to_vec()
}

/// Builds the ordered trie for `values`, keyed by `rlp(index)`.
pub fn ordered_trie<I, V>(values: I) -> Result<KeyedTrie, TrieError>
where
    I: IntoIterator<Item = V>,
    V: AsRef<[u8]>,
{
    let mut trie = KeyedTrie::new();
    for (index, value) in values.into_iter().enumerate() {
        trie.insert(&index_key(index as u64), value.as_ref())?;
    }
    Ok(trie)
}

pub fn ordered_root<I, V>(values: I) -> Result<H256, TrieError>
where
    I: IntoIterator<Item = V>,
    V: AsRef<[u8]>,
{
    ordered_trie(values)?.root()
}
