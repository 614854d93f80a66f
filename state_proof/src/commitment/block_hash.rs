use std::collections::BTreeMap;
use std::sync::Arc;

use ethereum_types::H256;
use rollup_common::BLOCK_HASH_WINDOW;

use crate::error::TrieError;
use crate::tries::{index_key, KeyedTrie};

/// The ancestor hashes a block can read through `BLOCKHASH`, committed as a
/// trie keyed by `rlp(number)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHashTree {
    number: u64,
    hashes: Arc<BTreeMap<u64, H256>>,
    root: H256,
}

impl BlockHashTree {
    /// The tree visible from inside block `number`. Hashes outside of the
    /// `BLOCKHASH` window are dropped.
    pub fn new(
        number: u64,
        hashes: impl IntoIterator<Item = (u64, H256)>,
    ) -> Result<Self, TrieError> {
        let lowest = number.saturating_sub(BLOCK_HASH_WINDOW);
        let hashes = hashes
            .into_iter()
            .filter(|(n, _)| (lowest..number).contains(n))
            .collect::<BTreeMap<_, _>>();
        let root = Self::trie(&hashes)?.root()?;
        Ok(Self {
            number,
            hashes: Arc::new(hashes),
            root,
        })
    }

    /// Block whose execution sees this tree.
    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn root(&self) -> H256 {
        self.root
    }

    pub fn get(&self, number: u64) -> Option<H256> {
        self.hashes.get(&number).copied()
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    pub fn proof(&self, number: u64) -> Result<Vec<Vec<u8>>, TrieError> {
        Self::trie(&self.hashes)?.proof(&index_key(number))
    }

    /// The tree seen by the next block, once the hash of this one is known.
    pub fn advance(&self, hash: H256) -> Result<Self, TrieError> {
        let hashes = self
            .hashes
            .iter()
            .map(|(n, h)| (*n, *h))
            .chain([(self.number, hash)]);
        Self::new(self.number + 1, hashes)
    }

    fn trie(hashes: &BTreeMap<u64, H256>) -> Result<KeyedTrie, TrieError> {
        let mut trie = KeyedTrie::new();
        for (number, hash) in hashes {
            trie.insert(&index_key(*number), hash.as_bytes())?;
        }
        Ok(trie)
    }
}

#[cfg(test)]
mod tests {
    use rollup_common::EMPTY_TRIE_HASH;

    use super::*;

    #[test]
    fn window_is_bounded() {
        let hashes = (0..400).map(|n| (n, H256::from_low_u64_be(n + 1)));
        let tree = BlockHashTree::new(400, hashes).unwrap();

        assert_eq!(tree.len(), BLOCK_HASH_WINDOW as usize);
        assert_eq!(tree.get(143), None);
        assert_eq!(tree.get(144), Some(H256::from_low_u64_be(145)));
    }

    #[test]
    fn advancing_matches_a_fresh_tree() {
        let hashes = (0..10).map(|n| (n, H256::from_low_u64_be(n + 1)));
        let tree = BlockHashTree::new(10, hashes).unwrap();
        let advanced = tree.advance(H256::from_low_u64_be(11)).unwrap();
        let fresh = BlockHashTree::new(11, (0..11).map(|n| (n, H256::from_low_u64_be(n + 1))))
            .unwrap();

        assert_eq!(advanced.root(), fresh.root());
        assert_ne!(advanced.root(), tree.root());
    }

    #[test]
    fn genesis_sees_nothing() {
        let tree = BlockHashTree::new(0, []).unwrap();
        assert_eq!(tree.root(), EMPTY_TRIE_HASH);
    }
}
