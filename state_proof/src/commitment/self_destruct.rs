use std::fmt;
use std::sync::Arc;

use ethereum_types::{Address, H256};
use keccak_hash::keccak;
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use rollup_common::ZERO_HASH;

struct Node {
    address: Address,
    hash: H256,
    prev: Option<Arc<Node>>,
}

/// Contracts scheduled for destruction, in the order they self-destructed.
///
/// Persistent in the same way as [`LogSeries`](super::LogSeries): inserting
/// yields a new set and leaves snapshots intact.
#[derive(Clone, Default)]
pub struct SelfDestructSet {
    head: Option<Arc<Node>>,
}

impl SelfDestructSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hash(&self) -> H256 {
        self.head.as_ref().map_or(ZERO_HASH, |node| node.hash)
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.iter_rev().any(|it| it == address)
    }

    /// Returns the set with `address` added. Already present addresses keep
    /// their original position.
    #[must_use]
    pub fn insert(&self, address: Address) -> Self {
        if self.contains(&address) {
            return self.clone();
        }
        let mut preimage = self.hash().as_bytes().to_vec();
        preimage.extend_from_slice(address.as_bytes());
        Self {
            head: Some(Arc::new(Node {
                address,
                hash: keccak(preimage),
                prev: self.head.clone(),
            })),
        }
    }

    pub fn addresses(&self) -> Vec<Address> {
        let mut addresses = self.iter_rev().copied().collect::<Vec<_>>();
        addresses.reverse();
        addresses
    }

    fn iter_rev(&self) -> impl Iterator<Item = &Address> {
        std::iter::successors(self.head.as_deref(), |node| node.prev.as_deref())
            .map(|node| &node.address)
    }
}

impl FromIterator<Address> for SelfDestructSet {
    fn from_iter<T: IntoIterator<Item = Address>>(iter: T) -> Self {
        iter.into_iter()
            .fold(Self::new(), |set, address| set.insert(address))
    }
}

impl PartialEq for SelfDestructSet {
    fn eq(&self, other: &Self) -> bool {
        self.hash() == other.hash()
    }
}

impl Eq for SelfDestructSet {}

impl fmt::Debug for SelfDestructSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.addresses()).finish()
    }
}

impl Encodable for SelfDestructSet {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.append_list::<Address, _>(&self.addresses());
    }
}

impl Decodable for SelfDestructSet {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(rlp.as_list::<Address>()?.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicates_do_not_change_the_hash() {
        let a = Address::repeat_byte(0xaa);
        let b = Address::repeat_byte(0xbb);
        let once: SelfDestructSet = [a, b].into_iter().collect();
        let twice: SelfDestructSet = [a, b, a].into_iter().collect();

        assert_eq!(once, twice);
        assert_eq!(twice.addresses(), vec![a, b]);
    }

    #[test]
    fn empty_set_commits_to_zero() {
        assert_eq!(SelfDestructSet::new().hash(), ZERO_HASH);
        assert!(SelfDestructSet::new().is_empty());
    }
}
