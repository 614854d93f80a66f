use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use ethereum_types::{Address, H256};
use keccak_hash::keccak;
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};

/// Warm accounts and storage slots of a transaction.
///
/// Updates copy the map and leave the previous value shared with any frame
/// snapshot that still refers to it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccessList {
    entries: Arc<BTreeMap<Address, BTreeSet<H256>>>,
}

impl AccessList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains_address(&self, address: &Address) -> bool {
        self.entries.contains_key(address)
    }

    pub fn contains_slot(&self, address: &Address, slot: &H256) -> bool {
        self.entries
            .get(address)
            .is_some_and(|slots| slots.contains(slot))
    }

    #[must_use]
    pub fn with_address(&self, address: Address) -> Self {
        if self.contains_address(&address) {
            return self.clone();
        }
        let mut entries = (*self.entries).clone();
        entries.insert(address, BTreeSet::new());
        Self {
            entries: Arc::new(entries),
        }
    }

    #[must_use]
    pub fn with_slot(&self, address: Address, slot: H256) -> Self {
        if self.contains_slot(&address, &slot) {
            return self.clone();
        }
        let mut entries = (*self.entries).clone();
        entries.entry(address).or_default().insert(slot);
        Self {
            entries: Arc::new(entries),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Address, &BTreeSet<H256>)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Digest of the canonical (address-sorted, slot-sorted) encoding.
    pub fn commitment(&self) -> H256 {
        keccak(rlp::encode(self))
    }
}

impl Encodable for AccessList {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(self.entries.len());
        for (address, slots) in self.entries.iter() {
            s.begin_list(2);
            s.append(address);
            s.begin_list(slots.len());
            for slot in slots {
                s.append(slot);
            }
        }
    }
}

impl Decodable for AccessList {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        let mut entries = BTreeMap::new();
        for entry in rlp.iter() {
            let address: Address = entry.val_at(0)?;
            let slots: Vec<H256> = entry.list_at(1)?;
            entries.insert(address, slots.into_iter().collect());
        }
        Ok(Self {
            entries: Arc::new(entries),
        })
    }
}
