use ethereum_types::{H256, U256};
use keccak_hash::keccak;
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};

use super::{expect_tagged_list, SelfDestructSet, INTER_TAG};

/// Commitment between two transactions of a block.
///
/// `tx_index` counts the transactions already applied, so the state before
/// the first transaction has index 0 and the state after the last one has
/// index `transactions.len()`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterState {
    pub block_number: u64,
    pub tx_index: u64,
    pub state_root: H256,
    pub cumulative_gas_used: U256,
    pub block_gas_used: U256,
    pub block_hash_root: H256,
    /// Root of the trie over the transactions applied so far.
    pub transaction_root: H256,
    /// Root of the trie over the receipts produced so far.
    pub receipt_root: H256,
    /// Contracts destroyed by the previous transaction.
    pub self_destruct_set: SelfDestructSet,
}

impl InterState {
    const FIELDS: usize = 10;

    pub fn commitment(&self) -> Vec<u8> {
        let mut s = RlpStream::new_list(Self::FIELDS);
        self.append_head(&mut s);
        s.append(&self.self_destruct_set.hash());
        s.out().to_vec()
    }

    pub fn hash(&self) -> H256 {
        keccak(self.commitment())
    }

    fn append_head(&self, s: &mut RlpStream) {
        s.append(&INTER_TAG);
        s.append(&self.block_number);
        s.append(&self.tx_index);
        s.append(&self.state_root);
        s.append(&self.cumulative_gas_used);
        s.append(&self.block_gas_used);
        s.append(&self.block_hash_root);
        s.append(&self.transaction_root);
        s.append(&self.receipt_root);
    }
}

impl Encodable for InterState {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(Self::FIELDS);
        self.append_head(s);
        s.append(&self.self_destruct_set);
    }
}

impl Decodable for InterState {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        expect_tagged_list(rlp, INTER_TAG, Self::FIELDS)?;
        Ok(Self {
            block_number: rlp.val_at(1)?,
            tx_index: rlp.val_at(2)?,
            state_root: rlp.val_at(3)?,
            cumulative_gas_used: rlp.val_at(4)?,
            block_gas_used: rlp.val_at(5)?,
            block_hash_root: rlp.val_at(6)?,
            transaction_root: rlp.val_at(7)?,
            receipt_root: rlp.val_at(8)?,
            self_destruct_set: rlp.val_at(9)?,
        })
    }
}
