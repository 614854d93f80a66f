use ethereum_types::{H256, U256};
use keccak_hash::keccak;
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};

use super::{expect_tagged_list, BLOCK_TAG};

/// Commitment at a block boundary, after the last transaction of
/// `block_number` has been applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockState {
    pub block_number: u64,
    pub state_root: H256,
    pub cumulative_gas_used: U256,
    /// Root of the block-hash tree seen by the *next* block.
    pub block_hash_root: H256,
}

impl BlockState {
    const FIELDS: usize = 5;

    /// A block state has no digested members, so its commitment is its full
    /// encoding.
    pub fn commitment(&self) -> Vec<u8> {
        rlp::encode(self).to_vec()
    }

    pub fn hash(&self) -> H256 {
        keccak(self.commitment())
    }
}

impl Encodable for BlockState {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(Self::FIELDS);
        s.append(&BLOCK_TAG);
        s.append(&self.block_number);
        s.append(&self.state_root);
        s.append(&self.cumulative_gas_used);
        s.append(&self.block_hash_root);
    }
}

impl Decodable for BlockState {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        expect_tagged_list(rlp, BLOCK_TAG, Self::FIELDS)?;
        Ok(Self {
            block_number: rlp.val_at(1)?,
            state_root: rlp.val_at(2)?,
            cumulative_gas_used: rlp.val_at(3)?,
            block_hash_root: rlp.val_at(4)?,
        })
    }
}
