//! Hash commitments to EVM execution at block, transaction and opcode
//! granularity.
//!
//! Every state has two encodings:
//! - the *commitment*, an RLP list whose large members (stack, memory,
//!   call data, return data and the accumulators) are replaced by digests.
//!   Its keccak hash is the state's [`vm_hash`](ExecutionState::vm_hash), the
//!   value parties compare during a dispute.
//! - the *full* encoding ([`rlp::Encodable`]), which carries every member and
//!   decodes back to an identical state.
//!
//! Both encodings start with a variant tag, so states of different kinds never
//! share a commitment.

mod access_list;
mod block;
mod block_hash;
mod inter;
mod intra;
mod log_series;
mod self_destruct;

use std::fmt;

pub use access_list::AccessList;
pub use block::BlockState;
pub use block_hash::BlockHashTree;
use enum_as_inner::EnumAsInner;
use ethereum_types::{H256, U256};
pub use inter::InterState;
pub use intra::{CallFlag, IntraState};
use keccak_hash::keccak;
pub use log_series::{Log, LogSeries};
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use rollup_common::ZERO_HASH;
pub use self_destruct::SelfDestructSet;

pub(crate) const BLOCK_TAG: u8 = 0;
pub(crate) const INTER_TAG: u8 = 1;
pub(crate) const INTRA_TAG: u8 = 2;

/// Digest of a byte blob as it enters a commitment. Empty and absent blobs
/// are the same thing and both commit to [`ZERO_HASH`].
pub fn digest(bytes: &[u8]) -> H256 {
    if bytes.is_empty() {
        ZERO_HASH
    } else {
        keccak(bytes)
    }
}

/// Hash chain over the stack words, bottom first.
pub fn stack_hash(stack: &[U256]) -> H256 {
    stack.iter().fold(ZERO_HASH, |acc, word| {
        let mut preimage = [0u8; 64];
        preimage[..32].copy_from_slice(acc.as_bytes());
        word.to_big_endian(&mut preimage[32..]);
        keccak(preimage)
    })
}

fn expect_tagged_list(rlp: &Rlp, tag: u8, fields: usize) -> Result<(), DecoderError> {
    if rlp.item_count()? != fields {
        return Err(DecoderError::RlpIncorrectListLen);
    }
    if rlp.val_at::<u8>(0)? != tag {
        return Err(DecoderError::Custom("unexpected execution state tag"));
    }
    Ok(())
}

/// Granularity of an [`ExecutionState`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StateType {
    Block,
    Inter,
    Intra,
}

impl fmt::Display for StateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StateType::Block => "BlockState",
            StateType::Inter => "InterState",
            StateType::Intra => "IntraState",
        })
    }
}

/// A point on the execution timeline.
///
/// Two states are equal iff their [`vm_hash`](Self::vm_hash)es are.
#[derive(Clone, Debug, EnumAsInner)]
pub enum ExecutionState {
    Block(BlockState),
    Inter(InterState),
    Intra(Box<IntraState>),
}

impl ExecutionState {
    pub fn state_type(&self) -> StateType {
        match self {
            ExecutionState::Block(_) => StateType::Block,
            ExecutionState::Inter(_) => StateType::Inter,
            ExecutionState::Intra(_) => StateType::Intra,
        }
    }

    pub fn commitment(&self) -> Vec<u8> {
        match self {
            ExecutionState::Block(state) => state.commitment(),
            ExecutionState::Inter(state) => state.commitment(),
            ExecutionState::Intra(state) => state.commitment(),
        }
    }

    pub fn vm_hash(&self) -> H256 {
        keccak(self.commitment())
    }

    pub fn block_number(&self) -> u64 {
        match self {
            ExecutionState::Block(state) => state.block_number,
            ExecutionState::Inter(state) => state.block_number,
            ExecutionState::Intra(state) => state.block_number,
        }
    }

    /// The state a nested frame returns to, once the `cost` of the call
    /// opcode that entered it has been charged.
    ///
    /// Only intra-transaction states change: the outermost frame of a
    /// transaction returns to the preceding inter-transaction state as is.
    pub fn as_last_depth(&self, cost: u64) -> ExecutionState {
        match self {
            ExecutionState::Intra(state) => {
                let mut state = state.clone();
                state.gas_left = state.gas_left.saturating_sub(cost);
                ExecutionState::Intra(state)
            }
            ExecutionState::Block(_) | ExecutionState::Inter(_) => self.clone(),
        }
    }
}

impl PartialEq for ExecutionState {
    fn eq(&self, other: &Self) -> bool {
        self.vm_hash() == other.vm_hash()
    }
}

impl Eq for ExecutionState {}

impl From<BlockState> for ExecutionState {
    fn from(state: BlockState) -> Self {
        ExecutionState::Block(state)
    }
}

impl From<InterState> for ExecutionState {
    fn from(state: InterState) -> Self {
        ExecutionState::Inter(state)
    }
}

impl From<IntraState> for ExecutionState {
    fn from(state: IntraState) -> Self {
        ExecutionState::Intra(Box::new(state))
    }
}

impl Encodable for ExecutionState {
    fn rlp_append(&self, s: &mut RlpStream) {
        match self {
            ExecutionState::Block(state) => state.rlp_append(s),
            ExecutionState::Inter(state) => state.rlp_append(s),
            ExecutionState::Intra(state) => state.rlp_append(s),
        }
    }
}

impl Decodable for ExecutionState {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        match rlp.val_at::<u8>(0)? {
            BLOCK_TAG => BlockState::decode(rlp).map(Self::Block),
            INTER_TAG => InterState::decode(rlp).map(Self::Inter),
            INTRA_TAG => IntraState::decode(rlp).map(|it| Self::Intra(Box::new(it))),
            _ => Err(DecoderError::Custom("unknown execution state tag")),
        }
    }
}

#[cfg(test)]
mod tests {
    use ethereum_types::Address;

    use super::*;

    fn intra() -> IntraState {
        IntraState {
            block_number: 12,
            tx_index: 1,
            depth: 2,
            call_flag: CallFlag::DelegateCall,
            pc: 17,
            opcode: crate::opcode::SSTORE,
            gas_left: 50_000,
            cost: 20_000,
            contract: Address::repeat_byte(0xc0),
            caller: Address::repeat_byte(0xca),
            value: U256::from(3),
            code_hash: H256::repeat_byte(0xcd),
            out_offset: U256::from(64),
            out_size: U256::from(32),
            stack: vec![U256::from(1), U256::from(2), U256::MAX],
            memory: vec![0; 96],
            input_data: vec![0xde, 0xad],
            return_data: vec![],
            committed_state_root: H256::repeat_byte(1),
            state_root: H256::repeat_byte(2),
            block_hash_root: H256::repeat_byte(3),
            self_destruct_set: [Address::repeat_byte(0xde)].into_iter().collect(),
            log_series: LogSeries::from_logs([Log {
                address: Address::repeat_byte(0xc0),
                topics: vec![H256::repeat_byte(7)],
                data: vec![1, 2, 3],
            }]),
            access_list: AccessList::new()
                .with_address(Address::repeat_byte(0xc0))
                .with_slot(Address::repeat_byte(0xc0), H256::repeat_byte(9)),
            last_depth_hash: H256::repeat_byte(4),
        }
    }

    fn inter() -> InterState {
        InterState {
            block_number: 12,
            tx_index: 2,
            state_root: H256::repeat_byte(5),
            cumulative_gas_used: U256::from(1_000_000),
            block_gas_used: U256::from(42_000),
            block_hash_root: H256::repeat_byte(3),
            transaction_root: H256::repeat_byte(6),
            receipt_root: H256::repeat_byte(7),
            self_destruct_set: [Address::repeat_byte(0xde)].into_iter().collect(),
        }
    }

    fn block() -> BlockState {
        BlockState {
            block_number: 12,
            state_root: H256::repeat_byte(5),
            cumulative_gas_used: U256::from(1_000_000),
            block_hash_root: H256::repeat_byte(8),
        }
    }

    #[test]
    fn hash_survives_a_round_trip() {
        for state in [
            ExecutionState::from(block()),
            ExecutionState::from(inter()),
            ExecutionState::from(intra()),
        ] {
            let decoded: ExecutionState = rlp::decode(&rlp::encode(&state)).unwrap();
            assert_eq!(decoded.vm_hash(), state.vm_hash());
            assert_eq!(decoded.state_type(), state.state_type());
        }
    }

    #[test]
    fn every_committed_member_moves_the_hash() {
        let base = intra();
        let mut memory = intra();
        memory.memory[95] = 1;
        let mut stack = intra();
        stack.stack.push(U256::zero());
        let mut logs = intra();
        logs.log_series = LogSeries::new();
        let mut parent = intra();
        parent.last_depth_hash = H256::zero();

        for changed in [memory, stack, logs, parent] {
            assert_ne!(changed.hash(), base.hash());
        }
    }

    #[test]
    fn variants_never_share_a_commitment() {
        assert_ne!(
            ExecutionState::from(block()).vm_hash(),
            ExecutionState::from(inter()).vm_hash()
        );
    }

    #[test]
    fn last_depth_conversion_charges_the_call() {
        let state = ExecutionState::from(intra());
        let parent = state.as_last_depth(700);
        assert_eq!(parent.as_intra().unwrap().gas_left, 49_300);

        let boundary = ExecutionState::from(inter());
        assert_eq!(boundary.as_last_depth(700), boundary);
    }

    #[test]
    fn empty_stack_and_blobs_commit_to_zero() {
        assert_eq!(stack_hash(&[]), ZERO_HASH);
        assert_eq!(digest(&[]), ZERO_HASH);
    }
}
