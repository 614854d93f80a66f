use ethereum_types::{Address, H256, U256};
use keccak_hash::keccak;
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};

use super::{
    digest, expect_tagged_list, stack_hash, AccessList, LogSeries, SelfDestructSet, INTRA_TAG,
};
use crate::opcode;

/// How the executing frame was entered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CallFlag {
    Call = 0,
    CallCode = 1,
    DelegateCall = 2,
    StaticCall = 3,
    Create = 4,
    Create2 = 5,
}

impl CallFlag {
    pub fn from_opcode(op: u8) -> Option<Self> {
        Some(match op {
            opcode::CALL => Self::Call,
            opcode::CALLCODE => Self::CallCode,
            opcode::DELEGATECALL => Self::DelegateCall,
            opcode::STATICCALL => Self::StaticCall,
            opcode::CREATE => Self::Create,
            opcode::CREATE2 => Self::Create2,
            _ => return None,
        })
    }

    fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Call,
            1 => Self::CallCode,
            2 => Self::DelegateCall,
            3 => Self::StaticCall,
            4 => Self::Create,
            5 => Self::Create2,
            _ => return None,
        })
    }
}

/// Commitment at a single opcode step, taken before the opcode executes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IntraState {
    pub block_number: u64,
    pub tx_index: u64,
    /// Call depth, 1 for the outermost frame.
    pub depth: u64,
    pub call_flag: CallFlag,
    pub pc: u64,
    pub opcode: u8,
    pub gas_left: u64,
    pub cost: u64,
    pub contract: Address,
    pub caller: Address,
    pub value: U256,
    pub code_hash: H256,
    /// Where the frame's return data lands in the parent's memory.
    pub out_offset: U256,
    pub out_size: U256,
    /// Bottom of the stack first.
    pub stack: Vec<U256>,
    pub memory: Vec<u8>,
    pub input_data: Vec<u8>,
    pub return_data: Vec<u8>,
    /// State root when the transaction started executing.
    pub committed_state_root: H256,
    pub state_root: H256,
    pub block_hash_root: H256,
    pub self_destruct_set: SelfDestructSet,
    pub log_series: LogSeries,
    pub access_list: AccessList,
    /// Hash of the state one depth shallower, i.e. the state this frame
    /// returns to.
    pub last_depth_hash: H256,
}

impl IntraState {
    const FIELDS: usize = 26;

    pub fn commitment(&self) -> Vec<u8> {
        let mut s = RlpStream::new_list(Self::FIELDS);
        self.append_head(&mut s);
        s.append(&stack_hash(&self.stack));
        s.append(&digest(&self.memory));
        s.append(&digest(&self.input_data));
        s.append(&digest(&self.return_data));
        self.append_roots(&mut s);
        s.append(&self.self_destruct_set.hash());
        s.append(&self.log_series.hash());
        s.append(&self.access_list.commitment());
        s.append(&self.last_depth_hash);
        s.out().to_vec()
    }

    pub fn hash(&self) -> H256 {
        keccak(self.commitment())
    }

    /// Stack operand `n` positions below the top.
    pub fn stack_back(&self, n: usize) -> Option<U256> {
        self.stack.iter().rev().nth(n).copied()
    }

    fn append_head(&self, s: &mut RlpStream) {
        s.append(&INTRA_TAG);
        s.append(&self.block_number);
        s.append(&self.tx_index);
        s.append(&self.depth);
        s.append(&(self.call_flag as u8));
        s.append(&self.pc);
        s.append(&self.opcode);
        s.append(&self.gas_left);
        s.append(&self.cost);
        s.append(&self.contract);
        s.append(&self.caller);
        s.append(&self.value);
        s.append(&self.code_hash);
        s.append(&self.out_offset);
        s.append(&self.out_size);
    }

    fn append_roots(&self, s: &mut RlpStream) {
        s.append(&self.committed_state_root);
        s.append(&self.state_root);
        s.append(&self.block_hash_root);
    }
}

impl Encodable for IntraState {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(Self::FIELDS);
        self.append_head(s);
        s.append_list::<U256, _>(&self.stack);
        s.append(&self.memory);
        s.append(&self.input_data);
        s.append(&self.return_data);
        self.append_roots(s);
        s.append(&self.self_destruct_set);
        s.append(&self.log_series);
        s.append(&self.access_list);
        s.append(&self.last_depth_hash);
    }
}

impl Decodable for IntraState {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        expect_tagged_list(rlp, INTRA_TAG, Self::FIELDS)?;
        let call_flag = CallFlag::from_u8(rlp.val_at(4)?)
            .ok_or(DecoderError::Custom("unknown call flag"))?;
        Ok(Self {
            block_number: rlp.val_at(1)?,
            tx_index: rlp.val_at(2)?,
            depth: rlp.val_at(3)?,
            call_flag,
            pc: rlp.val_at(5)?,
            opcode: rlp.val_at(6)?,
            gas_left: rlp.val_at(7)?,
            cost: rlp.val_at(8)?,
            contract: rlp.val_at(9)?,
            caller: rlp.val_at(10)?,
            value: rlp.val_at(11)?,
            code_hash: rlp.val_at(12)?,
            out_offset: rlp.val_at(13)?,
            out_size: rlp.val_at(14)?,
            stack: rlp.list_at(15)?,
            memory: rlp.val_at(16)?,
            input_data: rlp.val_at(17)?,
            return_data: rlp.val_at(18)?,
            committed_state_root: rlp.val_at(19)?,
            state_root: rlp.val_at(20)?,
            block_hash_root: rlp.val_at(21)?,
            self_destruct_set: rlp.val_at(22)?,
            log_series: rlp.val_at(23)?,
            access_list: rlp.val_at(24)?,
            last_depth_hash: rlp.val_at(25)?,
        })
    }
}
