//! The EVM trace event stream consumed by the
//! [`StateGenerator`](crate::generator::StateGenerator).
//!
//! A well-formed transaction trace looks like
//!
//! ```text
//! TxStart CallStart (Step | CallEnter .. CallExit)* CallEnd TxEnd
//! ```
//!
//! where every `CallEnter` is matched by a `CallExit` and the steps between
//! them run one call frame deeper.

use std::time::Duration;

use ethereum_types::{Address, H256, U256};

use crate::commitment::CallFlag;

/// The contract a frame is executing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Contract {
    /// Account whose storage the frame operates on.
    pub address: Address,
    pub caller: Address,
    pub value: U256,
    pub code_hash: H256,
    pub input: Vec<u8>,
}

/// Frame-local machine state at a step.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScopeContext {
    /// Bottom of the stack first.
    pub stack: Vec<U256>,
    pub memory: Vec<u8>,
    pub contract: Contract,
}

/// A single opcode step, reported before the opcode executes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepTrace {
    pub pc: u64,
    pub opcode: u8,
    pub gas: u64,
    pub cost: u64,
    pub scope: ScopeContext,
    pub return_data: Vec<u8>,
    /// Call depth, 1 for the outermost frame.
    pub depth: u64,
    /// Live state root before the opcode executes.
    pub state_root: H256,
    /// Set when the opcode faults instead of executing.
    pub error: Option<String>,
}

impl StepTrace {
    /// Stack operand `n` positions below the top.
    pub fn stack_back(&self, n: usize) -> Option<U256> {
        self.scope.stack.iter().rev().nth(n).copied()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallKind {
    Call,
    CallCode,
    DelegateCall,
    StaticCall,
    Create,
    Create2,
    /// Reported through the call hooks by the EVM, but never opens a frame.
    SelfDestruct,
}

impl CallKind {
    pub fn call_flag(self) -> Option<CallFlag> {
        match self {
            CallKind::Call => Some(CallFlag::Call),
            CallKind::CallCode => Some(CallFlag::CallCode),
            CallKind::DelegateCall => Some(CallFlag::DelegateCall),
            CallKind::StaticCall => Some(CallFlag::StaticCall),
            CallKind::Create => Some(CallFlag::Create),
            CallKind::Create2 => Some(CallFlag::Create2),
            CallKind::SelfDestruct => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TraceEvent {
    TxStart {
        gas_limit: u64,
    },
    /// Entry into the outermost frame.
    CallStart {
        from: Address,
        to: Address,
        create: bool,
        input: Vec<u8>,
        gas: u64,
        value: U256,
    },
    Step(Box<StepTrace>),
    CallEnter {
        kind: CallKind,
        from: Address,
        to: Address,
        input: Vec<u8>,
        gas: u64,
        value: U256,
    },
    CallExit {
        output: Vec<u8>,
        gas_used: u64,
        error: Option<String>,
    },
    /// Exit from the outermost frame.
    CallEnd {
        output: Vec<u8>,
        gas_used: u64,
        elapsed: Duration,
        error: Option<String>,
    },
    TxEnd {
        rest_gas: u64,
    },
}

impl TraceEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TraceEvent::TxStart { .. } => "TxStart",
            TraceEvent::CallStart { .. } => "CallStart",
            TraceEvent::Step(_) => "Step",
            TraceEvent::CallEnter { .. } => "CallEnter",
            TraceEvent::CallExit { .. } => "CallExit",
            TraceEvent::CallEnd { .. } => "CallEnd",
            TraceEvent::TxEnd { .. } => "TxEnd",
        }
    }
}
