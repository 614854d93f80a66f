//! The dispute core of an optimistic rollup: commitments to EVM execution at
//! block, transaction and opcode granularity, and the one-step proofs that
//! settle a disagreement about a single transition between them.
//!
//! # Timeline
//!
//! Both parties of a dispute address execution through the same ordered
//! sequence of [`ExecutionState`](commitment::ExecutionState)s over a block
//! range `[start, end)`:
//!
//! ```text
//! BlockState(start - 1)
//!   InterState(start, 0) [IntraState ...] InterState(start, 1) ... InterState(start, n)
//! BlockState(start)
//!   ...
//! BlockState(end - 1)
//! ```
//!
//! The post-transaction state of transaction `i` is the pre-transaction state
//! of transaction `i + 1`. A transaction only contributes
//! [`IntraState`](commitment::IntraState)s when it runs code; plain transfers
//! between externally owned accounts move directly from one inter-transaction
//! state to the next.
//!
//! [`ExecutionStateIndex`](index::ExecutionStateIndex) builds this timeline by
//! replaying blocks against an [`ExecutionBackend`](backend::ExecutionBackend),
//! feeding each traced transaction through a
//! [`StateGenerator`](generator::StateGenerator).
//!
//! # Proofs
//!
//! [`ProofAssembler`](proof::ProofAssembler) classifies the transition out of
//! a disputed step into a [`TransitionKind`](proof::TransitionKind) and
//! re-executes as little as it can to gather the sub-proofs an on-chain
//! verifier needs.
//!
//! Nothing in this crate is async. Replaying a block may take a while, so
//! callers on a latency-sensitive path should move it to a blocking thread.

#![deny(rustdoc::broken_intra_doc_links)]
#![warn(missing_debug_implementations)]

pub mod backend;
pub mod commitment;
pub mod error;
pub mod generator;
pub mod index;
pub mod opcode;
pub mod proof;
pub mod trace;
pub mod tries;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use commitment::{ExecutionState, StateType};
pub use error::{ProofError, ProofResult};
pub use index::{ExecutionStateIndex, TimelineEntry};
pub use proof::{OneStepProof, ProofAssembler, TransitionKind};

/// Parameters for replaying historical blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProofConfig {
    /// How many blocks the backend may re-execute to regenerate a state that
    /// is no longer stored.
    pub reexec: u64,
}

impl Default for ProofConfig {
    fn default() -> Self {
        Self { reexec: 128 }
    }
}
