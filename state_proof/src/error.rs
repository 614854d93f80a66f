use ethereum_types::H256;
use thiserror::Error;

use crate::commitment::StateType;

/// Errors surfaced while turning a trace event stream into intra-transaction
/// states.
///
/// Every variant is an invariant violation: the generator fails closed and
/// never hands out a partial sequence once one of these has been raised.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GeneratorError {
    #[error("unexpected `{event}` event while {phase}")]
    UnexpectedEvent {
        event: &'static str,
        phase: &'static str,
    },
    #[error("step reported at depth {got}, but {expected} call frames are open")]
    DepthMismatch { expected: usize, got: usize },
    #[error("nested call entered without a preceding call opcode")]
    MissingCallContext,
    #[error("trace event received after generation completed")]
    AfterCompletion,
    #[error("generated states requested before generation completed")]
    NotComplete,
}

/// Failures reported by an [`ExecutionBackend`](crate::backend::ExecutionBackend).
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("block {0} is not known to the backend")]
    MissingBlock(u64),
    #[error("state after block {0} is not available")]
    MissingState(u64),
    #[error("transaction {tx_index} of block {block_number} was not found")]
    MissingTransaction { block_number: u64, tx_index: usize },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// An error from the underlying trie implementation.
#[derive(Debug, Error)]
#[error("trie operation failed: {0}")]
pub struct TrieError(pub String);

/// Errors raised while building a timeline or assembling a one-step proof.
#[derive(Debug, Error)]
pub enum ProofError {
    #[error("block range {start}..{end} is empty or starts at genesis")]
    InvalidRange { start: u64, end: u64 },
    #[error(
        "bad start state: step {step} refers to transaction {tx_index} but block {block_number} has {tx_count}"
    )]
    BadStartState {
        step: usize,
        block_number: u64,
        tx_index: u64,
        tx_count: usize,
    },
    #[error("step {step} is out of range for a timeline of {len} states")]
    StepOutOfRange { step: usize, len: usize },
    #[error("no one-step transition leads from {from} to {to}")]
    InvalidTransition { from: StateType, to: StateType },
    #[error("state generation failed at block {block_number}, tx {tx_index}: {source}")]
    Generator {
        block_number: u64,
        tx_index: u64,
        #[source]
        source: GeneratorError,
    },
    #[error("re-derived state at step {step} hashes to {derived:?}, the timeline recorded {expected:?}")]
    Divergence {
        step: usize,
        expected: H256,
        derived: H256,
    },
    #[error("re-executed transaction produced no state at step {step}")]
    MissingStep { step: usize },
    #[error("backend failure at block {block_number} (tx {tx_index:?}, step {step:?}): {source}")]
    Backend {
        block_number: u64,
        tx_index: Option<u64>,
        step: Option<usize>,
        #[source]
        source: BackendError,
    },
    #[error(transparent)]
    Trie(#[from] TrieError),
}

impl ProofError {
    /// Whether the error means the local replica no longer matches chain
    /// history. Non-fatal errors may be retried.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ProofError::Backend { .. })
    }
}

pub type ProofResult<T> = Result<T, ProofError>;

/// Attaches block/tx/step context to backend failures.
pub(crate) trait BackendResultExt<T> {
    fn at(self, block_number: u64, tx_index: Option<u64>, step: Option<usize>) -> ProofResult<T>;

    fn at_block(self, block_number: u64) -> ProofResult<T>
    where
        Self: Sized,
    {
        self.at(block_number, None, None)
    }
}

impl<T> BackendResultExt<T> for Result<T, BackendError> {
    fn at(self, block_number: u64, tx_index: Option<u64>, step: Option<usize>) -> ProofResult<T> {
        self.map_err(|source| ProofError::Backend {
            block_number,
            tx_index,
            step,
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_backend_failures_are_retryable() {
        let backend = ProofError::Backend {
            block_number: 7,
            tx_index: Some(1),
            step: None,
            source: BackendError::MissingState(6),
        };
        assert!(!backend.is_fatal());
        assert!(backend.to_string().contains("block 7"));

        let out_of_range = ProofError::StepOutOfRange { step: 9, len: 4 };
        assert!(out_of_range.is_fatal());
    }
}
