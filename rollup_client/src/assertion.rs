//! Locating assertions on the local L2 chain.

use std::ops::Range;
use std::sync::Arc;

use anyhow::Context as _;
use ethereum_types::U256;
use state_proof::backend::ExecutionBackend;
use state_proof::error::BackendError;
use state_proof::{ExecutionStateIndex, ProofConfig, ProofError};
use thiserror::Error;
use tracing::trace;

use crate::contracts::Assertion;
use crate::index_cache::IndexCache;

#[derive(Debug, Error)]
pub enum ValidationError {
    /// The local chain has not caught up with the assertion yet.
    #[error("local chain at block {head} has not reached inbox size {inbox_size}")]
    Deferred { inbox_size: u64, head: u64 },
    /// An assertion ended in the middle of a block. Local inbox accounting
    /// no longer matches the chain.
    #[error("inbox size {inbox_size} ends inside block {block_number}")]
    InsideBlock { inbox_size: u64, block_number: u64 },
    #[error("assertion {id} covers no blocks past its parent")]
    EmptyAssertion { id: u64 },
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Proof(#[from] ProofError),
    #[error(transparent)]
    Chain(#[from] anyhow::Error),
}

impl ValidationError {
    pub fn is_fatal(&self) -> bool {
        match self {
            ValidationError::InsideBlock { .. } => true,
            ValidationError::Proof(e) => e.is_fatal(),
            ValidationError::Deferred { .. }
            | ValidationError::EmptyAssertion { .. }
            | ValidationError::Backend(_)
            | ValidationError::Chain(_) => false,
        }
    }
}

/// The blocks an assertion covers, and the cumulative gas its parent ended
/// at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssertionRange {
    pub blocks: Range<u64>,
    pub start_cumulative_gas: U256,
}

/// Maps inbox sizes to the L2 blocks that complete them.
///
/// The inbox size after a block is the number of transactions in it and all
/// of its ancestors. Blocks are walked once, in order, and their running
/// totals kept.
#[derive(Clone, Debug)]
pub struct InboxCursor {
    /// Inbox size after block `n`, starting with genesis.
    sizes: Vec<u64>,
}

impl Default for InboxCursor {
    fn default() -> Self {
        Self::new()
    }
}

impl InboxCursor {
    pub fn new() -> Self {
        Self { sizes: vec![0] }
    }

    /// Number of blocks walked so far, genesis included.
    pub fn walked(&self) -> u64 {
        self.sizes.len() as u64
    }

    /// The first block after which the inbox holds exactly `inbox_size`
    /// messages.
    pub fn block_for<B: ExecutionBackend>(
        &mut self,
        backend: &B,
        inbox_size: u64,
    ) -> Result<u64, ValidationError> {
        loop {
            let first = self.sizes.partition_point(|&size| size < inbox_size);
            match self.sizes.get(first) {
                Some(&size) if size == inbox_size => return Ok(first as u64),
                Some(_) => {
                    return Err(ValidationError::InsideBlock {
                        inbox_size,
                        block_number: first as u64,
                    })
                }
                None => self.walk_next(backend, inbox_size)?,
            }
        }
    }

    fn walk_next<B: ExecutionBackend>(
        &mut self,
        backend: &B,
        inbox_size: u64,
    ) -> Result<(), ValidationError> {
        let number = self.walked();
        let head = backend.head()?;
        if number > head {
            return Err(ValidationError::Deferred { inbox_size, head });
        }
        let block = backend.block(number)?;
        let total =
            self.sizes.last().copied().unwrap_or_default() + block.transactions.len() as u64;
        trace!(block = number, inbox_size = total, "walked block");
        self.sizes.push(total);
        Ok(())
    }

    /// The blocks `assertion` covers on top of `parent`.
    pub fn resolve<B: ExecutionBackend>(
        &mut self,
        backend: &B,
        parent: &Assertion,
        assertion: &Assertion,
    ) -> Result<AssertionRange, ValidationError> {
        let start = self.block_for(backend, parent.inbox_size)? + 1;
        let end = self.block_for(backend, assertion.inbox_size)? + 1;
        if end <= start {
            return Err(ValidationError::EmptyAssertion { id: assertion.id });
        }
        Ok(AssertionRange {
            blocks: start..end,
            start_cumulative_gas: assertion.prev_cumulative_gas_used,
        })
    }
}

/// Local timelines of assertions, built on demand and shared through an
/// [`IndexCache`].
pub struct Timelines<B> {
    backend: Arc<B>,
    cache: IndexCache,
    config: ProofConfig,
    /// Out while a walk runs on a blocking thread.
    cursor: Option<InboxCursor>,
}

impl<B> Timelines<B>
where
    B: ExecutionBackend + Send + Sync + 'static,
{
    pub fn new(backend: Arc<B>, cache: IndexCache, config: ProofConfig) -> Self {
        Self {
            backend,
            cache,
            config,
            cursor: Some(InboxCursor::new()),
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn cache(&self) -> &IndexCache {
        &self.cache
    }

    /// The local timeline of `assertion`, built on top of `parent`.
    pub async fn get(
        &mut self,
        parent: &Assertion,
        assertion: &Assertion,
    ) -> Result<Arc<ExecutionStateIndex>, ValidationError> {
        if let Some(index) = self.cache.get(assertion.id).await {
            return Ok(index);
        }

        let range = self.resolve(*parent, *assertion).await?;
        let backend = self.backend.clone();
        let config = self.config;
        self.cache
            .get_or_build(assertion.id, move || {
                ExecutionStateIndex::build(
                    backend.as_ref(),
                    range.blocks,
                    range.start_cumulative_gas,
                    config,
                )
            })
            .await
            .map_err(|error| match error.downcast::<ProofError>() {
                Ok(error) => ValidationError::Proof(error),
                Err(error) => ValidationError::Chain(error),
            })
    }

    async fn resolve(
        &mut self,
        parent: Assertion,
        assertion: Assertion,
    ) -> Result<AssertionRange, ValidationError> {
        let mut cursor = self.cursor.take().unwrap_or_default();
        let backend = self.backend.clone();
        let (cursor, range) = tokio::task::spawn_blocking(move || {
            let range = cursor.resolve(backend.as_ref(), &parent, &assertion);
            (cursor, range)
        })
        .await
        .context("inbox walk did not complete")?;
        self.cursor = Some(cursor);
        range
    }
}

#[cfg(test)]
mod tests {
    use assert2::{check, let_assert};
    use ethereum_types::{Address, H256};
    use state_proof::testing::{ScriptedChain, ScriptedTx};

    use super::*;

    fn transfers(count: u64, nonce: &mut u64) -> Vec<ScriptedTx> {
        (0..count)
            .map(|_| {
                *nonce += 1;
                ScriptedTx::transfer(
                    Address::repeat_byte(1),
                    Address::repeat_byte(2),
                    U256::one(),
                    *nonce,
                )
            })
            .collect()
    }

    /// Blocks of 2, 0 and 3 transactions.
    fn chain() -> ScriptedChain {
        let mut nonce = 0;
        let mut chain = ScriptedChain::new();
        for count in [2, 0, 3] {
            chain.push_block(transfers(count, &mut nonce));
        }
        chain
    }

    fn assertion(id: u64, inbox_size: u64) -> Assertion {
        Assertion {
            id,
            vm_hash: H256::zero(),
            inbox_size,
            parent: id.saturating_sub(1),
            deadline: 0,
            prev_cumulative_gas_used: U256::from(42_000),
            cumulative_gas_used: U256::zero(),
        }
    }

    #[test]
    fn boundaries_land_on_the_first_block_completing_them() {
        let chain = chain();
        let mut cursor = InboxCursor::new();
        check!(cursor.block_for(&chain, 0).unwrap() == 0);
        check!(cursor.block_for(&chain, 2).unwrap() == 1);
        check!(cursor.block_for(&chain, 5).unwrap() == 3);
        // Lookups behind the walk do not walk again.
        check!(cursor.walked() == 4);
        check!(cursor.block_for(&chain, 2).unwrap() == 1);
    }

    #[test]
    fn a_boundary_inside_a_block_is_fatal() {
        let mut cursor = InboxCursor::new();
        let_assert!(
            Err(error @ ValidationError::InsideBlock { inbox_size: 4, block_number: 3 }) =
                cursor.block_for(&chain(), 4)
        );
        check!(error.is_fatal());
    }

    #[test]
    fn sizes_past_the_head_are_deferred() {
        let mut chain = chain();
        let mut cursor = InboxCursor::new();
        let_assert!(
            Err(error @ ValidationError::Deferred { inbox_size: 6, head: 3 }) =
                cursor.block_for(&chain, 6)
        );
        check!(!error.is_fatal());

        let mut nonce = 100;
        chain.push_block(transfers(1, &mut nonce));
        check!(cursor.block_for(&chain, 6).unwrap() == 4);
    }

    #[test]
    fn assertions_resolve_to_block_ranges() {
        let chain = chain();
        let mut cursor = InboxCursor::new();
        let range = cursor
            .resolve(&chain, &assertion(1, 2), &assertion(2, 5))
            .unwrap();
        check!(range.blocks == (2..4));
        check!(range.start_cumulative_gas == U256::from(42_000));

        let_assert!(
            Err(ValidationError::EmptyAssertion { id: 3 }) =
                cursor.resolve(&chain, &assertion(2, 5), &assertion(3, 5))
        );
    }
}
