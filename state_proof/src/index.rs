//! The timeline of execution states over a block range, and the block replay
//! that derives it.

use std::collections::BTreeMap;
use std::ops::{Range, RangeInclusive};

use ethereum_types::{H256, U256};
use log::{debug, trace};
use rollup_common::EMPTY_CODE_HASH;

use crate::backend::{
    ExecutionBackend, L2Block, L2Transaction, ProofKey, Receipt, StateSnapshot, TraceMode,
    TxExecution,
};
use crate::commitment::{
    BlockHashTree, BlockState, ExecutionState, InterState, IntraState, SelfDestructSet, StateType,
};
use crate::error::{BackendError, BackendResultExt as _, ProofError, ProofResult};
use crate::generator::{GeneratedState, GeneratorContext, StateGenerator};
use crate::proof::TransitionKind;
use crate::tries::ordered_root;
use crate::ProofConfig;

/// One position of the timeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimelineEntry {
    pub vm_hash: H256,
    pub state_type: StateType,
    /// For block states, the block the state closes.
    pub block_number: u64,
    /// Transactions of the block applied before this state. Always zero for
    /// block states.
    pub tx_index: u64,
    /// Opcode step within the transaction, for intra-transaction states.
    pub step: Option<usize>,
    pub cumulative_gas_used: U256,
    pub block_gas_used: U256,
}

impl TimelineEntry {
    fn block(state: &BlockState) -> Self {
        Self {
            vm_hash: state.hash(),
            state_type: StateType::Block,
            block_number: state.block_number,
            tx_index: 0,
            step: None,
            cumulative_gas_used: state.cumulative_gas_used,
            block_gas_used: U256::zero(),
        }
    }

    fn inter(state: &InterState) -> Self {
        Self {
            vm_hash: state.hash(),
            state_type: StateType::Inter,
            block_number: state.block_number,
            tx_index: state.tx_index,
            step: None,
            cumulative_gas_used: state.cumulative_gas_used,
            block_gas_used: state.block_gas_used,
        }
    }

    fn intra(pre: &InterState, tx: &L2Transaction, step: usize, state: &GeneratedState) -> Self {
        let spent = U256::from(tx.gas_limit.saturating_sub(state.gas_left));
        Self {
            vm_hash: state.vm_hash,
            state_type: StateType::Intra,
            block_number: pre.block_number,
            tx_index: pre.tx_index,
            step: Some(step),
            cumulative_gas_used: pre.cumulative_gas_used + spent,
            block_gas_used: pre.block_gas_used + spent,
        }
    }
}

/// The transition out of one timeline position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DisputedTransition {
    pub step: usize,
    pub kind: TransitionKind,
    pub from: TimelineEntry,
    pub to: TimelineEntry,
}

/// The ordered execution states of a block range `[start, end)`.
///
/// Two honest parties building an index over the same range from the same
/// parent state agree on every entry. Positions are what a bisection game
/// addresses, so any difference in how entries are laid out breaks disputes
/// outright.
#[derive(Clone, Debug)]
pub struct ExecutionStateIndex {
    blocks: Range<u64>,
    config: ProofConfig,
    entries: Vec<TimelineEntry>,
}

impl ExecutionStateIndex {
    /// Replays `blocks` on top of the state after block `blocks.start - 1`,
    /// whose cumulative gas is `start_cumulative_gas`.
    pub fn build<B: ExecutionBackend>(
        backend: &B,
        blocks: Range<u64>,
        start_cumulative_gas: U256,
        config: ProofConfig,
    ) -> ProofResult<Self> {
        if blocks.is_empty() || blocks.start == 0 {
            return Err(ProofError::InvalidRange {
                start: blocks.start,
                end: blocks.end,
            });
        }

        let mut replay = BlockReplay::start(backend, blocks.start, start_cumulative_gas, config)?;
        let mut entries = vec![TimelineEntry::block(&replay.parent_state())];
        loop {
            while !replay.is_complete() {
                let replayed = replay.replay_next(None, None)?;
                entries.push(TimelineEntry::inter(&replayed.pre_state));
                entries.extend(replayed.states.iter().enumerate().map(|(step, state)| {
                    TimelineEntry::intra(&replayed.pre_state, &replayed.tx, step, state)
                }));
            }
            entries.push(TimelineEntry::inter(&replay.inter_state()?));
            let closing = replay.finalize()?;
            entries.push(TimelineEntry::block(&closing));

            if closing.block_number + 1 >= blocks.end {
                break;
            }
            replay = replay.next_block(&closing)?;
        }

        debug!(
            "indexed blocks {}..{} into {} execution states",
            blocks.start,
            blocks.end,
            entries.len()
        );
        Ok(Self {
            blocks,
            config,
            entries,
        })
    }

    pub fn blocks(&self) -> Range<u64> {
        self.blocks.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of one-step transitions, i.e. the length of the segment a
    /// challenge over this range disputes.
    pub fn num_steps(&self) -> usize {
        self.entries.len().saturating_sub(1)
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn entry(&self, step: usize) -> ProofResult<&TimelineEntry> {
        self.entries.get(step).ok_or(ProofError::StepOutOfRange {
            step,
            len: self.entries.len(),
        })
    }

    pub fn hash_at(&self, step: usize) -> Option<H256> {
        self.entries.get(step).map(|entry| entry.vm_hash)
    }

    pub fn hashes(&self) -> impl Iterator<Item = H256> + '_ {
        self.entries.iter().map(|entry| entry.vm_hash)
    }

    /// The closing block state of the range.
    pub fn last(&self) -> Option<&TimelineEntry> {
        self.entries.last()
    }

    /// Re-derives the state at `step` by replaying its block from the
    /// preceding block state.
    ///
    /// The result is checked against the recorded hash; a mismatch means the
    /// backend no longer reproduces the history this index was built from.
    pub fn at<B: ExecutionBackend>(&self, backend: &B, step: usize) -> ProofResult<ExecutionState> {
        let entry = *self.entry(step)?;
        // The opening block state is the parent state of the first block.
        let number = if step == 0 {
            self.blocks.start
        } else {
            entry.block_number
        };
        let mut replay = self.replay_block(backend, number)?;

        let state = match entry.state_type {
            StateType::Block if step == 0 => ExecutionState::from(replay.parent_state()),
            StateType::Block => {
                replay.skip_to(replay.block().transactions.len() as u64)?;
                ExecutionState::from(replay.finalize()?)
            }
            StateType::Inter => {
                replay.skip_to(entry.tx_index)?;
                ExecutionState::from(replay.inter_state()?)
            }
            StateType::Intra => {
                let tx_step = entry.step.ok_or(ProofError::MissingStep { step })?;
                replay.skip_to(entry.tx_index)?;
                let mut replayed = replay.replay_next(Some(tx_step..=tx_step), None)?;
                let state = replayed
                    .retained
                    .remove(&tx_step)
                    .ok_or(ProofError::MissingStep { step })?;
                ExecutionState::from(state)
            }
        };
        check_hash(step, entry.vm_hash, state.vm_hash())?;
        Ok(state)
    }

    /// The transition from `step` to `step + 1`.
    pub fn transition(&self, step: usize) -> ProofResult<DisputedTransition> {
        let from = *self.entry(step)?;
        let to = *self.entries.get(step + 1).ok_or(ProofError::StepOutOfRange {
            step,
            len: self.entries.len(),
        })?;
        Ok(DisputedTransition {
            step,
            kind: TransitionKind::classify(from.state_type, to.state_type)?,
            from,
            to,
        })
    }

    /// A replay of block `number`, positioned before its first transaction.
    pub(crate) fn replay_block<'a, B: ExecutionBackend>(
        &self,
        backend: &'a B,
        number: u64,
    ) -> ProofResult<BlockReplay<'a, B>> {
        let parent = self
            .entries
            .iter()
            .find(|entry| entry.state_type == StateType::Block && entry.block_number + 1 == number)
            .ok_or(ProofError::InvalidRange {
                start: number,
                end: number + 1,
            })?;
        BlockReplay::start(backend, number, parent.cumulative_gas_used, self.config)
    }
}

pub(crate) fn check_hash(step: usize, expected: H256, derived: H256) -> ProofResult<()> {
    if expected != derived {
        return Err(ProofError::Divergence {
            step,
            expected,
            derived,
        });
    }
    Ok(())
}

/// A transaction applied by [`BlockReplay::replay_next`].
pub(crate) struct ReplayedTx {
    pub tx: L2Transaction,
    pub pre_state: InterState,
    pub states: Vec<GeneratedState>,
    pub retained: BTreeMap<usize, IntraState>,
    /// The trace has been consumed by the generator and is always empty.
    pub execution: TxExecution,
}

/// Replays one block transaction by transaction on a private snapshot,
/// keeping the bookkeeping the inter-transaction states commit to.
pub(crate) struct BlockReplay<'a, B: ExecutionBackend> {
    backend: &'a B,
    block: L2Block,
    snapshot: B::Snapshot,
    hashes: BlockHashTree,
    cumulative_before: U256,
    block_gas_used: U256,
    receipts: Vec<Receipt>,
    self_destructs: SelfDestructSet,
}

impl<'a, B: ExecutionBackend> BlockReplay<'a, B> {
    pub fn start(
        backend: &'a B,
        number: u64,
        cumulative_before: U256,
        config: ProofConfig,
    ) -> ProofResult<Self> {
        let parent = number.checked_sub(1).ok_or(ProofError::InvalidRange {
            start: number,
            end: number + 1,
        })?;
        let snapshot = backend
            .snapshot_at(parent, config.reexec)
            .at_block(number)?;
        Self::resume(backend, number, snapshot, cumulative_before)
    }

    fn resume(
        backend: &'a B,
        number: u64,
        snapshot: B::Snapshot,
        cumulative_before: U256,
    ) -> ProofResult<Self> {
        let block = backend.block(number).at_block(number)?;
        let hashes = BlockHashTree::new(number, backend.block_hashes(number).at_block(number)?)?;
        debug!(
            "replaying block {number} ({} transactions)",
            block.transactions.len()
        );
        Ok(Self {
            backend,
            block,
            snapshot,
            hashes,
            cumulative_before,
            block_gas_used: U256::zero(),
            receipts: Vec::new(),
            self_destructs: SelfDestructSet::new(),
        })
    }

    pub fn block(&self) -> &L2Block {
        &self.block
    }

    pub fn snapshot(&self) -> &B::Snapshot {
        &self.snapshot
    }

    pub fn hashes(&self) -> &BlockHashTree {
        &self.hashes
    }

    pub fn receipts(&self) -> &[Receipt] {
        &self.receipts
    }

    pub fn applied(&self) -> usize {
        self.receipts.len()
    }

    pub fn is_complete(&self) -> bool {
        self.applied() == self.block.transactions.len()
    }

    /// The block state the block starts from. Only meaningful before the
    /// first transaction is applied.
    pub fn parent_state(&self) -> BlockState {
        BlockState {
            block_number: self.block.number.saturating_sub(1),
            state_root: self.snapshot.state_root(),
            cumulative_gas_used: self.cumulative_before,
            block_hash_root: self.hashes.root(),
        }
    }

    pub fn inter_state(&self) -> ProofResult<InterState> {
        let applied = &self.block.transactions[..self.applied()];
        Ok(InterState {
            block_number: self.block.number,
            tx_index: self.applied() as u64,
            state_root: self.snapshot.state_root(),
            cumulative_gas_used: self.cumulative_before + self.block_gas_used,
            block_gas_used: self.block_gas_used,
            block_hash_root: self.hashes.root(),
            transaction_root: ordered_root(applied.iter().map(|tx| &tx.envelope))?,
            receipt_root: ordered_root(self.receipts.iter().map(Receipt::encode))?,
            self_destruct_set: self.self_destructs.clone(),
        })
    }

    /// Whether `tx` runs code. Transfers to accounts without code are
    /// applied without tracing and contribute no intra-transaction states.
    pub fn runs_code(&self, tx: &L2Transaction) -> ProofResult<bool> {
        let Some(to) = tx.to else {
            return Ok(true);
        };
        let code_hash = self
            .snapshot
            .code_hash(to)
            .at(self.block.number, Some(self.applied() as u64), None)?;
        Ok(code_hash != EMPTY_CODE_HASH)
    }

    /// Applies transactions until `tx_index` of them have been applied.
    pub fn skip_to(&mut self, tx_index: u64) -> ProofResult<()> {
        while (self.applied() as u64) < tx_index {
            self.replay_next(None, None)?;
        }
        Ok(())
    }

    /// Applies the next transaction, generating its intra-transaction states
    /// when it runs code.
    pub fn replay_next(
        &mut self,
        retain: Option<RangeInclusive<usize>>,
        prove: Option<(usize, Vec<ProofKey>)>,
    ) -> ProofResult<ReplayedTx> {
        let number = self.block.number;
        let index = self.applied();
        let tx_index = index as u64;
        let tx = self
            .block
            .transactions
            .get(index)
            .cloned()
            .ok_or(BackendError::MissingTransaction {
                block_number: number,
                tx_index: index,
            })
            .at(number, Some(tx_index), None)?;

        let pre_state = self.inter_state()?;
        let traced = self.runs_code(&tx)?;
        let mode = match (traced, prove) {
            (false, _) => TraceMode::Off,
            (true, None) => TraceMode::Full,
            (true, Some((step, keys))) => TraceMode::ProveAt { step, keys },
        };
        let committed_state_root = self.snapshot.state_root();
        let mut execution = self
            .backend
            .apply_transaction(&mut self.snapshot, &self.block, index, mode)
            .at(number, Some(tx_index), None)?;

        let (states, retained, self_destructs) = if traced {
            let ctx = GeneratorContext {
                block_number: number,
                tx_index,
                committed_state_root,
                block_hash_root: self.hashes.root(),
                pre_state: pre_state.clone(),
            };
            let mut generator = StateGenerator::new(ctx);
            if let Some(steps) = retain {
                generator = generator.retaining(steps);
            }
            let output = generator
                .run(std::mem::take(&mut execution.trace))
                .map_err(|source| ProofError::Generator {
                    block_number: number,
                    tx_index,
                    source,
                })?;
            (output.states, output.retained, output.self_destruct_set)
        } else {
            (Vec::new(), BTreeMap::new(), SelfDestructSet::new())
        };
        trace!(
            "block {number} tx {index}: {} states, {} gas",
            states.len(),
            execution.receipt.gas_used
        );

        self.block_gas_used += U256::from(execution.receipt.gas_used);
        self.receipts.push(execution.receipt.clone());
        self.self_destructs = self_destructs;
        Ok(ReplayedTx {
            tx,
            pre_state,
            states,
            retained,
            execution,
        })
    }

    /// Runs post-transaction processing and returns the closing block state.
    /// Call once, after every transaction has been applied.
    pub fn finalize(&mut self) -> ProofResult<BlockState> {
        self.backend
            .finalize_block(&mut self.snapshot, &self.block)
            .at_block(self.block.number)?;
        Ok(BlockState {
            block_number: self.block.number,
            state_root: self.snapshot.state_root(),
            cumulative_gas_used: self.cumulative_before + self.block_gas_used,
            block_hash_root: self.hashes.advance(self.block.hash)?.root(),
        })
    }

    /// Continues with the following block on the same snapshot.
    pub fn next_block(self, closing: &BlockState) -> ProofResult<Self> {
        Self::resume(
            self.backend,
            self.block.number + 1,
            self.snapshot,
            closing.cumulative_gas_used,
        )
    }
}
