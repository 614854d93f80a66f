//! Turns the trace of one transaction into its sequence of [`IntraState`]
//! commitments.
//!
//! The generator is an explicit state machine over [`Phase`]. Events are
//! either pushed one at a time through [`StateGenerator::feed`] or pulled from
//! an iterator by [`StateGenerator::run`]. The first invariant violation moves
//! it to [`Phase::Failed`], after which every event is ignored and no states
//! are handed out.
//!
//! Frame-scoped accumulators (self-destruct set, log series, access list) are
//! persistent values. Entering a nested call stores the current value in the
//! new frame; a reverted exit switches back to it.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;

use ethereum_types::{Address, BigEndianHash as _, H256, U256};
use log::{debug, trace};

use crate::commitment::{
    AccessList, CallFlag, ExecutionState, InterState, IntraState, Log, LogSeries, SelfDestructSet,
};
use crate::error::GeneratorError;
use crate::opcode;
use crate::trace::{CallKind, StepTrace, TraceEvent};

/// Memory windows beyond this are never materialized. An EVM that reports
/// such a window without faulting is not one we can commit to anyway.
const MAX_MEMORY_WINDOW: u64 = u32::MAX as u64;

/// The pair committed for every opcode step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GeneratedState {
    pub vm_hash: H256,
    pub gas_left: u64,
}

/// Inputs that stay fixed while one transaction is traced.
#[derive(Clone, Debug)]
pub struct GeneratorContext {
    pub block_number: u64,
    pub tx_index: u64,
    /// State root before the transaction, the baseline reverts fall back to.
    pub committed_state_root: H256,
    pub block_hash_root: H256,
    /// The inter-transaction state the transaction starts from.
    pub pre_state: InterState,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    Ready,
    InTransaction,
    Executing,
    Done,
    Failed(GeneratorError),
}

impl Phase {
    fn describe(&self) -> &'static str {
        match self {
            Phase::Ready => "waiting for the transaction to start",
            Phase::InTransaction => "waiting for the outermost call",
            Phase::Executing => "executing",
            Phase::Done => "done",
            Phase::Failed(_) => "failed",
        }
    }
}

#[derive(Clone, Debug, Default)]
struct Accumulators {
    self_destructs: SelfDestructSet,
    logs: LogSeries,
    access_list: AccessList,
}

#[derive(Clone, Debug)]
struct Frame {
    call_flag: CallFlag,
    input: Vec<u8>,
    out_offset: U256,
    out_size: U256,
    last_depth_hash: H256,
    /// Accumulators when the frame was entered.
    snapshot: Accumulators,
}

/// Context a call opcode leaves for the frame it is about to open.
#[derive(Clone, Debug)]
struct PendingCall {
    out_offset: U256,
    out_size: U256,
    last_depth_hash: H256,
}

/// Side effects of the previous opcode, applied once it has executed.
#[derive(Clone, Debug, Default)]
struct PendingEffects {
    log: Option<Log>,
    address: Option<Address>,
    slot: Option<(Address, H256)>,
}

/// Everything a completed generation produced.
#[derive(Clone, Debug)]
pub struct GeneratorOutput {
    pub states: Vec<GeneratedState>,
    /// Full states for the retained step range, keyed by step index.
    pub retained: BTreeMap<usize, IntraState>,
    pub self_destruct_set: SelfDestructSet,
    pub log_series: LogSeries,
    pub rest_gas: Option<u64>,
}

#[derive(Debug)]
pub struct StateGenerator {
    ctx: GeneratorContext,
    phase: Phase,
    frames: Vec<Frame>,
    current: Accumulators,
    pending_effects: PendingEffects,
    pending_call: Option<PendingCall>,
    skip_next_exit: bool,
    states: Vec<GeneratedState>,
    retain: Option<RangeInclusive<usize>>,
    retained: BTreeMap<usize, IntraState>,
    rest_gas: Option<u64>,
}

impl StateGenerator {
    pub fn new(ctx: GeneratorContext) -> Self {
        Self {
            ctx,
            phase: Phase::Ready,
            frames: Vec::new(),
            current: Accumulators::default(),
            pending_effects: PendingEffects::default(),
            pending_call: None,
            skip_next_exit: false,
            states: Vec::new(),
            retain: None,
            retained: BTreeMap::new(),
            rest_gas: None,
        }
    }

    /// Keep the full [`IntraState`]s of the given steps, not just their
    /// hashes.
    pub fn retaining(mut self, steps: RangeInclusive<usize>) -> Self {
        self.retain = Some(steps);
        self
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    /// Drives the generator with every event of `events`, stopping at the
    /// first error.
    pub fn run(
        mut self,
        events: impl IntoIterator<Item = TraceEvent>,
    ) -> Result<GeneratorOutput, GeneratorError> {
        for event in events {
            self.feed(event)?;
        }
        self.finish()
    }

    pub fn feed(&mut self, event: TraceEvent) -> Result<(), GeneratorError> {
        if let Phase::Failed(_) = self.phase {
            trace!("ignoring {} event of a failed generator", event.name());
            return Ok(());
        }
        let result = self.apply(event);
        if let Err(e) = &result {
            debug!(
                "state generation for block {} tx {} failed: {e}",
                self.ctx.block_number, self.ctx.tx_index
            );
            self.phase = Phase::Failed(e.clone());
        }
        result
    }

    /// The `(hash, gas left)` pair of every step, in step order.
    pub fn generated_states(&self) -> Result<&[GeneratedState], GeneratorError> {
        match &self.phase {
            Phase::Done => Ok(&self.states),
            Phase::Failed(e) => Err(e.clone()),
            _ => Err(GeneratorError::NotComplete),
        }
    }

    pub fn finish(self) -> Result<GeneratorOutput, GeneratorError> {
        self.generated_states()?;
        Ok(GeneratorOutput {
            states: self.states,
            retained: self.retained,
            self_destruct_set: self.current.self_destructs,
            log_series: self.current.logs,
            rest_gas: self.rest_gas,
        })
    }

    fn apply(&mut self, event: TraceEvent) -> Result<(), GeneratorError> {
        match (self.phase.clone(), event) {
            (Phase::Ready, TraceEvent::TxStart { .. }) => {
                self.phase = Phase::InTransaction;
                Ok(())
            }
            (
                Phase::Ready | Phase::InTransaction,
                TraceEvent::CallStart {
                    from,
                    to,
                    create,
                    input,
                    ..
                },
            ) => {
                self.on_call_start(from, to, create, input);
                Ok(())
            }
            (Phase::Executing, TraceEvent::Step(step)) => self.on_step(*step),
            (Phase::Executing, TraceEvent::CallEnter { kind, from, to, input, .. }) => {
                self.on_call_enter(kind, from, to, input)
            }
            (Phase::Executing, TraceEvent::CallExit { error, .. }) => {
                self.on_call_exit(error.is_some());
                Ok(())
            }
            (Phase::Executing, TraceEvent::CallEnd { error, .. }) => {
                self.on_call_end(error.is_some());
                Ok(())
            }
            (Phase::Done, TraceEvent::TxEnd { rest_gas }) => {
                self.rest_gas = Some(rest_gas);
                Ok(())
            }
            (Phase::Done, _) => Err(GeneratorError::AfterCompletion),
            (phase, event) => Err(GeneratorError::UnexpectedEvent {
                event: event.name(),
                phase: phase.describe(),
            }),
        }
    }

    fn on_call_start(&mut self, from: Address, to: Address, create: bool, input: Vec<u8>) {
        self.current = Accumulators {
            access_list: AccessList::new().with_address(from).with_address(to),
            ..Accumulators::default()
        };
        let pre_state = ExecutionState::from(self.ctx.pre_state.clone());
        self.frames.push(Frame {
            call_flag: if create {
                CallFlag::Create
            } else {
                CallFlag::Call
            },
            input,
            out_offset: U256::zero(),
            out_size: U256::zero(),
            last_depth_hash: pre_state.as_last_depth(0).vm_hash(),
            snapshot: self.current.clone(),
        });
        self.phase = Phase::Executing;
    }

    fn on_step(&mut self, step: StepTrace) -> Result<(), GeneratorError> {
        self.flush_effects();
        // A call opcode that did not open a frame (failed pre-checks).
        self.pending_call = None;

        let frame = match self.frames.last() {
            Some(frame) if frame_depth(&self.frames) == step.depth => frame,
            _ => {
                return Err(GeneratorError::DepthMismatch {
                    expected: self.frames.len(),
                    got: step.depth as usize,
                })
            }
        };

        let index = self.states.len();
        let state = IntraState {
            block_number: self.ctx.block_number,
            tx_index: self.ctx.tx_index,
            depth: step.depth,
            call_flag: frame.call_flag,
            pc: step.pc,
            opcode: step.opcode,
            gas_left: step.gas,
            cost: step.cost,
            contract: step.scope.contract.address,
            caller: step.scope.contract.caller,
            value: step.scope.contract.value,
            code_hash: step.scope.contract.code_hash,
            out_offset: frame.out_offset,
            out_size: frame.out_size,
            stack: step.scope.stack.clone(),
            memory: step.scope.memory.clone(),
            input_data: frame.input.clone(),
            return_data: step.return_data.clone(),
            committed_state_root: self.ctx.committed_state_root,
            state_root: step.state_root,
            block_hash_root: self.ctx.block_hash_root,
            self_destruct_set: self.current.self_destructs.clone(),
            log_series: self.current.logs.clone(),
            access_list: self.current.access_list.clone(),
            last_depth_hash: frame.last_depth_hash,
        };
        self.states.push(GeneratedState {
            vm_hash: state.hash(),
            gas_left: step.gas,
        });

        if step.error.is_none() {
            self.record_effects(&step, &state);
        }
        if self
            .retain
            .as_ref()
            .is_some_and(|range| range.contains(&index))
        {
            self.retained.insert(index, state);
        }
        Ok(())
    }

    fn record_effects(&mut self, step: &StepTrace, state: &IntraState) {
        let op = step.opcode;
        let contract = step.scope.contract.address;

        if let Some(topics) = opcode::log_topics(op) {
            let offset = step.stack_back(0).unwrap_or_default();
            let size = step.stack_back(1).unwrap_or_default();
            self.pending_effects.log = Some(Log {
                address: contract,
                topics: (0..topics)
                    .filter_map(|i| step.stack_back(2 + i))
                    .map(|word| H256::from_uint(&word))
                    .collect(),
                data: read_memory(&step.scope.memory, offset, size),
            });
        }
        if let Some(word) = opcode::accessed_address_operand(op).and_then(|n| step.stack_back(n)) {
            self.pending_effects.address = Some(word_to_address(word));
        }
        if let Some(word) = opcode::accessed_slot_operand(op).and_then(|n| step.stack_back(n)) {
            self.pending_effects.slot = Some((contract, H256::from_uint(&word)));
        }
        if CallFlag::from_opcode(op).is_some() {
            // Operand positions differ between call flavours, see
            // `opcode::call_output_operands`.
            let (out_offset, out_size) = opcode::call_output_operands(op)
                .map(|(offset, size)| {
                    (
                        step.stack_back(offset).unwrap_or_default(),
                        step.stack_back(size).unwrap_or_default(),
                    )
                })
                .unwrap_or_default();
            let here = ExecutionState::from(state.clone());
            self.pending_call = Some(PendingCall {
                out_offset,
                out_size,
                last_depth_hash: here.as_last_depth(step.cost).vm_hash(),
            });
        }
    }

    fn flush_effects(&mut self) {
        let PendingEffects { log, address, slot } = std::mem::take(&mut self.pending_effects);
        if let Some(log) = log {
            self.current.logs = self.current.logs.append(log);
        }
        if let Some(address) = address {
            self.current.access_list = self.current.access_list.with_address(address);
        }
        if let Some((address, slot)) = slot {
            self.current.access_list = self.current.access_list.with_slot(address, slot);
        }
    }

    fn on_call_enter(
        &mut self,
        kind: CallKind,
        from: Address,
        to: Address,
        input: Vec<u8>,
    ) -> Result<(), GeneratorError> {
        self.flush_effects();

        let Some(call_flag) = kind.call_flag() else {
            // SELFDESTRUCT: `from` is the contract being destroyed.
            self.current.self_destructs = self.current.self_destructs.insert(from);
            self.skip_next_exit = true;
            return Ok(());
        };
        let pending = self
            .pending_call
            .take()
            .ok_or(GeneratorError::MissingCallContext)?;

        self.current.access_list = self.current.access_list.with_address(to);
        self.frames.push(Frame {
            call_flag,
            input,
            out_offset: pending.out_offset,
            out_size: pending.out_size,
            last_depth_hash: pending.last_depth_hash,
            snapshot: self.current.clone(),
        });
        trace!("entered {kind:?} frame at depth {}", self.frames.len());
        Ok(())
    }

    fn on_call_exit(&mut self, reverted: bool) {
        if std::mem::take(&mut self.skip_next_exit) {
            return;
        }
        self.flush_effects();
        self.pending_call = None;
        // The outermost frame is closed by `CallEnd`.
        if self.frames.len() <= 1 {
            return;
        }
        if let Some(frame) = self.frames.pop() {
            if reverted {
                self.current = frame.snapshot;
            }
        }
    }

    fn on_call_end(&mut self, reverted: bool) {
        self.flush_effects();
        if reverted {
            if let Some(outermost) = self.frames.first() {
                self.current = outermost.snapshot.clone();
            }
        }
        self.frames.clear();
        self.phase = Phase::Done;
        trace!(
            "generated {} states for block {} tx {}",
            self.states.len(),
            self.ctx.block_number,
            self.ctx.tx_index
        );
    }
}

fn frame_depth(frames: &[Frame]) -> u64 {
    frames.len() as u64
}

fn word_to_address(word: U256) -> Address {
    Address::from(H256::from_uint(&word))
}

/// `size` bytes of memory at `offset`, zero-padded past the end of memory.
fn read_memory(memory: &[u8], offset: U256, size: U256) -> Vec<u8> {
    if size.is_zero() || offset > U256::from(MAX_MEMORY_WINDOW) || size > U256::from(MAX_MEMORY_WINDOW)
    {
        return Vec::new();
    }
    let (offset, size) = (offset.low_u64() as usize, size.low_u64() as usize);
    let mut data = vec![0; size];
    if offset < memory.len() {
        let end = memory.len().min(offset + size);
        data[..end - offset].copy_from_slice(&memory[offset..end]);
    }
    data
}

#[cfg(test)]
mod tests {
    use assert2::{check, let_assert};
    use rollup_common::EMPTY_TRIE_HASH;

    use super::*;
    use crate::testing::TraceBuilder;

    fn ctx() -> GeneratorContext {
        GeneratorContext {
            block_number: 3,
            tx_index: 0,
            committed_state_root: H256::repeat_byte(0x11),
            block_hash_root: EMPTY_TRIE_HASH,
            pre_state: InterState {
                block_number: 3,
                tx_index: 0,
                state_root: H256::repeat_byte(0x11),
                cumulative_gas_used: U256::zero(),
                block_gas_used: U256::zero(),
                block_hash_root: EMPTY_TRIE_HASH,
                transaction_root: EMPTY_TRIE_HASH,
                receipt_root: EMPTY_TRIE_HASH,
                self_destruct_set: SelfDestructSet::new(),
            },
        }
    }

    const SENDER: Address = Address::repeat_byte(0x5e);
    const TARGET: Address = Address::repeat_byte(0xc0);
    const CHILD: Address = Address::repeat_byte(0xc1);

    #[test]
    fn reverted_call_rolls_accumulators_back() {
        let events = TraceBuilder::transaction(SENDER, TARGET, vec![], 100_000)
            .log(vec![H256::repeat_byte(1)], vec![0xaa])
            .step(opcode::PUSH1)
            .call(CallKind::Call, CHILD)
            .sstore(H256::repeat_byte(2), U256::one())
            .log(vec![], vec![0xbb])
            .selfdestruct(SENDER)
            .exit(Some("execution reverted"))
            .step(opcode::STOP)
            .finish(None);

        // Accumulators as seen by the step right after the call opcode
        // (inside the child) and by the first step after the revert.
        let calls = events
            .iter()
            .filter(|event| matches!(event, TraceEvent::Step(_)))
            .count();
        let generator = StateGenerator::new(ctx()).retaining(0..=calls);
        let output = generator.run(events).unwrap();

        let call_step = output
            .retained
            .values()
            .find(|state| state.opcode == opcode::CALL)
            .unwrap();
        let first_in_child = output
            .retained
            .values()
            .find(|state| state.depth == 2)
            .unwrap();
        let after_revert = output.retained.values().last().unwrap();

        check!(first_in_child.log_series == call_step.log_series);
        check!(after_revert.depth == 1);
        check!(after_revert.log_series == first_in_child.log_series);
        check!(after_revert.self_destruct_set == first_in_child.self_destruct_set);
        check!(after_revert.access_list == first_in_child.access_list);
        check!(after_revert.access_list.contains_address(&CHILD));
        check!(!after_revert.access_list.contains_slot(&CHILD, &H256::repeat_byte(2)));
        check!(output.self_destruct_set.is_empty());
        check!(output.log_series.len() == 1);
    }

    #[test]
    fn successful_nested_effects_accumulate() {
        let output = StateGenerator::new(ctx())
            .run(
                TraceBuilder::transaction(SENDER, TARGET, vec![], 100_000)
                    .call(CallKind::Call, CHILD)
                    .log(vec![], vec![1])
                    .selfdestruct(SENDER)
                    .exit(None)
                    .step(opcode::STOP)
                    .finish(None),
            )
            .unwrap();

        check!(output.self_destruct_set.addresses() == vec![CHILD]);
        check!(output.log_series.len() == 1);
    }

    #[test]
    fn selfdestruct_does_not_open_a_frame() {
        let output = StateGenerator::new(ctx())
            .retaining(0..=10)
            .run(
                TraceBuilder::transaction(SENDER, TARGET, vec![], 100_000)
                    .selfdestruct(SENDER)
                    .step(opcode::STOP)
                    .finish(None),
            )
            .unwrap();

        let last = output.retained.values().last().unwrap();
        check!(last.depth == 1);
        check!(last.self_destruct_set.addresses() == vec![TARGET]);
    }

    #[test]
    fn output_window_is_read_positionally() {
        let trace = |kind| {
            StateGenerator::new(ctx())
                .retaining(0..=10)
                .run(
                    TraceBuilder::transaction(SENDER, TARGET, vec![], 100_000)
                        .call_with_output(kind, CHILD, 0x40, 0x20)
                        .step(opcode::STOP)
                        .exit(None)
                        .finish(None),
                )
                .unwrap()
        };

        for kind in [
            CallKind::Call,
            CallKind::CallCode,
            CallKind::DelegateCall,
            CallKind::StaticCall,
        ] {
            let output = trace(kind);
            let child = output.retained.values().find(|s| s.depth == 2).unwrap();
            check!(child.out_offset == U256::from(0x40), "{kind:?}");
            check!(child.out_size == U256::from(0x20), "{kind:?}");
            check!(Some(child.call_flag) == kind.call_flag());
        }
    }

    #[test]
    fn child_points_back_at_the_charged_parent_state() {
        let output = StateGenerator::new(ctx())
            .retaining(0..=10)
            .run(
                TraceBuilder::transaction(SENDER, TARGET, vec![], 100_000)
                    .call(CallKind::Call, CHILD)
                    .step(opcode::STOP)
                    .exit(None)
                    .finish(None),
            )
            .unwrap();

        let call = output.retained.values().find(|s| s.depth == 1).unwrap();
        let child = output.retained.values().find(|s| s.depth == 2).unwrap();
        let mut charged = call.clone();
        charged.gas_left -= call.cost;
        check!(child.last_depth_hash == charged.hash());

        let pre = ExecutionState::from(ctx().pre_state).vm_hash();
        check!(call.last_depth_hash == pre);
    }

    #[test]
    fn states_are_unavailable_before_completion() {
        let mut generator = StateGenerator::new(ctx());
        let mut events = TraceBuilder::transaction(SENDER, TARGET, vec![], 100_000)
            .step(opcode::STOP)
            .finish(None);
        events.truncate(3);
        for event in events {
            generator.feed(event).unwrap();
        }
        let_assert!(Err(GeneratorError::NotComplete) = generator.generated_states());
    }

    #[test]
    fn fails_closed_after_an_invariant_violation() {
        let mut events = TraceBuilder::transaction(SENDER, TARGET, vec![], 100_000)
            .step(opcode::STOP)
            .finish(None);
        // A step claiming to run two frames deep with only one open.
        let TraceEvent::Step(mut bogus) = events[2].clone() else {
            unreachable!()
        };
        bogus.depth = 2;
        events.insert(2, TraceEvent::Step(bogus));

        let mut generator = StateGenerator::new(ctx());
        let mut results = events.into_iter().map(|event| generator.feed(event));
        check!(results.by_ref().take(2).all(|it| it.is_ok()));
        let_assert!(Some(Err(GeneratorError::DepthMismatch { .. })) = results.next());
        check!(results.all(|it| it.is_ok()));

        let_assert!(Phase::Failed(_) = generator.phase());
        let_assert!(Err(GeneratorError::DepthMismatch { .. }) = generator.generated_states());
    }

    #[test]
    fn events_after_completion_are_rejected() {
        let mut events = TraceBuilder::transaction(SENDER, TARGET, vec![], 100_000)
            .step(opcode::STOP)
            .finish(None);
        let step = events[2].clone();
        events.push(step);

        let_assert!(
            Err(GeneratorError::AfterCompletion) = StateGenerator::new(ctx()).run(events)
        );
    }

    #[test]
    fn faulting_step_has_no_side_effects() {
        let mut events = TraceBuilder::transaction(SENDER, TARGET, vec![], 100_000)
            .log(vec![], vec![1])
            .step(opcode::STOP)
            .finish(Some("out of gas"));
        for event in &mut events {
            if let TraceEvent::Step(step) = event {
                if step.opcode == opcode::LOG0 {
                    step.error = Some("out of gas".into());
                }
            }
        }
        let output = StateGenerator::new(ctx()).retaining(0..=5).run(events).unwrap();

        let stop = output.retained.values().last().unwrap();
        check!(stop.log_series.is_empty());
    }

    #[test]
    fn log_data_is_zero_padded() {
        check!(read_memory(&[1, 2, 3], U256::from(2), U256::from(3)) == vec![3, 0, 0]);
        check!(read_memory(&[1, 2, 3], U256::from(9), U256::from(2)) == vec![0, 0]);
        check!(read_memory(&[1, 2, 3], U256::MAX, U256::one()).is_empty());
    }
}
