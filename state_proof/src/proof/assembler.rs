use ethereum_types::{Address, BigEndianHash as _, Bloom, H256};
use itertools::Itertools as _;
use log::debug;

use super::{OneStepProof, SubProof, TransitionKind};
use crate::backend::{ExecutionBackend, ProofKey, Receipt, StateSnapshot};
use crate::commitment::IntraState;
use crate::error::{BackendResultExt as _, ProofError, ProofResult};
use crate::index::{check_hash, BlockReplay, DisputedTransition, ExecutionStateIndex};
use crate::opcode;
use crate::tries::{index_key, ordered_trie};

/// Builds the [`OneStepProof`] for a transition of an
/// [`ExecutionStateIndex`].
///
/// Every proof starts by re-deriving the disputed pre-state and checking it
/// against the index, so a proof is never assembled on top of a state the
/// index did not commit to.
#[derive(Debug)]
pub struct ProofAssembler<'a, B> {
    backend: &'a B,
    index: &'a ExecutionStateIndex,
}

impl<'a, B: ExecutionBackend> ProofAssembler<'a, B> {
    pub fn new(backend: &'a B, index: &'a ExecutionStateIndex) -> Self {
        Self { backend, index }
    }

    /// The proof for the transition from `step` to `step + 1`.
    pub fn generate(&self, step: usize) -> ProofResult<OneStepProof> {
        let transition = self.index.transition(step)?;
        debug!(
            "assembling {} proof for step {step} (block {}, tx {})",
            transition.kind, transition.from.block_number, transition.from.tx_index
        );
        let proofs = match transition.kind {
            TransitionKind::BlockInitiation => self.block_initiation(&transition)?,
            TransitionKind::BlockFinalization => self.block_finalization(&transition)?,
            TransitionKind::TransactionInitiation | TransitionKind::EoaTransfer => {
                self.transaction_initiation(&transition)?
            }
            TransitionKind::OpcodeStep | TransitionKind::TransactionFinalization => {
                self.execution_step(&transition)?
            }
        };
        Ok(OneStepProof {
            kind: transition.kind,
            proofs,
        })
    }

    fn block_initiation(&self, t: &DisputedTransition) -> ProofResult<Vec<SubProof>> {
        let state = self
            .index
            .at(self.backend, t.step)?
            .into_block()
            .map_err(|other| ProofError::InvalidTransition {
                from: other.state_type(),
                to: t.to.state_type,
            })?;
        Ok(vec![SubProof::BlockState(state)])
    }

    fn block_finalization(&self, t: &DisputedTransition) -> ProofResult<Vec<SubProof>> {
        let number = t.from.block_number;
        let mut replay = self.replay_to(t)?;
        if !replay.is_complete() {
            return Err(bad_start_state(t, &replay));
        }

        let pre = replay.inter_state()?;
        check_hash(t.step, t.from.vm_hash, pre.hash())?;
        let bloom = replay.receipts().iter().fold(Bloom::zero(), |mut bloom, receipt| {
            bloom.accrue_bloom(&receipt.bloom());
            bloom
        });
        let receipts = SubProof::Receipts {
            root: pre.receipt_root,
            bloom,
        };

        let hash = replay.block().hash;
        let trie_proof = replay.hashes().advance(hash)?.proof(number)?;
        let closing = replay.finalize()?;
        check_hash(t.step + 1, t.to.vm_hash, closing.hash())?;

        Ok(vec![
            SubProof::InterState(pre),
            receipts,
            SubProof::BlockHash {
                number,
                hash,
                trie_proof,
            },
        ])
    }

    fn transaction_initiation(&self, t: &DisputedTransition) -> ProofResult<Vec<SubProof>> {
        let number = t.from.block_number;
        let index = t.from.tx_index;
        let mut replay = self.replay_to(t)?;
        let tx = match replay.block().transactions.get(index as usize) {
            Some(tx) => tx.clone(),
            None => return Err(bad_start_state(t, &replay)),
        };

        let pre = replay.inter_state()?;
        check_hash(t.step, t.from.vm_hash, pre.hash())?;
        let trie_proof = ordered_trie(replay.block().transactions.iter().map(|tx| &tx.envelope))?
            .proof(&index_key(index))?;

        let mut proofs = vec![
            SubProof::InterState(pre),
            SubProof::Transaction {
                index,
                envelope: tx.envelope.clone(),
                trie_proof,
            },
        ];
        for address in std::iter::once(tx.from).chain(tx.to) {
            let proof = replay
                .snapshot()
                .account_proof(address)
                .at(number, Some(index), Some(t.step))?;
            proofs.push(SubProof::Account(proof));
        }

        if t.kind == TransitionKind::EoaTransfer {
            replay.replay_next(None, None)?;
            check_hash(t.step + 1, t.to.vm_hash, replay.inter_state()?.hash())?;
        }
        Ok(proofs)
    }

    fn execution_step(&self, t: &DisputedTransition) -> ProofResult<Vec<SubProof>> {
        let number = t.from.block_number;
        let index = t.from.tx_index;
        let tx_step = t.from.step.ok_or(ProofError::MissingStep { step: t.step })?;

        let mut replay = self.replay_to(t)?;
        if replay.is_complete() {
            return Err(bad_start_state(t, &replay));
        }
        let mut replayed = replay.replay_next(Some(tx_step..=tx_step + 1), None)?;
        let from = replayed
            .retained
            .remove(&tx_step)
            .ok_or(ProofError::MissingStep { step: t.step })?;
        check_hash(t.step, t.from.vm_hash, from.hash())?;

        let mut proofs = vec![SubProof::IntraState(Box::new(from.clone()))];
        if t.kind == TransitionKind::TransactionFinalization {
            let post = replay.inter_state()?;
            check_hash(t.step + 1, t.to.vm_hash, post.hash())?;
            let trie_proof = ordered_trie(replay.receipts().iter().map(Receipt::encode))?
                .proof(&index_key(index))?;
            proofs.push(SubProof::Receipt {
                index,
                encoded: replayed.execution.receipt.encode(),
                trie_proof,
            });
            proofs.push(SubProof::InterState(post));
            return Ok(proofs);
        }

        let to = replayed
            .retained
            .remove(&(tx_step + 1))
            .ok_or(ProofError::MissingStep { step: t.step + 1 })?;
        check_hash(t.step + 1, t.to.vm_hash, to.hash())?;

        let keys = proof_keys(&from);
        if !keys.is_empty() {
            // The first replay has moved past the transaction; witnesses come
            // from a fresh one stopped right before the disputed opcode.
            let mut prover = self.index.replay_block(self.backend, number)?;
            prover.skip_to(index)?;
            let witness = prover
                .replay_next(None, Some((tx_step, keys)))?
                .execution
                .witness;
            proofs.extend(witness.accounts.into_iter().map(SubProof::Account));
            proofs.extend(witness.storage.into_iter().map(SubProof::Storage));
        }

        if opcode::log_topics(from.opcode).is_some() && to.log_series.len() > from.log_series.len()
        {
            if let Some(log) = to.log_series.logs().pop() {
                proofs.push(SubProof::LogData(log));
            }
        }

        if from.opcode == opcode::BLOCKHASH {
            let requested = from
                .stack_back(0)
                .filter(|word| word.bits() <= 64)
                .map(|word| word.low_u64());
            if let Some((number, hash)) =
                requested.and_then(|n| replay.hashes().get(n).map(|hash| (n, hash)))
            {
                proofs.push(SubProof::BlockHash {
                    number,
                    hash,
                    trie_proof: replay.hashes().proof(number)?,
                });
            }
        }
        Ok(proofs)
    }

    /// A replay of the transition's block with the transactions before the
    /// disputed one applied.
    fn replay_to(&self, t: &DisputedTransition) -> ProofResult<BlockReplay<'a, B>> {
        let mut replay = self.index.replay_block(self.backend, t.from.block_number)?;
        if t.from.tx_index as usize > replay.block().transactions.len() {
            return Err(bad_start_state(t, &replay));
        }
        replay.skip_to(t.from.tx_index)?;
        Ok(replay)
    }
}

fn bad_start_state<B: ExecutionBackend>(
    t: &DisputedTransition,
    replay: &BlockReplay<'_, B>,
) -> ProofError {
    ProofError::BadStartState {
        step: t.step,
        block_number: t.from.block_number,
        tx_index: t.from.tx_index,
        tx_count: replay.block().transactions.len(),
    }
}

/// Accounts and slots the opcode about to execute reads from the state.
fn proof_keys(state: &IntraState) -> Vec<ProofKey> {
    let op = state.opcode;
    let mut keys = Vec::new();
    if let Some(word) = opcode::accessed_address_operand(op).and_then(|n| state.stack_back(n)) {
        keys.push(ProofKey::Account(Address::from(H256::from_uint(&word))));
        if matches!(op, opcode::CALL | opcode::CALLCODE | opcode::SELFDESTRUCT) {
            // Value moves out of the executing account.
            keys.push(ProofKey::Account(state.contract));
        }
    }
    if let Some(word) = opcode::accessed_slot_operand(op).and_then(|n| state.stack_back(n)) {
        keys.push(ProofKey::Account(state.contract));
        keys.push(ProofKey::Storage(state.contract, H256::from_uint(&word)));
    }
    keys.into_iter().sorted().dedup().collect()
}

#[cfg(test)]
mod tests {
    use ethereum_types::{BigEndianHash as _, U256};

    use super::*;
    use crate::commitment::{AccessList, CallFlag, LogSeries, SelfDestructSet};

    fn state(op: u8, stack: Vec<U256>) -> IntraState {
        IntraState {
            block_number: 1,
            tx_index: 0,
            depth: 1,
            call_flag: CallFlag::Call,
            pc: 0,
            opcode: op,
            gas_left: 100,
            cost: 3,
            contract: Address::repeat_byte(0xc0),
            caller: Address::repeat_byte(0x5e),
            value: U256::zero(),
            code_hash: H256::zero(),
            out_offset: U256::zero(),
            out_size: U256::zero(),
            stack,
            memory: Vec::new(),
            input_data: Vec::new(),
            return_data: Vec::new(),
            committed_state_root: H256::zero(),
            state_root: H256::zero(),
            block_hash_root: H256::zero(),
            self_destruct_set: SelfDestructSet::new(),
            log_series: LogSeries::new(),
            access_list: AccessList::new(),
            last_depth_hash: H256::zero(),
        }
    }

    #[test]
    fn storage_opcodes_prove_the_slot_and_its_account() {
        let slot = H256::repeat_byte(7);
        let keys = proof_keys(&state(opcode::SLOAD, vec![slot.into_uint()]));
        assert_eq!(
            keys,
            vec![
                ProofKey::Account(Address::repeat_byte(0xc0)),
                ProofKey::Storage(Address::repeat_byte(0xc0), slot),
            ]
        );
    }

    #[test]
    fn value_calls_prove_both_ends() {
        let callee = Address::repeat_byte(0xee);
        let word = H256::from(callee).into_uint();
        // gas, to, value, ... with `to` one below the top.
        let stack = vec![U256::zero(), U256::zero(), U256::zero(), word, U256::from(5000)];
        let keys = proof_keys(&state(opcode::CALL, stack.clone()));
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&ProofKey::Account(callee)));

        let keys = proof_keys(&state(opcode::STATICCALL, stack));
        assert_eq!(keys, vec![ProofKey::Account(callee)]);
    }

    #[test]
    fn pure_opcodes_need_no_witness() {
        assert!(proof_keys(&state(opcode::ADD, vec![U256::one(), U256::one()])).is_empty());
    }
}
