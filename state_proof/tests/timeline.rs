use assert2::{check, let_assert};
use ethereum_types::{Address, H256, U256};
use state_proof::commitment::StateType;
use state_proof::opcode;
use state_proof::proof::SubProof;
use state_proof::testing::{ScriptedChain, ScriptedTx, TraceBuilder};
use state_proof::trace::CallKind;
use state_proof::{ExecutionStateIndex, ProofAssembler, ProofConfig, ProofError, TransitionKind};

const ALICE: Address = Address::repeat_byte(0xa1);
const BOB: Address = Address::repeat_byte(0xb0);
const TOKEN: Address = Address::repeat_byte(0xc0);
const VAULT: Address = Address::repeat_byte(0xc1);

fn init_logger() {
    let _ = pretty_env_logger::try_init();
}

/// Block 1 holds a plain transfer, then a call into `TOKEN` that writes a
/// slot and calls into `VAULT`, which self-destructs and then reverts.
fn chain_with_nonce(transfer_nonce: u64) -> ScriptedChain {
    let trace = TraceBuilder::transaction(ALICE, TOKEN, vec![0xca, 0x11], 1_000_000)
        .sstore(H256::repeat_byte(1), U256::from(42))
        .call(CallKind::Call, VAULT)
        .selfdestruct(ALICE)
        .exit(Some("execution reverted"))
        .step(opcode::STOP)
        .finish(None);

    let mut chain = ScriptedChain::new().deploy(TOKEN).deploy(VAULT);
    chain.push_block(vec![
        ScriptedTx::transfer(ALICE, BOB, U256::from(1_000), transfer_nonce),
        ScriptedTx::contract_call(ALICE, TOKEN, transfer_nonce + 1, trace, 48_000),
    ]);
    chain
}

fn index(chain: &ScriptedChain) -> ExecutionStateIndex {
    ExecutionStateIndex::build(chain, 1..2, U256::zero(), ProofConfig::default()).unwrap()
}

#[test]
fn transfer_then_reverted_call() {
    init_logger();
    let chain = chain_with_nonce(0);
    let index = index(&chain);

    use StateType::*;
    let types = index
        .entries()
        .iter()
        .map(|entry| entry.state_type)
        .collect::<Vec<_>>();
    // One block state, the transfer's two inter states (the second doubling
    // as the call's pre state), four opcode steps, the post state and the
    // closing block state.
    check!(types == [Block, Inter, Inter, Intra, Intra, Intra, Intra, Inter, Block]);

    let_assert!(Ok(post) = index.at(&chain, 7));
    let_assert!(Some(post) = post.as_inter());
    check!(post.tx_index == 2);
    check!(post.self_destruct_set.is_empty());
    check!(post.block_gas_used == U256::from(21_000 + 48_000));
}

#[test]
fn timeline_is_deterministic() {
    let chain = chain_with_nonce(0);
    let first = index(&chain).hashes().collect::<Vec<_>>();
    let second = index(&chain.clone()).hashes().collect::<Vec<_>>();
    check!(first == second);
    check!(first.iter().all(|hash| !hash.is_zero()));
}

#[test]
fn every_entry_can_be_rederived() {
    let chain = chain_with_nonce(0);
    let index = index(&chain);
    for step in 0..index.len() {
        let_assert!(Ok(state) = index.at(&chain, step));
        check!(Some(state.vm_hash()) == index.hash_at(step), "step {step}");
        check!(state.state_type() == index.entries()[step].state_type);
    }
}

#[test]
fn transitions_are_classified_explicitly() {
    let chain = chain_with_nonce(0);
    let index = index(&chain);

    use TransitionKind::*;
    let kinds = (0..index.num_steps())
        .map(|step| index.transition(step).unwrap().kind)
        .collect::<Vec<_>>();
    check!(
        kinds
            == [
                BlockInitiation,
                EoaTransfer,
                TransactionInitiation,
                OpcodeStep,
                OpcodeStep,
                OpcodeStep,
                TransactionFinalization,
                BlockFinalization,
            ]
    );
}

#[test]
fn every_transition_has_a_proof() {
    init_logger();
    let chain = chain_with_nonce(0);
    let index = index(&chain);
    let assembler = ProofAssembler::new(&chain, &index);

    for step in 0..index.num_steps() {
        let_assert!(Ok(proof) = assembler.generate(step), "step {step}");
        check!(!proof.encode().is_empty(), "step {step}");
    }

    let block_initiation = assembler.generate(0).unwrap();
    check!(block_initiation.proofs.len() == 1);
    let_assert!(SubProof::BlockState(_) = &block_initiation.proofs[0]);

    let transfer = assembler.generate(1).unwrap();
    check!(transfer
        .proofs
        .iter()
        .any(|proof| matches!(proof, SubProof::Transaction { index: 0, .. })));

    let sstore = assembler.generate(3).unwrap();
    check!(sstore.kind == TransitionKind::OpcodeStep);
    check!(sstore.proofs.iter().any(|proof| matches!(
        proof,
        SubProof::Storage(storage) if storage.address == TOKEN && storage.key == H256::repeat_byte(1)
    )));

    let finalization = assembler.generate(6).unwrap();
    check!(finalization
        .proofs
        .iter()
        .any(|proof| matches!(proof, SubProof::Receipt { index: 1, .. })));
}

#[test]
fn rewritten_history_is_a_fatal_divergence() {
    let original = chain_with_nonce(0);
    let index = index(&original);
    let rewritten = chain_with_nonce(7);

    // Nothing has been applied yet at the first two positions.
    check!(index.at(&rewritten, 1).is_ok());
    let_assert!(Err(error @ ProofError::Divergence { step: 2, .. }) = index.at(&rewritten, 2));
    check!(error.is_fatal());
}

#[test]
fn missing_history_is_retryable() {
    let index = index(&chain_with_nonce(0));
    let empty = ScriptedChain::new();

    let_assert!(Err(error @ ProofError::Backend { block_number: 1, .. }) = index.at(&empty, 2));
    check!(!error.is_fatal());
}

#[test]
fn out_of_range_steps_are_rejected() {
    let chain = chain_with_nonce(0);
    let index = index(&chain);
    let assembler = ProofAssembler::new(&chain, &index);

    let_assert!(Err(ProofError::StepOutOfRange { .. }) = assembler.generate(index.num_steps()));
    let_assert!(Err(ProofError::StepOutOfRange { .. }) = index.at(&chain, index.len()));
}
