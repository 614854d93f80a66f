//! One-step proofs for a single disputed transition of the timeline.

mod assembler;

use std::fmt;

use ethereum_types::{Bloom, H256};
use rlp::{Encodable, RlpStream};

pub use self::assembler::ProofAssembler;
use crate::backend::{AccountProof, StorageProof};
use crate::commitment::{BlockState, InterState, IntraState, Log, StateType};
use crate::error::{ProofError, ProofResult};

/// The six ways one timeline position can lead to the next.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransitionKind {
    /// `BlockState -> InterState`
    BlockInitiation,
    /// `InterState -> BlockState`
    BlockFinalization,
    /// `InterState -> IntraState`
    TransactionInitiation,
    /// `InterState -> InterState`, a transaction that runs no code.
    EoaTransfer,
    /// `IntraState -> IntraState`
    OpcodeStep,
    /// `IntraState -> InterState`
    TransactionFinalization,
}

impl TransitionKind {
    pub fn classify(from: StateType, to: StateType) -> ProofResult<Self> {
        use StateType::*;
        Ok(match (from, to) {
            (Block, Inter) => Self::BlockInitiation,
            (Inter, Block) => Self::BlockFinalization,
            (Inter, Intra) => Self::TransactionInitiation,
            (Inter, Inter) => Self::EoaTransfer,
            (Intra, Intra) => Self::OpcodeStep,
            (Intra, Inter) => Self::TransactionFinalization,
            (Block, Block) | (Block, Intra) | (Intra, Block) => {
                return Err(ProofError::InvalidTransition { from, to })
            }
        })
    }

    /// Whether proving the transition re-runs a transaction with tracing.
    pub fn needs_trace(self) -> bool {
        matches!(self, Self::OpcodeStep | Self::TransactionFinalization)
    }
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::BlockInitiation => "block initiation",
            Self::BlockFinalization => "block finalization",
            Self::TransactionInitiation => "transaction initiation",
            Self::EoaTransfer => "EOA transfer",
            Self::OpcodeStep => "opcode step",
            Self::TransactionFinalization => "transaction finalization",
        })
    }
}

/// A piece of evidence the verifier checks a transition against.
///
/// States are embedded with their full encoding, from which the verifier
/// recomputes the committed hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubProof {
    BlockState(BlockState),
    InterState(InterState),
    IntraState(Box<IntraState>),
    Transaction {
        index: u64,
        envelope: Vec<u8>,
        trie_proof: Vec<Vec<u8>>,
    },
    Receipt {
        index: u64,
        encoded: Vec<u8>,
        trie_proof: Vec<Vec<u8>>,
    },
    Receipts {
        root: H256,
        bloom: Bloom,
    },
    Account(AccountProof),
    Storage(StorageProof),
    LogData(Log),
    BlockHash {
        number: u64,
        hash: H256,
        trie_proof: Vec<Vec<u8>>,
    },
}

impl SubProof {
    fn tag(&self) -> u8 {
        match self {
            SubProof::BlockState(_) => 0,
            SubProof::InterState(_) => 1,
            SubProof::IntraState(_) => 2,
            SubProof::Transaction { .. } => 3,
            SubProof::Receipt { .. } => 4,
            SubProof::Receipts { .. } => 5,
            SubProof::Account(_) => 6,
            SubProof::Storage(_) => 7,
            SubProof::LogData(_) => 8,
            SubProof::BlockHash { .. } => 9,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        rlp::encode(self).to_vec()
    }
}

impl Encodable for SubProof {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(2);
        s.append(&self.tag());
        match self {
            SubProof::BlockState(state) => {
                s.append(state);
            }
            SubProof::InterState(state) => {
                s.append(state);
            }
            SubProof::IntraState(state) => {
                s.append(&**state);
            }
            SubProof::Transaction {
                index,
                envelope,
                trie_proof,
            } => {
                s.begin_list(3);
                s.append(index);
                s.append(envelope);
                s.append_list::<Vec<u8>, _>(trie_proof);
            }
            SubProof::Receipt {
                index,
                encoded,
                trie_proof,
            } => {
                s.begin_list(3);
                s.append(index);
                s.append(encoded);
                s.append_list::<Vec<u8>, _>(trie_proof);
            }
            SubProof::Receipts { root, bloom } => {
                s.begin_list(2);
                s.append(root);
                s.append(bloom);
            }
            SubProof::Account(proof) => {
                s.append(proof);
            }
            SubProof::Storage(proof) => {
                s.append(proof);
            }
            SubProof::LogData(log) => {
                s.append(log);
            }
            SubProof::BlockHash {
                number,
                hash,
                trie_proof,
            } => {
                s.begin_list(3);
                s.append(number);
                s.append(hash);
                s.append_list::<Vec<u8>, _>(trie_proof);
            }
        }
    }
}

/// Everything a verifier needs to adjudicate one disputed step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OneStepProof {
    pub kind: TransitionKind,
    pub proofs: Vec<SubProof>,
}

impl OneStepProof {
    pub fn is_empty(&self) -> bool {
        self.proofs.is_empty()
    }

    /// The concatenated sub-proofs. A proof without sub-proofs encodes to no
    /// bytes at all.
    pub fn encode(&self) -> Vec<u8> {
        self.proofs.iter().flat_map(SubProof::encode).collect()
    }
}

#[cfg(test)]
mod tests {
    use assert2::{check, let_assert};
    use ethereum_types::U256;

    use super::*;

    #[test]
    fn classification_is_pinned() {
        use StateType::*;
        use TransitionKind::*;

        let table = [
            (Block, Inter, Some(BlockInitiation)),
            (Inter, Block, Some(BlockFinalization)),
            (Inter, Intra, Some(TransactionInitiation)),
            (Inter, Inter, Some(EoaTransfer)),
            (Intra, Intra, Some(OpcodeStep)),
            (Intra, Inter, Some(TransactionFinalization)),
            (Block, Block, None),
            (Block, Intra, None),
            (Intra, Block, None),
        ];
        for (from, to, expected) in table {
            check!(TransitionKind::classify(from, to).ok() == expected, "{from} -> {to}");
        }
        let_assert!(
            Err(ProofError::InvalidTransition { from: Intra, to: Block }) =
                TransitionKind::classify(Intra, Block)
        );
    }

    #[test]
    fn empty_proof_encodes_to_nothing() {
        let proof = OneStepProof {
            kind: TransitionKind::BlockInitiation,
            proofs: Vec::new(),
        };
        check!(proof.is_empty());
        check!(proof.encode().is_empty());
    }

    #[test]
    fn sub_proofs_are_concatenated_in_order() {
        let state = SubProof::BlockState(BlockState {
            block_number: 1,
            state_root: H256::repeat_byte(1),
            cumulative_gas_used: U256::from(21_000),
            block_hash_root: H256::repeat_byte(2),
        });
        let receipts = SubProof::Receipts {
            root: H256::repeat_byte(3),
            bloom: Bloom::zero(),
        };
        let proof = OneStepProof {
            kind: TransitionKind::BlockFinalization,
            proofs: vec![state.clone(), receipts.clone()],
        };

        let mut expected = state.encode();
        expected.extend(receipts.encode());
        check!(proof.encode() == expected);
        check!(state.encode() != receipts.encode());
    }
}
