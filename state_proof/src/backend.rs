//! The capabilities this crate needs from an EVM and its state database.
//!
//! Nothing here executes EVM code: an implementation wraps an existing node
//! and hands back receipts, trace events and inclusion proofs.

use ethereum_types::{Address, Bloom, H256, U256};
use rlp::{Encodable, RlpStream};

use crate::commitment::Log;
use crate::error::BackendError;
use crate::trace::TraceEvent;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct L2Transaction {
    pub hash: H256,
    pub from: Address,
    /// `None` for contract creation.
    pub to: Option<Address>,
    pub nonce: u64,
    pub value: U256,
    pub gas_limit: u64,
    pub input: Vec<u8>,
    /// Canonical (EIP-2718) encoding, as committed in the transaction trie.
    pub envelope: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct L2Block {
    pub number: u64,
    pub hash: H256,
    pub parent_hash: H256,
    pub timestamp: u64,
    pub gas_limit: u64,
    pub transactions: Vec<L2Transaction>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Receipt {
    pub status: bool,
    /// Gas used by the block up to and including this transaction.
    pub cumulative_gas_used: u64,
    pub gas_used: u64,
    pub logs: Vec<Log>,
}

impl Receipt {
    pub fn bloom(&self) -> Bloom {
        let mut bloom = Bloom::zero();
        for log in &self.logs {
            log.accrue_bloom(&mut bloom);
        }
        bloom
    }

    /// Consensus encoding, as committed in the receipt trie.
    pub fn encode(&self) -> Vec<u8> {
        rlp::encode(self).to_vec()
    }
}

impl Encodable for Receipt {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(4);
        s.append(&u8::from(self.status));
        s.append(&self.cumulative_gas_used);
        s.append(&self.bloom());
        s.append_list::<Log, _>(&self.logs);
    }
}

/// Merkle proof of an account in a state trie.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountProof {
    pub address: Address,
    pub nonce: u64,
    pub balance: U256,
    pub storage_root: H256,
    pub code_hash: H256,
    pub proof: Vec<Vec<u8>>,
}

/// Merkle proof of a storage slot in an account's storage trie.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageProof {
    pub address: Address,
    pub key: H256,
    pub value: U256,
    pub proof: Vec<Vec<u8>>,
}

fn append_nodes(s: &mut RlpStream, nodes: &[Vec<u8>]) {
    s.begin_list(nodes.len());
    for node in nodes {
        s.append(node);
    }
}

impl Encodable for AccountProof {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(6);
        s.append(&self.address);
        s.append(&self.nonce);
        s.append(&self.balance);
        s.append(&self.storage_root);
        s.append(&self.code_hash);
        append_nodes(s, &self.proof);
    }
}

impl Encodable for StorageProof {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(4);
        s.append(&self.address);
        s.append(&self.key);
        s.append(&self.value);
        append_nodes(s, &self.proof);
    }
}

/// A state item whose inclusion proof a one-step proof needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProofKey {
    Account(Address),
    Storage(Address, H256),
}

/// How much to observe while applying a transaction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum TraceMode {
    /// Apply only. The returned trace is empty.
    #[default]
    Off,
    /// Return the full trace event stream.
    Full,
    /// Return the full trace plus proofs of `keys` against the state in
    /// effect right before opcode `step` of the transaction.
    ProveAt { step: usize, keys: Vec<ProofKey> },
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Witness {
    pub accounts: Vec<AccountProof>,
    pub storage: Vec<StorageProof>,
}

impl Witness {
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty() && self.storage.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxExecution {
    pub receipt: Receipt,
    pub trace: Vec<TraceEvent>,
    pub witness: Witness,
}

/// A mutable, private view of the world state.
///
/// Applying transactions to a snapshot must never be observable through any
/// other snapshot, so concurrent disputes can replay independently.
pub trait StateSnapshot {
    fn state_root(&self) -> H256;

    fn code_hash(&self, address: Address) -> Result<H256, BackendError>;

    fn account_proof(&self, address: Address) -> Result<AccountProof, BackendError>;

    fn storage_proof(&self, address: Address, slot: H256) -> Result<StorageProof, BackendError>;
}

/// Deterministic re-execution of historical L2 blocks.
pub trait ExecutionBackend {
    type Snapshot: StateSnapshot;

    /// Number of the latest block the backend has applied.
    fn head(&self) -> Result<u64, BackendError>;

    fn block(&self, number: u64) -> Result<L2Block, BackendError>;

    /// Ancestor hashes visible to `BLOCKHASH` while executing block
    /// `number`.
    fn block_hashes(&self, number: u64) -> Result<Vec<(u64, H256)>, BackendError>;

    /// State after block `number`, regenerated by re-executing at most
    /// `reexec` blocks if it is no longer stored.
    fn snapshot_at(&self, number: u64, reexec: u64) -> Result<Self::Snapshot, BackendError>;

    fn apply_transaction(
        &self,
        snapshot: &mut Self::Snapshot,
        block: &L2Block,
        tx_index: usize,
        mode: TraceMode,
    ) -> Result<TxExecution, BackendError>;

    /// Post-transaction block processing (rewards, system calls). Most L2s
    /// have none.
    fn finalize_block(
        &self,
        _snapshot: &mut Self::Snapshot,
        _block: &L2Block,
    ) -> Result<(), BackendError> {
        Ok(())
    }
}
