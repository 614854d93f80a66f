//! An in-memory, scripted [`ExecutionBackend`] and helpers for writing trace
//! event scripts.
//!
//! Nothing is executed: every transaction carries the trace and gas usage it
//! will report, and state roots evolve by hashing in transaction hashes. That
//! is enough to exercise timelines and proofs deterministically.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use ethereum_types::{Address, BigEndianHash as _, H256, U256};
use keccak_hash::keccak;
use rlp::RlpStream;
use rollup_common::{BLOCK_HASH_WINDOW, EMPTY_CODE_HASH, EMPTY_TRIE_HASH};

use crate::backend::{
    AccountProof, ExecutionBackend, L2Block, L2Transaction, ProofKey, Receipt, StateSnapshot,
    StorageProof, TraceMode, TxExecution, Witness,
};
use crate::commitment::Log;
use crate::error::BackendError;
use crate::opcode;
use crate::trace::{CallKind, Contract, ScopeContext, StepTrace, TraceEvent};

const STEP_COST: u64 = 3;
const CALL_COST: u64 = 700;

#[derive(Clone, Debug)]
struct BuilderFrame {
    contract: Contract,
    pc: u64,
}

/// Builds the trace event stream of one transaction, frame by frame.
#[derive(Clone, Debug)]
pub struct TraceBuilder {
    events: Vec<TraceEvent>,
    frames: Vec<BuilderFrame>,
    gas: u64,
    state_root: H256,
}

impl TraceBuilder {
    /// Starts a transaction calling `to`.
    pub fn transaction(from: Address, to: Address, input: Vec<u8>, gas: u64) -> Self {
        Self {
            events: vec![
                TraceEvent::TxStart { gas_limit: gas },
                TraceEvent::CallStart {
                    from,
                    to,
                    create: false,
                    input: input.clone(),
                    gas,
                    value: U256::zero(),
                },
            ],
            frames: vec![BuilderFrame {
                contract: Contract {
                    address: to,
                    caller: from,
                    value: U256::zero(),
                    code_hash: keccak(to),
                    input,
                },
                pc: 0,
            }],
            gas,
            state_root: H256::zero(),
        }
    }

    /// Live state root reported by subsequent steps.
    pub fn with_state_root(mut self, root: H256) -> Self {
        self.state_root = root;
        self
    }

    pub fn step(self, op: u8) -> Self {
        self.emit(op, Vec::new(), Vec::new(), STEP_COST)
    }

    pub fn step_with_stack(self, op: u8, stack: Vec<U256>) -> Self {
        self.emit(op, stack, Vec::new(), STEP_COST)
    }

    pub fn sstore(self, slot: H256, value: U256) -> Self {
        self.emit(
            opcode::SSTORE,
            vec![value, slot.into_uint()],
            Vec::new(),
            STEP_COST,
        )
    }

    pub fn sload(self, slot: H256) -> Self {
        self.emit(opcode::SLOAD, vec![slot.into_uint()], Vec::new(), STEP_COST)
    }

    pub fn balance(self, address: Address) -> Self {
        self.emit(opcode::BALANCE, vec![word(address)], Vec::new(), STEP_COST)
    }

    pub fn blockhash(self, number: u64) -> Self {
        self.emit(opcode::BLOCKHASH, vec![U256::from(number)], Vec::new(), STEP_COST)
    }

    /// `LOGn` of `data`, which is placed at memory offset zero.
    pub fn log(self, topics: Vec<H256>, data: Vec<u8>) -> Self {
        let mut stack = topics
            .iter()
            .rev()
            .map(|topic| topic.into_uint())
            .collect::<Vec<_>>();
        stack.push(U256::from(data.len()));
        stack.push(U256::zero());
        let op = opcode::LOG0 + topics.len() as u8;
        self.emit(op, stack, data, STEP_COST)
    }

    pub fn call(self, kind: CallKind, to: Address) -> Self {
        self.call_with_output(kind, to, 0, 0)
    }

    /// A call opcode followed by entry into the callee's frame.
    pub fn call_with_output(
        self,
        kind: CallKind,
        to: Address,
        out_offset: u64,
        out_size: u64,
    ) -> Self {
        let (op, top_first) = match kind {
            CallKind::Call | CallKind::CallCode => (
                if kind == CallKind::Call {
                    opcode::CALL
                } else {
                    opcode::CALLCODE
                },
                vec![
                    U256::from(50_000),
                    word(to),
                    U256::zero(),
                    U256::zero(),
                    U256::zero(),
                    U256::from(out_offset),
                    U256::from(out_size),
                ],
            ),
            CallKind::DelegateCall | CallKind::StaticCall => (
                if kind == CallKind::DelegateCall {
                    opcode::DELEGATECALL
                } else {
                    opcode::STATICCALL
                },
                vec![
                    U256::from(50_000),
                    word(to),
                    U256::zero(),
                    U256::zero(),
                    U256::from(out_offset),
                    U256::from(out_size),
                ],
            ),
            CallKind::Create | CallKind::Create2 => (
                if kind == CallKind::Create {
                    opcode::CREATE
                } else {
                    opcode::CREATE2
                },
                vec![U256::zero(), U256::zero(), U256::zero()],
            ),
            CallKind::SelfDestruct => return self.selfdestruct(to),
        };
        let stack = top_first.into_iter().rev().collect();
        let mut this = self.emit(op, stack, Vec::new(), CALL_COST);

        let parent = this.current().clone();
        let (address, caller) = match kind {
            CallKind::DelegateCall => (parent.address, parent.caller),
            CallKind::CallCode => (parent.address, parent.address),
            _ => (to, parent.address),
        };
        this.events.push(TraceEvent::CallEnter {
            kind,
            from: parent.address,
            to,
            input: Vec::new(),
            gas: this.gas,
            value: U256::zero(),
        });
        this.frames.push(BuilderFrame {
            contract: Contract {
                address,
                caller,
                value: U256::zero(),
                code_hash: keccak(to),
                input: Vec::new(),
            },
            pc: 0,
        });
        this
    }

    /// `SELFDESTRUCT`, reported through the call hooks without a frame.
    pub fn selfdestruct(self, beneficiary: Address) -> Self {
        let mut this = self.emit(
            opcode::SELFDESTRUCT,
            vec![word(beneficiary)],
            Vec::new(),
            STEP_COST,
        );
        let from = this.current().address;
        this.events.push(TraceEvent::CallEnter {
            kind: CallKind::SelfDestruct,
            from,
            to: beneficiary,
            input: Vec::new(),
            gas: 0,
            value: U256::zero(),
        });
        this.events.push(TraceEvent::CallExit {
            output: Vec::new(),
            gas_used: 0,
            error: None,
        });
        this
    }

    /// Leaves the innermost nested frame, reverting it when `error` is set.
    pub fn exit(mut self, error: Option<&str>) -> Self {
        self.events.push(TraceEvent::CallExit {
            output: Vec::new(),
            gas_used: 0,
            error: error.map(String::from),
        });
        self.frames.pop();
        self
    }

    pub fn finish(mut self, error: Option<&str>) -> Vec<TraceEvent> {
        self.events.push(TraceEvent::CallEnd {
            output: Vec::new(),
            gas_used: 0,
            elapsed: Duration::ZERO,
            error: error.map(String::from),
        });
        self.events.push(TraceEvent::TxEnd { rest_gas: self.gas });
        self.events
    }

    fn current(&self) -> &Contract {
        &self.frames[self.frames.len() - 1].contract
    }

    fn emit(mut self, op: u8, stack: Vec<U256>, memory: Vec<u8>, cost: u64) -> Self {
        let depth = self.frames.len() as u64;
        let frame = self
            .frames
            .last_mut()
            .expect("trace builder has no open frame");
        let pc = frame.pc;
        frame.pc += 1;
        self.events.push(TraceEvent::Step(Box::new(StepTrace {
            pc,
            opcode: op,
            gas: self.gas,
            cost,
            scope: ScopeContext {
                stack,
                memory,
                contract: frame.contract.clone(),
            },
            return_data: Vec::new(),
            depth,
            state_root: self.state_root,
            error: None,
        })));
        self.gas = self.gas.saturating_sub(cost);
        self
    }
}

fn word(address: Address) -> U256 {
    H256::from(address).into_uint()
}

/// A transaction together with what the scripted backend reports for it.
#[derive(Clone, Debug)]
pub struct ScriptedTx {
    pub tx: L2Transaction,
    pub trace: Vec<TraceEvent>,
    pub gas_used: u64,
    pub logs: Vec<Log>,
    pub status: bool,
}

impl ScriptedTx {
    /// A value transfer between externally owned accounts.
    pub fn transfer(from: Address, to: Address, value: U256, nonce: u64) -> Self {
        Self {
            tx: transaction(from, Some(to), nonce, value, Vec::new()),
            trace: Vec::new(),
            gas_used: 21_000,
            logs: Vec::new(),
            status: true,
        }
    }

    pub fn contract_call(
        from: Address,
        to: Address,
        nonce: u64,
        trace: Vec<TraceEvent>,
        gas_used: u64,
    ) -> Self {
        Self {
            tx: transaction(from, Some(to), nonce, U256::zero(), vec![0xca, 0x11]),
            trace,
            gas_used,
            logs: Vec::new(),
            status: true,
        }
    }

    pub fn with_logs(mut self, logs: Vec<Log>) -> Self {
        self.logs = logs;
        self
    }

    pub fn reverted(mut self) -> Self {
        self.status = false;
        self
    }
}

fn transaction(
    from: Address,
    to: Option<Address>,
    nonce: u64,
    value: U256,
    input: Vec<u8>,
) -> L2Transaction {
    let gas_limit = 1_000_000;
    let mut s = RlpStream::new_list(6);
    s.append(&nonce);
    s.append(&gas_limit);
    match &to {
        Some(to) => s.append(to),
        None => s.append_empty_data(),
    };
    s.append(&value);
    s.append(&input);
    s.append(&from);
    let envelope = s.out().to_vec();
    L2Transaction {
        hash: keccak(&envelope),
        from,
        to,
        nonce,
        value,
        gas_limit,
        input,
        envelope,
    }
}

/// Deterministic chain whose transactions replay from scripts.
#[derive(Clone, Debug)]
pub struct ScriptedChain {
    genesis_root: H256,
    blocks: Vec<L2Block>,
    scripts: HashMap<H256, ScriptedTx>,
    code: Arc<BTreeMap<Address, H256>>,
}

impl Default for ScriptedChain {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedChain {
    pub fn new() -> Self {
        let genesis = L2Block {
            number: 0,
            hash: keccak(b"genesis"),
            parent_hash: H256::zero(),
            timestamp: 0,
            gas_limit: 30_000_000,
            transactions: Vec::new(),
        };
        Self {
            genesis_root: keccak(b"genesis state"),
            blocks: vec![genesis],
            scripts: HashMap::new(),
            code: Arc::default(),
        }
    }

    /// Gives `address` code, so transactions to it are traced.
    pub fn deploy(mut self, address: Address) -> Self {
        Arc::make_mut(&mut self.code).insert(address, keccak(address));
        self
    }

    /// Appends a block and returns its number.
    pub fn push_block(&mut self, txs: Vec<ScriptedTx>) -> u64 {
        let parent = &self.blocks[self.blocks.len() - 1];
        let number = parent.number + 1;
        let parent_hash = parent.hash;

        let mut header = RlpStream::new_list(3);
        header.append(&number);
        header.append(&parent_hash);
        header.append_list::<H256, _>(&txs.iter().map(|it| it.tx.hash).collect::<Vec<_>>());

        self.blocks.push(L2Block {
            number,
            hash: keccak(header.out()),
            parent_hash,
            timestamp: number * 2,
            gas_limit: 30_000_000,
            transactions: txs.iter().map(|it| it.tx.clone()).collect(),
        });
        for script in txs {
            self.scripts.insert(script.tx.hash, script);
        }
        number
    }

    fn script(&self, hash: &H256) -> Result<&ScriptedTx, BackendError> {
        self.scripts
            .get(hash)
            .ok_or_else(|| BackendError::Other(anyhow!("no script for transaction {hash:?}")))
    }
}

fn next_root(root: H256, tx_hash: H256) -> H256 {
    let mut preimage = root.as_bytes().to_vec();
    preimage.extend_from_slice(tx_hash.as_bytes());
    keccak(preimage)
}

#[derive(Clone, Debug)]
pub struct ScriptedSnapshot {
    root: H256,
    code: Arc<BTreeMap<Address, H256>>,
}

impl StateSnapshot for ScriptedSnapshot {
    fn state_root(&self) -> H256 {
        self.root
    }

    fn code_hash(&self, address: Address) -> Result<H256, BackendError> {
        Ok(self.code.get(&address).copied().unwrap_or(EMPTY_CODE_HASH))
    }

    fn account_proof(&self, address: Address) -> Result<AccountProof, BackendError> {
        Ok(AccountProof {
            address,
            nonce: 0,
            balance: U256::zero(),
            storage_root: EMPTY_TRIE_HASH,
            code_hash: self.code_hash(address)?,
            proof: vec![self.root.as_bytes().to_vec(), address.as_bytes().to_vec()],
        })
    }

    fn storage_proof(&self, address: Address, slot: H256) -> Result<StorageProof, BackendError> {
        Ok(StorageProof {
            address,
            key: slot,
            value: U256::zero(),
            proof: vec![self.root.as_bytes().to_vec(), slot.as_bytes().to_vec()],
        })
    }
}

impl ExecutionBackend for ScriptedChain {
    type Snapshot = ScriptedSnapshot;

    fn head(&self) -> Result<u64, BackendError> {
        Ok(self.blocks.len() as u64 - 1)
    }

    fn block(&self, number: u64) -> Result<L2Block, BackendError> {
        self.blocks
            .get(number as usize)
            .cloned()
            .ok_or(BackendError::MissingBlock(number))
    }

    fn block_hashes(&self, number: u64) -> Result<Vec<(u64, H256)>, BackendError> {
        (number.saturating_sub(BLOCK_HASH_WINDOW)..number)
            .map(|n| self.block(n).map(|block| (n, block.hash)))
            .collect()
    }

    fn snapshot_at(&self, number: u64, _reexec: u64) -> Result<ScriptedSnapshot, BackendError> {
        let blocks = self
            .blocks
            .get(1..=number as usize)
            .ok_or(BackendError::MissingState(number))?;
        let root = blocks
            .iter()
            .flat_map(|block| &block.transactions)
            .fold(self.genesis_root, |root, tx| next_root(root, tx.hash));
        Ok(ScriptedSnapshot {
            root,
            code: self.code.clone(),
        })
    }

    fn apply_transaction(
        &self,
        snapshot: &mut ScriptedSnapshot,
        block: &L2Block,
        tx_index: usize,
        mode: TraceMode,
    ) -> Result<TxExecution, BackendError> {
        let tx = block
            .transactions
            .get(tx_index)
            .ok_or(BackendError::MissingTransaction {
                block_number: block.number,
                tx_index,
            })?;
        let script = self.script(&tx.hash)?;

        let mut cumulative_gas_used = 0;
        for earlier in &block.transactions[..=tx_index] {
            cumulative_gas_used += self.script(&earlier.hash)?.gas_used;
        }

        let mut witness = Witness::default();
        if let TraceMode::ProveAt { keys, .. } = &mode {
            for key in keys {
                match *key {
                    ProofKey::Account(address) => {
                        witness.accounts.push(snapshot.account_proof(address)?)
                    }
                    ProofKey::Storage(address, slot) => {
                        witness.storage.push(snapshot.storage_proof(address, slot)?)
                    }
                }
            }
        }

        snapshot.root = next_root(snapshot.root, tx.hash);
        Ok(TxExecution {
            receipt: Receipt {
                status: script.status,
                cumulative_gas_used,
                gas_used: script.gas_used,
                logs: if script.status {
                    script.logs.clone()
                } else {
                    Vec::new()
                },
            },
            trace: match mode {
                TraceMode::Off => Vec::new(),
                TraceMode::Full | TraceMode::ProveAt { .. } => script.trace.clone(),
            },
            witness,
        })
    }
}
