//! In-memory stand-ins for the rollup contracts and L1 feeds.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_stream::stream;
use ethereum_types::{Address, H256, U256};
use rollup_client::contracts::{Assertion, ChallengeContract, PrevBisection, RollupContract};
use rollup_client::events::{ChallengeEvent, Observed, RollupEvent};
use rollup_client::feeds::{Feed, L1Feeds};
use state_proof::opcode;
use state_proof::testing::{ScriptedChain, ScriptedTx, TraceBuilder};
use state_proof::trace::CallKind;
use state_proof::{ExecutionStateIndex, ProofConfig};
use tokio::sync::broadcast;

pub const OPERATOR: Address = Address::repeat_byte(0x0e);
pub const OPPONENT: Address = Address::repeat_byte(0x0f);
pub const CHALLENGE: Address = Address::repeat_byte(0xcc);

/// Installs the client's subscriber. Only the first call in a test binary
/// takes effect.
pub fn init_tracing() {
    let _ = rollup_client::tracing::init();
}

const ALICE: Address = Address::repeat_byte(0xa1);
const BOB: Address = Address::repeat_byte(0xb0);
const TOKEN: Address = Address::repeat_byte(0xc0);
const VAULT: Address = Address::repeat_byte(0xc1);

/// Block 1 holds a transfer and a traced call into `TOKEN`: eight steps
/// between nine states.
pub fn chain() -> ScriptedChain {
    let trace = TraceBuilder::transaction(ALICE, TOKEN, vec![0xca, 0x11], 1_000_000)
        .sstore(H256::repeat_byte(1), U256::from(42))
        .call(CallKind::Call, VAULT)
        .selfdestruct(ALICE)
        .exit(Some("execution reverted"))
        .step(opcode::STOP)
        .finish(None);

    let mut chain = ScriptedChain::new().deploy(TOKEN).deploy(VAULT);
    chain.push_block(vec![
        ScriptedTx::transfer(ALICE, BOB, U256::from(1_000), 0),
        ScriptedTx::contract_call(ALICE, TOKEN, 1, trace, 48_000),
    ]);
    chain
}

/// The timeline of block 1 of [`chain`].
pub fn index(chain: &ScriptedChain) -> ExecutionStateIndex {
    ExecutionStateIndex::build(chain, 1..2, U256::zero(), ProofConfig::default()).unwrap()
}

pub fn assertion(id: u64, parent: u64, inbox_size: u64, vm_hash: H256, gas: U256) -> Assertion {
    Assertion {
        id,
        vm_hash,
        inbox_size,
        parent,
        deadline: 50,
        prev_cumulative_gas_used: U256::zero(),
        cumulative_gas_used: gas,
    }
}

/// A contract call as a fake saw it. Failed attempts are recorded too.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    CreateAssertion {
        vm_hash: H256,
        inbox_size: u64,
        cumulative_gas_used: U256,
    },
    ChallengeAssertion {
        players: [Address; 2],
        assertion_ids: [u64; 2],
    },
    AdvanceStake(u64),
    ConfirmFirstUnresolvedAssertion,
    RejectFirstUnresolvedAssertion(Address),
    InitializeChallengeLength(u64),
    BisectExecution {
        bisection: Vec<H256>,
        challenged_segment_index: u64,
        prev: PrevBisection,
    },
    VerifyOneStepProof {
        proof: Vec<u8>,
        challenged_step_index: u64,
        prev: PrevBisection,
    },
    Timeout,
}

#[derive(Debug, Default)]
struct Ledger {
    calls: Vec<Call>,
    /// Number of upcoming submissions that revert.
    failures: usize,
}

#[derive(Clone, Debug, Default)]
pub struct Calls(Arc<Mutex<Ledger>>);

impl Calls {
    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.0.lock().unwrap()
    }

    fn submit(&self, call: Call) -> anyhow::Result<()> {
        let mut ledger = self.ledger();
        ledger.calls.push(call);
        if ledger.failures > 0 {
            ledger.failures -= 1;
            anyhow::bail!("transaction reverted");
        }
        Ok(())
    }

    pub fn fail_next(&self, count: usize) {
        self.ledger().failures = count;
    }

    /// Every call so far, clearing the record.
    pub fn take(&self) -> Vec<Call> {
        std::mem::take(&mut self.ledger().calls)
    }

    pub fn snapshot(&self) -> Vec<Call> {
        self.ledger().calls.clone()
    }
}

#[derive(Debug)]
struct ChallengeView {
    defender: Address,
    challenger: Address,
    responder: Address,
    time_left: u64,
    posted: HashMap<H256, Vec<H256>>,
}

#[derive(Clone, Debug)]
pub struct FakeChallenge {
    address: Address,
    view: Arc<Mutex<ChallengeView>>,
    calls: Calls,
}

impl FakeChallenge {
    pub fn new(defender: Address, challenger: Address, calls: Calls) -> Self {
        Self {
            address: CHALLENGE,
            view: Arc::new(Mutex::new(ChallengeView {
                defender,
                challenger,
                responder: defender,
                time_left: 100,
                posted: HashMap::new(),
            })),
            calls,
        }
    }

    pub fn set_responder(&self, responder: Address, time_left: u64) {
        let mut view = self.view.lock().unwrap();
        view.responder = responder;
        view.time_left = time_left;
    }

    /// Makes `tx_hash` a `bisectExecution` transaction posting `bisection`.
    pub fn post(&self, tx_hash: H256, bisection: Vec<H256>) {
        self.view.lock().unwrap().posted.insert(tx_hash, bisection);
    }
}

impl ChallengeContract for FakeChallenge {
    fn address(&self) -> Address {
        self.address
    }

    async fn defender(&self) -> anyhow::Result<Address> {
        Ok(self.view.lock().unwrap().defender)
    }

    async fn challenger(&self) -> anyhow::Result<Address> {
        Ok(self.view.lock().unwrap().challenger)
    }

    async fn current_responder(&self) -> anyhow::Result<Address> {
        Ok(self.view.lock().unwrap().responder)
    }

    async fn current_responder_time_left(&self) -> anyhow::Result<u64> {
        Ok(self.view.lock().unwrap().time_left)
    }

    async fn initialize_challenge_length(&self, num_steps: u64) -> anyhow::Result<()> {
        self.calls.submit(Call::InitializeChallengeLength(num_steps))
    }

    async fn bisect_execution(
        &self,
        bisection: Vec<H256>,
        challenged_segment_index: u64,
        prev: PrevBisection,
    ) -> anyhow::Result<()> {
        self.calls.submit(Call::BisectExecution {
            bisection,
            challenged_segment_index,
            prev,
        })
    }

    async fn verify_one_step_proof(
        &self,
        proof: Vec<u8>,
        challenged_step_index: u64,
        prev: PrevBisection,
    ) -> anyhow::Result<()> {
        self.calls.submit(Call::VerifyOneStepProof {
            proof,
            challenged_step_index,
            prev,
        })
    }

    async fn timeout(&self) -> anyhow::Result<()> {
        self.calls.submit(Call::Timeout)
    }

    async fn posted_bisection(&self, tx_hash: H256) -> anyhow::Result<Option<Vec<H256>>> {
        Ok(self.view.lock().unwrap().posted.get(&tx_hash).cloned())
    }
}

pub struct FakeRollup {
    pub calls: Calls,
    pub challenge: FakeChallenge,
    assertions: Mutex<HashMap<u64, Assertion>>,
}

impl FakeRollup {
    pub fn new(challenge: FakeChallenge) -> Self {
        Self {
            calls: challenge.calls.clone(),
            challenge,
            assertions: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_assertions(self, assertions: impl IntoIterator<Item = Assertion>) -> Self {
        self.assertions
            .lock()
            .unwrap()
            .extend(assertions.into_iter().map(|assertion| (assertion.id, assertion)));
        self
    }
}

impl RollupContract for FakeRollup {
    type Challenge = FakeChallenge;

    fn operator(&self) -> Address {
        OPERATOR
    }

    fn challenge_at(&self, _address: Address) -> FakeChallenge {
        self.challenge.clone()
    }

    async fn get_assertion(&self, id: u64) -> anyhow::Result<Assertion> {
        self.assertions
            .lock()
            .unwrap()
            .get(&id)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("no assertion {id}"))
    }

    async fn create_assertion(
        &self,
        vm_hash: H256,
        inbox_size: u64,
        cumulative_gas_used: U256,
    ) -> anyhow::Result<()> {
        self.calls.submit(Call::CreateAssertion {
            vm_hash,
            inbox_size,
            cumulative_gas_used,
        })
    }

    async fn challenge_assertion(
        &self,
        players: [Address; 2],
        assertion_ids: [u64; 2],
    ) -> anyhow::Result<()> {
        self.calls.submit(Call::ChallengeAssertion {
            players,
            assertion_ids,
        })
    }

    async fn advance_stake(&self, id: u64) -> anyhow::Result<()> {
        self.calls.submit(Call::AdvanceStake(id))
    }

    async fn confirm_first_unresolved_assertion(&self) -> anyhow::Result<()> {
        self.calls.submit(Call::ConfirmFirstUnresolvedAssertion)
    }

    async fn reject_first_unresolved_assertion(&self, staker: Address) -> anyhow::Result<()> {
        self.calls.submit(Call::RejectFirstUnresolvedAssertion(staker))
    }
}

/// A channel with its history. New subscribers see everything sent so far.
struct Replay<T> {
    sent: Mutex<Vec<T>>,
    live: broadcast::Sender<T>,
}

impl<T: Clone + Send + 'static> Replay<T> {
    fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            live: broadcast::channel(64).0,
        }
    }

    fn send(&self, item: T) {
        let mut sent = self.sent.lock().unwrap();
        sent.push(item.clone());
        let _ = self.live.send(item);
    }

    fn feed(&self, name: &str) -> Feed<T> {
        let (history, mut live) = {
            let sent = self.sent.lock().unwrap();
            (sent.clone(), self.live.subscribe())
        };
        Feed::new(
            name,
            stream! {
                for item in history {
                    yield Ok(item);
                }
                while let Ok(item) = live.recv().await {
                    yield Ok(item);
                }
            },
        )
    }
}

/// [`L1Feeds`] pushed by the test.
pub struct ChannelFeeds {
    heads: broadcast::Sender<u64>,
    rollup: Replay<Observed<RollupEvent>>,
    challenge: Replay<Observed<ChallengeEvent>>,
}

impl Default for ChannelFeeds {
    fn default() -> Self {
        Self {
            heads: broadcast::channel(64).0,
            rollup: Replay::new(),
            challenge: Replay::new(),
        }
    }
}

impl ChannelFeeds {
    pub fn head(&self, number: u64) {
        let _ = self.heads.send(number);
    }

    pub fn rollup_event(&self, event: RollupEvent, block_number: u64) {
        self.rollup.send(Observed::new(event, block_number, H256::zero()));
    }

    pub fn challenge_event(&self, event: ChallengeEvent, block_number: u64, tx_hash: H256) {
        self.challenge.send(Observed::new(event, block_number, tx_hash));
    }
}

impl L1Feeds for ChannelFeeds {
    fn heads(&self) -> Feed<u64> {
        let mut heads = self.heads.subscribe();
        Feed::new(
            "heads",
            stream! {
                while let Ok(head) = heads.recv().await {
                    yield Ok(head);
                }
            },
        )
    }

    fn rollup_events(&self, _from_block: u64) -> Feed<Observed<RollupEvent>> {
        self.rollup.feed("rollup")
    }

    fn challenge_events(
        &self,
        _challenge: Address,
        _from_block: u64,
    ) -> Feed<Observed<ChallengeEvent>> {
        self.challenge.feed("challenge")
    }
}

/// Polls `calls` until `done` holds, failing the test after five seconds.
pub async fn wait_for(calls: &Calls, done: impl Fn(&[Call]) -> bool) -> Vec<Call> {
    let polled = async {
        loop {
            let seen = calls.snapshot();
            if done(&seen) {
                return seen;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), polled)
        .await
        .expect("expected calls were never made")
}
