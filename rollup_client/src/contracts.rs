//! The slice of the rollup and challenge contracts the client drives.
//!
//! Loops are written against [`RollupContract`] and [`ChallengeContract`],
//! which speak `ethereum-types`. [`AlloyRollup`] and [`AlloyChallenge`]
//! implement them over an alloy provider.

use std::future::Future;
use std::marker::PhantomData;

use alloy::network::ReceiptResponse as _;
use alloy::primitives::{self, Bytes};
use alloy::providers::Provider;
use alloy::sol_types::SolCall as _;
use alloy::transports::Transport;
use alloy_compat::Compat as _;
use anyhow::{anyhow, Context as _};
use ethereum_types::{Address, H256, U256};
use tracing::debug;

use crate::bindings::{IChallenge, IRollup};
use crate::bisection::Segment;

/// A staked claim about the L2 state reached after an inbox prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Assertion {
    pub id: u64,
    pub vm_hash: H256,
    pub inbox_size: u64,
    pub parent: u64,
    /// L1 block after which the assertion can be confirmed.
    pub deadline: u64,
    pub prev_cumulative_gas_used: U256,
    pub cumulative_gas_used: U256,
}

/// The bisection a move responds to, as the challenge contract identifies
/// it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrevBisection {
    pub segment: Segment,
    pub bisection: Vec<H256>,
}

pub trait RollupContract: Send + Sync {
    type Challenge: ChallengeContract + 'static;

    /// The account our transactions are sent from.
    fn operator(&self) -> Address;

    fn challenge_at(&self, address: Address) -> Self::Challenge;

    fn get_assertion(&self, id: u64) -> impl Future<Output = anyhow::Result<Assertion>> + Send;

    fn create_assertion(
        &self,
        vm_hash: H256,
        inbox_size: u64,
        cumulative_gas_used: U256,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Opens a challenge of `defender`'s assertion by `challenger`'s
    /// conflicting sibling.
    fn challenge_assertion(
        &self,
        players: [Address; 2],
        assertion_ids: [u64; 2],
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn advance_stake(&self, id: u64) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn confirm_first_unresolved_assertion(
        &self,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn reject_first_unresolved_assertion(
        &self,
        staker: Address,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}

pub trait ChallengeContract: Send + Sync {
    fn address(&self) -> Address;

    fn defender(&self) -> impl Future<Output = anyhow::Result<Address>> + Send;

    fn challenger(&self) -> impl Future<Output = anyhow::Result<Address>> + Send;

    fn current_responder(&self) -> impl Future<Output = anyhow::Result<Address>> + Send;

    /// L1 blocks the current responder has left to act.
    fn current_responder_time_left(&self) -> impl Future<Output = anyhow::Result<u64>> + Send;

    fn initialize_challenge_length(
        &self,
        num_steps: u64,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn bisect_execution(
        &self,
        bisection: Vec<H256>,
        challenged_segment_index: u64,
        prev: PrevBisection,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn verify_one_step_proof(
        &self,
        proof: Vec<u8>,
        challenged_step_index: u64,
        prev: PrevBisection,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn timeout(&self) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// The bisection posted by transaction `tx_hash`, or `None` if it was not
    /// a `bisectExecution` call.
    fn posted_bisection(
        &self,
        tx_hash: H256,
    ) -> impl Future<Output = anyhow::Result<Option<Vec<H256>>>> + Send;
}

/// Sends a contract call and waits for a successful receipt.
macro_rules! submit {
    ($call:literal, $builder:expr) => {{
        let receipt = $builder
            .send()
            .await
            .context(concat!($call, " (send)"))?
            .get_receipt()
            .await
            .context(concat!($call, " (get_receipt)"))?;
        anyhow::ensure!(
            receipt.status(),
            "{} reverted in transaction {}",
            $call,
            receipt.transaction_hash
        );
        debug!(call = $call, tx = %receipt.transaction_hash, "transaction included");
        Ok(())
    }};
}

pub(crate) fn to_u64(value: primitives::U256, what: &str) -> anyhow::Result<u64> {
    u64::try_from(value).map_err(|_| anyhow!("{what} {value} does not fit in 64 bits"))
}

fn hashes(hashes: Vec<H256>) -> Vec<primitives::B256> {
    hashes.into_iter().map(|hash| hash.compat()).collect()
}

pub struct AlloyRollup<ProviderT, TransportT> {
    provider: ProviderT,
    address: primitives::Address,
    operator: Address,
    _phantom: PhantomData<TransportT>,
}

impl<ProviderT, TransportT> AlloyRollup<ProviderT, TransportT>
where
    ProviderT: Provider<TransportT> + Clone,
    TransportT: Transport + Clone,
{
    pub fn new(provider: ProviderT, address: primitives::Address, operator: primitives::Address) -> Self {
        Self {
            provider,
            address,
            operator: operator.compat(),
            _phantom: PhantomData,
        }
    }

    pub fn address(&self) -> primitives::Address {
        self.address
    }

    pub fn provider(&self) -> &ProviderT {
        &self.provider
    }

    fn contract(&self) -> IRollup::IRollupInstance<TransportT, &ProviderT> {
        IRollup::new(self.address, &self.provider)
    }
}

impl<ProviderT, TransportT> RollupContract for AlloyRollup<ProviderT, TransportT>
where
    ProviderT: Provider<TransportT> + Clone + 'static,
    TransportT: Transport + Clone,
{
    type Challenge = AlloyChallenge<ProviderT, TransportT>;

    fn operator(&self) -> Address {
        self.operator
    }

    fn challenge_at(&self, address: Address) -> Self::Challenge {
        AlloyChallenge {
            provider: self.provider.clone(),
            address: address.compat(),
            _phantom: PhantomData,
        }
    }

    async fn get_assertion(&self, id: u64) -> anyhow::Result<Assertion> {
        let assertion = self
            .contract()
            .getAssertion(primitives::U256::from(id))
            .call()
            .await
            .with_context(|| format!("getAssertion({id})"))?
            ._0;
        Ok(Assertion {
            id,
            vm_hash: assertion.stateHash.compat(),
            inbox_size: to_u64(assertion.inboxSize, "inbox size")?,
            parent: to_u64(assertion.parent, "parent assertion")?,
            deadline: to_u64(assertion.deadline, "deadline")?,
            prev_cumulative_gas_used: assertion.prevCumulativeGasUsed.compat(),
            cumulative_gas_used: assertion.cumulativeGasUsed.compat(),
        })
    }

    async fn create_assertion(
        &self,
        vm_hash: H256,
        inbox_size: u64,
        cumulative_gas_used: U256,
    ) -> anyhow::Result<()> {
        submit!(
            "createAssertion",
            self.contract().createAssertion(
                vm_hash.compat(),
                primitives::U256::from(inbox_size),
                cumulative_gas_used.compat(),
            )
        )
    }

    async fn challenge_assertion(
        &self,
        players: [Address; 2],
        assertion_ids: [u64; 2],
    ) -> anyhow::Result<()> {
        submit!(
            "challengeAssertion",
            self.contract().challengeAssertion(
                players.map(|player| player.compat()),
                assertion_ids.map(primitives::U256::from),
            )
        )
    }

    async fn advance_stake(&self, id: u64) -> anyhow::Result<()> {
        submit!(
            "advanceStake",
            self.contract().advanceStake(primitives::U256::from(id))
        )
    }

    async fn confirm_first_unresolved_assertion(&self) -> anyhow::Result<()> {
        submit!(
            "confirmFirstUnresolvedAssertion",
            self.contract().confirmFirstUnresolvedAssertion()
        )
    }

    async fn reject_first_unresolved_assertion(&self, staker: Address) -> anyhow::Result<()> {
        submit!(
            "rejectFirstUnresolvedAssertion",
            self.contract().rejectFirstUnresolvedAssertion(staker.compat())
        )
    }
}

pub struct AlloyChallenge<ProviderT, TransportT> {
    provider: ProviderT,
    address: primitives::Address,
    _phantom: PhantomData<TransportT>,
}

impl<ProviderT, TransportT> AlloyChallenge<ProviderT, TransportT>
where
    ProviderT: Provider<TransportT>,
    TransportT: Transport + Clone,
{
    fn contract(&self) -> IChallenge::IChallengeInstance<TransportT, &ProviderT> {
        IChallenge::new(self.address, &self.provider)
    }
}

impl<ProviderT, TransportT> ChallengeContract for AlloyChallenge<ProviderT, TransportT>
where
    ProviderT: Provider<TransportT>,
    TransportT: Transport + Clone,
{
    fn address(&self) -> Address {
        self.address.compat()
    }

    async fn defender(&self) -> anyhow::Result<Address> {
        let defender = self.contract().defender().call().await.context("defender")?._0;
        Ok(defender.compat())
    }

    async fn challenger(&self) -> anyhow::Result<Address> {
        let challenger = self
            .contract()
            .challenger()
            .call()
            .await
            .context("challenger")?
            ._0;
        Ok(challenger.compat())
    }

    async fn current_responder(&self) -> anyhow::Result<Address> {
        let responder = self
            .contract()
            .currentResponder()
            .call()
            .await
            .context("currentResponder")?
            ._0;
        Ok(responder.compat())
    }

    async fn current_responder_time_left(&self) -> anyhow::Result<u64> {
        let time_left = self
            .contract()
            .currentResponderTimeLeft()
            .call()
            .await
            .context("currentResponderTimeLeft")?
            ._0;
        // A responder with more blocks than fit in a u64 never times out.
        Ok(u64::try_from(time_left).unwrap_or(u64::MAX))
    }

    async fn initialize_challenge_length(&self, num_steps: u64) -> anyhow::Result<()> {
        submit!(
            "initializeChallengeLength",
            self.contract()
                .initializeChallengeLength(primitives::U256::from(num_steps))
        )
    }

    async fn bisect_execution(
        &self,
        bisection: Vec<H256>,
        challenged_segment_index: u64,
        prev: PrevBisection,
    ) -> anyhow::Result<()> {
        submit!(
            "bisectExecution",
            self.contract().bisectExecution(
                hashes(bisection),
                primitives::U256::from(challenged_segment_index),
                hashes(prev.bisection),
                primitives::U256::from(prev.segment.start),
                primitives::U256::from(prev.segment.length),
            )
        )
    }

    async fn verify_one_step_proof(
        &self,
        proof: Vec<u8>,
        challenged_step_index: u64,
        prev: PrevBisection,
    ) -> anyhow::Result<()> {
        submit!(
            "verifyOneStepProof",
            self.contract().verifyOneStepProof(
                Bytes::from(proof),
                primitives::U256::from(challenged_step_index),
                hashes(prev.bisection),
                primitives::U256::from(prev.segment.start),
                primitives::U256::from(prev.segment.length),
            )
        )
    }

    async fn timeout(&self) -> anyhow::Result<()> {
        submit!("timeout", self.contract().timeout())
    }

    async fn posted_bisection(&self, tx_hash: H256) -> anyhow::Result<Option<Vec<H256>>> {
        let tx = self
            .provider
            .get_transaction_by_hash(tx_hash.compat())
            .await
            .with_context(|| format!("fetching transaction {tx_hash:?}"))?
            .ok_or_else(|| anyhow!("transaction {tx_hash:?} not found"))?;
        Ok(decode_bisection(&tx.input))
    }
}

/// The `bisection` argument of `bisectExecution` calldata.
fn decode_bisection(input: &[u8]) -> Option<Vec<H256>> {
    IChallenge::bisectExecutionCall::abi_decode(input, true)
        .ok()
        .map(|call| call.bisection.into_iter().map(|hash| hash.compat()).collect())
}

#[cfg(test)]
mod tests {
    use alloy::sol_types::SolCall;

    use super::*;

    #[test]
    fn bisection_is_recovered_from_calldata() {
        let bisection = vec![H256::repeat_byte(1), H256::repeat_byte(2), H256::repeat_byte(3)];
        let call = IChallenge::bisectExecutionCall {
            bisection: hashes(bisection.clone()),
            challengedSegmentIndex: primitives::U256::from(2),
            prevBisection: hashes(vec![H256::repeat_byte(1), H256::repeat_byte(9)]),
            prevChallengedSegmentStart: primitives::U256::ZERO,
            prevChallengedSegmentLength: primitives::U256::from(8),
        };
        assert_eq!(decode_bisection(&call.abi_encode()), Some(bisection));

        let timeout = IChallenge::timeoutCall {}.abi_encode();
        assert_eq!(decode_bisection(&timeout), None);
    }

    #[test]
    fn oversized_words_are_rejected() {
        assert_eq!(to_u64(primitives::U256::from(7), "x").unwrap(), 7);
        assert!(to_u64(primitives::U256::MAX, "inbox size").is_err());
    }
}
