//! Contract events the client reacts to.

use alloy::rpc::types::Log;
use alloy::sol_types::SolEventInterface as _;
use alloy_compat::Compat as _;
use anyhow::Context as _;
use ethereum_types::{Address, H256};

use crate::bindings::{IChallenge, IRollup};
use crate::bisection::{Outcome, Segment};
use crate::contracts::to_u64;

/// An event with the L1 position that emitted it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Observed<E> {
    pub event: E,
    pub block_number: u64,
    pub tx_hash: H256,
}

impl<E> Observed<E> {
    pub fn new(event: E, block_number: u64, tx_hash: H256) -> Self {
        Self {
            event,
            block_number,
            tx_hash,
        }
    }

    fn from_log(event: E, log: &Log) -> anyhow::Result<Self> {
        let block_number = log.block_number.context("log is missing its block number")?;
        let tx_hash = log
            .transaction_hash
            .context("log is missing its transaction hash")?;
        Ok(Self::new(event, block_number, tx_hash.compat()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AssertionCreated {
    pub id: u64,
    pub asserter: Address,
    pub vm_hash: H256,
    pub inbox_size: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RollupEvent {
    AssertionCreated(AssertionCreated),
    AssertionChallenged { assertion_id: u64, challenge: Address },
    AssertionConfirmed(u64),
    AssertionRejected(u64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChallengeEvent {
    Bisected {
        challenge_state: H256,
        segment: Segment,
    },
    Completed(Outcome),
}

impl TryFrom<IRollup::IRollupEvents> for RollupEvent {
    type Error = anyhow::Error;

    fn try_from(event: IRollup::IRollupEvents) -> Result<Self, Self::Error> {
        use IRollup::IRollupEvents;

        Ok(match event {
            IRollupEvents::AssertionCreated(created) => RollupEvent::AssertionCreated(AssertionCreated {
                id: to_u64(created.assertionID, "assertion id")?,
                asserter: created.asserterAddr.compat(),
                vm_hash: created.vmHash.compat(),
                inbox_size: to_u64(created.inboxSize, "inbox size")?,
            }),
            IRollupEvents::AssertionChallenged(challenged) => RollupEvent::AssertionChallenged {
                assertion_id: to_u64(challenged.assertionID, "assertion id")?,
                challenge: challenged.challengeAddr.compat(),
            },
            IRollupEvents::AssertionConfirmed(confirmed) => {
                RollupEvent::AssertionConfirmed(to_u64(confirmed.assertionID, "assertion id")?)
            }
            IRollupEvents::AssertionRejected(rejected) => {
                RollupEvent::AssertionRejected(to_u64(rejected.assertionID, "assertion id")?)
            }
        })
    }
}

impl TryFrom<IChallenge::IChallengeEvents> for ChallengeEvent {
    type Error = anyhow::Error;

    fn try_from(event: IChallenge::IChallengeEvents) -> Result<Self, Self::Error> {
        use IChallenge::IChallengeEvents;

        Ok(match event {
            IChallengeEvents::Bisected(bisected) => ChallengeEvent::Bisected {
                challenge_state: bisected.challengeState.compat(),
                segment: Segment::new(
                    to_u64(bisected.challengedSegmentStart, "segment start")?,
                    to_u64(bisected.challengedSegmentLength, "segment length")?,
                ),
            },
            IChallengeEvents::Completed(completed) => ChallengeEvent::Completed(Outcome {
                winner: completed.winner.compat(),
                loser: completed.loser.compat(),
                reason: completed.reason,
            }),
        })
    }
}

/// Decodes a rollup log. Logs of events the client does not know are
/// skipped.
pub fn decode_rollup_log(log: &Log) -> anyhow::Result<Option<Observed<RollupEvent>>> {
    let Ok(event) = IRollup::IRollupEvents::decode_raw_log(log.topics(), &log.data().data, true)
    else {
        return Ok(None);
    };
    Observed::from_log(event.try_into()?, log).map(Some)
}

pub fn decode_challenge_log(log: &Log) -> anyhow::Result<Option<Observed<ChallengeEvent>>> {
    let Ok(event) =
        IChallenge::IChallengeEvents::decode_raw_log(log.topics(), &log.data().data, true)
    else {
        return Ok(None);
    };
    Observed::from_log(event.try_into()?, log).map(Some)
}
