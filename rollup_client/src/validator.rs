//! Re-executes assertions posted by others and disputes the ones our chain
//! disagrees with.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use ethereum_types::{Address, H256, U256};
use state_proof::backend::ExecutionBackend;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::assertion::{Timelines, ValidationError};
use crate::contracts::RollupContract;
use crate::events::{AssertionCreated, Observed, RollupEvent};
use crate::feeds::{Feed, L1Feeds};

/// How our chain judged an assertion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Valid,
    /// Our chain reaches `vm_hash` and `cumulative_gas_used` instead.
    Invalid {
        vm_hash: H256,
        cumulative_gas_used: U256,
    },
}

/// A counter-assertion we submitted and whose ID we still wait for.
#[derive(Clone, Copy, Debug)]
struct Counter {
    disputed: AssertionCreated,
    vm_hash: H256,
}

/// A challenge between a disputed assertion and our counter that has not
/// been opened yet.
#[derive(Clone, Copy, Debug)]
struct Dispute {
    disputed: AssertionCreated,
    counter: u64,
}

/// The step of staking on a validated assertion that has to land next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stake {
    Advance(u64),
    /// Staked, but the confirmation deadline is still unknown.
    Deadline(u64),
}

impl Stake {
    fn id(self) -> u64 {
        match self {
            Stake::Advance(id) | Stake::Deadline(id) => id,
        }
    }
}

pub struct AssertionValidator<R, B, F> {
    rollup: Arc<R>,
    feeds: Arc<F>,
    timelines: Timelines<B>,
    /// Active validators stake on what they validate and confirm it.
    active: bool,
    from_block: u64,
    /// Assertions the local chain has not caught up with, oldest first.
    deferred: VecDeque<AssertionCreated>,
    counters: Vec<Counter>,
    /// Challenges whose submission failed, retried on every head.
    disputes: VecDeque<Dispute>,
    /// Stake steps whose submission failed, retried on every head.
    staking: VecDeque<Stake>,
    /// Validated assertions awaiting confirmation, with their deadlines.
    unconfirmed: VecDeque<(u64, u64)>,
    last_validated: Option<u64>,
}

impl<R, B, F> AssertionValidator<R, B, F>
where
    R: RollupContract + 'static,
    B: ExecutionBackend + Send + Sync + 'static,
    F: L1Feeds + 'static,
{
    pub fn new(
        rollup: Arc<R>,
        feeds: Arc<F>,
        timelines: Timelines<B>,
        active: bool,
        from_block: u64,
    ) -> Self {
        Self {
            rollup,
            feeds,
            timelines,
            active,
            from_block,
            deferred: VecDeque::new(),
            counters: Vec::new(),
            disputes: VecDeque::new(),
            staking: VecDeque::new(),
            unconfirmed: VecDeque::new(),
            last_validated: None,
        }
    }

    /// The most recent assertion our chain agreed with.
    pub fn last_validated(&self) -> Option<u64> {
        self.last_validated
    }

    pub fn deferred(&self) -> usize {
        self.deferred.len()
    }

    /// Challenges and stake steps waiting for a resend.
    pub fn unsent(&self) -> usize {
        self.disputes.len() + self.staking.len()
    }

    /// Runs until `shutdown` fires or validation hits a fatal error.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut events = self.feeds.rollup_events(self.from_block);
        let mut heads = self.feeds.heads();
        let result = self.drive(&mut events, &mut heads, &mut shutdown).await;
        events.close();
        heads.close();
        result
    }

    async fn drive(
        &mut self,
        events: &mut Feed<Observed<RollupEvent>>,
        heads: &mut Feed<u64>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                event = events.next() => match event {
                    Some(Ok(event)) => self.on_event(event.event).await?,
                    Some(Err(error)) => warn!(%error, "rollup event feed"),
                    None => bail!("rollup event feed ended"),
                },
                head = heads.next() => match head {
                    Some(Ok(head)) => self.on_head(head).await?,
                    Some(Err(error)) => warn!(%error, "l1 head feed"),
                    None => bail!("l1 head feed ended"),
                },
            }
        }
    }

    /// Handles one rollup event. Only fatal errors are returned.
    pub async fn on_event(&mut self, event: RollupEvent) -> anyhow::Result<()> {
        match event {
            RollupEvent::AssertionCreated(created) if created.asserter == self.rollup.operator() => {
                self.on_own_assertion(created).await
            }
            RollupEvent::AssertionCreated(created) => self.check(created).await,
            RollupEvent::AssertionConfirmed(id) | RollupEvent::AssertionRejected(id) => {
                self.unconfirmed.retain(|&(pending, _)| pending != id);
                self.counters.retain(|counter| counter.disputed.id != id);
                self.disputes
                    .retain(|dispute| dispute.disputed.id != id && dispute.counter != id);
                self.staking.retain(|stake| stake.id() != id);
                self.timelines.cache().remove(id).await;
                Ok(())
            }
            RollupEvent::AssertionChallenged { assertion_id, .. } => {
                self.disputes
                    .retain(|dispute| dispute.disputed.id != assertion_id);
                Ok(())
            }
        }
    }

    /// Retries deferred assertions and failed submissions, then confirms
    /// what is past its deadline.
    pub async fn on_head(&mut self, head: u64) -> anyhow::Result<()> {
        for created in std::mem::take(&mut self.deferred) {
            self.check(created).await?;
        }
        for dispute in std::mem::take(&mut self.disputes) {
            debug!(head, disputed = dispute.disputed.id, "resending challenge");
            self.open_challenge(dispute).await;
        }

        if !self.active {
            return Ok(());
        }
        for stake in std::mem::take(&mut self.staking) {
            debug!(head, ?stake, "resending stake");
            self.stake(stake).await;
        }
        while let Some(&(id, deadline)) = self.unconfirmed.front() {
            if head <= deadline {
                break;
            }
            match self.rollup.confirm_first_unresolved_assertion().await {
                Ok(()) => {
                    info!(assertion_id = id, head, "assertion confirmed");
                    self.unconfirmed.pop_front();
                }
                Err(error) => {
                    warn!(error = format!("{error:#}"), assertion_id = id, "confirmation failed");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Validates `created`, parking it if our chain is behind and disputing
    /// it on a mismatch.
    async fn check(&mut self, created: AssertionCreated) -> anyhow::Result<()> {
        match self.validate(created.id).await {
            Ok(Verdict::Valid) => self.on_valid(created).await,
            Ok(Verdict::Invalid {
                vm_hash,
                cumulative_gas_used,
            }) => self.dispute(created, vm_hash, cumulative_gas_used).await,
            Err(error) if error.is_fatal() => Err(anyhow!(error)
                .context(format!("validating assertion {}", created.id))),
            Err(error @ ValidationError::EmptyAssertion { .. }) => {
                warn!(%error, "skipping assertion");
                Ok(())
            }
            Err(error) => {
                debug!(%error, assertion_id = created.id, "validation deferred");
                self.deferred.push_back(created);
                Ok(())
            }
        }
    }

    /// Compares assertion `id` with the state our chain reaches over the
    /// same inbox range.
    pub async fn validate(&mut self, id: u64) -> Result<Verdict, ValidationError> {
        let assertion = self.rollup.get_assertion(id).await?;
        let parent = self.rollup.get_assertion(assertion.parent).await?;
        let index = self.timelines.get(&parent, &assertion).await?;
        let last = index
            .last()
            .ok_or(ValidationError::EmptyAssertion { id })?;

        if last.vm_hash == assertion.vm_hash
            && last.cumulative_gas_used == assertion.cumulative_gas_used
        {
            return Ok(Verdict::Valid);
        }
        warn!(
            assertion_id = id,
            claimed = ?assertion.vm_hash,
            local = ?last.vm_hash,
            claimed_gas = %assertion.cumulative_gas_used,
            local_gas = %last.cumulative_gas_used,
            "assertion disagrees with the local chain"
        );
        Ok(Verdict::Invalid {
            vm_hash: last.vm_hash,
            cumulative_gas_used: last.cumulative_gas_used,
        })
    }

    async fn on_valid(&mut self, created: AssertionCreated) -> anyhow::Result<()> {
        info!(assertion_id = created.id, inbox_size = created.inbox_size, "assertion validated");
        self.last_validated = Some(created.id);
        if !self.active {
            return Ok(());
        }

        self.stake(Stake::Advance(created.id)).await;
        Ok(())
    }

    /// Runs `step` and what follows it. The step that fails is queued for
    /// the next head.
    async fn stake(&mut self, mut step: Stake) {
        loop {
            step = match step {
                Stake::Advance(id) => match self.rollup.advance_stake(id).await {
                    Ok(()) => Stake::Deadline(id),
                    Err(error) => {
                        warn!(error = format!("{error:#}"), assertion_id = id, "could not advance stake");
                        break;
                    }
                },
                Stake::Deadline(id) => match self.rollup.get_assertion(id).await {
                    Ok(assertion) => {
                        self.unconfirmed.push_back((id, assertion.deadline));
                        return;
                    }
                    Err(error) => {
                        warn!(error = format!("{error:#}"), assertion_id = id, "could not read the deadline");
                        break;
                    }
                },
            };
        }
        self.staking.push_back(step);
    }

    /// Posts our own assertion over the same inbox range. The challenge is
    /// opened once it shows up on chain.
    async fn dispute(
        &mut self,
        disputed: AssertionCreated,
        vm_hash: H256,
        cumulative_gas_used: U256,
    ) -> anyhow::Result<()> {
        info!(
            assertion_id = disputed.id,
            inbox_size = disputed.inbox_size,
            "posting a counter-assertion"
        );
        match self
            .rollup
            .create_assertion(vm_hash, disputed.inbox_size, cumulative_gas_used)
            .await
        {
            Ok(()) => self.counters.push(Counter { disputed, vm_hash }),
            Err(error) => {
                warn!(error = format!("{error:#}"), "counter-assertion failed, retrying on the next head");
                self.deferred.push_back(disputed);
            }
        }
        Ok(())
    }

    async fn on_own_assertion(&mut self, created: AssertionCreated) -> anyhow::Result<()> {
        let Some(position) = self.counters.iter().position(|counter| {
            counter.disputed.inbox_size == created.inbox_size && counter.vm_hash == created.vm_hash
        }) else {
            debug!(assertion_id = created.id, "own assertion");
            return Ok(());
        };
        let counter = self.counters.remove(position);
        self.open_challenge(Dispute {
            disputed: counter.disputed,
            counter: created.id,
        })
        .await;
        Ok(())
    }

    async fn open_challenge(&mut self, dispute: Dispute) {
        let players: [Address; 2] = [dispute.disputed.asserter, self.rollup.operator()];
        info!(
            disputed = dispute.disputed.id,
            counter = dispute.counter,
            "challenging assertion"
        );
        if let Err(error) = self
            .rollup
            .challenge_assertion(players, [dispute.disputed.id, dispute.counter])
            .await
        {
            warn!(
                error = format!("{error:#}"),
                disputed = dispute.disputed.id,
                "could not open the challenge, retrying on the next head"
            );
            self.disputes.push_back(dispute);
        }
    }
}
