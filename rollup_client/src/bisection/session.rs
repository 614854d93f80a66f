use std::sync::Arc;

use anyhow::{anyhow, Context as _};
use ethereum_types::{Address, H256};
use state_proof::backend::ExecutionBackend;
use state_proof::{ExecutionStateIndex, ProofAssembler};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use super::machine::{Action, Input};
use super::segment::{self, challenge_state, Move};
use super::{BisectionError, BisectionState, Outcome, Segment, Side};
use crate::contracts::{ChallengeContract, PrevBisection};
use crate::events::{ChallengeEvent, Observed};
use crate::feeds::Feed;

/// One challenge, played from our local timeline of the disputed assertion.
pub struct ChallengeSession<C, B> {
    contract: C,
    backend: Arc<B>,
    index: Arc<ExecutionStateIndex>,
    operator: Address,
    side: Side,
    assertion_id: u64,
    /// The defender's claimed end state, the last hash of the initial
    /// bisection.
    claimed_end: H256,
    state: BisectionState,
    /// An event whose handling failed on a transient error, retried on the
    /// next head.
    deferred: Option<Observed<ChallengeEvent>>,
}

impl<C, B> ChallengeSession<C, B>
where
    C: ChallengeContract,
    B: ExecutionBackend + Send + Sync + 'static,
{
    pub fn new(
        contract: C,
        backend: Arc<B>,
        index: Arc<ExecutionStateIndex>,
        operator: Address,
        side: Side,
        assertion_id: u64,
        claimed_end: H256,
    ) -> Self {
        Self {
            contract,
            backend,
            index,
            operator,
            side,
            assertion_id,
            claimed_end,
            state: BisectionState::Idle,
            deferred: None,
        }
    }

    pub fn state(&self) -> &BisectionState {
        &self.state
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Plays the challenge until it resolves or `shutdown` fires. Both feeds
    /// are closed on return.
    ///
    /// On shutdown nothing more is submitted. The chain keeps whatever state
    /// the challenge had reached.
    pub async fn run(
        mut self,
        mut events: Feed<Observed<ChallengeEvent>>,
        mut heads: Feed<u64>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<Option<Outcome>, BisectionError> {
        let result = self.drive(&mut events, &mut heads, &mut shutdown).await;
        events.close();
        heads.close();
        result
    }

    async fn drive(
        &mut self,
        events: &mut Feed<Observed<ChallengeEvent>>,
        heads: &mut Feed<u64>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<Outcome>, BisectionError> {
        self.start().await?;
        loop {
            if let BisectionState::Resolved(outcome) = self.state {
                return Ok(Some(outcome));
            }
            if *shutdown.borrow() {
                info!(assertion_id = self.assertion_id, "leaving challenge on shutdown");
                return Ok(None);
            }

            tokio::select! {
                _ = shutdown.changed() => {
                    info!(assertion_id = self.assertion_id, "leaving challenge on shutdown");
                    return Ok(None);
                }
                event = events.next() => match event {
                    Some(Ok(event)) => self.on_event(event).await?,
                    Some(Err(error)) => warn!(%error, "challenge event feed"),
                    None => return Err(anyhow!("challenge event feed ended").into()),
                },
                head = heads.next() => match head {
                    Some(Ok(head)) => self.on_head(head).await?,
                    Some(Err(error)) => warn!(%error, "l1 head feed"),
                    None => return Err(anyhow!("l1 head feed ended").into()),
                },
            }
        }
    }

    /// Enters the challenge. The defender sets its length.
    pub async fn start(&mut self) -> Result<(), BisectionError> {
        info!(
            assertion_id = self.assertion_id,
            challenge = ?self.contract.address(),
            side = %self.side,
            steps = self.index.num_steps(),
            "challenge opened"
        );
        self.apply(Input::Opened {
            side: self.side,
            num_steps: self.index.num_steps() as u64,
        })
        .await
    }

    /// Handles one challenge event. Only fatal errors are returned.
    pub async fn on_event(&mut self, event: Observed<ChallengeEvent>) -> Result<(), BisectionError> {
        match self.handle_event(&event).await {
            Ok(()) => Ok(()),
            Err(error) if error.is_fatal() => Err(error),
            Err(error) => {
                warn!(%error, ?event, "challenge event deferred to the next head");
                self.deferred = Some(event);
                Ok(())
            }
        }
    }

    pub async fn on_head(&mut self, head: u64) -> Result<(), BisectionError> {
        if let Some(event) = self.deferred.take() {
            self.on_event(event).await?;
        }
        self.apply(Input::NewHead(head)).await
    }

    async fn handle_event(&mut self, event: &Observed<ChallengeEvent>) -> Result<(), BisectionError> {
        match event.event {
            ChallengeEvent::Bisected {
                challenge_state,
                segment,
            } => {
                let posted = self
                    .recover_bisection(challenge_state, segment, event.tx_hash)
                    .await?;
                let responder = self.contract.current_responder().await?;
                let time_left = self.contract.current_responder_time_left().await?;
                debug!(
                    ?segment,
                    ?responder,
                    time_left,
                    block = event.block_number,
                    "bisected"
                );
                self.apply(Input::Bisected {
                    segment,
                    posted,
                    block_number: event.block_number,
                    our_turn: responder == self.operator,
                    time_left,
                })
                .await
            }
            ChallengeEvent::Completed(outcome) => {
                info!(
                    assertion_id = self.assertion_id,
                    winner = ?outcome.winner,
                    loser = ?outcome.loser,
                    reason = outcome.reason,
                    won = outcome.winner == self.operator,
                    "challenge completed"
                );
                self.apply(Input::Completed(outcome)).await
            }
        }
    }

    /// The bisection whose digest the contract emitted: either the initial
    /// two-point claim or the one posted by the event's transaction.
    async fn recover_bisection(
        &self,
        expected: H256,
        segment: Segment,
        tx_hash: H256,
    ) -> Result<Vec<H256>, BisectionError> {
        let initial = vec![self.hash_at(segment.start)?, self.claimed_end];
        if challenge_state(segment, &initial) == expected {
            return Ok(initial);
        }
        match self.contract.posted_bisection(tx_hash).await? {
            Some(posted) if challenge_state(segment, &posted) == expected => Ok(posted),
            _ => Err(BisectionError::UnknownBisection { segment, expected }),
        }
    }

    async fn apply(&mut self, input: Input) -> Result<(), BisectionError> {
        let mut next = Some(input);
        while let Some(input) = next.take() {
            let from = self.state.name();
            let (state, action) = std::mem::take(&mut self.state).on(input);
            self.state = state;
            if from != self.state.name() {
                debug!(from, to = self.state.name(), "challenge state changed");
            }

            let Some(action) = action else { continue };
            match self.perform(action).await {
                Ok(()) => {}
                Err(error) if error.is_fatal() => return Err(error),
                Err(error @ BisectionError::NoDisagreement { .. }) => {
                    warn!(%error, "nothing to dispute, leaving the move to the clock");
                }
                Err(error) => {
                    warn!(%error, "challenge move failed, retrying on the next head");
                    next = Some(Input::SubmissionFailed);
                }
            }
        }
        Ok(())
    }

    async fn perform(&self, action: Action) -> Result<(), BisectionError> {
        match action {
            Action::InitializeChallengeLength(num_steps) => self
                .contract
                .initialize_challenge_length(num_steps)
                .await
                .map_err(|source| BisectionError::Submission {
                    call: "initializeChallengeLength",
                    source,
                }),
            Action::Respond { segment, posted } => self.respond(segment, posted).await,
            Action::Timeout => {
                info!(assertion_id = self.assertion_id, "opponent ran out of time");
                self.contract
                    .timeout()
                    .await
                    .map_err(|source| BisectionError::Submission {
                        call: "timeout",
                        source,
                    })
            }
        }
    }

    async fn respond(&self, segment: Segment, posted: Vec<H256>) -> Result<(), BisectionError> {
        let index = &self.index;
        let next = segment::respond(segment, &posted, |step| {
            usize::try_from(step).ok().and_then(|step| index.hash_at(step))
        })?;
        let prev = PrevBisection {
            segment,
            bisection: posted,
        };

        match next {
            Move::Bisect {
                bisection,
                challenged_segment_index,
                segment: disputed,
            } => {
                info!(?disputed, challenged_segment_index, "bisecting");
                self.contract
                    .bisect_execution(bisection, challenged_segment_index, prev)
                    .await
                    .map_err(|source| BisectionError::Submission {
                        call: "bisectExecution",
                        source,
                    })
            }
            Move::OneStepProof {
                step,
                challenged_step_index,
            } => {
                let proof = self.prove(step).await?;
                info!(step, bytes = proof.len(), "submitting one-step proof");
                self.contract
                    .verify_one_step_proof(proof, challenged_step_index, prev)
                    .await
                    .map_err(|source| BisectionError::Submission {
                        call: "verifyOneStepProof",
                        source,
                    })
            }
        }
    }

    /// Assembles the proof for `step` on a blocking thread.
    async fn prove(&self, step: u64) -> Result<Vec<u8>, BisectionError> {
        let step = usize::try_from(step).map_err(|_| BisectionError::OutsideTimeline { step })?;
        let backend = self.backend.clone();
        let index = self.index.clone();
        let proof = tokio::task::spawn_blocking(move || {
            ProofAssembler::new(backend.as_ref(), index.as_ref()).generate(step)
        })
        .await
        .context("proof assembly did not complete")??;
        let encoded = proof.encode();
        debug!(step, kind = %proof.kind, "one-step proof assembled");
        trace!(step, proof = %hex::encode(&encoded), "one-step proof");
        Ok(encoded)
    }

    fn hash_at(&self, step: u64) -> Result<H256, BisectionError> {
        usize::try_from(step)
            .ok()
            .and_then(|step| self.index.hash_at(step))
            .ok_or(BisectionError::OutsideTimeline { step })
    }
}
