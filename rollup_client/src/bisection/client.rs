use std::sync::Arc;

use anyhow::{anyhow, bail, Context as _};
use ethereum_types::Address;
use state_proof::backend::ExecutionBackend;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use super::{BisectionError, ChallengeSession, Outcome, Side};
use crate::assertion::{Timelines, ValidationError};
use crate::contracts::{ChallengeContract as _, RollupContract};
use crate::events::{Observed, RollupEvent};
use crate::feeds::{Feed, L1Feeds};

type SessionResult = (u64, Result<Option<Outcome>, BisectionError>);

/// A challenge we could not open yet because the local chain is behind.
#[derive(Clone, Copy, Debug)]
struct PendingChallenge {
    assertion_id: u64,
    challenge: Address,
    block_number: u64,
}

/// A lost challenge whose assertion we still have to reject.
#[derive(Clone, Copy, Debug)]
struct Rejection {
    assertion_id: u64,
    loser: Address,
}

/// Watches the rollup for challenges naming us and plays each one in its
/// own [`ChallengeSession`].
pub struct BisectionClient<R, B, F> {
    rollup: Arc<R>,
    feeds: Arc<F>,
    timelines: Timelines<B>,
    from_block: u64,
    pending: Vec<PendingChallenge>,
    rejections: Vec<Rejection>,
}

impl<R, B, F> BisectionClient<R, B, F>
where
    R: RollupContract + 'static,
    B: ExecutionBackend + Send + Sync + 'static,
    F: L1Feeds + 'static,
{
    pub fn new(rollup: Arc<R>, feeds: Arc<F>, timelines: Timelines<B>, from_block: u64) -> Self {
        Self {
            rollup,
            feeds,
            timelines,
            from_block,
            pending: Vec::new(),
            rejections: Vec::new(),
        }
    }

    /// Runs until `shutdown` fires or a session hits a fatal error.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut events = self.feeds.rollup_events(self.from_block);
        let mut heads = self.feeds.heads();
        let mut sessions = JoinSet::new();

        let result = self
            .drive(&mut events, &mut heads, &mut sessions, &mut shutdown)
            .await;
        events.close();
        heads.close();

        if result.is_err() {
            sessions.abort_all();
        }
        // Sessions follow the same shutdown signal and close their own feeds.
        while let Some(joined) = sessions.join_next().await {
            if let Err(error) = self.finish(joined).await {
                warn!(error = format!("{error:#}"), "challenge session ended while shutting down");
            }
        }
        result
    }

    async fn drive(
        &mut self,
        events: &mut Feed<Observed<RollupEvent>>,
        heads: &mut Feed<u64>,
        sessions: &mut JoinSet<SessionResult>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                event = events.next() => match event {
                    Some(Ok(Observed {
                        event: RollupEvent::AssertionChallenged { assertion_id, challenge },
                        block_number,
                        ..
                    })) => {
                        let pending = PendingChallenge { assertion_id, challenge, block_number };
                        self.open(pending, sessions, shutdown).await?;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => warn!(%error, "rollup event feed"),
                    None => bail!("rollup event feed ended"),
                },
                head = heads.next() => match head {
                    Some(Ok(head)) => {
                        for rejection in std::mem::take(&mut self.rejections) {
                            debug!(head, loser = ?rejection.loser, "resending rejection");
                            self.reject(rejection).await;
                        }
                        for pending in std::mem::take(&mut self.pending) {
                            debug!(head, assertion_id = pending.assertion_id, "retrying challenge");
                            self.open(pending, sessions, shutdown).await?;
                        }
                    }
                    Some(Err(error)) => warn!(%error, "l1 head feed"),
                    None => bail!("l1 head feed ended"),
                },
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    self.finish(joined).await?;
                }
            }
        }
    }

    /// Starts a session for `pending` if it names us. Transient failures
    /// park it until the next head.
    async fn open(
        &mut self,
        pending: PendingChallenge,
        sessions: &mut JoinSet<SessionResult>,
        shutdown: &watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let session = match self.session(pending).await {
            Ok(Some(session)) => session,
            Ok(None) => return Ok(()),
            Err(error) if error.is_fatal() => {
                return Err(anyhow!(error).context(format!(
                    "opening the challenge of assertion {}",
                    pending.assertion_id
                )))
            }
            Err(error) => {
                warn!(%error, assertion_id = pending.assertion_id, "challenge not opened yet");
                self.pending.push(pending);
                return Ok(());
            }
        };

        let events = self
            .feeds
            .challenge_events(pending.challenge, pending.block_number);
        let heads = self.feeds.heads();
        let shutdown = shutdown.clone();
        let assertion_id = pending.assertion_id;
        sessions.spawn(async move { (assertion_id, session.run(events, heads, shutdown).await) });
        Ok(())
    }

    async fn session(
        &mut self,
        pending: PendingChallenge,
    ) -> Result<Option<ChallengeSession<R::Challenge, B>>, ValidationError> {
        let challenge = self.rollup.challenge_at(pending.challenge);
        let operator = self.rollup.operator();
        let side = if challenge.defender().await? == operator {
            Side::Defender
        } else if challenge.challenger().await? == operator {
            Side::Challenger
        } else {
            debug!(assertion_id = pending.assertion_id, "challenge does not involve us");
            return Ok(None);
        };

        let assertion = self.rollup.get_assertion(pending.assertion_id).await?;
        let parent = self.rollup.get_assertion(assertion.parent).await?;
        let index = self.timelines.get(&parent, &assertion).await?;
        info!(
            assertion_id = assertion.id,
            %side,
            blocks = ?index.blocks(),
            "joining challenge"
        );
        Ok(Some(ChallengeSession::new(
            challenge,
            self.timelines.backend().clone(),
            index,
            operator,
            side,
            assertion.id,
            assertion.vm_hash,
        )))
    }

    /// Settles a finished session. A winner rejects the loser's assertion.
    async fn finish(&mut self, joined: Result<SessionResult, JoinError>) -> anyhow::Result<()> {
        let (assertion_id, result) = joined.context("challenge session panicked")?;
        match result {
            Ok(Some(outcome)) => {
                if outcome.winner == self.rollup.operator() {
                    self.reject(Rejection {
                        assertion_id,
                        loser: outcome.loser,
                    })
                    .await;
                }
                self.timelines.cache().remove(assertion_id).await;
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(error) if error.is_fatal() => {
                error!(assertion_id, %error, "challenge session failed");
                Err(anyhow!(error).context(format!("challenge of assertion {assertion_id}")))
            }
            Err(error) => {
                warn!(assertion_id, %error, "challenge session ended early");
                Ok(())
            }
        }
    }

    async fn reject(&mut self, rejection: Rejection) {
        if let Err(error) = self
            .rollup
            .reject_first_unresolved_assertion(rejection.loser)
            .await
        {
            warn!(
                error = format!("{error:#}"),
                assertion_id = rejection.assertion_id,
                loser = ?rejection.loser,
                "could not reject the losing assertion, retrying on the next head"
            );
            self.rejections.push(rejection);
        }
    }
}
