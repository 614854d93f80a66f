//! Polling subscriptions to L1 heads and contract logs.

use std::marker::PhantomData;
use std::pin::Pin;
use std::time::Duration;

use alloy::primitives;
use alloy::providers::Provider;
use alloy::rpc::types::{Filter, Log};
use alloy::transports::Transport;
use alloy_compat::Compat as _;
use anyhow::{anyhow, Context as _};
use async_stream::stream;
use ethereum_types::Address;
use futures::{Stream, StreamExt as _};
use tracing::{debug, info};

use crate::events::{decode_challenge_log, decode_rollup_log, ChallengeEvent, Observed, RollupEvent};

pub type FeedStream<T> = Pin<Box<dyn Stream<Item = anyhow::Result<T>> + Send>>;

/// A subscription that must be closed explicitly once its consumer is done
/// with it.
///
/// Errors are yielded in-band and do not end the feed. A closed feed yields
/// nothing.
pub struct Feed<T> {
    name: String,
    stream: Option<FeedStream<T>>,
}

impl<T> Feed<T> {
    pub fn new(
        name: impl Into<String>,
        stream: impl Stream<Item = anyhow::Result<T>> + Send + 'static,
    ) -> Self {
        let name = name.into();
        debug!(feed = %name, "feed opened");
        Self {
            name,
            stream: Some(Box::pin(stream)),
        }
    }

    pub async fn next(&mut self) -> Option<anyhow::Result<T>> {
        match &mut self.stream {
            Some(stream) => stream.next().await,
            None => None,
        }
    }

    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!(feed = %self.name, "feed closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T> std::fmt::Debug for Feed<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feed")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Where the loops get their view of L1 from.
pub trait L1Feeds: Send + Sync {
    /// Every new L1 head number, strictly increasing.
    fn heads(&self) -> Feed<u64>;

    fn rollup_events(&self, from_block: u64) -> Feed<Observed<RollupEvent>>;

    fn challenge_events(
        &self,
        challenge: Address,
        from_block: u64,
    ) -> Feed<Observed<ChallengeEvent>>;
}

/// [`L1Feeds`] that poll an L1 node at a fixed interval.
pub struct PollingFeeds<ProviderT, TransportT> {
    provider: ProviderT,
    rollup: primitives::Address,
    interval: Duration,
    _phantom: PhantomData<TransportT>,
}

impl<ProviderT, TransportT> PollingFeeds<ProviderT, TransportT>
where
    ProviderT: Provider<TransportT> + Clone + 'static,
    TransportT: Transport + Clone,
{
    pub fn new(provider: ProviderT, rollup: primitives::Address, interval: Duration) -> Self {
        Self {
            provider,
            rollup,
            interval,
            _phantom: PhantomData,
        }
    }

    fn logs<E: Send + 'static>(
        &self,
        name: String,
        address: primitives::Address,
        from_block: u64,
        decode: fn(&Log) -> anyhow::Result<Option<Observed<E>>>,
    ) -> Feed<Observed<E>> {
        let provider = self.provider.clone();
        let interval = self.interval;
        Feed::new(
            name,
            stream! {
                let mut next = from_block;
                loop {
                    match provider.get_block_number().await {
                        Ok(head) if head >= next => {
                            let filter = Filter::new().address(address).from_block(next).to_block(head);
                            match provider.get_logs(&filter).await {
                                Ok(logs) => {
                                    for log in &logs {
                                        match decode(log) {
                                            Ok(Some(event)) => yield Ok(event),
                                            Ok(None) => {}
                                            Err(e) => yield Err(e),
                                        }
                                    }
                                    next = head + 1;
                                }
                                Err(e) => yield Err(anyhow!(e).context(format!("fetching logs {next}..={head}"))),
                            }
                        }
                        Ok(_) => {}
                        Err(e) => yield Err(anyhow!(e).context("polling l1 head")),
                    }
                    tokio::time::sleep(interval).await;
                }
            },
        )
    }
}

impl<ProviderT, TransportT> L1Feeds for PollingFeeds<ProviderT, TransportT>
where
    ProviderT: Provider<TransportT> + Clone + 'static,
    TransportT: Transport + Clone,
{
    fn heads(&self) -> Feed<u64> {
        let provider = self.provider.clone();
        let interval = self.interval;
        Feed::new(
            "l1 heads",
            stream! {
                let mut last = None;
                loop {
                    match provider.get_block_number().await.context("polling l1 head") {
                        Ok(head) if last.map_or(true, |last| head > last) => {
                            last = Some(head);
                            yield Ok(head);
                        }
                        Ok(_) => {}
                        Err(e) => yield Err(e),
                    }
                    tokio::time::sleep(interval).await;
                }
            },
        )
    }

    fn rollup_events(&self, from_block: u64) -> Feed<Observed<RollupEvent>> {
        info!(rollup = %self.rollup, from_block, "following rollup events");
        self.logs(
            format!("rollup {}", self.rollup),
            self.rollup,
            from_block,
            decode_rollup_log,
        )
    }

    fn challenge_events(
        &self,
        challenge: Address,
        from_block: u64,
    ) -> Feed<Observed<ChallengeEvent>> {
        let address: primitives::Address = challenge.compat();
        self.logs(
            format!("challenge {address}"),
            address,
            from_block,
            decode_challenge_log,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closed_feeds_yield_nothing() {
        let mut feed = Feed::new("numbers", futures::stream::iter([Ok(1u64), Ok(2)]));
        assert_eq!(feed.next().await.unwrap().unwrap(), 1);
        feed.close();
        assert!(feed.is_closed());
        assert!(feed.next().await.is_none());
        // Closing twice is harmless.
        feed.close();
    }
}
