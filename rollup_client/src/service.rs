//! Wiring the loops of a client to L1 and running them.

use std::str::FromStr as _;
use std::sync::Arc;

use alloy::network::EthereumWallet;
use alloy::providers::ProviderBuilder;
use alloy::signers::local::PrivateKeySigner;
use anyhow::{anyhow, Context as _};
use state_proof::backend::ExecutionBackend;
use state_proof::ProofConfig;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::assertion::Timelines;
use crate::bisection::BisectionClient;
use crate::config::{Config, ServiceRole};
use crate::contracts::{AlloyRollup, RollupContract};
use crate::feeds::{L1Feeds, PollingFeeds};
use crate::index_cache::IndexCache;
use crate::retry::build_http_retry_client;
use crate::validator::AssertionValidator;

/// The loops a client runs, and what they share.
pub struct Service<R, B, F> {
    rollup: Arc<R>,
    feeds: Arc<F>,
    backend: Arc<B>,
    cache: IndexCache,
    proof_config: ProofConfig,
    role: ServiceRole,
    active: bool,
    from_block: u64,
}

/// Connects to the L1 node and rollup contract named by `config`, sending
/// transactions as the configured operator.
pub fn connect<B>(
    config: &Config,
    backend: Arc<B>,
) -> anyhow::Result<Service<impl RollupContract + 'static, B, impl L1Feeds + 'static>>
where
    B: ExecutionBackend + Send + Sync + 'static,
{
    let signer = PrivateKeySigner::from_str(&config.operator_key)
        .map_err(|e| anyhow!("invalid operator key: {e}"))?;
    let operator = signer.address();
    let client = build_http_retry_client(config.l1_rpc_url.clone(), config.backoff());
    let provider = ProviderBuilder::new()
        .with_recommended_fillers()
        .wallet(EthereumWallet::from(signer))
        .on_client(client);
    info!(
        rollup = %config.rollup_address,
        %operator,
        role = ?config.role,
        "connected to l1"
    );

    let rollup = AlloyRollup::new(provider.clone(), config.rollup_address, operator);
    let feeds = PollingFeeds::new(provider, config.rollup_address, config.poll_interval());
    Ok(Service::new(Arc::new(rollup), Arc::new(feeds), backend, config))
}

impl<R, B, F> Service<R, B, F>
where
    R: RollupContract + 'static,
    B: ExecutionBackend + Send + Sync + 'static,
    F: L1Feeds + 'static,
{
    pub fn new(rollup: Arc<R>, feeds: Arc<F>, backend: Arc<B>, config: &Config) -> Self {
        Self {
            rollup,
            feeds,
            backend,
            cache: IndexCache::new(config.index_cache_size),
            proof_config: config.proof_config(),
            role: config.role,
            active: config.active,
            from_block: config.from_block,
        }
    }

    fn timelines(&self) -> Timelines<B> {
        Timelines::new(self.backend.clone(), self.cache.clone(), self.proof_config)
    }

    /// Runs every loop of the configured role, each in its own task, until
    /// `shutdown` fires.
    ///
    /// A loop that fails is logged and stops on its own. The others keep
    /// running. The returned error names the first loop that failed.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut loops = JoinSet::new();

        if self.role.validates() {
            let validator = AssertionValidator::new(
                self.rollup.clone(),
                self.feeds.clone(),
                self.timelines(),
                self.active,
                self.from_block,
            );
            let shutdown = shutdown.clone();
            loops.spawn(async move { ("validator", validator.run(shutdown).await) });
        }
        let client = BisectionClient::new(
            self.rollup.clone(),
            self.feeds.clone(),
            self.timelines(),
            self.from_block,
        );
        loops.spawn(async move { ("bisection", client.run(shutdown).await) });

        let mut failure = None;
        while let Some(joined) = loops.join_next().await {
            let (name, result) = joined.context("service loop panicked")?;
            match result {
                Ok(()) => info!(service = name, "stopped"),
                Err(error) => {
                    error!(service = name, error = format!("{error:#}"), "stopped on a fatal error");
                    failure.get_or_insert(error.context(format!("{name} loop")));
                }
            }
        }
        failure.map_or(Ok(()), Err)
    }
}
