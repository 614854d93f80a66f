use std::num::NonZeroUsize;
use std::sync::Arc;

use anyhow::Context as _;
use lru::LruCache;
use state_proof::{ExecutionStateIndex, ProofResult};
use tokio::sync::Mutex;
use tracing::debug;

/// Timelines of recently validated or disputed assertions, keyed by
/// assertion ID.
///
/// Building a timeline replays every block of an assertion, so the validator
/// leaves what it built here for a challenge that may follow.
#[derive(Clone, Debug)]
pub struct IndexCache {
    indexes: Arc<Mutex<LruCache<u64, Arc<ExecutionStateIndex>>>>,
}

impl IndexCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            indexes: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }

    pub async fn get(&self, assertion_id: u64) -> Option<Arc<ExecutionStateIndex>> {
        self.indexes.lock().await.get(&assertion_id).cloned()
    }

    pub async fn insert(&self, assertion_id: u64, index: Arc<ExecutionStateIndex>) {
        self.indexes.lock().await.put(assertion_id, index);
    }

    /// Drops a timeline once nothing can dispute it any more.
    pub async fn remove(&self, assertion_id: u64) -> Option<Arc<ExecutionStateIndex>> {
        self.indexes.lock().await.pop(&assertion_id)
    }

    /// The cached timeline, or one built by `build` on a blocking thread.
    /// A [`ProofError`](state_proof::ProofError) from `build` is returned
    /// as the error's source.
    ///
    /// Concurrent misses for the same assertion may build twice. The lock is
    /// not held while building.
    pub async fn get_or_build<F>(
        &self,
        assertion_id: u64,
        build: F,
    ) -> anyhow::Result<Arc<ExecutionStateIndex>>
    where
        F: FnOnce() -> ProofResult<ExecutionStateIndex> + Send + 'static,
    {
        if let Some(index) = self.get(assertion_id).await {
            debug!(assertion_id, "timeline cache hit");
            return Ok(index);
        }

        let index = tokio::task::spawn_blocking(build)
            .await
            .context("timeline builder did not complete")??;
        let index = Arc::new(index);
        self.insert(assertion_id, index.clone()).await;
        debug!(assertion_id, steps = index.num_steps(), "timeline built");
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use ethereum_types::{Address, U256};
    use state_proof::testing::{ScriptedChain, ScriptedTx};
    use state_proof::ProofConfig;

    use super::*;

    fn chain() -> Arc<ScriptedChain> {
        let mut chain = ScriptedChain::new();
        chain.push_block(vec![ScriptedTx::transfer(
            Address::repeat_byte(1),
            Address::repeat_byte(2),
            U256::from(5),
            0,
        )]);
        Arc::new(chain)
    }

    #[tokio::test]
    async fn builds_once_and_evicts_least_recent() {
        let cache = IndexCache::new(NonZeroUsize::new(1).unwrap());
        let chain = chain();

        let build = |chain: Arc<ScriptedChain>| {
            move || ExecutionStateIndex::build(chain.as_ref(), 1..2, U256::zero(), ProofConfig::default())
        };
        let first = cache.get_or_build(1, build(chain.clone())).await.unwrap();
        let again = cache
            .get_or_build(1, || panic!("cached timelines are not rebuilt"))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        cache.get_or_build(2, build(chain)).await.unwrap();
        assert!(cache.get(1).await.is_none());
        assert!(cache.remove(2).await.is_some());
        assert!(cache.get(2).await.is_none());
    }

    #[tokio::test]
    async fn build_failures_are_not_cached() {
        let cache = IndexCache::new(NonZeroUsize::new(4).unwrap());
        let empty = Arc::new(ScriptedChain::new());
        let result = cache
            .get_or_build(7, move || {
                ExecutionStateIndex::build(empty.as_ref(), 1..2, U256::zero(), ProofConfig::default())
            })
            .await;
        let error = result.unwrap_err();
        assert!(error.downcast_ref::<state_proof::ProofError>().is_some());
        assert!(cache.get(7).await.is_none());
    }
}
