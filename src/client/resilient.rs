use std::{sync::Arc, time::Duration};

use alloy::{
    primitives::{Address, Bytes},
    rpc::types::{Block, Filter, Header, Log},
};
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use tracing::info;

use crate::{
    ClientError,
    client::{BytecodeCache, ChainClient, HeaderSubscription, LogSubscription},
    config::DEFAULT_CACHE_SIZE,
};

/// Default number of retries after the initial `code_at` attempt.
pub const DEFAULT_MAX_RETRIES: usize = 5;
/// Default base delay for the exponential backoff between attempts.
pub const DEFAULT_MIN_DELAY: Duration = Duration::from_millis(100);

/// Caching, retrying wrapper around a [`ChainClient`].
///
/// Only `code_at` is cached and retried: bytecode is immutable on-chain, so
/// a hit never goes stale, and the call sits on services' hot path during
/// `pre_run`. Every other call passes straight through so the runtime's
/// failover logic sees errors immediately.
pub struct ResilientClient {
    inner: Arc<dyn ChainClient>,
    cache: BytecodeCache,
    max_retries: usize,
    min_delay: Duration,
}

impl ResilientClient {
    #[must_use]
    pub fn new(inner: Arc<dyn ChainClient>) -> Self {
        Self::with_cache_size(inner, DEFAULT_CACHE_SIZE)
    }

    #[must_use]
    pub fn with_cache_size(inner: Arc<dyn ChainClient>, cache_size: usize) -> Self {
        Self {
            inner,
            cache: BytecodeCache::new(cache_size),
            max_retries: DEFAULT_MAX_RETRIES,
            min_delay: DEFAULT_MIN_DELAY,
        }
    }

    /// Set the number of retries after the initial attempt.
    #[must_use]
    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the base delay for the exponential backoff.
    #[must_use]
    pub fn min_delay(mut self, min_delay: Duration) -> Self {
        self.min_delay = min_delay;
        self
    }

    /// Another handle to the internal bytecode cache.
    #[must_use]
    pub fn cache(&self) -> BytecodeCache {
        self.cache.clone()
    }

    /// Release the client. Purges the cache; using the client afterwards is
    /// a caller bug (calls would re-populate a cache the owner considers
    /// gone), so `close` consumes the value.
    pub fn close(self) {
        self.cache.purge();
    }
}

#[async_trait]
impl ChainClient for ResilientClient {
    async fn code_at(&self, address: Address, block: Option<u64>) -> Result<Bytes, ClientError> {
        if let Some(code) = self.cache.get(&address) {
            return Ok(code);
        }

        let strategy = ExponentialBuilder::default()
            .with_max_times(self.max_retries)
            .with_min_delay(self.min_delay);

        let code = (|| self.inner.code_at(address, block))
            .retry(strategy)
            .sleep(tokio::time::sleep)
            .notify(|err: &ClientError, dur: Duration| {
                info!(%address, error = %err, "code_at failed, retrying after {dur:?}");
            })
            .await?;

        // only successful reads are cached, exhaustion surfaces the last error
        self.cache.put(address, code.clone());
        Ok(code)
    }

    async fn block_number(&self) -> Result<u64, ClientError> {
        self.inner.block_number().await
    }

    async fn header_by_number(&self, number: Option<u64>) -> Result<Header, ClientError> {
        self.inner.header_by_number(number).await
    }

    async fn block_by_number(&self, number: Option<u64>) -> Result<Block, ClientError> {
        self.inner.block_by_number(number).await
    }

    async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>, ClientError> {
        self.inner.get_logs(filter).await
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, ClientError> {
        self.inner.call(to, data).await
    }

    async fn subscribe_logs(&self, filter: &Filter) -> Result<LogSubscription, ClientError> {
        self.inner.subscribe_logs(filter).await
    }

    async fn subscribe_headers(&self) -> Result<HeaderSubscription, ClientError> {
        self.inner.subscribe_headers().await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use alloy::primitives::address;

    use super::*;
    use crate::test_utils::MockChain;

    const TOKEN: Address = address!("55d398326f99059fF775485246999027B3197955");

    #[tokio::test]
    async fn second_code_at_is_served_from_cache() -> anyhow::Result<()> {
        let chain = Arc::new(MockChain::new());
        chain.set_code(TOKEN, Bytes::from_static(b"\x60\x80\x60\x40"));

        let client = ResilientClient::new(chain.clone());

        let first = client.code_at(TOKEN, None).await?;
        let second = client.code_at(TOKEN, None).await?;

        assert_eq!(first, second);
        assert_eq!(chain.code_at_calls(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn retries_until_success_and_caches_the_result() -> anyhow::Result<()> {
        let chain = Arc::new(MockChain::new());
        chain.set_code(TOKEN, Bytes::from_static(b"\x60\x80"));
        chain.fail_code_at_times(2);

        let client = ResilientClient::new(chain.clone()).min_delay(Duration::from_millis(1));

        let code = client.code_at(TOKEN, None).await?;
        assert_eq!(code, Bytes::from_static(b"\x60\x80"));
        assert_eq!(chain.code_at_calls(), 3);

        // success populated the cache
        let _ = client.code_at(TOKEN, None).await?;
        assert_eq!(chain.code_at_calls(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn exhausted_retries_surface_the_error_and_cache_nothing() {
        let chain = Arc::new(MockChain::new());
        chain.set_code(TOKEN, Bytes::from_static(b"\x60\x80"));
        chain.fail_code_at_always();

        let retries = 5;
        let min_delay = Duration::from_millis(2);
        let client = ResilientClient::new(chain.clone())
            .max_retries(retries)
            .min_delay(min_delay);

        let started = Instant::now();
        let result = client.code_at(TOKEN, None).await;
        let elapsed = started.elapsed();

        assert!(result.is_err());
        // initial attempt + `retries` retries, no more
        assert_eq!(chain.code_at_calls(), retries + 1);
        // delays double from min_delay: 2 + 4 + 8 + 16 + 32 ms lower bound
        let expected_floor: u64 = (0..retries as u32).map(|i| 2u64 << i).sum();
        assert!(
            elapsed >= Duration::from_millis(expected_floor),
            "expected at least {expected_floor}ms of backoff, got {elapsed:?}"
        );
        assert!(client.cache().is_empty());

        // a later success is not blocked by the earlier failure
        chain.fail_code_at_times(0);
        assert!(client.code_at(TOKEN, None).await.is_ok());
    }

    #[tokio::test]
    async fn other_reads_are_not_retried() {
        let chain = Arc::new(MockChain::new());
        chain.fail_get_logs_times(1);

        let client = ResilientClient::new(chain.clone());
        let result = client.get_logs(&Filter::new()).await;

        assert!(result.is_err());
        assert_eq!(chain.get_logs_calls(), 1);
    }
}
