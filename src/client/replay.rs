use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};

use alloy::{
    primitives::{Address, Bytes},
    rpc::types::{Block, Filter, Header, Log},
};
use async_trait::async_trait;
use tokio::{sync::mpsc, task::JoinSet};
use tracing::debug;

use crate::{
    ClientError,
    client::{ChainClient, DEFAULT_SUBSCRIPTION_BUFFER, HeaderSubscription, LogSubscription},
};

struct SimulatedLogSubscription {
    filter: Filter,
    logs: mpsc::Sender<Log>,
    // held open so the subscriber's error channel stays alive
    _errors: mpsc::Sender<ClientError>,
    active: bool,
}

struct SimulatedHeaderSubscription {
    headers: mpsc::Sender<Header>,
    _errors: mpsc::Sender<ClientError>,
    active: bool,
}

struct ReplayShared {
    inner: Arc<dyn ChainClient>,
    block_number: AtomicU64,
    log_subs: Mutex<Vec<SimulatedLogSubscription>>,
    header_subs: Mutex<Vec<SimulatedHeaderSubscription>>,
}

/// Deterministic replay client.
///
/// Drives the runtime from a scripted block sequence instead of a live
/// subscription: the client holds a virtual "current block" that only moves
/// when [`fetch_new_block`](ReplayClient::fetch_new_block) is called.
/// Each call advances the height by one, fetches the real header at that
/// height from the inner client, fans it out to all active header
/// subscribers, then re-queries every active log subscriber's original
/// filter restricted to exactly that height and fans the matches out.
///
/// Fan-out delivery runs concurrently (one task per subscriber) but
/// `fetch_new_block` does not return until every delivery has been accepted,
/// giving tests a synchronous "advance one block and wait" primitive.
///
/// Reads that accept a block number are clamped to the virtual height so a
/// service can never see into the simulated future. Dropping a
/// subscription's receivers deactivates it on the next fan-out; `close`
/// deactivates all of them.
///
/// Cloning yields another handle to the same simulated chain, so a test can
/// keep one handle to drive blocks while the runtime owns the other.
#[derive(Clone)]
pub struct ReplayClient {
    shared: Arc<ReplayShared>,
}

impl ReplayClient {
    /// Wrap `inner` with the virtual height seeded at `block_number`.
    #[must_use]
    pub fn new(inner: Arc<dyn ChainClient>, block_number: u64) -> Self {
        Self {
            shared: Arc::new(ReplayShared {
                inner,
                block_number: AtomicU64::new(block_number),
                log_subs: Mutex::new(Vec::new()),
                header_subs: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Re-seed the virtual height.
    pub fn set_block_number(&self, block_number: u64) {
        self.shared.block_number.store(block_number, Ordering::SeqCst);
    }

    /// Current virtual height.
    #[must_use]
    pub fn current_block(&self) -> u64 {
        self.shared.block_number.load(Ordering::SeqCst)
    }

    /// Number of log subscriptions still being fanned out to.
    #[must_use]
    pub fn active_log_subscriptions(&self) -> usize {
        lock(&self.shared.log_subs).iter().filter(|s| s.active).count()
    }

    /// Number of header subscriptions still being fanned out to.
    #[must_use]
    pub fn active_header_subscriptions(&self) -> usize {
        lock(&self.shared.header_subs).iter().filter(|s| s.active).count()
    }

    /// Deactivate every simulated subscription, closing their channels.
    pub fn close(&self) {
        lock(&self.shared.log_subs).clear();
        lock(&self.shared.header_subs).clear();
    }

    fn clamp(&self, number: Option<u64>) -> u64 {
        let current = self.current_block();
        number.map_or(current, |n| n.min(current))
    }

    /// Advance the virtual chain by one block and deliver it.
    ///
    /// Returns the new height once every subscriber has accepted its
    /// deliveries for this block.
    ///
    /// # Errors
    ///
    /// Propagates inner-client failures for the header fetch or any log
    /// query; the height is still advanced in that case, matching a chain
    /// that produced a block we failed to observe.
    pub async fn fetch_new_block(&self) -> Result<u64, ClientError> {
        let height = self.shared.block_number.fetch_add(1, Ordering::SeqCst) + 1;
        let header = self.shared.inner.header_by_number(Some(height)).await?;
        debug!(height, "replaying block");

        let mut deliveries: JoinSet<(SubKind, usize, bool)> = JoinSet::new();

        let header_targets: Vec<(usize, mpsc::Sender<Header>)> = lock(&self.shared.header_subs)
            .iter()
            .enumerate()
            .filter(|(_, sub)| sub.active)
            .map(|(idx, sub)| (idx, sub.headers.clone()))
            .collect();
        for (idx, sender) in header_targets {
            let header = header.clone();
            deliveries
                .spawn(async move { (SubKind::Header, idx, sender.send(header).await.is_ok()) });
        }

        let log_targets: Vec<(usize, Filter, mpsc::Sender<Log>)> = lock(&self.shared.log_subs)
            .iter()
            .enumerate()
            .filter(|(_, sub)| sub.active)
            .map(|(idx, sub)| (idx, sub.filter.clone(), sub.logs.clone()))
            .collect();
        for (idx, filter, sender) in log_targets {
            let query = filter.from_block(height).to_block(height);
            let logs = self.shared.inner.get_logs(&query).await?;
            deliveries.spawn(async move {
                for log in logs {
                    if sender.send(log).await.is_err() {
                        return (SubKind::Log, idx, false);
                    }
                }
                (SubKind::Log, idx, true)
            });
        }

        while let Some(result) = deliveries.join_next().await {
            if let Ok((kind, idx, delivered)) = result
                && !delivered
            {
                // receiver dropped, treat as unsubscribed
                self.deactivate(kind, idx);
            }
        }

        Ok(height)
    }

    fn deactivate(&self, kind: SubKind, idx: usize) {
        match kind {
            SubKind::Log => {
                if let Some(sub) = lock(&self.shared.log_subs).get_mut(idx) {
                    sub.active = false;
                }
            }
            SubKind::Header => {
                if let Some(sub) = lock(&self.shared.header_subs).get_mut(idx) {
                    sub.active = false;
                }
            }
        }
    }
}

#[derive(Copy, Clone)]
enum SubKind {
    Log,
    Header,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[async_trait]
impl ChainClient for ReplayClient {
    async fn code_at(&self, address: Address, block: Option<u64>) -> Result<Bytes, ClientError> {
        self.shared.inner.code_at(address, Some(self.clamp(block))).await
    }

    async fn block_number(&self) -> Result<u64, ClientError> {
        Ok(self.current_block())
    }

    async fn header_by_number(&self, number: Option<u64>) -> Result<Header, ClientError> {
        self.shared.inner.header_by_number(Some(self.clamp(number))).await
    }

    async fn block_by_number(&self, number: Option<u64>) -> Result<Block, ClientError> {
        self.shared.inner.block_by_number(Some(self.clamp(number))).await
    }

    async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>, ClientError> {
        self.shared.inner.get_logs(filter).await
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, ClientError> {
        self.shared.inner.call(to, data).await
    }

    async fn subscribe_logs(&self, filter: &Filter) -> Result<LogSubscription, ClientError> {
        let (log_tx, log_rx) = mpsc::channel(DEFAULT_SUBSCRIPTION_BUFFER);
        let (err_tx, err_rx) = mpsc::channel(1);

        lock(&self.shared.log_subs).push(SimulatedLogSubscription {
            filter: filter.clone(),
            logs: log_tx,
            _errors: err_tx,
            active: true,
        });

        Ok(LogSubscription { logs: log_rx, errors: err_rx })
    }

    async fn subscribe_headers(&self) -> Result<HeaderSubscription, ClientError> {
        let (header_tx, header_rx) = mpsc::channel(DEFAULT_SUBSCRIPTION_BUFFER);
        let (err_tx, err_rx) = mpsc::channel(1);

        lock(&self.shared.header_subs).push(SimulatedHeaderSubscription {
            headers: header_tx,
            _errors: err_tx,
            active: true,
        });

        Ok(HeaderSubscription { headers: header_rx, errors: err_rx })
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::{B256, address, b256};

    use super::*;
    use crate::test_utils::{MockChain, fixtures};

    const FACTORY: Address = address!("cA143Ce32Fe78f1f7019d7d551a6402fC5350c73");
    const OTHER: Address = address!("0000000000000000000000000000000000000bad");
    const TX: B256 = b256!("11d1bd0f6ba80134a33ba9275ac585d9d315f0ad8355cddefde31afa28d0e9aa");

    fn replay_over_mock(seed: u64) -> (Arc<MockChain>, ReplayClient) {
        let chain = Arc::new(MockChain::new());
        let replay = ReplayClient::new(chain.clone(), seed);
        (chain, replay)
    }

    #[tokio::test]
    async fn fetch_new_block_fans_out_only_matching_logs() -> anyhow::Result<()> {
        let (chain, replay) = replay_over_mock(99);
        chain.push_log(fixtures::raw_log(FACTORY, 100, TX));

        let mut matching = replay.subscribe_logs(&Filter::new().address(FACTORY)).await?;
        let mut other = replay.subscribe_logs(&Filter::new().address(OTHER)).await?;

        let height = replay.fetch_new_block().await?;
        assert_eq!(height, 100);

        let log = matching.logs.recv().await.expect("matching subscriber gets the log");
        assert_eq!(log.transaction_hash, Some(TX));
        assert!(matching.logs.try_recv().is_err(), "exactly one log expected");
        assert!(other.logs.try_recv().is_err(), "non-matching subscriber stays empty");
        Ok(())
    }

    #[tokio::test]
    async fn fetch_new_block_fans_out_headers_to_all_subscribers() -> anyhow::Result<()> {
        let (_, replay) = replay_over_mock(5);

        let mut first = replay.subscribe_headers().await?;
        let mut second = replay.subscribe_headers().await?;

        replay.fetch_new_block().await?;

        assert_eq!(first.headers.recv().await.map(|h| h.number), Some(6));
        assert_eq!(second.headers.recv().await.map(|h| h.number), Some(6));
        Ok(())
    }

    #[tokio::test]
    async fn reads_are_clamped_to_the_virtual_height() -> anyhow::Result<()> {
        let (chain, replay) = replay_over_mock(10);
        chain.set_code(FACTORY, alloy::primitives::Bytes::from_static(b"\x60"));

        let header = replay.header_by_number(Some(10_000)).await?;
        assert_eq!(header.number, 10);

        assert_eq!(replay.block_number().await?, 10);
        assert_eq!(chain.last_code_at_block(), None);
        let _ = replay.code_at(FACTORY, Some(10_000)).await?;
        assert_eq!(chain.last_code_at_block(), Some(10));
        Ok(())
    }

    #[tokio::test]
    async fn dropped_subscribers_are_skipped_on_later_blocks() -> anyhow::Result<()> {
        let (chain, replay) = replay_over_mock(0);
        chain.push_log(fixtures::raw_log(FACTORY, 1, TX));
        chain.push_log(fixtures::raw_log(FACTORY, 2, TX));

        let sub = replay.subscribe_logs(&Filter::new().address(FACTORY)).await?;
        assert_eq!(replay.active_log_subscriptions(), 1);

        drop(sub);
        replay.fetch_new_block().await?;
        assert_eq!(replay.active_log_subscriptions(), 0);

        // second fetch must not stall on the dead subscription
        replay.fetch_new_block().await?;
        assert_eq!(replay.current_block(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn close_deactivates_everything() -> anyhow::Result<()> {
        let (_, replay) = replay_over_mock(0);
        let _logs = replay.subscribe_logs(&Filter::new()).await?;
        let _headers = replay.subscribe_headers().await?;

        replay.close();
        assert_eq!(replay.active_log_subscriptions(), 0);
        assert_eq!(replay.active_header_subscriptions(), 0);
        Ok(())
    }
}
