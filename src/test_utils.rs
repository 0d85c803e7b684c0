//! In-memory doubles for exercising the runtime without a node.
//!
//! Available to integration tests through the `test-utils` feature.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
};

use alloy::{
    eips::BlockNumberOrTag,
    primitives::{Address, B256, Bytes, LogData, U256},
    rpc::types::{Block, BlockTransactions, Filter, Header, Log},
    transports::TransportErrorKind,
};
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    ClientError, Config, EventContext, SentinelError,
    client::{ChainClient, DEFAULT_SUBSCRIPTION_BUFFER, HeaderSubscription, LogSubscription},
    notice::Notifier,
    service::{Operator, Service, Status},
};

fn injected_error() -> ClientError {
    ClientError::Rpc(Arc::new(TransportErrorKind::custom_str("injected failure")))
}

/// Decrement-or-consume a failure budget. `u64::MAX` means "fail forever".
fn take_failure(budget: &AtomicU64) -> bool {
    let mut current = budget.load(Ordering::SeqCst);
    loop {
        if current == 0 {
            return false;
        }
        if current == u64::MAX {
            return true;
        }
        match budget.compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return true,
            Err(actual) => current = actual,
        }
    }
}

struct MockSubscription {
    filter: Filter,
    logs: mpsc::Sender<Log>,
    errors: mpsc::Sender<ClientError>,
}

/// Scriptable in-memory chain.
///
/// Serves `code_at` from a fixed map, `get_logs` from a pushed log list, and
/// synthesizes headers on demand. Failures are injected per call site with a
/// countdown budget. `emit`/`emit_error` push into live subscriptions the
/// way a node would.
#[derive(Default)]
pub struct MockChain {
    codes: Mutex<HashMap<Address, Bytes>>,
    logs: Mutex<Vec<Log>>,
    call_results: Mutex<HashMap<Address, Bytes>>,
    head: AtomicU64,
    code_at_calls: AtomicUsize,
    get_logs_calls: AtomicUsize,
    last_code_at_block: Mutex<Option<u64>>,
    fail_code_at: AtomicU64,
    fail_get_logs: AtomicU64,
    fail_call: AtomicU64,
    fail_subscribe: AtomicU64,
    subscriptions: Mutex<Vec<MockSubscription>>,
}

impl MockChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_code(&self, address: Address, code: Bytes) {
        lock(&self.codes).insert(address, code);
    }

    pub fn set_head(&self, number: u64) {
        self.head.store(number, Ordering::SeqCst);
    }

    pub fn push_log(&self, log: Log) {
        lock(&self.logs).push(log);
    }

    /// Canned return data for `call`s to the given contract.
    pub fn set_call_result(&self, to: Address, data: Bytes) {
        lock(&self.call_results).insert(to, data);
    }

    /// Fail the next `n` `code_at` calls (0 clears any standing failure).
    pub fn fail_code_at_times(&self, n: u64) {
        self.fail_code_at.store(n, Ordering::SeqCst);
    }

    pub fn fail_code_at_always(&self) {
        self.fail_code_at.store(u64::MAX, Ordering::SeqCst);
    }

    pub fn fail_get_logs_times(&self, n: u64) {
        self.fail_get_logs.store(n, Ordering::SeqCst);
    }

    pub fn fail_call_times(&self, n: u64) {
        self.fail_call.store(n, Ordering::SeqCst);
    }

    pub fn fail_subscribe_times(&self, n: u64) {
        self.fail_subscribe.store(n, Ordering::SeqCst);
    }

    #[must_use]
    pub fn code_at_calls(&self) -> usize {
        self.code_at_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn get_logs_calls(&self) -> usize {
        self.get_logs_calls.load(Ordering::SeqCst)
    }

    /// Block argument of the most recent `code_at` call.
    #[must_use]
    pub fn last_code_at_block(&self) -> Option<u64> {
        *lock(&self.last_code_at_block)
    }

    /// Subscriptions whose receiver is still alive.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        lock(&self.subscriptions).iter().filter(|sub| !sub.logs.is_closed()).count()
    }

    /// Deliver a log to every live subscription whose filter matches.
    pub async fn emit(&self, log: Log) {
        let targets: Vec<mpsc::Sender<Log>> = lock(&self.subscriptions)
            .iter()
            .filter(|sub| !sub.logs.is_closed() && filter_matches(&sub.filter, &log))
            .map(|sub| sub.logs.clone())
            .collect();
        for sender in targets {
            let _ = sender.send(log.clone()).await;
        }
    }

    /// Deliver a transport error to every live subscription.
    pub async fn emit_error(&self, error: ClientError) {
        let targets: Vec<mpsc::Sender<ClientError>> = lock(&self.subscriptions)
            .iter()
            .filter(|sub| !sub.errors.is_closed())
            .map(|sub| sub.errors.clone())
            .collect();
        for sender in targets {
            let _ = sender.send(error.clone()).await;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn range_bound(bound: Option<&BlockNumberOrTag>) -> Option<u64> {
    bound.and_then(BlockNumberOrTag::as_number)
}

/// Address, topic, and block-range matching, the way a node evaluates an
/// `eth_getLogs` filter.
fn filter_matches(filter: &Filter, log: &Log) -> bool {
    if !filter.address.matches(&log.address()) {
        return false;
    }
    let topics = log.data().topics();
    for (position, wanted) in filter.topics.iter().enumerate() {
        if wanted.is_empty() {
            continue;
        }
        match topics.get(position) {
            Some(topic) if wanted.matches(topic) => {}
            _ => return false,
        }
    }
    let number = log.block_number.unwrap_or_default();
    if let Some(from) = range_bound(filter.block_option.get_from_block())
        && number < from
    {
        return false;
    }
    if let Some(to) = range_bound(filter.block_option.get_to_block())
        && number > to
    {
        return false;
    }
    true
}

#[async_trait]
impl ChainClient for MockChain {
    async fn code_at(&self, address: Address, block: Option<u64>) -> Result<Bytes, ClientError> {
        self.code_at_calls.fetch_add(1, Ordering::SeqCst);
        *lock(&self.last_code_at_block) = block;
        if take_failure(&self.fail_code_at) {
            return Err(injected_error());
        }
        lock(&self.codes).get(&address).cloned().ok_or_else(injected_error)
    }

    async fn block_number(&self) -> Result<u64, ClientError> {
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn header_by_number(&self, number: Option<u64>) -> Result<Header, ClientError> {
        let number = number.unwrap_or_else(|| self.head.load(Ordering::SeqCst));
        Ok(fixtures::header_at(number))
    }

    async fn block_by_number(&self, number: Option<u64>) -> Result<Block, ClientError> {
        let number = number.unwrap_or_else(|| self.head.load(Ordering::SeqCst));
        Ok(fixtures::block_at(number))
    }

    async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>, ClientError> {
        self.get_logs_calls.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.fail_get_logs) {
            return Err(injected_error());
        }
        Ok(lock(&self.logs).iter().filter(|log| filter_matches(filter, log)).cloned().collect())
    }

    async fn call(&self, to: Address, _data: Bytes) -> Result<Bytes, ClientError> {
        if take_failure(&self.fail_call) {
            return Err(injected_error());
        }
        lock(&self.call_results).get(&to).cloned().ok_or_else(injected_error)
    }

    async fn subscribe_logs(&self, filter: &Filter) -> Result<LogSubscription, ClientError> {
        if take_failure(&self.fail_subscribe) {
            return Err(injected_error());
        }
        let (log_tx, log_rx) = mpsc::channel(DEFAULT_SUBSCRIPTION_BUFFER);
        let (err_tx, err_rx) = mpsc::channel(1);
        lock(&self.subscriptions).push(MockSubscription {
            filter: filter.clone(),
            logs: log_tx,
            errors: err_tx,
        });
        Ok(LogSubscription { logs: log_rx, errors: err_rx })
    }

    async fn subscribe_headers(&self) -> Result<HeaderSubscription, ClientError> {
        let (_header_tx, header_rx) = mpsc::channel(DEFAULT_SUBSCRIPTION_BUFFER);
        let (_err_tx, err_rx) = mpsc::channel(1);
        Ok(HeaderSubscription { headers: header_rx, errors: err_rx })
    }
}

/// Service double that records every dispatch.
///
/// Failures are injected per phase with a countdown budget. When armed via
/// [`replay_failures`](RecordingService::replay_failures), a failing phase
/// raises the replay flag the way a real service opting into replay would.
pub struct RecordingService {
    name: String,
    filter: Filter,
    handled: Mutex<Vec<EventContext>>,
    pre_runs: AtomicUsize,
    inits: AtomicUsize,
    fail_need_handle: AtomicU64,
    fail_execute: AtomicU64,
    execute_delay_ms: AtomicU64,
    arm_replay: AtomicBool,
    retry: AtomicBool,
}

impl RecordingService {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            filter: Filter::new(),
            handled: Mutex::new(Vec::new()),
            pre_runs: AtomicUsize::new(0),
            inits: AtomicUsize::new(0),
            fail_need_handle: AtomicU64::new(0),
            fail_execute: AtomicU64::new(0),
            execute_delay_ms: AtomicU64::new(0),
            arm_replay: AtomicBool::new(false),
            retry: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    /// When `true`, any injected failure also requests replay-on-restart.
    pub fn replay_failures(&self, arm: bool) {
        self.arm_replay.store(arm, Ordering::SeqCst);
    }

    pub fn fail_need_handle_times(&self, n: u64) {
        self.fail_need_handle.store(n, Ordering::SeqCst);
    }

    pub fn fail_execute_times(&self, n: u64) {
        self.fail_execute.store(n, Ordering::SeqCst);
    }

    /// Make every `execute` call sleep first, to simulate a slow handler.
    pub fn set_execute_delay(&self, delay: std::time::Duration) {
        self.execute_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Every context that made it through `execute`, in dispatch order.
    #[must_use]
    pub fn handled(&self) -> Vec<EventContext> {
        lock(&self.handled).clone()
    }

    /// Transaction hashes of handled events, in dispatch order.
    #[must_use]
    pub fn handled_txs(&self) -> Vec<B256> {
        lock(&self.handled)
            .iter()
            .filter_map(|ctx| ctx.event().and_then(|log| log.transaction_hash))
            .collect()
    }

    #[must_use]
    pub fn pre_run_count(&self) -> usize {
        self.pre_runs.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn init_count(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }

    fn fail(&self, phase: &str) -> SentinelError {
        if self.arm_replay.load(Ordering::SeqCst) {
            self.retry.store(true, Ordering::SeqCst);
        }
        SentinelError::service(&self.name, format!("injected {phase} failure"))
    }
}

#[async_trait]
impl Service for RecordingService {
    fn name(&self) -> &str {
        &self.name
    }

    fn filter(&self) -> Filter {
        self.filter.clone()
    }

    async fn pre_run(&self) {
        self.pre_runs.fetch_add(1, Ordering::SeqCst);
    }

    async fn need_handle(&self, _ctx: &mut EventContext) -> Result<bool, SentinelError> {
        if take_failure(&self.fail_need_handle) {
            return Err(self.fail("need_handle"));
        }
        Ok(true)
    }

    async fn execute(&self, ctx: &mut EventContext) -> Result<(), SentinelError> {
        let delay = self.execute_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
        if take_failure(&self.fail_execute) {
            return Err(self.fail("execute"));
        }
        lock(&self.handled).push(ctx.clone());
        Ok(())
    }

    fn retry(&self) -> bool {
        self.retry.swap(false, Ordering::SeqCst)
    }

    async fn init(
        &self,
        _config: &Config,
        _status: Arc<Status>,
        _operator: Operator,
    ) -> Result<(), SentinelError> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Notifier double that records every broadcast it receives.
#[derive(Default)]
pub struct CaptureNotifier {
    notices: Mutex<Vec<(String, EventContext)>>,
}

impl CaptureNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `(service name, context)` pairs in broadcast order.
    #[must_use]
    pub fn notices(&self) -> Vec<(String, EventContext)> {
        lock(&self.notices).clone()
    }
}

#[async_trait]
impl Notifier for CaptureNotifier {
    fn name(&self) -> &str {
        "capture"
    }

    async fn notify(&self, ctx: &EventContext, srv: &dyn Service) -> Result<(), SentinelError> {
        lock(&self.notices).push((srv.name().to_owned(), ctx.clone()));
        Ok(())
    }
}

/// Canned chain data.
pub mod fixtures {
    use super::{
        Address, B256, Block, BlockTransactions, Bytes, Header, Log, LogData, U256,
    };

    /// A synthetic header at `number` with a height-derived hash.
    #[must_use]
    pub fn header_at(number: u64) -> Header {
        let inner = alloy::consensus::Header {
            number,
            timestamp: 1_600_000_000 + number,
            ..Default::default()
        };
        Header {
            hash: B256::from(U256::from(number)),
            inner,
            total_difficulty: None,
            size: None,
        }
    }

    /// A block at `number` with no transactions.
    #[must_use]
    pub fn block_at(number: u64) -> Block {
        Block {
            header: header_at(number),
            uncles: Vec::new(),
            transactions: BlockTransactions::Hashes(Vec::new()),
            withdrawals: None,
        }
    }

    /// A log with the given payload, positioned at `block`/`tx`.
    #[must_use]
    pub fn log_with_data(address: Address, data: LogData, block: u64, tx: B256) -> Log {
        Log {
            inner: alloy::primitives::Log { address, data },
            block_hash: Some(B256::from(U256::from(block))),
            block_number: Some(block),
            block_timestamp: Some(1_600_000_000 + block),
            transaction_hash: Some(tx),
            transaction_index: Some(0),
            log_index: Some(0),
            removed: false,
        }
    }

    /// A topic-less log, enough for address-filter tests.
    #[must_use]
    pub fn raw_log(address: Address, block: u64, tx: B256) -> Log {
        log_with_data(address, LogData::new_unchecked(Vec::new(), Bytes::new()), block, tx)
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::{address, b256};

    use super::*;

    const ADDR: Address = address!("cA143Ce32Fe78f1f7019d7d551a6402fC5350c73");
    const TX: B256 = b256!("0d3648bd0f6ba80134a33ba9275ac585d9d315f0ad8355cddefde31afa28d0e9");

    #[test]
    fn filter_matching_honors_address_and_range() {
        let log = fixtures::raw_log(ADDR, 50, TX);

        assert!(filter_matches(&Filter::new(), &log));
        assert!(filter_matches(&Filter::new().address(ADDR), &log));
        assert!(!filter_matches(
            &Filter::new().address(address!("0000000000000000000000000000000000000bad")),
            &log
        ));
        assert!(!filter_matches(&Filter::new().from_block(51u64), &log));
        assert!(!filter_matches(&Filter::new().to_block(49u64), &log));
        assert!(filter_matches(&Filter::new().from_block(50u64).to_block(50u64), &log));
    }

    #[tokio::test]
    async fn failure_budget_counts_down() {
        let chain = MockChain::new();
        chain.set_code(ADDR, Bytes::from_static(b"\x01"));
        chain.fail_code_at_times(1);

        assert!(chain.code_at(ADDR, None).await.is_err());
        assert!(chain.code_at(ADDR, None).await.is_ok());
        assert_eq!(chain.code_at_calls(), 2);
    }

    #[tokio::test]
    async fn emit_respects_subscription_filters() -> anyhow::Result<()> {
        let chain = MockChain::new();
        let mut matching = chain.subscribe_logs(&Filter::new().address(ADDR)).await?;
        let mut other = chain
            .subscribe_logs(&Filter::new().address(address!(
                "0000000000000000000000000000000000000bad"
            )))
            .await?;

        chain.emit(fixtures::raw_log(ADDR, 1, TX)).await;

        assert!(matching.logs.try_recv().is_ok());
        assert!(other.logs.try_recv().is_err());
        Ok(())
    }
}
