//! Watches PancakeSwap V2 `PairCreated` events and flags new pairs whose
//! token bytecode is byte-identical to a watched contract, which usually
//! means a copy of a known token just went on-chain.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
};

use alloy::{
    primitives::{Address, Bytes, address},
    rpc::types::Filter,
    sol,
    sol_types::SolEvent,
};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::{
    ClientError, Config, EventContext, NOTICE_CONTENT, SentinelError,
    notice::{DingtalkMessage, DingtalkSource, LogSource},
    service::{Operator, Service, Status},
};

sol! {
    event PairCreated(address indexed token0, address indexed token1, address pair, uint256);
}

/// PancakeSwap V2 factory on BSC mainnet.
pub const PANCAKE_FACTORY_V2: Address = address!("cA143Ce32Fe78f1f7019d7d551a6402fC5350c73");

const SERVICE_NAME: &str = "pair_created";

// context keys carrying the match from the decision to the action phase
const KEY_TX_HASH: &str = "tx_hash";
const KEY_TOKEN: &str = "token";
const KEY_SOURCE: &str = "source_token";
const KEY_GROUP: &str = "source_group";

/// `services.pair_created.config` section: token group name to the
/// addresses whose bytecode should be watched for.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PairCreatedConfig {
    #[serde(default)]
    pub tokens: HashMap<String, Vec<Address>>,
}

struct Deps {
    status: Arc<Status>,
    operator: Operator,
    dingtalk_token: String,
}

/// Watched token address to its bytecode and group, rebuilt by `pre_run`.
#[derive(Default)]
struct WatchList {
    byte_codes: HashMap<Address, Bytes>,
    token_group: HashMap<Address, String>,
}

pub struct PairCreatedListener {
    deps: OnceLock<Deps>,
    config: OnceLock<PairCreatedConfig>,
    watch: Mutex<WatchList>,
    retry: AtomicBool,
}

impl Default for PairCreatedListener {
    fn default() -> Self {
        Self::new()
    }
}

impl PairCreatedListener {
    #[must_use]
    pub fn new() -> Self {
        Self {
            deps: OnceLock::new(),
            config: OnceLock::new(),
            watch: Mutex::new(WatchList::default()),
            retry: AtomicBool::new(false),
        }
    }

    fn deps(&self) -> Result<&Deps, SentinelError> {
        self.deps.get().ok_or_else(|| SentinelError::service(SERVICE_NAME, "not initialized"))
    }

    /// Bytecode of `token` at the latest block, through the shared cache.
    async fn byte_code(status: &Status, token: Address) -> Result<Bytes, ClientError> {
        if let Some(code) = status.cache.get(&token) {
            return Ok(code);
        }
        let code = status.client.code_at(token, None).await?;
        status.cache.put(token, code.clone());
        Ok(code)
    }

    fn watch(&self) -> std::sync::MutexGuard<'_, WatchList> {
        self.watch.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl Service for PairCreatedListener {
    fn name(&self) -> &str {
        SERVICE_NAME
    }

    fn filter(&self) -> Filter {
        Filter::new().address(PANCAKE_FACTORY_V2).event_signature(PairCreated::SIGNATURE_HASH)
    }

    /// Rebuild the watch-list from the configured token groups. Tokens whose
    /// bytecode cannot be fetched are skipped with a warning, so one bad
    /// address does not keep the rest of the group from being watched.
    async fn pre_run(&self) {
        let Some(config) = self.config.get() else { return };
        let Some(deps) = self.deps.get() else { return };

        let mut fresh = WatchList::default();
        for (group, tokens) in &config.tokens {
            for token in tokens {
                match Self::byte_code(&deps.status, *token).await {
                    Ok(code) => {
                        fresh.byte_codes.insert(*token, code);
                        fresh.token_group.insert(*token, group.clone());
                    }
                    Err(err) => {
                        warn!(%token, group, error = %err, "bytecode fetch failed, skipping token");
                    }
                }
            }
        }
        info!(watched = fresh.byte_codes.len(), "watch-list rebuilt");
        *self.watch() = fresh;
    }

    async fn need_handle(&self, ctx: &mut EventContext) -> Result<bool, SentinelError> {
        let Some(log) = ctx.event() else {
            return Ok(false);
        };
        let tx_hash = log.transaction_hash.unwrap_or_default();
        let pair_created = PairCreated::decode_log_data(log.data())?;
        let deps = self.deps()?;

        let code0 = Self::byte_code(&deps.status, pair_created.token0).await.inspect_err(|err| {
            error!(token = %pair_created.token0, error = %err, "bytecode fetch failed");
            self.retry.store(true, Ordering::SeqCst);
        })?;
        let code1 = Self::byte_code(&deps.status, pair_created.token1).await.inspect_err(|err| {
            error!(token = %pair_created.token1, error = %err, "bytecode fetch failed");
            self.retry.store(true, Ordering::SeqCst);
        })?;

        let matched = {
            let watch = self.watch();
            watch.byte_codes.iter().find_map(|(source, code)| {
                let token = if *code == code0 {
                    pair_created.token0
                } else if *code == code1 {
                    pair_created.token1
                } else {
                    return None;
                };
                let group = watch.token_group.get(source).cloned().unwrap_or_default();
                Some((token, *source, group))
            })
        };

        let Some((token, source, group)) = matched else {
            return Ok(false);
        };
        ctx.set(KEY_TX_HASH, tx_hash);
        ctx.set(KEY_TOKEN, token);
        ctx.set(KEY_SOURCE, source);
        ctx.set(KEY_GROUP, group);
        Ok(true)
    }

    async fn execute(&self, ctx: &mut EventContext) -> Result<(), SentinelError> {
        let missing = |key| SentinelError::service(SERVICE_NAME, format!("context missing {key}"));
        let height = ctx.event().and_then(|log| log.block_number).unwrap_or_default();
        let token = ctx.address(KEY_TOKEN).ok_or_else(|| missing(KEY_TOKEN))?;
        let source = ctx.address(KEY_SOURCE).ok_or_else(|| missing(KEY_SOURCE))?;
        let group = ctx.text(KEY_GROUP).unwrap_or_default().to_owned();
        let tx_hash = ctx.hash(KEY_TX_HASH).ok_or_else(|| missing(KEY_TX_HASH))?;

        let content = format!(
            "block height: {height}\n\nnew contract: {token}\n\nsame bytecode as {source} ({group})\n\ntx hash: {tx_hash}"
        );
        ctx.set(NOTICE_CONTENT, content);

        self.deps()?.operator.broadcast(ctx, self).await;
        Ok(())
    }

    fn retry(&self) -> bool {
        self.retry.swap(false, Ordering::SeqCst)
    }

    async fn init(
        &self,
        config: &Config,
        status: Arc<Status>,
        operator: Operator,
    ) -> Result<(), SentinelError> {
        let srv_config: PairCreatedConfig = config.service_config(SERVICE_NAME)?;
        info!(
            groups = srv_config.tokens.len(),
            tokens = srv_config.tokens.values().map(Vec::len).sum::<usize>(),
            "configured"
        );
        self.config
            .set(srv_config)
            .map_err(|_| SentinelError::service(SERVICE_NAME, "initialized twice"))?;
        self.deps
            .set(Deps { status, operator, dingtalk_token: config.dingtalk_token.clone() })
            .map_err(|_| SentinelError::service(SERVICE_NAME, "initialized twice"))?;
        Ok(())
    }

    fn as_dingtalk_source(&self) -> Option<&dyn DingtalkSource> {
        Some(self)
    }

    fn as_log_source(&self) -> Option<&dyn LogSource> {
        Some(self)
    }
}

impl LogSource for PairCreatedListener {
    fn log_line(&self, ctx: &EventContext) -> Option<String> {
        ctx.text(NOTICE_CONTENT).map(str::to_owned)
    }
}

impl DingtalkSource for PairCreatedListener {
    fn dingtalk_message(&self, ctx: &EventContext) -> Option<DingtalkMessage> {
        let token = self.deps.get()?.dingtalk_token.clone();
        if token.is_empty() {
            return None;
        }
        let text = ctx.text(NOTICE_CONTENT)?.to_owned();
        Some(DingtalkMessage { token, title: "contract watch".to_owned(), text })
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::{B256, U256, b256};

    use super::*;
    use crate::{
        client::BytecodeCache,
        test_utils::{CaptureNotifier, MockChain, fixtures},
    };

    const WATCHED: Address = address!("55d398326f99059fF775485246999027B3197955");
    const TOKEN0: Address = address!("1111111111111111111111111111111111111111");
    const TOKEN1: Address = address!("2222222222222222222222222222222222222222");
    const PAIR: Address = address!("3333333333333333333333333333333333333333");
    const TX: B256 = b256!("11d1bd0f6ba80134a33ba9275ac585d9d315f0ad8355cddefde31afa28d0e9aa");

    const CONFIG: &str = r#"
dingtalk_token: tok-123
services:
  pair_created:
    enabled: true
    config:
      tokens:
        stablecoins:
          - "0x55d398326f99059fF775485246999027B3197955"
"#;

    async fn inited(
        chain: Arc<MockChain>,
    ) -> anyhow::Result<(PairCreatedListener, Arc<CaptureNotifier>)> {
        let config = Config::from_yaml(CONFIG)?;
        let status = Arc::new(Status { client: chain, cache: BytecodeCache::new(16) });
        let notifier = Arc::new(CaptureNotifier::new());
        let operator = Operator::new(status.clone(), vec![notifier.clone()]);

        let service = PairCreatedListener::new();
        service.init(&config, status, operator).await?;
        Ok((service, notifier))
    }

    fn pair_created_log(block: u64) -> alloy::rpc::types::Log {
        let data = PairCreated {
            token0: TOKEN0,
            token1: TOKEN1,
            pair: PAIR,
            _3: U256::from(1),
        }
        .encode_log_data();
        fixtures::log_with_data(PANCAKE_FACTORY_V2, data, block, TX)
    }

    #[test]
    fn filter_selects_the_factory_and_event() {
        let filter = PairCreatedListener::new().filter();
        assert!(filter.address.matches(&PANCAKE_FACTORY_V2));
        assert!(filter.topics[0].matches(&PairCreated::SIGNATURE_HASH));
    }

    #[test]
    fn event_signature_matches_the_deployed_factory() {
        assert_eq!(
            PairCreated::SIGNATURE_HASH,
            b256!("0d3648bd0f6ba80134a33ba9275ac585d9d315f0ad8355cddefde31afa28d0e9"),
        );
    }

    #[tokio::test]
    async fn matching_bytecode_is_flagged_and_broadcast() -> anyhow::Result<()> {
        let chain = Arc::new(MockChain::new());
        chain.set_code(WATCHED, Bytes::from_static(b"\x60\x80"));
        chain.set_code(TOKEN0, Bytes::from_static(b"\x60\x80"));
        chain.set_code(TOKEN1, Bytes::from_static(b"\xde\xad"));

        let (service, notifier) = inited(chain).await?;
        service.pre_run().await;

        let mut ctx = EventContext::new(pair_created_log(100));
        assert!(service.need_handle(&mut ctx).await?);
        assert_eq!(ctx.address(KEY_TOKEN), Some(TOKEN0));
        assert_eq!(ctx.address(KEY_SOURCE), Some(WATCHED));
        assert_eq!(ctx.text(KEY_GROUP), Some("stablecoins"));

        service.execute(&mut ctx).await?;

        let notices = notifier.notices();
        assert_eq!(notices.len(), 1);
        let content = notices[0].1.text(NOTICE_CONTENT).unwrap();
        assert!(content.contains("block height: 100"));
        assert!(content.contains(&TX.to_string()));
        assert!(content.contains("stablecoins"));
        Ok(())
    }

    #[tokio::test]
    async fn unrelated_bytecode_is_ignored() -> anyhow::Result<()> {
        let chain = Arc::new(MockChain::new());
        chain.set_code(WATCHED, Bytes::from_static(b"\x60\x80"));
        chain.set_code(TOKEN0, Bytes::from_static(b"\x01"));
        chain.set_code(TOKEN1, Bytes::from_static(b"\x02"));

        let (service, _) = inited(chain).await?;
        service.pre_run().await;

        let mut ctx = EventContext::new(pair_created_log(100));
        assert!(!service.need_handle(&mut ctx).await?);
        assert!(ctx.get(KEY_TOKEN).is_none());
        Ok(())
    }

    #[tokio::test]
    async fn bytecode_fetch_failure_requests_replay_once() -> anyhow::Result<()> {
        let chain = Arc::new(MockChain::new());
        chain.set_code(WATCHED, Bytes::from_static(b"\x60\x80"));

        let (service, _) = inited(chain.clone()).await?;
        service.pre_run().await;
        chain.fail_code_at_always();

        let mut ctx = EventContext::new(pair_created_log(100));
        assert!(service.need_handle(&mut ctx).await.is_err());

        // read-and-clear
        assert!(service.retry());
        assert!(!service.retry());
        Ok(())
    }

    #[tokio::test]
    async fn undecodable_event_is_an_error_without_replay() -> anyhow::Result<()> {
        let chain = Arc::new(MockChain::new());
        let (service, _) = inited(chain).await?;

        let mut ctx = EventContext::new(fixtures::raw_log(PANCAKE_FACTORY_V2, 100, TX));
        assert!(service.need_handle(&mut ctx).await.is_err());
        assert!(!service.retry());
        Ok(())
    }

    #[tokio::test]
    async fn pre_run_skips_tokens_it_cannot_resolve() -> anyhow::Result<()> {
        // WATCHED has no code on the mock chain, so the watch-list stays
        // empty and nothing matches
        let chain = Arc::new(MockChain::new());
        chain.set_code(TOKEN0, Bytes::from_static(b"\x60\x80"));
        chain.set_code(TOKEN1, Bytes::from_static(b"\x60\x80"));

        let (service, _) = inited(chain).await?;
        service.pre_run().await;

        let mut ctx = EventContext::new(pair_created_log(100));
        assert!(!service.need_handle(&mut ctx).await?);
        Ok(())
    }

    #[tokio::test]
    async fn dingtalk_message_carries_the_notice_content() -> anyhow::Result<()> {
        let chain = Arc::new(MockChain::new());
        let (service, _) = inited(chain).await?;

        let mut ctx = EventContext::empty();
        ctx.set(NOTICE_CONTENT, "hello");

        let message = service.dingtalk_message(&ctx).expect("token configured");
        assert_eq!(message.token, "tok-123");
        assert_eq!(message.text, "hello");
        assert_eq!(service.log_line(&ctx).as_deref(), Some("hello"));
        Ok(())
    }
}
