//! Watches ERC-20 `Transfer` events into configured wallets and broadcasts
//! a notice when the transferred value, expressed in USDT, crosses a
//! configured threshold. Non-USDT amounts are quoted through the
//! PancakeSwap router before comparison.

use std::sync::{
    Arc, OnceLock,
    atomic::{AtomicBool, Ordering},
};

use alloy::{
    primitives::{Address, B256, U256, address},
    rpc::types::Filter,
    sol,
    sol_types::{SolCall, SolEvent},
};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::{
    Config, EventContext, NOTICE_CONTENT, SentinelError,
    notice::{DingtalkMessage, DingtalkSource, LogSource},
    service::{Operator, Service, Status},
};

sol! {
    event Transfer(address indexed from, address indexed to, uint256 value);

    function getAmountsOut(uint256 amountIn, address[] path)
        external view returns (uint256[] amounts);
}

/// USDT (BSC-pegged) on BSC mainnet.
pub const USDT: Address = address!("55d398326f99059fF775485246999027B3197955");
/// Wrapped BNB on BSC mainnet.
pub const WBNB: Address = address!("bb4CdB9CBd36B01bD1cBaEBF2De08d9173bc095c");
/// PancakeSwap V2 router on BSC mainnet.
pub const PANCAKE_ROUTER_V2: Address = address!("10ED43C718714eb63d5aA57B78B54704E256024E");

const SERVICE_NAME: &str = "transfer";
const USDT_DECIMALS: u8 = 18;

/// Lookback window for the relevant-token search, roughly a month of BSC
/// blocks.
const RELEVANT_WINDOW_BLOCKS: u64 = 3 * 20 * 24 * 30;

/// Token symbols containing any of these are left out of the relevant-token
/// list; they are wrapped/stable/LP noise, not a counterparty's holdings.
const BLOCKED_KEYWORDS: &[&str] = &["usd", "bnb", "cake-lp", "claim", "rewards"];

// context keys carrying the match from the decision to the action phase
const KEY_TX_HASH: &str = "tx_hash";
const KEY_FROM: &str = "from";
const KEY_TO: &str = "to";
const KEY_AMOUNT: &str = "amount";

/// `services.transfer.config` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransferConfig {
    /// Wallets whose incoming transfers are watched.
    #[serde(default)]
    pub wallets: Vec<Address>,
    /// Minimum transfer value in whole USDT.
    #[serde(default)]
    pub threshold_value: u64,
}

/// One historical ERC-20 transfer of a wallet, as reported by an explorer.
#[derive(Debug, Clone)]
pub struct TokenTransfer {
    pub contract: Address,
    pub symbol: String,
}

/// Looks up which tokens a wallet has recently moved, used to annotate a
/// transfer notice with the sender's other holdings.
#[async_trait]
pub trait TokenHistory: Send + Sync {
    async fn recent_tokens(
        &self,
        wallet: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TokenTransfer>, SentinelError>;
}

/// BscScan explorer endpoint for the token-transfer history query.
pub const BSCSCAN_URL: &str = "https://api.bscscan.com/api";

/// [`TokenHistory`] backed by the BscScan `account/tokentx` API.
#[derive(Debug, Clone)]
pub struct BscScanClient {
    http: reqwest::Client,
    url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct TokenTxReply {
    status: String,
    #[serde(default)]
    result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct TokenTx {
    #[serde(rename = "contractAddress")]
    contract_address: Address,
    #[serde(rename = "tokenSymbol")]
    token_symbol: String,
}

impl BscScanClient {
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self { http: reqwest::Client::new(), url: BSCSCAN_URL.to_owned(), api_key: api_key.into() }
    }

    /// Override the API endpoint, for tests against a local server.
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

#[async_trait]
impl TokenHistory for BscScanClient {
    async fn recent_tokens(
        &self,
        wallet: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TokenTransfer>, SentinelError> {
        let lookup = |err: reqwest::Error| SentinelError::service("bscscan", err);
        let address = wallet.to_string();
        let start = from_block.to_string();
        let end = to_block.to_string();
        let reply: TokenTxReply = self
            .http
            .get(&self.url)
            .query(&[
                ("module", "account"),
                ("action", "tokentx"),
                ("address", address.as_str()),
                ("startblock", start.as_str()),
                ("endblock", end.as_str()),
                ("page", "1"),
                ("offset", "30"),
                ("sort", "desc"),
                ("apikey", self.api_key.as_str()),
            ])
            .send()
            .await
            .map_err(lookup)?
            .json()
            .await
            .map_err(lookup)?;

        // status "0" covers both errors and "no transactions found"
        if reply.status != "1" {
            return Ok(Vec::new());
        }
        let txs: Vec<TokenTx> = serde_json::from_value(reply.result)
            .map_err(|err| SentinelError::service("bscscan", err))?;
        Ok(txs
            .into_iter()
            .map(|tx| TokenTransfer { contract: tx.contract_address, symbol: tx.token_symbol })
            .collect())
    }
}

struct Deps {
    status: Arc<Status>,
    operator: Operator,
    dingtalk_token: String,
}

pub struct TransferListener {
    deps: OnceLock<Deps>,
    config: OnceLock<TransferConfig>,
    history: Option<Arc<dyn TokenHistory>>,
    retry: AtomicBool,
}

impl Default for TransferListener {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferListener {
    #[must_use]
    pub fn new() -> Self {
        Self {
            deps: OnceLock::new(),
            config: OnceLock::new(),
            history: None,
            retry: AtomicBool::new(false),
        }
    }

    /// Attach a relevant-token lookup; without one, notices omit the
    /// sender's other holdings.
    #[must_use]
    pub fn with_history(mut self, history: Arc<dyn TokenHistory>) -> Self {
        self.history = Some(history);
        self
    }

    fn deps(&self) -> Result<&Deps, SentinelError> {
        self.deps.get().ok_or_else(|| SentinelError::service(SERVICE_NAME, "not initialized"))
    }

    /// Render an 18-decimal token amount with two fractional digits.
    fn format_usdt(value: U256) -> String {
        let unit = U256::from(10u64).pow(U256::from(USDT_DECIMALS));
        let whole = value / unit;
        // always below 100, so the narrowing cannot fail
        let cents: u64 = ((value % unit) / (unit / U256::from(100u64))).to();
        format!("{whole}.{cents:02}")
    }

    /// Quote `value` of `token` in USDT through the PancakeSwap router.
    async fn quote_usdt(&self, token: Address, value: U256) -> Result<U256, SentinelError> {
        let deps = self.deps()?;
        let data = getAmountsOutCall { amountIn: value, path: vec![token, USDT] }.abi_encode();
        let ret = deps
            .status
            .client
            .call(PANCAKE_ROUTER_V2, data.into())
            .await
            .inspect_err(|err| {
                error!(%token, error = %err, "router quote failed");
                self.retry.store(true, Ordering::SeqCst);
            })?;
        let amounts = getAmountsOutCall::abi_decode_returns(&ret)?;
        amounts
            .last()
            .copied()
            .ok_or_else(|| SentinelError::service(SERVICE_NAME, "router returned no amounts"))
    }

    async fn relevant_tokens(&self, wallet: Address) -> Vec<TokenTransfer> {
        let Some(history) = &self.history else {
            return Vec::new();
        };
        let Ok(deps) = self.deps() else {
            return Vec::new();
        };
        let head = match deps.status.client.block_number().await {
            Ok(head) => head,
            Err(err) => {
                warn!(error = %err, "block number fetch failed, skipping relevant tokens");
                return Vec::new();
            }
        };
        let from_block = head.saturating_sub(RELEVANT_WINDOW_BLOCKS);
        match history.recent_tokens(wallet, from_block, head).await {
            Ok(tokens) => tokens
                .into_iter()
                .filter(|t| {
                    let symbol = t.symbol.to_lowercase();
                    !BLOCKED_KEYWORDS.iter().any(|word| symbol.contains(word))
                })
                .collect(),
            Err(err) => {
                warn!(%wallet, error = %err, "relevant token lookup failed");
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl Service for TransferListener {
    fn name(&self) -> &str {
        SERVICE_NAME
    }

    fn filter(&self) -> Filter {
        let filter = Filter::new()
            .address(vec![WBNB, USDT])
            .event_signature(Transfer::SIGNATURE_HASH);
        match self.config.get() {
            Some(config) if !config.wallets.is_empty() => {
                let recipients: Vec<B256> =
                    config.wallets.iter().map(|w| w.into_word()).collect();
                filter.topic2(recipients)
            }
            _ => filter,
        }
    }

    async fn need_handle(&self, ctx: &mut EventContext) -> Result<bool, SentinelError> {
        let Some(log) = ctx.event() else {
            return Ok(false);
        };
        let token = log.address();
        let tx_hash = log.transaction_hash.unwrap_or_default();
        let transfer = Transfer::decode_log_data(log.data())?;

        let usdt_value = if token == USDT {
            transfer.value
        } else {
            self.quote_usdt(token, transfer.value).await?
        };

        let config = self.config.get().cloned().unwrap_or_default();
        let floor =
            U256::from(config.threshold_value) * U256::from(10u64).pow(U256::from(USDT_DECIMALS));
        if usdt_value < floor {
            return Ok(false);
        }

        ctx.set(KEY_TX_HASH, tx_hash);
        ctx.set(KEY_FROM, transfer.from);
        ctx.set(KEY_TO, transfer.to);
        ctx.set(KEY_AMOUNT, Self::format_usdt(usdt_value));
        Ok(true)
    }

    async fn execute(&self, ctx: &mut EventContext) -> Result<(), SentinelError> {
        let missing = |key| SentinelError::service(SERVICE_NAME, format!("context missing {key}"));
        let tx_hash = ctx.hash(KEY_TX_HASH).ok_or_else(|| missing(KEY_TX_HASH))?;
        let from = ctx.address(KEY_FROM).ok_or_else(|| missing(KEY_FROM))?;
        let to = ctx.address(KEY_TO).ok_or_else(|| missing(KEY_TO))?;
        let amount = ctx.text(KEY_AMOUNT).ok_or_else(|| missing(KEY_AMOUNT))?.to_owned();

        let mut content = format!(
            "tx hash: {tx_hash}\n\nfrom: {from}\n\nto: {to}\n\namount: {amount} USDT"
        );
        let tokens = self.relevant_tokens(from).await;
        if !tokens.is_empty() {
            content.push_str("\n\nrelevant tokens:");
            for token in tokens {
                content.push_str(&format!("\n- {} ({})", token.symbol, token.contract));
            }
        }
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
        let srv_config: TransferConfig = config.service_config(SERVICE_NAME)?;
        info!(
            wallets = srv_config.wallets.len(),
            threshold = srv_config.threshold_value,
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

impl LogSource for TransferListener {
    fn log_line(&self, ctx: &EventContext) -> Option<String> {
        ctx.text(NOTICE_CONTENT).map(str::to_owned)
    }
}

impl DingtalkSource for TransferListener {
    fn dingtalk_message(&self, ctx: &EventContext) -> Option<DingtalkMessage> {
        let token = self.deps.get()?.dingtalk_token.clone();
        if token.is_empty() {
            return None;
        }
        let text = ctx.text(NOTICE_CONTENT)?.to_owned();
        let amount = ctx.text(KEY_AMOUNT).unwrap_or_default();
        Some(DingtalkMessage { token, title: format!("transfer captured: {amount} USDT"), text })
    }
}
