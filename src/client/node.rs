use alloy::{
    eips::{BlockId, BlockNumberOrTag},
    primitives::{Address, Bytes},
    providers::{Provider, ProviderBuilder, RootProvider},
    rpc::types::{Block, Filter, Header, Log, TransactionInput, TransactionRequest},
};
use async_trait::async_trait;
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tracing::{info, warn};

use crate::{
    ClientError,
    client::{ChainClient, DEFAULT_SUBSCRIPTION_BUFFER, HeaderSubscription, LogSubscription},
};

/// Live chain client backed by an Alloy provider.
///
/// Subscriptions are bridged onto bounded mpsc channels by a forwarder task
/// per subscription; when the underlying pubsub stream closes, the forwarder
/// reports [`ClientError::SubscriptionClosed`] on the error channel and
/// exits.
#[derive(Clone, Debug)]
pub struct NodeClient {
    provider: RootProvider,
}

impl NodeClient {
    /// Connect to a node at `url`. Subscriptions require a pubsub
    /// transport, so this is typically a `ws://`/`wss://` endpoint.
    ///
    /// # Errors
    ///
    /// Returns the transport error when the connection cannot be
    /// established. This is the only failure that aborts the runtime at
    /// startup.
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        info!(url, "connecting to node");
        let provider = ProviderBuilder::new().connect(url).await?;
        Ok(Self { provider: provider.root().clone() })
    }

    /// Wrap an already-connected provider.
    #[must_use]
    pub fn from_provider(provider: RootProvider) -> Self {
        Self { provider }
    }

    fn block_tag(number: Option<u64>) -> BlockNumberOrTag {
        number.map_or(BlockNumberOrTag::Latest, BlockNumberOrTag::Number)
    }
}

#[async_trait]
impl ChainClient for NodeClient {
    async fn code_at(&self, address: Address, block: Option<u64>) -> Result<Bytes, ClientError> {
        let request = self.provider.get_code_at(address);
        let code = match block {
            Some(number) => request.block_id(BlockId::number(number)).await?,
            None => request.await?,
        };
        Ok(code)
    }

    async fn block_number(&self) -> Result<u64, ClientError> {
        Ok(self.provider.get_block_number().await?)
    }

    async fn header_by_number(&self, number: Option<u64>) -> Result<Header, ClientError> {
        let tag = Self::block_tag(number);
        let block = self.provider.get_block_by_number(tag).await?;
        block.map(|b| b.header).ok_or(ClientError::BlockNotFound(number.unwrap_or_default()))
    }

    async fn block_by_number(&self, number: Option<u64>) -> Result<Block, ClientError> {
        let tag = Self::block_tag(number);
        let block = self.provider.get_block_by_number(tag).await?;
        block.ok_or(ClientError::BlockNotFound(number.unwrap_or_default()))
    }

    async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>, ClientError> {
        Ok(self.provider.get_logs(filter).await?)
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, ClientError> {
        let request =
            TransactionRequest::default().to(to).input(TransactionInput::new(data));
        Ok(self.provider.call(request).await?)
    }

    async fn subscribe_logs(&self, filter: &Filter) -> Result<LogSubscription, ClientError> {
        let mut subscription = self.provider.subscribe_logs(filter).await?;
        let (log_tx, log_rx) = mpsc::channel(DEFAULT_SUBSCRIPTION_BUFFER);
        let (err_tx, err_rx) = mpsc::channel(1);

        tokio::spawn(async move {
            loop {
                match subscription.recv().await {
                    Ok(log) => {
                        if log_tx.send(log).await.is_err() {
                            // subscriber dropped the receiver, unsubscribe
                            return;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "log subscription lagged");
                    }
                    Err(RecvError::Closed) => {
                        let _ = err_tx.send(ClientError::SubscriptionClosed).await;
                        return;
                    }
                }
            }
        });

        Ok(LogSubscription { logs: log_rx, errors: err_rx })
    }

    async fn subscribe_headers(&self) -> Result<HeaderSubscription, ClientError> {
        let mut subscription = self.provider.subscribe_blocks().await?;
        let (header_tx, header_rx) = mpsc::channel(DEFAULT_SUBSCRIPTION_BUFFER);
        let (err_tx, err_rx) = mpsc::channel(1);

        tokio::spawn(async move {
            loop {
                match subscription.recv().await {
                    Ok(header) => {
                        if header_tx.send(header).await.is_err() {
                            return;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "header subscription lagged");
                    }
                    Err(RecvError::Closed) => {
                        let _ = err_tx.send(ClientError::SubscriptionClosed).await;
                        return;
                    }
                }
            }
        });

        Ok(HeaderSubscription { headers: header_rx, errors: err_rx })
    }
}
