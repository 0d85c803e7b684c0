//! Client layer: the minimal read+subscribe surface the runtime depends on.
//!
//! [`ChainClient`] is the seam between the runtime and the chain. Three
//! implementations ship with the crate:
//!
//! * [`NodeClient`]: a live connection over an Alloy provider.
//! * [`ResilientClient`]: wraps any client, adding a bytecode LRU cache and
//!   exponential-backoff retry for `code_at`.
//! * [`ReplayClient`]: a deterministic test double that advances a virtual
//!   block number on demand and fans historical logs/headers out to whatever
//!   is currently subscribed.

pub mod node;
pub mod replay;
pub mod resilient;

use std::{
    num::NonZeroUsize,
    sync::{Arc, Mutex},
};

use alloy::{
    primitives::{Address, Bytes},
    rpc::types::{Block, Filter, Header, Log},
};
use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::mpsc;

pub use node::NodeClient;
pub use replay::ReplayClient;
pub use resilient::ResilientClient;

use crate::ClientError;

/// Buffer capacity for subscription channels.
pub const DEFAULT_SUBSCRIPTION_BUFFER: usize = 128;

/// A live filtered-log subscription.
///
/// Mirrors the `(log channel, error channel)` pair of a raw node
/// subscription: logs arrive on `logs`, transport-level failures on
/// `errors`. Dropping the struct unsubscribes.
pub struct LogSubscription {
    pub logs: mpsc::Receiver<Log>,
    pub errors: mpsc::Receiver<ClientError>,
}

/// A live new-header subscription. Same contract as [`LogSubscription`].
pub struct HeaderSubscription {
    pub headers: mpsc::Receiver<Header>,
    pub errors: mpsc::Receiver<ClientError>,
}

/// The read+subscribe contract consumed by the runtime and by services.
///
/// Deliberately not a full chain RPC surface: only the calls the sentinel
/// actually issues. Reads taking an `Option<u64>` block number treat `None`
/// as "latest".
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Contract bytecode at `address`.
    async fn code_at(&self, address: Address, block: Option<u64>) -> Result<Bytes, ClientError>;

    /// Current chain head number.
    async fn block_number(&self) -> Result<u64, ClientError>;

    /// Header at the given height (`None` = latest).
    async fn header_by_number(&self, number: Option<u64>) -> Result<Header, ClientError>;

    /// Block at the given height (`None` = latest).
    async fn block_by_number(&self, number: Option<u64>) -> Result<Block, ClientError>;

    /// One-shot log query.
    async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>, ClientError>;

    /// Read-only contract call (`eth_call`) against the latest block.
    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, ClientError>;

    /// Subscribe to logs matching `filter`.
    async fn subscribe_logs(&self, filter: &Filter) -> Result<LogSubscription, ClientError>;

    /// Subscribe to new block headers.
    async fn subscribe_headers(&self) -> Result<HeaderSubscription, ClientError>;
}

const FALLBACK_CACHE_CAPACITY: NonZeroUsize = NonZeroUsize::new(crate::config::DEFAULT_CACHE_SIZE)
    .expect("default cache size is non-zero");

/// Shared, internally synchronized bytecode cache keyed by contract address.
///
/// Entries are never invalidated: on-chain bytecode is immutable, so
/// staleness is not a concern. Cloning yields another handle to the same
/// cache.
#[derive(Clone)]
pub struct BytecodeCache {
    inner: Arc<Mutex<LruCache<Address, Bytes>>>,
}

impl BytecodeCache {
    /// Create a cache holding up to `capacity` entries. A zero capacity
    /// falls back to the default size.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(FALLBACK_CACHE_CAPACITY);
        Self { inner: Arc::new(Mutex::new(LruCache::new(capacity))) }
    }

    #[must_use]
    pub fn get(&self, address: &Address) -> Option<Bytes> {
        let mut cache = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        cache.get(address).cloned()
    }

    pub fn put(&self, address: Address, code: Bytes) {
        let mut cache = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        cache.put(address, code);
    }

    /// Drop every cached entry.
    pub fn purge(&self) {
        let mut cache = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        cache.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        let cache = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        cache.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for BytecodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BytecodeCache").field("len", &self.len()).finish()
    }
}
