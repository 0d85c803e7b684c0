use std::{collections::HashMap, sync::Arc};

use alloy::{
    primitives::{Address, Bytes},
    rpc::types::Filter,
};
use async_trait::async_trait;
use tracing::warn;

use crate::{
    ClientError, Config, EventContext, SentinelError,
    client::{BytecodeCache, ChainClient},
    notice::{DingtalkSource, LogSource, Notifier},
};

/// Shared dependencies handed to every service at `init` time.
///
/// Written once during runtime startup and read concurrently afterwards;
/// the cache synchronizes itself, so no further locking is needed.
pub struct Status {
    pub client: Arc<dyn ChainClient>,
    pub cache: BytecodeCache,
}

/// A pluggable unit of work: declares what to subscribe to, decides whether
/// an event is relevant, acts on it, and declares whether a failed event
/// should be replayed on restart.
///
/// A service is constructed once at process start, `init`-ed exactly once,
/// then run repeatedly (one subscription attempt per failover cycle) until
/// shutdown. Dispatch for a single service is strictly sequential, so
/// implementations never see two concurrent `need_handle`/`execute` calls.
#[async_trait]
pub trait Service: Send + Sync {
    /// Unique, stable identifier; used as the registry key.
    fn name(&self) -> &str;

    /// Address/topic selector for the subscription.
    fn filter(&self) -> Filter;

    /// Called once before each (re)subscription starts dispatching.
    /// Side-effect only: re-derive any cached precondition data here.
    async fn pre_run(&self) {}

    /// Decision phase. May stash derived facts in the context for
    /// `execute`. An error signals a transient failure requiring failover.
    async fn need_handle(&self, ctx: &mut EventContext) -> Result<bool, SentinelError>;

    /// Action phase. An error signals a failure requiring failover.
    async fn execute(&self, ctx: &mut EventContext) -> Result<(), SentinelError>;

    /// Read-and-clear flag: whether the most recent failure should be
    /// replayed once on restart. The default policy never replays.
    fn retry(&self) -> bool {
        false
    }

    /// Called once at startup with the shared dependencies.
    async fn init(
        &self,
        config: &Config,
        status: Arc<Status>,
        operator: Operator,
    ) -> Result<(), SentinelError>;

    /// Capability cast for the DingTalk notifier. `None` means the service
    /// has nothing to say over DingTalk and the notifier skips it.
    fn as_dingtalk_source(&self) -> Option<&dyn DingtalkSource> {
        None
    }

    /// Capability cast for the log notifier.
    fn as_log_source(&self) -> Option<&dyn LogSource> {
        None
    }
}

/// Handle services use to reach shared infrastructure: chain reads through
/// the shared client and broadcasting to the registered notifiers.
#[derive(Clone)]
pub struct Operator {
    status: Arc<Status>,
    notifiers: Arc<[Arc<dyn Notifier>]>,
}

impl Operator {
    pub(crate) fn new(status: Arc<Status>, notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        Self { status, notifiers: notifiers.into() }
    }

    /// Bytecode of `address` at the latest block, through the shared client
    /// (cached and retried when the client is a `ResilientClient`).
    pub async fn byte_code(&self, address: Address) -> Result<Bytes, ClientError> {
        self.status.client.code_at(address, None).await
    }

    /// Invoke every registered notifier with the context and originating
    /// service. Notifier failures are logged and never propagated.
    pub async fn broadcast(&self, ctx: &EventContext, srv: &dyn Service) {
        for notifier in self.notifiers.iter() {
            if let Err(err) = notifier.notify(ctx, srv).await {
                warn!(
                    notifier = notifier.name(),
                    service = srv.name(),
                    error = %err,
                    "notifier failed"
                );
            }
        }
    }
}

/// Explicit registry of services and notifiers, built by the caller and
/// handed to the runtime at startup.
#[derive(Default)]
pub struct Registry {
    services: HashMap<String, Arc<dyn Service>>,
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service.
    ///
    /// # Errors
    ///
    /// Returns [`SentinelError::DuplicateService`] when a service with the
    /// same name is already registered.
    pub fn register_service(&mut self, service: Arc<dyn Service>) -> Result<(), SentinelError> {
        let name = service.name().to_owned();
        if self.services.contains_key(&name) {
            return Err(SentinelError::DuplicateService(name));
        }
        self.services.insert(name, service);
        Ok(())
    }

    pub fn register_notifier(&mut self, notifier: Arc<dyn Notifier>) {
        self.notifiers.push(notifier);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub(crate) fn into_parts(self) -> (HashMap<String, Arc<dyn Service>>, Vec<Arc<dyn Notifier>>) {
        (self.services, self.notifiers)
    }
}
