//! The event-subscription runtime.
//!
//! One long-running task per registered [`Service`] owns that service's
//! filtered-log subscription and dispatches incoming events through the
//! `need_handle`/`execute` pipeline in arrival order. Any failure (the
//! subscription breaking, a decision error, an action error) enqueues a
//! [`FailoverRequest`] consumed by a single coordinator task that restarts
//! the service, optionally replaying the failed event first.
//!
//! Per-service state machine: Starting -> Subscribed -> Dispatching ->
//! Failed, with Failed -> Starting driven by the failover consumer. There is no
//! terminal state during normal operation; the runtime runs until its
//! cancellation token fires.

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{error, info, warn};

use crate::{
    ClientError, Config, EventContext, SentinelError,
    client::{BytecodeCache, ChainClient, NodeClient, ResilientClient},
    service::{Operator, Registry, Service, Status},
};

/// Delay between a failover request being dequeued and the service restart,
/// so a service that fails instantly on every restart cannot busy-loop the
/// node. Distinct from the resilient client's read-retry backoff.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(1);

/// Capacity of the failover queue. Each in-flight request represents one
/// failed service, so this only fills up if restarts fail faster than the
/// consumer drains them.
const FAILOVER_QUEUE_CAPACITY: usize = 64;

/// A request to restart one service's subscription, optionally replaying
/// the event whose dispatch failed.
struct FailoverRequest {
    service: String,
    event: Option<EventContext>,
}

impl FailoverRequest {
    fn without_event(service: &str) -> Self {
        Self { service: service.to_owned(), event: None }
    }

    fn with_event(service: &str, event: EventContext) -> Self {
        Self { service: service.to_owned(), event: Some(event) }
    }
}

/// Everything the spawned tasks need, shared behind one `Arc`.
struct Shared {
    services: HashMap<String, Arc<dyn Service>>,
    client: Arc<dyn ChainClient>,
    operator: Operator,
    failover_tx: mpsc::Sender<FailoverRequest>,
    cancel: CancellationToken,
    restart_delay: Duration,
    tracker: TaskTracker,
}

/// Runs every registered service concurrently, keeps each one's
/// subscription alive, and recovers from failure without operator
/// intervention.
pub struct Runtime {
    config: Config,
    status: Arc<Status>,
    services: HashMap<String, Arc<dyn Service>>,
    client: Arc<dyn ChainClient>,
    operator: Operator,
    cancel: CancellationToken,
    restart_delay: Duration,
}

impl Runtime {
    /// Dial the node named in the config, wrap it in a
    /// [`ResilientClient`], and assemble the runtime.
    ///
    /// # Errors
    ///
    /// Failure to establish this first connection is the only startup
    /// error that aborts the runtime entirely.
    pub async fn connect(config: Config, registry: Registry) -> Result<Self, SentinelError> {
        let node = NodeClient::connect(&config.node_address).await?;
        let client = ResilientClient::with_cache_size(Arc::new(node), config.cache_size);
        Ok(Self::with_client(config, registry, Arc::new(client)))
    }

    /// Assemble the runtime over an existing client, such as a
    /// [`ReplayClient`](crate::ReplayClient) in tests.
    #[must_use]
    pub fn with_client(
        config: Config,
        registry: Registry,
        client: Arc<dyn ChainClient>,
    ) -> Self {
        let (services, notifiers) = registry.into_parts();
        let status =
            Arc::new(Status { client: client.clone(), cache: BytecodeCache::new(config.cache_size) });
        let operator = Operator::new(status.clone(), notifiers);

        Self {
            config,
            status,
            services,
            client,
            operator,
            cancel: CancellationToken::new(),
            restart_delay: DEFAULT_RESTART_DELAY,
        }
    }

    /// Override the delay between service restarts.
    #[must_use]
    pub fn restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    /// Token cancelling the whole runtime; hand a clone to a signal
    /// handler.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Handle to the shared status (client + cache) the services were
    /// initialized with.
    #[must_use]
    pub fn status(&self) -> Arc<Status> {
        self.status.clone()
    }

    /// Initialize every service, start the failover consumer and one
    /// subscription loop per service, then block until the cancellation
    /// token fires and all tasks have wound down. In-flight `execute`
    /// calls finish; no new dispatch starts once cancellation is observed.
    ///
    /// # Errors
    ///
    /// Returns the first service `init` failure; nothing after startup is
    /// fatal.
    pub async fn run(self) -> Result<(), SentinelError> {
        let Self { config, status, services, client, operator, cancel, restart_delay } = self;

        let (failover_tx, failover_rx) = mpsc::channel(FAILOVER_QUEUE_CAPACITY);
        let shared = Arc::new(Shared {
            services,
            client,
            operator,
            failover_tx,
            cancel,
            restart_delay,
            tracker: TaskTracker::new(),
        });

        for service in shared.services.values() {
            service.init(&config, status.clone(), shared.operator.clone()).await.map_err(
                |err| {
                    error!(service = service.name(), error = %err, "service init failed");
                    err
                },
            )?;
        }

        shared.tracker.spawn(failover_loop(shared.clone(), failover_rx));

        for service in shared.services.values() {
            spawn_service_loop(shared.clone(), service.clone(), None);
        }
        info!(services = shared.services.len(), "runtime running");

        shared.cancel.cancelled().await;
        info!("runtime shutting down");

        shared.tracker.close();
        shared.tracker.wait().await;
        Ok(())
    }
}

/// Single coordinator consuming the failover queue. Requests are processed
/// serially (one restart decision at a time), but each restarted service
/// loop runs as its own task, concurrently with already-running services.
async fn failover_loop(shared: Arc<Shared>, mut requests: mpsc::Receiver<FailoverRequest>) {
    loop {
        let request = tokio::select! {
            () = shared.cancel.cancelled() => return,
            request = requests.recv() => match request {
                Some(request) => request,
                None => return,
            },
        };

        let Some(service) = shared.services.get(&request.service).cloned() else {
            warn!(service = request.service, "failover request for unknown service");
            continue;
        };

        // read-and-clear: at most one automatic replay per failure cycle
        let replay = if service.retry() { request.event } else { None };
        if replay.is_some() {
            info!(service = service.name(), "replaying failed event on restart");
        }

        tokio::select! {
            () = shared.cancel.cancelled() => return,
            () = tokio::time::sleep(shared.restart_delay) => {}
        }

        info!(service = service.name(), "restarting service");
        spawn_service_loop(shared.clone(), service, replay);
    }
}

fn spawn_service_loop(
    shared: Arc<Shared>,
    service: Arc<dyn Service>,
    replay: Option<EventContext>,
) {
    shared.tracker.clone().spawn(service_loop(shared, service, replay));
}

/// One subscription cycle for one service: subscribe, run the `pre_run`
/// hook, optionally replay a failed event, then dispatch incoming logs in
/// arrival order until an error or cancellation ends the cycle.
async fn service_loop(shared: Arc<Shared>, service: Arc<dyn Service>, replay: Option<EventContext>) {
    let name = service.name().to_owned();
    if shared.cancel.is_cancelled() {
        return;
    }

    let filter = service.filter();
    let mut subscription = match shared.client.subscribe_logs(&filter).await {
        Ok(subscription) => subscription,
        Err(err) => {
            warn!(service = name, error = %err, "subscribe failed");
            enqueue_failover(&shared, FailoverRequest::without_event(&name)).await;
            return;
        }
    };

    service.pre_run().await;
    info!(service = name, "service running");

    // a replayed event is dispatched before anything from the new
    // subscription
    if let Some(ctx) = replay
        && dispatch(&shared, service.as_ref(), ctx).await == Dispatch::Failed
    {
        return;
    }

    loop {
        tokio::select! {
            () = shared.cancel.cancelled() => return,
            err = subscription.errors.recv() => {
                let err = err.unwrap_or(ClientError::SubscriptionClosed);
                warn!(service = name, error = %err, "subscription error, restarting");
                enqueue_failover(&shared, FailoverRequest::without_event(&name)).await;
                return;
            }
            log = subscription.logs.recv() => {
                let Some(log) = log else {
                    warn!(service = name, "log channel closed, restarting");
                    enqueue_failover(&shared, FailoverRequest::without_event(&name)).await;
                    return;
                };
                let ctx = EventContext::new(log);
                if dispatch(&shared, service.as_ref(), ctx).await == Dispatch::Failed {
                    return;
                }
            }
        }
    }
}

#[derive(PartialEq)]
enum Dispatch {
    Handled,
    Failed,
}

/// Run one event through the decision and action phases. A decision error
/// short-circuits (no `execute` call); either error enqueues a failover
/// request carrying the context so the retry policy can replay it.
async fn dispatch(shared: &Shared, service: &dyn Service, mut ctx: EventContext) -> Dispatch {
    let handle = match service.need_handle(&mut ctx).await {
        Ok(handle) => handle,
        Err(err) => {
            error!(service = service.name(), error = %err, "need_handle failed");
            enqueue_failover(shared, FailoverRequest::with_event(service.name(), ctx)).await;
            return Dispatch::Failed;
        }
    };
    if !handle {
        return Dispatch::Handled;
    }

    if let Err(err) = service.execute(&mut ctx).await {
        error!(service = service.name(), error = %err, "execute failed");
        enqueue_failover(shared, FailoverRequest::with_event(service.name(), ctx)).await;
        return Dispatch::Failed;
    }
    Dispatch::Handled
}

async fn enqueue_failover(shared: &Shared, request: FailoverRequest) {
    if shared.failover_tx.send(request).await.is_err() {
        // only happens once the consumer has exited during shutdown
        warn!("failover queue closed, dropping restart request");
    }
}
