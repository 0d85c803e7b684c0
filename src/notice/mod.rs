//! Notice delivery: pluggable notifiers invoked by
//! [`Operator::broadcast`](crate::Operator::broadcast).
//!
//! A notifier checks whether the originating service exposes the capability
//! it needs (via the explicit `as_*_source` casts on
//! [`Service`](crate::Service)) and silently no-ops otherwise. Notifier
//! failures are logged by the operator, never propagated to the runtime.

pub mod dingtalk;
pub mod log;

use async_trait::async_trait;

pub use dingtalk::{DingtalkMessage, DingtalkNotifier};
pub use log::LogNotifier;

use crate::{EventContext, SentinelError, Service};

/// Delivers a broadcast to a human-facing channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver a notice for `ctx`, originating from `srv`. Implementations
    /// return `Ok(())` when the service lacks the required capability.
    async fn notify(&self, ctx: &EventContext, srv: &dyn Service) -> Result<(), SentinelError>;
}

/// Capability: a service that can render a log line for the log notifier.
pub trait LogSource: Send + Sync {
    /// The line to log, or `None` when this dispatch produced nothing.
    fn log_line(&self, ctx: &EventContext) -> Option<String>;
}

/// Capability: a service that can produce a DingTalk robot message.
pub trait DingtalkSource: Send + Sync {
    fn dingtalk_message(&self, ctx: &EventContext) -> Option<DingtalkMessage>;
}
