//! Event Sentinel watches an EVM chain over a WebSocket subscription and
//! runs pluggable services against the logs as they arrive.
//!
//! The main entry point is [`Runtime`]: build a [`Registry`] of services and
//! notifiers, hand it to [`Runtime::connect`] together with a [`Config`],
//! and call [`Runtime::run`].
//!
//! # Services
//!
//! A [`Service`] declares a log [`Filter`][alloy::rpc::types::Filter],
//! decides per event whether to act (`need_handle`), acts (`execute`), and
//! opts into replay-on-restart via its `retry` flag. Dispatch is strictly
//! sequential per service; distinct services run concurrently with no
//! cross-service ordering guarantee.
//!
//! # Failure handling
//!
//! Startup connects once and fails hard. After that, every failure (a
//! broken subscription, a service error) flows through a failover queue
//! whose consumer restarts the affected service after a short delay,
//! replaying the failed event when the service asks for it. See the
//! [`runtime`] module docs for the per-service state machine.
//!
//! # Clients
//!
//! Chain access goes through the [`ChainClient`] trait. [`NodeClient`] is
//! the live implementation; [`ResilientClient`] layers a bytecode cache and
//! read retries on top; [`ReplayClient`] replays historical blocks
//! deterministically for tests and backfills.

pub mod client;
pub mod config;
pub mod context;
pub mod notice;
pub mod runtime;
pub mod service;
pub mod services;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

mod error;

pub use client::{
    BytecodeCache, ChainClient, HeaderSubscription, LogSubscription, NodeClient, ReplayClient,
    ResilientClient,
};
pub use config::{Config, ServiceConfig};
pub use context::{ContextValue, EventContext, NOTICE_CONTENT};
pub use error::{ClientError, SentinelError};
pub use notice::{DingtalkMessage, DingtalkNotifier, DingtalkSource, LogNotifier, LogSource, Notifier};
pub use runtime::{DEFAULT_RESTART_DELAY, Runtime};
pub use service::{Operator, Registry, Service, Status};
