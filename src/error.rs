use std::sync::Arc;

use alloy::transports::{RpcError, TransportErrorKind};
use thiserror::Error;

/// Errors surfaced by the client layer.
///
/// `ClientError` values are clonable so a single subscription failure can be
/// delivered to every interested party (error channel, failover queue, logs).
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    /// The underlying RPC transport returned an error.
    #[error("RPC error: {0}")]
    Rpc(Arc<RpcError<TransportErrorKind>>),

    /// A requested block could not be retrieved.
    #[error("block {0} not found")]
    BlockNotFound(u64),

    /// A subscription ended (for example, the underlying WebSocket closed).
    #[error("subscription closed")]
    SubscriptionClosed,
}

impl From<RpcError<TransportErrorKind>> for ClientError {
    fn from(error: RpcError<TransportErrorKind>) -> Self {
        ClientError::Rpc(Arc::new(error))
    }
}

/// Top-level error type for the sentinel runtime and its collaborators.
#[derive(Error, Debug)]
pub enum SentinelError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("config read failed: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("config parse failed: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    #[error("no config file found (looked for {0})")]
    ConfigMissing(String),

    #[error("event decode failed: {0}")]
    Decode(#[from] alloy::sol_types::Error),

    #[error("duplicate service name: {0}")]
    DuplicateService(String),

    #[error("service {service} failed: {reason}")]
    Service { service: String, reason: String },

    #[error("notice delivery failed: {0}")]
    Notice(String),
}

impl SentinelError {
    /// Shorthand for a service-scoped failure.
    pub fn service(service: impl Into<String>, reason: impl ToString) -> Self {
        SentinelError::Service { service: service.into(), reason: reason.to_string() }
    }
}
