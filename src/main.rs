//! Sentinel binary: load the YAML config, assemble the registry, run until
//! interrupted.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use event_sentinel::{
    Config, DingtalkNotifier, LogNotifier, Registry, Runtime, SentinelError,
    services::{BscScanClient, PairCreatedListener, TransferListener},
};

#[tokio::main]
async fn main() -> Result<(), SentinelError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::load()?;

    let mut registry = Registry::new();
    registry.register_notifier(Arc::new(LogNotifier::new()));
    if !config.dingtalk_token.is_empty() {
        registry.register_notifier(Arc::new(DingtalkNotifier::new()));
    }
    if config.service_enabled("pair_created") {
        registry.register_service(Arc::new(PairCreatedListener::new()))?;
    }
    if config.service_enabled("transfer") {
        let mut transfer = TransferListener::new();
        if !config.bscscan_token.is_empty() {
            transfer = transfer.with_history(Arc::new(BscScanClient::new(config.bscscan_token.clone())));
        }
        registry.register_service(Arc::new(transfer))?;
    }
    if registry.is_empty() {
        info!("no services enabled, nothing to do");
        return Ok(());
    }

    let runtime = Runtime::connect(config, registry).await?;

    let cancel = runtime.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            cancel.cancel();
        }
    });

    runtime.run().await
}
