use std::{sync::Arc, time::Duration};

use event_sentinel::{ChainClient, Config, Registry, Runtime, SentinelError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const TEST_RESTART_DELAY: Duration = Duration::from_millis(10);

pub struct RunningRuntime {
    pub cancel: CancellationToken,
    pub handle: JoinHandle<Result<(), SentinelError>>,
}

impl RunningRuntime {
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.cancel.cancel();
        self.handle.await??;
        Ok(())
    }
}

/// Spawn a runtime over `client` with a short restart delay so failover
/// paths run at test speed.
pub fn start_runtime(config: Config, registry: Registry, client: Arc<dyn ChainClient>) -> RunningRuntime {
    let runtime =
        Runtime::with_client(config, registry, client).restart_delay(TEST_RESTART_DELAY);
    let cancel = runtime.cancel_token();
    let handle = tokio::spawn(runtime.run());
    RunningRuntime { cancel, handle }
}

/// Poll `cond` until it holds or the test times out.
pub async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Duration::from_secs(5);
    let poll = async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    if tokio::time::timeout(deadline, poll).await.is_err() {
        panic!("timed out waiting for {what}");
    }
}
