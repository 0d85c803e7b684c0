use async_trait::async_trait;
use tracing::info;

use crate::{
    EventContext, SentinelError, Service,
    notice::Notifier,
};

/// Notifier that writes the notice content to the process log.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl LogNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, ctx: &EventContext, srv: &dyn Service) -> Result<(), SentinelError> {
        let Some(source) = srv.as_log_source() else {
            return Ok(());
        };
        if let Some(line) = source.log_line(ctx) {
            info!(service = srv.name(), "{line}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::test_utils::RecordingService;

    #[tokio::test]
    async fn skips_services_without_the_capability() {
        // RecordingService exposes no LogSource, so notify must be a no-op
        let srv = Arc::new(RecordingService::new("plain"));
        let notifier = LogNotifier::new();
        let ctx = EventContext::empty();
        assert!(notifier.notify(&ctx, srv.as_ref()).await.is_ok());
    }
}
