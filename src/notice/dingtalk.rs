use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::{
    EventContext, SentinelError, Service,
    notice::Notifier,
};

/// DingTalk robot webhook endpoint; the access token is appended as a query
/// parameter.
pub const DINGTALK_URL: &str = "https://oapi.dingtalk.com/robot/send";

/// A rendered DingTalk markdown message plus the robot token to send it
/// with.
#[derive(Debug, Clone)]
pub struct DingtalkMessage {
    pub token: String,
    pub title: String,
    pub text: String,
}

#[derive(Debug, Deserialize)]
struct DingtalkReply {
    errcode: i64,
    #[serde(default)]
    errmsg: String,
}

/// Notifier that posts markdown messages to a DingTalk robot webhook.
#[derive(Debug, Clone)]
pub struct DingtalkNotifier {
    http: reqwest::Client,
    url: String,
}

impl Default for DingtalkNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl DingtalkNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self { http: reqwest::Client::new(), url: DINGTALK_URL.to_owned() }
    }

    /// Override the webhook endpoint, for tests against a local server.
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

#[async_trait]
impl Notifier for DingtalkNotifier {
    fn name(&self) -> &str {
        "dingtalk"
    }

    async fn notify(&self, ctx: &EventContext, srv: &dyn Service) -> Result<(), SentinelError> {
        let Some(source) = srv.as_dingtalk_source() else {
            return Ok(());
        };
        let Some(message) = source.dingtalk_message(ctx) else {
            return Ok(());
        };

        let body = serde_json::json!({
            "msgtype": "markdown",
            "markdown": {
                "title": message.title,
                "text": message.text,
            },
            "at": {
                "atMobiles": [],
                "atUserIds": [],
                "isAtAll": false,
            },
        });

        debug!(service = srv.name(), title = %message.title, "posting DingTalk notice");

        let response = self
            .http
            .post(&self.url)
            .query(&[("access_token", message.token.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|err| SentinelError::Notice(err.to_string()))?;

        let reply: DingtalkReply =
            response.json().await.map_err(|err| SentinelError::Notice(err.to_string()))?;
        if reply.errcode != 0 {
            return Err(SentinelError::Notice(format!(
                "dingtalk rejected notice: {} ({})",
                reply.errmsg, reply.errcode
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::test_utils::RecordingService;

    #[test]
    fn reply_parsing_accepts_missing_errmsg() {
        let reply: DingtalkReply = serde_json::from_str(r#"{"errcode":0}"#).unwrap();
        assert_eq!(reply.errcode, 0);
        assert!(reply.errmsg.is_empty());
    }

    #[tokio::test]
    async fn skips_services_without_the_capability() {
        let srv = Arc::new(RecordingService::new("plain"));
        let notifier = DingtalkNotifier::new().with_url("http://127.0.0.1:1/unreachable");
        let ctx = EventContext::empty();
        // no capability, so no HTTP request is attempted at all
        assert!(notifier.notify(&ctx, srv.as_ref()).await.is_ok());
    }
}
