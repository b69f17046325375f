//! Error notifications: the only channel through which operators see
//! failures besides the structured log.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::assignment::RequestContext;
use crate::config::NotificationConfig;
use crate::error::{ReconcileError, Result};

/// Structured error notification published to the error sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorNotification {
    pub subject: String,
    pub handler: String,
    pub event_detail: serde_json::Value,
    pub error_details: String,
    pub request_id: uuid::Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caused_by: Option<uuid::Uuid>,
    pub emitted_at: DateTime<Utc>,
}

#[async_trait]
pub trait ErrorSink: Send + Sync {
    async fn publish(&self, notification: &ErrorNotification) -> Result<()>;
}

/// Writes notifications to the tracing log.
pub struct LogSink;

#[async_trait]
impl ErrorSink for LogSink {
    async fn publish(&self, notification: &ErrorNotification) -> Result<()> {
        tracing::error!(
            handler = %notification.handler,
            request_id = %notification.request_id,
            caused_by = ?notification.caused_by,
            event_detail = %notification.event_detail,
            "{}: {}",
            notification.subject,
            notification.error_details
        );
        Ok(())
    }
}

/// Keeps notifications in memory.
#[derive(Default)]
pub struct MemorySink {
    published: Mutex<Vec<ErrorNotification>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<ErrorNotification> {
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.published.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ErrorSink for MemorySink {
    async fn publish(&self, notification: &ErrorNotification) -> Result<()> {
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(notification.clone());
        Ok(())
    }
}

/// POSTs each notification as JSON to a webhook.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ReconcileError::Notification {
                reason: format!("failed to build http client: {e}"),
            })?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ErrorSink for WebhookSink {
    async fn publish(&self, notification: &ErrorNotification) -> Result<()> {
        self.client
            .post(&self.url)
            .json(notification)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ReconcileError::Notification {
                reason: format!("webhook {} rejected notification: {e}", self.url),
            })?;
        Ok(())
    }
}

/// Fans a notification out to every configured sink.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn ErrorSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn ErrorSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl ErrorSink for FanoutSink {
    async fn publish(&self, notification: &ErrorNotification) -> Result<()> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = sink.publish(notification).await {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// The log sink, plus a webhook when one is configured.
pub fn sink_from_config(config: &NotificationConfig) -> Result<Arc<dyn ErrorSink>> {
    match &config.webhook_url {
        Some(url) => Ok(Arc::new(FanoutSink::new(vec![
            Arc::new(LogSink),
            Arc::new(WebhookSink::new(url.clone())?),
        ]))),
        None => Ok(Arc::new(LogSink)),
    }
}

/// Builds notifications and publishes them. Reporting never fails: a sink
/// error is logged and swallowed so a handler can always return normally.
#[derive(Clone)]
pub struct Notifier {
    sink: Arc<dyn ErrorSink>,
    subject_prefix: String,
}

impl Notifier {
    pub fn new(sink: Arc<dyn ErrorSink>, subject_prefix: impl Into<String>) -> Self {
        Self {
            sink,
            subject_prefix: subject_prefix.into(),
        }
    }

    pub fn build<E: Serialize + ?Sized>(
        &self,
        handler: &str,
        context: &RequestContext,
        event_detail: &E,
        error: &(dyn std::fmt::Display + Sync),
    ) -> ErrorNotification {
        let event_detail = serde_json::to_value(event_detail)
            .unwrap_or_else(|e| serde_json::json!({ "unserializable": e.to_string() }));
        ErrorNotification {
            subject: format!("{} {} failed", self.subject_prefix, handler)
                .trim()
                .to_string(),
            handler: handler.to_string(),
            event_detail,
            error_details: error.to_string(),
            request_id: context.request_id,
            caused_by: context.caused_by,
            emitted_at: Utc::now(),
        }
    }

    pub async fn report<E: Serialize + ?Sized>(
        &self,
        handler: &str,
        context: &RequestContext,
        event_detail: &E,
        error: &(dyn std::fmt::Display + Sync),
    ) {
        let notification = self.build(handler, context, event_detail, error);
        if let Err(e) = self.sink.publish(&notification).await {
            tracing::warn!(
                handler,
                request_id = %context.request_id,
                "failed to publish error notification: {}",
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_report_carries_context() {
        let sink = Arc::new(MemorySink::new());
        let notifier = Notifier::new(sink.clone(), "[reconciler]");
        let ctx = RequestContext::root().child();
        notifier
            .report(
                "dispatch",
                &ctx,
                &serde_json::json!({ "account": "123456789012" }),
                &"boom",
            )
            .await;

        let published = sink.notifications();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].subject, "[reconciler] dispatch failed");
        assert_eq!(published[0].error_details, "boom");
        assert_eq!(published[0].request_id, ctx.request_id);
        assert_eq!(published[0].caused_by, ctx.caused_by);
        assert_eq!(published[0].event_detail["account"], "123456789012");
    }

    #[tokio::test]
    async fn test_fanout_reaches_every_sink() {
        let a = Arc::new(MemorySink::new());
        let b = Arc::new(MemorySink::new());
        let fanout = FanoutSink::new(vec![a.clone(), b.clone(), Arc::new(LogSink)]);
        let notifier = Notifier::new(Arc::new(fanout), "");
        notifier
            .report("tracker", &RequestContext::root(), &(), &"timeout")
            .await;
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert_eq!(a.notifications()[0].subject, "tracker failed");
    }

    #[tokio::test]
    async fn test_webhook_failure_is_swallowed_by_notifier() {
        let sink = WebhookSink::new("http://127.0.0.1:9/unreachable").unwrap();
        let notifier = Notifier::new(Arc::new(sink), "");
        notifier
            .report("dispatch", &RequestContext::root(), &(), &"boom")
            .await;
    }
}
