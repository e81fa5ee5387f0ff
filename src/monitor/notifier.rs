//! Alert notification channels
//!
//! Every channel is delivered to independently under its own timeout, so a
//! slow or failing channel never holds back the others.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::NotifyError;
use crate::models::{Alert, AlertSeverity};

/// Destination for raised alerts
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Channel name used in logs
    fn name(&self) -> &str;

    async fn deliver(&self, alert: &Alert) -> Result<(), NotifyError>;
}

/// Writes alerts to the tracing log
#[derive(Debug, Default, Clone)]
pub struct LogChannel;

#[async_trait]
impl NotificationChannel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), NotifyError> {
        match alert.severity {
            AlertSeverity::Critical => error!(
                component = "monitor",
                alert_id = %alert.id,
                alert_type = %alert.alert_type,
                "{}",
                alert.message
            ),
            AlertSeverity::Warning => warn!(
                component = "monitor",
                alert_id = %alert.id,
                alert_type = %alert.alert_type,
                "{}",
                alert.message
            ),
            AlertSeverity::Info => info!(
                component = "monitor",
                alert_id = %alert.id,
                alert_type = %alert.alert_type,
                "{}",
                alert.message
            ),
        }
        Ok(())
    }
}

/// POSTs alerts as JSON to a webhook endpoint
#[derive(Debug, Clone)]
pub struct WebhookChannel {
    client: Client,
    url: String,
}

impl WebhookChannel {
    /// Create a webhook channel with its own HTTP client
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, url))
    }

    /// Create a webhook channel with a custom reqwest Client
    pub fn with_client(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), NotifyError> {
        let response = self.client.post(&self.url).json(alert).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status(status.as_u16()));
        }
        debug!(component = "monitor", url = %self.url, alert_id = %alert.id, "Webhook delivered");
        Ok(())
    }
}

/// Deliver `alert` to every channel concurrently; returns the number of
/// channels that accepted it
pub async fn dispatch(
    channels: &[Arc<dyn NotificationChannel>],
    alert: &Alert,
    timeout: Duration,
) -> usize {
    let mut deliveries = JoinSet::new();
    for channel in channels {
        let channel = Arc::clone(channel);
        let alert = alert.clone();
        deliveries.spawn(async move {
            let result = match tokio::time::timeout(timeout, channel.deliver(&alert)).await {
                Ok(result) => result,
                Err(_) => Err(NotifyError::Timeout(timeout)),
            };
            if let Err(e) = &result {
                warn!(
                    component = "monitor",
                    action = "notify",
                    channel = channel.name(),
                    alert_id = %alert.id,
                    error = %e,
                    "Alert notification failed"
                );
            }
            result.is_ok()
        });
    }

    let mut delivered = 0;
    while let Some(joined) = deliveries.join_next().await {
        if matches!(joined, Ok(true)) {
            delivered += 1;
        }
    }
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AlertType;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn alert() -> Alert {
        Alert::new(
            AlertType::ConsecutiveFailures,
            AlertSeverity::Warning,
            "3 consecutive sync failures",
            serde_json::json!({ "consecutive_failures": 3 }),
        )
    }

    struct FailingChannel;

    #[async_trait]
    impl NotificationChannel for FailingChannel {
        fn name(&self) -> &str {
            "failing"
        }

        async fn deliver(&self, _alert: &Alert) -> Result<(), NotifyError> {
            Err(NotifyError::Channel("smtp down".to_string()))
        }
    }

    struct HangingChannel;

    #[async_trait]
    impl NotificationChannel for HangingChannel {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn deliver(&self, _alert: &Alert) -> Result<(), NotifyError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    // Test 1: Webhook posts the alert as JSON
    #[tokio::test]
    async fn test_webhook_posts_alert() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/alerts"))
            .and(body_partial_json(serde_json::json!({
                "type": "consecutive_failures",
                "severity": "warning"
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&mock_server)
            .await;

        let channel =
            WebhookChannel::new(format!("{}/alerts", mock_server.uri()), Duration::from_secs(5))
                .unwrap();
        assert!(channel.deliver(&alert()).await.is_ok());
    }

    // Test 2: Non-success status is an error
    #[tokio::test]
    async fn test_webhook_error_status() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&mock_server)
            .await;

        let channel = WebhookChannel::with_client(Client::new(), mock_server.uri());
        match channel.deliver(&alert()).await {
            Err(NotifyError::Status(500)) => {}
            other => panic!("expected status error, got {:?}", other),
        }
    }

    // Test 3: A failing channel does not prevent delivery to the others
    #[tokio::test]
    async fn test_dispatch_isolates_failures() {
        let channels: Vec<Arc<dyn NotificationChannel>> =
            vec![Arc::new(FailingChannel), Arc::new(LogChannel)];
        assert_eq!(dispatch(&channels, &alert(), Duration::from_secs(1)).await, 1);
    }

    // Test 4: A hanging channel times out
    #[tokio::test]
    async fn test_dispatch_times_out_hanging_channel() {
        tokio::time::pause();
        let channels: Vec<Arc<dyn NotificationChannel>> =
            vec![Arc::new(HangingChannel), Arc::new(LogChannel)];
        assert_eq!(dispatch(&channels, &alert(), Duration::from_secs(10)).await, 1);
    }
}
