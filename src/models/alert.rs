//! Alert models raised by the sync monitor

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Rule that raised an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    ConsecutiveFailures,
    HighErrorRate,
    SlowResponse,
    CriticalHealth,
    SystemFailure,
    DeliveryExhausted,
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AlertType::ConsecutiveFailures => "consecutive_failures",
            AlertType::HighErrorRate => "high_error_rate",
            AlertType::SlowResponse => "slow_response",
            AlertType::CriticalHealth => "critical_health",
            AlertType::SystemFailure => "system_failure",
            AlertType::DeliveryExhausted => "delivery_exhausted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// A raised alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,

    #[serde(rename = "type")]
    pub alert_type: AlertType,

    pub severity: AlertSeverity,

    pub message: String,

    /// Rule-specific context
    #[serde(default)]
    pub details: serde_json::Value,

    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub acknowledged: bool,

    pub acknowledged_at: Option<DateTime<Utc>>,
}

impl Alert {
    /// Create an unacknowledged alert with a fresh id
    pub fn new(
        alert_type: AlertType,
        severity: AlertSeverity,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            alert_type,
            severity,
            message: message.into(),
            details,
            timestamp: Utc::now(),
            acknowledged: false,
            acknowledged_at: None,
        }
    }
}
